//! In-process store.
//!
//! Keeps documents in a mutex-guarded map. Only one process can see the queue, so this is
//! meant for tests and for embedding the queue where durability does not matter.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Filter, Store, Update};
use crate::core::envelope::{ConversationKey, QueueDocument, StoredEnvelope};
use crate::error::{Error, Result};

type Documents = BTreeMap<ConversationKey, QueueDocument>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<Documents>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Store("memory store lock poisoned".to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Documents>> {
        self.docs.lock().map_err(poison_err)
    }
}

/// Key of the matching document with the oldest head; first key wins ties.
fn select(docs: &Documents, filter: &Filter) -> Option<ConversationKey> {
    docs.values()
        .filter(|doc| filter.matches(doc))
        .min_by_key(|doc| doc.head_created_at())
        .map(|doc| doc.key.clone())
}

#[async_trait]
impl Store for MemoryStore {
    async fn push(&self, key: &ConversationKey, envelope: StoredEnvelope) -> Result<()> {
        let mut docs = self.lock()?;
        docs.entry(key.clone())
            .or_insert_with(|| QueueDocument::new(key.clone()))
            .pending
            .push(envelope);
        Ok(())
    }

    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
    ) -> Result<Option<QueueDocument>> {
        let mut docs = self.lock()?;
        let Some(key) = select(&docs, filter) else {
            return Ok(None);
        };
        let Some(doc) = docs.get_mut(&key) else {
            return Ok(None);
        };
        let before = doc.clone();
        update.apply(doc);
        Ok(Some(before))
    }

    async fn update_one(&self, filter: &Filter, update: &Update) -> Result<bool> {
        let mut docs = self.lock()?;
        match docs.values_mut().find(|doc| filter.matches(doc)) {
            Some(doc) => {
                update.apply(doc);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_one(&self, filter: &Filter) -> Result<bool> {
        let mut docs = self.lock()?;
        let key = docs
            .values()
            .find(|doc| filter.matches(doc))
            .map(|doc| doc.key.clone());
        Ok(key.and_then(|key| docs.remove(&key)).is_some())
    }

    async fn get(&self, key: &ConversationKey) -> Result<Option<QueueDocument>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<QueueDocument>> {
        Ok(self.lock()?.values().cloned().collect())
    }
}
