//! Producer side of the queue.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;

use super::clock::{Clock, SystemClock};
use super::envelope::{ConversationKey, Envelope};
use crate::error::Result;
use crate::store::Store;

/// Appends envelopes to conversation queues.
pub struct Producer<P> {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    _payload: PhantomData<fn(P)>,
}

impl<P> Clone for Producer<P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P: Serialize> Producer<P> {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            _payload: PhantomData,
        }
    }

    /// Append `payload` to the conversation's pending list, creating the conversation if
    /// it does not exist yet.
    pub async fn put(
        &self,
        key: impl Into<ConversationKey>,
        payload: P,
        trace_id: impl Into<String>,
    ) -> Result<()> {
        let key = key.into();
        let envelope = Envelope {
            payload,
            created_at: self.clock.now_millis(),
            trace_id: trace_id.into(),
        };
        self.store.push(&key, envelope.encode()?).await?;
        tracing::debug!(key = %key, trace_id = %envelope.trace_id, "Enqueued message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_upserts_and_stamps() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let producer: Producer<String> = Producer::with_clock(store.clone(), clock.clone());

        producer.put(42_i64, "first".to_string(), "req-1").await.unwrap();
        clock.advance(5);
        producer.put(42_i64, "second".to_string(), "req-2").await.unwrap();

        let doc = store.get(&ConversationKey::from(42_i64)).await.unwrap().unwrap();
        assert_eq!(doc.pending.len(), 2);
        assert_eq!(doc.pending[0].payload, json!("first"));
        assert_eq!(doc.pending[0].created_at, 1_000);
        assert_eq!(doc.pending[0].trace_id, "req-1");
        assert_eq!(doc.pending[1].created_at, 1_005);
        assert!(doc.lease.is_none());
    }

    #[tokio::test]
    async fn test_put_keeps_keys_apart() {
        let store = Arc::new(MemoryStore::new());
        let producer: Producer<u32> = Producer::new(store.clone());

        producer.put("a", 1, "t").await.unwrap();
        producer.put("b", 2, "t").await.unwrap();

        assert_eq!(store.list().await.unwrap().len(), 2);
        let a = store.get(&"a".into()).await.unwrap().unwrap();
        assert_eq!(a.pending[0].payload, json!(1));
    }
}
