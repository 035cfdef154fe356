//! Document store backing the conversation queue.
//!
//! A store keeps one [`QueueDocument`] per conversation key and offers the handful of
//! conditional operations the queue protocol is built from. Every operation is atomic
//! with respect to every other operation on the same store, across tasks and (for the
//! SQLite backend) across processes.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::core::envelope::{ConversationKey, Lease, LeaseId, QueueDocument, StoredEnvelope};
use crate::error::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Document selector.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// No lease, or a lease started strictly before `stale_before`.
    Claimable { stale_before: i64 },

    /// Holding the given lease.
    Lease(LeaseId),

    /// Holding the given lease with nothing left pending.
    DrainedLease(LeaseId),
}

impl Filter {
    pub fn matches(&self, doc: &QueueDocument) -> bool {
        match self {
            Filter::Claimable { stale_before } => doc
                .lease
                .as_ref()
                .map_or(true, |lease| lease.is_stale(*stale_before)),
            Filter::Lease(id) => holds(doc, id),
            Filter::DrainedLease(id) => doc.pending.is_empty() && holds(doc, id),
        }
    }
}

fn holds(doc: &QueueDocument, id: &LeaseId) -> bool {
    doc.lease.as_ref().map_or(false, |lease| &lease.id == id)
}

/// Document mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Remove the head envelope (if any) and install the lease.
    PopHead(Lease),

    /// Remove the lease.
    ClearLease,
}

impl Update {
    pub fn apply(&self, doc: &mut QueueDocument) {
        match self {
            Update::PopHead(lease) => {
                if !doc.pending.is_empty() {
                    doc.pending.remove(0);
                }
                doc.lease = Some(lease.clone());
            }
            Update::ClearLease => doc.lease = None,
        }
    }
}

/// Conversation document store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append an envelope to the key's pending list, creating the document if absent.
    async fn push(&self, key: &ConversationKey, envelope: StoredEnvelope) -> Result<()>;

    /// Among documents matching `filter`, pick the one whose head envelope is oldest,
    /// apply `update` and return the document as it was *before* the update.
    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
    ) -> Result<Option<QueueDocument>>;

    /// Apply `update` to one matching document. Returns whether one matched.
    async fn update_one(&self, filter: &Filter, update: &Update) -> Result<bool>;

    /// Delete one matching document. Returns whether one matched.
    async fn delete_one(&self, filter: &Filter) -> Result<bool>;

    async fn get(&self, key: &ConversationKey) -> Result<Option<QueueDocument>>;

    /// All documents, ordered by key.
    async fn list(&self) -> Result<Vec<QueueDocument>>;
}
