//! Core module - the conversation queue and its consumers.
//!
//! - Envelope, lease and document types
//! - Producer (append) and QueueStore (claim/finish)
//! - Worker pool draining the queue

pub mod clock;
pub mod envelope;
pub mod producer;
pub mod queue;
pub mod reader;

pub use envelope::{ConversationKey, Envelope, Lease, LeaseId, QueueDocument, StoredEnvelope};
pub use producer::Producer;
pub use queue::{Claimed, QueueStats, QueueStore};
pub use reader::{handler_fn, MessageContext, MessageHandler, WorkerPool};
