//! chatq library root.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod store;

pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use self::core::{
    handler_fn, Claimed, ConversationKey, Envelope, LeaseId, MessageContext, MessageHandler,
    Producer, QueueStore, WorkerPool,
};
pub use error::{Error, Result};
pub use store::{MemoryStore, SqliteStore, Store};
