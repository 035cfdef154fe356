//! CLI commands for chatq using clap.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};

use crate::config::{load_settings, Settings};
use crate::core::{
    ConversationKey, Envelope, MessageContext, MessageHandler, Producer, QueueStore, WorkerPool,
};
use crate::logging;
use crate::store::{SqliteStore, Store};

/// chatq - lease-based per-conversation message queue.
#[derive(Parser, Debug)]
#[command(name = "chatq")]
#[command(version = "0.1.0")]
#[command(about = "Per-conversation FIFO queue with a concurrent worker pool", long_about = None)]
pub struct Commands {
    /// Path to the settings file
    #[arg(long, global = true, env = "CHATQ_CONF")]
    pub conf: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enqueue a message for a conversation
    Put {
        /// Conversation key (e.g. chat id)
        key: String,

        /// Payload; parsed as JSON, taken as a plain string otherwise
        payload: String,

        /// Trace id to attach; a fresh one is generated when omitted
        #[arg(long)]
        trace_id: Option<String>,
    },

    /// Show queue statistics
    Stats,

    /// Show the pending messages and lease of a conversation
    Show {
        /// Conversation key
        key: String,
    },

    /// Run the worker pool until interrupted
    Run {
        /// Override queue.workers_num
        #[arg(long)]
        workers: Option<usize>,
    },
}

impl Commands {
    pub async fn run(self) -> Result<()> {
        let mut settings = load_settings(self.conf.as_deref())?;
        let _guard = logging::init(&settings.logging)?;

        let store: Arc<dyn Store> = Arc::new(SqliteStore::from_settings(&settings.store)?);

        match self.command {
            Command::Put {
                key,
                payload,
                trace_id,
            } => {
                let trace_id = trace_id.unwrap_or_else(|| ulid::Ulid::new().to_string());
                let producer: Producer<serde_json::Value> = Producer::new(store);
                producer
                    .put(key.as_str(), parse_payload(&payload), trace_id.as_str())
                    .await?;
                println!("Enqueued message for {} (trace {})", key, trace_id);
            }
            Command::Stats => {
                let queue: QueueStore<serde_json::Value> = QueueStore::new(store, &settings.queue);
                println!("{}", queue.stats().await?);
            }
            Command::Show { key } => {
                let queue: QueueStore<serde_json::Value> = QueueStore::new(store, &settings.queue);
                match queue.peek(&ConversationKey::new(key.as_str())).await? {
                    Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
                    None => println!("No pending messages for {}", key),
                }
            }
            Command::Run { workers } => {
                if let Some(workers) = workers {
                    settings.queue.workers_num = workers.max(1);
                }
                run_workers(store, &settings).await?;
            }
        }

        Ok(())
    }
}

fn parse_payload(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Logs every message it receives.
struct LogHandler;

#[async_trait]
impl MessageHandler<serde_json::Value> for LogHandler {
    async fn handle(
        &self,
        ctx: MessageContext,
        envelope: Envelope<serde_json::Value>,
    ) -> Result<()> {
        tracing::info!(
            key = %ctx.key,
            created_at = envelope.created_at,
            "Message: {}",
            envelope.payload
        );
        Ok(())
    }
}

async fn run_workers(store: Arc<dyn Store>, settings: &Settings) -> Result<()> {
    tracing::info!("Starting {}", settings.service_name);

    let queue: Arc<QueueStore<serde_json::Value>> =
        Arc::new(QueueStore::new(store, &settings.queue));
    let mut pool = WorkerPool::new(queue, &settings.queue, Arc::new(LogHandler));
    pool.start();

    wait_for_shutdown().await?;
    pool.stop().await;
    Ok(())
}

/// Block until SIGINT (or SIGTERM on unix).
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Received shutdown signal: SIGINT");
            }
            _ = terminate.recv() => tracing::info!("Received shutdown signal: SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received shutdown signal: Ctrl+C");
    }

    Ok(())
}
