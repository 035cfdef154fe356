//! SQLite-backed store.
//!
//! Each collection (named queue) is a table with one row per conversation. The pending
//! list is a JSON array; the head envelope's timestamp and the lease are kept in their own
//! columns so selection and conditional updates are plain indexed SQL. Mutations run in
//! `BEGIN IMMEDIATE` transactions, which serialize writers across every process sharing
//! the database file.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use super::{Filter, Store, Update};
use crate::config::StoreSettings;
use crate::core::envelope::{ConversationKey, Lease, LeaseId, QueueDocument, StoredEnvelope};
use crate::error::{Error, Result};

const COLUMNS: &str = "key, pending, lease_id, lease_started_at";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

/// Collection names become table names, so only plain identifiers are accepted.
pub fn validate_collection(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid collection name '{}'", name)))
    }
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and the collection's table.
    pub fn open(path: &Path, collection: &str, busy_timeout: Duration) -> Result<Self> {
        validate_collection(collection)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::init(conn, collection)
    }

    /// Open the store described by `settings`.
    pub fn from_settings(settings: &StoreSettings) -> Result<Self> {
        let path = settings.db_path()?;
        let store = Self::open(&path, &settings.collection, settings.busy_timeout())?;
        tracing::debug!(
            "Opened queue store {} (collection {})",
            path.display(),
            settings.collection
        );
        Ok(store)
    }

    /// Private in-memory database.
    pub fn open_in_memory(collection: &str) -> Result<Self> {
        validate_collection(collection)?;
        Self::init(Connection::open_in_memory()?, collection)
    }

    fn init(conn: Connection, table: &str) -> Result<Self> {
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                pending TEXT NOT NULL,
                head_created_at INTEGER,
                lease_id TEXT,
                lease_started_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_head ON {table}(head_created_at);
            CREATE INDEX IF NOT EXISTS idx_{table}_lease ON {table}(lease_id);
            "#
        ))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| Error::Store("sqlite connection lock poisoned".to_string()))?;
            f(&mut conn, &table)
        })
        .await?
    }
}

fn where_clause(filter: &Filter) -> (&'static str, Value) {
    match filter {
        Filter::Claimable { stale_before } => (
            "lease_id IS NULL OR lease_started_at < ?1",
            Value::Integer(*stale_before),
        ),
        Filter::Lease(id) => ("lease_id = ?1", Value::Text(id.to_string())),
        Filter::DrainedLease(id) => (
            "lease_id = ?1 AND head_created_at IS NULL",
            Value::Text(id.to_string()),
        ),
    }
}

struct RawRow {
    key: String,
    pending: String,
    lease_id: Option<String>,
    lease_started_at: Option<i64>,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            pending: row.get(1)?,
            lease_id: row.get(2)?,
            lease_started_at: row.get(3)?,
        })
    }

    fn into_document(self) -> Result<QueueDocument> {
        let lease = match (self.lease_id, self.lease_started_at) {
            (Some(id), Some(started_at)) => Some(Lease {
                id: LeaseId::from(id),
                started_at,
            }),
            _ => None,
        };
        Ok(QueueDocument {
            key: ConversationKey::from(self.key),
            pending: serde_json::from_str(&self.pending)?,
            lease,
        })
    }
}

/// Select the first matching document, oldest head first.
fn select(tx: &Transaction<'_>, table: &str, filter: &Filter) -> Result<Option<QueueDocument>> {
    let (clause, param) = where_clause(filter);
    let sql = format!(
        "SELECT {COLUMNS} FROM {table} WHERE {clause} ORDER BY head_created_at ASC, key ASC LIMIT 1"
    );
    tx.query_row(&sql, [param], RawRow::from_row)
        .optional()?
        .map(RawRow::into_document)
        .transpose()
}

fn write(tx: &Transaction<'_>, table: &str, doc: &QueueDocument) -> Result<()> {
    tx.execute(
        &format!(
            "UPDATE {table} SET pending = ?2, head_created_at = ?3, lease_id = ?4, lease_started_at = ?5 WHERE key = ?1"
        ),
        params![
            doc.key.as_str(),
            serde_json::to_string(&doc.pending)?,
            doc.head_created_at(),
            doc.lease.as_ref().map(|l| l.id.to_string()),
            doc.lease.as_ref().map(|l| l.started_at),
        ],
    )?;
    Ok(())
}

/// Select, mutate and write back one document inside a single write transaction.
/// Returns the document as it was before the update.
fn modify_one(
    conn: &mut Connection,
    table: &str,
    filter: &Filter,
    update: &Update,
) -> Result<Option<QueueDocument>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let Some(before) = select(&tx, table, filter)? else {
        return Ok(None);
    };
    let mut after = before.clone();
    update.apply(&mut after);
    write(&tx, table, &after)?;
    tx.commit()?;
    Ok(Some(before))
}

#[async_trait]
impl Store for SqliteStore {
    async fn push(&self, key: &ConversationKey, envelope: StoredEnvelope) -> Result<()> {
        let key = key.to_string();
        let created_at = envelope.created_at;
        let envelope = serde_json::to_string(&envelope)?;
        self.run(move |conn, table| {
            conn.execute(
                &format!(
                    r#"
                    INSERT INTO {table} (key, pending, head_created_at)
                    VALUES (?1, json_array(json(?2)), ?3)
                    ON CONFLICT(key) DO UPDATE SET
                        pending = json_insert(pending, '$[#]', json(?2)),
                        head_created_at = COALESCE(head_created_at, ?3)
                    "#
                ),
                params![key, envelope, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
    ) -> Result<Option<QueueDocument>> {
        let filter = filter.clone();
        let update = update.clone();
        self.run(move |conn, table| modify_one(conn, table, &filter, &update))
            .await
    }

    async fn update_one(&self, filter: &Filter, update: &Update) -> Result<bool> {
        let filter = filter.clone();
        let update = update.clone();
        self.run(move |conn, table| Ok(modify_one(conn, table, &filter, &update)?.is_some()))
            .await
    }

    async fn delete_one(&self, filter: &Filter) -> Result<bool> {
        let (clause, param) = where_clause(filter);
        self.run(move |conn, table| {
            let deleted = conn.execute(
                &format!(
                    "DELETE FROM {table} WHERE key IN (SELECT key FROM {table} WHERE {clause} LIMIT 1)"
                ),
                [param],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn get(&self, key: &ConversationKey) -> Result<Option<QueueDocument>> {
        let key = key.to_string();
        self.run(move |conn, table| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM {table} WHERE key = ?1"),
                [key],
                RawRow::from_row,
            )
            .optional()?
            .map(RawRow::into_document)
            .transpose()
        })
        .await
    }

    async fn list(&self) -> Result<Vec<QueueDocument>> {
        self.run(|conn, table| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM {table} ORDER BY key"))?;
            let rows = stmt
                .query_map([], RawRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(RawRow::into_document).collect()
        })
        .await
    }
}
