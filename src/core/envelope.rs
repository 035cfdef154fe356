//! Conversation documents, envelopes and leases.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifier grouping an ordered sequence of envelopes (usually a chat id).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for ConversationKey {
    fn from(chat_id: i64) -> Self {
        Self(chat_id.to_string())
    }
}

impl From<&str> for ConversationKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ConversationKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Opaque lease token.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct LeaseId(String);

impl LeaseId {
    /// Generate a fresh random token.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LeaseId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Exclusive, time-bounded claim on a conversation's head envelope.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,

    /// Unix timestamp (ms)
    pub started_at: i64,
}

impl Lease {
    pub fn new(started_at: i64) -> Self {
        Self {
            id: LeaseId::generate(),
            started_at,
        }
    }

    /// A lease is stale once it started strictly before `stale_before`.
    pub fn is_stale(&self, stale_before: i64) -> bool {
        self.started_at < stale_before
    }
}

/// An envelope as the store keeps it: the payload is an uninterpreted JSON value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoredEnvelope {
    pub payload: serde_json::Value,

    /// Unix timestamp (ms)
    pub created_at: i64,

    /// Correlates the envelope with the request that produced it
    pub trace_id: String,
}

impl StoredEnvelope {
    /// Decode the payload into the caller's type.
    pub fn decode<P: DeserializeOwned>(self) -> Result<Envelope<P>> {
        Ok(Envelope {
            payload: serde_json::from_value(self.payload)?,
            created_at: self.created_at,
            trace_id: self.trace_id,
        })
    }
}

/// One queued unit of work.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope<P> {
    pub payload: P,
    pub created_at: i64,
    pub trace_id: String,
}

impl<P: Serialize> Envelope<P> {
    pub fn encode(&self) -> Result<StoredEnvelope> {
        Ok(StoredEnvelope {
            payload: serde_json::to_value(&self.payload)?,
            created_at: self.created_at,
            trace_id: self.trace_id.clone(),
        })
    }
}

/// Per-conversation document: pending envelopes in creation order plus an optional lease.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct QueueDocument {
    pub key: ConversationKey,

    #[serde(default)]
    pub pending: Vec<StoredEnvelope>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

impl QueueDocument {
    pub fn new(key: ConversationKey) -> Self {
        Self {
            key,
            pending: Vec::new(),
            lease: None,
        }
    }

    /// Creation time of the oldest pending envelope. Empty documents yield `None`,
    /// which orders before any timestamp.
    pub fn head_created_at(&self) -> Option<i64> {
        self.pending.first().map(|e| e.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lease_staleness_is_strict() {
        let lease = Lease {
            id: LeaseId::generate(),
            started_at: 1_000,
        };

        assert!(!lease.is_stale(1_000));
        assert!(lease.is_stale(1_001));
    }

    #[test]
    fn test_lease_ids_are_unique() {
        assert_ne!(LeaseId::generate(), LeaseId::generate());
    }

    #[test]
    fn test_document_shape() {
        let mut doc = QueueDocument::new(ConversationKey::from(7_i64));
        doc.pending.push(StoredEnvelope {
            payload: json!({"text": "hi"}),
            created_at: 10,
            trace_id: "req-1".to_string(),
        });

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            value,
            json!({
                "key": "7",
                "pending": [{"payload": {"text": "hi"}, "created_at": 10, "trace_id": "req-1"}]
            })
        );

        doc.lease = Some(Lease {
            id: LeaseId::from("abc".to_string()),
            started_at: 20,
        });
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["lease"], json!({"id": "abc", "started_at": 20}));
    }

    #[test]
    fn test_head_created_at() {
        let mut doc = QueueDocument::new("chat".into());
        assert_eq!(doc.head_created_at(), None);

        for ts in [5, 9] {
            doc.pending.push(StoredEnvelope {
                payload: json!(null),
                created_at: ts,
                trace_id: String::new(),
            });
        }
        assert_eq!(doc.head_created_at(), Some(5));
        assert!(None < Some(i64::MIN));
    }

    #[test]
    fn test_decode_payload() {
        let stored = StoredEnvelope {
            payload: json!(["a", "b"]),
            created_at: 1,
            trace_id: "t".to_string(),
        };

        let envelope: Envelope<Vec<String>> = stored.clone().decode().unwrap();
        assert_eq!(envelope.payload, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(envelope.encode().unwrap(), stored);

        assert!(stored.decode::<u32>().is_err());
    }
}
