//! Lease-based conversation queue.
//!
//! Consumers take work with [`QueueStore::claim`] and release it with
//! [`QueueStore::finish`]:
//!
//! - A claim picks a conversation with no lease (or a stale one), preferring the one whose
//!   head envelope has waited longest, pops that envelope and installs a fresh lease. All of
//!   it is one store operation, so two claimants never get the same envelope.
//! - While a lease is active the conversation is invisible to other claims, which keeps
//!   per-conversation processing strictly sequential.
//! - Finish deletes the conversation if nothing is pending, otherwise it clears the lease.
//!   Both are conditioned on the lease id, so finishing a lease that was superseded (or
//!   already finished) is a harmless no-op.
//!
//! A lease older than the processing window is taken over by the next claim. The envelope
//! popped by the previous holder is not restored: a crashed worker loses at most that one
//! envelope and the conversation continues with the next one.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use super::clock::{Clock, SystemClock};
use super::envelope::{ConversationKey, Envelope, Lease, LeaseId, QueueDocument};
use crate::config::QueueSettings;
use crate::error::Result;
use crate::store::{Filter, Store, Update};

/// An envelope taken off a conversation queue, together with the lease guarding it.
#[derive(Debug, Clone, PartialEq)]
pub struct Claimed<P> {
    pub key: ConversationKey,
    pub envelope: Envelope<P>,
    pub lease_id: LeaseId,
}

/// Claim/finish protocol over a [`Store`].
pub struct QueueStore<P> {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    max_processing_time: i64,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Clone for QueueStore<P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            max_processing_time: self.max_processing_time,
            _payload: PhantomData,
        }
    }
}

impl<P: DeserializeOwned> QueueStore<P> {
    pub fn new(store: Arc<dyn Store>, settings: &QueueSettings) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), settings.processing_window())
    }

    pub fn with_clock(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        max_processing_time: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            max_processing_time: i64::try_from(max_processing_time.as_millis())
                .unwrap_or(i64::MAX),
            _payload: PhantomData,
        }
    }

    /// Take the next envelope, or `None` when no conversation is claimable.
    pub async fn claim(&self) -> Result<Option<Claimed<P>>> {
        let now = self.clock.now_millis();
        let stale_before = now.saturating_sub(self.max_processing_time);
        let lease = Lease::new(now);
        let lease_id = lease.id.clone();

        let Some(doc) = self
            .store
            .find_one_and_update(&Filter::Claimable { stale_before }, &Update::PopHead(lease))
            .await?
        else {
            return Ok(None);
        };

        let QueueDocument {
            key,
            pending,
            lease: previous,
        } = doc;

        if let Some(previous) = previous {
            tracing::error!(
                key = %key,
                lease_id = %previous.id,
                age_ms = now - previous.started_at,
                "Processing for conversation took too long, lease taken over"
            );
        }

        let Some(head) = pending.into_iter().next() else {
            tracing::warn!(key = %key, "Got conversation without messages, finishing it");
            self.finish(&lease_id).await?;
            return Ok(None);
        };

        match head.decode() {
            Ok(envelope) => Ok(Some(Claimed {
                key,
                envelope,
                lease_id,
            })),
            Err(e) => {
                tracing::error!(key = %key, "Dropping undecodable message: {}", e);
                self.finish(&lease_id).await?;
                Err(e)
            }
        }
    }
}

impl<P> QueueStore<P> {
    /// Release a lease. Unknown or superseded leases are ignored.
    pub async fn finish(&self, lease_id: &LeaseId) -> Result<()> {
        if self
            .store
            .delete_one(&Filter::DrainedLease(lease_id.clone()))
            .await?
        {
            tracing::debug!(lease_id = %lease_id, "Conversation drained and removed");
            return Ok(());
        }

        if self
            .store
            .update_one(&Filter::Lease(lease_id.clone()), &Update::ClearLease)
            .await?
        {
            tracing::debug!(lease_id = %lease_id, "Lease released");
            return Ok(());
        }

        tracing::warn!(
            lease_id = %lease_id,
            "Conversation with this lease no longer exists"
        );
        Ok(())
    }

    /// Current document of a conversation.
    pub async fn peek(&self, key: &ConversationKey) -> Result<Option<QueueDocument>> {
        self.store.get(key).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let stale_before = self
            .clock
            .now_millis()
            .saturating_sub(self.max_processing_time);
        let mut stats = QueueStats::default();

        for doc in self.store.list().await? {
            stats.conversations += 1;
            stats.pending += doc.pending.len();
            match &doc.lease {
                Some(lease) if lease.is_stale(stale_before) => stats.stale += 1,
                Some(_) => stats.leased += 1,
                None => {}
            }
        }

        Ok(stats)
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub conversations: usize,
    pub pending: usize,
    pub leased: usize,
    pub stale: usize,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Queue Stats:\n")?;
        write!(f, "  Conversations: {}\n", self.conversations)?;
        write!(f, "  Pending:       {}\n", self.pending)?;
        write!(f, "  Leased:        {}\n", self.leased)?;
        write!(f, "  Stale leases:  {}", self.stale)
    }
}
