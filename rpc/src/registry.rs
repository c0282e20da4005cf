//! Correlation registry.
//!
//! Maps in-flight correlation ids to one-shot reply slots. The reply pump
//! resolves slots as replies arrive, in any order; each caller suspends
//! only on its own slot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::trace;

use shardledger_common::{CorrelationId, LedgerError, Result};

struct Slot {
    created_at: Instant,
    reply: oneshot::Sender<Vec<u8>>,
}

/// Table of outstanding requests. Clones share the same table.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    slots: Arc<DashMap<CorrelationId, Slot>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh correlation id with an empty reply slot.
    pub fn begin(&self) -> PendingReply {
        let id = CorrelationId::new();
        let (reply, receiver) = oneshot::channel();
        self.slots.insert(
            id,
            Slot {
                created_at: Instant::now(),
                reply,
            },
        );
        PendingReply {
            id,
            receiver,
            registry: self.clone(),
        }
    }

    /// Deliver a reply to its waiter. Returns `false` when nobody waits for
    /// `id` any more (late, duplicate or foreign reply); the payload is dropped.
    pub fn resolve(&self, id: &CorrelationId, payload: Vec<u8>) -> bool {
        match self.slots.remove(id) {
            Some((_, slot)) => slot.reply.send(payload).is_ok(),
            None => {
                trace!(correlation_id = %id, "No waiter for reply");
                false
            }
        }
    }

    /// Like [`resolve`](Self::resolve) for the raw property value.
    pub fn resolve_raw(&self, id: Option<&str>, payload: Vec<u8>) -> bool {
        match id.and_then(|raw| CorrelationId::parse(raw).ok()) {
            Some(id) => self.resolve(&id, payload),
            None => false,
        }
    }

    /// Number of calls awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Age of the longest outstanding call.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.slots
            .iter()
            .map(|entry| entry.value().created_at.elapsed())
            .max()
    }

    fn forget(&self, id: &CorrelationId) {
        self.slots.remove(id);
    }
}

/// A caller's claim on one reply. Dropping it releases the slot.
pub struct PendingReply {
    id: CorrelationId,
    receiver: oneshot::Receiver<Vec<u8>>,
    registry: CorrelationRegistry,
}

impl PendingReply {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Wait for the reply payload, at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Vec<u8>> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(LedgerError::Connection("reply slot dropped".to_string())),
            Err(_) => Err(LedgerError::Timeout {
                operation: format!("reply for {}", self.id),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.registry.forget(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_wakes_matching_waiter() {
        let registry = CorrelationRegistry::new();
        let pending = registry.begin();
        let id = pending.id();

        assert!(registry.resolve(&id, b"reply".to_vec()));
        assert_eq!(pending.wait(Duration::from_secs(1)).await.unwrap(), b"reply");
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_replies_reach_their_callers() {
        let registry = CorrelationRegistry::new();
        let a = registry.begin();
        let b = registry.begin();

        assert!(registry.resolve(&b.id(), b"B".to_vec()));
        assert!(registry.resolve(&a.id(), b"A".to_vec()));

        assert_eq!(a.wait(Duration::from_secs(1)).await.unwrap(), b"A");
        assert_eq!(b.wait(Duration::from_secs(1)).await.unwrap(), b"B");
    }

    #[tokio::test]
    async fn test_timeout_releases_slot_and_drops_late_reply() {
        let registry = CorrelationRegistry::new();
        let pending = registry.begin();
        let id = pending.id();

        let err = pending.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Timeout { .. }));
        assert_eq!(registry.in_flight(), 0);
        assert!(!registry.resolve(&id, b"late".to_vec()));
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_replies_are_ignored() {
        let registry = CorrelationRegistry::new();
        let pending = registry.begin();
        let id = pending.id();

        assert!(registry.resolve(&id, b"first".to_vec()));
        assert!(!registry.resolve(&id, b"second".to_vec()));
        assert!(!registry.resolve(&CorrelationId::new(), b"stray".to_vec()));
        assert!(!registry.resolve_raw(Some("not-a-uuid"), b"junk".to_vec()));
        assert!(!registry.resolve_raw(None, b"junk".to_vec()));

        assert_eq!(pending.wait(Duration::from_secs(1)).await.unwrap(), b"first");
    }

    #[test]
    fn test_abandoned_wait_releases_slot() {
        let registry = CorrelationRegistry::new();
        let pending = registry.begin();
        assert_eq!(registry.in_flight(), 1);
        assert!(registry.oldest_age().is_some());
        drop(pending);
        assert_eq!(registry.in_flight(), 0);
        assert!(registry.oldest_age().is_none());
    }
}
