//! In-process store backed by `DashMap`.
//!
//! Each atomic operation holds the shard lock of the key it touches, which
//! gives the same single-step semantics the Redis scripts provide.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::{CasOutcome, ClaimOutcome, DedupStore, GateStore, StoreError};
use crate::chat::MessageRef;
use crate::gate::{GateStatus, GateStatusRecord};

/// Default retention of the posted set.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
enum DedupEntry {
    Claimed { owner: String, expires_at: Instant },
    Posted(MessageRef),
}

/// Store for tests and single-instance deployments.
///
/// The posted set expires as a whole, like the Redis set: every
/// `mark_posted` pushes the deadline out by the dedup TTL, and once the
/// deadline passes all posted markers are forgotten together.
pub struct MemoryStore {
    gates: DashMap<String, GateStatusRecord>,
    dedup: DashMap<String, DedupEntry>,
    posted_deadline: Mutex<Option<Instant>>,
    dedup_ttl: Duration,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("gates", &self.gates.len())
            .field("dedup_entries", &self.dedup.len())
            .field("dedup_ttl", &self.dedup_ttl)
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL)
    }
}

impl MemoryStore {
    /// Creates an empty store with the given posted-set retention.
    #[must_use]
    pub fn new(dedup_ttl: Duration) -> Self {
        Self {
            gates: DashMap::new(),
            dedup: DashMap::new(),
            posted_deadline: Mutex::new(None),
            dedup_ttl,
        }
    }

    /// Number of gate records held.
    #[must_use]
    pub fn gate_count(&self) -> usize {
        self.gates.len()
    }

    fn posted_set_alive(&self, now: Instant) -> bool {
        self.posted_deadline
            .lock()
            .map(|deadline| deadline.is_some_and(|d| now < d))
            .unwrap_or(false)
    }

    fn lock_error() -> StoreError {
        StoreError::Backend {
            reason: "posted set lock poisoned".to_string(),
        }
    }
}

// ============================================================================
// GateStore
// ============================================================================

#[async_trait]
impl GateStore for MemoryStore {
    async fn insert_pending(&self, record: &GateStatusRecord) -> Result<bool, StoreError> {
        match self.gates.entry(record.request_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn get(&self, request_id: &str) -> Result<Option<GateStatusRecord>, StoreError> {
        Ok(self.gates.get(request_id).map(|r| r.value().clone()))
    }

    async fn compare_and_set(
        &self,
        expected: GateStatus,
        updated: &GateStatusRecord,
    ) -> Result<CasOutcome, StoreError> {
        let Some(mut current) = self.gates.get_mut(&updated.request_id) else {
            return Ok(CasOutcome::Missing);
        };
        if current.status != expected {
            return Ok(CasOutcome::Conflict {
                current: current.value().clone(),
            });
        }
        *current = updated.clone();
        Ok(CasOutcome::Applied)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ============================================================================
// DedupStore
// ============================================================================

#[async_trait]
impl DedupStore for MemoryStore {
    async fn claim(
        &self,
        request_id: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let now = Instant::now();
        let set_alive = self.posted_set_alive(now);
        let claimed = DedupEntry::Claimed {
            owner: owner.to_string(),
            expires_at: now + lease,
        };

        match self.dedup.entry(request_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(claimed);
                Ok(ClaimOutcome::Claimed)
            }
            Entry::Occupied(mut slot) => {
                let outcome = match slot.get() {
                    DedupEntry::Posted(_) if set_alive => ClaimOutcome::AlreadyPosted,
                    DedupEntry::Claimed {
                        owner: holder,
                        expires_at,
                    } if holder != owner && *expires_at > now => ClaimOutcome::HeldElsewhere,
                    _ => ClaimOutcome::Claimed,
                };
                if outcome == ClaimOutcome::Claimed {
                    slot.insert(claimed);
                }
                Ok(outcome)
            }
        }
    }

    async fn mark_posted(&self, request_id: &str, message: &MessageRef) -> Result<(), StoreError> {
        let now = Instant::now();
        {
            let mut deadline = self.posted_deadline.lock().map_err(|_| Self::lock_error())?;
            if deadline.is_some_and(|d| now >= d) {
                // The whole set lapsed; forget every posted marker at once.
                self.dedup
                    .retain(|_, entry| matches!(entry, DedupEntry::Claimed { .. }));
            }
            *deadline = Some(now + self.dedup_ttl);
        }
        self.dedup
            .insert(request_id.to_string(), DedupEntry::Posted(message.clone()));
        Ok(())
    }

    async fn release(&self, request_id: &str, owner: &str) -> Result<(), StoreError> {
        self.dedup.remove_if(request_id, |_, entry| {
            matches!(entry, DedupEntry::Claimed { owner: holder, .. } if holder == owner)
        });
        Ok(())
    }

    async fn posted_message(&self, request_id: &str) -> Result<Option<MessageRef>, StoreError> {
        if !self.posted_set_alive(Instant::now()) {
            return Ok(None);
        }
        Ok(self.dedup.get(request_id).and_then(|entry| match entry.value() {
            DedupEntry::Posted(message) => Some(message.clone()),
            DedupEntry::Claimed { .. } => None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{DecisionKind, GateRequest};
    use chrono::Utc;
    use std::sync::Arc;

    fn record(id: &str) -> GateStatusRecord {
        GateStatusRecord::pending(&GateRequest {
            request_id: id.to_string(),
            gate_type: "hitl_4_code".to_string(),
            task_id: "task-1".to_string(),
            session_id: "sess-1".to_string(),
            summary: String::new(),
            requester: "agent".to_string(),
            environment: None,
        })
    }

    fn message() -> MessageRef {
        MessageRef {
            channel: "C-CODE".to_string(),
            ts: "1700000000.000100".to_string(),
        }
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_insert_pending_never_overwrites() {
        let store = MemoryStore::default();
        assert!(store.insert_pending(&record("r1")).await.unwrap());

        let approved = record("r1")
            .decided(DecisionKind::Approve, "U1", None, Utc::now())
            .unwrap();
        store
            .compare_and_set(GateStatus::Pending, &approved)
            .await
            .unwrap();

        assert!(!store.insert_pending(&record("r1")).await.unwrap());
        let stored = store.get("r1").await.unwrap().unwrap();
        assert_eq!(stored.status, GateStatus::Approved);
    }

    #[tokio::test]
    async fn test_compare_and_set_outcomes() {
        let store = MemoryStore::default();
        let approved = record("r1")
            .decided(DecisionKind::Approve, "U1", None, Utc::now())
            .unwrap();

        assert_eq!(
            store
                .compare_and_set(GateStatus::Pending, &approved)
                .await
                .unwrap(),
            CasOutcome::Missing
        );

        store.insert_pending(&record("r1")).await.unwrap();
        assert_eq!(
            store
                .compare_and_set(GateStatus::Pending, &approved)
                .await
                .unwrap(),
            CasOutcome::Applied
        );

        let rejected = record("r1")
            .decided(DecisionKind::Reject, "U2", Some("no".into()), Utc::now())
            .unwrap();
        match store
            .compare_and_set(GateStatus::Pending, &rejected)
            .await
            .unwrap()
        {
            CasOutcome::Conflict { current } => assert_eq!(current.status, GateStatus::Approved),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_cas_has_single_winner() {
        let store = Arc::new(MemoryStore::default());
        store.insert_pending(&record("r1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let updated = record("r1")
                    .decided(DecisionKind::Approve, &format!("U{i}"), None, Utc::now())
                    .unwrap();
                store
                    .compare_and_set(GateStatus::Pending, &updated)
                    .await
                    .unwrap()
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap() == CasOutcome::Applied {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn test_claim_then_post_blocks_later_claims() {
        let store = MemoryStore::default();
        assert_eq!(
            store.claim("r1", "c-1", LEASE).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store.claim("r1", "c-2", LEASE).await.unwrap(),
            ClaimOutcome::HeldElsewhere
        );

        store.mark_posted("r1", &message()).await.unwrap();
        assert_eq!(
            store.claim("r1", "c-2", LEASE).await.unwrap(),
            ClaimOutcome::AlreadyPosted
        );
        assert_eq!(store.posted_message("r1").await.unwrap(), Some(message()));
    }

    #[tokio::test]
    async fn test_release_only_drops_own_claim() {
        let store = MemoryStore::default();
        store.claim("r1", "c-1", LEASE).await.unwrap();

        store.release("r1", "c-2").await.unwrap();
        assert_eq!(
            store.claim("r1", "c-2", LEASE).await.unwrap(),
            ClaimOutcome::HeldElsewhere
        );

        store.release("r1", "c-1").await.unwrap();
        assert_eq!(
            store.claim("r1", "c-2", LEASE).await.unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_claim_can_be_taken_over() {
        let store = MemoryStore::default();
        store.claim("r1", "c-1", LEASE).await.unwrap();

        tokio::time::advance(LEASE + Duration::from_secs(1)).await;
        assert_eq!(
            store.claim("r1", "c-2", LEASE).await.unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_posted_set_expires_as_a_whole() {
        let store = MemoryStore::new(Duration::from_secs(60));
        store.mark_posted("r1", &message()).await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        store.mark_posted("r2", &message()).await.unwrap();

        // r1 survives past its own 60s because r2 refreshed the set.
        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(
            store.claim("r1", "c-1", LEASE).await.unwrap(),
            ClaimOutcome::AlreadyPosted
        );

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(store.posted_message("r2").await.unwrap().is_none());
        assert_eq!(
            store.claim("r2", "c-1", LEASE).await.unwrap(),
            ClaimOutcome::Claimed
        );
    }
}
