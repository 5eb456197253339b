//! Key-value state for gates and notification dedup.
//!
//! Two traits cover the two concerns:
//!
//! - [`GateStore`] holds one [`GateStatusRecord`] per request and changes it
//!   only through an atomic compare-and-set on the status field.
//! - [`DedupStore`] remembers which requests already produced a notification,
//!   with a short claim lease so that two consumers never post the same
//!   request concurrently.
//!
//! Backends: [`memory::MemoryStore`] (single process, tests) and
//! [`redis::RedisStore`] (shared across bridge instances).
//!
//! ## Key Layout
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `gate_status:{request_id}` | string | record JSON |
//! | `dedup:posted_requests` | set | posted request ids, rolling TTL |
//! | `dedup:message_refs` | hash | request id → posted message JSON |
//! | `dedup:claim:{request_id}` | string | claim owner, lease TTL |

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::chat::MessageRef;
use crate::gate::{GateStatus, GateStatusRecord};

// ============================================================================
// Errors
// ============================================================================

/// Errors from a state backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or rejected the command.
    #[error("store backend error: {reason}")]
    Backend {
        /// Backend error message
        reason: String,
    },

    /// A stored value could not be decoded.
    #[error("corrupt value at '{key}': {reason}")]
    Corrupt {
        /// Key holding the bad value
        key: String,
        /// Decode error
        reason: String,
    },
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of a conditional status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The record was in the expected status and has been replaced.
    Applied,
    /// The record exists but its status differed; nothing was written.
    Conflict {
        /// The record as currently stored
        current: GateStatusRecord,
    },
    /// No record exists for the request.
    Missing,
}

/// Result of trying to claim a request for notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the claim and should post.
    Claimed,
    /// A notification was already posted inside the dedup window.
    AlreadyPosted,
    /// Another consumer holds an unexpired claim.
    HeldElsewhere,
}

// ============================================================================
// Traits
// ============================================================================

/// Storage for gate status records.
#[async_trait]
pub trait GateStore: Send + Sync {
    /// Inserts a `PENDING` record unless one already exists.
    ///
    /// Returns `true` if the record was created, `false` if a record (in any
    /// status) was already present. Existing records are never overwritten.
    async fn insert_pending(&self, record: &GateStatusRecord) -> Result<bool, StoreError>;

    /// Loads the record for a request.
    async fn get(&self, request_id: &str) -> Result<Option<GateStatusRecord>, StoreError>;

    /// Replaces the record only if its stored status equals `expected`.
    ///
    /// The check and the write are a single atomic step.
    async fn compare_and_set(
        &self,
        expected: GateStatus,
        updated: &GateStatusRecord,
    ) -> Result<CasOutcome, StoreError>;

    /// Cheap reachability check used by readiness probes.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Bookkeeping that turns redelivered events into a single notification.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically checks the posted set and takes a claim lease.
    async fn claim(
        &self,
        request_id: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Records a successful post and drops the claim.
    ///
    /// Refreshes the dedup window for the whole posted set.
    async fn mark_posted(&self, request_id: &str, message: &MessageRef) -> Result<(), StoreError>;

    /// Drops a claim held by `owner`; a claim held by someone else is left alone.
    async fn release(&self, request_id: &str, owner: &str) -> Result<(), StoreError>;

    /// Returns the message posted for a request, if still remembered.
    async fn posted_message(&self, request_id: &str) -> Result<Option<MessageRef>, StoreError>;
}

// ============================================================================
// Key Layout
// ============================================================================

/// Key naming, with an optional namespace prefix shared by all keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    /// Creates a layout; `prefix` is prepended verbatim (e.g. `"bridge:"`).
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// `gate_status:{request_id}`
    #[must_use]
    pub fn gate_status(&self, request_id: &str) -> String {
        format!("{}gate_status:{request_id}", self.prefix)
    }

    /// `dedup:posted_requests`
    #[must_use]
    pub fn posted_set(&self) -> String {
        format!("{}dedup:posted_requests", self.prefix)
    }

    /// `dedup:message_refs`
    #[must_use]
    pub fn message_refs(&self) -> String {
        format!("{}dedup:message_refs", self.prefix)
    }

    /// `dedup:claim:{request_id}`
    #[must_use]
    pub fn claim(&self, request_id: &str) -> String {
        format!("{}dedup:claim:{request_id}", self.prefix)
    }
}
