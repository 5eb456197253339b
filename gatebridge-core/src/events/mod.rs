//! Durable event log: inbound gate requests and outbound decisions.
//!
//! Consumers in one group compete for entries. An entry stays pending until
//! it is acknowledged; pending entries idle past the redelivery timeout are
//! handed to whichever consumer reads next.
//!
//! Implementations: [`memory::InMemoryEventLog`] and
//! [`redis::RedisEventLog`] (Redis Streams).

pub mod memory;
pub mod redis;

pub use memory::{InMemoryConsumer, InMemoryEventLog};
pub use self::redis::{RedisEventLog, RedisStreamConfig};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::gate::{GateRequest, GateStatus, GateStatusRecord};

/// Inbound request for a human decision.
pub const GATE_REQUESTED: &str = "GATE_REQUESTED";
/// Outbound approval.
pub const GATE_APPROVED: &str = "GATE_APPROVED";
/// Outbound rejection.
pub const GATE_REJECTED: &str = "GATE_REJECTED";

/// Flat field map of one log entry.
pub type EventFields = HashMap<String, String>;

// ============================================================================
// Errors
// ============================================================================

/// Errors from the event log.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogError {
    /// The log backend could not be reached.
    #[error("event log unavailable: {reason}")]
    Unavailable {
        /// Backend error message
        reason: String,
    },

    /// The backend answered with something we could not interpret.
    #[error("unexpected event log reply: {reason}")]
    Protocol {
        /// What was wrong
        reason: String,
    },
}

/// An inbound entry that cannot be turned into a gate request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed event: {reason}")]
pub struct MalformedEvent {
    /// What was missing or wrong
    pub reason: String,
}

// ============================================================================
// Entries
// ============================================================================

/// One entry delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Log-assigned entry id, used to acknowledge
    pub id: String,
    /// Entry payload
    pub fields: EventFields,
    /// True when the entry was reclaimed after another delivery went unacked
    pub redelivered: bool,
}

/// What an inbound entry turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A gate request to notify about
    GateRequested(GateRequest),
    /// Any other event type sharing the stream
    Other {
        /// The entry's `event_type`
        event_type: String,
    },
}

fn field<'a>(fields: &'a EventFields, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Interprets an inbound entry.
///
/// `gate_type` and `request_id` are required for `GATE_REQUESTED`; other
/// text fields default to empty. The requester is read from `requested_by`,
/// falling back to `requester`.
///
/// # Errors
///
/// Returns `MalformedEvent` if `event_type` is absent or a required
/// `GATE_REQUESTED` field is missing or blank.
pub fn parse_event(fields: &EventFields) -> Result<InboundEvent, MalformedEvent> {
    let event_type = field(fields, "event_type").ok_or_else(|| MalformedEvent {
        reason: "missing event_type".to_string(),
    })?;
    if event_type != GATE_REQUESTED {
        return Ok(InboundEvent::Other {
            event_type: event_type.to_string(),
        });
    }

    let request_id = field(fields, "request_id").ok_or_else(|| MalformedEvent {
        reason: "missing request_id".to_string(),
    })?;
    let gate_type = field(fields, "gate_type").ok_or_else(|| MalformedEvent {
        reason: "missing gate_type".to_string(),
    })?;
    let text = |name: &str| fields.get(name).cloned().unwrap_or_default();

    Ok(InboundEvent::GateRequested(GateRequest {
        request_id: request_id.to_string(),
        gate_type: gate_type.to_string(),
        task_id: text("task_id"),
        session_id: text("session_id"),
        summary: text("summary"),
        requester: field(fields, "requested_by")
            .or_else(|| field(fields, "requester"))
            .unwrap_or_default()
            .to_string(),
        environment: field(fields, "environment").map(str::to_string),
    }))
}

// ============================================================================
// Decision Events
// ============================================================================

/// Outbound decision, built from the record the transition wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionEvent {
    pub request_id: String,
    pub status: GateStatus,
    pub actor: String,
    pub reason: Option<String>,
    pub session_id: String,
    pub task_id: String,
    pub gate_type: String,
    pub decided_at: DateTime<Utc>,
}

impl DecisionEvent {
    /// Builds the event for a decided record. Returns `None` for `PENDING`.
    #[must_use]
    pub fn from_record(record: &GateStatusRecord) -> Option<Self> {
        if !record.status.is_terminal() {
            return None;
        }
        Some(Self {
            request_id: record.request_id.clone(),
            status: record.status,
            actor: record.decided_by.clone().unwrap_or_default(),
            reason: record.reason.clone(),
            session_id: record.session_id.clone(),
            task_id: record.task_id.clone(),
            gate_type: record.gate_type.clone(),
            decided_at: record.decided_at.unwrap_or_else(Utc::now),
        })
    }

    /// `GATE_APPROVED` or `GATE_REJECTED`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self.status {
            GateStatus::Rejected => GATE_REJECTED,
            _ => GATE_APPROVED,
        }
    }

    /// Wire fields. Approvals name the actor `reviewer`; rejections name it
    /// `rejected_by` and carry `reason`.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("event_type".to_string(), self.event_type().to_string()),
            ("request_id".to_string(), self.request_id.clone()),
        ];
        match self.status {
            GateStatus::Rejected => {
                fields.push(("rejected_by".to_string(), self.actor.clone()));
                fields.push((
                    "reason".to_string(),
                    self.reason.clone().unwrap_or_default(),
                ));
            }
            _ => fields.push(("reviewer".to_string(), self.actor.clone())),
        }
        fields.extend([
            ("session_id".to_string(), self.session_id.clone()),
            ("task_id".to_string(), self.task_id.clone()),
            ("gate_type".to_string(), self.gate_type.clone()),
            (
                "decided_at".to_string(),
                self.decided_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        ]);
        fields
    }
}

// ============================================================================
// Traits
// ============================================================================

/// One consumer's view of a consumer group.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Name of this consumer within the group.
    fn consumer_name(&self) -> &str;

    /// Creates the group (and stream) if missing. Idempotent.
    async fn ensure_group(&self) -> Result<(), LogError>;

    /// Returns up to `count` entries, waiting at most `block` for new ones.
    ///
    /// Entries idle past the redelivery timeout are returned before new ones.
    /// An empty vector means nothing arrived in time.
    async fn read(&self, count: usize, block: Duration) -> Result<Vec<LogEntry>, LogError>;

    /// Acknowledges an entry so it is never delivered again.
    async fn ack(&self, entry_id: &str) -> Result<(), LogError>;
}

/// Writes decision events for the pipeline.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Appends the event and returns its log id.
    async fn publish(&self, event: &DecisionEvent) -> Result<String, LogError>;
}
