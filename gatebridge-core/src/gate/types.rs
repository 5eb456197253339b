//! Gate data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::GateStatus;

// ============================================================================
// Gate Request
// ============================================================================

/// A request for a human decision, as emitted by the pipeline.
///
/// Immutable once parsed. `request_id` is supplied by the caller and is the
/// correlation token for every later step (dedup, buttons, rejection form).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRequest {
    /// Caller-supplied unique id
    pub request_id: String,
    /// Routing key, e.g. `hitl_4_code`
    pub gate_type: String,
    /// Pipeline task this gate belongs to
    pub task_id: String,
    /// Pipeline session this gate belongs to
    pub session_id: String,
    /// Human-readable summary of what needs review
    pub summary: String,
    /// Who (or what agent) asked for the gate
    pub requester: String,
    /// Deployment environment, used for routing overrides
    pub environment: Option<String>,
}

// ============================================================================
// Decision
// ============================================================================

/// The decision a reviewer is attempting to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Let the pipeline continue
    Approve,
    /// Stop the pipeline; requires a reason
    Reject,
}

impl DecisionKind {
    /// The status a successful decision moves the gate to.
    #[must_use]
    pub fn target_status(&self) -> GateStatus {
        match self {
            Self::Approve => GateStatus::Approved,
            Self::Reject => GateStatus::Rejected,
        }
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

// ============================================================================
// Gate Status Record
// ============================================================================

/// Persistent status of one gate.
///
/// Stored as JSON under `gate_status:{request_id}`. The id lives in the key,
/// so it is skipped during (de)serialization and restored by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStatusRecord {
    #[serde(skip)]
    pub request_id: String,
    pub status: GateStatus,
    pub session_id: String,
    pub task_id: String,
    pub gate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GateStatusRecord {
    /// Builds the initial `PENDING` record for a request.
    #[must_use]
    pub fn pending(request: &GateRequest) -> Self {
        Self {
            request_id: request.request_id.clone(),
            status: GateStatus::Pending,
            session_id: request.session_id.clone(),
            task_id: request.task_id.clone(),
            gate_type: request.gate_type.clone(),
            environment: request.environment.clone(),
            decided_by: None,
            decided_at: None,
            reason: None,
        }
    }

    /// Returns the decided copy of this record, or `None` if the current
    /// status does not allow the transition.
    ///
    /// `reason` is only kept for rejections.
    #[must_use]
    pub fn decided(
        &self,
        kind: DecisionKind,
        actor: &str,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Option<Self> {
        let target = kind.target_status();
        if !self.status.can_transition_to(target) {
            return None;
        }
        Some(Self {
            status: target,
            decided_by: Some(actor.to_string()),
            decided_at: Some(at),
            reason: match kind {
                DecisionKind::Reject => reason,
                DecisionKind::Approve => None,
            },
            ..self.clone()
        })
    }

    /// Serializes the record for storage.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Restores a record from storage, re-attaching its key.
    pub fn from_json(request_id: &str, json: &str) -> serde_json::Result<Self> {
        let mut record: Self = serde_json::from_str(json)?;
        record.request_id = request_id.to_string();
        Ok(record)
    }
}
