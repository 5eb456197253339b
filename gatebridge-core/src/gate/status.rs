//! Gate status and its state machine.
//!
//! ```text
//! PENDING ──approve──▶ APPROVED
//!    │
//!    └────reject────▶ REJECTED
//! ```
//!
//! Both decided states are terminal. There is no way back to `PENDING`.

use serde::{Deserialize, Serialize};

// ============================================================================
// Gate Status
// ============================================================================

/// Lifecycle status of a single gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateStatus {
    /// Notification posted (or about to be), waiting for a human
    Pending,
    /// A reviewer approved the gate
    Approved,
    /// A reviewer rejected the gate with a reason
    Rejected,
}

impl GateStatus {
    /// Returns true once a decision has been recorded.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }

    /// Checks if a transition from this status to another is valid.
    #[must_use]
    pub fn can_transition_to(&self, to: GateStatus) -> bool {
        matches!(
            (self, to),
            (GateStatus::Pending, GateStatus::Approved) | (GateStatus::Pending, GateStatus::Rejected)
        )
    }

    /// Wire representation used in the key-value store.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
