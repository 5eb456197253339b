//! Decision-path errors.
//!
//! Every way a decision attempt can fail is a variant here, so callers
//! branch on [`GateErrorKind`] instead of inspecting messages.

use thiserror::Error;

use super::status::GateStatus;
use crate::store::StoreError;

// ============================================================================
// Gate Errors
// ============================================================================

/// Errors returned by the gate decision state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    /// No status record exists for the request.
    #[error("Gate '{request_id}' not found")]
    NotFound {
        /// The request id that was looked up
        request_id: String,
    },

    /// The actor does not hold the role the gate's channel requires.
    #[error("'{actor}' is missing required role '{role}'")]
    RbacDenied {
        /// Identity that attempted the decision
        actor: String,
        /// The role that was required
        role: String,
    },

    /// The gate already left `PENDING`.
    #[error("Gate '{request_id}' was already decided ({status})")]
    AlreadyDecided {
        /// The request id
        request_id: String,
        /// Status observed at the time of the attempt
        status: GateStatus,
    },

    /// Input failed validation before any state was touched.
    #[error("{message}")]
    Validation {
        /// Human-readable validation message
        message: String,
    },

    /// No route is configured for the gate, so its required role is unknown.
    #[error("No route configured for gate type '{gate_type}'")]
    NoRoute {
        /// Gate type that failed to resolve
        gate_type: String,
    },

    /// The status transition is durable but the decision event was not written.
    #[error("Decision for '{request_id}' recorded but event publish failed: {reason}")]
    PublishFailed {
        /// The request id
        request_id: String,
        /// Underlying log error
        reason: String,
    },

    /// The key-value store could not be reached.
    #[error("Gate store unavailable: {reason}")]
    Unavailable {
        /// Underlying store error
        reason: String,
    },
}

/// Tag for a [`GateError`], used for metrics labels and caller branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateErrorKind {
    NotFound,
    RbacDenied,
    AlreadyDecided,
    Validation,
    NoRoute,
    PublishFailed,
    Unavailable,
}

impl GateErrorKind {
    /// Label used in metrics and structured logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::RbacDenied => "rbac_denied",
            Self::AlreadyDecided => "already_decided",
            Self::Validation => "invalid",
            Self::NoRoute => "no_route",
            Self::PublishFailed => "publish_failed",
            Self::Unavailable => "unavailable",
        }
    }
}

impl GateError {
    /// Validation error for a missing or blank rejection reason.
    #[must_use]
    pub fn reason_required() -> Self {
        Self::Validation {
            message: "reason is required".to_string(),
        }
    }

    /// Returns the tag for this error.
    #[must_use]
    pub fn kind(&self) -> GateErrorKind {
        match self {
            Self::NotFound { .. } => GateErrorKind::NotFound,
            Self::RbacDenied { .. } => GateErrorKind::RbacDenied,
            Self::AlreadyDecided { .. } => GateErrorKind::AlreadyDecided,
            Self::Validation { .. } => GateErrorKind::Validation,
            Self::NoRoute { .. } => GateErrorKind::NoRoute,
            Self::PublishFailed { .. } => GateErrorKind::PublishFailed,
            Self::Unavailable { .. } => GateErrorKind::Unavailable,
        }
    }

    /// Text shown to the acting user as an ephemeral reply.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound { request_id } => {
                format!("This gate (`{request_id}`) no longer exists.")
            }
            Self::RbacDenied { role, .. } => {
                format!("You need the `{role}` role to decide this gate.")
            }
            Self::AlreadyDecided { status, .. } => {
                format!("This gate was already decided ({}).", status.as_str().to_lowercase())
            }
            Self::Validation { message } => message.clone(),
            Self::NoRoute { gate_type } => {
                format!("Gate type `{gate_type}` has no approval route configured.")
            }
            Self::PublishFailed { .. } => {
                "Your decision was recorded, but the pipeline could not be notified. \
                 Please tell an operator."
                    .to_string()
            }
            Self::Unavailable { .. } => {
                "The approval service is temporarily unavailable. Please try again.".to_string()
            }
        }
    }
}

impl From<StoreError> for GateError {
    fn from(e: StoreError) -> Self {
        Self::Unavailable {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rbac_denied_names_the_role() {
        let err = GateError::RbacDenied {
            actor: "U9".into(),
            role: "reviewer".into(),
        };
        assert_eq!(err.kind(), GateErrorKind::RbacDenied);
        assert!(err.to_string().contains("reviewer"));
        assert!(err.user_message().contains("`reviewer`"));
    }

    #[test]
    fn test_reason_required_message() {
        let err = GateError::reason_required();
        assert_eq!(err.kind(), GateErrorKind::Validation);
        assert_eq!(err.user_message(), "reason is required");
    }

    #[test]
    fn test_store_errors_become_unavailable() {
        let err: GateError = StoreError::Backend {
            reason: "connection refused".into(),
        }
        .into();
        assert_eq!(err.kind(), GateErrorKind::Unavailable);
    }
}
