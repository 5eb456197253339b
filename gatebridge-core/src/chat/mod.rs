//! Chat surface abstraction.
//!
//! The bridge talks to reviewers through a [`ChatAdapter`]: it posts the
//! gate notification, rewrites it once the gate is decided, opens the
//! rejection form and sends ephemeral replies to a single user.
//!
//! ## Module Organization
//!
//! - `mod.rs` - Trait, message types and adapter errors
//! - `blocks.rs` - Notification, resolved-message and form payloads
//! - `slack.rs` - Slack Web API adapter and interaction payload parsing
//! - `mock.rs` - Recording adapter for tests and local runs

pub mod blocks;
pub mod mock;
pub mod slack;

pub use mock::{ChatCall, RecordingChatAdapter};
pub use slack::{SlackAdapter, SlackConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Messages
// ============================================================================

/// Location of a posted message, enough to update it later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    /// Channel the message lives in
    pub channel: String,
    /// Platform message id (Slack `ts`)
    pub ts: String,
}

/// A message ready to be posted.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Destination channel
    pub channel: String,
    /// Plain-text fallback used by notifications and screen readers
    pub text: String,
    /// Rich layout (Slack Block Kit array)
    pub blocks: serde_json::Value,
}

/// A posted message as seen in an interaction callback.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContext {
    /// Where the message lives
    pub message: MessageRef,
    /// Its current layout
    pub blocks: serde_json::Value,
}

// ============================================================================
// Adapter Errors
// ============================================================================

/// Errors from chat adapters.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdapterError {
    /// The HTTP request failed or returned an unusable response
    #[error("{method} request failed: {reason}")]
    RequestFailed {
        /// API method called
        method: String,
        /// Reason for failure
        reason: String,
        /// Whether the operation can be retried
        retriable: bool,
    },

    /// The API answered with an error code not mapped to a specific variant
    #[error("{method} returned error '{code}'")]
    Api {
        /// API method called
        method: String,
        /// Platform error code
        code: String,
    },

    /// Rate limited by external API
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Duration to wait before retrying
        retry_after: Duration,
    },

    /// Invalid or expired authentication token
    #[error("Invalid or expired authentication token")]
    InvalidToken,

    /// Channel not found or not accessible to the bot
    #[error("Channel not found: {channel}")]
    ChannelNotFound {
        /// The channel that was not found
        channel: String,
    },

    /// Message not found (may have been deleted)
    #[error("Message not found: {ts}")]
    MessageNotFound {
        /// The message timestamp that was not found
        ts: String,
    },

    /// The interaction trigger used to open a form has expired
    #[error("Form trigger expired")]
    TriggerExpired,
}

impl AdapterError {
    /// Returns whether this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::RequestFailed { retriable, .. } => *retriable,
            Self::RateLimited { .. } => true,
            Self::Api { code, .. } => matches!(
                code.as_str(),
                "internal_error" | "fatal_error" | "service_unavailable" | "request_timeout"
            ),
            Self::InvalidToken
            | Self::ChannelNotFound { .. }
            | Self::MessageNotFound { .. }
            | Self::TriggerExpired => false,
        }
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestFailed { .. } => "request_failed",
            Self::Api { .. } => "api_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidToken => "invalid_token",
            Self::ChannelNotFound { .. } => "channel_not_found",
            Self::MessageNotFound { .. } => "message_not_found",
            Self::TriggerExpired => "trigger_expired",
        }
    }
}

// ============================================================================
// Chat Adapter Trait
// ============================================================================

/// Outbound operations on a chat surface.
///
/// Inbound callbacks (button clicks, form submissions) arrive over HTTP and
/// are parsed into [`crate::interaction::Interaction`] by the adapter's
/// payload parser, not through this trait.
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Posts a new message and returns where it landed.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError` if posting fails.
    async fn post(&self, message: &OutboundMessage) -> Result<MessageRef, AdapterError>;

    /// Replaces the content of an existing message.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError` if the update fails.
    async fn update(
        &self,
        message: &MessageRef,
        text: &str,
        blocks: &serde_json::Value,
    ) -> Result<(), AdapterError>;

    /// Opens a form (Slack modal) in response to an interaction trigger.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::TriggerExpired` when the trigger is too old.
    async fn open_form(&self, trigger_id: &str, view: &serde_json::Value)
    -> Result<(), AdapterError>;

    /// Sends a message only `user` can see.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError` if sending fails.
    async fn post_ephemeral(&self, channel: &str, user: &str, text: &str)
    -> Result<(), AdapterError>;

    /// Returns the adapter name for logging and metrics.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(
            AdapterError::RateLimited {
                retry_after: Duration::from_secs(1)
            }
            .is_retriable()
        );
        assert!(
            AdapterError::Api {
                method: "chat.postMessage".into(),
                code: "internal_error".into()
            }
            .is_retriable()
        );
        assert!(!AdapterError::InvalidToken.is_retriable());
        assert!(
            !AdapterError::ChannelNotFound {
                channel: "C1".into()
            }
            .is_retriable()
        );
    }

    #[test]
    fn test_message_ref_json_layout() {
        let json = serde_json::to_value(MessageRef {
            channel: "C1".into(),
            ts: "1.2".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"channel": "C1", "ts": "1.2"}));
    }
}
