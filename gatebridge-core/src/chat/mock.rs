//! Recording chat adapter for tests and local development.
//!
//! Every call is captured in order. Posts return synthetic timestamps and
//! can be made to fail on demand to exercise the redelivery path.
//!
//! Select it with `--chat mock`.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info};

use super::{AdapterError, ChatAdapter, MessageRef, OutboundMessage};

/// One captured adapter call.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCall {
    Post(OutboundMessage),
    Update {
        message: MessageRef,
        text: String,
        blocks: serde_json::Value,
    },
    OpenForm {
        trigger_id: String,
        view: serde_json::Value,
    },
    Ephemeral {
        channel: String,
        user: String,
        text: String,
    },
}

/// In-memory [`ChatAdapter`] that records calls instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingChatAdapter {
    calls: Mutex<Vec<ChatCall>>,
    next_ts: AtomicU64,
    /// Number of upcoming posts that should fail
    failing_posts: AtomicU32,
    /// Error returned by failing posts; a retriable request failure if unset
    post_error: Mutex<Option<AdapterError>>,
    /// When set, ephemeral replies are rejected
    ephemerals_fail: AtomicBool,
}

impl RecordingChatAdapter {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` posts fail with a retriable error.
    pub fn fail_next_posts(&self, count: u32) {
        if let Ok(mut slot) = self.post_error.lock() {
            *slot = None;
        }
        self.failing_posts.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` posts fail with `error`.
    pub fn fail_next_posts_with(&self, count: u32, error: AdapterError) {
        if let Ok(mut slot) = self.post_error.lock() {
            *slot = Some(error);
        }
        self.failing_posts.store(count, Ordering::SeqCst);
    }

    /// Rejects every ephemeral reply from now on.
    pub fn fail_ephemerals(&self) {
        self.ephemerals_fail.store(true, Ordering::SeqCst);
    }

    /// All captured calls, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Captured posts.
    #[must_use]
    pub fn posts(&self) -> Vec<OutboundMessage> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChatCall::Post(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Captured updates as `(message, blocks)`.
    #[must_use]
    pub fn updates(&self) -> Vec<(MessageRef, serde_json::Value)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChatCall::Update {
                    message, blocks, ..
                } => Some((message, blocks)),
                _ => None,
            })
            .collect()
    }

    /// Captured forms as `(trigger_id, view)`.
    #[must_use]
    pub fn forms(&self) -> Vec<(String, serde_json::Value)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChatCall::OpenForm { trigger_id, view } => Some((trigger_id, view)),
                _ => None,
            })
            .collect()
    }

    /// Captured ephemeral messages as `(user, text)`.
    #[must_use]
    pub fn ephemerals(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChatCall::Ephemeral { user, text, .. } => Some((user, text)),
                _ => None,
            })
            .collect()
    }

    /// Get the number of messages posted.
    #[must_use]
    pub fn post_count(&self) -> usize {
        self.posts().len()
    }

    fn record(&self, call: ChatCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl ChatAdapter for RecordingChatAdapter {
    async fn post(&self, message: &OutboundMessage) -> Result<MessageRef, AdapterError> {
        let should_fail = self
            .failing_posts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            debug!(channel = %message.channel, "RecordingChatAdapter: simulated post failure");
            let configured = self.post_error.lock().ok().and_then(|slot| slot.clone());
            return Err(configured.unwrap_or_else(|| AdapterError::RequestFailed {
                method: "post".to_string(),
                reason: "simulated failure".to_string(),
                retriable: true,
            }));
        }

        let seq = self.next_ts.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(ChatCall::Post(message.clone()));
        info!(channel = %message.channel, seq, "RecordingChatAdapter: recorded post");
        Ok(MessageRef {
            channel: message.channel.clone(),
            ts: format!("1700000000.{seq:06}"),
        })
    }

    async fn update(
        &self,
        message: &MessageRef,
        text: &str,
        blocks: &serde_json::Value,
    ) -> Result<(), AdapterError> {
        self.record(ChatCall::Update {
            message: message.clone(),
            text: text.to_string(),
            blocks: blocks.clone(),
        });
        Ok(())
    }

    async fn open_form(
        &self,
        trigger_id: &str,
        view: &serde_json::Value,
    ) -> Result<(), AdapterError> {
        self.record(ChatCall::OpenForm {
            trigger_id: trigger_id.to_string(),
            view: view.clone(),
        });
        Ok(())
    }

    async fn post_ephemeral(
        &self,
        channel: &str,
        user: &str,
        text: &str,
    ) -> Result<(), AdapterError> {
        if self.ephemerals_fail.load(Ordering::SeqCst) {
            return Err(AdapterError::Api {
                method: "chat.postEphemeral".to_string(),
                code: "user_not_in_channel".to_string(),
            });
        }
        self.record(ChatCall::Ephemeral {
            channel: channel.to_string(),
            user: user.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
