//! Slack Web API adapter.
//!
//! Posts gate notifications as Block Kit messages, rewrites them once a
//! decision lands, and opens the rejection modal. Inbound interaction
//! payloads (`block_actions`, `view_submission`) are parsed here too.
//!
//! ## Security
//!
//! - Bot token is NEVER logged and is redacted from `Debug`
//! - User identity from Slack is trusted

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{AdapterError, ChatAdapter, MessageContext, MessageRef, OutboundMessage};
use crate::interaction::{ActionClick, FormSubmission, Interaction};

/// Public Slack Web API endpoint.
pub const DEFAULT_API_BASE_URL: &str = "https://slack.com/api";

type ApiLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the Slack adapter.
#[derive(Clone)]
pub struct SlackConfig {
    /// Bot token for Slack API (NEVER log this value)
    bot_token: String,
    /// Web API base URL, without trailing slash
    pub api_base_url: String,
    /// Request timeout for Slack API calls
    pub api_timeout: Duration,
    /// Client-side ceiling on API calls per second
    pub rate_limit_per_sec: u32,
}

impl std::fmt::Debug for SlackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackConfig")
            .field("bot_token", &"[REDACTED]")
            .field("api_base_url", &self.api_base_url)
            .field("api_timeout", &self.api_timeout)
            .field("rate_limit_per_sec", &self.rate_limit_per_sec)
            .finish()
    }
}

impl SlackConfig {
    /// Create a new Slack configuration.
    #[must_use]
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_timeout: Duration::from_secs(10),
            rate_limit_per_sec: 1,
        }
    }

    /// Point the adapter at another API host (tests, proxies).
    #[must_use]
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the API timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    /// Set the client-side rate limit.
    #[must_use]
    pub fn with_rate_limit(mut self, per_sec: u32) -> Self {
        self.rate_limit_per_sec = per_sec;
        self
    }
}

// ============================================================================
// Slack Adapter
// ============================================================================

/// Slack implementation of [`ChatAdapter`].
pub struct SlackAdapter {
    client: Client,
    config: SlackConfig,
    limiter: ApiLimiter,
}

impl SlackAdapter {
    /// Create a new Slack adapter.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(config: SlackConfig) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(config.api_timeout)
            .build()
            .map_err(|e| AdapterError::RequestFailed {
                method: "client".to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
                retriable: false,
            })?;

        let per_sec = NonZeroU32::new(config.rate_limit_per_sec).unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::direct(Quota::per_second(per_sec));

        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    /// Calls a Web API method with a JSON body.
    async fn call(
        &self,
        method: &str,
        body: &serde_json::Value,
        channel: &str,
        ts: Option<&str>,
    ) -> Result<SlackApiResponse, AdapterError> {
        self.limiter.until_ready().await;

        let response = self
            .client
            .post(format!("{}/{method}", self.config.api_base_url))
            .bearer_auth(&self.config.bot_token)
            .json(body)
            .send()
            .await
            .map_err(|e| AdapterError::RequestFailed {
                method: method.to_string(),
                reason: e.to_string(),
                retriable: e.is_connect() || e.is_timeout(),
            })?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Self::handle_rate_limit(&response));
        }
        if response.status().is_server_error() {
            return Err(AdapterError::RequestFailed {
                method: method.to_string(),
                reason: format!("HTTP {}", response.status()),
                retriable: true,
            });
        }

        let body: SlackApiResponse =
            response
                .json()
                .await
                .map_err(|e| AdapterError::RequestFailed {
                    method: method.to_string(),
                    reason: format!("Failed to parse Slack response: {e}"),
                    retriable: false,
                })?;

        if !body.ok {
            let error = body.error.as_deref().unwrap_or("unknown");
            debug!(method, error, "Slack API returned error");
            return Err(Self::map_slack_error(method, error, channel, ts));
        }
        Ok(body)
    }

    /// Handle HTTP 429 rate limit response.
    fn handle_rate_limit(response: &reqwest::Response) -> AdapterError {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);

        AdapterError::RateLimited {
            retry_after: Duration::from_secs(retry_after),
        }
    }

    /// Map Slack API error to AdapterError.
    fn map_slack_error(method: &str, error: &str, channel: &str, ts: Option<&str>) -> AdapterError {
        match error {
            "channel_not_found" | "not_in_channel" | "is_archived" => {
                AdapterError::ChannelNotFound {
                    channel: channel.to_string(),
                }
            }
            "invalid_auth" | "account_inactive" | "token_revoked" | "not_authed" => {
                AdapterError::InvalidToken
            }
            "message_not_found" | "cant_update_message" => AdapterError::MessageNotFound {
                ts: ts.unwrap_or("unknown").to_string(),
            },
            "expired_trigger_id" | "invalid_trigger_id" => AdapterError::TriggerExpired,
            "ratelimited" => AdapterError::RateLimited {
                retry_after: Duration::from_secs(60),
            },
            _ => AdapterError::Api {
                method: method.to_string(),
                code: error.to_string(),
            },
        }
    }
}

#[async_trait]
impl ChatAdapter for SlackAdapter {
    async fn post(&self, message: &OutboundMessage) -> Result<MessageRef, AdapterError> {
        let body = self
            .call(
                "chat.postMessage",
                &serde_json::json!({
                    "channel": message.channel,
                    "text": message.text,
                    "blocks": message.blocks,
                }),
                &message.channel,
                None,
            )
            .await?;

        let ts = body.ts.ok_or_else(|| AdapterError::RequestFailed {
            method: "chat.postMessage".to_string(),
            reason: "No timestamp in response".to_string(),
            retriable: false,
        })?;
        let channel = body.channel.unwrap_or_else(|| message.channel.clone());

        info!(channel = %channel, ts = %ts, "Posted gate notification to Slack");
        Ok(MessageRef { channel, ts })
    }

    async fn update(
        &self,
        message: &MessageRef,
        text: &str,
        blocks: &serde_json::Value,
    ) -> Result<(), AdapterError> {
        self.call(
            "chat.update",
            &serde_json::json!({
                "channel": message.channel,
                "ts": message.ts,
                "text": text,
                "blocks": blocks,
            }),
            &message.channel,
            Some(&message.ts),
        )
        .await?;
        debug!(channel = %message.channel, ts = %message.ts, "Updated Slack message");
        Ok(())
    }

    async fn open_form(
        &self,
        trigger_id: &str,
        view: &serde_json::Value,
    ) -> Result<(), AdapterError> {
        self.call(
            "views.open",
            &serde_json::json!({"trigger_id": trigger_id, "view": view}),
            "",
            None,
        )
        .await?;
        Ok(())
    }

    async fn post_ephemeral(
        &self,
        channel: &str,
        user: &str,
        text: &str,
    ) -> Result<(), AdapterError> {
        let result = self
            .call(
                "chat.postEphemeral",
                &serde_json::json!({"channel": channel, "user": user, "text": text}),
                channel,
                None,
            )
            .await;
        if let Err(e) = &result {
            warn!(channel = %channel, user = %user, error = %e, "Failed to send ephemeral message");
        }
        result.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "slack"
    }
}

// ============================================================================
// Slack API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct SlackApiResponse {
    ok: bool,
    error: Option<String>,
    ts: Option<String>,
    channel: Option<String>,
}

// ============================================================================
// Interaction Payloads
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SlackInteraction {
    #[serde(rename = "block_actions")]
    BlockActions {
        user: SlackUser,
        trigger_id: Option<String>,
        channel: Option<SlackChannel>,
        container: Option<SlackContainer>,
        message: Option<SlackMessage>,
        #[serde(default)]
        actions: Vec<SlackAction>,
    },
    #[serde(rename = "view_submission")]
    ViewSubmission { user: SlackUser, view: SlackView },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct SlackUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SlackChannel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SlackContainer {
    channel_id: Option<String>,
    message_ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    ts: Option<String>,
    #[serde(default)]
    blocks: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SlackAction {
    action_id: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackView {
    #[serde(default)]
    callback_id: String,
    #[serde(default)]
    private_metadata: String,
    #[serde(default)]
    state: SlackViewState,
}

#[derive(Debug, Default, Deserialize)]
struct SlackViewState {
    /// block_id → action_id → element state
    #[serde(default)]
    values: HashMap<String, HashMap<String, SlackInputValue>>,
}

#[derive(Debug, Deserialize)]
struct SlackInputValue {
    #[serde(default)]
    value: Option<String>,
}

/// Parses the JSON carried in the `payload` form field of an interaction
/// request.
///
/// Form values are flattened to `action_id → text`; empty inputs map to
/// an empty string.
///
/// # Errors
///
/// Returns the JSON error when the payload is not a Slack interaction.
pub fn parse_interaction(payload: &str) -> Result<Interaction, serde_json::Error> {
    let parsed: SlackInteraction = serde_json::from_str(payload)?;
    Ok(match parsed {
        SlackInteraction::BlockActions {
            user,
            trigger_id,
            channel,
            container,
            message,
            actions,
        } => {
            let Some(action) = actions.into_iter().next() else {
                return Ok(Interaction::Other {
                    kind: "block_actions".to_string(),
                });
            };
            let channel_id = channel
                .map(|c| c.id)
                .or_else(|| container.as_ref().and_then(|c| c.channel_id.clone()));
            let message_ts = message
                .as_ref()
                .and_then(|m| m.ts.clone())
                .or_else(|| container.and_then(|c| c.message_ts));
            let message = match (channel_id.clone(), message_ts, message) {
                (Some(channel), Some(ts), Some(message)) => Some(MessageContext {
                    message: MessageRef { channel, ts },
                    blocks: message.blocks,
                }),
                _ => None,
            };
            Interaction::ActionClicked(ActionClick {
                action_id: action.action_id,
                actor: user.id,
                correlation_id: action.value.unwrap_or_default(),
                trigger_id,
                channel: channel_id,
                message,
            })
        }
        SlackInteraction::ViewSubmission { user, view } => {
            let values = view
                .state
                .values
                .into_values()
                .flatten()
                .map(|(action_id, input)| (action_id, input.value.unwrap_or_default()))
                .collect();
            Interaction::FormSubmitted(FormSubmission {
                callback_id: view.callback_id,
                actor: user.id,
                correlation_id: view.private_metadata,
                values,
            })
        }
        SlackInteraction::Other => Interaction::Other {
            kind: serde_json::from_str::<serde_json::Value>(payload)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
                .unwrap_or_default(),
        },
    })
}

// ============================================================================
// Tests
// ============================================================================
