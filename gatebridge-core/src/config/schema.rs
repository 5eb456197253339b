//! Configuration schema type definitions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::duration_format;
use crate::rbac::RbacMap;
use crate::routing::RoutingTable;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-Level Schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Root configuration structure.
///
/// # Example
/// ```yaml
/// schema: 1
///
/// redis:
///   url: ${REDIS_URL:-redis://127.0.0.1:6379}
///
/// streams:
///   events: gate_events
///   group: gatebridge
///   instance: bridge-a
///
/// evidence_base_url: https://evidence.example.com
///
/// slack:
///   bot_token: ${SLACK_BOT_TOKEN}
///   signing_secret: ${SLACK_SIGNING_SECRET}
///
/// routing:
///   defaults:
///     hitl_4_code:
///       channel_id: C-CODE
///       required_role: reviewer
///
/// rbac:
///   U-ALICE: [reviewer]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Schema version (must be 1).
    pub schema: u32,

    /// Key-value store connection.
    pub redis: RedisSettings,

    /// Event log streams and consumer group.
    #[serde(default)]
    pub streams: StreamSettings,

    /// Consumer loop tuning.
    #[serde(default)]
    pub consumer: ConsumerSettings,

    /// Duplicate-post suppression.
    #[serde(default)]
    pub dedup: DedupSettings,

    /// Base URL for evidence links in notifications.
    pub evidence_base_url: String,

    /// Slack adapter settings. Required unless the mock adapter is selected.
    #[serde(default)]
    pub slack: Option<SlackSettings>,

    /// gate type → channel, with per-environment overrides.
    #[serde(default)]
    pub routing: RoutingTable,

    /// identity → roles.
    #[serde(default)]
    pub rbac: RbacMap,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RedisSettings {
    /// Connection URL (`redis://` or `rediss://`).
    pub url: String,

    /// Namespace prepended to every key.
    #[serde(default)]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StreamSettings {
    /// Stream carrying gate requests.
    #[serde(default = "default_events_stream")]
    pub events: String,

    /// Stream decision events go to. Defaults to `events`.
    #[serde(default)]
    pub decisions: Option<String>,

    /// Consumer group shared by all bridge instances.
    #[serde(default = "default_group")]
    pub group: String,

    /// Instance name; consumers are named `{instance}-{n}`.
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Consumer workers started by this instance.
    #[serde(default = "default_consumers")]
    pub consumers: usize,

    /// Idle time after which an unacknowledged entry is redelivered.
    #[serde(
        default = "default_redelivery_timeout",
        deserialize_with = "duration_format::deserialize",
        serialize_with = "duration_format::serialize"
    )]
    pub redelivery_timeout: Duration,
}

impl StreamSettings {
    /// Stream decision events are published to.
    pub fn decision_stream(&self) -> &str {
        self.decisions.as_deref().unwrap_or(&self.events)
    }

    /// Name of the `n`th consumer of this instance (1-based).
    pub fn consumer_name(&self, n: usize) -> String {
        format!("{}-{n}", self.instance)
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            events: default_events_stream(),
            decisions: None,
            group: default_group(),
            instance: default_instance(),
            consumers: default_consumers(),
            redelivery_timeout: default_redelivery_timeout(),
        }
    }
}

fn default_events_stream() -> String {
    "gate_events".to_string()
}

fn default_group() -> String {
    "gatebridge".to_string()
}

fn default_instance() -> String {
    "gatebridge".to_string()
}

fn default_consumers() -> usize {
    1
}

fn default_redelivery_timeout() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumerSettings {
    /// Entries fetched per read.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a read blocks waiting for entries.
    #[serde(
        default = "default_block_timeout",
        deserialize_with = "duration_format::deserialize",
        serialize_with = "duration_format::serialize"
    )]
    pub block_timeout: Duration,

    /// How long a dedup claim is held while posting.
    #[serde(
        default = "default_claim_lease",
        deserialize_with = "duration_format::deserialize",
        serialize_with = "duration_format::serialize"
    )]
    pub claim_lease: Duration,

    /// Pause after a loop-level error.
    #[serde(
        default = "default_error_backoff",
        deserialize_with = "duration_format::deserialize",
        serialize_with = "duration_format::serialize"
    )]
    pub error_backoff: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            block_timeout: default_block_timeout(),
            claim_lease: default_claim_lease(),
            error_backoff: default_error_backoff(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_block_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_claim_lease() -> Duration {
    Duration::from_secs(60)
}

fn default_error_backoff() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DedupSettings {
    /// Rolling retention of the posted set, refreshed on every insert.
    #[serde(
        default = "default_dedup_ttl",
        deserialize_with = "duration_format::deserialize",
        serialize_with = "duration_format::serialize"
    )]
    pub ttl: Duration,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            ttl: default_dedup_ttl(),
        }
    }
}

fn default_dedup_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

/// Slack credentials and API tuning.
#[derive(Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SlackSettings {
    /// Bot token (`xoxb-...`).
    pub bot_token: String,

    /// Secret used to verify interaction requests.
    #[serde(default)]
    pub signing_secret: Option<String>,

    /// Web API base URL; overridden in tests.
    #[serde(default)]
    pub api_base_url: Option<String>,

    /// Per-call timeout.
    #[serde(
        default = "default_slack_timeout",
        deserialize_with = "duration_format::deserialize",
        serialize_with = "duration_format::serialize"
    )]
    pub timeout: Duration,

    /// Outbound calls per second.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_sec: u32,
}

impl std::fmt::Debug for SlackSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackSettings")
            .field("bot_token", &"[REDACTED]")
            .field(
                "signing_secret",
                &self.signing_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("api_base_url", &self.api_base_url)
            .field("timeout", &self.timeout)
            .field("rate_limit_per_sec", &self.rate_limit_per_sec)
            .finish()
    }
}

impl SlackSettings {
    /// Signing secret, treating an empty string as unset.
    pub fn signing_secret(&self) -> Option<&str> {
        self.signing_secret.as_deref().filter(|s| !s.is_empty())
    }
}

fn default_slack_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_rate_limit() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let yaml = r#"
schema: 1
redis:
  url: redis://127.0.0.1:6379
evidence_base_url: https://evidence.example.com
"#;
        let config: Config = serde_saphyr::from_str(yaml).unwrap();
        assert_eq!(config.streams.events, "gate_events");
        assert_eq!(config.streams.decision_stream(), "gate_events");
        assert_eq!(config.streams.consumers, 1);
        assert_eq!(config.consumer.batch_size, 10);
        assert_eq!(config.dedup.ttl, Duration::from_secs(86400));
        assert!(config.slack.is_none());
        assert!(config.routing.is_empty());
        assert!(config.rbac.is_empty());
    }

    #[test]
    fn test_durations_accept_both_formats() {
        let yaml = r#"
schema: 1
redis:
  url: redis://127.0.0.1:6379
evidence_base_url: https://evidence.example.com
streams:
  redelivery_timeout: PT2M
consumer:
  claim_lease: 90s
dedup:
  ttl: 12h
"#;
        let config: Config = serde_saphyr::from_str(yaml).unwrap();
        assert_eq!(config.streams.redelivery_timeout, Duration::from_secs(120));
        assert_eq!(config.consumer.claim_lease, Duration::from_secs(90));
        assert_eq!(config.dedup.ttl, Duration::from_secs(43200));
    }

    #[test]
    fn test_consumer_names() {
        let streams = StreamSettings {
            instance: "bridge-a".into(),
            decisions: Some("gate_decisions".into()),
            ..StreamSettings::default()
        };
        assert_eq!(streams.consumer_name(1), "bridge-a-1");
        assert_eq!(streams.decision_stream(), "gate_decisions");
    }

    #[test]
    fn test_slack_settings_debug_redacts_secrets() {
        let slack = SlackSettings {
            bot_token: "xoxb-secret".into(),
            signing_secret: Some("shh".into()),
            api_base_url: None,
            timeout: default_slack_timeout(),
            rate_limit_per_sec: 1,
        };
        let debug = format!("{slack:?}");
        assert!(!debug.contains("xoxb-secret"));
        assert!(!debug.contains("shh"));
    }

    #[test]
    fn test_empty_signing_secret_is_unset() {
        let slack = SlackSettings {
            bot_token: "xoxb".into(),
            signing_secret: Some(String::new()),
            api_base_url: None,
            timeout: default_slack_timeout(),
            rate_limit_per_sec: 1,
        };
        assert!(slack.signing_secret().is_none());
    }
}
