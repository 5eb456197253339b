//! Redis Streams event log.
//!
//! - `XGROUP CREATE ... MKSTREAM` on start (BUSYGROUP is fine)
//! - `XAUTOCLAIM` idle entries before reading new ones with `XREADGROUP >`
//! - `XACK` on acknowledge, `XADD` for decision events
//!
//! Blocking reads hold a connection for up to the block timeout, so each
//! consumer owns its own connection manager.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{DecisionEvent, EventFields, EventLog, EventPublisher, LogEntry, LogError};
use crate::config::redis_millis;

/// Stream and group naming for one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStreamConfig {
    /// Stream carrying `GATE_REQUESTED`
    pub stream: String,
    /// Consumer group shared by all bridge instances
    pub group: String,
    /// This consumer's name within the group
    pub consumer: String,
    /// Stream decision events are appended to
    pub decision_stream: String,
    /// Idle time after which another consumer may take an entry
    pub redelivery_timeout: Duration,
}

/// Redis Streams implementation of [`EventLog`] and [`EventPublisher`].
#[derive(Clone)]
pub struct RedisEventLog {
    manager: ConnectionManager,
    config: RedisStreamConfig,
}

impl std::fmt::Debug for RedisEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEventLog")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl From<redis::RedisError> for LogError {
    fn from(e: redis::RedisError) -> Self {
        Self::Unavailable {
            reason: e.to_string(),
        }
    }
}

impl RedisEventLog {
    /// Opens a dedicated connection for this consumer.
    ///
    /// # Errors
    ///
    /// Returns `LogError::Unavailable` if Redis cannot be reached.
    pub async fn connect(url: &str, config: RedisStreamConfig) -> Result<Self, LogError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager, config })
    }

    /// Stream/group settings.
    #[must_use]
    pub fn config(&self) -> &RedisStreamConfig {
        &self.config
    }

    async fn autoclaim(&self, count: usize) -> Result<Vec<LogEntry>, LogError> {
        let mut conn = self.manager.clone();
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(redis_millis(self.config.redelivery_timeout))
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        parse_autoclaim(&reply)
    }
}

/// Reads the claimed-entries element of an `XAUTOCLAIM` reply.
///
/// Entries deleted from the stream come back with nil fields and are skipped.
fn parse_autoclaim(reply: &redis::Value) -> Result<Vec<LogEntry>, LogError> {
    let redis::Value::Bulk(parts) = reply else {
        return Err(LogError::Protocol {
            reason: "XAUTOCLAIM reply is not an array".to_string(),
        });
    };
    let Some(claimed) = parts.get(1) else {
        return Err(LogError::Protocol {
            reason: "XAUTOCLAIM reply has no entries element".to_string(),
        });
    };
    let redis::Value::Bulk(claimed) = claimed else {
        return Err(LogError::Protocol {
            reason: "XAUTOCLAIM entries element is not an array".to_string(),
        });
    };

    let mut entries = Vec::with_capacity(claimed.len());
    for item in claimed {
        let redis::Value::Bulk(pair) = item else {
            continue;
        };
        let (Some(id), Some(fields)) = (pair.first(), pair.get(1)) else {
            continue;
        };
        if matches!(fields, redis::Value::Nil) {
            continue;
        }
        let protocol = |e: redis::RedisError| LogError::Protocol {
            reason: e.to_string(),
        };
        let id: String = redis::from_redis_value(id).map_err(protocol)?;
        let fields: HashMap<String, String> = redis::from_redis_value(fields).map_err(protocol)?;
        entries.push(LogEntry {
            id,
            fields,
            redelivered: true,
        });
    }
    Ok(entries)
}

fn entries_from_reply(reply: StreamReadReply) -> Vec<LogEntry> {
    reply
        .keys
        .into_iter()
        .flat_map(|key| key.ids)
        .map(|entry| {
            let fields: EventFields = entry
                .map
                .iter()
                .filter_map(|(name, value)| {
                    redis::from_redis_value::<String>(value)
                        .ok()
                        .map(|v| (name.clone(), v))
                })
                .collect();
            LogEntry {
                id: entry.id,
                fields,
                redelivered: false,
            }
        })
        .collect()
}

#[async_trait]
impl EventLog for RedisEventLog {
    fn consumer_name(&self) -> &str {
        &self.config.consumer
    }

    async fn ensure_group(&self) -> Result<(), LogError> {
        let mut conn = self.manager.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.config.stream, &self.config.group, "0")
            .await;
        match created {
            Ok(()) => {
                debug!(stream = %self.config.stream, group = %self.config.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, count: usize, block: Duration) -> Result<Vec<LogEntry>, LogError> {
        let count = count.max(1);
        let reclaimed = self.autoclaim(count).await?;
        if !reclaimed.is_empty() {
            debug!(
                consumer = %self.config.consumer,
                count = reclaimed.len(),
                "Reclaimed idle entries"
            );
            return Ok(reclaimed);
        }

        let options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(count)
            .block(usize::try_from(redis_millis(block)).unwrap_or(usize::MAX));
        let mut conn = self.manager.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.config.stream], &[">"], &options)
            .await?;
        Ok(reply.map(entries_from_reply).unwrap_or_default())
    }

    async fn ack(&self, entry_id: &str) -> Result<(), LogError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .xack(&self.config.stream, &self.config.group, &[entry_id])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for RedisEventLog {
    async fn publish(&self, event: &DecisionEvent) -> Result<String, LogError> {
        let mut conn = self.manager.clone();
        let id: String = conn
            .xadd(&self.config.decision_stream, "*", &event.to_fields())
            .await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_autoclaim_reply() {
        let reply = Value::Bulk(vec![
            data("0-0"),
            Value::Bulk(vec![
                Value::Bulk(vec![
                    data("1-0"),
                    Value::Bulk(vec![data("event_type"), data("GATE_REQUESTED")]),
                ]),
                Value::Bulk(vec![data("2-0"), Value::Nil]),
            ]),
            Value::Bulk(vec![]),
        ]);

        let entries = parse_autoclaim(&reply).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1-0");
        assert_eq!(entries[0].fields["event_type"], "GATE_REQUESTED");
        assert!(entries[0].redelivered);
    }

    #[test]
    fn test_parse_autoclaim_rejects_bad_shape() {
        assert!(matches!(
            parse_autoclaim(&Value::Nil),
            Err(LogError::Protocol { .. })
        ));
        assert!(matches!(
            parse_autoclaim(&Value::Bulk(vec![data("0-0")])),
            Err(LogError::Protocol { .. })
        ));
    }
}
