//! Redis-backed store shared by every bridge instance.
//!
//! Conditional writes run as Lua scripts so the check and the write happen
//! in one server-side step.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::sync::LazyLock;
use std::time::Duration;

use super::{CasOutcome, ClaimOutcome, DedupStore, GateStore, KeyLayout, StoreError};
use crate::chat::MessageRef;
use crate::config::redis_millis;
use crate::gate::{GateStatus, GateStatusRecord};

// ============================================================================
// Scripts
// ============================================================================

/// KEYS[1] record key; ARGV[1] expected status, ARGV[2] new JSON.
/// Returns `{0}` missing, `{1}` applied, `{2, current}` conflict.
static CAS_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local current = redis.call('GET', KEYS[1])
if not current then
  return {0}
end
local ok, decoded = pcall(cjson.decode, current)
if not ok or decoded['status'] ~= ARGV[1] then
  return {2, current}
end
redis.call('SET', KEYS[1], ARGV[2])
return {1}
",
    )
});

/// KEYS[1] posted set, KEYS[2] claim key; ARGV[1] request id, ARGV[2] owner,
/// ARGV[3] lease in ms. Returns 0 claimed, 1 already posted, 2 held elsewhere.
static CLAIM_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
  return 1
end
local holder = redis.call('GET', KEYS[2])
if holder and holder ~= ARGV[2] then
  return 2
end
redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
return 0
",
    )
});

/// KEYS[1] claim key; ARGV[1] owner.
static RELEASE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
",
    )
});

// ============================================================================
// Redis Store
// ============================================================================

/// Gate and dedup state in Redis.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    keys: KeyLayout,
    dedup_ttl: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("keys", &self.keys)
            .field("dedup_ttl", &self.dedup_ttl)
            .finish_non_exhaustive()
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        Self::Backend {
            reason: e.to_string(),
        }
    }
}

impl RedisStore {
    /// Connects to Redis and returns a store using `keys` for naming.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(
        url: &str,
        keys: KeyLayout,
        dedup_ttl: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::from_manager(manager, keys, dedup_ttl))
    }

    /// Wraps an existing connection manager.
    #[must_use]
    pub fn from_manager(manager: ConnectionManager, keys: KeyLayout, dedup_ttl: Duration) -> Self {
        Self {
            manager,
            keys,
            dedup_ttl,
        }
    }

    fn decode(&self, request_id: &str, json: &str) -> Result<GateStatusRecord, StoreError> {
        GateStatusRecord::from_json(request_id, json).map_err(|e| StoreError::Corrupt {
            key: self.keys.gate_status(request_id),
            reason: e.to_string(),
        })
    }

    fn encode(&self, record: &GateStatusRecord) -> Result<String, StoreError> {
        record.to_json().map_err(|e| StoreError::Corrupt {
            key: self.keys.gate_status(&record.request_id),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl GateStore for RedisStore {
    async fn insert_pending(&self, record: &GateStatusRecord) -> Result<bool, StoreError> {
        let json = self.encode(record)?;
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.keys.gate_status(&record.request_id))
            .arg(json)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, request_id: &str) -> Result<Option<GateStatusRecord>, StoreError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(self.keys.gate_status(request_id)).await?;
        raw.map(|json| self.decode(request_id, &json)).transpose()
    }

    async fn compare_and_set(
        &self,
        expected: GateStatus,
        updated: &GateStatusRecord,
    ) -> Result<CasOutcome, StoreError> {
        let json = self.encode(updated)?;
        let mut conn = self.manager.clone();
        let reply: Vec<redis::Value> = CAS_SCRIPT
            .key(self.keys.gate_status(&updated.request_id))
            .arg(expected.as_str())
            .arg(json)
            .invoke_async(&mut conn)
            .await?;

        let code: i64 = match reply.first() {
            Some(value) => redis::from_redis_value(value)?,
            None => {
                return Err(StoreError::Backend {
                    reason: "empty reply from compare-and-set script".to_string(),
                });
            }
        };
        match code {
            0 => Ok(CasOutcome::Missing),
            1 => Ok(CasOutcome::Applied),
            _ => {
                let current: String = match reply.get(1) {
                    Some(value) => redis::from_redis_value(value)?,
                    None => String::new(),
                };
                Ok(CasOutcome::Conflict {
                    current: self.decode(&updated.request_id, &current)?,
                })
            }
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl DedupStore for RedisStore {
    async fn claim(
        &self,
        request_id: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut conn = self.manager.clone();
        let code: i64 = CLAIM_SCRIPT
            .key(self.keys.posted_set())
            .key(self.keys.claim(request_id))
            .arg(request_id)
            .arg(owner)
            .arg(redis_millis(lease))
            .invoke_async(&mut conn)
            .await?;
        Ok(match code {
            0 => ClaimOutcome::Claimed,
            1 => ClaimOutcome::AlreadyPosted,
            _ => ClaimOutcome::HeldElsewhere,
        })
    }

    async fn mark_posted(&self, request_id: &str, message: &MessageRef) -> Result<(), StoreError> {
        let payload = serde_json::to_string(message).map_err(|e| StoreError::Corrupt {
            key: self.keys.message_refs(),
            reason: e.to_string(),
        })?;
        let ttl_secs = self.dedup_ttl.as_secs().max(1);
        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(self.keys.posted_set())
            .arg(request_id)
            .ignore()
            .cmd("EXPIRE")
            .arg(self.keys.posted_set())
            .arg(ttl_secs)
            .ignore()
            .cmd("HSET")
            .arg(self.keys.message_refs())
            .arg(request_id)
            .arg(payload)
            .ignore()
            .cmd("EXPIRE")
            .arg(self.keys.message_refs())
            .arg(ttl_secs)
            .ignore()
            .cmd("DEL")
            .arg(self.keys.claim(request_id))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn release(&self, request_id: &str, owner: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: i64 = RELEASE_SCRIPT
            .key(self.keys.claim(request_id))
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn posted_message(&self, request_id: &str) -> Result<Option<MessageRef>, StoreError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.hget(self.keys.message_refs(), request_id).await?;
        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
                key: self.keys.message_refs(),
                reason: e.to_string(),
            })
        })
        .transpose()
    }
}
