//! Redis-backed state store
//!
//! Each session is one hash under `{prefix}record:{session_id}` with the
//! fields `fields`, `version`, `deleted`, `created_at` and `updated_at`;
//! bookkeeping lives under `{prefix}session:{session_id}`. The compare-and-swap
//! and the delete run as Lua scripts, which Redis executes atomically. A
//! deleted record stays behind as a tombstone (`deleted = 1`) holding its
//! last version, so versions keep rising when the session is written again.
//!
//! # Security Features
//!
//! - Keys are prefixed to isolate them from other Redis data
//! - Consider enabling Redis AUTH and TLS in production

use super::{Fields, Session, StateRecord, StateStore, StoreError, StoreResult, Version};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Returns `{1, new_version}` on success or `{0, current_version}` on conflict.
const PUT_SCRIPT: &str = r#"
local current = tonumber(redis.call('HGET', KEYS[1], 'version')) or 0
local live = current > 0 and redis.call('HGET', KEYS[1], 'deleted') ~= '1'
local expected = tonumber(ARGV[1])
if (expected == 0 and live) or (expected ~= 0 and (not live or current ~= expected)) then
    return {0, current}
end
local next_version = current + 1
if not live then
    redis.call('HSET', KEYS[1], 'created_at', ARGV[3])
end
redis.call('HSET', KEYS[1], 'fields', ARGV[2], 'version', next_version, 'deleted', '0', 'updated_at', ARGV[3])
return {1, next_version}
"#;

/// Returns the tombstone version, or 0 when there is no live record.
const DELETE_SCRIPT: &str = r#"
local current = tonumber(redis.call('HGET', KEYS[1], 'version')) or 0
if current == 0 or redis.call('HGET', KEYS[1], 'deleted') == '1' then
    return 0
end
local next_version = current + 1
redis.call('HSET', KEYS[1], 'fields', '{}', 'version', next_version, 'deleted', '1', 'updated_at', ARGV[1])
return next_version
"#;

fn map_redis_error(e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

fn parse_timestamp(raw: Option<&String>, field: &str) -> StoreResult<DateTime<Utc>> {
    let raw = raw.ok_or_else(|| StoreError::Serialization(format!("missing '{}'", field)))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("invalid '{}': {}", field, e)))
}

/// Redis-backed state store (shared across processes)
pub struct RedisStore {
    client: redis::Client,
    /// Key prefix
    prefix: String,
    put_script: redis::Script,
    delete_script: redis::Script,
}

impl RedisStore {
    /// Create a new Redis store
    ///
    /// # Errors
    ///
    /// Returns error if Redis URL is invalid
    pub fn new(redis_url: &str) -> StoreResult<Self> {
        Self::with_prefix(redis_url, "recall:")
    }

    /// Create with a custom key prefix
    pub fn with_prefix(redis_url: &str, prefix: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Backend(format!("Invalid Redis URL: {}", e)))?;

        Ok(Self {
            client,
            prefix: prefix.to_string(),
            put_script: redis::Script::new(PUT_SCRIPT),
            delete_script: redis::Script::new(DELETE_SCRIPT),
        })
    }

    fn record_key(&self, session_id: &str) -> String {
        format!("{}record:{}", self.prefix, session_id)
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("{}session:{}", self.prefix, session_id)
    }

    async fn get_connection(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Redis connection failed: {}", e)))
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, session_id: &str) -> StoreResult<Option<StateRecord>> {
        let mut conn = self.get_connection().await?;
        let hash: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.record_key(session_id))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if hash.is_empty() || hash.get("deleted").map(String::as_str) == Some("1") {
            return Ok(None);
        }

        let fields: Fields = match hash.get("fields") {
            Some(json) => serde_json::from_str(json)?,
            None => Fields::new(),
        };
        let version = hash
            .get("version")
            .and_then(|v| v.parse::<Version>().ok())
            .ok_or_else(|| StoreError::Serialization("missing or invalid 'version'".to_string()))?;

        debug!(session_id = %session_id, version = version, "State record loaded from Redis");
        Ok(Some(StateRecord {
            session_id: session_id.to_string(),
            fields,
            version,
            created_at: parse_timestamp(hash.get("created_at"), "created_at")?,
            updated_at: parse_timestamp(hash.get("updated_at"), "updated_at")?,
        }))
    }

    async fn put(
        &self,
        session_id: &str,
        fields: &Fields,
        expected_version: Version,
    ) -> StoreResult<Version> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(fields)?;
        let now = Utc::now().to_rfc3339();

        let reply: Vec<i64> = self
            .put_script
            .key(self.record_key(session_id))
            .arg(expected_version)
            .arg(&json)
            .arg(&now)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        match reply.as_slice() {
            [1, version] => {
                let version = (*version).max(0) as Version;
                debug!(session_id = %session_id, version = version, "State record saved to Redis");
                Ok(version)
            }
            [0, actual] => {
                let actual = (*actual).max(0) as Version;
                warn!(
                    session_id = %session_id,
                    expected = expected_version,
                    actual = actual,
                    "Version conflict on Redis put"
                );
                Err(StoreError::VersionConflict {
                    session_id: session_id.to_string(),
                    expected: expected_version,
                    actual,
                })
            }
            other => Err(StoreError::Backend(format!(
                "unexpected put script reply: {:?}",
                other
            ))),
        }
    }

    async fn delete(&self, session_id: &str) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let tombstone: i64 = self
            .delete_script
            .key(self.record_key(session_id))
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if tombstone == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        debug!(session_id = %session_id, tombstone = tombstone, "State record deleted from Redis");
        Ok(())
    }

    async fn touch(&self, session_id: &str) -> StoreResult<Session> {
        let mut conn = self.get_connection().await?;
        let key = self.session_key(session_id);
        let now = Utc::now().to_rfc3339();

        let (_, _, hash): (i64, i64, HashMap<String, String>) = redis::pipe()
            .atomic()
            .cmd("HSETNX")
            .arg(&key)
            .arg("created_at")
            .arg(&now)
            .cmd("HSET")
            .arg(&key)
            .arg("last_seen_at")
            .arg(&now)
            .cmd("HGETALL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(Session {
            session_id: session_id.to_string(),
            created_at: parse_timestamp(hash.get("created_at"), "created_at")?,
            last_seen_at: parse_timestamp(hash.get("last_seen_at"), "last_seen_at")?,
        })
    }

    async fn session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let mut conn = self.get_connection().await?;
        let hash: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.session_key(session_id))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(Session {
            session_id: session_id.to_string(),
            created_at: parse_timestamp(hash.get("created_at"), "created_at")?,
            last_seen_at: parse_timestamp(hash.get("last_seen_at"), "last_seen_at")?,
        }))
    }

    async fn list_keys(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let record_prefix = format!("{}record:", self.prefix);

        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}*", record_prefix))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.cmd("HGET").arg(key).arg("deleted");
        }
        let deleted: Vec<Option<String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let mut session_ids: Vec<String> = keys
            .iter()
            .zip(deleted)
            .filter(|(_, flag)| flag.as_deref() != Some("1"))
            .filter_map(|(k, _)| k.strip_prefix(&record_prefix).map(str::to_string))
            .collect();
        session_ids.sort();

        warn!(
            count = session_ids.len(),
            "Listed all session keys from Redis (use with caution)"
        );
        Ok(session_ids)
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}
