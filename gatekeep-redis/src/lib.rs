//! Redis limiter store for `gatekeep` (companion crate).
//!
//! Layout, shared with every other process using the same Redis:
//!
//! - `apiKey:<id>`: hash `{id, maxRequests}`, no expiry.
//! - `client:<id>`: hash `{id, currentRequests, blocked}`, expired with
//!   `PEXPIRE` using the record's time to live.
//!
//! Compare-and-persist runs as a Lua script so the check and the write happen
//! in one server-side step.

use async_trait::async_trait;
use gatekeep::{ApiKeyPolicy, LimiterStore, StoreError, UsageRecord};
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::time::Duration;

/// Key namespace for API key policies.
pub const KEYSPACE_API_KEY: &str = "apiKey";
/// Key namespace for usage records.
pub const KEYSPACE_CLIENT: &str = "client";

const COMPARE_AND_PERSIST: &str = r#"
local key = KEYS[1]
local exists = redis.call('EXISTS', key)
if ARGV[1] == '0' then
    if exists == 1 then return 0 end
else
    if exists == 0 then return 0 end
    local current = redis.call('HMGET', key, 'currentRequests', 'blocked')
    if current[1] ~= ARGV[2] or current[2] ~= ARGV[3] then return 0 end
end
redis.call('HSET', key, 'id', ARGV[4], 'currentRequests', ARGV[5], 'blocked', ARGV[6])
redis.call('PEXPIRE', key, ARGV[7])
return 1
"#;

/// Build the store key for `id` inside `keyspace`.
pub fn store_key(keyspace: &str, id: &str) -> String {
    format!("{}:{}", keyspace, id)
}

/// Limiter store backed by Redis hashes.
///
/// Clones share the same multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    compare_and_persist: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("conn", &"<redis::aio::ConnectionManager>").finish()
    }
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://:password@localhost:6379")
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        Ok(Self::from_connection(conn))
    }

    /// Use an existing connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn, compare_and_persist: Script::new(COMPARE_AND_PERSIST) }
    }
}

fn unavailable(e: redis::RedisError) -> StoreError {
    tracing::warn!(target: "gatekeep::redis", error = %e, "redis command failed");
    StoreError::Unavailable(e.to_string())
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn encode_bool(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn decode_bool(key: &str, raw: &str) -> Result<bool, StoreError> {
    match raw {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(StoreError::Corrupt { key: key.into(), reason: format!("blocked = {:?}", other) }),
    }
}

fn field<'a>(key: &str, map: &'a HashMap<String, String>, name: &str) -> Result<&'a str, StoreError> {
    map.get(name)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Corrupt { key: key.into(), reason: format!("missing field {}", name) })
}

fn decode_u32(key: &str, map: &HashMap<String, String>, name: &str) -> Result<u32, StoreError> {
    let raw = field(key, map, name)?;
    raw.parse().map_err(|_| StoreError::Corrupt {
        key: key.into(),
        reason: format!("{} = {:?} is not a non-negative integer", name, raw),
    })
}

fn decode_policy(key: &str, id: &str, map: &HashMap<String, String>) -> Result<ApiKeyPolicy, StoreError> {
    let max_requests = decode_u32(key, map, "maxRequests")?;
    let id = map.get("id").cloned().unwrap_or_else(|| id.to_string());
    ApiKeyPolicy::new(id, max_requests)
        .map_err(|e| StoreError::Corrupt { key: key.into(), reason: e.to_string() })
}

fn decode_record(
    key: &str,
    id: &str,
    map: &HashMap<String, String>,
    pttl: i64,
) -> Result<UsageRecord, StoreError> {
    Ok(UsageRecord {
        id: map.get("id").cloned().unwrap_or_else(|| id.to_string()),
        current_requests: decode_u32(key, map, "currentRequests")?,
        // -1 (no expiry) only happens if something outside the limiter wrote the key.
        time_to_live: Duration::from_millis(u64::try_from(pttl).unwrap_or(0)),
        blocked: decode_bool(key, field(key, map, "blocked")?)?,
    })
}

#[async_trait]
impl LimiterStore for RedisStore {
    async fn fetch_policy(&self, id: &str) -> Result<Option<ApiKeyPolicy>, StoreError> {
        let mut conn = self.conn.clone();
        let key = store_key(KEYSPACE_API_KEY, id);
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if map.is_empty() {
            return Ok(None);
        }
        decode_policy(&key, id, &map).map(Some)
    }

    async fn fetch_record(&self, id: &str) -> Result<Option<UsageRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let key = store_key(KEYSPACE_CLIENT, id);
        let (map, pttl): (HashMap<String, String>, i64) = redis::pipe()
            .atomic()
            .hgetall(&key)
            .pttl(&key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        // -2: key missing or already expired
        if map.is_empty() || pttl == -2 {
            return Ok(None);
        }
        decode_record(&key, id, &map, pttl).map(Some)
    }

    async fn persist_policy(&self, policy: &ApiKeyPolicy) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = store_key(KEYSPACE_API_KEY, &policy.id);
        redis::pipe()
            .hset_multiple(
                &key,
                &[("id", policy.id.clone()), ("maxRequests", policy.max_requests.to_string())],
            )
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn persist_record(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = store_key(KEYSPACE_CLIENT, &record.id);
        redis::pipe()
            .atomic()
            .hset_multiple(
                &key,
                &[
                    ("id", record.id.clone()),
                    ("currentRequests", record.current_requests.to_string()),
                    ("blocked", encode_bool(record.blocked).to_string()),
                ],
            )
            .ignore()
            .pexpire(&key, ttl_millis(record.time_to_live))
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn compare_and_persist(
        &self,
        expected: Option<&UsageRecord>,
        record: &UsageRecord,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let key = store_key(KEYSPACE_CLIENT, &record.id);
        let (present, expected_count, expected_blocked) = match expected {
            Some(prev) => ("1", prev.current_requests.to_string(), encode_bool(prev.blocked)),
            None => ("0", String::new(), ""),
        };

        let written: i64 = self
            .compare_and_persist
            .key(&key)
            .arg(present)
            .arg(expected_count)
            .arg(expected_blocked)
            .arg(&record.id)
            .arg(record.current_requests.to_string())
            .arg(encode_bool(record.blocked))
            .arg(ttl_millis(record.time_to_live))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(written == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn keys_follow_shared_layout() {
        assert_eq!(store_key(KEYSPACE_API_KEY, "K1"), "apiKey:K1");
        assert_eq!(store_key(KEYSPACE_CLIENT, "10.0.0.1"), "client:10.0.0.1");
    }

    #[test]
    fn decodes_records_with_remaining_ttl() {
        let fields = map(&[("id", "10.0.0.1"), ("currentRequests", "3"), ("blocked", "true")]);
        let record = decode_record("client:10.0.0.1", "10.0.0.1", &fields, 2500).unwrap();
        assert_eq!(record.current_requests, 3);
        assert!(record.blocked);
        assert_eq!(record.time_to_live, Duration::from_millis(2500));
    }

    #[test]
    fn malformed_fields_are_corrupt_not_absent() {
        let fields = map(&[("id", "x"), ("currentRequests", "-1"), ("blocked", "false")]);
        assert!(matches!(
            decode_record("client:x", "x", &fields, 10),
            Err(StoreError::Corrupt { .. })
        ));
        let fields = map(&[("id", "x"), ("currentRequests", "1"), ("blocked", "maybe")]);
        assert!(matches!(
            decode_record("client:x", "x", &fields, 10),
            Err(StoreError::Corrupt { .. })
        ));
        let fields = map(&[("id", "K1"), ("maxRequests", "0")]);
        assert!(matches!(decode_policy("apiKey:K1", "K1", &fields), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn ttl_is_at_least_one_millisecond() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
