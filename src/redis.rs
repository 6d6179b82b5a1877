//! Redis-backed quota store shared by every instance serving the API.
//!
//! Each client is a hash `{count, reset_at}` with `reset_at` in epoch
//! milliseconds. Writes go through a Lua script so the compare and the
//! swap happen as one Redis command, and each write re-arms a `PEXPIRE`
//! matching the window so idle clients disappear on their own.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use regex::Regex;

use crate::error::{Result, ThrottlerError};
use crate::quota_store::{ClientQuotaRecord, QuotaStore};

const KEY_PREFIX: &str = "throttler:quota";

// '%' is escaped too, so distinct identities never share a key.
static UNSAFE_KEY_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9:._\-]").expect("static regex"));

// ARGV: has_expected, expected_count, expected_reset_at, count, reset_at, ttl_ms
const CAS_SCRIPT: &str = r#"
local current = redis.call('HMGET', KEYS[1], 'count', 'reset_at')
if ARGV[1] == '0' then
  if current[1] then
    return 0
  end
elseif current[1] ~= ARGV[2] or current[2] ~= ARGV[3] then
  return 0
end
redis.call('HSET', KEYS[1], 'count', ARGV[4], 'reset_at', ARGV[5])
redis.call('PEXPIRE', KEYS[1], ARGV[6])
return 1
"#;

pub struct RedisQuotaStore {
    connection: MultiplexedConnection,
    cas: Script,
}

impl RedisQuotaStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| ThrottlerError::Redis(format!("Failed to create Redis client: {}", e)))?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| ThrottlerError::Redis(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Self {
            connection,
            cas: Script::new(CAS_SCRIPT),
        })
    }

    /// Namespaced Redis key for a client identity
    pub fn redis_key(identity: &str) -> String {
        format!("{}:{}", KEY_PREFIX, escape_key(identity))
    }
}

/// Percent-encode every byte outside the key-safe set.
pub fn escape_key(key: &str) -> String {
    UNSAFE_KEY_CHARS
        .replace_all(key, |caps: &regex::Captures| {
            caps[0].bytes().map(|byte| format!("%{:02X}", byte)).collect::<String>()
        })
        .into_owned()
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| ThrottlerError::Internal(format!("Stored reset time {} is out of range", ms)))
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn get(&self, identity: &str) -> Result<Option<ClientQuotaRecord>> {
        let mut conn = self.connection.clone();
        let (count, reset_at): (Option<u32>, Option<i64>) = redis::cmd("HMGET")
            .arg(Self::redis_key(identity))
            .arg("count")
            .arg("reset_at")
            .query_async(&mut conn)
            .await?;

        match (count, reset_at) {
            (Some(count), Some(reset_at)) => {
                Ok(Some(ClientQuotaRecord::new(count, from_millis(reset_at)?)))
            }
            _ => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        identity: &str,
        expected: Option<&ClientQuotaRecord>,
        new: ClientQuotaRecord,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let (has_expected, expected_count, expected_reset) = match expected {
            Some(record) => (1, record.count, to_millis(record.window_reset_at)),
            None => (0, 0, 0),
        };
        let ttl_ms = (to_millis(new.window_reset_at) - to_millis(now)).max(1);

        let mut conn = self.connection.clone();
        let swapped: i32 = self
            .cas
            .key(Self::redis_key(identity))
            .arg(has_expected)
            .arg(expected_count)
            .arg(expected_reset)
            .arg(new.count)
            .arg(to_millis(new.window_reset_at))
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(swapped == 1)
    }

    async fn sweep(&self, _now: DateTime<Utc>) -> Result<usize> {
        // Keys carry their own PEXPIRE.
        Ok(0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| ThrottlerError::Redis(format!("Ping failed: {}", e)))?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_key() {
        assert_eq!(escape_key("key:abc def/ghi"), "key:abc%20def%2Fghi");
        assert_eq!(escape_key("ip:2001:db8::1"), "ip:2001:db8::1");
        assert_eq!(escape_key("key:50%"), "key:50%25");
        assert_eq!(escape_key("key:é"), "key:%C3%A9");
    }

    #[test]
    fn test_distinct_identities_get_distinct_keys() {
        assert_ne!(
            RedisQuotaStore::redis_key("key:abc+def="),
            RedisQuotaStore::redis_key("key:abc/def_")
        );
        assert_ne!(
            RedisQuotaStore::redis_key("key:a b"),
            RedisQuotaStore::redis_key("key:a_b")
        );
        assert_ne!(
            RedisQuotaStore::redis_key("key:%20"),
            RedisQuotaStore::redis_key("key: ")
        );
    }

    #[test]
    fn test_redis_key_is_namespaced() {
        assert_eq!(
            RedisQuotaStore::redis_key("ip:1.2.3.4"),
            "throttler:quota:ip:1.2.3.4"
        );
    }

    #[test]
    fn test_reset_time_round_trips_through_millis() {
        let at = Utc.timestamp_millis_opt(1_700_000_060_123).unwrap();
        assert_eq!(from_millis(to_millis(at)).unwrap(), at);
    }

    // The tests below need a live server and run only when REDIS_URL is set.
    async fn live_store() -> Option<RedisQuotaStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        Some(RedisQuotaStore::connect(&url).await.unwrap())
    }

    fn unique_identity() -> String {
        format!("key:test-{}", uuid::Uuid::new_v4())
    }

    fn window_from(now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::seconds(60)
    }

    #[tokio::test]
    async fn test_redis_insert_requires_absent_record() {
        let Some(store) = live_store().await else {
            return;
        };
        let identity = unique_identity();
        let now = Utc::now();
        let first = ClientQuotaRecord::new(1, from_millis(to_millis(window_from(now))).unwrap());

        assert!(store.compare_and_swap(&identity, None, first, now).await.unwrap());
        assert!(!store.compare_and_swap(&identity, None, first, now).await.unwrap());
        assert_eq!(store.get(&identity).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_redis_stale_expectation_is_rejected() {
        let Some(store) = live_store().await else {
            return;
        };
        let identity = unique_identity();
        let now = Utc::now();
        let reset_at = from_millis(to_millis(window_from(now))).unwrap();
        let first = ClientQuotaRecord::new(1, reset_at);
        let second = ClientQuotaRecord::new(2, reset_at);
        store.compare_and_swap(&identity, None, first, now).await.unwrap();
        assert!(store.compare_and_swap(&identity, Some(&first), second, now).await.unwrap());

        let third = ClientQuotaRecord::new(2, reset_at);
        assert!(!store.compare_and_swap(&identity, Some(&first), third, now).await.unwrap());
        assert_eq!(store.get(&identity).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_redis_write_arms_expiry() {
        let Some(store) = live_store().await else {
            return;
        };
        let identity = unique_identity();
        let now = Utc::now();
        let record = ClientQuotaRecord::new(1, window_from(now));
        store.compare_and_swap(&identity, None, record, now).await.unwrap();

        let mut conn = store.connection.clone();
        let ttl_ms: i64 = redis::cmd("PTTL")
            .arg(RedisQuotaStore::redis_key(&identity))
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(ttl_ms > 0 && ttl_ms <= 60_000, "unexpected ttl {}", ttl_ms);
    }
}
