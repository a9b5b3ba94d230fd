//! Redis-backed bucket store shared by every service instance.
//!
//! Each bucket is a hash with three fields: `tokens` (float), `last`
//! (epoch milliseconds), and `rev` (write counter). Conditional writes run as
//! a Lua script so the revision check and the update happen in one atomic
//! server-side step.

use crate::admission::store::{BucketStore, Snapshot, StoreError, StoredBucket};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::collections::HashMap;
use tokio::sync::OnceCell;
use turnstile_core::TokenBucket;

const FIELD_TOKENS: &str = "tokens";
const FIELD_LAST: &str = "last";
const FIELD_REV: &str = "rev";

/// KEYS[1] = bucket key; ARGV = expected rev, tokens, last, ttl ms (0 = none).
/// Returns 1 when written, 0 on revision mismatch.
const CAS_SCRIPT: &str = r#"
local current = tonumber(redis.call('HGET', KEYS[1], 'rev'))
if current == nil or current < 0 or current ~= math.floor(current) then
  current = 0
end
if current ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('HSET', KEYS[1], 'tokens', ARGV[2], 'last', ARGV[3], 'rev', current + 1)
local ttl = tonumber(ARGV[4])
if ttl ~= nil and ttl > 0 then
  redis.call('PEXPIRE', KEYS[1], ttl)
end
return 1
"#;

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub host: String,
    pub port: u16,
    /// Namespace prepended to every client key.
    pub key_prefix: String,
    /// Idle buckets expire after this many milliseconds; 0 keeps them forever.
    pub key_ttl_ms: u64,
}

impl RedisStoreConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

/// [`BucketStore`] backed by a Redis server.
///
/// The connection is opened on first use and re-established automatically
/// by [`ConnectionManager`], so the service can start while Redis is down.
pub struct RedisStore {
    client: Client,
    conn: OnceCell<ConnectionManager>,
    script: Script,
    key_prefix: String,
    key_ttl_ms: u64,
}

impl RedisStore {
    pub fn new(config: &RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url()).map_err(unavailable)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            script: Script::new(CAS_SCRIPT),
            key_prefix: config.key_prefix.clone(),
            key_ttl_ms: config.key_ttl_ms,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .map_err(unavailable)?;
        Ok(conn.clone())
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Decode the fields returned by `HGETALL`.
///
/// Anything that does not describe a valid bucket is reported as
/// [`StoredBucket::Malformed`] rather than an error; the revision is read the
/// same way the CAS script reads it so a corrupt record can be overwritten.
pub fn decode_record(fields: &HashMap<String, String>) -> Snapshot {
    if fields.is_empty() {
        return Snapshot::absent();
    }
    let revision = fields
        .get(FIELD_REV)
        .and_then(|v| parse_revision(v))
        .unwrap_or(0);

    let tokens = fields
        .get(FIELD_TOKENS)
        .and_then(|v| v.trim().parse::<f64>().ok());
    let last = fields.get(FIELD_LAST).and_then(|v| parse_millis(v));

    let stored = match (tokens, last) {
        (Some(tokens), Some(last_refill_ms)) => {
            let bucket = TokenBucket {
                tokens,
                last_refill_ms,
            };
            if bucket.is_well_formed() {
                StoredBucket::Present(bucket)
            } else {
                StoredBucket::Malformed
            }
        }
        _ => StoredBucket::Malformed,
    };
    Snapshot { stored, revision }
}

fn parse_millis(v: &str) -> Option<u64> {
    let v = v.trim();
    if let Ok(ms) = v.parse::<u64>() {
        return Some(ms);
    }
    // Older writers stored timestamps as floats.
    match v.parse::<f64>() {
        Ok(ms) if ms.is_finite() && ms >= 0.0 => Some(ms as u64),
        _ => None,
    }
}

/// Mirrors the script: non-negative integral numbers count, anything else is 0.
fn parse_revision(v: &str) -> Option<u64> {
    let v = v.trim();
    if let Ok(rev) = v.parse::<u64>() {
        return Some(rev);
    }
    match v.parse::<f64>() {
        Ok(rev) if rev.is_finite() && rev >= 0.0 && rev.fract() == 0.0 => Some(rev as u64),
        _ => None,
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Snapshot, StoreError> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(decode_record(&fields))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        bucket: &TokenBucket,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let written: i64 = self
            .script
            .key(self.namespaced(key))
            .arg(expected_revision)
            .arg(bucket.tokens)
            .arg(bucket.last_refill_ms)
            .arg(self.key_ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(written == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
