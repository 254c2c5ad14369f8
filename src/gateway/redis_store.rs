use async_trait::async_trait;
use thiserror::Error;

use super::store::{RateWindowStore, StoreError};

/// Sliding-window log shared by every gateway instance pointed at the same
/// Redis. One sorted set per credential prefix, scored by admission time.
const RATE_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local prune_before = tonumber(ARGV[4])

redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", "(" .. prune_before)
local count = redis.call("ZCOUNT", KEYS[1], "(" .. (now - window), "+inf")
if count >= limit then
  return 0
end

local seq = redis.call("INCR", KEYS[2])
redis.call("ZADD", KEYS[1], now, now .. ":" .. seq)
redis.call("PEXPIRE", KEYS[1], window * 2)
redis.call("PEXPIRE", KEYS[2], window * 2)
return 1
"#;

#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

#[derive(Debug, Error)]
pub enum RedisStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, RedisStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "vuzo".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn key_rate_window(&self, key_prefix: &str) -> String {
        format!("{}:rate_window:{key_prefix}", self.prefix)
    }

    fn key_rate_window_seq(&self, key_prefix: &str) -> String {
        format!("{}:rate_window_seq:{key_prefix}", self.prefix)
    }
}

#[async_trait]
impl RateWindowStore for RedisStore {
    async fn try_admit(
        &self,
        key_prefix: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
        prune_before_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await.map_err(RedisStoreError::from)?;
        let script = redis::Script::new(RATE_WINDOW_SCRIPT);
        let admitted: i64 = script
            .key(self.key_rate_window(key_prefix))
            .key(self.key_rate_window_seq(key_prefix))
            .arg(now_ms)
            .arg(window_ms)
            .arg(i64::from(limit))
            .arg(prune_before_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(RedisStoreError::from)?;
        Ok(admitted == 1)
    }
}
