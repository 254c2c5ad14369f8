use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::GatewayError;
use super::store::{RateWindowStore, StoreError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Applied to keys without their own `rate_limit_rpm`. Scaled to the
    /// window length when `window_seconds` is not 60.
    pub requests_per_minute: u32,
    pub window_seconds: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            window_seconds: 60,
        }
    }
}

/// Per-credential sliding-window limiter. A failing window store admits the
/// request: availability wins over strict enforcement.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateWindowStore>,
    window_ms: i64,
    default_rpm: u32,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window_ms", &self.window_ms)
            .field("default_rpm", &self.default_rpm)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateWindowStore>, config: &LimitsConfig) -> Self {
        let window_ms = i64::try_from(config.window_seconds.max(1))
            .unwrap_or(60)
            .saturating_mul(1_000);
        Self {
            store,
            window_ms,
            default_rpm: config.requests_per_minute,
        }
    }

    pub fn in_memory(config: &LimitsConfig) -> Self {
        Self::new(Arc::new(MemoryWindowStore::default()), config)
    }

    /// Requests admitted per window for a per-minute rate, rounded up and
    /// never below one.
    fn ceiling(&self, requests_per_minute: u32) -> u32 {
        let window_ms = u64::try_from(self.window_ms).unwrap_or(60_000);
        let scaled = u64::from(requests_per_minute)
            .saturating_mul(window_ms)
            .div_ceil(60_000)
            .max(1);
        u32::try_from(scaled).unwrap_or(u32::MAX)
    }

    pub async fn admit(
        &self,
        key_prefix: &str,
        rate_limit_rpm: Option<u32>,
        now_ms: i64,
    ) -> Result<(), GatewayError> {
        let limit = self.ceiling(rate_limit_rpm.unwrap_or(self.default_rpm));
        let prune_before_ms = now_ms.saturating_sub(self.window_ms.saturating_mul(2));

        match self
            .store
            .try_admit(key_prefix, now_ms, self.window_ms, limit, prune_before_ms)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(GatewayError::RateLimited { limit }),
            Err(err) => {
                tracing::warn!(key_prefix, error = %err, "rate limit store failed; admitting request");
                Ok(())
            }
        }
    }
}

/// Single-process window log, for tests and deployments without a shared
/// store.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    windows: Mutex<HashMap<String, VecDeque<i64>>>,
}

#[async_trait]
impl RateWindowStore for MemoryWindowStore {
    async fn try_admit(
        &self,
        key_prefix: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
        prune_before_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| StoreError::Unavailable("rate window lock poisoned".to_string()))?;

        windows.retain(|_, log| {
            while log.front().is_some_and(|ts| *ts < prune_before_ms) {
                log.pop_front();
            }
            !log.is_empty()
        });

        let log = windows.entry(key_prefix.to_string()).or_default();
        let window_start = now_ms.saturating_sub(window_ms);
        let in_window = log.iter().filter(|ts| **ts > window_start).count();
        if in_window >= limit as usize {
            return Ok(false);
        }
        log.push_back(now_ms);
        Ok(true)
    }
}
