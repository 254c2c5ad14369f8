use async_trait::async_trait;
use thiserror::Error;

use super::store_types::{
    ApiKeyRecord, BalanceRecord, PricingRecord, TransactionKind, UsageRecord, UsageSummary,
    UserRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "store-sqlite")]
    #[error(transparent)]
    Sqlite(#[from] super::sqlite_store::SqliteStoreError),
    #[cfg(feature = "store-redis")]
    #[error(transparent)]
    Redis(#[from] super::redis_store::RedisStoreError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence the request path depends on. Key issuance, user management,
/// and payments live elsewhere and only meet the gateway through these rows.
#[async_trait]
pub trait GatewayStore: Send + Sync {
    async fn api_keys_by_prefix(&self, key_prefix: &str)
    -> Result<Vec<ApiKeyRecord>, StoreError>;

    async fn touch_api_key(&self, api_key_id: &str, now_ms: i64) -> Result<(), StoreError>;

    async fn user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError>;

    /// The active pricing row for `model`, if any.
    async fn active_pricing(&self, model: &str) -> Result<Option<PricingRecord>, StoreError>;

    /// The encrypted master credential for `provider`, if one is active.
    async fn provider_credential(&self, provider: &str) -> Result<Option<String>, StoreError>;

    /// Reads the balance row, creating a zero row for unseen users.
    async fn balance_record(&self, user_id: &str) -> Result<BalanceRecord, StoreError>;

    async fn balance(&self, user_id: &str) -> Result<i64, StoreError> {
        Ok(self.balance_record(user_id).await?.balance_usd_micros)
    }

    /// Adds `amount_usd_micros` (negative for debits) to the balance and
    /// appends the matching transaction in one atomic step. Returns the new
    /// balance and the transaction id.
    async fn apply_transaction(
        &self,
        user_id: &str,
        amount_usd_micros: i64,
        kind: TransactionKind,
        description: &str,
    ) -> Result<(i64, i64), StoreError>;

    async fn insert_usage(&self, record: &UsageRecord) -> Result<(), StoreError>;

    async fn usage_summary(
        &self,
        user_id: &str,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<UsageSummary, StoreError>;
}

/// Sliding-window request log keyed by credential prefix.
#[async_trait]
pub trait RateWindowStore: Send + Sync {
    /// Admits the request iff fewer than `limit` requests were admitted in
    /// `(now_ms - window_ms, now_ms]`, recording it when admitted. Entries
    /// older than `prune_before_ms` may be dropped along the way.
    async fn try_admit(
        &self,
        key_prefix: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
        prune_before_ms: i64,
    ) -> Result<bool, StoreError>;
}
