use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};
use thiserror::Error;

use super::store::{GatewayStore, RateWindowStore, StoreError};
use super::store_types::{
    ApiKeyRecord, BalanceRecord, CreditTransactionRecord, PricingRecord, TransactionKind,
    UsageRecord, UsageSummary, UserRecord,
};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn upsert_user(&self, user: &UserRecord) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let user = user.clone();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO users (id, is_active, created_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET is_active = excluded.is_active",
                rusqlite::params![user.id, user.active, ts_ms],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn upsert_api_key(&self, key: &ApiKeyRecord) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let key = key.clone();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO api_keys
                    (id, user_id, key_prefix, key_hash, is_active, rate_limit_rpm, last_used_at_ms, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    user_id = excluded.user_id,
                    key_prefix = excluded.key_prefix,
                    key_hash = excluded.key_hash,
                    is_active = excluded.is_active,
                    rate_limit_rpm = excluded.rate_limit_rpm",
                rusqlite::params![
                    key.id,
                    key.user_id,
                    key.key_prefix,
                    key.key_hash,
                    key.active,
                    key.rate_limit_rpm,
                    key.last_used_at_ms,
                    ts_ms
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn upsert_pricing(&self, pricing: &PricingRecord) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let pricing = pricing.clone();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO model_pricing
                    (model, provider, input_usd_micros_per_million, output_usd_micros_per_million,
                     markup_bps, is_active, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(model) DO UPDATE SET
                    provider = excluded.provider,
                    input_usd_micros_per_million = excluded.input_usd_micros_per_million,
                    output_usd_micros_per_million = excluded.output_usd_micros_per_million,
                    markup_bps = excluded.markup_bps,
                    is_active = excluded.is_active,
                    updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![
                    pricing.model,
                    pricing.provider,
                    u64_to_i64(pricing.input_usd_micros_per_million),
                    u64_to_i64(pricing.output_usd_micros_per_million),
                    u64_to_i64(pricing.markup_bps),
                    pricing.active,
                    ts_ms
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Stores an already-sealed vendor credential.
    pub async fn upsert_provider_credential(
        &self,
        provider: &str,
        sealed: &str,
        active: bool,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let provider = provider.to_string();
        let sealed = sealed.to_string();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO provider_keys (provider, api_key_encrypted, is_active, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(provider) DO UPDATE SET
                    api_key_encrypted = excluded.api_key_encrypted,
                    is_active = excluded.is_active,
                    updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![provider, sealed, active, ts_ms],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn list_transactions(
        &self,
        user_id: &str,
    ) -> Result<Vec<CreditTransactionRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(
            move || -> Result<Vec<CreditTransactionRecord>, SqliteStoreError> {
                let conn = open_connection(path)?;
                init_schema(&conn)?;
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, amount_usd_micros, kind, description, created_at_ms
                     FROM credit_transactions WHERE user_id = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(rusqlite::params![user_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                })?;

                let mut out = Vec::new();
                for row in rows {
                    let (id, user_id, amount_usd_micros, kind, description, created_at_ms) = row?;
                    let kind = TransactionKind::parse(&kind).ok_or_else(|| {
                        SqliteStoreError::InvalidRow(format!("unknown transaction kind {kind:?}"))
                    })?;
                    out.push(CreditTransactionRecord {
                        id,
                        user_id,
                        amount_usd_micros,
                        kind,
                        description,
                        created_at_ms,
                    });
                }
                Ok(out)
            },
        )
        .await?
    }

    pub async fn list_usage(&self, user_id: &str) -> Result<Vec<UsageRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<UsageRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT request_id, user_id, api_key_id, provider, model, input_tokens, output_tokens,
                        provider_cost_usd_micros, vuzo_cost_usd_micros, response_time_ms,
                        status_code, stream, created_at_ms
                 FROM usage_logs WHERE user_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id], |row| {
                Ok(UsageRecord {
                    request_id: row.get(0)?,
                    user_id: row.get(1)?,
                    api_key_id: row.get(2)?,
                    provider: row.get(3)?,
                    model: row.get(4)?,
                    input_tokens: i64_to_u64(row.get(5)?),
                    output_tokens: i64_to_u64(row.get(6)?),
                    provider_cost_usd_micros: row.get(7)?,
                    vuzo_cost_usd_micros: row.get(8)?,
                    response_time_ms: i64_to_u64(row.get(9)?),
                    status_code: u16::try_from(row.get::<_, i64>(10)?).unwrap_or(0),
                    stream: row.get(11)?,
                    created_at_ms: row.get(12)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }
}

#[async_trait]
impl GatewayStore for SqliteStore {
    async fn api_keys_by_prefix(
        &self,
        key_prefix: &str,
    ) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let path = self.path.clone();
        let key_prefix = key_prefix.to_string();
        let keys = tokio::task::spawn_blocking(
            move || -> Result<Vec<ApiKeyRecord>, SqliteStoreError> {
                let conn = open_connection(path)?;
                init_schema(&conn)?;
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, key_prefix, key_hash, is_active, rate_limit_rpm, last_used_at_ms
                     FROM api_keys WHERE key_prefix = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(rusqlite::params![key_prefix], |row| {
                    Ok(ApiKeyRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        key_prefix: row.get(2)?,
                        key_hash: row.get(3)?,
                        active: row.get(4)?,
                        rate_limit_rpm: row.get(5)?,
                        last_used_at_ms: row.get(6)?,
                    })
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            },
        )
        .await
        .map_err(SqliteStoreError::from)??;
        Ok(keys)
    }

    async fn touch_api_key(&self, api_key_id: &str, now_ms: i64) -> Result<(), StoreError> {
        let path = self.path.clone();
        let api_key_id = api_key_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "UPDATE api_keys SET last_used_at_ms = ?2 WHERE id = ?1",
                rusqlite::params![api_key_id, now_ms],
            )?;
            Ok(())
        })
        .await
        .map_err(SqliteStoreError::from)??;
        Ok(())
    }

    async fn user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let user = tokio::task::spawn_blocking(
            move || -> Result<Option<UserRecord>, SqliteStoreError> {
                let conn = open_connection(path)?;
                init_schema(&conn)?;
                let user = conn
                    .query_row(
                        "SELECT id, is_active FROM users WHERE id = ?1",
                        rusqlite::params![user_id],
                        |row| {
                            Ok(UserRecord {
                                id: row.get(0)?,
                                active: row.get(1)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(user)
            },
        )
        .await
        .map_err(SqliteStoreError::from)??;
        Ok(user)
    }

    async fn active_pricing(&self, model: &str) -> Result<Option<PricingRecord>, StoreError> {
        let path = self.path.clone();
        let model = model.to_string();
        let pricing = tokio::task::spawn_blocking(
            move || -> Result<Option<PricingRecord>, SqliteStoreError> {
                let conn = open_connection(path)?;
                init_schema(&conn)?;
                let pricing = conn
                    .query_row(
                        "SELECT provider, model, input_usd_micros_per_million,
                                output_usd_micros_per_million, markup_bps, is_active
                         FROM model_pricing WHERE model = ?1 AND is_active = 1",
                        rusqlite::params![model],
                        |row| {
                            Ok(PricingRecord {
                                provider: row.get(0)?,
                                model: row.get(1)?,
                                input_usd_micros_per_million: i64_to_u64(row.get(2)?),
                                output_usd_micros_per_million: i64_to_u64(row.get(3)?),
                                markup_bps: i64_to_u64(row.get(4)?),
                                active: row.get(5)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(pricing)
            },
        )
        .await
        .map_err(SqliteStoreError::from)??;
        Ok(pricing)
    }

    async fn provider_credential(&self, provider: &str) -> Result<Option<String>, StoreError> {
        let path = self.path.clone();
        let provider = provider.to_string();
        let sealed = tokio::task::spawn_blocking(
            move || -> Result<Option<String>, SqliteStoreError> {
                let conn = open_connection(path)?;
                init_schema(&conn)?;
                let sealed = conn
                    .query_row(
                        "SELECT api_key_encrypted FROM provider_keys
                         WHERE provider = ?1 AND is_active = 1",
                        rusqlite::params![provider],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(sealed)
            },
        )
        .await
        .map_err(SqliteStoreError::from)??;
        Ok(sealed)
    }

    async fn balance_record(&self, user_id: &str) -> Result<BalanceRecord, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let ts_ms = now_millis();
        let record = tokio::task::spawn_blocking(move || -> Result<BalanceRecord, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT OR IGNORE INTO credits (user_id, balance_usd_micros, updated_at_ms)
                 VALUES (?1, 0, ?2)",
                rusqlite::params![user_id, ts_ms],
            )?;
            let (balance_usd_micros, updated_at_ms) = conn.query_row(
                "SELECT balance_usd_micros, updated_at_ms FROM credits WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )?;
            Ok(BalanceRecord {
                user_id,
                balance_usd_micros,
                updated_at_ms,
            })
        })
        .await
        .map_err(SqliteStoreError::from)??;
        Ok(record)
    }

    async fn apply_transaction(
        &self,
        user_id: &str,
        amount_usd_micros: i64,
        kind: TransactionKind,
        description: &str,
    ) -> Result<(i64, i64), StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let description = description.to_string();
        let ts_ms = now_millis();
        let applied = tokio::task::spawn_blocking(move || -> Result<(i64, i64), SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            tx.execute(
                "INSERT OR IGNORE INTO credits (user_id, balance_usd_micros, updated_at_ms)
                 VALUES (?1, 0, ?2)",
                rusqlite::params![user_id, ts_ms],
            )?;
            tx.execute(
                "UPDATE credits
                 SET balance_usd_micros = balance_usd_micros + ?2,
                     updated_at_ms = ?3
                 WHERE user_id = ?1",
                rusqlite::params![user_id, amount_usd_micros, ts_ms],
            )?;
            let balance = tx.query_row(
                "SELECT balance_usd_micros FROM credits WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| row.get::<_, i64>(0),
            )?;
            tx.execute(
                "INSERT INTO credit_transactions
                    (user_id, amount_usd_micros, kind, description, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![user_id, amount_usd_micros, kind.as_str(), description, ts_ms],
            )?;
            let transaction_id = tx.last_insert_rowid();

            tx.commit()?;
            Ok((balance, transaction_id))
        })
        .await
        .map_err(SqliteStoreError::from)??;
        Ok(applied)
    }

    async fn insert_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let path = self.path.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO usage_logs
                    (request_id, user_id, api_key_id, provider, model, input_tokens, output_tokens,
                     total_tokens, provider_cost_usd_micros, vuzo_cost_usd_micros, response_time_ms,
                     status_code, stream, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                rusqlite::params![
                    record.request_id,
                    record.user_id,
                    record.api_key_id,
                    record.provider,
                    record.model,
                    u64_to_i64(record.input_tokens),
                    u64_to_i64(record.output_tokens),
                    u64_to_i64(record.total_tokens()),
                    record.provider_cost_usd_micros,
                    record.vuzo_cost_usd_micros,
                    u64_to_i64(record.response_time_ms),
                    i64::from(record.status_code),
                    record.stream,
                    record.created_at_ms
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(SqliteStoreError::from)??;
        Ok(())
    }

    async fn usage_summary(
        &self,
        user_id: &str,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<UsageSummary, StoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let summary = tokio::task::spawn_blocking(move || -> Result<UsageSummary, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let summary = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(input_tokens), 0),
                        COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(total_tokens), 0),
                        COALESCE(SUM(provider_cost_usd_micros), 0),
                        COALESCE(SUM(vuzo_cost_usd_micros), 0)
                 FROM usage_logs
                 WHERE user_id = ?1 AND created_at_ms >= ?2 AND created_at_ms < ?3",
                rusqlite::params![user_id, since_ms, until_ms],
                |row| {
                    Ok(UsageSummary {
                        requests: i64_to_u64(row.get(0)?),
                        input_tokens: i64_to_u64(row.get(1)?),
                        output_tokens: i64_to_u64(row.get(2)?),
                        total_tokens: i64_to_u64(row.get(3)?),
                        provider_cost_usd_micros: row.get(4)?,
                        vuzo_cost_usd_micros: row.get(5)?,
                    })
                },
            )?;
            Ok(summary)
        })
        .await
        .map_err(SqliteStoreError::from)??;
        Ok(summary)
    }
}

#[async_trait]
impl RateWindowStore for SqliteStore {
    async fn try_admit(
        &self,
        key_prefix: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
        prune_before_ms: i64,
    ) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let key_prefix = key_prefix.to_string();
        let admitted = tokio::task::spawn_blocking(move || -> Result<bool, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            tx.execute(
                "DELETE FROM rate_limit_requests WHERE ts_ms < ?1",
                rusqlite::params![prune_before_ms],
            )?;
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM rate_limit_requests WHERE key_prefix = ?1 AND ts_ms > ?2",
                rusqlite::params![key_prefix, now_ms.saturating_sub(window_ms)],
                |row| row.get(0),
            )?;
            if count >= i64::from(limit) {
                tx.commit()?;
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO rate_limit_requests (key_prefix, ts_ms) VALUES (?1, ?2)",
                rusqlite::params![key_prefix, now_ms],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
        .map_err(SqliteStoreError::from)??;
        Ok(admitted)
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS api_keys (
            id TEXT PRIMARY KEY NOT NULL,
            user_id TEXT NOT NULL,
            key_prefix TEXT NOT NULL,
            key_hash TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            rate_limit_rpm INTEGER,
            last_used_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_api_keys_key_prefix
            ON api_keys(key_prefix);

        CREATE TABLE IF NOT EXISTS model_pricing (
            model TEXT PRIMARY KEY NOT NULL,
            provider TEXT NOT NULL,
            input_usd_micros_per_million INTEGER NOT NULL,
            output_usd_micros_per_million INTEGER NOT NULL,
            markup_bps INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS provider_keys (
            provider TEXT PRIMARY KEY NOT NULL,
            api_key_encrypted TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS credits (
            user_id TEXT PRIMARY KEY NOT NULL,
            balance_usd_micros INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS credit_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            amount_usd_micros INTEGER NOT NULL,
            kind TEXT NOT NULL,
            description TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_credit_transactions_user_id
            ON credit_transactions(user_id);

        CREATE TABLE IF NOT EXISTS usage_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            api_key_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            total_tokens INTEGER NOT NULL,
            provider_cost_usd_micros INTEGER NOT NULL,
            vuzo_cost_usd_micros INTEGER NOT NULL,
            response_time_ms INTEGER NOT NULL,
            status_code INTEGER NOT NULL,
            stream INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_logs_user_id_created_at_ms
            ON usage_logs(user_id, created_at_ms);

        CREATE TABLE IF NOT EXISTS rate_limit_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key_prefix TEXT NOT NULL,
            ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_rate_limit_requests_key_prefix_ts_ms
            ON rate_limit_requests(key_prefix, ts_ms);
        CREATE INDEX IF NOT EXISTS idx_rate_limit_requests_ts_ms
            ON rate_limit_requests(ts_ms);",
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("vuzo.sqlite"));
        store.init().await.expect("init");
        (dir, store)
    }

    #[tokio::test]
    async fn balance_row_is_created_lazily_at_zero() {
        let (_dir, store) = store().await;
        assert_eq!(store.balance("user-1").await.expect("balance"), 0);
        assert!(store.list_transactions("user-1").await.expect("txs").is_empty());
    }

    #[tokio::test]
    async fn balance_record_tracks_last_update() {
        let (_dir, store) = store().await;
        let fresh = store.balance_record("user-1").await.expect("record");
        assert_eq!(fresh.user_id, "user-1");
        assert_eq!(fresh.balance_usd_micros, 0);
        assert!(fresh.updated_at_ms > 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        store
            .apply_transaction("user-1", 2_500, TransactionKind::Topup, "topup")
            .await
            .expect("topup");
        let updated = store.balance_record("user-1").await.expect("record");
        assert_eq!(updated.balance_usd_micros, 2_500);
        assert!(updated.updated_at_ms > fresh.updated_at_ms);
    }

    #[tokio::test]
    async fn transactions_keep_balance_equal_to_their_sum() {
        let (_dir, store) = store().await;
        let (balance, topup_id) = store
            .apply_transaction("user-1", 5_000_000, TransactionKind::Topup, "topup")
            .await
            .expect("topup");
        assert_eq!(balance, 5_000_000);

        let (balance, usage_id) = store
            .apply_transaction("user-1", -54, TransactionKind::Usage, "gpt-4o: 1in + 1out tokens")
            .await
            .expect("debit");
        assert_eq!(balance, 4_999_946);
        assert!(usage_id > topup_id);

        let txs = store.list_transactions("user-1").await.expect("txs");
        let sum: i64 = txs.iter().map(|tx| tx.amount_usd_micros).sum();
        assert_eq!(sum, store.balance("user-1").await.expect("balance"));
        assert_eq!(txs[1].kind, TransactionKind::Usage);
    }

    #[tokio::test]
    async fn concurrent_debits_are_all_applied() {
        let (_dir, store) = store().await;
        store
            .apply_transaction("user-1", 1_000_000, TransactionKind::Topup, "seed")
            .await
            .expect("seed");

        let mut handles = Vec::new();
        for n in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .apply_transaction("user-1", -100, TransactionKind::Usage, &format!("req {n}"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("debit");
        }

        assert_eq!(store.balance("user-1").await.expect("balance"), 1_000_000 - 1_600);
        let usage_rows = store
            .list_transactions("user-1")
            .await
            .expect("txs")
            .into_iter()
            .filter(|tx| tx.kind == TransactionKind::Usage)
            .count();
        assert_eq!(usage_rows, 16);
    }

    #[tokio::test]
    async fn inactive_pricing_is_not_returned() {
        let (_dir, store) = store().await;
        let mut pricing = PricingRecord {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            input_usd_micros_per_million: 2_500_000,
            output_usd_micros_per_million: 10_000_000,
            markup_bps: 2_000,
            active: true,
        };
        store.upsert_pricing(&pricing).await.expect("upsert");
        assert_eq!(
            store.active_pricing("gpt-4o").await.expect("pricing"),
            Some(pricing.clone())
        );

        pricing.active = false;
        store.upsert_pricing(&pricing).await.expect("deactivate");
        assert_eq!(store.active_pricing("gpt-4o").await.expect("pricing"), None);
    }

    #[tokio::test]
    async fn rate_window_admits_up_to_limit_and_prunes() {
        let (_dir, store) = store().await;
        for n in 0..3 {
            assert!(
                store
                    .try_admit("vz-abcde", 1_000 + n, 60_000, 3, 0)
                    .await
                    .expect("admit")
            );
        }
        assert!(
            !store
                .try_admit("vz-abcde", 1_010, 60_000, 3, 0)
                .await
                .expect("reject")
        );
        assert!(
            store
                .try_admit("vz-other", 1_010, 60_000, 3, 0)
                .await
                .expect("other prefix")
        );
        assert!(
            store
                .try_admit("vz-abcde", 61_001, 60_000, 3, 1_001)
                .await
                .expect("window slid")
        );
    }

    #[tokio::test]
    async fn usage_summary_sums_rows_in_range() {
        let (_dir, store) = store().await;
        for (n, created_at_ms) in [(1u64, 100i64), (2, 200), (3, 300)] {
            store
                .insert_usage(&UsageRecord {
                    request_id: format!("req-{n}"),
                    user_id: "user-1".to_string(),
                    api_key_id: "key-1".to_string(),
                    provider: "openai".to_string(),
                    model: "gpt-4o".to_string(),
                    input_tokens: n,
                    output_tokens: n * 10,
                    provider_cost_usd_micros: 5,
                    vuzo_cost_usd_micros: 6,
                    response_time_ms: 12,
                    status_code: 200,
                    stream: false,
                    created_at_ms,
                })
                .await
                .expect("insert");
        }

        let summary = store
            .usage_summary("user-1", 150, 301)
            .await
            .expect("summary");
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.input_tokens, 5);
        assert_eq!(summary.total_tokens, 55);
        assert_eq!(summary.vuzo_cost_usd_micros, 12);
        assert_eq!(store.list_usage("user-1").await.expect("rows").len(), 3);
    }
}
