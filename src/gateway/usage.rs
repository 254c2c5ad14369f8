use std::sync::Arc;

use super::GatewayError;
use super::store::GatewayStore;
use super::store_types::{UsageRecord, UsageSummary};

/// Appends one row per billed request. Recording is best-effort: a failed
/// write is logged and swallowed so it never affects the caller's response.
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn GatewayStore>,
}

impl std::fmt::Debug for UsageRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageRecorder").finish_non_exhaustive()
    }
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn GatewayStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, record: &UsageRecord) {
        if let Err(err) = self.store.insert_usage(record).await {
            tracing::error!(
                request_id = %record.request_id,
                user_id = %record.user_id,
                model = %record.model,
                error = %err,
                "failed to record usage"
            );
        }
    }

    /// Totals for `user_id` over `[since_ms, until_ms)`.
    pub async fn summary(
        &self,
        user_id: &str,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<UsageSummary, GatewayError> {
        Ok(self.store.usage_summary(user_id, since_ms, until_ms).await?)
    }
}

#[cfg(all(test, feature = "store-sqlite"))]
mod tests {
    use super::*;
    use crate::gateway::sqlite_store::SqliteStore;

    fn record(request_id: &str, created_at_ms: i64) -> UsageRecord {
        UsageRecord {
            request_id: request_id.to_string(),
            user_id: "user-1".to_string(),
            api_key_id: "key-1".to_string(),
            provider: "anthropic".to_string(),
            model: "claude-haiku-4-5".to_string(),
            input_tokens: 12,
            output_tokens: 30,
            provider_cost_usd_micros: 100,
            vuzo_cost_usd_micros: 120,
            response_time_ms: 250,
            status_code: 200,
            stream: true,
            created_at_ms,
        }
    }

    #[tokio::test]
    async fn records_rows_and_summarizes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("usage.sqlite"));
        let recorder = UsageRecorder::new(Arc::new(store.clone()));

        recorder.record(&record("req-1", 1_000)).await;
        recorder.record(&record("req-2", 2_000)).await;

        let rows = store.list_usage("user-1").await.expect("rows");
        assert_eq!(rows.len(), 2);
        assert!(rows[0].stream);
        assert_eq!(rows[0].total_tokens(), 42);

        let summary = recorder.summary("user-1", 0, 3_000).await.expect("summary");
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.total_tokens, 84);
        assert_eq!(summary.vuzo_cost_usd_micros, 240);
    }

    #[tokio::test]
    async fn write_failures_are_swallowed() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A directory cannot be opened as a database file.
        let recorder = UsageRecorder::new(Arc::new(SqliteStore::new(dir.path())));
        recorder.record(&record("req-1", 1_000)).await;
    }
}
