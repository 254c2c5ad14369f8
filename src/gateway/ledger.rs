use std::sync::Arc;

use super::GatewayError;
use super::store::GatewayStore;
use super::store_types::{BalanceRecord, TransactionKind};

/// Prepaid USD balance per user. Every change goes through
/// `GatewayStore::apply_transaction`, which updates the balance and appends
/// the transaction row atomically, so the balance always equals the sum of
/// the user's transactions.
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn GatewayStore>,
}

impl std::fmt::Debug for CreditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditLedger").finish_non_exhaustive()
    }
}

impl CreditLedger {
    pub fn new(store: Arc<dyn GatewayStore>) -> Self {
        Self { store }
    }

    pub async fn balance(&self, user_id: &str) -> Result<i64, GatewayError> {
        Ok(self.store.balance(user_id).await?)
    }

    /// The balance together with the time of its last change.
    pub async fn balance_record(&self, user_id: &str) -> Result<BalanceRecord, GatewayError> {
        Ok(self.store.balance_record(user_id).await?)
    }

    /// Records a `usage` transaction of `-amount` and returns the new balance.
    /// The balance may go negative; the floor is only enforced pre-flight.
    pub async fn debit(
        &self,
        user_id: &str,
        amount_usd_micros: i64,
        description: &str,
    ) -> Result<i64, GatewayError> {
        if amount_usd_micros < 0 {
            return Err(GatewayError::Internal {
                message: format!("negative debit {amount_usd_micros}"),
            });
        }
        let (balance, _) = self
            .store
            .apply_transaction(
                user_id,
                -amount_usd_micros,
                TransactionKind::Usage,
                description,
            )
            .await?;
        Ok(balance)
    }

    pub async fn credit(
        &self,
        user_id: &str,
        amount_usd_micros: i64,
        description: &str,
        kind: TransactionKind,
    ) -> Result<(i64, i64), GatewayError> {
        if kind == TransactionKind::Usage {
            return Err(GatewayError::InvalidRequest {
                reason: "credits must be topup or refund".to_string(),
            });
        }
        if amount_usd_micros <= 0 {
            return Err(GatewayError::InvalidRequest {
                reason: format!("credit amount must be positive, got {amount_usd_micros}"),
            });
        }
        Ok(self
            .store
            .apply_transaction(user_id, amount_usd_micros, kind, description)
            .await?)
    }

    pub async fn check_minimum(
        &self,
        user_id: &str,
        floor_usd_micros: i64,
    ) -> Result<i64, GatewayError> {
        let record = self.balance_record(user_id).await?;
        if record.balance_usd_micros < floor_usd_micros {
            tracing::debug!(
                user_id,
                balance_usd_micros = record.balance_usd_micros,
                updated_at_ms = record.updated_at_ms,
                floor_usd_micros,
                "balance below floor"
            );
            return Err(GatewayError::InsufficientBalance {
                balance_usd_micros: record.balance_usd_micros,
            });
        }
        Ok(record.balance_usd_micros)
    }
}

/// `"<model>: <in>in + <out>out tokens"`, suffixed with ` (stream)` for
/// streamed completions.
pub fn usage_description(model: &str, input_tokens: u64, output_tokens: u64, stream: bool) -> String {
    let suffix = if stream { " (stream)" } else { "" };
    format!("{model}: {input_tokens}in + {output_tokens}out tokens{suffix}")
}
