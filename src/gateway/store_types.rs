use serde::{Deserialize, Serialize};

use super::costing::{self, CostBreakdown, PricingError};
use crate::types::UsageResult;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub user_id: String,
    pub key_prefix: String,
    /// Lowercase hex SHA-256 of the full key.
    pub key_hash: String,
    pub active: bool,
    pub rate_limit_rpm: Option<u32>,
    pub last_used_at_ms: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingRecord {
    pub provider: String,
    pub model: String,
    pub input_usd_micros_per_million: u64,
    pub output_usd_micros_per_million: u64,
    pub markup_bps: u64,
    pub active: bool,
}

impl PricingRecord {
    pub fn cost(&self, usage: &UsageResult) -> Result<CostBreakdown, PricingError> {
        costing::compute_cost(
            usage.input_tokens,
            usage.output_tokens,
            self.input_usd_micros_per_million,
            self.output_usd_micros_per_million,
            self.markup_bps,
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Topup,
    Usage,
    Refund,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Topup => "topup",
            Self::Usage => "usage",
            Self::Refund => "refund",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "topup" => Some(Self::Topup),
            "usage" => Some(Self::Usage),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub user_id: String,
    pub balance_usd_micros: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransactionRecord {
    pub id: i64,
    pub user_id: String,
    pub amount_usd_micros: i64,
    pub kind: TransactionKind,
    pub description: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub provider_cost_usd_micros: i64,
    pub vuzo_cost_usd_micros: i64,
    pub response_time_ms: u64,
    pub status_code: u16,
    pub stream: bool,
    pub created_at_ms: i64,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub provider_cost_usd_micros: i64,
    pub vuzo_cost_usd_micros: i64,
}
