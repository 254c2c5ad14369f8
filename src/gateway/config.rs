use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::costing;
use super::limits::LimitsConfig;
use super::store_types::PricingRecord;
use crate::providers::{ProviderEndpoints, ProviderKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: String,
    pub database_path: PathBuf,
    pub redis_url: Option<String>,
    pub redis_prefix: Option<String>,
    pub rate_limit: LimitsConfig,
    pub billing: BillingConfig,
    pub upstream: UpstreamConfig,
    pub credentials: CredentialsConfig,
    pub logging: LoggingConfig,
    pub pricing: Vec<PricingSeed>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            database_path: PathBuf::from("vuzo.sqlite"),
            redis_url: None,
            redis_prefix: None,
            rate_limit: LimitsConfig::default(),
            billing: BillingConfig::default(),
            upstream: UpstreamConfig::default(),
            credentials: CredentialsConfig::default(),
            logging: LoggingConfig::default(),
            pricing: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Pre-flight floor; requests are rejected while the balance is below it.
    #[serde(
        rename = "minimum_balance_usd",
        deserialize_with = "costing::deserialize_usd_micros"
    )]
    pub minimum_balance_usd_micros: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            minimum_balance_usd_micros: 1_000,
        }
    }
}

impl BillingConfig {
    pub fn floor_usd_micros(&self) -> i64 {
        i64::try_from(self.minimum_balance_usd_micros).unwrap_or(i64::MAX)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub connect_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    #[serde(flatten)]
    pub endpoints: ProviderEndpoints,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: 10,
            request_timeout_seconds: 120,
            endpoints: ProviderEndpoints::default(),
        }
    }
}

impl UpstreamConfig {
    pub fn http_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_seconds.max(1)))
            .timeout(Duration::from_secs(self.request_timeout_seconds.max(1)))
            .build()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Environment variable (or `.env` entry) holding the vault secret.
    pub encryption_key_env: String,
    pub cache_ttl_seconds: u64,
    pub dotenv: Option<PathBuf>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            encryption_key_env: "VUZO_ENCRYPTION_KEY".to_string(),
            cache_ttl_seconds: 300,
            dotenv: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    pub otel_endpoint: Option<String>,
}

/// A `[[pricing]]` row, with prices in USD per million tokens and markup in
/// percent.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct PricingSeed {
    pub provider: ProviderKind,
    pub model: String,
    #[serde(deserialize_with = "costing::deserialize_usd_micros")]
    pub input_per_million: u64,
    #[serde(deserialize_with = "costing::deserialize_usd_micros")]
    pub output_per_million: u64,
    #[serde(default, deserialize_with = "costing::deserialize_percent_bps")]
    pub markup_percent: u64,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl PricingSeed {
    pub fn to_record(&self) -> PricingRecord {
        PricingRecord {
            provider: self.provider.as_str().to_string(),
            model: self.model.clone(),
            input_usd_micros_per_million: self.input_per_million,
            output_usd_micros_per_million: self.output_per_million,
            markup_bps: self.markup_percent,
            active: self.active,
        }
    }
}

impl GatewayConfig {
    /// Reads TOML, or JSON when the file ends in `.json`.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&raw)?
        } else {
            Self::from_toml_str(&raw)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.window_seconds == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.window_seconds must be positive".to_string(),
            ));
        }
        for seed in &self.pricing {
            if !seed.provider.models().contains(&seed.model.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "pricing for {} names a model the {} adapter does not serve",
                    seed.model, seed.provider
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = GatewayConfig::from_toml_str("").expect("parse");
        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.rate_limit.requests_per_minute, 60);
        assert_eq!(config.billing.floor_usd_micros(), 1_000);
        assert_eq!(config.upstream.request_timeout_seconds, 120);
        assert_eq!(config.upstream.endpoints, ProviderEndpoints::default());
        assert_eq!(config.credentials.encryption_key_env, "VUZO_ENCRYPTION_KEY");
        config.validate().expect("valid");
    }

    #[test]
    fn parses_toml_sections_and_pricing_seeds() {
        let config = GatewayConfig::from_toml_str(
            r#"
            listen = "0.0.0.0:9000"
            database_path = "/var/lib/vuzo/vuzo.sqlite"

            [rate_limit]
            requests_per_minute = 120

            [billing]
            minimum_balance_usd = "0.01"

            [upstream]
            request_timeout_seconds = 30
            anthropic = "http://127.0.0.1:4000"

            [logging]
            json = true

            [[pricing]]
            provider = "openai"
            model = "gpt-4o-mini"
            input_per_million = 0.15
            output_per_million = "0.60"
            markup_percent = 20
            "#,
        )
        .expect("parse");

        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.rate_limit.requests_per_minute, 120);
        assert_eq!(config.rate_limit.window_seconds, 60);
        assert_eq!(config.billing.minimum_balance_usd_micros, 10_000);
        assert_eq!(config.upstream.endpoints.anthropic, "http://127.0.0.1:4000");
        assert_eq!(config.upstream.endpoints.openai, "https://api.openai.com/v1");
        assert!(config.logging.json);

        let record = config.pricing[0].to_record();
        assert_eq!(record.provider, "openai");
        assert_eq!(record.input_usd_micros_per_million, 150_000);
        assert_eq!(record.output_usd_micros_per_million, 600_000);
        assert_eq!(record.markup_bps, 2_000);
        assert!(record.active);
        config.validate().expect("valid");
    }

    #[test]
    fn json_config_is_accepted() {
        let config = GatewayConfig::from_json_str(
            r#"{"listen": "127.0.0.1:1", "pricing": [{"provider": "google", "model": "gemini-2.0-flash", "input_per_million": "0.10", "output_per_million": "0.40"}]}"#,
        )
        .expect("parse");
        assert_eq!(config.pricing[0].markup_percent, 0);
        config.validate().expect("valid");
    }

    #[test]
    fn pricing_for_a_model_outside_the_provider_is_rejected() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [[pricing]]
            provider = "anthropic"
            model = "gpt-4o"
            input_per_million = 1
            output_per_million = 1
            "#,
        )
        .expect("parse");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn over_precise_prices_are_rejected() {
        let err = GatewayConfig::from_toml_str(
            r#"
            [[pricing]]
            provider = "openai"
            model = "gpt-4o"
            input_per_million = "0.0000001"
            output_per_million = 1
            "#,
        )
        .expect_err("too precise");
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[tokio::test]
    async fn load_reads_files_by_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let toml_path = dir.path().join("gateway.toml");
        tokio::fs::write(&toml_path, "listen = \"127.0.0.1:7000\"\n")
            .await
            .expect("write");
        assert_eq!(
            GatewayConfig::load(&toml_path).await.expect("load").listen,
            "127.0.0.1:7000"
        );

        let json_path = dir.path().join("gateway.json");
        tokio::fs::write(&json_path, r#"{"listen": "127.0.0.1:7001"}"#)
            .await
            .expect("write");
        assert_eq!(
            GatewayConfig::load(&json_path).await.expect("load").listen,
            "127.0.0.1:7001"
        );

        assert!(matches!(
            GatewayConfig::load(&dir.path().join("missing.toml")).await,
            Err(ConfigError::Read { .. })
        ));
    }
}
