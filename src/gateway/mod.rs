//! Billing-aware chat-completions gateway: authentication, rate limiting,
//! prepaid credit, vendor dispatch and usage accounting.

pub mod auth;
pub mod config;
pub mod costing;
pub mod credentials;
pub mod http;
pub mod ledger;
pub mod limits;
#[cfg(feature = "store-redis")]
pub mod redis_store;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
pub mod store;
pub mod store_types;
pub mod telemetry;
pub mod usage;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument as _;

use crate::VuzoError;
use crate::providers::{
    AdapterRegistry, Credential, FrameStream, ProviderAdapter, ProviderKind,
};
use crate::types::{ChatCompletionRequest, UsageResult};

pub use auth::{AuthContext, Authenticator};
pub use config::GatewayConfig;
pub use costing::{CostBreakdown, PricingError};
pub use credentials::{CredentialCache, CredentialVault};
pub use http::{GatewayHttpState, router};
pub use ledger::CreditLedger;
pub use limits::{LimitsConfig, MemoryWindowStore, RateLimiter};
#[cfg(feature = "store-redis")]
pub use redis_store::RedisStore;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;
pub use store::{GatewayStore, RateWindowStore, StoreError};
pub use store_types::{
    ApiKeyRecord, CreditTransactionRecord, PricingRecord, TransactionKind, UsageRecord,
    UsageSummary, UserRecord,
};
pub use usage::UsageRecorder;

const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{message}")]
    Unauthorized { message: String },
    #[error("model not supported: {model}")]
    ModelNotSupported { model: String },
    #[error("insufficient balance")]
    InsufficientBalance { balance_usd_micros: i64 },
    #[error("provider not configured: {provider}")]
    ProviderUnavailable { provider: String },
    #[error("upstream error: {body}")]
    Upstream { status: Option<u16>, body: String },
    #[error("rate limit exceeded: {limit} requests per window")]
    RateLimited { limit: u32 },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized { .. } => 401,
            Self::InsufficientBalance { .. } => 402,
            Self::ModelNotSupported { .. } | Self::InvalidRequest { .. } => 400,
            Self::RateLimited { .. } => 429,
            Self::Upstream { .. } => 502,
            Self::ProviderUnavailable { .. } => 503,
            Self::Internal { .. } => 500,
        }
    }

    /// The `error.type` reported in the response envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "authentication_error",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::ModelNotSupported { .. } => "model_not_supported",
            Self::InvalidRequest { .. } => "invalid_request_error",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::Upstream { .. } => "upstream_error",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl From<VuzoError> for GatewayError {
    fn from(err: VuzoError) -> Self {
        match err {
            VuzoError::Api { status, body } => Self::Upstream {
                status: Some(status.as_u16()),
                body,
            },
            other => Self::Upstream {
                status: None,
                body: other.to_string(),
            },
        }
    }
}

impl From<PricingError> for GatewayError {
    fn from(err: PricingError) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// Result of a routed request.
#[derive(Debug)]
pub enum RouteOutcome {
    Completion {
        provider: ProviderKind,
        response: Value,
    },
    Stream {
        provider: ProviderKind,
        stream: CompletionStream,
    },
}

/// SSE bytes for one streamed completion. Dropping it (the caller went away)
/// cancels the pump and releases the upstream connection.
#[derive(Debug)]
pub struct CompletionStream {
    rx: mpsc::Receiver<Bytes>,
    _cancel: DropGuard,
}

impl Stream for CompletionStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Everything needed to bill one request once its usage is known.
#[derive(Clone)]
struct BillingContext {
    ledger: CreditLedger,
    usage: UsageRecorder,
    pricing: PricingRecord,
    provider: ProviderKind,
    auth: AuthContext,
    request_id: String,
    model: String,
    stream: bool,
    started: Instant,
    clock: Arc<dyn Clock>,
}

impl BillingContext {
    /// Debits the ledger and appends the usage row. Write failures are
    /// logged; only an unpriceable usage is returned, and then nothing is
    /// recorded.
    async fn settle(&self, usage: &UsageResult) -> Result<CostBreakdown, GatewayError> {
        let cost = self.pricing.cost(usage)?;
        let description = ledger::usage_description(
            &self.model,
            usage.input_tokens,
            usage.output_tokens,
            self.stream,
        );

        match self
            .ledger
            .debit(&self.auth.user_id, cost.vuzo_cost_usd_micros, &description)
            .await
        {
            Ok(balance) => tracing::debug!(
                request_id = %self.request_id,
                balance_usd_micros = balance,
                "debited usage"
            ),
            Err(err) => tracing::error!(
                request_id = %self.request_id,
                user_id = %self.auth.user_id,
                amount_usd_micros = cost.vuzo_cost_usd_micros,
                error = %err,
                "failed to debit usage"
            ),
        }

        let response_time_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.usage
            .record(&UsageRecord {
                request_id: self.request_id.clone(),
                user_id: self.auth.user_id.clone(),
                api_key_id: self.auth.api_key_id.clone(),
                provider: self.provider.as_str().to_string(),
                model: self.model.clone(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                provider_cost_usd_micros: cost.provider_cost_usd_micros,
                vuzo_cost_usd_micros: cost.vuzo_cost_usd_micros,
                response_time_ms,
                status_code: 200,
                stream: self.stream,
                created_at_ms: self.clock.now_millis(),
            })
            .await;

        tracing::info!(
            request_id = %self.request_id,
            provider = %self.provider,
            model = %self.model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            vuzo_cost_usd_micros = cost.vuzo_cost_usd_micros,
            response_time_ms,
            stream = self.stream,
            "billed request"
        );
        Ok(cost)
    }

    /// `settle` for callers that have already answered the client.
    async fn settle_or_log(&self, usage: &UsageResult) {
        if let Err(err) = self.settle(usage).await {
            tracing::error!(
                request_id = %self.request_id,
                user_id = %self.auth.user_id,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                error = %err,
                "failed to price request; not billed"
            );
        }
    }
}

pub struct Gateway {
    registry: AdapterRegistry,
    store: Arc<dyn GatewayStore>,
    authenticator: Authenticator,
    limiter: RateLimiter,
    ledger: CreditLedger,
    usage: UsageRecorder,
    credentials: Arc<CredentialCache>,
    clock: Arc<dyn Clock>,
    minimum_balance_usd_micros: i64,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("limiter", &self.limiter)
            .field("minimum_balance_usd_micros", &self.minimum_balance_usd_micros)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// A gateway with an in-process rate window, a $0.001 balance floor and
    /// a 5 minute credential cache.
    pub fn new(
        store: Arc<dyn GatewayStore>,
        registry: AdapterRegistry,
        vault: CredentialVault,
    ) -> Self {
        Self {
            registry,
            authenticator: Authenticator::new(store.clone()),
            limiter: RateLimiter::in_memory(&LimitsConfig::default()),
            ledger: CreditLedger::new(store.clone()),
            usage: UsageRecorder::new(store.clone()),
            credentials: Arc::new(CredentialCache::new(vault, store.clone(), 300)),
            clock: Arc::new(SystemClock),
            minimum_balance_usd_micros: 1_000,
            store,
        }
    }

    /// Wires a gateway from loaded configuration.
    pub fn from_config(
        config: &GatewayConfig,
        store: Arc<dyn GatewayStore>,
        window_store: Arc<dyn RateWindowStore>,
        vault: CredentialVault,
        http: reqwest::Client,
    ) -> Self {
        let registry = AdapterRegistry::new(http, &config.upstream.endpoints);
        Self::new(store, registry, vault)
            .with_rate_limiter(RateLimiter::new(window_store, &config.rate_limit))
            .with_minimum_balance(config.billing.floor_usd_micros())
            .with_credential_ttl(config.credentials.cache_ttl_seconds)
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_minimum_balance(mut self, usd_micros: i64) -> Self {
        self.minimum_balance_usd_micros = usd_micros;
        self
    }

    pub fn with_credential_ttl(self, ttl_seconds: u64) -> Self {
        let vault = self.credentials.vault().clone();
        let credentials = Arc::new(CredentialCache::new(vault, self.store.clone(), ttl_seconds));
        Self {
            credentials,
            ..self
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn usage(&self) -> &UsageRecorder {
        &self.usage
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    pub async fn authenticate(&self, token: &str) -> Result<AuthContext, GatewayError> {
        self.authenticator
            .authenticate(token, self.clock.now_millis())
            .await
    }

    /// Runs the pre-flight checks in order, then calls the vendor. Nothing is
    /// charged and no vendor is contacted unless every check passes.
    pub async fn route(
        &self,
        request: ChatCompletionRequest,
        auth: &AuthContext,
        request_id: &str,
    ) -> Result<RouteOutcome, GatewayError> {
        let started = Instant::now();
        request
            .validate()
            .map_err(|reason| GatewayError::InvalidRequest {
                reason: reason.to_string(),
            })?;

        let pricing = self
            .store
            .active_pricing(&request.model)
            .await?
            .ok_or_else(|| GatewayError::ModelNotSupported {
                model: request.model.clone(),
            })?;
        let adapter = self.resolve_adapter(&request.model, &pricing)?;
        let provider = adapter.kind();
        tracing::Span::current().record("provider", provider.as_str());

        self.limiter
            .admit(&auth.key_prefix, auth.rate_limit_rpm, self.clock.now_millis())
            .await?;
        self.ledger
            .check_minimum(&auth.user_id, self.minimum_balance_usd_micros)
            .await?;
        let credential = self.credential(provider).await?;

        let billing = BillingContext {
            ledger: self.ledger.clone(),
            usage: self.usage.clone(),
            pricing,
            provider,
            auth: auth.clone(),
            request_id: request_id.to_string(),
            model: request.model.clone(),
            stream: request.stream,
            started,
            clock: self.clock.clone(),
        };

        if request.stream {
            let frames = adapter.stream(&request, &credential).await?;
            Ok(RouteOutcome::Stream {
                provider,
                stream: spawn_pump(frames, billing),
            })
        } else {
            let completion = adapter.complete(&request, &credential).await?;
            billing.settle_or_log(&completion.usage).await;
            let mut response = completion.response;
            if let Value::Object(obj) = &mut response {
                if !obj.get("usage").is_some_and(Value::is_object) {
                    obj.insert("usage".to_string(), completion.usage.to_chat_usage());
                }
            }
            Ok(RouteOutcome::Completion { provider, response })
        }
    }

    /// First adapter that serves `model`. The pricing row must agree on the
    /// provider; a mismatch is treated as an unsupported model.
    fn resolve_adapter(
        &self,
        model: &str,
        pricing: &PricingRecord,
    ) -> Result<&ProviderAdapter, GatewayError> {
        let not_supported = || GatewayError::ModelNotSupported {
            model: model.to_string(),
        };
        let adapter = self.registry.resolve(model).ok_or_else(not_supported)?;
        if adapter.kind().as_str() != pricing.provider {
            tracing::warn!(
                model,
                pricing_provider = %pricing.provider,
                adapter = %adapter.kind(),
                "pricing provider does not match adapter"
            );
            return Err(not_supported());
        }
        Ok(adapter)
    }

    async fn credential(&self, provider: ProviderKind) -> Result<Credential, GatewayError> {
        self.credentials
            .resolve(provider, self.clock.now_millis())
            .await?
            .ok_or_else(|| GatewayError::ProviderUnavailable {
                provider: provider.as_str().to_string(),
            })
    }
}

/// Forwards frames to the caller as they arrive and bills once the stream
/// has ended. Billing needs the usage from the terminal frame: a stream that
/// is cut off before it stays unbilled.
fn spawn_pump(frames: FrameStream, billing: BillingContext) -> CompletionStream {
    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let span = tracing::Span::current();
    tokio::spawn(
        async move {
            let mut frames = frames;
            let mut usage: Option<UsageResult> = None;
            let mut finished = false;

            loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => break,
                    frame = frames.next() => frame,
                };
                let Some(frame) = frame else {
                    finished = true;
                    break;
                };
                let done = frame.is_done();
                if frame.usage.is_some() {
                    usage = frame.usage;
                }
                let sent = tokio::select! {
                    _ = token.cancelled() => false,
                    sent = tx.send(frame.data) => sent.is_ok(),
                };
                if !sent {
                    break;
                }
                if done {
                    finished = true;
                    break;
                }
            }
            drop(frames);
            drop(tx);

            match usage {
                Some(usage) => billing.settle_or_log(&usage).await,
                None if finished => tracing::warn!(
                    request_id = %billing.request_id,
                    "stream ended without usage; request not billed"
                ),
                None => tracing::warn!(
                    request_id = %billing.request_id,
                    "client disconnected before usage was reported; request not billed"
                ),
            }
        }
        .instrument(span),
    );

    CompletionStream {
        rx,
        _cancel: cancel.drop_guard(),
    }
}
