use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use vuzo_gateway::Env;
use vuzo_gateway::gateway::telemetry::init_tracing;
use vuzo_gateway::gateway::{
    CredentialVault, Gateway, GatewayConfig, GatewayHttpState, RateWindowStore, SqliteStore,
    router,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Parser)]
#[command(name = "vuzo-gateway")]
#[command(about = "OpenAI-compatible chat completions gateway with prepaid credit billing")]
#[command(version)]
struct Cli {
    /// Gateway config (TOML, or JSON when the file ends in .json)
    config: PathBuf,

    /// Listen address, overriding `listen` from the config
    #[arg(long)]
    listen: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// .env file consulted before the process environment
    #[arg(long)]
    dotenv: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let mut config = GatewayConfig::load(&cli.config).await?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    let _telemetry = init_tracing(
        "vuzo-gateway",
        cli.json_logs || config.logging.json,
        config.logging.otel_endpoint.as_deref(),
    )?;

    let dotenv = cli.dotenv.or_else(|| config.credentials.dotenv.clone());
    let env = Env::load(dotenv.as_deref()).await?;
    let secret = env
        .get(&config.credentials.encryption_key_env)
        .ok_or_else(|| format!("{} is not set", config.credentials.encryption_key_env))?;
    let vault = CredentialVault::from_secret(&secret)?;

    let store = SqliteStore::new(&config.database_path);
    store.init().await?;
    for seed in &config.pricing {
        store.upsert_pricing(&seed.to_record()).await?;
    }
    tracing::info!(
        database = %store.path().display(),
        pricing_rows = config.pricing.len(),
        "store ready"
    );

    let window_store = rate_window_store(&config, &store).await?;
    let http = config.upstream.http_client()?;
    let gateway = Gateway::from_config(&config, Arc::new(store), window_store, vault, http);
    let app = router(GatewayHttpState::new(gateway));

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, "vuzo gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[cfg(feature = "store-redis")]
async fn rate_window_store(
    config: &GatewayConfig,
    store: &SqliteStore,
) -> Result<Arc<dyn RateWindowStore>, BoxError> {
    let Some(url) = config.redis_url.as_deref() else {
        return Ok(Arc::new(store.clone()));
    };
    let mut redis = vuzo_gateway::gateway::RedisStore::new(url)?;
    if let Some(prefix) = config.redis_prefix.as_deref() {
        redis = redis.with_prefix(prefix);
    }
    redis.ping().await?;
    tracing::info!(prefix = %redis.prefix(), "rate limit window in redis");
    Ok(Arc::new(redis))
}

#[cfg(not(feature = "store-redis"))]
async fn rate_window_store(
    config: &GatewayConfig,
    store: &SqliteStore,
) -> Result<Arc<dyn RateWindowStore>, BoxError> {
    if config.redis_url.is_some() {
        return Err("redis_url requires `--features store-redis`".into());
    }
    Ok(Arc::new(store.clone()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
