#[cfg(feature = "otel")]
use opentelemetry::global;
#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider as _;
#[cfg(feature = "otel")]
use opentelemetry_otlp::SpanExporter;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig as _;
#[cfg(feature = "otel")]
use opentelemetry_sdk::Resource;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Keeps the span exporter alive; flushes on drop.
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(provider) = self.provider.take() {
            let _ = provider.shutdown();
        }
    }
}

/// Installs the global subscriber: `RUST_LOG`-style filtering (default
/// `info`), text or JSON lines, and OTLP span export when `otel_endpoint` is
/// set and the `otel` feature is enabled.
pub fn init_tracing(
    service_name: &str,
    json_logs: bool,
    otel_endpoint: Option<&str>,
) -> Result<TelemetryGuard, Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otel_endpoint {
            let exporter = SpanExporter::builder()
                .with_http()
                .with_endpoint(endpoint.to_string())
                .build()?;
            let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_resource(
                    Resource::builder_empty()
                        .with_service_name(service_name.to_string())
                        .build(),
                )
                .build();
            global::set_tracer_provider(provider.clone());

            let tracer = provider.tracer(service_name.to_string());
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .with(otel_layer)
                .try_init()?;
            return Ok(TelemetryGuard {
                provider: Some(provider),
            });
        }
    }

    if cfg!(not(feature = "otel")) && otel_endpoint.is_some() {
        return Err(format!("{service_name}: otel export requires `--features otel`").into());
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(TelemetryGuard::default())
}
