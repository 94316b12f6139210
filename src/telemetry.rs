//! Logging and optional tracing export.
//!
//! # Basic Logging
//!
//! ```rust,no_run
//! use membrane::telemetry::{LogFormat, init_logging};
//!
//! init_logging(LogFormat::from_env()).expect("Failed to init logging");
//! ```
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: `json`, `compact` or `pretty` (default: `pretty`)
//! - `RUST_LOG`: log filter (default: `info`)
//!
//! # OpenTelemetry (Optional)
//!
//! With the `otel` feature, [`init_telemetry`] installs an OTLP span exporter
//! next to the fmt layer, so spans around membership changes reach a
//! collector. Call [`shutdown_telemetry`] before exit to flush them.
//!
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: `http://localhost:4317`)
//! - `OTEL_SERVICE_NAME`: service name (default: `membrane`)

use tracing_subscriber::prelude::*;

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};
#[cfg(feature = "otel")]
use tracing_opentelemetry::OpenTelemetryLayer;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// Single-line output without span context.
    Compact,
    /// One JSON object per line, for log aggregators.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        })
    }
}

impl LogFormat {
    /// Read from the `LOG_FORMAT` environment variable.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default()
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = tracing_subscriber::registry().with(env_filter());
    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()?,
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
    }
    Ok(())
}

/// Configuration for OpenTelemetry export.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub otlp_endpoint: String,
    /// Keep a fmt layer next to the exporter.
    pub enable_console: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "membrane".to_string()),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4317".to_string()),
            enable_console: true,
        }
    }
}

/// Initialize OpenTelemetry tracing. Call once, before any tracing calls.
#[cfg(feature = "otel")]
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry::KeyValue;

    let resource = Resource::new(vec![KeyValue::new(
        "service.name",
        config.service_name.clone(),
    )]);

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()?;

    let provider = sdktrace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();
    let tracer = provider.tracer("membrane");
    opentelemetry::global::set_tracer_provider(provider);

    let fmt_layer = config
        .enable_console
        .then(|| tracing_subscriber::fmt::layer());
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .with(OpenTelemetryLayer::new(tracer))
        .try_init()?;

    tracing::info!(
        service_name = %config.service_name,
        otlp_endpoint = %config.otlp_endpoint,
        "OpenTelemetry tracing initialized"
    );
    Ok(())
}

/// Without the `otel` feature this only installs logging.
#[cfg(not(feature = "otel"))]
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.enable_console {
        init_logging(LogFormat::from_env()).map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Flush pending spans.
#[cfg(feature = "otel")]
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
    tracing::info!("OpenTelemetry tracing shut down");
}

#[cfg(not(feature = "otel"))]
pub fn shutdown_telemetry() {}

pub fn is_otel_enabled() -> bool {
    cfg!(feature = "otel")
}
