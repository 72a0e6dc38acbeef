//! Telemetry initialization for logging, tracing and metrics
//!
//! Installs a `tracing` subscriber with an env-driven filter and either JSON
//! or human-readable output. When an OTLP endpoint is configured, spans and
//! the metrics in [`crate::metrics`] are exported over gRPC as well.

use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Metrics export period when none is configured
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Default log filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,vso=debug,kube=info,tower=warn,hyper=warn,reqwest=warn";

/// Telemetry setup failure
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to build OTLP {signal} exporter: {reason}")]
    Exporter {
        /// `traces` or `metrics`
        signal: &'static str,
        /// Underlying exporter error
        reason: String,
    },

    /// A global subscriber was already installed
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable text
    Text,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "console" => Ok(LogFormat::Text),
            other => Err(format!("unknown log format {other:?} (expected json or text)")),
        }
    }
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to traces and metrics
    pub service_name: String,

    /// OTLP endpoint for trace and metric export (e.g. "http://otel-collector:4317").
    /// If None, telemetry is only logged locally.
    pub otlp_endpoint: Option<String>,

    /// Log output format
    pub log_format: LogFormat,

    /// How often metrics are pushed to the collector
    pub metrics_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "vault-secrets-operator".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            log_format: LogFormat::default(),
            metrics_interval: DEFAULT_METRICS_INTERVAL,
        }
    }
}

/// Install the global subscriber, plus OTLP export when an endpoint is set
///
/// Must be called from within a tokio runtime when an OTLP endpoint is set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer = install_otlp(endpoint, &config)?.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let output = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// Flush and stop the global tracer provider
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

/// Attributes identifying this operator replica
fn operator_resource(service_name: &str) -> Resource {
    use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};

    // POD_* and NODE_NAME come from the Deployment downward API
    let pod_attributes = [
        ("POD_NAME", "k8s.pod.name"),
        ("POD_NAMESPACE", "k8s.namespace.name"),
        ("NODE_NAME", "k8s.node.name"),
    ]
    .into_iter()
    .filter_map(|(env, key)| std::env::var(env).ok().map(|v| KeyValue::new(key, v)));

    Resource::new(
        [
            KeyValue::new(SERVICE_NAME, service_name.to_string()),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ]
        .into_iter()
        .chain(pod_attributes),
    )
}

fn exporter_error<E: std::fmt::Display>(signal: &'static str) -> impl Fn(E) -> TelemetryError {
    move |e| TelemetryError::Exporter {
        signal,
        reason: e.to_string(),
    }
}

/// Install global meter and tracer providers exporting to `endpoint`
fn install_otlp(
    endpoint: &str,
    config: &TelemetryConfig,
) -> Result<TracerProvider, TelemetryError> {
    use opentelemetry_otlp::{MetricExporter, SpanExporter, WithExportConfig};
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

    let resource = operator_resource(&config.service_name);
    let metrics = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("metrics"))?;
    let reader = PeriodicReader::builder(metrics, runtime::Tokio)
        .with_interval(config.metrics_interval)
        .build();
    global::set_meter_provider(
        SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(resource.clone())
            .build(),
    );

    let spans = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("traces"))?;
    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(spans, runtime::Tokio)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(tracer_provider.clone());
    Ok(tracer_provider)
}
