//! Operator logging plus optional OTLP export of traces and metrics
//!
//! Logs always go to stdout through `tracing-subscriber`. Traces and the
//! reconcile metrics in [`crate::metrics`] are exported only when an OTLP
//! endpoint is configured; otherwise the global meter stays a no-op.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource as semconv;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Log filter used when `RUST_LOG` is unset
const DEFAULT_LOG_FILTER: &str = "info,stratum=debug,kube=info,tower=warn,hyper=warn";

/// `service.namespace` shared by every Stratum component
const SERVICE_NAMESPACE: &str = "stratum";

/// Startup failures; the operator exits on any of them
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to build OTLP {signal} exporter: {reason}")]
    Exporter {
        /// "trace" or "metrics"
        signal: &'static str,
        /// Exporter error text
        reason: String,
    },

    /// A global subscriber was already installed
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// What the operator binary knows about itself at startup
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name`, e.g. "stratum-operator"
    pub service_name: String,

    /// Namespace the controller runs in
    pub controller_namespace: Option<String>,

    /// OTLP gRPC endpoint; read from `OTEL_EXPORTER_OTLP_ENDPOINT` by default
    pub otlp_endpoint: Option<String>,

    /// JSON lines instead of compact text
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "stratum-operator".to_string(),
            controller_namespace: None,
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            json_logs: true,
        }
    }
}

/// Install the global subscriber, and the OTLP pipelines when an endpoint is set
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let tracer = install_otlp(endpoint, &config)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    // Option<Layer> is itself a Layer, so only one of these formats anything
    let (json, text) = if config.json_logs {
        let json = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_file(false)
            .with_line_number(false);
        (Some(json), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().compact()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// Resource attributes identifying this operator replica
fn operator_resource(config: &TelemetryConfig) -> Resource {
    let mut attributes = vec![
        KeyValue::new(semconv::SERVICE_NAME, config.service_name.clone()),
        KeyValue::new("service.namespace", SERVICE_NAMESPACE),
        KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    if let Some(namespace) = &config.controller_namespace {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace.clone()));
    }
    // Downward API
    if let Ok(pod) = std::env::var("POD_NAME") {
        attributes.push(KeyValue::new("service.instance.id", pod.clone()));
        attributes.push(KeyValue::new("k8s.pod.name", pod));
    }
    if let Ok(node) = std::env::var("NODE_NAME") {
        attributes.push(KeyValue::new("k8s.node.name", node));
    }
    Resource::new(attributes)
}

/// Register global tracer and meter providers exporting to `endpoint`
fn install_otlp(endpoint: &str, config: &TelemetryConfig) -> Result<Tracer, TelemetryError> {
    let resource = operator_resource(config);

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "trace",
            reason: e.to_string(),
        })?;
    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "metrics",
            reason: e.to_string(),
        })?;

    global::set_meter_provider(
        SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(metrics, runtime::Tokio).build())
            .with_resource(resource.clone())
            .build(),
    );

    let provider = TracerProvider::builder()
        .with_batch_exporter(spans, runtime::Tokio)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());

    Ok(provider.tracer(config.service_name.clone()))
}
