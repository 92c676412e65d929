//! Logging and optional OTLP export for the controller process
//!
//! Logs are JSON lines filtered by `RUST_LOG` (or [`DEFAULT_LOG_FILTER`]).
//! With an OTLP endpoint configured, reconcile spans and the meters in
//! [`crate::metrics`] are exported too, tagged with the controller's
//! namespace, claimed ingress class and pod.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,ingress_anubis=debug,kube=info,tower=warn,hyper=warn";

/// Service name reported to the collector
pub const SERVICE: &str = "ingress-anubis";

/// Resource attribute carrying the ingress class this process claims
pub const INGRESS_CLASS_ATTRIBUTE: &str = "ingress_anubis.ingress_class";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The OTLP span or metric exporter could not be built
    #[error("failed to build OTLP exporter for {endpoint}: {message}")]
    Exporter {
        /// Collector endpoint
        endpoint: String,
        /// Exporter error
        message: String,
    },

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Where the process runs and where to export to
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// OTLP collector endpoint (e.g. "http://otel-collector:4317"); logs only when unset
    pub otlp_endpoint: Option<String>,
    /// Namespace the generated resources live in
    pub namespace: String,
    /// Ingress class claimed by this process
    pub ingress_class: String,
    /// Pod running the controller, when known
    pub pod_name: Option<String>,
}

impl TelemetryConfig {
    fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new(SERVICE_NAME, SERVICE),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            KeyValue::new("k8s.namespace.name", self.namespace.clone()),
            KeyValue::new(INGRESS_CLASS_ATTRIBUTE, self.ingress_class.clone()),
        ];
        if let Some(pod) = &self.pod_name {
            attributes.push(KeyValue::new("k8s.pod.name", pod.clone()));
        }
        Resource::new(attributes)
    }
}

/// Install the global subscriber, plus OTLP traces and metrics when an endpoint is set
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let provider = install_otlp(endpoint, config.resource())?;
            Some(tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE)))
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false),
        )
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

/// Flush pending spans before the process exits
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

fn exporter_error<E: std::fmt::Display>(endpoint: &str) -> impl FnOnce(E) -> TelemetryError + '_ {
    move |e| TelemetryError::Exporter {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    }
}

/// Set the global tracer and meter providers, both exporting to `endpoint`
fn install_otlp(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error(endpoint))?;
    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error(endpoint))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(span_exporter, runtime::Tokio)
        .with_resource(resource.clone())
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let meter_provider = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(metric_exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build();
    global::set_meter_provider(meter_provider);

    Ok(tracer_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::{Key, Value};

    fn config(pod_name: Option<&str>) -> TelemetryConfig {
        TelemetryConfig {
            otlp_endpoint: None,
            namespace: "edge".to_string(),
            ingress_class: "anubis".to_string(),
            pod_name: pod_name.map(str::to_string),
        }
    }

    /// Story: exported telemetry says which controller instance produced it
    #[test]
    fn story_resource_identifies_the_controller() {
        let resource = config(Some("ingress-anubis-0")).resource();
        assert_eq!(
            resource.get(Key::new(SERVICE_NAME)),
            Some(Value::from(SERVICE))
        );
        assert_eq!(
            resource.get(Key::new("k8s.namespace.name")),
            Some(Value::from("edge"))
        );
        assert_eq!(
            resource.get(Key::new(INGRESS_CLASS_ATTRIBUTE)),
            Some(Value::from("anubis"))
        );
        assert_eq!(
            resource.get(Key::new("k8s.pod.name")),
            Some(Value::from("ingress-anubis-0"))
        );
    }

    #[test]
    fn pod_attribute_is_omitted_when_unknown() {
        let resource = config(None).resource();
        assert!(resource.get(Key::new("k8s.pod.name")).is_none());
    }

    #[test]
    fn default_filter_parses_and_enables_crate_debug() {
        assert!(DEFAULT_LOG_FILTER.contains("ingress_anubis=debug"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }
}
