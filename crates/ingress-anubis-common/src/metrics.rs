//! Reconciliation metrics
//!
//! Exported through the global OpenTelemetry meter provider, which
//! `telemetry::init_telemetry` wires to OTLP when an endpoint is configured.
//! Without an endpoint the instruments are no-ops.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

/// Global meter for ingress-anubis metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("ingress_anubis"));

/// Histogram of Ingress reconciliation duration
///
/// Labels:
/// - `lifecycle`: unclaimed, generated, claim, sync, delete
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("ingress_anubis_reconcile_duration_seconds")
        .with_description("Duration of ingress reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of Ingress reconciliation errors
///
/// Labels:
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("ingress_anubis_reconcile_errors_total")
        .with_description("Total number of ingress reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of generated resources written (created or updated)
///
/// Labels:
/// - `kind`: Deployment, Service, Ingress
/// - `operation`: create, update
pub static RESOURCES_APPLIED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("ingress_anubis_resources_applied_total")
        .with_description("Total number of generated resources created or updated")
        .with_unit("{resources}")
        .build()
});

/// Record the outcome of one reconciliation
pub fn record_reconcile(lifecycle: &'static str, seconds: f64, success: bool) {
    RECONCILE_DURATION.record(
        seconds,
        &[
            KeyValue::new("lifecycle", lifecycle),
            KeyValue::new("result", if success { "success" } else { "error" }),
        ],
    );
}

/// Record a reconciliation error by class
pub fn record_error(error_type: &'static str) {
    RECONCILE_ERRORS.add(1, &[KeyValue::new("error_type", error_type)]);
}

/// Record a create/update of a generated resource
pub fn record_applied(kind: &'static str, operation: &'static str) {
    RESOURCES_APPLIED.add(
        1,
        &[
            KeyValue::new("kind", kind),
            KeyValue::new("operation", operation),
        ],
    );
}
