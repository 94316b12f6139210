//! Prometheus metrics for cluster membership.
//!
//! Metrics cover:
//! - Published configuration version seen by this process
//! - CAS outcomes and store latency per backend
//! - Replica polling (failures, stale snapshots discarded)
//! - Propagation barriers (duration, timeouts)
//! - Saga outcomes, self-registration and fencing transitions
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "membrane" prefix
//! to avoid name collisions with the default Prometheus registry.
//! Registration errors are logged and an unregistered metric is returned
//! instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for membership metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("membrane".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Configuration version
// =============================================================================

define_gauge!(
    PUBLISHED_VERSION,
    "nodes_configuration_published_version",
    "Version of the NodesConfiguration currently held by the local replica"
);
define_counter!(
    STALE_SNAPSHOTS,
    "nodes_configuration_stale_snapshots_total",
    "Snapshots discarded because they were not newer than the local replica"
);
define_counter!(
    POLL_FAILURES,
    "nodes_configuration_poll_failures_total",
    "Failed reads by the local replica poller"
);

// =============================================================================
// Store
// =============================================================================

define_counter_vec!(
    CAS_OUTCOMES,
    "cas_writes_total",
    "Conditional writes to the configuration store by outcome",
    ["outcome"]
);
define_histogram_vec!(
    STORE_DURATION,
    "store_operation_duration_seconds",
    "Configuration store operation latency",
    ["backend", "operation"],
    [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
);

// =============================================================================
// Propagation and sagas
// =============================================================================

define_histogram_vec!(
    PROPAGATION_DURATION,
    "propagation_wait_seconds",
    "Time spent waiting for a version to propagate",
    ["outcome"],
    [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
);
define_counter_vec!(
    SAGA_OUTCOMES,
    "saga_runs_total",
    "Membership change sagas by name and outcome",
    ["saga", "outcome"]
);
define_counter_vec!(
    REGISTRATIONS,
    "self_registrations_total",
    "Self-registration attempts by outcome",
    ["outcome"]
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts by policy and outcome",
    ["policy", "outcome"]
);

// =============================================================================
// Fencing
// =============================================================================

define_gauge!(
    FENCED,
    "node_fenced",
    "Whether this node fenced itself after an identity mismatch (1=fenced)"
);
define_counter_vec!(
    FENCE_TRANSITIONS,
    "fence_transitions_total",
    "Identity checks that found a mismatch, by reason",
    ["reason"]
);
define_gauge_vec!(
    NODE_GENERATION,
    "node_generation",
    "Generation of this node as published in the configuration",
    ["index"]
);

// =============================================================================
// Safe registration
// =============================================================================

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
    }
    gauge
}

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
    }
    gauge
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
    }
    counter
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
    }
    counter
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(histogram.clone())) {
        warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
    }
    histogram
}

/// Force registration of every metric so they show up before first use.
pub fn init_metrics() {
    let _ = &*PUBLISHED_VERSION;
    let _ = &*STALE_SNAPSHOTS;
    let _ = &*POLL_FAILURES;
    let _ = &*CAS_OUTCOMES;
    let _ = &*STORE_DURATION;
    let _ = &*PROPAGATION_DURATION;
    let _ = &*SAGA_OUTCOMES;
    let _ = &*REGISTRATIONS;
    let _ = &*RETRY_ATTEMPTS;
    let _ = &*FENCED;
    let _ = &*FENCE_TRANSITIONS;
    let _ = &*NODE_GENERATION;
}

/// Encode all metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn gather_metrics() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

// =============================================================================
// Recording helpers
// =============================================================================

pub fn record_published_version(version: u64) {
    PUBLISHED_VERSION.set(version.min(i64::MAX as u64) as i64);
}

pub fn record_stale_snapshot() {
    STALE_SNAPSHOTS.inc();
}

pub fn record_poll_failure() {
    POLL_FAILURES.inc();
}

/// Record the outcome of a conditional write ("success", "conflict", "error").
pub fn record_cas(outcome: &str) {
    CAS_OUTCOMES.with_label_values(&[outcome]).inc();
}

pub fn record_store_duration(backend: &str, operation: &str, secs: f64) {
    STORE_DURATION
        .with_label_values(&[backend, operation])
        .observe(secs);
}

/// Record a propagation barrier ("converged" or "timeout").
pub fn record_propagation(outcome: &str, secs: f64) {
    PROPAGATION_DURATION
        .with_label_values(&[outcome])
        .observe(secs);
}

pub fn record_saga(saga: &str, outcome: &str) {
    SAGA_OUTCOMES.with_label_values(&[saga, outcome]).inc();
}

pub fn record_registration(outcome: &str) {
    REGISTRATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_generation(index: u16, generation: u32) {
    NODE_GENERATION
        .with_label_values(&[&index.to_string()])
        .set(generation as i64);
}

/// Record entering the fenced state.
pub fn enter_fenced(reason: &str) {
    FENCED.set(1);
    FENCE_TRANSITIONS.with_label_values(&[reason]).inc();
}

/// Record a mismatch observed while a no-op policy keeps the node running.
pub fn record_fence_ignored(reason: &str) {
    FENCE_TRANSITIONS.with_label_values(&[reason]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_published_version_gauge() {
        record_published_version(42);
        assert_eq!(PUBLISHED_VERSION.get(), 42);
        record_published_version(u64::MAX);
        assert_eq!(PUBLISHED_VERSION.get(), i64::MAX);
    }

    #[test]
    #[serial]
    fn test_cas_counter_labels() {
        let before = CAS_OUTCOMES.with_label_values(&["conflict"]).get();
        record_cas("conflict");
        assert_eq!(CAS_OUTCOMES.with_label_values(&["conflict"]).get(), before + 1);
    }

    #[test]
    #[serial]
    fn test_fencing_metrics() {
        let before = FENCE_TRANSITIONS.with_label_values(&["lost"]).get();
        enter_fenced("lost");
        assert_eq!(FENCED.get(), 1);
        assert_eq!(FENCE_TRANSITIONS.with_label_values(&["lost"]).get(), before + 1);
        FENCED.set(0);
    }

    #[test]
    #[serial]
    fn test_encode_contains_prefix() {
        init_metrics();
        record_saga("expand", "success");
        let text = encode_metrics().unwrap();
        assert!(text.contains("membrane_saga_runs_total"));
        assert!(text.contains("membrane_nodes_configuration_published_version"));
    }

    #[test]
    fn test_gather_is_non_empty_after_init() {
        init_metrics();
        record_stale_snapshot();
        assert!(!gather_metrics().is_empty());
    }
}
