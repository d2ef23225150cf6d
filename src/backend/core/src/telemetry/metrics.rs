//! Prometheus metrics for the authorization pipeline.
//!
//! Recording goes through the `metrics` facade so library code never depends
//! on the exporter; the server installs the Prometheus recorder once and
//! renders it from `/metrics`.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for evaluation durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
}

/// Handle used to render the installed recorder.
#[derive(Clone)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder installed; renders nothing.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder.
///
/// # Errors
///
/// Returns an error if the buckets are invalid or a recorder is already
/// installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!(
        "keystone_guard_decisions_total",
        "Guard outcomes by kind (allowed, denied, fallback, unauthenticated, unavailable)"
    );
    describe_counter!(
        "keystone_decision_cache_total",
        "Decision cache lookups by result (hit, miss)"
    );
    describe_counter!(
        "keystone_hierarchy_cache_total",
        "Hierarchy cache lookups by result (hit, miss)"
    );
    describe_counter!(
        "keystone_engine_errors_total",
        "Rule engine calls that failed or timed out"
    );
    describe_counter!(
        "keystone_fallback_total",
        "Permission checks degraded to authentication only"
    );
    describe_counter!(
        "keystone_audit_dropped_total",
        "Audit entries that could not be written"
    );
    describe_counter!("keystone_errors_total", "Errors by code and category");
    describe_counter!("keystone_auth_failures_total", "Authentication failures by reason");
    describe_counter!(
        "keystone_cache_invalidations_total",
        "Bulk decision cache invalidations"
    );
    describe_histogram!(
        "keystone_evaluation_duration_seconds",
        "Time spent evaluating a permission, cache hits included"
    );
    describe_gauge!(
        "keystone_circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
}

/// Recording helpers used by the guard pipeline.
pub struct GuardMetrics;

impl GuardMetrics {
    /// Count a guard outcome.
    pub fn outcome(outcome: &'static str) {
        counter!("keystone_guard_decisions_total", "outcome" => outcome).increment(1);
    }

    /// Count a decision cache lookup.
    pub fn decision_cache(hit: bool) {
        counter!(
            "keystone_decision_cache_total",
            "result" => if hit { "hit" } else { "miss" }
        )
        .increment(1);
    }

    /// Count a hierarchy cache lookup.
    pub fn hierarchy_cache(hit: bool) {
        counter!(
            "keystone_hierarchy_cache_total",
            "result" => if hit { "hit" } else { "miss" }
        )
        .increment(1);
    }

    pub fn engine_error() {
        counter!("keystone_engine_errors_total").increment(1);
    }

    pub fn fallback() {
        counter!("keystone_fallback_total").increment(1);
    }

    pub fn evaluation_duration(elapsed: Duration, cached: bool) {
        histogram!(
            "keystone_evaluation_duration_seconds",
            "cached" => if cached { "true" } else { "false" }
        )
        .record(elapsed.as_secs_f64());
    }

    /// Publish the breaker state (0=closed, 1=half-open, 2=open).
    pub fn circuit_state(name: &str, value: f64) {
        gauge!("keystone_circuit_breaker_state", "breaker" => name.to_string()).set(value);
    }
}

/// Recording helpers for the audit pipeline.
pub struct AuditMetrics;

impl AuditMetrics {
    pub fn dropped(reason: &'static str) {
        counter!("keystone_audit_dropped_total", "reason" => reason).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_registry_renders_nothing() {
        let registry = MetricsRegistry::disabled();
        assert_eq!(registry.render(), "");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        GuardMetrics::outcome("allowed");
        GuardMetrics::decision_cache(true);
        GuardMetrics::evaluation_duration(Duration::from_millis(3), false);
        AuditMetrics::dropped("channel_full");
    }

    #[test]
    fn test_default_buckets_sorted() {
        let buckets = default_duration_buckets();
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }
}
