//! Prometheus metrics for the event log and audit pipeline.
//!
//! Call sites use the `metrics` macros through the small recorder types
//! below; [`init_metrics`] installs a Prometheus recorder when enabled.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;

use crate::audit::circuit_breaker::CircuitState;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address for the Prometheus scrape listener, e.g. `0.0.0.0:9090`.
    /// When unset the recorder is installed without a listener.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Histogram buckets for flush durations (seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Labels added to every metric
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            endpoint: None,
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
}

/// Handle to the installed recorder.
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
    /// A registry with no recorder installed.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
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
/// With an `endpoint` the exporter also serves scrapes over HTTP, which
/// requires a running Tokio runtime.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = match &config.endpoint {
        Some(endpoint) => {
            let addr: std::net::SocketAddr = endpoint.parse()?;
            let (recorder, exporter) = builder.with_http_listener(addr).build()?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|_| anyhow::anyhow!("a metrics recorder is already installed"))?;
            tokio::spawn(async move {
                if let Err(e) = exporter.await {
                    tracing::error!(error = ?e, "Prometheus exporter stopped");
                }
            });
            handle
        }
        None => builder.install_recorder()?,
    };

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        endpoint = ?config.endpoint,
        "Metrics initialized"
    );

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!("chronicle_errors_total", "Errors created, by code and category");
    describe_counter!("chronicle_bus_events_published_total", "Events published on the bus");
    describe_counter!(
        "chronicle_bus_handler_failures_total",
        "Bus handler invocations that failed or panicked"
    );

    describe_counter!("chronicle_audit_events_collected_total", "Events received by the audit collector");
    describe_counter!("chronicle_audit_events_classified_total", "Audit events classified");
    describe_counter!("chronicle_audit_events_persisted_total", "Audit records written");
    describe_counter!("chronicle_audit_events_suppressed_total", "Audit events dropped by policy");
    describe_counter!(
        "chronicle_audit_events_dropped_total",
        "Audit records lost to storage failure or an open breaker"
    );
    describe_counter!("chronicle_audit_storage_failures_total", "Failed audit storage writes");
    describe_counter!("chronicle_audit_policy_decisions_total", "Policy decisions by action");
    describe_counter!("chronicle_notifications_sent_total", "Notifications written to the sink");
    describe_histogram!("chronicle_audit_flush_duration_seconds", "Audit batch flush duration");
    describe_gauge!("chronicle_audit_buffer_size", "Events waiting in the audit buffer");

    describe_gauge!(
        "chronicle_circuit_breaker_state",
        "Audit storage breaker state (0 = closed, 1 = open)"
    );
    describe_counter!("chronicle_circuit_breaker_trips_total", "Times the audit breaker opened");
}

/// Recorder for audit pipeline counters.
pub struct AuditMetrics;

impl AuditMetrics {
    pub fn record_collected() {
        counter!("chronicle_audit_events_collected_total").increment(1);
    }

    pub fn record_classified() {
        counter!("chronicle_audit_events_classified_total").increment(1);
    }

    pub fn record_decision(action: &str, rule: &str) {
        counter!(
            "chronicle_audit_policy_decisions_total",
            "action" => action.to_string(),
            "rule" => rule.to_string(),
        )
        .increment(1);
    }

    pub fn record_suppressed() {
        counter!("chronicle_audit_events_suppressed_total").increment(1);
    }

    pub fn record_persisted(count: u64) {
        counter!("chronicle_audit_events_persisted_total").increment(count);
    }

    pub fn record_dropped(count: u64, reason: &'static str) {
        counter!("chronicle_audit_events_dropped_total", "reason" => reason).increment(count);
    }

    pub fn record_storage_failure() {
        counter!("chronicle_audit_storage_failures_total").increment(1);
    }

    pub fn set_buffer_size(size: usize) {
        gauge!("chronicle_audit_buffer_size").set(size as f64);
    }

    pub fn record_flush_duration(duration: Duration) {
        histogram!("chronicle_audit_flush_duration_seconds").record(duration.as_secs_f64());
    }

    pub fn record_circuit_breaker_state(state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
        };
        gauge!("chronicle_circuit_breaker_state").set(value);
    }

    pub fn record_circuit_breaker_trip() {
        counter!("chronicle_circuit_breaker_trips_total").increment(1);
    }
}

/// Times an operation and records it on `finish`.
pub struct FlushTimer {
    start: Instant,
}

impl FlushTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();
        AuditMetrics::record_flush_duration(duration);
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert!(config.endpoint.is_none());
        assert!(!config.duration_buckets.is_empty());
    }

    #[test]
    fn test_disabled_registry_renders_empty() {
        let registry = init_metrics(
            &MetricsConfig {
                enabled: false,
                ..MetricsConfig::default()
            },
            "chronicle-test",
        )
        .unwrap();
        assert!(!registry.is_enabled());
        assert_eq!(registry.render(), "");
    }

    #[test]
    fn test_recorders_without_installed_recorder() {
        AuditMetrics::record_collected();
        AuditMetrics::record_decision("allow", "default-allow");
        AuditMetrics::record_circuit_breaker_state(CircuitState::Open);
        let timer = FlushTimer::start();
        assert!(timer.finish() >= Duration::ZERO);
    }
}
