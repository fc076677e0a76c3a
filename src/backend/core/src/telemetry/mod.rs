//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: JSON/pretty/compact output with sensitive-value redaction
//! - **Metrics**: counters and gauges for the bus and audit pipeline

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, RedactionConfig, RedactionPattern, SensitiveFieldRedactor};
pub use metrics::{init_metrics, AuditMetrics, FlushTimer, MetricsConfig, MetricsRegistry};

use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Initialize metrics, then logging.
pub fn init_telemetry(config: &TelemetryConfig, service_name: &str, environment: &str) -> anyhow::Result<TelemetryHandle> {
    let metrics = init_metrics(&config.metrics, service_name)?;
    init_logging(&config.logging, environment)?;
    Ok(TelemetryHandle { metrics })
}

/// Handle for the telemetry lifecycle.
#[derive(Debug)]
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
}

impl TelemetryHandle {
    pub fn shutdown(self) {
        ::tracing::info!("Telemetry shutdown complete");
    }
}
