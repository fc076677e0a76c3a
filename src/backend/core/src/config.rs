//! Configuration management.

use serde::Deserialize;

use crate::audit::collector::CollectorConfig;
use crate::telemetry::TelemetryConfig;

const ENV_PREFIX: &str = "CHRONICLE";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service identity
    #[serde(default)]
    pub service: ServiceConfig,

    /// Audit collector tuning
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Logging and metrics
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name, attached to metrics as the `service` label
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Deployment environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            environment: default_environment(),
        }
    }
}

// Default value functions
fn default_service_name() -> String { "chronicle".to_string() }
fn default_environment() -> String { "development".to_string() }

impl Config {
    /// Load configuration from `CHRONICLE__*` environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    pub fn is_development(&self) -> bool {
        self.service.environment == "development"
    }
}
