//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: JSON/pretty/compact output with secret redaction
//! - **Metrics**: Prometheus recorder for apply, authorize and write metrics
//!
//! # Example
//!
//! ```rust,no_run
//! use bastion_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let handle = init_telemetry(&TelemetryConfig::default())?;
//! println!("{}", handle.metrics.render());
//! # Ok(())
//! # }
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, SecretRedactor};
pub use metrics::{init_metrics, MetricsConfig, MetricsRegistry, OperationTimer};

use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to log lines and metrics
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "bastion".to_string()
}

fn default_environment() -> String {
    std::env::var("BASTION_ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
}

/// Initialize logging and metrics. Call once at startup, inside a tokio
/// runtime when a metrics listener is configured.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    // Metrics first so the first log lines can already count errors.
    let metrics = init_metrics(&config.metrics, &config.service_name)?;
    init_logging(&config.logging, &config.environment)?;

    Ok(TelemetryHandle { metrics })
}

/// Handle for the telemetry lifecycle.
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
}

impl TelemetryHandle {
    pub fn shutdown(self) {
        tracing::info!(metrics = self.metrics.is_installed(), "Telemetry shutdown complete");
    }
}
