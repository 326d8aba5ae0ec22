//! Prometheus metrics for the ACL subsystem.
//!
//! Metrics are emitted with the `metrics` macros at their call sites; this
//! module installs the recorder, describes every series, and optionally
//! serves them over HTTP.
//!
//! | Series                           | Kind      | Labels                 |
//! |----------------------------------|-----------|------------------------|
//! | `bastion_apply_total`            | counter   | `op`, `result`         |
//! | `bastion_authorize_total`        | counter   | `kind`, `decision`     |
//! | `bastion_errors_total`           | counter   | `code`, `category`     |
//! | `bastion_write_duration_seconds` | histogram | `op`, `outcome`        |
//! | `bastion_operation_duration_seconds` | histogram | `operation`        |
//! | `bastion_raft_term`              | gauge     |                        |
//! | `bastion_commit_index`           | gauge     |                        |

use metrics::{describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address for the Prometheus scrape endpoint, e.g. "0.0.0.0:9102"
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    /// Histogram buckets for durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Labels added to every series
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: None,
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0]
}

/// Access to the installed recorder.
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
    /// A registry with no recorder; every macro call is a no-op.
    pub fn disabled() -> Self {
        Self { prometheus_handle: None }
    }

    pub fn is_installed(&self) -> bool {
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

/// Install the global Prometheus recorder.
///
/// With `listen` set the scrape endpoint is spawned on the current tokio
/// runtime, so this must then be called from inside one.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = match config.listen {
        Some(addr) => {
            let (recorder, exporter) = builder.with_http_listener(addr).build()?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {}", e))?;
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
        listen = ?config.listen,
        "Metrics initialized"
    );

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!("bastion_apply_total", "Committed log entries applied to the local state machine");
    describe_counter!("bastion_authorize_total", "Authorization decisions by outcome");
    describe_counter!("bastion_errors_total", "Errors raised, by code and category");
    describe_histogram!(
        "bastion_write_duration_seconds",
        "Time from write submission to applied result"
    );
    describe_histogram!(
        "bastion_operation_duration_seconds",
        "Duration of internal operations such as rule compilation and log replay"
    );
    describe_gauge!("bastion_raft_term", "Current consensus term");
    describe_gauge!("bastion_commit_index", "Highest committed log index");
}

/// Times one operation into `bastion_operation_duration_seconds`.
pub struct OperationTimer {
    start: Instant,
    operation: &'static str,
}

impl OperationTimer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record and return the elapsed time.
    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();
        histogram!(
            "bastion_operation_duration_seconds",
            "operation" => self.operation,
        )
        .record(duration.as_secs_f64());
        duration
    }
}
