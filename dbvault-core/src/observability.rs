/*!
Observability infrastructure for dbvault.

This module provides:
- Structured logging and tracing setup
- Prometheus metrics instrumentation (behind the `metrics` feature)

The `record_*` functions are always available and compile to no-ops when
the `metrics` feature is disabled, so the engines call them unconditionally.
*/

use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, VaultError};

#[cfg(feature = "metrics")]
pub use self::prometheus_metrics::VaultMetrics;

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use crate::{Result, VaultError};
    use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
    use std::sync::OnceLock;

    /// Global metrics instance; `None` if registration failed
    static METRICS: OnceLock<Option<VaultMetrics>> = OnceLock::new();

    /// Metrics collection for backup and recovery runs
    #[derive(Debug)]
    pub struct VaultMetrics {
        pub backups_total: Counter,
        pub backup_failures_total: Counter,
        pub backup_duration_seconds: Histogram,
        pub artifact_size_bytes: Histogram,

        pub restores_total: Counter,
        pub restore_failures_total: Counter,
        pub restore_duration_seconds: Histogram,
        pub statements_replayed_total: Counter,

        pub artifacts_evicted_total: Counter,

        // Prometheus registry for scraping
        registry: Registry,
    }

    fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
        let counter = Counter::new(name, help)
            .map_err(|e| VaultError::storage(format!("Failed to create {name} metric: {e}")))?;
        registry
            .register(Box::new(counter.clone()))
            .map_err(|e| VaultError::storage(format!("Failed to register {name}: {e}")))?;
        Ok(counter)
    }

    fn histogram(registry: &Registry, opts: HistogramOpts) -> Result<Histogram> {
        let name = opts.common_opts.name.clone();
        let histogram = Histogram::with_opts(opts)
            .map_err(|e| VaultError::storage(format!("Failed to create {name} metric: {e}")))?;
        registry
            .register(Box::new(histogram.clone()))
            .map_err(|e| VaultError::storage(format!("Failed to register {name}: {e}")))?;
        Ok(histogram)
    }

    impl VaultMetrics {
        fn new() -> Result<Self> {
            let registry = Registry::new();

            let duration_buckets = vec![0.01, 0.05, 0.25, 1.0, 5.0, 30.0, 120.0, 600.0];
            let size_buckets = prometheus::exponential_buckets(1024.0, 4.0, 10)
                .map_err(|e| VaultError::storage(format!("Invalid size buckets: {e}")))?;

            Ok(Self {
                backups_total: counter(&registry, "dbvault_backups_total", "Completed backup runs")?,
                backup_failures_total: counter(
                    &registry,
                    "dbvault_backup_failures_total",
                    "Backup runs that failed",
                )?,
                backup_duration_seconds: histogram(
                    &registry,
                    HistogramOpts::new("dbvault_backup_duration_seconds", "Duration of backup runs")
                        .buckets(duration_buckets.clone()),
                )?,
                artifact_size_bytes: histogram(
                    &registry,
                    HistogramOpts::new("dbvault_artifact_size_bytes", "Size of final artifacts")
                        .buckets(size_buckets),
                )?,
                restores_total: counter(&registry, "dbvault_restores_total", "Completed restores")?,
                restore_failures_total: counter(
                    &registry,
                    "dbvault_restore_failures_total",
                    "Restores that failed",
                )?,
                restore_duration_seconds: histogram(
                    &registry,
                    HistogramOpts::new("dbvault_restore_duration_seconds", "Duration of restores")
                        .buckets(duration_buckets),
                )?,
                statements_replayed_total: counter(
                    &registry,
                    "dbvault_statements_replayed_total",
                    "Statements executed during restores",
                )?,
                artifacts_evicted_total: counter(
                    &registry,
                    "dbvault_artifacts_evicted_total",
                    "Backups evicted by the retention policy",
                )?,
                registry,
            })
        }

        /// Get or initialize the global metrics instance
        pub fn global() -> Option<&'static VaultMetrics> {
            METRICS
                .get_or_init(|| match Self::new() {
                    Ok(metrics) => Some(metrics),
                    Err(e) => {
                        tracing::warn!("Metrics disabled: {}", e);
                        None
                    }
                })
                .as_ref()
        }

        /// Gather metrics in Prometheus text format
        pub fn gather_metrics(&self) -> Result<String> {
            let encoder = TextEncoder::new();
            let metric_families = self.registry.gather();
            let mut buffer = Vec::new();

            encoder
                .encode(&metric_families, &mut buffer)
                .map_err(|e| VaultError::storage(format!("Failed to encode metrics: {e}")))?;

            String::from_utf8(buffer).map_err(|e| {
                VaultError::storage(format!("Failed to convert metrics to string: {e}"))
            })
        }
    }
}

#[cfg(feature = "metrics")]
fn with_metrics(f: impl FnOnce(&VaultMetrics)) {
    if let Some(metrics) = VaultMetrics::global() {
        f(metrics);
    }
}

/// Record the outcome of a backup run
#[allow(unused_variables)]
pub fn record_backup(success: bool, duration: Duration, size_bytes: u64) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| {
        m.backup_duration_seconds.observe(duration.as_secs_f64());
        if success {
            m.backups_total.inc();
            m.artifact_size_bytes.observe(size_bytes as f64);
        } else {
            m.backup_failures_total.inc();
        }
    });
}

/// Record the outcome of a restore
#[allow(unused_variables)]
pub fn record_restore(success: bool, duration: Duration, statements: u64) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| {
        m.restore_duration_seconds.observe(duration.as_secs_f64());
        m.statements_replayed_total.inc_by(statements as f64);
        if success {
            m.restores_total.inc();
        } else {
            m.restore_failures_total.inc();
        }
    });
}

/// Record backups evicted by retention
#[allow(unused_variables)]
pub fn record_evictions(count: usize) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.artifacts_evicted_total.inc_by(count as f64));
}

/// Prometheus text exposition of all metrics
///
/// Returns an empty string when the `metrics` feature is disabled.
pub fn gather_metrics() -> Result<String> {
    #[cfg(feature = "metrics")]
    {
        match VaultMetrics::global() {
            Some(metrics) => metrics.gather_metrics(),
            None => Ok(String::new()),
        }
    }
    #[cfg(not(feature = "metrics"))]
    {
        Ok(String::new())
    }
}

/// Initialize the global observability system
///
/// Installs a tracing subscriber filtered by `RUST_LOG` (default
/// `dbvault=info`) with either JSON or human-readable output.
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    VaultMetrics::global();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("dbvault=info,dbvault_core=info"))
        .map_err(|e| VaultError::validation(format!("Invalid log filter: {e}")))?;

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };

    result.map_err(|e| {
        VaultError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!("dbvault observability initialized");
    Ok(())
}
