//! Prometheus metrics for the ledger runtime.
//!
//! This module provides metric collection for:
//! - Balance cache lookups (hits, misses, size, latency)
//! - Ledger operations and optimistic-concurrency conflicts
//! - Conflict retries
//! - The timeout sweeper
//!
//! The cache service additionally keeps its own atomic counters so a
//! snapshot is available without a recorder installed.
//!
//! # Example
//!
//! ```rust,no_run
//! use balance_ledger_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serves http://0.0.0.0:9090/metrics
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder and scrape endpoint for the ledger metrics.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the `/metrics` scrape endpoint binds to
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe the ledger metrics, install the Prometheus recorder and
    /// serve the scrape endpoint on the configured address.
    ///
    /// Must be called from within a Tokio runtime; the HTTP exporter runs as
    /// a spawned task.
    ///
    /// # Errors
    ///
    /// Returns error outside a Tokio runtime, if the listener cannot bind, or
    /// if the recorder cannot be installed.
    ///
    /// # Note
    ///
    /// A second installation in the same process (e.g. in tests) is logged
    /// and treated as success; no second listener is started.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let runtime =
            Handle::try_current().map_err(|e| MetricsError::Build(e.to_string()))?;
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.02, 0.05, 0.1, 0.25, 0.5, 1.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                let addr = self.addr;
                runtime.spawn(async move {
                    if let Err(_) = exporter.await {
                        tracing::error!(%addr, "Metrics endpoint stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Ledger metrics endpoint listening");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this instance did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Cache
    describe_counter!("ledger_cache_hits_total", "Balance lookups served from the cache");
    describe_counter!(
        "ledger_cache_misses_total",
        "Balance lookups that went to the repository"
    );
    describe_gauge!("ledger_cache_size", "Entries currently held by the balance cache");
    describe_histogram!(
        "ledger_cache_lookup_duration_seconds",
        "Time taken to answer a balance lookup"
    );

    // Ledger operations
    describe_counter!(
        "ledger_operations_total",
        "Ledger operations by operation and outcome"
    );
    describe_counter!(
        "ledger_version_conflicts_total",
        "Saves rejected because the stored version had moved on"
    );
    describe_counter!(
        "ledger_transactions_timed_out_total",
        "Pending transactions and transfers cancelled by the timeout sweep"
    );

    describe_counter!(
        "ledger_stuck_holds_total",
        "Expired reservations whose hold could not be released"
    );

    // Retry
    describe_counter!("ledger_retry_attempts_total", "Conflict retries scheduled");
    describe_counter!(
        "ledger_retry_successes_total",
        "Operations that succeeded after at least one retry"
    );
    describe_counter!(
        "ledger_retry_exhausted_total",
        "Operations that ran out of retries"
    );
}

/// Balance cache metrics recorder.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record a cache hit.
    pub fn record_hit(duration: Duration) {
        counter!("ledger_cache_hits_total").increment(1);
        histogram!("ledger_cache_lookup_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a cache miss.
    pub fn record_miss(duration: Duration) {
        counter!("ledger_cache_misses_total").increment(1);
        histogram!("ledger_cache_lookup_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record the current number of entries.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_size(size: usize) {
        gauge!("ledger_cache_size").set(size as f64);
    }
}

/// Ledger operation metrics recorder.
pub struct LedgerMetrics;

impl LedgerMetrics {
    /// Record an expired reservation whose hold stayed on the balance.
    pub fn record_stuck_hold() {
        counter!("ledger_stuck_holds_total").increment(1);
    }

    /// Record the outcome of an operation.
    pub fn record_operation(operation: &'static str, outcome: &'static str) {
        counter!("ledger_operations_total", "operation" => operation, "outcome" => outcome)
            .increment(1);
    }

    /// Record a stale-version save.
    pub fn record_version_conflict(entity: &'static str) {
        counter!("ledger_version_conflicts_total", "entity" => entity).increment(1);
    }

    /// Record records cancelled by the timeout sweep.
    pub fn record_timed_out(entity: &'static str, count: usize) {
        counter!("ledger_transactions_timed_out_total", "entity" => entity)
            .increment(u64::try_from(count).unwrap_or(u64::MAX));
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("ledger_retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("ledger_retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("ledger_retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn start_requires_a_runtime() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        assert!(matches!(server.start(), Err(MetricsError::Build(_))));
        assert!(server.handle().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        CacheMetrics::record_hit(Duration::from_micros(40));
        CacheMetrics::record_miss(Duration::from_millis(3));
        LedgerMetrics::record_operation("deposit", "ok");

        // Another test may have installed the recorder first; metrics are
        // still recorded, only this handle is missing.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("ledger_cache_hits_total"));
            assert!(rendered.contains("ledger_operations_total"));
        }
    }
}
