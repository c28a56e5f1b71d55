//! Prometheus metrics for the RPC client, outbox, lease manager and
//! provisioner.
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed, so library code records unconditionally.
//!
//! # Example
//!
//! ```rust,no_run
//! use meshbus_core::config::ObservabilityConfig;
//! use meshbus_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::from_config(&ObservabilityConfig::default());
//! server.serve()?;
//! // Scrape http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use meshbus_core::config::ObservabilityConfig;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Histogram buckets for every `*_duration_seconds` metric.
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Failure to set up the Prometheus exporter.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Exporter configuration was rejected.
    #[error("Invalid Prometheus exporter configuration: {0}")]
    Build(String),
    /// The recorder could not be made global.
    #[error("Could not install the metrics recorder: {0}")]
    Install(String),
}

/// Prometheus exporter for the mesh metrics.
///
/// Built from [`ObservabilityConfig`]; when `metrics_enabled` is false both
/// [`start`](Self::start) and [`serve`](Self::serve) do nothing and
/// [`render`](Self::render) returns `None`.
pub struct MetricsServer {
    addr: SocketAddr,
    enabled: bool,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Exporter that serves on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            enabled: true,
            handle: None,
        }
    }

    /// Exporter following the `metrics_enabled` and `metrics_addr` settings.
    #[must_use]
    pub const fn from_config(config: &ObservabilityConfig) -> Self {
        Self {
            addr: config.metrics_addr,
            enabled: config.metrics_enabled,
            handle: None,
        }
    }

    /// Whether the exporter will install a recorder.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Install the recorder in-process only, without an HTTP listener.
    ///
    /// If another recorder is already global (several tests in one binary,
    /// say) this logs a warning and leaves [`handle`](Self::handle) empty.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be configured.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        if !self.enabled {
            return Ok(());
        }
        register_metrics();

        let recorder = exporter_builder()?.build_recorder();
        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_ok() {
            self.handle = Some(handle);
        } else {
            tracing::warn!("A metrics recorder is already installed; keeping it");
        }
        Ok(())
    }

    /// Install the recorder and expose `/metrics` over HTTP on the configured
    /// address. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the listener cannot be built or a recorder
    /// is already installed.
    pub fn serve(&mut self) -> Result<(), MetricsError> {
        if !self.enabled {
            tracing::debug!("Metrics disabled");
            return Ok(());
        }
        register_metrics();

        let (recorder, exporter) = exporter_builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tokio::spawn(async move {
            // `ExporterError` implements neither `Debug` nor `Display`.
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Serving Prometheus metrics on /metrics");
        Ok(())
    }

    /// Handle to the installed recorder, if this exporter installed one.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Current metrics in the Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle().map(PrometheusHandle::render)
    }
}

fn exporter_builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

/// Describe every metric the mesh records.
fn register_metrics() {
    // RPC
    describe_counter!("rpc_requests_total", "Request/reply calls issued");
    describe_counter!("rpc_errors_total", "Request/reply and emit calls that failed");
    describe_histogram!(
        "rpc_request_duration_seconds",
        "Round-trip time of request/reply calls"
    );
    describe_counter!("rpc_events_emitted_total", "Fire-and-forget events accepted by the broker");

    // Outbox
    describe_counter!("outbox_events_buffered_total", "Events buffered by outboxes");
    describe_counter!("outbox_events_flushed_total", "Buffered events delivered after commit");
    describe_counter!("outbox_events_failed_total", "Buffered events the broker rejected");
    describe_histogram!("outbox_flush_duration_seconds", "Time taken to flush an outbox");

    // Leases
    describe_counter!("lease_acquired_total", "Leases acquired");
    describe_counter!(
        "lease_skipped_total",
        "Executions skipped because the lease was held elsewhere"
    );
    describe_counter!("lease_refresh_failures_total", "Lease refreshes that failed");

    // Provisioning
    describe_counter!("topics_created_total", "Topics created by the provisioner");
    describe_counter!(
        "topic_partitions_increased_total",
        "Topics whose partition count was increased"
    );
}

/// RPC client metrics recorder.
pub struct RpcMetrics;

impl RpcMetrics {
    /// Record a completed request/reply call.
    pub fn record_request(pattern: &str, duration: Duration) {
        counter!("rpc_requests_total", "pattern" => pattern.to_string()).increment(1);
        histogram!("rpc_request_duration_seconds", "pattern" => pattern.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record an accepted emit.
    pub fn record_emit(pattern: &str) {
        counter!("rpc_events_emitted_total", "pattern" => pattern.to_string()).increment(1);
    }

    /// Record a failed call.
    pub fn record_error(pattern: &str) {
        counter!("rpc_errors_total", "pattern" => pattern.to_string()).increment(1);
    }
}

/// Outbox metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record an event buffered.
    pub fn record_buffered() {
        counter!("outbox_events_buffered_total").increment(1);
    }

    /// Record the outcome of a flush.
    pub fn record_flush(delivered: usize, failed: usize, duration: Duration) {
        counter!("outbox_events_flushed_total").increment(delivered as u64);
        counter!("outbox_events_failed_total").increment(failed as u64);
        histogram!("outbox_flush_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Lease manager metrics recorder.
pub struct LeaseMetrics;

impl LeaseMetrics {
    /// Record an acquired lease.
    pub fn record_acquired(key: &str) {
        counter!("lease_acquired_total", "lock_key" => key.to_string()).increment(1);
    }

    /// Record a skipped execution.
    pub fn record_skipped(key: &str) {
        counter!("lease_skipped_total", "lock_key" => key.to_string()).increment(1);
    }

    /// Record a failed refresh.
    pub fn record_refresh_failure(key: &str) {
        counter!("lease_refresh_failures_total", "lock_key" => key.to_string()).increment(1);
    }
}

/// Provisioning metrics recorder.
pub struct ProvisioningMetrics;

impl ProvisioningMetrics {
    /// Record a created topic.
    pub fn record_topic_created() {
        counter!("topics_created_total").increment(1);
    }

    /// Record a partition increase.
    pub fn record_partitions_increased() {
        counter!("topic_partitions_increased_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn exporter_is_idle_until_started() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.is_enabled());
        assert!(server.render().is_none());
    }

    #[test]
    fn disabled_exporter_installs_nothing() {
        let config = ObservabilityConfig {
            metrics_enabled: false,
            ..ObservabilityConfig::default()
        };
        let mut server = MetricsServer::from_config(&config);
        server.start().unwrap();
        server.serve().unwrap();
        assert!(server.handle().is_none());
    }

    #[test]
    fn recorded_metrics_are_rendered() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        RpcMetrics::record_request("users.get", Duration::from_millis(20));
        OutboxMetrics::record_flush(3, 1, Duration::from_millis(5));
        LeaseMetrics::record_acquired("nightly");

        // Only the first exporter in this binary gets the global recorder.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("rpc_requests_total"));
            assert!(rendered.contains("outbox_events_flushed_total"));
            assert!(rendered.contains("lease_acquired_total"));
        }
    }
}
