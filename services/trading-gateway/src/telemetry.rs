//! Telemetry for the signal pipeline

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Install the Prometheus recorder and serve `/metrics` on `addr`
///
/// # Errors
///
/// Fails when a recorder is already installed or the listener cannot bind.
pub fn install_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;
    info!("Metrics endpoint available at http://{}/metrics", addr);
    Ok(())
}

/// Signal counters, mirrored to the metrics recorder
#[derive(Debug, Default)]
pub struct TelemetryCollector {
    received: AtomicU64,
    rejected: AtomicU64,
    executed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
}

impl TelemetryCollector {
    /// Zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal accepted and stored
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        counter!("pipeline_signals_received_total").increment(1);
    }

    /// Signal refused by structural validation
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        counter!("pipeline_signals_rejected_total").increment(1);
    }

    /// Signal executed `delay_secs` after creation
    pub fn record_executed(&self, delay_secs: f64) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        counter!("pipeline_signals_executed_total").increment(1);
        histogram!("pipeline_execution_delay_seconds").record(delay_secs);
    }

    /// Signal cancelled for `reason`
    pub fn record_cancelled(&self, reason: &'static str) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        counter!("pipeline_signals_cancelled_total", "reason" => reason).increment(1);
    }

    /// Signal execution failed
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        counter!("pipeline_signals_failed_total").increment(1);
    }

    /// Signal expired before execution
    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
        counter!("pipeline_signals_expired_total").increment(1);
    }

    /// Counter snapshot
    #[must_use]
    pub fn get_stats(&self) -> TelemetryStats {
        TelemetryStats {
            received: self.received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

/// Signal counters at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    /// Signals stored
    pub received: u64,
    /// Signals refused by validation
    pub rejected: u64,
    /// Signals executed
    pub executed: u64,
    /// Signals cancelled by conditions, risk or request
    pub cancelled: u64,
    /// Signals whose execution failed
    pub failed: u64,
    /// Signals expired
    pub expired: u64,
}
