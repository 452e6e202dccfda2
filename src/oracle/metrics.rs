//! In-process metrics for the decision pipeline.
//!
//! Counters, gauges and duration samples kept behind an async `RwLock`. Hosts
//! read them through [`PipelineMetrics::snapshot`] and export them however they like.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Proposals that reached the aggregator, local included
pub const PROPOSALS_RECEIVED: &str = "proposals_received_total";
pub const PROVIDER_TIMEOUTS: &str = "provider_timeouts_total";
pub const PROVIDER_ERRORS: &str = "provider_errors_total";
pub const PROVIDER_MALFORMED: &str = "provider_malformed_total";
pub const PROVIDER_THROTTLED: &str = "provider_throttled_total";
pub const PROVIDER_CIRCUIT_OPEN: &str = "provider_circuit_open_total";
pub const DECISIONS_TOTAL: &str = "decisions_total";
/// Decisions forced to HOLD because the arbiter failed
pub const DECISIONS_FAIL_CLOSED: &str = "decisions_fail_closed_total";
pub const VERDICTS_BLOCKED: &str = "verdicts_blocked_total";
pub const VERDICTS_WARNED: &str = "verdicts_warned_total";
pub const LEDGER_FLUSHES_OK: &str = "ledger_flushes_ok_total";
pub const LEDGER_FLUSHES_FAILED: &str = "ledger_flushes_failed_total";
pub const LEDGER_RECORDS_DROPPED: &str = "ledger_records_dropped_total";
/// Gauge: audit records waiting to be committed
pub const LEDGER_BUFFER_DEPTH: &str = "ledger_buffer_depth";
/// Histogram of full decision cycle durations
pub const CYCLE_DURATION: &str = "cycle_duration_seconds";

/// Keeps at most this many samples per histogram.
const MAX_SAMPLES: usize = 1_000;

#[derive(Clone, Default)]
pub struct PipelineMetrics {
    inner: Arc<RwLock<InternalMetrics>>,
}

#[derive(Debug, Default)]
struct InternalMetrics {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Vec<f64>>,
}

impl PipelineMetrics {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(self), level = "trace")]
    pub async fn increment_counter(&self, name: &str) {
        self.add_to_counter(name, 1).await;
    }

    /// Add `amount` to a counter, creating it at zero.
    pub async fn add_to_counter(&self, name: &str, amount: u64) {
        let mut metrics = self.inner.write().await;
        *metrics.counters.entry(name.to_string()).or_insert(0) += amount;
        debug!("Counter {} += {}", name, amount);
    }

    /// Set a gauge to its latest value.
    pub async fn set_gauge(&self, name: &str, value: f64) {
        let mut metrics = self.inner.write().await;
        metrics.gauges.insert(name.to_string(), value);
    }

    /// Record a sample, keeping only the most recent 1000 per histogram.
    pub async fn record_histogram(&self, name: &str, value: f64) {
        let mut metrics = self.inner.write().await;
        let samples = metrics.histograms.entry(name.to_string()).or_default();
        samples.push(value);
        if samples.len() > MAX_SAMPLES {
            samples.remove(0);
        }
    }

    /// Record one decision cycle duration in seconds.
    pub async fn record_cycle_time(&self, duration: Duration) {
        self.record_histogram(CYCLE_DURATION, duration.as_secs_f64()).await;
    }

    /// Current value of a counter, zero if never incremented.
    pub async fn counter(&self, name: &str) -> u64 {
        self.inner.read().await.counters.get(name).copied().unwrap_or(0)
    }

    pub async fn gauge(&self, name: &str) -> Option<f64> {
        self.inner.read().await.gauges.get(name).copied()
    }

    /// Point-in-time copy of every metric.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let metrics = self.inner.read().await;
        MetricsSnapshot {
            counters: metrics.counters.clone(),
            gauges: metrics.gauges.clone(),
            histograms: metrics.histograms.clone(),
            taken_at: Instant::now(),
        }
    }
}

/// Point-in-time copy of all metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, Vec<f64>>,
    /// When the snapshot was taken
    pub taken_at: Instant,
}

impl MetricsSnapshot {
    /// Mean of a histogram, if it has samples.
    pub fn mean(&self, name: &str) -> Option<f64> {
        let samples = self.histograms.get(name)?;
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}
