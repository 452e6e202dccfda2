//! Batched, compressed audit trail of every decision cycle.
//!
//! Records are buffered and flushed as one gzip-compressed JSON array per
//! batch to an external append-only [`CommitTarget`]. Threshold flushes run on
//! a background task, so logging never waits on the target, and every
//! submission attempt is time-bounded. A failed submission puts
//! the batch back at the front of the buffer, so delivery is at-least-once and
//! in order. During a long outage the buffer grows up to
//! `max_buffered_records`, after which the oldest records are dropped.

use crate::oracle::metrics::{self, PipelineMetrics};
use crate::oracle::retry_strategy;
use crate::oracle::types::{AuditRecord, LedgerConfig};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_retry::Retry;
use tracing::{debug, error, info, instrument, warn};

/// Acknowledgement from the commit target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitReceipt {
    /// Target-specific reference (transaction id, object key, ...)
    pub reference: String,
    pub records: usize,
    pub bytes: usize,
}

/// External append-only destination for audit batches.
#[async_trait]
pub trait CommitTarget: Send + Sync {
    async fn submit(&self, payload: Vec<u8>) -> Result<CommitReceipt>;
}

/// Serializes and gzip-compresses a batch.
pub fn encode_batch(records: &[AuditRecord]) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(records).context("Failed to serialize audit batch")?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).context("Failed to compress audit batch")?;
    encoder.finish().context("Failed to finish audit batch compression")
}

/// Inverse of [`encode_batch`].
pub fn decode_batch(payload: &[u8]) -> Result<Vec<AuditRecord>> {
    let mut json = Vec::new();
    GzDecoder::new(payload)
        .read_to_end(&mut json)
        .context("Failed to decompress audit batch")?;
    serde_json::from_slice(&json).context("Failed to parse audit batch")
}

pub struct AuditLedger {
    buffer: Mutex<VecDeque<AuditRecord>>,
    flush_lock: Mutex<()>,
    /// Threshold-triggered flush running off the decision path, if any
    background: std::sync::Mutex<Option<JoinHandle<()>>>,
    target: Arc<dyn CommitTarget>,
    config: LedgerConfig,
    metrics: PipelineMetrics,
}

impl AuditLedger {
    pub fn new(target: Arc<dyn CommitTarget>, config: LedgerConfig, metrics: PipelineMetrics) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            flush_lock: Mutex::new(()),
            background: std::sync::Mutex::new(None),
            target,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Appends a record and schedules a background flush once a full batch is buffered.
    ///
    /// Never waits on the commit target.
    pub async fn log(self: &Arc<Self>, record: AuditRecord) {
        let (len, dropped) = {
            let mut buffer = self.buffer.lock().await;
            buffer.push_back(record);
            let dropped = self.enforce_cap(&mut buffer);
            (buffer.len(), dropped)
        };
        self.report_drops(dropped).await;
        self.metrics.set_gauge(metrics::LEDGER_BUFFER_DEPTH, len as f64).await;

        if len >= self.config.batch_size {
            self.schedule_flush();
        }
    }

    /// Spawns a flush unless one is already pending.
    fn schedule_flush(self: &Arc<Self>) {
        let Ok(mut slot) = self.background.lock() else {
            warn!("Audit flush scheduler poisoned, deferring to next flush");
            return;
        };
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let ledger = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            if let Err(e) = ledger.flush().await {
                warn!("Audit flush deferred: {:#}", e);
            }
        }));
    }

    /// Waits for a scheduled background flush, if any, to finish.
    pub async fn wait_background(&self) {
        let handle = match self.background.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Background audit flush panicked: {}", e);
            }
        }
    }

    /// Submits everything currently buffered as one batch.
    ///
    /// Returns `Ok(None)` when there was nothing to submit. Each submission
    /// attempt is bounded by `submit_timeout_ms`. On failure the batch is
    /// re-queued ahead of any records logged in the meantime.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<Option<CommitReceipt>> {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<AuditRecord> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(None);
        }

        let result = match encode_batch(&batch) {
            Ok(payload) => {
                debug!("Submitting {} audit records ({} bytes)", batch.len(), payload.len());
                let strategy =
                    retry_strategy(self.config.retry_base_ms, self.config.submit_retry_attempts);
                Retry::spawn(strategy, || self.submit_once(&payload)).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(receipt) => {
                info!("Committed {} audit records as {}", batch.len(), receipt.reference);
                self.metrics.increment_counter(metrics::LEDGER_FLUSHES_OK).await;
                let depth = self.buffered_len().await;
                self.metrics.set_gauge(metrics::LEDGER_BUFFER_DEPTH, depth as f64).await;
                Ok(Some(receipt))
            }
            Err(e) => {
                let count = batch.len();
                let (depth, dropped) = {
                    let mut buffer = self.buffer.lock().await;
                    for record in batch.into_iter().rev() {
                        buffer.push_front(record);
                    }
                    let dropped = self.enforce_cap(&mut buffer);
                    (buffer.len(), dropped)
                };
                self.report_drops(dropped).await;

                error!(
                    "Audit commit failed, re-queued {} records ({} buffered): {:#}",
                    count, depth, e
                );
                self.metrics.increment_counter(metrics::LEDGER_FLUSHES_FAILED).await;
                self.metrics.set_gauge(metrics::LEDGER_BUFFER_DEPTH, depth as f64).await;
                Err(e.context(format!("failed to commit {} audit records", count)))
            }
        }
    }

    async fn submit_once(&self, payload: &[u8]) -> Result<CommitReceipt> {
        let limit = Duration::from_millis(self.config.submit_timeout_ms);
        match tokio::time::timeout(limit, self.target.submit(payload.to_vec())).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("commit target timed out after {:?}", limit)),
        }
    }

    /// Waits for any background flush, then flushes whatever is left.
    pub async fn shutdown(&self) -> Result<()> {
        self.wait_background().await;
        self.flush().await.map(|_| ())
    }

    pub async fn buffered_len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Copy of the buffered records in submission order.
    pub async fn buffered(&self) -> Vec<AuditRecord> {
        self.buffer.lock().await.iter().cloned().collect()
    }

    fn enforce_cap(&self, buffer: &mut VecDeque<AuditRecord>) -> usize {
        let cap = self.config.max_buffered_records.max(self.config.batch_size);
        let mut dropped = 0;
        while buffer.len() > cap {
            buffer.pop_front();
            dropped += 1;
        }
        dropped
    }

    async fn report_drops(&self, dropped: usize) {
        if dropped > 0 {
            error!("Audit buffer full, dropped {} oldest records", dropped);
            self.metrics
                .add_to_counter(metrics::LEDGER_RECORDS_DROPPED, dropped as u64)
                .await;
        }
    }
}

/// Commit target that only logs batches, referencing them by content hash.
#[derive(Debug, Default)]
pub struct TracingCommitTarget;

#[async_trait]
impl CommitTarget for TracingCommitTarget {
    async fn submit(&self, payload: Vec<u8>) -> Result<CommitReceipt> {
        let records = decode_batch(&payload)?.len();
        let reference = format!("0x{}", hex::encode(Sha256::digest(&payload)));
        info!("Audit batch {} ({} records, {} bytes)", reference, records, payload.len());
        Ok(CommitReceipt {
            reference,
            records,
            bytes: payload.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::types::Action;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn record(i: u64) -> AuditRecord {
        AuditRecord {
            timestamp: i,
            symbol: "BTCUSDT".to_string(),
            action: Action::Hold,
            confidence: 0.5,
            rationale: format!("cycle {}", i),
            verdict_summary: "APPROVED".to_string(),
            proof_digest: "0xabc".to_string(),
        }
    }

    #[derive(Default)]
    struct Switchable {
        failing: AtomicBool,
        submissions: AtomicUsize,
    }

    #[async_trait]
    impl CommitTarget for Switchable {
        async fn submit(&self, payload: Vec<u8>) -> Result<CommitReceipt> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("target offline");
            }
            Ok(CommitReceipt {
                reference: "ok".to_string(),
                records: decode_batch(&payload)?.len(),
                bytes: payload.len(),
            })
        }
    }

    fn create_test_config(batch_size: usize, cap: usize) -> LedgerConfig {
        LedgerConfig {
            batch_size,
            max_buffered_records: cap,
            submit_retry_attempts: 1,
            submit_timeout_ms: 1_000,
            retry_base_ms: 1,
        }
    }

    #[derive(Default)]
    struct Hanging {
        submissions: AtomicUsize,
    }

    #[async_trait]
    impl CommitTarget for Hanging {
        async fn submit(&self, _payload: Vec<u8>) -> Result<CommitReceipt> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            anyhow::bail!("unreachable")
        }
    }

    #[test]
    fn test_encode_decode_batch() {
        let records = vec![record(1), record(2)];
        let payload = encode_batch(&records).unwrap();
        assert_eq!(&payload[..2], &[0x1f, 0x8b]); // gzip magic
        assert_eq!(decode_batch(&payload).unwrap(), records);
    }

    #[tokio::test]
    async fn test_flush_on_full_batch() {
        let target = Arc::new(Switchable::default());
        let ledger = Arc::new(AuditLedger::new(target.clone(), create_test_config(3, 100), PipelineMetrics::new()));

        ledger.log(record(1)).await;
        ledger.log(record(2)).await;
        assert_eq!(target.submissions.load(Ordering::SeqCst), 0);

        ledger.log(record(3)).await;
        ledger.wait_background().await;
        assert_eq!(target.submissions.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.buffered_len().await, 0);
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let target = Arc::new(Switchable::default());
        let ledger = Arc::new(AuditLedger::new(target.clone(), create_test_config(3, 100), PipelineMetrics::new()));
        assert!(ledger.flush().await.unwrap().is_none());
        assert_eq!(target.submissions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_batch_is_requeued_in_order() {
        let target = Arc::new(Switchable::default());
        target.failing.store(true, Ordering::SeqCst);
        let metrics = PipelineMetrics::new();
        let ledger = Arc::new(AuditLedger::new(target.clone(), create_test_config(2, 100), metrics.clone()));

        ledger.log(record(1)).await;
        ledger.log(record(2)).await;
        ledger.wait_background().await;
        let timestamps: Vec<u64> = ledger.buffered().await.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2]);
        assert_eq!(metrics.counter(metrics::LEDGER_FLUSHES_FAILED).await, 1);

        target.failing.store(false, Ordering::SeqCst);
        let receipt = ledger.flush().await.unwrap().unwrap();
        assert_eq!(receipt.records, 2);
        assert_eq!(ledger.buffered_len().await, 0);
    }

    #[tokio::test]
    async fn test_retry_attempts_are_bounded() {
        let target = Arc::new(Switchable::default());
        target.failing.store(true, Ordering::SeqCst);
        let mut config = create_test_config(10, 100);
        config.submit_retry_attempts = 3;
        let ledger = Arc::new(AuditLedger::new(target.clone(), config, PipelineMetrics::new()));

        ledger.log(record(1)).await;
        assert!(ledger.flush().await.is_err());
        assert_eq!(target.submissions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_outage_drops_oldest_beyond_cap() {
        let target = Arc::new(Switchable::default());
        target.failing.store(true, Ordering::SeqCst);
        let metrics = PipelineMetrics::new();
        let ledger = Arc::new(AuditLedger::new(target, create_test_config(2, 4), metrics.clone()));

        for i in 1..=6 {
            ledger.log(record(i)).await;
            ledger.wait_background().await;
        }

        let timestamps: Vec<u64> = ledger.buffered().await.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![3, 4, 5, 6]);
        assert_eq!(metrics.counter(metrics::LEDGER_RECORDS_DROPPED).await, 2);
    }

    #[tokio::test]
    async fn test_hung_target_does_not_block_logging() {
        let target = Arc::new(Hanging::default());
        let mut config = create_test_config(1, 100);
        config.submit_timeout_ms = 20;
        let metrics = PipelineMetrics::new();
        let ledger = Arc::new(AuditLedger::new(target.clone(), config, metrics.clone()));

        let logged = tokio::time::timeout(Duration::from_secs(1), async {
            for i in 1..=3 {
                ledger.log(record(i)).await;
            }
        })
        .await;
        assert!(logged.is_ok());

        // The background attempt gives up after the submit timeout
        tokio::time::timeout(Duration::from_secs(1), ledger.wait_background())
            .await
            .unwrap();
        assert!(target.submissions.load(Ordering::SeqCst) >= 1);
        assert!(metrics.counter(metrics::LEDGER_FLUSHES_FAILED).await >= 1);
        let timestamps: Vec<u64> = ledger.buffered().await.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_tracing_target_receipt() {
        let payload = encode_batch(&[record(1)]).unwrap();
        let receipt = TracingCommitTarget.submit(payload.clone()).await.unwrap();
        assert_eq!(receipt.records, 1);
        assert_eq!(receipt.bytes, payload.len());
        assert!(receipt.reference.starts_with("0x"));
    }
}
