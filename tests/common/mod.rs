//! Shared fakes for integration tests.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use titan_council::oracle::audit_ledger::decode_batch;
use titan_council::oracle::{
    Action, Arbiter, ArbiterInput, ArbiterRuling, AuditRecord, CommitReceipt, CommitTarget,
    DurableStore, InferenceProvider, LedgerConfig, ProviderContext, RawSignal,
};
use titan_council::types::{MarketSnapshot, INDICATOR_OFI, INDICATOR_RSI, INDICATOR_TREND};

/// Provider returning a fixed signal after an optional delay.
pub struct ScriptedProvider {
    pub id: String,
    pub action: Action,
    pub confidence: f64,
    pub delay: Duration,
}

impl ScriptedProvider {
    pub fn new(id: &str, action: Action, confidence: f64) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            action,
            confidence,
            delay: Duration::ZERO,
        })
    }

    pub fn slow(id: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            action: Action::Buy,
            confidence: 0.9,
            delay,
        })
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn propose(&self, _ctx: &ProviderContext) -> Result<RawSignal> {
        tokio::time::sleep(self.delay).await;
        Ok(RawSignal {
            action: self.action,
            confidence: self.confidence,
            rationale: format!("scripted {}", self.action),
        })
    }
}

/// Provider that always errors.
pub struct FailingProvider {
    pub id: String,
}

impl FailingProvider {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self { id: id.to_string() })
    }
}

#[async_trait]
impl InferenceProvider for FailingProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn propose(&self, _ctx: &ProviderContext) -> Result<RawSignal> {
        anyhow::bail!("503 service unavailable")
    }
}

/// Arbiter that always returns the same ruling and counts calls.
pub struct ScriptedArbiter {
    pub action: Action,
    pub confidence: f64,
    pub calls: AtomicUsize,
}

impl ScriptedArbiter {
    pub fn new(action: Action, confidence: f64) -> Arc<Self> {
        Arc::new(Self {
            action,
            confidence,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Arbiter for ScriptedArbiter {
    async fn decide(&self, input: &ArbiterInput) -> Result<ArbiterRuling> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ArbiterRuling {
            action: self.action,
            confidence: self.confidence,
            consensus_score: 100.0 / input.proposals.len() as f64,
            rationale: "scripted ruling".to_string(),
        })
    }
}

pub struct FailingArbiter;

#[async_trait]
impl Arbiter for FailingArbiter {
    async fn decide(&self, _input: &ArbiterInput) -> Result<ArbiterRuling> {
        anyhow::bail!("arbiter quota exhausted")
    }
}

/// Commit target that records payloads and can be switched offline.
#[derive(Default)]
pub struct RecordingTarget {
    pub offline: AtomicBool,
    pub attempts: AtomicUsize,
    pub payloads: Mutex<Vec<Vec<u8>>>,
}

impl RecordingTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn committed_batches(&self) -> Vec<Vec<AuditRecord>> {
        self.payloads
            .lock()
            .unwrap()
            .iter()
            .map(|p| decode_batch(p).unwrap())
            .collect()
    }
}

#[async_trait]
impl CommitTarget for RecordingTarget {
    async fn submit(&self, payload: Vec<u8>) -> Result<CommitReceipt> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("commit target unreachable");
        }
        let records = decode_batch(&payload)?.len();
        let bytes = payload.len();
        let mut payloads = self.payloads.lock().unwrap();
        payloads.push(payload);
        Ok(CommitReceipt {
            reference: format!("batch-{}", payloads.len()),
            records,
            bytes,
        })
    }
}

/// Commit target that never answers.
#[derive(Default)]
pub struct HangingTarget {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl CommitTarget for HangingTarget {
    async fn submit(&self, _payload: Vec<u8>) -> Result<CommitReceipt> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        anyhow::bail!("commit target never answered")
    }
}

/// Durable store whose writes always fail; reads fail too when `fail_reads` is set.
pub struct FailingStore {
    pub fail_reads: bool,
    pub writes: AtomicUsize,
}

impl FailingStore {
    pub fn new(fail_reads: bool) -> Arc<Self> {
        Arc::new(Self {
            fail_reads,
            writes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl DurableStore for FailingStore {
    async fn read_all(&self) -> Result<Option<Vec<u8>>> {
        if self.fail_reads {
            anyhow::bail!("disk unavailable");
        }
        Ok(None)
    }

    async fn write_all(&self, _bytes: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("disk full")
    }
}

pub fn fast_ledger_config(batch_size: usize) -> LedgerConfig {
    LedgerConfig {
        batch_size,
        max_buffered_records: 10_000,
        submit_retry_attempts: 1,
        submit_timeout_ms: 1_000,
        retry_base_ms: 1,
    }
}

pub fn snapshot(symbol: &str, price: f64, rsi: f64, trend: f64) -> MarketSnapshot {
    MarketSnapshot::new(symbol, price, 1_700_000_000_000)
        .with_indicator(INDICATOR_RSI, rsi)
        .with_indicator(INDICATOR_TREND, trend)
        .with_indicator(INDICATOR_OFI, 0.0)
}

pub fn audit_record(i: u64) -> AuditRecord {
    AuditRecord {
        timestamp: i,
        symbol: "ETHUSDT".to_string(),
        action: Action::Hold,
        confidence: 0.5,
        rationale: format!("record {}", i),
        verdict_summary: "APPROVED".to_string(),
        proof_digest: format!("0x{:064x}", i),
    }
}
