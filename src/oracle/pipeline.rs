//! Decision pipeline orchestrator.
//!
//! Runs one decision cycle per snapshot: fanout, memory recall, aggregation,
//! guardrails, audit logging and (optionally) remembering approved trades.
//! Cycles for the same symbol are serialized; different symbols run in parallel.

use crate::oracle::audit_ledger::AuditLedger;
use crate::oracle::consensus::ConsensusAggregator;
use crate::oracle::fanout::ProposalFanout;
use crate::oracle::features::SnapshotEmbedder;
use crate::oracle::guardrails::{GuardrailContext, GuardrailEngine};
use crate::oracle::memory::MemoryStore;
use crate::oracle::metrics::{self, PipelineMetrics};
use crate::oracle::types::{
    Action, AuditRecord, Decision, FragmentMetadata, GuardrailVerdict, Outcome, PipelineConfig,
    Severity,
};
use crate::types::MarketSnapshot;
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Result of one decision cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub decision: Decision,
    pub verdict: GuardrailVerdict,
    /// Id of the pending memory fragment, if the decision was remembered
    pub memory_id: Option<String>,
}

impl CycleOutcome {
    /// Whether an execution collaborator may act on the decision.
    pub fn is_actionable(&self) -> bool {
        self.verdict.approved && self.decision.action != Action::Hold
    }
}

pub struct DecisionPipeline {
    config: PipelineConfig,
    fanout: ProposalFanout,
    aggregator: ConsensusAggregator,
    guardrails: GuardrailEngine,
    embedder: SnapshotEmbedder,
    memory: Arc<MemoryStore>,
    ledger: Arc<AuditLedger>,
    metrics: PipelineMetrics,
    cycle_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DecisionPipeline {
    pub fn new(
        config: PipelineConfig,
        fanout: ProposalFanout,
        aggregator: ConsensusAggregator,
        guardrails: GuardrailEngine,
        memory: Arc<MemoryStore>,
        ledger: Arc<AuditLedger>,
        metrics: PipelineMetrics,
    ) -> Self {
        info!(
            "Decision pipeline ready: providers {:?}, guardrails {:?}",
            fanout.provider_ids(),
            guardrails.rule_ids()
        );
        Self {
            embedder: SnapshotEmbedder::new(memory.dimension()),
            config,
            fanout,
            aggregator,
            guardrails,
            memory,
            ledger,
            metrics,
            cycle_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn memory(&self) -> Arc<MemoryStore> {
        self.memory.clone()
    }

    pub fn ledger(&self) -> Arc<AuditLedger> {
        self.ledger.clone()
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics.clone()
    }

    /// Runs one full decision cycle for `snapshot`.
    ///
    /// Fails only for structurally invalid snapshots; provider, arbiter and
    /// persistence failures degrade the cycle instead.
    #[instrument(skip(self, snapshot), fields(symbol = %snapshot.symbol, ts = snapshot.timestamp))]
    pub async fn decide(&self, snapshot: &MarketSnapshot) -> Result<CycleOutcome> {
        validate_snapshot(snapshot)?;

        let cycle_lock = self.cycle_lock(&snapshot.symbol).await;
        let _cycle = cycle_lock.lock().await;
        let started = Instant::now();

        let proposals = self.fanout.submit(snapshot).await;

        let embedding = self.embedder.embed(snapshot);
        let recall = self.memory.recall_summary(&embedding, self.config.recall_k).await;
        debug!(
            "Memory: {:?} advice over {} similar",
            recall.analysis.advice, recall.analysis.similar_count
        );

        let decision = self.aggregator.aggregate(snapshot, &proposals, &recall).await;

        let ctx = GuardrailContext {
            action: decision.action,
            symbol: snapshot.symbol.clone(),
            price: snapshot.price,
            quantity: self.order_quantity(decision.action, snapshot.price),
            trend: snapshot.trend(),
            oscillator: snapshot.oscillator(),
            confidence: decision.confidence,
        };
        let verdict = self.guardrails.evaluate(&ctx);

        if !verdict.approved {
            self.metrics.increment_counter(metrics::VERDICTS_BLOCKED).await;
        } else if verdict.violations.iter().any(|v| v.severity == Severity::Warn) {
            self.metrics.increment_counter(metrics::VERDICTS_WARNED).await;
        }

        self.ledger
            .log(AuditRecord::from_cycle(&snapshot.symbol, &decision, &verdict))
            .await;

        let memory_id = if self.config.remember_approved
            && verdict.approved
            && decision.action != Action::Hold
        {
            self.remember(snapshot, &decision, embedding).await
        } else {
            None
        };

        self.metrics.record_cycle_time(started.elapsed()).await;
        info!(
            "Cycle {} {} -> {}",
            snapshot.symbol,
            decision.action,
            verdict.summary()
        );

        Ok(CycleOutcome {
            decision,
            verdict,
            memory_id,
        })
    }

    /// Records the realized result of a remembered decision.
    pub async fn settle(&self, memory_id: &str, outcome: Outcome, pnl: f64) -> bool {
        self.memory.update_outcome(memory_id, outcome, pnl).await
    }

    /// Flushes the audit ledger and writes the memory snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        let ledger = self.ledger.shutdown().await;
        let memory = self.memory.flush().await;
        info!("Decision pipeline shut down");
        ledger.and(memory)
    }

    fn order_quantity(&self, action: Action, price: f64) -> f64 {
        if action == Action::Hold || !price.is_finite() || price <= 0.0 {
            return 0.0;
        }
        self.config.order_notional / price
    }

    async fn remember(
        &self,
        snapshot: &MarketSnapshot,
        decision: &Decision,
        embedding: Vec<f64>,
    ) -> Option<String> {
        let metadata = FragmentMetadata {
            timestamp: snapshot.timestamp,
            symbol: snapshot.symbol.clone(),
            action: decision.action,
            outcome: Outcome::Pending,
            pnl: 0.0,
            context: format!(
                "trend={} rsi={:.1} consensus={:.0}",
                snapshot.trend(),
                snapshot.oscillator(),
                decision.consensus_score
            ),
        };

        match self.memory.remember(embedding, metadata).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Decision not remembered: {:#}", e);
                None
            }
        }
    }

    async fn cycle_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        let mut locks = self.cycle_locks.lock().await;
        locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn validate_snapshot(snapshot: &MarketSnapshot) -> Result<()> {
    if snapshot.symbol.trim().is_empty() {
        bail!("snapshot symbol is empty");
    }
    if let Some((name, value)) = snapshot.indicators.iter().find(|(_, v)| !v.is_finite()) {
        bail!("indicator {} is not finite ({})", name, value);
    }
    Ok(())
}
