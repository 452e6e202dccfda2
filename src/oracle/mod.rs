//! Oracle module - the Titan Council decision pipeline.
//!
//! Snapshot → [`ProposalFanout`] → [`ConsensusAggregator`] (consulting
//! [`MemoryStore`]) → [`GuardrailEngine`] → verdict, with every cycle recorded
//! in the [`AuditLedger`]. Use [`PipelineBuilder`] to wire the pieces together.

pub mod types;
pub mod features;
pub mod providers;
pub mod circuit_breaker;
pub mod rate_limit;
pub mod metrics;
pub mod fanout;
pub mod consensus;
pub mod guardrails;
pub mod storage;
pub mod sqlite_store;
pub mod memory;
pub mod audit_ledger;
pub mod pipeline;

pub use types::{
    Action, Advice, AuditRecord, Decision, FragmentMetadata, GuardrailThresholds,
    GuardrailVerdict, LedgerConfig, MemoryFragment, Outcome, PipelineConfig, Proposal,
    RecallSummary, ScenarioAnalysis, Severity, Violation,
};

pub use audit_ledger::{AuditLedger, CommitReceipt, CommitTarget, TracingCommitTarget};
pub use circuit_breaker::{CircuitBreaker, ProviderState};
pub use consensus::{ConsensusAggregator, WeightedVoteArbiter};
pub use fanout::{FanoutOutcome, ProposalFanout};
pub use features::SnapshotEmbedder;
pub use guardrails::{GuardrailContext, GuardrailEngine, Rule};
pub use memory::{MemoryStore, Recollection};
pub use metrics::PipelineMetrics;
pub use pipeline::{CycleOutcome, DecisionPipeline};
pub use providers::{
    Arbiter, ArbiterInput, ArbiterRuling, ChatCompletionConfig, ChatCompletionProvider,
    InferenceProvider, LocalProposer, ProviderContext, ProviderError, RawSignal,
};
pub use rate_limit::ProviderThrottle;
pub use sqlite_store::SqliteSnapshotStore;
pub use storage::{DurableStore, FileSnapshotStore, InMemorySnapshotStore};

use anyhow::{anyhow, bail};
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Exponential backoff starting at `base_ms`, doubling, capped at 5 s.
///
/// Yields `attempts - 1` delays, i.e. `attempts` total tries including the first.
pub(crate) fn retry_strategy(base_ms: u64, attempts: usize) -> impl Iterator<Item = Duration> {
    std::iter::once(Duration::from_millis(base_ms))
        .chain(
            ExponentialBackoff::from_millis(2)
                .factor(base_ms.max(1))
                .max_delay(MAX_RETRY_DELAY),
        )
        .map(|delay| delay.min(MAX_RETRY_DELAY))
        .take(attempts.saturating_sub(1))
}

/// Pipeline builder for convenient construction with sensible defaults.
pub struct PipelineBuilder {
    config: PipelineConfig,
    providers: Vec<Arc<dyn InferenceProvider>>,
    arbiter: Option<Arc<dyn Arbiter>>,
    durable: Option<Arc<dyn DurableStore>>,
    memory: Option<Arc<MemoryStore>>,
    commit_target: Option<Arc<dyn CommitTarget>>,
    extra_rules: Vec<Rule>,
    metrics: Option<PipelineMetrics>,
}

impl PipelineBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            providers: Vec::new(),
            arbiter: None,
            durable: None,
            memory: None,
            commit_target: None,
            extra_rules: Vec::new(),
            metrics: None,
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an inference provider.
    pub fn with_provider(mut self, provider: Arc<dyn InferenceProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Use a custom arbiter instead of the weighted vote.
    pub fn with_arbiter(mut self, arbiter: Arc<dyn Arbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    /// Durable store the memory snapshot is loaded from and written to.
    pub fn with_durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Share an already opened memory store.
    pub fn with_memory_store(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Destination for audit batches (required).
    pub fn with_commit_target(mut self, target: Arc<dyn CommitTarget>) -> Self {
        self.commit_target = Some(target);
        self
    }

    /// Append a guardrail rule after the baseline rules.
    pub fn with_guardrail_rule(mut self, rule: Rule) -> Self {
        self.extra_rules.push(rule);
        self
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set provider and arbiter timeouts.
    pub fn with_timeouts(mut self, provider: Duration, arbiter: Duration) -> Self {
        self.config.provider_timeout_ms = provider.as_millis() as u64;
        self.config.arbiter_timeout_ms = arbiter.as_millis() as u64;
        self
    }

    /// Set the primary source and its weight.
    pub fn with_primary_source(mut self, source_id: impl Into<String>, weight: f64) -> Self {
        self.config.primary_source = source_id.into();
        self.config.primary_weight = weight;
        self
    }

    /// Override the weight of one source.
    pub fn with_source_weight(mut self, source_id: impl Into<String>, weight: f64) -> Self {
        self.config.source_weights.insert(source_id.into(), weight);
        self
    }

    pub fn with_recall_k(mut self, k: usize) -> Self {
        self.config.recall_k = k;
        self
    }

    /// Set per-provider rate limiting.
    pub fn with_rate_limit(mut self, requests_per_second: u32) -> Self {
        self.config.provider_rate_limit_per_second = requests_per_second;
        self
    }

    /// Set circuit breaker configuration.
    pub fn with_circuit_breaker(mut self, failure_threshold: u32, cooldown_seconds: u64) -> Self {
        self.config.circuit_breaker_failure_threshold = failure_threshold;
        self.config.circuit_breaker_cooldown_seconds = cooldown_seconds;
        self
    }

    pub fn with_guardrail_thresholds(mut self, thresholds: GuardrailThresholds) -> Self {
        self.config.guardrails = thresholds;
        self
    }

    pub fn with_ledger_config(mut self, ledger: LedgerConfig) -> Self {
        self.config.ledger = ledger;
        self
    }

    /// Set capital and per-order notional used for sizing.
    pub fn with_sizing(mut self, available_capital: f64, order_notional: f64) -> Self {
        self.config.available_capital = available_capital;
        self.config.order_notional = order_notional;
        self
    }

    pub fn with_remember_approved(mut self, enabled: bool) -> Self {
        self.config.remember_approved = enabled;
        self
    }

    /// Build the pipeline configuration.
    pub fn build_config(self) -> PipelineConfig {
        self.config
    }

    /// Build the pipeline, opening the memory store if none was supplied.
    pub async fn build(self) -> anyhow::Result<DecisionPipeline> {
        let config = self.config;
        let metrics = self.metrics.unwrap_or_default();
        let target = self
            .commit_target
            .ok_or_else(|| anyhow!("a commit target is required"))?;

        let memory = match self.memory {
            Some(memory) => {
                if memory.dimension() != config.embedding_dimension {
                    bail!(
                        "memory store dimension {} does not match configured {}",
                        memory.dimension(),
                        config.embedding_dimension
                    );
                }
                memory
            }
            None => {
                let durable = self
                    .durable
                    .unwrap_or_else(|| Arc::new(InMemorySnapshotStore::new()));
                Arc::new(MemoryStore::open(config.embedding_dimension, durable).await)
            }
        };

        let fanout = ProposalFanout::new(
            self.providers,
            Duration::from_millis(config.provider_timeout_ms),
            CircuitBreaker::new(
                config.circuit_breaker_failure_threshold,
                config.circuit_breaker_cooldown_seconds,
                config.circuit_breaker_sample_size,
            ),
            ProviderThrottle::new(config.provider_rate_limit_per_second),
            metrics.clone(),
        );

        let arbiter = self
            .arbiter
            .unwrap_or_else(|| Arc::new(WeightedVoteArbiter::new()));
        let aggregator = ConsensusAggregator::new(arbiter, config.clone(), metrics.clone());

        let mut guardrails = GuardrailEngine::new(&config.guardrails, config.available_capital);
        for rule in self.extra_rules {
            guardrails.register(rule);
        }

        let ledger = Arc::new(AuditLedger::new(target, config.ledger.clone(), metrics.clone()));

        Ok(DecisionPipeline::new(
            config, fanout, aggregator, guardrails, memory, ledger, metrics,
        ))
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
