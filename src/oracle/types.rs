//! Domain types for the decision pipeline.
//!
//! Proposals, decisions, guardrail verdicts, memory fragments and audit records,
//! plus the configuration structs consumed by [`crate::oracle::PipelineBuilder`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Trade action. Serialized as "BUY" / "SELL" / "HOLD".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::Hold => "HOLD",
        }
    }

    /// Case-insensitive parse used for provider responses.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(Action::Buy),
            "SELL" => Some(Action::Sell),
            "HOLD" => Some(Action::Hold),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inference source's opinion on a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Identifier of the provider that produced this proposal
    pub source_id: String,
    pub action: Action,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub rationale: String,
}

/// Aggregated outcome of a decision cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Agreement among sources, in [0, 100]
    pub consensus_score: f64,
    pub rationale: String,
    /// Source ids that contributed a proposal
    pub sources: Vec<String>,
    /// "0x"-prefixed SHA-256 over the canonical decision inputs and output
    /// Digest of the decision this record summarizes
    pub proof_digest: String,
    /// Unix timestamp in milliseconds (taken from the snapshot)
    pub timestamp: u64,
}

/// Guardrail rule severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Vetoes the decision and stops evaluation
    Block,
    /// Recorded but does not veto
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: String,
    pub severity: Severity,
    pub description: String,
}

/// Result of running the guardrail rule set against a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    /// False when any BLOCK violation fired
    pub approved: bool,
    /// Violations in rule evaluation order
    pub violations: Vec<Violation>,
}

impl GuardrailVerdict {
    /// Compact human-readable summary used in audit records.
    pub fn summary(&self) -> String {
        let status = if self.approved { "APPROVED" } else { "BLOCKED" };
        if self.violations.is_empty() {
            return status.to_string();
        }
        let ids: Vec<&str> = self.violations.iter().map(|v| v.rule_id.as_str()).collect();
        format!("{} [{}]", status, ids.join(", "))
    }

    /// Whether `rule_id` produced a violation.
    pub fn has_violation(&self, rule_id: &str) -> bool {
        self.violations.iter().any(|v| v.rule_id == rule_id)
    }
}

/// Realized result of a remembered decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Win,
    Loss,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentMetadata {
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    pub symbol: String,
    pub action: Action,
    pub outcome: Outcome,
    /// Realized profit or loss, zero while pending
    pub pnl: f64,
    /// Free-form market context (regime, notes)
    pub context: String,
}

/// One remembered decision with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFragment {
    pub id: String,
    /// Fixed-dimension feature vector of the snapshot
    pub embedding: Vec<f64>,
    pub metadata: FragmentMetadata,
}

/// Directional advice derived from similar past scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Advice {
    Positive,
    Negative,
    Uncertain,
    /// Similar trades exist but none has resolved yet
    AwaitingOutcomes,
    /// Nothing similar has been seen
    NoHistory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioAnalysis {
    /// Fraction of resolved neighbours that won
    pub win_rate: f64,
    /// min(1, resolved / 10)
    pub confidence: f64,
    /// Number of neighbours considered, pending ones included
    pub similar_count: usize,
    /// Neighbours with a WIN or LOSS outcome
    pub resolved_count: usize,
    pub advice: Advice,
}

impl ScenarioAnalysis {
    /// Neutral analysis for a store with no neighbours.
    pub fn no_history() -> Self {
        Self {
            win_rate: 0.5,
            confidence: 0.0,
            similar_count: 0,
            resolved_count: 0,
            advice: Advice::NoHistory,
        }
    }

    /// Neutral analysis when `similar_count` neighbours exist but all are pending.
    pub fn awaiting_outcomes(similar_count: usize) -> Self {
        Self {
            similar_count,
            advice: Advice::AwaitingOutcomes,
            ..Self::no_history()
        }
    }
}

/// What memory says about the current snapshot, handed to the arbiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallSummary {
    pub analysis: ScenarioAnalysis,
    /// Short lessons from the nearest resolved fragments, e.g. "BUY LOSS pnl=-12.00"
    pub lessons: Vec<String>,
}

impl RecallSummary {
    /// Summary for a cycle with no memory to draw on.
    pub fn empty() -> Self {
        Self {
            analysis: ScenarioAnalysis::no_history(),
            lessons: Vec::new(),
        }
    }
}

/// Immutable per-cycle record handed to the audit ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    pub symbol: String,
    pub action: Action,
    pub confidence: f64,
    pub rationale: String,
    /// "APPROVED" or "BLOCKED [rule ids]"
    pub verdict_summary: String,
    pub proof_digest: String,
}

impl AuditRecord {
    /// Audit record for one completed cycle.
    pub fn from_cycle(symbol: &str, decision: &Decision, verdict: &GuardrailVerdict) -> Self {
        Self {
            timestamp: decision.timestamp,
            symbol: symbol.to_string(),
            action: decision.action,
            confidence: decision.confidence,
            rationale: decision.rationale.clone(),
            verdict_summary: verdict.summary(),
            proof_digest: decision.proof_digest.clone(),
        }
    }
}

/// Thresholds for the baseline guardrail rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailThresholds {
    /// BUY in a bearish trend is blocked above this RSI
    pub bearish_buy_max_rsi: f64,
    /// Maximum notional as a fraction of available capital
    pub max_exposure_fraction: f64,
    /// Non-HOLD decisions below this confidence raise a warning
    pub min_confidence: f64,
}

impl Default for GuardrailThresholds {
    fn default() -> Self {
        Self {
            bearish_buy_max_rsi: 30.0,
            max_exposure_fraction: 0.10,
            min_confidence: 0.60,
        }
    }
}

/// Audit ledger batching and delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Records per committed batch
    pub batch_size: usize,
    /// Buffer cap during a target outage; oldest records are dropped beyond it
    pub max_buffered_records: usize,
    /// Submission attempts per flush (including the first)
    pub submit_retry_attempts: usize,
    /// Upper bound on a single submission attempt
    pub submit_timeout_ms: u64,
    /// Base delay for exponential backoff between attempts
    pub retry_base_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_buffered_records: 10_000,
            submit_retry_attempts: 3,
            submit_timeout_ms: 10_000,
            retry_base_ms: 100,
        }
    }
}

/// Configuration for the whole decision pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Per-call timeout for inference providers
    pub provider_timeout_ms: u64,
    /// Timeout for the single arbiter call
    pub arbiter_timeout_ms: u64,
    /// Source whose vote carries the primary weight
    pub primary_source: String,
    /// Vote weight of the primary source
    pub primary_weight: f64,
    /// Vote weight of the local deterministic proposer
    pub local_weight: f64,
    /// Vote weight of every other source
    pub default_weight: f64,
    /// Per-source weight overrides
    pub source_weights: BTreeMap<String, f64>,
    /// Neighbours recalled per cycle
    pub recall_k: usize,
    /// Embedding dimension of the memory store
    pub embedding_dimension: usize,
    /// Requests per second allowed per provider
    pub provider_rate_limit_per_second: u32,
    /// Consecutive failures before a provider is degraded
    pub circuit_breaker_failure_threshold: u32,
    /// Cooldown before a tripped provider is retried
    pub circuit_breaker_cooldown_seconds: u64,
    /// Attempts considered for the provider success rate
    pub circuit_breaker_sample_size: usize,
    /// Capital available for sizing and exposure checks
    pub available_capital: f64,
    /// Target notional per order
    pub order_notional: f64,
    /// Remember approved non-HOLD decisions as pending fragments
    pub remember_approved: bool,
    /// Baseline guardrail thresholds
    pub guardrails: GuardrailThresholds,
    /// Audit ledger batching and delivery
    pub ledger: LedgerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            provider_timeout_ms: 8_000,
            arbiter_timeout_ms: 15_000,
            primary_source: "primary".to_string(),
            primary_weight: 2.0,
            local_weight: 2.0,
            default_weight: 1.0,
            source_weights: BTreeMap::new(),
            recall_k: 5,
            embedding_dimension: crate::oracle::features::DEFAULT_DIMENSION,
            provider_rate_limit_per_second: 5,
            circuit_breaker_failure_threshold: 3,
            circuit_breaker_cooldown_seconds: 60,
            circuit_breaker_sample_size: 20,
            available_capital: 10_000.0,
            order_notional: 500.0,
            remember_approved: true,
            guardrails: GuardrailThresholds::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Vote weight for a source id.
    pub fn weight_for(&self, source_id: &str) -> f64 {
        if let Some(weight) = self.source_weights.get(source_id) {
            return *weight;
        }
        if source_id == self.primary_source {
            self.primary_weight
        } else if source_id == crate::oracle::providers::LOCAL_SOURCE_ID {
            self.local_weight
        } else {
            self.default_weight
        }
    }
}
