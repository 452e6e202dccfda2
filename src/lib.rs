//! Titan Council - a gated multi-source trading decision pipeline.
//!
//! Collects opinions from several inference sources in parallel, reduces them
//! to one decision, vetoes it through deterministic guardrails, biases it with
//! a similarity memory of past outcomes, and records every cycle in a
//! tamper-evident audit ledger.

pub mod types;
pub mod oracle;

// Re-export main types for convenience
pub use types::{MarketSnapshot, TrendLabel};
pub use oracle::{CycleOutcome, DecisionPipeline, PipelineBuilder, PipelineConfig};
