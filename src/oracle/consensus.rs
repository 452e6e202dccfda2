//! Reduction of a proposal set to one decision.
//!
//! The aggregator makes exactly one arbiter call per cycle. Any arbiter
//! failure (error, timeout, non-finite output) yields a fail-closed HOLD.
//! Every decision carries a SHA-256 proof digest over its canonical inputs.

use crate::oracle::metrics::{self, PipelineMetrics};
use crate::oracle::providers::{Arbiter, ArbiterInput, ArbiterRuling, WeightedProposal};
use crate::oracle::types::{Action, Advice, Decision, PipelineConfig, Proposal, RecallSummary};
use crate::types::MarketSnapshot;
use anyhow::{Context, Result};
use async_trait::async_trait;
use nonempty::NonEmpty;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub const AGGREGATOR_UNAVAILABLE: &str = "aggregator unavailable";

/// Digest used when the canonical form cannot be produced.
pub const SENTINEL_DIGEST: &str =
    "0x0000000000000000000000000000000000000000000000000000000000000000";

/// Scenario confidence at which memory may override the vote.
const MEMORY_OVERRIDE_CONFIDENCE: f64 = 0.5;

pub struct ConsensusAggregator {
    arbiter: Arc<dyn Arbiter>,
    timeout: Duration,
    config: PipelineConfig,
    metrics: PipelineMetrics,
}

impl ConsensusAggregator {
    pub fn new(arbiter: Arc<dyn Arbiter>, config: PipelineConfig, metrics: PipelineMetrics) -> Self {
        Self {
            arbiter,
            timeout: Duration::from_millis(config.arbiter_timeout_ms),
            config,
            metrics,
        }
    }

    #[instrument(skip_all, fields(symbol = %snapshot.symbol, proposals = proposals.len()))]
    pub async fn aggregate(
        &self,
        snapshot: &MarketSnapshot,
        proposals: &NonEmpty<Proposal>,
        recall: &RecallSummary,
    ) -> Decision {
        let input = ArbiterInput {
            snapshot: snapshot.clone(),
            proposals: proposals
                .iter()
                .map(|p| WeightedProposal {
                    proposal: p.clone(),
                    weight: self.config.weight_for(&p.source_id),
                })
                .collect(),
            recall: recall.clone(),
        };

        let ruling = match tokio::time::timeout(self.timeout, self.arbiter.decide(&input)).await {
            Ok(Ok(ruling)) => validate(ruling),
            Ok(Err(e)) => {
                error!("Arbiter failed: {:#}", e);
                None
            }
            Err(_) => {
                error!("Arbiter timed out after {:?}", self.timeout);
                None
            }
        };

        let sources: Vec<String> = proposals.iter().map(|p| p.source_id.clone()).collect();
        self.metrics.increment_counter(metrics::DECISIONS_TOTAL).await;

        let decision = match ruling {
            Some(ruling) => Decision {
                action: ruling.action,
                confidence: ruling.confidence,
                consensus_score: ruling.consensus_score,
                rationale: ruling.rationale,
                proof_digest: proof_digest(snapshot, proposals, ruling.action),
                sources,
                timestamp: snapshot.timestamp,
            },
            None => {
                self.metrics.increment_counter(metrics::DECISIONS_FAIL_CLOSED).await;
                fail_closed(snapshot, proposals, sources)
            }
        };

        info!(
            "Decision {} (confidence {:.2}, consensus {:.0}%)",
            decision.action, decision.confidence, decision.consensus_score
        );
        decision
    }
}

/// Rejects non-finite numbers and clamps the rest into range.
fn validate(ruling: ArbiterRuling) -> Option<ArbiterRuling> {
    if !ruling.confidence.is_finite() || !ruling.consensus_score.is_finite() {
        warn!(
            "Arbiter returned non-finite values (confidence {}, score {})",
            ruling.confidence, ruling.consensus_score
        );
        return None;
    }
    Some(ArbiterRuling {
        confidence: ruling.confidence.clamp(0.0, 1.0),
        consensus_score: ruling.consensus_score.clamp(0.0, 100.0),
        ..ruling
    })
}

fn fail_closed(snapshot: &MarketSnapshot, proposals: &NonEmpty<Proposal>, sources: Vec<String>) -> Decision {
    Decision {
        action: Action::Hold,
        confidence: 0.0,
        consensus_score: 0.0,
        rationale: AGGREGATOR_UNAVAILABLE.to_string(),
        sources,
        proof_digest: proof_digest(snapshot, proposals, Action::Hold),
        timestamp: snapshot.timestamp,
    }
}

/// Canonical JSON over the decision inputs and output. Object keys are sorted.
pub fn canonical_payload(
    snapshot: &MarketSnapshot,
    proposals: &NonEmpty<Proposal>,
    action: Action,
) -> Result<Vec<u8>> {
    let mut votes: Vec<(&str, &str)> = proposals
        .iter()
        .map(|p| (p.source_id.as_str(), p.action.as_str()))
        .collect();
    votes.sort();

    // Keys written in sorted order
    let payload = json!({
        "action": action.as_str(),
        "proposals": votes,
        "snapshot": {
            "indicators": snapshot.indicators,
            "price": snapshot.price,
            "symbol": snapshot.symbol,
        },
        "timestamp": snapshot.timestamp,
    });

    serde_json::to_vec(&payload).context("Failed to canonicalize decision")
}

/// "0x"-prefixed hex SHA-256 of the canonical payload, or [`SENTINEL_DIGEST`].
pub fn proof_digest(snapshot: &MarketSnapshot, proposals: &NonEmpty<Proposal>, action: Action) -> String {
    match canonical_payload(snapshot, proposals, action) {
        Ok(bytes) => format!("0x{}", hex::encode(Sha256::digest(&bytes))),
        Err(e) => {
            error!("Falling back to sentinel digest: {:#}", e);
            SENTINEL_DIGEST.to_string()
        }
    }
}

/// Deterministic arbiter: weighted majority vote, biased by memory.
///
/// A strict weighted plurality of BUY or SELL wins; anything else is HOLD.
/// When similar history is clearly unfavourable the winner is downgraded to
/// HOLD, and clearly favourable history nudges confidence up.
#[derive(Debug, Clone, Default)]
pub struct WeightedVoteArbiter;

impl WeightedVoteArbiter {
    pub fn new() -> Self {
        Self
    }

    pub fn rule(&self, input: &ArbiterInput) -> ArbiterRuling {
        let mut weight: BTreeMap<Action, f64> = BTreeMap::new();
        let mut weighted_confidence: BTreeMap<Action, f64> = BTreeMap::new();
        let mut total = 0.0;

        for wp in &input.proposals {
            let w = if wp.weight.is_finite() { wp.weight.max(0.0) } else { 0.0 };
            *weight.entry(wp.proposal.action).or_insert(0.0) += w;
            *weighted_confidence.entry(wp.proposal.action).or_insert(0.0) += w * wp.proposal.confidence;
            total += w;
        }

        let w = |a: Action| weight.get(&a).copied().unwrap_or(0.0);
        let (buy, sell, hold) = (w(Action::Buy), w(Action::Sell), w(Action::Hold));

        let action = if buy > sell && buy > hold {
            Action::Buy
        } else if sell > buy && sell > hold {
            Action::Sell
        } else {
            Action::Hold
        };

        let winner_weight = w(action);
        let consensus_score = if total > 0.0 { winner_weight / total * 100.0 } else { 0.0 };
        let mut confidence = if winner_weight > 0.0 {
            weighted_confidence.get(&action).copied().unwrap_or(0.0) / winner_weight
        } else {
            0.0
        };

        let mut rationale = format!(
            "weighted vote BUY {:.1} / SELL {:.1} / HOLD {:.1} over {} sources",
            buy,
            sell,
            hold,
            input.proposals.len()
        );

        let analysis = &input.recall.analysis;
        let mut final_action = action;
        if analysis.confidence >= MEMORY_OVERRIDE_CONFIDENCE && action != Action::Hold {
            match analysis.advice {
                Advice::Negative => {
                    final_action = Action::Hold;
                    rationale.push_str(&format!(
                        "; memory veto: {:.0}% win rate over {} similar trades",
                        analysis.win_rate * 100.0,
                        analysis.resolved_count
                    ));
                }
                Advice::Positive => {
                    confidence = (confidence + 0.05).min(1.0);
                    rationale.push_str(&format!(
                        "; memory support: {:.0}% win rate",
                        analysis.win_rate * 100.0
                    ));
                }
                Advice::Uncertain | Advice::AwaitingOutcomes | Advice::NoHistory => {}
            }
        }

        debug!("Weighted vote: {} -> {}", action, final_action);
        ArbiterRuling {
            action: final_action,
            confidence,
            consensus_score,
            rationale,
        }
    }
}

#[async_trait]
impl Arbiter for WeightedVoteArbiter {
    async fn decide(&self, input: &ArbiterInput) -> Result<ArbiterRuling> {
        Ok(self.rule(input))
    }
}
