//! Deterministic guardrail rules applied to every aggregated decision.
//!
//! Rules run in registration order. A failing BLOCK rule vetoes the decision
//! and stops evaluation, a failing WARN rule is recorded and evaluation
//! continues. A rule that errors or panics is treated as a BLOCK.

use crate::oracle::types::{Action, GuardrailThresholds, GuardrailVerdict, Severity, Violation};
use crate::types::TrendLabel;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, warn};

pub const RISK_BEAR_MARKET_BUY: &str = "RISK_BEAR_MARKET_BUY";
pub const MAX_EXPOSURE_LIMIT: &str = "MAX_EXPOSURE_LIMIT";
pub const MIN_CONSENSUS_THRESHOLD: &str = "MIN_CONSENSUS_THRESHOLD";
pub const PRICE_SANITY_CHECK: &str = "PRICE_SANITY_CHECK";
pub const SYSTEM_ERROR: &str = "SYSTEM_ERROR";

/// Facts a rule can inspect.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailContext {
    pub action: Action,
    pub symbol: String,
    pub price: f64,
    /// Order quantity in base units (zero for HOLD)
    pub quantity: f64,
    pub trend: TrendLabel,
    /// RSI of the snapshot
    pub oscillator: f64,
    pub confidence: f64,
}

impl GuardrailContext {
    pub fn notional(&self) -> f64 {
        self.quantity * self.price
    }
}

/// Predicate returning `Ok(true)` when the context passes the rule.
pub type RulePredicate = Box<dyn Fn(&GuardrailContext) -> anyhow::Result<bool> + Send + Sync>;

pub struct Rule {
    pub id: String,
    pub description: String,
    pub severity: Severity,
    predicate: RulePredicate,
}

impl Rule {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        predicate: impl Fn(&GuardrailContext) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            severity,
            predicate: Box::new(predicate),
        }
    }

    fn violation(&self) -> Violation {
        Violation {
            rule_id: self.id.clone(),
            severity: self.severity,
            description: self.description.clone(),
        }
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("severity", &self.severity)
            .finish()
    }
}

/// Ordered rule set.
#[derive(Debug)]
pub struct GuardrailEngine {
    rules: Vec<Rule>,
}

impl GuardrailEngine {
    /// Engine with the four baseline rules.
    pub fn new(thresholds: &GuardrailThresholds, available_capital: f64) -> Self {
        let mut engine = Self::empty();

        let max_rsi = thresholds.bearish_buy_max_rsi;
        engine.register(Rule::new(
            RISK_BEAR_MARKET_BUY,
            format!("No BUY in a bearish trend unless RSI <= {}", max_rsi),
            Severity::Block,
            move |ctx| {
                Ok(!(ctx.action == Action::Buy
                    && ctx.trend == TrendLabel::Bearish
                    && ctx.oscillator > max_rsi))
            },
        ));

        let max_notional = thresholds.max_exposure_fraction * available_capital;
        engine.register(Rule::new(
            MAX_EXPOSURE_LIMIT,
            format!(
                "Position notional may not exceed {:.0}% of available capital",
                thresholds.max_exposure_fraction * 100.0
            ),
            Severity::Block,
            move |ctx| Ok(!(ctx.notional() > max_notional)),
        ));

        let min_confidence = thresholds.min_confidence;
        engine.register(Rule::new(
            MIN_CONSENSUS_THRESHOLD,
            format!("Confidence below {:.2} needs secondary confirmation", min_confidence),
            Severity::Warn,
            move |ctx| Ok(!(ctx.confidence < min_confidence && ctx.action != Action::Hold)),
        ));

        engine.register(Rule::new(
            PRICE_SANITY_CHECK,
            "Price must be finite and positive",
            Severity::Block,
            |ctx| Ok(ctx.price.is_finite() && ctx.price > 0.0),
        ));

        engine
    }

    /// Engine with no rules.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Appends a rule after the existing ones.
    pub fn register(&mut self, rule: Rule) {
        debug!("Registered guardrail rule {}", rule.id);
        self.rules.push(rule);
    }

    pub fn rule_ids(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.id.as_str()).collect()
    }

    pub fn evaluate(&self, ctx: &GuardrailContext) -> GuardrailVerdict {
        let mut violations = Vec::new();

        for rule in &self.rules {
            let outcome = catch_unwind(AssertUnwindSafe(|| (rule.predicate)(ctx)));

            let passed = match outcome {
                Ok(Ok(passed)) => passed,
                Ok(Err(e)) => {
                    error!("Guardrail rule {} failed: {:#}", rule.id, e);
                    return Self::crashed(rule, violations);
                }
                Err(_) => {
                    error!("Guardrail rule {} panicked", rule.id);
                    return Self::crashed(rule, violations);
                }
            };

            if passed {
                continue;
            }

            violations.push(rule.violation());
            match rule.severity {
                Severity::Block => {
                    warn!(symbol = %ctx.symbol, action = %ctx.action, "Guardrail BLOCK: {}", rule.id);
                    return GuardrailVerdict {
                        approved: false,
                        violations,
                    };
                }
                Severity::Warn => {
                    warn!(symbol = %ctx.symbol, action = %ctx.action, "Guardrail WARN: {}", rule.id);
                }
            }
        }

        GuardrailVerdict {
            approved: true,
            violations,
        }
    }

    fn crashed(rule: &Rule, mut violations: Vec<Violation>) -> GuardrailVerdict {
        violations.push(Violation {
            rule_id: SYSTEM_ERROR.to_string(),
            severity: Severity::Block,
            description: format!("SYSTEM_ERROR: rule {} crashed", rule.id),
        });
        GuardrailVerdict {
            approved: false,
            violations,
        }
    }
}
