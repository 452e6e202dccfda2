//! Inference providers and arbiters.
//!
//! Every opinion source implements [`InferenceProvider`]; the single aggregation
//! call goes through [`Arbiter`]. This module also holds the always-available
//! [`LocalProposer`] and a generic OpenAI-compatible HTTP adapter,
//! [`ChatCompletionProvider`], which implements both traits.

use crate::oracle::retry_strategy;
use crate::oracle::types::{Action, Proposal, RecallSummary};
use crate::types::{MarketSnapshot, TrendLabel, INDICATOR_FEAR_GREED, INDICATOR_OFI};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_retry::RetryIf;
use tracing::{debug, instrument, warn};

/// Source id of the deterministic local proposer.
pub const LOCAL_SOURCE_ID: &str = "local";

/// Why a provider's proposal was omitted from a cycle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("throttled")]
    Throttled,

    #[error("circuit open")]
    CircuitOpen,
}

impl ProviderError {
    /// Metrics counter this failure is tallied under.
    pub fn metric(&self) -> &'static str {
        use crate::oracle::metrics;
        match self {
            ProviderError::Timeout(_) => metrics::PROVIDER_TIMEOUTS,
            ProviderError::Transport(_) => metrics::PROVIDER_ERRORS,
            ProviderError::Malformed(_) => metrics::PROVIDER_MALFORMED,
            ProviderError::Throttled => metrics::PROVIDER_THROTTLED,
            ProviderError::CircuitOpen => metrics::PROVIDER_CIRCUIT_OPEN,
        }
    }

    /// Classifies an arbitrary provider error; unknown errors count as transport failures.
    pub fn classify(err: &anyhow::Error) -> ProviderError {
        match err.downcast_ref::<ProviderError>() {
            Some(e) => e.clone(),
            None => ProviderError::Transport(format!("{:#}", err)),
        }
    }

    /// Whether the breaker should count this as a provider failure.
    pub fn is_provider_fault(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout(_) | ProviderError::Transport(_) | ProviderError::Malformed(_)
        )
    }
}

/// What a provider sees for one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderContext {
    pub snapshot: MarketSnapshot,
}

impl ProviderContext {
    pub fn new(snapshot: MarketSnapshot) -> Self {
        Self { snapshot }
    }

    /// Natural-language request for text-based providers.
    pub fn prompt(&self) -> String {
        let indicators = serde_json::to_string(&self.snapshot.indicators).unwrap_or_default();
        format!(
            "Analyze the market data and give a trading signal (BUY/SELL/HOLD). \
             Return ONLY JSON: {{\"action\": \"BUY|SELL|HOLD\", \"confidence\": 0.0-1.0, \"rationale\": \"...\"}}. \
             Symbol: {}, Price: {}, Indicators: {}",
            self.snapshot.symbol, self.snapshot.price, indicators
        )
    }
}

/// A provider's answer before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSignal {
    pub action: Action,
    pub confidence: f64,
    pub rationale: String,
}

impl RawSignal {
    /// Validates and clamps into a proposal. Non-finite confidence is malformed.
    pub fn into_proposal(self, source_id: &str) -> std::result::Result<Proposal, ProviderError> {
        if !self.confidence.is_finite() {
            return Err(ProviderError::Malformed(format!(
                "non-finite confidence {}",
                self.confidence
            )));
        }
        Ok(Proposal {
            source_id: source_id.to_string(),
            action: self.action,
            confidence: self.confidence.clamp(0.0, 1.0),
            rationale: self.rationale,
        })
    }
}

#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Stable identifier, used for ordering, weighting and health tracking.
    fn id(&self) -> &str;

    async fn propose(&self, ctx: &ProviderContext) -> Result<RawSignal>;
}

/// A proposal with the vote weight assigned to its source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightedProposal {
    #[serde(flatten)]
    pub proposal: Proposal,
    pub weight: f64,
}

/// Everything the arbiter decides on.
#[derive(Debug, Clone, Serialize)]
pub struct ArbiterInput {
    pub snapshot: MarketSnapshot,
    pub proposals: Vec<WeightedProposal>,
    pub recall: RecallSummary,
}

/// The arbiter's answer. Validated and clamped by the aggregator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArbiterRuling {
    pub action: Action,
    pub confidence: f64,
    pub consensus_score: f64,
    pub rationale: String,
}

#[async_trait]
pub trait Arbiter: Send + Sync {
    async fn decide(&self, input: &ArbiterInput) -> Result<ArbiterRuling>;
}

/// Deterministic, network-free proposer driven purely by snapshot indicators.
#[derive(Debug, Clone, Default)]
pub struct LocalProposer;

impl LocalProposer {
    pub fn new() -> Self {
        Self
    }

    /// Scores RSI zones, trend, order flow and sentiment into an action.
    pub fn evaluate(&self, snapshot: &MarketSnapshot) -> RawSignal {
        let rsi = snapshot.oscillator();
        let trend = snapshot.trend();
        let ofi = snapshot.indicator(INDICATOR_OFI).unwrap_or(0.0);
        let fear_greed = snapshot.indicator(INDICATOR_FEAR_GREED).unwrap_or(50.0);

        let mut score = 0.0;
        let mut reasons = Vec::new();

        if rsi < 32.0 {
            score += 5.0;
            reasons.push(format!("RSI oversold ({:.1})", rsi));
        } else if rsi < 46.0 {
            score += 2.0;
            reasons.push(format!("RSI low ({:.1})", rsi));
        } else if rsi > 68.0 {
            score -= 5.0;
            reasons.push(format!("RSI overbought ({:.1})", rsi));
        } else if rsi > 59.0 {
            score -= 2.0;
            reasons.push(format!("RSI high ({:.1})", rsi));
        }

        match trend {
            TrendLabel::Bullish => {
                score += 1.5;
                reasons.push("bullish trend".to_string());
            }
            TrendLabel::Bearish => {
                score -= 1.5;
                reasons.push("bearish trend".to_string());
            }
            TrendLabel::Neutral => {}
        }

        if ofi > 0.15 {
            score += 1.5;
            reasons.push(format!("buy pressure (ofi {:.2})", ofi));
        } else if ofi < -0.15 {
            score -= 1.5;
            reasons.push(format!("sell pressure (ofi {:.2})", ofi));
        }

        if fear_greed < 25.0 {
            score += 1.0;
            reasons.push("extreme fear".to_string());
        } else if fear_greed > 75.0 {
            score -= 1.0;
            reasons.push("extreme greed".to_string());
        }

        // Damp longs against a bearish trend unless deeply oversold
        if score > 0.0 && trend == TrendLabel::Bearish && rsi > 32.0 {
            score = (score - 2.0_f64).max(0.0);
            reasons.push("bearish damping".to_string());
        }

        let action = if score >= 1.5 {
            Action::Buy
        } else if score <= -1.5 {
            Action::Sell
        } else {
            Action::Hold
        };

        let confidence = match action {
            Action::Hold => 0.5,
            _ => 0.55 + (score.abs() / 6.0).min(1.0) * 0.4,
        };

        let rationale = if reasons.is_empty() {
            format!("score {:.1}: no signal", score)
        } else {
            format!("score {:.1}: {}", score, reasons.join(", "))
        };

        RawSignal {
            action,
            confidence,
            rationale,
        }
    }
}

#[async_trait]
impl InferenceProvider for LocalProposer {
    fn id(&self) -> &str {
        LOCAL_SOURCE_ID
    }

    async fn propose(&self, ctx: &ProviderContext) -> Result<RawSignal> {
        Ok(self.evaluate(&ctx.snapshot))
    }
}

/// Strips markdown code fences and surrounding prose, leaving the JSON object.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_object(text: &str) -> std::result::Result<serde_json::Map<String, serde_json::Value>, ProviderError> {
    let body = extract_json(text)
        .ok_or_else(|| ProviderError::Malformed("no JSON object in response".to_string()))?;
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(ProviderError::Malformed("response is not a JSON object".to_string())),
        Err(e) => Err(ProviderError::Malformed(e.to_string())),
    }
}

fn number_field(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<f64> {
    match map.get(key)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_field(map: &serde_json::Map<String, serde_json::Value>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string()
}

fn action_field(map: &serde_json::Map<String, serde_json::Value>) -> std::result::Result<Action, ProviderError> {
    let raw = map
        .get("action")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProviderError::Malformed("missing action".to_string()))?;
    Action::parse(raw).ok_or_else(|| ProviderError::Malformed(format!("unknown action {:?}", raw)))
}

/// Parses a model response of the form `{"action", "confidence", "rationale"}`.
///
/// Code fences are tolerated; a missing or unknown action, or a missing or
/// non-finite confidence, makes the response malformed.
pub fn parse_signal(text: &str) -> std::result::Result<RawSignal, ProviderError> {
    let map = parse_object(text)?;
    let action = action_field(&map)?;
    let confidence = number_field(&map, "confidence")
        .filter(|c| c.is_finite())
        .ok_or_else(|| ProviderError::Malformed("missing or invalid confidence".to_string()))?;

    Ok(RawSignal {
        action,
        confidence,
        rationale: text_field(&map, &["rationale", "reasoning", "reason"]),
    })
}

/// Parses an arbiter response with an additional `consensus_score` field.
pub fn parse_ruling(text: &str) -> std::result::Result<ArbiterRuling, ProviderError> {
    let map = parse_object(text)?;
    let action = action_field(&map)?;
    let confidence = number_field(&map, "confidence")
        .ok_or_else(|| ProviderError::Malformed("missing confidence".to_string()))?;
    let consensus_score = number_field(&map, "consensus_score")
        .or_else(|| number_field(&map, "consensusScore"))
        .ok_or_else(|| ProviderError::Malformed("missing consensus_score".to_string()))?;

    Ok(ArbiterRuling {
        action,
        confidence,
        consensus_score,
        rationale: text_field(&map, &["rationale", "reasoning", "reason"]),
    })
}

/// Settings for one OpenAI-compatible chat-completions source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionConfig {
    /// Source id used in proposals
    pub id: String,
    /// Full URL of the chat-completions endpoint
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Models tried in order when the primary model fails
    pub fallback_models: Vec<String>,
    pub temperature: f64,
    /// Transport retries per model
    pub retry_attempts: usize,
    pub retry_base_ms: u64,
    /// Per-request HTTP timeout
    pub timeout_ms: u64,
    pub system_prompt: String,
}

impl ChatCompletionConfig {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            api_key: None,
            model: model.into(),
            fallback_models: Vec::new(),
            temperature: 0.1,
            retry_attempts: 2,
            retry_base_ms: 200,
            timeout_ms: 10_000,
            system_prompt: "You are a trading analyst. Return ONLY JSON.".to_string(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_models.push(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f64,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// OpenAI-compatible chat-completions client usable as a provider or arbiter.
pub struct ChatCompletionProvider {
    config: ChatCompletionConfig,
    client: Client,
}

impl ChatCompletionProvider {
    pub fn new(config: ChatCompletionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn with_client(config: ChatCompletionConfig, client: Client) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &ChatCompletionConfig {
        &self.config
    }

    /// Sends `prompt` to each configured model in turn until one yields a parseable answer.
    async fn ask<T>(
        &self,
        prompt: &str,
        parse: impl Fn(&str) -> std::result::Result<T, ProviderError>,
    ) -> std::result::Result<T, ProviderError> {
        let models = std::iter::once(&self.config.model).chain(self.config.fallback_models.iter());
        let mut last_error = ProviderError::Transport("no model configured".to_string());

        for model in models {
            let strategy = retry_strategy(self.config.retry_base_ms, self.config.retry_attempts);
            let outcome = RetryIf::spawn(
                strategy,
                || self.complete(model, prompt),
                |e: &ProviderError| matches!(e, ProviderError::Transport(_)),
            )
            .await
            .and_then(|content| parse(&content));

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Model {} via {} failed: {}", model, self.config.id, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    #[instrument(skip(self, prompt), fields(provider = %self.config.id))]
    async fn complete(&self, model: &str, prompt: &str) -> std::result::Result<String, ProviderError> {
        let body = ChatRequest {
            model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &self.config.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.config.temperature,
        };

        let mut request = self.client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Transport(format!("HTTP {}", status)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::Malformed("empty choices".to_string()))?;

        debug!("Model {} answered {} chars", model, content.len());
        Ok(content)
    }

    fn arbiter_prompt(input: &ArbiterInput) -> String {
        let proposals = serde_json::to_string(&input.proposals).unwrap_or_default();
        let recall = serde_json::to_string(&input.recall).unwrap_or_default();
        format!(
            "You are the arbiter of a council of trading analysts. Weigh their proposals \
             (higher weight = more trusted) and the memory of similar past trades, then return \
             ONLY JSON: {{\"action\": \"BUY|SELL|HOLD\", \"confidence\": 0.0-1.0, \
             \"consensus_score\": 0-100, \"rationale\": \"...\"}}. \
             Symbol: {}, Price: {}, Proposals: {}, Memory: {}",
            input.snapshot.symbol, input.snapshot.price, proposals, recall
        )
    }
}

#[async_trait]
impl InferenceProvider for ChatCompletionProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn propose(&self, ctx: &ProviderContext) -> Result<RawSignal> {
        Ok(self.ask(&ctx.prompt(), parse_signal).await?)
    }
}

#[async_trait]
impl Arbiter for ChatCompletionProvider {
    async fn decide(&self, input: &ArbiterInput) -> Result<ArbiterRuling> {
        Ok(self.ask(&Self::arbiter_prompt(input), parse_ruling).await?)
    }
}
