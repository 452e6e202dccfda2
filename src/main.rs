//! Titan Council demo
//!
//! Drives the decision pipeline with simulated providers over a random-walk
//! market, settles remembered trades after a few ticks, and prints metrics.

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use titan_council::oracle::metrics;
use titan_council::oracle::{
    Action, FileSnapshotStore, InferenceProvider, Outcome, PipelineBuilder, ProviderContext,
    RawSignal, TracingCommitTarget,
};
use titan_council::types::{
    MarketSnapshot, INDICATOR_FEAR_GREED, INDICATOR_OFI, INDICATOR_RSI, INDICATOR_TREND,
};
use tracing::{info, Level};

/// Momentum-following stand-in for a remote model.
struct MomentumProvider {
    id: String,
    latency: Duration,
    failure_rate: f64,
}

#[async_trait]
impl InferenceProvider for MomentumProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn propose(&self, ctx: &ProviderContext) -> Result<RawSignal> {
        tokio::time::sleep(self.latency).await;
        if rand::thread_rng().gen_bool(self.failure_rate) {
            anyhow::bail!("simulated upstream error");
        }

        let trend = ctx.snapshot.indicator(INDICATOR_TREND).unwrap_or(0.0);
        let ofi = ctx.snapshot.indicator(INDICATOR_OFI).unwrap_or(0.0);
        let (action, confidence) = match trend + ofi {
            s if s > 0.5 => (Action::Buy, 0.6 + s.min(1.0) * 0.3),
            s if s < -0.5 => (Action::Sell, 0.6 + s.abs().min(1.0) * 0.3),
            _ => (Action::Hold, 0.5),
        };

        Ok(RawSignal {
            action,
            confidence,
            rationale: format!("momentum {:.2}", trend + ofi),
        })
    }
}

struct OpenTrade {
    memory_id: String,
    action: Action,
    entry: f64,
    settle_at: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting Titan Council demo");

    let pipeline = PipelineBuilder::new()
        .with_provider(Arc::new(MomentumProvider {
            id: "primary".to_string(),
            latency: Duration::from_millis(40),
            failure_rate: 0.05,
        }))
        .with_provider(Arc::new(MomentumProvider {
            id: "secondary".to_string(),
            latency: Duration::from_millis(120),
            failure_rate: 0.25,
        }))
        .with_timeouts(Duration::from_millis(100), Duration::from_secs(1))
        .with_durable_store(Arc::new(FileSnapshotStore::new("./titan-memory.json")))
        .with_commit_target(Arc::new(TracingCommitTarget))
        .build()
        .await?;

    let mut rng = rand::thread_rng();
    let mut price = 60_000.0_f64;
    let mut rsi = 50.0_f64;
    let mut open: VecDeque<OpenTrade> = VecDeque::new();

    for tick in 0..120u64 {
        let step: f64 = rng.gen_range(-0.01..0.01);
        price *= 1.0 + step;
        rsi = (rsi + step * 800.0).clamp(5.0, 95.0);

        let snapshot = MarketSnapshot::new("BTCUSDT", price, chrono::Utc::now().timestamp_millis() as u64)
            .with_indicator(INDICATOR_RSI, rsi)
            .with_indicator(INDICATOR_TREND, step.signum())
            .with_indicator(INDICATOR_OFI, rng.gen_range(-0.5..0.5))
            .with_indicator(INDICATOR_FEAR_GREED, rng.gen_range(10.0..90.0));

        let outcome = pipeline.decide(&snapshot).await?;
        if let Some(memory_id) = outcome.memory_id.clone() {
            open.push_back(OpenTrade {
                memory_id,
                action: outcome.decision.action,
                entry: price,
                settle_at: tick + 5,
            });
        }

        while open.front().map(|t| t.settle_at <= tick).unwrap_or(false) {
            let Some(trade) = open.pop_front() else { break };
            let pnl = match trade.action {
                Action::Buy => price - trade.entry,
                Action::Sell => trade.entry - price,
                Action::Hold => 0.0,
            };
            let result = if pnl > 0.0 { Outcome::Win } else { Outcome::Loss };
            pipeline.settle(&trade.memory_id, result, pnl).await;
        }
    }

    pipeline.shutdown().await?;

    let snapshot = pipeline.metrics().snapshot().await;
    info!(
        "Done: {} decisions, {} blocked, {} fail-closed, {} memories, mean cycle {:.1} ms",
        snapshot.counters.get(metrics::DECISIONS_TOTAL).copied().unwrap_or(0),
        snapshot.counters.get(metrics::VERDICTS_BLOCKED).copied().unwrap_or(0),
        snapshot.counters.get(metrics::DECISIONS_FAIL_CLOSED).copied().unwrap_or(0),
        pipeline.memory().len().await,
        snapshot.mean(metrics::CYCLE_DURATION).unwrap_or(0.0) * 1_000.0,
    );

    Ok(())
}
