mod common;

use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use titan_council::oracle::consensus::AGGREGATOR_UNAVAILABLE;
use titan_council::oracle::features::{SnapshotEmbedder, DEFAULT_DIMENSION};
use titan_council::oracle::guardrails::{RISK_BEAR_MARKET_BUY, SYSTEM_ERROR};
use titan_council::oracle::{
    Action, FragmentMetadata, InMemorySnapshotStore, MemoryStore, Outcome, PipelineBuilder,
    Rule, Severity,
};
use tokio::time::timeout;

fn builder(target: Arc<RecordingTarget>) -> PipelineBuilder {
    PipelineBuilder::new()
        .with_timeouts(Duration::from_millis(200), Duration::from_millis(500))
        .with_ledger_config(fast_ledger_config(50))
        .with_commit_target(target)
}

#[tokio::test]
async fn test_decisions_are_always_well_formed() {
    let pipeline = builder(RecordingTarget::new())
        .with_provider(ScriptedProvider::new("primary", Action::Buy, 0.8))
        .with_provider(ScriptedProvider::new("secondary", Action::Sell, 1.7))
        .with_provider(FailingProvider::new("flaky"))
        .build()
        .await
        .unwrap();

    let cases = [
        snapshot("BTCUSDT", 60_000.0, 25.0, 1.0),
        snapshot("BTCUSDT", 59_000.0, 75.0, -1.0),
        snapshot("ETHUSDT", 3_000.0, 50.0, 0.0),
        snapshot("SOLUSDT", 0.0, 50.0, 1.0),
        snapshot("SOLUSDT", -5.0, 10.0, -1.0),
    ];

    for snap in &cases {
        let outcome = pipeline.decide(snap).await.unwrap();
        let decision = &outcome.decision;
        assert!((0.0..=1.0).contains(&decision.confidence));
        assert!((0.0..=100.0).contains(&decision.consensus_score));
        assert!(decision.proof_digest.starts_with("0x"));
        assert_eq!(decision.proof_digest.len(), 66);
        assert!(decision.sources.contains(&"local".to_string()));
        assert!(!decision.sources.contains(&"flaky".to_string()));
        assert_eq!(decision.timestamp, snap.timestamp);
    }
}

#[tokio::test]
async fn test_all_providers_failing_falls_back_to_local() {
    let pipeline = builder(RecordingTarget::new())
        .with_provider(FailingProvider::new("primary"))
        .with_provider(FailingProvider::new("secondary"))
        .build()
        .await
        .unwrap();

    let outcome = pipeline
        .decide(&snapshot("BTCUSDT", 60_000.0, 25.0, 1.0))
        .await
        .unwrap();

    assert_eq!(outcome.decision.sources, vec!["local".to_string()]);
    assert_eq!(outcome.decision.action, Action::Buy);
}

#[tokio::test]
async fn test_slow_provider_does_not_stall_cycle() {
    let pipeline = builder(RecordingTarget::new())
        .with_provider(ScriptedProvider::slow("primary", Duration::from_secs(5)))
        .with_provider(ScriptedProvider::new("secondary", Action::Hold, 0.7))
        .with_timeouts(Duration::from_millis(50), Duration::from_millis(500))
        .build()
        .await
        .unwrap();

    let started = Instant::now();
    let outcome = pipeline
        .decide(&snapshot("BTCUSDT", 60_000.0, 50.0, 0.0))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        outcome.decision.sources,
        vec!["local".to_string(), "secondary".to_string()]
    );
}

#[tokio::test]
async fn test_arbiter_failure_fails_closed() {
    let pipeline = builder(RecordingTarget::new())
        .with_provider(ScriptedProvider::new("primary", Action::Buy, 0.95))
        .with_arbiter(Arc::new(FailingArbiter))
        .build()
        .await
        .unwrap();

    let outcome = pipeline
        .decide(&snapshot("BTCUSDT", 60_000.0, 25.0, 1.0))
        .await
        .unwrap();

    assert_eq!(outcome.decision.action, Action::Hold);
    assert_eq!(outcome.decision.confidence, 0.0);
    assert_eq!(outcome.decision.consensus_score, 0.0);
    assert_eq!(outcome.decision.rationale, AGGREGATOR_UNAVAILABLE);
    assert!(!outcome.is_actionable());
    assert!(outcome.memory_id.is_none());
}

#[tokio::test]
async fn test_bearish_buy_is_blocked() {
    let arbiter = ScriptedArbiter::new(Action::Buy, 0.9);
    let pipeline = builder(RecordingTarget::new())
        .with_arbiter(arbiter.clone())
        .build()
        .await
        .unwrap();

    let outcome = pipeline
        .decide(&snapshot("BTCUSDT", 60_000.0, 50.0, -1.0))
        .await
        .unwrap();

    assert_eq!(arbiter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.decision.action, Action::Buy);
    assert!(!outcome.verdict.approved);
    assert!(outcome.verdict.has_violation(RISK_BEAR_MARKET_BUY));
    assert!(!outcome.is_actionable());
    assert!(outcome.memory_id.is_none());
}

#[tokio::test]
async fn test_crashing_rule_blocks_and_stops_evaluation() {
    let later_calls = Arc::new(AtomicUsize::new(0));
    let counter = later_calls.clone();

    let pipeline = builder(RecordingTarget::new())
        .with_arbiter(ScriptedArbiter::new(Action::Hold, 0.9))
        .with_guardrail_rule(Rule::new(
            "VENUE_STATUS",
            "Venue must be open",
            Severity::Warn,
            |_| anyhow::bail!("venue status feed offline"),
        ))
        .with_guardrail_rule(Rule::new(
            "ALWAYS_PASS",
            "Counts evaluations",
            Severity::Block,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            },
        ))
        .build()
        .await
        .unwrap();

    let outcome = pipeline
        .decide(&snapshot("BTCUSDT", 60_000.0, 50.0, 0.0))
        .await
        .unwrap();

    assert!(!outcome.verdict.approved);
    assert!(outcome.verdict.has_violation(SYSTEM_ERROR));
    assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    assert!(outcome.verdict.summary().starts_with("BLOCKED"));
}

#[tokio::test]
async fn test_approved_trade_is_remembered_and_settled() {
    let pipeline = builder(RecordingTarget::new())
        .with_provider(ScriptedProvider::new("primary", Action::Buy, 0.9))
        .build()
        .await
        .unwrap();

    let outcome = pipeline
        .decide(&snapshot("BTCUSDT", 60_000.0, 25.0, 1.0))
        .await
        .unwrap();

    assert!(outcome.verdict.approved);
    assert!(outcome.is_actionable());
    let id = outcome.memory_id.expect("approved BUY should be remembered");

    let memory = pipeline.memory();
    assert_eq!(memory.get(&id).await.unwrap().metadata.outcome, Outcome::Pending);

    assert!(pipeline.settle(&id, Outcome::Win, 12.5).await);
    assert!(!pipeline.settle(&id, Outcome::Loss, -3.0).await);
    let fragment = memory.get(&id).await.unwrap();
    assert_eq!(fragment.metadata.outcome, Outcome::Win);
    assert_eq!(fragment.metadata.pnl, 12.5);
}

#[tokio::test]
async fn test_losing_history_vetoes_trade() {
    let snap = snapshot("BTCUSDT", 60_000.0, 25.0, 1.0);
    let embedding = SnapshotEmbedder::new(DEFAULT_DIMENSION).embed(&snap);

    let memory =
        Arc::new(MemoryStore::open(DEFAULT_DIMENSION, Arc::new(InMemorySnapshotStore::new())).await);
    for i in 0..6 {
        let id = memory
            .remember(
                embedding.clone(),
                FragmentMetadata {
                    timestamp: i,
                    symbol: "BTCUSDT".to_string(),
                    action: Action::Buy,
                    outcome: Outcome::Pending,
                    pnl: 0.0,
                    context: "oversold bounce".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(memory.update_outcome(&id, Outcome::Loss, -10.0).await);
    }

    let pipeline = builder(RecordingTarget::new())
        .with_provider(ScriptedProvider::new("primary", Action::Buy, 0.9))
        .with_memory_store(memory)
        .build()
        .await
        .unwrap();

    let outcome = pipeline.decide(&snap).await.unwrap();

    assert_eq!(outcome.decision.action, Action::Hold);
    assert!(outcome.decision.rationale.contains("memory veto"));
    assert!(outcome.memory_id.is_none());
}

#[tokio::test]
async fn test_every_cycle_is_audited() {
    let target = RecordingTarget::new();
    let pipeline = builder(target.clone())
        .with_provider(ScriptedProvider::new("primary", Action::Sell, 0.8))
        .build()
        .await
        .unwrap();

    let mut digests = Vec::new();
    for rsi in [20.0, 50.0, 80.0] {
        let outcome = pipeline
            .decide(&snapshot("BTCUSDT", 60_000.0, rsi, 0.0))
            .await
            .unwrap();
        digests.push(outcome.decision.proof_digest);
    }
    assert_eq!(pipeline.ledger().buffered_len().await, 3);

    pipeline.shutdown().await.unwrap();

    let batches = target.committed_batches();
    assert_eq!(batches.len(), 1);
    let committed: Vec<String> = batches[0].iter().map(|r| r.proof_digest.clone()).collect();
    assert_eq!(committed, digests);
    assert_eq!(pipeline.ledger().buffered_len().await, 0);
}

#[tokio::test]
async fn test_concurrent_cycles_across_symbols() {
    let pipeline = Arc::new(
        builder(RecordingTarget::new())
            .with_provider(ScriptedProvider::new("primary", Action::Hold, 0.7))
            .build()
            .await
            .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..8 {
        let pipeline = pipeline.clone();
        let symbol = if i % 2 == 0 { "BTCUSDT" } else { "ETHUSDT" };
        handles.push(tokio::spawn(async move {
            pipeline
                .decide(&snapshot(symbol, 1_000.0 + i as f64, 50.0, 0.0))
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(pipeline.ledger().buffered_len().await, 8);
}

#[tokio::test]
async fn test_invalid_snapshot_is_rejected() {
    let pipeline = builder(RecordingTarget::new()).build().await.unwrap();

    assert!(pipeline.decide(&snapshot("", 1.0, 50.0, 0.0)).await.is_err());
    assert!(pipeline
        .decide(&snapshot("BTCUSDT", 1.0, f64::NAN, 0.0))
        .await
        .is_err());
    assert_eq!(pipeline.ledger().buffered_len().await, 0);
}

#[tokio::test]
async fn test_hung_commit_target_does_not_stall_cycles() {
    let target = Arc::new(HangingTarget::default());
    let pipeline = PipelineBuilder::new()
        .with_timeouts(Duration::from_millis(200), Duration::from_millis(500))
        .with_ledger_config(fast_ledger_config(1))
        .with_commit_target(target.clone())
        .build()
        .await
        .unwrap();

    for symbol in ["BTCUSDT", "ETHUSDT", "BTCUSDT"] {
        let cycle = timeout(
            Duration::from_secs(2),
            pipeline.decide(&snapshot(symbol, 1_000.0, 50.0, 0.0)),
        )
        .await;
        assert!(cycle.is_ok(), "{} cycle waited on the commit target", symbol);
        assert!(cycle.unwrap().is_ok());
    }

    // The background attempt gives up after the submit timeout and keeps every record
    timeout(Duration::from_secs(3), pipeline.ledger().wait_background())
        .await
        .unwrap();
    assert!(target.attempts.load(Ordering::SeqCst) >= 1);
    assert_eq!(pipeline.ledger().buffered_len().await, 3);
}

#[tokio::test]
async fn test_failing_durable_store_still_remembers() {
    let store = FailingStore::new(false);
    let pipeline = builder(RecordingTarget::new())
        .with_provider(ScriptedProvider::new("primary", Action::Buy, 0.9))
        .with_durable_store(store.clone())
        .build()
        .await
        .unwrap();

    let outcome = pipeline
        .decide(&snapshot("BTCUSDT", 60_000.0, 25.0, 1.0))
        .await
        .unwrap();

    let id = outcome.memory_id.expect("write failures must not prevent remembering");
    assert!(store.writes.load(Ordering::SeqCst) >= 1);
    assert!(pipeline.settle(&id, Outcome::Win, 4.0).await);
    assert_eq!(pipeline.memory().len().await, 1);
}
