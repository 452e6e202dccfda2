//! Concurrent proposal collection.
//!
//! One task per registered provider, each bounded by the provider timeout.
//! Failed, throttled or quarantined providers are omitted from the result; the
//! local proposer always answers, so the result is never empty.

use crate::oracle::circuit_breaker::CircuitBreaker;
use crate::oracle::metrics::{self, PipelineMetrics};
use crate::oracle::providers::{
    InferenceProvider, LocalProposer, ProviderContext, ProviderError, LOCAL_SOURCE_ID,
};
use crate::oracle::rate_limit::ProviderThrottle;
use crate::oracle::types::Proposal;
use crate::types::MarketSnapshot;
use nonempty::NonEmpty;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Proposals collected for one snapshot, plus the providers that were left out.
#[derive(Debug, Clone)]
pub struct FanoutOutcome {
    /// Ordered by source id
    pub proposals: NonEmpty<Proposal>,
    pub omitted: Vec<(String, ProviderError)>,
}

pub struct ProposalFanout {
    providers: Vec<Arc<dyn InferenceProvider>>,
    local: LocalProposer,
    timeout: Duration,
    breaker: Arc<Mutex<CircuitBreaker>>,
    throttle: ProviderThrottle,
    metrics: PipelineMetrics,
}

impl ProposalFanout {
    pub fn new(
        providers: Vec<Arc<dyn InferenceProvider>>,
        timeout: Duration,
        breaker: CircuitBreaker,
        throttle: ProviderThrottle,
        metrics: PipelineMetrics,
    ) -> Self {
        let providers: Vec<_> = providers
            .into_iter()
            .filter(|p| {
                let reserved = p.id() == LOCAL_SOURCE_ID;
                if reserved {
                    warn!("Ignoring provider registered under reserved id {}", LOCAL_SOURCE_ID);
                }
                !reserved
            })
            .collect();

        info!("Proposal fanout over {} remote providers + local", providers.len());
        Self {
            providers,
            local: LocalProposer::new(),
            timeout,
            breaker: Arc::new(Mutex::new(breaker)),
            throttle,
            metrics,
        }
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id().to_string()).collect()
    }

    pub fn breaker(&self) -> Arc<Mutex<CircuitBreaker>> {
        self.breaker.clone()
    }

    /// Collects proposals from every provider. Never fails.
    pub async fn submit(&self, snapshot: &MarketSnapshot) -> NonEmpty<Proposal> {
        self.collect(snapshot).await.proposals
    }

    #[instrument(skip(self, snapshot), fields(symbol = %snapshot.symbol))]
    pub async fn collect(&self, snapshot: &MarketSnapshot) -> FanoutOutcome {
        let ctx = Arc::new(ProviderContext::new(snapshot.clone()));
        let mut omitted = Vec::new();
        let mut handles: Vec<(String, JoinHandle<Result<Proposal, ProviderError>>)> = Vec::new();

        for provider in &self.providers {
            let id = provider.id().to_string();

            let available = self.breaker.lock().await.is_available(&id);
            if !available {
                omitted.push((id, ProviderError::CircuitOpen));
                continue;
            }
            if !self.throttle.try_acquire(&id) {
                omitted.push((id, ProviderError::Throttled));
                continue;
            }

            let provider = provider.clone();
            let ctx = ctx.clone();
            let timeout = self.timeout;
            let task_id = id.clone();
            let handle = tokio::spawn(async move {
                match tokio::time::timeout(timeout, provider.propose(&ctx)).await {
                    Ok(Ok(signal)) => signal.into_proposal(&task_id),
                    Ok(Err(e)) => Err(ProviderError::classify(&e)),
                    Err(_) => Err(ProviderError::Timeout(timeout)),
                }
            });
            handles.push((id, handle));
        }

        let mut proposals = Vec::with_capacity(handles.len() + 1);
        for (id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(ProviderError::Transport(format!("task failed: {}", join_error))),
            };

            match result {
                Ok(proposal) => {
                    self.breaker.lock().await.record_success(&id);
                    proposals.push(proposal);
                }
                Err(e) => {
                    if e.is_provider_fault() {
                        self.breaker.lock().await.record_failure(&id);
                    }
                    omitted.push((id, e));
                }
            }
        }

        let local = self.local.evaluate(snapshot);
        let local = Proposal {
            source_id: LOCAL_SOURCE_ID.to_string(),
            action: local.action,
            confidence: local.confidence.clamp(0.0, 1.0),
            rationale: local.rationale,
        };
        proposals.push(local.clone());
        proposals.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        for (id, e) in &omitted {
            warn!("Omitted proposal from {}: {}", id, e);
            self.metrics.increment_counter(e.metric()).await;
        }
        self.metrics
            .add_to_counter(metrics::PROPOSALS_RECEIVED, proposals.len() as u64)
            .await;

        debug!(
            "Collected {} proposals, omitted {}",
            proposals.len(),
            omitted.len()
        );

        let proposals = NonEmpty::from_vec(proposals).unwrap_or_else(|| NonEmpty::new(local));
        FanoutOutcome { proposals, omitted }
    }
}
