//! Circuit breaker for inference provider health.
//!
//! Providers that keep failing are degraded and then quarantined for a
//! cooldown period, after which they get another chance.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Rolling window of attempts kept per provider.
const ATTEMPT_WINDOW: usize = 100;
/// Success rate a degraded provider needs to return to healthy.
const RECOVERY_SUCCESS_RATE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    /// Provider is answering normally
    Healthy,
    /// Provider is failing but still called
    Degraded,
    /// Provider is skipped until the cooldown expires
    CoolingDown,
}

/// Health tracking for one provider.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    /// Current availability state
    pub state: ProviderState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Success rate over the rolling window
    pub success_rate: f64,
    /// When the provider entered cooldown, if cooling down
    pub cooldown_start: Option<Instant>,
    recent_attempts: Vec<bool>,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            state: ProviderState::Healthy,
            consecutive_failures: 0,
            success_rate: 1.0,
            cooldown_start: None,
            recent_attempts: Vec::new(),
        }
    }

    fn record(&mut self, success: bool) {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }

        self.recent_attempts.push(success);
        if self.recent_attempts.len() > ATTEMPT_WINDOW {
            self.recent_attempts.remove(0);
        }

        let successes = self.recent_attempts.iter().filter(|&&ok| ok).count();
        self.success_rate = successes as f64 / self.recent_attempts.len() as f64;
    }

    /// Number of outcomes in the sliding sample window
    pub fn attempts(&self) -> usize {
        self.recent_attempts.len()
    }
}

/// Per-provider circuit breaker.
pub struct CircuitBreaker {
    providers: HashMap<String, ProviderHealth>,
    failure_threshold: u32,
    cooldown_duration: Duration,
    /// Attempts required before the success rate can trip the breaker
    sample_size: usize,
    min_success_rate: f64,
}

impl CircuitBreaker {
    /// Create a breaker that trips after `failure_threshold` consecutive failures
    /// and retries a provider after `cooldown_seconds`.
    pub fn new(failure_threshold: u32, cooldown_seconds: u64, sample_size: usize) -> Self {
        Self::with_cooldown(failure_threshold, Duration::from_secs(cooldown_seconds), sample_size)
    }

    /// Like [`CircuitBreaker::new`] with a sub-second cooldown, mainly for tests.
    pub fn with_cooldown(failure_threshold: u32, cooldown: Duration, sample_size: usize) -> Self {
        Self {
            providers: HashMap::new(),
            failure_threshold: failure_threshold.max(1),
            cooldown_duration: cooldown,
            sample_size,
            min_success_rate: 0.3,
        }
    }

    #[instrument(skip(self))]
    pub fn record_success(&mut self, provider: &str) {
        let health = self.entry(provider);
        health.record(true);
        self.update_state(provider);
    }

    #[instrument(skip(self))]
    pub fn record_failure(&mut self, provider: &str) {
        let health = self.entry(provider);
        health.record(false);
        let failures = health.consecutive_failures;
        self.update_state(provider);
        debug!("Provider {} failure #{}", provider, failures);
    }

    /// Whether the provider may be called now. Expired cooldowns move to degraded.
    pub fn is_available(&mut self, provider: &str) -> bool {
        let cooldown = self.cooldown_duration;
        let health = self.entry(provider);

        match health.state {
            ProviderState::Healthy | ProviderState::Degraded => true,
            ProviderState::CoolingDown => match health.cooldown_start {
                Some(start) if start.elapsed() < cooldown => false,
                _ => {
                    health.state = ProviderState::Degraded;
                    health.cooldown_start = None;
                    health.consecutive_failures = 0;
                    debug!("Provider {} cooldown expired, retrying as degraded", provider);
                    true
                }
            },
        }
    }

    /// State of `provider`; unknown providers are healthy.
    pub fn state(&self, provider: &str) -> ProviderState {
        self.providers
            .get(provider)
            .map(|h| h.state)
            .unwrap_or(ProviderState::Healthy)
    }

    /// Health record for `provider`, if it has been seen.
    pub fn health(&self, provider: &str) -> Option<&ProviderHealth> {
        self.providers.get(provider)
    }

    /// Forget everything recorded for `provider`.
    pub fn reset(&mut self, provider: &str) {
        self.providers.insert(provider.to_string(), ProviderHealth::new());
    }

    fn entry(&mut self, provider: &str) -> &mut ProviderHealth {
        self.providers
            .entry(provider.to_string())
            .or_insert_with(ProviderHealth::new)
    }

    fn update_state(&mut self, provider: &str) {
        let threshold = self.failure_threshold;
        let sample_size = self.sample_size;
        let min_success_rate = self.min_success_rate;
        let Some(health) = self.providers.get_mut(provider) else {
            return;
        };

        match health.state {
            ProviderState::Healthy => {
                if health.consecutive_failures >= threshold {
                    health.state = ProviderState::Degraded;
                    warn!("Provider {} degraded after {} failures", provider, health.consecutive_failures);
                }
            }
            ProviderState::Degraded => {
                let rate_tripped =
                    health.attempts() >= sample_size && health.success_rate < min_success_rate;
                if health.consecutive_failures >= threshold * 2 || rate_tripped {
                    health.state = ProviderState::CoolingDown;
                    health.cooldown_start = Some(Instant::now());
                    warn!(
                        "Provider {} cooling down: {} consecutive failures, {:.0}% success",
                        provider,
                        health.consecutive_failures,
                        health.success_rate * 100.0
                    );
                } else if health.consecutive_failures == 0 && health.success_rate > RECOVERY_SUCCESS_RATE {
                    health.state = ProviderState::Healthy;
                    debug!("Provider {} recovered", provider);
                }
            }
            ProviderState::CoolingDown => {}
        }
    }
}
