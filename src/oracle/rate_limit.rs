//! Per-provider request throttling on top of governor.
//!
//! Each provider gets its own direct rate limiter. A provider over quota is
//! skipped for the current cycle instead of delaying the whole fanout.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Mutex;
use tracing::debug;

const FALLBACK_RPS: NonZeroU32 = match NonZeroU32::new(1) {
    Some(n) => n,
    None => unreachable!(),
};

pub struct ProviderThrottle {
    quota: Quota,
    limiters: Mutex<HashMap<String, DefaultDirectRateLimiter>>,
    overrides: HashMap<String, Quota>,
}

impl ProviderThrottle {
    /// Throttle allowing `requests_per_second` per provider (zero means one).
    pub fn new(requests_per_second: u32) -> Self {
        Self {
            quota: Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(FALLBACK_RPS)),
            limiters: Mutex::new(HashMap::new()),
            overrides: HashMap::new(),
        }
    }

    /// Gives one provider its own per-second quota.
    pub fn with_provider_quota(mut self, provider: impl Into<String>, requests_per_second: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(FALLBACK_RPS));
        self.overrides.insert(provider.into(), quota);
        self
    }

    /// Consumes a permit for `provider`, returning `false` if it is over quota.
    pub fn try_acquire(&self, provider: &str) -> bool {
        let Ok(mut limiters) = self.limiters.lock() else {
            return true;
        };

        let quota = self.overrides.get(provider).copied().unwrap_or(self.quota);
        let limiter = limiters
            .entry(provider.to_string())
            .or_insert_with(|| RateLimiter::direct(quota));

        let allowed = limiter.check().is_ok();
        if !allowed {
            debug!("Provider {} throttled", provider);
        }
        allowed
    }
}
