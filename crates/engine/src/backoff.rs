//! Retry backoff: exponential with full jitter.
//!
//! `delay = rand(0, min(cap, base * 2^attempt))`, so concurrent retries
//! of the same attempt spread out instead of stampeding.

use std::time::Duration;

use rand::Rng;

use conveyor_common::config::RetryConfig;
use conveyor_common::types::Priority;

#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    base_ms: u64,
    cap_ms: u64,
    overrides: [Option<(u64, u64)>; 3],
}

impl BackoffPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        let mut overrides = [None; 3];
        for (i, priority) in Priority::ALL.iter().enumerate() {
            if let Some(o) = config.overrides.get(priority.as_str()) {
                overrides[i] = Some((o.base_ms, o.cap_ms));
            }
        }
        Self {
            base_ms: config.base_ms,
            cap_ms: config.cap_ms,
            overrides,
        }
    }

    /// Upper bound of the jitter window for this attempt.
    pub fn ceiling(&self, priority: Priority, attempt: u32) -> Duration {
        let (base, cap) = self.params(priority);
        let exp = base.saturating_mul(1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX));
        Duration::from_millis(exp.min(cap))
    }

    /// Full-jitter delay for this attempt.
    pub fn delay(&self, priority: Priority, attempt: u32, rng: &mut impl Rng) -> Duration {
        let ceiling = self.ceiling(priority, attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(0..=ceiling))
    }

    fn params(&self, priority: Priority) -> (u64, u64) {
        let idx = Priority::ALL.iter().position(|p| *p == priority).unwrap_or(1);
        self.overrides[idx].unwrap_or((self.base_ms, self.cap_ms))
    }
}

/// A uniformly jittered interval: `base ± pct`.
pub fn jittered(base: Duration, pct: f64, rng: &mut impl Rng) -> Duration {
    let base_ms = base.as_millis() as f64;
    let spread = base_ms * pct;
    let ms = rng.gen_range((base_ms - spread).max(0.0)..=(base_ms + spread));
    Duration::from_millis(ms as u64)
}
