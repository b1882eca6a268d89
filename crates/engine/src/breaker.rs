//! Per-dependency circuit breakers consulted before handler dispatch.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use conveyor_common::config::BreakerConfig;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation — all calls pass through.
    Closed,
    /// Breaker tripped — calls are rejected.
    Open,
    /// Cooldown elapsed — probe calls allowed.
    HalfOpen,
}

/// Sliding-window circuit breaker: opens when the error ratio over the
/// last `window` outcomes crosses the threshold, probes after cooldown,
/// and closes again on consecutive probe successes.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    /// Uses std::sync::Mutex because it is never held across await points.
    inner: Mutex<CircuitInner>,
}

struct CircuitInner {
    state: CircuitState,
    outcomes: VecDeque<bool>,
    errors: u32,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                errors: 0,
                opened_at: None,
                half_open_successes: 0,
            }),
        }
    }

    /// Check whether a call should be allowed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |t| t.elapsed().as_millis() as u64 >= self.config.cooldown_ms);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    tracing::info!(
                        circuit = %self.name,
                        "Circuit breaker transitioning to half-open"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a call outcome and drive state transitions.
    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock().unwrap();

        inner.outcomes.push_back(success);
        if !success {
            inner.errors += 1;
        }
        while inner.outcomes.len() > self.config.window as usize {
            if let Some(evicted) = inner.outcomes.pop_front() {
                if !evicted {
                    inner.errors -= 1;
                }
            }
        }

        match inner.state {
            CircuitState::Closed => {
                let samples = inner.outcomes.len() as u32;
                let ratio = inner.errors as f64 / samples.max(1) as f64;
                if samples >= self.config.min_samples && ratio >= self.config.error_ratio {
                    tracing::warn!(
                        circuit = %self.name,
                        errors = inner.errors,
                        samples = samples,
                        ratio = ratio,
                        "Circuit breaker OPEN"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    metrics::counter!("breaker.trips", "circuit" => self.name.clone())
                        .increment(1);
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.close_threshold {
                        tracing::info!(
                            circuit = %self.name,
                            "Circuit breaker closing after successful probes"
                        );
                        inner.state = CircuitState::Closed;
                        inner.outcomes.clear();
                        inner.errors = 0;
                        metrics::counter!("breaker.recoveries", "circuit" => self.name.clone())
                            .increment(1);
                    }
                } else {
                    tracing::warn!(circuit = %self.name, "Probe failed, circuit breaker re-opening");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registry of breakers keyed by handler-declared dependency name.
/// Breakers are created on first use with the shared config.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        Arc::clone(breakers.entry(dependency.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(dependency, self.config.clone()))
        }))
    }

    /// Emit gauge metrics for all breaker states.
    pub fn report_metrics(&self) {
        let breakers = self.breakers.lock().unwrap();
        for breaker in breakers.values() {
            let state_value = match breaker.current_state() {
                CircuitState::Closed => 0.0,
                CircuitState::HalfOpen => 0.5,
                CircuitState::Open => 1.0,
            };
            metrics::gauge!("breaker.state", "circuit" => breaker.name().to_string())
                .set(state_value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            error_ratio: 0.5,
            min_samples: 20,
            cooldown_ms: 0,
            window: 50,
            close_threshold: 3,
        }
    }

    #[test]
    fn stays_closed_below_min_samples() {
        let breaker = CircuitBreaker::new("dep", config());
        for _ in 0..19 {
            breaker.record(false);
        }
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[test]
    fn opens_at_error_ratio_over_window() {
        let breaker = CircuitBreaker::new("dep", config());
        // 80% errors over 50 outcomes.
        for i in 0..50 {
            breaker.record(i % 5 == 0);
        }
        assert_eq!(breaker.current_state(), CircuitState::Open);
    }

    #[test]
    fn open_rejects_until_cooldown_then_probes() {
        let mut cfg = config();
        cfg.cooldown_ms = 60_000;
        let breaker = CircuitBreaker::new("dep", cfg);
        for _ in 0..20 {
            breaker.record(false);
        }
        assert_eq!(breaker.current_state(), CircuitState::Open);
        assert!(!breaker.allow());

        // Zero cooldown transitions straight to half-open on the next check.
        let breaker = CircuitBreaker::new("dep", config());
        for _ in 0..20 {
            breaker.record(false);
        }
        assert!(breaker.allow());
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);
    }

    #[test]
    fn three_consecutive_probe_successes_close() {
        let breaker = CircuitBreaker::new("dep", config());
        for _ in 0..20 {
            breaker.record(false);
        }
        assert!(breaker.allow());

        breaker.record(true);
        breaker.record(true);
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);
        breaker.record(true);
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[test]
    fn probe_failure_reopens() {
        let breaker = CircuitBreaker::new("dep", config());
        for _ in 0..20 {
            breaker.record(false);
        }
        assert!(breaker.allow());
        breaker.record(true);
        breaker.record(false);
        assert_eq!(breaker.current_state(), CircuitState::Open);
    }

    #[test]
    fn window_slides_old_errors_out() {
        let breaker = CircuitBreaker::new("dep", config());
        // Seed 10 errors, then 50 successes push them all out of the window.
        for _ in 0..10 {
            breaker.record(false);
        }
        for _ in 0..50 {
            breaker.record(true);
        }
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[test]
    fn registry_returns_same_breaker_per_dependency() {
        let registry = BreakerRegistry::new(config());
        let a = registry.get("payments");
        let b = registry.get("payments");
        assert!(Arc::ptr_eq(&a, &b));
        let c = registry.get("emails");
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
