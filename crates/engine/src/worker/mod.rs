//! Worker: claims jobs under heartbeat ownership, runs the handler,
//! finalizes atomically.

mod pool;

pub use pool::{WorkerDeps, WorkerPool, WorkerPoolConfig};

use std::time::Duration;

use async_trait::async_trait;

use conveyor_common::config::PriorityWeights;
use conveyor_common::types::{Job, OutboxEntry, Priority};

/// What a handler did with a job.
#[derive(Debug)]
pub enum Outcome {
    /// Done; the listed outbox entries are appended atomically with the ack.
    Success { outbox: Vec<OutboxEntry> },
    /// Worth another attempt after backoff.
    Retryable(String),
    /// Not worth retrying; straight to the DLQ.
    Fatal(String),
}

/// The injected processing capability.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, job: &Job) -> Outcome;

    /// Per-job deadline override; falls back to `worker.job_deadline_ms`.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Downstream dependency this handler calls, for circuit breaking.
    fn dependency(&self) -> &str {
        "handler"
    }
}

/// Demo handler used by the engine binary and the bench path. Interprets
/// the payload as JSON `{"sleep_ms": .., "outcome": "success|retryable|fatal"}`
/// and otherwise succeeds immediately.
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, job: &Job) -> Outcome {
        #[derive(serde::Deserialize, Default)]
        struct Directive {
            #[serde(default)]
            sleep_ms: u64,
            #[serde(default)]
            outcome: Option<String>,
        }

        let directive: Directive = serde_json::from_slice(&job.payload).unwrap_or_default();
        if directive.sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(directive.sleep_ms)).await;
        }

        match directive.outcome.as_deref() {
            Some("retryable") => Outcome::Retryable("scripted retryable failure".into()),
            Some("fatal") => Outcome::Fatal("scripted fatal failure".into()),
            _ => Outcome::Success { outbox: Vec::new() },
        }
    }

    fn dependency(&self) -> &str {
        "echo"
    }
}

/// Token buckets that spread claims across priorities by weight while
/// still preferring higher priorities, so low never starves.
pub struct WeightedRoundRobin {
    weights: [u32; 3],
    buckets: [u32; 3],
}

impl WeightedRoundRobin {
    pub fn new(weights: &PriorityWeights) -> Self {
        let weights = [
            weights.high.max(1),
            weights.medium.max(1),
            weights.low.max(1),
        ];
        Self {
            weights,
            buckets: weights,
        }
    }

    /// Priority order for the next claim: the preferred class first, the
    /// rest in dispatch order as fallbacks for when its list is empty.
    pub fn order(&mut self) -> [Priority; 3] {
        if self.buckets.iter().all(|b| *b == 0) {
            self.buckets = self.weights;
        }
        let preferred = Priority::ALL
            .into_iter()
            .enumerate()
            .find(|(i, _)| self.buckets[*i] > 0)
            .map(|(_, p)| p)
            .unwrap_or(Priority::High);

        let mut order = [preferred; 3];
        let mut n = 1;
        for p in Priority::ALL {
            if p != preferred {
                order[n] = p;
                n += 1;
            }
        }
        order
    }

    /// Charge the bucket of the priority actually claimed.
    pub fn record(&mut self, claimed: Priority) {
        let idx = Priority::ALL.iter().position(|p| *p == claimed).unwrap_or(0);
        self.buckets[idx] = self.buckets[idx].saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturated_claims_follow_the_weights() {
        let mut wrr = WeightedRoundRobin::new(&PriorityWeights {
            high: 8,
            medium: 2,
            low: 1,
        });

        let mut counts = [0u32; 3];
        // Saturation: every claim succeeds on the preferred class.
        for _ in 0..110 {
            let preferred = wrr.order()[0];
            let idx = Priority::ALL.iter().position(|p| *p == preferred).unwrap();
            counts[idx] += 1;
            wrr.record(preferred);
        }

        assert_eq!(counts, [80, 20, 10]);
    }

    #[test]
    fn fallback_order_keeps_remaining_priorities_in_dispatch_order() {
        let mut wrr = WeightedRoundRobin::new(&PriorityWeights {
            high: 1,
            medium: 1,
            low: 1,
        });

        // Exhaust high's bucket; medium becomes preferred, high and low trail.
        wrr.record(Priority::High);
        let order = wrr.order();
        assert_eq!(order[0], Priority::Medium);
        assert_eq!(order[1], Priority::High);
        assert_eq!(order[2], Priority::Low);
    }

    #[test]
    fn zero_weights_are_clamped_to_one() {
        let mut wrr = WeightedRoundRobin::new(&PriorityWeights {
            high: 0,
            medium: 0,
            low: 0,
        });
        // Still rotates instead of starving everything.
        assert_eq!(wrr.order()[0], Priority::High);
        wrr.record(Priority::High);
        assert_eq!(wrr.order()[0], Priority::Medium);
    }
}
