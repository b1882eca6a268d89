use serde::{Deserialize, Serialize};

/// Top-level system configuration, deserialized from system.toml.
///
/// Every field carries the documented default, so a sparse config file
/// (or `SystemConfig::default()` in tests) yields a runnable system.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub tenant: TenantConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub reaper: ReaperConfig,
    pub scheduler: SchedulerConfig,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub idempotency: IdempotencyConfig,
    pub payload: PayloadConfig,
    pub outbox: OutboxConfig,
    pub admin: AdminConfig,
}

/// Tenant namespace settings. All keys for a tenant share the `{tenant}`
/// hash tag so atomic scripts land on a single cluster shard.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    /// Tenant used when a job does not carry one.
    pub default: String,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            default: "default".into(),
        }
    }
}

/// Worker pool and heartbeat parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker tokio tasks in the pool.
    pub count: u32,
    /// Heartbeat key TTL. Expired = worker dead.
    pub heartbeat_ttl_ms: u64,
    /// Heartbeat refresh interval (ttl / 3, ±20% jitter applied per tick).
    pub heartbeat_tick_ms: u64,
    /// Consecutive failed renewals before the worker abandons its job.
    pub heartbeat_max_misses: u32,
    /// How long shutdown waits for in-flight jobs to finalize.
    pub shutdown_grace_ms: u64,
    /// Default per-job handler deadline; handlers may override.
    pub job_deadline_ms: u64,
    pub priority_weights: PriorityWeights,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 8,
            heartbeat_ttl_ms: 30_000,
            heartbeat_tick_ms: 10_000,
            heartbeat_max_misses: 3,
            shutdown_grace_ms: 30_000,
            job_deadline_ms: 30_000,
            priority_weights: PriorityWeights::default(),
        }
    }
}

/// Claim tokens per priority for weighted round-robin dispatch.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            high: 8,
            medium: 2,
            low: 1,
        }
    }
}

/// Retry and backoff policy. Full-jitter exponential:
/// `delay = rand(0, min(cap, base * 2^attempt))`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
    /// Optional per-priority overrides, keyed "high"/"medium"/"low".
    #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub overrides: std::collections::HashMap<String, BackoffOverride>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 60_000,
            max_attempts: 5,
            overrides: Default::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffOverride {
    pub base_ms: u64,
    pub cap_ms: u64,
}

/// Reaper paging and cadence.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub tick_ms: u64,
    pub page_size: u32,
    pub time_budget_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            tick_ms: 2_000,
            page_size: 100,
            time_budget_ms: 250,
        }
    }
}

/// Delayed-job promotion cadence.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
    pub batch_size: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            batch_size: 200,
        }
    }
}

/// Token-bucket rate limiting, enforced in the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub default_capacity: f64,
    pub default_rate_per_sec: f64,
    pub scopes: Vec<RateLimitScope>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_capacity: 100.0,
            default_rate_per_sec: 50.0,
            scopes: Vec::new(),
        }
    }
}

/// Named rate-limit scope with fairness parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitScope {
    pub name: String,
    pub capacity: f64,
    pub rate_per_sec: f64,
    /// Relative weight when classes contend.
    #[serde(default = "default_scope_weight")]
    pub weight: u32,
    /// Guaranteed floor share of the total rate, 0.0–1.0.
    #[serde(default)]
    pub min_share: f64,
}

fn default_scope_weight() -> u32 {
    1
}

/// Circuit breaker thresholds, per downstream dependency.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Error ratio over the sliding window that trips the breaker.
    pub error_ratio: f64,
    /// Minimum outcomes in the window before the ratio is meaningful.
    pub min_samples: u32,
    pub cooldown_ms: u64,
    /// Sliding window length in outcomes.
    pub window: u32,
    /// Consecutive half-open successes required to close.
    pub close_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_ratio: 0.5,
            min_samples: 20,
            cooldown_ms: 15_000,
            window: 50,
            close_threshold: 3,
        }
    }
}

/// Idempotency record retention.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Records outlive job execution by this grace period to absorb retries.
    pub grace_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            grace_ms: 86_400_000,
        }
    }
}

/// Payload limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    pub max_bytes: usize,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1_048_576,
        }
    }
}

/// Outbox drainer settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub batch_size: u32,
    pub tick_ms: u64,
    /// Topics the publisher drains.
    pub topics: Vec<String>,
    /// HTTP sink endpoint; entries are logged when unset.
    pub sink_url: Option<String>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            tick_ms: 1_000,
            topics: vec!["events".into()],
            sink_url: None,
        }
    }
}

/// Administrative surface settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// PurgeAll is refused unless this dev flag is set.
    pub allow_purge_all: bool,
    /// Shared secret confirm tokens are derived from.
    pub purge_secret: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            allow_purge_all: false,
            purge_secret: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_toml_fills_documented_defaults() {
        let config: SystemConfig = toml::from_str(
            r#"
            [worker]
            count = 2

            [[rate_limit.scopes]]
            name = "emails"
            capacity = 10.0
            rate_per_sec = 10.0
            "#,
        )
        .unwrap();

        assert_eq!(config.worker.count, 2);
        assert_eq!(config.worker.heartbeat_ttl_ms, 30_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.worker.priority_weights.high, 8);
        assert_eq!(config.rate_limit.scopes[0].weight, 1);
        assert_eq!(config.payload.max_bytes, 1_048_576);
    }
}
