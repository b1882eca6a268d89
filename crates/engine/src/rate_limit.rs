//! Cross-process rate limiting.
//!
//! The bucket state lives in the store and is mutated only by
//! `rate_limit.lua`, so every process sharing a scope sees one budget.
//! A fairness layer splits contended budget across configured scopes by
//! weight while guaranteeing each scope its minimum share.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use conveyor_common::config::{RateLimitConfig, RateLimitScope};
use conveyor_common::{ConveyorError, Result};

use crate::keys;
use crate::store::RedisStore;

/// Outcome of a consume call.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: f64,
    pub retry_after: Duration,
}

/// Effective bucket parameters for one scope.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScopeSettings {
    pub capacity: f64,
    pub rate_per_sec: f64,
}

/// Point-in-time limiter state for the admin stats surface.
#[derive(Clone, Debug, Serialize)]
pub struct ScopeSnapshot {
    pub scope: String,
    pub capacity: f64,
    pub rate_per_sec: f64,
    pub tokens: Option<f64>,
}

pub struct RateLimiter {
    store: RedisStore,
    tenant: String,
    default_settings: ScopeSettings,
    scopes: HashMap<String, ScopeSettings>,
}

impl RateLimiter {
    pub fn new(store: RedisStore, tenant: &str, config: &RateLimitConfig) -> Self {
        Self {
            store,
            tenant: tenant.to_string(),
            default_settings: ScopeSettings {
                capacity: config.default_capacity,
                rate_per_sec: config.default_rate_per_sec,
            },
            scopes: plan_fair_shares(&config.scopes),
        }
    }

    /// Try to take `n` tokens from the scope's bucket.
    pub async fn consume(&self, scope: &str, n: f64) -> Result<RateLimitDecision> {
        let settings = self.settings(scope);
        let bucket = keys::rate_limit(&self.tenant, scope);

        let decision = self
            .store
            .rate_limit_consume(
                &bucket,
                Utc::now().timestamp_millis(),
                n,
                settings.capacity,
                settings.rate_per_sec,
            )
            .await?;

        let outcome = if decision.allowed { "allowed" } else { "denied" };
        metrics::counter!("rate_limit.decisions", "scope" => scope.to_string(), "outcome" => outcome)
            .increment(1);

        Ok(RateLimitDecision {
            allowed: decision.allowed,
            remaining: decision.remaining,
            retry_after: decision.retry_after,
        })
    }

    /// Consume with bounded waiting: sleeps out `retry_after` hints until
    /// the deadline, then fails with `RateLimited`.
    pub async fn acquire(&self, scope: &str, n: f64, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let decision = self.consume(scope, n).await?;
            if decision.allowed {
                return Ok(());
            }

            let wait = decision.retry_after.max(Duration::from_millis(10));
            if tokio::time::Instant::now() + wait > deadline {
                return Err(ConveyorError::RateLimited {
                    scope: scope.to_string(),
                    retry_after_ms: decision.retry_after.as_millis() as u64,
                });
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Bucket state for every configured scope, for `Stats()`.
    pub async fn snapshot(&self) -> Result<Vec<ScopeSnapshot>> {
        let mut out = Vec::with_capacity(self.scopes.len());
        for (name, settings) in &self.scopes {
            let bucket = keys::rate_limit(&self.tenant, name);
            let fields = self.store.hgetall(&bucket).await?;
            out.push(ScopeSnapshot {
                scope: name.clone(),
                capacity: settings.capacity,
                rate_per_sec: settings.rate_per_sec,
                tokens: fields.get("tokens").and_then(|t| t.parse().ok()),
            });
        }
        out.sort_by(|a, b| a.scope.cmp(&b.scope));
        Ok(out)
    }

    fn settings(&self, scope: &str) -> ScopeSettings {
        self.scopes.get(scope).copied().unwrap_or(self.default_settings)
    }
}

/// Split the combined configured rate across scopes: each scope gets its
/// guaranteed floor (`min_share` of the total), and the spare budget is
/// distributed by weight. Floors summing past 1.0 are renormalized with
/// a warning.
fn plan_fair_shares(scopes: &[RateLimitScope]) -> HashMap<String, ScopeSettings> {
    if scopes.is_empty() {
        return HashMap::new();
    }

    let total_rate: f64 = scopes.iter().map(|s| s.rate_per_sec).sum();
    let total_weight: f64 = scopes.iter().map(|s| f64::from(s.weight)).sum();
    let mut share_sum: f64 = scopes.iter().map(|s| s.min_share).sum();

    let mut scale = 1.0;
    if share_sum > 1.0 {
        tracing::warn!(
            share_sum = share_sum,
            "Rate-limit min_share values sum past 1.0, renormalizing"
        );
        scale = 1.0 / share_sum;
        share_sum = 1.0;
    }

    let spare = total_rate * (1.0 - share_sum);

    scopes
        .iter()
        .map(|s| {
            // Floor the scaled share at 3 decimals so the renormalized sum
            // cannot creep back over 1.0.
            let share = (s.min_share * scale * 1000.0).floor() / 1000.0;
            let guaranteed = share * total_rate;
            let weighted = if total_weight > 0.0 {
                spare * f64::from(s.weight) / total_weight
            } else {
                0.0
            };
            (
                s.name.clone(),
                ScopeSettings {
                    capacity: s.capacity,
                    rate_per_sec: guaranteed + weighted,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(name: &str, rate: f64, weight: u32, min_share: f64) -> RateLimitScope {
        RateLimitScope {
            name: name.into(),
            capacity: rate * 2.0,
            rate_per_sec: rate,
            weight,
            min_share,
        }
    }

    #[test]
    fn spare_budget_splits_by_weight() {
        let plan = plan_fair_shares(&[
            scope("high", 50.0, 8, 0.0),
            scope("medium", 30.0, 2, 0.0),
            scope("low", 20.0, 1, 0.0),
        ]);

        // No floors: the whole 100/s budget splits 8:2:1.
        let high = plan["high"].rate_per_sec;
        let medium = plan["medium"].rate_per_sec;
        let low = plan["low"].rate_per_sec;
        assert!((high / medium - 4.0).abs() < 1e-9);
        assert!((medium / low - 2.0).abs() < 1e-9);
        assert!((high + medium + low - 100.0).abs() < 1e-9);
    }

    #[test]
    fn floors_are_guaranteed_before_weighting() {
        let plan = plan_fair_shares(&[
            scope("bulk", 90.0, 100, 0.0),
            scope("interactive", 10.0, 1, 0.2),
        ]);

        // interactive keeps at least 20% of the 100/s total.
        assert!(plan["interactive"].rate_per_sec >= 20.0);
    }

    #[test]
    fn overcommitted_floors_renormalize_to_at_most_one() {
        let plan = plan_fair_shares(&[
            scope("a", 50.0, 1, 0.8),
            scope("b", 50.0, 1, 0.6),
        ]);

        let total: f64 = plan.values().map(|s| s.rate_per_sec).sum();
        // Renormalized floors consume the whole budget, never more.
        assert!(total <= 100.0 + 1e-9);
        // Rounding direction is down, so the sum cannot exceed the budget.
        assert!(plan["a"].rate_per_sec / plan["b"].rate_per_sec > 1.0);
    }

    #[test]
    fn empty_scope_list_uses_defaults_only() {
        assert!(plan_fair_shares(&[]).is_empty());
    }
}
