//! Administrative core operations: stats, peek, requeue, purge, bench.
//!
//! The HTTP surface in `main` is a thin shell over these; destructive
//! operations demand a confirmation token derived from the configured
//! secret (the core validates tokens, it does not mint them).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use conveyor_common::config::AdminConfig;
use conveyor_common::types::{DlqEntry, Job, Priority};
use conveyor_common::{ConveyorError, Result};

use crate::keys;
use crate::producer::Producer;
use crate::rate_limit::{RateLimiter, ScopeSnapshot};
use crate::store::RedisStore;

/// Cap on workers inspected for the in-flight count.
const INFLIGHT_SCAN_CAP: u32 = 512;
/// Cap on DLQ entries scanned when requeueing by id.
const REQUEUE_SCAN_CAP: u32 = 1_000;

#[derive(Clone, Debug, Serialize)]
pub struct QueueStats {
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub delayed: u64,
    pub dlq_length: u64,
    /// Age of the next DLQ entry to be served, if any.
    pub dlq_oldest_age_seconds: Option<i64>,
    pub worker_count: u64,
    pub inflight_count: u64,
    pub rate_limits: Vec<ScopeSnapshot>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BenchRequest {
    pub count: u32,
    pub rate_per_sec: f64,
    pub priority: Priority,
    pub timeout_ms: u64,
}

/// Bench results. Percentiles are enqueue round-trip latencies;
/// completion is inferred from queue drain relative to the baseline.
#[derive(Clone, Debug, Serialize)]
pub struct BenchReport {
    pub enqueued: u64,
    pub completed: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

pub struct AdminApi {
    store: RedisStore,
    tenant: String,
    limiter: Arc<RateLimiter>,
    producer: Arc<Producer>,
    config: AdminConfig,
}

impl AdminApi {
    pub fn new(
        store: RedisStore,
        tenant: &str,
        limiter: Arc<RateLimiter>,
        producer: Arc<Producer>,
        config: AdminConfig,
    ) -> Self {
        Self {
            store,
            tenant: tenant.to_string(),
            limiter,
            producer,
            config,
        }
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let lists = keys::priority_lists(&self.tenant);
        let high = self.store.llen(&lists[0]).await?;
        let medium = self.store.llen(&lists[1]).await?;
        let low = self.store.llen(&lists[2]).await?;
        let delayed = self.store.zcard(&keys::delayed(&self.tenant)).await?;

        let dlq_key = keys::dlq(&self.tenant);
        let dlq_length = self.store.llen(&dlq_key).await?;
        let dlq_oldest_age_seconds = match self.store.lindex_back(&dlq_key).await? {
            Some(raw) => serde_json::from_str::<DlqEntry>(&raw)
                .ok()
                .map(|entry| (Utc::now() - entry.job.enqueued_at).num_seconds()),
            None => None,
        };

        let registry = keys::registry(&self.tenant);
        let worker_count = self.store.zcard(&registry).await?;

        let mut inflight_count = 0u64;
        let workers = self
            .store
            .zrangebyscore_page(&registry, 0, INFLIGHT_SCAN_CAP)
            .await?;
        for worker_id in &workers {
            inflight_count += self
                .store
                .llen(&keys::processing(&self.tenant, worker_id))
                .await?;
        }

        Ok(QueueStats {
            high,
            medium,
            low,
            delayed,
            dlq_length,
            dlq_oldest_age_seconds,
            worker_count,
            inflight_count,
            rate_limits: self.limiter.snapshot().await?,
        })
    }

    /// Window into a queue without consuming. `queue` is a priority
    /// name, `dlq`, or `delayed`.
    pub async fn peek(
        &self,
        queue: &str,
        start: i64,
        count: i64,
    ) -> Result<Vec<serde_json::Value>> {
        let count = count.clamp(1, 100);
        let stop = start + count - 1;

        let raws = match queue {
            "high" | "medium" | "low" => {
                let priority: Priority = queue.parse().map_err(ConveyorError::Validation)?;
                self.store
                    .lrange(&keys::priority_list(&self.tenant, priority), start, stop)
                    .await?
            }
            "dlq" => self.store.lrange(&keys::dlq(&self.tenant), start, stop).await?,
            "delayed" => self.store.zrange(&keys::delayed(&self.tenant), start, stop).await?,
            other => {
                return Err(ConveyorError::Validation(format!(
                    "unknown queue: {}",
                    other
                )))
            }
        };

        Ok(raws
            .iter()
            .filter_map(|raw| match serde_json::from_str(raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(queue = queue, error = %e, "Skipping unparseable entry in peek");
                    None
                }
            })
            .collect())
    }

    /// Move a dead-lettered job back onto its origin queue with a fresh
    /// attempt budget.
    pub async fn requeue(&self, job_id: &str) -> Result<()> {
        let moved = self
            .store
            .requeue_from_dlq(
                &keys::dlq(&self.tenant),
                &keys::priority_lists(&self.tenant),
                job_id,
                REQUEUE_SCAN_CAP,
            )
            .await?;

        if !moved {
            return Err(ConveyorError::NotFound(format!(
                "job {} not found in DLQ",
                job_id
            )));
        }

        tracing::info!(job_id = job_id, "Requeued job from DLQ");
        metrics::counter!("jobs.requeued", "reason" => "operator").increment(1);
        Ok(())
    }

    /// Drop every DLQ entry. Destructive; requires a valid token.
    pub async fn purge_dlq(&self, confirm_token: &str) -> Result<u64> {
        self.verify_token(confirm_token)?;
        let purged = self.store.purge_key(&keys::dlq(&self.tenant)).await?;
        tracing::warn!(purged = purged, "DLQ purged");
        metrics::counter!("admin.purged", "target" => "dlq").increment(purged);
        Ok(purged)
    }

    /// Drop every queue key for the tenant. Dev-only; refused unless the
    /// config flag is set, on top of the token check.
    pub async fn purge_all(&self, confirm_token: &str) -> Result<u64> {
        if !self.config.allow_purge_all {
            return Err(ConveyorError::Validation(
                "purge_all is disabled; set admin.allow_purge_all".into(),
            ));
        }
        self.verify_token(confirm_token)?;

        let mut purged = 0u64;
        for key in keys::priority_lists(&self.tenant) {
            purged += self.store.purge_key(&key).await?;
        }
        purged += self.store.purge_key(&keys::delayed(&self.tenant)).await?;
        purged += self.store.purge_key(&keys::dlq(&self.tenant)).await?;

        tracing::warn!(purged = purged, "All queues purged");
        metrics::counter!("admin.purged", "target" => "all").increment(purged);
        Ok(purged)
    }

    /// Enqueue `count` scripted no-op jobs at the requested rate and
    /// watch the queues drain.
    pub async fn bench(&self, request: BenchRequest) -> Result<BenchReport> {
        if request.count == 0 || request.rate_per_sec <= 0.0 {
            return Err(ConveyorError::Validation(
                "bench needs count > 0 and rate_per_sec > 0".into(),
            ));
        }

        let list = keys::priority_list(&self.tenant, request.priority);
        let baseline = self.store.llen(&list).await?;
        let gap = Duration::from_secs_f64(1.0 / request.rate_per_sec);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(request.timeout_ms);

        let mut latencies_ms: Vec<f64> = Vec::with_capacity(request.count as usize);
        let mut enqueued = 0u64;

        for _ in 0..request.count {
            let job = Job::new(request.priority, b"{}".to_vec());
            let started = std::time::Instant::now();
            self.producer.enqueue(job).await?;
            latencies_ms.push(started.elapsed().as_secs_f64() * 1_000.0);
            enqueued += 1;

            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(gap).await;
        }

        // Wait for the backlog to return to its baseline.
        let mut remaining = self.store.llen(&list).await?.saturating_sub(baseline);
        while remaining > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
            remaining = self.store.llen(&list).await?.saturating_sub(baseline);
        }

        latencies_ms.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Ok(BenchReport {
            enqueued,
            completed: enqueued.saturating_sub(remaining),
            p50_ms: percentile(&latencies_ms, 50.0),
            p95_ms: percentile(&latencies_ms, 95.0),
            p99_ms: percentile(&latencies_ms, 99.0),
        })
    }

    fn verify_token(&self, token: &str) -> Result<()> {
        if verify_confirm_token(&self.config.purge_secret, token) {
            Ok(())
        } else {
            Err(ConveyorError::Validation(
                "invalid confirmation token".into(),
            ))
        }
    }
}

/// A token is valid when it equals the hex SHA-256 of
/// `"{secret}:{YYYY-MM-DD}"` for today (UTC). An empty secret refuses
/// everything.
pub fn verify_confirm_token(secret: &str, token: &str) -> bool {
    if secret.is_empty() || token.is_empty() {
        return false;
    }
    token == mint_for_date(secret, &Utc::now().format("%Y-%m-%d").to_string())
}

fn mint_for_date(secret: &str, date: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", secret, date).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_secret_refuses_all_tokens() {
        assert!(!verify_confirm_token("", "anything"));
        assert!(!verify_confirm_token("secret", ""));
    }

    #[test]
    fn token_for_today_verifies() {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let token = mint_for_date("s3cret", &today);
        assert!(verify_confirm_token("s3cret", &token));
        assert!(!verify_confirm_token("other", &token));
        assert!(!verify_confirm_token("s3cret", "deadbeef"));
    }

    #[test]
    fn percentile_picks_from_sorted_samples() {
        let samples = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(percentile(&samples, 50.0), 6.0);
        assert_eq!(percentile(&samples, 99.0), 10.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
