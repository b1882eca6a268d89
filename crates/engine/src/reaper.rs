//! Reaper: returns jobs orphaned by dead workers to circulation.
//!
//! Walks the worker registry oldest-first in pages, bounded by a time
//! budget. All per-worker checks and moves happen inside `reclaim.lua`,
//! so a worker finalize racing a reclaim resolves to exactly one winner.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use conveyor_common::config::ReaperConfig;
use conveyor_common::Result;

use crate::backoff::jittered;
use crate::keys;
use crate::store::{ReclaimStatus, RedisStore};

/// What one reap pass did.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReapSummary {
    pub examined: u32,
    pub requeued: u32,
    pub dead_lettered: u32,
    /// Dead workers with nothing in flight, dropped from the registry.
    pub pruned: u32,
}

pub struct Reaper {
    store: RedisStore,
    tenant: String,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(store: RedisStore, tenant: &str, config: ReaperConfig) -> Self {
        Self {
            store,
            tenant: tenant.to_string(),
            config,
        }
    }

    /// Tick until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(tick_ms = self.config.tick_ms, "Reaper started");

        loop {
            let tick = jittered(
                Duration::from_millis(self.config.tick_ms),
                0.2,
                &mut rand::thread_rng(),
            );
            tokio::select! {
                _ = tokio::time::sleep(tick) => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Reap pass failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One bounded pass over the registry.
    pub async fn run_once(&self) -> Result<ReapSummary> {
        let registry = keys::registry(&self.tenant);
        let dlq = keys::dlq(&self.tenant);
        let lists = keys::priority_lists(&self.tenant);
        let budget = Duration::from_millis(self.config.time_budget_ms);
        let started = std::time::Instant::now();

        let mut summary = ReapSummary::default();
        let mut offset = 0u32;

        loop {
            let page = self
                .store
                .zrangebyscore_page(&registry, offset, self.config.page_size)
                .await?;
            if page.is_empty() {
                break;
            }

            let mut alive_in_page = 0u32;
            for worker_id in &page {
                let status = self
                    .store
                    .reclaim_worker(
                        &keys::heartbeat(&self.tenant, worker_id),
                        &keys::processing(&self.tenant, worker_id),
                        &registry,
                        &dlq,
                        &lists,
                        worker_id,
                        Utc::now().timestamp(),
                    )
                    .await?;

                summary.examined += 1;
                match status {
                    ReclaimStatus::Alive => alive_in_page += 1,
                    ReclaimStatus::Empty => summary.pruned += 1,
                    ReclaimStatus::Requeued => {
                        summary.requeued += 1;
                        tracing::warn!(worker = %worker_id, "Reclaimed orphaned job");
                        metrics::counter!("jobs.reaped", "reason" => "heartbeat_expired")
                            .increment(1);
                    }
                    ReclaimStatus::Dlq => {
                        summary.dead_lettered += 1;
                        tracing::warn!(worker = %worker_id, "Orphaned job exhausted attempts, dead-lettered");
                        metrics::counter!("jobs.reaped", "reason" => "heartbeat_expired")
                            .increment(1);
                        metrics::counter!("jobs.dead_lettered", "reason" => "max_attempts_exceeded")
                            .increment(1);
                    }
                    ReclaimStatus::Poison => {
                        summary.dead_lettered += 1;
                        tracing::error!(worker = %worker_id, "Orphaned payload unparseable, dead-lettered as poison");
                        metrics::counter!("jobs.dead_lettered", "reason" => "poison").increment(1);
                    }
                }
            }

            // Reclaims shrink the registry underneath us; only entries
            // that stayed move the page window forward.
            offset += alive_in_page;

            if (page.len() as u32) < self.config.page_size || started.elapsed() >= budget {
                break;
            }

            // Spread concurrent reapers out between pages.
            let pause = Duration::from_millis(rand::Rng::gen_range(&mut rand::thread_rng(), 250..=750));
            tokio::time::sleep(pause).await;
        }

        if summary.requeued > 0 || summary.dead_lettered > 0 {
            tracing::info!(
                examined = summary.examined,
                requeued = summary.requeued,
                dead_lettered = summary.dead_lettered,
                pruned = summary.pruned,
                "Reap pass complete"
            );
        }

        Ok(summary)
    }
}
