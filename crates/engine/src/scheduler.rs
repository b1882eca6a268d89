//! Scheduler: promotes due delayed jobs onto their priority lists.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use conveyor_common::config::SchedulerConfig;
use conveyor_common::Result;

use crate::backoff::jittered;
use crate::keys;
use crate::store::RedisStore;

pub struct Scheduler {
    store: RedisStore,
    tenant: String,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: RedisStore, tenant: &str, config: SchedulerConfig) -> Self {
        Self {
            store,
            tenant: tenant.to_string(),
            config,
        }
    }

    /// Tick until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(tick_ms = self.config.tick_ms, "Scheduler started");

        loop {
            let tick = jittered(
                Duration::from_millis(self.config.tick_ms),
                0.2,
                &mut rand::thread_rng(),
            );
            tokio::select! {
                _ = tokio::time::sleep(tick) => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Scheduler pass failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Promote one batch of due jobs. Returns the number promoted.
    pub async fn run_once(&self) -> Result<u64> {
        let promoted = self
            .store
            .schedule_due(
                &keys::delayed(&self.tenant),
                &keys::priority_lists(&self.tenant),
                Utc::now().timestamp_millis() as f64 / 1000.0,
                self.config.batch_size,
            )
            .await?;

        if promoted > 0 {
            tracing::debug!(promoted = promoted, "Promoted delayed jobs");
            metrics::counter!("jobs.promoted", "tenant" => self.tenant.clone())
                .increment(promoted);
        }

        Ok(promoted)
    }
}
