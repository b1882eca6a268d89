//! Outbox publisher: drains side-effect intents to an external sink.
//!
//! Entries are appended by the success finalize script and removed here
//! only after the sink acknowledges, so a crash between the two leaves
//! the entry in place for redelivery (at-least-once toward the sink).
//! Per-topic FIFO assumes one publisher per tenant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use conveyor_common::config::OutboxConfig;
use conveyor_common::types::{OutboxEntry, OutboxStatus};
use conveyor_common::Result;

use crate::backoff::jittered;
use crate::keys;
use crate::store::RedisStore;

/// Transport the publisher hands batches to.
#[async_trait]
pub trait OutboxSink: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        entries: &[OutboxEntry],
    ) -> std::result::Result<(), String>;
}

/// POSTs each batch as JSON to a fixed endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl OutboxSink for HttpSink {
    async fn publish(
        &self,
        topic: &str,
        entries: &[OutboxEntry],
    ) -> std::result::Result<(), String> {
        let body = serde_json::json!({ "topic": topic, "entries": entries });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("sink returned {}", response.status()));
        }
        Ok(())
    }
}

/// Development sink: logs entries instead of delivering them.
pub struct LogSink;

#[async_trait]
impl OutboxSink for LogSink {
    async fn publish(
        &self,
        topic: &str,
        entries: &[OutboxEntry],
    ) -> std::result::Result<(), String> {
        for entry in entries {
            tracing::info!(
                topic = topic,
                entry_id = %entry.entry_id,
                job_id = %entry.job_id,
                "Outbox entry published (log sink)"
            );
        }
        Ok(())
    }
}

pub struct OutboxPublisher {
    store: RedisStore,
    tenant: String,
    config: OutboxConfig,
    sink: Arc<dyn OutboxSink>,
}

impl OutboxPublisher {
    pub fn new(
        store: RedisStore,
        tenant: &str,
        config: OutboxConfig,
        sink: Arc<dyn OutboxSink>,
    ) -> Self {
        Self {
            store,
            tenant: tenant.to_string(),
            config,
            sink,
        }
    }

    /// Tick until shutdown, draining every configured topic. Failed
    /// topics back off exponentially without stalling the others.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(
            topics = ?self.config.topics,
            tick_ms = self.config.tick_ms,
            "Outbox publisher started"
        );

        #[derive(Default)]
        struct TopicState {
            skip_ticks: u32,
            failures: u32,
        }
        let mut states: HashMap<String, TopicState> = HashMap::new();

        loop {
            let tick = jittered(
                Duration::from_millis(self.config.tick_ms),
                0.2,
                &mut rand::thread_rng(),
            );
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Outbox publisher shutting down");
                        break;
                    }
                }
            }

            for topic in &self.config.topics {
                let state = states.entry(topic.clone()).or_default();
                if state.skip_ticks > 0 {
                    state.skip_ticks -= 1;
                    continue;
                }

                match self.drain_topic(topic).await {
                    Ok(published) => {
                        state.failures = 0;
                        if published > 0 {
                            tracing::debug!(topic = %topic, published = published, "Drained outbox");
                        }
                    }
                    Err(e) => {
                        // Skip ticks while the sink recovers: 2, 4, 8... up to 32.
                        state.failures = state.failures.saturating_add(1);
                        state.skip_ticks = 2u32.saturating_pow(state.failures.min(5));
                        tracing::warn!(
                            topic = %topic,
                            error = %e,
                            skip_ticks = state.skip_ticks,
                            "Outbox publish failed, backing off"
                        );
                    }
                }
            }
        }
    }

    /// Drain one topic down to empty or the first sink failure.
    pub async fn drain_topic(&self, topic: &str) -> Result<u64> {
        let key = keys::outbox(&self.tenant, topic);
        let batch = self.config.batch_size as i64;
        let mut published = 0u64;

        loop {
            let raws = self.store.lrange(&key, 0, batch - 1).await?;
            if raws.is_empty() {
                break;
            }

            let mut entries: Vec<OutboxEntry> = Vec::with_capacity(raws.len());
            for raw in &raws {
                match serde_json::from_str::<OutboxEntry>(raw) {
                    Ok(mut entry) => {
                        entry.status = OutboxStatus::Published;
                        entries.push(entry);
                    }
                    Err(e) => {
                        // Unparseable entries would wedge the topic; drop
                        // them loudly rather than redeliver forever.
                        tracing::error!(topic = %topic, error = %e, "Dropping corrupt outbox entry");
                        metrics::counter!("outbox.corrupt", "topic" => topic.to_string())
                            .increment(1);
                    }
                }
            }

            if !entries.is_empty() {
                self.sink
                    .publish(topic, &entries)
                    .await
                    .map_err(conveyor_common::ConveyorError::StoreTransient)?;
            }

            // Remove only what the sink acknowledged.
            self.store.lpop_count(&key, raws.len() as u32).await?;
            published += entries.len() as u64;
            metrics::counter!("outbox.published", "topic" => topic.to_string())
                .increment(entries.len() as u64);

            if (raws.len() as i64) < batch {
                break;
            }
        }

        Ok(published)
    }
}
