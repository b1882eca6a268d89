use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use conveyor_common::config::{PriorityWeights, SystemConfig};
use conveyor_common::types::{DlqEntry, DlqReason, IdempotencyState, Job, OutboxEntry};

use crate::backoff::{jittered, BackoffPolicy};
use crate::breaker::BreakerRegistry;
use crate::idempotency::{result_digest, BeginOutcome, IdempotencyManager};
use crate::keys;
use crate::rate_limit::RateLimiter;
use crate::store::{IdemWrite, OutboxAppend, RedisStore};
use crate::worker::{Handler, Outcome, WeightedRoundRobin};

/// Configuration for the worker pool.
#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    pub count: u32,
    pub heartbeat_ttl_ms: u64,
    pub heartbeat_tick_ms: u64,
    pub heartbeat_max_misses: u32,
    pub job_deadline_ms: u64,
    pub priority_weights: PriorityWeights,
}

impl WorkerPoolConfig {
    pub fn from_system(config: &SystemConfig) -> Self {
        Self {
            count: config.worker.count,
            heartbeat_ttl_ms: config.worker.heartbeat_ttl_ms,
            heartbeat_tick_ms: config.worker.heartbeat_tick_ms,
            heartbeat_max_misses: config.worker.heartbeat_max_misses,
            job_deadline_ms: config.worker.job_deadline_ms,
            priority_weights: config.worker.priority_weights.clone(),
        }
    }
}

/// Shared collaborators every worker task uses.
pub struct WorkerDeps {
    pub store: RedisStore,
    pub tenant: String,
    pub backoff: BackoffPolicy,
    pub breakers: Arc<BreakerRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub idempotency: Arc<IdempotencyManager>,
}

/// Pool of worker tasks consuming jobs from the priority lists.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Start `count` workers against the shared dependencies.
    pub fn start(
        config: WorkerPoolConfig,
        deps: Arc<WorkerDeps>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = Arc::new(config);

        let mut workers = Vec::with_capacity(config.count as usize);
        for i in 0..config.count {
            let worker_id = format!("worker-{}-{}", i, &uuid::Uuid::new_v4().simple().to_string()[..8]);
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                shutdown_rx.clone(),
                Arc::clone(&config),
                Arc::clone(&deps),
                Arc::clone(&handler),
            )));
        }

        tracing::info!(pool_size = config.count, "Worker pool started");

        Self {
            workers,
            shutdown_tx,
        }
    }

    /// Signal all workers to stop claiming.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        tracing::info!("Worker pool shutdown signaled");
    }

    /// Wait for all workers to finish their in-flight jobs and exit.
    pub async fn join(self) {
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

/// Per-worker key bundle, computed once.
struct WorkerKeys {
    lists: [String; 3],
    processing: String,
    heartbeat: String,
    registry: String,
    dlq: String,
    delayed: String,
    idem_placeholder: String,
}

impl WorkerKeys {
    fn new(tenant: &str, worker_id: &str, idem_placeholder: String) -> Self {
        Self {
            lists: keys::priority_lists(tenant),
            processing: keys::processing(tenant, worker_id),
            heartbeat: keys::heartbeat(tenant, worker_id),
            registry: keys::registry(tenant),
            dlq: keys::dlq(tenant),
            delayed: keys::delayed(tenant),
            idem_placeholder,
        }
    }
}

/// Main loop for a single worker.
async fn worker_loop(
    worker_id: String,
    shutdown_rx: watch::Receiver<bool>,
    config: Arc<WorkerPoolConfig>,
    deps: Arc<WorkerDeps>,
    handler: Arc<dyn Handler>,
) {
    tracing::info!(worker = %worker_id, "Worker started");

    let wk = WorkerKeys::new(
        &deps.tenant,
        &worker_id,
        deps.idempotency.placeholder_key(),
    );
    let mut wrr = WeightedRoundRobin::new(&config.priority_weights);

    loop {
        if *shutdown_rx.borrow() {
            tracing::info!(worker = %worker_id, "Worker shutting down");
            break;
        }

        let raw = match claim_one(&deps.store, &wk, &mut wrr, &worker_id, &config).await {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(worker = %worker_id, error = %e, "Claim failed");
                tokio::time::sleep(Duration::from_secs(if e.is_transient() { 1 } else { 5 }))
                    .await;
                continue;
            }
        };

        let job: Job = match serde_json::from_str(&raw) {
            Ok(job) => job,
            Err(e) => {
                // A payload we cannot parse would crash-loop forever;
                // quarantine it instead of letting it circulate.
                tracing::error!(worker = %worker_id, error = %e, "Poison payload, dead-lettering");
                let wrapper = serde_json::json!({ "dlq_reason": "poison", "raw": raw });
                let outcome = deps
                    .store
                    .dead_letter(
                        &wk.processing,
                        &wk.heartbeat,
                        &wk.dlq,
                        &wk.idem_placeholder,
                        &worker_id,
                        &raw,
                        &wrapper.to_string(),
                        None,
                    )
                    .await;
                if let Err(e) = outcome {
                    tracing::error!(worker = %worker_id, error = %e, "Poison dead-letter failed");
                }
                metrics::counter!("jobs.dead_lettered", "reason" => "poison").increment(1);
                continue;
            }
        };

        wrr.record(job.priority);
        metrics::gauge!("workers.active").increment(1.0);
        process_job(&deps, &config, &handler, &worker_id, &wk, raw, job).await;
        metrics::gauge!("workers.active").decrement(1.0);
    }
}

/// One claim round: atomic multi-list script first, then a short
/// blocking wait on the preferred list so idle workers do not spin.
async fn claim_one(
    store: &RedisStore,
    wk: &WorkerKeys,
    wrr: &mut WeightedRoundRobin,
    worker_id: &str,
    config: &WorkerPoolConfig,
) -> Result<Option<String>, crate::store::StoreError> {
    let order = wrr.order();
    let ordered: [String; 3] = order.map(|p| {
        let idx = conveyor_common::types::Priority::ALL
            .iter()
            .position(|q| *q == p)
            .unwrap_or(0);
        wk.lists[idx].clone()
    });

    if let Some(raw) = store
        .claim_job(
            &ordered,
            &wk.processing,
            &wk.heartbeat,
            &wk.registry,
            worker_id,
            config.heartbeat_ttl_ms,
            Utc::now().timestamp(),
        )
        .await?
    {
        return Ok(Some(raw));
    }

    // Everything was empty; block briefly on the preferred list. The
    // heartbeat is armed before the blocking move: the reaper keys off
    // the heartbeat, so a job must never land on the processing list
    // ahead of it. The blocking timeout is far below the TTL.
    let owned = store
        .take_ownership(
            &wk.heartbeat,
            &wk.registry,
            worker_id,
            config.heartbeat_ttl_ms,
            Utc::now().timestamp(),
        )
        .await?;
    if !owned {
        // Heartbeat key held by someone else: protocol bug, do not
        // claim under a foreign heartbeat.
        tracing::error!(worker = %worker_id, "Heartbeat key is foreign before blocking claim");
        return Ok(None);
    }

    // The short timeout keeps the shutdown check responsive; an idle
    // worker re-arms on its next round and the key self-expires on crash.
    let Some(raw) = store
        .blmove(&ordered[0], &wk.processing, Duration::from_millis(100))
        .await?
    else {
        return Ok(None);
    };

    // Refresh the TTL now that a job actually landed.
    store
        .take_ownership(
            &wk.heartbeat,
            &wk.registry,
            worker_id,
            config.heartbeat_ttl_ms,
            Utc::now().timestamp(),
        )
        .await?;

    Ok(Some(raw))
}

async fn process_job(
    deps: &Arc<WorkerDeps>,
    config: &WorkerPoolConfig,
    handler: &Arc<dyn Handler>,
    worker_id: &str,
    wk: &WorkerKeys,
    raw: String,
    job: Job,
) {
    let trace = job
        .trace_context
        .as_ref()
        .map(|t| t.traceparent.clone())
        .unwrap_or_default();
    tracing::info!(
        worker = %worker_id,
        job_id = %job.id,
        priority = job.priority.as_str(),
        attempt = job.attempt,
        traceparent = %trace,
        "Processing job"
    );

    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    let (lost_tx, lost_rx) = watch::channel(false);
    let hb_handle = tokio::spawn(heartbeat_task(
        deps.store.clone(),
        wk.heartbeat.clone(),
        wk.registry.clone(),
        worker_id.to_string(),
        config.heartbeat_ttl_ms,
        config.heartbeat_tick_ms,
        config.heartbeat_max_misses,
        lost_tx,
        cancel_rx,
    ));

    execute(deps, config, handler, worker_id, wk, raw, job, lost_rx).await;

    let _ = cancel_tx.send(());
    let _ = hb_handle.await;
}

/// The claim-to-finalize pipeline for one job. Early returns leave the
/// heartbeat task to the caller's cleanup.
#[allow(clippy::too_many_arguments)]
async fn execute(
    deps: &Arc<WorkerDeps>,
    config: &WorkerPoolConfig,
    handler: &Arc<dyn Handler>,
    worker_id: &str,
    wk: &WorkerKeys,
    raw: String,
    job: Job,
    mut lost_rx: watch::Receiver<bool>,
) {
    let started = std::time::Instant::now();

    // Idempotency short-circuit: a prior `done` means the side effects
    // already happened; ack the redelivery without invoking the handler.
    if let Some(user_key) = job.idempotency_key.as_deref() {
        match deps
            .idempotency
            .begin(job.priority.as_str(), user_key, &job.id.to_string())
            .await
        {
            Ok(BeginOutcome::Duplicate(record)) if record.state == IdempotencyState::Done => {
                // The cached digest identifies the original result; the
                // redelivery resolves to it instead of re-running.
                tracing::info!(
                    worker = %worker_id,
                    job_id = %job.id,
                    idempotency_key = user_key,
                    original_job_id = record.job_id.as_deref().unwrap_or(""),
                    result_digest = record.result_digest.as_deref().unwrap_or(""),
                    "Prior completion found, acking with the original result"
                );
                let acked = deps
                    .store
                    .ack_success(
                        &wk.processing,
                        &wk.heartbeat,
                        &wk.idem_placeholder,
                        worker_id,
                        &raw,
                        &[],
                        None,
                    )
                    .await;
                if let Err(e) = acked {
                    tracing::error!(worker = %worker_id, error = %e, "Dedup ack failed");
                }
                record_processed(&job, &deps.tenant, "deduplicated", started);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                // At-least-once delivery wins over dedup precision here.
                tracing::warn!(worker = %worker_id, error = %e, "Idempotency begin failed, proceeding");
            }
        }
    }

    // Circuit breaker: an open downstream means requeue, not failure.
    let breaker = deps.breakers.get(handler.dependency());
    if !breaker.allow() {
        let delay = deps
            .backoff
            .delay(job.priority, job.attempt, &mut rand::thread_rng());
        requeue_unchanged(deps, wk, worker_id, &raw, &job, delay, "circuit_open").await;
        return;
    }

    // Rate limit per priority class; denial carries the retry hint.
    match deps.limiter.consume(job.priority.as_str(), 1.0).await {
        Ok(decision) if !decision.allowed => {
            let delay = decision.retry_after.max(Duration::from_millis(50));
            requeue_unchanged(deps, wk, worker_id, &raw, &job, delay, "rate_limited").await;
            return;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(worker = %worker_id, error = %e, "Rate limiter unavailable, proceeding");
        }
    }

    let deadline = handler
        .timeout()
        .unwrap_or(Duration::from_millis(config.job_deadline_ms));

    let outcome = tokio::select! {
        outcome = handler.handle(&job) => outcome,
        _ = tokio::time::sleep(deadline) => {
            Outcome::Retryable(format!("job deadline of {:?} exceeded", deadline))
        }
        _ = lost_rx.changed() => {
            // Ownership is gone; the reaper may already be requeueing
            // this job. Finalizing now could double-process it.
            tracing::error!(
                worker = %worker_id,
                job_id = %job.id,
                "Heartbeat lost mid-job, abandoning without finalize"
            );
            metrics::counter!("jobs.abandoned", "tenant" => deps.tenant.clone()).increment(1);
            return;
        }
    };

    breaker.record(matches!(outcome, Outcome::Success { .. }));

    match outcome {
        Outcome::Success { outbox } => {
            finalize_success(deps, wk, worker_id, &raw, &job, outbox, started).await;
        }
        Outcome::Retryable(err) => {
            tracing::warn!(worker = %worker_id, job_id = %job.id, error = %err, "Handler failed, retrying");
            finalize_retry(deps, wk, worker_id, &raw, &job, started).await;
        }
        Outcome::Fatal(err) => {
            tracing::error!(worker = %worker_id, job_id = %job.id, error = %err, "Handler failed fatally");
            finalize_dead_letter(
                deps,
                wk,
                worker_id,
                &raw,
                job.clone(),
                DlqReason::HandlerFatal,
                started,
            )
            .await;
        }
    }
}

async fn finalize_success(
    deps: &Arc<WorkerDeps>,
    wk: &WorkerKeys,
    worker_id: &str,
    raw: &str,
    job: &Job,
    outbox: Vec<OutboxEntry>,
    started: std::time::Instant,
) {
    let mut appends: Vec<OutboxAppend> = Vec::new();
    for entry in &outbox {
        let serialized = match serde_json::to_string(entry) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Outbox entry failed to serialize, dropping");
                continue;
            }
        };
        let key = keys::outbox(&deps.tenant, &entry.topic);
        match appends.iter_mut().find(|a| a.key == key) {
            Some(append) => append.entries.push(serialized),
            None => appends.push(OutboxAppend {
                key,
                entries: vec![serialized],
            }),
        }
    }

    let digest = result_digest(
        &serde_json::to_vec(&outbox).unwrap_or_default(),
    );
    let idem = job.idempotency_key.as_deref().map(|user_key| IdemWrite {
        key: deps
            .idempotency
            .record_key(job.priority.as_str(), user_key),
        result_digest: digest,
        grace_ms: deps.idempotency.grace_ms(),
        job_id: job.id.to_string(),
    });

    match deps
        .store
        .ack_success(
            &wk.processing,
            &wk.heartbeat,
            &wk.idem_placeholder,
            worker_id,
            raw,
            &appends,
            idem.as_ref(),
        )
        .await
    {
        Ok(true) => {
            tracing::info!(job_id = %job.id, "Job completed");
            record_processed(job, &deps.tenant, "success", started);
        }
        Ok(false) => ownership_lost(job, &deps.tenant),
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "Success finalize failed");
            metrics::counter!("jobs.finalize_errors", "tenant" => deps.tenant.clone()).increment(1);
        }
    }
}

async fn finalize_retry(
    deps: &Arc<WorkerDeps>,
    wk: &WorkerKeys,
    worker_id: &str,
    raw: &str,
    job: &Job,
    started: std::time::Instant,
) {
    // Attempt increments exactly here, at retry decision time.
    let mut next = job.clone();
    next.attempt = job.attempt + 1;

    if next.attempt >= next.max_attempts {
        finalize_dead_letter(
            deps,
            wk,
            worker_id,
            raw,
            next,
            DlqReason::MaxAttemptsExceeded,
            started,
        )
        .await;
        return;
    }

    let delay = deps
        .backoff
        .delay(next.priority, next.attempt, &mut rand::thread_rng());
    let next_raw = match serde_json::to_string(&next) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "Retry payload failed to serialize");
            return;
        }
    };

    match deps
        .store
        .retry_job(
            &wk.processing,
            &wk.heartbeat,
            &next.origin_queue,
            &wk.delayed,
            worker_id,
            raw,
            &next_raw,
            delay.as_millis() as u64,
            Utc::now().timestamp_millis(),
        )
        .await
    {
        Ok(true) => {
            tracing::info!(
                job_id = %job.id,
                attempt = next.attempt,
                delay_ms = delay.as_millis() as u64,
                "Job requeued for retry"
            );
            record_processed(job, &deps.tenant, "retried", started);
        }
        Ok(false) => ownership_lost(job, &deps.tenant),
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "Retry finalize failed");
            metrics::counter!("jobs.finalize_errors", "tenant" => deps.tenant.clone()).increment(1);
        }
    }
}

async fn finalize_dead_letter(
    deps: &Arc<WorkerDeps>,
    wk: &WorkerKeys,
    worker_id: &str,
    raw: &str,
    job: Job,
    reason: DlqReason,
    started: std::time::Instant,
) {
    let idem = job.idempotency_key.as_deref().map(|user_key| IdemWrite {
        key: deps.idempotency.record_key(job.priority.as_str(), user_key),
        result_digest: String::new(),
        grace_ms: deps.idempotency.grace_ms(),
        job_id: job.id.to_string(),
    });

    let entry = DlqEntry {
        job,
        dlq_reason: reason,
    };
    let dlq_raw = match serde_json::to_string(&entry) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(job_id = %entry.job.id, error = %e, "DLQ entry failed to serialize");
            return;
        }
    };

    match deps
        .store
        .dead_letter(
            &wk.processing,
            &wk.heartbeat,
            &wk.dlq,
            &wk.idem_placeholder,
            worker_id,
            raw,
            &dlq_raw,
            idem.as_ref(),
        )
        .await
    {
        Ok(true) => {
            tracing::warn!(
                job_id = %entry.job.id,
                reason = reason.as_str(),
                attempt = entry.job.attempt,
                "Job dead-lettered"
            );
            metrics::counter!("jobs.dead_lettered", "reason" => reason.as_str()).increment(1);
            record_processed(&entry.job, &deps.tenant, "dead_lettered", started);
        }
        Ok(false) => ownership_lost(&entry.job, &deps.tenant),
        Err(e) => {
            tracing::error!(job_id = %entry.job.id, error = %e, "Dead-letter finalize failed");
            metrics::counter!("jobs.finalize_errors", "tenant" => deps.tenant.clone()).increment(1);
        }
    }
}

/// Requeue without consuming an attempt (circuit open, rate limited).
async fn requeue_unchanged(
    deps: &Arc<WorkerDeps>,
    wk: &WorkerKeys,
    worker_id: &str,
    raw: &str,
    job: &Job,
    delay: Duration,
    reason: &'static str,
) {
    match deps
        .store
        .retry_job(
            &wk.processing,
            &wk.heartbeat,
            &job.origin_queue,
            &wk.delayed,
            worker_id,
            raw,
            raw,
            delay.as_millis() as u64,
            Utc::now().timestamp_millis(),
        )
        .await
    {
        Ok(true) => {
            tracing::debug!(
                job_id = %job.id,
                reason = reason,
                delay_ms = delay.as_millis() as u64,
                "Job requeued without attempt charge"
            );
            metrics::counter!("jobs.requeued", "reason" => reason).increment(1);
        }
        Ok(false) => ownership_lost(job, &deps.tenant),
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, reason = reason, "Requeue failed");
            metrics::counter!("jobs.finalize_errors", "tenant" => deps.tenant.clone()).increment(1);
        }
    }
}

fn ownership_lost(job: &Job, tenant: &str) {
    // The reaper observed our expired heartbeat first; it owns the job now.
    tracing::warn!(job_id = %job.id, "Finalize skipped, heartbeat ownership lost");
    metrics::counter!("jobs.finalize_lost", "tenant" => tenant.to_string()).increment(1);
}

fn record_processed(job: &Job, tenant: &str, outcome: &'static str, started: std::time::Instant) {
    metrics::counter!(
        "jobs.processed",
        "priority" => job.priority.as_str(),
        "tenant" => tenant.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(
        "jobs.process_seconds",
        "priority" => job.priority.as_str(),
        "outcome" => outcome
    )
    .record(started.elapsed().as_secs_f64());
}

/// Detached heartbeat renewal. Signals loss after `max_misses`
/// consecutive failed renewals, or immediately when the key no longer
/// holds this worker's id.
#[allow(clippy::too_many_arguments)]
async fn heartbeat_task(
    store: RedisStore,
    heartbeat_key: String,
    registry_key: String,
    worker_id: String,
    ttl_ms: u64,
    tick_ms: u64,
    max_misses: u32,
    lost_tx: watch::Sender<bool>,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut misses = 0u32;

    loop {
        let tick = jittered(
            Duration::from_millis(tick_ms),
            0.2,
            &mut rand::thread_rng(),
        );
        tokio::select! {
            _ = tokio::time::sleep(tick) => {
                let renewed = store
                    .renew_heartbeat(
                        &heartbeat_key,
                        &registry_key,
                        &worker_id,
                        ttl_ms,
                        Utc::now().timestamp(),
                    )
                    .await;
                match renewed {
                    Ok(true) => misses = 0,
                    Ok(false) => {
                        tracing::warn!(
                            worker = %worker_id,
                            "Heartbeat key expired or foreign, signaling loss"
                        );
                        let _ = lost_tx.send(true);
                        break;
                    }
                    Err(e) => {
                        misses += 1;
                        tracing::warn!(
                            worker = %worker_id,
                            error = %e,
                            misses = misses,
                            "Failed to renew heartbeat"
                        );
                        if misses >= max_misses {
                            let _ = lost_tx.send(true);
                            break;
                        }
                    }
                }
            }
            _ = &mut cancel => {
                break;
            }
        }
    }
}
