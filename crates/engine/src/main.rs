use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use tokio::sync::watch;

use conveyor_common::types::{Job, Priority};
use conveyor_common::ConveyorError;
use conveyor_engine::admin::{AdminApi, BenchRequest};
use conveyor_engine::backoff::BackoffPolicy;
use conveyor_engine::breaker::BreakerRegistry;
use conveyor_engine::config;
use conveyor_engine::idempotency::IdempotencyManager;
use conveyor_engine::outbox::{HttpSink, LogSink, OutboxPublisher, OutboxSink};
use conveyor_engine::producer::Producer;
use conveyor_engine::rate_limit::RateLimiter;
use conveyor_engine::reaper::Reaper;
use conveyor_engine::scheduler::Scheduler;
use conveyor_engine::store::RedisStore;
use conveyor_engine::worker::{EchoHandler, WorkerDeps, WorkerPool, WorkerPoolConfig};

/// Shared application state accessible from axum handlers.
struct AppState {
    store: RedisStore,
    producer: Arc<Producer>,
    admin: Arc<AdminApi>,
    metrics_handle: PrometheusHandle,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Conveyor engine starting");

    // Load configuration — fail loudly on misconfiguration.
    let config_dir = std::env::var("CONVEYOR_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"));

    let engine_config = match config::load_config(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration — refusing to start");
            std::process::exit(1);
        }
    };
    let system = engine_config.system.clone();
    let tenant = system.tenant.default.clone();

    // Install Prometheus metrics recorder.
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    // Redis is the only shared store.
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
    let store = match RedisStore::connect(&redis_url).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to Redis");
            std::process::exit(1);
        }
    };

    // Core collaborators.
    let idempotency = Arc::new(IdempotencyManager::new(
        store.clone(),
        &tenant,
        system.idempotency.grace_ms,
    ));
    let limiter = Arc::new(RateLimiter::new(store.clone(), &tenant, &system.rate_limit));
    let breakers = Arc::new(BreakerRegistry::new(system.breaker.clone()));
    let producer = Arc::new(Producer::new(
        store.clone(),
        Arc::clone(&idempotency),
        &tenant,
        system.payload.max_bytes,
    ));
    let admin = Arc::new(AdminApi::new(
        store.clone(),
        &tenant,
        Arc::clone(&limiter),
        Arc::clone(&producer),
        system.admin.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Worker pool.
    let pool = WorkerPool::start(
        WorkerPoolConfig::from_system(&system),
        Arc::new(WorkerDeps {
            store: store.clone(),
            tenant: tenant.clone(),
            backoff: BackoffPolicy::new(&system.retry),
            breakers: Arc::clone(&breakers),
            limiter: Arc::clone(&limiter),
            idempotency: Arc::clone(&idempotency),
        }),
        Arc::new(EchoHandler),
    );

    // Reaper.
    {
        let reaper = Reaper::new(store.clone(), &tenant, system.reaper.clone());
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { reaper.run(rx).await });
    }

    // Delayed-job scheduler.
    {
        let scheduler = Scheduler::new(store.clone(), &tenant, system.scheduler.clone());
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(rx).await });
    }

    // Outbox publisher.
    {
        let sink: Arc<dyn OutboxSink> = match &system.outbox.sink_url {
            Some(url) => Arc::new(HttpSink::new(url)),
            None => Arc::new(LogSink),
        };
        let publisher =
            OutboxPublisher::new(store.clone(), &tenant, system.outbox.clone(), sink);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { publisher.run(rx).await });
    }

    // Breaker state and queue depth reporters.
    {
        let breakers = Arc::clone(&breakers);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                breakers.report_metrics();
            }
        });

        let admin = Arc::clone(&admin);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                match admin.stats().await {
                    Ok(stats) => {
                        metrics::gauge!("queue.depth", "priority" => "high").set(stats.high as f64);
                        metrics::gauge!("queue.depth", "priority" => "medium")
                            .set(stats.medium as f64);
                        metrics::gauge!("queue.depth", "priority" => "low").set(stats.low as f64);
                        metrics::gauge!("queue.delayed").set(stats.delayed as f64);
                        metrics::gauge!("queue.dlq").set(stats.dlq_length as f64);
                        metrics::gauge!("workers.registered").set(stats.worker_count as f64);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Stats reporter pass failed");
                    }
                }
            }
        });
    }

    // Build HTTP surface.
    let state = Arc::new(AppState {
        store,
        producer,
        admin,
        metrics_handle,
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .route("/enqueue", post(enqueue_handler))
        .route("/queues/{queue}/peek", get(peek_handler))
        .route("/dlq/requeue", post(requeue_handler))
        .route("/dlq/purge", post(purge_dlq_handler))
        .route("/purge-all", post(purge_all_handler))
        .route("/bench", post(bench_handler))
        .with_state(state);

    let port: u16 = std::env::var("ENGINE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind TCP listener");

    tracing::info!(port = port, "Conveyor engine listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("HTTP server error");

    // Stop claiming, then give in-flight jobs the grace period. Anything
    // still running is left for the reaper once the heartbeat expires.
    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);
    pool.shutdown();
    let grace = Duration::from_millis(system.worker.shutdown_grace_ms);
    if tokio::time::timeout(grace, pool.join()).await.is_err() {
        tracing::warn!(
            grace_ms = grace.as_millis() as u64,
            "Shutdown grace expired with jobs in flight, leaving them to the reaper"
        );
    }
    tracing::info!("Conveyor engine stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn error_response(e: ConveyorError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        ConveyorError::Validation(_) => StatusCode::BAD_REQUEST,
        ConveyorError::NotFound(_) => StatusCode::NOT_FOUND,
        ConveyorError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

/// Health check endpoint.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "healthy" })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unhealthy", "error": e.to_string() })),
        ),
    }
}

/// Prometheus metrics endpoint.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.admin.stats().await {
        Ok(stats) => (StatusCode::OK, Json(serde_json::json!(stats))),
        Err(e) => error_response(e),
    }
}

/// Request body for enqueueing a job.
#[derive(Deserialize)]
struct EnqueueRequest {
    priority: Priority,
    /// Base64-encoded payload bytes.
    payload: String,
    max_attempts: Option<u32>,
    not_before: Option<chrono::DateTime<chrono::Utc>>,
    idempotency_key: Option<String>,
}

/// POST /enqueue — validate and enqueue one job.
async fn enqueue_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnqueueRequest>,
) -> impl IntoResponse {
    let payload = match BASE64.decode(req.payload.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(ConveyorError::Validation(format!(
                "payload is not valid base64: {}",
                e
            )))
        }
    };

    let mut job = Job::new(req.priority, payload);
    if let Some(max_attempts) = req.max_attempts {
        job = job.with_max_attempts(max_attempts);
    }
    if let Some(not_before) = req.not_before {
        job = job.with_not_before(not_before);
    }
    if let Some(key) = req.idempotency_key {
        job = job.with_idempotency_key(key);
    }

    match state.producer.enqueue(job).await {
        Ok(id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "id": id.to_string() })),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct PeekParams {
    #[serde(default)]
    start: i64,
    #[serde(default = "default_peek_count")]
    count: i64,
}

fn default_peek_count() -> i64 {
    10
}

/// GET /queues/{queue}/peek — window into a queue without consuming.
async fn peek_handler(
    State(state): State<Arc<AppState>>,
    Path(queue): Path<String>,
    Query(params): Query<PeekParams>,
) -> impl IntoResponse {
    match state.admin.peek(&queue, params.start, params.count).await {
        Ok(jobs) => (StatusCode::OK, Json(serde_json::json!({ "jobs": jobs }))),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct RequeueRequest {
    job_id: String,
}

/// POST /dlq/requeue — move a DLQ entry back to its origin queue.
async fn requeue_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RequeueRequest>,
) -> impl IntoResponse {
    match state.admin.requeue(&req.job_id).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct PurgeRequest {
    confirm_token: String,
}

/// POST /dlq/purge — destructive, token-gated.
async fn purge_dlq_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PurgeRequest>,
) -> impl IntoResponse {
    match state.admin.purge_dlq(&req.confirm_token).await {
        Ok(purged) => (
            StatusCode::OK,
            Json(serde_json::json!({ "purged_count": purged })),
        ),
        Err(e) => error_response(e),
    }
}

/// POST /purge-all — dev-only, flag- and token-gated.
async fn purge_all_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PurgeRequest>,
) -> impl IntoResponse {
    match state.admin.purge_all(&req.confirm_token).await {
        Ok(purged) => (
            StatusCode::OK,
            Json(serde_json::json!({ "purged_count": purged })),
        ),
        Err(e) => error_response(e),
    }
}

/// POST /bench — enqueue a scripted load and report drain behavior.
async fn bench_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BenchRequest>,
) -> impl IntoResponse {
    match state.admin.bench(req).await {
        Ok(report) => (StatusCode::OK, Json(serde_json::json!(report))),
        Err(e) => error_response(e),
    }
}
