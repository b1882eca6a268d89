//! Integration tests for the queue protocol.
//! All tests are `#[ignore]` — run with `cargo test -- --ignored` against
//! a live Redis (REDIS_URL, default redis://localhost:6379).
//!
//! Each test works in its own throwaway tenant so runs do not interfere.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};

use conveyor_common::config::{
    AdminConfig, RateLimitConfig, RateLimitScope, ReaperConfig, SchedulerConfig,
};
use conveyor_common::types::{DlqEntry, DlqReason, Job, Priority};
use conveyor_engine::admin::AdminApi;
use conveyor_engine::idempotency::IdempotencyManager;
use conveyor_engine::keys;
use conveyor_engine::producer::Producer;
use conveyor_engine::rate_limit::RateLimiter;
use conveyor_engine::reaper::Reaper;
use conveyor_engine::scheduler::Scheduler;
use conveyor_engine::store::RedisStore;

async fn store() -> RedisStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
    RedisStore::connect(&url).await.expect("Failed to connect to Redis")
}

fn test_tenant(label: &str) -> String {
    format!("test-{}-{}", label, &uuid::Uuid::new_v4().simple().to_string()[..8])
}

fn producer(store: &RedisStore, tenant: &str) -> Producer {
    let idem = Arc::new(IdempotencyManager::new(store.clone(), tenant, 60_000));
    Producer::new(store.clone(), idem, tenant, 1_048_576)
}

#[tokio::test]
#[ignore]
async fn enqueue_claim_ack_leaves_nothing_behind() {
    let store = store().await;
    let tenant = test_tenant("happy");

    let job = Job::new(Priority::High, b"hello".to_vec()).with_max_attempts(3);
    let job_id = producer(&store, &tenant).enqueue(job).await.expect("enqueue");

    let lists = keys::priority_lists(&tenant);
    let processing = keys::processing(&tenant, "w1");
    let heartbeat = keys::heartbeat(&tenant, "w1");
    let registry = keys::registry(&tenant);

    let raw = store
        .claim_job(&lists, &processing, &heartbeat, &registry, "w1", 30_000, Utc::now().timestamp())
        .await
        .expect("claim")
        .expect("job should be claimable");

    let claimed: Job = serde_json::from_str(&raw).expect("claimed payload parses");
    assert_eq!(claimed.id, job_id);
    assert_eq!(store.llen(&processing).await.unwrap(), 1);
    assert_eq!(store.get(&heartbeat).await.unwrap().as_deref(), Some("w1"));

    let idem_placeholder = keys::idempotency(&tenant, "_none", "_none");
    let acked = store
        .ack_success(&processing, &heartbeat, &idem_placeholder, "w1", &raw, &[], None)
        .await
        .expect("ack");
    assert!(acked);

    assert_eq!(store.llen(&lists[0]).await.unwrap(), 0);
    assert_eq!(store.llen(&processing).await.unwrap(), 0);
    assert_eq!(store.get(&heartbeat).await.unwrap(), None);
    assert_eq!(store.llen(&keys::dlq(&tenant)).await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn finalize_without_heartbeat_is_a_no_op() {
    let store = store().await;
    let tenant = test_tenant("fence");

    producer(&store, &tenant)
        .enqueue(Job::new(Priority::Medium, b"x".to_vec()))
        .await
        .expect("enqueue");

    let lists = keys::priority_lists(&tenant);
    let processing = keys::processing(&tenant, "w1");
    let heartbeat = keys::heartbeat(&tenant, "w1");
    let registry = keys::registry(&tenant);

    // Claim with a short TTL and let the heartbeat lapse.
    let raw = store
        .claim_job(&lists, &processing, &heartbeat, &registry, "w1", 200, Utc::now().timestamp())
        .await
        .expect("claim")
        .expect("claimable");
    tokio::time::sleep(Duration::from_millis(400)).await;

    let idem_placeholder = keys::idempotency(&tenant, "_none", "_none");
    let acked = store
        .ack_success(&processing, &heartbeat, &idem_placeholder, "w1", &raw, &[], None)
        .await
        .expect("ack call");
    assert!(!acked, "finalize must refuse once ownership lapsed");
    assert_eq!(store.llen(&processing).await.unwrap(), 1, "job stays for the reaper");
}

#[tokio::test]
#[ignore]
async fn reaper_returns_orphaned_job_to_origin() {
    let store = store().await;
    let tenant = test_tenant("reap");

    let job = Job::new(Priority::Medium, b"orphan".to_vec()).with_max_attempts(3);
    producer(&store, &tenant).enqueue(job).await.expect("enqueue");

    let lists = keys::priority_lists(&tenant);
    let processing = keys::processing(&tenant, "crashed-1");
    let heartbeat = keys::heartbeat(&tenant, "crashed-1");
    let registry = keys::registry(&tenant);

    // Simulate a crash: claim, then never renew the 300ms heartbeat.
    store
        .claim_job(&lists, &processing, &heartbeat, &registry, "crashed-1", 300, Utc::now().timestamp())
        .await
        .expect("claim")
        .expect("claimable");
    tokio::time::sleep(Duration::from_millis(600)).await;

    let reaper = Reaper::new(
        store.clone(),
        &tenant,
        ReaperConfig {
            tick_ms: 1_000,
            page_size: 100,
            time_budget_ms: 1_000,
        },
    );
    let summary = reaper.run_once().await.expect("reap");

    assert_eq!(summary.requeued, 1);
    assert_eq!(store.llen(&lists[1]).await.unwrap(), 1, "job is back on medium");
    assert_eq!(store.llen(&processing).await.unwrap(), 0);
    assert_eq!(store.zcard(&registry).await.unwrap(), 0, "dead worker pruned");

    // The restored payload is byte-identical to the enqueued one.
    let raw = store.lindex_back(&lists[1]).await.unwrap().unwrap();
    let restored: Job = serde_json::from_str(&raw).unwrap();
    assert_eq!(restored.payload, b"orphan");
    assert_eq!(restored.attempt, 0);
}

#[tokio::test]
#[ignore]
async fn reaper_skips_live_workers() {
    let store = store().await;
    let tenant = test_tenant("alive");

    producer(&store, &tenant)
        .enqueue(Job::new(Priority::High, b"x".to_vec()))
        .await
        .expect("enqueue");

    let lists = keys::priority_lists(&tenant);
    let processing = keys::processing(&tenant, "w1");
    let heartbeat = keys::heartbeat(&tenant, "w1");
    let registry = keys::registry(&tenant);

    store
        .claim_job(&lists, &processing, &heartbeat, &registry, "w1", 30_000, Utc::now().timestamp())
        .await
        .expect("claim")
        .expect("claimable");

    let reaper = Reaper::new(
        store.clone(),
        &tenant,
        ReaperConfig {
            tick_ms: 1_000,
            page_size: 100,
            time_budget_ms: 1_000,
        },
    );
    let summary = reaper.run_once().await.expect("reap");

    assert_eq!(summary.requeued, 0);
    assert_eq!(store.llen(&processing).await.unwrap(), 1, "in-flight job untouched");
    assert_eq!(store.zcard(&registry).await.unwrap(), 1);
}

#[tokio::test]
#[ignore]
async fn orphan_with_exhausted_attempts_goes_to_dlq() {
    let store = store().await;
    let tenant = test_tenant("reapdlq");

    // attempt == max_attempts already: reclaim must route to the DLQ.
    let mut job = Job::new(Priority::Low, b"spent".to_vec()).with_max_attempts(2);
    job.attempt = 2;
    job.tenant = Some(tenant.clone());
    job.origin_queue = keys::priority_list(&tenant, Priority::Low);
    let raw = serde_json::to_string(&job).unwrap();

    let lists = keys::priority_lists(&tenant);
    store.lpush(&lists[2], &raw).await.unwrap();

    let processing = keys::processing(&tenant, "crashed-2");
    let heartbeat = keys::heartbeat(&tenant, "crashed-2");
    let registry = keys::registry(&tenant);
    store
        .claim_job(&lists, &processing, &heartbeat, &registry, "crashed-2", 200, Utc::now().timestamp())
        .await
        .expect("claim")
        .expect("claimable");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let reaper = Reaper::new(
        store.clone(),
        &tenant,
        ReaperConfig {
            tick_ms: 1_000,
            page_size: 100,
            time_budget_ms: 1_000,
        },
    );
    let summary = reaper.run_once().await.expect("reap");

    assert_eq!(summary.dead_lettered, 1);
    let dlq_raw = store.lindex_back(&keys::dlq(&tenant)).await.unwrap().unwrap();
    let entry: DlqEntry = serde_json::from_str(&dlq_raw).unwrap();
    assert_eq!(entry.dlq_reason, DlqReason::MaxAttemptsExceeded);
    assert_eq!(entry.job.attempt, 2);
}

#[tokio::test]
#[ignore]
async fn idempotent_enqueue_inserts_once() {
    let store = store().await;
    let tenant = test_tenant("idem");
    let producer = producer(&store, &tenant);

    let first = producer
        .enqueue(Job::new(Priority::High, b"a".to_vec()).with_idempotency_key("order-42"))
        .await
        .expect("first enqueue");
    let second = producer
        .enqueue(Job::new(Priority::High, b"a".to_vec()).with_idempotency_key("order-42"))
        .await
        .expect("second enqueue");

    assert_eq!(first, second, "duplicate resolves to the original id");
    let list = keys::priority_list(&tenant, Priority::High);
    assert_eq!(store.llen(&list).await.unwrap(), 1, "exactly one insertion");
}

#[tokio::test]
#[ignore]
async fn delayed_job_promotes_after_not_before() {
    let store = store().await;
    let tenant = test_tenant("delay");

    let job = Job::new(Priority::High, b"later".to_vec())
        .with_not_before(Utc::now() + chrono::Duration::milliseconds(700));
    producer(&store, &tenant).enqueue(job).await.expect("enqueue");

    let delayed = keys::delayed(&tenant);
    let list = keys::priority_list(&tenant, Priority::High);
    assert_eq!(store.zcard(&delayed).await.unwrap(), 1);
    assert_eq!(store.llen(&list).await.unwrap(), 0);

    let scheduler = Scheduler::new(
        store.clone(),
        &tenant,
        SchedulerConfig {
            tick_ms: 500,
            batch_size: 200,
        },
    );

    // Not due yet.
    assert_eq!(scheduler.run_once().await.expect("tick"), 0);

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(scheduler.run_once().await.expect("tick"), 1);
    assert_eq!(store.zcard(&delayed).await.unwrap(), 0);
    assert_eq!(store.llen(&list).await.unwrap(), 1);
}

#[tokio::test]
#[ignore]
async fn rate_limit_contention_respects_capacity() {
    let store = store().await;
    let tenant = test_tenant("rl");

    let limiter = Arc::new(RateLimiter::new(
        store.clone(),
        &tenant,
        &RateLimitConfig {
            default_capacity: 10.0,
            default_rate_per_sec: 10.0,
            scopes: vec![RateLimitScope {
                name: "burst".into(),
                capacity: 10.0,
                rate_per_sec: 10.0,
                weight: 1,
                min_share: 0.0,
            }],
        },
    ));

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let limiter = Arc::clone(&limiter);
        tasks.push(tokio::spawn(async move {
            limiter.consume("burst", 1.0).await.expect("consume")
        }));
    }

    let mut allowed = 0u32;
    for task in tasks {
        let decision = task.await.expect("join");
        if decision.allowed {
            allowed += 1;
        } else {
            assert!(decision.retry_after > Duration::ZERO);
        }
    }

    // Burst capacity 10 plus at most a token or two of refill while the
    // 100 calls are in flight.
    assert!((10..=13).contains(&allowed), "allowed = {}", allowed);
}

#[tokio::test]
#[ignore]
async fn requeue_moves_dlq_entry_back_to_origin() {
    let store = store().await;
    let tenant = test_tenant("requeue");

    let mut job = Job::new(Priority::Medium, b"revive me".to_vec()).with_max_attempts(2);
    job.attempt = 2;
    job.tenant = Some(tenant.clone());
    job.origin_queue = keys::priority_list(&tenant, Priority::Medium);
    let job_id = job.id;

    let entry = DlqEntry {
        job,
        dlq_reason: DlqReason::MaxAttemptsExceeded,
    };
    store
        .lpush(&keys::dlq(&tenant), &serde_json::to_string(&entry).unwrap())
        .await
        .unwrap();

    let admin = admin(&store, &tenant, "");
    admin.requeue(&job_id.to_string()).await.expect("requeue");

    assert_eq!(store.llen(&keys::dlq(&tenant)).await.unwrap(), 0);
    let list = keys::priority_list(&tenant, Priority::Medium);
    let raw = store.lindex_back(&list).await.unwrap().unwrap();
    let revived: Job = serde_json::from_str(&raw).unwrap();
    assert_eq!(revived.id, job_id);
    assert_eq!(revived.attempt, 0, "operator requeue resets the attempt budget");

    // Unknown ids are NotFound.
    let missing = admin.requeue(&uuid::Uuid::new_v4().to_string()).await;
    assert!(missing.is_err());
}

#[tokio::test]
#[ignore]
async fn purge_dlq_requires_valid_token() {
    let store = store().await;
    let tenant = test_tenant("purge");

    for i in 0..3 {
        let job = Job::new(Priority::Low, format!("dead-{}", i).into_bytes());
        let entry = DlqEntry {
            job,
            dlq_reason: DlqReason::HandlerFatal,
        };
        store
            .lpush(&keys::dlq(&tenant), &serde_json::to_string(&entry).unwrap())
            .await
            .unwrap();
    }

    let admin = admin(&store, &tenant, "hunter2");

    assert!(admin.purge_dlq("wrong").await.is_err());
    assert_eq!(store.llen(&keys::dlq(&tenant)).await.unwrap(), 3);

    let token = today_token("hunter2");
    let purged = admin.purge_dlq(&token).await.expect("purge");
    assert_eq!(purged, 3);
    assert_eq!(store.llen(&keys::dlq(&tenant)).await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn heartbeat_renewal_is_owner_only() {
    let store = store().await;
    let tenant = test_tenant("hb");

    producer(&store, &tenant)
        .enqueue(Job::new(Priority::High, b"x".to_vec()))
        .await
        .expect("enqueue");

    let lists = keys::priority_lists(&tenant);
    let processing = keys::processing(&tenant, "w1");
    let heartbeat = keys::heartbeat(&tenant, "w1");
    let registry = keys::registry(&tenant);

    store
        .claim_job(&lists, &processing, &heartbeat, &registry, "w1", 30_000, Utc::now().timestamp())
        .await
        .expect("claim")
        .expect("claimable");

    let renewed = store
        .renew_heartbeat(&heartbeat, &registry, "w1", 30_000, Utc::now().timestamp())
        .await
        .expect("renew");
    assert!(renewed);

    let foreign = store
        .renew_heartbeat(&heartbeat, &registry, "impostor", 30_000, Utc::now().timestamp())
        .await
        .expect("renew call");
    assert!(!foreign, "a foreign worker must not extend the heartbeat");
    assert_eq!(store.get(&heartbeat).await.unwrap().as_deref(), Some("w1"));
}

fn admin(store: &RedisStore, tenant: &str, secret: &str) -> AdminApi {
    let limiter = Arc::new(RateLimiter::new(
        store.clone(),
        tenant,
        &RateLimitConfig::default(),
    ));
    let idem = Arc::new(IdempotencyManager::new(store.clone(), tenant, 60_000));
    let producer = Arc::new(Producer::new(store.clone(), idem, tenant, 1_048_576));
    AdminApi::new(
        store.clone(),
        tenant,
        limiter,
        producer,
        AdminConfig {
            allow_purge_all: false,
            purge_secret: secret.into(),
        },
    )
}

fn today_token(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", secret, Utc::now().format("%Y-%m-%d")).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
