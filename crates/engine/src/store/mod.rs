//! Thin typed adapter over Redis.
//!
//! Every multi-key mutation in the queue protocol is a Lua script under
//! `lua/`, invoked through [`redis::Script`] (EVALSHA with automatic
//! reload on NOSCRIPT). Callers never touch raw commands; they get
//! domain-named operations and classified errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::Script;

/// Store errors, classified for retry policy.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Worth retrying with backoff: IO, timeouts, failover churn.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Not worth retrying: type errors, script bugs, bad requests.
    #[error("permanent store error: {0}")]
    Permanent(String),

    /// The addressed thing does not exist (distinct from an empty result).
    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        use redis::ErrorKind;
        let transient = e.is_timeout()
            || matches!(
                e.kind(),
                ErrorKind::IoError
                    | ErrorKind::BusyLoadingError
                    | ErrorKind::TryAgain
                    | ErrorKind::ClusterDown
                    | ErrorKind::MasterDown
                    | ErrorKind::Moved
                    | ErrorKind::Ask
                    | ErrorKind::ReadOnly
            );
        if transient {
            Self::Transient(e.to_string())
        } else {
            Self::Permanent(e.to_string())
        }
    }
}

impl From<StoreError> for conveyor_common::ConveyorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transient(m) => Self::StoreTransient(m),
            StoreError::Permanent(m) => Self::StorePermanent(m),
            StoreError::NotFound(m) => Self::NotFound(m),
        }
    }
}

/// Outcome of a reaper reclaim pass over one worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReclaimStatus {
    /// Heartbeat present; registry score refreshed.
    Alive,
    /// Dead worker with an empty processing list; registry entry dropped.
    Empty,
    /// Orphaned job returned to its origin list.
    Requeued,
    /// Orphaned job had exhausted its attempts; dead-lettered.
    Dlq,
    /// Processing-list payload did not parse; dead-lettered as poison.
    Poison,
}

impl ReclaimStatus {
    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "alive" => Ok(Self::Alive),
            "empty" => Ok(Self::Empty),
            "requeued" => Ok(Self::Requeued),
            "dlq" => Ok(Self::Dlq),
            "poison" => Ok(Self::Poison),
            other => Err(StoreError::Permanent(format!(
                "unexpected reclaim status: {}",
                other
            ))),
        }
    }
}

/// Raw decision returned by the token-bucket script.
#[derive(Clone, Copy, Debug)]
pub struct BucketDecision {
    pub allowed: bool,
    pub remaining: f64,
    pub retry_after: Duration,
}

/// Result of an idempotency begin.
#[derive(Clone, Debug)]
pub struct IdemBegin {
    /// True when this call created the record (caller owns the key).
    pub created: bool,
    pub state: String,
    pub result_digest: Option<String>,
    pub job_id: Option<String>,
}

/// One finalize-time outbox append: target list key plus serialized entries.
pub struct OutboxAppend {
    pub key: String,
    pub entries: Vec<String>,
}

/// Idempotency write performed inside a finalize script.
pub struct IdemWrite {
    pub key: String,
    pub result_digest: String,
    pub grace_ms: u64,
    pub job_id: String,
}

struct Scripts {
    claim: Script,
    own: Script,
    heartbeat: Script,
    ack_success: Script,
    retry: Script,
    dead_letter: Script,
    reclaim: Script,
    schedule_due: Script,
    rate_limit: Script,
    idem_begin: Script,
    requeue_dlq: Script,
    purge_list: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            claim: Script::new(include_str!("../../lua/claim.lua")),
            own: Script::new(include_str!("../../lua/own.lua")),
            heartbeat: Script::new(include_str!("../../lua/heartbeat.lua")),
            ack_success: Script::new(include_str!("../../lua/ack_success.lua")),
            retry: Script::new(include_str!("../../lua/retry.lua")),
            dead_letter: Script::new(include_str!("../../lua/dead_letter.lua")),
            reclaim: Script::new(include_str!("../../lua/reclaim.lua")),
            schedule_due: Script::new(include_str!("../../lua/schedule_due.lua")),
            rate_limit: Script::new(include_str!("../../lua/rate_limit.lua")),
            idem_begin: Script::new(include_str!("../../lua/idem_begin.lua")),
            requeue_dlq: Script::new(include_str!("../../lua/requeue_dlq.lua")),
            purge_list: Script::new(include_str!("../../lua/purge_list.lua")),
        }
    }
}

/// Redis-backed store client. Cheap to clone; the connection manager
/// multiplexes and reconnects underneath.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
}

impl RedisStore {
    /// Connect and verify the connection with a PING.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        tracing::info!("Connecting to Redis");

        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Permanent(format!("invalid redis url: {}", e)))?;
        let conn = client.get_connection_manager().await.map_err(StoreError::from)?;

        let store = Self {
            conn,
            scripts: Arc::new(Scripts::load()),
        };
        store.health_check().await?;
        tracing::info!("Redis connection established");

        Ok(store)
    }

    /// Verify the connection is alive (PING).
    pub async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(StoreError::Permanent(format!(
                "unexpected PING response: {}",
                pong
            )));
        }
        Ok(())
    }

    // --- Plain list / set / key operations ---

    pub async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("LLEN").arg(key).query_async(&mut conn).await?)
    }

    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?)
    }

    /// Oldest element of a queue list (the next to be served).
    pub async fn lindex_back(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("LINDEX")
            .arg(key)
            .arg(-1)
            .query_async(&mut conn)
            .await?)
    }

    /// Remove `count` elements from the head of a list.
    pub async fn lpop_count(&self, key: &str, count: u32) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let popped: Option<Vec<String>> = redis::cmd("LPOP")
            .arg(key)
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(popped.unwrap_or_default())
    }

    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?)
    }

    pub async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?)
    }

    /// Page of a sorted set by ascending score.
    pub async fn zrangebyscore_page(
        &self,
        key: &str,
        offset: u32,
        count: u32,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg("+inf")
            .arg("LIMIT")
            .arg(offset)
            .arg(count)
            .query_async(&mut conn)
            .await?)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?)
    }

    /// Blocking move from the serving end of `src` to the head of `dst`.
    /// Returns None on timeout.
    pub async fn blmove(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("BLMOVE")
            .arg(src)
            .arg(dst)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?)
    }

    // --- Protocol scripts ---

    /// Non-blocking claim across the given lists (in dispatch order).
    /// On success the job is on `processing`, the heartbeat is held, and
    /// the registry entry is fresh.
    #[allow(clippy::too_many_arguments)]
    pub async fn claim_job(
        &self,
        lists: &[String; 3],
        processing: &str,
        heartbeat: &str,
        registry: &str,
        worker_id: &str,
        heartbeat_ttl_ms: u64,
        now_epoch_s: i64,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(self
            .scripts
            .claim
            .key(&lists[0])
            .key(&lists[1])
            .key(&lists[2])
            .key(processing)
            .key(heartbeat)
            .key(registry)
            .arg(worker_id)
            .arg(heartbeat_ttl_ms)
            .arg(now_epoch_s)
            .invoke_async(&mut conn)
            .await?)
    }

    /// Take heartbeat ownership after a blocking claim. False means the
    /// heartbeat key is held by someone else, which is a protocol bug.
    pub async fn take_ownership(
        &self,
        heartbeat: &str,
        registry: &str,
        worker_id: &str,
        heartbeat_ttl_ms: u64,
        now_epoch_s: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let ok: i64 = self
            .scripts
            .own
            .key(heartbeat)
            .key(registry)
            .arg(worker_id)
            .arg(heartbeat_ttl_ms)
            .arg(now_epoch_s)
            .invoke_async(&mut conn)
            .await?;
        Ok(ok == 1)
    }

    /// Renew a heartbeat iff this worker still owns it.
    pub async fn renew_heartbeat(
        &self,
        heartbeat: &str,
        registry: &str,
        worker_id: &str,
        heartbeat_ttl_ms: u64,
        now_epoch_s: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let ok: i64 = self
            .scripts
            .heartbeat
            .key(heartbeat)
            .key(registry)
            .arg(worker_id)
            .arg(heartbeat_ttl_ms)
            .arg(now_epoch_s)
            .invoke_async(&mut conn)
            .await?;
        Ok(ok == 1)
    }

    /// Success finalize. Returns false when the heartbeat was no longer
    /// owned and nothing was mutated.
    #[allow(clippy::too_many_arguments)]
    pub async fn ack_success(
        &self,
        processing: &str,
        heartbeat: &str,
        idem_placeholder: &str,
        worker_id: &str,
        claimed_raw: &str,
        outbox: &[OutboxAppend],
        idem: Option<&IdemWrite>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.ack_success.prepare_invoke();
        invocation
            .key(processing)
            .key(heartbeat)
            .key(idem.map(|i| i.key.as_str()).unwrap_or(idem_placeholder));
        for append in outbox {
            invocation.key(&append.key);
        }

        invocation.arg(worker_id).arg(claimed_raw);
        match idem {
            Some(write) => {
                invocation
                    .arg("1")
                    .arg(&write.result_digest)
                    .arg(write.grace_ms)
                    .arg(&write.job_id);
            }
            None => {
                invocation.arg("0").arg("").arg(0).arg("");
            }
        }

        let n_entries: usize = outbox.iter().map(|a| a.entries.len()).sum();
        invocation.arg(n_entries);
        for (key_idx, append) in outbox.iter().enumerate() {
            for entry in &append.entries {
                // Outbox keys start at KEYS[4] in the script, index 1-based.
                invocation.arg(key_idx + 1).arg(entry);
            }
        }

        let ok: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(ok == 1)
    }

    /// Retry finalize: swap the claimed payload for the re-attempted one.
    #[allow(clippy::too_many_arguments)]
    pub async fn retry_job(
        &self,
        processing: &str,
        heartbeat: &str,
        origin: &str,
        delayed: &str,
        worker_id: &str,
        claimed_raw: &str,
        next_raw: &str,
        delay_ms: u64,
        now_epoch_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let ok: i64 = self
            .scripts
            .retry
            .key(processing)
            .key(heartbeat)
            .key(origin)
            .key(delayed)
            .arg(worker_id)
            .arg(claimed_raw)
            .arg(next_raw)
            .arg(delay_ms)
            .arg(now_epoch_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(ok == 1)
    }

    /// Dead-letter finalize.
    #[allow(clippy::too_many_arguments)]
    pub async fn dead_letter(
        &self,
        processing: &str,
        heartbeat: &str,
        dlq: &str,
        idem_placeholder: &str,
        worker_id: &str,
        claimed_raw: &str,
        dlq_raw: &str,
        idem: Option<&IdemWrite>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.dead_letter.prepare_invoke();
        invocation
            .key(processing)
            .key(heartbeat)
            .key(dlq)
            .key(idem.map(|i| i.key.as_str()).unwrap_or(idem_placeholder))
            .arg(worker_id)
            .arg(claimed_raw)
            .arg(dlq_raw);
        match idem {
            Some(write) => {
                invocation
                    .arg("1")
                    .arg(&write.result_digest)
                    .arg(write.grace_ms)
                    .arg(&write.job_id);
            }
            None => {
                invocation.arg("0").arg("").arg(0).arg("");
            }
        }
        let ok: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(ok == 1)
    }

    /// Reaper reclaim for one worker.
    #[allow(clippy::too_many_arguments)]
    pub async fn reclaim_worker(
        &self,
        heartbeat: &str,
        processing: &str,
        registry: &str,
        dlq: &str,
        lists: &[String; 3],
        worker_id: &str,
        now_epoch_s: i64,
    ) -> Result<ReclaimStatus, StoreError> {
        let mut conn = self.conn.clone();
        let status: String = self
            .scripts
            .reclaim
            .key(heartbeat)
            .key(processing)
            .key(registry)
            .key(dlq)
            .key(&lists[0])
            .key(&lists[1])
            .key(&lists[2])
            .arg(worker_id)
            .arg(now_epoch_s)
            .invoke_async(&mut conn)
            .await?;
        ReclaimStatus::parse(&status)
    }

    /// Promote due delayed jobs. Returns the number promoted.
    pub async fn schedule_due(
        &self,
        delayed: &str,
        lists: &[String; 3],
        now_epoch_s: f64,
        batch: u32,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        Ok(self
            .scripts
            .schedule_due
            .key(delayed)
            .key(&lists[0])
            .key(&lists[1])
            .key(&lists[2])
            .arg(now_epoch_s)
            .arg(batch)
            .invoke_async(&mut conn)
            .await?)
    }

    /// Token-bucket consume.
    pub async fn rate_limit_consume(
        &self,
        bucket: &str,
        now_epoch_ms: i64,
        n: f64,
        capacity: f64,
        rate_per_sec: f64,
    ) -> Result<BucketDecision, StoreError> {
        let mut conn = self.conn.clone();
        let (allowed, remaining, retry_after_ms): (i64, String, String) = self
            .scripts
            .rate_limit
            .key(bucket)
            .arg(now_epoch_ms)
            .arg(n)
            .arg(capacity)
            .arg(rate_per_sec)
            .invoke_async(&mut conn)
            .await?;

        let remaining: f64 = remaining
            .parse()
            .map_err(|_| StoreError::Permanent(format!("bad bucket remaining: {}", remaining)))?;
        let retry_after_ms: u64 = retry_after_ms.parse().map_err(|_| {
            StoreError::Permanent(format!("bad bucket retry_after: {}", retry_after_ms))
        })?;

        Ok(BucketDecision {
            allowed: allowed == 1,
            remaining,
            retry_after: Duration::from_millis(retry_after_ms),
        })
    }

    /// Create-or-inspect an idempotency record.
    pub async fn idem_begin(
        &self,
        key: &str,
        grace_ms: u64,
        job_id: &str,
    ) -> Result<IdemBegin, StoreError> {
        let mut conn = self.conn.clone();
        let (created, state, digest, owner): (i64, String, String, String) = self
            .scripts
            .idem_begin
            .key(key)
            .arg(grace_ms)
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(IdemBegin {
            created: created == 1,
            state,
            result_digest: (!digest.is_empty()).then_some(digest),
            job_id: (!owner.is_empty()).then_some(owner),
        })
    }

    /// Move a DLQ entry back to its origin list by job id.
    pub async fn requeue_from_dlq(
        &self,
        dlq: &str,
        lists: &[String; 3],
        job_id: &str,
        max_scan: u32,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let ok: i64 = self
            .scripts
            .requeue_dlq
            .key(dlq)
            .key(&lists[0])
            .key(&lists[1])
            .key(&lists[2])
            .arg(job_id)
            .arg(max_scan)
            .invoke_async(&mut conn)
            .await?;
        Ok(ok == 1)
    }

    /// Count-and-delete one queue key. Returns the dropped element count.
    pub async fn purge_key(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        Ok(self
            .scripts
            .purge_list
            .key(key)
            .invoke_async(&mut conn)
            .await?)
    }
}
