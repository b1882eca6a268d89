//! Idempotency markers: exactly-once effects on top of at-least-once
//! delivery.
//!
//! Records are hashes at `{tenant}:idem:<queue>:<user_key>` with a TTL
//! grace period that outlives job execution, so redeliveries and
//! producer retries observe the first outcome instead of re-running.

use sha2::{Digest, Sha256};

use conveyor_common::types::{IdempotencyRecord, IdempotencyState};
use conveyor_common::Result;

use crate::keys;
use crate::store::RedisStore;

/// What `begin` found.
#[derive(Clone, Debug)]
pub enum BeginOutcome {
    /// The record was created by this call; the caller owns the key.
    Fresh,
    /// A record already existed; the caller should short-circuit.
    Duplicate(IdempotencyRecord),
}

pub struct IdempotencyManager {
    store: RedisStore,
    tenant: String,
    grace_ms: u64,
}

impl IdempotencyManager {
    pub fn new(store: RedisStore, tenant: &str, grace_ms: u64) -> Self {
        Self {
            store,
            tenant: tenant.to_string(),
            grace_ms,
        }
    }

    /// Atomically create an `in_flight` record, or report the existing one.
    pub async fn begin(&self, queue: &str, user_key: &str, job_id: &str) -> Result<BeginOutcome> {
        let key = self.record_key(queue, user_key);
        let begin = self.store.idem_begin(&key, self.grace_ms, job_id).await?;

        if begin.created {
            return Ok(BeginOutcome::Fresh);
        }

        let state = IdempotencyState::parse(&begin.state).ok_or_else(|| {
            conveyor_common::ConveyorError::StorePermanent(format!(
                "corrupt idempotency state {:?} at {}",
                begin.state, key
            ))
        })?;

        Ok(BeginOutcome::Duplicate(IdempotencyRecord {
            state,
            result_digest: begin.result_digest,
            job_id: begin.job_id,
        }))
    }

    /// Redis key of the record. The `in_flight -> done|failed` transition
    /// happens inside the finalize scripts, guarded on the same heartbeat
    /// as the rest of the finalize.
    pub fn record_key(&self, queue: &str, user_key: &str) -> String {
        keys::idempotency(&self.tenant, queue, user_key)
    }

    /// Same-slot placeholder for finalize scripts that carry no
    /// idempotency write (the key is declared but never touched).
    pub fn placeholder_key(&self) -> String {
        keys::idempotency(&self.tenant, "_none", "_none")
    }

    pub fn grace_ms(&self) -> u64 {
        self.grace_ms
    }
}

/// SHA-256 hex digest of a handler result, cached on the record. A
/// deduplicated redelivery reports this digest as its outcome instead
/// of re-running the handler.
pub fn result_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_hex() {
        let d1 = result_digest(b"hello");
        let d2 = result_digest(b"hello");
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), 64);
        assert!(d1.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(result_digest(b"other"), d1);
    }
}
