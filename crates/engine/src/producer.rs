//! Producer: validates, stamps, and enqueues jobs.

use std::sync::Arc;

use chrono::Utc;

use conveyor_common::types::{IdempotencyState, Job};
use conveyor_common::{ConveyorError, JobId, Result};

use crate::idempotency::{BeginOutcome, IdempotencyManager};
use crate::keys;
use crate::store::RedisStore;

pub struct Producer {
    store: RedisStore,
    idempotency: Arc<IdempotencyManager>,
    tenant: String,
    payload_max_bytes: usize,
}

impl Producer {
    pub fn new(
        store: RedisStore,
        idempotency: Arc<IdempotencyManager>,
        tenant: &str,
        payload_max_bytes: usize,
    ) -> Self {
        Self {
            store,
            idempotency,
            tenant: tenant.to_string(),
            payload_max_bytes,
        }
    }

    /// Validate and enqueue. Returns the id the job is tracked under,
    /// which for an idempotent duplicate is the original job's id.
    pub async fn enqueue(&self, mut job: Job) -> Result<JobId> {
        validate(&job, &self.tenant, self.payload_max_bytes)?;

        let now = Utc::now();
        job.tenant = Some(self.tenant.clone());
        job.enqueued_at = now;
        job.origin_queue = keys::priority_list(&self.tenant, job.priority);

        // Idempotent enqueue: the record creation is the gate, so two
        // concurrent producers insert exactly one job.
        if let Some(user_key) = job.idempotency_key.clone() {
            let outcome = self
                .idempotency
                .begin(job.priority.as_str(), &user_key, &job.id.to_string())
                .await?;

            if let BeginOutcome::Duplicate(record) = outcome {
                let original = record
                    .job_id
                    .as_deref()
                    .and_then(|id| id.parse().ok().map(JobId::from_uuid))
                    .ok_or_else(|| {
                        ConveyorError::StorePermanent(format!(
                            "idempotency record for {} lacks a job id",
                            user_key
                        ))
                    })?;

                tracing::debug!(
                    job_id = %original,
                    idempotency_key = %user_key,
                    state = record.state.as_str(),
                    "Duplicate enqueue short-circuited"
                );
                metrics::counter!(
                    "jobs.enqueue_deduped",
                    "tenant" => self.tenant.clone(),
                    "state" => record.state.as_str()
                )
                .increment(1);

                // A failed prior run keeps its record; the duplicate still
                // resolves to the original id rather than re-running.
                debug_assert!(matches!(
                    record.state,
                    IdempotencyState::InFlight | IdempotencyState::Done | IdempotencyState::Failed
                ));
                return Ok(original);
            }
        }

        let raw = serde_json::to_string(&job)?;

        match job.not_before {
            Some(not_before) if not_before > now => {
                self.store
                    .zadd(
                        &keys::delayed(&self.tenant),
                        not_before.timestamp_millis() as f64 / 1000.0,
                        &raw,
                    )
                    .await?;
            }
            _ => {
                self.store.lpush(&job.origin_queue, &raw).await?;
            }
        }

        tracing::debug!(
            job_id = %job.id,
            priority = job.priority.as_str(),
            queue = %job.origin_queue,
            delayed = job.not_before.map_or(false, |t| t > now),
            "Enqueued job"
        );
        metrics::counter!(
            "jobs.enqueued",
            "priority" => job.priority.as_str(),
            "tenant" => self.tenant.clone()
        )
        .increment(1);

        Ok(job.id)
    }
}

/// Input validation; rejected jobs are never retried by the core.
fn validate(job: &Job, tenant: &str, payload_max_bytes: usize) -> Result<()> {
    if job.payload.len() > payload_max_bytes {
        return Err(ConveyorError::Validation(format!(
            "payload is {} bytes, limit is {}",
            job.payload.len(),
            payload_max_bytes
        )));
    }
    if job.max_attempts == 0 {
        return Err(ConveyorError::Validation(
            "max_attempts must be at least 1".into(),
        ));
    }
    if let Some(key) = &job.idempotency_key {
        if key.is_empty() {
            return Err(ConveyorError::Validation(
                "idempotency_key must not be empty".into(),
            ));
        }
    }
    if let Some(job_tenant) = &job.tenant {
        if job_tenant != tenant {
            return Err(ConveyorError::Validation(format!(
                "job tenant {:?} does not match engine tenant {:?}",
                job_tenant, tenant
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_common::types::Priority;

    const MAX: usize = 1_024;

    #[test]
    fn payload_at_limit_passes_one_over_fails() {
        let job = Job::new(Priority::High, vec![0u8; MAX]);
        assert!(validate(&job, "t", MAX).is_ok());

        let job = Job::new(Priority::High, vec![0u8; MAX + 1]);
        assert!(matches!(
            validate(&job, "t", MAX),
            Err(ConveyorError::Validation(_))
        ));
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        let job = Job::new(Priority::Low, vec![]).with_max_attempts(0);
        assert!(matches!(
            validate(&job, "t", MAX),
            Err(ConveyorError::Validation(_))
        ));
    }

    #[test]
    fn foreign_tenant_is_rejected() {
        let job = Job::new(Priority::Low, vec![]).with_tenant("other");
        assert!(matches!(
            validate(&job, "t", MAX),
            Err(ConveyorError::Validation(_))
        ));
        let job = Job::new(Priority::Low, vec![]).with_tenant("t");
        assert!(validate(&job, "t", MAX).is_ok());
    }

    #[test]
    fn empty_idempotency_key_is_rejected() {
        let job = Job::new(Priority::Medium, vec![]).with_idempotency_key("");
        assert!(matches!(
            validate(&job, "t", MAX),
            Err(ConveyorError::Validation(_))
        ));
    }
}
