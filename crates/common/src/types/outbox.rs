use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EntryId, JobId};

/// Delivery state of an outbox entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Published,
}

/// A side-effect intent recorded atomically with job completion and
/// drained to an external sink by the outbox publisher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub entry_id: EntryId,
    pub job_id: JobId,
    pub topic: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub status: OutboxStatus,
}

impl OutboxEntry {
    pub fn new(job_id: JobId, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            entry_id: EntryId::new(),
            job_id,
            topic: topic.into(),
            payload,
            created_at: Utc::now(),
            status: OutboxStatus::Pending,
        }
    }
}
