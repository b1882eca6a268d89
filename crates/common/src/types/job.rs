use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::JobId;

/// Priority levels for queue routing.
/// Maps to Redis lists: `{tenant}:q:high`, `{tenant}:q:medium`, `{tenant}:q:low`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// All priorities in dispatch order (high → medium → low).
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// W3C trace propagation headers carried with a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub traceparent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
}

/// A unit of work moving through the queue.
///
/// Serialized as UTF-8 JSON onto Redis lists. Unknown fields survive a
/// decode/encode cycle via `extra`, so newer producers can talk to older
/// workers without losing data on requeue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub priority: Priority,
    /// Opaque payload bytes, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Delivery count; 0 on first delivery, incremented at retry decision time.
    pub attempt: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Delayed delivery: the job stays in the delayed set until this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// Full key of the priority list this job was enqueued onto.
    /// Persisted so the reaper can restore location without guessing.
    pub origin_queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<TraceContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    /// Forward-compatibility: fields this version does not know about.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Job {
    /// Create a job with defaults; the producer stamps `id`, `enqueued_at`
    /// and `origin_queue` at enqueue time.
    pub fn new(priority: Priority, payload: Vec<u8>) -> Self {
        Self {
            id: JobId::new(),
            priority,
            payload,
            attempt: 0,
            max_attempts: 5,
            enqueued_at: Utc::now(),
            not_before: None,
            origin_queue: String::new(),
            idempotency_key: None,
            trace_context: None,
            tenant: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    /// Whether the attempt budget is exhausted.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Why a job landed in the dead-letter queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    MaxAttemptsExceeded,
    HandlerFatal,
    Poison,
}

impl DlqReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxAttemptsExceeded => "max_attempts_exceeded",
            Self::HandlerFatal => "handler_fatal",
            Self::Poison => "poison",
        }
    }
}

/// A dead-lettered job: the original record, unmodified, plus the reason.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DlqEntry {
    #[serde(flatten)]
    pub job: Job,
    pub dlq_reason: DlqReason,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
