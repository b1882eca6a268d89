use serde::{Deserialize, Serialize};

/// Lifecycle of an idempotency record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    InFlight,
    Done,
    Failed,
}

impl IdempotencyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_flight" => Some(Self::InFlight),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Stored marker for a processed (or in-progress) idempotency key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub state: IdempotencyState,
    /// SHA-256 hex digest of the cached handler result, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_digest: Option<String>,
    /// Job id that first claimed this key; duplicate enqueues return it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_wire_names() {
        for state in [
            IdempotencyState::InFlight,
            IdempotencyState::Done,
            IdempotencyState::Failed,
        ] {
            assert_eq!(IdempotencyState::parse(state.as_str()), Some(state));
        }
        assert_eq!(IdempotencyState::parse("gone"), None);
    }
}
