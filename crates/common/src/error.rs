use thiserror::Error;

/// Top-level error type for Conveyor operations.
#[derive(Debug, Error)]
pub enum ConveyorError {
    // --- Input errors (never retried by the core) ---
    #[error("Validation error: {0}")]
    Validation(String),

    // --- Store errors ---
    #[error("Store transient error: {0}")]
    StoreTransient(String),

    #[error("Store permanent error: {0}")]
    StorePermanent(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // --- Handler outcomes ---
    #[error("Handler retryable error: {0}")]
    HandlerRetryable(String),

    #[error("Handler fatal error: {0}")]
    HandlerFatal(String),

    // --- Flow control ---
    #[error("Heartbeat lost")]
    HeartbeatLost,

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("Rate limited on scope {scope}, retry after {retry_after_ms}ms")]
    RateLimited { scope: String, retry_after_ms: u64 },

    // --- Operational errors ---
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConveyorError {
    /// Whether the caller should retry after backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreTransient(_) | Self::RateLimited { .. } | Self::CircuitOpen(_)
        )
    }

    /// Whether this outcome counts against the job's attempt budget.
    /// CircuitOpen and RateLimited requeue without consuming an attempt.
    pub fn consumes_attempt(&self) -> bool {
        matches!(self, Self::HandlerRetryable(_) | Self::HandlerFatal(_))
    }
}

/// Result type alias for Conveyor operations.
pub type Result<T> = std::result::Result<T, ConveyorError>;
