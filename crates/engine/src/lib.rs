pub mod admin;
pub mod backoff;
pub mod breaker;
pub mod config;
pub mod idempotency;
pub mod keys;
pub mod outbox;
pub mod producer;
pub mod rate_limit;
pub mod reaper;
pub mod scheduler;
pub mod store;
pub mod worker;
