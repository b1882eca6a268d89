mod idempotency;
mod job;
mod outbox;

pub use idempotency::*;
pub use job::*;
pub use outbox::*;
