//! Redis key schema.
//!
//! Every key for a tenant embeds the tenant inside `{...}` so cluster
//! hash-tagging routes all of a tenant's keys to one shard; the atomic
//! scripts rely on this.

use conveyor_common::types::Priority;

/// Priority list: `{tenant}:q:high|medium|low`.
pub fn priority_list(tenant: &str, priority: Priority) -> String {
    format!("{{{}}}:q:{}", tenant, priority.as_str())
}

/// All three priority lists in dispatch order.
pub fn priority_lists(tenant: &str) -> [String; 3] {
    Priority::ALL.map(|p| priority_list(tenant, p))
}

/// Delayed-delivery sorted set, scored by `not_before` epoch seconds.
pub fn delayed(tenant: &str) -> String {
    format!("{{{}}}:q:delayed", tenant)
}

/// Dead-letter queue list.
pub fn dlq(tenant: &str) -> String {
    format!("{{{}}}:q:dlq", tenant)
}

/// Per-worker processing list; holds at most one in-flight job.
pub fn processing(tenant: &str, worker_id: &str) -> String {
    format!("{{{}}}:w:{}:processing", tenant, worker_id)
}

/// Per-worker heartbeat key; value equals the worker id, TTL-bounded.
pub fn heartbeat(tenant: &str, worker_id: &str) -> String {
    format!("{{{}}}:w:{}:hb", tenant, worker_id)
}

/// Worker registry sorted set, scored by last-seen epoch seconds.
pub fn registry(tenant: &str) -> String {
    format!("{{{}}}:workers", tenant)
}

/// Rate-limiter bucket hash for a scope.
pub fn rate_limit(tenant: &str, scope: &str) -> String {
    format!("{{{}}}:rl:{}", tenant, scope)
}

/// Idempotency record hash.
pub fn idempotency(tenant: &str, queue: &str, user_key: &str) -> String {
    format!("{{{}}}:idem:{}:{}", tenant, queue, user_key)
}

/// Outbox list for a topic.
pub fn outbox(tenant: &str, topic: &str) -> String {
    format!("{{{}}}:outbox:{}", tenant, topic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_the_tenant_hash_tag() {
        assert_eq!(priority_list("acme", Priority::High), "{acme}:q:high");
        assert_eq!(delayed("acme"), "{acme}:q:delayed");
        assert_eq!(dlq("acme"), "{acme}:q:dlq");
        assert_eq!(processing("acme", "w1"), "{acme}:w:w1:processing");
        assert_eq!(heartbeat("acme", "w1"), "{acme}:w:w1:hb");
        assert_eq!(registry("acme"), "{acme}:workers");
        assert_eq!(rate_limit("acme", "emails"), "{acme}:rl:emails");
        assert_eq!(idempotency("acme", "high", "k1"), "{acme}:idem:high:k1");
        assert_eq!(outbox("acme", "events"), "{acme}:outbox:events");
    }

    #[test]
    fn priority_lists_are_in_dispatch_order() {
        let lists = priority_lists("t");
        assert_eq!(lists[0], "{t}:q:high");
        assert_eq!(lists[1], "{t}:q:medium");
        assert_eq!(lists[2], "{t}:q:low");
    }
}
