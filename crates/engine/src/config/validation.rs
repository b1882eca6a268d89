use super::loader::{ConfigError, EngineConfig};

/// Validate the complete engine configuration.
///
/// Checks sane ranges on numeric parameters and the relationships the
/// protocol depends on. The engine refuses to start on failure.
pub fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    validate_worker(config, &mut errors);
    validate_retry(config, &mut errors);
    validate_reaper_scheduler(config, &mut errors);
    validate_rate_limit(config, &mut errors);
    validate_breaker(config, &mut errors);
    validate_misc(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors.join("; ")))
    }
}

fn validate_worker(config: &EngineConfig, errors: &mut Vec<String>) {
    let w = &config.system.worker;

    if w.count == 0 {
        errors.push("worker.count must be > 0".into());
    }
    if w.heartbeat_ttl_ms < 5_000 {
        errors.push("worker.heartbeat_ttl_ms must be >= 5000".into());
    }
    // Three missed ticks must fit inside the TTL, or a healthy worker
    // loses its heartbeat on routine jitter.
    if w.heartbeat_ttl_ms < w.heartbeat_tick_ms.saturating_mul(3) {
        errors.push("worker.heartbeat_ttl_ms must be >= 3 * worker.heartbeat_tick_ms".into());
    }
    if w.heartbeat_max_misses == 0 {
        errors.push("worker.heartbeat_max_misses must be > 0".into());
    }
    if w.job_deadline_ms == 0 {
        errors.push("worker.job_deadline_ms must be > 0".into());
    }
    let weights = &w.priority_weights;
    if weights.high == 0 && weights.medium == 0 && weights.low == 0 {
        errors.push("worker.priority_weights must not all be zero".into());
    }
}

fn validate_retry(config: &EngineConfig, errors: &mut Vec<String>) {
    let r = &config.system.retry;

    if r.max_attempts == 0 {
        errors.push("retry.max_attempts must be > 0".into());
    }
    if r.cap_ms < r.base_ms {
        errors.push("retry.cap_ms must be >= retry.base_ms".into());
    }
    for (name, o) in &r.overrides {
        if !matches!(name.as_str(), "high" | "medium" | "low") {
            errors.push(format!("retry.overrides key {:?} is not a priority", name));
        }
        if o.cap_ms < o.base_ms {
            errors.push(format!("retry.overrides.{}.cap_ms must be >= base_ms", name));
        }
    }
}

fn validate_reaper_scheduler(config: &EngineConfig, errors: &mut Vec<String>) {
    let reaper = &config.system.reaper;
    if reaper.tick_ms == 0 {
        errors.push("reaper.tick_ms must be > 0".into());
    }
    if reaper.page_size == 0 {
        errors.push("reaper.page_size must be > 0".into());
    }
    if reaper.time_budget_ms == 0 {
        errors.push("reaper.time_budget_ms must be > 0".into());
    }

    let scheduler = &config.system.scheduler;
    if scheduler.tick_ms == 0 {
        errors.push("scheduler.tick_ms must be > 0".into());
    }
    if scheduler.batch_size == 0 {
        errors.push("scheduler.batch_size must be > 0".into());
    }
}

fn validate_rate_limit(config: &EngineConfig, errors: &mut Vec<String>) {
    let rl = &config.system.rate_limit;

    if rl.default_capacity <= 0.0 {
        errors.push("rate_limit.default_capacity must be > 0".into());
    }
    if rl.default_rate_per_sec <= 0.0 {
        errors.push("rate_limit.default_rate_per_sec must be > 0".into());
    }
    for scope in &rl.scopes {
        if scope.name.is_empty() {
            errors.push("rate_limit.scopes entries need a name".into());
        }
        if scope.capacity <= 0.0 {
            errors.push(format!("rate_limit scope {:?} capacity must be > 0", scope.name));
        }
        if scope.rate_per_sec <= 0.0 {
            errors.push(format!("rate_limit scope {:?} rate must be > 0", scope.name));
        }
        if !(0.0..=1.0).contains(&scope.min_share) {
            errors.push(format!(
                "rate_limit scope {:?} min_share must be between 0.0 and 1.0",
                scope.name
            ));
        }
    }
    // A min_share sum past 1.0 is renormalized (with a warning) by the
    // limiter rather than rejected here.
}

fn validate_breaker(config: &EngineConfig, errors: &mut Vec<String>) {
    let b = &config.system.breaker;

    if !(b.error_ratio > 0.0 && b.error_ratio <= 1.0) {
        errors.push("breaker.error_ratio must be in (0.0, 1.0]".into());
    }
    if b.min_samples == 0 {
        errors.push("breaker.min_samples must be > 0".into());
    }
    if b.window < b.min_samples {
        errors.push("breaker.window must be >= breaker.min_samples".into());
    }
    if b.close_threshold == 0 {
        errors.push("breaker.close_threshold must be > 0".into());
    }
}

fn validate_misc(config: &EngineConfig, errors: &mut Vec<String>) {
    if config.system.payload.max_bytes == 0 {
        errors.push("payload.max_bytes must be > 0".into());
    }
    if config.system.idempotency.grace_ms == 0 {
        errors.push("idempotency.grace_ms must be > 0".into());
    }
    if config.system.outbox.batch_size == 0 {
        errors.push("outbox.batch_size must be > 0".into());
    }
    if config.system.outbox.tick_ms == 0 {
        errors.push("outbox.tick_ms must be > 0".into());
    }
    if config.system.tenant.default.is_empty() {
        errors.push("tenant.default must not be empty".into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_common::config::SystemConfig;
    use std::path::PathBuf;

    fn engine_config(system: SystemConfig) -> EngineConfig {
        EngineConfig {
            system,
            config_dir: PathBuf::from("config"),
        }
    }

    #[test]
    fn defaults_validate() {
        assert!(validate(&engine_config(SystemConfig::default())).is_ok());
    }

    #[test]
    fn heartbeat_tick_must_fit_in_ttl() {
        let mut system = SystemConfig::default();
        system.worker.heartbeat_ttl_ms = 10_000;
        system.worker.heartbeat_tick_ms = 5_000;
        let err = validate(&engine_config(system)).unwrap_err();
        assert!(err.to_string().contains("heartbeat_ttl_ms"));
    }

    #[test]
    fn all_zero_weights_rejected() {
        let mut system = SystemConfig::default();
        system.worker.priority_weights.high = 0;
        system.worker.priority_weights.medium = 0;
        system.worker.priority_weights.low = 0;
        assert!(validate(&engine_config(system)).is_err());
    }

    #[test]
    fn breaker_ratio_out_of_range_rejected() {
        let mut system = SystemConfig::default();
        system.breaker.error_ratio = 1.5;
        assert!(validate(&engine_config(system)).is_err());

        let mut system = SystemConfig::default();
        system.breaker.error_ratio = 0.0;
        assert!(validate(&engine_config(system)).is_err());
    }

    #[test]
    fn scope_min_share_out_of_range_rejected() {
        let mut system = SystemConfig::default();
        system.rate_limit.scopes.push(conveyor_common::config::RateLimitScope {
            name: "s".into(),
            capacity: 10.0,
            rate_per_sec: 10.0,
            weight: 1,
            min_share: 1.5,
        });
        assert!(validate(&engine_config(system)).is_err());
    }
}
