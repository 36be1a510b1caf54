//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges and cross-field
//! consistency. Every failing rule is reported, not just the first.

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::GuardConfig;

/// A single failed validation rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    /// Human readable reason.
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validate a configuration, returning every violated rule.
pub fn validate_config(config: &GuardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }
    if config.listener.request_timeout_secs == 0 {
        errors.push(ValidationError::new("listener.request_timeout_secs", "must be > 0"));
    }

    if config.auth.header_name.trim().is_empty() {
        errors.push(ValidationError::new("auth.header_name", "must not be empty"));
    }

    let breaker = &config.breaker;
    if breaker.failure_threshold == 0 {
        errors.push(ValidationError::new("breaker.failure_threshold", "must be > 0"));
    }
    if breaker.success_threshold == 0 {
        errors.push(ValidationError::new("breaker.success_threshold", "must be > 0"));
    }
    if breaker.cooldown_period_ms == 0 {
        errors.push(ValidationError::new("breaker.cooldown_period_ms", "must be > 0"));
    }
    if breaker.half_open_max_probes == Some(0) {
        errors.push(ValidationError::new(
            "breaker.half_open_max_probes",
            "must be > 0 when set (omit to admit every probe)",
        ));
    }
    if breaker.max_commit_attempts == 0 {
        errors.push(ValidationError::new("breaker.max_commit_attempts", "must be > 0"));
    }

    let health = &config.health;
    if health.healthy_min > 100 || health.initial_success_score > 100 || health.initial_failure_score > 100 {
        errors.push(ValidationError::new("health", "scores and bands must be within 0..=100"));
    }
    if health.degraded_min >= health.healthy_min {
        errors.push(ValidationError::new(
            "health.degraded_min",
            format!(
                "must be below health.healthy_min ({} >= {})",
                health.degraded_min, health.healthy_min
            ),
        ));
    }

    let observer = &config.observer;
    if observer.poll_interval_ms == 0 {
        errors.push(ValidationError::new("observer.poll_interval_ms", "must be > 0"));
    }
    if observer.heartbeat_interval_ms == 0 {
        errors.push(ValidationError::new("observer.heartbeat_interval_ms", "must be > 0"));
    }
    if observer.stale_after_ms < observer.poll_interval_ms {
        errors.push(ValidationError::new(
            "observer.stale_after_ms",
            "must be at least observer.poll_interval_ms",
        ));
    }
    if url::Url::parse(&observer.rest_url).is_err() {
        errors.push(ValidationError::new("observer.rest_url", "is not a valid URL"));
    }
    match url::Url::parse(&observer.realtime_url) {
        Ok(u) if u.scheme() == "ws" || u.scheme() == "wss" => {}
        _ => errors.push(ValidationError::new(
            "observer.realtime_url",
            "must be a ws:// or wss:// URL",
        )),
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "is not a socket address",
        ));
    }
    if !matches!(config.observability.log_format.as_str(), "pretty" | "json") {
        errors.push(ValidationError::new(
            "observability.log_format",
            "must be \"pretty\" or \"json\"",
        ));
    }

    if config.admin.enabled && config.admin.api_key.trim().is_empty() {
        errors.push(ValidationError::new("admin.api_key", "must be set when admin is enabled"));
    }

    if config.security.max_provider_id_len == 0 {
        errors.push(ValidationError::new("security.max_provider_id_len", "must be > 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
