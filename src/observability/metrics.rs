//! Metrics collection and exposition.
//!
//! # Metrics
//! - `guard_checks_total` (counter): admission decisions by provider, allowed
//! - `guard_outcomes_total` (counter): recorded call outcomes by provider
//! - `guard_transitions_total` (counter): circuit transitions by target state
//! - `guard_health_score` (gauge): last computed score per provider
//! - `observer_fetches_total` (counter): reconciliation fetches by result
//!
//! Recording is a no-op until `init_metrics` installs the exporter.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_check(provider_id: &str, allowed: bool) {
    ::metrics::counter!(
        "guard_checks_total",
        "provider" => provider_id.to_string(),
        "allowed" => if allowed { "true" } else { "false" }
    )
    .increment(1);
}

pub fn record_outcome(provider_id: &str, outcome: &'static str) {
    ::metrics::counter!(
        "guard_outcomes_total",
        "provider" => provider_id.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_transition(provider_id: &str, to: &'static str) {
    ::metrics::counter!(
        "guard_transitions_total",
        "provider" => provider_id.to_string(),
        "to" => to
    )
    .increment(1);
}

pub fn record_health_score(provider_id: &str, score: u8) {
    ::metrics::gauge!("guard_health_score", "provider" => provider_id.to_string()).set(f64::from(score));
}

pub fn record_observer_fetch(result: &'static str) {
    ::metrics::counter!("observer_fetches_total", "result" => result).increment(1);
}
