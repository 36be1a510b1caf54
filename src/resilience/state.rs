//! Per-provider circuit state row.
//!
//! # State Transitions
//! ```text
//! Closed    → Open:      failure_count >= failure_threshold
//! Open      → HalfOpen:  check() after next_attempt_at
//! HalfOpen  → Closed:    success_count >= success_threshold
//! HalfOpen  → Open:      any failure
//! any       → Closed:    manual reset
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BreakerConfig;

/// Discrete circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Cooldown elapsed, probing for recovery.
    HalfOpen,
    /// Provider assumed down, calls are blocked.
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: CircuitState, manual: bool) -> bool {
        if manual {
            return next == CircuitState::Closed;
        }
        matches!(
            (self, next),
            (CircuitState::Closed, CircuitState::Open)
                | (CircuitState::Open, CircuitState::HalfOpen)
                | (CircuitState::HalfOpen, CircuitState::Closed)
                | (CircuitState::HalfOpen, CircuitState::Open)
        )
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable state of one provider's circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCircuitState {
    pub provider_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_period_ms: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_opened_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub total_trips: u64,
    pub total_calls_blocked: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Probes admitted since the circuit went half-open.
    #[serde(default)]
    pub half_open_probes: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderCircuitState {
    /// A fresh closed circuit using the configured defaults.
    pub fn new(provider_id: &str, defaults: &BreakerConfig, now: DateTime<Utc>) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            cooldown_period_ms: defaults.cooldown_period_ms,
            opened_at: None,
            half_opened_at: None,
            next_attempt_at: None,
            total_trips: 0,
            total_calls_blocked: 0,
            last_success_at: None,
            last_failure_at: None,
            half_open_probes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// True while an open circuit is still cooling down at `now`.
    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.state == CircuitState::Open
            && self.next_attempt_at.map(|at| now < at).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_allowed_edges() {
        use CircuitState::*;
        assert!(Closed.can_transition_to(Open, false));
        assert!(Open.can_transition_to(HalfOpen, false));
        assert!(HalfOpen.can_transition_to(Closed, false));
        assert!(HalfOpen.can_transition_to(Open, false));

        assert!(!Closed.can_transition_to(HalfOpen, false));
        assert!(!Open.can_transition_to(Closed, false));
        assert!(Open.can_transition_to(Closed, true));
        assert!(!Closed.can_transition_to(Open, true));
    }

    #[test]
    fn test_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&CircuitState::HalfOpen).unwrap(), "\"half_open\"");
    }

    #[test]
    fn test_cooling_down_window() {
        let now = Utc::now();
        let mut row = ProviderCircuitState::new("hibp", &BreakerConfig::default(), now);
        assert!(!row.is_cooling_down(now));

        row.state = CircuitState::Open;
        row.next_attempt_at = Some(now + Duration::seconds(60));
        assert!(row.is_cooling_down(now));
        assert!(!row.is_cooling_down(now + Duration::seconds(60)));

        row.next_attempt_at = None;
        assert!(!row.is_cooling_down(now));
    }
}
