//! Passive health scoring.
//!
//! The score follows the stream of recorded call outcomes, not a sliding
//! window: every success adds `success_bonus`, every failure subtracts
//! `failure_penalty`, clamped to `0..=100`. It moves before the circuit
//! trips, so degradation is visible early.

use chrono::{DateTime, Utc};

use crate::config::HealthConfig;
use crate::health::state::{ProviderHealth, MAX_SCORE};

/// Outcome of one provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success { latency_ms: Option<u64> },
    Failure,
}

/// Applies call outcomes to health rows.
#[derive(Debug, Clone, Default)]
pub struct HealthScorer {
    config: HealthConfig,
}

impl HealthScorer {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Fold `outcome` into `current`, creating the row on first observation.
    pub fn observe(
        &self,
        provider_id: &str,
        current: Option<&ProviderHealth>,
        outcome: CallOutcome,
        now: DateTime<Utc>,
    ) -> ProviderHealth {
        let Some(current) = current else {
            let score = match outcome {
                CallOutcome::Success { .. } => self.config.initial_success_score,
                CallOutcome::Failure => self.config.initial_failure_score,
            };
            let mut health = ProviderHealth::new(provider_id, score, &self.config, now);
            match outcome {
                CallOutcome::Success { latency_ms } => health.recent_avg_latency_ms = latency_ms,
                CallOutcome::Failure => health.recent_error_count = 1,
            }
            return health;
        };

        let mut next = current.clone();
        match outcome {
            CallOutcome::Success { latency_ms } => {
                let score = current
                    .health_score
                    .saturating_add(self.config.success_bonus)
                    .min(MAX_SCORE);
                next.set_score(score, &self.config);
                next.recent_error_count = 0;
                // Last write wins; not a rolling average.
                if latency_ms.is_some() {
                    next.recent_avg_latency_ms = latency_ms;
                }
            }
            CallOutcome::Failure => {
                let score = current.health_score.saturating_sub(self.config.failure_penalty);
                next.set_score(score, &self.config);
                next.recent_error_count = current.recent_error_count.saturating_add(1);
            }
        }
        next.last_checked_at = now;
        next
    }
}
