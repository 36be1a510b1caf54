//! Provider health row and score bands.
//!
//! # Bands
//! ```text
//! score >= healthy_min               → healthy
//! degraded_min <= score < healthy_min → degraded
//! score < degraded_min               → critical
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::HealthConfig;

/// Upper bound of a health score.
pub const MAX_SCORE: u8 = 100;

/// Discrete band derived from a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthBand {
    Healthy,
    Degraded,
    Critical,
}

impl HealthBand {
    /// Band of `score` under the configured thresholds.
    pub fn of(score: u8, config: &HealthConfig) -> Self {
        if score >= config.healthy_min {
            HealthBand::Healthy
        } else if score >= config.degraded_min {
            HealthBand::Degraded
        } else {
            HealthBand::Critical
        }
    }
}

/// Continuous health signal of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider_id: String,
    pub health_score: u8,
    pub is_healthy: bool,
    pub is_degraded: bool,
    pub is_critical: bool,
    pub recent_error_count: u32,
    pub recent_avg_latency_ms: Option<u64>,
    pub last_checked_at: DateTime<Utc>,
}

impl ProviderHealth {
    /// Build a row with bands derived from `score`.
    pub fn new(provider_id: &str, score: u8, config: &HealthConfig, now: DateTime<Utc>) -> Self {
        let mut health = Self {
            provider_id: provider_id.to_string(),
            health_score: 0,
            is_healthy: false,
            is_degraded: false,
            is_critical: false,
            recent_error_count: 0,
            recent_avg_latency_ms: None,
            last_checked_at: now,
        };
        health.set_score(score, config);
        health
    }

    /// Set the score (clamped) and refresh the band flags.
    pub fn set_score(&mut self, score: u8, config: &HealthConfig) {
        self.health_score = score.min(MAX_SCORE);
        let band = HealthBand::of(self.health_score, config);
        self.is_healthy = band == HealthBand::Healthy;
        self.is_degraded = band == HealthBand::Degraded;
        self.is_critical = band == HealthBand::Critical;
    }

    pub fn band(&self, config: &HealthConfig) -> HealthBand {
        HealthBand::of(self.health_score, config)
    }
}
