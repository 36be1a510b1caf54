//! Provider health subsystem.
//!
//! # Data Flow
//! ```text
//! record_success / record_failure (resilience::circuit_breaker)
//!     → passive.rs (fold outcome into score)
//!     → state.rs (clamp, derive band flags)
//!     → committed together with the circuit row
//! ```
//!
//! # Design Decisions
//! - Score is independent of the discrete circuit state
//! - Health state is per-provider
//! - Band thresholds come from `[health]` config

pub mod passive;
pub mod state;

pub use passive::{CallOutcome, HealthScorer};
pub use state::{HealthBand, ProviderHealth};
