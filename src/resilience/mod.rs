//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Scan worker, before a provider call:
//!     → circuit_breaker.rs check()        (admission control)
//! Scan worker, after the call:
//!     → circuit_breaker.rs record_*()     (counters, health, journal)
//!
//! Realtime client reconnects:
//!     → backoff.rs (ReconnectBackoff)
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod state;

pub use circuit_breaker::{BreakerError, BreakerSettings, CheckResponse, CircuitBreaker, HealthReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use state::{CircuitState, ProviderCircuitState};
