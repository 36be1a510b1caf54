//! HTTP control plane.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware stack)
//!     → request.rs (request ID assigned and echoed)
//!     → control.rs (shared-secret check, body → BreakerCommand)
//!     → CircuitBreaker
//!     → response.rs (errors as {"error": ...})
//! ```

pub mod control;
pub mod request;
pub mod response;
pub mod server;

pub use control::{BreakerCommand, ControlRequest, ControlResponse};
pub use request::X_REQUEST_ID;
pub use response::ApiError;
pub use server::{AppState, HttpServer};
