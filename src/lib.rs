//! Provider fault isolation and scan progress convergence.

pub mod admin;
pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod observer;
pub mod resilience;
pub mod store;

pub use config::schema::GuardConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use observer::ScanTracker;
pub use resilience::CircuitBreaker;
