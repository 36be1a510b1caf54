//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the guard
//! service and the scan tracker. All types derive Serde traits for
//! deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GuardConfig {
    /// Listener configuration (bind address, connection cap).
    pub listener: ListenerConfig,

    /// Internal caller authentication.
    pub auth: AuthConfig,

    /// Circuit breaker defaults applied to newly created provider rows.
    pub breaker: BreakerConfig,

    /// Health scoring constants.
    pub health: HealthConfig,

    /// Persistence of circuit rows and the event journal.
    pub store: StoreConfig,

    /// Scan progress tracker settings.
    pub observer: ObserverConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub security: SecurityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent in-flight requests (backpressure).
    pub max_connections: usize,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            request_timeout_secs: 30,
        }
    }
}

/// Shared-secret authentication for scan workers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Expected value of the internal token header. Empty rejects everything.
    pub internal_token: String,

    /// Header carrying the token.
    pub header_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            internal_token: String::new(),
            header_name: "x-internal-token".to_string(),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures in `closed` before the circuit trips.
    pub failure_threshold: u32,

    /// Consecutive successes in `half_open` before the circuit closes.
    pub success_threshold: u32,

    /// Time an open circuit blocks calls, in milliseconds.
    pub cooldown_period_ms: u64,

    /// Cap on probes admitted while half-open. `None` admits every call.
    pub half_open_max_probes: Option<u32>,

    /// Compare-and-swap attempts before a write is reported as conflicted.
    pub max_commit_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown_period_ms: 60_000,
            half_open_max_probes: None,
            max_commit_attempts: 8,
        }
    }
}

/// Health scoring configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Points added per successful call.
    pub success_bonus: u8,

    /// Points removed per failed call.
    pub failure_penalty: u8,

    /// Lowest score still considered healthy.
    pub healthy_min: u8,

    /// Lowest score still considered degraded (below is critical).
    pub degraded_min: u8,

    /// Score of a row first observed through a success.
    pub initial_success_score: u8,

    /// Score of a row first observed through a failure.
    pub initial_failure_score: u8,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            success_bonus: 2,
            failure_penalty: 10,
            healthy_min: 70,
            degraded_min: 40,
            initial_success_score: 100,
            initial_failure_score: 80,
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON snapshot of circuit and health rows, loaded on start and
    /// written on shutdown.
    pub persistence_path: Option<String>,

    /// JSON-lines file mirroring every journal event.
    pub journal_path: Option<String>,

    /// Events kept in memory per provider.
    pub journal_retain: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            persistence_path: None,
            journal_path: None,
            journal_retain: 1_000,
        }
    }
}

/// Scan tracker configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Fallback polling interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Watchdog tick in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Push silence after which the watchdog restarts polling.
    pub stale_after_ms: u64,

    /// Delay between observing a terminal status and clearing the pointer.
    pub clear_grace_ms: u64,

    /// Keep polling while the push channel delivers messages.
    pub poll_while_connected: bool,

    /// File holding the persisted scan pointer.
    pub pointer_path: Option<String>,

    /// Base URL of the REST data surface (e.g. "https://db.example/rest/v1").
    pub rest_url: String,

    /// WebSocket URL of the realtime endpoint.
    pub realtime_url: String,

    /// API key sent to both surfaces.
    pub api_key: String,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            heartbeat_interval_ms: 5_000,
            stale_after_ms: 15_000,
            clear_grace_ms: 3_000,
            poll_while_connected: true,
            pointer_path: None,
            rest_url: "http://localhost:54321/rest/v1".to_string(),
            realtime_url: "ws://localhost:54321/realtime/v1/websocket".to_string(),
            api_key: String::new(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format ("pretty" or "json").
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Mount the admin routes.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
        }
    }
}

/// Security hardening configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum body size in bytes.
    pub max_body_size: usize,

    /// Maximum accepted length of a provider id.
    pub max_provider_id_len: usize,

    /// Maximum stored length of an error message; longer text is truncated.
    pub max_error_message_len: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_body_size: 64 * 1024,
            max_provider_id_len: 128,
            max_error_message_len: 2_048,
        }
    }
}
