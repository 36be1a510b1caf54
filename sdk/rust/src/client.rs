//! Client for the provider guard control API.
//!
//! Scan workers call `check` before a provider call and `record_success` /
//! `record_failure` afterwards, or let `guarded` do all three.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

pub const DEFAULT_TOKEN_HEADER: &str = "x-internal-token";

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rejected: {0}")]
    Rejected(String),

    /// Service-side failure; nothing was recorded.
    #[error("service error ({status}): {message}")]
    Service { status: StatusCode, message: String },

    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Outcome of a guarded call.
#[derive(Debug, Error)]
pub enum GuardedError<E> {
    /// The circuit is open; the provider was not called.
    #[error("provider blocked: {}", reason.as_deref().unwrap_or("circuit open"))]
    Blocked {
        reason: Option<String>,
        next_attempt_at: Option<DateTime<Utc>>,
    },

    #[error(transparent)]
    Guard(GuardError),

    /// The provider call itself failed (and was recorded as a failure).
    #[error("provider call failed: {0}")]
    Call(E),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub allowed: bool,
    pub state: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider_id: String,
    pub health_score: u8,
    pub is_healthy: bool,
    pub is_degraded: bool,
    pub is_critical: bool,
    pub recent_error_count: u32,
    #[serde(default)]
    pub recent_avg_latency_ms: Option<u64>,
    pub last_checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub provider_id: String,
    pub state: String,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_period_ms: u64,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub half_opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub total_trips: u64,
    pub total_calls_blocked: u64,
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub health: Option<ProviderHealth>,
    pub circuit_breaker: CircuitSnapshot,
}

#[derive(Debug, Deserialize)]
struct Ack {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
pub struct GuardClient {
    client: Client,
    endpoint: String,
    token: String,
    header_name: String,
}

impl GuardClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: format!("{}/v1/circuit-breaker", base_url.trim_end_matches('/')),
            token: token.to_string(),
            header_name: DEFAULT_TOKEN_HEADER.to_string(),
        }
    }

    /// Use a non-default shared-secret header.
    pub fn with_header_name(mut self, header_name: &str) -> Self {
        self.header_name = header_name.to_string();
        self
    }

    pub async fn check(&self, provider_id: &str) -> Result<CheckResult, GuardError> {
        self.send(json!({ "action": "check", "provider_id": provider_id })).await
    }

    pub async fn record_success(
        &self,
        provider_id: &str,
        latency: Option<Duration>,
    ) -> Result<(), GuardError> {
        let mut body = json!({ "action": "record_success", "provider_id": provider_id });
        if let Some(latency) = latency {
            body["latency_ms"] = json!(latency.as_millis() as u64);
        }
        self.send::<Ack>(body).await.map(|_| ())
    }

    pub async fn record_failure(
        &self,
        provider_id: &str,
        error_message: Option<&str>,
    ) -> Result<(), GuardError> {
        let body = json!({
            "action": "record_failure",
            "provider_id": provider_id,
            "error_message": error_message,
        });
        self.send::<Ack>(body).await.map(|_| ())
    }

    /// Force the circuit closed. Returns the service's confirmation message.
    pub async fn manual_reset(&self, provider_id: &str) -> Result<String, GuardError> {
        let ack: Ack = self
            .send(json!({ "action": "manual_reset", "provider_id": provider_id }))
            .await?;
        Ok(ack.message.unwrap_or_default())
    }

    pub async fn get_health(&self, provider_id: &str) -> Result<HealthReport, GuardError> {
        self.send(json!({ "action": "get_health", "provider_id": provider_id })).await
    }

    /// Check, call, record.
    ///
    /// A failure to record after the call is ignored so the provider's
    /// result is never lost.
    pub async fn guarded<T, E, F, Fut>(&self, provider_id: &str, call: F) -> Result<T, GuardedError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let decision = self.check(provider_id).await.map_err(GuardedError::Guard)?;
        if !decision.allowed {
            return Err(GuardedError::Blocked {
                reason: decision.reason,
                next_attempt_at: decision.next_attempt_at,
            });
        }

        let started = Instant::now();
        match call().await {
            Ok(value) => {
                let _ = self.record_success(provider_id, Some(started.elapsed())).await;
                Ok(value)
            }
            Err(e) => {
                let message = e.to_string();
                let _ = self.record_failure(provider_id, Some(&message)).await;
                Err(GuardedError::Call(e))
            }
        }
    }

    async fn send<T: DeserializeOwned>(&self, body: serde_json::Value) -> Result<T, GuardError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header(self.header_name.as_str(), &self.token)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        if status.is_success() {
            return Ok(serde_json::from_str(&text)?);
        }

        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.error)
            .unwrap_or(text);
        Err(match status {
            StatusCode::UNAUTHORIZED => GuardError::Unauthorized(message),
            StatusCode::BAD_REQUEST => GuardError::Rejected(message),
            _ => GuardError::Service { status, message },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_is_normalized() {
        let client = GuardClient::new("http://127.0.0.1:8080/", "t");
        assert_eq!(client.endpoint, "http://127.0.0.1:8080/v1/circuit-breaker");
    }

    #[test]
    fn test_blocked_check_decodes() {
        let json = r#"{"allowed":false,"state":"open","reason":"Circuit breaker is open",
            "next_attempt_at":"2026-01-01T00:01:00Z"}"#;
        let result: CheckResult = serde_json::from_str(json).unwrap();
        assert!(!result.allowed);
        assert_eq!(result.state, "open");
        assert!(result.next_attempt_at.is_some());
    }
}
