//! Internal circuit breaker control endpoint.
//!
//! `POST /v1/circuit-breaker`, authenticated with a shared secret header.
//! The body is decoded into a `BreakerCommand` before the breaker sees it.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::config::SecurityConfig;
use crate::http::request::request_id_of;
use crate::http::response::ApiError;
use crate::http::server::AppState;
use crate::resilience::{CheckResponse, CircuitBreaker, HealthReport};

/// Wire names of the control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Check,
    RecordSuccess,
    RecordFailure,
    ManualReset,
    GetHealth,
}

/// Raw control request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

/// A validated breaker operation.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerCommand {
    Check { provider_id: String },
    RecordSuccess { provider_id: String, latency_ms: Option<u64> },
    RecordFailure { provider_id: String, error_message: Option<String> },
    ManualReset { provider_id: String },
    GetHealth { provider_id: String },
}

/// Body returned for each command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ControlResponse {
    Check(CheckResponse),
    Ack {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Health(HealthReport),
}

impl BreakerCommand {
    /// Validate a request against the configured limits.
    pub fn from_request(request: ControlRequest, limits: &SecurityConfig) -> Result<Self, ApiError> {
        let provider_id = request
            .provider_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::Validation("provider_id is required".to_string()))?;

        if provider_id.len() > limits.max_provider_id_len {
            return Err(ApiError::Validation(format!(
                "provider_id exceeds {} bytes",
                limits.max_provider_id_len
            )));
        }

        Ok(match request.action {
            ControlAction::Check => BreakerCommand::Check { provider_id },
            ControlAction::RecordSuccess => BreakerCommand::RecordSuccess {
                provider_id,
                latency_ms: request
                    .latency_ms
                    .filter(|ms| ms.is_finite() && *ms >= 0.0)
                    .map(|ms| ms.round() as u64),
            },
            ControlAction::RecordFailure => BreakerCommand::RecordFailure {
                provider_id,
                error_message: request
                    .error_message
                    .map(|msg| truncate(msg, limits.max_error_message_len)),
            },
            ControlAction::ManualReset => BreakerCommand::ManualReset { provider_id },
            ControlAction::GetHealth => BreakerCommand::GetHealth { provider_id },
        })
    }

    pub fn provider_id(&self) -> &str {
        match self {
            BreakerCommand::Check { provider_id }
            | BreakerCommand::RecordSuccess { provider_id, .. }
            | BreakerCommand::RecordFailure { provider_id, .. }
            | BreakerCommand::ManualReset { provider_id }
            | BreakerCommand::GetHealth { provider_id } => provider_id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            BreakerCommand::Check { .. } => "check",
            BreakerCommand::RecordSuccess { .. } => "record_success",
            BreakerCommand::RecordFailure { .. } => "record_failure",
            BreakerCommand::ManualReset { .. } => "manual_reset",
            BreakerCommand::GetHealth { .. } => "get_health",
        }
    }

    pub async fn execute(self, breaker: &CircuitBreaker) -> Result<ControlResponse, ApiError> {
        let response = match self {
            BreakerCommand::Check { provider_id } => {
                ControlResponse::Check(breaker.check(&provider_id).await?)
            }
            BreakerCommand::RecordSuccess { provider_id, latency_ms } => {
                breaker.record_success(&provider_id, latency_ms).await?;
                ControlResponse::Ack { success: true, message: None }
            }
            BreakerCommand::RecordFailure { provider_id, error_message } => {
                breaker
                    .record_failure(&provider_id, error_message.as_deref())
                    .await?;
                ControlResponse::Ack { success: true, message: None }
            }
            BreakerCommand::ManualReset { provider_id } => {
                breaker.manual_reset(&provider_id).await?;
                ControlResponse::Ack {
                    success: true,
                    message: Some(format!("Circuit breaker reset for {provider_id}")),
                }
            }
            BreakerCommand::GetHealth { provider_id } => {
                ControlResponse::Health(breaker.get_health(&provider_id).await?)
            }
        };
        Ok(response)
    }
}

/// Cut `message` to at most `max` bytes on a char boundary.
fn truncate(mut message: String, max: usize) -> String {
    if message.len() > max {
        let mut end = max;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

/// Reject requests without the shared secret before the body is read.
pub async fn internal_auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let config = state.config.load();
    let expected = config.auth.internal_token.as_str();
    let presented = request
        .headers()
        .get(config.auth.header_name.as_str())
        .and_then(|v| v.to_str().ok());

    match presented {
        Some(token) if !expected.is_empty() && token == expected => Ok(next.run(request).await),
        _ => {
            tracing::warn!(
                request_id = %request_id_of(&request),
                uri = %request.uri(),
                "Rejected control request without valid internal token"
            );
            Err(ApiError::Unauthorized)
        }
    }
}

/// `POST /v1/circuit-breaker`
pub async fn control_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ControlResponse>, ApiError> {
    let request: ControlRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(format!("Invalid request: {e}")))?;
    let command = BreakerCommand::from_request(request, &state.config.load().security)?;

    let action = command.action();
    let provider_id = command.provider_id().to_string();
    let response = command.execute(&state.breaker).await;
    match &response {
        Ok(_) => tracing::debug!(action, provider_id = %provider_id, "Control request served"),
        Err(e) => tracing::error!(action, provider_id = %provider_id, error = %e, "Control request failed"),
    }
    response.map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: &str) -> ControlRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_commands_from_requests() {
        let limits = SecurityConfig::default();

        let cmd = BreakerCommand::from_request(
            request(r#"{"action":"record_success","provider_id":"hibp","latency_ms":412.6}"#),
            &limits,
        )
        .unwrap();
        assert_eq!(
            cmd,
            BreakerCommand::RecordSuccess { provider_id: "hibp".into(), latency_ms: Some(413) }
        );

        let cmd = BreakerCommand::from_request(
            request(r#"{"action":"get_health","provider_id":" shodan "}"#),
            &limits,
        )
        .unwrap();
        assert_eq!(cmd.provider_id(), "shodan");
        assert_eq!(cmd.action(), "get_health");
    }

    #[test]
    fn test_missing_provider_is_rejected() {
        let limits = SecurityConfig::default();
        for body in [r#"{"action":"check"}"#, r#"{"action":"check","provider_id":"   "}"#] {
            let err = BreakerCommand::from_request(request(body), &limits).unwrap_err();
            assert_eq!(err.to_string(), "provider_id is required");
        }
    }

    #[test]
    fn test_unknown_action_does_not_decode() {
        assert!(serde_json::from_str::<ControlRequest>(r#"{"action":"explode","provider_id":"x"}"#).is_err());
    }

    #[test]
    fn test_limits_apply() {
        let limits = SecurityConfig {
            max_provider_id_len: 4,
            max_error_message_len: 5,
            ..SecurityConfig::default()
        };
        assert!(BreakerCommand::from_request(
            request(r#"{"action":"check","provider_id":"toolong"}"#),
            &limits
        )
        .is_err());

        let cmd = BreakerCommand::from_request(
            request(r#"{"action":"record_failure","provider_id":"hibp","error_message":"héllo world"}"#),
            &limits,
        )
        .unwrap();
        assert_eq!(
            cmd,
            BreakerCommand::RecordFailure { provider_id: "hibp".into(), error_message: Some("héll".into()) }
        );
    }

    #[test]
    fn test_negative_latency_is_dropped() {
        let cmd = BreakerCommand::from_request(
            request(r#"{"action":"record_success","provider_id":"hibp","latency_ms":-3}"#),
            &SecurityConfig::default(),
        )
        .unwrap();
        assert_eq!(cmd, BreakerCommand::RecordSuccess { provider_id: "hibp".into(), latency_ms: None });
    }

    #[test]
    fn test_ack_shapes() {
        let ack = serde_json::to_value(ControlResponse::Ack { success: true, message: None }).unwrap();
        assert_eq!(ack, serde_json::json!({"success": true}));
    }
}
