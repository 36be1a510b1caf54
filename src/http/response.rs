//! Error responses.
//!
//! Every failure leaves the service as `{"error": "..."}`. An open circuit is
//! not a failure and never passes through here.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::resilience::BreakerError;

/// Errors returned to HTTP callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or mismatched internal token / admin key.
    #[error("Unauthorized - Valid internal token required")]
    Unauthorized,

    /// Malformed request; nothing was changed.
    #[error("{0}")]
    Validation(String),

    /// Infrastructure failure; nothing was recorded, caller may retry.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BreakerError> for ApiError {
    fn from(err: BreakerError) -> Self {
        match err {
            BreakerError::Validation(message) => ApiError::Validation(message),
            BreakerError::Store(e) => {
                tracing::error!(error = %e, "Store failure, nothing recorded");
                ApiError::Internal("Failed to access circuit breaker state".to_string())
            }
            BreakerError::Conflict { .. } => {
                tracing::error!(error = %err, "Write contention, nothing recorded");
                ApiError::Internal("Circuit breaker state is busy, retry".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::from(BreakerError::Validation("provider_id is required".into())).status(),
            StatusCode::BAD_REQUEST
        );
        let store = ApiError::from(BreakerError::Store(StoreError::Unavailable("down".into())));
        assert_eq!(store.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!store.to_string().contains("down"));
    }
}
