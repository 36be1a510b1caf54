use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::http::response::ApiError;
use crate::http::server::AppState;
use crate::resilience::CircuitState;
use crate::store::{CircuitEvent, ProviderRecord};

const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 1_000;

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub status: String,
    pub providers: ProviderCounts,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProviderCounts {
    pub total: usize,
    pub closed: usize,
    pub half_open: usize,
    pub open: usize,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

pub async fn get_status(State(state): State<AppState>) -> Result<Json<SystemStatus>, ApiError> {
    let records = state.breaker.list_providers().await?;

    let mut providers = ProviderCounts {
        total: records.len(),
        ..ProviderCounts::default()
    };
    for record in &records {
        match record.circuit.state {
            CircuitState::Closed => providers.closed += 1,
            CircuitState::HalfOpen => providers.half_open += 1,
            CircuitState::Open => providers.open += 1,
        }
    }

    Ok(Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "operational".to_string(),
        providers,
    }))
}

pub async fn get_providers(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProviderRecord>>, ApiError> {
    Ok(Json(state.breaker.list_providers().await?))
}

pub async fn get_provider_events(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<CircuitEvent>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);
    Ok(Json(state.breaker.events(&provider_id, limit).await?))
}

pub async fn reset_provider(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.breaker.manual_reset(&provider_id).await?;
    tracing::info!(provider_id = %provider_id, "Circuit reset from admin API");
    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("Circuit breaker reset for {provider_id}"),
    })))
}
