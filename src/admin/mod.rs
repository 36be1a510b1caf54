//! Operator endpoints: provider listing, journal timelines, manual reset.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/providers", get(get_providers))
        .route("/admin/providers/{id}/events", get(get_provider_events))
        .route("/admin/providers/{id}/reset", post(reset_provider))
        .route_layer(middleware::from_fn_with_state(state, admin_auth_middleware))
}
