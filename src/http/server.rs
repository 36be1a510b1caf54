//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router for the control, liveness and admin endpoints
//! - Wire up middleware (tracing, request ID, timeout, body and concurrency limits)
//! - Apply hot-reloaded configuration to the live state
//! - Serve until shutdown is signalled

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::admin;
use crate::config::GuardConfig;
use crate::http::control::{control_handler, internal_auth_middleware};
use crate::http::request::{propagate_request_id_layer, set_request_id_layer};
use crate::resilience::{BreakerSettings, CircuitBreaker};
use crate::store::MemoryStore;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub breaker: CircuitBreaker,
    pub config: Arc<ArcSwap<GuardConfig>>,
}

/// HTTP server for the breaker control plane.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    /// Create a server around an existing breaker.
    pub fn new(config: GuardConfig, breaker: CircuitBreaker) -> Self {
        let state = AppState {
            breaker,
            config: Arc::new(ArcSwap::from_pointee(config.clone())),
        };
        let router = Self::build_router(&config, state.clone());
        Self { router, state }
    }

    /// Create a server backed by a fresh `MemoryStore` built from `[store]`.
    pub fn from_config(config: GuardConfig) -> std::io::Result<Self> {
        let store = Arc::new(MemoryStore::from_config(&config.store)?);
        let breaker = CircuitBreaker::new(
            store,
            BreakerSettings::new(config.breaker.clone(), config.health.clone()),
        );
        Ok(Self::new(config, breaker))
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &GuardConfig, state: AppState) -> Router {
        let control = Router::new()
            .route("/v1/circuit-breaker", post(control_handler))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                internal_auth_middleware,
            ));

        let mut app = Router::new().route("/healthz", get(healthz)).merge(control);
        if config.admin.enabled {
            app = app.merge(admin::setup_admin_router(state.clone()));
        }

        app.with_state(state)
            .layer(DefaultBodyLimit::max(config.security.max_body_size))
            .layer(TimeoutLayer::new(Duration::from_secs(config.listener.request_timeout_secs)))
            .layer(middleware::from_fn_with_state(
                Arc::new(Semaphore::new(config.listener.max_connections)),
                limit_in_flight,
            ))
            .layer(propagate_request_id_layer())
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id_layer())
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the server until `shutdown` fires. Config snapshots arriving on
    /// `config_updates` replace the live config and breaker settings.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<GuardConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let state = self.state.clone();
        let reloader = tokio::spawn(async move {
            while let Some(config) = config_updates.recv().await {
                state.breaker.update_settings(BreakerSettings::new(
                    config.breaker.clone(),
                    config.health.clone(),
                ));
                state.config.store(Arc::new(config));
                tracing::info!("Live configuration replaced");
            }
        });

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server draining");
            })
            .await?;

        reloader.abort();
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Shed load once `max_connections` requests are in flight.
async fn limit_in_flight(
    State(limit): State<Arc<Semaphore>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match limit.try_acquire() {
        Ok(_permit) => next.run(request).await,
        Err(_) => {
            tracing::warn!(uri = %request.uri(), "In-flight limit reached, shedding request");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "Too many in-flight requests" })),
            )
                .into_response()
        }
    }
}

/// `GET /healthz`
async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
