//! Provider guard service.
//!
//! # Architecture Overview
//!
//! ```text
//!   scan worker ── POST /v1/circuit-breaker ──▶ http::control
//!                                                  │ BreakerCommand
//!                                                  ▼
//!                                         resilience::CircuitBreaker
//!                                                  │ load / decide / CAS commit
//!                                                  ▼
//!                                   store::MemoryStore (+ journal, snapshot)
//!
//!   operator ── /admin/* (bearer) ──▶ admin handlers ──▶ same breaker
//!
//!   config file ── notify ──▶ ConfigWatcher ──▶ ArcSwap<GuardConfig>
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use provider_guard::config::{load_or_default, watcher::ConfigWatcher};
use provider_guard::http::HttpServer;
use provider_guard::lifecycle::{spawn_signal_handler, Shutdown};
use provider_guard::observability::{init_logging, metrics};
use provider_guard::resilience::{BreakerSettings, CircuitBreaker};
use provider_guard::store::MemoryStore;

#[derive(Debug, Parser)]
#[command(name = "provider-guard", version, about = "Provider circuit breaker service")]
struct Args {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_or_default(args.config.as_deref())?;

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "provider-guard starting");
    if config.auth.internal_token.is_empty() {
        tracing::warn!("No internal token configured, every control request will be rejected");
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        failure_threshold = config.breaker.failure_threshold,
        success_threshold = config.breaker.success_threshold,
        cooldown_period_ms = config.breaker.cooldown_period_ms,
        admin_enabled = config.admin.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let store = Arc::new(MemoryStore::from_config(&config.store)?);
    let breaker = CircuitBreaker::new(
        store.clone(),
        BreakerSettings::new(config.breaker.clone(), config.health.clone()),
    );

    let (_watcher, config_updates) = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (Some(watcher.run()?), updates)
        }
        None => {
            let (_, updates) = mpsc::unbounded_channel();
            (None, updates)
        }
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let server = HttpServer::new(config, breaker);
    server.run(listener, config_updates, shutdown.subscribe()).await?;

    if let Err(e) = store.save_snapshot() {
        tracing::error!(error = %e, "Failed to flush provider snapshot");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
