//! Shared utilities for integration and load testing.

use std::net::SocketAddr;

use provider_guard::config::GuardConfig;
use provider_guard::http::HttpServer;
use provider_guard::lifecycle::Shutdown;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub const TOKEN: &str = "test-internal-token";
#[allow(dead_code)]
pub const ADMIN_KEY: &str = "test-admin-key";

/// Config bound to `addr` with the test token set.
pub fn test_config(addr: SocketAddr) -> GuardConfig {
    let mut config = GuardConfig::default();
    config.listener.bind_address = addr.to_string();
    config.auth.internal_token = TOKEN.to_string();
    config
}

/// A running server and the handles that steer it.
pub struct TestServer {
    pub base_url: String,
    pub shutdown: Shutdown,
    #[allow(dead_code)]
    pub config_updates: mpsc::UnboundedSender<GuardConfig>,
}

/// Bind and serve `config` in the background. The listener is bound before
/// returning, so requests can be sent right away.
pub async fn start_server(config: GuardConfig) -> TestServer {
    let addr: SocketAddr = config.listener.bind_address.parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let server = HttpServer::from_config(config).unwrap();

    let shutdown = Shutdown::new();
    let (config_updates, updates_rx) = mpsc::unbounded_channel();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, updates_rx, server_shutdown).await;
    });

    TestServer {
        base_url: format!("http://{}", addr),
        shutdown,
        config_updates,
    }
}

/// Raw control request, for cases the SDK cannot express.
#[allow(dead_code)]
pub async fn raw_control(
    base_url: &str,
    token: Option<&str>,
    body: &str,
) -> (u16, serde_json::Value) {
    let mut request = reqwest::Client::new()
        .post(format!("{}/v1/circuit-breaker", base_url))
        .header("content-type", "application/json")
        .body(body.to_string());
    if let Some(token) = token {
        request = request.header("x-internal-token", token);
    }
    let response = request.send().await.unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}
