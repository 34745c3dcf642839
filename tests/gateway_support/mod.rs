//! Shared helpers for gateway integration tests: spawn the gateway on an
//! ephemeral port and point it at a (usually wiremock) backend.

#![allow(dead_code)]

use pluginmind_gateway::config::{Environment, GatewayConfig, TokenMode};
use pluginmind_gateway::server::serve;

pub const SECRET: &str = "integration-test-secret";

pub fn gateway_config(
    backend: &str,
    alt: Option<&str>,
    environment: Environment,
    token_mode: TokenMode,
) -> GatewayConfig {
    GatewayConfig::new(backend, alt, SECRET, environment, token_mode).expect("gateway config")
}

/// Bind an ephemeral port, spawn the gateway on it, return its base URL.
pub async fn spawn_gateway(config: GatewayConfig) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        if let Err(e) = serve(listener, config).await {
            eprintln!("gateway exited: {}", e);
        }
    });
    format!("http://{}", addr)
}

/// Address nothing listens on, for unreachable-backend tests.
pub fn dead_backend() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}
