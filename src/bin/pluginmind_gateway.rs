//!
//! Gateway server binary
//! ---------------------
//! Command-line entry point for the PluginMind proxy gateway. Configuration
//! comes from the environment (`BACKEND_URL` is required and startup fails
//! without it); the listen port can be overridden on the command line.

use anyhow::{Context, Result};
use std::env;

use pluginmind_gateway::config::{GatewayConfig, DEFAULT_HTTP_PORT};
use pluginmind_gateway::server::run_with_port;

fn parse_port_env(name: &str) -> Option<u16> {
    match env::var(name) {
        Ok(val) => val.parse::<u16>().ok(),
        Err(_) => None,
    }
}

fn parse_port_arg(args: &[String], flag: &str) -> Option<u16> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return args[i + 1].parse::<u16>().ok();
        }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber with env filter if provided
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("PluginMind Gateway\n\nUSAGE:\n  pluginmind_gateway [--http-port N]\n\nOPTIONS:\n  --http-port N       HTTP port (env: GATEWAY_HTTP_PORT, default {})\n\nENVIRONMENT:\n  BACKEND_URL         Primary backend address (required)\n  BACKEND_ALT_URL     Alternate backend address tried once on failure\n  SESSION_SECRET      Shared secret for session-cookie verification (required)\n  ENVIRONMENT         'production' restricts CORS and error detail\n  SECURE_TOKEN_MODE   'false' enables the legacy token fallback hint\n", DEFAULT_HTTP_PORT);
        return Ok(());
    }

    // CLI arguments override environment
    let http_port = parse_port_arg(&args, "--http-port")
        .or_else(|| parse_port_env("GATEWAY_HTTP_PORT"))
        .unwrap_or(DEFAULT_HTTP_PORT);

    let config = GatewayConfig::from_env().context("gateway configuration error")?;

    println!(
        "pluginmind gateway starting: port={}, backend={}, alternate={}, env={:?}, token_mode={:?}",
        http_port,
        config.backend_url,
        config.backend_alt_url.as_deref().unwrap_or("(none)"),
        config.environment,
        config.token_mode
    );
    tracing::info!(
        "Using port={} backend={} alternate={:?}",
        http_port,
        config.backend_url,
        config.backend_alt_url
    );

    run_with_port(http_port, config).await
}
