//!
//! Gateway configuration
//! ---------------------
//! Environment-driven startup configuration for the proxy gateway.
//! `BACKEND_URL` is required: nothing should serve traffic without a
//! configured backend, so `from_env` fails hard when it is absent.

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Proxied path that triggers the credential-binding special case.
pub const BINDING_PATH: &str = "auth/google";

/// Header the browser must send to request server-side credential injection.
pub const USE_ID_TOKEN_HEADER: &str = "x-use-id-token";

/// Field name under which the provider credential is injected into the
/// outgoing binding body. It travels only in the body, never in an
/// `Authorization` header.
pub const ID_TOKEN_FIELD: &str = "id_token";

/// Name of the signed session cookie issued by the session store.
pub const SESSION_COOKIE: &str = "pm_session";

/// Debug marker header added to every shaped gateway response.
pub const PROXY_MARKER_HEADER: &str = "x-proxied-by";
pub const PROXY_MARKER_VALUE: &str = "pluginmind-gateway";

/// Default per-attempt budget for outbound backend calls. A timeout is
/// treated identically to a network failure.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_HTTP_PORT: u16 = 8787;

/// Deployment environment. Production suppresses upstream diagnostic detail
/// and restricts CORS origin echoing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Whether the raw provider credential may ever be surfaced to the browser.
///
/// `Secure`: the credential only lives inside the verified session token and
/// is injected server-side. `Legacy`: a migration shim — the gateway signals
/// `useLegacy` on the "no credential" auth failure so the client may fall
/// back to supplying its own token in the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMode {
    Secure,
    Legacy,
}

impl TokenMode {
    pub fn is_legacy(&self) -> bool {
        matches!(self, TokenMode::Legacy)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Validate a backend address and normalize it for path concatenation.
fn normalize_url(raw: &str, what: &str) -> Result<String> {
    let url = reqwest::Url::parse(raw.trim()).with_context(|| format!("invalid {}: {}", what, raw))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("invalid {}: unsupported scheme {}", what, url.scheme());
    }
    Ok(raw.trim().trim_end_matches('/').to_string())
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Primary backend address, e.g. `http://backend:8000`.
    pub backend_url: String,
    /// Optional alternate backend address tried once after a primary
    /// transport failure.
    pub backend_alt_url: Option<String>,
    /// Shared HS256 secret used to verify the session cookie.
    pub session_secret: String,
    pub environment: Environment,
    pub token_mode: TokenMode,
    /// Hard per-attempt budget for outbound backend calls.
    pub upstream_timeout: Duration,
}

impl GatewayConfig {
    /// Read configuration from the environment. `BACKEND_URL` and
    /// `SESSION_SECRET` are required; everything else has a default.
    pub fn from_env() -> Result<Self> {
        let backend_url = env::var("BACKEND_URL")
            .context("BACKEND_URL must be set: the gateway cannot serve traffic without a backend")?;
        let backend_url = normalize_url(&backend_url, "BACKEND_URL")?;

        let backend_alt_url = match env::var("BACKEND_ALT_URL") {
            Ok(v) if !v.trim().is_empty() => Some(normalize_url(&v, "BACKEND_ALT_URL")?),
            _ => None,
        };

        let session_secret = env::var("SESSION_SECRET")
            .context("SESSION_SECRET must be set to verify session cookies")?;

        let environment = env::var("ENVIRONMENT")
            .map(|v| Environment::parse(&v))
            .unwrap_or(Environment::Development);

        let token_mode = match env::var("SECURE_TOKEN_MODE").ok().as_deref().and_then(parse_bool) {
            Some(false) => TokenMode::Legacy,
            _ => TokenMode::Secure,
        };

        Ok(Self {
            backend_url,
            backend_alt_url,
            session_secret,
            environment,
            token_mode,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        })
    }

    /// Construct directly, validating both backend addresses.
    pub fn new(
        backend_url: &str,
        backend_alt_url: Option<&str>,
        session_secret: &str,
        environment: Environment,
        token_mode: TokenMode,
    ) -> Result<Self> {
        let backend_url = normalize_url(backend_url, "backend URL")?;
        let backend_alt_url = match backend_alt_url {
            Some(alt) => Some(normalize_url(alt, "alternate backend URL")?),
            None => None,
        };
        Ok(Self {
            backend_url,
            backend_alt_url,
            session_secret: session_secret.to_string(),
            environment,
            token_mode,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        })
    }

    /// Override the per-attempt backend timeout.
    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Outbound URLs to attempt in order for a proxied path: primary first,
    /// then the alternate when configured.
    pub fn backend_targets(&self, path: &str, query: Option<&str>) -> Vec<String> {
        let suffix = match query {
            Some(q) if !q.is_empty() => format!("{}?{}", path, q),
            _ => path.to_string(),
        };
        let mut targets = vec![format!("{}/{}", self.backend_url, suffix)];
        if let Some(alt) = &self.backend_alt_url {
            targets.push(format!("{}/{}", alt, suffix));
        }
        targets
    }
}
