//!
//! Client request layer
//! --------------------
//! Thin HTTP client used by UI code to reach the backend through the proxy
//! gateway. Every call is routed via `/api/proxy/{path}` with the session
//! cookie attached; a 401 from the gateway is surfaced as a dedicated
//! re-authentication error and never silently swallowed. Retry policy
//! beyond that is owned by the caller.

use parking_lot::RwLock;
use reqwest::header::{HeaderMap, COOKIE};
use reqwest::{Method, Url};
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::SESSION_COOKIE;

pub mod binder;
pub use binder::{BindError, BindingState, BindingStore, BoundIdentity, CredentialBinder};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The gateway answered 401: the caller must run the re-authentication
    /// flow before retrying.
    #[error("re-authentication required")]
    ReauthRequired,
    #[error("gateway error ({status}): {message}")]
    Gateway { status: u16, message: String },
    #[error("invalid gateway URL: {0}")]
    Url(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// HTTP client bound to one gateway instance.
pub struct GatewayClient {
    base: Url,
    client: reqwest::Client,
    /// Session token mirrored into the `pm_session` cookie on every call,
    /// standing in for the browser cookie jar.
    session_token: RwLock<Option<String>>,
}

impl GatewayClient {
    pub fn new(base: &str) -> Result<Self, ClientError> {
        let base = Url::parse(base).map_err(|e| ClientError::Url(e.to_string()))?;
        let client = reqwest::Client::builder().cookie_store(true).build()?;
        Ok(Self { base, client, session_token: RwLock::new(None) })
    }

    pub fn set_session_token(&self, token: &str) {
        *self.session_token.write() = Some(token.to_string());
    }

    pub fn clear_session_token(&self) {
        *self.session_token.write() = None;
    }

    fn proxy_url(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(&format!("/api/proxy/{}", path.trim_start_matches('/')))
            .map_err(|e| ClientError::Url(e.to_string()))
    }

    pub async fn get(&self, path: &str) -> Result<Value, ClientError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, ClientError> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, ClientError> {
        self.request_with_headers(method, path, HeaderMap::new(), body).await
    }

    pub(crate) async fn request_with_headers(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Option<&Value>,
    ) -> Result<Value, ClientError> {
        let url = self.proxy_url(path)?;
        let mut req = self.client.request(method, url).headers(headers);
        let token = { self.session_token.read().as_deref().map(|t| t.to_string()) };
        if let Some(token) = token {
            req = req.header(COOKIE, format!("{}={}", SESSION_COOKIE, token));
        }
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await?;
        Self::check(resp).await
    }

    async fn check(resp: reqwest::Response) -> Result<Value, ClientError> {
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ClientError::ReauthRequired);
        }
        let value: Value = resp.json().await.unwrap_or_else(|_| json!({}));
        if !status.is_success() {
            let message = value
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("request failed")
                .to_string();
            return Err(ClientError::Gateway { status: status.as_u16(), message });
        }
        Ok(value)
    }
}
