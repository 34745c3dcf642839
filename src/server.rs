//!
//! Proxy gateway HTTP server
//! -------------------------
//! The Axum-based server-side entry point through which every browser call
//! to the backend passes. It hides the backend's real network location and
//! attaches trust material the browser must never see directly.
//!
//! Responsibilities:
//! - General forwarding of `ANY /api/proxy/{*path}` to the configured
//!   backend, with a single primary -> alternate fallback on transport
//!   failure and a hard per-attempt timeout.
//! - The credential-binding special case at `POST auth/google`: verify the
//!   session cookie, inject the provider credential into the outgoing body,
//!   and never into an `Authorization` header.
//! - Response shaping: status pass-through, whitelisted response headers,
//!   JSON (or best-effort fallback) bodies, a gateway marker header.
//! - CORS preflight handling with production-restricted origin echoing.
//!
//! The gateway is stateless per request: it holds no cross-request memory.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures_util::FutureExt; // for catch_unwind on async blocks
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::{
    Environment, GatewayConfig, BINDING_PATH, ID_TOKEN_FIELD, PROXY_MARKER_HEADER, PROXY_MARKER_VALUE,
    SESSION_COOKIE, USE_ID_TOKEN_HEADER,
};
use crate::error::{GatewayError, GatewayResult};
use crate::session::{cookie_value, verify_session_token};

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    /// Upstream HTTP client, reused across requests.
    pub http: reqwest::Client,
}

/// Build the gateway router over the given configuration.
pub fn build_router(config: GatewayConfig) -> anyhow::Result<Router> {
    let http = reqwest::Client::builder()
        .build()
        .context("failed to build upstream HTTP client")?;
    let state = AppState { config: Arc::new(config), http };
    Ok(Router::new()
        .route("/", get(|| async { "pluginmind gateway ok" }))
        .route("/api/proxy/{*path}", any(proxy_handler))
        .with_state(state))
}

/// Serve the gateway on an already-bound listener. Split out from
/// `run_with_port` so tests can bind an ephemeral port first.
pub async fn serve(listener: tokio::net::TcpListener, config: GatewayConfig) -> anyhow::Result<()> {
    let app = build_router(config)?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Start the gateway bound to the given port.
pub async fn run_with_port(port: u16, config: GatewayConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    info!(
        "Starting gateway on {} (backend={}, alternate={:?})",
        addr, config.backend_url, config.backend_alt_url
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve(listener, config).await
}

async fn proxy_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method == Method::OPTIONS {
        return preflight_response(state.config.environment, &headers);
    }
    let env = state.config.environment;
    let fut = handle_proxy(&state, &path, query.as_deref(), method, &headers, body);
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(resp) => resp,
        Err(panic_payload) => {
            // Convert panics to a 503 without crashing the server task
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "panic"
            };
            error!(target: "panic", "proxy handler panic: {}", msg);
            error_response(&GatewayError::internal("Gateway error"), env)
        }
    }
}

async fn handle_proxy(
    state: &AppState,
    path: &str,
    query: Option<&str>,
    method: Method,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    // Test-only fault injection, exercising the panic isolation wrapper
    #[cfg(test)]
    if path == "__fault" {
        panic!("induced handler fault");
    }

    if path == BINDING_PATH && method == Method::POST {
        match prepare_binding(state, headers, &body) {
            Ok((fwd_headers, fwd_body)) => {
                forward_to_backend(state, method, fwd_headers, fwd_body, path, query).await
            }
            Err(err) => error_response(&err, state.config.environment),
        }
    } else {
        let fwd_headers = filter_forward_headers(headers, &method);
        forward_to_backend(state, method, fwd_headers, body, path, query).await
    }
}

/// Copy incoming headers onto the outgoing request, dropping the
/// connection-specific ones (`host`, `origin`, `content-length`) that must
/// be recomputed for the outbound call, and defaulting the content type to
/// JSON for body-bearing methods that did not supply one.
fn filter_forward_headers(headers: &HeaderMap, method: &Method) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if name == header::HOST || name == header::ORIGIN || name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    let has_body = *method != Method::GET && *method != Method::HEAD;
    if has_body && !out.contains_key(header::CONTENT_TYPE) {
        out.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    out
}

/// Validate the binding request and produce the outgoing headers and body.
///
/// The provider credential is taken from the verified session cookie and
/// injected into the JSON body under `id_token`. It is never placed in an
/// `Authorization` header: unrelated upstream authorization checks keyed on
/// that header must not fire for the binding call.
fn prepare_binding(state: &AppState, headers: &HeaderMap, body: &Bytes) -> GatewayResult<(HeaderMap, Bytes)> {
    let asserted = headers
        .get(USE_ID_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if !asserted {
        return Err(GatewayError::bad_request(format!(
            "Missing required {}: true header",
            USE_ID_TOKEN_HEADER
        )));
    }

    let token = cookie_value(headers, SESSION_COOKIE).unwrap_or_default();
    let claims = verify_session_token(&token, &state.config.session_secret).map_err(|e| {
        warn!("binding token retrieval failed: {}", e);
        GatewayError::auth("Token retrieval failed")
    })?;

    let Some(id_token) = claims.id_token else {
        warn!("binding rejected for {}: session carries no provider credential", claims.email);
        return Err(if state.config.token_mode.is_legacy() {
            GatewayError::auth_with_legacy_hint("No valid token available")
        } else {
            GatewayError::auth("No valid token available")
        });
    };

    // Tolerate an empty or malformed body by treating it as {}
    let mut parsed: Value = serde_json::from_slice(body).unwrap_or_else(|_| json!({}));
    if !parsed.is_object() {
        parsed = json!({});
    }
    parsed[ID_TOKEN_FIELD] = Value::String(id_token);

    let mut fwd = filter_forward_headers(headers, &Method::POST);
    fwd.remove(header::AUTHORIZATION);
    fwd.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    info!("binding exchange prepared for {}", claims.email);
    Ok((fwd, Bytes::from(serde_json::to_vec(&parsed).unwrap_or_default())))
}

/// Issue the outbound call, trying the primary backend first and the
/// alternate (when configured) exactly once after a transport failure. A
/// timeout counts as a transport failure. Backend-reported statuses are not
/// failures: they pass through via `shape_response`.
async fn forward_to_backend(
    state: &AppState,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    path: &str,
    query: Option<&str>,
) -> Response {
    let targets = state.config.backend_targets(path, query);
    let has_body = method != Method::GET && method != Method::HEAD;
    for url in &targets {
        let mut req = state
            .http
            .request(method.clone(), url.as_str())
            .headers(headers.clone())
            .timeout(state.config.upstream_timeout);
        if has_body {
            req = req.body(body.clone());
        }
        match req.send().await {
            Ok(upstream) => return shape_response(upstream).await,
            Err(e) => {
                warn!("backend call failed: {} => {}", url, e);
            }
        }
    }
    let detail = format!("Attempted: {}", targets.join(", "));
    error_response(
        &GatewayError::upstream("Backend unavailable", Some(detail)),
        state.config.environment,
    )
}

/// Shape the backend reply for the browser: status passes through
/// unchanged, only `set-cookie`, `content-type` and `cache-control` are
/// copied back, and the body is JSON when possible.
async fn shape_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut copied = HeaderMap::new();
    for name in [header::SET_COOKIE, header::CONTENT_TYPE, header::CACHE_CONTROL] {
        for value in upstream.headers().get_all(&name) {
            copied.append(name.clone(), value.clone());
        }
    }

    let bytes = upstream.bytes().await.unwrap_or_default();
    let body_value: Value = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
        json!({
            "message": "Response could not be parsed as JSON",
            "raw": String::from_utf8_lossy(&bytes),
        })
    });

    let mut resp = Response::new(Body::from(serde_json::to_vec(&body_value).unwrap_or_default()));
    *resp.status_mut() = status;
    let h = resp.headers_mut();
    for (name, value) in copied.iter() {
        h.append(name.clone(), value.clone());
    }
    if !h.contains_key(header::CONTENT_TYPE) {
        h.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    h.insert(PROXY_MARKER_HEADER, HeaderValue::from_static(PROXY_MARKER_VALUE));
    resp
}

/// CORS preflight. Production echoes the requesting origin (with
/// `Vary: Origin` and credentials allowed) only when an origin header is
/// present; development allows any origin.
fn preflight_response(env: Environment, headers: &HeaderMap) -> Response {
    const METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
    const ALLOWED: &str = "content-type, authorization, x-use-id-token";
    let mut out = HeaderMap::new();
    match env {
        Environment::Development => {
            out.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
            out.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(METHODS));
            out.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOWED));
        }
        Environment::Production => {
            if let Some(origin) = headers.get(header::ORIGIN) {
                out.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
                out.insert(header::VARY, HeaderValue::from_static("Origin"));
                out.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
                out.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(METHODS));
                out.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOWED));
            }
        }
    }
    (StatusCode::NO_CONTENT, out).into_response()
}

fn error_response(err: &GatewayError, env: Environment) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut resp = (status, Json(err.body(env.is_production()))).into_response();
    resp.headers_mut()
        .insert(PROXY_MARKER_HEADER, HeaderValue::from_static(PROXY_MARKER_VALUE));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenMode;
    use crate::session::create_session_token;

    const SECRET: &str = "unit-test-secret";

    fn test_state(token_mode: TokenMode) -> AppState {
        let config = GatewayConfig::new(
            "http://backend.invalid:9",
            None,
            SECRET,
            Environment::Development,
            token_mode,
        )
        .unwrap();
        AppState { config: Arc::new(config), http: reqwest::Client::new() }
    }

    fn binding_headers(cookie: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USE_ID_TOKEN_HEADER, HeaderValue::from_static("true"));
        if let Some(c) = cookie {
            headers.insert(header::COOKIE, HeaderValue::from_str(c).unwrap());
        }
        headers
    }

    #[test]
    fn forward_headers_drop_connection_specific_ones() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://app.local"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));
        headers.insert(header::COOKIE, HeaderValue::from_static("pm_session=tok"));

        let out = filter_forward_headers(&headers, &Method::POST);
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::ORIGIN).is_none());
        assert!(out.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(out.get("x-custom").unwrap(), "kept");
        assert_eq!(out.get(header::COOKIE).unwrap(), "pm_session=tok");
    }

    #[test]
    fn forward_headers_default_json_content_type_for_body_methods() {
        let headers = HeaderMap::new();
        let post = filter_forward_headers(&headers, &Method::POST);
        assert_eq!(post.get(header::CONTENT_TYPE).unwrap(), "application/json");
        let get = filter_forward_headers(&headers, &Method::GET);
        assert!(get.get(header::CONTENT_TYPE).is_none());

        let mut supplied = HeaderMap::new();
        supplied.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let kept = filter_forward_headers(&supplied, &Method::POST);
        assert_eq!(kept.get(header::CONTENT_TYPE).unwrap(), "text/plain");
    }

    #[test]
    fn binding_requires_header() {
        let state = test_state(TokenMode::Secure);
        let err = prepare_binding(&state, &HeaderMap::new(), &Bytes::new()).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn binding_distinguishes_retrieval_failure_from_missing_credential() {
        let state = test_state(TokenMode::Secure);

        // No cookie at all: retrieval failure
        let err = prepare_binding(&state, &binding_headers(None), &Bytes::new()).unwrap_err();
        assert_eq!(err.http_status(), 401);
        assert_eq!(err.message(), "Token retrieval failed");

        // Unverifiable cookie: retrieval failure
        let headers = binding_headers(Some("pm_session=garbage"));
        let err = prepare_binding(&state, &headers, &Bytes::new()).unwrap_err();
        assert_eq!(err.message(), "Token retrieval failed");

        // Verified session without a provider credential
        let token = create_session_token("u", "u@example.com", None, SECRET).unwrap();
        let headers = binding_headers(Some(&format!("pm_session={}", token)));
        let err = prepare_binding(&state, &headers, &Bytes::new()).unwrap_err();
        assert_eq!(err.http_status(), 401);
        assert_eq!(err.message(), "No valid token available");
        assert!(err.body(false).get("useLegacy").is_none());
    }

    #[test]
    fn binding_missing_credential_carries_legacy_hint_in_legacy_mode() {
        let state = test_state(TokenMode::Legacy);
        let token = create_session_token("u", "u@example.com", None, SECRET).unwrap();
        let headers = binding_headers(Some(&format!("pm_session={}", token)));
        let err = prepare_binding(&state, &headers, &Bytes::new()).unwrap_err();
        assert_eq!(err.body(false)["useLegacy"], true);
    }

    #[test]
    fn binding_injects_credential_into_body_never_into_auth_header() {
        let state = test_state(TokenMode::Secure);
        let token = create_session_token("u", "u@example.com", Some("goog-cred"), SECRET).unwrap();
        let mut headers = binding_headers(Some(&format!("pm_session={}", token)));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer browser-supplied"));

        let (fwd_headers, fwd_body) = prepare_binding(&state, &headers, &Bytes::from_static(b"{\"a\":1}")).unwrap();
        assert!(fwd_headers.get(header::AUTHORIZATION).is_none());
        assert_eq!(fwd_headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
        let body: Value = serde_json::from_slice(&fwd_body).unwrap();
        assert_eq!(body["id_token"], "goog-cred");
        assert_eq!(body["a"], 1);
    }

    #[test]
    fn binding_tolerates_malformed_body() {
        let state = test_state(TokenMode::Secure);
        let token = create_session_token("u", "u@example.com", Some("goog-cred"), SECRET).unwrap();
        let headers = binding_headers(Some(&format!("pm_session={}", token)));
        let (_, fwd_body) = prepare_binding(&state, &headers, &Bytes::from_static(b"not json")).unwrap();
        let body: Value = serde_json::from_slice(&fwd_body).unwrap();
        assert_eq!(body, json!({ "id_token": "goog-cred" }));
    }

    #[tokio::test]
    async fn handler_panic_is_isolated_as_503() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = GatewayConfig::new(
            "http://127.0.0.1:9",
            None,
            SECRET,
            Environment::Development,
            TokenMode::Secure,
        )
        .unwrap();
        tokio::spawn(serve(listener, config));

        let resp = reqwest::get(format!("http://{}/api/proxy/__fault", addr))
            .await
            .unwrap();
        // A gateway fault is 503, not the 502 reserved for backend failures
        assert_eq!(resp.status(), 503);
        assert_eq!(resp.headers().get(PROXY_MARKER_HEADER).unwrap(), PROXY_MARKER_VALUE);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Gateway error");
    }

    #[test]
    fn preflight_allows_any_origin_in_development() {
        let resp = preflight_response(Environment::Development, &HeaderMap::new());
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }

    #[test]
    fn preflight_echoes_origin_only_in_production_with_origin() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://app.pluginmind.io"));
        let resp = preflight_response(Environment::Production, &headers);
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://app.pluginmind.io"
        );
        assert_eq!(resp.headers().get(header::VARY).unwrap(), "Origin");
        assert_eq!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(), "true");

        let bare = preflight_response(Environment::Production, &HeaderMap::new());
        assert_eq!(bare.status(), StatusCode::NO_CONTENT);
        assert!(bare.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }
}
