//!
//! Session-token layer
//! -------------------
//! Verification (and, for tests and the legacy shim, creation) of the
//! signed session token the session store places in the `pm_session`
//! cookie. Tokens are HS256 JWTs bound to a fixed issuer/audience pair and
//! carry the identity claims plus, optionally, the provider credential the
//! gateway injects during the binding exchange.
//!
//! Sessions are owned by the external session store; this module only
//! verifies what it is handed and never persists anything.

use axum::http::HeaderMap;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SESSION_ISSUER: &str = "pluginmind-backend";
pub const SESSION_AUDIENCE: &str = "pluginmind-frontend";
pub const SESSION_EXPIRY_HOURS: i64 = 24;

/// Claims carried by a verified session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    /// Issuing provider, e.g. "google".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Provider credential held server-side for the one-time binding
    /// exchange. Absent once a session no longer carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session token is required")]
    MissingToken,
    #[error("session expired")]
    Expired,
    #[error("invalid session token: {0}")]
    Invalid(String),
    #[error("invalid session token: missing required claims")]
    MissingClaims,
    #[error("failed to create session token: {0}")]
    Creation(String),
}

/// Verify and decode a session token against the shared secret.
///
/// Enforces signature, expiry, issuer and audience, then checks the
/// required identity claims are non-empty.
pub fn verify_session_token(token: &str, secret: &str) -> Result<SessionClaims, SessionError> {
    if token.is_empty() {
        return Err(SessionError::MissingToken);
    }
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[SESSION_ISSUER]);
    validation.set_audience(&[SESSION_AUDIENCE]);
    let data = decode::<SessionClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => SessionError::Expired,
            _ => SessionError::Invalid(e.to_string()),
        })?;
    let claims = data.claims;
    if claims.user_id.is_empty() || claims.email.is_empty() {
        return Err(SessionError::MissingClaims);
    }
    Ok(claims)
}

/// Issue a session token the way the session store does. Used by tests and
/// the legacy migration shim; the gateway itself never mints tokens.
pub fn create_session_token(
    user_id: &str,
    email: &str,
    id_token: Option<&str>,
    secret: &str,
) -> Result<String, SessionError> {
    let now = Utc::now().timestamp();
    let claims = SessionClaims {
        user_id: user_id.to_string(),
        email: email.to_string(),
        name: None,
        picture: None,
        provider: Some("google".to_string()),
        id_token: id_token.map(|t| t.to_string()),
        iat: now,
        exp: now + SESSION_EXPIRY_HOURS * 3600,
        iss: SESSION_ISSUER.to_string(),
        aud: SESSION_AUDIENCE.to_string(),
    };
    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| SessionError::Creation(e.to_string()))
}

/// Extract a named cookie value from the request headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie").or_else(|| headers.get("Cookie"))?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some(eq) = p.find('=') {
            let (k, v) = p.split_at(eq);
            if k == name {
                return Some(v[1..].to_string());
            }
        }
    }
    None
}
