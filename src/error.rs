//! Unified gateway error model and mapping helpers.
//! One enum covers every failure branch the gateway can surface to the
//! browser, along with the HTTP status mapping and the JSON body shape
//! (`{ error, message?, useLegacy? }`).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayError {
    /// Client protocol error: the request itself is malformed (e.g. the
    /// binding call without its required header). Never forwarded upstream.
    BadRequest { message: String },
    /// Authentication failure: the session cookie could not be verified, or
    /// it verified but carried no provider credential. `use_legacy` marks
    /// the legacy-fallback hint on the latter case.
    Auth { message: String, use_legacy: bool },
    /// Upstream unavailability: the backend (and the alternate, when
    /// configured) could not be reached. `detail` lists the attempted URLs
    /// and is only emitted outside production.
    Upstream { message: String, detail: Option<String> },
    /// Internal fault: the gateway itself broke while handling the request.
    Internal { message: String },
}

impl GatewayError {
    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        GatewayError::BadRequest { message: msg.into() }
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        GatewayError::Auth { message: msg.into(), use_legacy: false }
    }

    pub fn auth_with_legacy_hint<S: Into<String>>(msg: S) -> Self {
        GatewayError::Auth { message: msg.into(), use_legacy: true }
    }

    pub fn upstream<S: Into<String>>(msg: S, detail: Option<String>) -> Self {
        GatewayError::Upstream { message: msg.into(), detail }
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        GatewayError::Internal { message: msg.into() }
    }

    pub fn message(&self) -> &str {
        match self {
            GatewayError::BadRequest { message }
            | GatewayError::Auth { message, .. }
            | GatewayError::Upstream { message, .. }
            | GatewayError::Internal { message } => message.as_str(),
        }
    }

    /// Map to HTTP status code. 502 means the backend could not be reached;
    /// 503 means the gateway itself broke.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::BadRequest { .. } => 400,
            GatewayError::Auth { .. } => 401,
            GatewayError::Upstream { .. } => 502,
            GatewayError::Internal { .. } => 503,
        }
    }

    /// Response body. Production suppresses upstream diagnostic detail; the
    /// `useLegacy` hint is only present when set.
    pub fn body(&self, production: bool) -> Value {
        match self {
            GatewayError::BadRequest { message } => json!({ "error": message }),
            GatewayError::Auth { message, use_legacy } => {
                if *use_legacy {
                    json!({ "error": message, "useLegacy": true })
                } else {
                    json!({ "error": message })
                }
            }
            GatewayError::Upstream { message, detail } => match detail {
                Some(d) if !production => json!({ "error": message, "message": d }),
                _ => json!({ "error": message }),
            },
            GatewayError::Internal { message } => json!({ "error": message }),
        }
    }
}

impl Display for GatewayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.http_status(), self.message())
    }
}

impl std::error::Error for GatewayError {}

pub type GatewayResult<T> = Result<T, GatewayError>;
