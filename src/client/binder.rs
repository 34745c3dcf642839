//!
//! Credential binder
//! -----------------
//! One-time exchange of a third-party sign-in for a backend session. The
//! binder issues a single `POST auth/google` through the gateway with the
//! `x-use-id-token` header and a placeholder body; the credential itself is
//! attached server-side by the gateway, never by this component.
//!
//! Per browser-session lifetime the binder runs the state machine
//! `NotBound -> Binding -> Bound`, falling back to `NotBound` on failure so
//! a later mount can retry. `Bound` is terminal until sign-out.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{BINDING_PATH, USE_ID_TOKEN_HEADER};

use super::{ClientError, GatewayClient};

/// Storage key under which the marker lives in the browser profile. Global
/// for the profile, not per-user.
pub const BINDING_MARKER_KEY: &str = "backend_binding_complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    NotBound,
    Binding,
    Bound,
}

/// Client-local store for the single "binding complete" marker.
///
/// Lifecycle: set only after a verified-successful exchange, read to avoid
/// repeating the exchange, cleared on sign-out. It must never be set before
/// the exchange response is verified successful.
#[derive(Debug, Default)]
pub struct BindingStore {
    bound: RwLock<bool>,
}

impl BindingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self) -> bool {
        *self.bound.read()
    }

    pub fn record_bound(&self) {
        *self.bound.write() = true;
    }

    pub fn clear(&self) {
        *self.bound.write() = false;
    }
}

/// Backend-confirmed identity returned by a successful exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct BoundIdentity {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub subscription_tier: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl BoundIdentity {
    /// The backend wraps the identity as `{ "status": ..., "user": {...} }`;
    /// tolerate a bare identity object as well.
    fn from_response(value: &Value) -> Option<Self> {
        let candidate = value.get("user").unwrap_or(value);
        serde_json::from_value(candidate.clone()).ok()
    }
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("binding already recorded for this session")]
    AlreadyBound,
    #[error("a binding attempt is already in flight")]
    InProgress,
    #[error("binding response carried no user identity")]
    MalformedResponse,
    #[error(transparent)]
    Client(#[from] ClientError),
}

pub struct CredentialBinder {
    client: Arc<GatewayClient>,
    store: Arc<BindingStore>,
    state: Mutex<BindingState>,
}

impl CredentialBinder {
    pub fn new(client: Arc<GatewayClient>, store: Arc<BindingStore>) -> Self {
        let initial = if store.is_bound() { BindingState::Bound } else { BindingState::NotBound };
        Self { client, store, state: Mutex::new(initial) }
    }

    pub fn state(&self) -> BindingState {
        *self.state.lock()
    }

    /// Perform the one-time exchange. At most one attempt is in flight per
    /// binder; a completed binding is never repeated. On failure the marker
    /// stays absent and the state returns to `NotBound` so the caller may
    /// try again later; the binder itself never loops.
    pub async fn bind_once(&self) -> Result<BoundIdentity, BindError> {
        {
            let mut st = self.state.lock();
            if self.store.is_bound() || *st == BindingState::Bound {
                return Err(BindError::AlreadyBound);
            }
            if *st == BindingState::Binding {
                return Err(BindError::InProgress);
            }
            *st = BindingState::Binding;
        }

        let mut headers = HeaderMap::new();
        headers.insert(USE_ID_TOKEN_HEADER, HeaderValue::from_static("true"));
        // Placeholder body: the gateway injects the credential server-side
        let result = self
            .client
            .request_with_headers(Method::POST, BINDING_PATH, headers, Some(&json!({})))
            .await;

        match result {
            Ok(value) => match BoundIdentity::from_response(&value) {
                Some(identity) => {
                    self.store.record_bound();
                    *self.state.lock() = BindingState::Bound;
                    info!("backend binding complete for {}", identity.email);
                    Ok(identity)
                }
                None => {
                    *self.state.lock() = BindingState::NotBound;
                    Err(BindError::MalformedResponse)
                }
            },
            Err(e) => {
                warn!("binding attempt failed: {}", e);
                *self.state.lock() = BindingState::NotBound;
                Err(e.into())
            }
        }
    }

    /// Sign-out resets both the marker and the state machine.
    pub fn sign_out(&self) {
        self.store.clear();
        *self.state.lock() = BindingState::NotBound;
    }
}
