//! Origin registration

use axum::{extract::State, http::StatusCode, Json};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::router::AppState;
use crate::registry::OriginBinding;
use crate::{RelayError, Result};

/// Forwarding strategy requested at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    /// The broker calls `local_api` itself
    Direct,
    /// The origin connects a tunnel
    Relay,
}

/// Body of `POST /register`
///
/// `{"local_api": "<url>"}` registers a direct-fetch origin. An empty body,
/// `{}` or `{"mode": "relay"}` registers a tunnel origin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Origin base URL for direct fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_api: Option<String>,
    /// Explicit forwarding mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ForwardMode>,
}

/// Body returned by `POST /register`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Allocated key
    pub key: String,
    /// Where third parties call the origin
    pub public_api: String,
    /// Where a tunnel origin connects (relay mode only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
}

impl RegisterRequest {
    /// Resolve the binding this request asks for
    ///
    /// # Errors
    ///
    /// Returns an input error if the mode and `local_api` contradict each other
    /// or `local_api` is not an absolute `http`/`https` URL.
    pub fn into_binding(self) -> Result<OriginBinding> {
        match (self.mode, self.local_api) {
            (Some(ForwardMode::Relay), Some(_)) => Err(RelayError::input(
                "local_api cannot be combined with relay mode",
            )),
            (Some(ForwardMode::Direct), None) => {
                Err(RelayError::input("local_api is required for direct mode"))
            }
            (_, Some(url)) => {
                validate_origin_url(&url)?;
                Ok(OriginBinding::Direct { url })
            }
            (_, None) => Ok(OriginBinding::Relay),
        }
    }
}

fn validate_origin_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| RelayError::input(format!("local_api is not a valid URL: {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(RelayError::input(
            "local_api must be an http:// or https:// URL",
        ));
    }

    Ok(())
}

/// `POST /register`
pub async fn register(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RegisterResponse>> {
    let request: RegisterRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RegisterRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| RelayError::input(e.to_string()))?
    };

    let binding = request.into_binding()?;
    let is_relay = binding == OriginBinding::Relay;
    let key = state.registry.register(binding);

    Ok(Json(RegisterResponse {
        public_api: state.config.public_api_url(key.as_str()),
        ws_url: is_relay.then(|| state.config.tunnel_url(key.as_str())),
        key: key.to_string(),
    }))
}

/// `OPTIONS /register`
pub async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}
