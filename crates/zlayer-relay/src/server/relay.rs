//! Public relay endpoint
//!
//! Any method on `/api/{key}` or `/api/{key}/{*path}` is sent to the origin
//! bound to `key`, either by calling it directly or over its tunnel.

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;

use super::router::AppState;
use crate::forward::target_url;
use crate::keys::PublicKey;
use crate::protocol::RequestEnvelope;
use crate::registry::OriginBinding;
use crate::{RelayError, Result};

/// Path and query of a public request as seen by the origin
///
/// `/api/42/users/7` becomes `/users/7`; `/api/42` becomes `/`.
#[must_use]
pub fn origin_path(public_path: &str) -> &str {
    public_path
        .strip_prefix("/api/")
        .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or("/")
}

async fn read_body(body: Body, headers: &HeaderMap, limit: usize) -> Result<Bytes> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    if declared.is_some_and(|len| len > limit) {
        return Err(RelayError::PayloadTooLarge { limit });
    }

    axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| RelayError::PayloadTooLarge { limit })
}

/// Relay a public request to the origin registered under `key`
pub async fn relay(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    request: Request,
) -> Result<Response> {
    let (parts, body) = request.into_parts();

    if parts.method == Method::OPTIONS {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let key = params.get("key").map(String::as_str).unwrap_or_default();
    let binding = PublicKey::parse(key)
        .ok()
        .and_then(|key| state.registry.binding(key.as_str()))
        .ok_or_else(|| RelayError::not_found(key))?;

    let body = read_body(body, &parts.headers, state.config.max_body_bytes).await?;
    let suffix = origin_path(parts.uri.path());

    match binding {
        OriginBinding::Direct { url } => {
            let target = target_url(&url, suffix, parts.uri.query());
            state
                .forwarder
                .forward(parts.method, &target, &parts.headers, body)
                .await
        }
        OriginBinding::Relay => {
            let session = state
                .registry
                .session(key)
                .filter(|session| session.is_open())
                .ok_or_else(|| RelayError::unavailable(key))?;

            let url = match parts.uri.query() {
                Some(query) => format!("{suffix}?{query}"),
                None => suffix.to_string(),
            };
            let envelope = RequestEnvelope::new(&parts.method, url, &parts.headers, &body);

            tracing::debug!(
                key = %key,
                session_id = %session.id(),
                request_id = %envelope.id,
                method = %parts.method,
                "relaying request over tunnel"
            );

            session
                .round_trip(envelope, state.config.request_timeout)
                .await?
                .into_response()
        }
    }
}
