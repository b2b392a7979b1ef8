//! Tunnel accept handler
//!
//! Origins connect a WebSocket to `/ws/{key}` and announce the key as their
//! first text frame. Each connection then moves through three phases:
//!
//! 1. **Handshaking** - wait (bounded) for the key; a mismatch, close or
//!    timeout ends the connection without touching the registry.
//! 2. **Active** - install the session, closing any session it replaces, and
//!    drive it until it ends.
//! 3. **Closed** - remove the session if it is still the installed one.

use std::time::Duration;

use axum::{
    extract::{
        ws::{
            close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket,
            WebSocketUpgrade,
        },
        Path, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::time::timeout;
use tracing::Instrument;

use super::router::AppState;
use crate::keys::PublicKey;
use crate::protocol::parse_handshake;
use crate::registry::OriginBinding;
use crate::session::{CloseReason, TunnelSession};
use crate::{RelayError, Result};

/// `GET /ws/{key}`
///
/// The key is checked before the upgrade: malformed keys get `400`, unknown
/// keys `404` and keys registered for direct fetch `409`.
pub async fn tunnel_upgrade(
    State(state): State<AppState>,
    Path(key): Path<String>,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    let key = PublicKey::parse(&key)?;

    match state.registry.binding(key.as_str()) {
        None => return Err(RelayError::not_found(key.as_str())),
        Some(OriginBinding::Direct { .. }) => {
            return Err(RelayError::conflict(format!(
                "{key} is registered for direct fetch"
            )))
        }
        Some(OriginBinding::Relay) => {}
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let span = tracing::info_span!("tunnel", key = %key);
    Ok(ws.on_upgrade(move |socket| run_tunnel(state, key, socket).instrument(span)))
}

/// Wait for the handshake frame and return the announced key
///
/// Returns `None` if the connection closes or fails first.
async fn read_handshake<R, E>(stream: &mut R) -> Option<String>
where
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(parse_handshake(text.as_str())),
            Ok(Message::Binary(data)) => {
                return std::str::from_utf8(&data).ok().map(parse_handshake);
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
    None
}

async fn run_tunnel(state: AppState, key: PublicKey, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let handshake_timeout: Duration = state.config.handshake_timeout;

    match timeout(handshake_timeout, read_handshake(&mut stream)).await {
        Ok(Some(announced)) if announced == key.as_str() => {}
        Ok(Some(announced)) => {
            tracing::warn!(announced = %announced, "handshake key does not match tunnel path");
            let frame = CloseFrame {
                code: close_code::POLICY,
                reason: "key mismatch".into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            return;
        }
        Ok(None) => {
            tracing::debug!("tunnel closed during handshake");
            return;
        }
        Err(_) => {
            tracing::warn!(timeout_ms = handshake_timeout.as_millis(), "handshake timed out");
            let frame = CloseFrame {
                code: close_code::POLICY,
                reason: "handshake timeout".into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            return;
        }
    }

    let (session, inbox) = TunnelSession::new(key);
    if let Some(previous) = state.registry.put_session(session.clone()) {
        previous.close(CloseReason::Replaced);
    }

    tracing::info!(session_id = %session.id(), "tunnel connected");

    let reason = session
        .drive(
            &mut sink,
            &mut stream,
            inbox,
            state.config.heartbeat_interval,
            state.config.heartbeat_timeout,
        )
        .await;

    state.registry.remove_session(&session);

    tracing::info!(session_id = %session.id(), reason = %reason, "tunnel disconnected");
}
