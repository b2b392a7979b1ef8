//! Tunnel sessions
//!
//! A [`TunnelSession`] is the broker's handle to one connected origin. Public
//! handlers call [`TunnelSession::round_trip`]; the connection itself is owned
//! by a single driver task running [`TunnelSession::drive`], which is the only
//! reader and writer of the socket.
//!
//! At most one request is outstanding per session. Callers queue on an async
//! mutex (FIFO) and keep it for the whole exchange, so request N's response is
//! always read before request N+1 is written.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, timeout_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::keys::PublicKey;
use crate::protocol::{RequestEnvelope, ResponseEnvelope};
use crate::{RelayError, Result};

// =============================================================================
// Close Reason
// =============================================================================

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The origin closed the connection or it failed
    Disconnected,
    /// A newer connection for the same key took over
    Replaced,
    /// A relayed request exceeded its deadline after being transmitted
    TimedOut,
    /// No frame arrived within the heartbeat timeout
    HeartbeatTimeout,
    /// The origin violated the envelope protocol
    Protocol(String),
    /// The broker is shutting down
    Shutdown,
}

impl CloseReason {
    fn close_code(&self) -> u16 {
        match self {
            Self::Disconnected | Self::Replaced => close_code::NORMAL,
            Self::Shutdown => close_code::AWAY,
            Self::Protocol(_) => close_code::PROTOCOL,
            Self::TimedOut | Self::HeartbeatTimeout => close_code::POLICY,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("origin disconnected"),
            Self::Replaced => f.write_str("replaced by a newer connection"),
            Self::TimedOut => f.write_str("request timed out"),
            Self::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            Self::Protocol(detail) => write!(f, "protocol error: {detail}"),
            Self::Shutdown => f.write_str("server shutting down"),
        }
    }
}

// =============================================================================
// Tunnel Session
// =============================================================================

/// One request awaiting transmission, paired with its reply slot
struct Exchange {
    request: RequestEnvelope,
    reply: oneshot::Sender<Result<ResponseEnvelope>>,
}

/// Receiving half of a session, consumed by [`TunnelSession::drive`]
pub struct SessionInbox {
    requests: mpsc::Receiver<Exchange>,
    shutdown: watch::Receiver<Option<CloseReason>>,
}

/// Snapshot of a live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session identifier
    pub id: Uuid,
    /// Bound key
    pub key: PublicKey,
    /// Seconds since the tunnel connected
    pub connected_secs: u64,
    /// Seconds since the last frame from the origin
    pub idle_secs: u64,
}

/// A live duplex connection to one origin
pub struct TunnelSession {
    id: Uuid,
    key: PublicKey,
    requests: mpsc::Sender<Exchange>,
    slot: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<Option<CloseReason>>,
    connected_at: Instant,
    last_activity: parking_lot::Mutex<Instant>,
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("closed", &self.close_reason())
            .finish_non_exhaustive()
    }
}

impl TunnelSession {
    /// Create a session bound to `key`
    ///
    /// The returned inbox must be handed to [`TunnelSession::drive`].
    #[must_use]
    pub fn new(key: PublicKey) -> (Arc<Self>, SessionInbox) {
        let (request_tx, request_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let now = Instant::now();

        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            key,
            requests: request_tx,
            slot: tokio::sync::Mutex::new(()),
            shutdown: shutdown_tx,
            connected_at: now,
            last_activity: parking_lot::Mutex::new(now),
        });

        let inbox = SessionInbox {
            requests: request_rx,
            shutdown: shutdown_rx,
        };

        (session, inbox)
    }

    /// Session identifier
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Bound key
    #[must_use]
    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    /// Why the session closed, or `None` while it is open
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shutdown.borrow().clone()
    }

    /// Whether the session still accepts requests
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shutdown.borrow().is_none()
    }

    /// Close the session
    ///
    /// The first reason wins. Returns `true` if this call closed the session.
    pub fn close(&self, reason: CloseReason) -> bool {
        let closed = self.shutdown.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason.clone());
                true
            } else {
                false
            }
        });

        if closed {
            tracing::debug!(
                key = %self.key,
                session_id = %self.id,
                reason = %reason,
                "closing tunnel session"
            );
        }

        closed
    }

    /// Record activity from the origin
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Snapshot of this session
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            key: self.key.clone(),
            connected_secs: self.connected_at.elapsed().as_secs(),
            idle_secs: self.last_activity.lock().elapsed().as_secs(),
        }
    }

    fn closed_error(&self) -> RelayError {
        RelayError::SessionClosed {
            reason: self.close_reason().unwrap_or(CloseReason::Disconnected),
        }
    }

    /// Send `request` to the origin and wait for its response
    ///
    /// `limit` bounds the whole call, including time spent queued behind
    /// other requests for this session.
    ///
    /// # Errors
    ///
    /// - [`RelayError::Timeout`] if the deadline passes. If the request was
    ///   already transmitted the session is torn down as well.
    /// - [`RelayError::SessionClosed`] if the session ends first.
    /// - [`RelayError::Protocol`] if the origin answers with a malformed envelope.
    pub async fn round_trip(
        &self,
        request: RequestEnvelope,
        limit: Duration,
    ) -> Result<ResponseEnvelope> {
        let deadline = Instant::now() + limit;
        let request_id = request.id;

        let Ok(_slot) = timeout_at(deadline, self.slot.lock()).await else {
            tracing::debug!(key = %self.key, request_id = %request_id, "timed out waiting for tunnel");
            return Err(RelayError::Timeout);
        };

        if !self.is_open() {
            return Err(self.closed_error());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = Exchange {
            request,
            reply: reply_tx,
        };

        match timeout_at(deadline, self.requests.send(exchange)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(self.closed_error()),
            Err(_) => return Err(RelayError::Timeout),
        }

        match timeout_at(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                tracing::warn!(
                    key = %self.key,
                    session_id = %self.id,
                    request_id = %request_id,
                    "origin did not answer in time"
                );
                self.close(CloseReason::TimedOut);
                Err(RelayError::Timeout)
            }
        }
    }

    /// Run the session over a connection until it closes
    ///
    /// Transmits queued requests one at a time, matches each response to the
    /// request in flight, pings the origin every `heartbeat_interval` and
    /// closes if nothing arrives within `heartbeat_timeout`. On exit every
    /// pending or queued request fails with the close reason, which is also
    /// returned.
    #[allow(clippy::too_many_lines)]
    pub async fn drive<S, R, E>(
        &self,
        sink: &mut S,
        stream: &mut R,
        inbox: SessionInbox,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
    ) -> CloseReason
    where
        S: Sink<Message> + Unpin,
        S::Error: fmt::Display,
        R: Stream<Item = std::result::Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        let SessionInbox {
            mut requests,
            mut shutdown,
        } = inbox;
        let mut pending: Option<Exchange> = None;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        let reason = loop {
            tokio::select! {
                biased;

                // Closed from outside (replacement, timeout, shutdown)
                _ = shutdown.changed() => {
                    break self.close_reason().unwrap_or(CloseReason::Shutdown);
                }

                // Next request, only once the previous one is answered
                Some(exchange) = requests.recv(), if pending.is_none() => {
                    let text = match exchange.request.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            let _ = exchange.reply.send(Err(e));
                            continue;
                        }
                    };

                    tracing::trace!(
                        key = %self.key,
                        request_id = %exchange.request.id,
                        method = %exchange.request.method,
                        url = %exchange.request.url,
                        "sending request to origin"
                    );

                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        tracing::debug!(key = %self.key, error = %e, "failed to write to tunnel");
                        pending = Some(exchange);
                        break CloseReason::Disconnected;
                    }
                    pending = Some(exchange);
                }

                // Heartbeat timer
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > heartbeat_timeout {
                        tracing::warn!(key = %self.key, session_id = %self.id, "heartbeat timeout");
                        break CloseReason::HeartbeatTimeout;
                    }

                    if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                        tracing::debug!(key = %self.key, error = %e, "failed to send ping");
                        break CloseReason::Disconnected;
                    }
                }

                // Incoming frames from the origin
                frame = stream.next() => {
                    let data = match frame {
                        Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            last_seen = Instant::now();
                            self.touch();
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => break CloseReason::Disconnected,
                        Some(Err(e)) => {
                            tracing::debug!(key = %self.key, error = %e, "tunnel read failed");
                            break CloseReason::Disconnected;
                        }
                    };

                    last_seen = Instant::now();
                    self.touch();

                    let Some(exchange) = pending.take() else {
                        tracing::warn!(
                            key = %self.key,
                            session_id = %self.id,
                            "dropping unsolicited response from origin"
                        );
                        continue;
                    };

                    match ResponseEnvelope::decode_reply(&data, exchange.request.id) {
                        Ok(response) => {
                            tracing::trace!(
                                key = %self.key,
                                request_id = %exchange.request.id,
                                status = response.status,
                                "received response from origin"
                            );
                            let _ = exchange.reply.send(Ok(response));
                        }
                        Err(e) => {
                            tracing::warn!(key = %self.key, error = %e, "malformed response from origin");
                            let reason = CloseReason::Protocol(e.to_string());
                            // Closed before the caller hears back
                            self.close(reason.clone());
                            let _ = exchange.reply.send(Err(e));
                            break reason;
                        }
                    }
                }
            }
        };

        self.close(reason.clone());
        let reason = self.close_reason().unwrap_or(reason);

        if let Some(exchange) = pending.take() {
            let _ = exchange.reply.send(Err(RelayError::SessionClosed {
                reason: reason.clone(),
            }));
        }

        requests.close();
        while let Ok(exchange) = requests.try_recv() {
            let _ = exchange.reply.send(Err(RelayError::SessionClosed {
                reason: reason.clone(),
            }));
        }

        if reason != CloseReason::Disconnected {
            let frame = CloseFrame {
                code: reason.close_code(),
                reason: reason.to_string().into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
        }

        reason
    }
}
