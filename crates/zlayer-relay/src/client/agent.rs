//! Relay agent for exposing a local API through a tunnel
//!
//! The [`RelayAgent`] runs next to the origin. It:
//! - connects to the broker's `/ws/{key}` endpoint and announces its key
//! - answers each request envelope by calling the local API
//! - reconnects with exponential backoff when the tunnel drops

use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::RwLock;
use reqwest::Method;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::protocol::{multimap_to_headers, RequestEnvelope, ResponseEnvelope};
use crate::{RelayClientConfig, RelayError, Result};

// =============================================================================
// Agent State
// =============================================================================

/// Current state of the relay agent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AgentState {
    /// Not connected to the broker
    #[default]
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Tunnel established and serving requests
    Connected,
    /// Waiting to reconnect after a disconnection
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
}

// =============================================================================
// Relay Agent
// =============================================================================

/// Origin-side end of a relay tunnel
pub struct RelayAgent {
    config: RelayClientConfig,
    client: reqwest::Client,
    state: Arc<RwLock<AgentState>>,
}

impl RelayAgent {
    /// Create a new relay agent
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the config is invalid or the HTTP
    /// client cannot be built.
    pub fn new(config: RelayClientConfig) -> Result<Self> {
        config.validate().map_err(RelayError::config)?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| RelayError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            client,
            state: Arc::new(RwLock::new(AgentState::Disconnected)),
        })
    }

    /// Get the current agent state
    #[must_use]
    pub fn state(&self) -> AgentState {
        self.state.read().clone()
    }

    /// Check if the tunnel is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.state.read() == AgentState::Connected
    }

    /// Run the agent with automatic reconnection
    ///
    /// Never returns on its own; drop the future to stop the agent. The
    /// backoff resets after every connection that reached the serving state.
    pub async fn run(&self) {
        let mut current_interval = self.config.reconnect_interval;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            tracing::info!(
                attempt = attempt,
                server = %self.config.server_url,
                "connecting to relay"
            );

            match self.run_once().await {
                Ok(()) => tracing::info!("tunnel closed by relay"),
                Err(e) => tracing::warn!(error = %e, "tunnel failed, will retry"),
            }

            if self.state.read().clone() == AgentState::Connected {
                current_interval = self.config.reconnect_interval;
                attempt = 0;
            }

            *self.state.write() = AgentState::Reconnecting {
                attempt: attempt + 1,
            };

            // Wait before reconnecting
            tokio::time::sleep(current_interval).await;

            // Exponential backoff
            current_interval = std::cmp::min(
                current_interval.saturating_mul(2),
                self.config.max_reconnect_interval,
            );
        }
    }

    /// Run a single tunnel connection until it closes
    ///
    /// Returns `Ok(())` when the broker closes the tunnel.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or fails.
    pub async fn run_once(&self) -> Result<()> {
        *self.state.write() = AgentState::Connecting;

        tracing::debug!(url = %self.config.server_url, "opening tunnel");

        let (ws_stream, _response) = connect_async(self.config.server_url.as_str())
            .await
            .map_err(RelayError::connection)?;

        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        // Handshake: announce the key
        ws_sink
            .send(WsMessage::Text(self.config.key.clone().into()))
            .await
            .map_err(RelayError::connection)?;

        *self.state.write() = AgentState::Connected;
        tracing::info!(key = %self.config.key, "tunnel established");

        while let Some(msg) = ws_stream.next().await {
            match msg.map_err(RelayError::connection)? {
                WsMessage::Text(text) => {
                    self.answer(&mut ws_sink, text.as_str().as_bytes()).await?;
                }
                WsMessage::Binary(data) => {
                    self.answer(&mut ws_sink, &data).await?;
                }
                WsMessage::Ping(data) => {
                    ws_sink
                        .send(WsMessage::Pong(data))
                        .await
                        .map_err(RelayError::connection)?;
                }
                WsMessage::Close(frame) => {
                    if let Some(frame) = frame {
                        tracing::info!(
                            code = u16::from(frame.code),
                            reason = frame.reason.as_str(),
                            "relay closed tunnel"
                        );
                    }
                    return Ok(());
                }
                WsMessage::Pong(_) | WsMessage::Frame(_) => {}
            }
        }

        Err(RelayError::connection_msg("tunnel connection lost"))
    }

    /// Handle one request frame and write the response frame
    async fn answer<S>(&self, ws_sink: &mut S, data: &[u8]) -> Result<()>
    where
        S: Sink<WsMessage> + Unpin,
        S::Error: std::error::Error,
    {
        let response = match RequestEnvelope::decode(data) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => {
                tracing::warn!(error = %e, "could not decode request from relay");
                ResponseEnvelope {
                    id: None,
                    status: 400,
                    headers: Default::default(),
                    body: serde_json::json!({ "error": e.to_string() }),
                    body_encoding: Default::default(),
                }
            }
        };

        let text = response.encode()?;
        ws_sink
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(RelayError::connection)
    }

    /// Call the local API for one request envelope
    ///
    /// Local failures become error envelopes rather than tearing the tunnel
    /// down.
    pub async fn handle_request(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let id = request.id;
        match self.call_local(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    request_id = %id,
                    method = %request.method,
                    url = %request.url,
                    error = %e,
                    "local API call failed"
                );
                ResponseEnvelope::error(id, e.status_code().as_u16(), e.to_string())
            }
        }
    }

    async fn call_local(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| RelayError::protocol(format!("invalid method: {}", request.method)))?;
        let url = format!(
            "{}{}",
            self.config.local_api.trim_end_matches('/'),
            request.url
        );
        let body = request.body_bytes()?;

        tracing::debug!(request_id = %request.id, method = %method, url = %url, "calling local API");

        let response = self
            .client
            .request(method, &url)
            .headers(multimap_to_headers(&request.headers))
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(ResponseEnvelope::from_parts(request.id, status, &headers, &body))
    }
}

fn map_reqwest_error(err: reqwest::Error) -> RelayError {
    if err.is_timeout() {
        RelayError::Timeout
    } else {
        RelayError::upstream(err.to_string())
    }
}
