//! Error types for relay operations
//!
//! Every failure a public caller can observe is a [`RelayError`]. The
//! [`IntoResponse`] impl maps each variant to its HTTP status and a JSON body of
//! the form `{"error": "<kind>", "message": "<text>"}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::CloseReason;

/// Errors that can occur while registering, tunneling or forwarding
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed client input (bad JSON, invalid key, bad origin URL)
    #[error("Invalid input: {message}")]
    Input {
        /// What was wrong with the input
        message: String,
    },

    /// No origin is registered under the key
    #[error("API not found: {key}")]
    NotFound {
        /// The key that was looked up
        key: String,
    },

    /// The request conflicts with how the key was registered
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the conflict
        message: String,
    },

    /// Request body exceeded the configured limit
    #[error("Payload too large: limit is {limit} bytes")]
    PayloadTooLarge {
        /// Maximum accepted body size
        limit: usize,
    },

    /// The key is a relay binding but no tunnel is connected
    #[error("Origin unavailable: no tunnel connected for {key}")]
    Unavailable {
        /// The key that has no live session
        key: String,
    },

    /// The direct-fetch upstream call failed
    #[error("Upstream error: {message}")]
    Upstream {
        /// Error message from the HTTP client
        message: String,
    },

    /// The tunnel session ended before a response arrived
    #[error("Tunnel closed: {reason}")]
    SessionClosed {
        /// Why the session was closed
        reason: CloseReason,
    },

    /// The origin sent something that is not a valid response envelope
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message describing the protocol violation
        message: String,
    },

    /// Connection error (connection refused, reset, closed)
    #[error("Connection error: {source}")]
    Connection {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Configuration error (invalid config, missing required field)
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Service is shutting down
    #[error("Service is shutting down")]
    Shutdown,
}

impl RelayError {
    /// Create a new input error
    #[must_use]
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
        }
    }

    /// Create a new not-found error
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a new conflict error
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a new unavailable error
    #[must_use]
    pub fn unavailable(key: impl Into<String>) -> Self {
        Self::Unavailable { key: key.into() }
    }

    /// Create a new upstream error
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new connection error from any error type
    #[must_use]
    pub fn connection<E: std::error::Error>(err: E) -> Self {
        Self::Connection {
            source: std::io::Error::other(err.to_string()),
        }
    }

    /// Create a new connection error with a message
    #[must_use]
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            source: std::io::Error::other(message.into()),
        }
    }

    /// HTTP status code for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Input { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unavailable { .. } | Self::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { .. }
            | Self::SessionClosed { .. }
            | Self::Protocol { .. }
            | Self::Connection { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable error kind
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input { .. } => "bad_request",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Unavailable { .. } | Self::Shutdown => "unavailable",
            Self::Upstream { .. } | Self::SessionClosed { .. } => "upstream_error",
            Self::Protocol { .. } => "protocol_error",
            Self::Connection { .. } => "connection_error",
            Self::Timeout => "gateway_timeout",
            Self::Config { .. } => "internal_error",
        }
    }
}

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error kind
    pub error: String,
    /// Human-readable message
    pub message: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "relay request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "relay request rejected");
        }

        let body = ErrorResponse {
            error: self.kind().to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::input("expected a JSON object");
        assert_eq!(err.to_string(), "Invalid input: expected a JSON object");

        let err = RelayError::not_found("42");
        assert_eq!(err.to_string(), "API not found: 42");

        let err = RelayError::SessionClosed {
            reason: CloseReason::Replaced,
        };
        assert_eq!(err.to_string(), "Tunnel closed: replaced by a newer connection");

        let err = RelayError::Timeout;
        assert_eq!(err.to_string(), "Operation timed out");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(RelayError::input("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(RelayError::not_found("k").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            RelayError::unavailable("k").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(RelayError::upstream("x").status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(RelayError::protocol("x").status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            RelayError::SessionClosed {
                reason: CloseReason::Disconnected
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(RelayError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            RelayError::PayloadTooLarge { limit: 10 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let relay_err: RelayError = io_err.into();
        assert!(matches!(relay_err, RelayError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_into_response_body() {
        let response = RelayError::not_found("abc").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(json.error, "not_found");
        assert_eq!(json.message, "API not found: abc");
    }
}
