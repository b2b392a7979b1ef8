//! Configuration types for the relay server and the relay agent

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::keys::KeyStrategy;

// =============================================================================
// Default value functions for serde
// =============================================================================

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_upstream_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(40)
}

const fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

const fn default_cors_max_age() -> u64 {
    3600
}

const fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_max_reconnect_interval() -> Duration {
    Duration::from_secs(60)
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayServerConfig {
    /// Address to bind the HTTP listener to
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Externally visible base URL (e.g. `https://relay.example.com`).
    /// When unset, registration responses carry relative paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    /// How public keys are allocated
    #[serde(default)]
    pub key_strategy: KeyStrategy,

    /// Upper bound for a relayed request, including time spent queued
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Upper bound for a direct-fetch upstream call
    #[serde(default = "default_upstream_timeout", with = "humantime_serde")]
    pub upstream_timeout: Duration,

    /// How long a new tunnel may take to send its key
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Heartbeat ping interval on tunnel connections
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Heartbeat timeout (no frame received = dead)
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Maximum accepted public request body size
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// CORS configuration
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: None,
            key_strategy: KeyStrategy::default(),
            request_timeout: default_request_timeout(),
            upstream_timeout: default_upstream_timeout(),
            handshake_timeout: default_handshake_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            max_body_bytes: default_max_body_bytes(),
            cors: CorsConfig::default(),
        }
    }
}

impl RelayServerConfig {
    /// Validate the server configuration
    ///
    /// # Errors
    ///
    /// Returns an error string if:
    /// - `public_url` is set but is not an `http://` or `https://` URL
    /// - any timeout is zero
    /// - `heartbeat_timeout` is not greater than `heartbeat_interval`
    /// - `max_body_bytes` is 0
    pub fn validate(&self) -> Result<(), String> {
        if let Some(url) = &self.public_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("public_url must start with http:// or https://".to_string());
            }
        }

        if self.request_timeout.is_zero() {
            return Err("request_timeout must be greater than 0".to_string());
        }

        if self.upstream_timeout.is_zero() {
            return Err("upstream_timeout must be greater than 0".to_string());
        }

        if self.handshake_timeout.is_zero() {
            return Err("handshake_timeout must be greater than 0".to_string());
        }

        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be greater than 0".to_string());
        }

        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err("heartbeat_timeout must be greater than heartbeat_interval".to_string());
        }

        if self.max_body_bytes == 0 {
            return Err("max_body_bytes must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Public invocation URL for a key
    #[must_use]
    pub fn public_api_url(&self, key: &str) -> String {
        match &self.public_url {
            Some(base) => format!("{}/api/{key}", base.trim_end_matches('/')),
            None => format!("/api/{key}"),
        }
    }

    /// Tunnel URL an origin connects to for a key
    #[must_use]
    pub fn tunnel_url(&self, key: &str) -> String {
        match &self.public_url {
            Some(base) => {
                let base = base.trim_end_matches('/');
                let base = if let Some(rest) = base.strip_prefix("https://") {
                    format!("wss://{rest}")
                } else if let Some(rest) = base.strip_prefix("http://") {
                    format!("ws://{rest}")
                } else {
                    base.to_string()
                };
                format!("{base}/ws/{key}")
            }
            None => format!("/ws/{key}"),
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins (empty = allow all)
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Preflight cache duration in seconds
    #[serde(default = "default_cors_max_age")]
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_age: default_cors_max_age(),
        }
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Relay agent (origin side) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayClientConfig {
    /// Tunnel URL (`ws://` or `wss://`, e.g. `wss://relay.example.com/ws/abc`)
    pub server_url: String,

    /// Key to announce during the handshake
    pub key: String,

    /// Base URL of the local API requests are forwarded to
    pub local_api: String,

    /// Upper bound for a call to the local API
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Initial reconnect delay
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    #[serde(default = "default_max_reconnect_interval", with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
}

impl RelayClientConfig {
    /// Create a new client configuration with default timings
    pub fn new(
        server_url: impl Into<String>,
        key: impl Into<String>,
        local_api: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            key: key.into(),
            local_api: local_api.into(),
            request_timeout: default_request_timeout(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
        }
    }

    /// Validate the client configuration
    ///
    /// # Errors
    ///
    /// Returns an error string if:
    /// - `server_url` is not a `ws://` or `wss://` URL
    /// - `key` is not a valid public key
    /// - `local_api` is not an `http://` or `https://` URL
    /// - `reconnect_interval` is zero or exceeds `max_reconnect_interval`
    pub fn validate(&self) -> Result<(), String> {
        if self.server_url.is_empty() {
            return Err("server_url cannot be empty".to_string());
        }

        if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            return Err("server_url must start with ws:// or wss://".to_string());
        }

        crate::keys::PublicKey::parse(&self.key).map_err(|e| e.to_string())?;

        if !self.local_api.starts_with("http://") && !self.local_api.starts_with("https://") {
            return Err("local_api must start with http:// or https://".to_string());
        }

        if self.request_timeout.is_zero() {
            return Err("request_timeout must be greater than 0".to_string());
        }

        if self.reconnect_interval.is_zero() {
            return Err("reconnect_interval must be greater than 0".to_string());
        }

        if self.reconnect_interval > self.max_reconnect_interval {
            return Err(
                "reconnect_interval cannot be greater than max_reconnect_interval".to_string(),
            );
        }

        Ok(())
    }
}

// =============================================================================
// humantime_serde module for Duration serialization
// =============================================================================

mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = if duration.subsec_nanos() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        };
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_number(num_str: &str) -> Result<u64, String> {
        num_str
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration number: {num_str}"))
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        // Plain seconds
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(num_str) = s.strip_suffix("ms") {
            return Ok(Duration::from_millis(parse_number(num_str)?));
        }

        if let Some(num_str) = s.strip_suffix('s') {
            return Ok(Duration::from_secs(parse_number(num_str)?));
        }

        if let Some(num_str) = s.strip_suffix('m') {
            return Ok(Duration::from_secs(parse_number(num_str)? * 60));
        }

        if let Some(num_str) = s.strip_suffix('h') {
            return Ok(Duration::from_secs(parse_number(num_str)? * 3600));
        }

        Err(format!("invalid duration format: {s}"))
    }
}
