use anyhow::Result;
use tracing::info;
use zlayer_relay::{RelayAgent, RelayClientConfig};

use super::shutdown_signal;

/// Tunnel URL for `key` on the relay at `server`
///
/// Accepts an `http(s)://` or `ws(s)://` base URL, or a full `/ws/{key}` URL.
pub(crate) fn tunnel_url(server: &str, key: &str) -> String {
    let server = server.trim_end_matches('/');
    let base = if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        server.to_string()
    };

    let suffix = format!("/ws/{key}");
    if base.ends_with(&suffix) {
        base
    } else {
        format!("{base}{suffix}")
    }
}

/// Serve a local API through the relay until a shutdown signal arrives
pub(crate) async fn connect(server: &str, key: &str, local_api: &str) -> Result<()> {
    let config = RelayClientConfig::new(tunnel_url(server, key), key, local_api);
    let agent = RelayAgent::new(config)?;

    info!(key = %key, local_api = %local_api, "Starting relay agent");

    tokio::select! {
        () = agent.run() => {},
        () = shutdown_signal() => {},
    }

    info!("Relay agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_url_from_http_base() {
        assert_eq!(
            tunnel_url("http://localhost:8080", "abc"),
            "ws://localhost:8080/ws/abc"
        );
        assert_eq!(
            tunnel_url("https://relay.example.com/", "abc"),
            "wss://relay.example.com/ws/abc"
        );
    }

    #[test]
    fn test_tunnel_url_passthrough() {
        assert_eq!(
            tunnel_url("wss://relay.example.com/ws/abc", "abc"),
            "wss://relay.example.com/ws/abc"
        );
        assert_eq!(tunnel_url("ws://relay:8080", "7"), "ws://relay:8080/ws/7");
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_local_api() {
        assert!(connect("ws://relay:8080", "abc", "localhost:3000")
            .await
            .is_err());
    }
}
