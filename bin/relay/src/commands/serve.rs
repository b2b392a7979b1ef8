use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing::info;
use zlayer_relay::{KeyStrategy, RelayServer, RelayServerConfig};

use super::shutdown_signal;

/// Command-line overrides for `serve`
#[derive(Debug, Default)]
pub(crate) struct ServeOverrides {
    pub bind: Option<SocketAddr>,
    pub port: Option<u16>,
    pub public_url: Option<String>,
    pub key_strategy: Option<KeyStrategy>,
}

impl ServeOverrides {
    /// Apply the overrides on top of the file configuration
    pub(crate) fn apply(self, mut config: RelayServerConfig) -> RelayServerConfig {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(port) = self.port {
            config.bind.set_port(port);
        }
        if let Some(public_url) = self.public_url {
            config.public_url = Some(public_url);
        }
        if let Some(strategy) = self.key_strategy {
            config.key_strategy = strategy;
        }
        config
    }
}

/// Run the relay broker until a shutdown signal arrives
pub(crate) async fn serve(config: RelayServerConfig, overrides: ServeOverrides) -> Result<()> {
    let config = overrides.apply(config);
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid server configuration")?;

    let server = RelayServer::new(config);
    server.run_with_shutdown(shutdown_signal()).await?;

    info!("Server shutdown complete");
    Ok(())
}
