//! Relay server
//!
//! HTTP front end of the broker: registration, the public relay endpoint and
//! the tunnel accept endpoint, all sharing one [`SessionRegistry`].

pub mod control;
pub mod health;
pub mod register;
pub mod relay;
pub mod router;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

pub use register::{ForwardMode, RegisterRequest, RegisterResponse};
pub use router::{build_router, AppState};

use crate::config::RelayServerConfig;
use crate::registry::SessionRegistry;
use crate::session::CloseReason;

/// Relay server
pub struct RelayServer {
    config: RelayServerConfig,
    registry: Arc<SessionRegistry>,
}

impl RelayServer {
    /// Create a new relay server with an empty registry
    #[must_use]
    pub fn new(config: RelayServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.key_strategy));
        Self { config, registry }
    }

    /// Create a relay server around an existing registry
    #[must_use]
    pub fn with_registry(config: RelayServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self { config, registry }
    }

    /// Get the bind address
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind
    }

    /// Shared registry
    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Build the router for this server
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn router(&self) -> anyhow::Result<Router> {
        self.config
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid relay server configuration")?;
        let state = AppState::new(self.config.clone(), self.registry())?;
        Ok(build_router(state))
    }

    /// Run the server until the process is stopped
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or binding fails.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or binding fails.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let addr = self.config.bind;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    ///
    /// When `shutdown` resolves, every tunnel is closed and in-flight requests
    /// are allowed to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the server fails.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.router()?;
        let local_addr = listener.local_addr()?;

        info!(
            bind = %local_addr,
            key_strategy = ?self.config.key_strategy,
            public_url = self.config.public_url.as_deref().unwrap_or("-"),
            "Starting relay server"
        );

        let registry = self.registry();
        let signal = async move {
            shutdown.await;
            registry.close_all(&CloseReason::Shutdown);
        };

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await?;

        info!("Relay server shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let server = RelayServer::new(RelayServerConfig::default());
        assert_eq!(server.bind_addr(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(server.registry().binding_count(), 0);
    }

    #[test]
    fn test_server_custom_bind() {
        let config = RelayServerConfig {
            bind: "127.0.0.1:9090".parse().unwrap(),
            ..Default::default()
        };
        let server = RelayServer::new(config);
        assert_eq!(server.bind_addr(), "127.0.0.1:9090".parse().unwrap());
    }

    #[test]
    fn test_router_rejects_invalid_config() {
        let config = RelayServerConfig {
            max_body_bytes: 0,
            ..Default::default()
        };
        assert!(RelayServer::new(config).router().is_err());
    }
}
