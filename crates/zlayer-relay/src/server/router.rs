//! Router construction

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::Request,
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{any, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::{control, health, register, relay};
use crate::config::RelayServerConfig;
use crate::forward::DirectForwarder;
use crate::registry::SessionRegistry;
use crate::Result;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    /// Key bindings and live tunnels
    pub registry: Arc<SessionRegistry>,
    /// Client for direct-fetch bindings
    pub forwarder: DirectForwarder,
    /// Server configuration
    pub config: Arc<RelayServerConfig>,
    /// When the server started
    pub started_at: Instant,
}

impl AppState {
    /// Build handler state from a configuration and a registry
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the outbound HTTP client cannot be built.
    pub fn new(config: RelayServerConfig, registry: Arc<SessionRegistry>) -> Result<Self> {
        let forwarder = DirectForwarder::new(config.upstream_timeout)?;
        Ok(Self {
            registry,
            forwarder,
            config: Arc::new(config),
            started_at: Instant::now(),
        })
    }
}

/// Build the relay router
pub fn build_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config);

    Router::new()
        .route(
            "/register",
            post(register::register).options(register::preflight),
        )
        .route("/ws/{key}", get(control::tunnel_upgrade))
        .route("/api/{key}", any(relay::relay))
        .route("/api/{key}/{*path}", any(relay::relay))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(preflight_no_content))
}

/// Build CORS layer from config
fn build_cors_layer(config: &RelayServerConfig) -> CorsLayer {
    let cors = CorsLayer::new().max_age(std::time::Duration::from_secs(config.cors.max_age));

    let cors = if config.cors.allowed_origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let origins: Vec<_> = config
            .cors
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(origins)
    };

    cors.allow_methods(Any).allow_headers(Any).expose_headers(Any)
}

/// Answer CORS preflights with `204 No Content`
async fn preflight_no_content(request: Request, next: Next) -> Response {
    let is_options = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if is_options && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}
