//! Health check endpoints

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use super::router::AppState;
use crate::session::SessionInfo;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Uptime in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    /// Number of registered keys
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bindings: Option<usize>,
    /// Number of connected tunnels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<usize>,
    /// Connected tunnels with their age and idle time
    #[serde(default, skip_serializing_if = "Option::is_none", skip_deserializing)]
    pub tunnels: Option<Vec<SessionInfo>>,
}

/// Liveness probe - basic health check
pub async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: None,
        bindings: None,
        sessions: None,
        tunnels: None,
    })
}

/// Readiness probe - includes registry counts and live tunnels
pub async fn readiness(State(state): State<AppState>) -> Json<HealthResponse> {
    let tunnels = state.registry.list_sessions();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: Some(state.started_at.elapsed().as_secs()),
        bindings: Some(state.registry.binding_count()),
        sessions: Some(tunnels.len()),
        tunnels: Some(tunnels),
    })
}
