use axum::{Json, extract::State, response::IntoResponse};
use peer_registry::ConnectionStatus;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub profiles: usize,
    pub connections: usize,
    pub open_connections: usize,
}

/// Health check endpoint - returns registry occupancy
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.orchestrator.registry();
    let profiles = registry.len().await;
    let snapshot = registry.snapshot().await;
    let open_connections = snapshot
        .iter()
        .filter(|c| c.status == ConnectionStatus::Open)
        .count();

    let status = if registry.cancel_token().is_cancelled() {
        "shutting_down"
    } else {
        "healthy"
    };

    Json(HealthStatus {
        status: status.to_string(),
        profiles,
        connections: snapshot.len(),
        open_connections,
    })
}
