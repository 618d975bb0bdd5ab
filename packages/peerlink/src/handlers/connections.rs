use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use peer_registry::{AddOutcome, ContactId, Identity, ProfileId, RemoteAddress};
use serde::{Deserialize, Serialize};

use super::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AddConnectionRequest {
    pub profile_db_id: i64,
    pub profile_private_key: String,
    pub contact_db_id: i64,
    pub contact_peer_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RemoveConnectionRequest {
    pub profile_db_id: i64,
    pub contact_db_id: i64,
}

#[derive(Debug, Serialize)]
pub struct AddConnectionResponse {
    pub outcome: AddOutcome,
}

/// Register a contact under a profile and start dialing it.
///
/// 200 when the pair is new, 208 Already Reported when it already exists.
pub async fn add_connection_handler(
    State(state): State<AppState>,
    payload: Result<Json<AddConnectionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    let outcome = state
        .orchestrator
        .add_connection(
            ProfileId(req.profile_db_id),
            Identity::new(req.profile_private_key),
            ContactId(req.contact_db_id),
            RemoteAddress::new(req.contact_peer_id),
        )
        .await?;

    let status = match outcome {
        AddOutcome::Created => StatusCode::OK,
        AddOutcome::AlreadyExists => StatusCode::ALREADY_REPORTED,
    };
    Ok((status, Json(AddConnectionResponse { outcome })).into_response())
}

pub async fn remove_connection_handler(
    State(state): State<AppState>,
    payload: Result<Json<RemoveConnectionRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(req) = payload?;
    state
        .orchestrator
        .remove_connection(ProfileId(req.profile_db_id), ContactId(req.contact_db_id))
        .await?;
    Ok(Json(serde_json::json!({ "status": "removed" })))
}

/// Every registered pair with its stream status.
pub async fn list_connections_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.registry().snapshot().await)
}
