use axum::{Json, response::IntoResponse};
use tracing::info;

use crate::identity;

/// Issue a fresh profile keypair and its peer id.
pub async fn new_keys_handler() -> impl IntoResponse {
    let issued = identity::issue();
    info!(peer_id = %issued.peer_id, "issued new identity");
    Json(issued)
}
