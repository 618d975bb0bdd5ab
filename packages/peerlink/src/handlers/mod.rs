pub mod connections;
pub mod health;
pub mod keys;
pub mod messages;

use axum::{
    Json, Router,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use peer_registry::RegistryError;
use tracing::warn;

use crate::AppState;

// Re-export all handlers for easy route registration
pub use connections::{add_connection_handler, list_connections_handler, remove_connection_handler};
pub use health::health_handler;
pub use keys::new_keys_handler;
pub use messages::send_message_handler;

/// The control API, without middleware.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/get_new_keys_and_peer_id",
            get(new_keys_handler).post(new_keys_handler),
        )
        .route("/add_connection", post(add_connection_handler))
        .route("/remove_connection", post(remove_connection_handler))
        .route("/send_message", post(send_message_handler))
        .route("/connections", get(list_connections_handler))
        .route("/health", get(health_handler))
}

// =============================================================================
// API Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("malformed request body: {0}")]
    Body(#[from] JsonRejection),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Body(_) => StatusCode::BAD_REQUEST,
            ApiError::Registry(e) => match e {
                RegistryError::BadRequest(_) => StatusCode::BAD_REQUEST,
                RegistryError::ProfileNotFound(_) | RegistryError::ContactNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                RegistryError::Transport(_) => StatusCode::BAD_GATEWAY,
                RegistryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &str {
        match self {
            ApiError::Body(_) => "bad_request",
            ApiError::Registry(e) => e.error_code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = %status, "request failed: {}", self);
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.code(),
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}
