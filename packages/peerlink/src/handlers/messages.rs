use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use peer_registry::{Addressing, Message};
use serde::Deserialize;

use super::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub message: Message,
    pub addressing: Addressing,
}

/// Write a message to the receiver contact's stream.
///
/// Blocks while the connection is still dialing; returns once the message
/// has been written.
pub async fn send_message_handler(
    State(state): State<AppState>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(req) = payload?;
    state
        .orchestrator
        .router()
        .send_message(req.addressing, &req.message)
        .await?;
    Ok(Json(serde_json::json!({ "status": "sent" })))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;

    use crate::test_helpers::{post_json, test_app, wait_all_open};

    fn send_body(sender: i64, receiver: i64, text: &str) -> serde_json::Value {
        serde_json::json!({
            "message": {
                "creation_timestamp": 1_700_000_000,
                "type": "text",
                "file": null,
                "text": text,
                "markdown": false,
            },
            "addressing": { "sender_db_id": sender, "receiver_db_id": receiver },
        })
    }

    fn add_body(profile: i64, identity: &str, contact: i64, peer: &str) -> serde_json::Value {
        serde_json::json!({
            "profile_db_id": profile,
            "profile_private_key": identity,
            "contact_db_id": contact,
            "contact_peer_id": peer,
        })
    }

    #[tokio::test]
    async fn test_send_message_is_delivered_mirrored() {
        let mut harness = test_app();
        // Two local profiles that know each other.
        post_json(&harness.app, "/add_connection", add_body(1, "alice", 9, "bob")).await;
        post_json(&harness.app, "/add_connection", add_body(2, "bob", 7, "alice")).await;
        // Inbound frames are only matched against installed streams.
        wait_all_open(&harness.orchestrator, 2).await;

        let (status, json) = post_json(&harness.app, "/send_message", send_body(1, 9, "hi bob")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "sent");

        let envelope = tokio::time::timeout(Duration::from_secs(10), harness.inbox.recv())
            .await
            .expect("delivery timed out")
            .expect("notifier dropped");
        assert_eq!(envelope.message.text, "hi bob");
        assert_eq!(envelope.addressing.sender_db_id, 7);
        assert_eq!(envelope.addressing.receiver_db_id, 2);
    }

    #[tokio::test]
    async fn test_send_message_unknown_pair() {
        let harness = test_app();
        let (status, json) = post_json(&harness.app, "/send_message", send_body(3, 4, "x")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "profile_not_found");
    }

    #[tokio::test]
    async fn test_send_message_missing_fields() {
        let harness = test_app();
        let (status, _) = post_json(
            &harness.app,
            "/send_message",
            serde_json::json!({ "addressing": { "sender_db_id": 1, "receiver_db_id": 2 } }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
