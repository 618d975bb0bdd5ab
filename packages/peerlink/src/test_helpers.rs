use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use peer_registry::memory::{MemoryTransport, RecordingNotifier};
use peer_registry::{
    ConnectionOrchestrator, ConnectionStatus, Envelope, ProfileRegistry, RegistrySettings,
};
use tokio::sync::mpsc;
use tower::ServiceExt;

use crate::AppState;
use crate::handlers;

pub struct TestApp {
    pub app: Router,
    pub orchestrator: Arc<ConnectionOrchestrator>,
    pub inbox: mpsc::UnboundedReceiver<Envelope>,
}

/// Build the control API over the in-memory transport with a recording
/// notifier. Identities are any non-blank string without whitespace and
/// each identity is also its own peer id.
pub fn test_app() -> TestApp {
    let transport = MemoryTransport::new();
    let (notifier, inbox) = RecordingNotifier::new();
    let orchestrator = ConnectionOrchestrator::new(
        Arc::new(ProfileRegistry::new()),
        Arc::new(transport),
        notifier,
        RegistrySettings {
            retry_interval: Duration::from_millis(20),
            send_retry_limit: 5,
        },
    );
    let state = AppState {
        orchestrator: orchestrator.clone(),
    };
    TestApp {
        app: handlers::api_routes().with_state(state),
        orchestrator,
        inbox,
    }
}

/// POST a JSON body and return the status with the parsed response body.
pub async fn post_json(
    app: &Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Wait until `expected` connections report Open.
pub async fn wait_all_open(orchestrator: &ConnectionOrchestrator, expected: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let open = orchestrator
                .registry()
                .snapshot()
                .await
                .iter()
                .filter(|c| c.status == ConnectionStatus::Open)
                .count();
            if open == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connections never opened");
}
