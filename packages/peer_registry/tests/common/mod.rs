#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use peer_registry::memory::{MemoryTransport, RecordingNotifier};
use peer_registry::{
    ConnectionOrchestrator, ConnectionStatus, ContactId, Endpoint, Envelope, Identity, Message,
    PeerStream, ProfileId, ProfileRegistry, RegistrySettings, RemoteAddress, Transport,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Timeout for each wait in tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Node {
    pub orchestrator: Arc<ConnectionOrchestrator>,
    pub notifier: Arc<RecordingNotifier>,
    pub inbox: mpsc::UnboundedReceiver<Envelope>,
}

impl Node {
    pub fn new(net: &MemoryTransport) -> Self {
        let (notifier, inbox) = RecordingNotifier::new();
        let orchestrator = ConnectionOrchestrator::new(
            Arc::new(ProfileRegistry::new()),
            Arc::new(net.clone()),
            notifier.clone(),
            RegistrySettings::default(),
        );
        Self {
            orchestrator,
            notifier,
            inbox,
        }
    }

    pub async fn add(
        &self,
        profile: i64,
        identity: &str,
        contact: i64,
        address: &str,
    ) -> peer_registry::AddOutcome {
        self.orchestrator
            .add_connection(
                ProfileId(profile),
                Identity::new(identity),
                ContactId(contact),
                RemoteAddress::new(address),
            )
            .await
            .expect("add_connection failed")
    }

    pub async fn wait_for_status(&self, profile: i64, contact: i64, want: ConnectionStatus) {
        let registry = self.orchestrator.registry().clone();
        timeout(TEST_TIMEOUT, async move {
            loop {
                if let Ok((_, conn)) = registry.resolve(ProfileId(profile), ContactId(contact)).await
                {
                    if conn.status().await == want {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("timed out waiting for connection status");
    }
}

/// A bare endpoint that parks every accepted stream in a channel.
pub async fn listener(
    net: &MemoryTransport,
    id: &str,
) -> (Arc<dyn Endpoint>, mpsc::UnboundedReceiver<PeerStream>) {
    let endpoint = net
        .create_endpoint(&Identity::new(id))
        .await
        .expect("failed to create listener endpoint");
    let (tx, rx) = mpsc::unbounded_channel();
    endpoint.on_inbound_stream(Arc::new(move |stream: PeerStream| {
        let _ = tx.send(stream);
    }));
    (endpoint, rx)
}

pub fn message(text: &str) -> Message {
    Message {
        creation_timestamp: 1_700_000_000,
        kind: "text".into(),
        file: None,
        text: text.into(),
        markdown: false,
    }
}

pub async fn wait_until(check: impl Fn() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}
