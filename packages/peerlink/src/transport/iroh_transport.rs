//! iroh QUIC transport: one endpoint per profile, one QUIC connection plus one
//! bidirectional stream per logical peer stream.
//!
//! The endpoint's secret key is the profile's private key, so the remote id
//! reported by the QUIC handshake is exactly the peer id contacts dial.

use std::sync::Arc;

use async_trait::async_trait;
use iroh::endpoint::Connection;
use iroh::{EndpointAddr, RelayMap, RelayMode, RelayUrl};
use peer_registry::{
    Endpoint, Identity, InboundHandler, PROTOCOL_TAG, PeerId, PeerStream, RemoteAddress,
    StreamGuard, Transport, TransportError,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::{decode_secret_key, parse_peer_id};

/// ALPN protocol identifier for peerlink streams.
pub const ALPN: &[u8] = PROTOCOL_TAG;

/// Which relays endpoints use for NAT traversal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelaySetting {
    /// iroh's public relay network.
    Default,
    /// A single relay, e.g. the embedded one.
    Custom(RelayUrl),
    /// Direct connections only.
    Disabled,
}

impl RelaySetting {
    fn mode(&self) -> RelayMode {
        match self {
            RelaySetting::Default => RelayMode::Default,
            RelaySetting::Custom(url) => RelayMode::Custom(RelayMap::from(url.clone())),
            RelaySetting::Disabled => RelayMode::Disabled,
        }
    }

    fn url(&self) -> Option<RelayUrl> {
        match self {
            RelaySetting::Custom(url) => Some(url.clone()),
            _ => None,
        }
    }
}

/// Creates iroh endpoints keyed by profile secret keys.
pub struct IrohTransport {
    relay: RelaySetting,
}

impl IrohTransport {
    pub fn new(relay: RelaySetting) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl Transport for IrohTransport {
    fn validate_identity(&self, identity: &Identity) -> Result<(), TransportError> {
        decode_secret_key(identity.as_str())
            .map(|_| ())
            .map_err(|e| TransportError::InvalidIdentity(e.to_string()))
    }

    fn validate_address(&self, address: &RemoteAddress) -> Result<(), TransportError> {
        parse_peer_id(address.as_str())
            .map(|_| ())
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))
    }

    async fn create_endpoint(
        &self,
        identity: &Identity,
    ) -> Result<Arc<dyn Endpoint>, TransportError> {
        let secret_key = decode_secret_key(identity.as_str())
            .map_err(|e| TransportError::InvalidIdentity(e.to_string()))?;

        let endpoint = iroh::Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![ALPN.to_vec()])
            .relay_mode(self.relay.mode())
            .bind()
            .await
            .map_err(|e| TransportError::Endpoint(e.to_string()))?;

        info!(peer_id = %endpoint.id(), "iroh endpoint bound");
        Ok(IrohEndpoint::start(endpoint, self.relay.url()))
    }
}

/// A bound iroh endpoint with its accept loop.
pub struct IrohEndpoint {
    endpoint: iroh::Endpoint,
    relay_url: Option<RelayUrl>,
    handler: watch::Sender<Option<InboundHandler>>,
    cancel: CancellationToken,
}

impl IrohEndpoint {
    fn start(endpoint: iroh::Endpoint, relay_url: Option<RelayUrl>) -> Arc<Self> {
        let (handler, handler_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(endpoint.clone(), cancel.clone(), handler_rx));

        Arc::new(Self {
            endpoint,
            relay_url,
            handler,
            cancel,
        })
    }
}

#[async_trait]
impl Endpoint for IrohEndpoint {
    async fn open(
        &self,
        remote: &RemoteAddress,
        protocol: &'static [u8],
    ) -> Result<PeerStream, TransportError> {
        let id = parse_peer_id(remote.as_str())
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))?;
        let mut target = EndpointAddr::new(id);
        if let Some(url) = &self.relay_url {
            target = target.with_relay_url(url.clone());
        }

        let conn = self
            .endpoint
            .connect(target, protocol)
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;
        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;

        let remote = PeerId::new(conn.remote_id().to_string());
        debug!(remote = %remote, "outbound stream opened");
        Ok(PeerStream::new(remote, Box::new(recv), Box::new(send))
            .with_guard(Arc::new(ConnectionGuard(conn))))
    }

    fn on_inbound_stream(&self, handler: InboundHandler) {
        self.handler.send_replace(Some(handler));
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.handler.send_replace(None);
        self.endpoint.close().await;
        debug!(peer_id = %self.endpoint.id(), "iroh endpoint closed");
    }
}

/// Closes the QUIC connection carrying a stream.
struct ConnectionGuard(Connection);

impl StreamGuard for ConnectionGuard {
    fn close(&self) {
        self.0.close(0u32.into(), b"stream closed");
    }
}

async fn accept_loop(
    endpoint: iroh::Endpoint,
    cancel: CancellationToken,
    handler: watch::Receiver<Option<InboundHandler>>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("accept loop cancelled");
                break;
            }
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else {
                    debug!("endpoint closed, accept loop exiting");
                    break;
                };

                let conn = match incoming.accept() {
                    Ok(connecting) => match connecting.await {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("connection handshake failed: {}", e);
                            continue;
                        }
                    },
                    Err(e) => {
                        warn!("failed to accept incoming connection: {}", e);
                        continue;
                    }
                };

                tokio::spawn(serve_connection(conn, cancel.child_token(), handler.clone()));
            }
        }
    }
}

/// Hand every bidirectional stream the remote opens to the current handler.
async fn serve_connection(
    conn: Connection,
    cancel: CancellationToken,
    handler: watch::Receiver<Option<InboundHandler>>,
) {
    let remote = PeerId::new(conn.remote_id().to_string());
    debug!(remote = %remote, "accepted connection");

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = conn.accept_bi() => accepted,
        };
        let (send, recv) = match accepted {
            Ok(halves) => halves,
            Err(e) => {
                debug!(remote = %remote, "connection ended: {}", e);
                break;
            }
        };

        let current = handler.borrow().clone();
        let Some(deliver) = current else {
            conn.close(1u32.into(), b"not accepting");
            break;
        };
        let stream = PeerStream::new(remote.clone(), Box::new(recv), Box::new(send))
            .with_guard(Arc::new(ConnectionGuard(conn.clone())));
        deliver(stream);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use peer_registry::{Message, MessageCodec};
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::identity::issue;
    use crate::config::RelayChoice;
    use crate::transport::relay::Relays;

    /// Timeout for each async operation in tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(15);

    #[test]
    fn validates_identity_and_address() {
        let transport = IrohTransport::new(RelaySetting::Disabled);
        let issued = issue();
        assert!(
            transport
                .validate_identity(&Identity::new(issued.private_key))
                .is_ok()
        );
        assert!(
            transport
                .validate_address(&RemoteAddress::new(issued.peer_id))
                .is_ok()
        );
        assert!(matches!(
            transport.validate_identity(&Identity::new("nope")),
            Err(TransportError::InvalidIdentity(_))
        ));
        assert!(matches!(
            transport.validate_address(&RemoteAddress::new("nope")),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn relay_setting_modes() {
        assert_eq!(RelaySetting::Default.url(), None);
        let url: RelayUrl = "http://127.0.0.1:3340".parse().unwrap();
        assert_eq!(RelaySetting::Custom(url.clone()).url(), Some(url));
    }

    #[tokio::test]
    async fn stream_carries_frames_between_profiles() {
        let relays = Relays::from_choice(&RelayChoice::Embedded(([127, 0, 0, 1], 0).into()))
            .await
            .expect("failed to start relay");
        let transport = IrohTransport::new(relays.setting().clone());

        let alice_keys = issue();
        let bob_keys = issue();
        let alice = transport
            .create_endpoint(&Identity::new(alice_keys.private_key))
            .await
            .expect("alice endpoint");
        let bob = transport
            .create_endpoint(&Identity::new(bob_keys.private_key))
            .await
            .expect("bob endpoint");

        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.on_inbound_stream(Arc::new(move |stream: PeerStream| {
            let _ = tx.send(stream);
        }));

        let stream = timeout(
            TEST_TIMEOUT,
            alice.open(&RemoteAddress::new(bob_keys.peer_id.clone()), ALPN),
        )
        .await
        .expect("dial timed out")
        .expect("dial failed");
        assert_eq!(stream.remote_identity().as_str(), bob_keys.peer_id);

        let (_reader, writer) = stream.split();
        let message = Message {
            creation_timestamp: 1_700_000_000,
            kind: "text".into(),
            file: None,
            text: "over quic".into(),
            markdown: true,
        };
        writer.send(&message).await.expect("write failed");

        let accepted = timeout(TEST_TIMEOUT, rx.recv())
            .await
            .expect("accept timed out")
            .expect("handler dropped");
        assert_eq!(accepted.remote_identity().as_str(), alice_keys.peer_id);

        let (reader, _keep) = accepted.split();
        let mut frames = FramedRead::new(reader.into_inner(), MessageCodec::new());
        let received = timeout(TEST_TIMEOUT, frames.next())
            .await
            .expect("read timed out")
            .expect("stream ended")
            .expect("decode failed");
        assert_eq!(received, message);

        alice.close().await;
        bob.close().await;
        relays.shutdown().await;
    }
}
