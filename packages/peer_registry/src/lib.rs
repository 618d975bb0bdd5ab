//! Peer Registry - per-profile peer conversations over a pluggable transport
//!
//! Each local profile owns one transport endpoint and a set of connections to
//! remote contacts. The [`ConnectionOrchestrator`] adds and removes those
//! connections and dials them in the background; the [`MessageRouter`] writes
//! outbound messages and hands inbound ones to a [`Notifier`].
//!
//! This crate has no HTTP or network dependencies. The transport and the
//! frontend are supplied through the [`Transport`] and [`Notifier`] traits.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use peer_registry::memory::{MemoryTransport, RecordingNotifier};
//! use peer_registry::{
//!     Addressing, ConnectionOrchestrator, ContactId, Identity, Message, ProfileId,
//!     ProfileRegistry, RegistrySettings, RemoteAddress,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let (notifier, mut inbox) = RecordingNotifier::new();
//!     let orchestrator = ConnectionOrchestrator::new(
//!         Arc::new(ProfileRegistry::new()),
//!         Arc::new(MemoryTransport::new()),
//!         notifier,
//!         RegistrySettings::default(),
//!     );
//!
//!     orchestrator
//!         .add_connection(ProfileId(1), Identity::new("alice"), ContactId(9), RemoteAddress::new("bob"))
//!         .await
//!         .unwrap();
//!
//!     let message = Message {
//!         creation_timestamp: 1_700_000_000,
//!         kind: "text".into(),
//!         file: None,
//!         text: "hello".into(),
//!         markdown: false,
//!     };
//!     orchestrator
//!         .router()
//!         .send_message(Addressing::outbound(ProfileId(1), ContactId(9)), &message)
//!         .await
//!         .unwrap();
//!
//!     while let Some(envelope) = inbox.recv().await {
//!         println!("{:?}", envelope);
//!     }
//! }
//! ```

pub mod codec;
mod error;
pub mod memory;
mod notifier;
mod orchestrator;
mod registry;
mod router;
pub mod transport;
mod types;

pub use codec::{FrameError, MessageCodec};
pub use error::{RegistryError, TransportError};
pub use notifier::{BoxError, Notifier};
pub use orchestrator::{AddOutcome, ConnectionOrchestrator, RegistrySettings};
pub use registry::{
    ConnectionSnapshot, Detached, Drained, PeerConnection, ProfileContext, ProfileRegistry,
};
pub use router::MessageRouter;
pub use transport::{Endpoint, InboundHandler, PROTOCOL_TAG, PeerStream, StreamGuard, Transport};
pub use types::{
    Addressing, ConnectionStatus, ContactId, Envelope, Identity, Message, PeerId, ProfileId,
    RemoteAddress,
};
