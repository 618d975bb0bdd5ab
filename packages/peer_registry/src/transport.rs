//! Seams to the peer-to-peer transport provider.
//!
//! The registry never talks to a network directly. A [`Transport`] creates one
//! [`Endpoint`] per profile; endpoints open outbound [`PeerStream`]s and hand
//! accepted ones to an [`InboundHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::codec::encode_message;
use crate::error::TransportError;
use crate::types::{Identity, Message, PeerId, RemoteAddress};

/// Application protocol tag negotiated on every stream.
pub const PROTOCOL_TAG: &[u8] = b"peerlink/messaging/1";

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Callback invoked for every stream accepted by an endpoint.
pub type InboundHandler = Arc<dyn Fn(PeerStream) + Send + Sync>;

/// Keeps the transport-level connection behind a stream alive, and tears it
/// down on [`StreamGuard::close`].
pub trait StreamGuard: Send + Sync {
    fn close(&self);
}

struct NoGuard;

impl StreamGuard for NoGuard {
    fn close(&self) {}
}

/// A bidirectional ordered byte stream to one remote identity.
pub struct PeerStream {
    remote: PeerId,
    reader: BoxReader,
    writer: BoxWriter,
    guard: Arc<dyn StreamGuard>,
}

impl PeerStream {
    pub fn new(remote: PeerId, reader: BoxReader, writer: BoxWriter) -> Self {
        Self {
            remote,
            reader,
            writer,
            guard: Arc::new(NoGuard),
        }
    }

    pub fn with_guard(mut self, guard: Arc<dyn StreamGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn remote_identity(&self) -> &PeerId {
        &self.remote
    }

    /// Split into an exclusive read half and a shareable write half.
    pub fn split(self) -> (StreamReader, StreamWriter) {
        let reader = StreamReader {
            remote: self.remote.clone(),
            inner: self.reader,
        };
        let writer = StreamWriter {
            remote: self.remote,
            inner: Mutex::new(self.writer),
            guard: self.guard,
        };
        (reader, writer)
    }

    pub async fn close(self) -> Result<(), TransportError> {
        let (_reader, writer) = self.split();
        writer.close().await
    }
}

/// Read half of a [`PeerStream`]; owned by exactly one reader loop.
pub struct StreamReader {
    remote: PeerId,
    inner: BoxReader,
}

impl StreamReader {
    pub fn remote_identity(&self) -> &PeerId {
        &self.remote
    }

    pub fn into_inner(self) -> BoxReader {
        self.inner
    }
}

/// Write half of a [`PeerStream`]. The inner lock serializes whole frames.
pub struct StreamWriter {
    remote: PeerId,
    inner: Mutex<BoxWriter>,
    guard: Arc<dyn StreamGuard>,
}

impl StreamWriter {
    pub fn remote_identity(&self) -> &PeerId {
        &self.remote
    }

    /// Write one framed message and flush it.
    pub async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let frame = encode_message(message)
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;
        let mut writer = self.inner.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Finish the write side and release the underlying connection.
    ///
    /// Never waits behind an in-flight write: if one holds the stream (for
    /// example to a peer that stopped reading), the connection is torn down
    /// underneath it instead of being shut down gracefully.
    pub async fn close(&self) -> Result<(), TransportError> {
        let result = match self.inner.try_lock() {
            Ok(mut writer) => writer.shutdown().await.map_err(TransportError::from),
            Err(_) => Ok(()),
        };
        self.guard.close();
        result
    }
}

/// A per-profile network endpoint.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Open an outbound stream to `remote` speaking `protocol`.
    async fn open(
        &self,
        remote: &RemoteAddress,
        protocol: &'static [u8],
    ) -> Result<PeerStream, TransportError>;

    /// Register the handler for accepted streams. Replaces any previous one.
    fn on_inbound_stream(&self, handler: InboundHandler);

    /// Stop accepting and drop every transport connection.
    async fn close(&self);
}

/// Factory for endpoints bound to a profile identity.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Check identity material without creating anything.
    fn validate_identity(&self, identity: &Identity) -> Result<(), TransportError>;

    /// Check that `address` is a dialable target.
    fn validate_address(&self, address: &RemoteAddress) -> Result<(), TransportError>;

    async fn create_endpoint(
        &self,
        identity: &Identity,
    ) -> Result<Arc<dyn Endpoint>, TransportError>;
}
