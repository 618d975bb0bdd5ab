//! Message Router: outbound sends and inbound frame dispatch.

use std::sync::{Arc, Weak};

use futures::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::MessageCodec;
use crate::error::RegistryError;
use crate::notifier::Notifier;
use crate::orchestrator::RegistrySettings;
use crate::registry::{PeerConnection, ProfileContext, ProfileRegistry};
use crate::transport::{InboundHandler, PeerStream, StreamReader, StreamWriter};
use crate::types::{Addressing, ConnectionStatus, Envelope, Message, PeerId};

pub struct MessageRouter {
    registry: Arc<ProfileRegistry>,
    notifier: Arc<dyn Notifier>,
    settings: RegistrySettings,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ProfileRegistry>,
        notifier: Arc<dyn Notifier>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            registry,
            notifier,
            settings,
        }
    }

    /// Send `message` from the sender profile to the receiver contact.
    ///
    /// Waits while the connection is still dialing, re-resolving the pair on
    /// every iteration so a removal surfaces as NotFound.
    pub async fn send_message(
        &self,
        addressing: Addressing,
        message: &Message,
    ) -> Result<(), RegistryError> {
        let profile = addressing.sender_profile();
        let contact = addressing.receiver_contact();
        let mut write_failures = 0u32;

        loop {
            let (_ctx, conn) = self.registry.resolve(profile, contact).await?;
            let mut status_rx = conn.subscribe();

            match conn.stream().await {
                (ConnectionStatus::Open, Some(writer)) => {
                    let written = tokio::select! {
                        result = writer.send(message) => Some(result),
                        _ = conn.cancel_token().cancelled() => None,
                    };
                    // Removed mid-write; the next resolve reports it.
                    let Some(written) = written else { continue };
                    match written {
                        Ok(()) => {
                            debug!(profile = %profile, contact = %contact, "message written");
                            return Ok(());
                        }
                        Err(e) => {
                            write_failures += 1;
                            if write_failures >= self.settings.send_retry_limit {
                                return Err(RegistryError::Internal(format!(
                                    "write to {contact} failed after {write_failures} attempts: {e}"
                                )));
                            }
                            warn!(
                                profile = %profile,
                                contact = %contact,
                                attempt = write_failures,
                                "write failed, retrying: {e}"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(self.settings.retry_interval) => {}
                                _ = conn.cancel_token().cancelled() => {}
                            }
                        }
                    }
                }
                (ConnectionStatus::Closed, _) => {
                    return Err(RegistryError::Internal("stream closed".to_string()));
                }
                _ => {
                    debug!(profile = %profile, contact = %contact, "stream pending, waiting");
                    tokio::select! {
                        _ = status_rx.changed() => {}
                        _ = tokio::time::sleep(self.settings.retry_interval) => {}
                        _ = conn.cancel_token().cancelled() => {}
                    }
                }
            }
        }
    }

    /// Handler for an endpoint's accepted streams, bound to its profile.
    pub(crate) fn inbound_handler(self: &Arc<Self>, ctx: &Arc<ProfileContext>) -> InboundHandler {
        let router = Arc::downgrade(self);
        let ctx = Arc::downgrade(ctx);
        Arc::new(move |stream: PeerStream| {
            let (Some(router), Some(ctx)) = (router.upgrade(), ctx.upgrade()) else {
                drop(stream);
                return;
            };
            tokio::spawn(async move {
                router.accept_inbound(ctx, stream).await;
            });
        })
    }

    /// Start reading an accepted stream. Accepted streams are never used for
    /// writing; a connection's write side always comes from its own dial.
    pub async fn accept_inbound(self: &Arc<Self>, ctx: Arc<ProfileContext>, stream: PeerStream) {
        let remote = stream.remote_identity().clone();
        let Some(token) = ctx.inbound_token(&remote).await else {
            debug!(profile = %ctx.id(), remote = %remote, "stream accepted for removed profile or unknown remote");
            let _ = stream.close().await;
            return;
        };
        info!(profile = %ctx.id(), remote = %remote, "inbound stream accepted");
        let (reader, writer) = stream.split();
        // Keep the write half alive until the reader finishes.
        let writer = Arc::new(writer);
        self.spawn_reader(Arc::downgrade(&ctx), reader, token, None, Some(writer));
    }

    /// Spawn the single reader loop for a stream.
    ///
    /// `owner` is the connection that installed the stream; it is marked
    /// Closed when the stream ends.
    pub(crate) fn spawn_reader(
        self: &Arc<Self>,
        ctx: Weak<ProfileContext>,
        reader: StreamReader,
        cancel: CancellationToken,
        owner: Option<Arc<PeerConnection>>,
        keepalive: Option<Arc<StreamWriter>>,
    ) {
        let router = self.clone();
        tokio::spawn(async move {
            let remote = reader.remote_identity().clone();
            let mut frames = FramedRead::new(reader.into_inner(), MessageCodec::new());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(remote = %remote, "reader cancelled");
                        break;
                    }
                    frame = frames.next() => match frame {
                        Some(Ok(message)) => {
                            let Some(ctx) = ctx.upgrade() else { break };
                            router.dispatch(&ctx, &remote, message).await;
                        }
                        Some(Err(e)) => {
                            warn!(remote = %remote, "frame decode failed, closing reader: {e}");
                            break;
                        }
                        None => {
                            debug!(remote = %remote, "stream ended");
                            break;
                        }
                    },
                }
            }
            if let Some(conn) = owner {
                conn.mark_closed().await;
            }
            if let Some(writer) = keepalive {
                let _ = writer.close().await;
            }
        });
    }

    /// Forward one decoded frame to the notifier if its stream belongs to a
    /// registered contact of `ctx`.
    pub(crate) async fn dispatch(&self, ctx: &ProfileContext, remote: &PeerId, message: Message) {
        let Some(contact) = ctx.contact_for(remote).await else {
            debug!(profile = %ctx.id(), remote = %remote, "dropping frame from unknown remote");
            return;
        };
        if ctx.is_removed() {
            return;
        }
        let envelope = Envelope {
            message,
            addressing: Addressing::inbound(contact, ctx.id()),
        };
        if let Err(e) = self.notifier.notify(&envelope).await {
            warn!(profile = %ctx.id(), contact = %contact, "notifier failed: {e}");
        }
    }

    pub fn registry(&self) -> &Arc<ProfileRegistry> {
        &self.registry
    }
}
