//! Connection Orchestrator: add/remove lifecycle, lazy endpoints, dialing.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::notifier::Notifier;
use crate::registry::{EndpointClaim, PeerConnection, ProfileContext, ProfileRegistry};
use crate::router::MessageRouter;
use crate::transport::{Endpoint, PROTOCOL_TAG, PeerStream, Transport};
use crate::types::{ContactId, Identity, ProfileId, RemoteAddress};

/// Timing knobs for the background loops.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    /// Pause between dial attempts, and the upper bound on a pending send's
    /// wait before it re-resolves.
    pub retry_interval: Duration,
    /// Write attempts before a send gives up.
    pub send_retry_limit: u32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(3),
            send_retry_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOutcome {
    Created,
    AlreadyExists,
}

pub struct ConnectionOrchestrator {
    registry: Arc<ProfileRegistry>,
    transport: Arc<dyn Transport>,
    router: Arc<MessageRouter>,
    settings: RegistrySettings,
}

impl ConnectionOrchestrator {
    pub fn new(
        registry: Arc<ProfileRegistry>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        settings: RegistrySettings,
    ) -> Arc<Self> {
        let router = Arc::new(MessageRouter::new(registry.clone(), notifier, settings));
        Arc::new(Self {
            registry,
            transport,
            router,
            settings,
        })
    }

    pub fn registry(&self) -> &Arc<ProfileRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn settings(&self) -> RegistrySettings {
        self.settings
    }

    /// Register `contact` under `profile` and start dialing it in the
    /// background. Returns as soon as the entry exists.
    pub async fn add_connection(
        self: &Arc<Self>,
        profile: ProfileId,
        identity: Identity,
        contact: ContactId,
        remote_address: RemoteAddress,
    ) -> Result<AddOutcome, RegistryError> {
        self.transport
            .validate_identity(&identity)
            .map_err(|e| RegistryError::BadRequest(e.to_string()))?;
        self.transport
            .validate_address(&remote_address)
            .map_err(|e| RegistryError::BadRequest(e.to_string()))?;

        // A concurrent removal can evict the profile between lookup and
        // insert; start over against a fresh context when that happens.
        let (ctx, conn) = loop {
            if self.registry.cancel_token().is_cancelled() {
                return Err(RegistryError::Internal("registry is shutting down".to_string()));
            }
            let (ctx, created) = self.registry.get_or_create(profile, identity.clone()).await;
            match ctx.insert_connection(contact, remote_address.clone()).await {
                Ok(Some(conn)) => {
                    if created {
                        info!(profile = %profile, "profile registered");
                    }
                    break (ctx, conn);
                }
                Ok(None) => {
                    debug!(profile = %profile, contact = %contact, "connection already exists");
                    return Ok(AddOutcome::AlreadyExists);
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        };
        info!(profile = %profile, contact = %contact, remote = %remote_address, "connection added");

        // The dial task owns the connection from here on, even if this caller
        // is dropped at the await below.
        let this = self.clone();
        let dial_ctx = ctx.clone();
        tokio::spawn(async move { this.dial_loop(dial_ctx, conn).await });

        if let Err(e) = self.ensure_endpoint(&ctx).await {
            warn!(profile = %profile, "endpoint not ready, dial task will retry: {e}");
        }
        Ok(AddOutcome::Created)
    }

    /// Remove the (profile, contact) pair, closing its stream and, if it was
    /// the profile's last contact, the profile's endpoint.
    pub async fn remove_connection(
        &self,
        profile: ProfileId,
        contact: ContactId,
    ) -> Result<(), RegistryError> {
        let detached = self.registry.detach(profile, contact).await?;
        info!(
            profile = %profile,
            contact = %contact,
            evicted = detached.profile_evicted,
            "connection removed"
        );

        let closed = match &detached.stream {
            Some(stream) => stream.close().await,
            None => Ok(()),
        };
        if let Some(endpoint) = detached.endpoint {
            endpoint.close().await;
            debug!(profile = %profile, "endpoint closed");
        }
        closed.map_err(|e| RegistryError::Internal(format!("closing stream to {contact}: {e}")))
    }

    /// Return the profile's endpoint, creating it if nobody has yet.
    pub(crate) async fn ensure_endpoint(
        self: &Arc<Self>,
        ctx: &Arc<ProfileContext>,
    ) -> Result<Arc<dyn Endpoint>, RegistryError> {
        loop {
            let notified = ctx.endpoint_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match ctx.claim_endpoint().await? {
                EndpointClaim::Ready(endpoint) => return Ok(endpoint),
                EndpointClaim::Create => {
                    // Detached so the slot always leaves Creating, whoever
                    // is still waiting on it.
                    let this = self.clone();
                    let creating_ctx = ctx.clone();
                    let creation =
                        tokio::spawn(async move { this.create_endpoint(&creating_ctx).await });
                    return match creation.await {
                        Ok(result) => result,
                        Err(e) => {
                            ctx.abandon_endpoint().await;
                            Err(RegistryError::Internal(format!("endpoint creation task: {e}")))
                        }
                    };
                }
                EndpointClaim::Wait => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(self.settings.retry_interval) => {}
                        _ = ctx.cancel_token().cancelled() => {
                            return Err(RegistryError::ProfileNotFound(ctx.id()));
                        }
                    }
                }
            }
        }
    }

    async fn create_endpoint(
        &self,
        ctx: &Arc<ProfileContext>,
    ) -> Result<Arc<dyn Endpoint>, RegistryError> {
        let endpoint = match self.transport.create_endpoint(ctx.identity()).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                ctx.abandon_endpoint().await;
                return Err(e.into());
            }
        };
        endpoint.on_inbound_stream(self.router.inbound_handler(ctx));

        if ctx.publish_endpoint(endpoint.clone()).await {
            info!(profile = %ctx.id(), "endpoint created");
            Ok(endpoint)
        } else {
            debug!(profile = %ctx.id(), "profile removed during endpoint creation");
            endpoint.close().await;
            Err(RegistryError::ProfileNotFound(ctx.id()))
        }
    }

    /// Dial until a stream is installed or the connection is removed.
    async fn dial_loop(self: Arc<Self>, ctx: Arc<ProfileContext>, conn: Arc<PeerConnection>) {
        let profile = ctx.id();
        let contact = conn.contact();
        let cancel = conn.cancel_token().clone();
        let mut attempt = 0u64;

        loop {
            if cancel.is_cancelled() || !self.is_current(&ctx, &conn).await {
                debug!(profile = %profile, contact = %contact, "connection gone, dial stopped");
                return;
            }

            let endpoint = match self.ensure_endpoint(&ctx).await {
                Ok(endpoint) => Some(endpoint),
                Err(e) if e.is_not_found() => return,
                Err(e) => {
                    warn!(profile = %profile, "endpoint creation failed: {e}");
                    None
                }
            };

            if let Some(endpoint) = endpoint {
                attempt += 1;
                let opened = tokio::select! {
                    result = endpoint.open(conn.remote_address(), PROTOCOL_TAG) => result,
                    _ = cancel.cancelled() => return,
                };
                match opened {
                    Ok(stream) => {
                        self.install(&ctx, &conn, stream).await;
                        return;
                    }
                    Err(e) => {
                        debug!(
                            profile = %profile,
                            contact = %contact,
                            attempt,
                            "dial failed: {e}"
                        );
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.retry_interval) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn is_current(&self, ctx: &Arc<ProfileContext>, conn: &Arc<PeerConnection>) -> bool {
        match self.registry.resolve(ctx.id(), conn.contact()).await {
            Ok((_, live)) => Arc::ptr_eq(&live, conn),
            Err(_) => false,
        }
    }

    /// Install a freshly dialed stream, or close it if the pair is gone or
    /// already has one.
    async fn install(&self, ctx: &Arc<ProfileContext>, conn: &Arc<PeerConnection>, stream: PeerStream) {
        let (reader, writer) = stream.split();
        let writer = Arc::new(writer);

        if ctx.install_stream(conn, writer.clone()).await {
            info!(
                profile = %ctx.id(),
                contact = %conn.contact(),
                remote = %writer.remote_identity(),
                "stream open"
            );
            self.router.spawn_reader(
                Arc::downgrade(ctx),
                reader,
                conn.cancel_token().clone(),
                Some(conn.clone()),
                None,
            );
        } else {
            debug!(
                profile = %ctx.id(),
                contact = %conn.contact(),
                "discarding stream for removed connection"
            );
            if let Err(e) = writer.close().await {
                debug!("closing discarded stream: {e}");
            }
        }
    }

    /// Cancel every background task and close every stream and endpoint.
    pub async fn shutdown(&self) {
        let drained = self.registry.drain().await;
        let (streams, endpoints) = (drained.streams.len(), drained.endpoints.len());
        for stream in drained.streams {
            if let Err(e) = stream.close().await {
                debug!("closing stream on shutdown: {e}");
            }
        }
        for endpoint in drained.endpoints {
            endpoint.close().await;
        }
        if streams > 0 || endpoints > 0 {
            info!(streams, endpoints, "connection registry shut down");
        } else {
            debug!("connection registry shut down");
        }
    }
}
