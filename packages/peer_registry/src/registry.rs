//! Profile Registry: the ownership tree of profiles and their peer connections.
//!
//! Locks nest strictly `profiles` → `ProfileContext::state` →
//! `PeerConnection::state`. None of them is held while calling into a
//! transport or notifier. Removed entities are tombstoned by cancelling their
//! token so that stale `Arc` holders notice.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::transport::{Endpoint, StreamWriter};
use crate::types::{ConnectionStatus, ContactId, Identity, PeerId, ProfileId, RemoteAddress};

// ---------------------------------------------------------------------------
// Peer connection
// ---------------------------------------------------------------------------

struct ConnectionState {
    stream: Option<Arc<StreamWriter>>,
    remote: Option<PeerId>,
    status: ConnectionStatus,
}

/// Per-(profile, contact) stream state.
pub struct PeerConnection {
    contact: ContactId,
    remote_address: RemoteAddress,
    state: Mutex<ConnectionState>,
    status_tx: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
}

impl PeerConnection {
    fn new(contact: ContactId, remote_address: RemoteAddress, cancel: CancellationToken) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Pending);
        Self {
            contact,
            remote_address,
            state: Mutex::new(ConnectionState {
                stream: None,
                remote: None,
                status: ConnectionStatus::Pending,
            }),
            status_tx,
            cancel,
        }
    }

    pub fn contact(&self) -> ContactId {
        self.contact
    }

    pub fn remote_address(&self) -> &RemoteAddress {
        &self.remote_address
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status
    }

    /// Current status together with the write half, if one is installed.
    pub(crate) async fn stream(&self) -> (ConnectionStatus, Option<Arc<StreamWriter>>) {
        let state = self.state.lock().await;
        (state.status, state.stream.clone())
    }

    /// Receiver that wakes on every status change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_removed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Set the stream exactly once. Returns false if one was ever installed
    /// or the connection is no longer pending.
    async fn install(&self, writer: Arc<StreamWriter>) -> bool {
        let mut state = self.state.lock().await;
        if state.stream.is_some() || state.status != ConnectionStatus::Pending {
            return false;
        }
        state.remote = Some(writer.remote_identity().clone());
        state.stream = Some(writer);
        state.status = ConnectionStatus::Open;
        self.status_tx.send_replace(ConnectionStatus::Open);
        true
    }

    /// Mark the installed stream as ended. The handle stays in place so the
    /// slot is never reused.
    pub(crate) async fn mark_closed(&self) {
        let mut state = self.state.lock().await;
        if state.status != ConnectionStatus::Closed {
            state.status = ConnectionStatus::Closed;
            self.status_tx.send_replace(ConnectionStatus::Closed);
        }
    }

    /// Close out the connection's state on removal and hand back its stream.
    async fn retire(&self) -> (Option<Arc<StreamWriter>>, Option<PeerId>) {
        let mut state = self.state.lock().await;
        state.status = ConnectionStatus::Closed;
        self.status_tx.send_replace(ConnectionStatus::Closed);
        self.cancel.cancel();
        (state.stream.take(), state.remote.clone())
    }
}

// ---------------------------------------------------------------------------
// Profile context
// ---------------------------------------------------------------------------

pub(crate) enum EndpointSlot {
    Absent,
    /// Someone is inside `Transport::create_endpoint`.
    Creating,
    Ready(Arc<dyn Endpoint>),
}

impl EndpointSlot {
    fn take_ready(&mut self) -> Option<Arc<dyn Endpoint>> {
        match std::mem::replace(self, EndpointSlot::Absent) {
            EndpointSlot::Ready(endpoint) => Some(endpoint),
            _ => None,
        }
    }
}

/// What the caller of [`ProfileContext::claim_endpoint`] should do next.
pub(crate) enum EndpointClaim {
    Ready(Arc<dyn Endpoint>),
    /// The caller flipped the slot to `Creating` and must create the endpoint.
    Create,
    /// Another task is creating it.
    Wait,
}

pub(crate) struct ProfileState {
    pub(crate) endpoint: EndpointSlot,
    pub(crate) connections: HashMap<ContactId, Arc<PeerConnection>>,
    /// Remote identity of each installed stream to its contact.
    pub(crate) by_remote: HashMap<PeerId, ContactId>,
    /// Tokens for readers of accepted streams, per remote identity.
    pub(crate) inbound: HashMap<PeerId, CancellationToken>,
}

/// Per-profile state: identity, lazily created endpoint, and connections.
pub struct ProfileContext {
    id: ProfileId,
    identity: Identity,
    pub(crate) state: Mutex<ProfileState>,
    pub(crate) endpoint_ready: Notify,
    cancel: CancellationToken,
}

impl ProfileContext {
    fn new(id: ProfileId, identity: Identity, cancel: CancellationToken) -> Self {
        Self {
            id,
            identity,
            state: Mutex::new(ProfileState {
                endpoint: EndpointSlot::Absent,
                connections: HashMap::new(),
                by_remote: HashMap::new(),
                inbound: HashMap::new(),
            }),
            endpoint_ready: Notify::new(),
            cancel,
        }
    }

    pub fn id(&self) -> ProfileId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once the profile has been evicted from its registry.
    pub fn is_removed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn connection(&self, contact: ContactId) -> Option<Arc<PeerConnection>> {
        self.state.lock().await.connections.get(&contact).cloned()
    }

    pub async fn contact_for(&self, remote: &PeerId) -> Option<ContactId> {
        self.state.lock().await.by_remote.get(remote).copied()
    }

    pub async fn has_endpoint(&self) -> bool {
        matches!(self.state.lock().await.endpoint, EndpointSlot::Ready(_))
    }

    /// Insert a Pending connection unless the contact already exists.
    ///
    /// Returns `Ok(None)` for an existing contact and `Err` if the profile was
    /// evicted in the meantime.
    pub(crate) async fn insert_connection(
        &self,
        contact: ContactId,
        remote_address: RemoteAddress,
    ) -> Result<Option<Arc<PeerConnection>>, RegistryError> {
        let mut state = self.state.lock().await;
        if self.is_removed() {
            return Err(RegistryError::ProfileNotFound(self.id));
        }
        if state.connections.contains_key(&contact) {
            return Ok(None);
        }
        let conn = Arc::new(PeerConnection::new(
            contact,
            remote_address,
            self.cancel.child_token(),
        ));
        state.connections.insert(contact, conn.clone());
        Ok(Some(conn))
    }

    pub(crate) async fn claim_endpoint(&self) -> Result<EndpointClaim, RegistryError> {
        let mut state = self.state.lock().await;
        if self.is_removed() {
            return Err(RegistryError::ProfileNotFound(self.id));
        }
        Ok(match &state.endpoint {
            EndpointSlot::Ready(endpoint) => EndpointClaim::Ready(endpoint.clone()),
            EndpointSlot::Creating => EndpointClaim::Wait,
            EndpointSlot::Absent => {
                state.endpoint = EndpointSlot::Creating;
                EndpointClaim::Create
            }
        })
    }

    /// Store a freshly created endpoint. Returns false when the profile was
    /// evicted during creation; the caller then owns closing it.
    pub(crate) async fn publish_endpoint(&self, endpoint: Arc<dyn Endpoint>) -> bool {
        let published = {
            let mut state = self.state.lock().await;
            if self.is_removed() {
                state.endpoint = EndpointSlot::Absent;
                false
            } else {
                state.endpoint = EndpointSlot::Ready(endpoint);
                true
            }
        };
        self.endpoint_ready.notify_waiters();
        published
    }

    /// Give up a failed creation so the next caller can try again.
    pub(crate) async fn abandon_endpoint(&self) {
        {
            let mut state = self.state.lock().await;
            if matches!(state.endpoint, EndpointSlot::Creating) {
                state.endpoint = EndpointSlot::Absent;
            }
        }
        self.endpoint_ready.notify_waiters();
    }

    /// Install `writer` as `conn`'s stream if `conn` is still the live entry
    /// for its contact and has never had one.
    pub(crate) async fn install_stream(
        &self,
        conn: &Arc<PeerConnection>,
        writer: Arc<StreamWriter>,
    ) -> bool {
        let mut state = self.state.lock().await;
        if self.is_removed() {
            return false;
        }
        let current = state
            .connections
            .get(&conn.contact)
            .is_some_and(|c| Arc::ptr_eq(c, conn));
        if !current {
            return false;
        }
        let remote = writer.remote_identity().clone();
        if !conn.install(writer).await {
            return false;
        }
        if let Some(previous) = state.by_remote.insert(remote.clone(), conn.contact) {
            if previous != conn.contact {
                warn!(
                    profile = %self.id,
                    contact = %conn.contact,
                    shadowed = %previous,
                    remote = %remote,
                    "remote identity already mapped to another contact"
                );
            }
        }
        true
    }

    /// Token for a reader of an accepted stream from `remote`, or `None` if
    /// the profile is gone or no contact of it dials or maps to `remote`.
    pub(crate) async fn inbound_token(&self, remote: &PeerId) -> Option<CancellationToken> {
        let mut state = self.state.lock().await;
        if self.is_removed() {
            return None;
        }
        let known = state.by_remote.contains_key(remote)
            || state
                .connections
                .values()
                .any(|c| c.remote_address.as_str() == remote.as_str());
        if !known {
            return None;
        }
        let token = state
            .inbound
            .entry(remote.clone())
            .or_insert_with(|| self.cancel.child_token());
        Some(token.clone())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Everything taken out of the tree by a removal; closed after the locks are
/// released.
pub struct Detached {
    pub connection: Arc<PeerConnection>,
    pub stream: Option<Arc<StreamWriter>>,
    /// Set when the removal emptied and evicted the profile.
    pub endpoint: Option<Arc<dyn Endpoint>>,
    pub profile_evicted: bool,
}

/// Handles drained from the registry on shutdown.
#[derive(Default)]
pub struct Drained {
    pub streams: Vec<Arc<StreamWriter>>,
    pub endpoints: Vec<Arc<dyn Endpoint>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub profile_db_id: i64,
    pub contact_db_id: i64,
    pub contact_peer_id: String,
    pub status: ConnectionStatus,
}

/// Top-level map from profile id to [`ProfileContext`].
pub struct ProfileRegistry {
    profiles: Mutex<HashMap<ProfileId, Arc<ProfileContext>>>,
    cancel: CancellationToken,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self {
            profiles: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Root token; every profile and connection token descends from it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Return the context for `id`, creating it with `identity` if unknown.
    ///
    /// The identity of an existing profile is never replaced.
    pub async fn get_or_create(
        &self,
        id: ProfileId,
        identity: Identity,
    ) -> (Arc<ProfileContext>, bool) {
        let mut profiles = self.profiles.lock().await;
        if let Some(ctx) = profiles.get(&id) {
            if ctx.identity != identity {
                warn!(profile = %id, "ignoring different identity for existing profile");
            }
            return (ctx.clone(), false);
        }
        let ctx = Arc::new(ProfileContext::new(id, identity, self.cancel.child_token()));
        profiles.insert(id, ctx.clone());
        debug!(profile = %id, "profile context created");
        (ctx, true)
    }

    pub async fn get(&self, id: ProfileId) -> Result<Arc<ProfileContext>, RegistryError> {
        self.profiles
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(RegistryError::ProfileNotFound(id))
    }

    /// Look up a (profile, contact) pair as it exists right now.
    pub async fn resolve(
        &self,
        profile: ProfileId,
        contact: ContactId,
    ) -> Result<(Arc<ProfileContext>, Arc<PeerConnection>), RegistryError> {
        let ctx = self.get(profile).await?;
        let state = ctx.state.lock().await;
        if ctx.is_removed() {
            return Err(RegistryError::ProfileNotFound(profile));
        }
        let conn = state
            .connections
            .get(&contact)
            .cloned()
            .ok_or(RegistryError::ContactNotFound { profile, contact })?;
        drop(state);
        Ok((ctx, conn))
    }

    /// Evict `id` if it has no connections left. Returns its endpoint for the
    /// caller to close once no lock is held.
    pub async fn remove_if_empty(&self, id: ProfileId) -> Option<Arc<dyn Endpoint>> {
        let mut profiles = self.profiles.lock().await;
        let ctx = profiles.get(&id)?.clone();
        let mut state = ctx.state.lock().await;
        Self::evict_if_empty(&mut profiles, &ctx, &mut state)
    }

    /// Remove the (profile, contact) entry and, if that empties the profile,
    /// the profile itself, all in one critical section.
    pub async fn detach(
        &self,
        profile: ProfileId,
        contact: ContactId,
    ) -> Result<Detached, RegistryError> {
        let mut profiles = self.profiles.lock().await;
        let ctx = profiles
            .get(&profile)
            .cloned()
            .ok_or(RegistryError::ProfileNotFound(profile))?;
        let mut state = ctx.state.lock().await;
        let connection = state
            .connections
            .remove(&contact)
            .ok_or(RegistryError::ContactNotFound { profile, contact })?;

        let (stream, remote) = connection.retire().await;
        if let Some(remote) = remote {
            if state.by_remote.get(&remote) == Some(&contact) {
                state.by_remote.remove(&remote);
            }
            if let Some(token) = state.inbound.remove(&remote) {
                token.cancel();
            }
        }

        let profile_evicted = state.connections.is_empty();
        let endpoint = Self::evict_if_empty(&mut profiles, &ctx, &mut state);
        Ok(Detached {
            connection,
            stream,
            endpoint,
            profile_evicted,
        })
    }

    fn evict_if_empty(
        profiles: &mut MutexGuard<'_, HashMap<ProfileId, Arc<ProfileContext>>>,
        ctx: &Arc<ProfileContext>,
        state: &mut MutexGuard<'_, ProfileState>,
    ) -> Option<Arc<dyn Endpoint>> {
        if !state.connections.is_empty() {
            return None;
        }
        profiles.remove(&ctx.id);
        ctx.cancel.cancel();
        state.by_remote.clear();
        state.inbound.clear();
        debug!(profile = %ctx.id, "profile context evicted");
        state.endpoint.take_ready()
    }

    /// Tombstone every profile and connection, returning their handles.
    pub async fn drain(&self) -> Drained {
        let mut profiles = self.profiles.lock().await;
        self.cancel.cancel();
        let mut drained = Drained::default();
        for (_, ctx) in profiles.drain() {
            let mut state = ctx.state.lock().await;
            for (_, conn) in state.connections.drain() {
                if let (Some(stream), _) = conn.retire().await {
                    drained.streams.push(stream);
                }
            }
            state.by_remote.clear();
            state.inbound.clear();
            if let Some(endpoint) = state.endpoint.take_ready() {
                drained.endpoints.push(endpoint);
            }
        }
        drained
    }

    pub async fn len(&self) -> usize {
        self.profiles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let contexts: Vec<_> = self.profiles.lock().await.values().cloned().collect();
        let mut out = Vec::new();
        for ctx in contexts {
            let connections: Vec<_> = ctx.state.lock().await.connections.values().cloned().collect();
            for conn in connections {
                out.push(ConnectionSnapshot {
                    profile_db_id: ctx.id.0,
                    contact_db_id: conn.contact.0,
                    contact_peer_id: conn.remote_address.as_str().to_string(),
                    status: conn.status().await,
                });
            }
        }
        out.sort_by_key(|s| (s.profile_db_id, s.contact_db_id));
        out
    }

    pub async fn connection_count(&self) -> usize {
        self.snapshot().await.len()
    }
}
