//! In-process transport and notifier for tests and local experiments.
//!
//! Every [`MemoryTransport`] clone shares one simulated network. An identity
//! string is used verbatim as the endpoint's peer id, and a contact address is
//! the peer id to dial.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};

use crate::error::TransportError;
use crate::notifier::{BoxError, Notifier};
use crate::transport::{Endpoint, InboundHandler, PeerStream, StreamGuard, Transport};
use crate::types::{Envelope, Identity, PeerId, RemoteAddress};

const PIPE_CAPACITY: usize = 64 * 1024;

struct Network {
    endpoints: Mutex<HashMap<PeerId, Arc<MemoryEndpoint>>>,
    unreachable: Mutex<HashSet<PeerId>>,
    dials_open: watch::Sender<bool>,
    failing_creates: AtomicUsize,
    dial_attempts: AtomicUsize,
    endpoints_created: AtomicUsize,
    live_streams: Arc<AtomicUsize>,
}

/// Simulated peer-to-peer network.
#[derive(Clone)]
pub struct MemoryTransport {
    net: Arc<Network>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (dials_open, _) = watch::channel(true);
        Self {
            net: Arc::new(Network {
                endpoints: Mutex::new(HashMap::new()),
                unreachable: Mutex::new(HashSet::new()),
                dials_open,
                failing_creates: AtomicUsize::new(0),
                dial_attempts: AtomicUsize::new(0),
                endpoints_created: AtomicUsize::new(0),
                live_streams: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Hold every dial (new and in-flight) until [`Self::release_dials`].
    pub fn pause_dials(&self) {
        self.net.dials_open.send_replace(false);
    }

    pub fn release_dials(&self) {
        self.net.dials_open.send_replace(true);
    }

    /// Make dials to `peer` fail until reachable again.
    pub async fn set_reachable(&self, peer: &str, reachable: bool) {
        let mut unreachable = self.net.unreachable.lock().await;
        if reachable {
            unreachable.remove(&PeerId::new(peer));
        } else {
            unreachable.insert(PeerId::new(peer));
        }
    }

    /// Fail the next `n` endpoint creations.
    pub fn fail_next_creates(&self, n: usize) {
        self.net.failing_creates.store(n, Ordering::SeqCst);
    }

    pub fn dial_attempts(&self) -> usize {
        self.net.dial_attempts.load(Ordering::SeqCst)
    }

    pub fn endpoints_created(&self) -> usize {
        self.net.endpoints_created.load(Ordering::SeqCst)
    }

    /// Streams opened by any dialer and not yet closed.
    pub fn live_streams(&self) -> usize {
        self.net.live_streams.load(Ordering::SeqCst)
    }

    pub async fn is_listening(&self, peer: &str) -> bool {
        self.net
            .endpoints
            .lock()
            .await
            .contains_key(&PeerId::new(peer))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn validate_identity(&self, identity: &Identity) -> Result<(), TransportError> {
        let id = identity.as_str();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(TransportError::InvalidIdentity(
                "identity must be a non-empty token".into(),
            ));
        }
        Ok(())
    }

    fn validate_address(&self, address: &RemoteAddress) -> Result<(), TransportError> {
        if address.as_str().trim().is_empty() {
            return Err(TransportError::InvalidAddress("empty address".into()));
        }
        Ok(())
    }

    async fn create_endpoint(
        &self,
        identity: &Identity,
    ) -> Result<Arc<dyn Endpoint>, TransportError> {
        self.validate_identity(identity)?;
        // Give concurrent callers a chance to interleave.
        tokio::task::yield_now().await;

        let failing = self
            .net
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(TransportError::Endpoint("injected failure".into()));
        }

        let local = PeerId::new(identity.as_str());
        let mut endpoints = self.net.endpoints.lock().await;
        if endpoints.contains_key(&local) {
            return Err(TransportError::Endpoint(format!("{local} is already bound")));
        }
        let (handler, _) = watch::channel(None);
        let endpoint = Arc::new(MemoryEndpoint {
            local: local.clone(),
            net: self.net.clone(),
            handler,
            closed: AtomicBool::new(false),
        });
        endpoints.insert(local, endpoint.clone());
        self.net.endpoints_created.fetch_add(1, Ordering::SeqCst);
        Ok(endpoint)
    }
}

pub struct MemoryEndpoint {
    local: PeerId,
    net: Arc<Network>,
    handler: watch::Sender<Option<InboundHandler>>,
    closed: AtomicBool,
}

impl MemoryEndpoint {
    pub fn peer_id(&self) -> &PeerId {
        &self.local
    }
}

#[async_trait]
impl Endpoint for MemoryEndpoint {
    async fn open(
        &self,
        remote: &RemoteAddress,
        _protocol: &'static [u8],
    ) -> Result<PeerStream, TransportError> {
        self.net.dial_attempts.fetch_add(1, Ordering::SeqCst);

        let mut open = self.net.dials_open.subscribe();
        open.wait_for(|open| *open)
            .await
            .map_err(|_| TransportError::Dial("network gone".into()))?;

        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Dial("endpoint closed".into()));
        }
        let target = PeerId::new(remote.as_str());
        if self.net.unreachable.lock().await.contains(&target) {
            return Err(TransportError::Dial(format!("{target} unreachable")));
        }
        let peer = self
            .net
            .endpoints
            .lock()
            .await
            .get(&target)
            .cloned()
            .ok_or_else(|| TransportError::Dial(format!("no endpoint for {target}")))?;
        let handler = peer
            .handler
            .borrow()
            .clone()
            .ok_or_else(|| TransportError::Dial(format!("{target} is not accepting")))?;

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let (near_read, near_write) = tokio::io::split(near);
        let (far_read, far_write) = tokio::io::split(far);

        self.net.live_streams.fetch_add(1, Ordering::SeqCst);
        let guard = Arc::new(LiveStream {
            counter: self.net.live_streams.clone(),
            closed: AtomicBool::new(false),
        });
        let local_stream =
            PeerStream::new(target, Box::new(near_read), Box::new(near_write)).with_guard(guard);
        let remote_stream = PeerStream::new(self.local.clone(), Box::new(far_read), Box::new(far_write));

        handler(remote_stream);
        Ok(local_stream)
    }

    fn on_inbound_stream(&self, handler: InboundHandler) {
        self.handler.send_replace(Some(handler));
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handler.send_replace(None);
        let mut endpoints = self.net.endpoints.lock().await;
        if endpoints
            .get(&self.local)
            .is_some_and(|e| std::ptr::eq(e.as_ref(), self))
        {
            endpoints.remove(&self.local);
        }
    }
}

struct LiveStream {
    counter: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl StreamGuard for LiveStream {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Notifier that forwards every envelope to a channel.
pub struct RecordingNotifier {
    tx: mpsc::UnboundedSender<Envelope>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = Arc::new(Self {
            tx,
            fail: AtomicBool::new(false),
        });
        (notifier, rx)
    }

    /// Reject (and drop) every envelope while set.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, envelope: &Envelope) -> Result<(), BoxError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("frontend unavailable".into());
        }
        self.tx
            .send(envelope.clone())
            .map_err(|_| "recording receiver dropped".into())
    }
}
