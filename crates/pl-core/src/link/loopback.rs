//! In-Process Loopback Links
//!
//! Links created from the same [`LoopbackNetwork`] negotiate with each other
//! through opaque `loopback <id>` session descriptions and carry streams over
//! `tokio::io::duplex` pipes. Both roles of the tunnel can run in one process
//! against them, which is how the test suites drive every forwarding path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};

use super::{
    ArcPeerLink, BoxedDuplex, BoxedVirtualStream, LinkFactory, LinkId, LinkState, PeerLink,
    StreamState, VirtualStream,
};
use crate::error::{PortLinkError, Result};
use crate::protocol::{CandidateInit, SdpKind, SessionDescription};

/// Pipe capacity of a loopback stream
const PIPE_CAPACITY: usize = 64 * 1024;

/// Queue depth for incoming streams and local candidates
const CHANNEL_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry shared by all links that may negotiate with each other
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    links: Mutex<HashMap<u64, Weak<LinkShared>>>,
    stall_streams: AtomicBool,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, newly requested streams never leave `Connecting`.
    pub fn set_stall_streams(&self, stall: bool) {
        self.inner.stall_streams.store(stall, Ordering::SeqCst);
    }

    /// Forces `link` and its peer into `Failed`.
    pub fn fail(&self, link: &ArcPeerLink) {
        if let Some(shared) = self.inner.lookup(link.id().raw()) {
            shared.transition(LinkState::Failed);
            if let Some(peer) = shared.peer() {
                peer.transition(LinkState::Failed);
            }
        }
    }

    /// Candidates the peer delivered to `link` through signaling
    pub fn received_candidates(&self, link: &ArcPeerLink) -> Vec<CandidateInit> {
        self.inner
            .lookup(link.id().raw())
            .map(|shared| lock(&shared.received_candidates).clone())
            .unwrap_or_default()
    }

    /// Number of links still alive on this network
    pub fn live_links(&self) -> usize {
        lock(&self.inner.links)
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Runs a complete offer/answer exchange between two links directly.
    pub async fn negotiate(&self, offerer: &ArcPeerLink, answerer: &ArcPeerLink) -> Result<()> {
        let offer = offerer.create_offer().await?;
        offerer.set_local_description(offer.clone()).await?;
        answerer.set_remote_description(offer).await?;
        let answer = answerer.create_answer().await?;
        answerer.set_local_description(answer.clone()).await?;
        offerer.set_remote_description(answer).await
    }

    fn create_link(&self) -> LoopbackLink {
        let (state_tx, _) = watch::channel(LinkState::Idle);
        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (candidates_tx, candidates_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let shared = Arc::new(LinkShared {
            id: LinkId::next(),
            network: Arc::downgrade(&self.inner),
            state_tx,
            peer: Mutex::new(None),
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            stalled: Mutex::new(Vec::new()),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            candidates_tx,
            candidates_rx: Mutex::new(Some(candidates_rx)),
            received_candidates: Mutex::new(Vec::new()),
        });

        lock(&self.inner.links).insert(shared.id.raw(), Arc::downgrade(&shared));
        LoopbackLink { shared }
    }
}

impl LinkFactory for LoopbackNetwork {
    fn create(&self) -> BoxFuture<'_, Result<ArcPeerLink>> {
        let link: ArcPeerLink = Arc::new(self.create_link());
        futures::future::ready(Ok(link)).boxed()
    }
}

impl NetworkInner {
    fn lookup(&self, id: u64) -> Option<Arc<LinkShared>> {
        lock(&self.links).get(&id).and_then(Weak::upgrade)
    }
}

/// A stream requested before its link connected, plus the twin the peer
/// receives once it does
struct PendingStream {
    state_tx: Arc<watch::Sender<StreamState>>,
    twin: LoopbackStream,
}

struct LinkShared {
    id: LinkId,
    network: Weak<NetworkInner>,
    state_tx: watch::Sender<LinkState>,
    peer: Mutex<Option<Weak<LinkShared>>>,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    pending: Mutex<Vec<PendingStream>>,
    // keeps stalled streams from observing a dropped sender
    stalled: Mutex<Vec<PendingStream>>,
    incoming_tx: mpsc::Sender<BoxedVirtualStream>,
    incoming_rx: Mutex<Option<mpsc::Receiver<BoxedVirtualStream>>>,
    candidates_tx: mpsc::Sender<CandidateInit>,
    candidates_rx: Mutex<Option<mpsc::Receiver<CandidateInit>>>,
    received_candidates: Mutex<Vec<CandidateInit>>,
}

impl LinkShared {
    fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    fn peer(&self) -> Option<Arc<LinkShared>> {
        lock(&self.peer).as_ref().and_then(Weak::upgrade)
    }

    /// Moves to `next` unless the link already ended.
    fn transition(&self, next: LinkState) {
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if next.is_terminal() {
            let pending: Vec<PendingStream> = lock(&self.pending)
                .drain(..)
                .chain(lock(&self.stalled).drain(..))
                .collect();
            for stream in pending {
                stream.state_tx.send_replace(StreamState::Closed);
            }
        }
    }

    fn negotiated(&self) -> bool {
        self.has_local.load(Ordering::SeqCst) && self.has_remote.load(Ordering::SeqCst)
    }

    /// Connects both ends once each has applied a local and a remote
    /// description.
    fn maybe_connect(self: &Arc<Self>) {
        let Some(network) = self.network.upgrade() else {
            return;
        };
        let Some(peer) = self.peer() else {
            return;
        };
        let peer_points_back = peer.peer().map(|p| p.id) == Some(self.id);
        if !(self.negotiated() && peer.negotiated() && peer_points_back) {
            return;
        }

        // serialises concurrent connects from both ends
        let _links = lock(&network.links);
        if self.state() == LinkState::Connected {
            return;
        }
        self.transition(LinkState::Connected);
        peer.transition(LinkState::Connected);

        self.flush_pending(&peer);
        peer.flush_pending(self);
    }

    fn flush_pending(&self, peer: &LinkShared) {
        for pending in lock(&self.pending).drain(..) {
            pending.state_tx.send_replace(StreamState::Open);
            pending.twin.state_tx.send_replace(StreamState::Open);
            let _ = peer.incoming_tx.try_send(Box::new(pending.twin));
        }
    }

    fn emit_local_candidate(&self) {
        let candidate = CandidateInit {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.id.raw(),
                40000 + self.id.raw() % 20000
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let _ = self.candidates_tx.try_send(candidate);
    }
}

/// One end of a loopback connection
pub struct LoopbackLink {
    shared: Arc<LinkShared>,
}

impl LoopbackLink {
    fn parse_description(desc: &SessionDescription) -> Result<u64> {
        desc.sdp
            .strip_prefix("loopback ")
            .and_then(|id| id.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                PortLinkError::Negotiation(format!("unrecognised session description '{}'", desc.sdp))
            })
    }

    fn description(&self, kind: SdpKind) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!("loopback {}", self.shared.id.raw()),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.state().is_terminal() {
            Err(PortLinkError::Transport(format!(
                "{} is {}",
                self.shared.id,
                self.shared.state()
            )))
        } else {
            Ok(())
        }
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        self.shared.transition(LinkState::Closed);
    }
}

impl PeerLink for LoopbackLink {
    fn id(&self) -> LinkId {
        self.shared.id
    }

    fn state(&self) -> LinkState {
        self.shared.state()
    }

    fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state_tx.subscribe()
    }

    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription>> {
        let result = self.ensure_open().map(|_| self.description(SdpKind::Offer));
        futures::future::ready(result).boxed()
    }

    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription>> {
        let result = self.ensure_open().and_then(|_| {
            if self.shared.has_remote.load(Ordering::SeqCst) {
                Ok(self.description(SdpKind::Answer))
            } else {
                Err(PortLinkError::Negotiation(
                    "cannot answer without a remote offer".to_string(),
                ))
            }
        });
        futures::future::ready(result).boxed()
    }

    fn set_local_description(&self, _desc: SessionDescription) -> BoxFuture<'_, Result<()>> {
        let result = self.ensure_open().map(|_| {
            let first = !self.shared.has_local.swap(true, Ordering::SeqCst);
            self.shared.transition(LinkState::Connecting);
            if first {
                self.shared.emit_local_candidate();
            }
            self.shared.maybe_connect();
        });
        futures::future::ready(result).boxed()
    }

    fn set_remote_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<()>> {
        let result = self.ensure_open().and_then(|_| {
            let peer_id = Self::parse_description(&desc)?;
            let network = self
                .shared
                .network
                .upgrade()
                .ok_or_else(|| PortLinkError::Negotiation("network is gone".to_string()))?;
            let peer = network.lookup(peer_id).ok_or_else(|| {
                PortLinkError::Negotiation(format!("no loopback link with id {}", peer_id))
            })?;

            *lock(&self.shared.peer) = Some(Arc::downgrade(&peer));
            self.shared.has_remote.store(true, Ordering::SeqCst);
            self.shared.transition(LinkState::Connecting);
            self.shared.maybe_connect();
            Ok(())
        });
        futures::future::ready(result).boxed()
    }

    fn add_candidate(&self, candidate: CandidateInit) -> BoxFuture<'_, Result<()>> {
        lock(&self.shared.received_candidates).push(candidate);
        futures::future::ready(Ok(())).boxed()
    }

    fn take_local_candidates(&self) -> Option<mpsc::Receiver<CandidateInit>> {
        lock(&self.shared.candidates_rx).take()
    }

    fn take_incoming_streams(&self) -> Option<mpsc::Receiver<BoxedVirtualStream>> {
        lock(&self.shared.incoming_rx).take()
    }

    fn create_stream(&self, label: &str) -> BoxFuture<'_, Result<BoxedVirtualStream>> {
        let result = self.ensure_open().map(|_| {
            let (local_io, remote_io) = tokio::io::duplex(PIPE_CAPACITY);
            let local = LoopbackStream::new(label, local_io);
            let twin = LoopbackStream::new(label, remote_io);
            let pending = PendingStream {
                state_tx: local.state_tx.clone(),
                twin,
            };

            let stall = self
                .shared
                .network
                .upgrade()
                .map(|n| n.stall_streams.load(Ordering::SeqCst))
                .unwrap_or(false);

            if stall {
                lock(&self.shared.stalled).push(pending);
            } else if self.shared.state() == LinkState::Connected {
                if let Some(peer) = self.shared.peer() {
                    pending.state_tx.send_replace(StreamState::Open);
                    pending.twin.state_tx.send_replace(StreamState::Open);
                    let _ = peer.incoming_tx.try_send(Box::new(pending.twin));
                }
            } else {
                lock(&self.shared.pending).push(pending);
            }

            Box::new(local) as BoxedVirtualStream
        });
        futures::future::ready(result).boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        self.shared.transition(LinkState::Closed);
        if let Some(peer) = self.shared.peer() {
            peer.transition(LinkState::Closed);
        }
        futures::future::ready(Ok(())).boxed()
    }
}

/// A loopback virtual stream
pub struct LoopbackStream {
    label: String,
    state_tx: Arc<watch::Sender<StreamState>>,
    io: Mutex<Option<DuplexStream>>,
}

impl LoopbackStream {
    fn new(label: &str, io: DuplexStream) -> Self {
        let (state_tx, _) = watch::channel(StreamState::Connecting);
        Self {
            label: label.to_string(),
            state_tx: Arc::new(state_tx),
            io: Mutex::new(Some(io)),
        }
    }
}

impl VirtualStream for LoopbackStream {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> StreamState {
        *self.state_tx.borrow()
    }

    fn opened(&self) -> BoxFuture<'_, StreamState> {
        let mut rx = self.state_tx.subscribe();
        async move {
            loop {
                let state = *rx.borrow_and_update();
                if state != StreamState::Connecting {
                    return state;
                }
                if rx.changed().await.is_err() {
                    return StreamState::Closed;
                }
            }
        }
        .boxed()
    }

    fn detach(self: Box<Self>) -> BoxFuture<'static, Result<BoxedDuplex>> {
        let result = if self.ready_state() == StreamState::Open {
            lock(&self.io)
                .take()
                .map(|io| Box::new(io) as BoxedDuplex)
                .ok_or_else(|| PortLinkError::StreamClosed(self.label.clone()))
        } else {
            Err(PortLinkError::StreamClosed(self.label.clone()))
        };
        futures::future::ready(result).boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.state_tx.send_replace(StreamState::Closed);
        lock(&self.io).take();
        futures::future::ready(()).boxed()
    }
}
