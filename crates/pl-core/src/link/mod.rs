//! Peer Link Abstraction
//!
//! A peer link is one negotiated, encrypted peer-to-peer session carrying any
//! number of labeled virtual streams. The tunnel layer only talks to links
//! through the traits here; [`rtc`] backs them with WebRTC data channels and
//! `loopback` with in-process pipes.

pub mod active;
#[cfg(any(test, feature = "loopback"))]
pub mod loopback;
pub mod rtc;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use crate::error::Result;
use crate::protocol::{CandidateInit, SessionDescription};

pub use active::ActiveLinkRef;
pub use rtc::RtcLinkFactory;

pub type ArcPeerLink = Arc<dyn PeerLink>;
pub type BoxedVirtualStream = Box<dyn VirtualStream>;
pub type BoxedDuplex = Box<dyn DuplexStream>;

/// Raw byte stream obtained by detaching an open virtual stream
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Process-unique identity of a link instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        LinkId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Connection state of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, negotiation not started
    Idle,
    /// Negotiating, or temporarily disconnected and trying to recover
    Connecting,
    /// Ready to carry streams
    Connected,
    /// Connectivity lost for good
    Failed,
    /// Closed locally or by the peer
    Closed,
}

impl LinkState {
    /// Failed and Closed links never come back
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Ready state of a virtual stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Open,
    Closed,
}

/// A labeled, ordered, reliable sub-connection of a peer link
pub trait VirtualStream: Send + Sync {
    fn label(&self) -> &str;

    fn ready_state(&self) -> StreamState;

    /// Resolves with the first state other than `Connecting`.
    fn opened(&self) -> BoxFuture<'_, StreamState>;

    /// Converts an open stream into a raw byte stream.
    fn detach(self: Box<Self>) -> BoxFuture<'static, Result<BoxedDuplex>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// A negotiated peer-to-peer session
pub trait PeerLink: Send + Sync {
    fn id(&self) -> LinkId;

    fn state(&self) -> LinkState;

    /// Receiver that observes every state transition
    fn subscribe_state(&self) -> watch::Receiver<LinkState>;

    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription>>;

    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription>>;

    fn set_local_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<()>>;

    fn set_remote_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<()>>;

    /// Feeds a candidate received from the peer into address discovery
    fn add_candidate(&self, candidate: CandidateInit) -> BoxFuture<'_, Result<()>>;

    /// Locally discovered candidates, available once per link
    fn take_local_candidates(&self) -> Option<mpsc::Receiver<CandidateInit>>;

    /// Streams opened by the peer, available once per link
    fn take_incoming_streams(&self) -> Option<mpsc::Receiver<BoxedVirtualStream>>;

    fn create_stream(&self, label: &str) -> BoxFuture<'_, Result<BoxedVirtualStream>>;

    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Creates fresh peer links
pub trait LinkFactory: Send + Sync {
    fn create(&self) -> BoxFuture<'_, Result<ArcPeerLink>>;
}

/// Waits until the link reaches a terminal state and returns it.
pub async fn wait_terminal(mut state_rx: watch::Receiver<LinkState>) -> LinkState {
    loop {
        let state = *state_rx.borrow_and_update();
        if state.is_terminal() {
            return state;
        }
        if state_rx.changed().await.is_err() {
            return LinkState::Closed;
        }
    }
}
