//! PortLink Core Library
//!
//! This crate provides the tunnel orchestration layer of PortLink.
//! It includes:
//! - Port specification parsing and validation
//! - The peer link contract, backed by WebRTC data channels
//! - The signaling relay that negotiates a link over a message connection
//! - Byte pumping between TCP sockets and virtual streams
//! - The client's listener pool and shared link cell

pub mod brand;
pub mod config;
pub mod error;
pub mod link;
pub mod ports;
pub mod protocol;
pub mod proxy;
pub mod signaling;

pub use config::LinkConfig;
pub use error::{PortLinkError, Result};
pub use link::{
    ActiveLinkRef, ArcPeerLink, BoxedVirtualStream, LinkFactory, LinkId, LinkState, PeerLink,
    RtcLinkFactory, StreamState, VirtualStream,
};
pub use ports::{PortPair, parse_ports};
pub use protocol::{CandidateInit, KEEPALIVE_LABEL, SignalKind, SignalMessage};
pub use proxy::{ListenerPool, ProxyStats, pump};
pub use signaling::SignalingRelay;
