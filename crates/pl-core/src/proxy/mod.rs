//! TCP Proxy Module for PortLink
//!
//! Byte pumping between TCP sockets and virtual streams, plus the client's
//! listener pool.

pub mod listener;
pub mod pump;
pub mod stats;

pub use listener::ListenerPool;
pub use pump::{PumpSummary, pump};
pub use stats::{ConnectionGuard, ProxyStats};
