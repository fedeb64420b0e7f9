//! PortLink Daemon
//!
//! The two long-running roles: the server, which accepts signaling sessions
//! and routes incoming streams to local services, and the client, which keeps
//! a link to the server alive for its listener pool.

pub mod client;
pub mod router;
pub mod server;
pub mod ws;

pub use client::ClientConnector;
pub use router::{Route, RouteTable, ServerRouter};
pub use server::SignalServer;
