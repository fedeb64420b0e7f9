//! Server Stream Router
//!
//! Maps the labels of incoming virtual streams to backend services on the
//! loopback interface. The table is fixed at startup; anything not in it is
//! refused without dialing.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use pl_core::config::{BACKEND_DIAL_TIMEOUT, STREAM_OPEN_TIMEOUT};
use pl_core::proxy::{ProxyStats, pump};
use pl_core::{
    ArcPeerLink, BoxedVirtualStream, KEEPALIVE_LABEL, PortLinkError, PortPair, Result, StreamState,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where a stream with a given label goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The client's negotiation placeholder; left alone
    Keepalive,
    /// A mapped backend service
    Backend(SocketAddr),
    /// Not in the table
    Unauthorized,
}

/// Immutable label -> backend port table
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, u16>,
}

impl RouteTable {
    /// Builds the table from server-role pairs (`src` = backend port,
    /// `dest` = label) and logs each rule.
    pub fn from_pairs(pairs: &[PortPair]) -> Result<Self> {
        let mut routes = HashMap::with_capacity(pairs.len());

        for pair in pairs {
            let port = pair.src_port()?;
            if pair.is_remapped() {
                info!(
                    "Mapping rule: Virtual port {} -> Local service {}",
                    pair.dest, pair.src
                );
            } else {
                info!("Allowed port: {}", pair.src);
            }
            routes.insert(pair.dest.clone(), port);
        }

        Ok(Self { routes })
    }

    pub fn route(&self, label: &str) -> Route {
        if label == KEEPALIVE_LABEL {
            return Route::Keepalive;
        }
        match self.routes.get(label) {
            Some(&port) => Route::Backend(SocketAddr::from((Ipv4Addr::LOCALHOST, port))),
            None => Route::Unauthorized,
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Routes the incoming streams of server-side links
#[derive(Clone)]
pub struct ServerRouter {
    table: Arc<RouteTable>,
    stats: Arc<ProxyStats>,
    dial_timeout: Duration,
    open_timeout: Duration,
    proxy_protocol: bool,
}

impl ServerRouter {
    pub fn new(table: Arc<RouteTable>, stats: Arc<ProxyStats>) -> Self {
        Self {
            table,
            stats,
            dial_timeout: BACKEND_DIAL_TIMEOUT,
            open_timeout: STREAM_OPEN_TIMEOUT,
            proxy_protocol: false,
        }
    }

    /// Builder pattern: announce the signaling peer's address to each
    /// backend with a PROXY protocol header
    pub fn with_proxy_protocol(mut self, enabled: bool) -> Self {
        self.proxy_protocol = enabled;
        self
    }

    #[cfg(test)]
    fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    /// Serves every stream the peer opens on `link`, each in its own task.
    /// `peer` is the address the link was negotiated from.
    /// Returns `None` if the link's incoming streams were already taken.
    pub fn spawn_for(&self, link: &ArcPeerLink, peer: IpAddr) -> Option<JoinHandle<()>> {
        let mut incoming = link.take_incoming_streams()?;
        let router = self.clone();
        let link_id = link.id();

        Some(tokio::spawn(async move {
            while let Some(stream) = incoming.recv().await {
                let router = router.clone();
                tokio::spawn(async move {
                    let label = stream.label().to_string();
                    if let Err(e) = router.handle_stream(stream, peer).await {
                        warn!("Stream '{}' on {}: {}", label, link_id, e);
                    }
                });
            }
            debug!("{} has no more incoming streams", link_id);
        }))
    }

    async fn handle_stream(&self, stream: BoxedVirtualStream, peer: IpAddr) -> Result<()> {
        let label = stream.label().to_string();

        let backend = match self.table.route(&label) {
            Route::Keepalive => return Ok(()),
            Route::Unauthorized => {
                stream.close().await;
                return Err(PortLinkError::UnknownLabel(label));
            }
            Route::Backend(addr) => addr,
        };

        match tokio::time::timeout(self.open_timeout, stream.opened()).await {
            Ok(StreamState::Open) => {}
            Ok(_) => return Err(PortLinkError::StreamClosed(label)),
            Err(_) => {
                stream.close().await;
                return Err(PortLinkError::StreamOpenTimeout(label));
            }
        }
        info!("Tunnel opened: port {} -> {}", label, backend);

        let mut tunnel = stream.detach().await?;
        let socket = match self.dial(backend, peer).await {
            Ok(socket) => socket,
            Err(e) => {
                let _ = tunnel.shutdown().await;
                return Err(e);
            }
        };

        let _session = self.stats.track();
        let summary = pump(tunnel, socket, &self.stats).await;
        debug!(
            "Tunnel on port {} closed: {} bytes to client, {} bytes to {}",
            label, summary.to_tunnel, summary.from_tunnel, backend
        );
        Ok(())
    }

    /// Connects to the backend and, when enabled, writes the PROXY header
    /// before any tunneled byte.
    async fn dial(&self, addr: SocketAddr, peer: IpAddr) -> Result<TcpStream> {
        let mut socket =
            match tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(socket)) => socket,
                Ok(Err(e)) => {
                    return Err(PortLinkError::DialFailed {
                        addr,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    return Err(PortLinkError::DialFailed {
                        addr,
                        reason: format!("timed out after {:?}", self.dial_timeout),
                    });
                }
            };

        if self.proxy_protocol {
            socket
                .write_all(proxy_header(peer).as_bytes())
                .await
                .map_err(|e| PortLinkError::DialFailed {
                    addr,
                    reason: format!("writing PROXY header: {}", e),
                })?;
        }
        Ok(socket)
    }
}

/// PROXY protocol v1 line naming `peer` as the source. Backends only see
/// loopback connections, so the destination is fixed.
fn proxy_header(peer: IpAddr) -> String {
    match peer.to_canonical() {
        IpAddr::V4(ip) => format!("PROXY TCP4 {} 127.0.0.1 1024 1024\r\n", ip),
        IpAddr::V6(ip) => format!("PROXY TCP6 {} ::1 1024 1024\r\n", ip),
    }
}
