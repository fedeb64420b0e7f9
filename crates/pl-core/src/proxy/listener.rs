//! Client Listener Pool
//!
//! One persistent TCP listener per mapped local port. Every accepted
//! connection gets its own task that waits for a connected link, opens a
//! virtual stream labeled with the remote port and pumps bytes through it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::pump::pump;
use super::stats::ProxyStats;
use crate::config::{LINK_READY_TIMEOUT, STREAM_OPEN_TIMEOUT};
use crate::error::{PortLinkError, Result};
use crate::link::{ActiveLinkRef, StreamState};
use crate::ports::PortPair;

/// Back-off after a failed accept, so a full descriptor table does not spin
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Waits applied to each forwarded connection
#[derive(Debug, Clone, Copy)]
pub(crate) struct ForwardTimeouts {
    pub link_ready: Duration,
    pub stream_open: Duration,
}

impl Default for ForwardTimeouts {
    fn default() -> Self {
        Self {
            link_ready: LINK_READY_TIMEOUT,
            stream_open: STREAM_OPEN_TIMEOUT,
        }
    }
}

/// State shared by all forwarding tasks
struct ForwardContext {
    active: Arc<ActiveLinkRef>,
    stats: Arc<ProxyStats>,
    timeouts: ForwardTimeouts,
}

/// A bound listener and the remote label its connections are sent to
struct BoundListener {
    label: String,
    listener: TcpListener,
}

/// The set of local listeners of the client role
pub struct ListenerPool {
    listeners: Vec<BoundListener>,
    active: Arc<ActiveLinkRef>,
    stats: Arc<ProxyStats>,
    timeouts: ForwardTimeouts,
}

impl ListenerPool {
    /// Binds one listener per pair on `bind_ip:dest`. Any bind failure is
    /// returned, leaving nothing bound.
    pub async fn bind(
        bind_ip: IpAddr,
        pairs: &[PortPair],
        active: Arc<ActiveLinkRef>,
        stats: Arc<ProxyStats>,
    ) -> Result<Self> {
        let mut listeners = Vec::with_capacity(pairs.len());

        for pair in pairs {
            let addr = SocketAddr::new(bind_ip, pair.dest_port()?);
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| PortLinkError::ListenBind {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })?;

            info!(
                "Listening on {} -> remote port {}",
                listener.local_addr()?,
                pair.src
            );

            listeners.push(BoundListener {
                label: pair.src.clone(),
                listener,
            });
        }

        Ok(Self {
            listeners,
            active,
            stats,
            timeouts: ForwardTimeouts::default(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_timeouts(mut self, timeouts: ForwardTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Addresses actually bound, in pair order
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|bound| bound.listener.local_addr().ok())
            .collect()
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    /// Starts one accept loop per listener.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let ctx = Arc::new(ForwardContext {
            active: self.active,
            stats: self.stats,
            timeouts: self.timeouts,
        });

        self.listeners
            .into_iter()
            .map(|bound| tokio::spawn(accept_loop(bound, ctx.clone())))
            .collect()
    }

    /// Runs every accept loop until the process exits.
    pub async fn run(self) {
        for handle in self.spawn() {
            if let Err(e) = handle.await {
                error!("Listener task ended abnormally: {}", e);
            }
        }
    }
}

async fn accept_loop(bound: BoundListener, ctx: Arc<ForwardContext>) {
    loop {
        match bound.listener.accept().await {
            Ok((socket, peer)) => {
                debug!("Accepted {} for remote port {}", peer, bound.label);
                let ctx = ctx.clone();
                let label = bound.label.clone();
                tokio::spawn(async move {
                    if let Err(e) = forward_connection(socket, &label, &ctx).await {
                        warn!("Connection from {} to remote port {} closed: {}", peer, label, e);
                    }
                });
            }
            Err(e) => {
                error!("Accept error on remote port {}: {}", bound.label, e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Carries one accepted connection through the active link. The socket is
/// dropped, and so closed, on every early return.
async fn forward_connection(socket: TcpStream, label: &str, ctx: &ForwardContext) -> Result<()> {
    let _session = ctx.stats.track();

    let link = ctx.active.wait_connected(ctx.timeouts.link_ready).await?;
    let stream = link.create_stream(label).await?;

    let state = match tokio::time::timeout(ctx.timeouts.stream_open, stream.opened()).await {
        Ok(state) => state,
        Err(_) => {
            stream.close().await;
            return Err(PortLinkError::StreamOpenTimeout(label.to_string()));
        }
    };
    if state != StreamState::Open {
        return Err(PortLinkError::StreamClosed(label.to_string()));
    }

    let tunnel = stream.detach().await?;
    let summary = pump(tunnel, socket, &ctx.stats).await;
    debug!(
        "Session on remote port {} finished: {} bytes out, {} bytes in",
        label, summary.to_tunnel, summary.from_tunnel
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::loopback::LoopbackNetwork;
    use crate::link::{ArcPeerLink, LinkFactory, LinkState};
    use std::net::Ipv4Addr;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn short() -> ForwardTimeouts {
        ForwardTimeouts {
            link_ready: Duration::from_millis(400),
            stream_open: Duration::from_millis(400),
        }
    }

    async fn connected_pair(network: &LoopbackNetwork) -> (ArcPeerLink, ArcPeerLink) {
        let client = network.create().await.unwrap();
        let server = network.create().await.unwrap();
        network.negotiate(&client, &server).await.unwrap();
        (client, server)
    }

    /// Echoes every incoming stream on `server`, recording labels seen
    fn spawn_echo(server: &ArcPeerLink) -> tokio::sync::mpsc::UnboundedReceiver<String> {
        let mut incoming = server.take_incoming_streams().unwrap();
        let (seen_tx, seen_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(stream) = incoming.recv().await {
                let _ = seen_tx.send(stream.label().to_string());
                tokio::spawn(async move {
                    let io = stream.detach().await.unwrap();
                    let (mut r, mut w) = tokio::io::split(io);
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        seen_rx
    }

    async fn expect_closed(mut socket: TcpStream) {
        let mut buf = [0u8; 16];
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("expected closed connection, read {} bytes", n),
        }
    }

    #[tokio::test]
    async fn test_forwards_through_active_link() {
        let network = LoopbackNetwork::new();
        let (client, server) = connected_pair(&network).await;
        let mut labels = spawn_echo(&server);

        let active = Arc::new(ActiveLinkRef::new());
        active.observe(&client, LinkState::Connected);

        let pool = ListenerPool::bind(
            LOCALHOST,
            &[PortPair::new("25565", "0")],
            active,
            ProxyStats::new(),
        )
        .await
        .unwrap();
        let addr = pool.local_addrs()[0];
        let stats = pool.stats();
        pool.spawn();

        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(b"hello through the tunnel").await.unwrap();
        let mut echoed = [0u8; 24];
        socket.read_exact(&mut echoed).await.unwrap();

        assert_eq!(&echoed, b"hello through the tunnel");
        assert_eq!(labels.recv().await.unwrap(), "25565");
        assert_eq!(stats.get_total_connections(), 1);
    }

    #[tokio::test]
    async fn test_no_link_closes_after_wait_window() {
        let active = Arc::new(ActiveLinkRef::new());
        let pool = ListenerPool::bind(LOCALHOST, &[PortPair::new("80", "0")], active, ProxyStats::new())
            .await
            .unwrap()
            .with_timeouts(short());
        let addr = pool.local_addrs()[0];
        pool.spawn();

        let started = Instant::now();
        let socket = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), expect_closed(socket))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_stalled_stream_closes_after_guard() {
        let network = LoopbackNetwork::new();
        let (client, _server) = connected_pair(&network).await;
        network.set_stall_streams(true);

        let active = Arc::new(ActiveLinkRef::new());
        active.observe(&client, LinkState::Connected);

        let pool = ListenerPool::bind(LOCALHOST, &[PortPair::new("80", "0")], active, ProxyStats::new())
            .await
            .unwrap()
            .with_timeouts(short());
        let addr = pool.local_addrs()[0];
        pool.spawn();

        let socket = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), expect_closed(socket))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_link_failure_before_open_closes_connection() {
        let network = LoopbackNetwork::new();
        let (client, _server) = connected_pair(&network).await;
        network.set_stall_streams(true);

        let active = Arc::new(ActiveLinkRef::new());
        active.observe(&client, LinkState::Connected);

        let pool = ListenerPool::bind(
            LOCALHOST,
            &[PortPair::new("80", "0")],
            active,
            ProxyStats::new(),
        )
        .await
        .unwrap();
        let addr = pool.local_addrs()[0];
        pool.spawn();

        let socket = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        network.fail(&client);

        // stalled streams are released as closed when the link dies, well
        // before the default guard would fire
        tokio::time::timeout(Duration::from_secs(5), expect_closed(socket))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port().to_string();

        let result = ListenerPool::bind(
            LOCALHOST,
            &[PortPair::new("80", port)],
            Arc::new(ActiveLinkRef::new()),
            ProxyStats::new(),
        )
        .await;

        let err = result.err().unwrap();
        assert!(matches!(err, PortLinkError::ListenBind { .. }));
        assert!(err.is_fatal());
    }
}
