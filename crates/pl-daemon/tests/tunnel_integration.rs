//! Integration tests for the full tunnel
//!
//! Both roles run in-process over a loopback link network:
//! TCP client -> ListenerPool -> client link -> server link -> ServerRouter -> backend

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pl_core::link::loopback::LoopbackNetwork;
use pl_core::{ActiveLinkRef, ArcPeerLink, ListenerPool, PortPair, ProxyStats};
use pl_daemon::{ClientConnector, RouteTable, SignalServer};
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TOKEN: &str = "integration-token";
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Echo backend that counts accepted connections
async fn start_echo_backend() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut r, mut w) = socket.into_split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });

    (addr, accepted)
}

struct Server {
    addr: SocketAddr,
    stats: Arc<ProxyStats>,
}

async fn start_server(network: &LoopbackNetwork, pairs: &[PortPair]) -> Server {
    start_server_with(network, pairs, false).await
}

async fn start_server_with(
    network: &LoopbackNetwork,
    pairs: &[PortPair],
    proxy_protocol: bool,
) -> Server {
    let table = Arc::new(RouteTable::from_pairs(pairs).unwrap());
    let server = SignalServer::bind("127.0.0.1:0", TOKEN, table, Arc::new(network.clone()))
        .await
        .unwrap()
        .with_proxy_protocol(proxy_protocol);
    let addr = server.local_addr().unwrap();
    let stats = server.stats();
    tokio::spawn(server.run());
    Server { addr, stats }
}

struct Client {
    active: Arc<ActiveLinkRef>,
    listen: Vec<SocketAddr>,
}

async fn start_client(network: &LoopbackNetwork, server: SocketAddr, labels: &[&str]) -> Client {
    let active = Arc::new(ActiveLinkRef::new());
    let pairs: Vec<PortPair> = labels.iter().map(|l| PortPair::new(*l, "0")).collect();

    let pool = ListenerPool::bind(LOCALHOST, &pairs, active.clone(), ProxyStats::new())
        .await
        .unwrap();
    let listen = pool.local_addrs();
    pool.spawn();

    let connector = ClientConnector::new(
        &format!("ws://{}/ice", server),
        TOKEN,
        Arc::new(network.clone()),
        active.clone(),
    )
    .unwrap()
    .with_backoff(Duration::from_millis(300));
    tokio::spawn(connector.run());

    Client { active, listen }
}

/// Port nothing listens on
async fn dead_port() -> u16 {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Sends `payload` through `addr` and returns what comes back
async fn echo_through(addr: SocketAddr, payload: &[u8], expect: usize) -> Vec<u8> {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; expect];
    timeout(Duration::from_secs(5), socket.read_exact(&mut echoed))
        .await
        .expect("no echo")
        .unwrap();
    echoed
}

async fn wait_for_link(active: &ActiveLinkRef) -> ArcPeerLink {
    active
        .wait_connected(Duration::from_secs(10))
        .await
        .expect("link never connected")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_to_end_round_trip() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (backend, accepted) = start_echo_backend().await;
    let server = start_server(
        &network,
        &[PortPair::new(backend.port().to_string(), "9000")],
    )
    .await;
    let client = start_client(&network, server.addr, &["9000"]).await;
    wait_for_link(&client.active).await;

    let mut sessions = Vec::new();
    for _ in 0..3 {
        let addr = client.listen[0];
        sessions.push(tokio::spawn(async move {
            let mut payload = vec![0u8; 256 * 1024];
            rand::thread_rng().fill_bytes(&mut payload);

            let socket = TcpStream::connect(addr).await.unwrap();
            let (mut r, mut w) = socket.into_split();
            let expected = payload.clone();
            let writer = tokio::spawn(async move {
                w.write_all(&payload).await.unwrap();
                w
            });

            let mut echoed = vec![0u8; expected.len()];
            r.read_exact(&mut echoed).await.unwrap();
            let _w = writer.await.unwrap();
            assert_eq!(echoed, expected);
        }));
    }

    for session in sessions {
        timeout(Duration::from_secs(20), session)
            .await
            .expect("session timed out")
            .unwrap();
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
    assert_eq!(server.stats.get_total_connections(), 3);
}

#[tokio::test]
async fn test_bad_token_is_rejected_before_upgrade() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let server = start_server(&network, &[PortPair::same("80")]).await;

    for query in ["?token=wrong", ""] {
        let url = format!("ws://{}/ice{}", server.addr, query);
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 401);
            }
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("upgrade accepted with query '{}'", query),
        }
    }
    assert_eq!(network.live_links(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_label_is_refused_without_dial() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (backend, accepted) = start_echo_backend().await;
    let server = start_server(
        &network,
        &[PortPair::new(backend.port().to_string(), "9000")],
    )
    .await;
    let client = start_client(&network, server.addr, &["7777"]).await;
    wait_for_link(&client.active).await;

    let mut socket = TcpStream::connect(client.listen[0]).await.unwrap();
    let _ = socket.write_all(b"anyone there?").await;
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .expect("refused connection was left open");
    assert!(matches!(read, Ok(0) | Err(_)));

    assert_eq!(accepted.load(Ordering::SeqCst), 0);
    assert_eq!(server.stats.get_total_connections(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_keepalive_stream_never_reaches_a_backend() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (backend, accepted) = start_echo_backend().await;
    let server = start_server(&network, &[PortPair::same(backend.port().to_string())]).await;
    let client = start_client(&network, server.addr, &[]).await;

    wait_for_link(&client.active).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(accepted.load(Ordering::SeqCst), 0);
    assert_eq!(server.stats.get_total_connections(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnects_after_link_failure() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let server = start_server(&network, &[PortPair::same("80")]).await;
    let client = start_client(&network, server.addr, &[]).await;

    let first = wait_for_link(&client.active).await;
    network.fail(&first);

    // the cell lets go of the failed link right away
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        client
            .active
            .current()
            .map_or(true, |link| link.id() != first.id())
    );

    let second = wait_for_link(&client.active).await;
    assert_ne!(second.id(), first.id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dead_backend_closes_only_its_session() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (backend, accepted) = start_echo_backend().await;
    let dead = dead_port().await;
    let server = start_server(
        &network,
        &[
            PortPair::new(dead.to_string(), "9000"),
            PortPair::new(backend.port().to_string(), "9001"),
        ],
    )
    .await;
    let client = start_client(&network, server.addr, &["9000", "9001"]).await;
    let link = wait_for_link(&client.active).await;

    let mut refused = TcpStream::connect(client.listen[0]).await.unwrap();
    let _ = refused.write_all(b"x").await;
    let mut buf = [0u8; 8];
    let read = timeout(Duration::from_secs(5), refused.read(&mut buf))
        .await
        .expect("connection to a dead backend was left open");
    assert!(matches!(read, Ok(0) | Err(_)));

    // the link and the other label are unaffected
    assert_eq!(echo_through(client.listen[1], b"still here", 10).await, b"still here");
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(
        client.active.current().map(|current| current.id()),
        Some(link.id())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_header_reaches_backend() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let (backend, _) = start_echo_backend().await;
    let server = start_server_with(
        &network,
        &[PortPair::new(backend.port().to_string(), "9000")],
        true,
    )
    .await;
    let client = start_client(&network, server.addr, &["9000"]).await;
    wait_for_link(&client.active).await;

    // the echo backend sends the header back ahead of the payload
    let header = "PROXY TCP4 127.0.0.1 127.0.0.1 1024 1024\r\n";
    let echoed = echo_through(client.listen[0], b"hello", header.len() + 5).await;
    assert_eq!(String::from_utf8(echoed).unwrap(), format!("{}hello", header));
}
