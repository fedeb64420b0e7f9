//! Signaling Server
//!
//! HTTP endpoint the client dials to negotiate a link. The bearer token is
//! checked on the upgrade request; each accepted socket gets its own peer
//! link whose incoming streams go to the [`ServerRouter`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        ConnectInfo, Query, State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::StreamExt;
use pl_core::protocol::SIGNALING_PATH;
use pl_core::proxy::ProxyStats;
use pl_core::{LinkFactory, PortLinkError, Result, SignalingRelay};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::router::{RouteTable, ServerRouter};
use crate::ws;

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Clone)]
struct AppState {
    token: Arc<str>,
    router: ServerRouter,
    factory: Arc<dyn LinkFactory>,
}

/// The bound signaling endpoint of the server role
pub struct SignalServer {
    listener: TcpListener,
    state: AppState,
}

impl SignalServer {
    /// Binds `addr`. A bare `:port` listens on all interfaces.
    pub async fn bind(
        addr: &str,
        token: impl Into<String>,
        table: Arc<RouteTable>,
        factory: Arc<dyn LinkFactory>,
    ) -> Result<Self> {
        let addr = normalize_listen_addr(addr);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| PortLinkError::ListenBind {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        let token: String = token.into();
        Ok(Self {
            listener,
            state: AppState {
                token: Arc::from(token),
                router: ServerRouter::new(table, ProxyStats::new()),
                factory,
            },
        })
    }

    /// Builder pattern: prefix each backend connection with a PROXY header
    /// naming the signaling peer
    pub fn with_proxy_protocol(mut self, enabled: bool) -> Self {
        self.state.router = self.state.router.with_proxy_protocol(enabled);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        self.state.router.stats()
    }

    /// Serves signaling sessions until the listener fails.
    pub async fn run(self) -> Result<()> {
        info!(
            "Signaling server listening on {}{}",
            self.listener.local_addr()?,
            SIGNALING_PATH
        );

        let app = Router::new()
            .route(SIGNALING_PATH, get(signal_handler))
            .with_state(self.state);

        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }
}

fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

async fn signal_handler(
    ws: Option<WebSocketUpgrade>,
    Query(query): Query<TokenQuery>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    if query.token.as_deref() != Some(&*state.token) {
        warn!("Invalid token attempt from {}", remote);
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    match ws {
        Some(ws) => ws
            .on_upgrade(move |socket| run_session(socket, remote, state))
            .into_response(),
        None => (StatusCode::BAD_REQUEST, "Expected a WebSocket upgrade").into_response(),
    }
}

async fn run_session(socket: WebSocket, remote: SocketAddr, state: AppState) {
    info!("Signaling session opened from {}", remote);

    let link = match state.factory.create().await {
        Ok(link) => link,
        Err(e) => {
            warn!("Cannot create link for {}: {}", remote, e);
            return;
        }
    };
    let streams = state.router.spawn_for(&link, remote.ip());

    let (tx, rx) = socket.split();
    let relay = SignalingRelay::new(link.clone());
    if let Err(e) = relay
        .run(ws::axum_incoming(rx), ws::axum_outgoing(tx))
        .await
    {
        debug!("Signaling session from {} failed: {}", remote, e);
    }

    if let Some(streams) = streams {
        streams.abort();
    }
    if let Err(e) = link.close().await {
        debug!("Closing {}: {}", link.id(), e);
    }
    info!("Signaling session from {} closed", remote);
}
