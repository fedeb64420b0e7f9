//! Client Connector
//!
//! Keeps one peer link to the server alive. Each attempt dials the
//! signaling endpoint, creates a fresh link, offers it and relays signaling
//! until the socket or the link dies. Attempts repeat forever with a fixed
//! back-off.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pl_core::config::RECONNECT_BACKOFF;
use pl_core::link::wait_terminal;
use pl_core::protocol::TOKEN_QUERY_PARAM;
use pl_core::{
    ActiveLinkRef, ArcPeerLink, KEEPALIVE_LABEL, LinkFactory, LinkState, PortLinkError,
    Result, SignalMessage, SignalingRelay,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use crate::ws;

/// Reconnecting client side of the tunnel
pub struct ClientConnector {
    url: Url,
    factory: Arc<dyn LinkFactory>,
    active: Arc<ActiveLinkRef>,
    backoff: Duration,
}

impl ClientConnector {
    /// `signaling_url` must be a `ws://` or `wss://` URL. The token is added
    /// as a query parameter, keeping any already present.
    pub fn new(
        signaling_url: &str,
        token: &str,
        factory: Arc<dyn LinkFactory>,
        active: Arc<ActiveLinkRef>,
    ) -> Result<Self> {
        let mut url = Url::parse(signaling_url).map_err(|e| {
            PortLinkError::ConfigError(format!("invalid signaling url '{}': {}", signaling_url, e))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(PortLinkError::ConfigError(format!(
                "signaling url must use ws:// or wss://, got '{}'",
                signaling_url
            )));
        }
        url.query_pairs_mut().append_pair(TOKEN_QUERY_PARAM, token);

        Ok(Self {
            url,
            factory,
            active,
            backoff: RECONNECT_BACKOFF,
        })
    }

    /// Builder pattern: set the delay between attempts
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Full dial URL, token included
    pub fn signaling_url(&self) -> &Url {
        &self.url
    }

    /// The URL without its query, safe to log
    fn display_url(&self) -> String {
        let mut url = self.url.clone();
        url.set_query(None);
        url.to_string()
    }

    /// Runs attempts back to back until the task is dropped.
    pub async fn run(self) {
        loop {
            match self.attempt().await {
                Ok(()) => info!(
                    "Connection to {} ended, reconnecting in {:?}",
                    self.display_url(),
                    self.backoff
                ),
                Err(e) => warn!("Connection attempt failed: {}, retrying in {:?}", e, self.backoff),
            }
            tokio::time::sleep(self.backoff).await;
        }
    }

    /// One connection attempt. Always leaves the shared cell free of the
    /// attempt's link and closes the link.
    pub async fn attempt(&self) -> Result<()> {
        info!("Connecting to {}", self.display_url());
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| PortLinkError::Signaling(e.to_string()))?;

        let link = self.factory.create().await?;
        let watcher = tokio::spawn(publish_state(link.clone(), self.active.clone()));

        let result = self.negotiate(&link, socket).await;

        watcher.abort();
        self.active.clear_if(link.id());
        if let Err(e) = link.close().await {
            debug!("Closing {}: {}", link.id(), e);
        }
        result
    }

    async fn negotiate(
        &self,
        link: &ArcPeerLink,
        socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> Result<()> {
        let (tx, rx) = socket.split();
        let mut outgoing = ws::tungstenite_outgoing(tx);
        let incoming = ws::tungstenite_incoming(rx);

        // forces the offer to carry a data channel section
        let _keepalive = link.create_stream(KEEPALIVE_LABEL).await?;

        let offer = link.create_offer().await?;
        link.set_local_description(offer.clone()).await?;
        outgoing.send(SignalMessage::from(offer)).await?;

        let relay = SignalingRelay::new(link.clone()).run(incoming, outgoing);
        tokio::select! {
            result = relay => result,
            state = wait_terminal(link.subscribe_state()) => {
                warn!("{} {}, abandoning attempt", link.id(), state);
                Ok(())
            }
        }
    }
}

/// Mirrors the link's state transitions into the shared cell.
async fn publish_state(link: ArcPeerLink, active: Arc<ActiveLinkRef>) {
    let mut states = link.subscribe_state();
    loop {
        let state = *states.borrow_and_update();
        active.observe(&link, state);
        match state {
            LinkState::Connected => info!("Link established ({})", link.id()),
            LinkState::Idle => {}
            other => debug!("{} is {}", link.id(), other),
        }
        if state.is_terminal() {
            return;
        }
        if states.changed().await.is_err() {
            active.observe(&link, LinkState::Closed);
            return;
        }
    }
}
