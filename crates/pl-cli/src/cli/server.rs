//! Server Role

use anyhow::Result;
use pl_core::brand::PRODUCT_NAME;
use pl_core::{LinkConfig, PortPair, RtcLinkFactory};
use pl_daemon::{RouteTable, SignalServer};
use std::sync::Arc;
use tracing::info;

/// Run the signaling server until interrupted
pub async fn run(listen: String, token: String, pairs: Vec<PortPair>, config: LinkConfig) -> Result<()> {
    info!("{} server starting", PRODUCT_NAME);

    let table = Arc::new(RouteTable::from_pairs(&pairs)?);
    let proxy_protocol = config.proxy_protocol;
    let factory = Arc::new(RtcLinkFactory::new(config)?);
    let server = SignalServer::bind(&listen, token, table, factory)
        .await?
        .with_proxy_protocol(proxy_protocol);
    if proxy_protocol {
        info!("Backends receive a PROXY header with the client address");
    }

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
