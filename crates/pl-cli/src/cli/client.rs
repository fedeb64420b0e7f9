//! Client Role

use anyhow::Result;
use pl_core::brand::PRODUCT_NAME;
use pl_core::{ActiveLinkRef, LinkConfig, ListenerPool, PortPair, ProxyStats, RtcLinkFactory};
use pl_daemon::ClientConnector;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

/// Bind the local listeners and keep a link to the server until interrupted
pub async fn run(
    url: String,
    token: String,
    pairs: Vec<PortPair>,
    bind_ip: IpAddr,
    config: LinkConfig,
) -> Result<()> {
    info!("{} client starting", PRODUCT_NAME);

    let active = Arc::new(ActiveLinkRef::new());
    let factory = Arc::new(RtcLinkFactory::new(config)?);
    let connector = ClientConnector::new(&url, &token, factory, active.clone())?;

    // a port that cannot be bound is fatal before any connection attempt
    let pool = ListenerPool::bind(bind_ip, &pairs, active, ProxyStats::new()).await?;
    let stats = pool.stats();

    tokio::select! {
        _ = connector.run() => {}
        _ = pool.run() => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    info!(
        "Forwarded {} connections ({} bytes out, {} bytes in)",
        stats.get_total_connections(),
        stats.get_bytes_sent(),
        stats.get_bytes_received()
    );
    Ok(())
}
