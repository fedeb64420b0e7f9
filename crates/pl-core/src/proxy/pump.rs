//! Byte Pump
//!
//! Bridges a detached virtual stream and a TCP socket. Each direction is its
//! own copy loop; whichever finishes first ends the session and both ends
//! are shut down.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::stats::ProxyStats;

/// Read buffer size per direction
const BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved by one finished session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpSummary {
    pub to_tunnel: u64,
    pub from_tunnel: u64,
}

/// Copies bytes both ways between `tunnel` and `local` until either side
/// closes or errors, then shuts both down.
pub async fn pump<T, L>(tunnel: T, local: L, stats: &ProxyStats) -> PumpSummary
where
    T: AsyncRead + AsyncWrite + Unpin,
    L: AsyncRead + AsyncWrite + Unpin,
{
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);
    let (mut local_read, mut local_write) = tokio::io::split(local);

    let to_tunnel = AtomicU64::new(0);
    let from_tunnel = AtomicU64::new(0);

    {
        let outbound = copy_counted(&mut local_read, &mut tunnel_write, |n| {
            to_tunnel.fetch_add(n, Ordering::Relaxed);
            stats.record_sent(n);
        });
        let inbound = copy_counted(&mut tunnel_read, &mut local_write, |n| {
            from_tunnel.fetch_add(n, Ordering::Relaxed);
            stats.record_received(n);
        });

        tokio::select! {
            result = outbound => {
                if let Err(e) = result {
                    debug!("Local->tunnel copy ended: {}", e);
                }
            }
            result = inbound => {
                if let Err(e) = result {
                    debug!("Tunnel->local copy ended: {}", e);
                }
            }
        }
    }

    let _ = tunnel_write.shutdown().await;
    let _ = local_write.shutdown().await;

    PumpSummary {
        to_tunnel: to_tunnel.into_inner(),
        from_tunnel: from_tunnel.into_inner(),
    }
}

async fn copy_counted<R, W, F>(reader: &mut R, writer: &mut W, on_bytes: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = BytesMut::with_capacity(BUFFER_SIZE);
    loop {
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf).await?;
        writer.flush().await?;
        buf.clear();
        on_bytes(n as u64);
    }
}
