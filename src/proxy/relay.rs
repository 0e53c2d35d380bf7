//! Bidirectional byte relay.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::observability::metrics;
use crate::resilience::timeouts::{is_benign_disconnect, with_deadline};

const BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Copy both directions concurrently until both have finished or `limit`
/// has elapsed.
///
/// Each read and each write must complete within `idle`. When one source
/// ends, the opposite write half is shut down so the peer sees EOF while the
/// other direction keeps flowing. Once `limit` passes both sides are dropped,
/// which closes them, even if bytes are still trickling in.
pub async fn relay<C, U>(client: C, upstream: U, idle: Duration, limit: Duration) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let mut stats = RelayStats::default();

    let finished = tokio::time::timeout(limit, async {
        tokio::join!(
            pump(
                &mut client_read,
                &mut upstream_write,
                idle,
                "client_to_upstream",
                &mut stats.client_to_upstream,
            ),
            pump(
                &mut upstream_read,
                &mut client_write,
                idle,
                "upstream_to_client",
                &mut stats.upstream_to_client,
            ),
        )
    })
    .await;
    if finished.is_err() {
        tracing::info!(limit_secs = limit.as_secs(), "Forwarding limit reached, closing connection");
    }

    for (direction, bytes) in [
        ("client_to_upstream", stats.client_to_upstream),
        ("upstream_to_client", stats.upstream_to_client),
    ] {
        if bytes > 0 {
            metrics::record_forwarded_bytes(direction, bytes);
            tracing::debug!(direction, bytes, "Forwarded");
        }
    }
    stats
}

/// Copy `src` into `dst`, adding to `total` as each write lands.
async fn pump<R, W>(
    src: &mut R,
    dst: &mut W,
    idle: Duration,
    direction: &'static str,
    total: &mut u64,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];

    let result: io::Result<()> = async {
        loop {
            let n = with_deadline(idle, "relay read", src.read(&mut buf)).await?;
            if n == 0 {
                return Ok(());
            }
            with_deadline(idle, "relay write", dst.write_all(&buf[..n])).await?;
            *total += n as u64;
        }
    }
    .await;

    match result {
        Ok(()) => {}
        Err(e) if is_benign_disconnect(&e) => {
            tracing::debug!(direction, error = %e, "Relay direction ended");
        }
        Err(e) => {
            tracing::warn!(direction, error = %e, "Relay direction failed");
        }
    }

    let _ = with_deadline(idle, "relay shutdown", dst.shutdown()).await;
}
