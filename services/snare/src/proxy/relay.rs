//! Generic TCP relay.
//!
//! The relay dials the destination named by the matched rule's target and
//! copies bytes in both directions until either side closes or the
//! connection context is cancelled.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::conn::Conn;
use crate::handler::{ConnContext, ConnHandler};

/// Default connect timeout toward relay destinations.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Bytes moved by one relayed connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub to_upstream: u64,
    pub from_upstream: u64,
    /// Leading client bytes, up to the capture limit.
    pub captured: Vec<u8>,
    /// The relay stopped because `cancel` fired.
    pub cancelled: bool,
}

/// Normalize a rule target into a `host:port` destination.
///
/// Accepts `host:port`, a `scheme://host:port` URL, or a bare port, which
/// means the loopback address.
pub fn parse_target(target: &str) -> Option<String> {
    let target = target.trim();
    let target = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target)
        .trim_end_matches('/');

    if target.is_empty() {
        return None;
    }
    if let Ok(port) = target.parse::<u16>() {
        return (port != 0).then(|| format!("127.0.0.1:{port}"));
    }

    let (host, port) = target.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some(target.to_string())
}

/// Open a connection to `addr`, bounded by `connect_timeout`.
pub async fn connect_upstream(addr: &str, connect_timeout: Duration) -> io::Result<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {addr} timed out"),
        )),
    }
}

/// Relay data bidirectionally between `client` and `upstream` until both
/// directions finish or `cancel` fires.
///
/// Up to `capture_limit` leading client bytes are kept in
/// [`RelayStats::captured`]. Counts and captured bytes are returned on every
/// exit, including a failed direction and cancellation.
pub async fn relay_bidirectional<A, B>(
    client: &mut A,
    upstream: &mut B,
    capture_limit: usize,
    cancel: &CancellationToken,
) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let mut to_upstream = 0u64;
    let mut from_upstream = 0u64;
    let mut captured = Vec::new();

    let client_to_upstream = async {
        let mut buf = vec![0u8; 8192];
        loop {
            let n = client_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if captured.len() < capture_limit {
                let take = n.min(capture_limit - captured.len());
                captured.extend_from_slice(&buf[..take]);
            }
            upstream_write.write_all(&buf[..n]).await?;
            to_upstream += n as u64;
        }
        let _ = upstream_write.shutdown().await;
        Ok::<_, io::Error>(())
    };

    let upstream_to_client = async {
        let mut buf = vec![0u8; 8192];
        loop {
            let n = upstream_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            client_write.write_all(&buf[..n]).await?;
            from_upstream += n as u64;
        }
        let _ = client_write.shutdown().await;
        Ok::<_, io::Error>(())
    };

    let cancelled = tokio::select! {
        (up, down) = async { tokio::join!(client_to_upstream, upstream_to_client) } => {
            if let Err(e) = up {
                debug!(error = %e, "Client to upstream copy ended with error");
            }
            if let Err(e) = down {
                debug!(error = %e, "Upstream to client copy ended with error");
            }
            false
        }
        _ = cancel.cancelled() => true,
    };

    RelayStats {
        to_upstream,
        from_upstream,
        captured,
        cancelled,
    }
}

/// Handler that relays connections to the matched rule's target.
pub struct RelayHandler {
    connect_timeout: Duration,
}

impl RelayHandler {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for RelayHandler {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl ConnHandler for RelayHandler {
    async fn handle(&self, ctx: ConnContext, mut conn: Conn) -> anyhow::Result<()> {
        let target = &ctx.metadata().rule.target;
        let addr = parse_target(target)
            .ok_or_else(|| anyhow::anyhow!("invalid relay target '{target}'"))?;

        let mut upstream = tokio::select! {
            result = connect_upstream(&addr, self.connect_timeout) => result?,
            _ = ctx.cancelled() => return Ok(()),
        };
        debug!(upstream = %addr, "Relay connected");

        let stats = relay_bidirectional(&mut conn, &mut upstream, 0, ctx.token()).await;
        debug!(
            upstream = %addr,
            bytes_to_upstream = stats.to_upstream,
            bytes_from_upstream = stats.from_upstream,
            cancelled = stats.cancelled,
            "Relay closed"
        );
        Ok(())
    }
}
