//! Intercepting proxies.
//!
//! An intercept proxy sits between the attacker and a real service (an SSH
//! or Telnet server), relays the session, and records the leading client
//! bytes as telemetry.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::relay::{connect_upstream, parse_target, relay_bidirectional, DEFAULT_CONNECT_TIMEOUT};
use crate::conn::Conn;
use crate::error::SnareError;
use crate::handler::{ConnContext, ConnHandler};

/// Protocol spoken through an intercept proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterceptProtocol {
    Ssh,
    Telnet,
}

impl InterceptProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterceptProtocol::Ssh => "ssh",
            InterceptProtocol::Telnet => "telnet",
        }
    }
}

impl fmt::Display for InterceptProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proxy bound to one upstream service.
#[derive(Debug)]
pub struct InterceptProxy {
    protocol: InterceptProtocol,
    upstream: SocketAddr,
    capture_limit: usize,
}

impl InterceptProxy {
    /// Bind a proxy to `target`, which must name a literal socket address.
    pub fn new(
        protocol: InterceptProtocol,
        target: &str,
        capture_limit: usize,
    ) -> Result<Self, SnareError> {
        let proxy_init = |reason: String| SnareError::ProxyInit {
            kind: protocol.as_str(),
            target: target.to_string(),
            reason,
        };

        let addr = parse_target(target)
            .ok_or_else(|| proxy_init("target must be host:port".to_string()))?;
        let upstream: SocketAddr = addr
            .parse()
            .map_err(|e| proxy_init(format!("target is not a socket address: {e}")))?;

        info!(protocol = %protocol, upstream = %upstream, "Intercept proxy ready");

        Ok(Self {
            protocol,
            upstream,
            capture_limit,
        })
    }

    pub fn protocol(&self) -> InterceptProtocol {
        self.protocol
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }
}

#[async_trait]
impl ConnHandler for InterceptProxy {
    async fn handle(&self, ctx: ConnContext, mut conn: Conn) -> anyhow::Result<()> {
        let upstream_addr = self.upstream.to_string();
        let mut upstream = tokio::select! {
            result = connect_upstream(&upstream_addr, DEFAULT_CONNECT_TIMEOUT) => result?,
            _ = ctx.cancelled() => return Ok(()),
        };

        let stats =
            relay_bidirectional(&mut conn, &mut upstream, self.capture_limit, ctx.token()).await;

        debug!(
            protocol = %self.protocol,
            upstream = %self.upstream,
            bytes_to_upstream = stats.to_upstream,
            bytes_from_upstream = stats.from_upstream,
            captured = stats.captured.len(),
            cancelled = stats.cancelled,
            "Intercepted session closed"
        );

        // Cancelled sessions still report what the client sent.
        if !stats.captured.is_empty() {
            if let Err(e) = ctx.produce(&stats.captured).await {
                warn!(
                    protocol = %self.protocol,
                    handler = ctx.handler_name(),
                    error = %e,
                    "Failed to record intercepted payload"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use base64::Engine as _;
    use snare_id::Identity;
    use snare_rules::{Rule, RuleType};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::conn::tests::conn_pair;
    use crate::conn::{ConnMetadata, FlowKey};
    use crate::telemetry::{ConnRecord, TelemetryError, TelemetrySink};

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<ConnRecord>>,
    }

    #[async_trait]
    impl TelemetrySink for MemorySink {
        async fn log(&self, record: &ConnRecord) -> Result<(), TelemetryError> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[test]
    fn test_new_accepts_socket_address() {
        let proxy = InterceptProxy::new(InterceptProtocol::Ssh, "tcp://10.0.0.5:22", 1024).unwrap();
        assert_eq!(proxy.upstream(), "10.0.0.5:22".parse().unwrap());
        assert_eq!(proxy.protocol(), InterceptProtocol::Ssh);
    }

    #[test]
    fn test_new_rejects_hostname() {
        let err = InterceptProxy::new(InterceptProtocol::Telnet, "telnet.local:23", 1024).unwrap_err();
        match err {
            SnareError::ProxyInit { kind, target, .. } => {
                assert_eq!(kind, "telnet");
                assert_eq!(target, "telnet.local:23");
            }
            other => panic!("Expected ProxyInit, got {:?}", other),
        }
    }

    #[test]
    fn test_new_rejects_garbage() {
        assert!(InterceptProxy::new(InterceptProtocol::Ssh, "not a target", 1024).is_err());
    }

    #[tokio::test]
    async fn test_cancelled_session_still_records_capture() {
        // Upstream accepts and never answers.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = silent.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = silent.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let proxy = InterceptProxy::new(InterceptProtocol::Ssh, &upstream.to_string(), 1024).unwrap();
        let (conn, mut client) = conn_pair().await;
        let peer = conn.peer_addr().unwrap();
        let metadata = ConnMetadata {
            flow: FlowKey::new(peer),
            rule: Arc::new(Rule {
                index: 0,
                rule_type: RuleType::ConnHandler,
                name: "proxy_ssh".to_string(),
                target: upstream.to_string(),
                match_expr: "tcp dst port 22".to_string(),
            }),
            target_port: 22,
        };
        let sink = Arc::new(MemorySink::default());
        let cancel = CancellationToken::new();
        let ctx = ConnContext::new(cancel.clone(), metadata, "proxy_ssh", Identity::generate(), peer)
            .with_telemetry(Some(sink.clone() as Arc<dyn TelemetrySink>));

        let session = tokio::spawn(async move { proxy.handle(ctx, conn).await });
        client.write_all(b"root:hunter2\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .expect("session should end on cancel")
            .unwrap()
            .unwrap();

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].handler, "proxy_ssh");
        assert_eq!(
            records[0].payload.as_deref(),
            Some(base64::engine::general_purpose::STANDARD.encode(b"root:hunter2\n").as_str())
        );
    }
}
