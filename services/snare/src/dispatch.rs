//! Connection dispatch.
//!
//! The [`Dispatcher`] wraps every handler invocation with the per-connection
//! policy:
//!
//! 1. resolve the peer address (failure drops the connection)
//! 2. return early for untracked connections
//! 3. emit a telemetry record before servicing
//! 4. arm the transport I/O deadline
//! 5. derive a context from the global shutdown token, capped in lifetime
//! 6. run a watchdog that force-closes the socket once the context is cancelled
//! 7. invoke the handler and release the watchdog when it returns
//!
//! Every dispatch is counted by a [`TaskTracker`] so shutdown can wait for
//! in-flight connections to drain.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use snare_id::Identity;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn, Instrument};

use crate::config::Config;
use crate::conn::{Conn, ConnMetadata};
use crate::error::{Result, SnareError};
use crate::handler::{ConnContext, Handler};
use crate::telemetry::{ConnRecord, TelemetrySink};

/// Callback the packet engine invokes once per accepted connection.
pub type ConnCallback =
    Arc<dyn Fn(Conn, Option<ConnMetadata>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Tracked connections handed to a handler.
    pub accepted: AtomicU64,
    /// Connections without metadata.
    pub untracked: AtomicU64,
    /// Handlers that returned successfully.
    pub completed: AtomicU64,
    /// Connections that failed before or inside the handler.
    pub failed: AtomicU64,
    /// Connections closed by the watchdog.
    pub force_closed: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    pub accepted: u64,
    pub untracked: u64,
    pub completed: u64,
    pub failed: u64,
    pub force_closed: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            untracked: self.untracked.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            force_closed: self.force_closed.load(Ordering::Relaxed),
        }
    }
}

/// Applies deadline, cancellation and telemetry policy around handlers.
pub struct Dispatcher {
    sensor_id: Identity,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    conn_timeout: Duration,
    max_handler_lifetime: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(
        sensor_id: Identity,
        config: &Config,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            sensor_id,
            telemetry: None,
            conn_timeout: config.conn_timeout,
            max_handler_lifetime: config.max_handler_lifetime,
            shutdown,
            tracker,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn with_telemetry(mut self, sink: Option<Arc<dyn TelemetrySink>>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Build the accept callback for `handler`, registered as `name`.
    pub fn callback(self: &Arc<Self>, name: impl Into<Arc<str>>, handler: Handler) -> ConnCallback {
        let dispatcher = Arc::clone(self);
        let name: Arc<str> = name.into();
        Arc::new(move |conn, metadata| {
            let dispatcher = Arc::clone(&dispatcher);
            let name = Arc::clone(&name);
            let handler = Arc::clone(&handler);
            Box::pin(async move { dispatcher.dispatch(name, handler, conn, metadata).await })
        })
    }

    /// Service one connection with `handler`.
    pub async fn dispatch(
        &self,
        name: Arc<str>,
        handler: Handler,
        conn: Conn,
        metadata: Option<ConnMetadata>,
    ) -> Result<()> {
        let span = tracing::debug_span!("dispatch", handler = %name);
        self.tracker
            .track_future(self.service(name, handler, conn, metadata))
            .instrument(span)
            .await
    }

    async fn service(
        &self,
        name: Arc<str>,
        handler: Handler,
        mut conn: Conn,
        metadata: Option<ConnMetadata>,
    ) -> Result<()> {
        let peer = match conn.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return Err(SnareError::Address(e));
            }
        };

        let Some(metadata) = metadata else {
            self.stats.untracked.fetch_add(1, Ordering::Relaxed);
            debug!(
                host = %peer.ip(),
                src_port = peer.port(),
                "Connection not tracked"
            );
            return Ok(());
        };

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        debug!(
            host = %peer.ip(),
            src_port = peer.port(),
            dest_port = metadata.target_port,
            handler = %name,
            "New connection"
        );

        if let Some(sink) = &self.telemetry {
            let record = ConnRecord::new(self.sensor_id, peer, &metadata, &name, None);
            if let Err(e) = sink.log(&record).await {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, handler = %name, "Failed to record connection");
                return Err(e.into());
            }
        }

        match Instant::now().checked_add(self.conn_timeout) {
            Some(deadline) => conn.set_deadline(deadline),
            None => debug!(
                conn_timeout_secs = self.conn_timeout.as_secs(),
                "I/O deadline out of range, not armed"
            ),
        }

        let token = self.shutdown.child_token();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        self.tracker.spawn(
            watchdog(
                conn.closer(),
                token.clone(),
                done_rx,
                self.max_handler_lifetime,
                Arc::clone(&self.stats),
                peer,
            )
            .in_current_span(),
        );

        let ctx = ConnContext::new(token, metadata, Arc::clone(&name), self.sensor_id, peer)
            .with_telemetry(self.telemetry.clone());
        let result = handler.handle(ctx, conn).await;
        let _ = done_tx.send(());

        match result {
            Ok(()) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(source) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(SnareError::Dispatch {
                    handler: name.to_string(),
                    source,
                })
            }
        }
    }
}

/// Force-closes the connection once `token` is cancelled or the handler
/// outlives `lifetime`; exits quietly when the handler finishes first.
async fn watchdog(
    closer: crate::conn::ConnCloser,
    token: CancellationToken,
    done: oneshot::Receiver<()>,
    lifetime: Duration,
    stats: Arc<DispatchStats>,
    peer: SocketAddr,
) {
    tokio::select! {
        biased;
        _ = done => return,
        _ = token.cancelled() => {
            debug!(peer = %peer, "Connection cancelled");
        }
        _ = tokio::time::sleep(lifetime) => {
            warn!(peer = %peer, lifetime_secs = lifetime.as_secs(), "Handler exceeded maximum lifetime");
            token.cancel();
        }
    }

    if closer.close() {
        stats.force_closed.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %peer, "Connection force-closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use snare_rules::{Rule, RuleType};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::conn::tests::conn_pair;
    use crate::conn::FlowKey;
    use crate::handler::handler_fn;
    use crate::telemetry::TelemetryError;

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<ConnRecord>>,
        fail: bool,
    }

    #[async_trait]
    impl TelemetrySink for MemorySink {
        async fn log(&self, record: &ConnRecord) -> Result<(), TelemetryError> {
            if self.fail {
                return Err(TelemetryError::Rejected { status: 500 });
            }
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn metadata(peer: SocketAddr) -> ConnMetadata {
        ConnMetadata {
            flow: FlowKey::new(peer),
            rule: Arc::new(Rule {
                index: 0,
                rule_type: RuleType::ConnHandler,
                name: String::new(),
                target: "test".to_string(),
                match_expr: "tcp".to_string(),
            }),
            target_port: 2323,
        }
    }

    fn dispatcher(config: &Config, shutdown: &CancellationToken) -> Dispatcher {
        Dispatcher::new(
            Identity::generate(),
            config,
            shutdown.clone(),
            TaskTracker::new(),
        )
    }

    fn counting_handler(calls: Arc<AtomicUsize>) -> Handler {
        handler_fn(move |_ctx, _conn| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_untracked_connection_is_noop() {
        let shutdown = CancellationToken::new();
        let sink = Arc::new(MemorySink::default());
        let dispatcher = dispatcher(&Config::default(), &shutdown)
            .with_telemetry(Some(sink.clone() as Arc<dyn TelemetrySink>));
        let calls = Arc::new(AtomicUsize::new(0));

        let (conn, _client) = conn_pair().await;
        dispatcher
            .dispatch("test".into(), counting_handler(calls.clone()), conn, None)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(sink.records.lock().unwrap().is_empty());
        assert_eq!(dispatcher.stats().snapshot().untracked, 1);
    }

    #[tokio::test]
    async fn test_telemetry_precedes_handler() {
        let shutdown = CancellationToken::new();
        let sink = Arc::new(MemorySink::default());
        let dispatcher = dispatcher(&Config::default(), &shutdown)
            .with_telemetry(Some(sink.clone() as Arc<dyn TelemetrySink>));

        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let handler = {
            let sink = Arc::clone(&sink);
            let seen = Arc::clone(&seen);
            handler_fn(move |_ctx, _conn| {
                let sink = Arc::clone(&sink);
                let seen = Arc::clone(&seen);
                async move {
                    seen.store(sink.records.lock().unwrap().len(), Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let (conn, _client) = conn_pair().await;
        let md = metadata(conn.peer_addr().unwrap());
        dispatcher
            .dispatch("test".into(), handler, conn, Some(md))
            .await
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let records = sink.records.lock().unwrap();
        assert_eq!(records[0].dest_port, 2323);
        assert_eq!(records[0].handler, "test");
    }

    #[tokio::test]
    async fn test_telemetry_failure_skips_handler() {
        let shutdown = CancellationToken::new();
        let sink = Arc::new(MemorySink {
            fail: true,
            ..Default::default()
        });
        let dispatcher = dispatcher(&Config::default(), &shutdown)
            .with_telemetry(Some(sink as Arc<dyn TelemetrySink>));
        let calls = Arc::new(AtomicUsize::new(0));

        let (conn, _client) = conn_pair().await;
        let md = metadata(conn.peer_addr().unwrap());
        let err = dispatcher
            .dispatch("test".into(), counting_handler(calls.clone()), conn, Some(md))
            .await
            .unwrap_err();

        assert!(matches!(err, SnareError::Telemetry(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_is_dispatch_error() {
        let shutdown = CancellationToken::new();
        let dispatcher = dispatcher(&Config::default(), &shutdown);
        let handler = handler_fn(|_ctx, _conn| async { Err(anyhow::anyhow!("protocol violation")) });

        let (conn, _client) = conn_pair().await;
        let md = metadata(conn.peer_addr().unwrap());
        let err = dispatcher
            .dispatch("test".into(), handler, conn, Some(md))
            .await
            .unwrap_err();

        match err {
            SnareError::Dispatch { handler, .. } => assert_eq!(handler, "test"),
            other => panic!("Expected Dispatch, got {:?}", other),
        }
        assert_eq!(dispatcher.stats().snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_handler_sees_deadline() {
        let shutdown = CancellationToken::new();
        let config = Config {
            conn_timeout: Duration::from_millis(100),
            ..Config::default()
        };
        let dispatcher = dispatcher(&config, &shutdown);
        let handler = handler_fn(|_ctx, mut conn| async move {
            let mut buf = [0u8; 16];
            conn.read(&mut buf).await?;
            Ok::<_, anyhow::Error>(())
        });

        let (conn, _client) = conn_pair().await;
        let md = metadata(conn.peer_addr().unwrap());
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            dispatcher.dispatch("test".into(), handler, conn, Some(md)),
        )
        .await
        .expect("deadline should abort the read")
        .unwrap_err();

        assert!(matches!(err, SnareError::Dispatch { .. }));
    }

    #[tokio::test]
    async fn test_unbounded_timeout_does_not_arm_deadline() {
        let shutdown = CancellationToken::new();
        let config = Config::from_lookup(|key| {
            (key == "SNARE_CONN_TIMEOUT_SECS").then(|| u64::MAX.to_string())
        })
        .unwrap();
        let dispatcher = dispatcher(&config, &shutdown);
        let handler = handler_fn(|_ctx, mut conn| async move {
            anyhow::ensure!(conn.deadline().is_none(), "deadline should not be armed");
            conn.write_all(b"bye").await?;
            Ok::<_, anyhow::Error>(())
        });

        let (conn, mut client) = conn_pair().await;
        let md = metadata(conn.peer_addr().unwrap());
        dispatcher
            .dispatch("test".into(), handler, conn, Some(md))
            .await
            .unwrap();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");
        assert_eq!(dispatcher.stats().snapshot().completed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_force_closes_blocked_handler() {
        let shutdown = CancellationToken::new();
        let dispatcher = Arc::new(dispatcher(&Config::default(), &shutdown));

        // Ignores the context entirely and blocks on I/O.
        let handler = handler_fn(|_ctx, mut conn| async move {
            let mut buf = [0u8; 16];
            let n = conn.read(&mut buf).await?;
            anyhow::ensure!(n == 0, "expected EOF after force-close");
            Ok::<_, anyhow::Error>(())
        });

        let (conn, mut client) = conn_pair().await;
        let md = metadata(conn.peer_addr().unwrap());
        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher.dispatch("test".into(), handler, conn, Some(md)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.tracker().len(), 2);
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("handler should be unblocked")
            .unwrap()
            .unwrap();

        dispatcher.tracker().close();
        tokio::time::timeout(Duration::from_secs(2), dispatcher.tracker().wait())
            .await
            .expect("watchdog should exit");

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(dispatcher.stats().snapshot().force_closed, 1);
    }

    #[tokio::test]
    async fn test_lifetime_cap_cancels_context() {
        let shutdown = CancellationToken::new();
        let config = Config {
            max_handler_lifetime: Duration::from_millis(100),
            ..Config::default()
        };
        let dispatcher = dispatcher(&config, &shutdown);
        let handler = handler_fn(|ctx, _conn| async move {
            ctx.cancelled().await;
            Ok(())
        });

        let (conn, _client) = conn_pair().await;
        let md = metadata(conn.peer_addr().unwrap());
        tokio::time::timeout(
            Duration::from_secs(2),
            dispatcher.dispatch("test".into(), handler, conn, Some(md)),
        )
        .await
        .expect("lifetime cap should cancel the context")
        .unwrap();

        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_completed_handler_releases_watchdog() {
        let shutdown = CancellationToken::new();
        let dispatcher = dispatcher(&Config::default(), &shutdown);
        let handler = handler_fn(|_ctx, mut conn| async move {
            conn.write_all(b"bye").await?;
            Ok::<_, anyhow::Error>(())
        });

        let (conn, mut client) = conn_pair().await;
        let md = metadata(conn.peer_addr().unwrap());
        dispatcher
            .dispatch("test".into(), handler, conn, Some(md))
            .await
            .unwrap();

        dispatcher.tracker().close();
        tokio::time::timeout(Duration::from_secs(2), dispatcher.tracker().wait())
            .await
            .expect("watchdog should exit after completion");

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");
        let snapshot = dispatcher.stats().snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.force_closed, 0);
    }
}
