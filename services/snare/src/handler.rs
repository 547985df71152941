//! The uniform handler contract.
//!
//! Every protocol handler or proxy services one connection through
//! [`ConnHandler::handle`], receiving a [`ConnContext`] that carries the
//! per-connection cancellation token, the flow's metadata and a telemetry
//! handle.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use snare_id::Identity;
use tokio_util::sync::CancellationToken;

use crate::conn::{Conn, ConnMetadata};
use crate::telemetry::{ConnRecord, TelemetryError, TelemetrySink};

/// Per-connection context handed to a handler.
#[derive(Clone)]
pub struct ConnContext {
    cancel: CancellationToken,
    metadata: ConnMetadata,
    handler: Arc<str>,
    sensor_id: Identity,
    peer: SocketAddr,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl ConnContext {
    pub fn new(
        cancel: CancellationToken,
        metadata: ConnMetadata,
        handler: impl Into<Arc<str>>,
        sensor_id: Identity,
        peer: SocketAddr,
    ) -> Self {
        Self {
            cancel,
            metadata,
            handler: handler.into(),
            sensor_id,
            peer,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, sink: Option<Arc<dyn TelemetrySink>>) -> Self {
        self.telemetry = sink;
        self
    }

    /// Token cancelled on global shutdown or when the handler outlives its cap.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves once the connection should be abandoned.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn metadata(&self) -> &ConnMetadata {
        &self.metadata
    }

    pub fn handler_name(&self) -> &str {
        &self.handler
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Emit a telemetry record carrying `payload`.
    ///
    /// A no-op when no sink is configured.
    pub async fn produce(&self, payload: &[u8]) -> Result<(), TelemetryError> {
        let Some(sink) = &self.telemetry else {
            return Ok(());
        };
        let record = ConnRecord::new(
            self.sensor_id,
            self.peer,
            &self.metadata,
            &self.handler,
            Some(payload),
        );
        sink.log(&record).await
    }
}

/// An asynchronous routine servicing one accepted connection.
#[async_trait]
pub trait ConnHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: ConnContext, conn: Conn) -> anyhow::Result<()>;
}

/// Shared handler reference.
pub type Handler = Arc<dyn ConnHandler>;

/// Adapter turning an async closure into a [`ConnHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ConnHandler for FnHandler<F>
where
    F: Fn(ConnContext, Conn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: ConnContext, conn: Conn) -> anyhow::Result<()> {
        (self.0)(ctx, conn).await
    }
}

/// Build a [`Handler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(ConnContext, Conn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
