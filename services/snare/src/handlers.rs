//! Built-in protocol handlers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::config::Config;
use crate::conn::Conn;
use crate::handler::{ConnContext, ConnHandler};
use crate::proxy::RelayHandler;
use crate::registry::{HandlerRegistryBuilder, RegistryError};

/// Name of the generic capture handler.
pub const TCP_HANDLER: &str = "tcp";

/// Name of the generic relay handler, renamed per rule at bootstrap.
pub const RELAY_HANDLER: &str = "proxy_tcp";

/// Reads whatever the client sends, up to a limit, and records it.
pub struct CaptureHandler {
    max_payload: usize,
}

impl CaptureHandler {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

#[async_trait]
impl ConnHandler for CaptureHandler {
    async fn handle(&self, ctx: ConnContext, mut conn: Conn) -> anyhow::Result<()> {
        let mut payload = Vec::with_capacity(self.max_payload.min(4096));
        let mut buf = vec![0u8; self.max_payload.min(8192)];

        let outcome = tokio::select! {
            result = async {
                while payload.len() < self.max_payload {
                    let n = conn.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    let take = n.min(self.max_payload - payload.len());
                    payload.extend_from_slice(&buf[..take]);
                }
                Ok::<_, std::io::Error>(())
            } => result,
            _ = ctx.cancelled() => Ok(()),
        };

        // Deadline and resets still leave a payload worth recording.
        if let Err(e) = &outcome {
            debug!(error = %e, captured = payload.len(), "Capture ended early");
        }

        debug!(
            handler = ctx.handler_name(),
            dest_port = ctx.metadata().target_port,
            captured = payload.len(),
            "Captured TCP payload"
        );

        if !payload.is_empty() {
            if let Err(e) = ctx.produce(&payload).await {
                warn!(error = %e, "Failed to record captured payload");
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// Handlers available before any rule is bootstrapped.
pub fn builtin_handlers(config: &Config) -> Result<HandlerRegistryBuilder, RegistryError> {
    let mut builder = HandlerRegistryBuilder::new();
    builder.register(
        TCP_HANDLER,
        Arc::new(CaptureHandler::new(config.max_tcp_payload)),
    )?;
    builder.register(RELAY_HANDLER, Arc::new(RelayHandler::default()))?;
    Ok(builder)
}
