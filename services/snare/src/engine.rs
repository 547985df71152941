//! Packet engine.
//!
//! The engine accepts connections on the tracked-traffic server, looks up
//! the classifier's metadata for each flow and hands the connection to the
//! callback registered for the resolved handler name.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::bootstrap::resolve_handler_name;
use crate::conn::{Conn, ConnMetadata, FlowKey};
use crate::dispatch::ConnCallback;
use crate::error::{Result, SnareError};

/// The packet interception and classification collaborator.
#[async_trait]
pub trait PacketEngine: Send + Sync + 'static {
    /// Install the accept callback for connections resolved to `name`.
    async fn register_conn_handler(&self, name: &str, callback: ConnCallback) -> Result<()>;

    /// Metadata the classifier recorded for `key`, if the flow is tracked.
    async fn connection_by_flow(&self, key: &FlowKey) -> Option<ConnMetadata>;

    async fn init(&self) -> Result<()>;

    /// Accept and dispatch connections until `shutdown` fires or
    /// [`PacketEngine::shutdown`] is called.
    async fn start(&self, shutdown: CancellationToken) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

/// Flow table populated by the classifier.
#[derive(Debug, Default)]
pub struct ConnTable {
    flows: RwLock<HashMap<FlowKey, ConnMetadata>>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, metadata: ConnMetadata) {
        self.flows.write().await.insert(metadata.flow, metadata);
    }

    pub async fn remove(&self, key: &FlowKey) -> Option<ConnMetadata> {
        self.flows.write().await.remove(key)
    }

    pub async fn get(&self, key: &FlowKey) -> Option<ConnMetadata> {
        self.flows.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.flows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.flows.read().await.is_empty()
    }
}

/// TCP packet engine serving the tracked-traffic port.
pub struct TcpEngine {
    bind_addr: SocketAddr,
    default_handler: Option<String>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: OnceLock<SocketAddr>,
    callbacks: RwLock<HashMap<String, ConnCallback>>,
    table: Arc<ConnTable>,
    stop: CancellationToken,
}

impl TcpEngine {
    pub fn new(bind_addr: SocketAddr, default_handler: Option<String>) -> Self {
        Self {
            bind_addr,
            default_handler,
            listener: Mutex::new(None),
            local_addr: OnceLock::new(),
            callbacks: RwLock::new(HashMap::new()),
            table: Arc::new(ConnTable::new()),
            stop: CancellationToken::new(),
        }
    }

    /// Bound address, available after [`PacketEngine::init`].
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// The flow table the classifier writes into.
    pub fn connections(&self) -> Arc<ConnTable> {
        Arc::clone(&self.table)
    }

    /// Names with an installed callback, sorted.
    pub async fn registered(&self) -> Vec<String> {
        let mut names: Vec<_> = self.callbacks.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn route(&self, stream: TcpStream, peer: SocketAddr) {
        let flow = FlowKey::new(peer);
        let metadata = self.table.get(&flow).await;

        let name = match &metadata {
            Some(md) => resolve_handler_name(&md.rule).to_string(),
            None => match &self.default_handler {
                Some(name) => name.clone(),
                None => {
                    debug!(peer = %peer, "Untracked connection and no default handler");
                    return;
                }
            },
        };

        let Some(callback) = self.callbacks.read().await.get(&name).cloned() else {
            debug!(peer = %peer, handler = %name, "No callback registered for handler");
            return;
        };

        let conn = match Conn::new(stream) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to wrap connection");
                return;
            }
        };

        tokio::spawn(
            async move {
                if let Err(e) = callback(conn, metadata).await {
                    if e.is_connection_scoped() {
                        debug!(error = %e, "Connection error");
                    } else {
                        error!(error = %e, "Connection callback failed");
                    }
                }
            }
            .instrument(tracing::info_span!("connection", peer = %peer, handler = %name)),
        );
    }
}

#[async_trait]
impl PacketEngine for TcpEngine {
    async fn register_conn_handler(&self, name: &str, callback: ConnCallback) -> Result<()> {
        if self
            .callbacks
            .write()
            .await
            .insert(name.to_string(), callback)
            .is_some()
        {
            debug!(handler = %name, "Replaced connection callback");
        }
        Ok(())
    }

    async fn connection_by_flow(&self, key: &FlowKey) -> Option<ConnMetadata> {
        self.table.get(key).await
    }

    async fn init(&self) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(SnareError::Engine)?;
        let local_addr = listener.local_addr().map_err(SnareError::Engine)?;
        let _ = self.local_addr.set(local_addr);
        *self.listener.lock().await = Some(listener);

        info!(bind_addr = %local_addr, "Packet engine bound");
        Ok(())
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.listener.lock().await.take().ok_or_else(|| {
            SnareError::Engine(io::Error::new(
                io::ErrorKind::NotConnected,
                "packet engine started before init",
            ))
        })?;
        info!(bind_addr = ?self.local_addr(), "Packet engine started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.route(stream, peer).await,
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!("Packet engine stopped accepting");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop.cancel();
        self.listener.lock().await.take();
        debug!("Packet engine shut down");
        Ok(())
    }
}
