//! snare
//!
//! Connection-dispatch core of a low-interaction honeypot sensor.
//!
//! The sensor:
//! - Loads a persisted sensor identity and an ordered rule set
//! - Bootstraps built-in proxies named by rules and freezes the handler registry
//! - Dispatches every classified connection to its handler under an I/O
//!   deadline, a lifetime cap and the global shutdown token
//! - Drains in-flight connections on shutdown, bounded by a grace interval

pub mod bootstrap;
pub mod config;
pub mod conn;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod honeypot;
pub mod monitor;
pub mod proxy;
pub mod registry;
pub mod telemetry;

pub use bootstrap::{resolve_handler_name, ProxyBootstrapper, ProxyKind};
pub use config::Config;
pub use conn::{Conn, ConnCloser, ConnMetadata, FlowKey};
pub use dispatch::{ConnCallback, DispatchSnapshot, DispatchStats, Dispatcher};
pub use engine::{ConnTable, PacketEngine, TcpEngine};
pub use error::{Result, SnareError};
pub use handler::{handler_fn, ConnContext, ConnHandler, Handler};
pub use honeypot::{Honeypot, LifecycleState};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder, RegistryError};
pub use telemetry::{ConnRecord, HttpSink, TelemetryError, TelemetrySink};
