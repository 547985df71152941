//! Built-in proxies.
//!
//! This module provides:
//! - A generic TCP relay toward a rule's target
//! - Intercepting SSH/Telnet proxies that relay and record sessions
//!
//! ## Architecture
//!
//! ```text
//! Attacker -> Conn -> Relay/InterceptProxy -> Upstream service
//!                            |
//!                  captured payload -> telemetry
//! ```

mod intercept;
mod relay;

pub use intercept::{InterceptProtocol, InterceptProxy};
pub use relay::{
    connect_upstream, parse_target, relay_bidirectional, RelayHandler, RelayStats,
    DEFAULT_CONNECT_TIMEOUT,
};
