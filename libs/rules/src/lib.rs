//! # snare-rules
//!
//! The ordered rule set that tells the honeypot which handler or proxy
//! services each class of matched traffic.
//!
//! Rules are loaded from a TOML file:
//!
//! ```toml
//! [[rules]]
//! match = "tcp dst port 22"
//! type = "conn_handler"
//! name = "proxy_ssh"
//! target = "10.0.0.5:22"
//!
//! [[rules]]
//! match = "tcp"
//! type = "conn_handler"
//! target = "tcp"
//! ```
//!
//! The `match` expression is opaque here; it belongs to the packet engine.

mod error;
mod rule;

pub use error::RuleError;
pub use rule::{Rule, RuleSet, RuleType};
