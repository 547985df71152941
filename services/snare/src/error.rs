//! Error taxonomy for the dispatch core.
//!
//! Startup-fatal errors abort initialization before the sensor reaches
//! `Running`. Connection-scoped errors drop one connection and are logged;
//! they never stop the service.

use std::io;

use snare_id::IdentityError;
use snare_rules::RuleError;
use thiserror::Error;

use crate::telemetry::TelemetryError;

/// Errors produced by the dispatch core.
#[derive(Debug, Error)]
pub enum SnareError {
    /// Identity could not be loaded or persisted.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The rule file is missing or invalid.
    #[error("rule set error: {0}")]
    Rules(#[from] RuleError),

    /// Configuration is malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The peer address of a connection could not be determined.
    #[error("invalid peer address: {0}")]
    Address(#[source] io::Error),

    /// A built-in proxy could not be constructed for a rule.
    #[error("failed to initialize {kind} proxy for target '{target}': {reason}")]
    ProxyInit {
        kind: &'static str,
        target: String,
        reason: String,
    },

    /// A handler returned an error while servicing a connection.
    #[error("handler '{handler}' failed: {source}")]
    Dispatch {
        handler: String,
        #[source]
        source: anyhow::Error,
    },

    /// The telemetry sink rejected a record.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    /// The packet engine failed.
    #[error("packet engine error: {0}")]
    Engine(#[source] io::Error),

    /// A lifecycle operation was called in the wrong state.
    #[error("cannot {operation} while {state}")]
    Lifecycle {
        operation: &'static str,
        state: &'static str,
    },
}

impl SnareError {
    /// Errors that abort startup.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            SnareError::Identity(_)
                | SnareError::Rules(_)
                | SnareError::Config(_)
                | SnareError::Engine(_)
                | SnareError::Lifecycle { .. }
        )
    }

    /// Errors confined to a single connection.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            SnareError::Address(_) | SnareError::Dispatch { .. } | SnareError::Telemetry(_)
        )
    }
}

pub type Result<T, E = SnareError> = std::result::Result<T, E>;
