//! Error types for identity persistence.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or persisting the sensor identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The storage directory or identity file could not be created, read or written.
    #[error("identity storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The identity file exists but does not hold a valid identity.
    #[error("corrupt identity file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

impl IdentityError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Returns true if the stored bytes could not be parsed.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, IdentityError::Corrupt { .. })
    }
}
