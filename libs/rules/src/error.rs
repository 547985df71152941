//! Error types for rule loading and validation.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading a rule set.
#[derive(Debug, Error)]
pub enum RuleError {
    /// The rule file could not be read.
    #[error("failed to read rule file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The rule file is not valid TOML or does not match the rule schema.
    #[error("failed to parse rules: {0}")]
    Parse(#[from] toml::de::Error),

    /// A rule parsed but violates a rule-set invariant.
    #[error("invalid rule #{index}: {reason}")]
    Invalid { index: usize, reason: String },
}
