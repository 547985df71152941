//! # snare-id
//!
//! Stable sensor identity for the snare honeypot.
//!
//! Every sensor tags its logs and telemetry with a 128-bit identity that is
//! generated once, persisted under the storage directory, and never
//! regenerated while the file exists.
//!
//! ```ignore
//! let identity = snare_id::ensure_identity("/var/lib/snare")?;
//! tracing::info!(sensor_id = %identity, "sensor identity ready");
//! ```

mod error;
mod store;
mod types;

pub use error::IdentityError;
pub use store::{ensure_identity, IDENTITY_FILE};
pub use types::Identity;
