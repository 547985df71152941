//! Identity persistence.
//!
//! The identity file holds the raw 16 identity bytes. It is written once,
//! atomically (write to temp, fsync, rename), and only read afterwards.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::error::IdentityError;
use crate::types::Identity;

/// File name of the persisted identity inside the storage directory.
pub const IDENTITY_FILE: &str = "identity";

/// Load the identity stored in `storage_dir`, creating it on first use.
///
/// The directory is created if needed. An existing identity is never
/// replaced, even if a later write would succeed.
pub fn ensure_identity(storage_dir: impl AsRef<Path>) -> Result<Identity, IdentityError> {
    let storage_dir = storage_dir.as_ref();
    let path = storage_dir.join(IDENTITY_FILE);

    match fs::read(&path) {
        Ok(bytes) => {
            let identity = Identity::from_slice(&bytes).ok_or_else(|| IdentityError::Corrupt {
                path: path.clone(),
                reason: format!(
                    "expected {} non-zero bytes, found {} bytes",
                    Identity::LEN,
                    bytes.len()
                ),
            })?;
            debug!(path = %path.display(), sensor_id = %identity, "Loaded identity");
            return Ok(identity);
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(IdentityError::storage(&path, e)),
    }

    fs::create_dir_all(storage_dir).map_err(|e| IdentityError::storage(storage_dir, e))?;

    let identity = Identity::generate();
    let tmp_path = path.with_extension("tmp");

    let mut file = File::create(&tmp_path).map_err(|e| IdentityError::storage(&tmp_path, e))?;
    file.write_all(identity.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|e| IdentityError::storage(&tmp_path, e))?;
    drop(file);

    fs::rename(&tmp_path, &path).map_err(|e| IdentityError::storage(&path, e))?;

    info!(path = %path.display(), sensor_id = %identity, "Generated new identity");
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_identity_is_stable() {
        let dir = tempfile::tempdir().unwrap();

        let first = ensure_identity(dir.path()).unwrap();
        let second = ensure_identity(dir.path()).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_ensure_identity_regenerates_after_removal() {
        let root = tempfile::tempdir().unwrap();
        let storage = root.path().join("var");

        let first = ensure_identity(&storage).unwrap();
        fs::remove_dir_all(&storage).unwrap();
        let second = ensure_identity(&storage).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn test_ensure_identity_creates_nested_dir() {
        let root = tempfile::tempdir().unwrap();
        let storage = root.path().join("a").join("b");

        let identity = ensure_identity(&storage).unwrap();

        let bytes = fs::read(storage.join(IDENTITY_FILE)).unwrap();
        assert_eq!(bytes.as_slice(), identity.as_bytes());
        assert!(!storage.join("identity.tmp").exists());
    }

    #[test]
    fn test_ensure_identity_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(IDENTITY_FILE), b"not-an-identity").unwrap();

        let err = ensure_identity(dir.path()).unwrap_err();

        assert!(err.is_corrupt(), "unexpected error: {err}");
    }

    #[test]
    fn test_ensure_identity_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        // A regular file where the directory should be.
        let err = ensure_identity(blocker.join("var")).unwrap_err();

        assert!(matches!(err, IdentityError::Storage { .. }), "unexpected error: {err}");
    }
}
