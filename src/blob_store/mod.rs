//! Key/value blob storage for raw and processed snapshots.
//!
//! The pipeline only needs a flat namespace with one non-negotiable
//! primitive: an atomic create-if-absent write, which the idempotency guard
//! builds its sentinels on. The filesystem implementation below gets that
//! from `O_EXCL`; an S3/MinIO backend would use a conditional put behind the
//! same trait.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub trait BlobStore: Send + Sync {
    /// Write `bytes` under `key`, replacing any existing object.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Atomically create `key` only if it does not already exist.
    /// Returns false (without writing) when the object is already present.
    fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool>;

    fn get(&self, key: &str) -> Result<Vec<u8>>;

    fn exists(&self, key: &str) -> Result<bool>;

    fn delete(&self, key: &str) -> Result<()>;
}

/// Blob store rooted at a local directory; object keys map to relative
/// paths under the root.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create blob store root {:?}", root))?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create blob directory {:?}", parent))?;
        }
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(key);
        self.ensure_parent(&path)?;

        // Write-then-rename so readers never observe a partial object.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).with_context(|| format!("Failed to write blob {:?}", tmp))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to finalize blob {:?}", path))?;
        debug!("Wrote blob {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        let path = self.object_path(key);
        self.ensure_parent(&path)?;

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(bytes)
                    .with_context(|| format!("Failed to write blob {:?}", path))?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to create blob {:?}", path))
            }
        }
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(key);
        fs::read(&path).with_context(|| format!("Failed to read blob {}", key))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.object_path(key).exists())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete blob {}", key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (FsBlobStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path().join("bucket")).unwrap();
        (store, tmp)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (store, _tmp) = create_test_store();
        store.put("raw/2025-01-01-00/recently_played.json", b"[]").unwrap();
        let bytes = store.get("raw/2025-01-01-00/recently_played.json").unwrap();
        assert_eq!(bytes, b"[]");
    }

    #[test]
    fn test_put_overwrites() {
        let (store, _tmp) = create_test_store();
        store.put("k", b"first").unwrap();
        store.put("k", b"second").unwrap();
        assert_eq!(store.get("k").unwrap(), b"second");
    }

    #[test]
    fn test_put_if_absent_is_first_writer_wins() {
        let (store, _tmp) = create_test_store();
        assert!(store.put_if_absent("raw/w/_SUCCESS", b"").unwrap());
        assert!(!store.put_if_absent("raw/w/_SUCCESS", b"").unwrap());
        // The losing write must not clobber the object.
        store.put("k", b"original").unwrap();
        assert!(!store.put_if_absent("k", b"clobber").unwrap());
        assert_eq!(store.get("k").unwrap(), b"original");
    }

    #[test]
    fn test_exists_and_delete() {
        let (store, _tmp) = create_test_store();
        assert!(!store.exists("gone").unwrap());
        store.put("gone", b"x").unwrap();
        assert!(store.exists("gone").unwrap());
        store.delete("gone").unwrap();
        assert!(!store.exists("gone").unwrap());
        // Deleting a missing object is not an error.
        store.delete("gone").unwrap();
    }

    #[test]
    fn test_get_missing_is_error() {
        let (store, _tmp) = create_test_store();
        assert!(store.get("missing").is_err());
    }
}
