//! Durable per-key blob storage.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// A durable key/value store for opaque blobs.
///
/// Keys are restricted to `[A-Za-z0-9_-]` so every backend can map them to
/// object names without escaping.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch a blob, `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Store a blob, replacing any previous value.
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Remove a blob. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;
}

pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::invalid_key(key))
    }
}

/// Filesystem-backed blob store, one `{key}.json.gz` file per key.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never observes a partially written blob.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FsBlobStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json.gz", key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        validate_key(key)?;
        let target = self.path_for(key);
        let tmp = self.root.join(format!(
            ".{}.{}.{}.tmp",
            key,
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(key = %key, bytes = data.len(), "Stored blob");
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().join("blobs")).await.unwrap();

        assert!(store.get("abc").await.unwrap().is_none());
        store.put("abc", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("abc").await.unwrap(), Some(vec![1, 2, 3]));

        store.put("abc", vec![9]).await.unwrap();
        assert_eq!(store.get("abc").await.unwrap(), Some(vec![9]));

        store.delete("abc").await.unwrap();
        store.delete("abc").await.unwrap();
        assert!(store.get("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.put("../escape", vec![]).await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(store.get("").await.is_err());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        store.put("k1", vec![0; 64]).await.unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["k1.json.gz".to_string()]);
    }
}
