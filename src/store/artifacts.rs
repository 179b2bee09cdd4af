use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;

use super::ArtifactStore;
use crate::errors::StoreError;

/// Stores artifacts as plain files under a root directory. Keys are
/// `/`-separated relative paths; anything that could escape the root is
/// rejected.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let invalid = || StoreError::InvalidKey(key.to_string());
        if key.is_empty() || key.starts_with('/') || key.contains('\\') || key.contains('\0') {
            return Err(invalid());
        }
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains(':') {
                return Err(invalid());
            }
            path.push(segment);
        }
        Ok(path)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))
                .map_err(StoreError::Database)?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write artifact {key}"))
            .map_err(StoreError::Database)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Database(
                anyhow::Error::new(e).context(format!("Failed to read artifact {key}")),
            )),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Database(
                anyhow::Error::new(e).context(format!("Failed to delete artifact {key}")),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        store.put("o1/j1/src/lib.rs", b"pub fn a() {}").await.unwrap();
        assert!(dir.path().join("o1/j1/src/lib.rs").exists());
        assert_eq!(
            store.get("o1/j1/src/lib.rs").await.unwrap().as_deref(),
            Some(&b"pub fn a() {}"[..])
        );

        store.delete("o1/j1/src/lib.rs").await.unwrap();
        assert_eq!(store.get("o1/j1/src/lib.rs").await.unwrap(), None);
        // Second delete is a no-op.
        store.delete("o1/j1/src/lib.rs").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_keys_that_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        for key in ["", "/etc/passwd", "o1/../../x", "o1/./x", "o1//x", "o1\\x", "C:/x"] {
            let err = store.put(key, b"x").await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey(_)), "key {key:?} accepted");
        }
    }
}
