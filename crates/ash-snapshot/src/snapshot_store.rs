//! `SnapshotStore`: whole-workspace tarballs addressed by session id.
//! Pluggable by URL scheme — `s3://`, `gs://`, or a bare path for local disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::info;

use crate::error::{SnapshotError, SnapshotResult};

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Upload the tarball at `tar_path` under `session_id`.
    async fn upload(&self, session_id: &str, tar_path: &Path) -> SnapshotResult<()>;
    /// Download the tarball for `session_id` to `dest_path`.
    async fn download(&self, session_id: &str, dest_path: &Path) -> SnapshotResult<()>;
    async fn exists(&self, session_id: &str) -> SnapshotResult<bool>;
    async fn delete(&self, session_id: &str) -> SnapshotResult<()>;
}

/// Local-disk implementation: `root/<sessionId>/workspace.tar.gz`, matching
/// 's persisted layout `dataDir/snapshots/<sessionId>/workspace.tar.gz`.
pub struct LocalSnapshotStore {
    root: PathBuf,
}

impl LocalSnapshotStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn tarball_path(&self, session_id: &str) -> SnapshotResult<PathBuf> {
        validate_key(session_id)?;
        Ok(self.root.join(session_id).join("workspace.tar.gz"))
    }
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    async fn upload(&self, session_id: &str, tar_path: &Path) -> SnapshotResult<()> {
        let dest = self.tarball_path(session_id)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(tar_path, &dest).await?;
        info!(session_id, path = %dest.display(), "snapshot uploaded to local store");
        Ok(())
    }

    async fn download(&self, session_id: &str, dest_path: &Path) -> SnapshotResult<()> {
        let src = self.tarball_path(session_id)?;
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            return Err(SnapshotError::NotFound(session_id.to_string()));
        }
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, dest_path).await?;
        Ok(())
    }

    async fn exists(&self, session_id: &str) -> SnapshotResult<bool> {
        let path = self.tarball_path(session_id)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn delete(&self, session_id: &str) -> SnapshotResult<()> {
        let path = self.tarball_path(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// S3/GCS-backed implementation over the `object_store` crate — one crate,
/// one code path, for either cloud scheme; only the constructor differs.
pub struct ObjectSnapshotStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectSnapshotStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn object_path(&self, session_id: &str) -> SnapshotResult<ObjectPath> {
        validate_key(session_id)?;
        let key = format!("{}/{}/workspace.tar.gz", self.prefix.trim_matches('/'), session_id);
        Ok(ObjectPath::from(key))
    }
}

#[async_trait]
impl SnapshotStore for ObjectSnapshotStore {
    async fn upload(&self, session_id: &str, tar_path: &Path) -> SnapshotResult<()> {
        let path = self.object_path(session_id)?;
        let bytes = tokio::fs::read(tar_path).await?;
        self.store.put(&path, bytes.into()).await?;
        Ok(())
    }

    async fn download(&self, session_id: &str, dest_path: &Path) -> SnapshotResult<()> {
        let path = self.object_path(session_id)?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|_| SnapshotError::NotFound(session_id.to_string()))?;
        let bytes = result.bytes().await?;
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest_path, &bytes).await?;
        Ok(())
    }

    async fn exists(&self, session_id: &str) -> SnapshotResult<bool> {
        let path = self.object_path(session_id)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, session_id: &str) -> SnapshotResult<()> {
        let path = self.object_path(session_id)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn validate_key(key: &str) -> SnapshotResult<()> {
    if key.contains('\0') {
        return Err(SnapshotError::NullByteInKey(key.to_string()));
    }
    if key.contains("..") || key.starts_with('/') {
        return Err(SnapshotError::PathTraversal(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_round_trips() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalSnapshotStore::new(root.path().to_path_buf());

        let src = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(src.path(), b"tarball-bytes").await.unwrap();

        assert!(!store.exists("sess-1").await.unwrap());
        store.upload("sess-1", src.path()).await.unwrap();
        assert!(store.exists("sess-1").await.unwrap());

        let dest = tempfile::tempdir().unwrap().path().join("out.tar.gz");
        store.download("sess-1", &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"tarball-bytes");

        store.delete("sess-1").await.unwrap();
        assert!(!store.exists("sess-1").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalSnapshotStore::new(root.path().to_path_buf());
        let err = store.exists("../escape").await.unwrap_err();
        assert!(matches!(err, SnapshotError::PathTraversal(_)));
    }

    #[tokio::test]
    async fn download_of_missing_session_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalSnapshotStore::new(root.path().to_path_buf());
        let dest = tempfile::tempdir().unwrap().path().join("out.tar.gz");
        let err = store.download("missing", &dest).await.unwrap_err();
        assert!(matches!(err, SnapshotError::NotFound(_)));
    }
}
