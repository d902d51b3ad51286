//! `RestoreHook` implementation: on cold resume, download the session's
//! snapshot tarball and extract it into the freshly created workspace
//! directory.

use std::path::Path;
use std::sync::Arc;

use ash_core::error::{ApiError, ApiResult};
use ash_core::ids::SessionId;
use ash_pool::RestoreHook;
use ash_snapshot::{SnapshotError, SnapshotStore};
use async_trait::async_trait;
use tracing::info;

pub struct SnapshotRestoreHook {
    store: Arc<dyn SnapshotStore>,
    tmp_dir: std::path::PathBuf,
}

impl SnapshotRestoreHook {
    pub fn new(store: Arc<dyn SnapshotStore>, tmp_dir: std::path::PathBuf) -> Self {
        Self { store, tmp_dir }
    }
}

#[async_trait]
impl RestoreHook for SnapshotRestoreHook {
    async fn restore(&self, session_id: SessionId, workspace_dir: &Path) -> ApiResult<bool> {
        let key = session_id.to_string();
        match self.store.exists(&key).await {
            Ok(false) => return Ok(false),
            Err(err) => return Err(ApiError::SnapshotUnavailable(err.to_string())),
            Ok(true) => {}
        }

        let tarball = ash_snapshot::tar::default_tmp_tarball_path(&self.tmp_dir, &key);
        tokio::fs::create_dir_all(&self.tmp_dir)
            .await
            .map_err(|e| ApiError::SnapshotUnavailable(e.to_string()))?;

        self.store
            .download(&key, &tarball)
            .await
            .map_err(|e| match e {
                SnapshotError::NotFound(_) => ApiError::SnapshotUnavailable(
                    "snapshot vanished between exists() and download()".into(),
                ),
                other => ApiError::SnapshotUnavailable(other.to_string()),
            })?;

        let dest = workspace_dir.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || {
            ash_snapshot::tar::extract_tarball(&tarball, &dest)
        })
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
        extracted.map_err(|e| ApiError::SnapshotUnavailable(e.to_string()))?;

        info!(session_id = %session_id, "workspace restored from snapshot");
        Ok(true)
    }
}
