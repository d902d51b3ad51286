//! `EvictionHooks` implementation: before a `waiting` sandbox is destroyed by
//! the pool (idle sweep or capacity eviction), snapshot its workspace and
//! mark the bound session `paused`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash_core::ids::{SandboxId, SessionId};
use ash_core::model::SessionStatus;
use ash_core::repository::Repository;
use ash_pool::EvictionHooks;
use ash_snapshot::SnapshotStore;
use async_trait::async_trait;
use tracing::{error, info};

pub struct SnapshotEvictionHooks {
    repo: Arc<dyn Repository>,
    store: Arc<dyn SnapshotStore>,
    tmp_dir: PathBuf,
}

impl SnapshotEvictionHooks {
    pub fn new(repo: Arc<dyn Repository>, store: Arc<dyn SnapshotStore>, tmp_dir: PathBuf) -> Self {
        Self {
            repo,
            store,
            tmp_dir,
        }
    }

    async fn snapshot_and_pause(&self, session_id: SessionId, workspace_dir: &Path) {
        let key = session_id.to_string();
        let tarball = ash_snapshot::tar::default_tmp_tarball_path(&self.tmp_dir, &key);
        if let Err(err) = tokio::fs::create_dir_all(&self.tmp_dir).await {
            error!(%err, session_id = %session_id, "failed to create snapshot tmp dir");
            return;
        }

        let src = workspace_dir.to_path_buf();
        let dest = tarball.clone();
        let build = tokio::task::spawn_blocking(move || {
            ash_snapshot::tar::create_tarball(&src, &dest)
        })
        .await;

        let build_ok = match build {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                error!(%err, session_id = %session_id, "failed to build workspace tarball");
                false
            }
            Err(err) => {
                error!(%err, session_id = %session_id, "tarball build task panicked");
                false
            }
        };

        if build_ok {
            if let Err(err) = self.store.upload(&key, &tarball).await {
                error!(%err, session_id = %session_id, "failed to upload workspace snapshot");
            } else {
                info!(session_id = %session_id, "workspace snapshot persisted before eviction");
            }
            let _ = tokio::fs::remove_file(&tarball).await;
        }

        if let Err(err) = self
            .repo
            .update_session_status(&session_id, SessionStatus::Paused)
            .await
        {
            error!(%err, session_id = %session_id, "failed to mark session paused on eviction");
        }
    }
}

#[async_trait]
impl EvictionHooks for SnapshotEvictionHooks {
    async fn on_before_evict(
        &self,
        session_id: SessionId,
        sandbox_id: SandboxId,
        workspace_dir: &Path,
    ) {
        info!(session_id = %session_id, sandbox_id = %sandbox_id, "evicting waiting sandbox");
        self.snapshot_and_pause(session_id, workspace_dir).await;
    }
}
