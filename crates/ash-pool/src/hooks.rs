//! Extension point invoked before a `waiting` sandbox is evicted or
//! idle-swept: persist a workspace snapshot and mark the bound session
//! paused. `ash-orchestrator` supplies the real implementation; tests use
//! [`NoopEvictionHooks`].

use std::path::Path;

use ash_core::error::ApiResult;
use ash_core::ids::{SandboxId, SessionId};
use async_trait::async_trait;

#[async_trait]
pub trait EvictionHooks: Send + Sync {
    async fn on_before_evict(
        &self,
        session_id: SessionId,
        sandbox_id: SandboxId,
        workspace_dir: &Path,
    );
}

pub struct NoopEvictionHooks;

#[async_trait]
impl EvictionHooks for NoopEvictionHooks {
    async fn on_before_evict(&self, _session_id: SessionId, _sandbox_id: SandboxId, _workspace_dir: &Path) {}
}

/// Cold-resume hook: populate a freshly created, empty workspace directory
/// from the session's snapshot. Returns whether a snapshot was actually found
/// and restored; `false` means the workspace is legitimately fresh and stays
/// empty.
#[async_trait]
pub trait RestoreHook: Send + Sync {
    async fn restore(&self, session_id: SessionId, workspace_dir: &Path) -> ApiResult<bool>;
}

pub struct NoopRestoreHook;

#[async_trait]
impl RestoreHook for NoopRestoreHook {
    async fn restore(&self, _session_id: SessionId, _workspace_dir: &Path) -> ApiResult<bool> {
        Ok(false)
    }
}
