//! The Sandbox Pool: the authoritative state machine over sandboxes. Indexes
//! live `ManagedSandbox`es by id and mirrors a session-id → sandbox-id index;
//! persists a lifecycle record for every sandbox via the repository.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ash_core::error::{ApiError, ApiResult};
use ash_core::ids::{SandboxId, SessionId, TenantId};
use ash_core::model::{SandboxRecord, SandboxState};
use ash_core::repository::Repository;
use ash_sandbox::{CreateOpts, ResourceLimits, SandboxManager};
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::entry::LiveEntry;
use crate::hooks::{EvictionHooks, RestoreHook};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_capacity: u64,
    pub idle_timeout: Duration,
    pub cold_ttl: Duration,
}

/// Inputs shared by `create` and `warm_up` for launching a fresh sandbox.
pub struct SpawnArgs {
    pub tenant: TenantId,
    pub agent_name: String,
    pub agent_dir: PathBuf,
    pub session_id: Option<SessionId>,
    pub limits: ResourceLimits,
    pub extra_env: HashMap<String, String>,
    pub allow_network: bool,
    pub runtime_binary: PathBuf,
}

pub struct Pool {
    repo: Arc<dyn Repository>,
    manager: Arc<SandboxManager>,
    hooks: Arc<dyn EvictionHooks>,
    config: PoolConfig,
    live: RwLock<HashMap<SandboxId, Arc<LiveEntry>>>,
    session_index: RwLock<HashMap<SessionId, SandboxId>>,
}

impl Pool {
    pub fn new(
        repo: Arc<dyn Repository>,
        manager: Arc<SandboxManager>,
        hooks: Arc<dyn EvictionHooks>,
        config: PoolConfig,
    ) -> Self {
        Self {
            repo,
            manager,
            hooks,
            config,
            live: RwLock::new(HashMap::new()),
            session_index: RwLock::new(HashMap::new()),
        }
    }

    /// Server-startup recovery: every non-cold record is a lost process.
    pub async fn recover_on_startup(&self) -> ApiResult<u64> {
        self.repo.mark_all_sandboxes_cold().await
    }

    pub fn get(&self, id: SandboxId) -> Option<Arc<LiveEntry>> {
        self.live.read().get(&id).cloned()
    }

    pub fn get_by_session(&self, session_id: SessionId) -> Option<Arc<LiveEntry>> {
        let id = *self.session_index.read().get(&session_id)?;
        self.get(id)
    }

    pub fn live_count(&self) -> u64 {
        self.live.read().len() as u64
    }

    /// Create exactly one isolated sandbox, register its DB row, and index it
    /// for `get`/`get_by_session`.
    pub async fn create(&self, args: SpawnArgs) -> ApiResult<Arc<LiveEntry>> {
        self.ensure_capacity(&args.tenant).await?;

        let id = SandboxId::new();
        let record = SandboxRecord {
            id,
            tenant_id: args.tenant.clone(),
            session_id: args.session_id,
            agent_name: args.agent_name.clone(),
            state: SandboxState::Warming,
            workspace_dir: String::new(),
            created_at: Utc::now(),
            last_used_at: Utc::now(),
            install_completed_at: None,
        };
        self.repo.insert_sandbox(record).await?;

        let create_result = self
            .manager
            .create(CreateOpts {
                agent_dir: args.agent_dir,
                session_id: args.session_id.unwrap_or_default(),
                tenant: args.tenant.to_string(),
                fixed_id: Some(id),
                resuming: false,
                limits: args.limits,
                extra_env: args.extra_env,
                allow_network: args.allow_network,
                runtime_binary: args.runtime_binary,
            })
            .await;

        let managed = match create_result {
            Ok(m) => m,
            Err(err) => {
                let _ = self.repo.delete_sandbox(&id).await;
                return Err(ApiError::SandboxCreateFailure(err.to_string()));
            }
        };

        self.repo
            .update_sandbox_state(&id, SandboxState::Warm)
            .await?;

        let bridge = self
            .manager
            .take_bridge(id)
            .map_err(|e| ApiError::BridgeProtocolError(e.to_string()))?;
        let (sender, receiver) = bridge.split();

        let entry = Arc::new(LiveEntry::new(
            id,
            args.tenant.clone(),
            args.agent_name,
            managed.workspace_dir,
            managed.socket_path,
            args.session_id,
            sender,
            receiver,
        ));

        if let Some(session_id) = args.session_id {
            self.repo.update_sandbox_session(&id, Some(session_id)).await?;
            self.session_index.write().insert(session_id, id);
        }

        self.live.write().insert(id, entry.clone());
        info!(sandbox_id = %id, "sandbox created");
        Ok(entry)
    }

    /// Cold resume: same shape as [`Pool::create`], but the workspace is
    /// populated by `restore` instead of copying the staged agent directory,
    /// and the manager is told `resuming: true` so it skips `install.sh`
    /// (mirrors `installCompletedAt` already having run once for this
    /// session). Returns the entry plus whether `restore` actually found a
    /// snapshot.
    pub async fn create_resuming(
        &self,
        args: SpawnArgs,
        restore: &dyn RestoreHook,
    ) -> ApiResult<(Arc<LiveEntry>, bool)> {
        self.ensure_capacity(&args.tenant).await?;

        let id = SandboxId::new();
        let record = SandboxRecord {
            id,
            tenant_id: args.tenant.clone(),
            session_id: args.session_id,
            agent_name: args.agent_name.clone(),
            state: SandboxState::Warming,
            workspace_dir: String::new(),
            created_at: Utc::now(),
            last_used_at: Utc::now(),
            install_completed_at: None,
        };
        self.repo.insert_sandbox(record).await?;

        let workspace_dir = self.manager.workspace_dir(id);
        tokio::fs::create_dir_all(&workspace_dir)
            .await
            .map_err(|e| ApiError::SandboxCreateFailure(e.to_string()))?;
        let session_id = args.session_id.unwrap_or_default();
        let restored = match restore.restore(session_id, &workspace_dir).await {
            Ok(restored) => restored,
            Err(err) => {
                let _ = self.repo.delete_sandbox(&id).await;
                return Err(err);
            }
        };

        let create_result = self
            .manager
            .create(CreateOpts {
                agent_dir: workspace_dir,
                session_id,
                tenant: args.tenant.to_string(),
                fixed_id: Some(id),
                resuming: true,
                limits: args.limits,
                extra_env: args.extra_env,
                allow_network: args.allow_network,
                runtime_binary: args.runtime_binary,
            })
            .await;

        let managed = match create_result {
            Ok(m) => m,
            Err(err) => {
                let _ = self.repo.delete_sandbox(&id).await;
                return Err(ApiError::SandboxCreateFailure(err.to_string()));
            }
        };

        self.repo
            .update_sandbox_state(&id, SandboxState::Warm)
            .await?;

        let bridge = self
            .manager
            .take_bridge(id)
            .map_err(|e| ApiError::BridgeProtocolError(e.to_string()))?;
        let (sender, receiver) = bridge.split();

        let entry = Arc::new(LiveEntry::new(
            id,
            args.tenant.clone(),
            args.agent_name,
            managed.workspace_dir,
            managed.socket_path,
            args.session_id,
            sender,
            receiver,
        ));

        if let Some(session_id) = args.session_id {
            self.repo.update_sandbox_session(&id, Some(session_id)).await?;
            self.session_index.write().insert(session_id, id);
        }

        self.live.write().insert(id, entry.clone());
        info!(sandbox_id = %id, restored, "sandbox resumed");
        Ok((entry, restored))
    }

    async fn ensure_capacity(&self, tenant: &TenantId) -> ApiResult<()> {
        if self.repo.count_sandboxes(tenant).await? < self.config.max_capacity {
            return Ok(());
        }
        if !self.evict_one(tenant).await? {
            return Err(ApiError::CapacityExhausted);
        }
        if self.repo.count_sandboxes(tenant).await? >= self.config.max_capacity {
            return Err(ApiError::CapacityExhausted);
        }
        Ok(())
    }

    /// Scan the live map for a pre-warmed sandbox matching `agent_name` with
    /// no bound session, and bind `session_id` to the first one found.
    pub async fn claim_warm(
        &self,
        agent_name: &str,
        session_id: SessionId,
    ) -> ApiResult<Option<Arc<LiveEntry>>> {
        let candidate = {
            let live = self.live.read();
            live.values()
                .find(|e| {
                    e.agent_name == agent_name
                        && e.session_id().is_none()
                        && e.state() == SandboxState::Warm
                })
                .cloned()
        };
        let Some(entry) = candidate else {
            return Ok(None);
        };

        entry.set_session_id(Some(session_id));
        entry.set_state(SandboxState::Waiting);
        entry.touch();
        self.repo
            .update_sandbox_session(&entry.sandbox_id, Some(session_id))
            .await?;
        self.repo
            .update_sandbox_state(&entry.sandbox_id, SandboxState::Waiting)
            .await?;
        self.session_index.write().insert(session_id, entry.sandbox_id);
        Ok(Some(entry))
    }

    /// Fire-and-forget per failure semantics: repo errors here are logged,
    /// not propagated, to avoid blocking the turn's hot path.
    pub async fn mark_running(&self, id: SandboxId) {
        if let Some(entry) = self.get(id) {
            entry.set_state(SandboxState::Running);
        }
        if let Err(err) = self.repo.update_sandbox_state(&id, SandboxState::Running).await {
            warn!(%err, sandbox_id = %id, "failed to persist running state");
        }
    }

    pub async fn mark_waiting(&self, id: SandboxId) {
        if let Some(entry) = self.get(id) {
            entry.set_state(SandboxState::Waiting);
            entry.touch();
        }
        if let Err(err) = self.repo.update_sandbox_state(&id, SandboxState::Waiting).await {
            warn!(%err, sandbox_id = %id, "failed to persist waiting state");
        }
        if let Err(err) = self.repo.touch_sandbox(&id).await {
            warn!(%err, sandbox_id = %id, "failed to touch sandbox");
        }
    }

    /// Eviction: cold (oldest) → warm (oldest) → waiting (oldest); running
    /// sandboxes are never picked by the repository query. Returns whether
    /// anything was evicted.
    pub async fn evict_one(&self, tenant: &TenantId) -> ApiResult<bool> {
        let Some(record) = self.repo.get_best_eviction_candidate(tenant).await? else {
            return Ok(false);
        };

        match record.state {
            SandboxState::Cold => {
                self.delete_cold_record(&record).await?;
            }
            SandboxState::Warm => {
                self.manager
                    .destroy(record.id)
                    .await
                    .map_err(|e| ApiError::Internal(e.into()))?;
                self.live.write().remove(&record.id);
                self.repo.delete_sandbox(&record.id).await?;
            }
            SandboxState::Waiting => {
                if let Some(session_id) = record.session_id {
                    self.hooks
                        .on_before_evict(session_id, record.id, record.workspace_dir.as_ref())
                        .await;
                }
                self.manager
                    .destroy(record.id)
                    .await
                    .map_err(|e| ApiError::Internal(e.into()))?;
                if let Some(entry) = self.live.write().remove(&record.id) {
                    if let Some(session_id) = entry.session_id() {
                        self.session_index.write().remove(&session_id);
                    }
                }
                self.repo
                    .update_sandbox_state(&record.id, SandboxState::Cold)
                    .await?;
            }
            SandboxState::Running | SandboxState::Warming => {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn delete_cold_record(&self, record: &SandboxRecord) -> ApiResult<()> {
        if !record.workspace_dir.is_empty() {
            let _ = tokio::fs::remove_dir_all(&record.workspace_dir).await;
        }
        self.repo.delete_sandbox(&record.id).await
    }

    /// Idle sweep: `waiting` sandboxes untouched past `idleTimeoutMs` are
    /// snapshotted and cold-evicted.
    pub async fn sweep_idle(&self) -> ApiResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.idle_timeout).unwrap_or_default();
        let idle = self.repo.get_idle_sandboxes(cutoff).await?;
        let mut evicted = 0usize;
        for record in idle {
            if record.state != SandboxState::Waiting {
                continue;
            }
            if let Some(session_id) = record.session_id {
                self.hooks
                    .on_before_evict(session_id, record.id, record.workspace_dir.as_ref())
                    .await;
            }
            if let Err(err) = self.manager.destroy(record.id).await {
                warn!(%err, sandbox_id = %record.id, "failed to destroy idle sandbox");
                continue;
            }
            if let Some(entry) = self.live.write().remove(&record.id) {
                if let Some(session_id) = entry.session_id() {
                    self.session_index.write().remove(&session_id);
                }
            }
            self.repo
                .update_sandbox_state(&record.id, SandboxState::Cold)
                .await?;
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Cold cleanup: cold rows older than `coldCleanupTtlMs` are deleted
    /// along with their on-disk workspace; cloud snapshots survive for future
    /// restore.
    pub async fn sweep_cold(&self) -> ApiResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.cold_ttl).unwrap_or_default();
        let cold = self.repo.get_cold_sandboxes(cutoff).await?;
        let mut deleted = 0usize;
        for record in cold {
            self.delete_cold_record(&record).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Pre-create up to `count` unbound sandboxes for `agent_name`,
    /// respecting capacity.
    pub async fn warm_up(&self, mut args: SpawnArgs, count: u32) -> ApiResult<usize> {
        args.session_id = None;
        let mut created = 0usize;
        for _ in 0..count {
            if self.repo.count_sandboxes(&args.tenant).await? >= self.config.max_capacity {
                break;
            }
            let spawn = SpawnArgs {
                tenant: args.tenant.clone(),
                agent_name: args.agent_name.clone(),
                agent_dir: args.agent_dir.clone(),
                session_id: None,
                limits: args.limits.clone(),
                extra_env: args.extra_env.clone(),
                allow_network: args.allow_network,
                runtime_binary: args.runtime_binary.clone(),
            };
            self.create(spawn).await?;
            created += 1;
        }
        Ok(created)
    }

    /// Explicit destroy (session `end`): deletes the sandbox row outright
    /// since an ended session is never resumed.
    pub async fn destroy(&self, id: SandboxId) -> ApiResult<()> {
        if let Some(entry) = self.live.write().remove(&id) {
            if let Some(session_id) = entry.session_id() {
                self.session_index.write().remove(&session_id);
            }
        }
        self.manager
            .destroy(id)
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;
        self.repo.delete_sandbox(&id).await
    }

    /// Run a command inside the live sandbox's isolation boundary — routed
    /// through the manager/backend rather than the host, so cross-sandbox
    /// filesystem isolation (spec.md §8 scenario 2) actually holds for `exec`.
    pub async fn exec(
        &self,
        id: SandboxId,
        command: &str,
        timeout: std::time::Duration,
    ) -> ApiResult<ash_sandbox::ExecOutput> {
        self.manager
            .exec(id, command, timeout)
            .await
            .map_err(|e| ApiError::Internal(e.into()))
    }

    /// Installed once at startup; routes unexpected process exits (crash, OOM
    /// kill) into the same cold transition an explicit eviction takes.
    pub fn install_process_exit_hook(self: &Arc<Self>) {
        let pool = self.clone();
        self.manager.set_oom_callback(Arc::new(move |id| {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.handle_process_exit(id).await;
            });
        }));
    }

    async fn handle_process_exit(&self, id: SandboxId) {
        if let Some(entry) = self.live.write().remove(&id) {
            if let Some(session_id) = entry.session_id() {
                self.session_index.write().remove(&session_id);
            }
        }
        if let Err(err) = self.repo.update_sandbox_state(&id, SandboxState::Cold).await {
            warn!(%err, sandbox_id = %id, "failed to mark crashed sandbox cold");
        }
    }
}
