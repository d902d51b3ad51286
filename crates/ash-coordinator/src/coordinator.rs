//! Coordinator-mode node state: runner registration/heartbeat bookkeeping and
//! the best-runner selection `ash-orchestrator`'s `Pool::claim_warm`/`create`
//! play on a single-node deployment. A coordinator owns no `Pool` itself —
//! every sandbox lives on some runner, reached through [`crate::proxy`].

use std::sync::Arc;
use std::time::Duration;

use ash_core::error::ApiResult;
use ash_core::ids::RunnerId;
use ash_core::model::Runner;
use ash_core::repository::Repository;
use chrono::Utc;
use tracing::{info, warn};

use crate::error::CoordinatorError;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub heartbeat_timeout: Duration,
    pub health_sweep_interval: Duration,
}

pub struct Coordinator {
    repo: Arc<dyn Repository>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(repo: Arc<dyn Repository>, config: CoordinatorConfig) -> Self {
        Self { repo, config }
    }

    pub async fn register_runner(
        &self,
        host: &str,
        port: u16,
        max_sandboxes: u32,
    ) -> ApiResult<Runner> {
        let runner = self.repo.upsert_runner(host, port, max_sandboxes).await?;
        info!(runner_id = %runner.id, host, port, max_sandboxes, "runner registered");
        Ok(runner)
    }

    pub async fn heartbeat(
        &self,
        id: RunnerId,
        active_count: u32,
        warming_count: u32,
    ) -> ApiResult<()> {
        self.repo
            .get_runner(&id)
            .await?
            .ok_or_else(|| CoordinatorError::RunnerNotFound(id.to_string()))?;
        self.repo.heartbeat_runner(&id, active_count, warming_count).await
    }

    pub async fn deregister(&self, id: RunnerId) -> ApiResult<()> {
        self.repo.delete_runner(&id).await
    }

    pub async fn list_runners(&self) -> ApiResult<Vec<Runner>> {
        self.repo.list_all_runners().await
    }

    pub async fn get_runner(&self, id: RunnerId) -> ApiResult<Runner> {
        self.repo
            .get_runner(&id)
            .await?
            .ok_or_else(|| CoordinatorError::RunnerNotFound(id.to_string()).into())
    }

    fn heartbeat_cutoff(&self) -> chrono::DateTime<Utc> {
        Utc::now()
            - chrono::Duration::from_std(self.config.heartbeat_timeout).unwrap_or_default()
    }

    /// Most available capacity among runners that heartbeated within the
    /// timeout; `NoRunnerAvailable` if none qualify.
    pub async fn select_best_runner(&self) -> ApiResult<Runner> {
        self.repo
            .select_best_runner(self.heartbeat_cutoff())
            .await?
            .ok_or_else(|| CoordinatorError::NoRunnerAvailable.into())
    }

    /// Re-validate that `runner_id` is still healthy before reusing it as a
    /// resume target; a session's `runnerId` hint is not trusted blindly.
    pub async fn healthy_runner(&self, id: RunnerId) -> ApiResult<Option<Runner>> {
        let Some(runner) = self.repo.get_runner(&id).await? else {
            return Ok(None);
        };
        if runner.is_healthy(Utc::now(), chrono::Duration::from_std(self.config.heartbeat_timeout).unwrap_or_default()) {
            Ok(Some(runner))
        } else {
            Ok(None)
        }
    }

    /// Background loop: every `health_sweep_interval`, find runners that
    /// missed `heartbeatTimeout` and pause every session they were running.
    /// Installed once at startup in every coordinator-mode process.
    pub fn spawn_health_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.health_sweep_interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep_dead_runners().await {
                    warn!(%err, "health sweep failed");
                }
            }
        });
    }

    async fn sweep_dead_runners(&self) -> ApiResult<()> {
        let dead = self.repo.list_dead_runners(self.heartbeat_cutoff()).await?;
        for runner in dead {
            let paused = self.repo.bulk_pause_sessions_by_runner(&runner.id).await?;
            warn!(runner_id = %runner.id, paused, "runner missed heartbeat deadline, sessions paused and runner deregistered");
            // Dead runners are dropped from the registry rather than left
            // lingering: a runner that comes back re-registers with a fresh
            // id, and `GET /api/internal/runners` should stop listing a
            // runner nothing is routing to.
            self.repo.delete_runner(&runner.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash_core::ids::TenantId;
    use ash_core::model::{Session, SessionStatus};
    use ash_core::repository::{RunnerRepository, SessionRepository};

    async fn test_coordinator() -> (Coordinator, Arc<dyn Repository>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let repo = ash_storage::open_sqlite(&dir.path().join("ash.db")).await.unwrap();
        let coordinator = Coordinator::new(
            repo.clone(),
            CoordinatorConfig {
                heartbeat_timeout: Duration::from_millis(1),
                health_sweep_interval: Duration::from_secs(3600),
            },
        );
        (coordinator, repo, dir)
    }

    #[tokio::test]
    async fn dead_runner_is_deregistered_and_its_sessions_paused() {
        let (coordinator, repo, _dir) = test_coordinator().await;
        let runner = coordinator.register_runner("10.0.0.1", 9000, 4).await.unwrap();

        let tenant = TenantId::default();
        let now = Utc::now();
        let session = Session {
            id: ash_core::ids::SessionId::new(),
            tenant_id: tenant.clone(),
            agent_name: "demo".to_string(),
            sandbox_id: None,
            status: SessionStatus::Active,
            runner_id: Some(runner.id),
            parent_session_id: None,
            model: None,
            config: None,
            turn_count: 0,
            created_at: now,
            last_active_at: now,
        };
        repo.insert_session(session.clone()).await.unwrap();

        // `heartbeat_timeout` is 1ms above; the registration timestamp is
        // already past it by the time we sweep.
        tokio::time::sleep(Duration::from_millis(20)).await;

        coordinator.sweep_dead_runners().await.unwrap();

        assert!(coordinator.get_runner(runner.id).await.is_err());
        assert!(coordinator.list_runners().await.unwrap().is_empty());

        let updated = repo.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(updated.status, SessionStatus::Paused);
    }
}
