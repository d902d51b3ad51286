//! Exercises the Pool's eviction priority and sweep behavior against an
//! in-memory fake repository — no real sandbox process needed since none of
//! these records have a live entry (mirrors 's "cold (oldest lastUsedAt
//! first) → warm (oldest) → waiting (oldest)" ordering, and "running
//! sandboxes are never evicted by this path").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ash_core::error::ApiResult;
use ash_core::ids::{RunnerId, SandboxId, SessionId, TenantId};
use ash_core::model::{
    Agent, Message, MessageRole, Runner, SandboxRecord, SandboxState, Session, SessionConfig,
    SessionEvent, SessionStatus,
};
use ash_core::repository::{
    AgentRepository, EventRepository, MessageRepository, RunnerRepository, SandboxRepository,
    SessionRepository,
};
use ash_pool::{NoopEvictionHooks, Pool, PoolConfig};
use ash_sandbox::backend::RlimitOnlyBackend;
use ash_sandbox::SandboxManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Default)]
struct FakeRepo {
    sandboxes: Mutex<HashMap<SandboxId, SandboxRecord>>,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

#[async_trait]
impl AgentRepository for FakeRepo {
    async fn upsert_agent(&self, _tenant: &TenantId, _name: &str, _path: &str) -> ApiResult<Agent> {
        unimplemented!("not exercised by these tests")
    }
    async fn get_agent(&self, _tenant: &TenantId, _name: &str) -> ApiResult<Option<Agent>> {
        Ok(None)
    }
    async fn list_agents(&self, _tenant: &TenantId) -> ApiResult<Vec<Agent>> {
        Ok(vec![])
    }
    async fn delete_agent(&self, _tenant: &TenantId, _name: &str) -> ApiResult<()> {
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for FakeRepo {
    async fn insert_session(&self, session: Session) -> ApiResult<Session> {
        self.sessions.lock().insert(session.id, session.clone());
        Ok(session)
    }
    async fn insert_forked_session(&self, parent: &Session, new_id: SessionId) -> ApiResult<Session> {
        let mut forked = parent.clone();
        forked.id = new_id;
        self.sessions.lock().insert(new_id, forked.clone());
        Ok(forked)
    }
    async fn update_session_status(&self, id: &SessionId, status: SessionStatus) -> ApiResult<()> {
        if let Some(s) = self.sessions.lock().get_mut(id) {
            s.status = status;
        }
        Ok(())
    }
    async fn update_session_sandbox(&self, id: &SessionId, sandbox_id: Option<SandboxId>) -> ApiResult<()> {
        if let Some(s) = self.sessions.lock().get_mut(id) {
            s.sandbox_id = sandbox_id;
        }
        Ok(())
    }
    async fn update_session_runner(&self, _id: &SessionId, _runner_id: Option<RunnerId>) -> ApiResult<()> {
        Ok(())
    }
    async fn update_session_config(
        &self,
        _id: &SessionId,
        _model: Option<String>,
        _config: Option<SessionConfig>,
    ) -> ApiResult<()> {
        Ok(())
    }
    async fn increment_turn_count(&self, id: &SessionId) -> ApiResult<()> {
        if let Some(s) = self.sessions.lock().get_mut(id) {
            s.turn_count += 1;
        }
        Ok(())
    }
    async fn get_session(&self, id: &SessionId) -> ApiResult<Option<Session>> {
        Ok(self.sessions.lock().get(id).cloned())
    }
    async fn list_sessions(&self, _tenant: &TenantId, _agent_name: Option<&str>) -> ApiResult<Vec<Session>> {
        Ok(self.sessions.lock().values().cloned().collect())
    }
    async fn list_sessions_by_runner(&self, _runner: &RunnerId) -> ApiResult<Vec<Session>> {
        Ok(vec![])
    }
    async fn bulk_pause_sessions_by_runner(&self, _runner: &RunnerId) -> ApiResult<u64> {
        Ok(0)
    }
    async fn touch_session(&self, _id: &SessionId) -> ApiResult<()> {
        Ok(())
    }
}

#[async_trait]
impl SandboxRepository for FakeRepo {
    async fn insert_sandbox(&self, record: SandboxRecord) -> ApiResult<SandboxRecord> {
        self.sandboxes.lock().insert(record.id, record.clone());
        Ok(record)
    }
    async fn update_sandbox_state(&self, id: &SandboxId, state: SandboxState) -> ApiResult<()> {
        if let Some(r) = self.sandboxes.lock().get_mut(id) {
            r.state = state;
        }
        Ok(())
    }
    async fn update_sandbox_session(&self, id: &SandboxId, session_id: Option<SessionId>) -> ApiResult<()> {
        if let Some(r) = self.sandboxes.lock().get_mut(id) {
            r.session_id = session_id;
        }
        Ok(())
    }
    async fn touch_sandbox(&self, _id: &SandboxId) -> ApiResult<()> {
        Ok(())
    }
    async fn get_sandbox(&self, id: &SandboxId) -> ApiResult<Option<SandboxRecord>> {
        Ok(self.sandboxes.lock().get(id).cloned())
    }
    async fn count_sandboxes(&self, tenant: &TenantId) -> ApiResult<u64> {
        Ok(self
            .sandboxes
            .lock()
            .values()
            .filter(|r| &r.tenant_id == tenant)
            .count() as u64)
    }
    async fn get_best_eviction_candidate(&self, tenant: &TenantId) -> ApiResult<Option<SandboxRecord>> {
        let sandboxes = self.sandboxes.lock();
        let mut candidates: Vec<&SandboxRecord> = sandboxes
            .values()
            .filter(|r| &r.tenant_id == tenant && r.state != SandboxState::Running)
            .collect();
        candidates.sort_by_key(|r| (priority(r.state), r.last_used_at));
        Ok(candidates.first().map(|r| (*r).clone()))
    }
    async fn get_idle_sandboxes(&self, older_than: DateTime<Utc>) -> ApiResult<Vec<SandboxRecord>> {
        Ok(self
            .sandboxes
            .lock()
            .values()
            .filter(|r| r.state == SandboxState::Waiting && r.last_used_at < older_than)
            .cloned()
            .collect())
    }
    async fn get_cold_sandboxes(&self, older_than: DateTime<Utc>) -> ApiResult<Vec<SandboxRecord>> {
        Ok(self
            .sandboxes
            .lock()
            .values()
            .filter(|r| r.state == SandboxState::Cold && r.last_used_at < older_than)
            .cloned()
            .collect())
    }
    async fn delete_sandbox(&self, id: &SandboxId) -> ApiResult<()> {
        self.sandboxes.lock().remove(id);
        Ok(())
    }
    async fn mark_all_sandboxes_cold(&self) -> ApiResult<u64> {
        let mut sandboxes = self.sandboxes.lock();
        let mut count = 0;
        for r in sandboxes.values_mut() {
            if r.state != SandboxState::Cold {
                r.state = SandboxState::Cold;
                count += 1;
            }
        }
        Ok(count)
    }
    async fn find_claimable_warm(&self, _tenant: &TenantId, _agent_name: &str) -> ApiResult<Option<SandboxRecord>> {
        Ok(None)
    }
}

fn priority(state: SandboxState) -> u8 {
    match state {
        SandboxState::Cold => 0,
        SandboxState::Warm => 1,
        SandboxState::Waiting => 2,
        SandboxState::Warming | SandboxState::Running => 3,
    }
}

#[async_trait]
impl MessageRepository for FakeRepo {
    async fn append_message(
        &self,
        _tenant: &TenantId,
        _session: &SessionId,
        _role: MessageRole,
        _content: serde_json::Value,
    ) -> ApiResult<Message> {
        unimplemented!("not exercised by these tests")
    }
    async fn list_messages(&self, _session: &SessionId) -> ApiResult<Vec<Message>> {
        Ok(vec![])
    }
    async fn copy_messages(&self, _tenant: &TenantId, _from: &SessionId, _to: &SessionId) -> ApiResult<()> {
        Ok(())
    }
}

#[async_trait]
impl EventRepository for FakeRepo {
    async fn append_event(
        &self,
        _tenant: &TenantId,
        _session: &SessionId,
        _event_type: &str,
        _data: serde_json::Value,
    ) -> ApiResult<SessionEvent> {
        unimplemented!("not exercised by these tests")
    }
    async fn list_events(&self, _session: &SessionId) -> ApiResult<Vec<SessionEvent>> {
        Ok(vec![])
    }
}

#[async_trait]
impl RunnerRepository for FakeRepo {
    async fn upsert_runner(&self, _host: &str, _port: u16, _max_sandboxes: u32) -> ApiResult<Runner> {
        unimplemented!("not exercised by these tests")
    }
    async fn heartbeat_runner(&self, _id: &RunnerId, _active_count: u32, _warming_count: u32) -> ApiResult<()> {
        Ok(())
    }
    async fn get_runner(&self, _id: &RunnerId) -> ApiResult<Option<Runner>> {
        Ok(None)
    }
    async fn list_healthy_runners(&self, _cutoff: DateTime<Utc>) -> ApiResult<Vec<Runner>> {
        Ok(vec![])
    }
    async fn list_dead_runners(&self, _cutoff: DateTime<Utc>) -> ApiResult<Vec<Runner>> {
        Ok(vec![])
    }
    async fn select_best_runner(&self, _cutoff: DateTime<Utc>) -> ApiResult<Option<Runner>> {
        Ok(None)
    }
    async fn delete_runner(&self, _id: &RunnerId) -> ApiResult<()> {
        Ok(())
    }
    async fn list_all_runners(&self) -> ApiResult<Vec<Runner>> {
        Ok(vec![])
    }
}

fn record(tenant: &TenantId, state: SandboxState, last_used_at: DateTime<Utc>) -> SandboxRecord {
    SandboxRecord {
        id: SandboxId::new(),
        tenant_id: tenant.clone(),
        session_id: if state == SandboxState::Waiting {
            Some(SessionId::new())
        } else {
            None
        },
        agent_name: "demo".into(),
        state,
        workspace_dir: String::new(),
        created_at: last_used_at,
        last_used_at,
        install_completed_at: None,
    }
}

fn test_pool() -> (Pool, TenantId, Arc<FakeRepo>) {
    let tenant = TenantId::from("acme");
    let repo = Arc::new(FakeRepo::default());
    let manager = Arc::new(SandboxManager::with_backend(
        std::env::temp_dir(),
        Box::new(RlimitOnlyBackend),
    ));
    let config = PoolConfig {
        max_capacity: 10,
        idle_timeout: Duration::from_secs(60),
        cold_ttl: Duration::from_secs(60),
    };
    let pool = Pool::new(repo.clone(), manager, Arc::new(NoopEvictionHooks), config);
    (pool, tenant, repo)
}

#[tokio::test]
async fn eviction_prefers_cold_then_warm_then_waiting() {
    let (pool, tenant, repo) = test_pool();
    let now = Utc::now();

    let running = record(&tenant, SandboxState::Running, now - chrono::Duration::hours(5));
    let waiting = record(&tenant, SandboxState::Waiting, now - chrono::Duration::hours(3));
    let warm = record(&tenant, SandboxState::Warm, now - chrono::Duration::hours(2));
    let cold = record(&tenant, SandboxState::Cold, now - chrono::Duration::hours(1));

    for r in [&running, &waiting, &warm, &cold] {
        repo.insert_sandbox(r.clone()).await.unwrap();
    }

    assert!(pool.evict_one(&tenant).await.unwrap());
    assert!(repo.get_sandbox(&cold.id).await.unwrap().is_none(), "cold record deleted first");

    assert!(pool.evict_one(&tenant).await.unwrap());
    assert!(repo.get_sandbox(&warm.id).await.unwrap().is_none(), "warm record deleted second");

    assert!(pool.evict_one(&tenant).await.unwrap());
    let waiting_after = repo.get_sandbox(&waiting.id).await.unwrap().unwrap();
    assert_eq!(waiting_after.state, SandboxState::Cold, "waiting record cold-evicted, not deleted");

    // Only the running sandbox remains, and the eviction path never touches it.
    assert!(!pool.evict_one(&tenant).await.unwrap());
    assert!(repo.get_sandbox(&running.id).await.unwrap().is_some());
}

#[tokio::test]
async fn sweep_cold_deletes_rows_past_ttl() {
    let (pool, tenant, repo) = test_pool();
    let now = Utc::now();
    let stale = record(&tenant, SandboxState::Cold, now - chrono::Duration::hours(10));
    let fresh = record(&tenant, SandboxState::Cold, now);
    repo.insert_sandbox(stale.clone()).await.unwrap();
    repo.insert_sandbox(fresh.clone()).await.unwrap();

    let deleted = pool.sweep_cold().await.unwrap();

    assert_eq!(deleted, 1);
    assert!(repo.get_sandbox(&stale.id).await.unwrap().is_none());
    assert!(repo.get_sandbox(&fresh.id).await.unwrap().is_some());
}

#[tokio::test]
async fn ensure_capacity_fails_when_nothing_can_be_evicted() {
    let tenant = TenantId::from("acme");
    let repo = Arc::new(FakeRepo::default());
    let manager = Arc::new(SandboxManager::with_backend(
        std::env::temp_dir(),
        Box::new(RlimitOnlyBackend),
    ));
    let config = PoolConfig {
        max_capacity: 1,
        idle_timeout: Duration::from_secs(60),
        cold_ttl: Duration::from_secs(60),
    };
    let pool = Pool::new(repo.clone(), manager, Arc::new(NoopEvictionHooks), config);

    let running = record(&tenant, SandboxState::Running, Utc::now());
    repo.insert_sandbox(running).await.unwrap();

    let err = pool
        .create(ash_pool::SpawnArgs {
            tenant: tenant.clone(),
            agent_name: "demo".into(),
            agent_dir: std::env::temp_dir(),
            session_id: None,
            limits: ash_sandbox::ResourceLimits::default(),
            extra_env: HashMap::new(),
            allow_network: false,
            runtime_binary: std::env::temp_dir().join("does-not-exist"),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ash_core::error::ApiError::CapacityExhausted));
}
