//! Repository trait interfaces for domain entities. One interface per
//! grouping, the same shape `querymt-agent`'s `session/repository.rs` uses
//! for its `SessionRepository`/`TaskRepository` split. An implementation
//! (embedded single-writer or concurrent SQL, see `ash-storage`) must satisfy
//! all of them identically; only the concurrency discipline behind each call
//! differs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ApiResult;
use crate::ids::{RunnerId, SandboxId, SessionId, TenantId};
use crate::model::{
    Agent, Message, MessageRole, Runner, SandboxRecord, SandboxState, Session, SessionConfig,
    SessionEvent, SessionStatus,
};

#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Idempotent on `(tenantId, name)`; bumps `version`, keeps `id` stable.
    async fn upsert_agent(&self, tenant: &TenantId, name: &str, path: &str) -> ApiResult<Agent>;
    async fn get_agent(&self, tenant: &TenantId, name: &str) -> ApiResult<Option<Agent>>;
    async fn list_agents(&self, tenant: &TenantId) -> ApiResult<Vec<Agent>>;
    async fn delete_agent(&self, tenant: &TenantId, name: &str) -> ApiResult<()>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert_session(&self, session: Session) -> ApiResult<Session>;

    /// Atomic: insert the forked session row and copy the parent's messages
    /// under the new session id, preserving `(role, content, sequence)`.
    async fn insert_forked_session(
        &self,
        parent: &Session,
        new_id: SessionId,
    ) -> ApiResult<Session>;

    async fn update_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
    ) -> ApiResult<()>;
    async fn update_session_sandbox(
        &self,
        id: &SessionId,
        sandbox_id: Option<SandboxId>,
    ) -> ApiResult<()>;
    async fn update_session_runner(
        &self,
        id: &SessionId,
        runner_id: Option<RunnerId>,
    ) -> ApiResult<()>;
    async fn update_session_config(
        &self,
        id: &SessionId,
        model: Option<String>,
        config: Option<SessionConfig>,
    ) -> ApiResult<()>;
    async fn increment_turn_count(&self, id: &SessionId) -> ApiResult<()>;

    async fn get_session(&self, id: &SessionId) -> ApiResult<Option<Session>>;
    async fn list_sessions(
        &self,
        tenant: &TenantId,
        agent_name: Option<&str>,
    ) -> ApiResult<Vec<Session>>;
    async fn list_sessions_by_runner(&self, runner: &RunnerId) -> ApiResult<Vec<Session>>;

    /// Moves every `starting`/`active` session owned by `runner` to `paused`;
    /// returns the count moved.
    async fn bulk_pause_sessions_by_runner(&self, runner: &RunnerId) -> ApiResult<u64>;

    async fn touch_session(&self, id: &SessionId) -> ApiResult<()>;
}

#[async_trait]
pub trait SandboxRepository: Send + Sync {
    async fn insert_sandbox(&self, record: SandboxRecord) -> ApiResult<SandboxRecord>;
    async fn update_sandbox_state(&self, id: &SandboxId, state: SandboxState) -> ApiResult<()>;
    async fn update_sandbox_session(
        &self,
        id: &SandboxId,
        session_id: Option<SessionId>,
    ) -> ApiResult<()>;
    async fn touch_sandbox(&self, id: &SandboxId) -> ApiResult<()>;
    async fn get_sandbox(&self, id: &SandboxId) -> ApiResult<Option<SandboxRecord>>;
    async fn count_sandboxes(&self, tenant: &TenantId) -> ApiResult<u64>;

    /// cold (oldest first) → warm (oldest) → waiting (oldest); never returns
    /// a `running` sandbox.
    async fn get_best_eviction_candidate(
        &self,
        tenant: &TenantId,
    ) -> ApiResult<Option<SandboxRecord>>;

    async fn get_idle_sandboxes(&self, older_than: DateTime<Utc>) -> ApiResult<Vec<SandboxRecord>>;
    async fn get_cold_sandboxes(&self, older_than: DateTime<Utc>) -> ApiResult<Vec<SandboxRecord>>;
    async fn delete_sandbox(&self, id: &SandboxId) -> ApiResult<()>;

    /// Startup recovery: every non-cold record becomes cold (lost
    /// processes). Idempotent on re-run. Returns the count transitioned.
    async fn mark_all_sandboxes_cold(&self) -> ApiResult<u64>;

    /// Find a pre-warmed, unclaimed, live sandbox for `agent_name`
    /// (`state == warm`, `session_id IS NULL`) to satisfy `claimWarm`.
    async fn find_claimable_warm(
        &self,
        tenant: &TenantId,
        agent_name: &str,
    ) -> ApiResult<Option<SandboxRecord>>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Assigns the next dense sequence number under a per-session
    /// serialization guarantee: `MAX+1` in a transaction on an ordered
    /// single-writer store, or a single atomic `INSERT... VALUES
    /// (COALESCE(MAX(sequence), 0) + 1,...)` on a concurrent store, retried
    /// on a unique-constraint collision.
    async fn append_message(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        role: MessageRole,
        content: serde_json::Value,
    ) -> ApiResult<Message>;

    async fn list_messages(&self, session: &SessionId) -> ApiResult<Vec<Message>>;

    /// Used by fork: copy every parent message under `new_session`,
    /// preserving `(role, content, sequence)` with new message ids.
    async fn copy_messages(
        &self,
        tenant: &TenantId,
        from: &SessionId,
        to: &SessionId,
    ) -> ApiResult<()>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn append_event(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        event_type: &str,
        data: serde_json::Value,
    ) -> ApiResult<SessionEvent>;

    async fn list_events(&self, session: &SessionId) -> ApiResult<Vec<SessionEvent>>;
}

#[async_trait]
pub trait RunnerRepository: Send + Sync {
    async fn upsert_runner(&self, host: &str, port: u16, max_sandboxes: u32) -> ApiResult<Runner>;
    async fn heartbeat_runner(
        &self,
        id: &RunnerId,
        active_count: u32,
        warming_count: u32,
    ) -> ApiResult<()>;
    async fn get_runner(&self, id: &RunnerId) -> ApiResult<Option<Runner>>;

    /// Healthy iff `lastHeartbeatAt > now - heartbeatTimeout`.
    async fn list_healthy_runners(&self, cutoff: DateTime<Utc>) -> ApiResult<Vec<Runner>>;
    async fn list_dead_runners(&self, cutoff: DateTime<Utc>) -> ApiResult<Vec<Runner>>;

    /// Most available capacity first.
    async fn select_best_runner(&self, cutoff: DateTime<Utc>) -> ApiResult<Option<Runner>>;

    async fn delete_runner(&self, id: &RunnerId) -> ApiResult<()>;
    async fn list_all_runners(&self) -> ApiResult<Vec<Runner>>;
}

/// Composition of every grouping — what a concrete backend (embedded or
/// concurrent SQL) implements in full, and what the orchestrator/pool/
/// coordinator hold a single `Arc<dyn Repository>` to.
pub trait Repository:
    AgentRepository + SessionRepository + SandboxRepository + MessageRepository + EventRepository
    + RunnerRepository + Send + Sync
{
}

impl<T> Repository for T where
    T: AgentRepository + SessionRepository + SandboxRepository + MessageRepository
        + EventRepository + RunnerRepository + Send + Sync
{
}
