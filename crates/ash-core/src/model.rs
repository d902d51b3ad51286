//! The data model from: Tenant-scoped records shared by the pool,
//! orchestrator, coordinator, and repository layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AgentId, RunnerId, SandboxId, SessionId, TenantId};

/// A staged agent directory, registered by name+version. Invariant:
/// `(tenantId, name)` is unique. Redeploying the same name bumps `version`
/// and updates `path`/`updatedAt`; `id` is stable across redeploys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: AgentId,
    pub tenant_id: TenantId,
    pub name: String,
    pub version: i64,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Active,
    Paused,
    Ended,
    Error,
}

impl SessionStatus {
    /// `ended` is the only terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Ended)
    }
}

/// Per-message/per-session option overrides, applied with precedence
/// per-message > session > agent record > agent settings file > engine
/// default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub betas: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub tenant_id: TenantId,
    pub agent_name: String,
    pub sandbox_id: Option<SandboxId>,
    pub status: SessionStatus,
    pub runner_id: Option<RunnerId>,
    pub parent_session_id: Option<SessionId>,
    pub model: Option<String>,
    pub config: Option<SessionConfig>,
    /// Incremented on every completed turn, for accounting only. Whether the
    /// next bridge `query` carries `resume:true` is a property of the live
    /// sandbox process (`LiveEntry::has_handled_query`), not of this count:
    /// a cold resume starts a process with no last-session-id in memory even
    /// though the session's own turn count is nonzero.
    pub turn_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Warming,
    Warm,
    Waiting,
    Running,
    Cold,
}

impl SandboxState {
    /// Whether a live `ManagedSandbox` is expected to exist for a record in
    /// this state.
    pub fn expects_live_process(self) -> bool {
        !matches!(self, SandboxState::Cold)
    }
}

/// The pool's persisted view of a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRecord {
    pub id: SandboxId,
    pub tenant_id: TenantId,
    pub session_id: Option<SessionId>,
    pub agent_name: String,
    pub state: SandboxState,
    pub workspace_dir: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// Set once `install.sh` has completed for this sandbox's workspace;
    /// resume paths use this to avoid re-running it.
    pub install_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: uuid::Uuid,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub role: MessageRole,
    pub content: Value,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub id: uuid::Uuid,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub event_type: String,
    pub data: Value,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runner {
    pub id: RunnerId,
    pub host: String,
    pub port: u16,
    pub max_sandboxes: u32,
    pub active_count: u32,
    pub warming_count: u32,
    pub last_heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl Runner {
    pub fn is_healthy(&self, now: DateTime<Utc>, heartbeat_timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat_at < heartbeat_timeout
    }

    /// `maxSandboxes − activeCount − warmingCount`.
    pub fn available_capacity(&self) -> i64 {
        self.max_sandboxes as i64 - self.active_count as i64 - self.warming_count as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: uuid::Uuid,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub key: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: uuid::Uuid,
    pub tenant_id: TenantId,
    pub name: String,
    pub encrypted_value: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: uuid::Uuid,
    pub tenant_id: TenantId,
    pub key_hash: String,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: uuid::Uuid,
    pub tenant_id: TenantId,
    pub queue_name: String,
    pub payload: Value,
    pub status: QueueItemStatus,
    pub created_at: DateTime<Utc>,
}

/// Accounting row derived from bridge `event` payload fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub id: uuid::Uuid,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub query_id: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}
