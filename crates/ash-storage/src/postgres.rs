//! Concurrent backend for coordinator-mode fleets: `sqlx::PgPool`, no
//! connection-level mutex. Dense sequence assignment can't rely on a single
//! writer serializing access, so it's a single atomic `INSERT... VALUES
//! (COALESCE(MAX(sequence), 0) + 1,...)` with a retry loop on the
//! `(tenant_id, session_id, sequence)` unique-constraint collision.

use async_trait::async_trait;
use ash_core::error::{ApiError, ApiResult};
use ash_core::ids::{AgentId, RunnerId, SandboxId, SessionId, TenantId};
use ash_core::model::{
    Agent, Message, MessageRole, Runner, SandboxRecord, SandboxState, Session, SessionConfig,
    SessionEvent, SessionStatus,
};
use ash_core::repository::{
    AgentRepository, EventRepository, MessageRepository, RunnerRepository, SandboxRepository,
    SessionRepository,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::error::StorageError;
use crate::migrations::MIGRATIONS;

const MAX_SEQUENCE_RETRIES: u32 = 5;

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn run_migrations(pool: &PgPool) -> Result<(), StorageError> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_migrations (name TEXT PRIMARY KEY, applied_at TIMESTAMPTZ NOT NULL)")
        .execute(pool)
        .await?;
    for migration in MIGRATIONS {
        let already: Option<(String,)> =
            sqlx::query_as("SELECT name FROM schema_migrations WHERE name = $1")
                .bind(migration.name)
                .fetch_optional(pool)
                .await?;
        if already.is_some() {
            continue;
        }
        sqlx::raw_sql(migration.postgres)
            .execute(pool)
            .await
            .map_err(|e| StorageError::Migration(migration.name, e.to_string()))?;
        sqlx::query("INSERT INTO schema_migrations (name, applied_at) VALUES ($1, now())")
            .bind(migration.name)
            .execute(pool)
            .await?;
    }
    Ok(())
}

fn session_status_to_str(s: SessionStatus) -> &'static str {
    match s {
        SessionStatus::Starting => "starting",
        SessionStatus::Active => "active",
        SessionStatus::Paused => "paused",
        SessionStatus::Ended => "ended",
        SessionStatus::Error => "error",
    }
}

fn session_status_from_str(s: &str) -> SessionStatus {
    match s {
        "active" => SessionStatus::Active,
        "paused" => SessionStatus::Paused,
        "ended" => SessionStatus::Ended,
        "error" => SessionStatus::Error,
        _ => SessionStatus::Starting,
    }
}

fn sandbox_state_to_str(s: SandboxState) -> &'static str {
    match s {
        SandboxState::Warming => "warming",
        SandboxState::Warm => "warm",
        SandboxState::Waiting => "waiting",
        SandboxState::Running => "running",
        SandboxState::Cold => "cold",
    }
}

fn sandbox_state_from_str(s: &str) -> SandboxState {
    match s {
        "warm" => SandboxState::Warm,
        "waiting" => SandboxState::Waiting,
        "running" => SandboxState::Running,
        "cold" => SandboxState::Cold,
        _ => SandboxState::Warming,
    }
}

fn agent_from_row(row: &sqlx::postgres::PgRow) -> Result<Agent, sqlx::Error> {
    Ok(Agent {
        id: AgentId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        path: row.try_get("path")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn session_from_row(row: &sqlx::postgres::PgRow) -> Result<Session, sqlx::Error> {
    let config: Option<serde_json::Value> = row.try_get("config")?;
    Ok(Session {
        id: SessionId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        agent_name: row.try_get("agent_name")?,
        sandbox_id: row.try_get::<Option<uuid::Uuid>, _>("sandbox_id")?.map(SandboxId),
        status: session_status_from_str(row.try_get::<String, _>("status")?.as_str()),
        runner_id: row.try_get::<Option<uuid::Uuid>, _>("runner_id")?.map(RunnerId),
        parent_session_id: row
            .try_get::<Option<uuid::Uuid>, _>("parent_session_id")?
            .map(SessionId),
        model: row.try_get("model")?,
        config: config.and_then(|c| serde_json::from_value(c).ok()),
        turn_count: row.try_get::<i64, _>("turn_count")? as u32,
        created_at: row.try_get("created_at")?,
        last_active_at: row.try_get("last_active_at")?,
    })
}

const SESSION_COLUMNS: &str = "id, tenant_id, agent_name, sandbox_id, status, runner_id, parent_session_id, model, config, turn_count, created_at, last_active_at";

fn sandbox_from_row(row: &sqlx::postgres::PgRow) -> Result<SandboxRecord, sqlx::Error> {
    Ok(SandboxRecord {
        id: SandboxId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        session_id: row.try_get::<Option<uuid::Uuid>, _>("session_id")?.map(SessionId),
        agent_name: row.try_get("agent_name")?,
        state: sandbox_state_from_str(row.try_get::<String, _>("state")?.as_str()),
        workspace_dir: row.try_get("workspace_dir")?,
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get("last_used_at")?,
        install_completed_at: row.try_get("install_completed_at")?,
    })
}

const SANDBOX_COLUMNS: &str =
    "id, tenant_id, session_id, agent_name, state, workspace_dir, created_at, last_used_at, install_completed_at";

fn message_from_row(row: &sqlx::postgres::PgRow) -> Result<Message, sqlx::Error> {
    Ok(Message {
        id: row.try_get("id")?,
        tenant_id: TenantId(row.try_get("tenant_id")?),
        session_id: SessionId(row.try_get("session_id")?),
        role: if row.try_get::<String, _>("role")? == "assistant" {
            MessageRole::Assistant
        } else {
            MessageRole::User
        },
        content: row.try_get("content")?,
        sequence: row.try_get("sequence")?,
        created_at: row.try_get("created_at")?,
    })
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<SessionEvent, sqlx::Error> {
    Ok(SessionEvent {
        id: row.try_get("id")?,
        tenant_id: TenantId(row.try_get("tenant_id")?),
        session_id: SessionId(row.try_get("session_id")?),
        event_type: row.try_get("event_type")?,
        data: row.try_get("data")?,
        sequence: row.try_get("sequence")?,
        created_at: row.try_get("created_at")?,
    })
}

fn runner_from_row(row: &sqlx::postgres::PgRow) -> Result<Runner, sqlx::Error> {
    Ok(Runner {
        id: RunnerId(row.try_get("id")?),
        host: row.try_get("host")?,
        port: row.try_get::<i32, _>("port")? as u16,
        max_sandboxes: row.try_get::<i32, _>("max_sandboxes")? as u32,
        active_count: row.try_get::<i32, _>("active_count")? as u32,
        warming_count: row.try_get::<i32, _>("warming_count")? as u32,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        registered_at: row.try_get("registered_at")?,
    })
}

fn internal(err: sqlx::Error) -> ApiError {
    StorageError::from(err).into()
}

#[async_trait]
impl AgentRepository for PostgresRepository {
    async fn upsert_agent(&self, tenant: &TenantId, name: &str, path: &str) -> ApiResult<Agent> {
        let row = sqlx::query(
            "INSERT INTO agents (id, tenant_id, name, version, path, created_at, updated_at)
             VALUES (gen_random_uuid(), $1, $2, 1, $3, now(), now())
             ON CONFLICT (tenant_id, name) DO UPDATE
               SET version = agents.version + 1, path = excluded.path, updated_at = now()
             RETURNING id, tenant_id, name, version, path, created_at, updated_at",
        )
        .bind(&tenant.0)
        .bind(name)
        .bind(path)
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;
        agent_from_row(&row).map_err(internal)
    }

    async fn get_agent(&self, tenant: &TenantId, name: &str) -> ApiResult<Option<Agent>> {
        let row = sqlx::query(
            "SELECT id, tenant_id, name, version, path, created_at, updated_at FROM agents WHERE tenant_id = $1 AND name = $2",
        )
        .bind(&tenant.0)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        row.map(|r| agent_from_row(&r)).transpose().map_err(internal)
    }

    async fn list_agents(&self, tenant: &TenantId) -> ApiResult<Vec<Agent>> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, name, version, path, created_at, updated_at FROM agents WHERE tenant_id = $1 ORDER BY name",
        )
        .bind(&tenant.0)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(agent_from_row).collect::<Result<_, _>>().map_err(internal)
    }

    async fn delete_agent(&self, tenant: &TenantId, name: &str) -> ApiResult<()> {
        sqlx::query("DELETE FROM agents WHERE tenant_id = $1 AND name = $2")
            .bind(&tenant.0)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for PostgresRepository {
    async fn insert_session(&self, session: Session) -> ApiResult<Session> {
        sqlx::query(&format!(
            "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)"
        ))
        .bind(session.id.0)
        .bind(&session.tenant_id.0)
        .bind(&session.agent_name)
        .bind(session.sandbox_id.map(|s| s.0))
        .bind(session_status_to_str(session.status))
        .bind(session.runner_id.map(|r| r.0))
        .bind(session.parent_session_id.map(|p| p.0))
        .bind(&session.model)
        .bind(session.config.as_ref().map(|c| serde_json::to_value(c).unwrap_or_default()))
        .bind(session.turn_count as i64)
        .bind(session.created_at)
        .bind(session.last_active_at)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(session)
    }

    async fn insert_forked_session(&self, parent: &Session, new_id: SessionId) -> ApiResult<Session> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        let now = Utc::now();
        let forked = Session {
            id: new_id,
            tenant_id: parent.tenant_id.clone(),
            agent_name: parent.agent_name.clone(),
            sandbox_id: None,
            status: SessionStatus::Paused,
            runner_id: None,
            parent_session_id: Some(parent.id),
            model: parent.model.clone(),
            config: parent.config.clone(),
            turn_count: 0,
            created_at: now,
            last_active_at: now,
        };
        sqlx::query(&format!(
            "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)"
        ))
        .bind(forked.id.0)
        .bind(&forked.tenant_id.0)
        .bind(&forked.agent_name)
        .bind(Option::<uuid::Uuid>::None)
        .bind(session_status_to_str(forked.status))
        .bind(Option::<uuid::Uuid>::None)
        .bind(forked.parent_session_id.map(|p| p.0))
        .bind(&forked.model)
        .bind(forked.config.as_ref().map(|c| serde_json::to_value(c).unwrap_or_default()))
        .bind(0i64)
        .bind(forked.created_at)
        .bind(forked.last_active_at)
        .execute(&mut *tx)
        .await
        .map_err(internal)?;

        sqlx::query(
            "INSERT INTO messages (id, tenant_id, session_id, role, content, sequence, created_at)
             SELECT gen_random_uuid(), tenant_id, $1, role, content, sequence, created_at
             FROM messages WHERE tenant_id = $2 AND session_id = $3",
        )
        .bind(forked.id.0)
        .bind(&parent.tenant_id.0)
        .bind(parent.id.0)
        .execute(&mut *tx)
        .await
        .map_err(internal)?;

        tx.commit().await.map_err(internal)?;
        Ok(forked)
    }

    async fn update_session_status(&self, id: &SessionId, status: SessionStatus) -> ApiResult<()> {
        sqlx::query("UPDATE sessions SET status = $1 WHERE id = $2")
            .bind(session_status_to_str(status))
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn update_session_sandbox(&self, id: &SessionId, sandbox_id: Option<SandboxId>) -> ApiResult<()> {
        sqlx::query("UPDATE sessions SET sandbox_id = $1 WHERE id = $2")
            .bind(sandbox_id.map(|s| s.0))
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn update_session_runner(&self, id: &SessionId, runner_id: Option<RunnerId>) -> ApiResult<()> {
        sqlx::query("UPDATE sessions SET runner_id = $1 WHERE id = $2")
            .bind(runner_id.map(|r| r.0))
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn update_session_config(
        &self,
        id: &SessionId,
        model: Option<String>,
        config: Option<SessionConfig>,
    ) -> ApiResult<()> {
        sqlx::query("UPDATE sessions SET model = $1, config = $2 WHERE id = $3")
            .bind(model)
            .bind(config.as_ref().map(|c| serde_json::to_value(c).unwrap_or_default()))
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn increment_turn_count(&self, id: &SessionId) -> ApiResult<()> {
        sqlx::query("UPDATE sessions SET turn_count = turn_count + 1 WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> ApiResult<Option<Session>> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.map(|r| session_from_row(&r)).transpose().map_err(internal)
    }

    async fn list_sessions(&self, tenant: &TenantId, agent_name: Option<&str>) -> ApiResult<Vec<Session>> {
        let rows = match agent_name {
            Some(agent) => sqlx::query(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE tenant_id = $1 AND agent_name = $2 ORDER BY created_at DESC"
            ))
            .bind(&tenant.0)
            .bind(agent)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?,
            None => sqlx::query(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE tenant_id = $1 ORDER BY created_at DESC"
            ))
            .bind(&tenant.0)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?,
        };
        rows.iter().map(session_from_row).collect::<Result<_, _>>().map_err(internal)
    }

    async fn list_sessions_by_runner(&self, runner: &RunnerId) -> ApiResult<Vec<Session>> {
        let rows = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE runner_id = $1"))
            .bind(runner.0)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        rows.iter().map(session_from_row).collect::<Result<_, _>>().map_err(internal)
    }

    async fn bulk_pause_sessions_by_runner(&self, runner: &RunnerId) -> ApiResult<u64> {
        let result = sqlx::query(
            "UPDATE sessions SET status = 'paused' WHERE runner_id = $1 AND status IN ('starting', 'active')",
        )
        .bind(runner.0)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected())
    }

    async fn touch_session(&self, id: &SessionId) -> ApiResult<()> {
        sqlx::query("UPDATE sessions SET last_active_at = now() WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }
}

#[async_trait]
impl SandboxRepository for PostgresRepository {
    async fn insert_sandbox(&self, record: SandboxRecord) -> ApiResult<SandboxRecord> {
        sqlx::query(&format!(
            "INSERT INTO sandboxes ({SANDBOX_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"
        ))
        .bind(record.id.0)
        .bind(&record.tenant_id.0)
        .bind(record.session_id.map(|s| s.0))
        .bind(&record.agent_name)
        .bind(sandbox_state_to_str(record.state))
        .bind(&record.workspace_dir)
        .bind(record.created_at)
        .bind(record.last_used_at)
        .bind(record.install_completed_at)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(record)
    }

    async fn update_sandbox_state(&self, id: &SandboxId, state: SandboxState) -> ApiResult<()> {
        sqlx::query("UPDATE sandboxes SET state = $1 WHERE id = $2")
            .bind(sandbox_state_to_str(state))
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn update_sandbox_session(&self, id: &SandboxId, session_id: Option<SessionId>) -> ApiResult<()> {
        sqlx::query("UPDATE sandboxes SET session_id = $1 WHERE id = $2")
            .bind(session_id.map(|s| s.0))
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn touch_sandbox(&self, id: &SandboxId) -> ApiResult<()> {
        sqlx::query("UPDATE sandboxes SET last_used_at = now() WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn get_sandbox(&self, id: &SandboxId) -> ApiResult<Option<SandboxRecord>> {
        let row = sqlx::query(&format!("SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.map(|r| sandbox_from_row(&r)).transpose().map_err(internal)
    }

    async fn count_sandboxes(&self, tenant: &TenantId) -> ApiResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sandboxes WHERE tenant_id = $1")
            .bind(&tenant.0)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)?;
        let n: i64 = row.try_get("n").map_err(internal)?;
        Ok(n as u64)
    }

    async fn get_best_eviction_candidate(&self, tenant: &TenantId) -> ApiResult<Option<SandboxRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE tenant_id = $1 AND state IN ('cold','warm','waiting')
             ORDER BY CASE state WHEN 'cold' THEN 0 WHEN 'warm' THEN 1 ELSE 2 END, last_used_at ASC LIMIT 1"
        ))
        .bind(&tenant.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        row.map(|r| sandbox_from_row(&r)).transpose().map_err(internal)
    }

    async fn get_idle_sandboxes(&self, older_than: DateTime<Utc>) -> ApiResult<Vec<SandboxRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE state = 'waiting' AND last_used_at < $1"
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(sandbox_from_row).collect::<Result<_, _>>().map_err(internal)
    }

    async fn get_cold_sandboxes(&self, older_than: DateTime<Utc>) -> ApiResult<Vec<SandboxRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE state = 'cold' AND last_used_at < $1"
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(sandbox_from_row).collect::<Result<_, _>>().map_err(internal)
    }

    async fn delete_sandbox(&self, id: &SandboxId) -> ApiResult<()> {
        sqlx::query("DELETE FROM sandboxes WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn mark_all_sandboxes_cold(&self) -> ApiResult<u64> {
        let result = sqlx::query("UPDATE sandboxes SET state = 'cold' WHERE state != 'cold'")
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected())
    }

    async fn find_claimable_warm(&self, tenant: &TenantId, agent_name: &str) -> ApiResult<Option<SandboxRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE tenant_id = $1 AND agent_name = $2 AND state = 'warm' AND session_id IS NULL LIMIT 1"
        ))
        .bind(&tenant.0)
        .bind(agent_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        row.map(|r| sandbox_from_row(&r)).transpose().map_err(internal)
    }
}

#[async_trait]
impl MessageRepository for PostgresRepository {
    async fn append_message(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        role: MessageRole,
        content: serde_json::Value,
    ) -> ApiResult<Message> {
        let role_str = match role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        let mut attempt = 0;
        loop {
            let result = sqlx::query(
                "INSERT INTO messages (id, tenant_id, session_id, role, content, sequence, created_at)
                 VALUES (gen_random_uuid(), $1, $2, $3, $4,
                         COALESCE((SELECT MAX(sequence) FROM messages WHERE tenant_id = $1 AND session_id = $2), 0) + 1,
                         now())
                 RETURNING id, tenant_id, session_id, role, content, sequence, created_at",
            )
            .bind(&tenant.0)
            .bind(session.0)
            .bind(role_str)
            .bind(&content)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => return message_from_row(&row).map_err(internal),
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    attempt += 1;
                    if attempt >= MAX_SEQUENCE_RETRIES {
                        return Err(
                            StorageError::SequenceRetryExhausted(session.to_string()).into(),
                        );
                    }
                    continue;
                }
                Err(e) => return Err(internal(e)),
            }
        }
    }

    async fn list_messages(&self, session: &SessionId) -> ApiResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, session_id, role, content, sequence, created_at FROM messages WHERE session_id = $1 ORDER BY sequence",
        )
        .bind(session.0)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(message_from_row).collect::<Result<_, _>>().map_err(internal)
    }

    async fn copy_messages(&self, tenant: &TenantId, from: &SessionId, to: &SessionId) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO messages (id, tenant_id, session_id, role, content, sequence, created_at)
             SELECT gen_random_uuid(), tenant_id, $1, role, content, sequence, created_at
             FROM messages WHERE tenant_id = $2 AND session_id = $3",
        )
        .bind(to.0)
        .bind(&tenant.0)
        .bind(from.0)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }
}

#[async_trait]
impl EventRepository for PostgresRepository {
    async fn append_event(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        event_type: &str,
        data: serde_json::Value,
    ) -> ApiResult<SessionEvent> {
        let mut attempt = 0;
        loop {
            let result = sqlx::query(
                "INSERT INTO session_events (id, tenant_id, session_id, event_type, data, sequence, created_at)
                 VALUES (gen_random_uuid(), $1, $2, $3, $4,
                         COALESCE((SELECT MAX(sequence) FROM session_events WHERE tenant_id = $1 AND session_id = $2), 0) + 1,
                         now())
                 RETURNING id, tenant_id, session_id, event_type, data, sequence, created_at",
            )
            .bind(&tenant.0)
            .bind(session.0)
            .bind(event_type)
            .bind(&data)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => return event_from_row(&row).map_err(internal),
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    attempt += 1;
                    if attempt >= MAX_SEQUENCE_RETRIES {
                        return Err(
                            StorageError::SequenceRetryExhausted(session.to_string()).into(),
                        );
                    }
                    continue;
                }
                Err(e) => return Err(internal(e)),
            }
        }
    }

    async fn list_events(&self, session: &SessionId) -> ApiResult<Vec<SessionEvent>> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, session_id, event_type, data, sequence, created_at FROM session_events WHERE session_id = $1 ORDER BY sequence",
        )
        .bind(session.0)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(event_from_row).collect::<Result<_, _>>().map_err(internal)
    }
}

#[async_trait]
impl RunnerRepository for PostgresRepository {
    async fn upsert_runner(&self, host: &str, port: u16, max_sandboxes: u32) -> ApiResult<Runner> {
        let row = sqlx::query(
            "INSERT INTO runners (id, host, port, max_sandboxes, active_count, warming_count, last_heartbeat_at, registered_at)
             VALUES (gen_random_uuid(), $1, $2, $3, 0, 0, now(), now())
             ON CONFLICT (host, port) DO UPDATE
               SET max_sandboxes = excluded.max_sandboxes, last_heartbeat_at = now()
             RETURNING id, host, port, max_sandboxes, active_count, warming_count, last_heartbeat_at, registered_at",
        )
        .bind(host)
        .bind(port as i32)
        .bind(max_sandboxes as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;
        runner_from_row(&row).map_err(internal)
    }

    async fn heartbeat_runner(&self, id: &RunnerId, active_count: u32, warming_count: u32) -> ApiResult<()> {
        sqlx::query(
            "UPDATE runners SET active_count = $1, warming_count = $2, last_heartbeat_at = now() WHERE id = $3",
        )
        .bind(active_count as i32)
        .bind(warming_count as i32)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn get_runner(&self, id: &RunnerId) -> ApiResult<Option<Runner>> {
        let row = sqlx::query(
            "SELECT id, host, port, max_sandboxes, active_count, warming_count, last_heartbeat_at, registered_at FROM runners WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        row.map(|r| runner_from_row(&r)).transpose().map_err(internal)
    }

    async fn list_healthy_runners(&self, cutoff: DateTime<Utc>) -> ApiResult<Vec<Runner>> {
        let rows = sqlx::query(
            "SELECT id, host, port, max_sandboxes, active_count, warming_count, last_heartbeat_at, registered_at FROM runners WHERE last_heartbeat_at > $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(runner_from_row).collect::<Result<_, _>>().map_err(internal)
    }

    async fn list_dead_runners(&self, cutoff: DateTime<Utc>) -> ApiResult<Vec<Runner>> {
        let rows = sqlx::query(
            "SELECT id, host, port, max_sandboxes, active_count, warming_count, last_heartbeat_at, registered_at FROM runners WHERE last_heartbeat_at <= $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(runner_from_row).collect::<Result<_, _>>().map_err(internal)
    }

    async fn select_best_runner(&self, cutoff: DateTime<Utc>) -> ApiResult<Option<Runner>> {
        let row = sqlx::query(
            "SELECT id, host, port, max_sandboxes, active_count, warming_count, last_heartbeat_at, registered_at FROM runners
             WHERE last_heartbeat_at > $1
             ORDER BY (max_sandboxes - active_count - warming_count) DESC LIMIT 1",
        )
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        row.map(|r| runner_from_row(&r)).transpose().map_err(internal)
    }

    async fn delete_runner(&self, id: &RunnerId) -> ApiResult<()> {
        sqlx::query("DELETE FROM runners WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn list_all_runners(&self) -> ApiResult<Vec<Runner>> {
        let rows = sqlx::query(
            "SELECT id, host, port, max_sandboxes, active_count, warming_count, last_heartbeat_at, registered_at FROM runners",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(runner_from_row).collect::<Result<_, _>>().map_err(internal)
    }
}
