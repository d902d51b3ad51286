//! Embedded single-writer backend: one `rusqlite` connection behind a
//! `tokio::sync::Mutex`, selected when `ASH_DATABASE_URL` is unset.
//! Per-session message/event sequence assignment is a `MAX+1` read then
//! insert inside a transaction — safe here because the mutex already
//! serializes every write against this connection.

use std::path::Path;
use std::sync::Arc;

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
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::migrations::MIGRATIONS;

pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(rusqlite::Error::from)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (name TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
    )?;
    for migration in MIGRATIONS {
        let already: Option<String> = conn
            .query_row(
                "SELECT name FROM schema_migrations WHERE name = ?1",
                params![migration.name],
                |r| r.get(0),
            )
            .optional()?;
        if already.is_some() {
            continue;
        }
        conn.execute_batch(migration.sqlite)
            .map_err(|e| StorageError::Migration(migration.name, e.to_string()))?;
        conn.execute(
            "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
            params![migration.name, Utc::now().to_rfc3339()],
        )?;
    }
    Ok(())
}

fn dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_uuid(s: &str) -> uuid::Uuid {
    uuid::Uuid::parse_str(s).unwrap_or_default()
}

fn agent_from_row(row: &Row) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: AgentId(parse_uuid(&row.get::<_, String>(0)?)),
        tenant_id: TenantId(row.get(1)?),
        name: row.get(2)?,
        version: row.get(3)?,
        path: row.get(4)?,
        created_at: dt(&row.get::<_, String>(5)?),
        updated_at: dt(&row.get::<_, String>(6)?),
    })
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

fn session_from_row(row: &Row) -> rusqlite::Result<Session> {
    let config: Option<String> = row.get(8)?;
    Ok(Session {
        id: SessionId(parse_uuid(&row.get::<_, String>(0)?)),
        tenant_id: TenantId(row.get(1)?),
        agent_name: row.get(2)?,
        sandbox_id: row.get::<_, Option<String>>(3)?.map(|s| SandboxId(parse_uuid(&s))),
        status: session_status_from_str(&row.get::<_, String>(4)?),
        runner_id: row.get::<_, Option<String>>(5)?.map(|s| RunnerId(parse_uuid(&s))),
        parent_session_id: row
            .get::<_, Option<String>>(6)?
            .map(|s| SessionId(parse_uuid(&s))),
        model: row.get(7)?,
        config: config.and_then(|c| serde_json::from_str(&c).ok()),
        turn_count: row.get::<_, i64>(9)? as u32,
        created_at: dt(&row.get::<_, String>(10)?),
        last_active_at: dt(&row.get::<_, String>(11)?),
    })
}

const SESSION_COLUMNS: &str = "id, tenant_id, agent_name, sandbox_id, status, runner_id, parent_session_id, model, config, turn_count, created_at, last_active_at";

fn sandbox_from_row(row: &Row) -> rusqlite::Result<SandboxRecord> {
    Ok(SandboxRecord {
        id: SandboxId(parse_uuid(&row.get::<_, String>(0)?)),
        tenant_id: TenantId(row.get(1)?),
        session_id: row.get::<_, Option<String>>(2)?.map(|s| SessionId(parse_uuid(&s))),
        agent_name: row.get(3)?,
        state: sandbox_state_from_str(&row.get::<_, String>(4)?),
        workspace_dir: row.get(5)?,
        created_at: dt(&row.get::<_, String>(6)?),
        last_used_at: dt(&row.get::<_, String>(7)?),
        install_completed_at: row.get::<_, Option<String>>(8)?.map(|s| dt(&s)),
    })
}

const SANDBOX_COLUMNS: &str =
    "id, tenant_id, session_id, agent_name, state, workspace_dir, created_at, last_used_at, install_completed_at";

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    let content: String = row.get(4)?;
    Ok(Message {
        id: parse_uuid(&row.get::<_, String>(0)?),
        tenant_id: TenantId(row.get(1)?),
        session_id: SessionId(parse_uuid(&row.get::<_, String>(2)?)),
        role: if row.get::<_, String>(3)? == "assistant" {
            MessageRole::Assistant
        } else {
            MessageRole::User
        },
        content: serde_json::from_str(&content).unwrap_or(serde_json::Value::Null),
        sequence: row.get(5)?,
        created_at: dt(&row.get::<_, String>(6)?),
    })
}

fn event_from_row(row: &Row) -> rusqlite::Result<SessionEvent> {
    let data: String = row.get(4)?;
    Ok(SessionEvent {
        id: parse_uuid(&row.get::<_, String>(0)?),
        tenant_id: TenantId(row.get(1)?),
        session_id: SessionId(parse_uuid(&row.get::<_, String>(2)?)),
        event_type: row.get(3)?,
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        sequence: row.get(5)?,
        created_at: dt(&row.get::<_, String>(6)?),
    })
}

fn runner_from_row(row: &Row) -> rusqlite::Result<Runner> {
    Ok(Runner {
        id: RunnerId(parse_uuid(&row.get::<_, String>(0)?)),
        host: row.get(1)?,
        port: row.get::<_, i64>(2)? as u16,
        max_sandboxes: row.get::<_, i64>(3)? as u32,
        active_count: row.get::<_, i64>(4)? as u32,
        warming_count: row.get::<_, i64>(5)? as u32,
        last_heartbeat_at: dt(&row.get::<_, String>(6)?),
        registered_at: dt(&row.get::<_, String>(7)?),
    })
}

fn internal(err: rusqlite::Error) -> ApiError {
    StorageError::from(err).into()
}

#[async_trait]
impl AgentRepository for SqliteRepository {
    async fn upsert_agent(&self, tenant: &TenantId, name: &str, path: &str) -> ApiResult<Agent> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let existing: Option<(String, i64)> = conn
            .query_row(
                "SELECT id, version FROM agents WHERE tenant_id = ?1 AND name = ?2",
                params![tenant.0, name],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(internal)?;

        let (id, version) = match existing {
            Some((id, version)) => {
                let new_version = version + 1;
                conn.execute(
                    "UPDATE agents SET version = ?1, path = ?2, updated_at = ?3 WHERE id = ?4",
                    params![new_version, path, now, id],
                )
                .map_err(internal)?;
                (id, new_version)
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO agents (id, tenant_id, name, version, path, created_at, updated_at) VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)",
                    params![id, tenant.0, name, path, now],
                )
                .map_err(internal)?;
                (id, 1)
            }
        };

        Ok(Agent {
            id: AgentId(parse_uuid(&id)),
            tenant_id: tenant.clone(),
            name: name.to_string(),
            version,
            path: path.to_string(),
            created_at: dt(&now),
            updated_at: dt(&now),
        })
    }

    async fn get_agent(&self, tenant: &TenantId, name: &str) -> ApiResult<Option<Agent>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, tenant_id, name, version, path, created_at, updated_at FROM agents WHERE tenant_id = ?1 AND name = ?2",
            params![tenant.0, name],
            agent_from_row,
        )
        .optional()
        .map_err(internal)
    }

    async fn list_agents(&self, tenant: &TenantId) -> ApiResult<Vec<Agent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id, tenant_id, name, version, path, created_at, updated_at FROM agents WHERE tenant_id = ?1 ORDER BY name")
            .map_err(internal)?;
        let rows = stmt
            .query_map(params![tenant.0], agent_from_row)
            .map_err(internal)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(internal)
    }

    async fn delete_agent(&self, tenant: &TenantId, name: &str) -> ApiResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM agents WHERE tenant_id = ?1 AND name = ?2",
            params![tenant.0, name],
        )
        .map_err(internal)?;
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for SqliteRepository {
    async fn insert_session(&self, session: Session) -> ApiResult<Session> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)"),
            params![
                session.id.to_string(),
                session.tenant_id.0,
                session.agent_name,
                session.sandbox_id.map(|s| s.to_string()),
                session_status_to_str(session.status),
                session.runner_id.map(|r| r.to_string()),
                session.parent_session_id.map(|p| p.to_string()),
                session.model,
                session.config.as_ref().map(|c| serde_json::to_string(c).unwrap_or_default()),
                session.turn_count as i64,
                session.created_at.to_rfc3339(),
                session.last_active_at.to_rfc3339(),
            ],
        )
        .map_err(internal)?;
        Ok(session)
    }

    async fn insert_forked_session(&self, parent: &Session, new_id: SessionId) -> ApiResult<Session> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(internal)?;
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
        tx.execute(
            &format!("INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)"),
            params![
                forked.id.to_string(),
                forked.tenant_id.0,
                forked.agent_name,
                Option::<String>::None,
                session_status_to_str(forked.status),
                Option::<String>::None,
                forked.parent_session_id.map(|p| p.to_string()),
                forked.model,
                forked.config.as_ref().map(|c| serde_json::to_string(c).unwrap_or_default()),
                0i64,
                forked.created_at.to_rfc3339(),
                forked.last_active_at.to_rfc3339(),
            ],
        )
        .map_err(internal)?;

        let mut stmt = tx
            .prepare("SELECT role, content, sequence, created_at FROM messages WHERE tenant_id = ?1 AND session_id = ?2 ORDER BY sequence")
            .map_err(internal)?;
        let parent_messages: Vec<(String, String, i64, String)> = stmt
            .query_map(params![parent.tenant_id.0, parent.id.to_string()], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })
            .map_err(internal)?
            .collect::<Result<_, _>>()
            .map_err(internal)?;
        drop(stmt);

        for (role, content, sequence, created_at) in parent_messages {
            tx.execute(
                "INSERT INTO messages (id, tenant_id, session_id, role, content, sequence, created_at) VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    forked.tenant_id.0,
                    forked.id.to_string(),
                    role,
                    content,
                    sequence,
                    created_at,
                ],
            )
            .map_err(internal)?;
        }

        tx.commit().map_err(internal)?;
        Ok(forked)
    }

    async fn update_session_status(&self, id: &SessionId, status: SessionStatus) -> ApiResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sessions SET status = ?1 WHERE id = ?2",
            params![session_status_to_str(status), id.to_string()],
        )
        .map_err(internal)?;
        Ok(())
    }

    async fn update_session_sandbox(&self, id: &SessionId, sandbox_id: Option<SandboxId>) -> ApiResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sessions SET sandbox_id = ?1 WHERE id = ?2",
            params![sandbox_id.map(|s| s.to_string()), id.to_string()],
        )
        .map_err(internal)?;
        Ok(())
    }

    async fn update_session_runner(&self, id: &SessionId, runner_id: Option<RunnerId>) -> ApiResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sessions SET runner_id = ?1 WHERE id = ?2",
            params![runner_id.map(|r| r.to_string()), id.to_string()],
        )
        .map_err(internal)?;
        Ok(())
    }

    async fn update_session_config(
        &self,
        id: &SessionId,
        model: Option<String>,
        config: Option<SessionConfig>,
    ) -> ApiResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sessions SET model = ?1, config = ?2 WHERE id = ?3",
            params![
                model,
                config.as_ref().map(|c| serde_json::to_string(c).unwrap_or_default()),
                id.to_string()
            ],
        )
        .map_err(internal)?;
        Ok(())
    }

    async fn increment_turn_count(&self, id: &SessionId) -> ApiResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sessions SET turn_count = turn_count + 1 WHERE id = ?1",
            params![id.to_string()],
        )
        .map_err(internal)?;
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> ApiResult<Option<Session>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![id.to_string()],
            session_from_row,
        )
        .optional()
        .map_err(internal)
    }

    async fn list_sessions(&self, tenant: &TenantId, agent_name: Option<&str>) -> ApiResult<Vec<Session>> {
        let conn = self.conn.lock().await;
        let rows = match agent_name {
            Some(agent) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions WHERE tenant_id = ?1 AND agent_name = ?2 ORDER BY created_at DESC"
                    ))
                    .map_err(internal)?;
                stmt.query_map(params![tenant.0, agent], session_from_row)
                    .map_err(internal)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(internal)?
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions WHERE tenant_id = ?1 ORDER BY created_at DESC"
                    ))
                    .map_err(internal)?;
                stmt.query_map(params![tenant.0], session_from_row)
                    .map_err(internal)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(internal)?
            }
        };
        Ok(rows)
    }

    async fn list_sessions_by_runner(&self, runner: &RunnerId) -> ApiResult<Vec<Session>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE runner_id = ?1"))
            .map_err(internal)?;
        stmt.query_map(params![runner.to_string()], session_from_row)
            .map_err(internal)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal)
    }

    async fn bulk_pause_sessions_by_runner(&self, runner: &RunnerId) -> ApiResult<u64> {
        let conn = self.conn.lock().await;
        let count = conn
            .execute(
                "UPDATE sessions SET status = 'paused' WHERE runner_id = ?1 AND status IN ('starting', 'active')",
                params![runner.to_string()],
            )
            .map_err(internal)?;
        Ok(count as u64)
    }

    async fn touch_session(&self, id: &SessionId) -> ApiResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sessions SET last_active_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )
        .map_err(internal)?;
        Ok(())
    }
}

#[async_trait]
impl SandboxRepository for SqliteRepository {
    async fn insert_sandbox(&self, record: SandboxRecord) -> ApiResult<SandboxRecord> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO sandboxes ({SANDBOX_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"),
            params![
                record.id.to_string(),
                record.tenant_id.0,
                record.session_id.map(|s| s.to_string()),
                record.agent_name,
                sandbox_state_to_str(record.state),
                record.workspace_dir,
                record.created_at.to_rfc3339(),
                record.last_used_at.to_rfc3339(),
                record.install_completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(internal)?;
        Ok(record)
    }

    async fn update_sandbox_state(&self, id: &SandboxId, state: SandboxState) -> ApiResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sandboxes SET state = ?1 WHERE id = ?2",
            params![sandbox_state_to_str(state), id.to_string()],
        )
        .map_err(internal)?;
        Ok(())
    }

    async fn update_sandbox_session(&self, id: &SandboxId, session_id: Option<SessionId>) -> ApiResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sandboxes SET session_id = ?1 WHERE id = ?2",
            params![session_id.map(|s| s.to_string()), id.to_string()],
        )
        .map_err(internal)?;
        Ok(())
    }

    async fn touch_sandbox(&self, id: &SandboxId) -> ApiResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sandboxes SET last_used_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )
        .map_err(internal)?;
        Ok(())
    }

    async fn get_sandbox(&self, id: &SandboxId) -> ApiResult<Option<SandboxRecord>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE id = ?1"),
            params![id.to_string()],
            sandbox_from_row,
        )
        .optional()
        .map_err(internal)
    }

    async fn count_sandboxes(&self, tenant: &TenantId) -> ApiResult<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sandboxes WHERE tenant_id = ?1",
                params![tenant.0],
                |r| r.get(0),
            )
            .map_err(internal)?;
        Ok(count as u64)
    }

    async fn get_best_eviction_candidate(&self, tenant: &TenantId) -> ApiResult<Option<SandboxRecord>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE tenant_id = ?1 AND state IN ('cold','warm','waiting')
                 ORDER BY CASE state WHEN 'cold' THEN 0 WHEN 'warm' THEN 1 ELSE 2 END, last_used_at ASC LIMIT 1"
            ),
            params![tenant.0],
            sandbox_from_row,
        )
        .optional()
        .map_err(internal)
    }

    async fn get_idle_sandboxes(&self, older_than: DateTime<Utc>) -> ApiResult<Vec<SandboxRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE state = 'waiting' AND last_used_at < ?1"
            ))
            .map_err(internal)?;
        stmt.query_map(params![older_than.to_rfc3339()], sandbox_from_row)
            .map_err(internal)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal)
    }

    async fn get_cold_sandboxes(&self, older_than: DateTime<Utc>) -> ApiResult<Vec<SandboxRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE state = 'cold' AND last_used_at < ?1"
            ))
            .map_err(internal)?;
        stmt.query_map(params![older_than.to_rfc3339()], sandbox_from_row)
            .map_err(internal)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal)
    }

    async fn delete_sandbox(&self, id: &SandboxId) -> ApiResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM sandboxes WHERE id = ?1", params![id.to_string()])
            .map_err(internal)?;
        Ok(())
    }

    async fn mark_all_sandboxes_cold(&self) -> ApiResult<u64> {
        let conn = self.conn.lock().await;
        let count = conn
            .execute("UPDATE sandboxes SET state = 'cold' WHERE state != 'cold'", [])
            .map_err(internal)?;
        Ok(count as u64)
    }

    async fn find_claimable_warm(&self, tenant: &TenantId, agent_name: &str) -> ApiResult<Option<SandboxRecord>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE tenant_id = ?1 AND agent_name = ?2 AND state = 'warm' AND session_id IS NULL LIMIT 1"
            ),
            params![tenant.0, agent_name],
            sandbox_from_row,
        )
        .optional()
        .map_err(internal)
    }
}

/// Dense sequence assignment: `MAX+1` under the connection's mutex, which
/// already serializes every writer against this single connection.
async fn next_sequence(conn: &Connection, table: &str, tenant: &TenantId, session: &SessionId) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM {table} WHERE tenant_id = ?1 AND session_id = ?2"
        ),
        params![tenant.0, session.to_string()],
        |r| r.get(0),
    )
}

#[async_trait]
impl MessageRepository for SqliteRepository {
    async fn append_message(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        role: MessageRole,
        content: serde_json::Value,
    ) -> ApiResult<Message> {
        let conn = self.conn.lock().await;
        let sequence = next_sequence(&conn, "messages", tenant, session)
            .await
            .map_err(internal)?;
        let id = uuid::Uuid::new_v4();
        let now = Utc::now();
        let role_str = match role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        conn.execute(
            "INSERT INTO messages (id, tenant_id, session_id, role, content, sequence, created_at) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                id.to_string(),
                tenant.0,
                session.to_string(),
                role_str,
                serde_json::to_string(&content).map_err(StorageError::from)?,
                sequence,
                now.to_rfc3339(),
            ],
        )
        .map_err(internal)?;
        Ok(Message {
            id,
            tenant_id: tenant.clone(),
            session_id: *session,
            role,
            content,
            sequence,
            created_at: now,
        })
    }

    async fn list_messages(&self, session: &SessionId) -> ApiResult<Vec<Message>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id, tenant_id, session_id, role, content, sequence, created_at FROM messages WHERE session_id = ?1 ORDER BY sequence")
            .map_err(internal)?;
        stmt.query_map(params![session.to_string()], message_from_row)
            .map_err(internal)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal)
    }

    async fn copy_messages(&self, tenant: &TenantId, from: &SessionId, to: &SessionId) -> ApiResult<()> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT role, content, sequence, created_at FROM messages WHERE tenant_id = ?1 AND session_id = ?2 ORDER BY sequence")
            .map_err(internal)?;
        let rows: Vec<(String, String, i64, String)> = stmt
            .query_map(params![tenant.0, from.to_string()], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })
            .map_err(internal)?
            .collect::<Result<_, _>>()
            .map_err(internal)?;
        drop(stmt);
        for (role, content, sequence, created_at) in rows {
            conn.execute(
                "INSERT INTO messages (id, tenant_id, session_id, role, content, sequence, created_at) VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![uuid::Uuid::new_v4().to_string(), tenant.0, to.to_string(), role, content, sequence, created_at],
            )
            .map_err(internal)?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventRepository for SqliteRepository {
    async fn append_event(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        event_type: &str,
        data: serde_json::Value,
    ) -> ApiResult<SessionEvent> {
        let conn = self.conn.lock().await;
        let sequence = next_sequence(&conn, "session_events", tenant, session)
            .await
            .map_err(internal)?;
        let id = uuid::Uuid::new_v4();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO session_events (id, tenant_id, session_id, event_type, data, sequence, created_at) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                id.to_string(),
                tenant.0,
                session.to_string(),
                event_type,
                serde_json::to_string(&data).map_err(StorageError::from)?,
                sequence,
                now.to_rfc3339(),
            ],
        )
        .map_err(internal)?;
        Ok(SessionEvent {
            id,
            tenant_id: tenant.clone(),
            session_id: *session,
            event_type: event_type.to_string(),
            data,
            sequence,
            created_at: now,
        })
    }

    async fn list_events(&self, session: &SessionId) -> ApiResult<Vec<SessionEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id, tenant_id, session_id, event_type, data, sequence, created_at FROM session_events WHERE session_id = ?1 ORDER BY sequence")
            .map_err(internal)?;
        stmt.query_map(params![session.to_string()], event_from_row)
            .map_err(internal)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal)
    }
}

#[async_trait]
impl RunnerRepository for SqliteRepository {
    async fn upsert_runner(&self, host: &str, port: u16, max_sandboxes: u32) -> ApiResult<Runner> {
        let conn = self.conn.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM runners WHERE host = ?1 AND port = ?2",
                params![host, port as i64],
                |r| r.get(0),
            )
            .optional()
            .map_err(internal)?;
        let now = Utc::now();
        let id = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE runners SET max_sandboxes = ?1, last_heartbeat_at = ?2 WHERE id = ?3",
                    params![max_sandboxes as i64, now.to_rfc3339(), id],
                )
                .map_err(internal)?;
                id
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO runners (id, host, port, max_sandboxes, active_count, warming_count, last_heartbeat_at, registered_at) VALUES (?1,?2,?3,?4,0,0,?5,?5)",
                    params![id, host, port as i64, max_sandboxes as i64, now.to_rfc3339()],
                )
                .map_err(internal)?;
                id
            }
        };
        Ok(Runner {
            id: RunnerId(parse_uuid(&id)),
            host: host.to_string(),
            port,
            max_sandboxes,
            active_count: 0,
            warming_count: 0,
            last_heartbeat_at: now,
            registered_at: now,
        })
    }

    async fn heartbeat_runner(&self, id: &RunnerId, active_count: u32, warming_count: u32) -> ApiResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE runners SET active_count = ?1, warming_count = ?2, last_heartbeat_at = ?3 WHERE id = ?4",
            params![active_count as i64, warming_count as i64, Utc::now().to_rfc3339(), id.to_string()],
        )
        .map_err(internal)?;
        Ok(())
    }

    async fn get_runner(&self, id: &RunnerId) -> ApiResult<Option<Runner>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, host, port, max_sandboxes, active_count, warming_count, last_heartbeat_at, registered_at FROM runners WHERE id = ?1",
            params![id.to_string()],
            runner_from_row,
        )
        .optional()
        .map_err(internal)
    }

    async fn list_healthy_runners(&self, cutoff: DateTime<Utc>) -> ApiResult<Vec<Runner>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id, host, port, max_sandboxes, active_count, warming_count, last_heartbeat_at, registered_at FROM runners WHERE last_heartbeat_at > ?1")
            .map_err(internal)?;
        stmt.query_map(params![cutoff.to_rfc3339()], runner_from_row)
            .map_err(internal)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal)
    }

    async fn list_dead_runners(&self, cutoff: DateTime<Utc>) -> ApiResult<Vec<Runner>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id, host, port, max_sandboxes, active_count, warming_count, last_heartbeat_at, registered_at FROM runners WHERE last_heartbeat_at <= ?1")
            .map_err(internal)?;
        stmt.query_map(params![cutoff.to_rfc3339()], runner_from_row)
            .map_err(internal)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal)
    }

    async fn select_best_runner(&self, cutoff: DateTime<Utc>) -> ApiResult<Option<Runner>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, host, port, max_sandboxes, active_count, warming_count, last_heartbeat_at, registered_at FROM runners
             WHERE last_heartbeat_at > ?1 ORDER BY (max_sandboxes - active_count - warming_count) DESC LIMIT 1",
            params![cutoff.to_rfc3339()],
            runner_from_row,
        )
        .optional()
        .map_err(internal)
    }

    async fn delete_runner(&self, id: &RunnerId) -> ApiResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM runners WHERE id = ?1", params![id.to_string()])
            .map_err(internal)?;
        Ok(())
    }

    async fn list_all_runners(&self) -> ApiResult<Vec<Runner>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id, host, port, max_sandboxes, active_count, warming_count, last_heartbeat_at, registered_at FROM runners")
            .map_err(internal)?;
        stmt.query_map([], runner_from_row)
            .map_err(internal)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_agent_increments_version_and_keeps_id_stable() {
        let repo = SqliteRepository::open_in_memory().await.unwrap();
        let tenant = TenantId::default_tenant();
        let a1 = repo.upsert_agent(&tenant, "qa", "/agents/qa").await.unwrap();
        assert_eq!(a1.version, 1);
        let a2 = repo.upsert_agent(&tenant, "qa", "/agents/qa-v2").await.unwrap();
        assert_eq!(a2.version, 2);
        assert_eq!(a1.id, a2.id);
        let a3 = repo.upsert_agent(&tenant, "qa", "/agents/qa-v3").await.unwrap();
        assert_eq!(a3.version, 3);
        assert_eq!(a1.id, a3.id);
    }

    #[tokio::test]
    async fn message_sequences_are_dense_and_gapless() {
        let repo = SqliteRepository::open_in_memory().await.unwrap();
        let tenant = TenantId::default_tenant();
        let session = SessionId::new();
        for i in 0..5 {
            let msg = repo
                .append_message(&tenant, &session, MessageRole::User, serde_json::json!({"i": i}))
                .await
                .unwrap();
            assert_eq!(msg.sequence, i as i64 + 1);
        }
        let all = repo.list_messages(&session).await.unwrap();
        let sequences: Vec<i64> = all.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn fork_copies_parent_messages_preserving_sequence() {
        let repo = SqliteRepository::open_in_memory().await.unwrap();
        let tenant = TenantId::default_tenant();
        let parent_id = SessionId::new();
        let now = Utc::now();
        let parent = Session {
            id: parent_id,
            tenant_id: tenant.clone(),
            agent_name: "qa".into(),
            sandbox_id: None,
            status: SessionStatus::Active,
            runner_id: None,
            parent_session_id: None,
            model: None,
            config: None,
            turn_count: 1,
            created_at: now,
            last_active_at: now,
        };
        repo.insert_session(parent.clone()).await.unwrap();
        repo.append_message(&tenant, &parent_id, MessageRole::User, serde_json::json!("hi"))
            .await
            .unwrap();
        repo.append_message(&tenant, &parent_id, MessageRole::Assistant, serde_json::json!("hello"))
            .await
            .unwrap();

        let fork_id = SessionId::new();
        let forked = repo.insert_forked_session(&parent, fork_id).await.unwrap();
        assert_eq!(forked.status, SessionStatus::Paused);
        assert_eq!(forked.parent_session_id, Some(parent_id));

        let forked_messages = repo.list_messages(&fork_id).await.unwrap();
        let parent_messages = repo.list_messages(&parent_id).await.unwrap();
        assert_eq!(forked_messages.len(), parent_messages.len());
        for (f, p) in forked_messages.iter().zip(parent_messages.iter()) {
            assert_eq!(f.role, p.role);
            assert_eq!(f.content, p.content);
            assert_eq!(f.sequence, p.sequence);
            assert_ne!(f.id, p.id);
        }
    }

    #[tokio::test]
    async fn mark_all_sandboxes_cold_is_idempotent() {
        let repo = SqliteRepository::open_in_memory().await.unwrap();
        let tenant = TenantId::default_tenant();
        let record = SandboxRecord {
            id: SandboxId::new(),
            tenant_id: tenant.clone(),
            session_id: None,
            agent_name: "qa".into(),
            state: SandboxState::Warm,
            workspace_dir: "/tmp/x".into(),
            created_at: Utc::now(),
            last_used_at: Utc::now(),
            install_completed_at: None,
        };
        repo.insert_sandbox(record.clone()).await.unwrap();
        let n1 = repo.mark_all_sandboxes_cold().await.unwrap();
        assert_eq!(n1, 1);
        let n2 = repo.mark_all_sandboxes_cold().await.unwrap();
        assert_eq!(n2, 0);
    }

    #[tokio::test]
    async fn bulk_pause_moves_only_starting_and_active_sessions() {
        let repo = SqliteRepository::open_in_memory().await.unwrap();
        let tenant = TenantId::default_tenant();
        let runner = RunnerId::new();
        let now = Utc::now();
        for status in [SessionStatus::Active, SessionStatus::Starting, SessionStatus::Ended] {
            let session = Session {
                id: SessionId::new(),
                tenant_id: tenant.clone(),
                agent_name: "qa".into(),
                sandbox_id: None,
                status,
                runner_id: Some(runner),
                parent_session_id: None,
                model: None,
                config: None,
                turn_count: 0,
                created_at: now,
                last_active_at: now,
            };
            repo.insert_session(session).await.unwrap();
        }
        let count = repo.bulk_pause_sessions_by_runner(&runner).await.unwrap();
        assert_eq!(count, 2);
    }
}
