//! The Session Orchestrator: owns the session state machine, translates
//! prompts into bridge `query` commands, persists messages and events, and
//! streams results back to the caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use ash_bridge::{Command, Event as BridgeEvent};
use ash_core::error::{ApiError, ApiResult};
use ash_core::ids::{SandboxId, SessionId, TenantId};
use ash_core::model::{
    Agent, Message, MessageRole, Session, SessionConfig, SessionStatus,
};
use ash_core::repository::Repository;
use ash_pool::{Pool, RestoreHook, SpawnArgs};
use ash_sandbox::ResourceLimits;
use ash_snapshot::SnapshotStore;
use chrono::Utc;
use futures::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::options::{merge_query_options, AgentSettings, MessageOverrides};
use crate::timing::TimingLog;

/// One SSE-able event, translated 1:1 from a bridge [`BridgeEvent`].
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    Message(Value),
    Error { kind: String, message: String },
    Done { session_id: SessionId },
}

pub struct Orchestrator {
    repo: Arc<dyn Repository>,
    pool: Arc<Pool>,
    snapshot_store: Arc<dyn SnapshotStore>,
    restore_hook: Arc<dyn RestoreHook>,
    runtime_binary: PathBuf,
    default_limits: ResourceLimits,
    allow_network: bool,
    timing: TimingLog,
    resume_warm_hits: AtomicU64,
    resume_cold_hits: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        pool: Arc<Pool>,
        snapshot_store: Arc<dyn SnapshotStore>,
        restore_hook: Arc<dyn RestoreHook>,
        runtime_binary: PathBuf,
        default_limits: ResourceLimits,
        allow_network: bool,
        debug_timing: bool,
    ) -> Self {
        Self {
            repo,
            pool,
            snapshot_store,
            restore_hook,
            runtime_binary,
            default_limits,
            allow_network,
            timing: TimingLog::new(debug_timing),
            resume_warm_hits: AtomicU64::new(0),
            resume_cold_hits: AtomicU64::new(0),
        }
    }

    pub fn resume_warm_hits(&self) -> u64 {
        self.resume_warm_hits.load(Ordering::Relaxed)
    }

    pub fn resume_cold_hits(&self) -> u64 {
        self.resume_cold_hits.load(Ordering::Relaxed)
    }

    async fn load_agent(&self, tenant: &TenantId, agent_name: &str) -> ApiResult<Agent> {
        self.repo
            .get_agent(tenant, agent_name)
            .await?
            .ok_or_else(|| OrchestratorError::AgentNotFound(agent_name.to_string()).into())
    }

    async fn load_agent_settings(&self, agent: &Agent) -> Option<AgentSettings> {
        let path = PathBuf::from(&agent.path).join("ash.json");
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(settings) => Some(settings),
            Err(err) => {
                warn!(%err, agent = %agent.name, "ignoring unparseable ash.json");
                None
            }
        }
    }

    /// Create: register the session row, then acquire a sandbox — a
    /// pre-warmed match first, a fresh spawn otherwise.
    pub async fn create_session(
        &self,
        tenant: &TenantId,
        agent_name: &str,
        model: Option<String>,
        config: Option<SessionConfig>,
    ) -> ApiResult<Session> {
        let agent = self.load_agent(tenant, agent_name).await?;

        let now = Utc::now();
        let session = Session {
            id: SessionId::new(),
            tenant_id: tenant.clone(),
            agent_name: agent.name.clone(),
            sandbox_id: None,
            status: SessionStatus::Starting,
            runner_id: None,
            parent_session_id: None,
            model,
            config,
            turn_count: 0,
            created_at: now,
            last_active_at: now,
        };
        let session = self.repo.insert_session(session).await?;

        match self.acquire_sandbox(&agent, &session).await {
            Ok(sandbox_id) => {
                self.repo
                    .update_session_sandbox(&session.id, Some(sandbox_id))
                    .await?;
                self.repo
                    .update_session_status(&session.id, SessionStatus::Active)
                    .await?;
                info!(session_id = %session.id, sandbox_id = %sandbox_id, "session created");
                Ok(Session {
                    sandbox_id: Some(sandbox_id),
                    status: SessionStatus::Active,
                    ..session
                })
            }
            Err(err) => {
                self.repo
                    .update_session_status(&session.id, SessionStatus::Error)
                    .await?;
                Err(err)
            }
        }
    }

    async fn acquire_sandbox(
        &self,
        agent: &Agent,
        session: &Session,
    ) -> ApiResult<SandboxId> {
        if let Some(entry) = self.pool.claim_warm(&agent.name, session.id).await? {
            return Ok(entry.sandbox_id);
        }
        let entry = self
            .pool
            .create(SpawnArgs {
                tenant: session.tenant_id.clone(),
                agent_name: agent.name.clone(),
                agent_dir: PathBuf::from(&agent.path),
                session_id: Some(session.id),
                limits: self.default_limits.clone(),
                extra_env: HashMap::new(),
                allow_network: self.allow_network,
                runtime_binary: self.runtime_binary.clone(),
            })
            .await?;
        Ok(entry.sandbox_id)
    }

    /// Send message: dispatch one turn and return a stream of
    /// `OrchestratorEvent`s for the caller's SSE response.
    pub async fn send_message(
        self: &Arc<Self>,
        session_id: SessionId,
        content: Value,
        overrides: MessageOverrides,
    ) -> ApiResult<MessageStream> {
        let session = self
            .repo
            .get_session(&session_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;

        if session.status == SessionStatus::Ended {
            return Err(OrchestratorError::SessionEnded(session_id.to_string()).into());
        }
        if session.status != SessionStatus::Active && session.status != SessionStatus::Starting {
            return Err(ApiError::Conflict(format!(
                "session {session_id} is {:?}, not active",
                session.status
            )));
        }

        let entry = self.pool.get_by_session(session_id).ok_or_else(|| {
            ApiError::Internal(anyhow::anyhow!(
                "active session {session_id} has no live sandbox"
            ))
        })?;

        let agent = self.load_agent(&session.tenant_id, &session.agent_name).await?;
        let settings = self.load_agent_settings(&agent).await;

        let effective_session_config = session.config.clone().unwrap_or_default().with_model(
            session.model.clone(),
        );

        // Derived from the live process, not `session.turn_count`: a cold
        // resume spawns a brand-new process with no last-session-id in
        // memory, so its first query must carry `resume:false` even though
        // the session's own turn count is nonzero (spec.md §4.2).
        let resume = entry.has_handled_query();
        let options = merge_query_options(
            resume,
            overrides,
            Some(&effective_session_config),
            None,
            settings.as_ref(),
        );

        let prompt = match &content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        self.repo
            .append_message(&session.tenant_id, &session_id, MessageRole::User, content)
            .await?;

        let query_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel::<OrchestratorEvent>(64);
        let (abort_tx, abort_rx) = oneshot::channel::<()>();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        entry
            .sender
            .lock()
            .await
            .send(Command::Query {
                query_id: query_id.clone(),
                prompt,
                options,
            })
            .await
            .map_err(|e| ApiError::BridgeProtocolError(e.to_string()))?;
        entry.mark_queried();
        self.pool.mark_running(entry.sandbox_id).await;

        let task_self = self.clone();
        tokio::spawn(async move {
            task_self
                .pump_turn(session, entry, query_id, tx, abort_rx)
                .await;
        });

        Ok(MessageStream {
            inner: ReceiverStream::new(rx),
            done,
            abort_tx: Some(abort_tx),
        })
    }

    async fn pump_turn(
        self: Arc<Self>,
        session: Session,
        entry: Arc<ash_pool::LiveEntry>,
        query_id: String,
        tx: mpsc::Sender<OrchestratorEvent>,
        mut abort_rx: oneshot::Receiver<()>,
    ) {
        let start = Instant::now();
        let mut last_payload: Option<Value> = None;
        let mut aborted = false;

        loop {
            let event = {
                let mut receiver = entry.receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = &mut abort_rx => {
                        aborted = true;
                        None
                    }
                    event = receiver.next_event() => event,
                }
            };

            if aborted {
                let mut sender = entry.sender.lock().await;
                let _ = sender.send(Command::Abort { query_id: query_id.clone() }).await;
                break;
            }

            match event {
                None => {
                    let _ = tx
                        .send(OrchestratorEvent::Error {
                            kind: "bridge_closed".into(),
                            message: "bridge connection closed mid-turn".into(),
                        })
                        .await;
                    break;
                }
                Some(Err(err)) => {
                    let _ = self
                        .repo
                        .append_event(
                            &session.tenant_id,
                            &session.id,
                            "error",
                            serde_json::json!({ "message": err.to_string() }),
                        )
                        .await;
                    let _ = tx
                        .send(OrchestratorEvent::Error {
                            kind: "bridge_protocol_error".into(),
                            message: err.to_string(),
                        })
                        .await;
                    break;
                }
                Some(Ok(BridgeEvent::Ready)) => continue,
                Some(Ok(BridgeEvent::Event { query_id: qid, payload })) => {
                    if qid != query_id {
                        continue;
                    }
                    record_usage(&self.repo, &session, &qid, &payload).await;
                    last_payload = Some(payload.clone());
                    let _ = self
                        .repo
                        .append_event(&session.tenant_id, &session.id, "message", payload.clone())
                        .await;
                    self.timing.record(session.id, &qid, "event", start);
                    if tx.send(OrchestratorEvent::Message(payload)).await.is_err() {
                        aborted = true;
                    }
                }
                Some(Ok(BridgeEvent::Done { query_id: qid })) => {
                    if qid != query_id {
                        continue;
                    }
                    self.finish_turn(&session, &last_payload).await;
                    let _ = self
                        .repo
                        .append_event(
                            &session.tenant_id,
                            &session.id,
                            "done",
                            serde_json::json!({ "sessionId": session.id.to_string() }),
                        )
                        .await;
                    self.timing.record(session.id, &qid, "done", start);
                    let _ = tx.send(OrchestratorEvent::Done { session_id: session.id }).await;
                    break;
                }
                Some(Ok(BridgeEvent::Error { query_id: qid, kind, message })) => {
                    if qid != query_id {
                        continue;
                    }
                    self.finish_turn(&session, &last_payload).await;
                    let _ = self
                        .repo
                        .append_event(
                            &session.tenant_id,
                            &session.id,
                            "error",
                            serde_json::json!({ "kind": format!("{kind:?}"), "message": message }),
                        )
                        .await;
                    let _ = tx
                        .send(OrchestratorEvent::Error {
                            kind: format!("{kind:?}"),
                            message,
                        })
                        .await;
                    break;
                }
            }
        }

        if aborted {
            self.finish_turn(&session, &last_payload).await;
        }
        self.pool.mark_waiting(entry.sandbox_id).await;
    }

    async fn finish_turn(&self, session: &Session, last_payload: &Option<Value>) {
        if let Some(payload) = last_payload {
            if let Err(err) = self
                .repo
                .append_message(
                    &session.tenant_id,
                    &session.id,
                    MessageRole::Assistant,
                    payload.clone(),
                )
                .await
            {
                warn!(%err, session_id = %session.id, "failed to persist assistant message");
            }
        }
        if let Err(err) = self.repo.increment_turn_count(&session.id).await {
            warn!(%err, session_id = %session.id, "failed to increment turn count");
        }
        if let Err(err) = self.repo.touch_session(&session.id).await {
            warn!(%err, session_id = %session.id, "failed to touch session");
        }
    }

    /// Pause: the sandbox stays alive for a fast resume; the idle sweep
    /// eventually cold-evicts it.
    pub async fn pause_session(&self, session_id: SessionId) -> ApiResult<Session> {
        let session = self.require_session(session_id).await?;
        if session.status.is_terminal() {
            return Err(OrchestratorError::SessionEnded(session_id.to_string()).into());
        }
        self.repo
            .update_session_status(&session_id, SessionStatus::Paused)
            .await?;
        self.require_session(session_id).await
    }

    /// Resume: reuse a still-warm sandbox if possible, else cold-resume from
    /// the snapshot store onto a fresh one.
    pub async fn resume_session(&self, session_id: SessionId) -> ApiResult<Session> {
        let session = self.require_session(session_id).await?;
        if session.status == SessionStatus::Ended {
            return Err(OrchestratorError::SessionEnded(session_id.to_string()).into());
        }
        if session.status == SessionStatus::Active {
            return Ok(session);
        }

        if let Some(entry) = self.pool.get_by_session(session_id) {
            let live_state = entry.state();
            if live_state.expects_live_process() {
                self.resume_warm_hits.fetch_add(1, Ordering::Relaxed);
                self.pool.mark_waiting(entry.sandbox_id).await;
                self.repo
                    .update_session_status(&session_id, SessionStatus::Active)
                    .await?;
                return self.require_session(session_id).await;
            }
        }

        let agent = self
            .load_agent(&session.tenant_id, &session.agent_name)
            .await?;
        let (entry, _restored) = self
            .pool
            .create_resuming(
                SpawnArgs {
                    tenant: session.tenant_id.clone(),
                    agent_name: agent.name.clone(),
                    agent_dir: PathBuf::from(&agent.path),
                    session_id: Some(session_id),
                    limits: self.default_limits.clone(),
                    extra_env: HashMap::new(),
                    allow_network: self.allow_network,
                    runtime_binary: self.runtime_binary.clone(),
                },
                self.restore_hook.as_ref(),
            )
            .await?;
        self.resume_cold_hits.fetch_add(1, Ordering::Relaxed);

        self.repo
            .update_session_sandbox(&session_id, Some(entry.sandbox_id))
            .await?;
        self.repo
            .update_session_status(&session_id, SessionStatus::Active)
            .await?;
        self.require_session(session_id).await
    }

    /// Fork: copy the parent's message history under a new session id; no
    /// sandbox until that session is resumed.
    pub async fn fork_session(&self, session_id: SessionId) -> ApiResult<Session> {
        let parent = self.require_session(session_id).await?;
        let new_id = SessionId::new();
        self.repo.insert_forked_session(&parent, new_id).await
    }

    /// End: terminal regardless of current status; destroys the live sandbox
    /// if one exists.
    pub async fn end_session(&self, session_id: SessionId) -> ApiResult<Session> {
        let session = self.require_session(session_id).await?;
        if let Some(sandbox_id) = session.sandbox_id {
            if self.pool.get(sandbox_id).is_some() {
                if let Err(err) = self.pool.destroy(sandbox_id).await {
                    warn!(%err, sandbox_id = %sandbox_id, "failed to destroy sandbox on session end");
                }
            }
        }
        self.repo
            .update_session_status(&session_id, SessionStatus::Ended)
            .await?;
        self.require_session(session_id).await
    }

    pub async fn update_config(
        &self,
        session_id: SessionId,
        model: Option<String>,
        config: Option<SessionConfig>,
    ) -> ApiResult<Session> {
        self.require_session(session_id).await?;
        self.repo
            .update_session_config(&session_id, model, config)
            .await?;
        self.require_session(session_id).await
    }

    pub async fn list_messages(&self, session_id: SessionId) -> ApiResult<Vec<Message>> {
        self.require_session(session_id).await?;
        self.repo.list_messages(&session_id).await
    }

    pub async fn list_events(&self, session_id: SessionId) -> ApiResult<Vec<ash_core::model::SessionEvent>> {
        self.require_session(session_id).await?;
        self.repo.list_events(&session_id).await
    }

    fn live_workspace(&self, session_id: SessionId) -> ApiResult<PathBuf> {
        self.pool
            .get_by_session(session_id)
            .map(|entry| entry.workspace_dir.clone())
            .ok_or_else(|| {
                ApiError::Conflict(format!("session {session_id} has no live sandbox"))
            })
    }

    pub async fn list_files(&self, session_id: SessionId) -> ApiResult<Vec<crate::files::FileEntry>> {
        self.require_session(session_id).await?;
        crate::files::list_files(&self.live_workspace(session_id)?).await
    }

    pub async fn read_file(&self, session_id: SessionId, path: &str) -> ApiResult<Vec<u8>> {
        self.require_session(session_id).await?;
        crate::files::read_file(&self.live_workspace(session_id)?, path).await
    }

    /// Runs inside the sandbox's own isolation boundary (`Pool::exec` ->
    /// `SandboxManager::exec` -> `IsolationBackend::exec`), not on the host,
    /// so one session's `exec` cannot read another session's workspace even
    /// though both live under the same `dataDir`.
    pub async fn exec(
        &self,
        session_id: SessionId,
        command: &str,
        timeout: std::time::Duration,
    ) -> ApiResult<crate::files::ExecResult> {
        self.require_session(session_id).await?;
        let entry = self.pool.get_by_session(session_id).ok_or_else(|| {
            ApiError::Conflict(format!("session {session_id} has no live sandbox"))
        })?;
        let timeout = crate::files::clamp_exec_timeout(timeout);
        let output = self.pool.exec(entry.sandbox_id, command, timeout).await?;
        Ok(crate::files::ExecResult {
            exit_code: output.exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn require_session(&self, session_id: SessionId) -> ApiResult<Session> {
        self.repo
            .get_session(&session_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()).into())
    }
}

async fn record_usage(repo: &Arc<dyn Repository>, session: &Session, query_id: &str, payload: &Value) {
    let Some(usage) = payload.get("usage") else {
        return;
    };
    let input_tokens = usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0);
    let output_tokens = usage.get("output_tokens").and_then(Value::as_i64).unwrap_or(0);
    let cost_usd = usage.get("cost_usd").and_then(Value::as_f64).unwrap_or(0.0);
    if input_tokens == 0 && output_tokens == 0 && cost_usd == 0.0 {
        return;
    }
    let data = serde_json::json!({
        "queryId": query_id,
        "inputTokens": input_tokens,
        "outputTokens": output_tokens,
        "costUsd": cost_usd,
    });
    if let Err(err) = repo.append_event(&session.tenant_id, &session.id, "usage", data).await {
        warn!(%err, session_id = %session.id, "failed to persist usage event");
    }
}

trait WithModel {
    fn with_model(self, model: Option<String>) -> Self;
}

impl WithModel for SessionConfig {
    fn with_model(mut self, model: Option<String>) -> Self {
        if self.model.is_none() {
            self.model = model;
        }
        self
    }
}

/// A turn's SSE-able event stream. Dropping it before a terminal event
/// arrives sends `abort(queryId)` to the bridge.
pub struct MessageStream {
    inner: ReceiverStream<OrchestratorEvent>,
    done: Arc<std::sync::atomic::AtomicBool>,
    abort_tx: Option<oneshot::Sender<()>>,
}

impl Stream for MessageStream {
    type Item = OrchestratorEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = Pin::new(&mut self.inner).poll_next(cx);
        match &poll {
            Poll::Ready(Some(OrchestratorEvent::Done { .. })) | Poll::Ready(None) => {
                self.done.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
        poll
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        if !self.done.load(Ordering::SeqCst) {
            if let Some(tx) = self.abort_tx.take() {
                let _ = tx.send(());
            }
        }
    }
}
