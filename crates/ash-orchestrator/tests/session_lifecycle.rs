//! Exercises the session state machine and the fork/pause/resume round-trip
//! laws against a real (file-backed) sqlite repository. None of these tests
//! spawn a sandbox process — `create_session`/`send_message`'s sandbox
//! acquisition path is covered by `ash-bridge`'s and `ash-pool`'s own tests;
//! here the sessions are seeded directly via the repository, the way a
//! sandbox-less `starting`/`paused` row would look on disk.

use std::sync::Arc;

use ash_core::ids::{SessionId, TenantId};
use ash_core::model::{MessageRole, Session, SessionConfig, SessionStatus};
use ash_core::repository::{MessageRepository, Repository, SessionRepository};
use ash_orchestrator::Orchestrator;
use ash_pool::{NoopEvictionHooks, NoopRestoreHook, Pool, PoolConfig};
use ash_sandbox::backend::RlimitOnlyBackend;
use ash_sandbox::{ResourceLimits, SandboxManager};
use ash_snapshot::LocalSnapshotStore;
use chrono::Utc;

async fn test_orchestrator() -> (Arc<Orchestrator>, Arc<dyn Repository>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let repo = ash_storage::open_sqlite(&dir.path().join("ash.db")).await.unwrap();

    let manager = Arc::new(SandboxManager::with_backend(
        dir.path().join("sandboxes"),
        Box::new(RlimitOnlyBackend),
    ));
    let pool = Arc::new(Pool::new(
        repo.clone(),
        manager,
        Arc::new(NoopEvictionHooks),
        PoolConfig {
            max_capacity: 10,
            idle_timeout: std::time::Duration::from_secs(60),
            cold_ttl: std::time::Duration::from_secs(60),
        },
    ));
    let snapshot_store = Arc::new(LocalSnapshotStore::new(dir.path().join("snapshots")));

    let orchestrator = Arc::new(Orchestrator::new(
        repo.clone(),
        pool,
        snapshot_store,
        Arc::new(NoopRestoreHook),
        dir.path().join("does-not-exist"),
        ResourceLimits::default(),
        false,
        false,
    ));
    (orchestrator, repo, dir)
}

fn bare_session(tenant: &TenantId, agent_name: &str, status: SessionStatus) -> Session {
    let now = Utc::now();
    Session {
        id: SessionId::new(),
        tenant_id: tenant.clone(),
        agent_name: agent_name.to_string(),
        sandbox_id: None,
        status,
        runner_id: None,
        parent_session_id: None,
        model: None,
        config: None,
        turn_count: 0,
        created_at: now,
        last_active_at: now,
    }
}

#[tokio::test]
async fn fork_copies_message_history_under_a_new_session_id() {
    let (orchestrator, repo, _dir) = test_orchestrator().await;
    let tenant = TenantId::default_tenant();

    let parent = bare_session(&tenant, "qa", SessionStatus::Active);
    let parent = repo.insert_session(parent).await.unwrap();

    repo.append_message(&tenant, &parent.id, MessageRole::User, serde_json::json!("turn one"))
        .await
        .unwrap();
    repo.append_message(
        &tenant,
        &parent.id,
        MessageRole::Assistant,
        serde_json::json!({"type": "assistant", "text": "ack"}),
    )
    .await
    .unwrap();

    let forked = orchestrator.fork_session(parent.id).await.unwrap();

    assert_ne!(forked.id, parent.id);
    assert_eq!(forked.parent_session_id, Some(parent.id));
    assert_eq!(forked.status, SessionStatus::Paused);

    let parent_messages = repo.list_messages(&parent.id).await.unwrap();
    let forked_messages = repo.list_messages(&forked.id).await.unwrap();

    assert_eq!(parent_messages.len(), forked_messages.len());
    for (p, f) in parent_messages.iter().zip(forked_messages.iter()) {
        assert_ne!(p.id, f.id, "forked messages get new ids");
        assert_eq!(p.role, f.role);
        assert_eq!(p.content, f.content);
        assert_eq!(p.sequence, f.sequence);
    }
}

#[tokio::test]
async fn pause_then_end_is_terminal_and_rejects_further_resume() {
    let (orchestrator, repo, _dir) = test_orchestrator().await;
    let tenant = TenantId::default_tenant();

    let session = repo
        .insert_session(bare_session(&tenant, "qa", SessionStatus::Active))
        .await
        .unwrap();

    let paused = orchestrator.pause_session(session.id).await.unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);

    let ended = orchestrator.end_session(session.id).await.unwrap();
    assert_eq!(ended.status, SessionStatus::Ended);

    let err = orchestrator.resume_session(session.id).await.unwrap_err();
    assert_eq!(err.status_code(), 410);

    let err = orchestrator.pause_session(session.id).await.unwrap_err();
    assert_eq!(err.status_code(), 410);
}

#[tokio::test]
async fn resume_of_an_already_active_session_is_a_no_op() {
    let (orchestrator, repo, _dir) = test_orchestrator().await;
    let tenant = TenantId::default_tenant();

    let session = repo
        .insert_session(bare_session(&tenant, "qa", SessionStatus::Active))
        .await
        .unwrap();

    let resumed = orchestrator.resume_session(session.id).await.unwrap();
    assert_eq!(resumed.id, session.id);
    assert_eq!(resumed.status, SessionStatus::Active);
    assert_eq!(resumed.sandbox_id, session.sandbox_id);
}

#[tokio::test]
async fn update_config_persists_model_and_overrides() {
    let (orchestrator, repo, _dir) = test_orchestrator().await;
    let tenant = TenantId::default_tenant();

    let session = repo
        .insert_session(bare_session(&tenant, "qa", SessionStatus::Active))
        .await
        .unwrap();

    let config = SessionConfig {
        system_prompt: Some("be terse".into()),
        ..Default::default()
    };
    let updated = orchestrator
        .update_config(session.id, Some("claude-x".into()), Some(config))
        .await
        .unwrap();

    assert_eq!(updated.model.as_deref(), Some("claude-x"));
    assert_eq!(
        updated.config.as_ref().and_then(|c| c.system_prompt.as_deref()),
        Some("be terse")
    );
}
