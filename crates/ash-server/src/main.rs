//! Composition root. Parses `--addr`/`--mode` (overriding `ASH_*` env vars),
//! wires a repository + sandbox stack for the selected
//! [`ash_core::config::NodeMode`], builds the axum router, and serves.

mod auth;
mod dto;
mod routes;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ash_core::config::{AshConfig, NodeMode, SandboxBackendPref};
use ash_core::repository::Repository;
use ash_coordinator::{Coordinator, CoordinatorConfig};
use ash_orchestrator::{Orchestrator, SnapshotEvictionHooks, SnapshotRestoreHook};
use ash_pool::{Pool, PoolConfig};
use ash_sandbox::{BackendPreference, ResourceLimits, SandboxManager};
use axum::middleware;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind the HTTP listener to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,
    /// Overrides `ASH_MODE`: `solo`, `coordinator`, or `runner`.
    #[arg(long)]
    mode: Option<String>,
    /// Host this runner advertises to its coordinator (runner mode only).
    #[arg(long)]
    runner_host: Option<String>,
    /// Port this runner advertises to its coordinator (runner mode only).
    #[arg(long)]
    runner_port: Option<u16>,
    /// Coordinator base URL, e.g. `http://coordinator:8080` (runner mode only).
    #[arg(long)]
    coordinator_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ash_server=info,tower_http=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let args = Args::parse();
    let mut config = AshConfig::from_env();
    if let Some(mode) = &args.mode {
        config.mode = mode.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    }

    tokio::fs::create_dir_all(config.sandboxes_dir()).await?;
    tokio::fs::create_dir_all(config.agents_dir()).await?;
    tokio::fs::create_dir_all(config.snapshots_dir()).await?;

    info!(mode = ?config.mode, addr = %args.addr, "starting ash-server");

    let repo = open_repository(&config).await?;
    let internal_secret = config.internal_secret.clone();
    let http_client = reqwest::Client::new();

    let state = match config.mode {
        NodeMode::Solo => {
            let (orchestrator, pool) = build_local_stack(&config, repo.clone()).await?;
            pool.recover_on_startup().await?;
            pool.install_process_exit_hook();
            spawn_pool_sweepers(pool.clone());
            AppState {
                repo,
                orchestrator: Some(orchestrator),
                coordinator: None,
                pool: Some(pool),
                http_client,
                api_key: Some(resolve_api_key(&config).await?),
                internal_secret,
            }
        }
        NodeMode::Runner => {
            let (orchestrator, pool) = build_local_stack(&config, repo.clone()).await?;
            pool.recover_on_startup().await?;
            pool.install_process_exit_hook();
            spawn_pool_sweepers(pool.clone());
            let secret = internal_secret
                .clone()
                .context("ASH_INTERNAL_SECRET is required in runner mode")?;
            let coordinator_url = args
                .coordinator_url
                .context("--coordinator-url is required in runner mode")?;
            let host = args.runner_host.unwrap_or_else(|| "127.0.0.1".to_string());
            let port = args.runner_port.unwrap_or(8080);
            spawn_runner_registration(
                http_client.clone(),
                coordinator_url,
                secret,
                host,
                port,
                config.max_sandboxes,
                pool.clone(),
            );
            AppState {
                repo,
                orchestrator: Some(orchestrator),
                coordinator: None,
                pool: Some(pool),
                http_client,
                api_key: None,
                internal_secret,
            }
        }
        NodeMode::Coordinator => {
            let secret = internal_secret
                .clone()
                .context("ASH_INTERNAL_SECRET is required in coordinator mode")?;
            let coordinator = Arc::new(Coordinator::new(
                repo.clone(),
                CoordinatorConfig {
                    heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
                    health_sweep_interval: Duration::from_millis(config.health_sweep_interval_ms),
                },
            ));
            coordinator.clone().spawn_health_sweeper();
            AppState {
                repo,
                orchestrator: None,
                coordinator: Some(coordinator),
                pool: None,
                http_client,
                api_key: Some(resolve_api_key(&config).await?),
                internal_secret: Some(secret),
            }
        }
    };

    let app = build_router(config.mode, state);
    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    info!(addr = %args.addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn open_repository(config: &AshConfig) -> Result<Arc<dyn Repository>> {
    if let Some(url) = &config.database_url {
        Ok(ash_storage::connect_postgres(url).await?)
    } else {
        Ok(ash_storage::open_sqlite(&config.db_path()).await?)
    }
}

async fn resolve_api_key(config: &AshConfig) -> Result<String> {
    if let Some(key) = &config.api_key {
        return Ok(key.clone());
    }
    let path = config.initial_api_key_path();
    if let Ok(existing) = tokio::fs::read_to_string(&path).await {
        return Ok(existing.trim().to_string());
    }
    let key = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    tokio::fs::write(&path, &key).await?;
    info!(path = %path.display(), "generated initial API key");
    Ok(key)
}

fn backend_preference(pref: SandboxBackendPref) -> BackendPreference {
    match pref {
        SandboxBackendPref::Gvisor => BackendPreference::Gvisor,
        SandboxBackendPref::Bwrap => BackendPreference::Bwrap,
        SandboxBackendPref::Auto => BackendPreference::Auto,
    }
}

fn resolve_runtime_binary() -> PathBuf {
    if let Ok(path) = std::env::var("ASH_RUNTIME_BINARY") {
        return PathBuf::from(path);
    }
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|dir| dir.join("ash-runtime")))
        .filter(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from("ash-runtime"))
}

async fn build_local_stack(config: &AshConfig, repo: Arc<dyn Repository>) -> Result<(Arc<Orchestrator>, Arc<Pool>)> {
    let manager = Arc::new(SandboxManager::new(
        config.sandboxes_dir(),
        backend_preference(config.sandbox_backend),
    )?);

    let tmp_dir = std::env::temp_dir().join("ash-snapshot-work");
    let snapshot_store = ash_snapshot::snapshot_store_from_config(
        config.snapshot_url.as_deref(),
        config.snapshots_dir(),
    )?;
    let restore_hook = Arc::new(SnapshotRestoreHook::new(snapshot_store.clone(), tmp_dir.clone()));
    let eviction_hooks = Arc::new(SnapshotEvictionHooks::new(repo.clone(), snapshot_store.clone(), tmp_dir));

    let pool_config = PoolConfig {
        max_capacity: config.max_sandboxes as u64,
        idle_timeout: Duration::from_millis(config.idle_timeout_ms),
        cold_ttl: Duration::from_millis(config.cold_ttl_ms),
    };
    let pool = Arc::new(Pool::new(repo.clone(), manager, eviction_hooks, pool_config));

    let orchestrator = Arc::new(Orchestrator::new(
        repo,
        pool.clone(),
        snapshot_store,
        restore_hook,
        resolve_runtime_binary(),
        ResourceLimits::default(),
        false,
        config.debug_timing,
    ));

    Ok((orchestrator, pool))
}

fn spawn_pool_sweepers(pool: Arc<Pool>) {
    let idle_pool = pool.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            if let Err(err) = idle_pool.sweep_idle().await {
                warn!(%err, "idle sweep failed");
            }
        }
    });
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            ticker.tick().await;
            if let Err(err) = pool.sweep_cold().await {
                warn!(%err, "cold sweep failed");
            }
        }
    });
}

fn spawn_runner_registration(
    client: reqwest::Client,
    coordinator_url: String,
    secret: String,
    host: String,
    port: u16,
    max_sandboxes: u32,
    pool: Arc<Pool>,
) {
    tokio::spawn(async move {
        let register_url = format!("{coordinator_url}/api/internal/runners/register");
        let response = match client
            .post(&register_url)
            .header("X-Internal-Secret", &secret)
            .json(&serde_json::json!({ "host": host, "port": port, "maxSandboxes": max_sandboxes }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, "failed to register with coordinator");
                return;
            }
        };
        let runner: ash_core::model::Runner = match response.json().await {
            Ok(runner) => runner,
            Err(err) => {
                warn!(%err, "coordinator returned an unparseable registration response");
                return;
            }
        };
        info!(runner_id = %runner.id, "registered with coordinator");

        let heartbeat_url = format!(
            "{coordinator_url}/api/internal/runners/{}/heartbeat",
            runner.id
        );
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            let active_count = pool.live_count() as u32;
            let body = serde_json::json!({ "activeCount": active_count, "warmingCount": 0 });
            if let Err(err) = client
                .post(&heartbeat_url)
                .header("X-Internal-Secret", &secret)
                .json(&body)
                .send()
                .await
            {
                warn!(%err, "heartbeat to coordinator failed");
            }
        }
    });
}

fn session_and_agent_routes() -> Router<AppState> {
    Router::new()
        .route("/api/agents", post(routes::agents::create_agent).get(routes::agents::list_agents))
        .route(
            "/api/agents/:name",
            get(routes::agents::get_agent).delete(routes::agents::delete_agent),
        )
        .route("/api/sessions", post(routes::sessions::create_session).get(routes::sessions::list_sessions))
        .route(
            "/api/sessions/:id",
            get(routes::sessions::get_session).delete(routes::sessions::end_session),
        )
        .route("/api/sessions/:id/pause", post(routes::sessions::pause_session))
        .route("/api/sessions/:id/resume", post(routes::sessions::resume_session))
        .route("/api/sessions/:id/fork", post(routes::sessions::fork_session))
        .route("/api/sessions/:id/config", patch(routes::sessions::update_config))
        .route("/api/sessions/:id/messages", post(routes::sessions::send_message).get(routes::sessions::list_messages))
        .route("/api/sessions/:id/events", get(routes::sessions::list_events))
        .route("/api/sessions/:id/files", get(routes::sessions::list_files))
        .route("/api/sessions/:id/files/*path", get(routes::sessions::read_file))
        .route("/api/sessions/:id/exec", post(routes::sessions::exec))
}

fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/metrics", get(routes::health::metrics))
}

fn internal_runner_routes() -> Router<AppState> {
    Router::new()
        .route("/api/internal/runners/register", post(routes::internal::register_runner))
        .route("/api/internal/runners/:id/heartbeat", post(routes::internal::heartbeat))
        .route(
            "/api/internal/runners/:id/deregister",
            delete(routes::internal::deregister_runner),
        )
        .route("/api/internal/runners", get(routes::internal::list_runners))
}

fn build_router(mode: NodeMode, state: AppState) -> Router {
    let cors = CorsLayer::permissive();
    let health = health_routes().with_state(state.clone());

    let main_routes = match mode {
        NodeMode::Solo | NodeMode::Coordinator => session_and_agent_routes()
            .route_layer(middleware::from_fn_with_state(state.clone(), auth::bearer_auth)),
        NodeMode::Runner => session_and_agent_routes()
            .route_layer(middleware::from_fn_with_state(state.clone(), auth::internal_auth)),
    }
    .with_state(state.clone());

    let mut router = Router::new().merge(health).merge(main_routes);

    if mode == NodeMode::Coordinator {
        let internal = internal_runner_routes()
            .route_layer(middleware::from_fn_with_state(state.clone(), auth::internal_auth))
            .with_state(state);
        router = router.merge(internal);
    }

    router.layer(cors)
}
