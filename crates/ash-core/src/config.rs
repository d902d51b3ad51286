//! Environment-driven configuration. Parsed once at startup into a typed
//! [`AshConfig`]; binaries layer `clap` flags on top where a flag should
//! override the environment (mirrors `crates/service/src/main.rs`'s `Args`,
//! which takes `--addr`/`--auth-key` as overrides of env defaults).

use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    Solo,
    Coordinator,
    Runner,
}

impl std::str::FromStr for NodeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "solo" => Ok(NodeMode::Solo),
            "coordinator" => Ok(NodeMode::Coordinator),
            "runner" => Ok(NodeMode::Runner),
            other => Err(format!("unknown ASH_MODE: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackendPref {
    Gvisor,
    Bwrap,
    Auto,
}

impl std::str::FromStr for SandboxBackendPref {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gvisor" => Ok(SandboxBackendPref::Gvisor),
            "bwrap" => Ok(SandboxBackendPref::Bwrap),
            "auto" => Ok(SandboxBackendPref::Auto),
            other => Err(format!("unknown ASH_SANDBOX_BACKEND: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AshConfig {
    pub api_key: Option<String>,
    pub internal_secret: Option<String>,
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub snapshot_url: Option<String>,
    pub file_store_url: Option<String>,
    pub sandbox_backend: SandboxBackendPref,
    pub max_sandboxes: u32,
    pub idle_timeout_ms: u64,
    pub cold_ttl_ms: u64,
    pub mode: NodeMode,
    pub debug_timing: bool,
    /// Runner heartbeat deadline: a runner that misses this is dead.
    pub heartbeat_timeout_ms: u64,
    /// How often a coordinator sweeps for dead runners.
    pub health_sweep_interval_ms: u64,
}

impl Default for AshConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            internal_secret: None,
            database_url: None,
            data_dir: default_data_dir(),
            snapshot_url: None,
            file_store_url: None,
            sandbox_backend: SandboxBackendPref::Auto,
            max_sandboxes: 32,
            idle_timeout_ms: 15 * 60 * 1000,
            cold_ttl_ms: 24 * 60 * 60 * 1000,
            mode: NodeMode::Solo,
            debug_timing: false,
            heartbeat_timeout_ms: 30_000,
            health_sweep_interval_ms: 10_000,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ash")
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_string(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_string(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AshConfig {
    /// Load configuration from `ASH_*` environment variables, falling back
    /// to the defaults above for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: env_string("ASH_API_KEY"),
            internal_secret: env_string("ASH_INTERNAL_SECRET"),
            database_url: env_string("ASH_DATABASE_URL"),
            data_dir: env_string("ASH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            snapshot_url: env_string("ASH_SNAPSHOT_URL"),
            file_store_url: env_string("ASH_FILE_STORE_URL"),
            sandbox_backend: env_string("ASH_SANDBOX_BACKEND")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sandbox_backend),
            max_sandboxes: env_u32("ASH_MAX_SANDBOXES", defaults.max_sandboxes),
            idle_timeout_ms: env_u64("ASH_IDLE_TIMEOUT_MS", defaults.idle_timeout_ms),
            cold_ttl_ms: env_u64("ASH_COLD_TTL_MS", defaults.cold_ttl_ms),
            mode: env_string("ASH_MODE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.mode),
            debug_timing: env_string("ASH_DEBUG_TIMING").is_some(),
            heartbeat_timeout_ms: env_u64("ASH_HEARTBEAT_TIMEOUT_MS", defaults.heartbeat_timeout_ms),
            health_sweep_interval_ms: env_u64(
                "ASH_HEALTH_SWEEP_INTERVAL_MS",
                defaults.health_sweep_interval_ms,
            ),
        }
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.data_dir.join("sandboxes")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.data_dir.join("agents")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ash.db")
    }

    pub fn initial_api_key_path(&self) -> PathBuf {
        self.data_dir.join("initial-api-key")
    }
}
