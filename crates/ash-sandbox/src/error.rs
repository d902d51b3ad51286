use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bridge client error: {0}")]
    Bridge(#[from] ash_bridge::client::BridgeClientError),

    #[error(
        "cgroups v2 access is required on Linux but unavailable; refusing to start rather than silently weaken isolation"
    )]
    CgroupsRequired,

    #[error("no isolation backend available for this platform/preference")]
    NoBackendAvailable,

    #[error("install.sh failed with status {0}")]
    InstallScriptFailed(i32),

    #[error("install.sh did not finish within {0:?}")]
    InstallScriptTimeout(std::time::Duration),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("sandbox {0} not found")]
    NotFound(String),

    #[error("disk limit exceeded: {used_mb}MB > {limit_mb}MB")]
    DiskLimitExceeded { used_mb: u64, limit_mb: u64 },

    #[error("exec did not finish within {0:?}")]
    ExecTimeout(std::time::Duration),

    #[error("exec requires a live sandbox process")]
    NotRunning,
}
