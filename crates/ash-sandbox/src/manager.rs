//! Sandbox Manager: `create`, `destroy`, `getLogs`. Owns exactly one OS
//! process per live sandbox, wires up its bridge channel, and keeps a bounded
//! log tail for each.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ash_bridge::client::BridgeClient;
use ash_core::ids::{SandboxId, SessionId};
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend::{BackendPreference, IsolationBackend, SpawnSpec, select_backend};
use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::logs::{LogEntry, LogSource, LogStream};

const INSTALL_SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);
const BRIDGE_CONNECT_CAP: Duration = Duration::from_secs(10);
const BRIDGE_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback invoked when a sandbox's process is observed to have exited
/// unexpectedly (OOM kill or crash). The orchestrator hooks this to mark the
/// bound session errored.
pub type OomCallback = Arc<dyn Fn(SandboxId) + Send + Sync>;

/// Per-phase timings measured during `create`, surfaced for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct StartupTimings {
    pub workspace_prepare_ms: u64,
    pub install_script_ms: Option<u64>,
    pub spawn_ms: u64,
    pub bridge_ready_ms: u64,
}

/// Inputs to [`SandboxManager::create`].
pub struct CreateOpts {
    /// Directory to stage as the workspace. Copied unless `resuming` is set,
    /// in which case it's assumed to already be the sandbox's own workspace
    /// (e.g. restored from a snapshot by the caller).
    pub agent_dir: PathBuf,
    pub session_id: SessionId,
    pub tenant: String,
    pub fixed_id: Option<SandboxId>,
    pub resuming: bool,
    pub limits: ResourceLimits,
    pub extra_env: HashMap<String, String>,
    pub allow_network: bool,
    /// Path to the `ash-runtime` binary to launch inside the sandbox.
    pub runtime_binary: PathBuf,
}

struct LiveSandbox {
    pid: Option<u32>,
    /// Set by `destroy` before signalling the process, so the exit-watcher
    /// task knows a shutdown was requested and skips the OOM callback.
    destroying: Arc<AtomicBool>,
    /// Flips to `true` once the exit-watcher task observes the process has
    /// exited, however it exited.
    exited: watch::Receiver<bool>,
    socket_path: PathBuf,
    workspace_dir: PathBuf,
    /// Taken by the orchestrator once, via [`SandboxManager::take_bridge`],
    /// and split into independent send/receive halves for the session's
    /// lifetime.
    bridge: Option<BridgeClient>,
    logs: Arc<LogStream>,
}

/// A handle to a running sandbox, returned by [`SandboxManager::create`].
pub struct ManagedSandbox {
    pub id: SandboxId,
    pub socket_path: PathBuf,
    pub workspace_dir: PathBuf,
    pub timings: StartupTimings,
}

pub struct SandboxManager {
    data_dir: PathBuf,
    backend: Arc<dyn IsolationBackend>,
    live: RwLock<HashMap<SandboxId, LiveSandbox>>,
    oom_callback: Arc<RwLock<Option<OomCallback>>>,
}

impl SandboxManager {
    pub fn new(data_dir: PathBuf, backend_pref: BackendPreference) -> Result<Self, SandboxError> {
        let backend = select_backend(backend_pref)?;
        info!(backend = backend.name(), "sandbox isolation backend selected");
        Ok(Self {
            data_dir,
            backend: Arc::from(backend),
            live: RwLock::new(HashMap::new()),
            oom_callback: Arc::new(RwLock::new(None)),
        })
    }

    /// Construct with an explicit backend, bypassing host probing. Used by
    /// tests that want a deterministic backend regardless of what's
    /// installed on the machine running the suite.
    pub fn with_backend(data_dir: PathBuf, backend: Box<dyn IsolationBackend>) -> Self {
        info!(backend = backend.name(), "sandbox isolation backend set explicitly");
        Self {
            data_dir,
            backend: Arc::from(backend),
            live: RwLock::new(HashMap::new()),
            oom_callback: Arc::new(RwLock::new(None)),
        }
    }

    pub fn set_oom_callback(&self, cb: OomCallback) {
        *self.oom_callback.write() = Some(cb);
    }

    fn workspace_dir_for(&self, id: SandboxId) -> PathBuf {
        self.data_dir.join("sandboxes").join(id.to_string())
    }

    fn socket_path_for(&self, id: SandboxId) -> PathBuf {
        self.data_dir.join("sockets").join(format!("{id}.sock"))
    }

    /// Create exactly one isolated process, wire its bridge channel, and wait
    /// for its `ready` event before returning.
    pub async fn create(&self, opts: CreateOpts) -> Result<ManagedSandbox, SandboxError> {
        let mut timings = StartupTimings::default();
        let id = opts.fixed_id.unwrap_or_default();

        let prepare_start = Instant::now();
        let workspace_dir = self.workspace_dir_for(id);
        tokio::fs::create_dir_all(&workspace_dir).await?;
        if !opts.resuming {
            copy_dir_recursive(&opts.agent_dir, &workspace_dir).await?;
        }
        let socket_path = self.socket_path_for(id);
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if socket_path.exists() {
            tokio::fs::remove_file(&socket_path).await?;
        }
        timings.workspace_prepare_ms = prepare_start.elapsed().as_millis() as u64;

        let install_script = workspace_dir.join("install.sh");
        if !opts.resuming && install_script.exists() {
            let install_start = Instant::now();
            self.run_install_script(&install_script, &workspace_dir).await?;
            timings.install_script_ms = Some(install_start.elapsed().as_millis() as u64);
        }

        let mut env = opts.extra_env.clone();
        env.insert("ASH_SESSION_ID".into(), opts.session_id.to_string());
        env.insert("ASH_TENANT".into(), opts.tenant.clone());
        env.insert("ASH_SOCKET_PATH".into(), socket_path.to_string_lossy().into_owned());

        let spawn_start = Instant::now();
        let spec = SpawnSpec {
            program: opts.runtime_binary.clone(),
            args: vec!["--socket".into(), socket_path.to_string_lossy().into_owned()],
            env,
            workspace_dir: workspace_dir.clone(),
            limits: opts.limits.clone(),
            allow_network: opts.allow_network,
        };
        let mut child = self.backend.spawn(&spec).await?;
        timings.spawn_ms = spawn_start.elapsed().as_millis() as u64;

        let pid = child.id();
        if let Some(pid) = pid {
            confine_to_cgroup(id, pid, &opts.limits);
        }
        let logs = Arc::new(LogStream::default());
        wire_output_capture(&mut child, logs.clone());

        let destroying = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited_rx) = watch::channel(false);
        spawn_exit_watcher(id, child, destroying.clone(), exited_tx, self.oom_callback.clone());
        spawn_disk_monitor(id, workspace_dir.clone(), opts.limits.disk_mb, pid, exited_rx.clone());

        let ready_start = Instant::now();
        let mut bridge = BridgeClient::connect(&socket_path, BRIDGE_CONNECT_CAP)
            .await
            .map_err(SandboxError::Bridge)?;
        bridge
            .wait_ready(BRIDGE_READY_TIMEOUT)
            .await
            .map_err(SandboxError::Bridge)?;
        timings.bridge_ready_ms = ready_start.elapsed().as_millis() as u64;

        self.live.write().insert(
            id,
            LiveSandbox {
                pid,
                destroying,
                exited: exited_rx,
                socket_path: socket_path.clone(),
                workspace_dir: workspace_dir.clone(),
                bridge: Some(bridge),
                logs,
            },
        );

        Ok(ManagedSandbox {
            id,
            socket_path,
            workspace_dir,
            timings,
        })
    }

    async fn run_install_script(&self, script: &Path, cwd: &Path) -> Result<(), SandboxError> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg(script).current_dir(cwd).stdin(std::process::Stdio::null());
        let child = cmd.spawn()?;
        let output = tokio::time::timeout(INSTALL_SCRIPT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| SandboxError::InstallScriptTimeout(INSTALL_SCRIPT_TIMEOUT))??;
        if !output.status.success() {
            return Err(SandboxError::InstallScriptFailed(output.status.code().unwrap_or(-1)));
        }
        Ok(())
    }

    pub fn is_live(&self, id: SandboxId) -> bool {
        self.live.read().contains_key(&id)
    }

    /// Take the bridge connection for a live sandbox, for splitting into
    /// send/receive halves. Can only be taken once; a second call for the
    /// same sandbox returns `NotFound`.
    pub fn take_bridge(&self, id: SandboxId) -> Result<BridgeClient, SandboxError> {
        let mut live = self.live.write();
        let sandbox = live.get_mut(&id).ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        sandbox.bridge.take().ok_or_else(|| SandboxError::NotFound(id.to_string()))
    }

    pub fn get_logs(&self, id: SandboxId, after: Option<u64>) -> Result<Vec<LogEntry>, SandboxError> {
        let live = self.live.read();
        let sandbox = live.get(&id).ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        Ok(sandbox.logs.tail(after))
    }

    /// Run `command` inside the sandbox's isolation boundary (see
    /// [`IsolationBackend::exec`]), bounded by `timeout`.
    pub async fn exec(
        &self,
        id: SandboxId,
        command: &str,
        timeout: Duration,
    ) -> Result<crate::backend::ExecOutput, SandboxError> {
        let (pid, workspace_dir) = {
            let live = self.live.read();
            let sandbox = live.get(&id).ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
            (sandbox.pid, sandbox.workspace_dir.clone())
        };
        tokio::time::timeout(timeout, self.backend.exec(pid, &workspace_dir, command))
            .await
            .map_err(|_| SandboxError::ExecTimeout(timeout))?
    }

    /// Destroy a sandbox: graceful SIGTERM, 5s grace period, then SIGKILL;
    /// remove the socket and workspace directory. A missing sandbox is a
    /// no-op, per failure semantics.
    pub async fn destroy(&self, id: SandboxId) -> Result<(), SandboxError> {
        let Some(mut sandbox) = self.live.write().remove(&id) else {
            return Ok(());
        };

        sandbox.destroying.store(true, Ordering::SeqCst);
        signal_pid(sandbox.pid, Signal::Term);

        if tokio::time::timeout(Duration::from_secs(5), sandbox.exited.changed())
            .await
            .is_err()
        {
            warn!(sandbox_id = %id, "sandbox process did not exit within grace period, killing");
            signal_pid(sandbox.pid, Signal::Kill);
            let _ = sandbox.exited.changed().await;
        }

        if sandbox.socket_path.exists() {
            let _ = tokio::fs::remove_file(&sandbox.socket_path).await;
        }
        let _ = tokio::fs::remove_dir_all(&sandbox.workspace_dir).await;
        Ok(())
    }

    pub fn workspace_dir(&self, id: SandboxId) -> PathBuf {
        self.workspace_dir_for(id)
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_pid(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Term => nix::sys::signal::Signal::SIGTERM,
        Signal::Kill => nix::sys::signal::Signal::SIGKILL,
    };
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig);
}

#[cfg(not(unix))]
fn signal_pid(_pid: Option<u32>, _signal: Signal) {}

/// Places the child in its own cgroup v2 leaf with memory and pid-count
/// limits. Best-effort: a host without delegated cgroup write access logs and
/// the sandbox still runs, just without this extra confinement layer —
/// `select_backend` already refused to start if cgroups v2 isn't mounted at
/// all.
#[cfg(target_os = "linux")]
fn confine_to_cgroup(id: SandboxId, pid: u32, limits: &ResourceLimits) {
    use std::io::Write;

    let dir = std::path::PathBuf::from("/sys/fs/cgroup/ash.slice").join(id.to_string());
    let result = (|| -> std::io::Result<()> {
        std::fs::create_dir_all(&dir)?;
        std::fs::File::create(dir.join("memory.max"))?
            .write_all(limits.memory_bytes().to_string().as_bytes())?;
        std::fs::File::create(dir.join("pids.max"))?
            .write_all(limits.max_processes.to_string().as_bytes())?;
        std::fs::File::create(dir.join("cgroup.procs"))?.write_all(pid.to_string().as_bytes())?;
        Ok(())
    })();
    if let Err(err) = result {
        warn!(sandbox_id = %id, %err, "cgroup confinement unavailable, continuing without it");
    }
}

#[cfg(not(target_os = "linux"))]
fn confine_to_cgroup(_id: SandboxId, _pid: u32, _limits: &ResourceLimits) {}

/// Owns the child's `wait` for the rest of the process's life. Fires the
/// `exited` watch and, unless a `destroy` is in flight, the OOM callback —
/// this is how an unexpected crash (or OOM kill) surfaces to the pool without
/// the manager polling.
fn spawn_exit_watcher(
    id: SandboxId,
    mut child: Child,
    destroying: Arc<AtomicBool>,
    exited_tx: watch::Sender<bool>,
    oom_callback: Arc<RwLock<Option<OomCallback>>>,
) {
    tokio::spawn(async move {
        let status = child.wait().await;
        let _ = exited_tx.send(true);
        if !destroying.load(Ordering::SeqCst) {
            warn!(sandbox_id = %id, ?status, "sandbox process exited unexpectedly");
            if let Some(cb) = oom_callback.read().as_ref() {
                cb(id);
            }
        }
    });
}

/// Periodically sums the workspace directory's size and kills the sandbox if
/// it exceeds `limit_mb`, per `spec.md` §4.1's "disk-size-per-workspace
/// (polled by a background monitor; on breach the sandbox is destroyed)".
/// Unrefs itself as soon as `exited` fires so it never outlives the sandbox
/// or blocks process shutdown, per `spec.md` §9's sweeper-lifecycle note.
fn spawn_disk_monitor(
    id: SandboxId,
    workspace_dir: PathBuf,
    limit_mb: u64,
    pid: Option<u32>,
    mut exited: watch::Receiver<bool>,
) {
    if limit_mb == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = exited.changed() => break,
            }
            if *exited.borrow() {
                break;
            }
            let dir = workspace_dir.clone();
            let used_mb = match tokio::task::spawn_blocking(move || dir_size_mb(&dir)).await {
                Ok(used) => used,
                Err(_) => continue,
            };
            if used_mb > limit_mb {
                warn!(
                    sandbox_id = %id,
                    used_mb,
                    limit_mb,
                    "workspace disk limit exceeded, killing sandbox"
                );
                signal_pid(pid, Signal::Kill);
                break;
            }
        }
    });
}

fn dir_size_mb(root: &Path) -> u64 {
    fn walk(dir: &Path, total: &mut u64) {
        let Ok(entries) = std::fs::read_dir(dir) else { return };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else { continue };
            if file_type.is_dir() {
                walk(&entry.path(), total);
            } else if let Ok(metadata) = entry.metadata() {
                *total += metadata.len();
            }
        }
    }
    let mut bytes = 0u64;
    walk(root, &mut bytes);
    bytes / (1024 * 1024)
}

fn wire_output_capture(child: &mut Child, logs: Arc<LogStream>) {
    if let Some(stdout) = child.stdout.take() {
        let logs = logs.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logs.push(LogSource::Stdout, line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logs.push(LogSource::Stderr, line);
            }
        });
    }
}

async fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((src_dir, dst_dir)) = stack.pop() {
        tokio::fs::create_dir_all(&dst_dir).await?;
        let mut entries = tokio::fs::read_dir(&src_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let dst_path = dst_dir.join(entry.file_name());
            if file_type.is_dir() {
                stack.push((entry.path(), dst_path));
            } else if file_type.is_file() {
                tokio::fs::copy(entry.path(), &dst_path).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_nested_directories() {
        let src = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(src.path().join("sub")).await.unwrap();
        tokio::fs::write(src.path().join("a.txt"), b"hello").await.unwrap();
        tokio::fs::write(src.path().join("sub/b.txt"), b"world").await.unwrap();

        let dst = tempfile::tempdir().unwrap();
        copy_dir_recursive(src.path(), dst.path()).await.unwrap();

        assert_eq!(
            tokio::fs::read_to_string(dst.path().join("a.txt")).await.unwrap(),
            "hello"
        );
        assert_eq!(
            tokio::fs::read_to_string(dst.path().join("sub/b.txt")).await.unwrap(),
            "world"
        );
    }

    #[test]
    fn dir_size_mb_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![0u8; 1024 * 1024]).unwrap();
        std::fs::write(dir.path().join("sub/b.bin"), vec![0u8; 2 * 1024 * 1024]).unwrap();
        assert_eq!(dir_size_mb(dir.path()), 3);
    }

    #[test]
    fn dir_size_mb_of_a_missing_directory_is_zero() {
        assert_eq!(dir_size_mb(Path::new("/no/such/path/ash-test")), 0);
    }
}
