//! Isolation backends. Generalizes `querymt-sandbox`'s strongest-first
//! platform probing (there: Landlock on Linux, Seatbelt on macOS) to four
//! backends: gVisor syscall interception, bubblewrap namespace + bind-mount
//! isolation, cgroups-only, and a rlimit-only fallback for platforms without
//! either.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::error::SandboxError;
use crate::limits::ResourceLimits;

/// Captured output of a command run via [`IsolationBackend::exec`].
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

async fn run_capture(mut cmd: Command) -> Result<ExecOutput, SandboxError> {
    let output = cmd.output().await?;
    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Everything an isolation backend needs to launch the sandboxed child.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub workspace_dir: PathBuf,
    pub limits: ResourceLimits,
    /// Whether the workspace directory itself should be writable (it always
    /// is) vs. read-only mounts for everything outside it.
    pub allow_network: bool,
}

/// A strategy for launching and confining a sandboxed process.
/// Implementations are probed strongest-first by [`select_backend`]; once
/// selected a backend is used for the lifetime of the process (sandboxes are
/// not migrated between backends).
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn spawn(&self, spec: &SpawnSpec) -> Result<Child, SandboxError>;

    /// Run `command` inside the same isolation boundary the sandboxed
    /// process at `pid` was spawned into, rooted at `workspace_dir`. Backends
    /// that grant no filesystem isolation (cgroups-only, rlimit-only) may run
    /// the command directly on the host, since the trust boundary for those
    /// backends has already moved outward per `spec.md` §4.1.
    async fn exec(
        &self,
        pid: Option<u32>,
        workspace_dir: &Path,
        command: &str,
    ) -> Result<ExecOutput, SandboxError>;
}

/// `nsenter`-based exec, shared by the two namespace-isolating backends
/// (gVisor, bubblewrap): it re-enters the mount/PID/UTS/IPC/net namespaces
/// the sandboxed process is already living in, so the command sees exactly
/// the bind-mounted filesystem view the sandbox was spawned with rather than
/// the host's. A real gVisor deployment running persistent OCI containers
/// would instead shell out to `runsc exec <container-id>`; this backend
/// launches its child via `runsc do` (no durable container id to target), so
/// `nsenter` into the sentry's namespaces is the closest equivalent.
async fn nsenter_exec(
    pid: Option<u32>,
    workspace_dir: &Path,
    command: &str,
) -> Result<ExecOutput, SandboxError> {
    let pid = pid.ok_or(SandboxError::NotRunning)?;
    let mut cmd = Command::new("nsenter");
    cmd.arg("--target")
        .arg(pid.to_string())
        .arg("--mount")
        .arg("--uts")
        .arg("--ipc")
        .arg("--pid")
        .arg("--net")
        .arg("--wd")
        .arg(workspace_dir)
        .arg("--")
        .arg("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    run_capture(cmd).await
}

async fn host_exec(workspace_dir: &Path, command: &str) -> Result<ExecOutput, SandboxError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workspace_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    run_capture(cmd).await
}

/// User-facing backend preference, mirrored from [`ash_core::config::SandboxBackendPref`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPreference {
    Gvisor,
    Bwrap,
    Auto,
}

fn command_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
        })
        .unwrap_or(false)
}

fn cgroups_v2_available() -> bool {
    std::path::Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}

/// Probe the host for the strongest backend that satisfies `pref`, refusing
/// to start rather than silently weakening isolation when the platform is
/// Linux and cgroups v2 is unavailable.
pub fn select_backend(pref: BackendPreference) -> Result<Box<dyn IsolationBackend>, SandboxError> {
    let on_linux = cfg!(target_os = "linux");

    if on_linux && !cgroups_v2_available() {
        return Err(SandboxError::CgroupsRequired);
    }

    match pref {
        BackendPreference::Gvisor => {
            if on_linux && command_exists("runsc") {
                return Ok(Box::new(GvisorBackend));
            }
            Err(SandboxError::NoBackendAvailable)
        }
        BackendPreference::Bwrap => {
            if on_linux && command_exists("bwrap") {
                return Ok(Box::new(BwrapBackend));
            }
            Err(SandboxError::NoBackendAvailable)
        }
        BackendPreference::Auto => {
            if on_linux && command_exists("runsc") {
                return Ok(Box::new(GvisorBackend));
            }
            if on_linux && command_exists("bwrap") {
                return Ok(Box::new(BwrapBackend));
            }
            if on_linux {
                return Ok(Box::new(CgroupsOnlyBackend));
            }
            Ok(Box::new(RlimitOnlyBackend))
        }
    }
}

fn base_command(spec: &SpawnSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.workspace_dir)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// Syscall-interception isolation via gVisor's `runsc`. Strongest backend:
/// every syscall the sandboxed process makes is intercepted by a userspace
/// kernel, so a kernel exploit inside the sandbox does not reach the host.
pub struct GvisorBackend;

#[async_trait]
impl IsolationBackend for GvisorBackend {
    fn name(&self) -> &'static str {
        "gvisor"
    }

    async fn spawn(&self, spec: &SpawnSpec) -> Result<Child, SandboxError> {
        let mut cmd = Command::new("runsc");
        cmd.arg("do")
            .arg("--network")
            .arg(if spec.allow_network { "host" } else { "none" })
            .arg(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.workspace_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.spawn().map_err(SandboxError::Io)
    }

    async fn exec(
        &self,
        pid: Option<u32>,
        workspace_dir: &Path,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        nsenter_exec(pid, workspace_dir, command).await
    }
}

/// Namespace + bind-mount isolation via bubblewrap. Read-only bind of `/`,
/// read-write bind of the workspace directory only, network namespace
/// dropped unless `allow_network` is set.
pub struct BwrapBackend;

#[async_trait]
impl IsolationBackend for BwrapBackend {
    fn name(&self) -> &'static str {
        "bwrap"
    }

    async fn spawn(&self, spec: &SpawnSpec) -> Result<Child, SandboxError> {
        let workspace = spec.workspace_dir.to_string_lossy().to_string();
        let mut cmd = Command::new("bwrap");
        cmd.arg("--ro-bind").arg("/").arg("/")
            .arg("--dev").arg("/dev")
            .arg("--proc").arg("/proc")
            .arg("--bind").arg(&workspace).arg(&workspace)
            .arg("--die-with-parent")
            .arg("--new-session");
        if !spec.allow_network {
            cmd.arg("--unshare-net");
        }
        cmd.arg(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.workspace_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.spawn().map_err(SandboxError::Io)
    }

    async fn exec(
        &self,
        pid: Option<u32>,
        workspace_dir: &Path,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        nsenter_exec(pid, workspace_dir, command).await
    }
}

/// cgroups v2 accounting/limits with no namespace isolation. Used when
/// neither gVisor nor bubblewrap is installed but cgroups v2 is present.
pub struct CgroupsOnlyBackend;

#[async_trait]
impl IsolationBackend for CgroupsOnlyBackend {
    fn name(&self) -> &'static str {
        "cgroups-only"
    }

    async fn spawn(&self, spec: &SpawnSpec) -> Result<Child, SandboxError> {
        // Cgroup placement happens after spawn, in the manager, since the
        // child's pid is required to write it into `cgroup.procs`.
        base_command(spec).spawn().map_err(SandboxError::Io)
    }

    async fn exec(
        &self,
        _pid: Option<u32>,
        workspace_dir: &Path,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        host_exec(workspace_dir, command).await
    }
}

/// `setrlimit`-only confinement for platforms with neither namespaces nor
/// cgroups v2 (e.g. macOS dev hosts). Weakest backend; never selected on
/// Linux because [`select_backend`] refuses to start there without cgroups.
pub struct RlimitOnlyBackend;

#[async_trait]
impl IsolationBackend for RlimitOnlyBackend {
    fn name(&self) -> &'static str {
        "rlimit-only"
    }

    async fn spawn(&self, spec: &SpawnSpec) -> Result<Child, SandboxError> {
        #[cfg(unix)]
        {
            let limits = spec.limits.clone();
            let mut cmd = base_command(spec);
            unsafe {
                cmd.pre_exec(move || apply_rlimits(&limits));
            }
            return cmd.spawn().map_err(SandboxError::Io);
        }
        #[cfg(not(unix))]
        {
            base_command(spec).spawn().map_err(SandboxError::Io)
        }
    }

    async fn exec(
        &self,
        _pid: Option<u32>,
        workspace_dir: &Path,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        host_exec(workspace_dir, command).await
    }
}

#[cfg(unix)]
fn apply_rlimits(limits: &ResourceLimits) -> std::io::Result<()> {
    use std::io;

    let as_limit = libc::rlimit {
        rlim_cur: limits.memory_bytes(),
        rlim_max: limits.memory_bytes(),
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_AS, &as_limit) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let nproc_limit = libc::rlimit {
        rlim_cur: limits.max_processes as u64,
        rlim_max: limits.max_processes as u64,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NPROC, &nproc_limit) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(not(unix))]
fn apply_rlimits(_limits: &ResourceLimits) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rlimit_only_exec_runs_in_the_workspace_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = RlimitOnlyBackend
            .exec(None, dir.path(), "pwd")
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        let stdout = String::from_utf8(out.stdout).unwrap();
        assert_eq!(stdout.trim(), dir.path().to_string_lossy());
    }

    #[tokio::test]
    async fn rlimit_only_exec_reports_nonzero_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let out = RlimitOnlyBackend.exec(None, dir.path(), "exit 7").await.unwrap();
        assert_eq!(out.exit_code, 7);
    }

    #[tokio::test]
    async fn namespace_backends_require_a_live_pid() {
        let dir = tempfile::tempdir().unwrap();
        let err = GvisorBackend.exec(None, dir.path(), "true").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotRunning));
        let err = BwrapBackend.exec(None, dir.path(), "true").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotRunning));
    }
}
