//! Workspace file access: listing and reading files directly against a live
//! sandbox's workspace directory rather than going through the bridge.
//! `exec`'s actual command execution lives in `ash-sandbox`'s isolation
//! backends (`Orchestrator::exec` dispatches there); this module only clamps
//! its timeout and resolves/reads/lists paths with the same traversal
//! defense `ash-snapshot`'s stores apply to tarball keys.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ash_core::error::{ApiError, ApiResult};
use serde::Serialize;

const MAX_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub is_dir: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Resolve `rel_path` against `workspace_dir`, rejecting anything that
/// escapes it — the same traversal defense `ash-snapshot`'s stores apply
/// to tarball keys, generalized to an arbitrary relative path.
pub fn resolve_in_workspace(workspace_dir: &Path, rel_path: &str) -> ApiResult<PathBuf> {
    if rel_path.contains('\0') {
        return Err(ApiError::Validation("path contains a null byte".into()));
    }
    let joined = workspace_dir.join(rel_path.trim_start_matches('/'));
    let canonical_root = workspace_dir
        .canonicalize()
        .map_err(|e| ApiError::Internal(e.into()))?;
    let canonical = match joined.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            // Path doesn't exist yet (e.g. a write target); validate the
            // lexical form instead of the canonical one.
            if joined.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
                return Err(ApiError::Validation(format!("path escapes workspace: {rel_path}")));
            }
            return Ok(joined);
        }
    };
    if !canonical.starts_with(&canonical_root) {
        return Err(ApiError::Validation(format!("path escapes workspace: {rel_path}")));
    }
    Ok(canonical)
}

/// Recursively list every file and directory under `workspace_dir`, skipping
/// the same reproducible/ephemeral subtrees a snapshot excludes — no point
/// surfacing `node_modules` over the API either.
pub async fn list_files(workspace_dir: &Path) -> ApiResult<Vec<FileEntry>> {
    let root = workspace_dir.to_path_buf();
    tokio::task::spawn_blocking(move || walk(&root, Path::new("")))
        .await
        .map_err(|e| ApiError::Internal(e.into()))?
}

fn walk(base: &Path, rel: &Path) -> ApiResult<Vec<FileEntry>> {
    let dir = base.join(rel);
    let mut out = Vec::new();
    let entries = std::fs::read_dir(&dir).map_err(|e| ApiError::Internal(e.into()))?;
    let mut entries: Vec<_> = entries.collect::<Result<_, _>>().map_err(|e| ApiError::Internal(e.into()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let rel_path = rel.join(entry.file_name());
        if ash_snapshot::tar::EXCLUDED_DIRS
            .iter()
            .any(|d| rel_path.components().any(|c| c.as_os_str() == *d))
        {
            continue;
        }
        let file_type = entry.file_type().map_err(|e| ApiError::Internal(e.into()))?;
        let metadata = entry.metadata().map_err(|e| ApiError::Internal(e.into()))?;
        out.push(FileEntry {
            path: rel_path.to_string_lossy().replace('\\', "/"),
            is_dir: file_type.is_dir(),
            size_bytes: metadata.len(),
        });
        if file_type.is_dir() {
            out.extend(walk(base, &rel_path)?);
        }
    }
    Ok(out)
}

pub async fn read_file(workspace_dir: &Path, rel_path: &str) -> ApiResult<Vec<u8>> {
    let path = resolve_in_workspace(workspace_dir, rel_path)?;
    tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::NotFound(format!("{rel_path}: {e}")))
}

/// Clamps a caller-supplied exec timeout to [`MAX_EXEC_TIMEOUT`]. The actual
/// command runs inside the sandbox's isolation boundary via
/// `Orchestrator::exec` -> `Pool::exec` -> `SandboxManager::exec`, not here.
pub fn clamp_exec_timeout(timeout: Duration) -> Duration {
    timeout.min(MAX_EXEC_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_plain_relative_path_under_the_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        let resolved = resolve_in_workspace(dir.path(), "notes.txt").unwrap();
        assert_eq!(resolved, dir.path().canonicalize().unwrap().join("notes.txt"));
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_in_workspace(dir.path(), "../../etc/passwd").unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn rejects_traversal_through_an_existing_symlinked_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("work")).unwrap();
        let resolved = resolve_in_workspace(dir.path().join("work").as_path(), "../secret.txt");
        assert!(resolved.is_err());
    }

    #[test]
    fn rejects_a_null_byte_in_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_in_workspace(dir.path(), "a\0b").unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
