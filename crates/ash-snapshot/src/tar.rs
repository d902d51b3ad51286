//! Workspace tarball creation/extraction. A snapshot is a single
//! gzip-compressed tarball of a session's workspace directory, excluding
//! reproducible/ephemeral subtrees — names `node_modules`, `.git`, cache
//! dirs, temp dirs, virtualenvs; widens that to the obvious ecosystem
//! equivalents.

use std::path::{Path, PathBuf};

use crate::error::{SnapshotError, SnapshotResult};

/// Directory names excluded from every tarball, regardless of depth.
pub const EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "__pycache__",
    ".venv",
    "venv",
    ".mypy_cache",
    ".pytest_cache",
    "target",
    ".cache",
    ".tox",
    "dist",
    ".next",
];

fn is_excluded(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| EXCLUDED_DIRS.contains(&s))
            .unwrap_or(false)
    })
}

/// Build a `.tar.gz` of `workspace_dir` at `dest_path`, skipping excluded
/// subtrees. Blocking; callers run this via `spawn_blocking`.
pub fn create_tarball(workspace_dir: &Path, dest_path: &Path) -> SnapshotResult<()> {
    if let Some(parent) = dest_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(dest_path)?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    append_dir(&mut builder, workspace_dir, Path::new(""))?;

    let encoder = builder.into_inner().map_err(SnapshotError::Io)?;
    encoder.finish().map_err(SnapshotError::Io)?;
    Ok(())
}

fn append_dir<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    base: &Path,
    rel: &Path,
) -> SnapshotResult<()> {
    let dir = base.join(rel);
    let mut entries: Vec<_> = std::fs::read_dir(&dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let file_type = entry.file_type()?;
        let entry_rel = rel.join(entry.file_name());
        if is_excluded(&entry_rel) {
            continue;
        }
        if file_type.is_dir() {
            append_dir(builder, base, &entry_rel)?;
        } else if file_type.is_file() {
            let mut f = std::fs::File::open(entry.path())?;
            builder.append_file(&entry_rel, &mut f)?;
        } else if file_type.is_symlink() {
            // Skip symlinks: a workspace shouldn't contain any pointing
            // outside itself, and tar's symlink semantics on extract would
            // otherwise let one escape the restore root.
            continue;
        }
    }
    Ok(())
}

/// Extract a `.tar.gz` into `dest_dir`, creating it if missing. Blocking.
pub fn extract_tarball(tar_path: &Path, dest_dir: &Path) -> SnapshotResult<()> {
    std::fs::create_dir_all(dest_dir)?;
    let file = std::fs::File::open(tar_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest_dir)?;
    Ok(())
}

pub fn default_tmp_tarball_path(tmp_dir: &Path, session_id: &str) -> PathBuf {
    tmp_dir.join(format!("{session_id}.tar.gz"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_directory_excluding_node_modules() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("keep.txt"), b"hi").unwrap();
        std::fs::create_dir_all(src.path().join("node_modules/pkg")).unwrap();
        std::fs::write(src.path().join("node_modules/pkg/index.js"), b"drop me").unwrap();
        std::fs::create_dir_all(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/nested.txt"), b"nested").unwrap();

        let tarball = src.path().with_extension("tar.gz");
        create_tarball(src.path(), &tarball).unwrap();

        let dest = tempfile::tempdir().unwrap();
        extract_tarball(&tarball, dest.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.path().join("keep.txt")).unwrap(),
            "hi"
        );
        assert_eq!(
            std::fs::read_to_string(dest.path().join("sub/nested.txt")).unwrap(),
            "nested"
        );
        assert!(!dest.path().join("node_modules").exists());
    }
}
