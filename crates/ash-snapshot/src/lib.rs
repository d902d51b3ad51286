//! Pluggable blob stores for workspace snapshots and per-file attachments.
//! `ash-orchestrator` holds one `Arc<dyn SnapshotStore>` and an optional
//! `Arc<dyn FileStore>`, selected at startup by the
//! `ASH_SNAPSHOT_URL`/`ASH_FILE_STORE_URL` scheme (`s3://`, `gs://`, or a
//! bare local path — a null store means local-only operation).

pub mod error;
pub mod file_store;
pub mod snapshot_store;
pub mod tar;

use std::path::PathBuf;
use std::sync::Arc;

pub use error::{SnapshotError, SnapshotResult};
pub use file_store::{FileStore, LocalFileStore, ObjectFileStore};
pub use snapshot_store::{LocalSnapshotStore, ObjectSnapshotStore, SnapshotStore};

/// Build the `SnapshotStore` named by `url_or_path`, defaulting to a local
/// store rooted at `local_default` when unset. `s3://bucket/prefix` and
/// `gs://bucket/prefix` select the object-store-backed implementation.
pub fn snapshot_store_from_config(
    url_or_path: Option<&str>,
    local_default: PathBuf,
) -> SnapshotResult<Arc<dyn SnapshotStore>> {
    match url_or_path {
        None => Ok(Arc::new(LocalSnapshotStore::new(local_default))),
        Some(url) => {
            let (store, prefix) = build_object_store(url)?;
            Ok(Arc::new(ObjectSnapshotStore::new(store, prefix)))
        }
    }
}

/// Same scheme resolution as [`snapshot_store_from_config`], for the
/// attachment `FileStore`. Returns `None` for "no cloud persistence" only
/// when the caller passes `None` and chooses not to fall back to local —
/// `ash-server`'s composition root always provides a local default, so this
/// mirrors that signature.
pub fn file_store_from_config(
    url_or_path: Option<&str>,
    local_default: PathBuf,
) -> SnapshotResult<Arc<dyn FileStore>> {
    match url_or_path {
        None => Ok(Arc::new(LocalFileStore::new(local_default))),
        Some(url) => {
            let (store, prefix) = build_object_store(url)?;
            Ok(Arc::new(ObjectFileStore::new(store, prefix)))
        }
    }
}

fn build_object_store(url: &str) -> SnapshotResult<(Arc<dyn object_store::ObjectStore>, String)> {
    let parsed = url::Url::parse(url).map_err(|_| SnapshotError::InvalidUrl(url.to_string()))?;
    let prefix = parsed.path().trim_start_matches('/').to_string();

    match parsed.scheme() {
        #[cfg(feature = "s3")]
        "s3" => {
            let bucket = parsed.host_str().unwrap_or_default();
            let store = object_store::aws::AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()?;
            Ok((Arc::new(store), prefix))
        }
        #[cfg(feature = "gcs")]
        "gs" => {
            let bucket = parsed.host_str().unwrap_or_default();
            let store = object_store::gcp::GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(bucket)
                .build()?;
            Ok((Arc::new(store), prefix))
        }
        other => Err(SnapshotError::UnsupportedScheme(other.to_string())),
    }
}
