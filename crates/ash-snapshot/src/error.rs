use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    Object(#[from] object_store::Error),

    #[error("unsupported store URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid store URL: {0}")]
    InvalidUrl(String),

    #[error("key escapes store root: {0}")]
    PathTraversal(String),

    #[error("key contains a null byte: {0}")]
    NullByteInKey(String),

    #[error("no snapshot found for session {0}")]
    NotFound(String),
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;
