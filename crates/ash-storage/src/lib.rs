//! Repository implementations behind `ash_core::repository::Repository`: an
//! embedded single-writer SQLite backend for solo/dev deployments, and a
//! concurrent Postgres backend for coordinator-mode fleets. Both run the same
//! [`migrations::MIGRATIONS`] set, so moving a tenant from one to the other
//! is a data-copy, not a schema rewrite.

pub mod error;
pub mod migrations;
pub mod postgres;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use ash_core::repository::Repository;

pub use error::StorageError;
pub use postgres::PostgresRepository;
pub use sqlite::SqliteRepository;

/// Opens the embedded backend at `path`, running any pending migrations.
pub async fn open_sqlite(path: &Path) -> Result<Arc<dyn Repository>, StorageError> {
    Ok(Arc::new(SqliteRepository::open(path).await?))
}

/// Connects to the concurrent backend at `database_url`, running any
/// pending migrations.
pub async fn connect_postgres(database_url: &str) -> Result<Arc<dyn Repository>, StorageError> {
    Ok(Arc::new(PostgresRepository::connect(database_url).await?))
}
