//! SQLite backing for the durable archive ledger.
//!
//! A [`Database`] owns a small connection pool over one file, configured for
//! WAL journaling so ledger loads never wait on an append, and runs the
//! embedded migrations on open. The `archive` table is the only schema; its
//! queries live here so the ledger store stays free of SQL.
//!
//! # Example
//!
//! ```no_run
//! use mediafetch_core::db::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("archive.db")).await?;
//! let inserted = db.insert_archive_entry("youtube.com", "dQw4w9WgXcQ").await?;
//! assert!(inserted);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

/// Appends are serialized by the ledger, so a handful of connections is plenty.
const MAX_CONNECTIONS: u32 = 4;

/// How long a connection waits on a locked file before `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to connect or query.
    #[error("database error: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Pooled handle to the archive database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the archive database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the file cannot be opened,
    /// or `DbError::Migration` if the schema cannot be brought up to date.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        Self::migrated(pool).await
    }

    /// Creates a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the connection or migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        // One connection: every new in-memory connection is a fresh database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("archive schema up to date");
        Ok(Self { pool })
    }

    /// The underlying pool, for ad-hoc queries.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Every archived `(origin, canonical_id)` pair, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the query fails.
    pub async fn archive_entries(&self) -> Result<Vec<(String, String)>, DbError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT origin, canonical_id FROM archive ORDER BY recorded_at, rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Inserts one archive entry; returns false when it was already present.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the insert fails, including when
    /// either part is empty.
    #[instrument(skip(self))]
    pub async fn insert_archive_entry(
        &self,
        origin: &str,
        canonical_id: &str,
    ) -> Result<bool, DbError> {
        // ON CONFLICT absorbs duplicates only; CHECK violations still fail.
        let result = sqlx::query(
            "INSERT INTO archive (origin, canonical_id) VALUES (?, ?) \
             ON CONFLICT (origin, canonical_id) DO NOTHING",
        )
        .bind(origin)
        .bind(canonical_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Returns true if WAL journaling is active.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the query fails.
    pub async fn is_wal_enabled(&self) -> Result<bool, DbError> {
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        Ok(mode.eq_ignore_ascii_case("wal"))
    }

    /// Closes every pooled connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== Schema Tests ====================

    #[tokio::test]
    async fn test_insert_reports_new_and_existing_entries() {
        let db = Database::new_in_memory().await.unwrap();
        assert!(db.insert_archive_entry("a.com", "/v/1").await.unwrap());
        assert!(!db.insert_archive_entry("a.com", "/v/1").await.unwrap());
        assert!(db.insert_archive_entry("a.com", "/v/2").await.unwrap());
        assert_eq!(
            db.archive_entries().await.unwrap(),
            vec![
                ("a.com".to_string(), "/v/1".to_string()),
                ("a.com".to_string(), "/v/2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_archive_rejects_empty_parts() {
        let db = Database::new_in_memory().await.unwrap();
        assert!(db.insert_archive_entry("", "x").await.is_err());
        assert!(db.insert_archive_entry("a.com", "").await.is_err());
        assert!(db.archive_entries().await.unwrap().is_empty());
    }

    // ==================== File Tests ====================

    #[tokio::test]
    async fn test_file_database_enables_wal_and_persists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("archive.db");

        let db = Database::new(&path).await.unwrap();
        assert!(db.is_wal_enabled().await.unwrap());
        db.insert_archive_entry("vimeo.com", "76979871").await.unwrap();
        db.close().await;

        let reopened = Database::new(&path).await.unwrap();
        assert_eq!(reopened.archive_entries().await.unwrap().len(), 1);
        reopened.close().await;
    }
}
