//! Ledger persistence backends.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::db::Database;

use super::{ArchiveKey, LedgerError};

/// Durable storage behind an [`ArchiveLedger`](super::ArchiveLedger).
///
/// `append` is only called for keys the ledger has not seen, and never
/// concurrently with another `append` on the same ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Loads every persisted key.
    async fn load(&self) -> Result<Vec<ArchiveKey>, LedgerError>;

    /// Persists one key.
    async fn append(&self, key: &ArchiveKey) -> Result<(), LedgerError>;
}

/// Keeps keys for the life of the process only.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    keys: Mutex<Vec<ArchiveKey>>,
}

impl MemoryLedgerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-seeded with `keys`.
    #[must_use]
    pub fn with_keys(keys: Vec<ArchiveKey>) -> Self {
        Self {
            keys: Mutex::new(keys),
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn load(&self) -> Result<Vec<ArchiveKey>, LedgerError> {
        Ok(self
            .keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    async fn append(&self, key: &ArchiveKey) -> Result<(), LedgerError> {
        self.keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(key.clone());
        Ok(())
    }
}

/// Line-oriented archive file: one `origin canonical-id` per line.
///
/// Blank lines and `#` comments are ignored; malformed lines are skipped
/// with a warning so a hand-edited file never blocks a run.
#[derive(Debug, Clone)]
pub struct TextFileLedgerStore {
    path: PathBuf,
}

impl TextFileLedgerStore {
    /// Uses the file at `path`, which need not exist yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl LedgerStore for TextFileLedgerStore {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> Result<Vec<ArchiveKey>, LedgerError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("archive file does not exist yet");
                return Ok(Vec::new());
            }
            Err(error) => return Err(self.io_error(error)),
        };

        let mut keys = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.parse::<ArchiveKey>() {
                Ok(key) => keys.push(key),
                Err(_) => warn!(line_number = index + 1, "skipping malformed archive line"),
            }
        }
        debug!(count = keys.len(), "loaded archive file");
        Ok(keys)
    }

    async fn append(&self, key: &ArchiveKey) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| self.io_error(error))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|error| self.io_error(error))?;
        file.write_all(format!("{key}\n").as_bytes())
            .await
            .map_err(|error| self.io_error(error))?;
        file.flush().await.map_err(|error| self.io_error(error))
    }
}

/// SQLite-backed store using the `archive` table.
#[derive(Debug, Clone)]
pub struct SqliteLedgerStore {
    db: Database,
}

impl SqliteLedgerStore {
    /// Wraps an open, migrated database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn load(&self) -> Result<Vec<ArchiveKey>, LedgerError> {
        let entries = self.db.archive_entries().await?;
        Ok(entries
            .into_iter()
            .map(|(origin, canonical_id)| ArchiveKey::new(origin, canonical_id))
            .collect())
    }

    async fn append(&self, key: &ArchiveKey) -> Result<(), LedgerError> {
        if !self
            .db
            .insert_archive_entry(&key.origin, &key.canonical_id)
            .await?
        {
            debug!(key = %key, "archive row already present");
        }
        Ok(())
    }
}
