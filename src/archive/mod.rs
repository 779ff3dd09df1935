//! Archive ledger of completed downloads.
//!
//! The [`ArchiveLedger`] answers "has this content already been fetched?"
//! before an item is queued, and records items that reach `Done`. Keys are
//! held in memory behind a read-write lock so lookups proceed while an
//! append is being persisted; appends are serialized by their own lock.

mod key;
mod store;

pub use key::ArchiveKey;
pub use store::{LedgerStore, MemoryLedgerStore, SqliteLedgerStore, TextFileLedgerStore};

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::db::DbError;

/// Errors from ledger persistence.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Reading or writing the archive file failed.
    #[error("archive file {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The SQLite store failed.
    #[error("archive database: {0}")]
    Database(#[from] DbError),
}

/// In-memory index of completed content over a durable store.
pub struct ArchiveLedger {
    keys: RwLock<HashSet<ArchiveKey>>,
    store: Box<dyn LedgerStore>,
    append_lock: Mutex<()>,
}

impl ArchiveLedger {
    /// Opens a ledger, loading every key the store holds.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the store cannot be read.
    #[instrument(skip(store))]
    pub async fn open(store: Box<dyn LedgerStore>) -> Result<Self, LedgerError> {
        let keys: HashSet<ArchiveKey> = store.load().await?.into_iter().collect();
        info!(entries = keys.len(), "archive ledger opened");
        Ok(Self {
            keys: RwLock::new(keys),
            store,
            append_lock: Mutex::new(()),
        })
    }

    /// Creates an empty, non-persistent ledger.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            keys: RwLock::new(HashSet::new()),
            store: Box::new(MemoryLedgerStore::new()),
            append_lock: Mutex::new(()),
        }
    }

    /// Returns true if `key` is recorded as complete.
    #[must_use]
    pub fn contains(&self, key: &ArchiveKey) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Returns true if the content `url` names is recorded as complete.
    #[must_use]
    pub fn contains_url(&self, url: &str) -> bool {
        self.contains(&ArchiveKey::from_url(url))
    }

    /// Records `key` as complete.
    ///
    /// Idempotent: returns `Ok(false)` without touching the store when the
    /// key is already present.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the store write fails; the key is then not
    /// recorded in memory either.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn record(&self, key: ArchiveKey) -> Result<bool, LedgerError> {
        let _guard = self.append_lock.lock().await;
        if self.contains(&key) {
            debug!("already archived");
            return Ok(false);
        }
        self.store.append(&key).await?;
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        Ok(true)
    }

    /// Number of recorded keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ArchiveLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveLedger")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Store that counts appends and can be told to fail.
    #[derive(Default)]
    struct CountingStore {
        appends: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl LedgerStore for CountingStore {
        async fn load(&self) -> Result<Vec<ArchiveKey>, LedgerError> {
            Ok(vec![ArchiveKey::new("seed.com", "/seed")])
        }

        async fn append(&self, _key: &ArchiveKey) -> Result<(), LedgerError> {
            if self.fail {
                return Err(LedgerError::Io {
                    path: PathBuf::from("/dev/full"),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.appends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    // ==================== ArchiveLedger Tests ====================

    #[tokio::test]
    async fn test_open_loads_existing_keys() {
        let ledger = ArchiveLedger::open(Box::new(CountingStore::default()))
            .await
            .unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger.contains(&ArchiveKey::new("seed.com", "/seed")));
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let store = CountingStore::default();
        let appends = Arc::clone(&store.appends);
        let ledger = ArchiveLedger::open(Box::new(store)).await.unwrap();
        let key = ArchiveKey::from_url("https://example.com/v/1");

        assert!(ledger.record(key.clone()).await.unwrap());
        assert!(!ledger.record(key.clone()).await.unwrap());
        assert_eq!(appends.load(Ordering::SeqCst), 1);
        assert!(ledger.contains_url("https://www.example.com/v/1/?utm_source=feed"));
    }

    #[tokio::test]
    async fn test_failed_append_not_recorded() {
        let store = CountingStore {
            fail: true,
            ..CountingStore::default()
        };
        let ledger = ArchiveLedger::open(Box::new(store)).await.unwrap();
        let key = ArchiveKey::new("a.com", "/x");
        assert!(ledger.record(key.clone()).await.is_err());
        assert!(!ledger.contains(&key));
    }

    #[tokio::test]
    async fn test_concurrent_records_append_once() {
        let store = CountingStore::default();
        let appends = Arc::clone(&store.appends);
        let ledger = Arc::new(ArchiveLedger::open(Box::new(store)).await.unwrap());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.record(ArchiveKey::new("a.com", "/same")).await.unwrap()
            }));
        }
        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(appends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_in_memory_ledger_starts_empty() {
        let ledger = ArchiveLedger::in_memory();
        assert!(ledger.is_empty());
        assert!(!ledger.contains_url("https://example.com/a"));
    }
}
