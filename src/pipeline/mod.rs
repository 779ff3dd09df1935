//! Fetch and post-process collaborators.
//!
//! The orchestrator drives a resolved [`MediaArtifact`] through a
//! [`Fetcher`] (bytes to disk) and a [`PostProcessor`] (remux, tag, move).
//! Both report failures as [`StrategyFailure`] so the same
//! [`FailureKind`](crate::failure::FailureKind) routing applies to every
//! stage.

mod filename;
mod http_fetcher;

pub use http_fetcher::HttpFetcher;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::failure::StrategyFailure;
use crate::media::{DownloadRequest, MediaArtifact};

/// Sentinel stored in `total` while the size is unknown.
const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Byte counters shared between a fetch and progress observers.
#[derive(Debug)]
pub struct TransferProgress {
    transferred: AtomicU64,
    total: AtomicU64,
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self {
            transferred: AtomicU64::new(0),
            total: AtomicU64::new(UNKNOWN_TOTAL),
        }
    }
}

impl TransferProgress {
    /// Creates counters with nothing transferred and no known total.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `bytes` to the transferred count.
    pub fn advance(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Sets (or clears) the expected total.
    pub fn set_total(&self, total: Option<u64>) {
        self.total
            .store(total.unwrap_or(UNKNOWN_TOTAL), Ordering::Relaxed);
    }

    /// Zeroes the transferred count, e.g. before a fetch retry.
    pub fn reset(&self) {
        self.transferred.store(0, Ordering::Relaxed);
        self.total.store(UNKNOWN_TOTAL, Ordering::Relaxed);
    }

    /// Bytes written so far.
    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Expected total, when known.
    #[must_use]
    pub fn total(&self) -> Option<u64> {
        let total = self.total.load(Ordering::Relaxed);
        (total != UNKNOWN_TOTAL).then_some(total)
    }
}

/// Moves an artifact's bytes to local storage.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches `artifact` into `dest_dir`, returning the written file.
    ///
    /// Implementations must leave no partial file behind on failure or
    /// cancellation, and must return promptly once `cancel` fires.
    async fn fetch(
        &self,
        artifact: &MediaArtifact,
        request: &DownloadRequest,
        dest_dir: &Path,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, StrategyFailure>;
}

/// Finishes a fetched file (remux, tagging, relocation).
#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// Processes `file`, returning the final output path.
    async fn process(
        &self,
        file: &Path,
        request: &DownloadRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, StrategyFailure>;
}

/// Leaves fetched files untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughPostProcessor;

#[async_trait]
impl PostProcessor for PassthroughPostProcessor {
    async fn process(
        &self,
        file: &Path,
        _request: &DownloadRequest,
        _cancel: &CancellationToken,
    ) -> Result<PathBuf, StrategyFailure> {
        Ok(file.to_path_buf())
    }
}
