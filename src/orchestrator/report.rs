//! Handles, progress snapshots, and batch results.

use std::path::PathBuf;

use serde::Serialize;

use crate::archive::ArchiveKey;
use crate::failure::StrategyFailure;
use crate::queue::{ItemId, ItemState, QueueItem, Stage};
use crate::resolver::{AttemptRecord, ExhaustionCause};

use super::Slot;

/// What happened to a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Accepted as a queue item.
    Queued,
    /// Skipped: the archive ledger already records this content.
    AlreadyArchived,
}

/// Caller's reference to a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ItemHandle {
    /// Item id. Unique per orchestrator, also for skipped requests.
    pub id: ItemId,
    /// Whether the request was queued or skipped.
    pub disposition: Disposition,
}

impl ItemHandle {
    /// Returns true if the request became a queue item.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        self.disposition == Disposition::Queued
    }
}

/// Point-in-time view of one item, for progress display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemSnapshot {
    /// Item id.
    pub id: ItemId,
    /// Requested URL.
    pub url: String,
    /// Origin key.
    pub origin: String,
    /// Current state.
    pub state: ItemState,
    /// Times the item entered `Retrying`.
    pub retry_count: u32,
    /// Attempts recorded so far.
    pub attempts: usize,
    /// Bytes written, once the item has reached `Fetching`.
    pub bytes_transferred: Option<u64>,
    /// Expected size, when the origin reported one.
    pub total_bytes: Option<u64>,
}

impl ItemSnapshot {
    pub(super) fn capture(item: &QueueItem, slot: &Slot) -> Self {
        let transferring = matches!(
            item.state(),
            ItemState::Fetching
                | ItemState::PostProcessing
                | ItemState::Retrying(Stage::Fetching | Stage::PostProcessing)
        );
        Self {
            id: item.id(),
            url: item.request().url().to_string(),
            origin: item.origin().to_string(),
            state: item.state(),
            retry_count: item.retry_count(),
            attempts: item.history().len(),
            bytes_transferred: transferring.then(|| slot.progress.transferred()),
            total_bytes: transferring.then(|| slot.progress.total()).flatten(),
        }
    }

    pub(super) fn settled(report: &ItemReport) -> Self {
        Self {
            id: report.id,
            url: report.url.clone(),
            origin: report.origin.clone(),
            state: report.state,
            retry_count: report.retry_count,
            attempts: report.history.len(),
            bytes_transferred: None,
            total_bytes: None,
        }
    }
}

/// Final record of one queue item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    /// Item id.
    pub id: ItemId,
    /// Requested URL.
    pub url: String,
    /// Final state (`Done`, `Failed`, or `Cancelled`).
    pub state: ItemState,
    /// Origin key.
    pub origin: String,
    /// Strategy attempts across every resolution pass, in order.
    pub history: Vec<AttemptRecord>,
    /// Fetch and post-process attempts, in order.
    pub stage_history: Vec<AttemptRecord>,
    /// Times the item entered `Retrying`.
    pub retry_count: u32,
    /// Times a fetch failure sent the item back to resolution.
    pub re_resolutions: u32,
    /// Output file, for `Done` items.
    pub output: Option<PathBuf>,
    /// Why resolution gave up, if it did.
    pub cause: Option<ExhaustionCause>,
    /// Last fetch or post-process failure.
    pub error: Option<StrategyFailure>,
}

impl ItemReport {
    pub(super) fn capture(item: &QueueItem) -> Self {
        Self {
            id: item.id(),
            url: item.request().url().to_string(),
            origin: item.origin().to_string(),
            state: item.state(),
            history: item.history().to_vec(),
            stage_history: item.stage_history().to_vec(),
            retry_count: item.retry_count(),
            re_resolutions: item.re_resolutions(),
            output: item.output().map(PathBuf::from),
            cause: item.cause().cloned(),
            error: item.last_error().cloned(),
        }
    }
}

/// A request skipped because its content is already archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedItem {
    /// Handle id assigned at submission.
    pub id: ItemId,
    /// Requested URL.
    pub url: String,
    /// Matching ledger key.
    pub key: ArchiveKey,
}

/// Aggregated outcome of everything submitted so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Queue items in submission order.
    pub items: Vec<ItemReport>,
    /// Requests skipped via the archive ledger.
    pub skipped: Vec<SkippedItem>,
}

impl BatchReport {
    fn count(&self, state: ItemState) -> usize {
        self.items.iter().filter(|item| item.state == state).count()
    }

    /// Items that reached `Done`.
    #[must_use]
    pub fn done(&self) -> usize {
        self.count(ItemState::Done)
    }

    /// Items that reached `Failed`.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(ItemState::Failed)
    }

    /// Items that reached `Cancelled`.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.count(ItemState::Cancelled)
    }

    /// Returns true if no item failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}
