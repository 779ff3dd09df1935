//! Queue item: one request's journey through the pipeline.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::failure::StrategyFailure;
use crate::governor::extract_origin;
use crate::media::{DownloadRequest, MediaArtifact};
use crate::resolver::{AttemptRecord, ExhaustionCause};

use super::state::ItemState;

/// Identifier of an accepted request, unique within one orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single request being driven through resolution, fetch, and post-processing.
///
/// Owned by the orchestrator; a worker borrows it (behind the item's lock)
/// while processing. State changes go through [`QueueItem::transition`] so
/// the transition table is enforced in one place.
#[derive(Debug)]
pub struct QueueItem {
    id: ItemId,
    request: DownloadRequest,
    origin: String,
    state: ItemState,
    history: Vec<AttemptRecord>,
    stage_history: Vec<AttemptRecord>,
    retry_count: u32,
    re_resolutions: u32,
    worker: Option<usize>,
    artifact: Option<MediaArtifact>,
    output: Option<PathBuf>,
    cause: Option<ExhaustionCause>,
    last_error: Option<StrategyFailure>,
    submitted_at: SystemTime,
    finished_at: Option<SystemTime>,
}

impl QueueItem {
    /// Creates a `Pending` item for `request`.
    #[must_use]
    pub fn new(id: ItemId, request: DownloadRequest) -> Self {
        let origin = extract_origin(request.url());
        Self {
            id,
            request,
            origin,
            state: ItemState::Pending,
            history: Vec::new(),
            stage_history: Vec::new(),
            retry_count: 0,
            re_resolutions: 0,
            worker: None,
            artifact: None,
            output: None,
            cause: None,
            last_error: None,
            submitted_at: SystemTime::now(),
            finished_at: None,
        }
    }

    /// Moves the item to `next`.
    ///
    /// Entering `Retrying` increments the retry counter. Entering a terminal
    /// state stamps the completion time, frees the worker slot, and discards
    /// any artifact that was not consumed.
    ///
    /// # Panics
    ///
    /// Panics if the transition table does not allow `current -> next`,
    /// including any transition out of a terminal state. That is a bug in
    /// the caller, not a runtime condition.
    pub fn transition(&mut self, next: ItemState) {
        assert!(
            self.state.can_transition_to(next),
            "invalid queue item transition for {}: {} -> {}",
            self.id,
            self.state,
            next
        );
        debug!(item = %self.id, from = %self.state, to = %next, "state transition");
        if matches!(next, ItemState::Retrying(_)) {
            self.retry_count += 1;
        }
        if next.is_terminal() {
            self.finished_at = Some(SystemTime::now());
            self.worker = None;
            self.artifact = None;
        }
        self.state = next;
    }

    /// Returns true once the item is terminal (possibly by concurrent cancellation).
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.state.is_terminal()
    }

    /// Item id.
    #[must_use]
    pub fn id(&self) -> ItemId {
        self.id
    }

    /// The original request.
    #[must_use]
    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    /// Origin key of the request URL.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ItemState {
        self.state
    }

    /// Strategy attempts across every resolution pass, oldest first.
    #[must_use]
    pub fn history(&self) -> &[AttemptRecord] {
        &self.history
    }

    /// Appends a resolution pass's strategy attempts.
    pub fn extend_history(&mut self, records: impl IntoIterator<Item = AttemptRecord>) {
        self.history.extend(records);
    }

    /// Fetch and post-process attempts, oldest first.
    #[must_use]
    pub fn stage_history(&self) -> &[AttemptRecord] {
        &self.stage_history
    }

    /// Records one fetch or post-process attempt.
    pub fn record_stage(&mut self, record: AttemptRecord) {
        self.stage_history.push(record);
    }

    /// Times the item entered `Retrying`.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Times the item was sent back from fetching to resolution.
    #[must_use]
    pub fn re_resolutions(&self) -> u32 {
        self.re_resolutions
    }

    /// Counts one trip back from fetching to resolution.
    pub fn note_re_resolution(&mut self) {
        self.re_resolutions += 1;
    }

    /// Worker slot currently processing the item.
    #[must_use]
    pub fn worker(&self) -> Option<usize> {
        self.worker
    }

    /// Records which worker slot picked the item up.
    pub fn assign_worker(&mut self, slot: usize) {
        self.worker = Some(slot);
    }

    /// Stores a freshly resolved artifact, replacing any previous one.
    pub fn set_artifact(&mut self, artifact: MediaArtifact) {
        self.artifact = Some(artifact);
    }

    /// The resolved artifact, until the item settles.
    #[must_use]
    pub fn artifact(&self) -> Option<&MediaArtifact> {
        self.artifact.as_ref()
    }

    /// Moves the artifact out for the fetch stage to consume.
    pub fn take_artifact(&mut self) -> Option<MediaArtifact> {
        self.artifact.take()
    }

    /// Drops the artifact so the next resolution starts clean.
    pub fn discard_artifact(&mut self) {
        self.artifact = None;
    }

    /// Path of the fetched (and, later, post-processed) file.
    #[must_use]
    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    /// Records the current output path.
    pub fn set_output(&mut self, path: PathBuf) {
        self.output = Some(path);
    }

    /// Why resolution ended without an artifact, if it did.
    #[must_use]
    pub fn cause(&self) -> Option<&ExhaustionCause> {
        self.cause.as_ref()
    }

    /// Records the latest resolution exhaustion cause.
    pub fn set_cause(&mut self, cause: ExhaustionCause) {
        self.cause = Some(cause);
    }

    /// Last fetch or post-process failure.
    #[must_use]
    pub fn last_error(&self) -> Option<&StrategyFailure> {
        self.last_error.as_ref()
    }

    /// Records a fetch or post-process failure.
    pub fn set_last_error(&mut self, failure: StrategyFailure) {
        self.last_error = Some(failure);
    }

    /// When the item was accepted.
    #[must_use]
    pub fn submitted_at(&self) -> SystemTime {
        self.submitted_at
    }

    /// When the item reached a terminal state.
    #[must_use]
    pub fn finished_at(&self) -> Option<SystemTime> {
        self.finished_at
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueItem {{ id: {}, url: {}, state: {} }}",
            self.id,
            self.request.url(),
            self.state
        )
    }
}
