//! Worker loop and per-item pipeline.
//!
//! # Routing
//!
//! | Stage | Outcome | Next |
//! |-------|---------|------|
//! | Resolving | resolved | Fetching |
//! | Resolving | chain exhausted, retryable, item retries left | Retrying(Resolving) after the origin backoff |
//! | Resolving | anything else | Failed |
//! | Fetching | `TransientNetwork`, `InternalError`, `RateLimited` | Retrying(Fetching), up to the stage cap |
//! | Fetching | `AntiBotChallenge`, `UnsupportedContent`, stale artifact | Retrying(Fetching) then Resolving, up to the re-resolution cap |
//! | Fetching | `AuthRequired`, `NotFound`, `GeoBlocked` | Failed |
//! | PostProcessing | retryable failure | Retrying(PostProcessing), up to the stage cap |
//! | PostProcessing | success | Done, then recorded in the archive ledger |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::archive::ArchiveKey;
use crate::failure::{FailureKind, FailurePolicy, StrategyFailure};
use crate::governor::{Admission, GovernorError, extract_origin};
use crate::media::{DownloadRequest, MediaArtifact};
use crate::queue::{ItemId, ItemState, Stage};
use crate::resolver::{AttemptRecord, ExhaustionCause, Resolution};
use crate::retry::RetryDecision;

use super::{Shared, Slot};

/// Stage history name for fetch attempts.
const FETCH_ATTEMPT: &str = "fetch";

/// Stage history name for post-process attempts.
const POST_PROCESS_ATTEMPT: &str = "post_process";

/// Pulls item ids until the channel closes or shutdown is requested.
pub(super) async fn run(
    index: usize,
    shared: Arc<Shared>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<ItemId>>>,
) {
    debug!(worker = index, "worker started");
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                () = shared.shutdown.cancelled() => None,
                id = receiver.recv() => id,
            }
        };
        let Some(id) = next else { break };
        let Some(slot) = shared.slot(id) else { continue };
        ItemRun::new(index, &shared, &slot).drive().await;
    }
    debug!(worker = index, "worker stopped");
}

/// Where the item goes next.
enum Step {
    Resolve,
    Fetch,
    PostProcess(PathBuf),
}

/// Why the pipeline stopped: a terminal state, or cancellation.
enum Stop {
    Settled(ItemState),
    Cancelled,
}

/// One worker's pass over one item.
struct ItemRun<'a> {
    worker: usize,
    shared: &'a Shared,
    slot: &'a Slot,
    request: DownloadRequest,
    origin: String,
    resolve_retries: u32,
    fetch_retries: u32,
    post_retries: u32,
}

impl<'a> ItemRun<'a> {
    fn new(worker: usize, shared: &'a Shared, slot: &'a Slot) -> Self {
        let (request, origin) = {
            let item = slot.lock();
            (item.request().clone(), item.origin().to_string())
        };
        Self {
            worker,
            shared,
            slot,
            request,
            origin,
            resolve_retries: 0,
            fetch_retries: 0,
            post_retries: 0,
        }
    }

    /// Claims the item and runs it to a terminal state.
    #[instrument(skip(self), fields(worker = self.worker, url = %self.request.url()))]
    async fn drive(mut self) {
        {
            let mut item = self.slot.lock();
            if item.is_settled() {
                debug!(item = %item.id(), "already settled, skipping");
                return;
            }
            item.assign_worker(self.worker);
        }

        let admitted = self
            .shared
            .governor
            .admit(&self.origin, &self.slot.cancel)
            .await;
        let mut admission = match admitted {
            Ok(admission) => Some(admission),
            Err(error) => {
                debug!(error = %error, "not admitted");
                self.shared.settle(self.slot, ItemState::Cancelled);
                return;
            }
        };

        let terminal = match self.pipeline(&mut admission).await {
            Stop::Settled(state) => state,
            Stop::Cancelled => ItemState::Cancelled,
        };
        // Settle before releasing the admission so the item never looks
        // active once its origin slot is free. Waiters are released only
        // after the ledger write.
        let settled = self.shared.mark_terminal(self.slot, terminal);
        drop(admission);
        if settled {
            if terminal == ItemState::Done {
                self.record_archive().await;
            }
            self.shared.release_outstanding();
        }
    }

    async fn pipeline(&mut self, admission: &mut Option<Admission>) -> Stop {
        if !self.enter(ItemState::Resolving) {
            return Stop::Cancelled;
        }
        let mut step = Step::Resolve;
        loop {
            if self.slot.cancel.is_cancelled() {
                return Stop::Cancelled;
            }
            step = match step {
                Step::Resolve => match self.resolve().await {
                    Ok(next) => next,
                    Err(stop) => return stop,
                },
                Step::Fetch => match self.fetch().await {
                    Ok(next) => {
                        // Post-processing is local; free the origin for the next item.
                        if matches!(next, Step::PostProcess(_)) {
                            admission.take();
                        }
                        next
                    }
                    Err(stop) => return stop,
                },
                Step::PostProcess(file) => match self.post_process(file).await {
                    Ok(next) => next,
                    Err(stop) => return stop,
                },
            };
        }
    }

    /// Applies a non-terminal transition unless the item was cancelled.
    fn enter(&self, state: ItemState) -> bool {
        if self.slot.cancel.is_cancelled() {
            return false;
        }
        let mut item = self.slot.lock();
        if item.is_settled() {
            return false;
        }
        item.transition(state);
        true
    }

    /// Sleeps in `Retrying(stage)`, then re-enters `resume`.
    async fn pause_then_enter(
        &self,
        stage: Stage,
        delay: Duration,
        resume: ItemState,
    ) -> Result<(), Stop> {
        if !self.enter(ItemState::Retrying(stage)) {
            return Err(Stop::Cancelled);
        }
        debug!(stage = %stage, delay_ms = delay.as_millis(), "waiting to retry");
        tokio::select! {
            biased;
            () = self.slot.cancel.cancelled() => return Err(Stop::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
        if self.enter(resume) {
            Ok(())
        } else {
            Err(Stop::Cancelled)
        }
    }

    async fn resolve(&mut self) -> Result<Step, Stop> {
        let resolution = self
            .shared
            .resolver
            .resolve(&self.request, &self.slot.cancel)
            .await;

        let cause = match resolution {
            Resolution::Resolved {
                artifact,
                strategy,
                history,
            } => {
                debug!(strategy = %strategy, "artifact resolved");
                {
                    let mut item = self.slot.lock();
                    item.extend_history(history);
                    item.set_artifact(artifact);
                }
                return if self.enter(ItemState::Fetching) {
                    Ok(Step::Fetch)
                } else {
                    Err(Stop::Cancelled)
                };
            }
            Resolution::Exhausted { history, cause } => {
                let mut item = self.slot.lock();
                item.extend_history(history);
                item.set_cause(cause.clone());
                cause
            }
        };

        match cause {
            ExhaustionCause::Cancelled => Err(Stop::Cancelled),
            ExhaustionCause::ChainExhausted { retryable: true }
                if self.resolve_retries < self.shared.config.item_retries =>
            {
                self.resolve_retries += 1;
                let delay = self.shared.governor.current_backoff(&self.origin);
                info!(
                    retry = self.resolve_retries,
                    delay_ms = delay.as_millis(),
                    "chain exhausted with retryable failures, retrying item"
                );
                self.pause_then_enter(Stage::Resolving, delay, ItemState::Resolving)
                    .await?;
                Ok(Step::Resolve)
            }
            other => {
                info!(cause = ?other, "resolution exhausted");
                Err(Stop::Settled(ItemState::Failed))
            }
        }
    }

    async fn fetch(&mut self) -> Result<Step, Stop> {
        let taken = self.slot.lock().take_artifact();
        let Some(artifact) = taken else {
            warn!("fetch stage entered without an artifact");
            return self.send_back_to_resolution("missing artifact").await;
        };

        if artifact.is_stale() {
            if self.can_re_resolve() {
                info!("artifact expired before fetch, re-resolving");
                return self.send_back_to_resolution("artifact expired").await;
            }
            warn!("artifact expired and re-resolutions are exhausted, fetching anyway");
        }

        let fetch_origin = artifact
            .locator
            .primary_url()
            .map_or_else(|| self.origin.clone(), extract_origin);
        let started_at = SystemTime::now();
        let started = Instant::now();
        let result = self.fetch_once(&artifact, &fetch_origin).await;
        let elapsed = started.elapsed();

        if self.slot.cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }

        let failure = match result {
            Ok(file) => {
                self.shared.governor.record_success(&fetch_origin);
                {
                    let mut item = self.slot.lock();
                    item.record_stage(AttemptRecord::resolved(
                        FETCH_ATTEMPT,
                        Stage::Fetching,
                        started_at,
                        elapsed,
                    ));
                    item.set_output(file.clone());
                }
                return if self.enter(ItemState::PostProcessing) {
                    Ok(Step::PostProcess(file))
                } else {
                    Err(Stop::Cancelled)
                };
            }
            Err(failure) => failure,
        };

        let kind = failure.kind;
        warn!(kind = %kind, detail = %failure.detail, "fetch failed");
        if kind.penalizes_origin() {
            self.shared
                .governor
                .penalize(&fetch_origin, kind, failure.retry_after);
        }
        {
            let mut item = self.slot.lock();
            item.record_stage(AttemptRecord::failed(
                FETCH_ATTEMPT,
                Stage::Fetching,
                started_at,
                elapsed,
                failure.clone(),
            ));
            item.set_last_error(failure);
        }

        match kind.policy() {
            FailurePolicy::RetrySameStrategy | FailurePolicy::WaitForOrigin => {
                match self.shared.stage_retry.should_retry(kind, self.fetch_retries) {
                    RetryDecision::Retry { delay, retry } => {
                        self.fetch_retries = retry;
                        self.slot.lock().set_artifact(artifact);
                        self.pause_then_enter(Stage::Fetching, delay, ItemState::Fetching)
                            .await?;
                        Ok(Step::Fetch)
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        info!(%reason, "fetch retries exhausted");
                        Err(Stop::Settled(ItemState::Failed))
                    }
                }
            }
            FailurePolicy::AdvanceChain if self.can_re_resolve() => {
                self.send_back_to_resolution(kind.as_str()).await
            }
            FailurePolicy::AdvanceChain => {
                info!(kind = %kind, "re-resolutions exhausted");
                Err(Stop::Settled(ItemState::Failed))
            }
            FailurePolicy::Abort => {
                self.slot.lock().set_cause(ExhaustionCause::Aborted(kind));
                Err(Stop::Settled(ItemState::Failed))
            }
        }
    }

    /// One fetch under a permit for the artifact's origin.
    async fn fetch_once(
        &self,
        artifact: &MediaArtifact,
        fetch_origin: &str,
    ) -> Result<PathBuf, StrategyFailure> {
        let permit = tokio::select! {
            biased;
            () = self.slot.cancel.cancelled() => {
                return Err(StrategyFailure::internal("fetch cancelled").retryable(false));
            }
            acquired = self.shared.governor.acquire(fetch_origin, self.shared.config.permit_timeout) => acquired,
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(GovernorError::Timeout { .. }) => {
                return Err(StrategyFailure::new(
                    FailureKind::RateLimited,
                    crate::resolver::PERMIT_UNAVAILABLE,
                ));
            }
            Err(error) => {
                return Err(StrategyFailure::internal(error.to_string()).retryable(false));
            }
        };

        tokio::select! {
            biased;
            () = self.slot.cancel.cancelled() => {
                Err(StrategyFailure::internal("fetch cancelled").retryable(false))
            }
            result = self.shared.fetcher.fetch(
                artifact,
                &self.request,
                &self.shared.config.output_dir,
                &self.slot.progress,
                &self.slot.cancel,
            ) => result,
        }
    }

    fn can_re_resolve(&self) -> bool {
        self.slot.lock().re_resolutions() < self.shared.config.re_resolutions
    }

    /// `Fetching -> Retrying(Fetching) -> Resolving` with a fresh chain.
    async fn send_back_to_resolution(&mut self, reason: &str) -> Result<Step, Stop> {
        info!(%reason, "sending item back to resolution");
        {
            let mut item = self.slot.lock();
            item.note_re_resolution();
            item.discard_artifact();
        }
        self.fetch_retries = 0;
        self.slot.progress.reset();
        self.pause_then_enter(Stage::Fetching, Duration::ZERO, ItemState::Resolving)
            .await?;
        Ok(Step::Resolve)
    }

    async fn post_process(&mut self, file: PathBuf) -> Result<Step, Stop> {
        let started_at = SystemTime::now();
        let started = Instant::now();
        let result = self
            .shared
            .post_processor
            .process(&file, &self.request, &self.slot.cancel)
            .await;
        let elapsed = started.elapsed();

        if self.slot.cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }

        match result {
            Ok(output) => {
                let mut item = self.slot.lock();
                item.record_stage(AttemptRecord::resolved(
                    POST_PROCESS_ATTEMPT,
                    Stage::PostProcessing,
                    started_at,
                    elapsed,
                ));
                item.set_output(output);
                Err(Stop::Settled(ItemState::Done))
            }
            Err(failure) => {
                warn!(kind = %failure.kind, detail = %failure.detail, "post-processing failed");
                let retryable = failure.retryable;
                {
                    let mut item = self.slot.lock();
                    item.record_stage(AttemptRecord::failed(
                        POST_PROCESS_ATTEMPT,
                        Stage::PostProcessing,
                        started_at,
                        elapsed,
                        failure.clone(),
                    ));
                    item.set_last_error(failure);
                }
                if !retryable || self.post_retries >= self.shared.stage_retry.max_retries() {
                    return Err(Stop::Settled(ItemState::Failed));
                }
                self.post_retries += 1;
                let delay = self.shared.stage_retry.calculate_delay(self.post_retries);
                self.pause_then_enter(Stage::PostProcessing, delay, ItemState::PostProcessing)
                    .await?;
                Ok(Step::PostProcess(file))
            }
        }
    }

    /// Records a `Done` item. Ledger failures never change the outcome.
    async fn record_archive(&self) {
        let key = ArchiveKey::from_url(self.request.url());
        match self.shared.ledger.record(key).await {
            Ok(true) => debug!("recorded in archive"),
            Ok(false) => debug!("archive already had this item"),
            Err(error) => warn!(error = %error, "failed to record item in archive"),
        }
    }
}
