//! Concurrent download orchestrator.
//!
//! The [`Orchestrator`] owns every [`QueueItem`] and a fixed pool of worker
//! tasks that pull item ids from a FIFO ready queue. Each worker drives one
//! item at a time through resolution, fetch, and post-processing; see
//! the `worker` module for the routing rules.
//!
//! # Concurrency Model
//!
//! - Workers are plain Tokio tasks sharing one receiver behind a mutex
//! - Each item sits behind its own lock, never held across an await
//! - An item is admitted to its origin before `Resolving` and releases the
//!   admission once fetching ends, so at most `per_origin_ceiling` items per
//!   origin are ever resolving or fetching
//! - Cancellation is cooperative: each item has a token (a child of the
//!   shutdown token) threaded into the resolver and the fetcher
//! - A settled item is reduced to its [`ItemReport`] and its slot is dropped
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mediafetch_core::archive::ArchiveLedger;
//! use mediafetch_core::config::EngineConfig;
//! use mediafetch_core::http::build_http_client;
//! use mediafetch_core::media::DownloadRequest;
//! use mediafetch_core::orchestrator::Orchestrator;
//! use mediafetch_core::pipeline::{HttpFetcher, PassthroughPostProcessor};
//! use mediafetch_core::strategy::default_registry;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let client = build_http_client(config.attempt_timeout)?;
//! let orchestrator = Orchestrator::new(
//!     config.clone(),
//!     default_registry(&config, client.clone()),
//!     Arc::new(HttpFetcher::new(client)),
//!     Arc::new(PassthroughPostProcessor),
//!     Arc::new(ArchiveLedger::in_memory()),
//! )?;
//! orchestrator.submit(DownloadRequest::new("https://example.com/clip.mp4"))?;
//! let report = orchestrator.wait().await;
//! println!("done: {}, failed: {}", report.done(), report.failed());
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod report;
mod worker;

pub use report::{BatchReport, Disposition, ItemHandle, ItemReport, ItemSnapshot, SkippedItem};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::archive::{ArchiveKey, ArchiveLedger};
use crate::config::{ConfigError, EngineConfig};
use crate::governor::RateGovernor;
use crate::media::DownloadRequest;
use crate::pipeline::{Fetcher, PostProcessor, TransferProgress};
use crate::queue::{ItemId, ItemState, QueueItem};
use crate::resolver::Resolver;
use crate::retry::RetryPolicy;
use crate::strategy::StrategyRegistry;

/// Errors from orchestrator construction and submission.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Every worker has exited; nothing can be submitted.
    #[error("orchestrator is shut down")]
    Closed,
}

/// Options for [`Orchestrator::submit_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Fetch again even if the archive ledger records the content.
    pub force: bool,
}

/// One item plus the handles its worker and observers share.
#[derive(Debug)]
pub(crate) struct Slot {
    item: Mutex<QueueItem>,
    cancel: CancellationToken,
    progress: TransferProgress,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, QueueItem> {
        self.item.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State shared by the orchestrator handle and its workers.
pub(crate) struct Shared {
    config: Arc<EngineConfig>,
    resolver: Resolver,
    governor: Arc<RateGovernor>,
    fetcher: Arc<dyn Fetcher>,
    post_processor: Arc<dyn PostProcessor>,
    ledger: Arc<ArchiveLedger>,
    stage_retry: RetryPolicy,
    slots: DashMap<ItemId, Arc<Slot>>,
    reports: DashMap<ItemId, ItemReport>,
    order: Mutex<Vec<ItemId>>,
    skipped: Mutex<Vec<SkippedItem>>,
    outstanding: AtomicUsize,
    settled: Notify,
    shutdown: CancellationToken,
}

impl Shared {
    fn slot(&self, id: ItemId) -> Option<Arc<Slot>> {
        self.slots.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Moves a non-terminal item to a terminal state, exactly once.
    ///
    /// Returns false if the item had already settled.
    fn settle(&self, slot: &Slot, state: ItemState) -> bool {
        let settled = self.mark_terminal(slot, state);
        if settled {
            self.release_outstanding();
        }
        settled
    }

    /// The transition half of [`Shared::settle`]. A true return obliges the
    /// caller to call [`Shared::release_outstanding`] once.
    ///
    /// The final report is stored before the slot is dropped, so an item is
    /// always visible through one of the two maps.
    fn mark_terminal(&self, slot: &Slot, state: ItemState) -> bool {
        let report = {
            let mut item = slot.lock();
            if item.is_settled() {
                return false;
            }
            item.transition(state);
            info!(item = %item.id(), state = %state, attempts = item.history().len(), "item settled");
            ItemReport::capture(&item)
        };
        let id = report.id;
        self.reports.insert(id, report);
        self.slots.remove(&id);
        true
    }

    fn release_outstanding(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.settled.notify_waiters();
        }
    }
}

/// Bounded worker pool driving download requests to completion.
pub struct Orchestrator {
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<ItemId>,
    workers: Vec<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl Orchestrator {
    /// Validates `config` and starts `config.workers` worker tasks.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Config`] for invalid configuration.
    #[instrument(skip_all, fields(workers = config.workers))]
    pub fn new(
        config: EngineConfig,
        registry: StrategyRegistry,
        fetcher: Arc<dyn Fetcher>,
        post_processor: Arc<dyn PostProcessor>,
        ledger: Arc<ArchiveLedger>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let config = Arc::new(config);
        let governor = Arc::new(RateGovernor::new(&config));
        let resolver = Resolver::new(Arc::new(registry), Arc::clone(&governor), Arc::clone(&config));
        let shared = Arc::new(Shared {
            stage_retry: RetryPolicy::stage(&config),
            config: Arc::clone(&config),
            resolver,
            governor,
            fetcher,
            post_processor,
            ledger,
            slots: DashMap::new(),
            reports: DashMap::new(),
            order: Mutex::new(Vec::new()),
            skipped: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            settled: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let workers = (0..config.workers)
            .map(|index| {
                tokio::spawn(worker::run(
                    index,
                    Arc::clone(&shared),
                    Arc::clone(&receiver),
                ))
            })
            .collect();

        info!(
            per_origin = config.per_origin_ceiling,
            global = config.global_ceiling,
            "orchestrator started"
        );
        Ok(Self {
            shared,
            sender,
            workers,
            next_id: AtomicU64::new(1),
        })
    }

    /// Submits one request.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Closed`] if the workers have exited.
    pub fn submit(&self, request: DownloadRequest) -> Result<ItemHandle, OrchestratorError> {
        self.submit_with(request, SubmitOptions::default())
    }

    /// Submits one request with explicit options.
    ///
    /// Unless `options.force` is set, a request whose content the archive
    /// ledger already records is skipped without creating a queue item.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Closed`] if the workers have exited.
    #[instrument(skip(self, request), fields(url = %request.url()))]
    pub fn submit_with(
        &self,
        request: DownloadRequest,
        options: SubmitOptions,
    ) -> Result<ItemHandle, OrchestratorError> {
        let id = ItemId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let key = ArchiveKey::from_url(request.url());
        if !options.force && self.shared.ledger.contains(&key) {
            info!(item = %id, key = %key, "already archived, skipping");
            lock(&self.shared.skipped).push(SkippedItem {
                id,
                url: request.url().to_string(),
                key,
            });
            return Ok(ItemHandle {
                id,
                disposition: Disposition::AlreadyArchived,
            });
        }

        let slot = Arc::new(Slot {
            item: Mutex::new(QueueItem::new(id, request)),
            cancel: self.shared.shutdown.child_token(),
            progress: TransferProgress::new(),
        });
        self.shared.slots.insert(id, slot);
        lock(&self.shared.order).push(id);
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);

        if self.sender.send(id).is_err() {
            if let Some(slot) = self.shared.slot(id) {
                self.shared.settle(&slot, ItemState::Cancelled);
            }
            return Err(OrchestratorError::Closed);
        }
        debug!(item = %id, "queued");
        Ok(ItemHandle {
            id,
            disposition: Disposition::Queued,
        })
    }

    /// Submits requests in order, returning one handle per request.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Closed`] if the workers have exited;
    /// requests before the failing one stay submitted.
    pub fn submit_batch(
        &self,
        requests: impl IntoIterator<Item = DownloadRequest>,
    ) -> Result<Vec<ItemHandle>, OrchestratorError> {
        requests
            .into_iter()
            .map(|request| self.submit(request))
            .collect()
    }

    /// Requests cancellation of an item.
    ///
    /// A pending item that no worker has picked up is cancelled immediately;
    /// otherwise its worker observes the token at its next suspension point.
    /// Returns false for skipped, unknown, or already terminal items.
    #[instrument(skip(self), fields(item = %handle.id))]
    pub fn cancel(&self, handle: &ItemHandle) -> bool {
        let Some(slot) = self.shared.slot(handle.id) else {
            return false;
        };
        let unclaimed = {
            let item = slot.lock();
            if item.is_settled() {
                return false;
            }
            item.state() == ItemState::Pending && item.worker().is_none()
        };
        slot.cancel.cancel();
        if unclaimed {
            self.shared.settle(&slot, ItemState::Cancelled);
        }
        true
    }

    /// Cancels every item that has not settled yet. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let order = lock(&self.shared.order).clone();
        order
            .into_iter()
            .filter(|&id| {
                self.cancel(&ItemHandle {
                    id,
                    disposition: Disposition::Queued,
                })
            })
            .count()
    }

    /// Snapshots every item that has not settled yet, in submission order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ItemSnapshot> {
        let order = lock(&self.shared.order).clone();
        order
            .into_iter()
            .filter_map(|id| self.shared.slot(id))
            .filter_map(|slot| {
                let item = slot.lock();
                (!item.is_settled()).then(|| ItemSnapshot::capture(&item, &slot))
            })
            .collect()
    }

    /// Snapshots one item, settled or not. `None` for skipped requests.
    #[must_use]
    pub fn status(&self, handle: &ItemHandle) -> Option<ItemSnapshot> {
        if let Some(slot) = self.shared.slot(handle.id) {
            let item = slot.lock();
            return Some(ItemSnapshot::capture(&item, &slot));
        }
        self.shared
            .reports
            .get(&handle.id)
            .map(|report| ItemSnapshot::settled(report.value()))
    }

    /// Waits until every submitted item has settled, then reports.
    ///
    /// One item's failure never affects another's outcome.
    pub async fn wait(&self) -> BatchReport {
        loop {
            let settled = self.shared.settled.notified();
            if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                break;
            }
            settled.await;
        }
        self.report()
    }

    /// Reports the items settled so far, in submission order.
    #[must_use]
    pub fn report(&self) -> BatchReport {
        let order = lock(&self.shared.order).clone();
        let items = order
            .into_iter()
            .filter_map(|id| self.shared.reports.get(&id).map(|report| report.value().clone()))
            .collect();
        BatchReport {
            items,
            skipped: lock(&self.shared.skipped).clone(),
        }
    }

    /// Number of items not yet settled.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Items still held with their request and live state.
    #[must_use]
    pub fn active_items(&self) -> usize {
        self.shared.slots.len()
    }

    /// The shared rate governor, for inspection.
    #[must_use]
    pub fn governor(&self) -> &RateGovernor {
        &self.shared.governor
    }

    /// The archive ledger.
    #[must_use]
    pub fn ledger(&self) -> &ArchiveLedger {
        &self.shared.ledger
    }

    /// Cancels all work, stops the workers, and settles anything left
    /// pending as `Cancelled`.
    #[instrument(skip(self))]
    pub async fn shutdown(self) {
        let Self {
            shared,
            sender,
            workers,
            ..
        } = self;
        shared.shutdown.cancel();
        drop(sender);
        for handle in workers {
            if let Err(error) = handle.await {
                warn!(error = %error, "worker task panicked");
            }
        }

        let leftover: Vec<Arc<Slot>> = shared
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for slot in leftover {
            shared.settle(&slot, ItemState::Cancelled);
        }
        info!("orchestrator shut down");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("workers", &self.workers.len())
            .field("active", &self.shared.slots.len())
            .field("settled", &self.shared.reports.len())
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
