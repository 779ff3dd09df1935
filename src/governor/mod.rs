//! Per-origin concurrency and backoff governance.
//!
//! The [`RateGovernor`] owns one [`OriginBudget`] per origin. Every network
//! attempt, whether a strategy probe or a transfer, first acquires a
//! [`Permit`] for its origin. Permits are bounded per origin and globally,
//! spaced by an optional request interval, and withheld entirely while an
//! origin's backoff window is open.
//!
//! Items additionally hold an [`Admission`] for their origin while they are
//! resolving or fetching. Admissions cap how many items work one origin at a
//! time; permits cap how many requests are actually on the wire.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use mediafetch_core::config::EngineConfig;
//! use mediafetch_core::governor::RateGovernor;
//!
//! # async fn example() -> Result<(), mediafetch_core::governor::GovernorError> {
//! let governor = RateGovernor::new(&EngineConfig::default());
//! let permit = governor.acquire("example.com", Duration::from_secs(5)).await?;
//! assert_eq!(governor.in_flight("example.com"), 1);
//! drop(permit);
//! assert_eq!(governor.in_flight("example.com"), 0);
//! # Ok(())
//! # }
//! ```

mod budget;
mod origin;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use budget::{Admission, OriginBudget, Permit};
pub use origin::{extract_origin, parse_retry_after};

use crate::config::EngineConfig;
use crate::failure::FailureKind;

/// Warning threshold for cumulative penalty delay per origin (30 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Errors from permit or admission acquisition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GovernorError {
    /// No permit became available within the timeout.
    #[error("no permit for {origin} within {waited:?}")]
    Timeout {
        /// Origin key.
        origin: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The caller's cancellation token fired while waiting.
    #[error("cancelled while waiting for {origin}")]
    Cancelled {
        /// Origin key.
        origin: String,
    },

    /// The governor's semaphores were closed.
    #[error("rate governor closed")]
    Closed,
}

/// Per-origin concurrency limits and adaptive backoff.
///
/// Shared by `Arc` across the resolver and every worker. Per-origin state is
/// stored as `Arc<OriginBudget>` so the `DashMap` shard lock is released
/// before any await.
#[derive(Debug)]
pub struct RateGovernor {
    per_origin_ceiling: usize,
    request_interval: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
    escalation: f64,
    decay: f64,
    global: Arc<Semaphore>,
    origins: DashMap<String, Arc<OriginBudget>>,
}

impl RateGovernor {
    /// Creates a governor from the engine configuration.
    #[must_use]
    #[instrument(skip_all, fields(
        global = config.global_ceiling,
        per_origin = config.per_origin_ceiling
    ))]
    pub fn new(config: &EngineConfig) -> Self {
        debug!("creating rate governor");
        Self {
            per_origin_ceiling: config.per_origin_ceiling,
            request_interval: config.request_interval,
            backoff_min: config.backoff_min,
            backoff_max: config.backoff_max,
            escalation: config.backoff_escalation,
            decay: config.backoff_decay,
            global: Arc::new(Semaphore::new(config.global_ceiling)),
            origins: DashMap::new(),
        }
    }

    /// Returns the budget for `origin`, creating it on first use.
    fn budget(&self, origin: &str) -> Arc<OriginBudget> {
        if let Some(budget) = self.origins.get(origin) {
            return Arc::clone(budget.value());
        }
        let entry = self.origins.entry(origin.to_string()).or_insert_with(|| {
            Arc::new(OriginBudget::new(
                origin,
                self.per_origin_ceiling,
                self.backoff_min,
            ))
        });
        Arc::clone(entry.value())
    }

    /// Acquires a permit for one network attempt against `origin`.
    ///
    /// Waits for the origin's backoff window to close, for request spacing,
    /// and for a free slot under both ceilings. The whole wait is bounded by
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`GovernorError::Timeout`] if no permit was granted in time.
    #[instrument(skip(self), fields(origin = %origin))]
    pub async fn acquire(&self, origin: &str, timeout: Duration) -> Result<Permit, GovernorError> {
        let budget = self.budget(origin);
        let deadline = Instant::now() + timeout;
        match timeout_at(deadline, self.acquire_inner(budget)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(waited_ms = timeout.as_millis(), "permit wait timed out");
                Err(GovernorError::Timeout {
                    origin: origin.to_string(),
                    waited: timeout,
                })
            }
        }
    }

    async fn acquire_inner(&self, budget: Arc<OriginBudget>) -> Result<Permit, GovernorError> {
        loop {
            if let Some(until) = budget.blocked_until(self.request_interval, Instant::now()) {
                debug!(
                    wait_ms = until.saturating_duration_since(Instant::now()).as_millis(),
                    "origin window closed, waiting"
                );
                sleep_until(until).await;
                continue;
            }

            let global = Arc::clone(&self.global)
                .acquire_owned()
                .await
                .map_err(|_| GovernorError::Closed)?;
            let slot = Arc::clone(&budget.slots)
                .acquire_owned()
                .await
                .map_err(|_| GovernorError::Closed)?;

            // A penalty or another grant may have landed while we queued.
            match budget.try_grant(self.request_interval, Instant::now()) {
                Ok(()) => return Ok(Permit::new(budget, slot, global)),
                Err(until) => {
                    drop(slot);
                    drop(global);
                    sleep_until(until).await;
                }
            }
        }
    }

    /// Admits one item to work against `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`GovernorError::Cancelled`] if `cancel` fires first.
    #[instrument(skip(self, cancel), fields(origin = %origin))]
    pub async fn admit(
        &self,
        origin: &str,
        cancel: &CancellationToken,
    ) -> Result<Admission, GovernorError> {
        let budget = self.budget(origin);
        let slots = Arc::clone(&budget.admissions);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(GovernorError::Cancelled {
                origin: origin.to_string(),
            }),
            slot = slots.acquire_owned() => {
                let slot = slot.map_err(|_| GovernorError::Closed)?;
                Ok(Admission::new(budget, slot))
            }
        }
    }

    /// Widens the origin's backoff window after a `RateLimited` or
    /// `AntiBotChallenge` failure.
    ///
    /// The window escalates multiplicatively and is never shorter than a
    /// server-supplied `retry_after`. Both are capped at the configured
    /// maximum.
    #[instrument(skip(self), fields(origin = %origin))]
    pub fn penalize(&self, origin: &str, kind: FailureKind, retry_after: Option<Duration>) {
        let budget = self.budget(origin);
        let window = {
            let mut state = budget.lock_state();
            let escalated = state.backoff.mul_f64(self.escalation);
            state.backoff = self.clamp(escalated);
            let window = retry_after
                .map_or(state.backoff, |server| state.backoff.max(server))
                .min(self.backoff_max);
            let now = Instant::now();
            let until = now + window;
            state.not_before = Some(state.not_before.map_or(until, |prev| prev.max(until)));
            state.last_failure = Some(now);
            window
        };

        let total = budget.add_cumulative_delay(window);
        info!(
            kind = %kind,
            window_ms = window.as_millis(),
            "origin penalized"
        );
        if total >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(
                cumulative_secs = total.as_secs(),
                "origin has imposed significant backoff, it may be blocking this client"
            );
        }
    }

    /// Narrows the origin's backoff window after a successful attempt.
    #[instrument(skip(self), fields(origin = %origin))]
    pub fn record_success(&self, origin: &str) {
        let budget = self.budget(origin);
        let mut state = budget.lock_state();
        let decayed = state.backoff.mul_f64(self.decay);
        state.backoff = self.clamp(decayed);
        debug!(backoff_ms = state.backoff.as_millis(), "origin backoff decayed");
    }

    fn clamp(&self, backoff: Duration) -> Duration {
        backoff.clamp(self.backoff_min, self.backoff_max)
    }

    /// Current backoff window width for `origin`.
    #[must_use]
    pub fn current_backoff(&self, origin: &str) -> Duration {
        self.origins
            .get(origin)
            .map_or(self.backoff_min, |budget| budget.backoff())
    }

    /// Time left before `origin` grants permits again.
    #[must_use]
    pub fn window_remaining(&self, origin: &str) -> Duration {
        let Some(budget) = self.origins.get(origin).map(|b| Arc::clone(b.value())) else {
            return Duration::ZERO;
        };
        let now = Instant::now();
        budget
            .blocked_until(Duration::ZERO, now)
            .map_or(Duration::ZERO, |until| until - now)
    }

    /// Attempt permits currently held for `origin`.
    #[must_use]
    pub fn in_flight(&self, origin: &str) -> usize {
        self.origins.get(origin).map_or(0, |budget| budget.in_flight())
    }

    /// Items currently admitted to `origin`.
    #[must_use]
    pub fn admitted(&self, origin: &str) -> usize {
        self.origins.get(origin).map_or(0, |budget| budget.admitted())
    }

    /// Attempt permits held across all origins.
    #[must_use]
    pub fn total_in_flight(&self) -> usize {
        self.origins.iter().map(|budget| budget.in_flight()).sum()
    }

    /// Number of origins seen so far.
    #[must_use]
    pub fn origin_count(&self) -> usize {
        self.origins.len()
    }

    /// Per-origin ceiling.
    #[must_use]
    pub fn per_origin_ceiling(&self) -> usize {
        self.per_origin_ceiling
    }
}
