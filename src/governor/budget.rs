//! Per-origin permit budget and backoff window.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Backoff window state for one origin.
///
/// Mutated only while the origin's state lock is held, so penalties and
/// successes for the same origin never interleave.
#[derive(Debug)]
pub(crate) struct BackoffState {
    /// Current window width, always within the configured bounds.
    pub(crate) backoff: Duration,
    /// No permit is granted before this instant.
    pub(crate) not_before: Option<Instant>,
    /// Most recent penalty.
    pub(crate) last_failure: Option<Instant>,
    /// Most recent permit grant, for request spacing.
    pub(crate) last_grant: Option<Instant>,
}

/// Concurrency and backoff bookkeeping for a single origin.
#[derive(Debug)]
pub struct OriginBudget {
    origin: String,
    /// Attempt permits, one per in-flight network attempt.
    pub(crate) slots: Arc<Semaphore>,
    /// Item admissions, one per item in `Resolving` or `Fetching`.
    pub(crate) admissions: Arc<Semaphore>,
    in_flight: AtomicUsize,
    admitted: AtomicUsize,
    /// Total penalty time imposed on this origin (in milliseconds).
    cumulative_delay_ms: AtomicU64,
    state: Mutex<BackoffState>,
}

impl OriginBudget {
    pub(crate) fn new(origin: &str, ceiling: usize, backoff_min: Duration) -> Self {
        Self {
            origin: origin.to_string(),
            slots: Arc::new(Semaphore::new(ceiling)),
            admissions: Arc::new(Semaphore::new(ceiling)),
            in_flight: AtomicUsize::new(0),
            admitted: AtomicUsize::new(0),
            cumulative_delay_ms: AtomicU64::new(0),
            state: Mutex::new(BackoffState {
                backoff: backoff_min,
                not_before: None,
                last_failure: None,
                last_grant: None,
            }),
        }
    }

    /// Origin key this budget belongs to.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Attempt permits currently held.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Items currently admitted.
    #[must_use]
    pub fn admitted(&self) -> usize {
        self.admitted.load(Ordering::SeqCst)
    }

    /// Current backoff window width.
    #[must_use]
    pub fn backoff(&self) -> Duration {
        self.lock_state().backoff
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BackoffState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the instant before which no grant may happen, if it is in the future.
    pub(crate) fn blocked_until(&self, interval: Duration, now: Instant) -> Option<Instant> {
        let state = self.lock_state();
        earliest_grant(&state, interval).filter(|at| *at > now)
    }

    /// Records a grant if the window and spacing allow one now.
    ///
    /// Returns the instant to retry at when the grant is refused. The caller
    /// must already hold an attempt slot.
    pub(crate) fn try_grant(&self, interval: Duration, now: Instant) -> Result<(), Instant> {
        let mut state = self.lock_state();
        if let Some(at) = earliest_grant(&state, interval).filter(|at| *at > now) {
            return Err(at);
        }
        state.last_grant = Some(now);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn note_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::SeqCst);
    }

    /// Adds to the cumulative delay and returns the new total.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

fn earliest_grant(state: &BackoffState, interval: Duration) -> Option<Instant> {
    let spaced = state
        .last_grant
        .filter(|_| !interval.is_zero())
        .map(|last| last + interval);
    match (state.not_before, spaced) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// A right to perform one network attempt against an origin.
///
/// Holding a `Permit` counts against both the origin's ceiling and the
/// global ceiling. Dropping it releases both, on every path including
/// cancellation and panics.
#[derive(Debug)]
pub struct Permit {
    budget: Arc<OriginBudget>,
    _slot: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl Permit {
    pub(crate) fn new(
        budget: Arc<OriginBudget>,
        slot: OwnedSemaphorePermit,
        global: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            budget,
            _slot: slot,
            _global: global,
        }
    }

    /// Origin this permit was granted for.
    #[must_use]
    pub fn origin(&self) -> &str {
        self.budget.origin()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.budget.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Item-level admission to an origin, held while an item is resolving or fetching.
#[derive(Debug)]
pub struct Admission {
    budget: Arc<OriginBudget>,
    _slot: OwnedSemaphorePermit,
}

impl Admission {
    pub(crate) fn new(budget: Arc<OriginBudget>, slot: OwnedSemaphorePermit) -> Self {
        budget.note_admitted();
        Self {
            budget,
            _slot: slot,
        }
    }

    /// Origin this admission was granted for.
    #[must_use]
    pub fn origin(&self) -> &str {
        self.budget.origin()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.budget.admitted.fetch_sub(1, Ordering::SeqCst);
    }
}
