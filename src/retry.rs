//! Same-strategy and per-stage retry policy with exponential backoff.
//!
//! The [`RetryPolicy`] decides whether a failed attempt is repeated with the
//! *same* method, and how long to wait first. Whether to move on to another
//! method is the resolver's decision, driven by [`FailureKind::policy`].
//!
//! # Delay Calculation
//!
//! ```text
//! delay = min(base_delay * multiplier^(retry - 1), max_delay) + jitter
//! ```
//!
//! With defaults, delays are approximately: 1s, 2s, 4s (before hitting the cap).
//! `RateLimited` retries carry no delay of their own: the rate governor's
//! backoff window is what holds them back.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use crate::config::EngineConfig;
use crate::failure::{FailureKind, FailurePolicy};

/// Multiplier applied each retry.
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Decision on whether to repeat a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Repeat after the specified delay.
    Retry {
        /// How long to wait before repeating.
        delay: Duration,
        /// Which retry this will be (1-indexed).
        retry: u32,
    },

    /// Do not repeat.
    DoNotRetry {
        /// Human-readable reason why the attempt is not repeated.
        reason: String,
    },
}

/// Retry budget and backoff curve for one kind of attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_jitter: Duration,
}

impl RetryPolicy {
    /// Creates a policy with explicit settings.
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration, max_jitter: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            max_jitter,
        }
    }

    /// Policy for repeating a strategy attempt within one resolution.
    #[must_use]
    pub fn same_strategy(config: &EngineConfig) -> Self {
        Self::new(
            config.same_strategy_retries,
            config.retry_base_delay,
            config.retry_max_delay,
            config.retry_jitter,
        )
    }

    /// Policy for repeating a fetch or post-process stage.
    #[must_use]
    pub fn stage(config: &EngineConfig) -> Self {
        Self::new(
            config.stage_retries,
            config.retry_base_delay,
            config.retry_max_delay,
            config.retry_jitter,
        )
    }

    /// Returns the number of retries allowed after the initial attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decides whether to repeat an attempt that failed with `kind`.
    ///
    /// `retries_so_far` counts repeats already made (0 after the initial attempt).
    #[instrument(skip(self), fields(max_retries = self.max_retries))]
    pub fn should_retry(&self, kind: FailureKind, retries_so_far: u32) -> RetryDecision {
        let policy = kind.policy();
        match policy {
            FailurePolicy::Abort => {
                return RetryDecision::DoNotRetry {
                    reason: format!("{kind} is terminal for this request"),
                };
            }
            FailurePolicy::AdvanceChain => {
                return RetryDecision::DoNotRetry {
                    reason: format!("{kind} will not succeed with the same method"),
                };
            }
            FailurePolicy::RetrySameStrategy | FailurePolicy::WaitForOrigin => {}
        }

        if retries_so_far >= self.max_retries {
            debug!(retries_so_far, "retry budget exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            };
        }

        let retry = retries_so_far + 1;
        let delay = if policy == FailurePolicy::WaitForOrigin {
            Duration::ZERO
        } else {
            self.calculate_delay(retry)
        };
        debug!(retry, delay_ms = delay.as_millis(), "will retry");
        RetryDecision::Retry { delay, retry }
    }

    /// Calculates the delay before the given retry (1-indexed).
    #[must_use]
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * BACKOFF_MULTIPLIER.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped) + self.calculate_jitter()
    }

    /// Generates random jitter between 0 and the configured maximum.
    ///
    /// Jitter keeps items that failed together from retrying in lockstep.
    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=max_ms);
        Duration::from_millis(jitter_ms)
    }
}
