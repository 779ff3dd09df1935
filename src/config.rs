//! Engine configuration.
//!
//! [`EngineConfig`] is built once at startup and shared by `Arc` into the
//! orchestrator, resolver, and rate governor. Nothing reads configuration
//! from ambient global state.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum allowed worker count.
const MIN_WORKERS: usize = 1;

/// Maximum allowed worker count.
const MAX_WORKERS: usize = 100;

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 4;

/// Default global permit ceiling across all origins.
pub const DEFAULT_GLOBAL_CEILING: usize = 8;

/// Default per-origin permit ceiling. Kept low for hosts that throttle aggressively.
pub const DEFAULT_PER_ORIGIN_CEILING: usize = 2;

/// Default cap on same-strategy retries for transient failures.
pub const DEFAULT_SAME_STRATEGY_RETRIES: u32 = 2;

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Worker count outside the supported range.
    #[error("invalid worker count {value}: must be between {MIN_WORKERS} and {MAX_WORKERS}")]
    InvalidWorkers {
        /// The rejected value.
        value: usize,
    },

    /// Worker pool larger than the global permit ceiling.
    #[error("worker count {workers} exceeds global ceiling {global_ceiling}")]
    WorkersExceedGlobalCeiling {
        /// Configured workers.
        workers: usize,
        /// Configured global ceiling.
        global_ceiling: usize,
    },

    /// A ceiling of zero, or a per-origin ceiling above the global one.
    #[error("invalid ceiling: per-origin {per_origin}, global {global}")]
    InvalidCeiling {
        /// Per-origin ceiling.
        per_origin: usize,
        /// Global ceiling.
        global: usize,
    },

    /// A timeout configured as zero.
    #[error("`{field}` must be greater than zero")]
    ZeroDuration {
        /// Field name.
        field: &'static str,
    },

    /// Backoff bounds or factors that would grow without limit or collapse to zero.
    #[error("invalid backoff settings: {reason}")]
    InvalidBackoff {
        /// What is wrong.
        reason: String,
    },
}

/// Immutable engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool size.
    pub workers: usize,
    /// Hard cap on permits across all origins.
    pub global_ceiling: usize,
    /// Cap on concurrent permits per origin.
    pub per_origin_ceiling: usize,
    /// Minimum spacing between permit grants to the same origin.
    pub request_interval: Duration,
    /// Longest wait for a single permit.
    pub permit_timeout: Duration,
    /// Deadline for a single strategy attempt.
    pub attempt_timeout: Duration,
    /// Overall deadline for one resolution.
    pub resolution_deadline: Duration,
    /// Same-strategy retries for `TransientNetwork` / `InternalError`.
    pub same_strategy_retries: u32,
    /// Base delay for same-strategy exponential backoff.
    pub retry_base_delay: Duration,
    /// Cap for same-strategy backoff.
    pub retry_max_delay: Duration,
    /// Maximum random jitter added to backoff delays.
    pub retry_jitter: Duration,
    /// Lower bound of an origin's backoff window.
    pub backoff_min: Duration,
    /// Upper bound of an origin's backoff window.
    pub backoff_max: Duration,
    /// Multiplier applied on `RateLimited` / `AntiBotChallenge` penalties.
    pub backoff_escalation: f64,
    /// Multiplier applied on success.
    pub backoff_decay: f64,
    /// Half-life of a strategy's per-origin demotion score.
    pub demotion_half_life: Duration,
    /// Fetch / post-process retries per item.
    pub stage_retries: u32,
    /// Times a fetch failure may send an item back to resolution.
    pub re_resolutions: u32,
    /// Times an exhausted-but-retryable resolution is retried for an item.
    pub item_retries: u32,
    /// Destination directory for fetched files.
    pub output_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            global_ceiling: DEFAULT_GLOBAL_CEILING,
            per_origin_ceiling: DEFAULT_PER_ORIGIN_CEILING,
            request_interval: Duration::ZERO,
            permit_timeout: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(60),
            resolution_deadline: Duration::from_secs(180),
            same_strategy_retries: DEFAULT_SAME_STRATEGY_RETRIES,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(32),
            retry_jitter: Duration::from_millis(500),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            backoff_escalation: 2.0,
            backoff_decay: 0.5,
            demotion_half_life: Duration::from_secs(600),
            stage_retries: 2,
            re_resolutions: 1,
            item_retries: 1,
            output_dir: PathBuf::from("."),
        }
    }
}

impl EngineConfig {
    /// Validates ranges and cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.workers) {
            return Err(ConfigError::InvalidWorkers {
                value: self.workers,
            });
        }
        if self.per_origin_ceiling == 0
            || self.global_ceiling == 0
            || self.per_origin_ceiling > self.global_ceiling
        {
            return Err(ConfigError::InvalidCeiling {
                per_origin: self.per_origin_ceiling,
                global: self.global_ceiling,
            });
        }
        if self.workers > self.global_ceiling {
            return Err(ConfigError::WorkersExceedGlobalCeiling {
                workers: self.workers,
                global_ceiling: self.global_ceiling,
            });
        }

        for (field, value) in [
            ("permit_timeout", self.permit_timeout),
            ("attempt_timeout", self.attempt_timeout),
            ("resolution_deadline", self.resolution_deadline),
            ("backoff_min", self.backoff_min),
            ("demotion_half_life", self.demotion_half_life),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }

        if self.backoff_min > self.backoff_max {
            return Err(ConfigError::InvalidBackoff {
                reason: format!(
                    "backoff_min {:?} exceeds backoff_max {:?}",
                    self.backoff_min, self.backoff_max
                ),
            });
        }
        if self.backoff_escalation.is_nan() || self.backoff_escalation <= 1.0 {
            return Err(ConfigError::InvalidBackoff {
                reason: format!(
                    "backoff_escalation {} must be greater than 1",
                    self.backoff_escalation
                ),
            });
        }
        if self.backoff_decay.is_nan() || !(self.backoff_decay > 0.0 && self.backoff_decay < 1.0)
        {
            return Err(ConfigError::InvalidBackoff {
                reason: format!(
                    "backoff_decay {} must be between 0 and 1",
                    self.backoff_decay
                ),
            });
        }
        Ok(())
    }
}
