//! Attempt history records.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::failure::{FailureKind, StrategyFailure};
use crate::queue::Stage;

/// What one attempt produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptResult {
    /// The strategy produced an artifact.
    Resolved,
    /// The attempt failed.
    Failed(StrategyFailure),
}

/// One entry of an item's attempt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Strategy or collaborator name.
    pub strategy: String,
    /// Stage the attempt belonged to.
    pub stage: Stage,
    /// Wall-clock start.
    pub started_at: SystemTime,
    /// Time spent, including any permit wait.
    pub elapsed: Duration,
    /// Outcome.
    pub result: AttemptResult,
}

impl AttemptRecord {
    /// Creates a record for a successful attempt.
    pub fn resolved(
        strategy: impl Into<String>,
        stage: Stage,
        started_at: SystemTime,
        elapsed: Duration,
    ) -> Self {
        Self {
            strategy: strategy.into(),
            stage,
            started_at,
            elapsed,
            result: AttemptResult::Resolved,
        }
    }

    /// Creates a record for a failed attempt.
    pub fn failed(
        strategy: impl Into<String>,
        stage: Stage,
        started_at: SystemTime,
        elapsed: Duration,
        failure: StrategyFailure,
    ) -> Self {
        Self {
            strategy: strategy.into(),
            stage,
            started_at,
            elapsed,
            result: AttemptResult::Failed(failure),
        }
    }

    /// Failure kind, or `None` for a successful attempt.
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.result {
            AttemptResult::Resolved => None,
            AttemptResult::Failed(failure) => Some(failure.kind),
        }
    }
}
