//! Queue item states and the transition table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A working stage an item can be retried in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Running the strategy chain.
    Resolving,
    /// Transferring bytes via the fetch collaborator.
    Fetching,
    /// Running the post-process collaborator.
    PostProcessing,
}

impl Stage {
    /// Returns the stable string label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolving => "resolving",
            Self::Fetching => "fetching",
            Self::PostProcessing => "post_processing",
        }
    }

    /// Returns the working state for this stage.
    #[must_use]
    pub fn state(self) -> ItemState {
        match self {
            Self::Resolving => ItemState::Resolving,
            Self::Fetching => ItemState::Fetching,
            Self::PostProcessing => ItemState::PostProcessing,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a queue item.
///
/// `Pending` is the only initial state. `Done`, `Failed`, and `Cancelled`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum ItemState {
    /// Accepted, waiting for a worker.
    Pending,
    /// Running the strategy chain.
    Resolving,
    /// Transferring bytes.
    Fetching,
    /// Post-processing the fetched file.
    PostProcessing,
    /// Waiting to re-enter a stage.
    Retrying(Stage),
    /// Completed successfully.
    Done,
    /// Failed permanently.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl ItemState {
    /// Returns the stable string label (without the retry stage).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Fetching => "fetching",
            Self::PostProcessing => "post_processing",
            Self::Retrying(_) => "retrying",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for `Done`, `Failed`, and `Cancelled`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Returns true while the item occupies a working stage.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Resolving | Self::Fetching | Self::PostProcessing)
    }

    /// Returns true if the transition table allows `self -> next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ItemState::{Cancelled, Done, Failed, Fetching, Pending, PostProcessing, Resolving, Retrying};

        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }
        match (self, next) {
            (Pending, Resolving)
            | (Resolving, Fetching | Retrying(Stage::Resolving) | Failed)
            | (Fetching, PostProcessing | Retrying(Stage::Fetching) | Failed)
            | (PostProcessing, Done | Retrying(Stage::PostProcessing) | Failed)
            | (Retrying(Stage::Fetching), Resolving) => true,
            (Retrying(stage), next) => next == stage.state() || next == Failed,
            _ => false,
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retrying(stage) => write!(f, "retrying({stage})"),
            other => f.write_str(other.as_str()),
        }
    }
}
