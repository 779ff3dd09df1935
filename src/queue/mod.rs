//! Queue item state machine.
//!
//! Items move `Pending → Resolving → Fetching → PostProcessing → Done`.
//! Each working stage may detour through `Retrying` or end in `Failed`;
//! any non-terminal state may be `Cancelled`.

mod item;
mod state;

pub use item::{ItemId, QueueItem};
pub use state::{ItemState, Stage};
