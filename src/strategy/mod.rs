//! Acquisition strategies and the registry that orders them.
//!
//! A [`Strategy`] is one method of turning a URL into a fetchable
//! [`MediaArtifact`]. Strategies are data, not a type hierarchy: each one
//! declares an applicability predicate and a [`StrategyTier`], and the
//! [`StrategyRegistry`] turns those into a deterministic, per-origin order.
//!
//! # Architecture
//!
//! - [`Strategy`] - Async trait that individual strategies implement
//! - [`StrategyRegistry`] - Tier-ordered collection with per-origin demotion
//! - [`ManifestStrategy`] - Narrow strategy for HLS/DASH manifest URLs
//! - [`HttpProbeStrategy`] - Wide strategy probing the URL over HTTP
//! - [`UnsupportedStrategy`] - Sentinel that terminates every chain

mod http_probe;
mod manifest;
mod registry;
mod unsupported;

pub use http_probe::HttpProbeStrategy;
pub use manifest::ManifestStrategy;
pub use registry::StrategyRegistry;
pub use unsupported::UnsupportedStrategy;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::failure::{FailureKind, StrategyFailure};
use crate::media::{AuthContext, MediaArtifact, MediaConstraints};

/// Builds the registry used by the CLI.
///
/// Order is deterministic: the manifest strategy before the HTTP probe, and
/// the sentinel last.
#[must_use]
pub fn default_registry(config: &EngineConfig, client: reqwest::Client) -> StrategyRegistry {
    let mut registry = StrategyRegistry::new(config.demotion_half_life);
    registry.register(Box::new(ManifestStrategy::new()));
    registry.register(Box::new(HttpProbeStrategy::new(client)));
    registry
}

/// Static priority band of a strategy.
///
/// Strategies are tried Specialized first, then General, then Fallback.
/// Derives `Ord` so that `Specialized < General < Fallback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StrategyTier {
    /// Narrow, platform- or format-specific methods.
    Specialized = 0,
    /// Wide methods that work against most origins.
    General = 1,
    /// Last-resort methods.
    Fallback = 2,
}

impl StrategyTier {
    /// Numeric rank used as the base of the ordering key.
    #[must_use]
    pub fn rank(self) -> f64 {
        f64::from(self as u8)
    }
}

/// Tagged result of one strategy attempt.
#[derive(Debug)]
pub enum StrategyOutcome {
    /// The strategy produced a fetchable artifact.
    Resolved(MediaArtifact),
    /// The strategy failed with a classified reason.
    Failed(StrategyFailure),
}

impl StrategyOutcome {
    /// Shorthand for a failure with the kind's default retryability.
    pub fn failed(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::Failed(StrategyFailure::new(kind, detail))
    }

    /// Returns the failure kind, or `None` on success.
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Resolved(_) => None,
            Self::Failed(failure) => Some(failure.kind),
        }
    }
}

/// One method of acquiring a fetchable media locator from a URL.
///
/// Implementations must observe `cancel` at every blocking point and return
/// promptly once it fires. Every failure must be classified into a
/// [`FailureKind`] at this boundary.
///
/// # Object Safety
///
/// This trait uses `async_trait` to support dynamic dispatch via
/// `Box<dyn Strategy>` in the registry.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Stable name used in attempt history and demotion bookkeeping.
    fn name(&self) -> &str;

    /// Static priority band.
    fn tier(&self) -> StrategyTier;

    /// Returns true if this strategy can attempt the given URL and constraints.
    fn applies_to(&self, url: &str, constraints: &MediaConstraints) -> bool;

    /// Returns true if an attempt touches the network and therefore needs a
    /// rate-governor permit.
    fn is_network_bound(&self) -> bool {
        true
    }

    /// Attempts to resolve the URL into an artifact.
    async fn attempt(
        &self,
        url: &str,
        constraints: &MediaConstraints,
        auth: Option<&AuthContext>,
        cancel: &CancellationToken,
    ) -> StrategyOutcome;
}
