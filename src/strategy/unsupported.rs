//! Terminal sentinel strategy.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::failure::StrategyFailure;
use crate::media::{AuthContext, MediaConstraints};

use super::{Strategy, StrategyOutcome, StrategyTier};

/// The strategy that ends every chain.
///
/// Always applicable, never touches the network, and always reports a
/// non-retryable `UnsupportedContent`. The registry appends it after every
/// other strategy so an empty chain has a defined outcome.
#[derive(Debug, Default)]
pub struct UnsupportedStrategy;

impl UnsupportedStrategy {
    /// Creates the sentinel.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Strategy for UnsupportedStrategy {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn tier(&self) -> StrategyTier {
        StrategyTier::Fallback
    }

    fn applies_to(&self, _url: &str, _constraints: &MediaConstraints) -> bool {
        true
    }

    fn is_network_bound(&self) -> bool {
        false
    }

    async fn attempt(
        &self,
        _url: &str,
        _constraints: &MediaConstraints,
        _auth: Option<&AuthContext>,
        _cancel: &CancellationToken,
    ) -> StrategyOutcome {
        StrategyOutcome::Failed(
            StrategyFailure::unsupported("no strategy could handle this URL").retryable(false),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FailureKind;

    #[tokio::test]
    async fn test_sentinel_always_fails_unsupported() {
        let sentinel = UnsupportedStrategy::new();
        assert!(sentinel.applies_to("anything", &MediaConstraints::default()));
        assert!(!sentinel.is_network_bound());

        let outcome = sentinel
            .attempt(
                "https://a.com/x",
                &MediaConstraints::default(),
                None,
                &CancellationToken::new(),
            )
            .await;
        match outcome {
            StrategyOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::UnsupportedContent);
                assert!(!failure.retryable);
            }
            StrategyOutcome::Resolved(_) => panic!("sentinel must never resolve"),
        }
    }
}
