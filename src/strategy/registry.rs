//! Strategy registry with per-origin demotion.
//!
//! The [`StrategyRegistry`] orders applicable strategies by
//! `tier rank + DEMOTION_WEIGHT × decayed failure score`, breaking ties by
//! registration index, so the order is total and deterministic for identical
//! inputs and outcome history. Demotion is advisory: a demoted strategy is
//! still tried, only later.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::failure::FailureKind;
use crate::governor::extract_origin;
use crate::media::MediaConstraints;

use super::{Strategy, UnsupportedStrategy};

/// How far one unit of failure score moves a strategy down the order.
///
/// One fresh method-level failure is enough to push a strategy behind the
/// next tier's strategies for that origin.
const DEMOTION_WEIGHT: f64 = 1.5;

/// Failure score with the instant it was last updated.
#[derive(Debug, Clone, Copy)]
struct DemotionScore {
    score: f64,
    updated: Instant,
}

impl DemotionScore {
    fn decayed(self, now: Instant, half_life: Duration) -> f64 {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.score * 0.5_f64.powf(elapsed / half_life.as_secs_f64())
    }
}

/// A tier-ordered collection of strategies with a terminal sentinel.
pub struct StrategyRegistry {
    strategies: Vec<Box<dyn Strategy>>,
    sentinel: UnsupportedStrategy,
    half_life: Duration,
    /// Keyed by (origin, strategy name).
    scores: DashMap<(String, String), DemotionScore>,
}

impl StrategyRegistry {
    /// Creates an empty registry whose demotion scores halve every `half_life`.
    #[must_use]
    pub fn new(half_life: Duration) -> Self {
        Self {
            strategies: Vec::new(),
            sentinel: UnsupportedStrategy::new(),
            half_life,
            scores: DashMap::new(),
        }
    }

    /// Registers a strategy.
    #[tracing::instrument(skip(self, strategy), fields(strategy_name))]
    pub fn register(&mut self, strategy: Box<dyn Strategy>) {
        tracing::Span::current().record("strategy_name", strategy.name());
        debug!(
            name = strategy.name(),
            tier = ?strategy.tier(),
            "Registering strategy"
        );
        self.strategies.push(strategy);
    }

    /// Returns the number of registered strategies, excluding the sentinel.
    #[must_use]
    pub fn strategy_count(&self) -> usize {
        self.strategies.len()
    }

    /// Returns true if no strategies are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Returns the applicable strategies for `url`, in attempt order.
    ///
    /// The sentinel is always the last element, so the result is never empty.
    #[must_use]
    #[instrument(skip(self, constraints))]
    pub fn applicable_strategies(
        &self,
        url: &str,
        constraints: &MediaConstraints,
    ) -> Vec<&dyn Strategy> {
        let origin = extract_origin(url);
        let now = Instant::now();

        let mut keyed: Vec<(f64, usize, &dyn Strategy)> = self
            .strategies
            .iter()
            .enumerate()
            .filter(|(_, s)| s.applies_to(url, constraints))
            .map(|(index, s)| {
                let demotion = self.decayed_score(&origin, s.name(), now);
                (s.tier().rank() + DEMOTION_WEIGHT * demotion, index, s.as_ref())
            })
            .collect();
        keyed.sort_by(|a, b| match a.0.total_cmp(&b.0) {
            Ordering::Equal => a.1.cmp(&b.1),
            other => other,
        });

        let mut ordered: Vec<&dyn Strategy> = keyed.into_iter().map(|(_, _, s)| s).collect();
        ordered.push(&self.sentinel);
        debug!(count = ordered.len(), origin = %origin, "ordered strategy chain");
        ordered
    }

    /// Feeds one attempt's outcome back into the ordering for `origin`.
    ///
    /// Success clears the strategy's score. Method-level failures add one
    /// unit; failures that say nothing about the method leave it untouched.
    /// The sentinel is never scored.
    #[instrument(skip(self))]
    pub fn record_outcome(&self, origin: &str, strategy: &str, outcome: Result<(), FailureKind>) {
        if strategy == self.sentinel.name() {
            return;
        }
        let key = (origin.to_string(), strategy.to_string());
        let now = Instant::now();
        match outcome {
            Ok(()) => {
                self.scores.remove(&key);
            }
            Err(kind) if kind.demotes_strategy() => {
                let mut entry = self.scores.entry(key).or_insert(DemotionScore {
                    score: 0.0,
                    updated: now,
                });
                let score = entry.decayed(now, self.half_life) + 1.0;
                *entry = DemotionScore {
                    score,
                    updated: now,
                };
                debug!(score, "strategy demoted for origin");
            }
            Err(_) => {}
        }
    }

    /// Current decayed failure score of `strategy` for `origin`.
    #[must_use]
    pub fn demotion_score(&self, origin: &str, strategy: &str) -> f64 {
        self.decayed_score(origin, strategy, Instant::now())
    }

    fn decayed_score(&self, origin: &str, strategy: &str, now: Instant) -> f64 {
        self.scores
            .get(&(origin.to_string(), strategy.to_string()))
            .map_or(0.0, |entry| entry.decayed(now, self.half_life))
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.strategies.iter().map(|s| s.name()).collect();
        f.debug_struct("StrategyRegistry")
            .field("strategies", &names)
            .field("half_life", &self.half_life)
            .field("scored_pairs", &self.scores.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::media::{AuthContext, MediaArtifact};
    use crate::strategy::{StrategyOutcome, StrategyTier};

    struct Named {
        name: &'static str,
        tier: StrategyTier,
        only_host: Option<&'static str>,
    }

    #[async_trait]
    impl Strategy for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn tier(&self) -> StrategyTier {
            self.tier
        }

        fn applies_to(&self, url: &str, _constraints: &MediaConstraints) -> bool {
            self.only_host.is_none_or(|host| extract_origin(url) == host)
        }

        async fn attempt(
            &self,
            url: &str,
            _constraints: &MediaConstraints,
            _auth: Option<&AuthContext>,
            _cancel: &CancellationToken,
        ) -> StrategyOutcome {
            StrategyOutcome::Resolved(MediaArtifact::progressive(url))
        }
    }

    fn named(name: &'static str, tier: StrategyTier) -> Box<dyn Strategy> {
        Box::new(Named {
            name,
            tier,
            only_host: None,
        })
    }

    fn registry() -> StrategyRegistry {
        let mut registry = StrategyRegistry::new(Duration::from_secs(600));
        registry.register(named("general_a", StrategyTier::General));
        registry.register(named("specialized", StrategyTier::Specialized));
        registry.register(named("general_b", StrategyTier::General));
        registry.register(named("fallback", StrategyTier::Fallback));
        registry
    }

    fn order(registry: &StrategyRegistry, url: &str) -> Vec<String> {
        registry
            .applicable_strategies(url, &MediaConstraints::default())
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    // ==================== Ordering Tests ====================

    #[test]
    fn test_empty_registry_yields_sentinel_only() {
        let registry = StrategyRegistry::new(Duration::from_secs(600));
        assert!(registry.is_empty());
        assert_eq!(order(&registry, "https://a.com/x"), vec!["unsupported"]);
    }

    #[test]
    fn test_tier_then_registration_order() {
        let registry = registry();
        assert_eq!(registry.strategy_count(), 4);
        assert_eq!(
            order(&registry, "https://a.com/x"),
            vec!["specialized", "general_a", "general_b", "fallback", "unsupported"]
        );
    }

    #[test]
    fn test_order_is_deterministic() {
        let registry = registry();
        let first = order(&registry, "https://a.com/x");
        for _ in 0..10 {
            assert_eq!(order(&registry, "https://a.com/x"), first);
        }
    }

    #[test]
    fn test_narrow_strategy_filtered_by_applicability() {
        let mut registry = registry();
        registry.register(Box::new(Named {
            name: "only_b",
            tier: StrategyTier::Specialized,
            only_host: Some("b.com"),
        }));
        assert!(!order(&registry, "https://a.com/x").contains(&"only_b".to_string()));
        assert_eq!(order(&registry, "https://b.com/x")[0], "only_b");
    }

    // ==================== Demotion Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_method_failure_demotes_for_that_origin_only() {
        let registry = registry();
        registry.record_outcome("a.com", "specialized", Err(FailureKind::AntiBotChallenge));

        let a = order(&registry, "https://a.com/x");
        assert_eq!(a[0], "general_a");
        assert!(a.contains(&"specialized".to_string()), "demoted, not removed");
        assert_eq!(a.last().unwrap(), "unsupported");

        assert_eq!(order(&registry, "https://b.com/x")[0], "specialized");
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_failures_do_not_demote() {
        let registry = registry();
        registry.record_outcome("a.com", "specialized", Err(FailureKind::NotFound));
        registry.record_outcome("a.com", "specialized", Err(FailureKind::RateLimited));
        assert_eq!(registry.demotion_score("a.com", "specialized"), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_score() {
        let registry = registry();
        registry.record_outcome("a.com", "general_a", Err(FailureKind::TransientNetwork));
        assert!(registry.demotion_score("a.com", "general_a") > 0.0);
        registry.record_outcome("a.com", "general_a", Ok(()));
        assert_eq!(registry.demotion_score("a.com", "general_a"), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_score_decays_with_half_life() {
        let registry = registry();
        registry.record_outcome("a.com", "specialized", Err(FailureKind::UnsupportedContent));
        tokio::time::advance(Duration::from_secs(600)).await;
        let score = registry.demotion_score("a.com", "specialized");
        assert!((score - 0.5).abs() < 1e-6, "score was {score}");

        tokio::time::advance(Duration::from_secs(6000)).await;
        assert_eq!(order(&registry, "https://a.com/x")[0], "specialized");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentinel_never_scored() {
        let registry = registry();
        registry.record_outcome("a.com", "unsupported", Err(FailureKind::UnsupportedContent));
        assert_eq!(registry.demotion_score("a.com", "unsupported"), 0.0);
    }
}
