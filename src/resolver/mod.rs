//! Resolution fallback engine.
//!
//! The [`Resolver`] walks the registry's ordered strategy chain for one
//! request. Each network attempt holds a rate-governor permit for the
//! request's origin and runs under a per-attempt timeout; the whole run is
//! bounded by the resolution deadline and observes the caller's
//! cancellation token.
//!
//! # Decision Table
//!
//! | Failure | Action |
//! |---------|--------|
//! | `TransientNetwork`, `InternalError` | retry same strategy with backoff, up to the cap |
//! | `RateLimited` | penalize origin, retry same strategy once the window opens |
//! | `AntiBotChallenge`, `UnsupportedContent` | advance to the next strategy |
//! | `AuthRequired`, `NotFound`, `GeoBlocked` | abort the chain |

mod attempt;

pub use attempt::{AttemptRecord, AttemptResult};

use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::failure::{FailureKind, FailurePolicy, StrategyFailure};
use crate::governor::{GovernorError, Permit, RateGovernor, extract_origin};
use crate::media::{DownloadRequest, MediaArtifact};
use crate::queue::Stage;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::strategy::{Strategy, StrategyOutcome, StrategyRegistry};

/// Detail recorded when no permit could be obtained in time.
pub const PERMIT_UNAVAILABLE: &str = "origin permit unavailable";

/// Why a resolution ended without an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", content = "detail", rename_all = "snake_case")]
pub enum ExhaustionCause {
    /// Every applicable strategy and its retry budget was consumed.
    ChainExhausted {
        /// True if some strategy failed in a way that might clear up later.
        retryable: bool,
    },
    /// A terminal failure stopped the chain.
    Aborted(FailureKind),
    /// The overall resolution deadline elapsed.
    DeadlineElapsed,
    /// The caller cancelled.
    Cancelled,
}

/// Result of one resolution run.
#[derive(Debug)]
pub enum Resolution {
    /// A strategy produced an artifact.
    Resolved {
        /// The artifact, owned by the requesting item.
        artifact: MediaArtifact,
        /// Name of the strategy that produced it.
        strategy: String,
        /// Every attempt made, including the successful one.
        history: Vec<AttemptRecord>,
    },
    /// No strategy produced an artifact.
    Exhausted {
        /// Every attempt made.
        history: Vec<AttemptRecord>,
        /// Why the run ended.
        cause: ExhaustionCause,
    },
}

impl Resolution {
    /// Attempt history, regardless of outcome.
    #[must_use]
    pub fn history(&self) -> &[AttemptRecord] {
        match self {
            Self::Resolved { history, .. } | Self::Exhausted { history, .. } => history,
        }
    }
}

/// The caller cancelled while an attempt or a wait was pending.
struct Cancelled;

/// What one pass through a strategy attempt produced.
enum Step {
    Outcome(StrategyOutcome),
    PermitUnavailable,
}

/// Runs strategy chains under the rate governor.
#[derive(Debug, Clone)]
pub struct Resolver {
    registry: Arc<StrategyRegistry>,
    governor: Arc<RateGovernor>,
    config: Arc<EngineConfig>,
    retry: RetryPolicy,
}

impl Resolver {
    /// Creates a resolver sharing the registry and governor.
    #[must_use]
    pub fn new(
        registry: Arc<StrategyRegistry>,
        governor: Arc<RateGovernor>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let retry = RetryPolicy::same_strategy(&config);
        Self {
            registry,
            governor,
            config,
            retry,
        }
    }

    /// The shared strategy registry.
    #[must_use]
    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Resolves `request` into an artifact, or explains why it could not.
    ///
    /// Always returns within the configured resolution deadline (plus the
    /// time for an in-progress attempt to observe cancellation).
    #[instrument(skip(self, request, cancel), fields(url = %request.url()))]
    pub async fn resolve(&self, request: &DownloadRequest, cancel: &CancellationToken) -> Resolution {
        let deadline = Instant::now() + self.config.resolution_deadline;
        let origin = extract_origin(request.url());
        let chain = self
            .registry
            .applicable_strategies(request.url(), request.constraints());

        let mut history = Vec::new();
        let mut retryable = false;

        for strategy in chain {
            let mut retries = 0_u32;
            loop {
                if cancel.is_cancelled() {
                    return exhausted(history, ExhaustionCause::Cancelled);
                }
                if Instant::now() >= deadline {
                    warn!(attempts = history.len(), "resolution deadline elapsed");
                    return exhausted(history, ExhaustionCause::DeadlineElapsed);
                }

                let started_at = SystemTime::now();
                let started = Instant::now();
                let step = match self
                    .run_attempt(strategy, request, &origin, deadline, cancel)
                    .await
                {
                    Ok(step) => step,
                    Err(Cancelled) => return exhausted(history, ExhaustionCause::Cancelled),
                };
                let elapsed = started.elapsed();

                let failure = match step {
                    Step::PermitUnavailable => {
                        debug!(strategy = strategy.name(), "no permit before timeout");
                        history.push(AttemptRecord::failed(
                            strategy.name(),
                            Stage::Resolving,
                            started_at,
                            elapsed,
                            StrategyFailure::new(FailureKind::RateLimited, PERMIT_UNAVAILABLE),
                        ));
                        retryable = true;
                        continue;
                    }
                    Step::Outcome(StrategyOutcome::Resolved(artifact)) => {
                        self.registry.record_outcome(&origin, strategy.name(), Ok(()));
                        if strategy.is_network_bound() {
                            self.governor.record_success(&origin);
                        }
                        history.push(AttemptRecord::resolved(
                            strategy.name(),
                            Stage::Resolving,
                            started_at,
                            elapsed,
                        ));
                        info!(
                            strategy = strategy.name(),
                            attempts = history.len(),
                            "resolution successful"
                        );
                        return Resolution::Resolved {
                            artifact,
                            strategy: strategy.name().to_string(),
                            history,
                        };
                    }
                    Step::Outcome(StrategyOutcome::Failed(failure)) => failure,
                };

                let kind = failure.kind;
                debug!(
                    strategy = strategy.name(),
                    kind = %kind,
                    detail = %failure.detail,
                    "strategy attempt failed"
                );
                self.registry.record_outcome(&origin, strategy.name(), Err(kind));
                if kind.penalizes_origin() {
                    self.governor.penalize(&origin, kind, failure.retry_after);
                }
                if failure.retryable && strategy.is_network_bound() {
                    retryable = true;
                }
                history.push(AttemptRecord::failed(
                    strategy.name(),
                    Stage::Resolving,
                    started_at,
                    elapsed,
                    failure,
                ));

                match kind.policy() {
                    FailurePolicy::Abort => {
                        info!(kind = %kind, "resolution aborted");
                        return exhausted(history, ExhaustionCause::Aborted(kind));
                    }
                    FailurePolicy::AdvanceChain => break,
                    FailurePolicy::WaitForOrigin => {
                        // Offline strategies never call `acquire`; wait here for all.
                        let window = self
                            .governor
                            .window_remaining(&origin)
                            .max(self.governor.current_backoff(&origin));
                        let wake = (Instant::now() + window).min(deadline);
                        debug!(
                            strategy = strategy.name(),
                            window_ms = window.as_millis(),
                            "waiting for origin window"
                        );
                        if pause_until(wake, cancel).await.is_err() {
                            return exhausted(history, ExhaustionCause::Cancelled);
                        }
                    }
                    FailurePolicy::RetrySameStrategy => match self.retry.should_retry(kind, retries) {
                        RetryDecision::Retry { delay, .. } if Instant::now() + delay >= deadline => {
                            debug!(
                                strategy = strategy.name(),
                                delay_ms = delay.as_millis(),
                                "retry delay overruns deadline, advancing chain"
                            );
                            break;
                        }
                        RetryDecision::Retry { delay, retry } => {
                            retries = retry;
                            if pause_until(Instant::now() + delay, cancel).await.is_err() {
                                return exhausted(history, ExhaustionCause::Cancelled);
                            }
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            debug!(strategy = strategy.name(), reason, "advancing chain");
                            break;
                        }
                    },
                }
            }
        }

        info!(attempts = history.len(), retryable, "strategy chain exhausted");
        exhausted(history, ExhaustionCause::ChainExhausted { retryable })
    }

    /// Runs one attempt: permit, bounded strategy call, permit release.
    async fn run_attempt(
        &self,
        strategy: &dyn Strategy,
        request: &DownloadRequest,
        origin: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Step, Cancelled> {
        let permit: Option<Permit> = if strategy.is_network_bound() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = self.config.permit_timeout.min(remaining);
            let acquired = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Cancelled),
                acquired = self.governor.acquire(origin, wait) => acquired,
            };
            match acquired {
                Ok(permit) => Some(permit),
                Err(GovernorError::Timeout { .. }) => return Ok(Step::PermitUnavailable),
                Err(GovernorError::Cancelled { .. }) => return Err(Cancelled),
                Err(GovernorError::Closed) => {
                    return Ok(Step::Outcome(StrategyOutcome::Failed(
                        StrategyFailure::internal("rate governor closed").retryable(false),
                    )));
                }
            }
        } else {
            None
        };

        let attempt_deadline = deadline.min(Instant::now() + self.config.attempt_timeout);
        let attempt = strategy.attempt(
            request.url(),
            request.constraints(),
            request.auth(),
            cancel,
        );
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Cancelled),
            result = timeout_at(attempt_deadline, attempt) => match result {
                Ok(outcome) => outcome,
                Err(_) => StrategyOutcome::Failed(StrategyFailure::transient("attempt timed out")),
            },
        };
        drop(permit);
        Ok(Step::Outcome(outcome))
    }
}

fn exhausted(history: Vec<AttemptRecord>, cause: ExhaustionCause) -> Resolution {
    Resolution::Exhausted { history, cause }
}

/// Sleeps until `wake`, stopping early on cancellation.
async fn pause_until(wake: Instant, cancel: &CancellationToken) -> Result<(), Cancelled> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Cancelled),
        () = sleep_until(wake) => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::media::{AuthContext, MediaConstraints};
    use crate::strategy::StrategyTier;

    /// Strategy that replays a fixed script of outcomes, then repeats the last.
    struct Scripted {
        name: &'static str,
        tier: StrategyTier,
        script: Mutex<VecDeque<Option<FailureKind>>>,
        calls: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new(name: &'static str, tier: StrategyTier, script: Vec<Option<FailureKind>>) -> Self {
            Self {
                name,
                tier,
                script: Mutex::new(script.into()),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Strategy for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn tier(&self) -> StrategyTier {
            self.tier
        }

        fn applies_to(&self, _url: &str, _constraints: &MediaConstraints) -> bool {
            true
        }

        async fn attempt(
            &self,
            url: &str,
            _constraints: &MediaConstraints,
            _auth: Option<&AuthContext>,
            _cancel: &CancellationToken,
        ) -> StrategyOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    *script.front().unwrap()
                }
            };
            match next {
                None => StrategyOutcome::Resolved(MediaArtifact::progressive(url)),
                Some(kind) => StrategyOutcome::failed(kind, format!("scripted {kind}")),
            }
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            workers: 1,
            resolution_deadline: Duration::from_secs(60),
            retry_jitter: Duration::ZERO,
            ..EngineConfig::default()
        }
    }

    fn resolver(config: EngineConfig, strategies: Vec<Scripted>) -> Resolver {
        let config = Arc::new(config);
        let mut registry = StrategyRegistry::new(config.demotion_half_life);
        for strategy in strategies {
            registry.register(Box::new(strategy));
        }
        Resolver::new(
            Arc::new(registry),
            Arc::new(RateGovernor::new(&config)),
            config,
        )
    }

    fn kinds(history: &[AttemptRecord]) -> Vec<(String, Option<FailureKind>)> {
        history
            .iter()
            .map(|r| (r.strategy.clone(), r.failure_kind()))
            .collect()
    }

    // ==================== Decision Table Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_then_resolved() {
        let resolver = resolver(
            config(),
            vec![Scripted::new(
                "a",
                StrategyTier::General,
                vec![
                    Some(FailureKind::TransientNetwork),
                    Some(FailureKind::TransientNetwork),
                    None,
                ],
            )],
        );
        let resolution = resolver
            .resolve(&DownloadRequest::new("https://a.com/v"), &CancellationToken::new())
            .await;
        let Resolution::Resolved { strategy, history, .. } = resolution else {
            panic!("expected resolution");
        };
        assert_eq!(strategy, "a");
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].result, AttemptResult::Resolved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_cap_then_advance() {
        let resolver = resolver(
            config(),
            vec![
                Scripted::new("a", StrategyTier::Specialized, vec![Some(FailureKind::InternalError)]),
                Scripted::new("b", StrategyTier::General, vec![None]),
            ],
        );
        let resolution = resolver
            .resolve(&DownloadRequest::new("https://a.com/v"), &CancellationToken::new())
            .await;
        let history = resolution.history().to_vec();
        assert!(matches!(resolution, Resolution::Resolved { .. }));
        assert_eq!(
            kinds(&history),
            vec![
                ("a".to_string(), Some(FailureKind::InternalError)),
                ("a".to_string(), Some(FailureKind::InternalError)),
                ("a".to_string(), Some(FailureKind::InternalError)),
                ("b".to_string(), None),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_anti_bot_advances_without_retry() {
        let first = Scripted::new("a", StrategyTier::Specialized, vec![Some(FailureKind::AntiBotChallenge)]);
        let calls = Arc::clone(&first.calls);
        let resolver = resolver(
            config(),
            vec![first, Scripted::new("b", StrategyTier::General, vec![None])],
        );
        let resolution = resolver
            .resolve(&DownloadRequest::new("https://a.com/v"), &CancellationToken::new())
            .await;
        assert!(matches!(resolution, Resolution::Resolved { ref strategy, .. } if strategy == "b"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(resolver.governor.current_backoff("a.com") > Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_kinds_abort_chain() {
        for kind in [FailureKind::AuthRequired, FailureKind::NotFound, FailureKind::GeoBlocked] {
            let second = Scripted::new("b", StrategyTier::General, vec![None]);
            let calls = Arc::clone(&second.calls);
            let resolver = resolver(
                config(),
                vec![Scripted::new("a", StrategyTier::Specialized, vec![Some(kind)]), second],
            );
            let resolution = resolver
                .resolve(&DownloadRequest::new("https://a.com/v"), &CancellationToken::new())
                .await;
            let Resolution::Exhausted { history, cause } = resolution else {
                panic!("expected exhaustion for {kind}");
            };
            assert_eq!(cause, ExhaustionCause::Aborted(kind));
            assert_eq!(history.len(), 1);
            assert_eq!(calls.load(Ordering::SeqCst), 0, "{kind} must not fall through");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_chain_ends_at_sentinel() {
        let resolver = resolver(config(), Vec::new());
        let resolution = resolver
            .resolve(&DownloadRequest::new("https://a.com/v"), &CancellationToken::new())
            .await;
        let Resolution::Exhausted { history, cause } = resolution else {
            panic!("expected exhaustion");
        };
        assert_eq!(cause, ExhaustionCause::ChainExhausted { retryable: false });
        assert_eq!(
            kinds(&history),
            vec![("unsupported".to_string(), Some(FailureKind::UnsupportedContent))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_flag_reflects_real_failures() {
        let resolver = resolver(
            config(),
            vec![Scripted::new("a", StrategyTier::General, vec![Some(FailureKind::TransientNetwork)])],
        );
        let resolution = resolver
            .resolve(&DownloadRequest::new("https://a.com/v"), &CancellationToken::new())
            .await;
        let Resolution::Exhausted { cause, history } = resolution else {
            panic!("expected exhaustion");
        };
        assert_eq!(cause, ExhaustionCause::ChainExhausted { retryable: true });
        assert_eq!(history.len(), 4);
    }

    // ==================== Termination Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_permanent_rate_limit_ends_at_deadline() {
        let config = EngineConfig {
            resolution_deadline: Duration::from_secs(20),
            ..config()
        };
        let resolver = resolver(
            config,
            vec![Scripted::new("a", StrategyTier::General, vec![Some(FailureKind::RateLimited)])],
        );
        let start = Instant::now();
        let resolution = resolver
            .resolve(&DownloadRequest::new("https://a.com/v"), &CancellationToken::new())
            .await;
        let Resolution::Exhausted { cause, history } = resolution else {
            panic!("expected exhaustion");
        };
        assert_eq!(cause, ExhaustionCause::DeadlineElapsed);
        assert!(start.elapsed() <= Duration::from_secs(20));
        assert!(history.len() >= 2);
        assert!(
            history
                .iter()
                .all(|r| r.failure_kind() == Some(FailureKind::RateLimited))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let resolver = resolver(
            config(),
            vec![Scripted::new("a", StrategyTier::General, vec![None])],
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let resolution = resolver
            .resolve(&DownloadRequest::new("https://a.com/v"), &cancel)
            .await;
        assert!(matches!(
            resolution,
            Resolution::Exhausted {
                cause: ExhaustionCause::Cancelled,
                ..
            }
        ));
        assert_eq!(resolver.governor.in_flight("a.com"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_releases_permit() {
        let resolver = resolver(
            config(),
            vec![Scripted::new("a", StrategyTier::General, vec![None])],
        );
        let resolution = resolver
            .resolve(&DownloadRequest::new("https://a.com/v"), &CancellationToken::new())
            .await;
        assert!(matches!(resolution, Resolution::Resolved { .. }));
        assert_eq!(resolver.governor.in_flight("a.com"), 0);
    }
}
