//! Scripted strategies and fetchers with call counters.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mediafetch_core::{
    AuthContext, DownloadRequest, FailureKind, Fetcher, MediaArtifact, MediaConstraints,
    Strategy, StrategyFailure, StrategyOutcome, StrategyTier, TransferProgress,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Tracks how many calls run at once and the highest level seen.
#[derive(Debug, Default)]
pub struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enter(self: &Arc<Self>) -> GaugeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        GaugeGuard(Arc::clone(self))
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

pub struct GaugeGuard(Arc<Gauge>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One scripted strategy response.
#[derive(Debug, Clone)]
pub enum Script {
    /// Resolve to a progressive artifact at this URL.
    Resolve(String),
    /// Resolve to an artifact whose freshness window has already closed.
    ResolveStale(String),
    /// Fail with this kind.
    Fail(FailureKind),
    /// Fail with `RateLimited` and a server-supplied wait.
    RateLimitedFor(Duration),
    /// Block until cancelled.
    Hang,
}

/// Strategy that replays a script, then repeats a fallback response.
pub struct ScriptedStrategy {
    name: String,
    tier: StrategyTier,
    network_bound: bool,
    script: Mutex<VecDeque<Script>>,
    fallback: Script,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    gauge: Option<Arc<Gauge>>,
    poisoned: Option<(String, FailureKind)>,
}

impl ScriptedStrategy {
    pub fn new(name: &str, tier: StrategyTier) -> Self {
        Self {
            name: name.to_string(),
            tier,
            network_bound: true,
            script: Mutex::new(VecDeque::new()),
            fallback: Script::Fail(FailureKind::UnsupportedContent),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            gauge: None,
            poisoned: None,
        }
    }

    /// Always fails URLs containing `pattern` with `kind`, bypassing the script.
    pub fn failing_urls_containing(mut self, pattern: &str, kind: FailureKind) -> Self {
        self.poisoned = Some((pattern.to_string(), kind));
        self
    }

    /// Queues one response.
    pub fn then(self, step: Script) -> Self {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(step);
        self
    }

    /// Response once the script is used up.
    pub fn otherwise(mut self, step: Script) -> Self {
        self.fallback = step;
        self
    }

    /// Sleeps this long inside every attempt.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<Gauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn offline(mut self) -> Self {
        self.network_bound = false;
        self
    }

    /// Shared call counter; grab it before boxing the strategy.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    fn next_step(&self) -> Script {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Strategy for ScriptedStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> StrategyTier {
        self.tier
    }

    fn applies_to(&self, _url: &str, _constraints: &MediaConstraints) -> bool {
        true
    }

    fn is_network_bound(&self) -> bool {
        self.network_bound
    }

    async fn attempt(
        &self,
        url: &str,
        _constraints: &MediaConstraints,
        _auth: Option<&AuthContext>,
        cancel: &CancellationToken,
    ) -> StrategyOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _active = self.gauge.as_ref().map(Gauge::enter);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some((pattern, kind)) = &self.poisoned
            && url.contains(pattern.as_str())
        {
            return StrategyOutcome::failed(*kind, format!("scripted {kind} for {url}"));
        }
        match self.next_step() {
            Script::Resolve(url) => StrategyOutcome::Resolved(MediaArtifact::progressive(url)),
            Script::ResolveStale(url) => {
                let mut artifact = MediaArtifact::progressive(url);
                artifact.freshness.expires_at =
                    Some(std::time::SystemTime::now() - Duration::from_secs(60));
                StrategyOutcome::Resolved(artifact)
            }
            Script::Fail(kind) => StrategyOutcome::failed(kind, format!("scripted {kind}")),
            Script::RateLimitedFor(wait) => StrategyOutcome::Failed(
                StrategyFailure::new(FailureKind::RateLimited, "scripted 429")
                    .with_retry_after(Some(wait)),
            ),
            Script::Hang => {
                cancel.cancelled().await;
                StrategyOutcome::Failed(StrategyFailure::internal("cancelled").retryable(false))
            }
        }
    }
}

/// One scripted fetch response.
#[derive(Debug, Clone, Copy)]
pub enum FetchScript {
    /// Report success with a synthetic output path.
    Ok,
    /// Fail with this kind.
    Fail(FailureKind),
    /// Report partial progress, then block until cancelled.
    Hang,
}

/// Fetcher that never touches the network.
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<FetchScript>>,
    fallback: FetchScript,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    gauge: Option<Arc<Gauge>>,
    entered: Arc<Notify>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: FetchScript::Ok,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            gauge: None,
            entered: Arc::new(Notify::new()),
        }
    }

    pub fn then(self, step: FetchScript) -> Self {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(step);
        self
    }

    pub fn otherwise(mut self, step: FetchScript) -> Self {
        self.fallback = step;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<Gauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    /// Notified each time a fetch starts.
    pub fn entered(&self) -> Arc<Notify> {
        Arc::clone(&self.entered)
    }

    fn next_step(&self) -> FetchScript {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        _artifact: &MediaArtifact,
        _request: &DownloadRequest,
        dest_dir: &Path,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, StrategyFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = self.gauge.as_ref().map(Gauge::enter);
        self.entered.notify_one();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.next_step() {
            FetchScript::Ok => {
                progress.set_total(Some(1024));
                progress.advance(1024);
                Ok(dest_dir.join(format!("fetched_{call}.bin")))
            }
            FetchScript::Fail(kind) => Err(StrategyFailure::new(kind, format!("scripted {kind}"))),
            FetchScript::Hang => {
                progress.set_total(Some(4096));
                progress.advance(512);
                cancel.cancelled().await;
                Err(StrategyFailure::internal("fetch cancelled").retryable(false))
            }
        }
    }
}
