//! Streaming manifest strategy.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::failure::FailureKind;
use crate::media::{AuthContext, Locator, MediaArtifact, MediaConstraints, StreamProtocol};

use super::{Strategy, StrategyOutcome, StrategyTier};

/// Resolves HLS (`.m3u8`) and DASH (`.mpd`) URLs to a manifest locator.
///
/// Applicability is narrow: only URLs whose path ends in a manifest
/// extension. No request is made; expanding the manifest into segments is
/// the fetch collaborator's job.
#[derive(Debug, Default)]
pub struct ManifestStrategy;

impl ManifestStrategy {
    /// Creates the strategy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn protocol_for(url: &str) -> Option<StreamProtocol> {
        let parsed = url::Url::parse(url).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
        let path = parsed.path().to_ascii_lowercase();
        if path.ends_with(".m3u8") {
            Some(StreamProtocol::Hls)
        } else if path.ends_with(".mpd") {
            Some(StreamProtocol::Dash)
        } else {
            None
        }
    }
}

#[async_trait]
impl Strategy for ManifestStrategy {
    fn name(&self) -> &'static str {
        "manifest"
    }

    fn tier(&self) -> StrategyTier {
        StrategyTier::Specialized
    }

    fn applies_to(&self, url: &str, _constraints: &MediaConstraints) -> bool {
        Self::protocol_for(url).is_some()
    }

    fn is_network_bound(&self) -> bool {
        false
    }

    #[tracing::instrument(skip(self, constraints, _auth, _cancel), fields(strategy = "manifest"))]
    async fn attempt(
        &self,
        url: &str,
        constraints: &MediaConstraints,
        _auth: Option<&AuthContext>,
        _cancel: &CancellationToken,
    ) -> StrategyOutcome {
        let Some(protocol) = Self::protocol_for(url) else {
            return StrategyOutcome::failed(FailureKind::UnsupportedContent, "not a manifest URL");
        };
        let container = constraints.preferred_container().unwrap_or(match protocol {
            StreamProtocol::Hls => "ts",
            StreamProtocol::Dash => "mp4",
        });
        let artifact = MediaArtifact::from_locator(Locator::Manifest {
            url: url.to_string(),
            protocol,
        })
        .with_container(container);
        StrategyOutcome::Resolved(artifact)
    }
}
