//! Generic HTTP probe strategy.
//!
//! Issues a GET against the URL (with the request's credentials) and reads
//! only the response head. A media `Content-Type` resolves to a progressive
//! locator; a manifest `Content-Type` resolves to a manifest locator; an HTML
//! page means this method cannot extract the media.

use std::time::SystemTime;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, ETAG, EXPIRES, HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::failure::{
    FailureKind, StrategyFailure, classify_http_status, classify_transport_error,
    has_anti_bot_marker,
};
use crate::governor::parse_retry_after;
use crate::http::apply_auth;
use crate::media::{
    AuthContext, Freshness, Locator, MediaArtifact, MediaConstraints, StreamProtocol,
};

use super::{Strategy, StrategyOutcome, StrategyTier};

/// Probes a URL over HTTP and classifies what comes back.
#[derive(Debug, Clone)]
pub struct HttpProbeStrategy {
    client: Client,
}

impl HttpProbeStrategy {
    /// Creates a probe using the shared client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn classify_response(response: &Response, constraints: &MediaConstraints) -> StrategyOutcome {
        let status = response.status();
        let headers = response.headers();

        if !status.is_success() {
            let kind = classify_http_status(status.as_u16(), Some(headers));
            let retry_after = headers
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            return StrategyOutcome::Failed(
                StrategyFailure::new(kind, format!("HTTP {}", status.as_u16()))
                    .with_retry_after(retry_after),
            );
        }

        let mime = content_type(headers);
        if let Some(protocol) = manifest_protocol(&mime) {
            return StrategyOutcome::Resolved(
                MediaArtifact::from_locator(Locator::Manifest {
                    url: response.url().to_string(),
                    protocol,
                })
                .with_freshness(freshness(headers)),
            );
        }

        if mime.starts_with("text/html") {
            if has_anti_bot_marker(headers) {
                return StrategyOutcome::failed(
                    FailureKind::AntiBotChallenge,
                    "challenge page served instead of media",
                );
            }
            return StrategyOutcome::failed(
                FailureKind::UnsupportedContent,
                "page is HTML, not a media resource",
            );
        }

        if !constraints.kind.accepts_mime(&mime) {
            return StrategyOutcome::failed(
                FailureKind::UnsupportedContent,
                format!("content type {mime} does not match requested {}", constraints.kind),
            );
        }

        let url = response.url().to_string();
        let container = container_for(&mime, &url);
        let mut artifact = MediaArtifact::progressive(url)
            .with_expected_size(response.content_length())
            .with_freshness(freshness(headers));
        artifact.codec = Some(mime);
        if let Some(container) = container {
            artifact = artifact.with_container(container);
        }
        StrategyOutcome::Resolved(artifact)
    }
}

#[async_trait]
impl Strategy for HttpProbeStrategy {
    fn name(&self) -> &'static str {
        "http_probe"
    }

    fn tier(&self) -> StrategyTier {
        StrategyTier::General
    }

    fn applies_to(&self, url: &str, _constraints: &MediaConstraints) -> bool {
        url::Url::parse(url).is_ok_and(|parsed| matches!(parsed.scheme(), "http" | "https"))
    }

    #[tracing::instrument(skip(self, constraints, auth, cancel), fields(strategy = "http_probe"))]
    async fn attempt(
        &self,
        url: &str,
        constraints: &MediaConstraints,
        auth: Option<&AuthContext>,
        cancel: &CancellationToken,
    ) -> StrategyOutcome {
        let request = apply_auth(self.client.get(url), auth);
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return StrategyOutcome::Failed(
                    StrategyFailure::transient("cancelled before response").retryable(false),
                );
            }
            result = request.send() => result,
        };

        match response {
            Ok(response) => {
                debug!(status = response.status().as_u16(), "probe response");
                Self::classify_response(&response, constraints)
            }
            Err(error) => {
                let kind = classify_transport_error(&error);
                debug!(error = %error, kind = %kind, "probe transport failure");
                StrategyOutcome::failed(kind, error.to_string())
            }
        }
    }
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map_or_else(
            || "application/octet-stream".to_string(),
            |mime| mime.trim().to_ascii_lowercase(),
        )
}

fn manifest_protocol(mime: &str) -> Option<StreamProtocol> {
    match mime {
        "application/vnd.apple.mpegurl" | "application/x-mpegurl" | "audio/mpegurl" => {
            Some(StreamProtocol::Hls)
        }
        "application/dash+xml" => Some(StreamProtocol::Dash),
        _ => None,
    }
}

fn freshness(headers: &HeaderMap) -> Freshness {
    let etag = headers
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let expires_at: Option<SystemTime> = headers
        .get(EXPIRES)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok());
    Freshness { etag, expires_at }
}

/// Maps a media MIME type (or, failing that, the URL extension) to a container name.
fn container_for(mime: &str, url: &str) -> Option<String> {
    let from_mime = match mime {
        "video/mp4" | "audio/mp4" => Some("mp4"),
        "audio/x-m4a" | "audio/m4a" => Some("m4a"),
        "video/webm" | "audio/webm" => Some("webm"),
        "video/x-matroska" => Some("mkv"),
        "video/quicktime" => Some("mov"),
        "audio/mpeg" => Some("mp3"),
        "audio/ogg" | "video/ogg" => Some("ogg"),
        "video/mp2t" => Some("ts"),
        _ => None,
    };
    if let Some(container) = from_mime {
        return Some(container.to_string());
    }
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let (_, extension) = last.rsplit_once('.')?;
    let extension = extension.to_ascii_lowercase();
    (!extension.is_empty() && extension.len() <= 5 && extension.chars().all(|c| c.is_ascii_alphanumeric()))
        .then_some(extension)
}
