//! Failure taxonomy shared by every stage of the engine.
//!
//! Every failure surfaced by a strategy, the fetch collaborator, or the
//! post-process collaborator is classified into exactly one [`FailureKind`].
//! The classification *is* the retry policy: [`FailureKind::policy`] is the
//! single table the resolver consults.
//!
//! # HTTP Status Classification
//!
//! | Status | Kind | Rationale |
//! |--------|------|-----------|
//! | 401, 407 | `AuthRequired` | Credentials missing |
//! | 403 + anti-bot marker | `AntiBotChallenge` | Challenge page / WAF block |
//! | 403 | `AuthRequired` | Forbidden without challenge marker |
//! | 404, 410 | `NotFound` | Content does not exist |
//! | 408 | `TransientNetwork` | Request timeout |
//! | 429 | `RateLimited` | Origin throttling |
//! | 451 | `GeoBlocked` | Unavailable for legal reasons |
//! | 5xx | `TransientNetwork` | Server may recover |
//! | other 4xx | `UnsupportedContent` | Method cannot handle this URL |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed acquisition or transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection reset, DNS hiccup, timeout, 5xx.
    TransientNetwork,
    /// Origin is throttling this client (HTTP 429 or equivalent).
    RateLimited,
    /// Anti-bot challenge, WAF block, or TLS fingerprint rejection.
    AntiBotChallenge,
    /// Content requires credentials the request does not carry.
    AuthRequired,
    /// Content does not exist (or no longer exists).
    NotFound,
    /// Content is not available from this client's region.
    GeoBlocked,
    /// The acquisition method cannot handle this URL or content.
    UnsupportedContent,
    /// Bug or unexpected condition inside a strategy or collaborator.
    InternalError,
}

/// What the resolver does after a failure of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Retry the same strategy with exponential backoff, up to the retry cap.
    RetrySameStrategy,
    /// Widen the origin's backoff window, then retry the same strategy.
    WaitForOrigin,
    /// Skip same-method retries and move to the next strategy.
    AdvanceChain,
    /// Stop the chain; no other strategy can succeed.
    Abort,
}

impl FailureKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::TransientNetwork,
        Self::RateLimited,
        Self::AntiBotChallenge,
        Self::AuthRequired,
        Self::NotFound,
        Self::GeoBlocked,
        Self::UnsupportedContent,
        Self::InternalError,
    ];

    /// Returns the stable string label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::RateLimited => "rate_limited",
            Self::AntiBotChallenge => "anti_bot_challenge",
            Self::AuthRequired => "auth_required",
            Self::NotFound => "not_found",
            Self::GeoBlocked => "geo_blocked",
            Self::UnsupportedContent => "unsupported_content",
            Self::InternalError => "internal_error",
        }
    }

    /// Returns the resolver decision for this kind.
    #[must_use]
    pub fn policy(self) -> FailurePolicy {
        match self {
            Self::TransientNetwork | Self::InternalError => FailurePolicy::RetrySameStrategy,
            Self::RateLimited => FailurePolicy::WaitForOrigin,
            Self::AntiBotChallenge | Self::UnsupportedContent => FailurePolicy::AdvanceChain,
            Self::AuthRequired | Self::NotFound | Self::GeoBlocked => FailurePolicy::Abort,
        }
    }

    /// Returns true when no strategy substitution or retry can help this request.
    #[must_use]
    pub fn is_terminal_for_request(self) -> bool {
        self.policy() == FailurePolicy::Abort
    }

    /// Returns true when the origin's backoff window should widen.
    #[must_use]
    pub fn penalizes_origin(self) -> bool {
        matches!(self, Self::RateLimited | Self::AntiBotChallenge)
    }

    /// Returns true when the failure says something about the acquisition
    /// method (rather than the content or the origin), so the method should
    /// be demoted for this origin.
    #[must_use]
    pub fn demotes_strategy(self) -> bool {
        matches!(
            self,
            Self::TransientNetwork
                | Self::InternalError
                | Self::AntiBotChallenge
                | Self::UnsupportedContent
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("invalid failure kind: {s}"))
    }
}

/// A classified failure, as reported by a strategy or collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct StrategyFailure {
    /// Classification driving the retry policy.
    pub kind: FailureKind,
    /// Whether the reporter believes a later attempt could succeed.
    pub retryable: bool,
    /// Human-readable detail for the attempt history.
    pub detail: String,
    /// Server-mandated wait, when the origin supplied one.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl StrategyFailure {
    /// Creates a failure with the kind's default retryability.
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            FailureKind::TransientNetwork | FailureKind::RateLimited | FailureKind::InternalError
        );
        Self {
            kind,
            retryable,
            detail: detail.into(),
            retry_after: None,
        }
    }

    /// Overrides the retryable flag.
    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attaches a server-mandated wait.
    #[must_use]
    pub fn with_retry_after(mut self, delay: Option<Duration>) -> Self {
        self.retry_after = delay;
        self
    }

    /// Shorthand for a `TransientNetwork` failure.
    pub fn transient(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientNetwork, detail)
    }

    /// Shorthand for an `InternalError` failure.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::InternalError, detail)
    }

    /// Shorthand for an `UnsupportedContent` failure.
    pub fn unsupported(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::UnsupportedContent, detail)
    }
}

/// Header names whose presence on a 403 marks an anti-bot block.
const ANTI_BOT_HEADERS: [&str; 3] = ["cf-mitigated", "x-amzn-waf-action", "x-datadome"];

/// Classifies an HTTP response status into a failure kind.
///
/// `headers` is consulted only for 403 responses, to tell an anti-bot
/// challenge apart from a plain authorization failure.
///
/// Explicit match arms are used for each status code for documentation purposes,
/// even though some return the same value.
#[must_use]
#[allow(clippy::match_same_arms)]
pub fn classify_http_status(status: u16, headers: Option<&reqwest::header::HeaderMap>) -> FailureKind {
    match status {
        401 => FailureKind::AuthRequired, // Unauthorized
        403 => {
            if headers.is_some_and(has_anti_bot_marker) {
                FailureKind::AntiBotChallenge
            } else {
                FailureKind::AuthRequired
            }
        }
        404 => FailureKind::NotFound,           // Not Found
        407 => FailureKind::AuthRequired,       // Proxy Authentication Required
        408 => FailureKind::TransientNetwork,   // Request Timeout
        410 => FailureKind::NotFound,           // Gone
        429 => FailureKind::RateLimited,        // Too Many Requests
        451 => FailureKind::GeoBlocked,         // Unavailable For Legal Reasons
        status if (400..500).contains(&status) => FailureKind::UnsupportedContent,
        status if (500..600).contains(&status) => FailureKind::TransientNetwork,
        _ => FailureKind::InternalError,
    }
}

/// Returns true when response headers carry a known anti-bot/WAF marker.
#[must_use]
pub fn has_anti_bot_marker(headers: &reqwest::header::HeaderMap) -> bool {
    if ANTI_BOT_HEADERS.iter().any(|name| headers.contains_key(*name)) {
        return true;
    }
    headers
        .get(reqwest::header::SERVER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|server| {
            let server = server.to_ascii_lowercase();
            server.contains("cloudflare") || server.contains("ddos-guard")
        })
}

/// Classifies a transport-level reqwest error.
///
/// TLS handshake rejections are reported as `AntiBotChallenge`: against
/// uncooperative hosts they are almost always fingerprint blocks.
#[must_use]
pub fn classify_transport_error(error: &reqwest::Error) -> FailureKind {
    if error.is_timeout() || error.is_connect() {
        return FailureKind::TransientNetwork;
    }
    let message = error.to_string().to_lowercase();
    if message.contains("certificate") || message.contains("handshake") || message.contains("tls")
    {
        FailureKind::AntiBotChallenge
    } else if error.is_builder() {
        FailureKind::InternalError
    } else {
        FailureKind::TransientNetwork
    }
}
