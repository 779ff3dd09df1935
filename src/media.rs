//! Request and artifact value types.
//!
//! A [`DownloadRequest`] is what a caller asks for; a [`MediaArtifact`] is
//! what a successful resolution produces. Requests are immutable once built.
//! Artifacts are owned by exactly one queue item and are intentionally not
//! `Clone`, so an artifact can never be handed to two different requests.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Which media streams the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Video only (or muxed video when that is all the origin offers).
    Video,
    /// Audio only.
    Audio,
    /// Video with audio.
    #[default]
    Both,
}

impl MediaKind {
    /// Returns the stable string label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Both => "both",
        }
    }

    /// Returns true if a MIME type is acceptable for this kind.
    #[must_use]
    pub fn accepts_mime(self, mime: &str) -> bool {
        let mime = mime.to_ascii_lowercase();
        let is_video = mime.starts_with("video/");
        let is_audio = mime.starts_with("audio/");
        match self {
            Self::Audio => is_audio || is_video,
            Self::Video | Self::Both => is_video || mime == "application/octet-stream",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "both" | "av" => Ok(Self::Both),
            other => Err(format!("invalid media kind: {other} (expected video, audio, or both)")),
        }
    }
}

/// One entry of an ordered quality/format preference list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreference {
    /// Highest quality available.
    Best,
    /// Smallest/lowest quality available.
    Worst,
    /// Video no taller than this many pixels.
    MaxHeight(u32),
    /// Preferred container (`mp4`, `webm`, `m4a`, ...).
    Container(String),
    /// Preferred codec (`h264`, `av1`, `opus`, ...).
    Codec(String),
    /// Audio bitrate ceiling in kbit/s.
    MaxBitrateKbps(u32),
}

impl FromStr for QualityPreference {
    type Err = String;

    /// Parses `best`, `worst`, `720p`, `128k`, `codec:h264`, or a bare
    /// container name such as `mp4`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        if value.is_empty() {
            return Err("empty quality preference".to_string());
        }
        match value.as_str() {
            "best" => return Ok(Self::Best),
            "worst" => return Ok(Self::Worst),
            _ => {}
        }
        if let Some(codec) = value.strip_prefix("codec:") {
            return if codec.is_empty() {
                Err("codec preference needs a codec name".to_string())
            } else {
                Ok(Self::Codec(codec.to_string()))
            };
        }
        if let Some(height) = value.strip_suffix('p')
            && let Ok(height) = height.parse::<u32>()
        {
            return Ok(Self::MaxHeight(height));
        }
        if let Some(bitrate) = value.strip_suffix('k')
            && let Ok(bitrate) = bitrate.parse::<u32>()
        {
            return Ok(Self::MaxBitrateKbps(bitrate));
        }
        if value.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Ok(Self::Container(value));
        }
        Err(format!("invalid quality preference: {s}"))
    }
}

/// Media kind plus ordered format preferences.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Streams wanted.
    pub kind: MediaKind,
    /// Preferences, most preferred first.
    pub preferences: Vec<QualityPreference>,
}

impl MediaConstraints {
    /// Returns the first container preference, if any.
    #[must_use]
    pub fn preferred_container(&self) -> Option<&str> {
        self.preferences.iter().find_map(|p| match p {
            QualityPreference::Container(c) => Some(c.as_str()),
            _ => None,
        })
    }
}

/// Credentials or session context forwarded to strategies.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthContext {
    /// Raw `Cookie` header value.
    Cookie(String),
    /// Bearer token for an `Authorization` header.
    Bearer(String),
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cookie(_) => f.write_str("Cookie(<redacted>)"),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

/// An immutable request to retrieve one piece of media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    url: String,
    constraints: MediaConstraints,
    output_hint: Option<PathBuf>,
    auth: Option<AuthContext>,
}

impl DownloadRequest {
    /// Creates a request for `url` with default constraints.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            constraints: MediaConstraints::default(),
            output_hint: None,
            auth: None,
        }
    }

    /// Sets the wanted media kind.
    #[must_use]
    pub fn with_kind(mut self, kind: MediaKind) -> Self {
        self.constraints.kind = kind;
        self
    }

    /// Sets the ordered preference list.
    #[must_use]
    pub fn with_preferences(mut self, preferences: Vec<QualityPreference>) -> Self {
        self.constraints.preferences = preferences;
        self
    }

    /// Sets the output destination hint (a filename, or a path relative to the output dir).
    #[must_use]
    pub fn with_output_hint(mut self, hint: impl Into<PathBuf>) -> Self {
        self.output_hint = Some(hint.into());
        self
    }

    /// Attaches credentials.
    #[must_use]
    pub fn with_auth(mut self, auth: AuthContext) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Source URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Kind and preferences.
    #[must_use]
    pub fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    /// Output destination hint, when the caller gave one.
    #[must_use]
    pub fn output_hint(&self) -> Option<&Path> {
        self.output_hint.as_deref()
    }

    /// Auth context, when the caller gave one.
    #[must_use]
    pub fn auth(&self) -> Option<&AuthContext> {
        self.auth.as_ref()
    }
}

/// Streaming protocol of a manifest locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamProtocol {
    /// HTTP Live Streaming (`.m3u8`).
    Hls,
    /// MPEG-DASH (`.mpd`).
    Dash,
}

/// Where the bytes of a resolved artifact can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// A single progressive download URL.
    Progressive {
        /// Direct media URL.
        url: String,
    },
    /// A streaming manifest to be expanded by a segment-aware fetcher.
    Manifest {
        /// Manifest URL.
        url: String,
        /// Manifest protocol.
        protocol: StreamProtocol,
    },
    /// Pre-expanded segment URLs, in playback order.
    Segments {
        /// Segment URLs.
        urls: Vec<String>,
    },
}

impl Locator {
    /// Returns the URL whose origin the fetch will hit first.
    #[must_use]
    pub fn primary_url(&self) -> Option<&str> {
        match self {
            Self::Progressive { url } | Self::Manifest { url, .. } => Some(url),
            Self::Segments { urls } => urls.first().map(String::as_str),
        }
    }
}

/// Entity tag and expiry used to decide re-resolution on resume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Freshness {
    /// Entity tag reported by the origin.
    pub etag: Option<String>,
    /// Wall-clock expiry of the signed locator.
    pub expires_at: Option<SystemTime>,
}

impl Freshness {
    /// Returns true once the locator has expired.
    #[must_use]
    pub fn is_stale(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

/// A resolved, fetchable description of the media (not the bytes themselves).
#[derive(Debug, PartialEq, Eq)]
pub struct MediaArtifact {
    /// Fetchable locator.
    pub locator: Locator,
    /// Declared container (`mp4`, `webm`, ...).
    pub container: Option<String>,
    /// Declared codec or MIME type.
    pub codec: Option<String>,
    /// Expected size in bytes, when the origin reports one.
    pub expected_size: Option<u64>,
    /// Freshness token.
    pub freshness: Freshness,
}

impl MediaArtifact {
    /// Creates an artifact for a single progressive URL.
    pub fn progressive(url: impl Into<String>) -> Self {
        Self::from_locator(Locator::Progressive { url: url.into() })
    }

    /// Creates an artifact from any locator.
    #[must_use]
    pub fn from_locator(locator: Locator) -> Self {
        Self {
            locator,
            container: None,
            codec: None,
            expected_size: None,
            freshness: Freshness::default(),
        }
    }

    /// Sets the declared container.
    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Sets the expected size.
    #[must_use]
    pub fn with_expected_size(mut self, size: Option<u64>) -> Self {
        self.expected_size = size;
        self
    }

    /// Sets the freshness token.
    #[must_use]
    pub fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }

    /// Returns true once the artifact's locator has expired.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.freshness.is_stale(SystemTime::now())
    }
}
