//! Canonical (origin, id) derivation for archive entries.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

/// Matches an 11-character YouTube video id.
#[allow(clippy::expect_used)]
static YOUTUBE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("YouTube id regex is valid") // Static pattern, safe to panic
});

/// Matches a numeric Vimeo video id.
#[allow(clippy::expect_used)]
static VIMEO_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4,}$").expect("Vimeo id regex is valid"));

/// Query keys that never identify content.
const TRACKING_KEYS: [&str; 4] = ["fbclid", "gclid", "si", "feature"];

/// Host prefixes that do not change which content a URL names.
const HOST_ALIAS_PREFIXES: [&str; 2] = ["www.", "m."];

/// A persisted (origin, canonical-id) pair marking completed content.
///
/// Derivation is a pure function of the URL, so the same logical content
/// maps to the same key across process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchiveKey {
    /// Normalized host.
    pub origin: String,
    /// Platform id when recognized, otherwise normalized path and query.
    pub canonical_id: String,
}

impl ArchiveKey {
    /// Creates a key from already-normalized parts.
    pub fn new(origin: impl Into<String>, canonical_id: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            canonical_id: canonical_id.into(),
        }
    }

    /// Derives the key for `url`.
    ///
    /// Unparseable input still yields a key (origin `unknown`, id the trimmed
    /// input) so every request can be checked against the ledger.
    ///
    /// # Examples
    ///
    /// ```
    /// use mediafetch_core::archive::ArchiveKey;
    ///
    /// let a = ArchiveKey::from_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42");
    /// let b = ArchiveKey::from_url("https://youtu.be/dQw4w9WgXcQ?si=abc");
    /// assert_eq!(a, b);
    /// assert_eq!(a.to_string(), "youtube.com dQw4w9WgXcQ");
    /// ```
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        let trimmed = url.trim();
        let Ok(parsed) = Url::parse(trimmed) else {
            return Self::new("unknown", trimmed);
        };
        let Some(host) = parsed.host_str() else {
            return Self::new("unknown", trimmed);
        };
        let origin = normalize_host(host);

        if let Some(id) = youtube_id(&origin, &parsed) {
            return Self::new("youtube.com", id);
        }
        if let Some(id) = vimeo_id(&origin, &parsed) {
            return Self::new("vimeo.com", id);
        }
        let canonical_id = normalized_path_and_query(&parsed);
        Self::new(origin, canonical_id)
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.origin, self.canonical_id)
    }
}

impl FromStr for ArchiveKey {
    type Err = String;

    /// Parses the `origin canonical-id` line format.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        match line.split_once(' ') {
            Some((origin, id)) if !origin.is_empty() && !id.trim().is_empty() => {
                Ok(Self::new(origin, id.trim()))
            }
            _ => Err(format!("malformed archive line: {line}")),
        }
    }
}

fn normalize_host(host: &str) -> String {
    let mut host = host.to_lowercase();
    for prefix in HOST_ALIAS_PREFIXES {
        if let Some(stripped) = host.strip_prefix(prefix) {
            host = stripped.to_string();
        }
    }
    if host == "youtu.be" || host == "youtube-nocookie.com" || host == "music.youtube.com" {
        host = "youtube.com".to_string();
    }
    host
}

fn youtube_id(origin: &str, url: &Url) -> Option<String> {
    if origin != "youtube.com" {
        return None;
    }
    if let Some((_, v)) = url.query_pairs().find(|(key, _)| key == "v")
        && YOUTUBE_ID.is_match(&v)
    {
        return Some(v.into_owned());
    }
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    let candidate = match segments.as_slice() {
        [id] => *id,
        ["shorts" | "embed" | "live" | "v", id, ..] => *id,
        _ => return None,
    };
    YOUTUBE_ID.is_match(candidate).then(|| candidate.to_string())
}

fn vimeo_id(origin: &str, url: &Url) -> Option<String> {
    if origin != "vimeo.com" && origin != "player.vimeo.com" {
        return None;
    }
    url.path_segments()?
        .find(|segment| VIMEO_ID.is_match(segment))
        .map(str::to_string)
}

fn normalized_path_and_query(url: &Url) -> String {
    let path = url.path().trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_key(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if pairs.is_empty() {
        return path.to_string();
    }
    pairs.sort();
    let query = pairs
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{path}?{query}")
}

fn is_tracking_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_KEYS.contains(&key.as_str())
}
