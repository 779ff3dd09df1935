//! Origin keys and server-mandated delays.

use std::time::{Duration, SystemTime};

use tracing::{debug, instrument, warn};

/// Longest server-mandated wait the governor will honor.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Extracts the origin partition key from a URL.
///
/// The key is the lowercased host plus the port when it is not the scheme's
/// default. Returns `"unknown"` for malformed URLs, so every request is still
/// governed even if the URL cannot be parsed.
///
/// # Examples
///
/// ```
/// use mediafetch_core::governor::extract_origin;
///
/// assert_eq!(extract_origin("https://Example.COM/watch?v=1"), "example.com");
/// assert_eq!(extract_origin("https://example.com:443/x"), "example.com");
/// assert_eq!(extract_origin("http://localhost:8080/x"), "localhost:8080");
/// assert_eq!(extract_origin("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_origin(url: &str) -> String {
    let Ok(parsed) = url::Url::parse(url) else {
        return "unknown".to_string();
    };
    let Some(host) = parsed.host_str() else {
        return "unknown".to_string();
    };
    let host = host.to_lowercase();
    match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}

/// Converts a `Retry-After` value into the wait it asks for.
///
/// Accepts delta-seconds (`120`) or an HTTP-date. Dates in the past mean
/// "now". Anything longer than an hour is capped; unparseable or negative
/// values yield `None`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use mediafetch_core::governor::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("99999"), Some(Duration::from_secs(3600)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let value = header_value.trim();
    let requested = if value.bytes().all(|b| b.is_ascii_digit()) && !value.is_empty() {
        Duration::from_secs(value.parse().ok()?)
    } else {
        let at = httpdate::parse_http_date(value).ok()?;
        at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO)
    };

    if requested > MAX_RETRY_AFTER {
        warn!(
            requested_secs = requested.as_secs(),
            "server asked for an excessive wait, capping"
        );
        return Some(MAX_RETRY_AFTER);
    }
    debug!(wait_ms = requested.as_millis(), "parsed Retry-After");
    Some(requested)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== extract_origin Tests ====================

    #[test]
    fn test_extract_origin_lowercases_host() {
        assert_eq!(extract_origin("https://Example.COM/Path"), "example.com");
    }

    #[test]
    fn test_extract_origin_keeps_non_default_port() {
        assert_eq!(
            extract_origin("http://127.0.0.1:38211/media.mp4"),
            "127.0.0.1:38211"
        );
    }

    #[test]
    fn test_extract_origin_drops_default_port() {
        assert_eq!(extract_origin("http://example.com:80/a"), "example.com");
    }

    #[test]
    fn test_extract_origin_subdomains_are_distinct() {
        assert_ne!(
            extract_origin("https://cdn.example.com/a"),
            extract_origin("https://example.com/a")
        );
    }

    #[test]
    fn test_extract_origin_malformed() {
        assert_eq!(extract_origin(""), "unknown");
        assert_eq!(extract_origin("not a valid url"), "unknown");
        assert_eq!(extract_origin("data:text/plain,hi"), "unknown");
    }

    // ==================== parse_retry_after Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("  7  "), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_parse_retry_after_negative() {
        assert_eq!(parse_retry_after("-5"), None);
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("7200"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_retry_after_http_date_past() {
        let past_date = "Wed, 01 Jan 2020 00:00:00 GMT";
        assert_eq!(parse_retry_after(past_date), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_http_date_future() {
        let future_time = std::time::SystemTime::now() + Duration::from_secs(60);
        let future_date = httpdate::fmt_http_date(future_time);

        let duration = parse_retry_after(&future_date).unwrap();
        assert!(
            duration >= Duration::from_secs(55) && duration <= Duration::from_secs(65),
            "Duration should be ~60s, got {duration:?}"
        );
    }
}
