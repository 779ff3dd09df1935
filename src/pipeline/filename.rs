//! Output filename selection for fetched media.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs::{File, OpenOptions};
use tracing::debug;
use url::Url;

/// Highest numeric suffix tried before falling back to a timestamp.
const MAX_COLLISION_SUFFIX: usize = 1000;

/// Replaces path separators, reserved characters, and control characters.
///
/// A name that would act as a dot segment (`.`, `..`) has its dots replaced
/// too, so the result always names a file directly inside its directory.
pub(crate) fn sanitize_filename(name: &str) -> String {
    const RESERVED: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if RESERVED.contains(&c) || c.is_control() { '_' } else { c })
        .collect();

    match cleaned.as_str() {
        "" => "_".to_string(),
        _ if names_plain_file(&cleaned) => cleaned,
        _ => cleaned.replace('.', "_"),
    }
}

fn names_plain_file(name: &str) -> bool {
    Path::new(name)
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
}

/// Extracts the filename from a `Content-Disposition` header value.
///
/// The RFC 5987 `filename*=charset''value` parameter wins over a plain
/// `filename=` parameter, wherever each appears.
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in header.split(';').skip(1) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                extended = value
                    .split_once("''")
                    .and_then(|(_, encoded)| urlencoding::decode(encoded).ok())
                    .map(|decoded| decoded.into_owned());
            }
            "filename" => {
                let unquoted = value.trim_matches('"');
                plain = (!unquoted.is_empty()).then(|| unquoted.to_string());
            }
            _ => {}
        }
    }
    extended.or(plain)
}

/// Last non-empty URL path segment, percent-decoded and sanitized.
pub(crate) fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.rev().find(|s| !s.is_empty())?;
    let decoded = urlencoding::decode(last).map_or_else(
        |error| {
            debug!(segment = %last, error = %error, "undecodable path segment, using it raw");
            last.to_string()
        },
        |decoded| decoded.into_owned(),
    );
    Some(sanitize_filename(&decoded))
}

/// Appends `.container` to a name that carries no extension of its own.
pub(crate) fn with_container_extension(name: String, container: Option<&str>) -> String {
    match container {
        Some(ext) if Path::new(&name).extension().is_none() => format!("{name}.{ext}"),
        _ => name,
    }
}

/// Timestamped name for media whose URL carries no usable segment.
pub(crate) fn fallback_filename(container: Option<&str>) -> String {
    format!("media_{}.{}", unix_secs(), container.unwrap_or("bin"))
}

/// Creates a file under `dir` at a path nothing else holds.
///
/// `clip.mp4` becomes `clip_1.mp4`, `clip_2.mp4`, ... on collision. Each
/// candidate is opened with `create_new`, so concurrent callers asking for
/// the same name always get distinct files and never truncate each other.
pub(crate) async fn create_unique_file(dir: &Path, filename: &str) -> io::Result<(PathBuf, File)> {
    let mut name = sanitize_filename(filename);
    if name.trim_matches('_').is_empty() {
        name = "media.bin".to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name.as_str(), ""),
    };

    for suffix in 0..=MAX_COLLISION_SUFFIX {
        let candidate = match suffix {
            0 => dir.join(&name),
            MAX_COLLISION_SUFFIX => dir.join(format!("{stem}_{}{ext}", unix_secs())),
            n => dir.join(format!("{stem}_{n}{ext}")),
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((candidate, file)),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = %candidate.display(), "output path taken");
            }
            Err(error) => return Err(error),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free output name for {name}"),
    ))
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
