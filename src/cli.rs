//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use mediafetch_core::config::{DEFAULT_GLOBAL_CEILING, DEFAULT_PER_ORIGIN_CEILING, DEFAULT_WORKERS};
use mediafetch_core::{DownloadRequest, EngineConfig, MediaKind, QualityPreference};

/// Resilient media retrieval with strategy fallback.
///
/// Mediafetch resolves each URL through a chain of acquisition strategies,
/// backs off per origin when hosts push back, and skips anything already
/// recorded in the archive.
#[derive(Parser, Debug)]
#[command(name = "mediafetch")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to download (read from stdin when omitted)
    pub urls: Vec<String>,

    /// Media kind to request: video, audio, or both
    #[arg(short = 'k', long, default_value = "both")]
    pub kind: MediaKind,

    /// Quality/format preference, repeatable, in priority order (best, worst, 720p, mp4, codec:h264, 128k)
    #[arg(short = 'f', long = "format")]
    pub formats: Vec<QualityPreference>,

    /// Output directory for downloaded files
    #[arg(short = 'o', long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Maximum concurrent items (1-100)
    #[arg(short = 'c', long, default_value_t = DEFAULT_WORKERS as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: u8,

    /// Maximum concurrent requests per origin (1-32)
    #[arg(long, default_value_t = DEFAULT_PER_ORIGIN_CEILING as u8, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub per_origin: u8,

    /// Minimum delay between requests to the same origin in milliseconds (0 to disable, max 60000)
    #[arg(short = 'l', long, default_value_t = 0, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub rate_limit: u64,

    /// Archive file of completed downloads (`.db` for SQLite, anything else for a text file)
    #[arg(short = 'a', long)]
    pub archive: Option<PathBuf>,

    /// Download even if the archive already records the content
    #[arg(long)]
    pub force: bool,

    /// Overall resolution deadline per item in seconds
    #[arg(long, default_value_t = 180, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub deadline: u64,

    /// Timeout for a single strategy attempt in seconds
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub attempt_timeout: u64,

    /// Print the batch report as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Builds the engine configuration from the parsed flags.
    pub fn engine_config(&self) -> EngineConfig {
        let workers = usize::from(self.concurrency);
        let per_origin = usize::from(self.per_origin);
        EngineConfig {
            workers,
            global_ceiling: DEFAULT_GLOBAL_CEILING.max(workers).max(per_origin),
            per_origin_ceiling: per_origin,
            request_interval: Duration::from_millis(self.rate_limit),
            attempt_timeout: Duration::from_secs(self.attempt_timeout),
            resolution_deadline: Duration::from_secs(self.deadline),
            output_dir: self.output_dir.clone(),
            ..EngineConfig::default()
        }
    }

    /// Builds one request per URL with the shared kind and preferences.
    pub fn requests<'a>(&'a self, urls: &'a [String]) -> impl Iterator<Item = DownloadRequest> + 'a {
        urls.iter().map(|url| {
            DownloadRequest::new(url.as_str())
                .with_kind(self.kind)
                .with_preferences(self.formats.clone())
        })
    }
}

/// Extracts URLs from free-form input: one per line, blank lines and `#` comments skipped.
pub fn parse_urls(input: &str) -> Vec<String> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect()
}
