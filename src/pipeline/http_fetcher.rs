//! Progressive HTTP fetcher.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_DISPOSITION, RETRY_AFTER};
use reqwest::{Client, Response};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::failure::{
    FailureKind, StrategyFailure, classify_http_status, classify_transport_error,
};
use crate::governor::parse_retry_after;
use crate::http::apply_auth;
use crate::media::{DownloadRequest, Locator, MediaArtifact};

use super::filename::{
    create_unique_file, fallback_filename, filename_from_url, parse_content_disposition,
    sanitize_filename, with_container_extension,
};
use super::{Fetcher, TransferProgress};

/// Streams progressive locators to disk over HTTP.
///
/// Manifest and segment locators are rejected with `UnsupportedContent`;
/// expanding them needs a segment-aware fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Creates a fetcher using the shared client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn send(
        &self,
        url: &str,
        request: &DownloadRequest,
        cancel: &CancellationToken,
    ) -> Result<Response, StrategyFailure> {
        let builder = apply_auth(self.client.get(url), request.auth());
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(cancelled()),
            result = builder.send() => result.map_err(|error| {
                StrategyFailure::new(classify_transport_error(&error), error.to_string())
            })?,
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let headers = response.headers();
        let kind = classify_http_status(status.as_u16(), Some(headers));
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        Err(StrategyFailure::new(kind, format!("fetch returned HTTP {}", status.as_u16()))
            .with_retry_after(retry_after))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, artifact, request, progress, cancel), fields(url = %request.url()))]
    async fn fetch(
        &self,
        artifact: &MediaArtifact,
        request: &DownloadRequest,
        dest_dir: &Path,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, StrategyFailure> {
        let Locator::Progressive { url } = &artifact.locator else {
            return Err(StrategyFailure::unsupported(
                "locator needs a segment-aware fetcher",
            ));
        };

        let response = self.send(url, request, cancel).await?;

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|error| io_failure(dest_dir, &error))?;
        let name = output_filename(request, &response, url, artifact.container.as_deref());
        let (file_path, file) = create_unique_file(dest_dir, &name)
            .await
            .map_err(|error| io_failure(dest_dir, &error))?;
        debug!(path = %file_path.display(), "created output file");

        let expected = response.content_length().or(artifact.expected_size);
        progress.reset();
        progress.set_total(expected);

        let result = stream_to_file(file, response, &file_path, progress, cancel).await;

        let bytes_written = match result {
            Ok(bytes) => bytes,
            Err(failure) => {
                debug!(path = %file_path.display(), "cleaning up partial file after error");
                let _ = tokio::fs::remove_file(&file_path).await;
                return Err(failure);
            }
        };

        if let Some(expected) = expected
            && expected != bytes_written
        {
            let _ = tokio::fs::remove_file(&file_path).await;
            return Err(StrategyFailure::transient(format!(
                "transfer truncated: expected {expected} bytes, got {bytes_written}"
            )));
        }

        info!(path = %file_path.display(), bytes = bytes_written, "fetch complete");
        Ok(file_path)
    }
}

/// Streams the response body to `file`, returning bytes written.
async fn stream_to_file(
    file: File,
    response: Response,
    file_path: &Path,
    progress: &TransferProgress,
    cancel: &CancellationToken,
) -> Result<u64, StrategyFailure> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return Err(cancelled()),
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(|error| {
            StrategyFailure::new(classify_transport_error(&error), error.to_string())
        })?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|error| io_failure(file_path, &error))?;
        bytes_written += chunk.len() as u64;
        progress.advance(chunk.len() as u64);
    }

    writer
        .flush()
        .await
        .map_err(|error| io_failure(file_path, &error))?;
    Ok(bytes_written)
}

/// Output hint, else `Content-Disposition`, else URL segment (given the
/// container's extension when it has none), else a timestamped name.
fn output_filename(
    request: &DownloadRequest,
    response: &Response,
    url: &str,
    container: Option<&str>,
) -> String {
    if let Some(name) = request
        .output_hint()
        .and_then(Path::file_name)
        .and_then(|name| name.to_str())
    {
        return sanitize_filename(name);
    }
    if let Some(name) = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_content_disposition)
    {
        return sanitize_filename(&name);
    }
    filename_from_url(url).map_or_else(
        || fallback_filename(container),
        |name| with_container_extension(name, container),
    )
}

fn io_failure(path: &Path, error: &std::io::Error) -> StrategyFailure {
    StrategyFailure::new(
        FailureKind::InternalError,
        format!("{}: {error}", path.display()),
    )
    .retryable(false)
}

fn cancelled() -> StrategyFailure {
    StrategyFailure::internal("fetch cancelled").retryable(false)
}
