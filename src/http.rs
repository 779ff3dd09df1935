//! Shared HTTP client construction for the bundled strategy and fetcher.
//!
//! One client is built at startup and cloned into every component that talks
//! HTTP, so connection pooling and cookies are shared across probes and
//! transfers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, COOKIE, HeaderValue};
use reqwest::{Client, ClientBuilder, Proxy, RequestBuilder};
use thiserror::Error;
use tracing::warn;

use crate::media::AuthContext;

/// Connect timeout for all engine HTTP traffic.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/mediafetch";

/// Errors from HTTP client construction.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// reqwest refused the configuration.
    #[error("HTTP client construction failed: {0}")]
    Build(#[from] reqwest::Error),

    /// Client construction panicked, even with system proxy lookup disabled.
    #[error("HTTP client construction panicked while initializing networking")]
    Panicked,
}

/// Default User-Agent for engine requests.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("mediafetch/{version} (+{PROJECT_UA_URL})")
}

/// Builds the shared HTTP client.
///
/// `read_timeout` bounds idle time between reads, not the whole transfer.
///
/// # Errors
///
/// Returns [`HttpClientError`] when the client cannot be constructed.
pub fn build_http_client(read_timeout: Duration) -> Result<Client, HttpClientError> {
    match try_build_client(read_timeout, false) {
        Ok(client) => Ok(client),
        Err(BuildClientFailure::Panic) => {
            // Some sandboxed environments panic when querying system proxy
            // settings; fall back to environment proxies only.
            warn!("HTTP client hit system proxy panic; using env-proxy fallback builder");
            try_build_client(read_timeout, true).map_err(|failure| match failure {
                BuildClientFailure::Panic => HttpClientError::Panicked,
                BuildClientFailure::Build(error) => HttpClientError::Build(error),
            })
        }
        Err(BuildClientFailure::Build(error)) => Err(HttpClientError::Build(error)),
    }
}

enum BuildClientFailure {
    Panic,
    Build(reqwest::Error),
}

fn try_build_client(
    read_timeout: Duration,
    disable_system_proxy_lookup: bool,
) -> Result<Client, BuildClientFailure> {
    catch_unwind(AssertUnwindSafe(move || {
        let mut builder = base_builder(read_timeout);
        if disable_system_proxy_lookup {
            builder = apply_env_proxy_fallback(builder.no_proxy());
        }
        builder.build().map_err(BuildClientFailure::Build)
    }))
    .map_err(|_| BuildClientFailure::Panic)?
}

fn base_builder(read_timeout: Duration) -> ClientBuilder {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(read_timeout)
        .user_agent(default_user_agent())
        .cookie_store(true)
        .gzip(true)
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    for (scheme, names) in [
        ("https", ["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"]),
        ("http", ["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"]),
    ] {
        let Some(proxy) = find_first_proxy_var(&names) else {
            continue;
        };
        let resolved = if scheme == "https" {
            Proxy::https(&proxy)
        } else {
            Proxy::http(&proxy)
        };
        if let Ok(resolved) = resolved {
            builder = builder.proxy(resolved);
        }
    }
    builder
}

fn find_first_proxy_var(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Adds the request's credentials to an outgoing request.
///
/// Values that are not valid header text are skipped with a warning rather
/// than failing the attempt.
#[must_use]
pub fn apply_auth(builder: RequestBuilder, auth: Option<&AuthContext>) -> RequestBuilder {
    let (name, value) = match auth {
        None => return builder,
        Some(AuthContext::Cookie(cookie)) => (COOKIE, cookie.clone()),
        Some(AuthContext::Bearer(token)) => (AUTHORIZATION, format!("Bearer {token}")),
    };
    match HeaderValue::from_str(&value) {
        Ok(mut value) => {
            value.set_sensitive(true);
            builder.header(name, value)
        }
        Err(_) => {
            warn!(header = %name, "auth value is not valid header text, sending without it");
            builder
        }
    }
}
