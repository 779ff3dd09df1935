//! Integration tests for the bundled HTTP probe strategy and fetcher.
//!
//! Uses wiremock; tests skip when a localhost socket cannot be bound.

use std::sync::Arc;
use std::time::Duration;

use mediafetch_core::{
    ArchiveKey, ArchiveLedger, DownloadRequest, FailureKind, ItemState, Locator, MediaKind,
    Orchestrator, PassthroughPostProcessor, Strategy, StrategyOutcome, TextFileLedgerStore,
    build_http_client, default_registry,
};
use mediafetch_core::{HttpFetcher, strategy::HttpProbeStrategy};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::fast_config;
use support::socket_guard::start_mock_server_or_skip;

fn probe() -> HttpProbeStrategy {
    HttpProbeStrategy::new(build_http_client(Duration::from_secs(5)).unwrap())
}

async fn attempt(strategy: &HttpProbeStrategy, url: &str, kind: MediaKind) -> StrategyOutcome {
    let request = DownloadRequest::new(url).with_kind(kind);
    strategy
        .attempt(
            request.url(),
            request.constraints(),
            request.auth(),
            &CancellationToken::new(),
        )
        .await
}

// ==================== Probe Strategy Tests ====================

#[tokio::test]
async fn test_probe_resolves_media_response() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/media/clip"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "video/mp4")
                .insert_header("etag", "\"abc\"")
                .set_body_bytes(vec![0_u8; 2048]),
        )
        .mount(&mock_server)
        .await;

    let url = format!("{}/media/clip", mock_server.uri());
    let outcome = attempt(&probe(), &url, MediaKind::Video).await;

    let StrategyOutcome::Resolved(artifact) = outcome else {
        panic!("expected Resolved, got {outcome:?}");
    };
    assert!(matches!(&artifact.locator, Locator::Progressive { url: resolved } if resolved == &url));
    assert_eq!(artifact.container.as_deref(), Some("mp4"));
    assert_eq!(artifact.expected_size, Some(2048));
    assert_eq!(artifact.freshness.etag.as_deref(), Some("\"abc\""));
}

#[tokio::test]
async fn test_probe_classifies_manifest_content_type() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/live"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("#EXTM3U\n", "application/vnd.apple.mpegurl"),
        )
        .mount(&mock_server)
        .await;

    let url = format!("{}/live", mock_server.uri());
    let outcome = attempt(&probe(), &url, MediaKind::Both).await;
    let StrategyOutcome::Resolved(artifact) = outcome else {
        panic!("expected Resolved, got {outcome:?}");
    };
    assert!(matches!(artifact.locator, Locator::Manifest { .. }));
}

#[tokio::test]
async fn test_probe_html_page_is_unsupported() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/watch"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html; charset=utf-8")
                .set_body_string("<html></html>"),
        )
        .mount(&mock_server)
        .await;

    let url = format!("{}/watch", mock_server.uri());
    let outcome = attempt(&probe(), &url, MediaKind::Video).await;
    assert_eq!(outcome.failure_kind(), Some(FailureKind::UnsupportedContent));
}

#[tokio::test]
async fn test_probe_maps_status_codes() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    let cases = [
        ("/gone", ResponseTemplate::new(404), FailureKind::NotFound),
        ("/login", ResponseTemplate::new(401), FailureKind::AuthRequired),
        ("/legal", ResponseTemplate::new(451), FailureKind::GeoBlocked),
        ("/flaky", ResponseTemplate::new(503), FailureKind::TransientNetwork),
        (
            "/challenge",
            ResponseTemplate::new(403).insert_header("cf-mitigated", "challenge"),
            FailureKind::AntiBotChallenge,
        ),
    ];
    for (route, response, _) in &cases {
        Mock::given(method("GET"))
            .and(path(*route))
            .respond_with(response.clone())
            .mount(&mock_server)
            .await;
    }

    let strategy = probe();
    for (route, _, expected) in cases {
        let url = format!("{}{route}", mock_server.uri());
        let outcome = attempt(&strategy, &url, MediaKind::Video).await;
        assert_eq!(outcome.failure_kind(), Some(expected), "route {route}");
    }
}

#[tokio::test]
async fn test_probe_rate_limit_carries_retry_after() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&mock_server)
        .await;

    let url = format!("{}/busy", mock_server.uri());
    let StrategyOutcome::Failed(failure) = attempt(&probe(), &url, MediaKind::Video).await else {
        panic!("expected failure");
    };
    assert_eq!(failure.kind, FailureKind::RateLimited);
    assert_eq!(failure.retry_after, Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn test_probe_observes_cancellation() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&mock_server)
        .await;

    let strategy = probe();
    let request = DownloadRequest::new(format!("{}/slow", mock_server.uri()));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        strategy.attempt(request.url(), request.constraints(), None, &cancel),
    )
    .await
    .expect("probe should return promptly once cancelled");
    assert!(matches!(outcome, StrategyOutcome::Failed(_)));
}

// ==================== End-to-End Tests ====================

#[tokio::test]
async fn test_batch_downloads_to_disk_and_archives() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/media/first.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "video/mp4")
                .set_body_bytes(b"first-bytes".to_vec()),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/missing.mp4"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let out = TempDir::new().unwrap();
    let archive_path = out.path().join("archive.txt");
    let config = fast_config(&out.path().join("downloads"));
    let client = build_http_client(config.attempt_timeout).unwrap();
    let registry = default_registry(&config, client.clone());
    let ledger = Arc::new(
        ArchiveLedger::open(Box::new(TextFileLedgerStore::new(&archive_path)))
            .await
            .unwrap(),
    );

    let orchestrator = Orchestrator::new(
        config,
        registry,
        Arc::new(HttpFetcher::new(client)),
        Arc::new(PassthroughPostProcessor),
        Arc::clone(&ledger),
    )
    .unwrap();

    let first = format!("{}/media/first.mp4", mock_server.uri());
    let missing = format!("{}/media/missing.mp4", mock_server.uri());
    orchestrator
        .submit_batch([DownloadRequest::new(&first), DownloadRequest::new(&missing)])
        .unwrap();
    let report = orchestrator.wait().await;

    assert_eq!(report.items[0].state, ItemState::Done);
    let output = report.items[0].output.clone().unwrap();
    assert_eq!(output.file_name().unwrap(), "first.mp4");
    assert_eq!(std::fs::read(&output).unwrap(), b"first-bytes");

    assert_eq!(report.items[1].state, ItemState::Failed);
    assert_eq!(
        report.items[1].history[0].failure_kind(),
        Some(FailureKind::NotFound)
    );

    let archived = std::fs::read_to_string(&archive_path).unwrap();
    assert_eq!(archived.lines().count(), 1);
    assert_eq!(archived.trim(), ArchiveKey::from_url(&first).to_string());
    orchestrator.shutdown().await;
}
