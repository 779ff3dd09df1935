//! CLI entry point for mediafetch.

use std::io::{self, IsTerminal, Read};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;
use mediafetch_core::{
    ArchiveLedger, AttemptResult, BatchReport, Database, HttpFetcher, ItemState, LedgerStore,
    Orchestrator, PassthroughPostProcessor, SqliteLedgerStore, SubmitOptions, TextFileLedgerStore,
    build_http_client, default_registry,
};
use tracing::{debug, info, warn};

mod cli;
mod progress;

use cli::{Args, parse_urls};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    // Read input: from positional args or stdin
    let urls = if !args.urls.is_empty() {
        parse_urls(&args.urls.join("\n"))
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        parse_urls(&buffer)
    } else {
        info!("No input provided. Pipe URLs via stdin or pass as arguments.");
        info!("Example: echo 'https://example.com/clip.mp4' | mediafetch");
        return Ok(ExitCode::SUCCESS);
    };

    if urls.is_empty() {
        info!("No URLs found in input");
        return Ok(ExitCode::SUCCESS);
    }

    let config = args.engine_config();
    config.validate().context("invalid engine configuration")?;

    let client = build_http_client(config.attempt_timeout).context("failed to build HTTP client")?;
    let registry = default_registry(&config, client.clone());
    let ledger = Arc::new(open_ledger(args.archive.as_deref()).await?);
    info!(urls = urls.len(), archived = ledger.len(), "mediafetch starting");

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        registry,
        Arc::new(HttpFetcher::new(client)),
        Arc::new(PassthroughPostProcessor),
        ledger,
    )?);

    let options = SubmitOptions { force: args.force };
    for request in args.requests(&urls) {
        orchestrator.submit_with(request, options)?;
    }

    let use_spinner = !args.quiet && !args.json && io::stderr().is_terminal();
    let (spinner, stop) =
        progress::spawn_progress_ui(use_spinner, Arc::clone(&orchestrator), urls.len());

    let report = tokio::select! {
        report = orchestrator.wait() => report,
        _ = tokio::signal::ctrl_c() => {
            let cancelled = orchestrator.cancel_all();
            warn!(cancelled, "Interrupted, cancelling outstanding items");
            orchestrator.wait().await
        }
    };

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = spinner {
        let _ = handle.await;
    }
    match Arc::try_unwrap(orchestrator) {
        Ok(orchestrator) => orchestrator.shutdown().await,
        Err(_) => debug!("orchestrator still shared at exit"),
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        log_report(&report);
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Opens the archive ledger: SQLite for `.db` paths, a text file otherwise,
/// in-memory when no path is given.
async fn open_ledger(path: Option<&Path>) -> Result<ArchiveLedger> {
    let Some(path) = path else {
        return Ok(ArchiveLedger::in_memory());
    };
    let store: Box<dyn LedgerStore> = if path.extension().is_some_and(|ext| ext == "db") {
        let db = Database::new(path)
            .await
            .with_context(|| format!("failed to open archive database {}", path.display()))?;
        Box::new(SqliteLedgerStore::new(db))
    } else {
        Box::new(TextFileLedgerStore::new(path))
    };
    ArchiveLedger::open(store)
        .await
        .with_context(|| format!("failed to load archive {}", path.display()))
}

fn log_report(report: &BatchReport) {
    for skipped in &report.skipped {
        info!(url = %skipped.url, key = %skipped.key, "Skipped (already archived)");
    }
    for item in &report.items {
        match item.state {
            ItemState::Done => {
                let output = item
                    .output
                    .as_deref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();
                info!(url = %item.url, output = %output, "Downloaded");
            }
            ItemState::Failed => {
                warn!(url = %item.url, cause = ?item.cause, error = ?item.error, "Failed");
                for attempt in item.history.iter().chain(&item.stage_history) {
                    if let AttemptResult::Failed(failure) = &attempt.result {
                        warn!(
                            strategy = %attempt.strategy,
                            stage = %attempt.stage,
                            kind = %failure.kind,
                            detail = %failure.detail,
                            "  attempt"
                        );
                    }
                }
            }
            _ => info!(url = %item.url, state = %item.state, "Not completed"),
        }
    }
    info!(
        done = report.done(),
        failed = report.failed(),
        cancelled = report.cancelled(),
        skipped = report.skipped.len(),
        "Batch complete"
    );
}
