//! Mediafetch Core Library
//!
//! Resolution fallback engine and concurrent download orchestrator. Given a
//! URL on an uncooperative host, the engine tries qualitatively different
//! acquisition strategies in a deterministic order, classifies every failure,
//! and coordinates many such resolutions without overwhelming any one origin.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`strategy`] - Strategy trait, tiered registry with per-origin demotion
//! - [`resolver`] - Drives one request through the strategy chain
//! - [`governor`] - Per-origin permits, admission, and backoff windows
//! - [`queue`] - Queue item state machine
//! - [`orchestrator`] - Worker pool, progress snapshots, batch reports
//! - [`pipeline`] - Fetch and post-process boundaries
//! - [`archive`] - Archive ledger for idempotent re-runs
//! - [`db`] - SQLite connection backing the durable ledger store

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod config;
pub mod db;
pub mod failure;
pub mod governor;
pub mod http;
pub mod media;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod strategy;

// Re-export commonly used types
pub use archive::{
    ArchiveKey, ArchiveLedger, LedgerError, LedgerStore, MemoryLedgerStore, SqliteLedgerStore,
    TextFileLedgerStore,
};
pub use config::{ConfigError, EngineConfig};
pub use db::{Database, DbError};
pub use failure::{FailureKind, FailurePolicy, StrategyFailure, classify_http_status};
pub use governor::{Admission, GovernorError, Permit, RateGovernor, extract_origin};
pub use http::build_http_client;
pub use media::{
    AuthContext, DownloadRequest, Freshness, Locator, MediaArtifact, MediaConstraints, MediaKind,
    QualityPreference, StreamProtocol,
};
pub use orchestrator::{
    BatchReport, Disposition, ItemHandle, ItemReport, ItemSnapshot, Orchestrator,
    OrchestratorError, SkippedItem, SubmitOptions,
};
pub use pipeline::{Fetcher, HttpFetcher, PassthroughPostProcessor, PostProcessor, TransferProgress};
pub use queue::{ItemId, ItemState, QueueItem, Stage};
pub use resolver::{AttemptRecord, AttemptResult, ExhaustionCause, Resolution, Resolver};
pub use retry::{RetryDecision, RetryPolicy};
pub use strategy::{
    Strategy, StrategyOutcome, StrategyRegistry, StrategyTier, default_registry,
};
