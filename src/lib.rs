//! Bookfetch Core Library
//!
//! Acquisition fulfillment for book requests: a request moves from intake
//! through release search, selection, download dispatch to a torrent or
//! usenet client, progress monitoring, and delivery, with backoff retries
//! and escalation to a human when nothing can be found.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`lifecycle`] - the request state machine and its mutators
//! - [`orchestrator`] - download creation, dispatch, polling, removal
//! - [`backend`] - torrent and usenet adapters behind one trait
//! - [`ranking`] - best-first ordering of search results
//! - [`retry`] - backoff scheduling and escalation
//! - [`duplicate`] - allow/warn/block gate at intake
//! - [`store`] - SQLite persistence and the per-request lock
//! - [`workers`] - periodic search, dispatch, monitor, and retry sweeps
//! - [`indexer`] / [`postprocess`] - collaborator seams
//! - [`events`] - in-process lifecycle event bus
//! - [`config`] - TOML settings

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod db;
pub mod duplicate;
pub mod error;
pub mod events;
pub mod indexer;
pub mod lifecycle;
pub mod orchestrator;
pub mod postprocess;
pub mod ranking;
pub mod retry;
pub mod store;
pub mod workers;
mod user_agent;

// Re-export commonly used types
pub use backend::{
    BackendError, BackendProvider, BackendState, BackendStatus, BackendTimeouts,
    DownloadBackend, DownloadSpec, HttpBackendProvider, TorrentBackend, UsenetBackend,
};
pub use config::{ConfigError, Settings};
pub use db::{Database, DatabaseOptions};
pub use duplicate::{DuplicateAction, DuplicateGuard, DuplicatePolicy, DuplicateVerdict};
pub use error::AcquisitionError;
pub use events::{EventBus, LifecycleEvent};
pub use indexer::{ProwlarrIndexer, RawRelease, ReleaseIndexer, SearchError, SearchQuery};
pub use lifecycle::{
    CreatedRequest, PollOutcome, RequestIntake, RequestLifecycle, RetryNowOutcome, SearchOutcome,
};
pub use orchestrator::DownloadOrchestrator;
pub use postprocess::{AcceptInPlace, PostProcessError, PostProcessOutcome, PostProcessor};
pub use ranking::SearchResultRanker;
pub use retry::{RetryOutcome, RetryPolicy, RetryScheduler};
pub use store::{
    Book, BookFormat, Download, DownloadClient, DownloadKind, DownloadStatus, NewBook,
    NewDownloadClient, Request, RequestStatus, SearchResult, SearchResultStatus, Store,
    StoreError,
};
pub use workers::{MonitorReport, Workers};
