//! Download backend adapters behind one capability interface.
//!
//! # Architecture
//!
//! - [`DownloadBackend`] - async trait every backend family implements
//! - [`BackendProvider`] - builds a backend from a stored [`DownloadClient`]
//! - [`TorrentBackend`] - qBittorrent Web API (session-cookie login)
//! - [`UsenetBackend`] - SABnzbd API (static API key per call)
//! - [`HttpBackendProvider`] - the production provider over both families
//!
//! Callers above this module never name a concrete backend; they hold
//! `Arc<dyn DownloadBackend>` values handed out by a provider.

mod error;
mod http_client;
mod torrent;
mod usenet;

pub use error::BackendError;
pub use http_client::{
    BackendTimeouts, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS,
    build_backend_http_client,
};
pub(crate) use http_client::{endpoint, parse_base_url};
pub use torrent::{TorrentBackend, info_hash_from_magnet};
pub use usenet::UsenetBackend;

use std::sync::Arc;

use async_trait::async_trait;

use crate::store::{DownloadClient, DownloadKind, DownloadStatus};

/// What to hand a backend when dispatching a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSpec {
    /// Magnet, torrent URL, or NZB URL.
    pub source_url: String,
    /// Display name for the job.
    pub name: String,
    /// Backend category/label, when the client has one configured.
    pub category: Option<String>,
    /// Tag unique to this download attempt, used to find the job again.
    pub tag: String,
}

impl DownloadSpec {
    /// Tag identifying a download attempt on the backend.
    #[must_use]
    pub fn tag_for(download_id: i64) -> String {
        format!("bookfetch-{download_id}")
    }
}

/// Normalized job state reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl From<BackendState> for DownloadStatus {
    fn from(state: BackendState) -> Self {
        match state {
            BackendState::Queued => Self::Queued,
            BackendState::Downloading => Self::Downloading,
            BackendState::Paused => Self::Paused,
            BackendState::Completed => Self::Completed,
            BackendState::Failed => Self::Failed,
        }
    }
}

/// One observation of a backend job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    /// 0-100.
    pub progress: u8,
    pub state: BackendState,
    /// Where the finished files live, once known.
    pub download_path: Option<String>,
    /// Backend-supplied failure reason.
    pub message: Option<String>,
}

/// Uniform capability surface over one download backend instance.
#[async_trait]
pub trait DownloadBackend: Send + Sync {
    /// The download technology this backend handles.
    fn kind(&self) -> DownloadKind;

    /// Verifies reachability and credentials.
    ///
    /// Returns `Ok(false)` when the backend answered but refused.
    async fn test_connection(&self) -> Result<bool, BackendError>;

    /// Submits a job and returns the backend's handle for it.
    async fn add(&self, spec: &DownloadSpec) -> Result<String, BackendError>;

    /// Reports progress and state of a job.
    ///
    /// Returns [`BackendError::NotFound`] when the backend no longer knows the job.
    async fn status(&self, external_id: &str) -> Result<BackendStatus, BackendError>;

    /// Removes a job, optionally deleting its files. Returns whether anything was removed.
    async fn remove(&self, external_id: &str, delete_files: bool) -> Result<bool, BackendError>;
}

/// Builds backends from stored client rows.
pub trait BackendProvider: Send + Sync {
    /// Returns a backend for `client`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidConfig`] when the client row cannot be used.
    fn backend_for(&self, client: &DownloadClient) -> Result<Arc<dyn DownloadBackend>, BackendError>;
}

/// Provider that maps each `client_type` to its HTTP adapter.
#[derive(Debug, Clone, Default)]
pub struct HttpBackendProvider {
    timeouts: BackendTimeouts,
}

impl HttpBackendProvider {
    /// Creates a provider whose backends use `timeouts`.
    #[must_use]
    pub fn new(timeouts: BackendTimeouts) -> Self {
        Self { timeouts }
    }
}

impl BackendProvider for HttpBackendProvider {
    fn backend_for(&self, client: &DownloadClient) -> Result<Arc<dyn DownloadBackend>, BackendError> {
        match client.client_type {
            DownloadKind::Torrent => Ok(Arc::new(TorrentBackend::new(client, self.timeouts)?)),
            DownloadKind::Usenet => Ok(Arc::new(UsenetBackend::new(client, self.timeouts)?)),
        }
    }
}
