//! Row types and status definitions for the acquisition tables.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;

/// A stored text value that does not name a known enum variant.
#[derive(Debug, Clone, Error)]
#[error("invalid {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Declares a status-like enum stored as snake_case text.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Returns the database string representation.
            #[must_use]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(ParseEnumError { kind: $label, value: s.to_string() }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseEnumError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

text_enum! {
    /// Lifecycle state of a [`Request`].
    RequestStatus, "request status" {
        /// Created, waiting for a search.
        Pending => "pending",
        /// Indexer search running or results awaiting selection.
        Searching => "searching",
        /// A download has been dispatched.
        Downloading => "downloading",
        /// The last search produced nothing usable; a retry may be scheduled.
        NotFound => "not_found",
        /// Download finished, post-processing underway.
        Processing => "processing",
        /// Delivered.
        Completed => "completed",
        /// Cancelled or abandoned.
        Failed => "failed",
    }
}

impl RequestStatus {
    /// Terminal states never re-enter automatic processing.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

text_enum! {
    /// Format the user asked for.
    BookFormat, "book format" {
        Ebook => "ebook",
        Audiobook => "audiobook",
    }
}

text_enum! {
    /// Selection state of a [`SearchResult`].
    SearchResultStatus, "search result status" {
        Pending => "pending",
        Selected => "selected",
        Rejected => "rejected",
    }
}

text_enum! {
    /// State of one dispatched [`Download`] attempt.
    DownloadStatus, "download status" {
        Queued => "queued",
        Downloading => "downloading",
        Paused => "paused",
        Completed => "completed",
        Failed => "failed",
    }
}

impl DownloadStatus {
    /// Downloads in these states still hold a job on a backend.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Downloading | Self::Paused)
    }
}

text_enum! {
    /// Download technology; also the `client_type` of a [`DownloadClient`].
    DownloadKind, "download kind" {
        Torrent => "torrent",
        Usenet => "usenet",
    }
}

/// External book identity as returned by the metadata collaborator.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Book {
    pub id: i64,
    /// Metadata provider name (e.g. `openlibrary`).
    pub source: String,
    /// Provider-scoped identifier.
    pub source_id: String,
    pub title: String,
    pub author: Option<String>,
    pub cover_url: Option<String>,
}

/// Book identity to upsert on intake.
#[derive(Debug, Clone, Default)]
pub struct NewBook {
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub author: Option<String>,
    pub cover_url: Option<String>,
}

/// A user's standing ask for one book in one format.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Request {
    pub id: i64,
    pub book_id: i64,
    pub user_id: i64,
    #[sqlx(try_from = "String")]
    pub format: BookFormat,
    pub language: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: RequestStatus,
    pub retry_count: i64,
    /// Only set while `status` is `not_found`.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub attention_needed: bool,
    pub issue_description: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped by every locked mutation.
    pub lock_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    /// True iff status is pending/not_found/failed or attention is flagged, and not completed.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.status != RequestStatus::Completed
            && (matches!(
                self.status,
                RequestStatus::Pending | RequestStatus::NotFound | RequestStatus::Failed
            ) || self.attention_needed)
    }

    /// True iff the request has not completed.
    #[must_use]
    pub fn can_be_cancelled(&self) -> bool {
        self.status != RequestStatus::Completed
    }

    /// True iff the request is searching and some result still awaits a decision.
    #[must_use]
    pub fn needs_manual_selection(&self, results: &[SearchResult]) -> bool {
        self.status == RequestStatus::Searching
            && results
                .iter()
                .any(|result| result.status == SearchResultStatus::Pending)
    }
}

/// Insert payload for a new request.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub book_id: i64,
    pub user_id: i64,
    pub format: BookFormat,
    pub language: Option<String>,
}

/// A request joined with its book, used for duplicate classification.
#[derive(Debug, Clone, FromRow)]
pub struct RequestWithBook {
    pub request_id: i64,
    #[sqlx(try_from = "String")]
    pub status: RequestStatus,
    #[sqlx(try_from = "String")]
    pub format: BookFormat,
    pub language: Option<String>,
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub author: Option<String>,
}

/// One candidate release discovered for a request.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SearchResult {
    pub id: i64,
    pub request_id: i64,
    pub guid: String,
    pub title: String,
    pub indexer: String,
    pub size_bytes: Option<i64>,
    /// `None` signals a non-torrent source.
    pub seeders: Option<i64>,
    pub leechers: Option<i64>,
    pub download_url: Option<String>,
    pub magnet_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub status: SearchResultStatus,
}

impl SearchResult {
    /// True iff at least one fetch link is present.
    #[must_use]
    pub fn is_downloadable(&self) -> bool {
        self.download_url.is_some() || self.magnet_url.is_some()
    }

    /// Download link, no magnet, and no seeder count.
    #[must_use]
    pub fn is_usenet_shaped(&self) -> bool {
        self.download_url.is_some() && self.magnet_url.is_none() && self.seeders.is_none()
    }

    /// Magnet link, or a download link that is not usenet-shaped.
    #[must_use]
    pub fn is_torrent_shaped(&self) -> bool {
        self.magnet_url.is_some() || (self.download_url.is_some() && !self.is_usenet_shaped())
    }

    /// The technology this result must be fetched with, if downloadable.
    #[must_use]
    pub fn kind(&self) -> Option<DownloadKind> {
        if self.is_usenet_shaped() {
            Some(DownloadKind::Usenet)
        } else if self.is_torrent_shaped() {
            Some(DownloadKind::Torrent)
        } else {
            None
        }
    }

    /// The link handed to a backend: the magnet when present, else the download URL.
    #[must_use]
    pub fn fetch_link(&self) -> Option<&str> {
        self.magnet_url.as_deref().or(self.download_url.as_deref())
    }
}

/// Normalized candidate release ready to persist.
#[derive(Debug, Clone, Default)]
pub struct NewSearchResult {
    pub guid: String,
    pub title: String,
    pub indexer: String,
    pub size_bytes: Option<i64>,
    pub seeders: Option<i64>,
    pub leechers: Option<i64>,
    pub download_url: Option<String>,
    pub magnet_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// One dispatched attempt to fetch a selected result.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Download {
    pub id: i64,
    pub request_id: i64,
    pub search_result_id: Option<i64>,
    pub download_client_id: Option<i64>,
    #[sqlx(try_from = "String")]
    pub kind: DownloadKind,
    /// Magnet or download URL handed to the backend.
    pub source_url: String,
    pub name: String,
    pub size_bytes: Option<i64>,
    #[sqlx(try_from = "String")]
    pub status: DownloadStatus,
    /// Backend-assigned handle (torrent hash, usenet job id).
    pub external_id: Option<String>,
    pub progress: i64,
    /// Last adapter error, recorded for the monitor loop.
    pub error_message: Option<String>,
    pub download_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a new download attempt.
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub request_id: i64,
    pub search_result_id: Option<i64>,
    pub kind: DownloadKind,
    pub source_url: String,
    pub name: String,
    pub size_bytes: Option<i64>,
}

/// Configuration and credentials for one backend instance.
#[derive(Clone, FromRow, Serialize)]
pub struct DownloadClient {
    pub id: i64,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub client_type: DownloadKind,
    pub base_url: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub category: Option<String>,
    /// Lower values are tried first among clients of the same type.
    pub priority: i64,
    pub enabled: bool,
}

impl fmt::Debug for DownloadClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadClient")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("client_type", &self.client_type)
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("category", &self.category)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Insert payload for a new download client.
#[derive(Debug, Clone)]
pub struct NewDownloadClient {
    pub name: String,
    pub client_type: DownloadKind,
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub category: Option<String>,
    pub priority: i64,
    pub enabled: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn result(download: Option<&str>, magnet: Option<&str>, seeders: Option<i64>) -> SearchResult {
        SearchResult {
            id: 1,
            request_id: 1,
            guid: "guid".to_string(),
            title: "Dune".to_string(),
            indexer: "idx".to_string(),
            size_bytes: Some(1024),
            seeders,
            leechers: None,
            download_url: download.map(str::to_string),
            magnet_url: magnet.map(str::to_string),
            published_at: None,
            status: SearchResultStatus::Pending,
        }
    }

    fn request(status: RequestStatus, attention_needed: bool) -> Request {
        let now = Utc::now();
        Request {
            id: 1,
            book_id: 1,
            user_id: 1,
            format: BookFormat::Ebook,
            language: Some("en".to_string()),
            status,
            retry_count: 0,
            next_retry_at: None,
            attention_needed,
            issue_description: None,
            completed_at: None,
            lock_version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_request_status_round_trips_through_text() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Searching,
            RequestStatus::Downloading,
            RequestStatus::NotFound,
            RequestStatus::Processing,
            RequestStatus::Completed,
            RequestStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RequestStatus>().unwrap(), status);
        }
        assert_eq!(RequestStatus::NotFound.to_string(), "not_found");
        assert!("bogus".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn test_usenet_shape_requires_null_seeders() {
        let nzb = result(Some("https://idx/nzb/1"), None, None);
        assert!(nzb.is_usenet_shaped());
        assert_eq!(nzb.kind(), Some(DownloadKind::Usenet));

        let torrent_file = result(Some("https://idx/t/1.torrent"), None, Some(4));
        assert!(!torrent_file.is_usenet_shaped());
        assert_eq!(torrent_file.kind(), Some(DownloadKind::Torrent));
    }

    #[test]
    fn test_magnet_is_torrent_shaped_and_preferred_link() {
        let magnet = result(Some("https://idx/t/1.torrent"), Some("magnet:?xt=urn:btih:abc"), None);
        assert!(magnet.is_torrent_shaped());
        assert_eq!(magnet.fetch_link(), Some("magnet:?xt=urn:btih:abc"));
    }

    #[test]
    fn test_result_without_links_is_not_downloadable() {
        let bare = result(None, None, Some(10));
        assert!(!bare.is_downloadable());
        assert_eq!(bare.kind(), None);
    }

    #[test]
    fn test_can_retry_guard() {
        assert!(request(RequestStatus::Pending, false).can_retry());
        assert!(request(RequestStatus::NotFound, false).can_retry());
        assert!(request(RequestStatus::Failed, false).can_retry());
        assert!(!request(RequestStatus::Downloading, false).can_retry());
        assert!(request(RequestStatus::Downloading, true).can_retry());
        assert!(!request(RequestStatus::Completed, true).can_retry());
    }

    #[test]
    fn test_can_be_cancelled_guard() {
        assert!(request(RequestStatus::Processing, false).can_be_cancelled());
        assert!(request(RequestStatus::Failed, false).can_be_cancelled());
        assert!(!request(RequestStatus::Completed, false).can_be_cancelled());
    }

    #[test]
    fn test_needs_manual_selection_requires_pending_result() {
        let searching = request(RequestStatus::Searching, false);
        let mut results = vec![result(Some("https://idx/1"), None, None)];
        assert!(searching.needs_manual_selection(&results));

        results[0].status = SearchResultStatus::Rejected;
        assert!(!searching.needs_manual_selection(&results));

        results[0].status = SearchResultStatus::Pending;
        assert!(!request(RequestStatus::Pending, false).needs_manual_selection(&results));
    }

    #[test]
    fn test_download_client_debug_redacts_secrets() {
        let client = DownloadClient {
            id: 1,
            name: "sab".to_string(),
            client_type: DownloadKind::Usenet,
            base_url: "http://localhost:8080".to_string(),
            username: None,
            password: Some("hunter2".to_string()),
            api_key: Some("secret-key".to_string()),
            category: None,
            priority: 0,
            enabled: true,
        };
        let debug = format!("{client:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("<redacted>"));
    }
}
