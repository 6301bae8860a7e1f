//! Release-indexer seam and the Prowlarr-compatible JSON client.
//!
//! Indexer output is persisted verbatim apart from link normalization:
//! links are trimmed, blank links become absent, and a `magnet:` value
//! reported in the download field moves to the magnet field.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::backend::{BackendError, BackendTimeouts, build_backend_http_client};
use crate::store::{BookFormat, NewSearchResult};

const INDEXER: &str = "prowlarr";

/// Newznab category for ebooks.
const EBOOK_CATEGORY: &str = "7020";

/// Newznab category for audiobooks.
const AUDIOBOOK_CATEGORY: &str = "3030";

/// Errors from a release search.
#[derive(Debug, Clone, Error)]
pub enum SearchError {
    /// Transport failure or timeout; the search can simply run again later.
    #[error("indexer unreachable: {message}\n  Suggestion: Check that the indexer is running and `[indexer].base_url` is correct")]
    Connection { message: String },

    /// The indexer refused the search.
    #[error("indexer rejected the search: {message}")]
    Rejected { message: String },

    /// The indexer answered with something that could not be interpreted.
    #[error("indexer returned an unexpected response: {message}")]
    Malformed { message: String },
}

impl SearchError {
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

impl From<BackendError> for SearchError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Connection { .. } => Self::Connection {
                message: error.to_string(),
            },
            BackendError::MalformedResponse { message, .. } => Self::Malformed { message },
            other => Self::Rejected {
                message: other.to_string(),
            },
        }
    }
}

/// What to search for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub title: String,
    pub author: Option<String>,
    pub format: BookFormat,
    pub language: Option<String>,
}

impl SearchQuery {
    /// Free-text search terms: title, then author when known.
    #[must_use]
    pub fn terms(&self) -> String {
        match self.author.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            Some(author) => format!("{} {author}", self.title.trim()),
            None => self.title.trim().to_string(),
        }
    }
}

/// One release as reported by an indexer, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRelease {
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

impl RawRelease {
    /// Applies link normalization; everything else passes through.
    #[must_use]
    pub fn normalize(self) -> NewSearchResult {
        let mut download_url = clean_link(self.download_url);
        let mut magnet_url = clean_link(self.magnet_url);

        if download_url
            .as_deref()
            .is_some_and(|link| link.to_ascii_lowercase().starts_with("magnet:"))
        {
            let moved = download_url.take();
            if magnet_url.is_none() {
                magnet_url = moved;
            }
        }

        NewSearchResult {
            guid: self.guid,
            title: self.title,
            indexer: self.indexer,
            size_bytes: self.size_bytes,
            seeders: self.seeders,
            leechers: self.leechers,
            download_url,
            magnet_url,
            published_at: self.published_at,
        }
    }
}

fn clean_link(link: Option<String>) -> Option<String> {
    link.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// External release search.
#[async_trait]
pub trait ReleaseIndexer: Send + Sync {
    /// Returns every candidate release for `query`.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawRelease>, SearchError>;
}

/// Prowlarr `/api/v1/search` client.
pub struct ProwlarrIndexer {
    http: Client,
    search_url: Url,
    api_key: Option<String>,
}

impl std::fmt::Debug for ProwlarrIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProwlarrIndexer")
            .field("search_url", &self.search_url.as_str())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProwlarrRelease {
    #[serde(default)]
    guid: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    indexer: String,
    #[serde(default)]
    size: Option<i64>,
    #[serde(default)]
    seeders: Option<i64>,
    #[serde(default)]
    leechers: Option<i64>,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    magnet_url: Option<String>,
    #[serde(default)]
    publish_date: Option<DateTime<Utc>>,
}

impl From<ProwlarrRelease> for RawRelease {
    fn from(release: ProwlarrRelease) -> Self {
        Self {
            guid: release.guid,
            title: release.title,
            indexer: release.indexer,
            size_bytes: release.size,
            seeders: release.seeders,
            leechers: release.leechers,
            download_url: release.download_url,
            magnet_url: release.magnet_url,
            published_at: release.publish_date,
        }
    }
}

impl ProwlarrIndexer {
    /// Creates a client for the indexer at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Rejected`] if the URL is unusable or the HTTP
    /// client cannot be built.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeouts: BackendTimeouts,
    ) -> Result<Self, SearchError> {
        let base = crate::backend::parse_base_url(INDEXER, base_url)?;
        let search_url = crate::backend::endpoint(INDEXER, &base, "api/v1/search")?;
        let http = build_backend_http_client(INDEXER, timeouts, None)?;
        Ok(Self {
            http,
            search_url,
            api_key,
        })
    }
}

#[async_trait]
impl ReleaseIndexer for ProwlarrIndexer {
    #[instrument(skip(self, query), fields(terms = %query.terms(), format = %query.format))]
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawRelease>, SearchError> {
        let category = match query.format {
            BookFormat::Ebook => EBOOK_CATEGORY,
            BookFormat::Audiobook => AUDIOBOOK_CATEGORY,
        };
        let terms = query.terms();
        let mut request = self
            .http
            .get(self.search_url.clone())
            .query(&[("query", terms.as_str()), ("type", "search"), ("categories", category)]);
        if let Some(api_key) = self.api_key.as_deref() {
            request = request.header("X-Api-Key", api_key);
        }

        let response = request.send().await.map_err(|error| {
            SearchError::from(BackendError::from_reqwest(INDEXER, self.search_url.as_str(), &error))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(INDEXER, status.as_u16(), body.trim()).into());
        }

        let releases: Vec<ProwlarrRelease> = response.json().await.map_err(|error| SearchError::Malformed {
            message: error.to_string(),
        })?;
        debug!(count = releases.len(), "search returned");
        Ok(releases.into_iter().map(RawRelease::from).collect())
    }
}
