//! SQLite-backed persistence for requests, search results, downloads, and clients.
//!
//! # Overview
//!
//! - [`Store`] - query surface over the shared relational store
//! - [`LockedRequest`] - per-request exclusive lock for multi-field mutations
//! - [`StoreError`] - operation error types
//!
//! Reads and idempotent single-row updates go straight through the pool.
//! Anything that changes a request's status, counters, or attention flag goes
//! through [`Store::lock_request`].

mod error;
mod lock;
mod models;

pub use error::StoreError;
pub use lock::LockedRequest;
pub use models::{
    Book, BookFormat, Download, DownloadClient, DownloadKind, DownloadStatus, NewBook,
    NewDownload, NewDownloadClient, NewRequest, NewSearchResult, ParseEnumError, Request,
    RequestStatus, RequestWithBook, SearchResult, SearchResultStatus,
};

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use crate::db::Database;
use error::check_affected;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// One observation of a backend job, ready to apply to its download row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadObservation {
    pub status: DownloadStatus,
    /// 0-100.
    pub progress: u8,
    pub download_path: Option<String>,
    pub error_message: Option<String>,
}

/// Query surface over the acquisition tables.
#[derive(Debug, Clone)]
pub struct Store {
    db: Database,
}

impl Store {
    /// Creates a store over the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Takes the exclusive lock on a request row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the request does not exist, or
    /// [`StoreError::Database`] if the lock cannot be taken within the busy timeout.
    #[instrument(skip(self))]
    pub async fn lock_request(&self, id: i64) -> Result<LockedRequest> {
        LockedRequest::acquire(self.db.pool(), id).await
    }

    // ==================== Users & Books ====================

    /// Returns the id of `username`, creating the user on first sight.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the upsert fails.
    #[instrument(skip(self))]
    pub async fn ensure_user(&self, username: &str) -> Result<i64> {
        let row = sqlx::query(
            r"INSERT INTO users (username) VALUES (?)
              ON CONFLICT (username) DO UPDATE SET username = excluded.username
              RETURNING id",
        )
        .bind(username)
        .fetch_one(self.db.pool())
        .await?;
        Ok(row.get("id"))
    }

    /// Inserts a book or refreshes the display fields of the existing identity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the upsert fails.
    #[instrument(skip(self, book), fields(source = %book.source, source_id = %book.source_id))]
    pub async fn upsert_book(&self, book: &NewBook) -> Result<Book> {
        let row = sqlx::query_as::<_, Book>(
            r"INSERT INTO books (source, source_id, title, author, cover_url)
              VALUES (?, ?, ?, ?, ?)
              ON CONFLICT (source, source_id) DO UPDATE SET
                  title = excluded.title,
                  author = excluded.author,
                  cover_url = COALESCE(excluded.cover_url, books.cover_url)
              RETURNING *",
        )
        .bind(&book.source)
        .bind(&book.source_id)
        .bind(&book.title)
        .bind(book.author.as_deref())
        .bind(book.cover_url.as_deref())
        .fetch_one(self.db.pool())
        .await?;
        Ok(row)
    }

    /// Gets a book by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn get_book(&self, id: i64) -> Result<Option<Book>> {
        let book = sqlx::query_as::<_, Book>(r"SELECT * FROM books WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(book)
    }

    // ==================== Requests ====================

    /// Inserts a new `pending` request.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, request), fields(book_id = request.book_id, format = %request.format))]
    pub async fn insert_request(&self, request: &NewRequest) -> Result<Request> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, Request>(
            r"INSERT INTO requests (
                book_id, user_id, format, language, status, retry_count,
                attention_needed, created_at, updated_at
              )
              VALUES (?, ?, ?, ?, ?, 0, 0, ?, ?)
              RETURNING *",
        )
        .bind(request.book_id)
        .bind(request.user_id)
        .bind(request.format.as_str())
        .bind(request.language.as_deref())
        .bind(RequestStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;
        Ok(row)
    }

    /// Gets a request by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn get_request(&self, id: i64) -> Result<Option<Request>> {
        let request = sqlx::query_as::<_, Request>(r"SELECT * FROM requests WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(request)
    }

    /// Lists every request, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_all_requests(&self) -> Result<Vec<Request>> {
        let requests =
            sqlx::query_as::<_, Request>(r"SELECT * FROM requests ORDER BY id DESC")
                .fetch_all(self.db.pool())
                .await?;
        Ok(requests)
    }

    /// Lists requests in a status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_requests_by_status(&self, status: RequestStatus) -> Result<Vec<Request>> {
        let requests = sqlx::query_as::<_, Request>(
            r"SELECT * FROM requests WHERE status = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(self.db.pool())
        .await?;
        Ok(requests)
    }

    /// Lists requests flagged for human attention.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_requests_needing_attention(&self) -> Result<Vec<Request>> {
        let requests = sqlx::query_as::<_, Request>(
            r"SELECT * FROM requests WHERE attention_needed = 1 ORDER BY updated_at ASC, id ASC",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(requests)
    }

    /// Lists `searching` requests that still have a pending result to choose from.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_requests_awaiting_selection(&self) -> Result<Vec<Request>> {
        let requests = sqlx::query_as::<_, Request>(
            r"SELECT * FROM requests r
              WHERE r.status = ?
                AND EXISTS (
                    SELECT 1 FROM search_results s
                    WHERE s.request_id = r.id AND s.status = ?
                )
              ORDER BY r.created_at ASC, r.id ASC",
        )
        .bind(RequestStatus::Searching.as_str())
        .bind(SearchResultStatus::Pending.as_str())
        .fetch_all(self.db.pool())
        .await?;
        Ok(requests)
    }

    /// Lists `searching` requests with no stored results, last touched before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_stalled_searches(&self, cutoff: DateTime<Utc>) -> Result<Vec<Request>> {
        let candidates = sqlx::query_as::<_, Request>(
            r"SELECT * FROM requests r
              WHERE r.status = ?
                AND NOT EXISTS (SELECT 1 FROM search_results s WHERE s.request_id = r.id)
              ORDER BY r.id ASC",
        )
        .bind(RequestStatus::Searching.as_str())
        .fetch_all(self.db.pool())
        .await?;

        Ok(candidates
            .into_iter()
            .filter(|request| request.updated_at < cutoff)
            .collect())
    }

    /// Lists `not_found` requests whose `next_retry_at` is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_requests_retry_due(&self, now: DateTime<Utc>) -> Result<Vec<Request>> {
        let candidates = sqlx::query_as::<_, Request>(
            r"SELECT * FROM requests
              WHERE status = ? AND next_retry_at IS NOT NULL
              ORDER BY id ASC",
        )
        .bind(RequestStatus::NotFound.as_str())
        .fetch_all(self.db.pool())
        .await?;

        let mut due: Vec<Request> = candidates
            .into_iter()
            .filter(|request| request.next_retry_at.is_some_and(|at| at <= now))
            .collect();
        due.sort_by_key(|request| request.next_retry_at);
        Ok(due)
    }

    /// Lists non-failed requests in `format`, joined with their book identity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_requests_for_duplicate_check(
        &self,
        format: BookFormat,
    ) -> Result<Vec<RequestWithBook>> {
        let rows = sqlx::query_as::<_, RequestWithBook>(
            r"SELECT r.id AS request_id, r.status, r.format, r.language,
                     b.source, b.source_id, b.title, b.author
              FROM requests r
              JOIN books b ON b.id = r.book_id
              WHERE r.format = ? AND r.status != ?
              ORDER BY r.id ASC",
        )
        .bind(format.as_str())
        .bind(RequestStatus::Failed.as_str())
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Deletes a failed request that never completed an acquisition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such orphaned request exists.
    #[instrument(skip(self))]
    pub async fn delete_orphaned_request(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r"DELETE FROM requests
              WHERE id = ? AND status = ?
                AND NOT EXISTS (
                    SELECT 1 FROM downloads d WHERE d.request_id = requests.id AND d.status = ?
                )",
        )
        .bind(id)
        .bind(RequestStatus::Failed.as_str())
        .bind(DownloadStatus::Completed.as_str())
        .execute(self.db.pool())
        .await?;

        check_affected("orphaned request", id, result.rows_affected())
    }

    // ==================== Search Results ====================

    /// Lists a request's search results in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_search_results(&self, request_id: i64) -> Result<Vec<SearchResult>> {
        let results = sqlx::query_as::<_, SearchResult>(
            r"SELECT * FROM search_results WHERE request_id = ? ORDER BY id ASC",
        )
        .bind(request_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(results)
    }

    /// Gets a search result by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn get_search_result(&self, id: i64) -> Result<Option<SearchResult>> {
        let result = sqlx::query_as::<_, SearchResult>(r"SELECT * FROM search_results WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(result)
    }

    // ==================== Downloads ====================

    /// Gets a download by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn get_download(&self, id: i64) -> Result<Option<Download>> {
        let download = sqlx::query_as::<_, Download>(r"SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(download)
    }

    /// Lists a request's download attempts, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_downloads(&self, request_id: i64) -> Result<Vec<Download>> {
        let downloads = sqlx::query_as::<_, Download>(
            r"SELECT * FROM downloads WHERE request_id = ? ORDER BY id DESC",
        )
        .bind(request_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(downloads)
    }

    /// Lists queued downloads that no backend has accepted yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_undispatched_downloads(&self) -> Result<Vec<Download>> {
        let downloads = sqlx::query_as::<_, Download>(
            r"SELECT * FROM downloads
              WHERE status = ? AND external_id IS NULL
              ORDER BY id ASC",
        )
        .bind(DownloadStatus::Queued.as_str())
        .fetch_all(self.db.pool())
        .await?;
        Ok(downloads)
    }

    /// Lists active downloads that hold a backend job and need polling.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_monitored_downloads(&self) -> Result<Vec<Download>> {
        let downloads = sqlx::query_as::<_, Download>(
            r"SELECT * FROM downloads
              WHERE status IN (?, ?, ?) AND external_id IS NOT NULL
              ORDER BY id ASC",
        )
        .bind(DownloadStatus::Queued.as_str())
        .bind(DownloadStatus::Downloading.as_str())
        .bind(DownloadStatus::Paused.as_str())
        .fetch_all(self.db.pool())
        .await?;
        Ok(downloads)
    }

    /// Lists completed downloads whose request never left `downloading`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_unprocessed_completions(&self) -> Result<Vec<Download>> {
        let downloads = sqlx::query_as::<_, Download>(
            r"SELECT d.* FROM downloads d
              JOIN requests r ON r.id = d.request_id
              WHERE d.status = ? AND r.status = ?
                AND d.id = (SELECT MAX(id) FROM downloads WHERE request_id = d.request_id)
              ORDER BY d.id ASC",
        )
        .bind(DownloadStatus::Completed.as_str())
        .bind(RequestStatus::Downloading.as_str())
        .fetch_all(self.db.pool())
        .await?;
        Ok(downloads)
    }

    /// Records the backend handle of a queued download.
    ///
    /// Returns `false` when the download already has a handle or left `queued`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn record_dispatch(
        &self,
        download_id: i64,
        client_id: i64,
        external_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE downloads
              SET download_client_id = ?, external_id = ?, error_message = NULL, updated_at = ?
              WHERE id = ? AND status = ? AND external_id IS NULL",
        )
        .bind(client_id)
        .bind(external_id)
        .bind(Utc::now())
        .bind(download_id)
        .bind(DownloadStatus::Queued.as_str())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records the last adapter error against a download without changing its status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no download exists with the given ID.
    #[instrument(skip(self, message))]
    pub async fn record_download_error(&self, download_id: i64, message: &str) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE downloads SET error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(message)
        .bind(Utc::now())
        .bind(download_id)
        .execute(self.db.pool())
        .await?;
        check_affected("download", download_id, result.rows_affected())
    }

    /// Applies a backend observation to an active download.
    ///
    /// Returns `true` only when the row changed. Terminal downloads are never
    /// touched, so a late poll cannot resurrect a cancelled attempt, and the
    /// same observation applied twice is a no-op the second time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self, observation), fields(status = %observation.status, progress = observation.progress))]
    pub async fn apply_download_observation(
        &self,
        download_id: i64,
        observation: &DownloadObservation,
    ) -> Result<bool> {
        let progress = i64::from(observation.progress.min(100));
        let result = sqlx::query(
            r"UPDATE downloads
              SET status = ?,
                  progress = ?,
                  download_path = COALESCE(?, download_path),
                  error_message = COALESCE(?, error_message),
                  updated_at = ?
              WHERE id = ?
                AND status IN (?, ?, ?)
                AND (status != ? OR progress != ? OR (? IS NOT NULL AND download_path IS NOT ?))",
        )
        .bind(observation.status.as_str())
        .bind(progress)
        .bind(observation.download_path.as_deref())
        .bind(observation.error_message.as_deref())
        .bind(Utc::now())
        .bind(download_id)
        .bind(DownloadStatus::Queued.as_str())
        .bind(DownloadStatus::Downloading.as_str())
        .bind(DownloadStatus::Paused.as_str())
        .bind(observation.status.as_str())
        .bind(progress)
        .bind(observation.download_path.as_deref())
        .bind(observation.download_path.as_deref())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ==================== Download Clients ====================

    /// Inserts a download client.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails (e.g. duplicate name).
    #[instrument(skip(self, client), fields(name = %client.name, client_type = %client.client_type))]
    pub async fn insert_client(&self, client: &NewDownloadClient) -> Result<DownloadClient> {
        let row = sqlx::query_as::<_, DownloadClient>(
            r"INSERT INTO download_clients (
                name, client_type, base_url, username, password, api_key, category, priority, enabled
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING *",
        )
        .bind(&client.name)
        .bind(client.client_type.as_str())
        .bind(&client.base_url)
        .bind(client.username.as_deref())
        .bind(client.password.as_deref())
        .bind(client.api_key.as_deref())
        .bind(client.category.as_deref())
        .bind(client.priority)
        .bind(client.enabled)
        .fetch_one(self.db.pool())
        .await?;
        Ok(row)
    }

    /// Gets a download client by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn get_client(&self, id: i64) -> Result<Option<DownloadClient>> {
        let client =
            sqlx::query_as::<_, DownloadClient>(r"SELECT * FROM download_clients WHERE id = ?")
                .bind(id)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(client)
    }

    /// Lists all download clients.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_clients(&self) -> Result<Vec<DownloadClient>> {
        let clients = sqlx::query_as::<_, DownloadClient>(
            r"SELECT * FROM download_clients ORDER BY client_type ASC, priority ASC, id ASC",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(clients)
    }

    /// Lists enabled clients of `kind`, lowest priority value first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn enabled_clients(&self, kind: DownloadKind) -> Result<Vec<DownloadClient>> {
        let clients = sqlx::query_as::<_, DownloadClient>(
            r"SELECT * FROM download_clients
              WHERE client_type = ? AND enabled = 1
              ORDER BY priority ASC, id ASC",
        )
        .bind(kind.as_str())
        .fetch_all(self.db.pool())
        .await?;
        Ok(clients)
    }

    /// Enables or disables a download client.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no client exists with the given ID.
    #[instrument(skip(self))]
    pub async fn set_client_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let result = sqlx::query(r"UPDATE download_clients SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(self.db.pool())
            .await?;
        check_affected("download client", id, result.rows_affected())
    }
}
