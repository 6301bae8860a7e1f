//! Per-request exclusive lock.
//!
//! A [`LockedRequest`] is a write transaction whose first statement bumps the
//! request's `lock_version`. In SQLite that statement takes the database write
//! lock before anything is read, so two lockers of the same request (or any
//! request) serialize on the busy timeout instead of interleaving their
//! read-modify-write. Dropping the guard without [`LockedRequest::commit`]
//! rolls every change back.

use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;

use super::error::StoreError;
use super::models::{
    Download, DownloadStatus, NewDownload, NewSearchResult, Request, SearchResult,
    SearchResultStatus,
};

type Result<T> = std::result::Result<T, StoreError>;

/// Exclusive handle on one request row for the duration of a mutation.
pub struct LockedRequest {
    tx: Transaction<'static, Sqlite>,
    original: Request,
    request: Request,
}

impl LockedRequest {
    pub(super) async fn acquire(pool: &SqlitePool, id: i64) -> Result<Self> {
        let mut tx = pool.begin().await?;
        let request = sqlx::query_as::<_, Request>(
            r"UPDATE requests
              SET lock_version = lock_version + 1
              WHERE id = ?
              RETURNING *",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found("request", id))?;

        debug!(request_id = id, lock_version = request.lock_version, "request locked");

        Ok(Self {
            tx,
            original: request.clone(),
            request,
        })
    }

    /// The request as it will be written on commit.
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Mutable view of the pending request state.
    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    /// The request as it was when the lock was taken.
    #[must_use]
    pub fn original(&self) -> &Request {
        &self.original
    }

    /// Lists the request's search results in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn search_results(&mut self) -> Result<Vec<SearchResult>> {
        let results = sqlx::query_as::<_, SearchResult>(
            r"SELECT * FROM search_results WHERE request_id = ? ORDER BY id ASC",
        )
        .bind(self.request.id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(results)
    }

    /// Returns the currently selected search result, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn selected_search_result(&mut self) -> Result<Option<SearchResult>> {
        let result = sqlx::query_as::<_, SearchResult>(
            r"SELECT * FROM search_results WHERE request_id = ? AND status = ?",
        )
        .bind(self.request.id)
        .bind(SearchResultStatus::Selected.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(result)
    }

    /// Deletes every search result of the request and inserts `results`.
    ///
    /// A guid repeated within `results` keeps its first occurrence.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if any statement fails.
    pub async fn replace_search_results(
        &mut self,
        results: &[NewSearchResult],
    ) -> Result<Vec<SearchResult>> {
        let deleted = sqlx::query(r"DELETE FROM search_results WHERE request_id = ?")
            .bind(self.request.id)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

        for result in results {
            sqlx::query(
                r"INSERT INTO search_results (
                    request_id, guid, title, indexer, size_bytes, seeders, leechers,
                    download_url, magnet_url, published_at, status
                  )
                  VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                  ON CONFLICT (request_id, guid) DO NOTHING",
            )
            .bind(self.request.id)
            .bind(&result.guid)
            .bind(&result.title)
            .bind(&result.indexer)
            .bind(result.size_bytes)
            .bind(result.seeders)
            .bind(result.leechers)
            .bind(result.download_url.as_deref())
            .bind(result.magnet_url.as_deref())
            .bind(result.published_at)
            .bind(SearchResultStatus::Pending.as_str())
            .execute(&mut *self.tx)
            .await?;
        }

        debug!(
            request_id = self.request.id,
            deleted,
            inserted = results.len(),
            "search results replaced"
        );

        self.search_results().await
    }

    /// Marks `result_id` selected and every sibling rejected.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the result does not belong to this request.
    pub async fn select_search_result(&mut self, result_id: i64) -> Result<()> {
        sqlx::query(
            r"UPDATE search_results SET status = ?
              WHERE request_id = ? AND id != ?",
        )
        .bind(SearchResultStatus::Rejected.as_str())
        .bind(self.request.id)
        .bind(result_id)
        .execute(&mut *self.tx)
        .await?;

        let selected = sqlx::query(
            r"UPDATE search_results SET status = ?
              WHERE request_id = ? AND id = ?",
        )
        .bind(SearchResultStatus::Selected.as_str())
        .bind(self.request.id)
        .bind(result_id)
        .execute(&mut *self.tx)
        .await?;

        super::error::check_affected("search result", result_id, selected.rows_affected())
    }

    /// Lists every download attempt of the request, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn downloads(&mut self) -> Result<Vec<Download>> {
        let downloads = sqlx::query_as::<_, Download>(
            r"SELECT * FROM downloads WHERE request_id = ? ORDER BY id DESC",
        )
        .bind(self.request.id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(downloads)
    }

    /// Appends a new `queued` download attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    pub async fn insert_download(&mut self, download: &NewDownload) -> Result<Download> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, Download>(
            r"INSERT INTO downloads (
                request_id, search_result_id, kind, source_url, name, size_bytes,
                status, progress, created_at, updated_at
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
              RETURNING *",
        )
        .bind(download.request_id)
        .bind(download.search_result_id)
        .bind(download.kind.as_str())
        .bind(&download.source_url)
        .bind(&download.name)
        .bind(download.size_bytes)
        .bind(DownloadStatus::Queued.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    /// Fails every queued/downloading/paused download and returns them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn fail_active_downloads(&mut self, reason: &str) -> Result<Vec<Download>> {
        let rows = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = ?, error_message = ?, updated_at = ?
              WHERE request_id = ? AND status IN (?, ?, ?)
              RETURNING *",
        )
        .bind(DownloadStatus::Failed.as_str())
        .bind(reason)
        .bind(Utc::now())
        .bind(self.request.id)
        .bind(DownloadStatus::Queued.as_str())
        .bind(DownloadStatus::Downloading.as_str())
        .bind(DownloadStatus::Paused.as_str())
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    /// Writes the pending request state and commits.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update or commit fails; nothing
    /// is applied in that case.
    pub async fn commit(mut self) -> Result<Request> {
        let request = &self.request;
        let saved = sqlx::query_as::<_, Request>(
            r"UPDATE requests
              SET status = ?,
                  retry_count = ?,
                  next_retry_at = ?,
                  attention_needed = ?,
                  issue_description = ?,
                  completed_at = ?,
                  updated_at = ?
              WHERE id = ?
              RETURNING *",
        )
        .bind(request.status.as_str())
        .bind(request.retry_count)
        .bind(request.next_retry_at)
        .bind(request.attention_needed)
        .bind(request.issue_description.as_deref())
        .bind(request.completed_at)
        .bind(Utc::now())
        .bind(request.id)
        .fetch_one(&mut *self.tx)
        .await?;

        self.tx.commit().await?;
        Ok(saved)
    }
}

impl std::fmt::Debug for LockedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedRequest")
            .field("request_id", &self.request.id)
            .field("status", &self.request.status)
            .finish_non_exhaustive()
    }
}
