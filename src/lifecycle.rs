//! The request state machine.
//!
//! ```text
//! pending -> searching -> downloading -> processing -> completed
//!               |                            ^
//!               v                            |
//!           not_found -> pending      (any non-terminal) -> failed
//! ```
//!
//! Every mutator here takes the request lock, applies its whole transition,
//! and commits or rolls back as a unit. Adapter and indexer calls always run
//! after the lock is released.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendProvider, BackendState};
use crate::config::{SearchSettings, Settings};
use crate::duplicate::{DuplicateGuard, DuplicateTarget, DuplicateVerdict};
use crate::error::AcquisitionError;
use crate::events::{EventBus, LifecycleEvent};
use crate::indexer::{RawRelease, ReleaseIndexer, SearchError, SearchQuery};
use crate::orchestrator::DownloadOrchestrator;
use crate::postprocess::{PostProcessOutcome, PostProcessor};
use crate::ranking::SearchResultRanker;
use crate::retry::{RetryOutcome, RetryScheduler};
use crate::store::{
    BookFormat, Download, DownloadObservation, DownloadStatus, LockedRequest, NewBook,
    NewRequest, Request, RequestStatus, SearchResult, Store, StoreError,
};

type Result<T> = std::result::Result<T, AcquisitionError>;

/// A new ask for one book in one format.
#[derive(Debug, Clone)]
pub struct RequestIntake {
    pub username: String,
    pub book: NewBook,
    pub format: BookFormat,
    pub language: Option<String>,
}

/// A created request and the duplicate warning it passed with, if any.
#[derive(Debug, Clone)]
pub struct CreatedRequest {
    pub request: Request,
    pub warning: Option<String>,
}

/// What [`RequestLifecycle::run_search`] did.
#[derive(Debug, Clone)]
pub enum SearchOutcome {
    /// The request was not `pending`.
    NotStarted,
    /// The indexer was unreachable; the request is `pending` again.
    Requeued,
    /// Nothing downloadable came back.
    NoResults(RetryOutcome),
    /// Results are stored and wait for a manual choice.
    AwaitingSelection { downloadable: usize },
    /// The best result was selected and its download created.
    Selected(Download),
    /// The request changed state while the search ran; results were discarded.
    Abandoned,
}

/// What [`RequestLifecycle::retry_now`] did.
#[derive(Debug, Clone)]
pub enum RetryNowOutcome {
    /// A new download of the selected result was created and dispatched.
    Redispatched(Download),
    /// The request is `pending` and will be searched again.
    Restarted,
}

/// What polling one download led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Unchanged,
    Progressed,
    Completed,
    Failed,
    /// The backend could not be reached.
    Unreachable,
}

/// Owns every legal transition of a request.
#[derive(Clone)]
pub struct RequestLifecycle {
    store: Store,
    orchestrator: DownloadOrchestrator,
    retry: RetryScheduler,
    duplicates: DuplicateGuard,
    ranker: SearchResultRanker,
    post_processor: Arc<dyn PostProcessor>,
    search: SearchSettings,
    events: EventBus,
}

impl std::fmt::Debug for RequestLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLifecycle")
            .field("ranker", &self.ranker)
            .field("search", &self.search)
            .finish_non_exhaustive()
    }
}

fn set_status(request: &mut Request, status: RequestStatus) {
    request.status = status;
    if status != RequestStatus::NotFound {
        request.next_retry_at = None;
    }
}

fn clear_attention(request: &mut Request) {
    request.attention_needed = false;
    request.issue_description = None;
}

impl RequestLifecycle {
    /// Wires the lifecycle and its components from `settings`.
    #[must_use]
    pub fn new(
        store: Store,
        provider: Arc<dyn BackendProvider>,
        post_processor: Arc<dyn PostProcessor>,
        settings: &Settings,
        events: EventBus,
    ) -> Self {
        Self {
            orchestrator: DownloadOrchestrator::new(
                store.clone(),
                provider,
                events.clone(),
                settings.backends,
            ),
            retry: RetryScheduler::new(store.clone(), settings.retry, events.clone()),
            duplicates: DuplicateGuard::new(store.clone(), settings.duplicates),
            ranker: SearchResultRanker::new(settings.search.preferred_download_type),
            post_processor,
            search: settings.search,
            events,
            store,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    #[must_use]
    pub fn orchestrator(&self) -> &DownloadOrchestrator {
        &self.orchestrator
    }

    #[must_use]
    pub fn retry_scheduler(&self) -> &RetryScheduler {
        &self.retry
    }

    async fn lock(&self, request_id: i64) -> Result<LockedRequest> {
        Ok(self.store.lock_request(request_id).await?)
    }

    async fn commit(&self, locked: LockedRequest) -> Result<Request> {
        let before = locked.original().clone();
        let saved = locked.commit().await?;
        self.events.publish_changes(&before, &saved);
        Ok(saved)
    }

    // ==================== Intake ====================

    /// Creates a `pending` request unless a duplicate check blocks it.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::DuplicateBlocked`] on a blocking conflict,
    /// [`AcquisitionError::Validation`] for an empty title or identity, or
    /// [`AcquisitionError::Store`] if persistence fails.
    #[instrument(skip(self, intake), fields(source = %intake.book.source, source_id = %intake.book.source_id, format = %intake.format))]
    pub async fn create_request(&self, intake: RequestIntake) -> Result<CreatedRequest> {
        if intake.book.title.trim().is_empty() {
            return Err(AcquisitionError::validation("book title is required"));
        }
        if intake.book.source.trim().is_empty() || intake.book.source_id.trim().is_empty() {
            return Err(AcquisitionError::validation("book source and source id are required"));
        }
        if intake.username.trim().is_empty() {
            return Err(AcquisitionError::validation("username is required"));
        }

        let target = DuplicateTarget {
            source: intake.book.source.clone(),
            source_id: intake.book.source_id.clone(),
            title: intake.book.title.clone(),
            author: intake.book.author.clone(),
            format: intake.format,
            language: intake.language.clone(),
        };
        let warning = match self.duplicates.check(&target).await? {
            DuplicateVerdict::Allow => None,
            DuplicateVerdict::Warn { reason, .. } => Some(reason),
            DuplicateVerdict::Block { reason, .. } => {
                info!(reason = %reason, "request refused as duplicate");
                return Err(AcquisitionError::DuplicateBlocked { reason });
            }
        };

        let user_id = self.store.ensure_user(intake.username.trim()).await?;
        let book = self.store.upsert_book(&intake.book).await?;
        let request = self
            .store
            .insert_request(&NewRequest {
                book_id: book.id,
                user_id,
                format: intake.format,
                language: intake.language,
            })
            .await?;

        info!(request_id = request.id, title = %book.title, "request created");
        self.events.publish(LifecycleEvent::RequestCreated {
            request_id: request.id,
        });
        Ok(CreatedRequest { request, warning })
    }

    // ==================== Search ====================

    /// Moves a `pending` request to `searching`; `false` in any other status.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::RequestNotFound`] or a store error.
    #[instrument(skip(self))]
    pub async fn start_search(&self, request_id: i64) -> Result<bool> {
        let mut locked = self.lock(request_id).await?;
        if locked.request().status != RequestStatus::Pending {
            return Ok(false);
        }
        set_status(locked.request_mut(), RequestStatus::Searching);
        self.commit(locked).await?;
        Ok(true)
    }

    /// Replaces a `searching` request's results with `releases`.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::Validation`] if the request is no longer
    /// `searching`.
    #[instrument(skip(self, releases), fields(count = releases.len()))]
    pub async fn record_search_results(
        &self,
        request_id: i64,
        releases: Vec<RawRelease>,
    ) -> Result<Vec<SearchResult>> {
        let mut locked = self.lock(request_id).await?;
        let status = locked.request().status;
        if status != RequestStatus::Searching {
            return Err(AcquisitionError::validation(format!(
                "request {request_id} is {status}, not searching"
            )));
        }

        let normalized: Vec<_> = releases.into_iter().map(RawRelease::normalize).collect();
        let results = locked.replace_search_results(&normalized).await?;
        self.commit(locked).await?;
        Ok(results)
    }

    /// Runs one full search pass for a `pending` request.
    ///
    /// # Errors
    ///
    /// Returns store errors only; indexer and adapter failures are folded into
    /// the returned [`SearchOutcome`]. A request whose search errors out is
    /// returned to `pending` before the error is passed on.
    #[instrument(skip(self, indexer))]
    pub async fn run_search(
        &self,
        request_id: i64,
        indexer: &dyn ReleaseIndexer,
    ) -> Result<SearchOutcome> {
        if !self.start_search(request_id).await? {
            return Ok(SearchOutcome::NotStarted);
        }

        match self.search_started(request_id, indexer).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                warn!(error = %error, "search aborted; request returned to pending");
                if let Err(restore) = self.return_to_pending(request_id).await {
                    warn!(error = %restore, "could not return request to pending");
                }
                Err(error)
            }
        }
    }

    async fn search_started(
        &self,
        request_id: i64,
        indexer: &dyn ReleaseIndexer,
    ) -> Result<SearchOutcome> {
        let query = self.query_for(request_id).await?;
        let searched = tokio::time::timeout(self.search.timeout(), indexer.search(&query))
            .await
            .unwrap_or_else(|_| {
                Err(SearchError::Connection {
                    message: format!("no answer within {}s", self.search.timeout_secs),
                })
            });

        let releases = match searched {
            Ok(releases) => releases,
            Err(error) if error.is_connection() => {
                warn!(error = %error, "indexer unreachable; request returned to pending");
                self.return_to_pending(request_id).await?;
                return Ok(SearchOutcome::Requeued);
            }
            Err(error) => {
                warn!(error = %error, "search failed");
                return Ok(SearchOutcome::NoResults(
                    self.retry.schedule_retry(request_id).await?,
                ));
            }
        };

        let results = match self.record_search_results(request_id, releases).await {
            Ok(results) => results,
            Err(AcquisitionError::Validation(reason)) => {
                info!(reason = %reason, "search results discarded");
                return Ok(SearchOutcome::Abandoned);
            }
            Err(error) => return Err(error),
        };

        let Some(best) = self.ranker.best(&results) else {
            info!(total = results.len(), "no downloadable results");
            return Ok(SearchOutcome::NoResults(
                self.retry.schedule_retry(request_id).await?,
            ));
        };

        if !self.search.auto_select {
            let downloadable = results.iter().filter(|r| r.is_downloadable()).count();
            info!(downloadable, "results awaiting manual selection");
            return Ok(SearchOutcome::AwaitingSelection { downloadable });
        }

        let download = match self.select_locked(request_id, best.id).await {
            Ok(download) => download,
            Err(AcquisitionError::Validation(reason)) => {
                info!(reason = %reason, "auto-selection skipped");
                return Ok(SearchOutcome::Abandoned);
            }
            Err(error) => return Err(error),
        };
        info!(result_id = best.id, download_id = download.id, "best result auto-selected");
        self.dispatch_download(&download).await?;
        Ok(SearchOutcome::Selected(download))
    }

    async fn query_for(&self, request_id: i64) -> Result<SearchQuery> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or(AcquisitionError::RequestNotFound(request_id))?;
        let book = self.store.get_book(request.book_id).await?.ok_or_else(|| {
            AcquisitionError::validation(format!("book {} of request {request_id} is missing", request.book_id))
        })?;
        Ok(SearchQuery {
            title: book.title,
            author: book.author,
            format: request.format,
            language: request.language,
        })
    }

    async fn return_to_pending(&self, request_id: i64) -> Result<()> {
        let mut locked = self.lock(request_id).await?;
        if locked.request().status == RequestStatus::Searching {
            set_status(locked.request_mut(), RequestStatus::Pending);
            self.commit(locked).await?;
        }
        Ok(())
    }

    /// Returns `searching` requests that never got results back to `pending`.
    ///
    /// A search counts as stalled once it has gone twice the search timeout
    /// without recording anything, which only happens when the process that
    /// ran it died. Returns how many requests were requeued.
    ///
    /// # Errors
    ///
    /// Returns a store error if the stalled list cannot be read.
    #[instrument(skip(self))]
    pub async fn requeue_stalled_searches(&self, now: DateTime<Utc>) -> Result<usize> {
        let stall = TimeDelta::from_std(self.search.timeout().saturating_mul(2))
            .unwrap_or(TimeDelta::MAX);
        let cutoff = now.checked_sub_signed(stall).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut requeued = 0;
        for request in self.store.list_stalled_searches(cutoff).await? {
            let mut locked = self.lock(request.id).await?;
            let current = locked.request();
            if current.status != RequestStatus::Searching || current.updated_at >= cutoff {
                continue;
            }
            if !locked.search_results().await?.is_empty() {
                continue;
            }
            set_status(locked.request_mut(), RequestStatus::Pending);
            self.commit(locked).await?;
            info!(request_id = request.id, "stalled search requeued");
            requeued += 1;
        }
        Ok(requeued)
    }

    /// Requeues a `not_found` request whose retry time has passed.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::RequestNotFound`] or a store error.
    #[instrument(skip(self))]
    pub async fn requeue_due(&self, request_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut locked = self.lock(request_id).await?;
        let request = locked.request();
        let due = request.status == RequestStatus::NotFound
            && request.next_retry_at.is_some_and(|at| at <= now);
        if !due {
            return Ok(false);
        }
        set_status(locked.request_mut(), RequestStatus::Pending);
        self.commit(locked).await?;
        info!("request requeued for search");
        Ok(true)
    }

    // ==================== Operator mutators ====================

    /// Selects a search result and dispatches a download for it.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::Validation`] if the result is foreign or
    /// not downloadable, or the request cannot take a download right now;
    /// nothing changes in that case. Dispatch failures are returned after the
    /// selection is committed; the queued download is picked up by the
    /// dispatch sweep.
    #[instrument(skip(self))]
    pub async fn select_result(&self, request_id: i64, result_id: i64) -> Result<Download> {
        let download = self.select_locked(request_id, result_id).await?;
        self.orchestrator.dispatch(download.id).await
    }

    async fn select_locked(&self, request_id: i64, result_id: i64) -> Result<Download> {
        let mut locked = self.lock(request_id).await?;
        let status = locked.request().status;
        if status.is_terminal() || status == RequestStatus::Processing {
            return Err(AcquisitionError::validation(format!(
                "request {request_id} is {status}; results can no longer be selected"
            )));
        }

        let result = locked
            .search_results()
            .await?
            .into_iter()
            .find(|result| result.id == result_id)
            .ok_or_else(|| {
                AcquisitionError::validation(format!(
                    "search result {result_id} does not belong to request {request_id}"
                ))
            })?;
        if !result.is_downloadable() {
            return Err(AcquisitionError::validation(format!(
                "search result {result_id} has no download or magnet link"
            )));
        }
        if let Some(active) = locked.downloads().await?.iter().find(|d| d.status.is_active()) {
            return Err(AcquisitionError::validation(format!(
                "request {request_id} already has active download {}",
                active.id
            )));
        }

        locked.select_search_result(result.id).await?;
        let download = self.orchestrator.create_download(&mut locked, &result).await?;
        let request = locked.request_mut();
        set_status(request, RequestStatus::Downloading);
        clear_attention(request);
        self.commit(locked).await?;
        Ok(download)
    }

    /// Retries a request right away.
    ///
    /// When the selected result's latest download failed, its backend job is
    /// removed and a new download of the same result is dispatched; otherwise
    /// the request goes back to `pending`. Either way the retry time and
    /// attention flag are cleared.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::Validation`] for a completed request.
    /// Dispatch failures of the new download are returned after commit.
    #[instrument(skip(self))]
    pub async fn retry_now(&self, request_id: i64) -> Result<RetryNowOutcome> {
        let mut locked = self.lock(request_id).await?;
        if locked.request().status == RequestStatus::Completed {
            return Err(AcquisitionError::validation(format!(
                "request {request_id} is completed; nothing to retry"
            )));
        }

        let selected = locked.selected_search_result().await?;
        let downloads = locked.downloads().await?;
        let failed_attempt = selected.as_ref().and_then(|result| {
            downloads
                .iter()
                .find(|d| d.search_result_id == Some(result.id))
                .filter(|d| d.status == DownloadStatus::Failed)
                .cloned()
        });
        let redownload = selected.filter(|result| result.is_downloadable() && failed_attempt.is_some());
        // The failed job still holds the same hash on the backend.
        let stale: Vec<Download> = if redownload.is_some() {
            failed_attempt.into_iter().collect()
        } else {
            Vec::new()
        };

        let superseded = locked.fail_active_downloads("superseded by retry").await?;
        let download = match redownload {
            Some(result) => {
                let download = self.orchestrator.create_download(&mut locked, &result).await?;
                set_status(locked.request_mut(), RequestStatus::Downloading);
                Some(download)
            }
            None => {
                set_status(locked.request_mut(), RequestStatus::Pending);
                None
            }
        };
        let request = locked.request_mut();
        request.next_retry_at = None;
        clear_attention(request);
        self.commit(locked).await?;
        self.remove_jobs(&superseded).await;
        self.remove_jobs(&stale).await;

        match download {
            Some(download) => {
                info!(download_id = download.id, "failed download retried");
                Ok(RetryNowOutcome::Redispatched(
                    self.orchestrator.dispatch(download.id).await?,
                ))
            }
            None => {
                info!("request restarted from search");
                Ok(RetryNowOutcome::Restarted)
            }
        }
    }

    /// Cancels a request and fails its active downloads.
    ///
    /// Backend jobs are removed after the local transition commits; a removal
    /// failure is logged only. A terminal request is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::RequestNotFound`] or a store error.
    #[instrument(skip(self))]
    pub async fn cancel(&self, request_id: i64) -> Result<Request> {
        let mut locked = self.lock(request_id).await?;
        if locked.request().status.is_terminal() {
            debug!(status = %locked.request().status, "cancel of terminal request ignored");
            return Ok(locked.request().clone());
        }

        let cancelled = locked.fail_active_downloads("cancelled").await?;
        let request = locked.request_mut();
        set_status(request, RequestStatus::Failed);
        clear_attention(request);
        let saved = self.commit(locked).await?;
        info!(downloads = cancelled.len(), "request cancelled");

        self.remove_jobs(&cancelled).await;
        Ok(saved)
    }

    /// Deletes a failed request that never acquired anything.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::Validation`] when the request is not an
    /// orphan (not failed, or it has a completed download).
    #[instrument(skip(self))]
    pub async fn purge(&self, request_id: i64) -> Result<()> {
        match self.store.delete_orphaned_request(request_id).await {
            Ok(()) => {
                info!("orphaned request deleted");
                Ok(())
            }
            Err(StoreError::NotFound { .. }) => Err(AcquisitionError::validation(format!(
                "request {request_id} is not a failed request without a completed download"
            ))),
            Err(error) => Err(error.into()),
        }
    }

    /// Marks a request `completed`.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::Validation`] for a failed request.
    #[instrument(skip(self))]
    pub async fn complete(&self, request_id: i64) -> Result<Request> {
        let mut locked = self.lock(request_id).await?;
        match locked.request().status {
            RequestStatus::Completed => return Ok(locked.request().clone()),
            RequestStatus::Failed => {
                return Err(AcquisitionError::validation(format!(
                    "request {request_id} failed and cannot be completed"
                )));
            }
            _ => {}
        }

        let request = locked.request_mut();
        set_status(request, RequestStatus::Completed);
        request.completed_at = Some(Utc::now());
        clear_attention(request);
        let saved = self.commit(locked).await?;
        info!("request completed");
        Ok(saved)
    }

    /// Flags a request for human attention without changing its status.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::Validation`] for a completed request.
    #[instrument(skip(self))]
    pub async fn mark_for_attention(&self, request_id: i64, description: &str) -> Result<Request> {
        let mut locked = self.lock(request_id).await?;
        if locked.request().status == RequestStatus::Completed {
            return Err(AcquisitionError::validation(format!(
                "request {request_id} is completed"
            )));
        }
        let request = locked.request_mut();
        request.attention_needed = true;
        request.issue_description = Some(description.to_string());
        self.commit(locked).await
    }

    /// Clears the attention flag without changing status.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::RequestNotFound`] or a store error.
    #[instrument(skip(self))]
    pub async fn clear_attention(&self, request_id: i64) -> Result<Request> {
        let mut locked = self.lock(request_id).await?;
        clear_attention(locked.request_mut());
        self.commit(locked).await
    }

    /// Moves a `downloading` request to `processing`; `false` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::RequestNotFound`] or a store error.
    #[instrument(skip(self))]
    pub async fn mark_processing(&self, request_id: i64) -> Result<bool> {
        let mut locked = self.lock(request_id).await?;
        if locked.request().status != RequestStatus::Downloading {
            return Ok(false);
        }
        set_status(locked.request_mut(), RequestStatus::Processing);
        self.commit(locked).await?;
        Ok(true)
    }

    // ==================== Background paths ====================

    /// Dispatches a queued download on behalf of a worker.
    ///
    /// Returns `true` once a backend accepted it. Connection failures leave it
    /// queued for the next sweep; a refusal or a missing client fails the
    /// download and flags the request.
    ///
    /// # Errors
    ///
    /// Returns store errors only.
    pub async fn dispatch_download(&self, download: &Download) -> Result<bool> {
        match self.orchestrator.dispatch(download.id).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_connection() => {
                warn!(download_id = download.id, error = %error, "dispatch deferred");
                Ok(false)
            }
            Err(error @ (AcquisitionError::Backend(_) | AcquisitionError::NoClient { .. })) => {
                warn!(download_id = download.id, error = %error, "dispatch failed");
                self.flag_download_failure(download, &error.to_string()).await?;
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    /// Polls one dispatched download and reacts to what the backend reports.
    ///
    /// # Errors
    ///
    /// Returns store errors only; adapter failures are logged.
    #[instrument(skip(self, download), fields(download_id = download.id, request_id = download.request_id))]
    pub async fn poll_download(&self, download: &Download) -> Result<PollOutcome> {
        let observation = match self.orchestrator.poll(download).await {
            Ok(status) => DownloadObservation {
                status: status.state.into(),
                progress: status.progress,
                download_path: status.download_path,
                error_message: (status.state == BackendState::Failed).then(|| {
                    status
                        .message
                        .unwrap_or_else(|| "backend reported failure".to_string())
                }),
            },
            Err(error) if error.is_not_found() => DownloadObservation {
                status: DownloadStatus::Failed,
                progress: u8::try_from(download.progress.clamp(0, 100)).unwrap_or(0),
                download_path: None,
                error_message: Some("job no longer exists on the download client".to_string()),
            },
            Err(error) if error.is_connection() => {
                warn!(error = %error, "download client unreachable; poll skipped");
                return Ok(PollOutcome::Unreachable);
            }
            Err(error) => {
                warn!(error = %error, "poll failed");
                self.store
                    .record_download_error(download.id, &error.to_string())
                    .await?;
                return Ok(PollOutcome::Unchanged);
            }
        };

        if !self
            .store
            .apply_download_observation(download.id, &observation)
            .await?
        {
            return Ok(PollOutcome::Unchanged);
        }
        debug!(status = %observation.status, progress = observation.progress, "download observed");
        self.events.publish(LifecycleEvent::DownloadProgress {
            request_id: download.request_id,
            download_id: download.id,
            status: observation.status,
            progress: observation.progress,
        });

        match observation.status {
            DownloadStatus::Completed => {
                self.handle_completion(download.id).await?;
                Ok(PollOutcome::Completed)
            }
            DownloadStatus::Failed => {
                let reason = observation.error_message.as_deref().unwrap_or("download failed");
                self.flag_download_failure(download, reason).await?;
                Ok(PollOutcome::Failed)
            }
            _ => Ok(PollOutcome::Progressed),
        }
    }

    /// Moves the request of a completed download to `processing` and hands it
    /// to the post-processor. Returns `false` if the request was not
    /// `downloading`.
    ///
    /// # Errors
    ///
    /// Returns store errors only.
    #[instrument(skip(self))]
    pub async fn handle_completion(&self, download_id: i64) -> Result<bool> {
        let download = self.store.get_download(download_id).await?.ok_or_else(|| {
            AcquisitionError::validation(format!("download {download_id} does not exist"))
        })?;
        if !self.mark_processing(download.request_id).await? {
            return Ok(false);
        }
        let request = self
            .store
            .get_request(download.request_id)
            .await?
            .ok_or(AcquisitionError::RequestNotFound(download.request_id))?;

        match self.post_processor.process(&request, &download).await {
            Ok(PostProcessOutcome::Delivered { location }) => {
                info!(location = %location, "download delivered");
                self.complete(request.id).await?;
            }
            Ok(PostProcessOutcome::Deferred) => {
                info!("post-processing deferred");
            }
            Err(error) => {
                warn!(error = %error, "post-processing failed");
                self.mark_for_attention(request.id, &error.to_string()).await?;
            }
        }
        Ok(true)
    }

    async fn flag_download_failure(&self, download: &Download, reason: &str) -> Result<bool> {
        let mut locked = self.lock(download.request_id).await?;
        if locked.request().status.is_terminal() {
            return Ok(false);
        }
        let latest = locked.downloads().await?.first().map(|d| d.id);
        if latest != Some(download.id) {
            debug!(download_id = download.id, "failure of superseded download ignored");
            return Ok(false);
        }

        locked.fail_active_downloads(reason).await?;
        let request = locked.request_mut();
        request.attention_needed = true;
        request.issue_description = Some(format!("Download {} failed: {reason}", download.id));
        self.commit(locked).await?;
        Ok(true)
    }

    async fn remove_jobs(&self, downloads: &[Download]) {
        for download in downloads.iter().filter(|d| d.external_id.is_some()) {
            match self.orchestrator.remove(download, true).await {
                Ok(removed) => debug!(download_id = download.id, removed, "backend job removed"),
                Err(error) => {
                    warn!(download_id = download.id, error = %error, "could not remove backend job");
                }
            }
        }
    }

    // ==================== Reads ====================

    /// Gets a request or fails with [`AcquisitionError::RequestNotFound`].
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::RequestNotFound`] or a store error.
    pub async fn request(&self, request_id: i64) -> Result<Request> {
        self.store
            .get_request(request_id)
            .await?
            .ok_or(AcquisitionError::RequestNotFound(request_id))
    }

    /// Requests flagged for human attention.
    ///
    /// # Errors
    ///
    /// Returns a store error if the query fails.
    pub async fn requests_needing_attention(&self) -> Result<Vec<Request>> {
        Ok(self.store.list_requests_needing_attention().await?)
    }

    /// Requests waiting for a manual result choice.
    ///
    /// # Errors
    ///
    /// Returns a store error if the query fails.
    pub async fn requests_awaiting_selection(&self) -> Result<Vec<Request>> {
        Ok(self.store.list_requests_awaiting_selection().await?)
    }

    /// `not_found` requests whose retry time is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the query fails.
    pub async fn requests_retry_due(&self, now: DateTime<Utc>) -> Result<Vec<Request>> {
        Ok(self.store.list_requests_retry_due(now).await?)
    }

    /// A request's search results, best first.
    ///
    /// # Errors
    ///
    /// Returns a store error if the query fails.
    pub async fn ranked_results(&self, request_id: i64) -> Result<Vec<SearchResult>> {
        let results = self.store.list_search_results(request_id).await?;
        Ok(self.ranker.rank(&results).into_iter().cloned().collect())
    }

    /// A request's download attempts, newest first.
    ///
    /// # Errors
    ///
    /// Returns a store error if the query fails.
    pub async fn downloads(&self, request_id: i64) -> Result<Vec<Download>> {
        Ok(self.store.list_downloads(request_id).await?)
    }
}
