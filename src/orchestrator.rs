//! Creates download attempts and drives them through backend adapters.
//!
//! The orchestrator owns the boundary between local state and the network.
//! [`DownloadOrchestrator::create_download`] runs inside a request lock and
//! never touches the network; everything else runs outside any lock and wraps
//! each adapter call in a deadline that converts to a connection error.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::backend::{
    BackendError, BackendProvider, BackendStatus, BackendTimeouts, DownloadBackend, DownloadSpec,
};
use crate::error::AcquisitionError;
use crate::events::{EventBus, LifecycleEvent};
use crate::store::{
    Download, DownloadClient, DownloadStatus, LockedRequest, NewDownload, SearchResult, Store,
};

/// Creates, dispatches, polls, and removes downloads.
#[derive(Clone)]
pub struct DownloadOrchestrator {
    store: Store,
    provider: Arc<dyn BackendProvider>,
    events: EventBus,
    deadline: Duration,
}

impl std::fmt::Debug for DownloadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOrchestrator")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl DownloadOrchestrator {
    /// Creates an orchestrator whose adapter calls are bounded by `timeouts`.
    #[must_use]
    pub fn new(
        store: Store,
        provider: Arc<dyn BackendProvider>,
        events: EventBus,
        timeouts: BackendTimeouts,
    ) -> Self {
        Self {
            store,
            provider,
            events,
            deadline: timeouts.operation_deadline(),
        }
    }

    /// Appends a `queued` download for `result` inside the caller's lock.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::Validation`] if `result` has no fetch link,
    /// or [`AcquisitionError::Store`] if the insert fails.
    pub async fn create_download(
        &self,
        locked: &mut LockedRequest,
        result: &SearchResult,
    ) -> Result<Download, AcquisitionError> {
        let (Some(kind), Some(link)) = (result.kind(), result.fetch_link()) else {
            return Err(AcquisitionError::validation(format!(
                "search result {} has no download or magnet link",
                result.id
            )));
        };

        let download = locked
            .insert_download(&NewDownload {
                request_id: locked.request().id,
                search_result_id: Some(result.id),
                kind,
                source_url: link.to_string(),
                name: result.title.clone(),
                size_bytes: result.size_bytes,
            })
            .await?;
        debug!(download_id = download.id, kind = %kind, "download created");
        Ok(download)
    }

    /// Hands a queued download to the first enabled client of its kind.
    ///
    /// Clients are tried in ascending priority; a connection failure moves on
    /// to the next client, a rejection stops. Every failure is recorded on the
    /// download row and the download stays `queued`. A job accepted after the
    /// download was cancelled or superseded is removed again.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::NoClient`] when no client is enabled for the
    /// download's kind, [`AcquisitionError::Connection`] when no client could be
    /// reached, and [`AcquisitionError::Backend`] when a client refused.
    #[instrument(skip(self))]
    pub async fn dispatch(&self, download_id: i64) -> Result<Download, AcquisitionError> {
        let download = self
            .store
            .get_download(download_id)
            .await?
            .ok_or_else(|| AcquisitionError::validation(format!("download {download_id} does not exist")))?;

        if download.status != DownloadStatus::Queued || download.external_id.is_some() {
            debug!(status = %download.status, "download already dispatched");
            return Ok(download);
        }

        let result = self.dispatch_to_clients(&download).await;
        match result {
            Ok(dispatched) => Ok(dispatched),
            Err(error) => {
                self.store
                    .record_download_error(download.id, &error.to_string())
                    .await?;
                Err(error)
            }
        }
    }

    async fn dispatch_to_clients(&self, download: &Download) -> Result<Download, AcquisitionError> {
        let clients = self.store.enabled_clients(download.kind).await?;
        if clients.is_empty() {
            return Err(AcquisitionError::NoClient { kind: download.kind });
        }

        let spec = DownloadSpec {
            source_url: download.source_url.clone(),
            name: download.name.clone(),
            category: None,
            tag: DownloadSpec::tag_for(download.id),
        };

        let mut last_error = None;
        for client in &clients {
            let spec = DownloadSpec {
                category: client.category.clone(),
                ..spec.clone()
            };
            let backend = match self.provider.backend_for(client) {
                Ok(backend) => backend,
                Err(error) if error.is_connection() => {
                    warn!(client = %client.name, error = %error, "client unreachable; trying next");
                    last_error = Some(error);
                    continue;
                }
                Err(error) => {
                    warn!(client = %client.name, error = %error, "client refused download");
                    return Err(error.into());
                }
            };

            match self.bounded(client, backend.add(&spec)).await {
                Ok(external_id) => {
                    let recorded = self
                        .store
                        .record_dispatch(download.id, client.id, &external_id)
                        .await?;
                    if !recorded {
                        warn!(download_id = download.id, "download changed while dispatching; removing job");
                        if let Err(error) = self.bounded(client, backend.remove(&external_id, true)).await {
                            warn!(download_id = download.id, error = %error, "could not remove backend job");
                        }
                        return self.reload(download.id).await;
                    }
                    info!(
                        download_id = download.id,
                        client = %client.name,
                        external_id = %external_id,
                        "download dispatched"
                    );
                    self.events.publish(LifecycleEvent::DownloadDispatched {
                        request_id: download.request_id,
                        download_id: download.id,
                        kind: download.kind,
                        external_id,
                    });
                    return self.reload(download.id).await;
                }
                Err(error) if error.is_connection() => {
                    warn!(client = %client.name, error = %error, "client unreachable; trying next");
                    last_error = Some(error);
                }
                Err(error) => {
                    warn!(client = %client.name, error = %error, "client refused download");
                    return Err(error.into());
                }
            }
        }

        Err(last_error.map_or(AcquisitionError::NoClient { kind: download.kind }, AcquisitionError::from))
    }

    async fn reload(&self, download_id: i64) -> Result<Download, AcquisitionError> {
        self.store
            .get_download(download_id)
            .await?
            .ok_or_else(|| AcquisitionError::validation(format!("download {download_id} vanished")))
    }

    /// Asks the download's backend for its current state.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotFound`] when the job is gone, or another
    /// [`BackendError`] (connection failures included) from the adapter.
    pub async fn poll(&self, download: &Download) -> Result<BackendStatus, BackendError> {
        let (client, backend, external_id) = self.backend_of(download).await?;
        self.bounded(&client, backend.status(&external_id)).await
    }

    /// Removes a download's backend job.
    ///
    /// # Errors
    ///
    /// Returns the adapter's [`BackendError`]; callers treat removal as best effort.
    pub async fn remove(&self, download: &Download, delete_files: bool) -> Result<bool, BackendError> {
        if download.external_id.is_none() {
            return Ok(false);
        }
        let (client, backend, external_id) = self.backend_of(download).await?;
        self.bounded(&client, backend.remove(&external_id, delete_files)).await
    }

    /// Runs a client's connection test.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::Validation`] for an unknown client, or a
    /// connection error when the client cannot be reached.
    #[instrument(skip(self))]
    pub async fn test_client(&self, client_id: i64) -> Result<bool, AcquisitionError> {
        let client = self
            .store
            .get_client(client_id)
            .await?
            .ok_or_else(|| AcquisitionError::validation(format!("download client {client_id} does not exist")))?;
        let backend = self.provider.backend_for(&client)?;
        let ok = self.bounded(&client, backend.test_connection()).await?;
        info!(client = %client.name, ok, "connection test finished");
        Ok(ok)
    }

    async fn backend_of(
        &self,
        download: &Download,
    ) -> Result<(DownloadClient, Arc<dyn DownloadBackend>, String), BackendError> {
        let backend_name = download.kind.as_str();
        let external_id = download
            .external_id
            .clone()
            .ok_or_else(|| BackendError::invalid_config(backend_name, format!("download {} was never dispatched", download.id)))?;
        let client_id = download
            .download_client_id
            .ok_or_else(|| BackendError::invalid_config(backend_name, format!("download {} has no client", download.id)))?;
        let client = self
            .store
            .get_client(client_id)
            .await
            .map_err(|error| BackendError::invalid_config(backend_name, error.to_string()))?
            .ok_or_else(|| BackendError::invalid_config(backend_name, format!("client {client_id} was deleted")))?;
        let backend = self.provider.backend_for(&client)?;
        Ok((client, backend, external_id))
    }

    async fn bounded<T>(
        &self,
        client: &DownloadClient,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        tokio::time::timeout(self.deadline, call)
            .await
            .unwrap_or_else(|_| Err(BackendError::timeout(client.client_type.as_str(), client.base_url.clone())))
    }
}
