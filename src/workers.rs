//! Periodic background sweeps.
//!
//! Four independent tasks share the store: search, dispatch, monitor, and
//! retry-due. None of them coordinates with another; the request lock makes
//! every sweep safe to run alongside the others and alongside operators.
//! Each sweep function is public so a single pass can be run on demand.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerSettings;
use crate::error::AcquisitionError;
use crate::indexer::ReleaseIndexer;
use crate::lifecycle::{PollOutcome, RequestLifecycle, SearchOutcome};
use crate::store::RequestStatus;

/// Counts from one monitor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub polled: usize,
    pub progressed: usize,
    pub completed: usize,
    pub failed: usize,
    pub unreachable: usize,
}

/// Searches up to `batch_size` pending requests, oldest first.
///
/// Searches a dead process left in `searching` are requeued first.
/// Returns how many searches actually started.
///
/// # Errors
///
/// Returns a store error if the pending list cannot be read.
pub async fn search_sweep(
    lifecycle: &RequestLifecycle,
    indexer: &dyn ReleaseIndexer,
    batch_size: usize,
) -> Result<usize, AcquisitionError> {
    match lifecycle.requeue_stalled_searches(Utc::now()).await {
        Ok(0) => {}
        Ok(requeued) => info!(requeued, "stalled searches requeued"),
        Err(err) => warn!(error = %err, "stalled search recovery failed"),
    }

    let pending = lifecycle
        .store()
        .list_requests_by_status(RequestStatus::Pending)
        .await?;

    let mut searched = 0;
    for request in pending.into_iter().take(batch_size) {
        match lifecycle.run_search(request.id, indexer).await {
            Ok(SearchOutcome::NotStarted) => {}
            Ok(outcome) => {
                debug!(request_id = request.id, ?outcome, "search finished");
                searched += 1;
            }
            Err(err) => warn!(request_id = request.id, error = %err, "search failed"),
        }
    }
    Ok(searched)
}

/// Dispatches every queued download no backend has accepted yet.
///
/// Returns how many were accepted.
///
/// # Errors
///
/// Returns a store error if the queued list cannot be read.
pub async fn dispatch_sweep(lifecycle: &RequestLifecycle) -> Result<usize, AcquisitionError> {
    let queued = lifecycle.store().list_undispatched_downloads().await?;

    let mut dispatched = 0;
    for download in &queued {
        match lifecycle.dispatch_download(download).await {
            Ok(true) => dispatched += 1,
            Ok(false) => {}
            Err(err) => warn!(download_id = download.id, error = %err, "dispatch failed"),
        }
    }
    Ok(dispatched)
}

/// Finishes completions a previous pass left half-done, then polls every
/// dispatched active download.
///
/// # Errors
///
/// Returns a store error if the download lists cannot be read.
pub async fn monitor_sweep(lifecycle: &RequestLifecycle) -> Result<MonitorReport, AcquisitionError> {
    let mut report = MonitorReport::default();

    for download in lifecycle.store().list_unprocessed_completions().await? {
        match lifecycle.handle_completion(download.id).await {
            Ok(true) => report.completed += 1,
            Ok(false) => {}
            Err(err) => warn!(download_id = download.id, error = %err, "completion handling failed"),
        }
    }

    for download in lifecycle.store().list_monitored_downloads().await? {
        report.polled += 1;
        match lifecycle.poll_download(&download).await {
            Ok(PollOutcome::Unchanged) => {}
            Ok(PollOutcome::Progressed) => report.progressed += 1,
            Ok(PollOutcome::Completed) => report.completed += 1,
            Ok(PollOutcome::Failed) => report.failed += 1,
            Ok(PollOutcome::Unreachable) => report.unreachable += 1,
            Err(err) => warn!(download_id = download.id, error = %err, "poll handling failed"),
        }
    }
    Ok(report)
}

/// Requeues every `not_found` request whose retry time has passed.
///
/// # Errors
///
/// Returns a store error if the due list cannot be read.
pub async fn retry_sweep(lifecycle: &RequestLifecycle) -> Result<usize, AcquisitionError> {
    let now = Utc::now();
    let due = lifecycle.requests_retry_due(now).await?;

    let mut requeued = 0;
    for request in &due {
        match lifecycle.requeue_due(request.id, now).await {
            Ok(true) => requeued += 1,
            Ok(false) => {}
            Err(err) => warn!(request_id = request.id, error = %err, "requeue failed"),
        }
    }
    Ok(requeued)
}

/// Handles of the running sweep tasks.
#[derive(Debug)]
pub struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Spawns the four sweeps on the current runtime.
    #[must_use]
    pub fn spawn(
        lifecycle: Arc<RequestLifecycle>,
        indexer: Arc<dyn ReleaseIndexer>,
        settings: WorkerSettings,
    ) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let mut handles = Vec::with_capacity(4);

        {
            let lifecycle = Arc::clone(&lifecycle);
            let batch_size = settings.search_batch_size;
            handles.push(spawn_loop(
                "search",
                settings.search_interval_secs,
                signal.clone(),
                move || {
                    let lifecycle = Arc::clone(&lifecycle);
                    let indexer = Arc::clone(&indexer);
                    async move {
                        search_sweep(&lifecycle, indexer.as_ref(), batch_size)
                            .await
                            .map(|n| format!("{n} searched"))
                    }
                },
            ));
        }
        {
            let lifecycle = Arc::clone(&lifecycle);
            handles.push(spawn_loop(
                "dispatch",
                settings.dispatch_interval_secs,
                signal.clone(),
                move || {
                    let lifecycle = Arc::clone(&lifecycle);
                    async move { dispatch_sweep(&lifecycle).await.map(|n| format!("{n} dispatched")) }
                },
            ));
        }
        {
            let lifecycle = Arc::clone(&lifecycle);
            handles.push(spawn_loop(
                "monitor",
                settings.monitor_interval_secs,
                signal.clone(),
                move || {
                    let lifecycle = Arc::clone(&lifecycle);
                    async move {
                        monitor_sweep(&lifecycle).await.map(|r| {
                            format!(
                                "{} polled, {} completed, {} failed",
                                r.polled, r.completed, r.failed
                            )
                        })
                    }
                },
            ));
        }
        handles.push(spawn_loop(
            "retry",
            settings.retry_interval_secs,
            signal,
            move || {
                let lifecycle = Arc::clone(&lifecycle);
                async move { retry_sweep(&lifecycle).await.map(|n| format!("{n} requeued")) }
            },
        ));

        info!(workers = handles.len(), "workers started");
        Self { shutdown, handles }
    }

    /// Signals every sweep to stop and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker task panicked");
            }
        }
        info!("workers stopped");
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
    mut sweep: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<String, AcquisitionError>> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(worker = name, interval_secs, "worker started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(worker = name, "worker stopping");
                        break;
                    }
                }
                _ = interval.tick() => {
                    match sweep().await {
                        Ok(summary) => debug!(worker = name, %summary, "sweep finished"),
                        Err(err) => error!(worker = name, error = %err, "sweep failed"),
                    }
                }
            }
        }
    })
}
