//! Integration tests for the request lifecycle against a file-backed database
//! and scripted backends.

mod support;

use std::time::Duration;

use async_trait::async_trait;
use bookfetch_core::{
    AcquisitionError, BackendError, BackendState, DownloadKind, DownloadStatus, LifecycleEvent,
    RawRelease, ReleaseIndexer, RequestStatus, RetryNowOutcome, RetryOutcome, SearchError,
    SearchOutcome, SearchQuery, SearchResultStatus, Settings, Store,
};
use support::{
    Harness, ScriptedIndexer, linkless_result, magnet_result, nzb_result, release,
};

#[tokio::test]
async fn test_select_result_rejects_siblings_and_dispatches_one_download() {
    let harness = Harness::new().await;
    harness.add_client("qbit", DownloadKind::Torrent, 0).await;
    let request = harness
        .searching_with(vec![
            magnet_result("a", 10),
            magnet_result("b", 50),
            linkless_result("c"),
        ])
        .await;
    let results = harness
        .store()
        .list_search_results(request.id)
        .await
        .expect("list results");
    let chosen = &results[0];

    let download = harness
        .lifecycle
        .select_result(request.id, chosen.id)
        .await
        .expect("select result");

    assert_eq!(download.search_result_id, Some(chosen.id));
    assert_eq!(download.status, DownloadStatus::Queued);
    assert_eq!(
        download.external_id.as_deref(),
        Some(format!("job-bookfetch-{}", download.id).as_str())
    );
    assert_eq!(harness.provider.torrent.add_count(), 1);

    let results = harness
        .store()
        .list_search_results(request.id)
        .await
        .expect("list results");
    let selected: Vec<_> = results
        .iter()
        .filter(|r| r.status == SearchResultStatus::Selected)
        .collect();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].id, chosen.id);
    assert!(results
        .iter()
        .filter(|r| r.id != chosen.id)
        .all(|r| r.status == SearchResultStatus::Rejected));

    let request = harness.lifecycle.request(request.id).await.expect("reload");
    assert_eq!(request.status, RequestStatus::Downloading);
    assert_eq!(
        harness
            .lifecycle
            .downloads(request.id)
            .await
            .expect("downloads")
            .len(),
        1
    );
}

#[tokio::test]
async fn test_select_result_from_another_request_changes_nothing() {
    let harness = Harness::new().await;
    harness.add_client("qbit", DownloadKind::Torrent, 0).await;
    let request = harness.searching_with(vec![magnet_result("a", 10)]).await;
    let other = harness.create_request("OL45804W", "Dune").await;
    let foreign_id = harness
        .store()
        .list_search_results(request.id)
        .await
        .expect("list results")[0]
        .id;

    let err = harness
        .lifecycle
        .select_result(other.id, foreign_id)
        .await
        .expect_err("foreign result must be refused");

    assert!(matches!(err, AcquisitionError::Validation(_)));
    let unchanged = harness.lifecycle.request(other.id).await.expect("reload");
    assert_eq!(unchanged.status, RequestStatus::Pending);
    assert!(harness.lifecycle.downloads(other.id).await.expect("downloads").is_empty());
    assert_eq!(harness.provider.torrent.add_count(), 0);
}

#[tokio::test]
async fn test_second_selection_refused_while_download_active() {
    let harness = Harness::new().await;
    harness.add_client("qbit", DownloadKind::Torrent, 0).await;
    let request = harness
        .searching_with(vec![magnet_result("a", 10), magnet_result("b", 20)])
        .await;
    let results = harness
        .store()
        .list_search_results(request.id)
        .await
        .expect("list results");

    harness
        .lifecycle
        .select_result(request.id, results[0].id)
        .await
        .expect("first selection");
    let err = harness
        .lifecycle
        .select_result(request.id, results[1].id)
        .await
        .expect_err("second selection must be refused");

    assert!(matches!(err, AcquisitionError::Validation(_)));
    assert_eq!(harness.lifecycle.downloads(request.id).await.expect("downloads").len(), 1);
}

#[tokio::test]
async fn test_select_surfaces_missing_client_but_keeps_selection() {
    let harness = Harness::new().await;
    let request = harness.searching_with(vec![nzb_result("n1")]).await;
    let result_id = harness
        .store()
        .list_search_results(request.id)
        .await
        .expect("list results")[0]
        .id;

    let err = harness
        .lifecycle
        .select_result(request.id, result_id)
        .await
        .expect_err("no usenet client configured");

    assert!(matches!(err, AcquisitionError::NoClient { kind: DownloadKind::Usenet }));
    let downloads = harness.lifecycle.downloads(request.id).await.expect("downloads");
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].status, DownloadStatus::Queued);
    assert!(downloads[0].external_id.is_none());
    assert!(downloads[0].error_message.is_some());
}

#[tokio::test]
async fn test_cancel_succeeds_when_job_removal_fails() {
    let harness = Harness::new().await;
    harness.add_client("qbit", DownloadKind::Torrent, 0).await;
    let request = harness.searching_with(vec![magnet_result("a", 10)]).await;
    let result_id = harness
        .store()
        .list_search_results(request.id)
        .await
        .expect("list results")[0]
        .id;
    harness
        .lifecycle
        .select_result(request.id, result_id)
        .await
        .expect("select");
    harness.provider.torrent.fail_removes_with(BackendError::connection(
        "qbittorrent",
        "http://localhost:8080",
        "connection refused",
    ));

    let cancelled = harness.lifecycle.cancel(request.id).await.expect("cancel");

    assert_eq!(cancelled.status, RequestStatus::Failed);
    assert!(!cancelled.attention_needed);
    let downloads = harness.lifecycle.downloads(request.id).await.expect("downloads");
    assert_eq!(downloads[0].status, DownloadStatus::Failed);
    assert_eq!(downloads[0].error_message.as_deref(), Some("cancelled"));
    assert!(harness.provider.torrent.removed_ids().is_empty());
}

#[tokio::test]
async fn test_cancel_removes_backend_job() {
    let harness = Harness::new().await;
    harness.add_client("qbit", DownloadKind::Torrent, 0).await;
    let request = harness.searching_with(vec![magnet_result("a", 10)]).await;
    let result_id = harness
        .store()
        .list_search_results(request.id)
        .await
        .expect("list results")[0]
        .id;
    let download = harness
        .lifecycle
        .select_result(request.id, result_id)
        .await
        .expect("select");

    harness.lifecycle.cancel(request.id).await.expect("cancel");

    assert_eq!(
        harness.provider.torrent.removed_ids(),
        vec![download.external_id.clone().expect("dispatched")]
    );
}

#[tokio::test]
async fn test_cancel_during_dispatch_removes_late_backend_job() {
    let harness = Harness::new().await;
    harness.add_client("qbit", DownloadKind::Torrent, 0).await;
    let request = harness.searching_with(vec![magnet_result("a", 10)]).await;
    let result_id = harness
        .store()
        .list_search_results(request.id)
        .await
        .expect("list results")[0]
        .id;
    harness.provider.torrent.slow_adds_by(Duration::from_millis(400));

    let (selected, cancelled) = tokio::join!(
        harness.lifecycle.select_result(request.id, result_id),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            harness.lifecycle.cancel(request.id).await
        }
    );

    let download = selected.expect("select");
    assert_eq!(cancelled.expect("cancel").status, RequestStatus::Failed);
    assert_eq!(download.status, DownloadStatus::Failed);
    assert!(download.external_id.is_none());
    assert_eq!(harness.provider.torrent.add_count(), 1);
    assert_eq!(
        harness.provider.torrent.removed_ids(),
        vec![format!("job-bookfetch-{}", download.id)]
    );
}

#[tokio::test]
async fn test_retry_now_redownloads_failed_selection() {
    let harness = Harness::new().await;
    harness.add_client("qbit", DownloadKind::Torrent, 0).await;
    let request = harness.searching_with(vec![magnet_result("a", 10)]).await;
    let result_id = harness
        .store()
        .list_search_results(request.id)
        .await
        .expect("list results")[0]
        .id;
    let first = harness
        .lifecycle
        .select_result(request.id, result_id)
        .await
        .expect("select");

    harness.provider.torrent.report(BackendState::Failed, 30, None);
    harness.lifecycle.poll_download(&first).await.expect("poll");
    let flagged = harness.lifecycle.request(request.id).await.expect("reload");
    assert!(flagged.attention_needed);

    let outcome = harness.lifecycle.retry_now(request.id).await.expect("retry now");

    let RetryNowOutcome::Redispatched(second) = outcome else {
        panic!("expected a new download, got {outcome:?}");
    };
    assert_ne!(second.id, first.id);
    assert_eq!(second.search_result_id, Some(result_id));
    assert!(second.external_id.is_some());

    let request = harness.lifecycle.request(request.id).await.expect("reload");
    assert_eq!(request.status, RequestStatus::Downloading);
    assert!(!request.attention_needed);
    assert!(request.issue_description.is_none());
    assert!(request.next_retry_at.is_none());

    let downloads = harness.lifecycle.downloads(request.id).await.expect("downloads");
    assert_eq!(downloads.len(), 2);
    assert_eq!(downloads[1].status, DownloadStatus::Failed);
    assert_eq!(
        harness.provider.torrent.removed_ids(),
        vec![first.external_id.clone().expect("dispatched")]
    );
}

#[tokio::test]
async fn test_retry_now_restarts_search_without_failed_selection() {
    let harness = Harness::new().await;
    let request = harness.create_request("OL27448W", "The Left Hand of Darkness").await;
    let indexer = ScriptedIndexer::returning(Vec::new());

    let outcome = harness
        .lifecycle
        .run_search(request.id, &indexer)
        .await
        .expect("search");
    assert!(matches!(
        outcome,
        SearchOutcome::NoResults(RetryOutcome::Scheduled { retry_count: 1, .. })
    ));

    let outcome = harness.lifecycle.retry_now(request.id).await.expect("retry now");

    assert!(matches!(outcome, RetryNowOutcome::Restarted));
    let request = harness.lifecycle.request(request.id).await.expect("reload");
    assert_eq!(request.status, RequestStatus::Pending);
    assert!(request.next_retry_at.is_none());
    assert_eq!(request.retry_count, 1);
}

#[tokio::test]
async fn test_run_search_auto_selects_best_result() {
    let harness = Harness::new().await;
    harness.add_client("qbit", DownloadKind::Torrent, 0).await;
    let request = harness.create_request("OL27448W", "The Left Hand of Darkness").await;
    let indexer = ScriptedIndexer::returning(vec![
        release("few", true, Some(5)),
        release("many", true, Some(40)),
        RawRelease {
            guid: "nolink".to_string(),
            title: "No link".to_string(),
            indexer: "idx".to_string(),
            seeders: Some(900),
            ..RawRelease::default()
        },
    ]);

    let outcome = harness
        .lifecycle
        .run_search(request.id, &indexer)
        .await
        .expect("search");

    let SearchOutcome::Selected(download) = outcome else {
        panic!("expected auto-selection, got {outcome:?}");
    };
    let best = harness
        .store()
        .list_search_results(request.id)
        .await
        .expect("list results")
        .into_iter()
        .find(|r| r.guid == "many")
        .expect("stored result");
    assert_eq!(download.search_result_id, Some(best.id));
    assert_eq!(harness.provider.torrent.add_count(), 1);

    let queries = indexer.queries.lock().unwrap().clone();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].title, "The Left Hand of Darkness");

    let request = harness.lifecycle.request(request.id).await.expect("reload");
    assert_eq!(request.status, RequestStatus::Downloading);
}

#[tokio::test]
async fn test_run_search_without_auto_select_waits_for_operator() {
    let mut settings = Settings::default();
    settings.search.auto_select = false;
    let harness = Harness::with_settings(settings).await;
    let request = harness.create_request("OL27448W", "The Left Hand of Darkness").await;
    let indexer = ScriptedIndexer::returning(vec![
        release("t1", true, Some(5)),
        release("u1", false, None),
    ]);

    let outcome = harness
        .lifecycle
        .run_search(request.id, &indexer)
        .await
        .expect("search");

    assert!(matches!(outcome, SearchOutcome::AwaitingSelection { downloadable: 2 }));
    let awaiting = harness
        .lifecycle
        .requests_awaiting_selection()
        .await
        .expect("awaiting");
    assert_eq!(awaiting.len(), 1);
    assert_eq!(awaiting[0].id, request.id);
    assert!(harness.lifecycle.downloads(request.id).await.expect("downloads").is_empty());
}

#[tokio::test]
async fn test_run_search_with_only_linkless_results_schedules_retry() {
    let harness = Harness::new().await;
    let request = harness.create_request("OL27448W", "The Left Hand of Darkness").await;
    let indexer = ScriptedIndexer::returning(vec![RawRelease {
        guid: "x".to_string(),
        title: "Linkless".to_string(),
        indexer: "idx".to_string(),
        ..RawRelease::default()
    }]);

    let outcome = harness
        .lifecycle
        .run_search(request.id, &indexer)
        .await
        .expect("search");

    assert!(matches!(outcome, SearchOutcome::NoResults(RetryOutcome::Scheduled { .. })));
    let request = harness.lifecycle.request(request.id).await.expect("reload");
    assert_eq!(request.status, RequestStatus::NotFound);
    assert!(request.next_retry_at.is_some());
}

#[tokio::test]
async fn test_run_search_unreachable_indexer_requeues_without_retry() {
    let harness = Harness::new().await;
    let request = harness.create_request("OL27448W", "The Left Hand of Darkness").await;
    let indexer = ScriptedIndexer::failing(SearchError::Connection {
        message: "connection refused".to_string(),
    });

    let outcome = harness
        .lifecycle
        .run_search(request.id, &indexer)
        .await
        .expect("search");

    assert!(matches!(outcome, SearchOutcome::Requeued));
    let request = harness.lifecycle.request(request.id).await.expect("reload");
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.retry_count, 0);
}

/// Indexer that drops the results table while the search is in flight.
struct TableDroppingIndexer {
    store: Store,
}

#[async_trait]
impl ReleaseIndexer for TableDroppingIndexer {
    async fn search(&self, _query: &SearchQuery) -> Result<Vec<RawRelease>, SearchError> {
        sqlx::query("DROP TABLE search_results")
            .execute(self.store.database().pool())
            .await
            .expect("drop results table");
        Ok(vec![release("r1", true, Some(5))])
    }
}

#[tokio::test]
async fn test_run_search_store_failure_returns_request_to_pending() {
    let harness = Harness::new().await;
    let request = harness.create_request("OL27448W", "The Left Hand of Darkness").await;
    let indexer = TableDroppingIndexer {
        store: harness.store().clone(),
    };

    let err = harness
        .lifecycle
        .run_search(request.id, &indexer)
        .await
        .expect_err("results cannot be stored");

    assert!(matches!(err, AcquisitionError::Store(_)), "got {err:?}");
    let request = harness.lifecycle.request(request.id).await.expect("reload");
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.retry_count, 0);
}

#[tokio::test]
async fn test_committed_transitions_are_published() {
    let harness = Harness::new().await;
    let mut events = harness.events.subscribe();
    let request = harness.create_request("OL27448W", "The Left Hand of Darkness").await;

    harness.lifecycle.start_search(request.id).await.expect("start search");

    assert_eq!(
        events.recv().await.expect("created event"),
        LifecycleEvent::RequestCreated { request_id: request.id }
    );
    assert_eq!(
        events.recv().await.expect("status event"),
        LifecycleEvent::StatusChanged {
            request_id: request.id,
            from: RequestStatus::Pending,
            to: RequestStatus::Searching,
        }
    );
}

#[tokio::test]
async fn test_duplicate_language_mismatch_warns() {
    let harness = Harness::new().await;
    harness.create_request("OL27448W", "The Left Hand of Darkness").await;

    let created = harness
        .lifecycle
        .create_request(support::intake("OL27448W", "The Left Hand of Darkness", "de"))
        .await
        .expect("create in another language");

    assert!(created.warning.is_some());
    assert_eq!(created.request.status, RequestStatus::Pending);
}
