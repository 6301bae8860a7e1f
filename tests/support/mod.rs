//! Shared fixtures for integration tests: a tempfile database, scripted
//! backends and collaborators, and helpers that drive a request to a given
//! point of its lifecycle.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bookfetch_core::store::NewSearchResult;
use bookfetch_core::{
    BackendError, BackendProvider, BackendState, BackendStatus, BookFormat, Database,
    Download, DownloadBackend, DownloadClient, DownloadKind, DownloadSpec, EventBus, NewBook,
    NewDownloadClient, PostProcessError, PostProcessOutcome, PostProcessor, RawRelease,
    ReleaseIndexer, Request, RequestIntake, RequestLifecycle, SearchError, SearchQuery,
    Settings, Store,
};
use tempfile::TempDir;

/// Creates a file-backed test database with migrations applied.
pub async fn setup_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (db, temp_dir)
}

/// Download backend whose answers are set by the test.
pub struct FakeBackend {
    kind: DownloadKind,
    pub added: Mutex<Vec<DownloadSpec>>,
    pub removed: Mutex<Vec<String>>,
    pub add_error: Mutex<Option<BackendError>>,
    pub add_delay: Mutex<Option<Duration>>,
    pub remove_error: Mutex<Option<BackendError>>,
    pub status: Mutex<Result<BackendStatus, BackendError>>,
}

impl FakeBackend {
    pub fn new(kind: DownloadKind) -> Self {
        Self {
            kind,
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            add_error: Mutex::new(None),
            add_delay: Mutex::new(None),
            remove_error: Mutex::new(None),
            status: Mutex::new(Ok(BackendStatus {
                progress: 0,
                state: BackendState::Queued,
                download_path: None,
                message: None,
            })),
        }
    }

    pub fn fail_adds_with(&self, error: BackendError) {
        *self.add_error.lock().unwrap() = Some(error);
    }

    /// Makes every `add` take `delay` before the backend answers.
    pub fn slow_adds_by(&self, delay: Duration) {
        *self.add_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_removes_with(&self, error: BackendError) {
        *self.remove_error.lock().unwrap() = Some(error);
    }

    pub fn report(&self, state: BackendState, progress: u8, download_path: Option<&str>) {
        *self.status.lock().unwrap() = Ok(BackendStatus {
            progress,
            state,
            download_path: download_path.map(str::to_string),
            message: None,
        });
    }

    pub fn report_error(&self, error: BackendError) {
        *self.status.lock().unwrap() = Err(error);
    }

    pub fn add_count(&self) -> usize {
        self.added.lock().unwrap().len()
    }

    pub fn removed_ids(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DownloadBackend for FakeBackend {
    fn kind(&self) -> DownloadKind {
        self.kind
    }

    async fn test_connection(&self) -> Result<bool, BackendError> {
        Ok(true)
    }

    async fn add(&self, spec: &DownloadSpec) -> Result<String, BackendError> {
        let delay = *self.add_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.add_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.added.lock().unwrap().push(spec.clone());
        Ok(format!("job-{}", spec.tag))
    }

    async fn status(&self, _external_id: &str) -> Result<BackendStatus, BackendError> {
        self.status.lock().unwrap().clone()
    }

    async fn remove(&self, external_id: &str, _delete_files: bool) -> Result<bool, BackendError> {
        if let Some(error) = self.remove_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.removed.lock().unwrap().push(external_id.to_string());
        Ok(true)
    }
}

/// Provider handing out one shared fake per technology.
///
/// Clients named in `down` cannot be reached at all.
pub struct FakeProvider {
    pub torrent: Arc<FakeBackend>,
    pub usenet: Arc<FakeBackend>,
    pub down: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            torrent: Arc::new(FakeBackend::new(DownloadKind::Torrent)),
            usenet: Arc::new(FakeBackend::new(DownloadKind::Usenet)),
            down: Mutex::new(Vec::new()),
        }
    }

    pub fn take_down(&self, client_name: &str) {
        self.down.lock().unwrap().push(client_name.to_string());
    }
}

impl BackendProvider for FakeProvider {
    fn backend_for(&self, client: &DownloadClient) -> Result<Arc<dyn DownloadBackend>, BackendError> {
        if self.down.lock().unwrap().contains(&client.name) {
            return Err(BackendError::connection(
                "fake",
                client.base_url.clone(),
                "connection refused",
            ));
        }
        Ok(match client.client_type {
            DownloadKind::Torrent => Arc::clone(&self.torrent) as Arc<dyn DownloadBackend>,
            DownloadKind::Usenet => Arc::clone(&self.usenet) as Arc<dyn DownloadBackend>,
        })
    }
}

/// Indexer returning a fixed answer.
pub struct ScriptedIndexer {
    pub answer: Mutex<Result<Vec<RawRelease>, SearchError>>,
    pub queries: Mutex<Vec<SearchQuery>>,
}

impl ScriptedIndexer {
    pub fn returning(releases: Vec<RawRelease>) -> Self {
        Self {
            answer: Mutex::new(Ok(releases)),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: SearchError) -> Self {
        Self {
            answer: Mutex::new(Err(error)),
            queries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ReleaseIndexer for ScriptedIndexer {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawRelease>, SearchError> {
        self.queries.lock().unwrap().push(query.clone());
        self.answer.lock().unwrap().clone()
    }
}

/// Post-processor returning a fixed outcome and recording what it saw.
pub struct ScriptedPostProcessor {
    pub outcome: Mutex<Result<PostProcessOutcome, String>>,
    pub seen: Mutex<Vec<(i64, Option<String>)>>,
}

impl ScriptedPostProcessor {
    pub fn delivering() -> Self {
        Self::with(Ok(PostProcessOutcome::Delivered {
            location: "/library/book".to_string(),
        }))
    }

    pub fn with(outcome: Result<PostProcessOutcome, String>) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PostProcessor for ScriptedPostProcessor {
    async fn process(
        &self,
        request: &Request,
        download: &Download,
    ) -> Result<PostProcessOutcome, PostProcessError> {
        self.seen
            .lock()
            .unwrap()
            .push((download.id, download.download_path.clone()));
        self.outcome
            .lock()
            .unwrap()
            .clone()
            .map_err(|message| PostProcessError {
                request_id: request.id,
                message,
            })
    }
}

/// Everything a lifecycle test needs, kept alive together.
pub struct Harness {
    pub lifecycle: RequestLifecycle,
    pub provider: Arc<FakeProvider>,
    pub post_processor: Arc<ScriptedPostProcessor>,
    pub events: EventBus,
    _temp_dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(Settings::default()).await
    }

    pub async fn with_settings(settings: Settings) -> Self {
        let (db, temp_dir) = setup_test_db().await;
        let provider = Arc::new(FakeProvider::new());
        let post_processor = Arc::new(ScriptedPostProcessor::delivering());
        let events = EventBus::default();
        let lifecycle = RequestLifecycle::new(
            Store::new(db),
            Arc::clone(&provider) as Arc<dyn BackendProvider>,
            Arc::clone(&post_processor) as Arc<dyn PostProcessor>,
            &settings,
            events.clone(),
        );
        Self {
            lifecycle,
            provider,
            post_processor,
            events,
            _temp_dir: temp_dir,
        }
    }

    pub fn store(&self) -> &Store {
        self.lifecycle.store()
    }

    pub async fn add_client(&self, name: &str, kind: DownloadKind, priority: i64) -> DownloadClient {
        self.store()
            .insert_client(&NewDownloadClient {
                name: name.to_string(),
                client_type: kind,
                base_url: "http://localhost:8080".to_string(),
                username: None,
                password: None,
                api_key: Some("key".to_string()),
                category: Some("books".to_string()),
                priority,
                enabled: true,
            })
            .await
            .expect("insert client")
    }

    pub async fn create_request(&self, source_id: &str, title: &str) -> Request {
        self.lifecycle
            .create_request(intake(source_id, title, "en"))
            .await
            .expect("create request")
            .request
    }

    /// Creates a request, moves it to `searching`, and stores `results`.
    pub async fn searching_with(&self, results: Vec<NewSearchResult>) -> Request {
        let request = self.create_request("OL27448W", "The Left Hand of Darkness").await;
        assert!(self.lifecycle.start_search(request.id).await.expect("start search"));
        let releases = results
            .into_iter()
            .map(|r| RawRelease {
                guid: r.guid,
                title: r.title,
                indexer: r.indexer,
                size_bytes: r.size_bytes,
                seeders: r.seeders,
                leechers: r.leechers,
                download_url: r.download_url,
                magnet_url: r.magnet_url,
                published_at: r.published_at,
            })
            .collect();
        self.lifecycle
            .record_search_results(request.id, releases)
            .await
            .expect("record results");
        self.lifecycle.request(request.id).await.expect("reload")
    }
}

pub fn intake(source_id: &str, title: &str, language: &str) -> RequestIntake {
    RequestIntake {
        username: "reader".to_string(),
        book: NewBook {
            source: "openlibrary".to_string(),
            source_id: source_id.to_string(),
            title: title.to_string(),
            author: Some("Ursula K. Le Guin".to_string()),
            cover_url: None,
        },
        format: BookFormat::Ebook,
        language: Some(language.to_string()),
    }
}

pub fn magnet_result(guid: &str, seeders: i64) -> NewSearchResult {
    NewSearchResult {
        guid: guid.to_string(),
        title: format!("Release {guid}"),
        indexer: "idx".to_string(),
        seeders: Some(seeders),
        size_bytes: Some(2_000_000),
        magnet_url: Some(format!("magnet:?xt=urn:btih:{guid}")),
        ..NewSearchResult::default()
    }
}

pub fn nzb_result(guid: &str) -> NewSearchResult {
    NewSearchResult {
        guid: guid.to_string(),
        title: format!("Release {guid}"),
        indexer: "idx".to_string(),
        size_bytes: Some(1_000_000),
        download_url: Some(format!("https://idx.example/nzb/{guid}")),
        ..NewSearchResult::default()
    }
}

pub fn linkless_result(guid: &str) -> NewSearchResult {
    NewSearchResult {
        guid: guid.to_string(),
        title: format!("Release {guid}"),
        indexer: "idx".to_string(),
        seeders: Some(500),
        ..NewSearchResult::default()
    }
}

pub fn release(guid: &str, magnet: bool, seeders: Option<i64>) -> RawRelease {
    RawRelease {
        guid: guid.to_string(),
        title: format!("Release {guid}"),
        indexer: "idx".to_string(),
        seeders,
        size_bytes: Some(3_000_000),
        download_url: (!magnet).then(|| format!("https://idx.example/get/{guid}")),
        magnet_url: magnet.then(|| format!("magnet:?xt=urn:btih:{guid}")),
        ..RawRelease::default()
    }
}
