//! Integration tests for the qBittorrent and SABnzbd adapters.
//!
//! These tests drive the real adapters against mock HTTP servers.

use bookfetch_core::{
    BackendError, BackendState, BackendTimeouts, DownloadBackend, DownloadClient, DownloadKind,
    DownloadSpec, TorrentBackend, UsenetBackend,
};
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HASH: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

fn client(kind: DownloadKind, base_url: &str) -> DownloadClient {
    DownloadClient {
        id: 1,
        name: "test".to_string(),
        client_type: kind,
        base_url: base_url.to_string(),
        username: Some("admin".to_string()),
        password: Some("secret".to_string()),
        api_key: Some("abc123".to_string()),
        category: Some("books".to_string()),
        priority: 0,
        enabled: true,
    }
}

fn spec(source_url: &str) -> DownloadSpec {
    DownloadSpec {
        source_url: source_url.to_string(),
        name: "The Dispossessed".to_string(),
        category: Some("books".to_string()),
        tag: DownloadSpec::tag_for(7),
    }
}

async fn qbittorrent_with_login(body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/auth/login"))
        .and(body_string_contains("username=admin"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;
    server
}

fn torrent(server: &MockServer) -> TorrentBackend {
    TorrentBackend::new(
        &client(DownloadKind::Torrent, &server.uri()),
        BackendTimeouts::default(),
    )
    .expect("valid torrent client")
}

fn usenet(server: &MockServer) -> UsenetBackend {
    UsenetBackend::new(
        &client(DownloadKind::Usenet, &server.uri()),
        BackendTimeouts::default(),
    )
    .expect("valid usenet client")
}

// ==================== qBittorrent ====================

#[tokio::test]
async fn test_torrent_add_magnet_returns_info_hash() {
    let server = qbittorrent_with_login("Ok.").await;
    Mock::given(method("POST"))
        .and(path("/api/v2/torrents/add"))
        .and(body_string_contains("tags=bookfetch-7"))
        .and(body_string_contains("category=books"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Ok."))
        .expect(1)
        .mount(&server)
        .await;

    let external_id = torrent(&server)
        .add(&spec(&format!("magnet:?xt=urn:btih:{}&dn=book", HASH.to_uppercase())))
        .await
        .expect("add should succeed");

    assert_eq!(external_id, HASH);
}

#[tokio::test]
async fn test_torrent_add_refused_with_fails_body() {
    let server = qbittorrent_with_login("Ok.").await;
    Mock::given(method("POST"))
        .and(path("/api/v2/torrents/add"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Fails."))
        .mount(&server)
        .await;

    let err = torrent(&server)
        .add(&spec(&format!("magnet:?xt=urn:btih:{HASH}")))
        .await
        .expect_err("add should be refused");

    assert!(matches!(err, BackendError::Rejected { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_torrent_file_url_falls_back_to_tag_until_hash_is_known() {
    let server = qbittorrent_with_login("Ok.").await;
    Mock::given(method("POST"))
        .and(path("/api/v2/torrents/add"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Ok."))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/torrents/info"))
        .and(query_param("tag", "bookfetch-7"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&server)
        .await;

    let external_id = torrent(&server)
        .add(&spec("https://indexer.example/t/42.torrent"))
        .await
        .expect("add should succeed");

    assert_eq!(external_id, "bookfetch-7");
}

#[tokio::test]
async fn test_torrent_status_maps_seeding_to_completed() {
    let server = qbittorrent_with_login("Ok.").await;
    Mock::given(method("GET"))
        .and(path("/api/v2/torrents/info"))
        .and(query_param("hashes", HASH))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"[{{"hash":"{HASH}","progress":1.0,"state":"stalledUP","content_path":"/downloads/The Dispossessed"}}]"#
        )))
        .mount(&server)
        .await;

    let status = torrent(&server).status(HASH).await.expect("status");

    assert_eq!(status.state, BackendState::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.download_path.as_deref(), Some("/downloads/The Dispossessed"));
}

#[tokio::test]
async fn test_torrent_status_of_unknown_job_is_not_found() {
    let server = qbittorrent_with_login("Ok.").await;
    Mock::given(method("GET"))
        .and(path("/api/v2/torrents/info"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&server)
        .await;

    let err = torrent(&server).status(HASH).await.expect_err("job is gone");

    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_torrent_remove_deletes_files() {
    let server = qbittorrent_with_login("Ok.").await;
    Mock::given(method("POST"))
        .and(path("/api/v2/torrents/delete"))
        .and(body_string_contains(format!("hashes={HASH}")))
        .and(body_string_contains("deleteFiles=true"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let removed = torrent(&server).remove(HASH, true).await.expect("remove");

    assert!(removed);
}

#[tokio::test]
async fn test_torrent_bad_credentials_fail_connection_test() {
    let server = qbittorrent_with_login("Fails.").await;

    let ok = torrent(&server)
        .test_connection()
        .await
        .expect("a refusal is not an error");

    assert!(!ok);
}

#[tokio::test]
async fn test_torrent_unreachable_is_connection_error() {
    // Nothing listens on the discard port.
    let backend = TorrentBackend::new(
        &client(DownloadKind::Torrent, "http://127.0.0.1:9"),
        BackendTimeouts::default(),
    )
    .expect("valid torrent client");

    let err = backend.status(HASH).await.expect_err("nothing listens");

    assert!(err.is_connection(), "got {err:?}");
}

// ==================== SABnzbd ====================

#[tokio::test]
async fn test_usenet_add_returns_nzo_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .and(query_param("mode", "addurl"))
        .and(query_param("apikey", "abc123"))
        .and(query_param("cat", "books"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"status":true,"nzo_ids":["SABnzbd_nzo_p86tgx"]}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let external_id = usenet(&server)
        .add(&spec("https://indexer.example/nzb/42"))
        .await
        .expect("add should succeed");

    assert_eq!(external_id, "SABnzbd_nzo_p86tgx");
}

#[tokio::test]
async fn test_usenet_status_queue_slot_reports_progress() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .and(query_param("mode", "queue"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"queue":{"slots":[{"nzo_id":"SABnzbd_nzo_p86tgx","status":"Downloading","percentage":"42"}]}}"#,
        ))
        .mount(&server)
        .await;

    let status = usenet(&server).status("SABnzbd_nzo_p86tgx").await.expect("status");

    assert_eq!(status.state, BackendState::Downloading);
    assert_eq!(status.progress, 42);
}

#[tokio::test]
async fn test_usenet_status_falls_through_to_history() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .and(query_param("mode", "queue"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"queue":{"slots":[]}}"#))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .and(query_param("mode", "history"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"history":{"slots":[{"nzo_id":"SABnzbd_nzo_p86tgx","status":"Failed","fail_message":"Aborted, cannot be completed"}]}}"#,
        ))
        .mount(&server)
        .await;

    let status = usenet(&server).status("SABnzbd_nzo_p86tgx").await.expect("status");

    assert_eq!(status.state, BackendState::Failed);
    assert_eq!(status.message.as_deref(), Some("Aborted, cannot be completed"));
}

#[tokio::test]
async fn test_usenet_wrong_api_key_is_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"status":false,"error":"API Key Incorrect"}"#),
        )
        .mount(&server)
        .await;
    let backend = usenet(&server);

    let err = backend
        .add(&spec("https://indexer.example/nzb/42"))
        .await
        .expect_err("key refused");
    assert!(matches!(err, BackendError::Auth { .. }), "got {err:?}");

    let ok = backend.test_connection().await.expect("a refusal is not an error");
    assert!(!ok);
}

#[tokio::test]
async fn test_usenet_garbage_body_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let err = usenet(&server)
        .status("SABnzbd_nzo_p86tgx")
        .await
        .expect_err("not json");

    assert!(matches!(err, BackendError::MalformedResponse { .. }), "got {err:?}");
}

#[test]
fn test_usenet_requires_api_key() {
    let mut row = client(DownloadKind::Usenet, "http://localhost:8085");
    row.api_key = None;

    let err = UsenetBackend::new(&row, BackendTimeouts::default()).expect_err("key missing");

    assert!(matches!(err, BackendError::InvalidConfig { .. }));
}
