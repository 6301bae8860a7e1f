//! qBittorrent Web API adapter.
//!
//! Every privileged call logs in first (`/api/v2/auth/login`); the session
//! cookie lands in the client's own cookie jar. Jobs are identified by their
//! lowercase hex info-hash, or by the per-attempt tag while a torrent-file URL
//! has not been resolved to a hash yet.

use std::fmt::Write as _;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use reqwest::cookie::Jar;
use reqwest::header::REFERER;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use super::http_client::{BackendTimeouts, build_backend_http_client, endpoint, parse_base_url};
use super::{BackendError, BackendState, BackendStatus, DownloadBackend, DownloadSpec};
use crate::store::{DownloadClient, DownloadKind};

const BACKEND: &str = "qbittorrent";

#[allow(clippy::expect_used)]
static BTIH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)xt=urn:btih:([a-z0-9]{32,40})").expect("btih regex is valid")
});

/// qBittorrent instance reached through its Web API.
#[derive(Debug)]
pub struct TorrentBackend {
    http: Client,
    base_url: Url,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TorrentInfo {
    hash: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    state: String,
    #[serde(default)]
    content_path: Option<String>,
    #[serde(default)]
    save_path: Option<String>,
}

impl TorrentBackend {
    /// Creates an adapter for a stored torrent client.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidConfig`] if the base URL is unusable or
    /// the HTTP client cannot be built.
    pub fn new(client: &DownloadClient, timeouts: BackendTimeouts) -> Result<Self, BackendError> {
        let base_url = parse_base_url(BACKEND, &client.base_url)?;
        let jar = Arc::new(Jar::default());
        let http = build_backend_http_client(BACKEND, timeouts, Some(jar))?;
        Ok(Self {
            http,
            base_url,
            username: client.username.clone(),
            password: client.password.clone(),
        })
    }

    async fn send(&self, request: RequestBuilder, url: &Url) -> Result<Response, BackendError> {
        let response = request
            .send()
            .await
            .map_err(|error| BackendError::from_reqwest(BACKEND, url.as_str(), &error))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::from_status(BACKEND, status.as_u16(), body.trim()))
    }

    async fn text(response: Response, url: &Url) -> Result<String, BackendError> {
        response
            .text()
            .await
            .map_err(|error| BackendError::from_reqwest(BACKEND, url.as_str(), &error))
    }

    /// Opens a session. A client without credentials relies on the backend's
    /// localhost/subnet whitelist and skips the login.
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn login(&self) -> Result<(), BackendError> {
        let (Some(username), Some(password)) = (&self.username, &self.password) else {
            return Ok(());
        };
        let url = endpoint(BACKEND, &self.base_url, "api/v2/auth/login")?;
        let request = self
            .http
            .post(url.clone())
            .header(REFERER, self.base_url.as_str())
            .form(&[("username", username.as_str()), ("password", password.as_str())]);
        let response = self.send(request, &url).await?;
        let body = Self::text(response, &url).await?;
        if body.trim() == "Ok." {
            debug!("session opened");
            Ok(())
        } else {
            Err(BackendError::Auth { backend: BACKEND })
        }
    }

    async fn torrents_info(&self, query: &[(&str, &str)]) -> Result<Vec<TorrentInfo>, BackendError> {
        let url = endpoint(BACKEND, &self.base_url, "api/v2/torrents/info")?;
        let response = self.send(self.http.get(url.clone()).query(query), &url).await?;
        response
            .json::<Vec<TorrentInfo>>()
            .await
            .map_err(|error| BackendError::malformed(BACKEND, error.to_string()))
    }

    /// Looks up a job by hash, or by tag for handles that are not hashes.
    async fn find(&self, external_id: &str) -> Result<TorrentInfo, BackendError> {
        let query = if is_info_hash(external_id) {
            [("hashes", external_id)]
        } else {
            [("tag", external_id)]
        };
        self.torrents_info(&query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::not_found(BACKEND, external_id))
    }
}

#[async_trait]
impl DownloadBackend for TorrentBackend {
    fn kind(&self) -> DownloadKind {
        DownloadKind::Torrent
    }

    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn test_connection(&self) -> Result<bool, BackendError> {
        match self.login().await {
            Ok(()) => {}
            Err(BackendError::Auth { .. } | BackendError::Rejected { .. }) => return Ok(false),
            Err(error) => return Err(error),
        }
        let url = endpoint(BACKEND, &self.base_url, "api/v2/app/version")?;
        match self.send(self.http.get(url.clone()), &url).await {
            Ok(response) => {
                let version = Self::text(response, &url).await?;
                debug!(version = version.trim(), "connection verified");
                Ok(true)
            }
            Err(BackendError::Auth { .. } | BackendError::Rejected { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    #[instrument(skip(self, spec), fields(tag = %spec.tag))]
    async fn add(&self, spec: &DownloadSpec) -> Result<String, BackendError> {
        self.login().await?;

        let url = endpoint(BACKEND, &self.base_url, "api/v2/torrents/add")?;
        let mut form = vec![
            ("urls", spec.source_url.as_str()),
            ("tags", spec.tag.as_str()),
            ("rename", spec.name.as_str()),
        ];
        if let Some(category) = spec.category.as_deref() {
            form.push(("category", category));
        }
        let response = self.send(self.http.post(url.clone()).form(&form), &url).await?;
        let body = Self::text(response, &url).await?;
        if body.trim() == "Fails." {
            return Err(BackendError::rejected(BACKEND, 200, "torrent was not added"));
        }

        if let Some(hash) = info_hash_from_magnet(&spec.source_url) {
            debug!(hash = %hash, "torrent added");
            return Ok(hash);
        }

        // Torrent-file URLs are fetched asynchronously by the backend; fall
        // back to the tag until the hash is visible.
        match self.find(&spec.tag).await {
            Ok(info) => Ok(info.hash.to_ascii_lowercase()),
            Err(BackendError::NotFound { .. }) => Ok(spec.tag.clone()),
            Err(error) => Err(error),
        }
    }

    #[instrument(skip(self))]
    async fn status(&self, external_id: &str) -> Result<BackendStatus, BackendError> {
        self.login().await?;
        let info = self.find(external_id).await?;
        let state = map_torrent_state(&info.state, info.progress);
        let message = (state == BackendState::Failed).then(|| format!("torrent state {}", info.state));
        Ok(BackendStatus {
            progress: progress_percent(info.progress),
            state,
            download_path: info.content_path.or(info.save_path).filter(|p| !p.is_empty()),
            message,
        })
    }

    #[instrument(skip(self))]
    async fn remove(&self, external_id: &str, delete_files: bool) -> Result<bool, BackendError> {
        self.login().await?;
        let hash = if is_info_hash(external_id) {
            external_id.to_string()
        } else {
            match self.find(external_id).await {
                Ok(info) => info.hash,
                Err(BackendError::NotFound { .. }) => return Ok(false),
                Err(error) => return Err(error),
            }
        };

        let url = endpoint(BACKEND, &self.base_url, "api/v2/torrents/delete")?;
        let delete_files = if delete_files { "true" } else { "false" };
        let form = [("hashes", hash.as_str()), ("deleteFiles", delete_files)];
        self.send(self.http.post(url.clone()).form(&form), &url).await?;
        Ok(true)
    }
}

/// Extracts the info-hash from a magnet link as lowercase hex.
///
/// Accepts both the 40-character hex and the 32-character base32 forms.
#[must_use]
pub fn info_hash_from_magnet(link: &str) -> Option<String> {
    if !link.trim_start().to_ascii_lowercase().starts_with("magnet:") {
        return None;
    }
    let raw = BTIH_PATTERN.captures(link)?.get(1)?.as_str();
    match raw.len() {
        40 if raw.bytes().all(|b| b.is_ascii_hexdigit()) => Some(raw.to_ascii_lowercase()),
        32 => base32_to_hex(raw),
        _ => None,
    }
}

fn is_info_hash(value: &str) -> bool {
    value.len() == 40 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn base32_to_hex(encoded: &str) -> Option<String> {
    let mut bits: u64 = 0;
    let mut bit_count = 0u32;
    let mut hex = String::with_capacity(40);
    for byte in encoded.bytes() {
        let value = match byte.to_ascii_uppercase() {
            c @ b'A'..=b'Z' => c - b'A',
            c @ b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        bits = (bits << 5) | u64::from(value);
        bit_count += 5;
        while bit_count >= 8 {
            bit_count -= 8;
            let octet = (bits >> bit_count) & 0xff;
            let _ = write!(hex, "{octet:02x}");
        }
        bits &= (1 << bit_count) - 1;
    }
    (hex.len() == 40).then_some(hex)
}

fn map_torrent_state(state: &str, progress: f64) -> BackendState {
    match state {
        "error" | "missingFiles" => BackendState::Failed,
        "pausedDL" | "stoppedDL" => BackendState::Paused,
        "queuedDL" | "checkingResumeData" => BackendState::Queued,
        "uploading" | "stalledUP" | "queuedUP" | "forcedUP" | "pausedUP" | "stoppedUP"
        | "checkingUP" => BackendState::Completed,
        "downloading" | "stalledDL" | "forcedDL" | "metaDL" | "forcedMetaDL" | "allocating"
        | "checkingDL" | "moving" => BackendState::Downloading,
        _ if progress >= 1.0 => BackendState::Completed,
        _ => BackendState::Downloading,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn progress_percent(fraction: f64) -> u8 {
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u8
}
