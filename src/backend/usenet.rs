//! SABnzbd API adapter.
//!
//! Every call goes to `{base}/api` with `apikey` and `output=json`. SABnzbd
//! reports refusals in the body as `{"status": false, "error": "..."}`, usually
//! with HTTP 200.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use url::Url;

use super::http_client::{BackendTimeouts, build_backend_http_client, endpoint, parse_base_url};
use super::{BackendError, BackendState, BackendStatus, DownloadBackend, DownloadSpec};
use crate::store::{DownloadClient, DownloadKind};

const BACKEND: &str = "sabnzbd";

/// SABnzbd instance reached through its JSON API.
pub struct UsenetBackend {
    http: Client,
    api_url: Url,
    api_key: String,
}

impl std::fmt::Debug for UsenetBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsenetBackend")
            .field("api_url", &self.api_url.as_str())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    status: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(default)]
    nzo_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    queue: QueueBody,
}

#[derive(Debug, Deserialize)]
struct QueueBody {
    #[serde(default)]
    slots: Vec<QueueSlot>,
}

#[derive(Debug, Deserialize)]
struct QueueSlot {
    nzo_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    percentage: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    history: HistoryBody,
}

#[derive(Debug, Deserialize)]
struct HistoryBody {
    #[serde(default)]
    slots: Vec<HistorySlot>,
}

#[derive(Debug, Deserialize)]
struct HistorySlot {
    nzo_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    storage: Option<String>,
    #[serde(default)]
    fail_message: Option<String>,
}

impl UsenetBackend {
    /// Creates an adapter for a stored usenet client.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidConfig`] if the base URL is unusable, the
    /// API key is missing, or the HTTP client cannot be built.
    pub fn new(client: &DownloadClient, timeouts: BackendTimeouts) -> Result<Self, BackendError> {
        let base_url = parse_base_url(BACKEND, &client.base_url)?;
        let api_url = endpoint(BACKEND, &base_url, "api")?;
        let api_key = client
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| BackendError::invalid_config(BACKEND, "an API key is required"))?;
        let http = build_backend_http_client(BACKEND, timeouts, None)?;
        Ok(Self {
            http,
            api_url,
            api_key,
        })
    }

    /// Calls one API mode and decodes the JSON body.
    async fn call<T: DeserializeOwned>(&self, params: &[(&str, &str)]) -> Result<T, BackendError> {
        let response = self
            .http
            .get(self.api_url.clone())
            .query(&[("apikey", self.api_key.as_str()), ("output", "json")])
            .query(params)
            .send()
            .await
            .map_err(|error| BackendError::from_reqwest(BACKEND, self.api_url.as_str(), &error))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(BACKEND, status.as_u16(), body.trim()));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|error| BackendError::malformed(BACKEND, error.to_string()))?;

        let api_status: ApiStatus = serde_json::from_value(body.clone())
            .map_err(|error| BackendError::malformed(BACKEND, error.to_string()))?;
        if api_status.status == Some(false) {
            let message = api_status.error.unwrap_or_else(|| "request refused".to_string());
            if message.to_ascii_lowercase().contains("api key") {
                return Err(BackendError::Auth { backend: BACKEND });
            }
            return Err(BackendError::rejected(BACKEND, status.as_u16(), message));
        }

        serde_json::from_value(body).map_err(|error| BackendError::malformed(BACKEND, error.to_string()))
    }
}

#[async_trait]
impl DownloadBackend for UsenetBackend {
    fn kind(&self) -> DownloadKind {
        DownloadKind::Usenet
    }

    #[instrument(skip(self), fields(api_url = %self.api_url))]
    async fn test_connection(&self) -> Result<bool, BackendError> {
        match self.call::<QueueResponse>(&[("mode", "queue"), ("limit", "1")]).await {
            Ok(_) => Ok(true),
            Err(BackendError::Auth { .. } | BackendError::Rejected { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    #[instrument(skip(self, spec), fields(tag = %spec.tag))]
    async fn add(&self, spec: &DownloadSpec) -> Result<String, BackendError> {
        let mut params = vec![
            ("mode", "addurl"),
            ("name", spec.source_url.as_str()),
            ("nzbname", spec.name.as_str()),
        ];
        if let Some(category) = spec.category.as_deref() {
            params.push(("cat", category));
        }
        let response: AddResponse = self.call(&params).await?;
        let nzo_id = response
            .nzo_ids
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::malformed(BACKEND, "addurl returned no job id"))?;
        debug!(nzo_id = %nzo_id, "nzb added");
        Ok(nzo_id)
    }

    #[instrument(skip(self))]
    async fn status(&self, external_id: &str) -> Result<BackendStatus, BackendError> {
        let queue: QueueResponse = self
            .call(&[("mode", "queue"), ("nzo_ids", external_id)])
            .await?;
        if let Some(slot) = queue.queue.slots.into_iter().find(|s| s.nzo_id == external_id) {
            return Ok(BackendStatus {
                progress: parse_percentage(&slot.percentage),
                state: map_queue_status(&slot.status),
                download_path: None,
                message: None,
            });
        }

        let history: HistoryResponse = self
            .call(&[("mode", "history"), ("nzo_ids", external_id)])
            .await?;
        let slot = history
            .history
            .slots
            .into_iter()
            .find(|s| s.nzo_id == external_id)
            .ok_or_else(|| BackendError::not_found(BACKEND, external_id))?;

        let state = map_history_status(&slot.status);
        Ok(BackendStatus {
            progress: if state == BackendState::Failed { 0 } else { 100 },
            state,
            download_path: slot.storage.filter(|path| !path.is_empty()),
            message: slot.fail_message.filter(|message| !message.is_empty()),
        })
    }

    #[instrument(skip(self))]
    async fn remove(&self, external_id: &str, delete_files: bool) -> Result<bool, BackendError> {
        let del_files = if delete_files { "1" } else { "0" };
        let queue: ApiStatus = self
            .call(&[("mode", "queue"), ("name", "delete"), ("value", external_id), ("del_files", del_files)])
            .await?;
        if queue.status == Some(true) {
            return Ok(true);
        }
        let history: ApiStatus = self
            .call(&[("mode", "history"), ("name", "delete"), ("value", external_id), ("del_files", del_files)])
            .await?;
        Ok(history.status == Some(true))
    }
}

fn parse_percentage(raw: &str) -> u8 {
    raw.trim()
        .parse::<u16>()
        .map_or(0, |value| u8::try_from(value.min(100)).unwrap_or(100))
}

fn map_queue_status(status: &str) -> BackendState {
    match status {
        "Paused" => BackendState::Paused,
        "Queued" | "Grabbing" | "Fetching" | "Propagating" => BackendState::Queued,
        _ => BackendState::Downloading,
    }
}

fn map_history_status(status: &str) -> BackendState {
    match status {
        "Completed" => BackendState::Completed,
        "Failed" => BackendState::Failed,
        // Verifying, Repairing, Extracting, Moving, Running: post-download work
        // still underway on the backend.
        _ => BackendState::Downloading,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_percentage() {
        assert_eq!(parse_percentage("45"), 45);
        assert_eq!(parse_percentage(" 100 "), 100);
        assert_eq!(parse_percentage("250"), 100);
        assert_eq!(parse_percentage("n/a"), 0);
    }

    #[test]
    fn test_queue_status_mapping() {
        assert_eq!(map_queue_status("Downloading"), BackendState::Downloading);
        assert_eq!(map_queue_status("Paused"), BackendState::Paused);
        assert_eq!(map_queue_status("Queued"), BackendState::Queued);
    }

    #[test]
    fn test_history_status_mapping() {
        assert_eq!(map_history_status("Completed"), BackendState::Completed);
        assert_eq!(map_history_status("Failed"), BackendState::Failed);
        assert_eq!(map_history_status("Extracting"), BackendState::Downloading);
    }
}
