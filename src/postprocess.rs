//! Post-processing seam notified when a download completes.
//!
//! File organization and delivery are owned by the collaborator behind
//! [`PostProcessor`]. The core only hands over the request and the finished
//! download and reacts to the outcome.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::store::{Download, Request};

/// What the collaborator did with a finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcessOutcome {
    /// The files are in their final place; the request can complete.
    Delivered { location: String },
    /// The collaborator took the job and will finish it later.
    Deferred,
}

/// Post-processing failure; the request is flagged for attention.
#[derive(Debug, Clone, Error)]
#[error("post-processing failed for request {request_id}: {message}")]
pub struct PostProcessError {
    pub request_id: i64,
    pub message: String,
}

/// Collaborator notified with each completed download.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn process(
        &self,
        request: &Request,
        download: &Download,
    ) -> Result<PostProcessOutcome, PostProcessError>;
}

/// Accepts the backend's download location as the delivered location.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptInPlace;

#[async_trait]
impl PostProcessor for AcceptInPlace {
    async fn process(
        &self,
        request: &Request,
        download: &Download,
    ) -> Result<PostProcessOutcome, PostProcessError> {
        let location = download
            .download_path
            .clone()
            .filter(|path| !path.trim().is_empty())
            .ok_or_else(|| PostProcessError {
                request_id: request.id,
                message: format!("download {} finished without a reported location", download.id),
            })?;
        info!(request_id = request.id, download_id = download.id, location = %location, "delivered in place");
        Ok(PostProcessOutcome::Delivered { location })
    }
}
