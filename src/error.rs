//! Crate-level error taxonomy for lifecycle operations.

use thiserror::Error;

use crate::backend::BackendError;
use crate::store::{DownloadKind, StoreError};

/// Errors surfaced by lifecycle, orchestrator, and retry operations.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    /// Caller misuse; never retried.
    #[error("invalid operation: {0}")]
    Validation(String),

    /// The request does not exist.
    #[error("request {0} not found\n  Suggestion: List requests with `bookfetch request list`")]
    RequestNotFound(i64),

    /// A duplicate check refused the new request.
    #[error("request blocked as a duplicate: {reason}")]
    DuplicateBlocked {
        /// Why the request was refused.
        reason: String,
    },

    /// Transport failure talking to a backend or indexer; the request is left as-is.
    #[error("{0}")]
    Connection(#[source] BackendError),

    /// A backend understood and refused the operation.
    #[error("{0}")]
    Backend(#[source] BackendError),

    /// No enabled client can handle the download technology.
    #[error("no enabled {kind} download client\n  Suggestion: Add one with `bookfetch client add --type {kind}`")]
    NoClient {
        /// The technology that has no client.
        kind: DownloadKind,
    },

    /// Persistence failure.
    #[error(transparent)]
    Store(StoreError),
}

impl AcquisitionError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True for failures that leave the request untouched and may succeed later.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<BackendError> for AcquisitionError {
    fn from(error: BackendError) -> Self {
        if error.is_connection() {
            Self::Connection(error)
        } else {
            Self::Backend(error)
        }
    }
}

impl From<StoreError> for AcquisitionError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound {
                entity: "request",
                id,
            } => Self::RequestNotFound(id),
            other => Self::Store(other),
        }
    }
}
