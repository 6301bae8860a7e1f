//! Error types for download backend adapters.

use thiserror::Error;

/// Errors that can occur while talking to a download backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Transport failure: DNS, refused connection, TLS, or timeout.
    #[error(
        "cannot reach {backend} at {url}: {message}\n  Suggestion: Check that the download client is running and its base URL is correct"
    )]
    Connection {
        /// Backend family name.
        backend: &'static str,
        /// The URL that could not be reached.
        url: String,
        /// Transport error text.
        message: String,
    },

    /// The backend refused the configured credentials.
    #[error(
        "{backend} rejected the configured credentials\n  Suggestion: Check the client's username, password, or API key"
    )]
    Auth {
        /// Backend family name.
        backend: &'static str,
    },

    /// The backend has no job with this handle.
    #[error("{backend} has no job {external_id}")]
    NotFound {
        /// Backend family name.
        backend: &'static str,
        /// The handle that was looked up.
        external_id: String,
    },

    /// The backend answered with something that could not be interpreted.
    #[error("{backend} returned an unexpected response: {message}")]
    MalformedResponse {
        /// Backend family name.
        backend: &'static str,
        /// What was wrong with the response.
        message: String,
    },

    /// The backend understood and refused the operation.
    #[error("{backend} rejected the request (HTTP {status}): {message}")]
    Rejected {
        /// Backend family name.
        backend: &'static str,
        /// HTTP status code (200 when the refusal is carried in the body).
        status: u16,
        /// Backend-supplied reason.
        message: String,
    },

    /// The client row cannot be turned into a working adapter.
    #[error("invalid {backend} configuration: {message}\n  Suggestion: Fix the client with `bookfetch client add`")]
    InvalidConfig {
        /// Backend family name.
        backend: &'static str,
        /// What is wrong.
        message: String,
    },
}

impl BackendError {
    /// Creates a connection error.
    pub fn connection(backend: &'static str, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            backend,
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a connection error for an operation that exceeded its deadline.
    pub fn timeout(backend: &'static str, url: impl Into<String>) -> Self {
        Self::connection(backend, url, "operation timed out")
    }

    /// Creates a malformed-response error.
    pub fn malformed(backend: &'static str, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            backend,
            message: message.into(),
        }
    }

    /// Creates a rejection error.
    pub fn rejected(backend: &'static str, status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            backend,
            status,
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(backend: &'static str, external_id: impl Into<String>) -> Self {
        Self::NotFound {
            backend,
            external_id: external_id.into(),
        }
    }

    /// Creates an invalid-configuration error.
    pub fn invalid_config(backend: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            backend,
            message: message.into(),
        }
    }

    /// Classifies a reqwest error.
    ///
    /// Transport failures and timeouts become [`BackendError::Connection`];
    /// body decoding failures become [`BackendError::MalformedResponse`].
    pub fn from_reqwest(backend: &'static str, url: &str, error: &reqwest::Error) -> Self {
        if error.is_decode() {
            return Self::malformed(backend, error.to_string());
        }
        if let Some(status) = error.status() {
            return Self::from_status(backend, status.as_u16(), error.to_string());
        }
        Self::connection(backend, url, error.to_string())
    }

    /// Classifies a non-success HTTP status.
    pub fn from_status(backend: &'static str, status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::Auth { backend },
            502..=504 => Self::connection(backend, String::new(), format!("HTTP {status}")),
            _ => Self::rejected(backend, status, message),
        }
    }

    /// True for transport-level failures that may succeed later unchanged.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// True when the backend no longer knows the job.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_carries_suggestion() {
        let err = BackendError::connection("qbittorrent", "http://localhost:8080", "refused");
        let msg = err.to_string();
        assert!(msg.contains("http://localhost:8080"));
        assert!(msg.contains("Suggestion"));
        assert!(err.is_connection());
    }

    #[test]
    fn test_timeout_is_connection() {
        assert!(BackendError::timeout("sabnzbd", "http://sab").is_connection());
    }

    #[test]
    fn test_from_status_classification() {
        assert!(matches!(
            BackendError::from_status("sabnzbd", 403, "forbidden"),
            BackendError::Auth { .. }
        ));
        assert!(BackendError::from_status("sabnzbd", 503, "unavailable").is_connection());
        assert!(matches!(
            BackendError::from_status("sabnzbd", 415, "bad media"),
            BackendError::Rejected { status: 415, .. }
        ));
    }

    #[test]
    fn test_not_found_flag() {
        let err = BackendError::not_found("qbittorrent", "abc");
        assert!(err.is_not_found());
        assert!(!err.is_connection());
        assert!(err.to_string().contains("abc"));
    }
}
