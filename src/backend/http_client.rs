//! Shared HTTP client construction policy for backend adapters and the indexer.
//!
//! Every outbound client gets the same timeouts, User-Agent, and compression,
//! plus an optional cookie jar for session-authenticated backends.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use reqwest::cookie::Jar;
use reqwest::{ClientBuilder, Proxy};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::user_agent;

use super::BackendError;

/// Default connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default whole-request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Timeouts applied to every backend HTTP call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendTimeouts {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for BackendTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl BackendTimeouts {
    /// The outer deadline for one adapter operation, which may span several requests.
    #[must_use]
    pub fn operation_deadline(&self) -> Duration {
        // Login plus the call itself.
        Duration::from_secs(self.request_timeout_secs.saturating_mul(2).max(1))
    }
}

/// Builds an HTTP client using shared project policy.
///
/// `backend` is used only for error messages and logging.
///
/// # Errors
///
/// Returns [`BackendError::InvalidConfig`] when client construction fails.
pub fn build_backend_http_client(
    backend: &'static str,
    timeouts: BackendTimeouts,
    cookie_jar: Option<Arc<Jar>>,
) -> Result<Client, BackendError> {
    match try_build_client(timeouts, cookie_jar.clone(), false) {
        Ok(client) => Ok(client),
        Err(BuildClientFailure::Panic) => {
            // Some sandboxed hosts panic when querying system proxy settings.
            warn!(
                backend,
                "HTTP client hit system proxy panic; using env-proxy fallback builder"
            );
            match try_build_client(timeouts, cookie_jar, true) {
                Ok(client) => Ok(client),
                Err(BuildClientFailure::Panic) => Err(BackendError::invalid_config(
                    backend,
                    "HTTP client construction panicked",
                )),
                Err(BuildClientFailure::Build(error)) => Err(BackendError::invalid_config(
                    backend,
                    format!("HTTP client construction failed: {error}"),
                )),
            }
        }
        Err(BuildClientFailure::Build(error)) => Err(BackendError::invalid_config(
            backend,
            format!("HTTP client construction failed: {error}"),
        )),
    }
}

/// Parses a client's base URL, normalizing it to end with `/` so endpoint
/// paths join beneath it.
///
/// # Errors
///
/// Returns [`BackendError::InvalidConfig`] for unparseable or non-HTTP URLs.
pub(crate) fn parse_base_url(backend: &'static str, raw: &str) -> Result<Url, BackendError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|error| BackendError::invalid_config(backend, format!("base URL {raw:?}: {error}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(BackendError::invalid_config(
            backend,
            format!("base URL {raw:?} must use http or https"),
        ));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Joins `path` beneath a base URL produced by [`parse_base_url`].
///
/// # Errors
///
/// Returns [`BackendError::InvalidConfig`] if the join fails.
pub(crate) fn endpoint(backend: &'static str, base: &Url, path: &str) -> Result<Url, BackendError> {
    base.join(path)
        .map_err(|error| BackendError::invalid_config(backend, format!("endpoint {path}: {error}")))
}

enum BuildClientFailure {
    Panic,
    Build(reqwest::Error),
}

fn try_build_client(
    timeouts: BackendTimeouts,
    cookie_jar: Option<Arc<Jar>>,
    disable_system_proxy_lookup: bool,
) -> Result<Client, BuildClientFailure> {
    catch_unwind(AssertUnwindSafe(move || {
        let mut builder = base_builder(timeouts, cookie_jar);
        if disable_system_proxy_lookup {
            builder = apply_env_proxy_fallback(builder.no_proxy());
        }
        builder.build().map_err(BuildClientFailure::Build)
    }))
    .map_err(|_| BuildClientFailure::Panic)?
}

fn base_builder(timeouts: BackendTimeouts, cookie_jar: Option<Arc<Jar>>) -> ClientBuilder {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(timeouts.connect_timeout_secs))
        .timeout(Duration::from_secs(timeouts.request_timeout_secs))
        .user_agent(user_agent::default_user_agent())
        .gzip(true);

    if let Some(jar) = cookie_jar {
        builder = builder.cookie_provider(jar);
    }

    builder
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    for (scheme, names) in [
        ("https", ["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"]),
        ("http", ["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"]),
    ] {
        let Some(proxy) = find_first_proxy_var(&names) else {
            continue;
        };
        let resolved = if scheme == "https" {
            Proxy::https(&proxy)
        } else {
            Proxy::http(&proxy)
        };
        if let Ok(resolved) = resolved {
            builder = builder.proxy(resolved);
        }
    }
    builder
}

fn find_first_proxy_var(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}
