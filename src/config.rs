//! TOML settings for the acquisition core.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working configuration:
//!
//! ```toml
//! [database]
//! path = "bookfetch.db"
//!
//! [retry]
//! base_delay_hours = 24
//! max_delay_days = 7
//! max_retries = 5
//!
//! [search]
//! preferred_download_type = "torrent"
//! auto_select = true
//!
//! [duplicates]
//! title_similarity = 0.9
//! active_duplicate_action = "block"
//!
//! [workers]
//! monitor_interval_secs = 30
//!
//! [backends]
//! request_timeout_secs = 30
//!
//! [indexer]
//! base_url = "http://localhost:9696"
//! api_key = "..."
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::backend::BackendTimeouts;
use crate::db::{DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_MAX_CONNECTIONS, DatabaseOptions};
use crate::duplicate::DuplicatePolicy;
use crate::retry::RetryPolicy;
use crate::store::DownloadKind;

/// Default database file, relative to the working directory.
pub const DEFAULT_DATABASE_PATH: &str = "bookfetch.db";

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but cannot be read.
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for [`Settings`].
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of its allowed range.
    #[error("Invalid config value for `{field}`: {message}\n  Suggestion: Fix or remove the value in the config file")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// `[database]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout_ms: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DATABASE_PATH),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl DatabaseSettings {
    /// Pool options for [`crate::Database::new_with_options`].
    #[must_use]
    pub fn options(&self) -> DatabaseOptions {
        DatabaseOptions {
            max_connections: self.max_connections,
            busy_timeout: Duration::from_millis(u64::from(self.busy_timeout_ms)),
        }
    }
}

/// `[search]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Technology ranked first; `None` ranks on seeders and size alone.
    pub preferred_download_type: Option<DownloadKind>,
    /// Dispatch the best result without waiting for a manual choice.
    pub auto_select: bool,
    /// Deadline for one indexer search.
    pub timeout_secs: u64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            preferred_download_type: None,
            auto_select: true,
            timeout_secs: 60,
        }
    }
}

impl SearchSettings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[workers]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub search_interval_secs: u64,
    pub dispatch_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub retry_interval_secs: u64,
    /// Most requests a single search sweep handles.
    pub search_batch_size: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            search_interval_secs: 60,
            dispatch_interval_secs: 30,
            monitor_interval_secs: 30,
            retry_interval_secs: 300,
            search_batch_size: 25,
        }
    }
}

/// `[indexer]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerSettings {
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

/// Complete settings file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub retry: RetryPolicy,
    pub search: SearchSettings,
    pub duplicates: DuplicatePolicy,
    pub workers: WorkerSettings,
    pub backends: BackendTimeouts,
    pub indexer: Option<IndexerSettings>,
}

impl Settings {
    /// Loads and validates settings from `path`.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "config file absent; using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        debug!(path = %path.display(), "config loaded");
        Ok(settings)
    }

    /// Validates values against runtime constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first out-of-range value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("database.max_connections", self.database.max_connections, 1..=20)?;
        check_range("database.busy_timeout_ms", self.database.busy_timeout_ms, 0..=120_000)?;

        check_range("retry.base_delay_hours", self.retry.base_delay_hours, 1..=8760)?;
        check_range("retry.max_delay_days", self.retry.max_delay_days, 1..=3650)?;
        check_range("retry.max_retries", self.retry.max_retries, 0..=1000)?;

        check_range("search.timeout_secs", self.search.timeout_secs, 1..=3600)?;

        check_fraction("duplicates.title_similarity", self.duplicates.title_similarity)?;
        check_fraction("duplicates.author_similarity", self.duplicates.author_similarity)?;

        check_range("workers.search_interval_secs", self.workers.search_interval_secs, 1..=86_400)?;
        check_range("workers.dispatch_interval_secs", self.workers.dispatch_interval_secs, 1..=86_400)?;
        check_range("workers.monitor_interval_secs", self.workers.monitor_interval_secs, 1..=86_400)?;
        check_range("workers.retry_interval_secs", self.workers.retry_interval_secs, 1..=86_400)?;
        check_range("workers.search_batch_size", self.workers.search_batch_size, 1..=1000)?;

        check_range("backends.connect_timeout_secs", self.backends.connect_timeout_secs, 1..=3600)?;
        check_range("backends.request_timeout_secs", self.backends.request_timeout_secs, 1..=3600)?;

        if let Some(indexer) = &self.indexer
            && url::Url::parse(&indexer.base_url).is_err()
        {
            return Err(ConfigError::Invalid {
                field: "indexer.base_url",
                message: format!("{:?} is not a URL", indexer.base_url),
            });
        }

        Ok(())
    }
}

fn check_range<T>(field: &'static str, value: T, range: std::ops::RangeInclusive<T>) -> Result<(), ConfigError>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            message: format!("{value}. Expected range: {}..={}", range.start(), range.end()),
        })
    }
}

fn check_fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            message: format!("{value}. Expected range: 0.0..=1.0"),
        })
    }
}
