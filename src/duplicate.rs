//! Duplicate detection for new requests.
//!
//! A target identity (work + format + language) is compared against every
//! non-failed request in the same format. Two books are the same work when
//! they share `(source, source_id)`, or when their normalized titles and
//! authors are similar enough under the configured thresholds; metadata
//! sources disagree on identifiers for the same book often enough that the
//! fuzzy path matters.
//!
//! The guard only classifies; it never writes.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::store::{BookFormat, RequestStatus, RequestWithBook, Store, StoreError};

/// Default minimum normalized-Levenshtein similarity for titles.
pub const DEFAULT_TITLE_SIMILARITY: f64 = 0.9;

/// Default minimum normalized-Levenshtein similarity for authors.
pub const DEFAULT_AUTHOR_SIMILARITY: f64 = 0.8;

/// Leading articles ignored when comparing titles.
const LEADING_ARTICLES: [&str; 3] = ["the ", "a ", "an "];

/// How to react to one kind of conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateAction {
    Allow,
    Warn,
    Block,
}

/// Thresholds and reactions for duplicate classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicatePolicy {
    /// 0.0-1.0.
    pub title_similarity: f64,
    /// 0.0-1.0.
    pub author_similarity: f64,
    /// Same work, format, and language requested but not yet acquired.
    pub active_duplicate_action: DuplicateAction,
    /// Same work and format exists in another language.
    pub language_mismatch_action: DuplicateAction,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self {
            title_similarity: DEFAULT_TITLE_SIMILARITY,
            author_similarity: DEFAULT_AUTHOR_SIMILARITY,
            active_duplicate_action: DuplicateAction::Block,
            language_mismatch_action: DuplicateAction::Warn,
        }
    }
}

/// The identity being requested.
#[derive(Debug, Clone)]
pub struct DuplicateTarget {
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub author: Option<String>,
    pub format: BookFormat,
    pub language: Option<String>,
}

/// Outcome of a duplicate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateVerdict {
    Allow,
    Warn { request_id: i64, reason: String },
    Block { request_id: i64, reason: String },
}

impl DuplicateVerdict {
    fn severity(&self) -> DuplicateAction {
        match self {
            Self::Allow => DuplicateAction::Allow,
            Self::Warn { .. } => DuplicateAction::Warn,
            Self::Block { .. } => DuplicateAction::Block,
        }
    }

    fn from_action(action: DuplicateAction, request_id: i64, reason: String) -> Self {
        match action {
            DuplicateAction::Allow => Self::Allow,
            DuplicateAction::Warn => Self::Warn { request_id, reason },
            DuplicateAction::Block => Self::Block { request_id, reason },
        }
    }

    /// True when the request must not be created.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Block { .. })
    }
}

/// Store-backed duplicate classifier.
#[derive(Debug, Clone)]
pub struct DuplicateGuard {
    store: Store,
    policy: DuplicatePolicy,
}

impl DuplicateGuard {
    #[must_use]
    pub fn new(store: Store, policy: DuplicatePolicy) -> Self {
        Self { store, policy }
    }

    /// Classifies `target` against the stored requests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the existing requests cannot be read.
    #[instrument(skip(self, target), fields(source = %target.source, source_id = %target.source_id, format = %target.format))]
    pub async fn check(&self, target: &DuplicateTarget) -> Result<DuplicateVerdict, StoreError> {
        let existing = self.store.list_requests_for_duplicate_check(target.format).await?;
        let verdict = classify(target, &existing, &self.policy);
        debug!(?verdict, candidates = existing.len(), "duplicate check finished");
        Ok(verdict)
    }
}

/// Pure classification; the most severe conflict wins, earliest request on ties.
#[must_use]
pub fn classify(
    target: &DuplicateTarget,
    existing: &[RequestWithBook],
    policy: &DuplicatePolicy,
) -> DuplicateVerdict {
    let mut verdict = DuplicateVerdict::Allow;

    for candidate in existing {
        if candidate.status == RequestStatus::Failed
            || candidate.format != target.format
            || !same_work(target, candidate, policy)
        {
            continue;
        }

        let next = if same_language(target.language.as_deref(), candidate.language.as_deref()) {
            if candidate.status == RequestStatus::Completed {
                DuplicateVerdict::Block {
                    request_id: candidate.request_id,
                    reason: format!(
                        "\"{}\" is already acquired as {} (request {})",
                        candidate.title, candidate.format, candidate.request_id
                    ),
                }
            } else {
                DuplicateVerdict::from_action(
                    policy.active_duplicate_action,
                    candidate.request_id,
                    format!(
                        "\"{}\" is already requested as {} (request {}, {})",
                        candidate.title, candidate.format, candidate.request_id, candidate.status
                    ),
                )
            }
        } else {
            DuplicateVerdict::from_action(
                policy.language_mismatch_action,
                candidate.request_id,
                format!(
                    "\"{}\" exists in another language ({}) as request {}",
                    candidate.title,
                    candidate.language.as_deref().unwrap_or("unknown"),
                    candidate.request_id
                ),
            )
        };

        if next.severity() > verdict.severity() {
            verdict = next;
        }
    }

    verdict
}

fn same_work(target: &DuplicateTarget, candidate: &RequestWithBook, policy: &DuplicatePolicy) -> bool {
    if target.source == candidate.source && target.source_id == candidate.source_id {
        return true;
    }

    let title_score = strsim::normalized_levenshtein(
        &normalize_title(&target.title),
        &normalize_title(&candidate.title),
    );
    if title_score < policy.title_similarity {
        return false;
    }

    // A missing author on either side leaves the title to decide.
    match (target.author.as_deref(), candidate.author.as_deref()) {
        (Some(left), Some(right)) => {
            strsim::normalized_levenshtein(&normalize(left), &normalize(right))
                >= policy.author_similarity
        }
        _ => true,
    }
}

/// Unknown language on either side counts as the same language.
fn same_language(left: Option<&str>, right: Option<&str>) -> bool {
    match (left, right) {
        (Some(left), Some(right)) => left.trim().eq_ignore_ascii_case(right.trim()),
        _ => true,
    }
}

/// Lowercases, maps punctuation to spaces, and collapses whitespace.
fn normalize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .flat_map(char::to_lowercase)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_title(value: &str) -> String {
    let normalized = normalize(value);
    LEADING_ARTICLES
        .iter()
        .find_map(|article| normalized.strip_prefix(article))
        .map_or_else(|| normalized.clone(), str::to_string)
}
