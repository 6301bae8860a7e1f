//! Ordering of a request's candidate releases.
//!
//! Ranking is deterministic: a stable sort over three keys.
//!
//! 1. Downloadable results before non-downloadable ones.
//! 2. Shape tier under the configured preferred technology. Under torrent
//!    preference, magnet-bearing torrents come first, then link-only torrents,
//!    then usenet. Under usenet preference, usenet comes first, then torrents.
//!    Without a preference every downloadable result shares one tier.
//! 3. Seeders descending (unknown last), then size ascending (unknown last).
//!
//! Ties keep the input order.

use std::cmp::{Ordering, Reverse};

use crate::store::{DownloadKind, SearchResult};

/// Orders search results best-first for a preferred download technology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchResultRanker {
    preferred: Option<DownloadKind>,
}

impl SearchResultRanker {
    /// Creates a ranker; `None` ranks on seeders and size alone.
    #[must_use]
    pub fn new(preferred: Option<DownloadKind>) -> Self {
        Self { preferred }
    }

    /// The configured preferred technology.
    #[must_use]
    pub fn preferred(&self) -> Option<DownloadKind> {
        self.preferred
    }

    /// Returns `results` ordered best-first.
    #[must_use]
    pub fn rank<'a>(&self, results: &'a [SearchResult]) -> Vec<&'a SearchResult> {
        let mut ranked: Vec<&SearchResult> = results.iter().collect();
        ranked.sort_by(|a, b| self.compare(a, b));
        ranked
    }

    /// The best downloadable result, if any.
    #[must_use]
    pub fn best<'a>(&self, results: &'a [SearchResult]) -> Option<&'a SearchResult> {
        self.rank(results)
            .into_iter()
            .find(|result| result.is_downloadable())
    }

    fn compare(&self, a: &SearchResult, b: &SearchResult) -> Ordering {
        (!a.is_downloadable())
            .cmp(&!b.is_downloadable())
            .then_with(|| self.tier(a).cmp(&self.tier(b)))
            .then_with(|| seeders_key(a).cmp(&seeders_key(b)))
            .then_with(|| size_key(a).cmp(&size_key(b)))
    }

    fn tier(&self, result: &SearchResult) -> u8 {
        match self.preferred {
            None => 0,
            Some(DownloadKind::Torrent) => {
                if result.magnet_url.is_some() {
                    0
                } else if result.is_torrent_shaped() {
                    1
                } else {
                    2
                }
            }
            Some(DownloadKind::Usenet) => u8::from(!result.is_usenet_shaped()),
        }
    }
}

/// Known seeders first (most first), unknown last.
fn seeders_key(result: &SearchResult) -> (bool, Reverse<i64>) {
    match result.seeders {
        Some(seeders) => (false, Reverse(seeders)),
        None => (true, Reverse(0)),
    }
}

/// Known sizes first (smallest first), unknown last.
fn size_key(result: &SearchResult) -> (bool, i64) {
    match result.size_bytes {
        Some(size) => (false, size),
        None => (true, 0),
    }
}
