//! Source fetching and per-kind payload adapters.
//!
//! This crate provides:
//! - [`SourceFetcher`]: the seam the cycle coordinator fetches through
//! - [`HttpFetcher`]: reqwest-backed implementation with SSRF protection
//! - [`adapters`]: RSS/Atom feed, arXiv search and JSON listing parsers

pub mod adapters;
pub mod engine;

use async_trait::async_trait;
use biothreat_shared::{DocumentCandidate, Result, Source};
use chrono::{DateTime, Utc};

pub use adapters::{AdapterRegistry, FeedAdapter, ListingAdapter, SearchAdapter, SourceAdapter};
pub use engine::HttpFetcher;

/// Retrieves candidate documents for one source.
///
/// Implementations have no storage side effects. Any failure to obtain or
/// parse the source's payload is reported as `SourceUnavailable`.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Entries published after `since` (all entries when `None`), in source order.
    async fn fetch(
        &self,
        source: &Source,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DocumentCandidate>>;
}
