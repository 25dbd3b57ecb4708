//! Source adapter trait and built-in adapters, one per [`SourceKind`].
//!
//! An adapter turns a source endpoint into a request URL and the response
//! body into candidates. HTTP, filtering and limits live in the engine.

mod feed;
mod listing;
mod search;

use biothreat_shared::{DocumentCandidate, Result, Source, SourceKind, content_hash};
use chrono::{DateTime, Utc};
use scraper::Html;
use url::Url;

pub use feed::{FeedAdapter, FeedEntry, parse_feed};
pub use listing::ListingAdapter;
pub use search::SearchAdapter;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Kind-specific request building and payload parsing.
pub trait SourceAdapter: Send + Sync {
    /// The source kind this adapter serves.
    fn kind(&self) -> SourceKind;

    /// URL to GET for `source`.
    fn request_url(&self, source: &Source, max_items: usize) -> Result<Url>;

    /// Parse a response body into candidates, in payload order.
    fn parse(&self, body: &str) -> Result<Vec<DocumentCandidate>>;

    /// Human-readable adapter name for tracing.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Holds one adapter per source kind.
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    /// Create a registry with all built-in adapters.
    pub fn new() -> Self {
        Self {
            adapters: vec![
                Box::new(FeedAdapter),
                Box::new(SearchAdapter::default()),
                Box::new(ListingAdapter),
            ],
        }
    }

    /// Adapter for `kind`, if one is registered.
    pub fn for_kind(&self, kind: SourceKind) -> Option<&dyn SourceAdapter> {
        self.adapters
            .iter()
            .find(|a| a.kind() == kind)
            .map(|a| a.as_ref())
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Reduce HTML (or plain text) to whitespace-collapsed text.
pub(crate) fn clean_text(raw: &str) -> String {
    let text = if raw.contains('<') {
        let fragment = Html::parse_fragment(raw);
        fragment.root_element().text().collect::<Vec<_>>().join(" ")
    } else {
        raw.to_string()
    };
    collapse_whitespace(&text)
}

pub(crate) fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Identity of an entry within its source: guid/id, else link, else title hash.
pub(crate) fn external_id(id: Option<&str>, link: Option<&str>, title: &str) -> String {
    id.map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| link.map(str::trim).filter(|s| !s.is_empty()))
        .map(str::to_string)
        .unwrap_or_else(|| content_hash(title.trim()))
}

/// Parse RFC 3339 (Atom, JSON) or RFC 2822 (RSS) timestamps.
pub(crate) fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_kind() {
        let registry = AdapterRegistry::new();
        for kind in [SourceKind::Feed, SourceKind::Search, SourceKind::Static] {
            let adapter = registry.for_kind(kind).expect("adapter registered");
            assert_eq!(adapter.kind(), kind);
        }
    }

    #[test]
    fn clean_text_strips_markup() {
        assert_eq!(
            clean_text("<p>Protein <b>design</b>\n\n at   scale</p>"),
            "Protein design at scale"
        );
        assert_eq!(clean_text("  plain\ttext "), "plain text");
    }

    #[test]
    fn external_id_fallbacks() {
        assert_eq!(external_id(Some("guid-1"), Some("https://x"), "T"), "guid-1");
        assert_eq!(external_id(Some("  "), Some("https://x"), "T"), "https://x");
        let hashed = external_id(None, None, "Title");
        assert_eq!(hashed, content_hash("Title"));
    }

    #[test]
    fn parses_common_date_formats() {
        assert!(parse_date("2026-03-01T12:00:00Z").is_some());
        assert!(parse_date("Sun, 01 Mar 2026 12:00:00 GMT").is_some());
        assert!(parse_date("Sun, 01 Mar 2026 12:00:00 +0000").is_some());
        assert!(parse_date("2026-03-01").is_some());
        assert!(parse_date("last week").is_none());
    }
}
