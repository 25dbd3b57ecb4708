//! JSON listing adapter for static sources.

use biothreat_shared::{DocumentCandidate, ForecastError, Result, Source, SourceKind};
use serde::Deserialize;
use url::Url;

use super::{SourceAdapter, clean_text, collapse_whitespace, external_id, parse_date};

/// Reads a JSON array (or `{"items": [...]}`) of entries.
pub struct ListingAdapter;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Listing {
    Bare(Vec<ListingEntry>),
    Wrapped { items: Vec<ListingEntry> },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Authors {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct ListingEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "summary", alias = "abstract")]
    text: Option<String>,
    #[serde(default, alias = "link")]
    url: Option<String>,
    #[serde(default)]
    authors: Option<Authors>,
    #[serde(default, alias = "published_at", alias = "date")]
    published: Option<String>,
}

impl ListingEntry {
    fn into_candidate(self) -> Option<DocumentCandidate> {
        let title = collapse_whitespace(self.title.as_deref().unwrap_or_default());
        let body = clean_text(self.text.as_deref().unwrap_or_default());
        if title.is_empty() || body.is_empty() {
            tracing::debug!(?self.id, "listing entry without title or text, skipping");
            return None;
        }
        let authors = match self.authors {
            Some(Authors::One(s)) => Some(s),
            Some(Authors::Many(v)) if !v.is_empty() => Some(v.join(", ")),
            _ => None,
        };
        Some(DocumentCandidate {
            external_id: external_id(self.id.as_deref(), self.url.as_deref(), &title),
            title,
            url: self.url,
            authors,
            body,
            published_at: self.published.as_deref().and_then(parse_date),
        })
    }
}

impl SourceAdapter for ListingAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Static
    }

    fn request_url(&self, source: &Source, _max_items: usize) -> Result<Url> {
        Url::parse(source.endpoint.trim()).map_err(|e| {
            ForecastError::validation(format!("invalid listing URL '{}': {e}", source.endpoint))
        })
    }

    fn parse(&self, body: &str) -> Result<Vec<DocumentCandidate>> {
        let listing: Listing = serde_json::from_str(body)
            .map_err(|e| ForecastError::parse(format!("invalid JSON listing: {e}")))?;
        let entries = match listing {
            Listing::Bare(entries) | Listing::Wrapped { items: entries } => entries,
        };
        Ok(entries
            .into_iter()
            .filter_map(ListingEntry::into_candidate)
            .collect())
    }

    fn name(&self) -> &str {
        "listing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_array() {
        let body = r#"[
            {"id": "p1", "title": "Benchtop synthesis", "text": "<p>Automated DNA synthesis.</p>",
             "url": "https://example.com/p1", "authors": ["X", "Y"], "published": "2026-02-01T00:00:00Z"},
            {"title": "No body"}
        ]"#;
        let candidates = ListingAdapter.parse(body).unwrap();
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.external_id, "p1");
        assert_eq!(c.body, "Automated DNA synthesis.");
        assert_eq!(c.authors.as_deref(), Some("X, Y"));
        assert!(c.published_at.is_some());
    }

    #[test]
    fn parses_wrapped_items_with_aliases() {
        let body = r#"{"items": [{"title": "T", "summary": "S", "link": "https://example.com/t", "authors": "Z"}]}"#;
        let candidates = ListingAdapter.parse(body).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].external_id, "https://example.com/t");
        assert_eq!(candidates[0].authors.as_deref(), Some("Z"));
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(ListingAdapter.parse("<html/>").is_err());
        assert!(ListingAdapter.parse(r#"{"entries": 3}"#).is_err());
    }
}
