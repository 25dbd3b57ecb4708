//! arXiv-style Atom search API adapter.

use biothreat_shared::{DocumentCandidate, ForecastError, Result, Source, SourceKind};
use url::Url;

use super::{FeedEntry, SourceAdapter, parse_feed};

const DEFAULT_API_BASE: &str = "https://export.arxiv.org/api/query";

/// Queries a search API that answers in Atom.
///
/// A full `http(s)://` endpoint is used as-is; anything else is treated as
/// a search query against the arXiv export API, newest submissions first.
pub struct SearchAdapter {
    api_base: String,
}

impl SearchAdapter {
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
        }
    }
}

impl Default for SearchAdapter {
    fn default() -> Self {
        Self::with_api_base(DEFAULT_API_BASE)
    }
}

/// `cat:cs.AI` passes through; `protein design` becomes `all:protein AND all:design`.
fn search_query(raw: &str) -> String {
    let raw = raw.trim();
    if raw.contains(':') {
        return raw.to_string();
    }
    raw.split_whitespace()
        .map(|term| format!("all:{term}"))
        .collect::<Vec<_>>()
        .join(" AND ")
}

impl SourceAdapter for SearchAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Search
    }

    fn request_url(&self, source: &Source, max_items: usize) -> Result<Url> {
        let endpoint = source.endpoint.trim();
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Url::parse(endpoint).map_err(|e| {
                ForecastError::validation(format!("invalid search URL '{endpoint}': {e}"))
            });
        }
        if endpoint.is_empty() {
            return Err(ForecastError::validation(format!(
                "source '{}' has an empty search query",
                source.name
            )));
        }

        let max_results = max_items.max(1).to_string();
        Url::parse_with_params(
            &self.api_base,
            &[
                ("search_query", search_query(endpoint).as_str()),
                ("sortBy", "submittedDate"),
                ("sortOrder", "descending"),
                ("max_results", max_results.as_str()),
            ],
        )
        .map_err(|e| ForecastError::validation(format!("invalid search API base: {e}")))
    }

    fn parse(&self, body: &str) -> Result<Vec<DocumentCandidate>> {
        Ok(parse_feed(body)?
            .into_iter()
            .filter_map(FeedEntry::into_candidate)
            .collect())
    }

    fn name(&self) -> &str {
        "search"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_query_expands_to_arxiv_api() {
        let source = Source::new("arXiv AI", SourceKind::Search, "cat:cs.AI", "preprints");
        let url = SearchAdapter::default().request_url(&source, 20).unwrap();
        assert_eq!(url.host_str(), Some("export.arxiv.org"));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("search_query".into(), "cat:cs.AI".into())));
        assert!(pairs.contains(&("sortBy".into(), "submittedDate".into())));
        assert!(pairs.contains(&("max_results".into(), "20".into())));
    }

    #[test]
    fn free_text_terms_are_anded() {
        assert_eq!(search_query("protein  design"), "all:protein AND all:design");
        assert_eq!(search_query("cat:q-bio.BM"), "cat:q-bio.BM");
    }

    #[test]
    fn full_url_passes_through() {
        let source = Source::new(
            "custom",
            SourceKind::Search,
            "https://export.arxiv.org/api/query?search_query=cat:cs.LG",
            "preprints",
        );
        let url = SearchAdapter::default().request_url(&source, 5).unwrap();
        assert_eq!(url.as_str(), "https://export.arxiv.org/api/query?search_query=cat:cs.LG");
    }

    #[test]
    fn empty_query_is_rejected() {
        let source = Source::new("empty", SourceKind::Search, "  ", "preprints");
        assert!(SearchAdapter::default().request_url(&source, 5).is_err());
    }
}
