//! Core domain types for the threat forecaster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ForecastError;

/// Generate a new time-sortable identifier (UUID v7).
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// SHA-256 of `content`, hex encoded.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// How a source's endpoint is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// RSS 2.0 or Atom feed.
    Feed,
    /// arXiv-style Atom search API.
    Search,
    /// JSON listing of entries.
    Static,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feed => "feed",
            Self::Search => "search",
            Self::Static => "static",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = ForecastError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "feed" | "rss" | "atom" => Ok(Self::Feed),
            "search" | "api" => Ok(Self::Search),
            "static" | "listing" => Ok(Self::Static),
            other => Err(ForecastError::validation(format!(
                "unknown source kind '{other}' (expected feed, search or static)"
            ))),
        }
    }
}

/// A registered publication source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    /// Unique display name.
    pub name: String,
    pub kind: SourceKind,
    /// Feed URL, search query/URL, or listing URL depending on `kind`.
    pub endpoint: String,
    /// Free-form grouping (e.g. "preprint", "journal", "news").
    pub category: String,
    /// Inactive sources are skipped by the fetch stage.
    pub active: bool,
    /// Watermark: start time of the last cycle that fetched this source successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Source {
    /// Build a new, active source with a fresh id.
    pub fn new(
        name: impl Into<String>,
        kind: SourceKind,
        endpoint: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            kind,
            endpoint: endpoint.into(),
            category: category.into(),
            active: true,
            last_fetched_at: None,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// An entry returned by a fetch, before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentCandidate {
    /// Source-scoped identity (guid, link, or title hash).
    pub external_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<String>,
    /// Plain text (abstract or summary).
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl DocumentCandidate {
    /// Hash over the fields that make up the stored content.
    pub fn content_hash(&self) -> String {
        content_hash(&format!("{}\n{}", self.title, self.body))
    }
}

/// A stored document. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_id: String,
    pub external_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<String>,
    pub body: String,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub retrieved_at: DateTime<Utc>,
}

impl Document {
    /// Materialize a candidate fetched from `source_id`.
    pub fn from_candidate(source_id: &str, candidate: DocumentCandidate) -> Self {
        let hash = candidate.content_hash();
        Self {
            id: new_id(),
            source_id: source_id.to_string(),
            external_id: candidate.external_id,
            title: candidate.title,
            url: candidate.url,
            authors: candidate.authors,
            body: candidate.body,
            content_hash: hash,
            published_at: candidate.published_at,
            retrieved_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// A capability statement accepted by the extractor, not yet stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCandidate {
    pub statement: String,
    /// Lower-cased, whitespace-collapsed form used for de-duplication.
    pub normalized: String,
    pub confidence: f64,
}

/// A stored capability extracted from a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub document_id: String,
    pub statement: String,
    pub normalized_statement: String,
    pub confidence: f64,
    pub model_id: String,
    pub extracted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Threat catalog
// ---------------------------------------------------------------------------

/// A curated threat category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatCategory {
    pub id: String,
    pub name: String,
    pub group: String,
    pub description: String,
    /// Enabling capabilities that would advance this threat.
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_estimate: Option<String>,
    /// Hash of the descriptive fields; a change invalidates earlier scores.
    pub content_hash: String,
}

impl ThreatCategory {
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        description: impl Into<String>,
        criteria: Vec<String>,
        timeline_estimate: Option<String>,
    ) -> Self {
        let mut category = Self {
            id: new_id(),
            name: name.into(),
            group: group.into(),
            description: description.into(),
            criteria,
            timeline_estimate,
            content_hash: String::new(),
        };
        category.content_hash = category.compute_hash();
        category
    }

    /// Hash over the fields a scoring call sees.
    pub fn compute_hash(&self) -> String {
        content_hash(&format!(
            "{}\n{}\n{}\n{}",
            self.name,
            self.group,
            self.description,
            self.criteria.join("\n")
        ))
    }
}

/// Assessed severity of a threat category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Mappings
// ---------------------------------------------------------------------------

/// A scored capability-to-threat mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub id: String,
    pub capability_id: String,
    pub threat_category_id: String,
    pub feasibility_score: f64,
    pub rationale: String,
    /// Category content hash at scoring time.
    pub category_hash: String,
    pub model_id: String,
    pub scored_at: DateTime<Utc>,
    /// Only the latest mapping per pair is active.
    pub active: bool,
}

/// A mapping joined with its capability, category and provenance, for reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingView {
    pub mapping_id: String,
    pub feasibility_score: f64,
    pub rationale: String,
    pub scored_at: DateTime<Utc>,
    pub capability_statement: String,
    pub capability_confidence: f64,
    pub category_name: String,
    pub category_group: String,
    pub document_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_url: Option<String>,
    pub source_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_is_time_sortable() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert!(a < b, "{a} should sort before {b}");
    }

    #[test]
    fn source_kind_parses_aliases() {
        assert_eq!("feed".parse::<SourceKind>().unwrap(), SourceKind::Feed);
        assert_eq!("RSS".parse::<SourceKind>().unwrap(), SourceKind::Feed);
        assert_eq!("search".parse::<SourceKind>().unwrap(), SourceKind::Search);
        assert_eq!("static".parse::<SourceKind>().unwrap(), SourceKind::Static);
        assert!("ftp".parse::<SourceKind>().is_err());
    }

    #[test]
    fn source_kind_serde() {
        let json = serde_json::to_string(&SourceKind::Search).unwrap();
        assert_eq!(json, "\"search\"");
        let kind: SourceKind = serde_json::from_str("\"static\"").unwrap();
        assert_eq!(kind, SourceKind::Static);
    }

    #[test]
    fn category_hash_tracks_content() {
        let a = ThreatCategory::new(
            "Pathogen Design",
            "Design",
            "AI-assisted design of novel pathogens",
            vec!["protein structure prediction".into()],
            None,
        );
        let mut b = a.clone();
        assert_eq!(a.content_hash, b.compute_hash());

        b.criteria.push("genome synthesis planning".into());
        assert_ne!(a.content_hash, b.compute_hash());
        assert_eq!(a.content_hash.len(), 64);
    }

    #[test]
    fn document_from_candidate_hashes_content() {
        let candidate = DocumentCandidate {
            external_id: "abc".into(),
            title: "Title".into(),
            url: None,
            authors: None,
            body: "Body".into(),
            published_at: None,
        };
        let doc = Document::from_candidate("src-1", candidate.clone());
        assert_eq!(doc.source_id, "src-1");
        assert_eq!(doc.external_id, "abc");
        assert_eq!(doc.content_hash, candidate.content_hash());
    }
}
