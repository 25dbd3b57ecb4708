//! Source registration, catalog seeding/import, and manual document entry.

use std::path::Path;

use biothreat_shared::{
    Document, DocumentCandidate, ForecastError, Result, Source, SourceKind, ThreatCategory,
    content_hash,
};
use biothreat_storage::{CategoryUpsert, Storage};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

const SEED_SOURCES: &str = include_str!("../seeds/sources.toml");
const SEED_THREATS: &str = include_str!("../seeds/threats.toml");

/// Name of the inactive source that holds manually entered documents.
pub const MANUAL_SOURCE_NAME: &str = "Manual Entry";

#[derive(Debug, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    sources: Vec<SourceEntry>,
}

#[derive(Debug, Deserialize)]
struct SourceEntry {
    name: String,
    kind: SourceKind,
    endpoint: String,
    #[serde(default = "default_category")]
    category: String,
}

fn default_category() -> String {
    "uncategorized".into()
}

#[derive(Debug, Deserialize)]
struct ThreatsFile {
    #[serde(default)]
    threats: Vec<ThreatEntry>,
}

#[derive(Debug, Deserialize)]
struct ThreatEntry {
    name: String,
    group: String,
    description: String,
    #[serde(default)]
    criteria: Vec<String>,
    #[serde(default)]
    timeline_estimate: Option<String>,
}

/// Counts from a skip-if-exists seed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub added: usize,
    pub skipped: usize,
}

/// Counts from a catalog import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// A document typed in by an operator.
#[derive(Debug, Clone)]
pub struct ManualEntry {
    pub title: String,
    pub text: String,
    pub url: Option<String>,
    pub authors: Option<String>,
}

/// Parse a `[[sources]]` TOML document.
pub fn parse_sources(toml_str: &str) -> Result<Vec<Source>> {
    let file: SourcesFile = toml::from_str(toml_str)
        .map_err(|e| ForecastError::parse(format!("invalid sources file: {e}")))?;
    file.sources
        .into_iter()
        .map(|e| {
            validate_endpoint(e.kind, &e.endpoint)?;
            Ok(Source::new(e.name, e.kind, e.endpoint, e.category))
        })
        .collect()
}

/// Parse a `[[threats]]` TOML document.
pub fn parse_threats(toml_str: &str) -> Result<Vec<ThreatCategory>> {
    let file: ThreatsFile = toml::from_str(toml_str)
        .map_err(|e| ForecastError::parse(format!("invalid threats file: {e}")))?;
    file.threats
        .into_iter()
        .map(|e| {
            if e.name.trim().is_empty() {
                return Err(ForecastError::validation("threat category with empty name"));
            }
            Ok(ThreatCategory::new(
                e.name.trim(),
                e.group,
                e.description,
                e.criteria,
                e.timeline_estimate,
            ))
        })
        .collect()
}

/// Insert the default sources whose names are not yet registered.
pub async fn seed_sources(storage: &Storage) -> Result<SeedReport> {
    let mut report = SeedReport::default();
    for source in parse_sources(SEED_SOURCES)? {
        if storage.insert_source(&source).await? {
            info!(source = %source.name, "source added");
            report.added += 1;
        } else {
            debug!(source = %source.name, "source exists, skipping");
            report.skipped += 1;
        }
    }
    Ok(report)
}

/// Insert the default threat categories whose names are not yet present.
pub async fn seed_threats(storage: &Storage) -> Result<SeedReport> {
    let mut report = SeedReport::default();
    for category in parse_threats(SEED_THREATS)? {
        if storage.insert_threat_category_if_absent(&category).await? {
            info!(category = %category.name, "threat category added");
            report.added += 1;
        } else {
            debug!(category = %category.name, "threat category exists, skipping");
            report.skipped += 1;
        }
    }
    Ok(report)
}

/// Load a curated catalog file. Existing names are updated in place.
pub async fn import_threats(storage: &Storage, path: &Path) -> Result<ImportReport> {
    let content = std::fs::read_to_string(path).map_err(|e| ForecastError::io(path, e))?;
    let categories = parse_threats(&content)?;
    if categories.is_empty() {
        return Err(ForecastError::validation(format!(
            "{} contains no [[threats]] entries",
            path.display()
        )));
    }

    let mut report = ImportReport::default();
    for category in &categories {
        match storage.upsert_threat_category(category).await? {
            CategoryUpsert::Inserted => report.inserted += 1,
            CategoryUpsert::Updated => report.updated += 1,
            CategoryUpsert::Unchanged => report.unchanged += 1,
        }
    }
    info!(
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        "threat catalog imported"
    );
    Ok(report)
}

/// Register a new active source. Names must be unique.
pub async fn register_source(
    storage: &Storage,
    name: &str,
    kind: SourceKind,
    endpoint: &str,
    category: &str,
) -> Result<Source> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ForecastError::validation("source name must not be empty"));
    }
    validate_endpoint(kind, endpoint)?;

    let source = Source::new(name, kind, endpoint.trim(), category);
    if !storage.insert_source(&source).await? {
        return Err(ForecastError::validation(format!(
            "a source named '{name}' already exists"
        )));
    }
    info!(source = %source.name, kind = %source.kind, "source registered");
    Ok(source)
}

/// Store an operator-supplied document for the next cycle's extraction backlog.
///
/// Returns the stored document and whether it was new.
pub async fn ingest_manual(storage: &Storage, entry: ManualEntry) -> Result<(Document, bool)> {
    let title = entry.title.trim().to_string();
    let text = entry.text.trim().to_string();
    if title.is_empty() || text.is_empty() {
        return Err(ForecastError::validation(
            "manual entries need a title and text",
        ));
    }

    let source = manual_source(storage).await?;
    let candidate = DocumentCandidate {
        external_id: content_hash(&format!("{title}\n{text}")),
        title,
        url: entry.url.filter(|u| !u.trim().is_empty()),
        authors: entry.authors.filter(|a| !a.trim().is_empty()),
        body: text,
        published_at: None,
    };
    let (doc, inserted) = storage.upsert_document(&source.id, candidate).await?;
    info!(document = %doc.id, inserted, "manual entry stored");
    Ok((doc, inserted))
}

async fn manual_source(storage: &Storage) -> Result<Source> {
    if let Some(source) = storage.get_source_by_name(MANUAL_SOURCE_NAME).await? {
        return Ok(source);
    }
    let mut source = Source::new(MANUAL_SOURCE_NAME, SourceKind::Static, "manual:", "manual");
    source.active = false;
    storage.insert_source(&source).await?;
    storage
        .get_source_by_name(MANUAL_SOURCE_NAME)
        .await?
        .ok_or_else(|| ForecastError::Storage("manual source missing after insert".into()))
}

/// Search sources may carry a bare query; every other kind needs an http(s) URL.
fn validate_endpoint(kind: SourceKind, endpoint: &str) -> Result<()> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(ForecastError::validation("source endpoint must not be empty"));
    }
    if kind == SourceKind::Search && !endpoint.contains("://") {
        return Ok(());
    }
    let url = Url::parse(endpoint)
        .map_err(|e| ForecastError::validation(format!("invalid endpoint '{endpoint}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ForecastError::validation(format!(
            "unsupported endpoint scheme '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_storage;

    #[test]
    fn embedded_seeds_parse() {
        let sources = parse_sources(SEED_SOURCES).unwrap();
        assert!(sources.len() >= 5);
        assert!(sources.iter().any(|s| s.kind == SourceKind::Search));

        let threats = parse_threats(SEED_THREATS).unwrap();
        assert_eq!(threats.len(), 10);
        assert!(threats.iter().all(|t| !t.criteria.is_empty()));
        assert!(threats.iter().all(|t| t.timeline_estimate.is_some()));
    }

    #[tokio::test]
    async fn seeding_skips_existing() {
        let storage = test_storage().await;
        let first = seed_threats(&storage).await.unwrap();
        assert_eq!(first, SeedReport { added: 10, skipped: 0 });
        let second = seed_threats(&storage).await.unwrap();
        assert_eq!(second, SeedReport { added: 0, skipped: 10 });

        let sources = seed_sources(&storage).await.unwrap();
        assert_eq!(sources.skipped, 0);
        assert_eq!(seed_sources(&storage).await.unwrap().added, 0);
    }

    #[tokio::test]
    async fn import_updates_by_name() {
        let storage = test_storage().await;
        seed_threats(&storage).await.unwrap();
        let before = storage
            .get_threat_category_by_name("Ecological Release")
            .await
            .unwrap();
        assert!(before.is_none());

        let path = std::env::temp_dir().join(format!("threats_{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(
            &path,
            r#"
[[threats]]
name = "Automated Laboratory Malware Risks"
group = "Cyber-Physical Security"
description = "Revised description."
criteria = ["Robotic workflow compromise"]

[[threats]]
name = "Ecological Release"
group = "Ecological Risk"
description = "New entry."
"#,
        )
        .unwrap();

        let report = import_threats(&storage, &path).await.unwrap();
        assert_eq!(report, ImportReport { inserted: 1, updated: 1, unchanged: 0 });
        let revised = storage
            .get_threat_category_by_name("Automated Laboratory Malware Risks")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(revised.description, "Revised description.");

        let again = import_threats(&storage, &path).await.unwrap();
        assert_eq!(again.unchanged, 2);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn register_validates() {
        let storage = test_storage().await;
        register_source(&storage, "Feed", SourceKind::Feed, "https://example.com/rss", "news")
            .await
            .unwrap();
        assert!(
            register_source(&storage, "Feed", SourceKind::Feed, "https://example.com/2", "news")
                .await
                .is_err()
        );
        assert!(
            register_source(&storage, "Bad", SourceKind::Feed, "not a url", "news")
                .await
                .is_err()
        );
        register_source(&storage, "Query", SourceKind::Search, "protein design", "preprints")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn manual_entries_dedupe_and_stay_out_of_fetching() {
        let storage = test_storage().await;
        let entry = ManualEntry {
            title: "Lab notes".into(),
            text: "An agent planned a cloning protocol.".into(),
            url: None,
            authors: Some(" ".into()),
        };
        let (doc, inserted) = ingest_manual(&storage, entry.clone()).await.unwrap();
        assert!(inserted);
        assert!(doc.authors.is_none());
        let (_, again) = ingest_manual(&storage, entry).await.unwrap();
        assert!(!again);

        assert!(storage.list_active_sources().await.unwrap().is_empty());
        let pending = storage.documents_pending_extraction(3).await.unwrap();
        assert_eq!(pending.len(), 1);
    }
}
