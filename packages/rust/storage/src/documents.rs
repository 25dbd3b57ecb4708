//! Document persistence and full-text search.

use biothreat_shared::{Document, DocumentCandidate, ForecastError, Result};
use libsql::params;

use crate::{Storage, col_opt_str, col_opt_ts, col_str, col_ts, storage_err, ts};

const DOCUMENT_COLUMNS: &str = "d.id, d.source_id, d.external_id, d.title, d.url, d.authors, d.body, \
     d.content_hash, d.published_at, d.retrieved_at";

/// A full-text search hit.
#[derive(Debug, Clone)]
pub struct DocumentHit {
    pub document_id: String,
    pub title: String,
    pub url: Option<String>,
    pub source_name: String,
    /// FTS5 rank score (lower is better).
    pub score: f64,
}

impl Storage {
    /// Store a fetched candidate unless `(source_id, external_id)` already exists.
    ///
    /// Returns the stored document and whether this call inserted it. Existing
    /// documents are left untouched.
    pub async fn upsert_document(
        &self,
        source_id: &str,
        candidate: DocumentCandidate,
    ) -> Result<(Document, bool)> {
        self.check_writable()?;
        let external_id = candidate.external_id.clone();
        let doc = Document::from_candidate(source_id, candidate);

        let affected = self
            .conn
            .execute(
                "INSERT INTO documents (id, source_id, external_id, title, url, authors, body, content_hash, published_at, retrieved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(source_id, external_id) DO NOTHING",
                params![
                    doc.id.as_str(),
                    doc.source_id.as_str(),
                    doc.external_id.as_str(),
                    doc.title.as_str(),
                    doc.url.as_deref(),
                    doc.authors.as_deref(),
                    doc.body.as_str(),
                    doc.content_hash.as_str(),
                    doc.published_at.as_ref().map(ts),
                    ts(&doc.retrieved_at),
                ],
            )
            .await
            .map_err(storage_err)?;

        if affected > 0 {
            return Ok((doc, true));
        }

        let existing = self
            .get_document_by_external_id(source_id, &external_id)
            .await?
            .ok_or_else(|| {
                ForecastError::Storage(format!(
                    "document {source_id}/{external_id} vanished after conflict"
                ))
            })?;
        Ok((existing, false))
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents d WHERE d.id = ?1"),
                params![id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_document(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_document_by_external_id(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<Document>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM documents d
                     WHERE d.source_id = ?1 AND d.external_id = ?2"
                ),
                params![source_id, external_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_document(&row)?)),
            None => Ok(None),
        }
    }

    /// Documents with no successful extraction and fewer than `max_attempts` failures.
    pub async fn documents_pending_extraction(&self, max_attempts: u32) -> Result<Vec<Document>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM documents d
                     LEFT JOIN extractions e ON e.document_id = d.id
                     WHERE e.document_id IS NULL
                        OR (e.status = 'failed' AND e.attempts < ?1)
                     ORDER BY d.retrieved_at, d.id"
                ),
                params![max_attempts],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_document(&row)?);
        }
        Ok(results)
    }

    pub async fn count_documents(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM documents").await
    }

    /// Full-text search over document titles and bodies.
    pub async fn search_documents(&self, query: &str, limit: u32) -> Result<Vec<DocumentHit>> {
        let mut rows = self
            .conn
            .query(
                "SELECT d.id, d.title, d.url, s.name, rank
                 FROM documents_fts fts
                 JOIN documents d ON d.rowid = fts.rowid
                 JOIN sources s ON s.id = d.source_id
                 WHERE documents_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
                params![query, limit],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(DocumentHit {
                document_id: col_str(&row, 0)?,
                title: col_str(&row, 1)?,
                url: col_opt_str(&row, 2),
                source_name: col_str(&row, 3)?,
                score: row.get::<f64>(4).unwrap_or(0.0),
            });
        }
        Ok(results)
    }
}

fn row_to_document(row: &libsql::Row) -> Result<Document> {
    Ok(Document {
        id: col_str(row, 0)?,
        source_id: col_str(row, 1)?,
        external_id: col_str(row, 2)?,
        title: col_str(row, 3)?,
        url: col_opt_str(row, 4),
        authors: col_opt_str(row, 5),
        body: col_str(row, 6)?,
        content_hash: col_str(row, 7)?,
        published_at: col_opt_ts(row, 8)?,
        retrieved_at: col_ts(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::test_support::test_storage;
    use biothreat_shared::{DocumentCandidate, Source, SourceKind};

    fn candidate(external_id: &str, title: &str, body: &str) -> DocumentCandidate {
        DocumentCandidate {
            external_id: external_id.into(),
            title: title.into(),
            url: Some(format!("https://example.com/{external_id}")),
            authors: None,
            body: body.into(),
            published_at: None,
        }
    }

    #[tokio::test]
    async fn reingesting_same_item_stores_one_document() {
        let storage = test_storage().await;
        let src = Source::new("feed", SourceKind::Feed, "https://example.com/rss", "news");
        storage.insert_source(&src).await.unwrap();

        let (first, inserted) = storage
            .upsert_document(&src.id, candidate("item-1", "Protein design", "text"))
            .await
            .unwrap();
        assert!(inserted);

        let (second, inserted) = storage
            .upsert_document(&src.id, candidate("item-1", "Protein design (v2)", "changed"))
            .await
            .unwrap();
        assert!(!inserted);
        assert_eq!(second.id, first.id);
        assert_eq!(second.title, "Protein design");
        assert_eq!(storage.count_documents().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_external_id_in_different_sources_is_distinct() {
        let storage = test_storage().await;
        let a = Source::new("a", SourceKind::Feed, "https://a.example/rss", "news");
        let b = Source::new("b", SourceKind::Feed, "https://b.example/rss", "news");
        storage.insert_source(&a).await.unwrap();
        storage.insert_source(&b).await.unwrap();

        storage.upsert_document(&a.id, candidate("x", "A", "a")).await.unwrap();
        storage.upsert_document(&b.id, candidate("x", "B", "b")).await.unwrap();
        assert_eq!(storage.count_documents().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn pending_extraction_respects_attempts() {
        let storage = test_storage().await;
        let src = Source::new("feed", SourceKind::Feed, "https://example.com/rss", "news");
        storage.insert_source(&src).await.unwrap();
        let (done, _) = storage.upsert_document(&src.id, candidate("1", "one", "b")).await.unwrap();
        let (failing, _) = storage.upsert_document(&src.id, candidate("2", "two", "b")).await.unwrap();
        storage.upsert_document(&src.id, candidate("3", "three", "b")).await.unwrap();

        storage.store_extraction(&done.id, "run", &[]).await.unwrap();
        storage.record_extraction_failure(&failing.id, "run", "timeout").await.unwrap();

        let pending = storage.documents_pending_extraction(2).await.unwrap();
        assert_eq!(pending.len(), 2);

        storage.record_extraction_failure(&failing.id, "run", "timeout").await.unwrap();
        let pending = storage.documents_pending_extraction(2).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].external_id, "3");
    }

    #[tokio::test]
    async fn fts_search() {
        let storage = test_storage().await;
        let src = Source::new("feed", SourceKind::Feed, "https://example.com/rss", "news");
        storage.insert_source(&src).await.unwrap();

        for (id, title) in [
            ("1", "Generative protein design at scale"),
            ("2", "Autonomous laboratory robotics"),
            ("3", "Language models for genomics"),
        ] {
            storage
                .upsert_document(&src.id, candidate(id, title, "abstract text"))
                .await
                .unwrap();
        }

        let results = storage.search_documents("robotics", 10).await.expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Autonomous laboratory robotics");
        assert_eq!(results[0].source_name, "feed");
    }
}
