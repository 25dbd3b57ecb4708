//! Capabilities, mappings and the per-item bookkeeping that keeps cycles idempotent.

use biothreat_shared::{Capability, ForecastError, Mapping, Result};
use chrono::{DateTime, Utc};
use libsql::params;

use crate::{
    Storage, col_f64, col_i64, col_opt_str, col_str, col_ts, storage_err, ts,
};

// ---------------------------------------------------------------------------
// Bookkeeping types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStatus {
    Extracted,
    Failed,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extracted => "extracted",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "extracted" => Ok(Self::Extracted),
            "failed" => Ok(Self::Failed),
            other => Err(ForecastError::parse(format!("unknown extraction status '{other}'"))),
        }
    }
}

/// Latest extraction attempt for a document.
#[derive(Debug, Clone)]
pub struct ExtractionRecord {
    pub document_id: String,
    pub cycle_run_id: String,
    pub status: ExtractionStatus,
    pub attempts: u32,
    pub capability_count: u32,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationOutcome {
    Mapped,
    BelowFloor,
    Failed,
}

impl EvaluationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mapped => "mapped",
            Self::BelowFloor => "below_floor",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "mapped" => Ok(Self::Mapped),
            "below_floor" => Ok(Self::BelowFloor),
            "failed" => Ok(Self::Failed),
            other => Err(ForecastError::parse(format!("unknown evaluation outcome '{other}'"))),
        }
    }
}

/// Latest scoring attempt for a capability/category pair.
#[derive(Debug, Clone)]
pub struct PairEvaluation {
    pub capability_id: String,
    pub threat_category_id: String,
    pub category_hash: String,
    pub outcome: EvaluationOutcome,
    pub score: Option<f64>,
    /// Attempts made against `category_hash`.
    pub attempts: u32,
    pub error: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

/// A capability/category pair that still needs scoring.
#[derive(Debug, Clone)]
pub struct PendingPair {
    pub capability: Capability,
    pub threat_category_id: String,
}

const CAPABILITY_COLUMNS: &str = "c.id, c.document_id, c.statement, c.normalized_statement, \
     c.confidence, c.model_id, c.extracted_at";

// Attempts reset whenever the category content changes.
const UPSERT_EVALUATION: &str = "INSERT INTO evaluations (capability_id, threat_category_id, category_hash, outcome, score, attempts, error, evaluated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)
     ON CONFLICT(capability_id, threat_category_id) DO UPDATE SET
       attempts = CASE WHEN evaluations.category_hash = excluded.category_hash
                       THEN evaluations.attempts + 1 ELSE 1 END,
       category_hash = excluded.category_hash,
       outcome = excluded.outcome,
       score = excluded.score,
       error = excluded.error,
       evaluated_at = excluded.evaluated_at";

impl Storage {
    // -----------------------------------------------------------------------
    // Extraction
    // -----------------------------------------------------------------------

    /// Persist a document's capabilities and mark it extracted, in one transaction.
    ///
    /// Returns how many capabilities were newly stored.
    pub async fn store_extraction(
        &self,
        document_id: &str,
        cycle_run_id: &str,
        capabilities: &[Capability],
    ) -> Result<usize> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        let mut inserted = 0;
        for cap in capabilities {
            inserted += tx
                .execute(
                    "INSERT INTO capabilities (id, document_id, statement, normalized_statement, confidence, model_id, extracted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(document_id, normalized_statement) DO NOTHING",
                    params![
                        cap.id.as_str(),
                        cap.document_id.as_str(),
                        cap.statement.as_str(),
                        cap.normalized_statement.as_str(),
                        cap.confidence,
                        cap.model_id.as_str(),
                        ts(&cap.extracted_at),
                    ],
                )
                .await
                .map_err(storage_err)? as usize;
        }

        tx.execute(
            "INSERT INTO extractions (document_id, cycle_run_id, status, attempts, capability_count, error, attempted_at)
             VALUES (?1, ?2, 'extracted', 1, ?3, NULL, ?4)
             ON CONFLICT(document_id) DO UPDATE SET
               cycle_run_id = excluded.cycle_run_id,
               status = 'extracted',
               attempts = extractions.attempts + 1,
               capability_count = excluded.capability_count,
               error = NULL,
               attempted_at = excluded.attempted_at",
            params![document_id, cycle_run_id, inserted as i64, ts(&Utc::now())],
        )
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(inserted)
    }

    /// Record a failed extraction attempt. Returns the attempt count so far.
    pub async fn record_extraction_failure(
        &self,
        document_id: &str,
        cycle_run_id: &str,
        error: &str,
    ) -> Result<u32> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO extractions (document_id, cycle_run_id, status, attempts, capability_count, error, attempted_at)
                 VALUES (?1, ?2, 'failed', 1, 0, ?3, ?4)
                 ON CONFLICT(document_id) DO UPDATE SET
                   cycle_run_id = excluded.cycle_run_id,
                   status = 'failed',
                   attempts = extractions.attempts + 1,
                   error = excluded.error,
                   attempted_at = excluded.attempted_at",
                params![document_id, cycle_run_id, error, ts(&Utc::now())],
            )
            .await
            .map_err(storage_err)?;

        Ok(self
            .get_extraction(document_id)
            .await?
            .map(|r| r.attempts)
            .unwrap_or(1))
    }

    pub async fn get_extraction(&self, document_id: &str) -> Result<Option<ExtractionRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT document_id, cycle_run_id, status, attempts, capability_count, error, attempted_at
                 FROM extractions WHERE document_id = ?1",
                params![document_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(ExtractionRecord {
                document_id: col_str(&row, 0)?,
                cycle_run_id: col_str(&row, 1)?,
                status: ExtractionStatus::parse(&col_str(&row, 2)?)?,
                attempts: col_i64(&row, 3)?.max(0) as u32,
                capability_count: col_i64(&row, 4)?.max(0) as u32,
                error: col_opt_str(&row, 5),
                attempted_at: col_ts(&row, 6)?,
            })),
            None => Ok(None),
        }
    }

    pub async fn capabilities_for_document(&self, document_id: &str) -> Result<Vec<Capability>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CAPABILITY_COLUMNS} FROM capabilities c
                     WHERE c.document_id = ?1 ORDER BY c.extracted_at, c.id"
                ),
                params![document_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_capability(&row)?);
        }
        Ok(results)
    }

    pub async fn count_capabilities(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM capabilities").await
    }

    // -----------------------------------------------------------------------
    // Mapping
    // -----------------------------------------------------------------------

    /// Pairs without a successful evaluation against the category's current
    /// content hash, excluding pairs that already failed `max_attempts` times.
    pub async fn pending_pairs(&self, max_attempts: u32) -> Result<Vec<PendingPair>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CAPABILITY_COLUMNS}, t.id
                     FROM capabilities c
                     CROSS JOIN threat_categories t
                     LEFT JOIN evaluations ev
                       ON ev.capability_id = c.id AND ev.threat_category_id = t.id
                     WHERE ev.capability_id IS NULL
                        OR ev.category_hash <> t.content_hash
                        OR (ev.outcome = 'failed' AND ev.attempts < ?1)
                     ORDER BY c.extracted_at, c.id, t.name"
                ),
                params![max_attempts],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(PendingPair {
                capability: row_to_capability(&row)?,
                threat_category_id: col_str(&row, 7)?,
            });
        }
        Ok(results)
    }

    /// Insert a mapping as the active one for its pair, deactivating any
    /// previous mapping and recording the evaluation, in one transaction.
    pub async fn insert_mapping(&self, mapping: &Mapping) -> Result<()> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        tx.execute(
            "UPDATE mappings SET active = 0
             WHERE capability_id = ?1 AND threat_category_id = ?2 AND active = 1",
            params![mapping.capability_id.as_str(), mapping.threat_category_id.as_str()],
        )
        .await
        .map_err(storage_err)?;

        tx.execute(
            "INSERT INTO mappings (id, capability_id, threat_category_id, feasibility_score, rationale, category_hash, model_id, scored_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)",
            params![
                mapping.id.as_str(),
                mapping.capability_id.as_str(),
                mapping.threat_category_id.as_str(),
                mapping.feasibility_score,
                mapping.rationale.as_str(),
                mapping.category_hash.as_str(),
                mapping.model_id.as_str(),
                ts(&mapping.scored_at),
            ],
        )
        .await
        .map_err(storage_err)?;

        tx.execute(
            UPSERT_EVALUATION,
            params![
                mapping.capability_id.as_str(),
                mapping.threat_category_id.as_str(),
                mapping.category_hash.as_str(),
                EvaluationOutcome::Mapped.as_str(),
                Some(mapping.feasibility_score),
                None::<String>,
                ts(&mapping.scored_at),
            ],
        )
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    /// Record a pair that produced no mapping.
    ///
    /// A below-floor score supersedes any earlier active mapping for the pair;
    /// a failed attempt leaves it in place.
    pub async fn record_evaluation(
        &self,
        capability_id: &str,
        threat_category_id: &str,
        category_hash: &str,
        outcome: EvaluationOutcome,
        score: Option<f64>,
        error: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        if outcome == EvaluationOutcome::Mapped {
            return Err(ForecastError::validation(
                "mapped evaluations are recorded through insert_mapping",
            ));
        }

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        if outcome == EvaluationOutcome::BelowFloor {
            tx.execute(
                "UPDATE mappings SET active = 0
                 WHERE capability_id = ?1 AND threat_category_id = ?2 AND active = 1",
                params![capability_id, threat_category_id],
            )
            .await
            .map_err(storage_err)?;
        }

        tx.execute(
            UPSERT_EVALUATION,
            params![
                capability_id,
                threat_category_id,
                category_hash,
                outcome.as_str(),
                score,
                error,
                ts(&Utc::now()),
            ],
        )
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    pub async fn get_evaluation(
        &self,
        capability_id: &str,
        threat_category_id: &str,
    ) -> Result<Option<PairEvaluation>> {
        let mut rows = self
            .conn
            .query(
                "SELECT capability_id, threat_category_id, category_hash, outcome, score, attempts, error, evaluated_at
                 FROM evaluations WHERE capability_id = ?1 AND threat_category_id = ?2",
                params![capability_id, threat_category_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(PairEvaluation {
                capability_id: col_str(&row, 0)?,
                threat_category_id: col_str(&row, 1)?,
                category_hash: col_str(&row, 2)?,
                outcome: EvaluationOutcome::parse(&col_str(&row, 3)?)?,
                score: row.get::<f64>(4).ok(),
                attempts: col_i64(&row, 5)?.max(0) as u32,
                error: col_opt_str(&row, 6),
                evaluated_at: col_ts(&row, 7)?,
            })),
            None => Ok(None),
        }
    }

    /// All mappings for a pair, newest first, active or not.
    pub async fn mappings_for_pair(
        &self,
        capability_id: &str,
        threat_category_id: &str,
    ) -> Result<Vec<Mapping>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, capability_id, threat_category_id, feasibility_score, rationale, category_hash, model_id, scored_at, active
                 FROM mappings WHERE capability_id = ?1 AND threat_category_id = ?2
                 ORDER BY scored_at DESC",
                params![capability_id, threat_category_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(Mapping {
                id: col_str(&row, 0)?,
                capability_id: col_str(&row, 1)?,
                threat_category_id: col_str(&row, 2)?,
                feasibility_score: col_f64(&row, 3)?,
                rationale: col_str(&row, 4)?,
                category_hash: col_str(&row, 5)?,
                model_id: col_str(&row, 6)?,
                scored_at: col_ts(&row, 7)?,
                active: col_i64(&row, 8)? != 0,
            });
        }
        Ok(results)
    }

    pub async fn count_active_mappings(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM mappings WHERE active = 1").await
    }
}

fn row_to_capability(row: &libsql::Row) -> Result<Capability> {
    Ok(Capability {
        id: col_str(row, 0)?,
        document_id: col_str(row, 1)?,
        statement: col_str(row, 2)?,
        normalized_statement: col_str(row, 3)?,
        confidence: col_f64(row, 4)?,
        model_id: col_str(row, 5)?,
        extracted_at: col_ts(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use biothreat_shared::{DocumentCandidate, Source, SourceKind, ThreatCategory, new_id};

    async fn seeded() -> (Storage, Capability, ThreatCategory) {
        let storage = test_storage().await;
        let src = Source::new("feed", SourceKind::Feed, "https://example.com/rss", "news");
        storage.insert_source(&src).await.unwrap();
        let (doc, _) = storage
            .upsert_document(
                &src.id,
                DocumentCandidate {
                    external_id: "1".into(),
                    title: "Paper".into(),
                    url: None,
                    authors: None,
                    body: "text".into(),
                    published_at: None,
                },
            )
            .await
            .unwrap();

        let cap = capability(&doc.id, "Designs binders de novo");
        storage.store_extraction(&doc.id, "run-1", &[cap.clone()]).await.unwrap();

        let cat = ThreatCategory::new(
            "Pathogen Optimization",
            "Design",
            "desc",
            vec!["protein design".into()],
            None,
        );
        storage.upsert_threat_category(&cat).await.unwrap();
        (storage, cap, cat)
    }

    fn capability(document_id: &str, statement: &str) -> Capability {
        Capability {
            id: new_id(),
            document_id: document_id.into(),
            statement: statement.into(),
            normalized_statement: statement.to_lowercase(),
            confidence: 0.8,
            model_id: "test-model".into(),
            extracted_at: Utc::now(),
        }
    }

    fn mapping(cap: &Capability, cat: &ThreatCategory, score: f64) -> Mapping {
        Mapping {
            id: new_id(),
            capability_id: cap.id.clone(),
            threat_category_id: cat.id.clone(),
            feasibility_score: score,
            rationale: "because".into(),
            category_hash: cat.content_hash.clone(),
            model_id: "test-model".into(),
            scored_at: Utc::now(),
            active: true,
        }
    }

    #[tokio::test]
    async fn duplicate_capabilities_are_ignored() {
        let (storage, cap, _) = seeded().await;
        let dup = capability(&cap.document_id, "Designs binders de novo");
        let inserted = storage.store_extraction(&cap.document_id, "run-2", &[dup]).await.unwrap();
        assert_eq!(inserted, 0);
        assert_eq!(storage.count_capabilities().await.unwrap(), 1);

        let record = storage.get_extraction(&cap.document_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExtractionStatus::Extracted);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn at_most_one_active_mapping_per_pair() {
        let (storage, cap, cat) = seeded().await;
        for score in [0.6, 0.7, 0.9] {
            storage.insert_mapping(&mapping(&cap, &cat, score)).await.unwrap();
        }

        let all = storage.mappings_for_pair(&cap.id, &cat.id).await.unwrap();
        assert_eq!(all.len(), 3);
        let active: Vec<_> = all.iter().filter(|m| m.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].feasibility_score, 0.9);
        assert_eq!(storage.count_active_mappings().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pending_pairs_follow_evaluations() {
        let (storage, cap, cat) = seeded().await;
        assert_eq!(storage.pending_pairs(3).await.unwrap().len(), 1);

        storage.insert_mapping(&mapping(&cap, &cat, 0.8)).await.unwrap();
        assert!(storage.pending_pairs(3).await.unwrap().is_empty());

        // Changing the category content makes the pair pending again
        let mut edited = cat.clone();
        edited.description = "revised".into();
        edited.content_hash = edited.compute_hash();
        storage.upsert_threat_category(&edited).await.unwrap();
        let pending = storage.pending_pairs(3).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].threat_category_id, cat.id);
    }

    #[tokio::test]
    async fn failed_pairs_retry_until_max_attempts() {
        let (storage, cap, cat) = seeded().await;
        for _ in 0..2 {
            storage
                .record_evaluation(&cap.id, &cat.id, &cat.content_hash, EvaluationOutcome::Failed, None, Some("timeout"))
                .await
                .unwrap();
        }
        let eval = storage.get_evaluation(&cap.id, &cat.id).await.unwrap().unwrap();
        assert_eq!(eval.attempts, 2);
        assert_eq!(storage.pending_pairs(3).await.unwrap().len(), 1);
        assert!(storage.pending_pairs(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn below_floor_rescore_deactivates_previous() {
        let (storage, cap, cat) = seeded().await;
        storage.insert_mapping(&mapping(&cap, &cat, 0.8)).await.unwrap();
        storage
            .record_evaluation(&cap.id, &cat.id, &cat.content_hash, EvaluationOutcome::BelowFloor, Some(0.2), None)
            .await
            .unwrap();
        assert_eq!(storage.count_active_mappings().await.unwrap(), 0);
        let eval = storage.get_evaluation(&cap.id, &cat.id).await.unwrap().unwrap();
        assert_eq!(eval.outcome, EvaluationOutcome::BelowFloor);
        assert_eq!(eval.score, Some(0.2));
    }
}
