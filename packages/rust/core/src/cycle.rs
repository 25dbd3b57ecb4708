//! The cycle coordinator: fetch, extract, map and persist for one run.
//!
//! A run walks `Idle -> Fetching -> Extracting -> Mapping -> Finalizing` and
//! ends `Completed`, `FailedPartial` or `Failed`. Per-item failures are
//! recorded in the run outcome; only fatal errors end the run as `Failed`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use biothreat_fetcher::SourceFetcher;
use biothreat_shared::{
    Capability, CycleRun, CycleStage, CycleStatus, DocumentCandidate, ForecastError, Mapping,
    PipelinePolicy, Result, Source, SourceOutcome, new_id,
};
use biothreat_storage::{EvaluationOutcome, Storage};
use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::catalog::ThreatCatalog;
use crate::extractor::CapabilityExtractor;
use crate::llm::CompletionClient;
use crate::mapper::{CapabilityMapper, PairOutcome};

/// Cooperative cancellation shared between a trigger and a running cycle.
///
/// Checked between stages and before each item starts; in-flight work finishes.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress callback for reporting cycle status.
pub trait CycleProgress: Send + Sync {
    /// Called when the run enters a new stage.
    fn stage(&self, stage: CycleStage);
    /// Called as items within a stage finish.
    fn item_done(&self, stage: CycleStage, current: usize, total: usize);
    /// Called once the run is finalized.
    fn done(&self, run: &CycleRun);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl CycleProgress for SilentProgress {
    fn stage(&self, _stage: CycleStage) {}
    fn item_done(&self, _stage: CycleStage, _current: usize, _total: usize) {}
    fn done(&self, _run: &CycleRun) {}
}

/// Drives cycle runs against one store.
pub struct CycleCoordinator {
    storage: Arc<Storage>,
    fetcher: Arc<dyn SourceFetcher>,
    extractor: CapabilityExtractor,
    mapper: CapabilityMapper,
    policy: PipelinePolicy,
}

impl CycleCoordinator {
    pub fn new(
        storage: Arc<Storage>,
        fetcher: Arc<dyn SourceFetcher>,
        client: Arc<dyn CompletionClient>,
        policy: PipelinePolicy,
    ) -> Self {
        Self {
            storage,
            fetcher,
            extractor: CapabilityExtractor::new(client.clone(), &policy),
            mapper: CapabilityMapper::new(client, &policy),
            policy,
        }
    }

    /// Run one cycle.
    ///
    /// Returns `Err` only when the run could not be created (another run is
    /// active, or storage is unreachable). Everything after that is reported
    /// through the returned run's status.
    #[instrument(skip_all, fields(since = ?since))]
    pub async fn run_cycle(
        &self,
        since: Option<DateTime<Utc>>,
        cancel: &CancelFlag,
        progress: &dyn CycleProgress,
    ) -> Result<CycleRun> {
        let stale_after = TimeDelta::from_std(self.policy.stale_after)
            .unwrap_or_else(|_| TimeDelta::hours(2));
        let reaped = self.storage.fail_stale_runs(Utc::now() - stale_after).await?;
        if reaped > 0 {
            warn!(reaped, "marked stale running cycles as failed");
        }

        let mut run = CycleRun::new(since);
        self.storage.begin_cycle_run(&run).await?;
        info!(run = %run.id, "cycle started");

        match self.drive(&mut run, cancel, progress).await {
            Ok(()) => {
                info!(
                    run = %run.id,
                    status = %run.status,
                    documents_new = run.outcome.documents_new,
                    capabilities = run.outcome.capabilities_added,
                    mappings = run.outcome.mappings_added,
                    "cycle finished"
                );
            }
            Err(e) => {
                warn!(run = %run.id, error = %e, stage = %run.stage, "cycle failed");
                run.stage = CycleStage::Failed;
                run.status = CycleStatus::Failed;
                run.error = Some(e.to_string());
                run.completed_at = Some(Utc::now());
                // A reaped run's row already records the failure.
                if !matches!(e, ForecastError::RunAbandoned { .. }) {
                    self.storage.update_cycle_run(&run).await?;
                }
            }
        }

        progress.done(&run);
        Ok(run)
    }

    async fn drive(
        &self,
        run: &mut CycleRun,
        cancel: &CancelFlag,
        progress: &dyn CycleProgress,
    ) -> Result<()> {
        self.advance(run, CycleStage::Fetching, progress).await?;

        let catalog = tokio::time::timeout(
            self.policy.catalog_timeout,
            ThreatCatalog::load(&self.storage),
        )
        .await
        .map_err(|_| {
            ForecastError::config(format!(
                "threat catalog load timed out after {:?}",
                self.policy.catalog_timeout
            ))
        })??;

        let sources = self.storage.list_active_sources().await?;
        if sources.is_empty() {
            return Err(ForecastError::config(
                "no active sources; run `biothreat seed sources` or `biothreat sources add`",
            ));
        }

        let fetched = self.fetch_all(run, sources, cancel, progress).await?;
        self.store_documents(run, &fetched).await?;

        self.advance(run, CycleStage::Extracting, progress).await?;
        if !cancel.is_cancelled() {
            self.extract_pending(run, cancel, progress).await?;
        }

        self.advance(run, CycleStage::Mapping, progress).await?;
        if !cancel.is_cancelled() {
            self.map_pending(run, &catalog, cancel, progress).await?;
        }

        self.advance(run, CycleStage::Finalizing, progress).await?;
        run.outcome.cancelled = cancel.is_cancelled();

        let watermarks: Vec<String> = if run.outcome.cancelled {
            Vec::new()
        } else {
            run.outcome
                .sources
                .iter()
                .filter(|s| s.ok)
                .map(|s| s.source_id.clone())
                .collect()
        };

        let (stage, status) = if run.outcome.has_failures() {
            (CycleStage::FailedPartial, CycleStatus::FailedPartial)
        } else {
            (CycleStage::Completed, CycleStatus::Completed)
        };
        debug_assert!(run.stage.can_transition_to(stage));
        run.stage = stage;
        run.status = status;
        run.completed_at = Some(Utc::now());
        self.storage.finish_cycle_run(run, &watermarks).await?;
        progress.stage(stage);
        Ok(())
    }

    async fn advance(
        &self,
        run: &mut CycleRun,
        next: CycleStage,
        progress: &dyn CycleProgress,
    ) -> Result<()> {
        debug_assert!(
            run.stage.can_transition_to(next),
            "illegal cycle transition {} -> {}",
            run.stage,
            next
        );
        debug!(run = %run.id, from = %run.stage, to = %next, "cycle stage");
        run.stage = next;
        self.storage.update_cycle_run(run).await?;
        progress.stage(next);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Fetching
    // -----------------------------------------------------------------------

    /// Fetch every source in isolation. Fails the run only when every
    /// attempted source failed.
    async fn fetch_all(
        &self,
        run: &mut CycleRun,
        sources: Vec<Source>,
        cancel: &CancelFlag,
        progress: &dyn CycleProgress,
    ) -> Result<Vec<(Source, Vec<DocumentCandidate>)>> {
        let total = sources.len();
        let fetcher = &self.fetcher;
        let run_since = run.since;

        let mut results = stream::iter(sources)
            .map(|source| async move {
                if cancel.is_cancelled() {
                    return (source, None);
                }
                let since = run_since.or(source.last_fetched_at);
                let result = fetcher.fetch(&source, since).await;
                (source, Some(result))
            })
            .buffer_unordered(self.policy.concurrency);

        let mut fetched = Vec::new();
        let mut done = 0;
        while let Some((source, result)) = results.next().await {
            done += 1;
            progress.item_done(CycleStage::Fetching, done, total);
            let Some(result) = result else {
                debug!(source = %source.name, "fetch skipped, cycle cancelled");
                continue;
            };
            match result {
                Ok(candidates) => {
                    run.outcome.sources.push(SourceOutcome {
                        source_id: source.id.clone(),
                        source_name: source.name.clone(),
                        ok: true,
                        fetched: candidates.len(),
                        new_documents: 0,
                        error: None,
                    });
                    fetched.push((source, candidates));
                }
                Err(e) => {
                    warn!(source = %source.name, error = %e, "source skipped this cycle");
                    run.outcome.sources.push(SourceOutcome {
                        source_id: source.id.clone(),
                        source_name: source.name.clone(),
                        ok: false,
                        fetched: 0,
                        new_documents: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        run.outcome
            .sources
            .sort_by(|a, b| a.source_name.cmp(&b.source_name));

        let attempted = run.outcome.sources.len();
        if attempted > 0 && fetched.is_empty() {
            return Err(ForecastError::source_unavailable(
                "all sources",
                format!("{attempted} of {attempted} sources failed"),
            ));
        }
        Ok(fetched)
    }

    async fn store_documents(
        &self,
        run: &mut CycleRun,
        fetched: &[(Source, Vec<DocumentCandidate>)],
    ) -> Result<()> {
        for (source, candidates) in fetched {
            let mut new_documents = 0;
            for candidate in candidates {
                let (_, inserted) = self
                    .storage
                    .upsert_document(&source.id, candidate.clone())
                    .await?;
                if inserted {
                    new_documents += 1;
                }
            }
            run.outcome.documents_fetched += candidates.len();
            run.outcome.documents_new += new_documents;
            if let Some(outcome) = run
                .outcome
                .sources
                .iter_mut()
                .find(|o| o.source_id == source.id)
            {
                outcome.new_documents = new_documents;
            }
            debug!(source = %source.name, fetched = candidates.len(), new_documents, "documents stored");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Extracting
    // -----------------------------------------------------------------------

    async fn extract_pending(
        &self,
        run: &mut CycleRun,
        cancel: &CancelFlag,
        progress: &dyn CycleProgress,
    ) -> Result<()> {
        let pending = self
            .storage
            .documents_pending_extraction(self.policy.max_attempts)
            .await?;
        let total = pending.len();
        info!(documents = total, "extracting capabilities");

        let extractor = &self.extractor;
        let mut results = stream::iter(pending)
            .map(|doc| async move {
                if cancel.is_cancelled() {
                    return (doc, None);
                }
                let result = extractor.extract(&doc).await;
                (doc, Some(result))
            })
            .buffer_unordered(self.policy.concurrency);

        let mut done = 0;
        while let Some((doc, result)) = results.next().await {
            done += 1;
            progress.item_done(CycleStage::Extracting, done, total);
            match result {
                None => continue,
                Some(Ok(candidates)) => {
                    let extracted_at = Utc::now();
                    let capabilities: Vec<Capability> = candidates
                        .into_iter()
                        .map(|c| Capability {
                            id: new_id(),
                            document_id: doc.id.clone(),
                            statement: c.statement,
                            normalized_statement: c.normalized,
                            confidence: c.confidence,
                            model_id: extractor.model_id().to_string(),
                            extracted_at,
                        })
                        .collect();
                    let added = self
                        .storage
                        .store_extraction(&doc.id, &run.id, &capabilities)
                        .await?;
                    run.outcome.documents_extracted += 1;
                    run.outcome.capabilities_added += added;
                }
                Some(Err(e)) => {
                    let attempts = self
                        .storage
                        .record_extraction_failure(&doc.id, &run.id, &e.to_string())
                        .await?;
                    warn!(document = %doc.id, attempts, error = %e, "extraction failed");
                    run.outcome.extraction_failures += 1;
                }
            }
            self.storage.update_cycle_run(run).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Mapping
    // -----------------------------------------------------------------------

    async fn map_pending(
        &self,
        run: &mut CycleRun,
        catalog: &ThreatCatalog,
        cancel: &CancelFlag,
        progress: &dyn CycleProgress,
    ) -> Result<()> {
        let pending: Vec<_> = self
            .storage
            .pending_pairs(self.policy.max_attempts)
            .await?
            .into_iter()
            .filter_map(|pair| {
                catalog
                    .get(&pair.threat_category_id)
                    .map(|category| (pair.capability, category))
            })
            .collect();
        let total = pending.len();
        info!(pairs = total, "scoring capability/threat pairs");

        let mapper = &self.mapper;
        let mut results = stream::iter(pending)
            .map(|(capability, category)| async move {
                if cancel.is_cancelled() {
                    return (capability, category, None);
                }
                let result = mapper.score_pair(&capability, category).await;
                (capability, category, Some(result))
            })
            .buffer_unordered(self.policy.concurrency);

        let mut done = 0;
        while let Some((capability, category, result)) = results.next().await {
            done += 1;
            progress.item_done(CycleStage::Mapping, done, total);
            let Some(result) = result else { continue };
            run.outcome.pairs_evaluated += 1;
            match result {
                Ok(PairOutcome::Mapped { score, rationale }) => {
                    let mapping = Mapping {
                        id: new_id(),
                        capability_id: capability.id.clone(),
                        threat_category_id: category.id.clone(),
                        feasibility_score: score,
                        rationale,
                        category_hash: category.content_hash.clone(),
                        model_id: mapper.model_id().to_string(),
                        scored_at: Utc::now(),
                        active: true,
                    };
                    self.storage.insert_mapping(&mapping).await?;
                    run.outcome.mappings_added += 1;
                }
                Ok(PairOutcome::BelowFloor { score }) => {
                    self.storage
                        .record_evaluation(
                            &capability.id,
                            &category.id,
                            &category.content_hash,
                            EvaluationOutcome::BelowFloor,
                            Some(score),
                            None,
                        )
                        .await?;
                    run.outcome.pairs_below_floor += 1;
                }
                Err(e) => {
                    warn!(capability = %capability.id, category = %category.name, error = %e, "mapping failed");
                    self.storage
                        .record_evaluation(
                            &capability.id,
                            &category.id,
                            &category.content_hash,
                            EvaluationOutcome::Failed,
                            None,
                            Some(&e.to_string()),
                        )
                        .await?;
                    run.outcome.mapping_failures += 1;
                }
            }
            self.storage.update_cycle_run(run).await?;
        }
        Ok(())
    }
}
