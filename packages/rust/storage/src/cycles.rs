//! Cycle run lifecycle persistence.

use biothreat_shared::{CycleOutcome, CycleRun, CycleStage, CycleStatus, ForecastError, Result};
use chrono::{DateTime, Utc};
use libsql::params;

use crate::{Storage, col_opt_str, col_opt_ts, col_str, col_ts, storage_err, ts};

const RUN_COLUMNS: &str = "id, started_at, completed_at, since, stage, status, outcome_json, error";

impl Storage {
    /// Record a new running cycle, refusing if another run is still `running`.
    ///
    /// The check and insert are one statement, so two concurrent triggers
    /// cannot both succeed.
    pub async fn begin_cycle_run(&self, run: &CycleRun) -> Result<()> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "INSERT INTO cycle_runs (id, started_at, completed_at, since, stage, status, outcome_json, error, updated_at)
                 SELECT ?1, ?2, NULL, ?3, ?4, 'running', ?5, NULL, ?2
                 WHERE NOT EXISTS (SELECT 1 FROM cycle_runs WHERE status = 'running')",
                params![
                    run.id.as_str(),
                    ts(&run.started_at),
                    run.since.as_ref().map(ts),
                    run.stage.as_str(),
                    outcome_json(&run.outcome)?,
                ],
            )
            .await
            .map_err(storage_err)?;

        if affected == 0 {
            let running = self
                .running_cycle_run()
                .await?
                .map(|r| r.id)
                .unwrap_or_else(|| "unknown".into());
            return Err(ForecastError::CycleInProgress { run_id: running });
        }
        Ok(())
    }

    /// Persist the run's current stage, status, outcome and error, and
    /// refresh its heartbeat.
    ///
    /// Only a row still `running` is written. A run that was reaped as stale
    /// gets [`ForecastError::RunAbandoned`] and must stop.
    pub async fn update_cycle_run(&self, run: &CycleRun) -> Result<()> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(UPDATE_RUNNING_RUN, update_params(run)?)
            .await
            .map_err(storage_err)?;
        if affected == 0 {
            return Err(ForecastError::RunAbandoned {
                run_id: run.id.clone(),
            });
        }
        Ok(())
    }

    /// Write the run's terminal state and advance the given sources'
    /// watermarks to the run's start, in one transaction.
    ///
    /// Nothing is written if the run is no longer `running`.
    pub async fn finish_cycle_run(&self, run: &CycleRun, watermark_sources: &[String]) -> Result<()> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        let affected = tx
            .execute(UPDATE_RUNNING_RUN, update_params(run)?)
            .await
            .map_err(storage_err)?;
        if affected == 0 {
            tx.rollback().await.map_err(storage_err)?;
            return Err(ForecastError::RunAbandoned {
                run_id: run.id.clone(),
            });
        }

        for source_id in watermark_sources {
            tx.execute(
                "UPDATE sources SET last_fetched_at = ?1 WHERE id = ?2",
                params![ts(&run.started_at), source_id.as_str()],
            )
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    /// Mark runs still `running` whose last heartbeat is older than `cutoff` as failed.
    pub async fn fail_stale_runs(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        let now = ts(&Utc::now());
        let affected = self
            .conn
            .execute(
                "UPDATE cycle_runs
                 SET status = 'failed', stage = 'failed', completed_at = ?1, updated_at = ?1,
                     error = 'abandoned: no progress before stale cutoff'
                 WHERE status = 'running' AND COALESCE(updated_at, started_at) < ?2",
                params![now, ts(&cutoff)],
            )
            .await
            .map_err(storage_err)?;
        if affected > 0 {
            tracing::warn!(count = affected, "marked stale cycle runs as failed");
        }
        Ok(affected)
    }

    pub async fn get_cycle_run(&self, id: &str) -> Result<Option<CycleRun>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM cycle_runs WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn running_cycle_run(&self) -> Result<Option<CycleRun>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM cycle_runs WHERE status = 'running'
                     ORDER BY started_at DESC LIMIT 1"
                ),
                params![],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recent runs first.
    pub async fn cycle_history(&self, limit: u32) -> Result<Vec<CycleRun>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM cycle_runs ORDER BY started_at DESC LIMIT ?1"),
                params![limit],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_run(&row)?);
        }
        Ok(results)
    }
}

const UPDATE_RUNNING_RUN: &str = "UPDATE cycle_runs
     SET completed_at = ?1, stage = ?2, status = ?3, outcome_json = ?4, error = ?5, updated_at = ?7
     WHERE id = ?6 AND status = 'running'";

fn update_params(run: &CycleRun) -> Result<impl libsql::params::IntoParams> {
    Ok(params![
        run.completed_at.as_ref().map(ts),
        run.stage.as_str(),
        run.status.as_str(),
        outcome_json(&run.outcome)?,
        run.error.clone(),
        run.id.as_str(),
        ts(&Utc::now()),
    ])
}

fn outcome_json(outcome: &CycleOutcome) -> Result<String> {
    serde_json::to_string(outcome).map_err(|e| ForecastError::Storage(format!("encode outcome: {e}")))
}

fn row_to_run(row: &libsql::Row) -> Result<CycleRun> {
    let outcome: CycleOutcome = serde_json::from_str(&col_str(row, 6)?)
        .map_err(|e| ForecastError::Storage(format!("invalid outcome_json: {e}")))?;
    Ok(CycleRun {
        id: col_str(row, 0)?,
        started_at: col_ts(row, 1)?,
        completed_at: col_opt_ts(row, 2)?,
        since: col_opt_ts(row, 3)?,
        stage: col_str(row, 4)?.parse::<CycleStage>()?,
        status: col_str(row, 5)?.parse::<CycleStatus>()?,
        outcome,
        error: col_opt_str(row, 7),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use chrono::Duration;

    #[tokio::test]
    async fn single_running_cycle() {
        let storage = test_storage().await;
        let first = CycleRun::new(None);
        storage.begin_cycle_run(&first).await.expect("first run");

        let second = CycleRun::new(None);
        let err = storage.begin_cycle_run(&second).await.unwrap_err();
        match err {
            ForecastError::CycleInProgress { run_id } => assert_eq!(run_id, first.id),
            other => panic!("unexpected error: {other}"),
        }

        let mut done = first.clone();
        done.stage = CycleStage::Completed;
        done.status = CycleStatus::Completed;
        done.completed_at = Some(Utc::now());
        storage.update_cycle_run(&done).await.unwrap();

        storage.begin_cycle_run(&second).await.expect("slot free again");
    }

    #[tokio::test]
    async fn stale_runs_are_failed() {
        let storage = test_storage().await;
        let mut old = CycleRun::new(None);
        old.started_at = Utc::now() - Duration::hours(5);
        storage.begin_cycle_run(&old).await.unwrap();

        let cleared = storage
            .fail_stale_runs(Utc::now() - Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(cleared, 1);

        let loaded = storage.get_cycle_run(&old.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, CycleStatus::Failed);
        assert!(loaded.error.is_some());
        assert!(storage.running_cycle_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn heartbeat_keeps_long_run_alive() {
        let storage = test_storage().await;
        let mut live = CycleRun::new(None);
        live.started_at = Utc::now() - Duration::hours(3);
        storage.begin_cycle_run(&live).await.unwrap();

        live.stage = CycleStage::Mapping;
        storage.update_cycle_run(&live).await.unwrap();

        let reaped = storage
            .fail_stale_runs(Utc::now() - Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(reaped, 0);

        let second = CycleRun::new(None);
        assert!(matches!(
            storage.begin_cycle_run(&second).await,
            Err(ForecastError::CycleInProgress { .. })
        ));
    }

    #[tokio::test]
    async fn reaped_run_stays_failed() {
        let storage = test_storage().await;
        let source = biothreat_shared::Source::new(
            "feed",
            biothreat_shared::SourceKind::Feed,
            "https://example.com/rss",
            "news",
        );
        storage.insert_source(&source).await.unwrap();

        let mut run = CycleRun::new(None);
        run.started_at = Utc::now() - Duration::hours(5);
        storage.begin_cycle_run(&run).await.unwrap();
        storage
            .fail_stale_runs(Utc::now() - Duration::hours(2))
            .await
            .unwrap();

        run.stage = CycleStage::Completed;
        run.status = CycleStatus::Completed;
        run.completed_at = Some(Utc::now());
        assert!(matches!(
            storage.update_cycle_run(&run).await,
            Err(ForecastError::RunAbandoned { .. })
        ));
        assert!(matches!(
            storage.finish_cycle_run(&run, &[source.id.clone()]).await,
            Err(ForecastError::RunAbandoned { .. })
        ));

        let loaded = storage.get_cycle_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, CycleStatus::Failed);
        let source = storage.get_source_by_name("feed").await.unwrap().unwrap();
        assert!(source.last_fetched_at.is_none());
    }

    #[tokio::test]
    async fn finish_writes_status_and_watermarks() {
        let storage = test_storage().await;
        let source = biothreat_shared::Source::new(
            "feed",
            biothreat_shared::SourceKind::Feed,
            "https://example.com/rss",
            "news",
        );
        storage.insert_source(&source).await.unwrap();

        let mut run = CycleRun::new(None);
        storage.begin_cycle_run(&run).await.unwrap();
        run.stage = CycleStage::Completed;
        run.status = CycleStatus::Completed;
        run.completed_at = Some(Utc::now());
        storage
            .finish_cycle_run(&run, &[source.id.clone()])
            .await
            .unwrap();

        let loaded = storage.get_cycle_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, CycleStatus::Completed);
        let source = storage.get_source_by_name("feed").await.unwrap().unwrap();
        assert!(source.last_fetched_at.is_some());
        assert!(storage.running_cycle_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn outcome_round_trips_through_history() {
        let storage = test_storage().await;
        let mut run = CycleRun::new(Some(Utc::now() - Duration::days(1)));
        storage.begin_cycle_run(&run).await.unwrap();

        run.outcome.documents_new = 3;
        run.outcome.mapping_failures = 1;
        run.stage = CycleStage::FailedPartial;
        run.status = CycleStatus::FailedPartial;
        run.completed_at = Some(Utc::now());
        storage.update_cycle_run(&run).await.unwrap();

        let history = storage.cycle_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, run.outcome);
        assert!(history[0].since.is_some());
    }
}
