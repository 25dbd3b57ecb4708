//! Read-only queries consumed by report commands.

use biothreat_shared::{MappingView, Result, ThreatLevel, ThreatLevelCuts};
use chrono::{DateTime, Duration, Utc};
use libsql::params;
use serde::Serialize;

use crate::{Storage, col_f64, col_i64, col_opt_str, col_opt_ts, col_str, col_ts, storage_err, ts};

const MAPPING_VIEW_SELECT: &str = "SELECT m.id, m.feasibility_score, m.rationale, m.scored_at,
            c.statement, c.confidence, t.name, t.grp, d.title, d.url, s.name
     FROM mappings m
     JOIN capabilities c ON c.id = m.capability_id
     JOIN threat_categories t ON t.id = m.threat_category_id
     JOIN documents d ON d.id = c.document_id
     JOIN sources s ON s.id = d.source_id";

/// Direction of mapping activity for a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Decreasing,
    Stable,
    Increasing,
    RapidlyIncreasing,
}

impl Trend {
    /// Compare mappings scored in the recent window against the window before it.
    ///
    /// Doubling with at least three more mappings counts as rapid growth.
    pub fn from_counts(recent: u64, prior: u64) -> Self {
        if recent > prior {
            if recent >= prior.saturating_mul(2) && recent - prior >= 3 {
                Self::RapidlyIncreasing
            } else {
                Self::Increasing
            }
        } else if recent < prior {
            Self::Decreasing
        } else {
            Self::Stable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decreasing => "decreasing",
            Self::Stable => "stable",
            Self::Increasing => "increasing",
            Self::RapidlyIncreasing => "rapidly_increasing",
        }
    }
}

/// Aggregate view of one threat category's active mappings.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatOverview {
    pub category_name: String,
    pub category_group: String,
    pub timeline_estimate: Option<String>,
    pub mapping_count: u64,
    pub max_score: Option<f64>,
    pub mean_score: Option<f64>,
    pub last_scored_at: Option<DateTime<Utc>>,
    pub recent_count: u64,
    pub prior_count: u64,
    pub trend: Trend,
    pub threat_level: ThreatLevel,
}

impl Storage {
    /// Active mappings at or above `min_score`, most recently scored first.
    pub async fn latest_mappings(&self, min_score: f64, limit: u32) -> Result<Vec<MappingView>> {
        let sql = format!(
            "{MAPPING_VIEW_SELECT}
             WHERE m.active = 1 AND m.feasibility_score >= ?1
             ORDER BY m.scored_at DESC, m.feasibility_score DESC
             LIMIT ?2"
        );
        let mut rows = self
            .conn
            .query(&sql, params![min_score, limit])
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_view(&row)?);
        }
        Ok(results)
    }

    /// Active mappings for one category, highest score first.
    pub async fn mappings_by_category(
        &self,
        category_name: &str,
        min_score: f64,
    ) -> Result<Vec<MappingView>> {
        let sql = format!(
            "{MAPPING_VIEW_SELECT}
             WHERE m.active = 1 AND t.name = ?1 AND m.feasibility_score >= ?2
             ORDER BY m.feasibility_score DESC, m.scored_at DESC"
        );
        let mut rows = self
            .conn
            .query(&sql, params![category_name, min_score])
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_view(&row)?);
        }
        Ok(results)
    }

    /// Per-category aggregates with a trend over `window_days` and a level
    /// derived from the highest active score.
    pub async fn threat_overview(
        &self,
        window_days: u32,
        cuts: &ThreatLevelCuts,
    ) -> Result<Vec<ThreatOverview>> {
        let now = Utc::now();
        let window = Duration::days(i64::from(window_days.max(1)));
        let recent_start = ts(&(now - window));
        let prior_start = ts(&(now - window - window));

        let mut rows = self
            .conn
            .query(
                "SELECT t.name, t.grp, t.timeline_estimate,
                        COUNT(m.id), MAX(m.feasibility_score), AVG(m.feasibility_score), MAX(m.scored_at),
                        COALESCE(SUM(CASE WHEN m.scored_at >= ?1 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN m.scored_at >= ?2 AND m.scored_at < ?1 THEN 1 ELSE 0 END), 0)
                 FROM threat_categories t
                 LEFT JOIN mappings m ON m.threat_category_id = t.id AND m.active = 1
                 GROUP BY t.id
                 ORDER BY MAX(m.feasibility_score) DESC, t.name",
                params![recent_start.as_str(), prior_start.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let recent_count = col_i64(&row, 7)?.max(0) as u64;
            let prior_count = col_i64(&row, 8)?.max(0) as u64;
            let max_score = row.get::<f64>(4).ok();
            results.push(ThreatOverview {
                category_name: col_str(&row, 0)?,
                category_group: col_str(&row, 1)?,
                timeline_estimate: col_opt_str(&row, 2),
                mapping_count: col_i64(&row, 3)?.max(0) as u64,
                max_score,
                mean_score: row.get::<f64>(5).ok(),
                last_scored_at: col_opt_ts(&row, 6)?,
                recent_count,
                prior_count,
                trend: Trend::from_counts(recent_count, prior_count),
                threat_level: cuts.level(max_score),
            });
        }
        Ok(results)
    }
}

fn row_to_view(row: &libsql::Row) -> Result<MappingView> {
    Ok(MappingView {
        mapping_id: col_str(row, 0)?,
        feasibility_score: col_f64(row, 1)?,
        rationale: col_str(row, 2)?,
        scored_at: col_ts(row, 3)?,
        capability_statement: col_str(row, 4)?,
        capability_confidence: col_f64(row, 5)?,
        category_name: col_str(row, 6)?,
        category_group: col_str(row, 7)?,
        document_title: col_str(row, 8)?,
        document_url: col_opt_str(row, 9),
        source_name: col_str(row, 10)?,
    })
}
