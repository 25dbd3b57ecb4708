//! Cycle run lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ForecastError;

/// Stage of a cycle run. Transitions are checked by [`CycleStage::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStage {
    Idle,
    Fetching,
    Extracting,
    Mapping,
    Finalizing,
    Completed,
    FailedPartial,
    Failed,
}

impl CycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Extracting => "extracting",
            Self::Mapping => "mapping",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::FailedPartial => "failed_partial",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::FailedPartial | Self::Failed)
    }

    pub fn can_transition_to(&self, next: CycleStage) -> bool {
        use CycleStage::*;
        matches!(
            (self, next),
            (Idle, Fetching)
                | (Fetching, Extracting)
                | (Extracting, Mapping)
                | (Mapping, Finalizing)
                | (Finalizing, Completed | FailedPartial)
                | (Fetching | Extracting | Mapping | Finalizing, Failed)
        )
    }
}

impl std::fmt::Display for CycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CycleStage {
    type Err = ForecastError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "idle" => Self::Idle,
            "fetching" => Self::Fetching,
            "extracting" => Self::Extracting,
            "mapping" => Self::Mapping,
            "finalizing" => Self::Finalizing,
            "completed" => Self::Completed,
            "failed_partial" => Self::FailedPartial,
            "failed" => Self::Failed,
            other => return Err(ForecastError::parse(format!("unknown cycle stage '{other}'"))),
        })
    }
}

/// Persisted status of a cycle run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Running,
    Completed,
    FailedPartial,
    Failed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::FailedPartial => "failed_partial",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CycleStatus {
    type Err = ForecastError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed_partial" => Self::FailedPartial,
            "failed" => Self::Failed,
            other => return Err(ForecastError::parse(format!("unknown cycle status '{other}'"))),
        })
    }
}

/// Fetch result for one source within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub source_name: String,
    pub ok: bool,
    /// Candidates returned by the fetch.
    pub fetched: usize,
    /// Documents not previously stored.
    pub new_documents: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counters and per-source results accumulated over a cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleOutcome {
    #[serde(default)]
    pub sources: Vec<SourceOutcome>,
    pub documents_fetched: usize,
    pub documents_new: usize,
    pub documents_extracted: usize,
    pub extraction_failures: usize,
    pub capabilities_added: usize,
    pub pairs_evaluated: usize,
    pub mappings_added: usize,
    pub pairs_below_floor: usize,
    pub mapping_failures: usize,
    #[serde(default)]
    pub cancelled: bool,
}

impl CycleOutcome {
    pub fn source_failures(&self) -> usize {
        self.sources.iter().filter(|s| !s.ok).count()
    }

    /// Any isolated item failure or cancellation.
    pub fn has_failures(&self) -> bool {
        self.source_failures() > 0
            || self.extraction_failures > 0
            || self.mapping_failures > 0
            || self.cancelled
    }
}

/// One execution of the fetch, extract, map pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRun {
    pub id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Explicit lower bound requested by the trigger, overriding watermarks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    pub stage: CycleStage,
    pub status: CycleStatus,
    #[serde(default)]
    pub outcome: CycleOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CycleRun {
    pub fn new(since: Option<DateTime<Utc>>) -> Self {
        Self {
            id: crate::types::new_id(),
            started_at: Utc::now(),
            completed_at: None,
            since,
            stage: CycleStage::Idle,
            status: CycleStatus::Running,
            outcome: CycleOutcome::default(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_transitions() {
        use CycleStage::*;
        assert!(Idle.can_transition_to(Fetching));
        assert!(Fetching.can_transition_to(Extracting));
        assert!(Extracting.can_transition_to(Mapping));
        assert!(Mapping.can_transition_to(Finalizing));
        assert!(Finalizing.can_transition_to(Completed));
        assert!(Finalizing.can_transition_to(FailedPartial));
        assert!(Mapping.can_transition_to(Failed));

        assert!(!Idle.can_transition_to(Mapping));
        assert!(!Fetching.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Fetching));
        assert!(!Idle.can_transition_to(Failed));
    }

    #[test]
    fn stage_and_status_round_trip_strings() {
        for stage in [CycleStage::FailedPartial, CycleStage::Extracting] {
            assert_eq!(stage.as_str().parse::<CycleStage>().unwrap(), stage);
        }
        assert_eq!(
            "failed_partial".parse::<CycleStatus>().unwrap(),
            CycleStatus::FailedPartial
        );
        assert!("bogus".parse::<CycleStatus>().is_err());
    }

    #[test]
    fn outcome_failure_accounting() {
        let mut outcome = CycleOutcome::default();
        assert!(!outcome.has_failures());

        outcome.sources.push(SourceOutcome {
            source_id: "s".into(),
            source_name: "S".into(),
            ok: false,
            fetched: 0,
            new_documents: 0,
            error: Some("timeout".into()),
        });
        assert_eq!(outcome.source_failures(), 1);
        assert!(outcome.has_failures());

        let cancelled = CycleOutcome {
            cancelled: true,
            ..Default::default()
        };
        assert!(cancelled.has_failures());
    }
}
