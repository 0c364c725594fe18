//! Run records: one per orchestrator invocation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{ErrorCode, FailureKind};
use super::ids::RunId;
use super::outcome::AggregateStats;
use super::task::TaskKey;

/// What started the invocation. Both take the identical orchestrator path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Schedule,
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trigger::Schedule => "schedule",
            Trigger::Manual => "manual",
        })
    }
}

/// Run status. `Running` until finalized exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_final(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        })
    }
}

/// Per-run outcome tally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTally {
    pub tasks_selected: u32,
    pub tasks_claimed: u32,
    pub tasks_not_claimed: u32,
    pub tasks_deferred: u32,
    pub tasks_succeeded: u32,
    pub transient_failures: u32,
    pub hard_failures: u32,
    pub tasks_disabled: u32,

    #[serde(flatten)]
    pub bars: AggregateStats,

    /// Task-level errors, including failed claim/release calls.
    pub errors: u32,

    /// Best-effort sink calls that failed during the run.
    pub log_failures: u32,
}

impl RunTally {
    pub fn record(&mut self, report: &TaskReport) {
        match &report.result {
            TaskResult::Succeeded { stats, .. } => {
                self.tasks_claimed += 1;
                self.tasks_succeeded += 1;
                self.bars += *stats;
            }
            TaskResult::Failed { kind, disabled, .. } => {
                self.tasks_claimed += 1;
                self.errors += 1;
                match kind {
                    FailureKind::Transient => self.transient_failures += 1,
                    FailureKind::Hard => self.hard_failures += 1,
                }
                if *disabled {
                    self.tasks_disabled += 1;
                }
            }
            TaskResult::NotClaimed { .. } => self.tasks_not_claimed += 1,
            TaskResult::ClaimError { .. } => {
                self.tasks_not_claimed += 1;
                self.errors += 1;
            }
            TaskResult::Deferred => self.tasks_deferred += 1,
        }
        if report.release_error.is_some() {
            self.errors += 1;
        }
    }
}

/// Per-task result inside a run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskResult {
    Succeeded {
        start_cursor: Option<DateTime<Utc>>,
        new_cursor: Option<DateTime<Utc>>,
        stats: AggregateStats,
    },
    Failed {
        kind: FailureKind,
        code: ErrorCode,
        message: String,
        /// Streak after finish; `None` when the finish call itself failed.
        consecutive_hard_failures: Option<u32>,
        disabled: bool,
    },
    NotClaimed {
        reason: String,
    },
    ClaimError {
        code: ErrorCode,
        message: String,
    },
    /// Not attempted: the run budget ran out first.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub key: TaskKey,
    #[serde(flatten)]
    pub result: TaskResult,

    /// The store's finish call failed; the lock stays until it goes stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_error: Option<String>,
}

impl TaskReport {
    pub fn new(key: TaskKey, result: TaskResult) -> Self {
        Self {
            key,
            result,
            release_error: None,
        }
    }
}

/// What a manual trigger returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub job_name: String,
    pub trigger: Trigger,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tally: RunTally,
    pub tasks: Vec<TaskReport>,

    /// Orchestration-level error that ended the run early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub label: String,
    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Persistent run-log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub job_name: String,
    pub trigger: Trigger,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tally: Option<RunTally>,
    pub checkpoints: Vec<Checkpoint>,
}

impl RunRecord {
    pub fn start(run_id: RunId, job_name: impl Into<String>, trigger: Trigger, at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            job_name: job_name.into(),
            trigger,
            status: RunStatus::Running,
            started_at: at,
            finished_at: None,
            tally: None,
            checkpoints: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Timeframe;

    fn key() -> TaskKey {
        TaskKey::new("EURUSD", Timeframe::M5)
    }

    #[test]
    fn tally_counts_each_result_kind() {
        let mut tally = RunTally::default();
        tally.record(&TaskReport::new(
            key(),
            TaskResult::Succeeded {
                start_cursor: None,
                new_cursor: None,
                stats: AggregateStats {
                    bars_created: 3,
                    bars_low_quality: 1,
                    bars_skipped: 0,
                    windows_processed: 3,
                },
            },
        ));
        tally.record(&TaskReport::new(
            key(),
            TaskResult::Failed {
                kind: FailureKind::Hard,
                code: ErrorCode::MissingSourceData,
                message: "missing source data".into(),
                consecutive_hard_failures: Some(3),
                disabled: true,
            },
        ));
        tally.record(&TaskReport::new(
            key(),
            TaskResult::NotClaimed {
                reason: "held".into(),
            },
        ));
        tally.record(&TaskReport::new(key(), TaskResult::Deferred));

        assert_eq!(tally.tasks_claimed, 2);
        assert_eq!(tally.tasks_succeeded, 1);
        assert_eq!(tally.hard_failures, 1);
        assert_eq!(tally.tasks_disabled, 1);
        assert_eq!(tally.tasks_not_claimed, 1);
        assert_eq!(tally.tasks_deferred, 1);
        assert_eq!(tally.bars.bars_created, 3);
        assert_eq!(tally.errors, 1);
    }

    #[test]
    fn tally_serializes_flat() {
        let v = serde_json::to_value(RunTally::default()).unwrap();
        assert_eq!(v["bars_created"], 0);
        assert_eq!(v["windows_processed"], 0);
    }
}
