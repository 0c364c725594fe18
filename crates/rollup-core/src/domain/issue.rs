//! Issue records: append-only anomaly log used for alerting and audit.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{IssueId, RunId};
use super::task::TaskKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    TransientFailure,
    HardFailure,
    TaskDisabled,
    TaskReactivated,
    StaleLockReclaimed,
    /// A release was ignored because a newer owner holds the lock.
    LockSuperseded,
    ClaimFailed,
    ReleaseFailed,
    DerivationVersionChanged,
    OrchestrationFailure,
    LeasePressure,
    OrphanedState,
}

/// One detected anomaly. Never mutated after emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub issue_id: IssueId,
    pub run_id: Option<RunId>,
    pub severity: Severity,
    pub category: IssueCategory,
    pub message: String,
    pub task: Option<TaskKey>,

    /// Structured details (error code, streak, timestamps...).
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl IssueRecord {
    pub fn new(
        issue_id: IssueId,
        severity: Severity,
        category: IssueCategory,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            issue_id,
            run_id: None,
            severity,
            category,
            message: message.into(),
            task: None,
            context: serde_json::Value::Null,
            created_at,
        }
    }

    pub fn in_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn for_task(mut self, key: &TaskKey) -> Self {
        self.task = Some(key.clone());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}
