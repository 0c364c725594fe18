//! Outcome model: what one aggregation attempt produced.
//!
//! This module does not assume any store technology. It only defines the
//! "shape" of results that the store records on finish and the run log tallies.

use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{ErrorCode, FailureKind};

/// Counters returned by the window aggregator for one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub bars_created: u32,
    pub bars_low_quality: u32,
    pub bars_skipped: u32,
    pub windows_processed: u32,
}

impl AggregateStats {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl AddAssign for AggregateStats {
    fn add_assign(&mut self, rhs: Self) {
        self.bars_created += rhs.bars_created;
        self.bars_low_quality += rhs.bars_low_quality;
        self.bars_skipped += rhs.bars_skipped;
        self.windows_processed += rhs.windows_processed;
    }
}

/// What the engine reports to the store when releasing a lock.
///
/// - `Success`: the cursor moves to `new_cursor` (`None` = unchanged)
/// - `Failure`: the lock is released and the streak handled by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success {
        new_cursor: Option<DateTime<Utc>>,
        stats: AggregateStats,
    },
    Failure {
        kind: FailureKind,
        code: ErrorCode,
        error: String,
    },
}

impl TaskOutcome {
    pub fn success(new_cursor: Option<DateTime<Utc>>, stats: AggregateStats) -> Self {
        TaskOutcome::Success { new_cursor, stats }
    }

    pub fn failure(kind: FailureKind, code: ErrorCode, error: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            kind,
            code,
            error: error.into(),
        }
    }

    /// `None` for a success.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            TaskOutcome::Success { .. } => None,
            TaskOutcome::Failure { kind, .. } => Some(*kind),
        }
    }
}
