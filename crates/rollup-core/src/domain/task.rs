//! Aggregation task record: cursor + soft lock + failure streak.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::LockToken;
use super::timeframe::{ParseTimeframeError, Timeframe};

/// Identity of a task: one (symbol, target timeframe) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl TaskKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.timeframe)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseTaskKeyError {
    #[error("expected SYMBOL:TIMEFRAME, got {0:?}")]
    Shape(String),
    #[error(transparent)]
    Timeframe(#[from] ParseTimeframeError),
}

impl FromStr for TaskKey {
    type Err = ParseTaskKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((symbol, timeframe)) = s.split_once(':') else {
            return Err(ParseTaskKeyError::Shape(s.to_string()));
        };
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(ParseTaskKeyError::Shape(s.to_string()));
        }
        Ok(Self::new(symbol, timeframe.parse()?))
    }
}

/// Task status.
///
/// State transitions:
/// - Idle -> Running (claim)
/// - Running -> Idle (finish, success or failure)
/// - Running -> Disabled (consecutive hard failures reached the threshold)
/// - Running (stale) -> Running (reclaimed by a later run, new token)
/// - Disabled -> Idle only through operator reactivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Disabled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Disabled => "disabled",
        })
    }
}

/// Durable per-task state, the unit the store hands out and locks.
///
/// Design:
/// - `last_cursor` is the exclusive lower bound of unprocessed source data
///   (= start of the next window to build).
/// - `lock_acquired_at` + `lock_token` form the soft lock.
/// - State transitions happen through methods, never by poking fields from
///   the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationTask {
    pub key: TaskKey,
    pub environment: String,
    pub status: TaskStatus,

    /// Operator pause flag; a paused task is neither selected nor claimed.
    #[serde(default)]
    pub paused: bool,

    pub last_cursor: Option<DateTime<Utc>>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub lock_token: Option<LockToken>,
    pub consecutive_hard_failures: u32,
    pub derivation_version: u32,

    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl AggregationTask {
    pub fn new(key: TaskKey, environment: impl Into<String>, derivation_version: u32) -> Self {
        Self {
            key,
            environment: environment.into(),
            status: TaskStatus::Idle,
            paused: false,
            last_cursor: None,
            lock_acquired_at: None,
            lock_token: None,
            consecutive_hard_failures: 0,
            derivation_version,
            last_error: None,
            last_success_at: None,
            last_attempt_at: None,
        }
    }

    /// A running task whose lock is older than `stale_after` may be reclaimed.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.status == TaskStatus::Running
            && self
                .lock_acquired_at
                .map(|at| now - at > stale_after)
                .unwrap_or(true)
    }

    /// Idle, or running under a stale lock. Never disabled or paused.
    pub fn is_eligible(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if self.paused {
            return false;
        }
        match self.status {
            TaskStatus::Idle => true,
            TaskStatus::Running => self.is_stale(now, stale_after),
            TaskStatus::Disabled => false,
        }
    }

    /// Take the soft lock.
    pub fn start_claim(&mut self, now: DateTime<Utc>, token: LockToken) {
        self.status = TaskStatus::Running;
        self.lock_acquired_at = Some(now);
        self.lock_token = Some(token);
        self.last_attempt_at = Some(now);
    }

    /// Does `token` still own this task?
    pub fn holds_lock(&self, token: LockToken) -> bool {
        self.status == TaskStatus::Running && self.lock_token == Some(token)
    }

    /// Successful finish. The cursor never moves backwards.
    pub fn mark_succeeded(
        &mut self,
        now: DateTime<Utc>,
        new_cursor: Option<DateTime<Utc>>,
        derivation_version: u32,
    ) {
        if let Some(next) = new_cursor {
            self.last_cursor = Some(match self.last_cursor {
                Some(prev) if prev > next => prev,
                _ => next,
            });
        }
        self.status = TaskStatus::Idle;
        self.consecutive_hard_failures = 0;
        self.derivation_version = derivation_version;
        self.last_error = None;
        self.last_success_at = Some(now);
        self.release_lock();
    }

    /// Failed finish with the streak already decided by the disable policy.
    pub fn mark_failed(&mut self, error: String, streak: u32, disable: bool) {
        self.status = if disable {
            TaskStatus::Disabled
        } else {
            TaskStatus::Idle
        };
        self.consecutive_hard_failures = streak;
        self.last_error = Some(error);
        self.release_lock();
    }

    /// Operator reactivation: the only way out of `Disabled`.
    pub fn reactivate(&mut self) {
        self.status = TaskStatus::Idle;
        self.consecutive_hard_failures = 0;
        self.release_lock();
    }

    fn release_lock(&mut self) {
        self.lock_acquired_at = None;
        self.lock_token = None;
    }
}
