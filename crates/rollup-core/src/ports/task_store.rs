//! TaskStore port - タスク状態の正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - per-(symbol, timeframe) の cursor / soft lock / 失敗 streak
//! - source bar（1m）の範囲情報（bootstrap 用）
//!
//! # 設計原則
//! - select / claim / bootstrap / finish はそれぞれ単一の不可分操作
//! - claim は compare-and-swap: 同じタスクを同時に claim しても勝者は 1 つ
//! - finish は claim 時の token を条件にする。奪われた lock の release は無視（`applied = false`）
//! - hard failure の加算と auto-disable は finish の中で同時に確定する

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AggregationTask, EngineError, LockToken, TaskKey, TaskOutcome, TaskStatus};

/// Input of `select_due_tasks`.
#[derive(Debug, Clone)]
pub struct SelectQuery {
    pub environment: String,
    pub now: DateTime<Utc>,
    pub limit: usize,
    pub stale_after: Duration,
}

/// A due task as returned by selection. Read-only snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRef {
    pub key: TaskKey,
    pub status: TaskStatus,
    pub last_cursor: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub key: TaskKey,
    pub now: DateTime<Utc>,
    pub stale_after: Duration,
}

/// Exclusive processing rights over one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimGrant {
    pub key: TaskKey,
    pub token: LockToken,

    /// Cursor at claim time (`None` = needs bootstrap).
    pub last_cursor: Option<DateTime<Utc>>,

    /// Version stamped by the last successful finish.
    pub derivation_version: u32,

    /// Lock timestamp of the previous owner when a stale lock was taken over.
    pub reclaimed_from: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NotClaimedReason {
    /// Another owner holds a fresh lock.
    HeldByOther { since: Option<DateTime<Utc>> },
    Disabled,
    Paused,
    Missing,
}

impl std::fmt::Display for NotClaimedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotClaimedReason::HeldByOther { since: Some(at) } => {
                write!(f, "held by another owner since {}", at.to_rfc3339())
            }
            NotClaimedReason::HeldByOther { since: None } => f.write_str("held by another owner"),
            NotClaimedReason::Disabled => f.write_str("disabled"),
            NotClaimedReason::Paused => f.write_str("paused"),
            NotClaimedReason::Missing => f.write_str("task no longer exists"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(ClaimGrant),
    NotClaimed(NotClaimedReason),
}

/// Input of `finish`: releases the lock and records the outcome atomically.
#[derive(Debug, Clone)]
pub struct FinishRequest {
    pub key: TaskKey,
    pub token: LockToken,
    pub outcome: TaskOutcome,
    pub now: DateTime<Utc>,
    pub auto_disable_threshold: u32,
    pub derivation_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishReport {
    /// `false` when the token no longer owns the task; nothing was written.
    pub applied: bool,
    pub status: TaskStatus,
    pub consecutive_hard_failures: u32,

    /// This finish moved the task to `Disabled`.
    pub disabled_now: bool,
}

/// TaskStore は cursor と lock の正本
///
/// # Thread Safety
/// - 複数の invocation / 並行タスクから同時に呼ばれる前提
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Idle or stale-running tasks of `environment`, longest-unprocessed first:
    /// null cursor, then ascending cursor, then symbol, then timeframe.
    /// Never returns disabled or paused tasks. Read-only.
    async fn select_due_tasks(&self, query: &SelectQuery) -> Result<Vec<TaskRef>, EngineError>;

    async fn claim(&self, request: &ClaimRequest) -> Result<ClaimOutcome, EngineError>;

    /// Earliest 1m source timestamp across every symbol that has a task for
    /// `key.timeframe`, floored to that timeframe. `None` when there is no data yet.
    async fn bootstrap_cursor(
        &self,
        key: &TaskKey,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, EngineError>;

    async fn finish(&self, request: &FinishRequest) -> Result<FinishReport, EngineError>;

    /// All tasks, optionally restricted to one environment.
    async fn list_tasks(&self, environment: Option<&str>)
    -> Result<Vec<AggregationTask>, EngineError>;

    /// Set or clear the pause flag on every timeframe of `symbol`.
    /// Returns the number of tasks touched.
    async fn set_paused(&self, symbol: &str, paused: bool) -> Result<usize, EngineError>;

    /// `Disabled -> Idle` with the streak zeroed. `Ok(false)` if the task was not disabled.
    async fn reactivate(&self, key: &TaskKey) -> Result<bool, EngineError>;
}
