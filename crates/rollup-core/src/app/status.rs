//! Status - タスクの状態集計と遅延（lag）レポート

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AggregationTask, EngineError, TaskKey, TaskStatus, Timeframe};
use crate::ports::TaskStore;

/// Exclusive buckets: disabled wins over paused, paused over the lock state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub idle: usize,
    pub running: usize,
    pub stale_running: usize,
    pub disabled: usize,
    pub paused: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeLag {
    pub timeframe: Timeframe,
    pub tasks: usize,
    pub never_processed: usize,
    pub oldest_cursor: Option<DateTime<Utc>>,

    /// `now - oldest_cursor`, in seconds.
    pub max_lag_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub counts: TaskCounts,
    pub lag: Vec<TimeframeLag>,
    pub disabled: Vec<TaskKey>,
}

impl TaskCounts {
    pub fn from_tasks(tasks: &[AggregationTask], now: DateTime<Utc>, stale_after: Duration) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Disabled => counts.disabled += 1,
                _ if task.paused => counts.paused += 1,
                TaskStatus::Idle => counts.idle += 1,
                TaskStatus::Running if task.is_stale(now, stale_after) => counts.stale_running += 1,
                TaskStatus::Running => counts.running += 1,
            }
        }
        counts
    }
}

impl HealthReport {
    pub fn from_tasks(tasks: &[AggregationTask], now: DateTime<Utc>, stale_after: Duration) -> Self {
        let mut by_tf: BTreeMap<Timeframe, TimeframeLag> = BTreeMap::new();
        for task in tasks.iter().filter(|t| t.status != TaskStatus::Disabled) {
            let entry = by_tf.entry(task.key.timeframe).or_insert(TimeframeLag {
                timeframe: task.key.timeframe,
                tasks: 0,
                never_processed: 0,
                oldest_cursor: None,
                max_lag_seconds: None,
            });
            entry.tasks += 1;
            match task.last_cursor {
                None => entry.never_processed += 1,
                Some(cursor) => {
                    if entry.oldest_cursor.is_none_or(|oldest| cursor < oldest) {
                        entry.oldest_cursor = Some(cursor);
                    }
                }
            }
        }
        for lag in by_tf.values_mut() {
            lag.max_lag_seconds = lag.oldest_cursor.map(|c| (now - c).num_seconds());
        }

        Self {
            generated_at: now,
            counts: TaskCounts::from_tasks(tasks, now, stale_after),
            lag: by_tf.into_values().collect(),
            disabled: tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Disabled)
                .map(|t| t.key.clone())
                .collect(),
        }
    }

    pub async fn collect(
        store: &dyn TaskStore,
        environment: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Self, EngineError> {
        let tasks = store.list_tasks(Some(environment)).await?;
        Ok(Self::from_tasks(&tasks, now, stale_after))
    }
}
