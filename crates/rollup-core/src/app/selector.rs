//! Task selector: which tasks are due this run.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::config::EngineConfig;
use super::retry::RetryPolicy;
use crate::domain::EngineError;
use crate::ports::{SelectQuery, TaskRef, TaskStore};

pub struct TaskSelector {
    store: Arc<dyn TaskStore>,
    retry: RetryPolicy,
}

impl TaskSelector {
    pub fn new(store: Arc<dyn TaskStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Up to `max_tasks_per_run` due tasks, oldest cursor first.
    /// Transient store errors are retried in-run.
    pub async fn select(
        &self,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRef>, EngineError> {
        let query = SelectQuery {
            environment: config.environment.clone(),
            now,
            limit: config.max_tasks_per_run as usize,
            stale_after: config.stale_after(),
        };

        let mut due = self
            .retry
            .run("select_due_tasks", || self.store.select_due_tasks(&query))
            .await?;

        // never trust the store with the cap
        due.truncate(query.limit);
        Ok(due)
    }
}
