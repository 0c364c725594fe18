//! Per-invocation context, built fresh for every run.

use chrono::{DateTime, Utc};

use super::config::EngineConfig;
use crate::domain::{RunId, Trigger};

#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,

    /// Config snapshot; a config change mid-run does not affect this run.
    pub config: EngineConfig,
}

impl RunContext {
    pub fn new(run_id: RunId, trigger: Trigger, started_at: DateTime<Utc>, config: EngineConfig) -> Self {
        Self {
            run_id,
            trigger,
            started_at,
            config,
        }
    }

    /// `true` once `now` is past the configured wall-clock budget.
    pub fn budget_exhausted(&self, now: DateTime<Utc>) -> bool {
        let Some(budget) = self.config.max_run_budget else {
            return false;
        };
        match (now - self.started_at).to_std() {
            Ok(elapsed) => elapsed >= budget,
            // clock went backwards
            Err(_) => false,
        }
    }
}
