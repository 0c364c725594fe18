//! Operator controls: pause / resume / reactivate and the orphaned-state audit.
//!
//! run の外から呼ばれる操作です。`disabled` から抜ける唯一の経路は `reactivate`。
//! disable は cursor や lock の痕跡を消しません。`audit_disabled` がそれを報告するだけです。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::orchestrator::Ports;
use super::run_logger::{IssueDraft, RunLogger};
use crate::domain::{EngineError, IssueCategory, Severity, TaskKey, TaskStatus};

/// A disabled task that still carries cursor or lock state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanedState {
    pub key: TaskKey,
    pub environment: String,
    pub last_cursor: Option<DateTime<Utc>>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub holds_token: bool,
    pub last_error: Option<String>,
}

pub struct Operator {
    ports: Ports,
}

impl Operator {
    pub fn new(ports: Ports) -> Self {
        Self { ports }
    }

    /// Pauses every timeframe of `symbol`. Returns the number of tasks touched.
    pub async fn pause(&self, symbol: &str) -> Result<usize, EngineError> {
        let touched = self.ports.store.set_paused(symbol, true).await?;
        info!(symbol, touched, "paused");
        Ok(touched)
    }

    pub async fn resume(&self, symbol: &str) -> Result<usize, EngineError> {
        let touched = self.ports.store.set_paused(symbol, false).await?;
        info!(symbol, touched, "resumed");
        Ok(touched)
    }

    /// `Ok(false)` when the task was not disabled.
    pub async fn reactivate(&self, key: &TaskKey) -> Result<bool, EngineError> {
        let reactivated = self.ports.store.reactivate(key).await?;
        if reactivated {
            self.logger()
                .issue(
                    IssueDraft::new(
                        Severity::Info,
                        IssueCategory::TaskReactivated,
                        format!("{key} reactivated by operator"),
                    )
                    .task(key),
                    self.ports.clock.now(),
                )
                .await;
        }
        Ok(reactivated)
    }

    /// Lists disabled tasks with lingering state and emits one warning per task.
    pub async fn audit_disabled(
        &self,
        environment: Option<&str>,
    ) -> Result<Vec<OrphanedState>, EngineError> {
        let tasks = self.ports.store.list_tasks(environment).await?;
        let orphaned: Vec<OrphanedState> = tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::Disabled)
            .filter(|t| t.last_cursor.is_some() || t.lock_acquired_at.is_some() || t.lock_token.is_some())
            .map(|t| OrphanedState {
                holds_token: t.lock_token.is_some(),
                key: t.key,
                environment: t.environment,
                last_cursor: t.last_cursor,
                lock_acquired_at: t.lock_acquired_at,
                last_error: t.last_error,
            })
            .collect();

        let logger = self.logger();
        let now = self.ports.clock.now();
        for state in &orphaned {
            logger
                .issue(
                    IssueDraft::new(
                        Severity::Warning,
                        IssueCategory::OrphanedState,
                        format!("{} is disabled but still has state", state.key),
                    )
                    .task(&state.key)
                    .context(json!({
                        "environment": state.environment,
                        "last_cursor": state.last_cursor,
                        "lock_acquired_at": state.lock_acquired_at,
                        "holds_token": state.holds_token,
                        "last_error": state.last_error,
                    })),
                    now,
                )
                .await;
        }
        Ok(orphaned)
    }

    fn logger(&self) -> RunLogger {
        RunLogger::detached(self.ports.run_log.clone(), self.ports.ids.clone())
    }
}
