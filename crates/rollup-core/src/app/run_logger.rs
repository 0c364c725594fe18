//! Best-effort wrapper around the RunLog port.
//!
//! 失敗は `tracing::warn!` に残して数えるだけ。呼び出し側には返しません。
//! run ごとに新しく作り、`failures()` を run summary の `log_failures` にします。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::domain::{
    Checkpoint, IssueCategory, IssueRecord, RunId, RunRecord, RunStatus, RunTally, Severity, TaskKey,
};
use crate::ports::{IdGenerator, LogError, RunLog};

pub struct RunLogger {
    log: Arc<dyn RunLog>,
    ids: Arc<dyn IdGenerator>,
    run_id: Option<RunId>,
    failures: AtomicU32,
}

/// Issue draft; `RunLogger::issue` fills in the id, run and timestamp.
pub struct IssueDraft {
    pub severity: Severity,
    pub category: IssueCategory,
    pub message: String,
    pub task: Option<TaskKey>,
    pub context: serde_json::Value,
}

impl IssueDraft {
    pub fn new(severity: Severity, category: IssueCategory, message: impl Into<String>) -> Self {
        Self {
            severity,
            category,
            message: message.into(),
            task: None,
            context: serde_json::Value::Null,
        }
    }

    pub fn task(mut self, key: &TaskKey) -> Self {
        self.task = Some(key.clone());
        self
    }

    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

impl RunLogger {
    /// Logger scoped to one run (issues are stamped with `run_id`).
    pub fn for_run(log: Arc<dyn RunLog>, ids: Arc<dyn IdGenerator>, run_id: RunId) -> Self {
        Self {
            log,
            ids,
            run_id: Some(run_id),
            failures: AtomicU32::new(0),
        }
    }

    /// Logger for out-of-band operations (operator commands, audits).
    pub fn detached(log: Arc<dyn RunLog>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            log,
            ids,
            run_id: None,
            failures: AtomicU32::new(0),
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub async fn start(&self, record: RunRecord) {
        let result = self.log.start(record).await;
        self.contain("start", result);
    }

    pub async fn checkpoint(&self, label: &str, details: serde_json::Value, at: DateTime<Utc>) {
        let Some(run_id) = self.run_id else {
            return;
        };
        let checkpoint = Checkpoint {
            label: label.to_string(),
            details,
            at,
        };
        let result = self.log.checkpoint(run_id, checkpoint).await;
        self.contain("checkpoint", result);
    }

    pub async fn finish(&self, status: RunStatus, tally: &RunTally, at: DateTime<Utc>) {
        let Some(run_id) = self.run_id else {
            return;
        };
        let result = self.log.finish(run_id, status, tally, at).await;
        self.contain("finish", result);
    }

    pub async fn prune(&self, job_name: &str, keep: usize) {
        match self.log.prune(job_name, keep).await {
            Ok(0) => {}
            Ok(dropped) => info!(job_name, dropped, "pruned old runs"),
            Err(err) => self.contain::<()>("prune", Err(err)),
        }
    }

    pub async fn issue(&self, draft: IssueDraft, at: DateTime<Utc>) {
        match draft.severity {
            Severity::Critical => error!(category = ?draft.category, task = ?draft.task, "{}", draft.message),
            Severity::Warning => warn!(category = ?draft.category, task = ?draft.task, "{}", draft.message),
            Severity::Info => info!(category = ?draft.category, task = ?draft.task, "{}", draft.message),
        }

        let mut record = IssueRecord::new(
            self.ids.generate_issue_id(),
            draft.severity,
            draft.category,
            draft.message,
            at,
        )
        .with_context(draft.context);
        if let Some(run_id) = self.run_id {
            record = record.in_run(run_id);
        }
        if let Some(key) = &draft.task {
            record = record.for_task(key);
        }

        let result = self.log.emit_issue(record).await;
        self.contain("emit_issue", result);
    }

    fn contain<T>(&self, call: &'static str, result: Result<T, LogError>) {
        if let Err(err) = result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(call, %err, "run log call failed");
        }
    }
}
