//! RunLog port - run / issue の append-only ログ
//!
//! 呼び出し側（app::run_logger）は失敗を握りつぶして数えるだけです。
//! ここでの失敗が集計処理を止めることはありません。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Checkpoint, IssueRecord, RunId, RunRecord, RunStatus, RunTally};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("run log unavailable: {0}")]
    Unavailable(String),

    #[error("unknown run: {0}")]
    UnknownRun(RunId),

    #[error("run {0} is already finalized")]
    AlreadyFinalized(RunId),
}

#[async_trait]
pub trait RunLog: Send + Sync {
    async fn start(&self, record: RunRecord) -> Result<(), LogError>;

    async fn checkpoint(&self, run_id: RunId, checkpoint: Checkpoint) -> Result<(), LogError>;

    /// Finalizes a run exactly once.
    async fn finish(
        &self,
        run_id: RunId,
        status: RunStatus,
        tally: &RunTally,
        at: DateTime<Utc>,
    ) -> Result<(), LogError>;

    /// Keeps the `keep` most recent runs of `job_name`. Returns how many were dropped.
    async fn prune(&self, job_name: &str, keep: usize) -> Result<usize, LogError>;

    async fn emit_issue(&self, issue: IssueRecord) -> Result<(), LogError>;
}
