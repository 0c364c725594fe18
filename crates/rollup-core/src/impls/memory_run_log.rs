//! In-memory RunLog.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::domain::{Checkpoint, IssueRecord, RunId, RunRecord, RunStatus, RunTally};
use crate::ports::{LogError, RunLog};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunLogSnapshot {
    pub runs: Vec<RunRecord>,
    pub issues: Vec<IssueRecord>,
}

#[derive(Clone, Default)]
pub struct InMemoryRunLog {
    state: Arc<Mutex<RunLogSnapshot>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryRunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: RunLogSnapshot) -> Self {
        Self {
            state: Arc::new(Mutex::new(snapshot)),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While set, every call fails with `LogError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> RunLogSnapshot {
        self.state.lock().await.clone()
    }

    pub async fn runs(&self) -> Vec<RunRecord> {
        self.state.lock().await.runs.clone()
    }

    pub async fn issues(&self) -> Vec<IssueRecord> {
        self.state.lock().await.issues.clone()
    }

    fn check_available(&self) -> Result<(), LogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LogError::Unavailable("run log is switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RunLog for InMemoryRunLog {
    async fn start(&self, record: RunRecord) -> Result<(), LogError> {
        self.check_available()?;
        self.state.lock().await.runs.push(record);
        Ok(())
    }

    async fn checkpoint(&self, run_id: RunId, checkpoint: Checkpoint) -> Result<(), LogError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or(LogError::UnknownRun(run_id))?;
        run.checkpoints.push(checkpoint);
        Ok(())
    }

    async fn finish(
        &self,
        run_id: RunId,
        status: RunStatus,
        tally: &RunTally,
        at: DateTime<Utc>,
    ) -> Result<(), LogError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or(LogError::UnknownRun(run_id))?;
        if run.status.is_final() {
            return Err(LogError::AlreadyFinalized(run_id));
        }
        run.status = status;
        run.finished_at = Some(at);
        run.tally = Some(tally.clone());
        Ok(())
    }

    async fn prune(&self, job_name: &str, keep: usize) -> Result<usize, LogError> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        let mut mine: Vec<(DateTime<Utc>, RunId)> = state
            .runs
            .iter()
            .filter(|r| r.job_name == job_name)
            .map(|r| (r.started_at, r.run_id))
            .collect();
        if mine.len() <= keep {
            return Ok(0);
        }
        // newest first; ulid order breaks ties
        mine.sort_by(|a, b| b.cmp(a));
        let dropped: Vec<RunId> = mine.split_off(keep).into_iter().map(|(_, id)| id).collect();

        state.runs.retain(|r| !dropped.contains(&r.run_id));
        Ok(dropped.len())
    }

    async fn emit_issue(&self, issue: IssueRecord) -> Result<(), LogError> {
        self.check_available()?;
        self.state.lock().await.issues.push(issue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Trigger;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn finish_happens_exactly_once() {
        let log = InMemoryRunLog::new();
        let run_id = RunId::generate();
        log.start(RunRecord::start(run_id, "aggregation", Trigger::Manual, t0()))
            .await
            .unwrap();

        log.finish(run_id, RunStatus::Succeeded, &RunTally::default(), t0())
            .await
            .unwrap();
        let again = log
            .finish(run_id, RunStatus::Failed, &RunTally::default(), t0())
            .await;

        assert_eq!(again, Err(LogError::AlreadyFinalized(run_id)));
        assert_eq!(log.runs().await[0].status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn prune_keeps_most_recent_runs_per_job() {
        let log = InMemoryRunLog::new();
        for i in 0..5 {
            log.start(RunRecord::start(
                RunId::generate(),
                "aggregation",
                Trigger::Schedule,
                t0() + Duration::minutes(i),
            ))
            .await
            .unwrap();
        }
        log.start(RunRecord::start(RunId::generate(), "backfill", Trigger::Manual, t0()))
            .await
            .unwrap();

        let dropped = log.prune("aggregation", 2).await.unwrap();
        assert_eq!(dropped, 3);

        let runs = log.runs().await;
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().any(|r| r.job_name == "backfill"));
        assert!(
            runs.iter()
                .filter(|r| r.job_name == "aggregation")
                .all(|r| r.started_at >= t0() + Duration::minutes(3))
        );
    }

    #[tokio::test]
    async fn unavailable_log_rejects_every_call() {
        let log = InMemoryRunLog::new();
        log.set_unavailable(true);

        let err = log
            .start(RunRecord::start(RunId::generate(), "aggregation", Trigger::Manual, t0()))
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Unavailable(_)));
        assert!(log.runs().await.is_empty());
    }
}
