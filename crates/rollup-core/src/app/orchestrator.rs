//! Run orchestrator: one invocation end to end.
//!
//! # 流れ
//! 1. run record を開始（best-effort）
//! 2. due なタスクを選ぶ（transient なら in-run retry）
//! 3. タスクごとに claim → cursor 決定（なければ bootstrap）→ aggregate → finish
//! 4. 古い run を prune、run record を確定
//!
//! # 設計原則
//! - プロセス内に状態を持ち越さない。`RunContext` は run ごとに作る
//! - 1 タスクの失敗は他のタスクを止めない（タスク単位で catch）
//! - selection の失敗だけが run 全体を failed にする。タスク状態には触れない
//! - hard failure の加算と auto-disable は store の finish が不可分に行う

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::bootstrap::CursorBootstrapper;
use super::classify::Classifier;
use super::config::EngineConfig;
use super::context::RunContext;
use super::lock::{Claim, LockManager, TaskLease};
use super::retry::RetryPolicy;
use super::run_logger::{IssueDraft, RunLogger};
use super::selector::TaskSelector;
use crate::domain::{
    AggregateStats, EngineError, FailureKind, IssueCategory, RunRecord, RunStatus, RunSummary,
    RunTally, Severity, TaskOutcome, TaskReport, TaskResult, Trigger,
};
use crate::impls::{InMemoryRunLog, InMemoryTaskStore};
use crate::ports::{
    AggregateRequest, Clock, FinishReport, IdGenerator, RunLog, TaskRef, TaskStore, UlidGenerator,
    WindowAggregator,
};

/// Port handles. The orchestrator holds nothing else between runs.
#[derive(Clone)]
pub struct Ports {
    pub store: Arc<dyn TaskStore>,
    pub aggregator: Arc<dyn WindowAggregator>,
    pub run_log: Arc<dyn RunLog>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}

impl Ports {
    /// Wires the in-memory store (as both store and aggregator) and run log.
    pub fn in_memory(store: InMemoryTaskStore, run_log: InMemoryRunLog, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(store.clone()),
            aggregator: Arc::new(store),
            run_log: Arc::new(run_log),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        }
    }
}

pub struct RunOrchestrator {
    ports: Ports,
    selection_retry: RetryPolicy,
}

impl RunOrchestrator {
    pub fn new(ports: Ports) -> Self {
        Self {
            ports,
            selection_retry: RetryPolicy::default(),
        }
    }

    pub fn with_selection_retry(mut self, retry: RetryPolicy) -> Self {
        self.selection_retry = retry;
        self
    }

    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    /// Runs one invocation. Never fails: orchestration errors end up in the
    /// returned summary with `status = Failed`.
    pub async fn run(&self, config: &EngineConfig, trigger: Trigger) -> RunSummary {
        let started_at = self.ports.clock.now();
        let run_id = self.ports.ids.generate_run_id();
        let ctx = RunContext::new(run_id, trigger, started_at, config.clone());

        let span = info_span!("aggregation_run", %run_id, %trigger);
        self.run_in_context(ctx).instrument(span).await
    }

    async fn run_in_context(&self, ctx: RunContext) -> RunSummary {
        let logger = Arc::new(RunLogger::for_run(
            Arc::clone(&self.ports.run_log),
            Arc::clone(&self.ports.ids),
            ctx.run_id,
        ));
        logger
            .start(RunRecord::start(
                ctx.run_id,
                ctx.config.job_name.clone(),
                ctx.trigger,
                ctx.started_at,
            ))
            .await;
        info!(job_name = %ctx.config.job_name, environment = %ctx.config.environment, "run started");

        let mut tally = RunTally::default();

        let due = match self.select(&ctx).await {
            Ok(due) => due,
            Err(err) => {
                error!(%err, "selection failed, aborting run");
                logger
                    .issue(
                        IssueDraft::new(
                            Severity::Critical,
                            IssueCategory::OrchestrationFailure,
                            format!("run aborted: {err}"),
                        )
                        .context(json!({ "code": err.code(), "origin": err.origin() })),
                        self.ports.clock.now(),
                    )
                    .await;
                return self
                    .finalize(&ctx, &logger, tally, Vec::new(), Some(err.to_string()))
                    .await;
            }
        };

        tally.tasks_selected = due.len() as u32;
        logger
            .checkpoint("selected", json!({ "tasks": due.len() }), self.ports.clock.now())
            .await;
        debug!(tasks = due.len(), "selected due tasks");

        let reports = self.process_all(&ctx, &logger, due).await;
        for report in &reports {
            tally.record(report);
        }
        logger
            .checkpoint(
                "processed",
                json!({
                    "claimed": tally.tasks_claimed,
                    "deferred": tally.tasks_deferred,
                    "errors": tally.errors,
                }),
                self.ports.clock.now(),
            )
            .await;

        self.check_lease_pressure(&ctx, &logger).await;
        self.finalize(&ctx, &logger, tally, reports, None).await
    }

    async fn select(&self, ctx: &RunContext) -> Result<Vec<TaskRef>, EngineError> {
        ctx.config
            .validate()
            .map_err(|e| EngineError::contract(format!("invalid configuration: {e}")))?;
        TaskSelector::new(Arc::clone(&self.ports.store), self.selection_retry.clone())
            .select(&ctx.config, ctx.started_at)
            .await
    }

    async fn process_all(
        &self,
        ctx: &RunContext,
        logger: &Arc<RunLogger>,
        due: Vec<TaskRef>,
    ) -> Vec<TaskReport> {
        let processor = Arc::new(TaskProcessor {
            ports: self.ports.clone(),
            ctx: ctx.clone(),
            logger: Arc::clone(logger),
            lock: LockManager::new(Arc::clone(&self.ports.store)),
            bootstrapper: CursorBootstrapper::new(
                Arc::clone(&self.ports.store),
                ctx.config.unified_start,
            ),
            classifier: Classifier::new(ctx.config.classify_by_message),
        });

        let semaphore = Arc::new(Semaphore::new(ctx.config.task_concurrency.max(1)));
        let mut running = JoinSet::new();
        let mut reports: Vec<(usize, TaskReport)> = Vec::with_capacity(due.len());
        let mut pending = due.into_iter().enumerate();

        while let Some((idx, task)) = pending.next() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                reports.push((idx, TaskReport::new(task.key, TaskResult::Deferred)));
                continue;
            };

            // budget is checked right before each claim
            if ctx.budget_exhausted(self.ports.clock.now()) {
                warn!(remaining = pending.len() + 1, "run budget exhausted, deferring remaining tasks");
                reports.push((idx, TaskReport::new(task.key, TaskResult::Deferred)));
                reports.extend(
                    pending
                        .by_ref()
                        .map(|(i, t)| (i, TaskReport::new(t.key, TaskResult::Deferred))),
                );
                break;
            }

            let processor = Arc::clone(&processor);
            running.spawn(
                async move {
                    let _permit = permit;
                    (idx, processor.process(task).await)
                }
                .in_current_span(),
            );
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(entry) => reports.push(entry),
                // the task's lock stays until it goes stale
                Err(join_err) => error!(error = %join_err, "task processing panicked"),
            }
        }

        reports.sort_by_key(|(idx, _)| *idx);
        reports.into_iter().map(|(_, report)| report).collect()
    }

    async fn check_lease_pressure(&self, ctx: &RunContext, logger: &RunLogger) {
        let elapsed = self.ports.clock.now() - ctx.started_at;
        let warn_after = ctx.config.lease_warning_after();
        if elapsed <= warn_after {
            return;
        }
        logger
            .issue(
                IssueDraft::new(
                    Severity::Warning,
                    IssueCategory::LeasePressure,
                    format!(
                        "run took {}s, over 80% of the {}s lock lease",
                        elapsed.num_seconds(),
                        ctx.config.running_stale_seconds
                    ),
                )
                .context(json!({
                    "elapsed_ms": elapsed.num_milliseconds(),
                    "running_stale_seconds": ctx.config.running_stale_seconds,
                })),
                self.ports.clock.now(),
            )
            .await;
    }

    async fn finalize(
        &self,
        ctx: &RunContext,
        logger: &RunLogger,
        mut tally: RunTally,
        tasks: Vec<TaskReport>,
        error: Option<String>,
    ) -> RunSummary {
        let status = if error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        // the current run is never pruned before its finish
        logger
            .prune(&ctx.config.job_name, ctx.config.run_log_keep.max(1))
            .await;

        let finished_at = self.ports.clock.now();
        tally.log_failures = logger.failures();
        logger.finish(status, &tally, finished_at).await;
        // the finish call itself may have failed
        tally.log_failures = logger.failures();

        info!(
            %status,
            selected = tally.tasks_selected,
            claimed = tally.tasks_claimed,
            succeeded = tally.tasks_succeeded,
            transient = tally.transient_failures,
            hard = tally.hard_failures,
            disabled = tally.tasks_disabled,
            bars_created = tally.bars.bars_created,
            log_failures = tally.log_failures,
            "run finished"
        );

        RunSummary {
            run_id: ctx.run_id,
            job_name: ctx.config.job_name.clone(),
            trigger: ctx.trigger,
            status,
            started_at: ctx.started_at,
            finished_at,
            tally,
            tasks,
            error,
        }
    }
}

/// Per-task pipeline, shared by every spawned task of one run.
struct TaskProcessor {
    ports: Ports,
    ctx: RunContext,
    logger: Arc<RunLogger>,
    lock: LockManager,
    bootstrapper: CursorBootstrapper,
    classifier: Classifier,
}

impl TaskProcessor {
    async fn process(&self, task: TaskRef) -> TaskReport {
        let span = info_span!("task", task = %task.key);
        self.process_inner(task).instrument(span).await
    }

    async fn process_inner(&self, task: TaskRef) -> TaskReport {
        let key = task.key;
        let config = &self.ctx.config;
        let now = self.ports.clock.now();

        let lease = match self.lock.claim(&key, now, config.stale_after()).await {
            Ok(Claim::Acquired(lease)) => lease,
            Ok(Claim::NotClaimed(reason)) => {
                debug!(%reason, "not claimed");
                return TaskReport::new(
                    key,
                    TaskResult::NotClaimed {
                        reason: reason.to_string(),
                    },
                );
            }
            Err(err) => {
                self.logger
                    .issue(
                        IssueDraft::new(
                            Severity::Warning,
                            IssueCategory::ClaimFailed,
                            format!("claim failed for {key}: {err}"),
                        )
                        .task(&key)
                        .context(json!({ "code": err.code() })),
                        self.ports.clock.now(),
                    )
                    .await;
                return TaskReport::new(
                    key,
                    TaskResult::ClaimError {
                        code: err.code(),
                        message: err.message().to_string(),
                    },
                );
            }
        };

        self.note_claim(&lease).await;

        let start_cursor = lease.last_cursor();
        match self.aggregate(&lease, now).await {
            Ok((new_cursor, stats)) => {
                info!(
                    start = ?start_cursor,
                    new_cursor = ?new_cursor,
                    created = stats.bars_created,
                    low_quality = stats.bars_low_quality,
                    skipped = stats.bars_skipped,
                    windows = stats.windows_processed,
                    "task succeeded"
                );
                let outcome = TaskOutcome::success(new_cursor, stats);
                let mut report = TaskReport::new(
                    key.clone(),
                    TaskResult::Succeeded {
                        start_cursor,
                        new_cursor,
                        stats,
                    },
                );
                report.release_error = self.release(lease, outcome).await.err();
                report
            }
            Err(err) => self.fail(lease, err).await,
        }
    }

    /// Cursor resolution + aggregation + contract checks.
    async fn aggregate(
        &self,
        lease: &TaskLease,
        now: DateTime<Utc>,
    ) -> Result<(Option<DateTime<Utc>>, AggregateStats), EngineError> {
        let config = &self.ctx.config;

        let cursor = match lease.last_cursor() {
            Some(cursor) => cursor,
            None => match self.bootstrapper.bootstrap(lease.key(), now).await? {
                Some(cursor) => {
                    info!(cursor = %cursor.to_rfc3339(), "bootstrapped cursor");
                    cursor
                }
                None => {
                    debug!("no source data yet, nothing to aggregate");
                    return Ok((None, AggregateStats::default()));
                }
            },
        };

        let request = AggregateRequest {
            key: lease.key().clone(),
            start_cursor: cursor,
            max_windows: config.max_windows_per_task,
            now,
            derivation_version: config.derivation_version,
            force_incomplete: config.force_incomplete,
        };
        let result = self.ports.aggregator.aggregate_range(&request).await?;

        if result.new_cursor < cursor {
            return Err(EngineError::contract(format!(
                "cursor moved backwards: {} -> {}",
                cursor.to_rfc3339(),
                result.new_cursor.to_rfc3339()
            )));
        }
        if result.stats.windows_processed > config.max_windows_per_task {
            return Err(EngineError::contract(format!(
                "processed {} windows, limit is {}",
                result.stats.windows_processed, config.max_windows_per_task
            )));
        }

        Ok((Some(result.new_cursor), result.stats))
    }

    async fn fail(&self, lease: TaskLease, err: EngineError) -> TaskReport {
        let key = lease.key().clone();
        let kind = self.classifier.classify(&err);
        let outcome = TaskOutcome::failure(kind, err.code(), err.message());

        let (finish, release_error) = match self.release_report(lease, outcome).await {
            Ok(report) => (Some(report), None),
            Err(msg) => (None, Some(msg)),
        };
        let streak = finish.as_ref().map(|r| r.consecutive_hard_failures);
        let disabled = finish.as_ref().is_some_and(|r| r.disabled_now);

        let (severity, category) = match kind {
            FailureKind::Transient => (Severity::Warning, IssueCategory::TransientFailure),
            FailureKind::Hard => (Severity::Critical, IssueCategory::HardFailure),
        };
        warn!(%kind, %err, streak = ?streak, "task failed");
        self.logger
            .issue(
                IssueDraft::new(severity, category, format!("{key}: {err}"))
                    .task(&key)
                    .context(json!({
                        "code": err.code(),
                        "origin": err.origin(),
                        "kind": kind,
                        "consecutive_hard_failures": streak,
                    })),
                self.ports.clock.now(),
            )
            .await;

        if disabled {
            self.logger
                .issue(
                    IssueDraft::new(
                        Severity::Critical,
                        IssueCategory::TaskDisabled,
                        format!(
                            "{key} disabled after {} consecutive hard failures",
                            streak.unwrap_or_default()
                        ),
                    )
                    .task(&key)
                    .context(json!({
                        "consecutive_hard_failures": streak,
                        "threshold": self.ctx.config.auto_disable_hard_fails,
                        "last_error": err.to_string(),
                    })),
                    self.ports.clock.now(),
                )
                .await;
        }

        TaskReport {
            key,
            result: TaskResult::Failed {
                kind,
                code: err.code(),
                message: err.message().to_string(),
                consecutive_hard_failures: streak,
                disabled,
            },
            release_error,
        }
    }

    async fn release(&self, lease: TaskLease, outcome: TaskOutcome) -> Result<(), String> {
        self.release_report(lease, outcome).await.map(|_| ())
    }

    /// Finish through the lock manager. Errors and superseded tokens are
    /// reported as issues and come back as the release error text.
    async fn release_report(
        &self,
        lease: TaskLease,
        outcome: TaskOutcome,
    ) -> Result<FinishReport, String> {
        let key = lease.key().clone();
        let token = lease.token();
        let config = &self.ctx.config;

        let result = self
            .lock
            .release(
                lease,
                outcome,
                self.ports.clock.now(),
                config.auto_disable_hard_fails,
                config.derivation_version,
            )
            .await;

        match result {
            Ok(report) if report.applied => Ok(report),
            Ok(_) => {
                let message = format!("{key}: lock {token} was superseded, finish ignored");
                self.logger
                    .issue(
                        IssueDraft::new(Severity::Warning, IssueCategory::LockSuperseded, message.clone())
                            .task(&key),
                        self.ports.clock.now(),
                    )
                    .await;
                Err(message)
            }
            Err(err) => {
                self.logger
                    .issue(
                        IssueDraft::new(
                            Severity::Warning,
                            IssueCategory::ReleaseFailed,
                            format!("{key}: finish failed, lock stays until stale: {err}"),
                        )
                        .task(&key)
                        .context(json!({ "code": err.code() })),
                        self.ports.clock.now(),
                    )
                    .await;
                Err(err.to_string())
            }
        }
    }

    async fn note_claim(&self, lease: &TaskLease) {
        let key = lease.key();
        let config = &self.ctx.config;

        if let Some(previous) = lease.reclaimed_from() {
            self.logger
                .issue(
                    IssueDraft::new(
                        Severity::Warning,
                        IssueCategory::StaleLockReclaimed,
                        format!("{key}: reclaimed stale lock taken at {}", previous.to_rfc3339()),
                    )
                    .task(key)
                    .context(json!({
                        "previous_lock_at": previous,
                        "running_stale_seconds": config.running_stale_seconds,
                    })),
                    self.ports.clock.now(),
                )
                .await;
        }

        if lease.last_cursor().is_some() && lease.derivation_version() < config.derivation_version {
            self.logger
                .issue(
                    IssueDraft::new(
                        Severity::Info,
                        IssueCategory::DerivationVersionChanged,
                        format!(
                            "{key}: derivation version {} -> {}, earlier bars may need a backfill",
                            lease.derivation_version(),
                            config.derivation_version
                        ),
                    )
                    .task(key)
                    .context(json!({
                        "stored": lease.derivation_version(),
                        "configured": config.derivation_version,
                    })),
                    self.ports.clock.now(),
                )
                .await;
        }
    }
}
