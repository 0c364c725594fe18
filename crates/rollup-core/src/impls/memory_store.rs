//! In-memory TaskStore + WindowAggregator.
//!
//! Single `tokio::sync::Mutex` over the whole state: every port operation
//! takes the lock once, so select / claim / finish / aggregate are each
//! atomic with respect to one another. The lock is never held across an
//! `.await` of anything but itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::window::{QualityPolicy, WindowVerdict};
use crate::domain::{
    AggregateStats, AggregationTask, DerivedBar, DisablePolicy, EngineError, ErrorCode, LockToken,
    SourceBar, TaskKey, TaskOutcome, TaskStatus, Timeframe,
};
use crate::ports::{
    AggregateRequest, AggregateResult, ClaimGrant, ClaimOutcome, ClaimRequest, FinishReport,
    FinishRequest, NotClaimedReason, SelectQuery, TaskRef, TaskStore, WindowAggregator,
};

type DerivedKey = (String, Timeframe, DateTime<Utc>);

/// In-memory store state.
#[derive(Default)]
struct StoreState {
    /// Task records (single source of truth for cursors and locks).
    tasks: BTreeMap<TaskKey, AggregationTask>,

    /// 1m source series per symbol, keyed by bar timestamp.
    source: BTreeMap<String, BTreeMap<DateTime<Utc>, SourceBar>>,

    /// Derived bars, unique by (symbol, timeframe, window_start).
    derived: BTreeMap<DerivedKey, DerivedBar>,
}

impl StoreState {
    fn select(&self, query: &SelectQuery) -> Vec<TaskRef> {
        let mut due: Vec<&AggregationTask> = self
            .tasks
            .values()
            .filter(|t| t.environment == query.environment)
            .filter(|t| t.is_eligible(query.now, query.stale_after))
            .collect();

        // None < Some: never-processed tasks come first
        due.sort_by(|a, b| (a.last_cursor, &a.key).cmp(&(b.last_cursor, &b.key)));

        due.into_iter()
            .take(query.limit)
            .map(|t| TaskRef {
                key: t.key.clone(),
                status: t.status,
                last_cursor: t.last_cursor,
            })
            .collect()
    }

    fn claim(&mut self, request: &ClaimRequest) -> ClaimOutcome {
        let Some(task) = self.tasks.get_mut(&request.key) else {
            return ClaimOutcome::NotClaimed(NotClaimedReason::Missing);
        };

        if task.status == TaskStatus::Disabled {
            return ClaimOutcome::NotClaimed(NotClaimedReason::Disabled);
        }
        if task.paused {
            return ClaimOutcome::NotClaimed(NotClaimedReason::Paused);
        }

        let reclaimed_from = match task.status {
            TaskStatus::Running if !task.is_stale(request.now, request.stale_after) => {
                return ClaimOutcome::NotClaimed(NotClaimedReason::HeldByOther {
                    since: task.lock_acquired_at,
                });
            }
            TaskStatus::Running => Some(task.lock_acquired_at.unwrap_or(request.now)),
            _ => None,
        };

        let token = LockToken::generate();
        task.start_claim(request.now, token);
        debug!(task = %task.key, %token, reclaimed = reclaimed_from.is_some(), "claimed");

        ClaimOutcome::Claimed(ClaimGrant {
            key: task.key.clone(),
            token,
            last_cursor: task.last_cursor,
            derivation_version: task.derivation_version,
            reclaimed_from,
        })
    }

    fn bootstrap(&self, key: &TaskKey, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let environment = self.tasks.get(key).map(|t| t.environment.as_str());

        self.tasks
            .values()
            .filter(|t| t.key.timeframe == key.timeframe)
            .filter(|t| environment.is_none_or(|env| t.environment == env))
            .filter_map(|t| self.source.get(&t.key.symbol))
            .filter_map(|series| series.range(..=now).next().map(|(ts, _)| *ts))
            .min()
            .map(|earliest| key.timeframe.floor(earliest))
    }

    fn finish(&mut self, request: &FinishRequest) -> Result<FinishReport, EngineError> {
        let Some(task) = self.tasks.get_mut(&request.key) else {
            return Err(EngineError::store(
                ErrorCode::NotFound,
                format!("task {} does not exist", request.key),
            ));
        };

        if !task.holds_lock(request.token) {
            debug!(task = %task.key, token = %request.token, "finish ignored: lock superseded");
            return Ok(FinishReport {
                applied: false,
                status: task.status,
                consecutive_hard_failures: task.consecutive_hard_failures,
                disabled_now: false,
            });
        }

        let mut disabled_now = false;
        match &request.outcome {
            TaskOutcome::Success { new_cursor, .. } => {
                task.mark_succeeded(request.now, *new_cursor, request.derivation_version);
            }
            TaskOutcome::Failure { kind, code, error } => {
                let decision = DisablePolicy::new(request.auto_disable_threshold)
                    .decide(task.consecutive_hard_failures, Some(*kind));
                task.mark_failed(format!("[{code}] {error}"), decision.streak(), decision.disables());
                disabled_now = decision.disables();
            }
        }

        Ok(FinishReport {
            applied: true,
            status: task.status,
            consecutive_hard_failures: task.consecutive_hard_failures,
            disabled_now,
        })
    }

    fn aggregate(
        &mut self,
        request: &AggregateRequest,
        policy: &QualityPolicy,
    ) -> Result<AggregateResult, EngineError> {
        let key = &request.key;
        let tf = key.timeframe;

        if !tf.is_derived() {
            return Err(EngineError::aggregator(
                ErrorCode::SchemaMismatch,
                format!("{tf} is a source timeframe and cannot be derived"),
            ));
        }
        if !tf.is_aligned(request.start_cursor) {
            return Err(EngineError::aggregator(
                ErrorCode::InvalidCursor,
                format!(
                    "cursor {} is not aligned to {tf}",
                    request.start_cursor.to_rfc3339()
                ),
            ));
        }

        let series = match self.source.get(&key.symbol) {
            Some(series) if !series.is_empty() => series,
            _ => {
                return Err(EngineError::aggregator(
                    ErrorCode::MissingSourceData,
                    format!("no 1m source bars for {}", key.symbol),
                ));
            }
        };

        // exclusive upper bound of ingested data
        let watermark = series
            .keys()
            .next_back()
            .map(|last| *last + tf.source().duration())
            .unwrap_or(request.start_cursor);

        let mut stats = AggregateStats::default();
        let mut cursor = request.start_cursor;
        let mut built = Vec::new();

        while stats.windows_processed < request.max_windows {
            let end = cursor + tf.duration();
            if end > request.now || (end > watermark && !request.force_incomplete) {
                break;
            }

            stats.windows_processed += 1;

            let derived_key = (key.symbol.clone(), tf, cursor);
            if self.derived.contains_key(&derived_key) {
                stats.bars_skipped += 1;
            } else {
                let bars: Vec<&SourceBar> = series.range(cursor..end).map(|(_, bar)| bar).collect();
                match policy.judge(
                    key,
                    cursor,
                    &bars,
                    request.derivation_version,
                    request.force_incomplete,
                ) {
                    WindowVerdict::Build(bar) => {
                        stats.bars_created += 1;
                        if bar.is_low_quality() {
                            stats.bars_low_quality += 1;
                        }
                        built.push((derived_key, bar));
                    }
                    WindowVerdict::Skip => stats.bars_skipped += 1,
                }
            }

            cursor = end;
        }

        self.derived.extend(built);

        Ok(AggregateResult {
            stats,
            new_cursor: cursor,
        })
    }
}

/// Serializable copy of the whole store, used by the CLI state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub tasks: Vec<AggregationTask>,
    #[serde(default)]
    pub source_bars: Vec<SourceBar>,
    #[serde(default)]
    pub derived_bars: Vec<DerivedBar>,
}

/// In-memory implementation of both store-side ports.
#[derive(Clone)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<StoreState>>,
    policy: QualityPolicy,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            policy: QualityPolicy::default(),
        }
    }

    pub fn with_quality_policy(mut self, policy: QualityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Adds a task. Returns `false` (and changes nothing) if the key exists.
    pub async fn register_task(&self, task: AggregationTask) -> bool {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.key) {
            return false;
        }
        state.tasks.insert(task.key.clone(), task);
        true
    }

    /// Ingestion stand-in. A bar at an existing timestamp replaces the old one.
    pub async fn insert_source_bars(&self, bars: impl IntoIterator<Item = SourceBar>) -> usize {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for bar in bars {
            state
                .source
                .entry(bar.symbol.clone())
                .or_default()
                .insert(bar.ts, bar);
            inserted += 1;
        }
        inserted
    }

    pub async fn task(&self, key: &TaskKey) -> Option<AggregationTask> {
        self.state.lock().await.tasks.get(key).cloned()
    }

    /// Derived bars of one task in window order.
    pub async fn derived_bars(&self, key: &TaskKey) -> Vec<DerivedBar> {
        self.state
            .lock()
            .await
            .derived
            .values()
            .filter(|bar| bar.symbol == key.symbol && bar.timeframe == key.timeframe)
            .cloned()
            .collect()
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.lock().await;
        StoreSnapshot {
            tasks: state.tasks.values().cloned().collect(),
            source_bars: state
                .source
                .values()
                .flat_map(|series| series.values().cloned())
                .collect(),
            derived_bars: state.derived.values().cloned().collect(),
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut state = StoreState::default();
        for task in snapshot.tasks {
            state.tasks.insert(task.key.clone(), task);
        }
        for bar in snapshot.source_bars {
            state
                .source
                .entry(bar.symbol.clone())
                .or_default()
                .insert(bar.ts, bar);
        }
        for bar in snapshot.derived_bars {
            state
                .derived
                .insert((bar.symbol.clone(), bar.timeframe, bar.window_start), bar);
        }
        Self {
            state: Arc::new(Mutex::new(state)),
            policy: QualityPolicy::default(),
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn select_due_tasks(&self, query: &SelectQuery) -> Result<Vec<TaskRef>, EngineError> {
        Ok(self.state.lock().await.select(query))
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<ClaimOutcome, EngineError> {
        Ok(self.state.lock().await.claim(request))
    }

    async fn bootstrap_cursor(
        &self,
        key: &TaskKey,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        Ok(self.state.lock().await.bootstrap(key, now))
    }

    async fn finish(&self, request: &FinishRequest) -> Result<FinishReport, EngineError> {
        self.state.lock().await.finish(request)
    }

    async fn list_tasks(
        &self,
        environment: Option<&str>,
    ) -> Result<Vec<AggregationTask>, EngineError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| environment.is_none_or(|env| t.environment == env))
            .cloned()
            .collect())
    }

    async fn set_paused(&self, symbol: &str, paused: bool) -> Result<usize, EngineError> {
        let mut state = self.state.lock().await;
        let mut touched = 0;
        for task in state.tasks.values_mut().filter(|t| t.key.symbol == symbol) {
            task.paused = paused;
            touched += 1;
        }
        Ok(touched)
    }

    async fn reactivate(&self, key: &TaskKey) -> Result<bool, EngineError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(key) else {
            return Err(EngineError::store(
                ErrorCode::NotFound,
                format!("task {key} does not exist"),
            ));
        };
        if task.status != TaskStatus::Disabled {
            return Ok(false);
        }
        task.reactivate();
        Ok(true)
    }
}

#[async_trait]
impl WindowAggregator for InMemoryTaskStore {
    async fn aggregate_range(&self, request: &AggregateRequest) -> Result<AggregateResult, EngineError> {
        self.state.lock().await.aggregate(request, &self.policy)
    }
}
