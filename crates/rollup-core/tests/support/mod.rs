//! Shared harness for the integration scenarios.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use rollup_core::app::{EngineConfig, Ports, RetryPolicy, RunOrchestrator};
use rollup_core::domain::{AggregationTask, EngineError, RunSummary, SourceBar, TaskKey, Trigger};
use rollup_core::impls::{InMemoryRunLog, InMemoryTaskStore};
use rollup_core::ports::{
    AggregateRequest, AggregateResult, ClaimOutcome, ClaimRequest, FinishReport, FinishRequest,
    FixedClock, SelectQuery, TaskRef, TaskStore, UlidGenerator, WindowAggregator,
};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
}

pub fn key(s: &str) -> TaskKey {
    s.parse().unwrap()
}

pub fn minute_bars(symbol: &str, from: DateTime<Utc>, n: i64) -> Vec<SourceBar> {
    (0..n)
        .map(|i| SourceBar {
            symbol: symbol.to_string(),
            ts: from + Duration::minutes(i),
            open: 100.0 + i as f64,
            high: 101.0 + i as f64,
            low: 99.0 + i as f64,
            close: 100.5 + i as f64,
            volume: 1.0,
        })
        .collect()
}

/// One scripted deviation from the real aggregator.
pub enum Step {
    Fail(EngineError),
    /// Report a cursor one window before the start.
    Rewind,
    /// Report one window more than allowed.
    Overrun,
    /// Advance the clock by this much before aggregating.
    Slow(Duration),
}

/// Delegates to the in-memory aggregator unless a step is queued for the key.
pub struct ScriptedAggregator {
    inner: InMemoryTaskStore,
    clock: Arc<FixedClock>,
    script: Mutex<HashMap<TaskKey, VecDeque<Step>>>,
    requests: Mutex<Vec<AggregateRequest>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedAggregator {
    pub fn new(inner: InMemoryTaskStore, clock: Arc<FixedClock>) -> Self {
        Self {
            inner,
            clock,
            script: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Most aggregations observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn push(&self, key: &TaskKey, step: Step) {
        self.script
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push_back(step);
    }

    pub fn requests_for(&self, key: &TaskKey) -> Vec<AggregateRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| &r.key == key)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl WindowAggregator for ScriptedAggregator {
    async fn aggregate_range(
        &self,
        request: &AggregateRequest,
    ) -> Result<AggregateResult, EngineError> {
        self.requests.lock().unwrap().push(request.clone());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        // give sibling tasks a chance to overlap
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        let result = self.scripted(request).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl ScriptedAggregator {
    async fn scripted(&self, request: &AggregateRequest) -> Result<AggregateResult, EngineError> {
        let step = self
            .script
            .lock()
            .unwrap()
            .get_mut(&request.key)
            .and_then(|q| q.pop_front());

        match step {
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Rewind) => {
                let mut result = self.inner.aggregate_range(request).await?;
                result.new_cursor = request.start_cursor - request.key.timeframe.duration();
                Ok(result)
            }
            Some(Step::Overrun) => {
                let mut result = self.inner.aggregate_range(request).await?;
                result.stats.windows_processed = request.max_windows + 1;
                Ok(result)
            }
            Some(Step::Slow(by)) => {
                self.clock.advance(by);
                self.inner.aggregate_range(request).await
            }
            None => self.inner.aggregate_range(request).await,
        }
    }
}

/// How the next `finish` for a key misbehaves.
pub enum FinishFault {
    /// Another owner reclaims the lock just before the finish lands.
    Superseded,
    Error(EngineError),
}

/// `TaskStore` over the in-memory store with injectable failures.
pub struct FaultyStore {
    inner: InMemoryTaskStore,
    select_errors: Mutex<VecDeque<EngineError>>,
    select_calls: AtomicU32,
    finish_faults: Mutex<HashMap<TaskKey, FinishFault>>,
}

impl FaultyStore {
    pub fn new(inner: InMemoryTaskStore) -> Self {
        Self {
            inner,
            select_errors: Mutex::new(VecDeque::new()),
            select_calls: AtomicU32::new(0),
            finish_faults: Mutex::new(HashMap::new()),
        }
    }

    /// Queue an error for the next `select_due_tasks` call.
    pub fn fail_select(&self, err: EngineError) {
        self.select_errors.lock().unwrap().push_back(err);
    }

    pub fn select_calls(&self) -> u32 {
        self.select_calls.load(Ordering::SeqCst)
    }

    pub fn fail_finish(&self, key: &TaskKey, fault: FinishFault) {
        self.finish_faults.lock().unwrap().insert(key.clone(), fault);
    }
}

#[async_trait]
impl TaskStore for FaultyStore {
    async fn select_due_tasks(&self, query: &SelectQuery) -> Result<Vec<TaskRef>, EngineError> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        let queued = self.select_errors.lock().unwrap().pop_front();
        match queued {
            Some(err) => Err(err),
            None => self.inner.select_due_tasks(query).await,
        }
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<ClaimOutcome, EngineError> {
        self.inner.claim(request).await
    }

    async fn bootstrap_cursor(
        &self,
        key: &TaskKey,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        self.inner.bootstrap_cursor(key, now).await
    }

    async fn finish(&self, request: &FinishRequest) -> Result<FinishReport, EngineError> {
        let fault = self.finish_faults.lock().unwrap().remove(&request.key);
        match fault {
            Some(FinishFault::Error(err)) => Err(err),
            Some(FinishFault::Superseded) => {
                let takeover = ClaimRequest {
                    key: request.key.clone(),
                    now: request.now + Duration::hours(1),
                    stale_after: Duration::zero(),
                };
                self.inner.claim(&takeover).await?;
                self.inner.finish(request).await
            }
            None => self.inner.finish(request).await,
        }
    }

    async fn list_tasks(
        &self,
        environment: Option<&str>,
    ) -> Result<Vec<AggregationTask>, EngineError> {
        self.inner.list_tasks(environment).await
    }

    async fn set_paused(&self, symbol: &str, paused: bool) -> Result<usize, EngineError> {
        self.inner.set_paused(symbol, paused).await
    }

    async fn reactivate(&self, key: &TaskKey) -> Result<bool, EngineError> {
        self.inner.reactivate(key).await
    }
}

pub struct Env {
    pub store: InMemoryTaskStore,
    pub log: InMemoryRunLog,
    pub clock: Arc<FixedClock>,
    pub aggregator: Arc<ScriptedAggregator>,
    pub faults: Arc<FaultyStore>,
    pub orchestrator: RunOrchestrator,
}

impl Env {
    pub fn new(now: DateTime<Utc>) -> Self {
        let store = InMemoryTaskStore::new();
        let log = InMemoryRunLog::new();
        let clock = Arc::new(FixedClock::new(now));
        let aggregator = Arc::new(ScriptedAggregator::new(store.clone(), clock.clone()));
        let faults = Arc::new(FaultyStore::new(store.clone()));

        let ports = Ports {
            store: faults.clone(),
            aggregator: aggregator.clone(),
            run_log: Arc::new(log.clone()),
            clock: clock.clone(),
            ids: Arc::new(UlidGenerator::new(clock.clone())),
        };
        let orchestrator = RunOrchestrator::new(ports).with_selection_retry(RetryPolicy::none());

        Self {
            store,
            log,
            clock,
            aggregator,
            faults,
            orchestrator,
        }
    }

    /// Same ports, different selection retry policy.
    pub fn orchestrator_with_retry(&self, retry: RetryPolicy) -> RunOrchestrator {
        RunOrchestrator::new(self.orchestrator.ports().clone()).with_selection_retry(retry)
    }

    pub async fn add_task(&self, k: &str) {
        self.store
            .register_task(AggregationTask::new(key(k), "prod", 1))
            .await;
    }

    pub async fn add_bars(&self, symbol: &str, from: DateTime<Utc>, n: i64) {
        self.store.insert_source_bars(minute_bars(symbol, from, n)).await;
    }

    pub async fn task(&self, k: &str) -> AggregationTask {
        self.store.task(&key(k)).await.unwrap()
    }

    pub async fn run(&self, config: &EngineConfig) -> RunSummary {
        self.orchestrator.run(config, Trigger::Schedule).await
    }
}
