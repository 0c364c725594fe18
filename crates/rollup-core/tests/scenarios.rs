mod support;

use std::sync::Arc;

use chrono::Duration;
use tokio::sync::Barrier;

use rollup_core::app::EngineConfig;
use rollup_core::domain::{
    AggregationTask, EngineError, ErrorCode, FailureKind, IssueCategory, RunStatus, TaskOutcome,
    TaskResult, TaskStatus,
};
use rollup_core::impls::InMemoryTaskStore;
use rollup_core::ports::{ClaimOutcome, ClaimRequest, FinishRequest, TaskStore};

use support::{Env, Step, key, t0};

fn stale_after() -> Duration {
    Duration::seconds(900)
}

#[tokio::test]
async fn bootstrap_then_resume_from_stored_cursor() {
    let env = Env::new(t0() + Duration::hours(1));
    env.add_task("EURUSD:5m").await;
    env.add_bars("EURUSD", t0(), 15).await;

    let first = env.run(&EngineConfig::default()).await;

    assert_eq!(first.status, RunStatus::Succeeded);
    match &first.tasks[0].result {
        TaskResult::Succeeded {
            start_cursor,
            new_cursor,
            stats,
        } => {
            assert_eq!(*start_cursor, None);
            assert_eq!(*new_cursor, Some(t0() + Duration::minutes(15)));
            assert_eq!(stats.bars_created, 3);
            assert_eq!(stats.windows_processed, 3);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(env.store.derived_bars(&key("EURUSD:5m")).await.len(), 3);

    let task = env.task("EURUSD:5m").await;
    assert_eq!(task.status, TaskStatus::Idle);
    assert_eq!(task.last_cursor, Some(t0() + Duration::minutes(15)));
    assert_eq!(task.lock_token, None);

    env.run(&EngineConfig::default()).await;

    let requests = env.aggregator.requests_for(&key("EURUSD:5m"));
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].start_cursor, t0());
    assert_eq!(requests[1].start_cursor, t0() + Duration::minutes(15));
}

#[tokio::test]
async fn repeated_hard_failures_disable_the_task() {
    let env = Env::new(t0() + Duration::hours(4));
    env.add_task("EURUSD:1h").await;
    env.add_task("XAU:1h").await;
    // XAU has no source bars at all; its bootstrap cursor comes from EURUSD
    env.add_bars("EURUSD", t0(), 180).await;

    for expected_streak in 1..=3u32 {
        let summary = env.run(&EngineConfig::default()).await;
        assert_eq!(summary.status, RunStatus::Succeeded);

        let xau = summary
            .tasks
            .iter()
            .find(|r| r.key == key("XAU:1h"))
            .expect("XAU selected");
        match &xau.result {
            TaskResult::Failed {
                kind,
                code,
                consecutive_hard_failures,
                disabled,
                ..
            } => {
                assert_eq!(*kind, FailureKind::Hard);
                assert_eq!(*code, ErrorCode::MissingSourceData);
                assert_eq!(*consecutive_hard_failures, Some(expected_streak));
                assert_eq!(*disabled, expected_streak == 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    let xau = env.task("XAU:1h").await;
    assert_eq!(xau.status, TaskStatus::Disabled);
    assert_eq!(xau.consecutive_hard_failures, 3);
    assert!(xau.last_error.as_deref().is_some_and(|e| e.contains("missing_source_data")));

    let fourth = env.run(&EngineConfig::default()).await;
    assert_eq!(fourth.tally.tasks_selected, 1);
    assert!(fourth.tasks.iter().all(|r| r.key != key("XAU:1h")));

    let issues = env.log.issues().await;
    let disabled: Vec<_> = issues
        .iter()
        .filter(|i| i.category == IssueCategory::TaskDisabled)
        .collect();
    assert_eq!(disabled.len(), 1);
    assert_eq!(disabled[0].task, Some(key("XAU:1h")));
    assert_eq!(
        issues
            .iter()
            .filter(|i| i.category == IssueCategory::HardFailure)
            .count(),
        3
    );
}

#[tokio::test]
async fn transient_timeout_keeps_cursor_and_streak() {
    let env = Env::new(t0() + Duration::hours(4));
    let mut task = AggregationTask::new(key("GBPUSD:1h"), "prod", 1);
    task.last_cursor = Some(t0());
    task.consecutive_hard_failures = 1;
    env.store.register_task(task).await;
    env.add_bars("GBPUSD", t0(), 180).await;
    env.aggregator.push(
        &key("GBPUSD:1h"),
        Step::Fail(EngineError::aggregator(
            ErrorCode::Timeout,
            "canceling statement due to statement timeout",
        )),
    );

    let first = env.run(&EngineConfig::default()).await;

    assert_eq!(first.tally.transient_failures, 1);
    assert_eq!(first.tally.hard_failures, 0);
    let task = env.task("GBPUSD:1h").await;
    assert_eq!(task.status, TaskStatus::Idle);
    assert_eq!(task.last_cursor, Some(t0()));
    assert_eq!(task.consecutive_hard_failures, 1);
    assert_eq!(task.lock_token, None);

    let second = env.run(&EngineConfig::default()).await;

    assert_eq!(second.tally.tasks_succeeded, 1);
    let requests = env.aggregator.requests_for(&key("GBPUSD:1h"));
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].start_cursor, t0());
    let task = env.task("GBPUSD:1h").await;
    assert_eq!(task.last_cursor, Some(t0() + Duration::hours(3)));
    assert_eq!(task.consecutive_hard_failures, 0);
}

#[tokio::test]
async fn disabling_needs_an_unbroken_streak() {
    let env = Env::new(t0() + Duration::hours(4));
    env.add_task("EURUSD:5m").await;
    env.add_bars("EURUSD", t0(), 60).await;
    let k = key("EURUSD:5m");
    let missing = || {
        Step::Fail(EngineError::aggregator(
            ErrorCode::MissingSourceData,
            "gap in source series",
        ))
    };
    env.aggregator.push(&k, missing());
    env.aggregator.push(&k, missing());
    env.aggregator.push(&k, Step::Fail(EngineError::aggregator(ErrorCode::RateLimited, "busy")));

    let config = EngineConfig::default();
    env.run(&config).await;
    env.run(&config).await;
    assert_eq!(env.task("EURUSD:5m").await.consecutive_hard_failures, 2);

    // transient: streak untouched
    env.run(&config).await;
    assert_eq!(env.task("EURUSD:5m").await.consecutive_hard_failures, 2);

    // nothing scripted: the real aggregator succeeds
    env.run(&config).await;
    let task = env.task("EURUSD:5m").await;
    assert_eq!(task.consecutive_hard_failures, 0);
    assert_eq!(task.last_error, None);

    env.aggregator.push(&k, missing());
    env.aggregator.push(&k, missing());
    env.run(&config).await;
    env.run(&config).await;

    let task = env.task("EURUSD:5m").await;
    assert_eq!(task.consecutive_hard_failures, 2);
    assert_eq!(task.status, TaskStatus::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_exactly_one_winner() {
    let store = InMemoryTaskStore::new();
    store
        .register_task(AggregationTask::new(key("EURUSD:5m"), "prod", 1))
        .await;

    let contenders = 8;
    let barrier = Arc::new(Barrier::new(contenders));
    let mut handles = Vec::new();
    for _ in 0..contenders {
        let store = store.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            store
                .claim(&ClaimRequest {
                    key: key("EURUSD:5m"),
                    now: t0(),
                    stale_after: stale_after(),
                })
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), ClaimOutcome::Claimed(_)) {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn stale_lock_is_reclaimed_only_past_the_threshold() {
    let env = Env::new(t0());
    env.add_task("EURUSD:5m").await;
    env.add_bars("EURUSD", t0() - Duration::hours(1), 60).await;

    // a previous run claimed the task and died
    let ClaimOutcome::Claimed(abandoned) = env
        .store
        .claim(&ClaimRequest {
            key: key("EURUSD:5m"),
            now: t0(),
            stale_after: stale_after(),
        })
        .await
        .unwrap()
    else {
        panic!("first claim must succeed");
    };

    env.clock.set(t0() + Duration::seconds(900));
    let early = env.run(&EngineConfig::default()).await;
    assert_eq!(early.tally.tasks_selected, 0);

    env.clock.set(t0() + Duration::seconds(901));
    let late = env.run(&EngineConfig::default()).await;
    assert_eq!(late.tally.tasks_claimed, 1);
    assert_eq!(late.tally.tasks_succeeded, 1);

    let issues = env.log.issues().await;
    assert!(issues
        .iter()
        .any(|i| i.category == IssueCategory::StaleLockReclaimed && i.task == Some(key("EURUSD:5m"))));

    // the dead owner's finish no longer applies
    let cursor = env.task("EURUSD:5m").await.last_cursor;
    let report = env
        .store
        .finish(&FinishRequest {
            key: key("EURUSD:5m"),
            token: abandoned.token,
            outcome: TaskOutcome::failure(FailureKind::Hard, ErrorCode::Unrecognized, "late"),
            now: t0() + Duration::seconds(902),
            auto_disable_threshold: 3,
            derivation_version: 1,
        })
        .await
        .unwrap();
    assert!(!report.applied);
    let task = env.task("EURUSD:5m").await;
    assert_eq!(task.last_cursor, cursor);
    assert_eq!(task.consecutive_hard_failures, 0);
}

#[tokio::test]
async fn rerun_without_new_data_changes_nothing() {
    let env = Env::new(t0() + Duration::hours(2));
    env.add_task("EURUSD:1h").await;
    env.add_bars("EURUSD", t0(), 120).await;

    let first = env.run(&EngineConfig::default()).await;
    assert_eq!(first.tally.bars.bars_created, 2);
    let after_first = env.task("EURUSD:1h").await.last_cursor;
    let bars_first = env.store.derived_bars(&key("EURUSD:1h")).await;

    let second = env.run(&EngineConfig::default()).await;

    assert_eq!(second.tally.tasks_succeeded, 1);
    assert!(second.tally.bars.is_empty());
    assert_eq!(env.task("EURUSD:1h").await.last_cursor, after_first);
    assert_eq!(env.store.derived_bars(&key("EURUSD:1h")).await, bars_first);
}

#[tokio::test]
async fn caps_bound_tasks_per_run_and_windows_per_task() {
    let env = Env::new(t0() + Duration::days(1));
    for i in 0..25 {
        env.add_task(&format!("SYM{i:02}:5m")).await;
    }
    env.add_bars("SYM00", t0(), 24 * 60).await;

    let config = EngineConfig {
        max_tasks_per_run: 20,
        max_windows_per_task: 10,
        ..EngineConfig::default()
    };
    let summary = env.run(&config).await;

    assert_eq!(summary.tally.tasks_selected, 20);
    assert_eq!(summary.tally.tasks_claimed, 20);
    let untouched = env
        .store
        .list_tasks(Some("prod"))
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.last_attempt_at.is_none())
        .count();
    assert_eq!(untouched, 5);

    let sym = env.task("SYM00:5m").await;
    assert_eq!(sym.last_cursor, Some(t0() + Duration::minutes(50)));
    assert_eq!(env.store.derived_bars(&key("SYM00:5m")).await.len(), 10);
}

#[tokio::test]
async fn aggregator_contract_violations_are_hard_failures() {
    let env = Env::new(t0() + Duration::hours(2));
    let mut task = AggregationTask::new(key("EURUSD:5m"), "prod", 1);
    task.last_cursor = Some(t0());
    env.store.register_task(task).await;
    env.add_bars("EURUSD", t0(), 60).await;
    let k = key("EURUSD:5m");
    env.aggregator.push(&k, Step::Rewind);
    env.aggregator.push(&k, Step::Overrun);

    for streak in 1..=2u32 {
        let summary = env.run(&EngineConfig::default()).await;
        match &summary.tasks[0].result {
            TaskResult::Failed {
                kind,
                code,
                consecutive_hard_failures,
                ..
            } => {
                assert_eq!(*kind, FailureKind::Hard);
                assert_eq!(*code, ErrorCode::ContractViolation);
                assert_eq!(*consecutive_hard_failures, Some(streak));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(env.task("EURUSD:5m").await.last_cursor, Some(t0()));
    }

    // bars written during the rejected calls are skipped, not rebuilt
    let summary = env.run(&EngineConfig::default()).await;
    assert_eq!(summary.tally.bars.bars_created, 0);
    assert_eq!(summary.tally.bars.bars_skipped, 12);
    assert_eq!(env.task("EURUSD:5m").await.last_cursor, Some(t0() + Duration::hours(1)));
}

#[tokio::test]
async fn derivation_version_bump_is_reported_and_stamped() {
    let env = Env::new(t0() + Duration::hours(2));
    let mut task = AggregationTask::new(key("EURUSD:1h"), "prod", 1);
    task.last_cursor = Some(t0());
    env.store.register_task(task).await;
    env.add_bars("EURUSD", t0(), 120).await;

    let config = EngineConfig {
        derivation_version: 2,
        ..EngineConfig::default()
    };
    env.run(&config).await;

    assert_eq!(env.task("EURUSD:1h").await.derivation_version, 2);
    assert!(env
        .store
        .derived_bars(&key("EURUSD:1h"))
        .await
        .iter()
        .all(|b| b.derivation_version == 2));
    let changed = env
        .log
        .issues()
        .await
        .into_iter()
        .filter(|i| i.category == IssueCategory::DerivationVersionChanged)
        .count();
    assert_eq!(changed, 1);

    // stored version now matches: no second report
    env.run(&config).await;
    let changed = env
        .log
        .issues()
        .await
        .into_iter()
        .filter(|i| i.category == IssueCategory::DerivationVersionChanged)
        .count();
    assert_eq!(changed, 1);
}
