//! Scheduler - 定期トリガー
//!
//! `interval` ごとに orchestrator を回します。設定は tick ごとに読み直し、
//! 前の run が interval を超えた場合、取りこぼした tick は捨てます。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::config::{ConfigError, EngineConfig};
use super::orchestrator::RunOrchestrator;
use crate::domain::{RunStatus, Trigger};

/// Scheduled trigger handle.
/// - `request_shutdown()` で次の tick を止める（実行中の run は最後まで走る）
/// - `join()` / `shutdown_and_join()` で実行した run の数が返る
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<u64>,
}

impl Scheduler {
    /// Runs the orchestrator every `interval`, first tick immediately.
    /// The config is reloaded through `load_config` on every tick.
    /// `max_ticks = None` runs until shutdown.
    pub fn spawn<F>(
        orchestrator: Arc<RunOrchestrator>,
        interval: Duration,
        max_ticks: Option<u64>,
        load_config: F,
    ) -> Self
    where
        F: Fn() -> Result<EngineConfig, ConfigError> + Send + Sync + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            schedule_loop(orchestrator, interval, max_ticks, load_config, &mut shutdown_rx).await
        });
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits for the loop to end on its own (`max_ticks` reached).
    pub async fn join(self) -> u64 {
        match self.join.await {
            Ok(runs) => runs,
            Err(err) => {
                error!(%err, "scheduler loop panicked");
                0
            }
        }
    }

    pub async fn shutdown_and_join(self) -> u64 {
        self.request_shutdown();
        self.join().await
    }
}

async fn schedule_loop<F>(
    orchestrator: Arc<RunOrchestrator>,
    interval: Duration,
    max_ticks: Option<u64>,
    load_config: F,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> u64
where
    F: Fn() -> Result<EngineConfig, ConfigError>,
{
    let mut ticker = tokio::time::interval(interval);
    // a run that overruns the interval swallows the missed ticks
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut ticks = 0u64;
    let mut runs = 0u64;
    loop {
        if *shutdown_rx.borrow() || max_ticks.is_some_and(|max| ticks >= max) {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    // sender dropped: nobody can stop us any more, treat as shutdown
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }
        ticks += 1;

        let config = match load_config() {
            Ok(config) => config,
            Err(err) => {
                error!(%err, "invalid configuration, skipping scheduled run");
                continue;
            }
        };

        let summary = orchestrator.run(&config, Trigger::Schedule).await;
        runs += 1;
        if summary.status == RunStatus::Failed {
            error!(run_id = %summary.run_id, error = ?summary.error, "scheduled run failed");
        }
    }

    info!(ticks, runs, "scheduler stopped");
    runs
}
