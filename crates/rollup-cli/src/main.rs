//! rollup - operate the aggregation engine against a local state file.
//!
//! - `rollup seed` でタスクと 1m バーを投入
//! - `rollup run` で 1 回だけ手動実行（失敗した run は exit code 1）
//! - `rollup schedule` で定期実行
//! - `rollup status / pause / resume / reactivate / audit` は運用操作
//!
//! 設定は環境変数（`AGG_*`、`.env` も読む）から。

mod state;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use rollup_core::app::{EngineConfig, HealthReport, Operator, Ports, RunOrchestrator, Scheduler};
use rollup_core::domain::{AggregationTask, RunStatus, TaskKey, Trigger};
use rollup_core::ports::{Clock, SystemClock};

use crate::state::Workspace;

#[derive(Debug, Parser)]
#[command(name = "rollup", version, about = "Incremental timeframe aggregation")]
struct Cli {
    /// State file shared between invocations.
    #[arg(long, env = "ROLLUP_STATE", default_value = "rollup-state.json")]
    state: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, env = "ROLLUP_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one invocation now and print its summary.
    Run,
    /// Run on the configured interval until Ctrl-C (or `--ticks` runs).
    Schedule {
        #[arg(long)]
        ticks: Option<u64>,
    },
    /// Task counts and cursor lag per timeframe.
    Status,
    /// Pause every timeframe of the given symbols.
    Pause {
        #[arg(required = true)]
        symbols: Vec<String>,
    },
    Resume {
        #[arg(required = true)]
        symbols: Vec<String>,
    },
    /// Move a disabled task back to idle.
    Reactivate { task: TaskKey },
    /// Report disabled tasks that still hold cursor or lock state.
    Audit,
    /// Register tasks (SYMBOL:TF) and load 1m bars from a JSON-lines file.
    Seed {
        tasks: Vec<TaskKey>,
        #[arg(long)]
        bars: Option<PathBuf>,
    },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries the command output
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = EngineConfig::from_env().context("loading AGG_* configuration")?;
    let workspace = Workspace::load(&cli.state)?;
    let ports = Ports::in_memory(
        workspace.store.clone(),
        workspace.run_log.clone(),
        Arc::new(SystemClock),
    );

    let code = execute(cli.command, &config, &workspace, ports).await?;
    workspace.save().await?;
    Ok(code)
}

async fn execute(
    command: Command,
    config: &EngineConfig,
    workspace: &Workspace,
    ports: Ports,
) -> Result<ExitCode> {
    let operator = Operator::new(ports.clone());

    match command {
        Command::Run => {
            let summary = RunOrchestrator::new(ports).run(config, Trigger::Manual).await;
            print_json(&summary)?;
            if summary.status == RunStatus::Failed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Schedule { ticks } => {
            let orchestrator = Arc::new(RunOrchestrator::new(ports));
            let scheduler =
                Scheduler::spawn(orchestrator, config.schedule_interval, ticks, EngineConfig::from_env);
            let runs = match ticks {
                Some(_) => scheduler.join().await,
                None => {
                    tokio::signal::ctrl_c().await?;
                    info!("shutdown requested");
                    scheduler.shutdown_and_join().await
                }
            };
            info!(runs, "scheduler finished");
        }
        Command::Status => {
            let report = HealthReport::collect(
                ports.store.as_ref(),
                &config.environment,
                ports.clock.now(),
                config.stale_after(),
            )
            .await?;
            print_json(&report)?;
        }
        Command::Pause { symbols } => {
            for symbol in symbols {
                let touched = operator.pause(&symbol).await?;
                println!("{symbol}: paused {touched} task(s)");
            }
        }
        Command::Resume { symbols } => {
            for symbol in symbols {
                let touched = operator.resume(&symbol).await?;
                println!("{symbol}: resumed {touched} task(s)");
            }
        }
        Command::Reactivate { task } => {
            if operator.reactivate(&task).await? {
                println!("{task}: reactivated");
            } else {
                println!("{task}: not disabled, nothing to do");
            }
        }
        Command::Audit => {
            let orphaned = operator.audit_disabled(Some(&config.environment)).await?;
            print_json(&orphaned)?;
        }
        Command::Seed { tasks, bars } => {
            for key in tasks {
                let task = AggregationTask::new(
                    key.clone(),
                    &config.environment,
                    config.derivation_version,
                );
                if workspace.store.register_task(task).await {
                    println!("{key}: registered");
                } else {
                    println!("{key}: already present");
                }
            }
            if let Some(path) = bars {
                let bars = state::read_bars(&path)?;
                let inserted = workspace.store.insert_source_bars(bars).await;
                println!("{}: inserted {inserted} bar(s)", path.display());
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollup_core::domain::Timeframe;

    #[test]
    fn parses_seed_with_task_keys() {
        let cli = Cli::parse_from([
            "rollup",
            "--state",
            "/tmp/s.json",
            "seed",
            "EURUSD:5m",
            "XAU:1h",
            "--bars",
            "bars.jsonl",
        ]);
        assert_eq!(cli.state, PathBuf::from("/tmp/s.json"));
        match cli.command {
            Command::Seed { tasks, bars } => {
                assert_eq!(
                    tasks,
                    vec![
                        TaskKey::new("EURUSD", Timeframe::M5),
                        TaskKey::new("XAU", Timeframe::H1),
                    ]
                );
                assert_eq!(bars, Some(PathBuf::from("bars.jsonl")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_task_key() {
        assert!(Cli::try_parse_from(["rollup", "reactivate", "EURUSD"]).is_err());
        assert!(Cli::try_parse_from(["rollup", "pause"]).is_err());
    }
}
