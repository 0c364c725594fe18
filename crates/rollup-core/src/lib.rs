//! rollup-core
//!
//! Incremental timeframe aggregation engine: derives 5m / 1h / 1d bars from
//! 1m source bars, one bounded batch of windows per task per run.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, timeframe, task, bar, outcome, decision, run, issue, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, WindowAggregator, RunLog, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（config, orchestrator, scheduler, operator, status）
//! - **impls**: 実装（InMemoryTaskStore, InMemoryRunLog など開発・テスト用）
//!
//! すべての調整状態は store 側にあり、プロセス内には何も持ち越しません。
//! run が途中で死んでも、claim 済みタスクの lock は stale になった時点で次の run が回収します。

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
