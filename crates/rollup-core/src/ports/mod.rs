//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（タスク状態の store、集計手続き、run log）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - store が source of truth（正本）。プロセス内に状態を持ち越さない
//! - 集計の算術は store 側の手続き。engine は結果の契約だけを検証する
//! - run log は best-effort

pub mod aggregator;
pub mod clock;
pub mod id_generator;
pub mod run_log;
pub mod task_store;

pub use self::aggregator::{AggregateRequest, AggregateResult, WindowAggregator};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::run_log::{LogError, RunLog};
pub use self::task_store::{
    ClaimGrant, ClaimOutcome, ClaimRequest, FinishReport, FinishRequest, NotClaimedReason,
    SelectQuery, TaskRef, TaskStore,
};
