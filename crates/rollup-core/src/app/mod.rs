//! App - アプリケーションロジック
//!
//! - **config**: 環境変数からの設定読み込み
//! - **selector / lock / bootstrap**: store 操作の薄いラッパ
//! - **orchestrator**: 1 回の invocation（run）
//! - **scheduler**: 定期実行
//! - **operator / status**: run の外から使う運用操作と状態レポート

pub mod bootstrap;
pub mod classify;
pub mod config;
pub mod context;
pub mod lock;
pub mod operator;
pub mod orchestrator;
pub mod retry;
pub mod run_logger;
pub mod scheduler;
pub mod selector;
pub mod status;

pub use self::bootstrap::CursorBootstrapper;
pub use self::classify::Classifier;
pub use self::config::{ConfigError, EngineConfig};
pub use self::context::RunContext;
pub use self::lock::{Claim, LockManager, TaskLease};
pub use self::operator::{Operator, OrphanedState};
pub use self::orchestrator::{Ports, RunOrchestrator};
pub use self::retry::RetryPolicy;
pub use self::run_logger::{IssueDraft, RunLogger};
pub use self::scheduler::Scheduler;
pub use self::selector::TaskSelector;
pub use self::status::{HealthReport, TaskCounts, TimeframeLag};
