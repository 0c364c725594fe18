//! Impls - 開発・テスト用の実装
//!
//! 本番の store（SQL の手続き群）はこのクレートの外にあります。
//! ここにあるのは全 port の in-memory 実装で、CLI とテストから使います。

pub mod memory_run_log;
pub mod memory_store;
pub mod window;

pub use self::memory_run_log::{InMemoryRunLog, RunLogSnapshot};
pub use self::memory_store::{InMemoryTaskStore, StoreSnapshot};
pub use self::window::{QualityPolicy, WindowVerdict};
