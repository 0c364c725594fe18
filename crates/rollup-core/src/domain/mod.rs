//! Domain model (IDs, timeframes, tasks, bars, outcomes, run and issue records).
//!
//! このレイヤーは store の技術に依存しません。
//! 状態遷移はすべて型のメソッド経由で行い、ports/app からフィールドを直接書き換えない。

pub mod bar;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod issue;
pub mod outcome;
pub mod run;
pub mod task;
pub mod timeframe;

pub use bar::{DerivedBar, SourceBar};
pub use decision::{Decision, DisablePolicy};
pub use errors::{EngineError, ErrorCode, ErrorOrigin, FailureKind};
pub use ids::{IssueId, LockToken, RunId};
pub use issue::{IssueCategory, IssueRecord, Severity};
pub use outcome::{AggregateStats, TaskOutcome};
pub use run::{Checkpoint, RunRecord, RunStatus, RunSummary, RunTally, TaskReport, TaskResult, Trigger};
pub use task::{AggregationTask, ParseTaskKeyError, TaskKey, TaskStatus};
pub use timeframe::{ParseTimeframeError, Timeframe};
