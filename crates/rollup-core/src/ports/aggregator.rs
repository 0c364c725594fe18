//! WindowAggregator port - source bar から上位足を計算する純粋関数
//!
//! engine から見ると store 側の手続き（`aggregate_range`）です。
//! 同じ入力に対しては同じ結果を返し、既存の derived bar は上書きしません。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AggregateStats, EngineError, TaskKey};

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRequest {
    pub key: TaskKey,

    /// Start of the first window to build. Must be aligned to `key.timeframe`.
    pub start_cursor: DateTime<Utc>,
    pub max_windows: u32,
    pub now: DateTime<Utc>,
    pub derivation_version: u32,

    /// Allow windows whose source range is incomplete.
    pub force_incomplete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub stats: AggregateStats,

    /// Start of the next unprocessed window (`start_cursor` when nothing moved).
    pub new_cursor: DateTime<Utc>,
}

#[async_trait]
pub trait WindowAggregator: Send + Sync {
    /// Processes at most `max_windows` consecutive windows from `start_cursor`.
    async fn aggregate_range(&self, request: &AggregateRequest) -> Result<AggregateResult, EngineError>;
}
