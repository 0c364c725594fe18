//! Cursor bootstrapper: the starting point of a never-processed task.
//!
//! すべての symbol が同じ起点（unified start）から始まるようにします。
//! 1. 設定の `unified_start` があればそれを timeframe 境界に切り下げて使う
//! 2. なければ store に聞く（同じ timeframe のタスクを持つ全 symbol の最古の 1m bar）
//!
//! source data には触れません。

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::{EngineError, TaskKey};
use crate::ports::TaskStore;

pub struct CursorBootstrapper {
    store: Arc<dyn TaskStore>,
    unified_start: Option<DateTime<Utc>>,
}

impl CursorBootstrapper {
    pub fn new(store: Arc<dyn TaskStore>, unified_start: Option<DateTime<Utc>>) -> Self {
        Self {
            store,
            unified_start,
        }
    }

    /// `None` = nothing to aggregate yet.
    pub async fn bootstrap(
        &self,
        key: &TaskKey,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        if let Some(start) = self.unified_start {
            return Ok(Some(key.timeframe.floor(start)));
        }
        let cursor = self.store.bootstrap_cursor(key, now).await?;
        Ok(cursor.map(|c| key.timeframe.floor(c)))
    }
}
