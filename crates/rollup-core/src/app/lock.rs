//! Lock manager: claim / release of per-task soft locks.
//!
//! `TaskLease` は claim 成功時にだけ作られ、`release` で消費されます。
//! これにより「1 回の claim に対して release はちょうど 1 回」が型で保証されます。
//! lease を release せずに drop した場合（プロセス停止と同じ扱い）、lock は stale になるまで残ります。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::domain::{EngineError, LockToken, TaskKey, TaskOutcome};
use crate::ports::{
    ClaimGrant, ClaimOutcome, ClaimRequest, FinishReport, FinishRequest, NotClaimedReason,
    TaskStore,
};

/// Exclusive processing rights over one task for the current run.
#[derive(Debug)]
#[must_use = "a lease must be released, or the task stays locked until it goes stale"]
pub struct TaskLease {
    grant: ClaimGrant,
}

impl TaskLease {
    pub fn key(&self) -> &TaskKey {
        &self.grant.key
    }

    pub fn token(&self) -> LockToken {
        self.grant.token
    }

    pub fn last_cursor(&self) -> Option<DateTime<Utc>> {
        self.grant.last_cursor
    }

    pub fn derivation_version(&self) -> u32 {
        self.grant.derivation_version
    }

    pub fn reclaimed_from(&self) -> Option<DateTime<Utc>> {
        self.grant.reclaimed_from
    }
}

pub enum Claim {
    Acquired(TaskLease),
    NotClaimed(NotClaimedReason),
}

pub struct LockManager {
    store: Arc<dyn TaskStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub async fn claim(
        &self,
        key: &TaskKey,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Claim, EngineError> {
        let request = ClaimRequest {
            key: key.clone(),
            now,
            stale_after,
        };
        Ok(match self.store.claim(&request).await? {
            ClaimOutcome::Claimed(grant) => Claim::Acquired(TaskLease { grant }),
            ClaimOutcome::NotClaimed(reason) => Claim::NotClaimed(reason),
        })
    }

    /// Releases the lock and records `outcome`. A superseded token comes
    /// back as `applied = false`.
    pub async fn release(
        &self,
        lease: TaskLease,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
        auto_disable_threshold: u32,
        derivation_version: u32,
    ) -> Result<FinishReport, EngineError> {
        let request = FinishRequest {
            key: lease.grant.key,
            token: lease.grant.token,
            outcome,
            now,
            auto_disable_threshold,
            derivation_version,
        };
        self.store.finish(&request).await
    }
}
