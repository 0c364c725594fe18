//! Decision model: what happens to a task's failure streak on finish.
//!
//! The decider is a pure function of (current streak, outcome kind, threshold).
//! Stores apply the decision inside their atomic finish so the increment and
//! the disable transition can never be observed separately.

use serde::{Deserialize, Serialize};

use super::errors::FailureKind;

/// The streak update to apply on finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Success: streak back to zero.
    Reset,

    /// Transient failure: streak untouched.
    Keep { streak: u32 },

    /// Hard failure below the threshold.
    Increment { streak: u32 },

    /// Hard failure that reached the threshold: the task is disabled.
    Disable { streak: u32 },
}

impl Decision {
    pub fn streak(self) -> u32 {
        match self {
            Decision::Reset => 0,
            Decision::Keep { streak }
            | Decision::Increment { streak }
            | Decision::Disable { streak } => streak,
        }
    }

    pub fn disables(self) -> bool {
        matches!(self, Decision::Disable { .. })
    }
}

/// Consecutive-hard-failure auto-disable policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisablePolicy {
    threshold: u32,
}

impl DisablePolicy {
    /// A threshold of 0 is treated as 1: a single hard failure disables.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// `failure` is `None` for a successful finish.
    pub fn decide(&self, current_streak: u32, failure: Option<FailureKind>) -> Decision {
        match failure {
            None => Decision::Reset,
            Some(FailureKind::Transient) => Decision::Keep {
                streak: current_streak,
            },
            Some(FailureKind::Hard) => {
                let streak = current_streak.saturating_add(1);
                if streak >= self.threshold {
                    Decision::Disable { streak }
                } else {
                    Decision::Increment { streak }
                }
            }
        }
    }
}
