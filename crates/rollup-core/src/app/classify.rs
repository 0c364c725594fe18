//! Failure classification: error code -> transient / hard.

use crate::domain::{EngineError, ErrorCode, FailureKind};

/// Message fragments treated as transient when a collaborator reports
/// `ErrorCode::Unrecognized` and message matching is switched on.
const TRANSIENT_FRAGMENTS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "too many requests",
    "rate limit",
    "could not serialize",
    "deadlock detected",
    "temporarily unavailable",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classifier {
    by_message: bool,
}

impl Classifier {
    pub fn new(by_message: bool) -> Self {
        Self { by_message }
    }

    pub fn classify(&self, err: &EngineError) -> FailureKind {
        if err.is_retryable() {
            return FailureKind::Transient;
        }
        if self.by_message && err.code() == ErrorCode::Unrecognized {
            let message = err.message().to_ascii_lowercase();
            if TRANSIENT_FRAGMENTS.iter().any(|f| message.contains(f)) {
                return FailureKind::Transient;
            }
        }
        FailureKind::Hard
    }
}
