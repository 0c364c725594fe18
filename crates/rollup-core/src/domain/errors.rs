//! Errors - エラー型と分類
//!
//! Store / aggregator の失敗は自由文ではなく、閉じた `ErrorCode` で返されます。
//! 分類（transient / hard）はこのコードから決まります。

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed taxonomy of failure codes reported by the store and the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // retryable
    Timeout,
    ConnectionReset,
    RateLimited,
    StoreUnavailable,
    SerializationConflict,

    // everything below counts toward auto-disable
    MissingSourceData,
    SchemaMismatch,
    ConstraintViolation,
    InvalidCursor,
    ContractViolation,
    NotFound,

    /// The collaborator could not map its failure to a known code.
    Unrecognized,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Timeout => "timeout",
            ErrorCode::ConnectionReset => "connection_reset",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::StoreUnavailable => "store_unavailable",
            ErrorCode::SerializationConflict => "serialization_conflict",
            ErrorCode::MissingSourceData => "missing_source_data",
            ErrorCode::SchemaMismatch => "schema_mismatch",
            ErrorCode::ConstraintViolation => "constraint_violation",
            ErrorCode::InvalidCursor => "invalid_cursor",
            ErrorCode::ContractViolation => "contract_violation",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Unrecognized => "unrecognized",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout
                | ErrorCode::ConnectionReset
                | ErrorCode::RateLimited
                | ErrorCode::StoreUnavailable
                | ErrorCode::SerializationConflict
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which collaborator produced the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    Store,
    Aggregator,
    Engine,
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorOrigin::Store => "store",
            ErrorOrigin::Aggregator => "aggregator",
            ErrorOrigin::Engine => "engine",
        })
    }
}

/// Failure classification.
///
/// - Transient: retried on the next scheduled run, leaves no scar on the task
/// - Hard: counted toward auto-disable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Hard,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Transient => "transient",
            FailureKind::Hard => "hard",
        })
    }
}

/// Error returned by every engine port.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{origin} error [{code}]: {message}")]
pub struct EngineError {
    code: ErrorCode,
    origin: ErrorOrigin,
    message: String,
}

impl EngineError {
    pub fn new(origin: ErrorOrigin, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            origin,
            message: message.into(),
        }
    }

    pub fn store(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorOrigin::Store, code, message)
    }

    pub fn aggregator(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorOrigin::Aggregator, code, message)
    }

    /// A collaborator returned something that breaks the engine's contract.
    pub fn contract(message: impl Into<String>) -> Self {
        Self::new(ErrorOrigin::Engine, ErrorCode::ContractViolation, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn origin(&self) -> ErrorOrigin {
        self.origin
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}
