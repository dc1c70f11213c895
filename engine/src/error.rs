//! Error types for the sync engine.

use crate::{ScopeId, TableName, Timestamp};
use thiserror::Error;

/// All possible errors from the sync engine.
///
/// Conflicts are not errors: a row that fails the apply predicate is
/// reported through [`crate::ApplyOutcome`] and never surfaces here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("schema error in table '{table}': {reason}")]
    Schema { table: TableName, reason: String },

    #[error("unknown table: {0}")]
    UnknownTable(TableName),

    #[error("invalid change for table '{table}': {reason}")]
    InvalidChange { table: TableName, reason: String },

    // Watermark errors
    #[error("out of order watermark for scope '{scope}': current {current}, attempted {attempted}")]
    OutOfOrderWatermark {
        scope: ScopeId,
        current: Timestamp,
        attempted: Timestamp,
    },

    // Recoverable errors
    #[error("change-tracking provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("transient apply failure: {0}")]
    TransientApplyFailure(String),

    #[error("operation cancelled")]
    Cancelled,

    // Scope persistence
    #[error("scope persistence error: {0}")]
    Persistence(String),
}

/// Coarse classification of an [`Error`], used by callers to pick a
/// retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Schema,
    OutOfOrderWatermark,
    ProviderUnavailable,
    TransientApplyFailure,
    Cancelled,
    Persistence,
}

impl Error {
    pub(crate) fn schema(table: impl Into<TableName>, reason: impl Into<String>) -> Self {
        Error::Schema {
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_change(table: impl Into<TableName>, reason: impl Into<String>) -> Self {
        Error::InvalidChange {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Schema { .. } | Error::UnknownTable(_) | Error::InvalidChange { .. } => {
                ErrorKind::Schema
            }
            Error::OutOfOrderWatermark { .. } => ErrorKind::OutOfOrderWatermark,
            Error::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            Error::TransientApplyFailure(_) => ErrorKind::TransientApplyFailure,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Persistence(_) => ErrorKind::Persistence,
        }
    }

    /// Whether the caller may resubmit the same batch after backing off.
    ///
    /// The engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProviderUnavailable | ErrorKind::TransientApplyFailure
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
