use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Stage commit failed: {message}")]
    Stage { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Connectivity, pool exhaustion, lock contention or an expired operation timeout.
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Hypothesis not found: {hypothesis_id}")]
    HypothesisNotFound { hypothesis_id: i64 },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[source] sqlx::Error),
}

impl StorageError {
    /// Whether the error means the store could not be reached in time.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. })
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        let unavailable = match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => true,
            sqlx::Error::Database(db) => is_lock_contention(db.code().as_deref()),
            _ => false,
        };

        if unavailable {
            StorageError::Unavailable {
                message: err.to_string(),
            }
        } else {
            StorageError::Sqlx(err)
        }
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_lock_contention(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

/// Coarse classification of an expression rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    SyntaxError,
    UnknownSymbol,
    ArityMismatch,
}

/// Why an alpha expression was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("Syntax error at position {position}: {message}")]
    Syntax { message: String, position: usize },

    #[error("Unknown symbol: {symbol}")]
    UnknownSymbol { symbol: String },

    /// Only raised when the validator runs with strict arity checking.
    #[error("{name} expects {expected} argument(s), got {found}")]
    ArityMismatch {
        name: String,
        expected: String,
        found: usize,
    },
}

impl ValidationError {
    pub(crate) fn syntax(message: impl Into<String>, position: usize) -> Self {
        ValidationError::Syntax {
            message: message.into(),
            position,
        }
    }

    /// The kind of rejection, without its details.
    pub fn kind(&self) -> ValidationErrorKind {
        match self {
            ValidationError::Syntax { .. } => ValidationErrorKind::SyntaxError,
            ValidationError::UnknownSymbol { .. } => ValidationErrorKind::UnknownSymbol,
            ValidationError::ArityMismatch { .. } => ValidationErrorKind::ArityMismatch,
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
