//! Error types for the FenceGrid persistence guard.
//!
//! Mode-validator rejections and storage-level conflicts share one enum so
//! callers can pick a recovery per kind: re-resolve shard ownership on
//! `Fenced`, re-read on `VersionConflict`, treat `AlreadyExists` as a lost
//! race or duplicate.

use fence_core::{CurrentExecution, ModeStateError, NotificationVersion, RangeId, ShardId};
use thiserror::Error;

/// Result type alias for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Errors returned by the persistence guard. None of them is fatal to the
/// process.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The participant states do not fit the requested mode.
    #[error(transparent)]
    InvalidModeState(#[from] ModeStateError),

    /// The caller's fencing token is stale: another host owns the shard.
    #[error("shard {shard_id} ownership lost: presented range id {expected}, stored {actual}")]
    Fenced {
        shard_id: ShardId,
        expected: RangeId,
        actual: RangeId,
    },

    /// A concurrent domain mutation moved the notification version.
    #[error("domain metadata version conflict: expected {expected}, stored {actual}")]
    VersionConflict {
        expected: NotificationVersion,
        actual: NotificationVersion,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-key violation. `current` is set when the key is a workflow's
    /// current-execution pointer.
    #[error("already exists: {what}")]
    AlreadyExists {
        what: String,
        current: Option<CurrentExecution>,
    },

    /// The current-execution pointer is not where the request expects it.
    #[error("current execution condition failed: {0}")]
    CurrentConditionFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation cancelled before commit")]
    Cancelled,

    #[error("operation deadline exceeded before commit")]
    Timeout,

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl PersistenceError {
    /// Conflicts raised by the store's compare step rather than by the
    /// caller's request shape.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            PersistenceError::Fenced { .. }
                | PersistenceError::VersionConflict { .. }
                | PersistenceError::AlreadyExists { .. }
                | PersistenceError::CurrentConditionFailed(_)
        )
    }

    /// Whether the request itself is wrong and resubmitting it unchanged
    /// can never succeed.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            PersistenceError::InvalidModeState(_) | PersistenceError::InvalidArgument(_)
        )
    }

    pub(crate) fn already_exists(what: impl Into<String>) -> Self {
        PersistenceError::AlreadyExists {
            what: what.into(),
            current: None,
        }
    }
}
