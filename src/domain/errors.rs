//! Domain errors for the cache coherence subsystem.

use thiserror::Error;

use super::ports::{CacheError, StoreError};

/// Why an optimistic or conditional write lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// The record version changed between read and conditional write.
    VersionMismatch { observed: Option<u64> },
    /// An item in an atomic commit failed its condition.
    ConditionFailed { failed_index: Option<usize> },
    /// A lock is held by another owner.
    LockHeld,
    /// The caller's lock expired or was reassigned before the guarded commit.
    LockLost,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VersionMismatch { observed: Some(v) } => write!(f, "version mismatch (observed {v})"),
            Self::VersionMismatch { observed: None } => write!(f, "version mismatch (record was absent)"),
            Self::ConditionFailed { failed_index: Some(i) } => write!(f, "condition failed on item {i}"),
            Self::ConditionFailed { failed_index: None } => write!(f, "condition failed"),
            Self::LockHeld => write!(f, "lock held by another owner"),
            Self::LockLost => write!(f, "lock expired or reassigned"),
        }
    }
}

/// Errors surfaced by every component of the subsystem.
#[derive(Debug, Error)]
pub enum CoherenceError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict on {key}: {kind} after {attempts} attempt(s)")]
    Conflict { key: String, kind: ConflictKind, attempts: u32 },

    #[error("Transient store error after {attempts} attempt(s): {message}")]
    TransientStore { message: String, attempts: u32 },

    #[error("Unauthorized release of lock {lock_id}: owner token does not match")]
    UnauthorizedRelease { lock_id: String },

    #[error("Deadline exceeded for {operation} after {attempts} attempt(s)")]
    Timeout { operation: String, attempts: u32 },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl CoherenceError {
    /// Shorthand for a `Validation` error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Version mismatch, failed condition or lost lock.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Transient store error that exhausted its retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore { .. })
    }
}

/// Result alias for the coherence subsystem.
pub type CoherenceResult<T> = Result<T, CoherenceError>;

impl From<StoreError> for CoherenceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConditionFailed { key } => CoherenceError::Conflict {
                key,
                kind: ConflictKind::ConditionFailed { failed_index: None },
                attempts: 1,
            },
            StoreError::TransactionCanceled { failed_index, key } => CoherenceError::Conflict {
                key,
                kind: ConflictKind::ConditionFailed { failed_index: Some(failed_index) },
                attempts: 1,
            },
            StoreError::Transient(message) => CoherenceError::TransientStore { message, attempts: 1 },
            StoreError::Backend(msg) | StoreError::Serialization(msg) => CoherenceError::Store(msg),
        }
    }
}

impl From<serde_json::Error> for CoherenceError {
    fn from(err: serde_json::Error) -> Self {
        CoherenceError::Store(format!("serialization: {err}"))
    }
}
