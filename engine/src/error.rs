//! Error types for the todos engine.
//!
//! # Error Types
//!
//! - [`StoreError`] - Failures reported by a [`Store`](crate::store::Store) backend
//! - [`EngineError`] - Top-level errors returned by engine operations
//!
//! # Classification
//!
//! Not every store error is a failure worth surfacing. A watch that reports
//! [`StoreError::NotFound`] after its collection was destroyed is the
//! expected tail of a teardown and is swallowed by the engine; see
//! [`StoreError::is_benign`]. Optimistic transaction conflicts are retried
//! by the bulk completion operator before they surface as
//! [`EngineError::TransactionConflict`].
//!
//! # Example
//!
//! ```rust
//! use todos_engine::error::{EngineError, StoreError};
//!
//! let err: EngineError = StoreError::not_found("groceries").into();
//! assert!(matches!(err, EngineError::Store(StoreError::NotFound(_))));
//! ```

use thiserror::Error;

/// Errors reported by a change-log store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The named collection does not exist (or no longer exists).
    #[error("collection does not exist: {0}")]
    NotFound(String),

    /// The named collection already exists.
    #[error("collection already exists: {0}")]
    AlreadyExists(String),

    /// An optimistic transaction observed a concurrent mutation.
    #[error("transaction conflict on '{collection}': expected version {expected}, found {actual}")]
    Conflict {
        /// Collection the transaction targeted.
        collection: String,
        /// Version the transaction was prepared against.
        expected: u64,
        /// Version found at commit time.
        actual: u64,
    },

    /// The underlying transport failed.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl StoreError {
    /// Creates a new not-found error.
    pub fn not_found(collection: impl Into<String>) -> Self {
        Self::NotFound(collection.into())
    }

    /// Creates a new transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Returns `true` for errors that are the expected outcome of destroying
    /// a watched collection.
    ///
    /// # Example
    ///
    /// ```rust
    /// use todos_engine::error::StoreError;
    ///
    /// assert!(StoreError::not_found("l1").is_benign());
    /// assert!(!StoreError::transport("socket reset").is_benign());
    /// ```
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` if retrying the same operation may succeed.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Top-level error type for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A row value could not be encoded or decoded.
    #[error("row codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A bulk completion kept conflicting with concurrent writers.
    ///
    /// No partial set of done flags was applied.
    #[error("transaction on list '{list_id}' conflicted {attempts} times, giving up")]
    TransactionConflict {
        /// The list the operation targeted.
        list_id: String,
        /// Number of commit attempts made.
        attempts: u32,
    },

    /// The list does not exist or has no spec row.
    #[error("unknown list: {0}")]
    UnknownList(String),

    /// The task does not exist in the list.
    #[error("unknown task '{task_id}' in list '{list_id}'")]
    UnknownTask {
        /// The list that was searched.
        list_id: String,
        /// The missing task.
        task_id: String,
    },

    /// The registry loop is no longer running.
    #[error("registry stopped")]
    RegistryStopped,
}

impl EngineError {
    /// Returns `true` if the error is an exhausted transaction retry.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::TransactionConflict { .. } | Self::Store(StoreError::Conflict { .. })
        )
    }
}

/// A specialized `Result` type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
