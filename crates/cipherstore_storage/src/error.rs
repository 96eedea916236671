//! Error types for storage operations.

use crate::types::{Oid, Tid};
use cipherstore_transform::TransformError;
use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The record transform failed.
    #[error("transform error: {0}")]
    Transform(#[from] TransformError),

    /// The requested record or blob does not exist.
    #[error("no data for {oid} (serial {serial:?})")]
    NotFound {
        /// The object id.
        oid: Oid,
        /// The requested revision, if one was named.
        serial: Option<Tid>,
    },

    /// A store was based on a revision that is no longer current.
    #[error("conflict on {oid}: based on {expected}, committed is {committed}")]
    Conflict {
        /// The object id.
        oid: Oid,
        /// The revision the writer read.
        expected: Tid,
        /// The current committed revision.
        committed: Tid,
    },

    /// The storage is read-only.
    #[error("storage is read-only")]
    ReadOnly,

    /// The storage is closed.
    #[error("storage is closed")]
    Closed,

    /// The storage does not provide this feature.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// A call named a transaction other than the one in progress.
    #[error("transaction does not match the transaction in progress")]
    TransactionMismatch,

    /// A call was made in the wrong state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// No database has been registered with the storage yet.
    #[error("no database registered")]
    NotRegistered,

    /// The registered database has been dropped.
    #[error("registered database is gone")]
    DatabaseGone,
}

impl StorageError {
    /// Creates a not-found error for the current revision of `oid`.
    #[must_use]
    pub fn not_found(oid: Oid) -> Self {
        Self::NotFound { oid, serial: None }
    }

    /// Creates a not-found error for a specific revision.
    #[must_use]
    pub fn revision_not_found(oid: Oid, serial: Tid) -> Self {
        Self::NotFound {
            oid,
            serial: Some(serial),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Returns `true` for the missing record/blob condition.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
