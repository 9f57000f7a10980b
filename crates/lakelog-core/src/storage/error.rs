//! Storage error types.

use std::{error::Error, fmt, io};

use snafu::{Backtrace, prelude::*};

/// Errors produced by a concrete storage backend.
///
/// Backend-specific failures are wrapped in this enum so the storage layer can
/// map them into [`StorageError`] variants with path context.
#[derive(Debug)]
pub enum BackendError {
    /// A local filesystem I/O error.
    Local(io::Error),
    /// An error returned by an `object_store` backend (S3, in-memory, ...).
    ObjectStore(object_store::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "local I/O error: {e}"),
            BackendError::ObjectStore(e) => write!(f, "object store error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
            BackendError::ObjectStore(e) => Some(e),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The specified key was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The key that was not found.
        path: String,
        /// Underlying backend error that caused the failure.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Any other backend failure.
    #[snafu(display("Storage I/O error at {path}: {source}"))]
    OtherIo {
        /// The key where the error occurred.
        path: String,
        /// Underlying backend error with platform-specific details.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A location string could not be turned into a storage backend.
    #[snafu(display("Invalid table location {spec:?}: {reason}"))]
    InvalidLocation {
        /// The location specification supplied by the caller.
        spec: String,
        /// Why the location was rejected.
        reason: String,
    },
}

impl StorageError {
    /// True if this error reports a missing key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}
