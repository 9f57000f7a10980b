//! Error types and SNAFU context selectors for table operations.
//!
//! This module centralizes the `TableError` enum used by the public API and
//! exposes context selectors (via `#[snafu(visibility(pub(crate)))]`) so
//! implementation details in sibling modules can attach error context without
//! re-exporting everything at the crate root.
//!
//! Propagation rule: conflicts and precondition failures are retried inside
//! the commit coordinator and only surface once its attempt bound is
//! exhausted. Every other variant propagates immediately.

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use snafu::prelude::*;

use crate::{
    schema::{SchemaError, SchemaRule},
    storage::StorageError,
    transaction_log::CommitError,
};

/// Errors from table operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// Data or a requested schema change violates the schema rules.
    #[snafu(display("Schema incompatible at column {column}: {rule}"))]
    SchemaIncompatible {
        /// Offending column.
        column: String,
        /// Violated rule.
        rule: SchemaRule,
    },

    /// A schema definition is malformed (duplicate or unsupported columns).
    #[snafu(display("Invalid schema: {source}"))]
    InvalidSchema {
        /// Underlying registry error.
        source: SchemaError,
    },

    /// Every commit attempt lost the race to a concurrent writer.
    #[snafu(display("Concurrent modification: gave up after {attempts} commit attempts"))]
    ConcurrentModification {
        /// Number of attempts made.
        attempts: u32,
    },

    /// A precondition of the operation no longer holds after concurrent
    /// commits, and re-planning did not succeed within the attempt bound.
    #[snafu(display("Precondition failed after {attempts} attempts: {reason}"))]
    PreconditionFailed {
        /// Number of attempts made.
        attempts: u32,
        /// The last failed precondition.
        reason: String,
    },

    /// The log is missing an entry, unreadable, or inconsistent.
    #[snafu(display("Corrupt log: {msg}"))]
    CorruptLog {
        /// What is wrong.
        msg: String,
    },

    /// A data file referenced by a live snapshot is missing from storage.
    #[snafu(display("Data file not found: {path}"))]
    FileNotFound {
        /// Key of the missing file.
        path: String,
    },

    /// A data file does not match its recorded size or content hash.
    #[snafu(display("Corrupt data file {path}: {reason}"))]
    CorruptDataFile {
        /// Key of the file.
        path: String,
        /// What did not match.
        reason: String,
    },

    /// The requested version is beyond HEAD or outside retention.
    #[snafu(display("Version {version} not found (available: {available})"))]
    VersionNotFound {
        /// Requested version.
        version: u64,
        /// Rendered range of resolvable versions.
        available: String,
    },

    /// Creating a table where a log already exists.
    #[snafu(display("Table already exists at {location} (version {version})"))]
    TableAlreadyExists {
        /// Table location.
        location: String,
        /// Current version of the existing table.
        version: u64,
    },

    /// Opening a location without a log.
    #[snafu(display("No table found at {location}"))]
    TableNotFound {
        /// Table location.
        location: String,
    },

    /// The table requires a newer reader or writer.
    #[snafu(display(
        "Unsupported protocol: table requires reader {min_reader_version} / writer {min_writer_version}"
    ))]
    UnsupportedProtocol {
        /// Required reader version.
        min_reader_version: u32,
        /// Required writer version.
        min_writer_version: u32,
    },

    /// An argument is invalid for this table.
    #[snafu(display("Invalid argument: {msg}"))]
    InvalidArgument {
        /// What is wrong.
        msg: String,
    },

    /// Vacuum retention below the configured minimum while enforcement is on.
    #[snafu(display(
        "Retention of {requested_hours}h is shorter than the minimum of {minimum_hours}h"
    ))]
    RetentionTooShort {
        /// Requested retention.
        requested_hours: u64,
        /// Configured minimum.
        minimum_hours: u64,
    },

    /// Other transaction log failures (serialization).
    #[snafu(display("Transaction log error: {source}"))]
    TransactionLog {
        /// Underlying log error.
        #[snafu(source, backtrace)]
        source: CommitError,
    },

    /// Storage error while accessing table data.
    #[snafu(display("Storage error while accessing table data: {source}"))]
    Storage {
        /// Underlying storage error.
        source: StorageError,
    },

    /// Parquet encode/decode error.
    #[snafu(display("Parquet error: {source}"))]
    Parquet {
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Arrow compute or conversion error.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },
}

/// A convenience type alias for table results.
pub type TableResult<T> = Result<T, TableError>;

impl From<CommitError> for TableError {
    fn from(err: CommitError) -> Self {
        match err {
            CommitError::CorruptLog { msg, .. } => TableError::CorruptLog { msg },
            CommitError::MissingEntry { version } => TableError::CorruptLog {
                msg: format!("log entry {version} is missing"),
            },
            CommitError::Storage { source } => TableError::Storage { source },
            other => TableError::TransactionLog { source: other },
        }
    }
}

impl From<SchemaError> for TableError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::Incompatible { column, rule } => {
                TableError::SchemaIncompatible { column, rule }
            }
            other => TableError::InvalidSchema { source: other },
        }
    }
}

impl From<StorageError> for TableError {
    fn from(source: StorageError) -> Self {
        TableError::Storage { source }
    }
}

impl From<ArrowError> for TableError {
    fn from(source: ArrowError) -> Self {
        TableError::Arrow { source }
    }
}

impl From<ParquetError> for TableError {
    fn from(source: ParquetError) -> Self {
        TableError::Parquet { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_errors_flatten_into_the_public_taxonomy() {
        let err: TableError = CommitError::MissingEntry { version: 4 }.into();
        assert!(matches!(err, TableError::CorruptLog { .. }));
    }

    #[test]
    fn schema_errors_keep_column_and_rule() {
        let err: TableError = SchemaError::Incompatible {
            column: "x".to_string(),
            rule: SchemaRule::ColumnRemoved,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Schema incompatible at column x: column removal is not allowed"
        );
    }
}
