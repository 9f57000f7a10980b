//! Append-only transaction log.
//!
//! The log is the single source of truth for a table: an ordered sequence of
//! immutable JSON commits keyed by a zero-padded version number, plus
//! periodic checkpoints that summarize the table at a version.
//!
//! ## On-disk layout
//!
//! ```text
//! table_root/
//!   _log/
//!     00000000000000000000.json              # version 0: protocol + metadata
//!     00000000000000000001.json              # version 1
//!     ...
//!     00000000000000000010.json
//!     00000000000000000010.checkpoint.json   # live files as of version 10
//!   _data/
//!     part-<uuid>.parquet
//!     region=eu/part-<uuid>.parquet
//! ```
//!
//! Each commit file contains a single [`Commit`], for example:
//!
//! ```json
//! {
//!   "version": 1,
//!   "read_version": 0,
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "operation": "append",
//!   "actions": [
//!     { "add": { "path": "_data/part-....parquet", "row_count": 100, ... } }
//!   ]
//! }
//! ```
//!
//! A commit file is created with create-if-absent semantics, which makes the
//! creation of version `N` the only synchronization point between writers.
//! Nothing is ever rewritten in place.

pub mod actions;
pub mod checkpoint;
pub mod store;

pub use actions::{Action, Commit, CommitInfo, Operation, Protocol, TableMetadata};
pub use checkpoint::Checkpoint;
pub use store::{AppendOutcome, LogStore};

use snafu::{Backtrace, prelude::*};

use crate::storage::StorageError;

/// Errors that can occur while reading or writing the log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommitError {
    /// A log entry is missing inside the retained range, unreadable, or does
    /// not describe the version its key names.
    #[snafu(display("Corrupt log: {msg}"))]
    CorruptLog {
        /// A description of the corrupt state.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The requested log entry does not exist.
    #[snafu(display("Log entry for version {version} not found"))]
    MissingEntry {
        /// The version that was requested.
        version: u64,
    },

    /// Underlying storage error while working with the log.
    ///
    /// Backtraces are delegated to the inner StorageError.
    #[snafu(display("Storage error while accessing the log: {source}"))]
    Storage {
        /// Underlying storage error returned by the storage backend.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// A log entry could not be serialized.
    #[snafu(display("Failed to serialize log entry {version}: {source}"))]
    Serialize {
        /// Version of the entry.
        version: u64,
        /// Underlying JSON error.
        source: serde_json::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        config::TableConfig,
        data_file::DataFile,
        schema::{Column, ColumnType, Schema},
    };

    fn sample_file() -> DataFile {
        DataFile {
            path: "_data/part-1.parquet".to_string(),
            partition_values: BTreeMap::new(),
            row_count: 10,
            size_bytes: 1234,
            stats: BTreeMap::new(),
            schema_version: 0,
            content_hash: "abc".to_string(),
            created_version: Some(1),
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn commit_json_uses_snake_case_tags() {
        let commit = Commit {
            version: 1,
            read_version: Some(0),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            operation: Operation::Append,
            predicate: None,
            actions: vec![Action::Add(sample_file())],
        };

        let json = serde_json::to_value(&commit).unwrap();
        assert_eq!(json["operation"], "append");
        assert_eq!(json["actions"][0]["add"]["path"], "_data/part-1.parquet");
        assert!(json.get("predicate").is_none());

        let back: Commit = serde_json::from_value(json).unwrap();
        assert_eq!(back, commit);
    }

    #[test]
    fn creation_commit_round_trips() {
        let schema = Schema::new(vec![Column::new("id", ColumnType::Int64, false)]).unwrap();
        let metadata = TableMetadata::new("events", schema, vec![], vec!["id".to_string()], TableConfig::default());
        let commit = Commit {
            version: 0,
            read_version: None,
            timestamp: Utc::now(),
            operation: Operation::Create,
            predicate: None,
            actions: vec![
                Action::Protocol(Protocol::current()),
                Action::Metadata(metadata),
            ],
        };

        let json = serde_json::to_string_pretty(&commit).unwrap();
        let back: Commit = serde_json::from_str(&json).unwrap();
        assert_eq!(back, commit);
    }
}
