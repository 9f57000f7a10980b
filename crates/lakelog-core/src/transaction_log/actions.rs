//! Log actions and commit payload definitions.
//!
//! Each commit file stores a [`Commit`] containing ordered [`Action`] values
//! that mutate table state: adding/removing data files or replacing table
//! metadata. This module focuses on the log's "verbs".

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{config::TableConfig, data_file::DataFile, schema::Schema};

/// Reader protocol version written by this crate.
pub const READER_VERSION: u32 = 1;

/// Writer protocol version written by this crate.
pub const WRITER_VERSION: u32 = 1;

/// Minimum protocol versions a client must support to read or write a table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Protocol {
    /// Minimum reader version.
    pub min_reader_version: u32,
    /// Minimum writer version.
    pub min_writer_version: u32,
}

impl Protocol {
    /// The protocol this crate writes.
    pub fn current() -> Self {
        Self {
            min_reader_version: READER_VERSION,
            min_writer_version: WRITER_VERSION,
        }
    }

    /// Whether this crate can read tables at this protocol.
    pub fn readable(&self) -> bool {
        self.min_reader_version <= READER_VERSION
    }

    /// Whether this crate can write tables at this protocol.
    pub fn writable(&self) -> bool {
        self.min_writer_version <= WRITER_VERSION
    }
}

/// Table-level metadata, replaced as a whole by a `metadata` action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableMetadata {
    /// Stable table identifier, assigned at creation.
    pub id: String,
    /// Human-readable table name.
    pub name: String,
    /// Optional free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Current schema.
    pub schema: Schema,
    /// Partition columns, in directory order.
    #[serde(default)]
    pub partition_columns: Vec<String>,
    /// Primary key columns used by `merge`.
    #[serde(default)]
    pub primary_keys: Vec<String>,
    /// Table configuration.
    #[serde(default)]
    pub config: TableConfig,
    /// When the table was created.
    pub created_at: DateTime<Utc>,
}

impl TableMetadata {
    /// Metadata for a new table.
    pub fn new(
        name: impl Into<String>,
        schema: Schema,
        partition_columns: Vec<String>,
        primary_keys: Vec<String>,
        config: TableConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            schema,
            partition_columns,
            primary_keys,
            config,
            created_at: Utc::now(),
        }
    }

    /// Same metadata with a different schema.
    pub fn with_schema(&self, schema: Schema) -> Self {
        Self {
            schema,
            ..self.clone()
        }
    }
}

/// An action recorded in a commit.
///
/// Each commit contains a sequence of actions that are applied in order to
/// evolve table state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Make a data file live.
    Add(DataFile),

    /// Make a live data file invisible. The physical file stays until vacuum.
    Remove {
        /// The file being removed, as it was added.
        file: DataFile,
        /// When the removal was committed.
        deletion_timestamp: DateTime<Utc>,
    },

    /// Replace table metadata (schema, partitioning, configuration).
    Metadata(TableMetadata),

    /// Change the protocol requirements.
    Protocol(Protocol),
}

impl Action {
    /// Convenience constructor for a removal stamped now.
    pub fn remove(file: DataFile) -> Self {
        Action::Remove {
            file,
            deletion_timestamp: Utc::now(),
        }
    }
}

/// Kind of operation that produced a commit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Table creation (version 0).
    Create,
    /// Blind append of new rows.
    Append,
    /// Replace every row.
    Overwrite,
    /// Keyed update / insert / delete.
    Merge,
    /// Predicate delete.
    Delete,
    /// File compaction.
    Compact,
    /// Explicit schema change.
    SchemaChange,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Append => "append",
            Operation::Overwrite => "overwrite",
            Operation::Merge => "merge",
            Operation::Delete => "delete",
            Operation::Compact => "compact",
            Operation::SchemaChange => "schema_change",
        })
    }
}

/// A single, immutable commit in the log.
///
/// Commits are written to files such as `_log/00000000000000000001.json`.
/// The version field must match the file name; `read_version` records the
/// snapshot the writer staged against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Commit {
    /// The version number of this commit (contiguous, starting from 0).
    pub version: u64,

    /// The version the writer staged against, `None` for table creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_version: Option<u64>,

    /// Commit timestamp, stored as RFC3339 UTC.
    pub timestamp: DateTime<Utc>,

    /// What produced this commit.
    pub operation: Operation,

    /// Predicate of the operation, for audit only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,

    /// Ordered list of actions.
    pub actions: Vec<Action>,
}

impl Commit {
    /// Files added by this commit.
    pub fn added_files(&self) -> impl Iterator<Item = &DataFile> {
        self.actions.iter().filter_map(|a| match a {
            Action::Add(f) => Some(f),
            _ => None,
        })
    }

    /// Files removed by this commit.
    pub fn removed_files(&self) -> impl Iterator<Item = &DataFile> {
        self.actions.iter().filter_map(|a| match a {
            Action::Remove { file, .. } => Some(file),
            _ => None,
        })
    }

    /// The metadata this commit installs, if any.
    pub fn metadata(&self) -> Option<&TableMetadata> {
        self.actions.iter().find_map(|a| match a {
            Action::Metadata(m) => Some(m),
            _ => None,
        })
    }

    /// The protocol this commit installs, if any.
    pub fn protocol(&self) -> Option<&Protocol> {
        self.actions.iter().find_map(|a| match a {
            Action::Protocol(p) => Some(p),
            _ => None,
        })
    }

    /// Summary used by `history()`.
    pub fn info(&self) -> CommitInfo {
        CommitInfo {
            version: self.version,
            timestamp: self.timestamp,
            operation: self.operation,
            predicate: self.predicate.clone(),
            read_version: self.read_version,
            files_added: self.added_files().count() as u64,
            files_removed: self.removed_files().count() as u64,
            rows_added: self.added_files().map(|f| f.row_count).sum(),
            rows_removed: self.removed_files().map(|f| f.row_count).sum(),
            schema_changed: self.metadata().is_some(),
        }
    }
}

/// Commit metadata reported by `history()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitInfo {
    /// Commit version.
    pub version: u64,
    /// Commit timestamp.
    pub timestamp: DateTime<Utc>,
    /// Operation tag.
    pub operation: Operation,
    /// Audit predicate, if any.
    pub predicate: Option<String>,
    /// Version the writer staged against.
    pub read_version: Option<u64>,
    /// Number of `add` actions.
    pub files_added: u64,
    /// Number of `remove` actions.
    pub files_removed: u64,
    /// Rows in added files.
    pub rows_added: u64,
    /// Rows in removed files.
    pub rows_removed: u64,
    /// Whether the commit replaced table metadata.
    pub schema_changed: bool,
}
