//! A catalog of named tables under one root.
//!
//! Each table lives under `<root>/<name>/` with its own `_log/` and `_data/`.
//! The catalog keeps no state of its own: a table exists exactly when its
//! log has at least one entry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::{
    error::{InvalidArgumentSnafu, TableNotFoundSnafu, TableResult},
    layout,
    schema::Schema,
    storage::{DeleteOutcome, ObjectStoreStorage, StorageRef, TableLocation},
    table::{Table, TableDefinition},
};

/// Summary of one table, as reported by [`Lake::table_info`].
#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// Description given at creation.
    pub description: Option<String>,
    /// Latest version.
    pub version: u64,
    /// Current schema.
    pub schema: Schema,
    /// Partition columns.
    pub partition_columns: Vec<String>,
    /// Primary key columns.
    pub primary_keys: Vec<String>,
    /// Live data files.
    pub num_files: usize,
    /// Bytes across live data files.
    pub total_bytes: u64,
    /// Rows across live data files.
    pub total_rows: u64,
    /// When the table was created.
    pub created_at: DateTime<Utc>,
}

/// Named tables sharing one storage root.
#[derive(Debug, Clone)]
pub struct Lake {
    root: StorageRef,
}

impl Lake {
    /// A lake rooted at `root`.
    pub fn new(root: StorageRef) -> Self {
        Self { root }
    }

    /// A lake rooted at `location`.
    pub fn open(location: &TableLocation) -> TableResult<Self> {
        Ok(Self::new(location.open_storage()?))
    }

    /// A throwaway lake in memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(ObjectStoreStorage::in_memory()))
    }

    fn table_storage(&self, name: &str) -> TableResult<StorageRef> {
        let invalid = name.trim().is_empty()
            || name.contains(['/', '\\'])
            || name == "."
            || name == "..";
        if invalid {
            return InvalidArgumentSnafu {
                msg: format!("invalid table name {name:?}"),
            }
            .fail();
        }
        Ok(self.root.scoped(name))
    }

    /// Create table `name`. The definition's own name is replaced.
    pub async fn create_table(
        &self,
        name: &str,
        definition: TableDefinition,
    ) -> TableResult<Table> {
        let storage = self.table_storage(name)?;
        let definition = TableDefinition {
            name: name.to_string(),
            ..definition
        };
        Table::create_in(storage, definition).await
    }

    /// Open table `name`.
    pub async fn open_table(&self, name: &str) -> TableResult<Table> {
        Table::open_in(self.table_storage(name)?).await
    }

    /// Names of every table with a log, sorted.
    ///
    /// Only the top level and each candidate's `_log/` are listed; data files
    /// are never walked.
    pub async fn list_tables(&self) -> TableResult<Vec<String>> {
        let log_prefix = layout::log_prefix();
        let mut names = Vec::new();
        for name in self.root.list_dirs("").await? {
            // A dropped table can leave an empty `_log/` directory behind.
            if !self.root.scoped(&name).list(&log_prefix).await?.is_empty() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Describe table `name` at its latest version.
    pub async fn table_info(&self, name: &str) -> TableResult<TableInfo> {
        let snapshot = self.open_table(name).await?.snapshot().await?;
        let metadata = snapshot.metadata();
        Ok(TableInfo {
            name: name.to_string(),
            description: metadata.description.clone(),
            version: snapshot.version(),
            schema: metadata.schema.clone(),
            partition_columns: metadata.partition_columns.clone(),
            primary_keys: metadata.primary_keys.clone(),
            num_files: snapshot.num_files(),
            total_bytes: snapshot.total_bytes(),
            total_rows: snapshot.total_rows(),
            created_at: metadata.created_at,
        })
    }

    /// Delete every object of table `name`, data before log, newest log
    /// entry first. Returns the number deleted.
    pub async fn drop_table(&self, name: &str) -> TableResult<usize> {
        let storage = self.table_storage(name)?;
        let log_prefix = layout::log_prefix();
        let (log, data): (Vec<_>, Vec<_>) = storage
            .list("")
            .await?
            .into_iter()
            .partition(|object| object.key.starts_with(&log_prefix));
        if log.is_empty() {
            return TableNotFoundSnafu {
                location: storage.uri(),
            }
            .fail();
        }

        let mut deleted = 0;
        for object in data.iter().chain(log.iter().rev()) {
            if storage.delete(&object.key).await? == DeleteOutcome::Deleted {
                deleted += 1;
            }
        }
        debug!("dropped {} data and {} log object(s)", data.len(), log.len());
        info!("dropped table {name}");
        Ok(deleted)
    }
}
