//! Table handle.
//!
//! [`Table`] is the user-facing surface: create/open, the mutations (append,
//! overwrite, merge, delete, schema changes), reads with time travel, history
//! and maintenance. Every mutation is a [`Transaction`] handed to the
//! [`CommitCoordinator`]; the handle itself holds no authoritative state and
//! is cheap to clone and share across tasks.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use arrow::{
    array::RecordBatch,
    compute::{filter_record_batch, not},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::{
    commit::{CommitCoordinator, ReadScope, StagedCommit, Transaction},
    compact::{self, CompactOptions, CompactionMetrics},
    config::TableConfig,
    data_file::DataFile,
    engine::{self, ExecutionEngine, ParquetEngine, RecordBatchStream},
    error::{
        InvalidArgumentSnafu, SchemaIncompatibleSnafu, TableAlreadyExistsSnafu,
        TableNotFoundSnafu, TableResult,
    },
    predicate::Predicate,
    schema::{self, Column, Schema, SchemaRule},
    snapshot::{Snapshot, SnapshotResolver},
    storage::{StorageRef, TableLocation},
    transaction_log::{
        Action, AppendOutcome, Commit, CommitInfo, Operation, Protocol, TableMetadata,
    },
    vacuum::{self, VacuumMetrics, VacuumOptions},
    writer,
};

pub mod merge;

pub use merge::{MergeMetrics, MergeMode, MergeOptions};

/// Everything needed to create a table.
#[derive(Debug, Clone)]
pub struct TableDefinition {
    /// Table name.
    pub name: String,
    /// Initial schema.
    pub schema: Schema,
    /// Partition columns, in directory order.
    pub partition_columns: Vec<String>,
    /// Primary key columns used by `merge`.
    pub primary_keys: Vec<String>,
    /// Table configuration.
    pub config: TableConfig,
    /// Optional description.
    pub description: Option<String>,
}

impl TableDefinition {
    /// An unpartitioned table without primary keys and default configuration.
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            partition_columns: Vec::new(),
            primary_keys: Vec::new(),
            config: TableConfig::default(),
            description: None,
        }
    }

    /// Partition by `columns`.
    pub fn with_partition_columns<S: Into<String>>(
        mut self,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.partition_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Key `merge` by `columns`.
    pub fn with_primary_keys<S: Into<String>>(
        mut self,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.primary_keys = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Use `config`.
    pub fn with_config(mut self, config: TableConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn validate(&self) -> TableResult<()> {
        let invalid = |msg: String| InvalidArgumentSnafu { msg }.fail();

        if self.name.trim().is_empty() {
            return invalid("table name must not be empty".to_string());
        }
        if self.schema.columns().is_empty() {
            return invalid("a table needs at least one column".to_string());
        }

        let mut seen = BTreeSet::new();
        for name in &self.partition_columns {
            let Some(col) = self.schema.column(name) else {
                return invalid(format!("partition column {name} is not in the schema"));
            };
            if !col.data_type.is_partitionable() {
                return invalid(format!(
                    "column {name} of type {} cannot be a partition column",
                    col.data_type
                ));
            }
            if !seen.insert(name) {
                return invalid(format!("partition column {name} is listed twice"));
            }
        }

        let mut seen = BTreeSet::new();
        for name in &self.primary_keys {
            if self.schema.column(name).is_none() {
                return invalid(format!("primary key column {name} is not in the schema"));
            }
            if !seen.insert(name) {
                return invalid(format!("primary key column {name} is listed twice"));
            }
        }
        Ok(())
    }

    fn into_metadata(self) -> TableMetadata {
        TableMetadata {
            description: self.description,
            ..TableMetadata::new(
                self.name,
                self.schema,
                self.partition_columns,
                self.primary_keys,
                self.config,
            )
        }
    }
}

/// Options for [`Table::read`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Read this version instead of the latest.
    pub version: Option<u64>,
    /// Read the version that was current at this instant.
    pub timestamp: Option<DateTime<Utc>>,
    /// Row filter.
    pub filter: Option<Predicate>,
}

impl ReadOptions {
    /// Read `version`.
    pub fn at_version(version: u64) -> Self {
        Self {
            version: Some(version),
            ..Self::default()
        }
    }

    /// Read the version current at `timestamp`.
    pub fn at_timestamp(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Self::default()
        }
    }

    /// Only return rows matching `filter`.
    pub fn with_filter(mut self, filter: Predicate) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// A pinned, pruned file list ready to be scanned.
///
/// The file set is fixed when the scan is created; later commits do not
/// change what it returns.
#[derive(Debug, Clone)]
pub struct TableScan {
    storage: StorageRef,
    version: u64,
    schema: Schema,
    files: Vec<DataFile>,
    filter: Option<Predicate>,
}

impl TableScan {
    /// The version being read.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Schema effective at that version.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Files left after pruning.
    pub fn files(&self) -> &[DataFile] {
        &self.files
    }

    /// The row filter, if any.
    pub fn filter(&self) -> Option<&Predicate> {
        self.filter.as_ref()
    }

    /// Stream the rows through `engine`.
    pub fn execute(&self, engine: &dyn ExecutionEngine) -> RecordBatchStream {
        engine.scan(
            Arc::clone(&self.storage),
            self.files.clone(),
            self.schema.clone(),
            self.filter.clone(),
        )
    }

    /// Read every row with the built-in [`ParquetEngine`].
    pub async fn collect(&self) -> TableResult<Vec<RecordBatch>> {
        engine::collect(self.execute(&ParquetEngine)).await
    }

    /// Number of rows the scan returns.
    pub async fn count_rows(&self) -> TableResult<usize> {
        Ok(engine::count_rows(&self.collect().await?))
    }
}

/// Outcome of [`Table::delete`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteMetrics {
    /// Version of the delete commit, `None` if no row matched.
    pub version: Option<u64>,
    /// Rows deleted.
    pub rows_deleted: u64,
    /// Files removed.
    pub files_removed: u64,
    /// Files written with the surviving rows.
    pub files_added: u64,
}

/// Handle to one table.
#[derive(Debug, Clone)]
pub struct Table {
    storage: StorageRef,
    coordinator: CommitCoordinator,
    last_version: Arc<AtomicU64>,
}

/// Open the table at `location`.
pub async fn open_table(location: &TableLocation) -> TableResult<Table> {
    Table::open(location).await
}

impl Table {
    fn new(storage: StorageRef) -> Self {
        Self {
            coordinator: CommitCoordinator::new(Arc::clone(&storage)),
            storage,
            last_version: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a table at `location`.
    pub async fn create(location: &TableLocation, definition: TableDefinition) -> TableResult<Self> {
        Self::create_in(location.open_storage()?, definition).await
    }

    /// Create a table rooted at `storage`.
    ///
    /// Writes version 0 with the protocol and the initial metadata. Fails
    /// with `TableAlreadyExists` if any log entry is present.
    pub async fn create_in(storage: StorageRef, definition: TableDefinition) -> TableResult<Self> {
        definition.validate()?;
        let table = Self::new(storage);
        let log = table.resolver().log();

        if let Some(version) = log.head_version().await? {
            return TableAlreadyExistsSnafu {
                location: table.storage.uri(),
                version,
            }
            .fail();
        }

        let name = definition.name.clone();
        let commit = Commit {
            version: 0,
            read_version: None,
            timestamp: Utc::now(),
            operation: Operation::Create,
            predicate: None,
            actions: vec![
                Action::Protocol(Protocol::current()),
                Action::Metadata(definition.into_metadata()),
            ],
        };
        match log.append(&commit).await? {
            AppendOutcome::Committed => {}
            AppendOutcome::AlreadyExists => {
                return TableAlreadyExistsSnafu {
                    location: table.storage.uri(),
                    version: log.head_version().await?.unwrap_or(0),
                }
                .fail();
            }
        }

        info!("created table {name} at {}", table.storage.uri());
        Ok(table)
    }

    /// Open the table at `location`.
    pub async fn open(location: &TableLocation) -> TableResult<Self> {
        Self::open_in(location.open_storage()?).await
    }

    /// Open the table rooted at `storage`.
    pub async fn open_in(storage: StorageRef) -> TableResult<Self> {
        let table = Self::new(storage);
        if table.resolver().head_version().await?.is_none() {
            return TableNotFoundSnafu {
                location: table.storage.uri(),
            }
            .fail();
        }
        let snapshot = table.snapshot().await?;
        debug!(
            "opened table {} at version {}",
            snapshot.metadata().name,
            snapshot.version()
        );
        Ok(table)
    }

    fn resolver(&self) -> &SnapshotResolver {
        self.coordinator.resolver()
    }

    fn observe(&self, version: u64) {
        self.last_version.fetch_max(version, Ordering::Relaxed);
    }

    async fn run<T: Transaction>(&self, txn: &T) -> TableResult<Option<Commit>> {
        let commit = self.coordinator.commit(txn).await?;
        if let Some(commit) = &commit {
            self.observe(commit.version);
        }
        Ok(commit)
    }

    /// The storage root of this table.
    pub fn storage(&self) -> &StorageRef {
        &self.storage
    }

    /// Last version this handle has seen. Only a hint: other writers may
    /// have committed since.
    pub fn version(&self) -> u64 {
        self.last_version.load(Ordering::Relaxed)
    }

    /// The latest snapshot.
    pub async fn snapshot(&self) -> TableResult<Snapshot> {
        let snapshot = self.resolver().resolve_latest().await?;
        self.observe(snapshot.version());
        Ok(snapshot)
    }

    /// The snapshot at `version`.
    pub async fn snapshot_at(&self, version: u64) -> TableResult<Snapshot> {
        self.resolver().resolve(version).await
    }

    /// Current table metadata, including the creation-time settings.
    pub async fn metadata(&self) -> TableResult<TableMetadata> {
        Ok(self.snapshot().await?.metadata().clone())
    }

    /// Current schema.
    pub async fn schema(&self) -> TableResult<Schema> {
        Ok(self.snapshot().await?.schema().clone())
    }

    /// Append `batches`.
    ///
    /// New columns are added to the schema and narrower types are up-cast.
    /// Returns the committed version, or `None` when there were no rows.
    pub async fn append(&self, batches: &[RecordBatch]) -> TableResult<Option<u64>> {
        let txn = WriteTransaction {
            storage: Arc::clone(&self.storage),
            batches: batches.to_vec(),
            replace: false,
        };
        Ok(self.run(&txn).await?.map(|c| c.version))
    }

    /// Replace every row of the table with `batches`.
    pub async fn overwrite(&self, batches: &[RecordBatch]) -> TableResult<Option<u64>> {
        let txn = WriteTransaction {
            storage: Arc::clone(&self.storage),
            batches: batches.to_vec(),
            replace: true,
        };
        Ok(self.run(&txn).await?.map(|c| c.version))
    }

    /// Delete every row matching `predicate`.
    ///
    /// Files with matching rows are rewritten without them; files without a
    /// match are left untouched.
    pub async fn delete(&self, predicate: Predicate) -> TableResult<DeleteMetrics> {
        let txn = DeleteTransaction {
            storage: Arc::clone(&self.storage),
            predicate,
        };
        let Some(commit) = self.run(&txn).await? else {
            return Ok(DeleteMetrics::default());
        };

        let rows_removed: u64 = commit.removed_files().map(|f| f.row_count).sum();
        let rows_added: u64 = commit.added_files().map(|f| f.row_count).sum();
        Ok(DeleteMetrics {
            version: Some(commit.version),
            rows_deleted: rows_removed.saturating_sub(rows_added),
            files_removed: commit.removed_files().count() as u64,
            files_added: commit.added_files().count() as u64,
        })
    }

    /// Merge `source` into the table by primary key.
    pub async fn merge(
        &self,
        source: &[RecordBatch],
        options: MergeOptions,
    ) -> TableResult<MergeMetrics> {
        merge::merge(self, source, options).await
    }

    /// Pin a version and list the files a scan needs.
    ///
    /// `version` and `timestamp` are mutually exclusive; without either the
    /// latest version is read. Files whose statistics rule out the filter are
    /// pruned.
    pub async fn read(&self, options: ReadOptions) -> TableResult<TableScan> {
        let snapshot = match (options.version, options.timestamp) {
            (Some(_), Some(_)) => {
                return InvalidArgumentSnafu {
                    msg: "read accepts a version or a timestamp, not both",
                }
                .fail()
            }
            (Some(version), None) => self.resolver().resolve(version).await?,
            (None, Some(ts)) => self.resolver().resolve_at_timestamp(ts).await?,
            (None, None) => self.snapshot().await?,
        };

        let schema = snapshot.schema();
        if let Some(filter) = &options.filter {
            check_columns(filter, schema)?;
        }

        let files: Vec<DataFile> = snapshot
            .files()
            .filter(|f| {
                options
                    .filter
                    .as_ref()
                    .is_none_or(|p| p.may_match(f, schema))
            })
            .cloned()
            .collect();
        debug!(
            "read at version {}: {} of {} file(s) after pruning",
            snapshot.version(),
            files.len(),
            snapshot.num_files()
        );

        Ok(TableScan {
            storage: Arc::clone(&self.storage),
            version: snapshot.version(),
            schema: schema.clone(),
            files,
            filter: options.filter,
        })
    }

    /// Commit metadata for every version from 1 to HEAD that is still in the
    /// log, oldest first.
    pub async fn history(&self) -> TableResult<Vec<CommitInfo>> {
        let log = self.resolver().log();
        let Some(head) = log.head_version().await? else {
            return Ok(Vec::new());
        };
        self.observe(head);

        let from = log.earliest_version().await?.unwrap_or(head).max(1);
        if from > head {
            return Ok(Vec::new());
        }
        Ok(self
            .resolver()
            .commits(from, head)
            .await?
            .iter()
            .map(Commit::info)
            .collect())
    }

    /// Delete unreferenced data files outside the retention window.
    pub async fn vacuum(&self, options: VacuumOptions) -> TableResult<VacuumMetrics> {
        vacuum::vacuum(self.resolver(), &options).await
    }

    /// Rewrite small files into larger ones.
    pub async fn compact(&self, options: CompactOptions) -> TableResult<CompactionMetrics> {
        let metrics =
            compact::compact(&self.coordinator, Arc::clone(&self.storage), options).await?;
        if let Some(version) = metrics.version {
            self.observe(version);
        }
        Ok(metrics)
    }

    /// Replace the schema with `target`.
    ///
    /// Only additive and widening changes are accepted; new columns must be
    /// nullable. Returns `None` when `target` equals the current schema.
    pub async fn evolve_schema(&self, target: Vec<Column>) -> TableResult<Option<u64>> {
        let txn = SchemaChange::Replace(target);
        Ok(self.run(&txn).await?.map(|c| c.version))
    }

    /// Make `column` non-nullable.
    ///
    /// The live files must prove the column holds no nulls; otherwise this
    /// fails with `SchemaIncompatible`.
    pub async fn alter_column_not_null(&self, column: &str) -> TableResult<Option<u64>> {
        let txn = SchemaChange::NotNull(column.to_string());
        Ok(self.run(&txn).await?.map(|c| c.version))
    }
}

/// Reject predicates over columns the schema does not have.
pub(crate) fn check_columns(predicate: &Predicate, schema: &Schema) -> TableResult<()> {
    match predicate.columns().into_iter().find(|c| schema.column(c).is_none()) {
        Some(column) => InvalidArgumentSnafu {
            msg: format!("predicate references unknown column {column}"),
        }
        .fail(),
        None => Ok(()),
    }
}

/// Validate every batch against `current` and return the schema to write
/// with. A changed schema is bumped exactly once per commit.
pub(crate) fn evolve_for(current: &Schema, batches: &[RecordBatch]) -> TableResult<Schema> {
    let mut evolved = current.clone();
    for batch in batches {
        evolved = schema::validate(&evolved, &batch.schema())?;
    }
    Ok(if evolved.same_columns(current) {
        current.clone()
    } else {
        evolved.with_version(current.version() + 1)
    })
}

struct WriteTransaction {
    storage: StorageRef,
    batches: Vec<RecordBatch>,
    replace: bool,
}

#[async_trait]
impl Transaction for WriteTransaction {
    async fn stage(&self, snapshot: &Snapshot) -> TableResult<StagedCommit> {
        let metadata = snapshot.metadata();
        let schema = evolve_for(snapshot.schema(), &self.batches)?;

        let written = writer::write(
            self.storage.as_ref(),
            &self.batches,
            &schema,
            &metadata.partition_columns,
            metadata.config.target_file_size,
        )
        .await?;

        let mut staged = if self.replace {
            StagedCommit {
                read_scope: ReadScope::Table,
                files_read: snapshot.files().map(|f| f.path.clone()).collect(),
                actions: snapshot.files().cloned().map(Action::remove).collect(),
                ..StagedCommit::new(Operation::Overwrite)
            }
        } else {
            StagedCommit::new(Operation::Append)
        };
        if written.is_empty() && staged.is_empty() {
            return Ok(staged);
        }

        if !schema.same_columns(snapshot.schema()) {
            staged
                .actions
                .push(Action::Metadata(metadata.with_schema(schema.clone())));
        }
        staged.actions.extend(written.into_iter().map(Action::Add));
        staged.write_schema = Some(schema);
        Ok(staged)
    }
}

struct DeleteTransaction {
    storage: StorageRef,
    predicate: Predicate,
}

#[async_trait]
impl Transaction for DeleteTransaction {
    async fn stage(&self, snapshot: &Snapshot) -> TableResult<StagedCommit> {
        let metadata = snapshot.metadata();
        let schema = snapshot.schema();
        check_columns(&self.predicate, schema)?;

        let mut staged = StagedCommit {
            predicate: Some(self.predicate.to_string()),
            read_scope: ReadScope::Predicate(self.predicate.clone()),
            write_schema: Some(schema.clone()),
            ..StagedCommit::new(Operation::Delete)
        };

        let mut survivors = Vec::new();
        for file in snapshot.files().filter(|f| self.predicate.may_match(f, schema)) {
            staged.files_read.insert(file.path.clone());

            let batches = writer::read_data_file(self.storage.as_ref(), file, schema).await?;
            let mut kept = Vec::with_capacity(batches.len());
            let mut deleted = 0;
            for batch in &batches {
                let mask = self.predicate.evaluate(batch)?;
                deleted += mask.true_count();
                kept.push(filter_record_batch(batch, &not(&mask)?)?);
            }
            if deleted == 0 {
                continue;
            }
            debug!("{}: deleting {deleted} row(s)", file.path);
            survivors.extend(kept);
            staged.actions.push(Action::remove(file.clone()));
        }
        if staged.is_empty() {
            return Ok(staged);
        }

        let written = writer::write(
            self.storage.as_ref(),
            &survivors,
            schema,
            &metadata.partition_columns,
            metadata.config.target_file_size,
        )
        .await?;
        staged.actions.extend(written.into_iter().map(Action::Add));
        Ok(staged)
    }
}

enum SchemaChange {
    Replace(Vec<Column>),
    NotNull(String),
}

#[async_trait]
impl Transaction for SchemaChange {
    async fn stage(&self, snapshot: &Snapshot) -> TableResult<StagedCommit> {
        let current = snapshot.schema();
        let mut staged = StagedCommit::new(Operation::SchemaChange);

        let next = match self {
            SchemaChange::Replace(target) => schema::validate_replacement(current, target, &[])?,
            SchemaChange::NotNull(name) => {
                let Some(column) = current.column(name) else {
                    return InvalidArgumentSnafu {
                        msg: format!("column {name} is not in the schema"),
                    }
                    .fail();
                };
                if !column.nullable {
                    return Ok(staged);
                }

                // Files written before the column existed hold only nulls.
                let nulls: u64 = snapshot
                    .files()
                    .map(|f| match f.column_stats(name) {
                        Some(stats) => stats.null_count,
                        None => f.row_count,
                    })
                    .sum();
                if nulls > 0 {
                    return SchemaIncompatibleSnafu {
                        column: name.clone(),
                        rule: SchemaRule::NullValues {
                            count: nulls as usize,
                        },
                    }
                    .fail();
                }

                let target: Vec<Column> = current
                    .columns()
                    .iter()
                    .map(|c| Column {
                        nullable: c.nullable && c.name != *name,
                        ..c.clone()
                    })
                    .collect();
                // Any file landing concurrently could carry nulls.
                staged.read_scope = ReadScope::Table;
                staged.files_read = snapshot.files().map(|f| f.path.clone()).collect();
                schema::validate_replacement(current, &target, std::slice::from_ref(name))?
            }
        };

        if next.same_columns(current) {
            return Ok(StagedCommit::new(Operation::SchemaChange));
        }
        info!("schema change to {next}");
        staged
            .actions
            .push(Action::Metadata(snapshot.metadata().with_schema(next)));
        Ok(staged)
    }
}
