//! Keyed merge.
//!
//! Source rows are matched to target rows by the table's primary keys. A
//! target file is rewritten only when one of its rows is updated or deleted;
//! unmatched source rows are written to new files. Keys are compared on their
//! UTF-8 rendering after both sides are aligned to the same schema.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use arrow::{
    array::{Array, ArrayRef, AsArray, BooleanArray, RecordBatch, UInt32Array},
    compute::{
        cast, concat_batches, filter_record_batch, kernels::zip::zip, take, take_record_batch,
    },
    datatypes::DataType,
    error::ArrowError,
};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    commit::{ReadScope, StagedCommit, Transaction},
    data_file::ScalarValue,
    error::{InvalidArgumentSnafu, TableResult},
    predicate::Predicate,
    schema::Schema,
    snapshot::Snapshot,
    storage::StorageRef,
    table::{check_columns, evolve_for, Table},
    transaction_log::{Action, Operation},
    writer,
};

/// Separates key columns in a rendered composite key.
const KEY_SEPARATOR: char = '\u{1f}';

/// What a merge does with matched and unmatched rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Update matched target rows.
    Update,
    /// Insert source rows without a match.
    Insert,
    /// Delete matched target rows.
    Delete,
    /// Update matched rows and insert the rest.
    #[default]
    Upsert,
    /// Upsert, then delete target rows absent from the source.
    UpsertDelete,
}

impl MergeMode {
    fn updates(self) -> bool {
        matches!(
            self,
            MergeMode::Update | MergeMode::Upsert | MergeMode::UpsertDelete
        )
    }

    fn inserts(self) -> bool {
        matches!(
            self,
            MergeMode::Insert | MergeMode::Upsert | MergeMode::UpsertDelete
        )
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergeMode::Update => "update",
            MergeMode::Insert => "insert",
            MergeMode::Delete => "delete",
            MergeMode::Upsert => "upsert",
            MergeMode::UpsertDelete => "upsert_delete",
        })
    }
}

/// Options for [`Table::merge`].
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Merge mode.
    pub mode: MergeMode,
    /// Only target rows matching this predicate are updated or deleted.
    pub predicate: Option<Predicate>,
    /// Columns copied from the source on update. Defaults to every non-key
    /// column.
    pub update_columns: Option<Vec<String>>,
}

impl MergeOptions {
    /// Merge with `mode`.
    pub fn new(mode: MergeMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Restrict updates and deletes to target rows matching `predicate`.
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Only copy `columns` on update.
    pub fn with_update_columns<S: Into<String>>(
        mut self,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.update_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }
}

/// Outcome of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeMetrics {
    /// Version of the merge commit, `None` if nothing changed.
    pub version: Option<u64>,
    /// Target rows updated.
    pub rows_updated: u64,
    /// Source rows inserted.
    pub rows_inserted: u64,
    /// Target rows deleted.
    pub rows_deleted: u64,
    /// Files added.
    pub files_added: u64,
    /// Files removed.
    pub files_removed: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct RowCounts {
    updated: u64,
    inserted: u64,
    deleted: u64,
}

pub(super) async fn merge(
    table: &Table,
    source: &[RecordBatch],
    options: MergeOptions,
) -> TableResult<MergeMetrics> {
    let txn = MergeTransaction {
        storage: Arc::clone(&table.storage),
        source: source.to_vec(),
        options,
        counts: Mutex::new(RowCounts::default()),
    };
    let Some(commit) = table.run(&txn).await? else {
        return Ok(MergeMetrics::default());
    };

    // Counts of the staging that landed.
    let counts = *txn.counts.lock().await;
    Ok(MergeMetrics {
        version: Some(commit.version),
        rows_updated: counts.updated,
        rows_inserted: counts.inserted,
        rows_deleted: counts.deleted,
        files_added: commit.added_files().count() as u64,
        files_removed: commit.removed_files().count() as u64,
    })
}

struct MergeTransaction {
    storage: StorageRef,
    source: Vec<RecordBatch>,
    options: MergeOptions,
    counts: Mutex<RowCounts>,
}

/// The source aligned to the write schema, indexed by rendered key.
struct Source<'a> {
    batch: RecordBatch,
    rows: HashMap<&'a str, u32>,
    update_columns: Vec<String>,
}

impl MergeTransaction {
    fn update_columns(&self, schema: &Schema, keys: &[String]) -> TableResult<Vec<String>> {
        let Some(columns) = &self.options.update_columns else {
            return Ok(schema
                .columns()
                .iter()
                .filter(|c| !keys.contains(&c.name))
                .map(|c| c.name.clone())
                .collect());
        };
        for name in columns {
            if schema.column(name).is_none() {
                return InvalidArgumentSnafu {
                    msg: format!("update column {name} is not in the schema"),
                }
                .fail();
            }
            if keys.contains(name) {
                return InvalidArgumentSnafu {
                    msg: format!("primary key column {name} cannot be updated"),
                }
                .fail();
            }
        }
        Ok(columns.clone())
    }

    fn audit(&self, keys: &[String]) -> String {
        let on = format!("{} on ({})", self.options.mode, keys.join(", "));
        match &self.options.predicate {
            Some(p) => format!("{on} where {p}"),
            None => on,
        }
    }

    /// Apply the merge to one target batch. Returns the rewritten batch, or
    /// `None` when no row changed.
    fn merge_batch(
        &self,
        batch: &RecordBatch,
        key_columns: &[String],
        source: &Source<'_>,
        matched: &mut HashSet<String>,
        counts: &mut RowCounts,
    ) -> TableResult<Option<RecordBatch>> {
        let mode = self.options.mode;
        let eligible = match &self.options.predicate {
            Some(p) => Some(p.evaluate(batch)?),
            None => None,
        };

        let rows = batch.num_rows();
        let mut keep = Vec::with_capacity(rows);
        let mut update = Vec::with_capacity(rows);
        let mut indices: Vec<Option<u32>> = Vec::with_capacity(rows);
        let mut changed = false;

        for (row, key) in key_strings(batch, key_columns)?.into_iter().enumerate() {
            let eligible = eligible.as_ref().is_none_or(|mask| mask.value(row));
            let source_row = key.as_deref().and_then(|k| source.rows.get(k)).copied();
            if let Some(key) = key.filter(|_| source_row.is_some()) {
                matched.insert(key);
            }

            let (kept, updated) = match source_row {
                Some(_) if eligible && mode.updates() => (true, true),
                Some(_) if eligible && mode == MergeMode::Delete => (false, false),
                None if eligible && mode == MergeMode::UpsertDelete => (false, false),
                _ => (true, false),
            };
            if !kept {
                counts.deleted += 1;
            }
            if updated {
                counts.updated += 1;
            }
            changed |= !kept || updated;
            keep.push(kept);
            update.push(updated);
            indices.push(source_row.filter(|_| updated));
        }
        if !changed {
            return Ok(None);
        }

        let update = BooleanArray::from(update);
        let indices = UInt32Array::from(indices);
        let columns = batch
            .schema()
            .fields()
            .iter()
            .zip(batch.columns())
            .map(|(field, target)| {
                let from_source = source
                    .update_columns
                    .contains(field.name())
                    .then(|| source.batch.column_by_name(field.name()))
                    .flatten();
                match from_source {
                    Some(values) => {
                        let taken = take(values.as_ref(), &indices, None)?;
                        zip(&update, &taken, target)
                    }
                    None => Ok(Arc::clone(target)),
                }
            })
            .collect::<Result<Vec<ArrayRef>, ArrowError>>()?;

        let merged = RecordBatch::try_new(batch.schema(), columns)?;
        Ok(Some(filter_record_batch(
            &merged,
            &BooleanArray::from(keep),
        )?))
    }
}

#[async_trait]
impl Transaction for MergeTransaction {
    async fn stage(&self, snapshot: &Snapshot) -> TableResult<StagedCommit> {
        let metadata = snapshot.metadata();
        let keys = &metadata.primary_keys;
        if keys.is_empty() {
            return InvalidArgumentSnafu {
                msg: "merge requires primary key columns",
            }
            .fail();
        }

        let schema = evolve_for(snapshot.schema(), &self.source)?;
        if let Some(predicate) = &self.options.predicate {
            check_columns(predicate, &schema)?;
        }

        let aligned = self
            .source
            .iter()
            .filter(|b| b.num_rows() > 0)
            .map(|b| writer::align_batch(b, &schema))
            .collect::<TableResult<Vec<_>>>()?;
        let batch = concat_batches(&schema.to_arrow_schema_ref(), &aligned)?;

        let mut keys_rendered = Vec::with_capacity(batch.num_rows());
        for (row, key) in key_strings(&batch, keys)?.into_iter().enumerate() {
            match key {
                Some(key) => keys_rendered.push(key),
                None => {
                    return InvalidArgumentSnafu {
                        msg: format!("merge source row {row} has a null primary key"),
                    }
                    .fail()
                }
            }
        }
        let mut rows = HashMap::with_capacity(keys_rendered.len());
        for (row, key) in keys_rendered.iter().enumerate() {
            if rows.insert(key.as_str(), row as u32).is_some() {
                return InvalidArgumentSnafu {
                    msg: format!(
                        "duplicate primary key {} in merge source",
                        key.replace(KEY_SEPARATOR, ", ")
                    ),
                }
                .fail();
            }
        }
        let source = Source {
            update_columns: self.update_columns(&schema, keys)?,
            batch,
            rows,
        };

        let mode = self.options.mode;
        let read_scope = match mode {
            MergeMode::UpsertDelete => ReadScope::Table,
            _ => match key_scope(&source.batch, keys)? {
                Some(scope) => ReadScope::Predicate(scope),
                None => ReadScope::Table,
            },
        };
        let mut staged = StagedCommit {
            predicate: Some(self.audit(keys)),
            read_scope: read_scope.clone(),
            write_schema: Some(schema.clone()),
            ..StagedCommit::new(Operation::Merge)
        };

        let mut counts = RowCounts::default();
        let mut matched = HashSet::new();
        let mut output = Vec::new();
        for file in snapshot.files() {
            if let ReadScope::Predicate(scope) = &read_scope {
                if !scope.may_match(file, snapshot.schema()) {
                    continue;
                }
            }
            staged.files_read.insert(file.path.clone());

            let batches = writer::read_data_file(self.storage.as_ref(), file, &schema).await?;
            let mut rewritten = Vec::with_capacity(batches.len());
            let mut changed = false;
            for batch in &batches {
                match self.merge_batch(batch, keys, &source, &mut matched, &mut counts)? {
                    Some(merged) => {
                        changed = true;
                        rewritten.push(merged);
                    }
                    None => rewritten.push(batch.clone()),
                }
            }
            if changed {
                staged.actions.push(Action::remove(file.clone()));
                output.extend(rewritten);
            }
        }

        if mode.inserts() {
            let inserts: UInt32Array = keys_rendered
                .iter()
                .enumerate()
                .filter(|(_, key)| !matched.contains(key.as_str()))
                .map(|(row, _)| row as u32)
                .collect();
            if !inserts.is_empty() {
                counts.inserted = inserts.len() as u64;
                output.push(take_record_batch(&source.batch, &inserts)?);
            }
        }

        debug!(
            "merge staged at version {}: {} updated, {} inserted, {} deleted",
            snapshot.version(),
            counts.updated,
            counts.inserted,
            counts.deleted
        );
        *self.counts.lock().await = counts;
        if staged.is_empty() && output.is_empty() {
            return Ok(StagedCommit::new(Operation::Merge));
        }

        let written = writer::write(
            self.storage.as_ref(),
            &output,
            &schema,
            &metadata.partition_columns,
            metadata.config.target_file_size,
        )
        .await?;
        if !schema.same_columns(snapshot.schema()) {
            staged
                .actions
                .push(Action::Metadata(metadata.with_schema(schema.clone())));
        }
        staged.actions.extend(written.into_iter().map(Action::Add));
        Ok(staged)
    }
}

/// Render the key of every row, `None` where any key column is null.
fn key_strings(batch: &RecordBatch, key_columns: &[String]) -> TableResult<Vec<Option<String>>> {
    let mut parts = Vec::with_capacity(key_columns.len());
    for name in key_columns {
        let Some(column) = batch.column_by_name(name) else {
            return InvalidArgumentSnafu {
                msg: format!("primary key column {name} is missing"),
            }
            .fail();
        };
        parts.push(cast(column.as_ref(), &DataType::Utf8)?);
    }

    Ok((0..batch.num_rows())
        .map(|row| {
            let mut key = String::new();
            for (i, part) in parts.iter().enumerate() {
                let values = part.as_string::<i32>();
                if values.is_null(row) {
                    return None;
                }
                if i > 0 {
                    key.push(KEY_SEPARATOR);
                }
                key.push_str(values.value(row));
            }
            Some(key)
        })
        .collect())
}

/// `key1 IN (...) AND key2 IN (...)` over the source keys, or `None` when a
/// key type has no comparable scalar form.
fn key_scope(source: &RecordBatch, key_columns: &[String]) -> TableResult<Option<Predicate>> {
    let mut scope: Option<Predicate> = None;
    for name in key_columns {
        let Some(column) = source.column_by_name(name) else {
            return Ok(None);
        };
        let mut seen = HashSet::new();
        let mut values = Vec::new();
        for row in 0..column.len() {
            let Some(value) = ScalarValue::from_array(column.as_ref(), row)? else {
                return Ok(None);
            };
            if seen.insert(value.to_string()) {
                values.push(value);
            }
        }
        let clause = Predicate::in_list(name.clone(), values);
        scope = Some(match scope {
            Some(scope) => scope.and(clause),
            None => clause,
        });
    }
    Ok(scope)
}
