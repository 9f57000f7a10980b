//! File writer: Arrow batches in, durable statistics-annotated Parquet files
//! out.
//!
//! Every file returned by [`write`] has been fully written with `put` before
//! the call returns, and no returned file is ever touched again. Files that
//! never make it into a commit are orphans and are reclaimed by vacuum.

use std::{collections::BTreeMap, sync::Arc};

use arrow::{
    array::{
        new_null_array, Array, ArrayRef, AsArray, RecordBatch, RecordBatchOptions, UInt32Array,
    },
    compute::{cast_with_options, take_record_batch, CastOptions},
    datatypes::{DataType, Float64Type, Int64Type},
    error::ArrowError,
};
use bytes::Bytes;
use chrono::Utc;
use log::debug;
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter},
    basic::Compression,
    file::properties::WriterProperties,
};
use rayon::prelude::*;

use crate::{
    data_file::{normalize_for_compare, ColumnStats, DataFile},
    error::{
        CorruptDataFileSnafu, FileNotFoundSnafu, InvalidArgumentSnafu, TableError, TableResult,
    },
    layout,
    schema::{check_non_null, Schema},
    storage::ObjectStorage,
};

/// Rows handed to the Parquet encoder at a time. The size check that closes a
/// file runs between chunks.
const WRITE_CHUNK_ROWS: usize = 8192;

/// Align `batch` to `schema`: reorder columns, cast narrower stored types to
/// the table type and null-fill columns the batch lacks.
///
/// Columns the schema does not know are rejected.
pub fn align_batch(batch: &RecordBatch, schema: &Schema) -> TableResult<RecordBatch> {
    let incoming = batch.schema();
    if let Some(extra) = incoming
        .fields()
        .iter()
        .find(|f| schema.column(f.name()).is_none())
    {
        return InvalidArgumentSnafu {
            msg: format!("column {} is not part of the table schema", extra.name()),
        }
        .fail();
    }
    // Widening casts never introduce nulls, so the raw batch is checked.
    check_non_null(schema, batch)?;

    let options = CastOptions {
        safe: false,
        ..Default::default()
    };
    let rows = batch.num_rows();
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.columns().len());
    for col in schema.columns() {
        let target = col.data_type.to_arrow();
        let array = match batch.column_by_name(&col.name) {
            Some(array) if array.data_type() == &target => Arc::clone(array),
            Some(array) => cast_with_options(array.as_ref(), &target, &options)?,
            None => new_null_array(&target, rows),
        };
        columns.push(array);
    }

    Ok(RecordBatch::try_new_with_options(
        schema.to_arrow_schema_ref(),
        columns,
        &RecordBatchOptions::new().with_row_count(Some(rows)),
    )?)
}

/// Write `batches` as immutable data files.
///
/// Rows are aligned to `schema`, split by the values of `partition_columns`
/// and each partition is cut into files of roughly `target_file_size` encoded
/// bytes. Returns descriptors in partition order; `created_version` is left
/// unset for the commit coordinator to stamp.
pub async fn write(
    storage: &dyn ObjectStorage,
    batches: &[RecordBatch],
    schema: &Schema,
    partition_columns: &[String],
    target_file_size: u64,
) -> TableResult<Vec<DataFile>> {
    let mut partitions: BTreeMap<Vec<Option<String>>, Vec<RecordBatch>> = BTreeMap::new();
    for batch in batches {
        if batch.num_rows() == 0 {
            continue;
        }
        let aligned = align_batch(batch, schema)?;
        for (key, part) in split_by_partition(&aligned, partition_columns)? {
            partitions.entry(key).or_default().push(part);
        }
    }

    let mut files = Vec::new();
    for (key, parts) in partitions {
        let values: BTreeMap<String, Option<String>> =
            partition_columns.iter().cloned().zip(key).collect();

        let mut open: Option<OpenFile> = None;
        for part in &parts {
            let mut offset = 0;
            while offset < part.num_rows() {
                let len = WRITE_CHUNK_ROWS.min(part.num_rows() - offset);
                let chunk = part.slice(offset, len);
                offset += len;

                let mut file = match open.take() {
                    Some(file) => file,
                    None => OpenFile::new(schema)?,
                };
                file.write(&chunk)?;

                if file.estimated_size() >= target_file_size {
                    files.push(
                        file.finish(storage, schema, partition_columns, &values)
                            .await?,
                    );
                } else {
                    open = Some(file);
                }
            }
        }
        if let Some(last) = open.take() {
            files.push(last.finish(storage, schema, partition_columns, &values).await?);
        }
    }

    debug!(
        "wrote {} data file(s), {} row(s)",
        files.len(),
        files.iter().map(|f| f.row_count).sum::<u64>()
    );
    Ok(files)
}

/// A data file being encoded in memory.
struct OpenFile {
    writer: ArrowWriter<Vec<u8>>,
    rows: u64,
    stats: Vec<ColumnStats>,
}

impl OpenFile {
    fn new(schema: &Schema) -> TableResult<Self> {
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let writer = ArrowWriter::try_new(Vec::new(), schema.to_arrow_schema_ref(), Some(props))?;
        Ok(Self {
            writer,
            rows: 0,
            stats: Vec::new(),
        })
    }

    fn write(&mut self, chunk: &RecordBatch) -> TableResult<()> {
        let chunk_stats: Result<Vec<ColumnStats>, ArrowError> = chunk
            .columns()
            .par_iter()
            .map(|c| ColumnStats::compute(c.as_ref()))
            .collect();
        let chunk_stats = chunk_stats?;

        if self.stats.is_empty() {
            self.stats = chunk_stats;
        } else {
            for (acc, next) in self.stats.iter_mut().zip(chunk_stats) {
                merge_stats(acc, next);
            }
        }

        self.writer.write(chunk)?;
        self.rows += chunk.num_rows() as u64;
        Ok(())
    }

    fn estimated_size(&self) -> u64 {
        (self.writer.bytes_written() + self.writer.in_progress_size()) as u64
    }

    async fn finish(
        self,
        storage: &dyn ObjectStorage,
        schema: &Schema,
        partition_columns: &[String],
        partition_values: &BTreeMap<String, Option<String>>,
    ) -> TableResult<DataFile> {
        let bytes = self.writer.into_inner()?;
        let path = layout::data_file_key(partition_columns, partition_values);
        let size_bytes = bytes.len() as u64;
        let content_hash = blake3::hash(&bytes).to_hex().to_string();

        storage.put(&path, Bytes::from(bytes)).await?;

        let stats = schema
            .columns()
            .iter()
            .map(|c| c.name.clone())
            .zip(self.stats)
            .collect();

        Ok(DataFile {
            path,
            partition_values: partition_values.clone(),
            row_count: self.rows,
            size_bytes,
            stats,
            schema_version: schema.version(),
            content_hash,
            created_version: None,
            created_at: Utc::now(),
        })
    }
}

fn merge_stats(acc: &mut ColumnStats, next: ColumnStats) {
    acc.null_count += next.null_count;
    acc.min = match (acc.min.take(), next.min) {
        (Some(a), Some(b)) => Some(if b < a { b } else { a }),
        (a, b) => a.or(b),
    };
    acc.max = match (acc.max.take(), next.max) {
        (Some(a), Some(b)) => Some(if b > a { b } else { a }),
        (a, b) => a.or(b),
    };
}

/// Group the rows of `batch` by their rendered partition values.
fn split_by_partition(
    batch: &RecordBatch,
    partition_columns: &[String],
) -> TableResult<Vec<(Vec<Option<String>>, RecordBatch)>> {
    if partition_columns.is_empty() {
        return Ok(vec![(Vec::new(), batch.clone())]);
    }

    let mut rendered = Vec::with_capacity(partition_columns.len());
    for name in partition_columns {
        let column = batch.column_by_name(name).ok_or_else(|| TableError::InvalidArgument {
            msg: format!("partition column {name} is missing"),
        })?;
        rendered.push(render_partition_values(column.as_ref())?);
    }

    let mut groups: BTreeMap<Vec<Option<String>>, Vec<u32>> = BTreeMap::new();
    for row in 0..batch.num_rows() {
        let key = rendered.iter().map(|values| values[row].clone()).collect();
        groups.entry(key).or_default().push(row as u32);
    }

    if groups.len() == 1 {
        return Ok(groups
            .into_keys()
            .map(|key| (key, batch.clone()))
            .collect());
    }

    groups
        .into_iter()
        .map(|(key, rows)| {
            let indices = UInt32Array::from(rows);
            Ok((key, take_record_batch(batch, &indices)?))
        })
        .collect()
}

/// Render each value of a partition column as its directory string. Dates
/// render as day numbers.
fn render_partition_values(array: &dyn Array) -> Result<Vec<Option<String>>, ArrowError> {
    let normalized = normalize_for_compare(array)?;
    let rendered = match normalized.data_type() {
        DataType::Boolean => normalized
            .as_boolean()
            .iter()
            .map(|v| v.map(|b| b.to_string()))
            .collect(),
        DataType::Int64 => normalized
            .as_primitive::<Int64Type>()
            .iter()
            .map(|v| v.map(|i| i.to_string()))
            .collect(),
        DataType::Float64 => normalized
            .as_primitive::<Float64Type>()
            .iter()
            .map(|v| v.map(|f| f.to_string()))
            .collect(),
        DataType::Utf8 => normalized
            .as_string::<i32>()
            .iter()
            .map(|v| v.map(str::to_string))
            .collect(),
        other => {
            return Err(ArrowError::InvalidArgumentError(format!(
                "cannot partition by a column of type {other}"
            )))
        }
    };
    Ok(rendered)
}

/// Read a data file and align it to `schema`.
///
/// Fails with `FileNotFound` when the object is gone and `CorruptDataFile`
/// when its size or hash does not match the descriptor.
pub async fn read_data_file(
    storage: &dyn ObjectStorage,
    file: &DataFile,
    schema: &Schema,
) -> TableResult<Vec<RecordBatch>> {
    let bytes = match storage.get(&file.path).await {
        Ok(bytes) => bytes,
        Err(e) if e.is_not_found() => {
            return FileNotFoundSnafu {
                path: file.path.clone(),
            }
            .fail()
        }
        Err(e) => return Err(e.into()),
    };

    if bytes.len() as u64 != file.size_bytes {
        return CorruptDataFileSnafu {
            path: file.path.clone(),
            reason: format!(
                "size is {} bytes, descriptor records {}",
                bytes.len(),
                file.size_bytes
            ),
        }
        .fail();
    }
    let hash = blake3::hash(&bytes).to_hex().to_string();
    if hash != file.content_hash {
        return CorruptDataFileSnafu {
            path: file.path.clone(),
            reason: "content hash mismatch".to_string(),
        }
        .fail();
    }

    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(align_batch(&batch?, schema)?);
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Int32Array, Int64Array, StringArray};
    use arrow::datatypes::{Field, Schema as ArrowSchema};
    use tempfile::TempDir;

    use super::*;
    use crate::{
        data_file::ScalarValue,
        schema::{Column, ColumnType},
        storage::LocalStorage,
    };

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn table_schema() -> Schema {
        Schema::new(vec![
            Column::new("id", ColumnType::Int64, false),
            Column::new("region", ColumnType::Utf8, true),
            Column::new("score", ColumnType::Float64, true),
        ])
        .expect("valid schema")
    }

    fn batch(ids: Vec<i64>, regions: Vec<Option<&str>>) -> RecordBatch {
        let schema = Arc::new(ArrowSchema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("region", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(regions)),
            ],
        )
        .expect("valid batch")
    }

    #[tokio::test]
    async fn partitions_rows_and_records_stats() -> TestResult {
        let tmp = TempDir::new()?;
        let storage = LocalStorage::new(tmp.path());
        let schema = table_schema();
        let input = batch(
            vec![1, 2, 3, 4],
            vec![Some("eu"), Some("us"), None, Some("eu")],
        );

        let files = write(&storage, &[input], &schema, &["region".to_string()], 1 << 20).await?;
        assert_eq!(files.len(), 3);

        let eu = files
            .iter()
            .find(|f| f.partition_value("region") == Some(Some("eu")))
            .expect("eu partition");
        assert!(eu.path.starts_with("_data/region=eu/part-"));
        assert_eq!(eu.row_count, 2);
        let id_stats = eu.column_stats("id").expect("id stats");
        assert_eq!(id_stats.min, Some(ScalarValue::Int64(1)));
        assert_eq!(id_stats.max, Some(ScalarValue::Int64(4)));
        // Null-filled column is all nulls.
        assert_eq!(eu.column_stats("score").map(|s| s.null_count), Some(2));

        let null_part = files
            .iter()
            .find(|f| f.partition_value("region") == Some(None))
            .expect("null partition");
        assert!(null_part.path.starts_with("_data/region=__NULL__/"));

        let back = read_data_file(&storage, eu, &schema).await?;
        let rows: usize = back.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 2);
        assert_eq!(back[0].schema(), schema.to_arrow_schema_ref());
        Ok(())
    }

    #[tokio::test]
    async fn small_target_splits_into_several_files() -> TestResult {
        let tmp = TempDir::new()?;
        let storage = LocalStorage::new(tmp.path());
        let schema = table_schema();
        let ids: Vec<i64> = (0..30_000).collect();
        let regions = vec![Some("eu"); ids.len()];

        let files = write(&storage, &[batch(ids, regions)], &schema, &[], 1).await?;
        assert!(files.len() > 1);
        assert_eq!(files.iter().map(|f| f.row_count).sum::<u64>(), 30_000);
        Ok(())
    }

    #[tokio::test]
    async fn narrower_input_is_upcast_and_nulls_in_required_columns_fail() -> TestResult {
        let tmp = TempDir::new()?;
        let storage = LocalStorage::new(tmp.path());
        let schema = table_schema();

        let narrow = RecordBatch::try_new(
            Arc::new(ArrowSchema::new(vec![Field::new("id", DataType::Int32, true)])),
            vec![Arc::new(Int32Array::from(vec![Some(7), Some(8)]))],
        )?;
        let files = write(&storage, &[narrow], &schema, &[], 1 << 20).await?;
        assert_eq!(files.len(), 1);

        let with_null = RecordBatch::try_new(
            Arc::new(ArrowSchema::new(vec![Field::new("id", DataType::Int32, true)])),
            vec![Arc::new(Int32Array::from(vec![Some(7), None]))],
        )?;
        let err = write(&storage, &[with_null], &schema, &[], 1 << 20)
            .await
            .expect_err("null id must be rejected");
        assert!(matches!(err, TableError::SchemaIncompatible { ref column, .. } if column == "id"));
        Ok(())
    }

    #[tokio::test]
    async fn tampered_and_missing_files_are_detected() -> TestResult {
        let tmp = TempDir::new()?;
        let storage = LocalStorage::new(tmp.path());
        let schema = table_schema();
        let files = write(
            &storage,
            &[batch(vec![1, 2], vec![Some("eu"), Some("eu")])],
            &schema,
            &[],
            1 << 20,
        )
        .await?;
        let file = &files[0];

        let mut tampered = file.clone();
        tampered.content_hash = "0".repeat(64);
        assert!(matches!(
            read_data_file(&storage, &tampered, &schema).await,
            Err(TableError::CorruptDataFile { .. })
        ));

        storage.delete(&file.path).await?;
        assert!(matches!(
            read_data_file(&storage, file, &schema).await,
            Err(TableError::FileNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn unknown_columns_are_rejected_by_alignment() {
        let extra = RecordBatch::try_new(
            Arc::new(ArrowSchema::new(vec![Field::new("zzz", DataType::Int64, false)])),
            vec![Arc::new(Int64Array::from(vec![1]))],
        )
        .expect("valid batch");
        assert!(matches!(
            align_batch(&extra, &table_schema()),
            Err(TableError::InvalidArgument { .. })
        ));
    }
}
