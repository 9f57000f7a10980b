//! Execution engine seam.
//!
//! The table layer decides *which* files make up a version; an
//! [`ExecutionEngine`] turns those files into rows. [`ParquetEngine`] is the
//! built-in implementation: it decodes each file, aligns it to the requested
//! schema and applies the row filter. It does no planning of its own.

use std::{pin::Pin, sync::Arc};

use arrow::{array::RecordBatch, compute::filter_record_batch};
use futures::{future, stream, Stream, StreamExt, TryStreamExt};

use crate::{
    data_file::DataFile,
    error::{TableError, TableResult},
    predicate::Predicate,
    schema::Schema,
    storage::StorageRef,
    writer,
};

/// A lazily evaluated stream of record batches.
pub type RecordBatchStream = Pin<Box<dyn Stream<Item = TableResult<RecordBatch>> + Send>>;

/// Produces rows from a set of data files.
pub trait ExecutionEngine: Send + Sync {
    /// Stream the rows of `files`, aligned to `schema` and filtered by
    /// `filter`. Nothing is read until the stream is polled.
    fn scan(
        &self,
        storage: StorageRef,
        files: Vec<DataFile>,
        schema: Schema,
        filter: Option<Predicate>,
    ) -> RecordBatchStream;
}

/// Reads Parquet data files one after another.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetEngine;

impl ExecutionEngine for ParquetEngine {
    fn scan(
        &self,
        storage: StorageRef,
        files: Vec<DataFile>,
        schema: Schema,
        filter: Option<Predicate>,
    ) -> RecordBatchStream {
        let filter = Arc::new(filter);

        let stream = stream::iter(files)
            .then(move |file| {
                let storage = Arc::clone(&storage);
                let schema = schema.clone();

                async move {
                    let batches = writer::read_data_file(storage.as_ref(), &file, &schema).await?;
                    Ok::<_, TableError>(stream::iter(batches.into_iter().map(Ok::<_, TableError>)))
                }
            })
            .try_flatten()
            .and_then(move |batch| future::ready(apply_filter(batch, (*filter).as_ref())))
            .try_filter(|batch| future::ready(batch.num_rows() > 0));

        Box::pin(stream)
    }
}

fn apply_filter(batch: RecordBatch, filter: Option<&Predicate>) -> TableResult<RecordBatch> {
    match filter {
        Some(predicate) => {
            let mask = predicate.evaluate(&batch)?;
            Ok(filter_record_batch(&batch, &mask)?)
        }
        None => Ok(batch),
    }
}

/// Drain `stream` into memory.
pub async fn collect(stream: RecordBatchStream) -> TableResult<Vec<RecordBatch>> {
    stream.try_collect().await
}

/// Total rows across `batches`.
pub fn count_rows(batches: &[RecordBatch]) -> usize {
    batches.iter().map(RecordBatch::num_rows).sum()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::{
        array::{Int64Array, StringArray},
        datatypes::{DataType, Field, Schema as ArrowSchema},
    };
    use tempfile::TempDir;

    use super::*;
    use crate::{
        schema::{Column, ColumnType},
        storage::{LocalStorage, ObjectStorage},
    };

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn scans_filter_rows_and_skip_empty_batches() -> TestResult {
        let tmp = TempDir::new()?;
        let storage: StorageRef = Arc::new(LocalStorage::new(tmp.path()));
        let schema = Schema::new(vec![
            Column::new("id", ColumnType::Int64, false),
            Column::new("tag", ColumnType::Utf8, true),
        ])?;

        let mut files = Vec::new();
        for (ids, tag) in [(vec![1i64, 2, 3], "x"), (vec![10, 11], "y")] {
            let n = ids.len();
            let batch = RecordBatch::try_new(
                Arc::new(ArrowSchema::new(vec![
                    Field::new("id", DataType::Int64, false),
                    Field::new("tag", DataType::Utf8, true),
                ])),
                vec![
                    Arc::new(Int64Array::from(ids)),
                    Arc::new(StringArray::from(vec![tag; n])),
                ],
            )?;
            files.extend(writer::write(storage.as_ref(), &[batch], &schema, &[], 1 << 20).await?);
        }

        let all = collect(ParquetEngine.scan(
            Arc::clone(&storage),
            files.clone(),
            schema.clone(),
            None,
        ))
        .await?;
        assert_eq!(count_rows(&all), 5);

        let filtered = collect(ParquetEngine.scan(
            Arc::clone(&storage),
            files.clone(),
            schema.clone(),
            Some(Predicate::gt("id", 2i64)),
        ))
        .await?;
        // The `y` file matches fully, the `x` file only once.
        assert_eq!(count_rows(&filtered), 3);
        assert_eq!(filtered.len(), 2);

        storage.delete(&files[1].path).await?;
        let err = collect(ParquetEngine.scan(storage, files, schema, None))
            .await
            .expect_err("missing file");
        assert!(matches!(err, TableError::FileNotFound { .. }));
        Ok(())
    }
}
