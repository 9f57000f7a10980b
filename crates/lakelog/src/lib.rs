//! # lakelog
//!
//! Embeddable ACID tables over immutable Parquet files.
//!
//! This crate is the supported public entry point and provides a small, stable surface.
//! Every table is a directory (or key prefix) holding `_data/` files and a
//! `_log/` of numbered JSON commits; concurrent writers coordinate through
//! create-if-absent puts alone.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lakelog::prelude::*;
//!
//! # async fn demo(batch: arrow::array::RecordBatch) -> Result<(), TableError> {
//! let schema = Schema::new(vec![Column::new("id", ColumnType::Int64, false)])?;
//! let lake = Lake::open(&TableLocation::local("/tmp/lake"))?;
//! let table = lake
//!     .create_table("events", TableDefinition::new("events", schema).with_primary_keys(["id"]))
//!     .await?;
//! table.append(&[batch]).await?;
//! let rows = table.read(ReadOptions::default()).await?.count_rows().await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// Storage namespace (wrapper-only).
pub mod storage {
    pub use lakelog_core::storage::{
        DeleteOutcome, LocalStorage, ObjectMeta, ObjectStorage, ObjectStoreStorage, PutOutcome,
        StorageError, StorageRef, TableLocation,
    };
}

/// Maintenance namespace: compaction and vacuum.
pub mod maintenance {
    pub use lakelog_core::compact::{CompactOptions, CompactionMetrics};
    pub use lakelog_core::vacuum::{VacuumMetrics, VacuumOptions};
}

pub use lakelog_core::config::TableConfig;
pub use lakelog_core::data_file::{ColumnStats, DataFile, ScalarValue};
pub use lakelog_core::engine::{ExecutionEngine, ParquetEngine, RecordBatchStream};
pub use lakelog_core::error::{TableError, TableResult};
pub use lakelog_core::lake::{Lake, TableInfo};
pub use lakelog_core::predicate::Predicate;
pub use lakelog_core::schema::{
    infer_common_schema, infer_schema, Column, ColumnType, Schema, SchemaRule, TimestampUnit,
};
pub use lakelog_core::snapshot::Snapshot;
pub use lakelog_core::storage::TableLocation;
pub use lakelog_core::table::{
    open_table, DeleteMetrics, MergeMetrics, MergeMode, MergeOptions, ReadOptions, Table,
    TableDefinition, TableScan,
};
pub use lakelog_core::transaction_log::{CommitInfo, Operation};
