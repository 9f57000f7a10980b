//! Core engine for an ACID columnar table format.
//!
//! This crate turns a set of immutable Parquet files on plain storage into a
//! transactional table:
//!
//! - An append-only, version-numbered commit log with create-if-absent
//!   semantics as the only synchronization point (`transaction_log` module).
//! - Snapshot resolution from checkpoints plus log replay, with time travel
//!   (`snapshot` module).
//! - An optimistic commit coordinator that rebases non-conflicting commits
//!   and re-plans conflicting ones (`commit` module).
//! - A statistics-annotated Parquet writer, small-file compaction and
//!   retention-aware vacuum (`writer`, `compact`, `vacuum` modules).
//! - The [`Table`] handle and a [`Lake`] catalog of named tables.
//!
//! Storage is abstracted behind [`storage::ObjectStorage`], with local
//! filesystem and `object_store` backends.
#![deny(missing_docs)]
pub mod commit;
pub mod compact;
pub mod config;
pub mod data_file;
pub mod engine;
pub mod error;
pub mod lake;
pub mod layout;
pub mod predicate;
pub mod schema;
pub mod snapshot;
pub mod storage;
pub mod table;
pub mod transaction_log;
pub mod vacuum;
pub mod writer;

pub use compact::{CompactOptions, CompactionMetrics};
pub use config::TableConfig;
pub use data_file::{ColumnStats, DataFile, ScalarValue};
pub use engine::{ExecutionEngine, ParquetEngine, RecordBatchStream};
pub use error::{TableError, TableResult};
pub use lake::{Lake, TableInfo};
pub use predicate::Predicate;
pub use schema::{Column, ColumnType, Schema, TimestampUnit};
pub use snapshot::Snapshot;
pub use storage::{LocalStorage, ObjectStoreStorage, StorageRef, TableLocation};
pub use table::{
    open_table, DeleteMetrics, MergeMetrics, MergeMode, MergeOptions, ReadOptions, Table,
    TableDefinition, TableScan,
};
pub use transaction_log::{CommitInfo, Operation};
pub use vacuum::{VacuumMetrics, VacuumOptions};
