//! Wrapper prelude.
//!
//! The `lakelog` crate is the supported public entry point.
//! Downstream code should prefer importing from this prelude instead of
//! depending on `lakelog-core` module paths.

pub use crate::maintenance::{CompactOptions, CompactionMetrics, VacuumMetrics, VacuumOptions};
pub use crate::{
    open_table, Column, ColumnType, CommitInfo, DeleteMetrics, Lake, MergeMetrics, MergeMode,
    MergeOptions, Operation, Predicate, ReadOptions, Schema, Table, TableConfig,
    TableDefinition, TableError, TableInfo, TableLocation, TableResult, TableScan,
};
