//! Small-file compaction.
//!
//! Live files below the target size are grouped per partition, bin-packed
//! first-fit decreasing, and every bin of two or more files is rewritten as
//! fewer larger files. The rewrite commits `Remove(inputs) + Add(outputs)`
//! atomically, so pinned readers never see a half-compacted table.

use std::collections::BTreeMap;

use async_trait::async_trait;
use log::{debug, info};

use crate::{
    commit::{CommitCoordinator, ReadScope, StagedCommit, Transaction},
    data_file::DataFile,
    error::{InvalidArgumentSnafu, TableResult},
    snapshot::Snapshot,
    storage::StorageRef,
    transaction_log::{Action, Operation},
    writer,
};

/// Groups items into bins of at most a target weight.
#[derive(Debug, Clone, Copy)]
pub struct ListPacker {
    target_weight: u64,
    lookback: usize,
}

impl ListPacker {
    /// A first-fit packer that considers every open bin.
    pub fn new(target_weight: u64) -> Self {
        Self {
            target_weight,
            lookback: usize::MAX,
        }
    }

    /// A packer that only considers the last `lookback` bins.
    pub fn with_lookback(target_weight: u64, lookback: usize) -> Self {
        Self {
            target_weight,
            lookback: lookback.max(1),
        }
    }

    /// Pack `items` first-fit decreasing by `weight_fn`.
    ///
    /// An item heavier than the target gets a bin of its own.
    pub fn pack<T, F>(&self, items: impl IntoIterator<Item = T>, weight_fn: F) -> Vec<Vec<T>>
    where
        F: Fn(&T) -> u64,
    {
        let mut items: Vec<(T, u64)> = items
            .into_iter()
            .map(|item| {
                let weight = weight_fn(&item);
                (item, weight)
            })
            .collect();
        items.sort_by(|a, b| b.1.cmp(&a.1));

        let mut bins: Vec<(Vec<T>, u64)> = Vec::new();
        for (item, weight) in items {
            let start = bins.len().saturating_sub(self.lookback);
            let fit = bins[start..]
                .iter()
                .position(|bin| bin.1.saturating_add(weight) <= self.target_weight)
                .map(|i| i + start);

            match fit {
                Some(idx) => {
                    bins[idx].0.push(item);
                    bins[idx].1 += weight;
                }
                None => bins.push((vec![item], weight)),
            }
        }

        bins.into_iter().map(|(items, _)| items).collect()
    }
}

/// Options for [`compact`].
#[derive(Debug, Clone, Default)]
pub struct CompactOptions {
    /// Only compact the partition with these values. Every key must be a
    /// partition column; missing partition columns match any value.
    pub partition: Option<BTreeMap<String, Option<String>>>,
    /// Override the table's target file size.
    pub target_file_size: Option<u64>,
}

impl CompactOptions {
    /// Restrict compaction to one partition.
    pub fn with_partition(
        mut self,
        values: impl IntoIterator<Item = (String, Option<String>)>,
    ) -> Self {
        self.partition = Some(values.into_iter().collect());
        self
    }

    /// Override the target file size.
    pub fn with_target_file_size(mut self, bytes: u64) -> Self {
        self.target_file_size = Some(bytes);
        self
    }
}

/// Outcome of a compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionMetrics {
    /// Version of the compaction commit, `None` if there was nothing to do.
    pub version: Option<u64>,
    /// Files removed.
    pub files_removed: u64,
    /// Files added.
    pub files_added: u64,
    /// Bytes of the removed files.
    pub bytes_removed: u64,
    /// Bytes of the added files.
    pub bytes_added: u64,
    /// Rows rewritten.
    pub rows_rewritten: u64,
}

/// Pick the bins to rewrite: per partition, files below `target`, packed, and
/// only bins holding at least two files.
pub fn plan(
    snapshot: &Snapshot,
    options: &CompactOptions,
    target: u64,
) -> TableResult<Vec<Vec<DataFile>>> {
    let partition_columns = &snapshot.metadata().partition_columns;
    if let Some(filter) = &options.partition {
        if let Some(unknown) = filter.keys().find(|k| !partition_columns.contains(k)) {
            return InvalidArgumentSnafu {
                msg: format!("{unknown} is not a partition column"),
            }
            .fail();
        }
    }

    let mut by_partition: BTreeMap<&BTreeMap<String, Option<String>>, Vec<&DataFile>> =
        BTreeMap::new();
    for file in snapshot.files() {
        if file.size_bytes >= target {
            continue;
        }
        let selected = options.partition.as_ref().is_none_or(|filter| {
            filter
                .iter()
                .all(|(col, value)| file.partition_value(col) == Some(value.as_deref()))
        });
        if selected {
            by_partition
                .entry(&file.partition_values)
                .or_default()
                .push(file);
        }
    }

    let packer = ListPacker::new(target);
    let mut bins = Vec::new();
    for (values, files) in by_partition {
        let packed = packer.pack(files, |f| f.size_bytes);
        let before = bins.len();
        bins.extend(
            packed
                .into_iter()
                .filter(|bin| bin.len() > 1)
                .map(|bin| bin.into_iter().cloned().collect::<Vec<_>>()),
        );
        debug!(
            "partition {values:?}: {} bin(s) to rewrite",
            bins.len() - before
        );
    }
    Ok(bins)
}

struct CompactTransaction {
    storage: StorageRef,
    options: CompactOptions,
}

#[async_trait]
impl Transaction for CompactTransaction {
    async fn stage(&self, snapshot: &Snapshot) -> TableResult<StagedCommit> {
        let metadata = snapshot.metadata();
        let target = self
            .options
            .target_file_size
            .unwrap_or(metadata.config.target_file_size);
        let schema = snapshot.schema();

        let mut staged = StagedCommit {
            read_scope: ReadScope::Blind,
            write_schema: Some(schema.clone()),
            ..StagedCommit::new(Operation::Compact)
        };

        for bin in plan(snapshot, &self.options, target)? {
            let mut batches = Vec::new();
            for file in &bin {
                batches.extend(writer::read_data_file(self.storage.as_ref(), file, schema).await?);
            }
            let written = writer::write(
                self.storage.as_ref(),
                &batches,
                schema,
                &metadata.partition_columns,
                target,
            )
            .await?;

            for file in bin {
                staged.files_read.insert(file.path.clone());
                staged.actions.push(Action::remove(file));
            }
            staged.actions.extend(written.into_iter().map(Action::Add));
        }
        Ok(staged)
    }
}

/// Compact the table behind `coordinator`.
pub async fn compact(
    coordinator: &CommitCoordinator,
    storage: StorageRef,
    options: CompactOptions,
) -> TableResult<CompactionMetrics> {
    let txn = CompactTransaction { storage, options };
    let Some(commit) = coordinator.commit(&txn).await? else {
        debug!("compaction found nothing to rewrite");
        return Ok(CompactionMetrics::default());
    };

    let metrics = CompactionMetrics {
        version: Some(commit.version),
        files_removed: commit.removed_files().count() as u64,
        files_added: commit.added_files().count() as u64,
        bytes_removed: commit.removed_files().map(|f| f.size_bytes).sum(),
        bytes_added: commit.added_files().map(|f| f.size_bytes).sum(),
        rows_rewritten: commit.added_files().map(|f| f.row_count).sum(),
    };
    info!(
        "compacted {} file(s) into {} at version {}",
        metrics.files_removed, metrics.files_added, commit.version
    );
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packer_respects_target_weight() {
        let packer = ListPacker::new(100);
        let bins = packer.pack(vec![30u64, 40, 50, 20, 10], |&x| x);

        for bin in &bins {
            assert!(bin.iter().sum::<u64>() <= 100);
        }
        assert_eq!(bins.iter().map(Vec::len).sum::<usize>(), 5);
        assert_eq!(bins.len(), 2);
    }

    #[test]
    fn oversized_items_get_their_own_bin() {
        let packer = ListPacker::new(100);
        let bins = packer.pack(vec![150u64, 10], |&x| x);
        assert_eq!(bins, vec![vec![150], vec![10]]);
    }

    #[test]
    fn lookback_limits_candidate_bins() {
        // 60 and 50 open two bins; with lookback 1 the 40 can only try the
        // last bin (50), with full first-fit it lands next to 60.
        let items = vec![60u64, 50, 40];
        let narrow = ListPacker::with_lookback(100, 1).pack(items.clone(), |&x| x);
        assert_eq!(narrow, vec![vec![60], vec![50, 40]]);

        let full = ListPacker::new(100).pack(items, |&x| x);
        assert_eq!(full, vec![vec![60, 40], vec![50]]);
    }
}
