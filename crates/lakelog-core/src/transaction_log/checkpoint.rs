//! Checkpoints: materialized table state at a version.
//!
//! A checkpoint is a pure function of the log prefix it summarizes, so
//! writing it twice (or racing another writer) produces the same bytes. It is
//! an optimization only: losing or failing to parse one never changes what a
//! version means, it just makes replay start further back.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    data_file::DataFile,
    layout::{self, LogEntryKind},
    transaction_log::{
        actions::{Protocol, TableMetadata},
        store::LogStore,
        CommitError, CorruptLogSnafu, SerializeSnafu, StorageSnafu,
    },
};

/// Table state as of `version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Version summarized.
    pub version: u64,
    /// Timestamp of the commit at `version`.
    pub timestamp: DateTime<Utc>,
    /// Protocol in effect.
    pub protocol: Protocol,
    /// Metadata in effect.
    pub metadata: TableMetadata,
    /// Live files, ordered by path.
    pub files: Vec<DataFile>,
}

impl LogStore {
    /// Persist `checkpoint`. Idempotent.
    pub async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CommitError> {
        let version = checkpoint.version;
        let json = serde_json::to_vec(checkpoint).context(SerializeSnafu { version })?;
        self.storage()
            .put(&layout::checkpoint_key(version), Bytes::from(json))
            .await
            .context(StorageSnafu)?;
        Ok(())
    }

    /// Load the checkpoint written at `version`.
    pub async fn read_checkpoint(&self, version: u64) -> Result<Checkpoint, CommitError> {
        let bytes = self
            .storage()
            .get(&layout::checkpoint_key(version))
            .await
            .context(StorageSnafu)?;

        let checkpoint: Checkpoint = serde_json::from_slice(&bytes).map_err(|e| {
            CorruptLogSnafu {
                msg: format!("failed to parse checkpoint {version}: {e}"),
            }
            .build()
        })?;

        ensure!(
            checkpoint.version == version,
            CorruptLogSnafu {
                msg: format!(
                    "checkpoint file for version {version} contains version {}",
                    checkpoint.version
                ),
            }
        );
        Ok(checkpoint)
    }

    /// The newest readable checkpoint at or before `version`.
    ///
    /// Unreadable checkpoints are skipped with a warning and an older one is
    /// tried instead.
    pub async fn latest_checkpoint_at_or_before(
        &self,
        version: u64,
    ) -> Result<Option<Checkpoint>, CommitError> {
        let mut candidates: Vec<u64> = self
            .list_entries()
            .await?
            .into_iter()
            .filter_map(|(kind, _)| match kind {
                LogEntryKind::Checkpoint(v) if v <= version => Some(v),
                _ => None,
            })
            .collect();
        candidates.sort_unstable_by(|a, b| b.cmp(a));

        for candidate in candidates {
            match self.read_checkpoint(candidate).await {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(CommitError::CorruptLog { msg, .. }) => {
                    warn!("ignoring unreadable checkpoint {candidate}: {msg}");
                }
                // Deleted between listing and reading.
                Err(CommitError::Storage { source }) if source.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::{
        config::TableConfig,
        schema::{Column, ColumnType, Schema},
        storage::LocalStorage,
    };

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn checkpoint(version: u64) -> Checkpoint {
        let schema = Schema::new(vec![Column::new("id", ColumnType::Int64, false)])
            .expect("valid schema");
        Checkpoint {
            version,
            timestamp: Utc::now(),
            protocol: Protocol::current(),
            metadata: TableMetadata::new("t", schema, vec![], vec![], TableConfig::default()),
            files: vec![],
        }
    }

    #[tokio::test]
    async fn latest_checkpoint_skips_newer_and_corrupt_entries() -> TestResult {
        let tmp = TempDir::new()?;
        let store = LogStore::new(Arc::new(LocalStorage::new(tmp.path())));

        store.write_checkpoint(&checkpoint(10)).await?;
        store.write_checkpoint(&checkpoint(20)).await?;
        store
            .storage()
            .put(&layout::checkpoint_key(15), Bytes::from_static(b"garbage"))
            .await?;

        let found = store.latest_checkpoint_at_or_before(19).await?;
        assert_eq!(found.map(|c| c.version), Some(10));

        let found = store.latest_checkpoint_at_or_before(25).await?;
        assert_eq!(found.map(|c| c.version), Some(20));

        assert!(store.latest_checkpoint_at_or_before(9).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn rewriting_a_checkpoint_is_idempotent() -> TestResult {
        let tmp = TempDir::new()?;
        let store = LogStore::new(Arc::new(LocalStorage::new(tmp.path())));

        let cp = checkpoint(5);
        store.write_checkpoint(&cp).await?;
        store.write_checkpoint(&cp).await?;
        assert_eq!(store.read_checkpoint(5).await?, cp);
        Ok(())
    }
}
