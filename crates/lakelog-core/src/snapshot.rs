//! Snapshot resolution: the live-file set of a table at a version.
//!
//! A snapshot is derived, never stored as ground truth. Resolution starts
//! from the newest checkpoint at or before the requested version (or from
//! version 0) and replays every later commit in order. Adds insert into the
//! live set, removes delete from it, metadata and protocol actions replace
//! the current values.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::debug;

use crate::{
    data_file::DataFile,
    error::{
        CorruptLogSnafu, TableError, TableResult, UnsupportedProtocolSnafu, VersionNotFoundSnafu,
    },
    schema::Schema,
    storage::StorageRef,
    transaction_log::{Action, Checkpoint, Commit, LogStore, Protocol, TableMetadata},
};

/// Table state at one version.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: u64,
    timestamp: DateTime<Utc>,
    protocol: Protocol,
    metadata: TableMetadata,
    files: BTreeMap<String, DataFile>,
}

impl Snapshot {
    /// The version this snapshot describes.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Timestamp of the commit at this version.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Protocol in effect.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Metadata in effect.
    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    /// Schema in effect.
    pub fn schema(&self) -> &Schema {
        &self.metadata.schema
    }

    /// Live files, ordered by path.
    pub fn files(&self) -> impl Iterator<Item = &DataFile> {
        self.files.values()
    }

    /// Live file at `path`, if any.
    pub fn file(&self, path: &str) -> Option<&DataFile> {
        self.files.get(path)
    }

    /// Whether `path` is live.
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Number of live files.
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Rows across live files.
    pub fn total_rows(&self) -> u64 {
        self.files.values().map(|f| f.row_count).sum()
    }

    /// Bytes across live files.
    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.size_bytes).sum()
    }

    /// Materialize as a checkpoint.
    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            version: self.version,
            timestamp: self.timestamp,
            protocol: self.protocol,
            metadata: self.metadata.clone(),
            files: self.files.values().cloned().collect(),
        }
    }

    fn from_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            version: checkpoint.version,
            timestamp: checkpoint.timestamp,
            protocol: checkpoint.protocol,
            metadata: checkpoint.metadata,
            files: checkpoint
                .files
                .into_iter()
                .map(|f| (f.path.clone(), f))
                .collect(),
        }
    }

    /// Build the version-0 state from the creation commit.
    fn genesis(commit: &Commit) -> TableResult<Self> {
        let (Some(protocol), Some(metadata)) = (commit.protocol(), commit.metadata()) else {
            return CorruptLogSnafu {
                msg: "version 0 lacks protocol or metadata".to_string(),
            }
            .fail();
        };
        let mut snapshot = Self {
            version: 0,
            timestamp: commit.timestamp,
            protocol: *protocol,
            metadata: metadata.clone(),
            files: BTreeMap::new(),
        };
        snapshot.apply(commit)?;
        Ok(snapshot)
    }

    /// Apply the commit at `self.version + 1` (or the genesis commit).
    pub(crate) fn apply(&mut self, commit: &Commit) -> TableResult<()> {
        for action in &commit.actions {
            match action {
                Action::Add(file) => {
                    self.files.insert(file.path.clone(), file.clone());
                }
                Action::Remove { file, .. } => {
                    if self.files.remove(&file.path).is_none() {
                        return CorruptLogSnafu {
                            msg: format!(
                                "commit {} removes {} which is not live",
                                commit.version, file.path
                            ),
                        }
                        .fail();
                    }
                }
                Action::Metadata(metadata) => self.metadata = metadata.clone(),
                Action::Protocol(protocol) => self.protocol = *protocol,
            }
        }
        self.version = commit.version;
        self.timestamp = commit.timestamp;
        ensure_readable(&self.protocol)
    }
}

fn ensure_readable(protocol: &Protocol) -> TableResult<()> {
    if protocol.readable() {
        Ok(())
    } else {
        UnsupportedProtocolSnafu {
            min_reader_version: protocol.min_reader_version,
            min_writer_version: protocol.min_writer_version,
        }
        .fail()
    }
}

/// Resolves snapshots of one table from its log.
#[derive(Debug, Clone)]
pub struct SnapshotResolver {
    log: LogStore,
}

impl SnapshotResolver {
    /// Resolver over the table stored in `storage`.
    pub fn new(storage: StorageRef) -> Self {
        Self {
            log: LogStore::new(storage),
        }
    }

    /// The underlying log.
    pub fn log(&self) -> &LogStore {
        &self.log
    }

    /// Latest committed version, or `None` for an empty location.
    pub async fn head_version(&self) -> TableResult<Option<u64>> {
        Ok(self.log.head_version().await?)
    }

    /// Resolve the table at its latest version.
    pub async fn resolve_latest(&self) -> TableResult<Snapshot> {
        let Some(head) = self.log.head_version().await? else {
            return VersionNotFoundSnafu {
                version: 0u64,
                available: "none".to_string(),
            }
            .fail();
        };
        self.resolve_bounded(head, head).await
    }

    /// Resolve the table at `version`.
    ///
    /// Fails with `VersionNotFound` if `version` is beyond HEAD or older than
    /// the earliest retained state.
    pub async fn resolve(&self, version: u64) -> TableResult<Snapshot> {
        let Some(head) = self.log.head_version().await? else {
            return VersionNotFoundSnafu {
                version,
                available: "none".to_string(),
            }
            .fail();
        };
        self.resolve_bounded(version, head).await
    }

    async fn resolve_bounded(&self, version: u64, head: u64) -> TableResult<Snapshot> {
        if version > head {
            return VersionNotFoundSnafu {
                version,
                available: format!("up to {head}"),
            }
            .fail();
        }

        let checkpoint = self.log.latest_checkpoint_at_or_before(version).await?;

        let mut snapshot = match checkpoint {
            Some(cp) => {
                debug!("resolving version {version} from checkpoint {}", cp.version);
                let snapshot = Snapshot::from_checkpoint(cp);
                ensure_readable(&snapshot.protocol)?;
                snapshot
            }
            None => {
                let genesis = match self.log.read(0).await {
                    Ok(commit) => commit,
                    Err(crate::transaction_log::CommitError::MissingEntry { .. }) => {
                        let earliest = self.log.earliest_version().await?;
                        return VersionNotFoundSnafu {
                            version,
                            available: match earliest {
                                Some(e) => format!("{e}..={head}"),
                                None => "none".to_string(),
                            },
                        }
                        .fail();
                    }
                    Err(e) => return Err(e.into()),
                };
                Snapshot::genesis(&genesis)?
            }
        };

        if snapshot.version < version {
            for commit in self.log.read_range(snapshot.version + 1, version).await? {
                snapshot.apply(&commit)?;
            }
        }
        Ok(snapshot)
    }

    /// Resolve the latest version committed at or before `timestamp`.
    pub async fn resolve_at_timestamp(&self, timestamp: DateTime<Utc>) -> TableResult<Snapshot> {
        let Some(head) = self.log.head_version().await? else {
            return VersionNotFoundSnafu {
                version: 0u64,
                available: "none".to_string(),
            }
            .fail();
        };
        let earliest = self.log.earliest_version().await?.unwrap_or(0);

        // Commit timestamps are non-decreasing in practice, but clocks of
        // different writers can disagree; walk back from HEAD.
        let mut candidate = None;
        for version in (earliest..=head).rev() {
            let commit = self.log.read(version).await?;
            if commit.timestamp <= timestamp {
                candidate = Some(version);
                break;
            }
        }

        match candidate {
            Some(version) => self.resolve_bounded(version, head).await,
            None => Err(TableError::VersionNotFound {
                version: earliest,
                available: format!("no commit at or before {timestamp}"),
            }),
        }
    }

    /// Commits `from..=to` in order.
    pub async fn commits(&self, from: u64, to: u64) -> TableResult<Vec<Commit>> {
        Ok(self.log.read_range(from, to).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        config::TableConfig,
        schema::{Column, ColumnType},
        storage::LocalStorage,
        transaction_log::Operation,
    };

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn file(path: &str) -> DataFile {
        DataFile {
            path: path.to_string(),
            partition_values: BTreeMap::new(),
            row_count: 1,
            size_bytes: 10,
            stats: BTreeMap::new(),
            schema_version: 0,
            content_hash: String::new(),
            created_version: None,
            created_at: Utc::now(),
        }
    }

    fn commit(version: u64, timestamp: DateTime<Utc>, actions: Vec<Action>) -> Commit {
        Commit {
            version,
            read_version: version.checked_sub(1),
            timestamp,
            operation: Operation::Append,
            predicate: None,
            actions,
        }
    }

    async fn seeded() -> Result<(TempDir, SnapshotResolver, DateTime<Utc>), Box<dyn std::error::Error>>
    {
        let tmp = TempDir::new()?;
        let resolver = SnapshotResolver::new(Arc::new(LocalStorage::new(tmp.path())));
        let schema = Schema::new(vec![Column::new("id", ColumnType::Int64, false)])?;
        let t0 = Utc::now() - Duration::hours(10);

        let log = resolver.log();
        log.append(&Commit {
            operation: Operation::Create,
            ..commit(
                0,
                t0,
                vec![
                    Action::Protocol(Protocol::current()),
                    Action::Metadata(TableMetadata::new(
                        "t",
                        schema,
                        vec![],
                        vec![],
                        TableConfig::default(),
                    )),
                ],
            )
        })
        .await?;
        log.append(&commit(1, t0 + Duration::hours(1), vec![Action::Add(file("a"))]))
            .await?;
        log.append(&commit(2, t0 + Duration::hours(2), vec![Action::Add(file("b"))]))
            .await?;
        log.append(&commit(
            3,
            t0 + Duration::hours(3),
            vec![Action::remove(file("a"))],
        ))
        .await?;
        Ok((tmp, resolver, t0))
    }

    fn paths(s: &Snapshot) -> Vec<&str> {
        s.files().map(|f| f.path.as_str()).collect()
    }

    #[tokio::test]
    async fn replay_applies_adds_and_removes_in_order() -> TestResult {
        let (_tmp, resolver, _) = seeded().await?;

        assert_eq!(paths(&resolver.resolve(0).await?), Vec::<&str>::new());
        assert_eq!(paths(&resolver.resolve(1).await?), vec!["a"]);
        assert_eq!(paths(&resolver.resolve(2).await?), vec!["a", "b"]);
        let latest = resolver.resolve_latest().await?;
        assert_eq!(latest.version(), 3);
        assert_eq!(paths(&latest), vec!["b"]);
        Ok(())
    }

    #[tokio::test]
    async fn checkpoint_replay_matches_full_replay() -> TestResult {
        let (_tmp, resolver, _) = seeded().await?;

        let full = resolver.resolve(2).await?;
        resolver.log().write_checkpoint(&full.to_checkpoint()).await?;

        let via_checkpoint = resolver.resolve(3).await?;
        assert_eq!(paths(&via_checkpoint), vec!["b"]);
        assert_eq!(resolver.resolve(2).await?.to_checkpoint(), full.to_checkpoint());
        Ok(())
    }

    #[tokio::test]
    async fn out_of_range_versions_are_not_found() -> TestResult {
        let (_tmp, resolver, _) = seeded().await?;

        assert!(matches!(
            resolver.resolve(4).await,
            Err(TableError::VersionNotFound { version: 4, .. })
        ));

        // Truncate below 2 after checkpointing it.
        let cp = resolver.resolve(2).await?.to_checkpoint();
        resolver.log().write_checkpoint(&cp).await?;
        resolver.log().delete_entries_before(2).await?;

        assert!(matches!(
            resolver.resolve(1).await,
            Err(TableError::VersionNotFound { version: 1, .. })
        ));
        assert_eq!(paths(&resolver.resolve(2).await?), vec!["a", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn timestamps_resolve_to_latest_prior_commit() -> TestResult {
        let (_tmp, resolver, t0) = seeded().await?;

        let at = resolver
            .resolve_at_timestamp(t0 + Duration::minutes(150))
            .await?;
        assert_eq!(at.version(), 2);

        assert!(resolver
            .resolve_at_timestamp(t0 - Duration::hours(1))
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn removing_a_dead_file_is_corruption() -> TestResult {
        let (_tmp, resolver, t0) = seeded().await?;
        resolver
            .log()
            .append(&commit(4, t0, vec![Action::remove(file("a"))]))
            .await?;

        assert!(matches!(
            resolver.resolve(4).await,
            Err(TableError::CorruptLog { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn newer_reader_protocol_is_rejected() -> TestResult {
        let (_tmp, resolver, t0) = seeded().await?;
        resolver
            .log()
            .append(&commit(
                4,
                t0,
                vec![Action::Protocol(Protocol {
                    min_reader_version: 99,
                    min_writer_version: 99,
                })],
            ))
            .await?;

        assert!(matches!(
            resolver.resolve_latest().await,
            Err(TableError::UnsupportedProtocol { .. })
        ));
        // Older versions stay readable.
        assert_eq!(resolver.resolve(3).await?.version(), 3);
        Ok(())
    }
}
