//! Commit coordinator: optimistic concurrency over the log.
//!
//! A [`Transaction`] stages its actions against a snapshot. The coordinator
//! then tries to create the next log entry. When another writer wins that
//! version, the winning commits are checked against what the transaction
//! read and wrote:
//!
//! - no overlap: the same actions are rebased onto the new HEAD and retried;
//! - overlap: the transaction is re-staged against a fresh snapshot.
//!
//! Both paths count against `max_commit_attempts`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};

use crate::{
    error::{
        ConcurrentModificationSnafu, InvalidArgumentSnafu, PreconditionFailedSnafu, TableResult,
        UnsupportedProtocolSnafu,
    },
    predicate::Predicate,
    schema::{self, Schema},
    snapshot::{Snapshot, SnapshotResolver},
    storage::StorageRef,
    transaction_log::{Action, AppendOutcome, Commit, LogStore, Operation},
};

/// What a staged commit depends on.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadScope {
    /// Depends on nothing beyond the files it removes (appends, compaction).
    Blind,
    /// Depends on every row matching the predicate.
    Predicate(Predicate),
    /// Depends on the whole table.
    Table,
}

/// A candidate commit computed against one snapshot.
#[derive(Debug, Clone)]
pub struct StagedCommit {
    /// Operation tag.
    pub operation: Operation,
    /// Ordered actions.
    pub actions: Vec<Action>,
    /// Predicate recorded for audit.
    pub predicate: Option<String>,
    /// Rows the commit depends on.
    pub read_scope: ReadScope,
    /// Paths of live files the commit read.
    pub files_read: BTreeSet<String>,
    /// Schema the added files were written with, if any were.
    pub write_schema: Option<Schema>,
}

impl StagedCommit {
    /// An empty commit for `operation`.
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            actions: Vec::new(),
            predicate: None,
            read_scope: ReadScope::Blind,
            files_read: BTreeSet::new(),
            write_schema: None,
        }
    }

    /// Whether there is nothing to commit.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    fn removed_paths(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().filter_map(|a| match a {
            Action::Remove { file, .. } => Some(file.path.as_str()),
            _ => None,
        })
    }

    fn changes_metadata(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, Action::Metadata(_)))
    }

    fn adds_files(&self) -> bool {
        self.actions.iter().any(|a| matches!(a, Action::Add(_)))
    }
}

/// A logical operation that can be (re-)planned against a snapshot.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Compute the actions of this operation against `snapshot`.
    ///
    /// Called again after a conflicting concurrent commit. Files written by
    /// an earlier call are left behind as orphans.
    async fn stage(&self, snapshot: &Snapshot) -> TableResult<StagedCommit>;
}

/// Runs transactions against one table.
#[derive(Debug, Clone)]
pub struct CommitCoordinator {
    resolver: SnapshotResolver,
}

impl CommitCoordinator {
    /// Coordinator over the table stored in `storage`.
    pub fn new(storage: StorageRef) -> Self {
        Self {
            resolver: SnapshotResolver::new(storage),
        }
    }

    /// The resolver used to read snapshots.
    pub fn resolver(&self) -> &SnapshotResolver {
        &self.resolver
    }

    fn log(&self) -> &LogStore {
        self.resolver.log()
    }

    /// Stage and commit `txn`.
    ///
    /// Returns the landed commit, or `None` when the transaction staged no
    /// actions.
    pub async fn commit<T: Transaction + ?Sized>(&self, txn: &T) -> TableResult<Option<Commit>> {
        let mut snapshot = self.resolver.resolve_latest().await?;
        let max_attempts = snapshot.metadata().config.max_commit_attempts.max(1);

        let mut staged = self.stage(txn, &snapshot).await?;
        if staged.is_empty() {
            return Ok(None);
        }

        let mut base = snapshot.version();
        let mut last_precondition: Option<String> = None;

        for attempt in 1..=max_attempts {
            let commit = build_commit(&staged, snapshot.version(), base + 1);
            debug!(
                "commit attempt {attempt}/{max_attempts}: {} at version {}",
                staged.operation, commit.version
            );

            match self.log().append(&commit).await? {
                AppendOutcome::Committed => {
                    info!(
                        "committed {} at version {} ({} action(s), attempt {attempt})",
                        commit.operation,
                        commit.version,
                        commit.actions.len()
                    );
                    self.maybe_checkpoint(&snapshot, &commit).await;
                    return Ok(Some(commit));
                }
                AppendOutcome::AlreadyExists => {}
            }

            if attempt == max_attempts {
                break;
            }

            let head = self
                .log()
                .head_version()
                .await?
                .unwrap_or(commit.version)
                .max(commit.version);
            let winners = self.log().read_range(base + 1, head).await?;

            match check_conflicts(&staged, &snapshot, &winners) {
                None => {
                    debug!(
                        "lost version {} to a concurrent writer, rebasing onto {head}",
                        commit.version
                    );
                    last_precondition = None;
                    base = head;
                }
                Some(reason) => {
                    warn!(
                        "{} conflicts with a concurrent commit ({reason}), re-staging",
                        staged.operation
                    );
                    last_precondition = Some(reason);
                    snapshot = self.resolver.resolve(head).await?;
                    staged = self.stage(txn, &snapshot).await?;
                    if staged.is_empty() {
                        return Ok(None);
                    }
                    base = head;
                }
            }
        }

        match last_precondition {
            Some(reason) => PreconditionFailedSnafu {
                attempts: max_attempts,
                reason,
            }
            .fail(),
            None => ConcurrentModificationSnafu {
                attempts: max_attempts,
            }
            .fail(),
        }
    }

    async fn stage<T: Transaction + ?Sized>(
        &self,
        txn: &T,
        snapshot: &Snapshot,
    ) -> TableResult<StagedCommit> {
        let protocol = snapshot.protocol();
        if !protocol.writable() {
            return UnsupportedProtocolSnafu {
                min_reader_version: protocol.min_reader_version,
                min_writer_version: protocol.min_writer_version,
            }
            .fail();
        }

        let staged = txn.stage(snapshot).await?;
        if let Some(path) = staged.removed_paths().find(|p| !snapshot.contains(p)) {
            return InvalidArgumentSnafu {
                msg: format!(
                    "staged removal of {path}, which is not live at version {}",
                    snapshot.version()
                ),
            }
            .fail();
        }
        Ok(staged)
    }

    /// Write a checkpoint when `commit` lands on the interval. Failures are
    /// logged and otherwise ignored.
    async fn maybe_checkpoint(&self, snapshot: &Snapshot, commit: &Commit) {
        let interval = commit
            .metadata()
            .unwrap_or_else(|| snapshot.metadata())
            .config
            .checkpoint_interval;
        if interval == 0 || commit.version % interval != 0 {
            return;
        }

        let result = match self.resolver.resolve(commit.version).await {
            Ok(state) => self
                .log()
                .write_checkpoint(&state.to_checkpoint())
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => debug!("wrote checkpoint at version {}", commit.version),
            Err(e) => warn!("checkpoint at version {} failed: {e}", commit.version),
        }
    }
}

fn build_commit(staged: &StagedCommit, read_version: u64, version: u64) -> Commit {
    let actions = staged
        .actions
        .iter()
        .cloned()
        .map(|action| match action {
            Action::Add(mut file) => {
                file.created_version = Some(version);
                Action::Add(file)
            }
            other => other,
        })
        .collect();

    Commit {
        version,
        read_version: Some(read_version),
        timestamp: Utc::now(),
        operation: staged.operation,
        predicate: staged.predicate.clone(),
        actions,
    }
}

/// The first reason `staged` cannot be rebased past `winners`, if any.
fn check_conflicts(
    staged: &StagedCommit,
    snapshot: &Snapshot,
    winners: &[Commit],
) -> Option<String> {
    let removing: BTreeSet<&str> = staged.removed_paths().collect();
    let schema = snapshot.schema();

    for winner in winners {
        let v = winner.version;

        if winner.protocol().is_some() {
            return Some(format!("protocol changed at version {v}"));
        }

        for file in winner.removed_files() {
            if removing.contains(file.path.as_str()) {
                return Some(format!("{} was removed at version {v}", file.path));
            }
            if staged.files_read.contains(&file.path) {
                return Some(format!("{} was read but removed at version {v}", file.path));
            }
        }

        match &staged.read_scope {
            ReadScope::Blind => {}
            ReadScope::Table => {
                if let Some(file) = winner.added_files().next() {
                    return Some(format!("{} was added at version {v}", file.path));
                }
            }
            ReadScope::Predicate(predicate) => {
                if let Some(file) = winner
                    .added_files()
                    .find(|f| predicate.may_match(f, schema))
                {
                    return Some(format!(
                        "{} added at version {v} may match {predicate}",
                        file.path
                    ));
                }
            }
        }

        if let Some(metadata) = winner.metadata() {
            if staged.changes_metadata() {
                return Some(format!("metadata changed at version {v}"));
            }
            if metadata.partition_columns != snapshot.metadata().partition_columns {
                return Some(format!("partitioning changed at version {v}"));
            }
            if staged.adds_files()
                && !still_compatible(staged.write_schema.as_ref(), &metadata.schema)
            {
                return Some(format!(
                    "schema changed at version {v} to {}",
                    metadata.schema
                ));
            }
        }
    }
    None
}

/// Whether files written with `written` can be added under `current` without
/// changing it.
fn still_compatible(written: Option<&Schema>, current: &Schema) -> bool {
    let Some(written) = written else {
        return false;
    };
    match schema::validate(current, &written.to_arrow_schema()) {
        Ok(merged) => merged.same_columns(current),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
    };

    use tempfile::TempDir;

    use super::*;
    use crate::{
        config::TableConfig,
        data_file::DataFile,
        error::TableError,
        layout,
        schema::{Column, ColumnType},
        storage::LocalStorage,
        transaction_log::{Protocol, TableMetadata},
    };

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    type StageFn = Box<dyn Fn(&Snapshot) -> StagedCommit + Send + Sync>;
    type WinnerFn = Box<dyn Fn(u64) -> Vec<Action> + Send + Sync>;

    fn file(path: &str, part: &str) -> DataFile {
        DataFile {
            path: path.to_string(),
            partition_values: BTreeMap::from([("p".to_string(), Some(part.to_string()))]),
            row_count: 1,
            size_bytes: 1,
            stats: BTreeMap::new(),
            schema_version: 0,
            content_hash: String::new(),
            created_version: None,
            created_at: Utc::now(),
        }
    }

    async fn create(
        config: TableConfig,
    ) -> Result<(TempDir, CommitCoordinator), Box<dyn std::error::Error>> {
        let tmp = TempDir::new()?;
        let coordinator = CommitCoordinator::new(Arc::new(LocalStorage::new(tmp.path())));
        let schema = Schema::new(vec![
            Column::new("p", ColumnType::Utf8, false),
            Column::new("x", ColumnType::Int64, true),
        ])?;
        coordinator
            .log()
            .append(&Commit {
                version: 0,
                read_version: None,
                timestamp: Utc::now(),
                operation: Operation::Create,
                predicate: None,
                actions: vec![
                    Action::Protocol(Protocol::current()),
                    Action::Metadata(TableMetadata::new(
                        "t",
                        schema,
                        vec!["p".to_string()],
                        vec![],
                        config,
                    )),
                ],
            })
            .await?;
        Ok((tmp, coordinator))
    }

    /// Stages with `staged`. While `races_left` is positive, every stage call
    /// also lands `winner` at the next version, as if another process got
    /// there first.
    struct Racing {
        log: LogStore,
        staged: StageFn,
        winner: WinnerFn,
        races_left: AtomicU32,
        calls: AtomicU32,
    }

    impl Racing {
        fn new(
            coordinator: &CommitCoordinator,
            races: u32,
            staged: impl Fn(&Snapshot) -> StagedCommit + Send + Sync + 'static,
            winner: impl Fn(u64) -> Vec<Action> + Send + Sync + 'static,
        ) -> Self {
            Self {
                log: coordinator.log().clone(),
                staged: Box::new(staged),
                winner: Box::new(winner),
                races_left: AtomicU32::new(races),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transaction for Racing {
        async fn stage(&self, snapshot: &Snapshot) -> TableResult<StagedCommit> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let staged = (self.staged)(snapshot);

            if self.races_left.load(Ordering::SeqCst) > 0 {
                self.races_left.fetch_sub(1, Ordering::SeqCst);
                let next = snapshot.version() + 1;
                self.log
                    .append(&Commit {
                        version: next,
                        read_version: Some(snapshot.version()),
                        timestamp: Utc::now(),
                        operation: Operation::Append,
                        predicate: None,
                        actions: (self.winner)(next),
                    })
                    .await?;
            }
            Ok(staged)
        }
    }

    fn append_of(
        path: &'static str,
        part: &'static str,
    ) -> impl Fn(&Snapshot) -> StagedCommit + Send + Sync + 'static {
        move |snapshot: &Snapshot| StagedCommit {
            actions: vec![Action::Add(file(path, part))],
            write_schema: Some(snapshot.schema().clone()),
            ..StagedCommit::new(Operation::Append)
        }
    }

    fn scoped_append(
        path: &'static str,
        part: &'static str,
        scope: ReadScope,
    ) -> impl Fn(&Snapshot) -> StagedCommit + Send + Sync + 'static {
        move |snapshot: &Snapshot| StagedCommit {
            read_scope: scope.clone(),
            ..append_of(path, part)(snapshot)
        }
    }

    fn theirs_in(part: &'static str) -> impl Fn(u64) -> Vec<Action> + Send + Sync + 'static {
        move |v| vec![Action::Add(file(&format!("theirs-{v}"), part))]
    }

    #[tokio::test]
    async fn blind_append_rebases_past_a_concurrent_append() -> TestResult {
        let (_tmp, coordinator) = create(TableConfig::default()).await?;
        let txn = Racing::new(&coordinator, 1, append_of("mine", "a"), theirs_in("a"));

        let landed = coordinator.commit(&txn).await?.expect("commit");
        assert_eq!(landed.version, 2);
        assert_eq!(landed.read_version, Some(0));
        assert_eq!(txn.calls(), 1);

        let added: Vec<_> = landed.added_files().collect();
        assert_eq!(added[0].created_version, Some(2));

        let head = coordinator.resolver().resolve_latest().await?;
        assert_eq!(head.num_files(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn predicate_scope_only_conflicts_with_matching_partitions() -> TestResult {
        let (_tmp, coordinator) = create(TableConfig::default()).await?;

        // Concurrent append lands in partition `a` while we read `b`.
        let txn = Racing::new(
            &coordinator,
            1,
            scoped_append("mine-b", "b", ReadScope::Predicate(Predicate::eq("p", "b"))),
            theirs_in("a"),
        );
        assert_eq!(coordinator.commit(&txn).await?.map(|c| c.version), Some(2));
        assert_eq!(txn.calls(), 1);

        // Same partition: re-staged against the new HEAD.
        let txn = Racing::new(
            &coordinator,
            1,
            scoped_append("mine-a", "a", ReadScope::Predicate(Predicate::eq("p", "a"))),
            theirs_in("a"),
        );
        let landed = coordinator.commit(&txn).await?.expect("commit");
        assert_eq!(txn.calls(), 2);
        assert_eq!(landed.version, 4);
        assert_eq!(landed.read_version, Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn removing_a_concurrently_removed_file_restages() -> TestResult {
        let (_tmp, coordinator) = create(TableConfig::default()).await?;
        coordinator
            .commit(&Racing::new(&coordinator, 0, append_of("victim", "a"), theirs_in("a")))
            .await?;

        let delete = |snapshot: &Snapshot| match snapshot.file("victim") {
            Some(f) => StagedCommit {
                actions: vec![Action::remove(f.clone())],
                read_scope: ReadScope::Predicate(Predicate::eq("p", "a")),
                files_read: BTreeSet::from(["victim".to_string()]),
                ..StagedCommit::new(Operation::Delete)
            },
            None => StagedCommit::new(Operation::Delete),
        };
        let txn = Racing::new(&coordinator, 1, delete, |_| {
            vec![Action::remove(file("victim", "a"))]
        });

        // The re-staged delete finds nothing left to do.
        assert!(coordinator.commit(&txn).await?.is_none());
        assert_eq!(txn.calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn exhausting_attempts_reports_the_last_failure() -> TestResult {
        let config = TableConfig::default().with_max_commit_attempts(3);
        let (_tmp, coordinator) = create(config).await?;

        // Whole-table scope: every concurrent append forces a re-stage, and
        // every re-stage loses another race.
        let txn = Racing::new(
            &coordinator,
            u32::MAX,
            scoped_append("mine", "a", ReadScope::Table),
            theirs_in("a"),
        );

        let err = coordinator.commit(&txn).await.expect_err("must give up");
        assert!(matches!(err, TableError::PreconditionFailed { attempts: 3, .. }));
        assert_eq!(txn.calls(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn lost_race_on_the_last_attempt_is_a_concurrent_modification() -> TestResult {
        let config = TableConfig::default().with_max_commit_attempts(1);
        let (_tmp, coordinator) = create(config).await?;

        let txn = Racing::new(&coordinator, 1, append_of("mine", "a"), theirs_in("a"));
        let err = coordinator.commit(&txn).await.expect_err("must give up");
        assert!(matches!(err, TableError::ConcurrentModification { attempts: 1 }));

        // The winner is intact and nothing of ours landed.
        let head = coordinator.resolver().resolve_latest().await?;
        assert_eq!(head.version(), 1);
        assert!(!head.contains("mine"));
        Ok(())
    }

    #[tokio::test]
    async fn checkpoint_written_on_interval() -> TestResult {
        let (_tmp, coordinator) =
            create(TableConfig::default().with_checkpoint_interval(2)).await?;

        for (i, path) in ["f1", "f2"].into_iter().enumerate() {
            let txn = Racing::new(&coordinator, 0, append_of(path, "a"), theirs_in("a"));
            let landed = coordinator.commit(&txn).await?.expect("commit");
            assert_eq!(landed.version, i as u64 + 1);
        }

        let checkpoint = coordinator.log().read_checkpoint(2).await?;
        assert_eq!(checkpoint.files.len(), 2);
        assert!(coordinator
            .log()
            .storage()
            .get(&layout::checkpoint_key(1))
            .await
            .is_err());
        Ok(())
    }
}
