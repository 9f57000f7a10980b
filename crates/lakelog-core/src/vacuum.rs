//! Retention-aware garbage collection.
//!
//! Vacuum never deletes a file reachable from a version inside the retention
//! window. The oldest retained version `r` is the version that was current at
//! the horizon (`now - retention`). Everything live at `r`, plus everything
//! added after it, is kept. Unreferenced objects younger than the horizon are
//! kept too: they may belong to a writer that has staged but not yet
//! committed.
//!
//! Once the data files are gone the log is truncated: a checkpoint is written
//! at `r` and every entry below it is deleted.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

use crate::{
    error::{RetentionTooShortSnafu, TableResult},
    layout,
    snapshot::SnapshotResolver,
    storage::DeleteOutcome,
};

/// Options for [`vacuum`].
#[derive(Debug, Clone, Default)]
pub struct VacuumOptions {
    /// Retention window in hours. Defaults to the table's minimum retention.
    pub retention_hours: Option<u64>,
    /// Override the table's `enforce_retention_duration`.
    pub enforce_retention_duration: Option<bool>,
    /// Report what would be deleted without deleting anything.
    pub dry_run: bool,
}

impl VacuumOptions {
    /// Keep `hours` of history.
    pub fn retain_hours(hours: u64) -> Self {
        Self {
            retention_hours: Some(hours),
            ..Self::default()
        }
    }

    /// Only report.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Override retention enforcement.
    pub fn with_enforce_retention_duration(mut self, enforce: bool) -> Self {
        self.enforce_retention_duration = Some(enforce);
        self
    }
}

/// Outcome of a vacuum run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacuumMetrics {
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// Oldest version still resolvable afterwards.
    pub retained_version: u64,
    /// Data objects deleted (or that would be, on a dry run).
    pub files_deleted: Vec<String>,
    /// Bytes of those objects.
    pub bytes_deleted: u64,
    /// Data objects kept.
    pub files_retained: usize,
    /// Log entries deleted.
    pub log_entries_deleted: usize,
}

/// Vacuum the table behind `resolver`.
pub async fn vacuum(
    resolver: &SnapshotResolver,
    options: &VacuumOptions,
) -> TableResult<VacuumMetrics> {
    vacuum_at(resolver, options, Utc::now()).await
}

pub(crate) async fn vacuum_at(
    resolver: &SnapshotResolver,
    options: &VacuumOptions,
    now: DateTime<Utc>,
) -> TableResult<VacuumMetrics> {
    let latest = resolver.resolve_latest().await?;
    let config = &latest.metadata().config;

    let retention_hours = options
        .retention_hours
        .unwrap_or(config.min_vacuum_retention_hours);
    let enforce = options
        .enforce_retention_duration
        .unwrap_or(config.enforce_retention_duration);
    if enforce && retention_hours < config.min_vacuum_retention_hours {
        return RetentionTooShortSnafu {
            requested_hours: retention_hours,
            minimum_hours: config.min_vacuum_retention_hours,
        }
        .fail();
    }

    let horizon = i64::try_from(retention_hours)
        .ok()
        .and_then(Duration::try_hours)
        .and_then(|retention| now.checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let head = latest.version();
    let retained_version = retained_version(resolver, head, horizon).await?;
    debug!("vacuum horizon {horizon}, retaining versions {retained_version}..={head}");

    let retained = resolver.resolve(retained_version).await?;
    let mut reachable = Reachable {
        head: retained_version,
        keep: retained.files().map(|f| f.path.clone()).collect(),
    };
    reachable.catch_up(resolver).await?;

    let storage = resolver.log().storage();
    let objects = storage.list(&layout::data_prefix()).await?;
    // Commits landing while the listing ran may reference listed objects.
    reachable.catch_up(resolver).await?;

    let mut files_deleted = Vec::new();
    let mut bytes_deleted = 0;
    let mut files_retained = 0;
    for object in objects {
        if object.last_modified > horizon {
            files_retained += 1;
            continue;
        }
        if !options.dry_run {
            reachable.catch_up(resolver).await?;
        }
        if reachable.keep.contains(&object.key) {
            files_retained += 1;
            continue;
        }
        if !options.dry_run {
            match storage.delete(&object.key).await? {
                DeleteOutcome::Deleted => {}
                DeleteOutcome::NotFound => continue,
            }
        }
        bytes_deleted += object.size;
        files_deleted.push(object.key);
    }

    let mut log_entries_deleted = 0;
    if !options.dry_run && retained_version > 0 {
        let log = resolver.log();
        log.write_checkpoint(&retained.to_checkpoint()).await?;
        log_entries_deleted = log.delete_entries_before(retained_version).await?;
    }

    info!(
        "vacuum{}: {} data file(s) ({bytes_deleted} bytes), {log_entries_deleted} log entries, oldest version {retained_version}",
        if options.dry_run { " (dry run)" } else { "" },
        files_deleted.len(),
    );

    Ok(VacuumMetrics {
        dry_run: options.dry_run,
        retained_version,
        files_deleted,
        bytes_deleted,
        files_retained,
        log_entries_deleted,
    })
}

/// Files reachable from the retained version or any commit after it, up to
/// `head`.
struct Reachable {
    head: u64,
    keep: BTreeSet<String>,
}

impl Reachable {
    /// Extend `keep` with the files added by commits newer than `head`.
    async fn catch_up(&mut self, resolver: &SnapshotResolver) -> TableResult<()> {
        let Some(latest) = resolver.log().head_version().await? else {
            return Ok(());
        };
        if latest > self.head {
            for commit in resolver.commits(self.head + 1, latest).await? {
                self.keep.extend(commit.added_files().map(|f| f.path.clone()));
            }
            debug!("vacuum caught up from version {} to {latest}", self.head);
            self.head = latest;
        }
        Ok(())
    }
}

/// The version current at `horizon`, or the earliest resolvable version if
/// every commit is younger.
async fn retained_version(
    resolver: &SnapshotResolver,
    head: u64,
    horizon: DateTime<Utc>,
) -> TableResult<u64> {
    let log = resolver.log();
    let earliest = log.earliest_version().await?.unwrap_or(head);

    for version in (earliest..=head).rev() {
        if log.read(version).await?.timestamp <= horizon {
            return Ok(version);
        }
    }
    Ok(earliest)
}
