//! Async helpers for persisting and reading the log.
//!
//! This module owns all storage interactions with `_log/`:
//! - Creating zero-padded commit entries with create-if-absent semantics so
//!   each version is created exactly once.
//! - Locating HEAD through a soft, process-wide version hint that is always
//!   re-validated against storage.
//! - Mapping storage-layer failures into [`CommitError`] variants so callers
//!   can differentiate between missing entries, storage errors, and corrupt
//!   state.

use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
};

use bytes::Bytes;
use log::debug;
use snafu::prelude::*;

use crate::{
    layout::{self, LogEntryKind},
    transaction_log::{
        actions::Commit, CommitError, CorruptLogSnafu, MissingEntrySnafu, SerializeSnafu,
        StorageSnafu,
    },
    storage::{ObjectMeta, PutOutcome, StorageError, StorageRef},
};

/// Outcome of appending a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The entry was created; the commit is durable.
    Committed,
    /// Another writer already created this version.
    AlreadyExists,
}

/// Last known HEAD per table URI. Never authoritative.
fn version_hints() -> &'static Mutex<HashMap<String, u64>> {
    static HINTS: OnceLock<Mutex<HashMap<String, u64>>> = OnceLock::new();
    HINTS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn read_hint(uri: &str) -> Option<u64> {
    version_hints().lock().ok()?.get(uri).copied()
}

fn write_hint(uri: &str, version: u64, only_forward: bool) {
    if let Ok(mut hints) = version_hints().lock() {
        let entry = hints.entry(uri.to_string()).or_insert(version);
        if !only_forward || version > *entry {
            *entry = version;
        }
    }
}

fn forget_hint(uri: &str) {
    if let Ok(mut hints) = version_hints().lock() {
        hints.remove(uri);
    }
}

/// Reader/writer for the `_log/` directory of one table.
#[derive(Debug, Clone)]
pub struct LogStore {
    storage: StorageRef,
}

impl LogStore {
    /// Create a log store over the table's storage.
    pub fn new(storage: StorageRef) -> Self {
        Self { storage }
    }

    /// The table storage this log lives in.
    pub fn storage(&self) -> &StorageRef {
        &self.storage
    }

    /// Attempt to create the entry for `commit.version`.
    ///
    /// This is the only synchronization point between writers: exactly one
    /// caller can create a given version.
    pub async fn append(&self, commit: &Commit) -> Result<AppendOutcome, CommitError> {
        let version = commit.version;
        let json = serde_json::to_vec(commit).context(SerializeSnafu { version })?;

        let outcome = self
            .storage
            .put_if_absent(&layout::commit_key(version), Bytes::from(json))
            .await
            .context(StorageSnafu)?;

        match outcome {
            PutOutcome::Created => {
                write_hint(&self.storage.uri(), version, true);
                Ok(AppendOutcome::Committed)
            }
            PutOutcome::AlreadyExists => Ok(AppendOutcome::AlreadyExists),
        }
    }

    /// Load a single commit by version.
    ///
    /// - A missing entry returns `CommitError::MissingEntry`.
    /// - On other storage-layer failures, returns `CommitError::Storage`.
    /// - On JSON parse failures or a version mismatch, returns
    ///   `CommitError::CorruptLog`.
    pub async fn read(&self, version: u64) -> Result<Commit, CommitError> {
        let bytes = match self.storage.get(&layout::commit_key(version)).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound { .. }) => return MissingEntrySnafu { version }.fail(),
            Err(source) => return Err(CommitError::Storage { source }),
        };

        let commit: Commit = serde_json::from_slice(&bytes).map_err(|e| {
            CorruptLogSnafu {
                msg: format!("failed to parse commit {version}: {e}"),
            }
            .build()
        })?;

        ensure!(
            commit.version == version,
            CorruptLogSnafu {
                msg: format!(
                    "commit file for version {version} contains version {}",
                    commit.version
                ),
            }
        );

        Ok(commit)
    }

    /// Load commits `from..=to` in order. Every entry must exist.
    pub async fn read_range(&self, from: u64, to: u64) -> Result<Vec<Commit>, CommitError> {
        let mut commits = Vec::with_capacity(to.saturating_sub(from).saturating_add(1) as usize);
        for version in from..=to {
            match self.read(version).await {
                Ok(commit) => commits.push(commit),
                Err(CommitError::MissingEntry { version }) => {
                    return CorruptLogSnafu {
                        msg: format!("log entry {version} is missing between {from} and {to}"),
                    }
                    .fail();
                }
                Err(e) => return Err(e),
            }
        }
        Ok(commits)
    }

    /// Every recognised `_log/` entry, ordered by key.
    pub async fn list_entries(&self) -> Result<Vec<(LogEntryKind, ObjectMeta)>, CommitError> {
        let metas = self
            .storage
            .list(&layout::log_prefix())
            .await
            .context(StorageSnafu)?;
        Ok(metas
            .into_iter()
            .filter_map(|meta| layout::parse_log_key(&meta.key).map(|kind| (kind, meta)))
            .collect())
    }

    async fn exists(&self, version: u64) -> Result<bool, CommitError> {
        self.storage
            .head(&layout::commit_key(version))
            .await
            .map(|meta| meta.is_some())
            .context(StorageSnafu)
    }

    async fn probe_forward(&self, mut version: u64) -> Result<u64, CommitError> {
        while self.exists(version + 1).await? {
            version += 1;
        }
        Ok(version)
    }

    /// The latest committed version, or `None` if the log is empty.
    ///
    /// Starts from the process-wide hint for this table when present,
    /// checks that the hinted entry exists and probes forward. Falls back
    /// to listing `_log/`.
    pub async fn head_version(&self) -> Result<Option<u64>, CommitError> {
        let uri = self.storage.uri();

        if let Some(hint) = read_hint(&uri) {
            if self.exists(hint).await? {
                let head = self.probe_forward(hint).await?;
                write_hint(&uri, head, true);
                return Ok(Some(head));
            }
            debug!("discarding stale version hint {hint} for {uri}");
            forget_hint(&uri);
        }

        let listed = self
            .list_entries()
            .await?
            .into_iter()
            .filter_map(|(kind, _)| match kind {
                LogEntryKind::Commit(v) => Some(v),
                LogEntryKind::Checkpoint(_) => None,
            })
            .max();

        let Some(listed) = listed else {
            return Ok(None);
        };

        let head = self.probe_forward(listed).await?;
        write_hint(&uri, head, false);
        Ok(Some(head))
    }

    /// The oldest commit entry still present.
    pub async fn earliest_version(&self) -> Result<Option<u64>, CommitError> {
        Ok(self
            .list_entries()
            .await?
            .into_iter()
            .filter_map(|(kind, _)| match kind {
                LogEntryKind::Commit(v) => Some(v),
                LogEntryKind::Checkpoint(_) => None,
            })
            .min())
    }

    /// Delete checkpoints and commit entries strictly below `version`.
    ///
    /// Checkpoints go first and commits in ascending order, so an interrupted
    /// cleanup never leaves a checkpoint whose replay tail is gone.
    /// Returns the number of entries deleted.
    pub async fn delete_entries_before(&self, version: u64) -> Result<usize, CommitError> {
        let entries = self.list_entries().await?;

        let checkpoints = entries.iter().filter_map(|(kind, meta)| match kind {
            LogEntryKind::Checkpoint(v) if *v < version => Some(meta),
            _ => None,
        });
        let commits = entries.iter().filter_map(|(kind, meta)| match kind {
            LogEntryKind::Commit(v) if *v < version => Some(meta),
            _ => None,
        });

        let mut deleted = 0;
        for meta in checkpoints.chain(commits) {
            self.storage.delete(&meta.key).await.context(StorageSnafu)?;
            deleted += 1;
        }
        debug!("deleted {deleted} log entries below version {version}");
        Ok(deleted)
    }

    /// Forget the cached HEAD for this table.
    pub(crate) fn reset_hint(&self) {
        forget_hint(&self.storage.uri());
    }
}
