//! Per-table configuration.
//!
//! The configuration is persisted inside the table metadata, so every handle
//! opening the table sees the same values. Every field has a default, and
//! missing fields in older metadata deserialize to those defaults.

use serde::{Deserialize, Serialize};

/// Default target size of a data file: 512 MiB.
pub const DEFAULT_TARGET_FILE_SIZE: u64 = 512 * 1024 * 1024;

/// Default number of commits between checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;

/// Default bound on commit attempts per logical operation.
pub const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 16;

/// Default minimum vacuum retention, in hours (one week).
pub const DEFAULT_MIN_VACUUM_RETENTION_HOURS: u64 = 168;

/// Table-level tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TableConfig {
    /// Target size of data files produced by writes and compaction, in bytes.
    pub target_file_size: u64,
    /// A checkpoint is written after every commit whose version is a multiple
    /// of this value. `0` disables checkpoints.
    pub checkpoint_interval: u64,
    /// Maximum number of commit attempts before giving up.
    pub max_commit_attempts: u32,
    /// Minimum retention accepted by vacuum when enforcement is on.
    pub min_vacuum_retention_hours: u64,
    /// Reject vacuum retentions below `min_vacuum_retention_hours`.
    pub enforce_retention_duration: bool,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            target_file_size: DEFAULT_TARGET_FILE_SIZE,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            max_commit_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
            min_vacuum_retention_hours: DEFAULT_MIN_VACUUM_RETENTION_HOURS,
            enforce_retention_duration: false,
        }
    }
}

impl TableConfig {
    /// Set the target file size.
    pub fn with_target_file_size(mut self, bytes: u64) -> Self {
        self.target_file_size = bytes;
        self
    }

    /// Set the checkpoint interval.
    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Set the commit attempt bound.
    pub fn with_max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts;
        self
    }

    /// Turn vacuum retention enforcement on or off.
    pub fn with_enforce_retention_duration(mut self, enforce: bool) -> Self {
        self.enforce_retention_duration = enforce;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: TableConfig =
            serde_json::from_str(r#"{"checkpoint_interval": 3}"#).expect("deserialize");
        assert_eq!(cfg.checkpoint_interval, 3);
        assert_eq!(cfg.target_file_size, DEFAULT_TARGET_FILE_SIZE);
        assert_eq!(cfg.max_commit_attempts, DEFAULT_MAX_COMMIT_ATTEMPTS);
        assert!(!cfg.enforce_retention_duration);
    }
}
