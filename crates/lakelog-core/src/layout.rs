//! Object key conventions under a table root.
//!
//! This module centralizes all *relative* key conventions:
//! - commit log entries and checkpoints (`_log/`)
//! - data files, optionally partitioned by column value (`_data/`)
//!
//! Keys are `/`-separated strings relative to the table root and are handed
//! directly to an [`crate::storage::ObjectStorage`].

use std::collections::BTreeMap;

use uuid::Uuid;

// ====================
// Transaction log layout
// ====================

/// Name of the directory containing the commit log.
pub const LOG_DIR_NAME: &str = "_log";

/// Number of digits used in zero-padded log entry names.
pub const VERSION_DIGITS: usize = 20;

const COMMIT_SUFFIX: &str = ".json";
const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";

/// Key prefix: `_log/`
pub fn log_prefix() -> String {
    format!("{LOG_DIR_NAME}/")
}

/// Key: `_log/<zero-padded>.json`
pub fn commit_key(version: u64) -> String {
    format!(
        "{LOG_DIR_NAME}/{:0width$}{COMMIT_SUFFIX}",
        version,
        width = VERSION_DIGITS
    )
}

/// Key: `_log/<zero-padded>.checkpoint.json`
pub fn checkpoint_key(version: u64) -> String {
    format!(
        "{LOG_DIR_NAME}/{:0width$}{CHECKPOINT_SUFFIX}",
        version,
        width = VERSION_DIGITS
    )
}

/// A recognised entry of the `_log/` directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryKind {
    /// A commit at the given version.
    Commit(u64),
    /// A checkpoint summarizing the table at the given version.
    Checkpoint(u64),
}

/// Classify a `_log/` key. Anything else (temp files, foreign objects)
/// returns `None`.
pub fn parse_log_key(key: &str) -> Option<LogEntryKind> {
    let name = key.strip_prefix(LOG_DIR_NAME)?.strip_prefix('/')?;

    let parse_digits = |digits: &str| -> Option<u64> {
        if digits.len() != VERSION_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    };

    if let Some(digits) = name.strip_suffix(CHECKPOINT_SUFFIX) {
        return parse_digits(digits).map(LogEntryKind::Checkpoint);
    }
    name.strip_suffix(COMMIT_SUFFIX)
        .and_then(parse_digits)
        .map(LogEntryKind::Commit)
}

// ====================
// Data layout
// ====================

/// Directory where data files are stored.
pub const DATA_DIR_NAME: &str = "_data";

/// Directory segment value used for a null partition value.
pub const NULL_PARTITION_VALUE: &str = "__NULL__";

/// Key prefix: `_data/`
pub fn data_prefix() -> String {
    format!("{DATA_DIR_NAME}/")
}

/// Key for a new data file:
/// `_data/<col>=<value>/.../part-<uuid>.parquet`.
///
/// Partition directories follow the order of `partition_columns`.
pub fn data_file_key(
    partition_columns: &[String],
    partition_values: &BTreeMap<String, Option<String>>,
) -> String {
    let mut key = String::from(DATA_DIR_NAME);
    for column in partition_columns {
        let value = partition_values
            .get(column)
            .and_then(|v| v.as_deref())
            .map(escape_partition_value)
            .unwrap_or_else(|| NULL_PARTITION_VALUE.to_string());
        key.push('/');
        key.push_str(column);
        key.push('=');
        key.push_str(&value);
    }
    key.push_str(&format!("/part-{}.parquet", Uuid::new_v4()));
    key
}

/// Make a partition value safe to use as a single key segment.
fn escape_partition_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '/' | '\\' | '%' | '=' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => {
                out.push_str(&format!("%{:02X}", ch as u32));
            }
            c if c.is_control() => out.push_str(&format!("%{:02X}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_and_checkpoint_keys_round_trip() {
        assert_eq!(commit_key(7), "_log/00000000000000000007.json");
        assert_eq!(checkpoint_key(10), "_log/00000000000000000010.checkpoint.json");

        assert_eq!(parse_log_key(&commit_key(42)), Some(LogEntryKind::Commit(42)));
        assert_eq!(
            parse_log_key(&checkpoint_key(42)),
            Some(LogEntryKind::Checkpoint(42))
        );
    }

    #[test]
    fn foreign_log_keys_are_ignored() {
        assert_eq!(parse_log_key("_log/7.json"), None);
        assert_eq!(parse_log_key("_log/.00000000000000000007.json.abc.tmp"), None);
        assert_eq!(parse_log_key("_data/00000000000000000007.json"), None);
    }

    #[test]
    fn data_keys_follow_partition_order_and_nulls() {
        let cols = vec!["region".to_string(), "day".to_string()];
        let mut values = BTreeMap::new();
        values.insert("region".to_string(), Some("eu/west".to_string()));
        values.insert("day".to_string(), None);

        let key = data_file_key(&cols, &values);
        assert!(key.starts_with("_data/region=eu%2Fwest/day=__NULL__/part-"), "{key}");
        assert!(key.ends_with(".parquet"));

        let flat = data_file_key(&[], &BTreeMap::new());
        assert!(flat.starts_with("_data/part-"));
    }
}
