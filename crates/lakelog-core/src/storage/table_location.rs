//! User-facing table locations and backend construction.

use std::{fmt, path::PathBuf, sync::Arc};

use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use snafu::prelude::*;

use crate::storage::{
    BackendError, InvalidLocationSnafu, LocalStorage, ObjectStoreStorage, OtherIoSnafu,
    StorageRef, StorageResult,
};

/// Table (or lake) root location.
///
/// Accepted forms:
/// - a plain path, `/data/tables/events` or `./events`;
/// - `file:///data/tables/events`;
/// - `s3://bucket/prefix`. Credentials and region come from the usual
///   `AWS_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableLocation {
    /// A directory on the local filesystem.
    Local(PathBuf),
    /// A prefix inside an S3-compatible bucket.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Key prefix inside the bucket, without leading or trailing `/`.
        prefix: String,
    },
}

impl TableLocation {
    /// Creates a new `TableLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        TableLocation::Local(root.into())
    }

    /// Parse a user-facing location string.
    pub fn parse(spec: &str) -> StorageResult<Self> {
        let trimmed = spec.trim();
        ensure!(
            !trimmed.is_empty(),
            InvalidLocationSnafu {
                spec,
                reason: "location is empty",
            }
        );

        if let Some(rest) = trimmed.strip_prefix("s3://") {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            ensure!(
                !bucket.is_empty(),
                InvalidLocationSnafu {
                    spec,
                    reason: "missing bucket name",
                }
            );
            return Ok(TableLocation::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
            });
        }

        if let Some(path) = trimmed.strip_prefix("file://") {
            ensure!(
                !path.is_empty(),
                InvalidLocationSnafu {
                    spec,
                    reason: "missing path",
                }
            );
            return Ok(TableLocation::Local(PathBuf::from(path)));
        }

        if let Some((scheme, _)) = trimmed.split_once("://") {
            return InvalidLocationSnafu {
                spec,
                reason: format!("unsupported scheme {scheme:?}"),
            }
            .fail();
        }

        Ok(TableLocation::Local(PathBuf::from(trimmed)))
    }

    /// Location of a child directory / prefix named `name`.
    pub fn join(&self, name: &str) -> Self {
        match self {
            TableLocation::Local(root) => TableLocation::Local(root.join(name)),
            TableLocation::S3 { bucket, prefix } => TableLocation::S3 {
                bucket: bucket.clone(),
                prefix: if prefix.is_empty() {
                    name.to_string()
                } else {
                    format!("{prefix}/{name}")
                },
            },
        }
    }

    /// Build the storage backend rooted at this location.
    pub fn open_storage(&self) -> StorageResult<StorageRef> {
        match self {
            TableLocation::Local(root) => Ok(Arc::new(LocalStorage::new(root.clone()))),
            TableLocation::S3 { bucket, prefix } => {
                let store = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_conditional_put(S3ConditionalPut::ETagMatch)
                    .build()
                    .map_err(BackendError::ObjectStore)
                    .context(OtherIoSnafu {
                        path: self.to_string(),
                    })?;
                Ok(Arc::new(ObjectStoreStorage::new(
                    Arc::new(store),
                    prefix,
                    format!("s3://{bucket}"),
                )))
            }
        }
    }
}

impl fmt::Display for TableLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableLocation::Local(root) => write!(f, "{}", root.display()),
            TableLocation::S3 { bucket, prefix } if prefix.is_empty() => write!(f, "s3://{bucket}"),
            TableLocation::S3 { bucket, prefix } => write!(f, "s3://{bucket}/{prefix}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;

    #[test]
    fn parses_supported_forms() {
        assert_eq!(
            TableLocation::parse("/tmp/t").expect("plain path"),
            TableLocation::Local(PathBuf::from("/tmp/t"))
        );
        assert_eq!(
            TableLocation::parse("file:///tmp/t").expect("file uri"),
            TableLocation::Local(PathBuf::from("/tmp/t"))
        );
        assert_eq!(
            TableLocation::parse("s3://bucket/a/b/").expect("s3 uri"),
            TableLocation::S3 {
                bucket: "bucket".to_string(),
                prefix: "a/b".to_string(),
            }
        );
    }

    #[test]
    fn rejects_empty_and_unknown_schemes() {
        for spec in ["", "   ", "gs://bucket/x", "s3:///x"] {
            let err = TableLocation::parse(spec).expect_err(spec);
            assert!(matches!(err, StorageError::InvalidLocation { .. }), "{spec}");
        }
    }

    #[test]
    fn join_extends_prefixes() {
        let s3 = TableLocation::parse("s3://bucket").expect("s3 uri");
        assert_eq!(s3.join("events").to_string(), "s3://bucket/events");

        let local = TableLocation::local("/lake");
        assert_eq!(local.join("events"), TableLocation::Local(PathBuf::from("/lake/events")));
    }
}
