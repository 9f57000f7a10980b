//! Storage capability interface and its backends.
//!
//! The commit protocol needs exactly five primitives from the medium it runs
//! on, captured by [`ObjectStorage`]:
//!
//! - `list(prefix)`: ordered keys with size and modification time.
//! - `get(key)`: full object contents, or `NotFound`.
//! - `put_if_absent(key, bytes)`: atomic create-only-if-missing. This is the
//!   single serialization point for log versions.
//! - `put(key, bytes)`: durable write/replace, used for data files and
//!   checkpoints.
//! - `delete(key)`.
//!
//! Keys are always relative to a table (or lake) root and use `/` as the
//! separator regardless of the backend. Two implementations ship with the
//! crate:
//!
//! - [`LocalStorage`]: local filesystem via tokio. `put` is
//!   write-temp-then-rename; `put_if_absent` writes a synced temp file and
//!   hard-links it onto the target so readers never observe a partial log
//!   entry.
//! - [`ObjectStoreStorage`]: any `object_store` backend (S3-compatible stores,
//!   in-memory). `put_if_absent` maps to `PutMode::Create`.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

pub mod error;
pub mod local;
pub mod object;
pub mod table_location;

pub use error::{BackendError, StorageError};
pub(crate) use error::{InvalidLocationSnafu, NotFoundSnafu, OtherIoSnafu};
pub use local::LocalStorage;
pub use object::ObjectStoreStorage;
pub use table_location::TableLocation;

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Shared handle to a storage backend.
pub type StorageRef = Arc<dyn ObjectStorage>;

/// Metadata about a stored object as returned by [`ObjectStorage::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Key relative to the storage root, `/`-separated.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time reported by the backend.
    pub last_modified: DateTime<Utc>,
}

/// Outcome of a create-if-absent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The object did not exist and was created by this call.
    Created,
    /// Another writer created the object first; nothing was written.
    AlreadyExists,
}

/// Outcome of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The object existed and was deleted.
    Deleted,
    /// There was nothing to delete.
    NotFound,
}

/// The capability interface every storage medium implements.
///
/// Implementations must guarantee that `put_if_absent` is atomic with respect
/// to concurrent callers in other processes, and that a successful `put` or
/// `put_if_absent` is durable and fully readable when the call returns.
#[async_trait]
pub trait ObjectStorage: Send + Sync + fmt::Debug {
    /// List every object whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>>;

    /// Names of the immediate sub-directories of `prefix`, ordered. `prefix`
    /// is empty or ends in `/`; objects directly under it are not reported.
    async fn list_dirs(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Read the full contents of `key`.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Metadata of `key` without reading it, or `None` if it does not exist.
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>>;

    /// Create `key` only if it does not exist yet.
    async fn put_if_absent(&self, key: &str, contents: Bytes) -> StorageResult<PutOutcome>;

    /// Create or replace `key`.
    async fn put(&self, key: &str, contents: Bytes) -> StorageResult<()>;

    /// Delete `key`.
    async fn delete(&self, key: &str) -> StorageResult<DeleteOutcome>;

    /// Human-readable URI of the storage root, used as a cache key and in
    /// error messages.
    fn uri(&self) -> String;

    /// The same medium rooted one level deeper, at `name/`.
    fn scoped(&self, name: &str) -> StorageRef;
}
