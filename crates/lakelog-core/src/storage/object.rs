//! `object_store` backend (S3-compatible stores, in-memory).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::{path::Path, memory::InMemory, ObjectStore, PutMode, PutOptions, PutPayload};
use snafu::{prelude::*, IntoError};
use uuid::Uuid;

use crate::storage::{
    BackendError, DeleteOutcome, NotFoundSnafu, ObjectMeta, ObjectStorage, OtherIoSnafu,
    PutOutcome, StorageRef, StorageResult,
};

/// Storage over any [`ObjectStore`], scoped to a key prefix.
///
/// `put_if_absent` is `PutMode::Create`, so the store must support
/// conditional creates (S3 with conditional put enabled, in-memory, ...).
#[derive(Debug, Clone)]
pub struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    label: String,
}

impl ObjectStoreStorage {
    /// Wrap `store`, scoping every key under `prefix`. `label` is the URI of
    /// the store root (for example `s3://bucket`).
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str, label: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
            label: label.into(),
        }
    }

    /// A fresh, empty in-memory store with a unique URI.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemory::new()),
            "",
            format!("memory://{}", Uuid::new_v4().simple()),
        )
    }

    /// The same store scoped one level deeper, at `prefix/child`.
    pub fn child(&self, child: &str) -> Self {
        let child = child.trim_matches('/');
        let prefix = if self.prefix.is_empty() {
            child.to_string()
        } else {
            format!("{}/{child}", self.prefix)
        };
        Self {
            store: Arc::clone(&self.store),
            prefix,
            label: self.label.clone(),
        }
    }

    fn location(&self, key: &str) -> Path {
        if self.prefix.is_empty() {
            Path::from(key)
        } else {
            Path::from(format!("{}/{key}", self.prefix))
        }
    }

    fn key_for(&self, location: &Path) -> Option<String> {
        let full = location.as_ref();
        if self.prefix.is_empty() {
            return Some(full.to_string());
        }
        full.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string)
    }
}

fn map_error(key: &str, err: object_store::Error) -> crate::storage::StorageError {
    match err {
        e @ object_store::Error::NotFound { .. } => NotFoundSnafu { path: key }
            .into_error(BackendError::ObjectStore(e)),
        e => OtherIoSnafu { path: key }.into_error(BackendError::ObjectStore(e)),
    }
}

#[async_trait]
impl ObjectStorage for ObjectStoreStorage {
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        // object_store lists whole path segments; filter the tail locally.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let base = if dir_part.is_empty() && self.prefix.is_empty() {
            None
        } else {
            Some(self.location(dir_part))
        };

        let metas: Vec<object_store::ObjectMeta> = self
            .store
            .list(base.as_ref())
            .try_collect()
            .await
            .map_err(|e| map_error(prefix, e))?;

        let mut out: Vec<ObjectMeta> = metas
            .into_iter()
            .filter_map(|meta| {
                let key = self.key_for(&meta.location)?;
                key.starts_with(prefix).then(|| ObjectMeta {
                    key,
                    size: meta.size as u64,
                    last_modified: meta.last_modified,
                })
            })
            .collect();

        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn list_dirs(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let dir = prefix.trim_end_matches('/');
        let base = if dir.is_empty() && self.prefix.is_empty() {
            None
        } else {
            Some(self.location(dir))
        };

        let listing = self
            .store
            .list_with_delimiter(base.as_ref())
            .await
            .map_err(|e| map_error(prefix, e))?;

        let mut out: Vec<String> = listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.filename().map(str::to_string))
            .collect();
        out.sort();
        Ok(out)
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let result = self
            .store
            .get(&self.location(key))
            .await
            .map_err(|e| map_error(key, e))?;
        result.bytes().await.map_err(|e| map_error(key, e))
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        match self.store.head(&self.location(key)).await {
            Ok(meta) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: meta.size as u64,
                last_modified: meta.last_modified,
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(map_error(key, e)),
        }
    }

    async fn put_if_absent(&self, key: &str, contents: Bytes) -> StorageResult<PutOutcome> {
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match self
            .store
            .put_opts(&self.location(key), PutPayload::from(contents), opts)
            .await
        {
            Ok(_) => Ok(PutOutcome::Created),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(PutOutcome::AlreadyExists),
            // S3 reports a lost conditional create as a failed precondition.
            Err(object_store::Error::Precondition { .. }) => Ok(PutOutcome::AlreadyExists),
            Err(e) => Err(map_error(key, e)),
        }
    }

    async fn put(&self, key: &str, contents: Bytes) -> StorageResult<()> {
        self.store
            .put(&self.location(key), PutPayload::from(contents))
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<DeleteOutcome> {
        let location = self.location(key);
        // Most stores treat deleting a missing key as success; probe first so
        // callers get an accurate outcome.
        match self.store.head(&location).await {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => return Ok(DeleteOutcome::NotFound),
            Err(e) => return Err(map_error(key, e)),
        }
        match self.store.delete(&location).await {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(object_store::Error::NotFound { .. }) => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(map_error(key, e)),
        }
    }

    fn uri(&self) -> String {
        if self.prefix.is_empty() {
            self.label.clone()
        } else {
            format!("{}/{}", self.label.trim_end_matches('/'), self.prefix)
        }
    }

    fn scoped(&self, name: &str) -> StorageRef {
        Arc::new(self.child(name))
    }
}
