//! Local filesystem backend.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

use crate::storage::{
    BackendError, DeleteOutcome, NotFoundSnafu, ObjectMeta, ObjectStorage, OtherIoSnafu,
    PutOutcome, StorageRef, StorageResult,
};

/// Storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create a backend rooted at `root`. The directory is created lazily on
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory of this backend.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn abs(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }

    fn key_for(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
/// Used to ensure cleanup on error paths during atomic writes.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Disarm the guard so the file is NOT removed on drop.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort cleanup; we are likely already handling another error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn temp_sibling(abs: &Path) -> PathBuf {
    let name = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    abs.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
}

/// True for the names [`temp_sibling`] hands out. They belong to a write in
/// progress and are never listed.
fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

/// Write `contents` to a fresh temp file next to `abs` and fsync it.
async fn write_synced_temp(abs: &Path, contents: &[u8]) -> StorageResult<TempFileGuard> {
    create_parent_dir(abs).await?;

    let tmp_path = temp_sibling(abs);
    let guard = TempFileGuard::new(tmp_path.clone());
    let path = tmp_path.display().to_string();

    let mut file = fs::File::create(&tmp_path)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu { path: path.clone() })?;

    file.write_all(contents)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu { path: path.clone() })?;

    file.sync_all()
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu { path })?;

    Ok(guard)
}

fn system_time_to_utc(time: io::Result<std::time::SystemTime>) -> DateTime<Utc> {
    time.map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        // Walk from the deepest directory fully named by the prefix.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = self.abs(dir_part);

        let mut out = Vec::new();
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(BackendError::Local(e)).context(OtherIoSnafu {
                        path: dir.display().to_string(),
                    });
                }
            };

            loop {
                let entry = entries
                    .next_entry()
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: dir.display().to_string(),
                    })?;
                let Some(entry) = entry else { break };

                let path = entry.path();
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    // Raced with a concurrent delete.
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        return Err(BackendError::Local(e)).context(OtherIoSnafu {
                            path: path.display().to_string(),
                        });
                    }
                };

                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                if is_temp_name(&entry.file_name().to_string_lossy()) {
                    continue;
                }

                let Some(key) = self.key_for(&path) else {
                    continue;
                };
                if !key.starts_with(prefix) {
                    continue;
                }

                out.push(ObjectMeta {
                    key,
                    size: meta.len(),
                    last_modified: system_time_to_utc(meta.modified()),
                });
            }
        }

        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn list_dirs(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let dir = self.abs(prefix);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(BackendError::Local(e)).context(OtherIoSnafu {
                    path: dir.display().to_string(),
                });
            }
        };

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: dir.display().to_string(),
            })?
        {
            let is_dir = match entry.file_type().await {
                Ok(file_type) => file_type.is_dir(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(BackendError::Local(e)).context(OtherIoSnafu {
                        path: entry.path().display().to_string(),
                    });
                }
            };
            if is_dir {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let abs = self.abs(key);
        match fs::read(&abs).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BackendError::Local(e)).context(NotFoundSnafu { path: key })
            }
            Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu { path: key }),
        }
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        match fs::metadata(self.abs(key)).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: meta.len(),
                last_modified: system_time_to_utc(meta.modified()),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu { path: key }),
        }
    }

    async fn put_if_absent(&self, key: &str, contents: Bytes) -> StorageResult<PutOutcome> {
        let abs = self.abs(key);
        let guard = write_synced_temp(&abs, &contents).await?;

        // A hard link fails atomically when the target exists, and the target
        // only ever appears with its full contents.
        match fs::hard_link(&guard.path, &abs).await {
            Ok(()) => Ok(PutOutcome::Created),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(PutOutcome::AlreadyExists),
            Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu { path: key }),
        }
        // The guard removes the temp name in both cases.
    }

    async fn put(&self, key: &str, contents: Bytes) -> StorageResult<()> {
        let abs = self.abs(key);
        let mut guard = write_synced_temp(&abs, &contents).await?;

        fs::rename(&guard.path, &abs)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu { path: key })?;

        // Success - the temp file has been renamed into place.
        guard.disarm();
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<DeleteOutcome> {
        let abs = self.abs(key);
        match fs::remove_file(&abs).await {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu { path: key }),
        }
    }

    fn uri(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn scoped(&self, name: &str) -> StorageRef {
        Arc::new(LocalStorage::new(self.abs(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn storage() -> (TempDir, LocalStorage) {
        let tmp = TempDir::new().expect("create temp dir");
        let storage = LocalStorage::new(tmp.path());
        (tmp, storage)
    }

    #[tokio::test]
    async fn put_creates_parent_directories() -> TestResult {
        let (tmp, storage) = storage();

        storage
            .put("nested/deep/dir/file.txt", Bytes::from_static(b"nested content"))
            .await?;

        let abs = tmp.path().join("nested/deep/dir/file.txt");
        assert_eq!(tokio::fs::read_to_string(&abs).await?, "nested content");
        Ok(())
    }

    #[tokio::test]
    async fn put_overwrites_and_leaves_no_temp_file() -> TestResult {
        let (_tmp, storage) = storage();

        storage.put("a/file.json", Bytes::from_static(b"original")).await?;
        storage.put("a/file.json", Bytes::from_static(b"updated")).await?;

        assert_eq!(storage.get("a/file.json").await?, Bytes::from_static(b"updated"));
        let keys: Vec<String> = storage.list("a/").await?.into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["a/file.json".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn put_if_absent_refuses_existing_key() -> TestResult {
        let (_tmp, storage) = storage();

        let first = storage
            .put_if_absent("_log/0001.json", Bytes::from_static(b"first"))
            .await?;
        let second = storage
            .put_if_absent("_log/0001.json", Bytes::from_static(b"second"))
            .await?;

        assert_eq!(first, PutOutcome::Created);
        assert_eq!(second, PutOutcome::AlreadyExists);
        assert_eq!(storage.get("_log/0001.json").await?, Bytes::from_static(b"first"));

        // Temp names are cleaned up on both paths.
        assert_eq!(storage.list("_log/").await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let (_tmp, storage) = storage();

        let err = storage.get("does/not/exist").await.expect_err("missing key");
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_is_recursive_sorted_and_prefix_filtered() -> TestResult {
        let (_tmp, storage) = storage();

        for key in ["_data/b=2/x.parquet", "_data/a=1/y.parquet", "_log/0.json", "_data/z.parquet"] {
            storage.put(key, Bytes::from_static(b"x")).await?;
        }

        let keys: Vec<String> = storage
            .list("_data/")
            .await?
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(
            keys,
            vec!["_data/a=1/y.parquet", "_data/b=2/x.parquet", "_data/z.parquet"]
        );

        let partial: Vec<String> = storage
            .list("_data/a")
            .await?
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(partial, vec!["_data/a=1/y.parquet"]);

        assert!(storage.list("missing/").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn list_skips_in_flight_temp_files() -> TestResult {
        let (tmp, storage) = storage();

        storage.put("_data/x.parquet", Bytes::from_static(b"x")).await?;
        let in_flight = tmp.path().join("_data/.y.parquet.0123abcd.tmp");
        tokio::fs::write(&in_flight, b"partial").await?;
        // A dot name that is not a temp file is still an object.
        storage.put("_data/.keep", Bytes::from_static(b"k")).await?;

        let keys: Vec<String> = storage
            .list("_data/")
            .await?
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, vec!["_data/.keep", "_data/x.parquet"]);
        assert!(in_flight.exists());
        Ok(())
    }

    #[tokio::test]
    async fn head_reports_size_without_reading() -> TestResult {
        let (_tmp, storage) = storage();

        storage.put("dir/k", Bytes::from_static(b"value")).await?;
        let meta = storage.head("dir/k").await?.expect("object exists");
        assert_eq!((meta.key.as_str(), meta.size), ("dir/k", 5));
        assert!(storage.head("dir/missing").await?.is_none());
        // Directories are not objects.
        assert!(storage.head("dir").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn list_dirs_reports_one_level() -> TestResult {
        let (_tmp, storage) = storage();

        storage.put("b/_log/0.json", Bytes::from_static(b"{}")).await?;
        storage.put("a/_data/x.parquet", Bytes::from_static(b"x")).await?;
        storage.put("loose.txt", Bytes::from_static(b"x")).await?;

        assert_eq!(storage.list_dirs("").await?, vec!["a", "b"]);
        assert_eq!(storage.list_dirs("b/").await?, vec!["_log"]);
        assert!(storage.list_dirs("missing/").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_reports_missing_keys() -> TestResult {
        let (_tmp, storage) = storage();

        storage.put("k", Bytes::from_static(b"v")).await?;
        assert_eq!(storage.delete("k").await?, DeleteOutcome::Deleted);
        assert_eq!(storage.delete("k").await?, DeleteOutcome::NotFound);
        Ok(())
    }
}
