//! Durable file-system storage backend.
//!
//! [`FileBackend`] keeps one JSON file per record under
//! `{root}/{namespace}/{id}.json`, so non-terminal tasks survive process
//! restarts. Each file holds an envelope with the record's version:
//!
//! ```text
//! {"version": 3, "data": { ...serialized record... }}
//! ```
//!
//! # Atomicity
//!
//! Files are replaced by writing a sibling `.tmp` file and renaming it over
//! the target, so readers never observe a torn record. Writes are
//! serialized twice: by an in-process mutex, and by a `.lock` file created
//! with `create_new` so that several processes sharing one directory still
//! get a correct compare-and-swap.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::store::backend::{parse_key, StorageBackend, StorageError, VersionedRecord};

const LOCK_FILE: &str = ".lock";
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(2);
const LOCK_MAX_WAIT: Duration = Duration::from_secs(5);
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    version: u64,
    data: &'a RawValue,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    version: u64,
    data: Box<RawValue>,
}

#[derive(Debug)]
struct FileInner {
    root: PathBuf,
    write_lock: Mutex<()>,
}

/// File-per-record storage backend.
///
/// # Examples
///
/// ```
/// use brain::store::file::FileBackend;
/// use brain::store::generic::GenericTaskStore;
///
/// let dir = tempfile::tempdir().unwrap();
/// let store = GenericTaskStore::new(FileBackend::open(dir.path()).unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct FileBackend {
    inner: Arc<FileInner>,
}

/// Cross-process write lock; removed on drop.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}

impl FileBackend {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the directory cannot be
    /// created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            StorageError::backend(format!("failed to create {}", root.display()), e)
        })?;
        Ok(Self {
            inner: Arc::new(FileInner {
                root,
                write_lock: Mutex::new(()),
            }),
        })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&FileInner) -> Result<T, StorageError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StorageError::backend("file store worker panicked", e))?
    }
}

impl FileInner {
    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let (namespace, id) = parse_key(key).ok_or_else(|| StorageError::Backend {
            message: format!("invalid key format (missing ':'): {key}"),
            source: None,
        })?;
        validate_segment(namespace, key)?;
        validate_segment(id, key)?;
        Ok(self.root.join(namespace).join(format!("{id}.json")))
    }

    fn read(&self, path: &Path, key: &str) -> Result<Option<VersionedRecord>, StorageError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::backend(format!("failed to read {key}"), e));
            }
        };
        let envelope: EnvelopeIn = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::backend(format!("corrupt record {key}"), e))?;
        Ok(Some(VersionedRecord {
            data: envelope.data.get().as_bytes().to_vec(),
            version: envelope.version,
        }))
    }

    fn write(&self, path: &Path, key: &str, data: &[u8], version: u64) -> Result<(), StorageError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| StorageError::backend(format!("record {key} is not UTF-8"), e))?;
        let raw = RawValue::from_string(text.to_string())
            .map_err(|e| StorageError::backend(format!("record {key} is not JSON"), e))?;
        let bytes = serde_json::to_vec(&EnvelopeOut { version, data: &raw })
            .map_err(|e| StorageError::backend(format!("failed to encode {key}"), e))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StorageError::backend(format!("failed to create {}", parent.display()), e)
            })?;
        }
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)
            .map_err(|e| StorageError::backend(format!("failed to write {}", tmp.display()), e))?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| StorageError::backend(format!("failed to write {}", tmp.display()), e))?;
        fs::rename(&tmp, path).map_err(|e| {
            StorageError::backend(
                format!("failed to rename {} -> {}", tmp.display(), path.display()),
                e,
            )
        })
    }

    /// Runs `op` while holding both the in-process and the cross-process
    /// write lock.
    fn with_write_lock<T>(
        &self,
        op: impl FnOnce() -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let _local = self.write_lock.lock();
        let _process = self.acquire_lock_file()?;
        op()
    }

    fn acquire_lock_file(&self) -> Result<LockGuard, StorageError> {
        let path = self.root.join(LOCK_FILE);
        let started = SystemTime::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(LockGuard { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        tracing::warn!(path = %path.display(), "removing stale store lock");
                        match fs::remove_file(&path) {
                            Ok(()) => continue,
                            // Another writer cleared it first.
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => {
                                tracing::warn!(path = %path.display(), error = %e, "failed to remove stale store lock");
                                return Err(StorageError::backend(
                                    format!("failed to remove stale lock {}", path.display()),
                                    e,
                                ));
                            }
                        }
                    }
                    if started.elapsed().unwrap_or_default() > LOCK_MAX_WAIT {
                        return Err(StorageError::Backend {
                            message: format!("timed out waiting for {}", path.display()),
                            source: None,
                        });
                    }
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(StorageError::backend(
                        format!("failed to create {}", path.display()),
                        e,
                    ));
                }
            }
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

fn validate_segment(segment: &str, key: &str) -> Result<(), StorageError> {
    let invalid = segment.trim().is_empty()
        || segment.contains('/')
        || segment.contains('\\')
        || segment.contains("..")
        || segment.starts_with('.');
    if invalid {
        return Err(StorageError::Backend {
            message: format!("invalid key {key}: segments must be plain file names"),
            source: None,
        });
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let key = key.to_string();
        self.blocking(move |inner| {
            let path = inner.path_for(&key)?;
            inner
                .read(&path, &key)?
                .ok_or(StorageError::NotFound { key })
        })
        .await
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        let key = key.to_string();
        let data = data.to_vec();
        self.blocking(move |inner| {
            let path = inner.path_for(&key)?;
            inner.with_write_lock(|| {
                let version = inner.read(&path, &key)?.map_or(1, |r| r.version + 1);
                inner.write(&path, &key, &data, version)?;
                Ok(version)
            })
        })
        .await
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let key = key.to_string();
        let data = data.to_vec();
        self.blocking(move |inner| {
            let path = inner.path_for(&key)?;
            inner.with_write_lock(|| {
                let current = inner
                    .read(&path, &key)?
                    .ok_or_else(|| StorageError::NotFound { key: key.clone() })?;
                if current.version != expected_version {
                    return Err(StorageError::VersionConflict {
                        key: key.clone(),
                        expected: expected_version,
                        actual: current.version,
                    });
                }
                let version = current.version + 1;
                inner.write(&path, &key, &data, version)?;
                Ok(version)
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let key = key.to_string();
        self.blocking(move |inner| {
            let path = inner.path_for(&key)?;
            inner.with_write_lock(|| match fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(StorageError::backend(format!("failed to delete {key}"), e)),
            })
        })
        .await
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        let prefix = prefix.to_string();
        self.blocking(move |inner| {
            let (namespace, id_prefix) = prefix.split_once(':').unwrap_or((prefix.as_str(), ""));
            let dir = inner.root.join(namespace);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => {
                    return Err(StorageError::backend(
                        format!("failed to list {}", dir.display()),
                        e,
                    ));
                }
            };

            let mut results = Vec::new();
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("json") {
                    continue;
                }
                let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if !id.starts_with(id_prefix) {
                    continue;
                }
                let key = format!("{namespace}:{id}");
                // A concurrent delete between read_dir and read is not an error.
                if let Some(record) = inner.read(&path, &key)? {
                    results.push((key, record));
                }
            }
            Ok(results)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn backend() -> (tempfile::TempDir, FileBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let (dir, backend) = backend();
        backend.put("tasks:a", br#"{"x":1}"#).await.unwrap();
        backend.put_if_version("tasks:a", br#"{"x":2}"#, 1).await.unwrap();
        drop(backend);

        let reopened = FileBackend::open(dir.path()).unwrap();
        let rec = reopened.get("tasks:a").await.unwrap();
        assert_eq!(rec.version, 2);
        assert_eq!(rec.data, br#"{"x":2}"#);
    }

    fn age(path: &Path, by: Duration) {
        let file = fs::File::open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[tokio::test]
    async fn stale_lock_is_cleared() {
        let (dir, backend) = backend();
        let lock = dir.path().join(LOCK_FILE);
        fs::write(&lock, b"").unwrap();
        age(&lock, STALE_LOCK_AGE * 2);

        backend.put("tasks:a", b"{}").await.unwrap();
        assert_eq!(backend.get("tasks:a").await.unwrap().version, 1);
        assert!(!lock.exists());
    }

    #[tokio::test]
    async fn stale_lock_that_cannot_be_removed_fails_the_write() {
        let (dir, backend) = backend();
        let lock = dir.path().join(LOCK_FILE);
        fs::create_dir(&lock).unwrap();
        age(&lock, STALE_LOCK_AGE * 2);

        let err = backend.put("tasks:a", b"{}").await.unwrap_err();
        assert!(err.to_string().contains("stale lock"), "{err}");
        assert!(matches!(backend.get("tasks:a").await, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let (_dir, backend) = backend();
        backend.put("tasks:a", b"{}").await.unwrap();
        backend.put_if_version("tasks:a", b"[]", 1).await.unwrap();
        let err = backend.put_if_version("tasks:a", b"[1]", 1).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let (_dir, backend) = backend();
        assert!(matches!(
            backend.get("tasks:none").await.unwrap_err(),
            StorageError::NotFound { .. }
        ));
        assert!(!backend.delete("tasks:none").await.unwrap());
    }

    #[tokio::test]
    async fn path_traversal_keys_are_rejected() {
        let (_dir, backend) = backend();
        for key in ["tasks:../escape", "tasks:a/b", "../x:y", "tasks:.lock", "nocolon"] {
            assert!(
                matches!(backend.put(key, b"{}").await, Err(StorageError::Backend { .. })),
                "{key}"
            );
        }
    }

    #[tokio::test]
    async fn non_json_data_is_rejected() {
        let (_dir, backend) = backend();
        assert!(backend.put("tasks:a", b"not json").await.is_err());
    }

    #[tokio::test]
    async fn list_by_prefix_reads_one_namespace() {
        let (_dir, backend) = backend();
        backend.put("tasks:1", b"1").await.unwrap();
        backend.put("tasks:2", b"2").await.unwrap();
        backend.put("rules:1", b"3").await.unwrap();

        let mut listed: Vec<_> = backend
            .list_by_prefix("tasks:")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, r)| (k, r.data))
            .collect();
        listed.sort();
        assert_eq!(
            listed,
            vec![
                ("tasks:1".to_string(), b"1".to_vec()),
                ("tasks:2".to_string(), b"2".to_vec())
            ]
        );
        assert!(backend.list_by_prefix("other:").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cas_writers_have_one_winner() {
        let (_dir, backend) = backend();
        backend.put("tasks:hot", b"0").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .put_if_version("tasks:hot", i.to_string().as_bytes(), 1)
                    .await
                    .is_ok()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(backend.get("tasks:hot").await.unwrap().version, 2);
    }
}
