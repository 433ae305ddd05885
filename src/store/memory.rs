//! In-memory storage backend.
//!
//! [`InMemoryBackend`] is a thread-safe [`StorageBackend`] over
//! `DashMap<String, (Vec<u8>, u64)>`. It has no domain logic; wrap it in a
//! [`GenericTaskStore`] (or use [`InMemoryTaskStore::in_memory`]) to get a
//! task store.
//!
//! # Concurrency
//!
//! `put_if_version` holds the shard write lock for the key while comparing
//! and swapping, so claims against the same task serialize correctly.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use brain::store::memory::InMemoryTaskStore;
//! use brain::store::TaskStore;
//!
//! let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::in_memory());
//! ```

use async_trait::async_trait;
use dashmap::DashMap;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};
use crate::store::generic::GenericTaskStore;

/// Thread-safe in-memory storage backend using [`DashMap`].
///
/// # Examples
///
/// ```
/// use brain::store::memory::InMemoryBackend;
///
/// let backend = InMemoryBackend::new();
/// assert!(backend.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: DashMap<String, (Vec<u8>, u64)>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let entry = self.data.get(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        let (data, version) = entry.value();
        Ok(VersionedRecord {
            data: data.clone(),
            version: *version,
        })
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| (Vec::new(), 0));
        let new_version = entry.1 + 1;
        *entry = (data.to_vec(), new_version);
        Ok(new_version)
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let mut entry = self
            .data
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        let current_version = entry.value().1;
        if current_version != expected_version {
            return Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: current_version,
            });
        }
        let new_version = current_version + 1;
        *entry.value_mut() = (data.to_vec(), new_version);
        Ok(new_version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.remove(key).is_some())
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        Ok(self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| {
                let (data, version) = entry.value();
                (
                    entry.key().clone(),
                    VersionedRecord {
                        data: data.clone(),
                        version: *version,
                    },
                )
            })
            .collect())
    }
}

/// A [`GenericTaskStore`] over an [`InMemoryBackend`].
pub type InMemoryTaskStore = GenericTaskStore<InMemoryBackend>;

impl GenericTaskStore<InMemoryBackend> {
    /// Creates an empty in-memory task store with default limits.
    pub fn in_memory() -> Self {
        Self::new(InMemoryBackend::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ---- Backend tests ----

    #[tokio::test]
    async fn get_missing_key_returns_not_found() {
        let backend = InMemoryBackend::new();
        let err = backend.get("tasks:nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { key } if key == "tasks:nope"));
    }

    #[tokio::test]
    async fn put_assigns_increasing_versions() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.put("tasks:a", b"1").await.unwrap(), 1);
        assert_eq!(backend.put("tasks:a", b"2").await.unwrap(), 2);
        let rec = backend.get("tasks:a").await.unwrap();
        assert_eq!(rec.data, b"2");
        assert_eq!(rec.version, 2);
    }

    #[tokio::test]
    async fn put_if_version_rejects_stale_writer() {
        let backend = InMemoryBackend::new();
        backend.put("tasks:a", b"v1").await.unwrap();
        assert_eq!(backend.put_if_version("tasks:a", b"v2", 1).await.unwrap(), 2);

        let err = backend
            .put_if_version("tasks:a", b"stale", 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
        assert_eq!(backend.get("tasks:a").await.unwrap().data, b"v2");
    }

    #[tokio::test]
    async fn put_if_version_on_missing_key_is_not_found() {
        let backend = InMemoryBackend::new();
        let err = backend.put_if_version("tasks:x", b"d", 1).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = InMemoryBackend::new();
        backend.put("rules:r", b"{}").await.unwrap();
        assert!(backend.delete("rules:r").await.unwrap());
        assert!(!backend.delete("rules:r").await.unwrap());
    }

    #[tokio::test]
    async fn list_by_prefix_separates_namespaces() {
        let backend = InMemoryBackend::new();
        backend.put("tasks:1", b"a").await.unwrap();
        backend.put("tasks:2", b"b").await.unwrap();
        backend.put("rules:1", b"c").await.unwrap();

        let mut keys: Vec<_> = backend
            .list_by_prefix("tasks:")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["tasks:1", "tasks:2"]);
    }
}
