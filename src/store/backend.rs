//! Low-level key-value storage backend trait and supporting types.
//!
//! The [`StorageBackend`] trait is the contract every storage engine
//! implements: [`get`](StorageBackend::get), [`put`](StorageBackend::put),
//! [`put_if_version`](StorageBackend::put_if_version),
//! [`delete`](StorageBackend::delete) and
//! [`list_by_prefix`](StorageBackend::list_by_prefix).
//!
//! Backends are dumb KV stores. State machine rules, claim semantics and
//! serialization live in
//! [`GenericTaskStore`](crate::store::generic::GenericTaskStore).
//!
//! # Key Structure
//!
//! Keys are `{namespace}:{id}` where the namespace is one of
//! [`Namespace::Tasks`] or [`Namespace::Rules`] and ids are UUID v4
//! strings. Listing a namespace uses the `{namespace}:` prefix.
//!
//! # Versioning
//!
//! Each record carries a monotonic `u64` version starting at 1 and
//! incremented on every successful write. `put_if_version` is the single
//! compare-and-swap primitive the claim protocol is built on.

use std::fmt;

use async_trait::async_trait;

/// A stored record paired with its version.
///
/// # Examples
///
/// ```
/// use brain::store::backend::VersionedRecord;
///
/// let record = VersionedRecord { data: b"{}".to_vec(), version: 1 };
/// assert_eq!(record.version, 1);
/// ```
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    /// Serialized record bytes (JSON).
    pub data: Vec<u8>,

    /// Monotonic version, starting at 1.
    pub version: u64,
}

/// Errors from raw storage operations.
///
/// `GenericTaskStore` maps these to [`BrainError`](crate::BrainError)
/// before they reach callers.
///
/// # Examples
///
/// ```
/// use brain::store::backend::StorageError;
///
/// let err = StorageError::VersionConflict {
///     key: "tasks:t-1".to_string(),
///     expected: 2,
///     actual: 3,
/// };
/// assert!(err.to_string().contains("expected 2"));
/// ```
#[derive(Debug)]
pub enum StorageError {
    /// No record under the key.
    NotFound {
        /// The missing key.
        key: String,
    },

    /// The stored version differs from the one the writer read.
    VersionConflict {
        /// The contended key.
        key: String,
        /// Version the caller expected.
        expected: u64,
        /// Version actually stored (0 if the key vanished).
        actual: u64,
    },

    /// An I/O or backend-specific failure.
    Backend {
        /// Description of the failure.
        message: String,
        /// Underlying error, reachable through
        /// [`std::error::Error::source()`].
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StorageError {
    /// Wraps an error as [`StorageError::Backend`].
    pub fn backend<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "key not found: {key}"),
            Self::VersionConflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on key {key}: expected {expected}, found {actual}"
            ),
            Self::Backend { message, .. } => write!(f, "backend error: {message}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

/// Key-value storage backend.
///
/// Implementations must be `Send + Sync`: the scheduler, dispatcher,
/// consumers and controller all hit the same backend concurrently.
///
/// `put_if_version` must be atomic with respect to every other write on
/// the same key, including writes from other processes sharing the
/// backend. That guarantee is what makes task claims mutually exclusive.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Reads a record and its version.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key does not exist.
    /// - [`StorageError::Backend`] on I/O failures.
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError>;

    /// Writes unconditionally. New keys start at version 1; existing keys
    /// are bumped. Returns the new version.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O failures.
    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError>;

    /// Writes only if the stored version equals `expected_version`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key does not exist.
    /// - [`StorageError::VersionConflict`] on a version mismatch.
    /// - [`StorageError::Backend`] on I/O failures.
    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    /// Deletes a record. Returns `false` if the key did not exist.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O failures.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Lists every record whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O failures.
    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError>;
}

/// Record families kept in one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Task records.
    Tasks,
    /// Schedule rules.
    Rules,
}

impl Namespace {
    /// The key segment for this namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Rules => "rules",
        }
    }
}

/// Builds the storage key for a record.
///
/// # Examples
///
/// ```
/// use brain::store::backend::{make_key, Namespace};
///
/// assert_eq!(make_key(Namespace::Tasks, "abc"), "tasks:abc");
/// assert_eq!(make_key(Namespace::Rules, "r1"), "rules:r1");
/// ```
pub fn make_key(namespace: Namespace, id: &str) -> String {
    format!("{}:{id}", namespace.as_str())
}

/// Splits a key into `(namespace, id)` on the first colon.
///
/// # Examples
///
/// ```
/// use brain::store::backend::parse_key;
///
/// assert_eq!(parse_key("tasks:abc"), Some(("tasks", "abc")));
/// assert_eq!(parse_key("no-colon"), None);
/// ```
pub fn parse_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

/// The listing prefix for a namespace.
///
/// # Examples
///
/// ```
/// use brain::store::backend::{make_prefix, Namespace};
///
/// assert_eq!(make_prefix(Namespace::Tasks), "tasks:");
/// ```
pub fn make_prefix(namespace: Namespace) -> String {
    format!("{}:", namespace.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn not_found_display() {
        let err = StorageError::NotFound {
            key: "tasks:t-1".to_string(),
        };
        assert_eq!(err.to_string(), "key not found: tasks:t-1");
        assert!(err.source().is_none());
    }

    #[test]
    fn backend_error_exposes_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = StorageError::backend("write failed", io);
        assert_eq!(err.to_string(), "backend error: write failed");
        assert!(err.source().unwrap().to_string().contains("disk gone"));
    }

    #[test]
    fn keys_round_trip_through_parse() {
        let key = make_key(Namespace::Tasks, "0f8a");
        assert_eq!(parse_key(&key), Some(("tasks", "0f8a")));
        assert!(key.starts_with(&make_prefix(Namespace::Tasks)));
        assert!(!key.starts_with(&make_prefix(Namespace::Rules)));
    }
}
