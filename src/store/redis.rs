//! Redis storage backend for multi-replica deployments.
//!
//! [`RedisBackend`] implements [`StorageBackend`] on Redis hashes. Writes go
//! through Lua scripts so the version check, the hash update and the
//! namespace index update happen in one atomic round-trip; this is what
//! lets several Brain replicas share one store and still claim each task
//! exactly once.
//!
//! # Key Schema
//!
//! | Key Pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `{prefix}:{namespace}:{id}` | Hash | `version` and `data` fields |
//! | `{prefix}:idx:{namespace}` | Set | Ids present in the namespace |
//!
//! # Usage
//!
//! ```rust,no_run
//! use brain::store::redis::RedisBackend;
//! use brain::store::generic::GenericTaskStore;
//!
//! # async fn example() {
//! let backend = RedisBackend::new("redis://127.0.0.1:6379").await.unwrap();
//! let store = GenericTaskStore::new(backend.with_prefix("brain-prod"));
//! # }
//! ```

use std::collections::HashMap;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;

use crate::store::backend::{parse_key, StorageBackend, StorageError, VersionedRecord};

/// Unconditional put.
///
/// KEYS[1] = record hash, KEYS[2] = namespace index set.
/// ARGV[1] = data, ARGV[2] = id.
/// Returns: new version number.
const LUA_PUT: &str = r#"
local current_version = redis.call('HGET', KEYS[1], 'version')
local new_version
if current_version then
    new_version = tonumber(current_version) + 1
else
    new_version = 1
end
redis.call('HSET', KEYS[1], 'version', tostring(new_version), 'data', ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
return new_version
"#;

/// Conditional put (CAS).
///
/// KEYS[1] = record hash. ARGV[1] = data, ARGV[2] = expected version.
/// Returns: {status, value} where status 1=success, 0=mismatch, -1=missing.
const LUA_PUT_IF_VERSION: &str = r#"
local current_version = redis.call('HGET', KEYS[1], 'version')
if not current_version then
    return {-1, 0}
end
local expected = tonumber(ARGV[2])
local actual = tonumber(current_version)
if actual ~= expected then
    return {0, actual}
end
local new_version = actual + 1
redis.call('HSET', KEYS[1], 'version', tostring(new_version), 'data', ARGV[1])
return {1, new_version}
"#;

/// Delete hash and index entry.
///
/// KEYS[1] = record hash, KEYS[2] = namespace index set. ARGV[1] = id.
/// Returns: 1 if the record existed, 0 otherwise.
const LUA_DELETE: &str = r#"
local existed = redis.call('EXISTS', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
if existed == 1 then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

/// Redis storage backend.
///
/// Holds a [`MultiplexedConnection`], which is cheap to clone; every call
/// clones it so concurrent operations share one TCP connection.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connects to Redis at `url` using the default key prefix `"brain"`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the client cannot be created or
    /// the connection fails.
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| StorageError::backend("failed to create Redis client", e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StorageError::backend("failed to connect to Redis", e))?;
        Ok(Self::with_connection(conn))
    }

    /// Wraps an existing connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "brain".to_string(),
        }
    }

    /// Sets the key prefix, isolating several deployments on one server.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn hash_key(&self, namespace: &str, id: &str) -> String {
        format!("{}:{namespace}:{id}", self.key_prefix)
    }

    fn index_key(&self, namespace: &str) -> String {
        format!("{}:idx:{namespace}", self.key_prefix)
    }
}

fn split_key(key: &str) -> Result<(&str, &str), StorageError> {
    parse_key(key).ok_or_else(|| StorageError::Backend {
        message: format!("invalid key format (missing ':'): {key}"),
        source: None,
    })
}

fn map_redis_error(err: ::redis::RedisError, key: &str) -> StorageError {
    StorageError::backend(format!("Redis error for key {key}"), err)
}

fn decode_fields(
    fields: &HashMap<String, String>,
    key: &str,
) -> Result<VersionedRecord, StorageError> {
    let version: u64 = fields
        .get("version")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| StorageError::Backend {
            message: format!("missing or invalid version field for key {key}"),
            source: None,
        })?;
    let data = fields.get("data").ok_or_else(|| StorageError::Backend {
        message: format!("missing data field for key {key}"),
        source: None,
    })?;
    Ok(VersionedRecord {
        data: data.as_bytes().to_vec(),
        version,
    })
}

fn utf8(data: &[u8]) -> Result<&str, StorageError> {
    std::str::from_utf8(data).map_err(|e| StorageError::backend("data is not valid UTF-8", e))
}

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let (namespace, id) = split_key(key)?;
        let fields: HashMap<String, String> = self
            .conn
            .clone()
            .hgetall(self.hash_key(namespace, id))
            .await
            .map_err(|e| map_redis_error(e, key))?;
        if fields.is_empty() {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        decode_fields(&fields, key)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        let (namespace, id) = split_key(key)?;
        let version: u64 = Script::new(LUA_PUT)
            .key(self.hash_key(namespace, id))
            .key(self.index_key(namespace))
            .arg(utf8(data)?)
            .arg(id)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(version)
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let (namespace, id) = split_key(key)?;
        let (status, value): (i64, i64) = Script::new(LUA_PUT_IF_VERSION)
            .key(self.hash_key(namespace, id))
            .arg(utf8(data)?)
            .arg(expected_version)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;

        match status {
            1 => Ok(value as u64),
            0 => Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: value as u64,
            }),
            _ => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let (namespace, id) = split_key(key)?;
        let existed: i64 = Script::new(LUA_DELETE)
            .key(self.hash_key(namespace, id))
            .key(self.index_key(namespace))
            .arg(id)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(existed == 1)
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        let (namespace, id_prefix) = prefix.split_once(':').unwrap_or((prefix, ""));
        let mut ids: Vec<String> = self
            .conn
            .clone()
            .smembers(self.index_key(namespace))
            .await
            .map_err(|e| map_redis_error(e, prefix))?;
        ids.retain(|id| id.starts_with(id_prefix));

        let mut results = Vec::with_capacity(ids.len());
        let mut orphaned = Vec::new();
        for id in ids {
            let key = format!("{namespace}:{id}");
            let fields: HashMap<String, String> = self
                .conn
                .clone()
                .hgetall(self.hash_key(namespace, &id))
                .await
                .map_err(|e| map_redis_error(e, &key))?;
            if fields.is_empty() {
                orphaned.push(id);
                continue;
            }
            results.push((key.clone(), decode_fields(&fields, &key)?));
        }

        if !orphaned.is_empty() {
            let cleanup: Result<(), ::redis::RedisError> = self
                .conn
                .clone()
                .srem(self.index_key(namespace), &orphaned)
                .await;
            if let Err(e) = cleanup {
                tracing::debug!(error = %e, "failed to prune orphaned index entries");
            }
        }
        Ok(results)
    }
}

/// Contract tests against a real Redis.
///
/// Run with `REDIS_URL` pointing at a disposable instance:
///
/// ```bash
/// cargo test --features redis-tests -- redis_ --test-threads=1
/// ```
#[cfg(all(test, feature = "redis-tests"))]
mod integration_tests {
    use super::*;

    async fn test_backend() -> RedisBackend {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisBackend::new(&url)
            .await
            .expect("Redis connection failed -- is Redis running?")
            .with_prefix(format!("test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn redis_cas_round_trip() {
        let backend = test_backend().await;
        assert_eq!(backend.put("tasks:a", b"{}").await.unwrap(), 1);
        assert_eq!(backend.put_if_version("tasks:a", b"[]", 1).await.unwrap(), 2);
        assert!(matches!(
            backend.put_if_version("tasks:a", b"[1]", 1).await,
            Err(StorageError::VersionConflict { actual: 2, .. })
        ));
        assert_eq!(backend.get("tasks:a").await.unwrap().data, b"[]");
    }

    #[tokio::test]
    async fn redis_missing_key_cas_is_not_found() {
        let backend = test_backend().await;
        assert!(matches!(
            backend.put_if_version("tasks:none", b"{}", 1).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn redis_list_and_delete() {
        let backend = test_backend().await;
        backend.put("tasks:1", b"1").await.unwrap();
        backend.put("rules:1", b"2").await.unwrap();
        assert_eq!(backend.list_by_prefix("tasks:").await.unwrap().len(), 1);
        assert!(backend.delete("tasks:1").await.unwrap());
        assert!(backend.list_by_prefix("tasks:").await.unwrap().is_empty());
    }
}
