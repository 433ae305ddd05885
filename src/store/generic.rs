//! Generic task store with all domain logic delegating to a [`StorageBackend`].
//!
//! [`GenericTaskStore`] implements batch creation with rollback, payload
//! limit enforcement, CAS read-modify-write loops, cursor pagination and
//! schedule rule storage on top of any backend. Backends stay dumb
//! key-value stores.
//!
//! # CAS Semantics
//!
//! Every mutation reads the record, applies a caller-supplied closure to a
//! copy, and writes it back with [`StorageBackend::put_if_version`]. On a
//! version conflict the closure is re-run against a fresh read, so
//! preconditions (such as "still `Ready`") are always evaluated against
//! the state being replaced. After `max_cas_retries` conflicts the store
//! gives up with [`BrainError::ConcurrentModification`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::domain::record::validate_payload;
use crate::domain::TaskRecord;
use crate::error::BrainError;
use crate::store::backend::{make_key, make_prefix, Namespace, StorageBackend, StorageError};
use crate::store::{
    Mutated, RuleMutation, StoreConfig, TaskFilter, TaskMutation, TaskPage, TaskStore,
};
use crate::types::schedule::ScheduleRule;
use crate::types::task::{Task, TaskStatus};

const DEFAULT_PAGE_SIZE: usize = 50;

/// Records that carry their store version out-of-band.
trait Versioned: Clone + Serialize + DeserializeOwned + Send + Sync {
    const NAMESPACE: Namespace;
    fn set_version(&mut self, version: u64);
}

impl Versioned for TaskRecord {
    const NAMESPACE: Namespace = Namespace::Tasks;
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Versioned for ScheduleRule {
    const NAMESPACE: Namespace = Namespace::Rules;
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Task store that delegates all storage to a [`StorageBackend`].
///
/// # Examples
///
/// ```
/// use brain::store::generic::GenericTaskStore;
/// use brain::store::memory::InMemoryBackend;
/// use brain::store::StoreConfig;
///
/// let store = GenericTaskStore::new(InMemoryBackend::new())
///     .with_config(StoreConfig { max_batch_size: 10, ..StoreConfig::default() });
/// assert_eq!(store.store_config().max_batch_size, 10);
/// ```
#[derive(Debug)]
pub struct GenericTaskStore<B: StorageBackend> {
    backend: B,
    config: StoreConfig,
}

impl<B: StorageBackend> GenericTaskStore<B> {
    /// Creates a store with default limits.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: StoreConfig::default(),
        }
    }

    /// Sets the store limits.
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The limits this store enforces.
    pub fn store_config(&self) -> &StoreConfig {
        &self.config
    }

    // ---- Serialization helpers (private) ----

    fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, BrainError> {
        serde_json::to_vec(value)
            .map_err(|e| BrainError::Store(format!("failed to serialize record: {e}")))
    }

    fn deserialize<T: Versioned>(data: &[u8], version: u64) -> Result<T, BrainError> {
        let mut value: T = serde_json::from_slice(data)
            .map_err(|e| BrainError::Store(format!("failed to deserialize record: {e}")))?;
        value.set_version(version);
        Ok(value)
    }

    fn map_storage_error(err: StorageError, id: &str) -> BrainError {
        match err {
            StorageError::NotFound { .. } => BrainError::not_found(id),
            StorageError::VersionConflict {
                expected, actual, ..
            } => BrainError::ConcurrentModification {
                id: id.to_string(),
                expected_version: expected,
                actual_version: actual,
            },
            StorageError::Backend { message, .. } => BrainError::Store(message),
        }
    }

    fn check_limits(&self, record: &TaskRecord) -> Result<(), BrainError> {
        self.check_payload(&record.task.payload, &record.task.id)
    }

    fn check_payload(&self, payload: &Value, owner: &str) -> Result<(), BrainError> {
        let size = serde_json::to_vec(payload)
            .map_err(|e| BrainError::Store(format!("failed to serialize payload: {e}")))?
            .len();
        if size > self.config.max_payload_bytes {
            return Err(BrainError::PayloadTooLarge {
                limit_bytes: self.config.max_payload_bytes,
                actual_bytes: size,
            });
        }
        validate_payload(
            payload,
            self.config.max_payload_depth,
            self.config.max_string_length,
        )
        .map_err(|e| BrainError::validation(format!("{owner}: {e}")))
    }

    async fn read<T: Versioned>(&self, id: &str) -> Result<T, BrainError> {
        let versioned = self
            .backend
            .get(&make_key(T::NAMESPACE, id))
            .await
            .map_err(|e| Self::map_storage_error(e, id))?;
        Self::deserialize(&versioned.data, versioned.version)
    }

    async fn read_all<T: Versioned>(&self) -> Result<Vec<T>, BrainError> {
        let entries = self
            .backend
            .list_by_prefix(&make_prefix(T::NAMESPACE))
            .await
            .map_err(|e| Self::map_storage_error(e, ""))?;

        let mut values = Vec::with_capacity(entries.len());
        for (key, versioned) in entries {
            match Self::deserialize::<T>(&versioned.data, versioned.version) {
                Ok(value) => values.push(value),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unreadable record");
                }
            }
        }
        Ok(values)
    }

    async fn mutate_versioned<T, F>(&self, id: &str, mutation: F) -> Result<Mutated<T>, BrainError>
    where
        T: Versioned,
        F: Fn(&mut T) -> Result<bool, BrainError> + Send + Sync,
    {
        let key = make_key(T::NAMESPACE, id);
        let mut last_conflict = (0, 0);

        for attempt in 0..=self.config.max_cas_retries {
            let versioned = self
                .backend
                .get(&key)
                .await
                .map_err(|e| Self::map_storage_error(e, id))?;
            let before: T = Self::deserialize(&versioned.data, versioned.version)?;

            let mut after = before.clone();
            if !mutation(&mut after)? {
                return Ok(Mutated {
                    after: before.clone(),
                    before,
                    changed: false,
                });
            }

            let bytes = Self::serialize(&after)?;
            match self
                .backend
                .put_if_version(&key, &bytes, versioned.version)
                .await
            {
                Ok(new_version) => {
                    after.set_version(new_version);
                    return Ok(Mutated {
                        before,
                        after,
                        changed: true,
                    });
                }
                Err(StorageError::VersionConflict {
                    expected, actual, ..
                }) => {
                    tracing::debug!(key = %key, attempt, expected, actual, "CAS conflict, re-reading");
                    last_conflict = (expected, actual);
                }
                Err(e) => return Err(Self::map_storage_error(e, id)),
            }
        }

        tracing::warn!(key = %key, retries = self.config.max_cas_retries, "giving up after repeated CAS conflicts");
        Err(BrainError::ConcurrentModification {
            id: id.to_string(),
            expected_version: last_conflict.0,
            actual_version: last_conflict.1,
        })
    }

    // ---- Domain operations (public) ----

    /// Persists a batch of new tasks; see [`TaskStore::create_batch`].
    pub async fn create_batch(
        &self,
        records: Vec<TaskRecord>,
    ) -> Result<Vec<TaskRecord>, BrainError> {
        if records.len() > self.config.max_batch_size {
            return Err(BrainError::validation(format!(
                "batch of {} tasks exceeds limit of {}",
                records.len(),
                self.config.max_batch_size
            )));
        }
        for record in &records {
            self.check_limits(record)?;
        }

        let mut written: Vec<TaskRecord> = Vec::with_capacity(records.len());
        for mut record in records {
            let key = make_key(Namespace::Tasks, &record.task.id);
            let result = match Self::serialize(&record) {
                Ok(bytes) => self
                    .backend
                    .put(&key, &bytes)
                    .await
                    .map_err(|e| Self::map_storage_error(e, &record.task.id)),
                Err(e) => Err(e),
            };
            match result {
                Ok(version) => {
                    record.version = version;
                    written.push(record);
                }
                Err(e) => {
                    self.rollback(&written).await;
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    async fn rollback(&self, written: &[TaskRecord]) {
        for record in written {
            let key = make_key(Namespace::Tasks, &record.task.id);
            if let Err(e) = self.backend.delete(&key).await {
                tracing::warn!(task_id = %record.task.id, error = %e, "failed to roll back partially written batch");
            }
        }
    }

    /// Reads one task.
    pub async fn get(&self, task_id: &str) -> Result<TaskRecord, BrainError> {
        self.read(task_id).await
    }

    /// CAS read-modify-write; see [`TaskStore::mutate`].
    pub async fn mutate(
        &self,
        task_id: &str,
        mutation: TaskMutation<'_>,
    ) -> Result<Mutated<TaskRecord>, BrainError> {
        self.mutate_versioned(task_id, mutation).await
    }

    /// Lists tasks matching `filter`, newest first with ties broken by id.
    ///
    /// The cursor encodes the `(created_at, id)` key of the last task of the
    /// previous page, so paging continues correctly even after that task
    /// was archived.
    pub async fn list(&self, filter: &TaskFilter) -> Result<TaskPage, BrainError> {
        let mut tasks: Vec<_> = self
            .read_all::<TaskRecord>()
            .await?
            .into_iter()
            .map(|r| r.task)
            .filter(|t| filter.matches(t))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let start = match filter.cursor.as_deref() {
            Some(cursor) => {
                let (after_at, after_id) = decode_cursor(cursor)?;
                tasks
                    .iter()
                    .position(|t| (t.created_at, t.id.as_str()) < (after_at, after_id))
                    .unwrap_or(tasks.len())
            },
            None => 0,
        };
        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_SIZE);

        let page: Vec<_> = tasks.iter().skip(start).take(limit).cloned().collect();
        let next_cursor = if start + limit < tasks.len() {
            page.last().map(encode_cursor)
        } else {
            None
        };

        Ok(TaskPage {
            tasks: page,
            next_cursor,
        })
    }

    /// Every record in one of `statuses` (all when empty).
    pub async fn scan(&self, statuses: &[TaskStatus]) -> Result<Vec<TaskRecord>, BrainError> {
        let mut records = self.read_all::<TaskRecord>().await?;
        if !statuses.is_empty() {
            records.retain(|r| statuses.contains(&r.task.status));
        }
        Ok(records)
    }

    /// Deletes a task.
    pub async fn remove(&self, task_id: &str) -> Result<bool, BrainError> {
        self.backend
            .delete(&make_key(Namespace::Tasks, task_id))
            .await
            .map_err(|e| Self::map_storage_error(e, task_id))
    }

    /// Persists a new schedule rule.
    ///
    /// The template payload is held to the same limits as a task payload,
    /// since every firing stores a copy of it.
    pub async fn create_rule(&self, mut rule: ScheduleRule) -> Result<ScheduleRule, BrainError> {
        self.check_payload(&rule.template.payload, &rule.id)?;
        let key = make_key(Namespace::Rules, &rule.id);
        let bytes = Self::serialize(&rule)?;
        rule.version = self
            .backend
            .put(&key, &bytes)
            .await
            .map_err(|e| Self::map_storage_error(e, &rule.id))?;
        Ok(rule)
    }

    /// Reads one schedule rule.
    pub async fn get_rule(&self, rule_id: &str) -> Result<ScheduleRule, BrainError> {
        self.read(rule_id).await
    }

    /// CAS read-modify-write of a rule.
    pub async fn mutate_rule(
        &self,
        rule_id: &str,
        mutation: RuleMutation<'_>,
    ) -> Result<Mutated<ScheduleRule>, BrainError> {
        self.mutate_versioned(rule_id, mutation).await
    }

    /// Every rule ordered by id.
    pub async fn list_rules(&self) -> Result<Vec<ScheduleRule>, BrainError> {
        let mut rules = self.read_all::<ScheduleRule>().await?;
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    /// Deletes a rule.
    pub async fn remove_rule(&self, rule_id: &str) -> Result<bool, BrainError> {
        self.backend
            .delete(&make_key(Namespace::Rules, rule_id))
            .await
            .map_err(|e| Self::map_storage_error(e, rule_id))
    }
}

// ---- Blanket TaskStore impl ----

#[async_trait]
impl<B: StorageBackend + 'static> TaskStore for GenericTaskStore<B> {
    async fn create_batch(&self, records: Vec<TaskRecord>) -> Result<Vec<TaskRecord>, BrainError> {
        GenericTaskStore::create_batch(self, records).await
    }

    async fn get(&self, task_id: &str) -> Result<TaskRecord, BrainError> {
        GenericTaskStore::get(self, task_id).await
    }

    async fn mutate(
        &self,
        task_id: &str,
        mutation: TaskMutation<'_>,
    ) -> Result<Mutated<TaskRecord>, BrainError> {
        GenericTaskStore::mutate(self, task_id, mutation).await
    }

    async fn list(&self, filter: &TaskFilter) -> Result<TaskPage, BrainError> {
        GenericTaskStore::list(self, filter).await
    }

    async fn scan(&self, statuses: &[TaskStatus]) -> Result<Vec<TaskRecord>, BrainError> {
        GenericTaskStore::scan(self, statuses).await
    }

    async fn remove(&self, task_id: &str) -> Result<bool, BrainError> {
        GenericTaskStore::remove(self, task_id).await
    }

    async fn create_rule(&self, rule: ScheduleRule) -> Result<ScheduleRule, BrainError> {
        GenericTaskStore::create_rule(self, rule).await
    }

    async fn get_rule(&self, rule_id: &str) -> Result<ScheduleRule, BrainError> {
        GenericTaskStore::get_rule(self, rule_id).await
    }

    async fn mutate_rule(
        &self,
        rule_id: &str,
        mutation: RuleMutation<'_>,
    ) -> Result<Mutated<ScheduleRule>, BrainError> {
        GenericTaskStore::mutate_rule(self, rule_id, mutation).await
    }

    async fn list_rules(&self) -> Result<Vec<ScheduleRule>, BrainError> {
        GenericTaskStore::list_rules(self).await
    }

    async fn remove_rule(&self, rule_id: &str) -> Result<bool, BrainError> {
        GenericTaskStore::remove_rule(self, rule_id).await
    }

    fn config(&self) -> &StoreConfig {
        &self.config
    }
}

fn encode_cursor(task: &Task) -> String {
    let nanos = task
        .created_at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| task.created_at.timestamp_micros().saturating_mul(1_000));
    format!("{nanos}:{}", task.id)
}

fn decode_cursor(cursor: &str) -> Result<(DateTime<Utc>, &str), BrainError> {
    cursor
        .split_once(':')
        .and_then(|(nanos, id)| Some((DateTime::from_timestamp_nanos(nanos.parse().ok()?), id)))
        .ok_or_else(|| BrainError::validation(format!("invalid cursor: {cursor:?}")))
}
