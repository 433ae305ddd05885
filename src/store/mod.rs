//! Task store trait, generic implementation, and supporting types.
//!
//! # Architecture
//!
//! Storage has three layers:
//!
//! 1. **[`TaskStore`]**: the object-safe interface every component holds as
//!    `Arc<dyn TaskStore>`.
//! 2. **[`GenericTaskStore<B>`](generic::GenericTaskStore)**: all store
//!    domain logic (batch creation, CAS read-modify-write, claims, listing,
//!    rule storage, archival). Has a blanket `TaskStore` impl.
//! 3. **[`StorageBackend`]**: dumb KV trait implemented by the in-memory,
//!    file and Redis backends.
//!
//! # Backends
//!
//! - [`InMemoryBackend`](memory::InMemoryBackend): `DashMap`, for tests and
//!   single-process embedding.
//! - [`FileBackend`](file::FileBackend): one JSON file per record with
//!   atomic replace; survives restarts.
//! - `RedisBackend`: shared store for multiple replicas, behind the `redis`
//!   feature.

pub mod backend;
pub mod file;
pub mod generic;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

pub use backend::{StorageBackend, StorageError, VersionedRecord};
pub use generic::GenericTaskStore;

use crate::config::StorageConfig;
use crate::domain::{Lease, TaskRecord};
use crate::error::BrainError;
use crate::types::schedule::ScheduleRule;
use crate::types::task::{Task, TaskStatus, TaskType};

/// Limits enforced by the store on every write.
///
/// # Defaults
///
/// | Setting              | Default   | Description                              |
/// |----------------------|-----------|------------------------------------------|
/// | `max_payload_bytes`  | 1,048,576 | Serialized payload size per task         |
/// | `max_payload_depth`  | 16        | JSON nesting depth                       |
/// | `max_string_length`  | 65,536    | Bytes per string value or key            |
/// | `max_batch_size`     | 1,000     | Tasks per planned batch                  |
/// | `max_cas_retries`    | 16        | Re-reads after a version conflict        |
///
/// # Examples
///
/// ```
/// use brain::store::StoreConfig;
///
/// let config = StoreConfig::default();
/// assert_eq!(config.max_payload_bytes, 1_048_576);
/// assert_eq!(config.max_cas_retries, 16);
/// ```
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum serialized payload size in bytes.
    pub max_payload_bytes: usize,
    /// Maximum payload nesting depth.
    pub max_payload_depth: usize,
    /// Maximum bytes for any string inside a payload.
    pub max_string_length: usize,
    /// Maximum number of tasks in one submission.
    pub max_batch_size: usize,
    /// How often a mutation re-reads after losing a CAS race.
    pub max_cas_retries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1_048_576,
            max_payload_depth: 16,
            max_string_length: 65_536,
            max_batch_size: 1_000,
            max_cas_retries: 16,
        }
    }
}

/// Query filter for [`TaskStore::list`].
///
/// Empty vectors mean "any". Pagination is by opaque cursor, produced by
/// the store and passed back verbatim.
///
/// # Examples
///
/// ```
/// use brain::store::TaskFilter;
/// use brain::{TaskStatus, TaskType};
///
/// let filter = TaskFilter::default()
///     .with_status(TaskStatus::Ready)
///     .with_type(TaskType::OrderProcess)
///     .with_limit(10);
/// assert_eq!(filter.limit, Some(10));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    /// Accepted statuses.
    pub statuses: Vec<TaskStatus>,
    /// Accepted task types.
    pub task_types: Vec<TaskType>,
    /// Only tasks created at or after this instant.
    pub created_after: Option<DateTime<Utc>>,
    /// Only tasks created strictly before this instant.
    pub created_before: Option<DateTime<Utc>>,
    /// Only tasks of this batch.
    pub parent_id: Option<String>,
    /// Only instances of this schedule rule.
    pub rule_id: Option<String>,
    /// Resume after this cursor.
    pub cursor: Option<String>,
    /// Page size; `None` uses the store default of 50.
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Adds an accepted status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    /// Adds an accepted task type.
    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_types.push(task_type);
        self
    }

    /// Restricts to a creation time window `[after, before)`.
    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    /// Restricts to one batch.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Sets the page size.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Continues from a previous page.
    pub fn after_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Returns `true` if the task passes every criterion (cursor and limit
    /// are applied by the store).
    pub fn matches(&self, task: &Task) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&task.status))
            && (self.task_types.is_empty() || self.task_types.contains(&task.task_type))
            && self.created_after.is_none_or(|t| task.created_at >= t)
            && self.created_before.is_none_or(|t| task.created_at < t)
            && self
                .parent_id
                .as_ref()
                .is_none_or(|p| task.parent_id.as_ref() == Some(p))
            && self
                .rule_id
                .as_ref()
                .is_none_or(|r| task.rule_id.as_ref() == Some(r))
    }
}

/// A page of tasks.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskPage {
    /// Tasks of this page, newest first.
    pub tasks: Vec<Task>,
    /// Cursor for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Result of a CAS read-modify-write.
#[derive(Debug, Clone)]
pub struct Mutated<T> {
    /// The value as read before the mutation.
    pub before: T,
    /// The value as stored afterwards (equal to `before` when unchanged).
    pub after: T,
    /// `false` when the mutation decided nothing needed writing.
    pub changed: bool,
}

/// Mutation callback for tasks.
///
/// Returns `Ok(true)` to write, `Ok(false)` to leave the record untouched,
/// or an error to abort. It may run more than once when a concurrent
/// writer wins the CAS race, each time against the freshly read record.
pub type TaskMutation<'a> = &'a (dyn Fn(&mut TaskRecord) -> Result<bool, BrainError> + Send + Sync);

/// Mutation callback for schedule rules, with the same contract as
/// [`TaskMutation`].
pub type RuleMutation<'a> =
    &'a (dyn Fn(&mut ScheduleRule) -> Result<bool, BrainError> + Send + Sync);

/// Object-safe interface for task storage.
///
/// A blanket implementation is provided for
/// [`GenericTaskStore<B>`](generic::GenericTaskStore).
///
/// # Atomicity
///
/// [`mutate`](TaskStore::mutate) is a compare-and-swap loop over a single
/// record. Every state change in the system goes through it, which makes
/// [`claim`](TaskStore::claim) mutually exclusive across threads and across
/// processes sharing a backend.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persists a batch of new tasks.
    ///
    /// Payload limits are checked for every task before anything is
    /// written. If a write fails midway, already written tasks of the batch
    /// are removed again.
    ///
    /// # Errors
    ///
    /// - [`BrainError::Validation`] / [`BrainError::PayloadTooLarge`] for
    ///   payloads over the configured limits.
    /// - [`BrainError::Store`] on backend failures.
    async fn create_batch(&self, records: Vec<TaskRecord>) -> Result<Vec<TaskRecord>, BrainError>;

    /// Reads one task.
    ///
    /// # Errors
    ///
    /// - [`BrainError::NotFound`] for an unknown id.
    async fn get(&self, task_id: &str) -> Result<TaskRecord, BrainError>;

    /// Applies `mutation` with compare-and-swap, re-reading on conflicts.
    ///
    /// # Errors
    ///
    /// - Whatever `mutation` returns.
    /// - [`BrainError::ConcurrentModification`] when the retry budget runs
    ///   out.
    /// - [`BrainError::NotFound`] for an unknown id.
    async fn mutate(
        &self,
        task_id: &str,
        mutation: TaskMutation<'_>,
    ) -> Result<Mutated<TaskRecord>, BrainError>;

    /// Lists tasks matching `filter`, newest first.
    async fn list(&self, filter: &TaskFilter) -> Result<TaskPage, BrainError>;

    /// Returns every record in one of `statuses` (all records when empty),
    /// including locking metadata.
    async fn scan(&self, statuses: &[TaskStatus]) -> Result<Vec<TaskRecord>, BrainError>;

    /// Deletes a task. Returns `false` if it did not exist.
    async fn remove(&self, task_id: &str) -> Result<bool, BrainError>;

    /// Persists a new schedule rule.
    async fn create_rule(&self, rule: ScheduleRule) -> Result<ScheduleRule, BrainError>;

    /// Reads one schedule rule.
    async fn get_rule(&self, rule_id: &str) -> Result<ScheduleRule, BrainError>;

    /// CAS read-modify-write of a rule; see [`mutate`](TaskStore::mutate).
    async fn mutate_rule(
        &self,
        rule_id: &str,
        mutation: RuleMutation<'_>,
    ) -> Result<Mutated<ScheduleRule>, BrainError>;

    /// Every rule, ordered by id.
    async fn list_rules(&self) -> Result<Vec<ScheduleRule>, BrainError>;

    /// Deletes a rule. Returns `false` if it did not exist.
    async fn remove_rule(&self, rule_id: &str) -> Result<bool, BrainError>;

    /// The limits this store enforces.
    fn config(&self) -> &StoreConfig;

    /// Atomically moves a claimable `Ready` task to `Running` under a new
    /// lease.
    ///
    /// Returns `Ok(None)` when the task is no longer claimable, typically
    /// because another dispatcher won the race. Losing a claim is not an
    /// error.
    async fn claim(
        &self,
        task_id: &str,
        consumer_id: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, BrainError> {
        let mutation = |record: &mut TaskRecord| -> Result<bool, BrainError> {
            if !record.is_claimable(now) {
                return Ok(false);
            }
            record.set_status(TaskStatus::Running, now);
            record.task.not_before = None;
            record.lease = Some(Lease::new(consumer_id, now, lease_ttl));
            Ok(true)
        };
        let outcome = self.mutate(task_id, &mutation).await?;
        Ok(outcome.changed.then_some(outcome.after))
    }
}

/// Opens the store selected by `storage`, enforcing `limits`.
///
/// # Errors
///
/// [`BrainError::Store`] if the backend cannot be opened, or if Redis is
/// selected without the `redis` feature.
pub async fn open_store(
    storage: &StorageConfig,
    limits: StoreConfig,
) -> Result<Arc<dyn TaskStore>, BrainError> {
    let store: Arc<dyn TaskStore> = match storage {
        StorageConfig::Memory => {
            Arc::new(GenericTaskStore::new(memory::InMemoryBackend::new()).with_config(limits))
        }
        StorageConfig::File { path } => {
            let backend = file::FileBackend::open(path.clone())
                .map_err(|e| BrainError::Store(format!("{}: {e}", path.display())))?;
            Arc::new(GenericTaskStore::new(backend).with_config(limits))
        }
        #[cfg(feature = "redis")]
        StorageConfig::Redis { url, prefix } => {
            let backend = redis::RedisBackend::new(url)
                .await
                .map_err(|e| BrainError::Store(e.to_string()))?
                .with_prefix(prefix.clone());
            Arc::new(GenericTaskStore::new(backend).with_config(limits))
        }
        #[cfg(not(feature = "redis"))]
        StorageConfig::Redis { .. } => {
            return Err(BrainError::Store(
                "redis storage requires the `redis` feature".to_string(),
            ));
        }
    };
    tracing::info!(backend = storage.name(), "task store opened");
    Ok(store)
}
