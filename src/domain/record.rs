//! Task record: the store's internal representation of a task.
//!
//! [`TaskRecord`] wraps the caller-facing [`Task`] with the fields that only
//! the store and the claim protocol care about: the execution [`Lease`] and
//! the CAS version.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::schedule::{ScheduleSpec, TaskTemplate};
use crate::types::task::{Task, TaskStatus, TaskType};

/// Proof that a consumer holds the right to run one attempt of a task.
///
/// Outcome reports must present the same `token`; a report for a lease
/// that was since reaped or replaced is stale and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Unique per claim.
    pub token: String,
    /// Consumer that holds the lease.
    pub consumer_id: String,
    /// When the claim was made.
    pub claimed_at: DateTime<Utc>,
    /// After this instant the lease may be reaped as a timeout.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Creates a lease with a fresh token.
    pub fn new(consumer_id: impl Into<String>, claimed_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            consumer_id: consumer_id.into(),
            claimed_at,
            expires_at: claimed_at + ttl,
        }
    }

    /// Returns `true` once `now` is past the lease deadline.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Internal storage representation of a task.
///
/// # Examples
///
/// ```
/// use brain::domain::TaskRecord;
/// use brain::{TaskStatus, TaskType};
/// use chrono::Utc;
/// use serde_json::json;
///
/// let record = TaskRecord::new(TaskType::OrderProcess, json!({"order": 42}), 3, Utc::now());
/// assert_eq!(record.task.status, TaskStatus::Pending);
/// assert_eq!(record.task.id.len(), 36);
/// assert!(record.lease.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// The caller-facing task.
    pub task: Task,

    /// Present only while the task is `Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,

    /// Store version; filled in on every read, never serialized.
    #[serde(skip)]
    pub version: u64,
}

impl TaskRecord {
    /// Creates a `Pending` record with a UUID v4 id.
    pub fn new(task_type: TaskType, payload: Value, max_attempts: u32, now: DateTime<Utc>) -> Self {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            task_type,
            status: TaskStatus::Pending,
            priority: 0,
            payload,
            parent_id: None,
            dependency_ids: Default::default(),
            schedule: None,
            rule_id: None,
            attempt_count: 0,
            max_attempts,
            last_error: None,
            result: None,
            not_before: None,
            cancel_requested: false,
            paused_from: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        Self {
            task,
            lease: None,
            version: 0,
        }
    }

    /// Stamps out one instance of a schedule rule's template.
    ///
    /// The instance is scheduled for `fire_at`, so it is promoted on the
    /// next scheduling pass.
    pub fn from_template(
        template: &TaskTemplate,
        rule_id: &str,
        fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut record = Self::new(
            template.task_type,
            template.payload.clone(),
            template.max_attempts,
            now,
        );
        record.task.priority = template.priority;
        record.task.rule_id = Some(rule_id.to_string());
        record.task.schedule = Some(ScheduleSpec::At { run_at: fire_at });
        record
    }

    /// The task's id.
    pub fn id(&self) -> &str {
        &self.task.id
    }

    /// The task's current status.
    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    /// Returns the caller-facing view without locking metadata.
    pub fn to_task(&self) -> Task {
        self.task.clone()
    }

    /// Returns `true` if the running attempt's lease has lapsed.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.task.status == TaskStatus::Running
            && self.lease.as_ref().is_some_and(|lease| lease.is_expired(now))
    }

    /// Returns `true` if the task may be claimed at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.task.status == TaskStatus::Ready
            && !self.task.cancel_requested
            && self.task.has_attempts_left()
            && self.task.not_before.is_none_or(|t| t <= now)
    }

    /// See [`Task::is_ready_to_archive`].
    pub fn is_ready_to_archive(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.task.is_ready_to_archive(now, retention)
    }

    /// Moves the task to `status`, maintaining timestamps.
    ///
    /// Callers validate the transition first; this only records it.
    pub(crate) fn set_status(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.task.status = status;
        self.task.updated_at = now;
        if status.is_terminal() {
            self.task.completed_at = Some(now);
            self.lease = None;
        } else {
            self.task.completed_at = None;
        }
    }
}

/// Errors from payload shape validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadViolation {
    /// Nesting deeper than allowed.
    TooDeep {
        /// Configured limit.
        max_depth: usize,
    },
    /// A string longer than allowed.
    StringTooLong {
        /// Configured limit.
        max_length: usize,
        /// Actual length.
        actual: usize,
    },
}

impl std::fmt::Display for PayloadViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooDeep { max_depth } => {
                write!(f, "payload nesting exceeds {max_depth} levels")
            }
            Self::StringTooLong { max_length, actual } => {
                write!(f, "payload string of {actual} bytes exceeds {max_length}")
            }
        }
    }
}

/// Rejects payloads that are nested too deeply or carry oversized strings.
///
/// Walks the value with an explicit stack, so hostile input cannot
/// overflow the call stack.
///
/// # Examples
///
/// ```
/// use brain::domain::record::validate_payload;
/// use serde_json::json;
///
/// assert!(validate_payload(&json!({"a": [1, 2, {"b": "c"}]}), 8, 64).is_ok());
/// assert!(validate_payload(&json!([[[[1]]]]), 2, 64).is_err());
/// ```
pub fn validate_payload(
    value: &Value,
    max_depth: usize,
    max_string_length: usize,
) -> Result<(), PayloadViolation> {
    let mut stack: Vec<(&Value, usize)> = vec![(value, 0)];
    while let Some((current, depth)) = stack.pop() {
        match current {
            Value::String(s) if s.len() > max_string_length => {
                return Err(PayloadViolation::StringTooLong {
                    max_length: max_string_length,
                    actual: s.len(),
                });
            }
            Value::Array(items) => {
                if depth + 1 > max_depth {
                    return Err(PayloadViolation::TooDeep { max_depth });
                }
                stack.extend(items.iter().map(|v| (v, depth + 1)));
            }
            Value::Object(map) => {
                if depth + 1 > max_depth {
                    return Err(PayloadViolation::TooDeep { max_depth });
                }
                for (key, v) in map {
                    if key.len() > max_string_length {
                        return Err(PayloadViolation::StringTooLong {
                            max_length: max_string_length,
                            actual: key.len(),
                        });
                    }
                    stack.push((v, depth + 1));
                }
            }
            _ => {}
        }
    }
    Ok(())
}
