//! Core task types: [`TaskType`], [`TaskStatus`], the [`Task`] view and
//! [`ErrorDescriptor`].
//!
//! # Serialization
//!
//! Task types and statuses serialize in `SCREAMING_SNAKE_CASE`
//! (`CUSTOMER_REPLY`, `RUNNING`) so that submission files, event feeds and
//! stored records share one vocabulary. Timestamps are RFC 3339 UTC.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BrainError;
use crate::types::schedule::ScheduleSpec;

/// The closed set of work item kinds the Brain routes.
///
/// Each type gets its own execution lane and must have an executor
/// registered before tasks of that type can be submitted.
///
/// # Examples
///
/// ```
/// use brain::TaskType;
///
/// let t: TaskType = "ORDER_PROCESS".parse().unwrap();
/// assert_eq!(t, TaskType::OrderProcess);
/// assert_eq!(t.to_string(), "ORDER_PROCESS");
/// assert!("SOMETHING_ELSE".parse::<TaskType>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Generate a reply to a customer conversation.
    CustomerReply,
    /// Push an outbound message.
    MessagePush,
    /// Process an order.
    OrderProcess,
    /// Check stock levels.
    InventoryCheck,
    /// Answer a price question.
    PriceInquiry,
    /// Track a shipment.
    LogisticsTrack,
    /// Fire a scheduled reminder.
    ScheduledReminder,
}

impl TaskType {
    /// Every task type, in declaration order.
    pub const ALL: [TaskType; 7] = [
        TaskType::CustomerReply,
        TaskType::MessagePush,
        TaskType::OrderProcess,
        TaskType::InventoryCheck,
        TaskType::PriceInquiry,
        TaskType::LogisticsTrack,
        TaskType::ScheduledReminder,
    ];

    /// The canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomerReply => "CUSTOMER_REPLY",
            Self::MessagePush => "MESSAGE_PUSH",
            Self::OrderProcess => "ORDER_PROCESS",
            Self::InventoryCheck => "INVENTORY_CHECK",
            Self::PriceInquiry => "PRICE_INQUIRY",
            Self::LogisticsTrack => "LOGISTICS_TRACK",
            Self::ScheduledReminder => "SCHEDULED_REMINDER",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = BrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| BrainError::validation(format!("unknown task type: {s}")))
    }
}

/// Task lifecycle status.
///
/// # State Machine
///
/// ```text
/// Pending  -> Ready, Paused, Cancelled
/// Ready    -> Running, Paused, Cancelled
/// Running  -> Succeeded, Failed, Cancelled, Ready (retry after failure/timeout)
/// Paused   -> Pending, Ready (back to where it was paused from), Cancelled
/// Failed   -> Ready (operator retry while attempts remain)
/// Succeeded, Cancelled -> (terminal)
/// ```
///
/// Nothing ever re-enters `Pending` from `Running`. Self-transitions are
/// rejected; idempotent control operations short-circuit before asking.
///
/// # Examples
///
/// ```
/// use brain::TaskStatus;
///
/// assert!(TaskStatus::Pending.can_transition_to(&TaskStatus::Ready));
/// assert!(!TaskStatus::Running.can_transition_to(&TaskStatus::Pending));
/// assert!(!TaskStatus::Succeeded.can_transition_to(&TaskStatus::Ready));
/// assert!(!TaskStatus::Ready.can_transition_to(&TaskStatus::Ready));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Dependencies unmet or scheduled time not reached.
    Pending,
    /// Eligible for dispatch.
    Ready,
    /// Claimed by a consumer.
    Running,
    /// Finished successfully (terminal).
    Succeeded,
    /// Finished unsuccessfully (terminal once attempts are exhausted).
    Failed,
    /// Cancelled (terminal).
    Cancelled,
    /// Held by an operator.
    Paused,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Paused,
    ];

    /// The canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Paused => "PAUSED",
        }
    }

    /// Returns `true` for `Succeeded`, `Failed` and `Cancelled`.
    ///
    /// A `Failed` task is still terminal for automatic processing; only an
    /// explicit retry can re-admit it, and only while attempts remain.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if moving from this status to `next` is allowed.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self == next {
            return false;
        }

        match self {
            Self::Pending => matches!(next, Self::Ready | Self::Paused | Self::Cancelled),
            Self::Ready => matches!(next, Self::Running | Self::Paused | Self::Cancelled),
            Self::Running => matches!(
                next,
                Self::Succeeded | Self::Failed | Self::Cancelled | Self::Ready
            ),
            Self::Paused => matches!(next, Self::Pending | Self::Ready | Self::Cancelled),
            Self::Failed => matches!(next, Self::Ready),
            Self::Succeeded | Self::Cancelled => false,
        }
    }

    /// Validates a transition, naming the attempted operation on rejection.
    ///
    /// # Errors
    ///
    /// Returns [`BrainError::InvalidState`] when the transition is not in the
    /// state machine.
    ///
    /// # Examples
    ///
    /// ```
    /// use brain::{BrainError, TaskStatus};
    ///
    /// assert!(TaskStatus::Ready.validate_transition("t", &TaskStatus::Paused, "pause").is_ok());
    ///
    /// let err = TaskStatus::Running
    ///     .validate_transition("t", &TaskStatus::Paused, "pause")
    ///     .unwrap_err();
    /// assert!(matches!(err, BrainError::InvalidState { operation: "pause", .. }));
    /// ```
    pub fn validate_transition(
        &self,
        task_id: &str,
        next: &Self,
        operation: &'static str,
    ) -> Result<(), BrainError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(BrainError::InvalidState {
                task_id: task_id.to_string(),
                status: *self,
                operation,
            })
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = BrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == wanted)
            .ok_or_else(|| BrainError::validation(format!("unknown task status: {s}")))
    }
}

/// Classifies why an attempt (or a whole task) ended badly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The executor reported an error.
    Execution,
    /// The attempt did not finish within its deadline.
    Timeout,
    /// The attempt stopped at a cancellation checkpoint.
    Cancelled,
    /// A dependency ended without succeeding.
    Dependency,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Execution => "EXECUTION",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Dependency => "DEPENDENCY",
        };
        f.write_str(s)
    }
}

/// The error recorded in [`Task::last_error`] and carried by failure events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Failure class.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Structured details from the executor, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

impl ErrorDescriptor {
    /// Creates a descriptor stamped with the given time.
    pub fn new(kind: ErrorKind, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            at,
        }
    }

    /// Attaches structured details.
    pub fn with_details(mut self, details: Option<Value>) -> Self {
        self.details = details;
        self
    }
}

/// The caller-facing view of a task.
///
/// Contains every data-model field except internal locking metadata
/// (leases and store versions), which live on
/// [`TaskRecord`](crate::domain::TaskRecord).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique, immutable identifier.
    pub id: String,
    /// Immutable work item kind.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Higher values dispatch first.
    #[serde(default)]
    pub priority: i32,
    /// Opaque data for the executor.
    #[serde(default)]
    pub payload: Value,
    /// Batch this task was planned in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Tasks that must succeed before this one becomes ready.
    #[serde(default)]
    pub dependency_ids: BTreeSet<String>,
    /// Fixed execution time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleSpec>,
    /// The schedule rule that instantiated this task, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    /// Finished attempts so far.
    pub attempt_count: u32,
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorDescriptor>,
    /// Executor output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Earliest time a retry may be dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// Set when cancellation was requested while running.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Status to restore on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_from: Option<TaskStatus>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// When the task reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Returns `true` if the task is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The fixed execution time, if the task has one.
    pub fn run_at(&self) -> Option<DateTime<Utc>> {
        match &self.schedule {
            Some(ScheduleSpec::At { run_at }) => Some(*run_at),
            _ => None,
        }
    }

    /// Returns `true` if another attempt may still be made.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Returns `true` if the task is terminal and finished longer ago than
    /// `retention`.
    ///
    /// # Examples
    ///
    /// ```
    /// use brain::{Task, TaskStatus, TaskType};
    /// use chrono::{Duration, Utc};
    ///
    /// # let now = Utc::now();
    /// let mut task = brain::domain::TaskRecord::new(TaskType::PriceInquiry, serde_json::json!({}), 3, now).task;
    /// assert!(!task.is_ready_to_archive(now, Duration::hours(1)));
    ///
    /// task.status = TaskStatus::Succeeded;
    /// task.completed_at = Some(now - Duration::hours(2));
    /// assert!(task.is_ready_to_archive(now, Duration::hours(1)));
    /// ```
    pub fn is_ready_to_archive(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        if !self.is_terminal() {
            return false;
        }
        let finished = self.completed_at.unwrap_or(self.updated_at);
        now - finished >= retention
    }
}
