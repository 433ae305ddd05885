//! Task event records published on the [`EventBus`](crate::events::EventBus).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::task::{ErrorDescriptor, Task, TaskStatus, TaskType};

/// What an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// A task was persisted by the planner or a schedule rule.
    Created,
    /// A task changed status.
    Transition,
    /// Cancellation was requested for a running task; the status is
    /// unchanged until the consumer reaches a checkpoint.
    CancelRequested,
    /// A task exhausted its attempts and is terminally failed.
    Alert,
}

/// One entry of the event feed.
///
/// Delivery is at-least-once: subscribers may see the same event twice and
/// must not rely on ordering between sibling tasks that finished
/// concurrently.
///
/// # Examples
///
/// ```
/// use brain::{TaskEvent, TaskEventKind, TaskStatus, TaskType};
///
/// let event: TaskEvent = serde_json::from_str(r#"{
///     "kind": "transition",
///     "task_id": "t-1",
///     "task_type": "MESSAGE_PUSH",
///     "old_status": "READY",
///     "new_status": "RUNNING",
///     "timestamp": "2025-01-01T00:00:00Z",
///     "attempt_count": 0
/// }"#).unwrap();
/// assert_eq!(event.kind, TaskEventKind::Transition);
/// assert_eq!(event.old_status, Some(TaskStatus::Ready));
/// assert!(event.error.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Event class.
    pub kind: TaskEventKind,
    /// Affected task.
    pub task_id: String,
    /// Type of the affected task.
    pub task_type: TaskType,
    /// Status before the change; `None` for creation events.
    #[serde(default)]
    pub old_status: Option<TaskStatus>,
    /// Status after the change.
    pub new_status: TaskStatus,
    /// When the change was committed.
    pub timestamp: DateTime<Utc>,
    /// Failure attached to the change, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
    /// Finished attempts at the time of the event.
    #[serde(default)]
    pub attempt_count: u32,
}

impl TaskEvent {
    fn from_task(kind: TaskEventKind, old_status: Option<TaskStatus>, task: &Task) -> Self {
        Self {
            kind,
            task_id: task.id.clone(),
            task_type: task.task_type,
            old_status,
            new_status: task.status,
            timestamp: task.updated_at,
            error: None,
            attempt_count: task.attempt_count,
        }
    }

    /// A creation event for a freshly persisted task.
    pub fn created(task: &Task) -> Self {
        Self::from_task(TaskEventKind::Created, None, task)
    }

    /// A status change from `old_status` to the task's current status.
    ///
    /// Failure-class transitions carry the task's `last_error`.
    pub fn transition(old_status: TaskStatus, task: &Task) -> Self {
        let mut event = Self::from_task(TaskEventKind::Transition, Some(old_status), task);
        let carries_error = matches!(
            (old_status, task.status),
            (_, TaskStatus::Failed | TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Ready)
        );
        if carries_error {
            event.error = task.last_error.clone();
        }
        event
    }

    /// A cancellation request against a running task.
    pub fn cancel_requested(task: &Task) -> Self {
        Self::from_task(TaskEventKind::CancelRequested, Some(task.status), task)
    }

    /// Attempts exhausted: the task is terminally failed.
    pub fn alert(task: &Task) -> Self {
        let mut event = Self::from_task(TaskEventKind::Alert, Some(task.status), task);
        event.error = task.last_error.clone();
        event
    }

    /// Returns `true` if the event reports a change in status.
    pub fn is_status_change(&self) -> bool {
        self.kind == TaskEventKind::Transition
    }
}
