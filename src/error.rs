//! Error types for Brain operations.
//!
//! [`BrainError`] is what callers of the controller, planner and store see.
//! Failures raised by executors are a separate type,
//! [`ExecutionError`](crate::executor::ExecutionError), because they never
//! reach a caller synchronously: they are recorded on the task and drive the
//! retry policy instead.

use thiserror::Error;

use crate::types::task::{TaskStatus, TaskType};

/// Errors surfaced synchronously by Brain operations.
///
/// # Examples
///
/// ```
/// use brain::{BrainError, TaskStatus};
///
/// let err = BrainError::InvalidState {
///     task_id: "t-1".to_string(),
///     status: TaskStatus::Running,
///     operation: "pause",
/// };
/// assert!(err.to_string().contains("pause"));
/// assert!(err.is_caller_error());
/// ```
#[derive(Error, Debug)]
pub enum BrainError {
    /// Malformed request or cyclic dependency graph. Nothing was persisted.
    #[error("validation failed: {message}")]
    Validation {
        /// Human-readable reason.
        message: String,
    },

    /// No executor is registered for the requested task type.
    #[error("no executor registered for task type {task_type}")]
    UnsupportedType {
        /// The rejected type.
        task_type: TaskType,
    },

    /// Unknown task or schedule rule id.
    #[error("not found: {id}")]
    NotFound {
        /// The id that was looked up.
        id: String,
    },

    /// The operation is not valid from the task's current status.
    #[error("cannot {operation} task {task_id} in status {status}")]
    InvalidState {
        /// The task the operation targeted.
        task_id: String,
        /// The status the task was in.
        status: TaskStatus,
        /// The rejected operation.
        operation: &'static str,
    },

    /// A compare-and-swap write lost against a concurrent writer and the
    /// retry budget was exhausted.
    #[error("concurrent modification of {id}: expected version {expected_version}, found {actual_version}")]
    ConcurrentModification {
        /// The contended record.
        id: String,
        /// Version the writer read.
        expected_version: u64,
        /// Version found at write time.
        actual_version: u64,
    },

    /// Payload exceeds the configured size limit.
    #[error("payload of {actual_bytes} bytes exceeds limit of {limit_bytes} bytes")]
    PayloadTooLarge {
        /// Configured limit.
        limit_bytes: usize,
        /// Actual serialized size.
        actual_bytes: usize,
    },

    /// The storage backend failed.
    #[error("store error: {0}")]
    Store(String),

    /// The runtime is already started or not running.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl BrainError {
    /// Shorthand for a [`BrainError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for a [`BrainError::NotFound`].
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Returns `true` for errors caused by the request itself.
    ///
    /// These are never retried and leave no state behind.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::UnsupportedType { .. }
                | Self::NotFound { .. }
                | Self::InvalidState { .. }
                | Self::PayloadTooLarge { .. }
        )
    }

    /// Returns `true` when repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. } | Self::Store(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = BrainError> = std::result::Result<T, E>;
