//! Executor registration interface.
//!
//! The Brain never performs work itself. For every [`TaskType`] the
//! embedding application registers an [`Executor`]; consumers hand each
//! claimed attempt to it and record the outcome.
//!
//! Cancellation is cooperative: an executor that can stop early should call
//! [`ExecutionContext::checkpoint`] between steps and return its error.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::store::TaskStore;
use crate::types::task::{Task, TaskStatus, TaskType};

/// Failure reported by an executor.
///
/// Retryable errors put the task back in line with backoff while attempts
/// remain; permanent errors fail it immediately.
///
/// # Examples
///
/// ```
/// use brain::executor::ExecutionError;
///
/// let err = ExecutionError::new("upstream 503");
/// assert!(err.retryable);
///
/// let err = ExecutionError::permanent("malformed order");
/// assert!(!err.retryable);
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ExecutionError {
    /// Human-readable reason.
    pub message: String,
    /// Whether another attempt may succeed.
    pub retryable: bool,
    /// Set when the executor stopped at a cancellation checkpoint.
    pub cancelled: bool,
    /// Structured details recorded on the task.
    pub details: Option<Value>,
}

impl ExecutionError {
    /// A retryable failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            cancelled: false,
            details: None,
        }
    }

    /// A failure that no retry will fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(message)
        }
    }

    /// The executor observed a cancellation request and stopped.
    pub fn cancelled() -> Self {
        Self {
            message: "cancelled at checkpoint".to_string(),
            retryable: false,
            cancelled: true,
            details: None,
        }
    }

    /// Attaches structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Everything an executor gets to see about one attempt.
#[derive(Clone)]
pub struct ExecutionContext {
    task: Task,
    attempt: u32,
    lease_token: String,
    cancel: CancellationToken,
    store: Arc<dyn TaskStore>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("task_id", &self.task.id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    pub(crate) fn new(
        task: Task,
        lease_token: String,
        cancel: CancellationToken,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        let attempt = task.attempt_count + 1;
        Self {
            task,
            attempt,
            lease_token,
            cancel,
            store,
        }
    }

    /// The task as it was when claimed.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// The task's payload.
    pub fn payload(&self) -> &Value {
        &self.task.payload
    }

    /// One-based number of this attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Token cancelled when cancellation of this task is requested in this
    /// process. Useful in `tokio::select!`.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns `true` if cancellation was signalled in this process.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cooperative cancellation point.
    ///
    /// Checks the local token first, then the stored task, so requests made
    /// through another replica are observed too. Also stops when the lease
    /// was lost (reaped as timed out and handed to someone else).
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::cancelled`] when the attempt should stop.
    pub async fn checkpoint(&self) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            return Err(ExecutionError::cancelled());
        }
        match self.store.get(&self.task.id).await {
            Ok(record) => {
                let lease_held = record
                    .lease
                    .as_ref()
                    .is_some_and(|lease| lease.token == self.lease_token);
                if record.task.cancel_requested
                    || record.task.status != TaskStatus::Running
                    || !lease_held
                {
                    self.cancel.cancel();
                    return Err(ExecutionError::cancelled());
                }
                Ok(())
            }
            Err(e) => {
                // A store hiccup is no reason to abandon the work.
                tracing::debug!(task_id = %self.task.id, error = %e, "checkpoint read failed");
                Ok(())
            }
        }
    }
}

/// Performs the work of one task type.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use brain::executor::{ExecutionContext, ExecutionError, Executor};
/// use serde_json::{json, Value};
///
/// struct Echo;
///
/// #[async_trait]
/// impl Executor for Echo {
///     async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutionError> {
///         ctx.checkpoint().await?;
///         Ok(json!({ "echo": ctx.payload() }))
///     }
/// }
/// ```
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs one attempt and returns its result payload.
    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutionError>;
}

/// Adapts an async closure into an [`Executor`].
pub struct FnExecutor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ExecutionError>> + Send,
{
    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutionError> {
        (self.f)(ctx).await
    }
}

/// Wraps an async closure as a shareable executor.
///
/// # Examples
///
/// ```
/// use brain::executor::executor_fn;
/// use serde_json::json;
///
/// let exec = executor_fn(|ctx| async move { Ok(json!({ "attempt": ctx.attempt() })) });
/// ```
pub fn executor_fn<F, Fut>(f: F) -> Arc<dyn Executor>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ExecutionError>> + Send + 'static,
{
    Arc::new(FnExecutor { f })
}

/// Mapping from task type to executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn Executor>>,
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl ExecutorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the executor for `task_type`.
    pub fn register(&mut self, task_type: TaskType, executor: Arc<dyn Executor>) {
        if self.executors.insert(task_type, executor).is_some() {
            tracing::debug!(task_type = %task_type, "replaced executor");
        }
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, task_type: TaskType, executor: Arc<dyn Executor>) -> Self {
        self.register(task_type, executor);
        self
    }

    /// The executor for `task_type`, if registered.
    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn Executor>> {
        self.executors.get(&task_type).cloned()
    }

    /// Returns `true` if `task_type` has an executor.
    pub fn supports(&self, task_type: TaskType) -> bool {
        self.executors.contains_key(&task_type)
    }

    /// Registered types in declaration order.
    pub fn types(&self) -> Vec<TaskType> {
        TaskType::ALL
            .into_iter()
            .filter(|t| self.executors.contains_key(t))
            .collect()
    }
}
