//! Task lifecycle transitions.
//!
//! [`TaskLifecycle`] is the only code that changes a task's status. Every
//! transition is a compare-and-swap through [`TaskStore::mutate`], checked
//! against the state machine on [`TaskStatus`], and followed by an event on
//! the [`EventBus`] once the write is committed. Scheduler, dispatcher,
//! consumers and the controller all go through it.
//!
//! # Attempts
//!
//! `attempt_count` counts finished attempts. It goes up when an attempt
//! reports (success, failure, cancellation) and when a lease is reaped as
//! timed out. A claim is only granted while attempts remain, so the count
//! never exceeds `max_attempts`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::TaskRecord;
use crate::error::BrainError;
use crate::events::EventBus;
use crate::executor::ExecutionError;
use crate::retry::RetryPolicy;
use crate::store::{Mutated, TaskStore};
use crate::types::event::TaskEvent;
use crate::types::task::{ErrorDescriptor, ErrorKind, Task, TaskStatus};

/// How an attempt ended, as observed by its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The executor returned a result.
    Succeeded(Value),
    /// The executor returned an error.
    Failed(ExecutionError),
    /// The executor did not return within its deadline.
    TimedOut(Duration),
}

/// Applies state machine transitions and publishes their events.
#[derive(Clone)]
pub struct TaskLifecycle {
    store: Arc<dyn TaskStore>,
    events: EventBus,
    retry: RetryPolicy,
}

impl std::fmt::Debug for TaskLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLifecycle")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl TaskLifecycle {
    /// Creates a lifecycle over `store`, publishing to `events`.
    pub fn new(store: Arc<dyn TaskStore>, events: EventBus, retry: RetryPolicy) -> Self {
        Self {
            store,
            events,
            retry,
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// The event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn publish_transition(&self, mutated: &Mutated<TaskRecord>) {
        if mutated.changed && mutated.before.status() != mutated.after.status() {
            self.events
                .publish(TaskEvent::transition(mutated.before.status(), &mutated.after.task));
        }
    }

    // ─── Scheduler transitions ──────────────────────────────────────

    /// `Pending -> Ready`. Returns `None` if the task is no longer pending.
    ///
    /// The caller has established that dependencies succeeded and any
    /// fixed run time has passed.
    pub async fn promote(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, BrainError> {
        let mutation = |record: &mut TaskRecord| -> Result<bool, BrainError> {
            if record.status() != TaskStatus::Pending {
                return Ok(false);
            }
            record.set_status(TaskStatus::Ready, now);
            Ok(true)
        };
        let mutated = self.store.mutate(task_id, &mutation).await?;
        self.publish_transition(&mutated);
        if mutated.changed {
            tracing::debug!(task_id = %task_id, "promoted to ready");
        }
        Ok(mutated.changed.then(|| mutated.after.task))
    }

    /// `Pending -> Cancelled` because dependency `dependency_id` ended in
    /// `dependency_status`.
    pub async fn cancel_for_dependency(
        &self,
        task_id: &str,
        dependency_id: &str,
        dependency_status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, BrainError> {
        let mutation = |record: &mut TaskRecord| -> Result<bool, BrainError> {
            if record.status() != TaskStatus::Pending {
                return Ok(false);
            }
            record.task.last_error = Some(ErrorDescriptor::new(
                ErrorKind::Dependency,
                format!("dependency {dependency_id} ended {dependency_status}"),
                now,
            ));
            record.set_status(TaskStatus::Cancelled, now);
            Ok(true)
        };
        let mutated = self.store.mutate(task_id, &mutation).await?;
        self.publish_transition(&mutated);
        if mutated.changed {
            tracing::info!(
                task_id = %task_id,
                dependency_id = %dependency_id,
                dependency_status = %dependency_status,
                "cancelled after dependency failure"
            );
        }
        Ok(mutated.changed.then(|| mutated.after.task))
    }

    /// Reaps an expired lease: the attempt counts as timed out.
    ///
    /// A pending cancellation turns into `Cancelled`; otherwise the task
    /// goes back to `Ready` with backoff, or to `Failed` with an alert when
    /// no attempts remain. Returns `None` if the lease was not expired.
    pub async fn expire_lease(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, BrainError> {
        let retry = &self.retry;
        let mutation = |record: &mut TaskRecord| -> Result<bool, BrainError> {
            if !record.lease_expired(now) {
                return Ok(false);
            }
            let owner = record
                .lease
                .as_ref()
                .map(|lease| lease.consumer_id.clone())
                .unwrap_or_default();
            record.task.attempt_count += 1;
            if record.task.cancel_requested {
                record.task.last_error = Some(ErrorDescriptor::new(
                    ErrorKind::Cancelled,
                    format!("lease held by {owner} expired while cancellation was pending"),
                    now,
                ));
                record.set_status(TaskStatus::Cancelled, now);
                return Ok(true);
            }
            record.task.last_error = Some(ErrorDescriptor::new(
                ErrorKind::Timeout,
                format!("no outcome reported by {owner} before lease expiry"),
                now,
            ));
            settle_failure(record, retry, true, now);
            Ok(true)
        };
        let mutated = self.store.mutate(task_id, &mutation).await?;
        if !mutated.changed {
            return Ok(None);
        }
        tracing::warn!(
            task_id = %task_id,
            task_type = %mutated.after.task.task_type,
            attempt = mutated.after.task.attempt_count,
            status = %mutated.after.status(),
            "reaped expired lease"
        );
        self.finish(mutated)
    }

    // ─── Dispatch and outcome ───────────────────────────────────────

    /// `Ready -> Running` under a new lease; see [`TaskStore::claim`].
    pub async fn claim(
        &self,
        task_id: &str,
        consumer_id: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, BrainError> {
        let ttl = chrono::Duration::from_std(lease_ttl)
            .map_err(|e| BrainError::Runtime(format!("lease ttl out of range: {e}")))?;
        let claimed = self.store.claim(task_id, consumer_id, ttl, now).await?;
        if let Some(record) = &claimed {
            self.events
                .publish(TaskEvent::transition(TaskStatus::Ready, &record.task));
        }
        Ok(claimed)
    }

    /// Records the outcome of the attempt that holds `lease_token`.
    ///
    /// Returns `None` when the report is stale: the lease was reaped or the
    /// task was otherwise moved on since the claim.
    pub async fn report(
        &self,
        task_id: &str,
        lease_token: &str,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, BrainError> {
        let retry = &self.retry;
        let mutation = |record: &mut TaskRecord| -> Result<bool, BrainError> {
            let holds_lease = record
                .lease
                .as_ref()
                .is_some_and(|lease| lease.token == lease_token);
            if record.status() != TaskStatus::Running || !holds_lease {
                return Ok(false);
            }
            record.task.attempt_count += 1;
            match &outcome {
                AttemptOutcome::Succeeded(result) => {
                    record.task.result = Some(result.clone());
                    record.set_status(TaskStatus::Succeeded, now);
                }
                AttemptOutcome::Failed(err) if err.cancelled || record.task.cancel_requested => {
                    record.task.last_error = Some(
                        ErrorDescriptor::new(ErrorKind::Cancelled, err.message.clone(), now)
                            .with_details(err.details.clone()),
                    );
                    record.set_status(TaskStatus::Cancelled, now);
                }
                AttemptOutcome::Failed(err) => {
                    record.task.last_error = Some(
                        ErrorDescriptor::new(ErrorKind::Execution, err.message.clone(), now)
                            .with_details(err.details.clone()),
                    );
                    settle_failure(record, retry, err.retryable, now);
                }
                AttemptOutcome::TimedOut(after) if record.task.cancel_requested => {
                    record.task.last_error = Some(ErrorDescriptor::new(
                        ErrorKind::Cancelled,
                        format!("timed out after {after:?} while cancellation was pending"),
                        now,
                    ));
                    record.set_status(TaskStatus::Cancelled, now);
                }
                AttemptOutcome::TimedOut(after) => {
                    record.task.last_error = Some(ErrorDescriptor::new(
                        ErrorKind::Timeout,
                        format!("attempt timed out after {after:?}"),
                        now,
                    ));
                    settle_failure(record, retry, true, now);
                }
            }
            Ok(true)
        };

        let mutated = self.store.mutate(task_id, &mutation).await?;
        if !mutated.changed {
            tracing::warn!(
                task_id = %task_id,
                status = %mutated.after.status(),
                "ignoring stale outcome report"
            );
            return Ok(None);
        }
        self.finish(mutated)
    }

    fn finish(&self, mutated: Mutated<TaskRecord>) -> Result<Option<Task>, BrainError> {
        self.publish_transition(&mutated);
        let task = mutated.after.task;
        if task.status == TaskStatus::Failed && !task.has_attempts_left() {
            tracing::error!(
                task_id = %task.id,
                task_type = %task.task_type,
                attempts = task.attempt_count,
                "task failed after exhausting attempts"
            );
            self.events.publish(TaskEvent::alert(&task));
        }
        Ok(Some(task))
    }

    // ─── Control operations ─────────────────────────────────────────

    /// Holds a `Pending` or `Ready` task. Pausing a paused task is a no-op.
    ///
    /// # Errors
    ///
    /// [`BrainError::InvalidState`] for running or terminal tasks.
    pub async fn pause(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task, BrainError> {
        let mutation = |record: &mut TaskRecord| -> Result<bool, BrainError> {
            let status = record.status();
            if status == TaskStatus::Paused {
                return Ok(false);
            }
            status.validate_transition(task_id, &TaskStatus::Paused, "pause")?;
            record.task.paused_from = Some(status);
            record.set_status(TaskStatus::Paused, now);
            Ok(true)
        };
        let mutated = self.store.mutate(task_id, &mutation).await?;
        self.publish_transition(&mutated);
        Ok(mutated.after.task)
    }

    /// Returns a paused task to the status it was paused from. Resuming a
    /// `Pending` or `Ready` task is a no-op.
    ///
    /// # Errors
    ///
    /// [`BrainError::InvalidState`] for running or terminal tasks.
    pub async fn resume(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task, BrainError> {
        let mutation = |record: &mut TaskRecord| -> Result<bool, BrainError> {
            match record.status() {
                TaskStatus::Pending | TaskStatus::Ready => Ok(false),
                TaskStatus::Paused => {
                    let target = record.task.paused_from.take().unwrap_or(TaskStatus::Pending);
                    TaskStatus::Paused.validate_transition(task_id, &target, "resume")?;
                    record.set_status(target, now);
                    Ok(true)
                }
                status => Err(BrainError::InvalidState {
                    task_id: task_id.to_string(),
                    status,
                    operation: "resume",
                }),
            }
        };
        let mutated = self.store.mutate(task_id, &mutation).await?;
        self.publish_transition(&mutated);
        Ok(mutated.after.task)
    }

    /// Cancels a task.
    ///
    /// `Pending`, `Ready` and `Paused` tasks are cancelled immediately. For
    /// a `Running` task the request is recorded and the consumer stops at
    /// its next checkpoint; the returned view is still `Running` with
    /// `cancel_requested` set. Cancelling a cancelled task is a no-op.
    ///
    /// # Errors
    ///
    /// [`BrainError::InvalidState`] for succeeded or failed tasks.
    pub async fn cancel(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task, BrainError> {
        let mutation = |record: &mut TaskRecord| -> Result<bool, BrainError> {
            match record.status() {
                TaskStatus::Cancelled => Ok(false),
                TaskStatus::Running if record.task.cancel_requested => Ok(false),
                TaskStatus::Running => {
                    record.task.cancel_requested = true;
                    record.task.updated_at = now;
                    Ok(true)
                }
                status => {
                    status.validate_transition(task_id, &TaskStatus::Cancelled, "cancel")?;
                    record.task.last_error = Some(ErrorDescriptor::new(
                        ErrorKind::Cancelled,
                        format!("cancelled while {status}"),
                        now,
                    ));
                    record.set_status(TaskStatus::Cancelled, now);
                    Ok(true)
                }
            }
        };
        let mutated = self.store.mutate(task_id, &mutation).await?;
        if mutated.changed && mutated.after.status() == TaskStatus::Running {
            tracing::info!(task_id = %task_id, "cancellation requested for running task");
            self.events
                .publish(TaskEvent::cancel_requested(&mutated.after.task));
        } else {
            self.publish_transition(&mutated);
        }
        Ok(mutated.after.task)
    }

    /// Makes a task eligible for another attempt.
    ///
    /// A `Failed` task with attempts left goes back to `Ready`. For a
    /// `Ready` task any remaining backoff is cleared; `Running` tasks are
    /// left alone.
    ///
    /// # Errors
    ///
    /// [`BrainError::InvalidState`] for failed tasks without attempts left
    /// and for pending, paused, succeeded or cancelled tasks.
    pub async fn retry(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task, BrainError> {
        let mutation = |record: &mut TaskRecord| -> Result<bool, BrainError> {
            let status = record.status();
            match status {
                TaskStatus::Running => Ok(false),
                TaskStatus::Ready => {
                    if record.task.not_before.take().is_none() {
                        return Ok(false);
                    }
                    record.task.updated_at = now;
                    Ok(true)
                }
                TaskStatus::Failed if record.task.has_attempts_left() => {
                    record.task.not_before = None;
                    record.task.cancel_requested = false;
                    record.set_status(TaskStatus::Ready, now);
                    Ok(true)
                }
                _ => Err(BrainError::InvalidState {
                    task_id: task_id.to_string(),
                    status,
                    operation: "retry",
                }),
            }
        };
        let mutated = self.store.mutate(task_id, &mutation).await?;
        self.publish_transition(&mutated);
        Ok(mutated.after.task)
    }
}

/// Routes a failed attempt: back to `Ready` with backoff while retryable
/// and attempts remain, otherwise `Failed`.
fn settle_failure(
    record: &mut TaskRecord,
    retry: &RetryPolicy,
    retryable: bool,
    now: DateTime<Utc>,
) {
    if retryable && record.task.has_attempts_left() {
        let attempt = record.task.attempt_count;
        record.task.not_before = Some(retry.next_eligible(&record.task.id, attempt, now));
        record.lease = None;
        record.set_status(TaskStatus::Ready, now);
    } else {
        record.set_status(TaskStatus::Failed, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryTaskStore;
    use crate::types::event::TaskEventKind;
    use crate::types::task::TaskType;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(30);

    async fn setup(status: TaskStatus, max_attempts: u32) -> (TaskLifecycle, String) {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::in_memory());
        let lifecycle = TaskLifecycle::new(store, EventBus::new(64), RetryPolicy::immediate());
        let mut record = TaskRecord::new(TaskType::OrderProcess, json!({}), max_attempts, Utc::now());
        record.task.status = status;
        let id = record.task.id.clone();
        lifecycle.store.create_batch(vec![record]).await.unwrap();
        (lifecycle, id)
    }

    async fn claimed(max_attempts: u32) -> (TaskLifecycle, String, String) {
        let (lifecycle, id) = setup(TaskStatus::Ready, max_attempts).await;
        let record = lifecycle
            .claim(&id, "c-1", TTL, Utc::now())
            .await
            .unwrap()
            .unwrap();
        let token = record.lease.unwrap().token;
        (lifecycle, id, token)
    }

    // ─── Outcomes ───────────────────────────────────────────────────

    #[tokio::test]
    async fn success_records_result_and_counts_attempt() {
        let (lc, id, token) = claimed(3).await;
        let task = lc
            .report(&id, &token, AttemptOutcome::Succeeded(json!({"ok": true})), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempt_count, 1);
        assert_eq!(task.result, Some(json!({"ok": true})));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn retryable_failure_returns_to_ready_until_exhausted() {
        let (lc, id, token) = claimed(2).await;
        let mut sub = lc.events().subscribe();

        let task = lc
            .report(&id, &token, AttemptOutcome::Failed(ExecutionError::new("boom")), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.attempt_count, 1);
        assert_eq!(task.last_error.as_ref().unwrap().kind, ErrorKind::Execution);

        let token = lc.claim(&id, "c-2", TTL, Utc::now()).await.unwrap().unwrap().lease.unwrap().token;
        let task = lc
            .report(&id, &token, AttemptOutcome::Failed(ExecutionError::new("boom")), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 2);

        let kinds: Vec<_> = std::iter::from_fn(|| sub.try_recv()).map(|e| e.kind).collect();
        assert_eq!(kinds.last(), Some(&TaskEventKind::Alert));
    }

    #[tokio::test]
    async fn permanent_failure_fails_without_alert() {
        let (lc, id, token) = claimed(3).await;
        let mut sub = lc.events().subscribe();
        let task = lc
            .report(&id, &token, AttemptOutcome::Failed(ExecutionError::permanent("bad input")), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.has_attempts_left());
        assert!(std::iter::from_fn(|| sub.try_recv()).all(|e| e.kind != TaskEventKind::Alert));
    }

    #[tokio::test]
    async fn timeout_counts_as_attempt_and_requeues() {
        let (lc, id, token) = claimed(3).await;
        let task = lc
            .report(&id, &token, AttemptOutcome::TimedOut(Duration::from_secs(5)), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.attempt_count, 1);
        assert_eq!(task.last_error.unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn stale_report_is_ignored() {
        let (lc, id, _token) = claimed(3).await;
        let outcome = lc
            .report(&id, "someone-else", AttemptOutcome::Succeeded(Value::Null), Utc::now())
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(lc.store().get(&id).await.unwrap().status(), TaskStatus::Running);
    }

    #[tokio::test]
    async fn expired_lease_is_reaped_as_timeout() {
        let (lc, id, token) = claimed(3).await;
        let later = Utc::now() + chrono::Duration::seconds(60);
        assert!(lc.expire_lease(&id, Utc::now()).await.unwrap().is_none());

        let task = lc.expire_lease(&id, later).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.attempt_count, 1);

        // The original consumer reporting late is stale.
        let late = lc
            .report(&id, &token, AttemptOutcome::Succeeded(Value::Null), later)
            .await
            .unwrap();
        assert!(late.is_none());
    }

    // ─── Cancellation ───────────────────────────────────────────────

    #[tokio::test]
    async fn cancel_running_is_cooperative() {
        let (lc, id, token) = claimed(3).await;
        let task = lc.cancel(&id, Utc::now()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.cancel_requested);

        let task = lc
            .report(&id, &token, AttemptOutcome::Failed(ExecutionError::cancelled()), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.last_error.unwrap().kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn success_stands_despite_cancel_request() {
        let (lc, id, token) = claimed(3).await;
        lc.cancel(&id, Utc::now()).await.unwrap();
        let task = lc
            .report(&id, &token, AttemptOutcome::Succeeded(Value::Null), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_but_not_for_finished_tasks() {
        let (lc, id) = setup(TaskStatus::Pending, 3).await;
        assert_eq!(lc.cancel(&id, Utc::now()).await.unwrap().status, TaskStatus::Cancelled);
        assert_eq!(lc.cancel(&id, Utc::now()).await.unwrap().status, TaskStatus::Cancelled);

        let (lc, id) = setup(TaskStatus::Succeeded, 3).await;
        assert!(matches!(
            lc.cancel(&id, Utc::now()).await,
            Err(BrainError::InvalidState { operation: "cancel", .. })
        ));
    }

    // ─── Pause, resume, retry ───────────────────────────────────────

    #[tokio::test]
    async fn pause_and_resume_restore_previous_status() {
        let (lc, id) = setup(TaskStatus::Ready, 3).await;
        let paused = lc.pause(&id, Utc::now()).await.unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);
        assert_eq!(lc.pause(&id, Utc::now()).await.unwrap().status, TaskStatus::Paused);

        let resumed = lc.resume(&id, Utc::now()).await.unwrap();
        assert_eq!(resumed.status, TaskStatus::Ready);
        assert_eq!(resumed.paused_from, None);
        assert_eq!(lc.resume(&id, Utc::now()).await.unwrap().status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn pause_running_is_rejected() {
        let (lc, id, _) = claimed(3).await;
        assert!(matches!(
            lc.pause(&id, Utc::now()).await,
            Err(BrainError::InvalidState { status: TaskStatus::Running, .. })
        ));
    }

    #[tokio::test]
    async fn retry_readmits_failed_task_with_attempts_left() {
        let (lc, id, token) = claimed(3).await;
        lc.report(&id, &token, AttemptOutcome::Failed(ExecutionError::permanent("no")), Utc::now())
            .await
            .unwrap();

        let task = lc.retry(&id, Utc::now()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.attempt_count, 1);
    }

    #[tokio::test]
    async fn retry_exhausted_task_is_rejected() {
        let (lc, id, token) = claimed(1).await;
        lc.report(&id, &token, AttemptOutcome::Failed(ExecutionError::new("no")), Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            lc.retry(&id, Utc::now()).await,
            Err(BrainError::InvalidState { status: TaskStatus::Failed, .. })
        ));
    }

    #[tokio::test]
    async fn dependency_cancel_only_hits_pending() {
        let (lc, id) = setup(TaskStatus::Pending, 3).await;
        let task = lc
            .cancel_for_dependency(&id, "dep", TaskStatus::Failed, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.last_error.unwrap().kind, ErrorKind::Dependency);

        let (lc, id) = setup(TaskStatus::Ready, 3).await;
        assert!(lc
            .cancel_for_dependency(&id, "dep", TaskStatus::Failed, Utc::now())
            .await
            .unwrap()
            .is_none());
    }
}
