//! Lane workers.
//!
//! Each lane runs `capacity` workers sharing the lane's receiver. A worker
//! takes an [`Assignment`], runs the registered executor under the lane's
//! deadline and reports the outcome through [`TaskLifecycle::report`].
//!
//! Shutdown stops workers from taking new assignments; an attempt already
//! executing is awaited. Assignments still queued at shutdown keep their
//! lease and are returned by the reaper once it expires.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{Assignment, LaneReceiver, LaneStats};
use crate::executor::{ExecutionContext, ExecutionError, ExecutorRegistry};
use crate::lifecycle::{AttemptOutcome, TaskLifecycle};
use crate::types::task::{Task, TaskType};

const SLOW_WARN: Duration = Duration::from_secs(5);
const SLOW_INFO: Duration = Duration::from_secs(1);

/// Cancellation tokens of the attempts executing in this process.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    tokens: Arc<DashMap<String, CancellationToken>>,
}

impl InFlight {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(task_id.to_string(), token.clone());
        token
    }

    fn release(&self, task_id: &str) {
        self.tokens.remove(task_id);
    }

    /// Cancels the token of `task_id`'s attempt. Returns `false` if the
    /// task is not executing here.
    pub fn signal(&self, task_id: &str) -> bool {
        match self.tokens.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of executing attempts.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns `true` if nothing is executing.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Runs attempts for every lane.
#[derive(Clone)]
pub struct ConsumerPool {
    lifecycle: Arc<TaskLifecycle>,
    registry: ExecutorRegistry,
    in_flight: InFlight,
}

impl std::fmt::Debug for ConsumerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerPool")
            .field("types", &self.registry.types())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl ConsumerPool {
    /// Creates a pool executing with `registry`.
    pub fn new(lifecycle: Arc<TaskLifecycle>, registry: ExecutorRegistry, in_flight: InFlight) -> Self {
        Self {
            lifecycle,
            registry,
            in_flight,
        }
    }

    /// The registry of executing attempts.
    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Spawns the workers of every lane onto `tasks`.
    pub fn spawn(&self, lanes: Vec<LaneReceiver>, shutdown: &CancellationToken, tasks: &mut JoinSet<()>) {
        for lane in lanes {
            let receiver = Arc::new(Mutex::new(lane.receiver));
            for worker in 0..lane.capacity {
                let pool = self.clone();
                let receiver = receiver.clone();
                let stats = lane.stats.clone();
                let shutdown = shutdown.clone();
                let task_type = lane.task_type;
                tasks.spawn(async move {
                    pool.worker(task_type, worker, receiver, stats, shutdown).await;
                });
            }
            tracing::debug!(lane = %lane.task_type, workers = lane.capacity, "lane workers started");
        }
    }

    async fn worker(
        self,
        task_type: TaskType,
        worker: usize,
        receiver: Arc<Mutex<mpsc::Receiver<Assignment>>>,
        stats: Arc<LaneStats>,
        shutdown: CancellationToken,
    ) {
        loop {
            let next = {
                let mut receiver = receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    assignment = receiver.recv() => assignment,
                }
            };
            let Some(assignment) = next else { break };
            self.execute(assignment, &stats).await;
        }
        tracing::debug!(lane = %task_type, worker, "lane worker stopped");
    }

    /// Runs one attempt to completion and reports it.
    ///
    /// Returns the task after the report, or `None` if the report was
    /// stale or could not be written.
    pub async fn execute(&self, assignment: Assignment, stats: &LaneStats) -> Option<Task> {
        let task = assignment.record.to_task();
        let Some(lease_token) = assignment.lease_token().map(str::to_string) else {
            tracing::warn!(task_id = %task.id, "assignment without a lease");
            return None;
        };

        let token = self.in_flight.register(&task.id);
        let started = Instant::now();
        let outcome = match self.registry.get(task.task_type) {
            Some(executor) => {
                let ctx = ExecutionContext::new(
                    task.clone(),
                    lease_token.clone(),
                    token,
                    self.lifecycle.store().clone(),
                );
                match tokio::time::timeout(assignment.timeout, executor.execute(ctx)).await {
                    Ok(Ok(result)) => AttemptOutcome::Succeeded(result),
                    Ok(Err(err)) => AttemptOutcome::Failed(err),
                    Err(_) => AttemptOutcome::TimedOut(assignment.timeout),
                }
            }
            None => AttemptOutcome::Failed(ExecutionError::permanent(format!(
                "no executor registered for {}",
                task.task_type
            ))),
        };
        self.in_flight.release(&task.id);

        let elapsed = started.elapsed();
        log_duration(&task, elapsed);
        match &outcome {
            AttemptOutcome::Succeeded(_) => stats.record_succeeded(),
            AttemptOutcome::Failed(err) if err.cancelled => stats.record_cancelled(),
            AttemptOutcome::Failed(_) => stats.record_failed(),
            AttemptOutcome::TimedOut(_) => stats.record_timed_out(),
        }

        let reported = self
            .lifecycle
            .report(&task.id, &lease_token, outcome, Utc::now())
            .await;
        drop(assignment);
        match reported {
            Ok(Some(after)) => {
                tracing::info!(
                    task_id = %after.id,
                    task_type = %after.task_type,
                    status = %after.status,
                    attempt = after.attempt_count,
                    "attempt finished"
                );
                Some(after)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "failed to report attempt outcome");
                None
            }
        }
    }
}

fn log_duration(task: &Task, elapsed: Duration) {
    let elapsed_ms = elapsed.as_millis() as u64;
    if elapsed > SLOW_WARN {
        tracing::warn!(task_id = %task.id, task_type = %task.task_type, elapsed_ms, "slow execution");
    } else if elapsed > SLOW_INFO {
        tracing::info!(task_id = %task.id, task_type = %task.task_type, elapsed_ms, "execution took over a second");
    } else {
        tracing::debug!(task_id = %task.id, elapsed_ms, "execution finished");
    }
}
