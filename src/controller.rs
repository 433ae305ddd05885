//! The [`Brain`] façade.
//!
//! A `Brain` owns one store, one event bus and the components built over
//! them. Control operations are answered straight from the store, so a
//! caller always reads its own writes. Execution happens in the background
//! runtime started with [`Brain::start`]:
//!
//! - the scheduling loop runs a pass every `tick_interval_ms`, and early
//!   when a submission, control operation or status change wakes it;
//! - the dispatch loop claims admitted tasks into their lanes;
//! - each lane's workers execute and report attempts.
//!
//! The loops only talk through the store, the event bus and a channel of
//! admitted tasks.
//!
//! # Examples
//!
//! ```
//! use brain::{Brain, BrainConfig, SubmitRequest, TaskStatus, TaskType};
//! use brain::executor::executor_fn;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), brain::BrainError> {
//! let brain = Brain::builder(BrainConfig::default())
//!     .with_executor(TaskType::PriceInquiry, executor_fn(|_ctx| async { Ok(json!(9.5)) }))
//!     .build()
//!     .await?;
//!
//! let outcome = brain
//!     .submit(SubmitRequest::new(TaskType::PriceInquiry, json!({"sku": "A-1"})))
//!     .await?;
//! let task = brain.get_status(&outcome.tasks[0].id).await?;
//! assert_eq!(task.status, TaskStatus::Pending);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{BrainConfig, ResolvedLane};
use crate::consumer::{ConsumerPool, InFlight};
use crate::dispatcher::{Dispatcher, LaneSnapshot};
use crate::domain::TaskRecord;
use crate::error::BrainError;
use crate::events::{EventBus, EventSubscription};
use crate::executor::{Executor, ExecutorRegistry};
use crate::lifecycle::TaskLifecycle;
use crate::planner::{PlanRequest, SubmitOutcome, SubmitRequest, TaskPlanner};
use crate::retry::RetryPolicy;
use crate::scheduler::recurrence::Recurrence;
use crate::scheduler::{Scheduler, SchedulerConfig, TickReport};
use crate::store::{open_store, TaskFilter, TaskPage, TaskStore};
use crate::types::event::TaskEvent;
use crate::types::schedule::ScheduleRule;
use crate::types::task::{Task, TaskStatus, TaskType};

/// Summary returned by [`Brain::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrainStatus {
    /// Replica id.
    pub node_id: String,
    /// Whether the background runtime is running.
    pub running: bool,
    /// Scheduling pass interval.
    pub tick_interval_ms: u64,
    /// Task counts per status.
    pub counts: BTreeMap<TaskStatus, usize>,
    /// Total stored tasks.
    pub total_tasks: usize,
    /// Stored schedule rules.
    pub rules_total: usize,
    /// Enabled schedule rules.
    pub rules_enabled: usize,
    /// Lane capacities and counters.
    pub lanes: Vec<LaneSnapshot>,
    /// Attempts executing in this process.
    pub in_flight: usize,
    /// Sequence number of the latest event.
    pub last_event_seq: u64,
}

struct Runtime {
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
    admitted: mpsc::Sender<Vec<TaskRecord>>,
}

struct Inner {
    config: BrainConfig,
    store: Arc<dyn TaskStore>,
    events: EventBus,
    lifecycle: Arc<TaskLifecycle>,
    planner: TaskPlanner,
    scheduler: Scheduler,
    registry: ExecutorRegistry,
    lanes: Vec<ResolvedLane>,
    in_flight: InFlight,
    wake: Notify,
    runtime: Mutex<Option<Runtime>>,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
}

/// The task orchestration core.
///
/// Cloning is cheap and every clone drives the same instance.
#[derive(Clone)]
pub struct Brain {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Brain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Brain")
            .field("node_id", &self.inner.config.node_id)
            .field("types", &self.inner.registry.types())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Builds a [`Brain`].
pub struct BrainBuilder {
    config: BrainConfig,
    store: Option<Arc<dyn TaskStore>>,
    registry: ExecutorRegistry,
}

impl BrainBuilder {
    /// Starts from `config` with no executors.
    pub fn new(config: BrainConfig) -> Self {
        Self {
            config,
            store: None,
            registry: ExecutorRegistry::new(),
        }
    }

    /// Uses `store` instead of opening the configured one.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Registers an executor.
    pub fn with_executor(mut self, task_type: TaskType, executor: Arc<dyn Executor>) -> Self {
        self.registry.register(task_type, executor);
        self
    }

    /// Registers every executor of `registry`.
    pub fn with_executors(mut self, registry: ExecutorRegistry) -> Self {
        for task_type in registry.types() {
            if let Some(executor) = registry.get(task_type) {
                self.registry.register(task_type, executor);
            }
        }
        self
    }

    /// Validates the configuration, opens the store and wires the
    /// components.
    ///
    /// # Errors
    ///
    /// - [`BrainError::Validation`] for an invalid configuration.
    /// - [`BrainError::Store`] if the store cannot be opened.
    pub async fn build(self) -> Result<Brain, BrainError> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| BrainError::validation(e.to_string()))?;

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.storage, config.store.clone()).await?,
        };
        let events = EventBus::new(config.event_buffer);
        let lifecycle = Arc::new(TaskLifecycle::new(
            store.clone(),
            events.clone(),
            RetryPolicy::from(&config.retry),
        ));

        let registry = self.registry;
        let lanes: Vec<ResolvedLane> = registry.types().into_iter().map(|t| config.lane(t)).collect();
        let planner = TaskPlanner::new(
            store.clone(),
            events.clone(),
            registry.types(),
            config.max_attempts_by_type(),
        );
        let scheduler = Scheduler::new(
            lifecycle.clone(),
            SchedulerConfig {
                global_concurrency: config.global_concurrency,
                lane_capacity: lanes.iter().map(|l| (l.task_type, l.capacity)).collect(),
                max_catch_up: config.max_catch_up,
                cascade_dependency_failures: config.cascade_dependency_failures,
            },
        );

        tracing::info!(
            node_id = %config.node_id,
            types = ?registry.types(),
            storage = config.storage.name(),
            "brain ready"
        );
        Ok(Brain {
            inner: Arc::new(Inner {
                config,
                store,
                events,
                lifecycle,
                planner,
                scheduler,
                registry,
                lanes,
                in_flight: InFlight::new(),
                wake: Notify::new(),
                runtime: Mutex::new(None),
                dispatcher: Mutex::new(None),
            }),
        })
    }
}

impl Brain {
    /// Starts building a Brain from `config`.
    pub fn builder(config: BrainConfig) -> BrainBuilder {
        BrainBuilder::new(config)
    }

    /// The configuration in use.
    pub fn config(&self) -> &BrainConfig {
        &self.inner.config
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    /// The event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// The lifecycle used by every component, for embedders running their
    /// own consumers.
    pub fn lifecycle(&self) -> &Arc<TaskLifecycle> {
        &self.inner.lifecycle
    }

    /// Task types with a registered executor.
    pub fn supported_types(&self) -> Vec<TaskType> {
        self.inner.registry.types()
    }

    // ─── Submission ─────────────────────────────────────────────────

    /// Validates and stores one task (or schedule rule).
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, BrainError> {
        let outcome = self.inner.planner.submit(request, Utc::now()).await?;
        self.inner.wake.notify_one();
        Ok(outcome)
    }

    /// Validates and stores a batch of tasks linked by local keys.
    pub async fn submit_plan(&self, plan: PlanRequest) -> Result<SubmitOutcome, BrainError> {
        let outcome = self.inner.planner.plan(plan, Utc::now()).await?;
        self.inner.wake.notify_one();
        Ok(outcome)
    }

    // ─── Control ────────────────────────────────────────────────────

    /// Cancels a task. Running tasks get a cancellation request that their
    /// executor observes at its next checkpoint.
    pub async fn cancel(&self, task_id: &str) -> Result<Task, BrainError> {
        let task = self.inner.lifecycle.cancel(task_id, Utc::now()).await?;
        if task.status == TaskStatus::Running && self.inner.in_flight.signal(task_id) {
            tracing::debug!(task_id = %task_id, "signalled running attempt");
        }
        self.inner.wake.notify_one();
        Ok(task)
    }

    /// Pauses a `Pending` or `Ready` task.
    pub async fn pause(&self, task_id: &str) -> Result<Task, BrainError> {
        self.inner.lifecycle.pause(task_id, Utc::now()).await
    }

    /// Resumes a paused task.
    pub async fn resume(&self, task_id: &str) -> Result<Task, BrainError> {
        let task = self.inner.lifecycle.resume(task_id, Utc::now()).await?;
        self.inner.wake.notify_one();
        Ok(task)
    }

    /// Makes a failed task with attempts left eligible again, or lifts the
    /// backoff of a `Ready` one.
    pub async fn retry(&self, task_id: &str) -> Result<Task, BrainError> {
        let task = self.inner.lifecycle.retry(task_id, Utc::now()).await?;
        self.inner.wake.notify_one();
        Ok(task)
    }

    // ─── Queries ────────────────────────────────────────────────────

    /// Reads one task.
    pub async fn get_status(&self, task_id: &str) -> Result<Task, BrainError> {
        Ok(self.inner.store.get(task_id).await?.to_task())
    }

    /// Lists tasks, newest first.
    pub async fn list(&self, filter: &TaskFilter) -> Result<TaskPage, BrainError> {
        self.inner.store.list(filter).await
    }

    /// Subscribes to the event feed from now on.
    pub fn subscribe(&self) -> EventSubscription {
        self.inner.events.subscribe()
    }

    /// Subscribes, replaying retained events after `seq` first.
    pub fn subscribe_from(&self, seq: u64) -> EventSubscription {
        self.inner.events.subscribe_from(seq)
    }

    /// Summary of tasks, rules and lanes.
    pub async fn status(&self) -> Result<BrainStatus, BrainError> {
        let records = self.inner.store.scan(&[]).await?;
        let mut counts: BTreeMap<TaskStatus, usize> = BTreeMap::new();
        for record in &records {
            *counts.entry(record.status()).or_default() += 1;
        }
        let rules = self.inner.store.list_rules().await?;

        let dispatcher = self.inner.dispatcher.lock().clone();
        let lanes = match dispatcher {
            Some(dispatcher) => dispatcher.lanes(),
            None => self
                .inner
                .lanes
                .iter()
                .map(|lane| LaneSnapshot {
                    task_type: lane.task_type,
                    capacity: lane.capacity,
                    in_flight: 0,
                    dispatched: 0,
                    succeeded: 0,
                    failed: 0,
                    timed_out: 0,
                    cancelled: 0,
                })
                .collect(),
        };

        Ok(BrainStatus {
            node_id: self.inner.config.node_id.clone(),
            running: self.is_running(),
            tick_interval_ms: self.inner.config.tick_interval_ms,
            counts,
            total_tasks: records.len(),
            rules_total: rules.len(),
            rules_enabled: rules.iter().filter(|r| r.enabled).count(),
            lanes,
            in_flight: self.inner.in_flight.len(),
            last_event_seq: self.inner.events.last_seq(),
        })
    }

    // ─── Rules ──────────────────────────────────────────────────────

    /// Every schedule rule, ordered by id.
    pub async fn list_rules(&self) -> Result<Vec<ScheduleRule>, BrainError> {
        self.inner.store.list_rules().await
    }

    /// Enables a rule. Its next occurrence is recomputed from now, so the
    /// time it spent disabled is never caught up.
    pub async fn enable_rule(&self, rule_id: &str) -> Result<ScheduleRule, BrainError> {
        let now = Utc::now();
        let mutation = |rule: &mut ScheduleRule| -> Result<bool, BrainError> {
            if rule.enabled {
                return Ok(false);
            }
            let next = Recurrence::parse(&rule.expression)?
                .next_after(now)
                .ok_or_else(|| {
                    BrainError::validation(format!("expression {:?} never fires", rule.expression))
                })?;
            rule.enabled = true;
            rule.next_fire_at = next;
            rule.updated_at = now;
            Ok(true)
        };
        let mutated = self.inner.store.mutate_rule(rule_id, &mutation).await?;
        if mutated.changed {
            tracing::info!(rule_id = %rule_id, next_fire_at = %mutated.after.next_fire_at, "rule enabled");
            self.inner.wake.notify_one();
        }
        Ok(mutated.after)
    }

    /// Stops a rule from firing.
    pub async fn disable_rule(&self, rule_id: &str) -> Result<ScheduleRule, BrainError> {
        let now = Utc::now();
        let mutation = |rule: &mut ScheduleRule| -> Result<bool, BrainError> {
            if !rule.enabled {
                return Ok(false);
            }
            rule.enabled = false;
            rule.updated_at = now;
            Ok(true)
        };
        let mutated = self.inner.store.mutate_rule(rule_id, &mutation).await?;
        if mutated.changed {
            tracing::info!(rule_id = %rule_id, "rule disabled");
        }
        Ok(mutated.after)
    }

    /// Deletes a rule. Tasks it already created are kept.
    ///
    /// # Errors
    ///
    /// [`BrainError::NotFound`] for an unknown id.
    pub async fn remove_rule(&self, rule_id: &str) -> Result<(), BrainError> {
        if !self.inner.store.remove_rule(rule_id).await? {
            return Err(BrainError::not_found(rule_id));
        }
        tracing::info!(rule_id = %rule_id, "rule removed");
        Ok(())
    }

    // ─── Maintenance ────────────────────────────────────────────────

    /// Removes terminal tasks past the retention window and returns them.
    ///
    /// A task that a non-terminal task still depends on is kept, so
    /// dependents never lose sight of a finished dependency.
    pub async fn archive(&self, now: DateTime<Utc>) -> Result<Vec<Task>, BrainError> {
        let records = self.inner.store.scan(&[]).await?;
        let retention = self.inner.config.retention();
        let needed: HashSet<&str> = records
            .iter()
            .filter(|r| !r.task.is_terminal())
            .flat_map(|r| r.task.dependency_ids.iter().map(String::as_str))
            .collect();

        let mut archived = Vec::new();
        for record in &records {
            if !record.is_ready_to_archive(now, retention) || needed.contains(record.id()) {
                continue;
            }
            if self.inner.store.remove(record.id()).await? {
                archived.push(record.to_task());
            }
        }
        if !archived.is_empty() {
            tracing::info!(archived = archived.len(), "archived finished tasks");
        }
        Ok(archived)
    }

    /// Runs one scheduling pass at `now`.
    ///
    /// While the runtime runs, admitted tasks are handed to its dispatcher;
    /// otherwise they are only reported.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, BrainError> {
        let report = self.inner.scheduler.tick(now).await?;
        let sender = self
            .inner
            .runtime
            .lock()
            .as_ref()
            .map(|runtime| runtime.admitted.clone());
        if let Some(sender) = sender {
            if !report.admitted.is_empty() && sender.send(report.admitted.clone()).await.is_err() {
                tracing::debug!("dispatch loop gone; admitted tasks stay ready");
            }
        }
        Ok(report)
    }

    // ─── Runtime ────────────────────────────────────────────────────

    /// Returns `true` while the background runtime runs.
    pub fn is_running(&self) -> bool {
        self.inner.runtime.lock().is_some()
    }

    /// Starts the scheduling loop, the dispatch loop and the lane workers.
    ///
    /// # Errors
    ///
    /// [`BrainError::Runtime`] if already started.
    pub async fn start(&self) -> Result<(), BrainError> {
        let mut runtime = self.inner.runtime.lock();
        if runtime.is_some() {
            return Err(BrainError::Runtime("brain is already running".to_string()));
        }

        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let (dispatcher, receivers) = Dispatcher::new(
            self.inner.lifecycle.clone(),
            self.inner.config.node_id.clone(),
            self.inner.config.lease_grace(),
            self.inner.lanes.iter().cloned(),
        );
        let dispatcher = Arc::new(dispatcher);
        let pool = ConsumerPool::new(
            self.inner.lifecycle.clone(),
            self.inner.registry.clone(),
            self.inner.in_flight.clone(),
        );
        pool.spawn(receivers, &shutdown, &mut tasks);

        let (admitted_tx, admitted_rx) = mpsc::channel(16);
        tasks.spawn(dispatch_loop(dispatcher.clone(), admitted_rx, shutdown.clone()));
        tasks.spawn(schedule_loop(self.inner.clone(), admitted_tx.clone(), shutdown.clone()));

        *self.inner.dispatcher.lock() = Some(dispatcher);
        *runtime = Some(Runtime {
            shutdown,
            tasks,
            admitted: admitted_tx,
        });
        tracing::info!(
            node_id = %self.inner.config.node_id,
            lanes = self.inner.lanes.len(),
            tick_interval_ms = self.inner.config.tick_interval_ms,
            "brain started"
        );
        Ok(())
    }

    /// Stops the runtime and waits for executing attempts to report.
    /// Does nothing if the runtime is not running.
    pub async fn shutdown(&self) {
        let Some(mut runtime) = self.inner.runtime.lock().take() else {
            return;
        };
        tracing::info!(in_flight = self.inner.in_flight.len(), "brain shutting down");
        runtime.shutdown.cancel();
        drop(runtime.admitted);
        while let Some(joined) = runtime.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "runtime task ended abnormally");
            }
        }
        tracing::info!("brain stopped");
    }
}

/// Status changes that can make new work schedulable.
fn wakes_scheduler(event: &TaskEvent) -> bool {
    event.is_status_change()
        && matches!(
            event.new_status,
            TaskStatus::Ready
                | TaskStatus::Succeeded
                | TaskStatus::Failed
                | TaskStatus::Cancelled
        )
}

async fn schedule_loop(
    inner: Arc<Inner>,
    admitted: mpsc::Sender<Vec<TaskRecord>>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(inner.config.tick_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut events = inner.events.subscribe();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
            _ = inner.wake.notified() => {}
            event = events.recv() => match event {
                Some(event) if wakes_scheduler(&event) => {}
                Some(_) => continue,
                None => break,
            },
        }
        // Coalesce a burst of events into one pass.
        while events.try_recv().is_some() {}

        match inner.scheduler.tick(Utc::now()).await {
            Ok(report) => {
                if !report.admitted.is_empty() && admitted.send(report.admitted).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "scheduling pass failed");
            }
        }
    }
    tracing::debug!("scheduling loop stopped");
}

async fn dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    mut admitted: mpsc::Receiver<Vec<TaskRecord>>,
    shutdown: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            batch = admitted.recv() => batch,
        };
        let Some(batch) = batch else { break };
        let report = dispatcher.dispatch(batch, Utc::now()).await;
        if !report.lane_full.is_empty() {
            tracing::debug!(waiting = report.lane_full.len(), "lanes full; tasks stay ready");
        }
    }
    tracing::debug!("dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::executor_fn;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn brain() -> Brain {
        Brain::builder(BrainConfig::default())
            .with_executor(TaskType::MessagePush, executor_fn(|_ctx| async { Ok(json!("sent")) }))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let brain = brain().await;
        for result in [
            brain.cancel("missing").await,
            brain.pause("missing").await,
            brain.resume("missing").await,
            brain.retry("missing").await,
            brain.get_status("missing").await,
        ] {
            assert!(matches!(result, Err(BrainError::NotFound { .. })), "{result:?}");
        }
        assert!(matches!(brain.remove_rule("missing").await, Err(BrainError::NotFound { .. })));
    }

    #[tokio::test]
    async fn control_operations_are_idempotent() {
        let brain = brain().await;
        let outcome = brain
            .submit(SubmitRequest::new(TaskType::MessagePush, json!({})))
            .await
            .unwrap();
        let id = &outcome.tasks[0].id;

        assert_eq!(brain.pause(id).await.unwrap().status, TaskStatus::Paused);
        assert_eq!(brain.pause(id).await.unwrap().status, TaskStatus::Paused);
        assert_eq!(brain.resume(id).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(brain.resume(id).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(brain.cancel(id).await.unwrap().status, TaskStatus::Cancelled);
        assert_eq!(brain.cancel(id).await.unwrap().status, TaskStatus::Cancelled);
        assert!(matches!(brain.resume(id).await, Err(BrainError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn rules_can_be_toggled_and_removed() {
        let brain = brain().await;
        let outcome = brain
            .submit(
                SubmitRequest::new(TaskType::MessagePush, json!({})).with_schedule(
                    crate::types::schedule::ScheduleSpec::Recurring {
                        expression: "@every 1h".into(),
                        allow_catch_up: false,
                    },
                ),
            )
            .await
            .unwrap();
        let rule_id = &outcome.rules[0].rule_id;

        assert!(!brain.disable_rule(rule_id).await.unwrap().enabled);
        let before = Utc::now();
        let enabled = brain.enable_rule(rule_id).await.unwrap();
        assert!(enabled.enabled);
        assert!(enabled.next_fire_at > before + Duration::minutes(59));

        let status = brain.status().await.unwrap();
        assert_eq!((status.rules_total, status.rules_enabled), (1, 1));

        brain.remove_rule(rule_id).await.unwrap();
        assert!(brain.list_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn archive_keeps_dependencies_of_live_tasks() {
        let brain = brain().await;
        let plan = PlanRequest::default()
            .task("first", SubmitRequest::new(TaskType::MessagePush, json!({})))
            .task(
                "second",
                SubmitRequest::new(TaskType::MessagePush, json!({})).with_dependencies(["first"]),
            )
            .task("alone", SubmitRequest::new(TaskType::MessagePush, json!({})));
        let outcome = brain.submit_plan(plan).await.unwrap();
        let first = outcome.id_of("first").unwrap();
        let alone = outcome.id_of("alone").unwrap();
        brain.cancel(first).await.unwrap();
        brain.cancel(alone).await.unwrap();

        // `second` is still pending (cascade has not run), so `first` stays.
        let later = Utc::now() + Duration::days(30);
        let archived = brain.archive(later).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].id, alone);
        assert!(brain.get_status(first).await.is_ok());
        assert!(matches!(brain.get_status(alone).await, Err(BrainError::NotFound { .. })));
    }

    #[tokio::test]
    async fn status_counts_tasks_and_lanes() {
        let brain = brain().await;
        brain
            .submit(SubmitRequest::new(TaskType::MessagePush, json!({})))
            .await
            .unwrap();
        let status = brain.status().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.total_tasks, 1);
        assert_eq!(status.counts.get(&TaskStatus::Pending), Some(&1));
        assert_eq!(status.lanes.len(), 1);
        assert_eq!(status.lanes[0].task_type, TaskType::MessagePush);
        assert_eq!(status.last_event_seq, 1);
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let brain = brain().await;
        brain.start().await.unwrap();
        assert!(brain.is_running());
        assert!(matches!(brain.start().await, Err(BrainError::Runtime(_))));
        brain.shutdown().await;
        assert!(!brain.is_running());
        brain.shutdown().await;
    }
}
