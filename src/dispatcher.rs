//! Per-type lanes and the claim hand-off.
//!
//! Every registered task type gets a [`Lane`]: a semaphore sized to the
//! lane's capacity and a channel to that lane's consumers. Dispatching an
//! admitted task takes a permit first, then claims the task in the store,
//! then hands the claimed record and the permit to a consumer. The permit
//! is released when the consumer drops the [`Assignment`], so a stalled
//! attempt holds its slot until it times out, and a full lane never blocks
//! another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use crate::config::ResolvedLane;
use crate::domain::TaskRecord;
use crate::lifecycle::TaskLifecycle;
use crate::types::task::TaskType;

/// A claimed task on its way to a consumer.
#[derive(Debug)]
pub struct Assignment {
    /// The record as claimed, lease included.
    pub record: TaskRecord,
    /// Deadline for the attempt.
    pub timeout: Duration,
    _permit: OwnedSemaphorePermit,
}

impl Assignment {
    /// Id of the assigned task.
    pub fn task_id(&self) -> &str {
        self.record.id()
    }

    /// Token of the lease the attempt runs under.
    pub fn lease_token(&self) -> Option<&str> {
        self.record.lease.as_ref().map(|lease| lease.token.as_str())
    }
}

/// Counters kept per lane.
#[derive(Debug, Default)]
pub struct LaneStats {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

impl LaneStats {
    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of a lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneSnapshot {
    /// The lane's task type.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Maximum in-flight attempts.
    pub capacity: usize,
    /// Attempts currently holding a slot.
    pub in_flight: usize,
    /// Tasks claimed and handed to consumers.
    pub dispatched: u64,
    /// Attempts that succeeded.
    pub succeeded: u64,
    /// Attempts that failed.
    pub failed: u64,
    /// Attempts that hit their deadline.
    pub timed_out: u64,
    /// Attempts that ended cancelled.
    pub cancelled: u64,
}

struct Lane {
    capacity: usize,
    timeout: Duration,
    semaphore: Arc<Semaphore>,
    sender: mpsc::Sender<Assignment>,
    stats: Arc<LaneStats>,
}

/// The consumer end of a lane, handed to the consumer pool.
#[derive(Debug)]
pub struct LaneReceiver {
    /// The lane's task type.
    pub task_type: TaskType,
    /// Number of workers to run.
    pub capacity: usize,
    /// Claimed tasks for this lane.
    pub receiver: mpsc::Receiver<Assignment>,
    /// Shared counters.
    pub stats: Arc<LaneStats>,
}

/// What one dispatch call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Ids handed to consumers.
    pub dispatched: Vec<String>,
    /// Ids skipped because their lane was full.
    pub lane_full: Vec<String>,
    /// Ids another dispatcher claimed first.
    pub lost: Vec<String>,
}

/// Routes admitted tasks into their lanes.
pub struct Dispatcher {
    lifecycle: Arc<TaskLifecycle>,
    node_id: String,
    lease_grace: Duration,
    lanes: HashMap<TaskType, Lane>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("node_id", &self.node_id)
            .field("lanes", &self.lanes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher with one lane per entry of `lanes`, returning
    /// the consumer ends.
    pub fn new(
        lifecycle: Arc<TaskLifecycle>,
        node_id: impl Into<String>,
        lease_grace: Duration,
        lanes: impl IntoIterator<Item = ResolvedLane>,
    ) -> (Self, Vec<LaneReceiver>) {
        let mut by_type = HashMap::new();
        let mut receivers = Vec::new();
        for lane in lanes {
            let capacity = lane.capacity.max(1);
            let (sender, receiver) = mpsc::channel(capacity);
            let stats = Arc::new(LaneStats::default());
            by_type.insert(
                lane.task_type,
                Lane {
                    capacity,
                    timeout: lane.timeout,
                    semaphore: Arc::new(Semaphore::new(capacity)),
                    sender,
                    stats: stats.clone(),
                },
            );
            receivers.push(LaneReceiver {
                task_type: lane.task_type,
                capacity,
                receiver,
                stats,
            });
        }
        receivers.sort_by_key(|r| r.task_type);

        let dispatcher = Self {
            lifecycle,
            node_id: node_id.into(),
            lease_grace,
            lanes: by_type,
        };
        (dispatcher, receivers)
    }

    /// Capacity of `task_type`'s lane, if it has one.
    pub fn capacity(&self, task_type: TaskType) -> Option<usize> {
        self.lanes.get(&task_type).map(|lane| lane.capacity)
    }

    /// Snapshots of every lane, ordered by type.
    pub fn lanes(&self) -> Vec<LaneSnapshot> {
        let mut snapshots: Vec<LaneSnapshot> = self
            .lanes
            .iter()
            .map(|(task_type, lane)| LaneSnapshot {
                task_type: *task_type,
                capacity: lane.capacity,
                in_flight: lane.capacity - lane.semaphore.available_permits().min(lane.capacity),
                dispatched: lane.stats.dispatched.load(Ordering::Relaxed),
                succeeded: lane.stats.succeeded.load(Ordering::Relaxed),
                failed: lane.stats.failed.load(Ordering::Relaxed),
                timed_out: lane.stats.timed_out.load(Ordering::Relaxed),
                cancelled: lane.stats.cancelled.load(Ordering::Relaxed),
            })
            .collect();
        snapshots.sort_by_key(|s| s.task_type);
        snapshots
    }

    /// Claims and hands off `admitted` tasks, in order.
    ///
    /// A task is claimed only after its lane slot is secured, so a full
    /// lane leaves the task `Ready` for a later pass.
    pub async fn dispatch(&self, admitted: Vec<TaskRecord>, now: DateTime<Utc>) -> DispatchReport {
        let mut report = DispatchReport::default();
        for record in admitted {
            let task_type = record.task.task_type;
            let Some(lane) = self.lanes.get(&task_type) else {
                tracing::debug!(task_id = %record.id(), task_type = %task_type, "no lane for task type");
                continue;
            };
            let Ok(permit) = lane.semaphore.clone().try_acquire_owned() else {
                report.lane_full.push(record.task.id);
                continue;
            };

            let consumer_id = format!("{}/{}", self.node_id, task_type);
            let ttl = lane.timeout + self.lease_grace;
            let claimed = match self
                .lifecycle
                .claim(record.id(), &consumer_id, ttl, now)
                .await
            {
                Ok(Some(claimed)) => claimed,
                Ok(None) => {
                    tracing::debug!(task_id = %record.id(), "claim lost");
                    report.lost.push(record.task.id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(task_id = %record.id(), error = %e, "claim failed");
                    continue;
                }
            };

            let task_id = claimed.task.id.clone();
            let assignment = Assignment {
                record: claimed,
                timeout: lane.timeout,
                _permit: permit,
            };
            if lane.sender.send(assignment).await.is_err() {
                // The lease runs out and the reaper returns the task.
                tracing::warn!(task_id = %task_id, lane = %task_type, "lane closed after claim");
                continue;
            }
            lane.stats.record_dispatched();
            tracing::debug!(task_id = %task_id, lane = %task_type, "dispatched");
            report.dispatched.push(task_id);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::retry::RetryPolicy;
    use crate::store::memory::InMemoryTaskStore;
    use crate::store::TaskStore;
    use crate::types::task::TaskStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn lane(task_type: TaskType, capacity: usize) -> ResolvedLane {
        ResolvedLane {
            task_type,
            capacity,
            timeout: Duration::from_secs(5),
            max_attempts: 3,
        }
    }

    async fn ready_tasks(store: &Arc<dyn TaskStore>, task_type: TaskType, n: usize) -> Vec<TaskRecord> {
        let now = Utc::now();
        let records: Vec<_> = (0..n)
            .map(|_| {
                let mut r = TaskRecord::new(task_type, json!({}), 3, now);
                r.task.status = TaskStatus::Ready;
                r
            })
            .collect();
        store.create_batch(records).await.unwrap()
    }

    fn setup(lanes: Vec<ResolvedLane>) -> (Arc<dyn TaskStore>, Dispatcher, Vec<LaneReceiver>) {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::in_memory());
        let lifecycle = Arc::new(TaskLifecycle::new(
            store.clone(),
            EventBus::new(64),
            RetryPolicy::immediate(),
        ));
        let (dispatcher, receivers) = Dispatcher::new(lifecycle, "node-a", Duration::from_secs(1), lanes);
        (store, dispatcher, receivers)
    }

    #[tokio::test]
    async fn full_lane_leaves_tasks_ready() {
        let (store, dispatcher, mut receivers) = setup(vec![lane(TaskType::OrderProcess, 2)]);
        let tasks = ready_tasks(&store, TaskType::OrderProcess, 3).await;

        let report = dispatcher.dispatch(tasks.clone(), Utc::now()).await;
        assert_eq!(report.dispatched.len(), 2);
        assert_eq!(report.lane_full, vec![tasks[2].task.id.clone()]);
        assert_eq!(store.get(&tasks[2].task.id).await.unwrap().status(), TaskStatus::Ready);

        let first = receivers[0].receiver.recv().await.unwrap();
        assert_eq!(first.record.status(), TaskStatus::Running);
        assert_eq!(
            first.record.lease.as_ref().unwrap().consumer_id,
            "node-a/ORDER_PROCESS"
        );

        // Dropping an assignment frees its slot.
        drop(first);
        let report = dispatcher.dispatch(vec![tasks[2].clone()], Utc::now()).await;
        assert_eq!(report.dispatched, vec![tasks[2].task.id.clone()]);
    }

    #[tokio::test]
    async fn lanes_are_independent() {
        let (store, dispatcher, _receivers) = setup(vec![
            lane(TaskType::OrderProcess, 1),
            lane(TaskType::MessagePush, 1),
        ]);
        let mut tasks = ready_tasks(&store, TaskType::OrderProcess, 2).await;
        tasks.extend(ready_tasks(&store, TaskType::MessagePush, 1).await);

        let report = dispatcher.dispatch(tasks, Utc::now()).await;
        assert_eq!(report.dispatched.len(), 2);
        assert_eq!(report.lane_full.len(), 1);

        let snapshots = dispatcher.lanes();
        assert!(snapshots.iter().all(|s| s.in_flight == 1 && s.dispatched == 1));
    }

    #[tokio::test]
    async fn second_dispatch_of_same_task_loses_claim() {
        let (store, dispatcher, _receivers) = setup(vec![lane(TaskType::PriceInquiry, 4)]);
        let tasks = ready_tasks(&store, TaskType::PriceInquiry, 1).await;

        let first = dispatcher.dispatch(tasks.clone(), Utc::now()).await;
        let second = dispatcher.dispatch(tasks.clone(), Utc::now()).await;
        assert_eq!(first.dispatched.len(), 1);
        assert_eq!(second.lost, vec![tasks[0].task.id.clone()]);
        assert_eq!(dispatcher.lanes()[0].in_flight, 1);
    }
}
