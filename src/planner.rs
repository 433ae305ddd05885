//! Request validation and persistence.
//!
//! [`TaskPlanner`] turns a [`SubmitRequest`] or a multi-task
//! [`PlanRequest`] into stored [`TaskRecord`]s and [`ScheduleRule`]s.
//! Everything is validated before the first write, so a rejected request
//! leaves no trace in the store.
//!
//! # Plans
//!
//! A plan names each task with a local `key`. A task's `dependency_ids`
//! may mix keys of tasks in the same plan with ids of tasks already
//! stored. Tasks are persisted in dependency order and share a generated
//! `parent_id` unless the plan supplies one.
//!
//! Recurring tasks become rules. A rule instantiates fresh tasks on every
//! firing, so it can neither depend on nor be depended on by other tasks.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{DependencyGraph, TaskRecord};
use crate::error::BrainError;
use crate::events::EventBus;
use crate::scheduler::recurrence::Recurrence;
use crate::store::TaskStore;
use crate::types::event::TaskEvent;
use crate::types::schedule::{ScheduleRule, ScheduleSpec, TaskTemplate};
use crate::types::task::{TaskStatus, TaskType};

/// One task to create.
///
/// # Examples
///
/// ```
/// use brain::planner::SubmitRequest;
/// use brain::TaskType;
///
/// let req: SubmitRequest = serde_json::from_str(
///     r#"{"type": "PRICE_INQUIRY", "payload": {"sku": "A-1"}, "priority": 2}"#,
/// ).unwrap();
/// assert_eq!(req.task_type, TaskType::PriceInquiry);
/// assert!(req.dependency_ids.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Type of the task; needs a registered executor.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Input handed to the executor.
    #[serde(default)]
    pub payload: Value,
    /// Tasks that must succeed first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependency_ids: Vec<String>,
    /// Fixed start time or recurrence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleSpec>,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Attempt budget; defaults to the lane's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl SubmitRequest {
    /// A request with no dependencies, schedule or priority.
    pub fn new(task_type: TaskType, payload: Value) -> Self {
        Self {
            task_type,
            payload,
            dependency_ids: Vec::new(),
            schedule: None,
            priority: 0,
            max_attempts: None,
        }
    }

    /// Adds dependencies.
    pub fn with_dependencies<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Sets the schedule.
    pub fn with_schedule(mut self, schedule: ScheduleSpec) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A task within a [`PlanRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    /// Name other tasks in the plan use to depend on this one.
    pub key: String,
    /// The task itself.
    #[serde(flatten)]
    pub request: SubmitRequest,
}

/// Several tasks submitted together.
///
/// # Examples
///
/// ```
/// use brain::planner::PlanRequest;
///
/// let plan: PlanRequest = serde_json::from_str(r#"{
///     "tasks": [
///         {"key": "check", "type": "INVENTORY_CHECK", "payload": {"sku": "A-1"}},
///         {"key": "order", "type": "ORDER_PROCESS", "dependency_ids": ["check"]}
///     ]
/// }"#).unwrap();
/// assert_eq!(plan.tasks[1].request.dependency_ids, vec!["check"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    /// Tasks to create.
    pub tasks: Vec<PlannedTask>,
    /// Parent id for every task; generated for multi-task plans if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl PlanRequest {
    /// Appends a task.
    pub fn task(mut self, key: impl Into<String>, request: SubmitRequest) -> Self {
        self.tasks.push(PlannedTask {
            key: key.into(),
            request,
        });
        self
    }
}

/// A created task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedTask {
    /// Key from the request.
    pub key: String,
    /// Assigned id.
    pub id: String,
    /// Initial status.
    pub status: TaskStatus,
}

/// A created schedule rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedRule {
    /// Key from the request.
    pub key: String,
    /// Assigned rule id.
    pub rule_id: String,
    /// First occurrence.
    pub next_fire_at: DateTime<Utc>,
}

/// Result of a submission, in request order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    /// Parent id shared by the created tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Created tasks.
    pub tasks: Vec<CreatedTask>,
    /// Created schedule rules.
    pub rules: Vec<CreatedRule>,
}

impl SubmitOutcome {
    /// Ids of the created tasks.
    pub fn task_ids(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.id.as_str()).collect()
    }

    /// Id of the task created for `key`.
    pub fn id_of(&self, key: &str) -> Option<&str> {
        self.tasks
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.id.as_str())
    }
}

/// Validates and persists submissions.
#[derive(Clone)]
pub struct TaskPlanner {
    store: Arc<dyn TaskStore>,
    events: EventBus,
    supported: HashSet<TaskType>,
    max_attempts: HashMap<TaskType, u32>,
    fallback_max_attempts: u32,
}

impl std::fmt::Debug for TaskPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPlanner")
            .field("supported", &self.supported)
            .finish_non_exhaustive()
    }
}

enum Resolved {
    Task(TaskRecord),
    Rule(ScheduleRule),
}

impl TaskPlanner {
    /// Creates a planner accepting `supported` types, with per-type
    /// default attempt budgets.
    pub fn new(
        store: Arc<dyn TaskStore>,
        events: EventBus,
        supported: impl IntoIterator<Item = TaskType>,
        max_attempts: HashMap<TaskType, u32>,
    ) -> Self {
        Self {
            store,
            events,
            supported: supported.into_iter().collect(),
            max_attempts,
            fallback_max_attempts: 3,
        }
    }

    /// Submits a single task under the key `"task"`.
    pub async fn submit(
        &self,
        request: SubmitRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome, BrainError> {
        self.plan(PlanRequest::default().task("task", request), now).await
    }

    /// Validates and persists a plan.
    ///
    /// # Errors
    ///
    /// - [`BrainError::Validation`] for empty or oversized plans, duplicate
    ///   keys, zero attempt budgets, bad recurrence expressions, unknown
    ///   dependencies and dependency cycles.
    /// - [`BrainError::UnsupportedType`] for types without an executor.
    /// - [`BrainError::PayloadTooLarge`] for payloads over the store limits.
    pub async fn plan(
        &self,
        request: PlanRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome, BrainError> {
        let limit = self.store.config().max_batch_size;
        if request.tasks.is_empty() {
            return Err(BrainError::validation("request contains no tasks"));
        }
        if request.tasks.len() > limit {
            return Err(BrainError::validation(format!(
                "request contains {} tasks, limit is {limit}",
                request.tasks.len()
            )));
        }

        let parent_id = request.parent_id.clone().or_else(|| {
            (request.tasks.len() > 1).then(|| uuid::Uuid::new_v4().to_string())
        });

        // Pass one: shape checks, one record or rule per entry.
        let mut keys: HashMap<&str, usize> = HashMap::new();
        let mut resolved = Vec::with_capacity(request.tasks.len());
        for (index, planned) in request.tasks.iter().enumerate() {
            if planned.key.is_empty() {
                return Err(BrainError::validation("task key must not be empty"));
            }
            if keys.insert(planned.key.as_str(), index).is_some() {
                return Err(BrainError::validation(format!(
                    "duplicate task key {:?}",
                    planned.key
                )));
            }
            resolved.push(self.resolve(planned, parent_id.as_deref(), now)?);
        }

        // Pass two: dependencies. Local keys map to the new ids, anything
        // else must be a stored task.
        let ids: Vec<Option<String>> = resolved
            .iter()
            .map(|item| match item {
                Resolved::Task(record) => Some(record.task.id.clone()),
                Resolved::Rule(_) => None,
            })
            .collect();
        let mut graph = DependencyGraph::new();
        for (planned, item) in request.tasks.iter().zip(resolved.iter_mut()) {
            let Resolved::Task(record) = item else { continue };
            let mut local = BTreeSet::new();
            for dep in &planned.request.dependency_ids {
                let id = match keys.get(dep.as_str()) {
                    Some(&i) => {
                        local.insert(dep.clone());
                        ids[i].clone().ok_or_else(|| {
                            BrainError::validation(format!(
                                "task {:?} depends on recurring task {dep:?}",
                                planned.key
                            ))
                        })?
                    }
                    None => self.existing(&planned.key, dep).await?,
                };
                record.task.dependency_ids.insert(id);
            }
            graph.add(planned.key.clone(), local);
        }
        let order = graph.topological_order().map_err(|stuck| {
            BrainError::validation(format!("dependency cycle among tasks {stuck:?}"))
        })?;

        // Pass three: persistence.
        let mut records: HashMap<String, TaskRecord> = HashMap::new();
        let mut rules: Vec<(String, ScheduleRule)> = Vec::new();
        for (planned, item) in request.tasks.iter().zip(resolved) {
            match item {
                Resolved::Task(record) => {
                    records.insert(planned.key.clone(), record);
                }
                Resolved::Rule(rule) => rules.push((planned.key.clone(), rule)),
            }
        }
        let batch: Vec<TaskRecord> = order
            .iter()
            .filter_map(|key| records.remove(key))
            .collect();

        let created = if batch.is_empty() {
            Vec::new()
        } else {
            self.store.create_batch(batch).await?
        };
        let mut created_rules = Vec::with_capacity(rules.len());
        for (key, rule) in rules {
            match self.store.create_rule(rule).await {
                Ok(rule) => created_rules.push((key, rule)),
                Err(e) => {
                    self.rollback(&created, &created_rules).await;
                    return Err(e);
                }
            }
        }

        for record in &created {
            self.events.publish(TaskEvent::created(&record.task));
        }

        let by_id: HashMap<&str, &TaskRecord> =
            created.iter().map(|r| (r.task.id.as_str(), r)).collect();
        let mut outcome = SubmitOutcome {
            parent_id,
            ..SubmitOutcome::default()
        };
        for (planned, id) in request.tasks.iter().zip(&ids) {
            if let Some(record) = id.as_deref().and_then(|id| by_id.get(id)) {
                outcome.tasks.push(CreatedTask {
                    key: planned.key.clone(),
                    id: record.task.id.clone(),
                    status: record.status(),
                });
            }
        }
        for key in request.tasks.iter().map(|t| &t.key) {
            if let Some((_, rule)) = created_rules.iter().find(|(k, _)| k == key) {
                outcome.rules.push(CreatedRule {
                    key: key.clone(),
                    rule_id: rule.id.clone(),
                    next_fire_at: rule.next_fire_at,
                });
            }
        }

        tracing::info!(
            tasks = outcome.tasks.len(),
            rules = outcome.rules.len(),
            parent_id = ?outcome.parent_id,
            "submission accepted"
        );
        Ok(outcome)
    }

    fn resolve(
        &self,
        planned: &PlannedTask,
        parent_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Resolved, BrainError> {
        let request = &planned.request;
        if !self.supported.contains(&request.task_type) {
            return Err(BrainError::UnsupportedType {
                task_type: request.task_type,
            });
        }
        let max_attempts = request.max_attempts.unwrap_or_else(|| {
            self.max_attempts
                .get(&request.task_type)
                .copied()
                .unwrap_or(self.fallback_max_attempts)
        });
        if max_attempts == 0 {
            return Err(BrainError::validation(format!(
                "task {:?}: max_attempts must be at least 1",
                planned.key
            )));
        }

        if let Some(ScheduleSpec::Recurring {
            expression,
            allow_catch_up,
        }) = &request.schedule
        {
            if !request.dependency_ids.is_empty() {
                return Err(BrainError::validation(format!(
                    "recurring task {:?} cannot have dependencies",
                    planned.key
                )));
            }
            let recurrence = Recurrence::parse(expression)?;
            let first = recurrence.next_after(now).ok_or_else(|| {
                BrainError::validation(format!("expression {expression:?} never fires"))
            })?;
            let template = TaskTemplate {
                task_type: request.task_type,
                payload: request.payload.clone(),
                priority: request.priority,
                max_attempts,
            };
            return Ok(Resolved::Rule(ScheduleRule::new(
                expression.clone(),
                template,
                first,
                *allow_catch_up,
                now,
            )));
        }

        let mut record =
            TaskRecord::new(request.task_type, request.payload.clone(), max_attempts, now);
        record.task.priority = request.priority;
        record.task.parent_id = parent_id.map(str::to_string);
        record.task.schedule = request.schedule.clone();
        Ok(Resolved::Task(record))
    }

    async fn existing(&self, key: &str, dependency_id: &str) -> Result<String, BrainError> {
        match self.store.get(dependency_id).await {
            Ok(record) => Ok(record.task.id),
            Err(BrainError::NotFound { .. }) => Err(BrainError::validation(format!(
                "task {key:?} depends on unknown task {dependency_id:?}"
            ))),
            Err(e) => Err(e),
        }
    }

    async fn rollback(&self, tasks: &[TaskRecord], rules: &[(String, ScheduleRule)]) {
        for record in tasks {
            if let Err(e) = self.store.remove(record.id()).await {
                tracing::warn!(task_id = %record.id(), error = %e, "rollback failed to remove task");
            }
        }
        for (_, rule) in rules {
            if let Err(e) = self.store.remove_rule(&rule.id).await {
                tracing::warn!(rule_id = %rule.id, error = %e, "rollback failed to remove rule");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryTaskStore;
    use crate::types::event::TaskEventKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn planner() -> (Arc<dyn TaskStore>, EventBus, TaskPlanner) {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::in_memory());
        let events = EventBus::new(64);
        let planner = TaskPlanner::new(
            store.clone(),
            events.clone(),
            TaskType::ALL,
            [(TaskType::OrderProcess, 5)].into_iter().collect(),
        );
        (store, events, planner)
    }

    fn req(task_type: TaskType) -> SubmitRequest {
        SubmitRequest::new(task_type, json!({}))
    }

    #[tokio::test]
    async fn single_submission_is_pending_with_lane_budget() {
        let (store, events, planner) = planner();
        let mut sub = events.subscribe();
        let outcome = planner.submit(req(TaskType::OrderProcess), Utc::now()).await.unwrap();

        assert_eq!(outcome.parent_id, None);
        assert_eq!(outcome.tasks.len(), 1);
        assert_eq!(outcome.tasks[0].status, TaskStatus::Pending);
        let stored = store.get(&outcome.tasks[0].id).await.unwrap();
        assert_eq!(stored.task.max_attempts, 5);

        let event = sub.try_recv().unwrap();
        assert_eq!(event.kind, TaskEventKind::Created);
        assert_eq!(event.task_id, outcome.tasks[0].id);
    }

    #[tokio::test]
    async fn plan_links_local_keys_and_existing_ids() {
        let (store, _events, planner) = planner();
        let existing = planner.submit(req(TaskType::InventoryCheck), Utc::now()).await.unwrap();
        let existing_id = existing.tasks[0].id.clone();

        let plan = PlanRequest::default()
            .task("order", req(TaskType::OrderProcess).with_dependencies(["price", existing_id.as_str()]))
            .task("price", req(TaskType::PriceInquiry));
        let outcome = planner.plan(plan, Utc::now()).await.unwrap();

        // Request order is kept in the outcome.
        assert_eq!(outcome.tasks[0].key, "order");
        let order = store.get(outcome.id_of("order").unwrap()).await.unwrap();
        let price_id = outcome.id_of("price").unwrap().to_string();
        let expected: BTreeSet<String> = [price_id, existing_id].into_iter().collect();
        assert_eq!(order.task.dependency_ids, expected);
        assert!(order.task.parent_id.is_some());
        assert_eq!(order.task.parent_id, outcome.parent_id);
    }

    #[tokio::test]
    async fn cycle_is_rejected_and_nothing_is_stored() {
        let (store, events, planner) = planner();
        let plan = PlanRequest::default()
            .task("a", req(TaskType::OrderProcess).with_dependencies(["c"]))
            .task("b", req(TaskType::OrderProcess).with_dependencies(["a"]))
            .task("c", req(TaskType::OrderProcess).with_dependencies(["b"]));
        let err = planner.plan(plan, Utc::now()).await.unwrap_err();
        assert!(matches!(err, BrainError::Validation { .. }), "{err}");
        assert!(store.scan(&[]).await.unwrap().is_empty());
        assert_eq!(events.last_seq(), 0);
    }

    #[tokio::test]
    async fn self_dependency_is_a_cycle() {
        let (_store, _events, planner) = planner();
        let plan = PlanRequest::default().task("a", req(TaskType::OrderProcess).with_dependencies(["a"]));
        assert!(matches!(
            planner.plan(plan, Utc::now()).await,
            Err(BrainError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let (store, _events, planner) = planner();
        let request = req(TaskType::OrderProcess).with_dependencies(["no-such-task"]);
        let err = planner.submit(request, Utc::now()).await.unwrap_err();
        assert!(err.to_string().contains("no-such-task"), "{err}");
        assert!(store.scan(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsupported_type_is_rejected() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::in_memory());
        let planner = TaskPlanner::new(store, EventBus::new(8), [TaskType::MessagePush], HashMap::new());
        let err = planner.submit(req(TaskType::LogisticsTrack), Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            BrainError::UnsupportedType {
                task_type: TaskType::LogisticsTrack
            }
        ));
    }

    #[tokio::test]
    async fn shape_errors_are_validation_errors() {
        let (_store, _events, planner) = planner();
        let cases = [
            PlanRequest::default(),
            PlanRequest::default()
                .task("a", req(TaskType::MessagePush))
                .task("a", req(TaskType::MessagePush)),
            PlanRequest::default().task("", req(TaskType::MessagePush)),
            PlanRequest::default().task("a", req(TaskType::MessagePush).with_max_attempts(0)),
        ];
        for plan in cases {
            let result = planner.plan(plan.clone(), Utc::now()).await;
            assert!(matches!(result, Err(BrainError::Validation { .. })), "{plan:?}");
        }
    }

    #[tokio::test]
    async fn recurring_request_becomes_rule() {
        let (store, _events, planner) = planner();
        let now = Utc::now();
        let request = req(TaskType::ScheduledReminder)
            .with_priority(3)
            .with_schedule(ScheduleSpec::Recurring {
                expression: "@every 5m".into(),
                allow_catch_up: false,
            });
        let outcome = planner.submit(request, now).await.unwrap();

        assert!(outcome.tasks.is_empty());
        assert_eq!(outcome.rules.len(), 1);
        assert_eq!(outcome.rules[0].next_fire_at, now + chrono::Duration::minutes(5));
        let rule = store.get_rule(&outcome.rules[0].rule_id).await.unwrap();
        assert_eq!(rule.template.priority, 3);
        assert!(rule.enabled);
        assert!(store.scan(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_recurring_payload_rolls_back_whole_plan() {
        use crate::store::StoreConfig;

        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::in_memory().with_config(StoreConfig {
            max_payload_bytes: 32,
            ..StoreConfig::default()
        }));
        let events = EventBus::new(8);
        let planner = TaskPlanner::new(store.clone(), events.clone(), TaskType::ALL, HashMap::new());
        let plan = PlanRequest::default()
            .task("push", req(TaskType::MessagePush))
            .task(
                "daily",
                SubmitRequest::new(TaskType::ScheduledReminder, json!({ "text": "x".repeat(64) }))
                    .with_schedule(ScheduleSpec::Recurring {
                        expression: "@every 1m".into(),
                        allow_catch_up: false,
                    }),
            );

        let err = planner.plan(plan, Utc::now()).await.unwrap_err();
        assert!(matches!(err, BrainError::PayloadTooLarge { limit_bytes: 32, .. }), "{err}");
        assert!(store.list_rules().await.unwrap().is_empty());
        assert!(store.scan(&[]).await.unwrap().is_empty());
        assert_eq!(events.last_seq(), 0);
    }

    #[tokio::test]
    async fn rules_cannot_take_part_in_dependencies() {
        let (_store, _events, planner) = planner();
        let recurring = ScheduleSpec::Recurring {
            expression: "0 9 * * *".into(),
            allow_catch_up: false,
        };
        let depends_on_rule = PlanRequest::default()
            .task("daily", req(TaskType::ScheduledReminder).with_schedule(recurring.clone()))
            .task("after", req(TaskType::MessagePush).with_dependencies(["daily"]));
        assert!(planner.plan(depends_on_rule, Utc::now()).await.is_err());

        let rule_with_deps = PlanRequest::default()
            .task("first", req(TaskType::MessagePush))
            .task(
                "daily",
                req(TaskType::ScheduledReminder)
                    .with_schedule(recurring)
                    .with_dependencies(["first"]),
            );
        assert!(planner.plan(rule_with_deps, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn bad_expression_is_rejected() {
        let (_store, _events, planner) = planner();
        let request = req(TaskType::ScheduledReminder).with_schedule(ScheduleSpec::Recurring {
            expression: "61 * * * *".into(),
            allow_catch_up: false,
        });
        assert!(matches!(
            planner.submit(request, Utc::now()).await,
            Err(BrainError::Validation { .. })
        ));
    }
}
