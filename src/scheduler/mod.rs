//! The scheduler: one pass over the store per tick.
//!
//! A pass runs four steps, in order:
//!
//! 1. **Fire rules.** Every enabled [`ScheduleRule`] whose `next_fire_at`
//!    has passed stamps out a task instance. Due rules are handled in id
//!    order. A rule that is late fires once and skips ahead to its first
//!    occurrence after now; rules with `allow_catch_up` replay each missed
//!    occurrence instead (at most `max_catch_up` per pass).
//! 2. **Reap leases.** `Running` tasks whose lease expired are handled as
//!    timed out.
//! 3. **Promote.** `Pending` tasks whose dependencies all `Succeeded` and
//!    whose run time has passed become `Ready`. With cascading enabled,
//!    `Pending` tasks with a `Failed` or `Cancelled` dependency are
//!    cancelled, transitively within the same pass.
//! 4. **Admit.** Claimable `Ready` tasks are ordered by priority (higher
//!    first), then creation time, then id, and admitted up to the global
//!    and per-type ceilings, counting what is already running.
//!
//! The pass takes `now` as a parameter; nothing here reads the clock.

pub mod recurrence;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::domain::{DependencyGraph, TaskRecord};
use crate::error::BrainError;
use crate::lifecycle::TaskLifecycle;
use crate::store::TaskStore;
use crate::types::event::TaskEvent;
use crate::types::schedule::ScheduleRule;
use crate::types::task::{TaskStatus, TaskType};

use self::recurrence::Recurrence;

/// Limits applied by the admission step.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum running tasks overall.
    pub global_concurrency: usize,
    /// Maximum running tasks per type; types without an entry are only
    /// bounded by the global ceiling.
    pub lane_capacity: HashMap<TaskType, usize>,
    /// Maximum replayed occurrences per rule and pass.
    pub max_catch_up: usize,
    /// Cancel pending dependents of failed or cancelled tasks.
    pub cascade_dependency_failures: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 32,
            lane_capacity: HashMap::new(),
            max_catch_up: 100,
            cascade_dependency_failures: true,
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Ids of task instances created by schedule rules.
    pub fired: Vec<String>,
    /// Ids of tasks whose lease was reaped.
    pub reaped: Vec<String>,
    /// Ids of tasks promoted to `Ready`.
    pub promoted: Vec<String>,
    /// Ids of tasks cancelled because a dependency did not succeed.
    pub cascaded: Vec<String>,
    /// Tasks admitted for dispatch, in dispatch order.
    pub admitted: Vec<TaskRecord>,
}

impl TickReport {
    /// Returns `true` if the pass changed or admitted anything.
    pub fn did_work(&self) -> bool {
        !(self.fired.is_empty()
            && self.reaped.is_empty()
            && self.promoted.is_empty()
            && self.cascaded.is_empty()
            && self.admitted.is_empty())
    }
}

/// Drives rule firing, lease reaping, promotion and admission.
#[derive(Debug, Clone)]
pub struct Scheduler {
    lifecycle: Arc<TaskLifecycle>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Creates a scheduler.
    pub fn new(lifecycle: Arc<TaskLifecycle>, config: SchedulerConfig) -> Self {
        Self { lifecycle, config }
    }

    /// The admission limits.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn store(&self) -> &Arc<dyn TaskStore> {
        self.lifecycle.store()
    }

    /// Runs one scheduling pass at `now`.
    ///
    /// Failures on individual tasks or rules are logged and skipped; only a
    /// failure to read the store aborts the pass.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, BrainError> {
        let started = Instant::now();
        let mut report = TickReport {
            fired: self.fire_rules(now).await?,
            ..TickReport::default()
        };

        let mut snapshot = self.store().scan(&[]).await?;
        self.reap(&mut snapshot, now, &mut report).await;
        self.promote(&mut snapshot, now, &mut report).await;
        report.admitted = select_admissions(&snapshot, now, &self.config);

        let changed = !(report.fired.is_empty()
            && report.reaped.is_empty()
            && report.promoted.is_empty()
            && report.cascaded.is_empty());
        if changed {
            tracing::info!(
                fired = report.fired.len(),
                reaped = report.reaped.len(),
                promoted = report.promoted.len(),
                cascaded = report.cascaded.len(),
                admitted = report.admitted.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "scheduling pass"
            );
        } else if !report.admitted.is_empty() {
            tracing::debug!(admitted = report.admitted.len(), "scheduling pass");
        }
        Ok(report)
    }

    // ─── Rules ──────────────────────────────────────────────────────

    async fn fire_rules(&self, now: DateTime<Utc>) -> Result<Vec<String>, BrainError> {
        let mut due: Vec<ScheduleRule> = self
            .store()
            .list_rules()
            .await?
            .into_iter()
            .filter(|rule| rule.is_due(now))
            .collect();
        due.sort_by(|a, b| a.id.cmp(&b.id));

        let mut fired = Vec::new();
        for rule in due {
            match self.fire_rule(&rule, now).await {
                Ok(ids) => fired.extend(ids),
                Err(e) => {
                    tracing::warn!(rule_id = %rule.id, error = %e, "failed to fire schedule rule");
                }
            }
        }
        Ok(fired)
    }

    async fn fire_rule(
        &self,
        rule: &ScheduleRule,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, BrainError> {
        let recurrence = Recurrence::parse(&rule.expression)?;
        let (fire_times, next_fire_at) =
            plan_firings(&recurrence, rule, now, self.config.max_catch_up);

        let records: Vec<TaskRecord> = fire_times
            .iter()
            .map(|fire_at| TaskRecord::from_template(&rule.template, &rule.id, *fire_at, now))
            .collect();
        let last_task_id = records.last().map(|r| r.task.id.clone());
        let expected_next = rule.next_fire_at;
        let fire_count = records.len() as u64;

        // Advance the rule first: if another replica already did, this
        // firing is theirs and nothing is created here. A failed create
        // undoes the advance.
        let advance = |stored: &mut ScheduleRule| -> Result<bool, BrainError> {
            if !stored.enabled || stored.next_fire_at != expected_next {
                return Ok(false);
            }
            match next_fire_at {
                Some(next) => stored.next_fire_at = next,
                None => stored.enabled = false,
            }
            stored.stats.fire_count += fire_count;
            stored.stats.last_fired_at = Some(now);
            stored.stats.last_task_id = last_task_id.clone();
            stored.updated_at = now;
            Ok(true)
        };
        let advanced = self.store().mutate_rule(&rule.id, &advance).await?;
        if !advanced.changed {
            tracing::debug!(rule_id = %rule.id, "rule already advanced elsewhere");
            return Ok(Vec::new());
        }
        if next_fire_at.is_none() {
            tracing::warn!(rule_id = %rule.id, expression = %rule.expression, "rule has no further occurrences; disabled");
        }

        if records.is_empty() {
            return Ok(Vec::new());
        }
        let created = match self.store().create_batch(records).await {
            Ok(created) => created,
            Err(e) => {
                self.revert_advance(&advanced.before, &advanced.after, now).await;
                return Err(e);
            },
        };
        for record in &created {
            self.lifecycle.events().publish(TaskEvent::created(&record.task));
        }
        tracing::info!(
            rule_id = %rule.id,
            instances = created.len(),
            next_fire_at = ?advanced.after.next_fire_at,
            "fired schedule rule"
        );
        Ok(created.into_iter().map(|r| r.task.id).collect())
    }

    /// Puts a rule back to its pre-firing state after its instances could
    /// not be stored, so the same occurrences fire on the next pass. Only
    /// applies while the rule still holds this pass's advance.
    async fn revert_advance(&self, before: &ScheduleRule, advanced: &ScheduleRule, now: DateTime<Utc>) {
        let revert = |stored: &mut ScheduleRule| -> Result<bool, BrainError> {
            if stored.next_fire_at != advanced.next_fire_at
                || stored.enabled != advanced.enabled
                || stored.stats != advanced.stats
            {
                return Ok(false);
            }
            stored.next_fire_at = before.next_fire_at;
            stored.enabled = before.enabled;
            stored.stats = before.stats.clone();
            stored.updated_at = now;
            Ok(true)
        };
        match self.store().mutate_rule(&before.id, &revert).await {
            Ok(reverted) if reverted.changed => {
                tracing::debug!(rule_id = %before.id, "rule advance reverted after failed firing");
            },
            Ok(_) => {
                tracing::warn!(rule_id = %before.id, "rule changed since firing; advance left in place");
            },
            Err(e) => {
                tracing::warn!(rule_id = %before.id, error = %e, "failed to revert rule advance");
            },
        }
    }

    // ─── Leases ─────────────────────────────────────────────────────

    async fn reap(&self, snapshot: &mut [TaskRecord], now: DateTime<Utc>, report: &mut TickReport) {
        for record in snapshot.iter_mut().filter(|r| r.lease_expired(now)) {
            match self.lifecycle.expire_lease(record.id(), now).await {
                Ok(Some(task)) => {
                    report.reaped.push(task.id.clone());
                    record.task = task;
                    record.lease = None;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(task_id = %record.id(), error = %e, "failed to reap lease");
                }
            }
        }
    }

    // ─── Promotion ──────────────────────────────────────────────────

    async fn promote(
        &self,
        snapshot: &mut [TaskRecord],
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let mut status: HashMap<String, TaskStatus> = snapshot
            .iter()
            .map(|r| (r.task.id.clone(), r.status()))
            .collect();
        let index: HashMap<String, usize> = snapshot
            .iter()
            .enumerate()
            .map(|(i, r)| (r.task.id.clone(), i))
            .collect();

        let mut graph = DependencyGraph::new();
        for record in snapshot.iter().filter(|r| r.status() == TaskStatus::Pending) {
            graph.add(record.task.id.clone(), record.task.dependency_ids.iter().cloned());
        }

        // Popped from the back: newest first in the vector, oldest handled
        // first.
        let mut pending: Vec<&TaskRecord> = snapshot
            .iter()
            .filter(|r| r.status() == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.task
                .created_at
                .cmp(&a.task.created_at)
                .then_with(|| b.task.id.cmp(&a.task.id))
        });
        let mut worklist: Vec<String> = pending.into_iter().map(|r| r.task.id.clone()).collect();

        while let Some(id) = worklist.pop() {
            if status.get(&id) != Some(&TaskStatus::Pending) {
                continue;
            }
            let Some(&i) = index.get(&id) else { continue };
            let task = &snapshot[i].task;

            let mut blocked = false;
            let mut broken: Option<(String, TaskStatus)> = None;
            for dep in &task.dependency_ids {
                match status.get(dep) {
                    Some(TaskStatus::Succeeded) => {}
                    Some(s @ (TaskStatus::Failed | TaskStatus::Cancelled)) => {
                        broken = Some((dep.clone(), *s));
                        break;
                    }
                    Some(_) => blocked = true,
                    None => {
                        tracing::debug!(task_id = %id, dependency_id = %dep, "dependency not found");
                        blocked = true;
                    }
                }
            }

            if let Some((dep, dep_status)) = broken {
                if !self.config.cascade_dependency_failures {
                    continue;
                }
                match self
                    .lifecycle
                    .cancel_for_dependency(&id, &dep, dep_status, now)
                    .await
                {
                    Ok(Some(updated)) => {
                        status.insert(id.clone(), updated.status);
                        snapshot[i].task = updated;
                        report.cascaded.push(id.clone());
                        worklist.extend(graph.dependents_of(&id).into_iter().map(str::to_string));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(task_id = %id, error = %e, "failed to cascade cancellation");
                    }
                }
                continue;
            }

            let due = task.run_at().is_none_or(|run_at| run_at <= now);
            if blocked || !due {
                continue;
            }
            match self.lifecycle.promote(&id, now).await {
                Ok(Some(updated)) => {
                    status.insert(id.clone(), updated.status);
                    snapshot[i].task = updated;
                    report.promoted.push(id);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(task_id = %id, error = %e, "failed to promote task");
                }
            }
        }
    }
}

/// Decides the next occurrences to fire for a due rule.
///
/// Returns the fire times and the rule's new `next_fire_at` (`None` when
/// the expression has no further occurrence).
fn plan_firings(
    recurrence: &Recurrence,
    rule: &ScheduleRule,
    now: DateTime<Utc>,
    max_catch_up: usize,
) -> (Vec<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let first = rule.next_fire_at;
    if !rule.allow_catch_up {
        return (vec![first], recurrence.first_after(first, now));
    }

    let mut fires = vec![first];
    let mut next = recurrence.next_after(first);
    while let Some(at) = next {
        if at > now || fires.len() >= max_catch_up.max(1) {
            break;
        }
        fires.push(at);
        next = recurrence.next_after(at);
    }
    (fires, next)
}

/// Picks the `Ready` tasks to dispatch from a store snapshot.
///
/// Candidates are claimable tasks ordered by priority (descending), then
/// `created_at`, then id. Tasks already `Running` count against the
/// global ceiling and their type's lane ceiling.
pub fn select_admissions(
    snapshot: &[TaskRecord],
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> Vec<TaskRecord> {
    let mut running_by_type: BTreeMap<TaskType, usize> = BTreeMap::new();
    let mut running = 0usize;
    for record in snapshot.iter().filter(|r| r.status() == TaskStatus::Running) {
        running += 1;
        *running_by_type.entry(record.task.task_type).or_default() += 1;
    }

    let mut candidates: Vec<&TaskRecord> = snapshot.iter().filter(|r| r.is_claimable(now)).collect();
    candidates.sort_by(|a, b| {
        b.task
            .priority
            .cmp(&a.task.priority)
            .then_with(|| a.task.created_at.cmp(&b.task.created_at))
            .then_with(|| a.task.id.cmp(&b.task.id))
    });

    let mut admitted = Vec::new();
    for record in candidates {
        if running >= config.global_concurrency {
            break;
        }
        let task_type = record.task.task_type;
        let in_lane = running_by_type.entry(task_type).or_default();
        if config
            .lane_capacity
            .get(&task_type)
            .is_some_and(|cap| *in_lane >= *cap)
        {
            continue;
        }
        *in_lane += 1;
        running += 1;
        admitted.push(record.clone());
    }
    admitted
}
