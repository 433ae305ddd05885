//! End-to-end scheduling scenarios driven through [`Brain::tick`].
//!
//! The background runtime is not started here: each test plays the
//! consumer itself through the lifecycle's `claim` and `report`, with
//! explicit clock values, so every step is deterministic.

use std::time::Duration as StdDuration;

use brain::executor::executor_fn;
use brain::lifecycle::AttemptOutcome;
use brain::{
    Brain, BrainConfig, BrainError, ErrorKind, PlanRequest, ScheduleSpec, SubmitRequest,
    TaskFilter, TaskStatus, TaskType,
};
use chrono::{DateTime, Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;

// ─── Helpers ────────────────────────────────────────────────────────

async fn brain() -> Brain {
    Brain::builder(BrainConfig::default())
        .with_executor(TaskType::OrderProcess, executor_fn(|_ctx| async { Ok(json!(null)) }))
        .with_executor(TaskType::MessagePush, executor_fn(|_ctx| async { Ok(json!(null)) }))
        .build()
        .await
        .unwrap()
}

fn order(step: &str) -> SubmitRequest {
    SubmitRequest::new(TaskType::OrderProcess, json!({ "step": step }))
}

/// Claims `id` as `consumer` and reports success.
async fn run_to_success(brain: &Brain, id: &str, consumer: &str, now: DateTime<Utc>) {
    let record = brain
        .lifecycle()
        .claim(id, consumer, StdDuration::from_secs(30), now)
        .await
        .unwrap()
        .expect("task should be claimable");
    let token = record.lease.expect("running task holds a lease").token;
    let task = brain
        .lifecycle()
        .report(id, &token, AttemptOutcome::Succeeded(json!("ok")), now)
        .await
        .unwrap()
        .expect("report from the lease holder is accepted");
    assert_eq!(task.status, TaskStatus::Succeeded);
}

async fn status_of(brain: &Brain, id: &str) -> TaskStatus {
    brain.get_status(id).await.unwrap().status
}

// ─── Dependencies ───────────────────────────────────────────────────

#[tokio::test]
async fn diamond_runs_in_dependency_order() {
    let brain = brain().await;
    let plan = PlanRequest::default()
        .task("a", order("a"))
        .task("b", order("b").with_dependencies(["a"]))
        .task("c", order("c").with_dependencies(["a"]))
        .task("d", order("d").with_dependencies(["b", "c"]));
    let outcome = brain.submit_plan(plan).await.unwrap();
    let id = |key: &str| outcome.id_of(key).unwrap().to_string();
    let now = Utc::now() + Duration::seconds(1);

    let report = brain.tick(now).await.unwrap();
    assert_eq!(report.promoted, vec![id("a")]);
    assert_eq!(status_of(&brain, &id("b")).await, TaskStatus::Pending);

    run_to_success(&brain, &id("a"), "consumer-1", now).await;

    let report = brain.tick(now).await.unwrap();
    let mut promoted = report.promoted.clone();
    promoted.sort();
    let mut expected = vec![id("b"), id("c")];
    expected.sort();
    assert_eq!(promoted, expected);
    assert_eq!(status_of(&brain, &id("d")).await, TaskStatus::Pending);

    run_to_success(&brain, &id("b"), "consumer-1", now).await;
    let report = brain.tick(now).await.unwrap();
    assert!(report.promoted.is_empty(), "d must wait for c");
    assert_eq!(status_of(&brain, &id("d")).await, TaskStatus::Pending);

    run_to_success(&brain, &id("c"), "consumer-2", now).await;
    let report = brain.tick(now).await.unwrap();
    assert_eq!(report.promoted, vec![id("d")]);
    assert_eq!(status_of(&brain, &id("d")).await, TaskStatus::Ready);
}

#[tokio::test]
async fn failed_dependency_cancels_the_chain() {
    let brain = brain().await;
    let plan = PlanRequest::default()
        .task("a", order("a").with_max_attempts(1))
        .task("b", order("b").with_dependencies(["a"]))
        .task("c", order("c").with_dependencies(["b"]));
    let outcome = brain.submit_plan(plan).await.unwrap();
    let a = outcome.id_of("a").unwrap().to_string();
    let now = Utc::now() + Duration::seconds(1);

    brain.tick(now).await.unwrap();
    let record = brain
        .lifecycle()
        .claim(&a, "consumer-1", StdDuration::from_secs(30), now)
        .await
        .unwrap()
        .unwrap();
    let token = record.lease.unwrap().token;
    let failed = brain
        .lifecycle()
        .report(
            &a,
            &token,
            AttemptOutcome::Failed(brain::ExecutionError::permanent("card declined")),
            now,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);

    let report = brain.tick(now).await.unwrap();
    assert_eq!(report.cascaded.len(), 2);
    for key in ["b", "c"] {
        let task = brain.get_status(outcome.id_of(key).unwrap()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.last_error.unwrap().kind, ErrorKind::Dependency);
    }
}

#[tokio::test]
async fn cyclic_plan_persists_nothing() {
    let brain = brain().await;
    let plan = PlanRequest::default()
        .task("a", order("a").with_dependencies(["c"]))
        .task("b", order("b").with_dependencies(["a"]))
        .task("c", order("c").with_dependencies(["b"]));

    let err = brain.submit_plan(plan).await.unwrap_err();
    assert!(matches!(err, BrainError::Validation { .. }), "{err:?}");

    let page = brain.list(&TaskFilter::default()).await.unwrap();
    assert!(page.tasks.is_empty());
    assert!(brain.events().recent().is_empty());
}

// ─── Timeouts ───────────────────────────────────────────────────────

#[tokio::test]
async fn expired_lease_is_redispatched_to_another_consumer() {
    let brain = brain().await;
    let outcome = brain.submit(order("slow").with_max_attempts(3)).await.unwrap();
    let id = outcome.tasks[0].id.clone();
    let t0 = Utc::now() + Duration::seconds(1);

    brain.tick(t0).await.unwrap();
    let first = brain
        .lifecycle()
        .claim(&id, "node-a/ORDER_PROCESS", StdDuration::from_secs(1), t0)
        .await
        .unwrap()
        .unwrap();
    let stale_token = first.lease.unwrap().token;

    let t1 = t0 + Duration::seconds(5);
    let report = brain.tick(t1).await.unwrap();
    assert_eq!(report.reaped, vec![id.clone()]);

    let task = brain.get_status(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert_eq!(task.attempt_count, 1);
    assert_eq!(task.last_error.as_ref().unwrap().kind, ErrorKind::Timeout);
    let not_before = task.not_before.expect("backoff is recorded");
    assert!(not_before > t1);

    // Too early: still backing off.
    assert!(brain
        .lifecycle()
        .claim(&id, "node-b/ORDER_PROCESS", StdDuration::from_secs(30), t1)
        .await
        .unwrap()
        .is_none());

    let t2 = not_before + Duration::milliseconds(1);
    let second = brain
        .lifecycle()
        .claim(&id, "node-b/ORDER_PROCESS", StdDuration::from_secs(30), t2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.lease.as_ref().unwrap().consumer_id, "node-b/ORDER_PROCESS");

    // The first consumer finally answers; its report is stale.
    let late = brain
        .lifecycle()
        .report(&id, &stale_token, AttemptOutcome::Succeeded(json!("late")), t2)
        .await
        .unwrap();
    assert!(late.is_none());
    assert_eq!(status_of(&brain, &id).await, TaskStatus::Running);
}

#[tokio::test]
async fn exhausted_timeouts_end_in_failed() {
    let brain = brain().await;
    let outcome = brain.submit(order("hang").with_max_attempts(1)).await.unwrap();
    let id = outcome.tasks[0].id.clone();
    let t0 = Utc::now() + Duration::seconds(1);

    brain.tick(t0).await.unwrap();
    brain
        .lifecycle()
        .claim(&id, "consumer", StdDuration::from_secs(1), t0)
        .await
        .unwrap()
        .unwrap();
    let mut events = brain.subscribe();

    brain.tick(t0 + Duration::seconds(5)).await.unwrap();

    let task = brain.get_status(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempt_count, 1);

    let mut kinds = Vec::new();
    while let Some(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&brain::TaskEventKind::Alert), "{kinds:?}");
}

// ─── Recurrence ─────────────────────────────────────────────────────

#[tokio::test]
async fn missed_interval_fires_once_without_catch_up() {
    let brain = brain().await;
    brain
        .submit(
            SubmitRequest::new(TaskType::MessagePush, json!({ "text": "ping" })).with_schedule(
                ScheduleSpec::Recurring {
                    expression: "@every 1m".into(),
                    allow_catch_up: false,
                },
            ),
        )
        .await
        .unwrap();
    let rule = brain.list_rules().await.unwrap().remove(0);
    let first = rule.next_fire_at;

    // Down for two and a half intervals.
    let now = first + Duration::seconds(150);
    let report = brain.tick(now).await.unwrap();
    assert_eq!(report.fired.len(), 1);

    let rule = brain.list_rules().await.unwrap().remove(0);
    assert_eq!(rule.next_fire_at, first + Duration::minutes(3));
    assert_eq!(rule.stats.fire_count, 1);

    let instance = brain.get_status(&report.fired[0]).await.unwrap();
    assert_eq!(instance.rule_id.as_deref(), Some(rule.id.as_str()));
    assert_eq!(instance.task_type, TaskType::MessagePush);

    // Nothing more until the next occurrence.
    let report = brain.tick(now + Duration::seconds(10)).await.unwrap();
    assert!(report.fired.is_empty());
}

#[tokio::test]
async fn catch_up_replays_each_missed_occurrence() {
    let brain = brain().await;
    brain
        .submit(
            SubmitRequest::new(TaskType::MessagePush, json!({})).with_schedule(
                ScheduleSpec::Recurring {
                    expression: "@every 1m".into(),
                    allow_catch_up: true,
                },
            ),
        )
        .await
        .unwrap();
    let first = brain.list_rules().await.unwrap()[0].next_fire_at;

    let report = brain.tick(first + Duration::seconds(150)).await.unwrap();
    assert_eq!(report.fired.len(), 3);

    let rule = brain.list_rules().await.unwrap().remove(0);
    assert_eq!(rule.next_fire_at, first + Duration::minutes(3));
    assert_eq!(rule.stats.fire_count, 3);
}

// ─── Cancellation ───────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_pending_task_never_runs() {
    let brain = brain().await;
    let run_at = Utc::now() + Duration::hours(1);
    let outcome = brain
        .submit(order("later").with_schedule(ScheduleSpec::At { run_at }))
        .await
        .unwrap();
    let id = outcome.tasks[0].id.clone();

    let task = brain.cancel(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.completed_at.is_some());

    let report = brain.tick(run_at + Duration::minutes(1)).await.unwrap();
    assert!(report.promoted.is_empty());
    assert!(report.admitted.is_empty());
    let task = brain.get_status(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.attempt_count, 0);
}

#[tokio::test]
async fn paused_task_is_skipped_until_resumed() {
    let brain = brain().await;
    let outcome = brain.submit(order("hold")).await.unwrap();
    let id = outcome.tasks[0].id.clone();
    let now = Utc::now() + Duration::seconds(1);

    brain.pause(&id).await.unwrap();
    let report = brain.tick(now).await.unwrap();
    assert!(report.promoted.is_empty());
    assert_eq!(status_of(&brain, &id).await, TaskStatus::Paused);

    assert_eq!(brain.resume(&id).await.unwrap().status, TaskStatus::Pending);
    let report = brain.tick(now).await.unwrap();
    assert_eq!(report.promoted, vec![id.clone()]);
    assert_eq!(report.admitted.len(), 1);
}
