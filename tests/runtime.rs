//! Tests against the running background runtime: scheduler loop,
//! dispatcher lanes and consumer workers together.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use brain::config::{LaneConfig, StorageConfig};
use brain::executor::executor_fn;
use brain::{
    Brain, BrainConfig, ExecutionError, PlanRequest, SubmitRequest, Task, TaskEventKind,
    TaskStatus, TaskType,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;

// ─── Helpers ────────────────────────────────────────────────────────

fn fast_config() -> BrainConfig {
    let mut config = BrainConfig {
        tick_interval_ms: 20,
        ..BrainConfig::default()
    };
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config
}

/// Waits until `id` reaches a terminal status and returns it.
async fn settle(brain: &Brain, id: &str) -> Task {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let task = brain.get_status(id).await.unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task should settle")
}

// ─── Execution ──────────────────────────────────────────────────────

#[tokio::test]
async fn plan_executes_in_dependency_order() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen = order.clone();
    let brain = Brain::builder(fast_config())
        .with_executor(
            TaskType::InventoryCheck,
            executor_fn(move |ctx| {
                let seen = seen.clone();
                async move {
                    let step = ctx.payload()["step"].as_str().unwrap_or_default().to_string();
                    seen.lock().push(step.clone());
                    Ok(json!({ "done": step }))
                }
            }),
        )
        .build()
        .await
        .unwrap();
    brain.start().await.unwrap();

    let step = |name: &str| SubmitRequest::new(TaskType::InventoryCheck, json!({ "step": name }));
    let outcome = brain
        .submit_plan(
            PlanRequest::default()
                .task("count", step("count"))
                .task("reserve", step("reserve").with_dependencies(["count"]))
                .task("confirm", step("confirm").with_dependencies(["reserve"])),
        )
        .await
        .unwrap();

    let last = settle(&brain, outcome.id_of("confirm").unwrap()).await;
    assert_eq!(last.status, TaskStatus::Succeeded);
    assert_eq!(last.result, Some(json!({ "done": "confirm" })));
    assert_eq!(*order.lock(), vec!["count", "reserve", "confirm"]);

    brain.shutdown().await;
    assert!(!brain.is_running());
}

#[tokio::test]
async fn retryable_failure_is_retried_until_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let brain = Brain::builder(fast_config())
        .with_executor(
            TaskType::PriceInquiry,
            executor_fn(move |_ctx| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ExecutionError::new("upstream unavailable"))
                    } else {
                        Ok(json!({ "price": 42 }))
                    }
                }
            }),
        )
        .build()
        .await
        .unwrap();
    brain.start().await.unwrap();

    let outcome = brain
        .submit(SubmitRequest::new(TaskType::PriceInquiry, json!({ "sku": "A-1" })).with_max_attempts(3))
        .await
        .unwrap();
    let task = settle(&brain, &outcome.tasks[0].id).await;

    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.attempt_count, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    brain.shutdown().await;
}

#[tokio::test]
async fn slow_attempt_times_out_and_fails() {
    let mut config = fast_config();
    config.lanes.insert(
        "LOGISTICS_TRACK".to_string(),
        LaneConfig {
            capacity: 1,
            timeout_ms: Some(50),
            max_attempts: Some(2),
        },
    );
    let brain = Brain::builder(config)
        .with_executor(
            TaskType::LogisticsTrack,
            executor_fn(|_ctx| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            }),
        )
        .build()
        .await
        .unwrap();
    let mut events = brain.subscribe();
    brain.start().await.unwrap();

    let outcome = brain
        .submit(SubmitRequest::new(TaskType::LogisticsTrack, json!({})))
        .await
        .unwrap();
    let task = settle(&brain, &outcome.tasks[0].id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempt_count, 2);
    assert_eq!(task.last_error.unwrap().kind, brain::ErrorKind::Timeout);

    let mut alerted = false;
    while let Some(event) = events.try_recv() {
        alerted |= event.kind == TaskEventKind::Alert;
    }
    assert!(alerted);
    brain.shutdown().await;
}

// ─── Cancellation ───────────────────────────────────────────────────

#[tokio::test]
async fn running_task_stops_at_checkpoint_after_cancel() {
    let brain = Brain::builder(fast_config())
        .with_executor(
            TaskType::CustomerReply,
            executor_fn(|ctx| async move {
                loop {
                    ctx.checkpoint().await?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }),
        )
        .build()
        .await
        .unwrap();
    let mut events = brain.subscribe();
    brain.start().await.unwrap();

    let outcome = brain
        .submit(SubmitRequest::new(TaskType::CustomerReply, json!({ "ticket": 7 })))
        .await
        .unwrap();
    let id = outcome.tasks[0].id.clone();

    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            if event.task_id == id && event.new_status == TaskStatus::Running {
                break;
            }
        }
    })
    .await
    .expect("task should start");

    let requested = brain.cancel(&id).await.unwrap();
    assert_eq!(requested.status, TaskStatus::Running);
    assert!(requested.cancel_requested);

    let task = settle(&brain, &id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    brain.shutdown().await;
}

// ─── Concurrency ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_one_winner() {
    let brain = Brain::builder(BrainConfig::default())
        .with_executor(TaskType::OrderProcess, executor_fn(|_ctx| async { Ok(json!(null)) }))
        .build()
        .await
        .unwrap();
    let outcome = brain
        .submit(SubmitRequest::new(TaskType::OrderProcess, json!({})))
        .await
        .unwrap();
    let id = outcome.tasks[0].id.clone();
    let now = chrono::Utc::now() + chrono::Duration::seconds(1);
    brain.tick(now).await.unwrap();

    let mut handles = Vec::new();
    for n in 0..16 {
        let lifecycle = brain.lifecycle().clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            lifecycle
                .claim(&id, &format!("node-{n}"), Duration::from_secs(30), now)
                .await
                .unwrap()
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(record) = handle.await.unwrap() {
            winners.push(record.lease.unwrap().consumer_id);
        }
    }
    assert_eq!(winners.len(), 1, "winners: {winners:?}");

    let running = brain.events().recent().into_iter().filter(|e| {
        e.task_id == id && e.new_status == TaskStatus::Running
    });
    assert_eq!(running.count(), 1);
}

#[tokio::test]
async fn lane_capacity_bounds_parallelism() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (active.clone(), peak.clone());

    let mut config = fast_config();
    config.lanes = BTreeMap::from([(
        "MESSAGE_PUSH".to_string(),
        LaneConfig {
            capacity: 2,
            ..LaneConfig::default()
        },
    )]);
    let brain = Brain::builder(config)
        .with_executor(
            TaskType::MessagePush,
            executor_fn(move |_ctx| {
                let (a, p) = (a.clone(), p.clone());
                async move {
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }),
        )
        .build()
        .await
        .unwrap();
    brain.start().await.unwrap();

    let mut plan = PlanRequest::default();
    for n in 0..6 {
        plan = plan.task(format!("m{n}"), SubmitRequest::new(TaskType::MessagePush, json!({ "n": n })));
    }
    let outcome = brain.submit_plan(plan).await.unwrap();
    for id in outcome.task_ids() {
        assert_eq!(settle(&brain, id).await.status, TaskStatus::Succeeded);
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    brain.shutdown().await;
}

// ─── Durability ─────────────────────────────────────────────────────

#[tokio::test]
async fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = BrainConfig {
        storage: StorageConfig::File {
            path: dir.path().to_path_buf(),
        },
        ..BrainConfig::default()
    };
    let executors = || {
        brain::ExecutorRegistry::new()
            .with(TaskType::ScheduledReminder, executor_fn(|_ctx| async { Ok(json!(null)) }))
    };

    let first = Brain::builder(config.clone())
        .with_executors(executors())
        .build()
        .await
        .unwrap();
    let outcome = first
        .submit(
            SubmitRequest::new(TaskType::ScheduledReminder, json!({ "note": "renew" }))
                .with_priority(5),
        )
        .await
        .unwrap();
    let id = outcome.tasks[0].id.clone();
    first.pause(&id).await.unwrap();
    drop(first);

    let second = Brain::builder(config)
        .with_executors(executors())
        .build()
        .await
        .unwrap();
    let task = second.get_status(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.priority, 5);
    assert_eq!(task.payload, json!({ "note": "renew" }));
}
