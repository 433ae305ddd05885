//! Brain: a task-orchestration core.
//!
//! The Brain accepts typed work items, resolves their dependencies,
//! schedules them (once, at a fixed time, or on a recurrence), routes each
//! to a per-type lane with bounded concurrency, runs it through a
//! registered [`Executor`](executor::Executor), and tracks it through a
//! state machine with retries, timeouts, cancellation and an event feed.
//!
//! # Overview
//!
//! ```text
//! submit ──▶ Planner ──▶ Task Store ◀── Scheduler ──▶ Dispatcher ──▶ lanes ──▶ Consumers
//!                            │                                                   │
//!                            └────────────────── Event Bus ◀─────────────────────┘
//! ```
//!
//! Every state change is a compare-and-swap against the [`TaskStore`], so
//! several Brain replicas may share one backend without executing a task
//! twice.
//!
//! # Module Organization
//!
//! - [`types`] - Task, schedule and event types
//! - [`domain`] - Stored records and the dependency graph
//! - [`store`] - Store trait, generic implementation and backends
//! - [`planner`] - Submission validation and persistence
//! - [`scheduler`] - Rule firing, promotion and admission
//! - [`dispatcher`] / [`consumer`] - Lanes and their workers
//! - [`lifecycle`] - The state machine transitions
//! - [`controller`] - The [`Brain`] façade
//! - [`config`] - TOML and environment configuration

pub mod config;
pub mod consumer;
pub mod controller;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod events;
pub mod executor;
pub mod lifecycle;
pub mod planner;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-exports for ergonomic access
pub use config::{BrainConfig, ConfigError};
pub use controller::{Brain, BrainBuilder, BrainStatus};
pub use error::BrainError;
pub use events::{EventBus, EventSubscription};
pub use executor::{ExecutionContext, ExecutionError, Executor, ExecutorRegistry};
pub use planner::{PlanRequest, SubmitOutcome, SubmitRequest};
pub use store::{TaskFilter, TaskPage, TaskStore};
pub use types::*;
