//! Scheduling types: per-task [`ScheduleSpec`] and periodic [`ScheduleRule`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::task::TaskType;

/// When a submitted task should run.
///
/// A fixed `At` time keeps the task `PENDING` until the time passes. A
/// `Recurring` submission does not create a task directly; the planner
/// turns it into a [`ScheduleRule`] and the scheduler instantiates tasks
/// from it.
///
/// # Examples
///
/// ```
/// use brain::ScheduleSpec;
///
/// let spec: ScheduleSpec = serde_json::from_str(
///     r#"{"kind": "recurring", "expression": "@every 1m"}"#,
/// ).unwrap();
/// assert!(matches!(spec, ScheduleSpec::Recurring { allow_catch_up: false, .. }));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Run once, no earlier than `run_at`.
    At {
        /// Earliest execution time.
        run_at: DateTime<Utc>,
    },
    /// Run periodically according to a recurrence expression.
    Recurring {
        /// Five-field cron expression or `@every <duration>` / `@hourly` style
        /// shorthand.
        expression: String,
        /// Replay every missed occurrence after downtime instead of firing
        /// once.
        #[serde(default)]
        allow_catch_up: bool,
    },
}

/// The task a [`ScheduleRule`] stamps out on every firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Type of each instance.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Payload copied into each instance.
    #[serde(default)]
    pub payload: Value,
    /// Priority of each instance.
    #[serde(default)]
    pub priority: i32,
    /// Attempt budget of each instance.
    pub max_attempts: u32,
}

/// Firing statistics kept on a rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleStats {
    /// Number of task instances created.
    pub fire_count: u64,
    /// Time of the most recent firing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Id of the most recently created instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task_id: Option<String>,
}

/// A periodic task definition.
///
/// Only the scheduler advances `next_fire_at`; operators toggle `enabled`
/// or remove the rule through the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRule {
    /// Unique rule id.
    pub id: String,
    /// Recurrence expression.
    pub expression: String,
    /// Next occurrence to instantiate.
    pub next_fire_at: DateTime<Utc>,
    /// Disabled rules never fire.
    pub enabled: bool,
    /// Replay every missed occurrence instead of firing once.
    #[serde(default)]
    pub allow_catch_up: bool,
    /// What each firing creates.
    pub template: TaskTemplate,
    /// Firing counters.
    #[serde(default)]
    pub stats: RuleStats,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Store version (not serialized).
    #[serde(skip)]
    pub version: u64,
}

impl ScheduleRule {
    /// Creates an enabled rule with a fresh UUID.
    pub fn new(
        expression: impl Into<String>,
        template: TaskTemplate,
        next_fire_at: DateTime<Utc>,
        allow_catch_up: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            expression: expression.into(),
            next_fire_at,
            enabled: true,
            allow_catch_up,
            template,
            stats: RuleStats::default(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Returns `true` if the rule is enabled and its next occurrence has
    /// passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire_at <= now
    }
}
