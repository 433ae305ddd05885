//! Brain configuration.
//!
//! Configuration can be loaded from:
//! 1. TOML file (`brain.toml`, section `[brain]`)
//! 2. Environment variables (with `BRAIN_` prefix)
//!
//! Environment variables override TOML configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [brain]
//! tick_interval_ms = 250
//! global_concurrency = 16
//! default_timeout_ms = 10000
//!
//! [brain.retry]
//! base_delay_ms = 500
//! jitter = 0.1
//!
//! [brain.storage]
//! backend = "file"
//! path = "/var/lib/brain"
//!
//! [brain.lanes.CUSTOMER_REPLY]
//! capacity = 8
//! timeout_ms = 60000
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::StoreConfig;
use crate::types::task::TaskType;

/// Top-level Brain configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    /// Identifier of this replica, used in lease owner ids.
    pub node_id: String,
    /// Scheduling pass interval.
    pub tick_interval_ms: u64,
    /// Maximum tasks running across all lanes.
    pub global_concurrency: usize,
    /// Attempt budget when neither the request nor the lane sets one.
    pub default_max_attempts: u32,
    /// Per-attempt deadline when the lane does not set one.
    pub default_timeout_ms: u64,
    /// Extra time past the deadline before a lease is reaped.
    pub lease_grace_ms: u64,
    /// How long terminal tasks are kept before they may be archived.
    pub retention_hours: u64,
    /// Capacity of the event channel and replay log.
    pub event_buffer: usize,
    /// Cancel pending dependents of failed or cancelled tasks.
    pub cascade_dependency_failures: bool,
    /// Upper bound on replayed occurrences per rule and pass.
    pub max_catch_up: usize,
    /// Backoff between attempts.
    pub retry: RetryConfig,
    /// Payload and batch limits.
    pub store: StoreConfig,
    /// Where tasks are persisted.
    pub storage: StorageConfig,
    /// Per task type lane settings, keyed by type name.
    pub lanes: BTreeMap<String, LaneConfig>,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            node_id: "brain-local".to_string(),
            tick_interval_ms: 500,
            global_concurrency: 32,
            default_max_attempts: 3,
            default_timeout_ms: 30_000,
            lease_grace_ms: 5_000,
            retention_hours: 168,
            event_buffer: 1024,
            cascade_dependency_failures: true,
            max_catch_up: 100,
            retry: RetryConfig::default(),
            store: StoreConfig::default(),
            storage: StorageConfig::default(),
            lanes: BTreeMap::new(),
        }
    }
}

impl BrainConfig {
    /// Load configuration from `brain.toml` in the working directory (if
    /// present) and the environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. TOML configuration file
    /// 3. Default values
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = if let Ok(contents) = std::fs::read_to_string("brain.toml") {
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply
    /// environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct FullConfig {
            #[serde(default)]
            brain: BrainConfig,
        }

        let full: FullConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(full.brain)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(value: Option<String>, target: &mut T) {
            if let Some(v) = value.and_then(|v| v.trim().parse().ok()) {
                *target = v;
            }
        }

        parsed(lookup("BRAIN_TICK_INTERVAL_MS"), &mut self.tick_interval_ms);
        parsed(lookup("BRAIN_GLOBAL_CONCURRENCY"), &mut self.global_concurrency);
        parsed(lookup("BRAIN_DEFAULT_MAX_ATTEMPTS"), &mut self.default_max_attempts);
        parsed(lookup("BRAIN_DEFAULT_TIMEOUT_MS"), &mut self.default_timeout_ms);
        parsed(lookup("BRAIN_RETENTION_HOURS"), &mut self.retention_hours);

        if let Some(node_id) = lookup("BRAIN_NODE_ID").filter(|v| !v.trim().is_empty()) {
            self.node_id = node_id;
        }
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be positive".into()));
        }
        if self.global_concurrency == 0 {
            return Err(ConfigError::Invalid("global_concurrency must be positive".into()));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Invalid("default_max_attempts must be positive".into()));
        }
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid("default_timeout_ms must be positive".into()));
        }
        for (name, lane) in &self.lanes {
            name.parse::<TaskType>()
                .map_err(|_| ConfigError::Invalid(format!("unknown lane type: {name}")))?;
            if lane.capacity == 0 {
                return Err(ConfigError::Invalid(format!("lane {name}: capacity must be positive")));
            }
            if lane.max_attempts == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "lane {name}: max_attempts must be positive"
                )));
            }
        }
        Ok(())
    }

    /// Settings for `task_type`'s lane, falling back to the defaults.
    pub fn lane(&self, task_type: TaskType) -> ResolvedLane {
        let lane = self
            .lanes
            .iter()
            .find(|(name, _)| name.parse::<TaskType>().ok() == Some(task_type))
            .map(|(_, lane)| lane.clone())
            .unwrap_or_default();
        ResolvedLane {
            task_type,
            capacity: lane.capacity,
            timeout: Duration::from_millis(lane.timeout_ms.unwrap_or(self.default_timeout_ms)),
            max_attempts: lane.max_attempts.unwrap_or(self.default_max_attempts),
        }
    }

    /// Attempt budgets per type, as resolved by [`lane`](Self::lane).
    pub fn max_attempts_by_type(&self) -> HashMap<TaskType, u32> {
        TaskType::ALL
            .into_iter()
            .map(|t| (t, self.lane(t).max_attempts))
            .collect()
    }

    /// The scheduling pass interval.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Extra lease time past the attempt deadline.
    pub fn lease_grace(&self) -> Duration {
        Duration::from_millis(self.lease_grace_ms)
    }

    /// Retention window for terminal tasks.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::try_from(self.retention_hours).unwrap_or(i64::MAX / 3600))
    }
}

/// Backoff settings; see [`RetryPolicy`](crate::retry::RetryPolicy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay after the first failed attempt.
    pub base_delay_ms: u64,
    /// Upper bound before jitter.
    pub max_delay_ms: u64,
    /// Growth per attempt.
    pub multiplier: f64,
    /// Relative jitter in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// One lane's settings as written in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    /// Maximum in-flight tasks of this type.
    pub capacity: usize,
    /// Per-attempt deadline; defaults to `default_timeout_ms`.
    pub timeout_ms: Option<u64>,
    /// Attempt budget; defaults to `default_max_attempts`.
    pub max_attempts: Option<u32>,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            timeout_ms: None,
            max_attempts: None,
        }
    }
}

/// Lane settings with defaults filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLane {
    /// The lane's task type.
    pub task_type: TaskType,
    /// Maximum in-flight tasks.
    pub capacity: usize,
    /// Per-attempt deadline.
    pub timeout: Duration,
    /// Attempt budget for new tasks.
    pub max_attempts: u32,
}

/// Storage backend selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Process-local; lost on exit.
    #[default]
    Memory,
    /// One JSON file per record under `path`.
    File {
        /// Data directory.
        path: PathBuf,
    },
    /// Shared Redis (requires the `redis` feature).
    Redis {
        /// Connection URL.
        url: String,
        /// Key prefix.
        #[serde(default = "default_redis_prefix")]
        prefix: String,
    },
}

impl StorageConfig {
    /// Backend name as written in the file.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File { .. } => "file",
            Self::Redis { .. } => "redis",
        }
    }
}

fn default_redis_prefix() -> String {
    "brain".to_string()
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io {
        /// Path that failed.
        path: String,
        /// Error message.
        error: String,
    },
    /// TOML parse error.
    Parse(String),
    /// A value out of range.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, error } => write!(f, "failed to read config file {path}: {error}"),
            Self::Parse(e) => write!(f, "failed to parse config: {e}"),
            Self::Invalid(e) => write!(f, "invalid config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = BrainConfig::default();
        assert_eq!(config.tick_interval_ms, 500);
        assert_eq!(config.global_concurrency, 32);
        assert_eq!(config.default_max_attempts, 3);
        assert_eq!(config.default_timeout_ms, 30_000);
        assert_eq!(config.retention_hours, 168);
        assert!(config.cascade_dependency_failures);
        assert_eq!(config.storage, StorageConfig::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_toml_yields_defaults() {
        assert_eq!(BrainConfig::from_toml("").unwrap(), BrainConfig::default());
    }

    #[test]
    fn parses_sections_and_lanes() {
        let toml = r#"
            [brain]
            tick_interval_ms = 100
            cascade_dependency_failures = false

            [brain.retry]
            jitter = 0.0

            [brain.storage]
            backend = "file"
            path = "/tmp/brain"

            [brain.lanes.ORDER_PROCESS]
            capacity = 2
            timeout_ms = 1500
            max_attempts = 5
        "#;
        let config = BrainConfig::from_toml(toml).unwrap();
        assert_eq!(config.tick_interval_ms, 100);
        assert!(!config.cascade_dependency_failures);
        assert_eq!(config.retry.jitter, 0.0);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(
            config.storage,
            StorageConfig::File {
                path: PathBuf::from("/tmp/brain")
            }
        );

        let lane = config.lane(TaskType::OrderProcess);
        assert_eq!(lane.capacity, 2);
        assert_eq!(lane.timeout, Duration::from_millis(1500));
        assert_eq!(lane.max_attempts, 5);

        let other = config.lane(TaskType::PriceInquiry);
        assert_eq!(other.capacity, 4);
        assert_eq!(other.timeout, Duration::from_millis(30_000));
        assert_eq!(other.max_attempts, 3);
    }

    #[test]
    fn unknown_lane_is_rejected() {
        let config =
            BrainConfig::from_toml("[brain.lanes.TELEPORT]\ncapacity = 1\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = BrainConfig::from_toml("[brain\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = BrainConfig::default();
        let env: HashMap<&str, &str> = [
            ("BRAIN_TICK_INTERVAL_MS", "50"),
            ("BRAIN_GLOBAL_CONCURRENCY", "not-a-number"),
            ("BRAIN_NODE_ID", "node-7"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.tick_interval_ms, 50);
        assert_eq!(config.global_concurrency, 32);
        assert_eq!(config.node_id, "node-7");
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = BrainConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn from_file_reads_brain_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[brain]\nglobal_concurrency = 3").unwrap();
        let config = BrainConfig::from_file(file.path()).unwrap();
        assert_eq!(config.global_concurrency, 3);
    }
}
