//! CLI configuration: the library's `[brain]` section plus one
//! `[executors.<TYPE>]` table per task type run as an external command.
//!
//! ```toml
//! [brain]
//! node_id = "worker-1"
//!
//! [brain.storage]
//! backend = "file"
//! path = "./brain-data"
//!
//! [executors.PRICE_INQUIRY]
//! command = ["./bin/price", "--json"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use brain::{BrainConfig, TaskType};
use serde::Deserialize;

/// An external command executing one task type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandSpec {
    /// Program and arguments.
    pub command: Vec<String>,
    /// Working directory; defaults to the current one.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct CliFile {
    #[serde(default)]
    brain: BrainConfig,
    #[serde(default)]
    executors: BTreeMap<String, CommandSpec>,
}

/// Parsed CLI configuration.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub brain: BrainConfig,
    pub executors: BTreeMap<TaskType, CommandSpec>,
}

impl CliConfig {
    /// Loads `path`, or defaults when the file does not exist, then applies
    /// `BRAIN_*` environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            Self::default()
        };
        config.brain.apply_env_overrides();
        Ok(config)
    }

    /// Parses a configuration document.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let file: CliFile = toml::from_str(content)?;
        let mut executors = BTreeMap::new();
        for (name, spec) in file.executors {
            let task_type: TaskType = name
                .parse()
                .with_context(|| format!("[executors.{name}]"))?;
            if spec.command.is_empty() {
                anyhow::bail!("[executors.{name}]: command must not be empty");
            }
            executors.insert(task_type, spec);
        }
        Ok(Self {
            brain: file.brain,
            executors,
        })
    }
}
