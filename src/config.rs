//! Engine configuration loaded from `batchflow.toml`, and the TOML job files
//! fed to `batchflow run`.
//!
//! Missing keys fall back to defaults. `BATCHFLOW_WORKERS` takes precedence
//! over the `workers` key in the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::parameters::ParameterSet;
use crate::pool::PoolConfig;

pub const DEFAULT_CONFIG_FILE: &str = "batchflow.toml";
pub const WORKERS_ENV: &str = "BATCHFLOW_WORKERS";

/// A shell module declared under `[modules.<name>]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModuleDef {
    /// Command template; `{name}` placeholders are filled from job parameters.
    pub command: String,
    /// Parameter that receives the command's trimmed stdout.
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Concurrent module invocations across all jobs.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Tasks allowed to wait for a worker before submissions are refused.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Shell used to run module commands.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Run on STOP to remove the job from the batch system.
    #[serde(default = "default_dequeue_command")]
    pub dequeue_command: String,

    /// Run on RESTARTING before preprocessing starts again.
    #[serde(default = "default_cleanup_command")]
    pub cleanup_command: String,

    /// Prints a batch status code for `{batchID}`. Unset means jobs run
    /// locally and are reported done as soon as they are submitted.
    #[serde(default)]
    pub status_command: Option<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub modules: BTreeMap<String, ModuleDef>,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_dequeue_command() -> String {
    "qdel {batchID}".to_string()
}

fn default_cleanup_command() -> String {
    "true".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            shell: default_shell(),
            dequeue_command: default_dequeue_command(),
            cleanup_command: default_cleanup_command(),
            status_command: None,
            poll_interval_ms: default_poll_interval_ms(),
            modules: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`, or from `batchflow.toml` in the working directory
    /// when no path is given. A missing default file yields the defaults; a
    /// missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };

        if let Ok(value) = std::env::var(WORKERS_ENV) {
            config.apply_workers_override(&value)?;
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    fn apply_workers_override(&mut self, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(());
        }
        self.workers = value
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{WORKERS_ENV} must be a number, got {value:?}")))?;
        Ok(())
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
        }
    }
}

/// A job definition read from disk.
#[derive(Debug, Clone, Deserialize)]
pub struct JobFile {
    pub name: String,
    #[serde(default)]
    pub parameters: ParameterSet,
    /// Stage name (`preprocessing`, `submitting`, `postprocessing`) to
    /// module name.
    #[serde(default)]
    pub stages: BTreeMap<String, String>,
    #[serde(skip)]
    pub path: PathBuf,
}

impl JobFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut job: JobFile = toml::from_str(&contents)?;
        job.path = path.to_path_buf();
        Ok(job)
    }
}
