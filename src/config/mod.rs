//! Job configuration
//!
//! A job is described by a TOML file. A handful of environment variables
//! override file values so the same job file can run in different
//! environments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::coordinator::SchedulerConfig;
use crate::tasks::WORDCOUNT;

/// Main job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Identifier used to namespace intermediate storage
    #[serde(default = "default_job_id")]
    pub job_id: String,

    /// Worker addresses (`host:port`)
    pub workers: Vec<String>,

    /// Input files, sharded in the order given
    pub input_files: Vec<PathBuf>,

    /// Directory receiving `output_<r>.txt`; cleared at job start
    pub output_dir: PathBuf,

    /// Number of reduce partitions
    pub n_output_files: usize,

    /// Map shard size in kilobytes
    pub map_kilobytes: u64,

    /// Registered task name
    #[serde(default = "default_task")]
    pub task: String,

    /// Root of per-job intermediate storage
    #[serde(default = "default_intermediate_root")]
    pub intermediate_root: PathBuf,

    /// Scheduler timing and failure handling
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn default_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_task() -> String {
    WORDCOUNT.to_string()
}

fn default_intermediate_root() -> PathBuf {
    PathBuf::from("./intermediate")
}

impl JobConfig {
    /// Load configuration from a file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse configuration from TOML text without touching the environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override file values from `MAPRED_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("MAPRED_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("MAPRED_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(root) = std::env::var("MAPRED_INTERMEDIATE_ROOT") {
            self.intermediate_root = PathBuf::from(root);
        }
        if let Ok(dir) = std::env::var("MAPRED_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.job_id.is_empty() {
            anyhow::bail!("job_id must not be empty");
        }

        if self.job_id.contains(['/', '\\']) || self.job_id == "." || self.job_id == ".." {
            anyhow::bail!("job_id must be a single path component, got '{}'", self.job_id);
        }

        if self.workers.is_empty() {
            anyhow::bail!("at least one worker is required");
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            if !seen.insert(worker.as_str()) {
                anyhow::bail!("duplicate worker address: {worker}");
            }
        }

        if self.input_files.is_empty() {
            anyhow::bail!("at least one input file is required");
        }

        if self.output_dir.as_os_str().is_empty() {
            anyhow::bail!("output_dir must not be empty");
        }

        if self.n_output_files == 0 {
            anyhow::bail!("n_output_files must be greater than 0");
        }

        if self.map_kilobytes == 0 {
            anyhow::bail!("map_kilobytes must be greater than 0");
        }

        self.scheduler
            .validate()
            .context("invalid [scheduler] section")?;

        Ok(())
    }

    /// `<intermediate_root>/<job_id>`
    #[must_use]
    pub fn job_root(&self) -> PathBuf {
        self.intermediate_root.join(&self.job_id)
    }
}
