//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when a worker completes a call but the task reports failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailurePolicy {
    /// Treat it like a transport failure: the worker is dead for the rest of the job
    #[default]
    MarkWorkerDead,

    /// Keep the worker, requeue the item, and fail the phase once one item
    /// has failed `max_attempts` times
    RetryItem { max_attempts: u32 },
}

/// Timing and failure-handling knobs for phase execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of the health monitor
    pub heartbeat_interval_ms: u64,

    /// Deadline for one connectivity probe
    pub probe_timeout_ms: u64,

    /// Period of the straggler monitor
    pub straggler_interval_ms: u64,

    /// Elapsed time below which nothing is ever speculated
    pub speculation_floor_ms: u64,

    /// Multiple of the fastest in-flight item's elapsed time that marks a straggler
    pub speculation_multiplier: f64,

    /// Deadline for a task call; `None` lets calls run indefinitely
    pub call_timeout_ms: Option<u64>,

    /// Handling of task-reported failures
    pub failure_policy: FailurePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1500,
            probe_timeout_ms: 500,
            straggler_interval_ms: 500,
            speculation_floor_ms: 4000,
            speculation_multiplier: 2.5,
            call_timeout_ms: None,
            failure_policy: FailurePolicy::MarkWorkerDead,
        }
    }
}

impl SchedulerConfig {
    /// Create a new config builder
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn straggler_interval(&self) -> Duration {
        Duration::from_millis(self.straggler_interval_ms)
    }

    pub fn speculation_floor(&self) -> Duration {
        Duration::from_millis(self.speculation_floor_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("straggler_interval_ms", self.straggler_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "Must be greater than 0".to_string(),
                });
            }
        }

        if self.probe_timeout_ms >= self.heartbeat_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "probe_timeout_ms".to_string(),
                reason: "Probe timeout must be shorter than the heartbeat interval".to_string(),
            });
        }

        if !self.speculation_multiplier.is_finite() || self.speculation_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "speculation_multiplier".to_string(),
                reason: format!("Must be >= 1.0, got {}", self.speculation_multiplier),
            });
        }

        if self.call_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "call_timeout_ms".to_string(),
                reason: "Must be greater than 0 when set".to_string(),
            });
        }

        if let FailurePolicy::RetryItem { max_attempts: 0 } = self.failure_policy {
            return Err(ConfigError::InvalidValue {
                field: "failure_policy.max_attempts".to_string(),
                reason: "Must allow at least 1 attempt".to_string(),
            });
        }

        Ok(())
    }
}

/// Builder for SchedulerConfig
#[derive(Debug, Default)]
pub struct SchedulerConfigBuilder {
    heartbeat_interval_ms: Option<u64>,
    probe_timeout_ms: Option<u64>,
    straggler_interval_ms: Option<u64>,
    speculation_floor_ms: Option<u64>,
    speculation_multiplier: Option<f64>,
    call_timeout_ms: Option<u64>,
    failure_policy: Option<FailurePolicy>,
}

impl SchedulerConfigBuilder {
    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = Some(ms);
        self
    }

    pub fn probe_timeout_ms(mut self, ms: u64) -> Self {
        self.probe_timeout_ms = Some(ms);
        self
    }

    pub fn straggler_interval_ms(mut self, ms: u64) -> Self {
        self.straggler_interval_ms = Some(ms);
        self
    }

    pub fn speculation_floor_ms(mut self, ms: u64) -> Self {
        self.speculation_floor_ms = Some(ms);
        self
    }

    pub fn speculation_multiplier(mut self, multiplier: f64) -> Self {
        self.speculation_multiplier = Some(multiplier);
        self
    }

    pub fn call_timeout_ms(mut self, ms: u64) -> Self {
        self.call_timeout_ms = Some(ms);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    /// Build the config
    pub fn build(self) -> Result<SchedulerConfig, ConfigError> {
        let defaults = SchedulerConfig::default();
        let config = SchedulerConfig {
            heartbeat_interval_ms: self
                .heartbeat_interval_ms
                .unwrap_or(defaults.heartbeat_interval_ms),
            probe_timeout_ms: self.probe_timeout_ms.unwrap_or(defaults.probe_timeout_ms),
            straggler_interval_ms: self
                .straggler_interval_ms
                .unwrap_or(defaults.straggler_interval_ms),
            speculation_floor_ms: self
                .speculation_floor_ms
                .unwrap_or(defaults.speculation_floor_ms),
            speculation_multiplier: self
                .speculation_multiplier
                .unwrap_or(defaults.speculation_multiplier),
            call_timeout_ms: self.call_timeout_ms.or(defaults.call_timeout_ms),
            failure_policy: self.failure_policy.unwrap_or(defaults.failure_policy),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue { field: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
