//! Configuration surface consumed by the orchestration core.
//!
//! Values are produced elsewhere (CLI, config files) and validated here at
//! construction time. Invalid configuration is a fatal, non-retryable error
//! for the recovery policy.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

/// How the pipeline reacts to an unrecoverable task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Mark the failed task's dependents skipped and keep draining the graph.
    ContinueOnError,
    /// Propagate the failure so the state machine can roll back.
    #[default]
    RollbackOnCritical,
    /// Propagate the failure and abort without rollback.
    Abort,
}

/// Checkpoint persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Master switch for checkpointing.
    pub enabled: bool,
    /// Minimum interval between periodic scheduler snapshots.
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    /// Directory holding checkpoint files.
    pub dir: PathBuf,
    /// File name prefix.
    pub prefix: String,
    /// Gzip-compress checkpoint bodies.
    pub compress: bool,
    /// Rotation: keep at most this many snapshots.
    pub max_count: usize,
    /// Rotation: delete snapshots older than this window.
    #[serde(with = "duration_millis")]
    pub retention: Duration,
    /// Rotation: cumulative on-disk size budget in bytes.
    pub size_budget_bytes: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            dir: PathBuf::from(".maestro/checkpoints"),
            prefix: "checkpoint".to_string(),
            compress: true,
            max_count: 20,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            size_budget_bytes: 100 * 1024 * 1024,
        }
    }
}

impl CheckpointConfig {
    /// Set the checkpoint directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Enable or disable compression.
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Set the maximum snapshot count kept by rotation.
    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count;
        self
    }

    /// Set the retention window.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the cumulative size budget.
    pub fn with_size_budget(mut self, bytes: u64) -> Self {
        self.size_budget_bytes = bytes;
        self
    }

    /// Set the periodic snapshot interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Top-level configuration for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum concurrently running tasks.
    pub max_concurrent_tasks: usize,
    /// Per-task dispatch timeout, also the default phase-operation timeout.
    #[serde(with = "duration_millis")]
    pub task_timeout: Duration,
    /// Retry budget for tasks and phases.
    pub max_retries: u32,
    /// Upper bound on scheduler loop iterations.
    pub max_iterations: usize,
    /// Base delay for exponential retry backoff.
    #[serde(with = "duration_millis")]
    pub retry_base_delay: Duration,
    /// Failure handling policy.
    pub error_policy: ErrorPolicy,
    /// Checkpoint settings.
    pub checkpoint: CheckpointConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            task_timeout: Duration::from_secs(300),
            max_retries: 3,
            max_iterations: 1000,
            retry_base_delay: Duration::from_millis(500),
            error_policy: ErrorPolicy::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Set the task concurrency bound.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Set the per-task timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the scheduler iteration bound.
    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }

    /// Set the retry backoff base delay.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Set the error handling policy.
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Set the checkpoint configuration.
    pub fn with_checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Validate invariants the core relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_tasks".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.task_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "task_timeout".into(),
                message: "must be non-zero".into(),
            });
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_iterations".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.checkpoint.enabled && self.checkpoint.interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "checkpoint.interval".into(),
                message: "must be non-zero when checkpointing is enabled".into(),
            });
        }
        if self.checkpoint.enabled && self.checkpoint.max_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "checkpoint.max_count".into(),
                message: "must be at least 1 when checkpointing is enabled".into(),
            });
        }
        Ok(())
    }
}

/// Serde helpers for Duration serialization as milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
