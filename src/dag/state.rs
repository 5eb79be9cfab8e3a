//! Execution state reporting for the scheduler.
//!
//! `SchedulerReport` summarizes one `run()` with per-task outcomes;
//! `TaskEvent` is the optional progress stream consumed over an mpsc
//! channel.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::duration_millis;
use crate::task::TaskId;

/// Result of executing a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Task id.
    pub task_id: TaskId,
    /// Whether the task completed successfully.
    pub success: bool,
    /// Execution attempts observed (1 + retries).
    pub attempts: u32,
    /// Output payload if the task succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error message if the task failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration across all attempts.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl TaskOutcome {
    /// Create a successful outcome.
    pub fn success(
        task_id: &str,
        attempts: u32,
        output: serde_json::Value,
        duration: Duration,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: true,
            attempts,
            output: Some(output),
            error: None,
            duration,
        }
    }

    /// Create a failed outcome.
    pub fn failure(task_id: &str, attempts: u32, error: &str, duration: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            attempts,
            output: None,
            error: Some(error.to_string()),
            duration,
        }
    }
}

/// Summary of one scheduler run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerReport {
    /// Tasks admitted to the graph.
    pub total_tasks: usize,
    /// Tasks that completed successfully.
    pub completed: usize,
    /// Tasks that exhausted their retries.
    pub failed: usize,
    /// Tasks skipped because a dependency failed.
    pub skipped: usize,
    /// Tasks abandoned by a cancel.
    pub cancelled: usize,
    /// Total run duration.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Per-task outcomes.
    #[serde(default)]
    pub outcomes: HashMap<TaskId, TaskOutcome>,
}

impl SchedulerReport {
    /// Create an empty report for a graph of the given size.
    pub fn new(total_tasks: usize) -> Self {
        Self {
            total_tasks,
            ..Default::default()
        }
    }

    /// Record a task outcome.
    pub fn add_outcome(&mut self, outcome: TaskOutcome) {
        if outcome.success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.outcomes.insert(outcome.task_id.clone(), outcome);
    }

    /// Record a skipped task.
    pub fn mark_skipped(&mut self, task_id: &str) {
        self.skipped += 1;
        self.outcomes.insert(
            task_id.to_string(),
            TaskOutcome::failure(task_id, 0, "skipped due to dependency failure", Duration::ZERO),
        );
    }

    /// Record a cancelled task.
    pub fn mark_cancelled(&mut self, task_id: &str) {
        self.cancelled += 1;
        self.outcomes.insert(
            task_id.to_string(),
            TaskOutcome::failure(task_id, 0, "cancelled", Duration::ZERO),
        );
    }

    /// Check if every task completed successfully.
    pub fn all_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0 && self.completed == self.total_tasks
    }

    /// Fraction of tasks resolved, as a percentage.
    pub fn completion_percentage(&self) -> f64 {
        if self.total_tasks == 0 {
            return 100.0;
        }
        let resolved = self.completed + self.failed + self.skipped + self.cancelled;
        (resolved as f64 / self.total_tasks as f64) * 100.0
    }
}

/// Events emitted during scheduler execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task was dispatched to a worker.
    Started { task: TaskId, worker: String },
    /// A failed attempt is being retried after a backoff delay.
    Retrying {
        task: TaskId,
        attempt: u32,
        delay_ms: u64,
    },
    /// A task completed successfully.
    Completed { task: TaskId, attempts: u32 },
    /// A task exhausted its retries.
    Failed { task: TaskId, error: String },
    /// Tasks were skipped as failure fallout.
    Skipped { tasks: Vec<TaskId> },
    /// A periodic snapshot was written.
    SnapshotSaved { checkpoint_id: String },
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
