//! Task model for the dependency scheduler.
//!
//! A task is owned exclusively by one scheduler instance for the lifetime of
//! a pipeline run. Status moves Pending → Queued → Running → terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique task identifier within one pipeline run.
pub type TaskId = String;

/// Priority tiers, highest first. Ready tasks are dispatched strictly in
/// tier order; `Ord` follows declaration order so `Critical < Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl TaskPriority {
    /// Drop one tier, flooring at `Low`. Applied when a ready task has no
    /// available worker so it does not block the head of the queue.
    pub fn demote(self) -> Self {
        match self {
            Self::Critical => Self::High,
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Admitted, dependencies not yet satisfied.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting in the ready queue.
    Queued,
    /// Dispatched to a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Retries exhausted.
    Failed,
    /// Never ran because a dependency failed.
    Skipped,
    /// Abandoned by a pipeline-level cancel.
    Cancelled,
}

impl TaskStatus {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Check if the task completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// A schedulable unit of work executed by a capability-matched worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique id within the run.
    pub id: TaskId,
    /// Human-readable name.
    pub name: String,
    /// Capability tag used for worker selection.
    pub task_type: String,
    /// Priority tier.
    pub priority: TaskPriority,
    /// Current status.
    pub status: TaskStatus,
    /// Ids of tasks that must complete before this one starts.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Input payload handed to the worker.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Output payload, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Preferred worker id, honored when that worker is idle and capable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,
    /// Retries consumed so far.
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a task with the given id, name, and capability tag.
    pub fn new(id: &str, name: &str, task_type: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            task_type: task_type.to_string(),
            priority: TaskPriority::default(),
            status: TaskStatus::default(),
            depends_on: Vec::new(),
            payload: serde_json::Value::Null,
            output: None,
            assigned_worker: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the priority tier.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Declare dependencies by task id.
    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Set the input payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Pin the task to a preferred worker.
    pub fn with_assigned_worker(mut self, worker_id: &str) -> Self {
        self.assigned_worker = Some(worker_id.to_string());
        self
    }

    /// Mark the task queued for dispatch.
    pub(crate) fn mark_queued(&mut self) {
        self.status = TaskStatus::Queued;
    }

    /// Mark the task running and stamp the start time.
    pub(crate) fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task completed with its output.
    pub(crate) fn mark_completed(&mut self, output: serde_json::Value, retries: u32) {
        self.status = TaskStatus::Completed;
        self.output = Some(output);
        self.retry_count = retries;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task failed after exhausting retries.
    pub(crate) fn mark_failed(&mut self, retries: u32) {
        self.status = TaskStatus::Failed;
        self.retry_count = retries;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task skipped due to dependency failure.
    pub(crate) fn mark_skipped(&mut self) {
        self.status = TaskStatus::Skipped;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task cancelled.
    pub(crate) fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }
}
