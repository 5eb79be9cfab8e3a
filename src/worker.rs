//! Worker capability interface consumed by the scheduler.
//!
//! Workers are external collaborators (architect, developer, tester,
//! debugger, ...). The scheduler only sees this contract and never inspects
//! worker internals.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Advertised worker availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    Error,
    Offline,
}

impl WorkerStatus {
    /// Check if the worker can accept new work at all.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}

/// Abstraction over task execution, selected by capability.
///
/// Real implementations wrap an agent process or API call; tests use plain
/// structs with scripted behavior. `execute` failures cross this boundary as
/// `anyhow::Error` and are interpreted by the recovery policy.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Stable worker id, referenced by `Task::assigned_worker`.
    fn id(&self) -> &str;

    /// Capability tags this worker can execute.
    fn capabilities(&self) -> &[String];

    /// Advertised availability. Offline and errored workers are never
    /// selected.
    fn status(&self) -> WorkerStatus {
        WorkerStatus::Idle
    }

    /// Check whether this worker can execute the given task.
    fn can_handle(&self, task: &Task) -> bool {
        self.capabilities().iter().any(|c| c == &task.task_type)
    }

    /// Execute the task and return its output payload.
    async fn execute(&self, task: &Task) -> anyhow::Result<serde_json::Value>;

    /// Number of tasks this worker reports as currently executing.
    fn current_load(&self) -> usize {
        0
    }

    /// Per-worker concurrency cap.
    fn max_load(&self) -> usize {
        1
    }
}
