//! Typed error hierarchy for the maestro orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `SchedulerError` — task graph and dispatch failures
//! - `PipelineError` — phase state machine failures
//! - `CheckpointError` — checkpoint store failures
//!
//! The error classifier in `crate::recovery` downcasts to these types to
//! derive severity, category, and retryability.

use std::time::Duration;
use thiserror::Error;

use crate::pipeline::{PipelineEvent, PipelineState};

/// Errors from the dependency scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Admitting task '{task_id}' would create a dependency cycle")]
    CycleDetected { task_id: String },

    #[error("Task '{task_id}' depends on unknown task '{dependency}'")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("Task '{task_id}' has already been admitted")]
    DuplicateTask { task_id: String },

    #[error("Deadlock: {remaining} unfinished tasks can never become ready")]
    Deadlock { remaining: usize },

    #[error("Task '{task_id}' timed out after {timeout:?}")]
    TaskTimeout { task_id: String, timeout: Duration },

    #[error("Scheduler exceeded {limit} iterations without draining the graph")]
    IterationLimitExceeded { limit: usize },

    #[error("Task '{task_id}' failed after {attempts} attempts: {message}")]
    TaskFailed {
        task_id: String,
        attempts: u32,
        message: String,
        /// Dependent tasks skipped as fallout of this failure.
        skipped: Vec<String>,
    },
}

/// Errors from the phase state machine.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No transition from state {state} on event {event}")]
    InvalidTransition {
        state: PipelineState,
        event: PipelineEvent,
    },

    #[error("Pipeline is not running")]
    NotRunning,

    #[error("Timed out after {timeout:?} waiting for state {target}")]
    WaitTimeout {
        target: PipelineState,
        timeout: Duration,
    },

    #[error("Phase {phase} failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error("Retry budget of {max_retries} exhausted in phase {phase}")]
    RetryBudgetExceeded { phase: String, max_retries: u32 },
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No checkpoint matching '{id}'")]
    NotFound { id: String },

    #[error("Checkpoint '{id}' is corrupt: {message}")]
    Corrupt { id: String, message: String },

    #[error("Failed to write checkpoint at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_detected_carries_task_id() {
        let err = SchedulerError::CycleDetected {
            task_id: "t1".into(),
        };
        match &err {
            SchedulerError::CycleDetected { task_id } => assert_eq!(task_id, "t1"),
            _ => panic!("Expected CycleDetected"),
        }
        assert!(err.to_string().contains("t1"));
    }

    #[test]
    fn unknown_dependency_names_both_tasks() {
        let err = SchedulerError::UnknownDependency {
            task_id: "b".into(),
            dependency: "a".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("'b'"));
        assert!(msg.contains("'a'"));
    }

    #[test]
    fn task_failed_carries_skip_fallout() {
        let err = SchedulerError::TaskFailed {
            task_id: "build".into(),
            attempts: 3,
            message: "compiler crashed".into(),
            skipped: vec!["test".into(), "deploy".into()],
        };
        match &err {
            SchedulerError::TaskFailed {
                attempts, skipped, ..
            } => {
                assert_eq!(*attempts, 3);
                assert_eq!(skipped.len(), 2);
            }
            _ => panic!("Expected TaskFailed"),
        }
    }

    #[test]
    fn invalid_transition_names_state_and_event() {
        let err = PipelineError::InvalidTransition {
            state: PipelineState::Completed,
            event: PipelineEvent::Pause,
        };
        let msg = err.to_string();
        assert!(msg.contains("completed"));
        assert!(msg.contains("pause"));
    }

    #[test]
    fn wait_timeout_is_distinct_from_phase_failure() {
        let err = PipelineError::WaitTimeout {
            target: PipelineState::Completed,
            timeout: Duration::from_secs(5),
        };
        assert!(matches!(err, PipelineError::WaitTimeout { .. }));
        assert!(!matches!(err, PipelineError::PhaseFailed { .. }));
    }

    #[test]
    fn checkpoint_write_failed_preserves_io_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = CheckpointError::WriteFailed {
            path: std::path::PathBuf::from("/tmp/cp.json"),
            source: io_err,
        };
        match &err {
            CheckpointError::WriteFailed { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected WriteFailed"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&SchedulerError::Deadlock { remaining: 2 });
        assert_std_error(&PipelineError::NotRunning);
        assert_std_error(&CheckpointError::NotFound { id: "x".into() });
    }
}
