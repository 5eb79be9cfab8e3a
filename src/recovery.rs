//! Error classification and the recovery policy derived from it.
//!
//! `classify` is a deterministic, side-effect-free mapping from an error
//! instance to severity, category, and retryability. It is recomputed each
//! time it is needed and never stored. `decide_recovery` turns a
//! classification into one of five recovery actions; the scheduler applies
//! the action per task and the state machine per phase.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ConfigError;
use crate::errors::{CheckpointError, PipelineError, SchedulerError};

/// Impact of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// What kind of failure this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Expected to clear on its own (network blips, timeouts).
    Transient,
    /// Needs undoing prior work, not a retry of the same step.
    Recoverable,
    /// Will fail the same way every time.
    Fatal,
    /// Nothing is known; default to optimism.
    Unknown,
}

/// Derived classification of one error instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub retryable: bool,
    pub requires_intervention: bool,
}

impl Classification {
    const fn new(
        severity: ErrorSeverity,
        category: ErrorCategory,
        retryable: bool,
        requires_intervention: bool,
    ) -> Self {
        Self {
            severity,
            category,
            retryable,
            requires_intervention,
        }
    }
}

/// Concrete action chosen from a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Rollback,
    Skip,
    Escalate,
    Abort,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Retry => "retry",
            Self::Rollback => "rollback",
            Self::Skip => "skip",
            Self::Escalate => "escalate",
            Self::Abort => "abort",
        };
        f.write_str(name)
    }
}

const TRANSIENT: Classification = Classification::new(
    ErrorSeverity::Medium,
    ErrorCategory::Transient,
    true,
    false,
);
const RESOURCE_EXHAUSTION: Classification =
    Classification::new(ErrorSeverity::High, ErrorCategory::Recoverable, false, true);
const VALIDATION: Classification =
    Classification::new(ErrorSeverity::High, ErrorCategory::Fatal, false, true);
const CONFIGURATION: Classification =
    Classification::new(ErrorSeverity::Critical, ErrorCategory::Fatal, false, true);
const PROTOCOL: Classification =
    Classification::new(ErrorSeverity::High, ErrorCategory::Recoverable, false, false);
const RETRY_EXHAUSTED: Classification =
    Classification::new(ErrorSeverity::High, ErrorCategory::Fatal, false, true);
const UNRECOGNIZED: Classification =
    Classification::new(ErrorSeverity::Medium, ErrorCategory::Unknown, true, false);

/// Classify an error instance.
///
/// Typed errors from this crate are matched first; `std::io::Error` kinds
/// next; finally a conservative probe of the rendered message covers errors
/// crossing the worker boundary as plain `anyhow` context chains.
pub fn classify(error: &anyhow::Error) -> Classification {
    if let Some(e) = error.downcast_ref::<SchedulerError>() {
        return classify_scheduler(e);
    }
    if let Some(e) = error.downcast_ref::<PipelineError>() {
        return classify_pipeline(e);
    }
    if let Some(e) = error.downcast_ref::<CheckpointError>() {
        return classify_checkpoint(e);
    }
    if error.downcast_ref::<ConfigError>().is_some() {
        return CONFIGURATION;
    }
    for cause in error.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return classify_io(io);
        }
    }
    classify_message(&format!("{error:#}"))
}

fn classify_scheduler(error: &SchedulerError) -> Classification {
    match error {
        SchedulerError::TaskTimeout { .. } => TRANSIENT,
        SchedulerError::CycleDetected { .. }
        | SchedulerError::UnknownDependency { .. }
        | SchedulerError::DuplicateTask { .. } => VALIDATION,
        SchedulerError::Deadlock { .. } | SchedulerError::IterationLimitExceeded { .. } => {
            PROTOCOL
        }
        SchedulerError::TaskFailed { .. } => RETRY_EXHAUSTED,
    }
}

fn classify_pipeline(error: &PipelineError) -> Classification {
    match error {
        PipelineError::WaitTimeout { .. } => TRANSIENT,
        PipelineError::InvalidTransition { .. } | PipelineError::NotRunning => PROTOCOL,
        PipelineError::RetryBudgetExceeded { .. } => RETRY_EXHAUSTED,
        // A phase failure wrapper carries no more detail than its message.
        PipelineError::PhaseFailed { message, .. } => classify_message(message),
    }
}

fn classify_checkpoint(error: &CheckpointError) -> Classification {
    match error {
        CheckpointError::WriteFailed { .. } => TRANSIENT,
        CheckpointError::NotFound { .. } | CheckpointError::Corrupt { .. } => VALIDATION,
    }
}

fn classify_io(error: &std::io::Error) -> Classification {
    use std::io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock => TRANSIENT,
        ErrorKind::OutOfMemory | ErrorKind::StorageFull | ErrorKind::QuotaExceeded => {
            RESOURCE_EXHAUSTION
        }
        ErrorKind::InvalidData | ErrorKind::InvalidInput => VALIDATION,
        ErrorKind::PermissionDenied => CONFIGURATION,
        _ => UNRECOGNIZED,
    }
}

fn classify_message(message: &str) -> Classification {
    let msg = message.to_lowercase();
    let contains_any =
        |needles: &[&str]| needles.iter().any(|needle| msg.contains(needle));

    if contains_any(&["timed out", "timeout"]) {
        TRANSIENT
    } else if contains_any(&["connection", "network", "unreachable", "dns", "econnrefused"]) {
        TRANSIENT
    } else if contains_any(&["no space", "disk full", "out of memory", "quota exceeded"]) {
        RESOURCE_EXHAUSTION
    } else if contains_any(&["validation", "schema", "invalid input", "malformed"]) {
        VALIDATION
    } else if contains_any(&["configuration", "misconfigured"]) {
        CONFIGURATION
    } else {
        UNRECOGNIZED
    }
}

/// Choose a recovery action for a classification.
pub fn decide_recovery(classification: &Classification) -> RecoveryAction {
    if classification.severity == ErrorSeverity::Critical {
        RecoveryAction::Abort
    } else if classification.category == ErrorCategory::Fatal {
        RecoveryAction::Escalate
    } else if classification.retryable {
        RecoveryAction::Retry
    } else if classification.category == ErrorCategory::Recoverable {
        RecoveryAction::Rollback
    } else {
        RecoveryAction::Skip
    }
}

/// Classify and decide in one step.
pub fn recovery_for(error: &anyhow::Error) -> RecoveryAction {
    decide_recovery(&classify(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn classify_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> Classification {
        classify(&anyhow::Error::new(err))
    }

    #[test]
    fn timeouts_are_transient_and_retryable() {
        let c = classify_err(SchedulerError::TaskTimeout {
            task_id: "t1".into(),
            timeout: Duration::from_secs(5),
        });
        assert_eq!(c.severity, ErrorSeverity::Medium);
        assert_eq!(c.category, ErrorCategory::Transient);
        assert!(c.retryable);
        assert_eq!(decide_recovery(&c), RecoveryAction::Retry);
    }

    #[test]
    fn network_io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let c = classify(&anyhow::Error::new(io));
        assert_eq!(c.category, ErrorCategory::Transient);
        assert!(c.retryable);
    }

    #[test]
    fn io_error_found_deep_in_context_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let err = anyhow::Error::new(io).context("executing task t3");
        let c = classify(&err);
        assert_eq!(c.category, ErrorCategory::Transient);
    }

    #[test]
    fn resource_exhaustion_rolls_back() {
        let io = std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full");
        let c = classify(&anyhow::Error::new(io));
        assert_eq!(c.severity, ErrorSeverity::High);
        assert_eq!(c.category, ErrorCategory::Recoverable);
        assert!(!c.retryable);
        assert!(c.requires_intervention);
        assert_eq!(decide_recovery(&c), RecoveryAction::Rollback);
    }

    #[test]
    fn validation_failures_escalate() {
        let c = classify_err(SchedulerError::CycleDetected {
            task_id: "t1".into(),
        });
        assert_eq!(c.category, ErrorCategory::Fatal);
        assert!(!c.retryable);
        assert_eq!(decide_recovery(&c), RecoveryAction::Escalate);
    }

    #[test]
    fn configuration_errors_abort() {
        let c = classify_err(ConfigError::InvalidValue {
            field: "max_concurrent_tasks".into(),
            message: "must be at least 1".into(),
        });
        assert_eq!(c.severity, ErrorSeverity::Critical);
        assert_eq!(decide_recovery(&c), RecoveryAction::Abort);
    }

    #[test]
    fn protocol_violations_roll_back() {
        let c = classify_err(PipelineError::NotRunning);
        assert_eq!(c.category, ErrorCategory::Recoverable);
        assert_eq!(decide_recovery(&c), RecoveryAction::Rollback);

        let c = classify_err(SchedulerError::Deadlock { remaining: 3 });
        assert_eq!(decide_recovery(&c), RecoveryAction::Rollback);
    }

    #[test]
    fn retry_budget_exhaustion_is_fatal() {
        let c = classify_err(SchedulerError::TaskFailed {
            task_id: "t1".into(),
            attempts: 4,
            message: "kept failing".into(),
            skipped: vec![],
        });
        assert_eq!(c.category, ErrorCategory::Fatal);
        assert!(!c.retryable);
        assert_eq!(decide_recovery(&c), RecoveryAction::Escalate);
    }

    #[test]
    fn store_write_failures_are_retryable() {
        let c = classify_err(CheckpointError::WriteFailed {
            path: "/tmp/cp.json".into(),
            source: std::io::Error::other("flaky disk"),
        });
        assert!(c.retryable);
        assert_eq!(decide_recovery(&c), RecoveryAction::Retry);
    }

    #[test]
    fn unrecognized_errors_default_to_optimistic_retry() {
        let c = classify(&anyhow::anyhow!("worker produced nonsense"));
        assert_eq!(c.severity, ErrorSeverity::Medium);
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert!(c.retryable);
        assert_eq!(decide_recovery(&c), RecoveryAction::Retry);
    }

    #[test]
    fn message_probe_spots_network_wording() {
        let c = classify(&anyhow::anyhow!("connection reset by peer"));
        assert_eq!(c.category, ErrorCategory::Transient);

        let c = classify(&anyhow::anyhow!("schema validation failed for payload"));
        assert_eq!(c.category, ErrorCategory::Fatal);
    }

    #[test]
    fn classification_is_deterministic() {
        let err = anyhow::anyhow!("request timed out after 30s");
        assert_eq!(classify(&err), classify(&err));
        assert_eq!(recovery_for(&err), RecoveryAction::Retry);
    }

    #[test]
    fn non_retryable_unknown_skips() {
        // Synthetic: Unknown category, not retryable.
        let c = Classification::new(ErrorSeverity::Low, ErrorCategory::Unknown, false, false);
        assert_eq!(decide_recovery(&c), RecoveryAction::Skip);
    }
}
