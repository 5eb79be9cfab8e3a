//! Multi-phase development pipeline orchestration engine.
//!
//! The engine is four tightly coupled pieces: a dependency-aware task
//! scheduler (`dag`), a checkpointed phase state machine (`pipeline`), a
//! durable checkpoint store (`checkpoint`), and the error classification /
//! recovery policy (`recovery`) that ties failures in the first two to
//! concrete recovery actions. The `orchestrator` module is the thin layer
//! that wires one state machine and one scheduler per run.

pub mod checkpoint;
pub mod config;
pub mod dag;
pub mod errors;
pub mod orchestrator;
pub mod pipeline;
pub mod recovery;
pub mod task;
pub mod worker;

pub use checkpoint::{CheckpointMetadata, CheckpointSnapshot, CheckpointStore};
pub use config::{CheckpointConfig, ErrorPolicy, PipelineConfig};
pub use dag::{SchedulerConfig, SchedulerReport, TaskScheduler};
pub use errors::{CheckpointError, PipelineError, SchedulerError};
pub use orchestrator::{Orchestrator, PhaseGate, PhasePlanner, RunMode, SchedulerPhaseRunner};
pub use pipeline::{
    MachineHandle, PhaseMachine, PhaseRunner, PipelineEvent, PipelinePhase, PipelineReport,
    PipelineState, PipelineStatus, RunContext,
};
pub use recovery::{
    Classification, ErrorCategory, ErrorSeverity, RecoveryAction, classify, decide_recovery,
    recovery_for,
};
pub use task::{Task, TaskId, TaskPriority, TaskStatus};
pub use worker::{Worker, WorkerStatus};
