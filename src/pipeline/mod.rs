//! Phase state machine driving the pipeline lifecycle.
//!
//! - `transition` — pure, table-driven transition function over tagged unions
//! - `context` — the run context owned by one machine instance
//! - `machine` — the async driver that executes phase operations and
//!   checkpoints on every phase entry

pub mod context;
pub mod machine;
pub mod transition;

pub use context::RunContext;
pub use machine::{
    MachineHandle, PhaseMachine, PhaseRunner, PipelineReport, PipelineStatus,
};
pub use transition::{
    NextState, PipelineEvent, PipelinePhase, PipelineState, Transition, TransitionAction,
    transition,
};
