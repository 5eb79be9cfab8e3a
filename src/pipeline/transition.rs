//! States, events, and the table-driven transition function.
//!
//! The machine's control flow is a pure function `(state, event) ->
//! (next state, actions)` over tagged unions, so every edge of the lifecycle
//! is unit-testable without running phase operations.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::PipelineError;

/// The ordered working phases of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Initializing,
    Brainstorming,
    Mapping,
    Acting,
    Debriefing,
}

impl PipelinePhase {
    /// All phases in execution order.
    pub const ALL: [PipelinePhase; 5] = [
        Self::Initializing,
        Self::Brainstorming,
        Self::Mapping,
        Self::Acting,
        Self::Debriefing,
    ];

    /// Zero-based position in the phase sequence.
    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|p| p == self).unwrap_or(0)
    }

    /// The phase after this one, or `None` for the last.
    pub fn next(&self) -> Option<PipelinePhase> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Stable phase name used in checkpoints and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Brainstorming => "brainstorming",
            Self::Mapping => "mapping",
            Self::Acting => "acting",
            Self::Debriefing => "debriefing",
        }
    }

    /// Parse a phase from its stable name.
    pub fn from_name(name: &str) -> Option<PipelinePhase> {
        Self::ALL.iter().find(|p| p.name() == name).copied()
    }

    /// Pipeline progress percentage once this phase has completed.
    pub fn progress_after(&self) -> u8 {
        (((self.index() + 1) * 100) / Self::ALL.len()) as u8
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle states of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Idle,
    Initializing,
    Brainstorming,
    Mapping,
    Acting,
    Debriefing,
    /// Frozen by a pause; resume restores the exact phase paused from.
    Paused,
    RollingBack,
    Completed,
    Failed,
}

impl PipelineState {
    /// Check if this is a working state (one of the five phases).
    pub fn is_working(&self) -> bool {
        self.phase().is_some()
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The working phase this state corresponds to, if any.
    pub fn phase(&self) -> Option<PipelinePhase> {
        match self {
            Self::Initializing => Some(PipelinePhase::Initializing),
            Self::Brainstorming => Some(PipelinePhase::Brainstorming),
            Self::Mapping => Some(PipelinePhase::Mapping),
            Self::Acting => Some(PipelinePhase::Acting),
            Self::Debriefing => Some(PipelinePhase::Debriefing),
            _ => None,
        }
    }

    /// The working state for a given phase.
    pub fn from_phase(phase: PipelinePhase) -> PipelineState {
        match phase {
            PipelinePhase::Initializing => Self::Initializing,
            PipelinePhase::Brainstorming => Self::Brainstorming,
            PipelinePhase::Mapping => Self::Mapping,
            PipelinePhase::Acting => Self::Acting,
            PipelinePhase::Debriefing => Self::Debriefing,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Brainstorming => "brainstorming",
            Self::Mapping => "mapping",
            Self::Acting => "acting",
            Self::Debriefing => "debriefing",
            Self::Paused => "paused",
            Self::RollingBack => "rolling_back",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Events accepted by the transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEvent {
    Start,
    NextPhase,
    Pause,
    Resume,
    Complete,
    Error,
    Retry,
    Rollback,
    Skip,
    Cancel,
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::NextPhase => "next_phase",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Retry => "retry",
            Self::Rollback => "rollback",
            Self::Skip => "skip",
            Self::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// Target of a transition. `PreviousPhase` is resolved by the driver from the
/// run context's shallow history (set when the pipeline was paused).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    To(PipelineState),
    PreviousPhase,
}

/// Bookkeeping the driver performs alongside a state change. Entry behavior
/// of working states (checkpoint, then run the phase operation) is uniform
/// and implicit; these cover the edges that differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionAction {
    RecordResult,
    WriteCheckpoint,
    WriteFinalCheckpoint,
    FreezePhase,
    RestorePhase,
    ClearPreviousPhase,
    IncrementRetryCounter,
    ResetRetryCounter,
    RestoreFromCheckpoint,
    MarkTasksCancelled,
    NotifyCompleted,
    NotifyFailed,
}

/// One resolved transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: NextState,
    pub actions: &'static [TransitionAction],
}

impl Transition {
    const fn to(state: PipelineState, actions: &'static [TransitionAction]) -> Self {
        Self {
            next: NextState::To(state),
            actions,
        }
    }
}

/// The transition table. Unknown (state, event) pairs fail with
/// `InvalidTransition` and leave the machine unchanged.
pub fn transition(
    state: PipelineState,
    event: PipelineEvent,
) -> Result<Transition, PipelineError> {
    use PipelineEvent as E;
    use PipelineState as S;
    use TransitionAction as A;

    let resolved = match (state, event) {
        (S::Idle, E::Start) => Transition::to(S::Initializing, &[]),

        // Advancing through the working phases.
        (S::Initializing, E::NextPhase) => {
            Transition::to(S::Brainstorming, &[A::RecordResult])
        }
        (S::Brainstorming, E::NextPhase) => Transition::to(S::Mapping, &[A::RecordResult]),
        (S::Mapping, E::NextPhase) => Transition::to(S::Acting, &[A::RecordResult]),
        (S::Acting, E::NextPhase) => Transition::to(S::Debriefing, &[A::RecordResult]),
        (S::Debriefing, E::Complete) => Transition::to(
            S::Completed,
            &[A::RecordResult, A::WriteFinalCheckpoint, A::NotifyCompleted],
        ),

        // Skipping a phase advances without recording a result.
        (S::Initializing, E::Skip) => Transition::to(S::Brainstorming, &[]),
        (S::Brainstorming, E::Skip) => Transition::to(S::Mapping, &[]),
        (S::Mapping, E::Skip) => Transition::to(S::Acting, &[]),
        (S::Acting, E::Skip) => Transition::to(S::Debriefing, &[]),
        (S::Debriefing, E::Skip) => {
            Transition::to(S::Completed, &[A::WriteFinalCheckpoint, A::NotifyCompleted])
        }

        // Pause from any working state; resume restores shallow history.
        (s, E::Pause) if s.is_working() => {
            Transition::to(S::Paused, &[A::FreezePhase, A::WriteCheckpoint])
        }
        (S::Paused, E::Resume) => Transition {
            next: NextState::PreviousPhase,
            actions: &[A::RestorePhase, A::ClearPreviousPhase],
        },

        // Bounded retry-in-place.
        (s, E::Retry) if s.is_working() => Transition {
            next: NextState::To(s),
            actions: &[A::IncrementRetryCounter],
        },

        // Exhausted phase failure: late-phase failures roll back, the rest
        // fail the pipeline.
        (S::Acting, E::Error) => Transition::to(S::RollingBack, &[]),
        (s, E::Error) if s.is_working() => Transition::to(S::Failed, &[A::NotifyFailed]),
        (s, E::Rollback) if s.is_working() => Transition::to(S::RollingBack, &[]),

        // Rollback rewinds to Mapping to re-derive late-phase work.
        (S::RollingBack, E::Complete) => {
            Transition::to(S::Mapping, &[A::RestoreFromCheckpoint])
        }
        (S::RollingBack, E::Error) => Transition::to(S::Failed, &[A::NotifyFailed]),

        // Pipeline-level cancel forces failure without interrupting tasks.
        (s, E::Cancel) if s.is_working() || s == S::Paused || s == S::RollingBack => {
            Transition::to(S::Failed, &[A::MarkTasksCancelled, A::NotifyFailed])
        }

        // A failed pipeline may be retried from the top.
        (S::Failed, E::Retry) => Transition::to(S::Initializing, &[A::ResetRetryCounter]),

        (state, event) => return Err(PipelineError::InvalidTransition { state, event }),
    };

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_order_and_progress() {
        assert_eq!(PipelinePhase::Initializing.index(), 0);
        assert_eq!(PipelinePhase::Debriefing.index(), 4);
        assert_eq!(
            PipelinePhase::Initializing.next(),
            Some(PipelinePhase::Brainstorming)
        );
        assert_eq!(PipelinePhase::Debriefing.next(), None);

        assert_eq!(PipelinePhase::Initializing.progress_after(), 20);
        assert_eq!(PipelinePhase::Mapping.progress_after(), 60);
        assert_eq!(PipelinePhase::Debriefing.progress_after(), 100);
    }

    #[test]
    fn phase_names_roundtrip() {
        for phase in PipelinePhase::ALL {
            assert_eq!(PipelinePhase::from_name(phase.name()), Some(phase));
        }
        assert_eq!(PipelinePhase::from_name("bogus"), None);
    }

    #[test]
    fn state_phase_mapping() {
        for phase in PipelinePhase::ALL {
            let state = PipelineState::from_phase(phase);
            assert!(state.is_working());
            assert_eq!(state.phase(), Some(phase));
        }
        assert!(PipelineState::Completed.is_terminal());
        assert!(PipelineState::Failed.is_terminal());
        assert!(!PipelineState::Paused.is_terminal());
        assert!(PipelineState::Paused.phase().is_none());
    }

    #[test]
    fn start_enters_initializing() {
        let t = transition(PipelineState::Idle, PipelineEvent::Start).unwrap();
        assert_eq!(t.next, NextState::To(PipelineState::Initializing));
    }

    #[test]
    fn next_phase_walks_the_sequence() {
        let mut state = PipelineState::Initializing;
        let expected = [
            PipelineState::Brainstorming,
            PipelineState::Mapping,
            PipelineState::Acting,
            PipelineState::Debriefing,
        ];
        for next in expected {
            let t = transition(state, PipelineEvent::NextPhase).unwrap();
            assert_eq!(t.next, NextState::To(next));
            assert!(t.actions.contains(&TransitionAction::RecordResult));
            state = next;
        }

        // Debriefing finishes with Complete, not NextPhase.
        assert!(transition(PipelineState::Debriefing, PipelineEvent::NextPhase).is_err());
        let t = transition(PipelineState::Debriefing, PipelineEvent::Complete).unwrap();
        assert_eq!(t.next, NextState::To(PipelineState::Completed));
        assert!(t.actions.contains(&TransitionAction::NotifyCompleted));
    }

    #[test]
    fn pause_accepted_from_every_working_state() {
        for phase in PipelinePhase::ALL {
            let state = PipelineState::from_phase(phase);
            let t = transition(state, PipelineEvent::Pause).unwrap();
            assert_eq!(t.next, NextState::To(PipelineState::Paused));
            assert!(t.actions.contains(&TransitionAction::FreezePhase));
        }
    }

    #[test]
    fn resume_restores_previous_phase() {
        let t = transition(PipelineState::Paused, PipelineEvent::Resume).unwrap();
        assert_eq!(t.next, NextState::PreviousPhase);
        assert!(t.actions.contains(&TransitionAction::ClearPreviousPhase));
    }

    #[test]
    fn retry_re_enters_the_same_state() {
        let t = transition(PipelineState::Mapping, PipelineEvent::Retry).unwrap();
        assert_eq!(t.next, NextState::To(PipelineState::Mapping));
        assert!(t.actions.contains(&TransitionAction::IncrementRetryCounter));
    }

    #[test]
    fn acting_error_rolls_back_others_fail() {
        let t = transition(PipelineState::Acting, PipelineEvent::Error).unwrap();
        assert_eq!(t.next, NextState::To(PipelineState::RollingBack));

        for state in [
            PipelineState::Initializing,
            PipelineState::Brainstorming,
            PipelineState::Mapping,
            PipelineState::Debriefing,
        ] {
            let t = transition(state, PipelineEvent::Error).unwrap();
            assert_eq!(t.next, NextState::To(PipelineState::Failed));
        }
    }

    #[test]
    fn rollback_success_rewinds_to_mapping() {
        let t = transition(PipelineState::RollingBack, PipelineEvent::Complete).unwrap();
        assert_eq!(t.next, NextState::To(PipelineState::Mapping));
        assert!(t.actions.contains(&TransitionAction::RestoreFromCheckpoint));

        let t = transition(PipelineState::RollingBack, PipelineEvent::Error).unwrap();
        assert_eq!(t.next, NextState::To(PipelineState::Failed));
    }

    #[test]
    fn failed_accepts_retry_back_to_initializing() {
        let t = transition(PipelineState::Failed, PipelineEvent::Retry).unwrap();
        assert_eq!(t.next, NextState::To(PipelineState::Initializing));
        assert!(t.actions.contains(&TransitionAction::ResetRetryCounter));
    }

    #[test]
    fn terminal_states_reject_lifecycle_events() {
        for event in [
            PipelineEvent::Start,
            PipelineEvent::NextPhase,
            PipelineEvent::Pause,
            PipelineEvent::Cancel,
        ] {
            assert!(transition(PipelineState::Completed, event).is_err());
        }
        // Failed only accepts Retry.
        assert!(transition(PipelineState::Failed, PipelineEvent::Pause).is_err());
        assert!(transition(PipelineState::Failed, PipelineEvent::Retry).is_ok());
    }

    #[test]
    fn idle_rejects_everything_but_start() {
        for event in [
            PipelineEvent::NextPhase,
            PipelineEvent::Pause,
            PipelineEvent::Resume,
            PipelineEvent::Error,
        ] {
            let err = transition(PipelineState::Idle, event).unwrap_err();
            assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        }
    }

    #[test]
    fn cancel_forces_failure_from_working_paused_and_rollback() {
        for state in [
            PipelineState::Acting,
            PipelineState::Paused,
            PipelineState::RollingBack,
        ] {
            let t = transition(state, PipelineEvent::Cancel).unwrap();
            assert_eq!(t.next, NextState::To(PipelineState::Failed));
            assert!(t.actions.contains(&TransitionAction::MarkTasksCancelled));
        }
    }
}
