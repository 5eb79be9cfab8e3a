//! The async state machine driver.
//!
//! `PhaseMachine::run` drives the pipeline from Idle to a terminal state.
//! Entry to every working state writes a checkpoint tagged with the phase,
//! then runs that phase's operation through the `PhaseRunner` seam under the
//! pipeline task timeout. External control (pause/resume/cancel) arrives on
//! an mpsc channel held by the `MachineHandle`; state is observable through
//! a watch channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::PipelineConfig;
use crate::config::duration_millis;
use crate::dag::state::ExecutionTimer;
use crate::errors::{PipelineError, SchedulerError};
use crate::pipeline::context::RunContext;
use crate::pipeline::transition::{
    NextState, PipelineEvent, PipelinePhase, PipelineState, TransitionAction, transition,
};
use crate::recovery::{Classification, classify};

/// One phase's unit of work, supplied by the orchestration layer. The
/// default implementation plans tasks and runs them through the scheduler;
/// tests plug in stubs.
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    /// Execute the operation for one phase and return its result payload.
    async fn run_phase(
        &self,
        phase: PipelinePhase,
        context: &RunContext,
    ) -> anyhow::Result<serde_json::Value>;

    /// Undo side effects before the pipeline rewinds. The default has
    /// nothing to undo.
    async fn rollback(&self, _context: &RunContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// External control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Pause,
    Resume,
    Cancel,
}

/// Point-in-time view of a running pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub phase: Option<String>,
    pub progress: u8,
    pub retry_count: u32,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self {
            state: PipelineState::Idle,
            phase: None,
            progress: 0,
            retry_count: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Final result of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub success: bool,
    pub final_state: PipelineState,
    /// Phase names completed, in order.
    pub completed_phases: Vec<String>,
    pub failing_phase: Option<String>,
    pub failing_task: Option<String>,
    pub error: Option<String>,
    pub classification: Option<Classification>,
    /// Most recent checkpoint id, for diagnosis and resume.
    pub last_checkpoint: Option<String>,
    /// Final run context, reusable for retry/resume.
    pub context: RunContext,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

/// Cloneable handle for controlling and observing a running machine.
#[derive(Clone)]
pub struct MachineHandle {
    control_tx: mpsc::Sender<Control>,
    state_rx: watch::Receiver<PipelineState>,
    status_rx: watch::Receiver<PipelineStatus>,
}

impl MachineHandle {
    /// Request a pause. Takes effect at the next suspension point; the
    /// interrupted phase re-runs in full on resume.
    pub async fn pause(&self) -> Result<(), PipelineError> {
        self.send(Control::Pause).await
    }

    /// Resume a paused pipeline at the phase it was paused from.
    pub async fn resume(&self) -> Result<(), PipelineError> {
        self.send(Control::Resume).await
    }

    /// Cancel the run. No new work starts; running tasks are not
    /// interrupted.
    pub async fn cancel(&self) -> Result<(), PipelineError> {
        self.send(Control::Cancel).await
    }

    async fn send(&self, control: Control) -> Result<(), PipelineError> {
        self.control_tx
            .send(control)
            .await
            .map_err(|_| PipelineError::NotRunning)
    }

    /// Current state.
    pub fn state(&self) -> PipelineState {
        *self.state_rx.borrow()
    }

    /// Current status snapshot.
    pub fn status(&self) -> PipelineStatus {
        self.status_rx.borrow().clone()
    }

    /// Wait until the machine reaches the target state. Fails with
    /// `WaitTimeout` when the optional timeout elapses first, and with
    /// `NotRunning` if the machine finishes without ever reaching it.
    pub async fn wait_for_state(
        &self,
        target: PipelineState,
        timeout: Option<Duration>,
    ) -> Result<(), PipelineError> {
        let mut rx = self.state_rx.clone();
        let wait = async move {
            loop {
                if *rx.borrow_and_update() == target {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(PipelineError::NotRunning);
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| PipelineError::WaitTimeout {
                    target,
                    timeout: limit,
                })?,
            None => wait.await,
        }
    }
}

enum PhaseOutcome {
    Success(serde_json::Value),
    Failure(anyhow::Error),
    Paused,
    Cancelled,
}

/// The phase state machine for one pipeline run.
pub struct PhaseMachine {
    state: PipelineState,
    context: RunContext,
    config: PipelineConfig,
    store: Option<Arc<CheckpointStore>>,
    runner: Arc<dyn PhaseRunner>,
    control_rx: mpsc::Receiver<Control>,
    controls_closed: bool,
    state_tx: watch::Sender<PipelineState>,
    status_tx: watch::Sender<PipelineStatus>,
    rollback_count: u32,
    completed_phases: Vec<String>,
    failing_phase: Option<String>,
    failing_task: Option<String>,
    last_error: Option<String>,
    last_classification: Option<Classification>,
}

impl PhaseMachine {
    /// Create a machine for a fresh run starting at Idle.
    pub fn new(
        config: PipelineConfig,
        runner: Arc<dyn PhaseRunner>,
        store: Option<Arc<CheckpointStore>>,
        context: RunContext,
    ) -> (Self, MachineHandle) {
        Self::with_state(config, runner, store, context, PipelineState::Idle)
    }

    /// Create a machine resuming at the context's current phase, as
    /// reconstructed from a checkpoint.
    pub fn resume_from(
        config: PipelineConfig,
        runner: Arc<dyn PhaseRunner>,
        store: Option<Arc<CheckpointStore>>,
        context: RunContext,
    ) -> (Self, MachineHandle) {
        let state = context
            .current_phase
            .map(PipelineState::from_phase)
            .unwrap_or(PipelineState::Idle);
        Self::with_state(config, runner, store, context, state)
    }

    fn with_state(
        config: PipelineConfig,
        runner: Arc<dyn PhaseRunner>,
        store: Option<Arc<CheckpointStore>>,
        context: RunContext,
        state: PipelineState,
    ) -> (Self, MachineHandle) {
        let (control_tx, control_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(state);
        let (status_tx, status_rx) = watch::channel(PipelineStatus::default());

        let machine = Self {
            state,
            context,
            config,
            store,
            runner,
            control_rx,
            controls_closed: false,
            state_tx,
            status_tx,
            rollback_count: 0,
            completed_phases: Vec::new(),
            failing_phase: None,
            failing_task: None,
            last_error: None,
            last_classification: None,
        };
        let handle = MachineHandle {
            control_tx,
            state_rx,
            status_rx,
        };
        (machine, handle)
    }

    /// Current state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Drive the pipeline to a terminal state and return the final report.
    pub async fn run(mut self) -> PipelineReport {
        let timer = ExecutionTimer::start();

        if self.state == PipelineState::Idle {
            info!(pipeline = %self.context.pipeline_id, objective = %self.context.objective, "starting pipeline");
            self.apply_event(PipelineEvent::Start);
        } else {
            info!(pipeline = %self.context.pipeline_id, state = %self.state, "resuming pipeline");
            self.publish();
        }

        loop {
            match self.state {
                PipelineState::Paused => self.drive_paused().await,
                PipelineState::RollingBack => self.drive_rollback().await,
                PipelineState::Completed => {
                    self.write_checkpoint("completed").await;
                    info!(pipeline = %self.context.pipeline_id, "pipeline completed");
                    break;
                }
                PipelineState::Failed => {
                    error!(
                        pipeline = %self.context.pipeline_id,
                        phase = self.failing_phase.as_deref().unwrap_or("unknown"),
                        "pipeline failed"
                    );
                    break;
                }
                PipelineState::Idle => break,
                working => {
                    let phase = working.phase().expect("working state maps to a phase");
                    self.drive_phase(phase).await;
                }
            }
        }

        PipelineReport {
            success: self.state == PipelineState::Completed,
            final_state: self.state,
            completed_phases: self.completed_phases,
            failing_phase: self.failing_phase,
            failing_task: self.failing_task,
            error: self.last_error,
            classification: self.last_classification,
            last_checkpoint: self.context.checkpoints.last().cloned(),
            duration: timer.elapsed(),
            context: self.context,
        }
    }

    /// Run one working phase: entry checkpoint, the phase operation, then
    /// the resulting event.
    async fn drive_phase(&mut self, phase: PipelinePhase) {
        self.context.current_phase = Some(phase);
        self.publish();

        // Entry checkpoint. A failed write is logged, not fatal: losing one
        // checkpoint is recoverable from the prior one.
        self.write_checkpoint("running").await;

        info!(phase = %phase, attempt = self.context.retry_count + 1, "entering phase");
        match self.execute_phase(phase).await {
            PhaseOutcome::Success(value) => {
                self.context.record_result(phase.name(), value);
                self.context.advance_progress(phase);
                self.context.retry_count = 0;
                self.completed_phases.push(phase.name().to_string());
                self.failing_phase = None;
                self.failing_task = None;
                self.publish();

                let event = if phase.next().is_none() {
                    PipelineEvent::Complete
                } else {
                    PipelineEvent::NextPhase
                };
                self.apply_event(event);
            }
            PhaseOutcome::Failure(error) => {
                let message = format!("{error:#}");
                warn!(phase = %phase, error = %message, "phase operation failed");
                self.context.record_error(&message);
                self.failing_phase = Some(phase.name().to_string());
                if let Some(SchedulerError::TaskFailed { task_id, .. }) =
                    error.downcast_ref::<SchedulerError>()
                {
                    self.failing_task = Some(task_id.clone());
                }
                let classification = classify(&error);
                self.last_error = Some(message);
                self.last_classification = Some(classification);

                if classification.retryable && self.context.retry_count < self.config.max_retries
                {
                    self.apply_event(PipelineEvent::Retry);
                } else {
                    if classification.retryable {
                        let budget = PipelineError::RetryBudgetExceeded {
                            phase: phase.name().to_string(),
                            max_retries: self.config.max_retries,
                        };
                        self.context.record_error(&budget.to_string());
                    }
                    self.apply_event(PipelineEvent::Error);
                }
            }
            PhaseOutcome::Paused => {
                info!(phase = %phase, "pausing pipeline");
                self.apply_event(PipelineEvent::Pause);
                self.write_checkpoint("paused").await;
            }
            PhaseOutcome::Cancelled => {
                warn!(phase = %phase, "cancelling pipeline");
                self.apply_event(PipelineEvent::Cancel);
            }
        }
    }

    /// Run the phase operation under the pipeline task timeout while
    /// listening for control commands.
    async fn execute_phase(&mut self, phase: PipelinePhase) -> PhaseOutcome {
        let runner = self.runner.clone();
        let context = self.context.clone();
        let timeout = self.config.task_timeout;
        let operation =
            async move { tokio::time::timeout(timeout, runner.run_phase(phase, &context)).await };
        tokio::pin!(operation);

        loop {
            tokio::select! {
                result = &mut operation => {
                    return match result {
                        Ok(Ok(value)) => PhaseOutcome::Success(value),
                        Ok(Err(error)) => PhaseOutcome::Failure(error),
                        Err(_) => PhaseOutcome::Failure(anyhow::Error::new(
                            PipelineError::PhaseFailed {
                                phase: phase.name().to_string(),
                                message: format!("phase operation timed out after {timeout:?}"),
                            },
                        )),
                    };
                }
                control = recv_control(&mut self.control_rx, self.controls_closed) => {
                    match control {
                        Some(Control::Pause) => return PhaseOutcome::Paused,
                        Some(Control::Cancel) => return PhaseOutcome::Cancelled,
                        Some(Control::Resume) => {} // not paused, nothing to do
                        None => self.controls_closed = true,
                    }
                }
            }
        }
    }

    /// Wait in Paused for a resume or cancel.
    async fn drive_paused(&mut self) {
        info!(
            pipeline = %self.context.pipeline_id,
            phase = self.context.previous_phase.map(|p| p.name()).unwrap_or("unknown"),
            "pipeline paused"
        );
        loop {
            match self.control_rx.recv().await {
                Some(Control::Resume) => {
                    if self.apply_event(PipelineEvent::Resume) {
                        return;
                    }
                }
                Some(Control::Cancel) => {
                    self.apply_event(PipelineEvent::Cancel);
                    return;
                }
                Some(Control::Pause) => {}
                None => {
                    // Every handle is gone; nothing can ever resume this run.
                    self.controls_closed = true;
                    self.apply_event(PipelineEvent::Cancel);
                    return;
                }
            }
        }
    }

    /// Run the rollback operation and rewind to Mapping when a checkpoint
    /// allows it.
    async fn drive_rollback(&mut self) {
        self.rollback_count += 1;
        if self.rollback_count > self.config.max_retries.max(1) {
            warn!("rollback budget exhausted");
            self.apply_event(PipelineEvent::Error);
            return;
        }

        info!(pipeline = %self.context.pipeline_id, "rolling back");
        match self.runner.rollback(&self.context).await {
            Ok(()) => {
                let restored = match &self.store {
                    Some(store) => store.get_latest(&self.context.pipeline_id).await,
                    None => None,
                };
                match restored {
                    Some(snapshot) => {
                        info!(checkpoint = %snapshot.id, "restoring context from checkpoint");
                        self.context.restore_from(&snapshot);
                        self.publish();
                        self.apply_event(PipelineEvent::Complete);
                    }
                    None => {
                        warn!("no checkpoint available to restore from");
                        self.apply_event(PipelineEvent::Error);
                    }
                }
            }
            Err(error) => {
                let message = format!("rollback failed: {error:#}");
                warn!(error = %message, "rollback operation failed");
                self.context.record_error(&message);
                self.last_error = Some(message);
                self.apply_event(PipelineEvent::Error);
            }
        }
    }

    /// Apply one event through the transition table. Invalid events are
    /// logged and ignored, leaving the state unchanged.
    fn apply_event(&mut self, event: PipelineEvent) -> bool {
        let resolved = match transition(self.state, event) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(state = %self.state, %event, %err, "ignoring invalid event");
                return false;
            }
        };

        let next = match resolved.next {
            NextState::To(state) => state,
            NextState::PreviousPhase => match self.context.previous_phase {
                Some(phase) => PipelineState::from_phase(phase),
                None => {
                    warn!("resume without pause history; failing pipeline");
                    PipelineState::Failed
                }
            },
        };

        for action in resolved.actions {
            self.perform(*action);
        }

        debug!(from = %self.state, to = %next, %event, "state transition");
        self.state = next;
        self.publish();
        true
    }

    /// Synchronous context bookkeeping for a transition. Value-carrying and
    /// async actions (result recording, checkpoint writes, notifications)
    /// happen at the drive sites that own the data.
    fn perform(&mut self, action: TransitionAction) {
        match action {
            TransitionAction::FreezePhase => {
                self.context.previous_phase = self.context.current_phase;
            }
            TransitionAction::RestorePhase => {
                if let Some(phase) = self.context.previous_phase {
                    self.context.current_phase = Some(phase);
                }
            }
            TransitionAction::ClearPreviousPhase => {
                self.context.previous_phase = None;
            }
            TransitionAction::IncrementRetryCounter => {
                self.context.retry_count += 1;
            }
            TransitionAction::ResetRetryCounter => {
                self.context.retry_count = 0;
            }
            TransitionAction::MarkTasksCancelled => {
                self.context.record_error("pipeline cancelled");
            }
            TransitionAction::RecordResult
            | TransitionAction::WriteCheckpoint
            | TransitionAction::WriteFinalCheckpoint
            | TransitionAction::RestoreFromCheckpoint
            | TransitionAction::NotifyCompleted
            | TransitionAction::NotifyFailed => {}
        }
    }

    /// Write a checkpoint for the current context. Failures are logged and
    /// swallowed; the run continues on the prior checkpoint.
    async fn write_checkpoint(&mut self, status: &str) {
        if !self.config.checkpoint.enabled {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };

        match store.save(self.context.snapshot(status)).await {
            Ok(id) => {
                debug!(checkpoint = %id, status, "checkpoint written");
                self.context.checkpoints.push(id);
            }
            Err(err) => warn!(%err, "checkpoint write failed"),
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state);
        self.status_tx.send_replace(PipelineStatus {
            state: self.state,
            phase: self.context.current_phase.map(|p| p.name().to_string()),
            progress: self.context.progress,
            retry_count: self.context.retry_count,
            elapsed: self.context.elapsed(),
        });
    }
}

async fn recv_control(rx: &mut mpsc::Receiver<Control>, closed: bool) -> Option<Control> {
    if closed {
        std::future::pending().await
    } else {
        rx.recv().await
    }
}
