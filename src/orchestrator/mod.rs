//! Thin coordination layer over the state machine and scheduler.
//!
//! One orchestrator owns one pipeline run at a time: it wires the worker
//! pool and planner into a scheduler-backed `PhaseRunner`, spawns the state
//! machine, and exposes run/pause/resume/abort/status plus checkpoint-based
//! retry and resume.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::checkpoint::CheckpointStore;
use crate::config::PipelineConfig;
use crate::dag::scheduler::{SchedulerConfig, TaskScheduler};
use crate::errors::PipelineError;
use crate::pipeline::{
    MachineHandle, PhaseMachine, PhaseRunner, PipelinePhase, PipelineReport, PipelineStatus,
    RunContext,
};
use crate::task::Task;
use crate::worker::Worker;

/// How a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Run without pause points.
    #[default]
    Auto,
    /// Consult the phase gate between phases.
    Semi,
    /// Execute all logic but tag produced artifacts as virtual.
    DryRun,
}

/// Supplies the task set for each phase. The planner is the seam between
/// the orchestration core and whatever decides what work a phase needs.
#[async_trait]
pub trait PhasePlanner: Send + Sync {
    async fn plan(
        &self,
        phase: PipelinePhase,
        context: &RunContext,
    ) -> anyhow::Result<Vec<Task>>;
}

/// Confirmation gate consulted between phases in semi mode.
#[async_trait]
pub trait PhaseGate: Send + Sync {
    async fn approve(&self, phase: PipelinePhase) -> bool;
}

/// The default phase operation: plan tasks for the phase and drain them
/// through a fresh scheduler over the shared worker pool.
pub struct SchedulerPhaseRunner {
    workers: Vec<Arc<dyn Worker>>,
    planner: Arc<dyn PhasePlanner>,
    config: PipelineConfig,
    store: Option<Arc<CheckpointStore>>,
    cancel: CancellationToken,
}

impl SchedulerPhaseRunner {
    /// Create a runner over the given pool and planner.
    pub fn new(
        workers: Vec<Arc<dyn Worker>>,
        planner: Arc<dyn PhasePlanner>,
        config: PipelineConfig,
        store: Option<Arc<CheckpointStore>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workers,
            planner,
            config,
            store,
            cancel,
        }
    }
}

#[async_trait]
impl PhaseRunner for SchedulerPhaseRunner {
    async fn run_phase(
        &self,
        phase: PipelinePhase,
        context: &RunContext,
    ) -> anyhow::Result<serde_json::Value> {
        let tasks = self.planner.plan(phase, context).await?;
        if tasks.is_empty() {
            return Ok(serde_json::json!({ "phase": phase.name(), "tasks": 0 }));
        }

        let mut scheduler = TaskScheduler::new(
            self.workers.clone(),
            SchedulerConfig::from_pipeline(&self.config),
        )
        .with_cancellation(self.cancel.child_token());
        if let Some(store) = &self.store
            && self.config.checkpoint.enabled
        {
            scheduler = scheduler.with_checkpoint_store(
                store.clone(),
                self.config.checkpoint.interval,
                &context.pipeline_id,
                phase.name(),
            );
        }

        for task in tasks {
            scheduler.admit(task)?;
        }
        let report = scheduler.run().await?;
        Ok(serde_json::to_value(report)?)
    }
}

/// Wraps a runner with a confirmation gate (semi mode).
struct GatedRunner {
    inner: Arc<dyn PhaseRunner>,
    gate: Arc<dyn PhaseGate>,
}

#[async_trait]
impl PhaseRunner for GatedRunner {
    async fn run_phase(
        &self,
        phase: PipelinePhase,
        context: &RunContext,
    ) -> anyhow::Result<serde_json::Value> {
        if !self.gate.approve(phase).await {
            anyhow::bail!("phase {} was not approved at the gate", phase.name());
        }
        self.inner.run_phase(phase, context).await
    }

    async fn rollback(&self, context: &RunContext) -> anyhow::Result<()> {
        self.inner.rollback(context).await
    }
}

/// Owns one state machine + one scheduler wiring per pipeline run.
pub struct Orchestrator {
    config: PipelineConfig,
    workers: Vec<Arc<dyn Worker>>,
    planner: Arc<dyn PhasePlanner>,
    gate: Option<Arc<dyn PhaseGate>>,
    store: Option<Arc<CheckpointStore>>,
    cancel: CancellationToken,
    handle: Option<MachineHandle>,
    driver: Option<JoinHandle<PipelineReport>>,
    last_report: Option<PipelineReport>,
}

impl Orchestrator {
    /// Build an orchestrator. Validates the configuration and opens the
    /// checkpoint store when checkpointing is enabled.
    pub fn new(
        config: PipelineConfig,
        workers: Vec<Arc<dyn Worker>>,
        planner: Arc<dyn PhasePlanner>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let store = if config.checkpoint.enabled {
            Some(Arc::new(CheckpointStore::new(config.checkpoint.clone())?))
        } else {
            None
        };

        Ok(Self {
            config,
            workers,
            planner,
            gate: None,
            store,
            cancel: CancellationToken::new(),
            handle: None,
            driver: None,
            last_report: None,
        })
    }

    /// Install a confirmation gate for semi mode.
    pub fn with_gate(mut self, gate: Arc<dyn PhaseGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// The checkpoint store, if checkpointing is enabled.
    pub fn checkpoint_store(&self) -> Option<Arc<CheckpointStore>> {
        self.store.clone()
    }

    /// Handle for the active run, if any.
    pub fn handle(&self) -> Option<MachineHandle> {
        self.handle.clone()
    }

    /// Run a pipeline for the objective and wait for the final report.
    pub async fn run(
        &mut self,
        objective: &str,
        mode: RunMode,
    ) -> anyhow::Result<PipelineReport> {
        self.start_run(objective, mode)?;
        self.wait().await
    }

    /// Start a pipeline without waiting for it. Collect the result later
    /// with `wait`; control it through `pause`/`resume`/`abort`.
    pub fn start_run(&mut self, objective: &str, mode: RunMode) -> Result<(), PipelineError> {
        let context = RunContext::new(objective).with_dry_run(mode == RunMode::DryRun);
        self.start(context, mode, false)
    }

    /// Resume a pipeline from a stored checkpoint: the run context is
    /// rebuilt from the snapshot and execution continues at its phase.
    pub async fn resume_from_checkpoint(
        &mut self,
        checkpoint_id: &str,
        objective: &str,
        mode: RunMode,
    ) -> anyhow::Result<PipelineReport> {
        let store = self
            .store
            .clone()
            .ok_or_else(|| anyhow::anyhow!("checkpointing is disabled"))?;
        let snapshot = store.load(checkpoint_id).await?;

        let mut context = RunContext::new(objective)
            .with_pipeline_id(&snapshot.pipeline_id)
            .with_dry_run(mode == RunMode::DryRun);
        context.restore_from(&snapshot);
        info!(
            checkpoint = %snapshot.id,
            phase = %snapshot.state.phase,
            progress = snapshot.state.progress,
            "resuming from checkpoint"
        );

        self.start(context, mode, true)?;
        self.wait().await
    }

    /// Retry the last failed run from the top with a fresh retry budget.
    pub async fn retry(&mut self) -> anyhow::Result<PipelineReport> {
        let report = self
            .last_report
            .as_ref()
            .ok_or(PipelineError::NotRunning)?;
        if report.success {
            anyhow::bail!("last run completed; nothing to retry");
        }

        let mut context = report.context.clone();
        context.retry_count = 0;
        context.current_phase = None;
        context.previous_phase = None;
        self.start(context, RunMode::Auto, false)?;
        self.wait().await
    }

    fn start(
        &mut self,
        context: RunContext,
        mode: RunMode,
        resume: bool,
    ) -> Result<(), PipelineError> {
        if self.driver.as_ref().is_some_and(|d| !d.is_finished()) {
            let state = self.handle.as_ref().map(|h| h.state()).unwrap_or_default();
            return Err(PipelineError::InvalidTransition {
                state,
                event: crate::pipeline::PipelineEvent::Start,
            });
        }

        self.cancel = CancellationToken::new();
        let base: Arc<dyn PhaseRunner> = Arc::new(SchedulerPhaseRunner::new(
            self.workers.clone(),
            self.planner.clone(),
            self.config.clone(),
            self.store.clone(),
            self.cancel.clone(),
        ));
        let runner: Arc<dyn PhaseRunner> = match (&self.gate, mode) {
            (Some(gate), RunMode::Semi) => Arc::new(GatedRunner {
                inner: base,
                gate: gate.clone(),
            }),
            _ => base,
        };

        let (machine, handle) = if resume {
            PhaseMachine::resume_from(self.config.clone(), runner, self.store.clone(), context)
        } else {
            PhaseMachine::new(self.config.clone(), runner, self.store.clone(), context)
        };
        self.handle = Some(handle);
        self.driver = Some(tokio::spawn(machine.run()));
        Ok(())
    }

    /// Wait for the active run to reach a terminal state.
    pub async fn wait(&mut self) -> anyhow::Result<PipelineReport> {
        let driver = self.driver.take().ok_or(PipelineError::NotRunning)?;
        let report = driver
            .await
            .map_err(|e| anyhow::anyhow!("pipeline driver panicked: {e}"))?;
        self.last_report = Some(report.clone());
        Ok(report)
    }

    /// Pause the active run.
    pub async fn pause(&self) -> Result<(), PipelineError> {
        self.handle
            .as_ref()
            .ok_or(PipelineError::NotRunning)?
            .pause()
            .await
    }

    /// Resume a paused run.
    pub async fn resume(&self) -> Result<(), PipelineError> {
        self.handle
            .as_ref()
            .ok_or(PipelineError::NotRunning)?
            .resume()
            .await
    }

    /// Abort the active run: no new tasks start, the machine transitions to
    /// Failed, and running tasks finish without being interrupted.
    pub async fn abort(&self) -> Result<(), PipelineError> {
        self.cancel.cancel();
        self.handle
            .as_ref()
            .ok_or(PipelineError::NotRunning)?
            .cancel()
            .await
    }

    /// Status of the active or most recent run.
    pub fn status(&self) -> PipelineStatus {
        self.handle
            .as_ref()
            .map(|h| h.status())
            .unwrap_or_default()
    }

    /// Report of the most recently finished run.
    pub fn last_report(&self) -> Option<&PipelineReport> {
        self.last_report.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::snapshot::CheckpointSnapshot;
    use crate::config::CheckpointConfig;
    use crate::pipeline::PipelineState;
    use std::time::Duration;
    use tempfile::TempDir;

    struct EchoWorker {
        id: String,
        capabilities: Vec<String>,
    }

    #[async_trait]
    impl Worker for EchoWorker {
        fn id(&self) -> &str {
            &self.id
        }

        fn capabilities(&self) -> &[String] {
            &self.capabilities
        }

        async fn execute(&self, task: &Task) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({ "task": task.id }))
        }

        fn max_load(&self) -> usize {
            4
        }
    }

    /// One planning task per phase, executed by the echo worker.
    struct OneTaskPlanner;

    #[async_trait]
    impl PhasePlanner for OneTaskPlanner {
        async fn plan(
            &self,
            phase: PipelinePhase,
            _context: &RunContext,
        ) -> anyhow::Result<Vec<Task>> {
            Ok(vec![Task::new(
                &format!("{}-1", phase.name()),
                &format!("{} work", phase.name()),
                "general",
            )])
        }
    }

    struct DenyActing;

    #[async_trait]
    impl PhaseGate for DenyActing {
        async fn approve(&self, phase: PipelinePhase) -> bool {
            phase != PipelinePhase::Acting
        }
    }

    fn workers() -> Vec<Arc<dyn Worker>> {
        vec![Arc::new(EchoWorker {
            id: "w1".into(),
            capabilities: vec!["general".into()],
        })]
    }

    fn config(dir: &TempDir) -> PipelineConfig {
        PipelineConfig::default()
            .with_retry_base_delay(Duration::from_millis(2))
            .with_checkpoint(
                CheckpointConfig::default()
                    .with_dir(dir.path())
                    .with_compress(false)
                    .with_max_count(100),
            )
    }

    #[tokio::test]
    async fn auto_run_completes_and_reports() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator =
            Orchestrator::new(config(&dir), workers(), Arc::new(OneTaskPlanner)).unwrap();

        let report = orchestrator.run("ship the feature", RunMode::Auto).await.unwrap();
        assert!(report.success);
        assert_eq!(report.completed_phases.len(), 5);
        assert!(report.last_checkpoint.is_some());
        assert_eq!(orchestrator.status().state, PipelineState::Completed);

        // Each phase result embeds its scheduler report.
        let acting = &report.context.results["acting"];
        assert_eq!(acting["completed"], 1);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_construction() {
        let dir = TempDir::new().unwrap();
        let bad = config(&dir).with_max_concurrent_tasks(0);
        assert!(Orchestrator::new(bad, workers(), Arc::new(OneTaskPlanner)).is_err());
    }

    #[tokio::test]
    async fn semi_mode_gate_denial_fails_the_phase() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator =
            Orchestrator::new(config(&dir).with_max_retries(0), workers(), Arc::new(OneTaskPlanner))
                .unwrap()
                .with_gate(Arc::new(DenyActing));

        let report = orchestrator.run("gated", RunMode::Semi).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.failing_phase.as_deref(), Some("acting"));
        assert!(report.error.unwrap().contains("not approved"));
    }

    #[tokio::test]
    async fn dry_run_tags_artifacts_virtual() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator =
            Orchestrator::new(config(&dir), workers(), Arc::new(OneTaskPlanner)).unwrap();

        let report = orchestrator.run("rehearsal", RunMode::DryRun).await.unwrap();
        assert!(report.success);

        let store = orchestrator.checkpoint_store().unwrap();
        let latest = store.load(report.last_checkpoint.as_ref().unwrap()).await.unwrap();
        assert_eq!(
            latest.metadata.unwrap().get("artifacts"),
            Some(&"virtual".to_string())
        );
    }

    #[tokio::test]
    async fn resume_from_checkpoint_restores_phase_and_progress() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator =
            Orchestrator::new(config(&dir), workers(), Arc::new(OneTaskPlanner)).unwrap();
        let store = orchestrator.checkpoint_store().unwrap();

        // A crash left the pipeline checkpointed at acting, 60%.
        let snapshot = CheckpointSnapshot::new("pipe-crashed", "acting", "running", 60);
        let id = store.save(snapshot).await.unwrap();

        let report = orchestrator
            .resume_from_checkpoint(&id, "finish the job", RunMode::Auto)
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.context.pipeline_id, "pipe-crashed");
        // Only acting and debriefing ran.
        assert_eq!(report.completed_phases, vec!["acting", "debriefing"]);
        assert_eq!(report.context.progress, 100);
    }

    #[tokio::test]
    async fn retry_requires_a_failed_run() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator =
            Orchestrator::new(config(&dir), workers(), Arc::new(OneTaskPlanner)).unwrap();

        orchestrator.run("fine", RunMode::Auto).await.unwrap();
        assert!(orchestrator.retry().await.is_err());
    }

    #[tokio::test]
    async fn pause_without_active_run_is_not_running() {
        let dir = TempDir::new().unwrap();
        let orchestrator =
            Orchestrator::new(config(&dir), workers(), Arc::new(OneTaskPlanner)).unwrap();
        assert!(matches!(
            orchestrator.pause().await,
            Err(PipelineError::NotRunning)
        ));
    }
}
