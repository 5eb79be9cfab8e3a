//! Pipeline run context.
//!
//! Owned by one state machine instance and mutated only by its transition
//! handling; it is not persisted beyond the checkpoints derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::checkpoint::CheckpointSnapshot;
use crate::pipeline::transition::PipelinePhase;

/// Mutable state accumulated across one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    /// Pipeline id, also the checkpoint grouping key.
    pub pipeline_id: String,
    /// What this run is trying to accomplish.
    pub objective: String,
    /// Phase currently being executed.
    pub current_phase: Option<PipelinePhase>,
    /// Shallow history for pause/resume.
    pub previous_phase: Option<PipelinePhase>,
    /// Progress percentage, 0–100, non-decreasing within a forward run.
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    /// Per-phase results, keyed by phase name.
    #[serde(default)]
    pub results: HashMap<String, serde_json::Value>,
    /// Accumulated error messages.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Checkpoint ids produced so far, oldest first.
    #[serde(default)]
    pub checkpoints: Vec<String>,
    /// Phase retries consumed, bounded by the configured maximum.
    #[serde(default)]
    pub retry_count: u32,
    /// Dry-run marker; produced artifacts are tagged virtual.
    #[serde(default)]
    pub dry_run: bool,
}

impl RunContext {
    /// Create a context for a new run with a generated pipeline id.
    pub fn new(objective: &str) -> Self {
        let pipeline_id = format!("pipe-{}", &Uuid::new_v4().simple().to_string()[..8]);
        Self {
            pipeline_id,
            objective: objective.to_string(),
            current_phase: None,
            previous_phase: None,
            progress: 0,
            started_at: Utc::now(),
            results: HashMap::new(),
            errors: Vec::new(),
            checkpoints: Vec::new(),
            retry_count: 0,
            dry_run: false,
        }
    }

    /// Override the generated pipeline id.
    pub fn with_pipeline_id(mut self, pipeline_id: &str) -> Self {
        self.pipeline_id = pipeline_id.to_string();
        self
    }

    /// Mark this run as a dry run.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Record a phase result.
    pub fn record_result(&mut self, phase: &str, result: serde_json::Value) {
        self.results.insert(phase.to_string(), result);
    }

    /// Record an error message.
    pub fn record_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    /// Raise progress to reflect a completed phase. Progress never moves
    /// backwards within a forward run.
    pub fn advance_progress(&mut self, completed: PipelinePhase) {
        self.progress = self.progress.max(completed.progress_after());
    }

    /// Elapsed wall-clock time since the run started.
    pub fn elapsed(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Build a snapshot of this context. Task buckets are filled by the
    /// scheduler's own periodic snapshots, not at this level.
    pub fn snapshot(&self, status: &str) -> CheckpointSnapshot {
        let phase = self
            .current_phase
            .map(|p| p.name())
            .unwrap_or("idle");
        let mut snapshot = CheckpointSnapshot::new(&self.pipeline_id, phase, status, self.progress)
            .with_context(self.results.clone())
            .with_metrics(self.started_at, self.elapsed());
        if self.dry_run {
            snapshot = snapshot.with_metadata(HashMap::from([(
                "artifacts".to_string(),
                "virtual".to_string(),
            )]));
        }
        snapshot
    }

    /// Restore phase, progress, and results from a checkpoint. The retry
    /// budget starts fresh for the restored position.
    pub fn restore_from(&mut self, snapshot: &CheckpointSnapshot) {
        self.current_phase = PipelinePhase::from_name(&snapshot.state.phase);
        self.progress = snapshot.state.progress;
        self.results = snapshot.state.context.clone();
        self.retry_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_generates_pipeline_id() {
        let ctx = RunContext::new("build the thing");
        assert!(ctx.pipeline_id.starts_with("pipe-"));
        assert_eq!(ctx.progress, 0);
        assert!(ctx.current_phase.is_none());

        let other = RunContext::new("build the thing");
        assert_ne!(ctx.pipeline_id, other.pipeline_id);
    }

    #[test]
    fn progress_is_monotonic() {
        let mut ctx = RunContext::new("x");
        ctx.advance_progress(PipelinePhase::Mapping);
        assert_eq!(ctx.progress, 60);
        // Completing an earlier phase again never lowers progress.
        ctx.advance_progress(PipelinePhase::Initializing);
        assert_eq!(ctx.progress, 60);
        ctx.advance_progress(PipelinePhase::Debriefing);
        assert_eq!(ctx.progress, 100);
    }

    #[test]
    fn snapshot_carries_phase_progress_and_results() {
        let mut ctx = RunContext::new("x").with_pipeline_id("pipe-test");
        ctx.current_phase = Some(PipelinePhase::Mapping);
        ctx.progress = 40;
        ctx.record_result("brainstorming", serde_json::json!({"ideas": 7}));

        let snapshot = ctx.snapshot("running");
        assert_eq!(snapshot.pipeline_id, "pipe-test");
        assert_eq!(snapshot.state.phase, "mapping");
        assert_eq!(snapshot.state.progress, 40);
        assert_eq!(
            snapshot.state.context["brainstorming"],
            serde_json::json!({"ideas": 7})
        );
        assert!(snapshot.metadata.is_none());
    }

    #[test]
    fn dry_run_marks_artifacts_virtual() {
        let mut ctx = RunContext::new("x").with_dry_run(true);
        ctx.current_phase = Some(PipelinePhase::Acting);
        let snapshot = ctx.snapshot("running");
        assert_eq!(
            snapshot.metadata.unwrap().get("artifacts"),
            Some(&"virtual".to_string())
        );
    }

    #[test]
    fn restore_roundtrips_phase_progress_results() {
        let mut ctx = RunContext::new("x").with_pipeline_id("pipe-test");
        ctx.current_phase = Some(PipelinePhase::Acting);
        ctx.progress = 80;
        ctx.retry_count = 2;
        ctx.record_result("mapping", serde_json::json!({"tasks": 3}));
        let snapshot = ctx.snapshot("running");

        let mut restored = RunContext::new("x").with_pipeline_id("pipe-test");
        restored.restore_from(&snapshot);
        assert_eq!(restored.current_phase, Some(PipelinePhase::Acting));
        assert_eq!(restored.progress, 80);
        assert_eq!(
            restored.results["mapping"],
            serde_json::json!({"tasks": 3})
        );
        assert_eq!(restored.retry_count, 0);
    }
}
