//! Checkpoint snapshot model.
//!
//! A snapshot is immutable once written: it is superseded by newer snapshots
//! or deleted by rotation, never mutated. The serde shape below is the wire
//! format; field names are part of the on-disk contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::duration_millis;
use crate::task::TaskId;

/// Snapshot schema version.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Pipeline state captured in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotState {
    /// Phase label; always a phase that has been entered.
    pub phase: String,
    /// Coarse run status ("running", "paused", "completed", ...).
    pub status: String,
    /// Pipeline progress, 0–100.
    pub progress: u8,
    /// Free-form context map; carries the per-phase results.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

/// Task ids bucketed by coarse status.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskBuckets {
    #[serde(default)]
    pub completed: Vec<TaskId>,
    #[serde(default)]
    pub in_progress: Vec<TaskId>,
    #[serde(default)]
    pub pending: Vec<TaskId>,
    #[serde(default)]
    pub failed: Vec<TaskId>,
}

/// Run timing captured in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetrics {
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// Elapsed run duration at snapshot time.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

/// One immutable pipeline snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSnapshot {
    /// Store-assigned id; empty until `save`.
    #[serde(default)]
    pub id: String,
    pub pipeline_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub state: SnapshotState,
    #[serde(default)]
    pub tasks: TaskBuckets,
    #[serde(default)]
    pub artifacts: HashMap<String, serde_json::Value>,
    pub metrics: SnapshotMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl CheckpointSnapshot {
    /// Create a snapshot for the given pipeline at the given phase.
    pub fn new(pipeline_id: &str, phase: &str, status: &str, progress: u8) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            pipeline_id: pipeline_id.to_string(),
            timestamp: now,
            version: SCHEMA_VERSION.to_string(),
            state: SnapshotState {
                phase: phase.to_string(),
                status: status.to_string(),
                progress,
                context: HashMap::new(),
            },
            tasks: TaskBuckets::default(),
            artifacts: HashMap::new(),
            metrics: SnapshotMetrics {
                start_time: now,
                duration: Duration::ZERO,
            },
            metadata: None,
        }
    }

    /// Attach the free-form context map.
    pub fn with_context(mut self, context: HashMap<String, serde_json::Value>) -> Self {
        self.state.context = context;
        self
    }

    /// Attach task buckets.
    pub fn with_tasks(mut self, tasks: TaskBuckets) -> Self {
        self.tasks = tasks;
        self
    }

    /// Attach the artifact map.
    pub fn with_artifacts(mut self, artifacts: HashMap<String, serde_json::Value>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Attach run metrics.
    pub fn with_metrics(mut self, start_time: DateTime<Utc>, duration: Duration) -> Self {
        self.metrics = SnapshotMetrics {
            start_time,
            duration,
        };
        self
    }

    /// Attach the optional metadata map.
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Check that required fields are present and well-typed.
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_empty()
            && !self.pipeline_id.is_empty()
            && !self.version.is_empty()
            && !self.state.phase.is_empty()
            && self.state.progress <= 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_field_names() {
        let snapshot = CheckpointSnapshot::new("pipe-1", "mapping", "running", 40)
            .with_tasks(TaskBuckets {
                completed: vec!["a".into()],
                in_progress: vec!["b".into()],
                pending: vec![],
                failed: vec![],
            });

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["pipelineId"], "pipe-1");
        assert_eq!(json["version"], SCHEMA_VERSION);
        assert_eq!(json["state"]["phase"], "mapping");
        assert_eq!(json["state"]["progress"], 40);
        assert_eq!(json["tasks"]["inProgress"][0], "b");
        assert!(json["metrics"]["startTime"].is_string());
        assert!(json["metrics"]["duration"].is_number());
        // Absent metadata is omitted entirely.
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn deserialization_reconstructs_dates() {
        let snapshot = CheckpointSnapshot::new("pipe-1", "acting", "running", 80);
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: CheckpointSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.timestamp, snapshot.timestamp);
        assert_eq!(parsed.metrics.start_time, snapshot.metrics.start_time);
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn well_formedness_requires_id_and_phase() {
        let mut snapshot = CheckpointSnapshot::new("pipe-1", "mapping", "running", 40);
        // No id until saved.
        assert!(!snapshot.is_well_formed());

        snapshot.id = "checkpoint_x".into();
        assert!(snapshot.is_well_formed());

        snapshot.state.progress = 101;
        assert!(!snapshot.is_well_formed());
    }

    #[test]
    fn builders_attach_optional_sections() {
        let snapshot = CheckpointSnapshot::new("pipe-1", "debriefing", "completed", 100)
            .with_context(HashMap::from([(
                "mapping".to_string(),
                serde_json::json!({"tasks": 4}),
            )]))
            .with_artifacts(HashMap::from([(
                "report".to_string(),
                serde_json::json!("summary.md"),
            )]))
            .with_metadata(HashMap::from([("mode".to_string(), "auto".to_string())]));

        assert_eq!(snapshot.state.context.len(), 1);
        assert_eq!(snapshot.artifacts.len(), 1);
        assert_eq!(
            snapshot.metadata.as_ref().unwrap().get("mode"),
            Some(&"auto".to_string())
        );
    }
}
