//! Durable checkpoint persistence.
//!
//! - `snapshot` — the immutable snapshot model and its on-disk JSON shape
//! - `store` — file-backed store with optional gzip compression and
//!   retention-based rotation

pub mod snapshot;
pub mod store;

pub use snapshot::{
    CheckpointSnapshot, SCHEMA_VERSION, SnapshotMetrics, SnapshotState, TaskBuckets,
};
pub use store::{CheckpointMetadata, CheckpointStore};
