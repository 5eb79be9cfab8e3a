//! File-backed checkpoint store.
//!
//! Every save produces a uniquely named file, so concurrent saves from the
//! state machine and the scheduler never contend on a shared record. Writes
//! go through a temp file and an atomic rename; a partially written snapshot
//! is never visible to `load`. File naming doubles as the lookup index:
//! `{prefix}_{timestamp}_{pipelineId}_{suffix}.json[.gz]`.

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::checkpoint::snapshot::CheckpointSnapshot;
use crate::config::CheckpointConfig;
use crate::errors::CheckpointError;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Listing entry: everything knowable without loading the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub id: String,
    pub pipeline_id: String,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
    pub compressed: bool,
}

/// Durable key-value persistence of pipeline snapshots.
pub struct CheckpointStore {
    config: CheckpointConfig,
    prefix: String,
}

impl CheckpointStore {
    /// Create a store over the configured directory, creating it if needed.
    ///
    /// The underscore is the file-name field separator, so it is stripped
    /// from the prefix and pipeline ids when building names.
    pub fn new(config: CheckpointConfig) -> Result<Self, CheckpointError> {
        std::fs::create_dir_all(&config.dir).map_err(|source| CheckpointError::WriteFailed {
            path: config.dir.clone(),
            source,
        })?;
        let prefix = sanitize(&config.prefix);
        Ok(Self { config, prefix })
    }

    /// Serialize, optionally compress, and durably write a snapshot.
    /// Returns the assigned id. Rotation runs afterwards and its failures
    /// are logged, never raised.
    pub async fn save(&self, mut snapshot: CheckpointSnapshot) -> Result<String, CheckpointError> {
        let id = self.next_id(&snapshot.pipeline_id);
        snapshot.id = id.clone();

        let json = serde_json::to_vec_pretty(&snapshot).map_err(|e| {
            CheckpointError::WriteFailed {
                path: self.config.dir.clone(),
                source: std::io::Error::other(e),
            }
        })?;
        let (body, extension) = if self.config.compress {
            let compressed = gzip(&json).map_err(|source| CheckpointError::WriteFailed {
                path: self.config.dir.clone(),
                source,
            })?;
            (compressed, "json.gz")
        } else {
            (json, "json")
        };

        let file_name = format!("{id}.{extension}");
        let path = self.config.dir.join(&file_name);
        let tmp_path = self.config.dir.join(format!(".{file_name}.tmp"));

        tokio::fs::write(&tmp_path, &body)
            .await
            .map_err(|source| CheckpointError::WriteFailed {
                path: tmp_path.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|source| CheckpointError::WriteFailed {
                path: path.clone(),
                source,
            })?;

        debug!(checkpoint = %id, bytes = body.len(), "checkpoint saved");
        self.rotate().await;
        Ok(id)
    }

    /// Load a snapshot by id substring match.
    pub async fn load(&self, id: &str) -> Result<CheckpointSnapshot, CheckpointError> {
        let path = self
            .find_file(id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound { id: id.to_string() })?;

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| CheckpointError::Corrupt {
                id: id.to_string(),
                message: e.to_string(),
            })?;
        let json = if bytes.starts_with(&GZIP_MAGIC) {
            gunzip(&bytes).map_err(|e| CheckpointError::Corrupt {
                id: id.to_string(),
                message: format!("gzip decode failed: {e}"),
            })?
        } else {
            bytes
        };

        serde_json::from_slice(&json).map_err(|e| CheckpointError::Corrupt {
            id: id.to_string(),
            message: e.to_string(),
        })
    }

    /// Enumerate stored snapshots, newest first, without loading bodies.
    pub async fn list(
        &self,
        pipeline_id: Option<&str>,
    ) -> Result<Vec<CheckpointMetadata>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.config.dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };

        let wanted = pipeline_id.map(sanitize);
        let mut listed = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(mut metadata) = parse_file_name(&file_name) else {
                continue;
            };
            if let Some(wanted) = &wanted
                && &metadata.pipeline_id != wanted
            {
                continue;
            }
            if let Ok(fs_meta) = entry.metadata().await {
                metadata.size_bytes = fs_meta.len();
            }
            listed.push(metadata);
        }

        listed.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(listed)
    }

    /// The newest loadable snapshot for a pipeline. Corrupt snapshots are
    /// skipped with a warning, not raised.
    pub async fn get_latest(&self, pipeline_id: &str) -> Option<CheckpointSnapshot> {
        let listed = self.list(Some(pipeline_id)).await.ok()?;
        for metadata in listed {
            match self.load(&metadata.id).await {
                Ok(snapshot) => return Some(snapshot),
                Err(error) => {
                    warn!(checkpoint = %metadata.id, %error, "skipping unloadable checkpoint");
                }
            }
        }
        None
    }

    /// Delete a snapshot by id. Absence is not an error.
    pub async fn delete(&self, id: &str) -> Result<(), CheckpointError> {
        if let Some(path) = self.find_file(id).await? {
            tokio::fs::remove_file(&path)
                .await
                .or_else(ignore_not_found)
                .map_err(|source| CheckpointError::WriteFailed { path, source })?;
        }
        Ok(())
    }

    /// Apply the three retention rules: keep at most `max_count` newest,
    /// delete snapshots older than the retention window, and delete
    /// oldest-first until cumulative size fits the budget. Failures are
    /// logged, never raised; rotation must not block save/load.
    pub async fn rotate(&self) -> usize {
        let listed = match self.list(None).await {
            Ok(listed) => listed,
            Err(error) => {
                warn!(%error, "rotation listing failed");
                return 0;
            }
        };

        let mut victims: Vec<CheckpointMetadata> = Vec::new();
        let mut survivors: Vec<CheckpointMetadata> = Vec::new();
        for (i, metadata) in listed.into_iter().enumerate() {
            if i < self.config.max_count {
                survivors.push(metadata);
            } else {
                victims.push(metadata);
            }
        }

        if let Ok(retention) = chrono::Duration::from_std(self.config.retention) {
            let cutoff = Utc::now() - retention;
            survivors.retain(|metadata| {
                if metadata.timestamp < cutoff {
                    victims.push(metadata.clone());
                    false
                } else {
                    true
                }
            });
        }

        let mut total: u64 = survivors.iter().map(|m| m.size_bytes).sum();
        while total > self.config.size_budget_bytes {
            // Survivors are newest-first; pop the oldest.
            let Some(oldest) = survivors.pop() else {
                break;
            };
            total -= oldest.size_bytes;
            victims.push(oldest);
        }

        let mut deleted = 0;
        for victim in victims {
            match self.delete(&victim.id).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(checkpoint = %victim.id, "rotated out");
                }
                Err(error) => warn!(checkpoint = %victim.id, %error, "rotation delete failed"),
            }
        }
        deleted
    }

    /// Load a snapshot and check its required fields. Never raises.
    pub async fn validate(&self, id: &str) -> bool {
        match self.load(id).await {
            Ok(snapshot) => snapshot.is_well_formed(),
            Err(_) => false,
        }
    }

    /// Build a unique, creation-time-sortable id.
    fn next_id(&self, pipeline_id: &str) -> String {
        let timestamp = Utc::now().format(TIMESTAMP_FORMAT);
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        format!(
            "{}_{}_{}_{}",
            self.prefix,
            timestamp,
            sanitize(pipeline_id),
            suffix
        )
    }

    /// Locate the stored file whose name contains the id. With several
    /// matches the newest (lexicographically greatest) name wins.
    async fn find_file(&self, id: &str) -> Result<Option<PathBuf>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.config.dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(None),
        };

        let mut best: Option<String> = None;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if parse_file_name(&file_name).is_none() || !file_name.contains(id) {
                continue;
            }
            if best.as_deref().is_none_or(|b| file_name.as_str() > b) {
                best = Some(file_name);
            }
        }
        Ok(best.map(|name| self.config.dir.join(name)))
    }
}

fn sanitize(part: &str) -> String {
    part.replace('_', "-")
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn ignore_not_found(error: std::io::Error) -> std::io::Result<()> {
    if error.kind() == std::io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(error)
    }
}

/// Parse `{prefix}_{timestamp}_{pipelineId}_{suffix}.json[.gz]`.
fn parse_file_name(file_name: &str) -> Option<CheckpointMetadata> {
    let (id, compressed) = if let Some(stem) = file_name.strip_suffix(".json.gz") {
        (stem, true)
    } else if let Some(stem) = file_name.strip_suffix(".json") {
        (stem, false)
    } else {
        return None;
    };

    let parts: Vec<&str> = id.split('_').collect();
    if parts.len() < 4 {
        return None;
    }
    let timestamp = chrono::NaiveDateTime::parse_from_str(parts[1], TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())?;
    let pipeline_id = parts[2..parts.len() - 1].join("_");

    Some(CheckpointMetadata {
        id: id.to_string(),
        pipeline_id,
        timestamp,
        size_bytes: 0,
        compressed,
    })
}
