use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, RunnerError};
use crate::experiment::ArtifactRef;

/// Whether a conditional download actually transferred bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded,
    Skipped,
}

/// Store of named blobs associated with an experiment.
///
/// Uploads of the same `(experiment, name)` are last-writer-wins by
/// timestamp; a failed upload must never leave a partially written artifact
/// visible to readers.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(
        &self,
        experiment: &str,
        name: &str,
        bytes: Vec<u8>,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    /// Write the artifact to `destination`. With `only_if_newer`, the
    /// transfer is skipped when the destination already exists and is not
    /// older than the stored version.
    async fn download(
        &self,
        artifact: &ArtifactRef,
        destination: &Path,
        only_if_newer: bool,
    ) -> Result<DownloadOutcome>;

    /// Timestamp of the stored version, if any.
    async fn stored_timestamp(&self, experiment: &str, name: &str)
        -> Result<Option<DateTime<Utc>>>;
}

#[derive(Debug, Clone)]
struct StoredArtifact {
    bytes: Vec<u8>,
    timestamp: DateTime<Utc>,
}

/// In-process artifact store backing the [`ArtifactStore`] seam; clones
/// share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    artifacts: Arc<RwLock<HashMap<(String, String), StoredArtifact>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored bytes, for tests and debugging.
    pub async fn peek(&self, experiment: &str, name: &str) -> Option<Vec<u8>> {
        self.artifacts
            .read()
            .await
            .get(&(experiment.to_string(), name.to_string()))
            .map(|a| a.bytes.clone())
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn upload(
        &self,
        experiment: &str,
        name: &str,
        bytes: Vec<u8>,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let key = (experiment.to_string(), name.to_string());
        let mut artifacts = self.artifacts.write().await;
        if let Some(existing) = artifacts.get(&key) {
            if existing.timestamp > timestamp {
                tracing::debug!(
                    experiment,
                    artifact = name,
                    "Skipping upload older than stored version"
                );
                return Ok(());
            }
        }
        tracing::debug!(experiment, artifact = name, size = bytes.len(), "Artifact uploaded");
        artifacts.insert(key, StoredArtifact { bytes, timestamp });
        Ok(())
    }

    async fn download(
        &self,
        artifact: &ArtifactRef,
        destination: &Path,
        only_if_newer: bool,
    ) -> Result<DownloadOutcome> {
        let stored = {
            let artifacts = self.artifacts.read().await;
            artifacts
                .get(&(artifact.experiment.clone(), artifact.name.clone()))
                .cloned()
        };
        let stored = stored.ok_or_else(|| RunnerError::ArtifactNotFound {
            experiment: artifact.experiment.clone(),
            name: artifact.name.clone(),
        })?;

        if only_if_newer {
            if let Some(local_mtime) = file_mtime(destination)? {
                if local_mtime >= stored.timestamp {
                    tracing::debug!(
                        experiment = %artifact.experiment,
                        artifact = %artifact.name,
                        "Local copy is current, skipping download"
                    );
                    return Ok(DownloadOutcome::Skipped);
                }
            }
        }

        write_atomic(destination, &stored.bytes).await?;
        tracing::debug!(
            experiment = %artifact.experiment,
            artifact = %artifact.name,
            destination = %destination.display(),
            "Artifact downloaded"
        );
        Ok(DownloadOutcome::Downloaded)
    }

    async fn stored_timestamp(
        &self,
        experiment: &str,
        name: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .artifacts
            .read()
            .await
            .get(&(experiment.to_string(), name.to_string()))
            .map(|a| a.timestamp))
    }
}

/// Modification time of a local file, `None` if it does not exist.
pub fn file_mtime(path: &Path) -> Result<Option<DateTime<Utc>>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temp file in the same directory and rename into place,
/// so readers never observe a partially written destination.
async fn write_atomic(destination: &Path, bytes: &[u8]) -> Result<()> {
    let dir = destination.parent().unwrap_or_else(|| Path::new("."));
    let file_name = destination
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, destination).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
