use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{Result, RunnerError};
use crate::experiment::{ArtifactRef, Experiment, ExperimentStatus};

/// Partial update applied to an experiment record. Unset fields are left
/// alone; manifest entries are merged in, overwriting same-named ones.
#[derive(Debug, Clone, Default)]
pub struct ExperimentPatch {
    pub status: Option<ExperimentStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifacts: HashMap<String, ArtifactRef>,
}

impl ExperimentPatch {
    pub fn status(status: ExperimentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn with_artifact(mut self, name: impl Into<String>, artifact: ArtifactRef) -> Self {
        self.artifacts.insert(name.into(), artifact);
        self
    }
}

/// Metadata record store, one record per experiment name.
///
/// `get` reflects the latest committed `update` (read-your-writes).
#[async_trait]
pub trait ExperimentDb: Send + Sync {
    /// Fails with [`RunnerError::DuplicateExperiment`] if the name is taken.
    async fn create(&self, experiment: Experiment) -> Result<()>;

    /// Fails with [`RunnerError::NotFound`] if absent.
    async fn get(&self, name: &str) -> Result<Experiment>;

    async fn update(&self, name: &str, patch: ExperimentPatch) -> Result<()>;

    /// Removes the metadata record. Artifact blobs are retained and
    /// garbage-collected independently.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// In-process experiment database; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryDb {
    experiments: Arc<RwLock<HashMap<String, Experiment>>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExperimentDb for MemoryDb {
    async fn create(&self, experiment: Experiment) -> Result<()> {
        let mut experiments = self.experiments.write().await;
        if experiments.contains_key(&experiment.name) {
            return Err(RunnerError::DuplicateExperiment(experiment.name));
        }
        tracing::info!(experiment = %experiment.name, "Experiment created");
        experiments.insert(experiment.name.clone(), experiment);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Experiment> {
        self.experiments
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RunnerError::NotFound(name.to_string()))
    }

    async fn update(&self, name: &str, patch: ExperimentPatch) -> Result<()> {
        let mut experiments = self.experiments.write().await;
        let experiment = experiments
            .get_mut(name)
            .ok_or_else(|| RunnerError::NotFound(name.to_string()))?;

        if let Some(status) = patch.status {
            experiment.status = status;
        }
        if let Some(at) = patch.started_at {
            experiment.started_at = Some(at);
        }
        if let Some(at) = patch.finished_at {
            experiment.finished_at = Some(at);
        }
        experiment.artifacts.extend(patch.artifacts);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut experiments = self.experiments.write().await;
        if experiments.remove(name).is_none() {
            return Err(RunnerError::NotFound(name.to_string()));
        }
        tracing::info!(experiment = name, "Experiment deleted");
        Ok(())
    }
}
