use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::db::ExperimentDb;
use crate::error::Result;
use crate::experiment::{ArtifactRef, Experiment, JobPayload};
use crate::queue::{with_retries, JobQueue};
use crate::store::{ArtifactStore, DownloadOutcome};

const SUBMIT_RETRIES: u32 = 5;

/// Submission and read-back surface used by drivers.
#[derive(Clone)]
pub struct Client {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ArtifactStore>,
    db: Arc<dyn ExperimentDb>,
}

impl Client {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ArtifactStore>,
        db: Arc<dyn ExperimentDb>,
    ) -> Self {
        Self { queue, store, db }
    }

    /// Create the experiment record, then publish the job message.
    ///
    /// Fails with [`crate::error::RunnerError::DuplicateExperiment`] before
    /// anything reaches the queue if the name is taken; publish faults are
    /// retried with backoff.
    pub async fn submit(&self, queue_name: &str, experiment: Experiment) -> Result<Uuid> {
        let payload = JobPayload::for_experiment(&experiment).to_bytes()?;
        let name = experiment.name.clone();
        self.db.create(experiment).await?;

        let message_id = with_retries(SUBMIT_RETRIES, || {
            self.queue.publish(queue_name, payload.clone())
        })
        .await?;
        tracing::info!(experiment = %name, queue = queue_name, message_id = %message_id, "Experiment submitted");
        Ok(message_id)
    }

    pub async fn get_experiment(&self, name: &str) -> Result<Experiment> {
        self.db.get(name).await
    }

    /// Download an artifact to `destination`. `only_newer` skips the
    /// transfer when the local copy is already current; pass `false` to
    /// force a refresh regardless of timestamps.
    pub async fn get_artifact(
        &self,
        artifact: &ArtifactRef,
        destination: &Path,
        only_newer: bool,
    ) -> Result<DownloadOutcome> {
        self.store.download(artifact, destination, only_newer).await
    }

    /// Remove the metadata record. Artifact blobs are garbage-collected
    /// independently.
    pub async fn delete_experiment(&self, name: &str) -> Result<()> {
        self.db.delete(name).await
    }
}
