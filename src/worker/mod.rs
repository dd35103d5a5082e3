//! Worker execution engine.
//!
//! A worker binds to one queue and drives claimed jobs through
//! `Claiming -> Running -> Reporting`, looping back to claim the next job
//! (or exiting after one job in single-run mode):
//!
//! 1. **Claiming**: receives a message, backing off while the queue is empty
//! 2. **Running**: materializes the working directory and executes the
//!    script under the sandbox, with continuous artifact capture polling in
//!    the background
//! 3. **Reporting**: uploads captured artifacts, commits status and manifest
//!    to the database, and only then acknowledges the queue message
//!
//! A crash before the acknowledge leaves the message claimable again after
//! its visibility timeout, so execution is at-least-once; re-execution
//! overwrites prior artifact versions rather than appending.

pub mod capture;
pub mod executor;

pub use executor::JobExecutor;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::db::{ExperimentDb, ExperimentPatch};
use crate::error::{Result, RunnerError};
use crate::experiment::{
    ArtifactRef, CaptureMode, Experiment, JobPayload, OUTPUT_ARTIFACT,
};
use crate::queue::{with_retries, JobQueue, Message};
use crate::store::ArtifactStore;

enum JobCompletion {
    /// Job executed and its terminal state was committed and acknowledged.
    Reported,
    /// Message was acknowledged without running anything (unparseable
    /// payload or missing experiment record).
    Discarded,
    /// Shutdown fired mid-execution; the child was killed and the message
    /// left unacknowledged for redelivery.
    Cancelled,
}

/// One worker instance: a single logical thread of control per claimed job.
/// Multiple workers coordinate only through the queue.
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ArtifactStore>,
    db: Arc<dyn ExperimentDb>,
    executor: JobExecutor,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ArtifactStore>,
        db: Arc<dyn ExperimentDb>,
    ) -> Self {
        let executor = JobExecutor::new(config.sandbox.clone(), config.execution_timeout);
        Self {
            config,
            queue,
            store,
            db,
            executor,
        }
    }

    /// Run the claim/execute/report loop until cancelled, or until one job
    /// has been reported in single-run mode. Returns the number of jobs
    /// processed; infrastructure faults surface as errors after bounded
    /// retries.
    pub async fn run(&self, cancel: CancellationToken) -> Result<usize> {
        tracing::info!(
            queue = %self.config.queue_name,
            single_run = self.config.single_run,
            "Worker started"
        );
        let mut processed = 0usize;

        loop {
            let message = tokio::select! {
                result = with_retries(self.config.max_transport_retries, || {
                    self.queue.receive(
                        &self.config.queue_name,
                        self.config.visibility_timeout,
                        self.config.receive_wait,
                    )
                }) => result?,
                _ = cancel.cancelled() => {
                    tracing::info!("Shutdown signal received while claiming, exiting");
                    break;
                }
            };

            let Some(message) = message else {
                // Empty queue; receive already waited its full window.
                continue;
            };

            match self.process_job(message, &cancel).await? {
                JobCompletion::Reported => {
                    processed += 1;
                    if self.config.single_run {
                        tracing::info!("Single-run job reported, terminating");
                        break;
                    }
                }
                JobCompletion::Discarded => continue,
                JobCompletion::Cancelled => break,
            }
        }

        tracing::info!(processed, "Worker stopped");
        Ok(processed)
    }

    async fn process_job(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<JobCompletion> {
        let payload = match JobPayload::from_bytes(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Unparseable job payload, discarding message");
                self.acknowledge(message.token).await?;
                return Ok(JobCompletion::Discarded);
            }
        };

        // The queue owns message lifecycle independently of experiment
        // state; a message may outlive its record.
        let experiment = match self.db.get(&payload.experiment).await {
            Ok(experiment) => experiment,
            Err(RunnerError::NotFound(name)) => {
                tracing::warn!(experiment = %name, "No record for queued job, discarding message");
                self.acknowledge(message.token).await?;
                return Ok(JobCompletion::Discarded);
            }
            Err(e) => return Err(e),
        };

        tracing::info!(experiment = %experiment.name, script = %experiment.script, "Job claimed");
        self.db
            .update(
                &experiment.name,
                ExperimentPatch::status(crate::experiment::ExperimentStatus::Running)
                    .with_started_at(Utc::now()),
            )
            .await?;

        let workdir = self.config.work_root.join(&experiment.name);
        self.prepare_workdir(&workdir, payload.force_fetch).await?;

        // Keep the claim alive for jobs that outlast the visibility timeout.
        let claim = CancellationToken::new();
        let extender = self.spawn_visibility_extender(message.token, claim.clone());

        let capture_stop = CancellationToken::new();
        let mut capture_handles = Vec::new();
        for binding in &experiment.bindings {
            if binding.mode == CaptureMode::Continuous {
                capture_handles.push(capture::spawn_continuous(
                    self.store.clone(),
                    experiment.name.clone(),
                    binding.clone(),
                    self.config.capture_interval,
                    capture_stop.clone(),
                ));
            }
        }

        let result = self
            .executor
            .execute(
                &experiment.name,
                &experiment.script,
                &experiment.args,
                &workdir,
                cancel,
            )
            .await;

        // Each continuous poller does one final pass before stopping so a
        // write landing just before exit is not lost.
        capture_stop.cancel();
        for handle in capture_handles {
            let _ = handle.await;
        }

        if result.cancelled {
            claim.cancel();
            let _ = extender.await;
            return Ok(JobCompletion::Cancelled);
        }

        // Reporting: database commit first, acknowledge second, so a crash
        // in between causes redelivery instead of a lost result.
        let patch = self.report_patch(&experiment, &result).await?;
        match self.db.update(&experiment.name, patch).await {
            Ok(()) => {}
            Err(RunnerError::NotFound(name)) => {
                tracing::warn!(experiment = %name, "Record deleted mid-run, result dropped");
            }
            Err(e) => {
                claim.cancel();
                let _ = extender.await;
                return Err(e);
            }
        }
        self.acknowledge(message.token).await?;

        claim.cancel();
        let _ = extender.await;
        tracing::info!(experiment = %experiment.name, status = %result.status, "Job reported");
        Ok(JobCompletion::Reported)
    }

    /// Build the terminal patch: stdout log plus captured artifacts.
    async fn report_patch(
        &self,
        experiment: &Experiment,
        result: &executor::ExecutionResult,
    ) -> Result<ExperimentPatch> {
        let mut patch = ExperimentPatch::status(result.status).with_finished_at(Utc::now());

        self.store
            .upload(
                &experiment.name,
                OUTPUT_ARTIFACT,
                result.stdout.clone().into_bytes(),
                Utc::now(),
            )
            .await?;
        patch = patch.with_artifact(
            OUTPUT_ARTIFACT,
            ArtifactRef {
                experiment: experiment.name.clone(),
                name: OUTPUT_ARTIFACT.to_string(),
            },
        );

        for binding in &experiment.bindings {
            let artifact = match binding.mode {
                CaptureMode::Once => {
                    capture::capture_once(self.store.as_ref(), &experiment.name, binding).await?
                }
                CaptureMode::Continuous => {
                    // Present in the manifest only if a poll ever saw the file.
                    self.store
                        .stored_timestamp(&experiment.name, &binding.name)
                        .await?
                        .map(|_| ArtifactRef {
                            experiment: experiment.name.clone(),
                            name: binding.name.clone(),
                        })
                }
            };
            if let Some(artifact) = artifact {
                patch = patch.with_artifact(binding.name.clone(), artifact);
            }
        }

        Ok(patch)
    }

    /// Materialize the working directory, copying the source snapshot in.
    /// A forced fetch discards the cached copy first so the run starts from
    /// pristine sources.
    async fn prepare_workdir(&self, workdir: &Path, force_fetch: bool) -> Result<()> {
        if force_fetch && workdir.exists() {
            tokio::fs::remove_dir_all(workdir).await?;
        }
        tokio::fs::create_dir_all(workdir).await?;

        if let Some(source) = &self.config.source_dir {
            if force_fetch || dir_is_empty(workdir)? {
                copy_dir_recursive(source, workdir)?;
                tracing::debug!(
                    source = %source.display(),
                    workdir = %workdir.display(),
                    "Source snapshot copied"
                );
            }
        }
        Ok(())
    }

    fn spawn_visibility_extender(
        &self,
        token: Uuid,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let visibility = self.config.visibility_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(visibility / 2);
            // First tick is immediate; the claim was just made.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = queue.extend_visibility(token, visibility).await {
                            tracing::warn!(token = %token, error = %e, "Failed to extend claim");
                            break;
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }
        })
    }

    async fn acknowledge(&self, token: Uuid) -> Result<()> {
        with_retries(self.config.max_transport_retries, || {
            self.queue.acknowledge(token)
        })
        .await
    }
}

fn dir_is_empty(dir: &Path) -> Result<bool> {
    Ok(std::fs::read_dir(dir)?.next().is_none())
}

fn copy_dir_recursive(source: &Path, destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
