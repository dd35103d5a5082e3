use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RunnerError};
use crate::experiment::{ArtifactBinding, ArtifactRef};
use crate::store::{file_mtime, ArtifactStore};

/// Upload the bound file if its modification time is newer than the stored
/// version (or nothing is stored yet). Returns whether an upload happened.
///
/// Reads are a best-effort snapshot; a file caught mid-write is simply
/// re-uploaded on the next poll when its mtime moves again.
pub async fn upload_if_newer(
    store: &dyn ArtifactStore,
    experiment: &str,
    binding: &ArtifactBinding,
) -> Result<bool> {
    let mtime = match file_mtime(&binding.local_path)? {
        Some(mtime) => mtime,
        None => return Ok(false),
    };
    let stored = store.stored_timestamp(experiment, &binding.name).await?;
    if let Some(stored) = stored {
        if mtime <= stored {
            return Ok(false);
        }
    }

    let bytes = tokio::fs::read(&binding.local_path).await?;
    store
        .upload(experiment, &binding.name, bytes, mtime)
        .await?;
    tracing::debug!(
        experiment,
        artifact = %binding.name,
        path = %binding.local_path.display(),
        "Captured artifact"
    );
    Ok(true)
}

/// One-shot capture after the job process has exited.
///
/// A missing local path is not fatal: the artifact is simply absent from
/// the manifest and the experiment still completes.
pub async fn capture_once(
    store: &dyn ArtifactStore,
    experiment: &str,
    binding: &ArtifactBinding,
) -> Result<Option<ArtifactRef>> {
    let mtime = match file_mtime(&binding.local_path)? {
        Some(mtime) => mtime,
        None => {
            let err = RunnerError::Capture(format!(
                "local path {} does not exist",
                binding.local_path.display()
            ));
            tracing::warn!(
                experiment,
                artifact = %binding.name,
                error = %err,
                "Skipping missing capture path"
            );
            return Ok(None);
        }
    };

    let bytes = tokio::fs::read(&binding.local_path).await?;
    store
        .upload(experiment, &binding.name, bytes, mtime)
        .await?;
    Ok(Some(ArtifactRef {
        experiment: experiment.to_string(),
        name: binding.name.clone(),
    }))
}

/// Spawn the background poller for a continuous binding.
///
/// Re-uploads the local file whenever its mtime moves past the stored
/// version, then does one final poll on cancellation so a write landing
/// just before the job exits is not lost.
pub fn spawn_continuous(
    store: Arc<dyn ArtifactStore>,
    experiment: String,
    binding: ArtifactBinding,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = upload_if_newer(store.as_ref(), &experiment, &binding).await {
                        tracing::warn!(
                            experiment = %experiment,
                            artifact = %binding.name,
                            error = %e,
                            "Continuous capture poll failed"
                        );
                    }
                }
                _ = stop.cancelled() => {
                    if let Err(e) = upload_if_newer(store.as_ref(), &experiment, &binding).await {
                        tracing::warn!(
                            experiment = %experiment,
                            artifact = %binding.name,
                            error = %e,
                            "Final capture poll failed"
                        );
                    }
                    break;
                }
            }
        }
    })
}
