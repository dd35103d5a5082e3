use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerError};

/// Logical name under which a worker's captured stdout is stored.
pub const OUTPUT_ARTIFACT: &str = "output";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentStatus::Queued => write!(f, "queued"),
            ExperimentStatus::Running => write!(f, "running"),
            ExperimentStatus::Succeeded => write!(f, "succeeded"),
            ExperimentStatus::Failed => write!(f, "failed"),
        }
    }
}

/// When a locally produced file is uploaded as an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    /// Read exactly once after the job process exits.
    Once,
    /// Polled while the job runs; re-uploaded whenever the local file is
    /// newer than the last stored version.
    Continuous,
}

/// Declared link between a local path and a named stored artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactBinding {
    pub local_path: PathBuf,
    pub name: String,
    pub mode: CaptureMode,
}

impl ArtifactBinding {
    /// Parse the `<localPath>:<artifactName>` flag syntax.
    pub fn parse(spec: &str, mode: CaptureMode) -> Result<Self> {
        let (path, name) = spec.rsplit_once(':').ok_or_else(|| {
            RunnerError::Internal(format!(
                "invalid capture spec {:?}, expected <localPath>:<artifactName>",
                spec
            ))
        })?;
        if path.is_empty() || name.is_empty() {
            return Err(RunnerError::Internal(format!(
                "invalid capture spec {:?}, expected <localPath>:<artifactName>",
                spec
            )));
        }
        Ok(Self {
            local_path: PathBuf::from(path),
            name: name.to_string(),
            mode,
        })
    }
}

/// Reference to a stored artifact, recorded in the experiment manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub experiment: String,
    pub name: String,
}

/// One unit of submitted, trackable work.
///
/// Created by the submitting client before the job message is published,
/// mutated by the worker during execution, deleted only by an explicit
/// client call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    pub script: String,
    pub args: Vec<String>,
    pub bindings: Vec<ArtifactBinding>,
    pub status: ExperimentStatus,
    /// Re-fetch the source snapshot instead of reusing a cached copy.
    pub force_fetch: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// artifact name -> store reference
    pub artifacts: HashMap<String, ArtifactRef>,
}

impl Experiment {
    pub fn new(name: impl Into<String>, script: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            args,
            bindings: Vec::new(),
            status: ExperimentStatus::Queued,
            force_fetch: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            artifacts: HashMap::new(),
        }
    }

    pub fn with_binding(mut self, binding: ArtifactBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn with_force_fetch(mut self, force_fetch: bool) -> Self {
        self.force_fetch = force_fetch;
        self
    }
}

/// Queue message body: the experiment identity plus execution parameters.
/// The worker resolves the full record through the database on claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub experiment: String,
    pub force_fetch: bool,
}

impl JobPayload {
    pub fn for_experiment(experiment: &Experiment) -> Self {
        Self {
            experiment: experiment.name.clone(),
            force_fetch: experiment.force_fetch,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
