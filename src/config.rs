use std::path::PathBuf;
use std::time::Duration;

/// Configuration for sandboxed job execution.
///
/// When an image is set, jobs run in Docker containers with network
/// isolation and resource limits. Without an image, jobs run as direct
/// child processes (used for local development and tests).
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Docker image to use for job execution. `None` runs jobs unsandboxed.
    pub image: Option<String>,
    /// Disable network access in the container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: None,
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

impl SandboxConfig {
    pub fn with_image(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue to claim jobs from. One queue per experiment run; callers derive
    /// a fresh name to keep concurrent runs isolated.
    pub queue_name: String,
    /// Exit after one job instead of looping back to claim the next.
    pub single_run: bool,
    pub sandbox: SandboxConfig,
    /// Root under which per-experiment working directories are created.
    pub work_root: PathBuf,
    /// Source snapshot copied into the workdir before execution. Re-copied
    /// on every run when the experiment requests a forced fetch.
    pub source_dir: Option<PathBuf>,
    /// Overall wall-clock limit on job execution.
    pub execution_timeout: Duration,
    /// How long a claimed message stays invisible to other workers.
    pub visibility_timeout: Duration,
    /// Longest the worker waits for a message in one receive call.
    pub receive_wait: Duration,
    /// Polling interval for continuous artifact capture.
    pub capture_interval: Duration,
    /// Attempts for retryable transport faults before giving up.
    pub max_transport_retries: u32,
}

impl WorkerConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            single_run: false,
            sandbox: SandboxConfig::default(),
            work_root: std::env::temp_dir().join("exprunner"),
            source_dir: None,
            execution_timeout: Duration::from_secs(300),
            visibility_timeout: Duration::from_secs(30),
            receive_wait: Duration::from_secs(5),
            capture_interval: Duration::from_millis(500),
            max_transport_retries: 5,
        }
    }

    pub fn single_run(mut self) -> Self {
        self.single_run = true;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }
}
