use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;
use crate::experiment::ExperimentStatus;

/// Result of executing one experiment script.
#[derive(Debug)]
pub struct ExecutionResult {
    pub status: ExperimentStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub error: Option<String>,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl ExecutionResult {
    fn failed(error: String) -> Self {
        Self {
            status: ExperimentStatus::Failed,
            exit_code: None,
            stdout: String::new(),
            error: Some(error),
            timed_out: false,
            cancelled: false,
        }
    }
}

/// Executes experiment scripts, in a Docker container when the sandbox has
/// an image configured and as a direct child process otherwise.
///
/// Containerized jobs run with network isolation, dropped capabilities,
/// and memory/CPU limits, with the working directory bind-mounted at
/// `/workspace`.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    sandbox: SandboxConfig,
    timeout: Duration,
}

impl JobExecutor {
    pub fn new(sandbox: SandboxConfig, timeout: Duration) -> Self {
        Self { sandbox, timeout }
    }

    /// Run the script with its arguments inside `workdir`, capturing stdout.
    ///
    /// The child is killed when the wall-clock timeout fires or when the
    /// cancellation token trips; both are folded into a `Failed` result
    /// rather than an error, since a failed job is still a completed job.
    pub async fn execute(
        &self,
        experiment: &str,
        script: &str,
        args: &[String],
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        tracing::info!(
            experiment,
            script,
            image = ?self.sandbox.image,
            "Executing job"
        );

        // Direct mode execs the script itself so killing the child kills the
        // job, not an intermediate shell.
        let mut cmd = match &self.sandbox.image {
            Some(image) => {
                let command_line = build_command_line(script, args);
                self.docker_command(image, workdir, &command_line)
            }
            None => {
                let mut cmd = Command::new(script);
                cmd.args(args).current_dir(workdir);
                cmd
            }
        };

        let child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(experiment, error = %e, "Failed to spawn job process");
                return ExecutionResult::failed(e.to_string());
            }
        };

        // Dropping the wait future kills the child via kill_on_drop, so both
        // the timeout and the cancellation branch terminate the process tree.
        let output = tokio::select! {
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => result,
            _ = cancel.cancelled() => {
                tracing::warn!(experiment, "Job cancelled, killing child process");
                return ExecutionResult {
                    cancelled: true,
                    ..ExecutionResult::failed("cancelled by shutdown signal".to_string())
                };
            }
        };

        match output {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                let (status, error) = if output.status.success() {
                    (ExperimentStatus::Succeeded, None)
                } else {
                    (
                        ExperimentStatus::Failed,
                        Some(if stderr.is_empty() {
                            format!("Exit code: {:?}", exit_code)
                        } else {
                            stderr
                        }),
                    )
                };

                tracing::info!(experiment, status = %status, exit_code = ?exit_code, "Job completed");

                ExecutionResult {
                    status,
                    exit_code,
                    stdout,
                    error,
                    timed_out: false,
                    cancelled: false,
                }
            }
            Ok(Err(e)) => {
                tracing::error!(experiment, error = %e, "Job execution failed");
                ExecutionResult::failed(e.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    experiment,
                    timeout_secs = self.timeout.as_secs(),
                    "Job exceeded wall-clock timeout, killed"
                );
                ExecutionResult {
                    timed_out: true,
                    ..ExecutionResult::failed(
                        crate::error::RunnerError::ExecutionTimeout(self.timeout).to_string(),
                    )
                }
            }
        }
    }

    fn docker_command(&self, image: &str, workdir: &Path, command_line: &str) -> Command {
        let mut args = vec!["run".to_string(), "--rm".to_string()];

        if self.sandbox.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = self.sandbox.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.sandbox.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push(format!("-v={}:/workspace", workdir.display()));
        args.push("-w=/workspace".to_string());
        args.push(image.to_string());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(command_line.to_string());

        let mut cmd = Command::new("docker");
        cmd.args(&args);
        cmd
    }
}

/// Join the script and its arguments into a single shell command line,
/// single-quoting each argument.
fn build_command_line(script: &str, args: &[String]) -> String {
    let mut parts = vec![shell_quote(script)];
    parts.extend(args.iter().map(|a| shell_quote(a)));
    parts.join(" ")
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_quotes_arguments() {
        let line = build_command_line("./run.sh", &["a b".to_string(), "c'd".to_string()]);
        assert_eq!(line, "'./run.sh' 'a b' 'c'\\''d'");
    }

    #[tokio::test]
    async fn execute_captures_stdout() {
        let executor = JobExecutor::new(SandboxConfig::default(), Duration::from_secs(10));
        let dir = tempfile::tempdir().unwrap();
        let result = executor
            .execute(
                "exp",
                "echo",
                &["hello".to_string()],
                dir.path(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.status, ExperimentStatus::Succeeded);
        assert_eq!(result.stdout, "hello\n");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn execute_reports_failure() {
        let executor = JobExecutor::new(SandboxConfig::default(), Duration::from_secs(10));
        let dir = tempfile::tempdir().unwrap();
        let result = executor
            .execute("exp", "false", &[], dir.path(), &CancellationToken::new())
            .await;
        assert_eq!(result.status, ExperimentStatus::Failed);
        assert_eq!(result.exit_code, Some(1));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn execute_kills_on_timeout() {
        let executor = JobExecutor::new(SandboxConfig::default(), Duration::from_millis(200));
        let dir = tempfile::tempdir().unwrap();
        let result = executor
            .execute(
                "exp",
                "sleep",
                &["30".to_string()],
                dir.path(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.status, ExperimentStatus::Failed);
        assert!(result.timed_out);
        assert!(!result.cancelled);
    }

    #[tokio::test]
    async fn execute_honors_cancellation() {
        let executor = JobExecutor::new(SandboxConfig::default(), Duration::from_secs(30));
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });
        let result = executor
            .execute("exp", "sleep", &["30".to_string()], dir.path(), &cancel)
            .await;
        assert!(result.cancelled);
        assert_eq!(result.status, ExperimentStatus::Failed);
    }
}
