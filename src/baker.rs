//! Credential baking: derive an execution image with an embedded credential
//! bundle, so workers in untrusted environments can reach the queue and
//! store without separate credential distribution.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use uuid::Uuid;

use crate::error::{Result, RunnerError};

/// Where the bundle lands inside the derived image. Worker runtime
/// initialization reads this path at startup.
pub const CREDENTIALS_IMAGE_PATH: &str = "/root/.exprunner/credentials.json";

const CONTEXT_BUNDLE_NAME: &str = "credentials.json";

/// Builds derived images with `docker build` from an ephemeral build
/// context. The bundle bytes are copied into the context and referenced by
/// file name only; they never appear in the generated Dockerfile, on the
/// build command line, or in anything the baker logs. Resulting images are
/// caller-managed; teardown is not automatic.
#[derive(Debug, Clone)]
pub struct CredentialBaker {
    docker_bin: String,
}

impl Default for CredentialBaker {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
        }
    }
}

impl CredentialBaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the docker binary (tests substitute a stub).
    pub fn with_docker_bin(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    /// Build `tag` from `base_image` with the credential bundle embedded.
    ///
    /// Returns the tag of the usable image. Fails with
    /// [`RunnerError::Build`] if the build exits non-zero; a failed build
    /// publishes nothing usable under the tag.
    pub async fn bake(&self, base_image: &str, credential_bundle: &Path, tag: &str) -> Result<String> {
        let context = prepare_context(base_image, credential_bundle)?;
        tracing::info!(base_image, tag, "Baking credentials into derived image");

        let output = Command::new(&self.docker_bin)
            .arg("build")
            .arg("-t")
            .arg(tag)
            .arg(&context)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        // Best-effort cleanup of the ephemeral context, success or not.
        let _ = std::fs::remove_dir_all(&context);

        let output = output?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            tracing::error!(tag, exit_code = ?output.status.code(), "Image build failed");
            return Err(RunnerError::Build(if stderr.is_empty() {
                format!("docker build exited with {:?}", output.status.code())
            } else {
                stderr
            }));
        }

        tracing::info!(tag, "Derived image built");
        Ok(tag.to_string())
    }
}

/// Dockerfile for the derived image. Takes only the base image reference;
/// the bundle is referenced by its in-context file name.
fn render_dockerfile(base_image: &str) -> String {
    format!(
        "FROM {}\nRUN mkdir -p /root/.exprunner\nCOPY {} {}\n",
        base_image, CONTEXT_BUNDLE_NAME, CREDENTIALS_IMAGE_PATH
    )
}

/// Assemble the ephemeral build context: Dockerfile plus a copy of the
/// bundle. The caller removes the directory when the build finishes.
fn prepare_context(base_image: &str, credential_bundle: &Path) -> Result<PathBuf> {
    if !credential_bundle.exists() {
        return Err(RunnerError::Build(format!(
            "credential bundle {} does not exist",
            credential_bundle.display()
        )));
    }

    let context = std::env::temp_dir().join(format!("exprunner-bake-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&context)?;
    std::fs::write(context.join("Dockerfile"), render_dockerfile(base_image))?;
    std::fs::copy(credential_bundle, context.join(CONTEXT_BUNDLE_NAME))?;
    Ok(context)
}
