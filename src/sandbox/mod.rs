//! Sandbox — isolated execution of synthesized/stored Python blocks
//! (`SPEC_FULL.md` §4.B).
//!
//! Two backends implement the same [`Executor`] trait: [`docker::DockerExecutor`]
//! (hardened container, preferred) and [`direct::DirectExecutor`]
//! (OS-`rlimit`-bounded subprocess, used when Docker is unreachable).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;

pub mod direct;
pub mod docker;
pub mod egress;

/// Executor implementation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// Docker-backed sandbox executor.
    Docker,
    /// OS-rlimit-bounded subprocess executor.
    Direct,
}

/// Command execution options.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Maximum command runtime before timeout handling.
    pub timeout: Duration,
    /// Optional working directory inside executor context.
    pub working_dir: Option<PathBuf>,
    /// Whether this command needs network access. Only meaningful for
    /// category-`input` blocks with `needs_network` set (`SPEC_FULL.md`
    /// §4.B); every other call site leaves this `false` and gets the
    /// isolated sandbox.
    pub network: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            working_dir: None,
            network: false,
        }
    }
}

/// Command execution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Process exit code (`None` when the process was killed or exit code unavailable).
    pub exit_code: Option<i32>,
    /// Captured stdout text.
    pub stdout: String,
    /// Captured stderr text.
    pub stderr: String,
    /// Whether the command exceeded the timeout.
    pub timed_out: bool,
    /// Wall-clock execution duration.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` when the command exited successfully (code 0, no timeout).
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Combined stdout+stderr output, separated by a newline when both are non-empty.
    pub fn output(&self) -> String {
        if self.stdout.is_empty() {
            return self.stderr.clone();
        }
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Health status for a concrete executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Executor is operational.
    Healthy {
        /// Executor implementation kind.
        kind: ExecutorKind,
        /// Human-readable diagnostics.
        details: String,
    },
    /// Executor exists but is in a degraded state.
    Degraded {
        /// Executor implementation kind.
        kind: ExecutorKind,
        /// Human-readable diagnostics.
        details: String,
    },
    /// Executor is not available.
    Unavailable {
        /// Executor implementation kind.
        kind: ExecutorKind,
        /// Human-readable diagnostics.
        details: String,
    },
}

impl HealthStatus {
    /// Returns `true` when the executor is in a healthy state.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

/// Errors produced by executor operations — the root of the
/// `AgentFlowError::SandboxError` variant (`SPEC_FULL.md` §7).
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Infrastructure client failure.
    #[error("executor operation failed: {0}")]
    Infrastructure(String),
    /// Command execution exceeded timeout.
    #[error("command timed out after {seconds}s")]
    Timeout {
        /// Timeout budget in seconds.
        seconds: u64,
    },
    /// Command execution is not permitted in this mode.
    #[error("execution is not allowed in this mode: {0}")]
    Forbidden(String),
    /// A resource ceiling (memory, CPU time, open files) was exceeded.
    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),
}

/// Unified executor trait used by the DAG scheduler and block synthesizer.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute a command with options and capture output.
    async fn execute(&self, command: &str, opts: ExecOptions) -> Result<ExecResult, ExecutorError>;
    /// Install the given pip packages before running code that depends on
    /// them. A no-op for an empty list.
    async fn install_packages(&self, packages: &[String]) -> Result<(), ExecutorError> {
        if packages.is_empty() {
            return Ok(());
        }
        let command = format!("pip install --user {}", packages.join(" "));
        let result = self
            .execute(
                &command,
                ExecOptions {
                    timeout: Duration::from_secs(120),
                    network: true,
                    ..Default::default()
                },
            )
            .await?;
        if !result.success() {
            return Err(ExecutorError::Infrastructure(format!(
                "pip install failed: {}",
                result.output()
            )));
        }
        Ok(())
    }
    /// Check health for this executor instance.
    async fn health_check(&self) -> Result<HealthStatus, ExecutorError>;
    /// Whether this executor provides network isolation.
    fn has_network_isolation(&self) -> bool;
    /// Returns scripts directory for persisted block wrapper scripts.
    fn scripts_dir(&self) -> &Path;
    /// Returns workspace directory for command execution.
    fn workspace_dir(&self) -> &Path;
    /// Returns concrete executor kind.
    fn kind(&self) -> ExecutorKind;
}

/// Detect the available executor kind at runtime.
///
/// Returns [`ExecutorKind::Docker`] when the Docker daemon is reachable,
/// otherwise falls back to [`ExecutorKind::Direct`].
pub async fn auto_detect() -> ExecutorKind {
    if docker_available().await {
        ExecutorKind::Docker
    } else {
        ExecutorKind::Direct
    }
}

/// Returns true if the Docker daemon can be reached.
pub async fn docker_available() -> bool {
    match Docker::connect_with_local_defaults() {
        Ok(docker) => docker.ping().await.is_ok(),
        Err(_) => false,
    }
}

/// Pull `image` from its registry, building it locally from `dockerfile` on
/// pull failure.
///
/// # Errors
///
/// Returns an error if neither the registry pull nor the local build
/// succeeds.
pub(crate) async fn ensure_image(
    docker: &Docker,
    image: &str,
    dockerfile: Option<&str>,
) -> Result<(), ExecutorError> {
    use bollard::image::CreateImageOptions;
    use tokio_stream::StreamExt;

    if docker.inspect_image(image).await.is_ok() {
        return Ok(());
    }

    let mut pull_stream = docker.create_image(
        Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        }),
        None,
        None,
    );

    let mut pull_failed = false;
    while let Some(chunk) = pull_stream.next().await {
        if chunk.is_err() {
            pull_failed = true;
            break;
        }
    }
    if !pull_failed {
        return Ok(());
    }

    let Some(dockerfile_contents) = dockerfile else {
        return Err(ExecutorError::Infrastructure(format!(
            "image {image} not found in registry and no local Dockerfile available"
        )));
    };

    build_image_locally(docker, image, dockerfile_contents).await
}

async fn build_image_locally(
    docker: &Docker,
    image: &str,
    dockerfile_contents: &str,
) -> Result<(), ExecutorError> {
    use bollard::image::BuildImageOptions;
    use tokio_stream::StreamExt;

    let dockerfile_bytes = dockerfile_contents.as_bytes();
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header
        .set_path("Dockerfile")
        .map_err(|e| ExecutorError::Infrastructure(e.to_string()))?;
    header.set_size(dockerfile_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, dockerfile_bytes)
        .map_err(|e| ExecutorError::Infrastructure(e.to_string()))?;
    let tar_bytes = builder
        .into_inner()
        .map_err(|e| ExecutorError::Infrastructure(e.to_string()))?;

    let mut build_stream = docker.build_image(
        BuildImageOptions {
            t: image.to_owned(),
            rm: true,
            ..Default::default()
        },
        None,
        Some(tar_bytes.into()),
    );

    while let Some(chunk) = build_stream.next().await {
        chunk.map_err(|e| ExecutorError::Infrastructure(format!("image build failed: {e}")))?;
    }

    Ok(())
}
