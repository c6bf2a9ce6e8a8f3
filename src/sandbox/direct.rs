//! Subprocess sandbox backend used when the Docker daemon is unreachable.
//!
//! Ceilings are applied with the shell's own `ulimit` builtin (CPU seconds,
//! address space, open file descriptors) rather than an in-process
//! `setrlimit` call, since this crate forbids `unsafe_code` and `ulimit`
//! gives the same guarantee without it. There is no network isolation in
//! this mode — blocks that `needs_network` should prefer the Docker backend.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::{ExecOptions, ExecResult, Executor, ExecutorError, ExecutorKind, HealthStatus};

/// Maximum simultaneously open file descriptors granted to a subprocess.
const FD_LIMIT: u64 = 256;

/// Subprocess executor bounded by shell `ulimit` ceilings.
#[derive(Debug, Clone)]
pub struct DirectExecutor {
    scripts_dir: PathBuf,
    workspace_dir: PathBuf,
    memory_kb: u64,
    cpu_seconds: u64,
}

impl DirectExecutor {
    /// Create a subprocess executor bounding memory to `memory_mb` and CPU
    /// time to `exec_timeout_secs`.
    pub fn new(
        scripts_dir: PathBuf,
        workspace_dir: PathBuf,
        memory_mb: u32,
        exec_timeout_secs: u64,
    ) -> Self {
        Self {
            scripts_dir,
            workspace_dir,
            memory_kb: u64::from(memory_mb).saturating_mul(1024),
            cpu_seconds: exec_timeout_secs.max(1),
        }
    }
}

#[async_trait::async_trait]
impl Executor for DirectExecutor {
    async fn execute(&self, command: &str, opts: ExecOptions) -> Result<ExecResult, ExecutorError> {
        let start = std::time::Instant::now();
        let cpu_seconds = opts.timeout.as_secs().max(self.cpu_seconds).max(1);

        let wrapped = format!(
            "ulimit -t {cpu_seconds}; ulimit -v {mem_kb}; ulimit -n {fd_limit}; exec {cmd}",
            mem_kb = self.memory_kb,
            fd_limit = FD_LIMIT,
            cmd = super::docker::shell_escape(command),
        );

        let mut child = Command::new("bash")
            .arg("-lc")
            .arg(&wrapped)
            .current_dir(opts.working_dir.as_deref().unwrap_or(&self.workspace_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecutorError::Infrastructure(e.to_string()))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let wait_window = opts.timeout.saturating_add(Duration::from_secs(5));
        let wait_result = tokio::time::timeout(wait_window, child.wait()).await;

        let (exit_code, timed_out) = match wait_result {
            Ok(status) => {
                let status = status.map_err(|e| ExecutorError::Infrastructure(e.to_string()))?;
                (status.code(), false)
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                (None, true)
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut pipe) = stdout_pipe.take() {
            let _ = pipe.read_to_string(&mut stdout).await;
        }
        if let Some(mut pipe) = stderr_pipe.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
            timed_out,
            duration: start.elapsed(),
        })
    }

    async fn health_check(&self) -> Result<HealthStatus, ExecutorError> {
        let probe = Command::new("bash")
            .arg("-lc")
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match probe {
            Ok(status) if status.success() => Ok(HealthStatus::Healthy {
                kind: ExecutorKind::Direct,
                details: "subprocess sandbox available, no network isolation".to_owned(),
            }),
            Ok(status) => Ok(HealthStatus::Degraded {
                kind: ExecutorKind::Direct,
                details: format!("bash probe exited with {status}"),
            }),
            Err(e) => Ok(HealthStatus::Unavailable {
                kind: ExecutorKind::Direct,
                details: e.to_string(),
            }),
        }
    }

    fn has_network_isolation(&self) -> bool {
        false
    }

    fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Direct
    }
}
