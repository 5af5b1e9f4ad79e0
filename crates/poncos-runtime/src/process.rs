//! Shell execution of job commands
//!
//! Every execution runs as `sh -c <command>` with stdout and stderr
//! redirected to `<work_dir>/poncos_<id>.log`.

use poncos_core::{ExecutionId, PoncosError, PoncosResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::traits::RunOutcome;

/// Name of an execution's cgroup, log and host file
pub fn execution_name(id: ExecutionId) -> String {
    format!("poncos_{}", id)
}

/// Runs commands through the shell
#[derive(Debug, Clone)]
pub struct ShellRunner {
    work_dir: PathBuf,
}

impl ShellRunner {
    /// Create a runner writing logs into `work_dir`
    pub fn new(work_dir: PathBuf) -> Self {
        Self { work_dir }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Log file of an execution
    pub fn log_path(&self, id: ExecutionId) -> PathBuf {
        self.work_dir.join(format!("{}.log", execution_name(id)))
    }

    /// Run `command` and wait for it to exit
    pub async fn run(&self, id: ExecutionId, command: &str) -> PoncosResult<RunOutcome> {
        let log_path = self.log_path(id);
        let stdout = tokio::fs::File::create(&log_path).await?.into_std().await;
        let stderr = stdout.try_clone()?;

        info!(
            execution_id = %id,
            command = %command,
            log = %log_path.display(),
            "Launching command"
        );

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::from(stderr));

        let mut child = cmd.spawn().map_err(|e| {
            error!(
                execution_id = %id,
                error = %e,
                "Failed to spawn command"
            );
            PoncosError::Runtime(format!("Failed to spawn execution {}: {}", id, e))
        })?;

        debug!(execution_id = %id, pid = child.id().unwrap_or(0), "Command spawned");

        let status = child.wait().await?;
        let outcome = RunOutcome {
            exit_code: status.code(),
            success: status.success(),
        };

        if outcome.success {
            info!(execution_id = %id, "Command completed");
        } else {
            warn!(
                execution_id = %id,
                exit_code = ?outcome.exit_code,
                log = %log_path.display(),
                "Command exited unsuccessfully"
            );
        }

        Ok(outcome)
    }
}
