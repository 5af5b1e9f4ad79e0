//! Backend trait definitions

use async_trait::async_trait;
use poncos_core::{ExecutionId, Job, PoncosError, PoncosResult, Slot};

/// How a launched command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// Exit code, `None` when killed by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
}

/// One cross-host move of an execution, possibly displacing another one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStep {
    /// Execution being moved
    pub execution: ExecutionId,
    pub source: Slot,
    pub destination: Slot,
    /// Processes per slot of the moved execution, when it uses the special protocol
    pub hook_procs: Option<usize>,
    /// Execution currently in `destination`, moved to `source`
    pub displaced: Option<ExecutionId>,
    /// Processes per slot of the displaced execution, when it uses the special protocol
    pub displaced_hook_procs: Option<usize>,
}

/// Execution backend: turns a placement into a running workload
#[async_trait]
pub trait Backend: Send + Sync {
    /// Prepare the environment before the first job
    async fn init(&self) -> PoncosResult<()> {
        Ok(())
    }

    /// Tear everything down after the last job
    async fn dismantle(&self) -> PoncosResult<()> {
        Ok(())
    }

    /// Prepare the runtime context of an execution
    async fn provision(&self, id: ExecutionId, placement: &[Slot]) -> PoncosResult<()>;

    /// Release the runtime context of an execution
    async fn teardown(&self, id: ExecutionId) -> PoncosResult<()>;

    /// Produce the command line that runs `job` on `placement`
    async fn build_command(
        &self,
        job: &Job,
        id: ExecutionId,
        placement: &[Slot],
    ) -> PoncosResult<String>;

    /// Run the command to completion
    async fn run(&self, id: ExecutionId, command: &str) -> PoncosResult<RunOutcome>;

    /// Suspend the part of execution `id` living in `slot`
    async fn pause(&self, id: ExecutionId, slot: Slot) -> PoncosResult<()>;

    /// Resume the part of execution `id` living in `slot`
    async fn resume(&self, id: ExecutionId, slot: Slot) -> PoncosResult<()>;

    /// Whether running executions can be moved between slots
    fn supports_reconfiguration(&self) -> bool {
        false
    }

    /// Physically perform the given moves.
    ///
    /// An error means nothing was moved. Otherwise there is one result per
    /// step, in step order; only the steps reported as `Ok` took place.
    async fn migrate(&self, _steps: &[MigrationStep]) -> PoncosResult<Vec<PoncosResult<()>>> {
        Err(PoncosError::Unsupported(format!(
            "{} backend cannot migrate executions",
            self.name()
        )))
    }

    /// Get the backend name
    fn name(&self) -> &'static str;
}
