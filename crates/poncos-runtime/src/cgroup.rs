//! cgroup backend
//!
//! Jobs run on bare metal. A wrapper script places the processes of one slot
//! into a cgroup named after the execution, bound to the slot's cpus and
//! memory nodes. Freezing and thawing is done by the agent on each machine.

use async_trait::async_trait;
use poncos_core::{
    ExecutionId, Job, PoncosError, PoncosResult, Slot, SlotDescriptor, SystemConfig,
};
use poncos_network::messages::{topics, Ack, CgroupSignal};
use poncos_network::{call, AgentChannel};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::process::{execution_name, ShellRunner};
use crate::traits::{Backend, RunOutcome};

/// Launcher configuration for the cgroup backend
#[derive(Debug, Clone)]
pub struct CgroupBackendConfig {
    /// Script creating the cgroup: `<wrapper> <name> <cpus> <mems> <command>`
    pub wrapper: String,
    /// MPI launcher
    pub mpiexec: String,
    /// Directory for host files and logs
    pub work_dir: PathBuf,
}

impl Default for CgroupBackendConfig {
    fn default() -> Self {
        Self {
            wrapper: "./cgroup_wrapper.sh".to_string(),
            mpiexec: "mpiexec".to_string(),
            work_dir: PathBuf::from("."),
        }
    }
}

/// Backend partitioning machines with cgroups
pub struct CgroupBackend {
    channel: Arc<dyn AgentChannel>,
    machines: Vec<String>,
    system: SystemConfig,
    config: CgroupBackendConfig,
    runner: ShellRunner,
}

impl CgroupBackend {
    pub fn new(
        channel: Arc<dyn AgentChannel>,
        machines: Vec<String>,
        system: SystemConfig,
        config: CgroupBackendConfig,
    ) -> Self {
        let runner = ShellRunner::new(config.work_dir.clone());
        Self {
            channel,
            machines,
            system,
            config,
            runner,
        }
    }

    fn host(&self, machine: usize) -> PoncosResult<&str> {
        self.machines
            .get(machine)
            .map(String::as_str)
            .ok_or_else(|| PoncosError::Runtime(format!("No machine with index {}", machine)))
    }

    fn hosts_path(&self, id: ExecutionId) -> PathBuf {
        self.config
            .work_dir
            .join(format!("{}.hosts", execution_name(id)))
    }

    async fn signal(&self, id: ExecutionId, slot: Slot, topic: &str) -> PoncosResult<()> {
        let host = self.host(slot.machine)?;
        let request = CgroupSignal {
            cgroup: execution_name(id),
        };
        debug!(execution_id = %id, machine = %host, topic = topic, "Signalling cgroup");

        let ack: Ack = call(self.channel.as_ref(), host, topic, &request).await?;
        ack.into_result(&format!("{} of {} on {}", topic, request.cgroup, host))
    }

    fn wrapped_command(&self, name: &str, cpus: &str, mems: &str, job: &Job) -> String {
        format!(
            "{} {} {} {} {}",
            self.config.wrapper, name, cpus, mems, job.command
        )
    }

    /// Split a placement into launch groups.
    ///
    /// Group `s < S` holds hosts where the job uses only slot `s`; group `S`
    /// holds hosts where it uses every slot (one entry per slot).
    fn launch_groups(&self, placement: &[Slot]) -> Vec<Vec<String>> {
        let slot_count = self.system.slot_count();
        let mut per_machine: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for slot in placement {
            per_machine.entry(slot.machine).or_default().push(slot.slot);
        }

        let mut groups = vec![Vec::new(); slot_count + 1];
        for (machine, slots) in per_machine {
            let host = &self.machines[machine];
            if slots.len() == slot_count && slot_count > 1 {
                groups[slot_count].extend(std::iter::repeat(host.clone()).take(slot_count));
            } else {
                for slot in slots {
                    groups[slot].push(host.clone());
                }
            }
        }
        groups
    }

    fn whole_host_descriptor(&self) -> SlotDescriptor {
        let cpus = self
            .system
            .slots
            .iter()
            .flat_map(|s| s.cpus.iter().copied())
            .collect();
        let mut mems: Vec<u32> = self
            .system
            .slots
            .iter()
            .flat_map(|s| s.mems.iter().copied())
            .collect();
        mems.sort_unstable();
        mems.dedup();
        SlotDescriptor::new(cpus, mems)
    }
}

#[async_trait]
impl Backend for CgroupBackend {
    async fn provision(&self, id: ExecutionId, placement: &[Slot]) -> PoncosResult<()> {
        // The wrapper script creates the cgroup itself
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        for slot in placement {
            self.host(slot.machine)?;
        }
        debug!(execution_id = %id, slots = placement.len(), "Provisioned cgroup execution");
        Ok(())
    }

    async fn teardown(&self, id: ExecutionId) -> PoncosResult<()> {
        match tokio::fs::remove_file(self.hosts_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_command(
        &self,
        job: &Job,
        id: ExecutionId,
        placement: &[Slot],
    ) -> PoncosResult<String> {
        let slot_size = self.system.slot_size();
        if job.threads_per_proc == 0 || slot_size % job.threads_per_proc != 0 {
            return Err(PoncosError::InvalidJob(format!(
                "{} threads per process do not divide the slot size {}",
                job.threads_per_proc, slot_size
            )));
        }
        if job.required_cores() > placement.len() * slot_size {
            return Err(PoncosError::InvalidJob(format!(
                "{} needs {} cores, placement offers {}",
                job,
                job.required_cores(),
                placement.len() * slot_size
            )));
        }

        let name = execution_name(id);
        let procs_per_slot = slot_size / job.threads_per_proc;
        let groups = self.launch_groups(placement);
        let slot_count = self.system.slot_count();

        let mut hosts_file = String::new();
        let mut blocks = Vec::new();
        for (index, hosts) in groups.iter().enumerate() {
            if hosts.is_empty() {
                continue;
            }
            for host in hosts {
                hosts_file.push_str(&format!("{}:{}\n", host, procs_per_slot));
            }

            let descriptor = if index == slot_count {
                self.whole_host_descriptor()
            } else {
                self.system.slot(index).clone()
            };
            let command = self.wrapped_command(
                &name,
                &descriptor.cpu_list(),
                &descriptor.mem_list(),
                job,
            );
            blocks.push(format!("-np {} {}", procs_per_slot * hosts.len(), command));
        }

        let hosts_path = self.hosts_path(id);
        tokio::fs::write(&hosts_path, hosts_file).await?;

        Ok(format!(
            "{} -f {} -genv OMP_NUM_THREADS {} {}",
            self.config.mpiexec,
            hosts_path.display(),
            job.threads_per_proc,
            blocks.join(" : ")
        ))
    }

    async fn run(&self, id: ExecutionId, command: &str) -> PoncosResult<RunOutcome> {
        self.runner.run(id, command).await
    }

    async fn pause(&self, id: ExecutionId, slot: Slot) -> PoncosResult<()> {
        self.signal(id, slot, topics::CGROUP_STOP).await?;
        info!(execution_id = %id, slot = %slot, "Froze cgroup");
        Ok(())
    }

    async fn resume(&self, id: ExecutionId, slot: Slot) -> PoncosResult<()> {
        self.signal(id, slot, topics::CGROUP_RESTART).await?;
        info!(execution_id = %id, slot = %slot, "Thawed cgroup");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "cgroup"
    }
}
