//! Virtual machine backend
//!
//! Every slot of every machine hosts one guest. Jobs run inside the guests,
//! which lets the agents swap guests between machines while they run.

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use poncos_core::{
    ExecutionId, Job, PoncosError, PoncosResult, Slot, SystemConfig, VmPoolEntry,
};
use poncos_network::messages::{topics, MigfraTask, ResultContainer, SwapWith, TaskContainer};
use poncos_network::{call, AgentChannel};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::process::ShellRunner;
use crate::traits::{Backend, MigrationStep, RunOutcome};

/// Backend running every slot inside its own guest
pub struct VmBackend {
    channel: Arc<dyn AgentChannel>,
    machines: Vec<String>,
    system: SystemConfig,
    mpiexec: String,
    runner: ShellRunner,
    /// Guests not placed on any machine
    pool: Mutex<VecDeque<VmPoolEntry>>,
    /// `[machine][slot] -> guest`
    locations: RwLock<Vec<Vec<VmPoolEntry>>>,
}

impl VmBackend {
    pub fn new(
        channel: Arc<dyn AgentChannel>,
        machines: Vec<String>,
        system: SystemConfig,
        pool: Vec<VmPoolEntry>,
        mpiexec: String,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            channel,
            machines,
            system,
            mpiexec,
            runner: ShellRunner::new(work_dir),
            pool: Mutex::new(pool.into()),
            locations: RwLock::new(Vec::new()),
        }
    }

    /// Guest currently living in `slot`
    pub async fn guest(&self, slot: Slot) -> PoncosResult<String> {
        let locations = self.locations.read().await;
        locations
            .get(slot.machine)
            .and_then(|row| row.get(slot.slot))
            .map(|g| g.name.clone())
            .ok_or_else(|| {
                PoncosError::Runtime(format!("No guest in slot {}, is the backend initialized?", slot))
            })
    }

    async fn send_tasks(&self, host: &str, tasks: Vec<MigfraTask>) -> PoncosResult<ResultContainer> {
        let container = TaskContainer { tasks };
        debug!(machine = %host, tasks = container.tasks.len(), "Sending guest tasks");
        call(self.channel.as_ref(), host, topics::MIGFRA_TASK, &container).await
    }

    fn vcpu_map(&self, slot: usize) -> Vec<Vec<u32>> {
        self.system
            .slot(slot)
            .cpus
            .iter()
            .map(|cpu| vec![*cpu])
            .collect()
    }

    async fn start_all(&self) -> PoncosResult<()> {
        let slot_count = self.system.slot_count();
        let mut allocation = Vec::with_capacity(self.machines.len());
        {
            let mut pool = self.pool.lock().await;
            if pool.len() < self.machines.len() * slot_count {
                return Err(PoncosError::Config(format!(
                    "{} guests available, {} machines with {} slots need {}",
                    pool.len(),
                    self.machines.len(),
                    slot_count,
                    self.machines.len() * slot_count
                )));
            }
            for _ in &self.machines {
                let row: Vec<VmPoolEntry> = pool.drain(..slot_count).collect();
                allocation.push(row);
            }
        }

        let requests = self.machines.iter().zip(&allocation).map(|(host, row)| {
            let tasks = row
                .iter()
                .enumerate()
                .map(|(slot, guest)| MigfraTask::StartVm {
                    vm_name: guest.name.clone(),
                    mac: guest.mac.clone(),
                    uuid: Uuid::new_v4().to_string(),
                    slot,
                    transient: true,
                })
                .collect();
            self.send_tasks(host, tasks)
        });

        let started = try_join_all(requests).await;
        let checked = started.and_then(|results| {
            results
                .iter()
                .zip(&allocation)
                .try_for_each(|(r, row)| r.check(row.len(), "starting guests"))
        });
        if let Err(e) = checked {
            self.pool.lock().await.extend(allocation.into_iter().flatten());
            return Err(e);
        }

        info!(
            machines = self.machines.len(),
            guests = self.machines.len() * slot_count,
            "Started all guests"
        );
        *self.locations.write().await = allocation;
        Ok(())
    }

    async fn stop_all(&self) -> PoncosResult<()> {
        let requests = self.machines.iter().map(|host| {
            self.send_tasks(
                host,
                vec![MigfraTask::StopVm {
                    regex: ".*".to_string(),
                    force: true,
                    concurrent_execution: true,
                }],
            )
        });
        for result in try_join_all(requests).await? {
            result.check(1, "stopping guests")?;
        }

        let mut locations = self.locations.write().await;
        self.pool
            .lock()
            .await
            .extend(locations.drain(..).flatten());
        info!("Stopped all guests");
        Ok(())
    }

    async fn guest_task(&self, slot: Slot, task: MigfraTask, what: &str) -> PoncosResult<()> {
        let host = &self.machines[slot.machine];
        self.send_tasks(host, vec![task]).await?.check(1, what)
    }

    fn migrate_task(&self, step: &MigrationStep, src_guest: &str, dest_guest: &str) -> MigfraTask {
        let slot_changes = step.source.slot != step.destination.slot;
        MigfraTask::Migrate {
            vm_name: src_guest.to_string(),
            dest_hostname: self.machines[step.destination.machine].clone(),
            migration_type: "warm".to_string(),
            rdma_migration: true,
            swap_with: Some(SwapWith {
                vm_name: dest_guest.to_string(),
                vcpu_map: slot_changes.then(|| self.vcpu_map(step.source.slot)),
                pscom_hook_procs: step.displaced_hook_procs.map(|p| p.to_string()),
            }),
            vcpu_map: slot_changes.then(|| self.vcpu_map(step.destination.slot)),
            pscom_hook_procs: step.hook_procs.map(|p| p.to_string()),
        }
    }
}

#[async_trait]
impl Backend for VmBackend {
    async fn init(&self) -> PoncosResult<()> {
        self.stop_all().await?;
        self.start_all().await
    }

    async fn dismantle(&self) -> PoncosResult<()> {
        self.stop_all().await
    }

    async fn provision(&self, id: ExecutionId, placement: &[Slot]) -> PoncosResult<()> {
        // Guests are started once in `init`
        for slot in placement {
            self.guest(*slot).await?;
        }
        debug!(execution_id = %id, "Guests ready");
        Ok(())
    }

    async fn teardown(&self, id: ExecutionId) -> PoncosResult<()> {
        debug!(execution_id = %id, "Guests kept for the next execution");
        Ok(())
    }

    async fn build_command(
        &self,
        job: &Job,
        _id: ExecutionId,
        placement: &[Slot],
    ) -> PoncosResult<String> {
        let mut guests = Vec::with_capacity(placement.len());
        for slot in placement {
            guests.push(self.guest(*slot).await?);
        }

        Ok(format!(
            "{} -np {} -genv OMP_NUM_THREADS {} -hosts {} {}",
            self.mpiexec,
            job.nprocs,
            job.threads_per_proc,
            guests.join(","),
            job.command
        ))
    }

    async fn run(&self, id: ExecutionId, command: &str) -> PoncosResult<RunOutcome> {
        self.runner.run(id, command).await
    }

    async fn pause(&self, id: ExecutionId, slot: Slot) -> PoncosResult<()> {
        let vm_name = self.guest(slot).await?;
        info!(execution_id = %id, guest = %vm_name, "Suspending guest");
        self.guest_task(slot, MigfraTask::SuspendVm { vm_name }, "suspending guest")
            .await
    }

    async fn resume(&self, id: ExecutionId, slot: Slot) -> PoncosResult<()> {
        let vm_name = self.guest(slot).await?;
        info!(execution_id = %id, guest = %vm_name, "Resuming guest");
        self.guest_task(slot, MigfraTask::ResumeVm { vm_name }, "resuming guest")
            .await
    }

    fn supports_reconfiguration(&self) -> bool {
        true
    }

    async fn migrate(&self, steps: &[MigrationStep]) -> PoncosResult<Vec<PoncosResult<()>>> {
        // Steps within one machine have nothing to move
        let mut results: Vec<PoncosResult<()>> = steps.iter().map(|_| Ok(())).collect();

        let mut cross_host = Vec::new();
        let mut requests = Vec::new();
        for (index, step) in steps.iter().enumerate() {
            if step.source.machine == step.destination.machine {
                continue;
            }

            let src_guest = self.guest(step.source).await?;
            let dest_guest = self.guest(step.destination).await?;
            let task = self.migrate_task(step, &src_guest, &dest_guest);
            info!(
                execution_id = %step.execution,
                from = %step.source,
                to = %step.destination,
                guest = %src_guest,
                swap_with = %dest_guest,
                "Requesting guest swap"
            );
            let host = self.machines[step.source.machine].clone();
            cross_host.push(index);
            requests.push(async move {
                self.send_tasks(&host, vec![task])
                    .await
                    .and_then(|r| r.check(1, "swapping guests"))
            });
        }

        let replies = join_all(requests).await;

        // Swap the guests whose migration went through
        let mut locations = self.locations.write().await;
        for (index, reply) in cross_host.into_iter().zip(replies) {
            let step = &steps[index];
            match &reply {
                Ok(()) => {
                    let (a, b) = (step.source, step.destination);
                    let moved = locations[a.machine][a.slot].clone();
                    locations[a.machine][a.slot] = locations[b.machine][b.slot].clone();
                    locations[b.machine][b.slot] = moved;
                }
                Err(e) => {
                    warn!(
                        execution_id = %step.execution,
                        from = %step.source,
                        to = %step.destination,
                        error = %e,
                        "Guest swap failed"
                    );
                }
            }
            results[index] = reply;
        }
        Ok(results)
    }

    fn name(&self) -> &'static str {
        "vm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poncos_network::{task_replies, MemoryChannel};

    fn pool(count: usize) -> Vec<VmPoolEntry> {
        (0..count)
            .map(|i| VmPoolEntry {
                name: format!("guest-{}", i),
                mac: format!("52:54:00:00:00:{:02x}", i),
            })
            .collect()
    }

    fn backend(channel: Arc<MemoryChannel>, guests: usize) -> VmBackend {
        VmBackend::new(
            channel,
            vec!["n0".to_string(), "n1".to_string()],
            SystemConfig::sandybridge_ep(),
            pool(guests),
            "mpiexec".to_string(),
            PathBuf::from("."),
        )
    }

    #[tokio::test]
    async fn test_init_places_one_guest_per_slot() {
        let channel = Arc::new(MemoryChannel::acknowledging());
        let backend = backend(channel.clone(), 4);

        backend.init().await.unwrap();
        assert_eq!(backend.guest(Slot::new(0, 0)).await.unwrap(), "guest-0");
        assert_eq!(backend.guest(Slot::new(1, 1)).await.unwrap(), "guest-3");

        // One stop and one start batch per host
        assert_eq!(channel.requests_on(topics::MIGFRA_TASK).await.len(), 4);

        let job = Job {
            nprocs: 16,
            threads_per_proc: 1,
            command: "./mg.C".to_string(),
            uses_sr_protocol: false,
        };
        let command = backend
            .build_command(&job, ExecutionId(0), &[Slot::new(0, 1), Slot::new(1, 1)])
            .await
            .unwrap();
        assert_eq!(
            command,
            "mpiexec -np 16 -genv OMP_NUM_THREADS 1 -hosts guest-1,guest-3 ./mg.C"
        );

        backend.dismantle().await.unwrap();
        assert!(backend.guest(Slot::new(0, 0)).await.is_err());
        // Guests went back to the pool, a second init works
        backend.init().await.unwrap();
    }

    #[tokio::test]
    async fn test_init_with_small_pool_fails() {
        let backend = backend(Arc::new(MemoryChannel::acknowledging()), 3);
        let err = backend.init().await.unwrap_err();
        assert!(matches!(err, PoncosError::Config(_)));
    }

    #[tokio::test]
    async fn test_pause_suspends_guest_on_its_host() {
        let channel = Arc::new(MemoryChannel::acknowledging());
        let backend = backend(channel.clone(), 4);
        backend.init().await.unwrap();

        backend.pause(ExecutionId(2), Slot::new(1, 0)).await.unwrap();

        let requests = channel.requests_on(topics::MIGFRA_TASK).await;
        let last = requests.last().unwrap();
        assert_eq!(last.host, "n1");
        assert_eq!(last.body["tasks"][0]["task"], "suspend-vm");
        assert_eq!(last.body["tasks"][0]["vm_name"], "guest-2");
    }

    #[tokio::test]
    async fn test_migrate_swaps_guests() {
        let channel = Arc::new(MemoryChannel::acknowledging());
        let backend = backend(channel.clone(), 4);
        backend.init().await.unwrap();

        let step = MigrationStep {
            execution: ExecutionId(0),
            source: Slot::new(0, 0),
            destination: Slot::new(1, 1),
            hook_procs: Some(4),
            displaced: Some(ExecutionId(1)),
            displaced_hook_procs: None,
        };
        let results = backend.migrate(&[step]).await.unwrap();
        assert!(results[0].is_ok());

        assert_eq!(backend.guest(Slot::new(0, 0)).await.unwrap(), "guest-3");
        assert_eq!(backend.guest(Slot::new(1, 1)).await.unwrap(), "guest-0");

        let requests = channel.requests_on(topics::MIGFRA_TASK).await;
        let task = &requests.last().unwrap().body["tasks"][0];
        assert_eq!(task["task"], "migrate");
        assert_eq!(task["dest_hostname"], "n1");
        assert_eq!(task["swap_with"]["vm_name"], "guest-3");
        assert_eq!(task["pscom_hook_procs"], "4");
        assert_eq!(
            task["vcpu_map"][0],
            serde_json::json!([4]),
            "slot changes, guest gets the destination slot's cpus"
        );
    }

    #[tokio::test]
    async fn test_migrate_failure_keeps_locations() {
        let channel = Arc::new(MemoryChannel::new(|_, _, body| {
            Ok(task_replies(body, |task| {
                if task["task"] == "migrate" {
                    "error"
                } else {
                    "success"
                }
            }))
        }));
        let backend = backend(channel, 4);
        backend.init().await.unwrap();

        let step = MigrationStep {
            execution: ExecutionId(0),
            source: Slot::new(0, 0),
            destination: Slot::new(1, 0),
            hook_procs: None,
            displaced: None,
            displaced_hook_procs: None,
        };
        let results = backend.migrate(&[step]).await.unwrap();
        assert!(results[0].is_err());
        assert_eq!(backend.guest(Slot::new(0, 0)).await.unwrap(), "guest-0");
    }

    #[tokio::test]
    async fn test_partial_migration_reports_each_step() {
        // Swaps requested from n1 fail, the ones from n0 go through
        let channel = Arc::new(MemoryChannel::new(|host, _, body| {
            let failing = host == "n1";
            Ok(task_replies(body, move |task| {
                if failing && task["task"] == "migrate" {
                    "error"
                } else {
                    "success"
                }
            }))
        }));
        let backend = VmBackend::new(
            channel,
            vec!["n0".to_string(), "n1".to_string(), "n2".to_string(), "n3".to_string()],
            SystemConfig::sandybridge_ep(),
            pool(8),
            "mpiexec".to_string(),
            PathBuf::from("."),
        );
        backend.init().await.unwrap();

        let step = |from: Slot, to: Slot| MigrationStep {
            execution: ExecutionId(0),
            source: from,
            destination: to,
            hook_procs: None,
            displaced: None,
            displaced_hook_procs: None,
        };
        let results = backend
            .migrate(&[
                step(Slot::new(0, 0), Slot::new(2, 0)),
                step(Slot::new(1, 0), Slot::new(3, 0)),
            ])
            .await
            .unwrap();

        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert_eq!(backend.guest(Slot::new(2, 0)).await.unwrap(), "guest-0");
        assert_eq!(backend.guest(Slot::new(0, 0)).await.unwrap(), "guest-4");
        assert_eq!(backend.guest(Slot::new(1, 0)).await.unwrap(), "guest-2");
        assert_eq!(backend.guest(Slot::new(3, 0)).await.unwrap(), "guest-6");
    }
}
