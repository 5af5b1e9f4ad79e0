//! In-memory backend and probe for scheduler tests

use async_trait::async_trait;
use poncos_core::{ExecutionId, Job, PoncosError, PoncosResult, Slot, SlotDescriptor, SystemConfig};
use poncos_network::Probe;
use poncos_runtime::{Backend, MigrationStep, RunOutcome};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

/// Two slots per machine with `slot_size` cpus each
pub fn two_slot_system(slot_size: u32) -> SystemConfig {
    let slot = |base: u32| SlotDescriptor::new((base..base + slot_size).collect(), vec![base / slot_size]);
    SystemConfig::new(vec![slot(0), slot(slot_size)]).unwrap()
}

/// Backend call as seen by [`FakeBackend`]
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Provision(ExecutionId),
    Teardown(ExecutionId),
    Pause(ExecutionId, Slot),
    Resume(ExecutionId, Slot),
    Migrate(Vec<MigrationStep>),
}

/// Backend whose executions run until [`FakeBackend::finish`] is called
pub struct FakeBackend {
    reconfigurable: bool,
    fail_migrate: bool,
    /// Steps towards this machine fail, the others go through
    fail_migrate_to: Option<usize>,
    /// When set, every pause waits for a permit
    pause_permits: Option<Semaphore>,
    gates: Mutex<HashMap<ExecutionId, Arc<Notify>>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeBackend {
    pub fn new(reconfigurable: bool) -> Self {
        Self {
            reconfigurable,
            fail_migrate: false,
            fail_migrate_to: None,
            pause_permits: None,
            gates: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reconfigurable backend whose migrations always fail
    pub fn failing_migrations() -> Self {
        Self {
            fail_migrate: true,
            ..Self::new(true)
        }
    }

    /// Reconfigurable backend failing every migration step towards `machine`
    pub fn failing_migrations_to(machine: usize) -> Self {
        Self {
            fail_migrate_to: Some(machine),
            ..Self::new(true)
        }
    }

    /// Backend whose pauses hang until [`FakeBackend::release_pauses`]
    pub fn blocking_pauses() -> Self {
        Self {
            pause_permits: Some(Semaphore::new(0)),
            ..Self::new(false)
        }
    }

    /// Let `count` pending or future pauses complete
    pub fn release_pauses(&self, count: usize) {
        if let Some(permits) = &self.pause_permits {
            permits.add_permits(count);
        }
    }

    fn gate(&self, id: ExecutionId) -> Arc<Notify> {
        self.gates
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Let execution `id` complete, now or as soon as it starts
    pub fn finish(&self, id: ExecutionId) {
        self.gate(id).notify_one();
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn paused(&self) -> Vec<(ExecutionId, Slot)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Pause(id, slot) => Some((id, slot)),
                _ => None,
            })
            .collect()
    }

    pub fn resumed(&self) -> Vec<(ExecutionId, Slot)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Resume(id, slot) => Some((id, slot)),
                _ => None,
            })
            .collect()
    }

    pub fn migrations(&self) -> Vec<Vec<MigrationStep>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Migrate(steps) => Some(steps),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn provision(&self, id: ExecutionId, _placement: &[Slot]) -> PoncosResult<()> {
        self.record(Call::Provision(id));
        Ok(())
    }

    async fn teardown(&self, id: ExecutionId) -> PoncosResult<()> {
        self.record(Call::Teardown(id));
        Ok(())
    }

    async fn build_command(
        &self,
        job: &Job,
        id: ExecutionId,
        _placement: &[Slot],
    ) -> PoncosResult<String> {
        Ok(format!("{} #{}", job.command, id))
    }

    async fn run(&self, id: ExecutionId, _command: &str) -> PoncosResult<RunOutcome> {
        self.gate(id).notified().await;
        Ok(RunOutcome {
            exit_code: Some(0),
            success: true,
        })
    }

    async fn pause(&self, id: ExecutionId, slot: Slot) -> PoncosResult<()> {
        self.record(Call::Pause(id, slot));
        if let Some(permits) = &self.pause_permits {
            permits.acquire().await.unwrap().forget();
        }
        Ok(())
    }

    async fn resume(&self, id: ExecutionId, slot: Slot) -> PoncosResult<()> {
        self.record(Call::Resume(id, slot));
        Ok(())
    }

    fn supports_reconfiguration(&self) -> bool {
        self.reconfigurable
    }

    async fn migrate(&self, steps: &[MigrationStep]) -> PoncosResult<Vec<PoncosResult<()>>> {
        self.record(Call::Migrate(steps.to_vec()));
        if self.fail_migrate {
            return Err(PoncosError::Timeout {
                operation: "migrate".to_string(),
                secs: 1,
            });
        }
        Ok(steps
            .iter()
            .map(|step| match self.fail_migrate_to {
                Some(machine) if step.destination.machine == machine => Err(
                    PoncosError::Runtime(format!("guest swap to machine {} refused", machine)),
                ),
                _ => Ok(()),
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Probe answering a fixed utilization per machine
pub struct FakeProbe {
    per_machine: Mutex<HashMap<usize, f64>>,
    measured: Mutex<Vec<Vec<Slot>>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self {
            per_machine: Mutex::new(HashMap::new()),
            measured: Mutex::new(Vec::new()),
        }
    }

    /// Report `value` for every slot of `machine` from now on
    pub fn set(&self, machine: usize, value: f64) {
        self.per_machine.lock().unwrap().insert(machine, value);
    }

    /// Placements measured so far
    pub fn measured(&self) -> Vec<Vec<Slot>> {
        self.measured.lock().unwrap().clone()
    }
}

#[async_trait]
impl Probe for FakeProbe {
    async fn measure(&self, placement: &[Slot]) -> PoncosResult<Vec<f64>> {
        self.measured.lock().unwrap().push(placement.to_vec());
        let values = self.per_machine.lock().unwrap();
        Ok(placement
            .iter()
            .map(|s| values.get(&s.machine).copied().unwrap_or(0.0))
            .collect())
    }
}
