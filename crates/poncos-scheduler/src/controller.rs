//! Slot accounting and execution lifecycle
//!
//! The controller owns the occupancy table, the bandwidth matrix and the
//! bookkeeping of every execution behind one lock. Changes are broadcast on a
//! watch channel so waiters can re-check their condition. Backend calls are
//! never made while the lock is held.

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use poncos_core::{
    opposing_placement, ExecutionId, Job, MachineUsage, MembwUtil, Placement, PoncosError,
    PoncosResult, Slot, SystemConfig,
};
use poncos_runtime::{Backend, MigrationStep, RunOutcome};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Called once an execution has completed, with the lock held.
///
/// Receives the execution's final placement and the bandwidth matrix.
pub type CompletionCallback = Box<dyn FnOnce(ExecutionId, &[Slot], &mut MembwUtil) + Send>;

/// Lifecycle state of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Running,
    Frozen,
    Completed,
}

struct ExecutionRecord {
    job: Job,
    placement: Placement,
    state: ExecutionState,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    outcome: Option<RunOutcome>,
    handle: Option<JoinHandle<()>>,
}

struct UsageState {
    usage: MachineUsage,
    membw: MembwUtil,
    /// Indexed by execution id, never shrinks
    executions: Vec<ExecutionRecord>,
}

impl UsageState {
    fn record(&self, id: ExecutionId) -> PoncosResult<&ExecutionRecord> {
        self.executions
            .get(id.index())
            .ok_or_else(|| PoncosError::Scheduler(format!("Unknown execution {}", id)))
    }

    fn record_mut(&mut self, id: ExecutionId) -> PoncosResult<&mut ExecutionRecord> {
        self.executions
            .get_mut(id.index())
            .ok_or_else(|| PoncosError::Scheduler(format!("Unknown execution {}", id)))
    }

    /// Exchange whatever lives in `a` and `b`: occupancy, bandwidth and the
    /// matching placement entries of both occupants.
    fn commit_swap(&mut self, a: Slot, b: Slot) {
        let occupants = [(self.usage.get(a), a, b), (self.usage.get(b), b, a)];
        self.usage.swap(a, b);
        self.membw.swap(a, b);

        for (occupant, from, to) in occupants {
            let Some(other) = occupant else { continue };
            let placement = &mut self.executions[other.index()].placement;
            let position = placement.iter().position(|s| *s == from).unwrap_or_else(|| {
                panic!(
                    "slot {} held by execution {} but missing from its placement {:?}",
                    from, other, placement
                )
            });
            placement[position] = to;
        }
    }

    /// Panics if the occupancy table, the placements and the bandwidth
    /// matrix disagree.
    fn assert_consistent(&self) {
        for (slot, id) in self.usage.occupied() {
            let record = self.executions.get(id.index()).unwrap_or_else(|| {
                panic!("slot {} held by unknown execution {}", slot, id)
            });
            assert!(
                record.state != ExecutionState::Completed,
                "slot {} still held by completed execution {}",
                slot,
                id
            );
            assert!(
                record.placement.contains(&slot),
                "slot {} held by execution {} but missing from its placement {:?}",
                slot,
                id,
                record.placement
            );
        }

        for (index, record) in self.executions.iter().enumerate() {
            if record.state == ExecutionState::Completed {
                continue;
            }
            for (position, slot) in record.placement.iter().enumerate() {
                let occupant = self.usage.get(*slot);
                assert!(
                    occupant == Some(ExecutionId(index as u64)),
                    "execution {} placed on slot {} but the slot holds {:?}",
                    index,
                    slot,
                    occupant
                );
                assert!(
                    !record.placement[..position].contains(slot),
                    "execution {} lists slot {} twice",
                    index,
                    slot
                );
            }
        }

        for machine in 0..self.usage.machine_count() {
            for (s, occupant) in self.usage.machine(machine).iter().enumerate() {
                let value = self.membw.get(Slot::new(machine, s));
                assert!(
                    occupant.is_some() || value == 0.0,
                    "empty slot {} carries bandwidth utilization {}",
                    Slot::new(machine, s),
                    value
                );
            }
        }
    }
}

/// Exclusive access to the allocation state, handed out by
/// [`Controller::wait_for_resource`] and [`Controller::lock`].
pub struct AllocationLock<'a> {
    guard: MutexGuard<'a, UsageState>,
}

impl AllocationLock<'_> {
    pub fn usage(&self) -> &MachineUsage {
        &self.guard.usage
    }

    pub fn membw(&self) -> &MembwUtil {
        &self.guard.membw
    }
}

/// Receiver of change notifications, see [`Controller::wait_for_change`]
pub struct ChangeListener {
    changes: watch::Receiver<u64>,
}

/// Point in time view of one execution and the matrices around it
#[derive(Debug, Clone)]
pub struct ExecutionView {
    pub id: ExecutionId,
    pub job: Job,
    pub placement: Placement,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub usage: MachineUsage,
    pub membw: MembwUtil,
}

struct Shared {
    backend: Arc<dyn Backend>,
    state: Mutex<UsageState>,
    changes: watch::Sender<u64>,
}

impl Shared {
    fn publish(&self) {
        self.changes.send_modify(|epoch| *epoch += 1);
    }
}

/// Resource controller: allocation, freeze/thaw and reconfiguration
pub struct Controller {
    shared: Arc<Shared>,
    machines: Vec<String>,
    system: SystemConfig,
}

impl Controller {
    /// Create a controller for `machines`, each split as described by `system`
    pub fn new(backend: Arc<dyn Backend>, machines: Vec<String>, system: SystemConfig) -> Self {
        let slots = system.slot_count();
        info!(
            backend = backend.name(),
            machines = machines.len(),
            slots_per_machine = slots,
            slot_size = system.slot_size(),
            "Controller initialized"
        );

        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                backend,
                state: Mutex::new(UsageState {
                    usage: MachineUsage::new(machines.len(), slots),
                    membw: MembwUtil::new(machines.len(), slots),
                    executions: Vec::new(),
                }),
                changes,
            }),
            machines,
            system,
        }
    }

    pub fn machines(&self) -> &[String] {
        &self.machines
    }

    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    pub fn slots_per_machine(&self) -> usize {
        self.system.slot_count()
    }

    /// Cores per slot
    pub fn slot_size(&self) -> usize {
        self.system.slot_size()
    }

    pub fn total_slots(&self) -> usize {
        self.machine_count() * self.slots_per_machine()
    }

    pub fn system(&self) -> &SystemConfig {
        &self.system
    }

    pub fn backend_name(&self) -> &'static str {
        self.shared.backend.name()
    }

    pub fn supports_reconfiguration(&self) -> bool {
        self.shared.backend.supports_reconfiguration()
    }

    /// Prepare the backend before the first job
    pub async fn init(&self) -> PoncosResult<()> {
        info!(backend = self.backend_name(), "Initializing backend");
        self.shared.backend.init().await
    }

    /// Tear the backend down after the last job
    pub async fn dismantle(&self) -> PoncosResult<()> {
        info!(backend = self.backend_name(), "Dismantling backend");
        self.shared.backend.dismantle().await
    }

    /// Take the allocation lock without waiting for capacity
    pub async fn lock(&self) -> AllocationLock<'_> {
        AllocationLock {
            guard: self.shared.state.lock().await,
        }
    }

    /// Start listening for changes. Changes published after this call are
    /// never missed by [`Controller::wait_for_change`].
    pub fn subscribe(&self) -> ChangeListener {
        ChangeListener {
            changes: self.shared.changes.subscribe(),
        }
    }

    /// Wait until something changed since `listener` last saw the state
    pub async fn wait_for_change(&self, listener: &mut ChangeListener) {
        // The sender lives as long as `self`
        let _ = listener.changes.changed().await;
    }

    /// Block until `required_cores` are free, counting a machine only if at
    /// least `slots_per_host` of its slots are free.
    ///
    /// Returns with the allocation lock held.
    pub async fn wait_for_resource(
        &self,
        required_cores: usize,
        slots_per_host: usize,
    ) -> AllocationLock<'_> {
        let slot_size = self.slot_size();
        let mut listener = self.subscribe();
        loop {
            let lock = self.lock().await;
            let free = lock
                .usage()
                .free_cores_considering_slots_per_host(slot_size, slots_per_host);
            if free >= required_cores {
                debug!(required_cores, slots_per_host, free, "Resources available");
                return lock;
            }
            drop(lock);

            debug!(required_cores, slots_per_host, free, "Waiting for resources");
            self.wait_for_change(&mut listener).await;
        }
    }

    /// Start `job` on `placement` and return immediately.
    ///
    /// The execution is provisioned, launched and torn down in the background.
    /// On completion its slots are freed, `on_done` runs with the lock held and
    /// waiters are notified.
    ///
    /// # Panics
    ///
    /// If `placement` is empty, too small for the job or touches an occupied slot.
    pub fn allocate(
        &self,
        lock: &mut AllocationLock<'_>,
        job: Job,
        placement: Placement,
        on_done: CompletionCallback,
    ) -> ExecutionId {
        let state = &mut *lock.guard;
        assert!(!placement.is_empty(), "empty placement for {}", job);
        assert!(
            placement.len() * self.slot_size() >= job.required_cores(),
            "placement {:?} too small for {}",
            placement,
            job
        );

        let id = ExecutionId(state.executions.len() as u64);
        for slot in &placement {
            let occupant = state.usage.get(*slot);
            assert!(
                occupant.is_none(),
                "execution {} allocated on slot {} held by {:?}",
                id,
                slot,
                occupant
            );
            state.usage.set(*slot, Some(id));
        }

        info!(
            execution_id = %id,
            job = %job,
            placement = ?placement,
            "Allocated execution"
        );

        state.executions.push(ExecutionRecord {
            job: job.clone(),
            placement: placement.clone(),
            state: ExecutionState::Running,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            handle: None,
        });

        let handle = tokio::spawn(run_execution(
            Arc::clone(&self.shared),
            id,
            job,
            placement,
            on_done,
        ));
        state.executions[id.index()].handle = Some(handle);

        state.assert_consistent();
        self.shared.publish();
        id
    }

    /// Wait for execution `id` to complete
    pub async fn wait_for_completion_of(&self, id: ExecutionId) -> PoncosResult<()> {
        let mut listener = self.subscribe();
        let handle = self.shared.state.lock().await.record_mut(id)?.handle.take();
        if let Some(handle) = handle {
            return join_execution(id, handle).await;
        }

        // Someone else is joining it
        loop {
            if self.is_completed(id).await? {
                return Ok(());
            }
            self.wait_for_change(&mut listener).await;
        }
    }

    /// Wait until every execution has completed and every slot is free
    pub async fn done(&self) -> PoncosResult<()> {
        let mut listener = self.subscribe();
        let handles: Vec<(ExecutionId, JoinHandle<()>)> = {
            let mut state = self.shared.state.lock().await;
            state
                .executions
                .iter_mut()
                .enumerate()
                .filter_map(|(i, r)| r.handle.take().map(|h| (ExecutionId(i as u64), h)))
                .collect()
        };

        for (id, handle) in handles {
            join_execution(id, handle).await?;
        }

        loop {
            if self.shared.state.lock().await.usage.all_free() {
                info!("All executions completed");
                return Ok(());
            }
            self.wait_for_change(&mut listener).await;
        }
    }

    /// Current placement of execution `id`
    pub async fn placement_of(&self, id: ExecutionId) -> PoncosResult<Placement> {
        Ok(self.shared.state.lock().await.record(id)?.placement.clone())
    }

    pub async fn state_of(&self, id: ExecutionId) -> PoncosResult<ExecutionState> {
        Ok(self.shared.state.lock().await.record(id)?.state)
    }

    pub async fn is_completed(&self, id: ExecutionId) -> PoncosResult<bool> {
        Ok(self.state_of(id).await? == ExecutionState::Completed)
    }

    /// Consistent snapshot of execution `id` and both matrices
    pub async fn view(&self, id: ExecutionId) -> PoncosResult<ExecutionView> {
        let state = self.shared.state.lock().await;
        let record = state.record(id)?;
        Ok(ExecutionView {
            id,
            job: record.job.clone(),
            placement: record.placement.clone(),
            state: record.state,
            started_at: record.started_at,
            finished_at: record.finished_at,
            outcome: record.outcome,
            usage: state.usage.clone(),
            membw: state.membw.clone(),
        })
    }

    /// Snapshot of every execution so far, in id order
    pub async fn executions(&self) -> Vec<ExecutionView> {
        let state = self.shared.state.lock().await;
        state
            .executions
            .iter()
            .enumerate()
            .map(|(i, record)| ExecutionView {
                id: ExecutionId(i as u64),
                job: record.job.clone(),
                placement: record.placement.clone(),
                state: record.state,
                started_at: record.started_at,
                finished_at: record.finished_at,
                outcome: record.outcome,
                usage: state.usage.clone(),
                membw: state.membw.clone(),
            })
            .collect()
    }

    pub async fn usage_snapshot(&self) -> MachineUsage {
        self.shared.state.lock().await.usage.clone()
    }

    pub async fn membw_snapshot(&self) -> MembwUtil {
        self.shared.state.lock().await.membw.clone()
    }

    /// Store measured utilization at the current slots of execution `id`,
    /// one value per slot. Ignored once the execution has completed.
    pub async fn record_utilization(&self, id: ExecutionId, values: &[f64]) -> PoncosResult<()> {
        let mut state = self.shared.state.lock().await;
        let record = state.record(id)?;
        if record.state == ExecutionState::Completed {
            debug!(execution_id = %id, "Execution completed before its measurement was stored");
            return Ok(());
        }
        if values.len() != record.placement.len() {
            return Err(PoncosError::Probe(format!(
                "{} values for {} slots of execution {}",
                values.len(),
                record.placement.len(),
                id
            )));
        }

        let placement = record.placement.clone();
        for (slot, value) in placement.iter().zip(values) {
            info!(
                execution_id = %id,
                machine = slot.machine,
                slot = slot.slot,
                utilization = *value,
                "Recorded bandwidth utilization"
            );
            state.membw.set(*slot, *value);
        }
        state.assert_consistent();
        Ok(())
    }

    /// Slots co-resident with every slot of execution `id`.
    ///
    /// Only defined for two slots per machine.
    pub async fn opposing_placement(&self, id: ExecutionId) -> PoncosResult<Placement> {
        let slots = self.slots_per_machine();
        if slots != 2 {
            return Err(PoncosError::Unsupported(format!(
                "Opposing slots need 2 slots per machine, got {}",
                slots
            )));
        }
        Ok(opposing_placement(&self.placement_of(id).await?, slots))
    }

    async fn pause_all(&self, targets: &[(ExecutionId, Slot)]) -> PoncosResult<()> {
        let backend = &self.shared.backend;
        try_join_all(targets.iter().map(|(id, slot)| backend.pause(*id, *slot))).await?;
        Ok(())
    }

    async fn resume_all(&self, targets: &[(ExecutionId, Slot)]) -> PoncosResult<()> {
        let backend = &self.shared.backend;
        try_join_all(targets.iter().map(|(id, slot)| backend.resume(*id, *slot))).await?;
        Ok(())
    }

    async fn set_state(&self, id: ExecutionId, new_state: ExecutionState) -> PoncosResult<()> {
        let mut state = self.shared.state.lock().await;
        let record = state.record_mut(id)?;
        if record.state != ExecutionState::Completed {
            record.state = new_state;
        }
        Ok(())
    }

    /// Pause every slot of execution `id`
    pub async fn freeze(&self, id: ExecutionId) -> PoncosResult<()> {
        let targets: Vec<_> = self
            .placement_of(id)
            .await?
            .into_iter()
            .map(|slot| (id, slot))
            .collect();

        info!(execution_id = %id, "Freezing execution");
        self.pause_all(&targets).await?;
        self.set_state(id, ExecutionState::Frozen).await
    }

    /// Resume every slot of execution `id`
    pub async fn thaw(&self, id: ExecutionId) -> PoncosResult<()> {
        let targets: Vec<_> = self
            .placement_of(id)
            .await?
            .into_iter()
            .map(|slot| (id, slot))
            .collect();

        info!(execution_id = %id, "Thawing execution");
        self.resume_all(&targets).await?;
        self.set_state(id, ExecutionState::Running).await
    }

    /// Occupants of the slots opposing execution `id`
    async fn opposing_occupants(&self, id: ExecutionId) -> PoncosResult<Vec<(ExecutionId, Slot)>> {
        let opposing = self.opposing_placement(id).await?;
        let state = self.shared.state.lock().await;
        Ok(opposing
            .into_iter()
            .filter_map(|slot| state.usage.get(slot).map(|occupant| (occupant, slot)))
            .collect())
    }

    /// Pause whatever runs on the slots opposing execution `id` and mark
    /// those executions frozen
    pub async fn freeze_opposing(&self, id: ExecutionId) -> PoncosResult<()> {
        let targets = self.opposing_occupants(id).await?;
        info!(execution_id = %id, co_runners = ?targets, "Freezing co-runners");
        self.pause_all(&targets).await?;
        for (co_runner, _) in &targets {
            self.set_state(*co_runner, ExecutionState::Frozen).await?;
        }
        Ok(())
    }

    /// Resume whatever runs on the slots opposing execution `id` and mark
    /// those executions running
    pub async fn thaw_opposing(&self, id: ExecutionId) -> PoncosResult<()> {
        let targets = self.opposing_occupants(id).await?;
        info!(execution_id = %id, co_runners = ?targets, "Thawing co-runners");
        self.resume_all(&targets).await?;
        for (co_runner, _) in &targets {
            self.set_state(*co_runner, ExecutionState::Running).await?;
        }
        Ok(())
    }

    /// Move execution `id` to `new_placement`, exchanging slots with whatever
    /// occupies the destinations.
    ///
    /// Entries are paired by position. Pairs on the same machine are left
    /// alone. The backend migrates every cross-machine pair first; then the
    /// occupancy table, both placements and the bandwidth matrix are swapped
    /// for each pair the backend actually moved. Returns the swapped
    /// `(old, new)` slot pairs, or an error naming the pairs that did not
    /// move once the others have been recorded.
    ///
    /// # Panics
    ///
    /// If the placements differ in length, a pair moves within one machine to
    /// another slot, or the displaced execution does not know its own slot.
    pub async fn update_config(
        &self,
        id: ExecutionId,
        new_placement: Placement,
    ) -> PoncosResult<Vec<(Slot, Slot)>> {
        let steps = {
            let state = self.shared.state.lock().await;
            let record = state.record(id)?;
            if record.state == ExecutionState::Completed {
                return Err(PoncosError::Scheduler(format!(
                    "Execution {} already completed",
                    id
                )));
            }
            assert_eq!(
                record.placement.len(),
                new_placement.len(),
                "execution {} cannot move from {:?} to {:?}",
                id,
                record.placement,
                new_placement
            );

            let mut steps = Vec::new();
            for (old_slot, new_slot) in record.placement.iter().zip(&new_placement) {
                if old_slot.machine == new_slot.machine {
                    assert_eq!(
                        old_slot.slot, new_slot.slot,
                        "execution {} cannot move within machine {}",
                        id, old_slot.machine
                    );
                    continue;
                }

                let displaced = state.usage.get(*new_slot);
                let displaced_hook_procs = match displaced {
                    Some(other) => {
                        let other = state.record(other)?;
                        hook_procs(&other.job, other.placement.len())
                    }
                    None => None,
                };
                steps.push(MigrationStep {
                    execution: id,
                    source: *old_slot,
                    destination: *new_slot,
                    hook_procs: hook_procs(&record.job, record.placement.len()),
                    displaced,
                    displaced_hook_procs,
                });
            }
            steps
        };

        if steps.is_empty() {
            debug!(execution_id = %id, "Placement unchanged");
            return Ok(Vec::new());
        }

        info!(execution_id = %id, steps = steps.len(), "Migrating execution");
        let results = self.shared.backend.migrate(&steps).await?;

        let mut state = self.shared.state.lock().await;
        if state.record(id)?.state == ExecutionState::Completed {
            warn!(execution_id = %id, "Execution completed while migrating");
        }

        let mut swaps = Vec::with_capacity(steps.len());
        let mut failures = Vec::new();
        for (step, result) in steps.iter().zip(results) {
            match result {
                Ok(()) => {
                    state.commit_swap(step.source, step.destination);
                    info!(
                        execution_id = %id,
                        from = %step.source,
                        to = %step.destination,
                        displaced = ?step.displaced,
                        "Swapped slots"
                    );
                    swaps.push((step.source, step.destination));
                }
                Err(e) => failures.push(format!("{} -> {}: {}", step.source, step.destination, e)),
            }
        }

        state.assert_consistent();
        drop(state);
        if !swaps.is_empty() {
            self.shared.publish();
        }

        if failures.is_empty() {
            Ok(swaps)
        } else {
            warn!(
                execution_id = %id,
                committed = ?swaps,
                "Migration partly failed, kept the steps that went through"
            );
            Err(PoncosError::Runtime(format!(
                "Migration failed: {}",
                failures.join("; ")
            )))
        }
    }
}

/// Processes per slot announced to the migration hooks of jobs that use them
fn hook_procs(job: &Job, slots: usize) -> Option<usize> {
    job.uses_sr_protocol.then(|| job.nprocs / slots.max(1))
}

async fn launch(
    backend: &dyn Backend,
    id: ExecutionId,
    job: &Job,
    placement: &[Slot],
) -> PoncosResult<RunOutcome> {
    backend.provision(id, placement).await?;
    let command = backend.build_command(job, id, placement).await?;
    backend.run(id, &command).await
}

async fn run_execution(
    shared: Arc<Shared>,
    id: ExecutionId,
    job: Job,
    placement: Placement,
    on_done: CompletionCallback,
) {
    let result = launch(shared.backend.as_ref(), id, &job, &placement).await;
    match &result {
        Ok(outcome) if outcome.success => {
            info!(execution_id = %id, "Execution finished");
        }
        Ok(outcome) => {
            warn!(
                execution_id = %id,
                exit_code = ?outcome.exit_code,
                "Execution finished with failure status, releasing its slots"
            );
        }
        Err(e) => {
            error!(execution_id = %id, error = %e, "Execution failed to run, releasing its slots");
        }
    }

    if let Err(e) = shared.backend.teardown(id).await {
        warn!(execution_id = %id, error = %e, "Teardown failed");
    }

    let mut state = shared.state.lock().await;
    let UsageState {
        usage,
        membw,
        executions,
    } = &mut *state;
    let record = &mut executions[id.index()];

    for slot in &record.placement {
        let occupant = usage.get(*slot);
        assert!(
            occupant == Some(id),
            "completed execution {} placed on slot {} but the slot holds {:?}",
            id,
            slot,
            occupant
        );
        usage.set(*slot, None);
    }
    on_done(id, &record.placement, membw);

    let finished_at = Utc::now();
    record.state = ExecutionState::Completed;
    record.finished_at = Some(finished_at);
    record.outcome = result.ok();

    let runtime = finished_at - record.started_at;
    info!(
        execution_id = %id,
        runtime_secs = runtime.num_milliseconds() as f64 / 1000.0,
        "Execution completed"
    );

    state.assert_consistent();
    shared.publish();
}

async fn join_execution(id: ExecutionId, handle: JoinHandle<()>) -> PoncosResult<()> {
    match handle.await {
        Ok(()) => Ok(()),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(PoncosError::Internal(format!(
            "Execution {} was cancelled: {}",
            id, e
        ))),
    }
}
