//! Co-scheduling policy
//!
//! Jobs are admitted in queue order. With the co-scheduling policy every job
//! gets one slot per machine, runs for a warm-up period, is measured while its
//! co-runners are frozen and is then rebalanced until no machine it uses is
//! overloaded. The exclusive policy hands out whole machines and never measures.

use poncos_core::{
    ExecutionId, Job, JobQueue, MembwUtil, PoncosError, PoncosResult, SchedulerConfig,
    SchedulingPolicy, Slot,
};
use poncos_network::Probe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::controller::{Controller, ExecutionState};
use crate::placement::{
    check_overload, exclusive_placement, find_swap_candidates, first_fit_placement,
    generate_new_placement, has_co_runner,
};

/// Zero the bandwidth recorded for a completed execution
fn command_done(id: ExecutionId, placement: &[Slot], membw: &mut MembwUtil) {
    for slot in placement {
        membw.reset(*slot);
    }
    debug!(execution_id = %id, "Cleared bandwidth utilization");
}

/// Queue consumer driving the controller
pub struct CoScheduler {
    controller: Arc<Controller>,
    probe: Arc<dyn Probe>,
    policy: SchedulingPolicy,
    threshold: f64,
    warmup: Duration,
}

impl CoScheduler {
    pub fn new(
        controller: Arc<Controller>,
        probe: Arc<dyn Probe>,
        config: &SchedulerConfig,
    ) -> PoncosResult<Self> {
        if config.policy == SchedulingPolicy::Coschedule && controller.slots_per_machine() != 2 {
            return Err(PoncosError::Config(format!(
                "Co-scheduling needs exactly 2 slots per machine, got {}",
                controller.slots_per_machine()
            )));
        }
        if !(config.threshold > 0.0 && config.threshold <= 2.0) {
            return Err(PoncosError::Config(format!(
                "Overload threshold must be in (0, 2], got {}",
                config.threshold
            )));
        }

        Ok(Self {
            controller,
            probe,
            policy: config.policy,
            threshold: config.threshold,
            warmup: Duration::from_secs(config.warmup_secs),
        })
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Largest job the active policy can ever admit
    pub fn max_job_cores(&self) -> usize {
        let machines = self.controller.machine_count();
        let slot_size = self.controller.slot_size();
        match self.policy {
            SchedulingPolicy::Coschedule => machines * slot_size,
            SchedulingPolicy::Exclusive => {
                machines * self.controller.slots_per_machine() * slot_size
            }
        }
    }

    /// Prepare the execution environment
    pub async fn init(&self) -> PoncosResult<()> {
        self.controller.init().await
    }

    /// Tear the execution environment down
    pub async fn dismantle(&self) -> PoncosResult<()> {
        self.controller.dismantle().await
    }

    /// Run every job of `queue` and wait for all of them to complete.
    ///
    /// Returns the execution ids in queue order.
    pub async fn schedule(&self, queue: &JobQueue) -> PoncosResult<Vec<ExecutionId>> {
        queue.validate(self.max_job_cores())?;
        info!(
            title = %queue.title,
            jobs = queue.len(),
            policy = ?self.policy,
            threshold = self.threshold,
            "Scheduling job queue"
        );

        let mut ids = Vec::with_capacity(queue.len());
        for job in &queue.jobs {
            let id = match self.policy {
                SchedulingPolicy::Coschedule => self.coschedule(job.clone()).await?,
                SchedulingPolicy::Exclusive => self.run_exclusive(job.clone()).await,
            };
            ids.push(id);
        }

        self.controller.done().await?;
        info!(jobs = ids.len(), "Job queue completed");
        Ok(ids)
    }

    async fn coschedule(&self, job: Job) -> PoncosResult<ExecutionId> {
        let required = job.required_cores();
        let slot_size = self.controller.slot_size();

        let id = {
            let mut lock = self.controller.wait_for_resource(required, 1).await;
            let placement = first_fit_placement(lock.usage(), slot_size, required)
                .unwrap_or_else(|| panic!("admitted {} but no placement holds it", job));
            info!(job = %job, placement = ?placement, "Starting job");
            self.controller
                .allocate(&mut lock, job, placement, Box::new(command_done))
        };

        if !self.warmup.is_zero() {
            debug!(execution_id = %id, warmup = ?self.warmup, "Waiting for the job to settle");
            tokio::time::sleep(self.warmup).await;
        }

        self.measure(id).await?;
        self.rebalance(id).await;
        Ok(id)
    }

    async fn run_exclusive(&self, job: Job) -> ExecutionId {
        let required = job.required_cores();
        let slots = self.controller.slots_per_machine();
        let slot_size = self.controller.slot_size();

        let mut lock = self.controller.wait_for_resource(required, slots).await;
        let placement = exclusive_placement(lock.usage(), slot_size, required)
            .unwrap_or_else(|| panic!("admitted {} but no machines hold it", job));
        info!(job = %job, placement = ?placement, "Starting job on dedicated machines");
        self.controller
            .allocate(&mut lock, job, placement, Box::new(command_done))
    }

    /// Measure the bandwidth execution `id` uses on its own.
    ///
    /// Co-runners are frozen during the measurement, which is run on the
    /// opposing slots and stored at the execution's slots. A failed
    /// measurement is stored as zero.
    async fn measure(&self, id: ExecutionId) -> PoncosResult<()> {
        let opposing = self.controller.opposing_placement(id).await?;

        if let Err(e) = self.controller.freeze_opposing(id).await {
            warn!(execution_id = %id, error = %e, "Failed to freeze co-runners");
        }

        let values = match self.probe.measure(&opposing).await {
            Ok(values) => values,
            Err(e) => {
                warn!(execution_id = %id, error = %e, "Bandwidth measurement failed");
                vec![0.0; opposing.len()]
            }
        };
        if let Err(e) = self.controller.record_utilization(id, &values).await {
            warn!(execution_id = %id, error = %e, "Discarding bandwidth measurement");
        }

        if let Err(e) = self.controller.thaw_opposing(id).await {
            error!(execution_id = %id, error = %e, "Failed to thaw co-runners");
        }
        Ok(())
    }

    /// Resolve overloaded machines of execution `id` by swapping it away or
    /// by freezing it until a co-runner completes.
    async fn rebalance(&self, id: ExecutionId) {
        let mut frozen = false;

        loop {
            let mut listener = self.controller.subscribe();
            let view = match self.controller.view(id).await {
                Ok(view) => view,
                Err(e) => {
                    error!(execution_id = %id, error = %e, "Lost track of execution");
                    return;
                }
            };
            if view.state == ExecutionState::Completed {
                debug!(execution_id = %id, "Execution completed during rebalancing");
                break;
            }

            let marked = check_overload(&view.placement, &view.membw, self.threshold);
            if marked.is_empty() {
                info!(execution_id = %id, "Placement is not overloaded");
                break;
            }
            for machine in &marked {
                info!(
                    execution_id = %id,
                    machine = machine,
                    utilization = view.membw.machine_total(*machine),
                    threshold = self.threshold,
                    "Machine overloaded"
                );
            }

            // Waiting only helps if someone else on those machines can finish
            if !marked
                .iter()
                .any(|m| has_co_runner(&view.usage, *m, id))
            {
                warn!(
                    execution_id = %id,
                    "Execution overloads its machines on its own, keeping it running"
                );
                break;
            }

            if self.controller.supports_reconfiguration() {
                let candidates =
                    find_swap_candidates(&marked, &view.placement, &view.membw, self.threshold);
                let new_placement = if candidates.is_empty() {
                    debug!(execution_id = %id, "No feasible swap candidates");
                    Vec::new()
                } else {
                    generate_new_placement(
                        &view.placement,
                        &marked,
                        &candidates,
                        &view.membw,
                        &view.usage,
                    )
                };

                if !new_placement.is_empty() {
                    if frozen {
                        match self.controller.thaw(id).await {
                            Ok(()) => frozen = false,
                            Err(e) => warn!(execution_id = %id, error = %e, "Failed to thaw"),
                        }
                    }

                    match self.controller.update_config(id, new_placement).await {
                        Ok(swaps) => {
                            info!(execution_id = %id, swaps = ?swaps, "Resolved overload by migration");
                            break;
                        }
                        Err(e) => {
                            warn!(
                                execution_id = %id,
                                error = %e,
                                recoverable = e.is_recoverable(),
                                "Migration failed, falling back to freezing"
                            );
                        }
                    }
                }
            }

            if !frozen {
                match self.controller.freeze(id).await {
                    Ok(()) => frozen = true,
                    Err(e) => warn!(execution_id = %id, error = %e, "Failed to freeze"),
                }
            }

            debug!(execution_id = %id, frozen, "Waiting for a change");
            self.controller.wait_for_change(&mut listener).await;
        }

        if frozen {
            match self.controller.is_completed(id).await {
                Ok(true) => {}
                _ => {
                    if let Err(e) = self.controller.thaw(id).await {
                        error!(execution_id = %id, error = %e, "Failed to thaw");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{two_slot_system, FakeBackend, FakeProbe};
    use poncos_core::SystemConfig;

    fn setup(
        machines: usize,
        backend: Arc<FakeBackend>,
        probe: Arc<FakeProbe>,
        policy: SchedulingPolicy,
    ) -> Arc<CoScheduler> {
        let controller = Arc::new(Controller::new(
            backend,
            (0..machines).map(|m| format!("node{:02}", m)).collect(),
            two_slot_system(4),
        ));
        let config = SchedulerConfig {
            policy,
            threshold: 0.9,
            warmup_secs: 0,
        };
        Arc::new(CoScheduler::new(controller, probe, &config).unwrap())
    }

    async fn until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn until_state(scheduler: &CoScheduler, id: ExecutionId, state: ExecutionState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if scheduler.controller().state_of(id).await.ok() == Some(state) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("state not reached");
    }

    async fn until_placement(scheduler: &CoScheduler, id: ExecutionId, placement: Vec<Slot>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if scheduler.controller().placement_of(id).await.ok().as_ref() == Some(&placement) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("placement not reached");
    }

    fn run(
        scheduler: &Arc<CoScheduler>,
        jobs: Vec<Job>,
    ) -> tokio::task::JoinHandle<PoncosResult<Vec<ExecutionId>>> {
        let scheduler = Arc::clone(scheduler);
        tokio::spawn(async move { scheduler.schedule(&JobQueue::new(jobs)).await })
    }

    const A: ExecutionId = ExecutionId(0);
    const B: ExecutionId = ExecutionId(1);

    #[tokio::test]
    async fn test_jobs_share_machines_when_bandwidth_allows() {
        let backend = Arc::new(FakeBackend::new(false));
        let probe = Arc::new(FakeProbe::new());
        probe.set(0, 0.3);
        probe.set(1, 0.3);
        let scheduler = setup(2, backend.clone(), probe.clone(), SchedulingPolicy::Coschedule);

        let handle = run(&scheduler, vec![Job::new(8, "./a"), Job::new(8, "./b")]);

        // B's measurement froze and thawed A
        until(|| backend.resumed().len() == 2).await;
        backend.finish(A);
        backend.finish(B);
        assert_eq!(handle.await.unwrap().unwrap(), vec![A, B]);

        let controller = scheduler.controller();
        assert_eq!(
            controller.placement_of(A).await.unwrap(),
            vec![Slot::new(0, 0), Slot::new(1, 0)]
        );
        assert_eq!(
            controller.placement_of(B).await.unwrap(),
            vec![Slot::new(0, 1), Slot::new(1, 1)]
        );

        let a_slots = vec![(A, Slot::new(0, 0)), (A, Slot::new(1, 0))];
        assert_eq!(backend.paused(), a_slots);
        assert_eq!(backend.resumed(), a_slots);

        // Measured on the opposing slots
        assert_eq!(
            probe.measured(),
            vec![
                vec![Slot::new(0, 1), Slot::new(1, 1)],
                vec![Slot::new(0, 0), Slot::new(1, 0)],
            ]
        );
        assert!(controller.usage_snapshot().await.all_free());
        assert_eq!(controller.membw_snapshot().await, MembwUtil::new(2, 2));
    }

    #[tokio::test]
    async fn test_overloaded_pair_runs_one_at_a_time() {
        let backend = Arc::new(FakeBackend::new(false));
        let probe = Arc::new(FakeProbe::new());
        probe.set(0, 0.5);
        let scheduler = setup(1, backend.clone(), probe, SchedulingPolicy::Coschedule);

        let handle = run(&scheduler, vec![Job::new(4, "./a"), Job::new(4, "./b")]);

        until_state(&scheduler, B, ExecutionState::Frozen).await;
        assert!(backend.paused().contains(&(B, Slot::new(0, 1))));
        assert!(!backend.resumed().contains(&(B, Slot::new(0, 1))));

        backend.finish(A);
        until_state(&scheduler, B, ExecutionState::Running).await;
        assert!(backend.resumed().contains(&(B, Slot::new(0, 1))));

        backend.finish(B);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_overload_resolved_by_migration() {
        let backend = Arc::new(FakeBackend::new(true));
        let probe = Arc::new(FakeProbe::new());
        probe.set(0, 0.5);
        probe.set(1, 0.3);
        let scheduler = setup(4, backend.clone(), probe, SchedulingPolicy::Coschedule);

        let handle = run(&scheduler, vec![Job::new(8, "./a"), Job::new(4, "./b")]);

        until_placement(&scheduler, B, vec![Slot::new(2, 0)]).await;
        let controller = scheduler.controller();
        assert_eq!(controller.state_of(B).await.unwrap(), ExecutionState::Running);

        let steps = &backend.migrations()[0];
        assert_eq!(steps[0].source, Slot::new(0, 1));
        assert_eq!(steps[0].destination, Slot::new(2, 0));
        assert_eq!(steps[0].displaced, None);

        let membw = controller.membw_snapshot().await;
        assert_eq!(membw.get(Slot::new(2, 0)), 0.5);
        assert_eq!(membw.get(Slot::new(0, 1)), 0.0);
        // Never frozen
        assert!(backend.paused().iter().all(|(id, _)| *id != B));

        backend.finish(A);
        backend.finish(B);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_migration_falls_back_to_freezing() {
        let backend = Arc::new(FakeBackend::failing_migrations());
        let probe = Arc::new(FakeProbe::new());
        probe.set(0, 0.5);
        probe.set(1, 0.3);
        let scheduler = setup(4, backend.clone(), probe, SchedulingPolicy::Coschedule);

        let handle = run(&scheduler, vec![Job::new(8, "./a"), Job::new(4, "./b")]);

        until_state(&scheduler, B, ExecutionState::Frozen).await;
        assert_eq!(backend.migrations().len(), 1);
        assert_eq!(
            scheduler.controller().placement_of(B).await.unwrap(),
            vec![Slot::new(0, 1)]
        );

        backend.finish(A);
        until_state(&scheduler, B, ExecutionState::Running).await;

        backend.finish(B);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lone_heavy_job_keeps_running() {
        let backend = Arc::new(FakeBackend::new(false));
        let probe = Arc::new(FakeProbe::new());
        probe.set(0, 0.95);
        let scheduler = setup(1, backend.clone(), probe, SchedulingPolicy::Coschedule);

        backend.finish(A);
        let ids = run(&scheduler, vec![Job::new(4, "./a")]).await.unwrap().unwrap();

        assert_eq!(ids, vec![A]);
        assert!(backend.paused().is_empty());
    }

    #[tokio::test]
    async fn test_exclusive_policy_uses_whole_machines() {
        let backend = Arc::new(FakeBackend::new(false));
        let probe = Arc::new(FakeProbe::new());
        let scheduler = setup(2, backend.clone(), probe.clone(), SchedulingPolicy::Exclusive);

        let jobs = vec![Job::new(8, "./a"), Job::new(6, "./b"), Job::new(16, "./c")];
        let handle = run(&scheduler, jobs);

        until(|| backend.calls().len() >= 2).await;
        backend.finish(A);
        backend.finish(B);
        backend.finish(ExecutionId(2));
        assert_eq!(handle.await.unwrap().unwrap().len(), 3);

        let controller = scheduler.controller();
        assert_eq!(
            controller.placement_of(A).await.unwrap(),
            vec![Slot::new(0, 0), Slot::new(0, 1)]
        );
        assert_eq!(controller.placement_of(ExecutionId(2)).await.unwrap().len(), 4);
        assert!(probe.measured().is_empty());
        assert!(backend.paused().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_job_that_never_fits() {
        let backend = Arc::new(FakeBackend::new(false));
        let probe = Arc::new(FakeProbe::new());
        let scheduler = setup(2, backend.clone(), probe, SchedulingPolicy::Coschedule);

        // Co-scheduled jobs get one slot per machine: 8 cores at most
        let err = scheduler
            .schedule(&JobQueue::new(vec![Job::new(12, "./big")]))
            .await
            .unwrap_err();
        assert!(matches!(err, PoncosError::InvalidJob(_)));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_coscheduling_needs_two_slots() {
        let slot = |cpu: u32| poncos_core::SlotDescriptor::new(vec![cpu], vec![0]);
        let system = SystemConfig::new(vec![slot(0), slot(1), slot(2)]).unwrap();
        let controller = Arc::new(Controller::new(
            Arc::new(FakeBackend::new(false)),
            vec!["node00".to_string()],
            system,
        ));

        let config = SchedulerConfig::default();
        let result = CoScheduler::new(Arc::clone(&controller), Arc::new(FakeProbe::new()), &config);
        assert!(matches!(result, Err(PoncosError::Config(_))));

        let config = SchedulerConfig {
            policy: SchedulingPolicy::Exclusive,
            ..SchedulerConfig::default()
        };
        assert!(CoScheduler::new(controller, Arc::new(FakeProbe::new()), &config).is_ok());
    }
}
