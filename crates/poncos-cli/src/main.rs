//! poncos
//!
//! Runs a queue of MPI jobs on a set of machines, co-locating them where
//! their memory bandwidth allows.

use anyhow::{Context, Result};
use clap::Parser;
use poncos_core::{BackendKind, JobQueue, LoggingConfig, PoncosConfig, SystemConfig};
use poncos_network::{AgentChannel, HttpChannel, MembwProbe};
use poncos_runtime::{Backend, CgroupBackend, CgroupBackendConfig, VmBackend};
use poncos_scheduler::{CoScheduler, Controller};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// poncos - memory bandwidth aware co-scheduler for MPI jobs
#[derive(Parser, Debug)]
#[command(name = "poncos")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "poncos.toml")]
    config: PathBuf,

    /// Job queue file
    queue: PathBuf,

    /// Log level, overrides the configuration file
    #[arg(long)]
    log_level: Option<String>,

    /// Show capacity and the validated queue, run nothing
    #[arg(long)]
    dry_run: bool,
}

fn init_logging(config: &LoggingConfig, level: Option<&str>) {
    let level = level.unwrap_or(config.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

fn create_backend(
    config: &PoncosConfig,
    channel: Arc<dyn AgentChannel>,
    machines: Vec<String>,
    system: SystemConfig,
) -> Arc<dyn Backend> {
    let backend = &config.backend;
    match backend.kind {
        BackendKind::Cgroup => Arc::new(CgroupBackend::new(
            channel,
            machines,
            system,
            CgroupBackendConfig {
                wrapper: backend.wrapper.clone(),
                mpiexec: backend.mpiexec.clone(),
                work_dir: backend.work_dir.clone(),
            },
        )),
        BackendKind::Vm => Arc::new(VmBackend::new(
            channel,
            machines,
            system,
            backend.vm_pool.clone(),
            backend.mpiexec.clone(),
            backend.work_dir.clone(),
        )),
    }
}

fn print_plan(scheduler: &CoScheduler, queue: &JobQueue) {
    let controller = scheduler.controller();
    println!("Backend:           {}", controller.backend_name());
    println!("Machines:          {}", controller.machine_count());
    for (index, host) in controller.machines().iter().enumerate() {
        println!("  [{}] {}", index, host);
    }
    println!("Slots per machine: {}", controller.slots_per_machine());
    println!("Cores per slot:    {}", controller.slot_size());
    println!("Total slots:       {}", controller.total_slots());
    println!("Largest job:       {} cores", scheduler.max_job_cores());
    println!();

    if !queue.title.is_empty() {
        println!("Queue: {}", queue.title);
    }
    println!("{:<4} {:>6} {:>8} {:>6}  COMMAND", "#", "PROCS", "THREADS", "CORES");
    for (position, job) in queue.jobs.iter().enumerate() {
        println!(
            "{:<4} {:>6} {:>8} {:>6}  {}",
            position,
            job.nprocs,
            job.threads_per_proc,
            job.required_cores(),
            job.command
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = PoncosConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    config.validate()?;

    init_logging(&config.logging, args.log_level.as_deref());
    info!("Starting poncos v{}", env!("CARGO_PKG_VERSION"));

    let machines = config.machines.load()?;
    let system = config.system.resolve()?;
    let queue = JobQueue::from_file(&args.queue)
        .with_context(|| format!("Failed to load {}", args.queue.display()))?;

    let channel: Arc<dyn AgentChannel> = Arc::new(HttpChannel::new(&config.network)?);
    let backend = create_backend(&config, Arc::clone(&channel), machines.clone(), system.clone());
    let controller = Arc::new(Controller::new(backend, machines.clone(), system.clone()));
    let probe = Arc::new(MembwProbe::new(channel, machines, system));
    let scheduler = CoScheduler::new(controller, probe, &config.scheduler)?;

    if args.dry_run {
        queue.validate(scheduler.max_job_cores())?;
        print_plan(&scheduler, &queue);
        return Ok(());
    }

    let started = Instant::now();
    scheduler
        .init()
        .await
        .context("Failed to initialize the backend")?;

    let result = scheduler.schedule(&queue).await;
    if let Err(e) = scheduler.dismantle().await {
        warn!(error = %e, "Failed to dismantle the backend");
    }
    let ids = result?;

    for execution in scheduler.controller().executions().await {
        let runtime = execution
            .finished_at
            .map(|finished| (finished - execution.started_at).num_milliseconds() as f64 / 1000.0);
        info!(
            execution_id = %execution.id,
            job = %execution.job,
            runtime_secs = ?runtime,
            exit_code = ?execution.outcome.and_then(|o| o.exit_code),
            "Execution summary"
        );
    }

    info!(
        jobs = ids.len(),
        runtime_secs = started.elapsed().as_secs_f64(),
        "All jobs completed"
    );
    Ok(())
}
