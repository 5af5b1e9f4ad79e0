//! Job and job queue definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::{PoncosError, PoncosResult};

/// An MPI job waiting in, or taken from, the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Number of MPI processes
    pub nprocs: usize,
    /// OpenMP threads per process
    #[serde(default = "default_threads_per_proc")]
    pub threads_per_proc: usize,
    /// The job's own command line
    #[serde(alias = "cmd")]
    pub command: String,
    /// Whether the job speaks the special checkpoint protocol during migration
    #[serde(default)]
    pub uses_sr_protocol: bool,
}

fn default_threads_per_proc() -> usize {
    1
}

impl Job {
    /// Create a single-threaded job
    pub fn new(nprocs: usize, command: impl Into<String>) -> Self {
        Self {
            nprocs,
            threads_per_proc: 1,
            command: command.into(),
            uses_sr_protocol: false,
        }
    }

    /// Cores the job occupies while running
    pub fn required_cores(&self) -> usize {
        self.nprocs.saturating_mul(self.threads_per_proc)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' ({}x{} cores)",
            self.command, self.nprocs, self.threads_per_proc
        )
    }
}

/// FIFO list of jobs, consumed in order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobQueue {
    /// Free-form title of the queue
    #[serde(default)]
    pub title: String,
    /// Jobs in arrival order
    #[serde(default)]
    pub jobs: Vec<Job>,
}

impl JobQueue {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self {
            title: String::new(),
            jobs,
        }
    }

    /// Load a queue from a TOML file with `[[jobs]]` tables
    pub fn from_file(path: &Path) -> PoncosResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PoncosError::Config(format!(
                "Failed to read job queue {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> PoncosResult<Self> {
        toml::from_str(content)
            .map_err(|e| PoncosError::Config(format!("Failed to parse job queue: {}", e)))
    }

    /// Reject jobs that could never be admitted.
    ///
    /// `max_cores` is the capacity available to a single job under the
    /// scheduler's admission grouping.
    pub fn validate(&self, max_cores: usize) -> PoncosResult<()> {
        for (position, job) in self.jobs.iter().enumerate() {
            if job.nprocs == 0 || job.threads_per_proc == 0 {
                return Err(PoncosError::InvalidJob(format!(
                    "job #{} {} needs at least one process and one thread",
                    position, job
                )));
            }
            let required = job.nprocs.checked_mul(job.threads_per_proc).ok_or_else(|| {
                PoncosError::InvalidJob(format!(
                    "job #{} {} asks for more cores than can be counted",
                    position, job
                ))
            })?;
            if required > max_cores {
                return Err(PoncosError::InvalidJob(format!(
                    "job #{} {} requires {} cores, the grid offers at most {}",
                    position, job, required, max_cores
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
