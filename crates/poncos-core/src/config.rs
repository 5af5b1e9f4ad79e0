//! Configuration types for poncos

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{PoncosError, PoncosResult, SlotDescriptor, SystemConfig};

/// Main configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoncosConfig {
    /// Machine list
    pub machines: MachinesConfig,
    /// Slot layout of every machine
    pub system: SystemSection,
    /// Scheduling policy
    pub scheduler: SchedulerConfig,
    /// Execution backend
    pub backend: BackendConfig,
    /// Agent communication
    pub network: NetworkConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl PoncosConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> PoncosResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PoncosError::Config(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| PoncosError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Reject values the scheduler cannot work with
    pub fn validate(&self) -> PoncosResult<()> {
        self.system.resolve()?;
        let threshold = self.scheduler.threshold;
        if !(threshold > 0.0 && threshold <= 2.0) {
            return Err(PoncosError::Config(format!(
                "Overload threshold must be in (0, 2], got {}",
                threshold
            )));
        }
        if self.network.timeout_secs == 0 {
            return Err(PoncosError::Config(
                "network.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.backend.kind == BackendKind::Vm && self.backend.vm_pool.is_empty() {
            return Err(PoncosError::Config(
                "The vm backend needs a non-empty backend.vm_pool".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the machine list comes from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachinesConfig {
    /// Machine file, one hostname per line
    pub file: Option<PathBuf>,
    /// Hostnames listed inline, used when no file is given
    pub hosts: Vec<String>,
}

impl MachinesConfig {
    /// Resolve the ordered hostname list
    pub fn load(&self) -> PoncosResult<Vec<String>> {
        let hosts = match &self.file {
            Some(path) => read_machine_file(path)?,
            None => self.hosts.clone(),
        };
        if hosts.is_empty() {
            return Err(PoncosError::Config("Machine list is empty".to_string()));
        }
        Ok(hosts)
    }
}

/// Read a machine file: one hostname per line, blank lines and `#` comments skipped
pub fn read_machine_file(path: &Path) -> PoncosResult<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PoncosError::Config(format!(
            "Failed to read machine file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}

/// Slot layout section: a preset name or explicit slots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSection {
    /// Built-in layout (`haswell-ep`, `sandybridge-ep`)
    pub preset: Option<String>,
    /// Explicit slots, take precedence over `preset`
    pub slots: Vec<SlotDescriptor>,
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            preset: Some("haswell-ep".to_string()),
            slots: Vec::new(),
        }
    }
}

impl SystemSection {
    pub fn resolve(&self) -> PoncosResult<SystemConfig> {
        if !self.slots.is_empty() {
            return SystemConfig::new(self.slots.clone());
        }
        match &self.preset {
            Some(name) => SystemConfig::preset(name),
            None => Err(PoncosError::Config(
                "system section needs either `preset` or `slots`".to_string(),
            )),
        }
    }
}

/// Scheduling policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Which policy to run
    pub policy: SchedulingPolicy,
    /// Per-machine overload threshold on the summed bandwidth utilization
    pub threshold: f64,
    /// Seconds a freshly launched job runs before it is measured
    pub warmup_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: SchedulingPolicy::Coschedule,
            threshold: 0.9,
            warmup_secs: 10,
        }
    }
}

/// Scheduling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingPolicy {
    /// Co-locate jobs, measure contention, rebalance
    Coschedule,
    /// One job per machine, whole machines only
    Exclusive,
}

/// Execution backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend type
    pub kind: BackendKind,
    /// Directory for job logs and MPI host files
    pub work_dir: PathBuf,
    /// Script that creates the cgroup and runs the command inside it
    pub wrapper: String,
    /// MPI launcher
    pub mpiexec: String,
    /// Guests available to the VM backend
    pub vm_pool: Vec<VmPoolEntry>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Cgroup,
            work_dir: PathBuf::from("."),
            wrapper: "./cgroup_wrapper.sh".to_string(),
            mpiexec: "mpiexec".to_string(),
            vm_pool: Vec::new(),
        }
    }
}

/// Backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// cgroup partitions on bare metal
    Cgroup,
    /// One virtual machine per slot
    Vm,
}

/// A guest the VM backend may start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmPoolEntry {
    pub name: String,
    pub mac: String,
}

/// Agent communication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port the per-machine agents listen on
    pub agent_port: u16,
    /// Deadline for a single round-trip, in seconds
    pub timeout_secs: u64,
    /// Extra attempts after a failed round-trip
    pub retries: u32,
    /// Linear backoff base between attempts, in milliseconds
    pub backoff_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            agent_port: 7070,
            timeout_secs: 60,
            retries: 2,
            backoff_ms: 500,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PoncosConfig::default();
        assert_eq!(config.scheduler.threshold, 0.9);
        assert_eq!(config.scheduler.policy, SchedulingPolicy::Coschedule);
        assert_eq!(config.backend.kind, BackendKind::Cgroup);
        assert!(config.validate().is_ok());
        assert_eq!(config.system.resolve().unwrap().slot_size(), 12);
    }

    #[test]
    fn test_config_parse() {
        let toml_str = r#"
[machines]
hosts = ["node01", "node02"]

[system]
slots = [
    { cpus = [0, 1, 2, 3], mems = [0] },
    { cpus = [4, 5, 6, 7], mems = [1] },
]

[scheduler]
policy = "exclusive"
threshold = 0.8
warmup_secs = 2

[backend]
kind = "vm"
vm_pool = [{ name = "guest-0", mac = "52:54:00:00:00:01" }]

[network]
timeout_secs = 5
"#;
        let config: PoncosConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.machines.load().unwrap(), vec!["node01", "node02"]);
        assert_eq!(config.scheduler.policy, SchedulingPolicy::Exclusive);
        assert_eq!(config.backend.kind, BackendKind::Vm);
        assert_eq!(config.network.retries, 2);
        assert_eq!(config.system.resolve().unwrap().slot_size(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_threshold() {
        let mut config = PoncosConfig::default();
        config.scheduler.threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vm_backend_requires_pool() {
        let mut config = PoncosConfig::default();
        config.backend.kind = BackendKind::Vm;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_read_machine_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "node01\n\n# spare\nnode02  ").unwrap();

        let hosts = read_machine_file(file.path()).unwrap();
        assert_eq!(hosts, vec!["node01", "node02"]);
    }
}
