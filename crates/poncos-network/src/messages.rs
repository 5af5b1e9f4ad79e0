//! Wire messages exchanged with the per-machine agents

use poncos_core::{PoncosError, PoncosResult};
use serde::{Deserialize, Serialize};

/// Topics understood by the agents
pub mod topics {
    /// Run the bandwidth benchmark on a set of cores
    pub const MEMBW_REQUEST: &str = "mmbwmon/request";
    /// Freeze a cgroup
    pub const CGROUP_STOP: &str = "mmbwmon/stop";
    /// Thaw a cgroup
    pub const CGROUP_RESTART: &str = "mmbwmon/restart";
    /// Virtual machine management tasks
    pub const MIGFRA_TASK: &str = "migfra/task";
}

/// Bandwidth measurement request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembwRequest {
    /// Cores the benchmark runs on
    pub cores: Vec<u32>,
}

/// Bandwidth measurement reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembwReply {
    /// Fraction of the memory bandwidth still available, `[0, 1]`
    pub result: f64,
}

/// Freeze/thaw request for a cgroup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupSignal {
    pub cgroup: String,
}

/// Status reported by an agent for a request it carried out
pub const SUCCESS: &str = "success";

/// Generic acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub status: String,
    #[serde(default)]
    pub details: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            status: SUCCESS.to_string(),
            details: None,
        }
    }

    /// Turn a non-success status into an error naming `what`
    pub fn into_result(self, what: &str) -> PoncosResult<()> {
        check_status(&self.status, self.details.as_deref(), what)
    }
}

fn check_status(status: &str, details: Option<&str>, what: &str) -> PoncosResult<()> {
    if status == SUCCESS {
        Ok(())
    } else {
        Err(PoncosError::Runtime(format!(
            "{} failed with status '{}': {}",
            what,
            status,
            details.unwrap_or("no details")
        )))
    }
}

/// Guest-side swap partner of a migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapWith {
    pub vm_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpu_map: Option<Vec<Vec<u32>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pscom_hook_procs: Option<String>,
}

/// Virtual machine management task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "kebab-case")]
pub enum MigfraTask {
    StartVm {
        vm_name: String,
        mac: String,
        uuid: String,
        slot: usize,
        transient: bool,
    },
    StopVm {
        regex: String,
        force: bool,
        concurrent_execution: bool,
    },
    SuspendVm {
        vm_name: String,
    },
    ResumeVm {
        vm_name: String,
    },
    Migrate {
        vm_name: String,
        dest_hostname: String,
        migration_type: String,
        rdma_migration: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        swap_with: Option<SwapWith>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vcpu_map: Option<Vec<Vec<u32>>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pscom_hook_procs: Option<String>,
    },
}

/// Batch of tasks sent to one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContainer {
    pub tasks: Vec<MigfraTask>,
}

/// Outcome of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub vm_name: String,
    pub status: String,
    #[serde(default)]
    pub details: Option<String>,
}

/// Outcomes of a task batch
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResultContainer {
    pub results: Vec<TaskResult>,
}

impl ResultContainer {
    /// One result per task sent, every one of them a success
    pub fn check(&self, expected: usize, what: &str) -> PoncosResult<()> {
        if self.results.len() != expected {
            return Err(PoncosError::Runtime(format!(
                "{}: {} tasks sent, {} results received",
                what,
                expected,
                self.results.len()
            )));
        }
        self.results
            .iter()
            .try_for_each(|r| check_status(&r.status, r.details.as_deref(), what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_requires_status() {
        assert!(serde_json::from_str::<Ack>("{}").is_err());

        let ack: Ack = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        assert!(ack.into_result("freeze").is_ok());

        let ack: Ack = serde_json::from_str(r#"{"status":"error","details":"no such cgroup"}"#)
            .unwrap();
        let err = ack.into_result("freeze poncos_3").unwrap_err();
        assert!(err.to_string().contains("no such cgroup"));
    }

    #[test]
    fn test_task_serialization() {
        let task = MigfraTask::SuspendVm {
            vm_name: "guest-1".to_string(),
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task"], "suspend-vm");
        assert_eq!(json["vm_name"], "guest-1");
    }

    #[test]
    fn test_result_container_check() {
        let results = ResultContainer {
            results: vec![
                TaskResult {
                    vm_name: "a".to_string(),
                    status: "success".to_string(),
                    details: None,
                },
                TaskResult {
                    vm_name: "b".to_string(),
                    status: "error".to_string(),
                    details: Some("domain not found".to_string()),
                },
            ],
        };
        assert!(results.check(2, "stop").is_err());
        assert!(ResultContainer::default().check(0, "stop").is_ok());
    }

    #[test]
    fn test_result_container_counts_results() {
        let results: ResultContainer = serde_json::from_str(r#"{"results": []}"#).unwrap();
        let err = results.check(1, "migrate").unwrap_err();
        assert!(err.to_string().contains("1 tasks sent, 0 results received"));

        let results: ResultContainer =
            serde_json::from_str(r#"{"results": [{"status": "success"}]}"#).unwrap();
        assert!(results.check(1, "migrate").is_ok());
        assert!(results.check(2, "migrate").is_err());
    }
}
