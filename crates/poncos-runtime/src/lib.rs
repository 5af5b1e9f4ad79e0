//! poncos-runtime: Execution backends
//!
//! This crate provides the backends that turn a placement into running processes:
//! - cgroup backend: one cpuset/memory cgroup per slot, frozen through the agents
//! - Virtual machine backend: one guest per slot, swappable between machines
//! - Shell execution of the generated command lines

pub mod cgroup;
pub mod process;
pub mod traits;
pub mod vm;

pub use cgroup::{CgroupBackend, CgroupBackendConfig};
pub use process::{execution_name, ShellRunner};
pub use traits::{Backend, MigrationStep, RunOutcome};
pub use vm::VmBackend;
