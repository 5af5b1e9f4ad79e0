//! poncos-network: Agent communication for poncos
//!
//! This crate provides the request/reply plumbing towards the per-machine agents:
//! - The agent channel interface and its HTTP transport
//! - Wire messages for freezing, measuring and virtual machine tasks
//! - The memory bandwidth probe

pub mod channel;
pub mod memory;
pub mod messages;
pub mod probe;

pub use channel::{call, AgentChannel, HttpChannel};
pub use memory::{task_replies, MemoryChannel};
pub use probe::{MembwProbe, Probe};
