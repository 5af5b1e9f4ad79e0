//! poncos-core: Core types for the poncos co-scheduler
//!
//! This crate provides the fundamental types used throughout poncos:
//! - Machine/slot grid, occupancy and bandwidth matrices
//! - Jobs and job queues
//! - Slot layouts (cpu and memory affinity)
//! - Configuration types
//! - Error handling

pub mod capacity;
pub mod config;
pub mod error;
pub mod job;
pub mod system;

pub use capacity::*;
pub use config::*;
pub use error::*;
pub use job::*;
pub use system::*;
