//! poncos-scheduler: Memory bandwidth aware co-scheduler
//!
//! This crate provides the scheduling core of poncos:
//! - Slot accounting, freeze/thaw and slot swapping (the controller)
//! - Placement, overload detection and swap selection
//! - The co-scheduling and exclusive queue policies

pub mod controller;
pub mod coscheduler;
pub mod placement;

#[cfg(test)]
mod testing;

pub use controller::{
    AllocationLock, ChangeListener, CompletionCallback, Controller, ExecutionState, ExecutionView,
};
pub use coscheduler::CoScheduler;
