//! Slot layout of a machine: which cores and memory nodes each slot gets

use serde::{Deserialize, Serialize};

use crate::{PoncosError, PoncosResult};

/// Affinity of one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDescriptor {
    /// CPU ids bound to the slot
    pub cpus: Vec<u32>,
    /// NUMA memory nodes bound to the slot
    pub mems: Vec<u32>,
}

impl SlotDescriptor {
    pub fn new(cpus: Vec<u32>, mems: Vec<u32>) -> Self {
        Self { cpus, mems }
    }

    /// Comma separated cpu list, as taken by cgroup cpusets
    pub fn cpu_list(&self) -> String {
        join_ids(&self.cpus)
    }

    /// Comma separated memory node list
    pub fn mem_list(&self) -> String {
        join_ids(&self.mems)
    }
}

pub(crate) fn join_ids(ids: &[u32]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Slot layout shared by every machine in the grid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub slots: Vec<SlotDescriptor>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self::haswell_ep()
    }
}

impl SystemConfig {
    pub fn new(slots: Vec<SlotDescriptor>) -> PoncosResult<Self> {
        let config = Self { slots };
        config.validate()?;
        Ok(config)
    }

    /// Dual socket Haswell-EP, 12 cores per slot
    pub fn haswell_ep() -> Self {
        Self {
            slots: vec![
                SlotDescriptor::new(vec![0, 1, 2, 3, 4, 5, 12, 13, 14, 15, 16, 17], vec![0, 1]),
                SlotDescriptor::new(vec![6, 7, 8, 9, 10, 11, 18, 19, 20, 21, 22, 23], vec![0, 1]),
            ],
        }
    }

    /// Dual socket Sandy Bridge-EP, 8 cores per slot
    pub fn sandybridge_ep() -> Self {
        Self {
            slots: vec![
                SlotDescriptor::new(vec![0, 1, 2, 3, 8, 9, 10, 11], vec![0, 1]),
                SlotDescriptor::new(vec![4, 5, 6, 7, 12, 13, 14, 15], vec![0, 1]),
            ],
        }
    }

    /// Look up a built-in layout by name
    pub fn preset(name: &str) -> PoncosResult<Self> {
        match name.to_lowercase().as_str() {
            "haswell-ep" | "haswell_ep" => Ok(Self::haswell_ep()),
            "sandybridge-ep" | "sandybridge_ep" => Ok(Self::sandybridge_ep()),
            other => Err(PoncosError::Config(format!(
                "Unknown system preset: {}",
                other
            ))),
        }
    }

    /// Number of slots per machine (`S`)
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Cores per slot (`SLOT_SIZE`)
    pub fn slot_size(&self) -> usize {
        self.slots.first().map_or(0, |s| s.cpus.len())
    }

    pub fn slot(&self, index: usize) -> &SlotDescriptor {
        &self.slots[index]
    }

    /// Every slot must exist, have cpus, and have the same size
    pub fn validate(&self) -> PoncosResult<()> {
        if self.slots.is_empty() {
            return Err(PoncosError::Config(
                "System description has no slots".to_string(),
            ));
        }
        let size = self.slot_size();
        if size == 0 {
            return Err(PoncosError::Config("Slot 0 has no cpus".to_string()));
        }
        if let Some((index, slot)) = self
            .slots
            .iter()
            .enumerate()
            .find(|(_, s)| s.cpus.len() != size)
        {
            return Err(PoncosError::Config(format!(
                "Slot {} has {} cpus, slot 0 has {}",
                index,
                slot.cpus.len(),
                size
            )));
        }
        Ok(())
    }
}
