//! Machine/slot grid, occupancy and bandwidth matrices

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one execution of a job. Handed out monotonically, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub u64);

impl ExecutionId {
    /// Position of this execution in the controller's arena
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One execution partition: slot `slot` on machine `machine`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot {
    /// Index into the machine list
    pub machine: usize,
    /// Slot index on that machine, `0..S`
    pub slot: usize,
}

impl Slot {
    pub fn new(machine: usize, slot: usize) -> Self {
        Self { machine, slot }
    }

    /// The co-resident slot on the same machine.
    ///
    /// Only meaningful for two slots per machine: with more slots there is no
    /// single opposing slot, so this is just the next slot index.
    pub fn opposing(self, slots_per_machine: usize) -> Self {
        Self {
            machine: self.machine,
            slot: (self.slot + 1) % slots_per_machine,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.machine, self.slot)
    }
}

/// Ordered list of distinct slots assigned to one execution
pub type Placement = Vec<Slot>;

/// Opposing slot of every entry, keeping the order of `placement`
pub fn opposing_placement(placement: &[Slot], slots_per_machine: usize) -> Placement {
    placement
        .iter()
        .map(|s| s.opposing(slots_per_machine))
        .collect()
}

/// Occupancy table: `[machine][slot] -> execution or empty`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineUsage {
    cells: Vec<Vec<Option<ExecutionId>>>,
}

impl MachineUsage {
    /// Create an all-empty table
    pub fn new(machines: usize, slots_per_machine: usize) -> Self {
        Self {
            cells: vec![vec![None; slots_per_machine]; machines],
        }
    }

    pub fn machine_count(&self) -> usize {
        self.cells.len()
    }

    pub fn slots_per_machine(&self) -> usize {
        self.cells.first().map_or(0, Vec::len)
    }

    pub fn total_slots(&self) -> usize {
        self.machine_count() * self.slots_per_machine()
    }

    /// Occupant of `slot`
    pub fn get(&self, slot: Slot) -> Option<ExecutionId> {
        self.cells[slot.machine][slot.slot]
    }

    pub fn set(&mut self, slot: Slot, occupant: Option<ExecutionId>) {
        self.cells[slot.machine][slot.slot] = occupant;
    }

    pub fn is_free(&self, slot: Slot) -> bool {
        self.get(slot).is_none()
    }

    /// Exchange the occupants of two slots
    pub fn swap(&mut self, a: Slot, b: Slot) {
        let tmp = self.get(a);
        self.set(a, self.get(b));
        self.set(b, tmp);
    }

    /// Occupants of one machine, indexed by slot
    pub fn machine(&self, machine: usize) -> &[Option<ExecutionId>] {
        &self.cells[machine]
    }

    /// Free slot indices on `machine`, ascending
    pub fn free_slots_on(&self, machine: usize) -> Vec<usize> {
        self.cells[machine]
            .iter()
            .enumerate()
            .filter(|(_, occupant)| occupant.is_none())
            .map(|(slot, _)| slot)
            .collect()
    }

    pub fn free_slot_count(&self) -> usize {
        self.cells.iter().flatten().filter(|c| c.is_none()).count()
    }

    pub fn all_free(&self) -> bool {
        self.free_slot_count() == self.total_slots()
    }

    /// Cores usable by a job that needs `slots_per_host` slots together on each host.
    ///
    /// A host contributes `slots_per_host * slot_size` cores if at least
    /// `slots_per_host` of its slots are free, nothing otherwise.
    pub fn free_cores_considering_slots_per_host(
        &self,
        slot_size: usize,
        slots_per_host: usize,
    ) -> usize {
        let slots_per_host = slots_per_host.max(1);
        (0..self.machine_count())
            .filter(|&m| self.free_slots_on(m).len() >= slots_per_host)
            .count()
            * slots_per_host
            * slot_size
    }

    /// Every occupied cell as `(slot, occupant)`
    pub fn occupied(&self) -> impl Iterator<Item = (Slot, ExecutionId)> + '_ {
        self.cells.iter().enumerate().flat_map(|(m, row)| {
            row.iter()
                .enumerate()
                .filter_map(move |(s, c)| c.map(|id| (Slot::new(m, s), id)))
        })
    }
}

/// Last measured bandwidth contention per slot, `[machine][slot] -> [0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct MembwUtil {
    cells: Vec<Vec<f64>>,
}

impl MembwUtil {
    /// Create an all-zero matrix
    pub fn new(machines: usize, slots_per_machine: usize) -> Self {
        Self {
            cells: vec![vec![0.0; slots_per_machine]; machines],
        }
    }

    /// Build from explicit rows; used to seed scenarios
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        Self { cells: rows }
    }

    pub fn machine_count(&self) -> usize {
        self.cells.len()
    }

    pub fn get(&self, slot: Slot) -> f64 {
        self.cells[slot.machine][slot.slot]
    }

    pub fn set(&mut self, slot: Slot, value: f64) {
        self.cells[slot.machine][slot.slot] = value;
    }

    pub fn reset(&mut self, slot: Slot) {
        self.set(slot, 0.0);
    }

    pub fn swap(&mut self, a: Slot, b: Slot) {
        let tmp = self.get(a);
        self.set(a, self.get(b));
        self.set(b, tmp);
    }

    /// Values of one machine, indexed by slot
    pub fn machine(&self, machine: usize) -> &[f64] {
        &self.cells[machine]
    }

    /// Sum over every slot of `machine`
    pub fn machine_total(&self, machine: usize) -> f64 {
        self.cells[machine].iter().sum()
    }
}
