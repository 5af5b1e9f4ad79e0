//! Placement and rebalancing decisions
//!
//! Pure functions over snapshots of the occupancy and bandwidth matrices.
//! The co-scheduler feeds them and applies the results through the controller.

use poncos_core::{ExecutionId, MachineUsage, MembwUtil, Placement, Slot};
use std::cmp::Ordering;

fn slots_needed(slot_size: usize, required_cores: usize) -> usize {
    ((required_cores + slot_size - 1) / slot_size).max(1)
}

/// One free slot per machine, machines in index order, until the job fits.
///
/// Returns `None` if the grid cannot hold the job right now.
pub fn first_fit_placement(
    usage: &MachineUsage,
    slot_size: usize,
    required_cores: usize,
) -> Option<Placement> {
    let needed = slots_needed(slot_size, required_cores);
    let placement: Placement = (0..usage.machine_count())
        .filter_map(|m| usage.free_slots_on(m).first().map(|&s| Slot::new(m, s)))
        .take(needed)
        .collect();

    (placement.len() == needed).then_some(placement)
}

/// Every slot of fully free machines, in index order, until the job fits
pub fn exclusive_placement(
    usage: &MachineUsage,
    slot_size: usize,
    required_cores: usize,
) -> Option<Placement> {
    let slots = usage.slots_per_machine();
    let mut placement = Placement::new();

    for machine in 0..usage.machine_count() {
        if placement.len() >= slots_needed(slot_size, required_cores) {
            break;
        }
        if usage.free_slots_on(machine).len() == slots {
            placement.extend((0..slots).map(|s| Slot::new(machine, s)));
        }
    }

    (!placement.is_empty() && placement.len() * slot_size >= required_cores).then_some(placement)
}

/// Machines of `placement` whose summed utilization exceeds `threshold`.
///
/// Each machine is reported once, in placement order.
pub fn check_overload(placement: &[Slot], membw: &MembwUtil, threshold: f64) -> Vec<usize> {
    let mut marked = Vec::new();
    for slot in placement {
        if !marked.contains(&slot.machine) && membw.machine_total(slot.machine) > threshold {
            marked.push(slot.machine);
        }
    }
    marked
}

fn by_total(membw: &MembwUtil) -> impl Fn(&usize, &usize) -> Ordering + '_ {
    move |a, b| membw.machine_total(*a).total_cmp(&membw.machine_total(*b))
}

/// Least loaded machines to swap the `marked` ones with.
///
/// Machines already used by `placement` are never candidates. Returns one
/// candidate per marked machine, or nothing when even the best candidates
/// could not bring every pair under the threshold.
pub fn find_swap_candidates(
    marked: &[usize],
    placement: &[Slot],
    membw: &MembwUtil,
    threshold: f64,
) -> Vec<usize> {
    if marked.is_empty() {
        return Vec::new();
    }

    let mut machines: Vec<usize> = (0..membw.machine_count())
        .filter(|m| !marked.contains(m) && !placement.iter().any(|s| s.machine == *m))
        .collect();
    if machines.len() < marked.len() {
        return Vec::new();
    }
    machines.sort_by(by_total(membw));
    machines.truncate(marked.len());

    let load: f64 = marked
        .iter()
        .chain(&machines)
        .map(|m| membw.machine_total(*m))
        .sum();
    if load < threshold * marked.len() as f64 * 2.0 {
        machines
    } else {
        Vec::new()
    }
}

/// Slot indices from highest to lowest value (or the reverse), first one on ties
fn ranked_slots(values: &[f64], highest: bool) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|a, b| {
        let ordering = values[*a].total_cmp(&values[*b]);
        if highest {
            ordering.reverse()
        } else {
            ordering
        }
    });
    order
}

/// Move the job off its marked machines onto the candidates.
///
/// The most loaded marked machine is paired with the least loaded candidate.
/// A job lighter than its co-runner goes into the candidate's busiest slot,
/// otherwise into its quietest one. The execution living in that slot moves
/// to the job's old slot, so a slot whose occupant already runs on the source
/// machine is passed over for the next best one. Entries on unmarked machines
/// are kept. Returns an empty placement if the inputs cannot be paired.
pub fn generate_new_placement(
    placement: &[Slot],
    marked: &[usize],
    candidates: &[usize],
    membw: &MembwUtil,
    usage: &MachineUsage,
) -> Placement {
    if marked.is_empty() || marked.len() != candidates.len() {
        return Vec::new();
    }

    let mut sources = marked.to_vec();
    sources.sort_by(|a, b| by_total(membw)(b, a));
    let mut targets = candidates.to_vec();
    targets.sort_by(by_total(membw));

    let mut new_placement = placement.to_vec();
    for (source_machine, target_machine) in sources.iter().zip(&targets) {
        let Some(idx) = placement.iter().position(|s| s.machine == *source_machine) else {
            return Vec::new();
        };

        let source = placement[idx];
        let slots = membw.machine(*source_machine).len();
        let lighter = membw.get(source) < membw.get(source.opposing(slots));
        let already_on_source = |slot: &usize| match usage.get(Slot::new(*target_machine, *slot)) {
            Some(other) => usage.machine(*source_machine).contains(&Some(other)),
            None => false,
        };
        let Some(slot) = ranked_slots(membw.machine(*target_machine), lighter)
            .into_iter()
            .find(|slot| !already_on_source(slot))
        else {
            return Vec::new();
        };

        new_placement[idx] = Slot::new(*target_machine, slot);
    }
    new_placement
}

/// Whether some execution other than `id` lives on `machine`
pub fn has_co_runner(usage: &MachineUsage, machine: usize, id: ExecutionId) -> bool {
    usage
        .machine(machine)
        .iter()
        .any(|occupant| matches!(occupant, Some(other) if *other != id))
}
