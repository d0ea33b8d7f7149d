//! Bin-packing arithmetic and unit filling.
//!
//! All sizes are fixed, so packing reduces to counting whole container
//! slots: a unit with `remaining` capacity holds `remaining / size` more
//! containers.

use capgrid_core::{ComputeUnit, UnitError, WorkloadId};
use tracing::debug;

/// Containers of `container_size` that still fit in `remaining` capacity.
pub fn slots_available(remaining: u64, container_size: u64) -> u64 {
    if container_size == 0 {
        return 0;
    }
    remaining / container_size
}

/// Fewest fresh units that can hold `containers` more containers.
///
/// Counting whole slots per unit means a non-dividing container size never
/// undershoots, so one provisioning round suffices unless requests fail.
pub fn units_needed(containers: u64, slots_per_unit: u64) -> u64 {
    if containers == 0 || slots_per_unit == 0 {
        return 0;
    }
    containers.div_ceil(slots_per_unit)
}

/// Outcome of filling one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fill {
    /// Workloads placed on the unit, in placement order.
    pub placed: Vec<WorkloadId>,
    /// Whether the unit can still take another container.
    pub has_room: bool,
}

/// Place up to `want` containers of `container_size` on `unit`.
///
/// Stops early when the unit runs out of room. A capacity rejection from
/// the unit (its spare room changed underneath us) ends the fill and
/// reports the unit as full; it is never surfaced as an error.
pub fn fill_unit(unit: &dyn ComputeUnit, container_size: u64, want: u64) -> Fill {
    let mut placed = Vec::new();

    while (placed.len() as u64) < want && unit.remaining_capacity() >= container_size {
        match unit.place(container_size) {
            Ok(id) => placed.push(id),
            Err(UnitError::Capacity { requested, remaining }) => {
                debug!(
                    unit = %unit.unit_id(),
                    requested,
                    remaining,
                    "unit rejected placement, treating as full"
                );
                return Fill {
                    placed,
                    has_room: false,
                };
            }
            Err(UnitError::UnknownWorkload(_)) => {
                return Fill {
                    placed,
                    has_room: false,
                };
            }
        }
    }

    let has_room = unit.remaining_capacity() >= container_size;
    Fill { placed, has_room }
}
