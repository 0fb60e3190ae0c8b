//! Slot Allocation
//!
//! Greedy first-fit coloring of promoted locals onto frame slots. Two
//! locals share a slot when their static types are identical (including
//! open type-parameter indices) and their live ranges never overlap, so
//! frame size tracks the maximum number of concurrently live hoisted
//! locals rather than the total count.

use super::capture::{CaptureAnalysis, PromotedLocal};
use crate::ir::{BasicBlockId, LocalId, SlotId, Ty};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

/// One allocated frame slot
#[derive(Debug, Clone, Serialize)]
pub struct SlotDef {
    pub slot: SlotId,
    /// Debug name: the first local assigned to this slot
    pub name: Option<String>,
    pub ty: Ty,
}

/// Assignment of promoted locals to frame slots
#[derive(Debug, Default)]
pub struct SlotAssignment {
    pub slots: Vec<SlotDef>,
    map: FxHashMap<LocalId, SlotId>,
}

impl SlotAssignment {
    /// The slot backing a promoted local
    pub fn slot_of(&self, local: LocalId) -> Option<SlotId> {
        self.map.get(&local).copied()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

struct SlotState {
    ty: Ty,
    /// Union of occupant live ranges
    live_blocks: FxHashSet<BasicBlockId>,
    /// A by-reference occupant makes the slot exclusive
    exclusive: bool,
}

/// Allocate slots for the promoted locals, in declaration order
pub fn allocate(analysis: &CaptureAnalysis) -> SlotAssignment {
    let mut assignment = SlotAssignment::default();
    let mut states: Vec<SlotState> = Vec::new();

    for promoted in &analysis.promoted {
        let slot = find_slot(&states, promoted);
        match slot {
            Some(index) => {
                states[index]
                    .live_blocks
                    .extend(promoted.live_blocks.iter().copied());
            }
            None => {
                states.push(SlotState {
                    ty: promoted.ty,
                    live_blocks: promoted.live_blocks.clone(),
                    exclusive: promoted.by_ref,
                });
                assignment.slots.push(SlotDef {
                    slot: SlotId(states.len() as u32 - 1),
                    name: promoted.name.clone(),
                    ty: promoted.ty,
                });
            }
        }
        let id = SlotId(slot.unwrap_or(states.len() - 1) as u32);
        assignment.map.insert(promoted.local, id);
    }
    assignment
}

/// Lowest-numbered compatible slot, if any
fn find_slot(states: &[SlotState], promoted: &PromotedLocal) -> Option<usize> {
    if promoted.by_ref {
        return None;
    }
    states.iter().position(|state| {
        !state.exclusive
            && state.ty == promoted.ty
            && state.live_blocks.is_disjoint(&promoted.live_blocks)
    })
}
