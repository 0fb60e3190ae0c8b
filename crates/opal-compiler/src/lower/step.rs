//! Step-Function Synthesis
//!
//! Emits the flat, restartable step body: a dispatch block switching on
//! the cursor, one resume prologue per state, cursor writes at every
//! suspension and return, and every promoted local rewritten to its
//! frame slot. Also assembles the lowered region table the runtime
//! unwinder consumes.

use super::capture::CaptureAnalysis;
use super::cleanup;
use super::regions::RegionTree;
use super::slots::SlotAssignment;
use super::states::{StateTable, STATE_CLOSED, STATE_NOT_STARTED, STATE_RUNNING};
use crate::artifact::{
    DispatchEntry, FrameLayout, LoweredCatch, LoweredFunction, LoweredRegion, RegionCleanup,
};
use crate::error::LowerResult;
use crate::ir::{
    BasicBlock, BasicBlockId, Instr, IrFunction, LocalDecl, LocalId, LocalKind, Operand, Place,
    RegionKind, SlotId, Terminator, Ty,
};
use rustc_hash::FxHashMap;

/// Synthesize the lowered function from the finished analyses
pub fn synthesize(
    func: &IrFunction,
    tree: &RegionTree,
    capture: &CaptureAnalysis,
    slots: &SlotAssignment,
    states: StateTable,
) -> LowerResult<LoweredFunction> {
    let mut body = func.clone();
    let mut next_block = body.next_block_id();

    let mut extraction = cleanup::extract(&mut body, tree, &mut next_block);
    let abandon = cleanup::abandon_plan(tree, &states, &extraction);

    // Cursor writes: a suspension persists its state before leaving, a
    // return closes the frame. Routine returns are cleanup exits, not
    // completions, so only their suspensions get cursor writes.
    for block in &mut body.blocks {
        let state = match &block.terminator {
            Terminator::Suspend { point, .. } => {
                Some(states.state_of(*point).expect("unnumbered suspend"))
            }
            Terminator::Return(_) => Some(STATE_CLOSED),
            _ => None,
        };
        if let Some(state) = state {
            block.add_instr(Instr::SetCursor { state });
        }
    }
    for routine in &mut extraction.routines {
        for block in &mut routine.blocks {
            let state = match &block.terminator {
                Terminator::Suspend { point, .. } => {
                    Some(states.state_of(*point).expect("unnumbered suspend"))
                }
                _ => None,
            };
            if let Some(state) = state {
                block.add_instr(Instr::SetCursor { state });
            }
        }
    }

    // Resume prologues: re-arm the cursor to the running value and land
    // the resumption input before continuing past the suspension.
    let mut dispatch = Vec::new();
    for entry in &states.entries {
        let id = BasicBlockId(next_block);
        next_block += 1;
        let mut prologue = BasicBlock::with_label(id, format!("resume{}", entry.state));
        prologue.add_instr(Instr::SetCursor {
            state: STATE_RUNNING,
        });
        if let Some(result) = entry.result {
            prologue.add_instr(Instr::TakeResume { dest: result });
        }
        prologue.set_terminator(Terminator::Jump(entry.resume));
        body.add_block(prologue);
        dispatch.push(DispatchEntry {
            state: entry.state,
            prologue: id,
        });
    }

    // Dispatch: first action of every step call is to read the cursor.
    let cursor_local = body.add_local(LocalDecl::new(None, Ty::Int, LocalKind::Temp));
    let invalid = BasicBlockId(next_block);
    next_block += 1;
    let mut invalid_block = BasicBlock::with_label(invalid, "invalid_state");
    invalid_block.set_terminator(Terminator::Unreachable);
    body.add_block(invalid_block);

    let dispatch_id = BasicBlockId(next_block);
    let mut dispatch_block = BasicBlock::with_label(dispatch_id, "dispatch");
    dispatch_block.add_instr(Instr::LoadCursor {
        dest: Place::Local(cursor_local),
    });
    let mut cases: Vec<(i64, BasicBlockId)> =
        vec![(STATE_NOT_STARTED as i64, body.entry_block)];
    for entry in &dispatch {
        cases.push((entry.state as i64, entry.prologue));
    }
    dispatch_block.set_terminator(Terminator::Switch {
        value: Operand::Local(cursor_local),
        cases,
        default: invalid,
    });
    body.add_block(dispatch_block);
    body.entry_block = dispatch_id;

    // Promoted locals now live in the frame: rewrite every access.
    let map: FxHashMap<LocalId, SlotId> = capture
        .promoted
        .iter()
        .filter_map(|p| slots.slot_of(p.local).map(|s| (p.local, s)))
        .collect();
    for block in &mut body.blocks {
        rewrite_block(block, &map);
    }
    for routine in &mut extraction.routines {
        for block in &mut routine.blocks {
            rewrite_block(block, &map);
        }
    }

    let regions = lowered_regions(&body, tree, &extraction, &map);
    let layout = frame_layout(func, capture, slots);

    Ok(LoweredFunction {
        name: func.name.clone(),
        kind: func.kind,
        layout,
        body,
        states,
        dispatch,
        cleanups: extraction.routines,
        regions,
        abandon,
    })
}

fn rewrite_place(place: &mut Place, map: &FxHashMap<LocalId, SlotId>) {
    if let Place::Local(local) = place {
        if let Some(slot) = map.get(local) {
            *place = Place::Slot(*slot);
        }
    }
}

fn rewrite_operand(operand: &mut Operand, map: &FxHashMap<LocalId, SlotId>) {
    if let Operand::Local(local) = operand {
        if let Some(slot) = map.get(local) {
            *operand = Operand::Slot(*slot);
        }
    }
}

fn rewrite_block(block: &mut BasicBlock, map: &FxHashMap<LocalId, SlotId>) {
    for instr in &mut block.instructions {
        instr.for_each_dest_mut(|place| rewrite_place(place, map));
        instr.for_each_operand_mut(|operand| rewrite_operand(operand, map));
    }
    block
        .terminator
        .for_each_operand_mut(|operand| rewrite_operand(operand, map));
    if let Terminator::Suspend {
        result: Some(result),
        ..
    } = &mut block.terminator
    {
        rewrite_place(result, map);
    }
}

/// Build the region table the runtime unwinder walks
fn lowered_regions(
    body: &IrFunction,
    tree: &RegionTree,
    extraction: &cleanup::ExtractionResult,
    map: &FxHashMap<LocalId, SlotId>,
) -> Vec<LoweredRegion> {
    // Loop regions carry no unwind behavior and are dropped from the
    // lowered table, so parent edges skip over them.
    let is_loop =
        |idx: usize| matches!(body.regions[tree.nodes[idx].info_index].kind, RegionKind::Loop);
    let parent_of: FxHashMap<_, _> = tree
        .nodes
        .iter()
        .map(|node| {
            let mut parent = node.parent;
            while let Some(p) = parent {
                if !is_loop(p) {
                    break;
                }
                parent = tree.nodes[p].parent;
            }
            (node.region, parent.map(|p| tree.nodes[p].region))
        })
        .collect();

    let mut out = Vec::new();
    for info in &body.regions {
        let cleanup = match (&info.kind, extraction.by_region.get(&info.id)) {
            (_, Some(&id)) => RegionCleanup::Extracted(id),
            (
                RegionKind::Try {
                    finally: Some(finally),
                    ..
                },
                None,
            ) => RegionCleanup::InlineFinally {
                entry: finally.entry,
                blocks: finally.blocks.clone(),
            },
            (RegionKind::ScopedResource { resource, dispose }, None) => {
                let mut operand = Operand::Local(*resource);
                rewrite_operand(&mut operand, map);
                RegionCleanup::InlineDispose {
                    resource: operand,
                    dispose: *dispose,
                }
            }
            (RegionKind::Loop, None) => continue,
            _ => RegionCleanup::None,
        };
        let catches = match &info.kind {
            RegionKind::Try { catches, .. } => catches
                .iter()
                .map(|catch| {
                    let binding = catch.binding.map(|local| {
                        let mut place = Place::Local(local);
                        rewrite_place(&mut place, map);
                        place
                    });
                    LoweredCatch {
                        binding,
                        entry: catch.entry,
                        blocks: catch.blocks.clone(),
                    }
                })
                .collect(),
            _ => Vec::new(),
        };
        out.push(LoweredRegion {
            id: info.id,
            parent: parent_of.get(&info.id).copied().flatten(),
            blocks: info.blocks.clone(),
            catches,
            cleanup,
            after: info.after,
        });
    }
    out
}

fn frame_layout(
    func: &IrFunction,
    capture: &CaptureAnalysis,
    slots: &SlotAssignment,
) -> FrameLayout {
    let mut layout = FrameLayout {
        function: func.name.clone(),
        type_params: func.type_params,
        slots: slots.slots.clone(),
        ..Default::default()
    };
    for promoted in &capture.promoted {
        let decl = &func.locals[promoted.local.as_u32() as usize];
        let name = decl.display_name(promoted.local);
        if decl.kind.is_param() {
            layout.captured_params.push(name);
            if let Some(slot) = slots.slot_of(promoted.local) {
                layout.param_slots.push((promoted.local, slot));
            }
        } else {
            layout.captured_locals.push(name);
        }
        if matches!(decl.kind, LocalKind::Receiver) {
            layout.captures_receiver = true;
        }
    }
    layout
}
