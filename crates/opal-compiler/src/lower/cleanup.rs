//! Finally-Region Extraction
//!
//! Structured cleanup cannot span a suspension: execution may leave and
//! re-enter the region on different step invocations, so the cleanup of
//! every suspended region is split into a standalone routine, callable
//! from the normal fall-through exit (through a trampoline block) and
//! from the abandonment walk. Regions that never suspend keep their
//! ordinary inline cleanup.

use super::regions::RegionTree;
use super::states::StateTable;
use crate::ir::{
    BasicBlock, BasicBlockId, CleanupId, IrFunction, Instr, Operand, RegionId, RegionKind,
    Terminator,
};
use crate::artifact::CleanupRoutine;
use rustc_hash::FxHashMap;

/// Result of the extraction pass over one body
#[derive(Debug, Default)]
pub struct ExtractionResult {
    pub routines: Vec<CleanupRoutine>,
    pub by_region: FxHashMap<RegionId, CleanupId>,
}

/// Extract cleanup routines for every suspended region of `body`
///
/// Regions are processed innermost first (the order the builder records
/// them), so a routine extracted from inside an outer finally is already
/// reduced to a trampoline when the outer clause is carved out.
pub fn extract(body: &mut IrFunction, tree: &RegionTree, next_block: &mut u32) -> ExtractionResult {
    let mut result = ExtractionResult::default();

    for index in 0..body.regions.len() {
        let region_id = body.regions[index].id;
        let node = tree
            .nodes
            .iter()
            .find(|n| n.region == region_id)
            .expect("region missing from tree");
        let suspended = !node.suspends.is_empty();

        match &body.regions[index].kind {
            // A scoped region that never suspends keeps its dispose
            // inline, but the normal-path exit still has to call it:
            // the builder records the region without emitting the call.
            RegionKind::ScopedResource { resource, dispose } if !suspended => {
                let resource = *resource;
                let dispose = *dispose;
                let after = body.regions[index].after;
                let region_blocks = body.regions[index].blocks.clone();

                let exit = BasicBlockId(*next_block);
                *next_block += 1;
                let mut exit_block = BasicBlock::with_label(exit, "dispose");
                exit_block.add_instr(Instr::Call {
                    dest: None,
                    func: dispose,
                    args: vec![Operand::Local(resource)],
                });
                exit_block.set_terminator(Terminator::Jump(after));
                body.add_block(exit_block);

                for block_id in &region_blocks {
                    if let Some(block) = body.get_block_mut(*block_id) {
                        block.terminator.for_each_target_mut(|target| {
                            if *target == after {
                                *target = exit;
                            }
                        });
                    }
                }
                record_alongside(body, after, exit);
                continue;
            }
            _ if !suspended => continue,
            RegionKind::Try { finally: Some(_), .. } => {
                let (entry, blocks, after) = {
                    let info = &body.regions[index];
                    let finally = match &info.kind {
                        RegionKind::Try {
                            finally: Some(f), ..
                        } => f,
                        _ => unreachable!(),
                    };
                    (finally.entry, finally.blocks.clone(), info.after)
                };
                let id = CleanupId(result.routines.len() as u32);
                let name = format!("{}::finally{}", body.name, result.routines.len() + 1);

                // Carve the cleanup blocks out of the step body. Exits to
                // the region's continuation become routine returns.
                let mut routine_blocks = Vec::new();
                for block_id in &blocks {
                    if let Some(mut block) = body.remove_block(*block_id) {
                        if let Terminator::Jump(target) = block.terminator {
                            if !blocks.contains(&target) {
                                block.terminator = Terminator::Return(None);
                            }
                        }
                        routine_blocks.push(block);
                    }
                }

                let trampoline = alloc_trampoline(body, next_block, id, after);
                retarget(body, entry, trampoline);
                record_alongside(body, after, trampoline);

                result.by_region.insert(region_id, id);
                result.routines.push(CleanupRoutine {
                    id,
                    region: region_id,
                    name,
                    entry,
                    blocks: routine_blocks,
                });
            }
            RegionKind::ScopedResource { resource, dispose } => {
                let resource = *resource;
                let dispose = *dispose;
                let after = body.regions[index].after;
                let region_blocks = body.regions[index].blocks.clone();
                let id = CleanupId(result.routines.len() as u32);
                let name = format!("{}::finally{}", body.name, result.routines.len() + 1);

                // Synthesize the dispose routine; it never lived in the body.
                let entry = BasicBlockId(*next_block);
                *next_block += 1;
                let mut dispose_block = BasicBlock::new(entry);
                dispose_block.add_instr(Instr::Call {
                    dest: None,
                    func: dispose,
                    args: vec![Operand::Local(resource)],
                });
                dispose_block.set_terminator(Terminator::Return(None));

                let trampoline = alloc_trampoline(body, next_block, id, after);
                // Only exits of the region itself route through the dispose.
                for block_id in &region_blocks {
                    if let Some(block) = body.get_block_mut(*block_id) {
                        block.terminator.for_each_target_mut(|target| {
                            if *target == after {
                                *target = trampoline;
                            }
                        });
                    }
                }
                record_alongside(body, after, trampoline);

                result.by_region.insert(region_id, id);
                result.routines.push(CleanupRoutine {
                    id,
                    region: region_id,
                    name,
                    entry,
                    blocks: vec![dispose_block],
                });
            }
            _ => {}
        }
    }
    result
}

/// The abandonment plan: for every state, the open cleanup routines,
/// innermost first. A region whose own cleanup contains the suspension
/// point is in progress and is not restarted.
pub fn abandon_plan(
    tree: &RegionTree,
    states: &StateTable,
    extraction: &ExtractionResult,
) -> Vec<(i32, Vec<CleanupId>)> {
    let mut plan = Vec::new();
    for entry in &states.entries {
        let mut open = Vec::new();
        for node_idx in tree.chain(entry.block) {
            let node = &tree.nodes[node_idx];
            if node.finally_blocks.contains(&entry.block) {
                continue;
            }
            if let Some(&cleanup) = extraction.by_region.get(&node.region) {
                open.push(cleanup);
            }
        }
        plan.push((entry.state, open));
    }
    plan
}

fn alloc_trampoline(
    body: &mut IrFunction,
    next_block: &mut u32,
    cleanup: CleanupId,
    after: BasicBlockId,
) -> BasicBlockId {
    let id = BasicBlockId(*next_block);
    *next_block += 1;
    let mut block = BasicBlock::with_label(id, format!("cleanup{}", cleanup.as_u32()));
    block.add_instr(Instr::RunCleanup { cleanup });
    block.set_terminator(Terminator::Jump(after));
    body.add_block(block);
    id
}

/// Point every jump into `from` at `to` instead
fn retarget(body: &mut IrFunction, from: BasicBlockId, to: BasicBlockId) {
    for block in &mut body.blocks {
        block.terminator.for_each_target_mut(|target| {
            if *target == from {
                *target = to;
            }
        });
    }
}

/// Register a synthesized block in every region list that already holds
/// `reference`, so enclosing regions (and enclosing cleanup clauses)
/// keep exact block sets.
fn record_alongside(body: &mut IrFunction, reference: BasicBlockId, new_block: BasicBlockId) {
    for region in &mut body.regions {
        if region.blocks.contains(&reference) {
            region.blocks.push(new_block);
        }
        if let RegionKind::Try { catches, finally } = &mut region.kind {
            for catch in catches {
                if catch.blocks.contains(&reference) {
                    catch.blocks.push(new_block);
                }
            }
            if let Some(finally) = finally {
                if finally.blocks.contains(&reference) {
                    finally.blocks.push(new_block);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Operand, SuspendKind, Ty};
    use crate::lower::states::STATE_CLOSED;
    use crate::lower::{regions::RegionTree, states};

    fn lower_parts(
        mut func: IrFunction,
    ) -> (IrFunction, RegionTree, StateTable, ExtractionResult) {
        let tree = RegionTree::build(&func).unwrap();
        let table = states::number(&func, &tree);
        let mut next_block = func.next_block_id();
        let extraction = extract(&mut func, &tree, &mut next_block);
        (func, tree, table, extraction)
    }

    #[test]
    fn test_suspended_finally_is_extracted() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        b.begin_try();
        b.yield_value(Operand::int(1));
        b.begin_finally();
        let log = b.local("log", Ty::Int);
        b.assign(log, Operand::int(9));
        b.end_try();
        let func = b.finish();

        let finally_entry = match &func.regions[0].kind {
            crate::ir::RegionKind::Try {
                finally: Some(f), ..
            } => f.entry,
            _ => panic!("expected finally"),
        };

        let (body, _tree, _states, extraction) = lower_parts(func);
        assert_eq!(extraction.routines.len(), 1);
        let routine = &extraction.routines[0];
        assert_eq!(routine.name, "g::finally1");
        assert_eq!(routine.entry, finally_entry);
        // The cleanup blocks are gone from the step body.
        assert!(body.get_block(finally_entry).is_none());
        // The routine exit was rewritten to a return.
        assert!(matches!(
            routine.blocks[0].terminator,
            Terminator::Return(None)
        ));
        // A trampoline runs the routine on the normal path.
        let trampoline = body
            .blocks
            .iter()
            .find(|block| {
                block
                    .instructions
                    .iter()
                    .any(|i| matches!(i, Instr::RunCleanup { .. }))
            })
            .expect("trampoline missing");
        assert!(matches!(trampoline.terminator, Terminator::Jump(_)));
    }

    #[test]
    fn test_unsuspended_finally_stays_inline() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        b.yield_value(Operand::int(1));
        b.begin_try();
        let x = b.local("x", Ty::Int);
        b.assign(x, Operand::int(2));
        b.begin_finally();
        b.end_try();
        let func = b.finish();

        let (body, _tree, _states, extraction) = lower_parts(func);
        assert!(extraction.routines.is_empty());
        // All blocks survive in the body.
        assert_eq!(body.regions.len(), 1);
    }

    #[test]
    fn test_abandon_plan_is_innermost_first() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        for _ in 0..4 {
            b.begin_try();
        }
        b.yield_value(Operand::int(1));
        for _ in 0..4 {
            b.begin_finally();
            b.end_try();
        }
        let func = b.finish();

        let (_body, tree, table, extraction) = lower_parts(func);
        assert_eq!(extraction.routines.len(), 4);
        let plan = abandon_plan(&tree, &table, &extraction);
        assert_eq!(plan.len(), 1);
        let (state, open) = &plan[0];
        assert_eq!(*state, 0);
        assert_eq!(open.len(), 4);
        // Innermost first: the innermost region closed first, so its
        // routine was extracted first.
        let innermost = extraction
            .routines
            .iter()
            .map(|r| r.region)
            .next()
            .unwrap();
        assert_eq!(extraction.by_region[&innermost], open[0]);
    }

    #[test]
    fn test_abandon_plan_skips_in_progress_cleanup() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        b.begin_try();
        b.yield_value(Operand::int(1));
        b.begin_finally();
        b.yield_value(Operand::int(2));
        b.end_try();
        let func = b.finish();

        let (_body, tree, table, extraction) = lower_parts(func);
        let plan = abandon_plan(&tree, &table, &extraction);
        // Normal state: the finally routine is open.
        let normal = plan.iter().find(|(s, _)| *s == 0).unwrap();
        assert_eq!(normal.1.len(), 1);
        // Cleanup state: the in-progress routine is not restarted.
        let cleanup = plan.iter().find(|(s, _)| *s < STATE_CLOSED).unwrap();
        assert!(cleanup.1.is_empty());
    }
}
