//! Capture Analysis
//!
//! Decides which locals must be promoted to frame slots: a local whose
//! live range crosses a suspension edge cannot stay a transient and has
//! to persist in the frame. Liveness is block-granular backward dataflow
//! (upward-exposed uses vs. defs, worklist to fixpoint).

use crate::error::{LowerError, LowerResult};
use crate::ir::{
    BasicBlockId, IrFunction, LocalId, Operand, Place, RegionKind, SuspendId, Terminator, Ty,
};
use rustc_hash::{FxHashMap, FxHashSet};

/// One local that must live in the frame
#[derive(Debug)]
pub struct PromotedLocal {
    pub local: LocalId,
    pub ty: Ty,
    pub name: Option<String>,
    /// Suspension points this local is live across
    pub crosses: FxHashSet<SuspendId>,
    /// Blocks where this local is live (slot-interference granularity)
    pub live_blocks: FxHashSet<BasicBlockId>,
    /// By-reference parameters and receivers never share slots
    pub by_ref: bool,
}

/// Result of capture analysis
#[derive(Debug, Default)]
pub struct CaptureAnalysis {
    /// Promoted locals in declaration order
    pub promoted: Vec<PromotedLocal>,
    promoted_set: FxHashSet<LocalId>,
}

impl CaptureAnalysis {
    /// Whether a local was promoted to a frame slot
    pub fn is_promoted(&self, local: LocalId) -> bool {
        self.promoted_set.contains(&local)
    }
}

struct BlockFacts {
    ue_use: FxHashSet<LocalId>,
    defs: FxHashSet<LocalId>,
    live_in: FxHashSet<LocalId>,
    live_out: FxHashSet<LocalId>,
}

/// Run capture analysis over a function body
pub fn analyze(func: &IrFunction) -> LowerResult<CaptureAnalysis> {
    let order: Vec<BasicBlockId> = func.blocks.iter().map(|b| b.id).collect();
    let index: FxHashMap<BasicBlockId, usize> =
        order.iter().enumerate().map(|(i, b)| (*b, i)).collect();

    // Locals defined at a block's entry rather than by an instruction:
    // suspension results land at the head of the resume block, catch
    // bindings at the head of the handler.
    let mut entry_defs: FxHashMap<BasicBlockId, FxHashSet<LocalId>> = FxHashMap::default();
    for point in func.suspend_points() {
        if let Some(Place::Local(local)) = point.result {
            entry_defs.entry(point.resume).or_default().insert(local);
        }
    }
    for region in &func.regions {
        if let RegionKind::Try { catches, .. } = &region.kind {
            for catch in catches {
                if let Some(binding) = catch.binding {
                    entry_defs.entry(catch.entry).or_default().insert(binding);
                }
            }
        }
    }

    // A scoped resource is consumed by its synthesized dispose when the
    // region exits, so it stays live through the whole region.
    let mut extra_uses: FxHashMap<BasicBlockId, Vec<LocalId>> = FxHashMap::default();
    for region in &func.regions {
        if let RegionKind::ScopedResource { resource, .. } = &region.kind {
            extra_uses.entry(region.after).or_default().push(*resource);
        }
    }

    let mut facts: Vec<BlockFacts> = Vec::with_capacity(order.len());
    for block in &func.blocks {
        fn read(operand: &Operand, defs: &FxHashSet<LocalId>, ue: &mut FxHashSet<LocalId>) {
            if let Some(local) = operand.as_local() {
                if !defs.contains(&local) {
                    ue.insert(local);
                }
            }
        }
        let mut defs: FxHashSet<LocalId> =
            entry_defs.get(&block.id).cloned().unwrap_or_default();
        let mut ue_use: FxHashSet<LocalId> = FxHashSet::default();
        for instr in &block.instructions {
            instr.for_each_operand(|op| read(op, &defs, &mut ue_use));
            if let Some(Place::Local(local)) = instr.dest() {
                defs.insert(*local);
            }
        }
        block
            .terminator
            .for_each_operand(|op| read(op, &defs, &mut ue_use));
        if let Some(extra) = extra_uses.get(&block.id) {
            for local in extra {
                if !defs.contains(local) {
                    ue_use.insert(*local);
                }
            }
        }
        facts.push(BlockFacts {
            ue_use,
            defs,
            live_in: FxHashSet::default(),
            live_out: FxHashSet::default(),
        });
    }

    // Predecessor map for the backward worklist.
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); order.len()];
    for (i, block) in func.blocks.iter().enumerate() {
        for succ in block.terminator.successors() {
            let Some(&j) = index.get(&succ) else {
                return Err(LowerError::UnknownBlock {
                    function: func.name.clone(),
                    block: succ.as_u32(),
                });
            };
            preds[j].push(i);
        }
    }

    let mut worklist: Vec<usize> = (0..order.len()).collect();
    while let Some(i) = worklist.pop() {
        let mut live_out: FxHashSet<LocalId> = FxHashSet::default();
        for succ in func.blocks[i].terminator.successors() {
            let j = index[&succ];
            live_out.extend(facts[j].live_in.iter().copied());
        }
        let mut live_in = facts[i].ue_use.clone();
        for local in &live_out {
            if !facts[i].defs.contains(local) {
                live_in.insert(*local);
            }
        }
        facts[i].live_out = live_out;
        if live_in != facts[i].live_in {
            facts[i].live_in = live_in;
            for &p in &preds[i] {
                worklist.push(p);
            }
        }
    }

    // Promotion: live across a suspension edge.
    let mut promoted: FxHashMap<LocalId, FxHashSet<SuspendId>> = FxHashMap::default();
    for point in func.suspend_points() {
        let resume_idx = index[&point.resume];
        let result_local = match point.result {
            Some(Place::Local(local)) => Some(local),
            _ => None,
        };
        for local in &facts[resume_idx].live_in {
            if Some(*local) == result_local {
                continue;
            }
            promoted.entry(*local).or_default().insert(point.point);
        }
    }

    // By-reference parameters and receivers: promoted when referenced in
    // any block reachable from a resume target.
    let refs = reference_blocks(func);
    for &param in &func.params {
        let decl = &func.locals[param.0 as usize];
        if !decl.kind.is_by_ref() {
            continue;
        }
        let Some(ref_blocks) = refs.get(&param) else {
            continue;
        };
        for point in func.suspend_points() {
            let reach = reachable_from(func, &index, point.resume);
            if ref_blocks.iter().any(|b| reach.contains(b)) {
                promoted.entry(param).or_default().insert(point.point);
            }
        }
    }

    let mut analysis = CaptureAnalysis::default();
    let mut locals: Vec<LocalId> = promoted.keys().copied().collect();
    locals.sort();
    for local in locals {
        let decl = func.local(local).ok_or(LowerError::UnknownLocal {
            function: func.name.clone(),
            local: local.as_u32(),
        })?;
        if decl.pinned {
            return Err(LowerError::PinnedCapture {
                name: decl.display_name(local),
            });
        }
        let by_ref = decl.kind.is_by_ref();
        let live_blocks = if by_ref {
            order.iter().copied().collect()
        } else {
            let mut blocks = FxHashSet::default();
            for (i, fact) in facts.iter().enumerate() {
                if fact.live_in.contains(&local) || fact.live_out.contains(&local) {
                    blocks.insert(order[i]);
                }
            }
            blocks
        };
        analysis.promoted.push(PromotedLocal {
            local,
            ty: decl.ty,
            name: decl.name.clone(),
            crosses: promoted[&local].clone(),
            live_blocks,
            by_ref,
        });
        analysis.promoted_set.insert(local);
    }
    Ok(analysis)
}

/// Every block where a local is read or written
fn reference_blocks(func: &IrFunction) -> FxHashMap<LocalId, FxHashSet<BasicBlockId>> {
    let mut refs: FxHashMap<LocalId, FxHashSet<BasicBlockId>> = FxHashMap::default();
    for block in &func.blocks {
        let mut touch = |local: LocalId| {
            refs.entry(local).or_default().insert(block.id);
        };
        for instr in &block.instructions {
            instr.for_each_operand(|op| {
                if let Some(local) = op.as_local() {
                    touch(local);
                }
            });
            if let Some(Place::Local(local)) = instr.dest() {
                touch(*local);
            }
        }
        block.terminator.for_each_operand(|op| {
            if let Some(local) = op.as_local() {
                touch(local);
            }
        });
        if let Terminator::Suspend {
            result: Some(Place::Local(local)),
            ..
        } = block.terminator
        {
            touch(local);
        }
    }
    refs
}

/// Forward reachability from a block
fn reachable_from(
    func: &IrFunction,
    index: &FxHashMap<BasicBlockId, usize>,
    start: BasicBlockId,
) -> FxHashSet<BasicBlockId> {
    let mut seen: FxHashSet<BasicBlockId> = FxHashSet::default();
    let mut stack = vec![start];
    while let Some(block) = stack.pop() {
        if !seen.insert(block) {
            continue;
        }
        if let Some(&i) = index.get(&block) {
            for succ in func.blocks[i].terminator.successors() {
                stack.push(succ);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, FunctionBuilder, Operand, SuspendKind};

    #[test]
    fn test_local_live_across_yield_is_promoted() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        let acc = b.local("acc", Ty::Int);
        b.assign(acc, Operand::int(0));
        b.yield_value(Operand::int(1));
        b.binop(acc, BinOp::Add, acc.into(), Operand::int(1));
        b.ret(Some(acc.into()));
        let func = b.finish();

        let analysis = analyze(&func).unwrap();
        assert!(analysis.is_promoted(acc));
        assert_eq!(analysis.promoted.len(), 1);
    }

    #[test]
    fn test_local_dead_after_yield_is_not_promoted() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        let x = b.local("x", Ty::Int);
        b.assign(x, Operand::int(3));
        b.yield_value(x.into());
        b.ret(None);
        let func = b.finish();

        let analysis = analyze(&func).unwrap();
        assert!(!analysis.is_promoted(x));
        assert!(analysis.promoted.is_empty());
    }

    #[test]
    fn test_param_unused_after_first_suspend_is_not_promoted() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        let seed = b.param("seed", Ty::Int);
        b.yield_value(seed.into());
        b.yield_value(Operand::int(2));
        let func = b.finish();

        let analysis = analyze(&func).unwrap();
        assert!(!analysis.is_promoted(seed));
    }

    #[test]
    fn test_await_result_is_not_promoted_by_its_own_edge() {
        let mut b = FunctionBuilder::new("a", SuspendKind::Async);
        let got = b.local("got", Ty::Int);
        b.await_into(got, Operand::int(10));
        b.ret(Some(got.into()));
        let func = b.finish();

        let analysis = analyze(&func).unwrap();
        assert!(!analysis.is_promoted(got));
    }

    #[test]
    fn test_await_result_live_across_later_await_is_promoted() {
        let mut b = FunctionBuilder::new("a", SuspendKind::Async);
        let first = b.local("first", Ty::Int);
        let second = b.local("second", Ty::Int);
        b.await_into(first, Operand::int(10));
        b.await_into(second, Operand::int(20));
        let sum = b.local("sum", Ty::Int);
        b.binop(sum, BinOp::Add, first.into(), second.into());
        b.ret(Some(sum.into()));
        let func = b.finish();

        let analysis = analyze(&func).unwrap();
        assert!(analysis.is_promoted(first));
        assert!(!analysis.is_promoted(second));
    }

    #[test]
    fn test_pinned_local_across_suspend_is_rejected() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        let p = b.pinned_local("p", Ty::Int);
        b.assign(p, Operand::int(1));
        b.yield_value(Operand::int(0));
        b.ret(Some(p.into()));
        let func = b.finish();

        match analyze(&func) {
            Err(LowerError::PinnedCapture { name }) => assert_eq!(name, "p"),
            other => panic!("expected pinned capture error, got {other:?}"),
        }
    }

    #[test]
    fn test_scoped_resource_stays_live_through_region() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        // Host ids are resolved against the module table by the caller.
        let dispose = crate::ir::HostFuncId(0);
        let res = b.begin_scoped("res", Ty::Obj, Operand::unit(), dispose);
        b.yield_value(Operand::int(1));
        b.end_scoped();
        let func = b.finish();

        let analysis = analyze(&func).unwrap();
        assert!(analysis.is_promoted(res));
    }
}
