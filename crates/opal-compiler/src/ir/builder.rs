//! Function Builder
//!
//! Emission helpers for constructing IR bodies: block allocation,
//! instruction emission, suspension-point splitting and structured-region
//! scoping. Region metadata is recorded here so the lowering pass can
//! rebuild the region tree without re-discovering structure.

use super::block::{BasicBlock, BasicBlockId, Terminator};
use super::function::{
    CatchClause, FinallyClause, IrFunction, RegionInfo, RegionKind, SuspendKind,
};
use super::instr::{BinOp, Instr, UnOp};
use super::value::{
    HostFuncId, LocalDecl, LocalId, LocalKind, Operand, Place, RegionId, SuspendId, Ty,
};

/// Placeholder target patched when a region closes
const PENDING_TARGET: BasicBlockId = BasicBlockId(u32::MAX);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Body,
    Catch,
    Finally,
}

enum FrameKind {
    Try {
        catches: Vec<CatchClause>,
        building_catch: Option<CatchClause>,
        finally: Option<FinallyClause>,
    },
    Scoped {
        resource: LocalId,
        dispose: HostFuncId,
    },
    Loop,
}

struct RegionFrame {
    id: RegionId,
    kind: FrameKind,
    phase: Phase,
    blocks: Vec<BasicBlockId>,
    /// Unterminated fall-through blocks to patch at region close
    pending_exits: Vec<BasicBlockId>,
    /// Blocks holding `PENDING_TARGET` jumps to the region's continuation
    pending_patches: Vec<BasicBlockId>,
}

impl RegionFrame {
    fn record(&mut self, id: BasicBlockId) {
        match (self.phase, &mut self.kind) {
            (
                Phase::Catch,
                FrameKind::Try {
                    building_catch: Some(catch),
                    ..
                },
            ) => catch.blocks.push(id),
            (Phase::Finally, FrameKind::Try {
                finally: Some(finally),
                ..
            }) => finally.blocks.push(id),
            _ => self.blocks.push(id),
        }
    }
}

/// Builder for a single IR function
pub struct FunctionBuilder {
    func: IrFunction,
    current: BasicBlockId,
    next_block: u32,
    next_suspend: u32,
    next_region: u32,
    region_stack: Vec<RegionFrame>,
}

impl FunctionBuilder {
    /// Create a builder positioned in a fresh entry block
    pub fn new(name: impl Into<String>, kind: SuspendKind) -> Self {
        let mut func = IrFunction::new(name, kind);
        let entry = BasicBlockId(0);
        func.add_block(BasicBlock::with_label(entry, "entry"));
        func.entry_block = entry;
        Self {
            func,
            current: entry,
            next_block: 1,
            next_suspend: 0,
            next_region: 0,
            region_stack: Vec::new(),
        }
    }

    /// Number of open type parameters on the function
    pub fn type_params(&mut self, count: u32) {
        self.func.type_params = count;
    }

    // ------------------------------------------------------------------
    // Locals
    // ------------------------------------------------------------------

    /// Declare a by-value parameter
    pub fn param(&mut self, name: impl Into<String>, ty: Ty) -> LocalId {
        let id = self
            .func
            .add_local(LocalDecl::new(Some(name.into()), ty, LocalKind::Param {
                by_ref: false,
            }));
        self.func.params.push(id);
        id
    }

    /// Declare a by-reference parameter
    pub fn ref_param(&mut self, name: impl Into<String>, ty: Ty) -> LocalId {
        let id = self
            .func
            .add_local(LocalDecl::new(Some(name.into()), ty, LocalKind::Param {
                by_ref: true,
            }));
        self.func.params.push(id);
        id
    }

    /// Declare the receiver of an instance function
    pub fn receiver(&mut self) -> LocalId {
        let id = self.func.add_local(LocalDecl::new(
            Some("self".into()),
            Ty::Obj,
            LocalKind::Receiver,
        ));
        self.func.params.push(id);
        id
    }

    /// Declare a user local
    pub fn local(&mut self, name: impl Into<String>, ty: Ty) -> LocalId {
        self.func
            .add_local(LocalDecl::new(Some(name.into()), ty, LocalKind::Local))
    }

    /// Declare an address-sensitive local that must not cross a suspension
    pub fn pinned_local(&mut self, name: impl Into<String>, ty: Ty) -> LocalId {
        let mut decl = LocalDecl::new(Some(name.into()), ty, LocalKind::Local);
        decl.pinned = true;
        self.func.add_local(decl)
    }

    /// Declare a compiler temporary
    pub fn temp(&mut self, ty: Ty) -> LocalId {
        self.func.add_local(LocalDecl::new(None, ty, LocalKind::Temp))
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    /// The block currently being filled
    pub fn current(&self) -> BasicBlockId {
        self.current
    }

    /// Allocate a new block without switching to it
    pub fn create_block(&mut self) -> BasicBlockId {
        let id = BasicBlockId(self.next_block);
        self.next_block += 1;
        self.func.add_block(BasicBlock::new(id));
        for frame in &mut self.region_stack {
            frame.record(id);
        }
        id
    }

    /// Switch emission to an existing block
    pub fn switch_to(&mut self, id: BasicBlockId) {
        self.current = id;
    }

    /// Allocate a block, jump to it from the current one, and switch
    pub fn start_block(&mut self) -> BasicBlockId {
        let id = self.create_block();
        self.terminate(Terminator::Jump(id));
        self.current = id;
        id
    }

    fn current_block_mut(&mut self) -> &mut BasicBlock {
        let id = self.current;
        self.func
            .get_block_mut(id)
            .expect("current block not found")
    }

    fn terminate(&mut self, term: Terminator) {
        let block = self.current_block_mut();
        if !block.is_terminated() {
            block.set_terminator(term);
        }
    }

    // ------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------

    /// Emit an arbitrary instruction
    pub fn emit(&mut self, instr: Instr) {
        self.current_block_mut().add_instr(instr);
    }

    /// dest = value
    pub fn assign(&mut self, dest: LocalId, value: Operand) {
        self.emit(Instr::Assign {
            dest: Place::Local(dest),
            value,
        });
    }

    /// dest = left op right
    pub fn binop(&mut self, dest: LocalId, op: BinOp, left: Operand, right: Operand) {
        self.emit(Instr::BinaryOp {
            dest: Place::Local(dest),
            op,
            left,
            right,
        });
    }

    /// dest = op operand
    pub fn unop(&mut self, dest: LocalId, op: UnOp, operand: Operand) {
        self.emit(Instr::UnaryOp {
            dest: Place::Local(dest),
            op,
            operand,
        });
    }

    /// dest = func(args)
    pub fn call(&mut self, dest: Option<LocalId>, func: HostFuncId, args: Vec<Operand>) {
        self.emit(Instr::Call {
            dest: dest.map(Place::Local),
            func,
            args,
        });
    }

    // ------------------------------------------------------------------
    // Terminators
    // ------------------------------------------------------------------

    /// Unconditional jump
    pub fn jump(&mut self, target: BasicBlockId) {
        self.terminate(Terminator::Jump(target));
    }

    /// Conditional branch
    pub fn branch(&mut self, cond: Operand, then_block: BasicBlockId, else_block: BasicBlockId) {
        self.terminate(Terminator::Branch {
            cond,
            then_block,
            else_block,
        });
    }

    /// Return from the function
    pub fn ret(&mut self, value: Option<Operand>) {
        self.terminate(Terminator::Return(value));
    }

    /// Raise a user fault
    pub fn throw(&mut self, value: Operand) {
        self.terminate(Terminator::Throw(value));
    }

    /// Produce a value at a suspension point (generator flavor) and
    /// continue emission in the resume block
    pub fn yield_value(&mut self, value: Operand) -> SuspendId {
        self.suspend(value, None)
    }

    /// Await an operand (async flavor), landing the resumption input in
    /// `dest`, and continue emission in the resume block
    pub fn await_into(&mut self, dest: LocalId, value: Operand) -> SuspendId {
        self.suspend(value, Some(Place::Local(dest)))
    }

    fn suspend(&mut self, value: Operand, result: Option<Place>) -> SuspendId {
        let point = SuspendId(self.next_suspend);
        self.next_suspend += 1;
        let resume = self.create_block();
        self.terminate(Terminator::Suspend {
            point,
            value,
            resume,
            result,
        });
        self.current = resume;
        point
    }

    // ------------------------------------------------------------------
    // Regions
    // ------------------------------------------------------------------

    fn push_frame(&mut self, kind: FrameKind) {
        let id = RegionId(self.next_region);
        self.next_region += 1;
        self.region_stack.push(RegionFrame {
            id,
            kind,
            phase: Phase::Body,
            blocks: Vec::new(),
            pending_exits: Vec::new(),
            pending_patches: Vec::new(),
        });
        // The region starts in a fresh block so its block set is exact.
        self.start_block();
    }

    fn seal_phase(&mut self) {
        let current = self.current;
        let terminated = self
            .func
            .get_block(current)
            .map(|b| b.is_terminated())
            .unwrap_or(true);
        let frame = self.region_stack.last_mut().expect("no open region");
        if !terminated {
            frame.pending_exits.push(current);
        }
    }

    /// Open an exception-protected region
    pub fn begin_try(&mut self) {
        self.push_frame(FrameKind::Try {
            catches: Vec::new(),
            building_catch: None,
            finally: None,
        });
    }

    /// Open a catch handler of the innermost try region
    pub fn begin_catch(&mut self, binding: Option<LocalId>) {
        self.seal_phase();
        let entry = BasicBlockId(self.next_block);
        self.next_block += 1;
        self.func.add_block(BasicBlock::new(entry));
        // The handler entry belongs to enclosing regions, but within the
        // innermost frame it belongs to the catch clause being built.
        let depth = self.region_stack.len();
        for frame in &mut self.region_stack[..depth - 1] {
            frame.record(entry);
        }
        let frame = self.region_stack.last_mut().expect("no open region");
        match &mut frame.kind {
            FrameKind::Try {
                catches,
                building_catch,
                ..
            } => {
                if let Some(done) = building_catch.take() {
                    catches.push(done);
                }
                *building_catch = Some(CatchClause {
                    binding,
                    entry,
                    blocks: vec![entry],
                });
            }
            _ => panic!("begin_catch outside try region"),
        }
        frame.phase = Phase::Catch;
        self.current = entry;
    }

    /// Open the finally clause of the innermost try region
    pub fn begin_finally(&mut self) {
        self.seal_phase();
        let entry = BasicBlockId(self.next_block);
        self.next_block += 1;
        self.func.add_block(BasicBlock::new(entry));
        let depth = self.region_stack.len();
        for frame in &mut self.region_stack[..depth - 1] {
            frame.record(entry);
        }
        let frame = self.region_stack.last_mut().expect("no open region");
        match &mut frame.kind {
            FrameKind::Try {
                catches,
                building_catch,
                finally,
            } => {
                if let Some(done) = building_catch.take() {
                    catches.push(done);
                }
                *finally = Some(FinallyClause {
                    entry,
                    blocks: vec![entry],
                });
            }
            _ => panic!("begin_finally outside try region"),
        }
        frame.phase = Phase::Finally;
        self.current = entry;
    }

    /// Close the innermost try region and continue after it
    pub fn end_try(&mut self) -> BasicBlockId {
        self.seal_phase();
        let frame = self.region_stack.pop().expect("no open region");
        let frame_id = frame.id;
        let frame_blocks = frame.blocks;
        let pending_exits = frame.pending_exits;
        let pending_patches = frame.pending_patches;
        let (catches, finally) = match frame.kind {
            FrameKind::Try {
                mut catches,
                building_catch,
                finally,
            } => {
                if let Some(done) = building_catch {
                    catches.push(done);
                }
                (catches, finally)
            }
            _ => panic!("end_try outside try region"),
        };

        // `after` lives outside the region: allocate once the frame is off
        // the stack so only outer regions record it.
        let after = BasicBlockId(self.next_block);
        self.next_block += 1;
        self.func.add_block(BasicBlock::new(after));
        for outer in &mut self.region_stack {
            outer.record(after);
        }

        // Fall-through exits of the body and handlers route through the
        // finally when present. The finally's own exit continues after.
        for exit in &pending_exits {
            let in_finally = finally
                .as_ref()
                .map(|f| f.blocks.contains(exit))
                .unwrap_or(false);
            let target = match &finally {
                Some(f) if !in_finally => f.entry,
                _ => after,
            };
            if let Some(block) = self.func.get_block_mut(*exit) {
                block.set_terminator(Terminator::Jump(target));
            }
        }
        self.patch_pending(&pending_patches, after);

        self.func.regions.push(RegionInfo {
            id: frame_id,
            kind: RegionKind::Try { catches, finally },
            blocks: frame_blocks,
            after,
        });
        self.current = after;
        after
    }

    /// Open a scoped-resource region; the resource is disposed through
    /// `dispose` whenever the region exits
    pub fn begin_scoped(
        &mut self,
        name: impl Into<String>,
        ty: Ty,
        acquire: Operand,
        dispose: HostFuncId,
    ) -> LocalId {
        let resource = self.local(name, ty);
        self.assign(resource, acquire);
        self.push_frame(FrameKind::Scoped { resource, dispose });
        resource
    }

    /// Close the innermost scoped-resource region
    pub fn end_scoped(&mut self) -> BasicBlockId {
        self.seal_phase();
        let frame = self.region_stack.pop().expect("no open region");
        let (resource, dispose) = match frame.kind {
            FrameKind::Scoped { resource, dispose } => (resource, dispose),
            _ => panic!("end_scoped outside scoped region"),
        };
        let after = BasicBlockId(self.next_block);
        self.next_block += 1;
        self.func.add_block(BasicBlock::new(after));
        for outer in &mut self.region_stack {
            outer.record(after);
        }
        for exit in &frame.pending_exits {
            if let Some(block) = self.func.get_block_mut(*exit) {
                block.set_terminator(Terminator::Jump(after));
            }
        }
        self.patch_pending(&frame.pending_patches, after);
        self.func.regions.push(RegionInfo {
            id: frame.id,
            kind: RegionKind::ScopedResource { resource, dispose },
            blocks: frame.blocks,
            after,
        });
        self.current = after;
        after
    }

    /// Open a loop region; emission continues in the loop header
    pub fn begin_loop(&mut self) -> BasicBlockId {
        self.push_frame(FrameKind::Loop);
        self.current
    }

    /// Branch out of the loop: `cond` false exits to the loop's
    /// continuation (resolved at `end_loop`)
    pub fn loop_branch(&mut self, cond: Operand, body: BasicBlockId) {
        let current = self.current;
        self.terminate(Terminator::Branch {
            cond,
            then_block: body,
            else_block: PENDING_TARGET,
        });
        let frame = self.region_stack.last_mut().expect("no open region");
        frame.pending_patches.push(current);
    }

    /// Jump out of the loop (resolved at `end_loop`)
    pub fn exit_loop(&mut self) {
        let current = self.current;
        self.terminate(Terminator::Jump(PENDING_TARGET));
        let frame = self.region_stack.last_mut().expect("no open region");
        frame.pending_patches.push(current);
    }

    /// Close the innermost loop region and continue after it
    pub fn end_loop(&mut self) -> BasicBlockId {
        self.seal_phase();
        let frame = self.region_stack.pop().expect("no open region");
        if !matches!(frame.kind, FrameKind::Loop) {
            panic!("end_loop outside loop region");
        }
        let after = BasicBlockId(self.next_block);
        self.next_block += 1;
        self.func.add_block(BasicBlock::new(after));
        for outer in &mut self.region_stack {
            outer.record(after);
        }
        for exit in &frame.pending_exits {
            if let Some(block) = self.func.get_block_mut(*exit) {
                block.set_terminator(Terminator::Jump(after));
            }
        }
        self.patch_pending(&frame.pending_patches, after);
        self.func.regions.push(RegionInfo {
            id: frame.id,
            kind: RegionKind::Loop,
            blocks: frame.blocks,
            after,
        });
        self.current = after;
        after
    }

    fn patch_pending(&mut self, pending: &[BasicBlockId], after: BasicBlockId) {
        for id in pending {
            if let Some(block) = self.func.get_block_mut(*id) {
                block.terminator.for_each_target_mut(|target| {
                    if *target == PENDING_TARGET {
                        *target = after;
                    }
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Finish
    // ------------------------------------------------------------------

    /// Finish the function, closing the final block with a void return if
    /// it is not already terminated
    pub fn finish(mut self) -> IrFunction {
        assert!(
            self.region_stack.is_empty(),
            "unclosed region in function builder"
        );
        let block = self.current_block_mut();
        if !block.is_terminated() {
            block.set_terminator(Terminator::Return(None));
        }
        self.func
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_body_auto_return() {
        let mut b = FunctionBuilder::new("f", SuspendKind::None);
        let x = b.local("x", Ty::Int);
        b.assign(x, Operand::int(1));
        let func = b.finish();
        assert_eq!(func.blocks.len(), 1);
        assert!(matches!(
            func.blocks[0].terminator,
            Terminator::Return(None)
        ));
    }

    #[test]
    fn test_yield_splits_block() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        b.yield_value(Operand::int(1));
        b.yield_value(Operand::int(2));
        let func = b.finish();
        assert_eq!(func.suspend_points().len(), 2);
        assert_eq!(func.blocks.len(), 3);
    }

    #[test]
    fn test_try_finally_region_metadata() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        b.begin_try();
        b.yield_value(Operand::int(1));
        b.begin_finally();
        let log = b.local("log", Ty::Int);
        b.assign(log, Operand::int(9));
        let after = b.end_try();
        let func = b.finish();

        assert_eq!(func.regions.len(), 1);
        let region = &func.regions[0];
        assert_eq!(region.after, after);
        match &region.kind {
            RegionKind::Try { catches, finally } => {
                assert!(catches.is_empty());
                let finally = finally.as_ref().expect("finally clause");
                // The finally exit continues after the region.
                let exit = func.get_block(finally.blocks[0]).unwrap();
                assert!(matches!(exit.terminator, Terminator::Jump(t) if t == after));
            }
            _ => panic!("expected try region"),
        }
        // The try body's fall-through routes through the finally entry.
        let body_exit = region
            .blocks
            .iter()
            .filter_map(|id| func.get_block(*id))
            .find(|block| match block.terminator {
                Terminator::Jump(t) => {
                    matches!(&region.kind, RegionKind::Try { finally: Some(f), .. } if f.entry == t)
                }
                _ => false,
            });
        assert!(body_exit.is_some());
    }

    #[test]
    fn test_loop_region_patching() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        let i = b.local("i", Ty::Int);
        let cond = b.local("cond", Ty::Bool);
        b.assign(i, Operand::int(0));
        let header = b.begin_loop();
        b.binop(cond, BinOp::Lt, i.into(), Operand::int(3));
        let body = b.create_block();
        b.loop_branch(cond.into(), body);
        b.switch_to(body);
        b.yield_value(i.into());
        b.binop(i, BinOp::Add, i.into(), Operand::int(1));
        b.jump(header);
        let after = b.end_loop();
        let func = b.finish();

        let region = &func.regions[0];
        assert!(matches!(region.kind, RegionKind::Loop));
        assert_eq!(region.after, after);
        // The header branch must exit to the patched continuation.
        let header_block = func.get_block(header).unwrap();
        match &header_block.terminator {
            Terminator::Branch { else_block, .. } => assert_eq!(*else_block, after),
            other => panic!("expected branch, found {other:?}"),
        }
    }

    #[test]
    fn test_nested_regions_record_inner_blocks_in_outer() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        b.begin_try();
        b.begin_try();
        b.yield_value(Operand::int(1));
        b.begin_finally();
        b.end_try();
        b.begin_finally();
        b.end_try();
        let func = b.finish();

        assert_eq!(func.regions.len(), 2);
        // Regions close innermost first.
        let inner = &func.regions[0];
        let outer = &func.regions[1];
        for block in inner.all_blocks() {
            assert!(
                outer.all_blocks().contains(&block),
                "outer region must contain inner block {block}"
            );
        }
    }
}
