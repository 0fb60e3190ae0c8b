//! Step Execution
//!
//! Drives a lowered body against a frame. One call advances exactly one
//! transition: from the dispatch block to the next suspension, to
//! completion, or to a terminal fault. Unwinding walks the lowered
//! region table innermost first, running each passed region's cleanup
//! and entering the innermost applicable catch; an uncaught fault closes
//! the frame and is reported through the contract, never through the
//! caller's physical stack.

use crate::error::{RuntimeError, RuntimeResult};
use crate::frame::Frame;
use crate::host::LinkedHost;
use crate::value::Value;
use opal_compiler::ir::{
    BasicBlock, BasicBlockId, BinOp, CleanupId, Const, Instr, Operand, Place, RegionId,
    Terminator, UnOp,
};
use opal_compiler::{LoweredFunction, LoweredRegion, RegionCleanup};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Outcome of one step call
#[derive(Debug)]
pub enum StepEvent {
    /// Execution left the frame at a suspension point
    Suspended { state: i32, value: Value },
    /// Normal completion with the final value (`Unit` for void)
    Completed(Value),
    /// Terminal fault, reported through the active contract
    Faulted(Value),
}

/// Where a block lives: the step body or an extracted cleanup routine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Body,
    Routine(usize),
}

/// Executes one lowered function against frames
#[derive(Clone)]
pub struct Evaluator {
    lowered: Arc<LoweredFunction>,
    host: LinkedHost,
    owners: FxHashMap<BasicBlockId, Owner>,
    region_index: FxHashMap<RegionId, usize>,
}

impl Evaluator {
    pub fn new(lowered: Arc<LoweredFunction>, host: LinkedHost) -> Self {
        let mut owners = FxHashMap::default();
        for block in &lowered.body.blocks {
            owners.insert(block.id, Owner::Body);
        }
        for (i, routine) in lowered.cleanups.iter().enumerate() {
            for block in &routine.blocks {
                owners.insert(block.id, Owner::Routine(i));
            }
        }
        let region_index = lowered
            .regions
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id, i))
            .collect();
        Self {
            lowered,
            host,
            owners,
            region_index,
        }
    }

    pub fn lowered(&self) -> &LoweredFunction {
        &self.lowered
    }

    /// Create a fresh frame for this function
    pub fn new_frame(&self, args: Vec<Value>) -> Frame {
        Frame::new(&self.lowered, args)
    }

    /// Advance the frame by exactly one transition
    pub fn step(&self, frame: &mut Frame, resume_input: Option<Value>) -> RuntimeResult<StepEvent> {
        if frame.is_closed() {
            return Err(RuntimeError::ResumedAfterCompletion);
        }
        let mut locals = self.fresh_locals(frame);
        let pending = resume_input;
        let entry = self.lowered.body.entry_block;
        self.run_from(frame, &mut locals, pending, entry)
    }

    /// Resume the frame with a fault instead of a value: the fault is
    /// raised at the suspension point the frame is parked on, so the
    /// function's own handlers and cleanups see it (a faulted awaitable
    /// in the push contract).
    pub fn step_with_fault(&self, frame: &mut Frame, fault: Value) -> RuntimeResult<StepEvent> {
        if frame.is_closed() {
            return Err(RuntimeError::ResumedAfterCompletion);
        }
        let state = frame.cursor;
        let entry = self
            .lowered
            .states
            .entries
            .iter()
            .find(|e| e.state == state)
            .ok_or_else(|| RuntimeError::malformed("fault injection on a non-suspended frame"))?;
        let suspend_block = entry.block;
        let mut locals = self.fresh_locals(frame);
        frame.cursor = opal_compiler::STATE_RUNNING;
        match self.unwind(frame, &mut locals, suspend_block, fault)? {
            Unwind::Continue(target) => self.run_from(frame, &mut locals, None, target),
            Unwind::Terminal(fault) => Ok(StepEvent::Faulted(fault)),
        }
    }

    fn run_from(
        &self,
        frame: &mut Frame,
        locals: &mut Vec<Value>,
        mut pending: Option<Value>,
        start: BasicBlockId,
    ) -> RuntimeResult<StepEvent> {
        let mut current = start;

        'blocks: loop {
            let block = self.block(current)?.clone();
            for instr in &block.instructions {
                match self.exec_instr(frame, locals, &mut pending, instr) {
                    Ok(None) => {}
                    Ok(Some(jump)) => {
                        current = jump;
                        continue 'blocks;
                    }
                    Err(fault) => match self.unwind(frame, locals, current, fault)? {
                        Unwind::Continue(target) => {
                            current = target;
                            continue 'blocks;
                        }
                        Unwind::Terminal(fault) => return Ok(StepEvent::Faulted(fault)),
                    },
                }
            }

            match &block.terminator {
                Terminator::Jump(target) => current = *target,
                Terminator::Branch {
                    cond,
                    then_block,
                    else_block,
                } => {
                    let cond = self
                        .eval_operand(frame, &locals, cond)
                        .as_bool()
                        .ok_or_else(|| RuntimeError::malformed("branch on non-boolean"))?;
                    current = if cond { *then_block } else { *else_block };
                }
                Terminator::Switch {
                    value,
                    cases,
                    default,
                } => {
                    let value = self
                        .eval_operand(frame, &locals, value)
                        .as_int()
                        .ok_or_else(|| RuntimeError::malformed("switch on non-integer"))?;
                    current = cases
                        .iter()
                        .find(|(case, _)| *case == value)
                        .map(|(_, target)| *target)
                        .unwrap_or(*default);
                }
                Terminator::Throw(value) => {
                    let fault = self.eval_operand(frame, locals, value);
                    match self.unwind(frame, locals, current, fault)? {
                        Unwind::Continue(target) => current = target,
                        Unwind::Terminal(fault) => return Ok(StepEvent::Faulted(fault)),
                    }
                }
                Terminator::Suspend { point, value, .. } => {
                    let state = self
                        .lowered
                        .states
                        .state_of(*point)
                        .ok_or_else(|| RuntimeError::malformed("unnumbered suspension"))?;
                    let value = self.eval_operand(frame, locals, value);
                    return Ok(StepEvent::Suspended { state, value });
                }
                Terminator::Return(value) => match self.owner(current) {
                    // A routine return is a cleanup exit: execution
                    // continues after the routine's region.
                    Owner::Routine(i) => {
                        let region = self.lowered.cleanups[i].region;
                        current = self.region(region)?.after;
                    }
                    Owner::Body => {
                        let value = value
                            .as_ref()
                            .map(|v| self.eval_operand(frame, locals, v))
                            .unwrap_or(Value::Unit);
                        // Early exits still drain open regions, innermost
                        // first. A cleanup fault replaces the completion.
                        if let Err(fault) = self.run_open_cleanups(frame, locals, current) {
                            frame.close();
                            return Ok(StepEvent::Faulted(fault));
                        }
                        return Ok(StepEvent::Completed(value));
                    }
                },
                Terminator::Unreachable => {
                    return Err(RuntimeError::malformed("reached unreachable block"));
                }
            }
        }
    }

    /// Abandon the frame: run every open cleanup routine for the current
    /// state, innermost first, each exactly once. Faults do not stop the
    /// walk; the last one is re-raised after all routines ran.
    pub fn abandon(&self, frame: &mut Frame) -> RuntimeResult<()> {
        if frame.is_closed() {
            return Ok(());
        }
        if !frame.is_started() {
            frame.close();
            return Ok(());
        }
        let plan: Vec<CleanupId> = self.lowered.abandon_plan(frame.cursor).to_vec();
        let mut locals = self.fresh_locals(frame);
        let mut fault: Option<Value> = None;
        for id in plan {
            if let Err(f) = self.exec_cleanup(frame, &mut locals, id) {
                fault = Some(f);
            }
        }
        frame.close();
        match fault {
            Some(f) => Err(RuntimeError::CleanupFault(f)),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------

    /// Execute one instruction; `Ok(Some(_))` transfers control into a
    /// cleanup routine, `Err` is a user fault.
    fn exec_instr(
        &self,
        frame: &mut Frame,
        locals: &mut [Value],
        pending: &mut Option<Value>,
        instr: &Instr,
    ) -> Result<Option<BasicBlockId>, Value> {
        match instr {
            Instr::Assign { dest, value } => {
                let value = self.eval_operand(frame, locals, value);
                self.write_place(frame, locals, *dest, value);
            }
            Instr::BinaryOp {
                dest,
                op,
                left,
                right,
            } => {
                let left = self.eval_operand(frame, locals, left);
                let right = self.eval_operand(frame, locals, right);
                let value = apply_binop(*op, &left, &right)?;
                self.write_place(frame, locals, *dest, value);
            }
            Instr::UnaryOp { dest, op, operand } => {
                let operand = self.eval_operand(frame, locals, operand);
                let value = apply_unop(*op, &operand)?;
                self.write_place(frame, locals, *dest, value);
            }
            Instr::Call { dest, func, args } => {
                let args: Vec<Value> = args
                    .iter()
                    .map(|a| self.eval_operand(frame, locals, a))
                    .collect();
                let value = self.host.call(*func, &args)?;
                if let Some(dest) = dest {
                    self.write_place(frame, locals, *dest, value);
                }
            }
            Instr::LoadCursor { dest } => {
                self.write_place(frame, locals, *dest, Value::Int(frame.cursor as i64));
            }
            Instr::SetCursor { state } => {
                frame.cursor = *state;
            }
            Instr::TakeResume { dest } => {
                let value = pending.take().unwrap_or(Value::Unit);
                self.write_place(frame, locals, *dest, value);
            }
            Instr::RunCleanup { cleanup } => {
                let routine = self
                    .lowered
                    .cleanup(*cleanup)
                    .ok_or_else(|| Value::str("unknown cleanup routine"))?;
                return Ok(Some(routine.entry));
            }
        }
        Ok(None)
    }

    fn eval_operand(&self, frame: &Frame, locals: &[Value], operand: &Operand) -> Value {
        match operand {
            Operand::Local(local) => locals
                .get(local.as_u32() as usize)
                .cloned()
                .unwrap_or(Value::Unit),
            Operand::Slot(slot) => frame
                .slots
                .get(slot.as_u32() as usize)
                .cloned()
                .unwrap_or(Value::Unit),
            Operand::Const(c) => const_value(c),
        }
    }

    fn write_place(&self, frame: &mut Frame, locals: &mut [Value], place: Place, value: Value) {
        match place {
            Place::Local(local) => {
                if let Some(slot) = locals.get_mut(local.as_u32() as usize) {
                    *slot = value;
                }
            }
            Place::Slot(slot) => {
                if let Some(field) = frame.slots.get_mut(slot.as_u32() as usize) {
                    *field = value;
                }
            }
        }
    }

    fn fresh_locals(&self, frame: &Frame) -> Vec<Value> {
        let mut locals = vec![Value::Unit; self.lowered.body.locals.len()];
        for (i, param) in self.lowered.body.params.iter().enumerate() {
            if let (Some(slot), Some(value)) =
                (locals.get_mut(param.as_u32() as usize), frame.args.get(i))
            {
                *slot = value.clone();
            }
        }
        locals
    }

    // ------------------------------------------------------------------
    // Unwinding
    // ------------------------------------------------------------------

    fn unwind(
        &self,
        frame: &mut Frame,
        locals: &mut Vec<Value>,
        from: BasicBlockId,
        fault: Value,
    ) -> RuntimeResult<Unwind> {
        let mut fault = fault;
        for index in self.chain_of(from) {
            let region = &self.lowered.regions[index];
            // A fault raised inside the region's own inline cleanup is
            // already leaving: neither the catch nor the cleanup applies.
            if in_inline_finally(region, from) {
                continue;
            }
            if !region.in_catch(from) {
                if let Some(catch) = region.catches.first() {
                    if let Some(binding) = catch.binding {
                        self.write_place(frame, locals, binding, fault);
                    }
                    return Ok(Unwind::Continue(catch.entry));
                }
            }
            // Leaving the region: run its cleanup. A cleanup fault
            // replaces the one in flight; outer cleanups still run.
            if let Err(f) = self.run_region_cleanup(frame, locals, region) {
                fault = f;
            }
        }
        frame.close();
        Ok(Unwind::Terminal(fault))
    }

    /// Run the cleanups of every region open at `from`, innermost first.
    /// Used on the early-return path; faults replace each other, the
    /// last one wins.
    fn run_open_cleanups(
        &self,
        frame: &mut Frame,
        locals: &mut Vec<Value>,
        from: BasicBlockId,
    ) -> Result<(), Value> {
        let mut fault: Option<Value> = None;
        for index in self.chain_of(from) {
            let region = &self.lowered.regions[index];
            if in_inline_finally(region, from) {
                continue;
            }
            if let Err(f) = self.run_region_cleanup(frame, locals, region) {
                fault = Some(f);
            }
        }
        match fault {
            Some(f) => Err(f),
            None => Ok(()),
        }
    }

    fn run_region_cleanup(
        &self,
        frame: &mut Frame,
        locals: &mut Vec<Value>,
        region: &LoweredRegion,
    ) -> Result<(), Value> {
        match &region.cleanup {
            RegionCleanup::None => Ok(()),
            RegionCleanup::Extracted(id) => self.exec_cleanup(frame, locals, *id),
            RegionCleanup::InlineFinally { entry, blocks } => {
                self.run_limited(frame, locals, *entry, &|id| {
                    if blocks.contains(&id) {
                        self.block(id).ok()
                    } else {
                        None
                    }
                })
            }
            RegionCleanup::InlineDispose { resource, dispose } => {
                let value = self.eval_operand(frame, locals, resource);
                self.host.call(*dispose, &[value]).map(|_| ())
            }
        }
    }

    /// Execute an extracted cleanup routine synchronously (unwinding and
    /// abandonment). A suspension inside the routine cannot leave the
    /// frame here: it continues immediately with a unit resumption.
    fn exec_cleanup(
        &self,
        frame: &mut Frame,
        locals: &mut Vec<Value>,
        id: CleanupId,
    ) -> Result<(), Value> {
        let routine = self
            .lowered
            .cleanup(id)
            .ok_or_else(|| Value::str("unknown cleanup routine"))?;
        self.run_limited(frame, locals, routine.entry, &|block| {
            routine.get_block(block)
        })
    }

    /// Shared mini-executor for synchronous cleanup: runs until a return
    /// or until control leaves the resolvable block set.
    fn run_limited<'b>(
        &self,
        frame: &mut Frame,
        locals: &mut Vec<Value>,
        entry: BasicBlockId,
        resolve: &dyn Fn(BasicBlockId) -> Option<&'b BasicBlock>,
    ) -> Result<(), Value> {
        let mut current = entry;
        'blocks: loop {
            let Some(block) = resolve(current) else {
                return Ok(());
            };
            let block = block.clone();
            let mut pending: Option<Value> = None;
            for instr in &block.instructions {
                match self.exec_instr(frame, locals, &mut pending, instr) {
                    Ok(None) => {}
                    Ok(Some(routine_entry)) => {
                        // Nested extracted cleanup: run it to completion
                        // and fall through to the trampoline's jump.
                        let nested = self
                            .lowered
                            .cleanups
                            .iter()
                            .find(|r| r.entry == routine_entry)
                            .ok_or_else(|| Value::str("unknown cleanup routine"))?;
                        self.run_limited(frame, locals, nested.entry, &|b| nested.get_block(b))?;
                    }
                    Err(fault) => return Err(fault),
                }
            }
            match &block.terminator {
                Terminator::Jump(target) => current = *target,
                Terminator::Branch {
                    cond,
                    then_block,
                    else_block,
                } => {
                    let cond = self
                        .eval_operand(frame, locals, cond)
                        .as_bool()
                        .ok_or_else(|| Value::str("branch on non-boolean"))?;
                    current = if cond { *then_block } else { *else_block };
                }
                Terminator::Switch {
                    value,
                    cases,
                    default,
                } => {
                    let value = self
                        .eval_operand(frame, locals, value)
                        .as_int()
                        .ok_or_else(|| Value::str("switch on non-integer"))?;
                    current = cases
                        .iter()
                        .find(|(case, _)| *case == value)
                        .map(|(_, target)| *target)
                        .unwrap_or(*default);
                }
                Terminator::Return(_) => return Ok(()),
                Terminator::Throw(value) => {
                    return Err(self.eval_operand(frame, locals, value));
                }
                Terminator::Suspend {
                    resume, result, ..
                } => {
                    if let Some(result) = result {
                        self.write_place(frame, locals, *result, Value::Unit);
                    }
                    current = *resume;
                    continue 'blocks;
                }
                Terminator::Unreachable => {
                    return Err(Value::str("reached unreachable block during cleanup"));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    fn block(&self, id: BasicBlockId) -> RuntimeResult<&BasicBlock> {
        match self.owners.get(&id) {
            Some(Owner::Body) => self
                .lowered
                .body
                .get_block(id)
                .ok_or_else(|| RuntimeError::malformed(format!("missing block {id}"))),
            Some(Owner::Routine(i)) => self.lowered.cleanups[*i]
                .get_block(id)
                .ok_or_else(|| RuntimeError::malformed(format!("missing routine block {id}"))),
            None => Err(RuntimeError::malformed(format!("unknown block {id}"))),
        }
    }

    fn owner(&self, id: BasicBlockId) -> Owner {
        self.owners.get(&id).copied().unwrap_or(Owner::Body)
    }

    fn region(&self, id: RegionId) -> RuntimeResult<&LoweredRegion> {
        self.region_index
            .get(&id)
            .map(|&i| &self.lowered.regions[i])
            .ok_or_else(|| RuntimeError::malformed(format!("unknown region {id}")))
    }

    /// Region indices enclosing a block, innermost first
    fn chain_of(&self, block: BasicBlockId) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = self
            .lowered
            .innermost_region(block)
            .and_then(|id| self.region_index.get(&id).copied());
        while let Some(index) = cursor {
            out.push(index);
            cursor = self.lowered.regions[index]
                .parent
                .and_then(|id| self.region_index.get(&id).copied());
        }
        out
    }
}

enum Unwind {
    /// A catch handled the fault; continue at its entry
    Continue(BasicBlockId),
    /// Nothing caught; the frame is closed and the fault is terminal
    Terminal(Value),
}

fn in_inline_finally(region: &LoweredRegion, block: BasicBlockId) -> bool {
    matches!(&region.cleanup, RegionCleanup::InlineFinally { blocks, .. } if blocks.contains(&block))
}

fn const_value(c: &Const) -> Value {
    match c {
        Const::Unit => Value::Unit,
        Const::Int(v) => Value::Int(*v),
        Const::Bool(v) => Value::Bool(*v),
        Const::Str(v) => Value::str(v),
    }
}

fn apply_binop(op: BinOp, left: &Value, right: &Value) -> Result<Value, Value> {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
            let (Some(a), Some(b)) = (left.as_int(), right.as_int()) else {
                return Err(Value::str("arithmetic on non-integers"));
            };
            let out = match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::Mul => a.wrapping_mul(b),
                BinOp::Div => {
                    if b == 0 {
                        return Err(Value::str("division by zero"));
                    }
                    a.wrapping_div(b)
                }
                _ => unreachable!(),
            };
            Ok(Value::Int(out))
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let (Some(a), Some(b)) = (left.as_int(), right.as_int()) else {
                return Err(Value::str("comparison on non-integers"));
            };
            let out = match op {
                BinOp::Lt => a < b,
                BinOp::Le => a <= b,
                BinOp::Gt => a > b,
                BinOp::Ge => a >= b,
                _ => unreachable!(),
            };
            Ok(Value::Bool(out))
        }
        BinOp::Eq => Ok(Value::Bool(left.same(right))),
        BinOp::Ne => Ok(Value::Bool(!left.same(right))),
        BinOp::And | BinOp::Or => {
            let (Some(a), Some(b)) = (left.as_bool(), right.as_bool()) else {
                return Err(Value::str("logic on non-booleans"));
            };
            Ok(Value::Bool(if op == BinOp::And { a && b } else { a || b }))
        }
    }
}

fn apply_unop(op: UnOp, operand: &Value) -> Result<Value, Value> {
    match op {
        UnOp::Neg => operand
            .as_int()
            .map(|v| Value::Int(v.wrapping_neg()))
            .ok_or_else(|| Value::str("negation of non-integer")),
        UnOp::Not => operand
            .as_bool()
            .map(|v| Value::Bool(!v))
            .ok_or_else(|| Value::str("logical not of non-boolean")),
    }
}
