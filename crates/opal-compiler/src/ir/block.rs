//! Basic Blocks and Control Flow
//!
//! Basic blocks are sequences of instructions with a single entry point
//! and a single exit point (the terminator). Suspension points are
//! terminators: the block ends where execution may leave the frame.

use super::instr::Instr;
use super::value::{Operand, Place, SuspendId};
use serde::Serialize;

/// Basic block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BasicBlockId(pub u32);

impl BasicBlockId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for BasicBlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// How a basic block exits
#[derive(Debug, Clone)]
pub enum Terminator {
    /// Unconditional jump
    Jump(BasicBlockId),

    /// Conditional branch on a boolean operand
    Branch {
        cond: Operand,
        then_block: BasicBlockId,
        else_block: BasicBlockId,
    },

    /// Multi-way dispatch on an integer operand
    Switch {
        value: Operand,
        cases: Vec<(i64, BasicBlockId)>,
        default: BasicBlockId,
    },

    /// Return from the function (normal completion)
    Return(Option<Operand>),

    /// Raise a user fault carrying the operand value
    Throw(Operand),

    /// Leave the frame at a suspension point
    ///
    /// For generator-style functions `value` is the produced value; for
    /// asynchronous functions it is the awaited operand and `result`
    /// receives the resumption input when the frame is next driven.
    /// Execution continues at `resume` on the next invocation.
    Suspend {
        point: SuspendId,
        value: Operand,
        resume: BasicBlockId,
        result: Option<Place>,
    },

    /// Must never be reached at runtime
    Unreachable,
}

impl Terminator {
    /// Successor blocks of this terminator
    ///
    /// A `Suspend` has its resume block as successor: that is where the
    /// values live on the far side of the suspension edge.
    pub fn successors(&self) -> Vec<BasicBlockId> {
        match self {
            Terminator::Jump(target) => vec![*target],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Terminator::Switch { cases, default, .. } => {
                let mut out: Vec<BasicBlockId> = cases.iter().map(|(_, b)| *b).collect();
                out.push(*default);
                out
            }
            Terminator::Suspend { resume, .. } => vec![*resume],
            Terminator::Return(_) | Terminator::Throw(_) | Terminator::Unreachable => vec![],
        }
    }

    /// Visit every read operand
    pub fn for_each_operand(&self, mut f: impl FnMut(&Operand)) {
        match self {
            Terminator::Branch { cond, .. } => f(cond),
            Terminator::Switch { value, .. } => f(value),
            Terminator::Return(Some(value)) => f(value),
            Terminator::Throw(value) => f(value),
            Terminator::Suspend { value, .. } => f(value),
            _ => {}
        }
    }

    /// Visit every read operand mutably
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Operand)) {
        match self {
            Terminator::Branch { cond, .. } => f(cond),
            Terminator::Switch { value, .. } => f(value),
            Terminator::Return(Some(value)) => f(value),
            Terminator::Throw(value) => f(value),
            Terminator::Suspend { value, .. } => f(value),
            _ => {}
        }
    }

    /// Visit every jump target mutably
    pub fn for_each_target_mut(&mut self, mut f: impl FnMut(&mut BasicBlockId)) {
        match self {
            Terminator::Jump(target) => f(target),
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => {
                f(then_block);
                f(else_block);
            }
            Terminator::Switch { cases, default, .. } => {
                for (_, target) in cases {
                    f(target);
                }
                f(default);
            }
            Terminator::Suspend { resume, .. } => f(resume),
            Terminator::Return(_) | Terminator::Throw(_) | Terminator::Unreachable => {}
        }
    }
}

/// A basic block: instructions plus a terminator
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Unique identifier for this block
    pub id: BasicBlockId,
    /// Optional label for debugging
    pub label: Option<String>,
    /// Instructions in this block (excluding terminator)
    pub instructions: Vec<Instr>,
    /// How this block exits
    pub terminator: Terminator,
}

impl BasicBlock {
    /// Create a new empty basic block
    pub fn new(id: BasicBlockId) -> Self {
        Self {
            id,
            label: None,
            instructions: Vec::new(),
            terminator: Terminator::Unreachable,
        }
    }

    /// Create a new basic block with a label
    pub fn with_label(id: BasicBlockId, label: impl Into<String>) -> Self {
        Self {
            id,
            label: Some(label.into()),
            instructions: Vec::new(),
            terminator: Terminator::Unreachable,
        }
    }

    /// Add an instruction to this block
    pub fn add_instr(&mut self, instr: Instr) {
        self.instructions.push(instr);
    }

    /// Set the terminator for this block
    pub fn set_terminator(&mut self, term: Terminator) {
        self.terminator = term;
    }

    /// Check if this block is terminated (not unreachable)
    pub fn is_terminated(&self) -> bool {
        !matches!(self.terminator, Terminator::Unreachable)
    }

    /// The suspension point terminating this block, if any
    pub fn suspend_point(&self) -> Option<SuspendId> {
        match self.terminator {
            Terminator::Suspend { point, .. } => Some(point),
            _ => None,
        }
    }
}
