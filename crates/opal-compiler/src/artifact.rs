//! Lowering Artifacts
//!
//! The products of the lowering pass: the frame layout, the flattened
//! step body, the dispatch and state tables, extracted cleanup routines
//! and the per-state abandonment plan. Drivers in the runtime crate
//! consume these; tests serialize the summary artifact for structural
//! assertions.

use crate::ir::{
    BasicBlock, BasicBlockId, CleanupId, HostFuncId, IrFunction, LocalId, Operand, Place,
    RegionId, SlotId, SuspendKind,
};
use crate::lower::slots::SlotDef;
use crate::lower::states::{StateEntry, StateTable};
use serde::Serialize;

/// Layout of the persistent frame of one suspendable function
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameLayout {
    pub function: String,
    /// Open type parameters the frame is generic over
    pub type_params: u32,
    /// Persistent fields, one per allocated slot
    pub slots: Vec<SlotDef>,
    /// Names of captured parameters (hoisted into slots)
    pub captured_params: Vec<String>,
    /// Names of captured non-parameter locals
    pub captured_locals: Vec<String>,
    /// Whether the receiver is captured across a suspension
    pub captures_receiver: bool,
    /// Parameters whose argument value seeds a slot at frame creation
    pub param_slots: Vec<(LocalId, SlotId)>,
}

impl FrameLayout {
    /// Number of persistent fields (slots), excluding the cursor
    pub fn field_count(&self) -> usize {
        self.slots.len()
    }

    /// Debug names of the persistent fields, in slot order
    pub fn field_names(&self) -> Vec<&str> {
        self.slots
            .iter()
            .map(|s| s.name.as_deref().unwrap_or("<temp>"))
            .collect()
    }
}

/// One dispatch-table entry: a state and its resume prologue block
#[derive(Debug, Clone, Serialize)]
pub struct DispatchEntry {
    pub state: i32,
    pub prologue: BasicBlockId,
}

/// An extracted cleanup routine, callable from normal fall-through exit
/// and from the abandonment walk
#[derive(Debug, Clone)]
pub struct CleanupRoutine {
    pub id: CleanupId,
    pub region: RegionId,
    /// Synthesized member name, `{function}::finallyN`
    pub name: String,
    pub entry: BasicBlockId,
    pub blocks: Vec<BasicBlock>,
}

impl CleanupRoutine {
    pub fn get_block(&self, id: BasicBlockId) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }
}

/// How a lowered region's cleanup is reached
#[derive(Debug, Clone)]
pub enum RegionCleanup {
    /// No cleanup (try with catches only)
    None,
    /// Extracted routine; the region contains a suspension point
    Extracted(CleanupId),
    /// Ordinary inline finally; the region never suspends
    InlineFinally {
        entry: BasicBlockId,
        blocks: Vec<BasicBlockId>,
    },
    /// Dispose call for a scoped resource that never suspends
    InlineDispose {
        resource: Operand,
        dispose: HostFuncId,
    },
}

/// A catch site surviving into the lowered region table
#[derive(Debug, Clone)]
pub struct LoweredCatch {
    pub binding: Option<Place>,
    pub entry: BasicBlockId,
    pub blocks: Vec<BasicBlockId>,
}

/// One region in the lowered body, consumed by the runtime unwinder
#[derive(Debug, Clone)]
pub struct LoweredRegion {
    pub id: RegionId,
    pub parent: Option<RegionId>,
    /// Body blocks (including nested regions', excluding extracted cleanup)
    pub blocks: Vec<BasicBlockId>,
    pub catches: Vec<LoweredCatch>,
    pub cleanup: RegionCleanup,
    /// Normal continuation after the region
    pub after: BasicBlockId,
}

impl LoweredRegion {
    /// Whether a block belongs to this region (body, handler or inline cleanup)
    pub fn contains(&self, block: BasicBlockId) -> bool {
        self.blocks.contains(&block)
            || self.in_catch(block)
            || self.in_inline_finally(block)
    }

    /// Whether a block is inside one of this region's catch handlers
    pub fn in_catch(&self, block: BasicBlockId) -> bool {
        self.catches.iter().any(|c| c.blocks.contains(&block))
    }

    fn in_inline_finally(&self, block: BasicBlockId) -> bool {
        matches!(&self.cleanup, RegionCleanup::InlineFinally { blocks, .. } if blocks.contains(&block))
    }
}

/// A fully lowered suspendable function
#[derive(Debug, Clone)]
pub struct LoweredFunction {
    pub name: String,
    pub kind: SuspendKind,
    pub layout: FrameLayout,
    /// The flat step function: dispatch block, resume prologues, body
    pub body: IrFunction,
    pub states: StateTable,
    pub dispatch: Vec<DispatchEntry>,
    pub cleanups: Vec<CleanupRoutine>,
    pub regions: Vec<LoweredRegion>,
    /// Per-state open cleanup routines, innermost first
    pub abandon: Vec<(i32, Vec<CleanupId>)>,
}

impl LoweredFunction {
    pub fn cleanup(&self, id: CleanupId) -> Option<&CleanupRoutine> {
        self.cleanups.iter().find(|c| c.id == id)
    }

    pub fn region(&self, id: RegionId) -> Option<&LoweredRegion> {
        self.regions.iter().find(|r| r.id == id)
    }

    /// Open cleanup routines when abandoned in `state`, innermost first
    pub fn abandon_plan(&self, state: i32) -> &[CleanupId] {
        self.abandon
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, plan)| plan.as_slice())
            .unwrap_or(&[])
    }

    /// The innermost region containing a block, if any
    pub fn innermost_region(&self, block: BasicBlockId) -> Option<RegionId> {
        self.regions
            .iter()
            .filter(|r| r.contains(block))
            .min_by_key(|r| r.blocks.len() + r.catches.iter().map(|c| c.blocks.len()).sum::<usize>())
            .map(|r| r.id)
    }

    /// Serializable summary of the lowering
    pub fn artifact(&self) -> LoweringArtifact {
        LoweringArtifact {
            function: self.name.clone(),
            frame: self.layout.clone(),
            state_count: self.states.state_count(),
            states: self.states.entries.clone(),
            dispatch: self.dispatch.clone(),
            cleanups: self.cleanups.iter().map(|c| c.name.clone()).collect(),
            abandon: self
                .abandon
                .iter()
                .map(|(s, plan)| (*s, plan.iter().map(|c| c.as_u32()).collect()))
                .collect(),
        }
    }
}

/// Serializable lowering summary for one function
#[derive(Debug, Clone, Serialize)]
pub struct LoweringArtifact {
    pub function: String,
    pub frame: FrameLayout,
    pub state_count: usize,
    pub states: Vec<StateEntry>,
    pub dispatch: Vec<DispatchEntry>,
    pub cleanups: Vec<String>,
    pub abandon: Vec<(i32, Vec<u32>)>,
}

/// A lowered module: lowered suspendable functions plus the untouched rest
#[derive(Debug, Clone, Default)]
pub struct LoweredModule {
    pub name: String,
    /// Host-function names, indexed by `HostFuncId`
    pub host_funcs: Vec<String>,
    pub functions: Vec<LoweredFunction>,
    /// Non-suspendable functions, passed through unchanged
    pub plain: Vec<IrFunction>,
}

impl LoweredModule {
    pub fn function(&self, name: &str) -> Option<&LoweredFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}
