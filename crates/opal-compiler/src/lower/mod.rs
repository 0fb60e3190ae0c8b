//! Suspendable-Function Lowering
//!
//! Rewrites functions containing suspension points into flat, resumable
//! step functions: a region tree is built over the structured body,
//! locals crossing suspension edges are promoted into frame slots,
//! states are numbered, suspended cleanup clauses are extracted into
//! standalone routines, and the step body is synthesized around a
//! cursor dispatch.

pub mod capture;
pub mod cleanup;
pub mod regions;
pub mod slots;
pub mod states;
mod step;

use crate::artifact::{LoweredFunction, LoweredModule};
use crate::error::{LowerError, LowerResult};
use crate::ir::{Instr, IrFunction, IrModule, RegionKind, SuspendKind, Terminator};

/// The lowering pass over a module
pub struct Lowerer<'a> {
    module: &'a IrModule,
}

impl<'a> Lowerer<'a> {
    pub fn new(module: &'a IrModule) -> Self {
        Self { module }
    }

    /// Lower every suspendable function; ordinary functions pass through
    pub fn lower_module(&self) -> LowerResult<LoweredModule> {
        let mut lowered = LoweredModule {
            name: self.module.name.clone(),
            host_funcs: self.module.host_funcs.clone(),
            ..Default::default()
        };
        for func in &self.module.functions {
            match func.kind {
                SuspendKind::None => {
                    validate(self.module, func)?;
                    lowered.plain.push(func.clone());
                }
                _ => lowered.functions.push(self.lower_function(func)?),
            }
        }
        Ok(lowered)
    }

    /// Lower a single suspendable function
    pub fn lower_function(&self, func: &IrFunction) -> LowerResult<LoweredFunction> {
        if !func.is_suspendable() {
            return Err(LowerError::NotSuspendable {
                function: func.name.clone(),
            });
        }
        validate(self.module, func)?;
        let tree = regions::RegionTree::build(func)?;
        let analysis = capture::analyze(func)?;
        let assignment = slots::allocate(&analysis);
        let table = states::number(func, &tree);
        step::synthesize(func, &tree, &analysis, &assignment, table)
    }
}

/// Reject bodies the pass must not miscompile: unknown host functions,
/// suspension points in ordinary functions, awaits with no resumption
/// destination, dangling block references.
fn validate(module: &IrModule, func: &IrFunction) -> LowerResult<()> {
    let host_count = module.host_funcs.len() as u32;
    let check_host = |index: u32| -> LowerResult<()> {
        if index >= host_count {
            return Err(LowerError::UnknownHostFunction { index });
        }
        Ok(())
    };

    for block in &func.blocks {
        for instr in &block.instructions {
            if let Instr::Call { func: host, .. } = instr {
                check_host(host.as_u32())?;
            }
        }
        for succ in block.terminator.successors() {
            if func.get_block(succ).is_none() {
                return Err(LowerError::UnknownBlock {
                    function: func.name.clone(),
                    block: succ.as_u32(),
                });
            }
        }
        if let Terminator::Suspend { point, result, .. } = &block.terminator {
            match func.kind {
                SuspendKind::None => {
                    return Err(LowerError::SuspendOutsideSuspendable {
                        function: func.name.clone(),
                    });
                }
                SuspendKind::Async if result.is_none() => {
                    return Err(LowerError::MissingResumeDestination {
                        function: func.name.clone(),
                        point: point.as_u32(),
                    });
                }
                _ => {}
            }
        }
    }

    for region in &func.regions {
        if let RegionKind::ScopedResource { dispose, .. } = &region.kind {
            check_host(dispose.as_u32())?;
        }
    }
    Ok(())
}
