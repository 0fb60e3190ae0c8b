//! Opal Compiler - Suspendable-Function Lowering
//!
//! This crate implements the mid-level IR and the pass that rewrites
//! functions containing suspension points (yields and awaits) into flat,
//! resumable step functions with an explicit frame layout.

pub mod artifact;
pub mod error;
pub mod ir;
pub mod lower;

pub use artifact::{
    CleanupRoutine, DispatchEntry, FrameLayout, LoweredCatch, LoweredFunction, LoweredModule,
    LoweredRegion, LoweringArtifact, RegionCleanup,
};
pub use error::{LowerError, LowerResult};
pub use lower::states::{STATE_CLOSED, STATE_FIRST_CLEANUP, STATE_NOT_STARTED, STATE_RUNNING};
pub use lower::Lowerer;
