//! Opal Runtime - Resumable Frames and Driver Contracts
//!
//! Executes lowered step bodies produced by `opal-compiler`: the frame
//! carries the resumption cursor and hoisted slots, the evaluator
//! advances a frame by one transition per call, and the pull/push
//! drivers expose the two caller-visible consumption contracts.

pub mod error;
pub mod eval;
pub mod frame;
pub mod host;
pub mod pull;
pub mod push;
pub mod value;

pub use error::{RuntimeError, RuntimeResult};
pub use eval::{Evaluator, StepEvent};
pub use frame::Frame;
pub use host::{HostEnv, HostFn, LinkedHost};
pub use pull::{GenStep, Generator, GeneratorSource};
pub use push::{spawn, Scheduler, TaskHandle};
pub use value::{Object, Value};
