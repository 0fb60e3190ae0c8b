//! Pull Contract
//!
//! Caller-driven consumption of generator frames: `resume()` advances
//! to the next produced value, `abandon()` terminates early with a full
//! synchronous cleanup drain. Resuming a finished generator is a no-op
//! returning `Done`; a fault is reported once, on the call that
//! discovers it, and later calls are `Done`.

use crate::error::{RuntimeError, RuntimeResult};
use crate::eval::{Evaluator, StepEvent};
use crate::frame::Frame;
use crate::host::HostEnv;
use crate::value::Value;
use opal_compiler::ir::SuspendKind;
use opal_compiler::{LoweredFunction, LoweredModule};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// One step of a pull consumer
#[derive(Debug, PartialEq)]
pub enum GenStep {
    /// The generator produced a value and is suspended
    Produced(Value),
    /// The generator finished; further resumes are no-ops
    Done,
}

/// A driveable generator instance
pub struct Generator {
    eval: Evaluator,
    frame: Box<Frame>,
}

impl Generator {
    /// Bind a lowered generator function to the pull contract
    pub fn new(
        module: &LoweredModule,
        function: &str,
        env: &HostEnv,
        args: Vec<Value>,
    ) -> RuntimeResult<Generator> {
        let lowered = module
            .function(function)
            .ok_or_else(|| RuntimeError::malformed(format!("unknown function `{function}`")))?;
        Self::from_lowered(Arc::new(lowered.clone()), module, env, args)
    }

    fn from_lowered(
        lowered: Arc<LoweredFunction>,
        module: &LoweredModule,
        env: &HostEnv,
        args: Vec<Value>,
    ) -> RuntimeResult<Generator> {
        if lowered.kind != SuspendKind::Generator {
            return Err(RuntimeError::ContractMismatch {
                function: lowered.name.clone(),
                expected: "pull",
            });
        }
        let host = env.link(&module.host_funcs)?;
        let eval = Evaluator::new(lowered, host);
        let frame = Box::new(eval.new_frame(args));
        Ok(Generator { eval, frame })
    }

    /// Advance to the next produced value
    pub fn resume(&mut self) -> RuntimeResult<GenStep> {
        if self.frame.is_closed() {
            return Ok(GenStep::Done);
        }
        match self.eval.step(&mut self.frame, None)? {
            StepEvent::Suspended { value, .. } => Ok(GenStep::Produced(value)),
            StepEvent::Completed(_) => Ok(GenStep::Done),
            StepEvent::Faulted(fault) => Err(RuntimeError::UncaughtFault(fault)),
        }
    }

    /// Terminate early: every open cleanup runs, innermost first, before
    /// this returns
    pub fn abandon(&mut self) -> RuntimeResult<()> {
        self.eval.abandon(&mut self.frame)
    }

    /// The frame's resumption cursor (observability for consumers)
    pub fn cursor(&self) -> i32 {
        self.frame.cursor
    }

    /// Raw pointer identity of the backing frame; lets a source observe
    /// whether its pre-built frame was handed out
    pub fn frame_id(&self) -> usize {
        &*self.frame as *const Frame as usize
    }
}

/// Loop-style consumption of the pull contract: a faulted generator
/// yields the fault once, then the iteration ends.
impl Iterator for Generator {
    type Item = RuntimeResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.resume() {
            Ok(GenStep::Produced(value)) => Some(Ok(value)),
            Ok(GenStep::Done) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

/// A re-iterable generator source
///
/// The source pre-builds one frame and records the creating thread. The
/// first `iterate()` on that same thread receives the pre-built frame
/// without a fresh allocation; any other request (another thread, or a
/// second concurrent iteration) falls back to a new frame.
pub struct GeneratorSource {
    eval: Evaluator,
    args: Vec<Value>,
    initial: Mutex<Option<Box<Frame>>>,
    created_on: ThreadId,
    fresh_allocations: AtomicUsize,
}

impl GeneratorSource {
    pub fn new(
        module: &LoweredModule,
        function: &str,
        env: &HostEnv,
        args: Vec<Value>,
    ) -> RuntimeResult<GeneratorSource> {
        let lowered = module
            .function(function)
            .ok_or_else(|| RuntimeError::malformed(format!("unknown function `{function}`")))?;
        if lowered.kind != SuspendKind::Generator {
            return Err(RuntimeError::ContractMismatch {
                function: lowered.name.clone(),
                expected: "pull",
            });
        }
        let host = env.link(&module.host_funcs)?;
        let eval = Evaluator::new(Arc::new(lowered.clone()), host);
        let initial = Box::new(eval.new_frame(args.clone()));
        Ok(GeneratorSource {
            eval,
            args,
            initial: Mutex::new(Some(initial)),
            created_on: thread::current().id(),
            fresh_allocations: AtomicUsize::new(0),
        })
    }

    /// Obtain an independent iteration of the source
    pub fn iterate(&self) -> Generator {
        let reuse = if thread::current().id() == self.created_on {
            self.initial.lock().take()
        } else {
            None
        };
        let frame = match reuse {
            Some(frame) => frame,
            None => {
                self.fresh_allocations.fetch_add(1, Ordering::Relaxed);
                Box::new(self.eval.new_frame(self.args.clone()))
            }
        };
        Generator {
            eval: self.eval.clone(),
            frame,
        }
    }

    /// Number of frames allocated beyond the pre-built one
    pub fn fresh_allocations(&self) -> usize {
        self.fresh_allocations.load(Ordering::Relaxed)
    }
}
