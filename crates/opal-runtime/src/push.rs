//! Push Contract
//!
//! Callback-driven consumption of async frames. `spawn` creates the
//! frame eagerly so the caller immediately holds a handle, then the step
//! function is re-armed as the continuation after every suspension: each
//! suspension registers one job with the scheduler, whose resolver turns
//! the awaited operand into a resumption value (or a fault raised back
//! at the await point). The handle's completion fires exactly once.

use crate::error::{RuntimeError, RuntimeResult};
use crate::eval::{Evaluator, StepEvent};
use crate::frame::Frame;
use crate::host::HostEnv;
use crate::value::Value;
use opal_compiler::ir::SuspendKind;
use opal_compiler::LoweredModule;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

type Job = Box<dyn FnOnce() + Send>;
type Resolver = Box<dyn Fn(Value) -> Result<Value, Value> + Send + Sync>;
type Callback = Box<dyn FnOnce(&Result<Value, Value>) + Send>;

/// A queue of ready continuations plus the resolver that completes
/// awaited operands. Pure message passing: suspension registers a job,
/// running the scheduler invokes it later, possibly on another thread.
pub struct Scheduler {
    queue: Mutex<VecDeque<Job>>,
    resolver: Resolver,
}

impl Scheduler {
    /// Create a scheduler whose resolver completes awaited operands
    pub fn new(
        resolver: impl Fn(Value) -> Result<Value, Value> + Send + Sync + 'static,
    ) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            queue: Mutex::new(VecDeque::new()),
            resolver: Box::new(resolver),
        })
    }

    fn schedule(&self, job: Job) {
        self.queue.lock().push_back(job);
    }

    /// Run a single queued continuation; false when the queue is empty
    pub fn run_one(&self) -> bool {
        let job = self.queue.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run queued continuations until the queue drains
    pub fn run_until_idle(&self) {
        while self.run_one() {}
    }

    /// Number of continuations currently queued
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

struct TaskShared {
    completion: Mutex<Option<Result<Value, Value>>>,
    done: Condvar,
    callback: Mutex<Option<Callback>>,
}

impl TaskShared {
    /// Record the completion; fires observers at most once
    fn complete(&self, result: Result<Value, Value>) {
        let mut slot = self.completion.lock();
        if slot.is_some() {
            return;
        }
        *slot = Some(result.clone());
        drop(slot);
        self.done.notify_all();
        if let Some(callback) = self.callback.lock().take() {
            callback(&result);
        }
    }
}

/// Caller-visible handle to a spawned async frame
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    /// The completion, if it already fired
    pub fn try_result(&self) -> Option<Result<Value, Value>> {
        self.shared.completion.lock().clone()
    }

    /// Block until the single completion notification fires
    pub fn wait(&self) -> Result<Value, Value> {
        let mut slot = self.shared.completion.lock();
        while slot.is_none() {
            self.shared.done.wait(&mut slot);
        }
        slot.clone().expect("completion recorded")
    }

    /// Register the single completion observer; invoked immediately when
    /// the task already finished
    pub fn on_complete(&self, callback: impl FnOnce(&Result<Value, Value>) + Send + 'static) {
        *self.shared.callback.lock() = Some(Box::new(callback));
        // The completion may have fired while the observer was being
        // registered; deliver it now if so.
        let result = self.shared.completion.lock().clone();
        if let Some(result) = result {
            if let Some(callback) = self.shared.callback.lock().take() {
                callback(&result);
            }
        }
    }
}

enum StepInput {
    Start,
    Resume(Value),
    Fault(Value),
}

/// Bind an async function to the push contract
///
/// The frame is created eagerly, before any user code runs; the first
/// step is queued on the scheduler and the handle returns immediately.
pub fn spawn(
    module: &LoweredModule,
    function: &str,
    env: &HostEnv,
    args: Vec<Value>,
    scheduler: &Arc<Scheduler>,
) -> RuntimeResult<TaskHandle> {
    let lowered = module
        .function(function)
        .ok_or_else(|| RuntimeError::malformed(format!("unknown function `{function}`")))?;
    if lowered.kind != SuspendKind::Async {
        return Err(RuntimeError::ContractMismatch {
            function: lowered.name.clone(),
            expected: "push",
        });
    }
    let host = env.link(&module.host_funcs)?;
    let eval = Evaluator::new(Arc::new(lowered.clone()), host);
    let frame = eval.new_frame(args);
    let shared = Arc::new(TaskShared {
        completion: Mutex::new(None),
        done: Condvar::new(),
        callback: Mutex::new(None),
    });
    let handle = TaskHandle {
        shared: shared.clone(),
    };
    arm(eval, frame, shared, scheduler.clone(), StepInput::Start);
    Ok(handle)
}

/// Queue one step of the frame; the job re-arms itself at the next
/// suspension until a terminal state is reached
fn arm(
    eval: Evaluator,
    mut frame: Frame,
    shared: Arc<TaskShared>,
    scheduler: Arc<Scheduler>,
    input: StepInput,
) {
    let queue = scheduler.clone();
    queue.schedule(Box::new(move || {
        let event = match input {
            StepInput::Start => eval.step(&mut frame, None),
            StepInput::Resume(value) => eval.step(&mut frame, Some(value)),
            StepInput::Fault(fault) => eval.step_with_fault(&mut frame, fault),
        };
        match event {
            Ok(StepEvent::Suspended { value, .. }) => {
                let next = match (scheduler.resolver)(value) {
                    Ok(resume) => StepInput::Resume(resume),
                    Err(fault) => StepInput::Fault(fault),
                };
                arm(eval, frame, shared, scheduler, next);
            }
            Ok(StepEvent::Completed(value)) => shared.complete(Ok(value)),
            Ok(StepEvent::Faulted(fault)) => shared.complete(Err(fault)),
            Err(protocol) => shared.complete(Err(Value::str(protocol.to_string()))),
        }
    }));
}
