//! Push Contract Tests
//!
//! Behavioral assertions over async frames: eager handle creation,
//! re-armed continuations, single-shot completion, fault injection at
//! the await point and cross-thread resumption.

use opal_compiler::ir::{
    BinOp, FunctionBuilder, IrModule, Operand, SuspendKind, Ty,
};
use opal_compiler::{LoweredModule, Lowerer};
use opal_runtime::push::{spawn, Scheduler};
use opal_runtime::{HostEnv, RuntimeError, Value};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn lower(module: &IrModule) -> LoweredModule {
    Lowerer::new(module).lower_module().expect("module lowers")
}

/// A resolver that hands the awaited operand straight back
fn echo_scheduler() -> Arc<Scheduler> {
    Scheduler::new(Ok)
}

// =============================================================================
// ACCUMULATION ACROSS AWAITS
// =============================================================================

mod accumulation {
    use super::*;

    /// acc is read before the first await, written between the two, and
    /// read after the second: one hoisted slot, final value only after
    /// both resumes.
    fn accumulator_module() -> IrModule {
        let mut module = IrModule::new("m");
        let mut b = FunctionBuilder::new("accumulate", SuspendKind::Async);
        let seed = b.param("seed", Ty::Int);
        let acc = b.local("acc", Ty::Int);
        let got = b.local("got", Ty::Int);
        b.assign(acc, seed.into());
        b.await_into(got, acc.into());
        b.binop(acc, BinOp::Add, acc.into(), got.into());
        b.await_into(got, acc.into());
        b.binop(acc, BinOp::Add, acc.into(), got.into());
        b.ret(Some(acc.into()));
        module.add_function(b.finish());
        module
    }

    #[test]
    fn test_one_accumulator_slot_is_hoisted() {
        let lowered = lower(&accumulator_module());
        let layout = &lowered.functions[0].layout;
        assert_eq!(layout.field_count(), 1);
        assert_eq!(layout.field_names(), vec!["acc"]);
    }

    #[test]
    fn test_value_reported_only_after_both_resumes() {
        let lowered = lower(&accumulator_module());
        let env = HostEnv::new();
        let scheduler = echo_scheduler();
        let handle = spawn(&lowered, "accumulate", &env, vec![Value::Int(5)], &scheduler).unwrap();

        // Eager frame, no user code yet.
        assert!(handle.try_result().is_none());

        // Start runs to the first await.
        assert!(scheduler.run_one());
        assert!(handle.try_result().is_none());
        // First resume reaches the second await.
        assert!(scheduler.run_one());
        assert!(handle.try_result().is_none());
        // Second resume completes.
        assert!(scheduler.run_one());
        // seed 5 -> awaits echo 5 then 10: 5 + 5 + 10 = 20.
        assert_eq!(handle.wait(), Ok(Value::Int(20)));
    }
}

// =============================================================================
// COMPLETION DISCIPLINE
// =============================================================================

mod completion {
    use super::*;

    #[test]
    fn test_completion_fires_exactly_once() {
        let mut module = IrModule::new("m");
        let mut b = FunctionBuilder::new("two", SuspendKind::Async);
        let got = b.local("got", Ty::Int);
        b.await_into(got, Operand::int(1));
        b.await_into(got, Operand::int(2));
        b.ret(Some(got.into()));
        module.add_function(b.finish());

        let lowered = lower(&module);
        let env = HostEnv::new();
        let scheduler = echo_scheduler();
        let handle = spawn(&lowered, "two", &env, vec![], &scheduler).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        handle.on_complete(move |_| {
            observer.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.run_until_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(handle.wait(), Ok(Value::Int(2)));
    }

    #[test]
    fn test_fault_is_the_single_completion() {
        let mut module = IrModule::new("m");
        let mut b = FunctionBuilder::new("boom", SuspendKind::Async);
        let got = b.local("got", Ty::Int);
        b.await_into(got, Operand::int(1));
        b.throw(Operand::str("bad"));
        module.add_function(b.finish());

        let lowered = lower(&module);
        let env = HostEnv::new();
        let scheduler = echo_scheduler();
        let handle = spawn(&lowered, "boom", &env, vec![], &scheduler).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        handle.on_complete(move |result| {
            assert!(result.is_err());
            observer.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.run_until_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(handle.wait(), Err(Value::str("bad")));
    }

    #[test]
    fn test_push_contract_rejects_generator_functions() {
        let mut module = IrModule::new("m");
        let mut b = FunctionBuilder::new("gen", SuspendKind::Generator);
        b.yield_value(Operand::int(1));
        module.add_function(b.finish());

        let lowered = lower(&module);
        let env = HostEnv::new();
        let scheduler = echo_scheduler();
        match spawn(&lowered, "gen", &env, vec![], &scheduler) {
            Err(RuntimeError::ContractMismatch { expected, .. }) => {
                assert_eq!(expected, "push");
            }
            other => panic!("expected contract mismatch, got {:?}", other.map(|_| ())),
        }
    }
}

// =============================================================================
// FAULTED AWAITABLES
// =============================================================================

mod awaited_faults {
    use super::*;

    #[test]
    fn test_awaited_fault_is_raised_at_the_await_point() {
        let mut module = IrModule::new("m");
        let mut b = FunctionBuilder::new("guarded", SuspendKind::Async);
        let got = b.local("got", Ty::Int);
        let e = b.local("e", Ty::Str);
        b.begin_try();
        b.await_into(got, Operand::int(13));
        b.ret(Some(got.into()));
        b.begin_catch(Some(e));
        b.ret(Some(Operand::int(99)));
        b.end_try();
        module.add_function(b.finish());

        let lowered = lower(&module);
        let env = HostEnv::new();
        // The resolver faults the awaitable instead of completing it.
        let scheduler = Scheduler::new(|payload: Value| {
            if payload == Value::Int(13) {
                Err(Value::str("unlucky"))
            } else {
                Ok(payload)
            }
        });
        let handle = spawn(&lowered, "guarded", &env, vec![], &scheduler).unwrap();

        scheduler.run_until_idle();
        // The function's own catch saw the fault.
        assert_eq!(handle.wait(), Ok(Value::Int(99)));
    }

    #[test]
    fn test_awaited_fault_without_handler_faults_the_task() {
        let mut module = IrModule::new("m");
        let mut b = FunctionBuilder::new("open", SuspendKind::Async);
        let got = b.local("got", Ty::Int);
        b.await_into(got, Operand::int(13));
        b.ret(Some(got.into()));
        module.add_function(b.finish());

        let lowered = lower(&module);
        let env = HostEnv::new();
        let scheduler = Scheduler::new(|_| Err(Value::str("unlucky")));
        let handle = spawn(&lowered, "open", &env, vec![], &scheduler).unwrap();

        scheduler.run_until_idle();
        assert_eq!(handle.wait(), Err(Value::str("unlucky")));
    }

    #[test]
    fn test_awaited_fault_runs_extracted_cleanup() {
        let mut module = IrModule::new("m");
        let log_fn = module.host_func("log");
        let mut b = FunctionBuilder::new("cleanup", SuspendKind::Async);
        let got = b.local("got", Ty::Int);
        b.begin_try();
        b.await_into(got, Operand::int(13));
        b.begin_finally();
        b.call(None, log_fn, vec![Operand::int(7)]);
        b.end_try();
        b.ret(Some(got.into()));
        module.add_function(b.finish());

        let lowered = lower(&module);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut env = HostEnv::new();
        let sink = log.clone();
        env.register("log", move |args| {
            sink.lock().push(args[0].as_int().unwrap_or(-1));
            Ok(Value::Unit)
        });
        let scheduler = Scheduler::new(|_| Err(Value::str("unlucky")));
        let handle = spawn(&lowered, "cleanup", &env, vec![], &scheduler).unwrap();

        scheduler.run_until_idle();
        assert_eq!(handle.wait(), Err(Value::str("unlucky")));
        assert_eq!(*log.lock(), vec![7]);
    }
}

// =============================================================================
// CROSS-THREAD RESUMPTION
// =============================================================================

mod threading {
    use super::*;
    use crossbeam::channel;

    #[test]
    fn test_resumes_may_hop_threads() {
        let mut module = IrModule::new("m");
        let mut b = FunctionBuilder::new("hop", SuspendKind::Async);
        let acc = b.local("acc", Ty::Int);
        let got = b.local("got", Ty::Int);
        b.assign(acc, Operand::int(1));
        b.await_into(got, Operand::int(10));
        b.binop(acc, BinOp::Add, acc.into(), got.into());
        b.await_into(got, Operand::int(20));
        b.binop(acc, BinOp::Add, acc.into(), got.into());
        b.ret(Some(acc.into()));
        module.add_function(b.finish());

        let lowered = lower(&module);
        let env = HostEnv::new();
        let scheduler = echo_scheduler();
        let handle = spawn(&lowered, "hop", &env, vec![], &scheduler).unwrap();

        let (tx, rx) = channel::bounded(1);
        handle.on_complete(move |result| {
            tx.send(result.clone()).unwrap();
        });

        // First transition on this thread, the rest on another: the
        // frame has no thread affinity, resumes are serialized by the
        // queue discipline alone.
        assert!(scheduler.run_one());
        let remote = scheduler.clone();
        thread::spawn(move || remote.run_until_idle())
            .join()
            .unwrap();

        assert_eq!(rx.recv().unwrap(), Ok(Value::Int(31)));
        assert_eq!(handle.wait(), Ok(Value::Int(31)));
    }
}
