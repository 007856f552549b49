//! Process lifecycle: joins, rethrow of remote exceptions, watchdogs, and
//! disowning.

mod common;

use std::sync::Mutex;

use common::*;
use std::string::String;
use viua_arch::ops::Opcode::*;
use viua_vm::ffi::ForeignCall;
use viua_vm::kernel::Kernel;
use viua_vm::value::{tags, Value};

#[test]
fn join_returns_the_targets_result() {
    let mut asm = Asm::new();

    let producer = asm.function("producer");
    asm.op(s(AllocateRegisters, l(2)));
    asm.op(li(l(1), 1234));
    asm.op(s(Return, l(1)));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(s(Frame, l(0)));
    asm.op(e(Atxtp, l(1), producer));
    asm.op(d(Actor, l(2), l(1)));
    asm.op(t(Join, l(3), l(2), void()));
    asm.op(s(Return, l(3)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let result = run_function(&kernel, "main").expect("join succeeds");
    assert_int(&result, 1234);
}

#[test]
fn join_rethrows_a_remote_exception() {
    let mut asm = Asm::new();

    let doomed = asm.function("doomed");
    asm.op(s(AllocateRegisters, l(2)));
    asm.atom(l(1), "Boom");
    asm.op(s(Throw, l(1)));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(s(Frame, l(0)));
    asm.op(e(Atxtp, l(1), doomed));
    asm.op(d(Actor, l(2), l(1)));
    asm.op(t(Join, void(), l(2), void()));
    asm.op(s(Return, void()));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let error = run_function(&kernel, "main").expect_err("the remote Boom reaches main");
    assert_eq!(tag_of(&error), "Boom");
}

static WATCHDOG_LOG: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn record_death(_: &Kernel, call: &mut ForeignCall) -> Result<Value, Value> {
    let message = call.arguments.take(0)?;
    WATCHDOG_LOG.lock().unwrap().push(message.to_string());
    Ok(Value::Void)
}

#[test]
fn watchdog_runs_when_a_process_dies() {
    let mut asm = Asm::new();

    // guard(death): forward the death message to the recorder.
    asm.function("guard");
    asm.op(s(AllocateRegisters, l(2)));
    asm.op(s(Frame, l(1)));
    asm.op(d(Move, a(0), p(0)));
    asm.atom(l(1), "test::record_death");
    asm.op(d(Call, void(), l(1)));
    asm.op(s(Return, void()));

    let doomed = asm.function("doomed");
    asm.op(s(AllocateRegisters, l(2)));
    asm.atom(l(1), "guard");
    asm.op(s(Watchdog, l(1)));
    asm.atom(l(1), "Kaboom");
    asm.op(s(Throw, l(1)));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(s(Frame, l(0)));
    asm.op(e(Atxtp, l(1), doomed));
    asm.op(d(Actor, l(2), l(1)));
    // A watched death is not rethrown at the joiner; join yields void.
    asm.op(t(Join, l(3), l(2), void()));
    asm.op(s(Return, l(3)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    kernel.ffi.register("test::record_death", record_death);
    let workers = start_workers(&kernel, 1, 0);

    let result = run_function(&kernel, "main").expect("the watchdog absorbs the death");
    workers.stop();

    assert!(result.is_void(), "join of a watched process yields void");
    let log = WATCHDOG_LOG.lock().unwrap();
    assert_eq!(log.len(), 1, "the watchdog ran exactly once");
    assert!(
        log[0].contains("Kaboom"),
        "the death message carries the exception: {}",
        log[0],
    );
}

#[test]
fn watchdog_registration_is_exclusive() {
    let mut asm = Asm::new();

    asm.function("guard");
    asm.op(s(AllocateRegisters, l(1)));
    asm.op(s(Return, void()));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(2)));
    asm.atom(l(1), "guard");
    asm.op(s(Watchdog, l(1)));
    asm.atom(l(1), "guard");
    asm.op(s(Watchdog, l(1)));
    asm.op(s(Return, void()));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let error = run_function(&kernel, "main").expect_err("double registration faults");
    assert_eq!(tag_of(&error), tags::TYPE_ERROR);
}

#[test]
fn detached_processes_cannot_be_joined() {
    let mut asm = Asm::new();
    let spinner = asm.function("spinner");
    asm.op(s(AllocateRegisters, l(2)));
    asm.op(li(l(1), 100));
    let head = asm.here();
    asm.op(liu(l(0), head as u32));
    asm.op(r(Subi, l(1), l(1), 1));
    asm.op(d(If, l(1), l(0)));
    asm.op(s(Return, void()));

    let (kernel, module) = kernel_with(asm.into_module(None), 1);
    let entry = viua_vm::value::Addr::new(module, spinner);
    let frame = viua_vm::frame::Frame::new(entry, None, viua_vm::registers::RegisterSet::new(0));
    let pid = kernel.spawn(frame, 0, false);
    assert!(kernel.is_process_joinable(pid));

    kernel.detach_process(pid);
    assert!(!kernel.is_process_joinable(pid));

    // Drain the scheduler so the kernel shuts down cleanly.
    viua_vm::scheduler::ProcessScheduler::new(0, std::sync::Arc::clone(&kernel)).run();
    assert!(!kernel.is_process_joinable(pid));
}
