//! End-to-end execution scenarios: recursion, message passing, deferred
//! calls on both exit paths, and tail-call space behaviour.

mod common;

use std::sync::Mutex;

use common::*;
use std::string::String;
use viua_arch::ops::Opcode::*;
use viua_vm::ffi::ForeignCall;
use viua_vm::kernel::Kernel;
use viua_vm::value::Value;

/// Emit a function body computing fib(n) by naive double recursion.
fn emit_fib(asm: &mut Asm) -> u64 {
    let fib = asm.function("fib");
    asm.op(s(AllocateRegisters, l(8)));
    asm.op(d(Move, l(1), p(0)));
    asm.op(li(l(2), 2));
    asm.op(t(Lt, l(3), l(1), l(2)));
    let base_target = asm.placeholder();
    asm.op(d(If, l(3), l(4)));
    // fib(n - 1)
    asm.op(s(Frame, l(1)));
    asm.op(r(Subi, l(5), l(1), 1));
    asm.op(d(Move, a(0), l(5)));
    asm.op(e(Atxtp, l(6), fib));
    asm.op(d(Call, l(7), l(6)));
    // fib(n - 2)
    asm.op(s(Frame, l(1)));
    asm.op(r(Subi, l(5), l(1), 2));
    asm.op(d(Move, a(0), l(5)));
    asm.op(e(Atxtp, l(6), fib));
    asm.op(d(Call, l(2), l(6)));
    asm.op(t(Add, l(7), l(7), l(2)));
    asm.op(s(Return, l(7)));
    let base = asm.here();
    asm.op(s(Return, l(1)));
    asm.patch(base_target, liu(l(4), base as u32));
    fib
}

#[test]
fn fibonacci_of_ten_is_fifty_five() {
    let mut asm = Asm::new();
    let fib = emit_fib(&mut asm);

    asm.function("main");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(s(Frame, l(1)));
    asm.op(li(l(1), 10));
    asm.op(d(Move, a(0), l(1)));
    asm.op(e(Atxtp, l(2), fib));
    asm.op(d(Call, l(3), l(2)));
    asm.op(s(Return, l(3)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let result = run_function(&kernel, "main").expect("main runs to completion");
    assert_int(&result, 55);
}

#[test]
fn message_ping_pong() {
    let mut asm = Asm::new();

    // responder(parent): on `ping`, send `pong` back.
    let responder = asm.function("responder");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(d(Move, l(1), p(0)));
    asm.op(d(Receive, l(2), void()));
    asm.atom(l(3), "pong");
    asm.op(d(Send, l(1), l(3)));
    asm.op(s(Return, void()));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(6)));
    asm.op(s(SelfPid, l(1)));
    asm.op(s(Frame, l(1)));
    asm.op(d(Move, a(0), l(1)));
    asm.op(e(Atxtp, l(2), responder));
    asm.op(d(Actor, l(3), l(2)));
    asm.atom(l(4), "ping");
    asm.op(d(Send, l(3), l(4)));
    asm.op(d(Receive, l(5), void()));
    asm.op(t(Join, void(), l(3), void()));
    asm.op(s(Return, l(5)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let result = run_function(&kernel, "main").expect("ping-pong completes");
    assert!(result.deep_eq(&Value::atom("pong")), "got {result}");
}

static THROW_LOG: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn log_for_throw_test(_: &Kernel, call: &mut ForeignCall) -> Result<Value, Value> {
    let entry = call.arguments.take(0)?;
    THROW_LOG.lock().unwrap().push(entry.to_string());
    Ok(Value::Void)
}

/// Emit `emit(text)`: a bytecode wrapper forwarding its parameter to a
/// foreign logging function.
fn emit_logger(asm: &mut Asm, foreign_name: &str) -> u64 {
    let entry = asm.function("emit");
    asm.op(s(AllocateRegisters, l(3)));
    asm.op(s(Frame, l(1)));
    asm.op(d(Move, a(0), p(0)));
    asm.atom(l(1), foreign_name);
    asm.op(d(Call, void(), l(1)));
    asm.op(s(Return, void()));
    entry
}

#[test]
fn deferred_calls_run_lifo_on_throw() {
    let mut asm = Asm::new();
    let emit = emit_logger(&mut asm, "test::throw_log");

    // thrower: defer emit("a"), defer emit("b"), throw OopsTag.
    let thrower = asm.function("thrower");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(s(Frame, l(1)));
    asm.string(l(1), "a");
    asm.op(d(Move, a(0), l(1)));
    asm.op(e(Atxtp, l(2), emit));
    asm.op(s(Defer, l(2)));
    asm.op(s(Frame, l(1)));
    asm.string(l(1), "b");
    asm.op(d(Move, a(0), l(1)));
    asm.op(s(Defer, l(2)));
    asm.atom(l(3), "OopsTag");
    asm.op(s(Throw, l(3)));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(8)));
    asm.op(n(Try));
    asm.atom(l(1), "OopsTag");
    let handler_target = asm.placeholder();
    asm.op(d(Catch, l(1), l(2)));
    let block_target = asm.placeholder();
    asm.op(s(Enter, l(3)));
    // Returns here after LEAVE; l4 holds the drawn exception, or void when no
    // exception fired.
    asm.op(s(Return, l(4)));
    let block = asm.here();
    asm.op(s(Frame, l(0)));
    asm.op(e(Atxtp, l(5), thrower));
    asm.op(d(Call, void(), l(5)));
    asm.op(n(Leave));
    let handler = asm.here();
    asm.op(s(Draw, l(4)));
    asm.op(n(Leave));
    asm.patch(handler_target, liu(l(2), handler as u32));
    asm.patch(block_target, liu(l(3), block as u32));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    kernel.ffi.register("test::throw_log", log_for_throw_test);
    let workers = start_workers(&kernel, 1, 0);

    let result = run_function(&kernel, "main").expect("the exception is caught");
    workers.stop();

    assert_eq!(tag_of(&result), "OopsTag");
    let log = THROW_LOG.lock().unwrap();
    assert_eq!(
        *log,
        vec!["b".to_string(), "a".to_string()],
        "deferred calls must run newest-first even when unwinding",
    );
}

static RETURN_LOG: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn log_for_return_test(_: &Kernel, call: &mut ForeignCall) -> Result<Value, Value> {
    let entry = call.arguments.take(0)?;
    RETURN_LOG.lock().unwrap().push(entry.to_string());
    Ok(Value::Void)
}

#[test]
fn deferred_calls_run_lifo_on_return() {
    let mut asm = Asm::new();
    let emit = emit_logger(&mut asm, "test::return_log");

    let leaver = asm.function("leaver");
    asm.op(s(AllocateRegisters, l(4)));
    for text in ["one", "two", "three"] {
        asm.op(s(Frame, l(1)));
        asm.string(l(1), text);
        asm.op(d(Move, a(0), l(1)));
        asm.op(e(Atxtp, l(2), emit));
        asm.op(s(Defer, l(2)));
    }
    asm.op(s(Return, void()));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(2)));
    asm.op(s(Frame, l(0)));
    asm.op(e(Atxtp, l(1), leaver));
    asm.op(d(Call, void(), l(1)));
    asm.op(s(Return, void()));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    kernel.ffi.register("test::return_log", log_for_return_test);
    let workers = start_workers(&kernel, 1, 0);

    run_function(&kernel, "main").expect("main completes");
    workers.stop();

    let log = RETURN_LOG.lock().unwrap();
    assert_eq!(*log, vec!["three", "two", "one"]);
}

#[test]
fn tail_calls_do_not_grow_the_stack() {
    // 100k iterations is more than ten times the frame limit, so this only
    // terminates if TAILCALL reuses the frame slot.
    let mut asm = Asm::new();

    let looper = asm.function("looper");
    asm.op(s(AllocateRegisters, l(6)));
    asm.op(d(Move, l(1), p(0)));
    let done_target = asm.placeholder();
    asm.op(d(Not, l(3), l(1)));
    asm.op(d(If, l(3), l(2)));
    asm.op(r(Subi, l(1), l(1), 1));
    asm.op(s(Frame, l(1)));
    asm.op(d(Move, a(0), l(1)));
    asm.op(e(Atxtp, l(4), looper));
    asm.op(s(Tailcall, l(4)));
    let done = asm.here();
    asm.op(s(Return, l(1)));
    asm.patch(done_target, liu(l(2), done as u32));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(s(Frame, l(1)));
    asm.op(li(l(1), 100_000));
    asm.op(d(Move, a(0), l(1)));
    asm.op(e(Atxtp, l(2), looper));
    asm.op(d(Call, l(3), l(2)));
    asm.op(s(Return, l(3)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let result = run_function(&kernel, "main").expect("the loop terminates");
    assert_int(&result, 0);
}
