//! Frame and unwinding behaviour: catch-by-class, moved-parameter
//! enforcement, and the frame-depth limit.

mod common;

use common::*;
use viua_arch::ops::Opcode::*;
use viua_vm::value::tags;

#[test]
fn exceptions_are_caught_by_ancestor_tag() {
    let mut asm = Asm::new();

    let thrower = asm.function("thrower");
    asm.op(s(AllocateRegisters, l(2)));
    asm.atom(l(1), "Leaf");
    asm.op(s(Throw, l(1)));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(8)));
    asm.op(n(Try));
    asm.atom(l(1), "Root");
    let handler_target = asm.placeholder();
    asm.op(d(Catch, l(1), l(2)));
    let block_target = asm.placeholder();
    asm.op(s(Enter, l(3)));
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
    // Leaf <: Middle <: Root, flattened by the registry.
    kernel.register_exception_type("Leaf", "Middle");
    kernel.register_exception_type("Middle", "Root");

    let result = run_function(&kernel, "main").expect("a Root handler catches a Leaf");
    assert_eq!(tag_of(&result), "Leaf");
}

#[test]
fn unrelated_tags_are_not_caught() {
    let mut asm = Asm::new();

    asm.function("main");
    asm.op(s(AllocateRegisters, l(8)));
    asm.op(n(Try));
    asm.atom(l(1), "Expected");
    let handler_target = asm.placeholder();
    asm.op(d(Catch, l(1), l(2)));
    let block_target = asm.placeholder();
    asm.op(s(Enter, l(3)));
    asm.op(s(Return, void()));
    let block = asm.here();
    asm.atom(l(5), "Unrelated");
    asm.op(s(Throw, l(5)));
    let handler = asm.here();
    asm.op(s(Draw, l(4)));
    asm.op(n(Leave));
    asm.patch(handler_target, liu(l(2), handler as u32));
    asm.patch(block_target, liu(l(3), block as u32));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let error = run_function(&kernel, "main").expect_err("nothing catches Unrelated");
    assert_eq!(tag_of(&error), "Unrelated");
}

#[test]
fn moved_parameters_must_be_consumed() {
    let mut asm = Asm::new();

    // lazy ignores its moved-in parameter entirely.
    let lazy = asm.function("lazy");
    asm.op(s(AllocateRegisters, l(2)));
    asm.op(s(Return, void()));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(s(Frame, l(1)));
    asm.op(li(l(1), 5));
    asm.op(d(Move, a(0), l(1)));
    asm.op(e(Atxtp, l(2), lazy));
    asm.op(d(Call, void(), l(2)));
    asm.op(s(Return, void()));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let error = run_function(&kernel, "main").expect_err("an unconsumed moved parameter faults");
    assert_eq!(tag_of(&error), tags::TYPE_ERROR);
}

#[test]
fn copied_arguments_need_no_consumption() {
    let mut asm = Asm::new();

    let lazy = asm.function("lazy");
    asm.op(s(AllocateRegisters, l(2)));
    asm.op(s(Return, void()));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(s(Frame, l(1)));
    asm.op(li(l(1), 5));
    asm.op(d(Copy, a(0), l(1)));
    asm.op(e(Atxtp, l(2), lazy));
    asm.op(d(Call, void(), l(2)));
    asm.op(li(l(3), 1));
    asm.op(s(Return, l(3)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let result = run_function(&kernel, "main").expect("copied arguments carry no obligation");
    assert_int(&result, 1);
}

#[test]
fn runaway_recursion_overflows_the_stack() {
    let mut asm = Asm::new();

    let rec = asm.function("rec");
    asm.op(s(AllocateRegisters, l(2)));
    asm.op(s(Frame, l(0)));
    asm.op(e(Atxtp, l(1), 0));
    asm.op(d(Call, void(), l(1)));
    asm.op(s(Return, void()));
    assert_eq!(rec, 0, "rec must sit at offset zero for its own atxtp");

    asm.function("main");
    asm.op(s(AllocateRegisters, l(2)));
    asm.op(s(Frame, l(0)));
    asm.op(e(Atxtp, l(1), rec));
    asm.op(d(Call, void(), l(1)));
    asm.op(s(Return, void()));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let error = run_function(&kernel, "main").expect_err("unbounded recursion must fault");
    assert_eq!(tag_of(&error), tags::STACK_OVERFLOW);
}

#[test]
fn static_registers_survive_across_calls() {
    let mut asm = Asm::new();

    // bump: increments its static counter and returns it.
    use viua_arch::{AccessSet, RegisterAccess};
    let st = |index: u8| RegisterAccess::new(AccessSet::Static, false, index);

    let bump = asm.function("bump");
    asm.op(s(AllocateRegisters, l(2)));
    asm.op(r(Addi, st(1), st(1), 1));
    asm.op(d(Copy, l(1), st(1)));
    asm.op(s(Return, l(1)));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(4)));
    for _ in 0..3 {
        asm.op(s(Frame, l(0)));
        asm.op(e(Atxtp, l(1), bump));
        asm.op(d(Call, l(2), l(1)));
    }
    asm.op(s(Return, l(2)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let result = run_function(&kernel, "main").expect("bump runs three times");
    assert_int(&result, 3);
}
