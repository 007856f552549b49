//! Value semantics through bytecode: copies, pointers, casts, and the
//! memory instructions.

mod common;

use common::*;
use viua_arch::ops::Opcode::*;
use viua_vm::value::{tags, Value};

#[test]
fn pointers_follow_their_target_and_die_with_it() {
    let mut asm = Asm::new();
    asm.function("main");
    asm.op(s(AllocateRegisters, l(8)));
    asm.op(li(l(1), 42));
    asm.op(d(Ref, l(2), l(1)));
    // Read through the pointer while the target lives.
    asm.op(d(Copy, l(3), deref(2)));
    asm.op(d(Ptrlive, l(4), l(2)));
    // Erase the target; the pointer must die.
    asm.op(d(Move, l(5), l(1)));
    asm.op(d(Ptrlive, l(6), l(2)));
    asm.op(s(Buffer, l(7)));
    asm.op(d(BufferPush, l(7), l(3)));
    asm.op(d(BufferPush, l(7), l(4)));
    asm.op(d(BufferPush, l(7), l(6)));
    asm.op(s(Return, l(7)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let result = run_function(&kernel, "main").expect("main completes");
    let expected = Value::buffer(vec![Value::Int(42), Value::Int(1), Value::Int(0)]);
    assert!(result.deep_eq(&expected), "got {result}");
}

#[test]
fn dereferencing_a_dead_pointer_faults() {
    let mut asm = Asm::new();
    asm.function("main");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(li(l(1), 1));
    asm.op(d(Ref, l(2), l(1)));
    asm.op(d(Move, l(3), l(1)));
    asm.op(d(Copy, l(3), deref(2)));
    asm.op(s(Return, void()));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let error = run_function(&kernel, "main").expect_err("the pointer is dead");
    assert_eq!(tag_of(&error), tags::INVALID_POINTER);
}

#[test]
fn overwriting_a_target_keeps_pointers_live() {
    let mut asm = Asm::new();
    asm.function("main");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(li(l(1), 1));
    asm.op(d(Ref, l(2), l(1)));
    // Overwrite, do not erase: the register stays defined.
    asm.op(li(l(1), 99));
    asm.op(d(Copy, l(3), deref(2)));
    asm.op(s(Return, l(3)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let result = run_function(&kernel, "main").expect("main completes");
    assert_int(&result, 99);
}

#[test]
fn copy_of_a_vector_is_independent() {
    let mut asm = Asm::new();
    asm.function("main");
    asm.op(s(AllocateRegisters, l(6)));
    asm.op(s(Buffer, l(1)));
    asm.op(li(l(2), 1));
    asm.op(d(BufferPush, l(1), l(2)));
    asm.op(d(Copy, l(3), l(1)));
    // Grow the original; the copy must keep its length.
    asm.op(li(l(2), 2));
    asm.op(d(BufferPush, l(1), l(2)));
    asm.op(d(BufferSize, l(4), l(3)));
    asm.op(s(Return, l(4)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let result = run_function(&kernel, "main").expect("main completes");
    assert!(result.deep_eq(&Value::Uint(1)), "got {result}");
}

#[test]
fn casts_between_numeric_kinds() {
    let mut asm = Asm::new();
    asm.function("main");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(li(l(1), 7));
    // int -> double -> int round trip.
    asm.op(e(Cast, l(1), 3));
    asm.op(e(Cast, l(1), 0));
    asm.op(s(Return, l(1)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let result = run_function(&kernel, "main").expect("main completes");
    assert_int(&result, 7);
}

#[test]
fn out_of_range_float_to_int_faults() {
    let mut asm = Asm::new();
    asm.function("main");
    asm.op(s(AllocateRegisters, l(4)));
    // A double far beyond i64::MAX: 2^40 squared.
    asm.op(liu(l(1), 1 << 20));
    asm.op(e(Cast, l(1), 3));
    asm.op(t(Mul, l(1), l(1), l(1)));
    asm.op(t(Mul, l(1), l(1), l(1)));
    asm.op(e(Cast, l(1), 0));
    asm.op(s(Return, l(1)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let error = run_function(&kernel, "main").expect_err("2^80 does not fit an i64");
    assert_eq!(tag_of(&error), tags::VALUE_OUT_OF_RANGE);
}

#[test]
fn division_by_zero_faults() {
    let mut asm = Asm::new();
    asm.function("main");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(li(l(1), 10));
    asm.op(li(l(2), 0));
    asm.op(t(Div, l(3), l(1), l(2)));
    asm.op(s(Return, l(3)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let error = run_function(&kernel, "main").expect_err("division by zero faults");
    assert_eq!(tag_of(&error), tags::ARITHMETIC_ERROR);
}

#[test]
fn closures_see_their_captured_registers() {
    use viua_arch::{AccessSet, RegisterAccess};
    let c = |index: u8| RegisterAccess::new(AccessSet::ClosureLocal, false, index);

    let mut asm = Asm::new();

    // adder: parameter plus the captured slot 0.
    let body = asm.function("adder");
    asm.op(s(AllocateRegisters, l(3)));
    asm.op(d(Move, l(1), p(0)));
    asm.op(d(Copy, l(2), c(0)));
    asm.op(t(Add, l(1), l(1), l(2)));
    asm.op(s(Return, l(1)));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(6)));
    asm.op(e(Atxtp, l(1), body));
    asm.op(d(Closure, l(2), l(1)));
    asm.op(li(l(3), 40));
    asm.op(t(Capture, l(2), l(0), l(3)));
    asm.op(s(Frame, l(1)));
    asm.op(li(l(4), 2));
    asm.op(d(Move, a(0), l(4)));
    asm.op(d(Call, l(5), l(2)));
    asm.op(s(Return, l(5)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let result = run_function(&kernel, "main").expect("the closure call completes");
    assert_int(&result, 42);
}

#[test]
fn closures_with_captures_are_not_copyable() {
    let mut asm = Asm::new();

    let body = asm.function("body");
    asm.op(s(AllocateRegisters, l(1)));
    asm.op(s(Return, void()));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(6)));
    asm.op(e(Atxtp, l(1), body));
    asm.op(d(Closure, l(2), l(1)));
    asm.op(li(l(3), 1));
    asm.op(t(Capture, l(2), l(0), l(3)));
    asm.op(d(Copy, l(4), l(2)));
    asm.op(s(Return, void()));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let error = run_function(&kernel, "main").expect_err("closures cannot be copied");
    assert_eq!(tag_of(&error), tags::NOT_COPYABLE);
}

#[test]
fn memory_regions_store_and_load() {
    let mut asm = Asm::new();
    asm.function("main");
    asm.op(s(AllocateRegisters, l(6)));
    // Allocate 4 units of 8 bytes, store 777 at slot 2, load it back.
    asm.op(li(l(1), 4));
    asm.op(m(Aa, l(2), l(1), 0, 0b11));
    asm.op(li(l(3), 777));
    asm.op(m(Sm, l(2), l(3), 2, 0b11));
    asm.op(m(Lm, l(4), l(2), 2, 0b11));
    asm.op(s(Return, l(4)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let result = run_function(&kernel, "main").expect("main completes");
    assert!(result.deep_eq(&Value::Uint(777)), "got {result}");
}

#[test]
fn out_of_region_stores_fault() {
    let mut asm = Asm::new();
    asm.function("main");
    asm.op(s(AllocateRegisters, l(6)));
    asm.op(li(l(1), 2));
    asm.op(m(Aa, l(2), l(1), 0, 0b11));
    asm.op(li(l(3), 5));
    asm.op(m(Sm, l(2), l(3), 2, 0b11));
    asm.op(s(Return, void()));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let error = run_function(&kernel, "main").expect_err("slot 2 of a 2-slot region");
    assert_eq!(tag_of(&error), tags::OUT_OF_BOUNDS);
}

#[test]
fn automatic_regions_die_with_their_frame() {
    let mut asm = Asm::new();

    // maker: allocates an automatic region and returns a derived pointer.
    let maker = asm.function("maker");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(li(l(1), 4));
    asm.op(m(Aa, l(2), l(1), 0, 0b11));
    asm.op(s(Return, l(2)));

    asm.function("main");
    asm.op(s(AllocateRegisters, l(4)));
    asm.op(s(Frame, l(0)));
    asm.op(e(Atxtp, l(1), maker));
    asm.op(d(Call, l(2), l(1)));
    // The region died with maker's frame; the pointer is dead.
    asm.op(d(Ptrlive, l(3), l(2)));
    asm.op(s(Return, l(3)));

    let (kernel, _) = kernel_with(asm.into_module(None), 1);
    let result = run_function(&kernel, "main").expect("main completes");
    assert_int(&result, 0);
}
