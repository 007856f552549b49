//! The instruction interpreter.
//!
//! [`run`] executes one scheduling burst for a process: up to `budget`
//! instructions, stopping early when the process suspends, terminates, or
//! throws its way off the stack. A burst never ends in the middle of a
//! greedy bundle; the bundle's length still counts against the budget, so a
//! long bundle makes the process yield as soon as it ends.
//!
//! Every runtime fault is converted into a value-level exception at the
//! faulting instruction and thrown through the ordinary unwinding path; only
//! container corruption (handled by the loader) is fatal to the VM.

pub mod access;

mod arithmetic;
mod bitwise;
mod concurrency;
mod control;
mod data;

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;
use viua_arch::ops::{Instruction, Opcode, Operands};
use viua_arch::{DecodeError, RegisterAccess};

use crate::kernel::Kernel;
use crate::loader::Module;
use crate::pid::Pid;
use crate::process::{Process, ProcessState};
use crate::value::{fault, tags, Addr, Atom, Boxed, IoRequestId, Value};

/// Ambient context of an executing burst: the kernel and the scheduler the
/// process currently runs on.
pub struct ExecCtx<'a> {
    pub kernel: &'a Arc<Kernel>,
    pub scheduler: usize,
}

/// What one executed instruction asks the burst loop to do next.
pub(crate) enum Outcome {
    /// Move to the next instruction.
    Advance,
    /// The instruction pointer was set explicitly.
    Jumped,
    /// The process entered a wait state; the instruction re-executes on wake.
    Suspend,
    /// HALT: terminate the process.
    Halt,
}

enum StepFlow {
    Advanced { greedy: bool },
    Parked,
}

/// Run a process for one scheduling burst.
///
/// Every instruction counts against the budget, but a greedy instruction
/// never ends the burst: the bundle it belongs to runs to completion and
/// the process yields at the first non-greedy instruction past an exhausted
/// budget.
pub fn run(proc: &mut Process, ctx: &ExecCtx, budget: usize) {
    let mut remaining = budget as i64;
    loop {
        if !matches!(proc.state, ProcessState::Running) {
            break;
        }
        match step(proc, ctx) {
            StepFlow::Advanced { greedy } => {
                remaining -= 1;
                if remaining <= 0 && !greedy {
                    break;
                }
            }
            StepFlow::Parked => break,
        }
    }
}

fn step(proc: &mut Process, ctx: &ExecCtx) -> StepFlow {
    // Finish frame removal already in progress (deferred calls, unwinding)
    // before fetching instructions.
    if proc.stack().pending_removal.is_some() {
        return match control::advance_removal(proc, ctx) {
            Ok(flow) => flow,
            Err(e) => {
                control::throw_value(proc, ctx, e);
                StepFlow::Advanced { greedy: false }
            }
        };
    }

    let ip = proc.stack().ip;
    let Some(module) = ctx.kernel.module(ip.module) else {
        control::throw_value(
            proc,
            ctx,
            fault(tags::OUT_OF_BOUNDS, format!("no module {}", ip.module)),
        );
        return StepFlow::Advanced { greedy: false };
    };

    let Some(word) = module.text.get(ip.offset as usize).copied() else {
        control::throw_value(
            proc,
            ctx,
            fault(
                tags::OUT_OF_BOUNDS,
                format!("instruction pointer {ip} outside of .text"),
            ),
        );
        return StepFlow::Advanced { greedy: false };
    };

    let ins = match Instruction::decode(word) {
        Ok(ins) => ins,
        Err(e) => {
            let tag = match e {
                DecodeError::InvalidOpcode(_) => tags::INVALID_OPCODE,
                DecodeError::InvalidOperand(_) => tags::INVALID_OPERAND,
            };
            control::throw_value(proc, ctx, fault(tag, e.to_string()));
            return StepFlow::Advanced { greedy: false };
        }
    };

    let greedy = ins.greedy;
    match dispatch(proc, ctx, &module, &ins) {
        Ok(Outcome::Advance) => {
            proc.stack_mut().ip.offset += 1;
            StepFlow::Advanced { greedy }
        }
        Ok(Outcome::Jumped) => StepFlow::Advanced { greedy },
        Ok(Outcome::Suspend) => StepFlow::Parked,
        Ok(Outcome::Halt) => {
            proc.state = ProcessState::TerminatedOk(Value::Void);
            StepFlow::Parked
        }
        Err(e) => {
            control::throw_value(proc, ctx, e);
            StepFlow::Advanced { greedy: false }
        }
    }
}

fn s(operands: Operands) -> RegisterAccess {
    match operands {
        Operands::S { out } => out,
        _ => unreachable!("decode produced wrong operands for an S-format opcode"),
    }
}

fn d(operands: Operands) -> (RegisterAccess, RegisterAccess) {
    match operands {
        Operands::D { out, src } => (out, src),
        _ => unreachable!("decode produced wrong operands for a D-format opcode"),
    }
}

fn t(operands: Operands) -> (RegisterAccess, RegisterAccess, RegisterAccess) {
    match operands {
        Operands::T { out, lhs, rhs } => (out, lhs, rhs),
        _ => unreachable!("decode produced wrong operands for a T-format opcode"),
    }
}

fn f(operands: Operands) -> (RegisterAccess, u32) {
    match operands {
        Operands::F { out, immediate } => (out, immediate),
        _ => unreachable!("decode produced wrong operands for an F-format opcode"),
    }
}

fn e(operands: Operands) -> (RegisterAccess, u64) {
    match operands {
        Operands::E { out, immediate } => (out, immediate),
        _ => unreachable!("decode produced wrong operands for an E-format opcode"),
    }
}

fn r(operands: Operands) -> (RegisterAccess, RegisterAccess, u32) {
    match operands {
        Operands::R {
            out,
            src,
            immediate,
        } => (out, src, immediate),
        _ => unreachable!("decode produced wrong operands for an R-format opcode"),
    }
}

fn m(operands: Operands) -> (RegisterAccess, RegisterAccess, u16, u8) {
    match operands {
        Operands::M {
            out,
            src,
            offset,
            spec,
        } => (out, src, offset, spec),
        _ => unreachable!("decode produced wrong operands for an M-format opcode"),
    }
}

fn dispatch(
    proc: &mut Process,
    ctx: &ExecCtx,
    module: &Module,
    ins: &Instruction,
) -> Result<Outcome, Value> {
    use Opcode::*;

    let op = ins.operands;
    match ins.opcode {
        Noop => Ok(Outcome::Advance),
        Halt => Ok(Outcome::Halt),
        Ebreak => {
            ebreak(proc);
            Ok(Outcome::Advance)
        }
        Ecall => Err(fault(
            tags::INVALID_OPCODE,
            "ecall is not provided by this machine",
        )),
        Try => control::ex_try(proc),
        Leave => control::ex_leave(proc),

        Add | Sub | Mul | Div | Mod => {
            let (out, lhs, rhs) = t(op);
            arithmetic::ex_binop(proc, ins.opcode, out, lhs, rhs)
        }
        Eq | Lt | Gt | Cmp => {
            let (out, lhs, rhs) = t(op);
            arithmetic::ex_compare(proc, ins.opcode, out, lhs, rhs)
        }
        And | Or => {
            let (out, lhs, rhs) = t(op);
            arithmetic::ex_logic(proc, ins.opcode, out, lhs, rhs)
        }
        Not => {
            let (out, src) = d(op);
            arithmetic::ex_not(proc, out, src)
        }

        Bitshl | Bitshr | Bitashr | Bitrol | Bitror | Bitand | Bitor | Bitxor | Wrapadd
        | Wrapsub | Wrapmul | Checkedsadd | Checkedssub | Checkedsmul | Saturatingsadd
        | Saturatingssub | Saturatingsmul | Bitseq | Bitslt | Bitsgt | Bitaeq | Bitalt
        | Bitagt | Bitat | Bitset => {
            let (out, lhs, rhs) = t(op);
            bitwise::ex_bits_triple(proc, ins.opcode, out, lhs, rhs)
        }
        Bitnot => {
            let (out, src) = d(op);
            bitwise::ex_bitnot(proc, out, src)
        }
        Bits => {
            let (out, src) = d(op);
            bitwise::ex_bits(proc, out, src)
        }
        Bitswidth => {
            let (out, src) = d(op);
            bitwise::ex_bitswidth(proc, out, src)
        }

        BufferAt | BufferPop | StructAt | StructInsert | StructRemove => {
            let (out, lhs, rhs) = t(op);
            data::ex_container_triple(proc, ins.opcode, out, lhs, rhs)
        }
        BufferPush | BufferSize => {
            let (out, src) = d(op);
            data::ex_buffer_double(proc, ins.opcode, out, src)
        }
        Copy | Move | Swap => {
            let (out, src) = d(op);
            data::ex_transfer(proc, ins.opcode, out, src)
        }
        Ref => {
            let (out, src) = d(op);
            data::ex_ref(proc, out, src)
        }
        Ptrlive => {
            let (out, src) = d(op);
            data::ex_ptrlive(proc, out, src)
        }
        Closure => {
            let (out, src) = d(op);
            data::ex_closure(proc, out, src)
        }
        Capture | Capturemove => {
            let (out, lhs, rhs) = t(op);
            data::ex_capture(proc, ins.opcode, out, lhs, rhs)
        }

        If => {
            let (out, src) = d(op);
            control::ex_if(proc, out, src)
        }
        Call => {
            let (out, src) = d(op);
            control::ex_call(proc, ctx, out, src)
        }
        Catch => {
            let (out, src) = d(op);
            control::ex_catch(proc, out, src)
        }

        Frame => control::ex_frame(proc, s(op)),
        Return => control::ex_return(proc, s(op)),
        Tailcall => control::ex_tailcall(proc, ctx, s(op)),
        Defer => control::ex_defer(proc, ctx, s(op)),
        Throw => control::ex_throw(proc, s(op)),
        Draw => control::ex_draw(proc, s(op)),
        Enter => control::ex_enter(proc, s(op)),
        AllocateRegisters => control::ex_allocate_registers(proc, s(op)),

        Atom | String | Float | Double => data::ex_reify(proc, module, ins.opcode, s(op)),
        Struct | Buffer => data::ex_make_container(proc, ins.opcode, s(op)),

        SelfPid => concurrency::ex_self(proc, s(op)),
        Watchdog => concurrency::ex_watchdog(proc, ctx, s(op)),
        Actor => {
            let (out, src) = d(op);
            concurrency::ex_actor(proc, ctx, out, src)
        }
        Send => {
            let (out, src) = d(op);
            concurrency::ex_send(proc, ctx, out, src)
        }
        Receive => {
            let (out, src) = d(op);
            concurrency::ex_receive(proc, ctx, out, src)
        }
        Join => {
            let (out, lhs, rhs) = t(op);
            concurrency::ex_join(proc, ctx, out, lhs, rhs)
        }

        IoSubmit | IoWait | IoShutdown | IoCtl => {
            let (out, lhs, rhs) = t(op);
            concurrency::ex_io_triple(proc, ctx, ins.opcode, out, lhs, rhs)
        }
        IoPeek => {
            let (out, src) = d(op);
            concurrency::ex_io_peek(proc, ctx, out, src)
        }

        Lli | Lliu | FloatImm => {
            let (out, immediate) = f(op);
            data::ex_load_low(proc, ins.opcode, out, immediate)
        }
        Lui | Luiu | Cast | Arodp | Atxtp => {
            let (out, immediate) = e(op);
            data::ex_extended(proc, module, ins.opcode, out, immediate)
        }
        Addi | Addiu | Subi | Subiu | Muli | Muliu | Divi | Diviu => {
            let (out, src, immediate) = r(op);
            arithmetic::ex_immediate(proc, ins.opcode, out, src, immediate)
        }
        Sm | Lm | Aa | Ad | Ptr => {
            let (out, src, offset, spec) = m(op);
            data::ex_memory(proc, ins.opcode, out, src, offset, spec)
        }
    }
}

/// EBREAK: dump the current stack through the trace log.
fn ebreak(proc: &Process) {
    let stack = proc.stack();
    trace!("ebreak: process {}, ip {}", proc.pid(), stack.ip);
    for (depth, frame) in stack.frames.iter().enumerate().rev() {
        trace!("  frame {depth}: entry {}", frame.entry);
        for (index, value) in frame.locals.defined() {
            trace!("    l{index} = {} ({})", value, value.type_name());
        }
        for (index, value) in frame.arguments.defined() {
            trace!("    p{index} = {} ({})", value, value.type_name());
        }
    }
    for (index, value) in proc.globals.defined() {
        trace!("  g{index} = {} ({})", value, value.type_name());
    }
}

/*
 * Operand coercions shared by the execution modules.
 */

pub(crate) fn int_of(value: &Value) -> Result<i64, Value> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Uint(n) if *n <= i64::MAX as u64 => Ok(*n as i64),
        other => Err(fault(
            tags::TYPE_ERROR,
            format!("wanted Integer, got {}", other.type_name()),
        )),
    }
}

pub(crate) fn uint_of(value: &Value) -> Result<u64, Value> {
    match value {
        Value::Uint(n) => Ok(*n),
        Value::Int(n) if *n >= 0 => Ok(*n as u64),
        other => Err(fault(
            tags::TYPE_ERROR,
            format!("wanted Unsigned_integer, got {}", other.type_name()),
        )),
    }
}

pub(crate) fn count_of(value: &Value) -> Result<usize, Value> {
    let n = uint_of(value)?;
    usize::try_from(n)
        .map_err(|_| fault(tags::VALUE_OUT_OF_RANGE, format!("{n} does not fit a count")))
}

pub(crate) fn atom_of(value: &Value) -> Result<Atom, Value> {
    match value.boxed() {
        Some(Boxed::Atom(atom)) => Ok(atom.clone()),
        _ => Err(fault(
            tags::TYPE_ERROR,
            format!("wanted Atom, got {}", value.type_name()),
        )),
    }
}

pub(crate) fn pid_of(value: &Value) -> Result<Pid, Value> {
    match value.boxed() {
        Some(Boxed::Pid(pid)) => Ok(*pid),
        _ => Err(fault(
            tags::INVALID_PID,
            format!("wanted Pid, got {}", value.type_name()),
        )),
    }
}

pub(crate) fn request_of(value: &Value) -> Result<IoRequestId, Value> {
    match value.boxed() {
        Some(Boxed::IoRequest(id)) => Ok(*id),
        _ => Err(fault(
            tags::TYPE_ERROR,
            format!("wanted IO_request, got {}", value.type_name()),
        )),
    }
}

/// A timeout operand: void or the atom `infinity` wait forever, an integer is
/// a deadline in milliseconds from now.
pub(crate) fn timeout_of(value: &Value) -> Result<Option<Duration>, Value> {
    match value {
        Value::Void => Ok(None),
        Value::Int(n) if *n >= 0 => Ok(Some(Duration::from_millis(*n as u64))),
        Value::Uint(n) => Ok(Some(Duration::from_millis(*n))),
        Value::Boxed(b) => match &**b {
            Boxed::Atom(atom) if atom.as_str() == "infinity" => Ok(None),
            _ => Err(fault(tags::TYPE_ERROR, "invalid timeout")),
        },
        _ => Err(fault(tags::TYPE_ERROR, "invalid timeout")),
    }
}

pub(crate) fn deadline_of(timeout: Option<Duration>) -> Option<Instant> {
    // A timeout too large for the clock degrades to waiting forever.
    timeout.and_then(|t| Instant::now().checked_add(t))
}

/// A jump or handler target: a function value (in the current module) or a
/// plain integer text offset.
pub(crate) fn code_address(module_id: u32, value: &Value) -> Result<Addr, Value> {
    match value {
        Value::Int(n) if *n >= 0 => Ok(Addr::new(module_id, *n as u64)),
        Value::Uint(n) => Ok(Addr::new(module_id, *n)),
        Value::Boxed(b) => match &**b {
            Boxed::Function(function) => Ok(function.entry),
            _ => Err(fault(
                tags::TYPE_ERROR,
                format!("{} is not a code address", value.type_name()),
            )),
        },
        _ => Err(fault(
            tags::TYPE_ERROR,
            format!("{} is not a code address", value.type_name()),
        )),
    }
}
