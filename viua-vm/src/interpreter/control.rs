//! Control flow: calls, returns, tail calls, deferred execution, and
//! try/catch unwinding.
//!
//! Frame removal is a little state machine rather than a single operation,
//! because the deferred calls of a removed frame run first, each on its own
//! ephemeral stack. An instruction that removes a frame only records a
//! [`Removal`] on the stack; [`advance_removal`] then makes progress one step
//! at a time (launch the next deferred call, pop one frame of an unwind, or
//! finish the removal), interleaved with ordinary instruction execution by
//! the step loop.

use std::sync::Arc;

use spinning_top::Spinlock;
use viua_arch::RegisterAccess;

use super::{access, code_address, ExecCtx, Outcome, StepFlow};
use crate::frame::{DeferredCall, Frame, PendingFrame};
use crate::process::{Process, ProcessState};
use crate::registers::RegisterSet;
use crate::stack::{Removal, StackState, TryFrame};
use crate::value::{fault, tags, Addr, Boxed, ExceptionValue, Value};

/// A resolved call target.
pub(crate) enum Callee {
    Bytecode {
        entry: Addr,
        captures: Option<Arc<Spinlock<RegisterSet>>>,
    },
    Foreign {
        name: String,
    },
}

/// Resolve a callee operand: a function value, a closure, or an atom naming
/// either a bytecode or a foreign function.
pub(crate) fn resolve_callee(
    proc: &Process,
    ctx: &ExecCtx,
    access: RegisterAccess,
) -> Result<Callee, Value> {
    access::with_value(proc, access, |value| match value.boxed() {
        Some(Boxed::Function(function)) => Ok(Callee::Bytecode {
            entry: function.entry,
            captures: None,
        }),
        Some(Boxed::Closure(closure)) => Ok(Callee::Bytecode {
            entry: closure.entry,
            captures: Some(Arc::clone(&closure.captures)),
        }),
        Some(Boxed::Atom(atom)) => {
            let name = atom.as_str();
            if let Some(entry) = ctx.kernel.get_entry_point_of(name) {
                return Ok(Callee::Bytecode {
                    entry,
                    captures: None,
                });
            }
            if ctx.kernel.ffi.is_foreign(name) {
                return Ok(Callee::Foreign {
                    name: name.to_string(),
                });
            }
            Err(fault(
                tags::INVALID_OPERAND,
                format!("unknown function {name}"),
            ))
        }
        _ => Err(fault(
            tags::TYPE_ERROR,
            format!("{} is not callable", value.type_name()),
        )),
    })
}

/// Take the frame prepared by FRAME, or an empty one when the call site
/// passes no arguments.
pub(crate) fn take_pending_frame(proc: &mut Process) -> PendingFrame {
    proc.stack_mut().pending_frame.take().unwrap_or(PendingFrame {
        arguments: RegisterSet::new(0),
    })
}

pub(crate) fn ex_frame(proc: &mut Process, out: RegisterAccess) -> Result<Outcome, Value> {
    let arguments = RegisterSet::new(usize::from(out.index));
    proc.stack_mut().pending_frame = Some(PendingFrame { arguments });
    Ok(Outcome::Advance)
}

pub(crate) fn ex_allocate_registers(
    proc: &mut Process,
    out: RegisterAccess,
) -> Result<Outcome, Value> {
    let locals = RegisterSet::new(usize::from(out.index));
    let stack = proc.stack_mut();
    let frame = stack
        .back_mut()
        .ok_or_else(|| fault(tags::INVALID_OPERAND, "no active frame"))?;
    frame.locals = locals;
    Ok(Outcome::Advance)
}

pub(crate) fn ex_call(
    proc: &mut Process,
    ctx: &ExecCtx,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    // A call re-executed after its foreign half finished picks up the result
    // instead of submitting again.
    if proc.foreign_call.is_some() {
        return super::concurrency::finish_foreign_call(proc, ctx, out);
    }

    match resolve_callee(proc, ctx, src)? {
        Callee::Bytecode { entry, captures } => {
            let pending = take_pending_frame(proc);
            let ip = proc.stack().ip;
            let mut frame = Frame::new(
                entry,
                Some(Addr::new(ip.module, ip.offset + 1)),
                pending.arguments,
            );
            frame.result_to = out;
            frame.captures = captures;
            proc.stack_mut().push_frame(frame)?;
            Ok(Outcome::Jumped)
        }
        Callee::Foreign { name } => super::concurrency::begin_foreign_call(proc, ctx, &name),
    }
}

pub(crate) fn ex_tailcall(
    proc: &mut Process,
    ctx: &ExecCtx,
    out: RegisterAccess,
) -> Result<Outcome, Value> {
    let (entry, captures) = match resolve_callee(proc, ctx, out)? {
        Callee::Bytecode { entry, captures } => (entry, captures),
        Callee::Foreign { name } => {
            return Err(fault(
                tags::TYPE_ERROR,
                format!("cannot tail-call foreign function {name}"),
            ))
        }
    };
    let pending = take_pending_frame(proc);
    proc.stack_mut().pending_removal = Some(Removal::Tailcall {
        entry,
        arguments: pending.arguments,
        captures,
    });
    Ok(Outcome::Jumped)
}

pub(crate) fn ex_defer(
    proc: &mut Process,
    ctx: &ExecCtx,
    out: RegisterAccess,
) -> Result<Outcome, Value> {
    let (entry, captures) = match resolve_callee(proc, ctx, out)? {
        Callee::Bytecode { entry, captures } => (entry, captures),
        Callee::Foreign { name } => {
            return Err(fault(
                tags::TYPE_ERROR,
                format!("cannot defer foreign function {name}"),
            ))
        }
    };
    let pending = take_pending_frame(proc);
    let stack = proc.stack_mut();
    let frame = stack
        .back_mut()
        .ok_or_else(|| fault(tags::INVALID_OPERAND, "no active frame"))?;
    frame.deferred.push(DeferredCall {
        entry,
        arguments: pending.arguments,
        captures,
    });
    Ok(Outcome::Advance)
}

pub(crate) fn ex_return(proc: &mut Process, out: RegisterAccess) -> Result<Outcome, Value> {
    {
        let stack = proc.stack();
        let frame = stack
            .back()
            .ok_or_else(|| fault(tags::INVALID_OPERAND, "no active frame"))?;
        if let Some(index) = frame.arguments.unconsumed_moved() {
            return Err(fault(
                tags::TYPE_ERROR,
                format!("parameter {index} was moved in but never consumed"),
            ));
        }
    }
    let value = access::take_value(proc, out)?;
    proc.stack_mut().pending_removal = Some(Removal::Return { value });
    Ok(Outcome::Jumped)
}

pub(crate) fn ex_if(
    proc: &mut Process,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    let condition = access::with_value(proc, out, |value| Ok(value.boolean()))?;
    if !condition {
        return Ok(Outcome::Advance);
    }
    let module_id = proc.stack().ip.module;
    let target = access::with_value(proc, src, |value| code_address(module_id, value))?;
    proc.stack_mut().ip = target;
    Ok(Outcome::Jumped)
}

/*
 * Try/catch.
 */

pub(crate) fn ex_try(proc: &mut Process) -> Result<Outcome, Value> {
    let stack = proc.stack_mut();
    if stack.frames.is_empty() {
        return Err(fault(tags::INVALID_OPERAND, "no active frame"));
    }
    let frame_depth = stack.frames.len() - 1;
    stack.try_frames.push(TryFrame {
        frame_depth,
        catches: Vec::new(),
        return_ip: None,
    });
    Ok(Outcome::Advance)
}

pub(crate) fn ex_catch(
    proc: &mut Process,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    let tag = access::with_value(proc, out, |value| super::atom_of(value))?;
    let module_id = proc.stack().ip.module;
    let block = access::with_value(proc, src, |value| code_address(module_id, value))?;
    let stack = proc.stack_mut();
    let try_frame = stack
        .newest_try_frame_mut()
        .ok_or_else(|| fault(tags::INVALID_OPERAND, "catch without a try frame"))?;
    try_frame.catches.push((tag, block));
    Ok(Outcome::Advance)
}

pub(crate) fn ex_enter(proc: &mut Process, out: RegisterAccess) -> Result<Outcome, Value> {
    let module_id = proc.stack().ip.module;
    let block = access::with_value(proc, out, |value| code_address(module_id, value))?;
    let return_ip = {
        let ip = proc.stack().ip;
        Addr::new(ip.module, ip.offset + 1)
    };
    let stack = proc.stack_mut();
    let try_frame = stack
        .newest_try_frame_mut()
        .ok_or_else(|| fault(tags::INVALID_OPERAND, "enter without a try frame"))?;
    try_frame.return_ip = Some(return_ip);
    stack.ip = block;
    Ok(Outcome::Jumped)
}

pub(crate) fn ex_leave(proc: &mut Process) -> Result<Outcome, Value> {
    let stack = proc.stack_mut();
    let try_frame = stack
        .try_frames
        .pop()
        .ok_or_else(|| fault(tags::INVALID_OPERAND, "leave without a try frame"))?;
    let return_ip = try_frame
        .return_ip
        .ok_or_else(|| fault(tags::INVALID_OPERAND, "leave from a block never entered"))?;
    stack.ip = return_ip;
    Ok(Outcome::Jumped)
}

pub(crate) fn ex_throw(proc: &mut Process, out: RegisterAccess) -> Result<Outcome, Value> {
    let value = access::take_value(proc, out)?;
    if value.is_void() {
        return Err(fault(tags::INVALID_OPERAND, "throw from an empty register"));
    }
    // Thrown values travel the same path as runtime faults.
    Err(value)
}

pub(crate) fn ex_draw(proc: &mut Process, out: RegisterAccess) -> Result<Outcome, Value> {
    let caught = proc
        .stack_mut()
        .caught
        .take()
        .ok_or_else(|| fault(tags::INVALID_OPERAND, "draw without a caught exception"))?;
    access::set_value(proc, out, caught)?;
    Ok(Outcome::Advance)
}

/*
 * Throw machinery.
 */

fn exception_ref(value: &Value) -> &ExceptionValue {
    match value.boxed() {
        Some(Boxed::Exception(e)) => e,
        _ => unreachable!("into_exception always produces an exception value"),
    }
}

/// Normalise a thrown value into an exception: atoms throw as their own tag,
/// other values are wrapped with their type name as the tag, and the tag's
/// ancestor chain is filled in from the kernel's type registry.
fn into_exception(ctx: &ExecCtx, value: Value) -> Value {
    match value {
        Value::Boxed(boxed) => match *boxed {
            Boxed::Exception(mut e) => {
                if e.chain.is_empty() {
                    e.chain = ctx.kernel.exception_chain_of(e.tag.as_str());
                }
                Value::Boxed(Box::new(Boxed::Exception(e)))
            }
            Boxed::Atom(atom) => {
                let chain = ctx.kernel.exception_chain_of(atom.as_str());
                Value::exception(atom, chain, Value::Void)
            }
            other => {
                let rewrapped = Value::Boxed(Box::new(other));
                let tag = crate::value::Atom::new(rewrapped.type_name());
                let chain = ctx.kernel.exception_chain_of(tag.as_str());
                Value::exception(tag, chain, rewrapped)
            }
        },
        plain => {
            let tag = crate::value::Atom::new(plain.type_name());
            let chain = ctx.kernel.exception_chain_of(tag.as_str());
            Value::exception(tag, chain, plain)
        }
    }
}

/// Begin unwinding the active stack with a thrown value. Handler search walks
/// the try-frames newest to oldest; without a match the whole stack unwinds
/// and the process dies abnormally, after every removed frame has run its
/// deferred calls.
pub(crate) fn throw_value(proc: &mut Process, ctx: &ExecCtx, value: Value) {
    let exception = into_exception(ctx, value);
    let handler = {
        let e = exception_ref(&exception);
        proc.stack().find_handler(|tag| e.matches(tag))
    };
    proc.stack_mut().pending_removal = Some(Removal::Unwind { exception, handler });
}

fn cleanup_frame(proc: &mut Process, frame: &Frame) {
    for region in &frame.auto_regions {
        proc.free_region(*region);
    }
}

/// Make one step of progress on the active stack's pending removal.
pub(crate) fn advance_removal(proc: &mut Process, ctx: &ExecCtx) -> Result<StepFlow, Value> {
    let _ = ctx;
    loop {
        let will_pop = {
            let stack = proc.stack();
            let removal = stack
                .pending_removal
                .as_ref()
                .expect("advance_removal requires a pending removal");
            match removal {
                Removal::Return { .. } | Removal::Tailcall { .. } => true,
                Removal::Unwind {
                    handler: Some(handler),
                    ..
                } => stack.frames.len() > handler.frame_depth + 1,
                Removal::Unwind { handler: None, .. } => !stack.frames.is_empty(),
            }
        };

        // The deferred calls of a frame about to be removed run first, newest
        // registration first, each on its own ephemeral stack.
        if will_pop {
            let deferred = proc
                .stack_mut()
                .back_mut()
                .and_then(|frame| frame.deferred.pop());
            if let Some(call) = deferred {
                proc.stack_mut().state = StackState::SuspendedByDeferredOnFramePop;
                let mut frame = Frame::new(call.entry, None, call.arguments);
                frame.captures = call.captures;
                proc.enter_deferred_stack(frame)?;
                return Ok(StepFlow::Advanced { greedy: false });
            }
        }

        let removal = proc
            .stack_mut()
            .pending_removal
            .take()
            .expect("advance_removal requires a pending removal");

        match removal {
            Removal::Return { value } => {
                let frame = proc
                    .stack_mut()
                    .frames
                    .pop()
                    .expect("return always pops a frame");
                cleanup_frame(proc, &frame);
                let depth = proc.stack().frames.len();
                proc.stack_mut().drop_try_frames_at(depth);

                if proc.stack().frames.is_empty() {
                    if proc.active_stack == 0 {
                        proc.state = ProcessState::TerminatedOk(value);
                        return Ok(StepFlow::Parked);
                    }
                    // A deferred call finished; resume its owner, which still
                    // has its own removal to complete.
                    proc.leave_deferred_stack();
                    proc.stack_mut().state = StackState::Ready;
                    if proc.stack().pending_removal.is_some() {
                        continue;
                    }
                    return Ok(StepFlow::Advanced { greedy: false });
                }

                let return_address = frame
                    .return_address
                    .expect("a non-bottom frame has a return address");
                access::set_value(proc, frame.result_to, value)?;
                proc.stack_mut().ip = return_address;
                return Ok(StepFlow::Advanced { greedy: false });
            }

            Removal::Tailcall {
                entry,
                arguments,
                captures,
            } => {
                let old = proc
                    .stack_mut()
                    .frames
                    .pop()
                    .expect("tailcall always pops a frame");
                cleanup_frame(proc, &old);
                let depth = proc.stack().frames.len();
                proc.stack_mut().drop_try_frames_at(depth);

                let mut frame = Frame::new(entry, old.return_address, arguments);
                frame.result_to = old.result_to;
                frame.captures = captures;
                proc.stack_mut().push_frame(frame)?;
                return Ok(StepFlow::Advanced { greedy: false });
            }

            Removal::Unwind { exception, handler } => {
                if let Some(h) = handler {
                    if proc.stack().frames.len() == h.frame_depth + 1 {
                        let stack = proc.stack_mut();
                        stack.caught = Some(exception);
                        stack.ip = h.block;
                        stack.state = StackState::Ready;
                        return Ok(StepFlow::Advanced { greedy: false });
                    }
                } else if proc.stack().frames.is_empty() {
                    // No handler anywhere on this stack. An exception
                    // escaping a deferred call is as fatal as one escaping
                    // main.
                    while proc.active_stack != 0 {
                        proc.leave_deferred_stack();
                    }
                    proc.state = ProcessState::TerminatedErr(exception);
                    return Ok(StepFlow::Parked);
                }

                let frame = proc
                    .stack_mut()
                    .frames
                    .pop()
                    .expect("unwinding pops a frame");
                cleanup_frame(proc, &frame);
                let depth = proc.stack().frames.len();
                proc.stack_mut().drop_try_frames_at(depth);
                proc.stack_mut().pending_removal = Some(Removal::Unwind { exception, handler });
            }
        }
    }
}
