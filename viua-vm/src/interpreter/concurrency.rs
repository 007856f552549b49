//! Concurrency instructions: process spawning, message passing, joins,
//! watchdogs, foreign calls, and the I/O surface.
//!
//! The blocking instructions (RECEIVE, JOIN, IO_WAIT, and the foreign half
//! of CALL) follow one pattern: check whether the wake condition already
//! holds; if not, park the process in a wait state and leave the instruction
//! pointer in place, so the same instruction re-executes when the scheduler
//! wakes the process. The deadline survives retries in the process's wait
//! memo; it is computed when the instruction first blocks, not per retry.

use std::time::Instant;

use viua_arch::ops::Opcode;
use viua_arch::RegisterAccess;

use super::control::{resolve_callee, take_pending_frame, Callee};
use super::{access, deadline_of, ExecCtx, Outcome};
use crate::ffi::ForeignCall;
use crate::frame::Frame;
use crate::io::InteractionResult;
use crate::process::{Process, WaitState};
use crate::value::{fault, tags, Boxed, IoFd, Value};

pub(crate) fn ex_self(proc: &mut Process, out: RegisterAccess) -> Result<Outcome, Value> {
    let pid = proc.pid();
    access::set_value(proc, out, Value::pid(pid))?;
    Ok(Outcome::Advance)
}

pub(crate) fn ex_watchdog(
    proc: &mut Process,
    ctx: &ExecCtx,
    out: RegisterAccess,
) -> Result<Outcome, Value> {
    let name = access::with_value(proc, out, |value| super::atom_of(value))?;
    if ctx.kernel.get_entry_point_of(name.as_str()).is_none() {
        return Err(fault(
            tags::INVALID_OPERAND,
            format!("watchdog {name} is not a known function"),
        ));
    }
    proc.set_watchdog(name.as_str().to_string())?;
    Ok(Outcome::Advance)
}

pub(crate) fn ex_actor(
    proc: &mut Process,
    ctx: &ExecCtx,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    let (entry, captures) = match resolve_callee(proc, ctx, src)? {
        Callee::Bytecode { entry, captures } => (entry, captures),
        Callee::Foreign { name } => {
            return Err(fault(
                tags::TYPE_ERROR,
                format!("cannot spawn foreign function {name} as a process"),
            ))
        }
    };
    let pending = take_pending_frame(proc);
    let mut frame = Frame::new(entry, None, pending.arguments);
    frame.captures = captures;
    let pid = ctx.kernel.spawn(frame, ctx.scheduler, false);
    access::set_value(proc, out, Value::pid(pid))?;
    Ok(Outcome::Advance)
}

pub(crate) fn ex_send(
    proc: &mut Process,
    ctx: &ExecCtx,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    let pid = access::with_value(proc, out, |value| super::pid_of(value))?;
    let message = access::take_value(proc, src)?;
    if message.is_void() {
        return Err(fault(tags::INVALID_OPERAND, "send of an empty register"));
    }
    ctx.kernel.send(pid, message);
    Ok(Outcome::Advance)
}

pub(crate) fn ex_receive(
    proc: &mut Process,
    ctx: &ExecCtx,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    if proc.message_queue.is_empty() {
        let pid = proc.pid();
        ctx.kernel.receive(pid, &mut proc.message_queue);
    }
    if let Some(message) = proc.message_queue.pop_front() {
        proc.wait_memo = None;
        access::set_value(proc, out, message)?;
        return Ok(Outcome::Advance);
    }

    let deadline = match proc.wait_memo {
        Some(WaitState::Message { deadline }) => deadline,
        _ => {
            let timeout = access::with_value(proc, src, |value| super::timeout_of(value))?;
            deadline_of(timeout)
        }
    };
    if deadline.map(|d| d <= Instant::now()).unwrap_or(false) {
        proc.wait_memo = None;
        return Err(fault(
            tags::MAILBOX_EMPTY_WITH_TIMEOUT,
            "no message arrived before the deadline",
        ));
    }

    let wait = WaitState::Message { deadline };
    proc.wait_memo = Some(wait);
    proc.suspend(wait);
    Ok(Outcome::Suspend)
}

pub(crate) fn ex_join(
    proc: &mut Process,
    ctx: &ExecCtx,
    out: RegisterAccess,
    lhs: RegisterAccess,
    rhs: RegisterAccess,
) -> Result<Outcome, Value> {
    let pid = access::with_value(proc, lhs, |value| super::pid_of(value))?;

    if !ctx.kernel.is_process_joinable(pid) {
        proc.wait_memo = None;
        return Err(fault(
            tags::PROCESS_CANNOT_BE_JOINED,
            format!("process {pid} cannot be joined"),
        ));
    }

    if ctx.kernel.is_process_stopped(pid) {
        proc.wait_memo = None;
        if ctx.kernel.is_process_terminated(pid) {
            let exception = ctx.kernel.transfer_exception_of(pid).unwrap_or_else(|| {
                fault(tags::PROCESS_CANNOT_BE_JOINED, "exception already taken")
            });
            return Err(exception);
        }
        let result = ctx.kernel.transfer_result_of(pid).unwrap_or(Value::Void);
        access::set_value(proc, out, result)?;
        return Ok(Outcome::Advance);
    }

    let deadline = match proc.wait_memo {
        Some(WaitState::Join { deadline, .. }) => deadline,
        _ => {
            let timeout = access::with_value(proc, rhs, |value| super::timeout_of(value))?;
            deadline_of(timeout)
        }
    };
    if deadline.map(|d| d <= Instant::now()).unwrap_or(false) {
        proc.wait_memo = None;
        return Err(fault("Exception", "process did not join before the deadline"));
    }

    let wait = WaitState::Join { pid, deadline };
    proc.wait_memo = Some(wait);
    proc.suspend(wait);
    Ok(Outcome::Suspend)
}

/*
 * Foreign calls.
 */

/// First half of a foreign CALL: package the prepared arguments, queue the
/// request, park the caller.
pub(crate) fn begin_foreign_call(
    proc: &mut Process,
    ctx: &ExecCtx,
    name: &str,
) -> Result<Outcome, Value> {
    let pending = take_pending_frame(proc);
    let call = ForeignCall {
        pid: proc.pid(),
        arguments: pending.arguments,
    };
    let request = ctx.kernel.ffi.submit(name, call).map_err(|_| {
        fault(
            tags::INVALID_OPERAND,
            format!("unknown foreign function {name}"),
        )
    })?;
    proc.foreign_call = Some(request);
    proc.suspend(WaitState::ForeignCall { request });
    Ok(Outcome::Suspend)
}

/// Second half of a foreign CALL, on re-execution: deliver the result or
/// rethrow what the foreign function raised.
pub(crate) fn finish_foreign_call(
    proc: &mut Process,
    ctx: &ExecCtx,
    out: RegisterAccess,
) -> Result<Outcome, Value> {
    let request = proc
        .foreign_call
        .expect("finish_foreign_call requires an in-flight foreign call");
    let Some(outcome) = ctx.kernel.ffi.take_result(request) else {
        proc.suspend(WaitState::ForeignCall { request });
        return Ok(Outcome::Suspend);
    };
    proc.foreign_call = None;
    let value = outcome?;
    access::set_value(proc, out, value)?;
    Ok(Outcome::Advance)
}

/*
 * I/O.
 */

fn port_fd(value: &Value) -> Result<i32, Value> {
    match value {
        Value::Int(n) => i32::try_from(*n)
            .map_err(|_| fault(tags::TYPE_ERROR, "file descriptor out of range")),
        Value::Boxed(b) => match &**b {
            Boxed::IoFd(io_fd) => Ok(io_fd.raw()),
            _ => Err(fault(
                tags::TYPE_ERROR,
                format!("wanted IO_fd, got {}", value.type_name()),
            )),
        },
        _ => Err(fault(
            tags::TYPE_ERROR,
            format!("wanted IO_fd, got {}", value.type_name()),
        )),
    }
}

/// Pull a field out of an I/O request struct.
fn request_field(request: &Value, name: &str) -> Option<Value> {
    match request.boxed() {
        Some(Boxed::Struct(fields)) => fields
            .get(&crate::value::Atom::new(name))
            .and_then(|field| field.copy().ok()),
        _ => None,
    }
}

pub(crate) fn ex_io_triple(
    proc: &mut Process,
    ctx: &ExecCtx,
    opcode: Opcode,
    out: RegisterAccess,
    lhs: RegisterAccess,
    rhs: RegisterAccess,
) -> Result<Outcome, Value> {
    match opcode {
        Opcode::IoSubmit => ex_io_submit(proc, ctx, out, lhs, rhs),
        Opcode::IoWait => ex_io_wait(proc, ctx, out, lhs, rhs),
        Opcode::IoShutdown => {
            let id = access::with_value(proc, lhs, |value| super::request_of(value))?;
            ctx.kernel.io.cancel(id);
            Ok(Outcome::Advance)
        }
        Opcode::IoCtl => ex_io_ctl(proc, out, lhs, rhs),
        _ => unreachable!("not an io opcode: {opcode}"),
    }
}

/// IO_SUBMIT: build an interaction from the port and the request struct
/// (`{opcode: read|write|close, limit/buffer: …}`), hand it to the engine,
/// and leave an `IO_request` handle in the output register.
fn ex_io_submit(
    proc: &mut Process,
    ctx: &ExecCtx,
    out: RegisterAccess,
    lhs: RegisterAccess,
    rhs: RegisterAccess,
) -> Result<Outcome, Value> {
    let request = access::take_value(proc, rhs)?;
    let kind = request_field(&request, "opcode")
        .ok_or_else(|| fault(tags::INVALID_OPERAND, "io request without an opcode field"))?;
    let kind = super::atom_of(&kind)?;

    let id = match kind.as_str() {
        "read" => {
            let fd = access::with_value(proc, lhs, |value| port_fd(value))?;
            let limit = match request_field(&request, "limit") {
                Some(limit) => super::count_of(&limit)?,
                None => 4096,
            };
            ctx.kernel.io.submit_read(fd, limit)
        }
        "write" => {
            let fd = access::with_value(proc, lhs, |value| port_fd(value))?;
            let buffer = request_field(&request, "buffer")
                .ok_or_else(|| fault(tags::INVALID_OPERAND, "write request without a buffer"))?;
            let bytes = match buffer.boxed() {
                Some(Boxed::String(s)) => s.clone().into_bytes(),
                _ => {
                    return Err(fault(
                        tags::TYPE_ERROR,
                        format!("cannot write a {}", buffer.type_name()),
                    ))
                }
            };
            ctx.kernel.io.submit_write(fd, bytes)
        }
        "close" => {
            // Closing an owned descriptor consumes the ownership; a borrowed
            // handle completes through an empty interaction and the fd stays
            // open.
            let (raw, owned) = access::update_value(proc, lhs, |value| {
                if let Value::Int(n) = value {
                    return Ok((*n as i32, None));
                }
                let type_name = value.type_name();
                match value.boxed_mut() {
                    Some(Boxed::IoFd(io_fd)) => Ok((io_fd.raw(), io_fd.release())),
                    _ => Err(fault(
                        tags::TYPE_ERROR,
                        format!("cannot close a {type_name}"),
                    )),
                }
            })?;
            ctx.kernel.io.submit_close(raw, owned)
        }
        other => {
            return Err(fault(
                tags::INVALID_OPERAND,
                format!("unknown io opcode {other}"),
            ))
        }
    };

    access::set_value(proc, out, Value::io_request(id))?;
    Ok(Outcome::Advance)
}

fn ex_io_wait(
    proc: &mut Process,
    ctx: &ExecCtx,
    out: RegisterAccess,
    lhs: RegisterAccess,
    rhs: RegisterAccess,
) -> Result<Outcome, Value> {
    let id = access::with_value(proc, lhs, |value| super::request_of(value))?;

    if let Some(result) = ctx.kernel.io.take_result(id) {
        proc.wait_memo = None;
        return match result {
            InteractionResult::Success(value) => {
                access::set_value(proc, out, value)?;
                Ok(Outcome::Advance)
            }
            InteractionResult::Error(error) => Err(error),
            InteractionResult::Cancelled => {
                Err(fault(tags::IO_CANCEL, format!("request {id} was cancelled")))
            }
        };
    }

    if !ctx.kernel.io.is_tracked(id) {
        proc.wait_memo = None;
        return Err(fault(tags::IO_CANCEL, format!("request {id} was cancelled")));
    }

    let deadline = match proc.wait_memo {
        Some(WaitState::Io { deadline, .. }) => deadline,
        _ => {
            let timeout = access::with_value(proc, rhs, |value| super::timeout_of(value))?;
            deadline_of(timeout)
        }
    };
    if deadline.map(|d| d <= Instant::now()).unwrap_or(false) {
        // The wait expired: the request is cancelled and leaves kernel
        // tracking before the waiter sees the exception.
        ctx.kernel.io.cancel(id);
        proc.wait_memo = None;
        return Err(fault(
            tags::IO_CANCEL,
            format!("request {id} timed out and was cancelled"),
        ));
    }

    let wait = WaitState::Io {
        request: id,
        deadline,
    };
    proc.wait_memo = Some(wait);
    proc.suspend(wait);
    Ok(Outcome::Suspend)
}

/// IO_CTL: change a descriptor handle's ownership. `owned` makes drop close
/// the fd, `borrowed` detaches it.
fn ex_io_ctl(
    proc: &mut Process,
    out: RegisterAccess,
    lhs: RegisterAccess,
    rhs: RegisterAccess,
) -> Result<Outcome, Value> {
    let command = access::with_value(proc, rhs, |value| super::atom_of(value))?;
    let raw = access::update_value(proc, lhs, |value| match value.boxed_mut() {
        Some(Boxed::IoFd(io_fd)) => {
            match command.as_str() {
                "owned" => {
                    if !io_fd.is_owned() {
                        let raw = io_fd.raw();
                        let owned = unsafe { std::os::fd::FromRawFd::from_raw_fd(raw) };
                        *io_fd = IoFd::owned(owned);
                    }
                }
                "borrowed" => {
                    if let Some(owned) = io_fd.release() {
                        // Keep the descriptor open; only the ownership goes.
                        let _ = std::os::fd::IntoRawFd::into_raw_fd(owned);
                    }
                }
                other => {
                    return Err(fault(
                        tags::INVALID_OPERAND,
                        format!("unknown io_ctl command {other}"),
                    ))
                }
            }
            Ok(io_fd.raw())
        }
        _ => Err(fault(tags::TYPE_ERROR, "io_ctl target is not IO_fd")),
    })?;
    access::set_value(proc, out, Value::Int(i64::from(raw)))?;
    Ok(Outcome::Advance)
}

pub(crate) fn ex_io_peek(
    proc: &mut Process,
    ctx: &ExecCtx,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    let id = access::with_value(proc, src, |value| super::request_of(value))?;
    let complete = ctx.kernel.io.is_complete(id);
    access::set_value(proc, out, Value::Int(i64::from(complete)))?;
    Ok(Outcome::Advance)
}
