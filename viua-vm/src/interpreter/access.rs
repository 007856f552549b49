//! Resolution of register-access descriptors against a process.
//!
//! An access names one of six register sets relative to the process's current
//! frame: locals, the pending frame's arguments (the write side of a call in
//! preparation), the current frame's arguments (the read side, "parameters"),
//! per-function statics, process globals, or a closure's captured set. On top
//! of that the dereference bit routes the access through a pointer held in
//! the named register.

use viua_arch::{AccessSet, RegisterAccess};

use crate::process::{Process, SetMut, SetRef};
use crate::registers::RegisterSet;
use crate::value::{fault, tags, Boxed, PointerValue, Value};

fn no_frame() -> Value {
    fault(tags::INVALID_OPERAND, "no active frame")
}

fn no_pending_frame() -> Value {
    fault(
        tags::INVALID_OPERAND,
        "no frame has been prepared (missing FRAME?)",
    )
}

/// Read the value a direct (non-dereferencing) access names and pass it to
/// `f`. Undefined static registers read as void.
fn with_direct<R>(
    proc: &Process,
    access: RegisterAccess,
    f: impl FnOnce(&Value) -> Result<R, Value>,
) -> Result<R, Value> {
    let index = usize::from(access.index);
    let stack = proc.stack();
    match access.set {
        AccessSet::Void => f(&Value::Void),
        AccessSet::Local => {
            let frame = stack.back().ok_or_else(no_frame)?;
            f(frame.locals.get(index)?)
        }
        AccessSet::Argument => {
            let pending = stack.pending_frame.as_ref().ok_or_else(no_pending_frame)?;
            f(pending.arguments.get(index)?)
        }
        AccessSet::Parameter => {
            let frame = stack.back().ok_or_else(no_frame)?;
            f(frame.arguments.get(index)?)
        }
        AccessSet::Static => {
            let entry = stack.back().ok_or_else(no_frame)?.entry;
            match proc.statics(entry) {
                Some(set) => f(set.get(index)?),
                None => f(&Value::Void),
            }
        }
        AccessSet::Global => f(proc.globals.get(index)?),
        AccessSet::ClosureLocal => {
            let frame = stack.back().ok_or_else(no_frame)?;
            let captures = frame.captures.as_ref().ok_or_else(|| {
                fault(tags::INVALID_OPERAND, "not in a closure")
            })?;
            let captures = captures.lock();
            f(captures.get(index)?)
        }
    }
}

/// Run `f` on the mutable register set an access resolves to, together with
/// the concrete index.
fn with_set_mut<R>(
    proc: &mut Process,
    access: RegisterAccess,
    f: impl FnOnce(&mut RegisterSet, usize) -> Result<R, Value>,
) -> Result<R, Value> {
    let index = usize::from(access.index);
    match access.set {
        AccessSet::Void => Err(fault(tags::INVALID_OPERAND, "void is not a place")),
        AccessSet::Local => {
            let stack = proc.stack_mut();
            let frame = stack.back_mut().ok_or_else(no_frame)?;
            f(&mut frame.locals, index)
        }
        AccessSet::Argument => {
            let stack = proc.stack_mut();
            let pending = stack.pending_frame.as_mut().ok_or_else(no_pending_frame)?;
            f(&mut pending.arguments, index)
        }
        AccessSet::Parameter => {
            let stack = proc.stack_mut();
            let frame = stack.back_mut().ok_or_else(no_frame)?;
            f(&mut frame.arguments, index)
        }
        AccessSet::Static => {
            let entry = proc.stack().back().ok_or_else(no_frame)?.entry;
            f(proc.statics_for(entry), index)
        }
        AccessSet::Global => f(&mut proc.globals, index),
        AccessSet::ClosureLocal => {
            let captures = {
                let stack = proc.stack_mut();
                let frame = stack.back_mut().ok_or_else(no_frame)?;
                frame
                    .captures
                    .as_ref()
                    .cloned()
                    .ok_or_else(|| fault(tags::INVALID_OPERAND, "not in a closure"))?
            };
            let mut captures = captures.lock();
            f(&mut captures, index)
        }
    }
}

/// Follow the pointer held at a direct access to its target set and index.
fn pointer_target(proc: &Process, access: RegisterAccess) -> Result<(u64, usize), Value> {
    let direct = RegisterAccess::new(access.set, false, access.index);
    with_direct(proc, direct, |value| match value.boxed() {
        Some(Boxed::Pointer(pointer)) => {
            if !pointer.live() {
                return Err(fault(tags::INVALID_POINTER, "pointer target was erased"));
            }
            if pointer.creator() != proc.pid() {
                return Err(fault(
                    tags::INVALID_POINTER,
                    "pointer belongs to another process",
                ));
            }
            match pointer {
                PointerValue::Register { set_id, index, .. } => {
                    Ok((*set_id, usize::from(*index)))
                }
                PointerValue::Memory { .. } => Err(fault(
                    tags::TYPE_ERROR,
                    "memory pointers are accessed with sm/lm",
                )),
            }
        }
        _ => Err(fault(
            tags::TYPE_ERROR,
            format!("cannot dereference a {}", value.type_name()),
        )),
    })
}

/// Read the value an access names (following the dereference bit) and pass
/// it to `f`.
pub fn with_value<R>(
    proc: &Process,
    access: RegisterAccess,
    f: impl FnOnce(&Value) -> Result<R, Value>,
) -> Result<R, Value> {
    if !access.deref {
        return with_direct(proc, access, f);
    }
    let (set_id, index) = pointer_target(proc, access)?;
    match proc.find_set(set_id) {
        Some(SetRef::Plain(set)) => f(set.get(index)?),
        Some(SetRef::Shared(set)) => {
            let set = set.lock();
            f(set.get(index)?)
        }
        None => Err(fault(tags::INVALID_POINTER, "pointer target set is gone")),
    }
}

/// Read two values at once. When both operands live in the same closure's
/// captured set the lock is taken once, not re-entered.
pub fn with_two_values<R>(
    proc: &Process,
    a: RegisterAccess,
    b: RegisterAccess,
    f: impl FnOnce(&Value, &Value) -> Result<R, Value>,
) -> Result<R, Value> {
    let both_closure_local = a.set == AccessSet::ClosureLocal
        && b.set == AccessSet::ClosureLocal
        && !a.deref
        && !b.deref;
    if both_closure_local {
        let frame = proc.stack().back().ok_or_else(no_frame)?;
        let captures = frame
            .captures
            .as_ref()
            .ok_or_else(|| fault(tags::INVALID_OPERAND, "not in a closure"))?;
        let captures = captures.lock();
        return f(
            captures.get(usize::from(a.index))?,
            captures.get(usize::from(b.index))?,
        );
    }
    with_value(proc, a, |x| with_value(proc, b, |y| f(x, y)))
}

/// Write a value to the place an access names. A void access discards the
/// value.
pub fn set_value(proc: &mut Process, access: RegisterAccess, value: Value) -> Result<(), Value> {
    if access.is_void() {
        return Ok(());
    }
    if !access.deref {
        return with_set_mut(proc, access, |set, index| set.set(index, value));
    }
    let (set_id, index) = pointer_target(proc, access)?;
    match proc.find_set_mut(set_id) {
        Some(SetMut::Plain(set)) => set.set(index, value),
        Some(SetMut::Shared(set)) => set.lock().set(index, value),
        None => Err(fault(tags::INVALID_POINTER, "pointer target set is gone")),
    }
}

/// Move the value out of the place an access names, leaving void. Moving
/// through a pointer is not allowed; only the owner gives values up.
pub fn take_value(proc: &mut Process, access: RegisterAccess) -> Result<Value, Value> {
    if access.is_void() {
        return Ok(Value::Void);
    }
    if access.deref {
        return Err(fault(
            tags::INVALID_OPERAND,
            "cannot move a value out through a pointer",
        ));
    }
    with_set_mut(proc, access, |set, index| set.take(index))
}

/// Mutate the value an access names in place (the slot stays defined, so
/// pointers into it survive).
pub fn update_value<R>(
    proc: &mut Process,
    access: RegisterAccess,
    f: impl FnOnce(&mut Value) -> Result<R, Value>,
) -> Result<R, Value> {
    if !access.deref {
        return with_set_mut(proc, access, |set, index| f(set.get_mut(index)?));
    }
    let (set_id, index) = pointer_target(proc, access)?;
    match proc.find_set_mut(set_id) {
        Some(SetMut::Plain(set)) => f(set.get_mut(index)?),
        Some(SetMut::Shared(set)) => {
            let mut set = set.lock();
            f(set.get_mut(index)?)
        }
        None => Err(fault(tags::INVALID_POINTER, "pointer target set is gone")),
    }
}

/// Copy the value an access names.
pub fn copy_value(proc: &Process, access: RegisterAccess) -> Result<Value, Value> {
    with_value(proc, access, |value| value.copy())
}

/// Set a slot flag (e.g. BOUND) on the register a direct access names.
pub fn flag_register(proc: &mut Process, access: RegisterAccess, flag: u8) -> Result<(), Value> {
    if access.is_void() || access.deref {
        return Ok(());
    }
    with_set_mut(proc, access, |set, index| set.flag(index, flag))
}

/// Create a register pointer to the place a direct access names.
pub fn make_pointer(proc: &mut Process, access: RegisterAccess) -> Result<PointerValue, Value> {
    if access.deref {
        return Err(fault(
            tags::INVALID_OPERAND,
            "cannot take a pointer through a pointer",
        ));
    }
    let pid = proc.pid();
    let index = access.index;
    with_set_mut(proc, access, |set, slot| {
        let token = set.pointer_token(slot)?;
        Ok(PointerValue::Register {
            pid,
            set_id: set.set_id(),
            index,
            token,
        })
    })
}
