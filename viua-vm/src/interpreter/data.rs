//! Data movement: copies and moves, container operations, literal
//! reification from `.rodata`, immediates, closures, and the memory
//! instructions.

use viua_arch::ops::Opcode;
use viua_arch::RegisterAccess;

use super::{access, count_of, Outcome};
use crate::loader::Module;
use crate::process::Process;
use crate::registers::{RegisterSet, BOUND, MOVED};
use crate::value::{fault, tags, Boxed, PointerValue, Value};

/// Capture slots available in a freshly created closure.
const CLOSURE_CAPTURE_CAPACITY: usize = 64;

pub(crate) fn ex_transfer(
    proc: &mut Process,
    opcode: Opcode,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    match opcode {
        Opcode::Copy => {
            let value = access::copy_value(proc, src)?;
            access::set_value(proc, out, value)?;
        }
        Opcode::Move => {
            let value = access::take_value(proc, src)?;
            if value.is_void() {
                return Err(fault(
                    tags::INVALID_OPERAND,
                    "move from an empty register",
                ));
            }
            access::set_value(proc, out, value)?;
            // A value moved into a call's argument set becomes a moved-in
            // parameter, which the callee is obliged to consume.
            if out.set == viua_arch::AccessSet::Argument {
                access::flag_register(proc, out, MOVED)?;
            }
        }
        Opcode::Swap => {
            let a = access::take_value(proc, out)?;
            let b = access::take_value(proc, src)?;
            access::set_value(proc, out, b)?;
            access::set_value(proc, src, a)?;
        }
        _ => unreachable!("not a transfer opcode: {opcode}"),
    }
    Ok(Outcome::Advance)
}

pub(crate) fn ex_ref(
    proc: &mut Process,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    let pointer = access::make_pointer(proc, src)?;
    access::set_value(proc, out, Value::pointer(pointer))?;
    Ok(Outcome::Advance)
}

/// PTRLIVE never throws: any non-pointer or dead pointer is simply not live.
pub(crate) fn ex_ptrlive(
    proc: &mut Process,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    let live = access::with_value(proc, src, |value| {
        Ok(match value.boxed() {
            Some(Boxed::Pointer(pointer)) => pointer.live() && pointer.creator() == proc.pid(),
            _ => false,
        })
    })
    .unwrap_or(false);
    access::set_value(proc, out, Value::Int(i64::from(live)))?;
    Ok(Outcome::Advance)
}

pub(crate) fn ex_container_triple(
    proc: &mut Process,
    opcode: Opcode,
    out: RegisterAccess,
    lhs: RegisterAccess,
    rhs: RegisterAccess,
) -> Result<Outcome, Value> {
    match opcode {
        Opcode::StructInsert => {
            let key = access::with_value(proc, lhs, |value| super::atom_of(value))?;
            let value = access::take_value(proc, rhs)?;
            access::update_value(proc, out, |target| match target.boxed_mut() {
                Some(Boxed::Struct(fields)) => {
                    fields.insert(key, value);
                    Ok(())
                }
                _ => Err(fault(tags::TYPE_ERROR, "struct_insert target is not Struct")),
            })?;
        }
        Opcode::StructAt => {
            let key = access::with_value(proc, rhs, |value| super::atom_of(value))?;
            let value = access::with_value(proc, lhs, |container| match container.boxed() {
                Some(Boxed::Struct(fields)) => match fields.get(&key) {
                    Some(field) => field.copy(),
                    None => Err(fault(
                        tags::OUT_OF_BOUNDS,
                        format!("struct has no field {key}"),
                    )),
                },
                _ => Err(fault(tags::TYPE_ERROR, "struct_at source is not Struct")),
            })?;
            access::set_value(proc, out, value)?;
        }
        Opcode::StructRemove => {
            let key = access::with_value(proc, rhs, |value| super::atom_of(value))?;
            let value = access::update_value(proc, lhs, |container| match container.boxed_mut() {
                Some(Boxed::Struct(fields)) => fields.remove(&key).ok_or_else(|| {
                    fault(tags::OUT_OF_BOUNDS, format!("struct has no field {key}"))
                }),
                _ => Err(fault(tags::TYPE_ERROR, "struct_remove target is not Struct")),
            })?;
            access::set_value(proc, out, value)?;
        }
        Opcode::BufferAt => {
            let index = access::with_value(proc, rhs, |value| count_of(value))?;
            let value = access::with_value(proc, lhs, |container| match container.boxed() {
                Some(Boxed::Buffer(items)) => match items.get(index) {
                    Some(item) => item.copy(),
                    None => Err(fault(
                        tags::OUT_OF_BOUNDS,
                        format!("index {index} out of range for buffer of {}", items.len()),
                    )),
                },
                _ => Err(fault(tags::TYPE_ERROR, "buffer_at source is not Vector")),
            })?;
            access::set_value(proc, out, value)?;
        }
        Opcode::BufferPop => {
            // A void index pops the newest element.
            let index = access::with_value(proc, rhs, |value| match value {
                Value::Void => Ok(None),
                other => count_of(other).map(Some),
            })?;
            let value = access::update_value(proc, lhs, |container| match container.boxed_mut() {
                Some(Boxed::Buffer(items)) => {
                    let index = index.unwrap_or(items.len().saturating_sub(1));
                    if index >= items.len() {
                        return Err(fault(
                            tags::OUT_OF_BOUNDS,
                            format!("index {index} out of range for buffer of {}", items.len()),
                        ));
                    }
                    Ok(items.remove(index))
                }
                _ => Err(fault(tags::TYPE_ERROR, "buffer_pop target is not Vector")),
            })?;
            access::set_value(proc, out, value)?;
        }
        _ => unreachable!("not a container opcode: {opcode}"),
    }
    Ok(Outcome::Advance)
}

pub(crate) fn ex_buffer_double(
    proc: &mut Process,
    opcode: Opcode,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    match opcode {
        Opcode::BufferPush => {
            let value = access::take_value(proc, src)?;
            access::update_value(proc, out, |target| match target.boxed_mut() {
                Some(Boxed::Buffer(items)) => {
                    items.push(value);
                    Ok(())
                }
                _ => Err(fault(tags::TYPE_ERROR, "buffer_push target is not Vector")),
            })?;
        }
        Opcode::BufferSize => {
            let size = access::with_value(proc, src, |container| match container.boxed() {
                Some(Boxed::Buffer(items)) => Ok(items.len() as u64),
                _ => Err(fault(tags::TYPE_ERROR, "buffer_size source is not Vector")),
            })?;
            access::set_value(proc, out, Value::Uint(size))?;
        }
        _ => unreachable!("not a buffer opcode: {opcode}"),
    }
    Ok(Outcome::Advance)
}

/// ATOM, STRING, FLOAT, DOUBLE: reify the raw bits already loaded into the
/// register. Atoms and strings read `.rodata` at the offset the register
/// holds (put there by ARODP); the float forms reinterpret the register's
/// bits.
pub(crate) fn ex_reify(
    proc: &mut Process,
    module: &Module,
    opcode: Opcode,
    out: RegisterAccess,
) -> Result<Outcome, Value> {
    access::update_value(proc, out, |value| {
        let replacement = match opcode {
            Opcode::Atom | Opcode::String => {
                let offset = super::uint_of(value)?;
                let text = module.rodata_str_at(offset).ok_or_else(|| {
                    fault(
                        tags::INVALID_OPERAND,
                        format!("no rodata string at offset {offset:#x}"),
                    )
                })?;
                if opcode == Opcode::Atom {
                    Value::atom(text)
                } else {
                    Value::string(text)
                }
            }
            Opcode::Float => {
                let bits = super::uint_of(value)? as u32;
                Value::Float(f32::from_bits(bits))
            }
            Opcode::Double => {
                let bits = super::uint_of(value)?;
                Value::Double(f64::from_bits(bits))
            }
            _ => unreachable!("not a reify opcode: {opcode}"),
        };
        *value = replacement;
        Ok(())
    })?;
    Ok(Outcome::Advance)
}

pub(crate) fn ex_make_container(
    proc: &mut Process,
    opcode: Opcode,
    out: RegisterAccess,
) -> Result<Outcome, Value> {
    let value = match opcode {
        Opcode::Struct => Value::struct_of(Default::default()),
        Opcode::Buffer => Value::buffer(Vec::new()),
        _ => unreachable!("not a container constructor: {opcode}"),
    };
    access::set_value(proc, out, value)?;
    Ok(Outcome::Advance)
}

/// LLI, LLIU, and the immediate float load.
pub(crate) fn ex_load_low(
    proc: &mut Process,
    opcode: Opcode,
    out: RegisterAccess,
    immediate: u32,
) -> Result<Outcome, Value> {
    match opcode {
        Opcode::FloatImm => {
            access::set_value(proc, out, Value::Float(f32::from_bits(immediate)))?;
        }
        Opcode::Lli | Opcode::Lliu => {
            access::update_value(proc, out, |value| {
                let high = match value {
                    Value::Void => 0,
                    Value::Int(n) => *n as u64,
                    Value::Uint(n) => *n,
                    other => {
                        return Err(fault(
                            tags::TYPE_ERROR,
                            format!("lli into a {}", other.type_name()),
                        ))
                    }
                } & 0xffff_ffff_0000_0000;
                let bits = high | u64::from(immediate);
                *value = if opcode == Opcode::Lliu {
                    Value::Uint(bits)
                } else {
                    Value::Int(bits as i64)
                };
                Ok(())
            })?;
        }
        _ => unreachable!("not a load-low opcode: {opcode}"),
    }
    Ok(Outcome::Advance)
}

fn sign_extend_36(immediate: u64) -> i64 {
    if immediate & (1 << 35) != 0 {
        (immediate | !0x0f_ffff_ffff) as i64
    } else {
        immediate as i64
    }
}

/// The E-format loads: LUI/LUIU, CAST, and the rodata/text address loads.
pub(crate) fn ex_extended(
    proc: &mut Process,
    module: &Module,
    opcode: Opcode,
    out: RegisterAccess,
    immediate: u64,
) -> Result<Outcome, Value> {
    let _ = module;
    match opcode {
        Opcode::Lui => {
            let value = sign_extend_36(immediate).wrapping_shl(28);
            access::set_value(proc, out, Value::Int(value))?;
        }
        Opcode::Luiu => {
            access::set_value(proc, out, Value::Uint(immediate << 28))?;
        }
        Opcode::Arodp => {
            access::set_value(proc, out, Value::Uint(immediate))?;
        }
        Opcode::Atxtp => {
            let module_id = proc.stack().ip.module;
            access::set_value(
                proc,
                out,
                Value::function(crate::value::Addr::new(module_id, immediate)),
            )?;
        }
        Opcode::Cast => {
            access::update_value(proc, out, |value| {
                let replacement = match immediate {
                    0 => value.cast_to_int()?,
                    1 => value.cast_to_uint()?,
                    2 => value.cast_to_float()?,
                    3 => value.cast_to_double()?,
                    4 => value.cast_to_string()?,
                    other => {
                        return Err(fault(
                            tags::INVALID_OPERAND,
                            format!("unknown cast kind {other}"),
                        ))
                    }
                };
                *value = replacement;
                Ok(())
            })?;
        }
        _ => unreachable!("not an extended opcode: {opcode}"),
    }
    Ok(Outcome::Advance)
}

/*
 * Closures.
 */

pub(crate) fn ex_closure(
    proc: &mut Process,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    let entry = access::with_value(proc, src, |value| match value.boxed() {
        Some(Boxed::Function(function)) => Ok(function.entry),
        _ => Err(fault(
            tags::TYPE_ERROR,
            format!("cannot make a closure out of {}", value.type_name()),
        )),
    })?;
    let captures = RegisterSet::new(CLOSURE_CAPTURE_CAPACITY);
    access::set_value(proc, out, Value::closure(entry, captures))?;
    Ok(Outcome::Advance)
}

/// CAPTURE copies, CAPTUREMOVE moves, a register into a slot of a closure's
/// captured set. The slot number rides in the index field of the middle
/// operand.
pub(crate) fn ex_capture(
    proc: &mut Process,
    opcode: Opcode,
    out: RegisterAccess,
    lhs: RegisterAccess,
    rhs: RegisterAccess,
) -> Result<Outcome, Value> {
    let captures = access::with_value(proc, out, |value| match value.boxed() {
        Some(Boxed::Closure(closure)) => Ok(std::sync::Arc::clone(&closure.captures)),
        _ => Err(fault(tags::TYPE_ERROR, "capture target is not Closure")),
    })?;
    let slot = usize::from(lhs.index);

    let value = match opcode {
        Opcode::Capture => {
            let value = access::copy_value(proc, rhs)?;
            access::flag_register(proc, rhs, BOUND)?;
            value
        }
        Opcode::Capturemove => access::take_value(proc, rhs)?,
        _ => unreachable!("not a capture opcode: {opcode}"),
    };

    captures.lock().set(slot, value)?;
    Ok(Outcome::Advance)
}

/*
 * Memory instructions.
 */

fn unit_size(spec: u8) -> u64 {
    1 << (spec & 0b11)
}

fn memory_pointer(proc: &Process, value: &Value) -> Result<(u64, u64), Value> {
    match value.boxed() {
        Some(Boxed::Pointer(pointer)) => {
            if !pointer.live() {
                return Err(fault(tags::INVALID_POINTER, "memory region was freed"));
            }
            if pointer.creator() != proc.pid() {
                return Err(fault(
                    tags::INVALID_POINTER,
                    "pointer belongs to another process",
                ));
            }
            match pointer {
                PointerValue::Memory { region, offset, .. } => Ok((*region, *offset)),
                PointerValue::Register { .. } => Err(fault(
                    tags::TYPE_ERROR,
                    "register pointers are not memory pointers",
                )),
            }
        }
        _ => Err(fault(
            tags::TYPE_ERROR,
            format!("wanted Pointer, got {}", value.type_name()),
        )),
    }
}

/// SM, LM, AA, AD, and memory-pointer derivation.
pub(crate) fn ex_memory(
    proc: &mut Process,
    opcode: Opcode,
    out: RegisterAccess,
    src: RegisterAccess,
    offset: u16,
    spec: u8,
) -> Result<Outcome, Value> {
    let unit = unit_size(spec);
    match opcode {
        Opcode::Aa | Opcode::Ad => {
            // Element count comes from the source register, or from the
            // offset immediate when the source is void.
            let count = access::with_value(proc, src, |value| match value {
                Value::Void => Ok(u64::from(offset)),
                other => super::uint_of(other),
            })?;
            let size = count
                .checked_mul(unit)
                .and_then(|bytes| usize::try_from(bytes).ok())
                .ok_or_else(|| fault(tags::VALUE_OUT_OF_RANGE, "allocation too large"))?;

            let region = proc.allocate_region(size);
            if opcode == Opcode::Aa {
                if let Some(frame) = proc.stack_mut().back_mut() {
                    frame.auto_regions.push(region);
                }
            }
            let token = proc
                .region(region)
                .expect("region was just created")
                .token
                .clone();
            let pointer = PointerValue::Memory {
                pid: proc.pid(),
                region,
                offset: 0,
                token,
            };
            access::set_value(proc, out, Value::pointer(pointer))?;
        }
        Opcode::Ptr => {
            let (region, base) = access::with_value(proc, src, |value| {
                memory_pointer(proc, value)
            })?;
            let token = proc
                .region(region)
                .ok_or_else(|| fault(tags::INVALID_POINTER, "memory region was freed"))?
                .token
                .clone();
            let pointer = PointerValue::Memory {
                pid: proc.pid(),
                region,
                offset: base + u64::from(offset) * unit,
                token,
            };
            access::set_value(proc, out, Value::pointer(pointer))?;
        }
        Opcode::Sm => {
            // out names the pointer, src the value to store.
            let (region, base) = access::with_value(proc, out, |value| {
                memory_pointer(proc, value)
            })?;
            let bits = access::with_value(proc, src, |value| match value {
                Value::Int(n) => Ok(*n as u64),
                Value::Uint(n) => Ok(*n),
                other => Err(fault(
                    tags::TYPE_ERROR,
                    format!("cannot store a {} in memory", other.type_name()),
                )),
            })?;
            let start = base + u64::from(offset) * unit;
            let memory = proc
                .region_mut(region)
                .ok_or_else(|| fault(tags::INVALID_POINTER, "memory region was freed"))?;
            let start = usize::try_from(start)
                .map_err(|_| fault(tags::OUT_OF_BOUNDS, "store offset overflows"))?;
            let end = start + unit as usize;
            let slot = memory.bytes.get_mut(start..end).ok_or_else(|| {
                fault(tags::OUT_OF_BOUNDS, "store outside of allocated region")
            })?;
            slot.copy_from_slice(&bits.to_le_bytes()[..unit as usize]);
        }
        Opcode::Lm => {
            let (region, base) = access::with_value(proc, src, |value| {
                memory_pointer(proc, value)
            })?;
            let start = base + u64::from(offset) * unit;
            let memory = proc
                .region(region)
                .ok_or_else(|| fault(tags::INVALID_POINTER, "memory region was freed"))?;
            let start = usize::try_from(start)
                .map_err(|_| fault(tags::OUT_OF_BOUNDS, "load offset overflows"))?;
            let end = start + unit as usize;
            let slot = memory.bytes.get(start..end).ok_or_else(|| {
                fault(tags::OUT_OF_BOUNDS, "load outside of allocated region")
            })?;
            let mut bytes = [0u8; 8];
            bytes[..unit as usize].copy_from_slice(slot);
            access::set_value(proc, out, Value::Uint(u64::from_le_bytes(bytes)))?;
        }
        _ => unreachable!("not a memory opcode: {opcode}"),
    }
    Ok(Outcome::Advance)
}
