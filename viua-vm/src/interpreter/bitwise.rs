//! Bit-string instructions.
//!
//! Shifts, rotations, and the three overflow families (wrapping, checked,
//! saturating) operate on bit-string values and preserve the width of the
//! left operand. The plain comparison opcodes read the bits as unsigned; the
//! arithmetic variants (BITA*) read them as two's-complement signed.

use std::cmp::Ordering;

use viua_arch::ops::Opcode;
use viua_arch::RegisterAccess;

use super::{access, count_of, Outcome};
use crate::bits::{Bits, CheckedResult};
use crate::process::Process;
use crate::value::{fault, tags, Boxed, Value};

fn bits_of(value: &Value) -> Result<Bits, Value> {
    match value.boxed() {
        Some(Boxed::Bits(bits)) => Ok(bits.clone()),
        _ => Err(fault(
            tags::TYPE_ERROR,
            format!("wanted Bits, got {}", value.type_name()),
        )),
    }
}

fn checked(result: (Bits, CheckedResult)) -> Result<Bits, Value> {
    match result {
        (bits, CheckedResult::Ok) => Ok(bits),
        (_, CheckedResult::Overflow) => Err(fault(
            tags::OVERFLOW,
            "checked arithmetic overflowed",
        )),
    }
}

fn ordering_result(opcode: Opcode, order: Ordering) -> Value {
    let truth = match opcode {
        Opcode::Bitseq | Opcode::Bitaeq => order == Ordering::Equal,
        Opcode::Bitslt | Opcode::Bitalt => order == Ordering::Less,
        Opcode::Bitsgt | Opcode::Bitagt => order == Ordering::Greater,
        _ => unreachable!("not a bits comparison: {opcode}"),
    };
    Value::Int(i64::from(truth))
}

pub(crate) fn ex_bits_triple(
    proc: &mut Process,
    opcode: Opcode,
    out: RegisterAccess,
    lhs: RegisterAccess,
    rhs: RegisterAccess,
) -> Result<Outcome, Value> {
    use Opcode::*;

    // BITSET mutates its target in place and has a different operand shape:
    // out is the bit-string, lhs the index, rhs the new bit.
    if opcode == Bitset {
        let index = access::with_value(proc, lhs, |value| count_of(value))?;
        let bit = access::with_value(proc, rhs, |value| Ok(value.boolean()))?;
        return access::update_value(proc, out, |value| match value.boxed_mut() {
            Some(Boxed::Bits(bits)) => {
                if !bits.set(index, bit) {
                    return Err(fault(
                        tags::OUT_OF_BOUNDS,
                        format!("bit {index} out of range for width {}", bits.width()),
                    ));
                }
                Ok(Outcome::Advance)
            }
            _ => Err(fault(tags::TYPE_ERROR, "bitset target is not Bits")),
        });
    }

    let a = access::with_value(proc, lhs, |value| bits_of(value))?;

    let result = match opcode {
        Bitshl | Bitshr | Bitashr | Bitrol | Bitror => {
            let by = access::with_value(proc, rhs, |value| count_of(value))?;
            let shifted = match opcode {
                Bitshl => a.shl(by),
                Bitshr => a.shr(by),
                Bitashr => a.ashr(by),
                Bitrol => a.rol(by),
                Bitror => a.ror(by),
                _ => unreachable!(),
            };
            Value::bits(shifted)
        }
        Bitat => {
            let index = access::with_value(proc, rhs, |value| count_of(value))?;
            let bit = a.at(index).ok_or_else(|| {
                fault(
                    tags::OUT_OF_BOUNDS,
                    format!("bit {index} out of range for width {}", a.width()),
                )
            })?;
            Value::Int(i64::from(bit))
        }
        _ => {
            let b = access::with_value(proc, rhs, |value| bits_of(value))?;
            match opcode {
                Bitand => Value::bits(a.and(&b)),
                Bitor => Value::bits(a.or(&b)),
                Bitxor => Value::bits(a.xor(&b)),
                Wrapadd => Value::bits(a.wrapadd(&b)),
                Wrapsub => Value::bits(a.wrapsub(&b)),
                Wrapmul => Value::bits(a.wrapmul(&b)),
                Checkedsadd => Value::bits(checked(a.checked_add_signed(&b))?),
                Checkedssub => Value::bits(checked(a.checked_sub_signed(&b))?),
                Checkedsmul => Value::bits(checked(a.checked_mul_signed(&b))?),
                Saturatingsadd => Value::bits(a.saturating_add_signed(&b)),
                Saturatingssub => Value::bits(a.saturating_sub_signed(&b)),
                Saturatingsmul => Value::bits(a.saturating_mul_signed(&b)),
                Bitseq | Bitslt | Bitsgt => ordering_result(opcode, a.cmp_unsigned(&b)),
                Bitaeq | Bitalt | Bitagt => ordering_result(opcode, a.cmp_signed(&b)),
                _ => unreachable!("not a bits opcode: {opcode}"),
            }
        }
    };

    access::set_value(proc, out, result)?;
    Ok(Outcome::Advance)
}

pub(crate) fn ex_bitnot(
    proc: &mut Process,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    let bits = access::with_value(proc, src, |value| bits_of(value))?;
    access::set_value(proc, out, Value::bits(bits.not()))?;
    Ok(Outcome::Advance)
}

/// BITS: a zero-filled bit-string of the width given by the source operand.
pub(crate) fn ex_bits(
    proc: &mut Process,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    let width = access::with_value(proc, src, |value| count_of(value))?;
    access::set_value(proc, out, Value::bits(Bits::zero(width)))?;
    Ok(Outcome::Advance)
}

pub(crate) fn ex_bitswidth(
    proc: &mut Process,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    let width = access::with_value(proc, src, |value| Ok(bits_of(value)?.width()))?;
    access::set_value(proc, out, Value::Uint(width as u64))?;
    Ok(Outcome::Advance)
}
