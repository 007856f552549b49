//! Arithmetic, comparison, and boolean logic.
//!
//! Binary arithmetic takes its result type from the left operand and
//! converts the right operand to match. Plain integer arithmetic wraps
//! silently; only division and modulo by zero fault (`ArithmeticError`). The
//! checked and saturating families live with the bit-string operations.

use std::cmp::Ordering;

use viua_arch::ops::Opcode;
use viua_arch::RegisterAccess;

use super::{access, Outcome};
use crate::process::Process;
use crate::value::{fault, tags, Boxed, Value};

/// An unboxed numeric operand.
#[derive(Clone, Copy)]
enum Num {
    I(i64),
    U(u64),
    F(f32),
    D(f64),
}

fn num_of(value: &Value) -> Result<Num, Value> {
    match value {
        Value::Int(n) => Ok(Num::I(*n)),
        Value::Uint(n) => Ok(Num::U(*n)),
        Value::Float(n) => Ok(Num::F(*n)),
        Value::Double(n) => Ok(Num::D(*n)),
        other => Err(fault(
            tags::TYPE_ERROR,
            format!("{} is not a number", other.type_name()),
        )),
    }
}

fn as_i64(n: Num) -> i64 {
    match n {
        Num::I(v) => v,
        Num::U(v) => v as i64,
        Num::F(v) => v as i64,
        Num::D(v) => v as i64,
    }
}

fn as_u64(n: Num) -> u64 {
    match n {
        Num::I(v) => v as u64,
        Num::U(v) => v,
        Num::F(v) => v as u64,
        Num::D(v) => v as u64,
    }
}

fn as_f32(n: Num) -> f32 {
    match n {
        Num::I(v) => v as f32,
        Num::U(v) => v as f32,
        Num::F(v) => v,
        Num::D(v) => v as f32,
    }
}

fn as_f64(n: Num) -> f64 {
    match n {
        Num::I(v) => v as f64,
        Num::U(v) => v as f64,
        Num::F(v) => f64::from(v),
        Num::D(v) => v,
    }
}

fn int_binop(opcode: Opcode, a: i64, b: i64) -> Result<i64, Value> {
    Ok(match opcode {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::Div => {
            if b == 0 {
                return Err(division_by_zero());
            }
            a.wrapping_div(b)
        }
        Opcode::Mod => {
            if b == 0 {
                return Err(division_by_zero());
            }
            a.wrapping_rem(b)
        }
        _ => unreachable!("not an arithmetic opcode: {opcode}"),
    })
}

fn uint_binop(opcode: Opcode, a: u64, b: u64) -> Result<u64, Value> {
    Ok(match opcode {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::Div => {
            if b == 0 {
                return Err(division_by_zero());
            }
            a / b
        }
        Opcode::Mod => {
            if b == 0 {
                return Err(division_by_zero());
            }
            a % b
        }
        _ => unreachable!("not an arithmetic opcode: {opcode}"),
    })
}

fn float_binop(opcode: Opcode, a: f64, b: f64) -> f64 {
    match opcode {
        Opcode::Add => a + b,
        Opcode::Sub => a - b,
        Opcode::Mul => a * b,
        Opcode::Div => a / b,
        Opcode::Mod => a % b,
        _ => unreachable!("not an arithmetic opcode: {opcode}"),
    }
}

fn division_by_zero() -> Value {
    fault(tags::ARITHMETIC_ERROR, "division by zero")
}

pub(crate) fn ex_binop(
    proc: &mut Process,
    opcode: Opcode,
    out: RegisterAccess,
    lhs: RegisterAccess,
    rhs: RegisterAccess,
) -> Result<Outcome, Value> {
    let a = access::with_value(proc, lhs, |value| num_of(value))?;
    let b = access::with_value(proc, rhs, |value| num_of(value))?;

    let result = match a {
        Num::I(a) => Value::Int(int_binop(opcode, a, as_i64(b))?),
        Num::U(a) => Value::Uint(uint_binop(opcode, a, as_u64(b))?),
        Num::F(a) => Value::Float(float_binop(opcode, f64::from(a), f64::from(as_f32(b))) as f32),
        Num::D(a) => Value::Double(float_binop(opcode, a, as_f64(b))),
    };
    access::set_value(proc, out, result)?;
    Ok(Outcome::Advance)
}

/// Total order used by LT/GT/CMP: numbers compare numerically, strings and
/// atoms lexicographically.
fn order_of(a: &Value, b: &Value) -> Result<Ordering, Value> {
    if let (Ok(x), Ok(y)) = (num_of(a), num_of(b)) {
        // Integer pairs compare exactly; anything involving a float goes
        // through f64.
        return match (x, y) {
            (Num::I(i), Num::I(j)) => Ok(i.cmp(&j)),
            (Num::U(i), Num::U(j)) => Ok(i.cmp(&j)),
            (Num::I(i), Num::U(j)) => Ok(i128::from(i).cmp(&i128::from(j))),
            (Num::U(i), Num::I(j)) => Ok(i128::from(i).cmp(&i128::from(j))),
            _ => as_f64(x)
                .partial_cmp(&as_f64(y))
                .ok_or_else(|| fault(tags::TYPE_ERROR, "NaN is unordered")),
        };
    }

    match (a.boxed(), b.boxed()) {
        (Some(Boxed::String(x)), Some(Boxed::String(y))) => Ok(x.cmp(y)),
        (Some(Boxed::Atom(x)), Some(Boxed::Atom(y))) => Ok(x.cmp(y)),
        _ => Err(fault(
            tags::TYPE_ERROR,
            format!("cannot order {} against {}", a.type_name(), b.type_name()),
        )),
    }
}

pub(crate) fn ex_compare(
    proc: &mut Process,
    opcode: Opcode,
    out: RegisterAccess,
    lhs: RegisterAccess,
    rhs: RegisterAccess,
) -> Result<Outcome, Value> {
    let result = match opcode {
        Opcode::Eq => {
            let eq = access::with_two_values(proc, lhs, rhs, |a, b| Ok(a.deep_eq(b)))?;
            Value::Int(i64::from(eq))
        }
        _ => {
            let order = access::with_two_values(proc, lhs, rhs, |a, b| order_of(a, b))?;
            match opcode {
                Opcode::Lt => Value::Int(i64::from(order == Ordering::Less)),
                Opcode::Gt => Value::Int(i64::from(order == Ordering::Greater)),
                Opcode::Cmp => Value::Int(match order {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                }),
                _ => unreachable!("not a comparison opcode: {opcode}"),
            }
        }
    };
    access::set_value(proc, out, result)?;
    Ok(Outcome::Advance)
}

pub(crate) fn ex_logic(
    proc: &mut Process,
    opcode: Opcode,
    out: RegisterAccess,
    lhs: RegisterAccess,
    rhs: RegisterAccess,
) -> Result<Outcome, Value> {
    let a = access::with_value(proc, lhs, |value| Ok(value.boolean()))?;
    let b = access::with_value(proc, rhs, |value| Ok(value.boolean()))?;
    let result = match opcode {
        Opcode::And => a && b,
        Opcode::Or => a || b,
        _ => unreachable!("not a logic opcode: {opcode}"),
    };
    access::set_value(proc, out, Value::Int(i64::from(result)))?;
    Ok(Outcome::Advance)
}

pub(crate) fn ex_not(
    proc: &mut Process,
    out: RegisterAccess,
    src: RegisterAccess,
) -> Result<Outcome, Value> {
    let value = access::with_value(proc, src, |value| Ok(value.boolean()))?;
    access::set_value(proc, out, Value::Int(i64::from(!value)))?;
    Ok(Outcome::Advance)
}

/// The ADDI family: `out = src ⊕ immediate`, with a void source reading as
/// zero. These are how the assembler builds small constants.
pub(crate) fn ex_immediate(
    proc: &mut Process,
    opcode: Opcode,
    out: RegisterAccess,
    src: RegisterAccess,
    immediate: u32,
) -> Result<Outcome, Value> {
    let result = if opcode.is_unsigned() {
        let base = access::with_value(proc, src, |value| match value {
            Value::Void => Ok(0),
            other => super::uint_of(other),
        })?;
        let immediate = u64::from(immediate);
        Value::Uint(match opcode {
            Opcode::Addiu => base.wrapping_add(immediate),
            Opcode::Subiu => base.wrapping_sub(immediate),
            Opcode::Muliu => base.wrapping_mul(immediate),
            Opcode::Diviu => {
                if immediate == 0 {
                    return Err(division_by_zero());
                }
                base / immediate
            }
            _ => unreachable!("not an immediate opcode: {opcode}"),
        })
    } else {
        let base = access::with_value(proc, src, |value| match value {
            Value::Void => Ok(0),
            other => super::int_of(other),
        })?;
        let immediate = i64::from(immediate);
        Value::Int(match opcode {
            Opcode::Addi => base.wrapping_add(immediate),
            Opcode::Subi => base.wrapping_sub(immediate),
            Opcode::Muli => base.wrapping_mul(immediate),
            Opcode::Divi => {
                if immediate == 0 {
                    return Err(division_by_zero());
                }
                base.wrapping_div(immediate)
            }
            _ => unreachable!("not an immediate opcode: {opcode}"),
        })
    };
    access::set_value(proc, out, result)?;
    Ok(Outcome::Advance)
}
