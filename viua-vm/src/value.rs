//! The value model: tagged cells held in registers.
//!
//! A value is either void, one of four unboxed numeric kinds, or a boxed
//! object. Boxed objects are exclusively owned by the register that holds
//! them; moving a value empties the source register and copying duplicates
//! the whole object graph. Pointers are the only aliasing mechanism and are
//! weak: they never extend the lifetime of their target.

use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spinning_top::Spinlock;

use crate::bits::Bits;
use crate::pid::Pid;
use crate::registers::RegisterSet;

/// Exception tags used by runtime faults. Handlers match on these by name.
pub mod tags {
    pub const INVALID_OPCODE: &str = "Invalid_opcode";
    pub const INVALID_OPERAND: &str = "Invalid_operand";
    pub const OUT_OF_BOUNDS: &str = "Out_of_bounds";
    pub const TYPE_ERROR: &str = "Type_error";
    pub const ARITHMETIC_ERROR: &str = "ArithmeticError";
    pub const OVERFLOW: &str = "Overflow";
    pub const VALUE_OUT_OF_RANGE: &str = "ValueOutOfRange";
    pub const INVALID_POINTER: &str = "InvalidPointer";
    pub const PROCESS_CANNOT_BE_JOINED: &str = "Process_cannot_be_joined";
    pub const INVALID_PID: &str = "InvalidPid";
    pub const IO_CANCEL: &str = "IO_cancel";
    pub const IO_ERROR: &str = "IO_error";
    pub const NOT_COPYABLE: &str = "Not_copyable";
    pub const STACK_OVERFLOW: &str = "Stack_overflow";
    pub const MAILBOX_EMPTY_WITH_TIMEOUT: &str = "Mailbox_empty_with_timeout";
}

/// An interned symbol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Atom(Arc<str>);

impl Atom {
    pub fn new(name: &str) -> Atom {
        Atom(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Atom {
    fn from(name: &str) -> Atom {
        Atom::new(name)
    }
}

/// An address into a loaded module's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr {
    pub module: u32,
    pub offset: u64,
}

impl Addr {
    pub fn new(module: u32, offset: u64) -> Addr {
        Addr { module, offset }
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}+{:#x}]", self.module, self.offset)
    }
}

/// A first-class reference to a bytecode function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionValue {
    pub entry: Addr,
}

/// A function together with a set of captured registers. The captures become
/// the callee's closure-local register set; the set is shared with every
/// frame created from this closure, which is why it sits behind a lock.
#[derive(Debug)]
pub struct ClosureValue {
    pub entry: Addr,
    pub captures: Arc<Spinlock<RegisterSet>>,
}

/// A weak, revocable reference to a value.
///
/// The token is owned by the source (a register slot or a memory region) and
/// is flipped off when the source is erased; dereferencing through a dead
/// token fails with `InvalidPointer`.
#[derive(Debug, Clone)]
pub enum PointerValue {
    Register {
        pid: Pid,
        /// Id of the register set holding the target (see
        /// [`RegisterSet::set_id`]).
        set_id: u64,
        index: u8,
        token: Arc<AtomicBool>,
    },
    Memory {
        pid: Pid,
        region: u64,
        offset: u64,
        token: Arc<AtomicBool>,
    },
}

impl PointerValue {
    pub fn live(&self) -> bool {
        let token = match self {
            PointerValue::Register { token, .. } => token,
            PointerValue::Memory { token, .. } => token,
        };
        token.load(Ordering::Acquire)
    }

    pub fn creator(&self) -> Pid {
        match self {
            PointerValue::Register { pid, .. } => *pid,
            PointerValue::Memory { pid, .. } => *pid,
        }
    }
}

impl PartialEq for PointerValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                PointerValue::Register {
                    pid: a,
                    set_id: s,
                    index: i,
                    ..
                },
                PointerValue::Register {
                    pid: b,
                    set_id: t,
                    index: j,
                    ..
                },
            ) => a == b && s == t && i == j,
            (
                PointerValue::Memory {
                    pid: a,
                    region: r,
                    offset: o,
                    ..
                },
                PointerValue::Memory {
                    pid: b,
                    region: s,
                    offset: p,
                    ..
                },
            ) => a == b && r == s && o == p,
            _ => false,
        }
    }
}

/// A file descriptor held as a value. Owned descriptors close on drop;
/// borrowed ones never touch the underlying fd.
#[derive(Debug)]
pub struct IoFd {
    raw: RawFd,
    owned: Option<OwnedFd>,
}

impl IoFd {
    pub fn owned(fd: OwnedFd) -> IoFd {
        IoFd {
            raw: fd.as_raw_fd(),
            owned: Some(fd),
        }
    }

    pub fn borrowed(raw: RawFd) -> IoFd {
        IoFd { raw, owned: None }
    }

    pub fn raw(&self) -> RawFd {
        self.raw
    }

    pub fn is_owned(&self) -> bool {
        self.owned.is_some()
    }

    /// Give up ownership of the descriptor, e.g. to close it explicitly.
    pub fn release(&mut self) -> Option<OwnedFd> {
        self.owned.take()
    }
}

/// A handle to a submitted, not-yet-consumed I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IoRequestId {
    pub fd: RawFd,
    pub counter: u64,
}

impl std::fmt::Display for IoRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.fd, self.counter)
    }
}

/// An exception: a tag, the flattened ancestor chain of that tag, and an
/// optional payload.
#[derive(Debug)]
pub struct ExceptionValue {
    pub tag: Atom,
    pub chain: Vec<Atom>,
    pub payload: Box<Value>,
}

impl ExceptionValue {
    /// Whether this exception is caught by a handler for `tag`.
    pub fn matches(&self, tag: &Atom) -> bool {
        self.tag == *tag || self.chain.contains(tag)
    }
}

/// The boxed, heap-allocated value kinds.
#[derive(Debug)]
pub enum Boxed {
    String(String),
    Atom(Atom),
    Bits(Bits),
    Buffer(Vec<Value>),
    Struct(BTreeMap<Atom, Value>),
    Function(FunctionValue),
    Closure(ClosureValue),
    Pointer(PointerValue),
    Pid(Pid),
    IoFd(IoFd),
    IoRequest(IoRequestId),
    Exception(ExceptionValue),
}

/// A single value cell.
#[derive(Debug, Default)]
pub enum Value {
    #[default]
    Void,
    Int(i64),
    Uint(u64),
    Float(f32),
    Double(f64),
    Boxed(Box<Boxed>),
}

/// Build an exception value for a runtime fault.
pub fn fault(tag: &str, message: impl Into<String>) -> Value {
    Value::exception(Atom::new(tag), Vec::new(), Value::string(message.into()))
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value::Boxed(Box::new(Boxed::String(s.into())))
    }

    pub fn atom(a: impl Into<Atom>) -> Value {
        Value::Boxed(Box::new(Boxed::Atom(a.into())))
    }

    pub fn bits(b: Bits) -> Value {
        Value::Boxed(Box::new(Boxed::Bits(b)))
    }

    pub fn buffer(items: Vec<Value>) -> Value {
        Value::Boxed(Box::new(Boxed::Buffer(items)))
    }

    pub fn struct_of(fields: BTreeMap<Atom, Value>) -> Value {
        Value::Boxed(Box::new(Boxed::Struct(fields)))
    }

    pub fn function(entry: Addr) -> Value {
        Value::Boxed(Box::new(Boxed::Function(FunctionValue { entry })))
    }

    pub fn closure(entry: Addr, captures: RegisterSet) -> Value {
        Value::Boxed(Box::new(Boxed::Closure(ClosureValue {
            entry,
            captures: Arc::new(Spinlock::new(captures)),
        })))
    }

    pub fn pointer(p: PointerValue) -> Value {
        Value::Boxed(Box::new(Boxed::Pointer(p)))
    }

    pub fn pid(pid: Pid) -> Value {
        Value::Boxed(Box::new(Boxed::Pid(pid)))
    }

    pub fn io_fd(fd: IoFd) -> Value {
        Value::Boxed(Box::new(Boxed::IoFd(fd)))
    }

    pub fn io_request(id: IoRequestId) -> Value {
        Value::Boxed(Box::new(Boxed::IoRequest(id)))
    }

    pub fn exception(tag: Atom, chain: Vec<Atom>, payload: Value) -> Value {
        Value::Boxed(Box::new(Boxed::Exception(ExceptionValue {
            tag,
            chain,
            payload: Box::new(payload),
        })))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub fn boxed(&self) -> Option<&Boxed> {
        match self {
            Value::Boxed(b) => Some(b),
            _ => None,
        }
    }

    pub fn boxed_mut(&mut self) -> Option<&mut Boxed> {
        match self {
            Value::Boxed(b) => Some(b),
            _ => None,
        }
    }

    /// Stable short type name used in diagnostics and `Type_error` messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "Void",
            Value::Int(_) => "Integer",
            Value::Uint(_) => "Unsigned_integer",
            Value::Float(_) => "Float",
            Value::Double(_) => "Double",
            Value::Boxed(b) => match **b {
                Boxed::String(_) => "String",
                Boxed::Atom(_) => "Atom",
                Boxed::Bits(_) => "Bits",
                Boxed::Buffer(_) => "Vector",
                Boxed::Struct(_) => "Struct",
                Boxed::Function(_) => "Function",
                Boxed::Closure(_) => "Closure",
                Boxed::Pointer(_) => "Pointer",
                Boxed::Pid(_) => "Pid",
                Boxed::IoFd(_) => "IO_fd",
                Boxed::IoRequest(_) => "IO_request",
                Boxed::Exception(_) => "Exception",
            },
        }
    }

    /// Truthiness: zero numbers, empty strings, and empty containers are
    /// false; pointers, PIDs, functions, and I/O handles are true.
    pub fn boolean(&self) -> bool {
        match self {
            Value::Void => false,
            Value::Int(n) => *n != 0,
            Value::Uint(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::Double(n) => *n != 0.0,
            Value::Boxed(b) => match &**b {
                Boxed::String(s) => !s.is_empty(),
                Boxed::Atom(_) => true,
                Boxed::Bits(bits) => bits.width() > 0,
                Boxed::Buffer(items) => !items.is_empty(),
                Boxed::Struct(fields) => !fields.is_empty(),
                Boxed::Function(_) | Boxed::Closure(_) => true,
                Boxed::Pointer(_) | Boxed::Pid(_) => true,
                Boxed::IoFd(_) | Boxed::IoRequest(_) => true,
                Boxed::Exception(_) => true,
            },
        }
    }

    /// Deep copy. Scalars and containers are duplicated; pointers, I/O
    /// values, and closures with live captures are not copyable.
    pub fn copy(&self) -> Result<Value, Value> {
        let not_copyable =
            || Err(fault(tags::NOT_COPYABLE, format!("cannot copy {}", self.type_name())));
        match self {
            Value::Void => Ok(Value::Void),
            Value::Int(n) => Ok(Value::Int(*n)),
            Value::Uint(n) => Ok(Value::Uint(*n)),
            Value::Float(n) => Ok(Value::Float(*n)),
            Value::Double(n) => Ok(Value::Double(*n)),
            Value::Boxed(b) => match &**b {
                Boxed::String(s) => Ok(Value::string(s.clone())),
                Boxed::Atom(a) => Ok(Value::atom(a.clone())),
                Boxed::Bits(bits) => Ok(Value::bits(bits.clone())),
                Boxed::Buffer(items) => {
                    let copies = items.iter().map(Value::copy).collect::<Result<_, _>>()?;
                    Ok(Value::buffer(copies))
                }
                Boxed::Struct(fields) => {
                    let mut copies = BTreeMap::new();
                    for (key, value) in fields {
                        copies.insert(key.clone(), value.copy()?);
                    }
                    Ok(Value::struct_of(copies))
                }
                Boxed::Function(function) => Ok(Value::function(function.entry)),
                Boxed::Closure(_) => not_copyable(),
                Boxed::Pointer(_) => not_copyable(),
                Boxed::Pid(pid) => Ok(Value::pid(*pid)),
                Boxed::IoFd(_) | Boxed::IoRequest(_) => not_copyable(),
                Boxed::Exception(e) => Ok(Value::exception(
                    e.tag.clone(),
                    e.chain.clone(),
                    e.payload.copy()?,
                )),
            },
        }
    }

    /// Structural equality. Pointers compare by target, I/O handles by
    /// descriptor.
    pub fn deep_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Uint(a), Value::Uint(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Boxed(a), Value::Boxed(b)) => match (&**a, &**b) {
                (Boxed::String(x), Boxed::String(y)) => x == y,
                (Boxed::Atom(x), Boxed::Atom(y)) => x == y,
                (Boxed::Bits(x), Boxed::Bits(y)) => x == y,
                (Boxed::Buffer(x), Boxed::Buffer(y)) => {
                    x.len() == y.len() && x.iter().zip(y).all(|(a, b)| a.deep_eq(b))
                }
                (Boxed::Struct(x), Boxed::Struct(y)) => {
                    x.len() == y.len()
                        && x.iter()
                            .zip(y)
                            .all(|((ka, va), (kb, vb))| ka == kb && va.deep_eq(vb))
                }
                (Boxed::Function(x), Boxed::Function(y)) => x == y,
                (Boxed::Pointer(x), Boxed::Pointer(y)) => x == y,
                (Boxed::Pid(x), Boxed::Pid(y)) => x == y,
                (Boxed::IoFd(x), Boxed::IoFd(y)) => x.raw() == y.raw(),
                (Boxed::IoRequest(x), Boxed::IoRequest(y)) => x == y,
                (Boxed::Exception(x), Boxed::Exception(y)) => {
                    x.tag == y.tag && x.payload.deep_eq(&y.payload)
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Cast to a signed integer. Out-of-range floats and unparsable strings
    /// fail with `ValueOutOfRange`; other types with `Type_error`.
    pub fn cast_to_int(&self) -> Result<Value, Value> {
        match self {
            Value::Int(n) => Ok(Value::Int(*n)),
            Value::Uint(n) if *n <= i64::MAX as u64 => Ok(Value::Int(*n as i64)),
            Value::Uint(_) => Err(fault(
                tags::VALUE_OUT_OF_RANGE,
                "unsigned integer does not fit a signed integer",
            )),
            Value::Float(n) => float_to_int(f64::from(*n)),
            Value::Double(n) => float_to_int(*n),
            Value::Boxed(b) => match &**b {
                Boxed::String(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    fault(tags::VALUE_OUT_OF_RANGE, format!("not an integer: {s:?}"))
                }),
                _ => Err(self.type_fault("Integer")),
            },
            Value::Void => Err(self.type_fault("Integer")),
        }
    }

    pub fn cast_to_uint(&self) -> Result<Value, Value> {
        match self {
            Value::Uint(n) => Ok(Value::Uint(*n)),
            Value::Int(n) if *n >= 0 => Ok(Value::Uint(*n as u64)),
            Value::Int(_) => Err(fault(
                tags::VALUE_OUT_OF_RANGE,
                "negative integer does not fit an unsigned integer",
            )),
            Value::Float(n) => float_to_uint(f64::from(*n)),
            Value::Double(n) => float_to_uint(*n),
            Value::Boxed(b) => match &**b {
                Boxed::String(s) => s.trim().parse::<u64>().map(Value::Uint).map_err(|_| {
                    fault(tags::VALUE_OUT_OF_RANGE, format!("not an unsigned integer: {s:?}"))
                }),
                _ => Err(self.type_fault("Unsigned_integer")),
            },
            Value::Void => Err(self.type_fault("Unsigned_integer")),
        }
    }

    pub fn cast_to_float(&self) -> Result<Value, Value> {
        match self {
            Value::Int(n) => Ok(Value::Float(*n as f32)),
            Value::Uint(n) => Ok(Value::Float(*n as f32)),
            Value::Float(n) => Ok(Value::Float(*n)),
            Value::Double(n) => Ok(Value::Float(*n as f32)),
            Value::Boxed(b) => match &**b {
                Boxed::String(s) => s.trim().parse::<f32>().map(Value::Float).map_err(|_| {
                    fault(tags::VALUE_OUT_OF_RANGE, format!("not a float: {s:?}"))
                }),
                _ => Err(self.type_fault("Float")),
            },
            Value::Void => Err(self.type_fault("Float")),
        }
    }

    pub fn cast_to_double(&self) -> Result<Value, Value> {
        match self {
            Value::Int(n) => Ok(Value::Double(*n as f64)),
            Value::Uint(n) => Ok(Value::Double(*n as f64)),
            Value::Float(n) => Ok(Value::Double(f64::from(*n))),
            Value::Double(n) => Ok(Value::Double(*n)),
            Value::Boxed(b) => match &**b {
                Boxed::String(s) => s.trim().parse::<f64>().map(Value::Double).map_err(|_| {
                    fault(tags::VALUE_OUT_OF_RANGE, format!("not a double: {s:?}"))
                }),
                _ => Err(self.type_fault("Double")),
            },
            Value::Void => Err(self.type_fault("Double")),
        }
    }

    pub fn cast_to_string(&self) -> Result<Value, Value> {
        Ok(Value::string(self.to_string()))
    }

    fn type_fault(&self, wanted: &str) -> Value {
        fault(
            tags::TYPE_ERROR,
            format!("cannot make {wanted} out of {}", self.type_name()),
        )
    }
}

fn float_to_int(value: f64) -> Result<Value, Value> {
    if value.is_finite() && value >= i64::MIN as f64 && value <= i64::MAX as f64 {
        Ok(Value::Int(value as i64))
    } else {
        Err(fault(tags::VALUE_OUT_OF_RANGE, format!("{value} does not fit an integer")))
    }
}

fn float_to_uint(value: f64) -> Result<Value, Value> {
    if value.is_finite() && value >= 0.0 && value <= u64::MAX as f64 {
        Ok(Value::Uint(value as u64))
    } else {
        Err(fault(
            tags::VALUE_OUT_OF_RANGE,
            format!("{value} does not fit an unsigned integer"),
        ))
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Void => f.write_str("void"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Uint(n) => write!(f, "{n}u"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Double(n) => write!(f, "{n}"),
            Value::Boxed(b) => match &**b {
                Boxed::String(s) => write!(f, "{s}"),
                Boxed::Atom(a) => write!(f, "{a}"),
                Boxed::Bits(bits) => write!(f, "{bits}"),
                Boxed::Buffer(items) => {
                    f.write_str("[")?;
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{item}")?;
                    }
                    f.write_str("]")
                }
                Boxed::Struct(fields) => {
                    f.write_str("{")?;
                    for (i, (key, value)) in fields.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{key}: {value}")?;
                    }
                    f.write_str("}")
                }
                Boxed::Function(function) => write!(f, "fn {}", function.entry),
                Boxed::Closure(closure) => write!(f, "closure {}", closure.entry),
                Boxed::Pointer(pointer) => {
                    if pointer.live() {
                        f.write_str("pointer")
                    } else {
                        f.write_str("pointer (expired)")
                    }
                }
                Boxed::Pid(pid) => write!(f, "{pid}"),
                Boxed::IoFd(io_fd) => write!(f, "io_fd {}", io_fd.raw()),
                Boxed::IoRequest(id) => write!(f, "io_request {id}"),
                Boxed::Exception(e) => write!(f, "{}: {}", e.tag, e.payload),
            },
        }
    }
}
