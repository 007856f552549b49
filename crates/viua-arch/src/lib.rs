//! Bytecode contract of the Viua virtual machine.
//!
//! This crate defines the parts of the VM that external tools (assemblers,
//! disassemblers, linkers) must agree on: the instruction word layout, the
//! opcode table, and the register-access descriptor. It holds no VM state and
//! performs no I/O; decoding and encoding are pure functions and round-trip
//! for every well-formed word.
//!
//! An instruction is a single little-endian 64-bit word. The low 16 bits are
//! the opcode; the top nibble of the opcode selects one of eight operand
//! formats (N, T, D, S, F, E, R, M) which carve the remaining 48 bits into
//! register-access descriptors and immediates.

pub mod ops;

pub use ops::{Instruction, Opcode, OPCODE_MASK};

/// A single instruction as stored in a module's `.text` section.
pub type InstructionWord = u64;

/// The low 16 bits of an instruction word.
pub type OpcodeWord = u16;

/// Modifier bit: the instruction is part of an indivisible bundle and must not
/// be a preemption point.
pub const GREEDY: OpcodeWord = 0x8000;

/// Modifier bit: selects the unsigned variant of an opcode (e.g. `addiu`).
pub const UNSIGNED: OpcodeWord = 0x0800;

/// Errors produced while decoding instruction words or access descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The opcode is not in the opcode table.
    InvalidOpcode(OpcodeWord),
    /// A register-access descriptor has an invalid set tag or a non-canonical
    /// void encoding.
    InvalidOperand(u16),
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DecodeError::InvalidOpcode(op) => write!(f, "invalid opcode: {op:#06x}"),
            DecodeError::InvalidOperand(raw) => {
                write!(f, "invalid register access: {raw:#06x}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// The register set a descriptor addresses.
///
/// `Void` is the sink/source-of-nothing pseudo-set: writes are discarded and
/// reads produce a void value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessSet {
    Void = 0,
    Local = 1,
    Argument = 2,
    Parameter = 3,
    Static = 4,
    Global = 5,
    ClosureLocal = 6,
}

impl AccessSet {
    fn from_tag(tag: u16) -> Option<AccessSet> {
        match tag {
            0 => Some(AccessSet::Void),
            1 => Some(AccessSet::Local),
            2 => Some(AccessSet::Argument),
            3 => Some(AccessSet::Parameter),
            4 => Some(AccessSet::Static),
            5 => Some(AccessSet::Global),
            6 => Some(AccessSet::ClosureLocal),
            _ => None,
        }
    }
}

impl core::fmt::Display for AccessSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            AccessSet::Void => "void",
            AccessSet::Local => "l",
            AccessSet::Argument => "a",
            AccessSet::Parameter => "p",
            AccessSet::Static => "s",
            AccessSet::Global => "g",
            AccessSet::ClosureLocal => "c",
        };
        f.write_str(name)
    }
}

/// A register-access descriptor: which register an operand names, and how it
/// is reached.
///
/// The encoded form uses the low 12 bits of a 16-bit slot: index in bits 0-7,
/// set tag in bits 8-10, dereference bit in bit 11. The top nibble is left
/// free for the R and M formats, which pack immediate nibbles there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterAccess {
    pub set: AccessSet,
    /// Access goes through the pointer held in the register instead of the
    /// register itself.
    pub deref: bool,
    pub index: u8,
}

impl RegisterAccess {
    pub const fn new(set: AccessSet, deref: bool, index: u8) -> RegisterAccess {
        RegisterAccess { set, deref, index }
    }

    /// A direct access to a local register.
    pub const fn local(index: u8) -> RegisterAccess {
        RegisterAccess::new(AccessSet::Local, false, index)
    }

    /// The void sink.
    pub const fn void() -> RegisterAccess {
        RegisterAccess::new(AccessSet::Void, false, 0)
    }

    pub fn is_void(self) -> bool {
        self.set == AccessSet::Void
    }

    /// Decode from the low 12 bits of a 16-bit slot.
    ///
    /// The canonical void encoding is all-zero; a void access with a nonzero
    /// index or the dereference bit set does not round-trip and is rejected.
    pub fn decode(raw: u16) -> Result<RegisterAccess, DecodeError> {
        let index = (raw & 0x00ff) as u8;
        let tag = (raw & 0x0700) >> 8;
        let deref = (raw & 0x0800) != 0;

        let set = AccessSet::from_tag(tag).ok_or(DecodeError::InvalidOperand(raw))?;
        if set == AccessSet::Void && (index != 0 || deref) {
            return Err(DecodeError::InvalidOperand(raw));
        }

        Ok(RegisterAccess { set, deref, index })
    }

    pub fn encode(self) -> u16 {
        let set = (self.set as u16) << 8;
        let deref = if self.deref { 0x0800 } else { 0 };
        set | deref | u16::from(self.index)
    }
}

impl core::fmt::Display for RegisterAccess {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_void() {
            return f.write_str("void");
        }
        let sigil = if self.deref { '*' } else { '%' };
        write!(f, "{}{}.{}", sigil, self.index, self.set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_access_round_trips() {
        let access = RegisterAccess::new(AccessSet::Argument, true, 17);
        let decoded = RegisterAccess::decode(access.encode()).unwrap();
        assert_eq!(access, decoded);
    }

    #[test]
    fn void_access_is_all_zero() {
        assert_eq!(RegisterAccess::void().encode(), 0);
        assert_eq!(RegisterAccess::decode(0).unwrap(), RegisterAccess::void());
    }

    #[test]
    fn non_canonical_void_is_rejected() {
        // Void set with a nonzero index.
        assert_eq!(
            RegisterAccess::decode(0x0001),
            Err(DecodeError::InvalidOperand(0x0001)),
        );
        // Void set with the dereference bit.
        assert_eq!(
            RegisterAccess::decode(0x0800),
            Err(DecodeError::InvalidOperand(0x0800)),
        );
    }

    #[test]
    fn set_tag_seven_is_rejected() {
        assert!(RegisterAccess::decode(0x0700).is_err());
    }

    #[test]
    fn every_set_survives_a_round_trip() {
        for tag in 1..=6u16 {
            let raw = (tag << 8) | 0x42;
            let access = RegisterAccess::decode(raw).unwrap();
            assert_eq!(access.encode(), raw);
        }
    }
}
