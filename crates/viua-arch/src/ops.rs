//! Instruction formats and the opcode table.
//!
//! The top nibble of the 16-bit opcode selects the operand format:
//!
//! | Format | Nibble | Operands |
//! |---|---|---|
//! | N | 0x0 | none |
//! | T | 0x1 | out, lhs, rhs |
//! | D | 0x2 | out, src |
//! | S | 0x3 | out |
//! | F | 0x4 | out, 32-bit immediate |
//! | E | 0x5 | out, 36-bit immediate |
//! | R | 0x6 | out, src, 24-bit immediate |
//! | M | 0x7 | out, src, 16-bit offset, 8-bit unit spec |
//!
//! Bit 15 of the opcode is the GREEDY modifier and bit 11 selects unsigned
//! variants where they exist. `encode(decode(w)) == w` for every word this
//! module accepts.

use crate::{DecodeError, OpcodeWord, RegisterAccess, GREEDY, UNSIGNED};

pub const OPCODE_MASK: OpcodeWord = 0x7fff;
pub const FORMAT_MASK: OpcodeWord = 0x7000;

const FORMAT_N: OpcodeWord = 0x0000;
const FORMAT_T: OpcodeWord = 0x1000;
const FORMAT_D: OpcodeWord = 0x2000;
const FORMAT_S: OpcodeWord = 0x3000;
const FORMAT_F: OpcodeWord = 0x4000;
const FORMAT_E: OpcodeWord = 0x5000;
const FORMAT_R: OpcodeWord = 0x6000;
const FORMAT_M: OpcodeWord = 0x7000;

/// Operand format of an instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    N,
    T,
    D,
    S,
    F,
    E,
    R,
    M,
}

impl Format {
    fn of(word: OpcodeWord) -> Format {
        match word & FORMAT_MASK {
            FORMAT_N => Format::N,
            FORMAT_T => Format::T,
            FORMAT_D => Format::D,
            FORMAT_S => Format::S,
            FORMAT_F => Format::F,
            FORMAT_E => Format::E,
            FORMAT_R => Format::R,
            _ => Format::M,
        }
    }
}

/// Every opcode the VM understands. The discriminant is the canonical opcode
/// word without the GREEDY bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    Noop = FORMAT_N,
    Halt = FORMAT_N | 0x0001,
    Ebreak = FORMAT_N | 0x0002,
    Ecall = FORMAT_N | 0x0003,
    Try = FORMAT_N | 0x0004,
    Leave = FORMAT_N | 0x0005,

    Add = FORMAT_T | 0x0001,
    Sub = FORMAT_T | 0x0002,
    Mul = FORMAT_T | 0x0003,
    Div = FORMAT_T | 0x0004,
    Mod = FORMAT_T | 0x0005,
    Bitshl = FORMAT_T | 0x0006,
    Bitshr = FORMAT_T | 0x0007,
    Bitashr = FORMAT_T | 0x0008,
    Bitrol = FORMAT_T | 0x0009,
    Bitror = FORMAT_T | 0x000a,
    Bitand = FORMAT_T | 0x000b,
    Bitor = FORMAT_T | 0x000c,
    Bitxor = FORMAT_T | 0x000d,
    Eq = FORMAT_T | 0x000e,
    Lt = FORMAT_T | 0x000f,
    Gt = FORMAT_T | 0x0010,
    Cmp = FORMAT_T | 0x0011,
    And = FORMAT_T | 0x0012,
    Or = FORMAT_T | 0x0013,
    BufferAt = FORMAT_T | 0x0014,
    BufferPop = FORMAT_T | 0x0015,
    StructAt = FORMAT_T | 0x0016,
    StructInsert = FORMAT_T | 0x0017,
    StructRemove = FORMAT_T | 0x0018,
    IoSubmit = FORMAT_T | 0x0019,
    IoWait = FORMAT_T | 0x001a,
    IoShutdown = FORMAT_T | 0x001b,
    IoCtl = FORMAT_T | 0x001c,
    Join = FORMAT_T | 0x001d,
    Wrapadd = FORMAT_T | 0x001e,
    Wrapsub = FORMAT_T | 0x001f,
    Wrapmul = FORMAT_T | 0x0020,
    Checkedsadd = FORMAT_T | 0x0021,
    Checkedssub = FORMAT_T | 0x0022,
    Checkedsmul = FORMAT_T | 0x0023,
    Saturatingsadd = FORMAT_T | 0x0024,
    Saturatingssub = FORMAT_T | 0x0025,
    Saturatingsmul = FORMAT_T | 0x0026,
    Bitseq = FORMAT_T | 0x0027,
    Bitslt = FORMAT_T | 0x0028,
    Bitsgt = FORMAT_T | 0x0029,
    Bitaeq = FORMAT_T | 0x002a,
    Bitalt = FORMAT_T | 0x002b,
    Bitagt = FORMAT_T | 0x002c,
    Bitat = FORMAT_T | 0x002d,
    Bitset = FORMAT_T | 0x002e,
    Capture = FORMAT_T | 0x002f,
    Capturemove = FORMAT_T | 0x0030,

    Call = FORMAT_D | 0x0001,
    Bitnot = FORMAT_D | 0x0002,
    Not = FORMAT_D | 0x0003,
    Copy = FORMAT_D | 0x0004,
    Move = FORMAT_D | 0x0005,
    Swap = FORMAT_D | 0x0006,
    BufferPush = FORMAT_D | 0x0007,
    BufferSize = FORMAT_D | 0x0008,
    Ref = FORMAT_D | 0x0009,
    If = FORMAT_D | 0x000a,
    IoPeek = FORMAT_D | 0x000b,
    Actor = FORMAT_D | 0x000c,
    Send = FORMAT_D | 0x000d,
    Receive = FORMAT_D | 0x000e,
    Catch = FORMAT_D | 0x000f,
    Bits = FORMAT_D | 0x0010,
    Bitswidth = FORMAT_D | 0x0011,
    Ptrlive = FORMAT_D | 0x0012,
    Closure = FORMAT_D | 0x0013,

    Frame = FORMAT_S | 0x0001,
    Return = FORMAT_S | 0x0002,
    Atom = FORMAT_S | 0x0003,
    String = FORMAT_S | 0x0004,
    Float = FORMAT_S | 0x0005,
    Double = FORMAT_S | 0x0006,
    Struct = FORMAT_S | 0x0007,
    Buffer = FORMAT_S | 0x0008,
    SelfPid = FORMAT_S | 0x0009,
    Tailcall = FORMAT_S | 0x000a,
    Defer = FORMAT_S | 0x000b,
    Throw = FORMAT_S | 0x000c,
    Draw = FORMAT_S | 0x000d,
    Watchdog = FORMAT_S | 0x000e,
    AllocateRegisters = FORMAT_S | 0x000f,
    Enter = FORMAT_S | 0x0010,

    Lli = FORMAT_F | 0x0001,
    Lliu = FORMAT_F | 0x0001 | UNSIGNED,
    FloatImm = FORMAT_F | 0x0002,

    Lui = FORMAT_E | 0x0001,
    Luiu = FORMAT_E | 0x0001 | UNSIGNED,
    Cast = FORMAT_E | 0x0002,
    Arodp = FORMAT_E | 0x0003,
    Atxtp = FORMAT_E | 0x0004,

    Addi = FORMAT_R | 0x0001,
    Addiu = FORMAT_R | 0x0001 | UNSIGNED,
    Subi = FORMAT_R | 0x0002,
    Subiu = FORMAT_R | 0x0002 | UNSIGNED,
    Muli = FORMAT_R | 0x0003,
    Muliu = FORMAT_R | 0x0003 | UNSIGNED,
    Divi = FORMAT_R | 0x0004,
    Diviu = FORMAT_R | 0x0004 | UNSIGNED,

    Sm = FORMAT_M | 0x0001,
    Lm = FORMAT_M | 0x0002,
    Aa = FORMAT_M | 0x0003,
    Ad = FORMAT_M | 0x0004,
    Ptr = FORMAT_M | 0x0005,
}

impl Opcode {
    /// Look an opcode up by its word, ignoring the GREEDY bit.
    pub fn from_word(word: OpcodeWord) -> Result<Opcode, DecodeError> {
        use Opcode::*;
        let canonical = word & OPCODE_MASK;
        let op = match canonical {
            x if x == Noop as u16 => Noop,
            x if x == Halt as u16 => Halt,
            x if x == Ebreak as u16 => Ebreak,
            x if x == Ecall as u16 => Ecall,
            x if x == Try as u16 => Try,
            x if x == Leave as u16 => Leave,

            x if x == Add as u16 => Add,
            x if x == Sub as u16 => Sub,
            x if x == Mul as u16 => Mul,
            x if x == Div as u16 => Div,
            x if x == Mod as u16 => Mod,
            x if x == Bitshl as u16 => Bitshl,
            x if x == Bitshr as u16 => Bitshr,
            x if x == Bitashr as u16 => Bitashr,
            x if x == Bitrol as u16 => Bitrol,
            x if x == Bitror as u16 => Bitror,
            x if x == Bitand as u16 => Bitand,
            x if x == Bitor as u16 => Bitor,
            x if x == Bitxor as u16 => Bitxor,
            x if x == Eq as u16 => Eq,
            x if x == Lt as u16 => Lt,
            x if x == Gt as u16 => Gt,
            x if x == Cmp as u16 => Cmp,
            x if x == And as u16 => And,
            x if x == Or as u16 => Or,
            x if x == BufferAt as u16 => BufferAt,
            x if x == BufferPop as u16 => BufferPop,
            x if x == StructAt as u16 => StructAt,
            x if x == StructInsert as u16 => StructInsert,
            x if x == StructRemove as u16 => StructRemove,
            x if x == IoSubmit as u16 => IoSubmit,
            x if x == IoWait as u16 => IoWait,
            x if x == IoShutdown as u16 => IoShutdown,
            x if x == IoCtl as u16 => IoCtl,
            x if x == Join as u16 => Join,
            x if x == Wrapadd as u16 => Wrapadd,
            x if x == Wrapsub as u16 => Wrapsub,
            x if x == Wrapmul as u16 => Wrapmul,
            x if x == Checkedsadd as u16 => Checkedsadd,
            x if x == Checkedssub as u16 => Checkedssub,
            x if x == Checkedsmul as u16 => Checkedsmul,
            x if x == Saturatingsadd as u16 => Saturatingsadd,
            x if x == Saturatingssub as u16 => Saturatingssub,
            x if x == Saturatingsmul as u16 => Saturatingsmul,
            x if x == Bitseq as u16 => Bitseq,
            x if x == Bitslt as u16 => Bitslt,
            x if x == Bitsgt as u16 => Bitsgt,
            x if x == Bitaeq as u16 => Bitaeq,
            x if x == Bitalt as u16 => Bitalt,
            x if x == Bitagt as u16 => Bitagt,
            x if x == Bitat as u16 => Bitat,
            x if x == Bitset as u16 => Bitset,
            x if x == Capture as u16 => Capture,
            x if x == Capturemove as u16 => Capturemove,

            x if x == Call as u16 => Call,
            x if x == Bitnot as u16 => Bitnot,
            x if x == Not as u16 => Not,
            x if x == Copy as u16 => Copy,
            x if x == Move as u16 => Move,
            x if x == Swap as u16 => Swap,
            x if x == BufferPush as u16 => BufferPush,
            x if x == BufferSize as u16 => BufferSize,
            x if x == Ref as u16 => Ref,
            x if x == If as u16 => If,
            x if x == IoPeek as u16 => IoPeek,
            x if x == Actor as u16 => Actor,
            x if x == Send as u16 => Send,
            x if x == Receive as u16 => Receive,
            x if x == Catch as u16 => Catch,
            x if x == Bits as u16 => Bits,
            x if x == Bitswidth as u16 => Bitswidth,
            x if x == Ptrlive as u16 => Ptrlive,
            x if x == Closure as u16 => Closure,

            x if x == Frame as u16 => Frame,
            x if x == Return as u16 => Return,
            x if x == Atom as u16 => Atom,
            x if x == String as u16 => String,
            x if x == Float as u16 => Float,
            x if x == Double as u16 => Double,
            x if x == Struct as u16 => Struct,
            x if x == Buffer as u16 => Buffer,
            x if x == SelfPid as u16 => SelfPid,
            x if x == Tailcall as u16 => Tailcall,
            x if x == Defer as u16 => Defer,
            x if x == Throw as u16 => Throw,
            x if x == Draw as u16 => Draw,
            x if x == Watchdog as u16 => Watchdog,
            x if x == AllocateRegisters as u16 => AllocateRegisters,
            x if x == Enter as u16 => Enter,

            x if x == Lli as u16 => Lli,
            x if x == Lliu as u16 => Lliu,
            x if x == FloatImm as u16 => FloatImm,

            x if x == Lui as u16 => Lui,
            x if x == Luiu as u16 => Luiu,
            x if x == Cast as u16 => Cast,
            x if x == Arodp as u16 => Arodp,
            x if x == Atxtp as u16 => Atxtp,

            x if x == Addi as u16 => Addi,
            x if x == Addiu as u16 => Addiu,
            x if x == Subi as u16 => Subi,
            x if x == Subiu as u16 => Subiu,
            x if x == Muli as u16 => Muli,
            x if x == Muliu as u16 => Muliu,
            x if x == Divi as u16 => Divi,
            x if x == Diviu as u16 => Diviu,

            x if x == Sm as u16 => Sm,
            x if x == Lm as u16 => Lm,
            x if x == Aa as u16 => Aa,
            x if x == Ad as u16 => Ad,
            x if x == Ptr as u16 => Ptr,

            _ => return Err(DecodeError::InvalidOpcode(word)),
        };
        Ok(op)
    }

    pub fn format(self) -> Format {
        Format::of(self as u16)
    }

    /// Whether this opcode reads immediates as unsigned (bit 11 set).
    pub fn is_unsigned(self) -> bool {
        (self as u16) & UNSIGNED != 0
    }

    /// The assembly mnemonic.
    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Noop => "noop",
            Halt => "halt",
            Ebreak => "ebreak",
            Ecall => "ecall",
            Try => "try",
            Leave => "leave",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Mod => "mod",
            Bitshl => "bitshl",
            Bitshr => "bitshr",
            Bitashr => "bitashr",
            Bitrol => "bitrol",
            Bitror => "bitror",
            Bitand => "bitand",
            Bitor => "bitor",
            Bitxor => "bitxor",
            Eq => "eq",
            Lt => "lt",
            Gt => "gt",
            Cmp => "cmp",
            And => "and",
            Or => "or",
            BufferAt => "buffer_at",
            BufferPop => "buffer_pop",
            StructAt => "struct_at",
            StructInsert => "struct_insert",
            StructRemove => "struct_remove",
            IoSubmit => "io_submit",
            IoWait => "io_wait",
            IoShutdown => "io_shutdown",
            IoCtl => "io_ctl",
            Join => "join",
            Wrapadd => "wrapadd",
            Wrapsub => "wrapsub",
            Wrapmul => "wrapmul",
            Checkedsadd => "checkedsadd",
            Checkedssub => "checkedssub",
            Checkedsmul => "checkedsmul",
            Saturatingsadd => "saturatingsadd",
            Saturatingssub => "saturatingssub",
            Saturatingsmul => "saturatingsmul",
            Bitseq => "bitseq",
            Bitslt => "bitslt",
            Bitsgt => "bitsgt",
            Bitaeq => "bitaeq",
            Bitalt => "bitalt",
            Bitagt => "bitagt",
            Bitat => "bitat",
            Bitset => "bitset",
            Capture => "capture",
            Capturemove => "capturemove",
            Call => "call",
            Bitnot => "bitnot",
            Not => "not",
            Copy => "copy",
            Move => "move",
            Swap => "swap",
            BufferPush => "buffer_push",
            BufferSize => "buffer_size",
            Ref => "ref",
            If => "if",
            IoPeek => "io_peek",
            Actor => "actor",
            Send => "send",
            Receive => "receive",
            Catch => "catch",
            Bits => "bits",
            Bitswidth => "bitswidth",
            Ptrlive => "ptrlive",
            Closure => "closure",
            Frame => "frame",
            Return => "return",
            Atom => "atom",
            String => "string",
            Float => "float",
            Double => "double",
            Struct => "struct",
            Buffer => "buffer",
            SelfPid => "self",
            Tailcall => "tailcall",
            Defer => "defer",
            Throw => "throw",
            Draw => "draw",
            Watchdog => "watchdog",
            AllocateRegisters => "allocate_registers",
            Enter => "enter",
            Lli => "lli",
            Lliu => "lliu",
            FloatImm => "float",
            Lui => "lui",
            Luiu => "luiu",
            Cast => "cast",
            Arodp => "arodp",
            Atxtp => "atxtp",
            Addi => "addi",
            Addiu => "addiu",
            Subi => "subi",
            Subiu => "subiu",
            Muli => "muli",
            Muliu => "muliu",
            Divi => "divi",
            Diviu => "diviu",
            Sm => "sm",
            Lm => "lm",
            Aa => "aa",
            Ad => "ad",
            Ptr => "ptr",
        }
    }
}

impl core::fmt::Display for Opcode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Operands of a decoded instruction, one variant per format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    N,
    S {
        out: RegisterAccess,
    },
    D {
        out: RegisterAccess,
        src: RegisterAccess,
    },
    T {
        out: RegisterAccess,
        lhs: RegisterAccess,
        rhs: RegisterAccess,
    },
    F {
        out: RegisterAccess,
        immediate: u32,
    },
    E {
        out: RegisterAccess,
        immediate: u64,
    },
    R {
        out: RegisterAccess,
        src: RegisterAccess,
        immediate: u32,
    },
    M {
        out: RegisterAccess,
        src: RegisterAccess,
        offset: u16,
        spec: u8,
    },
}

/// A fully decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub greedy: bool,
    pub operands: Operands,
}

fn slot(raw: u64, shift: u32) -> u16 {
    (raw >> shift) as u16
}

/// Decode an access slot whose top nibble must be clear (formats that do not
/// overlay immediates there).
fn access(raw: u64, shift: u32) -> Result<RegisterAccess, DecodeError> {
    let slot = slot(raw, shift);
    if slot & 0xf000 != 0 {
        return Err(DecodeError::InvalidOperand(slot));
    }
    RegisterAccess::decode(slot)
}

/// Decode an access slot in the R/M formats, whose top nibble carries
/// immediate bits and is stripped before decoding.
fn access_masked(raw: u64, shift: u32) -> Result<RegisterAccess, DecodeError> {
    RegisterAccess::decode(slot(raw, shift) & 0x0fff)
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: Operands) -> Instruction {
        Instruction {
            opcode,
            greedy: false,
            operands,
        }
    }

    pub fn greedy(mut self) -> Instruction {
        self.greedy = true;
        self
    }

    /// Decode one instruction word.
    pub fn decode(word: u64) -> Result<Instruction, DecodeError> {
        let opcode_word = word as OpcodeWord;
        let opcode = Opcode::from_word(opcode_word)?;
        let greedy = opcode_word & GREEDY != 0;

        let operands = match opcode.format() {
            Format::N => {
                if word >> 16 != 0 {
                    return Err(DecodeError::InvalidOperand((word >> 16) as u16));
                }
                Operands::N
            }
            Format::S => Operands::S {
                out: access(word, 16)?,
            },
            Format::D => Operands::D {
                out: access(word, 16)?,
                src: access(word, 32)?,
            },
            Format::T => Operands::T {
                out: access(word, 16)?,
                lhs: access(word, 32)?,
                rhs: access(word, 48)?,
            },
            Format::F => Operands::F {
                out: access(word, 16)?,
                immediate: (word >> 32) as u32,
            },
            Format::E => {
                // The immediate's high nibble rides in the top nibble of the
                // out slot.
                let high = (word >> 28) & 0xf;
                let low = word >> 32;
                Operands::E {
                    out: access_masked(word, 16)?,
                    immediate: (high << 32) | low,
                }
            }
            Format::R => {
                let low_short = (word >> 48) as u32 & 0xffff;
                let mid_nibble = (word >> 44) as u32 & 0xf;
                let high_nibble = (word >> 28) as u32 & 0xf;
                Operands::R {
                    out: access_masked(word, 16)?,
                    src: access_masked(word, 32)?,
                    immediate: low_short | (mid_nibble << 16) | (high_nibble << 20),
                }
            }
            Format::M => {
                let offset = (word >> 48) as u16;
                let spec_low = (word >> 44) as u8 & 0xf;
                let spec_high = (word >> 28) as u8 & 0xf;
                Operands::M {
                    out: access_masked(word, 16)?,
                    src: access_masked(word, 32)?,
                    offset,
                    spec: spec_low | (spec_high << 4),
                }
            }
        };

        Ok(Instruction {
            opcode,
            greedy,
            operands,
        })
    }

    /// Encode back into an instruction word.
    pub fn encode(&self) -> u64 {
        let mut word = u64::from(self.opcode as u16 | if self.greedy { GREEDY } else { 0 });

        match self.operands {
            Operands::N => {}
            Operands::S { out } => {
                word |= u64::from(out.encode()) << 16;
            }
            Operands::D { out, src } => {
                word |= u64::from(out.encode()) << 16;
                word |= u64::from(src.encode()) << 32;
            }
            Operands::T { out, lhs, rhs } => {
                word |= u64::from(out.encode()) << 16;
                word |= u64::from(lhs.encode()) << 32;
                word |= u64::from(rhs.encode()) << 48;
            }
            Operands::F { out, immediate } => {
                word |= u64::from(out.encode()) << 16;
                word |= u64::from(immediate) << 32;
            }
            Operands::E { out, immediate } => {
                let high = (immediate >> 32) & 0xf;
                let low = immediate & 0xffff_ffff;
                word |= u64::from(out.encode()) << 16;
                word |= high << 28;
                word |= low << 32;
            }
            Operands::R {
                out,
                src,
                immediate,
            } => {
                let low_short = u64::from(immediate & 0xffff);
                let mid_nibble = u64::from((immediate >> 16) & 0xf);
                let high_nibble = u64::from((immediate >> 20) & 0xf);
                word |= u64::from(out.encode()) << 16;
                word |= u64::from(src.encode()) << 32;
                word |= low_short << 48;
                word |= mid_nibble << 44;
                word |= high_nibble << 28;
            }
            Operands::M {
                out,
                src,
                offset,
                spec,
            } => {
                word |= u64::from(out.encode()) << 16;
                word |= u64::from(src.encode()) << 32;
                word |= u64::from(offset) << 48;
                word |= u64::from(spec & 0x0f) << 44;
                word |= u64::from(spec >> 4) << 28;
            }
        }

        word
    }
}

impl core::fmt::Display for Instruction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.greedy {
            f.write_str("g.")?;
        }
        write!(f, "{}", self.opcode)?;
        match self.operands {
            Operands::N => Ok(()),
            Operands::S { out } => write!(f, " {out}"),
            Operands::D { out, src } => write!(f, " {out}, {src}"),
            Operands::T { out, lhs, rhs } => write!(f, " {out}, {lhs}, {rhs}"),
            Operands::F { out, immediate } => write!(f, " {out}, {immediate}"),
            Operands::E { out, immediate } => write!(f, " {out}, {immediate}"),
            Operands::R {
                out,
                src,
                immediate,
            } => write!(f, " {out}, {src}, {immediate}"),
            Operands::M {
                out,
                src,
                offset,
                spec,
            } => write!(f, " {spec}, {out}, {src}, {offset}"),
        }
    }
}
