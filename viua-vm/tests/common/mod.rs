//! Shared helpers for the integration tests: a small instruction builder, an
//! in-memory ELF packer, and routines to run programs to completion on a
//! real kernel.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use viua_arch::ops::{Instruction, Opcode, Operands};
use viua_arch::{AccessSet, RegisterAccess};
use viua_vm::frame::Frame;
use viua_vm::kernel::{Config, Kernel};
use viua_vm::loader::Module;
use viua_vm::pid::Pid;
use viua_vm::registers::RegisterSet;
use viua_vm::scheduler::ProcessScheduler;
use viua_vm::value::{Addr, Boxed, Value};

/*
 * Register access shorthands.
 */

pub fn l(index: u8) -> RegisterAccess {
    RegisterAccess::local(index)
}

pub fn a(index: u8) -> RegisterAccess {
    RegisterAccess::new(AccessSet::Argument, false, index)
}

pub fn p(index: u8) -> RegisterAccess {
    RegisterAccess::new(AccessSet::Parameter, false, index)
}

pub fn g(index: u8) -> RegisterAccess {
    RegisterAccess::new(AccessSet::Global, false, index)
}

pub fn deref(index: u8) -> RegisterAccess {
    RegisterAccess::new(AccessSet::Local, true, index)
}

pub fn void() -> RegisterAccess {
    RegisterAccess::void()
}

/*
 * Instruction shorthands.
 */

pub fn n(opcode: Opcode) -> Instruction {
    Instruction::new(opcode, Operands::N)
}

pub fn s(opcode: Opcode, out: RegisterAccess) -> Instruction {
    Instruction::new(opcode, Operands::S { out })
}

pub fn d(opcode: Opcode, out: RegisterAccess, src: RegisterAccess) -> Instruction {
    Instruction::new(opcode, Operands::D { out, src })
}

pub fn t(
    opcode: Opcode,
    out: RegisterAccess,
    lhs: RegisterAccess,
    rhs: RegisterAccess,
) -> Instruction {
    Instruction::new(opcode, Operands::T { out, lhs, rhs })
}

pub fn e(opcode: Opcode, out: RegisterAccess, immediate: u64) -> Instruction {
    Instruction::new(opcode, Operands::E { out, immediate })
}

pub fn r(opcode: Opcode, out: RegisterAccess, src: RegisterAccess, immediate: u32) -> Instruction {
    Instruction::new(
        opcode,
        Operands::R {
            out,
            src,
            immediate,
        },
    )
}

pub fn m(
    opcode: Opcode,
    out: RegisterAccess,
    src: RegisterAccess,
    offset: u16,
    spec: u8,
) -> Instruction {
    Instruction::new(
        opcode,
        Operands::M {
            out,
            src,
            offset,
            spec,
        },
    )
}

/// Load a small non-negative integer constant.
pub fn li(out: RegisterAccess, value: u32) -> Instruction {
    assert!(value < (1 << 24), "li only encodes 24-bit constants");
    r(Opcode::Addi, out, void(), value)
}

/// Load a small unsigned constant.
pub fn liu(out: RegisterAccess, value: u32) -> Instruction {
    assert!(value < (1 << 24), "liu only encodes 24-bit constants");
    r(Opcode::Addiu, out, void(), value)
}

/*
 * Program builder.
 */

/// Assembles instruction words, rodata, and a function table into a
/// [`Module`].
pub struct Asm {
    words: Vec<u64>,
    rodata: Vec<u8>,
    functions: BTreeMap<String, u64>,
}

impl Asm {
    pub fn new() -> Asm {
        Asm {
            words: Vec::new(),
            // Offset 0 is the empty string.
            rodata: vec![0],
            functions: BTreeMap::new(),
        }
    }

    /// Mark the next instruction as the entry of a function.
    pub fn function(&mut self, name: &str) -> u64 {
        let offset = self.here();
        self.functions.insert(name.to_string(), offset);
        offset
    }

    /// The current text offset, in words.
    pub fn here(&self) -> u64 {
        self.words.len() as u64
    }

    pub fn op(&mut self, ins: Instruction) -> &mut Asm {
        self.words.push(ins.encode());
        self
    }

    /// Reserve a slot to be patched later (forward jumps).
    pub fn placeholder(&mut self) -> usize {
        self.words.push(n(Opcode::Noop).encode());
        self.words.len() - 1
    }

    pub fn patch(&mut self, slot: usize, ins: Instruction) {
        self.words[slot] = ins.encode();
    }

    /// Intern a NUL-terminated string into rodata, returning its offset.
    pub fn rodata(&mut self, text: &str) -> u64 {
        let offset = self.rodata.len() as u64;
        self.rodata.extend_from_slice(text.as_bytes());
        self.rodata.push(0);
        offset
    }

    /// Emit `ARODP` + `ATOM` to materialise an atom into a register.
    pub fn atom(&mut self, out: RegisterAccess, name: &str) -> &mut Asm {
        let offset = self.rodata(name);
        self.op(e(Opcode::Arodp, out, offset));
        self.op(s(Opcode::Atom, out))
    }

    /// Emit `ARODP` + `STRING` to materialise a string into a register.
    pub fn string(&mut self, out: RegisterAccess, text: &str) -> &mut Asm {
        let offset = self.rodata(text);
        self.op(e(Opcode::Arodp, out, offset));
        self.op(s(Opcode::String, out))
    }

    pub fn into_module(self, entry: Option<u64>) -> Module {
        Module::from_parts(self.words, self.rodata, self.functions, entry)
    }

    /// The raw parts, for packing into an ELF image.
    pub fn into_parts(self) -> (Vec<u64>, Vec<u8>, BTreeMap<String, u64>) {
        (self.words, self.rodata, self.functions)
    }
}

/*
 * Kernel harness.
 */

pub fn test_config(schedulers: usize) -> Config {
    Config {
        process_schedulers: schedulers,
        ffi_schedulers: 1,
        io_schedulers: 1,
        library_path: Vec::new(),
    }
}

pub fn kernel_with(module: Module, schedulers: usize) -> (Arc<Kernel>, u32) {
    let kernel = Kernel::new(test_config(schedulers));
    let id = kernel.register_module(module);
    (kernel, id)
}

/// Spawn `name` as the program's only root process and drive scheduler 0 on
/// this thread until every process has finished. Returns the root process's
/// outcome.
pub fn run_function(kernel: &Arc<Kernel>, name: &str) -> Result<Value, Value> {
    let entry = kernel
        .get_entry_point_of(name)
        .unwrap_or_else(|| panic!("no function {name}"));
    let pid = spawn_call(kernel, entry);
    ProcessScheduler::new(0, Arc::clone(kernel)).run();
    outcome_of(kernel, pid)
}

pub fn spawn_call(kernel: &Arc<Kernel>, entry: Addr) -> Pid {
    let frame = Frame::new(entry, None, RegisterSet::new(0));
    kernel.spawn(frame, 0, false)
}

pub fn outcome_of(kernel: &Arc<Kernel>, pid: Pid) -> Result<Value, Value> {
    if kernel.is_process_terminated(pid) {
        Err(kernel
            .transfer_exception_of(pid)
            .expect("terminated process leaves an exception"))
    } else {
        Ok(kernel.transfer_result_of(pid).unwrap_or(Value::Void))
    }
}

/// The tag of an exception value.
pub fn tag_of(exception: &Value) -> &str {
    match exception.boxed() {
        Some(Boxed::Exception(e)) => e.tag.as_str(),
        other => panic!("not an exception: {other:?}"),
    }
}

pub fn assert_int(value: &Value, expected: i64) {
    assert!(
        value.deep_eq(&Value::Int(expected)),
        "expected {expected}, got {value}",
    );
}

/// Background FFI/I-O workers for tests whose programs call foreign
/// functions or submit I/O.
pub struct Workers {
    kernel: Arc<Kernel>,
    ffi: Vec<std::thread::JoinHandle<()>>,
    io: Vec<std::thread::JoinHandle<()>>,
}

pub fn start_workers(kernel: &Arc<Kernel>, ffi: usize, io: usize) -> Workers {
    let mut workers = Workers {
        kernel: Arc::clone(kernel),
        ffi: Vec::new(),
        io: Vec::new(),
    };
    for _ in 0..ffi {
        let kernel = Arc::clone(kernel);
        workers
            .ffi
            .push(std::thread::spawn(move || kernel.ffi.worker_loop(&kernel)));
    }
    for _ in 0..io {
        let kernel = Arc::clone(kernel);
        workers
            .io
            .push(std::thread::spawn(move || kernel.io.worker_loop()));
    }
    workers
}

impl Workers {
    pub fn stop(self) {
        self.kernel.ffi.shutdown();
        self.kernel.io.shutdown();
        for worker in self.ffi {
            let _ = worker.join();
        }
        // An I/O worker may be parked in a blocking syscall; do not wait for
        // those, exactly as the kernel itself does not.
        drop(self.io);
    }
}

/*
 * ELF packing, for the loader tests.
 */

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;

struct Section {
    name: &'static str,
    sh_type: u32,
    data: Vec<u8>,
    link: u32,
    entsize: u64,
}

/// Pack text/rodata/functions into a well-formed Viua executable image.
pub fn build_elf(
    text: &[u64],
    rodata: &[u8],
    functions: &[(&str, u64)],
    entry: Option<u64>,
    labels: &[(&str, u64)],
) -> Vec<u8> {
    let mut text_bytes = Vec::with_capacity(text.len() * 8);
    for word in text {
        text_bytes.extend_from_slice(&word.to_le_bytes());
    }

    // .strtab and .symtab
    let mut strtab = vec![0u8];
    let mut symtab = Vec::new();
    for (name, word_offset) in functions {
        let name_offset = strtab.len() as u32;
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);

        symtab.extend_from_slice(&name_offset.to_le_bytes());
        symtab.push(2); // st_info: STT_FUNC
        symtab.push(0); // st_other
        symtab.extend_from_slice(&3u16.to_le_bytes()); // st_shndx: .text
        symtab.extend_from_slice(&(word_offset * 8).to_le_bytes()); // st_value
        symtab.extend_from_slice(&0u64.to_le_bytes()); // st_size
    }

    let mut labels_data = Vec::new();
    for (name, address) in labels {
        labels_data.extend_from_slice(&(name.len() as u64).to_le_bytes());
        labels_data.extend_from_slice(name.as_bytes());
        labels_data.extend_from_slice(&address.to_le_bytes());
    }

    let sections = [
        Section {
            name: ".interp",
            sh_type: SHT_PROGBITS,
            data: b"viua-vm\0".to_vec(),
            link: 0,
            entsize: 0,
        },
        Section {
            name: ".viua.magic",
            sh_type: SHT_PROGBITS,
            data: vec![0x7f, b'V', b'I', b'U', b'A', 0, 0, 0],
            link: 0,
            entsize: 0,
        },
        Section {
            name: ".text",
            sh_type: SHT_PROGBITS,
            data: text_bytes,
            link: 0,
            entsize: 8,
        },
        Section {
            name: ".rodata",
            sh_type: SHT_PROGBITS,
            data: rodata.to_vec(),
            link: 0,
            entsize: 0,
        },
        Section {
            name: ".symtab",
            sh_type: SHT_SYMTAB,
            data: symtab,
            link: 6, // .strtab
            entsize: 24,
        },
        Section {
            name: ".strtab",
            sh_type: SHT_STRTAB,
            data: strtab,
            link: 0,
            entsize: 0,
        },
        Section {
            name: ".viua.labels",
            sh_type: SHT_PROGBITS,
            data: labels_data,
            link: 0,
            entsize: 0,
        },
    ];

    // Section name string table.
    let mut shstrtab = vec![0u8];
    let mut name_offsets = Vec::new();
    for section in &sections {
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(section.name.as_bytes());
        shstrtab.push(0);
    }
    let shstrtab_name_offset = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".shstrtab\0");

    const EHDR_SIZE: usize = 64;
    const PHDR_SIZE: usize = 56;
    const SHDR_SIZE: usize = 64;
    let shnum = sections.len() + 2; // NULL + sections + .shstrtab

    // Lay out section data after the headers.
    let mut offsets = Vec::new();
    let mut cursor = EHDR_SIZE + PHDR_SIZE;
    for section in &sections {
        offsets.push(cursor);
        cursor += section.data.len();
    }
    let shstrtab_offset = cursor;
    cursor += shstrtab.len();
    let shoff = cursor;

    let text_offset = offsets[2] as u64;
    let text_size = sections[2].data.len() as u64;
    let e_entry = entry.map(|words| text_offset + words * 8).unwrap_or(0);

    let mut image = Vec::with_capacity(shoff + shnum * SHDR_SIZE);

    // ELF header.
    image.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
    image.push(2); // EI_CLASS: ELF64
    image.push(1); // EI_DATA: LSB
    image.push(1); // EI_VERSION
    image.push(255); // EI_OSABI: Standalone
    image.push(0); // EI_ABIVERSION
    image.extend_from_slice(&[0u8; 7]); // padding
    image.extend_from_slice(&2u16.to_le_bytes()); // e_type: EXEC
    image.extend_from_slice(&0u16.to_le_bytes()); // e_machine: none
    image.extend_from_slice(&1u32.to_le_bytes()); // e_version
    image.extend_from_slice(&e_entry.to_le_bytes());
    image.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // e_phoff
    image.extend_from_slice(&(shoff as u64).to_le_bytes()); // e_shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
    image.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
    image.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    image.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes()); // e_shentsize
    image.extend_from_slice(&(shnum as u16).to_le_bytes()); // e_shnum
    image.extend_from_slice(&((shnum - 1) as u16).to_le_bytes()); // e_shstrndx

    // One PT_LOAD program header covering .text.
    image.extend_from_slice(&1u32.to_le_bytes()); // p_type: LOAD
    image.extend_from_slice(&5u32.to_le_bytes()); // p_flags: R+X
    image.extend_from_slice(&text_offset.to_le_bytes()); // p_offset
    image.extend_from_slice(&0u64.to_le_bytes()); // p_vaddr
    image.extend_from_slice(&0u64.to_le_bytes()); // p_paddr
    image.extend_from_slice(&text_size.to_le_bytes()); // p_filesz
    image.extend_from_slice(&text_size.to_le_bytes()); // p_memsz
    image.extend_from_slice(&8u64.to_le_bytes()); // p_align

    // Section data.
    for section in &sections {
        image.extend_from_slice(&section.data);
    }
    image.extend_from_slice(&shstrtab);

    // Section headers: the NULL entry first.
    assert_eq!(image.len(), shoff);
    image.extend_from_slice(&[0u8; SHDR_SIZE]);

    let mut shdr = |name_offset: u32, sh_type: u32, offset: u64, size: u64, link: u32, entsize: u64| {
        let mut header = Vec::with_capacity(SHDR_SIZE);
        header.extend_from_slice(&name_offset.to_le_bytes());
        header.extend_from_slice(&sh_type.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes()); // sh_flags
        header.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
        header.extend_from_slice(&offset.to_le_bytes());
        header.extend_from_slice(&size.to_le_bytes());
        header.extend_from_slice(&link.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // sh_info
        header.extend_from_slice(&1u64.to_le_bytes()); // sh_addralign
        header.extend_from_slice(&entsize.to_le_bytes());
        header
    };

    for (index, section) in sections.iter().enumerate() {
        let header = shdr(
            name_offsets[index],
            section.sh_type,
            offsets[index] as u64,
            section.data.len() as u64,
            section.link,
            section.entsize,
        );
        image.extend_from_slice(&header);
    }
    let header = shdr(
        shstrtab_name_offset,
        SHT_STRTAB,
        shstrtab_offset as u64,
        shstrtab.len() as u64,
        0,
        0,
    );
    image.extend_from_slice(&header);

    image
}
