//! Bytecode loader: ELF64 container → executable `Module`.
//!
//! Executables are ELF64 LSB files with a fixed identification (class 64,
//! little-endian, OS ABI Standalone, machine none, flags zero) and a set of
//! required sections. Any deviation is rejected with a specific error: a
//! corrupt container is fatal, unlike runtime faults which become catchable
//! exceptions.
//!
//! Required sections:
//!
//! - `.interp`: informational interpreter path
//! - `.viua.magic`: the 8-byte signature `7F 56 49 55 41 00 00 00`
//! - `.text`: little-endian 64-bit instruction words
//! - `.rodata`: NUL-terminated string table addressed by `ARODP`
//! - `.symtab` + `.strtab`: function symbols (`STT_FUNC`, `st_value` is the
//!   byte offset into `.text`)
//! - `.viua.labels` (optional): `<u64 size><name><u64 address>` tuples

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use goblin::elf::sym::STT_FUNC;
use goblin::elf::Elf;
use log::debug;
use zerocopy::little_endian::U64 as U64Le;
use zerocopy::FromBytes;

// ELF identification constants, only the subset we check.
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ELFOSABI_STANDALONE: u8 = 255;
const EM_NONE: u16 = 0;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const EI_OSABI: usize = 7;
const EI_ABIVERSION: usize = 8;

/// Contents of the `.viua.magic` section.
pub const VIUA_MAGIC: [u8; 8] = [0x7f, b'V', b'I', b'U', b'A', 0, 0, 0];

/// Errors produced while loading a binary. All of them are fatal to the load.
#[derive(Debug)]
pub enum LoadError {
    Io(std::io::Error),
    /// The container is not parseable ELF at all.
    Malformed(String),
    /// A fixed identification field has the wrong value.
    InvalidElf(&'static str),
    /// A required section is absent.
    MissingSection(&'static str),
    /// `.viua.magic` is present but wrong.
    InvalidMagic,
    /// A section's contents are inconsistent (odd sizes, bad offsets).
    InvalidSection(&'static str),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "i/o error: {e}"),
            LoadError::Malformed(e) => write!(f, "malformed ELF: {e}"),
            LoadError::InvalidElf(what) => write!(f, "invalid ELF: {what}"),
            LoadError::MissingSection(name) => write!(f, "missing section: {name}"),
            LoadError::InvalidMagic => f.write_str("invalid .viua.magic signature"),
            LoadError::InvalidSection(what) => write!(f, "invalid section: {what}"),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> LoadError {
        LoadError::Io(e)
    }
}

/// One section of the container: its header coordinates, the matching program
/// header's file offset when one covers it, and the raw bytes.
#[derive(Debug)]
pub struct Fragment {
    pub name: String,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub p_offset: Option<u64>,
    pub data: Vec<u8>,
}

/// The parsed container, before instruction decoding.
#[derive(Debug)]
pub struct LoadedElf {
    pub fragments: Vec<Fragment>,
    e_entry: u64,
}

impl LoadedElf {
    /// Parse and validate the container, materialising every section.
    pub fn parse(bytes: &[u8]) -> Result<LoadedElf, LoadError> {
        let elf = Elf::parse(bytes).map_err(|e| LoadError::Malformed(e.to_string()))?;

        let ident = &elf.header.e_ident;
        if ident[EI_CLASS] != ELFCLASS64 {
            return Err(LoadError::InvalidElf("class (want ELF64)"));
        }
        if ident[EI_DATA] != ELFDATA2LSB {
            return Err(LoadError::InvalidElf("endianness (want LSB)"));
        }
        if ident[EI_VERSION] != EV_CURRENT {
            return Err(LoadError::InvalidElf("identification version"));
        }
        if ident[EI_OSABI] != ELFOSABI_STANDALONE {
            return Err(LoadError::InvalidElf("OS ABI (want Standalone)"));
        }
        if ident[EI_ABIVERSION] != 0 {
            return Err(LoadError::InvalidElf("ABI version"));
        }
        if elf.header.e_machine != EM_NONE {
            return Err(LoadError::InvalidElf("machine (want none)"));
        }
        if elf.header.e_version != u32::from(EV_CURRENT) {
            return Err(LoadError::InvalidElf("version"));
        }
        if elf.header.e_flags != 0 {
            return Err(LoadError::InvalidElf("flags (want zero)"));
        }

        let mut fragments = Vec::new();
        for sh in &elf.section_headers {
            let name = elf
                .shdr_strtab
                .get_at(sh.sh_name)
                .unwrap_or_default()
                .to_string();

            let range = sh.sh_offset as usize..(sh.sh_offset + sh.sh_size) as usize;
            let data = if sh.sh_size == 0 || sh.sh_type == goblin::elf::section_header::SHT_NOBITS
            {
                Vec::new()
            } else {
                bytes
                    .get(range)
                    .ok_or(LoadError::InvalidSection("section extends beyond file"))?
                    .to_vec()
            };

            let p_offset = elf
                .program_headers
                .iter()
                .find(|ph| ph.p_offset == sh.sh_offset)
                .map(|ph| ph.p_offset);

            fragments.push(Fragment {
                name,
                sh_offset: sh.sh_offset,
                sh_size: sh.sh_size,
                p_offset,
                data,
            });
        }

        let loaded = LoadedElf {
            fragments,
            e_entry: elf.header.e_entry,
        };

        for required in [
            ".interp",
            ".viua.magic",
            ".text",
            ".rodata",
            ".symtab",
            ".strtab",
        ] {
            if loaded.find_fragment(required).is_none() {
                return Err(LoadError::MissingSection(required));
            }
        }

        let magic = &loaded
            .find_fragment(".viua.magic")
            .expect("checked above")
            .data;
        if magic.as_slice() != VIUA_MAGIC {
            return Err(LoadError::InvalidMagic);
        }

        Ok(loaded)
    }

    pub fn find_fragment(&self, name: &str) -> Option<&Fragment> {
        self.fragments.iter().find(|f| f.name == name)
    }

    /// Entry offset in bytes into `.text`, derived from `e_entry` and the
    /// text segment's file offset.
    pub fn entry_point(&self) -> Option<u64> {
        if self.e_entry == 0 {
            return None;
        }
        let text = self.find_fragment(".text")?;
        let base = text.p_offset.unwrap_or(text.sh_offset);
        self.e_entry.checked_sub(base)
    }
}

/// A loaded bytecode unit, ready for execution.
#[derive(Debug)]
pub struct Module {
    pub path: PathBuf,
    /// Decoded instruction words.
    pub text: Vec<u64>,
    /// NUL-terminated string table.
    pub rodata: Vec<u8>,
    /// Function symbol → offset into `text`, in words.
    pub functions: BTreeMap<String, u64>,
    /// Label address (in words) → name, from `.viua.labels`.
    pub labels: BTreeMap<u64, String>,
    /// Entry offset into `text`, in words.
    pub entry: Option<u64>,
}

impl Module {
    pub fn load_file(path: &Path) -> Result<Module, LoadError> {
        let bytes = std::fs::read(path)?;
        Module::parse(path.to_path_buf(), &bytes)
    }

    pub fn parse(path: PathBuf, bytes: &[u8]) -> Result<Module, LoadError> {
        let elf = LoadedElf::parse(bytes)?;

        let text_fragment = elf
            .find_fragment(".text")
            .ok_or(LoadError::MissingSection(".text"))?;
        let text = make_text_from(&text_fragment.data)?;

        let rodata = elf
            .find_fragment(".rodata")
            .ok_or(LoadError::MissingSection(".rodata"))?
            .data
            .clone();

        let functions = load_symtab(&elf, text.len())?;
        let labels = load_labels(&elf)?;

        let entry = match elf.entry_point() {
            Some(byte_offset) => {
                if byte_offset % 8 != 0 || byte_offset / 8 >= text.len() as u64 {
                    return Err(LoadError::InvalidSection("entry point outside .text"));
                }
                Some(byte_offset / 8)
            }
            None => None,
        };

        debug!(
            "loaded {}: {} words of text, {} functions, {} labels",
            path.display(),
            text.len(),
            functions.len(),
            labels.len(),
        );

        Ok(Module {
            path,
            text,
            rodata,
            functions,
            labels,
            entry,
        })
    }

    /// Assemble a module from raw parts, bypassing the ELF container. Used by
    /// the test suite and embedders that generate code in memory.
    pub fn from_parts(
        text: Vec<u64>,
        rodata: Vec<u8>,
        functions: BTreeMap<String, u64>,
        entry: Option<u64>,
    ) -> Module {
        Module {
            path: PathBuf::from("<memory>"),
            text,
            rodata,
            functions,
            labels: BTreeMap::new(),
            entry,
        }
    }

    /// The NUL-terminated string starting at a rodata offset.
    pub fn rodata_str_at(&self, offset: u64) -> Option<&str> {
        let start = usize::try_from(offset).ok()?;
        let tail = self.rodata.get(start..)?;
        let end = tail.iter().position(|b| *b == 0)?;
        std::str::from_utf8(&tail[..end]).ok()
    }

    /// The function symbol covering a text offset (in words), for
    /// diagnostics: the one with the greatest address not past the offset.
    pub fn function_at(&self, offset: u64) -> Option<(&str, u64)> {
        self.functions
            .iter()
            .filter(|(_, addr)| **addr <= offset)
            .max_by_key(|(_, addr)| **addr)
            .map(|(name, addr)| (name.as_str(), *addr))
    }
}

/// Reinterpret the `.text` bytes as little-endian 64-bit words.
fn make_text_from(data: &[u8]) -> Result<Vec<u64>, LoadError> {
    let words = <[U64Le]>::ref_from_bytes(data)
        .map_err(|_| LoadError::InvalidSection(".text size is not a multiple of 8"))?;
    Ok(words.iter().map(|w| w.get()).collect())
}

/// Collect `STT_FUNC` symbols into the function map, converting byte offsets
/// into word offsets.
fn load_symtab(elf: &LoadedElf, text_words: usize) -> Result<BTreeMap<String, u64>, LoadError> {
    const SYM_SIZE: usize = 24;

    let symtab = &elf
        .find_fragment(".symtab")
        .ok_or(LoadError::MissingSection(".symtab"))?
        .data;
    let strtab = &elf
        .find_fragment(".strtab")
        .ok_or(LoadError::MissingSection(".strtab"))?
        .data;

    if symtab.len() % SYM_SIZE != 0 {
        return Err(LoadError::InvalidSection(".symtab entry size"));
    }

    let mut functions = BTreeMap::new();
    for entry in symtab.chunks_exact(SYM_SIZE) {
        // Elf64_Sym layout: st_name u32, st_info u8, st_other u8,
        // st_shndx u16, st_value u64, st_size u64.
        let st_name = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]) as usize;
        let st_info = entry[4];
        let st_value = U64Le::read_from_bytes(&entry[8..16])
            .map_err(|_| LoadError::InvalidSection(".symtab"))?
            .get();

        if st_info & 0xf != STT_FUNC {
            continue;
        }

        let name = strtab
            .get(st_name..)
            .and_then(|tail| tail.iter().position(|b| *b == 0).map(|end| &tail[..end]))
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .ok_or(LoadError::InvalidSection(".strtab (bad symbol name)"))?;

        if st_value % 8 != 0 || st_value / 8 > text_words as u64 {
            return Err(LoadError::InvalidSection("function symbol outside .text"));
        }

        functions.insert(name.to_string(), st_value / 8);
    }

    Ok(functions)
}

/// Parse the optional `.viua.labels` table of `<u64 size><name><u64 addr>`
/// records.
fn load_labels(elf: &LoadedElf) -> Result<BTreeMap<u64, String>, LoadError> {
    let mut labels = BTreeMap::new();
    let Some(fragment) = elf.find_fragment(".viua.labels") else {
        return Ok(labels);
    };

    let data = &fragment.data;
    let mut pos = 0usize;
    while pos < data.len() {
        let size = read_u64(data, pos).ok_or(LoadError::InvalidSection(".viua.labels"))? as usize;
        let name_start = pos + 8;
        let name_end = name_start
            .checked_add(size)
            .ok_or(LoadError::InvalidSection(".viua.labels"))?;
        let name = data
            .get(name_start..name_end)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .ok_or(LoadError::InvalidSection(".viua.labels (bad name)"))?;
        let addr =
            read_u64(data, name_end).ok_or(LoadError::InvalidSection(".viua.labels"))?;

        labels.insert(addr, name.to_string());
        pos = name_end + 8;
    }

    Ok(labels)
}

fn read_u64(data: &[u8], pos: usize) -> Option<u64> {
    let chunk = data.get(pos..pos + 8)?;
    U64Le::read_from_bytes(chunk).ok().map(|w| w.get())
}
