//! ELF64 image writers.
//!
//! Two output modes: a relocatable object (`.text` + `.symtab`/`.strtab` +
//! `.rela.text`) for a downstream linker, and a minimal static executable
//! laid out at a fixed load address with all relocations applied in place.
//! Header structs are written field by field in little-endian order so the
//! byte layout is visible at the call site.

use crate::error::BackendError;
use crate::ir::Arch;
use crate::layout::TextImage;
use crate::reloc::{self, GotPlt, LinkAddrs};
use crate::symtab::{Section, SymId, SymKind};

use std::collections::BTreeMap;

/// ELF constants used by the writers.
pub mod consts {
    /// `\x7fELF`.
    pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
    pub const ELFCLASS64: u8 = 2;
    pub const ELFDATA2LSB: u8 = 1;
    pub const EV_CURRENT: u8 = 1;
    pub const ELFOSABI_NONE: u8 = 0;

    pub const ET_REL: u16 = 1;
    pub const ET_EXEC: u16 = 2;

    pub const EM_X86_64: u16 = 62;
    pub const EM_RISCV: u16 = 243;

    /// RVC present + double-float ABI, matching the RV64GC target.
    pub const EF_RISCV_RVC_DOUBLE: u32 = 0x0001 | 0x0004;

    pub const SHT_NULL: u32 = 0;
    pub const SHT_PROGBITS: u32 = 1;
    pub const SHT_SYMTAB: u32 = 2;
    pub const SHT_STRTAB: u32 = 3;
    pub const SHT_RELA: u32 = 4;

    pub const SHF_WRITE: u64 = 1;
    pub const SHF_ALLOC: u64 = 2;
    pub const SHF_EXECINSTR: u64 = 4;

    pub const PT_LOAD: u32 = 1;
    pub const PF_X: u32 = 1;
    pub const PF_W: u32 = 2;
    pub const PF_R: u32 = 4;

    pub const STB_LOCAL: u8 = 0;
    pub const STB_GLOBAL: u8 = 1;
    pub const STT_NOTYPE: u8 = 0;
    pub const STT_OBJECT: u8 = 1;
    pub const STT_FUNC: u8 = 2;

    pub const EHDR_SIZE: u64 = 64;
    pub const SHDR_SIZE: u64 = 64;
    pub const PHDR_SIZE: u64 = 56;
    pub const SYM_SIZE: u64 = 24;
    pub const RELA_SIZE: u64 = 24;

    /// Default load address for static Linux executables.
    pub const DEFAULT_LOAD_ADDR: u64 = 0x40_0000;
}

/// Output flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// `ET_REL` with relocation entries for a downstream linker.
    Object,
    /// `ET_EXEC` at the default load address, relocations applied.
    Executable,
}

/// ELF file header.
#[derive(Debug, Clone)]
pub struct Ehdr {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_phnum: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Ehdr {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&consts::ELF_MAGIC);
        out.push(consts::ELFCLASS64);
        out.push(consts::ELFDATA2LSB);
        out.push(consts::EV_CURRENT);
        out.push(consts::ELFOSABI_NONE);
        out.extend_from_slice(&[0u8; 8]);

        out.extend_from_slice(&self.e_type.to_le_bytes());
        out.extend_from_slice(&self.e_machine.to_le_bytes());
        out.extend_from_slice(&u32::from(consts::EV_CURRENT).to_le_bytes());
        out.extend_from_slice(&self.e_entry.to_le_bytes());
        out.extend_from_slice(&self.e_phoff.to_le_bytes());
        out.extend_from_slice(&self.e_shoff.to_le_bytes());
        out.extend_from_slice(&self.e_flags.to_le_bytes());
        out.extend_from_slice(&(consts::EHDR_SIZE as u16).to_le_bytes());
        let phentsize = if self.e_phnum == 0 { 0 } else { consts::PHDR_SIZE as u16 };
        out.extend_from_slice(&phentsize.to_le_bytes());
        out.extend_from_slice(&self.e_phnum.to_le_bytes());
        let shentsize = if self.e_shnum == 0 { 0 } else { consts::SHDR_SIZE as u16 };
        out.extend_from_slice(&shentsize.to_le_bytes());
        out.extend_from_slice(&self.e_shnum.to_le_bytes());
        out.extend_from_slice(&self.e_shstrndx.to_le_bytes());
    }
}

/// Section header.
#[derive(Debug, Clone, Default)]
pub struct Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

impl Shdr {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sh_name.to_le_bytes());
        out.extend_from_slice(&self.sh_type.to_le_bytes());
        out.extend_from_slice(&self.sh_flags.to_le_bytes());
        out.extend_from_slice(&self.sh_addr.to_le_bytes());
        out.extend_from_slice(&self.sh_offset.to_le_bytes());
        out.extend_from_slice(&self.sh_size.to_le_bytes());
        out.extend_from_slice(&self.sh_link.to_le_bytes());
        out.extend_from_slice(&self.sh_info.to_le_bytes());
        out.extend_from_slice(&self.sh_addralign.to_le_bytes());
        out.extend_from_slice(&self.sh_entsize.to_le_bytes());
    }
}

/// Program header.
#[derive(Debug, Clone)]
pub struct Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Phdr {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.p_type.to_le_bytes());
        out.extend_from_slice(&self.p_flags.to_le_bytes());
        out.extend_from_slice(&self.p_offset.to_le_bytes());
        out.extend_from_slice(&self.p_vaddr.to_le_bytes());
        out.extend_from_slice(&self.p_vaddr.to_le_bytes()); // p_paddr
        out.extend_from_slice(&self.p_filesz.to_le_bytes());
        out.extend_from_slice(&self.p_memsz.to_le_bytes());
        out.extend_from_slice(&self.p_align.to_le_bytes());
    }
}

/// Symbol table entry.
#[derive(Debug, Clone)]
pub struct ElfSym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl ElfSym {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.st_name.to_le_bytes());
        out.push(self.st_info);
        out.push(0); // st_other
        out.extend_from_slice(&self.st_shndx.to_le_bytes());
        out.extend_from_slice(&self.st_value.to_le_bytes());
        out.extend_from_slice(&self.st_size.to_le_bytes());
    }
}

/// RELA relocation entry.
#[derive(Debug, Clone)]
pub struct Rela {
    pub r_offset: u64,
    pub r_info: u64,
    pub r_addend: i64,
}

impl Rela {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.r_offset.to_le_bytes());
        out.extend_from_slice(&self.r_info.to_le_bytes());
        out.extend_from_slice(&self.r_addend.to_le_bytes());
    }
}

/// String table builder. Offset 0 is the empty string.
#[derive(Debug)]
struct StrTab {
    data: Vec<u8>,
}

impl StrTab {
    fn new() -> Self {
        Self { data: vec![0] }
    }

    fn intern(&mut self, s: &str) -> u32 {
        let off = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        off
    }
}

fn machine(arch: Arch) -> u16 {
    match arch {
        Arch::X86_64 => consts::EM_X86_64,
        Arch::Rv64 => consts::EM_RISCV,
    }
}

fn elf_flags(arch: Arch) -> u32 {
    match arch {
        Arch::X86_64 => 0,
        Arch::Rv64 => consts::EF_RISCV_RVC_DOUBLE,
    }
}

fn pad_to(out: &mut Vec<u8>, align: usize) {
    while out.len() % align != 0 {
        out.push(0);
    }
}

fn sym_info(kind: SymKind, defined: bool, local: bool) -> u8 {
    let bind = if local { consts::STB_LOCAL } else { consts::STB_GLOBAL };
    let typ = if !defined {
        consts::STT_NOTYPE
    } else {
        match kind {
            SymKind::Func => consts::STT_FUNC,
            SymKind::Object => consts::STT_OBJECT,
        }
    };
    (bind << 4) | typ
}

/// Write an `ET_REL` relocatable object.
///
/// Section order: null, `.text`, `.symtab`, `.strtab`, `.rela.text`,
/// `.shstrtab`. Locals precede globals in the symbol table and `sh_info`
/// names the first global, as the ABI requires.
#[must_use]
pub fn write_object(image: &TextImage) -> Vec<u8> {
    const SHN_TEXT: u16 = 1;
    const SHN_SYMTAB: u32 = 2;
    const SHN_STRTAB: u32 = 3;

    // Symbol table, locals first; record where each SymId landed so the
    // RELA r_info fields can name it.
    let mut strtab = StrTab::new();
    let mut syms: Vec<ElfSym> = vec![ElfSym {
        st_name: 0,
        st_info: 0,
        st_shndx: 0,
        st_value: 0,
        st_size: 0,
    }];
    let mut elf_index: BTreeMap<SymId, u32> = BTreeMap::new();
    let emit_half = |local_pass: bool,
                         strtab: &mut StrTab,
                         syms: &mut Vec<ElfSym>,
                         elf_index: &mut BTreeMap<SymId, u32>| {
        for (id, sym) in image.symbols.iter() {
            if sym.local != local_pass {
                continue;
            }
            elf_index.insert(id, syms.len() as u32);
            syms.push(ElfSym {
                st_name: strtab.intern(&sym.name),
                st_info: sym_info(sym.kind, sym.defined, sym.local),
                st_shndx: if sym.section == Section::Text { SHN_TEXT } else { 0 },
                st_value: if sym.defined { image.offsets.get(sym.offset) } else { 0 },
                st_size: sym.size,
            });
        }
    };
    emit_half(true, &mut strtab, &mut syms, &mut elf_index);
    let first_global = syms.len() as u32;
    emit_half(false, &mut strtab, &mut syms, &mut elf_index);

    let relas: Vec<Rela> = image
        .relocations
        .iter()
        .map(|r| Rela {
            r_offset: r.offset(&image.offsets),
            r_info: (u64::from(elf_index[&r.symbol]) << 32)
                | u64::from(r.kind.elf_type(image.arch)),
            r_addend: r.addend,
        })
        .collect();

    let mut shstrtab = StrTab::new();
    let names = [
        shstrtab.intern(".text"),
        shstrtab.intern(".symtab"),
        shstrtab.intern(".strtab"),
        shstrtab.intern(".rela.text"),
        shstrtab.intern(".shstrtab"),
    ];

    let mut out = Vec::new();
    out.resize(consts::EHDR_SIZE as usize, 0);

    let text_off = out.len() as u64;
    out.extend_from_slice(&image.bytes);
    pad_to(&mut out, 8);

    let symtab_off = out.len() as u64;
    for s in &syms {
        s.write(&mut out);
    }
    let strtab_off = out.len() as u64;
    out.extend_from_slice(&strtab.data);
    pad_to(&mut out, 8);

    let rela_off = out.len() as u64;
    for r in &relas {
        r.write(&mut out);
    }
    let shstrtab_off = out.len() as u64;
    out.extend_from_slice(&shstrtab.data);
    pad_to(&mut out, 8);

    let shoff = out.len() as u64;
    Shdr::default().write(&mut out);
    Shdr {
        sh_name: names[0],
        sh_type: consts::SHT_PROGBITS,
        sh_flags: consts::SHF_ALLOC | consts::SHF_EXECINSTR,
        sh_offset: text_off,
        sh_size: image.bytes.len() as u64,
        sh_addralign: 16,
        ..Default::default()
    }
    .write(&mut out);
    Shdr {
        sh_name: names[1],
        sh_type: consts::SHT_SYMTAB,
        sh_offset: symtab_off,
        sh_size: syms.len() as u64 * consts::SYM_SIZE,
        sh_link: SHN_STRTAB,
        sh_info: first_global,
        sh_addralign: 8,
        sh_entsize: consts::SYM_SIZE,
        ..Default::default()
    }
    .write(&mut out);
    Shdr {
        sh_name: names[2],
        sh_type: consts::SHT_STRTAB,
        sh_offset: strtab_off,
        sh_size: strtab.data.len() as u64,
        sh_addralign: 1,
        ..Default::default()
    }
    .write(&mut out);
    Shdr {
        sh_name: names[3],
        sh_type: consts::SHT_RELA,
        sh_offset: rela_off,
        sh_size: relas.len() as u64 * consts::RELA_SIZE,
        sh_link: SHN_SYMTAB,
        sh_info: u32::from(SHN_TEXT),
        sh_addralign: 8,
        sh_entsize: consts::RELA_SIZE,
        ..Default::default()
    }
    .write(&mut out);
    Shdr {
        sh_name: names[4],
        sh_type: consts::SHT_STRTAB,
        sh_offset: shstrtab_off,
        sh_size: shstrtab.data.len() as u64,
        sh_addralign: 1,
        ..Default::default()
    }
    .write(&mut out);

    let mut header = Vec::with_capacity(consts::EHDR_SIZE as usize);
    Ehdr {
        e_type: consts::ET_REL,
        e_machine: machine(image.arch),
        e_entry: 0,
        e_phoff: 0,
        e_shoff: shoff,
        e_flags: elf_flags(image.arch),
        e_phnum: 0,
        e_shnum: 6,
        e_shstrndx: 5,
    }
    .write(&mut header);
    out[..consts::EHDR_SIZE as usize].copy_from_slice(&header);
    out
}

/// Write a minimal `ET_EXEC` static executable at `load_addr`.
///
/// Layout is ehdr + phdr + `.text`, then `.plt` and `.got` when any
/// relocation demanded slots; every relocation is applied in place before
/// the bytes are emitted. Entry is `_start` when defined, else `main`, else
/// the start of `.text`.
///
/// # Errors
///
/// Propagates [`reloc::apply`] failures: unresolved symbols with no GOT/PLT
/// policy, PC-relative overflow, TLS pattern mismatch.
pub fn write_executable(mut image: TextImage, load_addr: u64) -> Result<Vec<u8>, BackendError> {
    let gp = GotPlt::allocate(&image);

    let headers = consts::EHDR_SIZE + consts::PHDR_SIZE;
    let text_addr = load_addr + headers;
    let mut plt_addr = text_addr + image.bytes.len() as u64;
    plt_addr = (plt_addr + 15) & !15;
    let plt_size = if gp.plt_len() == 0 {
        0
    } else {
        (gp.plt_len() as u64 + 1) * reloc::PLT_ENTRY_SIZE
    };
    let mut got_addr = plt_addr + plt_size;
    got_addr = (got_addr + 7) & !7;
    let got_size = gp.got_len() as u64 * reloc::GOT_SLOT_SIZE;

    reloc::apply(
        &mut image,
        &gp,
        LinkAddrs {
            text: text_addr,
            got: got_addr,
            plt: plt_addr,
        },
    )?;

    let entry = ["_start", "main"]
        .iter()
        .find_map(|name| {
            let id = image.symbols.lookup(name)?;
            let sym = image.symbols.get(id);
            sym.defined.then(|| text_addr + image.offsets.get(sym.offset))
        })
        .unwrap_or(text_addr);

    let total = got_addr + got_size - load_addr;
    let mut out = Vec::with_capacity(total as usize);
    Ehdr {
        e_type: consts::ET_EXEC,
        e_machine: machine(image.arch),
        e_entry: entry,
        e_phoff: consts::EHDR_SIZE,
        e_shoff: 0,
        e_flags: elf_flags(image.arch),
        e_phnum: 1,
        e_shnum: 0,
        e_shstrndx: 0,
    }
    .write(&mut out);
    Phdr {
        p_type: consts::PT_LOAD,
        // One segment holds text and the GOT; the GOT needs W.
        p_flags: consts::PF_R | consts::PF_W | consts::PF_X,
        p_offset: 0,
        p_vaddr: load_addr,
        p_filesz: total,
        p_memsz: total,
        p_align: 0x1000,
    }
    .write(&mut out);
    out.extend_from_slice(&image.bytes);
    out.resize((plt_addr - load_addr) as usize, 0);
    if plt_size != 0 {
        out.extend_from_slice(&gp.plt_bytes(plt_addr, got_addr));
    }
    out.resize((got_addr - load_addr) as usize, 0);
    out.extend_from_slice(&gp.got_bytes(&image, text_addr));
    Ok(out)
}

/// Dispatch on [`OutputMode`].
///
/// # Errors
///
/// See [`write_executable`]; object output is infallible.
pub fn write_image(image: TextImage, mode: OutputMode) -> Result<Vec<u8>, BackendError> {
    match mode {
        OutputMode::Object => Ok(write_object(&image)),
        OutputMode::Executable => write_executable(image, consts::DEFAULT_LOAD_ADDR),
    }
}
