//! Symbol table and relocation records.
//!
//! Symbols and relocations never store absolute offsets directly; they hold
//! [`OffsetId`] handles into the session's offset arena, so a retroactive
//! branch shrink updates one cell and every holder sees the final value.

use crate::ir::Arch;
use crate::layout::{OffsetId, OffsetTable};
use crate::error::BackendError;

use std::collections::BTreeMap;

/// Section a symbol is defined in (or [`Section::Undef`] for externals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Section {
    /// The laid-out `.text` section.
    Text,
    /// Not defined in this module; resolved by the linker.
    Undef,
}

/// ELF symbol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SymKind {
    /// `STT_FUNC`.
    Func,
    /// `STT_OBJECT`.
    Object,
}

/// Index of a symbol within a [`SymbolTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SymId(pub(crate) u32);

/// One symbol table entry.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Symbol {
    /// Symbol name.
    pub name: String,
    /// Defining section.
    pub section: Section,
    /// Offset cell within the defining section.
    pub offset: OffsetId,
    /// Size in bytes (0 when unknown).
    pub size: u64,
    /// ELF symbol type.
    pub kind: SymKind,
    /// `STB_LOCAL` vs `STB_GLOBAL` binding.
    pub local: bool,
    /// Whether the symbol has been defined in this session.
    pub defined: bool,
}

/// Per-session symbol table. Insertion is lookup-before-insert: a name is
/// entered exactly once, first as a placeholder if referenced before its
/// definition.
#[derive(Debug, Default)]
pub struct SymbolTable {
    syms: Vec<Symbol>,
    index: BTreeMap<String, SymId>,
}

impl SymbolTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a symbol by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<SymId> {
        self.index.get(name).copied()
    }

    /// Fetch a symbol by id.
    #[must_use]
    pub fn get(&self, id: SymId) -> &Symbol {
        &self.syms[id.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, id: SymId) -> &mut Symbol {
        &mut self.syms[id.0 as usize]
    }

    /// Ensure a placeholder entry exists for `name`, creating an undefined
    /// external if it was never seen.
    pub fn ensure(&mut self, name: &str, local: bool, offsets: &mut OffsetTable) -> SymId {
        if let Some(id) = self.lookup(name) {
            return id;
        }
        let id = SymId(self.syms.len() as u32);
        self.syms.push(Symbol {
            name: String::from(name),
            section: Section::Undef,
            offset: offsets.alloc(0),
            size: 0,
            kind: SymKind::Func,
            local,
            defined: false,
        });
        self.index.insert(String::from(name), id);
        id
    }

    /// Define `name` at `offset` in `.text`. An earlier placeholder is
    /// upgraded in place.
    ///
    /// # Errors
    ///
    /// `BackendError::DuplicateSymbol` if the name was already defined.
    pub fn define(
        &mut self,
        name: &str,
        offset: OffsetId,
        kind: SymKind,
        local: bool,
    ) -> Result<SymId, BackendError> {
        if let Some(id) = self.lookup(name) {
            let sym = self.get_mut(id);
            if sym.defined {
                return Err(BackendError::DuplicateSymbol {
                    name: String::from(name),
                });
            }
            sym.section = Section::Text;
            sym.offset = offset;
            sym.kind = kind;
            sym.local = local;
            sym.defined = true;
            return Ok(id);
        }
        let id = SymId(self.syms.len() as u32);
        self.syms.push(Symbol {
            name: String::from(name),
            section: Section::Text,
            offset,
            size: 0,
            kind,
            local,
            defined: true,
        });
        self.index.insert(String::from(name), id);
        Ok(id)
    }

    /// Set a defined symbol's size.
    pub fn set_size(&mut self, id: SymId, size: u64) {
        self.get_mut(id).size = size;
    }

    /// Iterate all symbols in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (SymId, &Symbol)> {
        self.syms
            .iter()
            .enumerate()
            .map(|(i, s)| (SymId(i as u32), s))
    }

    /// Number of symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.syms.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }
}

/// Relocation kind, architecture-neutral on the Rust side; [`elf_type`]
/// maps to the ABI numbers.
///
/// [`elf_type`]: RelocKind::elf_type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RelocKind {
    /// `R_X86_64_64` — absolute 64-bit.
    Abs64,
    /// `R_X86_64_32` — absolute 32-bit, zero-extended.
    Abs32,
    /// `R_X86_64_PC32` — 32-bit PC-relative.
    Pc32,
    /// `R_X86_64_PLT32` — PC-relative through the PLT.
    Plt32,
    /// `R_X86_64_GOTPCREL` — PC-relative GOT slot address.
    GotPcRel,
    /// `R_X86_64_TLSGD` — general-dynamic TLS sequence.
    TlsGd,
    /// `R_X86_64_TLSLD` — local-dynamic TLS sequence.
    TlsLd,
    /// `R_X86_64_GOTTPOFF` — initial-exec TLS offset via GOT.
    GotTpOff,
    /// `R_X86_64_TPOFF32` — local-exec TLS offset.
    TpOff32,
    /// `R_RISCV_BRANCH` — 12-bit B-type displacement.
    RvBranch,
    /// `R_RISCV_JAL` — 20-bit J-type displacement.
    RvJal,
    /// `R_RISCV_CALL_PLT` — `auipc`+`jalr` pair.
    RvCallPlt,
}

impl RelocKind {
    /// The ELF `r_type` value for this kind on the given architecture.
    #[must_use]
    pub fn elf_type(self, arch: Arch) -> u32 {
        match (arch, self) {
            (Arch::X86_64, RelocKind::Abs64) => 1,
            (Arch::X86_64, RelocKind::Pc32) => 2,
            (Arch::X86_64, RelocKind::Plt32) => 4,
            (Arch::X86_64, RelocKind::GotPcRel) => 9,
            (Arch::X86_64, RelocKind::Abs32) => 10,
            (Arch::X86_64, RelocKind::TlsGd) => 19,
            (Arch::X86_64, RelocKind::TlsLd) => 20,
            (Arch::X86_64, RelocKind::GotTpOff) => 22,
            (Arch::X86_64, RelocKind::TpOff32) => 23,
            (Arch::Rv64, RelocKind::RvBranch) => 16,
            (Arch::Rv64, RelocKind::RvJal) => 17,
            (Arch::Rv64, RelocKind::RvCallPlt) => 19,
            // A kind from the other architecture is a builder bug; emit the
            // reserved "none" type rather than a wrong one.
            _ => 0,
        }
    }

    /// Whether the patched field is PC-relative (used for the signed-32
    /// overflow check).
    #[must_use]
    pub fn pc_relative(self) -> bool {
        !matches!(self, RelocKind::Abs64 | RelocKind::Abs32 | RelocKind::TpOff32)
    }
}

/// One pending relocation against a patch site in `.text`.
///
/// The site is addressed as a record's offset cell plus a byte delta into
/// that record, so re-threading record offsets moves every site with it.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Relocation {
    /// Target symbol.
    pub symbol: SymId,
    /// Offset cell of the record containing the patch site.
    pub site: OffsetId,
    /// Byte offset of the patch site within its record.
    pub site_delta: u16,
    /// Relocation addend.
    pub addend: i64,
    /// Relocation kind.
    pub kind: RelocKind,
}

impl Relocation {
    /// Absolute patch-site offset within `.text`.
    #[must_use]
    pub fn offset(&self, offsets: &OffsetTable) -> u64 {
        offsets.get(self.site) + u64::from(self.site_delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_then_define_upgrades_in_place() {
        let mut offsets = OffsetTable::default();
        let mut tab = SymbolTable::new();
        let a = tab.ensure("foo", false, &mut offsets);
        assert!(!tab.get(a).defined);
        assert_eq!(tab.get(a).section, Section::Undef);

        let cell = offsets.alloc(0x40);
        let b = tab.define("foo", cell, SymKind::Func, true).unwrap();
        assert_eq!(a, b);
        assert!(tab.get(b).defined);
        assert_eq!(tab.get(b).section, Section::Text);
        assert_eq!(tab.len(), 1);
    }

    #[test]
    fn duplicate_definition_is_fatal() {
        let mut offsets = OffsetTable::default();
        let mut tab = SymbolTable::new();
        let cell = offsets.alloc(0);
        tab.define("main", cell, SymKind::Func, false).unwrap();
        let err = tab.define("main", cell, SymKind::Func, false).unwrap_err();
        assert!(matches!(err, BackendError::DuplicateSymbol { .. }));
    }

    #[test]
    fn elf_type_numbers() {
        assert_eq!(RelocKind::Abs64.elf_type(Arch::X86_64), 1);
        assert_eq!(RelocKind::Pc32.elf_type(Arch::X86_64), 2);
        assert_eq!(RelocKind::Plt32.elf_type(Arch::X86_64), 4);
        assert_eq!(RelocKind::GotPcRel.elf_type(Arch::X86_64), 9);
        assert_eq!(RelocKind::TlsGd.elf_type(Arch::X86_64), 19);
        assert_eq!(RelocKind::GotTpOff.elf_type(Arch::X86_64), 22);
        assert_eq!(RelocKind::RvBranch.elf_type(Arch::Rv64), 16);
        assert_eq!(RelocKind::RvCallPlt.elf_type(Arch::Rv64), 19);
    }

    #[test]
    fn relocation_offset_follows_its_cell() {
        let mut offsets = OffsetTable::default();
        let cell = offsets.alloc(0x100);
        let reloc = Relocation {
            symbol: SymId(0),
            site: cell,
            site_delta: 3,
            addend: -4,
            kind: RelocKind::Pc32,
        };
        assert_eq!(reloc.offset(&offsets), 0x103);
        offsets.set(cell, 0xFD);
        assert_eq!(reloc.offset(&offsets), 0x100);
    }
}
