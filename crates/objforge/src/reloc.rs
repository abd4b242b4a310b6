//! Relocation application and GOT/PLT construction.
//!
//! Given final virtual addresses, [`apply`] patches every relocation site in
//! a [`TextImage`] per its ABI formula. A policy table decides which
//! relocation kinds cause GOT/PLT slots to be allocated; PLT stub bytes are
//! architecture-fixed with one relocation-index field patched per entry.

use std::collections::BTreeMap;

use crate::error::BackendError;
use crate::layout::TextImage;
#[cfg(feature = "riscv")]
use crate::riscv;
use crate::symtab::{RelocKind, Section, SymId};

/// Whether a relocation kind demands a GOT (and possibly PLT) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotPolicy {
    /// Never indirects.
    No,
    /// Always a GOT slot, never a PLT entry.
    GotOnly,
    /// GOT+PLT slot only when the symbol is undefined in this module.
    GotIfUndefined,
    /// Always a GOT slot regardless of definedness.
    AlwaysGot,
}

/// The kind → policy lookup table.
#[must_use]
pub fn got_policy(kind: RelocKind) -> GotPolicy {
    match kind {
        RelocKind::Abs64
        | RelocKind::Abs32
        | RelocKind::Pc32
        | RelocKind::TpOff32
        | RelocKind::RvBranch
        | RelocKind::RvJal => GotPolicy::No,
        RelocKind::Plt32 | RelocKind::RvCallPlt => GotPolicy::GotIfUndefined,
        RelocKind::TlsGd | RelocKind::TlsLd => GotPolicy::GotOnly,
        RelocKind::GotPcRel | RelocKind::GotTpOff => GotPolicy::AlwaysGot,
    }
}

/// Size of one PLT entry (and of the reserved header entry).
pub const PLT_ENTRY_SIZE: u64 = 16;
/// Size of one GOT slot.
pub const GOT_SLOT_SIZE: u64 = 8;

/// GOT and PLT slot allocator, populated by scanning an image's relocations
/// through the policy table.
#[derive(Debug, Default)]
pub struct GotPlt {
    got: Vec<SymId>,
    got_index: BTreeMap<SymId, u32>,
    plt: Vec<(SymId, u32)>,
    plt_index: BTreeMap<SymId, u32>,
}

impl GotPlt {
    /// Allocate slots for every relocation in `image` that the policy table
    /// says needs one.
    #[must_use]
    pub fn allocate(image: &TextImage) -> Self {
        let mut gp = Self::default();
        for (index, reloc) in image.relocations.iter().enumerate() {
            let defined = image.symbols.get(reloc.symbol).defined;
            match got_policy(reloc.kind) {
                GotPolicy::No => {}
                GotPolicy::GotOnly | GotPolicy::AlwaysGot => {
                    gp.got_slot(reloc.symbol);
                }
                GotPolicy::GotIfUndefined => {
                    if !defined {
                        gp.got_slot(reloc.symbol);
                        gp.plt_slot(reloc.symbol, index as u32);
                    }
                }
            }
        }
        gp
    }

    /// Index of the GOT slot for `sym`, allocating on first use.
    pub fn got_slot(&mut self, sym: SymId) -> u32 {
        if let Some(&slot) = self.got_index.get(&sym) {
            return slot;
        }
        let slot = self.got.len() as u32;
        self.got.push(sym);
        self.got_index.insert(sym, slot);
        slot
    }

    /// Index of the PLT entry for `sym`, allocating on first use.
    /// `reloc_index` is baked into the entry's push field.
    pub fn plt_slot(&mut self, sym: SymId, reloc_index: u32) -> u32 {
        if let Some(&slot) = self.plt_index.get(&sym) {
            return slot;
        }
        let slot = self.plt.len() as u32;
        self.plt.push((sym, reloc_index));
        self.plt_index.insert(sym, slot);
        slot
    }

    /// Number of GOT slots.
    #[must_use]
    pub fn got_len(&self) -> usize {
        self.got.len()
    }

    /// Number of PLT entries (excluding the header entry).
    #[must_use]
    pub fn plt_len(&self) -> usize {
        self.plt.len()
    }

    /// Virtual address of a symbol's PLT entry, if it has one. Entry 0 is
    /// the reserved resolver header.
    #[must_use]
    pub fn plt_addr_of(&self, sym: SymId, plt_addr: u64) -> Option<u64> {
        self.plt_index
            .get(&sym)
            .map(|&slot| plt_addr + PLT_ENTRY_SIZE * (u64::from(slot) + 1))
    }

    /// Virtual address of a symbol's GOT slot, if it has one.
    #[must_use]
    pub fn got_addr_of(&self, sym: SymId, got_addr: u64) -> Option<u64> {
        self.got_index
            .get(&sym)
            .map(|&slot| got_addr + GOT_SLOT_SIZE * u64::from(slot))
    }

    /// GOT section contents: one 8-byte slot per symbol, holding the
    /// resolved address of defined symbols and zero for externals.
    #[must_use]
    pub fn got_bytes(&self, image: &TextImage, text_addr: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.got.len() * GOT_SLOT_SIZE as usize);
        for &sym in &self.got {
            let s = image.symbols.get(sym);
            let value = if s.defined && s.section == Section::Text {
                text_addr + image.offsets.get(s.offset)
            } else {
                0
            };
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// PLT section contents. Entry 0 is the resolver header; each following
    /// entry is the fixed 16-byte stub with its GOT displacement, relocation
    /// index, and back-jump displacement patched in:
    ///
    /// ```text
    /// ff 25 xx xx xx xx    jmp  *slot(%rip)
    /// 68 nn nn nn nn       push reloc_index
    /// e9 xx xx xx xx       jmp  plt0
    /// ```
    #[must_use]
    pub fn plt_bytes(&self, plt_addr: u64, got_addr: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.plt.len() + 1) * PLT_ENTRY_SIZE as usize);

        // Header: push 8(%got); jmp *16(%got) — resolved lazily by the
        // dynamic loader; padded to one entry.
        let got8 = (got_addr + 8) as i64 - (plt_addr + 6) as i64;
        let got16 = (got_addr + 16) as i64 - (plt_addr + 12) as i64;
        out.extend_from_slice(&[0xFF, 0x35]);
        out.extend_from_slice(&(got8 as i32).to_le_bytes());
        out.extend_from_slice(&[0xFF, 0x25]);
        out.extend_from_slice(&(got16 as i32).to_le_bytes());
        out.extend_from_slice(&[0x0F, 0x1F, 0x40, 0x00]);

        for (n, &(sym, reloc_index)) in self.plt.iter().enumerate() {
            let entry_addr = plt_addr + PLT_ENTRY_SIZE * (n as u64 + 1);
            let slot_addr = got_addr + GOT_SLOT_SIZE * u64::from(self.got_index[&sym]);
            let jmp_disp = slot_addr as i64 - (entry_addr + 6) as i64;
            let back_disp = plt_addr as i64 - (entry_addr + 16) as i64;
            out.extend_from_slice(&[0xFF, 0x25]);
            out.extend_from_slice(&(jmp_disp as i32).to_le_bytes());
            out.push(0x68);
            out.extend_from_slice(&reloc_index.to_le_bytes());
            out.push(0xE9);
            out.extend_from_slice(&(back_disp as i32).to_le_bytes());
        }
        out
    }
}

/// Section base addresses for executable patching.
#[derive(Debug, Clone, Copy)]
pub struct LinkAddrs {
    /// Virtual address of `.text`.
    pub text: u64,
    /// Virtual address of `.got`.
    pub got: u64,
    /// Virtual address of `.plt`.
    pub plt: u64,
}

/// The general-dynamic TLS access sequence the applier rewrites:
/// `data16 lea rdi, [sym@tlsgd(%rip)]` + `call __tls_get_addr`.
const TLS_GD_LEA: [u8; 4] = [0x66, 0x48, 0x8D, 0x3D];
/// Its size-preserving `%fs`-relative replacement: `mov rax, %fs:tpoff` +
/// a 4-byte nop.
const TLS_GD_SUB: [u8; 9] = [0x64, 0x48, 0x8B, 0x04, 0x25, 0x0F, 0x1F, 0x40, 0x00];

/// The local-dynamic sequence: `lea rdi, [sym@tlsld(%rip)]` + call.
const TLS_LD_LEA: [u8; 3] = [0x48, 0x8D, 0x3D];
/// Replacement: `mov rax, %fs:0` widened with 66 prefixes to 12 bytes.
const TLS_LD_SUB: [u8; 12] = [
    0x66, 0x66, 0x66, 0x64, 0x48, 0x8B, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00,
];

/// Patch every relocation site in `image` with final virtual addresses.
/// TLS general/local-dynamic sites are rewritten by byte-pattern
/// match-and-replace; a mismatch is fatal.
///
/// # Errors
///
/// `PcRelOverflow` when a 32-bit PC-relative result exceeds signed 32 bits,
/// `TlsPatternMismatch` when a TLS site does not carry the documented
/// sequence, `UndefinedSymbol` when no policy covers an unresolved symbol.
pub fn apply(image: &mut TextImage, gp: &GotPlt, addrs: LinkAddrs) -> Result<(), BackendError> {
    // TLS rewrites first; relocation sites swallowed by a rewritten window
    // (the call to __tls_get_addr) must not be patched afterwards.
    let mut rewritten: Vec<(u64, u64)> = Vec::new();

    for i in 0..image.relocations.len() {
        let reloc = image.relocations[i].clone();
        let site = reloc.offset(&image.offsets);
        match reloc.kind {
            RelocKind::TlsGd => {
                let start = site as usize - 4;
                let window = &mut image.bytes[start..start + 13];
                if window[..4] != TLS_GD_LEA || window[8] != 0xE8 {
                    return Err(BackendError::TlsPatternMismatch {
                        symbol: image.symbols.get(reloc.symbol).name.clone(),
                        offset: site,
                    });
                }
                let tpoff = image.offsets.get(image.symbols.get(reloc.symbol).offset) as u32;
                window[..5].copy_from_slice(&TLS_GD_SUB[..5]);
                window[5..9].copy_from_slice(&tpoff.to_le_bytes());
                window[9..].copy_from_slice(&TLS_GD_SUB[5..]);
                rewritten.push((start as u64, start as u64 + 13));
            }
            RelocKind::TlsLd => {
                let start = site as usize - 3;
                let window = &mut image.bytes[start..start + 12];
                if window[..3] != TLS_LD_LEA || window[7] != 0xE8 {
                    return Err(BackendError::TlsPatternMismatch {
                        symbol: image.symbols.get(reloc.symbol).name.clone(),
                        offset: site,
                    });
                }
                window.copy_from_slice(&TLS_LD_SUB);
                rewritten.push((start as u64, start as u64 + 12));
            }
            _ => {}
        }
    }

    for i in 0..image.relocations.len() {
        let reloc = image.relocations[i].clone();
        if matches!(reloc.kind, RelocKind::TlsGd | RelocKind::TlsLd) {
            continue;
        }
        let site = reloc.offset(&image.offsets);
        if rewritten.iter().any(|&(lo, hi)| site >= lo && site < hi) {
            continue;
        }

        let sym = image.symbols.get(reloc.symbol);
        let name = sym.name.clone();
        let value = if sym.defined && sym.section == Section::Text {
            addrs.text + image.offsets.get(sym.offset)
        } else if let Some(addr) = gp.plt_addr_of(reloc.symbol, addrs.plt) {
            addr
        } else if matches!(reloc.kind, RelocKind::GotPcRel | RelocKind::GotTpOff) {
            // The slot address is what gets patched; resolution happens
            // through the slot contents.
            0
        } else {
            return Err(BackendError::UndefinedSymbol { name });
        };

        let p = addrs.text + site;
        match reloc.kind {
            RelocKind::Abs64 => {
                let v = (value as i64 + reloc.addend) as u64;
                patch8(&mut image.bytes, site, v);
            }
            RelocKind::Abs32 => {
                let v = (value as i64 + reloc.addend) as u64 as u32;
                patch4(&mut image.bytes, site, v);
            }
            RelocKind::Pc32 | RelocKind::Plt32 => {
                let disp = value as i64 + reloc.addend - p as i64;
                let disp32 = checked32(disp, &name)?;
                patch4(&mut image.bytes, site, disp32 as u32);
            }
            RelocKind::GotPcRel | RelocKind::GotTpOff => {
                let slot = gp
                    .got_addr_of(reloc.symbol, addrs.got)
                    .ok_or_else(|| BackendError::UndefinedSymbol { name: name.clone() })?;
                let disp = slot as i64 + reloc.addend - p as i64;
                let disp32 = checked32(disp, &name)?;
                patch4(&mut image.bytes, site, disp32 as u32);
            }
            RelocKind::TpOff32 => {
                let v = (value as i64 + reloc.addend) as u64 as u32;
                patch4(&mut image.bytes, site, v);
            }
            #[cfg(feature = "riscv")]
            RelocKind::RvBranch | RelocKind::RvJal | RelocKind::RvCallPlt => {
                apply_rv(image, reloc.kind, site, value, p, &name)?;
            }
            #[cfg(not(feature = "riscv"))]
            RelocKind::RvBranch | RelocKind::RvJal | RelocKind::RvCallPlt => {
                return Err(BackendError::UndefinedSymbol { name });
            }
            RelocKind::TlsGd | RelocKind::TlsLd => unreachable!(),
        }
    }
    Ok(())
}

#[cfg(feature = "riscv")]
fn apply_rv(
    image: &mut TextImage,
    kind: RelocKind,
    site: u64,
    value: u64,
    p: u64,
    name: &str,
) -> Result<(), BackendError> {
    let disp = value as i64 - p as i64;
    let s = site as usize;
    let word = |b: &[u8]| u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    match kind {
        RelocKind::RvBranch => {
            if disp < -(1 << 12) || disp >= 1 << 12 {
                return Err(BackendError::PcRelOverflow {
                    symbol: String::from(name),
                    disp,
                });
            }
            let w = riscv::patch_branch(word(&image.bytes[s..]), disp as i32);
            image.bytes[s..s + 4].copy_from_slice(&w.to_le_bytes());
        }
        RelocKind::RvJal => {
            if disp < -(1 << 20) || disp >= 1 << 20 {
                return Err(BackendError::PcRelOverflow {
                    symbol: String::from(name),
                    disp,
                });
            }
            let w = riscv::patch_jal(word(&image.bytes[s..]), disp as i32);
            image.bytes[s..s + 4].copy_from_slice(&w.to_le_bytes());
        }
        RelocKind::RvCallPlt => {
            let disp32 = checked32(disp, name)?;
            let (a, j) = riscv::patch_call_pair(
                word(&image.bytes[s..]),
                word(&image.bytes[s + 4..]),
                i64::from(disp32),
            );
            image.bytes[s..s + 4].copy_from_slice(&a.to_le_bytes());
            image.bytes[s + 4..s + 8].copy_from_slice(&j.to_le_bytes());
        }
        _ => {}
    }
    Ok(())
}

fn checked32(disp: i64, symbol: &str) -> Result<i32, BackendError> {
    i32::try_from(disp).map_err(|_| BackendError::PcRelOverflow {
        symbol: String::from(symbol),
        disp,
    })
}

fn patch4(bytes: &mut [u8], site: u64, value: u32) {
    let s = site as usize;
    bytes[s..s + 4].copy_from_slice(&value.to_le_bytes());
}

fn patch8(bytes: &mut [u8], site: u64, value: u64) {
    let s = site as usize;
    bytes[s..s + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_table() {
        assert_eq!(got_policy(RelocKind::Pc32), GotPolicy::No);
        assert_eq!(got_policy(RelocKind::Abs64), GotPolicy::No);
        assert_eq!(got_policy(RelocKind::Plt32), GotPolicy::GotIfUndefined);
        assert_eq!(got_policy(RelocKind::GotPcRel), GotPolicy::AlwaysGot);
        assert_eq!(got_policy(RelocKind::GotTpOff), GotPolicy::AlwaysGot);
        assert_eq!(got_policy(RelocKind::TlsGd), GotPolicy::GotOnly);
        assert_eq!(got_policy(RelocKind::RvCallPlt), GotPolicy::GotIfUndefined);
    }

    #[test]
    fn slots_are_deduplicated() {
        let mut gp = GotPlt::default();
        let a = SymId(0);
        let b = SymId(1);
        assert_eq!(gp.got_slot(a), 0);
        assert_eq!(gp.got_slot(b), 1);
        assert_eq!(gp.got_slot(a), 0);
        assert_eq!(gp.plt_slot(a, 5), 0);
        assert_eq!(gp.plt_slot(a, 9), 0);
        assert_eq!(gp.got_len(), 2);
        assert_eq!(gp.plt_len(), 1);
    }

    #[test]
    fn plt_entry_layout() {
        let mut gp = GotPlt::default();
        let sym = SymId(0);
        gp.got_slot(sym);
        gp.plt_slot(sym, 7);
        let plt_addr = 0x1000;
        let got_addr = 0x2000;
        let bytes = gp.plt_bytes(plt_addr, got_addr);
        assert_eq!(bytes.len(), 32);
        // Entry 1 at 0x1010: jmp *slot0, push 7, jmp plt0.
        let entry = &bytes[16..];
        assert_eq!(entry[..2], [0xFF, 0x25]);
        let jmp_disp = i32::from_le_bytes([entry[2], entry[3], entry[4], entry[5]]);
        assert_eq!(jmp_disp as i64, 0x2000 - (0x1010 + 6));
        assert_eq!(entry[6], 0x68);
        assert_eq!(u32::from_le_bytes([entry[7], entry[8], entry[9], entry[10]]), 7);
        assert_eq!(entry[11], 0xE9);
        let back = i32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]]);
        assert_eq!(back as i64, 0x1000 - (0x1010 + 16));
    }
}
