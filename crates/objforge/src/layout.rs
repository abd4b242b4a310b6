//! Two-pass text layout engine.
//!
//! A single forward pass emits instructions while tracking a running offset.
//! Each label definition runs a bounded backward "confirm" scan that shrinks
//! pending rel32 forward branches to rel8 and re-threads the window's
//! offsets. A final pass resolves later-defined local targets and converts
//! everything still unresolved into linker relocations plus external symbol
//! entries.
//!
//! The confirm window is deliberately bounded to 128 bytes and one label of
//! lookback. It is a conservative single-pass approximation, not a global
//! fixed point: shrinking one branch is never re-examined against a
//! different, later label. Generated sizes and offsets depend on this exact
//! bound, so it must not be widened.

use crate::encode::InstBytes;
use crate::error::BackendError;
use crate::ir::{Arch, Inst, Operand};
#[cfg(feature = "riscv")]
use crate::riscv::{self, RvFixup};
use crate::symtab::{RelocKind, Relocation, Section, SymId, SymKind, SymbolTable};
#[cfg(feature = "x86_64")]
use crate::x86;

/// Handle into an [`OffsetTable`] cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OffsetId(u32);

/// Arena of text-section offsets. Records, symbols, and relocations hold
/// [`OffsetId`] handles instead of copies, so a retroactive shrink updates
/// one cell and every holder observes the final value.
#[derive(Debug, Default)]
pub struct OffsetTable {
    cells: Vec<u64>,
}

impl OffsetTable {
    /// Allocate a new cell.
    pub fn alloc(&mut self, value: u64) -> OffsetId {
        let id = OffsetId(self.cells.len() as u32);
        self.cells.push(value);
        id
    }

    /// Read a cell.
    #[must_use]
    pub fn get(&self, id: OffsetId) -> u64 {
        self.cells[id.0 as usize]
    }

    pub(crate) fn set(&mut self, id: OffsetId, value: u64) {
        self.cells[id.0 as usize] = value;
    }
}

/// Shape of an x86-64 symbolic branch.
#[cfg(feature = "x86_64")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchForm {
    Jmp,
    /// Condition-code nibble of a `jcc`.
    Jcc(u8),
    Call,
}

#[derive(Debug)]
enum PendKind {
    /// x86-64 rel32 placeholder; `savings` is the rel32→rel8 byte gain
    /// (3 for `jmp`, 4 for `jcc`, 0 for calls which never shrink).
    #[cfg(feature = "x86_64")]
    X86Rel32 { form: BranchForm, savings: u8 },
    /// RISC-V word(s) awaiting a displacement patch.
    #[cfg(feature = "riscv")]
    Rv(RvFixup),
}

/// Unresolved symbolic reference attached to a record.
#[derive(Debug)]
struct Pending {
    symbol: String,
    kind: PendKind,
}

/// One emitted instruction: bytes plus a shared offset cell.
#[derive(Debug)]
struct TextRecord {
    offset: OffsetId,
    bytes: InstBytes,
    pending: Option<Pending>,
    /// Shrunk to rel8 during confirm; displacement filled after re-thread.
    rel8_to_label: bool,
}

/// Finished layout: sequential text bytes, symbol table, and relocations
/// ready for section placement.
#[derive(Debug)]
pub struct TextImage {
    /// Target architecture.
    pub arch: Arch,
    /// The laid-out `.text` bytes.
    pub bytes: Vec<u8>,
    /// Finalized symbol table.
    pub symbols: SymbolTable,
    /// Relocations for the ELF writer / applier.
    pub relocations: Vec<Relocation>,
    /// The offset arena the symbols and relocations point into.
    pub offsets: OffsetTable,
}

/// Per-module layout session. All mutable state lives here; independent
/// sessions can run in parallel without synchronization.
#[derive(Debug)]
pub struct TextSession {
    arch: Arch,
    offsets: OffsetTable,
    records: Vec<TextRecord>,
    symbols: SymbolTable,
    relocs: Vec<Relocation>,
    current: u64,
    /// Cell shared between labels defined at the current offset and the
    /// next record, so a re-thread moves them together.
    next_cell: Option<OffsetId>,
}

impl TextSession {
    /// Start an empty session for one module.
    #[must_use]
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            offsets: OffsetTable::default(),
            records: Vec::new(),
            symbols: SymbolTable::new(),
            relocs: Vec::new(),
            current: 0,
            next_cell: None,
        }
    }

    /// The running text offset.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.current
    }

    /// Borrow the symbol table.
    #[must_use]
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Define a label at the current offset and run the confirm scan over
    /// pending forward branches targeting it.
    ///
    /// # Errors
    ///
    /// `BackendError::DuplicateSymbol` on re-definition.
    pub fn define_label(
        &mut self,
        name: &str,
        kind: SymKind,
        local: bool,
    ) -> Result<SymId, BackendError> {
        self.confirm(name);
        let cell = self.label_cell();
        self.symbols.define(name, cell, kind, local)
    }

    /// Record a defined function symbol's size as the bytes emitted since
    /// its definition.
    pub fn end_function(&mut self, id: SymId) {
        let start = self.offsets.get(self.symbols.get(id).offset);
        let size = self.current - start;
        self.symbols.set_size(id, size);
    }

    /// Emit one instruction.
    ///
    /// # Errors
    ///
    /// Propagates selection/encoding failures; all fatal internal.
    pub fn emit(&mut self, inst: &Inst) -> Result<(), BackendError> {
        match self.arch {
            #[cfg(feature = "x86_64")]
            Arch::X86_64 => self.emit_x86(inst),
            #[cfg(feature = "riscv")]
            Arch::Rv64 => self.emit_rv64(inst),
            #[allow(unreachable_patterns)]
            _ => Err(BackendError::NoTemplate {
                mnemonic: inst.mnemonic.clone(),
                operands: String::from("architecture support compiled out"),
            }),
        }
    }

    // ── x86-64 emission ─────────────────────────────────────────────────

    #[cfg(feature = "x86_64")]
    fn emit_x86(&mut self, inst: &Inst) -> Result<(), BackendError> {
        if let Some((form, name, local)) = Self::sym_branch(inst) {
            return self.emit_x86_branch(form, name, local);
        }

        if inst.operands.iter().any(|op| matches!(op, Operand::Sym { .. })) {
            return self.emit_x86_data_ref(inst, RelocKind::Pc32);
        }

        let bytes = x86::encode_x86(inst)?;
        self.push_record(bytes, None);
        Ok(())
    }

    /// A branch/call whose single operand is a symbol.
    #[cfg(feature = "x86_64")]
    fn sym_branch(inst: &Inst) -> Option<(BranchForm, &str, bool)> {
        let form = match inst.mnemonic.as_str() {
            "jmp" => BranchForm::Jmp,
            "call" => BranchForm::Call,
            m => BranchForm::Jcc(x86::jcc_code(m)?),
        };
        match inst.operands.as_slice() {
            [Operand::Sym { name, local }] => Some((form, name, *local)),
            _ => None,
        }
    }

    #[cfg(feature = "x86_64")]
    fn emit_x86_branch(
        &mut self,
        form: BranchForm,
        name: &str,
        local: bool,
    ) -> Result<(), BackendError> {
        let defined_at = self
            .symbols
            .lookup(name)
            .map(|id| self.symbols.get(id))
            .filter(|s| s.defined && s.section == Section::Text)
            .map(|s| self.offsets.get(s.offset));

        if let Some(target) = defined_at {
            // Displacements count from the end of the branch, so the
            // instruction length is subtracted before the range test.
            let disp8 = target as i64 - (self.current as i64 + 2);
            let use_rel8 = form != BranchForm::Call && (-128..=127).contains(&disp8);
            let bytes = if use_rel8 {
                match form {
                    BranchForm::Jmp => InstBytes::from_slice(&[0xEB, disp8 as i8 as u8]),
                    BranchForm::Jcc(cc) => InstBytes::from_slice(&[0x70 + cc, disp8 as i8 as u8]),
                    BranchForm::Call => unreachable!(),
                }
            } else {
                let len = match form {
                    BranchForm::Jcc(_) => 6,
                    _ => 5,
                };
                let disp = target as i64 - (self.current as i64 + len);
                let disp32 = i32::try_from(disp).map_err(|_| BackendError::PcRelOverflow {
                    symbol: String::from(name),
                    disp,
                })?;
                let mut b = InstBytes::new();
                match form {
                    BranchForm::Jmp => b.push(0xE9),
                    BranchForm::Call => b.push(0xE8),
                    BranchForm::Jcc(cc) => {
                        b.push(0x0F);
                        b.push(0x80 + cc);
                    }
                }
                b.extend_from_slice(&disp32.to_le_bytes());
                b
            };
            self.push_record(bytes, None);
            return Ok(());
        }

        // Forward reference: rel32 zero placeholder, shrinkable for jumps.
        self.symbols.ensure(name, local, &mut self.offsets);
        let (mut bytes, savings) = match form {
            BranchForm::Jmp => (InstBytes::from_slice(&[0xE9]), 3),
            BranchForm::Call => (InstBytes::from_slice(&[0xE8]), 0),
            BranchForm::Jcc(cc) => (InstBytes::from_slice(&[0x0F, 0x80 + cc]), 4),
        };
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        self.push_record(
            bytes,
            Some(Pending {
                symbol: String::from(name),
                kind: PendKind::X86Rel32 { form, savings },
            }),
        );
        Ok(())
    }

    /// Rewrite a data-symbol operand to RIP-relative and push a text
    /// relocation against it.
    #[cfg(feature = "x86_64")]
    fn emit_x86_data_ref(
        &mut self,
        inst: &Inst,
        kind: RelocKind,
    ) -> Result<(), BackendError> {
        // The symbol slot carries no access size; take it from the integer
        // register operand when there is one (XMM and store forms use the
        // 64-bit memory shape).
        let size = inst
            .operands
            .iter()
            .find_map(|op| match op {
                Operand::Reg(r) if r.bank() == crate::ir::Bank::Int => Some(r.size),
                _ => None,
            })
            .unwrap_or(8);

        let mut rewritten = inst.clone();
        let mut sym_name = None;
        for op in &mut rewritten.operands {
            if let Operand::Sym { name, local } = op {
                sym_name = Some((name.clone(), *local));
                *op = Operand::RipRel { disp: 0, size };
            }
        }
        let (name, local) = match sym_name {
            Some(v) => v,
            None => {
                return Err(BackendError::BadEncodingRole {
                    mnemonic: inst.mnemonic.clone(),
                    position: 0,
                })
            }
        };

        let (bytes, imm_len) = x86::encode_with_imm_len(&rewritten)?;
        let site_delta = bytes.len() as u16 - u16::from(imm_len) - 4;
        // The displacement is relative to the end of the instruction, so
        // any trailing immediate widens the addend beyond the usual −4.
        let addend = -4 - i64::from(imm_len);

        let symbol = self.symbols.ensure(&name, local, &mut self.offsets);
        let cell = self.push_record(bytes, None);
        self.relocs.push(Relocation {
            symbol,
            site: cell,
            site_delta,
            addend,
            kind,
        });
        Ok(())
    }

    /// Emit the 13-byte general-dynamic TLS access sequence for `name`:
    /// `data16 lea rdi, [sym@tlsgd(%rip)]` + `call __tls_get_addr`.
    ///
    /// Two relocations are pushed: `TLSGD` against the variable and `PLT32`
    /// against `__tls_get_addr`. In executable output the applier rewrites
    /// the whole window to a `%fs`-relative load and drops the call.
    #[cfg(feature = "x86_64")]
    pub fn emit_tls_gd(&mut self, name: &str) {
        let bytes = InstBytes::from_slice(&[
            0x66, 0x48, 0x8D, 0x3D, 0, 0, 0, 0, // data16 lea rdi, [rip+0]
            0xE8, 0, 0, 0, 0, // call rel32
        ]);
        let var = self.symbols.ensure(name, false, &mut self.offsets);
        let helper = self
            .symbols
            .ensure("__tls_get_addr", false, &mut self.offsets);
        let cell = self.push_record(bytes, None);
        self.relocs.push(Relocation {
            symbol: var,
            site: cell,
            site_delta: 4,
            addend: -4,
            kind: RelocKind::TlsGd,
        });
        self.relocs.push(Relocation {
            symbol: helper,
            site: cell,
            site_delta: 9,
            addend: -4,
            kind: RelocKind::Plt32,
        });
    }

    /// Emit the 12-byte local-dynamic TLS access sequence for `name`:
    /// `lea rdi, [sym@tlsld(%rip)]` + `call __tls_get_addr`.
    ///
    /// One byte shorter than the general-dynamic form (no `data16` prefix);
    /// in executable output the applier rewrites the window to an
    /// `%fs`-relative load of the TLS block base.
    #[cfg(feature = "x86_64")]
    pub fn emit_tls_ld(&mut self, name: &str) {
        let bytes = InstBytes::from_slice(&[
            0x48, 0x8D, 0x3D, 0, 0, 0, 0, // lea rdi, [rip+0]
            0xE8, 0, 0, 0, 0, // call rel32
        ]);
        let var = self.symbols.ensure(name, false, &mut self.offsets);
        let helper = self
            .symbols
            .ensure("__tls_get_addr", false, &mut self.offsets);
        let cell = self.push_record(bytes, None);
        self.relocs.push(Relocation {
            symbol: var,
            site: cell,
            site_delta: 3,
            addend: -4,
            kind: RelocKind::TlsLd,
        });
        self.relocs.push(Relocation {
            symbol: helper,
            site: cell,
            site_delta: 8,
            addend: -4,
            kind: RelocKind::Plt32,
        });
    }

    /// Emit an instruction whose symbol operand resolves through the GOT
    /// (or another RIP-relative relocation kind) instead of a plain `PC32`.
    ///
    /// # Errors
    ///
    /// Propagates selection/encoding failures.
    #[cfg(feature = "x86_64")]
    pub fn emit_with_reloc(&mut self, inst: &Inst, kind: RelocKind) -> Result<(), BackendError> {
        self.emit_x86_data_ref(inst, kind)
    }

    // ── RISC-V emission ─────────────────────────────────────────────────

    #[cfg(feature = "riscv")]
    fn emit_rv64(&mut self, inst: &Inst) -> Result<(), BackendError> {
        let out = riscv::encode_rv64(inst)?;
        let Some((name, fixup)) = out.fixup else {
            self.push_record(out.bytes, None);
            return Ok(());
        };

        let defined_at = self
            .symbols
            .lookup(&name)
            .map(|id| self.symbols.get(id))
            .filter(|s| s.defined && s.section == Section::Text)
            .map(|s| self.offsets.get(s.offset));

        if let Some(target) = defined_at {
            let disp = target as i64 - self.current as i64;
            let bytes = Self::patch_rv(&out.bytes, fixup, disp, &name)?;
            self.push_record(bytes, None);
            return Ok(());
        }

        let local = matches!(
            inst.operands.iter().find(|op| matches!(op, Operand::Sym { .. })),
            Some(Operand::Sym { local: true, .. })
        );
        self.symbols.ensure(&name, local, &mut self.offsets);
        self.push_record(
            out.bytes,
            Some(Pending {
                symbol: name,
                kind: PendKind::Rv(fixup),
            }),
        );
        Ok(())
    }

    /// Apply a RISC-V displacement patch, range-checked per format.
    #[cfg(feature = "riscv")]
    fn patch_rv(
        bytes: &InstBytes,
        fixup: RvFixup,
        disp: i64,
        symbol: &str,
    ) -> Result<InstBytes, BackendError> {
        let overflow = |max: i64| {
            disp < -max || disp >= max
        };
        let word = |b: &[u8]| u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        let mut out = bytes.clone();
        match fixup {
            RvFixup::Branch => {
                if overflow(1 << 12) {
                    return Err(BackendError::PcRelOverflow {
                        symbol: String::from(symbol),
                        disp,
                    });
                }
                let w = riscv::patch_branch(word(bytes), disp as i32);
                out.set(&w.to_le_bytes());
            }
            RvFixup::Jal => {
                if overflow(1 << 20) {
                    return Err(BackendError::PcRelOverflow {
                        symbol: String::from(symbol),
                        disp,
                    });
                }
                let w = riscv::patch_jal(word(bytes), disp as i32);
                out.set(&w.to_le_bytes());
            }
            RvFixup::CallPair => {
                if overflow(1 << 31) {
                    return Err(BackendError::PcRelOverflow {
                        symbol: String::from(symbol),
                        disp,
                    });
                }
                let (a, j) = riscv::patch_call_pair(word(&bytes[..4]), word(&bytes[4..]), disp);
                let mut b = InstBytes::new();
                b.extend_from_slice(&a.to_le_bytes());
                b.extend_from_slice(&j.to_le_bytes());
                out = b;
            }
        }
        Ok(out)
    }

    // ── Record plumbing ─────────────────────────────────────────────────

    fn label_cell(&mut self) -> OffsetId {
        match self.next_cell {
            Some(cell) => cell,
            None => {
                let cell = self.offsets.alloc(self.current);
                self.next_cell = Some(cell);
                cell
            }
        }
    }

    fn push_record(&mut self, bytes: InstBytes, pending: Option<Pending>) -> OffsetId {
        let cell = match self.next_cell.take() {
            Some(cell) => cell,
            None => self.offsets.alloc(self.current),
        };
        self.offsets.set(cell, self.current);
        self.current += bytes.len() as u64;
        self.records.push(TextRecord {
            offset: cell,
            bytes,
            pending,
            rel8_to_label: false,
        });
        cell
    }

    // ── Confirm: bounded backward shrink scan ───────────────────────────

    /// Backward scan from the newest record while
    /// `(current − accumulated_shrink − record_offset) ≤ 128`, shrinking
    /// every pending rel32 aimed at `name` to rel8, then re-thread the
    /// window's offsets forward.
    fn confirm(&mut self, name: &str) {
        let n = self.records.len();
        let mut accumulated: i64 = 0;
        let mut k = n;
        while k > 0 {
            let rec = &self.records[k - 1];
            let rec_off = self.offsets.get(rec.offset) as i64;
            if self.current as i64 - accumulated - rec_off > 128 {
                break;
            }
            k -= 1;

            #[cfg(feature = "x86_64")]
            {
                let shrink = match &self.records[k].pending {
                    Some(Pending {
                        symbol,
                        kind: PendKind::X86Rel32 { form, savings },
                    }) if symbol == name && *savings > 0 => Some((*form, *savings)),
                    _ => None,
                };
                if let Some((form, savings)) = shrink {
                    accumulated += i64::from(savings);
                    let rec = &mut self.records[k];
                    match form {
                        BranchForm::Jmp => rec.bytes.set(&[0xEB, 0]),
                        BranchForm::Jcc(cc) => rec.bytes.set(&[0x70 + cc, 0]),
                        BranchForm::Call => {}
                    }
                    rec.pending = None;
                    rec.rel8_to_label = true;
                }
            }
        }

        if accumulated == 0 {
            return;
        }

        // Forward re-thread of the window.
        let mut running = self.offsets.get(self.records[k].offset);
        for i in k..n {
            self.offsets.set(self.records[i].offset, running);
            running += self.records[i].bytes.len() as u64;
        }
        self.current = running;

        // A label already defined at the old end of text moves with it.
        if let Some(cell) = self.next_cell {
            self.offsets.set(cell, self.current);
        }

        // Every record shrunk in this scan targets the label now being
        // defined at `current`.
        for i in k..n {
            if self.records[i].rel8_to_label {
                let off = self.offsets.get(self.records[i].offset) as i64;
                let disp = self.current as i64 - (off + 2);
                let last = self.records[i].bytes.len() - 1;
                self.records[i].bytes[last] = disp as i8 as u8;
                self.records[i].rel8_to_label = false;
            }
        }
    }

    // ── Final pass ──────────────────────────────────────────────────────

    /// Resolve remaining pendings, convert unresolved references into
    /// relocations + external symbols, and assemble the text image.
    ///
    /// # Errors
    ///
    /// `BackendError::PcRelOverflow` if a resolved displacement exceeds its
    /// field.
    pub fn finish(mut self) -> Result<TextImage, BackendError> {
        for i in 0..self.records.len() {
            let Some(pending) = self.records[i].pending.take() else {
                continue;
            };
            let id = self
                .symbols
                .ensure(&pending.symbol, false, &mut self.offsets);
            let sym = self.symbols.get(id);
            let rec_off = self.offsets.get(self.records[i].offset);
            let len = self.records[i].bytes.len() as u64;

            if sym.defined && sym.section == Section::Text {
                let target = self.offsets.get(sym.offset);
                match pending.kind {
                    #[cfg(feature = "x86_64")]
                    PendKind::X86Rel32 { .. } => {
                        let disp = target as i64 - (rec_off + len) as i64;
                        let disp32 =
                            i32::try_from(disp).map_err(|_| BackendError::PcRelOverflow {
                                symbol: pending.symbol.clone(),
                                disp,
                            })?;
                        let start = len as usize - 4;
                        self.records[i].bytes[start..]
                            .copy_from_slice(&disp32.to_le_bytes());
                    }
                    #[cfg(feature = "riscv")]
                    PendKind::Rv(fixup) => {
                        let disp = target as i64 - rec_off as i64;
                        let patched = Self::patch_rv(
                            &self.records[i].bytes,
                            fixup,
                            disp,
                            &pending.symbol,
                        )?;
                        self.records[i].bytes = patched;
                    }
                }
            } else {
                let (kind, site_delta, addend) = match pending.kind {
                    #[cfg(feature = "x86_64")]
                    PendKind::X86Rel32 { .. } => (RelocKind::Plt32, len as u16 - 4, -4i64),
                    #[cfg(feature = "riscv")]
                    PendKind::Rv(RvFixup::Branch) => (RelocKind::RvBranch, 0, 0),
                    #[cfg(feature = "riscv")]
                    PendKind::Rv(RvFixup::Jal) => (RelocKind::RvJal, 0, 0),
                    #[cfg(feature = "riscv")]
                    PendKind::Rv(RvFixup::CallPair) => (RelocKind::RvCallPlt, 0, 0),
                };
                self.relocs.push(Relocation {
                    symbol: id,
                    site: self.records[i].offset,
                    site_delta,
                    addend,
                    kind,
                });
            }
        }

        let mut bytes = Vec::with_capacity(self.current as usize);
        for rec in &self.records {
            bytes.extend_from_slice(&rec.bytes);
        }

        Ok(TextImage {
            arch: self.arch,
            bytes,
            symbols: self.symbols,
            relocations: self.relocs,
            offsets: self.offsets,
        })
    }
}
