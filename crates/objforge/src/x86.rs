//! x86-64 byte encoder.
//!
//! Expands a selected [`Template`] plus concrete operands into
//! REX/VEX/ModRM/SIB/displacement/immediate bytes. The in-progress encoding
//! lives in an [`InstFormat`], created fresh per instruction and consumed
//! into an [`InstBytes`] buffer.

use crate::catalog::{imm_width, Role, Template, TplExt, VexMap};
use crate::encode::InstBytes;
use crate::error::BackendError;
use crate::ir::{Inst, Operand, Reg};
use crate::select::select;

// ─── InstFormat ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct RexByte {
    w: bool,
    r: bool,
    x: bool,
    b: bool,
    /// Emit the byte even with all bits clear (SPL/BPL/SIL/DIL access).
    forced: bool,
}

impl RexByte {
    /// REX = `0100_WRXB`.
    fn byte(self) -> u8 {
        0x40 | (u8::from(self.w) << 3)
            | (u8::from(self.r) << 2)
            | (u8::from(self.x) << 1)
            | u8::from(self.b)
    }

    fn needed(self) -> bool {
        self.w || self.r || self.x || self.b || self.forced
    }
}

#[derive(Debug, Clone, Copy)]
struct VexBytes {
    map: VexMap,
    pp: u8,
    w: bool,
    l: bool,
    r: bool,
    x: bool,
    b: bool,
    /// Source register index; emitted as its ones' complement.
    vvvv: u8,
}

#[derive(Debug, Clone, Copy, Default)]
struct ModRmByte {
    mod_: u8,
    reg: u8,
    rm: u8,
}

impl ModRmByte {
    fn byte(self) -> u8 {
        (self.mod_ << 6) | ((self.reg & 7) << 3) | (self.rm & 7)
    }
}

#[derive(Debug, Clone, Copy)]
struct SibByte {
    scale: u8,
    index: u8,
    base: u8,
}

impl SibByte {
    fn byte(self) -> u8 {
        let ss: u8 = match self.scale {
            2 => 1,
            4 => 2,
            8 => 3,
            _ => 0,
        };
        (ss << 6) | ((self.index & 7) << 3) | (self.base & 7)
    }
}

/// In-progress encoding of one instruction. Created fresh per instruction,
/// consumed into an [`InstBytes`], then discarded.
#[derive(Debug, Default)]
struct InstFormat {
    prefix: Option<u8>,
    rex: Option<RexByte>,
    vex: Option<VexBytes>,
    modrm: Option<ModRmByte>,
    sib: Option<SibByte>,
    disp: ([u8; 8], u8),
    imm: ([u8; 8], u8),
    /// Register index folded into the last opcode byte (`B8+r`).
    opcode_reg: Option<u8>,
}

impl InstFormat {
    fn rex_mut(&mut self) -> &mut RexByte {
        self.rex.get_or_insert_with(RexByte::default)
    }

    fn modrm_mut(&mut self) -> &mut ModRmByte {
        self.modrm.get_or_insert_with(ModRmByte::default)
    }

    fn push_disp(&mut self, bytes: &[u8]) {
        let start = self.disp.1 as usize;
        self.disp.0[start..start + bytes.len()].copy_from_slice(bytes);
        self.disp.1 += bytes.len() as u8;
    }

    fn push_imm(&mut self, bytes: &[u8]) {
        let start = self.imm.1 as usize;
        self.imm.0[start..start + bytes.len()].copy_from_slice(bytes);
        self.imm.1 += bytes.len() as u8;
    }

    /// Record an extension bit on whichever prefix record is live.
    fn set_ext_r(&mut self, on: bool) {
        if let Some(v) = self.vex.as_mut() {
            v.r = v.r || on;
        } else if on {
            self.rex_mut().r = true;
        }
    }

    fn set_ext_x(&mut self, on: bool) {
        if let Some(v) = self.vex.as_mut() {
            v.x = v.x || on;
        } else if on {
            self.rex_mut().x = true;
        }
    }

    fn set_ext_b(&mut self, on: bool) {
        if let Some(v) = self.vex.as_mut() {
            v.b = v.b || on;
        } else if on {
            self.rex_mut().b = true;
        }
    }

    /// Consume the format into final bytes.
    ///
    /// Fixed order: `[legacy prefix?] [VEX?] [REX?] [opcode 1–3B] [ModRM?]
    /// [SIB?] [disp] [imm]`.
    fn emit(self, opcode: &[u8], buf: &mut InstBytes) {
        if let Some(p) = self.prefix {
            buf.push(p);
        }
        if let Some(v) = self.vex {
            let inv_vvvv = (!v.vvvv) & 0xF;
            let two_byte = !v.x && !v.b && !v.w && v.map == VexMap::M0F;
            if two_byte {
                buf.push(0xC5);
                buf.push(
                    (u8::from(!v.r) << 7) | (inv_vvvv << 3) | (u8::from(v.l) << 2) | v.pp,
                );
            } else {
                buf.push(0xC4);
                buf.push(
                    (u8::from(!v.r) << 7)
                        | (u8::from(!v.x) << 6)
                        | (u8::from(!v.b) << 5)
                        | v.map.mmmmm(),
                );
                buf.push((u8::from(v.w) << 7) | (inv_vvvv << 3) | (u8::from(v.l) << 2) | v.pp);
            }
        } else if let Some(r) = self.rex {
            if r.needed() {
                buf.push(r.byte());
            }
        }
        for (i, &b) in opcode.iter().enumerate() {
            if i == opcode.len() - 1 {
                buf.push(b + self.opcode_reg.unwrap_or(0));
            } else {
                buf.push(b);
            }
        }
        if let Some(m) = self.modrm {
            buf.push(m.byte());
        }
        if let Some(s) = self.sib {
            buf.push(s.byte());
        }
        buf.extend_from_slice(&self.disp.0[..self.disp.1 as usize]);
        buf.extend_from_slice(&self.imm.0[..self.imm.1 as usize]);
    }
}

// ─── Operand binding ────────────────────────────────────────────────────

/// Bind a memory operand into ModRM/SIB/displacement fields.
///
/// Two mandatory ISA quirks live here:
/// - `rm=101` with `mod=00` means RIP-relative, so RBP/R13 as a plain
///   indirect base is upgraded to `mod=01` with an explicit zero disp8;
/// - `rm=100` always introduces a SIB byte, so RSP/R12 as a base can never
///   be encoded directly in the rm field.
fn bind_mem(fmt: &mut InstFormat, mnemonic: &str, op: &Operand) -> Result<(), BackendError> {
    match *op {
        Operand::Indirect { base, .. } => {
            fmt.set_ext_b(base.index >= 8);
            if base.low3() == 4 {
                // RSP/R12: force SIB with no index.
                fmt.modrm_mut().mod_ = 0b00;
                fmt.modrm_mut().rm = 0b100;
                fmt.sib = Some(SibByte {
                    scale: 1,
                    index: 0b100,
                    base: base.low3(),
                });
            } else if base.low3() == 5 {
                // RBP/R13: mod=00 rm=101 would read as RIP-relative.
                fmt.modrm_mut().mod_ = 0b01;
                fmt.modrm_mut().rm = base.low3();
                fmt.push_disp(&[0]);
            } else {
                fmt.modrm_mut().mod_ = 0b00;
                fmt.modrm_mut().rm = base.low3();
            }
        }
        Operand::BaseDisp { base, disp, .. } => {
            fmt.set_ext_b(base.index >= 8);
            let (mod_, short) = if disp == 0 && base.low3() != 5 {
                (0b00, None)
            } else if (-128..=127).contains(&disp) {
                (0b01, Some(disp as i8))
            } else {
                (0b10, None)
            };
            fmt.modrm_mut().mod_ = mod_;
            if base.low3() == 4 {
                fmt.modrm_mut().rm = 0b100;
                fmt.sib = Some(SibByte {
                    scale: 1,
                    index: 0b100,
                    base: base.low3(),
                });
            } else {
                fmt.modrm_mut().rm = base.low3();
            }
            match (mod_, short) {
                (0b01, Some(d)) => fmt.push_disp(&[d as u8]),
                (0b10, _) => fmt.push_disp(&disp.to_le_bytes()),
                _ => {}
            }
        }
        Operand::RipRel { disp, .. } => {
            fmt.modrm_mut().mod_ = 0b00;
            fmt.modrm_mut().rm = 0b101;
            fmt.push_disp(&disp.to_le_bytes());
        }
        Operand::Sib {
            base,
            index,
            scale,
            disp,
            ..
        } => {
            // RSP can never be an index (the encoding means "no index").
            if index.low3() == 4 && index.index < 8 {
                return Err(BackendError::BadEncodingRole {
                    mnemonic: String::from(mnemonic),
                    position: 0,
                });
            }
            fmt.set_ext_b(base.index >= 8);
            fmt.set_ext_x(index.index >= 8);
            let (mod_, short) = if disp == 0 && base.low3() != 5 {
                (0b00, None)
            } else if (-128..=127).contains(&disp) {
                (0b01, Some(disp as i8))
            } else {
                (0b10, None)
            };
            fmt.modrm_mut().mod_ = mod_;
            fmt.modrm_mut().rm = 0b100;
            fmt.sib = Some(SibByte {
                scale,
                index: index.low3(),
                base: base.low3(),
            });
            match (mod_, short) {
                (0b01, Some(d)) => fmt.push_disp(&[d as u8]),
                (0b10, _) => fmt.push_disp(&disp.to_le_bytes()),
                _ => {}
            }
        }
        _ => {
            return Err(BackendError::BadEncodingRole {
                mnemonic: String::from(mnemonic),
                position: 0,
            })
        }
    }
    Ok(())
}

fn bind_reg_rex(fmt: &mut InstFormat, r: Reg) {
    if r.requires_rex() && r.index < 8 {
        fmt.rex_mut().forced = true;
    }
}

/// Check an immediate fits the template's slot width.
///
/// When the operand's declared width matches the slot, the slot's full
/// unsigned range is accepted: the bit pattern lands in a field of the same
/// size. A wider operand bound to a narrower slot is sign-extended by the
/// CPU, so only the slot's signed range survives; `cmp rbx, 0xFFFF_FFFF`
/// through an imm32 slot would execute as `cmp rbx, -1`.
fn check_imm_fits(mnemonic: &str, value: i64, slot: u8, declared: u8) -> Result<(), BackendError> {
    let (min, max) = match slot {
        1 => (i64::from(i8::MIN), i64::from(u8::MAX)),
        2 => (i64::from(i16::MIN), i64::from(u16::MAX)),
        4 => (i64::from(i32::MIN), i64::from(u32::MAX)),
        _ => return Ok(()),
    };
    let max = if declared > slot {
        match slot {
            1 => i64::from(i8::MAX),
            2 => i64::from(i16::MAX),
            _ => i64::from(i32::MAX),
        }
    } else {
        max
    };
    if value < min || value > max {
        return Err(BackendError::ImmediateOverflow {
            mnemonic: String::from(mnemonic),
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Encode one selected template with its concrete operands.
///
/// # Errors
///
/// Fatal internal errors only: an operand that cannot be bound to its role,
/// an immediate that does not fit its slot, or a high-byte/REX conflict that
/// slipped past selection.
pub fn encode_template(tpl: &Template, inst: &Inst) -> Result<InstBytes, BackendError> {
    let mut fmt = InstFormat {
        prefix: tpl.prefix,
        ..InstFormat::default()
    };

    // Apply extensions in template order.
    for ext in tpl.exts {
        match *ext {
            TplExt::Slash(n) => fmt.modrm_mut().reg = n,
            TplExt::Rex => {
                // REX available on demand; the record is allocated lazily
                // when an operand actually sets a bit.
            }
            TplExt::RexW => fmt.rex_mut().w = true,
            TplExt::Vex { map, pp, w, l } => {
                fmt.vex = Some(VexBytes {
                    map,
                    pp,
                    w,
                    l,
                    r: false,
                    x: false,
                    b: false,
                    vvvv: 0,
                });
            }
        }
    }

    let mut high_byte_used = false;

    for (pos, (slot, op)) in tpl.operands.iter().zip(inst.operands.iter()).enumerate() {
        match slot.role {
            Role::Reg => {
                let Operand::Reg(r) = op else {
                    return Err(BackendError::BadEncodingRole {
                        mnemonic: inst.mnemonic.clone(),
                        position: pos,
                    });
                };
                fmt.modrm_mut().reg = r.low3();
                fmt.set_ext_r(r.index >= 8);
                bind_reg_rex(&mut fmt, *r);
                high_byte_used |= r.is_high_byte();
            }
            Role::ModRm => match op {
                Operand::Reg(r) => {
                    fmt.modrm_mut().mod_ = 0b11;
                    fmt.modrm_mut().rm = r.low3();
                    fmt.set_ext_b(r.index >= 8);
                    bind_reg_rex(&mut fmt, *r);
                    high_byte_used |= r.is_high_byte();
                }
                mem => bind_mem(&mut fmt, &inst.mnemonic, mem)?,
            },
            Role::OpcodeReg => {
                let Operand::Reg(r) = op else {
                    return Err(BackendError::BadEncodingRole {
                        mnemonic: inst.mnemonic.clone(),
                        position: pos,
                    });
                };
                fmt.opcode_reg = Some(r.low3());
                fmt.set_ext_b(r.index >= 8);
                bind_reg_rex(&mut fmt, *r);
            }
            Role::Vvvv => {
                let Operand::Reg(r) = op else {
                    return Err(BackendError::BadEncodingRole {
                        mnemonic: inst.mnemonic.clone(),
                        position: pos,
                    });
                };
                if let Some(v) = fmt.vex.as_mut() {
                    v.vvvv = r.index;
                } else {
                    return Err(BackendError::BadEncodingRole {
                        mnemonic: inst.mnemonic.clone(),
                        position: pos,
                    });
                }
            }
            Role::Imm => {
                let Operand::Imm { width: declared, value } = op else {
                    return Err(BackendError::BadEncodingRole {
                        mnemonic: inst.mnemonic.clone(),
                        position: pos,
                    });
                };
                let width = imm_width(slot.class).ok_or_else(|| BackendError::BadEncodingRole {
                    mnemonic: inst.mnemonic.clone(),
                    position: pos,
                })?;
                check_imm_fits(&inst.mnemonic, *value, width, *declared)?;
                let le = value.to_le_bytes();
                fmt.push_imm(&le[..width as usize]);
            }
            Role::Implicit => {}
        }
    }

    // Selection already filters this; the encoder re-checks because a
    // violated invariant here produces silently wrong bytes, not an error.
    if high_byte_used {
        if let Some(r) = fmt.rex {
            if r.needed() {
                return Err(BackendError::HighByteRexConflict {
                    mnemonic: inst.mnemonic.clone(),
                });
            }
        }
    }

    let mut buf = InstBytes::new();
    fmt.emit(tpl.opcode, &mut buf);
    Ok(buf)
}

/// Select and encode a single non-branch x86-64 instruction.
///
/// # Errors
///
/// Propagates selection and encoding failures (all fatal internal).
pub fn encode_x86(inst: &Inst) -> Result<InstBytes, BackendError> {
    let tpl = select(inst)?;
    encode_template(tpl, inst)
}

/// Encode plus the byte length of the trailing immediate field. The layout
/// engine needs it to locate a RIP-relative patch site, which sits before
/// any immediate bytes.
pub(crate) fn encode_with_imm_len(inst: &Inst) -> Result<(InstBytes, u8), BackendError> {
    let tpl = select(inst)?;
    let bytes = encode_template(tpl, inst)?;
    let imm_len = tpl
        .operands
        .iter()
        .filter(|o| matches!(o.role, Role::Imm))
        .filter_map(|o| imm_width(o.class))
        .sum();
    Ok((bytes, imm_len))
}

/// Condition-code nibble for a `jcc` mnemonic, if it is one.
#[must_use]
pub(crate) fn jcc_code(mnemonic: &str) -> Option<u8> {
    Some(match mnemonic {
        "jo" => 0x0,
        "jno" => 0x1,
        "jb" | "jc" => 0x2,
        "jae" | "jnb" => 0x3,
        "je" | "jz" => 0x4,
        "jne" | "jnz" => 0x5,
        "jbe" => 0x6,
        "ja" => 0x7,
        "js" => 0x8,
        "jns" => 0x9,
        "jp" => 0xA,
        "jnp" => 0xB,
        "jl" => 0xC,
        "jge" => 0xD,
        "jle" => 0xE,
        "jg" => 0xF,
        _ => return None,
    })
}
