//! x86-64 template catalog and opcode tree.
//!
//! A static table of legal instruction encodings — mnemonic, operand-class
//! signature, opcode bytes, prefix/extension flags — inserted into a trie
//! keyed by mnemonic and packed operand keys. The tree is built exactly once
//! behind a [`Lazy`] and is read-only thereafter, so concurrent sessions can
//! share it without synchronization.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

/// Abstract operand class of a template slot.
///
/// The derive order is load-bearing: candidate templates are stable-sorted
/// ascending by their *first* operand's class, and the smallest wins.
/// Accumulator-specific classes sort before the general register classes so
/// that e.g. `cmp rax, imm32` selects the short 0x3D form over the general
/// ModRM 0x81 /7 form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpClass {
    /// AL — 8-bit accumulator.
    Al,
    /// AX — 16-bit accumulator.
    Ax,
    /// EAX — 32-bit accumulator.
    Eax,
    /// RAX — 64-bit accumulator.
    Rax,
    /// Any 8-bit GP register.
    R8,
    /// Any 16-bit GP register.
    R16,
    /// Any 32-bit GP register.
    R32,
    /// Any 64-bit GP register.
    R64,
    /// 8-bit register or memory.
    Rm8,
    /// 16-bit register or memory.
    Rm16,
    /// 32-bit register or memory.
    Rm32,
    /// 64-bit register or memory.
    Rm64,
    /// Any memory operand of any size (LEA source).
    M,
    /// XMM register.
    Xmm,
    /// XMM register or 64-bit memory (scalar-double forms).
    XmmM64,
    /// 8-bit immediate.
    Imm8,
    /// 16-bit immediate.
    Imm16,
    /// 32-bit immediate.
    Imm32,
    /// 64-bit immediate.
    Imm64,
}

/// How an operand participates in the encoded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// ModRM.rm slot (register or memory form).
    ModRm,
    /// ModRM.reg slot.
    Reg,
    /// Immediate bytes after the instruction body.
    Imm,
    /// Low 3 bits of the last opcode byte (`B8+r` style).
    OpcodeReg,
    /// VEX.vvvv source register.
    Vvvv,
    /// Hardwired operand (accumulator forms); contributes no bytes.
    Implicit,
}

/// VEX opcode-map selector (the "legacy byte" escape the VEX prefix implies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VexMap {
    /// 0F escape.
    M0F,
    /// 0F 38 escape.
    M0F38,
    /// 0F 3A escape.
    M0F3A,
}

impl VexMap {
    /// The 5-bit mmmmm field value.
    #[must_use]
    pub const fn mmmmm(self) -> u8 {
        match self {
            VexMap::M0F => 1,
            VexMap::M0F38 => 2,
            VexMap::M0F3A => 3,
        }
    }
}

/// One entry of a template's ordered extension list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TplExt {
    /// `/n` — fixed ModRM.reg digit.
    Slash(u8),
    /// A REX prefix may be emitted for this encoding (extended registers,
    /// REX-only byte aliases). Templates without `Rex`/`RexW`/`Vex` can never
    /// encode an extended register.
    Rex,
    /// REX.W is mandatory (64-bit operand size).
    RexW,
    /// VEX-encoded; carries map, mandatory-prefix (pp), width and length
    /// selectors.
    Vex {
        /// Opcode map (implied escape bytes).
        map: VexMap,
        /// Mandatory prefix: 0=none, 1=66, 2=F3, 3=F2.
        pp: u8,
        /// VEX.W.
        w: bool,
        /// VEX.L (256-bit when set).
        l: bool,
    },
}

/// One operand slot of a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TplOperand {
    /// Abstract operand class.
    pub class: OpClass,
    /// Encoding role.
    pub role: Role,
}

/// A legal instruction encoding.
#[derive(Debug, PartialEq, Eq)]
pub struct Template {
    /// Lower-case mnemonic.
    pub mnemonic: &'static str,
    /// Legacy mandatory prefix byte (0x66/0xF2/0xF3), if any.
    pub prefix: Option<u8>,
    /// 1–3 opcode bytes.
    pub opcode: &'static [u8],
    /// Ordered extension list.
    pub exts: &'static [TplExt],
    /// Up to 4 operand slots.
    pub operands: &'static [TplOperand],
}

impl Template {
    /// Whether the template carries any REX-family extension (REX, REX.W, or
    /// VEX) and may therefore encode extended registers.
    #[must_use]
    pub fn allows_rex(&self) -> bool {
        self.exts
            .iter()
            .any(|e| matches!(e, TplExt::Rex | TplExt::RexW | TplExt::Vex { .. }))
    }

    /// Whether the template *forces* a REX prefix (REX.W) — incompatible
    /// with the legacy high-byte registers.
    #[must_use]
    pub fn forces_rex(&self) -> bool {
        self.exts.iter().any(|e| matches!(e, TplExt::RexW))
    }
}

// ─── Concrete match keys ────────────────────────────────────────────────

/// Concrete operand type after classification, packed with the access size
/// into a tree key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ConcreteKind {
    /// The accumulator (AL/AX/EAX/RAX).
    Acc,
    /// Any other GP register.
    Reg,
    /// XMM register.
    Xmm,
    /// `[reg]` indirect.
    Ind,
    /// `[reg+disp]`.
    Disp,
    /// `[rip+disp]`.
    Rip,
    /// `[base+index*scale+disp]`.
    Sib,
    /// Immediate.
    Imm,
}

/// Packed `(concrete type, size)` tree key.
pub(crate) type Key = u16;

#[inline]
pub(crate) const fn pack(kind: ConcreteKind, size: u8) -> Key {
    ((kind as u16) << 8) | size as u16
}

/// Deterministic low→high expansion: the concrete keys an abstract class
/// matches. A register-or-memory class expands to every addressing form of
/// its size; an accumulator-capable register class also expands to the
/// accumulator key so RAX operands still reach general templates.
pub(crate) fn expand(class: OpClass) -> &'static [Key] {
    use ConcreteKind::*;
    macro_rules! keys {
        ($(($k:expr, $s:expr)),+ $(,)?) => {{
            static K: &[Key] = &[$(pack($k, $s)),+];
            K
        }};
    }
    match class {
        OpClass::Al => keys![(Acc, 1)],
        OpClass::Ax => keys![(Acc, 2)],
        OpClass::Eax => keys![(Acc, 4)],
        OpClass::Rax => keys![(Acc, 8)],
        OpClass::R8 => keys![(Reg, 1), (Acc, 1)],
        OpClass::R16 => keys![(Reg, 2), (Acc, 2)],
        OpClass::R32 => keys![(Reg, 4), (Acc, 4)],
        OpClass::R64 => keys![(Reg, 8), (Acc, 8)],
        OpClass::Rm8 => keys![(Reg, 1), (Acc, 1), (Ind, 1), (Disp, 1), (Rip, 1), (Sib, 1)],
        OpClass::Rm16 => keys![(Reg, 2), (Acc, 2), (Ind, 2), (Disp, 2), (Rip, 2), (Sib, 2)],
        OpClass::Rm32 => keys![(Reg, 4), (Acc, 4), (Ind, 4), (Disp, 4), (Rip, 4), (Sib, 4)],
        OpClass::Rm64 => keys![(Reg, 8), (Acc, 8), (Ind, 8), (Disp, 8), (Rip, 8), (Sib, 8)],
        OpClass::M => keys![
            (Ind, 1),
            (Disp, 1),
            (Rip, 1),
            (Sib, 1),
            (Ind, 2),
            (Disp, 2),
            (Rip, 2),
            (Sib, 2),
            (Ind, 4),
            (Disp, 4),
            (Rip, 4),
            (Sib, 4),
            (Ind, 8),
            (Disp, 8),
            (Rip, 8),
            (Sib, 8),
        ],
        OpClass::Xmm => keys![(Xmm, 16)],
        OpClass::XmmM64 => keys![(Xmm, 16), (Ind, 8), (Disp, 8), (Rip, 8), (Sib, 8)],
        OpClass::Imm8 => keys![(Imm, 1)],
        OpClass::Imm16 => keys![(Imm, 2)],
        // A 32-bit immediate slot also accepts a 64-bit-typed operand; the
        // encoder verifies the value fits in signed 32 bits.
        OpClass::Imm32 => keys![(Imm, 4), (Imm, 8)],
        OpClass::Imm64 => keys![(Imm, 8)],
    }
}

/// The encoded immediate width in bytes for an immediate class.
pub(crate) fn imm_width(class: OpClass) -> Option<u8> {
    match class {
        OpClass::Imm8 => Some(1),
        OpClass::Imm16 => Some(2),
        OpClass::Imm32 => Some(4),
        OpClass::Imm64 => Some(8),
        _ => None,
    }
}

// ─── Template table ─────────────────────────────────────────────────────

const fn o(class: OpClass, role: Role) -> TplOperand {
    TplOperand { class, role }
}

use OpClass::*;
use Role::*;
use TplExt::*;

const VF2: TplExt = Vex {
    map: VexMap::M0F,
    pp: 3,
    w: false,
    l: false,
};

macro_rules! tpl {
    ($mn:literal, $pfx:expr, [$($opc:literal),+], [$($ext:expr),*], [$($opnd:expr),*]) => {
        Template {
            mnemonic: $mn,
            prefix: $pfx,
            opcode: &[$($opc),+],
            exts: &[$($ext),*],
            operands: &[$($opnd),*],
        }
    };
}

/// Every legal encoding known to the backend. Catalog order is the tie-break
/// for templates sharing a leaf and a first-operand class.
pub static TEMPLATES: &[Template] = &[
    // ── mov ─────────────────────────────────────────────────────────────
    tpl!("mov", None, [0x88], [], [o(Rm8, ModRm), o(R8, Reg)]),
    tpl!("mov", None, [0x88], [Rex], [o(Rm8, ModRm), o(R8, Reg)]),
    tpl!("mov", None, [0x8A], [], [o(R8, Reg), o(Rm8, ModRm)]),
    tpl!("mov", None, [0x8A], [Rex], [o(R8, Reg), o(Rm8, ModRm)]),
    tpl!("mov", None, [0x89], [Rex], [o(Rm32, ModRm), o(R32, Reg)]),
    tpl!("mov", None, [0x89], [RexW], [o(Rm64, ModRm), o(R64, Reg)]),
    tpl!("mov", None, [0x8B], [Rex], [o(R32, Reg), o(Rm32, ModRm)]),
    tpl!("mov", None, [0x8B], [RexW], [o(R64, Reg), o(Rm64, ModRm)]),
    tpl!("mov", None, [0xB8], [Rex], [o(R32, OpcodeReg), o(Imm32, Imm)]),
    tpl!("mov", None, [0xB8], [RexW], [o(R64, OpcodeReg), o(Imm64, Imm)]),
    tpl!("mov", None, [0xC6], [Slash(0)], [o(Rm8, ModRm), o(Imm8, Imm)]),
    tpl!("mov", None, [0xC6], [Slash(0), Rex], [o(Rm8, ModRm), o(Imm8, Imm)]),
    tpl!("mov", None, [0xC7], [Slash(0), Rex], [o(Rm32, ModRm), o(Imm32, Imm)]),
    tpl!("mov", None, [0xC7], [Slash(0), RexW], [o(Rm64, ModRm), o(Imm32, Imm)]),
    // ── add ─────────────────────────────────────────────────────────────
    tpl!("add", None, [0x05], [Rex], [o(Eax, Implicit), o(Imm32, Imm)]),
    tpl!("add", None, [0x05], [RexW], [o(Rax, Implicit), o(Imm32, Imm)]),
    tpl!("add", None, [0x83], [Slash(0), RexW], [o(Rm64, ModRm), o(Imm8, Imm)]),
    tpl!("add", None, [0x81], [Slash(0), Rex], [o(Rm32, ModRm), o(Imm32, Imm)]),
    tpl!("add", None, [0x81], [Slash(0), RexW], [o(Rm64, ModRm), o(Imm32, Imm)]),
    tpl!("add", None, [0x01], [Rex], [o(Rm32, ModRm), o(R32, Reg)]),
    tpl!("add", None, [0x01], [RexW], [o(Rm64, ModRm), o(R64, Reg)]),
    tpl!("add", None, [0x03], [Rex], [o(R32, Reg), o(Rm32, ModRm)]),
    tpl!("add", None, [0x03], [RexW], [o(R64, Reg), o(Rm64, ModRm)]),
    // ── sub ─────────────────────────────────────────────────────────────
    tpl!("sub", None, [0x2D], [Rex], [o(Eax, Implicit), o(Imm32, Imm)]),
    tpl!("sub", None, [0x2D], [RexW], [o(Rax, Implicit), o(Imm32, Imm)]),
    tpl!("sub", None, [0x83], [Slash(5), RexW], [o(Rm64, ModRm), o(Imm8, Imm)]),
    tpl!("sub", None, [0x81], [Slash(5), Rex], [o(Rm32, ModRm), o(Imm32, Imm)]),
    tpl!("sub", None, [0x81], [Slash(5), RexW], [o(Rm64, ModRm), o(Imm32, Imm)]),
    tpl!("sub", None, [0x29], [Rex], [o(Rm32, ModRm), o(R32, Reg)]),
    tpl!("sub", None, [0x29], [RexW], [o(Rm64, ModRm), o(R64, Reg)]),
    tpl!("sub", None, [0x2B], [Rex], [o(R32, Reg), o(Rm32, ModRm)]),
    tpl!("sub", None, [0x2B], [RexW], [o(R64, Reg), o(Rm64, ModRm)]),
    // ── and ─────────────────────────────────────────────────────────────
    tpl!("and", None, [0x25], [RexW], [o(Rax, Implicit), o(Imm32, Imm)]),
    tpl!("and", None, [0x83], [Slash(4), RexW], [o(Rm64, ModRm), o(Imm8, Imm)]),
    tpl!("and", None, [0x81], [Slash(4), RexW], [o(Rm64, ModRm), o(Imm32, Imm)]),
    tpl!("and", None, [0x21], [Rex], [o(Rm32, ModRm), o(R32, Reg)]),
    tpl!("and", None, [0x21], [RexW], [o(Rm64, ModRm), o(R64, Reg)]),
    tpl!("and", None, [0x23], [RexW], [o(R64, Reg), o(Rm64, ModRm)]),
    // ── or ──────────────────────────────────────────────────────────────
    tpl!("or", None, [0x0D], [RexW], [o(Rax, Implicit), o(Imm32, Imm)]),
    tpl!("or", None, [0x83], [Slash(1), RexW], [o(Rm64, ModRm), o(Imm8, Imm)]),
    tpl!("or", None, [0x81], [Slash(1), RexW], [o(Rm64, ModRm), o(Imm32, Imm)]),
    tpl!("or", None, [0x09], [Rex], [o(Rm32, ModRm), o(R32, Reg)]),
    tpl!("or", None, [0x09], [RexW], [o(Rm64, ModRm), o(R64, Reg)]),
    tpl!("or", None, [0x0B], [RexW], [o(R64, Reg), o(Rm64, ModRm)]),
    // ── xor ─────────────────────────────────────────────────────────────
    tpl!("xor", None, [0x35], [RexW], [o(Rax, Implicit), o(Imm32, Imm)]),
    tpl!("xor", None, [0x83], [Slash(6), RexW], [o(Rm64, ModRm), o(Imm8, Imm)]),
    tpl!("xor", None, [0x81], [Slash(6), RexW], [o(Rm64, ModRm), o(Imm32, Imm)]),
    tpl!("xor", None, [0x31], [Rex], [o(Rm32, ModRm), o(R32, Reg)]),
    tpl!("xor", None, [0x31], [RexW], [o(Rm64, ModRm), o(R64, Reg)]),
    tpl!("xor", None, [0x33], [RexW], [o(R64, Reg), o(Rm64, ModRm)]),
    // ── cmp ─────────────────────────────────────────────────────────────
    tpl!("cmp", None, [0x3D], [Rex], [o(Eax, Implicit), o(Imm32, Imm)]),
    tpl!("cmp", None, [0x3D], [RexW], [o(Rax, Implicit), o(Imm32, Imm)]),
    tpl!("cmp", None, [0x83], [Slash(7), RexW], [o(Rm64, ModRm), o(Imm8, Imm)]),
    tpl!("cmp", None, [0x81], [Slash(7), Rex], [o(Rm32, ModRm), o(Imm32, Imm)]),
    tpl!("cmp", None, [0x81], [Slash(7), RexW], [o(Rm64, ModRm), o(Imm32, Imm)]),
    tpl!("cmp", None, [0x39], [Rex], [o(Rm32, ModRm), o(R32, Reg)]),
    tpl!("cmp", None, [0x39], [RexW], [o(Rm64, ModRm), o(R64, Reg)]),
    tpl!("cmp", None, [0x3B], [Rex], [o(R32, Reg), o(Rm32, ModRm)]),
    tpl!("cmp", None, [0x3B], [RexW], [o(R64, Reg), o(Rm64, ModRm)]),
    // ── test ────────────────────────────────────────────────────────────
    tpl!("test", None, [0xA9], [RexW], [o(Rax, Implicit), o(Imm32, Imm)]),
    tpl!("test", None, [0xF7], [Slash(0), RexW], [o(Rm64, ModRm), o(Imm32, Imm)]),
    tpl!("test", None, [0x85], [Rex], [o(Rm32, ModRm), o(R32, Reg)]),
    tpl!("test", None, [0x85], [RexW], [o(Rm64, ModRm), o(R64, Reg)]),
    // ── lea ─────────────────────────────────────────────────────────────
    tpl!("lea", None, [0x8D], [RexW], [o(R64, Reg), o(M, ModRm)]),
    // ── imul / idiv / unary ─────────────────────────────────────────────
    tpl!("imul", None, [0x0F, 0xAF], [Rex], [o(R32, Reg), o(Rm32, ModRm)]),
    tpl!("imul", None, [0x0F, 0xAF], [RexW], [o(R64, Reg), o(Rm64, ModRm)]),
    tpl!("imul", None, [0x6B], [RexW], [o(R64, Reg), o(Rm64, ModRm), o(Imm8, Imm)]),
    tpl!("imul", None, [0x69], [RexW], [o(R64, Reg), o(Rm64, ModRm), o(Imm32, Imm)]),
    tpl!("mul", None, [0xF7], [Slash(4), RexW], [o(Rm64, ModRm)]),
    tpl!("idiv", None, [0xF7], [Slash(7), Rex], [o(Rm32, ModRm)]),
    tpl!("idiv", None, [0xF7], [Slash(7), RexW], [o(Rm64, ModRm)]),
    tpl!("div", None, [0xF7], [Slash(6), RexW], [o(Rm64, ModRm)]),
    tpl!("neg", None, [0xF7], [Slash(3), RexW], [o(Rm64, ModRm)]),
    tpl!("not", None, [0xF7], [Slash(2), RexW], [o(Rm64, ModRm)]),
    // ── inc / dec ───────────────────────────────────────────────────────
    tpl!("inc", None, [0xFF], [Slash(0), RexW], [o(Rm64, ModRm)]),
    tpl!("dec", None, [0xFF], [Slash(1), RexW], [o(Rm64, ModRm)]),
    // ── shifts ──────────────────────────────────────────────────────────
    tpl!("shl", None, [0xC1], [Slash(4), RexW], [o(Rm64, ModRm), o(Imm8, Imm)]),
    tpl!("shr", None, [0xC1], [Slash(5), RexW], [o(Rm64, ModRm), o(Imm8, Imm)]),
    tpl!("sar", None, [0xC1], [Slash(7), RexW], [o(Rm64, ModRm), o(Imm8, Imm)]),
    tpl!("shl", None, [0xC1], [Slash(4), Rex], [o(Rm32, ModRm), o(Imm8, Imm)]),
    tpl!("shr", None, [0xC1], [Slash(5), Rex], [o(Rm32, ModRm), o(Imm8, Imm)]),
    // ── widening moves ──────────────────────────────────────────────────
    tpl!("movzx", None, [0x0F, 0xB6], [Rex], [o(R32, Reg), o(Rm8, ModRm)]),
    tpl!("movzx", None, [0x0F, 0xB6], [RexW], [o(R64, Reg), o(Rm8, ModRm)]),
    tpl!("movzx", None, [0x0F, 0xB7], [RexW], [o(R64, Reg), o(Rm16, ModRm)]),
    tpl!("movsx", None, [0x0F, 0xBE], [RexW], [o(R64, Reg), o(Rm8, ModRm)]),
    tpl!("movsx", None, [0x0F, 0xBF], [RexW], [o(R64, Reg), o(Rm16, ModRm)]),
    tpl!("movsxd", None, [0x63], [RexW], [o(R64, Reg), o(Rm32, ModRm)]),
    // ── stack ───────────────────────────────────────────────────────────
    tpl!("push", None, [0x50], [Rex], [o(R64, OpcodeReg)]),
    tpl!("push", None, [0x6A], [], [o(Imm8, Imm)]),
    tpl!("push", None, [0x68], [], [o(Imm32, Imm)]),
    tpl!("pop", None, [0x58], [Rex], [o(R64, OpcodeReg)]),
    // ── indirect control flow ───────────────────────────────────────────
    tpl!("jmp", None, [0xFF], [Slash(4), Rex], [o(Rm64, ModRm)]),
    tpl!("call", None, [0xFF], [Slash(2), Rex], [o(Rm64, ModRm)]),
    // ── setcc (REX and non-REX variants) ────────────────────────────────
    tpl!("sete", None, [0x0F, 0x94], [Slash(0)], [o(Rm8, ModRm)]),
    tpl!("sete", None, [0x0F, 0x94], [Slash(0), Rex], [o(Rm8, ModRm)]),
    tpl!("setne", None, [0x0F, 0x95], [Slash(0)], [o(Rm8, ModRm)]),
    tpl!("setne", None, [0x0F, 0x95], [Slash(0), Rex], [o(Rm8, ModRm)]),
    tpl!("setl", None, [0x0F, 0x9C], [Slash(0), Rex], [o(Rm8, ModRm)]),
    tpl!("setle", None, [0x0F, 0x9E], [Slash(0), Rex], [o(Rm8, ModRm)]),
    tpl!("setg", None, [0x0F, 0x9F], [Slash(0), Rex], [o(Rm8, ModRm)]),
    tpl!("setge", None, [0x0F, 0x9D], [Slash(0), Rex], [o(Rm8, ModRm)]),
    tpl!("setb", None, [0x0F, 0x92], [Slash(0), Rex], [o(Rm8, ModRm)]),
    tpl!("setbe", None, [0x0F, 0x96], [Slash(0), Rex], [o(Rm8, ModRm)]),
    tpl!("seta", None, [0x0F, 0x97], [Slash(0), Rex], [o(Rm8, ModRm)]),
    tpl!("setae", None, [0x0F, 0x93], [Slash(0), Rex], [o(Rm8, ModRm)]),
    // ── scalar double SSE2 ──────────────────────────────────────────────
    tpl!("movsd", Some(0xF2), [0x0F, 0x10], [Rex], [o(Xmm, Reg), o(XmmM64, ModRm)]),
    tpl!("movsd", Some(0xF2), [0x0F, 0x11], [Rex], [o(XmmM64, ModRm), o(Xmm, Reg)]),
    tpl!("addsd", Some(0xF2), [0x0F, 0x58], [Rex], [o(Xmm, Reg), o(XmmM64, ModRm)]),
    tpl!("subsd", Some(0xF2), [0x0F, 0x5C], [Rex], [o(Xmm, Reg), o(XmmM64, ModRm)]),
    tpl!("mulsd", Some(0xF2), [0x0F, 0x59], [Rex], [o(Xmm, Reg), o(XmmM64, ModRm)]),
    tpl!("divsd", Some(0xF2), [0x0F, 0x5E], [Rex], [o(Xmm, Reg), o(XmmM64, ModRm)]),
    tpl!("ucomisd", Some(0x66), [0x0F, 0x2E], [Rex], [o(Xmm, Reg), o(XmmM64, ModRm)]),
    tpl!("cvtsi2sd", Some(0xF2), [0x0F, 0x2A], [RexW], [o(Xmm, Reg), o(Rm64, ModRm)]),
    tpl!("cvttsd2si", Some(0xF2), [0x0F, 0x2C], [RexW], [o(R64, Reg), o(XmmM64, ModRm)]),
    tpl!("movq", Some(0x66), [0x0F, 0x6E], [RexW], [o(Xmm, Reg), o(Rm64, ModRm)]),
    tpl!("movq", Some(0x66), [0x0F, 0x7E], [RexW], [o(Rm64, ModRm), o(Xmm, Reg)]),
    // ── AVX scalar double (three-operand VEX forms) ─────────────────────
    tpl!("vaddsd", None, [0x58], [VF2], [o(Xmm, Reg), o(Xmm, Vvvv), o(XmmM64, ModRm)]),
    tpl!("vsubsd", None, [0x5C], [VF2], [o(Xmm, Reg), o(Xmm, Vvvv), o(XmmM64, ModRm)]),
    tpl!("vmulsd", None, [0x59], [VF2], [o(Xmm, Reg), o(Xmm, Vvvv), o(XmmM64, ModRm)]),
    tpl!("vdivsd", None, [0x5E], [VF2], [o(Xmm, Reg), o(Xmm, Vvvv), o(XmmM64, ModRm)]),
    // ── fixed encodings ─────────────────────────────────────────────────
    tpl!("ret", None, [0xC3], [], []),
    tpl!("leave", None, [0xC9], [], []),
    tpl!("nop", None, [0x90], [], []),
    tpl!("int3", None, [0xCC], [], []),
    tpl!("ud2", None, [0x0F, 0x0B], [], []),
    tpl!("syscall", None, [0x0F, 0x05], [], []),
    tpl!("cqo", None, [0x99], [RexW], []),
    tpl!("cdq", None, [0x99], [], []),
];

// ─── Opcode tree ────────────────────────────────────────────────────────

/// One trie node: leaf templates plus children keyed by packed operand keys.
#[derive(Debug, Default)]
pub(crate) struct TreeNode {
    pub(crate) templates: Vec<&'static Template>,
    pub(crate) children: BTreeMap<Key, TreeNode>,
}

/// The full selection trie, mnemonic → operand-key path → templates.
#[derive(Debug, Default)]
pub(crate) struct OpcodeTree {
    roots: BTreeMap<&'static str, TreeNode>,
}

impl OpcodeTree {
    fn insert(&mut self, tpl: &'static Template) {
        let root = self.roots.entry(tpl.mnemonic).or_default();
        Self::insert_at(root, tpl, 0);
    }

    fn insert_at(node: &mut TreeNode, tpl: &'static Template, pos: usize) {
        if pos == tpl.operands.len() {
            node.templates.push(tpl);
            return;
        }
        for &key in expand(tpl.operands[pos].class) {
            let child = node.children.entry(key).or_default();
            Self::insert_at(child, tpl, pos + 1);
        }
    }

    /// Root node for a mnemonic.
    pub(crate) fn root(&self, mnemonic: &str) -> Option<&TreeNode> {
        self.roots.get(mnemonic)
    }
}

/// The process-wide, read-only opcode tree.
pub(crate) fn opcode_tree() -> &'static OpcodeTree {
    static TREE: Lazy<OpcodeTree> = Lazy::new(|| {
        let mut tree = OpcodeTree::default();
        for tpl in TEMPLATES {
            tree.insert(tpl);
        }
        tree
    });
    &TREE
}
