//! RISC-V64 instruction selection and bit packing.
//!
//! Selection is a flat signature catalog: mnemonic plus per-operand class
//! flags, first full match wins, catalog order is the tie-break. Each matched
//! signature dispatches to a bit-packing handler for the R/I/S/B/U/J 32-bit
//! formats or the compressed 16-bit quadrant formats.
//!
//! ```text
//! R-type:  [funct7 | rs2 | rs1 | funct3 | rd  | opcode]
//! I-type:  [  imm[11:0]  | rs1 | funct3 | rd  | opcode]
//! S-type:  [imm[11:5]|rs2| rs1 | funct3 |imm[4:0]|opcode]
//! B-type:  [imm[12|10:5]|rs2|rs1|funct3|imm[4:1|11]|opcode]
//! U-type:  [      imm[31:12]             | rd  | opcode]
//! J-type:  [imm[20|10:1|11|19:12]        | rd  | opcode]
//! ```
//!
//! Handlers prefer the compressed form whenever the format's register window
//! and immediate field width allow: the CI/CR formats take any register (the
//! real constraint is rd == rs1), the CL/CS formats only x8–x15 remapped by
//! subtracting 8.

use crate::encode::InstBytes;
use crate::error::BackendError;
use crate::ir::{Bank, Inst, Operand};

// ── Opcodes ─────────────────────────────────────────────────────────────

const OP_LUI: u32 = 0b011_0111;
const OP_AUIPC: u32 = 0b001_0111;
const OP_JAL: u32 = 0b110_1111;
const OP_JALR: u32 = 0b110_0111;
const OP_BRANCH: u32 = 0b110_0011;
const OP_LOAD: u32 = 0b000_0011;
const OP_STORE: u32 = 0b010_0011;
const OP_IMM: u32 = 0b001_0011;
const OP_REG: u32 = 0b011_0011;
const OP_IMM_W: u32 = 0b001_1011;
const OP_REG_W: u32 = 0b011_1011;
const OP_SYSTEM: u32 = 0b111_0011;
const OP_LOAD_FP: u32 = 0b000_0111;
const OP_STORE_FP: u32 = 0b010_0111;
const OP_FP: u32 = 0b101_0011;

const C_OP_Q0: u16 = 0b00;
const C_OP_Q1: u16 = 0b01;
const C_OP_Q2: u16 = 0b10;

/// Dynamic rounding mode (use the frm CSR).
const RM_DYN: u32 = 0b111;

// ── 32-bit format packers ───────────────────────────────────────────────

/// Encode an R-type instruction.
#[inline]
fn r_type(opcode: u32, rd: u32, funct3: u32, rs1: u32, rs2: u32, funct7: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

/// Encode an I-type instruction.
#[inline]
fn i_type(opcode: u32, rd: u32, funct3: u32, rs1: u32, imm: i32) -> u32 {
    let imm = (imm as u32) & 0xFFF;
    (imm << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

/// Encode an S-type instruction.
#[inline]
fn s_type(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    let imm_hi = (imm >> 5) & 0x7F;
    let imm_lo = imm & 0x1F;
    (imm_hi << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (imm_lo << 7) | opcode
}

/// Encode a B-type instruction.
#[inline]
fn b_type(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    let bit12 = (imm >> 12) & 1;
    let bit11 = (imm >> 11) & 1;
    let bits10_5 = (imm >> 5) & 0x3F;
    let bits4_1 = (imm >> 1) & 0xF;
    (bit12 << 31)
        | (bits10_5 << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | (bits4_1 << 8)
        | (bit11 << 7)
        | opcode
}

/// Encode a U-type instruction.
#[inline]
fn u_type(opcode: u32, rd: u32, imm: u32) -> u32 {
    (imm & 0xFFFF_F000) | (rd << 7) | opcode
}

/// Encode a J-type instruction.
#[inline]
fn j_type(opcode: u32, rd: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    let bit20 = (imm >> 20) & 1;
    let bits10_1 = (imm >> 1) & 0x3FF;
    let bit11 = (imm >> 11) & 1;
    let bits19_12 = (imm >> 12) & 0xFF;
    (bit20 << 31) | (bits10_1 << 21) | (bit11 << 20) | (bits19_12 << 12) | (rd << 7) | opcode
}

// ── Compressed format packers ───────────────────────────────────────────

/// Map full register number (x8–x15) to compressed 3-bit encoding (0–7).
/// Returns `None` if the register is not in the compact set.
#[inline]
fn compact_reg(r: u32) -> Option<u32> {
    if (8..=15).contains(&r) {
        Some(r - 8)
    } else {
        None
    }
}

/// Encode a CR-type compressed instruction.
///   `[funct4(4) | rd/rs1(5) | rs2(5) | op(2)]`
#[inline]
fn cr_type(funct4: u16, rd_rs1: u16, rs2: u16, op: u16) -> u16 {
    (funct4 << 12) | (rd_rs1 << 7) | (rs2 << 2) | op
}

/// Encode a CI-type compressed instruction.
///   `[funct3(3) | imm[5](1) | rd/rs1(5) | imm[4:0](5) | op(2)]`
#[inline]
fn ci_type(funct3: u16, imm_bit5: u16, rd_rs1: u16, imm_lo5: u16, op: u16) -> u16 {
    (funct3 << 13) | ((imm_bit5 & 1) << 12) | (rd_rs1 << 7) | ((imm_lo5 & 0x1F) << 2) | op
}

/// Encode a CL-type compressed load.
///   `[funct3(3) | imm_hi(3) | rs1'(3) | imm_lo(2) | rd'(3) | op(2)]`
#[inline]
fn cl_type(funct3: u16, imm_hi3: u16, rs1_p: u16, imm_lo2: u16, rd_p: u16, op: u16) -> u16 {
    (funct3 << 13)
        | ((imm_hi3 & 7) << 10)
        | ((rs1_p & 7) << 7)
        | ((imm_lo2 & 3) << 5)
        | ((rd_p & 7) << 2)
        | op
}

/// Encode a CS-type compressed store (same field layout as CL).
#[inline]
fn cs_type(funct3: u16, imm_hi3: u16, rs1_p: u16, imm_lo2: u16, rs2_p: u16, op: u16) -> u16 {
    cl_type(funct3, imm_hi3, rs1_p, imm_lo2, rs2_p, op)
}

// ── RV64 multi-instruction LI ───────────────────────────────────────────

/// Sign-extend a 12-bit value embedded in the low 12 bits of an `i32`.
#[inline]
fn sign_extend_12(val: i32) -> i32 {
    (val << 20) >> 20
}

/// Expand an RV64 constant load into instruction words.
///
/// Small values are one `addi` from x0 and 32-bit values a `lui`+`addi`
/// pair. Anything wider strips the low 12 bits as a signed chunk, recurses
/// on the shifted remainder, then rebuilds with `slli`+`addi`. The chunk
/// being signed is what makes the rebuild exact: the subtraction below
/// pushes its sign into the upper part, and adding the chunk back at the
/// end undoes it.
fn emit_li_rv64(rd: u32, val: i64, bytes: &mut InstBytes) {
    if (-2048..=2047).contains(&val) {
        let w = i_type(OP_IMM, rd, 0, 0, val as i32);
        bytes.extend_from_slice(&w.to_le_bytes());
        return;
    }

    if (i64::from(i32::MIN)..=i64::from(i32::MAX)).contains(&val) {
        let lo12 = sign_extend_12(val as i32);
        let hi20 = ((val as i32).wrapping_sub(lo12)) as u32;
        let w = u_type(OP_LUI, rd, hi20);
        bytes.extend_from_slice(&w.to_le_bytes());
        if lo12 != 0 {
            let w = i_type(OP_IMM, rd, 0, rd, lo12);
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        return;
    }

    // Wider than 32 bits: strip the signed low chunk, recurse on the rest.
    let lo12 = sign_extend_12(val as i32);
    let rest = val.wrapping_sub(i64::from(lo12));

    // `rest` carries at least 12 trailing zero bits; shifting them all out
    // keeps the recursive part minimal.
    let shift = (rest as u64).trailing_zeros().clamp(12, 63);

    emit_li_rv64(rd, rest >> shift, bytes);

    let w = i_type(OP_IMM, rd, 1, rd, shift as i32); // slli
    bytes.extend_from_slice(&w.to_le_bytes());

    if lo12 != 0 {
        let w = i_type(OP_IMM, rd, 0, rd, lo12); // addi
        bytes.extend_from_slice(&w.to_le_bytes());
    }
}

// ── Signature catalog ───────────────────────────────────────────────────

const F_REG: u8 = 1 << 0;
const F_FREG: u8 = 1 << 1;
const F_IMM: u8 = 1 << 2;
const F_MEM: u8 = 1 << 3;
const F_SYM: u8 = 1 << 4;
const F_RM: u8 = 1 << 5;

/// Classify a concrete operand into signature flags.
fn classify(op: &Operand) -> u8 {
    match op {
        Operand::Reg(r) => match r.bank() {
            Bank::Float => F_FREG,
            _ => F_REG,
        },
        Operand::Imm { .. } => F_IMM,
        Operand::Indirect { .. } | Operand::BaseDisp { .. } => F_MEM,
        Operand::Sym { .. } => F_SYM,
        Operand::RoundMode(_) => F_RM,
        _ => 0,
    }
}

/// The bit-packing handler a signature resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RvOp {
    /// R-type register arithmetic.
    R { opcode: u32, f3: u32, f7: u32 },
    /// I-type immediate arithmetic.
    I { opcode: u32, f3: u32 },
    /// Shift-immediate with RV64 6-bit shamt; `high` fills imm[11:6].
    ShiftImm { opcode: u32, f3: u32, high: u32 },
    /// I-type load through a memory operand.
    Load { f3: u32 },
    /// S-type store through a memory operand.
    Store { f3: u32 },
    /// B-type conditional branch.
    Branch { f3: u32 },
    Lui,
    Auipc,
    Jal,
    Jalr,
    Li,
    Mv,
    Call,
    /// A fixed 32-bit word (ecall, ebreak, ret, nop).
    Fixed(u32),
    /// FP compute with a rounding-mode field (explicit or dynamic).
    FpRm { f7: u32 },
    /// FP compare writing an int register; rm field carries funct3.
    FpCmp { f3: u32 },
    FpLoad,
    FpStore,
    /// FP↔int conversion: `f7` plus the rs2 selector field.
    FCvt { f7: u32, rs2: u32, to_int: bool },
}

struct RvSig {
    mnemonic: &'static str,
    flags: &'static [u8],
    op: RvOp,
}

macro_rules! sig {
    ($mn:literal, [$($f:expr),*], $op:expr) => {
        RvSig {
            mnemonic: $mn,
            flags: &[$($f),*],
            op: $op,
        }
    };
}

/// Ordered signature catalog. First full match wins; more-specific forms
/// precede more-general ones.
static SIGS: &[RvSig] = &[
    // R-type integer
    sig!("add", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b000, f7: 0 }),
    sig!("sub", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b000, f7: 0b010_0000 }),
    sig!("sll", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b001, f7: 0 }),
    sig!("slt", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b010, f7: 0 }),
    sig!("sltu", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b011, f7: 0 }),
    sig!("xor", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b100, f7: 0 }),
    sig!("srl", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b101, f7: 0 }),
    sig!("sra", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b101, f7: 0b010_0000 }),
    sig!("or", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b110, f7: 0 }),
    sig!("and", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b111, f7: 0 }),
    sig!("addw", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG_W, f3: 0b000, f7: 0 }),
    sig!("subw", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG_W, f3: 0b000, f7: 0b010_0000 }),
    // M extension
    sig!("mul", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b000, f7: 1 }),
    sig!("div", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b100, f7: 1 }),
    sig!("divu", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b101, f7: 1 }),
    sig!("rem", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b110, f7: 1 }),
    sig!("remu", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG, f3: 0b111, f7: 1 }),
    sig!("mulw", [F_REG, F_REG, F_REG], RvOp::R { opcode: OP_REG_W, f3: 0b000, f7: 1 }),
    // I-type immediate
    sig!("addi", [F_REG, F_REG, F_IMM], RvOp::I { opcode: OP_IMM, f3: 0b000 }),
    sig!("slti", [F_REG, F_REG, F_IMM], RvOp::I { opcode: OP_IMM, f3: 0b010 }),
    sig!("sltiu", [F_REG, F_REG, F_IMM], RvOp::I { opcode: OP_IMM, f3: 0b011 }),
    sig!("xori", [F_REG, F_REG, F_IMM], RvOp::I { opcode: OP_IMM, f3: 0b100 }),
    sig!("ori", [F_REG, F_REG, F_IMM], RvOp::I { opcode: OP_IMM, f3: 0b110 }),
    sig!("andi", [F_REG, F_REG, F_IMM], RvOp::I { opcode: OP_IMM, f3: 0b111 }),
    sig!("addiw", [F_REG, F_REG, F_IMM], RvOp::I { opcode: OP_IMM_W, f3: 0b000 }),
    sig!("slli", [F_REG, F_REG, F_IMM], RvOp::ShiftImm { opcode: OP_IMM, f3: 0b001, high: 0 }),
    sig!("srli", [F_REG, F_REG, F_IMM], RvOp::ShiftImm { opcode: OP_IMM, f3: 0b101, high: 0 }),
    sig!("srai", [F_REG, F_REG, F_IMM], RvOp::ShiftImm { opcode: OP_IMM, f3: 0b101, high: 0b01_0000 }),
    // Loads / stores
    sig!("lb", [F_REG, F_MEM], RvOp::Load { f3: 0b000 }),
    sig!("lh", [F_REG, F_MEM], RvOp::Load { f3: 0b001 }),
    sig!("lw", [F_REG, F_MEM], RvOp::Load { f3: 0b010 }),
    sig!("ld", [F_REG, F_MEM], RvOp::Load { f3: 0b011 }),
    sig!("lbu", [F_REG, F_MEM], RvOp::Load { f3: 0b100 }),
    sig!("lhu", [F_REG, F_MEM], RvOp::Load { f3: 0b101 }),
    sig!("lwu", [F_REG, F_MEM], RvOp::Load { f3: 0b110 }),
    sig!("sb", [F_REG, F_MEM], RvOp::Store { f3: 0b000 }),
    sig!("sh", [F_REG, F_MEM], RvOp::Store { f3: 0b001 }),
    sig!("sw", [F_REG, F_MEM], RvOp::Store { f3: 0b010 }),
    sig!("sd", [F_REG, F_MEM], RvOp::Store { f3: 0b011 }),
    // Branches: resolved-immediate form first, symbolic second.
    sig!("beq", [F_REG, F_REG, F_IMM], RvOp::Branch { f3: 0b000 }),
    sig!("beq", [F_REG, F_REG, F_SYM], RvOp::Branch { f3: 0b000 }),
    sig!("bne", [F_REG, F_REG, F_IMM], RvOp::Branch { f3: 0b001 }),
    sig!("bne", [F_REG, F_REG, F_SYM], RvOp::Branch { f3: 0b001 }),
    sig!("blt", [F_REG, F_REG, F_IMM], RvOp::Branch { f3: 0b100 }),
    sig!("blt", [F_REG, F_REG, F_SYM], RvOp::Branch { f3: 0b100 }),
    sig!("bge", [F_REG, F_REG, F_IMM], RvOp::Branch { f3: 0b101 }),
    sig!("bge", [F_REG, F_REG, F_SYM], RvOp::Branch { f3: 0b101 }),
    sig!("bltu", [F_REG, F_REG, F_IMM], RvOp::Branch { f3: 0b110 }),
    sig!("bltu", [F_REG, F_REG, F_SYM], RvOp::Branch { f3: 0b110 }),
    sig!("bgeu", [F_REG, F_REG, F_IMM], RvOp::Branch { f3: 0b111 }),
    sig!("bgeu", [F_REG, F_REG, F_SYM], RvOp::Branch { f3: 0b111 }),
    // Upper-immediate / jumps
    sig!("lui", [F_REG, F_IMM], RvOp::Lui),
    sig!("auipc", [F_REG, F_IMM], RvOp::Auipc),
    sig!("jal", [F_SYM], RvOp::Jal),
    sig!("jal", [F_REG, F_SYM], RvOp::Jal),
    sig!("jal", [F_REG, F_IMM], RvOp::Jal),
    sig!("jalr", [F_REG], RvOp::Jalr),
    sig!("jalr", [F_REG, F_REG, F_IMM], RvOp::Jalr),
    sig!("call", [F_SYM], RvOp::Call),
    // Pseudo-instructions
    sig!("li", [F_REG, F_IMM], RvOp::Li),
    sig!("mv", [F_REG, F_REG], RvOp::Mv),
    sig!("nop", [], RvOp::Fixed(0x0000_0013)),
    sig!("ret", [], RvOp::Fixed(0x0000_8067)),
    sig!("ecall", [], RvOp::Fixed(OP_SYSTEM)),
    sig!("ebreak", [], RvOp::Fixed((1 << 20) | OP_SYSTEM)),
    // D extension
    sig!("fadd.d", [F_FREG, F_FREG, F_FREG, F_RM], RvOp::FpRm { f7: 0b000_0001 }),
    sig!("fadd.d", [F_FREG, F_FREG, F_FREG], RvOp::FpRm { f7: 0b000_0001 }),
    sig!("fsub.d", [F_FREG, F_FREG, F_FREG, F_RM], RvOp::FpRm { f7: 0b000_0101 }),
    sig!("fsub.d", [F_FREG, F_FREG, F_FREG], RvOp::FpRm { f7: 0b000_0101 }),
    sig!("fmul.d", [F_FREG, F_FREG, F_FREG, F_RM], RvOp::FpRm { f7: 0b000_1001 }),
    sig!("fmul.d", [F_FREG, F_FREG, F_FREG], RvOp::FpRm { f7: 0b000_1001 }),
    sig!("fdiv.d", [F_FREG, F_FREG, F_FREG, F_RM], RvOp::FpRm { f7: 0b000_1101 }),
    sig!("fdiv.d", [F_FREG, F_FREG, F_FREG], RvOp::FpRm { f7: 0b000_1101 }),
    sig!("feq.d", [F_REG, F_FREG, F_FREG], RvOp::FpCmp { f3: 0b010 }),
    sig!("flt.d", [F_REG, F_FREG, F_FREG], RvOp::FpCmp { f3: 0b001 }),
    sig!("fle.d", [F_REG, F_FREG, F_FREG], RvOp::FpCmp { f3: 0b000 }),
    sig!("fld", [F_FREG, F_MEM], RvOp::FpLoad),
    sig!("fsd", [F_FREG, F_MEM], RvOp::FpStore),
    sig!(
        "fcvt.l.d",
        [F_REG, F_FREG, F_RM],
        RvOp::FCvt { f7: 0b110_0001, rs2: 2, to_int: true }
    ),
    sig!(
        "fcvt.l.d",
        [F_REG, F_FREG],
        RvOp::FCvt { f7: 0b110_0001, rs2: 2, to_int: true }
    ),
    sig!(
        "fcvt.d.l",
        [F_FREG, F_REG, F_RM],
        RvOp::FCvt { f7: 0b110_1001, rs2: 2, to_int: false }
    ),
    sig!(
        "fcvt.d.l",
        [F_FREG, F_REG],
        RvOp::FCvt { f7: 0b110_1001, rs2: 2, to_int: false }
    ),
];

fn find_sig(inst: &Inst) -> Option<&'static RvSig> {
    SIGS.iter().find(|sig| {
        sig.mnemonic == inst.mnemonic
            && sig.flags.len() == inst.operands.len()
            && sig
                .flags
                .iter()
                .zip(inst.operands.iter())
                .all(|(&flag, op)| classify(op) & flag != 0)
    })
}

fn no_signature(inst: &Inst) -> BackendError {
    BackendError::NoSignature {
        mnemonic: inst.mnemonic.clone(),
        count: inst.operands.len(),
    }
}

// ── Operand extraction helpers ──────────────────────────────────────────

fn xreg(op: &Operand) -> u32 {
    match op {
        Operand::Reg(r) => u32::from(r.index),
        _ => 0,
    }
}

fn imm_val(op: &Operand) -> i64 {
    match op {
        Operand::Imm { value, .. } => *value,
        _ => 0,
    }
}

/// Split a memory operand into (base register, displacement).
fn mem(op: &Operand) -> (u32, i32) {
    match op {
        Operand::Indirect { base, .. } => (u32::from(base.index), 0),
        Operand::BaseDisp { base, disp, .. } => (u32::from(base.index), *disp),
        _ => (0, 0),
    }
}

fn round_mode(op: Option<&Operand>) -> u32 {
    match op {
        Some(Operand::RoundMode(rm)) => u32::from(*rm & 7),
        _ => RM_DYN,
    }
}

fn check_range(mnemonic: &str, value: i64, min: i64, max: i64) -> Result<(), BackendError> {
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

/// Branch and jump displacement fields carry no bit 0; an odd displacement
/// cannot be represented and must fail rather than encode truncated.
fn check_disp(mnemonic: &str, value: i64, min: i64, max: i64) -> Result<(), BackendError> {
    if value & 1 != 0 {
        return Err(BackendError::ImmediateOverflow {
            mnemonic: String::from(mnemonic),
            value,
            min,
            max,
        });
    }
    check_range(mnemonic, value, min, max)
}

// ── Compression ─────────────────────────────────────────────────────────

/// Compressed form of `addi rd, rs1, imm`: CI-format `c.addi`, legal for any
/// register as long as rd == rs1 != x0 and the immediate is a non-zero
/// 6-bit signed value.
fn compress_addi(rd: u32, rs1: u32, imm: i64) -> Option<u16> {
    if rd == rs1 && rd != 0 && imm != 0 && (-32..=31).contains(&imm) {
        let imm = imm as i32 as u16;
        return Some(ci_type(0b000, (imm >> 5) & 1, rd as u16, imm & 0x1F, C_OP_Q1));
    }
    None
}

/// Compressed form of `add rd, rs1, rs2`: CR-format `c.add`, legal for any
/// register as long as rd == rs1 != x0 and rs2 != x0.
fn compress_add(rd: u32, rs1: u32, rs2: u32) -> Option<u16> {
    if rd == rs1 && rd != 0 && rs2 != 0 {
        return Some(cr_type(0b1001, rd as u16, rs2 as u16, C_OP_Q2));
    }
    None
}

/// Compressed `lw`/`ld`: CL-format, both registers in the x8–x15 window,
/// offset a small aligned unsigned value.
fn compress_load(f3: u32, rd: u32, base: u32, disp: i32) -> Option<u16> {
    let rd_p = compact_reg(rd)?;
    let rs1_p = compact_reg(base)?;
    let off = u32::try_from(disp).ok()?;
    match f3 {
        // c.lw: uimm[6|5:3|2], offset 0–124, 4-byte aligned
        0b010 if off <= 124 && off % 4 == 0 => Some(cl_type(
            0b010,
            ((off >> 3) & 7) as u16,
            rs1_p as u16,
            ((((off >> 2) & 1) << 1) | ((off >> 6) & 1)) as u16,
            rd_p as u16,
            C_OP_Q0,
        )),
        // c.ld: uimm[7:6|5:3], offset 0–248, 8-byte aligned
        0b011 if off <= 248 && off % 8 == 0 => Some(cl_type(
            0b011,
            ((off >> 3) & 7) as u16,
            rs1_p as u16,
            ((off >> 6) & 3) as u16,
            rd_p as u16,
            C_OP_Q0,
        )),
        _ => None,
    }
}

/// Compressed `sw`/`sd`: CS-format, same constraints as the loads.
fn compress_store(f3: u32, rs2: u32, base: u32, disp: i32) -> Option<u16> {
    let rs2_p = compact_reg(rs2)?;
    let rs1_p = compact_reg(base)?;
    let off = u32::try_from(disp).ok()?;
    match f3 {
        0b010 if off <= 124 && off % 4 == 0 => Some(cs_type(
            0b110,
            ((off >> 3) & 7) as u16,
            rs1_p as u16,
            ((((off >> 2) & 1) << 1) | ((off >> 6) & 1)) as u16,
            rs2_p as u16,
            C_OP_Q0,
        )),
        0b011 if off <= 248 && off % 8 == 0 => Some(cs_type(
            0b111,
            ((off >> 3) & 7) as u16,
            rs1_p as u16,
            ((off >> 6) & 3) as u16,
            rs2_p as u16,
            C_OP_Q0,
        )),
        _ => None,
    }
}

/// Compressed `mv rd, rs2`: CR-format `c.mv`.
fn compress_mv(rd: u32, rs2: u32) -> Option<u16> {
    if rd != 0 && rs2 != 0 {
        return Some(cr_type(0b1000, rd as u16, rs2 as u16, C_OP_Q2));
    }
    None
}

// ── Fixups for symbolic operands ────────────────────────────────────────

/// Which patch formula the layout engine must apply once the target offset
/// is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RvFixup {
    /// B-type branch: ±4 KiB, re-packed via [`patch_branch`].
    Branch,
    /// J-type jump: ±1 MiB, re-packed via [`patch_jal`].
    Jal,
    /// `auipc`+`jalr` pair: ±2 GiB split into hi20/lo12.
    CallPair,
}

/// Encoder output: final bytes plus an optional pending fixup against a
/// symbolic operand.
#[derive(Debug)]
pub struct RvEncoded {
    /// The encoded bytes (16, 32, or a multi-instruction expansion).
    pub bytes: InstBytes,
    pub(crate) fixup: Option<(String, RvFixup)>,
}

impl RvEncoded {
    fn plain(bytes: InstBytes) -> Self {
        Self { bytes, fixup: None }
    }

    fn word(w: u32) -> Self {
        Self::plain(InstBytes::from_slice(&w.to_le_bytes()))
    }

    fn half(h: u16) -> Self {
        Self::plain(InstBytes::from_slice(&h.to_le_bytes()))
    }
}

/// Immediate bits of the B-type layout: imm[12|10:5] high, imm[4:1|11] low.
const B_IMM_MASK: u32 = 0xFE00_0F80;

/// Re-pack a B-type word with its final displacement.
pub(crate) fn patch_branch(word: u32, imm: i32) -> u32 {
    (word & !B_IMM_MASK) | (b_type(0, 0, 0, 0, imm) & B_IMM_MASK)
}

/// Re-pack a J-type word with its final displacement.
pub(crate) fn patch_jal(word: u32, imm: i32) -> u32 {
    let body = word & 0x0000_0FFF; // rd + opcode
    body | (j_type(0, 0, imm) & 0xFFFF_F000)
}

/// Re-pack an `auipc`+`jalr` pair with the final pc-relative displacement.
/// The low 12 bits are taken signed, so the upper immediate absorbs the
/// carry, mirroring the `li` chunking rule.
pub(crate) fn patch_call_pair(auipc: u32, jalr: u32, disp: i64) -> (u32, u32) {
    let lo12 = sign_extend_12(disp as i32);
    let hi20 = (disp as i32).wrapping_sub(lo12) as u32;
    let auipc = (auipc & 0x0000_0FFF) | (hi20 & 0xFFFF_F000);
    let jalr = (jalr & 0x000F_FFFF) | (((lo12 as u32) & 0xFFF) << 20);
    (auipc, jalr)
}

// ── Encoder entry point ─────────────────────────────────────────────────

/// Select and encode one RISC-V64 instruction.
///
/// # Errors
///
/// `BackendError::NoSignature` when no catalog entry matches, or
/// `BackendError::ImmediateOverflow` when an immediate exceeds its field.
pub fn encode_rv64(inst: &Inst) -> Result<RvEncoded, BackendError> {
    let sig = find_sig(inst).ok_or_else(|| no_signature(inst))?;
    let mnemonic = inst.mnemonic.as_str();
    let ops = &inst.operands;

    let encoded = match sig.op {
        RvOp::R { opcode, f3, f7 } => {
            let (rd, rs1, rs2) = (xreg(&ops[0]), xreg(&ops[1]), xreg(&ops[2]));
            if opcode == OP_REG && f3 == 0 && f7 == 0 {
                if let Some(h) = compress_add(rd, rs1, rs2) {
                    return Ok(RvEncoded::half(h));
                }
            }
            RvEncoded::word(r_type(opcode, rd, f3, rs1, rs2, f7))
        }
        RvOp::I { opcode, f3 } => {
            let (rd, rs1) = (xreg(&ops[0]), xreg(&ops[1]));
            let imm = imm_val(&ops[2]);
            check_range(mnemonic, imm, -2048, 2047)?;
            if opcode == OP_IMM && f3 == 0 {
                if let Some(h) = compress_addi(rd, rs1, imm) {
                    return Ok(RvEncoded::half(h));
                }
            }
            RvEncoded::word(i_type(opcode, rd, f3, rs1, imm as i32))
        }
        RvOp::ShiftImm { opcode, f3, high } => {
            let (rd, rs1) = (xreg(&ops[0]), xreg(&ops[1]));
            let shamt = imm_val(&ops[2]);
            check_range(mnemonic, shamt, 0, 63)?;
            let imm = (i64::from(high) << 6 | shamt) as i32;
            RvEncoded::word(i_type(opcode, rd, f3, rs1, imm))
        }
        RvOp::Load { f3 } => {
            let rd = xreg(&ops[0]);
            let (base, disp) = mem(&ops[1]);
            check_range(mnemonic, i64::from(disp), -2048, 2047)?;
            if let Some(h) = compress_load(f3, rd, base, disp) {
                return Ok(RvEncoded::half(h));
            }
            RvEncoded::word(i_type(OP_LOAD, rd, f3, base, disp))
        }
        RvOp::Store { f3 } => {
            let rs2 = xreg(&ops[0]);
            let (base, disp) = mem(&ops[1]);
            check_range(mnemonic, i64::from(disp), -2048, 2047)?;
            if let Some(h) = compress_store(f3, rs2, base, disp) {
                return Ok(RvEncoded::half(h));
            }
            RvEncoded::word(s_type(OP_STORE, f3, base, rs2, disp))
        }
        RvOp::Branch { f3 } => {
            let (rs1, rs2) = (xreg(&ops[0]), xreg(&ops[1]));
            match &ops[2] {
                Operand::Sym { name, .. } => RvEncoded {
                    bytes: InstBytes::from_slice(
                        &b_type(OP_BRANCH, f3, rs1, rs2, 0).to_le_bytes(),
                    ),
                    fixup: Some((name.clone(), RvFixup::Branch)),
                },
                op => {
                    let imm = imm_val(op);
                    check_disp(mnemonic, imm, -4096, 4094)?;
                    RvEncoded::word(b_type(OP_BRANCH, f3, rs1, rs2, imm as i32))
                }
            }
        }
        RvOp::Lui => {
            let rd = xreg(&ops[0]);
            let imm = imm_val(&ops[1]);
            check_range(mnemonic, imm, 0, 0xF_FFFF)?;
            RvEncoded::word(u_type(OP_LUI, rd, (imm as u32) << 12))
        }
        RvOp::Auipc => {
            let rd = xreg(&ops[0]);
            let imm = imm_val(&ops[1]);
            check_range(mnemonic, imm, 0, 0xF_FFFF)?;
            RvEncoded::word(u_type(OP_AUIPC, rd, (imm as u32) << 12))
        }
        RvOp::Jal => {
            // `jal label` targets rd = ra.
            let (rd, target) = if ops.len() == 1 {
                (1, &ops[0])
            } else {
                (xreg(&ops[0]), &ops[1])
            };
            match target {
                Operand::Sym { name, .. } => RvEncoded {
                    bytes: InstBytes::from_slice(&j_type(OP_JAL, rd, 0).to_le_bytes()),
                    fixup: Some((name.clone(), RvFixup::Jal)),
                },
                op => {
                    let imm = imm_val(op);
                    check_disp(mnemonic, imm, -(1 << 20), (1 << 20) - 2)?;
                    RvEncoded::word(j_type(OP_JAL, rd, imm as i32))
                }
            }
        }
        RvOp::Jalr => {
            if ops.len() == 1 {
                RvEncoded::word(i_type(OP_JALR, 1, 0, xreg(&ops[0]), 0))
            } else {
                let imm = imm_val(&ops[2]);
                check_range(mnemonic, imm, -2048, 2047)?;
                RvEncoded::word(i_type(OP_JALR, xreg(&ops[0]), 0, xreg(&ops[1]), imm as i32))
            }
        }
        RvOp::Call => {
            // auipc ra, 0 ; jalr ra, ra, 0 — displacement patched later.
            let mut bytes = InstBytes::new();
            bytes.extend_from_slice(&u_type(OP_AUIPC, 1, 0).to_le_bytes());
            bytes.extend_from_slice(&i_type(OP_JALR, 1, 0, 1, 0).to_le_bytes());
            let name = match &ops[0] {
                Operand::Sym { name, .. } => name.clone(),
                _ => return Err(no_signature(inst)),
            };
            RvEncoded {
                bytes,
                fixup: Some((name, RvFixup::CallPair)),
            }
        }
        RvOp::Li => {
            let rd = xreg(&ops[0]);
            let mut bytes = InstBytes::new();
            emit_li_rv64(rd, imm_val(&ops[1]), &mut bytes);
            RvEncoded::plain(bytes)
        }
        RvOp::Mv => {
            let (rd, rs2) = (xreg(&ops[0]), xreg(&ops[1]));
            if let Some(h) = compress_mv(rd, rs2) {
                RvEncoded::half(h)
            } else {
                RvEncoded::word(i_type(OP_IMM, rd, 0, rs2, 0))
            }
        }
        RvOp::Fixed(w) => RvEncoded::word(w),
        RvOp::FpRm { f7 } => {
            let (rd, rs1, rs2) = (xreg(&ops[0]), xreg(&ops[1]), xreg(&ops[2]));
            let rm = round_mode(ops.get(3));
            RvEncoded::word(r_type(OP_FP, rd, rm, rs1, rs2, f7))
        }
        RvOp::FpCmp { f3 } => {
            let (rd, rs1, rs2) = (xreg(&ops[0]), xreg(&ops[1]), xreg(&ops[2]));
            RvEncoded::word(r_type(OP_FP, rd, f3, rs1, rs2, 0b101_0001))
        }
        RvOp::FpLoad => {
            let rd = xreg(&ops[0]);
            let (base, disp) = mem(&ops[1]);
            check_range(mnemonic, i64::from(disp), -2048, 2047)?;
            RvEncoded::word(i_type(OP_LOAD_FP, rd, 0b011, base, disp))
        }
        RvOp::FpStore => {
            let rs2 = xreg(&ops[0]);
            let (base, disp) = mem(&ops[1]);
            check_range(mnemonic, i64::from(disp), -2048, 2047)?;
            RvEncoded::word(s_type(OP_STORE_FP, 0b011, base, rs2, disp))
        }
        RvOp::FCvt { f7, rs2, to_int } => {
            let (rd, rs1) = (xreg(&ops[0]), xreg(&ops[1]));
            // Integer-bound conversions default to truncation.
            let rm = match ops.get(2) {
                Some(Operand::RoundMode(r)) => u32::from(*r & 7),
                _ if to_int => 0b001,
                _ => RM_DYN,
            };
            RvEncoded::word(r_type(OP_FP, rd, rm, rs1, rs2, f7))
        }
    };

    Ok(encoded)
}
