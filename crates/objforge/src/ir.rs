//! Operand and instruction model.
//!
//! This is the upstream contract: earlier phases hand the backend a finalized
//! instruction list per function, with register allocation and calling
//! convention placement already applied. Everything here is a tagged value
//! type — no behavior beyond classification helpers.

use core::fmt;

/// Target architecture selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Arch {
    /// 64-bit x86.
    X86_64,
    /// RISC-V 64-bit (RV64GC).
    Rv64,
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::Rv64 => write!(f, "rv64"),
        }
    }
}

/// Register bank a [`Reg`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Bank {
    /// General-purpose integer registers (x86-64 GP or RISC-V x-registers).
    Int,
    /// RISC-V floating-point registers (f0–f31).
    Float,
    /// x86-64 XMM vector registers.
    Xmm,
}

const FLAG_HIGH_BYTE: u8 = 1; // AH/BH/CH/DH
const FLAG_REX_BYTE: u8 = 2; // SPL/BPL/SIL/DIL

/// A concrete, allocated register: bank + hardware index + access size in
/// bytes.
///
/// The two x86-64 byte-register quirk sets are carried as flags on the
/// handle: the legacy high-byte registers (AH/BH/CH/DH, encodings 4–7
/// without REX) and the REX-only low-byte aliases (SPL/BPL/SIL/DIL, the same
/// encodings *with* REX). Register numbers alone cannot distinguish them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reg {
    /// Hardware register number (0–15 on x86-64, 0–31 on RISC-V).
    pub index: u8,
    /// Access size in bytes (1, 2, 4, 8; 16 for XMM).
    pub size: u8,
    bank: Bank,
    flags: u8,
}

impl Reg {
    /// A general-purpose register of the given index and size.
    #[must_use]
    pub const fn int(index: u8, size: u8) -> Self {
        Self {
            index,
            size,
            bank: Bank::Int,
            flags: 0,
        }
    }

    /// A RISC-V floating-point register.
    #[must_use]
    pub const fn float(index: u8) -> Self {
        Self {
            index,
            size: 8,
            bank: Bank::Float,
            flags: 0,
        }
    }

    /// An x86-64 XMM register.
    #[must_use]
    pub const fn xmm(index: u8) -> Self {
        Self {
            index,
            size: 16,
            bank: Bank::Xmm,
            flags: 0,
        }
    }

    /// One of the legacy high-byte registers AH(4)/CH(5)/DH(6)/BH(7).
    #[must_use]
    pub const fn high_byte(encoding: u8) -> Self {
        Self {
            index: encoding,
            size: 1,
            bank: Bank::Int,
            flags: FLAG_HIGH_BYTE,
        }
    }

    /// One of the REX-only byte aliases SPL(4)/BPL(5)/SIL(6)/DIL(7).
    #[must_use]
    pub const fn rex_byte(encoding: u8) -> Self {
        Self {
            index: encoding,
            size: 1,
            bank: Bank::Int,
            flags: FLAG_REX_BYTE,
        }
    }

    /// The register bank.
    #[must_use]
    pub const fn bank(&self) -> Bank {
        self.bank
    }

    /// Whether this is AH/BH/CH/DH — incompatible with any REX prefix.
    #[must_use]
    pub const fn is_high_byte(&self) -> bool {
        self.flags & FLAG_HIGH_BYTE != 0
    }

    /// Whether this register *requires* a REX prefix: extended registers
    /// (index ≥ 8) and the SPL/BPL/SIL/DIL byte aliases.
    #[must_use]
    pub const fn requires_rex(&self) -> bool {
        self.index >= 8 || self.flags & FLAG_REX_BYTE != 0
    }

    /// Whether this is the x86-64 accumulator (AL/AX/EAX/RAX) — index 0 in
    /// the integer bank, any size. RAX-specific template forms key off this.
    #[must_use]
    pub const fn is_accumulator(&self) -> bool {
        self.index == 0 && matches!(self.bank, Bank::Int) && self.flags == 0
    }

    /// Low 3 bits of the hardware encoding (the ModRM/SIB field value).
    #[must_use]
    pub const fn low3(&self) -> u8 {
        self.index & 7
    }
}

// x86-64 named constructors. Only the ones the catalog and tests reach for;
// the generic `Reg::int(index, size)` form covers the rest.
impl Reg {
    /// RAX (64-bit accumulator).
    #[must_use]
    pub const fn rax() -> Self {
        Self::int(0, 8)
    }
    /// RCX.
    #[must_use]
    pub const fn rcx() -> Self {
        Self::int(1, 8)
    }
    /// RDX.
    #[must_use]
    pub const fn rdx() -> Self {
        Self::int(2, 8)
    }
    /// RBX.
    #[must_use]
    pub const fn rbx() -> Self {
        Self::int(3, 8)
    }
    /// RSP.
    #[must_use]
    pub const fn rsp() -> Self {
        Self::int(4, 8)
    }
    /// RBP.
    #[must_use]
    pub const fn rbp() -> Self {
        Self::int(5, 8)
    }
    /// RSI.
    #[must_use]
    pub const fn rsi() -> Self {
        Self::int(6, 8)
    }
    /// RDI.
    #[must_use]
    pub const fn rdi() -> Self {
        Self::int(7, 8)
    }
    /// R8–R15 by number.
    #[must_use]
    pub const fn rn(n: u8) -> Self {
        Self::int(n, 8)
    }
    /// EAX (32-bit accumulator).
    #[must_use]
    pub const fn eax() -> Self {
        Self::int(0, 4)
    }
    /// AL (8-bit accumulator).
    #[must_use]
    pub const fn al() -> Self {
        Self::int(0, 1)
    }
    /// AH.
    #[must_use]
    pub const fn ah() -> Self {
        Self::high_byte(4)
    }
    /// BH.
    #[must_use]
    pub const fn bh() -> Self {
        Self::high_byte(7)
    }
    /// SPL.
    #[must_use]
    pub const fn spl() -> Self {
        Self::rex_byte(4)
    }
    /// DIL.
    #[must_use]
    pub const fn dil() -> Self {
        Self::rex_byte(7)
    }
}

// RISC-V ABI-named constructors.
impl Reg {
    /// x0 / zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self::int(0, 8)
    }
    /// x1 / ra (return address).
    #[must_use]
    pub const fn ra() -> Self {
        Self::int(1, 8)
    }
    /// x2 / sp.
    #[must_use]
    pub const fn sp() -> Self {
        Self::int(2, 8)
    }
    /// x5–x7 / t0–t2 temporaries.
    #[must_use]
    pub const fn t(n: u8) -> Self {
        match n {
            0..=2 => Self::int(5 + n, 8),
            _ => Self::int(28 + (n - 3), 8), // t3–t6
        }
    }
    /// x10–x17 / a0–a7 argument registers.
    #[must_use]
    pub const fn a(n: u8) -> Self {
        Self::int(10 + n, 8)
    }
    /// x8–x9, x18–x27 / s0–s11 saved registers.
    #[must_use]
    pub const fn s(n: u8) -> Self {
        match n {
            0 | 1 => Self::int(8 + n, 8),
            _ => Self::int(18 + (n - 2), 8),
        }
    }
    /// fa0–fa7 floating-point argument registers (f10–f17).
    #[must_use]
    pub const fn fa(n: u8) -> Self {
        Self::float(10 + n)
    }
}

/// A single instruction operand.
///
/// All addressing decisions were made upstream; the backend only classifies
/// and encodes these shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operand {
    /// A register.
    Reg(Reg),
    /// An immediate with an explicit encoding width in bytes (1, 2, 4, 8).
    Imm {
        /// Encoding width in bytes.
        width: u8,
        /// The immediate bits, sign-interpreted.
        value: i64,
    },
    /// `[reg]` — simple indirect through a base register.
    Indirect {
        /// Base register.
        base: Reg,
        /// Access size in bytes.
        size: u8,
    },
    /// `[reg + disp]` — base plus signed displacement.
    BaseDisp {
        /// Base register.
        base: Reg,
        /// Signed displacement.
        disp: i32,
        /// Access size in bytes.
        size: u8,
    },
    /// `[rip + disp]` — RIP-relative.
    RipRel {
        /// Signed displacement from the end of the instruction.
        disp: i32,
        /// Access size in bytes.
        size: u8,
    },
    /// `[base + index*scale + disp]` — full SIB form.
    Sib {
        /// Base register.
        base: Reg,
        /// Index register (must not encode as RSP).
        index: Reg,
        /// Scale factor: 1, 2, 4, or 8.
        scale: u8,
        /// Signed displacement.
        disp: i32,
        /// Access size in bytes.
        size: u8,
    },
    /// A symbol reference — branch target, call target, or data address.
    Sym {
        /// Symbol name.
        name: String,
        /// Whether the symbol is module-local.
        local: bool,
    },
    /// RISC-V floating-point rounding mode field (0–7).
    RoundMode(u8),
}

impl Operand {
    /// Shorthand for a register operand.
    #[must_use]
    pub const fn reg(r: Reg) -> Self {
        Operand::Reg(r)
    }

    /// Shorthand for an immediate operand.
    #[must_use]
    pub const fn imm(width: u8, value: i64) -> Self {
        Operand::Imm { width, value }
    }

    /// Shorthand for a symbol operand.
    #[must_use]
    pub fn sym(name: &str, local: bool) -> Self {
        Operand::Sym {
            name: String::from(name),
            local,
        }
    }

    /// The memory access size, if this is a memory operand.
    #[must_use]
    pub fn mem_size(&self) -> Option<u8> {
        match self {
            Operand::Indirect { size, .. }
            | Operand::BaseDisp { size, .. }
            | Operand::RipRel { size, .. }
            | Operand::Sib { size, .. } => Some(*size),
            _ => None,
        }
    }
}

/// One finalized instruction from the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Inst {
    /// Lower-case mnemonic, e.g. `"mov"`, `"addi"`.
    pub mnemonic: String,
    /// Operand list in destination-first order.
    pub operands: Vec<Operand>,
}

impl Inst {
    /// Build an instruction.
    #[must_use]
    pub fn new(mnemonic: &str, operands: Vec<Operand>) -> Self {
        Self {
            mnemonic: String::from(mnemonic),
            operands,
        }
    }

    /// A zero-operand instruction.
    #[must_use]
    pub fn op0(mnemonic: &str) -> Self {
        Self::new(mnemonic, Vec::new())
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mnemonic, self.operands.len())
    }
}
