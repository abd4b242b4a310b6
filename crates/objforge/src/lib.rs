//! # objforge — Retargetable Machine-Code Backend
//!
//! `objforge` turns an architecture-neutral, register-allocated instruction
//! stream into bit-exact machine code and a linkable ELF image. It covers
//! x86-64 and RISC-V64 (RV64GC) instruction selection and byte-level
//! encoding, a branch-shrinking text layout engine, and relocation
//! application with on-demand GOT/PLT construction.
//!
//! ## Quick Start
//!
//! ```rust
//! use objforge::{assemble_insts, Arch, Inst, Operand, Reg};
//!
//! let insts = [Inst::new(
//!     "mov",
//!     vec![Operand::reg(Reg::rax()), Operand::reg(Reg::rbx())],
//! )];
//! let code = assemble_insts(&insts, Arch::X86_64).unwrap();
//! assert_eq!(code, vec![0x48, 0x8B, 0xC3]);
//! ```
//!
//! ## Features
//!
//! - **Pure Rust** — no C/C++ FFI, no LLVM, no system assembler at runtime.
//! - **Two targets** — `x86_64` and `riscv` (RV64GC with compression),
//!   feature-gated.
//! - **Branch shrinking** — forward `jmp`/`jcc` emitted as `rel32` and
//!   retroactively shrunk to `rel8` when the target lands within reach.
//! - **ELF output** — relocatable objects with `.rela.text`, or minimal
//!   static executables with relocations, GOT, and PLT applied in place.

#![forbid(unsafe_code)]
// ── Pedantic lint policy ─────────────────────────────────────────────────
// An encoder intentionally performs many narrowing / sign-changing casts
// between integer widths and uses dense hex literals without separators
// (0x0F38, 0xFFD0). The lints below are expected and acceptable here.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::unreadable_literal,
    clippy::match_same_arms,
    clippy::bool_to_int_with_if,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::doc_markdown,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::single_match_else,
    clippy::missing_errors_doc,
    clippy::many_single_char_names
)]

/// x86-64 template catalog and opcode tree.
#[cfg(feature = "x86_64")]
pub(crate) mod catalog;
/// ELF64 object and executable writers.
pub mod elf;
/// Shared encoding plumbing (instruction byte buffer).
pub mod encode;
/// Fatal backend error type.
pub mod error;
/// Intermediate representation: registers, operands, instructions.
pub mod ir;
/// Two-pass text layout: label resolution, branch shrinking, relocations.
pub mod layout;
/// Relocation application and GOT/PLT construction.
pub mod reloc;
#[cfg(feature = "riscv")]
pub(crate) mod riscv;
#[cfg(feature = "x86_64")]
pub(crate) mod select;
/// Symbol table and relocation records.
pub mod symtab;
#[cfg(feature = "x86_64")]
pub(crate) mod x86;

// Re-exports
pub use elf::{write_executable, write_image, write_object, OutputMode};
pub use encode::InstBytes;
pub use error::BackendError;
pub use ir::{Arch, Bank, Inst, Operand, Reg};
pub use layout::{OffsetId, OffsetTable, TextImage, TextSession};
pub use reloc::{apply, got_policy, GotPlt, GotPolicy, LinkAddrs};
#[cfg(feature = "riscv")]
pub use riscv::{encode_rv64, RvEncoded};
pub use symtab::{RelocKind, Relocation, Section, SymId, SymKind, Symbol, SymbolTable};
#[cfg(feature = "x86_64")]
pub use x86::encode_x86;

/// Assemble a finalized instruction list into raw text-section bytes.
///
/// Every symbol referenced must be defined by a prior
/// [`TextSession::define_label`]-style flow; this convenience wrapper is for
/// self-contained sequences with no external references. Use
/// [`TextSession`] directly for labels, relocations, and ELF output.
///
/// # Errors
///
/// Returns [`BackendError`] on any selection or encoding failure, or if an
/// instruction references a symbol (undefined symbols need the full
/// session flow).
///
/// # Examples
///
/// ```rust
/// use objforge::{assemble_insts, Arch, Inst, Operand, Reg};
///
/// let insts = [Inst::op0("ret")];
/// let code = assemble_insts(&insts, Arch::X86_64).unwrap();
/// assert_eq!(code, vec![0xC3]);
/// ```
pub fn assemble_insts(insts: &[Inst], arch: Arch) -> Result<Vec<u8>, BackendError> {
    let mut session = TextSession::new(arch);
    for inst in insts {
        session.emit(inst)?;
    }
    let image = session.finish()?;
    if let Some(reloc) = image.relocations.first() {
        return Err(BackendError::UndefinedSymbol {
            name: image.symbols.get(reloc.symbol).name.clone(),
        });
    }
    Ok(image.bytes)
}
