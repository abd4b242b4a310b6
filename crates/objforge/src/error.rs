//! Error types for the backend.
//!
//! Every variant here is *fatal by contract*: inputs reaching this layer were
//! already validated by earlier compiler phases, so any error indicates a bug
//! upstream (malformed IR, an unsupported construct, or corrupted state).
//! Drivers are expected to abort the compilation on the first `Err` — there
//! are no recovery or partial-output semantics at this layer.

use core::fmt;

/// A fatal backend error, naming the offending mnemonic, operand, or symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BackendError {
    /// No x86-64 template matched the mnemonic + operand shape.
    NoTemplate {
        /// The mnemonic that failed selection.
        mnemonic: String,
        /// Description of the operand shape that was looked up.
        operands: String,
    },

    /// No RISC-V signature matched the mnemonic + operand shape.
    NoSignature {
        /// The mnemonic that failed selection.
        mnemonic: String,
        /// Number of operands supplied.
        count: usize,
    },

    /// A template operand carried an encoding role the encoder cannot bind
    /// to the concrete operand it was given.
    BadEncodingRole {
        /// The mnemonic being encoded.
        mnemonic: String,
        /// Zero-based operand position.
        position: usize,
    },

    /// Immediate value exceeds the signed range of its encoding field.
    /// The caller must materialize the value into a scratch register instead.
    ImmediateOverflow {
        /// The mnemonic being encoded.
        mnemonic: String,
        /// The immediate value that overflowed.
        value: i64,
        /// Minimum allowed value.
        min: i64,
        /// Maximum allowed value.
        max: i64,
    },

    /// High-byte register (AH/BH/CH/DH) combined with an operand that forces
    /// a REX prefix — the two are mutually exclusive on x86-64.
    HighByteRexConflict {
        /// The mnemonic being encoded.
        mnemonic: String,
    },

    /// A PC-relative 32-bit relocation result does not fit in signed 32 bits.
    PcRelOverflow {
        /// Target symbol name.
        symbol: String,
        /// The displacement that overflowed.
        disp: i64,
    },

    /// The bytes at a TLS relocation site do not match the documented
    /// `lea`+`call` sequence this relocation kind rewrites.
    TlsPatternMismatch {
        /// Target symbol name.
        symbol: String,
        /// Offset of the relocation site in the text section.
        offset: u64,
    },

    /// A symbol was defined more than once in the same session.
    DuplicateSymbol {
        /// The symbol name.
        name: String,
    },

    /// A symbol remained undefined where a final address was required
    /// (executable output with no GOT/PLT policy covering it).
    UndefinedSymbol {
        /// The symbol name.
        name: String,
    },
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::NoTemplate { mnemonic, operands } => {
                write!(f, "no template for '{}' with operands {}", mnemonic, operands)
            }
            BackendError::NoSignature { mnemonic, count } => {
                write!(
                    f,
                    "no RISC-V signature for '{}' with {} operand(s)",
                    mnemonic, count
                )
            }
            BackendError::BadEncodingRole { mnemonic, position } => {
                write!(
                    f,
                    "'{}': operand {} cannot be bound to its encoding role",
                    mnemonic, position
                )
            }
            BackendError::ImmediateOverflow {
                mnemonic,
                value,
                min,
                max,
            } => {
                write!(
                    f,
                    "'{}': immediate {} out of range [{}..{}]",
                    mnemonic, value, min, max
                )
            }
            BackendError::HighByteRexConflict { mnemonic } => {
                write!(
                    f,
                    "'{}': high-byte register (AH/BH/CH/DH) cannot combine with a REX-requiring operand",
                    mnemonic
                )
            }
            BackendError::PcRelOverflow { symbol, disp } => {
                write!(
                    f,
                    "PC-relative displacement to '{}' overflows 32 bits ({})",
                    symbol, disp
                )
            }
            BackendError::TlsPatternMismatch { symbol, offset } => {
                write!(
                    f,
                    "TLS sequence for '{}' at text offset {:#x} does not match the expected lea+call pattern",
                    symbol, offset
                )
            }
            BackendError::DuplicateSymbol { name } => {
                write!(f, "symbol '{}' defined more than once", name)
            }
            BackendError::UndefinedSymbol { name } => {
                write!(f, "symbol '{}' is undefined at final layout", name)
            }
        }
    }
}

impl std::error::Error for BackendError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_template_display() {
        let err = BackendError::NoTemplate {
            mnemonic: "mov".into(),
            operands: "[reg:8, imm:16]".into(),
        };
        assert_eq!(
            format!("{}", err),
            "no template for 'mov' with operands [reg:8, imm:16]"
        );
    }

    #[test]
    fn immediate_overflow_display() {
        let err = BackendError::ImmediateOverflow {
            mnemonic: "addi".into(),
            value: 4096,
            min: -2048,
            max: 2047,
        };
        assert_eq!(
            format!("{}", err),
            "'addi': immediate 4096 out of range [-2048..2047]"
        );
    }

    #[test]
    fn pc_rel_overflow_display() {
        let err = BackendError::PcRelOverflow {
            symbol: "far_data".into(),
            disp: 1 << 33,
        };
        assert_eq!(
            format!("{}", err),
            "PC-relative displacement to 'far_data' overflows 32 bits (8589934592)"
        );
    }

    #[test]
    fn tls_pattern_mismatch_display() {
        let err = BackendError::TlsPatternMismatch {
            symbol: "tls_var".into(),
            offset: 0x40,
        };
        assert_eq!(
            format!("{}", err),
            "TLS sequence for 'tls_var' at text offset 0x40 does not match the expected lea+call pattern"
        );
    }

    #[test]
    fn duplicate_symbol_display() {
        let err = BackendError::DuplicateSymbol { name: "main".into() };
        assert_eq!(format!("{}", err), "symbol 'main' defined more than once");
    }
}
