//! Property-based tests using proptest.
//!
//! These verify backend invariants across randomly generated operand spaces,
//! complementing the golden-byte unit and integration tests.

use objforge::{Arch, Inst, Operand, Reg};
use proptest::prelude::*;

// ── Strategies ──────────────────────────────────────────────────────────

#[cfg(feature = "x86_64")]
fn arb_gp64() -> impl Strategy<Value = Reg> {
    (0u8..16).prop_map(|n| Reg::int(n, 8))
}

#[cfg(feature = "x86_64")]
fn arb_alu_mnemonic() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["mov", "add", "sub", "and", "or", "xor", "cmp", "test"])
}

#[cfg(feature = "riscv")]
fn arb_xreg() -> impl Strategy<Value = Reg> {
    (0u8..32).prop_map(|n| Reg::int(n, 8))
}

#[cfg(feature = "riscv")]
fn arb_branch_disp() -> impl Strategy<Value = i64> {
    prop_oneof![
        (1i64..=1023).prop_map(|n| n * 2),
        (-1024i64..=-1).prop_map(|n| n * 2),
    ]
}

// ── x86-64 ──────────────────────────────────────────────────────────────

#[cfg(feature = "x86_64")]
mod x86_64 {
    use super::*;
    use objforge::encode_x86;

    proptest! {
        /// Selection and encoding are deterministic: the same instruction
        /// always produces identical bytes.
        #[test]
        fn encode_is_deterministic(
            mn in arb_alu_mnemonic(),
            dst in arb_gp64(),
            src in arb_gp64(),
        ) {
            let inst = Inst::new(mn, vec![Operand::reg(dst), Operand::reg(src)]);
            let a = encode_x86(&inst).unwrap();
            let b = encode_x86(&inst).unwrap();
            prop_assert_eq!(a.to_vec(), b.to_vec());
        }

        /// Every 64-bit ALU reg-reg form carries exactly one REX prefix with
        /// W set, and the extension bits track the register indices.
        #[test]
        fn rex_tracks_extended_registers(
            mn in arb_alu_mnemonic(),
            dst in arb_gp64(),
            src in arb_gp64(),
        ) {
            let inst = Inst::new(mn, vec![Operand::reg(dst), Operand::reg(src)]);
            let bytes = encode_x86(&inst).unwrap();
            let rex = bytes[0];
            prop_assert_eq!(rex & 0xF8, 0x48, "missing REX.W in {:02X?}", bytes.to_vec());
            // Exactly one of R/B maps to each operand's high bit; which one
            // depends on the selected direction, but their OR must cover
            // every extended index in use.
            let ext_used = (dst.index >= 8) || (src.index >= 8);
            prop_assert_eq!(rex & 0b101 != 0, ext_used);
        }

        /// A 64-bit immediate in an imm32 slot either fits signed 32 bits
        /// (the field the CPU sign-extends) or fails; it is never silently
        /// truncated.
        #[test]
        fn imm32_never_truncates(value in any::<i64>()) {
            let inst = Inst::new(
                "cmp",
                vec![Operand::reg(Reg::rbx()), Operand::imm(8, value)],
            );
            match encode_x86(&inst) {
                Ok(bytes) => {
                    let enc = i64::from(i32::from_le_bytes(
                        bytes[bytes.len() - 4..].try_into().unwrap(),
                    ));
                    // Sign-extended readback recovers the value exactly.
                    prop_assert_eq!(enc, value, "imm {:#x} encoded as {:#x}", value, enc);
                }
                Err(_) => {
                    prop_assert!(i32::try_from(value).is_err());
                }
            }
        }

        /// Base+disp addressing always round-trips the displacement bytes.
        #[test]
        fn disp_bytes_roundtrip(disp in any::<i32>()) {
            let inst = Inst::new(
                "mov",
                vec![
                    Operand::reg(Reg::rax()),
                    Operand::BaseDisp { base: Reg::rbx(), disp, size: 8 },
                ],
            );
            let bytes = encode_x86(&inst).unwrap();
            prop_assert!(matches!(bytes.len(), 3 | 4 | 7), "length {}", bytes.len());
            let got = match bytes.len() {
                3 => 0, // [rbx] with disp 0
                4 => i32::from(bytes[3] as i8),
                _ => i32::from_le_bytes(bytes[3..7].try_into().unwrap()),
            };
            prop_assert_eq!(got, disp);
        }
    }
}

// ── RISC-V ──────────────────────────────────────────────────────────────

#[cfg(feature = "riscv")]
mod riscv {
    use super::*;
    use objforge::encode_rv64;

    proptest! {
        /// R-type field packing round-trips every register combination.
        #[test]
        fn r_type_fields_roundtrip(
            rd in arb_xreg(),
            rs1 in arb_xreg(),
            rs2 in arb_xreg(),
        ) {
            let inst = Inst::new(
                "sub",
                vec![Operand::reg(rd), Operand::reg(rs1), Operand::reg(rs2)],
            );
            let bytes = encode_rv64(&inst).unwrap().bytes;
            prop_assert_eq!(bytes.len(), 4);
            let w = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            prop_assert_eq!(w & 0x7F, 0b0110011);
            prop_assert_eq!((w >> 7) & 0x1F, u32::from(rd.index));
            prop_assert_eq!((w >> 15) & 0x1F, u32::from(rs1.index));
            prop_assert_eq!((w >> 20) & 0x1F, u32::from(rs2.index));
        }

        /// I-type immediates in range always round-trip sign-exact.
        #[test]
        fn addi_immediate_roundtrips(imm in -2048i64..=2047) {
            let inst = Inst::new(
                "addi",
                vec![
                    Operand::reg(Reg::a(0)),
                    Operand::reg(Reg::a(1)),
                    Operand::imm(4, imm),
                ],
            );
            let bytes = encode_rv64(&inst).unwrap().bytes;
            prop_assert_eq!(bytes.len(), 4);
            let w = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let got = i64::from(((w >> 20) as i32) << 20 >> 20);
            prop_assert_eq!(got, imm);
        }

        /// `li` reconstructs any 64-bit constant bit-for-bit when the
        /// emitted sequence is executed symbolically.
        #[test]
        fn li_reconstructs_any_value(value in any::<i64>()) {
            let inst = Inst::new(
                "li",
                vec![Operand::reg(Reg::a(0)), Operand::imm(8, value)],
            );
            let bytes = encode_rv64(&inst).unwrap().bytes;
            prop_assert!(bytes.len() <= 32);
            let mut acc: i64 = 0;
            for chunk in bytes.chunks(4) {
                let w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let opcode = w & 0x7F;
                let funct3 = (w >> 12) & 7;
                let rs1 = (w >> 15) & 0x1F;
                if opcode == 0b0110111 {
                    acc = i64::from((w & 0xFFFF_F000) as i32);
                } else if opcode == 0b0010011 && funct3 == 0 {
                    let imm = i64::from(((w >> 20) as i32) << 20 >> 20);
                    acc = if rs1 == 0 { imm } else { acc.wrapping_add(imm) };
                } else if opcode == 0b0010011 && funct3 == 1 {
                    acc <<= (w >> 20) & 0x3F;
                } else {
                    prop_assert!(false, "unexpected word {:#010x}", w);
                }
            }
            prop_assert_eq!(acc, value);
        }

        /// Branch displacement packing is linear in each immediate bit.
        #[test]
        fn branch_displacement_roundtrips(disp in arb_branch_disp()) {
            let inst = Inst::new(
                "beq",
                vec![
                    Operand::reg(Reg::a(0)),
                    Operand::reg(Reg::a(1)),
                    Operand::imm(4, disp),
                ],
            );
            let bytes = encode_rv64(&inst).unwrap().bytes;
            let w = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            // Reassemble the immediate from its scattered fields.
            let imm12 = (w >> 31) & 1;
            let imm11 = (w >> 7) & 1;
            let imm10_5 = (w >> 25) & 0x3F;
            let imm4_1 = (w >> 8) & 0xF;
            let raw = (imm12 << 12) | (imm11 << 11) | (imm10_5 << 5) | (imm4_1 << 1);
            let got = i64::from((raw as i32) << 19 >> 19);
            prop_assert_eq!(got, disp);
        }
    }
}

// ── Cross-cutting ───────────────────────────────────────────────────────

/// The one-shot helper is deterministic across architectures.
#[test]
fn assemble_insts_is_deterministic() {
    #[cfg(feature = "x86_64")]
    {
        let insts = [Inst::op0("nop"), Inst::op0("ret")];
        let a = objforge::assemble_insts(&insts, Arch::X86_64).unwrap();
        let b = objforge::assemble_insts(&insts, Arch::X86_64).unwrap();
        assert_eq!(a, b);
    }
    #[cfg(feature = "riscv")]
    {
        let insts = [Inst::op0("nop"), Inst::op0("ret")];
        let a = objforge::assemble_insts(&insts, Arch::Rv64).unwrap();
        let b = objforge::assemble_insts(&insts, Arch::Rv64).unwrap();
        assert_eq!(a, b);
    }
}
