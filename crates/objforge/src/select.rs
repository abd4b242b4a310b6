//! x86-64 instruction selection.
//!
//! Walks the opcode tree by mnemonic, then by each concrete operand's packed
//! key, and applies the two register-ISA disambiguation rules before picking
//! the highest-priority surviving template. A miss at any point is a fatal
//! internal error — the upstream phases only produce encodable shapes.

use crate::catalog::{opcode_tree, pack, ConcreteKind, Key, Template};
use crate::error::BackendError;
use crate::ir::{Bank, Inst, Operand};

/// Compute the packed tree key for a concrete operand.
///
/// A register named RAX (any access size) is rewritten to the dedicated
/// accumulator kind before lookup, so the shorter accumulator-specific
/// encodings participate in selection.
fn operand_key(op: &Operand) -> Option<Key> {
    match op {
        Operand::Reg(r) => Some(match r.bank() {
            Bank::Xmm => pack(ConcreteKind::Xmm, 16),
            _ if r.is_accumulator() => pack(ConcreteKind::Acc, r.size),
            _ => pack(ConcreteKind::Reg, r.size),
        }),
        Operand::Imm { width, .. } => Some(pack(ConcreteKind::Imm, *width)),
        Operand::Indirect { size, .. } => Some(pack(ConcreteKind::Ind, *size)),
        Operand::BaseDisp { size, .. } => Some(pack(ConcreteKind::Disp, *size)),
        Operand::RipRel { size, .. } => Some(pack(ConcreteKind::Rip, *size)),
        Operand::Sib { size, .. } => Some(pack(ConcreteKind::Sib, *size)),
        // Symbols are rewritten by the layout engine before selection;
        // rounding modes never reach the x86 selector.
        Operand::Sym { .. } | Operand::RoundMode(_) => None,
    }
}

fn no_template(inst: &Inst) -> BackendError {
    let shapes: Vec<String> = inst.operands.iter().map(|op| format!("{:?}", op)).collect();
    BackendError::NoTemplate {
        mnemonic: inst.mnemonic.clone(),
        operands: format!("[{}]", shapes.join(", ")),
    }
}

/// Select exactly one template for a concrete instruction.
///
/// # Errors
///
/// `BackendError::NoTemplate` when the tree walk dead-ends or every candidate
/// is filtered out — always a bug in an earlier phase, never user input.
pub fn select(inst: &Inst) -> Result<&'static Template, BackendError> {
    let tree = opcode_tree();
    let mut node = tree.root(&inst.mnemonic).ok_or_else(|| no_template(inst))?;

    for op in &inst.operands {
        let key = operand_key(op).ok_or_else(|| no_template(inst))?;
        node = node.children.get(&key).ok_or_else(|| no_template(inst))?;
    }

    // Hardware disambiguation: REX-requiring operands demand a REX-capable
    // template; legacy high-byte registers forbid a REX-forcing one.
    let needs_rex = inst.operands.iter().any(|op| match op {
        Operand::Reg(r) => r.requires_rex(),
        Operand::Indirect { base, .. } | Operand::BaseDisp { base, .. } => base.requires_rex(),
        Operand::Sib { base, index, .. } => base.requires_rex() || index.requires_rex(),
        _ => false,
    });
    let has_high_byte = inst
        .operands
        .iter()
        .any(|op| matches!(op, Operand::Reg(r) if r.is_high_byte()));

    // AH/BH/CH/DH alongside a REX-requiring operand is unencodable.
    if has_high_byte && needs_rex {
        return Err(no_template(inst));
    }

    let mut candidates: Vec<&'static Template> = node
        .templates
        .iter()
        .copied()
        .filter(|t| !needs_rex || t.allows_rex())
        .filter(|t| !has_high_byte || !t.allows_rex())
        .collect();

    // Priority: ascending by first-operand abstract class, stable, so the
    // accumulator-specific and catalog-earlier forms win.
    candidates.sort_by_key(|t| t.operands.first().map(|o| o.class));

    candidates.first().copied().ok_or_else(|| no_template(inst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Reg;

    #[test]
    fn cmp_rax_picks_accumulator_form() {
        let inst = Inst::new(
            "cmp",
            vec![Operand::reg(Reg::rax()), Operand::imm(4, 1000)],
        );
        let tpl = select(&inst).unwrap();
        assert_eq!(tpl.opcode, [0x3D]);
    }

    #[test]
    fn cmp_rbx_picks_modrm_form() {
        let inst = Inst::new(
            "cmp",
            vec![Operand::reg(Reg::rbx()), Operand::imm(4, 1000)],
        );
        let tpl = select(&inst).unwrap();
        assert_eq!(tpl.opcode, [0x81]);
    }

    #[test]
    fn extended_register_requires_rex_template() {
        let inst = Inst::new(
            "mov",
            vec![
                Operand::reg(Reg::int(8, 1)),
                Operand::reg(Reg::int(1, 1)),
            ],
        );
        let tpl = select(&inst).unwrap();
        assert!(tpl.allows_rex());
    }

    #[test]
    fn high_byte_register_avoids_rex_template() {
        let inst = Inst::new(
            "mov",
            vec![Operand::reg(Reg::ah()), Operand::reg(Reg::int(3, 1))],
        );
        let tpl = select(&inst).unwrap();
        assert!(!tpl.allows_rex());
    }

    #[test]
    fn high_byte_with_extended_register_is_fatal() {
        let inst = Inst::new(
            "mov",
            vec![Operand::reg(Reg::ah()), Operand::reg(Reg::int(8, 1))],
        );
        assert!(matches!(
            select(&inst),
            Err(BackendError::NoTemplate { .. })
        ));
    }

    #[test]
    fn unknown_mnemonic_is_fatal() {
        let inst = Inst::op0("frobnicate");
        assert!(select(&inst).is_err());
    }

    #[test]
    fn selection_is_deterministic() {
        let inst = Inst::new(
            "add",
            vec![Operand::reg(Reg::rcx()), Operand::reg(Reg::rdx())],
        );
        let a = select(&inst).unwrap() as *const Template;
        let b = select(&inst).unwrap() as *const Template;
        assert_eq!(a, b);
    }
}
