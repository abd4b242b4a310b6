//! Text layout engine behavior: the bounded shrink window, the preserved
//! single-pass approximation, and offset integrity after shrinks.

#![cfg(feature = "x86_64")]

use objforge::{Arch, Inst, Operand, Reg, RelocKind, SymKind, TextSession};

fn nop() -> Inst {
    Inst::op0("nop")
}

fn jmp(target: &str) -> Inst {
    Inst::new("jmp", vec![Operand::sym(target, true)])
}

/// A forward jump within reach shrinks and its displacement counts from the
/// end of the shrunk instruction.
#[test]
fn forward_jump_shrinks_and_repoints() {
    let mut s = TextSession::new(Arch::X86_64);
    s.emit(&jmp("out")).unwrap();
    for _ in 0..100 {
        s.emit(&nop()).unwrap();
    }
    s.define_label("out", SymKind::Func, true).unwrap();
    let img = s.finish().unwrap();
    // 2-byte jmp + 100 nops; disp = 102 - (0 + 2) = 100.
    assert_eq!(img.bytes.len(), 102);
    assert_eq!(&img.bytes[..2], &[0xEB, 0x64]);
}

/// A forward jump beyond the 128-byte window stays rel32.
#[test]
fn jump_past_window_stays_rel32() {
    let mut s = TextSession::new(Arch::X86_64);
    s.emit(&jmp("out")).unwrap();
    for _ in 0..126 {
        s.emit(&nop()).unwrap();
    }
    s.define_label("out", SymKind::Func, true).unwrap();
    let img = s.finish().unwrap();
    // 5-byte jmp + 126 nops; disp = 131 - 5 = 126.
    assert_eq!(img.bytes.len(), 131);
    assert_eq!(&img.bytes[..5], &[0xE9, 0x7E, 0x00, 0x00, 0x00]);
}

/// The shrink scan is one label of lookback, not a fixed point: a branch
/// whose distance only drops within rel8 range because a *later* label's
/// scan shrank something is not revisited. Pinned reference behavior.
#[test]
fn no_cascade_across_labels() {
    let mut s = TextSession::new(Arch::X86_64);
    s.emit(&jmp("a")).unwrap();
    s.emit(&jmp("b")).unwrap();
    for _ in 0..120 {
        s.emit(&nop()).unwrap();
    }
    // At definition time `a` is 130 bytes from the first jmp: out of window.
    s.define_label("a", SymKind::Func, true).unwrap();
    // `b`'s scan shrinks the second jmp, bringing the first within 128 of
    // its (already-resolved) target, but the first is never re-examined.
    s.define_label("b", SymKind::Func, true).unwrap();
    let img = s.finish().unwrap();
    assert_eq!(img.bytes.len(), 127);
    // First jmp still rel32: disp = 127 - 5 = 122, which *would* fit rel8.
    assert_eq!(&img.bytes[..5], &[0xE9, 0x7A, 0x00, 0x00, 0x00]);
    // Second jmp shrank: disp = 127 - (5 + 2) = 120.
    assert_eq!(&img.bytes[5..7], &[0xEB, 0x78]);
}

/// Conditional jumps shrink from the 6-byte 0F 8x form to 2 bytes.
#[test]
fn jcc_shrinks_to_short_form() {
    let mut s = TextSession::new(Arch::X86_64);
    s.emit(&Inst::new("jne", vec![Operand::sym("skip", true)]))
        .unwrap();
    s.emit(&nop()).unwrap();
    s.define_label("skip", SymKind::Func, true).unwrap();
    let img = s.finish().unwrap();
    assert_eq!(img.bytes, vec![0x75, 0x01, 0x90]);
}

/// Two pending branches to the same label both shrink in one scan.
#[test]
fn multiple_branches_shrink_together() {
    let mut s = TextSession::new(Arch::X86_64);
    s.emit(&jmp("end")).unwrap();
    s.emit(&nop()).unwrap();
    s.emit(&jmp("end")).unwrap();
    s.define_label("end", SymKind::Func, true).unwrap();
    let img = s.finish().unwrap();
    // jmp(2) + nop + jmp(2): disps 3 and 0.
    assert_eq!(img.bytes, vec![0xEB, 0x03, 0x90, 0xEB, 0x00]);
}

/// Symbols and relocation sites hold offset cells, so a shrink moves them.
#[test]
fn offsets_track_through_shrink() {
    let mut s = TextSession::new(Arch::X86_64);
    s.emit(&jmp("fn2")).unwrap();
    s.emit(&nop()).unwrap();
    let id = s.define_label("fn2", SymKind::Func, true).unwrap();
    s.emit(&Inst::new("call", vec![Operand::sym("puts", false)]))
        .unwrap();
    s.end_function(id);
    let img = s.finish().unwrap();
    // Post-shrink: jmp(2) + nop(1), so fn2 sits at 3 and the call's rel32
    // patch site at 4.
    let sym = img.symbols.get(id);
    assert_eq!(img.offsets.get(sym.offset), 3);
    assert_eq!(sym.size, 5);
    let reloc = &img.relocations[0];
    assert_eq!(reloc.kind, RelocKind::Plt32);
    assert_eq!(reloc.offset(&img.offsets), 4);
}

/// A label defined between two emits lands on the following record's cell.
#[test]
fn label_binds_to_next_instruction() {
    let mut s = TextSession::new(Arch::X86_64);
    s.emit(&nop()).unwrap();
    let id = s.define_label("here", SymKind::Func, true).unwrap();
    s.emit(&nop()).unwrap();
    let img = s.finish().unwrap();
    assert_eq!(img.offsets.get(img.symbols.get(id).offset), 1);
}

/// Data references through general-purpose loads pick up the register's
/// access size and relocate against `.text`.
#[test]
fn data_ref_size_follows_register() {
    let mut s = TextSession::new(Arch::X86_64);
    s.emit(&Inst::new(
        "mov",
        vec![Operand::reg(Reg::eax()), Operand::sym("counter", false)],
    ))
    .unwrap();
    let img = s.finish().unwrap();
    // mov eax, [rip+0] — 32-bit form, no REX.W.
    assert_eq!(img.bytes, vec![0x8B, 0x05, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(img.relocations[0].kind, RelocKind::Pc32);
    assert_eq!(img.relocations[0].offset(&img.offsets), 2);
    assert_eq!(img.relocations[0].addend, -4);
}

/// The TLS general-dynamic helper emits the fixed 13-byte window with its
/// two relocations at +4 and +9.
#[test]
fn tls_gd_sequence() {
    let mut s = TextSession::new(Arch::X86_64);
    s.emit_tls_gd("tls_counter");
    let img = s.finish().unwrap();
    assert_eq!(img.bytes.len(), 13);
    assert_eq!(&img.bytes[..4], &[0x66, 0x48, 0x8D, 0x3D]);
    assert_eq!(img.bytes[8], 0xE8);
    assert_eq!(img.relocations[0].kind, RelocKind::TlsGd);
    assert_eq!(img.relocations[0].offset(&img.offsets), 4);
    assert_eq!(img.relocations[1].kind, RelocKind::Plt32);
    assert_eq!(img.relocations[1].offset(&img.offsets), 9);
    let helper = img.relocations[1].symbol;
    assert_eq!(img.symbols.get(helper).name, "__tls_get_addr");
}

/// The local-dynamic helper emits the 12-byte window (no `data16` prefix)
/// with its relocations at +3 and +8.
#[test]
fn tls_ld_sequence() {
    let mut s = TextSession::new(Arch::X86_64);
    s.emit_tls_ld("tls_buf");
    let img = s.finish().unwrap();
    assert_eq!(img.bytes.len(), 12);
    assert_eq!(&img.bytes[..3], &[0x48, 0x8D, 0x3D]);
    assert_eq!(img.bytes[7], 0xE8);
    assert_eq!(img.relocations[0].kind, RelocKind::TlsLd);
    assert_eq!(img.relocations[0].offset(&img.offsets), 3);
    assert_eq!(img.relocations[1].kind, RelocKind::Plt32);
    assert_eq!(img.relocations[1].offset(&img.offsets), 8);
    let helper = img.relocations[1].symbol;
    assert_eq!(img.symbols.get(helper).name, "__tls_get_addr");
}

/// GOT-indirect loads carry the requested relocation kind.
#[test]
fn gotpcrel_load() {
    let mut s = TextSession::new(Arch::X86_64);
    s.emit_with_reloc(
        &Inst::new(
            "mov",
            vec![Operand::reg(Reg::rax()), Operand::sym("external", false)],
        ),
        RelocKind::GotPcRel,
    )
    .unwrap();
    let img = s.finish().unwrap();
    assert_eq!(img.bytes, vec![0x48, 0x8B, 0x05, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(img.relocations[0].kind, RelocKind::GotPcRel);
    assert_eq!(img.relocations[0].offset(&img.offsets), 3);
}

/// Duplicate label definitions are fatal.
#[test]
fn duplicate_label_is_fatal() {
    let mut s = TextSession::new(Arch::X86_64);
    s.define_label("twice", SymKind::Func, true).unwrap();
    s.emit(&nop()).unwrap();
    assert!(s.define_label("twice", SymKind::Func, true).is_err());
}
