//! ELF output: object-file structure, executable patching, GOT/PLT
//! allocation, and the TLS rewrite.

#![cfg(feature = "x86_64")]

use objforge::{
    apply, write_executable, write_object, Arch, BackendError, GotPlt, Inst, LinkAddrs, Operand,
    OutputMode, Reg, RelocKind, Relocation, SymKind, TextSession,
};

fn rd16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn rd32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(b[off..off + 4].try_into().unwrap())
}

fn rd64(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}

/// A small module: one global function calling an undefined external.
fn sample_session() -> TextSession {
    let mut s = TextSession::new(Arch::X86_64);
    let main = s.define_label("main", SymKind::Func, false).unwrap();
    s.emit(&Inst::new(
        "mov",
        vec![Operand::reg(Reg::rax()), Operand::imm(4, 42)],
    ))
    .unwrap();
    s.emit(&Inst::new("call", vec![Operand::sym("puts", false)]))
        .unwrap();
    s.emit(&Inst::op0("ret")).unwrap();
    s.end_function(main);
    s
}

#[test]
fn object_header_fields() {
    let out = write_object(&sample_session().finish().unwrap());
    assert_eq!(&out[..4], &[0x7F, b'E', b'L', b'F']);
    assert_eq!(out[4], 2); // ELFCLASS64
    assert_eq!(out[5], 1); // little endian
    assert_eq!(rd16(&out, 16), 1); // ET_REL
    assert_eq!(rd16(&out, 18), 62); // EM_X86_64
    assert_eq!(rd16(&out, 58), 64); // e_shentsize
    assert_eq!(rd16(&out, 60), 6); // e_shnum
    assert_eq!(rd16(&out, 62), 5); // e_shstrndx
}

#[test]
fn object_sections_and_symbols() {
    let img = sample_session().finish().unwrap();
    let text_len = img.bytes.len() as u64;
    let out = write_object(&img);

    let shoff = rd64(&out, 40) as usize;
    let shdr = |i: usize| &out[shoff + 64 * i..shoff + 64 * (i + 1)];

    // .text: PROGBITS, alloc+exec, right after the ELF header.
    let text = shdr(1);
    assert_eq!(rd32(text, 4), 1);
    assert_eq!(rd64(text, 8), 2 | 4);
    assert_eq!(rd64(text, 24), 64);
    assert_eq!(rd64(text, 32), text_len);

    // .symtab: null + main + puts, no locals beyond the null entry.
    let symtab = shdr(2);
    assert_eq!(rd32(symtab, 4), 2);
    assert_eq!(rd64(symtab, 32), 3 * 24);
    assert_eq!(rd32(symtab, 44), 1); // sh_info: first global
    let symoff = rd64(symtab, 24) as usize;

    // main: global func, defined in section 1, size covers the function.
    let main = &out[symoff + 24..symoff + 48];
    assert_eq!(main[4], (1 << 4) | 2); // GLOBAL | FUNC
    assert_eq!(rd16(main, 6), 1);
    assert_eq!(rd64(main, 16), text_len);

    // puts: undefined global.
    let puts = &out[symoff + 48..symoff + 72];
    assert_eq!(main[4] >> 4, puts[4] >> 4);
    assert_eq!(rd16(puts, 6), 0);

    // .rela.text: one PLT32 entry against symbol 2 at the call's rel32.
    let rela = shdr(4);
    assert_eq!(rd32(rela, 4), 4); // SHT_RELA
    assert_eq!(rd64(rela, 32), 24);
    let roff = rd64(rela, 24) as usize;
    assert_eq!(rd64(&out, roff), text_len - 5 + 1); // r_offset
    assert_eq!(rd64(&out, roff + 8), (2u64 << 32) | 4); // sym 2, R_X86_64_PLT32
    assert_eq!(rd64(&out, roff + 16) as i64, -4);
}

#[test]
fn executable_entry_and_segment() {
    let out = write_executable(sample_session().finish().unwrap(), 0x40_0000).unwrap();
    assert_eq!(rd16(&out, 16), 2); // ET_EXEC
    assert_eq!(rd16(&out, 54), 1); // e_phnum
    // main is the first symbol defined at text start: entry = base + 120.
    assert_eq!(rd64(&out, 24), 0x40_0078);
    // PT_LOAD at the base covering the whole file.
    let ph = &out[64..120];
    assert_eq!(rd32(ph, 0), 1);
    assert_eq!(rd64(ph, 16), 0x40_0000);
    assert_eq!(rd64(ph, 32) as usize, out.len());
}

#[test]
fn executable_builds_plt_for_undefined_call() {
    let img = sample_session().finish().unwrap();
    let text_len = img.bytes.len();
    let out = write_executable(img, 0x40_0000).unwrap();
    // PLT sits 16-aligned after text: header entry + one stub.
    let plt_off = (120 + text_len + 15) & !15;
    let stub = &out[plt_off + 16..plt_off + 32];
    assert_eq!(&stub[..2], &[0xFF, 0x25]); // jmp *got(%rip)
    assert_eq!(stub[6], 0x68); // push reloc_index
    assert_eq!(stub[11], 0xE9); // jmp plt0
    // The call's rel32 now lands on the stub, not zero.
    let call_site = 120 + text_len - 5;
    assert_eq!(out[call_site], 0xE8);
    let disp = rd32(&out, call_site + 1) as i32;
    let target = (0x40_0000 + call_site as i64 + 5) + i64::from(disp);
    assert_eq!(target, 0x40_0000 + plt_off as i64 + 16);
}

#[test]
fn executable_resolves_local_branches_without_got() {
    let mut s = TextSession::new(Arch::X86_64);
    s.define_label("_start", SymKind::Func, false).unwrap();
    s.emit(&Inst::new("jmp", vec![Operand::sym("spin", true)]))
        .unwrap();
    s.define_label("spin", SymKind::Func, true).unwrap();
    s.emit(&Inst::new("jmp", vec![Operand::sym("spin", true)]))
        .unwrap();
    let out = write_executable(s.finish().unwrap(), 0x40_0000).unwrap();
    assert_eq!(rd64(&out, 24), 0x40_0078); // entry at _start
    // jmp +0 then jmp -2; the empty GOT/PLT add only alignment padding.
    assert_eq!(&out[120..124], &[0xEB, 0x00, 0xEB, 0xFE]);
    assert_eq!(out.len(), 128);
}

#[test]
fn tls_gd_window_is_rewritten() {
    let mut s = TextSession::new(Arch::X86_64);
    s.define_label("f", SymKind::Func, false).unwrap();
    s.emit_tls_gd("tls_counter");
    s.emit(&Inst::op0("ret")).unwrap();
    let out = write_executable(s.finish().unwrap(), 0x40_0000).unwrap();
    // lea+call replaced in place by mov rax, %fs:tpoff + 4-byte nop; the
    // PLT32 against __tls_get_addr inside the window is never patched.
    assert_eq!(&out[120..125], &[0x64, 0x48, 0x8B, 0x04, 0x25]);
    assert_eq!(&out[129..133], &[0x0F, 0x1F, 0x40, 0x00]);
    assert_eq!(out[133], 0xC3);
}

#[test]
fn tls_ld_window_is_rewritten() {
    let mut s = TextSession::new(Arch::X86_64);
    s.define_label("f", SymKind::Func, false).unwrap();
    s.emit_tls_ld("tls_buf");
    s.emit(&Inst::op0("ret")).unwrap();
    let out = write_executable(s.finish().unwrap(), 0x40_0000).unwrap();
    // The whole lea+call window becomes the prefixed mov rax, %fs:0.
    assert_eq!(
        &out[120..132],
        &[0x66, 0x66, 0x66, 0x64, 0x48, 0x8B, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00]
    );
    assert_eq!(out[132], 0xC3);
}

#[test]
fn tls_pattern_mismatch_is_fatal() {
    let mut s = TextSession::new(Arch::X86_64);
    s.emit_tls_gd("tls_counter");
    let mut img = s.finish().unwrap();
    img.bytes[0] = 0x90; // corrupt the window
    let gp = GotPlt::allocate(&img);
    let err = apply(
        &mut img,
        &gp,
        LinkAddrs { text: 0x40_0078, got: 0x50_0000, plt: 0x50_1000 },
    )
    .unwrap_err();
    assert!(matches!(err, BackendError::TlsPatternMismatch { .. }));
}

#[test]
fn pc32_overflow_is_fatal() {
    let mut s = TextSession::new(Arch::X86_64);
    s.emit(&Inst::new(
        "lea",
        vec![Operand::reg(Reg::rax()), Operand::sym("far_data", false)],
    ))
    .unwrap();
    s.define_label("far_data", SymKind::Object, false).unwrap();
    let mut img = s.finish().unwrap();
    // Push the addend past what a signed 32-bit displacement can absorb.
    img.relocations[0] = Relocation {
        addend: i64::from(i32::MAX),
        ..img.relocations[0].clone()
    };
    let gp = GotPlt::allocate(&img);
    let err = apply(
        &mut img,
        &gp,
        LinkAddrs { text: 0x40_0078, got: 0x50_0000, plt: 0x50_1000 },
    )
    .unwrap_err();
    assert!(matches!(err, BackendError::PcRelOverflow { .. }));
}

#[test]
fn got_slots_deduplicate_across_relocations() {
    let mut s = TextSession::new(Arch::X86_64);
    for _ in 0..2 {
        s.emit_with_reloc(
            &Inst::new(
                "mov",
                vec![Operand::reg(Reg::rax()), Operand::sym("shared", false)],
            ),
            RelocKind::GotPcRel,
        )
        .unwrap();
    }
    let img = s.finish().unwrap();
    let gp = GotPlt::allocate(&img);
    assert_eq!(gp.got_len(), 1);
    assert_eq!(gp.plt_len(), 0);
}

#[test]
fn write_image_dispatches_on_mode() {
    let obj = objforge::write_image(sample_session().finish().unwrap(), OutputMode::Object)
        .unwrap();
    assert_eq!(rd16(&obj, 16), 1);
    let exe = objforge::write_image(sample_session().finish().unwrap(), OutputMode::Executable)
        .unwrap();
    assert_eq!(rd16(&exe, 16), 2);
}
