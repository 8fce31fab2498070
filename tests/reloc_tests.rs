//! Integration tests for module relocation and verification.

use tmpl_module_cache::module::format::{OP_CALL, OP_TEXT, OP_VAR};
use tmpl_module_cache::module::reloc;
use tmpl_module_cache::{CompiledModule, ModuleBuilder, ModuleView};

fn sample() -> CompiledModule {
    let mut builder = ModuleBuilder::new();
    builder.flags(0x5);
    builder
        .begin_program(0)
        .text("<h1>")
        .var("title")
        .text("</h1>")
        .call(1)
        .halt()
        .begin_program(1)
        .var_raw("body")
        .halt();
    builder.finish()
}

#[test]
fn test_patch_after_normalize_preserves_reachable_content() {
    let original = sample();

    for base in [0u64, 0x1000, u64::MAX / 2] {
        let mut copy = original.clone();
        reloc::normalize(&mut copy, base).unwrap();
        reloc::patch(&mut copy).unwrap();
        assert!(
            reloc::same_content(original.as_bytes(), copy.as_bytes()).unwrap(),
            "content diverged after rebasing through {base:#x}"
        );
    }
}

#[test]
fn test_patched_module_resolves_live_data() {
    let mut module = sample();
    reloc::normalize(&mut module, 0).unwrap();
    reloc::patch(&mut module).unwrap();

    let view = ModuleView::new(module.as_bytes()).unwrap();
    let programs: Vec<_> = view.programs().collect();
    assert_eq!(programs.len(), 2);

    let ops: Vec<_> = view.opcodes_of(&programs[0]).collect();
    assert_eq!(ops[0].op, OP_TEXT);
    assert_eq!(view.data_at(ops[0].operand), b"<h1>");
    assert_eq!(ops[1].op, OP_VAR);
    assert_eq!(view.data_at(ops[1].operand), b"title");
    assert_eq!(ops[3].op, OP_CALL);
    assert_eq!(ops[3].arg, 1);

    // In patched form every data reference is a live address into the blob.
    let base = module.as_bytes().as_ptr() as u64;
    let header = *ModuleView::new(module.as_bytes()).unwrap().header();
    assert_eq!(header.self_addr, base);
    assert!(header.data_ref >= base);
}

#[test]
fn test_hash_survives_relocation_and_copying() {
    let mut module = sample();
    let stamped = reloc::generate_hash(&mut module).unwrap();

    let mut copy = module.clone();
    reloc::normalize(&mut copy, 0x7777_0000).unwrap();
    assert!(reloc::verify(copy.as_bytes(), true).unwrap());
    assert_eq!(reloc::generate_hash(&mut copy).unwrap(), stamped);
}

#[test]
fn test_verify_flags_tampered_blob_as_miss() {
    let module = sample();
    let mut bytes = module.into_bytes();
    let mid = bytes.len() - 3;
    bytes[mid] ^= 0x40;

    assert!(!reloc::verify(&bytes, false).unwrap());
    assert!(reloc::verify(&bytes, true).is_err());
}

#[test]
fn test_builder_flags_and_timestamp_carried() {
    let mut builder = ModuleBuilder::new();
    builder.flags(0xbeef).timestamp(123_456);
    builder.begin_program(7).halt();
    let module = builder.finish();

    let header = module.header();
    assert_eq!(header.flags, 0xbeef);
    assert_eq!(header.timestamp, 123_456);
    assert_eq!(header.program_count, 1);
}
