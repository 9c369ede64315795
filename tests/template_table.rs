//! The generated template interpreter as seen from outside the crate.

use tmplvm::interpreter::{CodeletKind, MethodKind, TemplateTable};
use tmplvm::runtime::basic_type::TosState;
use tmplvm::runtime::bytecodes::Bytecode;
use tmplvm::runtime::globals::VmGlobals;
use tmplvm::runtime::layout::{access, method};
use tmplvm::runtime::memory32::Memory32;
use tmplvm::runtime::method::{MathIntrinsic, Metaspace, MethodBuilder, MethodDef};
use tmplvm::{RuntimeConfig, Universe};

fn generate(config: RuntimeConfig) -> Universe {
    Universe::generate(config).unwrap()
}

#[test]
fn test_defined_bytecodes_dispatch_into_the_interpreter() {
    let universe = generate(RuntimeConfig::default());
    let interp = universe.interpreter();
    let table = TemplateTable::new();
    for t in table.templates() {
        let entry = interp.tables().normal.entry(t.tos_in, t.bytecode.code());
        let codelet = interp.codelet_at(entry).unwrap();
        assert_eq!(codelet.kind, CodeletKind::Template, "{}", t.bytecode);
        assert_eq!(codelet.name, t.bytecode.name());
    }
    for opcode in Bytecode::ALL.len()..256 {
        let entry = interp.tables().normal.entry(TosState::Vtos, opcode as u8);
        assert_eq!(entry, interp.unimplemented_bytecode(), "{opcode:#x}");
    }
}

#[test]
fn test_codelets_are_disjoint_and_ordered() {
    let universe = generate(RuntimeConfig::default());
    let codelets = universe.interpreter().codelets();
    for pair in codelets.windows(2) {
        assert!(pair[0].end <= pair[1].begin, "{} overlaps {}", pair[0].name, pair[1].name);
    }
    assert!(codelets.iter().all(|c| c.size() > 0));
}

#[test]
fn test_safepoint_tables_swap_in_memory() {
    let universe = generate(RuntimeConfig::default());
    let mut mem = universe.simulated_memory().unwrap();
    let g = universe.globals();
    let tables = universe.interpreter().tables();
    let iadd = Bytecode::Iadd.code();
    let slot = VmGlobals::dispatch_slot(g.dispatch_active, TosState::Itos.index(), iadd);
    let normal = tables.normal.entry(TosState::Itos, iadd);
    let safepoint = tables.safepoint.entry(TosState::Itos, iadd);
    assert_ne!(normal, safepoint);

    assert_eq!(mem.read_u32(slot).unwrap(), normal);
    tables.notice_safepoints(&mut mem, g).unwrap();
    assert_eq!(mem.read_u32(slot).unwrap(), safepoint);
    tables.ignore_safepoints(&mut mem, g).unwrap();
    assert_eq!(mem.read_u32(slot).unwrap(), normal);
}

#[test]
fn test_wide_table_only_for_wideable_bytecodes() {
    let universe = generate(RuntimeConfig::default());
    let mut mem = universe.simulated_memory().unwrap();
    universe.install(&mut mem).unwrap();
    let interp = universe.interpreter();
    let g = universe.globals();
    let iinc = mem.read_u32(g.wentry_table + 4 * Bytecode::Iinc.code() as u32).unwrap();
    assert_eq!(interp.codelet_at(iinc).unwrap().kind, CodeletKind::WideTemplate);
    let iadd = mem.read_u32(g.wentry_table + 4 * Bytecode::Iadd.code() as u32).unwrap();
    assert_eq!(iadd, interp.unimplemented_bytecode());
}

#[test]
fn test_link_method_picks_entry_by_kind() {
    let universe = generate(RuntimeConfig::default());
    let mut mem = universe.simulated_memory().unwrap();
    let layout = universe.config().layout;
    let space = Metaspace::new(layout.metaspace_base, layout.metaspace_size, layout.resolved_opcode_delta).unwrap();
    space.map(&mut mem).unwrap();
    let mut builder = MethodBuilder::new(space, false);
    let interp = universe.interpreter();

    let mut build = |name: &str, desc: &str, flags: u32, code: Vec<u8>, intrinsic: Option<MathIntrinsic>| {
        let mut def = MethodDef::new(name, desc, flags, code).unwrap();
        def.intrinsic = intrinsic;
        builder.build(&mut mem, def).unwrap().method
    };
    // RETURN = B1; ICONST_0 = 03, POP = 57
    let empty = build("e", "()V", access::STATIC, vec![0xB1], None);
    let plain = build("p", "()V", access::STATIC, vec![0x03, 0x57, 0xB1], None);
    let sync = build("s", "()V", access::STATIC | access::SYNCHRONIZED, vec![0xB1], None);
    let sqrt = build("sqrt", "(D)D", access::STATIC, vec![0x18, 0x00, 0xAF], Some(MathIntrinsic::Sqrt));

    let cases = [
        (empty, MethodKind::Empty),
        (plain, MethodKind::Zerolocals),
        (sync, MethodKind::ZerolocalsSynchronized),
        (sqrt, MethodKind::Math(MathIntrinsic::Sqrt)),
    ];
    for (m, kind) in cases {
        assert_eq!(interp.link_method(&mut mem, m).unwrap(), kind);
        let entry = interp.entry_for(kind).unwrap();
        assert_eq!(mem.read_u32(m + method::INTERPRETER_ENTRY_OFFSET as u32).unwrap(), entry);
        assert_eq!(mem.read_u32(m + method::FROM_INTERPRETED_OFFSET as u32).unwrap(), entry);
    }
}

#[test]
fn test_method_entries_are_distinct() {
    let universe = generate(RuntimeConfig::default());
    let mut entries: Vec<u32> = universe.interpreter().method_entries().map(|(_, a)| a).collect();
    let count = entries.len();
    entries.sort_unstable();
    entries.dedup();
    assert_eq!(entries.len(), count);
    assert_eq!(count, MethodKind::all().len());
}

#[test]
fn test_configuration_variants_generate() {
    let variants: Vec<Box<dyn Fn(&mut RuntimeConfig)>> = vec![
        Box::new(|c| c.profile_interpreter = false),
        Box::new(|c| {
            c.rewrite_bytecodes = false;
            c.rewrite_frequent_pairs = false;
        }),
        Box::new(|c| c.use_on_stack_replacement = false),
        Box::new(|c| c.use_tlab = false),
        Box::new(|c| c.is_mp = false),
        Box::new(|c| c.verify_oops = true),
        Box::new(|c| {
            c.cpu.use_sse = 0;
            c.cpu.mmx = false;
        }),
    ];
    let base = generate(RuntimeConfig::default()).summary().interpreter.code_bytes;
    for (i, tweak) in variants.iter().enumerate() {
        let mut config = RuntimeConfig::default();
        tweak(&mut config);
        let summary = Universe::generate(config)
            .unwrap_or_else(|e| panic!("variant {i}: {e}"))
            .summary();
        assert!(summary.interpreter.templates > 200, "variant {i}");
        assert!(summary.interpreter.code_bytes > 0 && base > 0);
    }
}

#[test]
fn test_profiling_grows_the_interpreter() {
    let profiled = generate(RuntimeConfig::default()).summary();
    let mut config = RuntimeConfig::default();
    config.profile_interpreter = false;
    let plain = generate(config).summary();
    assert!(profiled.interpreter.code_bytes > plain.interpreter.code_bytes);
}

#[test]
fn test_deopt_entries_cover_every_state() {
    let universe = generate(RuntimeConfig::default());
    let interp = universe.interpreter();
    for state in TosState::ALL {
        for step in 0..=5 {
            let entry = interp.deopt_entry(state, step).unwrap();
            assert!(interp.contains(entry), "{state:?}/{step}");
        }
    }
    assert!(interp.deopt_entry(TosState::Vtos, 64).is_err());
}
