//! Code generation and oop-map computation benchmarks.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::time::Duration;

use tmplvm::frame::oop_map::{MethodCode, MethodOopMaps};
use tmplvm::runtime::layout::access;
use tmplvm::runtime::memory32::{Memory32, SimMemory};
use tmplvm::runtime::method::{Metaspace, MethodBuilder, MethodDef, MethodView};
use tmplvm::{RuntimeConfig, Universe};

fn benchmark_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("generation");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("universe_default", |b| {
        b.iter(|| black_box(Universe::generate(RuntimeConfig::default()).unwrap()))
    });
    group.bench_function("universe_no_profile", |b| {
        let mut config = RuntimeConfig::default();
        config.profile_interpreter = false;
        b.iter(|| black_box(Universe::generate(config.clone()).unwrap()))
    });
    group.finish();
}

/// A counting loop with a branch in the body:
/// `int s = 0; for (int i = 0; i < n; i++) { if (i & 1) s += i; } return s;`
fn loop_method() -> Vec<u8> {
    vec![
        0x03, 0x3C, // iconst_0, istore_1
        0x03, 0x3D, // iconst_0, istore_2
        0x1C, 0x1A, 0xA2, 0x00, 0x13, // iload_2, iload_0, if_icmpge +19
        0x1C, 0x04, 0x7E, 0x99, 0x00, 0x07, // iload_2, iconst_1, iand, ifeq +7
        0x1B, 0x1C, 0x60, 0x3C, // iload_1, iload_2, iadd, istore_1
        0x84, 0x02, 0x01, // iinc 2 1
        0xA7, 0xFF, 0xEE, // goto -18
        0x1B, 0xAC, // iload_1, ireturn
    ]
}

fn benchmark_oop_maps(c: &mut Criterion) {
    let config = RuntimeConfig::default();
    let layout = config.layout;
    let mut mem = SimMemory::new();
    let space = Metaspace::new(layout.metaspace_base, layout.metaspace_size, layout.resolved_opcode_delta).unwrap();
    space.map(&mut mem).unwrap();
    let mut builder = MethodBuilder::new(space, false);
    let mut def = MethodDef::new("sum", "(I)I", access::STATIC, loop_method()).unwrap();
    def.max_locals = 3;
    let method = builder.build(&mut mem, def).unwrap().method;
    let code = MethodCode::read(&mem as &dyn Memory32, MethodView::at(method)).unwrap();

    let mut group = c.benchmark_group("oop_maps");
    group.bench_function("compute_loop", |b| {
        b.iter(|| black_box(MethodOopMaps::compute(builder.registry(), &code).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, benchmark_generation, benchmark_oop_maps);
criterion_main!(benches);
