//! Frame walking and deoptimization against generated interpreter code.

use tmplvm::deopt::{self, ExecMode, VFrameState};
use tmplvm::frame::oop_map::OopMapCache;
use tmplvm::frame::{self, Activation, Frame, FrameKind, RegisterMap};
use tmplvm::interpreter::MethodKind;
use tmplvm::runtime::basic_type::TosState;
use tmplvm::runtime::layout::{access, java_call_wrapper};
use tmplvm::runtime::memory32::{Memory32, SimMemory};
use tmplvm::runtime::method::{Constant, Metaspace, MethodBuilder, MethodDef};
use tmplvm::stubs::StubId;
use tmplvm::{RuntimeConfig, Universe};

const STACK: u32 = 0x0C00_0000;
const STACK_SIZE: u32 = 0x1_0000;
const ENTRY_FP: u32 = STACK + 0xF000;
const WRAPPER: u32 = STACK + 0xF100;
const OBJ: u32 = 0x2000_0040;

struct World {
    universe: Universe,
    mem: SimMemory,
    builder: MethodBuilder,
    caller: u32,
    callee: u32,
}

/// `static int caller(Object o) { synchronized (o) { return callee(7); } }`
/// reduced to the instructions the frames need, and
/// `static int callee(int a) { return a + 1; }`.
fn world() -> World {
    let universe = Universe::generate(RuntimeConfig::default()).unwrap();
    let mut mem = universe.simulated_memory().unwrap();
    mem.map(STACK, STACK_SIZE).unwrap();
    let layout = universe.config().layout;
    let space = Metaspace::new(layout.metaspace_base, layout.metaspace_size, layout.resolved_opcode_delta).unwrap();
    space.map(&mut mem).unwrap();
    let mut builder = MethodBuilder::new(space, true);

    // ILOAD_0 = 1A, ICONST_1 = 04, IADD = 60, IRETURN = AC
    let mut callee = MethodDef::new("callee", "(I)I", access::STATIC, vec![0x1A, 0x04, 0x60, 0xAC]).unwrap();
    callee.max_locals = 2;
    let callee = builder.build(&mut mem, callee).unwrap().method;

    // BIPUSH 7 = 10 07, INVOKESTATIC #1 = B8 00 01, IRETURN = AC
    let mut caller = MethodDef::new(
        "caller",
        "(Ljava/lang/Object;)I",
        access::STATIC,
        vec![0x10, 0x07, 0xB8, 0x00, 0x01, 0xAC],
    )
    .unwrap();
    caller.constants.push(Constant::Methodref {
        descriptor: "(I)I".into(),
        polymorphic: false,
    });
    let caller = builder.build(&mut mem, caller).unwrap().method;

    // entry frame: call wrapper at fp + 8, no older Java frames
    mem.write_u32(ENTRY_FP + 8, WRAPPER).unwrap();
    mem.write_u32(WRAPPER + java_call_wrapper::RECEIVER_OFFSET as u32, OBJ).unwrap();
    mem.write_u32(WRAPPER + java_call_wrapper::ANCHOR_SP_OFFSET as u32, 0).unwrap();

    World {
        universe,
        mem,
        builder,
        caller,
        callee,
    }
}

/// Caller suspended in the invoke, callee suspended before `iadd`.
fn two_frames(w: &mut World) -> (Frame, Frame) {
    let call_stub_return = w.universe.stubs().get(StubId::CallStubReturnAddress).unwrap();
    let caller_locals = ENTRY_FP - 0x100;
    let caller = frame::layout_activation(
        &mut w.mem,
        &Activation {
            method: w.caller,
            bci: 2,
            locals: vec![OBJ],
            expressions: vec![7],
            monitors: vec![(OBJ, 1)],
        },
        caller_locals,
        caller_locals + 4,
        call_stub_return,
        ENTRY_FP,
    )
    .unwrap();

    let invoke_return = w.universe.interpreter().returns().invoke.entry(TosState::Itos);
    let tos = caller.tos_address(&w.mem).unwrap();
    let callee = frame::layout_activation(
        &mut w.mem,
        &Activation {
            method: w.callee,
            bci: 2,
            locals: vec![7, 0],
            expressions: vec![7, 1],
            monitors: Vec::new(),
        },
        tos,
        tos + 4,
        invoke_return,
        caller.fp,
    )
    .unwrap();
    (caller, callee)
}

fn top_of(w: &World, f: Frame) -> Frame {
    let pc = w.universe.interpreter().entry_for(MethodKind::Zerolocals).unwrap();
    Frame::new(FrameKind::Interpreted, f.sp, f.fp, pc)
}

#[test]
fn test_walk_stops_at_entry_frame() {
    let mut w = world();
    let (caller, callee) = two_frames(&mut w);
    let regions = w.universe.regions().unwrap();
    let mut map = RegisterMap::new(true);
    let frames = frame::walk(&w.mem, &regions, top_of(&w, callee), &mut map).unwrap();

    let kinds: Vec<_> = frames.iter().map(|f| f.kind).collect();
    assert_eq!(kinds, vec![FrameKind::Interpreted, FrameKind::Interpreted, FrameKind::Entry]);
    assert_eq!(frames[1].fp, caller.fp);
    assert_eq!(frames[1].unextended_sp, caller.tos_address(&w.mem).unwrap() + 4);
    assert_eq!(frames[2].fp, ENTRY_FP);
    assert_eq!(frames[2].call_wrapper(&w.mem).unwrap(), WRAPPER);
    assert_eq!(map.ebp_location(), Some(caller.fp));
    assert!(!map.include_argument_oops());
}

#[test]
fn test_oops_of_every_frame() {
    let mut w = world();
    let (caller, callee) = two_frames(&mut w);
    let regions = w.universe.regions().unwrap();
    let cache = OopMapCache::new();
    let lookup = w.builder.registry();
    let mut map = RegisterMap::new(true);
    let frames = frame::walk(&w.mem, &regions, top_of(&w, callee), &mut map).unwrap();

    let mut oops = Vec::new();
    for f in &frames {
        f.oops_do(&w.mem, lookup, &cache, &RegisterMap::new(false), &mut |addr| oops.push(addr))
            .unwrap();
    }
    // callee holds only ints; caller: monitor object then local 0; entry: receiver
    let monitor = caller.monitors(&w.mem).unwrap()[0];
    assert_eq!(
        oops,
        vec![
            monitor + 4,
            caller.locals(&w.mem).unwrap(),
            WRAPPER + java_call_wrapper::RECEIVER_OFFSET as u32,
        ]
    );
    assert_eq!(cache.stats().misses, 2);
}

#[test]
fn test_gc_prologue_survives_walk() {
    let mut w = world();
    let (caller, callee) = two_frames(&mut w);
    let bcp = callee.bcp(&w.mem).unwrap();
    let mdp = caller.mdp(&w.mem).unwrap();
    for f in [callee, caller] {
        f.gc_prologue(&mut w.mem).unwrap();
    }
    assert!(frame::is_bci(callee.bcx(&w.mem).unwrap()));
    assert_eq!(callee.bci(&w.mem).unwrap(), 2);
    for f in [callee, caller] {
        f.gc_epilogue(&mut w.mem).unwrap();
    }
    assert_eq!(callee.bcx(&w.mem).unwrap(), bcp);
    assert_eq!(caller.mdp(&w.mem).unwrap(), mdp);
}

fn compiled_frame(w: &mut World) -> Frame {
    const FRAME_WORDS: u32 = 6;
    let call_stub_return = w.universe.stubs().get(StubId::CallStubReturnAddress).unwrap();
    let sp = ENTRY_FP - 0x200;
    let sender_sp = sp + (FRAME_WORDS + 1) * 4;
    w.mem.write_u32(sender_sp - 4, call_stub_return).unwrap();
    w.mem.write_u32(sender_sp - 8, ENTRY_FP).unwrap();
    w.mem.write_u32(sender_sp, OBJ).unwrap();
    Frame::new(FrameKind::Compiled { frame_words: FRAME_WORDS }, sp, sp + 0x10, 0)
}

fn scopes(w: &World) -> Vec<VFrameState> {
    vec![
        VFrameState {
            method: w.callee,
            bci: 2,
            locals: vec![7, 0],
            expressions: vec![7, 1],
            monitors: Vec::new(),
            reexecute: false,
        },
        VFrameState {
            method: w.caller,
            bci: 2,
            locals: vec![OBJ],
            expressions: vec![7],
            monitors: vec![(OBJ, 1)],
            reexecute: false,
        },
    ]
}

#[test]
fn test_deoptimized_frames_resume_in_interpreter() {
    let mut w = world();
    let compiled = compiled_frame(&mut w);
    let vframes = scopes(&w);
    let interp = w.universe.interpreter();
    let unroll =
        deopt::fetch_unroll_info(&w.mem, w.builder.registry(), interp, &compiled, &vframes, ExecMode::Deopt).unwrap();
    assert_eq!(unroll.frame_pcs[1], interp.deopt_entry(TosState::Itos, 3).unwrap());
    assert_eq!(unroll.frame_pcs[2], interp.deopt_entry(TosState::Vtos, 1).unwrap());
    for &pc in &unroll.frame_pcs[1..] {
        assert!(interp.contains(pc), "{pc:#x} outside the interpreter");
    }

    let unpacked = deopt::unpack_frames(&mut w.mem, &unroll, &vframes).unwrap();
    let top = Frame::new(FrameKind::Interpreted, unpacked.resume_sp, unpacked.resume_fp, unpacked.resume_pc);
    let regions = w.universe.regions().unwrap();
    let frames = frame::walk(&w.mem, &regions, top, &mut RegisterMap::new(true)).unwrap();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].method(&w.mem).unwrap(), w.callee);
    assert_eq!(frames[1].method(&w.mem).unwrap(), w.caller);
    assert_eq!(frames[1].bci(&w.mem).unwrap(), 2);
    assert_eq!(frames[2].kind, FrameKind::Entry);
    assert!(deopt::unwind_callee_save_values(&frames[1], &RegisterMap::default()).is_ok());
}

#[test]
fn test_exception_mode_resumes_at_rethrow() {
    let mut w = world();
    let compiled = compiled_frame(&mut w);
    let vframes = scopes(&w);
    let interp = w.universe.interpreter();
    let unroll =
        deopt::fetch_unroll_info(&w.mem, w.builder.registry(), interp, &compiled, &vframes, ExecMode::Exception)
            .unwrap();
    assert_eq!(unroll.frame_pcs[2], interp.rethrow_exception_entry());

    let unroll =
        deopt::fetch_unroll_info(&w.mem, w.builder.registry(), interp, &compiled, &vframes, ExecMode::Reexecute)
            .unwrap();
    assert_eq!(unroll.frame_pcs[2], interp.deopt_reexecute_entry());
}
