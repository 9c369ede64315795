//! Deoptimization: replacing a compiled activation by interpreter frames.
//!
//! The compiled frame's scopes arrive as `VFrameState`s, youngest first.
//! `fetch_unroll_info` sizes the interpreter frames that will replace it and
//! `unpack_frames` writes them over the compiled frame, oldest at the
//! highest address, and picks the interpreter entry each one resumes at.

use serde::Serialize;

use crate::error::{VmError, VmResult};
use crate::frame::{self, Activation, Frame, RegisterMap};
use crate::interpreter::TemplateInterpreter;
use crate::runtime::basic_type::{BasicType, TosState};
use crate::runtime::bytecodes::{self, Bytecode};
use crate::runtime::layout::WORD_SIZE;
use crate::runtime::memory32::Memory32;
use crate::runtime::method::{MemberRef, MethodView, SignatureLookup};

const WORD: u32 = WORD_SIZE as u32;

/// How the youngest frame resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ExecMode {
    /// Continue after the current bytecode
    Deopt = 0,
    /// Rethrow the pending exception at the current bytecode
    Exception = 1,
    UncommonTrap = 2,
    Reexecute = 3,
}

impl ExecMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ExecMode::Deopt),
            1 => Some(ExecMode::Exception),
            2 => Some(ExecMode::UncommonTrap),
            3 => Some(ExecMode::Reexecute),
            _ => None,
        }
    }
}

/// Why compiled code gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum DeoptReason {
    None = 0,
    NullCheck,
    NullAssert,
    RangeCheck,
    ClassCheck,
    ArrayCheck,
    Intrinsic,
    Bimorphic,
    Unloaded,
    Uninitialized,
    Unreached,
    Unhandled,
    Constraint,
    Div0Check,
    Age,
    Predicate,
    LoopLimitCheck,
    SpeculateClassCheck,
    UnstableIf,
    Tenured,
}

impl DeoptReason {
    pub const ALL: &'static [DeoptReason] = &[
        DeoptReason::None,
        DeoptReason::NullCheck,
        DeoptReason::NullAssert,
        DeoptReason::RangeCheck,
        DeoptReason::ClassCheck,
        DeoptReason::ArrayCheck,
        DeoptReason::Intrinsic,
        DeoptReason::Bimorphic,
        DeoptReason::Unloaded,
        DeoptReason::Uninitialized,
        DeoptReason::Unreached,
        DeoptReason::Unhandled,
        DeoptReason::Constraint,
        DeoptReason::Div0Check,
        DeoptReason::Age,
        DeoptReason::Predicate,
        DeoptReason::LoopLimitCheck,
        DeoptReason::SpeculateClassCheck,
        DeoptReason::UnstableIf,
        DeoptReason::Tenured,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

/// What to do with the compiled code afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum DeoptAction {
    None = 0,
    MaybeRecompile,
    Reinterpret,
    MakeNotEntrant,
    MakeNotCompilable,
}

impl DeoptAction {
    pub const ALL: &'static [DeoptAction] = &[
        DeoptAction::None,
        DeoptAction::MaybeRecompile,
        DeoptAction::Reinterpret,
        DeoptAction::MakeNotEntrant,
        DeoptAction::MakeNotCompilable,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

const ACTION_BITS: u32 = 3;
const REASON_BITS: u32 = 5;
const ACTION_SHIFT: u32 = 0;
const REASON_SHIFT: u32 = ACTION_SHIFT + ACTION_BITS;
const INDEX_SHIFT: u32 = REASON_SHIFT + REASON_BITS;

/// Pack a trap request. A constant-pool `index` alone means "class not
/// loaded"; otherwise the request is negative and carries reason and action.
pub fn make_trap_request(reason: DeoptReason, action: DeoptAction, index: Option<u32>) -> i32 {
    match index {
        Some(index) => index as i32,
        None => !(((reason as i32) << REASON_SHIFT) | ((action as i32) << ACTION_SHIFT)),
    }
}

pub fn trap_request_reason(request: i32) -> DeoptReason {
    if request < 0 {
        let bits = ((!request as u32) >> REASON_SHIFT) & ((1 << REASON_BITS) - 1);
        DeoptReason::from_u8(bits as u8).unwrap_or(DeoptReason::None)
    } else {
        DeoptReason::Unloaded
    }
}

pub fn trap_request_action(request: i32) -> DeoptAction {
    if request < 0 {
        let bits = ((!request as u32) >> ACTION_SHIFT) & ((1 << ACTION_BITS) - 1);
        DeoptAction::from_u8(bits as u8).unwrap_or(DeoptAction::None)
    } else {
        DeoptAction::Reinterpret
    }
}

pub fn trap_request_index(request: i32) -> Option<u32> {
    (request >= 0).then_some(request as u32)
}

/// Bits above the reason, kept for a debug id.
pub fn trap_request_debug_bits(request: i32) -> u32 {
    if request < 0 { (!request as u32) >> INDEX_SHIFT } else { 0 }
}

/// One interpreter-level scope of the compiled frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VFrameState {
    pub method: u32,
    pub bci: u32,
    pub locals: Vec<u32>,
    /// Oldest first; a caller's stack still holds the outgoing arguments
    pub expressions: Vec<u32>,
    /// `(object, displaced header)`, oldest first
    pub monitors: Vec<(u32, u32)>,
    /// Execute the bytecode at `bci` again instead of continuing after it
    pub reexecute: bool,
}

impl VFrameState {
    fn activation(&self) -> Activation {
        Activation {
            method: self.method,
            bci: self.bci,
            locals: self.locals.clone(),
            expressions: self.expressions.clone(),
            monitors: self.monitors.clone(),
        }
    }
}

/// Sizes and return addresses of the frames replacing a compiled frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnrollBlock {
    /// Bytes between the compiled frame's sp and its sender sp
    pub size_of_deoptimized_frame: u32,
    /// Bytes the oldest frame's extra locals reach below the caller's sp
    pub caller_adjustment: u32,
    pub number_of_frames: usize,
    pub total_frame_sizes: u32,
    /// Bytes per frame, oldest first
    pub frame_sizes: Vec<u32>,
    /// Return address of each frame, oldest first, then the pc the youngest
    /// resumes at
    pub frame_pcs: Vec<u32>,
    /// Result the youngest frame resumes with
    pub return_type: BasicType,
    /// Caller's `ebp`
    pub initial_info: u32,
    pub unpack_kind: ExecMode,
    /// Sender sp of the compiled frame
    pub sender_sp: u32,
}

/// Interpreter entries a rebuilt frame can resume at.
pub trait ResumeEntries {
    fn deopt_entry(&self, state: TosState, step: usize) -> VmResult<u32>;
    fn reexecute_entry(&self) -> u32;
    fn rethrow_entry(&self) -> u32;
}

impl ResumeEntries for TemplateInterpreter {
    fn deopt_entry(&self, state: TosState, step: usize) -> VmResult<u32> {
        TemplateInterpreter::deopt_entry(self, state, step)
    }

    fn reexecute_entry(&self) -> u32 {
        self.deopt_reexecute_entry()
    }

    fn rethrow_entry(&self) -> u32 {
        self.rethrow_exception_entry()
    }
}

fn invoke_result(lookup: &dyn SignatureLookup, vf: &VFrameState) -> BasicType {
    match lookup.member_at(vf.method, vf.bci) {
        Ok(MemberRef::Invoke { result, .. }) => result,
        _ => BasicType::Void,
    }
}

fn bytecode_length(mem: &dyn Memory32, vf: &VFrameState) -> VmResult<usize> {
    let code = MethodView::at(vf.method).code(mem)?;
    let raw = bytecodes::code_at(&code, vf.bci as usize)?;
    match raw.java_code().length() {
        0 => bytecodes::length_at(&code, vf.bci as usize),
        n => Ok(n as usize),
    }
}

fn is_invoke_at(mem: &dyn Memory32, vf: &VFrameState) -> VmResult<bool> {
    let op = mem.read_u8(MethodView::at(vf.method).code_base(mem)? + vf.bci)?;
    Ok(Bytecode::from_u8(op).is_some_and(|b| b.java_code().is_invoke()))
}

/// Pc a rebuilt frame resumes at, with the result it resumes with.
fn resume_pc(
    mem: &dyn Memory32,
    lookup: &dyn SignatureLookup,
    entries: &dyn ResumeEntries,
    vf: &VFrameState,
    is_top: bool,
    mode: ExecMode,
) -> VmResult<(u32, BasicType)> {
    if is_top {
        match mode {
            ExecMode::Exception => return Ok((entries.rethrow_entry(), BasicType::Void)),
            ExecMode::Reexecute => return Ok((entries.reexecute_entry(), BasicType::Void)),
            ExecMode::Deopt | ExecMode::UncommonTrap if vf.reexecute => {
                return Ok((entries.reexecute_entry(), BasicType::Void));
            }
            ExecMode::Deopt | ExecMode::UncommonTrap => {}
        }
    }
    let at_invoke = is_invoke_at(mem, vf)?;
    if !is_top && !at_invoke {
        return Err(VmError::Deopt(format!(
            "caller scope {:#x}@{} is not at an invoke",
            vf.method, vf.bci
        )));
    }
    let result = if at_invoke { invoke_result(lookup, vf) } else { BasicType::Void };
    let pc = entries.deopt_entry(result.tos_state(), bytecode_length(mem, vf)?)?;
    Ok((pc, result))
}

fn params_of(mem: &dyn Memory32, vf: &VFrameState) -> VmResult<u32> {
    Ok(MethodView::at(vf.method).size_of_parameters(mem)? as u32)
}

/// Size the interpreter frames replacing `compiled`.
pub fn fetch_unroll_info(
    mem: &dyn Memory32,
    lookup: &dyn SignatureLookup,
    entries: &dyn ResumeEntries,
    compiled: &Frame,
    vframes: &[VFrameState],
    mode: ExecMode,
) -> VmResult<UnrollBlock> {
    let frame::FrameKind::Compiled { frame_words } = compiled.kind else {
        return Err(VmError::Deopt(format!("{:?} frame cannot be deoptimized", compiled.kind)));
    };
    let (Some(youngest), Some(oldest)) = (vframes.first(), vframes.last()) else {
        return Err(VmError::Deopt("no scopes to unpack".into()));
    };

    let sender_sp = compiled.unextended_sp + (frame_words + 1) * WORD;
    let caller_pc = mem.read_u32(sender_sp - WORD)?;
    let caller_fp = mem.read_u32(sender_sp - 2 * WORD)?;

    let oldest_view = MethodView::at(oldest.method);
    let oldest_extra = (oldest_view.max_locals(mem)? as u32).saturating_sub(params_of(mem, oldest)?);

    let mut frame_sizes = Vec::with_capacity(vframes.len());
    let mut frame_pcs = vec![caller_pc];
    let mut return_type = BasicType::Void;
    for (index, vf) in vframes.iter().enumerate().rev() {
        let is_top = index == 0;
        let view = MethodView::at(vf.method);
        let stack_words = if is_top {
            view.max_stack(mem)? as u32
        } else {
            vf.expressions.len() as u32
        };
        let words = frame::interpreter_frame_size(
            view.max_locals(mem)? as u32,
            params_of(mem, vf)?,
            stack_words,
            vf.monitors.len() as u32,
        );
        frame_sizes.push(words * WORD);
        let (pc, result) = resume_pc(mem, lookup, entries, vf, is_top, mode)?;
        frame_pcs.push(pc);
        if is_top {
            return_type = result;
        }
    }
    log::debug!(
        "unroll {:#x}@{} into {} frames ({:?})",
        youngest.method,
        youngest.bci,
        vframes.len(),
        mode
    );
    Ok(UnrollBlock {
        size_of_deoptimized_frame: sender_sp - compiled.unextended_sp,
        caller_adjustment: oldest_extra * WORD,
        number_of_frames: vframes.len(),
        total_frame_sizes: frame_sizes.iter().sum(),
        frame_sizes,
        frame_pcs,
        return_type,
        initial_info: caller_fp,
        unpack_kind: mode,
        sender_sp,
    })
}

/// Frames written by `unpack_frames`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnpackedFrames {
    /// Youngest first
    pub frames: Vec<Frame>,
    pub resume_pc: u32,
    pub resume_sp: u32,
    pub resume_fp: u32,
}

/// Write the interpreter frames described by `unroll` over the compiled
/// frame. Callee locals overlay the caller's outgoing arguments.
pub fn unpack_frames(
    mem: &mut dyn Memory32,
    unroll: &UnrollBlock,
    vframes: &[VFrameState],
) -> VmResult<UnpackedFrames> {
    if vframes.len() != unroll.number_of_frames || unroll.frame_pcs.len() != vframes.len() + 1 {
        return Err(VmError::Deopt("unroll block does not match the scopes".into()));
    }
    let mut frames = Vec::with_capacity(vframes.len());
    let mut caller: Option<Frame> = None;
    for (i, vf) in vframes.iter().rev().enumerate() {
        let params = params_of(mem, vf)?;
        let (locals_addr, sender_sp, link) = match caller {
            None => (
                (unroll.sender_sp + params * WORD).wrapping_sub(WORD),
                unroll.sender_sp,
                unroll.initial_info,
            ),
            Some(c) => {
                let tos = c.tos_address(mem)?;
                ((tos + params * WORD).wrapping_sub(WORD), tos + params * WORD, c.fp)
            }
        };
        let f = frame::layout_activation(mem, &vf.activation(), locals_addr, sender_sp, unroll.frame_pcs[i], link)?;
        frames.push(f);
        caller = Some(f);
    }
    frames.reverse();
    let top = frames
        .first()
        .copied()
        .ok_or_else(|| VmError::Deopt("no frames unpacked".into()))?;
    let resume_pc = unroll.frame_pcs[vframes.len()];
    log::debug!(
        "unpacked {} frames, resuming at {resume_pc:#010x} with fp {:#010x}",
        frames.len(),
        top.fp
    );
    Ok(UnpackedFrames {
        frames,
        resume_pc,
        resume_sp: top.sp,
        resume_fp: top.fp,
    })
}

/// Restore callee-saved registers into the oldest rebuilt frame. Compiled
/// code keeps none live across calls, so only the frame kind is checked.
pub fn unwind_callee_save_values(frame: &Frame, _map: &RegisterMap) -> VmResult<()> {
    if frame.is_interpreted() {
        Ok(())
    } else {
        Err(VmError::Deopt(format!("{:?} frame has no callee-saved values to unwind", frame.kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;
    use crate::runtime::layout::access;
    use crate::runtime::memory32::SimMemory;
    use crate::runtime::method::{Constant, Metaspace, MethodBuilder, MethodDef};

    const STACK: u32 = 0x0C00_0000;
    const COMPILED_SP: u32 = STACK + 0x7F00;
    const FRAME_WORDS: u32 = 5;
    const CALLER_PC: u32 = 0x0805_0000;
    const CALLER_FP: u32 = STACK + 0x8100;

    struct Entries;

    impl ResumeEntries for Entries {
        fn deopt_entry(&self, state: TosState, step: usize) -> VmResult<u32> {
            Ok(0x0801_0000 + 0x100 * step as u32 + state.index() as u32)
        }
        fn reexecute_entry(&self) -> u32 {
            0x0801_0000
        }
        fn rethrow_entry(&self) -> u32 {
            0x0802_0000
        }
    }

    fn setup() -> (SimMemory, MethodBuilder, u32, u32) {
        let mut mem = SimMemory::new();
        mem.map(STACK, 0x1_0000).unwrap();
        let space = Metaspace::new(0x0100_0000, 0x8000, 0x0010_0000).unwrap();
        space.map(&mut mem).unwrap();
        let mut builder = MethodBuilder::new(space, false);

        // int callee(int a) { return a + 1; }   ILOAD_0, ICONST_1, IADD, IRETURN
        let mut callee = MethodDef::new("callee", "(I)I", access::STATIC, vec![0x1A, 0x04, 0x60, 0xAC]).unwrap();
        callee.max_locals = 2;
        let callee = builder.build(&mut mem, callee).unwrap();

        // int caller(Object o) { return callee(7); }   BIPUSH 7, INVOKESTATIC #1, IRETURN
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
        caller.max_locals = 1;
        let caller = builder.build(&mut mem, caller).unwrap();

        // compiled frame: return address and saved ebp at the top
        let sender_sp = COMPILED_SP + (FRAME_WORDS + 1) * 4;
        mem.write_u32(sender_sp - 4, CALLER_PC).unwrap();
        mem.write_u32(sender_sp - 8, CALLER_FP).unwrap();
        // the caller's outgoing argument
        mem.write_u32(sender_sp, 0x2000_0040).unwrap();
        (mem, builder, caller.method, callee.method)
    }

    fn scopes(caller: u32, callee: u32, reexecute: bool) -> Vec<VFrameState> {
        vec![
            VFrameState {
                method: callee,
                bci: 2,
                locals: vec![7, 0],
                expressions: vec![7, 1],
                monitors: Vec::new(),
                reexecute,
            },
            VFrameState {
                method: caller,
                bci: 2,
                locals: vec![0x2000_0040],
                expressions: vec![7],
                monitors: vec![(0x2000_0040, 1)],
                reexecute: false,
            },
        ]
    }

    fn compiled() -> Frame {
        Frame::new(FrameKind::Compiled { frame_words: FRAME_WORDS }, COMPILED_SP, 0, 0x0806_0000)
    }

    #[test]
    fn test_trap_request_packing() {
        let req = make_trap_request(DeoptReason::NullCheck, DeoptAction::MakeNotEntrant, None);
        assert!(req < 0);
        assert_eq!(trap_request_reason(req), DeoptReason::NullCheck);
        assert_eq!(trap_request_action(req), DeoptAction::MakeNotEntrant);
        assert_eq!(trap_request_index(req), None);

        let unloaded = make_trap_request(DeoptReason::Unloaded, DeoptAction::Reinterpret, Some(42));
        assert_eq!(unloaded, 42);
        assert_eq!(trap_request_reason(unloaded), DeoptReason::Unloaded);
        assert_eq!(trap_request_action(unloaded), DeoptAction::Reinterpret);
        assert_eq!(trap_request_index(unloaded), Some(42));
    }

    #[test]
    fn test_every_reason_action_pair_survives_packing() {
        for &reason in DeoptReason::ALL {
            for &action in DeoptAction::ALL {
                let req = make_trap_request(reason, action, None);
                assert_eq!((trap_request_reason(req), trap_request_action(req)), (reason, action));
                assert_eq!(trap_request_debug_bits(req), 0);
            }
        }
    }

    #[test]
    fn test_unroll_info_sizes_frames_oldest_first() {
        let (mem, builder, caller, callee) = setup();
        let vframes = scopes(caller, callee, false);
        let unroll =
            fetch_unroll_info(&mem, builder.registry(), &Entries, &compiled(), &vframes, ExecMode::Deopt).unwrap();
        assert_eq!(unroll.number_of_frames, 2);
        assert_eq!(unroll.size_of_deoptimized_frame, (FRAME_WORDS + 1) * 4);
        assert_eq!(unroll.caller_adjustment, 0);
        // caller: 10 fixed, 1 monitor, 1 stack word
        assert_eq!(unroll.frame_sizes[0], (10 + 2 + 1) * 4);
        // callee: 10 fixed, 1 extra local, max_stack 8
        assert_eq!(unroll.frame_sizes[1], (10 + 1 + 8) * 4);
        assert_eq!(unroll.total_frame_sizes, unroll.frame_sizes.iter().sum::<u32>());
        assert_eq!(unroll.initial_info, CALLER_FP);
        // caller returns into its caller, callee returns after the 3-byte invoke
        // with an int, the callee continues after its 1-byte iadd
        assert_eq!(
            unroll.frame_pcs,
            vec![
                CALLER_PC,
                0x0801_0000 + 0x300 + TosState::Itos.index() as u32,
                0x0801_0000 + 0x100 + TosState::Vtos.index() as u32,
            ]
        );
        assert_eq!(unroll.return_type, BasicType::Void);
    }

    #[test]
    fn test_unpack_overlays_callee_locals_on_arguments() {
        let (mut mem, builder, caller, callee) = setup();
        let vframes = scopes(caller, callee, false);
        let unroll =
            fetch_unroll_info(&mem, builder.registry(), &Entries, &compiled(), &vframes, ExecMode::Deopt).unwrap();
        let unpacked = unpack_frames(&mut mem, &unroll, &vframes).unwrap();
        let [top, bottom] = unpacked.frames[..] else {
            panic!("expected two frames");
        };

        assert_eq!(bottom.locals(&mem).unwrap(), unroll.sender_sp);
        assert_eq!(mem.read_u32(unroll.sender_sp).unwrap(), 0x2000_0040);
        assert_eq!(bottom.return_address(&mem).unwrap(), CALLER_PC);
        assert_eq!(bottom.sender_sp(&mem).unwrap(), unroll.sender_sp);
        assert_eq!(mem.read_u32(bottom.fp).unwrap(), CALLER_FP);
        assert_eq!(bottom.bci(&mem).unwrap(), 2);
        assert_eq!(bottom.monitors(&mem).unwrap().len(), 1);

        // the callee's local 0 is the caller's outgoing argument
        let arg = bottom.expression_stack_at(&mem, 0).unwrap();
        assert_eq!(top.locals(&mem).unwrap(), arg);
        assert_eq!(top.sender_sp(&mem).unwrap(), arg + 4);
        assert_eq!(mem.read_u32(top.fp).unwrap(), bottom.fp);
        assert_eq!(top.return_address(&mem).unwrap(), unroll.frame_pcs[1]);
        assert_eq!(top.expression_stack(&mem).unwrap(), vec![7, 1]);

        assert_eq!(unpacked.resume_pc, unroll.frame_pcs[2]);
        assert_eq!(unpacked.resume_sp, top.sp);
        assert_eq!(unpacked.resume_fp, top.fp);
    }

    #[test]
    fn test_resume_entry_follows_exec_mode() {
        let (mem, builder, caller, callee) = setup();
        let lookup = builder.registry();
        let reexec = scopes(caller, callee, true);
        let unroll = fetch_unroll_info(&mem, lookup, &Entries, &compiled(), &reexec, ExecMode::UncommonTrap).unwrap();
        assert_eq!(unroll.frame_pcs[2], Entries.reexecute_entry());

        let plain = scopes(caller, callee, false);
        let unroll = fetch_unroll_info(&mem, lookup, &Entries, &compiled(), &plain, ExecMode::Exception).unwrap();
        assert_eq!(unroll.frame_pcs[2], Entries.rethrow_entry());
        assert_eq!(unroll.unpack_kind, ExecMode::Exception);
    }

    #[test]
    fn test_caller_scope_must_be_at_invoke() {
        let (mem, builder, caller, callee) = setup();
        let mut vframes = scopes(caller, callee, false);
        vframes[1].bci = 0;
        let err = fetch_unroll_info(&mem, builder.registry(), &Entries, &compiled(), &vframes, ExecMode::Deopt)
            .unwrap_err();
        assert!(matches!(err, VmError::Deopt(_)));
    }

    #[test]
    fn test_only_compiled_frames_unroll() {
        let (mem, builder, caller, callee) = setup();
        let interpreted = Frame::new(FrameKind::Interpreted, COMPILED_SP, COMPILED_SP + 8, 0);
        let vframes = scopes(caller, callee, false);
        assert!(fetch_unroll_info(&mem, builder.registry(), &Entries, &interpreted, &vframes, ExecMode::Deopt).is_err());
        assert!(unwind_callee_save_values(&interpreted, &RegisterMap::default()).is_ok());
        assert!(unwind_callee_save_values(&compiled(), &RegisterMap::default()).is_err());
    }

    #[test]
    fn test_exec_mode_from_u8() {
        assert_eq!(ExecMode::from_u8(3), Some(ExecMode::Reexecute));
        assert_eq!(ExecMode::from_u8(4), None);
    }
}
