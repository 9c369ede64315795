//! Interpreter entries.
//!
//! Method entries build (or skip) an interpreter frame for a callee; the
//! other codelets re-enter the dispatch loop after a call returns, after
//! deoptimization, or while an exception travels through interpreted
//! frames. Each generator emits one codelet into the assembler it is given.

use serde::Serialize;

use super::masm::{msg, IndexSize, InterpreterMacroAssembler, BCP, LOCALS};
use crate::asm::macro_asm::Trig;
use crate::asm::{Address, Cond, Label, Reg, Scale, Xmm};
use crate::error::{VmError, VmResult};
use crate::frame::layout as frame;
use crate::runtime::basic_type::TosState;
use crate::runtime::bytecodes::Bytecode;
use crate::runtime::cpcache::flags;
use crate::runtime::entries::RuntimeEntry;
use crate::runtime::layout::{
    access, const_method, constant_pool, counters, cp_cache, method, WORD_SIZE,
};
use crate::runtime::memory32::Memory32;
use crate::runtime::method::{MathIntrinsic, MethodView};
use crate::runtime::method_data::mdo;
use crate::runtime::thread;

type Masm<'m, 'a> = &'m mut InterpreterMacroAssembler<'a>;

/// Bytes the method entry bangs below the frame.
pub const PAGE_SIZE: i32 = 4096;

/// Words reserved beyond locals, max stack and the fixed frame when
/// checking for stack overflow.
const OVERFLOW_SLACK_WORDS: i32 = 2;

/// Number of deoptimization entries per TOS state: one per bytecode
/// length a deoptimized frame may resume after.
pub const DEOPT_STEPS: usize = 6;

/// Which entry a method is dispatched through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum MethodKind {
    Zerolocals,
    ZerolocalsSynchronized,
    Empty,
    Abstract,
    Math(MathIntrinsic),
}

impl MethodKind {
    pub fn all() -> Vec<MethodKind> {
        let mut kinds = vec![
            MethodKind::Zerolocals,
            MethodKind::ZerolocalsSynchronized,
            MethodKind::Empty,
            MethodKind::Abstract,
        ];
        kinds.extend(MathIntrinsic::ALL.iter().map(|&k| MethodKind::Math(k)));
        kinds
    }

    pub fn name(self) -> String {
        match self {
            MethodKind::Zerolocals => "zerolocals".into(),
            MethodKind::ZerolocalsSynchronized => "zerolocals_synchronized".into(),
            MethodKind::Empty => "empty".into(),
            MethodKind::Abstract => "abstract".into(),
            MethodKind::Math(k) => format!("java_lang_math_{}", k.name()),
        }
    }

    /// Classify a laid-out method.
    pub fn classify(mem: &dyn Memory32, m: MethodView) -> VmResult<Self> {
        let flags = m.access_flags(mem)?;
        if flags & access::NATIVE != 0 {
            return Err(VmError::MissingEntry(format!(
                "native method {:#010x}",
                m.addr()
            )));
        }
        if flags & access::ABSTRACT != 0 {
            return Ok(MethodKind::Abstract);
        }
        if let Some(k) = m.intrinsic(mem)? {
            return Ok(MethodKind::Math(k));
        }
        let synchronized = flags & access::SYNCHRONIZED != 0;
        if synchronized {
            return Ok(MethodKind::ZerolocalsSynchronized);
        }
        if m.code(mem)? == [Bytecode::Return.code()] {
            return Ok(MethodKind::Empty);
        }
        Ok(MethodKind::Zerolocals)
    }
}

/// Exceptions the throw entries ask the runtime to create, by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum ThrownException {
    NullPointer = 1,
    Arithmetic = 2,
    ArrayStore = 3,
}

impl ThrownException {
    pub fn class_name(self) -> &'static str {
        match self {
            ThrownException::NullPointer => "java/lang/NullPointerException",
            ThrownException::Arithmetic => "java/lang/ArithmeticException",
            ThrownException::ArrayStore => "java/lang/ArrayStoreException",
        }
    }
}

/// Message ids passed with `create_exception`.
pub mod message {
    pub const NONE: i32 = 0;
    pub const DIVIDE_BY_ZERO: i32 = 1;
}

// ==================== Method entries ====================

/// Stack check for the frame about to be built. EBX = method, EDX = extra
/// locals, ESI = sender sp; on overflow the caller's stack is restored and
/// the pre-generated stub throws.
fn generate_stack_overflow_check(m: Masm<'_, '_>, overflow_stub: u32) {
    let done = m.new_label();
    let overhead = (frame::FIXED_WORDS + frame::MONITOR_SIZE + OVERFLOW_SLACK_WORDS) * WORD_SIZE;
    m.mov_rm(Reg::Eax, Address::new(Reg::Ebx, method::CONST_METHOD_OFFSET));
    m.movzxw_rm(Reg::Eax, Address::new(Reg::Eax, const_method::MAX_STACK_OFFSET));
    m.add_rr(Reg::Eax, Reg::Edx);
    m.lea(Reg::Eax, Address::index_only(Reg::Eax, Scale::Times4, overhead));
    m.neg_r(Reg::Eax);
    m.add_rr(Reg::Eax, Reg::Esp);
    m.get_thread(Reg::Edi);
    m.cmp_rm(Reg::Eax, Address::new(Reg::Edi, thread::STACK_OVERFLOW_LIMIT_OFFSET));
    m.jcc(Cond::A, done);

    m.pop_r(Reg::Eax);
    m.mov_rr(Reg::Esp, Reg::Esi);
    m.push_r(Reg::Eax);
    m.jmp_abs(overflow_stub);
    m.bind(done);
}

/// Build the fixed part of the frame. EAX = return address, EBX = method,
/// ESI = sender sp, EDI = locals. Leaves ESI = bcp of the first bytecode.
fn generate_fixed_frame(m: Masm<'_, '_>) {
    m.push_r(Reg::Eax);
    m.enter();
    m.push_r(Reg::Esi);
    m.push_i(0);
    m.mov_rm(BCP, Address::new(Reg::Ebx, method::CONST_METHOD_OFFSET));
    m.lea(BCP, Address::new(BCP, const_method::CODES_OFFSET));
    m.push_r(Reg::Ebx);
    if m.config().profile_interpreter {
        let no_mdo = m.new_label();
        m.mov_rm(Reg::Edx, Address::new(Reg::Ebx, method::METHOD_DATA_OFFSET));
        m.test_rr(Reg::Edx, Reg::Edx);
        m.jcc(Cond::E, no_mdo);
        m.add_ri(Reg::Edx, mdo::DATA_OFFSET);
        m.bind(no_mdo);
        m.push_r(Reg::Edx);
    } else {
        m.push_i(0);
    }
    m.mov_rm(Reg::Edx, Address::new(Reg::Ebx, method::CONST_METHOD_OFFSET));
    m.mov_rm(Reg::Edx, Address::new(Reg::Edx, const_method::CONSTANTS_OFFSET));
    m.mov_rm(Reg::Edx, Address::new(Reg::Edx, constant_pool::CACHE_OFFSET));
    m.push_r(Reg::Edx);
    m.push_r(LOCALS);
    m.push_r(BCP);
    // initial sp points at its own slot
    m.push_i(0);
    m.mov_mr(Address::new(Reg::Esp, 0), Reg::Esp);
}

/// Bump the invocation counter and jump to `overflow` every
/// `2^invocation_notify_freq_log` calls.
fn generate_counter_incr(m: Masm<'_, '_>, overflow: Label) {
    let done = m.new_label();
    let config = m.config();
    let increment = counters::COUNT_INCREMENT;
    let mask = ((1i32 << config.invocation_notify_freq_log) - 1) << counters::COUNT_SHIFT;
    if config.profile_interpreter {
        let no_mdo = m.new_label();
        m.mov_rm(Reg::Eax, Address::new(Reg::Ebx, method::METHOD_DATA_OFFSET));
        m.test_rr(Reg::Eax, Reg::Eax);
        m.jcc(Cond::E, no_mdo);
        m.increment_mask_and_jump(
            Address::new(Reg::Eax, mdo::INVOCATION_COUNTER_OFFSET),
            increment,
            mask,
            Reg::Ecx,
            false,
            Cond::E,
            overflow,
        );
        m.jmp(done);
        m.bind(no_mdo);
    }
    m.get_method_counters(Reg::Ebx, Reg::Eax, done);
    m.increment_mask_and_jump(
        Address::new(Reg::Eax, counters::INVOCATION_COUNTER_OFFSET),
        increment,
        mask,
        Reg::Ecx,
        false,
        Cond::E,
        overflow,
    );
    m.bind(done);
}

/// Notify the runtime; a zero bcp tells it the overflow happened at entry.
fn generate_counter_overflow(m: Masm<'_, '_>, resume: Label) {
    m.call_vm_imm(None, RuntimeEntry::FrequencyCounterOverflow, Reg::Eax, 0);
    m.get_method(Reg::Ebx);
    m.jmp(resume);
}

/// Touch the pages the method may use below the frame so an overflow
/// faults here rather than inside the VM.
fn bang_stack_shadow_pages(m: Masm<'_, '_>) {
    for page in 1..=m.config().stack_shadow_pages as i32 {
        m.mov_mr(Address::new(Reg::Esp, -page * PAGE_SIZE), Reg::Eax);
    }
}

/// Entry for ordinary bytecode methods.
///
/// On entry EBX holds the method and ESI the sender sp; the arguments lie
/// just above the return address. The extra locals are zeroed, the fixed
/// frame is built and the first bytecode is dispatched.
pub fn generate_normal_entry(m: Masm<'_, '_>, synchronized: bool, overflow_stub: u32) -> VmResult<()> {
    m.set_fpu_depth(0);
    let invocation_overflow = m.new_label();
    let resume = m.new_label();

    m.mov_rm(Reg::Edx, Address::new(Reg::Ebx, method::CONST_METHOD_OFFSET));
    m.movzxw_rm(Reg::Ecx, Address::new(Reg::Edx, const_method::SIZE_OF_PARAMETERS_OFFSET));
    m.movzxw_rm(Reg::Edx, Address::new(Reg::Edx, const_method::MAX_LOCALS_OFFSET));
    m.sub_rr(Reg::Edx, Reg::Ecx);

    generate_stack_overflow_check(m, overflow_stub);

    m.pop_r(Reg::Eax);
    m.lea(LOCALS, Address::indexed(Reg::Esp, Reg::Ecx, Scale::Times4, -WORD_SIZE));
    {
        let no_extra = m.new_label();
        let zero = m.new_label();
        m.test_rr(Reg::Edx, Reg::Edx);
        m.jcc(Cond::Le, no_extra);
        m.bind(zero);
        m.push_i(0);
        m.dec_r(Reg::Edx);
        m.jcc(Cond::G, zero);
        m.bind(no_extra);
    }

    generate_fixed_frame(m);

    // an exception before the lock is taken must not unlock
    m.get_thread(Reg::Eax);
    m.mov_mi(Address::new(Reg::Eax, thread::DO_NOT_UNLOCK_OFFSET), 1);

    generate_counter_incr(m, invocation_overflow);
    m.bind(resume);

    bang_stack_shadow_pages(m);

    m.get_thread(Reg::Eax);
    m.mov_mi(Address::new(Reg::Eax, thread::DO_NOT_UNLOCK_OFFSET), 0);

    if synchronized {
        m.lock_method();
    }
    m.dispatch_next(TosState::Vtos, 0)?;

    m.bind(invocation_overflow);
    generate_counter_overflow(m, resume);
    Ok(())
}

/// `return` only: poll for a safepoint and go straight back to the caller.
pub fn generate_empty_entry(m: Masm<'_, '_>, normal_entry: u32) {
    m.set_fpu_depth(0);
    let slow = m.new_label();
    m.safepoint_poll(slow);
    m.pop_r(Reg::Eax);
    m.mov_rr(Reg::Esp, Reg::Esi);
    m.jmp_r(Reg::Eax);

    m.bind(slow);
    m.jmp_abs(normal_entry);
}

/// Runs in the caller's frame: no activation exists for the callee.
pub fn generate_abstract_entry(m: Masm<'_, '_>) {
    m.set_fpu_depth(0);
    m.empty_expression_stack();
    m.restore_bcp();
    m.restore_locals();
    m.call_vm(None, RuntimeEntry::ThrowAbstractMethodError, &[]);
    m.should_not_reach_here();
}

/// Inline `java.lang.Math` intrinsics. The argument doubles sit above the
/// return address; the result goes back in ST0, or XMM0 with SSE2.
pub fn generate_math_entry(m: Masm<'_, '_>, kind: MathIntrinsic) -> VmResult<()> {
    m.set_fpu_depth(0);
    let arg = Address::new(Reg::Esp, WORD_SIZE);
    match kind {
        MathIntrinsic::Pow => {
            // pow(x, y): x was pushed first
            m.fld_d(Address::new(Reg::Esp, 3 * WORD_SIZE));
            m.fld_d(arg);
            m.call_fpu_leaf(RuntimeEntry::Dpow, 2);
        }
        MathIntrinsic::Exp => {
            m.fld_d(arg);
            m.call_fpu_leaf(RuntimeEntry::Dexp, 1);
        }
        MathIntrinsic::Sin | MathIntrinsic::Cos | MathIntrinsic::Tan => {
            m.fld_d(arg);
            m.trigfunc(match kind {
                MathIntrinsic::Sin => Trig::Sin,
                MathIntrinsic::Cos => Trig::Cos,
                _ => Trig::Tan,
            });
        }
        MathIntrinsic::Sqrt => {
            m.fld_d(arg);
            m.fsqrt();
        }
        MathIntrinsic::Abs => {
            m.fld_d(arg);
            m.fabs();
        }
        MathIntrinsic::Log | MathIntrinsic::Log10 => {
            m.fld_d(arg);
            if kind == MathIntrinsic::Log {
                m.flog();
            } else {
                m.flog10();
            }
            m.d2ieee();
        }
    }
    m.expect_fpu_depth(1, "math entry")?;

    if m.ctx().cpu.use_sse >= 2 {
        m.sub_ri(Reg::Esp, 2 * WORD_SIZE);
        m.fstp_d(Address::new(Reg::Esp, 0));
        m.movsd_xm(Xmm::Xmm0, Address::new(Reg::Esp, 0));
        m.add_ri(Reg::Esp, 2 * WORD_SIZE);
    }
    m.pop_r(Reg::Edi);
    m.mov_rr(Reg::Esp, Reg::Esi);
    m.jmp_r(Reg::Edi);
    Ok(())
}

/// Bridge for native signatures without a pre-generated marshaller.
/// EBX = method, EDI = locals, ESP = end of the outgoing argument area.
pub fn generate_slow_signature_handler(m: Masm<'_, '_>) {
    m.set_fpu_depth(0);
    m.mov_rr(Reg::Ecx, Reg::Esp);
    m.call_vm(None, RuntimeEntry::SlowSignatureHandler, &[Reg::Ebx, LOCALS, Reg::Ecx]);
    m.ret(0);
}

// ==================== Re-entry after calls ====================

/// Move a float or double result from XMM0 back onto the x87 stack.
fn result_to_fpu(m: Masm<'_, '_>, state: TosState) {
    let use_sse = m.ctx().cpu.use_sse;
    m.set_fpu_depth(0);
    match state {
        TosState::Ftos if use_sse >= 1 => {
            m.sub_ri(Reg::Esp, WORD_SIZE);
            m.movss_mx(Address::new(Reg::Esp, 0), Xmm::Xmm0);
            m.fld_s(Address::new(Reg::Esp, 0));
            m.add_ri(Reg::Esp, WORD_SIZE);
        }
        TosState::Dtos if use_sse >= 2 => {
            m.sub_ri(Reg::Esp, 2 * WORD_SIZE);
            m.movsd_mx(Address::new(Reg::Esp, 0), Xmm::Xmm0);
            m.fld_d(Address::new(Reg::Esp, 0));
            m.add_ri(Reg::Esp, 2 * WORD_SIZE);
        }
        _ => m.set_fpu_depth(state.fpu_depth()),
    }
}

/// Continue after an `invoke` of `step` bytes returned with a `state`
/// result: restore the caller's registers, pop the arguments and dispatch.
pub fn generate_return_entry(m: Masm<'_, '_>, state: TosState, step: i32, size: IndexSize) -> VmResult<()> {
    result_to_fpu(m, state);
    m.mov_rm(Reg::Esp, frame::at(frame::LAST_SP_OFFSET));
    m.mov_mi(frame::at(frame::LAST_SP_OFFSET), 0);
    m.restore_bcp();
    m.restore_locals();
    if state == TosState::Atos {
        m.verify_oop(Reg::Eax);
    }
    m.get_cache_and_index_at_bcp(Reg::Ebx, Reg::Ecx, 1, size);
    m.mov_rm(
        Reg::Ebx,
        InterpreterMacroAssembler::cache_entry(Reg::Ebx, Reg::Ecx, cp_cache::FLAGS_OFFSET),
    );
    m.and_ri(Reg::Ebx, flags::PARAMETER_SIZE_MASK as i32);
    m.lea(Reg::Esp, Address::indexed(Reg::Esp, Reg::Ebx, Scale::Times4, 0));
    m.dispatch_next(state, step)
}

/// Resume a frame rebuilt by the deoptimizer. `step` 0 re-executes the
/// current bytecode.
pub fn generate_deopt_entry(m: Masm<'_, '_>, state: TosState, step: i32) -> VmResult<()> {
    result_to_fpu(m, state);
    m.mov_mi(frame::at(frame::LAST_SP_OFFSET), 0);
    m.restore_bcp();
    m.restore_locals();
    let no_exception = m.new_label();
    m.get_thread(Reg::Ecx);
    m.cmp_mi(Address::new(Reg::Ecx, thread::PENDING_EXCEPTION_OFFSET), 0);
    m.jcc(Cond::E, no_exception);
    m.call_vm(None, RuntimeEntry::ThrowPendingException, &[]);
    m.should_not_reach_here();
    m.bind(no_exception);
    m.dispatch_next(state, step)
}

/// Addresses inside the exception codelet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExceptionEntries {
    /// Exception delivered into the caller by a returning callee
    pub rethrow: u32,
    /// Exception raised by the current frame; EAX = exception, ESI = bcp
    pub throw: u32,
    /// Drop the frame and continue in the caller's handler
    pub remove_activation: u32,
}

/// Emit the rethrow, throw and remove-activation entries as one codelet.
pub fn generate_exception_entries(m: Masm<'_, '_>) -> VmResult<ExceptionEntries> {
    m.set_fpu_depth(0);
    let rethrow = m.pc();
    m.mov_mi(frame::at(frame::LAST_SP_OFFSET), 0);
    m.restore_bcp();
    m.restore_locals();

    let throw = m.pc();
    m.verify_oop(Reg::Eax);
    m.empty_expression_stack();
    m.empty_fpu_stack();
    // EAX = handler (possibly remove_activation), EDX = exception
    m.call_vm(Some(Reg::Edx), RuntimeEntry::ExceptionHandlerForException, &[Reg::Eax]);
    m.push_ptr(Reg::Edx);
    m.jmp_r(Reg::Eax);

    let remove_activation = m.pc();
    m.pop_ptr(Reg::Eax);
    m.get_thread(Reg::Ecx);
    m.mov_mr(Address::new(Reg::Ecx, thread::VM_RESULT_OFFSET), Reg::Eax);
    m.remove_activation(TosState::Vtos, Reg::Edx, false, true)?;
    m.get_thread(Reg::Ecx);
    m.mov_rm(Reg::Eax, Address::new(Reg::Ecx, thread::VM_RESULT_OFFSET));
    m.mov_mi(Address::new(Reg::Ecx, thread::VM_RESULT_OFFSET), 0);
    // EAX = exception, EDX = pc in the caller, ESP/EBP = caller's
    m.push_r(Reg::Eax);
    m.push_r(Reg::Edx);
    m.call_vm_leaf(RuntimeEntry::ExceptionHandlerForReturnAddress, &[Reg::Ecx, Reg::Edx]);
    m.mov_rr(Reg::Ebx, Reg::Eax);
    m.pop_r(Reg::Edx);
    m.pop_r(Reg::Eax);
    m.jmp_r(Reg::Ebx);

    Ok(ExceptionEntries {
        rethrow,
        throw,
        remove_activation,
    })
}

/// Take the thread's pending exception and leave the current frame through
/// `remove_activation`.
pub fn generate_unwind_entry(m: Masm<'_, '_>, remove_activation: u32) {
    m.set_fpu_depth(0);
    m.get_thread(Reg::Ecx);
    m.mov_rm(Reg::Eax, Address::new(Reg::Ecx, thread::PENDING_EXCEPTION_OFFSET));
    m.mov_mi(Address::new(Reg::Ecx, thread::PENDING_EXCEPTION_OFFSET), 0);
    m.empty_expression_stack();
    m.empty_fpu_stack();
    m.push_ptr(Reg::Eax);
    m.jmp_abs(remove_activation);
}

// ==================== Throw entries ====================

/// EBX = offending index.
pub fn generate_array_index_out_of_bounds_handler(m: Masm<'_, '_>) {
    m.set_fpu_depth(0);
    m.empty_expression_stack();
    m.empty_fpu_stack();
    m.call_vm(None, RuntimeEntry::ThrowArrayIndexOutOfBoundsException, &[Reg::Ebx]);
    m.should_not_reach_here();
}

/// The object that failed the cast is on the expression stack.
pub fn generate_class_cast_exception_handler(m: Masm<'_, '_>) {
    m.set_fpu_depth(0);
    m.pop_ptr(Reg::Eax);
    m.empty_expression_stack();
    m.empty_fpu_stack();
    m.call_vm(None, RuntimeEntry::ThrowClassCastException, &[Reg::Eax]);
    m.should_not_reach_here();
}

/// Create the exception in the runtime and throw it from this frame.
/// With `pass_oop` the offending object is popped and handed over.
pub fn generate_exception_handler(
    m: Masm<'_, '_>,
    kind: ThrownException,
    message_id: i32,
    pass_oop: bool,
    throw_entry: u32,
) {
    m.set_fpu_depth(0);
    if pass_oop {
        m.pop_ptr(Reg::Ebx);
    }
    m.empty_expression_stack();
    m.empty_fpu_stack();
    m.mov_ri(Reg::Eax, kind as i32);
    if pass_oop {
        m.call_vm(Some(Reg::Eax), RuntimeEntry::CreateKlassException, &[Reg::Eax, Reg::Ebx]);
    } else {
        m.mov_ri(Reg::Ebx, message_id);
        m.call_vm(Some(Reg::Eax), RuntimeEntry::CreateException, &[Reg::Eax, Reg::Ebx]);
    }
    m.jmp_abs(throw_entry);
}

pub fn generate_stack_overflow_handler(m: Masm<'_, '_>) {
    m.set_fpu_depth(0);
    m.empty_expression_stack();
    m.empty_fpu_stack();
    m.call_vm(None, RuntimeEntry::ThrowStackOverflowError, &[]);
    m.should_not_reach_here();
}

// ==================== Dispatch helpers ====================

/// Spill the TOS, visit the runtime and continue with the opcode still in
/// EBX through the normal table.
pub fn generate_safepoint_entry(m: Masm<'_, '_>, state: TosState) -> VmResult<()> {
    m.set_fpu_depth(state.fpu_depth());
    m.push_tos(state);
    m.call_vm(None, RuntimeEntry::AtSafepoint, &[]);
    let row = m.ctx().globals.dispatch_normal + (TosState::Vtos.index() * 256 * 4) as u32;
    m.dispatch_via(TosState::Vtos, row)
}

/// Fatal stop used for unreachable table slots.
pub fn generate_error_exit(m: Masm<'_, '_>, msg_id: i32) {
    m.set_fpu_depth(0);
    m.stop(msg_id);
}

pub fn generate_illegal_bytecode_sequence(m: Masm<'_, '_>) {
    generate_error_exit(m, msg::ILLEGAL_BYTECODE_SEQUENCE);
}

pub fn generate_unimplemented_bytecode(m: Masm<'_, '_>) {
    generate_error_exit(m, msg::UNIMPLEMENTED_BYTECODE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{CodeBuffer, MacroAssembler, RelocKind};
    use crate::config::RuntimeConfig;
    use crate::interpreter::templates::testing::{context, contains, shared, CODE_BASE};
    use crate::runtime::method::{Metaspace, MethodBuilder, MethodDef};
    use crate::runtime::memory32::SimMemory;

    fn emit(config: &RuntimeConfig, f: impl FnOnce(&mut InterpreterMacroAssembler<'_>)) -> CodeBuffer {
        let ctx = context(config);
        let mut buf = CodeBuffer::new(CODE_BASE);
        {
            let mut m = InterpreterMacroAssembler::new(MacroAssembler::new(&mut buf, &ctx), config);
            m.set_shared(shared());
            f(&mut m);
        }
        buf.check().unwrap();
        buf
    }

    fn calls(buf: &CodeBuffer, config: &RuntimeConfig, entry: RuntimeEntry) -> bool {
        let target = context(config).entry(entry);
        buf.relocations()
            .iter()
            .any(|r| r.kind == RelocKind::RuntimeCall && r.target == target)
    }

    #[test]
    fn test_normal_entry_builds_fixed_frame() {
        let config = RuntimeConfig::default();
        let buf = emit(&config, |m| generate_normal_entry(m, false, 0x0800_0300).unwrap());
        let code = buf.code();
        // MOVZX ECX, word [EDX+10] = 0F B7 4A 0A
        assert!(contains(code, &[0x0F, 0xB7, 0x4A, 0x0A]));
        // LEA EDI, [ESP+ECX*4-4] = 8D 7C 8C FC
        assert!(contains(code, &[0x8D, 0x7C, 0x8C, 0xFC]));
        // PUSH EAX; PUSH EBP; MOV EBP, ESP; PUSH ESI; PUSH 0 = 50 55 89 E5 56 6A 00
        assert!(contains(code, &[0x50, 0x55, 0x89, 0xE5, 0x56, 0x6A, 0x00]));
        // PUSH EDI; PUSH ESI; PUSH 0; MOV [ESP], ESP = 57 56 6A 00 89 24 24
        assert!(contains(code, &[0x57, 0x56, 0x6A, 0x00, 0x89, 0x24, 0x24]));
        assert!(calls(&buf, &config, RuntimeEntry::FrequencyCounterOverflow));
        assert!(!calls(&buf, &config, RuntimeEntry::Monitorenter));
    }

    #[test]
    fn test_normal_entry_bangs_shadow_pages() {
        let config = RuntimeConfig::default();
        let buf = emit(&config, |m| generate_normal_entry(m, false, 0x0800_0300).unwrap());
        for page in 1..=config.stack_shadow_pages as i32 {
            // MOV [ESP - page*4096], EAX = 89 84 24 disp32
            let mut needle = vec![0x89, 0x84, 0x24];
            needle.extend_from_slice(&(-page * PAGE_SIZE).to_le_bytes());
            assert!(contains(buf.code(), &needle), "page {page}");
        }
    }

    #[test]
    fn test_stack_overflow_jumps_to_stub() {
        let config = RuntimeConfig::default();
        let buf = emit(&config, |m| generate_normal_entry(m, false, 0x0800_0300).unwrap());
        // POP EAX; MOV ESP, ESI; PUSH EAX; JMP rel32 = 58 89 F4 50 E9
        assert!(contains(buf.code(), &[0x58, 0x89, 0xF4, 0x50, 0xE9]));
        assert!(buf
            .relocations()
            .iter()
            .any(|r| r.kind == RelocKind::External && r.target == 0x0800_0300));
    }

    #[test]
    fn test_synchronized_entry_locks() {
        let config = RuntimeConfig::default();
        let plain = emit(&config, |m| generate_normal_entry(m, false, 0x0800_0300).unwrap());
        let locked = emit(&config, |m| generate_normal_entry(m, true, 0x0800_0300).unwrap());
        assert!(locked.len() > plain.len());
        assert!(calls(&locked, &config, RuntimeEntry::Monitorenter));
    }

    #[test]
    fn test_profiled_entry_counts_in_method_data() {
        let config = RuntimeConfig {
            profile_interpreter: true,
            ..RuntimeConfig::default()
        };
        let buf = emit(&config, |m| generate_normal_entry(m, false, 0x0800_0300).unwrap());
        // ADD EDX, 16 = 83 C2 10
        assert!(contains(buf.code(), &[0x83, 0xC2, mdo::DATA_OFFSET as u8]));
        // MOV ECX, [EAX+8] = 8B 48 08
        assert!(contains(buf.code(), &[0x8B, 0x48, 0x08]));
    }

    #[test]
    fn test_empty_entry_returns_to_sender() {
        let config = RuntimeConfig::default();
        let buf = emit(&config, |m| generate_empty_entry(m, 0x0800_0400));
        // POP EAX; MOV ESP, ESI; JMP EAX = 58 89 F4 FF E0
        assert!(contains(buf.code(), &[0x58, 0x89, 0xF4, 0xFF, 0xE0]));
    }

    #[test]
    fn test_math_entries_balance_fpu() {
        let config = RuntimeConfig::default();
        for kind in MathIntrinsic::ALL {
            let buf = emit(&config, |m| generate_math_entry(m, kind).unwrap());
            // POP EDI; MOV ESP, ESI; JMP EDI = 5F 89 F4 FF E7
            assert!(buf.code().ends_with(&[0x5F, 0x89, 0xF4, 0xFF, 0xE7]), "{}", kind.name());
        }
        let pow = emit(&config, |m| generate_math_entry(m, MathIntrinsic::Pow).unwrap());
        assert!(calls(&pow, &config, RuntimeEntry::Dpow));
        // FLD qword [ESP+12] = DD 44 24 0C
        assert!(pow.code().starts_with(&[0xDD, 0x44, 0x24, 0x0C]));
    }

    #[test]
    fn test_return_entry_pops_parameters() {
        let config = RuntimeConfig::default();
        let buf = emit(&config, |m| {
            generate_return_entry(m, TosState::Itos, 3, IndexSize::U2).unwrap()
        });
        let code = buf.code();
        // MOV ESP, [EBP-8] = 8B 65 F8
        assert!(code.starts_with(&[0x8B, 0x65, 0xF8]));
        // AND EBX, 0xFF = 81 E3 FF 00 00 00; LEA ESP, [ESP+EBX*4] = 8D 24 9C
        assert!(contains(code, &[0x81, 0xE3, 0xFF, 0x00, 0x00, 0x00, 0x8D, 0x24, 0x9C]));
    }

    #[test]
    fn test_return_entry_reloads_xmm_result() {
        let config = RuntimeConfig::default();
        let buf = emit(&config, |m| {
            generate_return_entry(m, TosState::Dtos, 3, IndexSize::U2).unwrap()
        });
        // MOVSD [ESP], XMM0 = F2 0F 11 04 24
        assert!(contains(buf.code(), &[0xF2, 0x0F, 0x11, 0x04, 0x24]));
    }

    #[test]
    fn test_deopt_entry_checks_pending_exception() {
        let config = RuntimeConfig::default();
        let buf = emit(&config, |m| generate_deopt_entry(m, TosState::Vtos, 0).unwrap());
        assert!(calls(&buf, &config, RuntimeEntry::ThrowPendingException));
        // MOV dword [EBP-8], 0 = C7 45 F8 00 00 00 00
        assert!(buf.code().starts_with(&[0xC7, 0x45, 0xF8, 0, 0, 0, 0]));
    }

    #[test]
    fn test_exception_entries_are_ordered() {
        let config = RuntimeConfig::default();
        let mut entries = ExceptionEntries::default();
        let buf = emit(&config, |m| entries = generate_exception_entries(m).unwrap());
        assert_eq!(entries.rethrow, CODE_BASE);
        assert!(entries.rethrow < entries.throw && entries.throw < entries.remove_activation);
        assert!(calls(&buf, &config, RuntimeEntry::ExceptionHandlerForException));
        assert!(calls(&buf, &config, RuntimeEntry::ExceptionHandlerForReturnAddress));
        // ... POP EDX; POP EAX; JMP EBX = 5A 58 FF E3
        assert!(buf.code().ends_with(&[0x5A, 0x58, 0xFF, 0xE3]));
    }

    #[test]
    fn test_exception_handler_passes_kind() {
        let config = RuntimeConfig::default();
        let buf = emit(&config, |m| {
            generate_exception_handler(m, ThrownException::ArrayStore, message::NONE, true, 0x0800_0200)
        });
        // POP EBX = 5B
        assert_eq!(buf.code()[0], 0x5B);
        // MOV EAX, 3 = B8 03 00 00 00
        assert!(contains(buf.code(), &[0xB8, 0x03, 0x00, 0x00, 0x00]));
        assert!(calls(&buf, &config, RuntimeEntry::CreateKlassException));
    }

    #[test]
    fn test_safepoint_entry_spills_and_dispatches_normal() {
        let config = RuntimeConfig::default();
        let ctx = context(&config);
        let buf = emit(&config, |m| generate_safepoint_entry(m, TosState::Ltos).unwrap());
        // PUSH EDX; PUSH EAX = 52 50
        assert!(buf.code().starts_with(&[0x52, 0x50]));
        let row = ctx.globals.dispatch_normal + (TosState::Vtos.index() * 1024) as u32;
        let mut needle = vec![0xFF, 0x24, 0x9D];
        needle.extend_from_slice(&row.to_le_bytes());
        assert!(buf.code().ends_with(&needle));
    }

    #[test]
    fn test_classify_methods() {
        let mut mem = SimMemory::new();
        let space = Metaspace::new(0x0100_0000, 0x8000, 0x0010_0000).unwrap();
        space.map(&mut mem).unwrap();
        let mut b = MethodBuilder::new(space, false);

        let empty = b.build(&mut mem, MethodDef::new("e", "()V", access::STATIC, vec![0xb1]).unwrap()).unwrap();
        let sync = b
            .build(
                &mut mem,
                MethodDef::new("s", "()V", access::STATIC | access::SYNCHRONIZED, vec![0xb1]).unwrap(),
            )
            .unwrap();
        // iconst_1; ireturn
        let plain = b.build(&mut mem, MethodDef::new("p", "()I", access::STATIC, vec![0x04, 0xac]).unwrap()).unwrap();
        let mut sqrt = MethodDef::new("sqrt", "(D)D", access::STATIC, vec![0x18, 0x00, 0xaf]).unwrap();
        sqrt.intrinsic = Some(MathIntrinsic::Sqrt);
        let sqrt = b.build(&mut mem, sqrt).unwrap();

        let kind = |m: u32| MethodKind::classify(&mem, MethodView::at(m)).unwrap();
        assert_eq!(kind(empty.method), MethodKind::Empty);
        assert_eq!(kind(sync.method), MethodKind::ZerolocalsSynchronized);
        assert_eq!(kind(plain.method), MethodKind::Zerolocals);
        assert_eq!(kind(sqrt.method), MethodKind::Math(MathIntrinsic::Sqrt));
        assert_eq!(MethodKind::all().len(), 4 + MathIntrinsic::ALL.len());
    }
}
