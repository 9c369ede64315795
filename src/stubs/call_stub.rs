//! The native-to-Java bridge and the exception plumbing around it.

use crate::asm::{Address, Cond, MacroAssembler, Reg, Scale, Xmm};
use crate::runtime::basic_type::BasicType;
use crate::runtime::entries::RuntimeEntry;
use crate::runtime::globals::fpu;
use crate::runtime::thread;

/// Frame built by `call_stub`, as byte offsets from `ebp`.
pub mod layout {
    pub const CALL_WRAPPER_OFFSET: i32 = 8;
    pub const RESULT_OFFSET: i32 = 12;
    pub const RESULT_TYPE_OFFSET: i32 = 16;
    pub const METHOD_OFFSET: i32 = 20;
    pub const ENTRY_POINT_OFFSET: i32 = 24;
    pub const PARAMETERS_OFFSET: i32 = 28;
    pub const PARAMETER_SIZE_OFFSET: i32 = 32;
    pub const THREAD_OFFSET: i32 = 36;

    pub const SAVED_EDI_OFFSET: i32 = -4;
    pub const SAVED_ESI_OFFSET: i32 = -8;
    pub const SAVED_EBX_OFFSET: i32 = -12;
    pub const MXCSR_SAVE_OFFSET: i32 = -16;
    pub const FPU_CNTRL_WRD_SAVE_OFFSET: i32 = -20;
    /// Bytes reserved below `ebp` before the outgoing parameters
    pub const LOCALS_SIZE: i32 = 20;
}

/// `stop` message: a throw stub returned without a pending exception.
pub const MSG_NO_PENDING_EXCEPTION: i32 = 1;
/// `stop` message: `verify_oop` rejected a reference.
pub const MSG_BROKEN_OOP: i32 = 2;
/// `stop` message: `call_stub` entered while an exception was pending.
pub const MSG_PENDING_EXCEPTION_ON_ENTRY: i32 = 3;

/// Words in a throw stub's frame: thread argument, two spare argument
/// slots, saved `ebp` and the return address.
pub const THROW_FRAME_WORDS: u32 = 5;

/// `void call_stub(JavaCallWrapper*, intptr_t* result, BasicType result_type,
/// Method*, address entry_point, intptr_t* parameters, int parameter_size,
/// JavaThread*)`
///
/// Returns the address the Java callee returns to.
pub fn generate_call_stub(masm: &mut MacroAssembler) -> u32 {
    let ctx = masm.ctx();
    let use_sse = ctx.cpu.use_sse;
    let mxcsr_std = Address::absolute(ctx.globals.mxcsr_std);
    let fpu_std = Address::absolute(ctx.globals.fpu_cntrl_wrd_std);
    let frame = |offset| Address::new(Reg::Ebp, offset);

    let copy = masm.new_label();
    let parameters_done = masm.new_label();
    let exit = masm.new_label();
    let is_long = masm.new_label();
    let is_float = masm.new_label();
    let is_double = masm.new_label();

    masm.enter();
    masm.mov_rm(Reg::Ecx, frame(layout::PARAMETER_SIZE_OFFSET));
    masm.shl_ri(Reg::Ecx, 2);
    masm.add_ri(Reg::Ecx, layout::LOCALS_SIZE);
    masm.sub_rr(Reg::Esp, Reg::Ecx);
    masm.and_ri(Reg::Esp, -16);

    masm.mov_mr(frame(layout::SAVED_EDI_OFFSET), Reg::Edi);
    masm.mov_mr(frame(layout::SAVED_ESI_OFFSET), Reg::Esi);
    masm.mov_mr(frame(layout::SAVED_EBX_OFFSET), Reg::Ebx);

    if cfg!(debug_assertions) {
        let no_pending = masm.new_label();
        masm.mov_rm(Reg::Ecx, frame(layout::THREAD_OFFSET));
        masm.cmp_mi(Address::new(Reg::Ecx, thread::PENDING_EXCEPTION_OFFSET), 0);
        masm.jcc(Cond::E, no_pending);
        masm.stop(MSG_PENDING_EXCEPTION_ON_ENTRY);
        masm.bind(no_pending);
    }

    // Java code runs with the canonical control words
    if use_sse > 0 {
        let mxcsr_ok = masm.new_label();
        masm.stmxcsr(frame(layout::MXCSR_SAVE_OFFSET));
        masm.mov_rm(Reg::Eax, frame(layout::MXCSR_SAVE_OFFSET));
        masm.and_ri(Reg::Eax, fpu::MXCSR_MASK as i32);
        masm.cmp_rm(Reg::Eax, mxcsr_std);
        masm.jcc(Cond::E, mxcsr_ok);
        masm.ldmxcsr(mxcsr_std);
        masm.bind(mxcsr_ok);
    }
    masm.fnstcw(frame(layout::FPU_CNTRL_WRD_SAVE_OFFSET));
    masm.fldcw(fpu_std);

    // parameters[0] ends up at the highest address
    masm.mov_rm(Reg::Ecx, frame(layout::PARAMETER_SIZE_OFFSET));
    masm.test_rr(Reg::Ecx, Reg::Ecx);
    masm.jcc(Cond::E, parameters_done);
    masm.mov_rm(Reg::Edx, frame(layout::PARAMETERS_OFFSET));
    masm.xor_rr(Reg::Ebx, Reg::Ebx);
    masm.bind(copy);
    masm.mov_rm(Reg::Eax, Address::indexed(Reg::Edx, Reg::Ecx, Scale::Times4, -4));
    masm.mov_mr(Address::indexed(Reg::Esp, Reg::Ebx, Scale::Times4, 0), Reg::Eax);
    masm.inc_r(Reg::Ebx);
    masm.dec_r(Reg::Ecx);
    masm.jcc(Cond::Ne, copy);
    masm.bind(parameters_done);

    masm.mov_rm(Reg::Ebx, frame(layout::METHOD_OFFSET));
    masm.mov_rm(Reg::Eax, frame(layout::ENTRY_POINT_OFFSET));
    masm.mov_rr(Reg::Esi, Reg::Esp);
    masm.call_r(Reg::Eax);
    let return_address = masm.pc();

    masm.mov_rm(Reg::Edi, frame(layout::RESULT_OFFSET));
    masm.mov_rm(Reg::Esi, frame(layout::RESULT_TYPE_OFFSET));
    masm.cmp_ri(Reg::Esi, BasicType::Long as i32);
    masm.jcc(Cond::E, is_long);
    masm.cmp_ri(Reg::Esi, BasicType::Float as i32);
    masm.jcc(Cond::E, is_float);
    masm.cmp_ri(Reg::Esi, BasicType::Double as i32);
    masm.jcc(Cond::E, is_double);
    masm.mov_mr(Address::new(Reg::Edi, 0), Reg::Eax);

    masm.bind(exit);
    if use_sse > 0 {
        masm.ldmxcsr(frame(layout::MXCSR_SAVE_OFFSET));
    }
    masm.fldcw(frame(layout::FPU_CNTRL_WRD_SAVE_OFFSET));
    masm.mov_rm(Reg::Ebx, frame(layout::SAVED_EBX_OFFSET));
    masm.mov_rm(Reg::Esi, frame(layout::SAVED_ESI_OFFSET));
    masm.mov_rm(Reg::Edi, frame(layout::SAVED_EDI_OFFSET));
    masm.leave();
    masm.ret(0);

    masm.bind(is_long);
    masm.mov_mr(Address::new(Reg::Edi, 0), Reg::Eax);
    masm.mov_mr(Address::new(Reg::Edi, 4), Reg::Edx);
    masm.jmp(exit);

    masm.bind(is_float);
    if use_sse >= 1 {
        masm.movss_mx(Address::new(Reg::Edi, 0), Xmm::Xmm0);
    } else {
        masm.set_fpu_depth(1);
        masm.fstp_s(Address::new(Reg::Edi, 0));
    }
    masm.jmp(exit);

    masm.bind(is_double);
    if use_sse >= 2 {
        masm.movsd_mx(Address::new(Reg::Edi, 0), Xmm::Xmm0);
    } else {
        masm.set_fpu_depth(1);
        masm.fstp_d(Address::new(Reg::Edi, 0));
    }
    masm.jmp(exit);

    return_address
}

/// Continuation for exceptions that reach `call_stub`: make the oop in
/// EAX the thread's pending exception and return to the native caller.
pub fn generate_catch_exception(masm: &mut MacroAssembler, call_stub_return_address: u32) {
    let start = masm.pc();
    masm.mov_rm(Reg::Ecx, Address::new(Reg::Ebp, layout::THREAD_OFFSET));
    masm.verify_oop(Reg::Eax);
    masm.mov_mr(Address::new(Reg::Ecx, thread::PENDING_EXCEPTION_OFFSET), Reg::Eax);
    // the "file" of a stub-raised exception is the stub itself
    masm.mov_mi(Address::new(Reg::Ecx, thread::EXCEPTION_FILE_OFFSET), start as i32);
    masm.mov_mi(Address::new(Reg::Ecx, thread::EXCEPTION_LINE_OFFSET), line!() as i32);
    masm.jmp_abs(call_stub_return_address);
}

/// Entered with the return address into the throwing frame on top of
/// the stack and a pending exception. Continues at the handler with
/// EAX = exception, EDX = throwing pc, return address popped.
pub fn generate_forward_exception(masm: &mut MacroAssembler) {
    let thread_reg = Reg::Ecx;
    masm.mov_rm(Reg::Eax, Address::new(Reg::Esp, 0));
    masm.get_thread(thread_reg);
    masm.call_vm_leaf(RuntimeEntry::ExceptionHandlerForReturnAddress, &[thread_reg, Reg::Eax]);
    masm.mov_rr(Reg::Ebx, Reg::Eax);

    masm.get_thread(thread_reg);
    masm.pop_r(Reg::Edx);
    masm.mov_rm(Reg::Eax, Address::new(thread_reg, thread::PENDING_EXCEPTION_OFFSET));
    masm.mov_mi(Address::new(thread_reg, thread::PENDING_EXCEPTION_OFFSET), 0);
    masm.verify_oop(Reg::Eax);
    masm.jmp_r(Reg::Ebx);
}

/// Runtime stub that calls `entry(thread)` to create and post an
/// exception, then forwards it. Frame: `THROW_FRAME_WORDS`.
pub fn generate_throw_exception(masm: &mut MacroAssembler, entry: RuntimeEntry) {
    let ctx = masm.ctx();
    let java_thread = Reg::Ebx;
    let pending = masm.new_label();

    masm.get_thread(java_thread);
    masm.enter();
    masm.sub_ri(Reg::Esp, (THROW_FRAME_WORDS as i32 - 2) * 4);
    masm.mov_mr(Address::new(Reg::Esp, 0), java_thread);
    masm.set_last_java_frame(java_thread, Reg::Esp, Some(Reg::Ebp), None);
    masm.call_abs(ctx.entry(entry));
    masm.get_thread(java_thread);
    masm.reset_last_java_frame(java_thread, true);
    masm.leave();

    masm.cmp_mi(Address::new(java_thread, thread::PENDING_EXCEPTION_OFFSET), 0);
    masm.jcc(Cond::Ne, pending);
    masm.stop(MSG_NO_PENDING_EXCEPTION);
    masm.bind(pending);
    masm.jmp_abs(ctx.forward_exception);
}
