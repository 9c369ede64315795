//! Macro layer over the IA-32 assembler.
//!
//! Sequences shared by stubs and templates: runtime calls with last-Java
//! frame bookkeeping, null and subtype checks, x87 helpers, allocation and
//! GC barriers. Every helper reads its addresses from an `AsmContext`.

use std::ops::{Deref, DerefMut};

use super::codebuf::{CodeBuffer, Label};
use super::x86_32::{Address, Assembler, Cond, Reg, Scale, TIMES_PTR};
use crate::config::{CpuFeatures, RuntimeConfig};
use crate::runtime::barrier::{card, BarrierSet};
use crate::runtime::entries::{RuntimeEntries, RuntimeEntry};
use crate::runtime::globals::VmGlobals;
use crate::runtime::layout::{klass, oop};
use crate::runtime::safepoint::SafepointState;
use crate::runtime::thread::{self, state};

/// Offsets below this are covered by the protected zero page.
pub const IMPLICIT_NULL_CHECK_LIMIT: i32 = 4096;
/// Bytes written by `fnsave`.
pub const FPU_STATE_SIZE: i32 = 108;

/// Everything generated code needs to know about its surroundings.
#[derive(Debug, Clone)]
pub struct AsmContext {
    pub entries: RuntimeEntries,
    pub globals: VmGlobals,
    pub barrier: BarrierSet,
    pub cpu: CpuFeatures,
    pub is_mp: bool,
    pub verify_oops: bool,
    /// `forward_exception` stub, once generated
    pub forward_exception: u32,
    /// `verify_oop` stub, once generated
    pub verify_oop: u32,
}

impl AsmContext {
    pub fn new(config: &RuntimeConfig, entries: RuntimeEntries, globals: VmGlobals) -> Self {
        Self {
            entries,
            globals,
            barrier: config.barrier,
            cpu: config.cpu,
            is_mp: config.is_mp,
            verify_oops: config.verify_oops,
            forward_exception: 0,
            verify_oop: 0,
        }
    }

    pub fn entry(&self, entry: RuntimeEntry) -> u32 {
        self.entries.address(entry)
    }
}

/// Memory ordering constraints for `membar`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membar {
    LoadLoad,
    LoadStore,
    StoreStore,
    StoreLoad,
}

/// x87 trigonometric function selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trig {
    Sin,
    Cos,
    Tan,
}

/// Assembler plus VM-aware helper sequences.
pub struct MacroAssembler<'a> {
    asm: Assembler<'a>,
    ctx: &'a AsmContext,
}

impl<'a> Deref for MacroAssembler<'a> {
    type Target = Assembler<'a>;

    fn deref(&self) -> &Assembler<'a> {
        &self.asm
    }
}

impl DerefMut for MacroAssembler<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.asm
    }
}

impl<'a> MacroAssembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer, ctx: &'a AsmContext) -> Self {
        Self {
            asm: Assembler::new(buf),
            ctx,
        }
    }

    pub fn ctx(&self) -> &'a AsmContext {
        self.ctx
    }

    // ==================== Small helpers ====================

    /// `reg += value` using INC/DEC where possible.
    pub fn increment(&mut self, reg: Reg, value: i32) {
        match value {
            0 => {}
            1 => self.inc_r(reg),
            -1 => self.dec_r(reg),
            v => self.add_ri(reg, v),
        }
    }

    pub fn decrement(&mut self, reg: Reg, value: i32) {
        self.increment(reg, -value);
    }

    /// Load a global word.
    pub fn load_global(&mut self, dst: Reg, addr: u32) {
        self.mov_rm(dst, Address::absolute(addr));
    }

    /// `lock` prefix when running on a multiprocessor.
    pub fn lock_if_mp(&mut self) {
        if self.ctx.is_mp {
            self.lock();
        }
    }

    /// CMPXCHG with the MP lock prefix; compares against EAX.
    pub fn cmpxchgptr(&mut self, reg: Reg, adr: Address) {
        self.lock_if_mp();
        self.cmpxchg_mr(adr, reg);
    }

    /// Only StoreLoad needs a fence on x86.
    pub fn membar(&mut self, constraint: Membar) {
        if constraint == Membar::StoreLoad && self.ctx.is_mp {
            self.lock();
            self.add_mi(Address::new(Reg::Esp, 0), 0);
        }
    }

    /// Extend the low part of `reg` to a full int of the given type.
    pub fn sign_extend_byte(&mut self, reg: Reg) {
        if reg.has_byte_register() {
            self.movsxb_rr(reg, reg);
        } else {
            self.shl_ri(reg, 24);
            self.sar_ri(reg, 24);
        }
    }

    pub fn sign_extend_short(&mut self, reg: Reg) {
        self.movsxw_rr(reg, reg);
    }

    /// Stop with a message id; the VM reports `pc` and never returns.
    pub fn stop(&mut self, msg_id: i32) {
        let debug = self.ctx.entry(RuntimeEntry::Debug32);
        let pc = self.pc();
        self.pusha();
        self.push_i(msg_id);
        self.push_addr(pc);
        self.call_abs(debug);
        self.hlt();
    }

    /// Load the current thread.
    pub fn get_thread(&mut self, dst: Reg) {
        let slot = self.ctx.globals.thread_slot;
        self.load_global(dst, slot);
    }

    // ==================== Runtime calls ====================

    /// Record the last Java frame so the stack can be walked from the VM.
    /// `last_java_pc` of `None` means the return address of the upcoming
    /// call identifies the frame.
    pub fn set_last_java_frame(
        &mut self,
        thread_reg: Reg,
        last_java_sp: Reg,
        last_java_fp: Option<Reg>,
        last_java_pc: Option<u32>,
    ) {
        if let Some(fp) = last_java_fp {
            self.mov_mr(Address::new(thread_reg, thread::LAST_JAVA_FP_OFFSET), fp);
        }
        if let Some(pc) = last_java_pc {
            self.mov_mi(Address::new(thread_reg, thread::LAST_JAVA_PC_OFFSET), pc as i32);
        }
        // sp last: a non-zero last_Java_sp marks the anchor valid
        self.mov_mr(Address::new(thread_reg, thread::LAST_JAVA_SP_OFFSET), last_java_sp);
    }

    pub fn reset_last_java_frame(&mut self, thread_reg: Reg, clear_fp: bool) {
        self.mov_mi(Address::new(thread_reg, thread::LAST_JAVA_SP_OFFSET), 0);
        if clear_fp {
            self.mov_mi(Address::new(thread_reg, thread::LAST_JAVA_FP_OFFSET), 0);
        }
        self.mov_mi(Address::new(thread_reg, thread::LAST_JAVA_PC_OFFSET), 0);
    }

    /// Call a leaf entry with cdecl arguments; no frame anchor, no
    /// exception check. Clobbers EAX, ECX, EDX.
    pub fn call_vm_leaf(&mut self, entry: RuntimeEntry, args: &[Reg]) {
        let target = self.ctx.entry(entry);
        for &arg in args.iter().rev() {
            self.push_r(arg);
        }
        self.call_abs(target);
        if !args.is_empty() {
            self.add_ri(Reg::Esp, 4 * args.len() as i32);
        }
    }

    /// Call with `nargs` words already pushed by the caller (last argument
    /// first). The thread is passed as the first argument in EDI.
    ///
    /// Sequence: anchor the frame, mark the thread `in VM`, call, mark it
    /// `in Java`, drop the anchor, forward a pending exception, fetch the
    /// oop result.
    pub fn call_vm_base(
        &mut self,
        oop_result: Option<Reg>,
        last_java_sp: Option<Reg>,
        entry: RuntimeEntry,
        nargs: usize,
        check_exceptions: bool,
    ) {
        let ctx = self.ctx;
        let thread_reg = Reg::Edi;
        self.get_thread(thread_reg);
        self.push_r(thread_reg);
        let sp = last_java_sp.unwrap_or(Reg::Esp);
        self.set_last_java_frame(thread_reg, sp, Some(Reg::Ebp), None);
        self.mov_mi(
            Address::new(thread_reg, thread::THREAD_STATE_OFFSET),
            state::IN_VM as i32,
        );
        self.call_abs(ctx.entry(entry));
        self.add_ri(Reg::Esp, 4 * (nargs as i32 + 1));
        // EDI is callee-saved in C, but the VM may have switched threads
        self.get_thread(thread_reg);
        self.mov_mi(
            Address::new(thread_reg, thread::THREAD_STATE_OFFSET),
            state::IN_JAVA as i32,
        );
        self.reset_last_java_frame(thread_reg, true);
        if check_exceptions {
            self.cmp_mi(Address::new(thread_reg, thread::PENDING_EXCEPTION_OFFSET), 0);
            self.jcc_abs(Cond::Ne, ctx.forward_exception);
        }
        if let Some(result) = oop_result {
            self.mov_rm(result, Address::new(thread_reg, thread::VM_RESULT_OFFSET));
            self.mov_mi(Address::new(thread_reg, thread::VM_RESULT_OFFSET), 0);
            self.verify_oop(result);
        }
    }

    /// Push `args` and call through `call_vm_base`.
    pub fn call_vm(&mut self, oop_result: Option<Reg>, entry: RuntimeEntry, args: &[Reg]) {
        for &arg in args.iter().rev() {
            self.push_r(arg);
        }
        self.call_vm_base(oop_result, None, entry, args.len(), true);
    }

    /// Take the metadata result of the last runtime call.
    pub fn get_vm_result_2(&mut self, dst: Reg, thread_reg: Reg) {
        self.mov_rm(dst, Address::new(thread_reg, thread::VM_RESULT_2_OFFSET));
        self.mov_mi(Address::new(thread_reg, thread::VM_RESULT_2_OFFSET), 0);
    }

    // ==================== Checks ====================

    /// Explicit null check when `offset` lies beyond the protected page;
    /// otherwise the access itself traps.
    pub fn null_check(&mut self, reg: Reg, offset: Option<i32>) {
        let implicit = matches!(offset, Some(off) if (0..IMPLICIT_NULL_CHECK_LIMIT).contains(&off));
        if !implicit {
            // Faults if reg is null; the signal handler maps it to NPE.
            self.cmp_rm(Reg::Eax, Address::new(reg, 0));
        }
    }

    /// Safepoint poll: jump to `slow` when synchronization is requested.
    pub fn safepoint_poll(&mut self, slow: Label) {
        let poll = self.ctx.globals.safepoint_poll;
        self.cmp_mi(
            Address::absolute(poll),
            SafepointState::NotSynchronized as i32,
        );
        self.jcc(Cond::Ne, slow);
    }

    pub fn verify_oop(&mut self, reg: Reg) {
        if !self.ctx.verify_oops || self.ctx.verify_oop == 0 {
            return;
        }
        let stub = self.ctx.verify_oop;
        self.push_r(reg);
        self.call_abs(stub);
    }

    pub fn load_klass(&mut self, dst: Reg, src: Reg) {
        self.mov_rm(dst, Address::new(src, oop::KLASS_OFFSET));
    }

    pub fn store_klass(&mut self, dst: Reg, src: Reg) {
        self.mov_mr(Address::new(dst, oop::KLASS_OFFSET), src);
    }

    /// Primary-display and cache check. Jumps to `success`, `failure` or
    /// `slow_path`; a `None` label means fall through.
    pub fn check_klass_subtype_fast_path(
        &mut self,
        sub: Reg,
        sup: Reg,
        temp: Reg,
        success: Option<Label>,
        failure: Option<Label>,
        slow_path: Option<Label>,
    ) {
        let fallthrough = self.new_label();
        let success = success.unwrap_or(fallthrough);
        let failure = failure.unwrap_or(fallthrough);
        let slow_path = slow_path.unwrap_or(fallthrough);

        self.cmp_rr(sub, sup);
        self.jcc(Cond::E, success);
        self.mov_rm(temp, Address::new(sup, klass::SUPER_CHECK_OFFSET_OFFSET));
        self.cmp_rm(sup, Address::indexed(sub, temp, Scale::Times1, 0));
        self.jcc(Cond::E, success);
        self.cmp_ri(temp, klass::SECONDARY_SUPER_CACHE_OFFSET);
        if failure != fallthrough {
            self.jcc(Cond::Ne, failure);
            if slow_path != fallthrough {
                self.jmp(slow_path);
            }
        } else {
            self.jcc(Cond::E, slow_path);
        }
        self.bind(fallthrough);
    }

    /// Linear scan of the secondary supers; a hit is cached in the
    /// secondary-super cache. `temp` and `temp2` are clobbered.
    pub fn check_klass_subtype_slow_path(
        &mut self,
        sub: Reg,
        sup: Reg,
        temp: Reg,
        temp2: Reg,
        success: Option<Label>,
        failure: Option<Label>,
    ) {
        let fallthrough = self.new_label();
        let success = success.unwrap_or(fallthrough);
        let failure = failure.unwrap_or(fallthrough);
        let scan = self.new_label();
        let hit = self.new_label();

        self.mov_rm(temp, Address::new(sub, klass::SECONDARY_SUPERS_OFFSET));
        self.mov_rm(temp2, Address::new(temp, 0));
        self.add_ri(temp, 4);
        self.bind(scan);
        self.test_rr(temp2, temp2);
        self.jcc(Cond::E, failure);
        self.cmp_rm(sup, Address::new(temp, 0));
        self.jcc(Cond::E, hit);
        self.add_ri(temp, 4);
        self.dec_r(temp2);
        self.jmp(scan);

        self.bind(hit);
        self.mov_mr(Address::new(sub, klass::SECONDARY_SUPER_CACHE_OFFSET), sup);
        if success != fallthrough {
            self.jmp(success);
        }
        self.bind(fallthrough);
    }

    /// Full subtype check; falls through on failure.
    pub fn check_klass_subtype(&mut self, sub: Reg, sup: Reg, temp: Reg, temp2: Reg, success: Label) {
        let failure = self.new_label();
        self.check_klass_subtype_fast_path(sub, sup, temp, Some(success), Some(failure), None);
        self.check_klass_subtype_slow_path(sub, sup, temp, temp2, Some(success), None);
        self.bind(failure);
    }

    // ==================== Integer arithmetic ====================

    /// `EAX / reg` with the `MIN_VALUE / -1` case special-cased (the
    /// hardware traps, the language wants MIN_VALUE with remainder 0).
    /// Returns the offset of the IDIV instruction.
    pub fn corrected_idivl(&mut self, reg: Reg) -> usize {
        let normal = self.new_label();
        let special = self.new_label();
        self.cmp_ri(Reg::Eax, i32::MIN);
        self.jcc(Cond::Ne, normal);
        self.xor_rr(Reg::Edx, Reg::Edx);
        self.cmp_ri(reg, -1);
        self.jcc(Cond::E, special);
        self.bind(normal);
        self.cdq();
        let offset = self.offset();
        self.idiv_r(reg);
        self.bind(special);
        offset
    }

    /// Compare two longs; -1, 0 or 1 ends up in `x_hi`.
    pub fn lcmp2int(&mut self, x_hi: Reg, x_lo: Reg, y_hi: Reg, y_lo: Reg) {
        let high = self.new_label();
        let low = self.new_label();
        let done = self.new_label();
        self.cmp_rr(x_hi, y_hi);
        self.jcc(Cond::L, low);
        self.jcc(Cond::G, high);
        self.cmp_rr(x_lo, y_lo);
        self.jcc(Cond::B, low);
        self.jcc(Cond::A, high);
        self.xor_rr(x_hi, x_hi);
        self.jmp(done);
        self.bind(high);
        self.mov_ri(x_hi, 1);
        self.jmp(done);
        self.bind(low);
        self.mov_ri(x_hi, -1);
        self.bind(done);
    }

    // ==================== x87 ====================

    /// Compare ST0 with ST1, pop both and leave -1, 0 or 1 in `dst`.
    /// Unordered operands yield -1 or 1 as requested.
    pub fn fcmp2int(&mut self, dst: Reg, unordered_is_less: bool) {
        let done = self.new_label();
        self.fucomip(1);
        self.fpop();
        if unordered_is_less {
            self.mov_ri(dst, -1);
            self.jcc(Cond::P, done);
            self.jcc(Cond::B, done);
            self.mov_ri(dst, 0);
            self.jcc(Cond::E, done);
            self.inc_r(dst);
        } else {
            self.mov_ri(dst, 1);
            self.jcc(Cond::P, done);
            self.jcc(Cond::A, done);
            self.mov_ri(dst, 0);
            self.jcc(Cond::E, done);
            self.dec_r(dst);
        }
        self.bind(done);
    }

    /// ST0 = ST0 rem ST1, popping ST1. Clobbers EAX (saved in `tmp`).
    pub fn fremr(&mut self, tmp: Reg) {
        let again = self.new_label();
        self.mov_rr(tmp, Reg::Eax);
        self.bind(again);
        self.fprem();
        self.fwait();
        self.fnstsw_ax();
        self.sahf();
        self.jcc(Cond::P, again);
        self.fxch(1);
        self.fpop();
        self.mov_rr(Reg::Eax, tmp);
    }

    /// Round ST0 to single precision.
    pub fn f2ieee(&mut self) {
        let scratch = Address::absolute(self.ctx.globals.fpu_scratch);
        self.fstp_s(scratch);
        self.fld_s(scratch);
    }

    /// Round ST0 to double precision.
    pub fn d2ieee(&mut self) {
        let scratch = Address::absolute(self.ctx.globals.fpu_scratch);
        self.fstp_d(scratch);
        self.fld_d(scratch);
    }

    /// ST0 = ln(ST0)
    pub fn flog(&mut self) {
        self.fldln2();
        self.fxch(1);
        self.fyl2x();
    }

    /// ST0 = log10(ST0)
    pub fn flog10(&mut self) {
        self.fldlg2();
        self.fxch(1);
        self.fyl2x();
    }

    /// ST0 = trig(ST0). Arguments beyond pi/4 go to the runtime, which
    /// reduces them precisely. Clobbers EAX, ECX, EDX.
    pub fn trigfunc(&mut self, kind: Trig) {
        let ctx = self.ctx;
        let slow = self.new_label();
        let done = self.new_label();
        self.fld_d(Address::absolute(ctx.globals.pi_4));
        self.fld_st(1);
        self.fabs();
        // ST0 = |x|, ST1 = pi/4
        self.fucomip(1);
        self.fpop();
        self.jcc(Cond::A, slow);
        self.jcc(Cond::P, slow);
        match kind {
            Trig::Sin => self.fsin(),
            Trig::Cos => self.fcos(),
            Trig::Tan => {
                self.fptan();
                self.fpop();
            }
        }
        self.jmp(done);

        self.bind(slow);
        let entry = match kind {
            Trig::Sin => RuntimeEntry::Dsin,
            Trig::Cos => RuntimeEntry::Dcos,
            Trig::Tan => RuntimeEntry::Dtan,
        };
        self.call_fpu_leaf(entry, 1);
        self.bind(done);
    }

    /// Call a runtime function taking `nargs` doubles from the x87 stack
    /// (ST0 is the last argument) and returning a double in ST0.
    pub fn call_fpu_leaf(&mut self, entry: RuntimeEntry, nargs: i32) {
        let target = self.ctx.entry(entry);
        let depth = self.fpu_depth();
        self.sub_ri(Reg::Esp, 8 * nargs);
        for i in (0..nargs).rev() {
            self.fstp_d(Address::new(Reg::Esp, 8 * i));
        }
        self.call_abs(target);
        self.add_ri(Reg::Esp, 8 * nargs);
        self.set_fpu_depth(depth - nargs + 1);
    }

    /// Save the whole x87 state on the stack; the register stack is empty
    /// afterwards. Returns the depth to hand to `pop_fpu_state`.
    pub fn push_fpu_state(&mut self) -> i32 {
        let depth = self.fpu_depth();
        self.sub_ri(Reg::Esp, FPU_STATE_SIZE);
        self.fnsave(Address::new(Reg::Esp, 0));
        self.fwait();
        self.set_fpu_depth(0);
        depth
    }

    pub fn pop_fpu_state(&mut self, depth: i32) {
        self.frstor(Address::new(Reg::Esp, 0));
        self.add_ri(Reg::Esp, FPU_STATE_SIZE);
        self.set_fpu_depth(depth);
    }

    pub fn empty_fpu_stack(&mut self) {
        for i in 0..8 {
            self.ffree(i);
        }
        self.set_fpu_depth(0);
    }

    // ==================== Allocation ====================

    /// Bump-allocate `size` bytes from the thread's TLAB into `obj`.
    pub fn tlab_allocate(&mut self, thread_reg: Reg, obj: Reg, size: Reg, end: Reg, slow: Label) {
        self.mov_rm(obj, Address::new(thread_reg, thread::TLAB_TOP_OFFSET));
        self.lea(end, Address::indexed(obj, size, Scale::Times1, 0));
        self.cmp_rm(end, Address::new(thread_reg, thread::TLAB_END_OFFSET));
        self.jcc(Cond::A, slow);
        self.mov_mr(Address::new(thread_reg, thread::TLAB_TOP_OFFSET), end);
    }

    /// Allocate from the shared eden with a CAS loop. The object lands in
    /// EAX; `end` is clobbered.
    pub fn eden_allocate(&mut self, size: Reg, end: Reg, slow: Label) {
        let globals = &self.ctx.globals;
        let (top, limit) = (globals.eden_top, globals.eden_end);
        let retry = self.new_label();
        self.bind(retry);
        self.mov_rm(Reg::Eax, Address::absolute(top));
        self.lea(end, Address::indexed(Reg::Eax, size, Scale::Times1, 0));
        self.cmp_rr(end, Reg::Eax);
        self.jcc(Cond::B, slow);
        self.cmp_rm(end, Address::absolute(limit));
        self.jcc(Cond::A, slow);
        self.cmpxchgptr(end, Address::absolute(top));
        self.jcc(Cond::Ne, retry);
    }

    // ==================== GC barriers ====================

    /// Dirty the card of the address in `obj` (clobbered).
    pub fn store_check(&mut self, obj: Reg) {
        let barrier = self.ctx.barrier;
        self.shr_ri(obj, barrier.card_shift() as u8);
        self.movb_mi(Address::new(obj, barrier.byte_map_base() as i32), card::DIRTY);
    }

    /// SATB pre-barrier: log the value about to be overwritten while
    /// concurrent marking is active. `obj` holds the field address or is
    /// `None` when `pre_val` is already loaded.
    pub fn g1_write_barrier_pre(
        &mut self,
        obj: Option<Reg>,
        pre_val: Reg,
        thread_reg: Reg,
        tmp: Reg,
    ) {
        if !self.ctx.barrier.has_pre_barrier() {
            return;
        }
        let done = self.new_label();
        let runtime = self.new_label();
        self.cmp_mi(Address::new(thread_reg, thread::SATB_QUEUE_ACTIVE_OFFSET), 0);
        self.jcc(Cond::E, done);
        if let Some(obj) = obj {
            self.mov_rm(pre_val, Address::new(obj, 0));
        }
        self.test_rr(pre_val, pre_val);
        self.jcc(Cond::E, done);
        self.mov_rm(tmp, Address::new(thread_reg, thread::SATB_QUEUE_INDEX_OFFSET));
        self.test_rr(tmp, tmp);
        self.jcc(Cond::E, runtime);
        self.sub_ri(tmp, 4);
        self.mov_mr(Address::new(thread_reg, thread::SATB_QUEUE_INDEX_OFFSET), tmp);
        self.add_rm(tmp, Address::new(thread_reg, thread::SATB_QUEUE_BUFFER_OFFSET));
        self.mov_mr(Address::new(tmp, 0), pre_val);
        self.jmp(done);

        self.bind(runtime);
        self.pusha();
        self.call_vm_leaf(RuntimeEntry::G1WbPre, &[pre_val, thread_reg]);
        self.popa();
        self.bind(done);
    }

    /// Post-barrier after storing `new_val` at `store_addr`. Cross-region,
    /// non-null stores to non-young clean cards dirty and enqueue the card.
    pub fn g1_write_barrier_post(
        &mut self,
        store_addr: Reg,
        new_val: Reg,
        thread_reg: Reg,
        tmp: Reg,
        tmp2: Reg,
    ) {
        let barrier = self.ctx.barrier;
        let BarrierSet::G1Satb { region_log, .. } = barrier else {
            self.store_check(store_addr);
            return;
        };
        let done = self.new_label();
        let runtime = self.new_label();
        self.mov_rr(tmp, store_addr);
        self.xor_rr(tmp, new_val);
        self.shr_ri(tmp, region_log as u8);
        self.jcc(Cond::E, done);
        self.test_rr(new_val, new_val);
        self.jcc(Cond::E, done);

        self.mov_rr(tmp, store_addr);
        self.shr_ri(tmp, barrier.card_shift() as u8);
        self.lea(tmp, Address::new(tmp, barrier.byte_map_base() as i32));
        self.cmpb_mi(Address::new(tmp, 0), card::G1_YOUNG);
        self.jcc(Cond::E, done);
        self.membar(Membar::StoreLoad);
        self.cmpb_mi(Address::new(tmp, 0), card::DIRTY);
        self.jcc(Cond::E, done);
        self.movb_mi(Address::new(tmp, 0), card::DIRTY);

        self.mov_rm(tmp2, Address::new(thread_reg, thread::DIRTY_CARD_QUEUE_INDEX_OFFSET));
        self.test_rr(tmp2, tmp2);
        self.jcc(Cond::E, runtime);
        self.sub_ri(tmp2, 4);
        self.mov_mr(Address::new(thread_reg, thread::DIRTY_CARD_QUEUE_INDEX_OFFSET), tmp2);
        self.add_rm(tmp2, Address::new(thread_reg, thread::DIRTY_CARD_QUEUE_BUFFER_OFFSET));
        self.mov_mr(Address::new(tmp2, 0), tmp);
        self.jmp(done);

        self.bind(runtime);
        self.pusha();
        self.call_vm_leaf(RuntimeEntry::G1WbPost, &[tmp, thread_reg]);
        self.popa();
        self.bind(done);
    }

    /// Store a reference with the barriers of the configured collector.
    /// `val` of `None` stores null (no post-barrier). Clobbers EDX, EBX,
    /// ECX and, for G1, EDI (thread).
    pub fn store_heap_oop(&mut self, adr: Address, val: Option<Reg>) {
        match self.ctx.barrier {
            BarrierSet::G1Satb { .. } => {
                let thread_reg = Reg::Edi;
                self.get_thread(thread_reg);
                self.lea(Reg::Edx, adr);
                self.g1_write_barrier_pre(Some(Reg::Edx), Reg::Ebx, thread_reg, Reg::Ecx);
                match val {
                    None => self.mov_mi(Address::new(Reg::Edx, 0), 0),
                    Some(val) => {
                        self.mov_mr(Address::new(Reg::Edx, 0), val);
                        self.g1_write_barrier_post(Reg::Edx, val, thread_reg, Reg::Ebx, Reg::Ecx);
                    }
                }
            }
            BarrierSet::CardTable { .. } => match val {
                None => self.mov_mi(adr, 0),
                Some(val) => {
                    self.mov_mr(adr, val);
                    self.lea(Reg::Edx, adr);
                    self.store_check(Reg::Edx);
                }
            },
        }
    }

    /// Jump through a table of code addresses indexed by `index`.
    pub fn jump_indexed(&mut self, table: u32, index: Reg) {
        self.jmp_m(Address::index_only(index, TIMES_PTR, table as i32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::codebuf::RelocKind;

    fn context() -> AsmContext {
        let config = RuntimeConfig::default();
        let globals = VmGlobals::layout(config.layout.data_base, config.layout.data_size).unwrap();
        let mut ctx = AsmContext::new(&config, RuntimeEntries::synthetic(0x7000_0000), globals);
        ctx.forward_exception = 0x0800_0100;
        ctx
    }

    #[test]
    fn test_get_thread_loads_slot() {
        let ctx = context();
        let mut buf = CodeBuffer::new(0x0800_1000);
        let mut masm = MacroAssembler::new(&mut buf, &ctx);
        masm.get_thread(Reg::Ecx);
        // MOV ECX, [disp32] = 8B 0D disp32
        let slot = ctx.globals.thread_slot.to_le_bytes();
        assert_eq!(buf.code(), &[0x8B, 0x0D, slot[0], slot[1], slot[2], slot[3]]);
    }

    #[test]
    fn test_call_vm_relocations() {
        let ctx = context();
        let mut buf = CodeBuffer::new(0x0800_1000);
        let mut masm = MacroAssembler::new(&mut buf, &ctx);
        masm.call_vm(Some(Reg::Eax), RuntimeEntry::New, &[Reg::Ecx]);
        buf.check().unwrap();
        let calls: Vec<_> = buf
            .relocations()
            .iter()
            .filter(|r| r.kind == RelocKind::RuntimeCall)
            .map(|r| r.target)
            .collect();
        assert_eq!(calls, vec![ctx.entry(RuntimeEntry::New)]);
        let forward = buf
            .relocations()
            .iter()
            .any(|r| r.kind == RelocKind::External && r.target == ctx.forward_exception);
        assert!(forward);
    }

    #[test]
    fn test_fcmp2int_balances_fpu() {
        let ctx = context();
        let mut buf = CodeBuffer::new(0x0800_1000);
        let mut masm = MacroAssembler::new(&mut buf, &ctx);
        masm.set_fpu_depth(2);
        masm.fcmp2int(Reg::Eax, true);
        assert_eq!(masm.fpu_depth(), 0);
        masm.fld1();
        masm.trigfunc(Trig::Tan);
        assert_eq!(masm.fpu_depth(), 1);
        masm.flog10();
        assert_eq!(masm.fpu_depth(), 1);
    }

    #[test]
    fn test_corrected_idivl_offset() {
        let ctx = context();
        let mut buf = CodeBuffer::new(0x0800_1000);
        let mut masm = MacroAssembler::new(&mut buf, &ctx);
        let at = masm.corrected_idivl(Reg::Ecx);
        buf.check().unwrap();
        // IDIV ECX = F7 F9
        assert_eq!(&buf.code()[at..at + 2], &[0xF7, 0xF9]);
    }

    #[test]
    fn test_card_table_store_check() {
        let ctx = context();
        let mut buf = CodeBuffer::new(0x0800_1000);
        let mut masm = MacroAssembler::new(&mut buf, &ctx);
        masm.store_check(Reg::Edx);
        let code = buf.code();
        // SHR EDX, 9 = C1 EA 09
        assert_eq!(&code[..3], &[0xC1, 0xEA, 0x09]);
        // MOV byte [EDX + base], 0 = C6 82 disp32 00
        assert_eq!(&code[3..5], &[0xC6, 0x82]);
        assert_eq!(*code.last().unwrap(), 0);
    }
}
