//! Interpreter layer over the macro assembler.
//!
//! Register conventions inside templates: ESI holds the bcp, EDI the
//! locals pointer, EBP the frame, ESP the expression stack top. EAX (and
//! EDX for longs) or ST0 cache the top of stack according to the TOS state.

use std::ops::{Deref, DerefMut};

use serde::Serialize;

use crate::asm::{Address, Cond, Label, MacroAssembler, Reg, Scale, Xmm};
use crate::config::RuntimeConfig;
use crate::error::VmResult;
use crate::frame::layout as frame;
use crate::runtime::basic_type::{BasicType, TosState};
use crate::runtime::bytecodes::Bytecode;
use crate::runtime::entries::RuntimeEntry;
use crate::runtime::globals::VmGlobals;
use crate::runtime::layout::{
    access, basic_object_lock, const_method, constant_pool, cp_cache, method, WORD_SIZE,
};
use crate::runtime::method_data::{cells, data_layout};
use crate::runtime::thread;

pub const BCP: Reg = Reg::Esi;
pub const LOCALS: Reg = Reg::Edi;

/// Message ids passed to `stop`.
pub mod msg {
    pub const SHOULD_NOT_REACH_HERE: i32 = 0x100;
    pub const ILLEGAL_BYTECODE_SEQUENCE: i32 = 0x101;
    pub const UNIMPLEMENTED_BYTECODE: i32 = 0x102;
    pub const NON_EMPTY_EXPRESSION_STACK: i32 = 0x103;
    pub const ABSTRACT_METHOD: i32 = 0x104;
}

/// Width of a cp-cache index operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSize {
    /// Native-order u16 written by the linker
    U2,
    /// Complemented u32 of `invokedynamic`
    U4,
}

/// Interpreter entries that templates branch to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SharedEntries {
    pub throw_exception: u32,
    pub rethrow_exception: u32,
    pub remove_activation: u32,
    pub throw_array_index_out_of_bounds: u32,
    pub throw_array_store: u32,
    pub throw_arithmetic: u32,
    pub throw_class_cast: u32,
    pub throw_null_pointer: u32,
    pub throw_stack_overflow: u32,
}

/// Sizes of profile entries in bytes.
pub mod profile_size {
    use crate::runtime::method_data::{cells, data_layout};

    const fn bytes(cells: i32) -> i32 {
        data_layout::HEADER_SIZE + cells * data_layout::CELL_SIZE
    }

    pub const BIT: i32 = bytes(0);
    pub const COUNTER: i32 = bytes(1);
    pub const JUMP: i32 = bytes(2);
    pub const BRANCH: i32 = bytes(3);
    pub const RECEIVER_TYPE: i32 = bytes(1 + 2 * cells::RECEIVER_ROWS);
    pub const VIRTUAL_CALL: i32 = RECEIVER_TYPE;
    pub const RET: i32 = bytes(1 + 3 * cells::RET_ROWS);
    /// Bytes per case of a multi-branch entry
    pub const PER_CASE: i32 = 2 * data_layout::CELL_SIZE;
    pub const CASE_ARRAY: i32 = data_layout::cell_offset(cells::case_count(0));
}

pub struct InterpreterMacroAssembler<'a> {
    masm: MacroAssembler<'a>,
    config: &'a RuntimeConfig,
    shared: SharedEntries,
    codelet: &'static str,
    bytecode: Bytecode,
}

impl<'a> Deref for InterpreterMacroAssembler<'a> {
    type Target = MacroAssembler<'a>;

    fn deref(&self) -> &MacroAssembler<'a> {
        &self.masm
    }
}

impl DerefMut for InterpreterMacroAssembler<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.masm
    }
}

impl<'a> InterpreterMacroAssembler<'a> {
    pub fn new(masm: MacroAssembler<'a>, config: &'a RuntimeConfig) -> Self {
        Self {
            masm,
            config,
            shared: SharedEntries::default(),
            codelet: "interpreter",
            bytecode: Bytecode::Nop,
        }
    }

    pub fn config(&self) -> &'a RuntimeConfig {
        self.config
    }

    pub fn shared(&self) -> SharedEntries {
        self.shared
    }

    pub fn set_shared(&mut self, shared: SharedEntries) {
        self.shared = shared;
    }

    /// Name reported by FPU-depth errors.
    pub fn set_codelet(&mut self, name: &'static str) {
        self.codelet = name;
    }

    pub fn codelet(&self) -> &'static str {
        self.codelet
    }

    /// Bytecode whose template is being generated.
    pub fn bytecode(&self) -> Bytecode {
        self.bytecode
    }

    pub fn set_bytecode(&mut self, bytecode: Bytecode) {
        self.bytecode = bytecode;
        self.codelet = bytecode.name();
    }

    /// Check the tracked x87 depth against what `state` caches.
    pub fn expect_state(&self, state: TosState) -> VmResult<()> {
        self.expect_fpu_depth(state.fpu_depth(), self.codelet)
    }

    // ==================== Frame slots ====================

    pub fn at_bcp(&self, offset: i32) -> Address {
        Address::new(BCP, offset)
    }

    pub fn save_bcp(&mut self) {
        self.mov_mr(frame::at(frame::BCX_OFFSET), BCP);
    }

    pub fn restore_bcp(&mut self) {
        self.mov_rm(BCP, frame::at(frame::BCX_OFFSET));
    }

    pub fn restore_locals(&mut self) {
        self.mov_rm(LOCALS, frame::at(frame::LOCALS_OFFSET));
    }

    pub fn get_method(&mut self, reg: Reg) {
        self.mov_rm(reg, frame::at(frame::METHOD_OFFSET));
    }

    pub fn get_constant_pool_cache(&mut self, reg: Reg) {
        self.mov_rm(reg, frame::at(frame::CACHE_OFFSET));
    }

    pub fn get_constant_pool(&mut self, reg: Reg) {
        self.get_method(reg);
        self.mov_rm(reg, Address::new(reg, method::CONST_METHOD_OFFSET));
        self.mov_rm(reg, Address::new(reg, const_method::CONSTANTS_OFFSET));
    }

    pub fn get_cpool_and_tags(&mut self, cpool: Reg, tags: Reg) {
        self.get_constant_pool(cpool);
        self.mov_rm(tags, Address::new(cpool, constant_pool::TAGS_OFFSET));
    }

    /// Reset ESP to the empty expression stack and clear `last_sp`.
    pub fn empty_expression_stack(&mut self) {
        self.mov_rm(Reg::Esp, frame::at(frame::MONITOR_BLOCK_TOP_OFFSET));
        self.mov_mi(frame::at(frame::LAST_SP_OFFSET), 0);
    }

    // ==================== Locals ====================

    /// Local `n`.
    pub fn iaddress(n: i32) -> Address {
        Address::new(LOCALS, -n * WORD_SIZE)
    }

    /// Low word of the long or double in locals `n`, `n + 1`.
    pub fn laddress(n: i32) -> Address {
        Self::iaddress(n + 1)
    }

    pub fn haddress(n: i32) -> Address {
        Self::iaddress(n)
    }

    /// Local whose negated index is in `reg`.
    pub fn iaddress_r(reg: Reg) -> Address {
        Address::indexed(LOCALS, reg, Scale::Times4, 0)
    }

    pub fn laddress_r(reg: Reg) -> Address {
        Address::indexed(LOCALS, reg, Scale::Times4, -WORD_SIZE)
    }

    pub fn haddress_r(reg: Reg) -> Address {
        Self::iaddress_r(reg)
    }

    /// Load the negated local index at `bcp + offset`.
    pub fn locals_index(&mut self, reg: Reg, offset: i32) {
        self.movzxb_rm(reg, Address::new(BCP, offset));
        self.neg_r(reg);
    }

    /// Wide form: big-endian u16 index.
    pub fn locals_index_wide(&mut self, reg: Reg) {
        self.get_unsigned_2_byte_index_at_bcp(reg, 2);
        self.neg_r(reg);
    }

    // ==================== Expression stack ====================

    pub fn expr_address(slot: i32) -> Address {
        Address::new(Reg::Esp, slot * WORD_SIZE)
    }

    pub fn push_ptr(&mut self, reg: Reg) {
        self.push_r(reg);
    }

    pub fn pop_ptr(&mut self, reg: Reg) {
        self.pop_r(reg);
    }

    pub fn push_int(&mut self, reg: Reg) {
        self.push_r(reg);
    }

    pub fn pop_int(&mut self, reg: Reg) {
        self.pop_r(reg);
    }

    /// EDX:EAX; the low word ends up at the lower address.
    pub fn push_long(&mut self) {
        self.push_r(Reg::Edx);
        self.push_r(Reg::Eax);
    }

    pub fn pop_long(&mut self) {
        self.pop_r(Reg::Eax);
        self.pop_r(Reg::Edx);
    }

    pub fn push_float(&mut self) {
        self.sub_ri(Reg::Esp, WORD_SIZE);
        self.fstp_s(Address::new(Reg::Esp, 0));
    }

    pub fn pop_float(&mut self) {
        self.fld_s(Address::new(Reg::Esp, 0));
        self.add_ri(Reg::Esp, WORD_SIZE);
    }

    pub fn push_double(&mut self) {
        self.sub_ri(Reg::Esp, 2 * WORD_SIZE);
        self.fstp_d(Address::new(Reg::Esp, 0));
    }

    pub fn pop_double(&mut self) {
        self.fld_d(Address::new(Reg::Esp, 0));
        self.add_ri(Reg::Esp, 2 * WORD_SIZE);
    }

    /// Spill the cached top of stack.
    pub fn push_tos(&mut self, state: TosState) {
        if state == TosState::Atos {
            self.verify_oop(Reg::Eax);
        }
        match state {
            TosState::Atos => self.push_ptr(Reg::Eax),
            TosState::Btos
            | TosState::Ztos
            | TosState::Ctos
            | TosState::Stos
            | TosState::Itos => self.push_int(Reg::Eax),
            TosState::Ltos => self.push_long(),
            TosState::Ftos => self.push_float(),
            TosState::Dtos => self.push_double(),
            TosState::Vtos => {}
        }
    }

    /// Load the top of stack into the TOS register(s) for `state`.
    pub fn pop_tos(&mut self, state: TosState) {
        match state {
            TosState::Atos => self.pop_ptr(Reg::Eax),
            TosState::Btos
            | TosState::Ztos
            | TosState::Ctos
            | TosState::Stos
            | TosState::Itos => self.pop_int(Reg::Eax),
            TosState::Ltos => self.pop_long(),
            TosState::Ftos => self.pop_float(),
            TosState::Dtos => self.pop_double(),
            TosState::Vtos => {}
        }
        if state == TosState::Atos {
            self.verify_oop(Reg::Eax);
        }
    }

    // ==================== Operands at bcp ====================

    /// Big-endian u16 at `bcp + offset`, zero-extended.
    pub fn get_unsigned_2_byte_index_at_bcp(&mut self, reg: Reg, offset: i32) {
        self.movzxw_rm(reg, Address::new(BCP, offset));
        self.bswap(reg);
        self.shr_ri(reg, 16);
    }

    /// Cp-cache index at `bcp + offset`.
    pub fn get_cache_index_at_bcp(&mut self, index: Reg, offset: i32, size: IndexSize) {
        match size {
            IndexSize::U2 => self.movzxw_rm(index, Address::new(BCP, offset)),
            IndexSize::U4 => {
                self.mov_rm(index, Address::new(BCP, offset));
                self.not_r(index);
            }
        }
    }

    /// Cache base in `cache`, entry index scaled to words in `index`.
    pub fn get_cache_and_index_at_bcp(&mut self, cache: Reg, index: Reg, offset: i32, size: IndexSize) {
        self.get_cache_index_at_bcp(index, offset, size);
        self.get_constant_pool_cache(cache);
        self.shl_ri(index, 2);
    }

    /// Also load the resolved-bytecode tag `byte_no` of the entry.
    pub fn get_cache_and_index_and_bytecode_at_bcp(
        &mut self,
        cache: Reg,
        index: Reg,
        bytecode: Reg,
        byte_no: u32,
        offset: i32,
        size: IndexSize,
    ) {
        self.get_cache_and_index_at_bcp(cache, index, offset, size);
        self.mov_rm(bytecode, Self::cache_entry(cache, index, cp_cache::INDICES_OFFSET));
        self.shr_ri(bytecode, crate::runtime::cpcache::bytecode_shift(byte_no) as u8);
        self.and_ri(bytecode, 0xFF);
    }

    /// Address of the entry itself in `cache`.
    pub fn get_cache_entry_pointer_at_bcp(&mut self, cache: Reg, tmp: Reg, offset: i32, size: IndexSize) {
        self.get_cache_index_at_bcp(tmp, offset, size);
        self.shl_ri(tmp, 4);
        self.get_constant_pool_cache(cache);
        self.lea(cache, Address::indexed(cache, tmp, Scale::Times1, cp_cache::BASE_OFFSET));
    }

    /// Field `field` of the entry addressed by `cache` and word index `index`.
    pub fn cache_entry(cache: Reg, index: Reg, field: i32) -> Address {
        Address::indexed(cache, index, Scale::Times4, cp_cache::BASE_OFFSET + field)
    }

    // ==================== Dispatch ====================

    fn dispatch_base(&mut self, state: TosState, table: u32, verify_oop: bool) -> VmResult<()> {
        if verify_oop && state == TosState::Atos {
            self.verify_oop(Reg::Eax);
        }
        self.expect_state(state)?;
        let row = table + (state.index() * 256 * 4) as u32;
        self.jmp_m(Address::index_only(Reg::Ebx, Scale::Times4, row as i32));
        Ok(())
    }

    /// EBX = resolved opcode at `bcp + step`.
    pub fn load_next_opcode(&mut self, step: i32) {
        let delta = self.config.layout.resolved_opcode_delta as i32;
        self.movzxb_rm(Reg::Ebx, Address::new(BCP, step + delta));
    }

    /// Advance the bcp by `step` and dispatch the next bytecode.
    pub fn dispatch_next(&mut self, state: TosState, step: i32) -> VmResult<()> {
        self.load_next_opcode(step);
        if step != 0 {
            self.increment(BCP, step);
        }
        let table = self.ctx().globals.dispatch_active;
        self.dispatch_base(state, table, true)
    }

    /// Dispatch the opcode already in EBX through the active table.
    pub fn dispatch_only(&mut self, state: TosState) -> VmResult<()> {
        let table = self.ctx().globals.dispatch_active;
        self.dispatch_base(state, table, true)
    }

    /// Dispatch through the normal table, bypassing safepoint entries.
    pub fn dispatch_only_normal(&mut self, state: TosState) -> VmResult<()> {
        let table = self.ctx().globals.dispatch_normal;
        self.dispatch_base(state, table, true)
    }

    pub fn dispatch_only_noverify(&mut self, state: TosState) -> VmResult<()> {
        let table = self.ctx().globals.dispatch_active;
        self.dispatch_base(state, table, false)
    }

    /// Jump through a single 256-entry row, such as the `wide` entries.
    pub fn dispatch_via(&mut self, state: TosState, row: u32) -> VmResult<()> {
        if state == TosState::Atos {
            self.verify_oop(Reg::Eax);
        }
        self.expect_state(state)?;
        self.jmp_m(Address::index_only(Reg::Ebx, Scale::Times4, row as i32));
        Ok(())
    }

    /// Address of the `[state][opcode]` slot of the active table.
    pub fn active_slot(&self, state: TosState, opcode: u8) -> u32 {
        VmGlobals::dispatch_slot(self.ctx().globals.dispatch_active, state.index(), opcode)
    }

    // ==================== Runtime calls ====================

    /// Runtime call from interpreted code. The bcp is saved for stack
    /// walking; bcp and locals are reloaded because the VM may have moved
    /// or replaced them.
    pub fn call_vm(&mut self, oop_result: Option<Reg>, entry: RuntimeEntry, args: &[Reg]) {
        self.save_bcp();
        for &arg in args.iter().rev() {
            self.push_r(arg);
        }
        // last_Java_sp excludes the outgoing arguments
        self.lea(Reg::Eax, Address::new(Reg::Esp, WORD_SIZE * args.len() as i32));
        self.masm
            .call_vm_base(oop_result, Some(Reg::Eax), entry, args.len(), true);
        self.restore_bcp();
        self.restore_locals();
    }

    /// `call_vm` with an immediate loaded into `scratch` first.
    pub fn call_vm_imm(&mut self, oop_result: Option<Reg>, entry: RuntimeEntry, scratch: Reg, imm: i32) {
        self.mov_ri(scratch, imm);
        self.call_vm(oop_result, entry, &[scratch]);
    }

    pub fn should_not_reach_here(&mut self) {
        self.stop(msg::SHOULD_NOT_REACH_HERE);
    }

    // ==================== Counters ====================

    /// `*counter += increment; if (*counter & mask) cond -> where`.
    /// `scratch` is clobbered; with `preloaded` it already holds the value.
    #[allow(clippy::too_many_arguments)]
    pub fn increment_mask_and_jump(
        &mut self,
        counter: Address,
        increment: i32,
        mask: i32,
        scratch: Reg,
        preloaded: bool,
        cond: Cond,
        target: Label,
    ) {
        if !preloaded {
            self.mov_rm(scratch, counter);
        }
        self.increment(scratch, increment);
        self.mov_mr(counter, scratch);
        self.and_ri(scratch, mask);
        self.jcc(cond, target);
    }

    /// Method counters of `method` in `mcs`, allocating them on first use.
    /// Jumps to `skip` when allocation fails.
    pub fn get_method_counters(&mut self, method_reg: Reg, mcs: Reg, skip: Label) {
        let has_counters = self.new_label();
        self.mov_rm(mcs, Address::new(method_reg, method::METHOD_COUNTERS_OFFSET));
        self.test_rr(mcs, mcs);
        self.jcc(Cond::Ne, has_counters);
        self.call_vm(None, RuntimeEntry::BuildMethodCounters, &[method_reg]);
        self.mov_rm(mcs, Address::new(method_reg, method::METHOD_COUNTERS_OFFSET));
        self.test_rr(mcs, mcs);
        self.jcc(Cond::E, skip);
        self.bind(has_counters);
    }

    // ==================== Profiling ====================

    fn profiling(&self) -> bool {
        self.config.profile_interpreter
    }

    /// Load the mdp; jump to `zero` when the method is not profiled.
    pub fn test_method_data_pointer(&mut self, mdp: Reg, zero: Label) {
        self.mov_rm(mdp, frame::at(frame::MDX_OFFSET));
        self.test_rr(mdp, mdp);
        self.jcc(Cond::E, zero);
    }

    /// Saturating increment of the cell at `mdp + offset`.
    pub fn increment_mdp_data_at(&mut self, mdp: Reg, offset: i32) {
        let adr = Address::new(mdp, offset);
        self.add_mi(adr, data_layout::COUNTER_INCREMENT);
        self.sbb_mi(adr, 0);
    }

    pub fn increment_mdp_data_at_reg(&mut self, mdp: Reg, reg: Reg, offset: i32) {
        let adr = Address::indexed(mdp, reg, Scale::Times1, offset);
        self.add_mi(adr, data_layout::COUNTER_INCREMENT);
        self.sbb_mi(adr, 0);
    }

    pub fn set_mdp_flag_at(&mut self, mdp: Reg, flag: i32) {
        self.or_mi(Address::new(mdp, data_layout::TAG_OFFSET), flag);
    }

    /// Jump to `not_equal` unless the cell at `offset` holds `value`.
    pub fn test_mdp_data_at(&mut self, mdp: Reg, offset: i32, value: Reg, not_equal: Label) {
        self.cmp_rm(value, Address::new(mdp, offset));
        self.jcc(Cond::Ne, not_equal);
    }

    pub fn update_mdp_by_offset(&mut self, mdp: Reg, offset_of_disp: i32) {
        self.add_rm(mdp, Address::new(mdp, offset_of_disp));
        self.mov_mr(frame::at(frame::MDX_OFFSET), mdp);
    }

    pub fn update_mdp_by_offset_reg(&mut self, mdp: Reg, reg: Reg, offset_of_disp: i32) {
        self.add_rm(mdp, Address::indexed(mdp, reg, Scale::Times1, offset_of_disp));
        self.mov_mr(frame::at(frame::MDX_OFFSET), mdp);
    }

    pub fn update_mdp_by_constant(&mut self, mdp: Reg, constant: i32) {
        self.add_ri(mdp, constant);
        self.mov_mr(frame::at(frame::MDX_OFFSET), mdp);
    }

    /// Let the runtime find or claim a ret row for `return_bci`.
    pub fn update_mdp_for_ret(&mut self, return_bci: Reg) {
        self.push_r(return_bci);
        self.call_vm(None, RuntimeEntry::UpdateMdpForRet, &[return_bci]);
        self.pop_r(return_bci);
    }

    /// Bump the taken count into `bumped_count` and follow the displacement.
    pub fn profile_taken_branch(&mut self, mdp: Reg, bumped_count: Reg) {
        if !self.profiling() {
            return;
        }
        let done = self.new_label();
        self.test_method_data_pointer(mdp, done);
        let taken = Address::new(mdp, data_layout::cell_offset(cells::JUMP_TAKEN));
        self.mov_rm(bumped_count, taken);
        self.add_ri(bumped_count, data_layout::COUNTER_INCREMENT);
        self.sbb_ri(bumped_count, 0);
        self.mov_mr(taken, bumped_count);
        self.update_mdp_by_offset(mdp, data_layout::cell_offset(cells::JUMP_DISPLACEMENT));
        self.bind(done);
    }

    pub fn profile_not_taken_branch(&mut self, mdp: Reg) {
        if !self.profiling() {
            return;
        }
        let done = self.new_label();
        self.test_method_data_pointer(mdp, done);
        self.increment_mdp_data_at(mdp, data_layout::cell_offset(cells::BRANCH_NOT_TAKEN));
        self.update_mdp_by_constant(mdp, profile_size::BRANCH);
        self.bind(done);
    }

    pub fn profile_call(&mut self, mdp: Reg) {
        if !self.profiling() {
            return;
        }
        let done = self.new_label();
        self.test_method_data_pointer(mdp, done);
        self.increment_mdp_data_at(mdp, data_layout::cell_offset(cells::COUNT));
        self.update_mdp_by_constant(mdp, profile_size::COUNTER);
        self.bind(done);
    }

    pub fn profile_final_call(&mut self, mdp: Reg) {
        if !self.profiling() {
            return;
        }
        let done = self.new_label();
        self.test_method_data_pointer(mdp, done);
        self.increment_mdp_data_at(mdp, data_layout::cell_offset(cells::COUNT));
        self.update_mdp_by_constant(mdp, profile_size::VIRTUAL_CALL);
        self.bind(done);
    }

    /// Record the klass of `receiver`; `receiver` is clobbered.
    pub fn profile_virtual_call(&mut self, receiver: Reg, mdp: Reg, receiver_can_be_null: bool) {
        if !self.profiling() {
            return;
        }
        let done = self.new_label();
        let skip_receiver = self.new_label();
        self.test_method_data_pointer(mdp, done);
        if receiver_can_be_null {
            let not_null = self.new_label();
            self.test_rr(receiver, receiver);
            self.jcc(Cond::Ne, not_null);
            self.increment_mdp_data_at(mdp, data_layout::cell_offset(cells::COUNT));
            self.jmp(skip_receiver);
            self.bind(not_null);
        }
        self.load_klass(receiver, receiver);
        self.record_klass_in_profile(receiver, mdp);
        self.bind(skip_receiver);
        self.update_mdp_by_constant(mdp, profile_size::VIRTUAL_CALL);
        self.bind(done);
    }

    /// Bump the row matching `klass`, claim an empty row, or count the
    /// receiver as polymorphic.
    fn record_klass_in_profile(&mut self, klass: Reg, mdp: Reg) {
        let done = self.new_label();
        for row in 0..cells::RECEIVER_ROWS {
            let next = self.new_label();
            self.cmp_rm(klass, Address::new(mdp, data_layout::cell_offset(cells::receiver(row))));
            self.jcc(Cond::Ne, next);
            self.increment_mdp_data_at(mdp, data_layout::cell_offset(cells::receiver_count(row)));
            self.jmp(done);
            self.bind(next);
        }
        for row in 0..cells::RECEIVER_ROWS {
            let next = self.new_label();
            let cell = Address::new(mdp, data_layout::cell_offset(cells::receiver(row)));
            self.cmp_mi(cell, 0);
            self.jcc(Cond::Ne, next);
            self.mov_mr(cell, klass);
            self.mov_mi(
                Address::new(mdp, data_layout::cell_offset(cells::receiver_count(row))),
                data_layout::COUNTER_INCREMENT,
            );
            self.jmp(done);
            self.bind(next);
        }
        self.increment_mdp_data_at(mdp, data_layout::cell_offset(cells::COUNT));
        self.bind(done);
    }

    pub fn profile_ret(&mut self, return_bci: Reg, mdp: Reg) {
        if !self.profiling() {
            return;
        }
        let done = self.new_label();
        self.test_method_data_pointer(mdp, done);
        self.increment_mdp_data_at(mdp, data_layout::cell_offset(cells::COUNT));
        for row in 0..cells::RET_ROWS {
            let next = self.new_label();
            self.test_mdp_data_at(mdp, data_layout::cell_offset(cells::ret_bci(row)), return_bci, next);
            self.increment_mdp_data_at(mdp, data_layout::cell_offset(cells::ret_count(row)));
            self.update_mdp_by_offset(mdp, data_layout::cell_offset(cells::ret_displacement(row)));
            self.jmp(done);
            self.bind(next);
        }
        self.update_mdp_for_ret(return_bci);
        self.bind(done);
    }

    pub fn profile_null_seen(&mut self, mdp: Reg) {
        if !self.profiling() {
            return;
        }
        let done = self.new_label();
        self.test_method_data_pointer(mdp, done);
        self.set_mdp_flag_at(mdp, data_layout::NULL_SEEN_IN_HEADER);
        self.update_mdp_by_constant(mdp, profile_size::RECEIVER_TYPE);
        self.bind(done);
    }

    /// Record the klass seen by a type check.
    pub fn profile_typecheck(&mut self, mdp: Reg, klass: Reg) {
        if !self.profiling() {
            return;
        }
        let done = self.new_label();
        self.test_method_data_pointer(mdp, done);
        self.record_klass_in_profile(klass, mdp);
        self.update_mdp_by_constant(mdp, profile_size::RECEIVER_TYPE);
        self.bind(done);
    }

    pub fn profile_switch_default(&mut self, mdp: Reg) {
        if !self.profiling() {
            return;
        }
        let done = self.new_label();
        self.test_method_data_pointer(mdp, done);
        self.increment_mdp_data_at(mdp, data_layout::cell_offset(cells::DEFAULT_COUNT));
        self.update_mdp_by_offset(mdp, data_layout::cell_offset(cells::DEFAULT_DISPLACEMENT));
        self.bind(done);
    }

    /// `index` (clobbered) is the case number.
    pub fn profile_switch_case(&mut self, index: Reg, mdp: Reg) {
        if !self.profiling() {
            return;
        }
        let done = self.new_label();
        self.test_method_data_pointer(mdp, done);
        self.shl_ri(index, profile_size::PER_CASE.trailing_zeros() as u8);
        self.add_ri(index, profile_size::CASE_ARRAY);
        self.increment_mdp_data_at_reg(mdp, index, 0);
        self.update_mdp_by_offset_reg(mdp, index, data_layout::CELL_SIZE);
        self.bind(done);
    }

    // ==================== Type checks ====================

    /// Is the klass in `sub` a subtype of the klass in EAX? Jumps to `ok`
    /// if so, falls through otherwise. ECX is clobbered, EDI is reloaded.
    pub fn gen_subtype_check(&mut self, sub: Reg, ok: Label) {
        let hit = self.new_label();
        let miss = self.new_label();
        self.profile_typecheck(Reg::Ecx, sub);
        self.check_klass_subtype(sub, Reg::Eax, Reg::Ecx, LOCALS, hit);
        self.restore_locals();
        self.jmp(miss);
        self.bind(hit);
        self.restore_locals();
        self.jmp(ok);
        self.bind(miss);
    }

    /// Narrow an int result to the method's declared return type.
    pub fn narrow(&mut self, result: Reg) {
        let done = self.new_label();
        let not_bool = self.new_label();
        let not_byte = self.new_label();
        let not_char = self.new_label();
        self.get_method(Reg::Ecx);
        self.mov_rm(Reg::Ecx, Address::new(Reg::Ecx, method::CONST_METHOD_OFFSET));
        self.movzxb_rm(Reg::Ecx, Address::new(Reg::Ecx, const_method::RESULT_TYPE_OFFSET));
        self.cmp_ri(Reg::Ecx, BasicType::Int as i32);
        self.jcc(Cond::E, done);
        self.cmp_ri(Reg::Ecx, BasicType::Boolean as i32);
        self.jcc(Cond::Ne, not_bool);
        self.and_ri(result, 1);
        self.jmp(done);
        self.bind(not_bool);
        self.cmp_ri(Reg::Ecx, BasicType::Byte as i32);
        self.jcc(Cond::Ne, not_byte);
        self.sign_extend_byte(result);
        self.jmp(done);
        self.bind(not_byte);
        self.cmp_ri(Reg::Ecx, BasicType::Char as i32);
        self.jcc(Cond::Ne, not_char);
        self.and_ri(result, 0xFFFF);
        self.jmp(done);
        self.bind(not_char);
        self.sign_extend_short(result);
        self.bind(done);
    }

    // ==================== Locking ====================

    /// Lock the object of the monitor at EDX. Clobbers EAX, EBX, ECX.
    pub fn lock_object(&mut self, lock_reg: Reg) {
        let done = self.new_label();
        let swap = Reg::Eax;
        let obj = Reg::Ecx;
        let displaced = Address::new(lock_reg, basic_object_lock::LOCK_OFFSET);

        self.mov_rm(obj, Address::new(lock_reg, basic_object_lock::OBJ_OFFSET));
        self.mov_ri(swap, 1);
        self.or_rm(swap, Address::new(obj, 0));
        self.mov_mr(displaced, swap);
        self.cmpxchgptr(lock_reg, Address::new(obj, 0));
        self.jcc(Cond::E, done);
        // recursive when the mark is a stack address within a page of esp
        self.sub_rr(swap, Reg::Esp);
        self.and_ri(swap, 3 - 4096);
        self.mov_mr(displaced, swap);
        self.jcc(Cond::E, done);
        self.call_vm(None, RuntimeEntry::Monitorenter, &[lock_reg]);
        self.bind(done);
    }

    /// Unlock the monitor at EDX and free it. Clobbers EAX, EBX, ECX.
    pub fn unlock_object(&mut self, lock_reg: Reg) {
        let done = self.new_label();
        let swap = Reg::Eax;
        let header = Reg::Ebx;
        let obj = Reg::Ecx;

        self.save_bcp();
        self.lea(swap, Address::new(lock_reg, basic_object_lock::LOCK_OFFSET));
        self.mov_rm(obj, Address::new(lock_reg, basic_object_lock::OBJ_OFFSET));
        self.mov_mi(Address::new(lock_reg, basic_object_lock::OBJ_OFFSET), 0);
        self.mov_rm(header, Address::new(swap, 0));
        self.test_rr(header, header);
        self.jcc(Cond::E, done);
        self.cmpxchgptr(header, Address::new(obj, 0));
        self.jcc(Cond::E, done);
        self.mov_mr(Address::new(lock_reg, basic_object_lock::OBJ_OFFSET), obj);
        self.call_vm(None, RuntimeEntry::Monitorexit, &[lock_reg]);
        self.bind(done);
        self.restore_bcp();
    }

    /// Lock a synchronized method's receiver (or class mirror) in the first
    /// monitor. EBX holds the method.
    pub fn lock_method(&mut self) {
        let done = self.new_label();
        let obj = Reg::Eax;
        self.mov_rm(Reg::Ecx, Address::new(Reg::Ebx, method::ACCESS_FLAGS_OFFSET));
        self.mov_rm(obj, Address::new(LOCALS, 0));
        self.test_ri(Reg::Ecx, access::STATIC as i32);
        self.jcc(Cond::E, done);
        self.mov_rm(obj, Address::new(Reg::Ebx, method::CONST_METHOD_OFFSET));
        self.mov_rm(obj, Address::new(obj, const_method::CONSTANTS_OFFSET));
        self.mov_rm(obj, Address::new(obj, constant_pool::POOL_HOLDER_OFFSET));
        self.mov_rm(
            obj,
            Address::new(obj, crate::runtime::layout::klass::JAVA_MIRROR_OFFSET),
        );
        self.bind(done);
        self.sub_ri(Reg::Esp, basic_object_lock::SIZE);
        self.mov_mr(frame::at(frame::MONITOR_BLOCK_TOP_OFFSET), Reg::Esp);
        self.mov_mr(Address::new(Reg::Esp, basic_object_lock::OBJ_OFFSET), obj);
        self.mov_rr(Reg::Edx, Reg::Esp);
        self.lock_object(Reg::Edx);
    }

    /// Tear down the activation: unlock a synchronized method's monitor,
    /// check that every other monitor was released, pop the frame and
    /// leave the return address in `ret_addr`. EAX/EDX or ST0 carry the
    /// result for `state`.
    pub fn remove_activation(
        &mut self,
        state: TosState,
        ret_addr: Reg,
        throw_monitor_exception: bool,
        install_monitor_exception: bool,
    ) -> VmResult<()> {
        let depth = state.fpu_depth();
        let unlocked = self.new_label();
        let unlock = self.new_label();
        let no_unlock = self.new_label();

        self.get_thread(Reg::Ecx);
        let do_not_unlock = Address::new(Reg::Ecx, thread::DO_NOT_UNLOCK_OFFSET);
        self.mov_rm(Reg::Ebx, do_not_unlock);
        self.mov_rr(LOCALS, Reg::Ebx);
        self.mov_mi(do_not_unlock, 0);

        self.get_method(Reg::Ebx);
        self.mov_rm(Reg::Ecx, Address::new(Reg::Ebx, method::ACCESS_FLAGS_OFFSET));
        self.test_ri(Reg::Ecx, access::SYNCHRONIZED as i32);
        self.jcc(Cond::E, unlocked);

        self.test_rr(LOCALS, LOCALS);
        self.jcc(Cond::Ne, no_unlock);

        self.push_tos(state);
        // the first monitor belongs to the method; monitorexit may have released it
        let first = frame::byte_offset(frame::MONITOR_BLOCK_BOTTOM_OFFSET) - basic_object_lock::SIZE;
        self.lea(Reg::Edx, Address::new(Reg::Ebp, first));
        self.mov_rm(Reg::Eax, Address::new(Reg::Edx, basic_object_lock::OBJ_OFFSET));
        self.test_rr(Reg::Eax, Reg::Eax);
        self.jcc(Cond::Ne, unlock);

        self.pop_tos(state);
        if throw_monitor_exception {
            self.empty_fpu_stack();
            self.call_vm(None, RuntimeEntry::ThrowIllegalMonitorStateException, &[]);
            self.should_not_reach_here();
        } else {
            if install_monitor_exception {
                self.empty_fpu_stack();
                self.call_vm(None, RuntimeEntry::NewIllegalMonitorStateException, &[]);
            }
            self.jmp(unlocked);
        }

        self.bind(unlock);
        self.set_fpu_depth(0);
        self.unlock_object(Reg::Edx);
        self.pop_tos(state);

        self.bind(unlocked);
        self.set_fpu_depth(depth);
        {
            let restart = self.new_label();
            let lp = self.new_label();
            let exception = self.new_label();
            let entry = self.new_label();
            self.bind(restart);
            self.mov_rm(Reg::Ecx, frame::at(frame::MONITOR_BLOCK_TOP_OFFSET));
            self.lea(Reg::Ebx, frame::at(frame::MONITOR_BLOCK_BOTTOM_OFFSET));
            self.jmp(entry);

            self.bind(exception);
            if throw_monitor_exception {
                self.empty_fpu_stack();
                self.call_vm(None, RuntimeEntry::ThrowIllegalMonitorStateException, &[]);
                self.should_not_reach_here();
            } else {
                self.push_tos(state);
                self.mov_rr(Reg::Edx, Reg::Ecx);
                self.unlock_object(Reg::Edx);
                self.pop_tos(state);
                if install_monitor_exception {
                    self.empty_fpu_stack();
                    self.call_vm(None, RuntimeEntry::NewIllegalMonitorStateException, &[]);
                }
                self.jmp(restart);
            }

            self.bind(lp);
            self.set_fpu_depth(depth);
            self.cmp_mi(Address::new(Reg::Ecx, basic_object_lock::OBJ_OFFSET), 0);
            self.jcc(Cond::Ne, exception);
            self.add_ri(Reg::Ecx, basic_object_lock::SIZE);
            self.bind(entry);
            self.cmp_rr(Reg::Ecx, Reg::Ebx);
            self.jcc(Cond::Ne, lp);
        }

        self.bind(no_unlock);
        self.mov_rm(Reg::Ebx, frame::at(frame::INTERPRETER_SENDER_SP_OFFSET));
        self.leave();
        self.pop_r(ret_addr);
        self.mov_rr(Reg::Esp, Reg::Ebx);

        let use_sse = self.ctx().cpu.use_sse;
        if state == TosState::Ftos && use_sse >= 1 {
            self.sub_ri(Reg::Esp, WORD_SIZE);
            self.fstp_s(Address::new(Reg::Esp, 0));
            self.movss_xm(Xmm::Xmm0, Address::new(Reg::Esp, 0));
            self.add_ri(Reg::Esp, WORD_SIZE);
        } else if state == TosState::Dtos && use_sse >= 2 {
            self.sub_ri(Reg::Esp, 2 * WORD_SIZE);
            self.fstp_d(Address::new(Reg::Esp, 0));
            self.movsd_xm(Xmm::Xmm0, Address::new(Reg::Esp, 0));
            self.add_ri(Reg::Esp, 2 * WORD_SIZE);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{AsmContext, CodeBuffer, RelocKind};
    use crate::runtime::entries::RuntimeEntries;

    fn context(config: &RuntimeConfig) -> AsmContext {
        let globals = VmGlobals::layout(config.layout.data_base, config.layout.data_size).unwrap();
        let mut ctx = AsmContext::new(config, RuntimeEntries::synthetic(0x7000_0000), globals);
        ctx.forward_exception = 0x0800_0100;
        ctx
    }

    #[test]
    fn test_dispatch_next_reads_sideband() {
        let config = RuntimeConfig::default();
        let ctx = context(&config);
        let mut buf = CodeBuffer::new(0x0800_1000);
        let mut imasm = InterpreterMacroAssembler::new(MacroAssembler::new(&mut buf, &ctx), &config);
        imasm.dispatch_next(TosState::Itos, 1).unwrap();
        let code = buf.code();
        // MOVZX EBX, byte [ESI + delta + 1] = 0F B6 9E disp32
        assert_eq!(&code[..3], &[0x0F, 0xB6, 0x9E]);
        let disp = i32::from_le_bytes([code[3], code[4], code[5], code[6]]);
        assert_eq!(disp, config.layout.resolved_opcode_delta as i32 + 1);
        // INC ESI = 46
        assert_eq!(code[7], 0x46);
        // JMP [EBX*4 + row] = FF 24 9D disp32
        assert_eq!(&code[8..11], &[0xFF, 0x24, 0x9D]);
        let row = u32::from_le_bytes([code[11], code[12], code[13], code[14]]);
        assert_eq!(row, ctx.globals.dispatch_active + 4 * 256 * 4);
    }

    #[test]
    fn test_dispatch_rejects_fpu_imbalance() {
        let config = RuntimeConfig::default();
        let ctx = context(&config);
        let mut buf = CodeBuffer::new(0x0800_1000);
        let mut imasm = InterpreterMacroAssembler::new(MacroAssembler::new(&mut buf, &ctx), &config);
        imasm.set_codelet("fadd");
        imasm.fld1();
        assert!(imasm.dispatch_next(TosState::Vtos, 1).is_err());
        assert!(imasm.dispatch_next(TosState::Ftos, 1).is_ok());
    }

    #[test]
    fn test_call_vm_restores_bcp_and_locals() {
        let config = RuntimeConfig::default();
        let ctx = context(&config);
        let mut buf = CodeBuffer::new(0x0800_1000);
        let mut imasm = InterpreterMacroAssembler::new(MacroAssembler::new(&mut buf, &ctx), &config);
        imasm.call_vm(None, RuntimeEntry::Monitorenter, &[Reg::Edx]);
        let code = buf.code().to_vec();
        // MOV [EBP-28], ESI = 89 75 E4
        assert_eq!(&code[..3], &[0x89, 0x75, 0xE4]);
        // MOV ESI, [EBP-28] = 8B 75 E4 ; MOV EDI, [EBP-24] = 8B 7D E8
        assert_eq!(&code[code.len() - 6..], &[0x8B, 0x75, 0xE4, 0x8B, 0x7D, 0xE8]);
        assert!(buf
            .relocations()
            .iter()
            .any(|r| r.kind == RelocKind::RuntimeCall
                && r.target == ctx.entry(RuntimeEntry::Monitorenter)));
    }

    #[test]
    fn test_push_pop_long_order() {
        let config = RuntimeConfig::default();
        let ctx = context(&config);
        let mut buf = CodeBuffer::new(0x0800_1000);
        let mut imasm = InterpreterMacroAssembler::new(MacroAssembler::new(&mut buf, &ctx), &config);
        imasm.push_tos(TosState::Ltos);
        imasm.pop_tos(TosState::Ltos);
        // PUSH EDX; PUSH EAX; POP EAX; POP EDX = 52 50 58 5A
        assert_eq!(buf.code(), &[0x52, 0x50, 0x58, 0x5A]);
    }

    #[test]
    fn test_remove_activation_balances_fpu() {
        let config = RuntimeConfig::default();
        let ctx = context(&config);
        let mut buf = CodeBuffer::new(0x0800_1000);
        let mut imasm = InterpreterMacroAssembler::new(MacroAssembler::new(&mut buf, &ctx), &config);
        imasm.set_fpu_depth(1);
        imasm.remove_activation(TosState::Dtos, Reg::Esi, true, true).unwrap();
        // SSE2 hands doubles back in XMM0
        assert_eq!(imasm.fpu_depth(), 0);
        drop(imasm);
        buf.check().unwrap();
    }

    #[test]
    fn test_profile_sizes() {
        assert_eq!(profile_size::BIT, 4);
        assert_eq!(profile_size::BRANCH, 16);
        assert_eq!(profile_size::VIRTUAL_CALL, 24);
        assert_eq!(profile_size::RET, 32);
        assert_eq!(profile_size::CASE_ARRAY, 16);
    }
}
