//! Branches, subroutines, switches, returns and the odd opcodes that
//! dispatch on their own.

use super::{patch_bytecode, Masm};
use crate::asm::{Address, Cond, Label, Reg, Scale};
use crate::error::VmResult;
use crate::interpreter::masm::{InterpreterMacroAssembler as Imasm, BCP};
use crate::interpreter::template::TemplateArg;
use crate::runtime::basic_type::TosState;
use crate::runtime::bytecodes::Bytecode;
use crate::runtime::entries::RuntimeEntry;
use crate::runtime::layout::{
    const_method, counters, klass, method, nmethod, STACK_ALIGNMENT, WORD_SIZE,
};
use crate::runtime::method_data::mdo;
use crate::frame::layout as frame;

/// Opcode byte at `base + index` in the resolved-opcode sideband.
fn sideband_at(m: &Imasm<'_>, base: Reg, index: Reg) -> Address {
    let delta = m.config().layout.resolved_opcode_delta as i32;
    Address::indexed(base, index, Scale::Times1, delta)
}

/// `*counter += COUNT_INCREMENT`, jumping to `overflow` each time the
/// notification bits wrap.
fn count_backedge(m: Masm<'_, '_>, counter: Address, scratch: Reg, overflow: Option<Label>) {
    match overflow {
        Some(overflow) => {
            let freq_log = m.config().backedge_notify_freq_log;
            let mask = ((1i32 << freq_log) - 1) << counters::COUNT_SHIFT;
            m.increment_mask_and_jump(
                counter,
                counters::COUNT_INCREMENT,
                mask,
                scratch,
                false,
                Cond::E,
                overflow,
            );
        }
        None => m.add_mi(counter, counters::COUNT_INCREMENT),
    }
}

/// Taken branch of `goto`, `jsr` and the `if*` family. Backward branches
/// bump the backedge counter and may migrate to an OSR method.
fn branch(m: Masm<'_, '_>, is_jsr: bool, is_wide: bool) -> VmResult<()> {
    m.get_method(Reg::Ecx);
    m.profile_taken_branch(Reg::Eax, Reg::Ebx);

    // EDX = big-endian displacement
    let at = m.at_bcp(1);
    if is_wide {
        m.mov_rm(Reg::Edx, at);
        m.bswap(Reg::Edx);
    } else {
        m.movsxw_rm(Reg::Edx, at);
        m.bswap(Reg::Edx);
        m.sar_ri(Reg::Edx, 16);
    }

    if is_jsr {
        let target = sideband_at(m, BCP, Reg::Edx);
        m.movzxb_rm(Reg::Ebx, target);
        // return bci = bcp + length - codes
        let len = if is_wide {
            Bytecode::JsrW.length()
        } else {
            Bytecode::Jsr.length()
        } as i32;
        let ret = m.at_bcp(len - const_method::CODES_OFFSET);
        m.lea(Reg::Eax, ret);
        m.sub_rm(Reg::Eax, Address::new(Reg::Ecx, method::CONST_METHOD_OFFSET));
        m.add_rr(BCP, Reg::Edx);
        m.push_int(Reg::Eax);
        return m.dispatch_only_noverify(TosState::Vtos);
    }

    let dispatch = m.new_label();
    let counters_ready = m.new_label();
    let osr = m.config().use_on_stack_replacement;
    let overflow = osr.then(|| m.new_label());

    m.add_rr(BCP, Reg::Edx);
    m.test_rr(Reg::Edx, Reg::Edx);
    m.jcc(Cond::Ns, dispatch);

    // backward branch
    m.mov_rm(Reg::Eax, Address::new(Reg::Ecx, method::METHOD_COUNTERS_OFFSET));
    m.test_rr(Reg::Eax, Reg::Eax);
    m.jcc(Cond::Ne, counters_ready);
    m.push_r(Reg::Edx);
    m.push_r(Reg::Ecx);
    m.call_vm(None, RuntimeEntry::BuildMethodCounters, &[Reg::Ecx]);
    m.pop_r(Reg::Ecx);
    m.pop_r(Reg::Edx);
    m.mov_rm(Reg::Eax, Address::new(Reg::Ecx, method::METHOD_COUNTERS_OFFSET));
    m.test_rr(Reg::Eax, Reg::Eax);
    m.jcc(Cond::E, dispatch);
    m.bind(counters_ready);

    if m.config().profile_interpreter {
        let no_mdo = m.new_label();
        m.mov_rm(Reg::Ebx, Address::new(Reg::Ecx, method::METHOD_DATA_OFFSET));
        m.test_rr(Reg::Ebx, Reg::Ebx);
        m.jcc(Cond::E, no_mdo);
        count_backedge(
            m,
            Address::new(Reg::Ebx, mdo::BACKEDGE_COUNTER_OFFSET),
            Reg::Eax,
            overflow,
        );
        m.jmp(dispatch);
        m.bind(no_mdo);
    }
    count_backedge(
        m,
        Address::new(Reg::Eax, counters::BACKEDGE_COUNTER_OFFSET),
        Reg::Ebx,
        overflow,
    );

    m.bind(dispatch);
    m.load_next_opcode(0);
    m.dispatch_only(TosState::Vtos)?;

    if let Some(overflow) = overflow {
        m.bind(overflow);
        // EDX = bcp of the branch
        m.neg_r(Reg::Edx);
        m.add_rr(Reg::Edx, BCP);
        m.call_vm(None, RuntimeEntry::FrequencyCounterOverflow, &[Reg::Edx]);
        m.test_rr(Reg::Eax, Reg::Eax);
        m.jcc(Cond::E, dispatch);
        m.cmp_mi(
            Address::new(Reg::Eax, nmethod::ENTRY_BCI_OFFSET),
            nmethod::INVALID_OSR_ENTRY_BCI,
        );
        m.jcc(Cond::E, dispatch);

        // EBX = osr nmethod, ECX = migration buffer
        m.mov_rr(Reg::Ebx, Reg::Eax);
        m.call_vm(None, RuntimeEntry::OsrMigrationBegin, &[]);
        m.mov_rr(Reg::Ecx, Reg::Eax);

        m.mov_rm(Reg::Edx, frame::at(frame::INTERPRETER_SENDER_SP_OFFSET));
        m.leave();
        m.pop_r(Reg::Edi);
        m.mov_rr(Reg::Esp, Reg::Edx);
        m.and_ri(Reg::Esp, -STACK_ALIGNMENT);
        m.push_r(Reg::Edi);
        m.jmp_m(Address::new(Reg::Ebx, nmethod::OSR_ENTRY_POINT_OFFSET));
    }
    Ok(())
}

fn if_taken(m: Masm<'_, '_>, not_taken: Label) -> VmResult<()> {
    branch(m, false, false)?;
    m.bind(not_taken);
    m.profile_not_taken_branch(Reg::Eax);
    Ok(())
}

pub(crate) fn if_0cmp(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    let not_taken = m.new_label();
    m.test_rr(Reg::Eax, Reg::Eax);
    m.jcc(arg.cond().not_taken(), not_taken);
    if_taken(m, not_taken)
}

pub(crate) fn if_icmp(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    let not_taken = m.new_label();
    m.pop_int(Reg::Edx);
    m.cmp_rr(Reg::Edx, Reg::Eax);
    m.jcc(arg.cond().not_taken(), not_taken);
    if_taken(m, not_taken)
}

pub(crate) fn if_acmp(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    let not_taken = m.new_label();
    m.pop_ptr(Reg::Edx);
    m.cmp_rr(Reg::Edx, Reg::Eax);
    m.jcc(arg.cond().not_taken(), not_taken);
    if_taken(m, not_taken)
}

pub(crate) fn if_nullcmp(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    let not_taken = m.new_label();
    m.test_rr(Reg::Eax, Reg::Eax);
    m.jcc(arg.cond().not_taken(), not_taken);
    if_taken(m, not_taken)
}

pub(crate) fn goto_(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    branch(m, false, false)
}

pub(crate) fn goto_w(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    branch(m, false, true)
}

pub(crate) fn jsr(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    branch(m, true, false)
}

pub(crate) fn jsr_w(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    branch(m, true, true)
}

/// Continue at the bci held in local EBX (negated index).
fn ret_to_local(m: Masm<'_, '_>) -> VmResult<()> {
    m.mov_rm(Reg::Ebx, Imasm::iaddress_r(Reg::Ebx));
    m.profile_ret(Reg::Ebx, Reg::Ecx);
    m.get_method(Reg::Eax);
    m.mov_rm(BCP, Address::new(Reg::Eax, method::CONST_METHOD_OFFSET));
    m.lea(
        BCP,
        Address::indexed(BCP, Reg::Ebx, Scale::Times1, const_method::CODES_OFFSET),
    );
    m.dispatch_next(TosState::Vtos, 0)
}

pub(crate) fn ret(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index(Reg::Ebx, 1);
    ret_to_local(m)
}

pub(crate) fn wide_ret(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index_wide(Reg::Ebx);
    ret_to_local(m)
}

/// Jump by the big-endian displacement in EDX.
fn switch_jump(m: Masm<'_, '_>) -> VmResult<()> {
    m.bswap(Reg::Edx);
    let target = sideband_at(m, BCP, Reg::Edx);
    m.movzxb_rm(Reg::Ebx, target);
    m.add_rr(BCP, Reg::Edx);
    m.dispatch_only(TosState::Vtos)
}

/// EBX = first operand word of a switch, aligned past the opcode.
fn align_switch_operands(m: Masm<'_, '_>) {
    let at = m.at_bcp(WORD_SIZE);
    m.lea(Reg::Ebx, at);
    m.and_ri(Reg::Ebx, -WORD_SIZE);
}

pub(crate) fn tableswitch(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let default_case = m.new_label();
    let continue_execution = m.new_label();

    align_switch_operands(m);
    // ECX = lo, EDX = hi
    m.mov_rm(Reg::Ecx, Address::new(Reg::Ebx, WORD_SIZE));
    m.mov_rm(Reg::Edx, Address::new(Reg::Ebx, 2 * WORD_SIZE));
    m.bswap(Reg::Ecx);
    m.bswap(Reg::Edx);
    m.cmp_rr(Reg::Eax, Reg::Ecx);
    m.jcc(Cond::L, default_case);
    m.cmp_rr(Reg::Eax, Reg::Edx);
    m.jcc(Cond::G, default_case);

    m.sub_rr(Reg::Eax, Reg::Ecx);
    m.mov_rm(
        Reg::Edx,
        Address::indexed(Reg::Ebx, Reg::Eax, Scale::Times4, 3 * WORD_SIZE),
    );
    m.profile_switch_case(Reg::Eax, Reg::Ecx);

    m.bind(continue_execution);
    switch_jump(m)?;

    m.bind(default_case);
    m.profile_switch_default(Reg::Eax);
    m.mov_rm(Reg::Edx, Address::new(Reg::Ebx, 0));
    m.jmp(continue_execution);
    Ok(())
}

/// Picks the search strategy on first execution: small tables become
/// `fast_linearswitch`, the rest `fast_binaryswitch`.
pub(crate) fn lookupswitch(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    if !m.config().rewrite_bytecodes {
        return fast_linearswitch(m, arg);
    }
    let chosen = m.new_label();
    let threshold = m.config().binary_switch_threshold as i32;

    align_switch_operands(m);
    m.mov_rm(Reg::Ecx, Address::new(Reg::Ebx, WORD_SIZE));
    m.bswap(Reg::Ecx);
    m.push_int(Reg::Eax);
    m.cmp_ri(Reg::Ecx, threshold);
    m.mov_ri(Reg::Ecx, Bytecode::FastLinearswitch.code() as i32);
    m.jcc(Cond::L, chosen);
    m.mov_ri(Reg::Ecx, Bytecode::FastBinaryswitch.code() as i32);
    m.bind(chosen);

    m.push_r(Reg::Ecx);
    patch_bytecode(m, None, Reg::Ecx, Reg::Ebx, None);
    m.pop_r(Reg::Ebx);
    m.pop_int(Reg::Eax);
    // re-execute as the quickened form
    m.dispatch_only_normal(TosState::Itos)
}

pub(crate) fn fast_linearswitch(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let lp = m.new_label();
    let loop_entry = m.new_label();
    let found = m.new_label();
    let continue_execution = m.new_label();

    // compare against big-endian matches directly
    m.bswap(Reg::Eax);
    align_switch_operands(m);
    m.mov_rm(Reg::Ecx, Address::new(Reg::Ebx, WORD_SIZE));
    m.bswap(Reg::Ecx);
    m.jmp(loop_entry);

    m.bind(lp);
    m.cmp_rm(
        Reg::Eax,
        Address::indexed(Reg::Ebx, Reg::Ecx, Scale::Times8, 2 * WORD_SIZE),
    );
    m.jcc(Cond::E, found);
    m.bind(loop_entry);
    m.dec_r(Reg::Ecx);
    m.jcc(Cond::Ge, lp);

    m.profile_switch_default(Reg::Eax);
    m.mov_rm(Reg::Edx, Address::new(Reg::Ebx, 0));
    m.jmp(continue_execution);

    m.bind(found);
    m.mov_rm(
        Reg::Edx,
        Address::indexed(Reg::Ebx, Reg::Ecx, Scale::Times8, 3 * WORD_SIZE),
    );
    m.profile_switch_case(Reg::Ecx, Reg::Eax);

    m.bind(continue_execution);
    switch_jump(m)
}

/// Binary search over the sorted match/offset pairs. ESI and EDI serve as
/// temporaries and are reloaded from the frame before dispatch.
pub(crate) fn fast_binaryswitch(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let key = Reg::Eax;
    let array = Reg::Ebx;
    let i = Reg::Ecx;
    let j = Reg::Edx;
    let h = Reg::Edi;
    let temp = Reg::Esi;

    m.save_bcp();
    // array points at the first pair
    let first = m.at_bcp(3 * WORD_SIZE);
    m.lea(array, first);
    m.and_ri(array, -WORD_SIZE);
    m.xor_rr(i, i);
    m.mov_rm(j, Address::new(array, -WORD_SIZE));
    m.bswap(j);

    let lp = m.new_label();
    let entry = m.new_label();
    m.jmp(entry);

    m.bind(lp);
    // h = (i + j) >> 1
    m.lea(h, Address::indexed(i, j, Scale::Times1, 0));
    m.sar_ri(h, 1);
    m.mov_rm(temp, Address::indexed(array, h, Scale::Times8, 0));
    m.bswap(temp);
    m.cmp_rr(key, temp);
    m.cmov_rr(Cond::L, j, h);
    m.cmov_rr(Cond::Ge, i, h);
    m.bind(entry);
    // while (i + 1 < j)
    m.lea(h, Address::new(i, 1));
    m.cmp_rr(h, j);
    m.jcc(Cond::L, lp);

    let default_case = m.new_label();
    m.mov_rm(temp, Address::indexed(array, i, Scale::Times8, 0));
    m.bswap(temp);
    m.cmp_rr(key, temp);
    m.jcc(Cond::Ne, default_case);

    m.mov_rm(j, Address::indexed(array, i, Scale::Times8, WORD_SIZE));
    m.profile_switch_case(i, key);
    m.restore_bcp();
    m.restore_locals();
    switch_jump(m)?;

    m.bind(default_case);
    m.profile_switch_default(i);
    m.mov_rm(j, Address::new(array, -2 * WORD_SIZE));
    m.restore_bcp();
    m.restore_locals();
    switch_jump(m)
}

/// `*return` of the TOS state in the argument. The finalizer-registering
/// variant checks the receiver's klass first.
pub(crate) fn return_(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    let state = arg.state();
    if m.bytecode() == Bytecode::ReturnRegisterFinalizer {
        let skip = m.new_label();
        m.mov_rm(Reg::Eax, Imasm::iaddress(0));
        m.load_klass(Reg::Edi, Reg::Eax);
        m.mov_rm(Reg::Edi, Address::new(Reg::Edi, klass::ACCESS_FLAGS_OFFSET));
        m.test_ri(Reg::Edi, klass::HAS_FINALIZER as i32);
        m.jcc(Cond::E, skip);
        m.call_vm(None, RuntimeEntry::RegisterFinalizer, &[Reg::Eax]);
        m.bind(skip);
    }
    if state == TosState::Itos {
        m.narrow(Reg::Eax);
    }
    m.remove_activation(state, BCP, true, true)?;
    m.jmp_r(BCP);
    Ok(())
}

/// Dispatch the widened opcode through the `wide` entry row.
pub(crate) fn wide(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let at = m.at_bcp(1);
    m.movzxb_rm(Reg::Ebx, at);
    let row = m.ctx().globals.wentry_table;
    m.dispatch_via(TosState::Vtos, row)
}

/// Report the breakpoint, then run the original bytecode through the
/// normal table.
pub(crate) fn breakpoint(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.get_method(Reg::Ecx);
    m.call_vm(None, RuntimeEntry::GetOriginalBytecodeAt, &[Reg::Ecx, BCP]);
    m.mov_rr(Reg::Ebx, Reg::Eax);
    m.get_method(Reg::Ecx);
    m.call_vm(None, RuntimeEntry::Breakpoint, &[Reg::Ecx, BCP]);
    m.dispatch_only_normal(TosState::Vtos)
}

pub(crate) fn shouldnotreachhere(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.should_not_reach_here();
    Ok(())
}
