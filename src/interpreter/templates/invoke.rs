//! Method invocation.
//!
//! Every invoke resolves its cache entry, pushes the appendix of
//! signature-polymorphic calls, loads the receiver and pushes the return
//! entry for the callee's result state before jumping to the target's
//! interpreted entry with ESI holding the sender sp.

use super::{patch_bytecode, resolve_cache_and_index, Masm};
use crate::asm::{Address, Cond, Label, Reg, Scale};
use crate::error::{VmError, VmResult};
use crate::frame::layout as frame;
use crate::interpreter::masm::{IndexSize, InterpreterMacroAssembler as Imasm, BCP, LOCALS};
use crate::interpreter::template::TemplateArg;
use crate::runtime::basic_type::BasicType;
use crate::runtime::bytecodes::Bytecode;
use crate::runtime::cpcache::flags;
use crate::runtime::entries::RuntimeEntry;
use crate::runtime::layout::{
    array_base_offset, constant_pool, cp_cache, klass, method, oop, WORD_SIZE,
};

/// Return-entry table for the current invoke, indexed by result state.
fn return_table(m: &Imasm<'_>) -> u32 {
    let globals = &m.ctx().globals;
    match m.bytecode() {
        Bytecode::Invokeinterface => globals.invokeinterface_return,
        Bytecode::Invokedynamic => globals.invokedynamic_return,
        _ => globals.invoke_return,
    }
}

/// Push the return entry for the result state in the flags word at EDX.
/// EDX is clobbered.
fn push_return_address(m: Masm<'_, '_>) {
    m.shr_ri(Reg::Edx, flags::TOS_STATE_SHIFT as u8);
    let table = return_table(m);
    m.mov_rm(Reg::Edx, Address::index_only(Reg::Edx, Scale::Times4, table as i32));
    m.push_r(Reg::Edx);
}

/// ECX = receiver, `parameter_size` words below the stack top.
fn load_receiver(m: Masm<'_, '_>) {
    m.mov_rr(Reg::Ecx, Reg::Edx);
    m.and_ri(Reg::Ecx, flags::PARAMETER_SIZE_MASK as i32);
    m.mov_rm(
        Reg::Ecx,
        Address::indexed(Reg::Esp, Reg::Ecx, Scale::Times4, -WORD_SIZE),
    );
    m.verify_oop(Reg::Ecx);
}

/// Resolve and load the call site.
///
/// `method` receives f1 (f2 for `invokevirtual`), `index` receives f2.
/// With `receiver` ECX holds the receiver; with `keep_flags` EDX still
/// holds the flags afterwards.
fn prepare_invoke(
    m: Masm<'_, '_>,
    byte_no: u32,
    method_reg: Reg,
    index: Option<Reg>,
    receiver: bool,
    keep_flags: bool,
) -> VmResult<()> {
    let bc = m.bytecode();
    let size = if bc == Bytecode::Invokedynamic {
        IndexSize::U4
    } else {
        IndexSize::U2
    };
    let method_field = if bc == Bytecode::Invokevirtual {
        cp_cache::F2_OFFSET
    } else {
        cp_cache::F1_OFFSET
    };

    m.save_bcp();
    resolve_cache_and_index(m, byte_no, Reg::Ecx, Reg::Edx, size);
    m.mov_rm(method_reg, Imasm::cache_entry(Reg::Ecx, Reg::Edx, method_field));
    if let Some(index) = index {
        m.mov_rm(index, Imasm::cache_entry(Reg::Ecx, Reg::Edx, cp_cache::F2_OFFSET));
    }
    m.mov_rm(Reg::Edx, Imasm::cache_entry(Reg::Ecx, Reg::Edx, cp_cache::FLAGS_OFFSET));

    if matches!(bc, Bytecode::Invokedynamic | Bytecode::Invokehandle) {
        let appendix = index.ok_or_else(|| {
            VmError::Template(format!("{bc}: appendix needs an index register"))
        })?;
        let no_push = m.new_label();
        m.test_ri(Reg::Edx, 1 << flags::HAS_APPENDIX_SHIFT);
        m.jcc(Cond::E, no_push);
        // appendix = resolved_references[f2], the trailing argument
        m.mov_rr(Reg::Ecx, appendix);
        m.get_constant_pool(appendix);
        m.mov_rm(
            appendix,
            Address::new(appendix, constant_pool::RESOLVED_REFERENCES_OFFSET),
        );
        m.mov_rm(
            appendix,
            Address::indexed(
                appendix,
                Reg::Ecx,
                Scale::Times4,
                array_base_offset(BasicType::Object),
            ),
        );
        m.push_r(appendix);
        m.bind(no_push);
    }

    if receiver {
        load_receiver(m);
    }
    if keep_flags {
        m.mov_rr(BCP, Reg::Edx);
    }
    push_return_address(m);
    if keep_flags {
        m.mov_rr(Reg::Edx, BCP);
        m.restore_bcp();
    }
    Ok(())
}

/// Record the sender sp in ESI and the frame, then enter the callee.
fn jump_from_interpreted(m: Masm<'_, '_>, method_reg: Reg) {
    m.lea(BCP, Address::new(Reg::Esp, WORD_SIZE));
    m.mov_mr(frame::at(frame::LAST_SP_OFFSET), BCP);
    m.jmp_m(Address::new(method_reg, method::FROM_INTERPRETED_OFFSET));
}

/// Dispatch through the vtable, or call f2 directly when the flags mark
/// the target final. EBX = f2, ECX = receiver, EDX = flags.
fn invokevirtual_helper(m: Masm<'_, '_>) {
    let not_final = m.new_label();
    m.mov_rr(Reg::Eax, Reg::Edx);
    m.and_ri(Reg::Eax, 1 << flags::IS_VFINAL_SHIFT);
    m.jcc(Cond::E, not_final);

    m.null_check(Reg::Ecx, None);
    if m.bytecode() == Bytecode::Invokevirtual {
        patch_bytecode(m, Some(Bytecode::FastInvokevfinal), Reg::Eax, Reg::Edx, None);
    }
    m.profile_final_call(Reg::Eax);
    jump_from_interpreted(m, Reg::Ebx);

    m.bind(not_final);
    m.null_check(Reg::Ecx, Some(oop::KLASS_OFFSET));
    m.load_klass(Reg::Eax, Reg::Ecx);
    m.profile_virtual_call(Reg::Ecx, LOCALS, false);
    m.mov_rm(
        Reg::Ebx,
        Address::indexed(Reg::Eax, Reg::Ebx, Scale::Times4, klass::VTABLE_START_OFFSET),
    );
    jump_from_interpreted(m, Reg::Ebx);
}

/// Find `interface`'s method block in the itable of `recv_klass` and load
/// the method at `itable_index` into `result`. `recv_klass` and `scan` are
/// clobbered; a klass that does not implement the interface jumps to
/// `no_such_interface`.
fn lookup_interface_method(
    m: Masm<'_, '_>,
    recv_klass: Reg,
    interface: Reg,
    itable_index: Reg,
    result: Reg,
    scan: Reg,
    no_such_interface: Label,
) {
    let search = m.new_label();
    let found = m.new_label();

    // the itable follows the vtable
    m.mov_rm(scan, Address::new(recv_klass, klass::VTABLE_LENGTH_OFFSET));
    m.lea(
        scan,
        Address::indexed(recv_klass, scan, Scale::Times4, klass::VTABLE_START_OFFSET),
    );
    m.lea(
        recv_klass,
        Address::indexed(recv_klass, itable_index, Scale::Times4, 0),
    );

    // first entry peeled
    m.mov_rm(result, Address::new(scan, 0));
    m.cmp_rr(interface, result);
    m.jcc(Cond::E, found);

    m.bind(search);
    // a null interface ends the table
    m.test_rr(result, result);
    m.jcc(Cond::E, no_such_interface);
    m.add_ri(scan, klass::ITABLE_OFFSET_ENTRY_SIZE);
    m.mov_rm(result, Address::new(scan, 0));
    m.cmp_rr(interface, result);
    m.jcc(Cond::Ne, search);

    m.bind(found);
    m.mov_rm(scan, Address::new(scan, WORD_SIZE));
    m.mov_rm(result, Address::indexed(recv_klass, scan, Scale::Times1, 0));
}

/// Unwind the pushed return address and throw through the runtime.
fn throw_from_invoke(m: Masm<'_, '_>, entry: RuntimeEntry) {
    m.pop_r(Reg::Ebx);
    m.restore_bcp();
    m.restore_locals();
    m.call_vm(None, entry, &[]);
    m.should_not_reach_here();
}

pub(crate) fn invokevirtual(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    prepare_invoke(m, arg.int() as u32, Reg::Ebx, None, true, true)?;
    invokevirtual_helper(m);
    Ok(())
}

pub(crate) fn invokespecial(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    prepare_invoke(m, arg.int() as u32, Reg::Ebx, None, true, false)?;
    m.verify_oop(Reg::Ecx);
    m.null_check(Reg::Ecx, None);
    m.profile_call(Reg::Eax);
    jump_from_interpreted(m, Reg::Ebx);
    Ok(())
}

pub(crate) fn invokestatic(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    prepare_invoke(m, arg.int() as u32, Reg::Ebx, None, false, false)?;
    m.profile_call(Reg::Eax);
    jump_from_interpreted(m, Reg::Ebx);
    Ok(())
}

/// `invokevirtual` of a final method, already resolved: f2 is the method.
pub(crate) fn fast_invokevfinal(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.save_bcp();
    m.get_cache_and_index_at_bcp(Reg::Ecx, Reg::Edx, 1, IndexSize::U2);
    m.mov_rm(Reg::Ebx, Imasm::cache_entry(Reg::Ecx, Reg::Edx, cp_cache::F2_OFFSET));
    m.mov_rm(Reg::Edx, Imasm::cache_entry(Reg::Ecx, Reg::Edx, cp_cache::FLAGS_OFFSET));
    load_receiver(m);
    push_return_address(m);
    m.null_check(Reg::Ecx, None);
    m.profile_final_call(Reg::Eax);
    jump_from_interpreted(m, Reg::Ebx);
    Ok(())
}

pub(crate) fn invokeinterface(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    // EAX = interface klass, EBX = itable index, ECX = receiver, EDX = flags
    prepare_invoke(m, arg.int() as u32, Reg::Eax, Some(Reg::Ebx), true, true)?;

    // methods of Object reached through an interface dispatch virtually
    let not_method = m.new_label();
    m.mov_rr(LOCALS, Reg::Edx);
    m.and_ri(LOCALS, 1 << flags::IS_FORCED_VIRTUAL_SHIFT);
    m.jcc(Cond::E, not_method);
    invokevirtual_helper(m);
    m.bind(not_method);

    let no_such_interface = m.new_label();
    let no_such_method = m.new_label();
    m.restore_locals();
    m.null_check(Reg::Ecx, Some(oop::KLASS_OFFSET));
    m.load_klass(Reg::Edx, Reg::Ecx);
    m.profile_virtual_call(Reg::Ecx, BCP, false);
    lookup_interface_method(
        m,
        Reg::Edx,
        Reg::Eax,
        Reg::Ebx,
        Reg::Ebx,
        BCP,
        no_such_interface,
    );
    m.test_rr(Reg::Ebx, Reg::Ebx);
    m.jcc(Cond::E, no_such_method);
    jump_from_interpreted(m, Reg::Ebx);
    m.should_not_reach_here();

    m.bind(no_such_method);
    throw_from_invoke(m, RuntimeEntry::ThrowAbstractMethodError);
    m.bind(no_such_interface);
    throw_from_invoke(m, RuntimeEntry::ThrowIncompatibleClassChangeError);
    Ok(())
}

/// Signature-polymorphic call: EBX = adapter (f1), the method type is
/// pushed as the appendix.
pub(crate) fn invokehandle(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    prepare_invoke(m, arg.int() as u32, Reg::Ebx, Some(Reg::Eax), true, false)?;
    m.verify_oop(Reg::Ecx);
    m.null_check(Reg::Ecx, None);
    m.profile_final_call(Reg::Eax);
    jump_from_interpreted(m, Reg::Ebx);
    Ok(())
}

/// EBX = call site linker (f1), the call site object is pushed as the
/// appendix.
pub(crate) fn invokedynamic(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    prepare_invoke(m, arg.int() as u32, Reg::Ebx, Some(Reg::Eax), false, false)?;
    m.profile_call(BCP);
    m.verify_oop(Reg::Eax);
    jump_from_interpreted(m, Reg::Ebx);
    Ok(())
}
