//! Allocation, type checks, exceptions and monitors.

use super::Masm;
use crate::asm::{Address, Cond, Reg, Scale};
use crate::error::VmResult;
use crate::frame::layout as frame;
use crate::interpreter::masm::{BCP, LOCALS};
use crate::interpreter::template::TemplateArg;
use crate::runtime::basic_type::TosState;
use crate::runtime::entries::RuntimeEntry;
use crate::runtime::layout::{
    array, basic_object_lock, constant_pool, klass, lh, mark, oop, WORD_SIZE,
};

/// Resolved klass slot of the constant pool entry at EBX.
fn resolved_klass(cpool: Reg, index: Reg) -> Address {
    Address::indexed(cpool, index, Scale::Times4, constant_pool::BASE_OFFSET)
}

/// Tag byte of the constant pool entry at `index`.
fn tag(tags: Reg, index: Reg) -> Address {
    Address::indexed(tags, index, Scale::Times1, 0)
}

/// Instance allocation: TLAB bump, then a CAS on the shared eden, then
/// the runtime. Classes that are not initialized or need the slow path
/// always go to the runtime.
pub(crate) fn new(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let slow_case = m.new_label();
    let slow_case_no_pop = m.new_label();
    let allocate_shared = m.new_label();
    let initialize_object = m.new_label();
    let initialize_header = m.new_label();
    let done = m.new_label();
    let use_tlab = m.config().use_tlab;

    m.get_unsigned_2_byte_index_at_bcp(Reg::Edx, 1);
    m.get_cpool_and_tags(Reg::Ecx, Reg::Eax);
    m.cmpb_mi(tag(Reg::Eax, Reg::Edx), constant_pool::TAG_CLASS);
    m.jcc(Cond::Ne, slow_case_no_pop);

    m.mov_rm(Reg::Ecx, resolved_klass(Reg::Ecx, Reg::Edx));
    m.push_r(Reg::Ecx);

    m.cmpb_mi(Address::new(Reg::Ecx, klass::INIT_STATE_OFFSET), klass::FULLY_INITIALIZED);
    m.jcc(Cond::Ne, slow_case);
    // EDX = instance size in bytes
    m.mov_rm(Reg::Edx, Address::new(Reg::Ecx, klass::LAYOUT_HELPER_OFFSET));
    m.test_ri(Reg::Edx, lh::INSTANCE_SLOW_PATH_BIT);
    m.jcc(Cond::Ne, slow_case);

    if use_tlab {
        let thread = Reg::Ecx;
        m.get_thread(thread);
        m.tlab_allocate(thread, Reg::Eax, Reg::Edx, Reg::Ebx, allocate_shared);
        m.jmp(initialize_object);
    }

    m.bind(allocate_shared);
    m.eden_allocate(Reg::Edx, Reg::Ebx, slow_case);

    // clear the fields, two words per step from the end
    m.bind(initialize_object);
    m.sub_ri(Reg::Edx, oop::HEADER_SIZE);
    m.jcc(Cond::E, initialize_header);
    m.xor_rr(Reg::Ecx, Reg::Ecx);
    m.shr_ri(Reg::Edx, 3);
    let clear = m.new_label();
    m.bind(clear);
    m.mov_mr(
        Address::indexed(Reg::Eax, Reg::Edx, Scale::Times8, oop::HEADER_SIZE - WORD_SIZE),
        Reg::Ecx,
    );
    m.mov_mr(
        Address::indexed(Reg::Eax, Reg::Edx, Scale::Times8, oop::HEADER_SIZE - 2 * WORD_SIZE),
        Reg::Ecx,
    );
    m.decrement(Reg::Edx, 1);
    m.jcc(Cond::Ne, clear);

    m.bind(initialize_header);
    m.mov_mi(Address::new(Reg::Eax, oop::MARK_OFFSET), mark::PROTOTYPE as i32);
    m.pop_r(Reg::Ecx);
    m.store_klass(Reg::Eax, Reg::Ecx);
    m.jmp(done);

    m.bind(slow_case);
    m.pop_r(Reg::Ecx);
    m.bind(slow_case_no_pop);
    m.get_constant_pool(Reg::Eax);
    m.get_unsigned_2_byte_index_at_bcp(Reg::Edx, 1);
    m.call_vm(Some(Reg::Eax), RuntimeEntry::New, &[Reg::Eax, Reg::Edx]);

    m.bind(done);
    Ok(())
}

/// Primitive array; the element type is the operand byte.
pub(crate) fn newarray(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.push_int(Reg::Eax);
    let at = m.at_bcp(1);
    m.movzxb_rm(Reg::Edx, at);
    m.call_vm(Some(Reg::Eax), RuntimeEntry::Newarray, &[Reg::Edx, Reg::Eax]);
    m.pop_int(Reg::Edx);
    Ok(())
}

pub(crate) fn anewarray(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.get_unsigned_2_byte_index_at_bcp(Reg::Edx, 1);
    m.get_constant_pool(Reg::Ecx);
    m.call_vm(Some(Reg::Eax), RuntimeEntry::Anewarray, &[Reg::Ecx, Reg::Edx, Reg::Eax]);
    Ok(())
}

/// The runtime receives the address of the first dimension; the counts
/// are dropped afterwards.
pub(crate) fn multianewarray(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let dims = m.at_bcp(3);
    m.movzxb_rm(Reg::Eax, dims);
    m.lea(Reg::Eax, Address::indexed(Reg::Esp, Reg::Eax, Scale::Times4, -WORD_SIZE));
    m.call_vm(Some(Reg::Eax), RuntimeEntry::Multianewarray, &[Reg::Eax]);
    let dims = m.at_bcp(3);
    m.movzxb_rm(Reg::Ebx, dims);
    m.lea(Reg::Esp, Address::indexed(Reg::Esp, Reg::Ebx, Scale::Times4, 0));
    Ok(())
}

pub(crate) fn arraylength(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.null_check(Reg::Eax, Some(array::LENGTH_OFFSET));
    m.mov_rm(Reg::Eax, Address::new(Reg::Eax, array::LENGTH_OFFSET));
    Ok(())
}

pub(crate) fn athrow(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.null_check(Reg::Eax, None);
    let throw = m.shared().throw_exception;
    m.jmp_abs(throw);
    Ok(())
}

/// Load the class operand of `checkcast`/`instanceof` into EAX, quickening
/// the constant pool entry through the runtime when it is still
/// unresolved. The object is left in EDX.
fn load_type_operand(m: Masm<'_, '_>) {
    let quicked = m.new_label();
    let resolved = m.new_label();

    m.get_cpool_and_tags(Reg::Ecx, Reg::Edx);
    m.get_unsigned_2_byte_index_at_bcp(Reg::Ebx, 1);
    m.cmpb_mi(tag(Reg::Edx, Reg::Ebx), constant_pool::TAG_CLASS);
    m.jcc(Cond::E, quicked);

    m.push_tos(TosState::Atos);
    m.call_vm(None, RuntimeEntry::QuickenIoCc, &[]);
    m.get_thread(LOCALS);
    m.get_vm_result_2(Reg::Eax, LOCALS);
    m.restore_locals();
    m.pop_ptr(Reg::Edx);
    m.jmp(resolved);

    m.bind(quicked);
    m.mov_rr(Reg::Edx, Reg::Eax);
    m.mov_rm(Reg::Eax, resolved_klass(Reg::Ecx, Reg::Ebx));
    m.bind(resolved);
}

pub(crate) fn checkcast(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let is_null = m.new_label();
    let ok_is_subtype = m.new_label();
    let done = m.new_label();

    m.test_rr(Reg::Eax, Reg::Eax);
    m.jcc(Cond::E, is_null);
    load_type_operand(m);
    m.load_klass(Reg::Ebx, Reg::Edx);
    m.gen_subtype_check(Reg::Ebx, ok_is_subtype);

    // object at TOS for the throw entry
    m.push_r(Reg::Edx);
    let cce = m.shared().throw_class_cast;
    m.jmp_abs(cce);

    m.bind(ok_is_subtype);
    m.mov_rr(Reg::Eax, Reg::Edx);
    if m.config().profile_interpreter {
        m.jmp(done);
        m.bind(is_null);
        m.profile_null_seen(Reg::Ecx);
    } else {
        m.bind(is_null);
    }
    m.bind(done);
    Ok(())
}

/// EAX = 1 for a non-null instance of the operand class, 0 otherwise.
pub(crate) fn instanceof(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let is_null = m.new_label();
    let ok_is_subtype = m.new_label();
    let done = m.new_label();

    m.test_rr(Reg::Eax, Reg::Eax);
    m.jcc(Cond::E, is_null);
    load_type_operand(m);
    m.load_klass(Reg::Edx, Reg::Edx);
    m.gen_subtype_check(Reg::Edx, ok_is_subtype);
    m.xor_rr(Reg::Eax, Reg::Eax);
    m.jmp(done);

    m.bind(ok_is_subtype);
    m.mov_ri(Reg::Eax, 1);
    if m.config().profile_interpreter {
        m.jmp(done);
        m.bind(is_null);
        m.profile_null_seen(Reg::Ecx);
    } else {
        m.bind(is_null);
    }
    m.bind(done);
    Ok(())
}

// ==================== Monitors ====================

/// `[ebp + initial_sp]` holds the top of the monitor block; its own
/// address bounds the block from above.
fn monitor_block_top() -> Address {
    frame::at(frame::MONITOR_BLOCK_TOP_OFFSET)
}

fn monitor_block_bot() -> Address {
    frame::at(frame::MONITOR_BLOCK_BOTTOM_OFFSET)
}

fn monitor_obj(entry: Reg) -> Address {
    Address::new(entry, basic_object_lock::OBJ_OFFSET)
}

/// Lock the object in EAX in a free monitor, growing the block into the
/// expression stack when none is free.
pub(crate) fn monitorenter(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let entry_size = basic_object_lock::SIZE;
    let allocated = m.new_label();
    m.null_check(Reg::Eax, None);

    // EDX = a free slot, or null
    m.xor_rr(Reg::Edx, Reg::Edx);
    {
        let entry = m.new_label();
        let looping = m.new_label();
        let exit = m.new_label();
        m.mov_rm(Reg::Ecx, monitor_block_top());
        m.lea(Reg::Ebx, monitor_block_bot());
        m.jmp(entry);

        m.bind(looping);
        m.cmp_mi(monitor_obj(Reg::Ecx), 0);
        m.cmov_rr(Cond::E, Reg::Edx, Reg::Ecx);
        m.cmp_rm(Reg::Eax, monitor_obj(Reg::Ecx));
        m.jcc(Cond::E, exit);
        m.add_ri(Reg::Ecx, entry_size);
        m.bind(entry);
        m.cmp_rr(Reg::Ecx, Reg::Ebx);
        m.jcc(Cond::Ne, looping);
        m.bind(exit);
    }
    m.test_rr(Reg::Edx, Reg::Edx);
    m.jcc(Cond::Ne, allocated);

    // no free slot: move the expression stack down by one monitor
    {
        let entry = m.new_label();
        let looping = m.new_label();
        m.mov_rm(Reg::Edx, monitor_block_bot());
        m.sub_ri(Reg::Esp, entry_size);
        m.sub_ri(Reg::Edx, entry_size);
        m.mov_rr(Reg::Ecx, Reg::Esp);
        m.mov_mr(monitor_block_bot(), Reg::Edx);
        m.jmp(entry);

        m.bind(looping);
        m.mov_rm(Reg::Ebx, Address::new(Reg::Ecx, entry_size));
        m.mov_mr(Address::new(Reg::Ecx, 0), Reg::Ebx);
        m.add_ri(Reg::Ecx, WORD_SIZE);
        m.bind(entry);
        m.cmp_rr(Reg::Ecx, Reg::Edx);
        m.jcc(Cond::Ne, looping);
    }

    m.bind(allocated);
    // the object is already popped; step past the bytecode so an
    // asynchronous exception sees the right bci
    m.increment(BCP, 1);
    m.mov_mr(monitor_obj(Reg::Edx), Reg::Eax);
    m.lock_object(Reg::Edx);
    m.save_bcp();
    m.dispatch_next(TosState::Vtos, 0)
}

/// Unlock the monitor holding the object in EAX. Unlocking an object this
/// frame does not hold throws `IllegalMonitorStateException`.
pub(crate) fn monitorexit(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let entry_size = basic_object_lock::SIZE;
    let found = m.new_label();
    m.null_check(Reg::Eax, None);
    {
        let entry = m.new_label();
        let looping = m.new_label();
        m.mov_rm(Reg::Edx, monitor_block_top());
        m.lea(Reg::Ebx, monitor_block_bot());
        m.jmp(entry);

        m.bind(looping);
        m.cmp_rm(Reg::Eax, monitor_obj(Reg::Edx));
        m.jcc(Cond::E, found);
        m.add_ri(Reg::Edx, entry_size);
        m.bind(entry);
        m.cmp_rr(Reg::Edx, Reg::Ebx);
        m.jcc(Cond::Ne, looping);
    }
    m.call_vm(None, RuntimeEntry::ThrowIllegalMonitorStateException, &[]);
    m.should_not_reach_here();

    m.bind(found);
    // keep the object visible to the oop map while unlocking
    m.push_ptr(Reg::Eax);
    m.unlock_object(Reg::Edx);
    m.pop_ptr(Reg::Eax);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::asm::RelocKind;
    use crate::config::RuntimeConfig;
    use crate::runtime::bytecodes::Bytecode;
    use crate::runtime::entries::RuntimeEntry;
    use crate::runtime::thread;

    fn calls_with(config: &RuntimeConfig, bc: Bytecode, entry: RuntimeEntry) -> bool {
        let ctx = context(config);
        generate_with(config, bc, false)
            .unwrap()
            .relocations()
            .iter()
            .any(|r| r.kind == RelocKind::RuntimeCall && r.target == ctx.entry(entry))
    }

    fn calls(bc: Bytecode, entry: RuntimeEntry) -> bool {
        calls_with(&RuntimeConfig::default(), bc, entry)
    }

    fn jumps_to(bc: Bytecode, target: u32) -> bool {
        generate(bc)
            .relocations()
            .iter()
            .any(|r| r.kind == RelocKind::External && r.target == target)
    }

    #[test]
    fn test_new_fast_paths() {
        let mut config = RuntimeConfig::default();
        config.use_tlab = true;
        let ctx = context(&config);
        let code = generate_with(&config, Bytecode::New, false).unwrap().into_code();
        // MOV EAX, [ECX+tlab_top]
        let top = thread::TLAB_TOP_OFFSET as u8;
        assert!(contains(&code, &[0x8B, 0x41, top]));
        // CMPXCHG [eden_top], EBX = 0F B1 1D imm32
        let mut cas = vec![0x0F, 0xB1, 0x1D];
        cas.extend_from_slice(&ctx.globals.eden_top.to_le_bytes());
        assert!(contains(&code, &cas));
        // MOV [EAX], 1 ; POP ECX ; MOV [EAX+4], ECX
        assert!(contains(
            &code,
            &[0xC7, 0x00, 0x01, 0x00, 0x00, 0x00, 0x59, 0x89, 0x48, 0x04]
        ));
        assert!(calls_with(&config, Bytecode::New, RuntimeEntry::New));
    }

    #[test]
    fn test_new_without_tlab_uses_eden_only() {
        let mut config = RuntimeConfig::default();
        config.use_tlab = false;
        let code = generate_with(&config, Bytecode::New, false).unwrap().into_code();
        let top = thread::TLAB_TOP_OFFSET as u8;
        assert!(!contains(&code, &[0x8B, 0x41, top]));
    }

    #[test]
    fn test_arraylength_loads_length_implicitly_checked() {
        let code = generate(Bytecode::Arraylength).into_code();
        // MOV EAX, [EAX+8] = 8B 40 08
        assert_eq!(&code[..3], &[0x8B, 0x40, 0x08]);
    }

    #[test]
    fn test_athrow_checks_null_and_jumps_to_throw_entry() {
        let code = generate(Bytecode::Athrow).into_code();
        // CMP EAX, [EAX] = 3B 00
        assert_eq!(&code[..3], &[0x3B, 0x00, 0xE9]);
        assert!(jumps_to(Bytecode::Athrow, shared().throw_exception));
    }

    #[test]
    fn test_checkcast_quickens_and_throws() {
        assert!(calls(Bytecode::Checkcast, RuntimeEntry::QuickenIoCc));
        assert!(jumps_to(Bytecode::Checkcast, shared().throw_class_cast));
        assert!(calls(Bytecode::Instanceof, RuntimeEntry::QuickenIoCc));
        // MOV EAX, 1
        let code = generate(Bytecode::Instanceof).into_code();
        assert!(contains(&code, &[0xB8, 0x01, 0x00, 0x00, 0x00]));
    }

    #[test]
    fn test_monitorenter_scans_for_free_slot() {
        let code = generate(Bytecode::Monitorenter).into_code();
        // CMP [ECX+4], 0 ; CMOVE EDX, ECX = 83 79 04 00 0F 44 D1
        assert!(contains(&code, &[0x83, 0x79, 0x04, 0x00, 0x0F, 0x44, 0xD1]));
        // INC ESI
        assert!(contains(&code, &[0x46]));
        assert!(calls(Bytecode::Monitorenter, RuntimeEntry::Monitorenter));
    }

    #[test]
    fn test_monitorexit_throws_when_not_owned() {
        assert!(calls(
            Bytecode::Monitorexit,
            RuntimeEntry::ThrowIllegalMonitorStateException
        ));
        assert!(calls(Bytecode::Monitorexit, RuntimeEntry::Monitorexit));
    }

    #[test]
    fn test_multianewarray_passes_first_dimension() {
        let code = generate(Bytecode::Multianewarray).into_code();
        // LEA EAX, [ESP+EAX*4-4] = 8D 44 84 FC
        assert!(contains(&code, &[0x8D, 0x44, 0x84, 0xFC]));
        assert!(calls(Bytecode::Multianewarray, RuntimeEntry::Multianewarray));
    }

    #[test]
    fn test_array_allocation_goes_to_runtime() {
        assert!(calls(Bytecode::Newarray, RuntimeEntry::Newarray));
        assert!(calls(Bytecode::Anewarray, RuntimeEntry::Anewarray));
    }
}
