//! Constants, local variable and array loads and stores, operand stack
//! manipulation.

use super::{index_check, index_check_without_pop, patch_bytecode, sideband, Masm};
use crate::asm::{Address, Cond, Reg, Scale};
use crate::error::VmResult;
use crate::interpreter::masm::InterpreterMacroAssembler as Imasm;
use crate::interpreter::template::TemplateArg;
use crate::runtime::basic_type::{BasicType, TosState};
use crate::runtime::bytecodes::Bytecode;
use crate::runtime::entries::RuntimeEntry;
use crate::runtime::layout::{
    array_base_offset, constant_pool, klass, type_array_layout_helper, WORD_SIZE,
};

fn element(array: Reg, index: Reg, ty: BasicType) -> Address {
    let scale = Scale::from_log2(ty.element_size_log2());
    Address::indexed(array, index, scale, array_base_offset(ty))
}

fn at_tos(slot: i32) -> Address {
    Imasm::expr_address(slot)
}

// ==================== Constants ====================

pub(crate) fn nop(_m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    Ok(())
}

pub(crate) fn aconst_null(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.xor_rr(Reg::Eax, Reg::Eax);
    Ok(())
}

pub(crate) fn iconst(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    match arg.int() {
        0 => m.xor_rr(Reg::Eax, Reg::Eax),
        v => m.mov_ri(Reg::Eax, v),
    }
    Ok(())
}

pub(crate) fn lconst(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    match arg.int() {
        0 => m.xor_rr(Reg::Eax, Reg::Eax),
        v => m.mov_ri(Reg::Eax, v),
    }
    m.xor_rr(Reg::Edx, Reg::Edx);
    Ok(())
}

pub(crate) fn fconst(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    match arg.int() {
        0 => m.fldz(),
        1 => m.fld1(),
        _ => {
            m.fld1();
            m.fld1();
            m.faddp(1);
        }
    }
    Ok(())
}

pub(crate) fn dconst(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    match arg.int() {
        0 => m.fldz(),
        _ => m.fld1(),
    }
    Ok(())
}

pub(crate) fn bipush(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let at = m.at_bcp(1);
    m.movsxb_rm(Reg::Eax, at);
    Ok(())
}

pub(crate) fn sipush(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let at = m.at_bcp(1);
    m.movzxw_rm(Reg::Eax, at);
    m.bswap(Reg::Eax);
    m.sar_ri(Reg::Eax, 16);
    Ok(())
}

/// `ldc`/`ldc_w` of an int, float or class constant. Strings were linked
/// to `fast_aldc`.
pub(crate) fn ldc(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    let wide = arg.flag();
    let call_ldc = m.new_label();
    let not_class = m.new_label();
    let not_float = m.new_label();
    let done = m.new_label();

    if wide {
        m.get_unsigned_2_byte_index_at_bcp(Reg::Ebx, 1);
    } else {
        let at = m.at_bcp(1);
        m.movzxb_rm(Reg::Ebx, at);
    }
    m.get_cpool_and_tags(Reg::Ecx, Reg::Eax);
    m.movzxb_rm(Reg::Edx, Address::indexed(Reg::Eax, Reg::Ebx, Scale::Times1, 0));

    m.cmp_ri(Reg::Edx, constant_pool::TAG_UNRESOLVED_CLASS as i32);
    m.jcc(Cond::E, call_ldc);
    m.cmp_ri(Reg::Edx, constant_pool::TAG_CLASS as i32);
    m.jcc(Cond::Ne, not_class);

    m.bind(call_ldc);
    m.call_vm_imm(Some(Reg::Eax), RuntimeEntry::Ldc, Reg::Ecx, wide as i32);
    m.push_tos(TosState::Atos);
    m.jmp(done);

    let slot = Address::indexed(Reg::Ecx, Reg::Ebx, Scale::Times4, constant_pool::BASE_OFFSET);
    m.bind(not_class);
    m.cmp_ri(Reg::Edx, constant_pool::TAG_FLOAT as i32);
    m.jcc(Cond::Ne, not_float);
    m.fld_s(slot);
    m.push_tos(TosState::Ftos);
    m.jmp(done);

    m.bind(not_float);
    m.mov_rm(Reg::Eax, slot);
    m.push_tos(TosState::Itos);
    m.bind(done);
    Ok(())
}

/// Reference constant cached in the resolved references; resolved by the
/// runtime the first time.
pub(crate) fn fast_aldc(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    let resolved = m.new_label();
    let index = Reg::Edx;
    let at = m.at_bcp(1);
    if arg.flag() {
        m.movzxw_rm(index, at);
    } else {
        m.movzxb_rm(index, at);
    }
    m.get_constant_pool(Reg::Eax);
    m.mov_rm(Reg::Eax, Address::new(Reg::Eax, constant_pool::RESOLVED_REFERENCES_OFFSET));
    m.mov_rm(Reg::Eax, element(Reg::Eax, index, BasicType::Object));
    m.test_rr(Reg::Eax, Reg::Eax);
    m.jcc(Cond::Ne, resolved);
    let bc = m.bytecode();
    m.call_vm_imm(Some(Reg::Eax), RuntimeEntry::ResolveLdc, index, bc.code() as i32);
    m.bind(resolved);
    m.verify_oop(Reg::Eax);
    Ok(())
}

pub(crate) fn ldc2_w(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let long = m.new_label();
    let done = m.new_label();
    m.get_unsigned_2_byte_index_at_bcp(Reg::Ebx, 1);
    m.get_cpool_and_tags(Reg::Ecx, Reg::Eax);
    m.cmpb_mi(
        Address::indexed(Reg::Eax, Reg::Ebx, Scale::Times1, 0),
        constant_pool::TAG_DOUBLE,
    );
    m.jcc(Cond::Ne, long);
    m.fld_d(Address::indexed(Reg::Ecx, Reg::Ebx, Scale::Times4, constant_pool::BASE_OFFSET));
    m.push_tos(TosState::Dtos);
    m.jmp(done);

    m.bind(long);
    m.mov_rm(Reg::Eax, Address::indexed(Reg::Ecx, Reg::Ebx, Scale::Times4, constant_pool::BASE_OFFSET));
    m.mov_rm(
        Reg::Edx,
        Address::indexed(Reg::Ecx, Reg::Ebx, Scale::Times4, constant_pool::BASE_OFFSET + WORD_SIZE),
    );
    m.push_tos(TosState::Ltos);
    m.bind(done);
    Ok(())
}

// ==================== Local loads ====================

/// Pick the pair form for an `iload` followed by `iload` or `caload`.
/// Only the last of a run of `iload`s is fused, so a waiting `iload`
/// keeps its slot until its successor has been rewritten.
pub(crate) fn iload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    if m.config().rewrite_frequent_pairs {
        let rewrite = m.new_label();
        let done = m.new_label();
        let next = sideband(m, Bytecode::Iload.length() as i32);
        m.movzxb_rm(Reg::Ebx, next);
        m.cmp_ri(Reg::Ebx, Bytecode::Iload.code() as i32);
        m.jcc(Cond::E, done);

        m.cmp_ri(Reg::Ebx, Bytecode::FastIload.code() as i32);
        m.mov_ri(Reg::Ecx, Bytecode::FastIload2.code() as i32);
        m.jcc(Cond::E, rewrite);

        m.cmp_ri(Reg::Ebx, Bytecode::Caload.code() as i32);
        m.mov_ri(Reg::Ecx, Bytecode::FastIcaload.code() as i32);
        m.jcc(Cond::E, rewrite);

        m.mov_ri(Reg::Ecx, Bytecode::FastIload.code() as i32);
        m.bind(rewrite);
        patch_bytecode(m, None, Reg::Ecx, Reg::Ebx, None);
        m.bind(done);
    }
    m.locals_index(Reg::Ebx, 1);
    m.mov_rm(Reg::Eax, Imasm::iaddress_r(Reg::Ebx));
    Ok(())
}

pub(crate) fn fast_iload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index(Reg::Ebx, 1);
    m.mov_rm(Reg::Eax, Imasm::iaddress_r(Reg::Ebx));
    Ok(())
}

pub(crate) fn fast_iload2(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index(Reg::Ebx, 1);
    m.mov_rm(Reg::Eax, Imasm::iaddress_r(Reg::Ebx));
    m.push_tos(TosState::Itos);
    m.locals_index(Reg::Ebx, 3);
    m.mov_rm(Reg::Eax, Imasm::iaddress_r(Reg::Ebx));
    Ok(())
}

pub(crate) fn lload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index(Reg::Ebx, 1);
    m.mov_rm(Reg::Eax, Imasm::laddress_r(Reg::Ebx));
    m.mov_rm(Reg::Edx, Imasm::haddress_r(Reg::Ebx));
    Ok(())
}

pub(crate) fn fload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index(Reg::Ebx, 1);
    m.fld_s(Imasm::iaddress_r(Reg::Ebx));
    Ok(())
}

pub(crate) fn dload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index(Reg::Ebx, 1);
    m.fld_d(Imasm::laddress_r(Reg::Ebx));
    Ok(())
}

pub(crate) fn aload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index(Reg::Ebx, 1);
    m.mov_rm(Reg::Eax, Imasm::iaddress_r(Reg::Ebx));
    Ok(())
}

pub(crate) fn iload_n(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    m.mov_rm(Reg::Eax, Imasm::iaddress(arg.int()));
    Ok(())
}

pub(crate) fn lload_n(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    let n = arg.int();
    m.mov_rm(Reg::Eax, Imasm::laddress(n));
    m.mov_rm(Reg::Edx, Imasm::haddress(n));
    Ok(())
}

pub(crate) fn fload_n(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    m.fld_s(Imasm::iaddress(arg.int()));
    Ok(())
}

pub(crate) fn dload_n(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    m.fld_d(Imasm::laddress(arg.int()));
    Ok(())
}

pub(crate) fn aload_n(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    m.mov_rm(Reg::Eax, Imasm::iaddress(arg.int()));
    Ok(())
}

/// `aload_0` fuses with a following quickened `getfield`; an unquickened
/// `getfield` postpones the decision.
pub(crate) fn aload_0(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    if m.config().rewrite_frequent_pairs {
        let rewrite = m.new_label();
        let done = m.new_label();
        let next = sideband(m, Bytecode::Aload0.length() as i32);
        m.movzxb_rm(Reg::Ebx, next);
        m.cmp_ri(Reg::Ebx, Bytecode::Getfield.code() as i32);
        m.jcc(Cond::E, done);

        for (getter, pair) in [
            (Bytecode::FastIgetfield, Bytecode::FastIaccess0),
            (Bytecode::FastAgetfield, Bytecode::FastAaccess0),
            (Bytecode::FastFgetfield, Bytecode::FastFaccess0),
        ] {
            m.cmp_ri(Reg::Ebx, getter.code() as i32);
            m.mov_ri(Reg::Ecx, pair.code() as i32);
            m.jcc(Cond::E, rewrite);
        }
        m.mov_ri(Reg::Ecx, Bytecode::FastAload0.code() as i32);
        m.bind(rewrite);
        patch_bytecode(m, None, Reg::Ecx, Reg::Ebx, None);
        m.bind(done);
    }
    m.mov_rm(Reg::Eax, Imasm::iaddress(0));
    Ok(())
}

pub(crate) fn wide_iload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index_wide(Reg::Ebx);
    m.mov_rm(Reg::Eax, Imasm::iaddress_r(Reg::Ebx));
    Ok(())
}

pub(crate) fn wide_lload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index_wide(Reg::Ebx);
    m.mov_rm(Reg::Eax, Imasm::laddress_r(Reg::Ebx));
    m.mov_rm(Reg::Edx, Imasm::haddress_r(Reg::Ebx));
    Ok(())
}

pub(crate) fn wide_fload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index_wide(Reg::Ebx);
    m.fld_s(Imasm::iaddress_r(Reg::Ebx));
    Ok(())
}

pub(crate) fn wide_dload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index_wide(Reg::Ebx);
    m.fld_d(Imasm::laddress_r(Reg::Ebx));
    Ok(())
}

pub(crate) fn wide_aload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index_wide(Reg::Ebx);
    m.mov_rm(Reg::Eax, Imasm::iaddress_r(Reg::Ebx));
    Ok(())
}

// ==================== Array loads ====================
//
// On entry EAX holds the index and the array is on the stack.

pub(crate) fn iaload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    index_check(m, Reg::Edx, Reg::Eax);
    m.mov_rm(Reg::Eax, element(Reg::Edx, Reg::Eax, BasicType::Int));
    Ok(())
}

pub(crate) fn laload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    index_check(m, Reg::Edx, Reg::Eax);
    let low = element(Reg::Edx, Reg::Ebx, BasicType::Long);
    m.mov_rm(Reg::Eax, low);
    m.mov_rm(Reg::Edx, low.plus_disp(WORD_SIZE));
    Ok(())
}

pub(crate) fn faload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    index_check(m, Reg::Edx, Reg::Eax);
    m.fld_s(element(Reg::Edx, Reg::Eax, BasicType::Float));
    Ok(())
}

pub(crate) fn daload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    index_check(m, Reg::Edx, Reg::Eax);
    m.fld_d(element(Reg::Edx, Reg::Eax, BasicType::Double));
    Ok(())
}

pub(crate) fn aaload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    index_check(m, Reg::Edx, Reg::Eax);
    m.mov_rm(Reg::Eax, element(Reg::Edx, Reg::Eax, BasicType::Object));
    Ok(())
}

pub(crate) fn baload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    index_check(m, Reg::Edx, Reg::Eax);
    m.movsxb_rm(Reg::Eax, element(Reg::Edx, Reg::Eax, BasicType::Byte));
    Ok(())
}

pub(crate) fn caload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    index_check(m, Reg::Edx, Reg::Eax);
    m.movzxw_rm(Reg::Eax, element(Reg::Edx, Reg::Eax, BasicType::Char));
    Ok(())
}

pub(crate) fn saload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    index_check(m, Reg::Edx, Reg::Eax);
    m.movsxw_rm(Reg::Eax, element(Reg::Edx, Reg::Eax, BasicType::Short));
    Ok(())
}

/// `iload` + `caload`: the index comes from a local.
pub(crate) fn fast_icaload(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index(Reg::Ebx, 1);
    m.mov_rm(Reg::Eax, Imasm::iaddress_r(Reg::Ebx));
    index_check(m, Reg::Edx, Reg::Eax);
    m.movzxw_rm(Reg::Eax, element(Reg::Edx, Reg::Eax, BasicType::Char));
    Ok(())
}

// ==================== Local stores ====================

pub(crate) fn istore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index(Reg::Ebx, 1);
    m.mov_mr(Imasm::iaddress_r(Reg::Ebx), Reg::Eax);
    Ok(())
}

pub(crate) fn lstore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index(Reg::Ebx, 1);
    m.mov_mr(Imasm::laddress_r(Reg::Ebx), Reg::Eax);
    m.mov_mr(Imasm::haddress_r(Reg::Ebx), Reg::Edx);
    Ok(())
}

pub(crate) fn fstore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index(Reg::Ebx, 1);
    m.fstp_s(Imasm::iaddress_r(Reg::Ebx));
    Ok(())
}

pub(crate) fn dstore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.locals_index(Reg::Ebx, 1);
    m.fstp_d(Imasm::laddress_r(Reg::Ebx));
    Ok(())
}

/// Also stores return addresses, so it is entered in vtos.
pub(crate) fn astore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.pop_ptr(Reg::Eax);
    m.locals_index(Reg::Ebx, 1);
    m.mov_mr(Imasm::iaddress_r(Reg::Ebx), Reg::Eax);
    Ok(())
}

pub(crate) fn istore_n(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    m.mov_mr(Imasm::iaddress(arg.int()), Reg::Eax);
    Ok(())
}

pub(crate) fn lstore_n(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    let n = arg.int();
    m.mov_mr(Imasm::laddress(n), Reg::Eax);
    m.mov_mr(Imasm::haddress(n), Reg::Edx);
    Ok(())
}

pub(crate) fn fstore_n(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    m.fstp_s(Imasm::iaddress(arg.int()));
    Ok(())
}

pub(crate) fn dstore_n(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    m.fstp_d(Imasm::laddress(arg.int()));
    Ok(())
}

pub(crate) fn astore_n(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    m.pop_ptr(Reg::Eax);
    m.mov_mr(Imasm::iaddress(arg.int()), Reg::Eax);
    Ok(())
}

pub(crate) fn wide_istore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.pop_int(Reg::Eax);
    m.locals_index_wide(Reg::Ebx);
    m.mov_mr(Imasm::iaddress_r(Reg::Ebx), Reg::Eax);
    Ok(())
}

pub(crate) fn wide_lstore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.pop_long();
    m.locals_index_wide(Reg::Ebx);
    m.mov_mr(Imasm::laddress_r(Reg::Ebx), Reg::Eax);
    m.mov_mr(Imasm::haddress_r(Reg::Ebx), Reg::Edx);
    Ok(())
}

/// Floats move as raw words.
pub(crate) fn wide_fstore(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    wide_istore(m, arg)
}

pub(crate) fn wide_dstore(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    wide_lstore(m, arg)
}

pub(crate) fn wide_astore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.pop_ptr(Reg::Eax);
    m.locals_index_wide(Reg::Ebx);
    m.mov_mr(Imasm::iaddress_r(Reg::Ebx), Reg::Eax);
    Ok(())
}

pub(crate) fn iinc(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let constant = m.at_bcp(2);
    m.movsxb_rm(Reg::Edx, constant);
    m.locals_index(Reg::Ebx, 1);
    m.add_mr(Imasm::iaddress_r(Reg::Ebx), Reg::Edx);
    Ok(())
}

pub(crate) fn wide_iinc(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let constant = m.at_bcp(4);
    m.mov_rm(Reg::Edx, constant);
    m.locals_index_wide(Reg::Ebx);
    // big-endian i16 in the high half after the swap
    m.bswap(Reg::Edx);
    m.sar_ri(Reg::Edx, 16);
    m.add_mr(Imasm::iaddress_r(Reg::Ebx), Reg::Edx);
    Ok(())
}

// ==================== Array stores ====================
//
// The value is in the TOS register(s); index and array are on the stack.

pub(crate) fn iastore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.pop_int(Reg::Ebx);
    index_check(m, Reg::Edx, Reg::Ebx);
    m.mov_mr(element(Reg::Edx, Reg::Ebx, BasicType::Int), Reg::Eax);
    Ok(())
}

pub(crate) fn lastore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.pop_int(Reg::Ebx);
    index_check(m, Reg::Ecx, Reg::Ebx);
    let low = element(Reg::Ecx, Reg::Ebx, BasicType::Long);
    m.mov_mr(low, Reg::Eax);
    m.mov_mr(low.plus_disp(WORD_SIZE), Reg::Edx);
    Ok(())
}

pub(crate) fn fastore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.pop_int(Reg::Ebx);
    index_check(m, Reg::Edx, Reg::Ebx);
    m.fstp_s(element(Reg::Edx, Reg::Ebx, BasicType::Float));
    Ok(())
}

pub(crate) fn dastore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.pop_int(Reg::Ebx);
    index_check(m, Reg::Edx, Reg::Ebx);
    m.fstp_d(element(Reg::Edx, Reg::Ebx, BasicType::Double));
    Ok(())
}

/// Reference store with the array-store check and GC barriers. Entered
/// in vtos: array, index and value all stay on the stack until the end.
pub(crate) fn aastore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let is_null = m.new_label();
    let ok_is_subtype = m.new_label();
    let done = m.new_label();

    m.mov_rm(Reg::Eax, at_tos(0));
    m.mov_rm(Reg::Ecx, at_tos(1));
    m.mov_rm(Reg::Edx, at_tos(2));
    let slot = element(Reg::Edx, Reg::Ecx, BasicType::Object);
    index_check_without_pop(m, Reg::Edx, Reg::Ecx);
    m.test_rr(Reg::Eax, Reg::Eax);
    m.jcc(Cond::E, is_null);

    // subklass in EBX, element klass of the array in EAX
    m.load_klass(Reg::Ebx, Reg::Eax);
    m.load_klass(Reg::Eax, Reg::Edx);
    m.mov_rm(Reg::Eax, Address::new(Reg::Eax, klass::ELEMENT_KLASS_OFFSET));
    m.lea(Reg::Edx, slot);
    m.gen_subtype_check(Reg::Ebx, ok_is_subtype);

    // value still at TOS for the throw entry
    let ase = m.shared().throw_array_store;
    m.jmp_abs(ase);

    m.bind(ok_is_subtype);
    m.mov_rm(Reg::Eax, at_tos(0));
    m.store_heap_oop(Address::new(Reg::Edx, 0), Some(Reg::Eax));
    m.jmp(done);

    m.bind(is_null);
    m.profile_null_seen(Reg::Ebx);
    m.store_heap_oop(slot, None);

    m.bind(done);
    m.restore_locals();
    m.add_ri(Reg::Esp, 3 * WORD_SIZE);
    Ok(())
}

/// Shared by byte and boolean arrays; booleans are masked to 0 or 1.
pub(crate) fn bastore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let skip = m.new_label();
    m.pop_int(Reg::Ebx);
    index_check(m, Reg::Edx, Reg::Ebx);
    m.load_klass(Reg::Ecx, Reg::Edx);
    m.mov_rm(Reg::Ecx, Address::new(Reg::Ecx, klass::LAYOUT_HELPER_OFFSET));
    let diffbit =
        type_array_layout_helper(BasicType::Boolean) ^ type_array_layout_helper(BasicType::Byte);
    m.test_ri(Reg::Ecx, diffbit);
    m.jcc(Cond::E, skip);
    m.and_ri(Reg::Eax, 1);
    m.bind(skip);
    m.movb_mr(element(Reg::Edx, Reg::Ebx, BasicType::Byte), Reg::Eax);
    Ok(())
}

/// Also used for `sastore`.
pub(crate) fn castore(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.pop_int(Reg::Ebx);
    index_check(m, Reg::Edx, Reg::Ebx);
    m.movw_mr(element(Reg::Edx, Reg::Ebx, BasicType::Char), Reg::Eax);
    Ok(())
}

// ==================== Stack ====================

pub(crate) fn pop(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.add_ri(Reg::Esp, WORD_SIZE);
    Ok(())
}

pub(crate) fn pop2(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.add_ri(Reg::Esp, 2 * WORD_SIZE);
    Ok(())
}

fn load(m: Masm<'_, '_>, slot: i32, reg: Reg) {
    m.mov_rm(reg, at_tos(slot));
}

fn store(m: Masm<'_, '_>, slot: i32, reg: Reg) {
    m.mov_mr(at_tos(slot), reg);
}

pub(crate) fn dup(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    load(m, 0, Reg::Eax);
    m.push_ptr(Reg::Eax);
    Ok(())
}

pub(crate) fn dup_x1(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    // ..., a, b -> ..., b, a, b
    load(m, 0, Reg::Eax);
    load(m, 1, Reg::Ecx);
    store(m, 1, Reg::Eax);
    store(m, 0, Reg::Ecx);
    m.push_ptr(Reg::Eax);
    Ok(())
}

pub(crate) fn dup_x2(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    // ..., a, b, c -> ..., c, a, b, c
    load(m, 0, Reg::Eax);
    load(m, 2, Reg::Ecx);
    store(m, 2, Reg::Eax);
    m.push_ptr(Reg::Eax);
    // ..., c, b, c, c
    load(m, 2, Reg::Eax);
    store(m, 2, Reg::Ecx);
    store(m, 1, Reg::Eax);
    Ok(())
}

pub(crate) fn dup2(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    // ..., a, b -> ..., a, b, a, b
    load(m, 1, Reg::Eax);
    m.push_ptr(Reg::Eax);
    load(m, 1, Reg::Eax);
    m.push_ptr(Reg::Eax);
    Ok(())
}

pub(crate) fn dup2_x1(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    // ..., a, b, c -> ..., b, c, a, b, c
    load(m, 0, Reg::Ecx);
    load(m, 1, Reg::Eax);
    m.push_ptr(Reg::Eax);
    m.push_ptr(Reg::Ecx);
    // ..., a, b, c, b, c
    store(m, 3, Reg::Ecx);
    load(m, 4, Reg::Ecx);
    store(m, 2, Reg::Ecx);
    store(m, 4, Reg::Eax);
    Ok(())
}

pub(crate) fn dup2_x2(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    // ..., a, b, c, d -> ..., c, d, a, b, c, d
    load(m, 0, Reg::Ecx);
    load(m, 1, Reg::Eax);
    m.push_ptr(Reg::Eax);
    m.push_ptr(Reg::Ecx);
    // ..., a, b, c, d, c, d
    load(m, 4, Reg::Eax);
    store(m, 2, Reg::Eax);
    store(m, 4, Reg::Ecx);
    // ..., a, d, c, b, c, d
    load(m, 5, Reg::Ecx);
    load(m, 3, Reg::Eax);
    store(m, 3, Reg::Ecx);
    store(m, 5, Reg::Eax);
    Ok(())
}

pub(crate) fn swap(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    load(m, 1, Reg::Ecx);
    load(m, 0, Reg::Eax);
    store(m, 0, Reg::Ecx);
    store(m, 1, Reg::Eax);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::bytecodes::Bytecode;

    #[test]
    fn test_iconst_and_bipush() {
        let code = generate(Bytecode::Iconst3).into_code();
        // MOV EAX, 3 = B8 03 00 00 00
        assert_eq!(&code[..5], &[0xB8, 0x03, 0x00, 0x00, 0x00]);
        let code = generate(Bytecode::Iconst0).into_code();
        // XOR EAX, EAX = 31 C0
        assert_eq!(&code[..2], &[0x31, 0xC0]);
        let code = generate(Bytecode::Bipush).into_code();
        // MOVSX EAX, byte [ESI+1] = 0F BE 46 01
        assert_eq!(&code[..4], &[0x0F, 0xBE, 0x46, 0x01]);
    }

    #[test]
    fn test_sipush_swaps_operand() {
        let code = generate(Bytecode::Sipush).into_code();
        // MOVZX EAX, word [ESI+1] = 0F B7 46 01 ; BSWAP EAX = 0F C8 ; SAR EAX, 16 = C1 F8 10
        assert_eq!(&code[..9], &[0x0F, 0xB7, 0x46, 0x01, 0x0F, 0xC8, 0xC1, 0xF8, 0x10]);
    }

    #[test]
    fn test_iload_n_addresses_locals_downward() {
        let code = generate(Bytecode::Iload2).into_code();
        // MOV EAX, [EDI-8] = 8B 47 F8
        assert_eq!(&code[..3], &[0x8B, 0x47, 0xF8]);
        let code = generate(Bytecode::Lload0).into_code();
        // MOV EAX, [EDI-4] = 8B 47 FC ; MOV EDX, [EDI] = 8B 17
        assert_eq!(&code[..5], &[0x8B, 0x47, 0xFC, 0x8B, 0x17]);
    }

    #[test]
    fn test_iload_rewrite_depends_on_pairs_flag() {
        let with_pairs = generate(Bytecode::Iload).into_code();
        let config = RuntimeConfig {
            rewrite_frequent_pairs: false,
            ..RuntimeConfig::default()
        };
        let without = generate_with(&config, Bytecode::Iload, false).unwrap().into_code();
        // MOVZX EBX, byte [ESI+1] = 0F B6 5E 01
        assert_eq!(&without[..4], &[0x0F, 0xB6, 0x5E, 0x01]);
        assert!(with_pairs.len() > without.len());
        // CMP EBX, caload = 83 FB 34
        assert!(contains(&with_pairs, &[0x83, 0xFB, 0x34]));
    }

    #[test]
    fn test_fp_templates_keep_fpu_balanced() {
        for bc in [
            Bytecode::Fconst2,
            Bytecode::Dload,
            Bytecode::Faload,
            Bytecode::Dstore,
            Bytecode::Dastore,
            Bytecode::Ldc,
            Bytecode::Ldc2W,
        ] {
            assert!(generate_with(&RuntimeConfig::default(), bc, false).is_ok(), "{bc}");
        }
        assert!(generate_with(&RuntimeConfig::default(), Bytecode::Dload, true).is_ok());
    }

    #[test]
    fn test_wide_iinc_sign_extends_big_endian_constant() {
        let code = generate_with(&RuntimeConfig::default(), Bytecode::Iinc, true)
            .unwrap()
            .into_code();
        // MOV EDX, [ESI+4] = 8B 56 04
        assert_eq!(&code[..3], &[0x8B, 0x56, 0x04]);
        // BSWAP EDX = 0F CA ; SAR EDX, 16 = C1 FA 10
        assert!(contains(&code, &[0x0F, 0xCA, 0xC1, 0xFA, 0x10]));
        // ADD [EDI + EBX*4], EDX = 01 14 9F
        assert!(contains(&code, &[0x01, 0x14, 0x9F]));
    }

    #[test]
    fn test_swap_exchanges_top_words() {
        let code = generate(Bytecode::Swap).into_code();
        // MOV ECX, [ESP+4] = 8B 4C 24 04 ; MOV EAX, [ESP] = 8B 04 24
        assert_eq!(&code[..7], &[0x8B, 0x4C, 0x24, 0x04, 0x8B, 0x04, 0x24]);
        // MOV [ESP], ECX = 89 0C 24 ; MOV [ESP+4], EAX = 89 44 24 04
        assert_eq!(&code[7..14], &[0x89, 0x0C, 0x24, 0x89, 0x44, 0x24, 0x04]);
    }
}
