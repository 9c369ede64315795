//! Field access: the resolving `get`/`put` templates and their quickened
//! forms.
//!
//! A resolved entry carries the field offset in f2, the holder klass in
//! f1 and the field's TOS state and volatility in its flags. The slow
//! templates switch on the TOS state at run time and rewrite themselves
//! to the typed fast form; static accesses are never rewritten.

use super::{patch_bytecode, resolve_cache_and_index, Masm};
use crate::asm::macro_asm::Membar;
use crate::asm::{Address, Cond, Reg, Scale};
use crate::error::{VmError, VmResult};
use crate::interpreter::masm::{IndexSize, InterpreterMacroAssembler as Imasm, BCP};
use crate::interpreter::template::TemplateArg;
use crate::runtime::basic_type::TosState;
use crate::runtime::bytecodes::Bytecode;
use crate::runtime::cpcache::flags;
use crate::runtime::layout::{cp_cache, klass, WORD_SIZE};

/// Field states in the order the slow templates test them.
const FIELD_STATES: [TosState; 9] = [
    TosState::Atos,
    TosState::Itos,
    TosState::Btos,
    TosState::Ztos,
    TosState::Ctos,
    TosState::Stos,
    TosState::Ltos,
    TosState::Ftos,
    TosState::Dtos,
];

const VOLATILE_BIT: i32 = 1 << flags::IS_VOLATILE_SHIFT;

fn fast_get(state: TosState) -> Bytecode {
    match state {
        TosState::Btos | TosState::Ztos => Bytecode::FastBgetfield,
        TosState::Ctos => Bytecode::FastCgetfield,
        TosState::Stos => Bytecode::FastSgetfield,
        TosState::Itos => Bytecode::FastIgetfield,
        TosState::Ltos => Bytecode::FastLgetfield,
        TosState::Ftos => Bytecode::FastFgetfield,
        TosState::Dtos => Bytecode::FastDgetfield,
        TosState::Atos | TosState::Vtos => Bytecode::FastAgetfield,
    }
}

fn fast_put(state: TosState) -> Bytecode {
    match state {
        TosState::Btos => Bytecode::FastBputfield,
        TosState::Ztos => Bytecode::FastZputfield,
        TosState::Ctos => Bytecode::FastCputfield,
        TosState::Stos => Bytecode::FastSputfield,
        TosState::Itos => Bytecode::FastIputfield,
        TosState::Ltos => Bytecode::FastLputfield,
        TosState::Ftos => Bytecode::FastFputfield,
        TosState::Dtos => Bytecode::FastDputfield,
        TosState::Atos | TosState::Vtos => Bytecode::FastAputfield,
    }
}

fn field(obj: Reg, off: Reg, word: i32) -> Address {
    Address::indexed(obj, off, Scale::Times1, word * WORD_SIZE)
}

/// EBX = field offset, EAX = flags; for statics ECX = holder mirror.
/// Expects the cache in ECX and the scaled index in EDX.
fn load_field_entry(m: Masm<'_, '_>, is_static: bool) {
    m.mov_rm(Reg::Ebx, Imasm::cache_entry(Reg::Ecx, Reg::Edx, cp_cache::F2_OFFSET));
    m.mov_rm(Reg::Eax, Imasm::cache_entry(Reg::Ecx, Reg::Edx, cp_cache::FLAGS_OFFSET));
    if is_static {
        m.mov_rm(Reg::Ecx, Imasm::cache_entry(Reg::Ecx, Reg::Edx, cp_cache::F1_OFFSET));
        m.mov_rm(Reg::Ecx, Address::new(Reg::Ecx, klass::JAVA_MIRROR_OFFSET));
    }
}

fn pop_and_check_object(m: Masm<'_, '_>, reg: Reg) {
    m.pop_ptr(reg);
    m.null_check(reg, None);
    m.verify_oop(reg);
}

/// EAX = (flags >> tos shift) & mask.
fn extract_tos_state(m: Masm<'_, '_>) {
    m.shr_ri(Reg::Eax, flags::TOS_STATE_SHIFT as u8);
    m.and_ri(Reg::Eax, flags::TOS_STATE_MASK as i32);
}

/// Load a long atomically through the FPU and leave it on the stack.
fn push_long_atomic(m: Masm<'_, '_>, lo: Address) {
    m.fild_d(lo);
    m.sub_ri(Reg::Esp, 2 * WORD_SIZE);
    m.fistp_d(Address::new(Reg::Esp, 0));
}

/// Store EDX:EAX atomically through the FPU.
fn store_long_atomic(m: Masm<'_, '_>, lo: Address) {
    m.push_r(Reg::Edx);
    m.push_r(Reg::Eax);
    m.fild_d(Address::new(Reg::Esp, 0));
    m.fistp_d(lo);
    m.add_ri(Reg::Esp, 2 * WORD_SIZE);
}

/// Store the TOS value of `state` into the field at `obj + off`.
fn store_field(m: Masm<'_, '_>, state: TosState, obj: Reg, off: Reg) -> VmResult<()> {
    let lo = field(obj, off, 0);
    match state {
        TosState::Btos => m.movb_mr(lo, Reg::Eax),
        TosState::Ztos => {
            m.and_ri(Reg::Eax, 1);
            m.movb_mr(lo, Reg::Eax);
        }
        TosState::Ctos | TosState::Stos => m.movw_mr(lo, Reg::Eax),
        TosState::Itos => m.mov_mr(lo, Reg::Eax),
        TosState::Ltos => {
            m.mov_mr(field(obj, off, 1), Reg::Edx);
            m.mov_mr(lo, Reg::Eax);
        }
        TosState::Ftos => m.fstp_s(lo),
        TosState::Dtos => m.fstp_d(lo),
        TosState::Atos => {
            m.store_heap_oop(lo, Some(Reg::Eax));
            // G1 barriers borrow EDI for the thread
            m.restore_locals();
        }
        TosState::Vtos => {
            return Err(VmError::Template(format!("{}: store of vtos", m.bytecode())));
        }
    }
    Ok(())
}

/// StoreLoad fence after a store to a volatile field. The flags are
/// reloaded because the store sequences clobber every scratch register.
fn volatile_store_barrier(m: Masm<'_, '_>) {
    if !m.ctx().is_mp {
        return;
    }
    let not_volatile = m.new_label();
    m.get_cache_and_index_at_bcp(Reg::Ecx, Reg::Edx, 1, IndexSize::U2);
    m.test_mi(
        Imasm::cache_entry(Reg::Ecx, Reg::Edx, cp_cache::FLAGS_OFFSET),
        VOLATILE_BIT,
    );
    m.jcc(Cond::E, not_volatile);
    m.membar(Membar::StoreLoad);
    m.bind(not_volatile);
}

fn getfield_or_static(m: Masm<'_, '_>, byte_no: u32, is_static: bool) -> VmResult<()> {
    resolve_cache_and_index(m, byte_no, Reg::Ecx, Reg::Edx, IndexSize::U2);
    load_field_entry(m, is_static);
    if !is_static {
        pop_and_check_object(m, Reg::Ecx);
    }
    extract_tos_state(m);

    let done = m.new_label();
    let lo = field(Reg::Ecx, Reg::Ebx, 0);
    for (i, &state) in FIELD_STATES.iter().enumerate() {
        let last = i == FIELD_STATES.len() - 1;
        let next = m.new_label();
        if !last {
            m.cmp_ri(Reg::Eax, state.index() as i32);
            m.jcc(Cond::Ne, next);
        }
        match state {
            TosState::Btos | TosState::Ztos => m.movsxb_rm(Reg::Eax, lo),
            TosState::Ctos => m.movzxw_rm(Reg::Eax, lo),
            TosState::Stos => m.movsxw_rm(Reg::Eax, lo),
            TosState::Itos | TosState::Atos => m.mov_rm(Reg::Eax, lo),
            TosState::Ltos => push_long_atomic(m, lo),
            TosState::Ftos => m.fld_s(lo),
            TosState::Dtos => m.fld_d(lo),
            TosState::Vtos => {}
        }
        if state != TosState::Ltos {
            m.push_tos(state);
        }
        if !is_static {
            patch_bytecode(m, Some(fast_get(state)), Reg::Ecx, Reg::Ebx, None);
        }
        if !last {
            m.jmp(done);
            m.bind(next);
        }
    }
    m.bind(done);
    Ok(())
}

fn putfield_or_static(m: Masm<'_, '_>, byte_no: u32, is_static: bool) -> VmResult<()> {
    resolve_cache_and_index(m, byte_no, Reg::Ecx, Reg::Edx, IndexSize::U2);
    load_field_entry(m, is_static);
    // EDX = volatile, taken before a long pop overwrites it
    m.mov_rr(Reg::Edx, Reg::Eax);
    m.shr_ri(Reg::Edx, flags::IS_VOLATILE_SHIFT as u8);
    m.and_ri(Reg::Edx, 1);
    extract_tos_state(m);

    let done = m.new_label();
    for (i, &state) in FIELD_STATES.iter().enumerate() {
        let last = i == FIELD_STATES.len() - 1;
        let next = m.new_label();
        if !last {
            m.cmp_ri(Reg::Eax, state.index() as i32);
            m.jcc(Cond::Ne, next);
        }
        if state == TosState::Ltos {
            let not_volatile = m.new_label();
            m.test_rr(Reg::Edx, Reg::Edx);
            m.jcc(Cond::E, not_volatile);
            m.pop_tos(state);
            if !is_static {
                pop_and_check_object(m, Reg::Ecx);
            }
            store_long_atomic(m, field(Reg::Ecx, Reg::Ebx, 0));
            // volatile longs keep the slow form
            m.jmp(done);
            m.bind(not_volatile);
        }
        m.pop_tos(state);
        if !is_static {
            pop_and_check_object(m, Reg::Ecx);
        }
        store_field(m, state, Reg::Ecx, Reg::Ebx)?;
        if !is_static {
            patch_bytecode(m, Some(fast_put(state)), Reg::Ecx, Reg::Ebx, Some(byte_no));
        }
        if !last {
            m.jmp(done);
            m.bind(next);
        }
    }
    m.bind(done);
    volatile_store_barrier(m);
    Ok(())
}

pub(crate) fn getfield(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    getfield_or_static(m, arg.int() as u32, false)
}

pub(crate) fn getstatic(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    getfield_or_static(m, arg.int() as u32, true)
}

pub(crate) fn putfield(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    putfield_or_static(m, arg.int() as u32, false)
}

pub(crate) fn putstatic(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    putfield_or_static(m, arg.int() as u32, true)
}

/// Typed read of a resolved instance field; the receiver is in EAX.
pub(crate) fn fast_accessfield(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    let state = arg.state();
    m.get_cache_and_index_at_bcp(Reg::Ecx, Reg::Ebx, 1, IndexSize::U2);
    m.mov_rm(Reg::Ebx, Imasm::cache_entry(Reg::Ecx, Reg::Ebx, cp_cache::F2_OFFSET));
    m.verify_oop(Reg::Eax);
    m.null_check(Reg::Eax, None);

    let lo = field(Reg::Eax, Reg::Ebx, 0);
    match state {
        TosState::Btos => m.movsxb_rm(Reg::Eax, lo),
        TosState::Ctos => m.movzxw_rm(Reg::Eax, lo),
        TosState::Stos => m.movsxw_rm(Reg::Eax, lo),
        TosState::Itos => m.mov_rm(Reg::Eax, lo),
        TosState::Ltos => {
            push_long_atomic(m, lo);
            m.pop_long();
        }
        TosState::Ftos => m.fld_s(lo),
        TosState::Dtos => m.fld_d(lo),
        TosState::Atos => {
            m.mov_rm(Reg::Eax, lo);
            m.verify_oop(Reg::Eax);
        }
        TosState::Ztos | TosState::Vtos => {
            return Err(VmError::Template(format!("{}: no {} read", m.bytecode(), state.name())));
        }
    }
    Ok(())
}

/// Typed write of a resolved instance field; the value is cached, the
/// receiver below it on the stack.
pub(crate) fn fast_storefield(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    let state = arg.state();
    let not_volatile = m.new_label();
    let done = m.new_label();

    m.get_cache_and_index_at_bcp(Reg::Ecx, Reg::Ebx, 1, IndexSize::U2);
    if state == TosState::Ltos {
        m.push_r(Reg::Edx);
    }
    m.mov_rm(Reg::Edx, Imasm::cache_entry(Reg::Ecx, Reg::Ebx, cp_cache::FLAGS_OFFSET));
    m.mov_rm(Reg::Ebx, Imasm::cache_entry(Reg::Ecx, Reg::Ebx, cp_cache::F2_OFFSET));
    m.test_ri(Reg::Edx, VOLATILE_BIT);
    m.jcc(Cond::E, not_volatile);

    let depth = m.fpu_depth();
    if state == TosState::Ltos {
        m.pop_r(Reg::Edx);
    }
    pop_and_check_object(m, Reg::Ecx);
    if state == TosState::Ltos {
        store_long_atomic(m, field(Reg::Ecx, Reg::Ebx, 0));
    } else {
        store_field(m, state, Reg::Ecx, Reg::Ebx)?;
    }
    m.membar(Membar::StoreLoad);
    m.jmp(done);

    m.bind(not_volatile);
    m.set_fpu_depth(depth);
    if state == TosState::Ltos {
        m.pop_r(Reg::Edx);
    }
    pop_and_check_object(m, Reg::Ecx);
    store_field(m, state, Reg::Ecx, Reg::Ebx)?;
    m.bind(done);
    Ok(())
}

/// `aload_0` fused with the following `getfield`. The getfield's index is
/// at bcp + 2; the bcp is moved onto the getfield while the receiver is
/// null checked so exceptions report that instruction.
pub(crate) fn fast_xaccess(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    let state = arg.state();
    m.mov_rm(Reg::Eax, Imasm::iaddress(0));
    m.get_cache_and_index_at_bcp(Reg::Ecx, Reg::Edx, 2, IndexSize::U2);
    m.mov_rm(Reg::Ebx, Imasm::cache_entry(Reg::Ecx, Reg::Edx, cp_cache::F2_OFFSET));
    m.increment(BCP, 1);
    m.null_check(Reg::Eax, None);

    let lo = field(Reg::Eax, Reg::Ebx, 0);
    match state {
        TosState::Itos => m.mov_rm(Reg::Eax, lo),
        TosState::Atos => {
            m.mov_rm(Reg::Eax, lo);
            m.verify_oop(Reg::Eax);
        }
        TosState::Ftos => m.fld_s(lo),
        _ => {
            return Err(VmError::Template(format!("{}: no {} access", m.bytecode(), state.name())));
        }
    }
    m.decrement(BCP, 1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::asm::RelocKind;
    use crate::config::RuntimeConfig;
    use crate::runtime::entries::RuntimeEntry;

    fn mov_ecx(bc: Bytecode) -> [u8; 5] {
        [0xB9, bc.code(), 0x00, 0x00, 0x00]
    }

    #[test]
    fn test_getfield_resolves_and_rewrites() {
        let config = RuntimeConfig::default();
        let ctx = context(&config);
        let buf = generate(Bytecode::Getfield);
        assert!(buf.relocations().iter().any(|r| r.kind == RelocKind::RuntimeCall
            && r.target == ctx.entry(RuntimeEntry::ResolveGetPut)));
        for bc in [
            Bytecode::FastIgetfield,
            Bytecode::FastAgetfield,
            Bytecode::FastBgetfield,
            Bytecode::FastLgetfield,
            Bytecode::FastDgetfield,
        ] {
            assert!(contains(buf.code(), &mov_ecx(bc)), "{bc}");
        }
    }

    #[test]
    fn test_statics_are_not_rewritten() {
        let get = generate(Bytecode::Getstatic);
        assert!(!contains(get.code(), &mov_ecx(Bytecode::FastIgetfield)));
        let put = generate(Bytecode::Putstatic);
        assert!(!contains(put.code(), &mov_ecx(Bytecode::FastIputfield)));
    }

    #[test]
    fn test_volatile_long_store_is_atomic() {
        let buf = generate(Bytecode::Putfield);
        // FILD qword [ESP] = DF 2C 24 ; FISTP qword [ECX+EBX] = DF 3C 19
        assert!(contains(buf.code(), &[0xDF, 0x2C, 0x24, 0xDF, 0x3C, 0x19]));
    }

    #[test]
    fn test_store_load_fence_on_mp_only() {
        // LOCK ADD dword [ESP], 0 = F0 83 04 24 00
        let fence = [0xF0, 0x83, 0x04, 0x24, 0x00];
        assert!(contains(generate(Bytecode::Putfield).code(), &fence));
        assert!(contains(generate(Bytecode::FastIputfield).code(), &fence));

        let up = RuntimeConfig {
            is_mp: false,
            ..RuntimeConfig::default()
        };
        let buf = generate_with(&up, Bytecode::Putfield, false).unwrap();
        assert!(!contains(buf.code(), &fence));
    }

    #[test]
    fn test_fast_lgetfield_loads_atomically() {
        let buf = generate(Bytecode::FastLgetfield);
        // FILD qword [EAX+EBX] = DF 2C 18
        assert!(contains(buf.code(), &[0xDF, 0x2C, 0x18]));
    }

    #[test]
    fn test_fast_xaccess_reports_getfield_bcp() {
        let buf = generate(Bytecode::FastIaccess0);
        let code = buf.code();
        // MOV EAX, [EDI] = 8B 07
        assert_eq!(&code[..2], &[0x8B, 0x07]);
        // INC ESI = 46 ; CMP EAX, [EAX] = 3B 00
        assert!(contains(code, &[0x46, 0x3B, 0x00]));
        // DEC ESI = 4E
        assert!(contains(code, &[0x4E]));
    }

    #[test]
    fn test_all_field_templates_generate() {
        for bc in [
            Bytecode::Getstatic,
            Bytecode::Putstatic,
            Bytecode::Getfield,
            Bytecode::Putfield,
            Bytecode::FastAgetfield,
            Bytecode::FastBgetfield,
            Bytecode::FastCgetfield,
            Bytecode::FastDgetfield,
            Bytecode::FastFgetfield,
            Bytecode::FastIgetfield,
            Bytecode::FastLgetfield,
            Bytecode::FastSgetfield,
            Bytecode::FastAputfield,
            Bytecode::FastBputfield,
            Bytecode::FastZputfield,
            Bytecode::FastCputfield,
            Bytecode::FastDputfield,
            Bytecode::FastFputfield,
            Bytecode::FastIputfield,
            Bytecode::FastLputfield,
            Bytecode::FastSputfield,
            Bytecode::FastIaccess0,
            Bytecode::FastAaccess0,
            Bytecode::FastFaccess0,
        ] {
            assert!(
                generate_with(&RuntimeConfig::default(), bc, false).is_ok(),
                "{bc}"
            );
        }
    }
}
