//! Template generators grouped by bytecode family, plus the helpers they
//! share: sideband rewriting, array index checks and cache resolution.

pub(crate) mod arith;
pub(crate) mod control;
pub(crate) mod fields;
pub(crate) mod invoke;
pub(crate) mod loads;
pub(crate) mod objects;

use super::masm::{IndexSize, InterpreterMacroAssembler, BCP};
use crate::asm::{Address, Cond, Reg};
use crate::runtime::bytecodes::Bytecode;
use crate::runtime::entries::RuntimeEntry;
use crate::runtime::layout::array;

pub(crate) type Masm<'m, 'a> = &'m mut InterpreterMacroAssembler<'a>;

/// Resolved-opcode byte at `bcp + offset`.
pub(crate) fn sideband(m: &InterpreterMacroAssembler<'_>, offset: i32) -> Address {
    Address::new(BCP, offset + m.config().layout.resolved_opcode_delta as i32)
}

/// Replace the current bytecode by a quickened form.
///
/// `bc` of `Some` loads that opcode into `bc_reg`, otherwise `bc_reg`
/// already holds it. With `byte_no`, the rewrite only happens once the
/// cache entry has been resolved for that byte. A breakpoint in the
/// sideband keeps its slot: the runtime records the new opcode as the
/// original one instead.
pub(crate) fn patch_bytecode(
    m: Masm<'_, '_>,
    bc: Option<Bytecode>,
    bc_reg: Reg,
    temp: Reg,
    byte_no: Option<u32>,
) {
    if !m.config().rewrite_bytecodes {
        return;
    }
    let done = m.new_label();
    if let Some(byte_no) = byte_no {
        // putfield stays slow until resolved
        m.get_cache_and_index_and_bytecode_at_bcp(bc_reg, temp, temp, byte_no, 1, IndexSize::U2);
        m.test_rr(temp, temp);
        m.jcc(Cond::E, done);
    }
    if let Some(bc) = bc {
        m.mov_ri(bc_reg, bc.code() as i32);
        log::trace!("{} rewrites to {}", m.bytecode(), bc);
    }

    let fast = m.new_label();
    let at = sideband(m, 0);
    m.movzxb_rm(temp, at);
    m.cmp_ri(temp, Bytecode::Breakpoint.code() as i32);
    m.jcc(Cond::Ne, fast);
    m.get_method(temp);
    m.call_vm(None, RuntimeEntry::SetOriginalBytecodeAt, &[temp, BCP, bc_reg]);
    m.jmp(done);

    m.bind(fast);
    m.movb_mr(at, bc_reg);
    m.bind(done);
}

/// Pop the array into `array` and check `index` against its length.
/// EBX receives the index for the throw entry.
pub(crate) fn index_check(m: Masm<'_, '_>, array: Reg, index: Reg) {
    m.pop_ptr(array);
    index_check_without_pop(m, array, index);
}

pub(crate) fn index_check_without_pop(m: Masm<'_, '_>, array: Reg, index: Reg) {
    m.null_check(array, Some(array::LENGTH_OFFSET));
    m.cmp_rm(index, Address::new(array, array::LENGTH_OFFSET));
    if index != Reg::Ebx {
        m.mov_rr(Reg::Ebx, index);
    }
    let aioobe = m.shared().throw_array_index_out_of_bounds;
    m.jcc_abs(Cond::Ae, aioobe);
}

/// Load the cache entry for the current bytecode, resolving it through
/// the runtime on first use. Clobbers EBX.
pub(crate) fn resolve_cache_and_index(
    m: Masm<'_, '_>,
    byte_no: u32,
    cache: Reg,
    index: Reg,
    size: IndexSize,
) {
    let temp = Reg::Ebx;
    let resolved = m.new_label();
    let bc = m.bytecode();
    m.get_cache_and_index_and_bytecode_at_bcp(cache, index, temp, byte_no, 1, size);
    m.cmp_ri(temp, bc.code() as i32);
    m.jcc(Cond::E, resolved);

    let entry = match bc {
        Bytecode::Getstatic | Bytecode::Putstatic | Bytecode::Getfield | Bytecode::Putfield => {
            RuntimeEntry::ResolveGetPut
        }
        Bytecode::Invokehandle => RuntimeEntry::ResolveInvokehandle,
        Bytecode::Invokedynamic => RuntimeEntry::ResolveInvokedynamic,
        _ => RuntimeEntry::ResolveInvoke,
    };
    m.call_vm_imm(None, entry, temp, bc.code() as i32);
    m.get_cache_and_index_at_bcp(cache, index, 1, size);
    m.bind(resolved);
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::asm::{CodeBuffer, MacroAssembler, RelocKind};
    use crate::config::RuntimeConfig;

    #[test]
    fn test_patch_bytecode_stores_into_sideband() {
        let config = RuntimeConfig::default();
        let ctx = context(&config);
        let mut buf = CodeBuffer::new(CODE_BASE);
        {
            let mut m = InterpreterMacroAssembler::new(MacroAssembler::new(&mut buf, &ctx), &config);
            m.set_bytecode(Bytecode::Iload);
            patch_bytecode(&mut m, Some(Bytecode::FastIload), Reg::Ecx, Reg::Ebx, None);
        }
        buf.check().unwrap();
        let code = buf.code();
        let delta = config.layout.resolved_opcode_delta.to_le_bytes();
        // MOV ECX, 0xE0 = B9 E0 00 00 00
        assert_eq!(&code[..5], &[0xB9, 0xE0, 0x00, 0x00, 0x00]);
        // MOV byte [ESI + delta], CL = 88 8E disp32
        assert!(contains(code, &[0x88, 0x8E, delta[0], delta[1], delta[2], delta[3]]));
        assert!(buf
            .relocations()
            .iter()
            .any(|r| r.kind == RelocKind::RuntimeCall
                && r.target == ctx.entry(RuntimeEntry::SetOriginalBytecodeAt)));
    }

    #[test]
    fn test_patch_bytecode_disabled() {
        let config = RuntimeConfig {
            rewrite_bytecodes: false,
            ..RuntimeConfig::default()
        };
        let ctx = context(&config);
        let mut buf = CodeBuffer::new(CODE_BASE);
        {
            let mut m = InterpreterMacroAssembler::new(MacroAssembler::new(&mut buf, &ctx), &config);
            patch_bytecode(&mut m, Some(Bytecode::FastIload), Reg::Ecx, Reg::Ebx, None);
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_index_check_jumps_to_aioobe() {
        let config = RuntimeConfig::default();
        let ctx = context(&config);
        let mut buf = CodeBuffer::new(CODE_BASE);
        {
            let mut m = InterpreterMacroAssembler::new(MacroAssembler::new(&mut buf, &ctx), &config);
            m.set_shared(shared());
            index_check(&mut m, Reg::Edx, Reg::Eax);
        }
        let code = buf.code();
        // POP EDX = 5A ; CMP EAX, [EDX+8] = 3B 42 08 ; MOV EBX, EAX = 89 C3
        assert_eq!(&code[..6], &[0x5A, 0x3B, 0x42, 0x08, 0x89, 0xC3]);
        // JAE rel32 = 0F 83
        assert_eq!(&code[6..8], &[0x0F, 0x83]);
        let rel = i32::from_le_bytes([code[8], code[9], code[10], code[11]]);
        let target = (CODE_BASE as i64 + 12 + rel as i64) as u32;
        assert_eq!(target, shared().throw_array_index_out_of_bounds);
    }
}
