//! FPU state checks, conversion wrappers and the math intrinsics.

use crate::asm::macro_asm::{Trig, FPU_STATE_SIZE};
use crate::asm::{Address, Cond, MacroAssembler, Reg};
use crate::error::VmResult;
use crate::runtime::entries::RuntimeEntry;
use crate::runtime::globals::fpu;

/// The `intrinsic_*` math stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathStub {
    Log,
    Log10,
    Sin,
    Cos,
    Tan,
    Exp,
    Pow,
}

/// Restore the canonical MXCSR if native code changed it.
pub fn generate_verify_mxcsr(masm: &mut MacroAssembler) {
    let ctx = masm.ctx();
    if ctx.cpu.use_sse > 0 {
        let mxcsr_std = Address::absolute(ctx.globals.mxcsr_std);
        let ok = masm.new_label();
        masm.push_r(Reg::Eax);
        masm.sub_ri(Reg::Esp, 4);
        masm.stmxcsr(Address::new(Reg::Esp, 0));
        masm.mov_rm(Reg::Eax, Address::new(Reg::Esp, 0));
        masm.and_ri(Reg::Eax, fpu::MXCSR_MASK as i32);
        masm.cmp_rm(Reg::Eax, mxcsr_std);
        masm.jcc(Cond::E, ok);
        masm.ldmxcsr(mxcsr_std);
        masm.bind(ok);
        masm.add_ri(Reg::Esp, 4);
        masm.pop_r(Reg::Eax);
    }
    masm.ret(0);
}

/// Restore the canonical x87 control word if native code changed it.
pub fn generate_verify_fpu_cntrl_wrd(masm: &mut MacroAssembler) {
    let fpu_std = Address::absolute(masm.ctx().globals.fpu_cntrl_wrd_std);
    let ok = masm.new_label();
    masm.push_r(Reg::Eax);
    masm.sub_ri(Reg::Esp, 4);
    masm.fnstcw(Address::new(Reg::Esp, 0));
    masm.mov_rm(Reg::Eax, Address::new(Reg::Esp, 0));
    masm.and_ri(Reg::Eax, fpu::FPU_CNTRL_WRD_MASK as i32);
    masm.cmp_rm(Reg::Eax, fpu_std);
    masm.jcc(Cond::E, ok);
    masm.fldcw(fpu_std);
    masm.bind(ok);
    masm.add_ri(Reg::Esp, 4);
    masm.pop_r(Reg::Eax);
    masm.ret(0);
}

/// Convert the double in ST0 through the runtime helper `entry`
/// (`d2i` or `d2l`), preserving every other register and the rest of
/// the x87 state. The result is in EAX (and EDX); ST0 is popped.
pub fn generate_d2i_wrapper(masm: &mut MacroAssembler, entry: RuntimeEntry) -> VmResult<()> {
    let target = masm.ctx().entry(entry);
    // [argument (2 words)] [ebx ecx esi edi ebp] [fpu state]
    let saved_argument = Address::new(Reg::Esp, FPU_STATE_SIZE + 5 * 4);

    masm.set_fpu_depth(1);
    masm.sub_ri(Reg::Esp, 8);
    masm.fstp_d(Address::new(Reg::Esp, 0));
    for reg in [Reg::Ebx, Reg::Ecx, Reg::Esi, Reg::Edi, Reg::Ebp] {
        masm.push_r(reg);
    }
    let depth = masm.push_fpu_state();
    masm.fld_d(saved_argument);
    masm.sub_ri(Reg::Esp, 8);
    masm.fst_d(Address::new(Reg::Esp, 0));
    masm.empty_fpu_stack();
    masm.call_abs(target);
    masm.add_ri(Reg::Esp, 8);
    masm.pop_fpu_state(depth);
    for reg in [Reg::Ebp, Reg::Edi, Reg::Esi, Reg::Ecx, Reg::Ebx] {
        masm.pop_r(reg);
    }
    masm.add_ri(Reg::Esp, 8);
    masm.ret(0);
    masm.expect_fpu_depth(0, entry.name())
}

/// `double intrinsic(double)` (and `pow(double, double)`), cdecl with
/// the result in ST0.
pub fn generate_math_stub(masm: &mut MacroAssembler, kind: MathStub) -> VmResult<()> {
    masm.fld_d(Address::new(Reg::Esp, 4));
    match kind {
        MathStub::Log => masm.flog(),
        MathStub::Log10 => masm.flog10(),
        MathStub::Sin => masm.trigfunc(Trig::Sin),
        MathStub::Cos => masm.trigfunc(Trig::Cos),
        MathStub::Tan => masm.trigfunc(Trig::Tan),
        MathStub::Exp => masm.call_fpu_leaf(RuntimeEntry::Dexp, 1),
        MathStub::Pow => {
            // ST0 = y, ST1 = x
            masm.fld_d(Address::new(Reg::Esp, 12));
            masm.call_fpu_leaf(RuntimeEntry::Dpow, 2);
        }
    }
    masm.ret(0);
    masm.expect_fpu_depth(1, "math intrinsic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{AsmContext, CodeBuffer, RelocKind};
    use crate::config::RuntimeConfig;
    use crate::runtime::entries::RuntimeEntries;
    use crate::runtime::globals::VmGlobals;

    fn context() -> AsmContext {
        let config = RuntimeConfig::default();
        let globals = VmGlobals::layout(config.layout.data_base, config.layout.data_size).unwrap();
        AsmContext::new(&config, RuntimeEntries::synthetic(0x7000_0000), globals)
    }

    #[test]
    fn test_math_stubs_leave_one_result() {
        let ctx = context();
        for kind in [
            MathStub::Log,
            MathStub::Log10,
            MathStub::Sin,
            MathStub::Cos,
            MathStub::Tan,
            MathStub::Exp,
            MathStub::Pow,
        ] {
            let mut buf = CodeBuffer::new(0x0800_0000);
            let mut masm = MacroAssembler::new(&mut buf, &ctx);
            generate_math_stub(&mut masm, kind).unwrap();
            drop(masm);
            buf.check().unwrap();
        }
    }

    #[test]
    fn test_d2i_wrapper_calls_helper() {
        let ctx = context();
        let mut buf = CodeBuffer::new(0x0800_0000);
        let mut masm = MacroAssembler::new(&mut buf, &ctx);
        generate_d2i_wrapper(&mut masm, RuntimeEntry::D2l).unwrap();
        drop(masm);
        let calls: Vec<_> = buf
            .relocations()
            .iter()
            .filter(|r| r.kind == RelocKind::RuntimeCall)
            .map(|r| r.target)
            .collect();
        assert_eq!(calls, vec![ctx.entry(RuntimeEntry::D2l)]);
    }

    #[test]
    fn test_verify_mxcsr_is_plain_return_without_sse() {
        let mut config = RuntimeConfig::default();
        config.cpu.use_sse = 0;
        let globals = VmGlobals::layout(config.layout.data_base, config.layout.data_size).unwrap();
        let ctx = AsmContext::new(&config, RuntimeEntries::synthetic(0x7000_0000), globals);
        let mut buf = CodeBuffer::new(0x0800_0000);
        let mut masm = MacroAssembler::new(&mut buf, &ctx);
        generate_verify_mxcsr(&mut masm);
        drop(masm);
        assert_eq!(buf.code(), &[0xC3]);
    }
}
