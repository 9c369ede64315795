//! Integer, long and x87 floating-point arithmetic, conversions and
//! comparisons.

use super::Masm;
use crate::asm::{Address, Cond, Reg};
use crate::error::{VmError, VmResult};
use crate::interpreter::masm::InterpreterMacroAssembler as Imasm;
use crate::interpreter::template::{Operation, TemplateArg};
use crate::runtime::bytecodes::Bytecode;
use crate::runtime::entries::RuntimeEntry;
use crate::runtime::layout::{access, method, WORD_SIZE};

fn at_rsp() -> Address {
    Imasm::expr_address(0)
}

/// Call a leaf whose `words` argument words the caller already pushed.
fn call_leaf_with_stack_args(m: Masm<'_, '_>, entry: RuntimeEntry, words: i32) {
    let target = m.ctx().entry(entry);
    m.call_abs(target);
    m.add_ri(Reg::Esp, words * WORD_SIZE);
}

fn throw_arithmetic_if_zero(m: Masm<'_, '_>, reg: Reg) {
    let target = m.shared().throw_arithmetic;
    m.test_rr(reg, reg);
    m.jcc_abs(Cond::E, target);
}

// ==================== int ====================

pub(crate) fn iop2(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    match arg.op() {
        Operation::Add => {
            m.pop_int(Reg::Edx);
            m.add_rr(Reg::Eax, Reg::Edx);
        }
        Operation::Sub => {
            m.mov_rr(Reg::Edx, Reg::Eax);
            m.pop_int(Reg::Eax);
            m.sub_rr(Reg::Eax, Reg::Edx);
        }
        Operation::Mul => {
            m.pop_int(Reg::Edx);
            m.imul_rr(Reg::Eax, Reg::Edx);
        }
        Operation::And => {
            m.pop_int(Reg::Edx);
            m.and_rr(Reg::Eax, Reg::Edx);
        }
        Operation::Or => {
            m.pop_int(Reg::Edx);
            m.or_rr(Reg::Eax, Reg::Edx);
        }
        Operation::Xor => {
            m.pop_int(Reg::Edx);
            m.xor_rr(Reg::Eax, Reg::Edx);
        }
        // the hardware masks the count to 5 bits
        Operation::Shl => {
            m.mov_rr(Reg::Ecx, Reg::Eax);
            m.pop_int(Reg::Eax);
            m.shl_cl(Reg::Eax);
        }
        Operation::Shr => {
            m.mov_rr(Reg::Ecx, Reg::Eax);
            m.pop_int(Reg::Eax);
            m.sar_cl(Reg::Eax);
        }
        Operation::Ushr => {
            m.mov_rr(Reg::Ecx, Reg::Eax);
            m.pop_int(Reg::Eax);
            m.shr_cl(Reg::Eax);
        }
        op @ (Operation::Div | Operation::Rem) => {
            return Err(VmError::Template(format!(
                "{op:?} is not an iop2 operation"
            )))
        }
    }
    Ok(())
}

pub(crate) fn idiv(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.mov_rr(Reg::Ecx, Reg::Eax);
    m.pop_int(Reg::Eax);
    throw_arithmetic_if_zero(m, Reg::Ecx);
    m.corrected_idivl(Reg::Ecx);
    Ok(())
}

pub(crate) fn irem(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.mov_rr(Reg::Ecx, Reg::Eax);
    m.pop_int(Reg::Eax);
    throw_arithmetic_if_zero(m, Reg::Ecx);
    m.corrected_idivl(Reg::Ecx);
    m.mov_rr(Reg::Eax, Reg::Edx);
    Ok(())
}

pub(crate) fn ineg(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.neg_r(Reg::Eax);
    Ok(())
}

// ==================== long ====================
//
// y in EDX:EAX, x popped into ECX:EBX.

fn pop_x(m: Masm<'_, '_>) {
    m.pop_r(Reg::Ebx);
    m.pop_r(Reg::Ecx);
}

pub(crate) fn lop2(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    pop_x(m);
    match arg.op() {
        Operation::Add => {
            m.add_rr(Reg::Eax, Reg::Ebx);
            m.adc_rr(Reg::Edx, Reg::Ecx);
        }
        Operation::Sub => {
            m.sub_rr(Reg::Ebx, Reg::Eax);
            m.sbb_rr(Reg::Ecx, Reg::Edx);
            m.mov_rr(Reg::Eax, Reg::Ebx);
            m.mov_rr(Reg::Edx, Reg::Ecx);
        }
        Operation::And => {
            m.and_rr(Reg::Eax, Reg::Ebx);
            m.and_rr(Reg::Edx, Reg::Ecx);
        }
        Operation::Or => {
            m.or_rr(Reg::Eax, Reg::Ebx);
            m.or_rr(Reg::Edx, Reg::Ecx);
        }
        Operation::Xor => {
            m.xor_rr(Reg::Eax, Reg::Ebx);
            m.xor_rr(Reg::Edx, Reg::Ecx);
        }
        op => {
            return Err(VmError::Template(format!(
                "{op:?} is not an lop2 operation"
            )))
        }
    }
    Ok(())
}

/// Push x and y as cdecl `(y, x)` and call `entry`; the result comes
/// back in EDX:EAX.
fn long_runtime_op(m: Masm<'_, '_>, entry: RuntimeEntry, check_zero: bool) {
    pop_x(m);
    m.push_r(Reg::Ecx);
    m.push_r(Reg::Ebx);
    m.push_r(Reg::Edx);
    m.push_r(Reg::Eax);
    if check_zero {
        let target = m.shared().throw_arithmetic;
        m.or_rr(Reg::Eax, Reg::Edx);
        m.jcc_abs(Cond::E, target);
    }
    call_leaf_with_stack_args(m, entry, 4);
}

pub(crate) fn lmul(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    long_runtime_op(m, RuntimeEntry::Lmul, false);
    Ok(())
}

pub(crate) fn ldiv(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    long_runtime_op(m, RuntimeEntry::Ldiv, true);
    Ok(())
}

pub(crate) fn lrem(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    long_runtime_op(m, RuntimeEntry::Lrem, true);
    Ok(())
}

pub(crate) fn lneg(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.neg_r(Reg::Eax);
    m.adc_ri(Reg::Edx, 0);
    m.neg_r(Reg::Edx);
    Ok(())
}

/// Shift count in EAX, value popped into EDX:EAX. ECX ends up with the
/// count masked to 6 bits.
fn prepare_long_shift(m: Masm<'_, '_>) -> crate::asm::Label {
    let small = m.new_label();
    m.mov_rr(Reg::Ecx, Reg::Eax);
    m.pop_long();
    m.and_ri(Reg::Ecx, 0x3F);
    m.cmp_ri(Reg::Ecx, 32);
    m.jcc(Cond::L, small);
    small
}

pub(crate) fn lshl(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let small = prepare_long_shift(m);
    m.mov_rr(Reg::Edx, Reg::Eax);
    m.xor_rr(Reg::Eax, Reg::Eax);
    m.bind(small);
    m.shld_cl(Reg::Edx, Reg::Eax);
    m.shl_cl(Reg::Eax);
    Ok(())
}

pub(crate) fn lshr(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let small = prepare_long_shift(m);
    m.mov_rr(Reg::Eax, Reg::Edx);
    m.sar_ri(Reg::Edx, 31);
    m.bind(small);
    m.shrd_cl(Reg::Eax, Reg::Edx);
    m.sar_cl(Reg::Edx);
    Ok(())
}

pub(crate) fn lushr(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    let small = prepare_long_shift(m);
    m.mov_rr(Reg::Eax, Reg::Edx);
    m.xor_rr(Reg::Edx, Reg::Edx);
    m.bind(small);
    m.shrd_cl(Reg::Eax, Reg::Edx);
    m.shr_cl(Reg::Edx);
    Ok(())
}

// ==================== float / double ====================
//
// y in ST0, x on the expression stack.

pub(crate) fn fop2(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    match arg.op() {
        Operation::Add => m.fadd_s(at_rsp()),
        Operation::Sub => m.fsubr_s(at_rsp()),
        Operation::Mul => m.fmul_s(at_rsp()),
        Operation::Div => m.fdivr_s(at_rsp()),
        Operation::Rem => {
            m.fld_s(at_rsp());
            m.fremr(Reg::Eax);
        }
        op => {
            return Err(VmError::Template(format!(
                "{op:?} is not a float operation"
            )))
        }
    }
    m.f2ieee();
    m.pop_r(Reg::Eax);
    Ok(())
}

/// Load the method's strictfp bit; jumps to `strict` when set. Clobbers ECX.
fn test_strict(m: Masm<'_, '_>, strict: crate::asm::Label) {
    m.get_method(Reg::Ecx);
    m.mov_rm(Reg::Ecx, Address::new(Reg::Ecx, method::ACCESS_FLAGS_OFFSET));
    m.test_ri(Reg::Ecx, access::STRICT as i32);
    m.jcc(Cond::Ne, strict);
}

/// Strict `dmul` and `ddiv` scale one operand by 2^-15360 and the result
/// by 2^15360 so that results in the double denormal range round once,
/// as double arithmetic would.
pub(crate) fn dop2(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    let bias1 = Address::absolute(m.ctx().globals.strict_bias1);
    let bias2 = Address::absolute(m.ctx().globals.strict_bias2);
    match arg.op() {
        Operation::Add => m.fadd_d(at_rsp()),
        Operation::Sub => m.fsubr_d(at_rsp()),
        Operation::Mul => {
            let strict = m.new_label();
            let join = m.new_label();
            test_strict(m, strict);
            m.fmul_d(at_rsp());
            m.jmp(join);
            m.bind(strict);
            m.fld_x(bias1);
            m.fmulp(1);
            m.fmul_d(at_rsp());
            m.fld_x(bias2);
            m.fmulp(1);
            m.bind(join);
        }
        Operation::Div => {
            let strict = m.new_label();
            let join = m.new_label();
            test_strict(m, strict);
            m.fdivr_d(at_rsp());
            m.jmp(join);
            m.bind(strict);
            m.fld_x(bias1);
            m.fmul_d(at_rsp());
            m.fdivrp(1);
            m.fld_x(bias2);
            m.fmulp(1);
            m.bind(join);
        }
        Operation::Rem => {
            m.fld_d(at_rsp());
            m.fremr(Reg::Eax);
        }
        op => {
            return Err(VmError::Template(format!(
                "{op:?} is not a double operation"
            )))
        }
    }
    m.d2ieee();
    m.pop_r(Reg::Eax);
    m.pop_r(Reg::Edx);
    Ok(())
}

pub(crate) fn fneg(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.fchs();
    Ok(())
}

pub(crate) fn dneg(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    m.fchs();
    Ok(())
}

// ==================== Conversions ====================

pub(crate) fn convert(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    match m.bytecode() {
        Bytecode::I2l => {
            m.mov_rr(Reg::Edx, Reg::Eax);
            m.sar_ri(Reg::Edx, 31);
        }
        Bytecode::I2f => {
            m.push_r(Reg::Eax);
            m.fild_s(at_rsp());
            m.f2ieee();
            m.pop_r(Reg::Ecx);
        }
        Bytecode::I2d => {
            m.push_r(Reg::Eax);
            m.fild_s(at_rsp());
            m.pop_r(Reg::Ecx);
        }
        Bytecode::I2b => m.sign_extend_byte(Reg::Eax),
        Bytecode::I2c => m.and_ri(Reg::Eax, 0xFFFF),
        Bytecode::I2s => m.sign_extend_short(Reg::Eax),
        Bytecode::L2i => {}
        Bytecode::L2f | Bytecode::L2d => {
            m.push_long();
            m.fild_d(at_rsp());
            if m.bytecode() == Bytecode::L2f {
                m.f2ieee();
            } else {
                m.d2ieee();
            }
            m.pop_r(Reg::Ecx);
            m.pop_r(Reg::Ecx);
        }
        // NaN and out-of-range values need the language's saturation
        Bytecode::F2i | Bytecode::F2l => {
            m.push_r(Reg::Ecx);
            m.fstp_s(at_rsp());
            let entry = if m.bytecode() == Bytecode::F2i {
                RuntimeEntry::F2i
            } else {
                RuntimeEntry::F2l
            };
            call_leaf_with_stack_args(m, entry, 1);
        }
        Bytecode::F2d => {}
        Bytecode::D2f => m.f2ieee(),
        Bytecode::D2i | Bytecode::D2l => {
            m.push_r(Reg::Ecx);
            m.push_r(Reg::Ecx);
            m.fstp_d(at_rsp());
            let entry = if m.bytecode() == Bytecode::D2i {
                RuntimeEntry::D2i
            } else {
                RuntimeEntry::D2l
            };
            call_leaf_with_stack_args(m, entry, 2);
        }
        other => {
            return Err(VmError::Template(format!(
                "{other} is not a conversion"
            )))
        }
    }
    Ok(())
}

// ==================== Comparisons ====================

pub(crate) fn lcmp(m: Masm<'_, '_>, _: TemplateArg) -> VmResult<()> {
    pop_x(m);
    m.lcmp2int(Reg::Ecx, Reg::Ebx, Reg::Edx, Reg::Eax);
    m.mov_rr(Reg::Eax, Reg::Ecx);
    Ok(())
}

/// `fcmpl`/`fcmpg`: `arg` is the result for unordered operands.
pub(crate) fn float_cmp(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    m.fld_s(at_rsp());
    m.pop_r(Reg::Ecx);
    m.fcmp2int(Reg::Eax, arg.int() < 0);
    Ok(())
}

pub(crate) fn double_cmp(m: Masm<'_, '_>, arg: TemplateArg) -> VmResult<()> {
    m.fld_d(at_rsp());
    m.pop_r(Reg::Edx);
    m.pop_r(Reg::Ecx);
    m.fcmp2int(Reg::Eax, arg.int() < 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::asm::RelocKind;
    use crate::config::RuntimeConfig;
    use crate::runtime::bytecodes::Bytecode;
    use crate::runtime::entries::RuntimeEntry;

    fn rel32_target(code: &[u8], at: usize) -> u32 {
        let rel = i32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]]);
        (CODE_BASE as i64 + at as i64 + 4 + rel as i64) as u32
    }

    #[test]
    fn test_iadd_and_isub() {
        let code = generate(Bytecode::Iadd).into_code();
        // POP EDX = 5A ; ADD EAX, EDX = 01 D0
        assert_eq!(&code[..3], &[0x5A, 0x01, 0xD0]);
        let code = generate(Bytecode::Isub).into_code();
        // MOV EDX, EAX = 89 C2 ; POP EAX = 58 ; SUB EAX, EDX = 29 D0
        assert_eq!(&code[..5], &[0x89, 0xC2, 0x58, 0x29, 0xD0]);
    }

    #[test]
    fn test_ishl_shifts_by_cl() {
        let code = generate(Bytecode::Ishl).into_code();
        // MOV ECX, EAX = 89 C1 ; POP EAX = 58 ; SHL EAX, CL = D3 E0
        assert_eq!(&code[..5], &[0x89, 0xC1, 0x58, 0xD3, 0xE0]);
    }

    #[test]
    fn test_idiv_checks_zero_divisor() {
        let code = generate(Bytecode::Idiv).into_code();
        // MOV ECX, EAX ; POP EAX ; TEST ECX, ECX = 85 C9 ; JE rel32 = 0F 84
        assert_eq!(&code[..7], &[0x89, 0xC1, 0x58, 0x85, 0xC9, 0x0F, 0x84]);
        assert_eq!(rel32_target(&code, 7), shared().throw_arithmetic);
        // CDQ = 99 ; IDIV ECX = F7 F9
        assert!(contains(&code, &[0x99, 0xF7, 0xF9]));
    }

    #[test]
    fn test_irem_moves_remainder() {
        let code = generate(Bytecode::Irem).into_code();
        // IDIV ECX = F7 F9 ; MOV EAX, EDX = 89 D0
        assert!(contains(&code, &[0xF7, 0xF9, 0x89, 0xD0]));
    }

    #[test]
    fn test_ldiv_calls_runtime_after_zero_check() {
        let buf = generate(Bytecode::Ldiv);
        let entry = context(&RuntimeConfig::default()).entry(RuntimeEntry::Ldiv);
        assert!(buf
            .relocations()
            .iter()
            .any(|r| r.kind == RelocKind::RuntimeCall && r.target == entry));
        let code = buf.code();
        // POP EBX ; POP ECX ; PUSH ECX ; PUSH EBX ; PUSH EDX ; PUSH EAX
        assert_eq!(&code[..6], &[0x5B, 0x59, 0x51, 0x53, 0x52, 0x50]);
        // OR EAX, EDX = 09 D0 ; JE rel32
        assert_eq!(&code[6..10], &[0x09, 0xD0, 0x0F, 0x84]);
        assert_eq!(rel32_target(code, 10), shared().throw_arithmetic);
    }

    #[test]
    fn test_lmul_has_no_zero_check() {
        let code = generate(Bytecode::Lmul).into_code();
        assert!(!contains(&code, &[0x09, 0xD0]));
    }

    #[test]
    fn test_ladd_carries() {
        let code = generate(Bytecode::Ladd).into_code();
        // ADD EAX, EBX = 01 D8 ; ADC EDX, ECX = 11 CA
        assert_eq!(&code[2..6], &[0x01, 0xD8, 0x11, 0xCA]);
    }

    #[test]
    fn test_lshl_handles_wide_counts() {
        let code = generate(Bytecode::Lshl).into_code();
        // AND ECX, 0x3F = 83 E1 3F ; CMP ECX, 32 = 83 F9 20
        assert!(contains(&code, &[0x83, 0xE1, 0x3F, 0x83, 0xF9, 0x20]));
        // SHLD EDX, EAX, CL = 0F A5 C2 ; SHL EAX, CL = D3 E0
        assert!(contains(&code, &[0x0F, 0xA5, 0xC2, 0xD3, 0xE0]));
    }

    #[test]
    fn test_strict_dmul_uses_bias_constants() {
        let config = RuntimeConfig::default();
        let ctx = context(&config);
        let code = generate(Bytecode::Dmul).into_code();
        let bias1 = ctx.globals.strict_bias1.to_le_bytes();
        let bias2 = ctx.globals.strict_bias2.to_le_bytes();
        // FLD tbyte [abs] = DB 2D abs32
        assert!(contains(&code, &[0xDB, 0x2D, bias1[0], bias1[1], bias1[2], bias1[3]]));
        assert!(contains(&code, &[0xDB, 0x2D, bias2[0], bias2[1], bias2[2], bias2[3]]));
        let plain = generate(Bytecode::Dadd).into_code();
        assert!(!contains(&plain, &[0xDB, 0x2D]));
    }

    #[test]
    fn test_every_conversion_generates() {
        for bc in [
            Bytecode::I2l,
            Bytecode::I2f,
            Bytecode::I2d,
            Bytecode::L2i,
            Bytecode::L2f,
            Bytecode::L2d,
            Bytecode::F2i,
            Bytecode::F2l,
            Bytecode::F2d,
            Bytecode::D2i,
            Bytecode::D2l,
            Bytecode::D2f,
            Bytecode::I2b,
            Bytecode::I2c,
            Bytecode::I2s,
        ] {
            generate_with(&RuntimeConfig::default(), bc, false)
                .unwrap_or_else(|e| panic!("{bc}: {e}"));
        }
    }

    #[test]
    fn test_d2i_goes_through_runtime() {
        let buf = generate(Bytecode::D2i);
        let entry = context(&RuntimeConfig::default()).entry(RuntimeEntry::D2i);
        assert!(buf.relocations().iter().any(|r| r.target == entry));
    }

    #[test]
    fn test_comparisons_balance_fpu_stack() {
        for bc in [Bytecode::Fcmpl, Bytecode::Fcmpg, Bytecode::Dcmpl, Bytecode::Dcmpg, Bytecode::Lcmp] {
            generate_with(&RuntimeConfig::default(), bc, false)
                .unwrap_or_else(|e| panic!("{bc}: {e}"));
        }
        let code = generate(Bytecode::Fcmpl).into_code();
        // FLD dword [ESP] = D9 04 24 ; POP ECX = 59 ; FUCOMIP ST1 = DF E9
        assert_eq!(&code[..6], &[0xD9, 0x04, 0x24, 0x59, 0xDF, 0xE9]);
    }
}
