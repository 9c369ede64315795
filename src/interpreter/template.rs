//! The template table: one code generator per bytecode.
//!
//! A template names the TOS state its code expects on entry, the state it
//! leaves behind, and the generator that emits it. Entries for the other
//! input states are derived when the dispatch table is built.

use serde::Serialize;

use super::masm::InterpreterMacroAssembler;
use super::templates::{arith, control, fields, invoke, loads, objects};
use crate::asm::Cond;
use crate::error::VmResult;
use crate::runtime::basic_type::TosState;
use crate::runtime::bytecodes::{Bytecode, DISPATCH_LENGTH};

/// Template flags.
pub mod flag {
    /// Reads operands through the bcp
    pub const USES_BCP: u8 = 1 << 0;
    /// Dispatches on its own instead of falling into `dispatch_next`
    pub const DOES_DISPATCH: u8 = 1 << 1;
    pub const CALLS_VM: u8 = 1 << 2;
    /// Generator for the `wide` form
    pub const WIDE: u8 = 1 << 3;
}

const NONE: u8 = 0;
const UBCP: u8 = flag::USES_BCP;
const DISP: u8 = flag::DOES_DISPATCH;
const CLVM: u8 = flag::CALLS_VM;
const ISWD: u8 = flag::WIDE;

/// Binary operations shared by the arithmetic templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operation {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

/// Branch conditions of the `if*` templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Condition {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl Condition {
    /// Condition code that skips the branch.
    pub fn not_taken(self) -> Cond {
        match self {
            Condition::Equal => Cond::Ne,
            Condition::NotEqual => Cond::E,
            Condition::Less => Cond::Ge,
            Condition::LessEqual => Cond::G,
            Condition::Greater => Cond::Le,
            Condition::GreaterEqual => Cond::L,
        }
    }
}

/// Argument handed to a generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TemplateArg {
    None,
    Int(i32),
    State(TosState),
    Op(Operation),
    Cond(Condition),
    Bool(bool),
}

impl TemplateArg {
    pub fn int(self) -> i32 {
        match self {
            TemplateArg::Int(v) => v,
            _ => 0,
        }
    }

    pub fn state(self) -> TosState {
        match self {
            TemplateArg::State(s) => s,
            _ => TosState::Vtos,
        }
    }

    pub fn op(self) -> Operation {
        match self {
            TemplateArg::Op(op) => op,
            _ => Operation::Add,
        }
    }

    pub fn cond(self) -> Condition {
        match self {
            TemplateArg::Cond(c) => c,
            _ => Condition::Equal,
        }
    }

    pub fn flag(self) -> bool {
        matches!(self, TemplateArg::Bool(true))
    }
}

pub type Generator = fn(&mut InterpreterMacroAssembler<'_>, TemplateArg) -> VmResult<()>;

#[derive(Clone, Copy)]
pub struct Template {
    pub bytecode: Bytecode,
    pub flags: u8,
    pub tos_in: TosState,
    pub tos_out: TosState,
    pub generator: Generator,
    pub arg: TemplateArg,
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("bytecode", &self.bytecode)
            .field("flags", &self.flags)
            .field("tos_in", &self.tos_in)
            .field("tos_out", &self.tos_out)
            .field("arg", &self.arg)
            .finish()
    }
}

impl Template {
    pub fn uses_bcp(&self) -> bool {
        self.flags & flag::USES_BCP != 0
    }

    pub fn does_dispatch(&self) -> bool {
        self.flags & flag::DOES_DISPATCH != 0
    }

    pub fn calls_vm(&self) -> bool {
        self.flags & flag::CALLS_VM != 0
    }

    pub fn is_wide(&self) -> bool {
        self.flags & flag::WIDE != 0
    }

    /// Emit the template body.
    pub fn generate(&self, masm: &mut InterpreterMacroAssembler<'_>) -> VmResult<()> {
        masm.set_bytecode(self.bytecode);
        (self.generator)(masm, self.arg)
    }
}

/// Template description for listings.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateInfo {
    pub code: u8,
    pub name: &'static str,
    pub wide: bool,
    pub tos_in: &'static str,
    pub tos_out: &'static str,
    pub uses_bcp: bool,
    pub does_dispatch: bool,
    pub calls_vm: bool,
    pub arg: TemplateArg,
}

impl From<&Template> for TemplateInfo {
    fn from(t: &Template) -> Self {
        Self {
            code: t.bytecode.code(),
            name: t.bytecode.name(),
            wide: t.is_wide(),
            tos_in: t.tos_in.name(),
            tos_out: t.tos_out.name(),
            uses_bcp: t.uses_bcp(),
            does_dispatch: t.does_dispatch(),
            calls_vm: t.calls_vm(),
            arg: t.arg,
        }
    }
}

/// Templates indexed by opcode, plus the `wide` forms.
pub struct TemplateTable {
    normal: [Option<Template>; DISPATCH_LENGTH],
    wide: [Option<Template>; DISPATCH_LENGTH],
}

impl Default for TemplateTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateTable {
    pub fn template_for(&self, bytecode: Bytecode) -> Option<&Template> {
        self.normal[bytecode.code() as usize].as_ref()
    }

    pub fn template_for_wide(&self, bytecode: Bytecode) -> Option<&Template> {
        self.wide[bytecode.code() as usize].as_ref()
    }

    pub fn templates(&self) -> impl Iterator<Item = &Template> {
        self.normal.iter().flatten()
    }

    pub fn wide_templates(&self) -> impl Iterator<Item = &Template> {
        self.wide.iter().flatten()
    }

    pub fn infos(&self) -> Vec<TemplateInfo> {
        self.templates()
            .chain(self.wide_templates())
            .map(TemplateInfo::from)
            .collect()
    }

    fn def(
        &mut self,
        bytecode: Bytecode,
        flags: u8,
        tos_in: TosState,
        tos_out: TosState,
        generator: Generator,
        arg: TemplateArg,
    ) {
        let slot = if flags & flag::WIDE != 0 {
            &mut self.wide[bytecode.code() as usize]
        } else {
            &mut self.normal[bytecode.code() as usize]
        };
        debug_assert!(slot.is_none(), "{bytecode} defined twice");
        *slot = Some(Template {
            bytecode,
            flags,
            tos_in,
            tos_out,
            generator,
            arg,
        });
    }

    pub fn new() -> Self {
        use Bytecode as B;
        use TemplateArg::{Bool, Cond as C, Int, None as No, Op, State};
        use TosState::*;

        let mut t = Self {
            normal: [None; DISPATCH_LENGTH],
            wide: [None; DISPATCH_LENGTH],
        };

        // Constants
        t.def(B::Nop, NONE, Vtos, Vtos, loads::nop, No);
        t.def(B::AconstNull, NONE, Vtos, Atos, loads::aconst_null, No);
        for (bc, v) in [
            (B::IconstM1, -1),
            (B::Iconst0, 0),
            (B::Iconst1, 1),
            (B::Iconst2, 2),
            (B::Iconst3, 3),
            (B::Iconst4, 4),
            (B::Iconst5, 5),
        ] {
            t.def(bc, NONE, Vtos, Itos, loads::iconst, Int(v));
        }
        t.def(B::Lconst0, NONE, Vtos, Ltos, loads::lconst, Int(0));
        t.def(B::Lconst1, NONE, Vtos, Ltos, loads::lconst, Int(1));
        t.def(B::Fconst0, NONE, Vtos, Ftos, loads::fconst, Int(0));
        t.def(B::Fconst1, NONE, Vtos, Ftos, loads::fconst, Int(1));
        t.def(B::Fconst2, NONE, Vtos, Ftos, loads::fconst, Int(2));
        t.def(B::Dconst0, NONE, Vtos, Dtos, loads::dconst, Int(0));
        t.def(B::Dconst1, NONE, Vtos, Dtos, loads::dconst, Int(1));
        t.def(B::Bipush, UBCP, Vtos, Itos, loads::bipush, No);
        t.def(B::Sipush, UBCP, Vtos, Itos, loads::sipush, No);
        t.def(B::Ldc, UBCP | CLVM, Vtos, Vtos, loads::ldc, Bool(false));
        t.def(B::LdcW, UBCP | CLVM, Vtos, Vtos, loads::ldc, Bool(true));
        t.def(B::Ldc2W, UBCP, Vtos, Vtos, loads::ldc2_w, No);

        // Local loads
        t.def(B::Iload, UBCP | CLVM, Vtos, Itos, loads::iload, No);
        t.def(B::Lload, UBCP, Vtos, Ltos, loads::lload, No);
        t.def(B::Fload, UBCP, Vtos, Ftos, loads::fload, No);
        t.def(B::Dload, UBCP, Vtos, Dtos, loads::dload, No);
        t.def(B::Aload, UBCP | CLVM, Vtos, Atos, loads::aload, No);
        let quads = |first: Bytecode| (0..4).filter_map(move |n| Bytecode::from_u8(first.code() + n).map(|b| (b, n as i32)));
        for (bc, n) in quads(B::Iload0) {
            t.def(bc, NONE, Vtos, Itos, loads::iload_n, Int(n));
        }
        for (bc, n) in quads(B::Lload0) {
            t.def(bc, NONE, Vtos, Ltos, loads::lload_n, Int(n));
        }
        for (bc, n) in quads(B::Fload0) {
            t.def(bc, NONE, Vtos, Ftos, loads::fload_n, Int(n));
        }
        for (bc, n) in quads(B::Dload0) {
            t.def(bc, NONE, Vtos, Dtos, loads::dload_n, Int(n));
        }
        t.def(B::Aload0, UBCP | CLVM, Vtos, Atos, loads::aload_0, No);
        for (bc, n) in quads(B::Aload0).skip(1) {
            t.def(bc, NONE, Vtos, Atos, loads::aload_n, Int(n));
        }

        // Array loads
        t.def(B::Iaload, NONE, Itos, Itos, loads::iaload, No);
        t.def(B::Laload, NONE, Itos, Ltos, loads::laload, No);
        t.def(B::Faload, NONE, Itos, Ftos, loads::faload, No);
        t.def(B::Daload, NONE, Itos, Dtos, loads::daload, No);
        t.def(B::Aaload, NONE, Itos, Atos, loads::aaload, No);
        t.def(B::Baload, NONE, Itos, Itos, loads::baload, No);
        t.def(B::Caload, NONE, Itos, Itos, loads::caload, No);
        t.def(B::Saload, NONE, Itos, Itos, loads::saload, No);

        // Local stores
        t.def(B::Istore, UBCP, Itos, Vtos, loads::istore, No);
        t.def(B::Lstore, UBCP, Ltos, Vtos, loads::lstore, No);
        t.def(B::Fstore, UBCP, Ftos, Vtos, loads::fstore, No);
        t.def(B::Dstore, UBCP, Dtos, Vtos, loads::dstore, No);
        t.def(B::Astore, UBCP | CLVM, Vtos, Vtos, loads::astore, No);
        for (bc, n) in quads(B::Istore0) {
            t.def(bc, NONE, Itos, Vtos, loads::istore_n, Int(n));
        }
        for (bc, n) in quads(B::Lstore0) {
            t.def(bc, NONE, Ltos, Vtos, loads::lstore_n, Int(n));
        }
        for (bc, n) in quads(B::Fstore0) {
            t.def(bc, NONE, Ftos, Vtos, loads::fstore_n, Int(n));
        }
        for (bc, n) in quads(B::Dstore0) {
            t.def(bc, NONE, Dtos, Vtos, loads::dstore_n, Int(n));
        }
        for (bc, n) in quads(B::Astore0) {
            t.def(bc, NONE, Vtos, Vtos, loads::astore_n, Int(n));
        }

        // Array stores
        t.def(B::Iastore, NONE, Itos, Vtos, loads::iastore, No);
        t.def(B::Lastore, NONE, Ltos, Vtos, loads::lastore, No);
        t.def(B::Fastore, NONE, Ftos, Vtos, loads::fastore, No);
        t.def(B::Dastore, NONE, Dtos, Vtos, loads::dastore, No);
        t.def(B::Aastore, CLVM, Vtos, Vtos, loads::aastore, No);
        t.def(B::Bastore, NONE, Itos, Vtos, loads::bastore, No);
        t.def(B::Castore, NONE, Itos, Vtos, loads::castore, No);
        t.def(B::Sastore, NONE, Itos, Vtos, loads::castore, No);

        // Stack
        t.def(B::Pop, NONE, Vtos, Vtos, loads::pop, No);
        t.def(B::Pop2, NONE, Vtos, Vtos, loads::pop2, No);
        t.def(B::Dup, NONE, Vtos, Vtos, loads::dup, No);
        t.def(B::DupX1, NONE, Vtos, Vtos, loads::dup_x1, No);
        t.def(B::DupX2, NONE, Vtos, Vtos, loads::dup_x2, No);
        t.def(B::Dup2, NONE, Vtos, Vtos, loads::dup2, No);
        t.def(B::Dup2X1, NONE, Vtos, Vtos, loads::dup2_x1, No);
        t.def(B::Dup2X2, NONE, Vtos, Vtos, loads::dup2_x2, No);
        t.def(B::Swap, NONE, Vtos, Vtos, loads::swap, No);

        // Arithmetic
        use Operation as O;
        for (bc, op) in [
            (B::Iadd, O::Add),
            (B::Isub, O::Sub),
            (B::Imul, O::Mul),
            (B::Iand, O::And),
            (B::Ior, O::Or),
            (B::Ixor, O::Xor),
            (B::Ishl, O::Shl),
            (B::Ishr, O::Shr),
            (B::Iushr, O::Ushr),
        ] {
            t.def(bc, NONE, Itos, Itos, arith::iop2, Op(op));
        }
        for (bc, op) in [
            (B::Ladd, O::Add),
            (B::Lsub, O::Sub),
            (B::Land, O::And),
            (B::Lor, O::Or),
            (B::Lxor, O::Xor),
        ] {
            t.def(bc, NONE, Ltos, Ltos, arith::lop2, Op(op));
        }
        t.def(B::Idiv, NONE, Itos, Itos, arith::idiv, No);
        t.def(B::Irem, NONE, Itos, Itos, arith::irem, No);
        t.def(B::Lmul, NONE, Ltos, Ltos, arith::lmul, No);
        t.def(B::Ldiv, NONE, Ltos, Ltos, arith::ldiv, No);
        t.def(B::Lrem, NONE, Ltos, Ltos, arith::lrem, No);
        for (bc, op) in [
            (B::Fadd, O::Add),
            (B::Fsub, O::Sub),
            (B::Fmul, O::Mul),
            (B::Fdiv, O::Div),
            (B::Frem, O::Rem),
        ] {
            t.def(bc, NONE, Ftos, Ftos, arith::fop2, Op(op));
        }
        for (bc, op) in [
            (B::Dadd, O::Add),
            (B::Dsub, O::Sub),
            (B::Dmul, O::Mul),
            (B::Ddiv, O::Div),
            (B::Drem, O::Rem),
        ] {
            t.def(bc, NONE, Dtos, Dtos, arith::dop2, Op(op));
        }
        t.def(B::Ineg, NONE, Itos, Itos, arith::ineg, No);
        t.def(B::Lneg, NONE, Ltos, Ltos, arith::lneg, No);
        t.def(B::Fneg, NONE, Ftos, Ftos, arith::fneg, No);
        t.def(B::Dneg, NONE, Dtos, Dtos, arith::dneg, No);
        t.def(B::Lshl, NONE, Itos, Ltos, arith::lshl, No);
        t.def(B::Lshr, NONE, Itos, Ltos, arith::lshr, No);
        t.def(B::Lushr, NONE, Itos, Ltos, arith::lushr, No);
        t.def(B::Iinc, UBCP | CLVM, Vtos, Vtos, loads::iinc, No);

        // Conversions
        for (bc, tin, tout) in [
            (B::I2l, Itos, Ltos),
            (B::I2f, Itos, Ftos),
            (B::I2d, Itos, Dtos),
            (B::L2i, Ltos, Itos),
            (B::L2f, Ltos, Ftos),
            (B::L2d, Ltos, Dtos),
            (B::F2i, Ftos, Itos),
            (B::F2l, Ftos, Ltos),
            (B::F2d, Ftos, Dtos),
            (B::D2i, Dtos, Itos),
            (B::D2l, Dtos, Ltos),
            (B::D2f, Dtos, Ftos),
            (B::I2b, Itos, Itos),
            (B::I2c, Itos, Itos),
            (B::I2s, Itos, Itos),
        ] {
            t.def(bc, NONE, tin, tout, arith::convert, No);
        }

        // Comparisons
        t.def(B::Lcmp, NONE, Ltos, Itos, arith::lcmp, No);
        t.def(B::Fcmpl, NONE, Ftos, Itos, arith::float_cmp, Int(-1));
        t.def(B::Fcmpg, NONE, Ftos, Itos, arith::float_cmp, Int(1));
        t.def(B::Dcmpl, NONE, Dtos, Itos, arith::double_cmp, Int(-1));
        t.def(B::Dcmpg, NONE, Dtos, Itos, arith::double_cmp, Int(1));

        // Branches
        use Condition as K;
        let conds = [
            K::Equal,
            K::NotEqual,
            K::Less,
            K::GreaterEqual,
            K::Greater,
            K::LessEqual,
        ];
        for (i, c) in conds.into_iter().enumerate() {
            let zero = Bytecode::from_u8(B::Ifeq.code() + i as u8);
            let icmp = Bytecode::from_u8(B::IfIcmpeq.code() + i as u8);
            if let (Some(zero), Some(icmp)) = (zero, icmp) {
                t.def(zero, UBCP | CLVM, Itos, Vtos, control::if_0cmp, C(c));
                t.def(icmp, UBCP | CLVM, Itos, Vtos, control::if_icmp, C(c));
            }
        }
        t.def(B::IfAcmpeq, UBCP | CLVM, Atos, Vtos, control::if_acmp, C(K::Equal));
        t.def(B::IfAcmpne, UBCP | CLVM, Atos, Vtos, control::if_acmp, C(K::NotEqual));
        t.def(B::Ifnull, UBCP | CLVM, Atos, Vtos, control::if_nullcmp, C(K::Equal));
        t.def(B::Ifnonnull, UBCP | CLVM, Atos, Vtos, control::if_nullcmp, C(K::NotEqual));
        t.def(B::Goto, UBCP | DISP | CLVM, Vtos, Vtos, control::goto_, No);
        t.def(B::GotoW, UBCP | DISP | CLVM, Vtos, Vtos, control::goto_w, No);
        t.def(B::Jsr, UBCP | DISP, Vtos, Vtos, control::jsr, No);
        t.def(B::JsrW, UBCP | DISP, Vtos, Vtos, control::jsr_w, No);
        t.def(B::Ret, UBCP | DISP, Vtos, Vtos, control::ret, No);
        t.def(B::Tableswitch, UBCP | DISP, Itos, Vtos, control::tableswitch, No);
        t.def(B::Lookupswitch, UBCP | DISP, Itos, Itos, control::lookupswitch, No);
        t.def(B::FastLinearswitch, UBCP | DISP, Itos, Vtos, control::fast_linearswitch, No);
        t.def(B::FastBinaryswitch, UBCP | DISP, Itos, Vtos, control::fast_binaryswitch, No);

        // Returns
        for (bc, s) in [
            (B::Ireturn, Itos),
            (B::Lreturn, Ltos),
            (B::Freturn, Ftos),
            (B::Dreturn, Dtos),
            (B::Areturn, Atos),
            (B::Return, Vtos),
        ] {
            t.def(bc, DISP | CLVM, s, s, control::return_, State(s));
        }
        t.def(B::ReturnRegisterFinalizer, DISP | CLVM, Vtos, Vtos, control::return_, State(Vtos));

        // Fields
        t.def(B::Getstatic, UBCP | CLVM, Vtos, Vtos, fields::getstatic, Int(1));
        t.def(B::Putstatic, UBCP | CLVM, Vtos, Vtos, fields::putstatic, Int(2));
        t.def(B::Getfield, UBCP | CLVM, Vtos, Vtos, fields::getfield, Int(1));
        t.def(B::Putfield, UBCP | CLVM, Vtos, Vtos, fields::putfield, Int(2));

        // Invokes
        t.def(B::Invokevirtual, UBCP | DISP | CLVM, Vtos, Vtos, invoke::invokevirtual, Int(2));
        t.def(B::Invokespecial, UBCP | DISP | CLVM, Vtos, Vtos, invoke::invokespecial, Int(1));
        t.def(B::Invokestatic, UBCP | DISP | CLVM, Vtos, Vtos, invoke::invokestatic, Int(1));
        t.def(B::Invokeinterface, UBCP | DISP | CLVM, Vtos, Vtos, invoke::invokeinterface, Int(1));
        t.def(B::Invokedynamic, UBCP | DISP | CLVM, Vtos, Vtos, invoke::invokedynamic, Int(1));
        t.def(B::Invokehandle, UBCP | DISP | CLVM, Vtos, Vtos, invoke::invokehandle, Int(1));
        t.def(B::FastInvokevfinal, UBCP | DISP | CLVM, Vtos, Vtos, invoke::fast_invokevfinal, Int(2));

        // Objects
        t.def(B::New, UBCP | CLVM, Vtos, Atos, objects::new, No);
        t.def(B::Newarray, UBCP | CLVM, Itos, Atos, objects::newarray, No);
        t.def(B::Anewarray, UBCP | CLVM, Itos, Atos, objects::anewarray, No);
        t.def(B::Multianewarray, UBCP | CLVM, Vtos, Atos, objects::multianewarray, No);
        t.def(B::Arraylength, NONE, Atos, Itos, objects::arraylength, No);
        t.def(B::Athrow, DISP, Atos, Vtos, objects::athrow, No);
        t.def(B::Checkcast, UBCP | CLVM, Atos, Atos, objects::checkcast, No);
        t.def(B::Instanceof, UBCP | CLVM, Atos, Itos, objects::instanceof, No);
        t.def(B::Monitorenter, DISP | CLVM, Atos, Vtos, objects::monitorenter, No);
        t.def(B::Monitorexit, CLVM, Atos, Vtos, objects::monitorexit, No);

        // Prefixes and specials
        t.def(B::Wide, UBCP | DISP, Vtos, Vtos, control::wide, No);
        t.def(B::Breakpoint, UBCP | DISP | CLVM, Vtos, Vtos, control::breakpoint, No);
        t.def(B::Shouldnotreachhere, NONE, Vtos, Vtos, control::shouldnotreachhere, No);

        // Wide forms
        t.def(B::Iload, UBCP | ISWD, Vtos, Itos, loads::wide_iload, No);
        t.def(B::Lload, UBCP | ISWD, Vtos, Ltos, loads::wide_lload, No);
        t.def(B::Fload, UBCP | ISWD, Vtos, Ftos, loads::wide_fload, No);
        t.def(B::Dload, UBCP | ISWD, Vtos, Dtos, loads::wide_dload, No);
        t.def(B::Aload, UBCP | ISWD, Vtos, Atos, loads::wide_aload, No);
        t.def(B::Istore, UBCP | ISWD, Vtos, Vtos, loads::wide_istore, No);
        t.def(B::Lstore, UBCP | ISWD, Vtos, Vtos, loads::wide_lstore, No);
        t.def(B::Fstore, UBCP | ISWD, Vtos, Vtos, loads::wide_fstore, No);
        t.def(B::Dstore, UBCP | ISWD, Vtos, Vtos, loads::wide_dstore, No);
        t.def(B::Astore, UBCP | ISWD, Vtos, Vtos, loads::wide_astore, No);
        t.def(B::Iinc, UBCP | CLVM | ISWD, Vtos, Vtos, loads::wide_iinc, No);
        t.def(B::Ret, UBCP | DISP | ISWD, Vtos, Vtos, control::wide_ret, No);

        // Quickened forms
        t.def(B::FastAgetfield, UBCP, Atos, Atos, fields::fast_accessfield, State(Atos));
        t.def(B::FastBgetfield, UBCP, Atos, Itos, fields::fast_accessfield, State(Btos));
        t.def(B::FastCgetfield, UBCP, Atos, Itos, fields::fast_accessfield, State(Ctos));
        t.def(B::FastDgetfield, UBCP, Atos, Dtos, fields::fast_accessfield, State(Dtos));
        t.def(B::FastFgetfield, UBCP, Atos, Ftos, fields::fast_accessfield, State(Ftos));
        t.def(B::FastIgetfield, UBCP, Atos, Itos, fields::fast_accessfield, State(Itos));
        t.def(B::FastLgetfield, UBCP, Atos, Ltos, fields::fast_accessfield, State(Ltos));
        t.def(B::FastSgetfield, UBCP, Atos, Itos, fields::fast_accessfield, State(Stos));
        t.def(B::FastAputfield, UBCP, Atos, Vtos, fields::fast_storefield, State(Atos));
        t.def(B::FastBputfield, UBCP, Itos, Vtos, fields::fast_storefield, State(Btos));
        t.def(B::FastZputfield, UBCP, Itos, Vtos, fields::fast_storefield, State(Ztos));
        t.def(B::FastCputfield, UBCP, Itos, Vtos, fields::fast_storefield, State(Ctos));
        t.def(B::FastDputfield, UBCP, Dtos, Vtos, fields::fast_storefield, State(Dtos));
        t.def(B::FastFputfield, UBCP, Ftos, Vtos, fields::fast_storefield, State(Ftos));
        t.def(B::FastIputfield, UBCP, Itos, Vtos, fields::fast_storefield, State(Itos));
        t.def(B::FastLputfield, UBCP, Ltos, Vtos, fields::fast_storefield, State(Ltos));
        t.def(B::FastSputfield, UBCP, Itos, Vtos, fields::fast_storefield, State(Stos));
        t.def(B::FastAload0, UBCP, Vtos, Atos, loads::aload_n, Int(0));
        t.def(B::FastIaccess0, UBCP, Vtos, Itos, fields::fast_xaccess, State(Itos));
        t.def(B::FastAaccess0, UBCP, Vtos, Atos, fields::fast_xaccess, State(Atos));
        t.def(B::FastFaccess0, UBCP, Vtos, Ftos, fields::fast_xaccess, State(Ftos));
        t.def(B::FastIload, UBCP, Vtos, Itos, loads::fast_iload, No);
        t.def(B::FastIload2, UBCP, Vtos, Itos, loads::fast_iload2, No);
        t.def(B::FastIcaload, UBCP, Vtos, Itos, loads::fast_icaload, No);
        t.def(B::FastAldc, UBCP | CLVM, Vtos, Atos, loads::fast_aldc, Bool(false));
        t.def(B::FastAldcW, UBCP | CLVM, Vtos, Atos, loads::fast_aldc, Bool(true));

        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_bytecode_has_a_template() {
        let table = TemplateTable::new();
        for &bc in Bytecode::ALL {
            assert!(table.template_for(bc).is_some(), "{bc} has no template");
        }
    }

    #[test]
    fn test_wide_templates_match_wideable_bytecodes() {
        let table = TemplateTable::new();
        for &bc in Bytecode::ALL {
            assert_eq!(
                table.template_for_wide(bc).is_some(),
                bc.wide_length() > 0,
                "{bc}"
            );
        }
        assert!(table.wide_templates().all(|t| t.is_wide() && t.uses_bcp()));
    }

    #[test]
    fn test_states_of_representative_templates() {
        let table = TemplateTable::new();
        let t = table.template_for(Bytecode::IfIcmplt).unwrap();
        assert_eq!((t.tos_in, t.tos_out), (TosState::Itos, TosState::Vtos));
        assert_eq!(t.arg, TemplateArg::Cond(Condition::Less));
        let t = table.template_for(Bytecode::Lshl).unwrap();
        assert_eq!((t.tos_in, t.tos_out), (TosState::Itos, TosState::Ltos));
        let t = table.template_for(Bytecode::Dreturn).unwrap();
        assert!(t.does_dispatch());
        assert_eq!(t.tos_in, TosState::Dtos);
        let t = table.template_for(Bytecode::FastBgetfield).unwrap();
        assert_eq!(t.arg, TemplateArg::State(TosState::Btos));
    }

    #[test]
    fn test_variable_length_templates_dispatch_themselves() {
        let table = TemplateTable::new();
        for t in table.templates() {
            if t.bytecode.length() == 0 {
                assert!(t.does_dispatch(), "{}", t.bytecode);
            }
        }
    }

    #[test]
    fn test_conditions_invert() {
        assert_eq!(Condition::Less.not_taken(), Cond::Ge);
        assert_eq!(Condition::GreaterEqual.not_taken(), Cond::L);
    }
}
