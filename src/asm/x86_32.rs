//! IA-32 instruction encoding.
//!
//! This module encodes the subset of 32-bit x86 used by the stub generator
//! and the template table: integer, x87, SSE/SSE2, AVX2 moves, AES-NI,
//! PCLMULQDQ and MMX. The assembler also tracks the depth of the x87
//! register stack so that template boundaries can be checked.

use super::codebuf::{CodeBuffer, Label, ReferenceSize, RelocKind};
use crate::error::{VmError, VmResult};

/// IA-32 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Eax = 0, // Return value, tos for itos/atos
    Ecx = 1, // Cache / receiver
    Edx = 2, // High word of ltos
    Ebx = 3, // Method at calls, dispatch index
    Esp = 4, // Expression stack top
    Ebp = 5, // Frame pointer
    Esi = 6, // bcp
    Edi = 7, // Locals
}

impl Reg {
    /// Get the register code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Registers with an addressable low byte (AL, CL, DL, BL).
    pub fn has_byte_register(self) -> bool {
        (self as u8) < 4
    }
}

/// SSE registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
}

impl Xmm {
    /// Get the register code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// MMX registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mmx {
    Mm0 = 0,
    Mm1 = 1,
}

/// x86 condition codes (for Jcc, SETcc, CMOVcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,  // Overflow
    No = 0x1, // Not overflow
    B = 0x2,  // Below (unsigned <)
    Ae = 0x3, // Above or equal (unsigned >=)
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
    Be = 0x6, // Below or equal (unsigned <=)
    A = 0x7,  // Above (unsigned >)
    S = 0x8,  // Sign (negative)
    Ns = 0x9, // Not sign (non-negative)
    P = 0xA,  // Parity even (unordered after fucomip)
    Np = 0xB, // Parity odd
    L = 0xC,  // Less (signed <)
    Ge = 0xD, // Greater or equal (signed >=)
    Le = 0xE, // Less or equal (signed <=)
    G = 0xF,  // Greater (signed >)
}

impl Cond {
    /// Invert the condition.
    pub fn invert(self) -> Self {
        match self {
            Cond::O => Cond::No,
            Cond::No => Cond::O,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::S => Cond::Ns,
            Cond::Ns => Cond::S,
            Cond::P => Cond::Np,
            Cond::Np => Cond::P,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }
}

/// SIB scale factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Scale {
    Times1 = 0,
    Times2 = 1,
    Times4 = 2,
    Times8 = 3,
}

impl Scale {
    /// Scale for a log2 element size.
    pub fn from_log2(log2: u32) -> Self {
        match log2 {
            0 => Scale::Times1,
            1 => Scale::Times2,
            2 => Scale::Times4,
            _ => Scale::Times8,
        }
    }

    /// Log2 of the scale.
    pub fn log2(self) -> u32 {
        self as u32
    }
}

/// Scale of a pointer-sized element.
pub const TIMES_PTR: Scale = Scale::Times4;

/// Operand size for string instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSize {
    Byte,
    Word,
    Dword,
}

/// A memory operand `[base + index*scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    base: Option<Reg>,
    index: Option<Reg>,
    scale: Scale,
    disp: i32,
}

impl Address {
    /// `[base + disp]`
    pub fn new(base: Reg, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: Scale::Times1,
            disp,
        }
    }

    /// `[base + index*scale + disp]`
    pub fn indexed(base: Reg, index: Reg, scale: Scale, disp: i32) -> Self {
        debug_assert!(index != Reg::Esp, "esp cannot be an index");
        Self {
            base: Some(base),
            index: Some(index),
            scale,
            disp,
        }
    }

    /// `[index*scale + disp32]`
    pub fn index_only(index: Reg, scale: Scale, disp: i32) -> Self {
        debug_assert!(index != Reg::Esp, "esp cannot be an index");
        Self {
            base: None,
            index: Some(index),
            scale,
            disp,
        }
    }

    /// Absolute address `[disp32]`.
    pub fn absolute(addr: u32) -> Self {
        Self {
            base: None,
            index: None,
            scale: Scale::Times1,
            disp: addr as i32,
        }
    }

    /// The same operand displaced by `delta` bytes.
    pub fn plus_disp(self, delta: i32) -> Self {
        Self {
            disp: self.disp.wrapping_add(delta),
            ..self
        }
    }

    pub fn base(&self) -> Option<Reg> {
        self.base
    }

    pub fn disp(&self) -> i32 {
        self.disp
    }

    /// Whether this operand uses `reg` as base or index.
    pub fn uses(&self, reg: Reg) -> bool {
        self.base == Some(reg) || self.index == Some(reg)
    }
}

fn fits_i8(v: i32) -> bool {
    (-128..=127).contains(&v)
}

/// IA-32 assembler.
pub struct Assembler<'a> {
    buf: &'a mut CodeBuffer,
    /// Current x87 register-stack depth
    fpu_depth: i32,
}

impl<'a> Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf, fpu_depth: 0 }
    }

    /// Access the underlying buffer.
    pub fn buf(&mut self) -> &mut CodeBuffer {
        &mut *self.buf
    }

    /// Virtual address of the next instruction.
    pub fn pc(&self) -> u32 {
        self.buf.pc()
    }

    /// Offset of the next instruction.
    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    /// Create a fresh label.
    pub fn new_label(&mut self) -> Label {
        self.buf.new_label()
    }

    /// Bind a label here.
    pub fn bind(&mut self, label: Label) {
        self.buf.bind(label);
    }

    /// Pad with NOPs up to `alignment`.
    pub fn align(&mut self, alignment: usize) {
        self.buf.align(alignment);
    }

    /// Emit a raw 32-bit data word.
    pub fn emit_data32(&mut self, value: u32) {
        self.buf.emit_u32(value);
    }

    // ==================== x87 depth tracking ====================

    /// Current x87 stack depth.
    pub fn fpu_depth(&self) -> i32 {
        self.fpu_depth
    }

    /// Reset the tracked depth (control-flow joins, calls returning in ST0).
    pub fn set_fpu_depth(&mut self, depth: i32) {
        self.fpu_depth = depth;
    }

    /// Check the tracked depth against `expected`.
    pub fn expect_fpu_depth(&self, expected: i32, context: &str) -> VmResult<()> {
        if self.fpu_depth == expected {
            Ok(())
        } else {
            Err(VmError::FpuImbalance {
                context: context.to_string(),
                expected,
                found: self.fpu_depth,
            })
        }
    }

    fn fpu_push(&mut self) {
        self.fpu_depth += 1;
        debug_assert!(self.fpu_depth <= 8, "x87 stack overflow");
    }

    fn fpu_pop(&mut self) {
        self.fpu_depth -= 1;
    }

    // ==================== ModR/M helpers ====================

    /// Encode ModR/M byte.
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// Encode SIB byte.
    fn sib(scale: Scale, index: u8, base: u8) -> u8 {
        ((scale as u8) << 6) | ((index & 0x7) << 3) | (base & 0x7)
    }

    /// Emit ModR/M (+SIB, +displacement) for a memory operand.
    fn emit_operand(&mut self, reg: u8, adr: &Address) {
        match adr.base {
            None => {
                match adr.index {
                    None => self.buf.emit_u8(Self::modrm(0b00, reg, 0b101)),
                    Some(index) => {
                        self.buf.emit_u8(Self::modrm(0b00, reg, 0b100));
                        self.buf.emit_u8(Self::sib(adr.scale, index.code(), 0b101));
                    }
                }
                self.buf.emit_reloc_u32(adr.disp as u32, RelocKind::External);
            }
            Some(base) => {
                let need_sib = adr.index.is_some() || base == Reg::Esp;
                let (mode, disp_bytes) = if adr.disp == 0 && base != Reg::Ebp {
                    (0b00, 0)
                } else if fits_i8(adr.disp) {
                    (0b01, 1)
                } else {
                    (0b10, 4)
                };
                if need_sib {
                    self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                    let index = adr.index.map(Reg::code).unwrap_or(0b100);
                    self.buf.emit_u8(Self::sib(adr.scale, index, base.code()));
                } else {
                    self.buf.emit_u8(Self::modrm(mode, reg, base.code()));
                }
                match disp_bytes {
                    1 => self.buf.emit_u8(adr.disp as i8 as u8),
                    4 => self.buf.emit_i32(adr.disp),
                    _ => {}
                }
            }
        }
    }

    fn emit_rr(&mut self, opcode: u8, reg: u8, rm: u8) {
        self.buf.emit_u8(opcode);
        self.buf.emit_u8(Self::modrm(0b11, reg, rm));
    }

    fn emit_rm(&mut self, opcode: u8, reg: u8, adr: &Address) {
        self.buf.emit_u8(opcode);
        self.emit_operand(reg, adr);
    }

    fn emit_0f_rr(&mut self, opcode: u8, reg: u8, rm: u8) {
        self.buf.emit_u8(0x0F);
        self.emit_rr(opcode, reg, rm);
    }

    fn emit_0f_rm(&mut self, opcode: u8, reg: u8, adr: &Address) {
        self.buf.emit_u8(0x0F);
        self.emit_rm(opcode, reg, adr);
    }

    // ==================== Data Movement ====================

    /// MOV r32, r32
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rr(0x89, src.code(), dst.code());
    }

    /// MOV r32, imm32
    pub fn mov_ri(&mut self, dst: Reg, imm: i32) {
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_i32(imm);
    }

    /// MOV r32, imm32 where the immediate is an address
    pub fn mov_raddr(&mut self, dst: Reg, addr: u32) {
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_reloc_u32(addr, RelocKind::External);
    }

    /// MOV r32, imm32 holding the address of a label in this buffer
    pub fn mov_rlabel(&mut self, dst: Reg, label: Label) {
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_label_ref(label, ReferenceSize::Abs32);
    }

    /// MOV r32, [mem]
    pub fn mov_rm(&mut self, dst: Reg, adr: Address) {
        self.emit_rm(0x8B, dst.code(), &adr);
    }

    /// MOV [mem], r32
    pub fn mov_mr(&mut self, adr: Address, src: Reg) {
        self.emit_rm(0x89, src.code(), &adr);
    }

    /// MOV [mem], imm32
    pub fn mov_mi(&mut self, adr: Address, imm: i32) {
        self.emit_rm(0xC7, 0, &adr);
        self.buf.emit_i32(imm);
    }

    /// MOV byte [mem], r8
    pub fn movb_mr(&mut self, adr: Address, src: Reg) {
        debug_assert!(src.has_byte_register());
        self.emit_rm(0x88, src.code(), &adr);
    }

    /// MOV byte [mem], imm8
    pub fn movb_mi(&mut self, adr: Address, imm: u8) {
        self.emit_rm(0xC6, 0, &adr);
        self.buf.emit_u8(imm);
    }

    /// MOV word [mem], r16
    pub fn movw_mr(&mut self, adr: Address, src: Reg) {
        self.buf.emit_u8(0x66);
        self.emit_rm(0x89, src.code(), &adr);
    }

    /// MOVZX r32, byte [mem]
    pub fn movzxb_rm(&mut self, dst: Reg, adr: Address) {
        self.emit_0f_rm(0xB6, dst.code(), &adr);
    }

    /// MOVZX r32, r8
    pub fn movzxb_rr(&mut self, dst: Reg, src: Reg) {
        debug_assert!(src.has_byte_register());
        self.emit_0f_rr(0xB6, dst.code(), src.code());
    }

    /// MOVSX r32, byte [mem]
    pub fn movsxb_rm(&mut self, dst: Reg, adr: Address) {
        self.emit_0f_rm(0xBE, dst.code(), &adr);
    }

    /// MOVSX r32, r8
    pub fn movsxb_rr(&mut self, dst: Reg, src: Reg) {
        debug_assert!(src.has_byte_register());
        self.emit_0f_rr(0xBE, dst.code(), src.code());
    }

    /// MOVZX r32, word [mem]
    pub fn movzxw_rm(&mut self, dst: Reg, adr: Address) {
        self.emit_0f_rm(0xB7, dst.code(), &adr);
    }

    /// MOVZX r32, r16
    pub fn movzxw_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_0f_rr(0xB7, dst.code(), src.code());
    }

    /// MOVSX r32, word [mem]
    pub fn movsxw_rm(&mut self, dst: Reg, adr: Address) {
        self.emit_0f_rm(0xBF, dst.code(), &adr);
    }

    /// MOVSX r32, r16
    pub fn movsxw_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_0f_rr(0xBF, dst.code(), src.code());
    }

    /// LEA r32, [mem]
    pub fn lea(&mut self, dst: Reg, adr: Address) {
        self.emit_rm(0x8D, dst.code(), &adr);
    }

    /// XCHG r32, [mem] (implicitly locked)
    pub fn xchg_rm(&mut self, reg: Reg, adr: Address) {
        self.emit_rm(0x87, reg.code(), &adr);
    }

    /// XCHG r32, r32
    pub fn xchg_rr(&mut self, a: Reg, b: Reg) {
        self.emit_rr(0x87, a.code(), b.code());
    }

    /// CMPXCHG [mem], r32 (compares with EAX)
    pub fn cmpxchg_mr(&mut self, adr: Address, reg: Reg) {
        self.emit_0f_rm(0xB1, reg.code(), &adr);
    }

    /// LOCK prefix
    pub fn lock(&mut self) {
        self.buf.emit_u8(0xF0);
    }

    /// BSWAP r32
    pub fn bswap(&mut self, reg: Reg) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xC8 + reg.code());
    }

    /// CMOVcc r32, r32
    pub fn cmov_rr(&mut self, cc: Cond, dst: Reg, src: Reg) {
        self.emit_0f_rr(0x40 + cc as u8, dst.code(), src.code());
    }

    /// CMOVcc r32, [mem]
    pub fn cmov_rm(&mut self, cc: Cond, dst: Reg, adr: Address) {
        self.emit_0f_rm(0x40 + cc as u8, dst.code(), &adr);
    }

    /// SETcc r8
    pub fn setcc(&mut self, cc: Cond, dst: Reg) {
        debug_assert!(dst.has_byte_register());
        self.emit_0f_rr(0x90 + cc as u8, 0, dst.code());
    }

    // ==================== Stack ====================

    /// PUSH r32
    pub fn push_r(&mut self, reg: Reg) {
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP r32
    pub fn pop_r(&mut self, reg: Reg) {
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// PUSH imm (imm8 sign-extended when it fits)
    pub fn push_i(&mut self, imm: i32) {
        if fits_i8(imm) {
            self.buf.emit_u8(0x6A);
            self.buf.emit_u8(imm as i8 as u8);
        } else {
            self.buf.emit_u8(0x68);
            self.buf.emit_i32(imm);
        }
    }

    /// PUSH imm32 holding an address
    pub fn push_addr(&mut self, addr: u32) {
        self.buf.emit_u8(0x68);
        self.buf.emit_reloc_u32(addr, RelocKind::External);
    }

    /// PUSH imm32 holding the address of a label in this buffer
    pub fn push_label(&mut self, label: Label) {
        self.buf.emit_u8(0x68);
        self.buf.emit_label_ref(label, ReferenceSize::Abs32);
    }

    /// PUSH dword [mem]
    pub fn push_m(&mut self, adr: Address) {
        self.emit_rm(0xFF, 6, &adr);
    }

    /// POP dword [mem]
    pub fn pop_m(&mut self, adr: Address) {
        self.emit_rm(0x8F, 0, &adr);
    }

    /// PUSHAD
    pub fn pusha(&mut self) {
        self.buf.emit_u8(0x60);
    }

    /// POPAD
    pub fn popa(&mut self) {
        self.buf.emit_u8(0x61);
    }

    /// PUSHFD
    pub fn pushf(&mut self) {
        self.buf.emit_u8(0x9C);
    }

    /// POPFD
    pub fn popf(&mut self) {
        self.buf.emit_u8(0x9D);
    }

    /// PUSH EBP; MOV EBP, ESP
    pub fn enter(&mut self) {
        self.push_r(Reg::Ebp);
        self.mov_rr(Reg::Ebp, Reg::Esp);
    }

    /// LEAVE
    pub fn leave(&mut self) {
        self.buf.emit_u8(0xC9);
    }

    // ==================== Arithmetic / Logic ====================

    fn alu_rr(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.emit_rr(opcode, src.code(), dst.code());
    }

    fn alu_ri(&mut self, ext: u8, dst: Reg, imm: i32) {
        if fits_i8(imm) {
            self.emit_rr(0x83, ext, dst.code());
            self.buf.emit_u8(imm as i8 as u8);
        } else {
            self.emit_rr(0x81, ext, dst.code());
            self.buf.emit_i32(imm);
        }
    }

    fn alu_rm(&mut self, opcode: u8, dst: Reg, adr: Address) {
        self.emit_rm(opcode + 2, dst.code(), &adr);
    }

    fn alu_mr(&mut self, opcode: u8, adr: Address, src: Reg) {
        self.emit_rm(opcode, src.code(), &adr);
    }

    fn alu_mi(&mut self, ext: u8, adr: Address, imm: i32) {
        if fits_i8(imm) {
            self.emit_rm(0x83, ext, &adr);
            self.buf.emit_u8(imm as i8 as u8);
        } else {
            self.emit_rm(0x81, ext, &adr);
            self.buf.emit_i32(imm);
        }
    }
}

macro_rules! alu_family {
    ($($name:literal: $rr:ident, $ri:ident, $rm:ident, $mr:ident, $mi:ident = $opcode:expr, $ext:expr;)*) => {
        impl Assembler<'_> {
            $(
                #[doc = concat!($name, " r32, r32")]
                pub fn $rr(&mut self, dst: Reg, src: Reg) {
                    self.alu_rr($opcode, dst, src);
                }

                #[doc = concat!($name, " r32, imm")]
                pub fn $ri(&mut self, dst: Reg, imm: i32) {
                    self.alu_ri($ext, dst, imm);
                }

                #[doc = concat!($name, " r32, [mem]")]
                pub fn $rm(&mut self, dst: Reg, adr: Address) {
                    self.alu_rm($opcode, dst, adr);
                }

                #[doc = concat!($name, " [mem], r32")]
                pub fn $mr(&mut self, adr: Address, src: Reg) {
                    self.alu_mr($opcode, adr, src);
                }

                #[doc = concat!($name, " dword [mem], imm")]
                pub fn $mi(&mut self, adr: Address, imm: i32) {
                    self.alu_mi($ext, adr, imm);
                }
            )*
        }
    };
}

alu_family! {
    "ADD": add_rr, add_ri, add_rm, add_mr, add_mi = 0x01, 0;
    "OR":  or_rr,  or_ri,  or_rm,  or_mr,  or_mi  = 0x09, 1;
    "ADC": adc_rr, adc_ri, adc_rm, adc_mr, adc_mi = 0x11, 2;
    "SBB": sbb_rr, sbb_ri, sbb_rm, sbb_mr, sbb_mi = 0x19, 3;
    "AND": and_rr, and_ri, and_rm, and_mr, and_mi = 0x21, 4;
    "SUB": sub_rr, sub_ri, sub_rm, sub_mr, sub_mi = 0x29, 5;
    "XOR": xor_rr, xor_ri, xor_rm, xor_mr, xor_mi = 0x31, 6;
    "CMP": cmp_rr, cmp_ri, cmp_rm, cmp_mr, cmp_mi = 0x39, 7;
}

impl Assembler<'_> {
    /// TEST r32, r32
    pub fn test_rr(&mut self, a: Reg, b: Reg) {
        self.emit_rr(0x85, b.code(), a.code());
    }

    /// TEST r32, imm32
    pub fn test_ri(&mut self, reg: Reg, imm: i32) {
        if reg == Reg::Eax {
            self.buf.emit_u8(0xA9);
        } else {
            self.emit_rr(0xF7, 0, reg.code());
        }
        self.buf.emit_i32(imm);
    }

    /// TEST dword [mem], imm32
    pub fn test_mi(&mut self, adr: Address, imm: i32) {
        self.emit_rm(0xF7, 0, &adr);
        self.buf.emit_i32(imm);
    }

    /// TEST byte [mem], imm8
    pub fn testb_mi(&mut self, adr: Address, imm: u8) {
        self.emit_rm(0xF6, 0, &adr);
        self.buf.emit_u8(imm);
    }

    /// CMP byte [mem], imm8
    pub fn cmpb_mi(&mut self, adr: Address, imm: u8) {
        self.emit_rm(0x80, 7, &adr);
        self.buf.emit_u8(imm);
    }

    /// INC r32
    pub fn inc_r(&mut self, reg: Reg) {
        self.buf.emit_u8(0x40 + reg.code());
    }

    /// DEC r32
    pub fn dec_r(&mut self, reg: Reg) {
        self.buf.emit_u8(0x48 + reg.code());
    }

    /// INC dword [mem]
    pub fn inc_m(&mut self, adr: Address) {
        self.emit_rm(0xFF, 0, &adr);
    }

    /// DEC dword [mem]
    pub fn dec_m(&mut self, adr: Address) {
        self.emit_rm(0xFF, 1, &adr);
    }

    /// NEG r32
    pub fn neg_r(&mut self, reg: Reg) {
        self.emit_rr(0xF7, 3, reg.code());
    }

    /// NOT r32
    pub fn not_r(&mut self, reg: Reg) {
        self.emit_rr(0xF7, 2, reg.code());
    }

    /// IMUL r32, r32
    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_0f_rr(0xAF, dst.code(), src.code());
    }

    /// MUL r32 (EDX:EAX = EAX * r32, unsigned)
    pub fn mul_r(&mut self, src: Reg) {
        self.emit_rr(0xF7, 4, src.code());
    }

    /// IDIV r32 (EDX:EAX / r32)
    pub fn idiv_r(&mut self, src: Reg) {
        self.emit_rr(0xF7, 7, src.code());
    }

    /// CDQ (sign-extend EAX into EDX)
    pub fn cdq(&mut self) {
        self.buf.emit_u8(0x99);
    }

    fn shift_ri(&mut self, ext: u8, reg: Reg, imm: u8) {
        if imm == 1 {
            self.emit_rr(0xD1, ext, reg.code());
        } else {
            self.emit_rr(0xC1, ext, reg.code());
            self.buf.emit_u8(imm);
        }
    }

    /// SHL r32, imm8
    pub fn shl_ri(&mut self, reg: Reg, imm: u8) {
        self.shift_ri(4, reg, imm);
    }

    /// SHR r32, imm8
    pub fn shr_ri(&mut self, reg: Reg, imm: u8) {
        self.shift_ri(5, reg, imm);
    }

    /// SAR r32, imm8
    pub fn sar_ri(&mut self, reg: Reg, imm: u8) {
        self.shift_ri(7, reg, imm);
    }

    /// SHL r32, CL
    pub fn shl_cl(&mut self, reg: Reg) {
        self.emit_rr(0xD3, 4, reg.code());
    }

    /// SHR r32, CL
    pub fn shr_cl(&mut self, reg: Reg) {
        self.emit_rr(0xD3, 5, reg.code());
    }

    /// SAR r32, CL
    pub fn sar_cl(&mut self, reg: Reg) {
        self.emit_rr(0xD3, 7, reg.code());
    }

    /// SHLD dst, src, CL
    pub fn shld_cl(&mut self, dst: Reg, src: Reg) {
        self.emit_0f_rr(0xA5, src.code(), dst.code());
    }

    /// SHRD dst, src, CL
    pub fn shrd_cl(&mut self, dst: Reg, src: Reg) {
        self.emit_0f_rr(0xAD, src.code(), dst.code());
    }

    // ==================== Control Flow ====================

    /// JMP to label (short form for near backward targets)
    pub fn jmp(&mut self, label: Label) {
        if let Some(target) = self.buf.label_offset(label) {
            let rel = target as i64 - (self.buf.offset() as i64 + 2);
            if (-128..=127).contains(&rel) {
                self.buf.emit_u8(0xEB);
                self.buf.emit_u8(rel as i8 as u8);
                return;
            }
        }
        self.buf.emit_u8(0xE9);
        self.buf.emit_label_ref(label, ReferenceSize::Rel32);
    }

    /// Jcc to label (short form for near backward targets)
    pub fn jcc(&mut self, cc: Cond, label: Label) {
        if let Some(target) = self.buf.label_offset(label) {
            let rel = target as i64 - (self.buf.offset() as i64 + 2);
            if (-128..=127).contains(&rel) {
                self.buf.emit_u8(0x70 + cc as u8);
                self.buf.emit_u8(rel as i8 as u8);
                return;
            }
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cc as u8);
        self.buf.emit_label_ref(label, ReferenceSize::Rel32);
    }

    /// JMP to an absolute address
    pub fn jmp_abs(&mut self, target: u32) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_rel32_to(target, RelocKind::External);
    }

    /// Jcc to an absolute address
    pub fn jcc_abs(&mut self, cc: Cond, target: u32) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cc as u8);
        self.buf.emit_rel32_to(target, RelocKind::External);
    }

    /// JMP r32
    pub fn jmp_r(&mut self, reg: Reg) {
        self.emit_rr(0xFF, 4, reg.code());
    }

    /// JMP dword [mem]
    pub fn jmp_m(&mut self, adr: Address) {
        self.emit_rm(0xFF, 4, &adr);
    }

    /// CALL to an absolute address
    pub fn call_abs(&mut self, target: u32) {
        self.buf.emit_u8(0xE8);
        self.buf.emit_rel32_to(target, RelocKind::RuntimeCall);
    }

    /// CALL to label
    pub fn call_label(&mut self, label: Label) {
        self.buf.emit_u8(0xE8);
        self.buf.emit_label_ref(label, ReferenceSize::Rel32);
    }

    /// CALL r32
    pub fn call_r(&mut self, reg: Reg) {
        self.emit_rr(0xFF, 2, reg.code());
    }

    /// CALL dword [mem]
    pub fn call_m(&mut self, adr: Address) {
        self.emit_rm(0xFF, 2, &adr);
    }

    /// RET (popping `imm` extra bytes)
    pub fn ret(&mut self, imm: u16) {
        if imm == 0 {
            self.buf.emit_u8(0xC3);
        } else {
            self.buf.emit_u8(0xC2);
            self.buf.emit_u16(imm);
        }
    }

    /// NOP
    pub fn nop(&mut self) {
        self.buf.emit_u8(0x90);
    }

    /// HLT (used to mark unreachable code)
    pub fn hlt(&mut self) {
        self.buf.emit_u8(0xF4);
    }

    /// INT3
    pub fn int3(&mut self) {
        self.buf.emit_u8(0xCC);
    }

    // ==================== String Operations ====================

    /// CLD
    pub fn cld(&mut self) {
        self.buf.emit_u8(0xFC);
    }

    /// STD
    pub fn std(&mut self) {
        self.buf.emit_u8(0xFD);
    }

    /// REP MOVS (ESI -> EDI, ECX elements)
    pub fn rep_movs(&mut self, size: OpSize) {
        match size {
            OpSize::Byte => self.buf.emit_bytes(&[0xF3, 0xA4]),
            OpSize::Word => self.buf.emit_bytes(&[0x66, 0xF3, 0xA5]),
            OpSize::Dword => self.buf.emit_bytes(&[0xF3, 0xA5]),
        }
    }

    /// REP STOS (EAX -> EDI, ECX elements)
    pub fn rep_stos(&mut self, size: OpSize) {
        match size {
            OpSize::Byte => self.buf.emit_bytes(&[0xF3, 0xAA]),
            OpSize::Word => self.buf.emit_bytes(&[0x66, 0xF3, 0xAB]),
            OpSize::Dword => self.buf.emit_bytes(&[0xF3, 0xAB]),
        }
    }

    // ==================== x87 ====================

    fn fpu_mem(&mut self, opcode: u8, ext: u8, adr: Address) {
        self.emit_rm(opcode, ext, &adr);
    }

    fn fpu_st(&mut self, b1: u8, b2: u8, i: u8) {
        self.buf.emit_u8(b1);
        self.buf.emit_u8(b2 + (i & 7));
    }

    /// FLD m32fp
    pub fn fld_s(&mut self, adr: Address) {
        self.fpu_mem(0xD9, 0, adr);
        self.fpu_push();
    }

    /// FLD m64fp
    pub fn fld_d(&mut self, adr: Address) {
        self.fpu_mem(0xDD, 0, adr);
        self.fpu_push();
    }

    /// FLD m80fp
    pub fn fld_x(&mut self, adr: Address) {
        self.fpu_mem(0xDB, 5, adr);
        self.fpu_push();
    }

    /// FILD m32int
    pub fn fild_s(&mut self, adr: Address) {
        self.fpu_mem(0xDB, 0, adr);
        self.fpu_push();
    }

    /// FILD m64int
    pub fn fild_d(&mut self, adr: Address) {
        self.fpu_mem(0xDF, 5, adr);
        self.fpu_push();
    }

    /// FST m32fp
    pub fn fst_s(&mut self, adr: Address) {
        self.fpu_mem(0xD9, 2, adr);
    }

    /// FST m64fp
    pub fn fst_d(&mut self, adr: Address) {
        self.fpu_mem(0xDD, 2, adr);
    }

    /// FSTP m32fp
    pub fn fstp_s(&mut self, adr: Address) {
        self.fpu_mem(0xD9, 3, adr);
        self.fpu_pop();
    }

    /// FSTP m64fp
    pub fn fstp_d(&mut self, adr: Address) {
        self.fpu_mem(0xDD, 3, adr);
        self.fpu_pop();
    }

    /// FSTP m80fp
    pub fn fstp_x(&mut self, adr: Address) {
        self.fpu_mem(0xDB, 7, adr);
        self.fpu_pop();
    }

    /// FISTP m32int
    pub fn fistp_s(&mut self, adr: Address) {
        self.fpu_mem(0xDB, 3, adr);
        self.fpu_pop();
    }

    /// FISTP m64int
    pub fn fistp_d(&mut self, adr: Address) {
        self.fpu_mem(0xDF, 7, adr);
        self.fpu_pop();
    }

    /// FLD ST(i)
    pub fn fld_st(&mut self, i: u8) {
        self.fpu_st(0xD9, 0xC0, i);
        self.fpu_push();
    }

    /// FSTP ST(i)
    pub fn fstp_st(&mut self, i: u8) {
        self.fpu_st(0xDD, 0xD8, i);
        self.fpu_pop();
    }

    /// Pop ST0 (FSTP ST(0))
    pub fn fpop(&mut self) {
        self.fstp_st(0);
    }

    /// FXCH ST(i)
    pub fn fxch(&mut self, i: u8) {
        self.fpu_st(0xD9, 0xC8, i);
    }

    /// FFREE ST(i)
    pub fn ffree(&mut self, i: u8) {
        self.fpu_st(0xDD, 0xC0, i);
    }

    /// FINCSTP
    pub fn fincstp(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xF7]);
    }

    /// FLDZ
    pub fn fldz(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xEE]);
        self.fpu_push();
    }

    /// FLD1
    pub fn fld1(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xE8]);
        self.fpu_push();
    }

    /// FLDLN2
    pub fn fldln2(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xED]);
        self.fpu_push();
    }

    /// FLDLG2
    pub fn fldlg2(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xEC]);
        self.fpu_push();
    }

    /// FCHS
    pub fn fchs(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xE0]);
    }

    /// FABS
    pub fn fabs(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xE1]);
    }

    /// FSQRT
    pub fn fsqrt(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xFA]);
    }

    /// FSIN
    pub fn fsin(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xFE]);
    }

    /// FCOS
    pub fn fcos(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xFF]);
    }

    /// FPTAN (pushes 1.0 after the result)
    pub fn fptan(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xF2]);
        self.fpu_push();
    }

    /// FYL2X (ST1 = ST1 * log2(ST0), pop)
    pub fn fyl2x(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xF1]);
        self.fpu_pop();
    }

    /// FPREM
    pub fn fprem(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xF8]);
    }

    /// FADDP ST(i), ST0
    pub fn faddp(&mut self, i: u8) {
        self.fpu_st(0xDE, 0xC0, i);
        self.fpu_pop();
    }

    /// FMULP ST(i), ST0
    pub fn fmulp(&mut self, i: u8) {
        self.fpu_st(0xDE, 0xC8, i);
        self.fpu_pop();
    }

    /// FSUBRP ST(i), ST0: ST(i) = ST0 - ST(i), pop
    pub fn fsubrp(&mut self, i: u8) {
        self.fpu_st(0xDE, 0xE0, i);
        self.fpu_pop();
    }

    /// FSUBP ST(i), ST0: ST(i) = ST(i) - ST0, pop
    pub fn fsubp(&mut self, i: u8) {
        self.fpu_st(0xDE, 0xE8, i);
        self.fpu_pop();
    }

    /// FDIVRP ST(i), ST0: ST(i) = ST0 / ST(i), pop
    pub fn fdivrp(&mut self, i: u8) {
        self.fpu_st(0xDE, 0xF0, i);
        self.fpu_pop();
    }

    /// FDIVP ST(i), ST0: ST(i) = ST(i) / ST0, pop
    pub fn fdivp(&mut self, i: u8) {
        self.fpu_st(0xDE, 0xF8, i);
        self.fpu_pop();
    }

    /// FADD m32fp
    pub fn fadd_s(&mut self, adr: Address) {
        self.fpu_mem(0xD8, 0, adr);
    }

    /// FMUL m32fp
    pub fn fmul_s(&mut self, adr: Address) {
        self.fpu_mem(0xD8, 1, adr);
    }

    /// FSUB m32fp: ST0 = ST0 - m
    pub fn fsub_s(&mut self, adr: Address) {
        self.fpu_mem(0xD8, 4, adr);
    }

    /// FSUBR m32fp: ST0 = m - ST0
    pub fn fsubr_s(&mut self, adr: Address) {
        self.fpu_mem(0xD8, 5, adr);
    }

    /// FDIV m32fp: ST0 = ST0 / m
    pub fn fdiv_s(&mut self, adr: Address) {
        self.fpu_mem(0xD8, 6, adr);
    }

    /// FDIVR m32fp: ST0 = m / ST0
    pub fn fdivr_s(&mut self, adr: Address) {
        self.fpu_mem(0xD8, 7, adr);
    }

    /// FADD m64fp
    pub fn fadd_d(&mut self, adr: Address) {
        self.fpu_mem(0xDC, 0, adr);
    }

    /// FMUL m64fp
    pub fn fmul_d(&mut self, adr: Address) {
        self.fpu_mem(0xDC, 1, adr);
    }

    /// FSUB m64fp: ST0 = ST0 - m
    pub fn fsub_d(&mut self, adr: Address) {
        self.fpu_mem(0xDC, 4, adr);
    }

    /// FSUBR m64fp: ST0 = m - ST0
    pub fn fsubr_d(&mut self, adr: Address) {
        self.fpu_mem(0xDC, 5, adr);
    }

    /// FDIV m64fp: ST0 = ST0 / m
    pub fn fdiv_d(&mut self, adr: Address) {
        self.fpu_mem(0xDC, 6, adr);
    }

    /// FDIVR m64fp: ST0 = m / ST0
    pub fn fdivr_d(&mut self, adr: Address) {
        self.fpu_mem(0xDC, 7, adr);
    }

    /// FUCOMIP ST0, ST(i): compare into EFLAGS and pop
    pub fn fucomip(&mut self, i: u8) {
        self.fpu_st(0xDF, 0xE8, i);
        self.fpu_pop();
    }

    /// FNSTCW m16
    pub fn fnstcw(&mut self, adr: Address) {
        self.fpu_mem(0xD9, 7, adr);
    }

    /// FLDCW m16
    pub fn fldcw(&mut self, adr: Address) {
        self.fpu_mem(0xD9, 5, adr);
    }

    /// FNSTSW AX
    pub fn fnstsw_ax(&mut self) {
        self.buf.emit_bytes(&[0xDF, 0xE0]);
    }

    /// FWAIT
    pub fn fwait(&mut self) {
        self.buf.emit_u8(0x9B);
    }

    /// FNSAVE m108 (reinitializes the FPU)
    pub fn fnsave(&mut self, adr: Address) {
        self.fpu_mem(0xDD, 6, adr);
    }

    /// FRSTOR m108
    pub fn frstor(&mut self, adr: Address) {
        self.fpu_mem(0xDD, 4, adr);
    }

    /// SAHF
    pub fn sahf(&mut self) {
        self.buf.emit_u8(0x9E);
    }

    // ==================== SSE / SSE2 ====================

    fn sse_rr(&mut self, prefix: Option<u8>, opcode: &[u8], reg: u8, rm: u8) {
        if let Some(p) = prefix {
            self.buf.emit_u8(p);
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_bytes(opcode);
        self.buf.emit_u8(Self::modrm(0b11, reg, rm));
    }

    fn sse_rm(&mut self, prefix: Option<u8>, opcode: &[u8], reg: u8, adr: Address) {
        if let Some(p) = prefix {
            self.buf.emit_u8(p);
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_bytes(opcode);
        self.emit_operand(reg, &adr);
    }

    /// MOVD xmm, r32
    pub fn movd_xr(&mut self, dst: Xmm, src: Reg) {
        self.sse_rr(Some(0x66), &[0x6E], dst.code(), src.code());
    }

    /// MOVD r32, xmm
    pub fn movd_rx(&mut self, dst: Reg, src: Xmm) {
        self.sse_rr(Some(0x66), &[0x7E], src.code(), dst.code());
    }

    /// MOVQ xmm, m64
    pub fn movq_xm(&mut self, dst: Xmm, adr: Address) {
        self.sse_rm(Some(0xF3), &[0x7E], dst.code(), adr);
    }

    /// MOVQ m64, xmm
    pub fn movq_mx(&mut self, adr: Address, src: Xmm) {
        self.sse_rm(Some(0x66), &[0xD6], src.code(), adr);
    }

    /// MOVDQU xmm, m128
    pub fn movdqu_xm(&mut self, dst: Xmm, adr: Address) {
        self.sse_rm(Some(0xF3), &[0x6F], dst.code(), adr);
    }

    /// MOVDQU m128, xmm
    pub fn movdqu_mx(&mut self, adr: Address, src: Xmm) {
        self.sse_rm(Some(0xF3), &[0x7F], src.code(), adr);
    }

    /// MOVDQA xmm, xmm
    pub fn movdqa_xx(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(Some(0x66), &[0x6F], dst.code(), src.code());
    }

    /// MOVSD xmm, m64
    pub fn movsd_xm(&mut self, dst: Xmm, adr: Address) {
        self.sse_rm(Some(0xF2), &[0x10], dst.code(), adr);
    }

    /// MOVSD m64, xmm
    pub fn movsd_mx(&mut self, adr: Address, src: Xmm) {
        self.sse_rm(Some(0xF2), &[0x11], src.code(), adr);
    }

    /// MOVSS xmm, m32
    pub fn movss_xm(&mut self, dst: Xmm, adr: Address) {
        self.sse_rm(Some(0xF3), &[0x10], dst.code(), adr);
    }

    /// MOVSS m32, xmm
    pub fn movss_mx(&mut self, adr: Address, src: Xmm) {
        self.sse_rm(Some(0xF3), &[0x11], src.code(), adr);
    }

    /// PXOR xmm, xmm
    pub fn pxor(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(Some(0x66), &[0xEF], dst.code(), src.code());
    }

    /// PXOR xmm, m128
    pub fn pxor_xm(&mut self, dst: Xmm, adr: Address) {
        self.sse_rm(Some(0x66), &[0xEF], dst.code(), adr);
    }

    /// POR xmm, xmm
    pub fn por(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(Some(0x66), &[0xEB], dst.code(), src.code());
    }

    /// PSHUFB xmm, xmm
    pub fn pshufb(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(Some(0x66), &[0x38, 0x00], dst.code(), src.code());
    }

    /// PSHUFB xmm, m128
    pub fn pshufb_xm(&mut self, dst: Xmm, adr: Address) {
        self.sse_rm(Some(0x66), &[0x38, 0x00], dst.code(), adr);
    }

    /// PSHUFD xmm, xmm, imm8
    pub fn pshufd(&mut self, dst: Xmm, src: Xmm, imm: u8) {
        self.sse_rr(Some(0x66), &[0x70], dst.code(), src.code());
        self.buf.emit_u8(imm);
    }

    fn sse_shift(&mut self, opcode: u8, ext: u8, reg: Xmm, imm: u8) {
        self.sse_rr(Some(0x66), &[opcode], ext, reg.code());
        self.buf.emit_u8(imm);
    }

    /// PSRLDQ xmm, imm8 (bytes)
    pub fn psrldq(&mut self, reg: Xmm, imm: u8) {
        self.sse_shift(0x73, 3, reg, imm);
    }

    /// PSLLDQ xmm, imm8 (bytes)
    pub fn pslldq(&mut self, reg: Xmm, imm: u8) {
        self.sse_shift(0x73, 7, reg, imm);
    }

    /// PSRLD xmm, imm8
    pub fn psrld(&mut self, reg: Xmm, imm: u8) {
        self.sse_shift(0x72, 2, reg, imm);
    }

    /// PSLLD xmm, imm8
    pub fn pslld(&mut self, reg: Xmm, imm: u8) {
        self.sse_shift(0x72, 6, reg, imm);
    }

    /// PCLMULQDQ xmm, xmm, imm8
    pub fn pclmulqdq(&mut self, dst: Xmm, src: Xmm, imm: u8) {
        self.sse_rr(Some(0x66), &[0x3A, 0x44], dst.code(), src.code());
        self.buf.emit_u8(imm);
    }

    /// AESENC xmm, xmm
    pub fn aesenc(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(Some(0x66), &[0x38, 0xDC], dst.code(), src.code());
    }

    /// AESENCLAST xmm, xmm
    pub fn aesenclast(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(Some(0x66), &[0x38, 0xDD], dst.code(), src.code());
    }

    /// AESDEC xmm, xmm
    pub fn aesdec(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(Some(0x66), &[0x38, 0xDE], dst.code(), src.code());
    }

    /// AESDECLAST xmm, xmm
    pub fn aesdeclast(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(Some(0x66), &[0x38, 0xDF], dst.code(), src.code());
    }

    /// LDMXCSR m32
    pub fn ldmxcsr(&mut self, adr: Address) {
        self.sse_rm(None, &[0xAE], 2, adr);
    }

    /// STMXCSR m32
    pub fn stmxcsr(&mut self, adr: Address) {
        self.sse_rm(None, &[0xAE], 3, adr);
    }

    // ==================== AVX2 ====================

    /// Two-byte VEX prefix (R=0, W ignored) for 256-bit ops.
    fn vex2_256(&mut self, vvvv: u8, pp: u8) {
        self.buf.emit_u8(0xC5);
        self.buf.emit_u8(0x80 | ((!vvvv & 0xF) << 3) | 0x04 | (pp & 0x3));
    }

    /// VMOVDQU ymm, m256
    pub fn vmovdqu_ym(&mut self, dst: Xmm, adr: Address) {
        self.vex2_256(0, 0b10);
        self.emit_rm(0x6F, dst.code(), &adr);
    }

    /// VMOVDQU m256, ymm
    pub fn vmovdqu_my(&mut self, adr: Address, src: Xmm) {
        self.vex2_256(0, 0b10);
        self.emit_rm(0x7F, src.code(), &adr);
    }

    /// VPXOR ymm, ymm, ymm
    pub fn vpxor_256(&mut self, dst: Xmm, a: Xmm, b: Xmm) {
        self.vex2_256(a.code(), 0b01);
        self.emit_rr(0xEF, dst.code(), b.code());
    }

    // ==================== MMX ====================

    /// MOVQ mm, m64
    pub fn movq_mmx_load(&mut self, dst: Mmx, adr: Address) {
        self.emit_0f_rm(0x6F, dst as u8, &adr);
    }

    /// MOVQ m64, mm
    pub fn movq_mmx_store(&mut self, adr: Address, src: Mmx) {
        self.emit_0f_rm(0x7F, src as u8, &adr);
    }

    /// EMMS
    pub fn emms(&mut self) {
        self.buf.emit_bytes(&[0x0F, 0x77]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new(0x1000);
        let mut asm = Assembler::new(&mut buf);
        f(&mut asm);
        buf.into_code()
    }

    #[test]
    fn test_mov_rr() {
        // MOV EAX, EBX = 89 D8
        assert_eq!(encode(|a| a.mov_rr(Reg::Eax, Reg::Ebx)), vec![0x89, 0xD8]);
    }

    #[test]
    fn test_mov_rm_ebp_disp() {
        // MOV ESI, [EBP-28] = 8B 75 E4
        assert_eq!(
            encode(|a| a.mov_rm(Reg::Esi, Address::new(Reg::Ebp, -28))),
            vec![0x8B, 0x75, 0xE4]
        );
    }

    #[test]
    fn test_mov_rm_esp_needs_sib() {
        // MOV EAX, [ESP+4] = 8B 44 24 04
        assert_eq!(
            encode(|a| a.mov_rm(Reg::Eax, Address::new(Reg::Esp, 4))),
            vec![0x8B, 0x44, 0x24, 0x04]
        );
        // MOV EAX, [ESP] = 8B 04 24
        assert_eq!(
            encode(|a| a.mov_rm(Reg::Eax, Address::new(Reg::Esp, 0))),
            vec![0x8B, 0x04, 0x24]
        );
    }

    #[test]
    fn test_mov_rm_ebp_zero_disp() {
        // MOV EAX, [EBP] must use disp8 = 8B 45 00
        assert_eq!(
            encode(|a| a.mov_rm(Reg::Eax, Address::new(Reg::Ebp, 0))),
            vec![0x8B, 0x45, 0x00]
        );
    }

    #[test]
    fn test_indexed_operand() {
        // JMP [EBX*4 + 0x2000] = FF 24 9D 00 20 00 00
        assert_eq!(
            encode(|a| a.jmp_m(Address::index_only(Reg::Ebx, Scale::Times4, 0x2000))),
            vec![0xFF, 0x24, 0x9D, 0x00, 0x20, 0x00, 0x00]
        );
        // MOV EAX, [EDI + ECX*4 + 8] = 8B 44 8F 08
        assert_eq!(
            encode(|a| a.mov_rm(
                Reg::Eax,
                Address::indexed(Reg::Edi, Reg::Ecx, Scale::Times4, 8)
            )),
            vec![0x8B, 0x44, 0x8F, 0x08]
        );
    }

    #[test]
    fn test_absolute_operand() {
        // CMP dword [0x00403000], 0 = 83 3D 00 30 40 00 00
        assert_eq!(
            encode(|a| a.cmp_mi(Address::absolute(0x0040_3000), 0)),
            vec![0x83, 0x3D, 0x00, 0x30, 0x40, 0x00, 0x00]
        );
    }

    #[test]
    fn test_alu() {
        // ADD EAX, EBX = 01 D8
        assert_eq!(encode(|a| a.add_rr(Reg::Eax, Reg::Ebx)), vec![0x01, 0xD8]);
        // SUB ESP, 8 = 83 EC 08
        assert_eq!(encode(|a| a.sub_ri(Reg::Esp, 8)), vec![0x83, 0xEC, 0x08]);
        // AND ECX, 0xFFC0 = 81 E1 C0 FF 00 00
        assert_eq!(
            encode(|a| a.and_ri(Reg::Ecx, 0xFFC0)),
            vec![0x81, 0xE1, 0xC0, 0xFF, 0x00, 0x00]
        );
        // XOR EAX, EAX = 31 C0
        assert_eq!(encode(|a| a.xor_rr(Reg::Eax, Reg::Eax)), vec![0x31, 0xC0]);
        // CMP EAX, [ECX+8] = 3B 41 08
        assert_eq!(
            encode(|a| a.cmp_rm(Reg::Eax, Address::new(Reg::Ecx, 8))),
            vec![0x3B, 0x41, 0x08]
        );
        // ADC EDX, EBX = 11 DA
        assert_eq!(encode(|a| a.adc_rr(Reg::Edx, Reg::Ebx)), vec![0x11, 0xDA]);
    }

    #[test]
    fn test_stack_ops() {
        assert_eq!(encode(|a| a.push_r(Reg::Ebp)), vec![0x55]);
        assert_eq!(encode(|a| a.pop_r(Reg::Edi)), vec![0x5F]);
        assert_eq!(encode(|a| a.push_i(0)), vec![0x6A, 0x00]);
        assert_eq!(encode(|a| a.push_i(0x1234)), vec![0x68, 0x34, 0x12, 0x00, 0x00]);
        // PUSH EBP; MOV EBP, ESP
        assert_eq!(encode(|a| a.enter()), vec![0x55, 0x89, 0xE5]);
        assert_eq!(encode(|a| a.ret(12)), vec![0xC2, 0x0C, 0x00]);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(encode(|a| a.sar_ri(Reg::Edx, 16)), vec![0xC1, 0xFA, 0x10]);
        assert_eq!(encode(|a| a.shl_ri(Reg::Eax, 1)), vec![0xD1, 0xE0]);
        // SHLD EDX, EAX, CL = 0F A5 C2
        assert_eq!(encode(|a| a.shld_cl(Reg::Edx, Reg::Eax)), vec![0x0F, 0xA5, 0xC2]);
    }

    #[test]
    fn test_movzx_and_bswap() {
        // MOVZX EBX, byte [ESI] = 0F B6 1E
        assert_eq!(
            encode(|a| a.movzxb_rm(Reg::Ebx, Address::new(Reg::Esi, 0))),
            vec![0x0F, 0xB6, 0x1E]
        );
        // BSWAP EDX = 0F CA
        assert_eq!(encode(|a| a.bswap(Reg::Edx)), vec![0x0F, 0xCA]);
    }

    #[test]
    fn test_jcc_forward_and_backward() {
        let mut buf = CodeBuffer::new(0);
        let mut asm = Assembler::new(&mut buf);
        let top = asm.new_label();
        let done = asm.new_label();
        asm.bind(top);
        asm.jcc(Cond::E, done);
        asm.jcc(Cond::Ne, top);
        asm.bind(done);
        // JE rel32 (+2), JNE rel8 (-8)
        assert_eq!(
            buf.code(),
            &[0x0F, 0x84, 0x02, 0x00, 0x00, 0x00, 0x75, 0xF8]
        );
    }

    #[test]
    fn test_call_abs_relative_to_base() {
        // CALL 0x2000 from 0x1000 = E8 FB 0F 00 00
        assert_eq!(encode(|a| a.call_abs(0x2000)), vec![0xE8, 0xFB, 0x0F, 0x00, 0x00]);
    }

    #[test]
    fn test_x87_encodings_and_depth() {
        let mut buf = CodeBuffer::new(0);
        let mut asm = Assembler::new(&mut buf);
        asm.fld_d(Address::new(Reg::Esp, 4));
        asm.fld1();
        asm.faddp(1);
        asm.fstp_s(Address::new(Reg::Esp, 0));
        assert_eq!(asm.fpu_depth(), 0);
        assert!(asm.expect_fpu_depth(0, "test").is_ok());
        assert!(asm.expect_fpu_depth(1, "test").is_err());
        assert_eq!(
            buf.code(),
            &[0xDD, 0x44, 0x24, 0x04, 0xD9, 0xE8, 0xDE, 0xC1, 0xD9, 0x1C, 0x24]
        );
    }

    #[test]
    fn test_fdivr_and_fucomip() {
        // FDIVR qword [ESP] = DC 3C 24
        assert_eq!(
            encode(|a| a.fdivr_d(Address::new(Reg::Esp, 0))),
            vec![0xDC, 0x3C, 0x24]
        );
        // FUCOMIP ST0, ST1 = DF E9
        assert_eq!(encode(|a| a.fucomip(1)), vec![0xDF, 0xE9]);
    }

    #[test]
    fn test_sse_encodings() {
        // MOVDQU XMM1, [ESI+16] = F3 0F 6F 4E 10
        assert_eq!(
            encode(|a| a.movdqu_xm(Xmm::Xmm1, Address::new(Reg::Esi, 16))),
            vec![0xF3, 0x0F, 0x6F, 0x4E, 0x10]
        );
        // PSHUFB XMM0, XMM5 = 66 0F 38 00 C5
        assert_eq!(
            encode(|a| a.pshufb(Xmm::Xmm0, Xmm::Xmm5)),
            vec![0x66, 0x0F, 0x38, 0x00, 0xC5]
        );
        // AESENC XMM0, XMM1 = 66 0F 38 DC C1
        assert_eq!(
            encode(|a| a.aesenc(Xmm::Xmm0, Xmm::Xmm1)),
            vec![0x66, 0x0F, 0x38, 0xDC, 0xC1]
        );
        // PCLMULQDQ XMM3, XMM1, 0x11 = 66 0F 3A 44 D9 11
        assert_eq!(
            encode(|a| a.pclmulqdq(Xmm::Xmm3, Xmm::Xmm1, 0x11)),
            vec![0x66, 0x0F, 0x3A, 0x44, 0xD9, 0x11]
        );
        // STMXCSR [ESP] = 0F AE 1C 24
        assert_eq!(
            encode(|a| a.stmxcsr(Address::new(Reg::Esp, 0))),
            vec![0x0F, 0xAE, 0x1C, 0x24]
        );
    }

    #[test]
    fn test_avx2_encodings() {
        // VPXOR YMM0, YMM0, YMM0 = C5 FD EF C0
        assert_eq!(
            encode(|a| a.vpxor_256(Xmm::Xmm0, Xmm::Xmm0, Xmm::Xmm0)),
            vec![0xC5, 0xFD, 0xEF, 0xC0]
        );
        // VMOVDQU YMM1, [EAX] = C5 FE 6F 08
        assert_eq!(
            encode(|a| a.vmovdqu_ym(Xmm::Xmm1, Address::new(Reg::Eax, 0))),
            vec![0xC5, 0xFE, 0x6F, 0x08]
        );
    }

    #[test]
    fn test_string_and_lock() {
        assert_eq!(encode(|a| a.rep_movs(OpSize::Dword)), vec![0xF3, 0xA5]);
        let code = encode(|a| {
            a.lock();
            a.cmpxchg_mr(Address::new(Reg::Ecx, 0), Reg::Edx);
        });
        // LOCK CMPXCHG [ECX], EDX = F0 0F B1 11
        assert_eq!(code, vec![0xF0, 0x0F, 0xB1, 0x11]);
    }
}
