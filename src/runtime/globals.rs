//! Process-wide words in the data section.
//!
//! Generated code addresses these absolutely: the current-thread slot, the
//! safepoint poll word, the shared eden bounds, canonical FPU/MXCSR control
//! words, strict-FP bias constants, the dispatch tables and the constant
//! tables used by the CRC and crypto stubs.

use super::basic_type::NUMBER_OF_STATES;
use super::memory32::{Arena, Memory32};
use crate::error::VmResult;
use crate::stubs::crc32;

/// Canonical control-word values.
pub mod fpu {
    /// Round to nearest, 53-bit mantissa, all exceptions masked
    pub const CNTRL_WRD_STD: u16 = 0x027F;
    /// Round toward zero, used by d2i/d2l style conversions
    pub const CNTRL_WRD_TRUNC: u16 = 0x0D7F;
    /// 24-bit mantissa for single-precision strict arithmetic
    pub const CNTRL_WRD_24: u16 = 0x007F;
    /// All SSE exceptions masked, round to nearest
    pub const MXCSR_STD: u32 = 0x1F80;
    /// Bits compared by `verify_mxcsr` (status flags ignored)
    pub const MXCSR_MASK: u32 = 0xFFC0;
    /// Bits compared by `verify_fpu_cntrl_wrd`
    pub const FPU_CNTRL_WRD_MASK: u16 = 0xFFFF;
}

/// 80-bit extended encoding of 2^-15360 (mantissa, exponent).
pub const STRICT_BIAS1: [u8; 10] = [0, 0, 0, 0, 0, 0, 0, 0x80, 0xFF, 0x03];
/// 80-bit extended encoding of 2^15360.
pub const STRICT_BIAS2: [u8; 10] = [0, 0, 0, 0, 0, 0, 0, 0x80, 0xFF, 0x7B];

/// `pshufb` mask reversing the bytes of every 32-bit lane (AES key words).
pub const AES_KEY_SHUFFLE_MASK: [u8; 16] = [3, 2, 1, 0, 7, 6, 5, 4, 11, 10, 9, 8, 15, 14, 13, 12];
/// `pshufb` mask reversing all 16 bytes (GHASH data blocks).
pub const GHASH_BYTE_SWAP_MASK: [u8; 16] = [15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0];
/// `pshufb` mask swapping the two 64-bit halves (GHASH state and subkey).
pub const GHASH_LONG_SWAP_MASK: [u8; 16] = [8, 9, 10, 11, 12, 13, 14, 15, 0, 1, 2, 3, 4, 5, 6, 7];

/// Bytes in one dispatch table (one row of 256 entries per TOS state).
pub const DISPATCH_TABLE_SIZE: u32 = (NUMBER_OF_STATES * 256 * 4) as u32;

/// Addresses of every global word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmGlobals {
    pub base: u32,
    pub size: u32,
    /// Pointer to the current `JavaThread`
    pub thread_slot: u32,
    pub safepoint_poll: u32,
    pub eden_top: u32,
    pub eden_end: u32,
    pub fpu_cntrl_wrd_std: u32,
    pub fpu_cntrl_wrd_trunc: u32,
    pub fpu_cntrl_wrd_24: u32,
    pub mxcsr_std: u32,
    pub strict_bias1: u32,
    pub strict_bias2: u32,
    pub verify_oop_count: u32,
    /// Scratch for `f2ieee` and `d2ieee`
    pub fpu_scratch: u32,
    /// pi/4 as a double, bound of the inline trigonometric fast path
    pub pi_4: u32,
    pub dispatch_active: u32,
    pub dispatch_normal: u32,
    pub dispatch_safepoint: u32,
    pub wentry_table: u32,
    /// Return entries after `invoke*` (3-byte invokes), per TOS state
    pub invoke_return: u32,
    pub invokeinterface_return: u32,
    pub invokedynamic_return: u32,
    pub crc_table: u32,
    pub aes_key_shuffle_mask: u32,
    pub ghash_byte_swap_mask: u32,
    pub ghash_long_swap_mask: u32,
}

impl VmGlobals {
    /// Lay the globals out from `base`.
    pub fn layout(base: u32, size: u32) -> VmResult<Self> {
        let mut arena = Arena::new(base, size);
        let mut word = || arena.allocate(4, 4);
        let thread_slot = word()?;
        let safepoint_poll = word()?;
        let eden_top = word()?;
        let eden_end = word()?;
        let fpu_cntrl_wrd_std = word()?;
        let fpu_cntrl_wrd_trunc = word()?;
        let fpu_cntrl_wrd_24 = word()?;
        let mxcsr_std = word()?;
        let verify_oop_count = word()?;
        let strict_bias1 = arena.allocate(16, 16)?;
        let strict_bias2 = arena.allocate(16, 16)?;
        let fpu_scratch = arena.allocate(16, 16)?;
        let pi_4 = arena.allocate(8, 8)?;
        let aes_key_shuffle_mask = arena.allocate(16, 16)?;
        let ghash_byte_swap_mask = arena.allocate(16, 16)?;
        let ghash_long_swap_mask = arena.allocate(16, 16)?;
        let returns = (NUMBER_OF_STATES * 4) as u32;
        let invoke_return = arena.allocate(returns, 4)?;
        let invokeinterface_return = arena.allocate(returns, 4)?;
        let invokedynamic_return = arena.allocate(returns, 4)?;
        let crc_table = arena.allocate(256 * 4, 64)?;
        let wentry_table = arena.allocate(256 * 4, 64)?;
        let dispatch_active = arena.allocate(DISPATCH_TABLE_SIZE, 64)?;
        let dispatch_normal = arena.allocate(DISPATCH_TABLE_SIZE, 64)?;
        let dispatch_safepoint = arena.allocate(DISPATCH_TABLE_SIZE, 64)?;
        Ok(Self {
            base,
            size: arena.top() - base,
            thread_slot,
            safepoint_poll,
            eden_top,
            eden_end,
            fpu_cntrl_wrd_std,
            fpu_cntrl_wrd_trunc,
            fpu_cntrl_wrd_24,
            mxcsr_std,
            strict_bias1,
            strict_bias2,
            verify_oop_count,
            fpu_scratch,
            pi_4,
            dispatch_active,
            dispatch_normal,
            dispatch_safepoint,
            wentry_table,
            invoke_return,
            invokeinterface_return,
            invokedynamic_return,
            crc_table,
            aes_key_shuffle_mask,
            ghash_byte_swap_mask,
            ghash_long_swap_mask,
        })
    }

    /// Write the constant contents. Tables are filled in by the generators.
    pub fn install(&self, mem: &mut dyn Memory32) -> VmResult<()> {
        mem.write_u32(self.fpu_cntrl_wrd_std, fpu::CNTRL_WRD_STD as u32)?;
        mem.write_u32(self.fpu_cntrl_wrd_trunc, fpu::CNTRL_WRD_TRUNC as u32)?;
        mem.write_u32(self.fpu_cntrl_wrd_24, fpu::CNTRL_WRD_24 as u32)?;
        mem.write_u32(self.mxcsr_std, fpu::MXCSR_STD)?;
        mem.write_bytes(self.strict_bias1, &STRICT_BIAS1)?;
        mem.write_bytes(self.strict_bias2, &STRICT_BIAS2)?;
        mem.write_u64(self.pi_4, std::f64::consts::FRAC_PI_4.to_bits())?;
        mem.write_bytes(self.aes_key_shuffle_mask, &AES_KEY_SHUFFLE_MASK)?;
        mem.write_bytes(self.ghash_byte_swap_mask, &GHASH_BYTE_SWAP_MASK)?;
        mem.write_bytes(self.ghash_long_swap_mask, &GHASH_LONG_SWAP_MASK)?;
        for (i, v) in crc32::table().iter().enumerate() {
            mem.write_u32(self.crc_table + 4 * i as u32, *v)?;
        }
        log::debug!(
            "globals at {:#010x}..{:#010x}",
            self.base,
            self.base + self.size
        );
        Ok(())
    }

    /// Address of `table[state][opcode]` in a dispatch table.
    pub fn dispatch_slot(table: u32, state: usize, opcode: u8) -> u32 {
        table + ((state * 256 + opcode as usize) * 4) as u32
    }
}
