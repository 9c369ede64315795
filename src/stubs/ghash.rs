//! GHASH block processing with PCLMULQDQ.
//!
//! `state` and `subkeyH` are two-element `long[]` bodies holding the high
//! then the low 64 bits of a 128-bit value; data blocks are big-endian.

use crate::asm::{Address, Cond, MacroAssembler, Reg, Xmm};

/// The GHASH reduction constant `x^128 = x^7 + x^2 + x + 1`, bit-reflected.
const R: u128 = 0xE1 << 120;

/// Multiplication in GF(2^128) with GCM bit order.
pub fn gf_mul(x: u128, y: u128) -> u128 {
    let mut z = 0;
    let mut v = y;
    for i in 0..128 {
        if (x >> (127 - i)) & 1 == 1 {
            z ^= v;
        }
        v = if v & 1 == 1 { (v >> 1) ^ R } else { v >> 1 };
    }
    z
}

fn join(words: [u64; 2]) -> u128 {
    ((words[0] as u128) << 64) | words[1] as u128
}

/// `state = (state ^ block) * H` for every whole 16-byte block.
pub fn process_blocks(state: &mut [u64; 2], subkey_h: [u64; 2], data: &[u8]) {
    let h = join(subkey_h);
    let mut x = join(*state);
    for chunk in data.chunks_exact(16) {
        let mut block = [0u8; 16];
        block.copy_from_slice(chunk);
        x = gf_mul(x ^ u128::from_be_bytes(block), h);
    }
    *state = [(x >> 64) as u64, x as u64];
}

/// `void ghash_processBlocks(long* state, long* subkeyH, byte* data, int blocks)`
pub fn generate_ghash_process_blocks(masm: &mut MacroAssembler) {
    let globals = &masm.ctx().globals;
    let long_swap = Address::absolute(globals.ghash_long_swap_mask);
    let byte_swap = Address::absolute(globals.ghash_byte_swap_mask);
    let (state, subkey_h, data, blocks) = (Reg::Edi, Reg::Esi, Reg::Edx, Reg::Ecx);
    let [t0, t1, t2, t3, t4, t5, t6, t7] = [
        Xmm::Xmm0,
        Xmm::Xmm1,
        Xmm::Xmm2,
        Xmm::Xmm3,
        Xmm::Xmm4,
        Xmm::Xmm5,
        Xmm::Xmm6,
        Xmm::Xmm7,
    ];
    let ghash_loop = masm.new_label();
    let exit = masm.new_label();
    let empty = masm.new_label();

    masm.enter();
    masm.push_r(Reg::Esi);
    masm.push_r(Reg::Edi);
    masm.mov_rm(state, Address::new(Reg::Ebp, 8));
    masm.mov_rm(subkey_h, Address::new(Reg::Ebp, 12));
    masm.mov_rm(data, Address::new(Reg::Ebp, 16));
    masm.mov_rm(blocks, Address::new(Reg::Ebp, 20));
    masm.test_rr(blocks, blocks);
    masm.jcc(Cond::E, empty);

    masm.movdqu_xm(t0, Address::new(state, 0));
    masm.pshufb_xm(t0, long_swap);
    masm.movdqu_xm(t1, Address::new(subkey_h, 0));
    masm.pshufb_xm(t1, long_swap);

    masm.bind(ghash_loop);
    masm.movdqu_xm(t2, Address::new(data, 0));
    masm.pshufb_xm(t2, byte_swap);
    masm.pxor(t0, t2);

    // carry-less multiply t0 * t1 into <t6:t3>
    masm.movdqa_xx(t3, t0);
    masm.pclmulqdq(t3, t1, 0x00);
    masm.movdqa_xx(t4, t0);
    masm.pclmulqdq(t4, t1, 0x10);
    masm.movdqa_xx(t5, t0);
    masm.pclmulqdq(t5, t1, 0x01);
    masm.movdqa_xx(t6, t0);
    masm.pclmulqdq(t6, t1, 0x11);
    masm.pxor(t4, t5);
    masm.movdqa_xx(t5, t4);
    masm.psrldq(t4, 8);
    masm.pslldq(t5, 8);
    masm.pxor(t3, t5);
    masm.pxor(t6, t4);

    // shift the product left by one bit; the operands are bit-reflected
    masm.movdqa_xx(t7, t3);
    masm.movdqa_xx(t4, t6);
    masm.pslld(t3, 1);
    masm.pslld(t6, 1);
    masm.psrld(t7, 31);
    masm.psrld(t4, 31);
    masm.movdqa_xx(t5, t7);
    masm.pslldq(t4, 4);
    masm.pslldq(t7, 4);
    masm.psrldq(t5, 12);
    masm.por(t3, t7);
    masm.por(t6, t4);
    masm.por(t6, t5);

    // first phase of the reduction
    masm.movdqa_xx(t7, t3);
    masm.movdqa_xx(t4, t3);
    masm.movdqa_xx(t5, t3);
    masm.pslld(t7, 31);
    masm.pslld(t4, 30);
    masm.pslld(t5, 25);
    masm.pxor(t7, t4);
    masm.pxor(t7, t5);
    masm.movdqa_xx(t4, t7);
    masm.pslldq(t7, 12);
    masm.psrldq(t4, 4);
    masm.pxor(t3, t7);

    // second phase
    masm.movdqa_xx(t2, t3);
    masm.movdqa_xx(t7, t3);
    masm.movdqa_xx(t5, t3);
    masm.psrld(t2, 1);
    masm.psrld(t7, 2);
    masm.psrld(t5, 7);
    masm.pxor(t2, t7);
    masm.pxor(t2, t5);
    masm.pxor(t2, t4);
    masm.pxor(t3, t2);
    masm.pxor(t6, t3);

    masm.dec_r(blocks);
    masm.jcc(Cond::E, exit);
    masm.movdqa_xx(t0, t6);
    masm.add_ri(data, 16);
    masm.jmp(ghash_loop);

    masm.bind(exit);
    masm.pshufb_xm(t6, long_swap);
    masm.movdqu_mx(Address::new(state, 0), t6);
    masm.bind(empty);
    masm.pop_r(Reg::Edi);
    masm.pop_r(Reg::Esi);
    masm.leave();
    masm.ret(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ONE: u128 = 1 << 127;

    #[test]
    fn test_one_is_identity() {
        let x = 0x0388_dace_60b6_a392_f328_c2b9_71b2_fe78;
        assert_eq!(gf_mul(x, ONE), x);
        assert_eq!(gf_mul(ONE, x), x);
        assert_eq!(gf_mul(x, 0), 0);
    }

    #[test]
    fn test_single_block_with_unit_key() {
        let mut state = [0, 0];
        let block: Vec<u8> = (1..=16).collect();
        process_blocks(&mut state, [1 << 63, 0], &block);
        assert_eq!(state, [0x0102_0304_0506_0708, 0x090A_0B0C_0D0E_0F10]);
    }

    proptest! {
        #[test]
        fn prop_mul_commutes(a in any::<u128>(), b in any::<u128>()) {
            prop_assert_eq!(gf_mul(a, b), gf_mul(b, a));
        }

        #[test]
        fn prop_mul_distributes(a in any::<u128>(), b in any::<u128>(), c in any::<u128>()) {
            prop_assert_eq!(gf_mul(a, b ^ c), gf_mul(a, b) ^ gf_mul(a, c));
        }

        #[test]
        fn prop_blocks_chain(h in any::<[u64; 2]>(), data in proptest::collection::vec(any::<u8>(), 32)) {
            let mut both = [0, 0];
            process_blocks(&mut both, h, &data);
            let mut split = [0, 0];
            process_blocks(&mut split, h, &data[..16]);
            process_blocks(&mut split, h, &data[16..]);
            prop_assert_eq!(both, split);
        }
    }
}
