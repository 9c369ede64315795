//! AES block and CBC stubs (AES-NI) plus the host cipher they are tested
//! against.
//!
//! Expanded keys arrive as `int[]` bodies: round-key words in big-endian
//! byte order, so each 16-byte load is fixed up with a per-lane byte
//! shuffle. Key length is read from the array header (44, 52 or 60 words).
//! Decryption keys are laid out for the equivalent inverse cipher, first
//! round key first, which is the order `aesdec` consumes them in.

use crate::asm::{Address, Cond, MacroAssembler, Reg, Xmm};
use crate::runtime::layout::array;

/// Offset of the `int[]` length word relative to its first element.
pub const KEY_LENGTH_OFFSET: i32 = array::LENGTH_OFFSET - array::HEADER_SIZE;

const fn make_sbox() -> [u8; 256] {
    let mut sbox = [0u8; 256];
    let mut p: u8 = 1;
    let mut q: u8 = 1;
    loop {
        // p *= 3
        p = p ^ (p << 1) ^ if p & 0x80 != 0 { 0x1B } else { 0 };
        // q /= 3
        q ^= q << 1;
        q ^= q << 2;
        q ^= q << 4;
        if q & 0x80 != 0 {
            q ^= 0x09;
        }
        let x = q ^ q.rotate_left(1) ^ q.rotate_left(2) ^ q.rotate_left(3) ^ q.rotate_left(4);
        sbox[p as usize] = x ^ 0x63;
        if p == 1 {
            break;
        }
    }
    sbox[0] = 0x63;
    sbox
}

const fn invert(sbox: &[u8; 256]) -> [u8; 256] {
    let mut inv = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        inv[sbox[i] as usize] = i as u8;
        i += 1;
    }
    inv
}

static SBOX: [u8; 256] = make_sbox();
static INV_SBOX: [u8; 256] = invert(&make_sbox());

const RCON: [u8; 10] = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1B, 0x36];

fn gmul(mut a: u8, mut b: u8) -> u8 {
    let mut p = 0;
    while b != 0 {
        if b & 1 != 0 {
            p ^= a;
        }
        let hi = a & 0x80;
        a <<= 1;
        if hi != 0 {
            a ^= 0x1B;
        }
        b >>= 1;
    }
    p
}

type Block = [u8; 16];

fn round_key(words: &[u32], round: usize) -> Block {
    let mut key = [0u8; 16];
    for j in 0..4 {
        key[4 * j..4 * j + 4].copy_from_slice(&words[4 * round + j].to_be_bytes());
    }
    key
}

fn add_round_key(state: &mut Block, key: &Block) {
    for (s, k) in state.iter_mut().zip(key) {
        *s ^= k;
    }
}

fn sub_bytes(state: &mut Block, table: &[u8; 256]) {
    for s in state.iter_mut() {
        *s = table[*s as usize];
    }
}

fn shift_rows(state: &mut Block) {
    let old = *state;
    for c in 0..4 {
        for r in 0..4 {
            state[r + 4 * c] = old[r + 4 * ((c + r) % 4)];
        }
    }
}

fn inv_shift_rows(state: &mut Block) {
    let old = *state;
    for c in 0..4 {
        for r in 0..4 {
            state[r + 4 * ((c + r) % 4)] = old[r + 4 * c];
        }
    }
}

fn mix_column(col: &mut [u8], m: [u8; 4]) {
    let a = [col[0], col[1], col[2], col[3]];
    for (r, out) in col.iter_mut().enumerate() {
        *out = (0..4).fold(0, |acc, k| acc ^ gmul(a[k], m[(k + 4 - r) % 4]));
    }
}

fn mix_columns(state: &mut Block) {
    for col in state.chunks_mut(4) {
        mix_column(col, [2, 3, 1, 1]);
    }
}

fn inv_mix_columns(state: &mut Block) {
    for col in state.chunks_mut(4) {
        mix_column(col, [14, 11, 13, 9]);
    }
}

fn rounds(words: &[u32]) -> usize {
    words.len() / 4 - 1
}

/// Key expansion for 16, 24 or 32 byte keys; `None` for other lengths.
pub fn expand_key(key: &[u8]) -> Option<Vec<u32>> {
    let nk = match key.len() {
        16 | 24 | 32 => key.len() / 4,
        _ => return None,
    };
    let total = 4 * (nk + 7);
    let mut w: Vec<[u8; 4]> = key.chunks(4).map(|c| [c[0], c[1], c[2], c[3]]).collect();
    for i in nk..total {
        let mut temp = w[i - 1];
        if i % nk == 0 {
            temp.rotate_left(1);
            for b in temp.iter_mut() {
                *b = SBOX[*b as usize];
            }
            temp[0] ^= RCON[i / nk - 1];
        } else if nk > 6 && i % nk == 4 {
            for b in temp.iter_mut() {
                *b = SBOX[*b as usize];
            }
        }
        let prev = w[i - nk];
        w.push([
            prev[0] ^ temp[0],
            prev[1] ^ temp[1],
            prev[2] ^ temp[2],
            prev[3] ^ temp[3],
        ]);
    }
    Some(w.into_iter().map(u32::from_be_bytes).collect())
}

/// Decryption schedule for the equivalent inverse cipher.
///
/// Round keys appear in the order the decrypt stubs apply them: the last
/// encryption round key first, the first one last, with InvMixColumns
/// folded into the middle rounds. The stubs whiten with words 0..4 and
/// finish `aesdeclast` with the final four words; there is no rotation
/// that moves the whitening key to the end.
pub fn decryption_key(enc: &[u32]) -> Vec<u32> {
    let nr = rounds(enc);
    let mut out = Vec::with_capacity(enc.len());
    for i in 0..=nr {
        let mut key = round_key(enc, nr - i);
        if i != 0 && i != nr {
            inv_mix_columns(&mut key);
        }
        out.extend(key.chunks(4).map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]])));
    }
    out
}

pub fn encrypt_block(enc: &[u32], input: &Block) -> Block {
    let nr = rounds(enc);
    let mut state = *input;
    add_round_key(&mut state, &round_key(enc, 0));
    for round in 1..nr {
        sub_bytes(&mut state, &SBOX);
        shift_rows(&mut state);
        mix_columns(&mut state);
        add_round_key(&mut state, &round_key(enc, round));
    }
    sub_bytes(&mut state, &SBOX);
    shift_rows(&mut state);
    add_round_key(&mut state, &round_key(enc, nr));
    state
}

/// Decrypt with a schedule from `decryption_key`.
pub fn decrypt_block(dec: &[u32], input: &Block) -> Block {
    let nr = rounds(dec);
    let mut state = *input;
    add_round_key(&mut state, &round_key(dec, 0));
    for round in 1..nr {
        sub_bytes(&mut state, &INV_SBOX);
        inv_shift_rows(&mut state);
        inv_mix_columns(&mut state);
        add_round_key(&mut state, &round_key(dec, round));
    }
    sub_bytes(&mut state, &INV_SBOX);
    inv_shift_rows(&mut state);
    add_round_key(&mut state, &round_key(dec, nr));
    state
}

/// CBC over whole blocks; `rvec` holds the IV and receives the last cipher block.
pub fn cbc_encrypt(enc: &[u32], rvec: &mut Block, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks_exact(16) {
        let mut block = *rvec;
        for (b, p) in block.iter_mut().zip(chunk) {
            *b ^= p;
        }
        *rvec = encrypt_block(enc, &block);
        out.extend_from_slice(rvec);
    }
    out
}

pub fn cbc_decrypt(dec: &[u32], rvec: &mut Block, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks_exact(16) {
        let mut cipher = [0u8; 16];
        cipher.copy_from_slice(chunk);
        let mut plain = decrypt_block(dec, &cipher);
        add_round_key(&mut plain, rvec);
        out.extend_from_slice(&plain);
        *rvec = cipher;
    }
    out
}

// ==================== Stubs ====================

fn load_key(masm: &mut MacroAssembler, dst: Xmm, key: Reg, offset: i32, mask: Xmm) {
    masm.movdqu_xm(dst, Address::new(key, offset));
    masm.pshufb(dst, mask);
}

fn emit_round(masm: &mut MacroAssembler, encrypt: bool, state: Xmm, key: Xmm) {
    if encrypt {
        masm.aesenc(state, key);
    } else {
        masm.aesdec(state, key);
    }
}

/// All rounds on `state`; the round count follows `keylen`.
fn emit_rounds(
    masm: &mut MacroAssembler,
    encrypt: bool,
    state: Xmm,
    temp: Xmm,
    key: Reg,
    keylen: Reg,
    mask: Xmm,
) {
    let do_last = masm.new_label();
    load_key(masm, temp, key, 0x00, mask);
    masm.pxor(state, temp);
    for offset in (0x10..=0x90).step_by(0x10) {
        load_key(masm, temp, key, offset, mask);
        emit_round(masm, encrypt, state, temp);
    }
    load_key(masm, temp, key, 0xA0, mask);
    masm.cmp_ri(keylen, 44);
    masm.jcc(Cond::E, do_last);
    emit_round(masm, encrypt, state, temp);
    load_key(masm, temp, key, 0xB0, mask);
    emit_round(masm, encrypt, state, temp);
    load_key(masm, temp, key, 0xC0, mask);
    masm.cmp_ri(keylen, 52);
    masm.jcc(Cond::E, do_last);
    emit_round(masm, encrypt, state, temp);
    load_key(masm, temp, key, 0xD0, mask);
    emit_round(masm, encrypt, state, temp);
    load_key(masm, temp, key, 0xE0, mask);
    masm.bind(do_last);
    if encrypt {
        masm.aesenclast(state, temp);
    } else {
        masm.aesdeclast(state, temp);
    }
}

/// `int aescrypt_{en,de}cryptBlock(byte* from, byte* to, int* key)`
pub fn generate_aescrypt_block(masm: &mut MacroAssembler, encrypt: bool) {
    let shuffle = masm.ctx().globals.aes_key_shuffle_mask;
    let (from, to, key, keylen) = (Reg::Edx, Reg::Edx, Reg::Ecx, Reg::Eax);
    let (result, mask, temp) = (Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm2);

    masm.enter();
    masm.mov_rm(from, Address::new(Reg::Ebp, 8));
    masm.mov_rm(key, Address::new(Reg::Ebp, 16));
    masm.mov_rm(keylen, Address::new(key, KEY_LENGTH_OFFSET));
    masm.movdqu_xm(mask, Address::absolute(shuffle));
    masm.movdqu_xm(result, Address::new(from, 0));
    masm.mov_rm(to, Address::new(Reg::Ebp, 12));
    emit_rounds(masm, encrypt, result, temp, key, keylen, mask);
    masm.movdqu_mx(Address::new(to, 0), result);
    masm.xor_rr(Reg::Eax, Reg::Eax);
    masm.leave();
    masm.ret(0);
}

/// `int cipherBlockChaining_{en,de}cryptAESCrypt(byte* from, byte* to,
/// int* key, byte* rvec, int len)`; returns `len`.
pub fn generate_cipher_block_chaining(masm: &mut MacroAssembler, encrypt: bool) {
    let shuffle = masm.ctx().globals.aes_key_shuffle_mask;
    let (from, to, key, rvec, len, keylen) =
        (Reg::Esi, Reg::Edi, Reg::Ecx, Reg::Ebx, Reg::Edx, Reg::Eax);
    let (result, mask, temp, prev, saved) = (Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm2, Xmm::Xmm3, Xmm::Xmm4);
    let next = masm.new_label();
    let done = masm.new_label();

    masm.enter();
    masm.push_r(Reg::Esi);
    masm.push_r(Reg::Edi);
    masm.push_r(Reg::Ebx);
    masm.mov_rm(from, Address::new(Reg::Ebp, 8));
    masm.mov_rm(to, Address::new(Reg::Ebp, 12));
    masm.mov_rm(key, Address::new(Reg::Ebp, 16));
    masm.mov_rm(rvec, Address::new(Reg::Ebp, 20));
    masm.mov_rm(len, Address::new(Reg::Ebp, 24));
    masm.mov_rm(keylen, Address::new(key, KEY_LENGTH_OFFSET));
    masm.movdqu_xm(mask, Address::absolute(shuffle));
    if encrypt {
        masm.movdqu_xm(result, Address::new(rvec, 0));
    } else {
        masm.movdqu_xm(prev, Address::new(rvec, 0));
    }

    masm.bind(next);
    masm.cmp_ri(len, 16);
    masm.jcc(Cond::L, done);
    if encrypt {
        masm.movdqu_xm(temp, Address::new(from, 0));
        masm.pxor(result, temp);
        emit_rounds(masm, true, result, temp, key, keylen, mask);
        masm.movdqu_mx(Address::new(to, 0), result);
    } else {
        masm.movdqu_xm(result, Address::new(from, 0));
        masm.movdqa_xx(saved, result);
        emit_rounds(masm, false, result, temp, key, keylen, mask);
        masm.pxor(result, prev);
        masm.movdqu_mx(Address::new(to, 0), result);
        masm.movdqa_xx(prev, saved);
    }
    masm.add_ri(from, 16);
    masm.add_ri(to, 16);
    masm.sub_ri(len, 16);
    masm.jmp(next);

    masm.bind(done);
    masm.movdqu_mx(Address::new(rvec, 0), if encrypt { result } else { prev });
    masm.mov_rm(Reg::Eax, Address::new(Reg::Ebp, 24));
    masm.pop_r(Reg::Ebx);
    masm.pop_r(Reg::Edi);
    masm.pop_r(Reg::Esi);
    masm.leave();
    masm.ret(0);
}
