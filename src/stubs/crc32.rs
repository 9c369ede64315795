//! CRC-32 (IEEE 802.3, reflected polynomial) for `updateBytesCRC32`.
//!
//! The stub walks the buffer a byte at a time through the 256-entry table
//! installed in the data section; blocks of four bytes are unrolled.

use crate::asm::{Address, Cond, MacroAssembler, Reg, Scale};

/// Reflected CRC-32 polynomial.
pub const POLY: u32 = 0xEDB8_8320;

const fn make_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { POLY ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

static TABLE: [u32; 256] = make_table();

/// The byte-indexed lookup table.
pub fn table() -> &'static [u32; 256] {
    &TABLE
}

/// Continue a CRC over `bytes`; `update(0, b)` is the CRC of `b`.
pub fn update(crc: u32, bytes: &[u8]) -> u32 {
    let mut c = !crc;
    for &b in bytes {
        c = TABLE[((c ^ b as u32) & 0xFF) as usize] ^ (c >> 8);
    }
    !c
}

fn gf2_times(mat: &[u32; 32], mut vec: u32) -> u32 {
    let mut sum = 0;
    let mut i = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_square(square: &mut [u32; 32], mat: &[u32; 32]) {
    for n in 0..32 {
        square[n] = gf2_times(mat, mat[n]);
    }
}

/// CRC of `A ++ B` given `crc(A)`, `crc(B)` and `len(B)`.
pub fn combine(mut crc1: u32, crc2: u32, mut len2: u64) -> u32 {
    if len2 == 0 {
        return crc1;
    }
    let mut even = [0u32; 32];
    let mut odd = [0u32; 32];
    // operator for one zero bit
    odd[0] = POLY;
    let mut row = 1;
    for slot in odd.iter_mut().skip(1) {
        *slot = row;
        row <<= 1;
    }
    gf2_square(&mut even, &odd);
    gf2_square(&mut odd, &even);
    loop {
        gf2_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1 = gf2_times(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
        gf2_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1 = gf2_times(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }
    crc1 ^ crc2
}

/// `crc = table[(crc ^ byte) & 0xff] ^ (crc >> 8)` for the byte at `adr`.
fn update_byte_crc32(masm: &mut MacroAssembler, crc: Reg, val: Reg, adr: Address, table: u32) {
    masm.movzxb_rm(val, adr);
    masm.xor_rr(val, crc);
    masm.and_ri(val, 0xFF);
    masm.shr_ri(crc, 8);
    masm.xor_rm(crc, Address::index_only(val, Scale::Times4, table as i32));
}

/// `int updateBytesCRC32(int crc, byte* buf, int len)`
pub fn generate_update_bytes_crc32(masm: &mut MacroAssembler) {
    let table = masm.ctx().globals.crc_table;
    let (crc, buf, len, val) = (Reg::Eax, Reg::Esi, Reg::Ecx, Reg::Edx);
    let words = masm.new_label();
    let bytes = masm.new_label();
    let done = masm.new_label();

    masm.push_r(buf);
    masm.mov_rm(crc, Address::new(Reg::Esp, 8));
    masm.mov_rm(buf, Address::new(Reg::Esp, 12));
    masm.mov_rm(len, Address::new(Reg::Esp, 16));
    masm.not_r(crc);

    masm.bind(words);
    masm.cmp_ri(len, 4);
    masm.jcc(Cond::L, bytes);
    for k in 0..4 {
        update_byte_crc32(masm, crc, val, Address::new(buf, k), table);
    }
    masm.add_ri(buf, 4);
    masm.sub_ri(len, 4);
    masm.jmp(words);

    masm.bind(bytes);
    masm.test_rr(len, len);
    masm.jcc(Cond::E, done);
    update_byte_crc32(masm, crc, val, Address::new(buf, 0), table);
    masm.inc_r(buf);
    masm.dec_r(len);
    masm.jmp(bytes);

    masm.bind(done);
    masm.not_r(crc);
    masm.pop_r(buf);
    masm.ret(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_table_entries() {
        assert_eq!(table()[0], 0);
        assert_eq!(table()[1], 0x7707_3096);
        assert_eq!(table()[255], 0x2D02_EF8D);
    }

    #[test]
    fn test_check_value() {
        assert_eq!(update(0, b"123456789"), 0xCBF4_3926);
        assert_eq!(update(0, b""), 0);
    }

    proptest! {
        #[test]
        fn prop_update_matches_crc32fast(crc in any::<u32>(), data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut hasher = crc32fast::Hasher::new_with_initial(crc);
            hasher.update(&data);
            prop_assert_eq!(update(crc, &data), hasher.finalize());
        }

        #[test]
        fn prop_combine_of_concatenation(
            a in proptest::collection::vec(any::<u8>(), 0..256),
            b in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let whole = [a.as_slice(), b.as_slice()].concat();
            let combined = combine(update(0, &a), update(0, &b), b.len() as u64);
            prop_assert_eq!(combined, crc32fast::hash(&whole));
        }
    }
}
