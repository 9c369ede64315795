//! Array copy and fill stubs.
//!
//! All copies take cdecl arguments and address elements, not arrays:
//! `(from, to, count)` with `count` in elements. Inside a copy `esi` is the
//! source, `edi` the destination and `ecx` the remaining byte count.
//! Reference copies wrap the bulk move in the collector's barriers.

use crate::asm::x86_32::{Mmx, OpSize};
use crate::asm::{Address, Cond, MacroAssembler, Reg, Scale, Xmm};
use crate::config::CopyWidth;
use crate::runtime::barrier::BarrierSet;
use crate::runtime::basic_type::BasicType;
use crate::runtime::entries::RuntimeEntry;
use crate::runtime::layout::{array, array_base_offset, klass, lh, oop};

/// Bulk chunk size in bytes.
const CHUNK: i32 = 64;

/// Shape of one typed copy stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyKind {
    pub ty: BasicType,
    /// Both arrays start on a word boundary (`arrayof_` variants)
    pub aligned: bool,
    /// Destination is freshly allocated; the SATB pre-barrier is skipped
    pub dest_uninitialized: bool,
}

impl CopyKind {
    pub fn new(ty: BasicType, aligned: bool) -> Self {
        Self {
            ty,
            aligned,
            dest_uninitialized: false,
        }
    }

    pub fn uninit(self) -> Self {
        Self {
            dest_uninitialized: true,
            ..self
        }
    }

    fn shift(&self) -> u32 {
        self.ty.element_size_log2()
    }

    fn is_oop(&self) -> bool {
        self.ty == BasicType::Object
    }
}

/// Conjoint copies the generic stub dispatches to, by element size.
#[derive(Debug, Clone, Copy)]
pub struct CopyTargets {
    pub byte: u32,
    pub short: u32,
    pub int: u32,
    pub long: u32,
    pub oop: u32,
    pub checkcast: u32,
}

// ==================== Shared pieces ====================

/// `enter; push esi; push edi` and load `(from, to, count)`.
fn copy_prologue(masm: &mut MacroAssembler) {
    masm.enter();
    masm.push_r(Reg::Esi);
    masm.push_r(Reg::Edi);
    masm.mov_rm(Reg::Esi, Address::new(Reg::Ebp, 8));
    masm.mov_rm(Reg::Edi, Address::new(Reg::Ebp, 12));
    masm.mov_rm(Reg::Ecx, Address::new(Reg::Ebp, 16));
}

fn copy_epilogue(masm: &mut MacroAssembler) {
    masm.pop_r(Reg::Edi);
    masm.pop_r(Reg::Esi);
    masm.leave();
    masm.ret(0);
}

/// Log the old contents of `count` reference slots at `to` before they
/// are overwritten. All registers survive.
fn array_pre_barrier(masm: &mut MacroAssembler, to: Reg, count: Reg, dest_uninitialized: bool) {
    if dest_uninitialized || !masm.ctx().barrier.has_pre_barrier() {
        return;
    }
    masm.pusha();
    masm.call_vm_leaf(RuntimeEntry::StaticWriteRefArrayPre, &[to, count]);
    masm.popa();
}

/// Dirty the cards covering `count` reference slots at `start`. Both
/// registers are clobbered; EAX survives.
fn array_post_barrier(masm: &mut MacroAssembler, start: Reg, count: Reg) {
    let barrier = masm.ctx().barrier;
    match barrier {
        BarrierSet::G1Satb { .. } => {
            masm.pusha();
            masm.call_vm_leaf(RuntimeEntry::StaticWriteRefArrayPost, &[start, count]);
            masm.popa();
        }
        BarrierSet::CardTable { .. } => {
            let done = masm.new_label();
            let dirty = masm.new_label();
            masm.test_rr(count, count);
            masm.jcc(Cond::E, done);
            // count = address of the last slot
            masm.lea(count, Address::indexed(start, count, Scale::Times4, -4));
            masm.shr_ri(start, barrier.card_shift() as u8);
            masm.shr_ri(count, barrier.card_shift() as u8);
            masm.sub_rr(count, start);
            masm.bind(dirty);
            masm.movb_mi(
                Address::indexed(start, count, Scale::Times1, barrier.byte_map_base() as i32),
                0,
            );
            masm.dec_r(count);
            masm.jcc(Cond::Ge, dirty);
            masm.bind(done);
        }
    }
}

/// One 64-byte chunk from `[esi + disp]` to `[edi + disp]`, optionally
/// indexed by `ecx`. Backward chunks move their units highest first.
fn copy_chunk(masm: &mut MacroAssembler, width: CopyWidth, indexed: bool, backward: bool) {
    let at = |base: Reg, disp: i32| {
        if indexed {
            Address::indexed(base, Reg::Ecx, Scale::Times1, disp)
        } else {
            Address::new(base, disp)
        }
    };
    let unit = match width {
        CopyWidth::Avx32 => 32,
        CopyWidth::Sse16 => 16,
        CopyWidth::Mmx8 | CopyWidth::Rep4 => 8,
    };
    let mut offsets: Vec<i32> = (0..CHUNK / unit).map(|k| k * unit).collect();
    if backward {
        offsets.reverse();
    }
    for (n, disp) in offsets.into_iter().enumerate() {
        match width {
            CopyWidth::Avx32 => {
                masm.vmovdqu_ym(Xmm::Xmm0, at(Reg::Esi, disp));
                masm.vmovdqu_my(at(Reg::Edi, disp), Xmm::Xmm0);
            }
            CopyWidth::Sse16 => {
                masm.movdqu_xm(Xmm::Xmm0, at(Reg::Esi, disp));
                masm.movdqu_mx(at(Reg::Edi, disp), Xmm::Xmm0);
            }
            CopyWidth::Mmx8 | CopyWidth::Rep4 => {
                let mm = if n % 2 == 0 { Mmx::Mm0 } else { Mmx::Mm1 };
                masm.movq_mmx_load(mm, at(Reg::Esi, disp));
                masm.movq_mmx_store(at(Reg::Edi, disp), mm);
            }
        }
    }
}

/// One 8-byte unit; a single access so that longs stay atomic.
fn copy_qword(masm: &mut MacroAssembler, width: CopyWidth, from: Address, to: Address) {
    match width {
        CopyWidth::Avx32 | CopyWidth::Sse16 => {
            masm.movq_xm(Xmm::Xmm0, from);
            masm.movq_mx(to, Xmm::Xmm0);
        }
        CopyWidth::Mmx8 => {
            masm.movq_mmx_load(Mmx::Mm0, from);
            masm.movq_mmx_store(to, Mmx::Mm0);
        }
        CopyWidth::Rep4 => {
            masm.fild_d(from);
            masm.fistp_d(to);
        }
    }
}

/// Forward copy of `ecx` bytes from `esi` to `edi`. Element size
/// `1 << shift` bounds which tails can occur.
fn copy_bytes_forward(masm: &mut MacroAssembler, shift: u32, aligned: bool, width: CopyWidth) {
    let tails = masm.new_label();
    let done = masm.new_label();

    masm.cmp_ri(Reg::Ecx, 8);
    masm.jcc(Cond::B, tails);

    // align the destination to a word
    if !aligned && shift < 2 {
        if shift == 0 {
            let even = masm.new_label();
            masm.test_ri(Reg::Edi, 1);
            masm.jcc(Cond::E, even);
            masm.movzxb_rm(Reg::Eax, Address::new(Reg::Esi, 0));
            masm.movb_mr(Address::new(Reg::Edi, 0), Reg::Eax);
            masm.inc_r(Reg::Esi);
            masm.inc_r(Reg::Edi);
            masm.dec_r(Reg::Ecx);
            masm.bind(even);
        }
        let word = masm.new_label();
        masm.test_ri(Reg::Edi, 2);
        masm.jcc(Cond::E, word);
        masm.movzxw_rm(Reg::Eax, Address::new(Reg::Esi, 0));
        masm.movw_mr(Address::new(Reg::Edi, 0), Reg::Eax);
        masm.add_ri(Reg::Esi, 2);
        masm.add_ri(Reg::Edi, 2);
        masm.sub_ri(Reg::Ecx, 2);
        masm.bind(word);
    }

    if width == CopyWidth::Rep4 && shift < 3 {
        masm.mov_rr(Reg::Eax, Reg::Ecx);
        masm.shr_ri(Reg::Ecx, 2);
        masm.rep_movs(OpSize::Dword);
        masm.mov_rr(Reg::Ecx, Reg::Eax);
        masm.and_ri(Reg::Ecx, 3);
    } else {
        let chunks = masm.new_label();
        let qwords = masm.new_label();
        let bulk_done = masm.new_label();
        if width != CopyWidth::Rep4 {
            masm.bind(chunks);
            masm.cmp_ri(Reg::Ecx, CHUNK);
            masm.jcc(Cond::B, qwords);
            copy_chunk(masm, width, false, false);
            masm.add_ri(Reg::Esi, CHUNK);
            masm.add_ri(Reg::Edi, CHUNK);
            masm.sub_ri(Reg::Ecx, CHUNK);
            masm.jmp(chunks);
        }
        masm.bind(qwords);
        masm.cmp_ri(Reg::Ecx, 8);
        masm.jcc(Cond::B, bulk_done);
        copy_qword(masm, width, Address::new(Reg::Esi, 0), Address::new(Reg::Edi, 0));
        masm.add_ri(Reg::Esi, 8);
        masm.add_ri(Reg::Edi, 8);
        masm.sub_ri(Reg::Ecx, 8);
        masm.jmp(qwords);
        masm.bind(bulk_done);
        if width == CopyWidth::Mmx8 {
            masm.emms();
        }
    }

    masm.bind(tails);
    if shift <= 2 {
        let next = masm.new_label();
        masm.test_ri(Reg::Ecx, 4);
        masm.jcc(Cond::E, next);
        masm.mov_rm(Reg::Eax, Address::new(Reg::Esi, 0));
        masm.mov_mr(Address::new(Reg::Edi, 0), Reg::Eax);
        masm.add_ri(Reg::Esi, 4);
        masm.add_ri(Reg::Edi, 4);
        masm.bind(next);
    }
    if shift <= 1 {
        let next = masm.new_label();
        masm.test_ri(Reg::Ecx, 2);
        masm.jcc(Cond::E, next);
        masm.movzxw_rm(Reg::Eax, Address::new(Reg::Esi, 0));
        masm.movw_mr(Address::new(Reg::Edi, 0), Reg::Eax);
        masm.add_ri(Reg::Esi, 2);
        masm.add_ri(Reg::Edi, 2);
        masm.bind(next);
    }
    if shift == 0 {
        masm.test_ri(Reg::Ecx, 1);
        masm.jcc(Cond::E, done);
        masm.movzxb_rm(Reg::Eax, Address::new(Reg::Esi, 0));
        masm.movb_mr(Address::new(Reg::Edi, 0), Reg::Eax);
    }
    masm.bind(done);
}

/// Backward copy of `ecx` bytes; `esi` and `edi` stay at the start of
/// the ranges and `ecx` walks down from the end.
fn copy_bytes_backward(masm: &mut MacroAssembler, shift: u32, width: CopyWidth) {
    let src = |disp| Address::indexed(Reg::Esi, Reg::Ecx, Scale::Times1, disp);
    let dst = |disp| Address::indexed(Reg::Edi, Reg::Ecx, Scale::Times1, disp);
    let done = masm.new_label();

    // odd tails sit at the high end
    if shift == 0 {
        let next = masm.new_label();
        masm.test_ri(Reg::Ecx, 1);
        masm.jcc(Cond::E, next);
        masm.dec_r(Reg::Ecx);
        masm.movzxb_rm(Reg::Eax, src(0));
        masm.movb_mr(dst(0), Reg::Eax);
        masm.bind(next);
    }
    if shift <= 1 {
        let next = masm.new_label();
        masm.test_ri(Reg::Ecx, 2);
        masm.jcc(Cond::E, next);
        masm.sub_ri(Reg::Ecx, 2);
        masm.movzxw_rm(Reg::Eax, src(0));
        masm.movw_mr(dst(0), Reg::Eax);
        masm.bind(next);
    }
    if shift <= 2 {
        let next = masm.new_label();
        masm.test_ri(Reg::Ecx, 4);
        masm.jcc(Cond::E, next);
        masm.sub_ri(Reg::Ecx, 4);
        masm.mov_rm(Reg::Eax, src(0));
        masm.mov_mr(dst(0), Reg::Eax);
        masm.bind(next);
    }

    if width == CopyWidth::Rep4 && shift < 3 {
        masm.test_rr(Reg::Ecx, Reg::Ecx);
        masm.jcc(Cond::E, done);
        masm.lea(Reg::Esi, src(-4));
        masm.lea(Reg::Edi, dst(-4));
        masm.shr_ri(Reg::Ecx, 2);
        masm.std();
        masm.rep_movs(OpSize::Dword);
        masm.cld();
    } else {
        let chunks = masm.new_label();
        let qwords = masm.new_label();
        let bulk_done = masm.new_label();
        if width != CopyWidth::Rep4 {
            masm.bind(chunks);
            masm.cmp_ri(Reg::Ecx, CHUNK);
            masm.jcc(Cond::B, qwords);
            masm.sub_ri(Reg::Ecx, CHUNK);
            copy_chunk(masm, width, true, true);
            masm.jmp(chunks);
        }
        masm.bind(qwords);
        masm.test_rr(Reg::Ecx, Reg::Ecx);
        masm.jcc(Cond::E, bulk_done);
        masm.sub_ri(Reg::Ecx, 8);
        copy_qword(masm, width, src(0), dst(0));
        masm.jmp(qwords);
        masm.bind(bulk_done);
        if width == CopyWidth::Mmx8 {
            masm.emms();
        }
    }
    masm.bind(done);
}

/// Jump to `disjoint` unless `to` lies inside `(from, from + bytes)`.
/// Arguments are still at `[esp + 4]`.
fn overlap_check(masm: &mut MacroAssembler, shift: u32, disjoint: u32) {
    masm.mov_rm(Reg::Eax, Address::new(Reg::Esp, 4));
    masm.mov_rm(Reg::Edx, Address::new(Reg::Esp, 8));
    masm.mov_rm(Reg::Ecx, Address::new(Reg::Esp, 12));
    masm.cmp_rr(Reg::Edx, Reg::Eax);
    masm.jcc_abs(Cond::Be, disjoint);
    masm.lea(Reg::Ecx, Address::indexed(Reg::Eax, Reg::Ecx, Scale::from_log2(shift), 0));
    masm.cmp_rr(Reg::Edx, Reg::Ecx);
    masm.jcc_abs(Cond::Ae, disjoint);
}

// ==================== Typed copies ====================

/// `T_disjoint_arraycopy(from, to, count)`
pub fn generate_disjoint_copy(masm: &mut MacroAssembler, kind: CopyKind) {
    let width = masm.ctx().cpu.copy_width();
    let shift = kind.shift();
    let exit = masm.new_label();

    copy_prologue(masm);
    masm.test_rr(Reg::Ecx, Reg::Ecx);
    masm.jcc(Cond::E, exit);
    if kind.is_oop() {
        array_pre_barrier(masm, Reg::Edi, Reg::Ecx, kind.dest_uninitialized);
    }
    if shift > 0 {
        masm.shl_ri(Reg::Ecx, shift as u8);
    }
    copy_bytes_forward(masm, shift, kind.aligned, width);
    if kind.is_oop() {
        masm.mov_rm(Reg::Edi, Address::new(Reg::Ebp, 12));
        masm.mov_rm(Reg::Ecx, Address::new(Reg::Ebp, 16));
        array_post_barrier(masm, Reg::Edi, Reg::Ecx);
    }
    masm.bind(exit);
    masm.xor_rr(Reg::Eax, Reg::Eax);
    copy_epilogue(masm);
}

/// `T_arraycopy(from, to, count)`: ranges may overlap.
pub fn generate_conjoint_copy(masm: &mut MacroAssembler, kind: CopyKind, disjoint: u32) {
    let width = masm.ctx().cpu.copy_width();
    let shift = kind.shift();
    let exit = masm.new_label();

    overlap_check(masm, shift, disjoint);
    copy_prologue(masm);
    masm.test_rr(Reg::Ecx, Reg::Ecx);
    masm.jcc(Cond::E, exit);
    if kind.is_oop() {
        array_pre_barrier(masm, Reg::Edi, Reg::Ecx, kind.dest_uninitialized);
    }
    if shift > 0 {
        masm.shl_ri(Reg::Ecx, shift as u8);
    }
    copy_bytes_backward(masm, shift, width);
    if kind.is_oop() {
        masm.mov_rm(Reg::Edi, Address::new(Reg::Ebp, 12));
        masm.mov_rm(Reg::Ecx, Address::new(Reg::Ebp, 16));
        array_post_barrier(masm, Reg::Edi, Reg::Ecx);
    }
    masm.bind(exit);
    masm.xor_rr(Reg::Eax, Reg::Eax);
    copy_epilogue(masm);
}

/// `checkcast_arraycopy(from, to, count, ckoff, ckval)`
///
/// Copies references while each element is null or a subtype of `ckval`.
/// Returns 0 when everything was copied, otherwise `~K` for the `K`
/// elements copied before the first failing one.
pub fn generate_checkcast_copy(masm: &mut MacroAssembler, dest_uninitialized: bool) {
    let ckoff = Address::new(Reg::Ebp, 20);
    let ckval = Address::new(Reg::Ebp, 24);
    let (elem, elem_klass, count, temp) = (Reg::Eax, Reg::Ebx, Reg::Ecx, Reg::Edx);
    let from_at = Address::indexed(Reg::Esi, count, Scale::Times4, 0);
    let to_at = Address::indexed(Reg::Edi, count, Scale::Times4, 0);

    let store = masm.new_label();
    let load = masm.new_label();
    let all_copied = masm.new_label();
    let failed = masm.new_label();
    let scan = masm.new_label();
    let hit = masm.new_label();
    let miss = masm.new_label();
    let barrier = masm.new_label();
    let exit = masm.new_label();

    copy_prologue(masm);
    masm.push_r(Reg::Ebx);
    masm.xor_rr(Reg::Eax, Reg::Eax);
    masm.test_rr(count, count);
    masm.jcc(Cond::E, exit);
    array_pre_barrier(masm, Reg::Edi, count, dest_uninitialized);

    // walk up from -count with end pointers
    masm.lea(Reg::Esi, from_at);
    masm.lea(Reg::Edi, to_at);
    masm.neg_r(count);
    masm.jmp(load);

    masm.bind(store);
    masm.mov_mr(to_at, elem);
    masm.inc_r(count);
    masm.jcc(Cond::E, all_copied);

    masm.bind(load);
    masm.mov_rm(elem, from_at);
    masm.test_rr(elem, elem);
    masm.jcc(Cond::E, store);
    masm.load_klass(elem_klass, elem);
    masm.mov_rm(temp, ckval);
    masm.cmp_rr(elem_klass, temp);
    masm.jcc(Cond::E, store);
    masm.mov_rm(temp, ckoff);
    masm.mov_rm(temp, Address::indexed(elem_klass, temp, Scale::Times1, 0));
    masm.cmp_rm(temp, ckval);
    masm.jcc(Cond::E, store);
    masm.cmp_mi(ckoff, klass::SECONDARY_SUPER_CACHE_OFFSET);
    masm.jcc(Cond::Ne, failed);

    // secondary supers of the element klass
    masm.push_r(count);
    masm.push_r(Reg::Edi);
    masm.mov_rm(temp, ckval);
    masm.mov_rm(Reg::Edi, Address::new(elem_klass, klass::SECONDARY_SUPERS_OFFSET));
    masm.mov_rm(count, Address::new(Reg::Edi, 0));
    masm.add_ri(Reg::Edi, 4);
    masm.bind(scan);
    masm.test_rr(count, count);
    masm.jcc(Cond::E, miss);
    masm.cmp_rm(temp, Address::new(Reg::Edi, 0));
    masm.jcc(Cond::E, hit);
    masm.add_ri(Reg::Edi, 4);
    masm.dec_r(count);
    masm.jmp(scan);
    masm.bind(hit);
    masm.mov_mr(Address::new(elem_klass, klass::SECONDARY_SUPER_CACHE_OFFSET), temp);
    masm.pop_r(Reg::Edi);
    masm.pop_r(count);
    masm.jmp(store);
    masm.bind(miss);
    masm.pop_r(Reg::Edi);
    masm.pop_r(count);

    // K = count + (-remaining)
    masm.bind(failed);
    masm.mov_rm(Reg::Eax, Address::new(Reg::Ebp, 16));
    masm.add_rr(Reg::Eax, count);
    masm.mov_rr(count, Reg::Eax);
    masm.not_r(Reg::Eax);
    masm.jmp(barrier);

    masm.bind(all_copied);
    masm.xor_rr(Reg::Eax, Reg::Eax);
    masm.mov_rm(count, Address::new(Reg::Ebp, 16));
    masm.bind(barrier);
    masm.mov_rm(Reg::Edi, Address::new(Reg::Ebp, 12));
    array_post_barrier(masm, Reg::Edi, count);

    masm.bind(exit);
    masm.pop_r(Reg::Ebx);
    copy_epilogue(masm);
}

/// `unsafe_arraycopy(from, to, byte_count)`: picks the widest element
/// size all three arguments are aligned to and tail-calls that copy.
/// `targets` are the byte, short, int and long conjoint copies.
pub fn generate_unsafe_copy(masm: &mut MacroAssembler, targets: [u32; 4]) {
    let count = Address::new(Reg::Esp, 12);
    let mut labels = Vec::new();

    masm.mov_rm(Reg::Eax, Address::new(Reg::Esp, 4));
    masm.or_rm(Reg::Eax, Address::new(Reg::Esp, 8));
    masm.or_rm(Reg::Eax, count);
    for shift in (1..4u32).rev() {
        let label = masm.new_label();
        masm.test_ri(Reg::Eax, (1 << shift) - 1);
        masm.jcc(Cond::E, label);
        labels.push((shift, label));
    }
    masm.jmp_abs(targets[0]);
    for (shift, label) in labels {
        masm.bind(label);
        masm.mov_rm(Reg::Ecx, count);
        masm.shr_ri(Reg::Ecx, shift as u8);
        masm.mov_mr(count, Reg::Ecx);
        masm.jmp_abs(targets[shift as usize]);
    }
}

/// `generic_arraycopy(src, src_pos, dst, dst_pos, length)`
///
/// Validates both arrays and dispatches on their layout helpers. Returns
/// -1 when the caller must take the slow path (which raises the
/// exception), otherwise whatever the selected copy returns.
pub fn generate_generic_copy(masm: &mut MacroAssembler, targets: &CopyTargets) {
    let (src, dst) = (Reg::Esi, Reg::Edi);
    let (src_klass, dst_klass, layout, temp) = (Reg::Edx, Reg::Eax, Reg::Ebx, Reg::Ecx);
    let src_pos = Address::new(Reg::Ebp, 12);
    let dst_pos = Address::new(Reg::Ebp, 20);
    let length = Address::new(Reg::Ebp, 24);

    let failed = masm.new_label();
    let exit = masm.new_label();
    let different_klass = masm.new_label();
    let obj_array = masm.new_label();
    let plain_oop = masm.new_label();

    masm.enter();
    masm.push_r(Reg::Esi);
    masm.push_r(Reg::Edi);
    masm.push_r(Reg::Ebx);

    masm.mov_rm(src, Address::new(Reg::Ebp, 8));
    masm.test_rr(src, src);
    masm.jcc(Cond::E, failed);
    masm.mov_rm(dst, Address::new(Reg::Ebp, 16));
    masm.test_rr(dst, dst);
    masm.jcc(Cond::E, failed);
    for arg in [src_pos, dst_pos, length] {
        masm.cmp_mi(arg, 0);
        masm.jcc(Cond::L, failed);
    }

    masm.mov_rm(src_klass, Address::new(src, oop::KLASS_OFFSET));
    masm.mov_rm(layout, Address::new(src_klass, klass::LAYOUT_HELPER_OFFSET));
    masm.cmp_ri(layout, lh::NEUTRAL_VALUE);
    masm.jcc(Cond::Ge, failed);
    masm.mov_rm(dst_klass, Address::new(dst, oop::KLASS_OFFSET));
    masm.cmp_rr(src_klass, dst_klass);
    masm.jcc(Cond::Ne, different_klass);

    bounds_check(masm, src, src_pos, length, temp, failed);
    bounds_check(masm, dst, dst_pos, length, temp, failed);
    masm.mov_rr(temp, layout);
    masm.shr_ri(temp, lh::ARRAY_TAG_SHIFT as u8);
    masm.cmp_ri(temp, lh::ARRAY_TAG_OBJ_VALUE as i32);
    masm.jcc(Cond::E, obj_array);

    // primitive arrays: header and element size from the layout helper
    masm.mov_rr(temp, layout);
    masm.shr_ri(temp, lh::HEADER_SIZE_SHIFT as u8);
    masm.and_ri(temp, lh::HEADER_SIZE_MASK);
    masm.add_rr(src, temp);
    masm.add_rr(dst, temp);
    masm.and_ri(layout, lh::LOG2_ELEMENT_SIZE_MASK);
    masm.mov_rr(temp, layout);
    masm.mov_rm(Reg::Eax, src_pos);
    masm.shl_cl(Reg::Eax);
    masm.add_rr(src, Reg::Eax);
    masm.mov_rm(Reg::Eax, dst_pos);
    masm.shl_cl(Reg::Eax);
    masm.add_rr(dst, Reg::Eax);
    let by_size = [targets.byte, targets.short, targets.int, targets.long];
    for (log2, &target) in by_size.iter().enumerate() {
        let next = masm.new_label();
        if log2 < 3 {
            masm.cmp_ri(layout, log2 as i32);
            masm.jcc(Cond::Ne, next);
        }
        call_copy(masm, target, &[length]);
        masm.jmp(exit);
        masm.bind(next);
    }

    masm.bind(obj_array);
    oop_bases(masm, src_pos, dst_pos, temp);
    call_copy(masm, targets.oop, &[length]);
    masm.jmp(exit);

    // object arrays of different classes
    masm.bind(different_klass);
    masm.mov_rr(temp, layout);
    masm.shr_ri(temp, lh::ARRAY_TAG_SHIFT as u8);
    masm.cmp_ri(temp, lh::ARRAY_TAG_OBJ_VALUE as i32);
    masm.jcc(Cond::Ne, failed);
    masm.mov_rm(temp, Address::new(dst_klass, klass::LAYOUT_HELPER_OFFSET));
    masm.shr_ri(temp, lh::ARRAY_TAG_SHIFT as u8);
    masm.cmp_ri(temp, lh::ARRAY_TAG_OBJ_VALUE as i32);
    masm.jcc(Cond::Ne, failed);
    bounds_check(masm, src, src_pos, length, temp, failed);
    bounds_check(masm, dst, dst_pos, length, temp, failed);
    oop_bases(masm, src_pos, dst_pos, temp);
    masm.check_klass_subtype(src_klass, dst_klass, temp, layout, plain_oop);
    // element-wise check against the destination element klass
    masm.mov_rm(dst_klass, Address::new(dst_klass, klass::ELEMENT_KLASS_OFFSET));
    masm.mov_rm(temp, Address::new(dst_klass, klass::SUPER_CHECK_OFFSET_OFFSET));
    masm.push_r(dst_klass);
    masm.push_r(temp);
    call_copy(masm, targets.checkcast, &[length]);
    masm.add_ri(Reg::Esp, 8);
    masm.jmp(exit);

    masm.bind(plain_oop);
    call_copy(masm, targets.oop, &[length]);
    masm.jmp(exit);

    masm.bind(failed);
    masm.mov_ri(Reg::Eax, -1);
    masm.bind(exit);
    masm.pop_r(Reg::Ebx);
    masm.pop_r(Reg::Edi);
    masm.pop_r(Reg::Esi);
    masm.leave();
    masm.ret(0);
}

/// Fail unless `pos + length <= array.length` (unsigned, so an
/// overflowing sum fails too).
fn bounds_check(
    masm: &mut MacroAssembler,
    array_reg: Reg,
    pos: Address,
    length: Address,
    temp: Reg,
    failed: crate::asm::Label,
) {
    masm.mov_rm(temp, pos);
    masm.add_rm(temp, length);
    masm.cmp_rm(temp, Address::new(array_reg, array::LENGTH_OFFSET));
    masm.jcc(Cond::A, failed);
}

/// Turn `esi`/`edi` from arrays into the addresses of the first
/// reference slot to copy.
fn oop_bases(masm: &mut MacroAssembler, src_pos: Address, dst_pos: Address, temp: Reg) {
    let base = array_base_offset(BasicType::Object);
    masm.mov_rm(temp, src_pos);
    masm.lea(Reg::Esi, Address::indexed(Reg::Esi, temp, Scale::Times4, base));
    masm.mov_rm(temp, dst_pos);
    masm.lea(Reg::Edi, Address::indexed(Reg::Edi, temp, Scale::Times4, base));
}

/// Call `target(esi, edi, extra...)`; `extra` words are pushed from the
/// frame, last first, on top of anything already pushed.
fn call_copy(masm: &mut MacroAssembler, target: u32, extra: &[Address]) {
    for &arg in extra.iter().rev() {
        masm.push_m(arg);
    }
    masm.push_r(Reg::Edi);
    masm.push_r(Reg::Esi);
    masm.call_abs(target);
    masm.add_ri(Reg::Esp, 4 * (2 + extra.len() as i32));
}

// ==================== Fills ====================

/// `T_fill(to, value, count)` for byte, short and int elements.
pub fn generate_fill(masm: &mut MacroAssembler, ty: BasicType, aligned: bool) {
    let shift = ty.element_size_log2();
    let wide = matches!(masm.ctx().cpu.copy_width(), CopyWidth::Avx32 | CopyWidth::Sse16);
    let (to, value, count) = (Reg::Edi, Reg::Eax, Reg::Ecx);
    let tails = masm.new_label();
    let done = masm.new_label();

    masm.push_r(Reg::Edi);
    masm.mov_rm(to, Address::new(Reg::Esp, 8));
    masm.mov_rm(value, Address::new(Reg::Esp, 12));
    masm.mov_rm(count, Address::new(Reg::Esp, 16));

    // replicate the element across the word
    if shift == 0 {
        masm.and_ri(value, 0xFF);
        masm.mov_rr(Reg::Edx, value);
        masm.shl_ri(Reg::Edx, 8);
        masm.or_rr(value, Reg::Edx);
    }
    if shift <= 1 {
        masm.and_ri(value, 0xFFFF);
        masm.mov_rr(Reg::Edx, value);
        masm.shl_ri(Reg::Edx, 16);
        masm.or_rr(value, Reg::Edx);
    }
    if shift > 0 {
        masm.shl_ri(count, shift as u8);
    }

    masm.cmp_ri(count, 8);
    masm.jcc(Cond::B, tails);
    if !aligned && shift < 2 {
        if shift == 0 {
            let even = masm.new_label();
            masm.test_ri(to, 1);
            masm.jcc(Cond::E, even);
            masm.movb_mr(Address::new(to, 0), value);
            masm.inc_r(to);
            masm.dec_r(count);
            masm.bind(even);
        }
        let word = masm.new_label();
        masm.test_ri(to, 2);
        masm.jcc(Cond::E, word);
        masm.movw_mr(Address::new(to, 0), value);
        masm.add_ri(to, 2);
        masm.sub_ri(count, 2);
        masm.bind(word);
    }

    if wide {
        let blocks = masm.new_label();
        masm.movd_xr(Xmm::Xmm0, value);
        masm.pshufd(Xmm::Xmm0, Xmm::Xmm0, 0);
        masm.bind(blocks);
        masm.cmp_ri(count, 16);
        masm.jcc(Cond::B, tails);
        masm.movdqu_mx(Address::new(to, 0), Xmm::Xmm0);
        masm.add_ri(to, 16);
        masm.sub_ri(count, 16);
        masm.jmp(blocks);
    } else {
        masm.mov_rr(Reg::Edx, count);
        masm.shr_ri(count, 2);
        masm.rep_stos(OpSize::Dword);
        masm.mov_rr(count, Reg::Edx);
        masm.and_ri(count, 3);
    }

    masm.bind(tails);
    let mut step = 8;
    while step >= 1 << shift {
        let next = masm.new_label();
        masm.test_ri(count, step);
        masm.jcc(Cond::E, next);
        match step {
            8 => {
                masm.mov_mr(Address::new(to, 0), value);
                masm.mov_mr(Address::new(to, 4), value);
            }
            4 => masm.mov_mr(Address::new(to, 0), value),
            2 => masm.movw_mr(Address::new(to, 0), value),
            _ => masm.movb_mr(Address::new(to, 0), value),
        }
        if step > 1 {
            masm.add_ri(to, step);
        }
        masm.bind(next);
        step /= 2;
    }
    masm.bind(done);
    masm.pop_r(Reg::Edi);
    masm.ret(0);
}
