//! Runs generated stubs on an IA-32 host.
#![cfg(target_arch = "x86")]

use tmplvm::asm::NativeRegion;
use tmplvm::config::CpuFeatures;
use tmplvm::runtime::barrier::BarrierSet;
use tmplvm::runtime::basic_type::BasicType;
use tmplvm::runtime::entries::RuntimeEntries;
use tmplvm::runtime::layout::{klass, oop};
use tmplvm::runtime::memory32::NativeMemory;
use tmplvm::stubs::StubId;
use tmplvm::{RuntimeConfig, Universe};

const CODE_SIZE: usize = 0x0010_0000;
const DATA_SIZE: usize = 0x0002_0000;

struct Native {
    universe: Universe,
    _code: NativeRegion,
    _data: NativeRegion,
}

impl Native {
    fn new() -> Self {
        Self::with(|_| {})
    }

    fn with(adjust: impl FnOnce(&mut RuntimeConfig)) -> Self {
        let mut code = NativeRegion::new(CODE_SIZE).unwrap();
        let data = NativeRegion::new(DATA_SIZE).unwrap();
        let mut config = RuntimeConfig::default();
        config.cpu = CpuFeatures::detect();
        adjust(&mut config);
        config.layout.code_base = code.base().unwrap();
        config.layout.code_size = CODE_SIZE as u32;
        config.layout.data_base = data.base().unwrap();
        config.layout.data_size = DATA_SIZE as u32;
        let entries = RuntimeEntries::native(config.layout.runtime_base);
        let universe = Universe::generate_with(config, entries).unwrap();

        // SAFETY: the data section is a live writable mapping
        let mut mem = unsafe { NativeMemory::new() };
        universe.globals().install(&mut mem).unwrap();
        universe.interpreter().install(&mut mem).unwrap();
        universe.code_cache().install_native(&mut code).unwrap();
        code.make_executable().unwrap();
        Self {
            universe,
            _code: code,
            _data: data,
        }
    }

    fn stub(&self, id: StubId) -> usize {
        self.universe.stubs().get(id).unwrap() as usize
    }
}

#[test]
fn test_crc32_stub_matches_reference() {
    let native = Native::new();
    if native.universe.stubs().address(StubId::UpdateBytesCrc32).is_none() {
        return;
    }
    type Crc = extern "C" fn(u32, *const u8, i32) -> u32;
    let f: Crc = unsafe { std::mem::transmute(native.stub(StubId::UpdateBytesCrc32)) };
    let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 + 3) as u8).collect();
    for len in [0usize, 1, 3, 4, 5, 64, 1000] {
        assert_eq!(f(0, data.as_ptr(), len as i32), crc32fast::hash(&data[..len]), "len {len}");
    }
}

#[test]
fn test_safefetch_reads_valid_address() {
    let native = Native::new();
    type SafeFetch = extern "C" fn(*const i32, i32) -> i32;
    let f: SafeFetch = unsafe { std::mem::transmute(native.stub(StubId::SafeFetch32)) };
    let value = 0x1234_5678;
    assert_eq!(f(&value, -1), 0x1234_5678);
}

#[test]
fn test_int_copies_and_fill() {
    let native = Native::new();
    type Copy = extern "C" fn(*const i32, *mut i32, i32) -> i32;
    type Fill = extern "C" fn(*mut i32, i32, i32);

    let disjoint: Copy = unsafe { std::mem::transmute(native.stub(StubId::JintDisjointArraycopy)) };
    let from: Vec<i32> = (0..37).collect();
    let mut to = vec![0i32; 37];
    disjoint(from.as_ptr(), to.as_mut_ptr(), 37);
    assert_eq!(to, from);

    // overlapping move one element up
    let conjoint: Copy = unsafe { std::mem::transmute(native.stub(StubId::JintArraycopy)) };
    let mut buf: Vec<i32> = (0..20).collect();
    let p = buf.as_mut_ptr();
    conjoint(p, unsafe { p.add(1) }, 19);
    assert_eq!(buf[0], 0);
    assert_eq!(&buf[1..], &(0..19).collect::<Vec<_>>()[..]);

    let fill: Fill = unsafe { std::mem::transmute(native.stub(StubId::JintFill)) };
    let mut dst = vec![0i32; 13];
    fill(dst.as_mut_ptr(), -5, 12);
    assert!(dst[..12].iter().all(|&v| v == -5));
    assert_eq!(dst[12], 0);
}

#[test]
fn test_atomic_xchg_returns_previous() {
    let native = Native::new();
    type Xchg = extern "C" fn(i32, *mut i32) -> i32;
    let f: Xchg = unsafe { std::mem::transmute(native.stub(StubId::AtomicXchg)) };
    let mut cell = 11;
    assert_eq!(f(22, &mut cell), 11);
    assert_eq!(cell, 22);
}

#[test]
fn test_byte_copy_of_odd_length_stops_at_count() {
    let native = Native::new();
    type Copy = extern "C" fn(*const u8, *mut u8, i32);
    let f: Copy = unsafe { std::mem::transmute(native.stub(StubId::JbyteDisjointArraycopy)) };
    let from = [1u8, 2, 3, 4, 5, 6, 7];
    let mut to = [0u8; 8];
    f(from.as_ptr(), to.as_mut_ptr(), 7);
    assert_eq!(to, [1, 2, 3, 4, 5, 6, 7, 0]);
}

#[test]
fn test_checkcast_copy_stops_at_first_foreign_element() {
    const CARD_SHIFT: u32 = 9;
    let mut dst = Box::new([0u32; 4]);
    let mut cards = vec![0xFFu8; 4];
    let dst_addr = dst.as_ptr() as u32;
    let byte_map_base = (cards.as_mut_ptr() as u32).wrapping_sub(dst_addr >> CARD_SHIFT);
    let native = Native::with(|config| {
        config.barrier = BarrierSet::CardTable {
            byte_map_base,
            card_shift: CARD_SHIFT,
        };
    });

    // two unrelated klasses, each its own only primary super
    let word = |offset: i32| (offset / 4) as usize;
    let mut klass_a = Box::new([0u32; 32]);
    let mut klass_b = Box::new([0u32; 32]);
    for k in [&mut klass_a, &mut klass_b] {
        let addr = k.as_ptr() as u32;
        k[word(klass::SUPER_CHECK_OFFSET_OFFSET)] = klass::PRIMARY_SUPERS_OFFSET as u32;
        k[word(klass::PRIMARY_SUPERS_OFFSET)] = addr;
    }
    let object = |klass_addr: u32| {
        let mut obj = Box::new([0u32; 4]);
        obj[word(oop::KLASS_OFFSET)] = klass_addr;
        obj
    };
    let (a, b_klass) = (klass_a.as_ptr() as u32, klass_b.as_ptr() as u32);
    let (a1, a2, b, a3) = (object(a), object(a), object(b_klass), object(a));
    let src = [a1.as_ptr() as u32, a2.as_ptr() as u32, b.as_ptr() as u32, a3.as_ptr() as u32];

    type Checkcast = extern "C" fn(*const u32, *mut u32, i32, i32, u32) -> i32;
    let f: Checkcast = unsafe { std::mem::transmute(native.stub(StubId::CheckcastArraycopy)) };
    let ret = f(
        src.as_ptr(),
        dst.as_mut_ptr(),
        4,
        klass::PRIMARY_SUPERS_OFFSET,
        a,
    );
    assert_eq!(ret, !2);
    assert_eq!(*dst, [src[0], src[1], 0, 0]);
    assert_eq!(cards[0], 0);
}

#[cfg(target_os = "linux")]
#[test]
fn test_safefetch_recovers_from_fault() {
    let native = Native::new();
    tmplvm::stubs::publish(native.universe.stubs().clone()).unwrap();
    tmplvm::stubs::signals::install().unwrap();
    type SafeFetch = extern "C" fn(*const i32, i32) -> i32;
    let f: SafeFetch = unsafe { std::mem::transmute(native.stub(StubId::SafeFetch32)) };
    assert_eq!(f(std::ptr::null(), -1), -1);
    assert_eq!(f(std::ptr::null(), 7), 7);
}

fn fpu_control_word() -> u16 {
    let mut cw = 0u16;
    unsafe { std::arch::asm!("fnstcw word ptr [{}]", in(reg) &mut cw as *mut u16, options(nostack)) };
    cw
}

fn set_fpu_control_word(cw: u16) {
    unsafe { std::arch::asm!("fldcw word ptr [{}]", in(reg) &cw as *const u16, options(nostack)) };
}

fn mxcsr() -> u32 {
    let mut csr = 0u32;
    unsafe { std::arch::asm!("stmxcsr dword ptr [{}]", in(reg) &mut csr as *mut u32, options(nostack)) };
    csr
}

fn set_mxcsr(csr: u32) {
    unsafe { std::arch::asm!("ldmxcsr dword ptr [{}]", in(reg) &csr as *const u32, options(nostack)) };
}

#[test]
fn test_call_stub_returns_long_and_restores_control_words() {
    let native = Native::new();
    let use_sse = native.universe.config().cpu.use_sse > 0;

    // MOV EAX, 0xFEEDFACE; MOV EDX, 0xDEADBEEF; RET
    let mut entry = NativeRegion::new(16).unwrap();
    let entry_addr = entry.base().unwrap();
    entry
        .write_at(entry_addr, &[0xB8, 0xCE, 0xFA, 0xED, 0xFE, 0xBA, 0xEF, 0xBE, 0xAD, 0xDE, 0xC3])
        .unwrap();
    entry.make_executable().unwrap();
    let thread = [0u32; 64];

    type CallStub =
        extern "C" fn(*mut u8, *mut u64, i32, *const u8, u32, *const i32, i32, *const u32);
    let f: CallStub = unsafe { std::mem::transmute(native.stub(StubId::CallStub)) };

    let saved_cw = fpu_control_word();
    let saved_csr = if use_sse { mxcsr() } else { 0 };
    // truncating rounding in both units
    let cw = 0x0F7F;
    let csr = 0x7F80;
    set_fpu_control_word(cw);
    if use_sse {
        set_mxcsr(csr);
    }

    let mut result = 0u64;
    f(
        std::ptr::null_mut(),
        &mut result,
        BasicType::Long as i32,
        std::ptr::null(),
        entry_addr,
        std::ptr::null(),
        0,
        thread.as_ptr(),
    );
    let after_cw = fpu_control_word();
    let after_csr = if use_sse { mxcsr() } else { csr };
    set_fpu_control_word(saved_cw);
    if use_sse {
        set_mxcsr(saved_csr);
    }

    assert_eq!(result, 0xDEAD_BEEF_FEED_FACE);
    assert_eq!(after_cw, cw);
    assert_eq!(after_csr, csr);
}
