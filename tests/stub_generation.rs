//! Stub generation through the public driver, plus the host reference
//! routines the crypto stubs are checked against.

use proptest::prelude::*;

use tmplvm::asm::RelocKind;
use tmplvm::code_cache::{BlobKind, CodeBlob};
use tmplvm::runtime::barrier::{BarrierSet, CARD_SHIFT};
use tmplvm::runtime::entries::RuntimeEntry;
use tmplvm::stubs::{self, aes, crc32, ghash, StubId};
use tmplvm::{RuntimeConfig, Universe};

fn generate(config: RuntimeConfig) -> Universe {
    Universe::generate(config).unwrap()
}

#[test]
fn test_every_stub_lies_in_its_own_blob() {
    let universe = generate(RuntimeConfig::default());
    let cache = universe.code_cache();
    for entry in universe.stub_entries() {
        let blob = cache
            .find_blob(entry.address)
            .unwrap_or_else(|| panic!("{} at {:#x} has no blob", entry.name, entry.address));
        assert!(
            matches!(blob.kind, BlobKind::Stub | BlobKind::RuntimeStub { .. }),
            "{} is in {:?}",
            entry.name,
            blob.kind
        );
    }
}

#[test]
fn test_stub_names_resolve_from_pcs() {
    let universe = generate(RuntimeConfig::default());
    let routines = universe.stubs();
    let crc = routines.get(StubId::UpdateBytesCrc32).unwrap();
    assert_eq!(routines.stub_name_at(crc), Some(StubId::UpdateBytesCrc32.name()));
    assert_eq!(routines.stub_name_at(crc + 1), Some(StubId::UpdateBytesCrc32.name()));
    let interp = universe.interpreter().code_begin();
    assert_eq!(routines.stub_name_at(interp), None);
}

#[test]
fn test_call_stub_return_address_is_inside_call_stub() {
    let universe = generate(RuntimeConfig::default());
    let routines = universe.stubs();
    let call_stub = routines.get(StubId::CallStub).unwrap();
    let ret = routines.get(StubId::CallStubReturnAddress).unwrap();
    let blob = universe.code_cache().find_blob(call_stub).unwrap();
    assert!(blob.contains(ret));
    assert!(ret > call_stub);
}

#[test]
fn test_word_aliases() {
    let universe = generate(RuntimeConfig::default());
    let r = universe.stubs();
    assert_eq!(r.get(StubId::SafeFetchN).unwrap(), r.get(StubId::SafeFetch32).unwrap());
    assert_eq!(r.get(StubId::AtomicXchgPtr).unwrap(), r.get(StubId::AtomicXchg).unwrap());
    let fault = r.get(StubId::SafeFetch32FaultPc).unwrap();
    assert_eq!(
        r.continuation_for_safefetch_fault(fault),
        Some(r.get(StubId::SafeFetch32ContinuationPc).unwrap())
    );
    assert_eq!(r.continuation_for_safefetch_fault(fault + 1), None);
}

#[test]
fn test_generation_without_sse_or_intrinsics() {
    let mut config = RuntimeConfig::default();
    config.cpu.use_sse = 0;
    config.cpu.use_avx = 0;
    config.cpu.mmx = false;
    config.cpu.aes = false;
    config.cpu.clmul = false;
    config.use_crc32_intrinsics = false;
    let universe = generate(config);
    assert!(!universe.config().use_aes_intrinsics);
    assert!(universe.stubs().address(StubId::UpdateBytesCrc32).is_none());
    assert!(universe.stubs().address(StubId::AescryptEncryptBlock).is_none());
    assert!(universe.stubs().address(StubId::JlongDisjointArraycopy).is_some());
}

fn oop_copy_blob(u: &Universe) -> &CodeBlob {
    let addr = u.stubs().get(StubId::OopDisjointArraycopy).unwrap();
    u.code_cache().find_blob(addr).unwrap()
}

fn runtime_calls(blob: &CodeBlob) -> Vec<u32> {
    blob.relocations
        .iter()
        .filter(|r| r.kind == RelocKind::RuntimeCall)
        .map(|r| r.target)
        .collect()
}

#[test]
fn test_g1_oop_copy_calls_both_barriers() {
    let mut config = RuntimeConfig::default();
    let byte_map_base = config.barrier.byte_map_base();
    config.barrier = BarrierSet::G1Satb {
        byte_map_base,
        card_shift: CARD_SHIFT,
        region_log: 20,
    };
    let g1 = generate(config);
    let pre = g1.context().entry(RuntimeEntry::StaticWriteRefArrayPre);
    let post = g1.context().entry(RuntimeEntry::StaticWriteRefArrayPost);
    assert_eq!(runtime_calls(oop_copy_blob(&g1)), vec![pre, post]);
}

#[test]
fn test_card_table_oop_copy_dirties_cards_inline() {
    let card = generate(RuntimeConfig::default());
    let blob = oop_copy_blob(&card);
    assert!(runtime_calls(blob).is_empty());

    // MOV byte [base + index + byte_map_base], 0 = C6 84 sib disp32 00
    let disp = card.config().barrier.byte_map_base().to_le_bytes();
    let stores_zero = blob
        .code
        .windows(8)
        .any(|w| w[0] == 0xC6 && w[1] == 0x84 && w[3..7] == disp && w[7] == 0x00);
    assert!(stores_zero, "no card store over {:#x}", card.config().barrier.byte_map_base());
}

#[test]
fn test_publish_once() {
    let universe = generate(RuntimeConfig::default());
    let published = stubs::publish(universe.stubs().clone()).unwrap();
    assert_eq!(published.get(StubId::CallStub).unwrap(), universe.stubs().get(StubId::CallStub).unwrap());
    assert!(stubs::published().is_some());
    assert!(stubs::publish(universe.stubs().clone()).is_err());
}

#[test]
fn test_aes_cbc_round_trip() {
    let key: Vec<u8> = (0u8..16).collect();
    let enc = aes::expand_key(&key).unwrap();
    let dec = aes::decryption_key(&enc);
    let data: Vec<u8> = (0..64u8).map(|b| b.wrapping_mul(37)).collect();
    let iv = [0x5Au8; 16];

    let mut rvec = iv;
    let cipher = aes::cbc_encrypt(&enc, &mut rvec, &data);
    assert_ne!(cipher, data);
    assert_eq!(&rvec[..], &cipher[48..]);

    let mut rvec = iv;
    assert_eq!(aes::cbc_decrypt(&dec, &mut rvec, &cipher), data);
}

#[test]
fn test_aes_rejects_bad_key_length() {
    assert!(aes::expand_key(&[0u8; 15]).is_none());
    assert_eq!(aes::expand_key(&[0u8; 24]).unwrap().len(), 52);
    assert_eq!(aes::expand_key(&[0u8; 32]).unwrap().len(), 60);
}

#[test]
fn test_ghash_is_linear() {
    let h = 0x66E9_4BD4_EF8A_2C3B_884C_FA59_CA34_2B2Eu128;
    let (a, b) = (0x0388_DACE_60B6_A392_F328_C2B9_71B2_FE78u128, 0x1234u128);
    assert_eq!(ghash::gf_mul(a ^ b, h), ghash::gf_mul(a, h) ^ ghash::gf_mul(b, h));
    assert_eq!(ghash::gf_mul(0, h), 0);
}

proptest! {
    #[test]
    fn prop_crc32_matches_reference(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        prop_assert_eq!(crc32::update(0, &data), crc32fast::hash(&data));
    }

    #[test]
    fn prop_crc32_combine(a in proptest::collection::vec(any::<u8>(), 0..128),
                          b in proptest::collection::vec(any::<u8>(), 0..128)) {
        let whole: Vec<u8> = a.iter().chain(b.iter()).copied().collect();
        let combined = crc32::combine(crc32::update(0, &a), crc32::update(0, &b), b.len() as u64);
        prop_assert_eq!(combined, crc32fast::hash(&whole));
    }
}
