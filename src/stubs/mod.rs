//! Stub routines generated once at startup.
//!
//! `StubGenerator` emits every stub into the code cache and records its
//! address in `StubRoutines`, which is then published process-wide. The
//! signal handler consults the published table to turn a fault inside
//! `SafeFetch32` into a return of the caller's error value.

pub mod aes;
pub mod arraycopy;
pub mod call_stub;
pub mod crc32;
pub mod generator;
pub mod ghash;
pub mod x87;

use std::sync::OnceLock;

use serde::Serialize;

use crate::error::{VmError, VmResult};

pub use generator::StubGenerator;

macro_rules! stub_ids {
    ($($variant:ident => $name:literal,)*) => {
        /// One slot of the stub table.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum StubId {
            $($variant,)*
        }

        impl StubId {
            pub const ALL: &'static [StubId] = &[$(StubId::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(StubId::$variant => $name,)*
                }
            }
        }
    };
}

stub_ids! {
    CallStub => "call_stub",
    CallStubReturnAddress => "call_stub_return_address",
    CatchException => "catch_exception",
    ForwardException => "forward_exception",
    AtomicXchg => "atomic_xchg",
    AtomicXchgPtr => "atomic_xchg_ptr",
    VerifyMxcsr => "verify_mxcsr",
    VerifyFpuCntrlWrd => "verify_fpu_cntrl_wrd",
    D2iWrapper => "d2i_wrapper",
    D2lWrapper => "d2l_wrapper",
    HandlerForUnsafeAccess => "handler_for_unsafe_access",
    VerifyOop => "verify_oop",
    ThrowStackOverflowError => "throw_StackOverflowError",
    ThrowAbstractMethodError => "throw_AbstractMethodError",
    ThrowIncompatibleClassChangeError => "throw_IncompatibleClassChangeError",
    ThrowNullPointerExceptionAtCall => "throw_NullPointerException_at_call",
    JbyteDisjointArraycopy => "jbyte_disjoint_arraycopy",
    JbyteArraycopy => "jbyte_arraycopy",
    ArrayofJbyteDisjointArraycopy => "arrayof_jbyte_disjoint_arraycopy",
    ArrayofJbyteArraycopy => "arrayof_jbyte_arraycopy",
    JshortDisjointArraycopy => "jshort_disjoint_arraycopy",
    JshortArraycopy => "jshort_arraycopy",
    ArrayofJshortDisjointArraycopy => "arrayof_jshort_disjoint_arraycopy",
    ArrayofJshortArraycopy => "arrayof_jshort_arraycopy",
    JintDisjointArraycopy => "jint_disjoint_arraycopy",
    JintArraycopy => "jint_arraycopy",
    ArrayofJintDisjointArraycopy => "arrayof_jint_disjoint_arraycopy",
    ArrayofJintArraycopy => "arrayof_jint_arraycopy",
    JlongDisjointArraycopy => "jlong_disjoint_arraycopy",
    JlongArraycopy => "jlong_arraycopy",
    ArrayofJlongDisjointArraycopy => "arrayof_jlong_disjoint_arraycopy",
    ArrayofJlongArraycopy => "arrayof_jlong_arraycopy",
    OopDisjointArraycopy => "oop_disjoint_arraycopy",
    OopArraycopy => "oop_arraycopy",
    ArrayofOopDisjointArraycopy => "arrayof_oop_disjoint_arraycopy",
    ArrayofOopArraycopy => "arrayof_oop_arraycopy",
    OopDisjointArraycopyUninit => "oop_disjoint_arraycopy_uninit",
    OopArraycopyUninit => "oop_arraycopy_uninit",
    ArrayofOopDisjointArraycopyUninit => "arrayof_oop_disjoint_arraycopy_uninit",
    ArrayofOopArraycopyUninit => "arrayof_oop_arraycopy_uninit",
    CheckcastArraycopy => "checkcast_arraycopy",
    CheckcastArraycopyUninit => "checkcast_arraycopy_uninit",
    UnsafeArraycopy => "unsafe_arraycopy",
    GenericArraycopy => "generic_arraycopy",
    JbyteFill => "jbyte_fill",
    JshortFill => "jshort_fill",
    JintFill => "jint_fill",
    ArrayofJbyteFill => "arrayof_jbyte_fill",
    ArrayofJshortFill => "arrayof_jshort_fill",
    ArrayofJintFill => "arrayof_jint_fill",
    AescryptEncryptBlock => "aescrypt_encryptBlock",
    AescryptDecryptBlock => "aescrypt_decryptBlock",
    CbcEncryptAesCrypt => "cipherBlockChaining_encryptAESCrypt",
    CbcDecryptAesCrypt => "cipherBlockChaining_decryptAESCrypt",
    GhashProcessBlocks => "ghash_processBlocks",
    UpdateBytesCrc32 => "updateBytesCRC32",
    SafeFetch32 => "safefetch32_entry",
    SafeFetch32FaultPc => "safefetch32_fault_pc",
    SafeFetch32ContinuationPc => "safefetch32_continuation_pc",
    SafeFetchN => "safefetchN_entry",
    SafeFetchNFaultPc => "safefetchN_fault_pc",
    SafeFetchNContinuationPc => "safefetchN_continuation_pc",
    IntrinsicLog => "intrinsic_log",
    IntrinsicLog10 => "intrinsic_log10",
    IntrinsicSin => "intrinsic_sin",
    IntrinsicCos => "intrinsic_cos",
    IntrinsicTan => "intrinsic_tan",
    IntrinsicExp => "intrinsic_exp",
    IntrinsicPow => "intrinsic_pow",
}

/// A populated slot, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct StubEntry {
    pub name: &'static str,
    pub address: u32,
}

/// Address of every generated stub.
#[derive(Debug, Clone)]
pub struct StubRoutines {
    addrs: Vec<Option<u32>>,
    /// (begin, end, name) of each stub body
    ranges: Vec<(u32, u32, &'static str)>,
}

impl Default for StubRoutines {
    fn default() -> Self {
        Self::new()
    }
}

impl StubRoutines {
    pub fn new() -> Self {
        Self {
            addrs: vec![None; StubId::ALL.len()],
            ranges: Vec::new(),
        }
    }

    /// Fill a slot; every slot is written exactly once.
    pub fn set(&mut self, id: StubId, addr: u32) -> VmResult<()> {
        let slot = &mut self.addrs[id as usize];
        if slot.is_some() {
            return Err(VmError::StubRedefined(id.name()));
        }
        *slot = Some(addr);
        Ok(())
    }

    /// Point `alias` at the stub already generated for `of`.
    pub fn alias(&mut self, alias: StubId, of: StubId) -> VmResult<()> {
        let addr = self.get(of)?;
        self.set(alias, addr)
    }

    pub fn address(&self, id: StubId) -> Option<u32> {
        self.addrs[id as usize]
    }

    pub fn get(&self, id: StubId) -> VmResult<u32> {
        self.address(id).ok_or(VmError::MissingStub(id.name()))
    }

    pub(crate) fn record_range(&mut self, begin: u32, end: u32, name: &'static str) {
        self.ranges.push((begin, end, name));
    }

    /// Name of the stub whose code contains `pc`.
    pub fn stub_name_at(&self, pc: u32) -> Option<&'static str> {
        self.ranges
            .iter()
            .find(|&&(begin, end, _)| (begin..end).contains(&pc))
            .map(|&(_, _, name)| name)
    }

    pub fn contains_pc(&self, pc: u32) -> bool {
        self.stub_name_at(pc).is_some()
    }

    pub fn is_safefetch_fault(&self, pc: u32) -> bool {
        pc != 0
            && (self.address(StubId::SafeFetch32FaultPc) == Some(pc)
                || self.address(StubId::SafeFetchNFaultPc) == Some(pc))
    }

    /// Where the signal handler resumes after a fault at `pc`.
    pub fn continuation_for_safefetch_fault(&self, pc: u32) -> Option<u32> {
        if pc == 0 {
            None
        } else if self.address(StubId::SafeFetch32FaultPc) == Some(pc) {
            self.address(StubId::SafeFetch32ContinuationPc)
        } else if self.address(StubId::SafeFetchNFaultPc) == Some(pc) {
            self.address(StubId::SafeFetchNContinuationPc)
        } else {
            None
        }
    }

    /// Populated slots in declaration order.
    pub fn entries(&self) -> Vec<StubEntry> {
        StubId::ALL
            .iter()
            .filter_map(|&id| {
                self.address(id).map(|address| StubEntry {
                    name: id.name(),
                    address,
                })
            })
            .collect()
    }
}

static PUBLISHED: OnceLock<StubRoutines> = OnceLock::new();

/// Make the table visible process-wide; only the first call succeeds.
pub fn publish(routines: StubRoutines) -> VmResult<&'static StubRoutines> {
    let mut routines = Some(routines);
    let published = PUBLISHED.get_or_init(|| routines.take().unwrap_or_default());
    if routines.is_some() {
        return Err(VmError::StubRedefined("stub table"));
    }
    log::info!("published {} stubs", published.entries().len());
    Ok(published)
}

pub fn published() -> Option<&'static StubRoutines> {
    PUBLISHED.get()
}

/// SIGSEGV/SIGBUS handling for SafeFetch on IA-32 Linux hosts.
#[cfg(all(target_arch = "x86", target_os = "linux"))]
pub mod signals {
    use super::published;

    extern "C" fn handler(sig: libc::c_int, _info: *mut libc::siginfo_t, uc: *mut libc::c_void) {
        // SAFETY: the kernel passes a valid ucontext_t for SA_SIGINFO handlers
        let ctx = unsafe { &mut *(uc as *mut libc::ucontext_t) };
        let pc = ctx.uc_mcontext.gregs[libc::REG_EIP as usize] as u32;
        if let Some(cont) = published().and_then(|s| s.continuation_for_safefetch_fault(pc)) {
            ctx.uc_mcontext.gregs[libc::REG_EIP as usize] = cont as i32;
            return;
        }
        // not ours: restore the default action and let the fault recur
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
        }
    }

    /// Install the handler for SIGSEGV and SIGBUS.
    pub fn install() -> std::io::Result<()> {
        for sig in [libc::SIGSEGV, libc::SIGBUS] {
            // SAFETY: sigaction is initialised before use and the handler is async-signal-safe
            let rc = unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = handler as usize;
                action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
                libc::sigemptyset(&mut action.sa_mask);
                libc::sigaction(sig, &action, std::ptr::null_mut())
            };
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_set_once() {
        let mut stubs = StubRoutines::new();
        stubs.set(StubId::CallStub, 0x1000).unwrap();
        assert!(matches!(
            stubs.set(StubId::CallStub, 0x2000),
            Err(VmError::StubRedefined("call_stub"))
        ));
        assert_eq!(stubs.get(StubId::CallStub).unwrap(), 0x1000);
        assert!(matches!(
            stubs.get(StubId::VerifyOop),
            Err(VmError::MissingStub("verify_oop"))
        ));
    }

    #[test]
    fn test_alias_and_safefetch_lookup() {
        let mut stubs = StubRoutines::new();
        stubs.set(StubId::SafeFetch32, 0x100).unwrap();
        stubs.set(StubId::SafeFetch32FaultPc, 0x108).unwrap();
        stubs.set(StubId::SafeFetch32ContinuationPc, 0x10A).unwrap();
        stubs.alias(StubId::SafeFetchN, StubId::SafeFetch32).unwrap();
        stubs.alias(StubId::SafeFetchNFaultPc, StubId::SafeFetch32FaultPc).unwrap();
        stubs.alias(StubId::SafeFetchNContinuationPc, StubId::SafeFetch32ContinuationPc).unwrap();
        assert_eq!(stubs.continuation_for_safefetch_fault(0x108), Some(0x10A));
        assert!(stubs.is_safefetch_fault(0x108));
        assert_eq!(stubs.continuation_for_safefetch_fault(0x109), None);
        assert!(stubs.alias(StubId::ArrayofJintFill, StubId::JintFill).is_err());
    }

    #[test]
    fn test_stub_name_at() {
        let mut stubs = StubRoutines::new();
        stubs.record_range(0x100, 0x140, "call_stub");
        stubs.record_range(0x140, 0x150, "atomic_xchg");
        assert_eq!(stubs.stub_name_at(0x13F), Some("call_stub"));
        assert_eq!(stubs.stub_name_at(0x140), Some("atomic_xchg"));
        assert_eq!(stubs.stub_name_at(0x150), None);
    }

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<_> = StubId::ALL.iter().map(|id| id.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), StubId::ALL.len());
    }
}
