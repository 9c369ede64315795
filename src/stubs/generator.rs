//! Two-phase stub generation.
//!
//! `generate_initial` emits what every other generator calls into: the
//! call bridge, exception forwarding and the FPU control words.
//! `generate_all` emits the rest. Every stub is its own blob in the code
//! cache.

use super::arraycopy::{self, CopyKind, CopyTargets};
use super::call_stub::{self, MSG_BROKEN_OOP, THROW_FRAME_WORDS};
use super::x87::{self, MathStub};
use super::{aes, crc32, ghash, StubId, StubRoutines};
use crate::asm::{Address, AsmContext, Cond, MacroAssembler, Reg};
use crate::code_cache::{BlobKind, CodeCache};
use crate::config::RuntimeConfig;
use crate::error::VmResult;
use crate::runtime::basic_type::BasicType;
use crate::runtime::entries::RuntimeEntry;
use crate::runtime::layout::oop;

pub struct StubGenerator<'a> {
    config: &'a RuntimeConfig,
    ctx: AsmContext,
    cache: &'a mut CodeCache,
    routines: &'a mut StubRoutines,
}

impl<'a> StubGenerator<'a> {
    pub fn new(
        config: &'a RuntimeConfig,
        ctx: AsmContext,
        cache: &'a mut CodeCache,
        routines: &'a mut StubRoutines,
    ) -> Self {
        Self {
            config,
            ctx,
            cache,
            routines,
        }
    }

    /// The context with `forward_exception` and `verify_oop` filled in.
    pub fn context(&self) -> &AsmContext {
        &self.ctx
    }

    pub fn into_context(self) -> AsmContext {
        self.ctx
    }

    /// Assemble one blob; `f` may report secondary addresses through `T`.
    fn emit<T>(
        &mut self,
        name: &'static str,
        kind: BlobKind,
        f: impl FnOnce(&mut MacroAssembler) -> VmResult<T>,
    ) -> VmResult<(u32, T)> {
        let mut code = self.cache.begin();
        let extra = {
            let mut masm = MacroAssembler::new(&mut code, &self.ctx);
            f(&mut masm)?
        };
        let len = code.len() as u32;
        let start = self.cache.commit(name, kind, code)?;
        self.routines.record_range(start, start + len, name);
        Ok((start, extra))
    }

    /// Emit a leaf stub and publish its address under `id`.
    fn stub(
        &mut self,
        id: StubId,
        f: impl FnOnce(&mut MacroAssembler) -> VmResult<()>,
    ) -> VmResult<u32> {
        let (start, ()) = self.emit(id.name(), BlobKind::Stub, f)?;
        self.routines.set(id, start)?;
        Ok(start)
    }

    // ==================== Phase 1 ====================

    pub fn generate_initial(&mut self) -> VmResult<()> {
        log::info!("generating initial stubs");
        let forward = self.stub(StubId::ForwardException, |masm| {
            call_stub::generate_forward_exception(masm);
            Ok(())
        })?;
        self.ctx.forward_exception = forward;

        let (call_stub, return_address) = self.emit(
            StubId::CallStub.name(),
            BlobKind::Stub,
            |masm| Ok(call_stub::generate_call_stub(masm)),
        )?;
        self.routines.set(StubId::CallStub, call_stub)?;
        self.routines.set(StubId::CallStubReturnAddress, return_address)?;
        self.stub(StubId::CatchException, |masm| {
            call_stub::generate_catch_exception(masm, return_address);
            Ok(())
        })?;

        self.stub(StubId::AtomicXchg, |masm| {
            generate_atomic_xchg(masm);
            Ok(())
        })?;
        self.routines.alias(StubId::AtomicXchgPtr, StubId::AtomicXchg)?;
        self.stub(StubId::HandlerForUnsafeAccess, |masm| {
            generate_handler_for_unsafe_access(masm);
            Ok(())
        })?;

        self.stub(StubId::VerifyMxcsr, |masm| {
            x87::generate_verify_mxcsr(masm);
            Ok(())
        })?;
        self.stub(StubId::VerifyFpuCntrlWrd, |masm| {
            x87::generate_verify_fpu_cntrl_wrd(masm);
            Ok(())
        })?;
        self.stub(StubId::D2iWrapper, |masm| {
            x87::generate_d2i_wrapper(masm, RuntimeEntry::D2i)
        })?;
        self.stub(StubId::D2lWrapper, |masm| {
            x87::generate_d2i_wrapper(masm, RuntimeEntry::D2l)
        })?;

        self.throw_stub(
            StubId::ThrowStackOverflowError,
            RuntimeEntry::SharedThrowStackOverflowError,
        )?;

        if self.config.use_crc32_intrinsics {
            self.stub(StubId::UpdateBytesCrc32, |masm| {
                crc32::generate_update_bytes_crc32(masm);
                Ok(())
            })?;
        }
        Ok(())
    }

    fn throw_stub(&mut self, id: StubId, entry: RuntimeEntry) -> VmResult<u32> {
        let kind = BlobKind::RuntimeStub {
            frame_words: THROW_FRAME_WORDS,
        };
        let (start, ()) = self.emit(id.name(), kind, |masm| {
            call_stub::generate_throw_exception(masm, entry);
            Ok(())
        })?;
        self.routines.set(id, start)?;
        Ok(start)
    }

    // ==================== Phase 2 ====================

    pub fn generate_all(&mut self) -> VmResult<()> {
        log::info!("generating remaining stubs");
        self.throw_stub(
            StubId::ThrowAbstractMethodError,
            RuntimeEntry::SharedThrowAbstractMethodError,
        )?;
        self.throw_stub(
            StubId::ThrowIncompatibleClassChangeError,
            RuntimeEntry::SharedThrowIncompatibleClassChangeError,
        )?;
        self.throw_stub(
            StubId::ThrowNullPointerExceptionAtCall,
            RuntimeEntry::ThrowNullPointerExceptionAtCall,
        )?;

        let (heap_base, heap_size) = (self.config.layout.heap_base, self.config.layout.heap_size);
        let verify_oop = self.stub(StubId::VerifyOop, |masm| {
            generate_verify_oop(masm, heap_base, heap_size);
            Ok(())
        })?;
        self.ctx.verify_oop = verify_oop;

        self.generate_arraycopy_stubs()?;
        self.generate_math_stubs()?;

        if self.config.use_aes_intrinsics {
            self.stub(StubId::AescryptEncryptBlock, |masm| {
                aes::generate_aescrypt_block(masm, true);
                Ok(())
            })?;
            self.stub(StubId::AescryptDecryptBlock, |masm| {
                aes::generate_aescrypt_block(masm, false);
                Ok(())
            })?;
            self.stub(StubId::CbcEncryptAesCrypt, |masm| {
                aes::generate_cipher_block_chaining(masm, true);
                Ok(())
            })?;
            self.stub(StubId::CbcDecryptAesCrypt, |masm| {
                aes::generate_cipher_block_chaining(masm, false);
                Ok(())
            })?;
        }
        if self.config.use_ghash_intrinsics {
            self.stub(StubId::GhashProcessBlocks, |masm| {
                ghash::generate_ghash_process_blocks(masm);
                Ok(())
            })?;
        }

        let (entry, (fault_pc, continuation_pc)) =
            self.emit(StubId::SafeFetch32.name(), BlobKind::Stub, |masm| {
                Ok(generate_safefetch32(masm))
            })?;
        self.routines.set(StubId::SafeFetch32, entry)?;
        self.routines.set(StubId::SafeFetch32FaultPc, fault_pc)?;
        self.routines.set(StubId::SafeFetch32ContinuationPc, continuation_pc)?;
        // intptr_t is 32 bits wide
        self.routines.alias(StubId::SafeFetchN, StubId::SafeFetch32)?;
        self.routines.alias(StubId::SafeFetchNFaultPc, StubId::SafeFetch32FaultPc)?;
        self.routines
            .alias(StubId::SafeFetchNContinuationPc, StubId::SafeFetch32ContinuationPc)?;
        Ok(())
    }

    fn copy_pair(
        &mut self,
        kind: CopyKind,
        disjoint_id: StubId,
        conjoint_id: StubId,
    ) -> VmResult<u32> {
        let disjoint = self.stub(disjoint_id, |masm| {
            arraycopy::generate_disjoint_copy(masm, kind);
            Ok(())
        })?;
        self.stub(conjoint_id, |masm| {
            arraycopy::generate_conjoint_copy(masm, kind, disjoint);
            Ok(())
        })
    }

    fn generate_arraycopy_stubs(&mut self) -> VmResult<()> {
        use BasicType::{Byte, Int, Long, Object, Short};

        let byte = self.copy_pair(
            CopyKind::new(Byte, false),
            StubId::JbyteDisjointArraycopy,
            StubId::JbyteArraycopy,
        )?;
        self.copy_pair(
            CopyKind::new(Byte, true),
            StubId::ArrayofJbyteDisjointArraycopy,
            StubId::ArrayofJbyteArraycopy,
        )?;
        let short = self.copy_pair(
            CopyKind::new(Short, false),
            StubId::JshortDisjointArraycopy,
            StubId::JshortArraycopy,
        )?;
        self.copy_pair(
            CopyKind::new(Short, true),
            StubId::ArrayofJshortDisjointArraycopy,
            StubId::ArrayofJshortArraycopy,
        )?;
        let int = self.copy_pair(
            CopyKind::new(Int, true),
            StubId::JintDisjointArraycopy,
            StubId::JintArraycopy,
        )?;
        let long = self.copy_pair(
            CopyKind::new(Long, true),
            StubId::JlongDisjointArraycopy,
            StubId::JlongArraycopy,
        )?;
        let oop = self.copy_pair(
            CopyKind::new(Object, true),
            StubId::OopDisjointArraycopy,
            StubId::OopArraycopy,
        )?;
        self.copy_pair(
            CopyKind::new(Object, true).uninit(),
            StubId::OopDisjointArraycopyUninit,
            StubId::OopArraycopyUninit,
        )?;

        // word-aligned element types are always arrayof-aligned
        for (alias, of) in [
            (StubId::ArrayofJintDisjointArraycopy, StubId::JintDisjointArraycopy),
            (StubId::ArrayofJintArraycopy, StubId::JintArraycopy),
            (StubId::ArrayofJlongDisjointArraycopy, StubId::JlongDisjointArraycopy),
            (StubId::ArrayofJlongArraycopy, StubId::JlongArraycopy),
            (StubId::ArrayofOopDisjointArraycopy, StubId::OopDisjointArraycopy),
            (StubId::ArrayofOopArraycopy, StubId::OopArraycopy),
            (StubId::ArrayofOopDisjointArraycopyUninit, StubId::OopDisjointArraycopyUninit),
            (StubId::ArrayofOopArraycopyUninit, StubId::OopArraycopyUninit),
        ] {
            self.routines.alias(alias, of)?;
        }

        let checkcast = self.stub(StubId::CheckcastArraycopy, |masm| {
            arraycopy::generate_checkcast_copy(masm, false);
            Ok(())
        })?;
        self.stub(StubId::CheckcastArraycopyUninit, |masm| {
            arraycopy::generate_checkcast_copy(masm, true);
            Ok(())
        })?;
        self.stub(StubId::UnsafeArraycopy, |masm| {
            arraycopy::generate_unsafe_copy(masm, [byte, short, int, long]);
            Ok(())
        })?;
        let targets = CopyTargets {
            byte,
            short,
            int,
            long,
            oop,
            checkcast,
        };
        self.stub(StubId::GenericArraycopy, |masm| {
            arraycopy::generate_generic_copy(masm, &targets);
            Ok(())
        })?;

        for (id, ty, aligned) in [
            (StubId::JbyteFill, Byte, false),
            (StubId::JshortFill, Short, false),
            (StubId::JintFill, Int, false),
            (StubId::ArrayofJbyteFill, Byte, true),
            (StubId::ArrayofJshortFill, Short, true),
            (StubId::ArrayofJintFill, Int, true),
        ] {
            self.stub(id, |masm| {
                arraycopy::generate_fill(masm, ty, aligned);
                Ok(())
            })?;
        }
        Ok(())
    }

    fn generate_math_stubs(&mut self) -> VmResult<()> {
        for (id, kind) in [
            (StubId::IntrinsicLog, MathStub::Log),
            (StubId::IntrinsicLog10, MathStub::Log10),
            (StubId::IntrinsicSin, MathStub::Sin),
            (StubId::IntrinsicCos, MathStub::Cos),
            (StubId::IntrinsicTan, MathStub::Tan),
            (StubId::IntrinsicExp, MathStub::Exp),
            (StubId::IntrinsicPow, MathStub::Pow),
        ] {
            self.stub(id, |masm| x87::generate_math_stub(masm, kind))?;
        }
        Ok(())
    }
}

/// `int atomic_xchg(int exchange_value, volatile int* dest)`
fn generate_atomic_xchg(masm: &mut MacroAssembler) {
    masm.push_r(Reg::Ecx);
    masm.mov_rm(Reg::Eax, Address::new(Reg::Esp, 8));
    masm.mov_rm(Reg::Ecx, Address::new(Reg::Esp, 12));
    // XCHG with memory is implicitly locked
    masm.xchg_rm(Reg::Eax, Address::new(Reg::Ecx, 0));
    masm.pop_r(Reg::Ecx);
    masm.ret(0);
}

/// The signal handler redirects a faulting unsafe access here. The
/// runtime returns the pc to resume at, which replaces the hole pushed
/// first so that `ret` lands there with every register intact.
fn generate_handler_for_unsafe_access(masm: &mut MacroAssembler) {
    let entry = masm.ctx().entry(RuntimeEntry::HandleUnsafeAccess);
    masm.push_i(0);
    masm.pusha();
    masm.call_abs(entry);
    masm.mov_mr(Address::new(Reg::Esp, 8 * 4), Reg::Eax);
    masm.popa();
    masm.ret(0);
}

/// Called with the reference pushed; pops it on return. Null passes;
/// anything else must lie in the heap, be word aligned and have a klass.
fn generate_verify_oop(masm: &mut MacroAssembler, heap_base: u32, heap_size: u32) {
    let count = masm.ctx().globals.verify_oop_count;
    let exit = masm.new_label();
    let error = masm.new_label();

    masm.pushf();
    masm.inc_m(Address::absolute(count));
    masm.push_r(Reg::Eax);
    masm.push_r(Reg::Edx);
    // [edx] [eax] [flags] [return] [oop]
    masm.mov_rm(Reg::Eax, Address::new(Reg::Esp, 16));
    masm.test_rr(Reg::Eax, Reg::Eax);
    masm.jcc(Cond::E, exit);
    masm.test_ri(Reg::Eax, 3);
    masm.jcc(Cond::Ne, error);
    masm.mov_rr(Reg::Edx, Reg::Eax);
    masm.sub_ri(Reg::Edx, heap_base as i32);
    masm.cmp_ri(Reg::Edx, heap_size as i32);
    masm.jcc(Cond::Ae, error);
    masm.mov_rm(Reg::Eax, Address::new(Reg::Eax, oop::KLASS_OFFSET));
    masm.test_rr(Reg::Eax, Reg::Eax);
    masm.jcc(Cond::E, error);
    masm.bind(exit);
    masm.pop_r(Reg::Edx);
    masm.pop_r(Reg::Eax);
    masm.popf();
    masm.ret(4);

    masm.bind(error);
    masm.stop(MSG_BROKEN_OOP);
}

/// `int SafeFetch32(int* adr, int errValue)`; returns the fault pc and
/// the continuation pc.
fn generate_safefetch32(masm: &mut MacroAssembler) -> (u32, u32) {
    masm.mov_rm(Reg::Eax, Address::new(Reg::Esp, 8));
    masm.mov_rm(Reg::Ecx, Address::new(Reg::Esp, 4));
    let fault_pc = masm.pc();
    masm.mov_rm(Reg::Eax, Address::new(Reg::Ecx, 0));
    let continuation_pc = masm.pc();
    masm.ret(0);
    (fault_pc, continuation_pc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::entries::RuntimeEntries;
    use crate::runtime::globals::VmGlobals;

    fn generate(config: &RuntimeConfig) -> (CodeCache, StubRoutines, AsmContext) {
        let globals = VmGlobals::layout(config.layout.data_base, config.layout.data_size).unwrap();
        let ctx = AsmContext::new(config, RuntimeEntries::synthetic(config.layout.runtime_base), globals);
        let mut cache = CodeCache::new(config.layout.code_base, config.layout.code_size);
        let mut routines = StubRoutines::new();
        let ctx = {
            let mut generator = StubGenerator::new(config, ctx, &mut cache, &mut routines);
            generator.generate_initial().unwrap();
            generator.generate_all().unwrap();
            generator.into_context()
        };
        (cache, routines, ctx)
    }

    #[test]
    fn test_every_slot_is_filled() {
        let (_, routines, ctx) = generate(&RuntimeConfig::default());
        for &id in StubId::ALL {
            assert!(routines.address(id).is_some(), "{} missing", id.name());
        }
        assert_eq!(ctx.forward_exception, routines.get(StubId::ForwardException).unwrap());
        assert_eq!(ctx.verify_oop, routines.get(StubId::VerifyOop).unwrap());
    }

    #[test]
    fn test_aliases_share_code() {
        let (_, routines, _) = generate(&RuntimeConfig::default());
        assert_eq!(
            routines.address(StubId::ArrayofJintArraycopy),
            routines.address(StubId::JintArraycopy)
        );
        assert_eq!(
            routines.address(StubId::SafeFetchNFaultPc),
            routines.address(StubId::SafeFetch32FaultPc)
        );
        assert_ne!(
            routines.address(StubId::ArrayofJbyteArraycopy),
            routines.address(StubId::JbyteArraycopy)
        );
    }

    #[test]
    fn test_safefetch_fault_maps_to_continuation() {
        let (cache, routines, _) = generate(&RuntimeConfig::default());
        let fault = routines.get(StubId::SafeFetch32FaultPc).unwrap();
        let cont = routines.get(StubId::SafeFetch32ContinuationPc).unwrap();
        assert!(routines.is_safefetch_fault(fault));
        assert_eq!(routines.continuation_for_safefetch_fault(fault), Some(cont));
        assert_eq!(routines.continuation_for_safefetch_fault(cont), None);
        // MOV EAX, [ECX] = 8B 01, then RET
        let blob = cache.find_blob(fault).unwrap();
        let at = (fault - blob.begin) as usize;
        assert_eq!(&blob.code[at..at + 3], &[0x8B, 0x01, 0xC3]);
        assert_eq!(routines.stub_name_at(fault), Some("safefetch32_entry"));
    }

    #[test]
    fn test_optional_stubs_follow_config() {
        let mut config = RuntimeConfig::default();
        config.use_aes_intrinsics = false;
        config.use_ghash_intrinsics = false;
        config.use_crc32_intrinsics = false;
        let (_, routines, _) = generate(&config);
        assert!(routines.address(StubId::AescryptEncryptBlock).is_none());
        assert!(routines.address(StubId::GhashProcessBlocks).is_none());
        assert!(routines.address(StubId::UpdateBytesCrc32).is_none());
        assert!(routines.address(StubId::CallStub).is_some());
    }

    #[test]
    fn test_throw_stubs_are_runtime_stubs() {
        let (cache, routines, _) = generate(&RuntimeConfig::default());
        let addr = routines.get(StubId::ThrowAbstractMethodError).unwrap();
        let blob = cache.find_blob(addr).unwrap();
        assert_eq!(blob.kind, BlobKind::RuntimeStub { frame_words: 5 });
        assert_eq!(blob.name, "throw_AbstractMethodError");
    }

    #[test]
    fn test_second_generation_is_rejected() {
        let config = RuntimeConfig::default();
        let globals = VmGlobals::layout(config.layout.data_base, config.layout.data_size).unwrap();
        let ctx = AsmContext::new(&config, RuntimeEntries::synthetic(config.layout.runtime_base), globals);
        let mut cache = CodeCache::new(config.layout.code_base, config.layout.code_size);
        let mut routines = StubRoutines::new();
        let mut generator = StubGenerator::new(&config, ctx, &mut cache, &mut routines);
        generator.generate_initial().unwrap();
        assert!(generator.generate_initial().is_err());
    }
}
