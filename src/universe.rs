//! Generation driver: stubs, interpreter and the tables they share.

use serde::Serialize;

use crate::asm::AsmContext;
use crate::code_cache::{BlobKind, CodeCache};
use crate::config::RuntimeConfig;
use crate::error::VmResult;
use crate::frame::CodeRegions;
use crate::interpreter::{InterpreterStats, TemplateInterpreter};
use crate::runtime::entries::RuntimeEntries;
use crate::runtime::globals::VmGlobals;
use crate::runtime::memory32::{Memory32, SimMemory};
use crate::stubs::{StubEntry, StubGenerator, StubRoutines};

/// Everything generated for one configuration.
pub struct Universe {
    config: RuntimeConfig,
    globals: VmGlobals,
    ctx: AsmContext,
    cache: CodeCache,
    stubs: StubRoutines,
    interpreter: TemplateInterpreter,
}

/// Summary printed by `tmplvm generate`.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationSummary {
    pub code_base: u32,
    pub code_used: u32,
    pub blobs: usize,
    pub stubs: usize,
    pub stub_bytes: u32,
    pub interpreter_begin: u32,
    pub interpreter_end: u32,
    pub interpreter: InterpreterStats,
}

impl Universe {
    /// Generate with synthetic runtime entry addresses.
    pub fn generate(config: RuntimeConfig) -> VmResult<Self> {
        let entries = RuntimeEntries::synthetic(config.layout.runtime_base);
        Self::generate_with(config, entries)
    }

    /// Generate against the given runtime entries. Stubs come first since
    /// the interpreter calls the throw and verification stubs.
    pub fn generate_with(config: RuntimeConfig, entries: RuntimeEntries) -> VmResult<Self> {
        let config = config.validate()?;
        let globals = VmGlobals::layout(config.layout.data_base, config.layout.data_size)?;
        let ctx = AsmContext::new(&config, entries, globals.clone());
        let mut cache = CodeCache::new(config.layout.code_base, config.layout.code_size);
        let mut stubs = StubRoutines::new();

        let ctx = {
            let mut generator = StubGenerator::new(&config, ctx, &mut cache, &mut stubs);
            generator.generate_initial()?;
            generator.generate_all()?;
            generator.into_context()
        };
        let interpreter = TemplateInterpreter::generate(&config, &ctx, &mut cache, &stubs)?;
        log::info!(
            "generated {} blobs, {:#x} bytes of code",
            cache.blobs().len(),
            cache.used()
        );
        Ok(Self {
            config,
            globals,
            ctx,
            cache,
            stubs,
            interpreter,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn globals(&self) -> &VmGlobals {
        &self.globals
    }

    pub fn context(&self) -> &AsmContext {
        &self.ctx
    }

    pub fn code_cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn stubs(&self) -> &StubRoutines {
        &self.stubs
    }

    pub fn interpreter(&self) -> &TemplateInterpreter {
        &self.interpreter
    }

    pub fn regions(&self) -> VmResult<CodeRegions<'_>> {
        CodeRegions::new(&self.cache, &self.interpreter, &self.stubs)
    }

    /// Write code, globals and dispatch tables into `mem`.
    pub fn install(&self, mem: &mut dyn Memory32) -> VmResult<()> {
        self.globals.install(mem)?;
        self.cache.install(mem)?;
        self.interpreter.install(mem)?;
        log::debug!("installed code at {:#010x}..{:#010x}", self.cache.base(), self.cache.end());
        Ok(())
    }

    /// A simulated address space with the code and data sections mapped
    /// and installed.
    pub fn simulated_memory(&self) -> VmResult<SimMemory> {
        let layout = &self.config.layout;
        let mut mem = SimMemory::new();
        mem.map(layout.code_base, layout.code_size)?;
        mem.map(layout.data_base, layout.data_size)?;
        self.install(&mut mem)?;
        Ok(mem)
    }

    pub fn stub_entries(&self) -> Vec<StubEntry> {
        self.stubs.entries()
    }

    pub fn summary(&self) -> GenerationSummary {
        let stub_blobs = self
            .cache
            .blobs()
            .iter()
            .filter(|b| matches!(b.kind, BlobKind::Stub | BlobKind::RuntimeStub { .. }));
        let (stub_count, stub_bytes) = stub_blobs.fold((0, 0), |(n, bytes), b| (n + 1, bytes + b.code.len() as u32));
        GenerationSummary {
            code_base: self.cache.base(),
            code_used: self.cache.used(),
            blobs: self.cache.blobs().len(),
            stubs: stub_count,
            stub_bytes,
            interpreter_begin: self.interpreter.code_begin(),
            interpreter_end: self.interpreter.code_end(),
            interpreter: self.interpreter.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;
    use crate::interpreter::MethodKind;
    use crate::stubs::StubId;

    #[test]
    fn test_generate_fills_every_stub_and_template() {
        let universe = Universe::generate(RuntimeConfig::default()).unwrap();
        for &id in StubId::ALL {
            assert!(universe.stubs().address(id).is_some(), "{} missing", id.name());
        }
        let summary = universe.summary();
        assert!(summary.interpreter.templates > 200);
        assert!(summary.interpreter.wide_templates > 0);
        assert!(summary.interpreter_begin > summary.code_base);
        assert!(summary.code_used >= summary.stub_bytes + summary.interpreter.code_bytes);
    }

    #[test]
    fn test_regions_classify_generated_code() {
        let universe = Universe::generate(RuntimeConfig::default()).unwrap();
        let regions = universe.regions().unwrap();
        let normal = universe.interpreter().entry_for(MethodKind::Zerolocals).unwrap();
        assert_eq!(regions.kind_at(normal).unwrap(), FrameKind::Interpreted);
        let ret = universe.stubs().get(StubId::CallStubReturnAddress).unwrap();
        assert_eq!(regions.kind_at(ret).unwrap(), FrameKind::Entry);
    }

    #[test]
    fn test_install_writes_active_dispatch_table() {
        let universe = Universe::generate(RuntimeConfig::default()).unwrap();
        let mem = universe.simulated_memory().unwrap();
        let g = universe.globals();
        let tables = universe.interpreter().tables();
        for opcode in [0x00u8, 0x60, 0xB6] {
            let slot = VmGlobals::dispatch_slot(g.dispatch_active, crate::runtime::TosState::Vtos.index(), opcode);
            assert_eq!(
                mem.read_u32(slot).unwrap(),
                tables.normal.entry(crate::runtime::TosState::Vtos, opcode)
            );
        }
        let first = &universe.code_cache().blobs()[0];
        assert_eq!(mem.read_u8(first.begin).unwrap(), first.code[0]);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.binary_switch_threshold = 0;
        assert!(Universe::generate(config).is_err());
    }
}
