//! The template interpreter.
//!
//! Generation emits every interpreter codelet into the code cache: error
//! exits, exception and throw entries, the return and deoptimization
//! entries, method entries, and one codelet per template with an entry for
//! each TOS state. The resulting addresses fill the dispatch tables, which
//! `install` writes into the data section.

pub mod dispatch;
pub mod entries;
pub mod masm;
pub mod template;
pub(crate) mod templates;

use std::collections::BTreeMap;

use serde::Serialize;

pub use dispatch::{DispatchTable, DispatchTables, EntryPoint};
pub use entries::{ExceptionEntries, MethodKind, ThrownException, DEOPT_STEPS};
pub use masm::{IndexSize, InterpreterMacroAssembler, SharedEntries};
pub use template::{Template, TemplateInfo, TemplateTable};

use crate::asm::{AsmContext, MacroAssembler};
use crate::code_cache::{BlobKind, CodeCache};
use crate::config::RuntimeConfig;
use crate::error::{VmError, VmResult};
use crate::runtime::basic_type::TosState;
use crate::runtime::globals::VmGlobals;
use crate::runtime::layout::method;
use crate::runtime::memory32::Memory32;
use crate::runtime::method::{MathIntrinsic, MethodView};
use crate::stubs::{StubId, StubRoutines};

/// What a codelet holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CodeletKind {
    Entry,
    Template,
    WideTemplate,
}

/// A named range of interpreter code.
#[derive(Debug, Clone, Serialize)]
pub struct Codelet {
    pub name: String,
    pub kind: CodeletKind,
    pub begin: u32,
    pub end: u32,
}

impl Codelet {
    pub fn size(&self) -> u32 {
        self.end - self.begin
    }

    pub fn contains(&self, pc: u32) -> bool {
        (self.begin..self.end).contains(&pc)
    }
}

/// Return entries per invoke shape.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReturnEntries {
    /// 3-byte invokes
    pub invoke: EntryPoint,
    pub invokeinterface: EntryPoint,
    pub invokedynamic: EntryPoint,
}

/// Summary for listings.
#[derive(Debug, Clone, Serialize)]
pub struct InterpreterStats {
    pub templates: usize,
    pub wide_templates: usize,
    pub codelets: usize,
    pub code_bytes: u32,
    pub template_bytes: u32,
    /// Largest templates first
    pub largest_templates: Vec<(String, u32)>,
}

/// Addresses of every generated interpreter entry.
#[derive(Debug, Clone)]
pub struct TemplateInterpreter {
    globals: VmGlobals,
    method_entries: BTreeMap<MethodKind, u32>,
    slow_signature_handler: u32,
    shared: SharedEntries,
    exceptions: ExceptionEntries,
    unwind: u32,
    returns: ReturnEntries,
    deopt: Vec<EntryPoint>,
    safepoint: EntryPoint,
    illegal_bytecode_sequence: u32,
    unimplemented_bytecode: u32,
    tables: DispatchTables,
    codelets: Vec<Codelet>,
}

struct InterpreterGenerator<'a> {
    config: &'a RuntimeConfig,
    ctx: &'a AsmContext,
    cache: &'a mut CodeCache,
    shared: SharedEntries,
    codelets: Vec<Codelet>,
}

impl InterpreterGenerator<'_> {
    /// Assemble one codelet into the code cache.
    fn emit<T>(
        &mut self,
        name: &str,
        kind: CodeletKind,
        f: impl FnOnce(&mut InterpreterMacroAssembler<'_>) -> VmResult<T>,
    ) -> VmResult<(u32, T)> {
        let mut code = self.cache.begin();
        let extra = {
            let mut m = InterpreterMacroAssembler::new(MacroAssembler::new(&mut code, self.ctx), self.config);
            m.set_shared(self.shared);
            f(&mut m)?
        };
        let len = code.len() as u32;
        let begin = self.cache.commit(name, BlobKind::Interpreter, code)?;
        self.codelets.push(Codelet {
            name: name.to_string(),
            kind,
            begin,
            end: begin + len,
        });
        Ok((begin, extra))
    }

    fn entry(&mut self, name: &str, f: impl FnOnce(&mut InterpreterMacroAssembler<'_>)) -> VmResult<u32> {
        let (addr, ()) = self.emit(name, CodeletKind::Entry, |m| {
            f(m);
            Ok(())
        })?;
        Ok(addr)
    }

    /// One entry per TOS state, generated into a single codelet.
    fn per_state(
        &mut self,
        name: &str,
        fill: u32,
        mut f: impl FnMut(&mut InterpreterMacroAssembler<'_>, TosState) -> VmResult<()>,
    ) -> VmResult<EntryPoint> {
        let (_, ep) = self.emit(name, CodeletKind::Entry, |m| {
            let mut ep = EntryPoint::uniform(fill);
            for state in TosState::ALL {
                ep.set_entry(state, m.pc());
                f(m, state)?;
            }
            Ok(ep)
        })?;
        Ok(ep)
    }
}

/// Entries for `t`: a non-void input state gets a `vtos` entry that pops
/// the TOS first; a `vtos` template gets entries for every other state
/// that spill the TOS first. Remaining states enter `illegal`.
fn set_entry_points(m: &mut InterpreterMacroAssembler<'_>, t: &Template, illegal: u32) -> VmResult<EntryPoint> {
    let mut ep = EntryPoint::uniform(illegal);
    if t.tos_in == TosState::Vtos {
        let join = m.new_label();
        for state in [TosState::Atos, TosState::Ftos, TosState::Dtos, TosState::Ltos] {
            m.set_fpu_depth(state.fpu_depth());
            ep.set_entry(state, m.pc());
            m.push_tos(state);
            m.jmp(join);
        }
        m.set_fpu_depth(0);
        let int_entry = m.pc();
        for state in [TosState::Btos, TosState::Ztos, TosState::Ctos, TosState::Stos, TosState::Itos] {
            ep.set_entry(state, int_entry);
        }
        m.push_tos(TosState::Itos);
        ep.set_entry(TosState::Vtos, m.pc());
        m.bind(join);
    } else {
        m.set_fpu_depth(0);
        ep.set_entry(TosState::Vtos, m.pc());
        m.pop_tos(t.tos_in);
        ep.set_entry(t.tos_in, m.pc());
    }
    generate_and_dispatch(m, t)?;
    Ok(ep)
}

fn generate_and_dispatch(m: &mut InterpreterMacroAssembler<'_>, t: &Template) -> VmResult<()> {
    m.set_fpu_depth(t.tos_in.fpu_depth());
    t.generate(m)?;
    if !t.does_dispatch() {
        let step = if t.is_wide() {
            t.bytecode.wide_length()
        } else {
            t.bytecode.length()
        };
        m.dispatch_next(t.tos_out, step as i32)?;
    }
    Ok(())
}

impl TemplateInterpreter {
    /// Generate every codelet. `stubs` must already hold the initial stubs.
    pub fn generate(
        config: &RuntimeConfig,
        ctx: &AsmContext,
        cache: &mut CodeCache,
        stubs: &StubRoutines,
    ) -> VmResult<Self> {
        log::info!("generating template interpreter");
        let overflow_stub = stubs.get(StubId::ThrowStackOverflowError)?;
        let mut g = InterpreterGenerator {
            config,
            ctx,
            cache,
            shared: SharedEntries::default(),
            codelets: Vec::new(),
        };

        let illegal = g.entry("illegal bytecode sequence", entries::generate_illegal_bytecode_sequence)?;
        let unimplemented = g.entry("unimplemented bytecode", entries::generate_unimplemented_bytecode)?;

        let (_, exceptions) = g.emit("exception handling", CodeletKind::Entry, |m| {
            entries::generate_exception_entries(m)
        })?;
        let unwind = g.entry("unwind", |m| {
            entries::generate_unwind_entry(m, exceptions.remove_activation)
        })?;
        g.shared.throw_exception = exceptions.throw;
        g.shared.rethrow_exception = exceptions.rethrow;
        g.shared.remove_activation = exceptions.remove_activation;

        let throw = exceptions.throw;
        g.shared.throw_array_index_out_of_bounds = g.entry(
            "ArrayIndexOutOfBoundsException handler",
            entries::generate_array_index_out_of_bounds_handler,
        )?;
        g.shared.throw_array_store = g.entry("ArrayStoreException handler", |m| {
            entries::generate_exception_handler(
                m,
                ThrownException::ArrayStore,
                entries::message::NONE,
                true,
                throw,
            )
        })?;
        g.shared.throw_arithmetic = g.entry("ArithmeticException handler", |m| {
            entries::generate_exception_handler(
                m,
                ThrownException::Arithmetic,
                entries::message::DIVIDE_BY_ZERO,
                false,
                throw,
            )
        })?;
        g.shared.throw_class_cast = g.entry(
            "ClassCastException handler",
            entries::generate_class_cast_exception_handler,
        )?;
        g.shared.throw_null_pointer = g.entry("NullPointerException handler", |m| {
            entries::generate_exception_handler(
                m,
                ThrownException::NullPointer,
                entries::message::NONE,
                false,
                throw,
            )
        })?;
        g.shared.throw_stack_overflow = g.entry(
            "StackOverflowError handler",
            entries::generate_stack_overflow_handler,
        )?;

        let returns = ReturnEntries {
            invoke: g.per_state("invoke return entry points", illegal, |m, s| {
                entries::generate_return_entry(m, s, 3, IndexSize::U2)
            })?,
            invokeinterface: g.per_state("invokeinterface return entry points", illegal, |m, s| {
                entries::generate_return_entry(m, s, 5, IndexSize::U2)
            })?,
            invokedynamic: g.per_state("invokedynamic return entry points", illegal, |m, s| {
                entries::generate_return_entry(m, s, 5, IndexSize::U4)
            })?,
        };

        let mut deopt = Vec::with_capacity(DEOPT_STEPS);
        for step in 0..DEOPT_STEPS as i32 {
            let name = format!("deoptimization entry points, step {step}");
            deopt.push(g.per_state(&name, illegal, |m, s| entries::generate_deopt_entry(m, s, step))?);
        }

        let safepoint = g.per_state("safepoint entry points", illegal, entries::generate_safepoint_entry)?;
        let slow_signature_handler =
            g.entry("slow signature handler", entries::generate_slow_signature_handler)?;

        let mut method_entries = BTreeMap::new();
        let normal = g.emit("method entry point (kind = zerolocals)", CodeletKind::Entry, |m| {
            entries::generate_normal_entry(m, false, overflow_stub)
        })?.0;
        method_entries.insert(MethodKind::Zerolocals, normal);
        let synchronized = g.emit(
            "method entry point (kind = zerolocals_synchronized)",
            CodeletKind::Entry,
            |m| entries::generate_normal_entry(m, true, overflow_stub),
        )?.0;
        method_entries.insert(MethodKind::ZerolocalsSynchronized, synchronized);
        let empty = g.entry("method entry point (kind = empty)", |m| {
            entries::generate_empty_entry(m, normal)
        })?;
        method_entries.insert(MethodKind::Empty, empty);
        let abstract_entry = g.entry("method entry point (kind = abstract)", entries::generate_abstract_entry)?;
        method_entries.insert(MethodKind::Abstract, abstract_entry);
        for kind in MathIntrinsic::ALL {
            let name = format!("method entry point (kind = {})", MethodKind::Math(kind).name());
            let (addr, ()) = g.emit(&name, CodeletKind::Entry, |m| entries::generate_math_entry(m, kind))?;
            method_entries.insert(MethodKind::Math(kind), addr);
        }

        let table = TemplateTable::new();
        let mut tables = DispatchTables::new(unimplemented);
        for t in table.templates() {
            let (_, ep) = g.emit(t.bytecode.name(), CodeletKind::Template, |m| {
                set_entry_points(m, t, illegal)
            })?;
            tables.normal.set_entry(t.bytecode.code(), &ep);
            tables.safepoint.set_entry(t.bytecode.code(), &safepoint);
        }
        for t in table.wide_templates() {
            let name = format!("wide {}", t.bytecode.name());
            let (_, ep) = g.emit(&name, CodeletKind::WideTemplate, |m| set_entry_points(m, t, illegal))?;
            tables.wentry[t.bytecode.code() as usize] = ep.entry(TosState::Vtos);
        }

        let interpreter = Self {
            globals: ctx.globals.clone(),
            method_entries,
            slow_signature_handler,
            shared: g.shared,
            exceptions,
            unwind,
            returns,
            deopt,
            safepoint,
            illegal_bytecode_sequence: illegal,
            unimplemented_bytecode: unimplemented,
            tables,
            codelets: g.codelets,
        };
        let stats = interpreter.stats();
        log::info!(
            "interpreter: {} codelets, {} bytes ({} in templates)",
            stats.codelets,
            stats.code_bytes,
            stats.template_bytes
        );
        Ok(interpreter)
    }

    /// Write the dispatch and return tables into the data section.
    pub fn install(&self, mem: &mut dyn Memory32) -> VmResult<()> {
        self.tables.install(mem, &self.globals)?;
        self.returns.invoke.install(mem, self.globals.invoke_return)?;
        self.returns.invokeinterface.install(mem, self.globals.invokeinterface_return)?;
        self.returns.invokedynamic.install(mem, self.globals.invokedynamic_return)?;
        Ok(())
    }

    pub fn entry_for(&self, kind: MethodKind) -> VmResult<u32> {
        self.method_entries
            .get(&kind)
            .copied()
            .ok_or_else(|| VmError::MissingEntry(kind.name()))
    }

    pub fn method_entries(&self) -> impl Iterator<Item = (MethodKind, u32)> + '_ {
        self.method_entries.iter().map(|(&k, &a)| (k, a))
    }

    /// Point a laid-out method at the entry for its kind.
    pub fn link_method(&self, mem: &mut dyn Memory32, method_addr: u32) -> VmResult<MethodKind> {
        let kind = MethodKind::classify(mem, MethodView::at(method_addr))?;
        let entry = self.entry_for(kind)?;
        mem.write_u32(method_addr + method::FROM_INTERPRETED_OFFSET as u32, entry)?;
        mem.write_u32(method_addr + method::INTERPRETER_ENTRY_OFFSET as u32, entry)?;
        log::trace!("method {method_addr:#010x} linked as {}", kind.name());
        Ok(kind)
    }

    pub fn shared(&self) -> SharedEntries {
        self.shared
    }

    pub fn exceptions(&self) -> ExceptionEntries {
        self.exceptions
    }

    pub fn rethrow_exception_entry(&self) -> u32 {
        self.exceptions.rethrow
    }

    pub fn unwind_entry(&self) -> u32 {
        self.unwind
    }

    pub fn slow_signature_handler(&self) -> u32 {
        self.slow_signature_handler
    }

    pub fn returns(&self) -> &ReturnEntries {
        &self.returns
    }

    /// Entry resuming after a bytecode of `step` bytes with `state` cached.
    pub fn deopt_entry(&self, state: TosState, step: usize) -> VmResult<u32> {
        self.deopt
            .get(step)
            .map(|ep| ep.entry(state))
            .ok_or_else(|| VmError::Deopt(format!("no deoptimization entry for length {step}")))
    }

    /// Re-executes the bytecode at the frame's bcp.
    pub fn deopt_reexecute_entry(&self) -> u32 {
        self.deopt[0].entry(TosState::Vtos)
    }

    pub fn safepoint_entry(&self) -> EntryPoint {
        self.safepoint
    }

    pub fn illegal_bytecode_sequence(&self) -> u32 {
        self.illegal_bytecode_sequence
    }

    pub fn unimplemented_bytecode(&self) -> u32 {
        self.unimplemented_bytecode
    }

    pub fn tables(&self) -> &DispatchTables {
        &self.tables
    }

    pub fn codelets(&self) -> &[Codelet] {
        &self.codelets
    }

    pub fn code_begin(&self) -> u32 {
        self.codelets.first().map_or(0, |c| c.begin)
    }

    pub fn code_end(&self) -> u32 {
        self.codelets.last().map_or(0, |c| c.end)
    }

    /// Whether `pc` lies in interpreter code.
    pub fn contains(&self, pc: u32) -> bool {
        self.codelet_at(pc).is_some()
    }

    pub fn codelet_at(&self, pc: u32) -> Option<&Codelet> {
        self.codelets.iter().find(|c| c.contains(pc))
    }

    pub fn stats(&self) -> InterpreterStats {
        let is_template = |c: &&Codelet| c.kind != CodeletKind::Entry;
        let mut largest: Vec<(String, u32)> = self
            .codelets
            .iter()
            .filter(is_template)
            .map(|c| (c.name.clone(), c.size()))
            .collect();
        largest.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let template_bytes = largest.iter().map(|(_, s)| s).sum();
        largest.truncate(10);
        InterpreterStats {
            templates: self.codelets.iter().filter(|c| c.kind == CodeletKind::Template).count(),
            wide_templates: self
                .codelets
                .iter()
                .filter(|c| c.kind == CodeletKind::WideTemplate)
                .count(),
            codelets: self.codelets.len(),
            code_bytes: self.codelets.iter().map(Codelet::size).sum(),
            template_bytes,
            largest_templates: largest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::templates::testing::context;
    use crate::runtime::bytecodes::Bytecode;
    use crate::runtime::memory32::SimMemory;

    fn stubs() -> StubRoutines {
        let mut stubs = StubRoutines::new();
        stubs.set(StubId::ThrowStackOverflowError, 0x0800_0040).unwrap();
        stubs
    }

    fn generate(config: &RuntimeConfig) -> (TemplateInterpreter, CodeCache) {
        let ctx = context(config);
        let mut cache = CodeCache::new(0x0801_0000, 0x0010_0000);
        let interp = TemplateInterpreter::generate(config, &ctx, &mut cache, &stubs()).unwrap();
        (interp, cache)
    }

    #[test]
    fn test_every_template_has_its_input_state_entry() {
        let config = RuntimeConfig::default();
        let (interp, _) = generate(&config);
        let table = TemplateTable::new();
        for t in table.templates() {
            let ep = interp.tables().normal.entry_point(t.bytecode.code());
            assert_ne!(ep.entry(t.tos_in), interp.illegal_bytecode_sequence(), "{}", t.bytecode);
            assert_ne!(ep.entry(TosState::Vtos), interp.unimplemented_bytecode());
        }
    }

    #[test]
    fn test_non_void_template_rejects_other_states() {
        let config = RuntimeConfig::default();
        let (interp, _) = generate(&config);
        // iadd consumes an int
        let ep = interp.tables().normal.entry_point(Bytecode::Iadd.code());
        assert_eq!(ep.entry(TosState::Ltos), interp.illegal_bytecode_sequence());
        assert!(ep.entry(TosState::Vtos) < ep.entry(TosState::Itos));
        // nop takes anything
        let ep = interp.tables().normal.entry_point(Bytecode::Nop.code());
        for state in TosState::ALL {
            assert_ne!(ep.entry(state), interp.illegal_bytecode_sequence());
        }
    }

    #[test]
    fn test_safepoint_table_uses_safepoint_entries() {
        let config = RuntimeConfig::default();
        let (interp, _) = generate(&config);
        let sp = interp.safepoint_entry();
        assert_eq!(
            interp.tables().safepoint.entry(TosState::Ftos, Bytecode::Fadd.code()),
            sp.entry(TosState::Ftos)
        );
    }

    #[test]
    fn test_wide_entries() {
        let config = RuntimeConfig::default();
        let (interp, _) = generate(&config);
        let w = interp.tables().wentry[Bytecode::Iinc.code() as usize];
        assert_ne!(w, interp.unimplemented_bytecode());
        assert_eq!(
            interp.codelet_at(w).map(|c| c.kind),
            Some(CodeletKind::WideTemplate)
        );
        assert_eq!(interp.tables().wentry[Bytecode::Nop.code() as usize], interp.unimplemented_bytecode());
    }

    #[test]
    fn test_codelets_live_in_the_cache() {
        let config = RuntimeConfig::default();
        let (interp, cache) = generate(&config);
        let blob = cache.find_blob(interp.entry_for(MethodKind::Zerolocals).unwrap()).unwrap();
        assert!(blob.is_interpreter());
        assert!(interp.contains(interp.unwind_entry()));
        assert!(!interp.contains(0x0800_0040));
        let stats = interp.stats();
        assert_eq!(stats.templates, TemplateTable::new().templates().count());
        assert!(stats.template_bytes < stats.code_bytes);
        assert_eq!(stats.largest_templates.len(), 10);
    }

    #[test]
    fn test_install_writes_return_tables() {
        let config = RuntimeConfig::default();
        let (interp, _) = generate(&config);
        let g = context(&config).globals;
        let mut mem = SimMemory::new();
        mem.map(g.base, g.size).unwrap();
        interp.install(&mut mem).unwrap();
        let itos = g.invoke_return + 4 * TosState::Itos.index() as u32;
        assert_eq!(mem.read_u32(itos).unwrap(), interp.returns().invoke.entry(TosState::Itos));
        let active = VmGlobals::dispatch_slot(g.dispatch_active, TosState::Vtos.index(), Bytecode::Nop.code());
        assert_eq!(
            mem.read_u32(active).unwrap(),
            interp.tables().normal.entry(TosState::Vtos, Bytecode::Nop.code())
        );
    }

    #[test]
    fn test_deopt_entries() {
        let config = RuntimeConfig::default();
        let (interp, _) = generate(&config);
        assert!(interp.deopt_entry(TosState::Itos, 3).is_ok());
        assert!(interp.deopt_entry(TosState::Itos, DEOPT_STEPS).is_err());
        assert_eq!(
            interp.deopt_reexecute_entry(),
            interp.deopt_entry(TosState::Vtos, 0).unwrap()
        );
    }

    #[test]
    fn test_missing_overflow_stub_is_reported() {
        let config = RuntimeConfig::default();
        let ctx = context(&config);
        let mut cache = CodeCache::new(0x0801_0000, 0x0010_0000);
        let err = TemplateInterpreter::generate(&config, &ctx, &mut cache, &StubRoutines::new()).unwrap_err();
        assert!(matches!(err, VmError::MissingStub(_)));
    }
}
