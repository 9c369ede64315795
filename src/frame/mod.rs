//! Frame descriptors over the simulated stack.
//!
//! A `Frame` is built from raw `sp`/`fp`/`pc` and classified by the code
//! containing its pc. Interpreter frames expose every fixed slot, their
//! monitors and expression stack, and report their references through the
//! oop map of the current bci.

pub mod layout;
pub mod oop_map;

use serde::Serialize;

use crate::code_cache::{BlobKind, CodeCache};
use crate::error::{VmError, VmResult};
use crate::interpreter::TemplateInterpreter;
use crate::runtime::basic_type::BasicType;
use crate::runtime::bytecodes::Bytecode;
use crate::runtime::layout::{basic_object_lock, java_call_wrapper, WORD_SIZE};
use crate::runtime::memory32::Memory32;
use crate::runtime::method::{MemberRef, MethodView, SignatureLookup};
use crate::stubs::{StubId, StubRoutines};

use oop_map::OopMapCache;

/// Largest bci; a bcx or mdx slot at or below it holds an index.
pub const MAX_CODE_SIZE: u32 = 0xFFFF;

const WORD: u32 = WORD_SIZE as u32;

/// How a frame was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameKind {
    Interpreted,
    /// `call_stub` frame, the boundary with native code
    Entry,
    Compiled { frame_words: u32 },
    /// Runtime stub with an `ebp` frame; `frame_words` includes the return address
    Stub { frame_words: u32 },
}

/// Where the code regions the walker needs live.
#[derive(Clone, Copy)]
pub struct CodeRegions<'a> {
    pub cache: &'a CodeCache,
    pub interpreter: &'a TemplateInterpreter,
    pub call_stub_return: u32,
}

impl<'a> CodeRegions<'a> {
    pub fn new(cache: &'a CodeCache, interpreter: &'a TemplateInterpreter, stubs: &StubRoutines) -> VmResult<Self> {
        Ok(Self {
            cache,
            interpreter,
            call_stub_return: stubs.get(StubId::CallStubReturnAddress)?,
        })
    }

    pub fn kind_at(&self, pc: u32) -> VmResult<FrameKind> {
        if pc == self.call_stub_return {
            return Ok(FrameKind::Entry);
        }
        if self.interpreter.contains(pc) {
            return Ok(FrameKind::Interpreted);
        }
        let blob = self
            .cache
            .find_blob(pc)
            .ok_or_else(|| VmError::Frame(format!("pc {pc:#010x} is not in the code cache")))?;
        match blob.kind {
            BlobKind::Interpreter => Ok(FrameKind::Interpreted),
            BlobKind::Compiled { frame_words } => Ok(FrameKind::Compiled { frame_words }),
            BlobKind::RuntimeStub { frame_words } => Ok(FrameKind::Stub { frame_words }),
            BlobKind::Stub => Err(VmError::Frame(format!(
                "pc {pc:#010x} is inside frameless stub {}",
                blob.name
            ))),
        }
    }
}

/// Callee-saved register locations collected while walking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterMap {
    ebp_location: Option<u32>,
    include_argument_oops: bool,
}

impl RegisterMap {
    pub fn new(include_argument_oops: bool) -> Self {
        Self {
            ebp_location: None,
            include_argument_oops,
        }
    }

    /// Stack slot holding the caller's `ebp`, once a frame saved it.
    pub fn ebp_location(&self) -> Option<u32> {
        self.ebp_location
    }

    pub fn set_ebp_location(&mut self, at: u32) {
        self.ebp_location = Some(at);
    }

    pub fn include_argument_oops(&self) -> bool {
        self.include_argument_oops
    }

    pub fn set_include_argument_oops(&mut self, include: bool) {
        self.include_argument_oops = include;
    }
}

/// One activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub sp: u32,
    /// The sp the frame's owner knows about, before any caller extension
    pub unextended_sp: u32,
    pub fp: u32,
    pub pc: u32,
    pub kind: FrameKind,
}

fn slot(base: u32, word: i32) -> u32 {
    base.wrapping_add_signed(word * WORD_SIZE)
}

pub fn is_bci(bcx: u32) -> bool {
    bcx <= MAX_CODE_SIZE
}

impl Frame {
    pub fn new(kind: FrameKind, sp: u32, fp: u32, pc: u32) -> Self {
        Self {
            sp,
            unextended_sp: sp,
            fp,
            pc,
            kind,
        }
    }

    /// Describe the activation that `sp`, `fp` and `pc` belong to.
    pub fn frame_for(regions: &CodeRegions<'_>, sp: u32, fp: u32, pc: u32) -> VmResult<Self> {
        Ok(Self::new(regions.kind_at(pc)?, sp, fp, pc))
    }

    pub fn is_interpreted(&self) -> bool {
        self.kind == FrameKind::Interpreted
    }

    pub fn is_entry(&self) -> bool {
        self.kind == FrameKind::Entry
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.kind, FrameKind::Compiled { .. })
    }

    /// The next older frame, or `None` above the first entry frame.
    pub fn sender(
        &self,
        mem: &dyn Memory32,
        regions: &CodeRegions<'_>,
        map: &mut RegisterMap,
    ) -> VmResult<Option<Frame>> {
        let (sp, unextended_sp, fp, pc) = match self.kind {
            FrameKind::Interpreted => {
                map.set_ebp_location(self.fp);
                map.set_include_argument_oops(false);
                (
                    slot(self.fp, layout::SENDER_SP_OFFSET),
                    mem.read_u32(slot(self.fp, layout::INTERPRETER_SENDER_SP_OFFSET))?,
                    mem.read_u32(slot(self.fp, layout::LINK_OFFSET))?,
                    mem.read_u32(slot(self.fp, layout::RETURN_ADDR_OFFSET))?,
                )
            }
            FrameKind::Entry => {
                let wrapper = self.call_wrapper(mem)?;
                let anchor_sp = mem.read_u32(wrapper + java_call_wrapper::ANCHOR_SP_OFFSET as u32)?;
                if anchor_sp == 0 {
                    return Ok(None);
                }
                map.set_include_argument_oops(false);
                (
                    anchor_sp,
                    anchor_sp,
                    mem.read_u32(wrapper + java_call_wrapper::ANCHOR_FP_OFFSET as u32)?,
                    mem.read_u32(wrapper + java_call_wrapper::ANCHOR_PC_OFFSET as u32)?,
                )
            }
            FrameKind::Compiled { frame_words } | FrameKind::Stub { frame_words } => {
                let words = match self.kind {
                    FrameKind::Compiled { .. } => frame_words + 1,
                    _ => frame_words,
                };
                let sender_sp = self.unextended_sp + words * WORD;
                let saved_ebp = sender_sp - 2 * WORD;
                map.set_ebp_location(saved_ebp);
                map.set_include_argument_oops(!self.is_compiled());
                (
                    sender_sp,
                    sender_sp,
                    mem.read_u32(saved_ebp)?,
                    mem.read_u32(sender_sp - WORD)?,
                )
            }
        };
        let mut sender = Frame::frame_for(regions, sp, fp, pc)?;
        sender.unextended_sp = unextended_sp;
        Ok(Some(sender))
    }

    fn expect_interpreted(&self) -> VmResult<()> {
        if self.is_interpreted() {
            Ok(())
        } else {
            Err(VmError::Frame(format!("{:?} frame at {:#010x} is not interpreted", self.kind, self.fp)))
        }
    }

    fn read_slot(&self, mem: &dyn Memory32, word: i32) -> VmResult<u32> {
        self.expect_interpreted()?;
        mem.read_u32(slot(self.fp, word))
    }

    fn write_slot(&self, mem: &mut dyn Memory32, word: i32, value: u32) -> VmResult<()> {
        self.expect_interpreted()?;
        mem.write_u32(slot(self.fp, word), value)
    }

    // ---- entry frames

    pub fn call_wrapper(&self, mem: &dyn Memory32) -> VmResult<u32> {
        if !self.is_entry() {
            return Err(VmError::Frame(format!("frame at {:#010x} is not an entry frame", self.fp)));
        }
        mem.read_u32(slot(self.fp, layout::ENTRY_FRAME_CALL_WRAPPER_OFFSET))
    }

    // ---- interpreter frames

    pub fn return_address(&self, mem: &dyn Memory32) -> VmResult<u32> {
        mem.read_u32(slot(self.fp, layout::RETURN_ADDR_OFFSET))
    }

    pub fn method(&self, mem: &dyn Memory32) -> VmResult<u32> {
        self.read_slot(mem, layout::METHOD_OFFSET)
    }

    pub fn bcx(&self, mem: &dyn Memory32) -> VmResult<u32> {
        self.read_slot(mem, layout::BCX_OFFSET)
    }

    pub fn bcp(&self, mem: &dyn Memory32) -> VmResult<u32> {
        let bcx = self.bcx(mem)?;
        if is_bci(bcx) {
            Ok(self.code_base(mem)? + bcx)
        } else {
            Ok(bcx)
        }
    }

    pub fn set_bcp(&self, mem: &mut dyn Memory32, bcp: u32) -> VmResult<()> {
        self.write_slot(mem, layout::BCX_OFFSET, bcp)
    }

    pub fn bci(&self, mem: &dyn Memory32) -> VmResult<u32> {
        let bcx = self.bcx(mem)?;
        if is_bci(bcx) {
            return Ok(bcx);
        }
        let method = MethodView::at(self.method(mem)?);
        if !method.contains_bcp(mem, bcx)? {
            return Err(VmError::Frame(format!(
                "bcp {bcx:#010x} outside method {:#010x}",
                method.addr()
            )));
        }
        Ok(bcx - method.code_base(mem)?)
    }

    fn code_base(&self, mem: &dyn Memory32) -> VmResult<u32> {
        MethodView::at(self.method(mem)?).code_base(mem)
    }

    /// Bytecode at the current bci.
    pub fn bytecode(&self, mem: &dyn Memory32) -> VmResult<Bytecode> {
        let bcp = self.bcp(mem)?;
        let op = mem.read_u8(bcp)?;
        Bytecode::from_u8(op).ok_or(VmError::InvalidBytecode {
            opcode: op,
            bci: self.bci(mem)?,
        })
    }

    pub fn mdx(&self, mem: &dyn Memory32) -> VmResult<u32> {
        self.read_slot(mem, layout::MDX_OFFSET)
    }

    /// Profile data pointer, 0 without profiling.
    pub fn mdp(&self, mem: &dyn Memory32) -> VmResult<u32> {
        let mdx = self.mdx(mem)?;
        if mdx == 0 || !is_bci(mdx) {
            return Ok(mdx);
        }
        let md = MethodView::at(self.method(mem)?)
            .method_data(mem)?
            .ok_or_else(|| VmError::Frame("data index without method data".into()))?;
        Ok(md.di_to_dp(mdx - 1))
    }

    pub fn set_mdp(&self, mem: &mut dyn Memory32, mdp: u32) -> VmResult<()> {
        self.write_slot(mem, layout::MDX_OFFSET, mdp)
    }

    pub fn cache(&self, mem: &dyn Memory32) -> VmResult<u32> {
        self.read_slot(mem, layout::CACHE_OFFSET)
    }

    /// Address of local 0; local `i` lives `i` words below it.
    pub fn locals(&self, mem: &dyn Memory32) -> VmResult<u32> {
        self.read_slot(mem, layout::LOCALS_OFFSET)
    }

    pub fn local_at(&self, mem: &dyn Memory32, index: u32) -> VmResult<u32> {
        Ok(self.locals(mem)? - index * WORD)
    }

    pub fn sender_sp(&self, mem: &dyn Memory32) -> VmResult<u32> {
        self.read_slot(mem, layout::INTERPRETER_SENDER_SP_OFFSET)
    }

    /// Expression stack top saved across a call, 0 otherwise.
    pub fn last_sp(&self, mem: &dyn Memory32) -> VmResult<u32> {
        self.read_slot(mem, layout::LAST_SP_OFFSET)
    }

    pub fn set_last_sp(&self, mem: &mut dyn Memory32, sp: u32) -> VmResult<()> {
        self.write_slot(mem, layout::LAST_SP_OFFSET, sp)
    }

    /// Highest end of the monitor block.
    pub fn monitor_begin(&self) -> u32 {
        slot(self.fp, layout::MONITOR_BLOCK_BOTTOM_OFFSET)
    }

    /// Lowest monitor, where the expression stack starts.
    pub fn monitor_end(&self, mem: &dyn Memory32) -> VmResult<u32> {
        self.read_slot(mem, layout::MONITOR_BLOCK_TOP_OFFSET)
    }

    pub fn next_monitor(monitor: u32) -> u32 {
        monitor + basic_object_lock::SIZE as u32
    }

    pub fn previous_monitor(monitor: u32) -> u32 {
        monitor - basic_object_lock::SIZE as u32
    }

    /// Monitor addresses from the most recent to the oldest.
    pub fn monitors(&self, mem: &dyn Memory32) -> VmResult<Vec<u32>> {
        let begin = self.monitor_begin();
        let end = self.monitor_end(mem)?;
        if end > begin || (begin - end) % basic_object_lock::SIZE as u32 != 0 {
            return Err(VmError::Frame(format!("corrupt monitor block top {end:#010x}")));
        }
        let mut out = Vec::new();
        let mut current = end;
        while current < begin {
            out.push(current);
            current = Self::next_monitor(current);
        }
        Ok(out)
    }

    pub fn tos_address(&self, mem: &dyn Memory32) -> VmResult<u32> {
        match self.last_sp(mem)? {
            0 => Ok(self.sp),
            last_sp => Ok(last_sp),
        }
    }

    pub fn expression_stack_size(&self, mem: &dyn Memory32) -> VmResult<u32> {
        let end = self.monitor_end(mem)?;
        let tos = self.tos_address(mem)?;
        if tos > end {
            return Err(VmError::Frame(format!("tos {tos:#010x} above monitor block {end:#010x}")));
        }
        Ok((end - tos) / WORD)
    }

    /// Address of stack element `index`, 0 being the oldest.
    pub fn expression_stack_at(&self, mem: &dyn Memory32, index: u32) -> VmResult<u32> {
        Ok(self.monitor_end(mem)? - (index + 1) * WORD)
    }

    pub fn expression_stack(&self, mem: &dyn Memory32) -> VmResult<Vec<u32>> {
        (0..self.expression_stack_size(mem)?)
            .map(|i| mem.read_u32(self.expression_stack_at(mem, i)?))
            .collect()
    }

    /// Visit the address of every reference slot of the activation.
    pub fn oops_do(
        &self,
        mem: &dyn Memory32,
        lookup: &dyn SignatureLookup,
        oop_maps: &OopMapCache,
        map: &RegisterMap,
        f: &mut dyn FnMut(u32),
    ) -> VmResult<()> {
        match self.kind {
            FrameKind::Interpreted => {}
            FrameKind::Entry => {
                let receiver = self.call_wrapper(mem)? + java_call_wrapper::RECEIVER_OFFSET as u32;
                if mem.read_u32(receiver)? != 0 {
                    f(receiver);
                }
                return Ok(());
            }
            // compiled code describes its own references
            FrameKind::Compiled { .. } | FrameKind::Stub { .. } => return Ok(()),
        }

        for monitor in self.monitors(mem)? {
            let obj = monitor + basic_object_lock::OBJ_OFFSET as u32;
            if mem.read_u32(obj)? != 0 {
                f(obj);
            }
        }

        let method = self.method(mem)?;
        let bci = self.bci(mem)?;
        let stack_size = self.expression_stack_size(mem)?;
        if map.include_argument_oops() && stack_size > 0 && self.bytecode(mem)?.java_code().is_invoke() {
            self.callee_arguments_do(mem, lookup, method, bci, f)?;
        }

        let mask = oop_maps.lookup(mem, lookup, method, bci)?;
        let locals = self.locals(mem)?;
        let monitor_end = self.monitor_end(mem)?;
        let max_locals = mask.max_locals();
        mask.iterate_oop(|offset| {
            if offset < max_locals {
                f(locals - offset as u32 * WORD);
            } else {
                let index = (offset - max_locals) as u32;
                // after an exception the stack may already be cut back
                if index < stack_size {
                    f(monitor_end - (index + 1) * WORD);
                }
            }
        });
        Ok(())
    }

    /// References among the outgoing arguments of the invoke at `bci`.
    fn callee_arguments_do(
        &self,
        mem: &dyn Memory32,
        lookup: &dyn SignatureLookup,
        method: u32,
        bci: u32,
        f: &mut dyn FnMut(u32),
    ) -> VmResult<()> {
        let MemberRef::Invoke {
            parameters,
            has_receiver,
            ..
        } = lookup.member_at(method, bci)?
        else {
            return Err(VmError::Frame(format!("no call signature at {method:#x}@{bci}")));
        };
        let mut types = Vec::with_capacity(parameters.len() + 1);
        if has_receiver {
            types.push(BasicType::Object);
        }
        types.extend(parameters);
        let words: u32 = types.iter().map(|t| t.size_in_words() as u32).sum();
        let tos = self.tos_address(mem)?;
        let mut offset = 0;
        for ty in types {
            if ty.is_reference() {
                f(tos + (words - 1 - offset) * WORD);
            }
            offset += ty.size_in_words() as u32;
        }
        Ok(())
    }

    /// Report the method so its holder stays alive.
    pub fn metadata_do(&self, mem: &dyn Memory32, f: &mut dyn FnMut(u32)) -> VmResult<()> {
        if self.is_interpreted() {
            f(self.method(mem)?);
        }
        Ok(())
    }

    /// Turn bcp into a bci and mdp into a data index + 1 before metadata
    /// may move.
    pub fn gc_prologue(&self, mem: &mut dyn Memory32) -> VmResult<()> {
        self.expect_interpreted()?;
        let bcx = self.bcx(mem)?;
        let mdx = self.mdx(mem)?;
        let new_bcx = if is_bci(bcx) { bcx } else { self.bci(mem)? };
        let new_mdx = if mdx == 0 || is_bci(mdx) {
            mdx
        } else {
            let md = MethodView::at(self.method(mem)?)
                .method_data(mem)?
                .ok_or_else(|| VmError::Frame("profile pointer without method data".into()))?;
            md.dp_to_di(mdx) + 1
        };
        self.write_slot(mem, layout::BCX_OFFSET, new_bcx)?;
        self.write_slot(mem, layout::MDX_OFFSET, new_mdx)
    }

    pub fn gc_epilogue(&self, mem: &mut dyn Memory32) -> VmResult<()> {
        self.expect_interpreted()?;
        let bcp = self.bcp(mem)?;
        let mdp = self.mdp(mem)?;
        self.write_slot(mem, layout::BCX_OFFSET, bcp)?;
        self.write_slot(mem, layout::MDX_OFFSET, mdp)
    }
}

/// Words of an interpreter activation, from its last extra local down to
/// the expression stack. The parameters belong to the caller.
pub fn interpreter_frame_size(
    max_locals: u32,
    size_of_parameters: u32,
    stack_words: u32,
    monitors: u32,
) -> u32 {
    let overhead = (layout::SENDER_SP_OFFSET - layout::INITIAL_SP_OFFSET) as u32;
    overhead + max_locals.saturating_sub(size_of_parameters) + monitors * layout::MONITOR_SIZE as u32 + stack_words
}

/// Contents of an interpreter activation to be materialized.
#[derive(Debug, Clone, Default)]
pub struct Activation {
    pub method: u32,
    pub bci: u32,
    /// One word per local, local 0 first
    pub locals: Vec<u32>,
    /// Oldest element first
    pub expressions: Vec<u32>,
    /// `(object, displaced header)`, oldest first
    pub monitors: Vec<(u32, u32)>,
}

/// Build an interpreter frame whose local 0 sits at `locals_addr`.
///
/// `last_sp` is set to the stack top as a frame suspended at a call
/// would have it; the deoptimization entries clear it on resume.
pub fn layout_activation(
    mem: &mut dyn Memory32,
    act: &Activation,
    locals_addr: u32,
    sender_sp: u32,
    return_pc: u32,
    link: u32,
) -> VmResult<Frame> {
    let method = MethodView::at(act.method);
    let max_locals = method.max_locals(mem)? as u32;
    if act.locals.len() as u32 > max_locals {
        return Err(VmError::Frame(format!(
            "{} locals exceed max_locals {max_locals}",
            act.locals.len()
        )));
    }
    for i in 0..max_locals {
        let value = act.locals.get(i as usize).copied().unwrap_or(0);
        mem.write_u32(locals_addr - i * WORD, value)?;
    }
    let ret = locals_addr - max_locals * WORD;
    mem.write_u32(ret, return_pc)?;
    let fp = ret - WORD;
    mem.write_u32(fp, link)?;

    let mdp = match method.method_data(mem)? {
        Some(md) => md.bci_to_dp(mem, act.bci)?,
        None => 0,
    };
    let code_base = method.code_base(mem)?;
    let cache = method.cache(mem)?;
    let fixed = [
        (layout::INTERPRETER_SENDER_SP_OFFSET, sender_sp),
        (layout::METHOD_OFFSET, act.method),
        (layout::MDX_OFFSET, mdp),
        (layout::CACHE_OFFSET, cache),
        (layout::LOCALS_OFFSET, locals_addr),
        (layout::BCX_OFFSET, code_base + act.bci),
    ];
    for (word, value) in fixed {
        mem.write_u32(slot(fp, word), value)?;
    }

    let mut monitor = slot(fp, layout::MONITOR_BLOCK_BOTTOM_OFFSET);
    for &(obj, displaced) in &act.monitors {
        monitor = Frame::previous_monitor(monitor);
        mem.write_u32(monitor + basic_object_lock::LOCK_OFFSET as u32, displaced)?;
        mem.write_u32(monitor + basic_object_lock::OBJ_OFFSET as u32, obj)?;
    }
    mem.write_u32(slot(fp, layout::MONITOR_BLOCK_TOP_OFFSET), monitor)?;

    let mut tos = monitor;
    for &value in &act.expressions {
        tos -= WORD;
        mem.write_u32(tos, value)?;
    }
    mem.write_u32(slot(fp, layout::LAST_SP_OFFSET), tos)?;
    log::trace!(
        "laid out activation of {:#x}@{} at fp {fp:#010x}, sp {tos:#010x}",
        act.method,
        act.bci
    );
    Ok(Frame::new(FrameKind::Interpreted, tos, fp, return_pc))
}

/// Frames from `top` outward, stopping above the first entry frame.
pub fn walk(
    mem: &dyn Memory32,
    regions: &CodeRegions<'_>,
    top: Frame,
    map: &mut RegisterMap,
) -> VmResult<Vec<Frame>> {
    const MAX_FRAMES: usize = 10_000;
    let mut frames = vec![top];
    let mut current = top;
    while let Some(sender) = current.sender(mem, regions, map)? {
        if frames.len() >= MAX_FRAMES {
            return Err(VmError::Frame("stack walk does not terminate".into()));
        }
        frames.push(sender);
        current = sender;
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::layout::access;
    use crate::runtime::memory32::SimMemory;
    use crate::runtime::method::{Metaspace, MethodBuilder, MethodDef};

    const STACK: u32 = 0x0C00_0000;
    const STACK_SIZE: u32 = 0x1_0000;
    const LOCALS: u32 = STACK + 0x8000;

    fn setup(def: MethodDef, profile: bool) -> (SimMemory, MethodBuilder, u32) {
        let mut mem = SimMemory::new();
        mem.map(STACK, STACK_SIZE).unwrap();
        let space = Metaspace::new(0x0100_0000, 0x8000, 0x0010_0000).unwrap();
        space.map(&mut mem).unwrap();
        let mut builder = MethodBuilder::new(space, profile);
        let built = builder.build(&mut mem, def).unwrap();
        (mem, builder, built.method)
    }

    fn two_refs() -> MethodDef {
        // ALOAD_0 = 2A, ASTORE_1 = 4C, ALOAD_1 = 2B, ICONST_3 = 06, POP = 57, RETURN = B1
        let mut def = MethodDef::new(
            "m",
            "(Ljava/lang/Object;)V",
            access::STATIC,
            vec![0x2A, 0x4C, 0x2B, 0x06, 0x57, 0x57, 0xB1],
        )
        .unwrap();
        def.max_locals = 3;
        def
    }

    #[test]
    fn test_layout_matches_fixed_slots() {
        let (mut mem, _, method) = setup(two_refs(), false);
        let act = Activation {
            method,
            bci: 3,
            locals: vec![0x2000_0010, 0x2000_0020, 7],
            expressions: vec![0x2000_0020],
            monitors: vec![(0x2000_0030, 1)],
        };
        let frame = layout_activation(&mut mem, &act, LOCALS, LOCALS + 4, 0x0801_0000, 0x0C00_F000).unwrap();
        assert_eq!(frame.fp, LOCALS - 3 * 4 - 4);
        assert_eq!(frame.return_address(&mem).unwrap(), 0x0801_0000);
        assert_eq!(frame.method(&mem).unwrap(), method);
        assert_eq!(frame.bci(&mem).unwrap(), 3);
        assert_eq!(frame.bytecode(&mem).unwrap(), Bytecode::Iconst3);
        assert_eq!(frame.locals(&mem).unwrap(), LOCALS);
        assert_eq!(mem.read_u32(frame.local_at(&mem, 2).unwrap()).unwrap(), 7);
        assert_eq!(frame.sender_sp(&mem).unwrap(), LOCALS + 4);
        assert_eq!(frame.monitor_begin(), frame.fp - 32);
        assert_eq!(frame.monitors(&mem).unwrap(), vec![frame.fp - 40]);
        assert_eq!(frame.expression_stack(&mem).unwrap(), vec![0x2000_0020]);
        assert_eq!(frame.sp, frame.fp - 44);
    }

    #[test]
    fn test_empty_stack_sits_on_initial_sp() {
        let (mut mem, _, method) = setup(two_refs(), false);
        let act = Activation {
            method,
            bci: 0,
            ..Default::default()
        };
        let frame = layout_activation(&mut mem, &act, LOCALS, LOCALS + 4, 0, 0).unwrap();
        assert_eq!(frame.monitor_end(&mem).unwrap(), frame.fp - 32);
        assert_eq!(frame.expression_stack_size(&mem).unwrap(), 0);
        assert!(frame.monitors(&mem).unwrap().is_empty());
    }

    #[test]
    fn test_oops_do_visits_monitors_locals_and_stack() {
        let (mut mem, builder, method) = setup(two_refs(), false);
        let act = Activation {
            method,
            bci: 3,
            locals: vec![0x2000_0010, 0x2000_0010, 9],
            expressions: vec![0x2000_0010],
            monitors: vec![(0x2000_0030, 1), (0, 0)],
        };
        let frame = layout_activation(&mut mem, &act, LOCALS, LOCALS + 4, 0, 0).unwrap();
        frame.set_last_sp(&mut mem, 0).unwrap();
        let cache = OopMapCache::new();
        let mut seen = Vec::new();
        frame
            .oops_do(&mem, builder.registry(), &cache, &RegisterMap::new(true), &mut |a| seen.push(a))
            .unwrap();
        let monitors = frame.monitors(&mem).unwrap();
        // the empty monitor is skipped
        assert_eq!(monitors.len(), 2);
        let expected = vec![
            monitors[1] + 4,
            LOCALS,
            LOCALS - 4,
            frame.expression_stack_at(&mem, 0).unwrap(),
        ];
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_gc_prologue_and_epilogue_round_trip() {
        let mut def = two_refs();
        def.code = vec![0x2A, 0xC6, 0x00, 0x03, 0xB1]; // ALOAD_0, IFNULL +3, RETURN
        let (mut mem, _, method) = setup(def, true);
        let act = Activation {
            method,
            bci: 1,
            locals: vec![0, 0, 0],
            ..Default::default()
        };
        let frame = layout_activation(&mut mem, &act, LOCALS, LOCALS + 4, 0, 0).unwrap();
        let bcp = frame.bcp(&mem).unwrap();
        let mdp = frame.mdp(&mem).unwrap();
        assert_ne!(mdp, 0);

        frame.gc_prologue(&mut mem).unwrap();
        assert_eq!(frame.bcx(&mem).unwrap(), 1);
        assert!(is_bci(frame.mdx(&mem).unwrap()));
        assert_eq!(frame.bcp(&mem).unwrap(), bcp);
        assert_eq!(frame.mdp(&mem).unwrap(), mdp);

        frame.gc_epilogue(&mut mem).unwrap();
        assert_eq!(frame.bcx(&mem).unwrap(), bcp);
        assert_eq!(frame.mdx(&mem).unwrap(), mdp);
    }

    #[test]
    fn test_metadata_do_reports_method() {
        let (mut mem, _, method) = setup(two_refs(), false);
        let act = Activation {
            method,
            ..Default::default()
        };
        let frame = layout_activation(&mut mem, &act, LOCALS, LOCALS + 4, 0, 0).unwrap();
        let mut seen = Vec::new();
        frame.metadata_do(&mem, &mut |m| seen.push(m)).unwrap();
        assert_eq!(seen, vec![method]);
    }

    #[test]
    fn test_slot_accessors_reject_other_kinds() {
        let mem = SimMemory::new();
        let frame = Frame::new(FrameKind::Compiled { frame_words: 4 }, STACK, STACK + 8, 0);
        assert!(frame.method(&mem).is_err());
        assert!(frame.call_wrapper(&mem).is_err());
    }

    #[test]
    fn test_interpreter_frame_size() {
        // 10 fixed words, 2 extra locals, 1 monitor, 5 stack words
        assert_eq!(interpreter_frame_size(4, 2, 5, 1), 10 + 2 + 2 + 5);
        assert_eq!(interpreter_frame_size(1, 3, 0, 0), 10);
    }
}
