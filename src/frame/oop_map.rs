//! Interpreter oop maps.
//!
//! The map for a bci says which locals and expression stack slots hold
//! references before the instruction at that bci executes. Maps come from
//! an abstract interpretation of the whole method and are cached per
//! method.
//!
//! At an invoke the outgoing arguments count as popped: they belong to the
//! callee's locals, or are scanned from the callee signature when the frame
//! is stopped at a call into the VM.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{VmError, VmResult};
use crate::runtime::basic_type::BasicType;
use crate::runtime::bytecodes::{self, Bytecode};
use crate::runtime::memory32::Memory32;
use crate::runtime::method::{ExceptionEntry, MemberRef, MethodView, SignatureLookup};

/// Abstract contents of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CellKind {
    /// Never written on any path
    Uninit,
    Value,
    Ref,
    /// Pushed by `jsr`
    ReturnAddress,
    /// Different kinds on different paths; never read again
    Conflict,
}

impl CellKind {
    fn merge(self, other: CellKind) -> CellKind {
        if self == other { self } else { CellKind::Conflict }
    }

    pub fn is_oop(self) -> bool {
        self == CellKind::Ref
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct State {
    locals: Vec<CellKind>,
    stack: Vec<CellKind>,
}

impl State {
    /// Merge `other` in, reporting whether anything changed.
    fn merge_from(&mut self, other: &State, bci: usize) -> VmResult<bool> {
        if self.stack.len() != other.stack.len() {
            return Err(VmError::Frame(format!(
                "stack height mismatch at bci {bci}: {} vs {}",
                self.stack.len(),
                other.stack.len()
            )));
        }
        let mut changed = false;
        let cells = self.locals.iter_mut().chain(self.stack.iter_mut());
        let others = other.locals.iter().chain(other.stack.iter());
        for (cell, &o) in cells.zip(others) {
            let merged = cell.merge(o);
            if merged != *cell {
                *cell = merged;
                changed = true;
            }
        }
        Ok(changed)
    }

    fn pop(&mut self, n: usize, bci: usize) -> VmResult<Vec<CellKind>> {
        if self.stack.len() < n {
            return Err(VmError::Frame(format!("expression stack underflow at bci {bci}")));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn push_value(&mut self, words: usize) {
        self.stack.extend(std::iter::repeat_n(CellKind::Value, words));
    }

    fn push_type(&mut self, ty: BasicType) {
        if ty.is_reference() {
            self.stack.push(CellKind::Ref);
        } else {
            self.push_value(ty.size_in_words());
        }
    }

    fn store(&mut self, index: usize, cells: &[CellKind], bci: usize) -> VmResult<()> {
        if index + cells.len() > self.locals.len() {
            return Err(VmError::Frame(format!("local {index} out of range at bci {bci}")));
        }
        self.locals[index..index + cells.len()].copy_from_slice(cells);
        Ok(())
    }

    fn load(&self, index: usize, bci: usize) -> VmResult<CellKind> {
        self.locals
            .get(index)
            .copied()
            .ok_or_else(|| VmError::Frame(format!("local {index} out of range at bci {bci}")))
    }
}

/// Oop map of one bci.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterpreterOopMap {
    pub bci: u32,
    /// Whether any path reaches the bci
    pub reachable: bool,
    locals: Vec<CellKind>,
    stack: Vec<CellKind>,
}

impl InterpreterOopMap {
    pub fn max_locals(&self) -> usize {
        self.locals.len()
    }

    pub fn expression_stack_size(&self) -> usize {
        self.stack.len()
    }

    pub fn local(&self, index: usize) -> Option<CellKind> {
        self.locals.get(index).copied()
    }

    /// Stack cell `index`, counted from the bottom.
    pub fn stack_at(&self, index: usize) -> Option<CellKind> {
        self.stack.get(index).copied()
    }

    /// Slot `offset` over locals followed by the stack.
    pub fn is_oop(&self, offset: usize) -> bool {
        self.cell(offset).is_some_and(CellKind::is_oop)
    }

    pub fn is_dead(&self, offset: usize) -> bool {
        matches!(self.cell(offset), Some(CellKind::Conflict | CellKind::Uninit) | None)
    }

    fn cell(&self, offset: usize) -> Option<CellKind> {
        if offset < self.locals.len() {
            self.locals.get(offset).copied()
        } else {
            self.stack.get(offset - self.locals.len()).copied()
        }
    }

    /// Call `f` with the offset of every reference slot.
    pub fn iterate_oop(&self, mut f: impl FnMut(usize)) {
        for offset in 0..self.locals.len() + self.stack.len() {
            if self.is_oop(offset) {
                f(offset);
            }
        }
    }

    pub fn oop_locals(&self) -> Vec<usize> {
        (0..self.locals.len()).filter(|&i| self.locals[i].is_oop()).collect()
    }

    pub fn oop_stack(&self) -> Vec<usize> {
        (0..self.stack.len()).filter(|&i| self.stack[i].is_oop()).collect()
    }
}

/// What the analysis needs from a method.
#[derive(Debug, Clone)]
pub struct MethodCode {
    pub method: u32,
    pub code: Vec<u8>,
    pub max_locals: usize,
    pub max_stack: usize,
    pub exception_table: Vec<ExceptionEntry>,
}

impl MethodCode {
    pub fn read(mem: &dyn Memory32, method: MethodView) -> VmResult<Self> {
        Ok(Self {
            method: method.addr(),
            code: method.code(mem)?,
            max_locals: method.max_locals(mem)? as usize,
            max_stack: method.max_stack(mem)? as usize,
            exception_table: method.exception_table(mem)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Insn {
    bci: usize,
    java: Bytecode,
    len: usize,
    /// Target of a `wide` prefix
    wide: Option<Bytecode>,
}

impl Insn {
    fn op(&self) -> Bytecode {
        self.wide.unwrap_or(self.java)
    }
}

fn decode(code: &[u8]) -> VmResult<BTreeMap<usize, Insn>> {
    let mut insns = BTreeMap::new();
    let mut bci = 0;
    while bci < code.len() {
        let raw = bytecodes::code_at(code, bci)?;
        if raw == Bytecode::Breakpoint {
            return Err(VmError::Frame(format!("breakpoint hides the bytecode at bci {bci}")));
        }
        let java = raw.java_code();
        // Fused fast bytecodes still leave their second half in place.
        let len = match java.length() {
            0 => bytecodes::length_at(code, bci)?,
            n => n as usize,
        };
        let wide = if raw == Bytecode::Wide {
            Some(bytecodes::code_at(code, bci + 1)?)
        } else {
            None
        };
        insns.insert(bci, Insn { bci, java, len, wide });
        bci += len;
    }
    Ok(insns)
}

/// Entry states of every reachable bci of one method.
#[derive(Debug)]
pub struct MethodOopMaps {
    method: u32,
    maps: BTreeMap<u32, InterpreterOopMap>,
    max_locals: usize,
}

impl MethodOopMaps {
    pub fn compute(lookup: &dyn SignatureLookup, m: &MethodCode) -> VmResult<Self> {
        let analysis = Analysis {
            method: m,
            lookup,
            insns: decode(&m.code)?,
        };
        analysis.run()
    }

    pub fn method(&self) -> u32 {
        self.method
    }

    /// Map at `bci`; an unreachable bci has no oops.
    pub fn at(&self, bci: u32) -> InterpreterOopMap {
        self.maps.get(&bci).cloned().unwrap_or_else(|| InterpreterOopMap {
            bci,
            reachable: false,
            locals: vec![CellKind::Uninit; self.max_locals],
            stack: Vec::new(),
        })
    }
}

struct Analysis<'a> {
    method: &'a MethodCode,
    lookup: &'a dyn SignatureLookup,
    insns: BTreeMap<usize, Insn>,
}

impl Analysis<'_> {
    fn run(&self) -> VmResult<MethodOopMaps> {
        let m = self.method;
        let mut entry = State {
            locals: vec![CellKind::Uninit; m.max_locals],
            stack: Vec::new(),
        };
        let mut index = 0;
        for ty in self.lookup.arguments(m.method)? {
            let cells: Vec<CellKind> = if ty.is_reference() {
                vec![CellKind::Ref]
            } else {
                vec![CellKind::Value; ty.size_in_words()]
            };
            entry.store(index, &cells, 0)?;
            index += cells.len();
        }

        let jsr_returns: Vec<usize> = self
            .insns
            .values()
            .filter(|i| matches!(i.java, Bytecode::Jsr | Bytecode::JsrW))
            .map(|i| i.bci + i.len)
            .collect();

        let mut states: HashMap<usize, State> = HashMap::new();
        let mut queue = VecDeque::new();
        if !self.insns.is_empty() {
            states.insert(0, entry);
            queue.push_back(0);
        }
        let mut maps = BTreeMap::new();
        while let Some(bci) = queue.pop_front() {
            let Some(insn) = self.insns.get(&bci).copied() else {
                return Err(VmError::Frame(format!("branch into the middle of an instruction at {bci}")));
            };
            let Some(before) = states.get(&bci).cloned() else {
                continue;
            };
            let mut after = before.clone();
            let successors = self.step(&insn, &mut after, &jsr_returns)?;
            if after.stack.len() > m.max_stack {
                return Err(VmError::Frame(format!("expression stack overflow at bci {bci}")));
            }

            for handler in self.handlers_covering(bci) {
                let mut exc = State {
                    locals: before.locals.clone(),
                    stack: vec![CellKind::Ref],
                };
                if is_store(insn.op()) {
                    exc.merge_from(
                        &State {
                            locals: after.locals.clone(),
                            stack: vec![CellKind::Ref],
                        },
                        handler,
                    )?;
                }
                Self::flow(&mut states, &mut queue, handler, &exc)?;
            }
            for next in successors {
                if !self.insns.contains_key(&next) {
                    return Err(VmError::Frame(format!(
                        "bci {bci} continues to {next}, which is not an instruction"
                    )));
                }
                Self::flow(&mut states, &mut queue, next, &after)?;
            }
        }

        for (&bci, state) in &states {
            let mut reported = state.clone();
            if let Some(insn) = self.insns.get(&bci)
                && insn.java.is_invoke()
            {
                let args = self.invoke_arguments(insn)?;
                reported.pop(args, bci)?;
            }
            maps.insert(
                bci as u32,
                InterpreterOopMap {
                    bci: bci as u32,
                    reachable: true,
                    locals: reported.locals,
                    stack: reported.stack,
                },
            );
        }
        log::trace!("computed oop maps for {:#x}: {} bcis", m.method, maps.len());
        Ok(MethodOopMaps {
            method: m.method,
            maps,
            max_locals: m.max_locals,
        })
    }

    fn flow(
        states: &mut HashMap<usize, State>,
        queue: &mut VecDeque<usize>,
        bci: usize,
        incoming: &State,
    ) -> VmResult<()> {
        let changed = match states.get_mut(&bci) {
            Some(existing) => existing.merge_from(incoming, bci)?,
            None => {
                states.insert(bci, incoming.clone());
                true
            }
        };
        if changed && !queue.contains(&bci) {
            queue.push_back(bci);
        }
        Ok(())
    }

    fn handlers_covering(&self, bci: usize) -> Vec<usize> {
        self.method
            .exception_table
            .iter()
            .filter(|e| (e.start_pc as usize..e.end_pc as usize).contains(&bci))
            .map(|e| e.handler_pc as usize)
            .collect()
    }

    fn code(&self) -> &[u8] {
        &self.method.code
    }

    fn local_index(&self, insn: &Insn) -> VmResult<usize> {
        if insn.wide.is_some() {
            Ok(bytecodes::read_u16_be(self.code(), insn.bci + 2)? as usize)
        } else {
            self.code()
                .get(insn.bci + 1)
                .map(|&b| b as usize)
                .ok_or_else(|| VmError::Frame(format!("truncated operand at bci {}", insn.bci)))
        }
    }

    fn target(&self, insn: &Insn, offset: i32) -> VmResult<usize> {
        let target = insn.bci as i64 + offset as i64;
        if target < 0 || target >= self.code().len() as i64 {
            return Err(VmError::Frame(format!(
                "branch at bci {} leaves the method",
                insn.bci
            )));
        }
        Ok(target as usize)
    }

    fn switch_targets(&self, insn: &Insn) -> VmResult<Vec<usize>> {
        let code = self.code();
        let base = bytecodes::switch_operands(insn.bci);
        let mut targets = vec![self.target(insn, bytecodes::read_i32_be(code, base)?)?];
        if insn.java == Bytecode::Tableswitch {
            let low = bytecodes::read_i32_be(code, base + 4)?;
            let high = bytecodes::read_i32_be(code, base + 8)?;
            let count = (high as i64 - low as i64 + 1).max(0) as usize;
            for i in 0..count {
                targets.push(self.target(insn, bytecodes::read_i32_be(code, base + 12 + 4 * i)?)?);
            }
        } else {
            let npairs = bytecodes::read_i32_be(code, base + 4)?.max(0) as usize;
            for i in 0..npairs {
                targets.push(self.target(insn, bytecodes::read_i32_be(code, base + 12 + 8 * i)?)?);
            }
        }
        Ok(targets)
    }

    fn member(&self, insn: &Insn) -> VmResult<MemberRef> {
        self.lookup.member_at(self.method.method, insn.bci as u32)
    }

    /// Stack words an invoke consumes.
    fn invoke_arguments(&self, insn: &Insn) -> VmResult<usize> {
        match self.member(insn)? {
            MemberRef::Invoke {
                parameters,
                has_receiver,
                ..
            } => Ok(parameters.iter().map(|t| t.size_in_words()).sum::<usize>() + has_receiver as usize),
            other => Err(VmError::Frame(format!(
                "invoke at bci {} refers to {other:?}",
                insn.bci
            ))),
        }
    }

    fn field_type(&self, insn: &Insn) -> VmResult<BasicType> {
        match self.member(insn)? {
            MemberRef::Field { ty, .. } => Ok(ty),
            other => Err(VmError::Frame(format!("field access at bci {} refers to {other:?}", insn.bci))),
        }
    }

    /// Apply `insn` to `s`, returning the successor bcis.
    fn step(&self, insn: &Insn, s: &mut State, jsr_returns: &[usize]) -> VmResult<Vec<usize>> {
        use Bytecode::*;
        let bci = insn.bci;
        let next = bci + insn.len;
        let op = insn.op();
        match op {
            Nop => {}
            AconstNull => s.stack.push(CellKind::Ref),
            IconstM1 | Iconst0 | Iconst1 | Iconst2 | Iconst3 | Iconst4 | Iconst5 | Fconst0 | Fconst1 | Fconst2
            | Bipush | Sipush => s.push_value(1),
            Lconst0 | Lconst1 | Dconst0 | Dconst1 | Ldc2W => s.push_value(2),
            Ldc | LdcW => match self.member(insn)? {
                MemberRef::Constant(ty) => s.push_type(ty),
                _ => s.push_value(1),
            },

            Iload | Fload => {
                self.local_index(insn)?;
                s.push_value(1);
            }
            Lload | Dload => {
                self.local_index(insn)?;
                s.push_value(2);
            }
            Iload0 | Iload1 | Iload2 | Iload3 | Fload0 | Fload1 | Fload2 | Fload3 => s.push_value(1),
            Lload0 | Lload1 | Lload2 | Lload3 | Dload0 | Dload1 | Dload2 | Dload3 => s.push_value(2),
            Aload => {
                let cell = s.load(self.local_index(insn)?, bci)?;
                s.stack.push(cell);
            }
            Aload0 | Aload1 | Aload2 | Aload3 => {
                let cell = s.load((op.code() - Aload0.code()) as usize, bci)?;
                s.stack.push(cell);
            }

            Iaload | Faload | Baload | Caload | Saload => {
                s.pop(2, bci)?;
                s.push_value(1);
            }
            Laload | Daload => {
                s.pop(2, bci)?;
                s.push_value(2);
            }
            Aaload => {
                s.pop(2, bci)?;
                s.stack.push(CellKind::Ref);
            }

            Istore | Fstore => {
                s.pop(1, bci)?;
                s.store(self.local_index(insn)?, &[CellKind::Value], bci)?;
            }
            Lstore | Dstore => {
                s.pop(2, bci)?;
                s.store(self.local_index(insn)?, &[CellKind::Value; 2], bci)?;
            }
            Astore => {
                let cell = s.pop(1, bci)?;
                s.store(self.local_index(insn)?, &cell, bci)?;
            }
            Istore0 | Istore1 | Istore2 | Istore3 => {
                s.pop(1, bci)?;
                s.store((op.code() - Istore0.code()) as usize, &[CellKind::Value], bci)?;
            }
            Fstore0 | Fstore1 | Fstore2 | Fstore3 => {
                s.pop(1, bci)?;
                s.store((op.code() - Fstore0.code()) as usize, &[CellKind::Value], bci)?;
            }
            Lstore0 | Lstore1 | Lstore2 | Lstore3 => {
                s.pop(2, bci)?;
                s.store((op.code() - Lstore0.code()) as usize, &[CellKind::Value; 2], bci)?;
            }
            Dstore0 | Dstore1 | Dstore2 | Dstore3 => {
                s.pop(2, bci)?;
                s.store((op.code() - Dstore0.code()) as usize, &[CellKind::Value; 2], bci)?;
            }
            Astore0 | Astore1 | Astore2 | Astore3 => {
                let cell = s.pop(1, bci)?;
                s.store((op.code() - Astore0.code()) as usize, &cell, bci)?;
            }

            Iastore | Fastore | Aastore | Bastore | Castore | Sastore => {
                s.pop(3, bci)?;
            }
            Lastore | Dastore => {
                s.pop(4, bci)?;
            }

            Pop => {
                s.pop(1, bci)?;
            }
            Pop2 => {
                s.pop(2, bci)?;
            }
            Dup => shuffle(s, 1, &[0, 0], bci)?,
            DupX1 => shuffle(s, 2, &[1, 0, 1], bci)?,
            DupX2 => shuffle(s, 3, &[2, 0, 1, 2], bci)?,
            Dup2 => shuffle(s, 2, &[0, 1, 0, 1], bci)?,
            Dup2X1 => shuffle(s, 3, &[1, 2, 0, 1, 2], bci)?,
            Dup2X2 => shuffle(s, 4, &[2, 3, 0, 1, 2, 3], bci)?,
            Swap => shuffle(s, 2, &[1, 0], bci)?,

            Iadd | Isub | Imul | Idiv | Irem | Ishl | Ishr | Iushr | Iand | Ior | Ixor | Fadd | Fsub | Fmul
            | Fdiv | Frem => {
                s.pop(2, bci)?;
                s.push_value(1);
            }
            Ladd | Lsub | Lmul | Ldiv | Lrem | Land | Lor | Lxor | Dadd | Dsub | Dmul | Ddiv | Drem => {
                s.pop(4, bci)?;
                s.push_value(2);
            }
            Lshl | Lshr | Lushr => {
                s.pop(3, bci)?;
                s.push_value(2);
            }
            Ineg | Fneg | I2f | F2i | I2b | I2c | I2s => {
                s.pop(1, bci)?;
                s.push_value(1);
            }
            Lneg | Dneg | L2d | D2l => {
                s.pop(2, bci)?;
                s.push_value(2);
            }
            I2l | I2d | F2l | F2d => {
                s.pop(1, bci)?;
                s.push_value(2);
            }
            L2i | L2f | D2i | D2f => {
                s.pop(2, bci)?;
                s.push_value(1);
            }
            Iinc => {
                self.local_index(insn)?;
            }
            Lcmp | Dcmpl | Dcmpg => {
                s.pop(4, bci)?;
                s.push_value(1);
            }
            Fcmpl | Fcmpg => {
                s.pop(2, bci)?;
                s.push_value(1);
            }

            Ifeq | Ifne | Iflt | Ifge | Ifgt | Ifle | Ifnull | Ifnonnull => {
                s.pop(1, bci)?;
                let offset = bytecodes::read_u16_be(self.code(), bci + 1)? as i16;
                return Ok(vec![next, self.target(insn, offset as i32)?]);
            }
            IfIcmpeq | IfIcmpne | IfIcmplt | IfIcmpge | IfIcmpgt | IfIcmple | IfAcmpeq | IfAcmpne => {
                s.pop(2, bci)?;
                let offset = bytecodes::read_u16_be(self.code(), bci + 1)? as i16;
                return Ok(vec![next, self.target(insn, offset as i32)?]);
            }
            Goto => {
                let offset = bytecodes::read_u16_be(self.code(), bci + 1)? as i16;
                return Ok(vec![self.target(insn, offset as i32)?]);
            }
            GotoW => {
                return Ok(vec![self.target(insn, bytecodes::read_i32_be(self.code(), bci + 1)?)?]);
            }
            Jsr => {
                s.stack.push(CellKind::ReturnAddress);
                let offset = bytecodes::read_u16_be(self.code(), bci + 1)? as i16;
                return Ok(vec![self.target(insn, offset as i32)?]);
            }
            JsrW => {
                s.stack.push(CellKind::ReturnAddress);
                return Ok(vec![self.target(insn, bytecodes::read_i32_be(self.code(), bci + 1)?)?]);
            }
            Ret => {
                self.local_index(insn)?;
                // Any subroutine may return to any call site.
                return Ok(jsr_returns.to_vec());
            }
            Tableswitch | Lookupswitch => {
                s.pop(1, bci)?;
                return self.switch_targets(insn);
            }
            Ireturn | Freturn | Areturn => {
                s.pop(1, bci)?;
                return Ok(Vec::new());
            }
            Lreturn | Dreturn => {
                s.pop(2, bci)?;
                return Ok(Vec::new());
            }
            Return => return Ok(Vec::new()),
            Athrow => {
                s.pop(1, bci)?;
                return Ok(Vec::new());
            }

            Getstatic => s.push_type(self.field_type(insn)?),
            Putstatic => {
                s.pop(self.field_type(insn)?.size_in_words(), bci)?;
            }
            Getfield => {
                let ty = self.field_type(insn)?;
                s.pop(1, bci)?;
                s.push_type(ty);
            }
            Putfield => {
                s.pop(self.field_type(insn)?.size_in_words() + 1, bci)?;
            }
            Invokevirtual | Invokespecial | Invokestatic | Invokeinterface | Invokedynamic => {
                let MemberRef::Invoke {
                    parameters,
                    result,
                    has_receiver,
                } = self.member(insn)?
                else {
                    return Err(VmError::Frame(format!("invoke at bci {bci} has no signature")));
                };
                let words = parameters.iter().map(|t| t.size_in_words()).sum::<usize>() + has_receiver as usize;
                s.pop(words, bci)?;
                s.push_type(result);
            }

            New => s.stack.push(CellKind::Ref),
            Newarray | Anewarray | Checkcast => {
                s.pop(1, bci)?;
                s.stack.push(CellKind::Ref);
            }
            Arraylength | Instanceof => {
                s.pop(1, bci)?;
                s.push_value(1);
            }
            Monitorenter | Monitorexit => {
                s.pop(1, bci)?;
            }
            Multianewarray => {
                let dims = self
                    .code()
                    .get(bci + 3)
                    .copied()
                    .ok_or_else(|| VmError::Frame(format!("truncated multianewarray at bci {bci}")))?;
                s.pop(dims as usize, bci)?;
                s.stack.push(CellKind::Ref);
            }
            other => {
                return Err(VmError::Frame(format!("cannot compute oop map across {other} at bci {bci}")));
            }
        }
        Ok(vec![next])
    }
}

fn is_store(op: Bytecode) -> bool {
    (Bytecode::Istore.code()..=Bytecode::Astore3.code()).contains(&op.code()) || op == Bytecode::Iinc
}

/// Pop `n` cells (0 = deepest) and push them back in `pattern` order.
fn shuffle(s: &mut State, n: usize, pattern: &[usize], bci: usize) -> VmResult<()> {
    let popped = s.pop(n, bci)?;
    s.stack.extend(pattern.iter().map(|&i| popped[i]));
    Ok(())
}

/// Per-method oop maps, computed on first use.
#[derive(Default)]
pub struct OopMapCache {
    methods: Mutex<HashMap<u32, Arc<MethodOopMaps>>>,
    stats: Mutex<OopMapCacheStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OopMapCacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl OopMapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(
        &self,
        mem: &dyn Memory32,
        lookup: &dyn SignatureLookup,
        method: u32,
        bci: u32,
    ) -> VmResult<InterpreterOopMap> {
        if let Some(maps) = self.methods.lock().get(&method).cloned() {
            self.stats.lock().hits += 1;
            return Ok(maps.at(bci));
        }
        self.stats.lock().misses += 1;
        let maps = Arc::new(MethodOopMaps::compute(lookup, &MethodCode::read(mem, MethodView::at(method))?)?);
        let map = maps.at(bci);
        self.methods.lock().insert(method, maps);
        Ok(map)
    }

    /// Drop the maps of `method` after its code changed.
    pub fn flush(&self, method: u32) {
        self.methods.lock().remove(&method);
    }

    pub fn clear(&self) {
        self.methods.lock().clear();
    }

    pub fn stats(&self) -> OopMapCacheStats {
        *self.stats.lock()
    }
}
