//! Method layout and linking.
//!
//! `MethodBuilder` lays a method out in the metaspace the way the class
//! linker would: `Method`, `ConstMethod` with the bytecodes and exception
//! table, the constant pool with its tags, the constant-pool cache, the
//! resolved-references array, method counters and optional method data.
//!
//! Linking rewrites member references to native-order cp-cache indices,
//! reference `ldc`s to `fast_aldc(_w)`, `invokevirtual` of signature
//! polymorphic methods to `invokehandle`, and `return` of a finalizable
//! class's constructor to `return_register_finalizer`. The linked code is
//! mirrored into the resolved-opcode sideband at a fixed distance from the
//! bytecodes; the interpreter fetches opcodes from the sideband and records
//! its own rewrites there.

use std::collections::HashMap;

use super::basic_type::BasicType;
use super::bytecodes::{self, Bytecode, BytecodeStream};
use super::layout::{self, const_method, constant_pool, counters, cp_cache, method};
use super::memory32::{Arena, Memory32, SimMemory};
use super::method_data::MethodData;
use crate::error::{VmError, VmResult};

/// Math intrinsics with dedicated interpreter entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[repr(u8)]
pub enum MathIntrinsic {
    Sin = 1,
    Cos = 2,
    Tan = 3,
    Abs = 4,
    Sqrt = 5,
    Log = 6,
    Log10 = 7,
    Pow = 8,
    Exp = 9,
}

impl MathIntrinsic {
    pub const ALL: [MathIntrinsic; 9] = [
        MathIntrinsic::Sin,
        MathIntrinsic::Cos,
        MathIntrinsic::Tan,
        MathIntrinsic::Abs,
        MathIntrinsic::Sqrt,
        MathIntrinsic::Log,
        MathIntrinsic::Log10,
        MathIntrinsic::Pow,
        MathIntrinsic::Exp,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| *m as u8 == v)
    }

    pub fn name(self) -> &'static str {
        match self {
            MathIntrinsic::Sin => "sin",
            MathIntrinsic::Cos => "cos",
            MathIntrinsic::Tan => "tan",
            MathIntrinsic::Abs => "abs",
            MathIntrinsic::Sqrt => "sqrt",
            MathIntrinsic::Log => "log",
            MathIntrinsic::Log10 => "log10",
            MathIntrinsic::Pow => "pow",
            MathIntrinsic::Exp => "exp",
        }
    }
}

/// A constant-pool entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Slot 0 and the second half of longs and doubles
    Empty,
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    /// A class; `klass` is 0 while unresolved
    Class { klass: u32 },
    String(String),
    Fieldref { descriptor: String },
    Methodref { descriptor: String, polymorphic: bool },
    InterfaceMethodref { descriptor: String },
    InvokeDynamic { descriptor: String },
}

impl Constant {
    fn tag(&self) -> u8 {
        match self {
            Constant::Empty => 0,
            Constant::Integer(_) => constant_pool::TAG_INTEGER,
            Constant::Float(_) => constant_pool::TAG_FLOAT,
            Constant::Long(_) => constant_pool::TAG_LONG,
            Constant::Double(_) => constant_pool::TAG_DOUBLE,
            Constant::Class { klass: 0 } => constant_pool::TAG_UNRESOLVED_CLASS,
            Constant::Class { .. } => constant_pool::TAG_CLASS,
            Constant::String(_) => constant_pool::TAG_STRING,
            Constant::Fieldref { .. } => constant_pool::TAG_FIELDREF,
            Constant::Methodref { .. } => constant_pool::TAG_METHODREF,
            Constant::InterfaceMethodref { .. } => constant_pool::TAG_INTERFACE_METHODREF,
            Constant::InvokeDynamic { .. } => constant_pool::TAG_INVOKE_DYNAMIC,
        }
    }
}

/// One exception handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Constant-pool index of the caught class, 0 for any
    pub catch_type: u16,
}

/// Everything the linker knows about a method before layout.
#[derive(Debug, Clone, Default)]
pub struct MethodDef {
    pub name: String,
    pub descriptor: String,
    pub access: u32,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    /// Constant pool; index 0 is unused
    pub constants: Vec<Constant>,
    pub exception_table: Vec<ExceptionEntry>,
    pub holder: u32,
    pub holder_has_finalizer: bool,
    pub intrinsic: Option<MathIntrinsic>,
}

impl MethodDef {
    /// A method with an empty pool and `max_locals` covering its parameters.
    pub fn new(name: &str, descriptor: &str, access: u32, code: Vec<u8>) -> VmResult<Self> {
        let sig = Signature::parse(descriptor)?;
        let params = sig.parameter_words() + usize::from(access & layout::access::STATIC == 0);
        Ok(Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access,
            max_stack: 8,
            max_locals: params as u16,
            code,
            constants: vec![Constant::Empty],
            ..Default::default()
        })
    }

    pub fn is_static(&self) -> bool {
        self.access & layout::access::STATIC != 0
    }
}

/// A parsed method or field descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub parameters: Vec<BasicType>,
    pub result: BasicType,
}

impl Signature {
    /// Parse `(params)result` or a bare field descriptor.
    pub fn parse(descriptor: &str) -> VmResult<Self> {
        let bytes = descriptor.as_bytes();
        let bad = || VmError::Config(format!("malformed descriptor {descriptor:?}"));
        let mut i = 0;
        let mut parameters = Vec::new();
        let has_params = bytes.first() == Some(&b'(');
        if has_params {
            i = 1;
            while bytes.get(i) != Some(&b')') {
                let (ty, next) = Self::one(bytes, i).ok_or_else(bad)?;
                parameters.push(ty);
                i = next;
            }
            i += 1;
        }
        let (result, next) = Self::one(bytes, i).ok_or_else(bad)?;
        if next != bytes.len() {
            return Err(bad());
        }
        Ok(Self { parameters, result })
    }

    fn one(bytes: &[u8], mut i: usize) -> Option<(BasicType, usize)> {
        let ty = BasicType::from_signature_char(*bytes.get(i)?)?;
        match ty {
            BasicType::Object => {
                let end = bytes[i..].iter().position(|&b| b == b';')?;
                Some((ty, i + end + 1))
            }
            BasicType::Array => {
                while bytes.get(i) == Some(&b'[') {
                    i += 1;
                }
                let (_, next) = Self::one(bytes, i)?;
                Some((BasicType::Array, next))
            }
            _ => Some((ty, i + 1)),
        }
    }

    /// Argument words, not counting a receiver.
    pub fn parameter_words(&self) -> usize {
        self.parameters.iter().map(|t| t.size_in_words()).sum()
    }
}

/// What the instruction at a bci refers to in the constant pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberRef {
    Field { ty: BasicType, is_static: bool },
    Invoke { parameters: Vec<BasicType>, result: BasicType, has_receiver: bool },
    Constant(BasicType),
    Class,
}

/// Signature information needed by oop-map computation and frame walking.
pub trait SignatureLookup {
    /// Locals occupied by the arguments of `method`, receiver first.
    fn arguments(&self, method: u32) -> VmResult<Vec<BasicType>>;

    /// The member referenced by the instruction at `bci` of `method`.
    fn member_at(&self, method: u32, bci: u32) -> VmResult<MemberRef>;
}

/// Addresses of a laid-out method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltMethod {
    pub method: u32,
    pub const_method: u32,
    /// First bytecode
    pub code: u32,
    pub code_size: u32,
    /// Resolved-opcode sideband, `code + resolved_opcode_delta`
    pub sideband: u32,
    pub constants: u32,
    pub cache: u32,
    pub cache_length: u32,
    pub resolved_references: u32,
    pub counters: u32,
    pub method_data: Option<u32>,
    pub max_locals: u16,
    pub max_stack: u16,
    pub size_of_parameters: u16,
}

struct LinkedMethod {
    def: MethodDef,
    members: HashMap<u32, MemberRef>,
}

/// Methods laid out so far, by `Method*`.
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<u32, LinkedMethod>,
}

impl MethodRegistry {
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn def(&self, method: u32) -> Option<&MethodDef> {
        self.methods.get(&method).map(|m| &m.def)
    }
}

impl SignatureLookup for MethodRegistry {
    fn arguments(&self, method: u32) -> VmResult<Vec<BasicType>> {
        let def = self
            .def(method)
            .ok_or_else(|| VmError::Frame(format!("unknown method {method:#x}")))?;
        let sig = Signature::parse(&def.descriptor)?;
        let mut args = Vec::new();
        if !def.is_static() {
            args.push(BasicType::Object);
        }
        args.extend(sig.parameters);
        Ok(args)
    }

    fn member_at(&self, method: u32, bci: u32) -> VmResult<MemberRef> {
        self.methods
            .get(&method)
            .and_then(|m| m.members.get(&bci))
            .cloned()
            .ok_or_else(|| VmError::Frame(format!("no member reference at {method:#x}@{bci}")))
    }
}

/// Metaspace region plus its resolved-opcode mirror.
pub struct Metaspace {
    arena: Arena,
    base: u32,
    size: u32,
    delta: u32,
}

impl Metaspace {
    pub fn new(base: u32, size: u32, delta: u32) -> VmResult<Self> {
        if delta < size {
            return Err(VmError::Config(format!(
                "resolved opcode delta {delta:#x} overlaps a metaspace of {size:#x} bytes"
            )));
        }
        Ok(Self {
            arena: Arena::new(base, size),
            base,
            size,
            delta,
        })
    }

    /// Map the region and its mirror in simulated memory.
    pub fn map(&self, mem: &mut SimMemory) -> VmResult<()> {
        mem.map(self.base, self.size)?;
        mem.map(self.base + self.delta, self.size)
    }

    pub fn arena(&mut self) -> &mut Arena {
        &mut self.arena
    }

    pub fn delta(&self) -> u32 {
        self.delta
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

/// Lays out and links methods.
pub struct MethodBuilder {
    space: Metaspace,
    profile: bool,
    registry: MethodRegistry,
}

impl MethodBuilder {
    pub fn new(space: Metaspace, profile: bool) -> Self {
        Self {
            space,
            profile,
            registry: MethodRegistry::default(),
        }
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    pub fn metaspace(&mut self) -> &mut Metaspace {
        &mut self.space
    }

    /// Lay out, link and register `def`.
    pub fn build(&mut self, mem: &mut dyn Memory32, def: MethodDef) -> VmResult<BuiltMethod> {
        let linked = link(&def)?;
        let arena = &mut self.space.arena;
        let zeroed = |mem: &mut dyn Memory32, arena: &mut Arena, size: u32, align: u32| {
            let addr = arena.allocate(size, align)?;
            mem.write_bytes(addr, &vec![0; size as usize])?;
            Ok::<u32, VmError>(addr)
        };

        // Constant pool and tags
        let cp_len = def.constants.len() as u32;
        let constants = zeroed(mem, arena, constant_pool::BASE_OFFSET as u32 + 4 * cp_len, 8)?;
        let tags = zeroed(mem, arena, cp_len.max(1), 4)?;
        for (i, c) in def.constants.iter().enumerate() {
            let slot = constants + constant_pool::BASE_OFFSET as u32 + 4 * i as u32;
            mem.write_u8(tags + i as u32, c.tag())?;
            match *c {
                Constant::Integer(v) => mem.write_i32(slot, v)?,
                Constant::Float(v) => mem.write_u32(slot, v.to_bits())?,
                Constant::Long(v) => mem.write_u64(slot, v as u64)?,
                Constant::Double(v) => mem.write_u64(slot, v.to_bits())?,
                Constant::Class { klass } => mem.write_u32(slot, klass)?,
                _ => {}
            }
        }

        // Cache and resolved references
        let cache_length = linked.cache_cp_indices.len() as u32;
        let cache = zeroed(
            mem,
            arena,
            cp_cache::BASE_OFFSET as u32 + cp_cache::ENTRY_SIZE as u32 * cache_length,
            8,
        )?;
        mem.write_u32(cache + cp_cache::LENGTH_OFFSET as u32, cache_length)?;
        mem.write_u32(cache + cp_cache::CONSTANT_POOL_OFFSET as u32, constants)?;
        for (i, &cp_index) in linked.cache_cp_indices.iter().enumerate() {
            let entry = cache + cp_cache::BASE_OFFSET as u32 + cp_cache::ENTRY_SIZE as u32 * i as u32;
            mem.write_u32(entry + cp_cache::INDICES_OFFSET as u32, cp_index as u32)?;
        }
        let refs_len = linked.resolved_references;
        let resolved_references = zeroed(mem, arena, layout::array::HEADER_SIZE as u32 + 4 * refs_len, 8)?;
        mem.write_u32(resolved_references + layout::oop::MARK_OFFSET as u32, layout::mark::PROTOTYPE)?;
        mem.write_u32(resolved_references + layout::array::LENGTH_OFFSET as u32, refs_len)?;

        mem.write_u32(constants + constant_pool::TAGS_OFFSET as u32, tags)?;
        mem.write_u32(constants + constant_pool::CACHE_OFFSET as u32, cache)?;
        mem.write_u32(constants + constant_pool::POOL_HOLDER_OFFSET as u32, def.holder)?;
        mem.write_u32(
            constants + constant_pool::RESOLVED_REFERENCES_OFFSET as u32,
            resolved_references,
        )?;
        mem.write_u32(constants + constant_pool::LENGTH_OFFSET as u32, cp_len)?;

        // ConstMethod: header, code, exception table
        let code_size = linked.code.len() as u32;
        let table_offset = (const_method::CODES_OFFSET as u32 + code_size + 3) & !3;
        let const_size = table_offset + const_method::EXCEPTION_ENTRY_SIZE * def.exception_table.len() as u32;
        let cm = zeroed(mem, arena, const_size, 8)?;
        let sig = Signature::parse(&def.descriptor)?;
        let size_of_parameters = (sig.parameter_words() + usize::from(!def.is_static())) as u16;
        if def.max_locals < size_of_parameters {
            return Err(VmError::Config(format!(
                "{}: max_locals {} below parameter size {size_of_parameters}",
                def.name, def.max_locals
            )));
        }
        mem.write_u32(cm + const_method::CONSTANTS_OFFSET as u32, constants)?;
        mem.write_u16(cm + const_method::CODE_SIZE_OFFSET as u32, code_size as u16)?;
        mem.write_u16(cm + const_method::MAX_STACK_OFFSET as u32, def.max_stack)?;
        mem.write_u16(cm + const_method::MAX_LOCALS_OFFSET as u32, def.max_locals)?;
        mem.write_u16(cm + const_method::SIZE_OF_PARAMETERS_OFFSET as u32, size_of_parameters)?;
        mem.write_u8(cm + const_method::RESULT_TYPE_OFFSET as u32, sig.result as u8)?;
        let code = cm + const_method::CODES_OFFSET as u32;
        mem.write_bytes(code, &linked.code)?;
        mem.write_u32(cm + const_method::EXCEPTION_TABLE_OFFSET as u32, cm + table_offset)?;
        mem.write_u32(
            cm + const_method::EXCEPTION_TABLE_LENGTH_OFFSET as u32,
            def.exception_table.len() as u32,
        )?;
        for (i, e) in def.exception_table.iter().enumerate() {
            let at = cm + table_offset + const_method::EXCEPTION_ENTRY_SIZE * i as u32;
            mem.write_u16(at, e.start_pc)?;
            mem.write_u16(at + 2, e.end_pc)?;
            mem.write_u16(at + 4, e.handler_pc)?;
            mem.write_u16(at + 6, e.catch_type)?;
        }

        let sideband = code + self.space.delta;
        mem.write_bytes(sideband, &linked.code)?;

        // Method, counters, profile
        let m = zeroed(mem, arena, method::SIZE, 8)?;
        let counters_addr = zeroed(mem, arena, counters::SIZE, 4)?;
        mem.write_u32(m + method::CONST_METHOD_OFFSET as u32, cm)?;
        mem.write_u32(m + method::ACCESS_FLAGS_OFFSET as u32, def.access)?;
        mem.write_u32(m + method::METHOD_COUNTERS_OFFSET as u32, counters_addr)?;
        mem.write_i32(m + method::VTABLE_INDEX_OFFSET as u32, -1)?;
        mem.write_u32(
            m + method::INTRINSIC_ID_OFFSET as u32,
            def.intrinsic.map_or(0, |i| i as u32),
        )?;
        let method_data = if self.profile {
            let md = MethodData::allocate(mem, arena, m, &linked.code)?;
            mem.write_u32(m + method::METHOD_DATA_OFFSET as u32, md.addr())?;
            Some(md.addr())
        } else {
            None
        };

        log::debug!(
            "method {} at {m:#x}: {code_size} bytecodes, {cache_length} cache entries",
            def.name
        );
        let built = BuiltMethod {
            method: m,
            const_method: cm,
            code,
            code_size,
            sideband,
            constants,
            cache,
            cache_length,
            resolved_references,
            counters: counters_addr,
            method_data,
            max_locals: def.max_locals,
            max_stack: def.max_stack,
            size_of_parameters,
        };
        self.registry.methods.insert(
            m,
            LinkedMethod {
                def,
                members: linked.members,
            },
        );
        Ok(built)
    }
}

struct Linked {
    code: Vec<u8>,
    cache_cp_indices: Vec<u16>,
    resolved_references: u32,
    members: HashMap<u32, MemberRef>,
}

fn constant_at(def: &MethodDef, index: u16, bci: usize) -> VmResult<&Constant> {
    def.constants
        .get(index as usize)
        .ok_or(VmError::InvalidBytecode {
            opcode: def.code[bci],
            bci: bci as u32,
        })
}

fn constant_type(c: &Constant) -> BasicType {
    match c {
        Constant::Integer(_) => BasicType::Int,
        Constant::Float(_) => BasicType::Float,
        Constant::Long(_) => BasicType::Long,
        Constant::Double(_) => BasicType::Double,
        _ => BasicType::Object,
    }
}

/// Rewrite `def.code` for the interpreter.
fn link(def: &MethodDef) -> VmResult<Linked> {
    let mut code = def.code.clone();
    let mut cache_cp_indices: Vec<u16> = Vec::new();
    let mut by_cp: HashMap<u16, u16> = HashMap::new();
    let mut resolved_references = 0u32;
    let mut members = HashMap::new();
    let is_finalizable_init = def.name == "<init>" && def.holder_has_finalizer;

    let instructions: Vec<_> = BytecodeStream::new(&def.code).collect::<VmResult<_>>()?;
    for insn in instructions {
        let bci = insn.bci;
        match insn.bytecode {
            Bytecode::Getfield
            | Bytecode::Putfield
            | Bytecode::Getstatic
            | Bytecode::Putstatic
            | Bytecode::Invokevirtual
            | Bytecode::Invokespecial
            | Bytecode::Invokestatic
            | Bytecode::Invokeinterface => {
                let cp_index = bytecodes::read_u16_be(&def.code, bci + 1)?;
                let member = match constant_at(def, cp_index, bci)? {
                    Constant::Fieldref { descriptor } => MemberRef::Field {
                        ty: Signature::parse(descriptor)?.result,
                        is_static: matches!(insn.bytecode, Bytecode::Getstatic | Bytecode::Putstatic),
                    },
                    Constant::Methodref { descriptor, polymorphic } => {
                        if *polymorphic && insn.bytecode == Bytecode::Invokevirtual {
                            code[bci] = Bytecode::Invokehandle.code();
                            resolved_references += 1;
                        }
                        invoke_member(descriptor, insn.bytecode)?
                    }
                    Constant::InterfaceMethodref { descriptor } => {
                        invoke_member(descriptor, insn.bytecode)?
                    }
                    _ => {
                        return Err(VmError::InvalidBytecode {
                            opcode: insn.bytecode.code(),
                            bci: bci as u32,
                        });
                    }
                };
                let cache_index = *by_cp.entry(cp_index).or_insert_with(|| {
                    cache_cp_indices.push(cp_index);
                    (cache_cp_indices.len() - 1) as u16
                });
                code[bci + 1..bci + 3].copy_from_slice(&cache_index.to_le_bytes());
                members.insert(bci as u32, member);
            }
            Bytecode::Invokedynamic => {
                let cp_index = bytecodes::read_u16_be(&def.code, bci + 1)?;
                let Constant::InvokeDynamic { descriptor } = constant_at(def, cp_index, bci)? else {
                    return Err(VmError::InvalidBytecode {
                        opcode: insn.bytecode.code(),
                        bci: bci as u32,
                    });
                };
                // One entry per call site.
                cache_cp_indices.push(cp_index);
                let cache_index = (cache_cp_indices.len() - 1) as u32;
                resolved_references += 1;
                code[bci + 1..bci + 5].copy_from_slice(&(!cache_index).to_le_bytes());
                members.insert(bci as u32, invoke_member(descriptor, insn.bytecode)?);
            }
            Bytecode::Ldc | Bytecode::LdcW | Bytecode::Ldc2W => {
                let wide = insn.bytecode != Bytecode::Ldc;
                let cp_index = if wide {
                    bytecodes::read_u16_be(&def.code, bci + 1)?
                } else {
                    def.code[bci + 1] as u16
                };
                let c = constant_at(def, cp_index, bci)?;
                if matches!(c, Constant::String(_)) {
                    let ref_index = resolved_references;
                    resolved_references += 1;
                    if wide {
                        code[bci] = Bytecode::FastAldcW.code();
                        code[bci + 1..bci + 3].copy_from_slice(&(ref_index as u16).to_le_bytes());
                    } else {
                        if ref_index > u8::MAX as u32 {
                            return Err(VmError::Config(format!(
                                "{}: too many resolved references for ldc at {bci}",
                                def.name
                            )));
                        }
                        code[bci] = Bytecode::FastAldc.code();
                        code[bci + 1] = ref_index as u8;
                    }
                }
                members.insert(bci as u32, MemberRef::Constant(constant_type(c)));
            }
            Bytecode::New
            | Bytecode::Anewarray
            | Bytecode::Checkcast
            | Bytecode::Instanceof
            | Bytecode::Multianewarray => {
                members.insert(bci as u32, MemberRef::Class);
            }
            Bytecode::Return if is_finalizable_init => {
                code[bci] = Bytecode::ReturnRegisterFinalizer.code();
            }
            _ => {}
        }
    }
    Ok(Linked {
        code,
        cache_cp_indices,
        resolved_references,
        members,
    })
}

fn invoke_member(descriptor: &str, bc: Bytecode) -> VmResult<MemberRef> {
    let sig = Signature::parse(descriptor)?;
    Ok(MemberRef::Invoke {
        parameters: sig.parameters,
        result: sig.result,
        has_receiver: !matches!(bc, Bytecode::Invokestatic | Bytecode::Invokedynamic),
    })
}

/// Read-only view of a laid-out method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodView {
    addr: u32,
}

impl MethodView {
    pub fn at(addr: u32) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn const_method(&self, mem: &dyn Memory32) -> VmResult<u32> {
        mem.read_u32(self.addr + method::CONST_METHOD_OFFSET as u32)
    }

    pub fn access_flags(&self, mem: &dyn Memory32) -> VmResult<u32> {
        mem.read_u32(self.addr + method::ACCESS_FLAGS_OFFSET as u32)
    }

    pub fn is_static(&self, mem: &dyn Memory32) -> VmResult<bool> {
        Ok(self.access_flags(mem)? & layout::access::STATIC != 0)
    }

    pub fn is_synchronized(&self, mem: &dyn Memory32) -> VmResult<bool> {
        Ok(self.access_flags(mem)? & layout::access::SYNCHRONIZED != 0)
    }

    pub fn code_base(&self, mem: &dyn Memory32) -> VmResult<u32> {
        Ok(self.const_method(mem)? + const_method::CODES_OFFSET as u32)
    }

    pub fn code_size(&self, mem: &dyn Memory32) -> VmResult<u32> {
        Ok(mem.read_u16(self.const_method(mem)? + const_method::CODE_SIZE_OFFSET as u32)? as u32)
    }

    pub fn code(&self, mem: &dyn Memory32) -> VmResult<Vec<u8>> {
        mem.read_bytes(self.code_base(mem)?, self.code_size(mem)? as usize)
    }

    fn const_u16(&self, mem: &dyn Memory32, offset: i32) -> VmResult<u16> {
        mem.read_u16(self.const_method(mem)? + offset as u32)
    }

    pub fn max_locals(&self, mem: &dyn Memory32) -> VmResult<u16> {
        self.const_u16(mem, const_method::MAX_LOCALS_OFFSET)
    }

    pub fn max_stack(&self, mem: &dyn Memory32) -> VmResult<u16> {
        self.const_u16(mem, const_method::MAX_STACK_OFFSET)
    }

    pub fn size_of_parameters(&self, mem: &dyn Memory32) -> VmResult<u16> {
        self.const_u16(mem, const_method::SIZE_OF_PARAMETERS_OFFSET)
    }

    pub fn result_type(&self, mem: &dyn Memory32) -> VmResult<BasicType> {
        let raw = mem.read_u8(self.const_method(mem)? + const_method::RESULT_TYPE_OFFSET as u32)?;
        BasicType::from_u8(raw).ok_or_else(|| VmError::Frame(format!("bad result type {raw}")))
    }

    pub fn constants(&self, mem: &dyn Memory32) -> VmResult<u32> {
        mem.read_u32(self.const_method(mem)? + const_method::CONSTANTS_OFFSET as u32)
    }

    pub fn cache(&self, mem: &dyn Memory32) -> VmResult<u32> {
        mem.read_u32(self.constants(mem)? + constant_pool::CACHE_OFFSET as u32)
    }

    pub fn pool_holder(&self, mem: &dyn Memory32) -> VmResult<u32> {
        mem.read_u32(self.constants(mem)? + constant_pool::POOL_HOLDER_OFFSET as u32)
    }

    pub fn method_data(&self, mem: &dyn Memory32) -> VmResult<Option<MethodData>> {
        let md = mem.read_u32(self.addr + method::METHOD_DATA_OFFSET as u32)?;
        Ok((md != 0).then(|| MethodData::at(md)))
    }

    pub fn counters(&self, mem: &dyn Memory32) -> VmResult<u32> {
        mem.read_u32(self.addr + method::METHOD_COUNTERS_OFFSET as u32)
    }

    pub fn intrinsic(&self, mem: &dyn Memory32) -> VmResult<Option<MathIntrinsic>> {
        let id = mem.read_u32(self.addr + method::INTRINSIC_ID_OFFSET as u32)?;
        Ok(MathIntrinsic::from_u8(id as u8))
    }

    pub fn exception_table(&self, mem: &dyn Memory32) -> VmResult<Vec<ExceptionEntry>> {
        let cm = self.const_method(mem)?;
        let table = mem.read_u32(cm + const_method::EXCEPTION_TABLE_OFFSET as u32)?;
        let len = mem.read_u32(cm + const_method::EXCEPTION_TABLE_LENGTH_OFFSET as u32)?;
        (0..len)
            .map(|i| {
                let at = table + const_method::EXCEPTION_ENTRY_SIZE * i;
                Ok(ExceptionEntry {
                    start_pc: mem.read_u16(at)?,
                    end_pc: mem.read_u16(at + 2)?,
                    handler_pc: mem.read_u16(at + 4)?,
                    catch_type: mem.read_u16(at + 6)?,
                })
            })
            .collect()
    }

    /// Whether `bcp` lies inside this method's bytecodes.
    pub fn contains_bcp(&self, mem: &dyn Memory32, bcp: u32) -> VmResult<bool> {
        let base = self.code_base(mem)?;
        Ok(bcp >= base && bcp < base + self.code_size(mem)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::cpcache::CpCacheEntry;

    const DELTA: u32 = 0x0010_0000;

    fn builder(mem: &mut SimMemory, profile: bool) -> MethodBuilder {
        let space = Metaspace::new(0x0100_0000, 0x8000, DELTA).unwrap();
        space.map(mem).unwrap();
        MethodBuilder::new(space, profile)
    }

    #[test]
    fn test_signature_parse() {
        let sig = Signature::parse("(I[JLjava/lang/String;D)V").unwrap();
        assert_eq!(
            sig.parameters,
            vec![BasicType::Int, BasicType::Array, BasicType::Object, BasicType::Double]
        );
        assert_eq!(sig.result, BasicType::Void);
        assert_eq!(sig.parameter_words(), 5);
        assert!(Signature::parse("(I").is_err());
        assert_eq!(Signature::parse("J").unwrap().result, BasicType::Long);
    }

    #[test]
    fn test_field_refs_become_cache_indices() {
        let mut mem = SimMemory::new();
        let mut b = builder(&mut mem, false);
        // aload_0; getfield #2; aload_0; getfield #2; iadd; ireturn
        let code = vec![0x2a, 0xb4, 0x00, 0x02, 0x2a, 0xb4, 0x00, 0x02, 0x60, 0xac];
        let mut def = MethodDef::new("sum", "()I", 0, code).unwrap();
        def.constants = vec![
            Constant::Empty,
            Constant::Class { klass: 0 },
            Constant::Fieldref { descriptor: "I".into() },
        ];
        let m = b.build(&mut mem, def).unwrap();
        let code = mem.read_bytes(m.code, 10).unwrap();
        assert_eq!(&code[1..4], &[0xb4, 0x00, 0x00]);
        assert_eq!(m.cache_length, 1);
        let entry = CpCacheEntry::at(m.cache, 0);
        assert_eq!(entry.constant_pool_index(&mem).unwrap(), 2);
        assert_eq!(mem.read_bytes(m.sideband, 10).unwrap(), code);
        assert_eq!(m.sideband - m.code, DELTA);
        assert_eq!(
            b.registry().member_at(m.method, 5).unwrap(),
            MemberRef::Field {
                ty: BasicType::Int,
                is_static: false
            }
        );
    }

    #[test]
    fn test_string_ldc_becomes_fast_aldc() {
        let mut mem = SimMemory::new();
        let mut b = builder(&mut mem, false);
        // ldc #1; ldc_w #2; areturn
        let code = vec![0x12, 0x01, 0x13, 0x00, 0x02, 0xb0];
        let mut def = MethodDef::new("s", "()Ljava/lang/Object;", layout::access::STATIC, code).unwrap();
        def.constants = vec![
            Constant::Empty,
            Constant::String("a".into()),
            Constant::Integer(7),
        ];
        let m = b.build(&mut mem, def).unwrap();
        let code = mem.read_bytes(m.code, 6).unwrap();
        assert_eq!(code[0], Bytecode::FastAldc.code());
        assert_eq!(code[1], 0);
        assert_eq!(code[2], Bytecode::LdcW.code());
        assert_eq!(mem.read_u32(m.resolved_references + 8).unwrap(), 1);
        assert_eq!(
            mem.read_i32(m.constants + constant_pool::BASE_OFFSET as u32 + 8).unwrap(),
            7
        );
    }

    #[test]
    fn test_finalizer_registration_and_invokedynamic() {
        let mut mem = SimMemory::new();
        let mut b = builder(&mut mem, true);
        // invokedynamic #1 0 0; pop; return
        let code = vec![0xba, 0x00, 0x01, 0x00, 0x00, 0x57, 0xb1];
        let mut def = MethodDef::new("<init>", "()V", 0, code).unwrap();
        def.holder_has_finalizer = true;
        def.constants = vec![
            Constant::Empty,
            Constant::InvokeDynamic { descriptor: "()Ljava/lang/Runnable;".into() },
        ];
        let m = b.build(&mut mem, def).unwrap();
        let code = mem.read_bytes(m.code, 7).unwrap();
        assert_eq!(u32::from_le_bytes([code[1], code[2], code[3], code[4]]), !0);
        assert_eq!(code[6], Bytecode::ReturnRegisterFinalizer.code());
        assert!(m.method_data.is_some());
        let view = MethodView::at(m.method);
        assert_eq!(view.code(&mem).unwrap(), code);
        assert_eq!(view.size_of_parameters(&mem).unwrap(), 1);
        assert_eq!(view.result_type(&mem).unwrap(), BasicType::Void);
    }

    #[test]
    fn test_max_locals_must_cover_parameters() {
        let mut mem = SimMemory::new();
        let mut b = builder(&mut mem, false);
        let mut def = MethodDef::new("f", "(JJ)V", layout::access::STATIC, vec![0xb1]).unwrap();
        def.max_locals = 2;
        assert!(b.build(&mut mem, def).is_err());
    }

    #[test]
    fn test_delta_must_clear_metaspace() {
        assert!(Metaspace::new(0x1000, 0x2000, 0x1000).is_err());
    }
}
