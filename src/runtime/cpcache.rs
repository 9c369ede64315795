//! Constant-pool cache entries and their resolution protocol.
//!
//! An entry is four words `{indices, f1, f2, flags}`. The low 16 bits of
//! `indices` hold the constant-pool index; bits 16-23 and 24-31 hold the
//! bytecodes for which f1 and f2 are resolved. Generated code treats an
//! entry as resolved for bytecode `b` when the matching tag byte equals
//! `b`, so the tag is written last.

use parking_lot::Mutex;

use super::basic_type::TosState;
use super::bytecodes::Bytecode;
use super::layout::cp_cache;
use super::memory32::Memory32;
use crate::error::{VmError, VmResult};

/// Bit positions in the `flags` word.
pub mod flags {
    pub const TOS_STATE_SHIFT: u32 = 28;
    pub const TOS_STATE_MASK: u32 = 0x0F;
    pub const HAS_APPENDIX_SHIFT: u32 = 24;
    pub const IS_FORCED_VIRTUAL_SHIFT: u32 = 23;
    pub const IS_FINAL_SHIFT: u32 = 22;
    pub const IS_VOLATILE_SHIFT: u32 = 21;
    pub const IS_VFINAL_SHIFT: u32 = 20;
    pub const FIELD_INDEX_MASK: u32 = 0xFFFF;
    pub const PARAMETER_SIZE_MASK: u32 = 0xFF;
}

/// Shift of the resolved-bytecode tag for f1 (`byte_no` 1) or f2 (2).
pub fn bytecode_shift(byte_no: u32) -> u32 {
    16 + 8 * (byte_no - 1)
}

/// Which tag a bytecode resolves (1 for f1, 2 for f2).
pub fn byte_no_for(bytecode: Bytecode) -> u32 {
    match bytecode {
        Bytecode::Putfield | Bytecode::Putstatic | Bytecode::Invokevirtual => 2,
        _ => 1,
    }
}

/// Host view of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpCacheEntry {
    addr: u32,
}

impl CpCacheEntry {
    /// Entry `index` of the cache at `cache`.
    pub fn at(cache: u32, index: u32) -> Self {
        Self {
            addr: cache
                .wrapping_add(cp_cache::BASE_OFFSET as u32)
                .wrapping_add(index * cp_cache::ENTRY_SIZE as u32),
        }
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    fn word(&self, mem: &dyn Memory32, offset: i32) -> VmResult<u32> {
        mem.read_u32(self.addr + offset as u32)
    }

    pub fn indices(&self, mem: &dyn Memory32) -> VmResult<u32> {
        self.word(mem, cp_cache::INDICES_OFFSET)
    }

    pub fn f1(&self, mem: &dyn Memory32) -> VmResult<u32> {
        self.word(mem, cp_cache::F1_OFFSET)
    }

    pub fn f2(&self, mem: &dyn Memory32) -> VmResult<u32> {
        self.word(mem, cp_cache::F2_OFFSET)
    }

    pub fn flags(&self, mem: &dyn Memory32) -> VmResult<u32> {
        self.word(mem, cp_cache::FLAGS_OFFSET)
    }

    pub fn constant_pool_index(&self, mem: &dyn Memory32) -> VmResult<u16> {
        Ok(self.indices(mem)? as u16)
    }

    /// Bytecode recorded in tag `byte_no`, if any.
    pub fn bytecode(&self, mem: &dyn Memory32, byte_no: u32) -> VmResult<Option<Bytecode>> {
        let tag = (self.indices(mem)? >> bytecode_shift(byte_no)) & 0xFF;
        Ok(if tag == 0 {
            None
        } else {
            Bytecode::from_u8(tag as u8)
        })
    }

    pub fn is_resolved(&self, mem: &dyn Memory32, bytecode: Bytecode) -> VmResult<bool> {
        Ok(self.bytecode(mem, byte_no_for(bytecode))? == Some(bytecode))
    }

    pub fn tos_state(&self, mem: &dyn Memory32) -> VmResult<TosState> {
        let bits = (self.flags(mem)? >> flags::TOS_STATE_SHIFT) & flags::TOS_STATE_MASK;
        TosState::from_index(bits).ok_or_else(|| VmError::Config(format!("bad tos bits {bits}")))
    }

    pub fn is_volatile(&self, mem: &dyn Memory32) -> VmResult<bool> {
        Ok(self.flags(mem)? & (1 << flags::IS_VOLATILE_SHIFT) != 0)
    }

    pub fn parameter_size(&self, mem: &dyn Memory32) -> VmResult<u32> {
        Ok(self.flags(mem)? & flags::PARAMETER_SIZE_MASK)
    }
}

/// A resolved field reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Holder klass (f1), consulted by static accesses
    pub holder: u32,
    /// Byte offset of the field (f2)
    pub offset: u32,
    pub tos: TosState,
    pub field_index: u16,
    pub is_final: bool,
    pub is_volatile: bool,
}

/// How a call site dispatches once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// f1 = method (invokestatic, invokespecial)
    Direct,
    /// f2 = vtable index, or f2 = method when vfinal
    Virtual { vtable_index: u32 },
    /// f2 = method, final target of invokevirtual
    VirtualFinal,
    /// f1 = interface klass, f2 = itable index
    Interface { klass: u32, itable_index: u32 },
    /// f1 = adapter method, f2 = index of the appendix in resolved references
    Handle { appendix_index: u32 },
}

/// A resolved call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallInfo {
    pub method: u32,
    pub kind: CallKind,
    pub result: TosState,
    pub parameter_size: u32,
}

/// Serializes resolution; readers never take the lock.
#[derive(Default)]
pub struct CpCacheResolver {
    lock: Mutex<()>,
}

impl CpCacheResolver {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    fn publish(
        &self,
        mem: &mut dyn Memory32,
        entry: CpCacheEntry,
        byte_no: u32,
        bytecode: Bytecode,
        f1: Option<u32>,
        f2: Option<u32>,
        flag_word: u32,
    ) -> VmResult<bool> {
        let _guard = self.lock.lock();
        if entry.bytecode(mem, byte_no)? == Some(bytecode) {
            return Ok(false);
        }
        if let Some(f1) = f1 {
            mem.write_u32(entry.addr + cp_cache::F1_OFFSET as u32, f1)?;
        }
        if let Some(f2) = f2 {
            mem.write_u32(entry.addr + cp_cache::F2_OFFSET as u32, f2)?;
        }
        mem.write_u32(entry.addr + cp_cache::FLAGS_OFFSET as u32, flag_word)?;
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        let indices = entry.indices(mem)? | ((bytecode.code() as u32) << bytecode_shift(byte_no));
        mem.write_u32(entry.addr + cp_cache::INDICES_OFFSET as u32, indices)?;
        log::trace!("cpcache {:#010x}: resolved for {}", entry.addr, bytecode);
        Ok(true)
    }

    /// Resolve a field entry for `bytecode`.
    ///
    /// Returns `false` when another resolver already published the entry.
    pub fn set_field(
        &self,
        mem: &mut dyn Memory32,
        entry: CpCacheEntry,
        bytecode: Bytecode,
        field: FieldInfo,
    ) -> VmResult<bool> {
        let flag_word = ((field.tos as u32) << flags::TOS_STATE_SHIFT)
            | ((field.is_final as u32) << flags::IS_FINAL_SHIFT)
            | ((field.is_volatile as u32) << flags::IS_VOLATILE_SHIFT)
            | (field.field_index as u32 & flags::FIELD_INDEX_MASK);
        self.publish(
            mem,
            entry,
            byte_no_for(bytecode),
            bytecode,
            Some(field.holder),
            Some(field.offset),
            flag_word,
        )
    }

    /// Resolve a call site entry for `bytecode`.
    pub fn set_method(
        &self,
        mem: &mut dyn Memory32,
        entry: CpCacheEntry,
        bytecode: Bytecode,
        call: CallInfo,
    ) -> VmResult<bool> {
        let mut flag_word = ((call.result as u32) << flags::TOS_STATE_SHIFT)
            | (call.parameter_size & flags::PARAMETER_SIZE_MASK);
        let (f1, f2) = match call.kind {
            CallKind::Direct => (Some(call.method), None),
            CallKind::Virtual { vtable_index } => (None, Some(vtable_index)),
            CallKind::VirtualFinal => {
                flag_word |= 1 << flags::IS_VFINAL_SHIFT;
                (None, Some(call.method))
            }
            CallKind::Interface { klass, itable_index } => (Some(klass), Some(itable_index)),
            CallKind::Handle { appendix_index } => {
                flag_word |= 1 << flags::HAS_APPENDIX_SHIFT;
                (Some(call.method), Some(appendix_index))
            }
        };
        self.publish(mem, entry, byte_no_for(bytecode), bytecode, f1, f2, flag_word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory32::SimMemory;

    fn setup() -> (SimMemory, CpCacheEntry) {
        let mut mem = SimMemory::new();
        mem.map(0x2000, 0x100).unwrap();
        let entry = CpCacheEntry::at(0x2000, 1);
        mem.write_u32(entry.addr(), 7).unwrap();
        (mem, entry)
    }

    #[test]
    fn test_field_resolution() {
        let (mut mem, entry) = setup();
        let resolver = CpCacheResolver::new();
        assert!(!entry.is_resolved(&mem, Bytecode::Getfield).unwrap());
        let field = FieldInfo {
            holder: 0x4000,
            offset: 12,
            tos: TosState::Ltos,
            field_index: 3,
            is_final: false,
            is_volatile: true,
        };
        assert!(resolver.set_field(&mut mem, entry, Bytecode::Getfield, field).unwrap());
        assert!(entry.is_resolved(&mem, Bytecode::Getfield).unwrap());
        assert!(!entry.is_resolved(&mem, Bytecode::Putfield).unwrap());
        assert_eq!(entry.tos_state(&mem).unwrap(), TosState::Ltos);
        assert!(entry.is_volatile(&mem).unwrap());
        assert_eq!(entry.f2(&mem).unwrap(), 12);
        assert_eq!(entry.constant_pool_index(&mem).unwrap(), 7);
        assert_eq!(entry.addr(), 0x2000 + 8 + 16);
    }

    #[test]
    fn test_first_resolver_wins() {
        let (mut mem, entry) = setup();
        let resolver = CpCacheResolver::new();
        let call = |method| CallInfo {
            method,
            kind: CallKind::Direct,
            result: TosState::Itos,
            parameter_size: 2,
        };
        assert!(resolver
            .set_method(&mut mem, entry, Bytecode::Invokestatic, call(0x5000))
            .unwrap());
        assert!(!resolver
            .set_method(&mut mem, entry, Bytecode::Invokestatic, call(0x6000))
            .unwrap());
        assert_eq!(entry.f1(&mem).unwrap(), 0x5000);
        assert_eq!(entry.parameter_size(&mem).unwrap(), 2);
    }

    #[test]
    fn test_vfinal_uses_f2() {
        let (mut mem, entry) = setup();
        let resolver = CpCacheResolver::new();
        let call = CallInfo {
            method: 0x7000,
            kind: CallKind::VirtualFinal,
            result: TosState::Vtos,
            parameter_size: 1,
        };
        resolver
            .set_method(&mut mem, entry, Bytecode::Invokevirtual, call)
            .unwrap();
        assert_eq!(entry.f2(&mem).unwrap(), 0x7000);
        assert_ne!(entry.flags(&mem).unwrap() & (1 << flags::IS_VFINAL_SHIFT), 0);
        assert_eq!(entry.bytecode(&mem, 2).unwrap(), Some(Bytecode::Invokevirtual));
    }
}
