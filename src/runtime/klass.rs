//! Klass metadata in the 32-bit address space.
//!
//! Only the parts generated code reads are laid out: layout helper,
//! subtype-check display and cache, super, mirror, access flags,
//! prototype header and, for arrays, the element klass.

use super::basic_type::BasicType;
use super::layout::{self, klass};
use super::memory32::{Arena, Memory32};
use crate::error::{VmError, VmResult};

/// What kind of klass to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KlassKind {
    /// Instance klass of `instance_size` bytes
    Instance { instance_size: u32, has_finalizer: bool },
    /// Array of a primitive type
    TypeArray(BasicType),
    /// Array of references to `element`
    ObjArray { element: u32 },
}

/// Host-side klass allocation.
pub struct KlassBuilder<'a> {
    mem: &'a mut dyn Memory32,
    arena: &'a mut Arena,
}

impl<'a> KlassBuilder<'a> {
    pub fn new(mem: &'a mut dyn Memory32, arena: &'a mut Arena) -> Self {
        Self { mem, arena }
    }

    /// Allocate a klass with superclass `super_klass` (0 for a root) that
    /// also implements `interfaces`.
    pub fn build(&mut self, kind: KlassKind, super_klass: u32, interfaces: &[u32]) -> VmResult<u32> {
        let addr = self.arena.allocate(klass::VTABLE_START_OFFSET as u32, 8)?;
        self.mem
            .write_bytes(addr, &[0; klass::VTABLE_START_OFFSET as usize])?;
        let w = |off: i32| addr + off as u32;

        let (helper, access) = match &kind {
            KlassKind::Instance {
                instance_size,
                has_finalizer,
            } => {
                let slow = if *has_finalizer { layout::lh::INSTANCE_SLOW_PATH_BIT } else { 0 };
                let access = if *has_finalizer { klass::HAS_FINALIZER } else { 0 };
                (*instance_size as i32 | slow, access)
            }
            KlassKind::TypeArray(ty) => (layout::type_array_layout_helper(*ty), 0),
            KlassKind::ObjArray { .. } => (layout::obj_array_layout_helper(), 0),
        };
        self.mem.write_i32(w(klass::LAYOUT_HELPER_OFFSET), helper)?;
        self.mem.write_u32(w(klass::ACCESS_FLAGS_OFFSET), access)?;
        self.mem.write_u32(w(klass::SUPER_OFFSET), super_klass)?;
        self.mem
            .write_u32(w(klass::PROTOTYPE_HEADER_OFFSET), layout::mark::PROTOTYPE)?;
        self.mem
            .write_u8(w(klass::INIT_STATE_OFFSET), klass::FULLY_INITIALIZED)?;
        if let KlassKind::ObjArray { element } = kind {
            self.mem.write_u32(w(klass::ELEMENT_KLASS_OFFSET), element)?;
        }

        // Primary display: copy the super's and append self.
        let depth = if super_klass == 0 {
            0
        } else {
            let super_depth = Klass::at(super_klass).depth(self.mem)?;
            for i in 0..=super_depth {
                let off = klass::PRIMARY_SUPERS_OFFSET + 4 * i as i32;
                let v = self.mem.read_u32(super_klass + off as u32)?;
                self.mem.write_u32(w(off), v)?;
            }
            super_depth + 1
        };
        let mut secondaries: Vec<u32> = interfaces.to_vec();
        if (depth as i32) < klass::PRIMARY_SUPER_LIMIT {
            let off = klass::PRIMARY_SUPERS_OFFSET + 4 * depth as i32;
            self.mem.write_u32(w(off), addr)?;
            self.mem.write_u32(w(klass::SUPER_CHECK_OFFSET_OFFSET), off as u32)?;
        } else {
            secondaries.push(addr);
            self.mem.write_u32(
                w(klass::SUPER_CHECK_OFFSET_OFFSET),
                klass::SECONDARY_SUPER_CACHE_OFFSET as u32,
            )?;
        }
        if super_klass != 0 {
            secondaries.extend(Klass::at(super_klass).secondary_supers(self.mem)?);
        }
        secondaries.dedup();
        let array = self.arena.allocate(4 + 4 * secondaries.len() as u32, 4)?;
        self.mem.write_u32(array, secondaries.len() as u32)?;
        for (i, s) in secondaries.iter().enumerate() {
            self.mem.write_u32(array + 4 + 4 * i as u32, *s)?;
        }
        self.mem.write_u32(w(klass::SECONDARY_SUPERS_OFFSET), array)?;
        log::trace!("klass {addr:#x}: {kind:?}, depth {depth}");
        Ok(addr)
    }

    /// Allocate an object of `klass` with a clean header.
    pub fn new_instance(&mut self, klass_addr: u32) -> VmResult<u32> {
        let size = Klass::at(klass_addr).layout_helper(self.mem)? & !layout::lh::INSTANCE_SLOW_PATH_BIT;
        if size <= 0 {
            return Err(VmError::Config(format!("{klass_addr:#x} is not an instance klass")));
        }
        let obj = self.arena.allocate(size as u32, 8)?;
        self.mem.write_bytes(obj, &vec![0; size as usize])?;
        self.mem.write_u32(obj + layout::oop::MARK_OFFSET as u32, layout::mark::PROTOTYPE)?;
        self.mem.write_u32(obj + layout::oop::KLASS_OFFSET as u32, klass_addr)?;
        Ok(obj)
    }

    /// Allocate an array of `length` elements of `klass`.
    pub fn new_array(&mut self, klass_addr: u32, length: u32) -> VmResult<u32> {
        let helper = Klass::at(klass_addr).layout_helper(self.mem)?;
        let decoded = layout::decode_array_layout_helper(helper)
            .ok_or_else(|| VmError::Config(format!("{klass_addr:#x} is not an array klass")))?;
        let size = decoded.header_size + (length << decoded.log2_element_size);
        let obj = self.arena.allocate(size, 8)?;
        self.mem.write_bytes(obj, &vec![0; size as usize])?;
        self.mem.write_u32(obj + layout::oop::MARK_OFFSET as u32, layout::mark::PROTOTYPE)?;
        self.mem.write_u32(obj + layout::oop::KLASS_OFFSET as u32, klass_addr)?;
        self.mem.write_u32(obj + layout::array::LENGTH_OFFSET as u32, length)?;
        Ok(obj)
    }
}

/// Read-only view of a klass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Klass {
    addr: u32,
}

impl Klass {
    pub fn at(addr: u32) -> Self {
        Self { addr }
    }

    pub fn of_object(mem: &dyn Memory32, obj: u32) -> VmResult<Self> {
        Ok(Self::at(mem.read_u32(obj + layout::oop::KLASS_OFFSET as u32)?))
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn layout_helper(&self, mem: &dyn Memory32) -> VmResult<i32> {
        mem.read_i32(self.addr + klass::LAYOUT_HELPER_OFFSET as u32)
    }

    pub fn super_check_offset(&self, mem: &dyn Memory32) -> VmResult<u32> {
        mem.read_u32(self.addr + klass::SUPER_CHECK_OFFSET_OFFSET as u32)
    }

    /// Index of this klass in its own primary display.
    fn depth(&self, mem: &dyn Memory32) -> VmResult<u32> {
        let off = self.super_check_offset(mem)? as i32;
        if off == klass::SECONDARY_SUPER_CACHE_OFFSET {
            return Ok(klass::PRIMARY_SUPER_LIMIT as u32 - 1);
        }
        Ok(((off - klass::PRIMARY_SUPERS_OFFSET) / 4) as u32)
    }

    pub fn secondary_supers(&self, mem: &dyn Memory32) -> VmResult<Vec<u32>> {
        let array = mem.read_u32(self.addr + klass::SECONDARY_SUPERS_OFFSET as u32)?;
        if array == 0 {
            return Ok(Vec::new());
        }
        let len = mem.read_u32(array)?;
        (0..len).map(|i| mem.read_u32(array + 4 + 4 * i)).collect()
    }

    /// The fast/slow subtype check generated code performs, including the
    /// secondary-super cache update on a slow-path hit.
    pub fn is_subtype_of(&self, mem: &mut dyn Memory32, sup: Klass) -> VmResult<bool> {
        if self.addr == sup.addr {
            return Ok(true);
        }
        let off = sup.super_check_offset(mem)?;
        if mem.read_u32(self.addr + off)? == sup.addr {
            return Ok(true);
        }
        if off as i32 != klass::SECONDARY_SUPER_CACHE_OFFSET {
            return Ok(false);
        }
        if self.secondary_supers(mem)?.contains(&sup.addr) {
            mem.write_u32(
                self.addr + klass::SECONDARY_SUPER_CACHE_OFFSET as u32,
                sup.addr,
            )?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory32::SimMemory;

    fn setup() -> (SimMemory, Arena) {
        let mut mem = SimMemory::new();
        mem.map(0x20000, 0x4000).unwrap();
        (mem, Arena::new(0x20000, 0x4000))
    }

    fn instance(size: u32) -> KlassKind {
        KlassKind::Instance {
            instance_size: size,
            has_finalizer: false,
        }
    }

    #[test]
    fn test_primary_display() {
        let (mut mem, mut arena) = setup();
        let mut b = KlassBuilder::new(&mut mem, &mut arena);
        let object = b.build(instance(8), 0, &[]).unwrap();
        let a = b.build(instance(16), object, &[]).unwrap();
        let c = b.build(instance(16), a, &[]).unwrap();
        let other = b.build(instance(16), object, &[]).unwrap();
        assert!(Klass::at(c).is_subtype_of(&mut mem, Klass::at(a)).unwrap());
        assert!(Klass::at(c).is_subtype_of(&mut mem, Klass::at(object)).unwrap());
        assert!(!Klass::at(a).is_subtype_of(&mut mem, Klass::at(c)).unwrap());
        assert!(!Klass::at(other).is_subtype_of(&mut mem, Klass::at(a)).unwrap());
        assert_eq!(
            Klass::at(c).super_check_offset(&mem).unwrap(),
            klass::PRIMARY_SUPERS_OFFSET as u32 + 8
        );
    }

    #[test]
    fn test_interfaces_use_secondary_cache() {
        let (mut mem, mut arena) = setup();
        let mut b = KlassBuilder::new(&mut mem, &mut arena);
        let object = b.build(instance(8), 0, &[]).unwrap();
        let deep = (0..klass::PRIMARY_SUPER_LIMIT).try_fold(object, |sup, _| b.build(instance(8), sup, &[]));
        let iface = deep.unwrap();
        let k = b.build(instance(8), object, &[iface]).unwrap();
        assert_eq!(
            Klass::at(iface).super_check_offset(&mem).unwrap(),
            klass::SECONDARY_SUPER_CACHE_OFFSET as u32
        );
        assert!(Klass::at(k).is_subtype_of(&mut mem, Klass::at(iface)).unwrap());
        assert_eq!(
            mem.read_u32(k + klass::SECONDARY_SUPER_CACHE_OFFSET as u32).unwrap(),
            iface
        );
    }

    #[test]
    fn test_new_array_header() {
        let (mut mem, mut arena) = setup();
        let mut b = KlassBuilder::new(&mut mem, &mut arena);
        let ints = b.build(KlassKind::TypeArray(BasicType::Int), 0, &[]).unwrap();
        let arr = b.new_array(ints, 5).unwrap();
        assert_eq!(mem.read_u32(arr + 8).unwrap(), 5);
        assert_eq!(Klass::of_object(&mem, arr).unwrap().addr(), ints);
    }
}
