//! A 32-bit address space.
//!
//! Host-side code (method layout, frame walking, deoptimization, profiling
//! inspection) reads and writes interpreter state through `Memory32`.
//! `SimMemory` models a sparse address space for hosts that cannot run the
//! generated code; `NativeMemory` is the process's own memory on x86-32.

use crate::error::{VmError, VmResult};

/// Little-endian 32-bit address space.
pub trait Memory32 {
    fn read_u8(&self, addr: u32) -> VmResult<u8>;
    fn write_u8(&mut self, addr: u32, value: u8) -> VmResult<()>;

    fn read_bytes(&self, addr: u32, len: usize) -> VmResult<Vec<u8>> {
        (0..len as u32)
            .map(|i| self.read_u8(addr.wrapping_add(i)))
            .collect()
    }

    fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> VmResult<()> {
        for (i, b) in bytes.iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), *b)?;
        }
        Ok(())
    }

    fn read_u16(&self, addr: u32) -> VmResult<u16> {
        let b = self.read_bytes(addr, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> VmResult<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn read_u32(&self, addr: u32) -> VmResult<u32> {
        let b = self.read_bytes(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> VmResult<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn read_i32(&self, addr: u32) -> VmResult<i32> {
        Ok(self.read_u32(addr)? as i32)
    }

    fn write_i32(&mut self, addr: u32, value: i32) -> VmResult<()> {
        self.write_u32(addr, value as u32)
    }

    fn read_u64(&self, addr: u32) -> VmResult<u64> {
        let lo = self.read_u32(addr)? as u64;
        let hi = self.read_u32(addr.wrapping_add(4))? as u64;
        Ok(lo | (hi << 32))
    }

    fn write_u64(&mut self, addr: u32, value: u64) -> VmResult<()> {
        self.write_u32(addr, value as u32)?;
        self.write_u32(addr.wrapping_add(4), (value >> 32) as u32)
    }
}

/// One mapped range of the simulated address space.
struct Region {
    base: u32,
    data: Vec<u8>,
}

impl Region {
    fn contains(&self, addr: u32) -> bool {
        addr >= self.base && ((addr - self.base) as usize) < self.data.len()
    }
}

/// Sparse simulated memory made of explicitly mapped regions.
#[derive(Default)]
pub struct SimMemory {
    regions: Vec<Region>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `size` zeroed bytes at `base`.
    pub fn map(&mut self, base: u32, size: u32) -> VmResult<()> {
        let end = base as u64 + size as u64;
        let overlaps = self.regions.iter().any(|r| {
            let r_end = r.base as u64 + r.data.len() as u64;
            (base as u64) < r_end && (r.base as u64) < end
        });
        if overlaps || end > u32::MAX as u64 + 1 {
            return Err(VmError::Config(format!(
                "cannot map {size:#x} bytes at {base:#010x}"
            )));
        }
        self.regions.push(Region {
            base,
            data: vec![0; size as usize],
        });
        Ok(())
    }

    pub fn is_mapped(&self, addr: u32) -> bool {
        self.regions.iter().any(|r| r.contains(addr))
    }

    fn region(&self, addr: u32) -> VmResult<&Region> {
        self.regions
            .iter()
            .find(|r| r.contains(addr))
            .ok_or(VmError::Unmapped(addr))
    }

    fn region_mut(&mut self, addr: u32) -> VmResult<&mut Region> {
        self.regions
            .iter_mut()
            .find(|r| r.contains(addr))
            .ok_or(VmError::Unmapped(addr))
    }
}

impl Memory32 for SimMemory {
    fn read_u8(&self, addr: u32) -> VmResult<u8> {
        let r = self.region(addr)?;
        Ok(r.data[(addr - r.base) as usize])
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> VmResult<()> {
        let r = self.region_mut(addr)?;
        let off = (addr - r.base) as usize;
        r.data[off] = value;
        Ok(())
    }

    fn read_bytes(&self, addr: u32, len: usize) -> VmResult<Vec<u8>> {
        let r = self.region(addr)?;
        let off = (addr - r.base) as usize;
        match r.data.get(off..off + len) {
            Some(slice) => Ok(slice.to_vec()),
            None => Err(VmError::Unmapped(r.base.wrapping_add(r.data.len() as u32))),
        }
    }

    fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> VmResult<()> {
        let r = self.region_mut(addr)?;
        let off = (addr - r.base) as usize;
        let end_addr = r.base.wrapping_add(r.data.len() as u32);
        match r.data.get_mut(off..off + bytes.len()) {
            Some(slice) => {
                slice.copy_from_slice(bytes);
                Ok(())
            }
            None => Err(VmError::Unmapped(end_addr)),
        }
    }
}

/// The process's own address space (x86-32 hosts only).
#[cfg(target_arch = "x86")]
pub struct NativeMemory {
    _private: (),
}

#[cfg(target_arch = "x86")]
impl NativeMemory {
    /// # Safety
    /// Every address later passed to this memory must be mapped and valid
    /// for the access performed.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(target_arch = "x86")]
impl Memory32 for NativeMemory {
    fn read_u8(&self, addr: u32) -> VmResult<u8> {
        if addr == 0 {
            return Err(VmError::Unmapped(addr));
        }
        Ok(unsafe { std::ptr::read_volatile(addr as usize as *const u8) })
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> VmResult<()> {
        if addr == 0 {
            return Err(VmError::Unmapped(addr));
        }
        unsafe { std::ptr::write_volatile(addr as usize as *mut u8, value) };
        Ok(())
    }
}

/// Bump allocator over a mapped range.
#[derive(Debug, Clone)]
pub struct Arena {
    next: u32,
    limit: u32,
}

impl Arena {
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            next: base,
            limit: base.saturating_add(size),
        }
    }

    /// Allocate `size` bytes aligned to `align` (a power of two).
    pub fn allocate(&mut self, size: u32, align: u32) -> VmResult<u32> {
        let start = (self.next + align - 1) & !(align - 1);
        let end = start.checked_add(size).filter(|&e| e <= self.limit).ok_or(
            VmError::CodeCacheFull {
                section: "metaspace",
                requested: size as usize,
                available: self.limit.saturating_sub(start) as usize,
            },
        )?;
        self.next = end;
        Ok(start)
    }

    pub fn top(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_memory_read_write() {
        let mut mem = SimMemory::new();
        mem.map(0x1000, 0x100).unwrap();
        mem.write_u32(0x1010, 0xDEAD_BEEF).unwrap();
        assert_eq!(mem.read_u32(0x1010).unwrap(), 0xDEAD_BEEF);
        assert_eq!(mem.read_u8(0x1010).unwrap(), 0xEF);
        mem.write_u64(0x1020, 0x0123_4567_89AB_CDEF).unwrap();
        assert_eq!(mem.read_u32(0x1024).unwrap(), 0x0123_4567);
    }

    #[test]
    fn test_unmapped_access() {
        let mut mem = SimMemory::new();
        mem.map(0x1000, 0x10).unwrap();
        assert!(matches!(mem.read_u8(0x2000), Err(VmError::Unmapped(0x2000))));
        assert!(mem.write_u32(0x100E, 0).is_err());
        assert!(mem.map(0x1008, 0x10).is_err());
    }

    #[test]
    fn test_arena_alignment_and_limit() {
        let mut arena = Arena::new(0x1001, 0x20);
        assert_eq!(arena.allocate(4, 8).unwrap(), 0x1008);
        assert_eq!(arena.top(), 0x100C);
        assert!(arena.allocate(0x100, 4).is_err());
    }
}
