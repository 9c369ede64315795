//! Host mappings for the code and data sections.
//!
//! Generated code embeds absolute 32-bit addresses, so a section can only be
//! used natively when its mapping lies below 4 GiB. Sections are addressed
//! by those 32-bit addresses, not by offsets.

use std::ptr::NonNull;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("mmap of {0:#x} bytes failed")]
    AllocationFailed(usize),
    #[error("mprotect failed")]
    ProtectionFailed,
    #[error("section is read+execute")]
    NotWritable,
    #[error("empty section")]
    InvalidSize,
    #[error("mapping at {0:#x} is not addressable with 32 bits")]
    Above4G(usize),
    #[error("{len:#x} bytes at {addr:#010x} fall outside the section")]
    OutOfRange { addr: u32, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadExecute,
}

/// A page-rounded anonymous mapping holding one section.
///
/// Code sections start writable and are flipped to read+execute once every
/// blob is installed; data sections stay writable.
pub struct NativeRegion {
    ptr: NonNull<u8>,
    size: usize,
    protection: Protection,
}

impl NativeRegion {
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let page = page_size();
        let size = (size + page - 1) & !(page - 1);
        Ok(Self {
            ptr: map_low(size)?,
            size,
            protection: Protection::ReadWrite,
        })
    }

    /// First byte as a 32-bit address.
    pub fn base(&self) -> Result<u32, MemoryError> {
        let addr = self.ptr.as_ptr() as usize;
        u32::try_from(addr)
            .ok()
            .filter(|b| b.checked_add(self.size as u32 - 1).is_some())
            .ok_or(MemoryError::Above4G(addr))
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Copy `bytes` to the 32-bit address `addr` inside this section.
    pub fn write_at(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        if self.protection != Protection::ReadWrite {
            return Err(MemoryError::NotWritable);
        }
        let range = MemoryError::OutOfRange { addr, len: bytes.len() };
        let offset = (addr as usize)
            .checked_sub(self.ptr.as_ptr() as usize)
            .ok_or_else(|| range.clone())?;
        if offset + bytes.len() > self.size {
            return Err(range);
        }
        // SAFETY: bounds checked above and the mapping is writable
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    /// Flip to read+execute. x86 keeps instruction fetch coherent with
    /// stores, so no cache flush follows.
    #[cfg(unix)]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.protection == Protection::ReadExecute {
            return Ok(());
        }
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        self.protection = Protection::ReadExecute;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        self.protection = Protection::ReadExecute;
        Ok(())
    }
}

impl Drop for NativeRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
        #[cfg(not(unix))]
        if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, page_size()) {
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

// Owned exclusively; mutation needs &mut self.
unsafe impl Send for NativeRegion {}
unsafe impl Sync for NativeRegion {}

pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

#[cfg(unix)]
fn map_low(size: usize) -> Result<NonNull<u8>, MemoryError> {
    // x86-64 Linux can place the mapping in the low 2 GiB on request.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    let extra = libc::MAP_32BIT;
    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    let extra = 0;

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed(size));
    }
    NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed(size))
}

#[cfg(not(unix))]
fn map_low(size: usize) -> Result<NonNull<u8>, MemoryError> {
    let layout =
        std::alloc::Layout::from_size_align(size, page_size()).map_err(|_| MemoryError::InvalidSize)?;
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    NonNull::new(ptr).ok_or(MemoryError::AllocationFailed(size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_are_page_rounded() {
        let region = NativeRegion::new(100).unwrap();
        assert_eq!(region.size() % page_size(), 0);
        assert_eq!(region.protection(), Protection::ReadWrite);
        assert_eq!(NativeRegion::new(0).err(), Some(MemoryError::InvalidSize));
    }

    #[cfg(any(target_arch = "x86", all(target_os = "linux", target_arch = "x86_64")))]
    #[test]
    fn test_writes_by_absolute_address() {
        let mut region = NativeRegion::new(4096).unwrap();
        let base = region.base().unwrap();
        // NOP NOP RET = 90 90 C3
        region.write_at(base + 16, &[0x90, 0x90, 0xC3]).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr().add(16), 3) };
        assert_eq!(bytes, &[0x90, 0x90, 0xC3]);

        let end = base + region.size() as u32;
        assert!(matches!(region.write_at(end - 1, &[0, 0]), Err(MemoryError::OutOfRange { .. })));
        assert!(region.write_at(base.wrapping_sub(1), &[0]).is_err());
    }

    #[test]
    fn test_executable_section_rejects_writes() {
        let mut region = NativeRegion::new(4096).unwrap();
        let addr = region.as_ptr() as usize as u32;
        region.make_executable().unwrap();
        assert_eq!(region.protection(), Protection::ReadExecute);
        assert_eq!(region.write_at(addr, &[0x90]), Err(MemoryError::NotWritable));
    }
}
