//! The code cache: one contiguous section holding every generated blob.
//!
//! Blobs are appended at the top and never move. Each blob remembers its
//! name and kind so that frame walking and diagnostics can map a pc back
//! to the stub or interpreter codelet that contains it.

use serde::Serialize;

use crate::asm::{CodeBuffer, NativeRegion, Relocation};
use crate::error::{VmError, VmResult};
use crate::runtime::memory32::Memory32;

/// Alignment of every blob start.
pub const CODE_ENTRY_ALIGNMENT: u32 = 16;

/// What produced a blob; decides how a frame with a pc inside it is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlobKind {
    /// Leaf or frameless stub
    Stub,
    /// Stub that builds an `ebp` frame of the given size in words
    RuntimeStub { frame_words: u32 },
    /// Template interpreter codelet
    Interpreter,
    /// Code registered by a compiler; `frame_words` excludes the return address
    Compiled { frame_words: u32 },
}

#[derive(Debug, Clone)]
pub struct CodeBlob {
    pub name: String,
    pub kind: BlobKind,
    pub begin: u32,
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
}

impl CodeBlob {
    pub fn end(&self) -> u32 {
        self.begin + self.code.len() as u32
    }

    pub fn contains(&self, pc: u32) -> bool {
        (self.begin..self.end()).contains(&pc)
    }

    pub fn is_interpreter(&self) -> bool {
        self.kind == BlobKind::Interpreter
    }
}

#[derive(Debug)]
pub struct CodeCache {
    base: u32,
    size: u32,
    top: u32,
    blobs: Vec<CodeBlob>,
}

impl CodeCache {
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            size,
            top: base,
            blobs: Vec::new(),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn end(&self) -> u32 {
        self.base + self.size
    }

    pub fn used(&self) -> u32 {
        self.top - self.base
    }

    fn aligned_top(&self) -> u32 {
        (self.top + CODE_ENTRY_ALIGNMENT - 1) & !(CODE_ENTRY_ALIGNMENT - 1)
    }

    /// A fresh buffer positioned at the next blob start.
    pub fn begin(&self) -> CodeBuffer {
        CodeBuffer::with_capacity(self.aligned_top(), 256)
    }

    /// Append a finished buffer created by `begin`; returns its address.
    pub fn commit(&mut self, name: &str, kind: BlobKind, mut buf: CodeBuffer) -> VmResult<u32> {
        buf.check()?;
        let begin = self.aligned_top();
        if buf.base() != begin {
            return Err(VmError::Config(format!(
                "blob {name} was assembled for {:#010x}, cache top is {begin:#010x}",
                buf.base()
            )));
        }
        let available = self.end().saturating_sub(begin) as usize;
        if buf.len() > available {
            return Err(VmError::CodeCacheFull {
                section: "code",
                requested: buf.len(),
                available,
            });
        }
        let relocations = buf.relocations().to_vec();
        let code = buf.into_code();
        self.top = begin + code.len() as u32;
        log::debug!("{name}: {begin:#010x}..{:#010x}", self.top);
        self.blobs.push(CodeBlob {
            name: name.to_string(),
            kind,
            begin,
            code,
            relocations,
        });
        Ok(begin)
    }

    pub fn blobs(&self) -> &[CodeBlob] {
        &self.blobs
    }

    /// The blob containing `pc`.
    pub fn find_blob(&self, pc: u32) -> Option<&CodeBlob> {
        let idx = self.blobs.partition_point(|b| b.begin <= pc);
        idx.checked_sub(1)
            .map(|i| &self.blobs[i])
            .filter(|b| b.contains(pc))
    }

    pub fn contains(&self, pc: u32) -> bool {
        (self.base..self.top).contains(&pc)
    }

    /// Copy every blob into a simulated address space.
    pub fn install(&self, mem: &mut dyn Memory32) -> VmResult<()> {
        for blob in &self.blobs {
            mem.write_bytes(blob.begin, &blob.code)?;
        }
        Ok(())
    }

    /// Copy every blob into a host mapping placed at the code section's base.
    pub fn install_native(&self, region: &mut NativeRegion) -> VmResult<()> {
        if region.base()? != self.base {
            return Err(VmError::Config(format!(
                "code section expected at {:#010x}, mapped at {:#010x}",
                self.base,
                region.base()?
            )));
        }
        for blob in &self.blobs {
            region.write_at(blob.begin, &blob.code)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory32::SimMemory;

    fn blob(cache: &mut CodeCache, name: &str, bytes: &[u8]) -> u32 {
        let mut buf = cache.begin();
        buf.emit_bytes(bytes);
        cache.commit(name, BlobKind::Stub, buf).unwrap()
    }

    #[test]
    fn test_blobs_are_aligned_and_found() {
        let mut cache = CodeCache::new(0x0800_0000, 0x1000);
        let a = blob(&mut cache, "a", &[0x90; 5]);
        let b = blob(&mut cache, "b", &[0xC3]);
        assert_eq!(a, 0x0800_0000);
        assert_eq!(b, 0x0800_0010);
        assert_eq!(cache.find_blob(a + 4).unwrap().name, "a");
        assert!(cache.find_blob(a + 5).is_none());
        assert_eq!(cache.find_blob(b).unwrap().name, "b");
        assert!(cache.find_blob(0x0700_0000).is_none());
    }

    #[test]
    fn test_commit_rejects_overflow_and_stale_buffers() {
        let mut cache = CodeCache::new(0x0800_0000, 0x20);
        let stale = cache.begin();
        blob(&mut cache, "a", &[0x90; 8]);
        assert!(cache.commit("stale", BlobKind::Stub, stale).is_err());
        let mut big = cache.begin();
        big.emit_bytes(&[0x90; 0x40]);
        assert!(matches!(
            cache.commit("big", BlobKind::Stub, big),
            Err(VmError::CodeCacheFull { .. })
        ));
    }

    #[test]
    fn test_install_copies_code() {
        let mut cache = CodeCache::new(0x0800_0000, 0x1000);
        let a = blob(&mut cache, "a", &[0xC3]);
        let mut mem = SimMemory::new();
        mem.map(0x0800_0000, 0x1000).unwrap();
        cache.install(&mut mem).unwrap();
        assert_eq!(mem.read_u8(a).unwrap(), 0xC3);
    }
}
