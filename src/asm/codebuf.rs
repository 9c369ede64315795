//! Code buffer for building stub and template code.
//!
//! The buffer knows the virtual address its first byte will occupy, so that
//! absolute addresses and rel32 displacements to code outside the buffer can
//! be computed while emitting. Forward references are patched as soon as the
//! label they name is bound.

use crate::error::{VmError, VmResult};

/// Handle to a position in the code buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

impl Label {
    /// Numeric id of the label (for diagnostics).
    pub fn id(self) -> usize {
        self.0
    }
}

/// Size of a reference to patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSize {
    /// 8-bit displacement relative to the end of the reference
    Rel8,
    /// 32-bit displacement relative to the end of the reference
    Rel32,
    /// 32-bit absolute address of the label
    Abs32,
}

/// Kind of a relocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Absolute address of data or code outside this buffer
    External,
    /// Call or jump to a runtime entry point
    RuntimeCall,
    /// Absolute address of a position inside this buffer
    Internal,
}

/// A recorded relocation (offset of the 4 bytes it covers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub offset: usize,
    pub kind: RelocKind,
    pub target: u32,
}

/// A buffer for building machine code.
pub struct CodeBuffer {
    /// Virtual address of the first byte
    base: u32,
    /// The code bytes
    code: Vec<u8>,
    /// Bound offsets, indexed by label id
    labels: Vec<Option<usize>>,
    /// Pending forward references (offset, label, reference_size)
    forward_refs: Vec<(usize, Label, ReferenceSize)>,
    /// Relocation records
    relocations: Vec<Relocation>,
    /// First error raised while patching, reported by `check`
    error: Option<VmError>,
}

impl CodeBuffer {
    /// Create a new empty code buffer starting at `base`.
    pub fn new(base: u32) -> Self {
        Self::with_capacity(base, 0)
    }

    /// Create a new code buffer with pre-allocated capacity.
    pub fn with_capacity(base: u32, capacity: usize) -> Self {
        Self {
            base,
            code: Vec::with_capacity(capacity),
            labels: Vec::new(),
            forward_refs: Vec::new(),
            relocations: Vec::new(),
            error: None,
        }
    }

    /// Virtual address of the first byte.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Get the current size of the code.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Get the current offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Virtual address of the next byte to be emitted.
    pub fn pc(&self) -> u32 {
        self.base.wrapping_add(self.code.len() as u32)
    }

    /// Virtual address of an offset in this buffer.
    pub fn address_of(&self, offset: usize) -> u32 {
        self.base.wrapping_add(offset as u32)
    }

    /// Emit a single byte.
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 16-bit value (little-endian).
    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a signed 32-bit value (little-endian).
    pub fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit multiple bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Emit a 32-bit word and record a relocation for it.
    pub fn emit_reloc_u32(&mut self, value: u32, kind: RelocKind) {
        self.relocations.push(Relocation {
            offset: self.code.len(),
            kind,
            target: value,
        });
        self.emit_u32(value);
    }

    /// Emit a rel32 displacement reaching the absolute address `target`.
    pub fn emit_rel32_to(&mut self, target: u32, kind: RelocKind) {
        let end = self.pc().wrapping_add(4);
        self.relocations.push(Relocation {
            offset: self.code.len(),
            kind,
            target,
        });
        self.emit_u32(target.wrapping_sub(end));
    }

    /// Create a fresh unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label at the current position and patch references to it.
    pub fn bind(&mut self, label: Label) {
        if self.labels[label.0].is_some() {
            self.record_error(VmError::LabelRebound(label.0));
            return;
        }
        let target = self.code.len();
        self.labels[label.0] = Some(target);

        let mut pending = Vec::new();
        self.forward_refs.retain(|&(offset, l, size)| {
            if l == label {
                pending.push((offset, size));
                false
            } else {
                true
            }
        });
        for (offset, size) in pending {
            self.patch(offset, target, size);
        }
    }

    /// Check whether a label is bound.
    pub fn is_bound(&self, label: Label) -> bool {
        self.labels[label.0].is_some()
    }

    /// Offset of a bound label.
    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels[label.0]
    }

    /// Virtual address of a bound label.
    pub fn label_address(&self, label: Label) -> Option<u32> {
        self.labels[label.0].map(|off| self.address_of(off))
    }

    /// Emit a reference to a label.
    /// Bound labels are resolved immediately; unbound ones on `bind`.
    pub fn emit_label_ref(&mut self, label: Label, size: ReferenceSize) {
        let offset = self.code.len();
        match size {
            ReferenceSize::Rel8 => self.emit_u8(0),
            ReferenceSize::Rel32 | ReferenceSize::Abs32 => self.emit_u32(0),
        }
        if size == ReferenceSize::Abs32 {
            self.relocations.push(Relocation {
                offset,
                kind: RelocKind::Internal,
                target: 0,
            });
        }
        match self.labels[label.0] {
            Some(target) => self.patch(offset, target, size),
            None => self.forward_refs.push((offset, label, size)),
        }
    }

    fn patch(&mut self, offset: usize, target: usize, size: ReferenceSize) {
        match size {
            ReferenceSize::Rel8 => {
                let rel = target as i64 - (offset as i64 + 1);
                if !(-128..=127).contains(&rel) {
                    self.record_error(VmError::BranchOutOfRange { offset });
                    return;
                }
                self.code[offset] = rel as i8 as u8;
            }
            ReferenceSize::Rel32 => {
                let rel = target as i64 - (offset as i64 + 4);
                self.code[offset..offset + 4].copy_from_slice(&(rel as i32).to_le_bytes());
            }
            ReferenceSize::Abs32 => {
                let addr = self.address_of(target);
                self.code[offset..offset + 4].copy_from_slice(&addr.to_le_bytes());
                if let Some(r) = self.relocations.iter_mut().find(|r| r.offset == offset) {
                    r.target = addr;
                }
            }
        }
    }

    fn record_error(&mut self, err: VmError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Verify that every referenced label was bound and no patch failed.
    pub fn check(&mut self) -> VmResult<()> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        if let Some(&(_, label, _)) = self.forward_refs.first() {
            return Err(VmError::UnboundLabel(label.0));
        }
        Ok(())
    }

    /// Overwrite a 32-bit word at `offset`.
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Get the code bytes (for inspection).
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Relocations recorded so far.
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Consume the buffer and return the raw code bytes.
    /// Call `check` first; unresolved references are left as zero.
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }

    /// Align the code to the given boundary with NOPs.
    pub fn align(&mut self, alignment: usize) {
        let current = self.base as usize + self.code.len();
        let aligned = (current + alignment - 1) & !(alignment - 1);
        for _ in current..aligned {
            self.emit_u8(0x90);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_bytes() {
        let mut buf = CodeBuffer::new(0x1000);
        buf.emit_u8(0x90);
        buf.emit_u16(0x1234);
        buf.emit_u32(0xDEADBEEF);

        assert_eq!(buf.len(), 7);
        assert_eq!(buf.pc(), 0x1007);
        assert_eq!(buf.code(), &[0x90, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_forward_ref_patched_on_bind() {
        let mut buf = CodeBuffer::new(0);
        let l = buf.new_label();
        buf.emit_u8(0xE9);
        buf.emit_label_ref(l, ReferenceSize::Rel32);
        buf.emit_u8(0x90);
        buf.bind(l);

        assert_eq!(buf.code(), &[0xE9, 0x01, 0x00, 0x00, 0x00, 0x90]);
        assert!(buf.check().is_ok());
    }

    #[test]
    fn test_backward_rel8() {
        let mut buf = CodeBuffer::new(0);
        let l = buf.new_label();
        buf.bind(l);
        buf.emit_u8(0xEB);
        buf.emit_label_ref(l, ReferenceSize::Rel8);

        assert_eq!(buf.code(), &[0xEB, 0xFE]);
    }

    #[test]
    fn test_unbound_label_reported() {
        let mut buf = CodeBuffer::new(0);
        let l = buf.new_label();
        buf.emit_label_ref(l, ReferenceSize::Rel32);

        assert!(matches!(buf.check(), Err(VmError::UnboundLabel(_))));
    }

    #[test]
    fn test_abs32_uses_base() {
        let mut buf = CodeBuffer::new(0x4000);
        let l = buf.new_label();
        buf.emit_label_ref(l, ReferenceSize::Abs32);
        buf.bind(l);

        assert_eq!(buf.code(), &[0x04, 0x40, 0x00, 0x00]);
        assert_eq!(buf.relocations()[0].kind, RelocKind::Internal);
    }

    #[test]
    fn test_rel32_to_external() {
        let mut buf = CodeBuffer::new(0x1000);
        buf.emit_u8(0xE8);
        buf.emit_rel32_to(0x2000, RelocKind::RuntimeCall);

        // 0x2000 - 0x1005
        assert_eq!(&buf.code()[1..], &0xFFBu32.to_le_bytes());
    }

    #[test]
    fn test_alignment() {
        let mut buf = CodeBuffer::new(0x1001);
        buf.emit_u8(0x90);
        buf.align(4);

        assert_eq!(buf.pc() % 4, 0);
        assert_eq!(buf.len(), 3);
    }
}
