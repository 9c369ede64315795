//! Thread descriptor consumed by generated code.

use std::mem::offset_of;

use super::memory32::Memory32;
use crate::error::VmResult;

/// Thread states stored in `thread_state`.
pub mod state {
    pub const IN_NATIVE: u32 = 4;
    pub const IN_VM: u32 = 6;
    pub const IN_JAVA: u32 = 8;
}

/// Per-thread storage at fixed offsets. Every field is one 32-bit word so
/// the layout is identical in simulated memory and on an x86-32 host.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JavaThread {
    pub pending_exception: u32,
    pub exception_file: u32,
    pub exception_line: u32,
    pub last_java_sp: u32,
    pub last_java_fp: u32,
    pub last_java_pc: u32,
    pub tlab_top: u32,
    pub tlab_end: u32,
    pub tlab_start: u32,
    pub saved_exception_pc: u32,
    pub unsafe_access_error: u32,
    pub vm_result: u32,
    pub vm_result_2: u32,
    pub thread_state: u32,
    pub exception_oop: u32,
    pub exception_pc: u32,
    pub stack_overflow_limit: u32,
    pub do_not_unlock: u32,
    pub satb_queue_active: u32,
    pub satb_queue_index: u32,
    pub satb_queue_buffer: u32,
    pub dirty_card_queue_index: u32,
    pub dirty_card_queue_buffer: u32,
}

macro_rules! thread_offsets {
    ($($name:ident => $field:ident,)*) => {
        $(pub const $name: i32 = offset_of!(JavaThread, $field) as i32;)*
    };
}

thread_offsets! {
    PENDING_EXCEPTION_OFFSET => pending_exception,
    EXCEPTION_FILE_OFFSET => exception_file,
    EXCEPTION_LINE_OFFSET => exception_line,
    LAST_JAVA_SP_OFFSET => last_java_sp,
    LAST_JAVA_FP_OFFSET => last_java_fp,
    LAST_JAVA_PC_OFFSET => last_java_pc,
    TLAB_TOP_OFFSET => tlab_top,
    TLAB_END_OFFSET => tlab_end,
    TLAB_START_OFFSET => tlab_start,
    SAVED_EXCEPTION_PC_OFFSET => saved_exception_pc,
    UNSAFE_ACCESS_ERROR_OFFSET => unsafe_access_error,
    VM_RESULT_OFFSET => vm_result,
    VM_RESULT_2_OFFSET => vm_result_2,
    THREAD_STATE_OFFSET => thread_state,
    EXCEPTION_OOP_OFFSET => exception_oop,
    EXCEPTION_PC_OFFSET => exception_pc,
    STACK_OVERFLOW_LIMIT_OFFSET => stack_overflow_limit,
    DO_NOT_UNLOCK_OFFSET => do_not_unlock,
    SATB_QUEUE_ACTIVE_OFFSET => satb_queue_active,
    SATB_QUEUE_INDEX_OFFSET => satb_queue_index,
    SATB_QUEUE_BUFFER_OFFSET => satb_queue_buffer,
    DIRTY_CARD_QUEUE_INDEX_OFFSET => dirty_card_queue_index,
    DIRTY_CARD_QUEUE_BUFFER_OFFSET => dirty_card_queue_buffer,
}

/// Size of the descriptor in bytes.
pub const SIZE: u32 = std::mem::size_of::<JavaThread>() as u32;

impl JavaThread {
    /// Serialize in field order.
    pub fn to_words(&self) -> Vec<u32> {
        vec![
            self.pending_exception,
            self.exception_file,
            self.exception_line,
            self.last_java_sp,
            self.last_java_fp,
            self.last_java_pc,
            self.tlab_top,
            self.tlab_end,
            self.tlab_start,
            self.saved_exception_pc,
            self.unsafe_access_error,
            self.vm_result,
            self.vm_result_2,
            self.thread_state,
            self.exception_oop,
            self.exception_pc,
            self.stack_overflow_limit,
            self.do_not_unlock,
            self.satb_queue_active,
            self.satb_queue_index,
            self.satb_queue_buffer,
            self.dirty_card_queue_index,
            self.dirty_card_queue_buffer,
        ]
    }

    /// Store this descriptor at `addr`.
    pub fn store(&self, mem: &mut dyn Memory32, addr: u32) -> VmResult<()> {
        for (i, w) in self.to_words().into_iter().enumerate() {
            mem.write_u32(addr + 4 * i as u32, w)?;
        }
        Ok(())
    }

    /// Load a descriptor from `addr`.
    pub fn load(mem: &dyn Memory32, addr: u32) -> VmResult<Self> {
        let w = |off: i32| mem.read_u32(addr.wrapping_add(off as u32));
        Ok(Self {
            pending_exception: w(PENDING_EXCEPTION_OFFSET)?,
            exception_file: w(EXCEPTION_FILE_OFFSET)?,
            exception_line: w(EXCEPTION_LINE_OFFSET)?,
            last_java_sp: w(LAST_JAVA_SP_OFFSET)?,
            last_java_fp: w(LAST_JAVA_FP_OFFSET)?,
            last_java_pc: w(LAST_JAVA_PC_OFFSET)?,
            tlab_top: w(TLAB_TOP_OFFSET)?,
            tlab_end: w(TLAB_END_OFFSET)?,
            tlab_start: w(TLAB_START_OFFSET)?,
            saved_exception_pc: w(SAVED_EXCEPTION_PC_OFFSET)?,
            unsafe_access_error: w(UNSAFE_ACCESS_ERROR_OFFSET)?,
            vm_result: w(VM_RESULT_OFFSET)?,
            vm_result_2: w(VM_RESULT_2_OFFSET)?,
            thread_state: w(THREAD_STATE_OFFSET)?,
            exception_oop: w(EXCEPTION_OOP_OFFSET)?,
            exception_pc: w(EXCEPTION_PC_OFFSET)?,
            stack_overflow_limit: w(STACK_OVERFLOW_LIMIT_OFFSET)?,
            do_not_unlock: w(DO_NOT_UNLOCK_OFFSET)?,
            satb_queue_active: w(SATB_QUEUE_ACTIVE_OFFSET)?,
            satb_queue_index: w(SATB_QUEUE_INDEX_OFFSET)?,
            satb_queue_buffer: w(SATB_QUEUE_BUFFER_OFFSET)?,
            dirty_card_queue_index: w(DIRTY_CARD_QUEUE_INDEX_OFFSET)?,
            dirty_card_queue_buffer: w(DIRTY_CARD_QUEUE_BUFFER_OFFSET)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory32::SimMemory;

    #[test]
    fn test_offsets_are_word_aligned_and_packed() {
        assert_eq!(PENDING_EXCEPTION_OFFSET, 0);
        assert_eq!(LAST_JAVA_SP_OFFSET, 12);
        assert_eq!(DIRTY_CARD_QUEUE_BUFFER_OFFSET as u32 + 4, SIZE);
        assert_eq!(SIZE as usize, JavaThread::default().to_words().len() * 4);
    }

    #[test]
    fn test_store_load() {
        let mut mem = SimMemory::new();
        mem.map(0x8000, 0x100).unwrap();
        let thread = JavaThread {
            pending_exception: 0x1234,
            tlab_end: 0x9000,
            thread_state: state::IN_JAVA,
            ..Default::default()
        };
        thread.store(&mut mem, 0x8000).unwrap();
        assert_eq!(mem.read_u32(0x8000 + TLAB_END_OFFSET as u32).unwrap(), 0x9000);
        assert_eq!(JavaThread::load(&mem, 0x8000).unwrap(), thread);
    }
}
