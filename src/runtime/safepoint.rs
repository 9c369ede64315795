//! Safepoint poll word.
//!
//! Entries that return without dispatching compare the poll word against
//! `NotSynchronized`; everything else sees a safepoint through the swapped
//! dispatch table.

use super::memory32::Memory32;
use crate::error::{VmError, VmResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SafepointState {
    NotSynchronized = 0,
    Synchronizing = 1,
    Synchronized = 2,
}

impl SafepointState {
    fn from_word(word: u32) -> VmResult<Self> {
        match word {
            0 => Ok(SafepointState::NotSynchronized),
            1 => Ok(SafepointState::Synchronizing),
            2 => Ok(SafepointState::Synchronized),
            other => Err(VmError::Config(format!("corrupt safepoint state {other}"))),
        }
    }
}

/// Handle to the poll word in the data section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Safepoint {
    poll_addr: u32,
}

impl Safepoint {
    pub fn new(poll_addr: u32) -> Self {
        Self { poll_addr }
    }

    /// Address compared by generated code.
    pub fn poll_addr(&self) -> u32 {
        self.poll_addr
    }

    pub fn state(&self, mem: &dyn Memory32) -> VmResult<SafepointState> {
        SafepointState::from_word(mem.read_u32(self.poll_addr)?)
    }

    /// Request synchronization: threads reaching a poll will call the VM.
    pub fn begin(&self, mem: &mut dyn Memory32) -> VmResult<()> {
        match self.state(mem)? {
            SafepointState::NotSynchronized => {
                log::debug!("safepoint: synchronizing");
                mem.write_u32(self.poll_addr, SafepointState::Synchronizing as u32)
            }
            other => Err(VmError::Config(format!("safepoint already active ({other:?})"))),
        }
    }

    /// All threads have stopped.
    pub fn synchronized(&self, mem: &mut dyn Memory32) -> VmResult<()> {
        mem.write_u32(self.poll_addr, SafepointState::Synchronized as u32)
    }

    /// Release the safepoint.
    pub fn end(&self, mem: &mut dyn Memory32) -> VmResult<()> {
        log::debug!("safepoint: released");
        mem.write_u32(self.poll_addr, SafepointState::NotSynchronized as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory32::SimMemory;

    #[test]
    fn test_state_machine() {
        let mut mem = SimMemory::new();
        mem.map(0x100, 4).unwrap();
        let sp = Safepoint::new(0x100);
        assert_eq!(sp.state(&mem).unwrap(), SafepointState::NotSynchronized);
        sp.begin(&mut mem).unwrap();
        assert!(sp.begin(&mut mem).is_err());
        sp.synchronized(&mut mem).unwrap();
        assert_eq!(sp.state(&mem).unwrap(), SafepointState::Synchronized);
        sp.end(&mut mem).unwrap();
        assert_eq!(mem.read_u32(0x100).unwrap(), 0);
    }
}
