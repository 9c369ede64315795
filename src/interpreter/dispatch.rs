//! Dispatch tables.
//!
//! Generated code jumps through `active[tos][opcode]`. The host keeps the
//! `normal` and `safepoint` variants and copies one of them into the active
//! table when safepoints are requested or released.

use serde::Serialize;

use crate::error::VmResult;
use crate::runtime::basic_type::{TosState, NUMBER_OF_STATES};
use crate::runtime::bytecodes::DISPATCH_LENGTH;
use crate::runtime::globals::VmGlobals;
use crate::runtime::memory32::Memory32;

/// One code address per TOS state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryPoint {
    entries: [u32; NUMBER_OF_STATES],
}

impl EntryPoint {
    /// Every state enters at `addr`.
    pub fn uniform(addr: u32) -> Self {
        Self {
            entries: [addr; NUMBER_OF_STATES],
        }
    }

    pub fn entry(&self, state: TosState) -> u32 {
        self.entries[state.index()]
    }

    pub fn set_entry(&mut self, state: TosState, addr: u32) {
        self.entries[state.index()] = addr;
    }

    /// Write the entries as consecutive words, indexed by state.
    pub fn install(&self, mem: &mut dyn Memory32, at: u32) -> VmResult<()> {
        for (i, &addr) in self.entries.iter().enumerate() {
            mem.write_u32(at + 4 * i as u32, addr)?;
        }
        Ok(())
    }
}

/// Row-major `[tos][opcode]` table of code addresses.
#[derive(Clone, PartialEq, Eq)]
pub struct DispatchTable {
    rows: Vec<[u32; DISPATCH_LENGTH]>,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable").finish_non_exhaustive()
    }
}

impl DispatchTable {
    pub fn new(fill: u32) -> Self {
        Self {
            rows: vec![[fill; DISPATCH_LENGTH]; NUMBER_OF_STATES],
        }
    }

    pub fn entry(&self, state: TosState, opcode: u8) -> u32 {
        self.rows[state.index()][opcode as usize]
    }

    /// The entry point set for `opcode`.
    pub fn entry_point(&self, opcode: u8) -> EntryPoint {
        let mut ep = EntryPoint::uniform(0);
        for state in TosState::ALL {
            ep.set_entry(state, self.entry(state, opcode));
        }
        ep
    }

    pub fn set_entry(&mut self, opcode: u8, ep: &EntryPoint) {
        for state in TosState::ALL {
            self.rows[state.index()][opcode as usize] = ep.entry(state);
        }
    }

    pub fn row(&self, state: TosState) -> &[u32; DISPATCH_LENGTH] {
        &self.rows[state.index()]
    }

    /// Write the table at `base` in the layout `dispatch_via` expects.
    pub fn install(&self, mem: &mut dyn Memory32, base: u32) -> VmResult<()> {
        for state in TosState::ALL {
            for (opcode, &addr) in self.row(state).iter().enumerate() {
                mem.write_u32(VmGlobals::dispatch_slot(base, state.index(), opcode as u8), addr)?;
            }
        }
        Ok(())
    }
}

/// The normal and safepoint tables plus the `wide` entries.
#[derive(Debug, Clone)]
pub struct DispatchTables {
    pub normal: DispatchTable,
    pub safepoint: DispatchTable,
    pub wentry: [u32; DISPATCH_LENGTH],
}

impl DispatchTables {
    pub fn new(unimplemented: u32) -> Self {
        Self {
            normal: DispatchTable::new(unimplemented),
            safepoint: DispatchTable::new(unimplemented),
            wentry: [unimplemented; DISPATCH_LENGTH],
        }
    }

    /// Write every table; the active table starts out normal.
    pub fn install(&self, mem: &mut dyn Memory32, globals: &VmGlobals) -> VmResult<()> {
        self.normal.install(mem, globals.dispatch_normal)?;
        self.normal.install(mem, globals.dispatch_active)?;
        self.safepoint.install(mem, globals.dispatch_safepoint)?;
        for (opcode, &addr) in self.wentry.iter().enumerate() {
            mem.write_u32(globals.wentry_table + 4 * opcode as u32, addr)?;
        }
        log::debug!("dispatch tables installed at {:#010x}", globals.dispatch_active);
        Ok(())
    }

    /// Route every bytecode through the safepoint entries.
    pub fn notice_safepoints(&self, mem: &mut dyn Memory32, globals: &VmGlobals) -> VmResult<()> {
        log::trace!("interpreter notices safepoints");
        self.safepoint.install(mem, globals.dispatch_active)
    }

    pub fn ignore_safepoints(&self, mem: &mut dyn Memory32, globals: &VmGlobals) -> VmResult<()> {
        log::trace!("interpreter ignores safepoints");
        self.normal.install(mem, globals.dispatch_active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory32::SimMemory;

    fn globals_and_memory() -> (VmGlobals, SimMemory) {
        let g = VmGlobals::layout(0x0900_0000, 0x20000).unwrap();
        let mut mem = SimMemory::new();
        mem.map(g.base, 0x20000).unwrap();
        (g, mem)
    }

    #[test]
    fn test_entry_point_install_by_state() {
        let (_, mut mem) = globals_and_memory();
        let mut ep = EntryPoint::uniform(0x100);
        ep.set_entry(TosState::Dtos, 0x200);
        ep.install(&mut mem, 0x0900_1000).unwrap();
        assert_eq!(mem.read_u32(0x0900_1000 + 4 * TosState::Dtos.index() as u32).unwrap(), 0x200);
        assert_eq!(mem.read_u32(0x0900_1000).unwrap(), 0x100);
    }

    #[test]
    fn test_safepoint_swap_changes_active_table() {
        let (g, mut mem) = globals_and_memory();
        let mut tables = DispatchTables::new(0xDEAD);
        let mut normal = EntryPoint::uniform(0x1000);
        normal.set_entry(TosState::Itos, 0x1004);
        tables.normal.set_entry(0x60, &normal);
        tables.safepoint.set_entry(0x60, &EntryPoint::uniform(0x2000));
        tables.install(&mut mem, &g).unwrap();

        let slot = VmGlobals::dispatch_slot(g.dispatch_active, TosState::Itos.index(), 0x60);
        assert_eq!(mem.read_u32(slot).unwrap(), 0x1004);
        tables.notice_safepoints(&mut mem, &g).unwrap();
        assert_eq!(mem.read_u32(slot).unwrap(), 0x2000);
        tables.ignore_safepoints(&mut mem, &g).unwrap();
        assert_eq!(mem.read_u32(slot).unwrap(), 0x1004);
        // the normal copy is never touched
        let normal_slot = VmGlobals::dispatch_slot(g.dispatch_normal, TosState::Itos.index(), 0x60);
        assert_eq!(mem.read_u32(normal_slot).unwrap(), 0x1004);
    }

    #[test]
    fn test_unset_slots_keep_fill() {
        let tables = DispatchTables::new(0xDEAD);
        assert_eq!(tables.normal.entry(TosState::Vtos, 0xFF), 0xDEAD);
        assert_eq!(tables.wentry[0x15], 0xDEAD);
        assert_eq!(tables.normal.entry_point(0x10).entry(TosState::Atos), 0xDEAD);
    }
}
