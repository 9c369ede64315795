//! GC write-barrier contracts.
//!
//! Generated code selects its pre/post barrier sequences from the variant
//! at generation time. The host models below apply the same rules to a
//! `Memory32` and are what the tests compare generated behaviour against.

use serde::{Deserialize, Serialize};

use super::memory32::Memory32;
use super::thread;
use crate::error::VmResult;

/// Card values.
pub mod card {
    pub const CLEAN: u8 = 0xFF;
    pub const DIRTY: u8 = 0;
    /// Cards of young regions are never enqueued
    pub const G1_YOUNG: u8 = 32;
}

/// Default card size.
pub const CARD_SHIFT: u32 = 9;

/// The collector's barrier set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BarrierSet {
    /// Unconditional card mark after every reference store.
    CardTable { byte_map_base: u32, card_shift: u32 },
    /// Snapshot-at-the-beginning logging before the store, filtered
    /// card enqueueing after it.
    G1Satb {
        byte_map_base: u32,
        card_shift: u32,
        region_log: u32,
    },
}

impl Default for BarrierSet {
    fn default() -> Self {
        BarrierSet::CardTable {
            byte_map_base: 0,
            card_shift: CARD_SHIFT,
        }
    }
}

impl BarrierSet {
    pub fn byte_map_base(&self) -> u32 {
        match *self {
            BarrierSet::CardTable { byte_map_base, .. } | BarrierSet::G1Satb { byte_map_base, .. } => {
                byte_map_base
            }
        }
    }

    pub fn card_shift(&self) -> u32 {
        match *self {
            BarrierSet::CardTable { card_shift, .. } | BarrierSet::G1Satb { card_shift, .. } => {
                card_shift
            }
        }
    }

    /// Whether reference stores need a pre-barrier.
    pub fn has_pre_barrier(&self) -> bool {
        matches!(self, BarrierSet::G1Satb { .. })
    }

    /// Address of the card covering `addr`.
    pub fn card_for(&self, addr: u32) -> u32 {
        self.byte_map_base()
            .wrapping_add(addr >> self.card_shift())
    }

    pub fn name(&self) -> &'static str {
        match self {
            BarrierSet::CardTable { .. } => "card_table",
            BarrierSet::G1Satb { .. } => "g1_satb",
        }
    }
}

/// Host model of the card table.
pub struct CardTableModel {
    barrier: BarrierSet,
}

impl CardTableModel {
    pub fn new(barrier: BarrierSet) -> Self {
        Self { barrier }
    }

    /// Post-barrier for a store of `new_val` at `field`.
    ///
    /// Returns the card that was enqueued, if the barrier logs cards.
    pub fn post_barrier(
        &self,
        mem: &mut dyn Memory32,
        thread_addr: u32,
        field: u32,
        new_val: u32,
    ) -> VmResult<Option<u32>> {
        let card_addr = self.barrier.card_for(field);
        match self.barrier {
            BarrierSet::CardTable { .. } => {
                mem.write_u8(card_addr, card::DIRTY)?;
                Ok(None)
            }
            BarrierSet::G1Satb { region_log, .. } => {
                if (field ^ new_val) >> region_log == 0 || new_val == 0 {
                    return Ok(None);
                }
                let value = mem.read_u8(card_addr)?;
                if value == card::G1_YOUNG || value == card::DIRTY {
                    return Ok(None);
                }
                mem.write_u8(card_addr, card::DIRTY)?;
                enqueue(
                    mem,
                    thread_addr,
                    thread::DIRTY_CARD_QUEUE_INDEX_OFFSET,
                    thread::DIRTY_CARD_QUEUE_BUFFER_OFFSET,
                    card_addr,
                )?;
                Ok(Some(card_addr))
            }
        }
    }

    /// Pre-barrier: log the value about to be overwritten while marking.
    pub fn pre_barrier(
        &self,
        mem: &mut dyn Memory32,
        thread_addr: u32,
        field: u32,
    ) -> VmResult<Option<u32>> {
        if !self.barrier.has_pre_barrier() {
            return Ok(None);
        }
        if mem.read_u32(thread_addr + thread::SATB_QUEUE_ACTIVE_OFFSET as u32)? == 0 {
            return Ok(None);
        }
        let pre_val = mem.read_u32(field)?;
        if pre_val == 0 {
            return Ok(None);
        }
        enqueue(
            mem,
            thread_addr,
            thread::SATB_QUEUE_INDEX_OFFSET,
            thread::SATB_QUEUE_BUFFER_OFFSET,
            pre_val,
        )?;
        Ok(Some(pre_val))
    }
}

/// Push `value` onto a thread-local log buffer. A zero index means the
/// buffer is full; the runtime would then hand it off, the model drops it.
fn enqueue(
    mem: &mut dyn Memory32,
    thread_addr: u32,
    index_offset: i32,
    buffer_offset: i32,
    value: u32,
) -> VmResult<()> {
    let index_addr = thread_addr + index_offset as u32;
    let index = mem.read_u32(index_addr)?;
    if index == 0 {
        log::trace!("log buffer at thread {thread_addr:#x}+{index_offset} full");
        return Ok(());
    }
    let index = index - 4;
    mem.write_u32(index_addr, index)?;
    let buffer = mem.read_u32(thread_addr + buffer_offset as u32)?;
    mem.write_u32(buffer + index, value)
}
