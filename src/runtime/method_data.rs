//! Interpreter profiling data.
//!
//! A method-data object is a header followed by one `DataLayout` per
//! profiled bytecode, in bci order. Each layout is a header word
//! `tag:8 | flags:8 | bci:16` followed by 32-bit cells. Branching data
//! records a displacement to the layout of its target so the interpreter
//! can move its mdp without searching.

use super::bytecodes::{self, Bytecode, BytecodeStream};
use super::memory32::{Arena, Memory32};
use crate::error::{VmError, VmResult};

/// Method-data header.
pub mod mdo {
    pub const METHOD_OFFSET: i32 = 0;
    /// Bytes of profile data following the header
    pub const DATA_SIZE_OFFSET: i32 = 4;
    pub const INVOCATION_COUNTER_OFFSET: i32 = 8;
    pub const BACKEDGE_COUNTER_OFFSET: i32 = 12;
    pub const DATA_OFFSET: i32 = 16;
}

/// Layout of one profile entry.
pub mod data_layout {
    pub const TAG_OFFSET: i32 = 0;
    pub const FLAGS_OFFSET: i32 = 1;
    pub const BCI_OFFSET: i32 = 2;
    pub const HEADER_SIZE: i32 = 4;
    pub const CELL_SIZE: i32 = 4;
    /// `null_seen` as seen through the 32-bit header word
    pub const NULL_SEEN_IN_HEADER: i32 = 1 << 8;
    pub const COUNTER_INCREMENT: i32 = 1;

    pub const fn cell_offset(index: i32) -> i32 {
        HEADER_SIZE + index * CELL_SIZE
    }
}

/// Cell indices of the individual data kinds.
pub mod cells {
    pub const COUNT: i32 = 0;

    pub const JUMP_TAKEN: i32 = 0;
    pub const JUMP_DISPLACEMENT: i32 = 1;

    pub const BRANCH_NOT_TAKEN: i32 = 2;

    /// Receiver rows of type and virtual-call data
    pub const RECEIVER_ROWS: i32 = 2;
    pub const fn receiver(row: i32) -> i32 {
        1 + 2 * row
    }
    pub const fn receiver_count(row: i32) -> i32 {
        2 + 2 * row
    }

    pub const RET_ROWS: i32 = 2;
    pub const fn ret_bci(row: i32) -> i32 {
        1 + 3 * row
    }
    pub const fn ret_count(row: i32) -> i32 {
        2 + 3 * row
    }
    pub const fn ret_displacement(row: i32) -> i32 {
        3 + 3 * row
    }

    pub const ARRAY_LEN: i32 = 0;
    pub const DEFAULT_COUNT: i32 = 1;
    pub const DEFAULT_DISPLACEMENT: i32 = 2;
    pub const fn case_count(index: i32) -> i32 {
        3 + 2 * index
    }
    pub const fn case_displacement(index: i32) -> i32 {
        4 + 2 * index
    }
}

/// Kind of profile entry, stored as the tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataTag {
    Bit = 1,
    Counter = 2,
    Jump = 3,
    ReceiverType = 4,
    VirtualCall = 5,
    Ret = 6,
    Branch = 7,
    MultiBranch = 8,
}

impl DataTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => DataTag::Bit,
            2 => DataTag::Counter,
            3 => DataTag::Jump,
            4 => DataTag::ReceiverType,
            5 => DataTag::VirtualCall,
            6 => DataTag::Ret,
            7 => DataTag::Branch,
            8 => DataTag::MultiBranch,
            _ => return None,
        })
    }
}

/// Cell count of a fixed-size entry.
fn static_cell_count(tag: DataTag) -> u32 {
    match tag {
        DataTag::Bit => 0,
        DataTag::Counter => 1,
        DataTag::Jump => 2,
        DataTag::Branch => 3,
        DataTag::ReceiverType | DataTag::VirtualCall => 1 + 2 * cells::RECEIVER_ROWS as u32,
        DataTag::Ret => 1 + 3 * cells::RET_ROWS as u32,
        DataTag::MultiBranch => 1,
    }
}

/// Which entry, if any, profiles `bc`.
pub fn tag_for(bc: Bytecode) -> Option<DataTag> {
    use Bytecode::*;
    Some(match bc.java_code() {
        Checkcast | Instanceof | Aastore => DataTag::ReceiverType,
        Invokespecial | Invokestatic | Invokedynamic => DataTag::Counter,
        Goto | GotoW | Jsr | JsrW => DataTag::Jump,
        Invokevirtual | Invokeinterface => DataTag::VirtualCall,
        Ret => DataTag::Ret,
        Lookupswitch | Tableswitch => DataTag::MultiBranch,
        b if b.is_conditional_branch() => DataTag::Branch,
        _ => return None,
    })
}

/// One planned entry of a method-data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataEntry {
    pub bci: u32,
    pub tag: DataTag,
    pub cell_count: u32,
    /// Byte offset from the start of the data area
    pub offset: u32,
}

impl DataEntry {
    pub fn size_in_bytes(&self) -> u32 {
        data_layout::HEADER_SIZE as u32 + self.cell_count * data_layout::CELL_SIZE as u32
    }
}

/// Plan the data area for `code`.
pub fn plan(code: &[u8]) -> VmResult<Vec<DataEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0;
    for insn in BytecodeStream::new(code) {
        let insn = insn?;
        let bc = insn.wide.unwrap_or(insn.bytecode);
        let Some(tag) = tag_for(bc) else {
            continue;
        };
        let cell_count = if tag == DataTag::MultiBranch {
            1 + 2 * (switch_case_count(code, insn.bci, bc)? + 1)
        } else {
            static_cell_count(tag)
        };
        let entry = DataEntry {
            bci: insn.bci as u32,
            tag,
            cell_count,
            offset,
        };
        offset += entry.size_in_bytes();
        entries.push(entry);
    }
    Ok(entries)
}

fn switch_case_count(code: &[u8], bci: usize, bc: Bytecode) -> VmResult<u32> {
    let base = bytecodes::switch_operands(bci);
    if bc == Bytecode::Tableswitch {
        let low = bytecodes::read_i32_be(code, base + 4)?;
        let high = bytecodes::read_i32_be(code, base + 8)?;
        Ok((high as i64 - low as i64 + 1).max(0) as u32)
    } else {
        Ok(bytecodes::read_i32_be(code, base + 4)?.max(0) as u32)
    }
}

/// Branch targets of the instruction at `bci`: `(cell, target_bci)`.
fn branch_targets(code: &[u8], bci: usize, tag: DataTag) -> VmResult<Vec<(i32, i64)>> {
    let bc = bytecodes::code_at(code, bci)?;
    Ok(match tag {
        DataTag::Jump | DataTag::Branch => {
            let disp = match bc {
                Bytecode::GotoW | Bytecode::JsrW => bytecodes::read_i32_be(code, bci + 1)? as i64,
                _ => bytecodes::read_u16_be(code, bci + 1)? as i16 as i64,
            };
            vec![(cells::JUMP_DISPLACEMENT, bci as i64 + disp)]
        }
        DataTag::MultiBranch => {
            let base = bytecodes::switch_operands(bci);
            let default = bytecodes::read_i32_be(code, base)? as i64;
            let mut targets = vec![(cells::DEFAULT_DISPLACEMENT, bci as i64 + default)];
            let cases = switch_case_count(code, bci, bc)?;
            for i in 0..cases as usize {
                let off = if bc == Bytecode::Tableswitch {
                    bytecodes::read_i32_be(code, base + 12 + 4 * i)?
                } else {
                    bytecodes::read_i32_be(code, base + 8 + 8 * i + 4)?
                };
                targets.push((cells::case_displacement(i as i32), bci as i64 + off as i64));
            }
            targets
        }
        _ => Vec::new(),
    })
}

/// Decoded contents of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileData {
    Bit,
    Counter { count: u32 },
    Jump { taken: u32, displacement: i32 },
    Branch { taken: u32, not_taken: u32, displacement: i32 },
    ReceiverType { count: u32, receivers: Vec<(u32, u32)> },
    VirtualCall { count: u32, receivers: Vec<(u32, u32)> },
    Ret { count: u32, rows: Vec<(u32, u32, i32)> },
    MultiBranch { default_count: u32, default_displacement: i32, cases: Vec<(u32, i32)> },
}

/// Handle to a method-data object in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodData {
    addr: u32,
}

impl MethodData {
    pub fn at(addr: u32) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Lay out and initialize a method-data object for `code`.
    pub fn allocate(
        mem: &mut dyn Memory32,
        arena: &mut Arena,
        method: u32,
        code: &[u8],
    ) -> VmResult<Self> {
        let entries = plan(code)?;
        let data_size: u32 = entries.iter().map(DataEntry::size_in_bytes).sum();
        let addr = arena.allocate(mdo::DATA_OFFSET as u32 + data_size, 8)?;
        let md = Self { addr };
        mem.write_bytes(addr, &vec![0; (mdo::DATA_OFFSET as u32 + data_size) as usize])?;
        mem.write_u32(addr + mdo::METHOD_OFFSET as u32, method)?;
        mem.write_u32(addr + mdo::DATA_SIZE_OFFSET as u32, data_size)?;

        for e in &entries {
            let dp = md.data_base() + e.offset;
            let header = e.tag as u32 | (e.bci << 16);
            mem.write_u32(dp, header)?;
            if e.tag == DataTag::MultiBranch {
                mem.write_u32(
                    dp + data_layout::cell_offset(cells::ARRAY_LEN) as u32,
                    e.cell_count - 1,
                )?;
            }
        }
        // Displacements need every entry's offset.
        for e in &entries {
            for (cell, target) in branch_targets(code, e.bci as usize, e.tag)? {
                let target_dp = md.bci_to_dp(mem, target.max(0) as u32)?;
                let disp = target_dp as i64 - (md.data_base() + e.offset) as i64;
                mem.write_i32(
                    md.data_base() + e.offset + data_layout::cell_offset(cell) as u32,
                    disp as i32,
                )?;
            }
        }
        log::trace!(
            "method data at {addr:#x}: {} entries, {data_size} bytes",
            entries.len()
        );
        Ok(md)
    }

    pub fn data_base(&self) -> u32 {
        self.addr + mdo::DATA_OFFSET as u32
    }

    pub fn data_size(&self, mem: &dyn Memory32) -> VmResult<u32> {
        mem.read_u32(self.addr + mdo::DATA_SIZE_OFFSET as u32)
    }

    pub fn data_limit(&self, mem: &dyn Memory32) -> VmResult<u32> {
        Ok(self.data_base() + self.data_size(mem)?)
    }

    fn entry_size(mem: &dyn Memory32, dp: u32) -> VmResult<u32> {
        let tag = mem.read_u8(dp)?;
        let tag = DataTag::from_u8(tag)
            .ok_or_else(|| VmError::Frame(format!("corrupt profile tag {tag} at {dp:#x}")))?;
        let cells = if tag == DataTag::MultiBranch {
            1 + mem.read_u32(dp + data_layout::cell_offset(cells::ARRAY_LEN) as u32)?
        } else {
            static_cell_count(tag)
        };
        Ok(data_layout::HEADER_SIZE as u32 + cells * data_layout::CELL_SIZE as u32)
    }

    /// Entry addresses in bci order.
    pub fn entries(&self, mem: &dyn Memory32) -> VmResult<Vec<u32>> {
        let limit = self.data_limit(mem)?;
        let mut dp = self.data_base();
        let mut out = Vec::new();
        while dp < limit {
            out.push(dp);
            dp += Self::entry_size(mem, dp)?;
        }
        Ok(out)
    }

    pub fn bci_at(mem: &dyn Memory32, dp: u32) -> VmResult<u32> {
        Ok(mem.read_u16(dp + data_layout::BCI_OFFSET as u32)? as u32)
    }

    /// First entry whose bci is at or after `bci`, or the data limit.
    pub fn bci_to_dp(&self, mem: &dyn Memory32, bci: u32) -> VmResult<u32> {
        for dp in self.entries(mem)? {
            if Self::bci_at(mem, dp)? >= bci {
                return Ok(dp);
            }
        }
        self.data_limit(mem)
    }

    /// Entry for exactly `bci`.
    pub fn data_at(&self, mem: &dyn Memory32, bci: u32) -> VmResult<Option<(u32, ProfileData)>> {
        let dp = self.bci_to_dp(mem, bci)?;
        if dp >= self.data_limit(mem)? || Self::bci_at(mem, dp)? != bci {
            return Ok(None);
        }
        Ok(Some((dp, Self::decode(mem, dp)?)))
    }

    /// Byte index of an entry in the data area.
    pub fn dp_to_di(&self, dp: u32) -> u32 {
        dp - self.data_base()
    }

    pub fn di_to_dp(&self, di: u32) -> u32 {
        self.data_base() + di
    }

    pub fn null_seen(mem: &dyn Memory32, dp: u32) -> VmResult<bool> {
        Ok(mem.read_u32(dp)? & data_layout::NULL_SEEN_IN_HEADER as u32 != 0)
    }

    pub fn invocation_counter(&self, mem: &dyn Memory32) -> VmResult<u32> {
        mem.read_u32(self.addr + mdo::INVOCATION_COUNTER_OFFSET as u32)
    }

    pub fn backedge_counter(&self, mem: &dyn Memory32) -> VmResult<u32> {
        mem.read_u32(self.addr + mdo::BACKEDGE_COUNTER_OFFSET as u32)
    }

    fn decode(mem: &dyn Memory32, dp: u32) -> VmResult<ProfileData> {
        let cell = |i: i32| mem.read_u32(dp + data_layout::cell_offset(i) as u32);
        let tag = mem.read_u8(dp)?;
        Ok(match DataTag::from_u8(tag) {
            Some(DataTag::Bit) => ProfileData::Bit,
            Some(DataTag::Counter) => ProfileData::Counter {
                count: cell(cells::COUNT)?,
            },
            Some(DataTag::Jump) => ProfileData::Jump {
                taken: cell(cells::JUMP_TAKEN)?,
                displacement: cell(cells::JUMP_DISPLACEMENT)? as i32,
            },
            Some(DataTag::Branch) => ProfileData::Branch {
                taken: cell(cells::JUMP_TAKEN)?,
                not_taken: cell(cells::BRANCH_NOT_TAKEN)?,
                displacement: cell(cells::JUMP_DISPLACEMENT)? as i32,
            },
            Some(t @ (DataTag::ReceiverType | DataTag::VirtualCall)) => {
                let receivers = (0..cells::RECEIVER_ROWS)
                    .map(|r| Ok((cell(cells::receiver(r))?, cell(cells::receiver_count(r))?)))
                    .collect::<VmResult<Vec<_>>>()?;
                let count = cell(cells::COUNT)?;
                if t == DataTag::ReceiverType {
                    ProfileData::ReceiverType { count, receivers }
                } else {
                    ProfileData::VirtualCall { count, receivers }
                }
            }
            Some(DataTag::Ret) => ProfileData::Ret {
                count: cell(cells::COUNT)?,
                rows: (0..cells::RET_ROWS)
                    .map(|r| {
                        Ok((
                            cell(cells::ret_bci(r))?,
                            cell(cells::ret_count(r))?,
                            cell(cells::ret_displacement(r))? as i32,
                        ))
                    })
                    .collect::<VmResult<Vec<_>>>()?,
            },
            Some(DataTag::MultiBranch) => {
                let len = cell(cells::ARRAY_LEN)?;
                let cases = (0..(len / 2).saturating_sub(1) as i32)
                    .map(|i| {
                        Ok((
                            cell(cells::case_count(i))?,
                            cell(cells::case_displacement(i))? as i32,
                        ))
                    })
                    .collect::<VmResult<Vec<_>>>()?;
                ProfileData::MultiBranch {
                    default_count: cell(cells::DEFAULT_COUNT)?,
                    default_displacement: cell(cells::DEFAULT_DISPLACEMENT)? as i32,
                    cases,
                }
            }
            None => {
                return Err(VmError::Frame(format!(
                    "corrupt profile tag {tag} at {dp:#x}"
                )));
            }
        })
    }

    /// Record a `ret` to `return_bci` the way the runtime does when the
    /// interpreter's inline row search misses. Returns the new mdp.
    pub fn update_for_ret(&self, mem: &mut dyn Memory32, dp: u32, return_bci: u32) -> VmResult<u32> {
        let target = self.bci_to_dp(mem, return_bci)?;
        let disp = target as i64 - dp as i64;
        for row in 0..cells::RET_ROWS {
            let bci_cell = dp + data_layout::cell_offset(cells::ret_bci(row)) as u32;
            let count_cell = dp + data_layout::cell_offset(cells::ret_count(row)) as u32;
            let stored = mem.read_u32(bci_cell)?;
            if stored == return_bci || mem.read_u32(count_cell)? == 0 {
                mem.write_u32(bci_cell, return_bci)?;
                let count = mem.read_u32(count_cell)?;
                mem.write_u32(count_cell, count.saturating_add(1))?;
                mem.write_i32(
                    dp + data_layout::cell_offset(cells::ret_displacement(row)) as u32,
                    disp as i32,
                )?;
                return Ok(target);
            }
        }
        let count_cell = dp + data_layout::cell_offset(cells::COUNT) as u32;
        let count = mem.read_u32(count_cell)?;
        mem.write_u32(count_cell, count.saturating_add(1))?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory32::SimMemory;

    fn setup() -> (SimMemory, Arena) {
        let mut mem = SimMemory::new();
        mem.map(0x10000, 0x1000).unwrap();
        (mem, Arena::new(0x10000, 0x1000))
    }

    #[test]
    fn test_plan_cell_counts() {
        // 0: iload_0; 1: ifeq +6; 4: invokestatic #1; 7: goto -7 (to 0)
        let code = [0x1a, 0x99, 0x00, 0x06, 0xb8, 0x00, 0x01, 0xa7, 0xff, 0xf9];
        let entries = plan(&code).unwrap();
        let summary: Vec<_> = entries.iter().map(|e| (e.bci, e.tag, e.cell_count)).collect();
        assert_eq!(
            summary,
            vec![
                (1, DataTag::Branch, 3),
                (4, DataTag::Counter, 1),
                (7, DataTag::Jump, 2),
            ]
        );
        assert_eq!(entries[1].offset, 16);
    }

    #[test]
    fn test_branch_displacement_points_at_target_data() {
        let (mut mem, mut arena) = setup();
        // 0: iconst_0; 1: ifeq -> 7; 4: invokestatic; 7: goto -> 1
        let code = [0x03, 0x99, 0x00, 0x06, 0xb8, 0x00, 0x01, 0xa7, 0xff, 0xfa];
        let md = MethodData::allocate(&mut mem, &mut arena, 0xABCD, &code).unwrap();
        let (dp_if, data) = md.data_at(&mem, 1).unwrap().unwrap();
        let ProfileData::Branch { displacement, .. } = data else {
            panic!("expected branch data");
        };
        let goto_dp = md.bci_to_dp(&mem, 7).unwrap();
        assert_eq!((dp_if as i64 + displacement as i64) as u32, goto_dp);
        let (_, data) = md.data_at(&mem, 7).unwrap().unwrap();
        assert_eq!(
            data,
            ProfileData::Jump {
                taken: 0,
                displacement: dp_if as i32 - goto_dp as i32
            }
        );
        assert_eq!(mem.read_u32(md.addr()).unwrap(), 0xABCD);
    }

    #[test]
    fn test_tableswitch_is_multi_branch() {
        let (mut mem, mut arena) = setup();
        // 0: iload_0; 1: tableswitch default=+23 low=0 high=1 [+23, +23]; 24: return
        let mut code = vec![0x1a, 0xaa, 0, 0];
        for v in [23i32, 0, 1, 23, 23] {
            code.extend_from_slice(&v.to_be_bytes());
        }
        code.push(0xb1);
        let md = MethodData::allocate(&mut mem, &mut arena, 0, &code).unwrap();
        let (_, data) = md.data_at(&mem, 1).unwrap().unwrap();
        let ProfileData::MultiBranch { cases, .. } = data else {
            panic!("expected multi-branch data");
        };
        assert_eq!(cases.len(), 2);
        assert_eq!(md.entries(&mem).unwrap().len(), 1);
    }

    #[test]
    fn test_ret_rows_fill_then_overflow() {
        let (mut mem, mut arena) = setup();
        // 0: jsr +4; 3: return; 4: astore_1; 5: ret 1
        let code = [0xa8, 0x00, 0x04, 0xb1, 0x4c, 0xa9, 0x01];
        let md = MethodData::allocate(&mut mem, &mut arena, 0, &code).unwrap();
        let dp = md.bci_to_dp(&mem, 5).unwrap();
        md.update_for_ret(&mut mem, dp, 3).unwrap();
        md.update_for_ret(&mut mem, dp, 3).unwrap();
        md.update_for_ret(&mut mem, dp, 1).unwrap();
        md.update_for_ret(&mut mem, dp, 2).unwrap();
        let Some((_, ProfileData::Ret { count, rows })) = md.data_at(&mem, 5).unwrap() else {
            panic!("expected ret data");
        };
        assert_eq!(rows[0].0, 3);
        assert_eq!(rows[0].1, 2);
        assert_eq!(rows[1].0, 1);
        assert_eq!(count, 1);
    }
}
