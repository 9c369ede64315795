//! Fixed slots of the frames the interpreter builds, as word offsets from
//! `ebp`.

use crate::asm::{Address, Reg};
use crate::runtime::layout::{basic_object_lock, WORD_SIZE};

pub const LINK_OFFSET: i32 = 0;
pub const RETURN_ADDR_OFFSET: i32 = 1;
/// First word of the caller's outgoing area
pub const SENDER_SP_OFFSET: i32 = 2;

pub const INTERPRETER_SENDER_SP_OFFSET: i32 = -1;
/// Non-null only while a call out of this frame is in progress
pub const LAST_SP_OFFSET: i32 = -2;
pub const METHOD_OFFSET: i32 = -3;
pub const MDX_OFFSET: i32 = -4;
pub const CACHE_OFFSET: i32 = -5;
pub const LOCALS_OFFSET: i32 = -6;
pub const BCX_OFFSET: i32 = -7;
pub const INITIAL_SP_OFFSET: i32 = -8;

pub const MONITOR_BLOCK_TOP_OFFSET: i32 = INITIAL_SP_OFFSET;
/// The monitor block ends just below this slot
pub const MONITOR_BLOCK_BOTTOM_OFFSET: i32 = INITIAL_SP_OFFSET;

/// Words between `ebp` (exclusive) and the empty monitor block.
pub const FIXED_WORDS: i32 = -INITIAL_SP_OFFSET;

pub const ENTRY_FRAME_CALL_WRAPPER_OFFSET: i32 = 2;
pub const NATIVE_OOP_TEMP_OFFSET: i32 = 2;
pub const NATIVE_RESULT_HANDLER_OFFSET: i32 = 3;

/// Words per monitor.
pub const MONITOR_SIZE: i32 = basic_object_lock::SIZE_IN_WORDS;

/// `[ebp + word * 4]`
pub fn at(word: i32) -> Address {
    Address::new(Reg::Ebp, word * WORD_SIZE)
}

/// Byte offset of `word` from the frame pointer.
pub const fn byte_offset(word: i32) -> i32 {
    word * WORD_SIZE
}
