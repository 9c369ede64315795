//! Code emission: buffers, executable memory, the IA-32 assembler and the
//! macro layer shared by stubs and templates.

pub mod codebuf;
pub mod macro_asm;
pub mod memory;
pub mod x86_32;

pub use codebuf::{CodeBuffer, Label, RelocKind, Relocation};
pub use macro_asm::{AsmContext, MacroAssembler};
pub use memory::{MemoryError, NativeRegion, Protection};
pub use x86_32::{Address, Assembler, Cond, Reg, Scale, Xmm};
