//! Crate-wide error type.

use thiserror::Error;

use crate::asm::memory::MemoryError;

/// Errors raised while generating code or inspecting interpreter state.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("label {0} was referenced but never bound")]
    UnboundLabel(usize),

    #[error("label {0} bound twice")]
    LabelRebound(usize),

    #[error("branch displacement out of range at offset {offset:#x}")]
    BranchOutOfRange { offset: usize },

    #[error("x87 stack depth mismatch in {context}: expected {expected}, found {found}")]
    FpuImbalance {
        context: String,
        expected: i32,
        found: i32,
    },

    #[error("code cache section {section} exhausted ({requested} bytes requested, {available} available)")]
    CodeCacheFull {
        section: &'static str,
        requested: usize,
        available: usize,
    },

    #[error("stub {0} generated twice")]
    StubRedefined(&'static str),

    #[error("stub {0} has not been generated")]
    MissingStub(&'static str),

    #[error("interpreter entry {0} has not been generated")]
    MissingEntry(String),

    #[error("template for {0}")]
    Template(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("frame walk error: {0}")]
    Frame(String),

    #[error("deoptimization error: {0}")]
    Deopt(String),

    #[error("unmapped address {0:#010x}")]
    Unmapped(u32),

    #[error("invalid bytecode {opcode:#04x} at bci {bci}")]
    InvalidBytecode { opcode: u8, bci: u32 },

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub type VmResult<T> = Result<T, VmError>;
