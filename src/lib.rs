//! tmplvm - a template interpreter and stub generator for 32-bit x86.
//!
//! The crate emits IA-32 machine code for the runtime stubs (call bridge,
//! array copies, crypto loops) and for a template interpreter whose
//! dispatch tables live in a simulated data section. Frame walking and
//! deoptimization work on any `Memory32`, so everything except running the
//! code is testable on any host.

pub mod asm;
pub mod code_cache;
pub mod config;
pub mod deopt;
pub mod error;
pub mod frame;
pub mod interpreter;
pub mod runtime;
pub mod stubs;
pub mod universe;

pub use config::{AddressLayout, CpuFeatures, RuntimeConfig};
pub use error::{VmError, VmResult};
pub use universe::{GenerationSummary, Universe};
