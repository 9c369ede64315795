//! Shared vocabulary between generated code and the host.
//!
//! Layout constants, the thread descriptor, bytecode metadata, constant-pool
//! cache entries, profiling data and the runtime entry points that stubs
//! and templates call.

pub mod barrier;
pub mod basic_type;
pub mod bytecodes;
pub mod cpcache;
pub mod entries;
pub mod globals;
pub mod klass;
pub mod layout;
pub mod memory32;
pub mod method;
pub mod method_data;
pub mod safepoint;
pub mod shared_runtime;
pub mod thread;

pub use basic_type::{BasicType, TosState};
pub use bytecodes::Bytecode;
pub use entries::{RuntimeEntries, RuntimeEntry};
pub use globals::VmGlobals;
pub use memory32::{Arena, Memory32, SimMemory};
