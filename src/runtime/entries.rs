//! Runtime entry points called from generated code.
//!
//! Generated code reaches the VM through `call rel32` to these addresses.
//! On hosts that cannot execute the code every entry gets a synthetic,
//! distinct address so call targets remain recognizable in the output.

use serde::Serialize;

macro_rules! runtime_entries {
    ($($variant:ident => $name:literal,)*) => {
        /// A VM function callable from stubs and templates.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum RuntimeEntry {
            $($variant,)*
        }

        impl RuntimeEntry {
            pub const ALL: &'static [RuntimeEntry] = &[$(RuntimeEntry::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(RuntimeEntry::$variant => $name,)*
                }
            }
        }
    };
}

runtime_entries! {
    // InterpreterRuntime
    Ldc => "InterpreterRuntime::ldc",
    ResolveLdc => "InterpreterRuntime::resolve_ldc",
    New => "InterpreterRuntime::_new",
    Newarray => "InterpreterRuntime::newarray",
    Anewarray => "InterpreterRuntime::anewarray",
    Multianewarray => "InterpreterRuntime::multianewarray",
    RegisterFinalizer => "InterpreterRuntime::register_finalizer",
    QuickenIoCc => "InterpreterRuntime::quicken_io_cc",
    ThrowAbstractMethodError => "InterpreterRuntime::throw_AbstractMethodError",
    ThrowIncompatibleClassChangeError => "InterpreterRuntime::throw_IncompatibleClassChangeError",
    ThrowStackOverflowError => "InterpreterRuntime::throw_StackOverflowError",
    ThrowArrayIndexOutOfBoundsException => "InterpreterRuntime::throw_ArrayIndexOutOfBoundsException",
    ThrowClassCastException => "InterpreterRuntime::throw_ClassCastException",
    CreateException => "InterpreterRuntime::create_exception",
    CreateKlassException => "InterpreterRuntime::create_klass_exception",
    ExceptionHandlerForException => "InterpreterRuntime::exception_handler_for_exception",
    ThrowPendingException => "InterpreterRuntime::throw_pending_exception",
    ResolveGetPut => "InterpreterRuntime::resolve_get_put",
    ResolveInvoke => "InterpreterRuntime::resolve_invoke",
    ResolveInvokehandle => "InterpreterRuntime::resolve_invokehandle",
    ResolveInvokedynamic => "InterpreterRuntime::resolve_invokedynamic",
    Monitorenter => "InterpreterRuntime::monitorenter",
    Monitorexit => "InterpreterRuntime::monitorexit",
    ThrowIllegalMonitorStateException => "InterpreterRuntime::throw_illegal_monitor_state_exception",
    NewIllegalMonitorStateException => "InterpreterRuntime::new_illegal_monitor_state_exception",
    Breakpoint => "InterpreterRuntime::_breakpoint",
    GetOriginalBytecodeAt => "InterpreterRuntime::get_original_bytecode_at",
    SetOriginalBytecodeAt => "InterpreterRuntime::set_original_bytecode_at",
    AtSafepoint => "InterpreterRuntime::at_safepoint",
    FrequencyCounterOverflow => "InterpreterRuntime::frequency_counter_overflow",
    ProfileMethod => "InterpreterRuntime::profile_method",
    BuildMethodCounters => "InterpreterRuntime::build_method_counters",
    UpdateMdpForRet => "InterpreterRuntime::update_mdp_for_ret",
    SlowSignatureHandler => "InterpreterRuntime::slow_signature_handler",
    // SharedRuntime
    D2i => "SharedRuntime::d2i",
    D2l => "SharedRuntime::d2l",
    F2i => "SharedRuntime::f2i",
    F2l => "SharedRuntime::f2l",
    Ldiv => "SharedRuntime::ldiv",
    Lrem => "SharedRuntime::lrem",
    Lmul => "SharedRuntime::lmul",
    Frem => "SharedRuntime::frem",
    Drem => "SharedRuntime::drem",
    Dsin => "SharedRuntime::dsin",
    Dcos => "SharedRuntime::dcos",
    Dtan => "SharedRuntime::dtan",
    Dexp => "SharedRuntime::dexp",
    Dpow => "SharedRuntime::dpow",
    Dlog => "SharedRuntime::dlog",
    Dlog10 => "SharedRuntime::dlog10",
    ExceptionHandlerForReturnAddress => "SharedRuntime::exception_handler_for_return_address",
    SharedThrowStackOverflowError => "SharedRuntime::throw_StackOverflowError",
    SharedThrowAbstractMethodError => "SharedRuntime::throw_AbstractMethodError",
    SharedThrowIncompatibleClassChangeError => "SharedRuntime::throw_IncompatibleClassChangeError",
    ThrowNullPointerExceptionAtCall => "SharedRuntime::throw_NullPointerException_at_call",
    OsrMigrationBegin => "SharedRuntime::OSR_migration_begin",
    OsrMigrationEnd => "SharedRuntime::OSR_migration_end",
    HandleUnsafeAccess => "SharedRuntime::handle_unsafe_access",
    Debug32 => "MacroAssembler::debug32",
    // Barriers
    G1WbPre => "SharedRuntime::g1_wb_pre",
    G1WbPost => "SharedRuntime::g1_wb_post",
    StaticWriteRefArrayPre => "BarrierSet::static_write_ref_array_pre",
    StaticWriteRefArrayPost => "BarrierSet::static_write_ref_array_post",
}

/// Addresses of every runtime entry.
#[derive(Debug, Clone)]
pub struct RuntimeEntries {
    addrs: Vec<u32>,
}

/// Spacing of synthetic entry addresses.
const SYNTHETIC_STRIDE: u32 = 16;

impl RuntimeEntries {
    /// Distinct synthetic addresses starting at `base`.
    pub fn synthetic(base: u32) -> Self {
        Self {
            addrs: (0..RuntimeEntry::ALL.len() as u32)
                .map(|i| base + i * SYNTHETIC_STRIDE)
                .collect(),
        }
    }

    /// Host implementations for the leaf helpers, synthetic addresses for
    /// everything that needs a full VM.
    #[cfg(target_arch = "x86")]
    pub fn native(synthetic_base: u32) -> Self {
        use super::shared_runtime as sr;
        let mut entries = Self::synthetic(synthetic_base);
        let leaf: &[(RuntimeEntry, usize)] = &[
            (RuntimeEntry::D2i, sr::d2i as usize),
            (RuntimeEntry::D2l, sr::d2l as usize),
            (RuntimeEntry::F2i, sr::f2i as usize),
            (RuntimeEntry::F2l, sr::f2l as usize),
            (RuntimeEntry::Ldiv, sr::ldiv as usize),
            (RuntimeEntry::Lrem, sr::lrem as usize),
            (RuntimeEntry::Lmul, sr::lmul as usize),
            (RuntimeEntry::Frem, sr::frem as usize),
            (RuntimeEntry::Drem, sr::drem as usize),
            (RuntimeEntry::Dsin, sr::dsin as usize),
            (RuntimeEntry::Dcos, sr::dcos as usize),
            (RuntimeEntry::Dtan, sr::dtan as usize),
            (RuntimeEntry::Dexp, sr::dexp as usize),
            (RuntimeEntry::Dpow, sr::dpow as usize),
            (RuntimeEntry::Dlog, sr::dlog as usize),
            (RuntimeEntry::Dlog10, sr::dlog10 as usize),
        ];
        for &(entry, addr) in leaf {
            entries.set(entry, addr as u32);
        }
        entries
    }

    pub fn address(&self, entry: RuntimeEntry) -> u32 {
        self.addrs[entry as usize]
    }

    pub fn set(&mut self, entry: RuntimeEntry, addr: u32) {
        self.addrs[entry as usize] = addr;
    }

    /// Which entry lives at `addr`.
    pub fn lookup(&self, addr: u32) -> Option<RuntimeEntry> {
        self.addrs
            .iter()
            .position(|&a| a == addr)
            .map(|i| RuntimeEntry::ALL[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_addresses_are_distinct() {
        let entries = RuntimeEntries::synthetic(0x7000_0000);
        let a = entries.address(RuntimeEntry::ResolveGetPut);
        let b = entries.address(RuntimeEntry::ResolveInvoke);
        assert_ne!(a, b);
        assert_eq!(entries.lookup(a), Some(RuntimeEntry::ResolveGetPut));
        assert_eq!(entries.lookup(0x1234), None);
    }

    #[test]
    fn test_override_entry() {
        let mut entries = RuntimeEntries::synthetic(0x7000_0000);
        entries.set(RuntimeEntry::D2i, 0x0804_1000);
        assert_eq!(entries.lookup(0x0804_1000), Some(RuntimeEntry::D2i));
        assert_eq!(RuntimeEntry::D2i.name(), "SharedRuntime::d2i");
    }
}
