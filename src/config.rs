//! Runtime configuration types.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{VmError, VmResult};
use crate::runtime::barrier::{BarrierSet, CARD_SHIFT};

/// CPU features the generators may rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CpuFeatures {
    /// SSE level (0 = none, 1 = SSE, 2 = SSE2, 3 = SSE3, 4 = SSE4.x)
    pub use_sse: u8,
    /// AVX level (0 = none, 2 = AVX2)
    pub use_avx: u8,
    pub mmx: bool,
    /// AES-NI
    pub aes: bool,
    /// PCLMULQDQ
    pub clmul: bool,
}

impl Default for CpuFeatures {
    fn default() -> Self {
        Self {
            use_sse: 2,
            use_avx: 0,
            mmx: true,
            aes: true,
            clmul: true,
        }
    }
}

impl CpuFeatures {
    /// Features of the machine running this process.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub fn detect() -> Self {
        let use_sse = if std::arch::is_x86_feature_detected!("sse4.1") {
            4
        } else if std::arch::is_x86_feature_detected!("sse3") {
            3
        } else if std::arch::is_x86_feature_detected!("sse2") {
            2
        } else if std::arch::is_x86_feature_detected!("sse") {
            1
        } else {
            0
        };
        Self {
            use_sse,
            use_avx: if std::arch::is_x86_feature_detected!("avx2") { 2 } else { 0 },
            mmx: std::arch::is_x86_feature_detected!("mmx"),
            aes: std::arch::is_x86_feature_detected!("aes"),
            clmul: std::arch::is_x86_feature_detected!("pclmulqdq"),
        }
    }

    /// Baseline features on hosts that cannot run the generated code.
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    pub fn detect() -> Self {
        Self::default()
    }

    /// Widest vector copy the array-copy stubs may use.
    pub fn copy_width(&self) -> CopyWidth {
        if self.use_avx >= 2 {
            CopyWidth::Avx32
        } else if self.use_sse >= 2 {
            CopyWidth::Sse16
        } else if self.mmx {
            CopyWidth::Mmx8
        } else {
            CopyWidth::Rep4
        }
    }
}

/// Bulk-copy strategy of the array-copy loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CopyWidth {
    Avx32,
    Sse16,
    Mmx8,
    Rep4,
}

/// Where the simulated sections live in the 32-bit address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AddressLayout {
    pub code_base: u32,
    pub code_size: u32,
    pub data_base: u32,
    pub data_size: u32,
    pub metaspace_base: u32,
    pub metaspace_size: u32,
    /// Distance from a method's bytecodes to its resolved-opcode sideband
    pub resolved_opcode_delta: u32,
    /// First synthetic runtime entry address
    pub runtime_base: u32,
    pub heap_base: u32,
    pub heap_size: u32,
    pub card_table_base: u32,
}

impl Default for AddressLayout {
    fn default() -> Self {
        Self {
            code_base: 0x0800_0000,
            code_size: 0x0010_0000,
            data_base: 0x0900_0000,
            data_size: 0x0002_0000,
            metaspace_base: 0x1000_0000,
            metaspace_size: 0x0010_0000,
            resolved_opcode_delta: 0x0100_0000,
            runtime_base: 0x7000_0000,
            heap_base: 0x2000_0000,
            heap_size: 0x0100_0000,
            card_table_base: 0x0A00_0000,
        }
    }
}

impl AddressLayout {
    fn regions(&self) -> [(&'static str, u32, u32); 6] {
        [
            ("code", self.code_base, self.code_size),
            ("data", self.data_base, self.data_size),
            ("metaspace", self.metaspace_base, self.metaspace_size),
            (
                "sideband",
                self.metaspace_base.wrapping_add(self.resolved_opcode_delta),
                self.metaspace_size,
            ),
            ("heap", self.heap_base, self.heap_size),
            (
                "card table",
                self.card_table_base,
                self.heap_size >> CARD_SHIFT,
            ),
        ]
    }
}

/// Runtime configuration for stub and interpreter generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub cpu: CpuFeatures,
    pub barrier: BarrierSet,
    /// Collect per-bytecode profiles in method data
    pub profile_interpreter: bool,
    /// Quicken bytecodes on first execution
    pub rewrite_bytecodes: bool,
    /// Fuse `iload`/`aload_0` pairs
    pub rewrite_frequent_pairs: bool,
    pub use_on_stack_replacement: bool,
    /// Allocate from the thread-local buffer before the shared eden
    pub use_tlab: bool,
    pub verify_oops: bool,
    pub use_crc32_intrinsics: bool,
    pub use_aes_intrinsics: bool,
    pub use_ghash_intrinsics: bool,
    /// `lookupswitch` tables with at least this many pairs use binary search
    pub binary_switch_threshold: u32,
    pub backedge_notify_freq_log: u32,
    pub invocation_notify_freq_log: u32,
    /// Invocations before a method counts as hot
    pub compile_threshold: u32,
    /// Pages that must be free below the stack pointer at method entry
    pub stack_shadow_pages: u32,
    /// Multiprocessor: emit `lock` prefixes and store-load barriers
    pub is_mp: bool,
    pub layout: AddressLayout,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let layout = AddressLayout::default();
        Self {
            cpu: CpuFeatures::default(),
            barrier: BarrierSet::CardTable {
                byte_map_base: layout
                    .card_table_base
                    .wrapping_sub(layout.heap_base >> CARD_SHIFT),
                card_shift: CARD_SHIFT,
            },
            profile_interpreter: true,
            rewrite_bytecodes: true,
            rewrite_frequent_pairs: true,
            use_on_stack_replacement: true,
            use_tlab: true,
            verify_oops: false,
            use_crc32_intrinsics: true,
            use_aes_intrinsics: true,
            use_ghash_intrinsics: true,
            binary_switch_threshold: 5,
            backedge_notify_freq_log: 10,
            invocation_notify_freq_log: 7,
            compile_threshold: 10_000,
            stack_shadow_pages: 3,
            is_mp: true,
            layout,
        }
    }
}

impl RuntimeConfig {
    /// Load a configuration from a TOML file; missing keys keep their defaults.
    pub fn load(path: &Path) -> VmResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| VmError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> VmResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| VmError::Config(e.to_string()))?;
        config.validate()
    }

    /// Check consistency and drop intrinsics the CPU cannot support.
    pub fn validate(mut self) -> VmResult<Self> {
        if self.cpu.use_sse > 4 || !matches!(self.cpu.use_avx, 0 | 2) {
            return Err(VmError::Config(format!(
                "unsupported SSE/AVX level {}/{}",
                self.cpu.use_sse, self.cpu.use_avx
            )));
        }
        if self.use_aes_intrinsics && !(self.cpu.aes && self.cpu.use_sse >= 2) {
            log::warn!("AES intrinsics need AES-NI and SSE2; disabled");
            self.use_aes_intrinsics = false;
        }
        if self.use_ghash_intrinsics && !(self.cpu.clmul && self.cpu.use_sse >= 2) {
            log::warn!("GHASH intrinsics need PCLMULQDQ and SSE2; disabled");
            self.use_ghash_intrinsics = false;
        }
        if self.cpu.use_avx > 0 && self.cpu.use_sse < 2 {
            log::warn!("AVX without SSE2; AVX copies disabled");
            self.cpu.use_avx = 0;
        }
        if self.binary_switch_threshold == 0 {
            return Err(VmError::Config("binary_switch_threshold must be positive".into()));
        }
        if self.backedge_notify_freq_log > 28 || self.invocation_notify_freq_log > 28 {
            return Err(VmError::Config("notify frequency log must be at most 28".into()));
        }
        let l = &self.layout;
        if l.resolved_opcode_delta < l.metaspace_size {
            return Err(VmError::Config(
                "resolved_opcode_delta must exceed metaspace_size".into(),
            ));
        }
        let regions = l.regions();
        for (i, &(a, a_base, a_size)) in regions.iter().enumerate() {
            if a_size == 0 || a_base as u64 + a_size as u64 > 1 << 32 {
                return Err(VmError::Config(format!("{a} section is empty or wraps")));
            }
            for &(b, b_base, b_size) in &regions[i + 1..] {
                let overlap = (a_base as u64) < b_base as u64 + b_size as u64
                    && (b_base as u64) < a_base as u64 + a_size as u64;
                if overlap {
                    return Err(VmError::Config(format!("{a} and {b} sections overlap")));
                }
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = RuntimeConfig::default().validate().unwrap();
        assert_eq!(config.binary_switch_threshold, 5);
        assert_eq!(config.cpu.copy_width(), CopyWidth::Sse16);
    }

    #[test]
    fn test_load_overrides_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "profile_interpreter = false\n\
             [cpu]\nuse_sse = 0\nmmx = false\n\
             [barrier]\nkind = \"g1_satb\"\nbyte_map_base = 4096\ncard_shift = 9\nregion_log = 20"
        )
        .unwrap();
        let config = RuntimeConfig::load(file.path()).unwrap();
        assert!(!config.profile_interpreter);
        assert_eq!(config.cpu.copy_width(), CopyWidth::Rep4);
        assert!(config.barrier.has_pre_barrier());
        // AES needs SSE2.
        assert!(!config.use_aes_intrinsics);
        assert!(config.rewrite_bytecodes);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(RuntimeConfig::from_toml("use_jit = true").is_err());
        assert!(RuntimeConfig::from_toml("[cpu]\nsse = 2").is_err());
    }

    #[test]
    fn test_overlapping_sections_rejected() {
        let mut config = RuntimeConfig::default();
        config.layout.data_base = config.layout.code_base + 0x100;
        assert!(config.validate().is_err());
    }
}
