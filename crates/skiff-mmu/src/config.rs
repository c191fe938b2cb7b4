/// How aggressively the layer cross-checks the device against the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugMode {
    /// Trust the device; written-back pages land in emulator memory as-is.
    #[default]
    Off,
    /// Byte-compare every writeback and every transplanted register file,
    /// but never copy device memory back: the emulator executes the same
    /// instructions itself and its copy is authoritative.
    CompareNoSync,
    /// Compare like [`DebugMode::CompareNoSync`] and also copy the verified
    /// page back into emulator memory.
    CompareWithSync,
}

impl DebugMode {
    /// Whether pages and register files are byte-compared across substrates.
    #[inline]
    pub fn compares(self) -> bool {
        !matches!(self, DebugMode::Off)
    }

    /// Whether an eviction writeback is copied into emulator memory.
    #[inline]
    pub fn writes_back(self) -> bool {
        !matches!(self, DebugMode::CompareNoSync)
    }
}

/// Immutable-after-init configuration for the whole layer.
///
/// Built once by the embedder and handed to [`crate::Dispatcher::new`];
/// everything that mutates at runtime lives in the dispatcher itself.
#[derive(Debug, Clone)]
pub struct SkiffConfig {
    /// Master switch; when false every entry point is a no-op.
    pub enabled: bool,
    /// Number of guest-data pages in the accelerator's DRAM pool.
    pub dram_pages: usize,
    /// Device physical address of the first pool page.
    pub dram_base: u64,
    /// Hardware thread slots to drive (at most 32, the pending-mask width).
    pub thread_slots: usize,
    pub debug: DebugMode,
    /// Opportunistically answer a Load fault with Store permission when the
    /// mapping is writable, saving the later write fault.
    pub upgrade_load_faults: bool,
    /// Keep threads on the software engine after their first transplant
    /// instead of handing them back to the device.
    pub pure_singlestep: bool,
    /// Instruction budget granted to a thread each time it is pushed to the
    /// device; exhaustion raises a transplant.
    pub instruction_budget: u64,
}

impl Default for SkiffConfig {
    fn default() -> Self {
        SkiffConfig {
            enabled: true,
            dram_pages: 1024,
            dram_base: 0,
            thread_slots: 1,
            debug: DebugMode::Off,
            upgrade_load_faults: true,
            pure_singlestep: false,
            instruction_budget: 1 << 20,
        }
    }
}
