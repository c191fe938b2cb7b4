use skiff_types::{Access, Asid, ThreadId, PAGE_SIZE};

/// Number of general-purpose registers carried across the boundary.
pub const XREG_COUNT: usize = 32;

/// CPU architectural state as it crosses the software/device boundary.
///
/// This is the complete transplant payload: the device needs nothing else to
/// resume a thread, and the software engine needs nothing else to take one
/// back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchState {
    pub xregs: [u64; XREG_COUNT],
    pub pc: u64,
    /// Condition flags (NZCV in bits 31:28).
    pub flags: u32,
    pub asid: Asid,
    /// Instructions the thread may retire on the device before it raises a
    /// transplant.
    pub icount_budget: u64,
    /// Instructions retired during the last device run.
    pub icount_executed: u64,
}

impl Default for ArchState {
    fn default() -> Self {
        ArchState {
            xregs: [0; XREG_COUNT],
            pc: 0,
            flags: 0,
            asid: 0,
            icount_budget: 0,
            icount_executed: 0,
        }
    }
}

/// The guest address is not mapped on the host side.
///
/// Recoverable: the faulting thread is transplanted so the software engine
/// can take the fault through its own MMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationMiss;

/// The software CPU emulator, as seen by the demand-paging layer.
///
/// The layer never walks guest page tables or decodes instructions itself;
/// everything architectural is delegated through this seam. `read_host_page`
/// / `write_host_page` are the capability through which the layer sees the
/// engine's backing memory; no raw pointers cross the boundary.
pub trait ExecutionEngine {
    /// Guest-virtual to host-virtual translation using the guest's current
    /// page tables for `thread`'s address space.
    fn translate(
        &mut self,
        thread: ThreadId,
        gva: u64,
        access: Access,
    ) -> Result<u64, TranslationMiss>;

    fn arch_state(&self, thread: ThreadId) -> ArchState;

    fn set_arch_state(&mut self, thread: ThreadId, state: &ArchState);

    /// Execute exactly one guest instruction on the software engine.
    fn single_step(&mut self, thread: ThreadId);

    fn current_asid(&self, thread: ThreadId) -> Asid;

    /// Read-only view of one page of the engine's backing memory.
    fn read_host_page(&self, hvp: u64) -> [u8; PAGE_SIZE];

    /// Install device-written page contents into the engine's backing memory.
    fn write_host_page(&mut self, hvp: u64, data: &[u8; PAGE_SIZE]);
}
