use thiserror::Error;

use skiff_paging::PagingError;
use skiff_proto::{Message, ProtoError};
use skiff_types::ThreadId;

pub type Result<T> = std::result::Result<T, MmuError>;

/// Errors surfaced by the dispatcher and the transplant controller.
///
/// Apart from [`MmuError::Paging`] wrapping a pool exhaustion, every variant
/// is fatal: each one means the two execution substrates disagree
/// about state the protocol was supposed to keep coherent, and continuing
/// would silently corrupt the guest.
#[derive(Debug, Error)]
pub enum MmuError {
    #[error(transparent)]
    Paging(#[from] PagingError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(
        "device page {ppn:#x} diverged from emulator page {hvp:#x}: \
         {mismatches} bytes differ, first at offset {first_offset:#x} \
         (device {device:#04x}, emulator {emulator:#04x})"
    )]
    PageMismatch {
        hvp: u64,
        ppn: u64,
        mismatches: usize,
        first_offset: usize,
        device: u8,
        emulator: u8,
    },

    #[error("architectural state diverged on thread {thread} (pc {pc:#x})")]
    ArchMismatch { thread: ThreadId, pc: u64 },

    #[error("thread {thread} stuck at pc {pc:#x} after two single steps")]
    StuckSingleStep { thread: ThreadId, pc: u64 },

    #[error("parked-message buffer overflow (capacity {capacity})")]
    ParkedMessageOverflow { capacity: usize },

    #[error("unexpected message from the device: {0:?}")]
    UnexpectedMessage(Message),

    #[error("fault parked on host page {hvp:#x} with no eviction in flight")]
    OrphanedParkedFault { hvp: u64 },

    #[error(
        "writeback named device page {reported:#x} but the shadow table \
         recorded {recorded:#x} for host page {hvp:#x}"
    )]
    WritebackPpnMismatch {
        hvp: u64,
        reported: u64,
        recorded: u64,
    },
}
