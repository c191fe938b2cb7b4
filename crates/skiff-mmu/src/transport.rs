use skiff_proto::FRAME_BYTES;
use skiff_types::{ThreadId, PAGE_SIZE};

use crate::engine::ArchState;

/// The accelerator, as seen through its transport.
///
/// Message traffic is frame-granular and bounded: `send_frame` queues one
/// encoded protocol frame, `try_receive_frame` drains at most one. Page and
/// state transfers are synchronous bulk operations over shared DRAM; the
/// device guarantees they complete, so none of these return errors.
pub trait DeviceTransport {
    fn send_frame(&mut self, frame: &[u8; FRAME_BYTES]);

    fn try_receive_frame(&mut self) -> Option<[u8; FRAME_BYTES]>;

    /// Copy one page into device DRAM at `ppn`.
    fn push_page(&mut self, ppn: u64, data: &[u8; PAGE_SIZE]);

    /// Copy one page out of device DRAM at `ppn`.
    fn pull_page(&mut self, ppn: u64) -> [u8; PAGE_SIZE];

    fn push_state(&mut self, thread: ThreadId, state: &ArchState);

    fn pull_state(&mut self, thread: ThreadId) -> ArchState;

    /// Let `thread` run with the state last pushed.
    fn start(&mut self, thread: ThreadId);

    /// Halt `thread` and force its state to become pullable.
    fn stop(&mut self, thread: ThreadId);

    /// Bitmask of thread slots waiting to be transplanted back.
    fn pending_mask(&mut self) -> u32;
}
