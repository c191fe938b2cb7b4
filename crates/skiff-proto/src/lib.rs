#![forbid(unsafe_code)]

//! Wire protocol between the emulator and the accelerator's MMU.
//!
//! Every message travels as one fixed 32-byte little-endian frame:
//!
//! ```text
//! offset  field
//!  0..4   message type tag
//!  4..8   ASID
//!  8..16  guest virtual page base (offset bits zero, kernel half
//!         sign-extended)
//! 16..20  permission, or shootdown flags for EvictRequest
//! 20..24  thread slot / modified flag (type-specific)
//! 24..32  device physical page address (type-specific)
//! ```
//!
//! Three kinds flow device→host (`PageFaultNotify`, `EvictNotify`,
//! `EvictDone`) and two host→device (`MissReply`, `EvictRequest`). Frames
//! with an unknown tag or a malformed field are decode errors; the transport
//! guarantees whole frames, so there are no partial reads to recover from.

use bitflags::bitflags;
use thiserror::Error;

use skiff_types::{page_base, Access, Asid, PageKey, ThreadId};

/// Size of one encoded message frame.
pub const FRAME_BYTES: usize = 32;

const TAG_PAGE_FAULT_NOTIFY: u32 = 0;
const TAG_EVICT_NOTIFY: u32 = 1;
const TAG_EVICT_DONE: u32 = 2;
const TAG_MISS_REPLY: u32 = 3;
const TAG_EVICT_REQUEST: u32 = 4;

pub type Result<T> = std::result::Result<T, ProtoError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("unknown message type tag {0}")]
    UnknownType(u32),

    #[error("invalid permission encoding {0}")]
    InvalidPermission(u32),

    #[error("invalid modified flag {0}")]
    InvalidModifiedFlag(u32),

    #[error("invalid eviction flags {0:#x}")]
    InvalidEvictFlags(u32),

    #[error("ASID {0:#x} exceeds 15 bits")]
    AsidOutOfRange(u32),
}

bitflags! {
    /// Device TLBs to shoot down alongside a host-requested eviction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EvictFlags: u32 {
        const ITLB = 1 << 0;
        const DTLB = 1 << 1;
    }
}

/// One protocol message, already validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Device missed a translation and parked the faulting thread.
    PageFaultNotify {
        asid: Asid,
        gvp: u64,
        perm: Access,
        thread: ThreadId,
    },
    /// Device is giving up a page. If `modified`, an [`Message::EvictDone`]
    /// with the written-back contents follows; otherwise this is terminal.
    EvictNotify {
        asid: Asid,
        gvp: u64,
        perm: Access,
        modified: bool,
    },
    /// Writeback for a modified eviction completed; the page at `ppn` holds
    /// the device's final contents.
    EvictDone {
        asid: Asid,
        gvp: u64,
        perm: Access,
        ppn: u64,
    },
    /// Host resolved a fault: the translation now lives at `ppn` and
    /// `thread` may resume.
    MissReply {
        asid: Asid,
        gvp: u64,
        perm: Access,
        thread: ThreadId,
        ppn: u64,
    },
    /// Host-initiated forced eviction (flush API).
    EvictRequest {
        asid: Asid,
        gvp: u64,
        flags: EvictFlags,
    },
}

impl Message {
    /// Reply to a fault whose mapping is recorded under `key`.
    pub fn miss_reply(key: PageKey, thread: ThreadId, ppn: u64) -> Message {
        Message::MissReply {
            asid: key.asid(),
            gvp: key.guest_page(),
            perm: key.perm(),
            thread,
            ppn,
        }
    }

    /// Forced-eviction request for the translation recorded under `key`.
    ///
    /// The request names only (ASID, page): the device tears down whichever
    /// permission it holds the page under and says which in its notify.
    pub fn evict_request(key: PageKey, flags: EvictFlags) -> Message {
        Message::EvictRequest {
            asid: key.asid(),
            gvp: key.guest_page(),
            flags,
        }
    }

    /// The (ASID, guest page) pair every message kind carries.
    pub fn guest_page(&self) -> (Asid, u64) {
        match *self {
            Message::PageFaultNotify { asid, gvp, .. }
            | Message::EvictNotify { asid, gvp, .. }
            | Message::EvictDone { asid, gvp, .. }
            | Message::MissReply { asid, gvp, .. }
            | Message::EvictRequest { asid, gvp, .. } => (asid, gvp),
        }
    }

    /// The packed mapping key, for the kinds that carry a permission.
    pub fn key(&self) -> Option<PageKey> {
        match *self {
            Message::PageFaultNotify {
                asid, gvp, perm, ..
            }
            | Message::EvictNotify {
                asid, gvp, perm, ..
            }
            | Message::EvictDone {
                asid, gvp, perm, ..
            }
            | Message::MissReply {
                asid, gvp, perm, ..
            } => Some(PageKey::pack(gvp, asid, perm)),
            Message::EvictRequest { .. } => None,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_BYTES] {
        let mut frame = [0u8; FRAME_BYTES];
        let (tag, asid, gvp) = match *self {
            Message::PageFaultNotify { asid, gvp, .. } => (TAG_PAGE_FAULT_NOTIFY, asid, gvp),
            Message::EvictNotify { asid, gvp, .. } => (TAG_EVICT_NOTIFY, asid, gvp),
            Message::EvictDone { asid, gvp, .. } => (TAG_EVICT_DONE, asid, gvp),
            Message::MissReply { asid, gvp, .. } => (TAG_MISS_REPLY, asid, gvp),
            Message::EvictRequest { asid, gvp, .. } => (TAG_EVICT_REQUEST, asid, gvp),
        };
        frame[0..4].copy_from_slice(&tag.to_le_bytes());
        frame[4..8].copy_from_slice(&u32::from(asid).to_le_bytes());
        frame[8..16].copy_from_slice(&page_base(gvp).to_le_bytes());
        match *self {
            Message::PageFaultNotify { perm, thread, .. } => {
                frame[16..20].copy_from_slice(&(perm.bits() as u32).to_le_bytes());
                frame[20..24].copy_from_slice(&thread.to_le_bytes());
            }
            Message::EvictNotify { perm, modified, .. } => {
                frame[16..20].copy_from_slice(&(perm.bits() as u32).to_le_bytes());
                frame[20..24].copy_from_slice(&u32::from(modified).to_le_bytes());
            }
            Message::EvictDone { perm, ppn, .. } => {
                frame[16..20].copy_from_slice(&(perm.bits() as u32).to_le_bytes());
                frame[24..32].copy_from_slice(&ppn.to_le_bytes());
            }
            Message::MissReply {
                perm, thread, ppn, ..
            } => {
                frame[16..20].copy_from_slice(&(perm.bits() as u32).to_le_bytes());
                frame[20..24].copy_from_slice(&thread.to_le_bytes());
                frame[24..32].copy_from_slice(&ppn.to_le_bytes());
            }
            Message::EvictRequest { flags, .. } => {
                frame[16..20].copy_from_slice(&flags.bits().to_le_bytes());
            }
        }
        frame
    }

    pub fn decode(frame: &[u8; FRAME_BYTES]) -> Result<Message> {
        let tag = read_u32(frame, 0);
        let asid_raw = read_u32(frame, 4);
        if asid_raw > 0x7fff {
            return Err(ProtoError::AsidOutOfRange(asid_raw));
        }
        let asid = asid_raw as Asid;
        let gvp = page_base(read_u64(frame, 8));

        match tag {
            TAG_PAGE_FAULT_NOTIFY => Ok(Message::PageFaultNotify {
                asid,
                gvp,
                perm: read_perm(frame)?,
                thread: read_u32(frame, 20),
            }),
            TAG_EVICT_NOTIFY => {
                let modified = match read_u32(frame, 20) {
                    0 => false,
                    1 => true,
                    other => return Err(ProtoError::InvalidModifiedFlag(other)),
                };
                Ok(Message::EvictNotify {
                    asid,
                    gvp,
                    perm: read_perm(frame)?,
                    modified,
                })
            }
            TAG_EVICT_DONE => Ok(Message::EvictDone {
                asid,
                gvp,
                perm: read_perm(frame)?,
                ppn: read_u64(frame, 24),
            }),
            TAG_MISS_REPLY => Ok(Message::MissReply {
                asid,
                gvp,
                perm: read_perm(frame)?,
                thread: read_u32(frame, 20),
                ppn: read_u64(frame, 24),
            }),
            TAG_EVICT_REQUEST => {
                let raw = read_u32(frame, 16);
                let flags = EvictFlags::from_bits(raw)
                    .ok_or(ProtoError::InvalidEvictFlags(raw))?;
                Ok(Message::EvictRequest { asid, gvp, flags })
            }
            other => Err(ProtoError::UnknownType(other)),
        }
    }
}

fn read_u32(frame: &[u8; FRAME_BYTES], offset: usize) -> u32 {
    u32::from_le_bytes(frame[offset..offset + 4].try_into().unwrap())
}

fn read_u64(frame: &[u8; FRAME_BYTES], offset: usize) -> u64 {
    u64::from_le_bytes(frame[offset..offset + 8].try_into().unwrap())
}

fn read_perm(frame: &[u8; FRAME_BYTES]) -> Result<Access> {
    let raw = read_u32(frame, 16);
    Access::from_bits(raw as u64).ok_or(ProtoError::InvalidPermission(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_notify_round_trips_with_kernel_address() {
        let msg = Message::PageFaultNotify {
            asid: 0x42,
            gvp: 0xffff_8000_1234_5000,
            perm: Access::Fetch,
            thread: 3,
        };
        let frame = msg.encode();
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn miss_reply_key_matches_its_fields() {
        let key = PageKey::pack(0x7f00_2000, 9, Access::Store);
        let msg = Message::miss_reply(key, 1, 0x44_000);
        assert_eq!(msg.key(), Some(key));
        let frame = msg.encode();
        match Message::decode(&frame).unwrap() {
            Message::MissReply {
                thread, ppn, perm, ..
            } => {
                assert_eq!(thread, 1);
                assert_eq!(ppn, 0x44_000);
                assert_eq!(perm, Access::Store);
            }
            other => panic!("decoded wrong kind: {other:?}"),
        }
    }

    #[test]
    fn evict_request_carries_shootdown_flags_and_no_key() {
        let key = PageKey::pack(0x1000, 2, Access::Load);
        let msg = Message::evict_request(key, EvictFlags::ITLB | EvictFlags::DTLB);
        assert_eq!(msg.key(), None);
        let frame = msg.encode();
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn offset_bits_never_reach_the_wire() {
        let msg = Message::EvictNotify {
            asid: 1,
            gvp: 0x1fff, // deliberately unaligned
            perm: Access::Load,
            modified: true,
        };
        let (_, gvp) = Message::decode(&msg.encode()).unwrap().guest_page();
        assert_eq!(gvp, 0x1000);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let mut frame = Message::EvictNotify {
            asid: 1,
            gvp: 0x1000,
            perm: Access::Load,
            modified: false,
        }
        .encode();

        frame[0] = 0x7f;
        assert_eq!(Message::decode(&frame), Err(ProtoError::UnknownType(0x7f)));

        frame[0] = TAG_EVICT_NOTIFY as u8;
        frame[16] = 3;
        assert_eq!(
            Message::decode(&frame),
            Err(ProtoError::InvalidPermission(3))
        );

        frame[16] = 0;
        frame[20] = 2;
        assert_eq!(
            Message::decode(&frame),
            Err(ProtoError::InvalidModifiedFlag(2))
        );
    }
}
