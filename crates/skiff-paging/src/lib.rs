#![forbid(unsafe_code)]

//! Residency bookkeeping for guest pages living on the accelerator.
//!
//! The accelerator owns a small fixed pool of physical pages; the emulator's
//! memory is effectively unbounded. This crate tracks which guest pages are
//! currently resident on the device and under which guest mappings:
//!
//! - [`FreePagePool`]: round-robin allocator over the device's DRAM pages.
//! - [`InvertedPageTable`]: host page → every guest mapping resident for it
//!   (the synonym detector).
//! - [`TemporalPageTable`]: guest mapping → host page, the reverse index used
//!   when a device message names only the guest side.
//! - [`ShadowPageTable`]: host page → device page number.
//! - [`PendingEvictions`] / [`ParkedFaults`]: bounded association tables for
//!   round-trips still in flight, used to sequence faults that race with
//!   evictions of the same host page.
//!
//! Cross-table consistency (the synonym and bijection invariants) is the
//! dispatcher's job; each table here owns its storage outright and fails loud
//! with a full dump when asked about a key it does not hold. A missing key at
//! this layer means a lost message or a race the protocol was supposed to
//! prevent, never a recoverable miss.

mod error;
mod pending;
mod pool;
mod strict;
mod tables;

#[cfg(test)]
mod proptests;

pub use crate::error::{PagingError, Result};
pub use crate::pending::{ParkedFault, ParkedFaults, PendingEvictions, PENDING_CAPACITY};
pub use crate::pool::FreePagePool;
pub use crate::strict::StrictMap;
pub use crate::tables::{InvertedPageTable, Residency, ShadowPageTable, TemporalPageTable};
