use skiff_types::{PageKey, ThreadId};

use crate::error::{PagingError, Result};

/// Capacity of each pending-request table.
///
/// Sized to the maximum number of accelerator thread slots that can have a
/// round-trip outstanding at once; overflow is a protocol error.
pub const PENDING_CAPACITY: usize = 32;

/// Fixed-capacity slot arena. Entries keep their slot until removed and free
/// slots are tracked by index. Each entry carries a monotonic arrival
/// sequence number, so drains come back in arrival order even after freed
/// slots have been reused.
#[derive(Debug)]
struct SlotArena<T> {
    name: &'static str,
    slots: Vec<Option<(u64, T)>>,
    free: Vec<usize>,
    next_seq: u64,
}

impl<T> SlotArena<T> {
    fn new(name: &'static str) -> SlotArena<T> {
        SlotArena {
            name,
            slots: (0..PENDING_CAPACITY).map(|_| None).collect(),
            free: (0..PENDING_CAPACITY).rev().collect(),
            next_seq: 0,
        }
    }

    fn insert(&mut self, entry: T) -> Result<()> {
        let Some(slot) = self.free.pop() else {
            return Err(PagingError::PendingOverflow {
                table: self.name,
                capacity: PENDING_CAPACITY,
            });
        };
        debug_assert!(self.slots[slot].is_none());
        self.slots[slot] = Some((self.next_seq, entry));
        self.next_seq += 1;
        Ok(())
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.as_ref().is_some_and(|(_, entry)| pred(entry)) {
                self.free.push(index);
                return slot.take().map(|(_, entry)| entry);
            }
        }
        None
    }

    fn drain_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut drained = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.as_ref().is_some_and(|(_, entry)| pred(entry)) {
                self.free.push(index);
                drained.push(slot.take().unwrap());
            }
        }
        drained.sort_by_key(|(seq, _)| *seq);
        drained.into_iter().map(|(_, entry)| entry).collect()
    }

    fn any(&self, mut pred: impl FnMut(&T) -> bool) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.as_ref().is_some_and(|(_, entry)| pred(entry)))
    }

    fn len(&self) -> usize {
        PENDING_CAPACITY - self.free.len()
    }
}

/// Evictions the device has announced but not yet written back.
///
/// An entry exists from the `EvictNotify` of a modified page until its
/// `EvictDone` arrives. While a host page appears here, faults for it must
/// be parked rather than answered.
#[derive(Debug)]
pub struct PendingEvictions {
    arena: SlotArena<(PageKey, u64)>,
}

impl PendingEvictions {
    pub fn new() -> PendingEvictions {
        PendingEvictions {
            arena: SlotArena::new("pending evictions"),
        }
    }

    pub fn add(&mut self, key: PageKey, hvp: u64) -> Result<()> {
        if self.arena.any(|(pending, _)| *pending == key) {
            return Err(PagingError::DuplicateKey {
                table: "pending evictions",
                key: format!("{key:?}"),
                dump: format!("{:?}", self.arena),
            });
        }
        self.arena.insert((key, hvp))
    }

    /// Clear the entry once the writeback completed. The notify always
    /// precedes the done message, so a miss here is a protocol error.
    pub fn clear(&mut self, key: PageKey) -> Result<()> {
        self.arena
            .remove_where(|(pending, _)| *pending == key)
            .map(|_| ())
            .ok_or_else(|| PagingError::PendingMissing {
                table: "pending evictions",
                key: format!("{key:?}"),
            })
    }

    /// Is any eviction of this host page still in flight?
    pub fn has_hvp(&self, hvp: u64) -> bool {
        self.arena.any(|(_, pending)| *pending == hvp)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.arena.len() == 0
    }
}

impl Default for PendingEvictions {
    fn default() -> Self {
        Self::new()
    }
}

/// A page fault withheld because its host page was mid-eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParkedFault {
    pub key: PageKey,
    pub hvp: u64,
    pub thread: ThreadId,
}

/// Faults parked until an in-flight eviction of the same host page clears.
///
/// The dispatcher replays them the instant the matching writeback completes,
/// which resolves the race where two guest mappings fight over one host page
/// during an eviction round-trip.
#[derive(Debug)]
pub struct ParkedFaults {
    arena: SlotArena<ParkedFault>,
}

impl ParkedFaults {
    pub fn new() -> ParkedFaults {
        ParkedFaults {
            arena: SlotArena::new("parked faults"),
        }
    }

    pub fn park(&mut self, fault: ParkedFault) -> Result<()> {
        if self.arena.any(|parked| parked.key == fault.key) {
            return Err(PagingError::DuplicateKey {
                table: "parked faults",
                key: format!("{:?}", fault.key),
                dump: format!("{:?}", self.arena),
            });
        }
        self.arena.insert(fault)
    }

    /// Take every fault parked on `hvp`, in arrival order.
    pub fn take_matching(&mut self, hvp: u64) -> Vec<ParkedFault> {
        self.arena.drain_where(|parked| parked.hvp == hvp)
    }

    pub fn has_hvp(&self, hvp: u64) -> bool {
        self.arena.any(|parked| parked.hvp == hvp)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.arena.len() == 0
    }
}

impl Default for ParkedFaults {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_types::Access;

    fn key(gva: u64) -> PageKey {
        PageKey::pack(gva, 1, Access::Store)
    }

    #[test]
    fn eviction_lifecycle() {
        let mut pending = PendingEvictions::new();
        pending.add(key(0x1000), 0x9000).unwrap();
        assert!(pending.has_hvp(0x9000));
        assert!(!pending.has_hvp(0xa000));
        pending.clear(key(0x1000)).unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn clearing_an_unannounced_eviction_is_an_error() {
        let mut pending = PendingEvictions::new();
        assert!(matches!(
            pending.clear(key(0x1000)),
            Err(PagingError::PendingMissing { .. })
        ));
    }

    #[test]
    fn overflow_is_a_checked_error() {
        let mut pending = PendingEvictions::new();
        for i in 0..PENDING_CAPACITY as u64 {
            pending.add(key(i << 12), i).unwrap();
        }
        assert!(matches!(
            pending.add(key(0xdead_0000), 0xdead),
            Err(PagingError::PendingOverflow { capacity, .. }) if capacity == PENDING_CAPACITY
        ));
        assert_eq!(pending.len(), PENDING_CAPACITY);
    }

    #[test]
    fn parked_faults_drain_only_their_page() {
        let mut parked = ParkedFaults::new();
        parked
            .park(ParkedFault {
                key: key(0x1000),
                hvp: 0x9000,
                thread: 0,
            })
            .unwrap();
        parked
            .park(ParkedFault {
                key: key(0x2000),
                hvp: 0xa000,
                thread: 1,
            })
            .unwrap();

        let drained = parked.take_matching(0x9000);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].thread, 0);
        assert_eq!(parked.len(), 1);
        assert!(parked.take_matching(0x9000).is_empty());
    }

    #[test]
    fn drains_keep_arrival_order_across_slot_reuse() {
        let mut parked = ParkedFaults::new();
        // Churn the low slots so the free list no longer hands them out in
        // index order.
        for i in 0..2u64 {
            parked
                .park(ParkedFault {
                    key: key(0x10_0000 + (i << 12)),
                    hvp: 0x9000,
                    thread: 0,
                })
                .unwrap();
        }
        parked.take_matching(0x9000);

        for thread in 10..13u32 {
            parked
                .park(ParkedFault {
                    key: key(0x20_0000 + (u64::from(thread) << 12)),
                    hvp: 0xa000,
                    thread,
                })
                .unwrap();
        }
        let drained: Vec<u32> = parked
            .take_matching(0xa000)
            .iter()
            .map(|fault| fault.thread)
            .collect();
        assert_eq!(drained, vec![10, 11, 12]);
    }

    #[test]
    fn freed_slots_are_reusable() {
        let mut parked = ParkedFaults::new();
        for round in 0..3u64 {
            for i in 0..PENDING_CAPACITY as u64 {
                parked
                    .park(ParkedFault {
                        key: key((round << 40) | (i << 12)),
                        hvp: i,
                        thread: i as u32,
                    })
                    .unwrap();
            }
            for i in 0..PENDING_CAPACITY as u64 {
                assert_eq!(parked.take_matching(i).len(), 1);
            }
        }
        assert!(parked.is_empty());
    }
}
