use skiff_types::PAGE_SIZE;

use crate::error::{PagingError, Result};

/// Round-robin allocator over the accelerator's fixed DRAM page pool.
///
/// Backed by a ring buffer sized to the pool: pages are handed out from the
/// head and recycled at the tail, so a page that was just written back is the
/// last to be reused. `allocated + free == capacity` holds at all times.
#[derive(Debug)]
pub struct FreePagePool {
    slots: Vec<u64>,
    head: usize,
    free: usize,
}

impl FreePagePool {
    /// Build a pool of `capacity` pages starting at `base` in device DRAM.
    pub fn new(capacity: usize, base: u64) -> FreePagePool {
        let slots = (0..capacity as u64)
            .map(|page| base + page * PAGE_SIZE as u64)
            .collect();
        FreePagePool {
            slots,
            head: 0,
            free: capacity,
        }
    }

    /// Take a free device page.
    ///
    /// An empty pool is an error, not a blocking condition: the fault path
    /// cannot evict on demand (the device picks its own victims), so the
    /// caller must treat this as fatal.
    pub fn allocate(&mut self) -> Result<u64> {
        if self.free == 0 {
            return Err(PagingError::PoolExhausted {
                capacity: self.slots.len(),
            });
        }
        let ppn = self.slots[self.head];
        self.head = (self.head + 1) % self.slots.len();
        self.free -= 1;
        Ok(ppn)
    }

    /// Return a previously allocated page to the pool.
    ///
    /// Recycling into a full pool means a page was freed twice; that is a
    /// logic error in the caller, not a runtime state, so it panics.
    pub fn recycle(&mut self, ppn: u64) {
        assert!(
            self.free < self.slots.len(),
            "recycled ppn {ppn:#x} into a full pool"
        );
        let tail = (self.head + self.free) % self.slots.len();
        self.slots[tail] = ppn;
        self.free += 1;
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn free_pages(&self) -> usize {
        self.free
    }
}
