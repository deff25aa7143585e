//! Slab allocator for per-frame records.
//!
//! Slots are handed out by index and recycled through a free list. Releasing a
//! slot drops the record in it, which unlinks every history and lattice
//! reference the record held.

use crate::constants::pool::TOKEN_RESERVE_BLOCK;
use crate::types::TokenId;

/// A generic slab pool with block-wise growth.
pub struct SlabPool<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    block_size: usize,
    acquired: u64,
    released: u64,
}

/// Pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Records currently held.
    pub live: usize,
    /// Slots allocated so far.
    pub capacity: usize,
    /// Total acquisitions since creation.
    pub acquired: u64,
    /// Total releases since creation.
    pub released: u64,
}

impl<T> SlabPool<T> {
    /// Create a pool that grows by `block_size` slots when it runs dry.
    pub fn new(block_size: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            block_size: block_size.max(1),
            acquired: 0,
            released: 0,
        }
    }

    /// Add a block of slots; returns the first one and frees the rest.
    fn grow(&mut self) -> usize {
        let start = self.slots.len();
        let end = start + self.block_size;
        self.slots.resize_with(end, || None);
        // Lowest index on top of the free list.
        self.free.extend((start + 1..end).rev());
        start
    }

    /// Store `record` in a free slot.
    pub fn acquire(&mut self, record: T) -> TokenId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => self.grow(),
        };
        self.slots[index] = Some(record);
        self.acquired += 1;
        TokenId(index)
    }

    /// Drop the record in `id` and recycle the slot.
    pub fn release(&mut self, id: TokenId) {
        drop(self.take(id));
    }

    /// Remove the record from `id` and recycle the slot.
    ///
    /// # Panics
    /// If `id` is not live; the caller's bookkeeping is corrupt at that point.
    pub fn take(&mut self, id: TokenId) -> T {
        let record = self.slots.get_mut(id.0).and_then(Option::take);
        match record {
            Some(record) => {
                self.free.push(id.0);
                self.released += 1;
                record
            }
            None => panic!("{} is not a live pool entry", id),
        }
    }

    /// Overwrite the record in a live slot, returning the old one.
    pub fn replace(&mut self, id: TokenId, record: T) -> T {
        std::mem::replace(self.get_mut(id), record)
    }

    pub fn get(&self, id: TokenId) -> &T {
        match self.slots.get(id.0).and_then(Option::as_ref) {
            Some(record) => record,
            None => panic!("{} is not a live pool entry", id),
        }
    }

    pub fn get_mut(&mut self, id: TokenId) -> &mut T {
        match self.slots.get_mut(id.0).and_then(Option::as_mut) {
            Some(record) => record,
            None => panic!("{} is not a live pool entry", id),
        }
    }

    pub fn contains(&self, id: TokenId) -> bool {
        matches!(self.slots.get(id.0), Some(Some(_)))
    }

    /// Number of live records.
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live: self.live(),
            capacity: self.slots.len(),
            acquired: self.acquired,
            released: self.released,
        }
    }
}

impl<T> Default for SlabPool<T> {
    fn default() -> Self {
        Self::new(TOKEN_RESERVE_BLOCK)
    }
}
