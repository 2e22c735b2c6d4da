//! Bitmap id allocator
//!
//! Hands out the lowest free id in `[0, capacity)`. Used for TSG ids,
//! channel ids and per-group subcontext ids.

use alloc::vec;
use alloc::vec::Vec;

use crate::{RmError, RmResult};

/// Fixed-capacity pool of small integer ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdPool {
    /// Bitmap of allocated ids (1 = allocated, 0 = free).
    bitmap: Vec<u64>,
    /// Number of ids the pool covers.
    capacity: u32,
    /// Number of allocated ids.
    allocated: u32,
}

impl IdPool {
    /// Create an empty pool covering `[0, capacity)`.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            bitmap: vec![0; (capacity as usize).div_ceil(64)],
            capacity,
            allocated: 0,
        }
    }

    /// Number of ids the pool covers.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of allocated ids.
    #[inline]
    #[must_use]
    pub const fn allocated(&self) -> u32 {
        self.allocated
    }

    /// Check if every id is taken.
    #[inline]
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.allocated >= self.capacity
    }

    /// Allocate the lowest free id.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` if the pool is full.
    pub fn allocate(&mut self) -> RmResult<u32> {
        for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit_idx = (!*word).trailing_zeros();
                let id = word_idx as u32 * 64 + bit_idx;
                if id >= self.capacity {
                    break;
                }
                *word |= 1u64 << bit_idx;
                self.allocated += 1;
                return Ok(id);
            }
        }
        Err(RmError::ResourceExhausted)
    }

    /// Allocate a specific id.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `id` is outside the pool
    /// - `InvalidState` if `id` is already allocated
    pub fn allocate_specific(&mut self, id: u32) -> RmResult<u32> {
        if id >= self.capacity {
            return Err(RmError::InvalidArgument);
        }
        if self.is_allocated(id) {
            return Err(RmError::InvalidState);
        }
        self.bitmap[(id / 64) as usize] |= 1u64 << (id % 64);
        self.allocated += 1;
        Ok(id)
    }

    /// Return an id to the pool. Freeing a free id does nothing.
    pub fn free(&mut self, id: u32) {
        if !self.is_allocated(id) {
            return;
        }
        self.bitmap[(id / 64) as usize] &= !(1u64 << (id % 64));
        self.allocated = self.allocated.saturating_sub(1);
    }

    /// Check if an id is allocated.
    #[must_use]
    pub fn is_allocated(&self, id: u32) -> bool {
        if id >= self.capacity {
            return false;
        }
        self.bitmap[(id / 64) as usize] & (1u64 << (id % 64)) != 0
    }
}
