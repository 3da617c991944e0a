//! Tracks which heights have a block on disk, and how far the consecutive
//! run above the validated tip reaches.
//!
//! The bitmap is a cache over the block store: blocks are marked here when
//! their file lands on disk and cleared again once validation moves past
//! them. Heights at or below the validated tip are implicitly available,
//! whether or not the file still exists (it may have been pruned).

use ibis_common::bitset::DenseBits;

/// Initial bitmap capacity, in heights.
const INITIAL_CAPACITY: usize = 1 << 20;

#[derive(Debug)]
pub struct BlockTracker {
    validated_tip: u32,
    highest_stored: u32,
    bitmap: DenseBits,
}

impl BlockTracker {
    pub fn new(validated_tip: u32) -> Self {
        BlockTracker {
            validated_tip,
            highest_stored: validated_tip,
            bitmap: DenseBits::with_capacity(INITIAL_CAPACITY),
        }
    }

    pub fn validated_tip(&self) -> u32 {
        self.validated_tip
    }

    pub fn highest_stored(&self) -> u32 {
        self.highest_stored
    }

    /// Records that the block at `height` is on disk. Heights already
    /// validated are ignored.
    pub fn mark_available(&mut self, height: u32) {
        if height <= self.validated_tip {
            return;
        }
        self.bitmap.set(height as usize);
        self.highest_stored = self.highest_stored.max(height);
    }

    /// Drops a stored block from the tracker, e.g. because its file turned
    /// out to be corrupt and was deleted.
    pub fn mark_missing(&mut self, height: u32) {
        if height <= self.validated_tip {
            return;
        }
        self.bitmap.clear(height as usize);
    }

    /// Whether the block at `height` is available. Validation is permanent:
    /// anything at or below the validated tip reads as available forever.
    pub fn has_block(&self, height: u32) -> bool {
        height <= self.validated_tip || self.bitmap.get(height as usize)
    }

    /// Advances the validated tip, releasing the bitmap range behind it.
    pub fn mark_validated(&mut self, new_tip: u32) {
        for height in self.validated_tip + 1..=new_tip {
            self.bitmap.clear(height as usize);
        }
        self.validated_tip = self.validated_tip.max(new_tip);
        self.highest_stored = self.highest_stored.max(self.validated_tip);
    }

    /// The longest consecutive stored run starting right above the validated
    /// tip, or `None` if the very next height is missing.
    pub fn find_consecutive_range(&self) -> Option<(u32, u32)> {
        let start = self.validated_tip + 1;
        if !self.bitmap.get(start as usize) {
            return None;
        }
        let mut end = start;
        while end < self.highest_stored && self.bitmap.get(end as usize + 1) {
            end += 1;
        }
        Some((start, end))
    }

    /// The first missing height in `(validated_tip, highest_stored]`, or
    /// `highest_stored + 1` when that whole range is present.
    pub fn find_blocking_block(&self) -> u32 {
        for height in self.validated_tip + 1..=self.highest_stored {
            if !self.bitmap.get(height as usize) {
                return height;
            }
        }
        self.highest_stored + 1
    }
}
