//! Deferred multi-way block merges.
//!
//! A [`LazyBlock`] collects equal-sized blocks slated for merging without
//! doing any physical work: [`LazyBlock::merge`] just records the source
//! and doubles the eventual capacity. [`LazyBlock::finalize`] performs one
//! k-way merge of all recorded sources through a binary min-heap keyed by
//! each source's current head key, producing only live entries.
//!
//! The shared-LSM candidate build uses this to resolve size-class
//! collisions: every cascade step adds one more source instead of paying
//! for an intermediate two-way merge.

use std::collections::BinaryHeap;
use std::ptr::NonNull;

use crate::block::{Block, Peek};
use crate::block_pool::BlockPool;
use crate::item::Item;

/// One merge source: a block plus the position and key of its next live
/// entry.
struct BlockHead {
    block: NonNull<Block>,
    ix: usize,
    key: u64,
    item: NonNull<Item>,
    version: u32,
}

impl BlockHead {
    /// Scan `block` from `ix` for the next live entry.
    fn at(block: NonNull<Block>, ix: usize) -> Option<Self> {
        // SAFETY: blocks are pool-owned and never freed while the queue
        // lives.
        let b: &Block = unsafe { block.as_ref() };
        let last: usize = b.last();

        for i in ix..last {
            let p: Peek = b.peek_nth(i);
            if let Some(item) = NonNull::new(p.item) {
                return Some(Self {
                    block,
                    ix: i,
                    key: p.key,
                    item,
                    version: p.version,
                });
            }
        }

        None
    }
}

impl PartialEq for BlockHead {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for BlockHead {}

impl PartialOrd for BlockHead {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlockHead {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so that the std max-heap pops the smallest key.
        other.key.cmp(&self.key)
    }
}

/// A pending merge of equal-sized blocks.
pub struct LazyBlock {
    power_of_2: usize,
    capacity: usize,
    heads: Vec<BlockHead>,
}

impl LazyBlock {
    /// Start a pending merge with a single source, skipping the source's
    /// stale prefix from `first`.
    #[must_use]
    pub fn new(block: NonNull<Block>, first: usize) -> Self {
        // SAFETY: pool-owned block.
        let power_of_2: usize = unsafe { block.as_ref() }.power_of_2();

        let mut lazy = Self {
            power_of_2,
            capacity: 1 << power_of_2,
            heads: Vec::with_capacity(4),
        };

        if let Some(head) = BlockHead::at(block, first) {
            lazy.heads.push(head);
        }

        lazy
    }

    /// Record another source. The source must be of the pending merge's
    /// current size class; the eventual output grows one class.
    pub fn merge(&mut self, block: NonNull<Block>, first: usize) {
        // SAFETY: pool-owned block.
        debug_assert_eq!(self.power_of_2, unsafe { block.as_ref() }.power_of_2());

        if let Some(head) = BlockHead::at(block, first) {
            self.heads.push(head);
        }

        self.power_of_2 += 1;
        self.capacity <<= 1;
    }

    /// Size class of the eventual output.
    #[must_use]
    pub const fn power_of_2(&self) -> usize {
        self.power_of_2
    }

    /// Capacity of the eventual output.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Perform the recorded merge.
    ///
    /// With a single source the source itself is returned (no allocation).
    /// Otherwise a block of the accumulated size class is acquired from
    /// `pool`, filled by a heap-driven k-way merge of live entries, and
    /// returned. With no live sources the returned block is empty.
    pub fn finalize(self, pool: &mut BlockPool) -> NonNull<Block> {
        if let [only] = self.heads.as_slice() {
            // SAFETY: pool-owned block.
            if unsafe { only.block.as_ref() }.power_of_2() == self.power_of_2 {
                return only.block;
            }
        }

        let out: NonNull<Block> = pool.get_block(self.power_of_2);
        // SAFETY: freshly issued from our pool; we are the owner.
        let dst: &Block = unsafe { out.as_ref() };

        let mut heap: BinaryHeap<BlockHead> = self.heads.into_iter().collect();

        while let Some(head) = heap.pop() {
            dst.insert_tail(head.item, head.version);

            if heap.is_empty() {
                // Only one source left: append its trailing run directly.
                let mut ix: usize = head.ix + 1;
                while let Some(next) = BlockHead::at(head.block, ix) {
                    dst.insert_tail(next.item, next.version);
                    ix = next.ix + 1;
                }
                break;
            }

            if let Some(next) = BlockHead::at(head.block, head.ix + 1) {
                heap.push(next);
            }
        }

        out
    }
}

impl std::fmt::Debug for LazyBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyBlock")
            .field("power_of_2", &self.power_of_2)
            .field("sources", &self.heads.len())
            .finish()
    }
}
