//! The per-thread ("distributional") LSM layer.
//!
//! Each thread keeps its own sequence of blocks with strictly decreasing
//! size classes — the classic log-structured merge layout. Inserts land in
//! a capacity-1 block (or append to the tail block directly) and cascade
//! through same-size merges; once a merged block reaches the relaxation
//! spill bound it is handed to the shared LSM and leaves the thread.
//!
//! Only the owning thread touches this state. Other threads interact with
//! its items exclusively through version CASes on cells that were published
//! into the shared LSM — which is also why `spy` (bulk-copying a peer's
//! blocks) stays disabled: there is no protocol yet under which a peer's
//! block contents are stable while being copied.
//!
//! The block list is an ordered `Vec` of owning references navigated by
//! index, so shrink/merge restructuring is plain element shuffling.

use std::ptr::NonNull;

use crate::block::{Block, Peek};
use crate::block_pool::BlockPool;
use crate::item_pool::ItemPool;
use crate::shared_lsm::{SharedLsm, SharedLsmLocal};
use crate::tracing_helpers::trace_log;

/// Per-thread distributional LSM state.
pub struct DistLsm {
    /// Non-empty blocks in strictly decreasing size-class order.
    blocks: Vec<NonNull<Block>>,

    /// Memoized most recent minimum observation.
    cached_best: Peek,

    /// Cell storage for this thread's inserts.
    item_pool: ItemPool,

    /// Block storage for this thread's LSM levels.
    block_pool: BlockPool,
}

// SAFETY: the raw block pointers are owned by `block_pool`; shared access
// to block contents is atomic, and only the owning thread uses this struct.
unsafe impl Send for DistLsm {}

impl DistLsm {
    /// Create the per-thread state for context `tid`.
    #[must_use]
    pub fn new(tid: u32) -> Self {
        Self {
            blocks: Vec::new(),
            cached_best: Peek::EMPTY,
            item_pool: ItemPool::new(),
            block_pool: BlockPool::new(tid),
        }
    }

    /// Number of blocks currently held locally.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    /// Insert a key/value pair.
    ///
    /// `spill_bound` is the merged-block size at which a block moves to the
    /// shared LSM (`(k + 1) / 2` for relaxation `k`); `shared`/`shared_local`
    /// receive the spilled blocks.
    pub fn insert(
        &mut self,
        key_bits: u64,
        value_bits: u64,
        spill_bound: usize,
        shared: &SharedLsm,
        shared_local: &mut SharedLsmLocal,
    ) {
        let (item, version) = self.item_pool.acquire();
        // SAFETY: pool-owned cell, activated for us by `acquire`.
        unsafe { item.as_ref() }.initialize(key_bits, value_bits);

        // Keep the cached best current: a smaller key replaces it, and a
        // taken one is invalidated so `peek` rescans.
        if self.cached_best.is_empty() || key_bits < self.cached_best.key {
            self.cached_best = Peek {
                key: key_bits,
                item: item.as_ptr(),
                version,
                index: 0,
            };
        } else if self.cached_best.taken() {
            self.cached_best = Peek::EMPTY;
        }

        // Fast path: append to the tail block when it has room and the new
        // key does not break its ordering.
        if let Some(&tail) = self.blocks.last() {
            // SAFETY: pool-owned block.
            let tail_ref: &Block = unsafe { tail.as_ref() };
            if tail_ref.last() < tail_ref.capacity() {
                if let Some(tail_key) = tail_ref.peek_tail() {
                    if tail_key <= key_bits {
                        tail_ref.insert_tail(item, version);
                        return;
                    }
                }
            }
        }

        let fresh: NonNull<Block> = self.block_pool.get_block(0);
        // SAFETY: freshly issued from our pool.
        unsafe { fresh.as_ref() }.insert(item, version);

        self.merge_insert(fresh, spill_bound, shared, shared_local);
    }

    /// Cascade `new_block` into the list, merging while the previous block
    /// has the same capacity. A merged block only grows a size class when
    /// the combined population justifies it, which keeps heavily-drained
    /// lists from accumulating huge sparse blocks.
    fn merge_insert(
        &mut self,
        new_block: NonNull<Block>,
        spill_bound: usize,
        shared: &SharedLsm,
        shared_local: &mut SharedLsmLocal,
    ) {
        let mut insert_block: NonNull<Block> = new_block;
        let mut keep: usize = self.blocks.len();

        loop {
            let Some(&other) = keep.checked_sub(1).and_then(|i| self.blocks.get(i)) else {
                break;
            };

            // SAFETY: pool-owned blocks.
            let (ins, oth) = unsafe { (insert_block.as_ref(), other.as_ref()) };
            if ins.capacity() != oth.capacity() {
                break;
            }

            let merged_pow: usize = if ins.size() + oth.size() <= ins.capacity() {
                ins.power_of_2()
            } else {
                ins.power_of_2() + 1
            };

            let merged: NonNull<Block> = self.block_pool.get_block(merged_pow);
            // SAFETY: freshly issued from our pool.
            unsafe { merged.as_ref() }.merge(ins, oth);

            ins.set_unused();
            insert_block = merged;
            keep -= 1;
        }

        // Drop the consumed blocks from the list.
        for other in self.blocks.drain(keep..) {
            // SAFETY: pool-owned block, no longer referenced by the list.
            unsafe { other.as_ref() }.set_unused();
        }

        // SAFETY: pool-owned block.
        let size: usize = unsafe { insert_block.as_ref() }.size();

        if size >= spill_bound {
            // The merged block exceeds the relaxation bound: hand it to
            // the shared LSM (which copies it) and drop it locally.
            trace_log!(size, "dlsm spill to shared lsm");
            // SAFETY: as above.
            shared.insert(shared_local, unsafe { insert_block.as_ref() });
            unsafe { insert_block.as_ref() }.set_unused();
        } else {
            self.blocks.push(insert_block);
        }
    }

    /// The thread's current minimum observation.
    ///
    /// Short-circuits through the cached best when it is still live.
    /// Otherwise scans every block in order, shrinking blocks that fell to
    /// half occupancy into the next-lower class (cascading a merge into the
    /// right neighbor when the classes collide) so internal fragmentation
    /// stays bounded.
    pub fn peek(&mut self) -> Peek {
        if !self.cached_best.is_empty() && !self.cached_best.taken() {
            return self.cached_best;
        }

        let mut best: Peek = Peek::EMPTY;
        let mut ix: usize = 0;

        'outer: while ix < self.blocks.len() {
            let candidate: Peek = loop {
                let block: NonNull<Block> = self.blocks[ix];
                // SAFETY: pool-owned block.
                let b: &Block = unsafe { block.as_ref() };
                let candidate: Peek = b.peek();

                if b.size() > b.capacity() / 2 {
                    break candidate;
                }

                // Empty blocks just leave the list.
                if b.size() == 0 {
                    self.blocks.remove(ix);
                    b.set_unused();
                    continue 'outer;
                }

                // Shrink into the next-lower class.
                let shrunk: NonNull<Block> = self.block_pool.get_block(b.power_of_2() - 1);
                // SAFETY: freshly issued from our pool.
                let mut replacement: NonNull<Block> = shrunk;
                unsafe { shrunk.as_ref() }.copy(b);
                b.set_unused();

                // Cascade: if the shrink collides with the right
                // neighbor's class, merge the two.
                let next_ix: usize = ix + 1;
                if let Some(&next) = self.blocks.get(next_ix) {
                    // SAFETY: pool-owned blocks.
                    let (s, n) = unsafe { (shrunk.as_ref(), next.as_ref()) };
                    if s.capacity() == n.capacity() {
                        let merged: NonNull<Block> =
                            self.block_pool.get_block(s.power_of_2() + 1);
                        // SAFETY: freshly issued from our pool.
                        unsafe { merged.as_ref() }.merge(s, n);

                        n.set_unused();
                        s.set_unused();
                        replacement = merged;
                        self.blocks.remove(next_ix);
                    }
                }

                self.blocks[ix] = replacement;
            };

            if best.is_empty() || (!candidate.is_empty() && candidate.key < best.key) {
                best = candidate;
            }

            ix += 1;
        }

        self.cached_best = best;
        best
    }

    /// Remove and return the thread's minimum, if any.
    ///
    /// A lost version race reports `None` — callers treat it like a miss
    /// and retry at their level.
    pub fn delete_min(&mut self) -> Option<u64> {
        let mut best: Peek = self.peek();

        if best.is_empty() && self.spy() > 0 {
            best = self.peek();
        }

        if best.is_empty() {
            return None;
        }

        best.take()
    }

    /// Work stealing from a random peer. Disabled: copying a peer's blocks
    /// while the peer mutates them has no consistent-snapshot protocol, so
    /// this reports zero entries spied.
    ///
    /// TODO: reintroduce spying behind a protocol that pins a peer block's
    /// contents for the duration of the copy.
    fn spy(&mut self) -> usize {
        0
    }

    /// Take every live item still held locally and release all blocks,
    /// returning the structure to its freshly-constructed state. Item and
    /// block storage stays with the pools for reuse.
    pub fn clear(&mut self) {
        for block in self.blocks.drain(..) {
            // SAFETY: pool-owned block.
            let b: &Block = unsafe { block.as_ref() };
            for i in b.first()..b.last() {
                let _ = b.peek_nth(i).take();
            }
            b.set_unused();
        }

        self.cached_best = Peek::EMPTY;
    }
}

impl std::fmt::Debug for DistLsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let classes: Vec<usize> = self
            .blocks
            .iter()
            // SAFETY: pool-owned blocks.
            .map(|b| unsafe { b.as_ref() }.power_of_2())
            .collect();

        f.debug_struct("DistLsm")
            .field("classes", &classes)
            .field("cached_best_empty", &self.cached_best.is_empty())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  Tests
// ============================================================================
