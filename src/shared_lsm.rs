//! The shared, lock-free LSM layer.
//!
//! All threads agree on one published [`BlockArray`] reached through a
//! single atomic pointer. Every mutation builds a full replacement snapshot
//! in a thread-private candidate buffer and installs it with one CAS; a
//! failed CAS means someone else published first, and the loser rebuilds
//! from the new snapshot. Progress is lock-free: every failed CAS is
//! another thread's successful publication.
//!
//! # Tagged pointer
//!
//! [`BlockArray`] is 2048-byte aligned and the global pointer carries an
//! 11-bit publication tag in the low bits, incremented (mod 2048) on every
//! publish. Without it, a thread suspended between reading the pointer and
//! CASing could be fooled by a buffer that was retired, rebuilt, and
//! republished at the same address. With the tag, that requires 2048
//! intervening publishes inside the suspension window.
//!
//! # Buffers
//!
//! Each thread owns two candidate buffers used alternately: the buffer
//! published last time must stay intact (it may be the current global
//! array), so the next candidate is built in the other one. Readers that
//! copy a buffer being rebuilt detect the interference by re-checking the
//! tagged global pointer after the copy.

use std::ptr::NonNull;
use std::sync::atomic::AtomicPtr;

use crate::block::{Block, Peek};
use crate::block_array::{ArraySnapshot, BlockArray, TAG_MASK};
use crate::block_pool::BlockPool;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD};
use crate::tracing_helpers::{trace_log, warn_log};

/// Pack a publication tag into an array pointer's low bits.
#[inline]
fn pack(array: NonNull<BlockArray>, version: u64) -> *mut BlockArray {
    let addr: usize = array.as_ptr() as usize;
    debug_assert_eq!(addr & TAG_MASK, 0, "misaligned block array");

    (addr | ((version as usize) & TAG_MASK)) as *mut BlockArray
}

/// Strip the publication tag off a tagged pointer.
#[inline]
fn unpack(tagged: *mut BlockArray) -> *mut BlockArray {
    ((tagged as usize) & !TAG_MASK) as *mut BlockArray
}

// ============================================================================
//  SharedLsm (global state)
// ============================================================================

/// The process-wide shared LSM state: one tagged atomic pointer to the
/// currently published array.
pub struct SharedLsm {
    global: AtomicPtr<BlockArray>,
}

impl SharedLsm {
    /// Create the shared state, publishing `initial` (normally an empty
    /// array owned by the queue) at tag 0.
    #[must_use]
    pub fn new(initial: NonNull<BlockArray>) -> Self {
        // SAFETY: caller hands over a valid array that outlives the LSM.
        let version: u64 = unsafe { initial.as_ref() }.version();

        Self {
            global: AtomicPtr::new(pack(initial, version)),
        }
    }

    /// Version of the currently published array.
    #[must_use]
    pub fn published_version(&self) -> u64 {
        // SAFETY: published arrays live as long as the queue.
        unsafe { &*unpack(self.global.load(READ_ORD)) }.version()
    }

    /// Replace the published array outside of any concurrency (`clear`,
    /// tests). Requires external exclusivity.
    pub fn reset(&self, array: NonNull<BlockArray>) {
        // SAFETY: as in `new`.
        let version: u64 = unsafe { array.as_ref() }.version();
        self.global.store(pack(array, version), crate::ordering::WRITE_ORD);
    }

    /// Copy the published array into `local.snapshot`, retrying until the
    /// copy is consistent. Returns the tagged pointer the copy was
    /// validated against (the CAS expectation for a subsequent publish).
    fn snapshot_into(&self, snapshot: &mut ArraySnapshot) -> *mut BlockArray {
        loop {
            let observed: *mut BlockArray = self.global.load(READ_ORD);

            // SAFETY: published arrays are context-owned buffers that live
            // as long as the queue.
            unsafe { &*unpack(observed) }.read_into(snapshot);

            if self.global.load(READ_ORD) == observed {
                return observed;
            }
        }
    }

    /// Publish `local.candidate` from `local`'s current buffer. On success
    /// the buffers flip and blocks that left the array are released; on
    /// failure the blocks freshly allocated for the candidate are released
    /// instead.
    fn try_publish(&self, local: &mut SharedLsmLocal, observed: *mut BlockArray) -> bool {
        let buffer: NonNull<BlockArray> = local.buffers[local.which];
        // SAFETY: local owns its buffers.
        unsafe { buffer.as_ref() }.store_from(&local.candidate);

        let desired: *mut BlockArray = pack(buffer, local.candidate.version);

        let won: bool = self
            .global
            .compare_exchange(observed, desired, CAS_SUCCESS, CAS_FAILURE)
            .is_ok();

        if won {
            local.which ^= 1;
            for block in local.retired.drain(..) {
                // SAFETY: pool-owned blocks are never freed while the
                // queue lives; releasing another owner's block is the
                // designed hand-back path.
                unsafe { block.as_ref() }.set_unused();
            }
            local.fresh.clear();
        } else {
            for block in local.fresh.drain(..) {
                // SAFETY: these came from local.block_pool this attempt.
                unsafe { block.as_ref() }.set_unused();
            }
            local.retired.clear();
        }

        won
    }

    /// Insert a block, publishing a new snapshot.
    ///
    /// The caller's block is copied first and may be recycled as soon as
    /// this returns. Same-size-class collisions in the candidate are
    /// resolved by cascading lazy merges.
    pub fn insert(&self, local: &mut SharedLsmLocal, block: &Block) {
        let mine: NonNull<Block> = local.block_pool.get_block(block.power_of_2());
        // SAFETY: freshly issued from local.block_pool.
        unsafe { mine.as_ref() }.copy(block);

        if unsafe { mine.as_ref() }.size() == 0 {
            // Every entry went stale between the caller's check and the
            // copy; nothing to publish.
            unsafe { mine.as_ref() }.set_unused();
            return;
        }

        loop {
            let observed: *mut BlockArray = self.snapshot_into(&mut local.snapshot);

            local.candidate.copy_from(&local.snapshot);
            local.candidate.version = local.snapshot.version + 1;
            local.fresh.clear();
            local.retired.clear();

            local
                .candidate
                .insert(mine, &mut local.block_pool, &mut local.fresh, &mut local.retired);

            if self.try_publish(local, observed) {
                trace_log!(version = local.candidate.version, "slsm publish");
                return;
            }
        }
    }

    /// The current relaxed minimum, observed without consuming it.
    pub fn peek_min(&self, local: &mut SharedLsmLocal) -> Peek {
        let _ = self.snapshot_into(&mut local.snapshot);
        local.snapshot.minimum()
    }

    /// Relaxed delete-min over the published snapshot.
    ///
    /// Selects the minimum across all published blocks and tries to take
    /// it. A lost race publishes a replacement snapshot with the stale
    /// prefix of the contended block trimmed (half-empty slots shrunk and
    /// cascaded), then retries; after `retries` lost races the operation
    /// reports `None`, indistinguishable from an empty queue.
    pub fn delete_min(&self, local: &mut SharedLsmLocal, retries: usize) -> Option<u64> {
        for _ in 0..=retries {
            let observed: *mut BlockArray = self.snapshot_into(&mut local.snapshot);
            let best: Peek = local.snapshot.minimum();

            if best.is_empty() {
                return None;
            }

            if let Some(bits) = best.take() {
                return Some(bits);
            }

            // Lost the race. Trim stale weight and republish so later
            // scans stop paying for it.
            local.candidate.copy_from(&local.snapshot);
            local.candidate.version = local.snapshot.version + 1;
            local.fresh.clear();
            local.retired.clear();

            local
                .candidate
                .remove_stale(&mut local.block_pool, &mut local.fresh, &mut local.retired);

            if local.retired.is_empty() {
                // Nothing shrinkable yet; retry against the fresher state.
                continue;
            }

            let _ = self.try_publish(local, observed);
        }

        warn_log!(retries, "shared delete_min retry bound exhausted");

        None
    }
}

impl std::fmt::Debug for SharedLsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tagged: *mut BlockArray = self.global.load(READ_ORD);

        f.debug_struct("SharedLsm")
            .field("tag", &((tagged as usize) & TAG_MASK))
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  SharedLsmLocal (per-thread state)
// ============================================================================

/// Per-thread shared-LSM context: block memory, the two candidate buffers,
/// and snapshot scratch.
pub struct SharedLsmLocal {
    /// Pool backing copied-in blocks, merge outputs, and shrink copies.
    block_pool: BlockPool,

    /// The two alternately-used candidate buffers.
    buffers: [NonNull<BlockArray>; 2],

    /// Index of the buffer the next publish will use.
    which: usize,

    /// Validated copy of the published array.
    snapshot: ArraySnapshot,

    /// Working candidate for the next publish.
    candidate: ArraySnapshot,

    /// Blocks drawn from `block_pool` for the current publish attempt.
    fresh: Vec<NonNull<Block>>,

    /// Blocks that leave the array if the current publish succeeds.
    retired: Vec<NonNull<Block>>,
}

impl SharedLsmLocal {
    /// Create the per-thread state for context `tid`.
    #[must_use]
    pub fn new(tid: u32) -> Self {
        Self {
            block_pool: BlockPool::new(tid),
            buffers: [
                NonNull::from(Box::leak(BlockArray::new())),
                NonNull::from(Box::leak(BlockArray::new())),
            ],
            which: 0,
            snapshot: ArraySnapshot::new(),
            candidate: ArraySnapshot::new(),
            fresh: Vec::new(),
            retired: Vec::new(),
        }
    }
}

impl Drop for SharedLsmLocal {
    fn drop(&mut self) {
        for buffer in self.buffers {
            // SAFETY: leaked in `new`, dropped exactly once here. Contexts
            // only drop when the whole queue drops, so no reader can still
            // hold one of these buffers.
            unsafe { drop(Box::from_raw(buffer.as_ptr())) };
        }
    }
}

impl std::fmt::Debug for SharedLsmLocal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLsmLocal")
            .field("which", &self.which)
            .field("pool_blocks", &self.block_pool.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  Tests
// ============================================================================
