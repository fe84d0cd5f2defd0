//! Shared-LSM snapshots: at most one block per size class.
//!
//! A [`BlockArray`] is the unit the shared LSM publishes: a fixed set of
//! slots, one per power-of-two size class, plus a monotonically growing
//! version. Published arrays are logically immutable; owners mutate an
//! array only while it is an unpublished candidate buffer.
//!
//! Candidate construction itself happens on an [`ArraySnapshot`] — a plain,
//! thread-private copy of the slot pointers. The snapshot carries the
//! cascade logic ([`ArraySnapshot::insert`], [`ArraySnapshot::remove_stale`])
//! and the cross-slot minimum scan; the atomic [`BlockArray`] form exists
//! only to be read from and written to around the publish CAS.
//!
//! The struct is 2048-byte aligned so publishers can pack an 11-bit
//! publication tag into the pointer's low bits (the ABA defense for the
//! global pointer swap).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64};

use crate::block::{Block, MAX_POWER_OF_2, Peek};
use crate::block_pool::BlockPool;
use crate::lazy_block::LazyBlock;
use crate::ordering::{READ_ORD, WRITE_ORD};

/// Slots per array: one per size class `2^0 ..= 2^MAX_POWER_OF_2`.
pub const SLOT_COUNT: usize = MAX_POWER_OF_2 + 1;

/// Alignment of [`BlockArray`]; the low `log2(ARRAY_ALIGN)` pointer bits
/// are free to carry the publication tag.
pub const ARRAY_ALIGN: usize = 2048;

/// Mask extracting the publication tag from a tagged array pointer.
pub const TAG_MASK: usize = ARRAY_ALIGN - 1;

// ============================================================================
//  BlockArray (shared form)
// ============================================================================

/// The shared, atomically-readable form of a snapshot.
#[repr(align(2048))]
pub struct BlockArray {
    /// Monotonically growing snapshot version. Successive publishes along
    /// the global chain increase it by one; a candidate buffer is only
    /// reused after the other buffer has been published above it, so the
    /// version is also strictly monotonic per buffer.
    version: AtomicU64,

    /// At index `p`: null, or a block of capacity `2^p`.
    slots: [AtomicPtr<Block>; SLOT_COUNT],
}

impl BlockArray {
    /// Create an empty array with version 0.
    #[must_use]
    pub fn new() -> Box<Self> {
        Box::new(Self {
            version: AtomicU64::new(0),
            slots: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
        })
    }

    /// Current snapshot version.
    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(READ_ORD)
    }

    /// Copy this array's slots and version into `out`.
    ///
    /// The copy is *not* validated here: the reader must re-check the
    /// tagged global pointer afterwards to know the copy was consistent.
    pub fn read_into(&self, out: &mut ArraySnapshot) {
        for (dst, src) in out.slots.iter_mut().zip(self.slots.iter()) {
            *dst = src.load(READ_ORD);
        }
        out.version = self.version.load(READ_ORD);
    }

    /// Empty every slot and move the version to `version`. Owner-only;
    /// used when the queue is cleared under exclusive access.
    pub fn reset_to(&self, version: u64) {
        for slot in &self.slots {
            slot.store(std::ptr::null_mut(), WRITE_ORD);
        }
        self.version.store(version, WRITE_ORD);
    }

    /// Overwrite this (unpublished) buffer with `snapshot`. Owner-only.
    pub fn store_from(&self, snapshot: &ArraySnapshot) {
        for (dst, src) in self.slots.iter().zip(snapshot.slots.iter()) {
            dst.store(*src, WRITE_ORD);
        }
        self.version.store(snapshot.version, WRITE_ORD);
    }
}

impl std::fmt::Debug for BlockArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let occupied: usize = self
            .slots
            .iter()
            .filter(|s| !s.load(READ_ORD).is_null())
            .count();

        f.debug_struct("BlockArray")
            .field("version", &self.version())
            .field("occupied_slots", &occupied)
            .finish()
    }
}

// ============================================================================
//  ArraySnapshot (thread-private form)
// ============================================================================

/// A thread-private copy of an array's slots, used both as a read snapshot
/// and as the working candidate during publication.
pub struct ArraySnapshot {
    slots: [*mut Block; SLOT_COUNT],

    /// Version carried into the next publish (candidate) or observed at
    /// copy time (read snapshot).
    pub version: u64,
}

// SAFETY: the raw block pointers target pool-owned blocks that are never
// freed while the queue lives; shared access to blocks is atomic.
unsafe impl Send for ArraySnapshot {}

impl ArraySnapshot {
    /// An empty snapshot at version 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [std::ptr::null_mut(); SLOT_COUNT],
            version: 0,
        }
    }

    /// The block in size class `p`, if any.
    #[inline]
    #[must_use]
    pub fn slot(&self, p: usize) -> Option<NonNull<Block>> {
        NonNull::new(self.slots[p])
    }

    /// Iterate the occupied slots.
    pub fn blocks(&self) -> impl Iterator<Item = NonNull<Block>> + '_ {
        self.slots.iter().filter_map(|&s| NonNull::new(s))
    }

    /// Whether no slot is occupied.
    #[must_use]
    pub fn is_unoccupied(&self) -> bool {
        self.slots.iter().all(|s| s.is_null())
    }

    /// Pointer-level copy of another snapshot's slots (the version is the
    /// caller's business).
    pub fn copy_from(&mut self, other: &Self) {
        self.slots = other.slots;
    }

    /// Insert `block` into its size class, cascading same-size merges
    /// until every slot holds a distinct class.
    ///
    /// Displaced blocks (slot occupants consumed by the cascade, and
    /// `block` itself if it was merged away) are pushed onto `retired`;
    /// merge outputs freshly drawn from `pool` are pushed onto `fresh`.
    /// After a publish attempt the caller releases `retired` on success and
    /// `fresh` on failure.
    pub fn insert(
        &mut self,
        block: NonNull<Block>,
        pool: &mut BlockPool,
        fresh: &mut Vec<NonNull<Block>>,
        retired: &mut Vec<NonNull<Block>>,
    ) {
        // SAFETY: pool-owned block, never freed while the queue lives.
        let first: usize = unsafe { block.as_ref() }.first();
        let mut lazy: LazyBlock = LazyBlock::new(block, first);

        while let Some(existing) = self.slot(lazy.power_of_2()) {
            self.slots[lazy.power_of_2()] = std::ptr::null_mut();
            retired.push(existing);

            // SAFETY: as above.
            let existing_first: usize = unsafe { existing.as_ref() }.first();
            lazy.merge(existing, existing_first);
        }

        let out: NonNull<Block> = lazy.finalize(pool);
        if out != block {
            fresh.push(out);
            retired.push(block);
        }

        // SAFETY: as above.
        let class: usize = unsafe { out.as_ref() }.power_of_2();
        debug_assert!(self.slots[class].is_null());
        self.slots[class] = out.as_ptr();
    }

    /// Rebuild every slot whose live population dropped to half capacity or
    /// below: copy the survivors into a block of the next-lower class and
    /// cascade-merge it into the lower slots. Empty blocks are dropped
    /// outright.
    ///
    /// Bookkeeping matches [`ArraySnapshot::insert`].
    pub fn remove_stale(
        &mut self,
        pool: &mut BlockPool,
        fresh: &mut Vec<NonNull<Block>>,
        retired: &mut Vec<NonNull<Block>>,
    ) {
        for p in 0..SLOT_COUNT {
            let Some(block) = self.slot(p) else {
                continue;
            };

            // SAFETY: pool-owned block.
            let b: &Block = unsafe { block.as_ref() };
            let live: usize = b.live_count();

            if live > b.capacity() / 2 {
                continue;
            }

            self.slots[p] = std::ptr::null_mut();
            retired.push(block);

            if live == 0 {
                continue;
            }

            let shrunk: NonNull<Block> = pool.get_block(p - 1);
            // SAFETY: freshly issued from our pool.
            unsafe { shrunk.as_ref() }.copy(b);
            fresh.push(shrunk);

            self.insert(shrunk, pool, fresh, retired);
        }
    }

    /// The minimum live entry across all slots, observed read-only.
    #[must_use]
    pub fn minimum(&self) -> Peek {
        let mut best: Peek = Peek::EMPTY;

        for block in self.blocks() {
            // SAFETY: pool-owned block.
            let candidate: Peek = unsafe { block.as_ref() }.peek_shared();

            if candidate.is_empty() {
                continue;
            }
            if best.is_empty() || candidate.key < best.key {
                best = candidate;
            }
        }

        best
    }
}

impl Default for ArraySnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ArraySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let classes: Vec<usize> = (0..SLOT_COUNT).filter(|&p| !self.slots[p].is_null()).collect();

        f.debug_struct("ArraySnapshot")
            .field("version", &self.version)
            .field("occupied_classes", &classes)
            .finish()
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;

    fn mint(arena: &mut Vec<Box<Item>>, key: u64) -> (NonNull<Item>, u32) {
        let item = Box::new(Item::new());
        let version: u32 = item.activate();
        item.initialize(key, key);
        arena.push(item);

        (NonNull::from(arena.last().unwrap().as_ref()), version)
    }

    fn filled(pool: &mut BlockPool, arena: &mut Vec<Box<Item>>, power: usize, keys: &[u64]) -> NonNull<Block> {
        let b = pool.get_block(power);
        for &k in keys {
            let (item, version) = mint(arena, k);
            // SAFETY: freshly issued pool block.
            unsafe { b.as_ref() }.insert(item, version);
        }
        b
    }

    fn occupied_classes(snap: &ArraySnapshot) -> Vec<usize> {
        (0..SLOT_COUNT).filter(|&p| snap.slot(p).is_some()).collect()
    }

    #[test]
    fn test_insert_into_empty_slot() {
        let mut pool = BlockPool::new(0);
        let mut arena = Vec::new();
        let mut snap = ArraySnapshot::new();
        let (mut fresh, mut retired) = (Vec::new(), Vec::new());

        let b = filled(&mut pool, &mut arena, 1, &[3, 5]);
        snap.insert(b, &mut pool, &mut fresh, &mut retired);

        assert_eq!(occupied_classes(&snap), vec![1]);
        assert!(fresh.is_empty());
        assert!(retired.is_empty());
    }

    #[test]
    fn test_insert_collision_cascades_upward() {
        let mut pool = BlockPool::new(0);
        let mut arena = Vec::new();
        let mut snap = ArraySnapshot::new();
        let (mut fresh, mut retired) = (Vec::new(), Vec::new());

        let a = filled(&mut pool, &mut arena, 1, &[1, 4]);
        let b = filled(&mut pool, &mut arena, 1, &[2, 8]);
        snap.insert(a, &mut pool, &mut fresh, &mut retired);
        snap.insert(b, &mut pool, &mut fresh, &mut retired);

        // One merged block of the next class; both sources displaced.
        assert_eq!(occupied_classes(&snap), vec![2]);
        assert_eq!(fresh.len(), 1);
        assert_eq!(retired.len(), 2);

        let merged = snap.slot(2).unwrap();
        // SAFETY: pool-owned block.
        assert_eq!(unsafe { merged.as_ref() }.size(), 4);
    }

    #[test]
    fn test_no_two_blocks_share_a_class() {
        let mut pool = BlockPool::new(0);
        let mut arena = Vec::new();
        let mut snap = ArraySnapshot::new();
        let (mut fresh, mut retired) = (Vec::new(), Vec::new());

        // Four same-class inserts cascade into one class-3 block.
        for base in 0..4u64 {
            let b = filled(&mut pool, &mut arena, 1, &[base * 10, base * 10 + 1]);
            snap.insert(b, &mut pool, &mut fresh, &mut retired);
        }

        assert_eq!(occupied_classes(&snap), vec![3]);
    }

    #[test]
    fn test_minimum_scans_all_classes() {
        let mut pool = BlockPool::new(0);
        let mut arena = Vec::new();
        let mut snap = ArraySnapshot::new();
        let (mut fresh, mut retired) = (Vec::new(), Vec::new());

        let small = filled(&mut pool, &mut arena, 0, &[9]);
        let large = filled(&mut pool, &mut arena, 2, &[2, 5, 11]);
        snap.insert(small, &mut pool, &mut fresh, &mut retired);
        snap.insert(large, &mut pool, &mut fresh, &mut retired);

        let min: Peek = snap.minimum();
        assert_eq!(min.key, 2);
    }

    #[test]
    fn test_minimum_on_empty_snapshot() {
        let snap = ArraySnapshot::new();
        assert!(snap.minimum().is_empty());
        assert!(snap.is_unoccupied());
    }

    #[test]
    fn test_remove_stale_shrinks_half_empty_block() {
        let mut pool = BlockPool::new(0);
        let mut arena = Vec::new();
        let mut snap = ArraySnapshot::new();
        let (mut fresh, mut retired) = (Vec::new(), Vec::new());

        let b = filled(&mut pool, &mut arena, 2, &[1, 2, 3, 4]);
        snap.insert(b, &mut pool, &mut fresh, &mut retired);

        // Take half the entries; the class-2 block is now shrinkable.
        // SAFETY: pool-owned block.
        assert!(unsafe { b.as_ref() }.peek_nth(0).take().is_some());
        assert!(unsafe { b.as_ref() }.peek_nth(1).take().is_some());

        snap.remove_stale(&mut pool, &mut fresh, &mut retired);

        assert_eq!(occupied_classes(&snap), vec![1]);
        let shrunk = snap.slot(1).unwrap();
        // SAFETY: as above.
        assert_eq!(unsafe { shrunk.as_ref() }.size(), 2);
        assert!(retired.contains(&b));
    }

    #[test]
    fn test_remove_stale_drops_empty_blocks() {
        let mut pool = BlockPool::new(0);
        let mut arena = Vec::new();
        let mut snap = ArraySnapshot::new();
        let (mut fresh, mut retired) = (Vec::new(), Vec::new());

        let b = filled(&mut pool, &mut arena, 0, &[7]);
        snap.insert(b, &mut pool, &mut fresh, &mut retired);

        // SAFETY: pool-owned block.
        assert!(unsafe { b.as_ref() }.peek_nth(0).take().is_some());

        snap.remove_stale(&mut pool, &mut fresh, &mut retired);

        assert!(snap.is_unoccupied());
        assert!(retired.contains(&b));
    }

    #[test]
    fn test_remove_stale_cascades_into_occupied_lower_slot() {
        let mut pool = BlockPool::new(0);
        let mut arena = Vec::new();
        let mut snap = ArraySnapshot::new();
        let (mut fresh, mut retired) = (Vec::new(), Vec::new());

        let low = filled(&mut pool, &mut arena, 1, &[20, 21]);
        let high = filled(&mut pool, &mut arena, 2, &[1, 2, 3, 4]);
        snap.insert(low, &mut pool, &mut fresh, &mut retired);
        snap.insert(high, &mut pool, &mut fresh, &mut retired);
        assert_eq!(occupied_classes(&snap), vec![1, 2]);

        // Shrink the class-2 block down to class 1; it must merge with the
        // existing class-1 occupant and land in class 2 again.
        // SAFETY: pool-owned block.
        assert!(unsafe { high.as_ref() }.peek_nth(2).take().is_some());
        assert!(unsafe { high.as_ref() }.peek_nth(3).take().is_some());

        snap.remove_stale(&mut pool, &mut fresh, &mut retired);

        assert_eq!(occupied_classes(&snap), vec![2]);
        let merged = snap.slot(2).unwrap();
        // SAFETY: as above.
        assert_eq!(unsafe { merged.as_ref() }.size(), 4);
    }

    #[test]
    fn test_shared_form_round_trip() {
        let mut pool = BlockPool::new(0);
        let mut arena = Vec::new();
        let mut snap = ArraySnapshot::new();
        let (mut fresh, mut retired) = (Vec::new(), Vec::new());

        let b = filled(&mut pool, &mut arena, 1, &[6, 7]);
        snap.insert(b, &mut pool, &mut fresh, &mut retired);
        snap.version = 41;

        let shared = BlockArray::new();
        shared.store_from(&snap);

        let mut copy = ArraySnapshot::new();
        shared.read_into(&mut copy);

        assert_eq!(copy.version, 41);
        assert_eq!(occupied_classes(&copy), vec![1]);
        assert_eq!(copy.minimum().key, 6);
    }
}
