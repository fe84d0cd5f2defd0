//! Sorted blocks of versioned item references.
//!
//! A [`Block`] stores `(item, expected_version)` pairs in a power-of-two
//! capacity array. An entry is *owned* by the block while the item's
//! current version equals the stored expected version; otherwise the entry
//! is *stale* — the item was taken (and possibly recycled) elsewhere and the
//! slot is dead weight until the block is rebuilt.
//!
//! Within the live range `[first, last)`, owned entries are strictly sorted
//! by key. `last` only advances through owner appends; `first` only
//! advances when the owner's [`Block::peek`] skips stale leading entries.
//!
//! # Concurrency Model
//!
//! Slots are atomics because a block published into a shared snapshot can
//! be scanned by any thread, and a block recycled by its owner can still be
//! scanned through a stale snapshot. Scans therefore validate every entry
//! as a self-consistent `(key, item, version)` triple: read the slot, read
//! the item's key, then require `item.version() == expected`. A torn or
//! recycled read fails the validation and the entry is treated as stale;
//! the final item-version CAS is what makes any extraction correct.
//!
//! Mutating operations (`insert`, `copy`, `merge`, `peek`, `clear`) are
//! owner-only: blocks inside a published block array are read via
//! [`Block::peek_shared`], which never writes.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize};

use crate::item::Item;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};

/// Largest supported size-class exponent: block capacities range over
/// `2^0 ..= 2^MAX_POWER_OF_2`.
pub const MAX_POWER_OF_2: usize = 32;

// ============================================================================
//  Peek
// ============================================================================

/// Information about a specific observed item. A null item denotes an
/// empty/failed observation.
#[derive(Clone, Copy, Debug)]
pub struct Peek {
    /// Encoded key bits observed for the item.
    pub key: u64,

    /// The observed item, or null for an empty peek.
    pub item: *mut Item,

    /// The version the item had when observed; feeding this to
    /// [`Item::take`] is the only way to consume the observation.
    pub version: u32,

    /// The entry's index within the block it was observed in.
    pub index: usize,
}

impl Peek {
    /// The empty observation.
    pub const EMPTY: Self = Self {
        key: 0,
        item: std::ptr::null_mut(),
        version: 0,
        index: 0,
    };

    /// Whether this observation is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.item.is_null()
    }

    /// Whether the observed item has since been taken elsewhere.
    #[inline]
    #[must_use]
    pub fn taken(&self) -> bool {
        if self.item.is_null() {
            return true;
        }

        // SAFETY: item cells are pool-owned and never freed while the
        // queue lives; the pointer stays dereferenceable even if stale.
        unsafe { (*self.item).version() != self.version }
    }

    /// Try to consume the observed item. `None` on an empty peek or a lost
    /// race.
    #[inline]
    pub fn take(&self) -> Option<u64> {
        if self.item.is_null() {
            return None;
        }

        // SAFETY: see `taken`.
        unsafe { (*self.item).take(self.version) }
    }
}

impl Default for Peek {
    fn default() -> Self {
        Self::EMPTY
    }
}

// SAFETY: the raw item pointer targets pool-owned cells that are never
// freed while the queue lives; all access goes through atomics.
unsafe impl Send for Peek {}

// ============================================================================
//  Block
// ============================================================================

/// One `(item, expected_version)` slot.
#[derive(Debug)]
struct Slot {
    item: AtomicPtr<Item>,
    version: AtomicU32,
}

impl Slot {
    fn empty() -> Self {
        Self {
            item: AtomicPtr::new(std::ptr::null_mut()),
            version: AtomicU32::new(0),
        }
    }
}

/// A sorted, power-of-two capacity array of versioned item references.
pub struct Block {
    /// Lowest known owned index. Advanced only by the owner's `peek`.
    first: AtomicUsize,

    /// Highest written index + 1. Counts entries appended by the owner,
    /// including entries that have since gone stale.
    last: AtomicUsize,

    /// Capacity exponent; immutable for the block's lifetime.
    power_of_2: usize,

    /// `2^power_of_2`, cached.
    capacity: usize,

    /// Recycling flag consumed by the owning block pool. Atomic because a
    /// shared-LSM publisher may release another owner's block after a
    /// successful publish.
    used: AtomicBool,

    /// Context id of the pool that produced this block (diagnostics).
    owner_tid: AtomicU32,

    slots: Box<[Slot]>,
}

impl Block {
    /// Allocate an empty, unused block of capacity `2^power_of_2`.
    ///
    /// # Panics
    ///
    /// Panics if `power_of_2 > MAX_POWER_OF_2`.
    #[must_use]
    pub fn new(power_of_2: usize) -> Box<Self> {
        assert!(
            power_of_2 <= MAX_POWER_OF_2,
            "block size class {power_of_2} exceeds maximum {MAX_POWER_OF_2}"
        );

        let capacity: usize = 1 << power_of_2;

        Box::new(Self {
            first: AtomicUsize::new(0),
            last: AtomicUsize::new(0),
            power_of_2,
            capacity,
            used: AtomicBool::new(false),
            owner_tid: AtomicU32::new(u32::MAX),
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
        })
    }

    // ========================================================================
    //  Geometry
    // ========================================================================

    /// Capacity exponent.
    #[inline]
    #[must_use]
    pub const fn power_of_2(&self) -> usize {
        self.power_of_2
    }

    /// Slot capacity (`2^power_of_2`).
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lowest known owned index.
    #[inline]
    #[must_use]
    pub fn first(&self) -> usize {
        self.first.load(RELAXED).min(self.capacity)
    }

    /// One past the highest written index.
    #[inline]
    #[must_use]
    pub fn last(&self) -> usize {
        self.last.load(RELAXED).min(self.capacity)
    }

    /// Number of written entries still inside `[first, last)`. Entries may
    /// have gone stale without the owner noticing, so this is an upper
    /// bound on the live count.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.last().saturating_sub(self.first())
    }

    // ========================================================================
    //  Recycling flag
    // ========================================================================

    /// Whether the block is currently in use.
    #[inline]
    #[must_use]
    pub fn used(&self) -> bool {
        self.used.load(READ_ORD)
    }

    /// Mark the block in use (pool hand-out).
    #[inline]
    pub fn set_used(&self) {
        self.used.store(true, WRITE_ORD);
    }

    /// Release the block for reuse by its owning pool. May be called by a
    /// non-owner thread that removed the block from the published array.
    #[inline]
    pub fn set_unused(&self) {
        self.used.store(false, WRITE_ORD);
    }

    /// Tag the owning context (diagnostics only).
    #[inline]
    pub fn set_owner_tid(&self, tid: u32) {
        self.owner_tid.store(tid, RELAXED);
    }

    /// Reset the live range. Owner-only; used when a pool re-issues the
    /// block.
    #[inline]
    pub fn clear(&self) {
        self.first.store(0, RELAXED);
        self.last.store(0, RELAXED);
    }

    // ========================================================================
    //  Entry access
    // ========================================================================

    /// Read entry `i` and validate it as a live `(key, item, version)`
    /// triple. Returns `None` for null, stale, or torn entries.
    #[inline]
    fn live_entry(&self, i: usize) -> Option<(NonNull<Item>, u32, u64)> {
        let slot: &Slot = &self.slots[i];
        let version: u32 = slot.version.load(READ_ORD);
        let item: *mut Item = slot.item.load(READ_ORD);
        let item: NonNull<Item> = NonNull::new(item)?;

        // SAFETY: item cells are never freed while the queue lives.
        let key: u64 = unsafe { item.as_ref().key() };

        // Re-check after the key read: a matching version proves the key
        // belongs to this incarnation of the cell.
        if unsafe { item.as_ref().version() } == version {
            Some((item, version, key))
        } else {
            None
        }
    }

    /// Write entry `i`. Owner-only.
    #[inline]
    fn write_entry(&self, i: usize, item: NonNull<Item>, version: u32) {
        let slot: &Slot = &self.slots[i];
        slot.version.store(version, WRITE_ORD);
        slot.item.store(item.as_ptr(), WRITE_ORD);
    }

    // ========================================================================
    //  Appends
    // ========================================================================

    /// Append an item. Owner-only.
    ///
    /// Precondition: the block is empty or `item.key()` is ≥ every owned
    /// key already present (checked in debug builds).
    #[inline]
    pub fn insert(&self, item: NonNull<Item>, version: u32) {
        #[cfg(debug_assertions)]
        {
            // SAFETY: pool-owned cell.
            let key: u64 = unsafe { item.as_ref().key() };
            if let Some(tail) = self.peek_tail() {
                debug_assert!(tail <= key, "unsorted append: {tail} > {key}");
            }
        }

        self.insert_tail(item, version);
    }

    /// Append an item whose ordering the caller has already verified.
    /// Owner-only.
    #[inline]
    pub fn insert_tail(&self, item: NonNull<Item>, version: u32) {
        let last: usize = self.last.load(RELAXED);
        debug_assert!(last < self.capacity, "append to a full block");

        self.write_entry(last, item, version);
        self.last.store(last + 1, WRITE_ORD);
    }

    // ========================================================================
    //  Rebuilds
    // ========================================================================

    /// Bulk-copy the live entries of `src` into this (empty) block,
    /// skipping stale entries and tightening the array. Owner-only.
    pub fn copy(&self, src: &Self) {
        debug_assert_eq!(self.last.load(RELAXED), 0, "copy into a non-empty block");

        let mut dst: usize = 0;
        let last: usize = src.last();

        for i in src.first()..last {
            if dst == self.capacity {
                // Source mutated under us (stale snapshot); the caller
                // discards the result when publication fails.
                break;
            }

            if let Some((item, version, _)) = src.live_entry(i) {
                self.write_entry(dst, item, version);
                dst += 1;
            }
        }

        self.first.store(0, RELAXED);
        self.last.store(dst, WRITE_ORD);
    }

    /// Merge the live entries of `lhs` and `rhs` into this (empty) block.
    /// Owner-only. Equal keys keep `lhs` entries ahead of `rhs` entries.
    pub fn merge(&self, lhs: &Self, rhs: &Self) {
        self.merge_from(lhs, lhs.first(), rhs, rhs.first());
    }

    /// [`Block::merge`] starting from explicit source offsets (used when a
    /// stale prefix has already been observed and can be dropped).
    pub fn merge_from(&self, lhs: &Self, lhs_first: usize, rhs: &Self, rhs_first: usize) {
        debug_assert_eq!(self.last.load(RELAXED), 0, "merge into a non-empty block");

        let mut dst: usize = 0;
        let (mut l, mut r) = (lhs_first, rhs_first);
        let (l_last, r_last) = (lhs.last(), rhs.last());

        while dst < self.capacity {
            let left = Self::next_live(lhs, &mut l, l_last);
            let right = Self::next_live(rhs, &mut r, r_last);

            match (left, right) {
                (None, None) => break,
                (Some((item, version, _)), None) => {
                    self.write_entry(dst, item, version);
                    l += 1;
                }
                (None, Some((item, version, _))) => {
                    self.write_entry(dst, item, version);
                    r += 1;
                }
                (Some((li, lv, lk)), Some((_, _, rk))) if lk <= rk => {
                    self.write_entry(dst, li, lv);
                    l += 1;
                }
                (_, Some((ri, rv, _))) => {
                    self.write_entry(dst, ri, rv);
                    r += 1;
                }
            }

            dst += 1;
        }

        self.first.store(0, RELAXED);
        self.last.store(dst, WRITE_ORD);
    }

    /// Advance `*ix` past stale entries and return the next live entry
    /// before `last`, if any. Does not consume the entry.
    fn next_live(src: &Self, ix: &mut usize, last: usize) -> Option<(NonNull<Item>, u32, u64)> {
        while *ix < last {
            if let Some(live) = src.live_entry(*ix) {
                return Some(live);
            }
            *ix += 1;
        }

        None
    }

    // ========================================================================
    //  Observations
    // ========================================================================

    /// Return the minimum live entry, advancing `first` past the stale
    /// prefix observed on the way. Owner-only (this is the only stale
    /// reclamation path a block has between rebuilds).
    pub fn peek(&self) -> Peek {
        let last: usize = self.last();
        let mut i: usize = self.first();

        while i < last {
            if let Some((item, version, key)) = self.live_entry(i) {
                self.first.store(i, RELAXED);

                return Peek {
                    key,
                    item: item.as_ptr(),
                    version,
                    index: i,
                };
            }

            i += 1;
        }

        self.first.store(last, RELAXED);

        Peek::EMPTY
    }

    /// Return the minimum live entry without mutating the block. Used for
    /// blocks reached through a shared snapshot, which are read-only.
    #[must_use]
    pub fn peek_shared(&self) -> Peek {
        let last: usize = self.last();

        for i in self.first()..last {
            if let Some((item, version, key)) = self.live_entry(i) {
                return Peek {
                    key,
                    item: item.as_ptr(),
                    version,
                    index: i,
                };
            }
        }

        Peek::EMPTY
    }

    /// Scan backwards from `last` and return the key of the first live
    /// entry found, or `None` if the block holds no live entries.
    #[must_use]
    pub fn peek_tail(&self) -> Option<u64> {
        let first: usize = self.first();
        let last: usize = self.last();

        for i in (first..last).rev() {
            if let Some((_, _, key)) = self.live_entry(i) {
                return Some(key);
            }
        }

        None
    }

    /// Observe the entry at absolute index `n`, empty if the slot is
    /// stale, unwritten, or out of range.
    #[must_use]
    pub fn peek_nth(&self, n: usize) -> Peek {
        if n >= self.last() {
            return Peek::EMPTY;
        }

        match self.live_entry(n) {
            Some((item, version, key)) => Peek {
                key,
                item: item.as_ptr(),
                version,
                index: n,
            },
            None => Peek::EMPTY,
        }
    }

    /// Count the live entries currently in `[first, last)`. A snapshot;
    /// concurrent takes can make it stale immediately.
    #[must_use]
    pub fn live_count(&self) -> usize {
        (self.first()..self.last())
            .filter(|&i| self.live_entry(i).is_some())
            .count()
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("power_of_2", &self.power_of_2)
            .field("first", &self.first())
            .field("last", &self.last())
            .field("used", &self.used())
            .field("owner_tid", &self.owner_tid.load(RELAXED))
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  Tests
// ============================================================================
