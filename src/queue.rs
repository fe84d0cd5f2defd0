//! The k-LSM façade.
//!
//! [`KLsm`] combines the per-thread distributional LSMs with the global
//! shared LSM. Inserts go to the calling thread's dLSM; `delete_min` takes
//! the smaller of the dLSM's cached best and the shared LSM's minimum. The
//! `RLX` const generic is the relaxation bound: a successful `delete_min`
//! may return any of the `⌈RLX/2⌉` smallest keys present at its
//! linearization point, and `RLX = 0` degenerates to a strict queue (every
//! insert spills straight to the shared LSM, whose minimum scan is exact).
//!
//! Threads operate through a [`Handle`], which registers a per-thread
//! context on creation and stays bound to its thread (`!Send`). Create one
//! handle per thread and keep it for the thread's lifetime; every handle
//! allocates a fresh context that lives until the queue drops.

use std::marker::PhantomData;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::block::Peek;
use crate::block_array::BlockArray;
use crate::counters::{OpCounters, ThreadCounters};
use crate::dist_lsm::DistLsm;
use crate::key::{KeyType, ValueType};
use crate::shared_lsm::{SharedLsm, SharedLsmLocal};
use crate::tracing_helpers::debug_log;


/// Per-thread state: both LSM locals plus counters.
struct ThreadContext {
    dist: DistLsm,
    shared_local: SharedLsmLocal,
    counters: ThreadCounters,

    /// Contention retry bound for shared-LSM delete-min, sized to the
    /// number of contexts registered when this one was created.
    retries: usize,
}

impl ThreadContext {
    fn new(tid: u32, retries: usize) -> Self {
        Self {
            dist: DistLsm::new(tid),
            shared_local: SharedLsmLocal::new(tid),
            counters: ThreadCounters::default(),
            retries,
        }
    }
}

// ============================================================================
//  KLsm
// ============================================================================

/// A k-relaxed concurrent priority queue.
///
/// # Type Parameters
///
/// * `K` - Key type (order-preserving 64-bit codec)
/// * `V` - Value type (64-bit codec)
/// * `RLX` - Relaxation bound (default 256)
///
/// # Example
///
/// ```rust
/// use klsm::KLsm;
///
/// let queue: KLsm<u32, u32, 16> = KLsm::new();
/// let mut handle = queue.handle();
///
/// handle.insert(5, 50);
/// assert_eq!(handle.delete_min(), Some(50));
/// assert_eq!(handle.delete_min(), None);
/// ```
pub struct KLsm<K: KeyType, V: ValueType, const RLX: usize = 256> {
    shared: SharedLsm,

    /// The empty array the queue starts (and restarts) from.
    initial: NonNull<BlockArray>,

    /// Registry of all thread contexts ever created. Cold path only:
    /// handle creation, counter aggregation, clear, drop.
    contexts: Mutex<Vec<NonNull<ThreadContext>>>,

    _marker: PhantomData<fn() -> (K, V)>,
}

// SAFETY: all cross-thread state (items, blocks, the published array
// pointer) is accessed atomically; the raw context pointers in the
// registry are only dereferenced under the registry lock or with `&mut
// self` exclusivity.
unsafe impl<K: KeyType, V: ValueType, const RLX: usize> Send for KLsm<K, V, RLX> {}
unsafe impl<K: KeyType, V: ValueType, const RLX: usize> Sync for KLsm<K, V, RLX> {}

impl<K: KeyType, V: ValueType, const RLX: usize> KLsm<K, V, RLX> {
    /// Merged dLSM blocks of at least this size move to the shared LSM.
    const SPILL_BOUND: usize = (RLX + 1) / 2;

    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let initial: NonNull<BlockArray> = NonNull::from(Box::leak(BlockArray::new()));

        Self {
            shared: SharedLsm::new(initial),
            initial,
            contexts: Mutex::new(Vec::new()),
            _marker: PhantomData,
        }
    }

    /// The compile-time relaxation bound.
    #[must_use]
    pub const fn relaxation() -> usize {
        RLX
    }

    /// Whether concurrent use is supported.
    #[must_use]
    pub const fn supports_concurrency() -> bool {
        true
    }

    /// Register a per-thread context and return the handle for it.
    ///
    /// Must be called on the thread that will use the handle; the handle
    /// cannot move to another thread.
    pub fn handle(&self) -> Handle<'_, K, V, RLX> {
        let mut contexts = self.contexts.lock();
        let tid: u32 = contexts.len() as u32;

        // Retry bound scales with the contention the new thread can meet.
        let retries: usize = 2 * (contexts.len() + 1) + 2;

        let ctx: NonNull<ThreadContext> =
            NonNull::from(Box::leak(Box::new(ThreadContext::new(tid, retries))));
        contexts.push(ctx);
        drop(contexts);

        debug_log!(tid, "registered queue handle");

        Handle {
            queue: self,
            ctx,
            _not_send: PhantomData,
        }
    }

    /// Aggregate operation counters across every context ever registered.
    #[must_use]
    pub fn counters(&self) -> OpCounters {
        let contexts = self.contexts.lock();
        let mut total = OpCounters::default();

        for ctx in contexts.iter() {
            // SAFETY: contexts live until the queue drops; counter cells
            // are atomics, so reading while the owner runs is fine.
            total += unsafe { ctx.as_ref() }.counters.snapshot();
        }

        total
    }

    /// Reset the queue to its freshly-constructed state.
    ///
    /// Takes `&mut self`, so the borrow checker guarantees no handle is
    /// alive: the reset runs with exclusive access. Item cells and blocks
    /// return to their pools; counters are not touched.
    pub fn clear(&mut self) {
        let contexts = self.contexts.get_mut();
        for ctx in contexts.iter_mut() {
            // SAFETY: exclusive access via `&mut self`.
            unsafe { ctx.as_mut() }.dist.clear();
        }

        // Drain whatever the shared LSM still publishes, then republish
        // the empty array above every version seen so far.
        if let Some(first) = contexts.first_mut() {
            // SAFETY: as above.
            let ctx: &mut ThreadContext = unsafe { first.as_mut() };
            while self.shared.delete_min(&mut ctx.shared_local, 0).is_some() {}
        }

        let published_version: u64 = self.shared.published_version();

        // SAFETY: the initial array is queue-owned and lives until drop.
        unsafe { self.initial.as_ref() }.reset_to(published_version + 1);
        self.shared.reset(self.initial);
    }
}

impl<K: KeyType, V: ValueType, const RLX: usize> Default for KLsm<K, V, RLX> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: KeyType, V: ValueType, const RLX: usize> Drop for KLsm<K, V, RLX> {
    fn drop(&mut self) {
        for ctx in self.contexts.get_mut().drain(..) {
            // SAFETY: leaked in `handle`, dropped exactly once here. No
            // handle can outlive the queue (lifetime-bound), so nothing
            // references the context anymore.
            unsafe { drop(Box::from_raw(ctx.as_ptr())) };
        }

        // SAFETY: leaked in `new`, dropped exactly once here.
        unsafe { drop(Box::from_raw(self.initial.as_ptr())) };
    }
}

impl<K: KeyType, V: ValueType, const RLX: usize> std::fmt::Debug for KLsm<K, V, RLX> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KLsm")
            .field("relaxation", &RLX)
            .field("contexts", &self.contexts.lock().len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  Handle
// ============================================================================

/// A thread's interface to a [`KLsm`].
///
/// Holds the thread's context; `PhantomData<*mut ()>` keeps it `!Send` and
/// `!Sync`, so the context's owner-only state never crosses threads.
pub struct Handle<'q, K: KeyType, V: ValueType, const RLX: usize> {
    queue: &'q KLsm<K, V, RLX>,
    ctx: NonNull<ThreadContext>,
    _not_send: PhantomData<*mut ()>,
}

impl<K: KeyType, V: ValueType, const RLX: usize> Handle<'_, K, V, RLX> {
    #[inline]
    fn context(&mut self) -> &mut ThreadContext {
        // SAFETY: the context is exclusively this handle's (handles are
        // !Send/!Sync and each handle() call creates a fresh context), and
        // it lives until the queue drops.
        unsafe { self.ctx.as_mut() }
    }

    /// Insert a key/value pair. Never fails.
    pub fn insert(&mut self, key: K, value: V) {
        let queue: &KLsm<K, V, RLX> = self.queue;
        let shared: &SharedLsm = &queue.shared;
        let ctx: &mut ThreadContext = self.context();

        ctx.dist.insert(
            key.to_ikey(),
            value.to_bits(),
            KLsm::<K, V, RLX>::SPILL_BOUND,
            shared,
            &mut ctx.shared_local,
        );
        ctx.counters.record_insert();
    }

    /// Remove a value whose key is within the relaxation window of the
    /// minimum.
    ///
    /// `None` means the queue was observed empty or a version race was
    /// lost (indistinguishable by design); concurrent callers that know
    /// the queue is non-empty simply retry.
    pub fn delete_min(&mut self) -> Option<V> {
        let queue: &KLsm<K, V, RLX> = self.queue;
        let shared: &SharedLsm = &queue.shared;
        let ctx: &mut ThreadContext = self.context();

        let local_best: Peek = ctx.dist.peek();
        let shared_best: Peek = shared.peek_min(&mut ctx.shared_local);

        let bits: Option<u64> = match (local_best.is_empty(), shared_best.is_empty()) {
            (true, true) => None,
            (false, true) => local_best.take(),
            // Nothing local: let the shared layer run its bounded-retry
            // loop, trimming stale snapshots as it goes.
            (true, false) => shared.delete_min(&mut ctx.shared_local, ctx.retries),
            (false, false) => {
                if local_best.key <= shared_best.key {
                    local_best.take()
                } else {
                    shared_best.take()
                }
            }
        };

        ctx.counters.record_delete(bits.is_some());
        bits.map(V::from_bits)
    }

    /// Observe a key within the relaxation window of the minimum without
    /// removing anything.
    pub fn peek_min(&mut self) -> Option<K> {
        let queue: &KLsm<K, V, RLX> = self.queue;
        let shared: &SharedLsm = &queue.shared;
        let ctx: &mut ThreadContext = self.context();

        let local_best: Peek = ctx.dist.peek();
        let shared_best: Peek = shared.peek_min(&mut ctx.shared_local);

        match (local_best.is_empty(), shared_best.is_empty()) {
            (true, true) => None,
            (false, true) => Some(K::from_ikey(local_best.key)),
            (true, false) => Some(K::from_ikey(shared_best.key)),
            (false, false) => Some(K::from_ikey(local_best.key.min(shared_best.key))),
        }
    }

    /// This thread's own operation counters.
    #[must_use]
    pub fn local_counters(&self) -> OpCounters {
        // SAFETY: shared read of atomic counter cells.
        unsafe { self.ctx.as_ref() }.counters.snapshot()
    }
}

impl<K: KeyType, V: ValueType, const RLX: usize> std::fmt::Debug for Handle<'_, K, V, RLX> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}

// ============================================================================
//  Tests
// ============================================================================
