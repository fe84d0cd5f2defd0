//! # klsm
//!
//! A k-relaxed concurrent priority queue.
//!
//! A successful `delete_min` may return any of the `⌈k/2⌉` smallest keys
//! currently in the queue. Trading exactness for relaxation removes the
//! serial bottleneck of a strict priority queue while staying close enough
//! to priority order for parallel algorithms like SSSP, branch-and-bound,
//! and discrete-event simulation.
//!
//! ## Design
//!
//! The queue is a hybrid of two log-structured merge layers:
//!
//! - Each thread keeps a **distributional LSM**: blocks of strictly
//!   decreasing power-of-two capacity, merged cascade-style on insert.
//! - A **shared LSM** publishes an immutable block array through one atomic
//!   tagged pointer; mutations build a candidate snapshot in thread-local
//!   buffers and install it with a single CAS.
//!
//! When a merged per-thread block outgrows the relaxation bound it spills
//! into the shared layer. `delete_min` takes the smaller of the thread's
//! cached best and the shared layer's minimum, consuming the winner with a
//! version-stamp CAS — the only linearization point an extraction has.
//!
//! ## Memory
//!
//! Items and blocks live in per-thread pools and are recycled, never
//! freed, while the queue exists. Version stamps defeat ABA on recycled
//! cells; there are no hazard pointers and no epoch reclamation.
//!
//! ## Example
//!
//! ```rust
//! use klsm::KLsm;
//!
//! let queue: KLsm<u32, u64, 16> = KLsm::new();
//!
//! std::thread::scope(|s| {
//!     s.spawn(|| {
//!         let mut h = queue.handle();
//!         for k in 0..100u32 {
//!             h.insert(k, u64::from(k));
//!         }
//!     });
//! });
//!
//! let mut h = queue.handle();
//! let first = h.delete_min().expect("queue is non-empty");
//! // Within the first ⌈16/2⌉ keys of the minimum.
//! assert!(first <= 8);
//! ```

pub mod block;
pub mod block_array;
pub mod block_pool;
pub mod counters;
pub mod dist_lsm;
pub mod item;
pub mod item_pool;
pub mod key;
pub mod lazy_block;
pub mod ordering;
pub mod queue;
pub mod shared_lsm;

mod tracing_helpers;

pub use counters::OpCounters;
pub use key::{KeyType, ValueType};
pub use queue::{Handle, KLsm};
