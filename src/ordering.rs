//! Standard memory orderings for shared queue state.
//!
//! These constants keep ordering usage consistent across the codebase and
//! make the pairing explicit at each access point.

use std::sync::atomic::Ordering;

/// Ordering for loads that dereference shared data (item fields, block
/// slots, the published array pointer). Pairs with the writer's Release
/// stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for stores that publish data to other threads (item
/// initialization, block slot writes, candidate-array slots). Pairs with
/// the reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success (item take, global array publish).
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure. Only needs to observe the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for owner-private cursors and counters that do not gate a
/// dereference (`last` bumps by the owning thread, statistics).
pub const RELAXED: Ordering = Ordering::Relaxed;
