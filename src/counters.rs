//! Operation counters.
//!
//! Each thread context counts its own operations on relaxed atomics; the
//! queue aggregates them through the context registry. [`OpCounters`] is
//! additive, so harnesses can also difference two aggregates to measure a
//! window.

use std::ops::{Add, AddAssign};
use std::sync::atomic::AtomicU64;

use crate::ordering::RELAXED;

/// An additive summary of queue operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpCounters {
    /// Completed inserts.
    pub inserts: u64,

    /// `delete_min` calls that returned a value.
    pub successful_deletes: u64,

    /// `delete_min` calls that returned nothing — the queue looked empty
    /// or a version race was lost.
    pub failed_deletes: u64,
}

impl OpCounters {
    /// Inserts minus successful deletes: the net number of items this
    /// summary says should still be in the queue.
    #[must_use]
    pub const fn residual(&self) -> u64 {
        self.inserts.saturating_sub(self.successful_deletes)
    }
}

impl Add for OpCounters {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            inserts: self.inserts + rhs.inserts,
            successful_deletes: self.successful_deletes + rhs.successful_deletes,
            failed_deletes: self.failed_deletes + rhs.failed_deletes,
        }
    }
}

impl AddAssign for OpCounters {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Per-thread counter cells. Written by the owning thread with relaxed
/// stores, read by any thread through [`ThreadCounters::snapshot`].
#[derive(Debug, Default)]
pub(crate) struct ThreadCounters {
    inserts: AtomicU64,
    successful_deletes: AtomicU64,
    failed_deletes: AtomicU64,
}

impl ThreadCounters {
    pub(crate) fn record_insert(&self) {
        self.inserts.fetch_add(1, RELAXED);
    }

    pub(crate) fn record_delete(&self, success: bool) {
        if success {
            self.successful_deletes.fetch_add(1, RELAXED);
        } else {
            self.failed_deletes.fetch_add(1, RELAXED);
        }
    }

    pub(crate) fn snapshot(&self) -> OpCounters {
        OpCounters {
            inserts: self.inserts.load(RELAXED),
            successful_deletes: self.successful_deletes.load(RELAXED),
            failed_deletes: self.failed_deletes.load(RELAXED),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_additive() {
        let a = OpCounters {
            inserts: 10,
            successful_deletes: 4,
            failed_deletes: 1,
        };
        let b = OpCounters {
            inserts: 5,
            successful_deletes: 5,
            failed_deletes: 0,
        };

        let sum: OpCounters = a + b;
        assert_eq!(sum.inserts, 15);
        assert_eq!(sum.successful_deletes, 9);
        assert_eq!(sum.failed_deletes, 1);
        assert_eq!(sum.residual(), 6);
    }

    #[test]
    fn test_thread_counters_snapshot() {
        let tc = ThreadCounters::default();
        tc.record_insert();
        tc.record_insert();
        tc.record_delete(true);
        tc.record_delete(false);

        let snap: OpCounters = tc.snapshot();
        assert_eq!(snap.inserts, 2);
        assert_eq!(snap.successful_deletes, 1);
        assert_eq!(snap.failed_deletes, 1);
    }
}
