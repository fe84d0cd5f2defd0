//! Property tests: conservation under drain, and codec ordering.

mod common;

use proptest::collection::vec;
use proptest::prelude::*;

use klsm::{KLsm, KeyType};

proptest! {
    /// Single-threaded conservation: draining returns exactly the
    /// inserted multiset, for several relaxation bounds.
    #[test]
    fn drain_returns_inserted_multiset(keys in vec(any::<u32>(), 0..400)) {
        fn check<const RLX: usize>(keys: &[u32]) {
            let queue: KLsm<u32, u32, RLX> = KLsm::new();
            let mut h = queue.handle();

            for &k in keys {
                h.insert(k, k);
            }

            let mut drained: Vec<u32> = Vec::new();
            while let Some(v) = h.delete_min() {
                drained.push(v);
            }

            let mut expected: Vec<u32> = keys.to_vec();
            expected.sort_unstable();
            drained.sort_unstable();
            assert_eq!(drained, expected);
        }

        check::<0>(&keys);
        check::<4>(&keys);
        check::<256>(&keys);
    }

    /// With zero relaxation the drain is exactly sorted.
    #[test]
    fn strict_drain_is_sorted(keys in vec(any::<u32>(), 0..200)) {
        let queue: KLsm<u32, u32, 0> = KLsm::new();
        let mut h = queue.handle();

        for &k in &keys {
            h.insert(k, k);
        }

        let mut previous: Option<u32> = None;
        while let Some(v) = h.delete_min() {
            if let Some(p) = previous {
                prop_assert!(p <= v, "strict drain went backwards: {p} then {v}");
            }
            previous = Some(v);
        }
    }

    /// Interleaved inserts and deletes conserve items: everything that
    /// goes in comes out exactly once.
    #[test]
    fn interleaved_operations_conserve(ops in vec((any::<u32>(), any::<bool>()), 0..300)) {
        let queue: KLsm<u32, u32, 16> = KLsm::new();
        let mut h = queue.handle();

        let mut inserted: Vec<u32> = Vec::new();
        let mut removed: Vec<u32> = Vec::new();

        for (key, is_insert) in ops {
            if is_insert {
                h.insert(key, key);
                inserted.push(key);
            } else if let Some(v) = h.delete_min() {
                removed.push(v);
            }
        }

        while let Some(v) = h.delete_min() {
            removed.push(v);
        }

        inserted.sort_unstable();
        removed.sort_unstable();
        prop_assert_eq!(removed, inserted);
    }

    /// The signed-key codec preserves order through the unsigned encoding.
    #[test]
    fn signed_codec_preserves_order(a in any::<i64>(), b in any::<i64>()) {
        prop_assert_eq!(a <= b, a.to_ikey() <= b.to_ikey());
        prop_assert_eq!(i64::from_ikey(a.to_ikey()), a);
    }

    /// The restart law: a cleared queue behaves like a fresh one.
    #[test]
    fn clear_restores_fresh_behavior(before in vec(any::<u32>(), 1..100),
                                     after in vec(any::<u32>(), 0..100)) {
        let mut queue: KLsm<u32, u32, 8> = KLsm::new();

        {
            let mut h = queue.handle();
            for &k in &before {
                h.insert(k, k);
            }
            let _ = h.delete_min();
        }

        queue.clear();

        let mut h = queue.handle();
        prop_assert_eq!(h.delete_min(), None);

        for &k in &after {
            h.insert(k, k);
        }

        let mut drained: Vec<u32> = Vec::new();
        while let Some(v) = h.delete_min() {
            drained.push(v);
        }

        let mut expected: Vec<u32> = after;
        expected.sort_unstable();
        drained.sort_unstable();
        prop_assert_eq!(drained, expected);
    }
}
