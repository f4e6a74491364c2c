//! Preemptive-update algebra (§4.5): composing a sequence of
//! [`ListUpdate`]s into one cumulative patch, and inverting one so its
//! effect can be undone.
//!
//! Operating on storeKey identity (see [`super::update`]'s header) turns
//! composition into set algebra instead of index bookkeeping: a storeKey
//! added by an earlier update and removed by a later one cancels out of
//! both `removed` and `added` entirely, exactly as if neither update had
//! mentioned it. `invert` swaps the two sides, so composing an update with
//! its own inversion always cancels back to a no-op on every storeKey the
//! original update touched, and -- given the pre-update list -- restores
//! reinserted entries to their original positions.

use std::collections::HashSet;

use super::update::ListUpdate;

/// The cumulative effect of applying `earlier` then `later`, expressed as
/// one [`ListUpdate`] relative to the state before `earlier`.
#[must_use]
pub fn compose(earlier: &ListUpdate, later: &ListUpdate) -> ListUpdate {
    let earlier_added: HashSet<_> = earlier.added.iter().map(|(_, sk)| *sk).collect();
    let later_removed: HashSet<_> = later.removed.iter().copied().collect();

    let mut removed = earlier.removed.clone();
    for sk in &later.removed {
        if !earlier_added.contains(sk) {
            removed.push(*sk);
        }
    }

    let mut added: Vec<_> = earlier.added.iter().filter(|(_, sk)| !later_removed.contains(sk)).copied().collect();
    added.extend(later.added.iter().copied());

    ListUpdate {
        removed,
        added,
        truncate_at_first_gap: earlier.truncate_at_first_gap || later.truncate_at_first_gap,
        total: later.total.or(earlier.total),
        up_to: later.up_to.or(earlier.up_to),
    }
}

/// The inverse of `update`: what was added is now removed, and what was
/// removed is now (re-)added, at the position it held in `original` (the
/// list as it stood before `update` ran). `update` alone doesn't carry
/// enough information to recover those positions -- a storeKey it removed
/// is gone from the list by the time we'd need to ask it where it was --
/// so the caller passes the pre-update snapshot to look them up in. Any
/// removed storeKey `original` doesn't contain (it never had a snapshot,
/// or this is an algebra test with no concrete list) falls back to its
/// position among the other reinstated entries (0, 1, 2, ...).
#[must_use]
pub fn invert(update: &ListUpdate, original: &[Option<StoreKey>]) -> ListUpdate {
    ListUpdate {
        removed: update.added.iter().map(|(_, sk)| *sk).collect(),
        added: update
            .removed
            .iter()
            .enumerate()
            .map(|(fallback, sk)| {
                let index = original.iter().position(|slot| *slot == Some(*sk)).unwrap_or(fallback);
                (index, *sk)
            })
            .collect(),
        truncate_at_first_gap: false,
        total: None,
        up_to: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StoreKey;
    use std::collections::HashSet;

    fn sk(n: u64) -> StoreKey {
        StoreKey::from_raw(n)
    }

    #[test]
    fn compose_cancels_an_add_then_remove_of_the_same_key() {
        let earlier = ListUpdate { added: vec![(0, sk(1))], ..Default::default() };
        let later = ListUpdate { removed: vec![sk(1)], ..Default::default() };
        let composed = compose(&earlier, &later);
        assert!(composed.removed.is_empty());
        assert!(composed.added.is_empty());
    }

    #[test]
    fn compose_accumulates_disjoint_edits() {
        let earlier = ListUpdate { removed: vec![sk(1)], ..Default::default() };
        let later = ListUpdate { added: vec![(0, sk(2))], ..Default::default() };
        let composed = compose(&earlier, &later);
        assert_eq!(composed.removed, vec![sk(1)]);
        assert_eq!(composed.added, vec![(0, sk(2))]);
    }

    #[test]
    fn invert_reinserts_at_the_position_held_in_the_original_list() {
        let original = vec![Some(sk(1)), Some(sk(2)), Some(sk(3))];
        let update = ListUpdate { removed: vec![sk(2)], ..Default::default() };
        let undo = invert(&update, &original);
        assert_eq!(undo.added, vec![(1, sk(2))]);
    }

    #[test]
    fn compose_then_invert_round_trips_on_disjoint_edits() {
        let update = ListUpdate { removed: vec![sk(1), sk(2)], added: vec![(0, sk(3)), (1, sk(4))], ..Default::default() };
        let cancelled = compose(&update, &invert(&update, &[]));
        let net_removed: HashSet<_> = cancelled.removed.iter().copied().collect();
        let net_added: HashSet<_> = cancelled.added.iter().map(|(_, sk)| *sk).collect();
        // Every storeKey the round trip still mentions is mentioned on both
        // sides -- applying the composed update is a net no-op.
        assert_eq!(net_removed, net_added);
        assert!(!net_removed.is_empty());
    }

    proptest::proptest! {
        /// For any update built from disjoint removed/added storeKey sets,
        /// composing it with its own inversion always nets out to "every
        /// storeKey mentioned once on each side" -- applying the composed
        /// result is a no-op regardless of which keys were chosen.
        #[test]
        fn compose_with_invert_is_always_a_net_no_op(
            removed_ids in proptest::collection::hash_set(0u64..50, 0..6),
            added_ids in proptest::collection::hash_set(50u64..100, 0..6),
        ) {
            let removed: Vec<StoreKey> = removed_ids.into_iter().map(sk).collect();
            let added: Vec<(usize, StoreKey)> = added_ids.into_iter().enumerate().map(|(i, n)| (i, sk(n))).collect();
            let update = ListUpdate { removed, added, ..Default::default() };

            let cancelled = compose(&update, &invert(&update, &[]));
            let net_removed: HashSet<_> = cancelled.removed.iter().copied().collect();
            let net_added: HashSet<_> = cancelled.added.iter().map(|(_, sk)| *sk).collect();
            proptest::prop_assert_eq!(net_removed, net_added);
        }
    }
}
