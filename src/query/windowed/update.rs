//! The ordered-list patch shape shared by server deltas
//! (`sourceDidFetchUpdate`) and client-originated edits
//! (`clientDidGenerateUpdate`), plus the apply-update algorithm (§4.5).
//!
//! A [`ListUpdate`] is addressed by storeKey identity rather than raw
//! position, unlike the spec's index-keyed wire shape -- storeKeys are
//! already the stable identity every other part of this crate indexes by,
//! and resolving positions at apply time (instead of carrying them through
//! every composition) sidesteps a whole class of off-by-one bugs that
//! position-relative composition invites. `added` still carries an index
//! *hint* for where a brand-new entry should land; `removed` does not need
//! one since the storeKey alone identifies the slot to drop.

use crate::ids::StoreKey;

/// A resolved patch to an ordered list of storeKeys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListUpdate {
    pub removed: Vec<StoreKey>,
    /// `(index hint, storeKey)`, ascending by index.
    pub added: Vec<(usize, StoreKey)>,
    /// Truncate the list at the first still-unresolved (sparse) slot after
    /// applying removals/insertions -- the server is telling us it cannot
    /// vouch for contiguity past that point.
    pub truncate_at_first_gap: bool,
    pub total: Option<usize>,
    /// Truncate to just after this storeKey's position (or reset entirely
    /// if it is not present) before anything else is applied.
    pub up_to: Option<StoreKey>,
}

impl ListUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && self.up_to.is_none() && !self.truncate_at_first_gap
    }
}

/// Result of [`apply`]: the lowest index touched (for change notification)
/// and the list's new length.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOutcome {
    pub first_change: Option<usize>,
    pub new_len: usize,
}

/// Applies `update` to `list` in place (§4.5's six-step algorithm,
/// collapsed into storeKey-identity terms):
/// 1. `up_to` truncation/reset.
/// 2. High-to-low removal (so earlier removals don't shift later indexes).
/// 3. `truncate_at_first_gap`.
/// 4. Indexed insertion, padding with `None` if an index hint lands past
///    the current end (sparse array).
pub fn apply(list: &mut Vec<Option<StoreKey>>, update: &ListUpdate) -> ApplyOutcome {
    let mut first_change: Option<usize> = None;
    let mut touch = |index: usize| {
        first_change = Some(first_change.map_or(index, |f| f.min(index)));
    };

    if let Some(anchor) = update.up_to {
        match list.iter().position(|slot| *slot == Some(anchor)) {
            Some(pos) => {
                if pos + 1 < list.len() {
                    touch(pos + 1);
                    list.truncate(pos + 1);
                }
            }
            None => {
                if !list.is_empty() {
                    touch(0);
                }
                list.clear();
            }
        }
    }

    for sk in &update.removed {
        if let Some(pos) = list.iter().position(|slot| *slot == Some(*sk)) {
            touch(pos);
            list.remove(pos);
        }
    }

    if update.truncate_at_first_gap {
        if let Some(gap) = list.iter().position(Option::is_none) {
            touch(gap);
            list.truncate(gap);
        }
    }

    let mut added = update.added.clone();
    added.sort_by_key(|(index, _)| *index);
    for (index, sk) in added {
        if index > list.len() {
            list.resize(index, None);
        }
        touch(index);
        list.insert(index, Some(sk));
    }

    ApplyOutcome { first_change, new_len: list.len() }
}
